pub mod file;
pub mod postgres;

pub use file::FileStore;
pub use postgres::PgStore;

use crate::orchestrator::types::{BacktestResults, DataQuality};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Most recent documents returned by list endpoints.
pub const LIST_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Uploads,
    Backtests,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Uploads => "uploads",
            Collection::Backtests => "backtests",
        }
    }
}

/// Schemaless JSON documents keyed by id within a collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put(
        &self,
        collection: Collection,
        id: Uuid,
        created_at: DateTime<Utc>,
        body: &Value,
    ) -> Result<(), StoreError>;

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<Value>, StoreError>;

    /// Newest first.
    async fn recent(&self, collection: Collection, limit: usize) -> Result<Vec<Value>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileLocation {
    /// Stored under the data directory.
    Local { path: PathBuf },
    /// Held by the remote backtest service or another file host.
    Remote {
        url: String,
        #[serde(default)]
        public_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub filename: String,
    pub location: FileLocation,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub rows: Option<usize>,
    #[serde(default)]
    pub quality: Option<DataQuality>,
    #[serde(default)]
    pub parameters: Option<Value>,
    pub uploaded_at: DateTime<Utc>,
    pub status: String,
}

impl UploadRecord {
    pub fn file_url(&self) -> Option<&str> {
        match &self.location {
            FileLocation::Remote { url, .. } => Some(url),
            FileLocation::Local { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub id: Uuid,
    #[serde(default)]
    pub file_id: Option<Uuid>,
    #[serde(default)]
    pub file_url: Option<String>,
    pub parameters: Value,
    pub results: BacktestResults,
    /// Runner that produced the results, or `client` for saved results.
    pub runner: String,
    pub created_at: DateTime<Utc>,
}

/// Typed access to the upload and backtest collections.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DocumentStore>,
}

impl Repository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    pub async fn insert_upload(&self, record: &UploadRecord) -> Result<(), StoreError> {
        self.put(Collection::Uploads, record.id, record.uploaded_at, record)
            .await
    }

    pub async fn get_upload(&self, id: Uuid) -> Result<Option<UploadRecord>, StoreError> {
        self.get(Collection::Uploads, id).await
    }

    pub async fn list_uploads(&self) -> Result<Vec<UploadRecord>, StoreError> {
        self.recent(Collection::Uploads).await
    }

    pub async fn insert_backtest(&self, record: &BacktestRecord) -> Result<(), StoreError> {
        self.put(Collection::Backtests, record.id, record.created_at, record)
            .await
    }

    pub async fn get_backtest(&self, id: Uuid) -> Result<Option<BacktestRecord>, StoreError> {
        self.get(Collection::Backtests, id).await
    }

    pub async fn list_backtests(&self) -> Result<Vec<BacktestRecord>, StoreError> {
        self.recent(Collection::Backtests).await
    }

    async fn put<T: Serialize>(
        &self,
        collection: Collection,
        id: Uuid,
        created_at: DateTime<Utc>,
        record: &T,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(record)?;
        self.store.put(collection, id, created_at, &body).await?;
        tracing::debug!("Stored {} document {}", collection.as_str(), id);
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<T>, StoreError> {
        match self.store.get(collection, id).await? {
            Some(body) => Ok(Some(serde_json::from_value(body)?)),
            None => Ok(None),
        }
    }

    /// Documents that no longer match the record shape are skipped.
    async fn recent<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError> {
        let docs = self.store.recent(collection, LIST_LIMIT).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping malformed {} document: {}", collection.as_str(), e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_location_tagging() {
        let local = FileLocation::Local {
            path: PathBuf::from("/data/uploads/a.csv"),
        };
        assert_eq!(
            serde_json::to_value(&local).unwrap(),
            serde_json::json!({ "kind": "local", "path": "/data/uploads/a.csv" })
        );

        let remote: FileLocation =
            serde_json::from_value(serde_json::json!({ "kind": "remote", "url": "https://x/y.csv" }))
                .unwrap();
        assert_eq!(
            remote,
            FileLocation::Remote {
                url: "https://x/y.csv".to_string(),
                public_id: None
            }
        );
    }
}
