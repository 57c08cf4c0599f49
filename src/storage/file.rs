use super::{Collection, DocumentStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    id: Uuid,
    created_at: DateTime<Utc>,
    body: Value,
}

/// One pretty-printed JSON file per document under `<root>/<collection>/<id>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn document_path(&self, collection: Collection, id: Uuid) -> PathBuf {
        self.collection_dir(collection).join(format!("{}.json", id))
    }

    async fn read_document(path: &Path) -> Result<StoredDocument, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn put(
        &self,
        collection: Collection,
        id: Uuid,
        created_at: DateTime<Utc>,
        body: &Value,
    ) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        tokio::fs::create_dir_all(&dir).await?;

        let doc = StoredDocument {
            id,
            created_at,
            body: body.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        // Write then rename so readers never see a partial document.
        let path = self.document_path(collection, id);
        let tmp = dir.join(format!(".{}.tmp", id));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Stored document: {}", path.display());
        Ok(())
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<Value>, StoreError> {
        let path = self.document_path(collection, id);
        match Self::read_document(&path).await {
            Ok(doc) => Ok(Some(doc.body)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn recent(&self, collection: Collection, limit: usize) -> Result<Vec<Value>, StoreError> {
        let dir = self.collection_dir(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(doc) => docs.push(doc),
                Err(e) => tracing::warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }

        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs.into_iter().take(limit).map(|doc| doc.body).collect())
    }
}
