use super::{Collection, DocumentStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id UUID PRIMARY KEY,
    collection TEXT NOT NULL,
    body JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
)
"#;

const INDEX: &str =
    "CREATE INDEX IF NOT EXISTS documents_collection_created_at ON documents (collection, created_at DESC)";

/// JSONB documents in a single Postgres table.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn put(
        &self,
        collection: Collection,
        id: Uuid,
        created_at: DateTime<Utc>,
        body: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (id, collection, body, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body",
        )
        .bind(id)
        .bind(collection.as_str())
        .bind(body)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get::<Value, _>("body")).transpose()?)
    }

    async fn recent(&self, collection: Collection, limit: usize) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM documents WHERE collection = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(collection.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<Value, _>("body").map_err(StoreError::from))
            .collect()
    }
}
