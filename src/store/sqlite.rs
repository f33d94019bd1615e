//! SQLite-backed document store.
//!
//! Durable [`DocumentStore`] implementation over a single `documents` table:
//!
//! ```text
//! documents(collection TEXT, id TEXT, body TEXT (JSON), updated_at TEXT,
//!           PRIMARY KEY (collection, id))
//! ```
//!
//! Filtering happens in-process after fetching a collection (the store is
//! a document contract, not a query engine) and `compare_and_set` runs
//! inside an immediate transaction so concurrent deployers/allocators
//! serialize on the row.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{DocumentStore, Filter, Result, StoreError, partial_matches};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// Durable [`DocumentStore`] over a SQLite database.
pub struct SqliteDocumentStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish()
    }
}

impl SqliteDocumentStore {
    /// Connect (or create) a SQLite database at `database_url` and ensure
    /// the schema exists. Example URL: `sqlite://nexus.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn parse_body(collection: &str, id: &str, body: &str) -> Result<Value> {
        serde_json::from_str(body).map_err(|e| StoreError::Backend {
            message: format!("corrupt document {collection}/{id}: {e}"),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(Self::parse_body(collection, id, &body)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT (collection, id)
            DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(doc.to_string())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let body: String = row.get("body");
        let mut doc = Self::parse_body(collection, id, &body)?;
        match (doc.as_object_mut(), patch.as_object()) {
            (Some(target), Some(fields)) => {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            _ => doc = patch,
        }
        sqlx::query(
            "UPDATE documents SET body = ?, updated_at = datetime('now') \
             WHERE collection = ? AND id = ?",
        )
        .bind(doc.to_string())
        .bind(collection)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>> {
        let rows =
            sqlx::query("SELECT id, body FROM documents WHERE collection = ? ORDER BY id ASC")
                .bind(collection)
                .fetch_all(self.pool.as_ref())
                .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let body: String = row.get("body");
            let doc = Self::parse_body(collection, &id, &body)?;
            if filters.iter().all(|f| f.matches(&doc)) {
                out.push((id, doc));
            }
        }
        Ok(out)
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let matched = match (expected, &row) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => false,
            (Some(exp), Some(row)) => {
                let body: String = row.get("body");
                let doc = Self::parse_body(collection, id, &body)?;
                partial_matches(exp, &doc)
            }
        };

        if matched {
            sqlx::query(
                r#"
                INSERT INTO documents (collection, id, body, updated_at)
                VALUES (?, ?, ?, datetime('now'))
                ON CONFLICT (collection, id)
                DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(new.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SqliteDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nexus-test.db", dir.path().display());
        let store = SqliteDocumentStore::connect(&url).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip_and_update() {
        let (_dir, store) = temp_store().await;
        store
            .set("pipelines", "2026-01-22/state", json!({"status": "pending"}))
            .await
            .unwrap();
        store
            .update("pipelines", "2026-01-22/state", json!({"status": "running"}))
            .await
            .unwrap();
        let doc = store
            .get("pipelines", "2026-01-22/state")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["status"], "running");
    }

    #[tokio::test]
    async fn query_respects_filters_and_order() {
        let (_dir, store) = temp_store().await;
        for (id, used) in [("b2", false), ("b1", false), ("b3", true)] {
            store
                .set("buffer-videos", id, json!({"used": used}))
                .await
                .unwrap();
        }
        let rows = store
            .query("buffer-videos", &[Filter::eq("used", false)])
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn cas_serializes_contenders() {
        let (_dir, store) = temp_store().await;
        store
            .set("buffer-videos", "b1", json!({"used": false}))
            .await
            .unwrap();
        assert!(
            store
                .compare_and_set(
                    "buffer-videos",
                    "b1",
                    Some(&json!({"used": false})),
                    json!({"used": true}),
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set(
                    "buffer-videos",
                    "b1",
                    Some(&json!({"used": false})),
                    json!({"used": true}),
                )
                .await
                .unwrap()
        );
    }
}
