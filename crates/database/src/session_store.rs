//! Session State Store (spec §4.2).
//!
//! A per-`session_id` single-writer KV with transactional
//! read-modify-write semantics. Mutators for the same session are
//! serialized through an in-process lock table; mutators for different
//! sessions proceed in parallel (spec §5: "single logical writer per
//! session, parallel across sessions").

use async_trait::async_trait;
use dashmap::DashMap;
use domain::migration::{self, MigrationError};
use domain::model::{SessionDocument, CURRENT_SCHEMA_VERSION};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_postgres::types::Json;
use tracing::{debug, error, warn};

use crate::pool::DbPool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} is quarantined (corrupt)")]
    Corrupt(String),
    #[error("schema migration failed for session {0}: {1}")]
    Migration(String, MigrationError),
    #[error("update callback rejected the mutation: {0}")]
    Rejected(String),
}

/// Closure type for [`SessionStoreTrait::update`]. Boxed so the trait
/// stays object-safe (`Arc<dyn SessionStoreTrait>` is how every component
/// holds it).
pub type UpdateFn = Box<dyn FnOnce(&mut SessionDocument) -> Result<(), String> + Send>;

#[async_trait]
pub trait SessionStoreTrait: Send + Sync {
    /// Load a session, creating it (schema-version-stamped, empty) if it
    /// does not exist yet.
    async fn get_or_create(&self, session_id: &str) -> Result<SessionDocument, StoreError>;

    /// Load a session if it exists, without creating one.
    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError>;

    /// Apply `f` to the session's document under the per-session write
    /// lock and persist the result transactionally.
    async fn update(
        &self,
        session_id: &str,
        f: UpdateFn,
    ) -> Result<SessionDocument, StoreError>;

    /// Mark a session as corrupt; subsequent reads return
    /// [`StoreError::Corrupt`].
    async fn quarantine(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Postgres-backed implementation.
pub struct PgSessionStore {
    pool: DbPool,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl PgSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn migrate_row(
        session_id: &str,
        schema_version: i32,
        document: serde_json::Value,
    ) -> Result<SessionDocument, StoreError> {
        let migrated = migration::migrate(document, schema_version as u32)
            .map_err(|e| StoreError::Migration(session_id.to_string(), e))?;
        serde_json::from_value(migrated).map_err(|e| {
            StoreError::Unavailable(format!("failed to deserialize session document: {e}"))
        })
    }
}

#[async_trait]
impl SessionStoreTrait for PgSessionStore {
    async fn get_or_create(&self, session_id: &str) -> Result<SessionDocument, StoreError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = client
            .query_opt(
                "SELECT schema_version, document, corrupt FROM sessions WHERE session_id = $1",
                &[&session_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(row) = row {
            let corrupt: bool = row.get("corrupt");
            if corrupt {
                return Err(StoreError::Corrupt(session_id.to_string()));
            }
            let schema_version: i32 = row.get("schema_version");
            let document: serde_json::Value = row.get("document");
            return Self::migrate_row(session_id, schema_version, document);
        }

        let fresh = SessionDocument::new(session_id);
        let doc_json = serde_json::to_value(&fresh)
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize session: {e}")))?;
        client
            .execute(
                "INSERT INTO sessions (session_id, schema_version, document)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (session_id) DO NOTHING",
                &[&session_id, &(CURRENT_SCHEMA_VERSION as i32), &Json(&doc_json)],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!(session_id, "created new session document");
        Ok(fresh)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = client
            .query_opt(
                "SELECT schema_version, document, corrupt FROM sessions WHERE session_id = $1",
                &[&session_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let corrupt: bool = row.get("corrupt");
                if corrupt {
                    return Err(StoreError::Corrupt(session_id.to_string()));
                }
                let schema_version: i32 = row.get("schema_version");
                let document: serde_json::Value = row.get("document");
                Self::migrate_row(session_id, schema_version, document).map(Some)
            }
        }
    }

    async fn update(
        &self,
        session_id: &str,
        f: UpdateFn,
    ) -> Result<SessionDocument, StoreError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let txn = client
            .transaction()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = txn
            .query_opt(
                "SELECT schema_version, document, corrupt FROM sessions
                 WHERE session_id = $1 FOR UPDATE",
                &[&session_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut doc = match row {
            Some(row) => {
                let corrupt: bool = row.get("corrupt");
                if corrupt {
                    return Err(StoreError::Corrupt(session_id.to_string()));
                }
                let schema_version: i32 = row.get("schema_version");
                let document: serde_json::Value = row.get("document");
                Self::migrate_row(session_id, schema_version, document)?
            }
            None => SessionDocument::new(session_id),
        };

        f(&mut doc).map_err(StoreError::Rejected)?;

        let doc_json = serde_json::to_value(&doc)
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize session: {e}")))?;

        txn.execute(
            "INSERT INTO sessions (session_id, schema_version, document, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (session_id) DO UPDATE
             SET schema_version = EXCLUDED.schema_version,
                 document = EXCLUDED.document,
                 updated_at = now()",
            &[&session_id, &(CURRENT_SCHEMA_VERSION as i32), &Json(&doc_json)],
        )
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        txn.commit()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(doc)
    }

    async fn quarantine(&self, session_id: &str) -> Result<(), StoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        client
            .execute(
                "UPDATE sessions SET corrupt = TRUE WHERE session_id = $1",
                &[&session_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        warn!(session_id, "session quarantined as corrupt");
        Ok(())
    }
}

/// In-memory implementation used by service-level unit tests and by the
/// `tests` binary harness; same single-writer discipline via per-session
/// async mutexes, no Postgres dependency.
#[derive(Default)]
pub struct InMemorySessionStore {
    docs: DashMap<String, SessionDocument>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    corrupt: DashMap<String, bool>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl SessionStoreTrait for InMemorySessionStore {
    async fn get_or_create(&self, session_id: &str) -> Result<SessionDocument, StoreError> {
        if self.corrupt.get(session_id).map(|v| *v).unwrap_or(false) {
            return Err(StoreError::Corrupt(session_id.to_string()));
        }
        if let Some(doc) = self.docs.get(session_id) {
            return Ok(doc.clone());
        }
        let fresh = SessionDocument::new(session_id);
        self.docs.insert(session_id.to_string(), fresh.clone());
        Ok(fresh)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        if self.corrupt.get(session_id).map(|v| *v).unwrap_or(false) {
            return Err(StoreError::Corrupt(session_id.to_string()));
        }
        Ok(self.docs.get(session_id).map(|d| d.clone()))
    }

    async fn update(
        &self,
        session_id: &str,
        f: UpdateFn,
    ) -> Result<SessionDocument, StoreError> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if self.corrupt.get(session_id).map(|v| *v).unwrap_or(false) {
            return Err(StoreError::Corrupt(session_id.to_string()));
        }

        let mut doc = self
            .docs
            .get(session_id)
            .map(|d| d.clone())
            .unwrap_or_else(|| SessionDocument::new(session_id));

        f(&mut doc).map_err(StoreError::Rejected)?;
        self.docs.insert(session_id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn quarantine(&self, session_id: &str) -> Result<(), StoreError> {
        self.corrupt.insert(session_id.to_string(), true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::model::EventPayload;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = InMemorySessionStore::new();
        let first = store.get_or_create("s1").await.unwrap();
        let second = store.get_or_create("s1").await.unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn update_persists_mutation() {
        let store = InMemorySessionStore::new();
        store
            .update(
                "s1",
                Box::new(|doc| {
                    doc.push_event(
                        0,
                        EventPayload::Error {
                            code: "x".to_string(),
                            message: "y".to_string(),
                        },
                    );
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let doc = store.get("s1").await.unwrap().expect("session exists");
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].seq, 1);
    }

    #[tokio::test]
    async fn quarantined_session_reads_fail() {
        let store = InMemorySessionStore::new();
        store.get_or_create("s1").await.unwrap();
        store.quarantine("s1").await.unwrap();
        let err = store.get("s1").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn concurrent_updates_to_same_session_serialize() {
        use std::sync::Arc as StdArc;
        let store = StdArc::new(InMemorySessionStore::new());
        store.get_or_create("s1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        "s1",
                        Box::new(|doc| {
                            doc.push_event(
                                0,
                                EventPayload::Error {
                                    code: "x".to_string(),
                                    message: "y".to_string(),
                                },
                            );
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let doc = store.get("s1").await.unwrap().unwrap();
        assert_eq!(doc.events.len(), 20);
        // P3: seq is strictly increasing and dense.
        for (i, event) in doc.events.iter().enumerate() {
            assert_eq!(event.seq, (i + 1) as u64);
        }
    }
}
