use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use voyage_core::context::ExecutionContext;
use voyage_core::error::{Result, VoyageError};
use voyage_core::traits::ContextStore;
use voyage_core::types::RunId;

use super::check_revision;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        graph TEXT NOT NULL,
        status TEXT NOT NULL,
        current_node TEXT NOT NULL,
        revision INTEGER NOT NULL,
        snapshot_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_created
        ON runs(created_at DESC);";

/// Persistent context store backed by SQLite.
///
/// Each run is one row holding the full JSON snapshot plus a few columns
/// for listing. The revision check and the write share one transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the run database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VoyageError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| VoyageError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| VoyageError::Database(format!("Failed to initialize run schema: {}", e)))?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| VoyageError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_sync(&self, run_id: &RunId) -> Result<ExecutionContext> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| VoyageError::Database(e.to_string()))?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(VoyageError::NotFound(run_id.clone())),
        }
    }

    fn save_sync(&self, ctx: &ExecutionContext) -> Result<()> {
        let snapshot = serde_json::to_string(ctx)?;
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| VoyageError::Database(e.to_string()))?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT revision FROM runs WHERE run_id = ?1",
                params![ctx.run_id().as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        check_revision(ctx.run_id(), stored.map(|r| r as u64), ctx.revision())?;

        tx.execute(
            "INSERT INTO runs (run_id, graph, status, current_node, revision, snapshot_json,
                               created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 current_node = excluded.current_node,
                 revision = excluded.revision,
                 snapshot_json = excluded.snapshot_json,
                 updated_at = excluded.updated_at",
            params![
                ctx.run_id().as_str(),
                ctx.graph(),
                ctx.status().as_str(),
                ctx.current_node(),
                ctx.revision() as i64,
                snapshot,
                ctx.created_at().to_rfc3339(),
                ctx.updated_at().to_rfc3339(),
            ],
        )
        .map_err(|e| VoyageError::Database(format!("Failed to save run: {}", e)))?;

        tx.commit()
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        Ok(())
    }

    fn list_sync(&self) -> Result<Vec<ExecutionContext>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VoyageError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT snapshot_json FROM runs ORDER BY created_at DESC")
            .map_err(|e| VoyageError::Database(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| VoyageError::Database(e.to_string()))?;

        let mut runs = Vec::new();
        for row in rows {
            let json = row.map_err(|e| VoyageError::Database(e.to_string()))?;
            runs.push(serde_json::from_str(&json)?);
        }
        Ok(runs)
    }
}

impl ContextStore for SqliteStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<ExecutionContext>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.load_sync(&run_id) })
    }

    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>> {
        let ctx = ctx.clone();
        Box::pin(async move { self.save_sync(&ctx) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionContext>>> {
        Box::pin(async move { self.list_sync() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use voyage_core::types::{HistoryEntry, HistoryOutcome, RunStatus};

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("runs.db")).unwrap();
        (dir, store)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("booking", "search", json!({"origin": "SFO"}))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_dir, store) = temp_store();
        let c = ctx()
            .with_status(RunStatus::Running)
            .unwrap()
            .with_update("search", 1, "flight", json!({"flight_number": "AA123"}))
            .unwrap()
            .with_history(HistoryEntry::new(
                "search",
                1,
                HistoryOutcome::Advanced { to: "select".into() },
            ))
            .unwrap()
            .committed();
        store.save(&c).await.unwrap();

        let loaded = store.load(c.run_id()).await.unwrap();
        assert_eq!(loaded, c);
        assert_eq!(loaded.slot("flight").unwrap()["flight_number"], "AA123");
    }

    #[tokio::test]
    async fn test_save_overwrites_same_run() {
        let (_dir, store) = temp_store();
        let first = ctx().committed();
        store.save(&first).await.unwrap();

        let second = first.with_current("select").unwrap().committed();
        store.save(&second).await.unwrap();

        let loaded = store.load(first.run_id()).await.unwrap();
        assert_eq!(loaded.revision(), 2);
        assert_eq!(loaded.current_node(), "select");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_writer_rejected() {
        let (_dir, store) = temp_store();
        let first = ctx().committed();
        store.save(&first).await.unwrap();
        store.save(&first.committed()).await.unwrap();

        // a second writer still holding revision 1
        let stale = first.with_current("pay").unwrap().committed();
        let err = store.save(&stale).await.unwrap_err();
        assert!(matches!(err, VoyageError::PersistenceConflict { .. }));

        let loaded = store.load(first.run_id()).await.unwrap();
        assert_eq!(loaded.current_node(), "search");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.load(&RunId::from_str("missing")).await.unwrap_err();
        assert!(matches!(err, VoyageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let c = ctx().committed();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&c).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load(c.run_id()).await.unwrap(), c);
    }
}
