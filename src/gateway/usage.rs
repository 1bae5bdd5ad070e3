//! Double-entry usage journal: one row per request, one row per provider
//! attempt. Writes are synchronous from the orchestrator's point of view
//! but never abort a request; a failed journal write degrades
//! observability, not liveness.

use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;
use thiserror::Error;

use super::costing;

/// Request-level journal entry. `request_id` is the natural key; repeat
/// writes for the same id overwrite every non-key column, so the skeleton
/// written at ingress and the final write on success converge on the final
/// state.
#[derive(Clone, Debug, Default)]
pub struct UsageRecord {
    pub request_id: String,
    pub tenant: String,
    pub use_case: String,
    pub route_name: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: String,
}

/// One provider attempt. Insert-only; attempt numbers form a contiguous
/// 1-indexed prefix within a request.
#[derive(Clone, Debug, Default)]
pub struct AttemptRecord {
    pub attempt_no: u32,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: String,
}

/// Persisted request row, as read back.
#[derive(Clone, Debug)]
pub struct RequestRow {
    pub id: String,
    pub request_id: String,
    pub tenant: String,
    pub use_case: String,
    pub route_name: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_estimate_usd: f64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: String,
}

/// Persisted attempt row, as read back.
#[derive(Clone, Debug)]
pub struct AttemptRow {
    pub attempt_no: u32,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: String,
}

#[derive(Debug, Error)]
pub enum UsageStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Clone, Debug)]
pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), UsageStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UsageStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Upsert by `request_id`. The cost estimate is derived here from the
    /// recorded model and token counts, so every write keeps invariant
    /// cost = round(prompt/1e6 * in + completion/1e6 * out, 6).
    pub async fn log(&self, record: UsageRecord) -> Result<(), UsageStoreError> {
        let path = self.path.clone();
        let cost = costing::estimate_cost(
            &record.model,
            record.prompt_tokens,
            record.completion_tokens,
        );
        let surrogate_id = uuid::Uuid::new_v4().to_string();

        tokio::task::spawn_blocking(move || -> Result<(), UsageStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO requests (
                     id, request_id, tenant, use_case, route_name, provider, model,
                     prompt_tokens, completion_tokens, total_tokens,
                     cost_estimate_usd, latency_ms, status_code, error_message
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (request_id) DO UPDATE SET
                     tenant = excluded.tenant,
                     use_case = excluded.use_case,
                     route_name = excluded.route_name,
                     provider = excluded.provider,
                     model = excluded.model,
                     prompt_tokens = excluded.prompt_tokens,
                     completion_tokens = excluded.completion_tokens,
                     total_tokens = excluded.total_tokens,
                     cost_estimate_usd = excluded.cost_estimate_usd,
                     latency_ms = excluded.latency_ms,
                     status_code = excluded.status_code,
                     error_message = excluded.error_message",
                rusqlite::params![
                    surrogate_id,
                    record.request_id,
                    record.tenant,
                    record.use_case,
                    record.route_name,
                    record.provider,
                    record.model,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_tokens,
                    cost,
                    record.latency_ms as i64,
                    record.status_code,
                    record.error_message,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Insert one attempt row, resolving the surrogate foreign key with a
    /// nested lookup on the natural `request_id`. When no request row
    /// exists the insert touches zero rows; the orchestrator writes a
    /// skeleton record before any attempt, so that case only signals a
    /// caller bug.
    pub async fn log_attempt(
        &self,
        request_id: &str,
        attempt: AttemptRecord,
    ) -> Result<(), UsageStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();
        let surrogate_id = uuid::Uuid::new_v4().to_string();

        tokio::task::spawn_blocking(move || -> Result<(), UsageStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT INTO provider_attempts (
                     id, request_id, attempt_no, provider, model,
                     latency_ms, status_code, error_message
                 )
                 SELECT ?2, id, ?3, ?4, ?5, ?6, ?7, ?8
                 FROM requests WHERE request_id = ?1 LIMIT 1",
                rusqlite::params![
                    request_id,
                    surrogate_id,
                    attempt.attempt_no,
                    attempt.provider,
                    attempt.model,
                    attempt.latency_ms as i64,
                    attempt.status_code,
                    attempt.error_message,
                ],
            )?;
            if inserted == 0 {
                tracing::debug!(%request_id, "attempt journal skipped: no request row");
            }
            Ok(())
        })
        .await?
    }

    pub async fn find_request(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestRow>, UsageStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<RequestRow>, UsageStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT id, request_id, tenant, use_case, route_name, provider, model,
                            prompt_tokens, completion_tokens, total_tokens,
                            cost_estimate_usd, latency_ms, status_code, error_message
                     FROM requests WHERE request_id = ?1",
                    rusqlite::params![request_id],
                    |row| {
                        Ok(RequestRow {
                            id: row.get(0)?,
                            request_id: row.get(1)?,
                            tenant: row.get(2)?,
                            use_case: row.get(3)?,
                            route_name: row.get(4)?,
                            provider: row.get(5)?,
                            model: row.get(6)?,
                            prompt_tokens: row.get(7)?,
                            completion_tokens: row.get(8)?,
                            total_tokens: row.get(9)?,
                            cost_estimate_usd: row.get(10)?,
                            latency_ms: row.get::<_, i64>(11)? as u64,
                            status_code: row.get(12)?,
                            error_message: row.get(13)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    pub async fn list_attempts(
        &self,
        request_id: &str,
    ) -> Result<Vec<AttemptRow>, UsageStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<AttemptRow>, UsageStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT a.attempt_no, a.provider, a.model, a.latency_ms, a.status_code,
                        a.error_message
                 FROM provider_attempts a
                 JOIN requests r ON r.id = a.request_id
                 WHERE r.request_id = ?1
                 ORDER BY a.attempt_no",
            )?;
            let rows = stmt.query_map(rusqlite::params![request_id], |row| {
                Ok(AttemptRow {
                    attempt_no: row.get(0)?,
                    provider: row.get(1)?,
                    model: row.get(2)?,
                    latency_ms: row.get::<_, i64>(3)? as u64,
                    status_code: row.get(4)?,
                    error_message: row.get(5)?,
                })
            })?;
            let mut attempts = Vec::new();
            for row in rows {
                attempts.push(row?);
            }
            Ok(attempts)
        })
        .await?
    }
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS requests (
             id TEXT PRIMARY KEY,
             request_id TEXT NOT NULL UNIQUE,
             tenant TEXT NOT NULL DEFAULT '',
             use_case TEXT NOT NULL DEFAULT '',
             route_name TEXT NOT NULL DEFAULT '',
             provider TEXT NOT NULL DEFAULT '',
             model TEXT NOT NULL DEFAULT '',
             prompt_tokens INTEGER NOT NULL DEFAULT 0,
             completion_tokens INTEGER NOT NULL DEFAULT 0,
             total_tokens INTEGER NOT NULL DEFAULT 0,
             cost_estimate_usd NUMERIC(12,6) NOT NULL DEFAULT 0,
             latency_ms INTEGER NOT NULL DEFAULT 0,
             status_code INTEGER NOT NULL DEFAULT 0,
             error_message TEXT NOT NULL DEFAULT '',
             created_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE TABLE IF NOT EXISTS provider_attempts (
             id TEXT PRIMARY KEY,
             request_id TEXT NOT NULL REFERENCES requests(id),
             attempt_no INTEGER NOT NULL,
             provider TEXT NOT NULL DEFAULT '',
             model TEXT NOT NULL DEFAULT '',
             latency_ms INTEGER NOT NULL DEFAULT 0,
             status_code INTEGER NOT NULL DEFAULT 0,
             error_message TEXT NOT NULL DEFAULT '',
             created_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE INDEX IF NOT EXISTS idx_provider_attempts_request
             ON provider_attempts(request_id);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UsageStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = UsageStore::new(dir.path().join("usage.db"));
        (dir, store)
    }

    fn record(request_id: &str) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            tenant: "acme".to_string(),
            use_case: "support_summary".to_string(),
            route_name: "support".to_string(),
            ..UsageRecord::default()
        }
    }

    #[tokio::test]
    async fn log_upserts_by_request_id() {
        let (_dir, store) = store();

        store.log(record("req-1")).await.expect("skeleton");
        let skeleton = store
            .find_request("req-1")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(skeleton.status_code, 0);
        assert_eq!(skeleton.provider, "");

        let mut done = record("req-1");
        done.provider = "openai".to_string();
        done.model = "gpt-4o-mini".to_string();
        done.prompt_tokens = 10;
        done.completion_tokens = 20;
        done.total_tokens = 30;
        done.status_code = 200;
        done.latency_ms = 12;
        store.log(done).await.expect("final");

        let row = store
            .find_request("req-1")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row.status_code, 200);
        assert_eq!(row.provider, "openai");
        assert_eq!(row.total_tokens, 30);
        assert_eq!(row.cost_estimate_usd, 0.000014);
        // The surrogate key survives the overwrite.
        assert_eq!(row.id, skeleton.id);
    }

    #[tokio::test]
    async fn attempts_resolve_surrogate_key_and_stay_ordered() {
        let (_dir, store) = store();
        store.log(record("req-2")).await.expect("skeleton");

        for (attempt_no, status) in [(1u32, 502u16), (2, 200)] {
            store
                .log_attempt(
                    "req-2",
                    AttemptRecord {
                        attempt_no,
                        provider: "openai".to_string(),
                        model: "gpt-4o-mini".to_string(),
                        status_code: status,
                        ..AttemptRecord::default()
                    },
                )
                .await
                .expect("attempt");
        }

        let attempts = store.list_attempts("req-2").await.expect("attempts");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_no, 1);
        assert_eq!(attempts[0].status_code, 502);
        assert_eq!(attempts[1].attempt_no, 2);
        assert_eq!(attempts[1].status_code, 200);
    }

    #[tokio::test]
    async fn attempt_without_request_row_is_a_silent_noop() {
        let (_dir, store) = store();
        store
            .log_attempt("ghost", AttemptRecord::default())
            .await
            .expect("attempt");
        assert!(store.list_attempts("ghost").await.expect("list").is_empty());
    }
}
