//! Transactional upsert of the resource row plus replace-as-a-whole of its
//! log-URL rows, behind a dialect-neutral interface so PostgreSQL and
//! MariaDB-family engines share one call site.

pub mod dialect;

use async_trait::async_trait;
use kubearchive_types::WriteOutcome;

/// Schema version this build expects. Bump when the `resource` / `log_url` /
/// `schema_meta` table shapes change; a mismatch at startup is a fatal
/// config error, not something the writer silently migrates around.
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("schema version mismatch: database has {found}, this build expects {expected}")]
    SchemaVersionMismatch { found: i32, expected: i32 },
}

/// Everything the writer needs for one `write` call. Constructed by the
/// event handler from the parsed CloudEvent and the log-URL builder's
/// output.
pub struct WriteInput<'a> {
    pub uid: &'a str,
    pub api_version: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
    pub resource_version: &'a str,
    pub cluster_updated_ts: i64,
    pub cluster_deleted_ts: Option<i64>,
    pub created_at: i64,
    pub data: &'a serde_json::Value,
    /// `(container_name, url)` pairs; ignored unless `kind == "Pod"`.
    pub log_urls: &'a [(String, String)],
    pub json_path: &'a str,
}

#[async_trait]
pub trait ResourceWriter: Send + Sync {
    /// Runs the upsert-then-replace-log-urls protocol in one transaction.
    /// `None` is the defined stale-event no-op, not an error.
    async fn write(&self, input: WriteInput<'_>) -> Result<WriteOutcome, WriteError>;

    /// Creates `resource`, `log_url`, and `schema_meta` if absent, and
    /// verifies (or, on a fresh database, stamps) the schema version.
    async fn init_schema(&self) -> Result<(), WriteError>;

    /// Used by `/readyz`: a cheap round-trip that proves the pool can reach
    /// the database.
    async fn ping(&self) -> Result<(), WriteError>;
}
