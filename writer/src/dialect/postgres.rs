use async_trait::async_trait;
use deadpool_postgres::Pool;
use kubearchive_types::WriteOutcome;
use tokio_postgres::Transaction;

use crate::{SCHEMA_VERSION, WriteError, WriteInput, ResourceWriter};

pub struct PostgresWriter {
    pool: Pool,
}

impl PostgresWriter {
    pub fn new(pool: Pool) -> Self {
        PostgresWriter { pool }
    }

    async fn upsert_resource(
        tx: &Transaction<'_>,
        input: &WriteInput<'_>,
    ) -> Result<Option<bool>, WriteError> {
        let row = tx
            .query_opt(
                r#"
                INSERT INTO resource (
                    uid, api_version, kind, namespace, name, resource_version,
                    cluster_updated_ts, cluster_deleted_ts, data, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (uid) DO UPDATE SET
                    api_version = EXCLUDED.api_version,
                    kind = EXCLUDED.kind,
                    namespace = EXCLUDED.namespace,
                    name = EXCLUDED.name,
                    resource_version = EXCLUDED.resource_version,
                    cluster_updated_ts = EXCLUDED.cluster_updated_ts,
                    cluster_deleted_ts = EXCLUDED.cluster_deleted_ts,
                    data = EXCLUDED.data
                WHERE resource.cluster_updated_ts < EXCLUDED.cluster_updated_ts
                RETURNING (xmax = 0) AS inserted
                "#,
                &[
                    &input.uid,
                    &input.api_version,
                    &input.kind,
                    &input.namespace,
                    &input.name,
                    &input.resource_version,
                    &input.cluster_updated_ts,
                    &input.cluster_deleted_ts,
                    input.data,
                    &input.created_at,
                ],
            )
            .await?;

        Ok(row.map(|r| r.get::<_, bool>(0)))
    }

    /// Maps the upsert's `RETURNING (xmax = 0)` row to an outcome. `None`
    /// means no row came back at all: the `WHERE resource.cluster_updated_ts
    /// < EXCLUDED.cluster_updated_ts` guard rejected the write as stale and
    /// neither an insert nor an update happened.
    fn classify_outcome(inserted: Option<bool>) -> Option<WriteOutcome> {
        inserted.map(|inserted| if inserted { WriteOutcome::Inserted } else { WriteOutcome::Updated })
    }

    fn should_replace_log_urls(kind: &str) -> bool {
        kind == "Pod"
    }

    async fn replace_log_urls(tx: &Transaction<'_>, input: &WriteInput<'_>) -> Result<(), WriteError> {
        if !Self::should_replace_log_urls(input.kind) {
            return Ok(());
        }

        tx.execute("DELETE FROM log_url WHERE uid = $1", &[&input.uid])
            .await?;

        for (container_name, url) in input.log_urls {
            tx.execute(
                "INSERT INTO log_url (uid, url, container_name, json_path) VALUES ($1, $2, $3, $4)",
                &[&input.uid, url, container_name, &input.json_path],
            )
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ResourceWriter for PostgresWriter {
    async fn write(&self, input: WriteInput<'_>) -> Result<WriteOutcome, WriteError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = Self::upsert_resource(&tx, &input).await?;
        let Some(outcome) = Self::classify_outcome(row) else {
            tx.commit().await?;
            return Ok(WriteOutcome::None);
        };

        Self::replace_log_urls(&tx, &input).await?;

        tx.commit().await?;

        Ok(outcome)
    }

    async fn init_schema(&self) -> Result<(), WriteError> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS resource (
                    id BIGSERIAL PRIMARY KEY,
                    uid TEXT NOT NULL UNIQUE,
                    api_version TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    resource_version TEXT NOT NULL,
                    cluster_updated_ts BIGINT NOT NULL,
                    cluster_deleted_ts BIGINT,
                    data JSONB NOT NULL,
                    created_at BIGINT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_resource_listing
                    ON resource (kind, api_version, namespace, created_at DESC, id DESC);

                CREATE TABLE IF NOT EXISTS log_url (
                    uid TEXT NOT NULL,
                    url TEXT NOT NULL,
                    container_name TEXT NOT NULL,
                    json_path TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_log_url_uid ON log_url (uid);

                CREATE TABLE IF NOT EXISTS schema_meta (
                    version INT NOT NULL
                );
                "#,
            )
            .await?;

        let row = client.query_opt("SELECT version FROM schema_meta", &[]).await?;
        match row {
            None => {
                client
                    .execute("INSERT INTO schema_meta (version) VALUES ($1)", &[&SCHEMA_VERSION])
                    .await?;
            }
            Some(row) => {
                let found: i32 = row.get(0);
                if found != SCHEMA_VERSION {
                    return Err(WriteError::SchemaVersionMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
        }

        tracing::info!("postgres schema initialized");
        Ok(())
    }

    async fn ping(&self) -> Result<(), WriteError> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_write_returns_no_outcome() {
        assert_eq!(PostgresWriter::classify_outcome(None), None);
    }

    #[test]
    fn fresh_insert_is_classified_inserted() {
        assert_eq!(PostgresWriter::classify_outcome(Some(true)), Some(WriteOutcome::Inserted));
    }

    #[test]
    fn conflicting_update_is_classified_updated() {
        assert_eq!(PostgresWriter::classify_outcome(Some(false)), Some(WriteOutcome::Updated));
    }

    #[test]
    fn log_urls_only_replaced_for_pods() {
        assert!(PostgresWriter::should_replace_log_urls("Pod"));
        assert!(!PostgresWriter::should_replace_log_urls("Deployment"));
        assert!(!PostgresWriter::should_replace_log_urls(""));
    }
}
