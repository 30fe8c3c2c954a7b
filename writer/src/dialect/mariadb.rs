use async_trait::async_trait;
use kubearchive_types::WriteOutcome;
use sqlx::MySqlPool;

use crate::{SCHEMA_VERSION, WriteError, WriteInput, ResourceWriter};

pub struct MariadbWriter {
    pool: MySqlPool,
}

impl MariadbWriter {
    pub fn new(pool: MySqlPool) -> Self {
        MariadbWriter { pool }
    }

    /// Maps the `INSERT ... ON DUPLICATE KEY UPDATE`'s affected-rows count to
    /// an outcome. MySQL/MariaDB report 1 for a fresh insert, 2 for a row
    /// that actually changed, and 0 if the UPDATE branch ran but the
    /// `VALUES(cluster_updated_ts) > cluster_updated_ts` guard left every
    /// column matching its current value: a stale write, not an error.
    fn classify_outcome(rows_affected: u64) -> Option<WriteOutcome> {
        match rows_affected {
            0 => None,
            1 => Some(WriteOutcome::Inserted),
            _ => Some(WriteOutcome::Updated),
        }
    }

    fn should_replace_log_urls(kind: &str) -> bool {
        kind == "Pod"
    }
}

#[async_trait]
impl ResourceWriter for MariadbWriter {
    async fn write(&self, input: WriteInput<'_>) -> Result<WriteOutcome, WriteError> {
        let mut tx = self.pool.begin().await?;

        // MySQL reports the affected-rows count for INSERT ... ON DUPLICATE KEY
        // UPDATE as 1 for a fresh insert, 2 for a row that actually changed, and
        // 0 if the UPDATE branch ran but every column matched its current value
        // (our VALUES(cluster_updated_ts) > cluster_updated_ts guard).
        let data_json = serde_json::to_string(input.data).expect("resource data is valid JSON");

        let result = sqlx::query(
            r#"
            INSERT INTO resource (
                uid, api_version, kind, namespace, name, resource_version,
                cluster_updated_ts, cluster_deleted_ts, data, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                api_version = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(api_version), api_version),
                kind = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(kind), kind),
                namespace = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(namespace), namespace),
                name = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(name), name),
                resource_version = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(resource_version), resource_version),
                cluster_deleted_ts = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(cluster_deleted_ts), cluster_deleted_ts),
                data = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(data), data),
                cluster_updated_ts = IF(VALUES(cluster_updated_ts) > cluster_updated_ts, VALUES(cluster_updated_ts), cluster_updated_ts)
            "#,
        )
        .bind(input.uid)
        .bind(input.api_version)
        .bind(input.kind)
        .bind(input.namespace)
        .bind(input.name)
        .bind(input.resource_version)
        .bind(input.cluster_updated_ts)
        .bind(input.cluster_deleted_ts)
        .bind(&data_json)
        .bind(input.created_at)
        .execute(&mut *tx)
        .await?;

        let Some(outcome) = Self::classify_outcome(result.rows_affected()) else {
            tx.commit().await?;
            return Ok(WriteOutcome::None);
        };

        if Self::should_replace_log_urls(input.kind) {
            sqlx::query("DELETE FROM log_url WHERE uid = ?")
                .bind(input.uid)
                .execute(&mut *tx)
                .await?;

            for (container_name, url) in input.log_urls {
                sqlx::query(
                    "INSERT INTO log_url (uid, url, container_name, json_path) VALUES (?, ?, ?, ?)",
                )
                .bind(input.uid)
                .bind(url)
                .bind(container_name)
                .bind(input.json_path)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn init_schema(&self) -> Result<(), WriteError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                uid VARCHAR(255) NOT NULL UNIQUE,
                api_version VARCHAR(255) NOT NULL,
                kind VARCHAR(255) NOT NULL,
                namespace VARCHAR(255) NOT NULL,
                name VARCHAR(255) NOT NULL,
                resource_version VARCHAR(255) NOT NULL,
                cluster_updated_ts BIGINT NOT NULL,
                cluster_deleted_ts BIGINT NULL,
                data JSON NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX idx_resource_listing (kind, api_version, namespace, created_at DESC, id DESC)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_url (
                uid VARCHAR(255) NOT NULL,
                url TEXT NOT NULL,
                container_name VARCHAR(255) NOT NULL,
                json_path TEXT NOT NULL,
                INDEX idx_log_url_uid (uid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS schema_meta (version INT NOT NULL)")
            .execute(&self.pool)
            .await?;

        let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM schema_meta")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => {
                sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some((found,)) => {
                if found != SCHEMA_VERSION {
                    return Err(WriteError::SchemaVersionMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
        }

        tracing::info!("mariadb schema initialized");
        Ok(())
    }

    async fn ping(&self) -> Result<(), WriteError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_write_returns_no_outcome() {
        assert_eq!(MariadbWriter::classify_outcome(0), None);
    }

    #[test]
    fn fresh_insert_is_classified_inserted() {
        assert_eq!(MariadbWriter::classify_outcome(1), Some(WriteOutcome::Inserted));
    }

    #[test]
    fn changed_row_is_classified_updated() {
        assert_eq!(MariadbWriter::classify_outcome(2), Some(WriteOutcome::Updated));
    }

    #[test]
    fn log_urls_only_replaced_for_pods() {
        assert!(MariadbWriter::should_replace_log_urls("Pod"));
        assert!(!MariadbWriter::should_replace_log_urls("Deployment"));
    }
}
