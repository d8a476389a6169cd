//! PostgreSQL state manager

use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::tx::TransactionRecord;

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, warn};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coordinator_transactions (
                id TEXT PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                group_id TEXT,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coordinator_transactions_group
            ON coordinator_transactions (group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace the stored copy of a record
    pub async fn store_transaction(&self, record: &TransactionRecord) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO coordinator_transactions (id, status, group_id, record, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id)
            DO UPDATE SET status = $2, record = $4, updated_at = NOW()
            "#,
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(record.group_id())
        .bind(Json(record))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Stored transaction {} ({})", record.id, record.status);
        Ok(())
    }

    pub async fn remove_transaction(&self, id: &str) -> CoordinatorResult<()> {
        sqlx::query("DELETE FROM coordinator_transactions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every stored record in creation order. Rows that no longer decode are
    /// skipped with a warning.
    pub async fn load_transactions(&self) -> CoordinatorResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            "SELECT id, record FROM coordinator_transactions ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let Json(value): Json<Value> = row.try_get("record")?;
            match decode_record(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping stored transaction {}: {}", id, e),
            }
        }

        Ok(records)
    }
}

fn decode_record(value: Value) -> CoordinatorResult<TransactionRecord> {
    serde_json::from_value(value)
        .map_err(|e| CoordinatorError::Internal(format!("Corrupt stored record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{ContractContext, TransactionStatus, TxConfig};
    use serde_json::json;

    #[test]
    fn test_stored_record_decodes() {
        let record = TransactionRecord::new(
            "batch-1-createToken",
            TxConfig::new(ContractContext::Network, "createToken").with_param("symbol", "CLNY"),
            None,
        );
        let stored = serde_json::to_value(&record).unwrap();

        let decoded = decode_record(stored).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.status, TransactionStatus::Ready);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        assert!(matches!(
            decode_record(json!({ "id": "x" })),
            Err(CoordinatorError::Internal(_))
        ));
    }
}
