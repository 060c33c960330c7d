//! PostgreSQL trade store

use super::TradeRecordStore;
use crate::config::DatabaseConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::saga::{PhaseData, PhaseRecord, TradeKey, TradePhase, TradeRecord};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct PostgresTradeStore {
    pool: PgPool,
}

impl PostgresTradeStore {
    pub async fn connect(config: &DatabaseConfig) -> OrchestratorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_records (
                business_logic_id VARCHAR(64) NOT NULL,
                trade_id VARCHAR(64) NOT NULL,
                current_phase VARCHAR(20) NOT NULL,
                request JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (business_logic_id, trade_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_phase_data (
                business_logic_id VARCHAR(64) NOT NULL,
                trade_id VARCHAR(64) NOT NULL,
                phase VARCHAR(20) NOT NULL,
                ledger_id VARCHAR(64) NOT NULL,
                tx_id VARCHAR(128) NOT NULL,
                raw_info JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (business_logic_id, trade_id, phase)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_phase_data_tx_id
            ON trade_phase_data (tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load(&self, key: &TradeKey) -> OrchestratorResult<Option<TradeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT current_phase, request FROM trade_records
            WHERE business_logic_id = $1 AND trade_id = $2
            "#,
        )
        .bind(&key.business_logic_id)
        .bind(&key.trade_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let phase_name: String = row.get("current_phase");
        let current_phase = TradePhase::parse(&phase_name).ok_or_else(|| {
            OrchestratorError::Internal(format!("unknown phase in store: {}", phase_name))
        })?;
        let request: Value = row.get("request");

        let phase_rows = sqlx::query(
            r#"
            SELECT phase, ledger_id, tx_id, raw_info FROM trade_phase_data
            WHERE business_logic_id = $1 AND trade_id = $2
            "#,
        )
        .bind(&key.business_logic_id)
        .bind(&key.trade_id)
        .fetch_all(&self.pool)
        .await?;

        let mut phases = BTreeMap::new();
        for phase_row in phase_rows {
            let name: String = phase_row.get("phase");
            let phase = TradePhase::parse(&name).ok_or_else(|| {
                OrchestratorError::Internal(format!("unknown phase in store: {}", name))
            })?;
            phases.insert(
                phase,
                PhaseRecord {
                    ledger_id: phase_row.get("ledger_id"),
                    tx_id: phase_row.get("tx_id"),
                    raw_info: phase_row.get("raw_info"),
                },
            );
        }

        Ok(Some(TradeRecord {
            business_logic_id: key.business_logic_id.clone(),
            trade_id: key.trade_id.clone(),
            current_phase,
            request,
            phases,
        }))
    }
}

#[async_trait]
impl TradeRecordStore for PostgresTradeStore {
    async fn create(&self, record: TradeRecord) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_records (business_logic_id, trade_id, current_phase, request)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.business_logic_id)
        .bind(&record.trade_id)
        .bind(record.current_phase.as_str())
        .bind(&record.request)
        .execute(&self.pool)
        .await?;

        debug!(
            business_logic_id = %record.business_logic_id,
            trade_id = %record.trade_id,
            "trade record created"
        );
        Ok(())
    }

    async fn get(&self, key: &TradeKey) -> OrchestratorResult<TradeRecord> {
        self.load(key)
            .await?
            .ok_or_else(|| OrchestratorError::TradeNotFound {
                trade_id: key.trade_id.clone(),
            })
    }

    async fn set_phase(&self, key: &TradeKey, phase: TradePhase) -> OrchestratorResult<()> {
        // the order check lives in TradeRecord::advance; the UPDATE is
        // guarded on the phase it validated against, so a concurrent writer
        // for the same trade cannot both pass
        let mut record = self.get(key).await?;
        let expected = record.current_phase;
        record.advance(phase)?;

        let result = sqlx::query(
            r#"
            UPDATE trade_records SET current_phase = $4, updated_at = NOW()
            WHERE business_logic_id = $1 AND trade_id = $2 AND current_phase = $3
            "#,
        )
        .bind(&key.business_logic_id)
        .bind(&key.trade_id)
        .bind(expected.as_str())
        .bind(phase.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidPhaseTransition {
                from: expected.to_string(),
                to: phase.to_string(),
            });
        }
        Ok(())
    }

    async fn set_phase_data(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        data: PhaseData,
    ) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_phase_data (business_logic_id, trade_id, phase, ledger_id, tx_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (business_logic_id, trade_id, phase)
            DO UPDATE SET ledger_id = $4, tx_id = $5
            "#,
        )
        .bind(&key.business_logic_id)
        .bind(&key.trade_id)
        .bind(phase.as_str())
        .bind(&data.ledger_id)
        .bind(&data.tx_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_phase_info(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        raw_info: Value,
    ) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE trade_phase_data SET raw_info = $4
            WHERE business_logic_id = $1 AND trade_id = $2 AND phase = $3
            "#,
        )
        .bind(&key.business_logic_id)
        .bind(&key.trade_id)
        .bind(phase.as_str())
        .bind(&raw_info)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Internal(format!(
                "phase {} of trade {} has no ledger binding",
                phase, key.trade_id
            )));
        }
        Ok(())
    }

    async fn find_by_tx_id(&self, tx_id: &str) -> OrchestratorResult<Option<TradeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT business_logic_id, trade_id FROM trade_phase_data
            WHERE tx_id = $1
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let key = TradeKey {
            business_logic_id: row.get("business_logic_id"),
            trade_id: row.get("trade_id"),
        };
        self.load(&key).await
    }
}
