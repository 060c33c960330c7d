//! Trade record persistence
//!
//! The saga layer talks to storage through [`TradeRecordStore`]; the in-memory
//! implementation backs tests and single-node setups, the Postgres one backs
//! deployments that must survive restarts.

pub mod memory;
pub mod postgres;

pub use memory::MemoryTradeStore;
pub use postgres::PostgresTradeStore;

use crate::error::OrchestratorResult;
use crate::saga::{PhaseData, TradeKey, TradePhase, TradeRecord};

use async_trait::async_trait;
use serde_json::Value;

/// Durable storage for trade sagas
#[async_trait]
pub trait TradeRecordStore: Send + Sync {
    /// Persist a new trade in its initial phase
    async fn create(&self, record: TradeRecord) -> OrchestratorResult<()>;

    async fn get(&self, key: &TradeKey) -> OrchestratorResult<TradeRecord>;

    /// Advance the trade to `phase`; only the direct successor of the current
    /// phase is accepted
    async fn set_phase(&self, key: &TradeKey, phase: TradePhase) -> OrchestratorResult<()>;

    /// Record the ledger binding of a phase. Called before the phase's
    /// transaction is submitted so a confirmation can never arrive for a
    /// transaction id the store has not seen.
    async fn set_phase_data(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        data: PhaseData,
    ) -> OrchestratorResult<()>;

    /// Attach the raw confirmation payload to a phase
    async fn set_phase_info(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        raw_info: Value,
    ) -> OrchestratorResult<()>;

    /// Find the trade whose submitted transaction carries `tx_id`
    async fn find_by_tx_id(&self, tx_id: &str) -> OrchestratorResult<Option<TradeRecord>>;
}
