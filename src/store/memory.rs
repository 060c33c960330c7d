//! In-memory trade store

use super::TradeRecordStore;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::saga::{PhaseData, PhaseRecord, TradeKey, TradePhase, TradeRecord};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Process-local store; state is gone on restart
pub struct MemoryTradeStore {
    records: DashMap<TradeKey, TradeRecord>,
    /// tx_id -> owning trade, maintained alongside `set_phase_data`
    tx_index: DashMap<String, TradeKey>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tx_index: DashMap::new(),
        }
    }
}

impl Default for MemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeRecordStore for MemoryTradeStore {
    async fn create(&self, record: TradeRecord) -> OrchestratorResult<()> {
        self.records.insert(record.key(), record);
        Ok(())
    }

    async fn get(&self, key: &TradeKey) -> OrchestratorResult<TradeRecord> {
        self.records
            .get(key)
            .map(|r| r.clone())
            .ok_or_else(|| OrchestratorError::TradeNotFound {
                trade_id: key.trade_id.clone(),
            })
    }

    async fn set_phase(&self, key: &TradeKey, phase: TradePhase) -> OrchestratorResult<()> {
        let mut record =
            self.records
                .get_mut(key)
                .ok_or_else(|| OrchestratorError::TradeNotFound {
                    trade_id: key.trade_id.clone(),
                })?;
        record.advance(phase)
    }

    async fn set_phase_data(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        data: PhaseData,
    ) -> OrchestratorResult<()> {
        let mut record =
            self.records
                .get_mut(key)
                .ok_or_else(|| OrchestratorError::TradeNotFound {
                    trade_id: key.trade_id.clone(),
                })?;
        self.tx_index.insert(data.tx_id.clone(), key.clone());
        record.phases.insert(
            phase,
            PhaseRecord {
                ledger_id: data.ledger_id,
                tx_id: data.tx_id,
                raw_info: None,
            },
        );
        Ok(())
    }

    async fn set_phase_info(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        raw_info: Value,
    ) -> OrchestratorResult<()> {
        let mut record =
            self.records
                .get_mut(key)
                .ok_or_else(|| OrchestratorError::TradeNotFound {
                    trade_id: key.trade_id.clone(),
                })?;
        let phase_record = record.phases.get_mut(&phase).ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "phase {} of trade {} has no ledger binding",
                phase, key.trade_id
            ))
        })?;
        phase_record.raw_info = Some(raw_info);
        Ok(())
    }

    async fn find_by_tx_id(&self, tx_id: &str) -> OrchestratorResult<Option<TradeRecord>> {
        let Some(key) = self.tx_index.get(tx_id).map(|k| k.clone()) else {
            return Ok(None);
        };
        Ok(self.records.get(&key).map(|r| r.clone()))
    }
}
