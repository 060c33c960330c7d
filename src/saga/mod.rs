//! Trade saga state
//!
//! A trade moves through a fixed sequence of phases, each backed by exactly
//! one ledger transaction. The transaction id for a phase is persisted before
//! the transaction is submitted, so a confirmation event can always be mapped
//! back to the trade and phase that produced it.

pub mod plugin;

pub use plugin::{AssetTradePlugin, BusinessLogicPlugin};

use crate::error::{OrchestratorError, OrchestratorResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Phases of a trade saga, in strict execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradePhase {
    UnderEscrow,
    UnderTransfer,
    UnderSettlement,
    Completed,
}

impl TradePhase {
    /// The phase that follows this one; `Completed` is terminal
    pub fn next(self) -> Option<TradePhase> {
        match self {
            TradePhase::UnderEscrow => Some(TradePhase::UnderTransfer),
            TradePhase::UnderTransfer => Some(TradePhase::UnderSettlement),
            TradePhase::UnderSettlement => Some(TradePhase::Completed),
            TradePhase::Completed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradePhase::UnderEscrow => "under_escrow",
            TradePhase::UnderTransfer => "under_transfer",
            TradePhase::UnderSettlement => "under_settlement",
            TradePhase::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<TradePhase> {
        match s {
            "under_escrow" => Some(TradePhase::UnderEscrow),
            "under_transfer" => Some(TradePhase::UnderTransfer),
            "under_settlement" => Some(TradePhase::UnderSettlement),
            "completed" => Some(TradePhase::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one trade within one business logic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub business_logic_id: String,
    pub trade_id: String,
}

impl TradeKey {
    pub fn new(business_logic_id: &str, trade_id: &str) -> Self {
        Self {
            business_logic_id: business_logic_id.to_string(),
            trade_id: trade_id.to_string(),
        }
    }
}

/// Ledger binding of one phase: which ledger the phase's transaction went to
/// and under which id, written before submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseData {
    pub ledger_id: String,
    pub tx_id: String,
}

/// Everything known about one phase: the pre-submission binding plus the raw
/// confirmation payload once it arrived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub ledger_id: String,
    pub tx_id: String,
    #[serde(default)]
    pub raw_info: Option<Value>,
}

/// Durable state of one trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub business_logic_id: String,
    pub trade_id: String,
    pub current_phase: TradePhase,
    /// The intake request that started the trade
    pub request: Value,
    pub phases: BTreeMap<TradePhase, PhaseRecord>,
}

impl TradeRecord {
    pub fn new(business_logic_id: &str, trade_id: &str, request: Value) -> Self {
        Self {
            business_logic_id: business_logic_id.to_string(),
            trade_id: trade_id.to_string(),
            current_phase: TradePhase::UnderEscrow,
            request,
            phases: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> TradeKey {
        TradeKey::new(&self.business_logic_id, &self.trade_id)
    }

    /// The phase whose submitted transaction carries `tx_id`, if any
    pub fn phase_of_tx(&self, tx_id: &str) -> Option<TradePhase> {
        self.phases
            .iter()
            .find(|(_, record)| record.tx_id == tx_id)
            .map(|(phase, _)| *phase)
    }

    /// Move to `to`, which must be the direct successor of the current phase
    pub fn advance(&mut self, to: TradePhase) -> OrchestratorResult<()> {
        if self.current_phase.next() != Some(to) {
            return Err(OrchestratorError::InvalidPhaseTransition {
                from: self.current_phase.to_string(),
                to: to.to_string(),
            });
        }
        self.current_phase = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_order_is_strict() {
        assert_eq!(TradePhase::UnderEscrow.next(), Some(TradePhase::UnderTransfer));
        assert_eq!(TradePhase::UnderTransfer.next(), Some(TradePhase::UnderSettlement));
        assert_eq!(TradePhase::UnderSettlement.next(), Some(TradePhase::Completed));
        assert_eq!(TradePhase::Completed.next(), None);
    }

    #[test]
    fn test_advance_rejects_skipping_a_phase() {
        let mut record = TradeRecord::new("guks32pf", "20240101120000000-001", json!({}));
        assert!(record.advance(TradePhase::UnderSettlement).is_err());
        assert!(record.advance(TradePhase::UnderTransfer).is_ok());
        assert_eq!(record.current_phase, TradePhase::UnderTransfer);
    }

    #[test]
    fn test_advance_rejects_regression() {
        let mut record = TradeRecord::new("guks32pf", "20240101120000000-001", json!({}));
        record.advance(TradePhase::UnderTransfer).unwrap();
        assert!(matches!(
            record.advance(TradePhase::UnderTransfer),
            Err(OrchestratorError::InvalidPhaseTransition { .. })
        ));
    }

    #[test]
    fn test_phase_of_tx_finds_owning_phase() {
        let mut record = TradeRecord::new("guks32pf", "20240101120000000-001", json!({}));
        record.phases.insert(
            TradePhase::UnderEscrow,
            PhaseRecord {
                ledger_id: "84jUisrs".to_string(),
                tx_id: "0xabc".to_string(),
                raw_info: None,
            },
        );
        assert_eq!(record.phase_of_tx("0xabc"), Some(TradePhase::UnderEscrow));
        assert_eq!(record.phase_of_tx("0xdef"), None);
    }

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in [
            TradePhase::UnderEscrow,
            TradePhase::UnderTransfer,
            TradePhase::UnderSettlement,
            TradePhase::Completed,
        ] {
            assert_eq!(TradePhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(TradePhase::parse("nope"), None);
    }
}
