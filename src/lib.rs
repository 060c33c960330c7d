//! Tradelink Orchestrator - cross-ledger trade coordination
//!
//! Drives multi-phase trades (sagas) across independent ledgers reachable
//! only through external validator adapters. Verifiers wrap the validator
//! protocol, the dispatcher routes authenticated ledger events to the plugin
//! owning the affected trade, and plugins advance each trade's phase machine
//! strictly in response to those events.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod saga;
pub mod store;
pub mod tx;
pub mod verifier;
