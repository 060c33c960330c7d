//! Nonce allocation for account-model ledgers
//!
//! The ledger's reported transaction count lags while earlier submissions sit
//! unconfirmed, so the allocator keeps the highest nonce it has handed out per
//! address and never goes backwards. The whole read-compute-store cycle runs
//! under a per-address lock; concurrent trades from one account get strictly
//! increasing nonces.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::verifier::{Verifier, STATUS_SUCCESS};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Source of the ledger-reported transaction count for an address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionCountSource: Send + Sync {
    async fn transaction_count(&self, address: &str) -> OrchestratorResult<u64>;
}

/// Hands out per-address nonces that never repeat or regress
pub struct NonceAllocator {
    /// Highest nonce allocated so far per address; -1 means none yet
    highest: DashMap<String, Arc<Mutex<i64>>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self {
            highest: DashMap::new(),
        }
    }

    /// Allocate the next nonce for `address`.
    ///
    /// Returns `max(reported_count, highest_allocated + 1)` and records the
    /// result, holding the address lock across the count lookup.
    pub async fn allocate(
        &self,
        address: &str,
        source: &dyn TransactionCountSource,
    ) -> OrchestratorResult<u64> {
        let slot = self
            .highest
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(-1)))
            .clone();

        let mut highest = slot.lock().await;
        let reported = source.transaction_count(address).await? as i64;
        let nonce = reported.max(*highest + 1);
        *highest = nonce;
        debug!(address, reported, nonce, "nonce allocated");
        Ok(nonce as u64)
    }
}

impl Default for NonceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction count source backed by a verifier's `getNonce` operation
pub struct VerifierCountSource {
    verifier: Arc<Verifier>,
}

impl VerifierCountSource {
    pub fn new(verifier: Arc<Verifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl TransactionCountSource for VerifierCountSource {
    async fn transaction_count(&self, address: &str) -> OrchestratorResult<u64> {
        let response = self
            .verifier
            .send_sync_request(
                json!({}),
                json!({"type": "function", "command": "getNonce"}),
                json!({"args": {"args": [address]}}),
            )
            .await?;

        if response.status != STATUS_SUCCESS {
            return Err(OrchestratorError::Nonce {
                address: address.to_string(),
                message: format!("getNonce returned status {}", response.status),
            });
        }

        parse_count(&response.data).ok_or_else(|| OrchestratorError::Nonce {
            address: address.to_string(),
            message: "getNonce response carries no count".to_string(),
        })
    }
}

/// Accepts `{"nonce": n}`, a bare number, or a hex string like `"0x1a"`
fn parse_count(data: &Value) -> Option<u64> {
    let candidate = data.get("nonce").unwrap_or(data);
    if let Some(n) = candidate.as_u64() {
        return Some(n);
    }
    candidate
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
}
