//! Business logic plugins
//!
//! A plugin owns every trade of one business logic id: it starts the saga,
//! claims confirmation events handed over by the dispatcher, and advances the
//! phase machine. The dispatcher performs no trade-level matching; claiming an
//! event by transaction id is entirely the plugin's job.

use super::{PhaseData, TradeKey, TradePhase, TradeRecord};
use crate::config::AssetTradeConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::TradeRecordStore;
use crate::tx::{
    EthereumSigner, FabricProposalSigner, NonceAllocator, RawTxParams, VerifierCountSource,
};
use crate::verifier::{LedgerEvent, VerifierRegistry, STATUS_SUCCESS};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One trade type's saga driver
#[async_trait]
pub trait BusinessLogicPlugin: Send + Sync {
    fn business_logic_id(&self) -> &str;

    /// Ordered validator ids this trade type listens on
    fn validator_ids(&self) -> Vec<String>;

    /// How many candidate transactions one event from this plugin's ledgers
    /// carries; 0 means the shape is not recognized
    fn event_count(&self, event: &LedgerEvent) -> usize;

    /// The transaction id at `index`, when this plugin understands the shape
    fn extract_tx_id(&self, event: &LedgerEvent, index: usize) -> Option<String>;

    /// Begin the saga for a freshly assigned trade id
    async fn start_transaction(&self, trade_id: &str, params: Value) -> OrchestratorResult<()>;

    /// Handle one claimed sub-event. Failures stay inside the trade that hit
    /// them; this never propagates.
    async fn on_event(&self, event: &LedgerEvent, index: usize);

    /// Current state of a trade, if this plugin knows it
    async fn operation_status(&self, trade_id: &str) -> Option<Value>;
}

/// Intake parameters of one asset trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTradeRequest {
    pub buyer_address: String,
    pub seller_address: String,
    pub price: u64,
    pub asset_id: String,
    pub fabric_to: String,
}

/// Escrow / transfer / settlement saga across an Ethereum-style and a
/// Fabric-style ledger.
///
/// Escrow moves the price from buyer to the escrow account, transfer hands the
/// asset over on the Fabric-style ledger, settlement releases the escrowed
/// value to the seller. Each phase records its `{ledger_id, tx_id}` binding
/// before submission and waits for the matching confirmation event.
pub struct AssetTradePlugin {
    business_logic_id: String,
    config: AssetTradeConfig,
    registry: Arc<VerifierRegistry>,
    store: Arc<dyn TradeRecordStore>,
    nonces: NonceAllocator,
    eth_signer: EthereumSigner,
    fabric_signer: FabricProposalSigner,
}

impl AssetTradePlugin {
    pub fn new(
        business_logic_id: &str,
        config: AssetTradeConfig,
        registry: Arc<VerifierRegistry>,
        store: Arc<dyn TradeRecordStore>,
    ) -> OrchestratorResult<Self> {
        let mut eth_signer = EthereumSigner::from_hex_keys(&config.account_keys)?;
        eth_signer.insert_key(&config.escrow_address, &config.escrow_key)?;
        let fabric_signer =
            FabricProposalSigner::from_hex(&config.channel_name, &config.proposal_key)?;

        Ok(Self {
            business_logic_id: business_logic_id.to_string(),
            config,
            registry,
            store,
            nonces: NonceAllocator::new(),
            eth_signer,
            fabric_signer,
        })
    }

    /// Escrow: buyer -> escrow account on the Ethereum-style ledger
    async fn submit_escrow(
        &self,
        key: &TradeKey,
        request: &AssetTradeRequest,
    ) -> OrchestratorResult<()> {
        self.submit_value_transfer(
            key,
            TradePhase::UnderEscrow,
            &request.buyer_address,
            &self.config.escrow_address,
            request.price,
        )
        .await
    }

    /// Settlement: escrow account -> seller on the Ethereum-style ledger
    async fn submit_settlement(
        &self,
        key: &TradeKey,
        request: &AssetTradeRequest,
    ) -> OrchestratorResult<()> {
        self.submit_value_transfer(
            key,
            TradePhase::UnderSettlement,
            &self.config.escrow_address,
            &request.seller_address,
            request.price,
        )
        .await
    }

    async fn submit_value_transfer(
        &self,
        key: &TradeKey,
        phase: TradePhase,
        from: &str,
        to: &str,
        amount: u64,
    ) -> OrchestratorResult<()> {
        let verifier = self
            .registry
            .verifier(&self.config.ethereum_validator_id)
            .await?;

        let count_source = VerifierCountSource::new(verifier.clone());
        let nonce = self.nonces.allocate(from, &count_source).await?;

        let signed = self.eth_signer.sign(&RawTxParams {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            gas: self.config.gas,
            nonce,
        })?;

        // binding first, submission second
        self.store
            .set_phase_data(
                key,
                phase,
                PhaseData {
                    ledger_id: self.config.ethereum_validator_id.clone(),
                    tx_id: signed.tx_id.clone(),
                },
            )
            .await?;

        info!(
            trade_id = %key.trade_id,
            %phase,
            tx_id = %signed.tx_id,
            "submitting value transfer"
        );
        verifier
            .send_async_request(
                json!({}),
                json!({"type": "web3Eth", "command": "sendRawTransaction"}),
                json!({"args": [signed.serialized]}),
            )
            .await
    }

    /// Transfer: signed chaincode proposal on the Fabric-style ledger
    async fn submit_transfer(
        &self,
        key: &TradeKey,
        request: &AssetTradeRequest,
    ) -> OrchestratorResult<()> {
        let verifier = self
            .registry
            .verifier(&self.config.fabric_validator_id)
            .await?;

        let proposal = self.fabric_signer.sign_proposal(
            &self.config.chaincode_function,
            &[request.asset_id.clone(), request.fabric_to.clone()],
        )?;

        self.store
            .set_phase_data(
                key,
                TradePhase::UnderTransfer,
                PhaseData {
                    ledger_id: self.config.fabric_validator_id.clone(),
                    tx_id: proposal.tx_id.clone(),
                },
            )
            .await?;

        info!(
            trade_id = %key.trade_id,
            tx_id = %proposal.tx_id,
            "submitting asset transfer proposal"
        );
        verifier
            .send_async_request(
                json!({}),
                json!({"type": "function", "command": "sendSignedProposal"}),
                json!({"args": [proposal.signed_proposal, proposal.commit_req]}),
            )
            .await
    }

    fn parse_request(&self, record: &TradeRecord) -> OrchestratorResult<AssetTradeRequest> {
        serde_json::from_value(record.request.clone()).map_err(|e| {
            OrchestratorError::Application {
                trade_id: record.trade_id.clone(),
                message: format!("malformed trade request: {}", e),
            }
        })
    }

    /// Apply one confirmed transaction to the trade that submitted it.
    ///
    /// Confirmations for a phase the trade already passed are redeliveries:
    /// warned and ignored, never resubmitted. A non-success status ends the
    /// trade's progression permanently; earlier phases are not rolled back.
    async fn handle_confirmation(
        &self,
        tx_id: &str,
        status: u16,
        raw_info: Value,
    ) -> OrchestratorResult<()> {
        let Some(record) = self.store.find_by_tx_id(tx_id).await? else {
            debug!(tx_id, "no trade waiting on this transaction");
            return Ok(());
        };
        let key = record.key();

        let Some(phase) = record.phase_of_tx(tx_id) else {
            return Ok(());
        };
        if phase != record.current_phase {
            warn!(
                trade_id = %key.trade_id,
                confirmed_phase = %phase,
                current_phase = %record.current_phase,
                tx_id,
                "stale confirmation redelivered, ignoring"
            );
            return Ok(());
        }

        if status != STATUS_SUCCESS {
            error!(
                trade_id = %key.trade_id,
                %phase,
                status,
                tx_id,
                "ledger reported failure, trade will not progress"
            );
            return Ok(());
        }

        self.store.set_phase_info(&key, phase, raw_info).await?;

        let Some(next) = phase.next() else {
            return Ok(());
        };
        self.store.set_phase(&key, next).await?;

        let request = self.parse_request(&record)?;
        match next {
            TradePhase::UnderTransfer => self.submit_transfer(&key, &request).await,
            TradePhase::UnderSettlement => self.submit_settlement(&key, &request).await,
            TradePhase::Completed => {
                info!(trade_id = %key.trade_id, "trade completed");
                Ok(())
            }
            TradePhase::UnderEscrow => Ok(()),
        }
    }

    fn is_ethereum(&self, event: &LedgerEvent) -> bool {
        event.validator_id == self.config.ethereum_validator_id
    }

    fn is_fabric(&self, event: &LedgerEvent) -> bool {
        event.validator_id == self.config.fabric_validator_id
    }

    fn raw_info(&self, event: &LedgerEvent, index: usize) -> Value {
        if self.is_ethereum(event) {
            event.block_data["transactions"]
                .get(index)
                .cloned()
                .unwrap_or(Value::Null)
        } else {
            event.block_data.get(index).cloned().unwrap_or(Value::Null)
        }
    }
}

#[async_trait]
impl BusinessLogicPlugin for AssetTradePlugin {
    fn business_logic_id(&self) -> &str {
        &self.business_logic_id
    }

    fn validator_ids(&self) -> Vec<String> {
        vec![
            self.config.ethereum_validator_id.clone(),
            self.config.fabric_validator_id.clone(),
        ]
    }

    fn event_count(&self, event: &LedgerEvent) -> usize {
        if self.is_ethereum(event) {
            event.block_data["transactions"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0)
        } else if self.is_fabric(event) {
            event.block_data.as_array().map(Vec::len).unwrap_or(0)
        } else {
            0
        }
    }

    fn extract_tx_id(&self, event: &LedgerEvent, index: usize) -> Option<String> {
        let candidate = if self.is_ethereum(event) {
            event.block_data["transactions"].get(index)?.get("hash")?
        } else if self.is_fabric(event) {
            event.block_data.get(index)?.get("tx_id")?
        } else {
            return None;
        };
        candidate.as_str().map(str::to_string)
    }

    async fn start_transaction(&self, trade_id: &str, params: Value) -> OrchestratorResult<()> {
        let record = TradeRecord::new(&self.business_logic_id, trade_id, params);
        let request = self.parse_request(&record)?;
        let key = record.key();

        self.store.create(record).await?;
        info!(
            business_logic_id = %self.business_logic_id,
            trade_id,
            asset_id = %request.asset_id,
            "trade started"
        );
        self.submit_escrow(&key, &request).await
    }

    async fn on_event(&self, event: &LedgerEvent, index: usize) {
        let Some(tx_id) = self.extract_tx_id(event, index) else {
            return;
        };
        let raw_info = self.raw_info(event, index);

        if let Err(e) = self.handle_confirmation(&tx_id, event.status, raw_info).await {
            error!(tx_id = %tx_id, error = %e, "confirmation handling failed");
        }
    }

    async fn operation_status(&self, trade_id: &str) -> Option<Value> {
        let key = TradeKey::new(&self.business_logic_id, trade_id);
        let record = self.store.get(&key).await.ok()?;
        serde_json::to_value(&record).ok()
    }
}
