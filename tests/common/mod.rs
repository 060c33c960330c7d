//! Shared test harness: an in-process loopback transport standing in for two
//! validator adapters, wired into a real registry, dispatcher and plugin.

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;

use tradelink_orchestrator::config::{
    ApiConfig, AssetTradeConfig, BusinessLogicConfig, OrchestratorConfig, Settings,
    ValidatorDescriptor, ValidatorType,
};
use tradelink_orchestrator::dispatch::Dispatcher;
use tradelink_orchestrator::error::OrchestratorResult;
use tradelink_orchestrator::saga::{AssetTradePlugin, TradeKey, TradePhase};
use tradelink_orchestrator::store::{MemoryTradeStore, TradeRecordStore};
use tradelink_orchestrator::verifier::{
    Channel, ChannelInbound, EventAuthenticator, EventListener, SyncResponse, Verifier,
    VerifierRegistry, VerifierTiming, WireMessage,
};

pub const ETH: &str = "84jUisrs";
pub const FABRIC: &str = "r9IS4dDf";
pub const BUSINESS_LOGIC: &str = "guks32pf";
pub const BUYER: &str = "0xec709e";
pub const SELLER: &str = "0x9d624f";

/// Loopback validator: records outbound traffic and answers `getNonce` sync
/// requests with a sealed response, like a real adapter would
pub struct TestChannel {
    signing: SigningKey,
    sent: StdMutex<Vec<WireMessage>>,
    inbound: broadcast::Sender<ChannelInbound>,
    reported_count: AtomicU64,
}

impl TestChannel {
    pub fn new(key_seed: u8) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(64);
        Arc::new(Self {
            signing: SigningKey::from_bytes(&[key_seed; 32]),
            sent: StdMutex::new(Vec::new()),
            inbound,
            reported_count: AtomicU64::new(0),
        })
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Commands of every request submitted so far
    pub fn request_commands(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                WireMessage::Request2 { method, .. } => method
                    .get("command")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn seal(&self, payload: Value) -> Value {
        let message = serde_json::to_vec(&payload).unwrap();
        let signature = self.signing.sign(&message);
        json!({
            "payload": payload,
            "signature": hex::encode(signature.to_bytes()),
        })
    }

    /// Deliver an arbitrary inbound frame, bypassing the sealing helper
    pub fn emit_raw(&self, inbound: ChannelInbound) {
        self.inbound.send(inbound).unwrap();
    }

    /// Deliver a sealed ledger event as if the validator emitted it
    pub fn emit_event(&self, status: u16, block_data: Value) {
        self.inbound
            .send(ChannelInbound::EventReceived {
                status,
                block_data: self.seal(block_data),
            })
            .unwrap();
    }

    pub fn authenticator(&self, validator_id: &str) -> EventAuthenticator {
        EventAuthenticator::from_hex(
            validator_id,
            &hex::encode(self.signing.verifying_key().as_bytes()),
        )
        .unwrap()
    }
}

#[async_trait]
impl Channel for TestChannel {
    async fn send(&self, msg: WireMessage) -> OrchestratorResult<()> {
        self.sent.lock().unwrap().push(msg.clone());

        // answer nonce queries so escrow/settlement submission can proceed
        if let WireMessage::Request2 {
            method,
            req_id: Some(req_id),
            ..
        } = &msg
        {
            if method.get("command").and_then(Value::as_str) == Some("getNonce") {
                let count = self.reported_count.load(Ordering::SeqCst);
                let _ = self.inbound.send(ChannelInbound::Response {
                    id: req_id.clone(),
                    result: SyncResponse {
                        status: 200,
                        data: self.seal(json!({"nonce": count})),
                    },
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelInbound> {
        self.inbound.subscribe()
    }
}

pub struct TestEnv {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryTradeStore>,
    pub eth: Arc<TestChannel>,
    pub fabric: Arc<TestChannel>,
}

impl TestEnv {
    pub async fn phase_of(&self, trade_id: &str) -> TradePhase {
        self.store
            .get(&TradeKey::new(BUSINESS_LOGIC, trade_id))
            .await
            .unwrap()
            .current_phase
    }

    pub async fn tx_id_of(&self, trade_id: &str, phase: TradePhase) -> String {
        self.store
            .get(&TradeKey::new(BUSINESS_LOGIC, trade_id))
            .await
            .unwrap()
            .phases[&phase]
            .tx_id
            .clone()
    }

    /// Give the inbound pumps a moment to drain
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
}

pub fn trade_params() -> Value {
    json!({
        "buyer_address": BUYER,
        "seller_address": SELLER,
        "price": 50,
        "asset_id": "asset-01",
        "fabric_to": "fuser02",
    })
}

fn settings() -> Settings {
    let mut validators = HashMap::new();
    for vid in [ETH, FABRIC] {
        validators.insert(
            vid.to_string(),
            ValidatorDescriptor {
                validator_id: vid.to_string(),
                validator_type: ValidatorType::Channel,
                endpoint_url: "wss://localhost:5050".to_string(),
                auth_key_path: "/dev/null".to_string(),
                supported_operations: vec![],
            },
        );
    }
    Settings {
        orchestrator: OrchestratorConfig {
            instance_id: "test".to_string(),
            max_correlation_id: 1000,
            sync_request_timeout_ms: 1_000,
            reconnect_delay_ms: 60_000,
        },
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: None,
        validators,
        business_logic: HashMap::from([(
            BUSINESS_LOGIC.to_string(),
            BusinessLogicConfig {
                validator_ids: vec![ETH.to_string(), FABRIC.to_string()],
                asset_trade: None,
            },
        )]),
    }
}

fn trade_config() -> AssetTradeConfig {
    let mut account_keys = HashMap::new();
    account_keys.insert(BUYER.to_string(), hex::encode([0x11u8; 32]));
    AssetTradeConfig {
        ethereum_validator_id: ETH.to_string(),
        fabric_validator_id: FABRIC.to_string(),
        escrow_address: "0x36e146".to_string(),
        gas: 21_000,
        channel_name: "mychannel".to_string(),
        chaincode_function: "TransferAsset".to_string(),
        account_keys,
        escrow_key: hex::encode([0x12u8; 32]),
        proposal_key: hex::encode([0x13u8; 32]),
    }
}

pub async fn build_env() -> TestEnv {
    let store = Arc::new(MemoryTradeStore::new());
    let registry = Arc::new(VerifierRegistry::new(settings()));
    let timing = VerifierTiming {
        sync_request_timeout: Duration::from_millis(1_000),
        max_correlation_id: 1000,
    };

    let eth = TestChannel::new(0x41);
    let fabric = TestChannel::new(0x42);

    for (vid, channel) in [(ETH, eth.clone()), (FABRIC, fabric.clone())] {
        let descriptor = ValidatorDescriptor {
            validator_id: vid.to_string(),
            validator_type: ValidatorType::Channel,
            endpoint_url: "wss://localhost:5050".to_string(),
            auth_key_path: String::new(),
            supported_operations: vec![],
        };
        let verifier = Verifier::new(
            descriptor,
            Some(channel.authenticator(vid)),
            Some(channel as Arc<dyn Channel>),
            timing.clone(),
        )
        .unwrap();
        registry.attach(verifier);
    }

    let dispatcher = Dispatcher::new(registry.clone());
    let plugin = AssetTradePlugin::new(
        BUSINESS_LOGIC,
        trade_config(),
        registry.clone(),
        store.clone() as Arc<dyn TradeRecordStore>,
    )
    .unwrap();
    dispatcher.register_plugin(Arc::new(plugin));

    // the dispatcher is the single listener on both verifiers
    for vid in [ETH, FABRIC] {
        registry
            .verifier(vid)
            .await
            .unwrap()
            .start_monitor("dispatcher", None, dispatcher.clone() as Arc<dyn EventListener>)
            .await
            .unwrap();
    }

    TestEnv {
        dispatcher,
        store,
        eth,
        fabric,
    }
}
