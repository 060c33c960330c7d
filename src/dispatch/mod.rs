//! Event dispatcher
//!
//! One dispatcher is the sole event listener for every monitored verifier. It
//! routes each inbound ledger event to the plugin that claims it: plugins
//! registered for the event's validator are probed in registration order, the
//! first one reporting a non-zero sub-event count fixes the fan-out, and each
//! sub-event goes to the first plugin that can extract a transaction id from
//! it. Events nobody claims are dropped with a warning.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::saga::BusinessLogicPlugin;
use crate::verifier::{EventListener, LedgerEvent, VerifierRegistry};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct Dispatcher {
    registry: Arc<VerifierRegistry>,
    plugins: RwLock<Vec<Arc<dyn BusinessLogicPlugin>>>,
    /// validator id -> plugin indexes, in registration order
    routes: DashMap<String, Vec<usize>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<VerifierRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            plugins: RwLock::new(Vec::new()),
            routes: DashMap::new(),
        })
    }

    /// Register a plugin and index it under every validator it listens on.
    /// Registration order decides probing order.
    pub fn register_plugin(&self, plugin: Arc<dyn BusinessLogicPlugin>) {
        let mut plugins = self.plugins.write().unwrap();
        let index = plugins.len();
        for validator_id in plugin.validator_ids() {
            self.routes.entry(validator_id).or_default().push(index);
        }
        info!(
            business_logic_id = plugin.business_logic_id(),
            "business logic plugin registered"
        );
        plugins.push(plugin);
    }

    /// Open monitors on every validator any registered plugin listens on,
    /// with this dispatcher as the single listener
    pub async fn start_monitoring(self: &Arc<Self>) -> OrchestratorResult<()> {
        let validator_ids: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        for validator_id in validator_ids {
            self.registry
                .get_verifier(
                    &validator_id,
                    "dispatcher",
                    None,
                    true,
                    Some(self.clone() as Arc<dyn EventListener>),
                )
                .await?;
        }
        Ok(())
    }

    /// Assign a trade id and hand the trade to its owning plugin
    pub async fn start_trade(
        &self,
        business_logic_id: &str,
        params: Value,
    ) -> OrchestratorResult<String> {
        let plugin = self.plugin_for(business_logic_id)?;
        let trade_id = generate_trade_id();
        info!(business_logic_id, trade_id = %trade_id, "starting trade");
        plugin.start_transaction(&trade_id, params).await?;
        Ok(trade_id)
    }

    pub async fn trade_status(
        &self,
        business_logic_id: &str,
        trade_id: &str,
    ) -> OrchestratorResult<Value> {
        let plugin = self.plugin_for(business_logic_id)?;
        plugin
            .operation_status(trade_id)
            .await
            .ok_or_else(|| OrchestratorError::TradeNotFound {
                trade_id: trade_id.to_string(),
            })
    }

    /// Ordered validator ids a trade type requires, from static config
    pub fn validators_for(&self, business_logic_id: &str) -> Vec<String> {
        self.registry.settings().validators_for(business_logic_id)
    }

    fn plugin_for(
        &self,
        business_logic_id: &str,
    ) -> OrchestratorResult<Arc<dyn BusinessLogicPlugin>> {
        self.plugins
            .read()
            .unwrap()
            .iter()
            .find(|p| p.business_logic_id() == business_logic_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::BusinessLogicNotFound {
                business_logic_id: business_logic_id.to_string(),
            })
    }

    fn candidates(&self, validator_id: &str) -> Vec<Arc<dyn BusinessLogicPlugin>> {
        let Some(indexes) = self.routes.get(validator_id) else {
            return Vec::new();
        };
        let plugins = self.plugins.read().unwrap();
        indexes.iter().map(|&i| plugins[i].clone()).collect()
    }
}

/// `YYYYMMDDHHmmssSSS-001`
fn generate_trade_id() -> String {
    format!("{}-001", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

#[async_trait]
impl EventListener for Dispatcher {
    async fn on_event(&self, event: LedgerEvent) {
        let candidates = self.candidates(&event.validator_id);
        if candidates.is_empty() {
            warn!(
                validator_id = %event.validator_id,
                "event from a validator no plugin listens on, dropping"
            );
            return;
        }

        // first plugin recognizing the shape fixes the fan-out
        let Some(count) = candidates
            .iter()
            .find_map(|p| match p.event_count(&event) {
                0 => None,
                n => Some(n),
            })
        else {
            warn!(
                validator_id = %event.validator_id,
                "no plugin recognizes this event, dropping"
            );
            return;
        };

        for index in 0..count {
            let owner = candidates
                .iter()
                .find(|p| p.extract_tx_id(&event, index).is_some());
            match owner {
                Some(plugin) => plugin.on_event(&event, index).await,
                None => {
                    debug!(
                        validator_id = %event.validator_id,
                        index, "sub-event claimed by nobody, skipping"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, OrchestratorConfig, Settings};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct StubPlugin {
        id: String,
        validator_ids: Vec<String>,
        /// sub-event count reported for recognized events
        count: usize,
        /// sub-indices this plugin claims
        claims: Vec<usize>,
        calls: StdMutex<Vec<usize>>,
    }

    impl StubPlugin {
        fn new(id: &str, validator_ids: &[&str], count: usize, claims: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                validator_ids: validator_ids.iter().map(|s| s.to_string()).collect(),
                count,
                claims: claims.to_vec(),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusinessLogicPlugin for StubPlugin {
        fn business_logic_id(&self) -> &str {
            &self.id
        }

        fn validator_ids(&self) -> Vec<String> {
            self.validator_ids.clone()
        }

        fn event_count(&self, _event: &LedgerEvent) -> usize {
            self.count
        }

        fn extract_tx_id(&self, _event: &LedgerEvent, index: usize) -> Option<String> {
            self.claims.contains(&index).then(|| format!("0x{}", index))
        }

        async fn start_transaction(&self, _trade_id: &str, _params: Value) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn on_event(&self, _event: &LedgerEvent, index: usize) {
            self.calls.lock().unwrap().push(index);
        }

        async fn operation_status(&self, _trade_id: &str) -> Option<Value> {
            Some(json!({"ok": true}))
        }
    }

    fn empty_settings() -> Settings {
        Settings {
            orchestrator: OrchestratorConfig {
                instance_id: "test".to_string(),
                max_correlation_id: 100,
                sync_request_timeout_ms: 100,
                reconnect_delay_ms: 60_000,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: None,
            validators: HashMap::new(),
            business_logic: HashMap::new(),
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(Arc::new(VerifierRegistry::new(empty_settings())))
    }

    fn event(validator_id: &str) -> LedgerEvent {
        LedgerEvent {
            validator_id: validator_id.to_string(),
            status: 200,
            tx_id: None,
            block_data: json!({"transactions": [{"hash": "0x0"}, {"hash": "0x1"}]}),
        }
    }

    #[tokio::test]
    async fn test_first_registered_plugin_wins_a_contested_sub_event() {
        let dispatcher = dispatcher();
        let first = StubPlugin::new("first", &["84jUisrs"], 2, &[0, 1]);
        let second = StubPlugin::new("second", &["84jUisrs"], 2, &[0, 1]);
        dispatcher.register_plugin(first.clone());
        dispatcher.register_plugin(second.clone());

        dispatcher.on_event(event("84jUisrs")).await;

        assert_eq!(first.calls(), vec![0, 1]);
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_sub_events_fall_through_to_later_plugins() {
        let dispatcher = dispatcher();
        let first = StubPlugin::new("first", &["84jUisrs"], 2, &[0]);
        let second = StubPlugin::new("second", &["84jUisrs"], 2, &[1]);
        dispatcher.register_plugin(first.clone());
        dispatcher.register_plugin(second.clone());

        dispatcher.on_event(event("84jUisrs")).await;

        assert_eq!(first.calls(), vec![0]);
        assert_eq!(second.calls(), vec![1]);
    }

    #[tokio::test]
    async fn test_event_from_unrouted_validator_is_dropped() {
        let dispatcher = dispatcher();
        let plugin = StubPlugin::new("only", &["84jUisrs"], 2, &[0, 1]);
        dispatcher.register_plugin(plugin.clone());

        dispatcher.on_event(event("r9IS4dDf")).await;
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_shape_is_dropped() {
        let dispatcher = dispatcher();
        let plugin = StubPlugin::new("only", &["84jUisrs"], 0, &[]);
        dispatcher.register_plugin(plugin.clone());

        dispatcher.on_event(event("84jUisrs")).await;
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_trade_assigns_timestamped_trade_id() {
        let dispatcher = dispatcher();
        dispatcher.register_plugin(StubPlugin::new("guks32pf", &["84jUisrs"], 1, &[0]));

        let trade_id = dispatcher
            .start_trade("guks32pf", json!({}))
            .await
            .unwrap();
        let pattern = regex::Regex::new(r"^\d{17}-001$").unwrap();
        assert!(pattern.is_match(&trade_id), "bad trade id: {}", trade_id);
    }

    #[tokio::test]
    async fn test_unknown_business_logic_is_rejected() {
        let dispatcher = dispatcher();
        assert!(matches!(
            dispatcher.start_trade("nope", json!({})).await,
            Err(OrchestratorError::BusinessLogicNotFound { .. })
        ));
    }
}
