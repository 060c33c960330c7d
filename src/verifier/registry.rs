//! Verifier registry
//!
//! Process-wide cache of verifier instances keyed by validator id,
//! constructed once at startup and passed by `Arc` into the dispatcher and
//! plugins. Guarantees one channel per validator id for the whole process;
//! every caller asking for the same validator gets the same instance.

use super::auth::EventAuthenticator;
use super::channel::{Channel, WsChannel};
use super::{EventListener, Verifier, VerifierTiming};
use crate::config::{Settings, ValidatorType};
use crate::error::{OrchestratorError, OrchestratorResult};

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub struct VerifierRegistry {
    settings: Settings,
    timing: VerifierTiming,
    channels: DashMap<String, Arc<dyn Channel>>,
    verifiers: DashMap<String, Arc<Verifier>>,
    /// Serializes first-time construction so two callers racing on the same
    /// validator id cannot open two channels
    creation: Mutex<()>,
}

impl VerifierRegistry {
    pub fn new(settings: Settings) -> Self {
        let timing = VerifierTiming::from(&settings.orchestrator);
        Self {
            settings,
            timing,
            channels: DashMap::new(),
            verifiers: DashMap::new(),
            creation: Mutex::new(()),
        }
    }

    /// Get or lazily create the verifier for `validator_id`.
    ///
    /// Idempotent per validator id: a cached instance is returned unchanged,
    /// and a different `subscriber_id` does not re-trigger monitor setup -
    /// callers wanting their own listener on a reused instance call
    /// `start_monitor` themselves. On first creation, when `monitor_mode` is
    /// set and `subscriber_id` is non-empty, the caller's listener is
    /// registered immediately.
    pub async fn get_verifier(
        &self,
        validator_id: &str,
        subscriber_id: &str,
        monitor_options: Option<Value>,
        monitor_mode: bool,
        listener: Option<Arc<dyn EventListener>>,
    ) -> OrchestratorResult<Arc<Verifier>> {
        if let Some(existing) = self.verifiers.get(validator_id) {
            return Ok(existing.clone());
        }

        let _guard = self.creation.lock().await;
        if let Some(existing) = self.verifiers.get(validator_id) {
            return Ok(existing.clone());
        }

        let descriptor = self
            .settings
            .validator(validator_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ValidatorNotFound {
                validator_id: validator_id.to_string(),
            })?;

        let (authenticator, channel) = match descriptor.validator_type {
            ValidatorType::Channel => {
                let authenticator =
                    EventAuthenticator::from_key_file(validator_id, &descriptor.auth_key_path)?;
                let channel = self
                    .channels
                    .entry(validator_id.to_string())
                    .or_insert_with(|| {
                        let opened: Arc<dyn Channel> = WsChannel::open(
                            validator_id,
                            &descriptor.endpoint_url,
                            Duration::from_millis(self.settings.orchestrator.reconnect_delay_ms),
                        );
                        opened
                    })
                    .clone();
                (Some(authenticator), Some(channel))
            }
            ValidatorType::Request => (None, None),
        };

        let verifier = Verifier::new(descriptor, authenticator, channel, self.timing.clone())?;
        self.verifiers
            .insert(validator_id.to_string(), verifier.clone());
        info!(validator_id, "verifier created");

        if monitor_mode && !subscriber_id.is_empty() {
            if let Some(listener) = listener {
                verifier
                    .start_monitor(subscriber_id, monitor_options, listener)
                    .await?;
            }
        }

        Ok(verifier)
    }

    /// Look up an already-created verifier without monitor setup
    pub async fn verifier(&self, validator_id: &str) -> OrchestratorResult<Arc<Verifier>> {
        self.get_verifier(validator_id, "", None, false, None).await
    }

    /// Attach an externally constructed verifier (custom transports,
    /// embedded test harnesses). Later `get_verifier` calls for the same id
    /// return this instance.
    pub fn attach(&self, verifier: Arc<Verifier>) {
        self.verifiers
            .insert(verifier.validator_id().to_string(), verifier);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, OrchestratorConfig, ValidatorDescriptor,
    };
    use async_trait::async_trait;
    use crate::verifier::LedgerEvent;
    use ed25519_dalek::SigningKey;
    use std::collections::HashMap;
    use std::io::Write;

    struct NullListener;

    #[async_trait]
    impl EventListener for NullListener {
        async fn on_event(&self, _event: LedgerEvent) {}
    }

    fn settings_with_channel_validator(auth_key_path: &str) -> Settings {
        let mut validators = HashMap::new();
        validators.insert(
            "84jUisrs".to_string(),
            ValidatorDescriptor {
                validator_id: "84jUisrs".to_string(),
                validator_type: ValidatorType::Channel,
                endpoint_url: "ws://127.0.0.1:1".to_string(),
                auth_key_path: auth_key_path.to_string(),
                supported_operations: vec![],
            },
        );
        Settings {
            orchestrator: OrchestratorConfig {
                instance_id: "test".to_string(),
                max_correlation_id: 100,
                sync_request_timeout_ms: 1_000,
                reconnect_delay_ms: 60_000,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: None,
            validators,
            business_logic: HashMap::new(),
        }
    }

    fn write_key_file() -> tempfile::NamedTempFile {
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", hex::encode(signing.verifying_key().as_bytes())).unwrap();
        file
    }

    #[tokio::test]
    async fn test_get_verifier_is_idempotent_per_validator_id() {
        let key_file = write_key_file();
        let registry =
            VerifierRegistry::new(settings_with_channel_validator(key_file.path().to_str().unwrap()));

        let first = registry
            .get_verifier("84jUisrs", "appA", None, true, Some(Arc::new(NullListener)))
            .await
            .unwrap();
        let second = registry
            .get_verifier("84jUisrs", "appB", None, true, Some(Arc::new(NullListener)))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        // the reused instance did not gain a listener for the second caller
        assert_eq!(first.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_validator_is_rejected() {
        let key_file = write_key_file();
        let registry =
            VerifierRegistry::new(settings_with_channel_validator(key_file.path().to_str().unwrap()));

        let result = registry.verifier("missing").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ValidatorNotFound { .. })
        ));
    }
}
