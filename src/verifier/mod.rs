//! Verifier - uniform client over one validator
//!
//! A verifier hides the transport flavor of a validator behind one API:
//! fire-and-forget submission, correlated synchronous requests, and a
//! multiplexed event monitor. All verifier wrappers for one validator id
//! share a single channel for the lifetime of the process.

pub mod auth;
pub mod channel;
pub mod registry;

pub use auth::EventAuthenticator;
pub use channel::{
    Channel, ChannelInbound, SyncResponse, WireMessage, WsChannel, STATUS_SUCCESS, STATUS_TIMEOUT,
};
pub use registry::VerifierRegistry;

use crate::config::{OrchestratorConfig, ValidatorDescriptor, ValidatorType};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Placeholder transaction id attached to request-mode events, which carry no
/// per-request correlation by protocol design
pub const REQUEST_MODE_TX_ID: &str = "request-mode-txid-00001";

/// An authenticated event emitted by a validator
#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub validator_id: String,
    pub status: u16,
    /// Set only for synthesized request-mode events
    pub tx_id: Option<String>,
    pub block_data: Value,
}

/// Receiver of authenticated ledger events
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Runs on the delivering validator's inbound pump, which processes one
    /// event to completion before the next. A `send_sync_request` to that
    /// same validator from inside this callback can never see its response
    /// (the pump is busy here) and always resolves with the timeout
    /// sentinel; sync requests issued here must target a different
    /// validator.
    async fn on_event(&self, event: LedgerEvent);
}

/// Timing and bookkeeping limits shared by all verifiers
#[derive(Debug, Clone)]
pub struct VerifierTiming {
    pub sync_request_timeout: Duration,
    pub max_correlation_id: u64,
}

impl From<&OrchestratorConfig> for VerifierTiming {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            sync_request_timeout: Duration::from_millis(config.sync_request_timeout_ms),
            max_correlation_id: config.max_correlation_id,
        }
    }
}

type PendingSender = oneshot::Sender<OrchestratorResult<SyncResponse>>;

/// In-process client for one validator
pub struct Verifier {
    descriptor: ValidatorDescriptor,
    timing: VerifierTiming,
    counter: Mutex<u64>,
    pending: DashMap<String, PendingSender>,
    listeners: DashMap<String, Arc<dyn EventListener>>,
    monitor_started: AtomicBool,
    monitor_options: Mutex<Option<Value>>,
    channel: Option<Arc<dyn Channel>>,
    authenticator: Option<EventAuthenticator>,
    http: reqwest::Client,
}

impl Verifier {
    /// Build a verifier over an already-opened channel (channel mode) or a
    /// bare HTTP client (request mode). Spawns the inbound pump for channel
    /// mode; the returned `Arc` is the only handle callers should hold.
    pub fn new(
        descriptor: ValidatorDescriptor,
        authenticator: Option<EventAuthenticator>,
        channel: Option<Arc<dyn Channel>>,
        timing: VerifierTiming,
    ) -> OrchestratorResult<Arc<Self>> {
        if descriptor.validator_type == ValidatorType::Channel {
            if channel.is_none() {
                return Err(OrchestratorError::Config(format!(
                    "validator {} is channel-based but no channel was supplied",
                    descriptor.validator_id
                )));
            }
            if authenticator.is_none() {
                return Err(OrchestratorError::Config(format!(
                    "validator {} is channel-based but has no authenticator",
                    descriptor.validator_id
                )));
            }
        }

        let inbound = channel.as_ref().map(|c| c.subscribe());

        let verifier = Arc::new(Self {
            descriptor,
            timing,
            counter: Mutex::new(1),
            pending: DashMap::new(),
            listeners: DashMap::new(),
            monitor_started: AtomicBool::new(false),
            monitor_options: Mutex::new(None),
            channel,
            authenticator,
            http: reqwest::Client::new(),
        });

        if let Some(rx) = inbound {
            tokio::spawn(pump_inbound(verifier.clone(), rx));
        }

        Ok(verifier)
    }

    pub fn validator_id(&self) -> &str {
        &self.descriptor.validator_id
    }

    pub fn validator_type(&self) -> ValidatorType {
        self.descriptor.validator_type
    }

    /// Submit an operation without waiting for ledger confirmation.
    ///
    /// Resolves once the transport accepted the payload; confirmation arrives
    /// later as a monitored event.
    pub async fn send_async_request(
        &self,
        contract: Value,
        method: Value,
        args: Value,
    ) -> OrchestratorResult<()> {
        debug!(
            validator_id = self.validator_id(),
            %method,
            "send_async_request"
        );
        match self.descriptor.validator_type {
            ValidatorType::Channel => {
                self.channel_ref()?
                    .send(WireMessage::Request2 {
                        contract,
                        method,
                        args,
                        req_id: None,
                    })
                    .await
            }
            ValidatorType::Request => self.request_mode_operation(method, args).await,
        }
    }

    /// Submit an operation and wait for the correlated response.
    ///
    /// A missing response is a normal outcome: after the configured timeout
    /// the call resolves with the 504 sentinel instead of failing. Only
    /// transport-level failures surface as errors.
    pub async fn send_sync_request(
        &self,
        contract: Value,
        method: Value,
        args: Value,
    ) -> OrchestratorResult<SyncResponse> {
        if self.descriptor.validator_type != ValidatorType::Channel {
            return Err(OrchestratorError::Protocol(format!(
                "synchronous requests are not supported for validator type of {}",
                self.validator_id()
            )));
        }

        let req_id = self.next_correlation_id().await;
        debug!(validator_id = self.validator_id(), %req_id, "send_sync_request");

        let (tx, rx) = oneshot::channel();
        self.pending.insert(req_id.clone(), tx);

        if let Err(e) = self
            .channel_ref()?
            .send(WireMessage::Request2 {
                contract,
                method,
                args,
                req_id: Some(req_id.clone()),
            })
            .await
        {
            self.pending.remove(&req_id);
            return Err(e);
        }

        match timeout(self.timing.sync_request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::Transport {
                validator_id: self.validator_id().to_string(),
                message: "channel closed while awaiting response".to_string(),
            }),
            Err(_) => {
                self.pending.remove(&req_id);
                debug!(
                    validator_id = self.validator_id(),
                    %req_id, "sync request timed out"
                );
                Ok(SyncResponse::timeout())
            }
        }
    }

    /// Register an event listener under `subscriber_id`.
    ///
    /// The subscribe control message goes out only for the first listener;
    /// later subscribers share the already-running monitor.
    pub async fn start_monitor(
        &self,
        subscriber_id: &str,
        options: Option<Value>,
        listener: Arc<dyn EventListener>,
    ) -> OrchestratorResult<()> {
        debug!(
            validator_id = self.validator_id(),
            subscriber_id, "start_monitor"
        );
        self.listeners.insert(subscriber_id.to_string(), listener);

        if self.descriptor.validator_type == ValidatorType::Channel
            && !self.monitor_started.swap(true, Ordering::SeqCst)
        {
            *self.monitor_options.lock().await = options.clone();
            self.channel_ref()?
                .send(WireMessage::StartMonitor { options })
                .await?;
        }
        Ok(())
    }

    /// Remove one listener, or all of them when no id is given. The
    /// unsubscribe control message is sent only once the map is empty; the
    /// shared channel stays open for other subscribers.
    pub async fn stop_monitor(&self, subscriber_id: Option<&str>) -> OrchestratorResult<()> {
        debug!(
            validator_id = self.validator_id(),
            subscriber_id, "stop_monitor"
        );
        match subscriber_id {
            Some(id) => {
                self.listeners.remove(id);
            }
            None => self.listeners.clear(),
        }

        if self.listeners.is_empty()
            && self.monitor_started.swap(false, Ordering::SeqCst)
            && self.descriptor.validator_type == ValidatorType::Channel
        {
            self.channel_ref()?.send(WireMessage::StopMonitor).await?;
        }
        Ok(())
    }

    /// Number of currently registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Request-mode submission: one POST per operation, response broadcast to
    /// every listener as a synthesized event with a placeholder transaction
    /// id. No per-request correlation exists in this mode.
    async fn request_mode_operation(&self, method: Value, args: Value) -> OrchestratorResult<()> {
        let operation = method
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrchestratorError::Protocol("request-mode method has no command".to_string())
            })?;

        let url = format!("{}{}", self.descriptor.endpoint_url, operation);
        let body = args.get("args").cloned().unwrap_or(args);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport {
                validator_id: self.validator_id().to_string(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        let event = LedgerEvent {
            validator_id: self.validator_id().to_string(),
            status,
            tx_id: Some(REQUEST_MODE_TX_ID.to_string()),
            block_data: Value::Array(vec![payload]),
        };
        self.fan_out(event).await;
        Ok(())
    }

    /// Deliver one event to every registered listener
    async fn fan_out(&self, event: LedgerEvent) {
        let listeners: Vec<Arc<dyn EventListener>> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener.on_event(event.clone()).await;
        }
    }

    fn channel_ref(&self) -> OrchestratorResult<&Arc<dyn Channel>> {
        self.channel
            .as_ref()
            .ok_or_else(|| OrchestratorError::Transport {
                validator_id: self.validator_id().to_string(),
                message: "no channel for validator".to_string(),
            })
    }

    /// Correlation id generation: `"{validator_id}_{counter}"`, wrapping back
    /// to 1 past the configured maximum
    async fn next_correlation_id(&self) -> String {
        let mut counter = self.counter.lock().await;
        if *counter > self.timing.max_correlation_id {
            *counter = 1;
        }
        let id = format!("{}_{}", self.descriptor.validator_id, *counter);
        *counter += 1;
        id
    }

    /// Resolve a pending sync request with an authenticated response.
    ///
    /// An envelope that fails authentication is logged and left pending so
    /// the caller sees the ordinary timeout sentinel.
    fn handle_response(&self, id: String, result: SyncResponse) {
        let Some((req_id, sender)) = self.pending.remove(&id) else {
            debug!(
                validator_id = self.validator_id(),
                %id, "response with no pending request"
            );
            return;
        };

        let Some(authenticator) = &self.authenticator else {
            let _ = sender.send(Ok(result));
            return;
        };

        match authenticator.verify(&result.data) {
            Ok(decoded) => {
                let _ = sender.send(Ok(SyncResponse {
                    status: result.status,
                    data: decoded,
                }));
            }
            Err(e) => {
                error!(validator_id = self.validator_id(), error = %e, "response authentication failed");
                self.pending.insert(req_id, sender);
            }
        }
    }

    /// Authenticate one inbound event, then fan it out. A failed signature
    /// drops the event for all listeners.
    async fn handle_event(&self, status: u16, block_data: Value) {
        if self.listeners.is_empty() {
            return;
        }

        let Some(authenticator) = &self.authenticator else {
            return;
        };

        let decoded = match authenticator.verify(&block_data) {
            Ok(d) => d,
            Err(e) => {
                error!(validator_id = self.validator_id(), error = %e, "event authentication failed, dropping");
                return;
            }
        };

        self.fan_out(LedgerEvent {
            validator_id: self.validator_id().to_string(),
            status,
            tx_id: None,
            block_data: decoded,
        })
        .await;
    }

    /// Reject every pending sync request after a transport failure
    fn reject_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(OrchestratorError::Transport {
                    validator_id: self.validator_id().to_string(),
                    message: reason.to_string(),
                }));
            }
        }
    }
}

/// Inbound pump: consumes channel traffic for the lifetime of the process.
/// Events on one channel are processed to completion in arrival order.
async fn pump_inbound(verifier: Arc<Verifier>, mut rx: broadcast::Receiver<ChannelInbound>) {
    loop {
        match rx.recv().await {
            Ok(ChannelInbound::Response { id, result }) => {
                verifier.handle_response(id, result);
            }
            Ok(ChannelInbound::EventReceived { status, block_data }) => {
                verifier.handle_event(status, block_data).await;
            }
            Ok(ChannelInbound::MonitorError { message }) => {
                error!(
                    validator_id = verifier.validator_id(),
                    %message, "monitor error from validator"
                );
            }
            Ok(ChannelInbound::Connected) => {
                // re-subscribe after a reconnect while listeners exist
                if verifier.monitor_started.load(Ordering::SeqCst)
                    && !verifier.listeners.is_empty()
                {
                    let options = verifier.monitor_options.lock().await.clone();
                    if let Ok(channel) = verifier.channel_ref() {
                        if let Err(e) = channel.send(WireMessage::StartMonitor { options }).await {
                            warn!(validator_id = verifier.validator_id(), error = %e, "re-subscribe failed");
                        }
                    }
                }
            }
            Ok(ChannelInbound::Disconnected { reason }) => {
                warn!(
                    validator_id = verifier.validator_id(),
                    %reason, "channel disconnected"
                );
                verifier.reject_pending(&reason);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    validator_id = verifier.validator_id(),
                    skipped, "inbound pump lagged"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
