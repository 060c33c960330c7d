//! Validator channel transport
//!
//! A channel is the persistent, bidirectional connection shared by every
//! verifier wrapper for one validator id. The wire speaks JSON messages;
//! inbound traffic (responses, ledger events, control signals) is fanned out
//! through a broadcast channel so the verifier can multiplex pending requests
//! and monitor listeners over a single connection.

use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Outbound messages from orchestrator to validator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Submit a ledger operation, optionally correlated for a sync reply
    Request2 {
        contract: Value,
        method: Value,
        args: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
    },
    /// Subscribe to ledger events
    StartMonitor {
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    /// Unsubscribe from ledger events
    StopMonitor,
}

/// Result payload of a synchronous request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: u16,
    pub data: Value,
}

/// Canonical ledger success status
pub const STATUS_SUCCESS: u16 = 200;

/// Sentinel status for a request that saw no matching response in time
pub const STATUS_TIMEOUT: u16 = 504;

impl SyncResponse {
    /// The timeout sentinel: a normal resolution, not a failure
    pub fn timeout() -> Self {
        Self {
            status: STATUS_TIMEOUT,
            data: Value::Null,
        }
    }
}

/// Inbound messages and connection signals
///
/// `Response`, `EventReceived` and `MonitorError` arrive on the wire;
/// `Connected` and `Disconnected` are synthesized by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelInbound {
    Response { id: String, result: SyncResponse },
    EventReceived { status: u16, block_data: Value },
    MonitorError { message: String },
    Connected,
    Disconnected { reason: String },
}

/// Transport abstraction over one validator connection
///
/// Production uses [`WsChannel`]; tests drive a loopback implementation.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue a message for delivery. Resolves once the transport accepted it,
    /// not once the validator acted on it.
    async fn send(&self, msg: WireMessage) -> OrchestratorResult<()>;

    /// Subscribe to inbound traffic and connection signals
    fn subscribe(&self) -> broadcast::Receiver<ChannelInbound>;
}

/// WebSocket channel with automatic reconnection
pub struct WsChannel {
    validator_id: String,
    outbound: mpsc::Sender<WireMessage>,
    inbound: broadcast::Sender<ChannelInbound>,
}

impl WsChannel {
    /// Open a channel to the validator endpoint. The connection is
    /// established in the background and re-established after failures with
    /// the given delay; callers observe the lifecycle through `subscribe`.
    pub fn open(validator_id: &str, endpoint_url: &str, reconnect_delay: Duration) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, _) = broadcast::channel(1024);

        tokio::spawn(run_connection(
            validator_id.to_string(),
            endpoint_url.to_string(),
            out_rx,
            in_tx.clone(),
            reconnect_delay,
        ));

        Arc::new(Self {
            validator_id: validator_id.to_string(),
            outbound: out_tx,
            inbound: in_tx,
        })
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&self, msg: WireMessage) -> OrchestratorResult<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| OrchestratorError::Transport {
                validator_id: self.validator_id.clone(),
                message: "channel writer is gone".to_string(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelInbound> {
        self.inbound.subscribe()
    }
}

/// Connection lifecycle: connect, pump frames both ways, reconnect on failure
async fn run_connection(
    validator_id: String,
    endpoint_url: String,
    mut out_rx: mpsc::Receiver<WireMessage>,
    in_tx: broadcast::Sender<ChannelInbound>,
    reconnect_delay: Duration,
) {
    loop {
        match connect_async(&endpoint_url).await {
            Ok((ws, _)) => {
                debug!(%validator_id, "channel connected");
                let _ = in_tx.send(ChannelInbound::Connected);

                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        outbound = out_rx.recv() => {
                            let Some(msg) = outbound else {
                                // all senders dropped, channel is shutting down
                                return;
                            };
                            let text = match serde_json::to_string(&msg) {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(%validator_id, error = %e, "dropping unencodable message");
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                let _ = in_tx.send(ChannelInbound::Disconnected {
                                    reason: e.to_string(),
                                });
                                break;
                            }
                        }
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ChannelInbound>(text.as_str()) {
                                        Ok(inbound) => {
                                            let _ = in_tx.send(inbound);
                                        }
                                        Err(e) => {
                                            warn!(%validator_id, error = %e, "unrecognized frame");
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                Some(Ok(Message::Close(_))) | None => {
                                    let _ = in_tx.send(ChannelInbound::Disconnected {
                                        reason: "connection closed".to_string(),
                                    });
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    let _ = in_tx.send(ChannelInbound::Disconnected {
                                        reason: e.to_string(),
                                    });
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let _ = in_tx.send(ChannelInbound::Disconnected {
                    reason: e.to_string(),
                });
                warn!(%validator_id, error = %e, "channel connect failed");
            }
        }

        tokio::time::sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = WireMessage::Request2 {
            contract: serde_json::json!({}),
            method: serde_json::json!({"command": "sendRawTransaction"}),
            args: serde_json::json!(["0xdead"]),
            req_id: Some("84jUisrs_7".to_string()),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "request2");
        assert_eq!(encoded["req_id"], "84jUisrs_7");
    }

    #[test]
    fn test_start_monitor_omits_empty_options() {
        let msg = WireMessage::StartMonitor { options: None };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("options"));
    }

    #[test]
    fn test_response_decodes() {
        let raw = r#"{"type":"response","id":"84jUisrs_1","result":{"status":200,"data":{"ok":true}}}"#;
        let inbound: ChannelInbound = serde_json::from_str(raw).unwrap();
        match inbound {
            ChannelInbound::Response { id, result } => {
                assert_eq!(id, "84jUisrs_1");
                assert_eq!(result.status, 200);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
