//! Backend end of provider links: WebSocket upgrade, bearer-token check,
//! registration handshake, and message pumping into the registry.

use super::{LinkQuery, ServerState};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pinfleet_core::{
    FleetError, ProviderSink, Result, WireMessage, CLOSE_POLICY_VIOLATION,
};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

struct WsProviderSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ProviderSink for WsProviderSink {
    async fn send(&self, message: WireMessage) -> Result<()> {
        let text = message.to_json()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|error| FleetError::Http(error.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|error| FleetError::Http(error.to_string()))
    }
}

pub(crate) async fn provider_link(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LinkQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_provider_socket(state, socket, query.token))
}

async fn handle_provider_socket(state: Arc<ServerState>, socket: WebSocket, token: String) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(WsProviderSink {
        sink: Mutex::new(sink),
    });

    if !state.registry.authorize(&token) {
        tracing::warn!("Provider link rejected: invalid bearer token");
        let _ = sink
            .close(CLOSE_POLICY_VIOLATION, "invalid bearer token")
            .await;
        return;
    }

    // The first frame on an authorized link must be `register`.
    let register = match timeout(REGISTER_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match WireMessage::parse(&text) {
            Ok(WireMessage::Register(payload)) => payload,
            Ok(other) => {
                tracing::warn!(
                    "Provider link sent {} before registering",
                    message_type(&other)
                );
                let _ = sink
                    .close(CLOSE_POLICY_VIOLATION, "expected register message")
                    .await;
                return;
            }
            Err(error) => {
                tracing::warn!("Provider link sent malformed registration: {}", error);
                let _ = sink.close(CLOSE_POLICY_VIOLATION, "malformed message").await;
                return;
            }
        },
        _ => {
            let _ = sink
                .close(CLOSE_POLICY_VIOLATION, "registration deadline exceeded")
                .await;
            return;
        }
    };

    let welcome = match state.registry.register(register, sink.clone()).await {
        Ok(welcome) => welcome,
        Err(error) => {
            tracing::warn!("Provider registration rejected: {}", error);
            let _ = sink
                .close(CLOSE_POLICY_VIOLATION, &error.to_string())
                .await;
            return;
        }
    };
    let provider_id = welcome.provider_id.clone();

    if let Err(error) = sink.send(WireMessage::Welcome(welcome)).await {
        tracing::warn!("Welcome to provider {} failed: {}", provider_id, error);
        state.registry.unregister(&provider_id).await;
        return;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match WireMessage::parse(&text) {
                Ok(message) => {
                    if handle_message(&state, &provider_id, &sink, message)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        "Provider {} sent a malformed message, closing link: {}",
                        provider_id,
                        error
                    );
                    let _ = sink.close(CLOSE_POLICY_VIOLATION, "malformed message").await;
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::debug!("Provider {} socket error: {}", provider_id, error);
                break;
            }
        }
    }

    state.registry.unregister(&provider_id).await;
}

async fn handle_message(
    state: &Arc<ServerState>,
    provider_id: &str,
    sink: &Arc<WsProviderSink>,
    message: WireMessage,
) -> ControlFlow<()> {
    match message {
        WireMessage::Ping(beat) => {
            state.registry.heartbeat(provider_id).await;
            if let Err(error) = sink.send(WireMessage::Pong(beat)).await {
                tracing::debug!("Pong to provider {} failed: {}", provider_id, error);
                return ControlFlow::Break(());
            }
        }
        WireMessage::Pong(_) => {
            state.registry.heartbeat(provider_id).await;
        }
        WireMessage::CapacityUpdate(capacity) => {
            state.registry.capacity_update(provider_id, capacity).await;
        }
        WireMessage::GoingOffline(payload) => {
            tracing::info!(
                "Provider {} going offline: {}",
                provider_id,
                payload.reason.as_deref().unwrap_or("no reason given")
            );
            state.registry.mark_offline(provider_id).await;
            return ControlFlow::Break(());
        }
        WireMessage::PinConfirmed(ack) => {
            tracing::info!("Provider {} confirmed pin of {}", provider_id, ack.cid);
        }
        WireMessage::PinFailed(failure) => {
            tracing::warn!(
                "Provider {} failed to pin {}: {}",
                provider_id,
                failure.cid,
                failure.reason
            );
        }
        WireMessage::UnpinConfirmed(ack) => {
            tracing::info!("Provider {} confirmed unpin of {}", provider_id, ack.cid);
        }
        WireMessage::ContractAccepted(ack) => {
            tracing::info!(
                "Provider {} accepted contract {}",
                provider_id,
                ack.contract_id
            );
        }
        WireMessage::ContractFailed(failure) => {
            tracing::warn!(
                "Provider {} rejected contract {}: {}",
                provider_id,
                failure.contract_id,
                failure.reason
            );
        }
        other => {
            tracing::debug!(
                "Ignoring unexpected {} message from provider {}",
                message_type(&other),
                provider_id
            );
        }
    }
    ControlFlow::Continue(())
}

fn message_type(message: &WireMessage) -> &'static str {
    match message {
        WireMessage::Register(_) => "register",
        WireMessage::Welcome(_) => "welcome",
        WireMessage::Ping(_) => "ping",
        WireMessage::Pong(_) => "pong",
        WireMessage::StorageJob(_) => "storage_job",
        WireMessage::PinRequest(_) => "pin_request",
        WireMessage::PinConfirmed(_) => "pin_confirmed",
        WireMessage::PinFailed(_) => "pin_failed",
        WireMessage::UnpinRequest(_) => "unpin_request",
        WireMessage::UnpinConfirmed(_) => "unpin_confirmed",
        WireMessage::ContractAccepted(_) => "contract_accepted",
        WireMessage::ContractFailed(_) => "contract_failed",
        WireMessage::CapacityUpdate(_) => "capacity_update",
        WireMessage::CapacityRequest(_) => "capacity_request",
        WireMessage::PaymentReceived(_) => "payment_received",
        WireMessage::GoingOffline(_) => "going_offline",
    }
}
