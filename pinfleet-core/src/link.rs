//! Provider-side link to the coordination backend: register on connect,
//! heartbeat on a fixed cadence, re-emit inbound work as events, and
//! reconnect with a fixed delay up to a bounded attempt count.

use crate::config::ProviderConfig;
use crate::error::{FleetError, Result};
use crate::protocol::{Heartbeat, RegisterPayload, WelcomePayload, WireMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Dials the backend. Implemented over WebSocket by the agent binary;
/// kept behind a trait so the state machine stays transport-agnostic.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn LinkChannel>>;
}

/// One established duplex session. `recv` must be cancel-safe.
#[async_trait]
pub trait LinkChannel: Send {
    async fn send(&mut self, message: WireMessage) -> Result<()>;

    /// `None` means the peer closed the link cleanly.
    async fn recv(&mut self) -> Result<Option<WireMessage>>;
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    /// Backend acknowledged our registration.
    Registered(WelcomePayload),
    /// Any other inbound message, re-emitted for the consumer (job queue).
    Message(WireMessage),
    Disconnected { attempt: u32 },
    /// Reconnect budget exhausted; the link will not retry again.
    GaveUp { attempts: u32 },
}

/// Cheap clonable sender for pushing messages out over the link.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::UnboundedSender<WireMessage>,
}

impl LinkHandle {
    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| FleetError::LinkClosed("link task is gone".to_string()))
    }
}

pub struct ProviderLink {
    transport: Arc<dyn LinkTransport>,
    token: String,
    register: RegisterPayload,
    config: ProviderConfig,
}

impl ProviderLink {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        token: String,
        register: RegisterPayload,
        config: ProviderConfig,
    ) -> Self {
        Self {
            transport,
            token,
            register,
            config,
        }
    }

    /// Start the connect/heartbeat/reconnect loop. Events arrive on the
    /// returned receiver; outbound messages go through the handle.
    pub fn spawn(
        self,
    ) -> (
        LinkHandle,
        mpsc::UnboundedReceiver<LinkEvent>,
        JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_link(self, event_tx, outbound_rx));

        (
            LinkHandle {
                outbound: outbound_tx,
            },
            event_rx,
            task,
        )
    }
}

async fn run_link(
    link: ProviderLink,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
) {
    let mut failed_attempts = 0u32;

    loop {
        match link.transport.connect(&link.token).await {
            Ok(mut channel) => {
                failed_attempts = 0;
                let _ = events.send(LinkEvent::Connected);

                if let Err(error) =
                    run_session(&link, channel.as_mut(), &events, &mut outbound).await
                {
                    tracing::warn!("Provider link session ended: {}", error);
                }
            }
            Err(error) => {
                tracing::warn!("Provider link connect failed: {}", error);
            }
        }

        failed_attempts += 1;
        if failed_attempts >= link.config.max_reconnect_attempts {
            tracing::error!(
                "Provider link giving up after {} reconnect attempts",
                failed_attempts
            );
            let _ = events.send(LinkEvent::GaveUp {
                attempts: failed_attempts,
            });
            return;
        }

        let _ = events.send(LinkEvent::Disconnected {
            attempt: failed_attempts,
        });
        // Fixed delay between attempts; no backoff on this link.
        sleep(link.config.reconnect_delay()).await;
    }
}

enum Step {
    Inbound(Option<WireMessage>),
    Outbound(Option<WireMessage>),
    HeartbeatTick,
}

async fn run_session(
    link: &ProviderLink,
    channel: &mut dyn LinkChannel,
    events: &mpsc::UnboundedSender<LinkEvent>,
    outbound: &mut mpsc::UnboundedReceiver<WireMessage>,
) -> Result<()> {
    channel
        .send(WireMessage::Register(link.register.clone()))
        .await?;

    let period = link.config.heartbeat_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut awaiting_pong = false;
    let mut seq = 0u64;

    loop {
        let step = tokio::select! {
            inbound = channel.recv() => Step::Inbound(inbound?),
            outbound_message = outbound.recv() => Step::Outbound(outbound_message),
            _ = ticker.tick() => Step::HeartbeatTick,
        };

        match step {
            Step::Inbound(None) => {
                return Err(FleetError::LinkClosed("peer closed the link".to_string()));
            }
            Step::Inbound(Some(WireMessage::Pong(_))) => {
                awaiting_pong = false;
            }
            Step::Inbound(Some(WireMessage::Ping(beat))) => {
                channel.send(WireMessage::Pong(beat)).await?;
            }
            Step::Inbound(Some(WireMessage::Welcome(welcome))) => {
                let _ = events.send(LinkEvent::Registered(welcome));
            }
            Step::Inbound(Some(message)) => {
                let _ = events.send(LinkEvent::Message(message));
            }
            Step::Outbound(Some(message)) => {
                channel.send(message).await?;
            }
            Step::Outbound(None) => {
                return Err(FleetError::LinkClosed("link handle dropped".to_string()));
            }
            Step::HeartbeatTick => {
                if awaiting_pong {
                    return Err(FleetError::LinkClosed(
                        "backend missed a heartbeat pong".to_string(),
                    ));
                }
                seq += 1;
                channel.send(WireMessage::Ping(Heartbeat { seq })).await?;
                awaiting_pong = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PinRequestPayload, PinAckPayload};
    use std::sync::Mutex as StdMutex;

    struct PipeChannel {
        incoming: mpsc::UnboundedReceiver<WireMessage>,
        outgoing: mpsc::UnboundedSender<WireMessage>,
    }

    #[async_trait]
    impl LinkChannel for PipeChannel {
        async fn send(&mut self, message: WireMessage) -> Result<()> {
            self.outgoing
                .send(message)
                .map_err(|_| FleetError::LinkClosed("observer gone".to_string()))
        }

        async fn recv(&mut self) -> Result<Option<WireMessage>> {
            Ok(self.incoming.recv().await)
        }
    }

    /// Hands out pre-built sessions, then fails every further connect.
    struct ScriptedTransport {
        sessions: StdMutex<Vec<PipeChannel>>,
    }

    #[async_trait]
    impl LinkTransport for ScriptedTransport {
        async fn connect(&self, _token: &str) -> Result<Box<dyn LinkChannel>> {
            match self.sessions.lock().unwrap().pop() {
                Some(channel) => Ok(Box::new(channel)),
                None => Err(FleetError::Http("connection refused".to_string())),
            }
        }
    }

    struct Backend {
        to_link: mpsc::UnboundedSender<WireMessage>,
        from_link: mpsc::UnboundedReceiver<WireMessage>,
    }

    fn one_session_transport() -> (Arc<ScriptedTransport>, Backend) {
        let (to_link, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_link) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            sessions: StdMutex::new(vec![PipeChannel { incoming, outgoing }]),
        });
        (transport, Backend { to_link, from_link })
    }

    fn register_payload() -> RegisterPayload {
        RegisterPayload {
            provider_id: "p-1".to_string(),
            node_id: "p-1-node".to_string(),
            capacity: None,
        }
    }

    fn link_with(transport: Arc<ScriptedTransport>, max_attempts: u32) -> ProviderLink {
        let config = ProviderConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_delay_secs: 1,
            ..ProviderConfig::default()
        };
        ProviderLink::new(transport, "secret-token".to_string(), register_payload(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bounded_reconnect_attempts() {
        let transport = Arc::new(ScriptedTransport {
            sessions: StdMutex::new(Vec::new()),
        });
        let (_handle, mut events, task) = link_with(transport, 3).spawn();

        let mut disconnects = 0;
        loop {
            match events.recv().await.expect("event stream ended early") {
                LinkEvent::Disconnected { .. } => disconnects += 1,
                LinkEvent::GaveUp { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(disconnects, 2);

        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_first_and_emits_welcome() {
        let (transport, mut backend) = one_session_transport();
        let (_handle, mut events, _task) = link_with(transport, 10).spawn();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Register(payload)) if payload.provider_id == "p-1"
        ));

        backend
            .to_link
            .send(WireMessage::Welcome(WelcomePayload {
                provider_id: "p-1".to_string(),
                heartbeat_interval_secs: 30,
            }))
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                LinkEvent::Connected => continue,
                LinkEvent::Registered(welcome) => {
                    assert_eq!(welcome.provider_id, "p-1");
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_and_reemits_inbound_work() {
        let (transport, mut backend) = one_session_transport();
        let (_handle, mut events, _task) = link_with(transport, 10).spawn();

        // register, then the first 30 s heartbeat.
        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Register(_))
        ));
        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Ping(_))
        ));
        backend
            .to_link
            .send(WireMessage::Pong(Heartbeat { seq: 1 }))
            .unwrap();

        // Inbound work is re-emitted as a link event.
        backend
            .to_link
            .send(WireMessage::PinRequest(PinRequestPayload {
                cid: "bafy-1".to_string(),
                replicas: None,
            }))
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                LinkEvent::Message(WireMessage::PinRequest(request)) => {
                    assert_eq!(request.cid, "bafy-1");
                    break;
                }
                LinkEvent::Connected => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // The pong reset the heartbeat state: the next tick pings again.
        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Ping(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_backend_initiated_ping() {
        let (transport, mut backend) = one_session_transport();
        let (_handle, _events, _task) = link_with(transport, 10).spawn();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Register(_))
        ));

        backend
            .to_link
            .send(WireMessage::Ping(Heartbeat { seq: 7 }))
            .unwrap();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Pong(beat)) if beat.seq == 7
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pong_drops_session() {
        let (transport, mut backend) = one_session_transport();
        let (_handle, mut events, task) = link_with(transport, 1).spawn();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Register(_))
        ));
        // Swallow the first ping and never answer: the second tick kills
        // the session, and with a budget of one attempt the link gives up.
        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Ping(_))
        ));

        loop {
            match events.recv().await.unwrap() {
                LinkEvent::GaveUp { .. } => break,
                _ => continue,
            }
        }
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_messages_flow_through_handle() {
        let (transport, mut backend) = one_session_transport();
        let (handle, _events, _task) = link_with(transport, 10).spawn();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::Register(_))
        ));

        handle
            .send(WireMessage::PinConfirmed(PinAckPayload {
                cid: "bafy-1".to_string(),
            }))
            .unwrap();

        assert!(matches!(
            backend.from_link.recv().await,
            Some(WireMessage::PinConfirmed(ack)) if ack.cid == "bafy-1"
        ));
    }
}
