//! `rumqttc`-backed transport.
//!
//! `rumqttc` reports packet ids only through event-loop notifications, so
//! acknowledgment tracking works in two steps: a request waits in a FIFO
//! until the event loop reports the packet id it was sent with, then waits
//! in a map keyed by that id until the matching PUBACK or SUBACK arrives.
//! Requests are queued and handed to the client under one lock so the FIFO
//! order matches the order the event loop sees them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, TlsConfiguration,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{ConnectOptions, Connector, InboundMessage, InboundSender, Transport};
use crate::{AgentError, Result};

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

/// Largest packet accepted or sent; manifests can be large.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Pause between reconnect attempts after the connection dropped.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How often `disconnect` checks whether in-flight acks have drained.
const DRAIN_POLL: Duration = Duration::from_millis(10);

type Ack = std::result::Result<(), String>;

/// Connects to MQTT brokers with `rumqttc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl MqttConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive)
            .set_clean_session(options.clean_session)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if let Some(password) = &options.password {
            let username = options.username.clone().unwrap_or_default();
            mqtt.set_credentials(username, password.clone());
        }

        if let Some(ca) = &options.ca {
            mqtt.set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Simple {
                    ca: ca.clone(),
                    alpn: None,
                    client_auth: None,
                },
            ));
        }

        mqtt
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: InboundSender,
    ) -> Result<Box<dyn Transport>> {
        info!(
            client_id = %options.client_id,
            broker = %options.address(),
            tls = options.ca.is_some(),
            "Connecting to MQTT broker"
        );

        let (client, eventloop) = AsyncClient::new(Self::mqtt_options(options), REQUEST_CAPACITY);
        let acks = Arc::new(AckTracker::default());
        let (connected_tx, connected_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            acks.clone(),
            inbound,
            connected_tx,
        ));

        let connect_error = |reason: String| AgentError::Connect {
            client_id: options.client_id.clone(),
            reason,
        };

        let outcome = match tokio::time::timeout(options.ack_timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(connect_error(reason)),
            Ok(Err(_)) => Err(connect_error("event loop stopped".to_string())),
            Err(_) => Err(connect_error(format!(
                "no CONNACK within {:?}",
                options.ack_timeout
            ))),
        };

        if let Err(e) = outcome {
            driver.abort();
            return Err(e);
        }

        info!(client_id = %options.client_id, "Connected to MQTT broker");
        Ok(Box::new(MqttTransport {
            client,
            acks,
            driver: Mutex::new(Some(driver)),
            ack_timeout: options.ack_timeout,
        }))
    }
}

/// A live `rumqttc` connection.
struct MqttTransport {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    driver: Mutex<Option<JoinHandle<()>>>,
    ack_timeout: Duration,
}

impl MqttTransport {
    async fn await_ack(&self, what: &str, rx: oneshot::Receiver<Ack>) -> Result<()> {
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(AgentError::Transport(format!("{what}: {reason}"))),
            Ok(Err(_)) => Err(AgentError::Transport(format!("{what}: connection closed"))),
            Err(_) => Err(AgentError::Transport(format!(
                "{what}: not acknowledged within {:?}",
                self.ack_timeout
            ))),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<()> {
        let rx = self
            .acks
            .queue_publish(|| self.client.try_publish(topic, qos, false, payload.to_vec()))?;
        self.await_ack(&format!("publish to {topic}"), rx).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let rx = self
            .acks
            .queue_subscribe(filter, qos, || self.client.try_subscribe(filter, qos))?;
        self.await_ack(&format!("subscribe to {filter}"), rx).await
    }

    async fn disconnect(&self, quiesce: Duration) -> Result<()> {
        self.acks.close();

        let drained = tokio::time::timeout(quiesce, async {
            while self.acks.in_flight() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(in_flight = self.acks.in_flight(), "Disconnecting with acks in flight");
        }

        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()));

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(quiesce, &mut driver).await.is_err() {
                driver.abort();
            }
        }

        result
    }

    fn hold_reconnect(&self, hold: bool) {
        self.acks.hold_reconnect(hold);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

/// Runs the event loop: reports the first CONNACK, forwards inbound
/// publishes, resolves acks and reconnects after connection errors.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    acks: Arc<AckTracker>,
    inbound: InboundSender,
    connected: oneshot::Sender<Ack>,
) {
    let mut connected = Some(connected);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("connection refused: {:?}", ack.code);
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(Err(reason));
                        return;
                    }
                    warn!(%reason, "Broker refused reconnect");
                    continue;
                }

                if let Some(tx) = connected.take() {
                    let _ = tx.send(Ok(()));
                } else {
                    info!("Reconnected to MQTT broker, restoring subscriptions");
                    acks.resubscribe(&client);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if inbound.send(message).is_err() {
                    debug!(topic = %publish.topic, "Inbound receiver gone, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.publish_acked(ack.pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                acks.subscribe_acked(ack.pkid, rejected);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.publish_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.subscribe_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                acks.fail_all("disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = connected.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                if acks.is_closed() {
                    debug!(error = %e, "Connection ended after close");
                    acks.fail_all("disconnected");
                    return;
                }
                warn!(error = %e, "MQTT connection error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
                if acks.reconnect_held() {
                    debug!("Reconnect held while a replacement session connects");
                    while acks.reconnect_held() && !acks.is_closed() {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
                if acks.is_closed() {
                    acks.fail_all("disconnected");
                    return;
                }
            }
        }
    }
}

/// Pending acknowledgments and active subscriptions of one connection.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    unsent_publishes: VecDeque<oneshot::Sender<Ack>>,
    unsent_subscribes: VecDeque<Option<oneshot::Sender<Ack>>>,
    publishes: HashMap<u16, oneshot::Sender<Ack>>,
    subscribes: HashMap<u16, Option<oneshot::Sender<Ack>>>,
    subscriptions: Vec<(String, QoS)>,
    closed: bool,
    reconnect_held: bool,
}

impl AckTracker {
    fn queue_publish<E: std::fmt::Display>(
        &self,
        send: impl FnOnce() -> std::result::Result<(), E>,
    ) -> Result<oneshot::Receiver<Ack>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(AgentError::Transport("connection is closing".to_string()));
        }
        state.unsent_publishes.push_back(tx);
        if let Err(e) = send() {
            state.unsent_publishes.pop_back();
            return Err(AgentError::Transport(e.to_string()));
        }
        Ok(rx)
    }

    fn queue_subscribe<E: std::fmt::Display>(
        &self,
        filter: &str,
        qos: QoS,
        send: impl FnOnce() -> std::result::Result<(), E>,
    ) -> Result<oneshot::Receiver<Ack>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(AgentError::Transport("connection is closing".to_string()));
        }
        state.unsent_subscribes.push_back(Some(tx));
        if let Err(e) = send() {
            state.unsent_subscribes.pop_back();
            return Err(AgentError::Transport(e.to_string()));
        }
        state.subscriptions.retain(|(f, _)| f != filter);
        state.subscriptions.push((filter.to_string(), qos));
        Ok(rx)
    }

    fn resubscribe(&self, client: &AsyncClient) {
        let mut state = self.state.lock();
        let subscriptions = state.subscriptions.clone();
        for (filter, qos) in subscriptions {
            state.unsent_subscribes.push_back(None);
            if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                state.unsent_subscribes.pop_back();
                warn!(%filter, error = %e, "Failed to restore subscription");
            }
        }
    }

    fn publish_sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        // A retransmission after reconnect reuses a tracked id.
        if pkid != 0 && state.publishes.contains_key(&pkid) {
            return;
        }
        let Some(tx) = state.unsent_publishes.pop_front() else {
            return;
        };
        if pkid == 0 {
            // QoS 0: written to the socket is as acknowledged as it gets.
            let _ = tx.send(Ok(()));
        } else {
            state.publishes.insert(pkid, tx);
        }
    }

    fn publish_acked(&self, pkid: u16) {
        if let Some(tx) = self.state.lock().publishes.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(waiter) = state.unsent_subscribes.pop_front() {
            state.subscribes.insert(pkid, waiter);
        }
    }

    fn subscribe_acked(&self, pkid: u16, rejected: bool) {
        if let Some(Some(tx)) = self.state.lock().subscribes.remove(&pkid) {
            let _ = tx.send(if rejected {
                Err("subscription rejected by broker".to_string())
            } else {
                Ok(())
            });
        }
    }

    fn fail_all(&self, reason: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let waiters = state
            .unsent_publishes
            .drain(..)
            .chain(state.publishes.drain().map(|(_, tx)| tx))
            .collect::<Vec<_>>();
        for tx in waiters {
            let _ = tx.send(Err(reason.to_string()));
        }
        let subscribers = state
            .unsent_subscribes
            .drain(..)
            .chain(state.subscribes.drain().map(|(_, tx)| tx))
            .flatten()
            .collect::<Vec<_>>();
        for tx in subscribers {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    fn in_flight(&self) -> usize {
        let state = self.state.lock();
        state.unsent_publishes.len() + state.publishes.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn hold_reconnect(&self, hold: bool) {
        self.state.lock().reconnect_held = hold;
    }

    fn reconnect_held(&self) -> bool {
        self.state.lock().reconnect_held
    }
}
