//! Message transport seam.
//!
//! Both buses are reached through [`Connector`] and [`Transport`]. A
//! connector produces a live transport once the broker has acknowledged the
//! connection; inbound messages are pushed to a channel owned by the caller,
//! so the receiving side survives the transport being replaced.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
pub use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::Result;

/// A message received from a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Create an inbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Sender half of an inbound message channel.
pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;

/// Receiver half of an inbound message channel.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// Parameters for one broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// MQTT client id.
    pub client_id: String,
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Username, if the broker expects one.
    pub username: Option<String>,
    /// Password; for the cloud bridge this is the signed credential.
    pub password: Option<String>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Whether the broker should discard session state on connect.
    pub clean_session: bool,
    /// PEM CA bundle; `Some` enables TLS.
    pub ca: Option<Vec<u8>>,
    /// Bound on waiting for CONNACK, PUBACK and SUBACK.
    pub ack_timeout: Duration,
}

impl ConnectOptions {
    /// Plain-TCP options with a clean session and no credentials.
    #[must_use]
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            ca: None,
            ack_timeout: Duration::from_secs(30),
        }
    }

    /// A copy of these options carrying `password`.
    #[must_use]
    pub fn with_password(&self, password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..self.clone()
        }
    }

    /// Broker address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("tls", &self.ca.is_some())
            .field("ack_timeout", &self.ack_timeout)
            .finish()
    }
}

/// A live broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message, waiting for the broker acknowledgment required by
    /// `qos`.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the publish is rejected, not
    /// acknowledged in time, or the connection is closed.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<()>;

    /// Subscribe to a topic filter, waiting for the SUBACK.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription or does not
    /// acknowledge it in time.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    /// Disconnect, giving in-flight work up to `quiesce` to complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the disconnect request could not be issued.
    async fn disconnect(&self, quiesce: Duration) -> Result<()>;

    /// Suspend (`true`) or resume (`false`) automatic reconnects after the
    /// connection drops. A broker that sees a second session with the same
    /// client id drops the first one, which must not then take the id back.
    fn hold_reconnect(&self, hold: bool);
}

/// Factory for live transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a broker.
    ///
    /// Resolves only after the broker accepted the connection. Inbound
    /// messages are forwarded to `inbound` for as long as the transport
    /// lives.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AgentError::Connect`] if the broker is unreachable
    /// or refuses the connection.
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbound: InboundSender,
    ) -> Result<Box<dyn Transport>>;
}

/// In-memory transports for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::AgentError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    /// A publish recorded by [`MockConnector`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Published {
        /// Index of the session (successful connect) that sent it.
        pub session: usize,
        /// Topic.
        pub topic: String,
        /// Payload.
        pub payload: Vec<u8>,
        /// Requested quality of service.
        pub qos: QoS,
    }

    #[derive(Default)]
    struct Journal {
        connects: Vec<ConnectOptions>,
        published: Vec<Published>,
        subscriptions: Vec<(usize, String)>,
        disconnected: Vec<usize>,
        reconnect_holds: Vec<(usize, bool)>,
        inbound: Option<InboundSender>,
    }

    /// A connector whose transports record everything in a shared journal.
    #[derive(Default)]
    pub struct MockConnector {
        journal: Arc<Mutex<Journal>>,
        attempts: AtomicUsize,
        fail_next: AtomicBool,
        fail_publishes: Arc<AtomicBool>,
        fail_subscribes: Arc<AtomicBool>,
        gate: Mutex<Option<Arc<Semaphore>>>,
    }

    impl MockConnector {
        /// Create a new mock connector.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next connect attempt fail.
        pub fn fail_next_connect(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        /// Make the next connect attempt wait until a permit is added to the
        /// returned semaphore.
        pub fn hold_next_connect(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            *self.gate.lock() = Some(gate.clone());
            gate
        }

        /// Make every publish fail until cleared.
        pub fn fail_publishes(&self, fail: bool) {
            self.fail_publishes.store(fail, Ordering::SeqCst);
        }

        /// Make every subscribe fail until cleared.
        pub fn fail_subscribes(&self, fail: bool) {
            self.fail_subscribes.store(fail, Ordering::SeqCst);
        }

        /// Number of connect attempts, successful or not.
        #[must_use]
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Options of every successful connect, in order.
        #[must_use]
        pub fn connects(&self) -> Vec<ConnectOptions> {
            self.journal.lock().connects.clone()
        }

        /// Every publish, in order.
        #[must_use]
        pub fn published(&self) -> Vec<Published> {
            self.journal.lock().published.clone()
        }

        /// Publishes sent to `topic`, in order.
        #[must_use]
        pub fn published_to(&self, topic: &str) -> Vec<Published> {
            self.journal
                .lock()
                .published
                .iter()
                .filter(|p| p.topic == topic)
                .cloned()
                .collect()
        }

        /// Filters subscribed by the given session.
        #[must_use]
        pub fn subscriptions(&self, session: usize) -> Vec<String> {
            self.journal
                .lock()
                .subscriptions
                .iter()
                .filter(|(s, _)| *s == session)
                .map(|(_, f)| f.clone())
                .collect()
        }

        /// Sessions that have been disconnected.
        #[must_use]
        pub fn disconnected(&self) -> Vec<usize> {
            self.journal.lock().disconnected.clone()
        }

        /// Every reconnect hold change as `(session, held)`, in order.
        #[must_use]
        pub fn reconnect_holds(&self) -> Vec<(usize, bool)> {
            self.journal.lock().reconnect_holds.clone()
        }

        /// Push an inbound message as if the broker delivered it.
        ///
        /// Returns `false` if nothing is connected or the receiver is gone.
        pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
            self.journal
                .lock()
                .inbound
                .as_ref()
                .is_some_and(|tx| tx.send(InboundMessage::new(topic, payload)).is_ok())
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            options: &ConnectOptions,
            inbound: InboundSender,
        ) -> Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AgentError::Connect {
                    client_id: options.client_id.clone(),
                    reason: "mock connect failure".to_string(),
                });
            }

            let mut journal = self.journal.lock();
            journal.connects.push(options.clone());
            journal.inbound = Some(inbound);
            let session = journal.connects.len() - 1;

            Ok(Box::new(MockTransport {
                session,
                journal: self.journal.clone(),
                fail_publishes: self.fail_publishes.clone(),
                fail_subscribes: self.fail_subscribes.clone(),
                closed: AtomicBool::new(false),
            }))
        }
    }

    struct MockTransport {
        session: usize,
        journal: Arc<Mutex<Journal>>,
        fail_publishes: Arc<AtomicBool>,
        fail_subscribes: Arc<AtomicBool>,
        closed: AtomicBool,
    }

    impl MockTransport {
        fn ensure_open(&self) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AgentError::Transport(format!(
                    "session {} is disconnected",
                    self.session
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<()> {
            self.ensure_open()?;
            if self.fail_publishes.load(Ordering::SeqCst) {
                return Err(AgentError::Transport("mock publish failure".to_string()));
            }
            self.journal.lock().published.push(Published {
                session: self.session,
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
            });
            Ok(())
        }

        async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
            self.ensure_open()?;
            if self.fail_subscribes.load(Ordering::SeqCst) {
                return Err(AgentError::Transport("mock subscribe failure".to_string()));
            }
            self.journal
                .lock()
                .subscriptions
                .push((self.session, filter.to_string()));
            Ok(())
        }

        async fn disconnect(&self, _quiesce: Duration) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.journal.lock().disconnected.push(self.session);
            Ok(())
        }

        fn hold_reconnect(&self, hold: bool) {
            self.journal.lock().reconnect_holds.push((self.session, hold));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockConnector;
    use super::*;

    #[test]
    fn password_is_redacted() {
        let options = ConnectOptions::new("toe", "hmq", 1883).with_password("secret-token");
        let debug = format!("{options:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("<redacted>"));
        assert_eq!(options.password.as_deref(), Some("secret-token"));
        assert_eq!(options.address(), "hmq:1883");
    }

    #[tokio::test]
    async fn mock_transport_records_and_closes() {
        let connector = MockConnector::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = connector
            .connect(&ConnectOptions::new("toe", "hmq", 1883), tx)
            .await
            .unwrap();
        transport.subscribe("toe/events", QoS::AtMostOnce).await.unwrap();
        transport
            .publish("toe/x", b"hello", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert!(connector.deliver("toe/events", b"ping"));
        assert_eq!(rx.recv().await.unwrap(), InboundMessage::new("toe/events", "ping"));

        transport.disconnect(Duration::ZERO).await.unwrap();
        assert!(transport.publish("toe/x", b"late", QoS::AtLeastOnce).await.is_err());

        assert_eq!(connector.subscriptions(0), ["toe/events"]);
        assert_eq!(connector.published_to("toe/x").len(), 1);
        assert_eq!(connector.disconnected(), [0]);
    }

    #[tokio::test]
    async fn mock_connect_failure() {
        let connector = MockConnector::new();
        connector.fail_next_connect();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = connector
            .connect(&ConnectOptions::new("toe", "hmq", 1883), tx.clone())
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal_at_startup());

        assert!(connector
            .connect(&ConnectOptions::new("toe", "hmq", 1883), tx)
            .await
            .is_ok());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.connects().len(), 1);
    }
}
