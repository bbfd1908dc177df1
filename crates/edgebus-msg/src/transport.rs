//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Stream of raw inbound frames for one subscribed topic.
pub type RawStream = BoxStream<'static, Bytes>;

/// Opaque failures reported by transport collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The operation did not complete within its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The transport refused the operation for the current identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The underlying connection failed.
    #[error("connection failure: {0}")]
    Connection(String),
    /// The transport has not been activated yet.
    #[error("transport is not active")]
    NotActive,
}

/// Interface implemented by local-bus and broker clients.
///
/// Connection lifecycle, retry and backoff belong to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;

    /// Establish the connection.
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Subscribe to a topic, yielding raw frames as they arrive.
    async fn subscribe(&self, topic: &str) -> Result<RawStream, TransportError>;

    /// Publish raw bytes to a topic, resolving once the transport acknowledges.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// A frame recorded by [`InMemoryTransport::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedFrame {
    /// Topic the frame was published to.
    pub topic: String,
    /// Raw wire bytes.
    pub payload: Bytes,
}

impl PublishedFrame {
    /// Decode the frame as an envelope.
    pub fn envelope(&self) -> crate::Result<Envelope> {
        Envelope::parse(&self.payload)
    }
}

#[derive(Default)]
struct InMemoryState {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>,
    published: Mutex<Vec<PublishedFrame>>,
    subscribe_calls: Mutex<Vec<String>>,
    publish_latency: Mutex<Option<Duration>>,
    fail_publishes: AtomicBool,
    connected: AtomicBool,
}

/// Loopback transport: published frames are recorded and delivered to
/// subscribers of the same topic. Frames can also be injected directly to
/// simulate traffic from other components.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<InMemoryState>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a raw frame to every current subscriber of `topic`.
    /// Returns the number of subscribers reached.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut subscribers = self.state.subscribers.lock();
        let Some(senders) = subscribers.get_mut(topic) else {
            return 0;
        };
        senders.retain(|sender| sender.send(payload.clone()).is_ok());
        senders.len()
    }

    /// Every frame published so far.
    pub fn published(&self) -> Vec<PublishedFrame> {
        self.state.published.lock().clone()
    }

    /// Frames published to a specific topic.
    pub fn published_on(&self, topic: &str) -> Vec<PublishedFrame> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|frame| frame.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics passed to [`Transport::subscribe`], in call order.
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.state.subscribe_calls.lock().clone()
    }

    /// Make every subsequent publish fail with a connection error.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent publish acknowledgement.
    pub fn set_publish_latency(&self, latency: Option<Duration>) {
        *self.state.publish_latency.lock() = latency;
    }

    /// Whether [`Transport::connect`] has been called.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<RawStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .subscribers
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        self.state.subscribe_calls.lock().push(topic.to_owned());
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let latency = *self.state.publish_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!(
                "publish to {topic} rejected by injected failure"
            )));
        }
        self.state.published.lock().push(PublishedFrame {
            topic: topic.to_owned(),
            payload: payload.clone(),
        });
        self.inject(topic, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeOptions;

    #[tokio::test]
    async fn in_memory_transport_publish_and_subscribe() {
        let transport = InMemoryTransport::new();
        transport.connect().await.expect("connect");
        assert!(transport.is_connected());

        let mut stream = transport.subscribe("a/b").await.expect("subscribe");
        let envelope = Envelope::build(EnvelopeOptions::new().with_route("X.y"));
        transport
            .publish("a/b", envelope.to_bytes().unwrap())
            .await
            .expect("publish succeeds");

        let frame = stream.next().await.expect("frame delivered");
        assert_eq!(Envelope::parse(&frame).unwrap(), envelope);
        assert_eq!(transport.published_on("a/b").len(), 1);
        assert_eq!(transport.published()[0].envelope().unwrap().route, "X.y");
        assert_eq!(transport.subscribe_calls(), vec!["a/b".to_owned()]);
    }

    #[tokio::test]
    async fn inject_reaches_only_matching_topic() {
        let transport = InMemoryTransport::new();
        let mut ingress = transport.subscribe("ingress").await.unwrap();
        let _other = transport.subscribe("other").await.unwrap();

        assert_eq!(transport.inject("ingress", &b"raw"[..]), 1);
        assert_eq!(transport.inject("nobody-listens", &b"raw"[..]), 0);
        assert_eq!(ingress.next().await.unwrap(), Bytes::from_static(b"raw"));
    }

    #[tokio::test]
    async fn injected_failure_is_reported() {
        let transport = InMemoryTransport::new();
        transport.set_fail_publishes(true);
        let err = transport
            .publish("t", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert!(transport.published().is_empty());
    }
}
