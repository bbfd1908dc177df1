//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Publish fan-out and subscription management over the local and broker transports.
//!
//! Each transport occupies a slot holding its requested subscriptions. While a
//! slot is inactive, subscriptions are only recorded; activation connects the
//! transport, replays the recorded set and starts one receive loop per topic.
//! Receive loops forward raw frames to the channel handed to
//! [`Dispatcher::activate`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgebus_logging::{log_lifecycle_event, LifecycleOutcome, MessageContext};
use futures::StreamExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::envelope::{Envelope, EnvelopeOptions};
use crate::logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
use crate::protocol::{Protocol, ProtocolSelector};
use crate::subscriptions::SubscriptionSet;
use crate::transport::{RawStream, Transport, TransportError};
use crate::{PubSubError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw frame received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Transport the frame arrived on.
    pub protocol: Protocol,
    /// Topic the frame arrived on.
    pub topic: String,
    /// Undecoded wire bytes.
    pub payload: Bytes,
}

/// Timeouts, startup subscriptions and metrics for a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherOptions {
    /// Per-call publish timeout.
    pub publish_timeout: Duration,
    /// Connect and subscribe timeout.
    pub subscribe_timeout: Duration,
    /// Topics subscribed on the local bus at activation.
    pub local_topics: IndexSet<String>,
    /// Topics subscribed on the broker at activation.
    pub broker_topics: IndexSet<String>,
    /// Optional Prometheus exporter.
    pub metrics: Option<Arc<MessagingMetricsExporter>>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            publish_timeout: DEFAULT_TIMEOUT,
            subscribe_timeout: DEFAULT_TIMEOUT,
            local_topics: IndexSet::new(),
            broker_topics: IndexSet::new(),
            metrics: None,
        }
    }
}

/// Outcome of publishing to one transport.
#[derive(Debug)]
pub struct PublishOutcome {
    /// Transport the publish targeted.
    pub protocol: Protocol,
    /// Acknowledgement or failure.
    pub result: Result<()>,
}

/// Per-transport outcomes of one publish call. Failures are independent: a
/// failure on one transport never prevents the attempt on the other.
#[derive(Debug)]
pub struct PublishReport {
    /// Topic the envelope was published to.
    pub topic: String,
    /// Correlation id of the published envelope.
    pub correlation_id: String,
    /// One entry per attempted transport, in fan-out order.
    pub outcomes: Vec<PublishOutcome>,
}

impl PublishReport {
    /// True when every attempted transport acknowledged.
    pub fn is_success(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Transports that acknowledged the publish.
    pub fn successes(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.protocol)
    }

    /// Transports that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (Protocol, &PubSubError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (o.protocol, err)))
    }

    /// Collapse into the first failure, if any.
    pub fn into_result(self) -> Result<()> {
        for outcome in self.outcomes {
            outcome.result?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct SlotState {
    transport: Option<Arc<dyn Transport>>,
    activating: bool,
    /// Every requested topic, replayed on activation.
    subscriptions: SubscriptionSet,
    /// Topics subscribed (or being subscribed) on the active transport.
    subscribed: SubscriptionSet,
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
    receivers: Vec<JoinHandle<()>>,
}

impl SlotState {
    fn is_current(&self, transport: &Arc<dyn Transport>) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, transport))
    }
}

struct TransportSlot {
    protocol: Protocol,
    state: Mutex<SlotState>,
}

impl TransportSlot {
    fn new(protocol: Protocol, topics: IndexSet<String>) -> Self {
        Self {
            protocol,
            state: Mutex::new(SlotState {
                subscriptions: topics.into_iter().collect(),
                ..SlotState::default()
            }),
        }
    }

    fn active(&self) -> Option<Arc<dyn Transport>> {
        self.state.lock().transport.clone()
    }

    fn forget_subscribed(&self, transport: &Arc<dyn Transport>, topic: &str) {
        let mut state = self.state.lock();
        if state.is_current(transport) {
            state.subscribed.remove(topic);
        }
    }
}

struct Inner {
    egress_topic: String,
    publish_timeout: Duration,
    subscribe_timeout: Duration,
    local: TransportSlot,
    broker: TransportSlot,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

/// Fans publishes out to one or both transports and manages subscriptions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher whose default publish target is `egress_topic`.
    pub fn new(egress_topic: impl Into<String>, options: DispatcherOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                egress_topic: egress_topic.into(),
                publish_timeout: options.publish_timeout,
                subscribe_timeout: options.subscribe_timeout,
                local: TransportSlot::new(Protocol::Local, options.local_topics),
                broker: TransportSlot::new(Protocol::Broker, options.broker_topics),
                metrics: options.metrics,
            }),
        }
    }

    fn slot(&self, protocol: Protocol) -> &TransportSlot {
        match protocol {
            Protocol::Local => &self.inner.local,
            Protocol::Broker => &self.inner.broker,
        }
    }

    /// Default publish topic.
    pub fn egress_topic(&self) -> &str {
        &self.inner.egress_topic
    }

    /// Default per-call publish timeout.
    pub fn publish_timeout(&self) -> Duration {
        self.inner.publish_timeout
    }

    /// Whether the transport has been activated.
    pub fn is_active(&self, protocol: Protocol) -> bool {
        self.slot(protocol).state.lock().transport.is_some()
    }

    /// Requested subscriptions for a transport, in insertion order.
    pub fn subscriptions(&self, protocol: Protocol) -> Vec<String> {
        self.slot(protocol)
            .state
            .lock()
            .subscriptions
            .iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Publish `envelope` with the default timeout. `topic` defaults to the egress topic.
    pub async fn publish(
        &self,
        selector: ProtocolSelector,
        envelope: &Envelope,
        topic: Option<&str>,
    ) -> PublishReport {
        self.publish_with_timeout(selector, envelope, topic, self.inner.publish_timeout)
            .await
    }

    /// Publish `envelope`, bounding each transport acknowledgement by `timeout`.
    pub async fn publish_with_timeout(
        &self,
        selector: ProtocolSelector,
        envelope: &Envelope,
        topic: Option<&str>,
        timeout: Duration,
    ) -> PublishReport {
        let topic = topic.unwrap_or(&self.inner.egress_topic).to_owned();
        let mut outcomes = Vec::with_capacity(selector.protocols().len());

        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                let reason = err.to_string();
                for protocol in selector.protocols() {
                    outcomes.push(PublishOutcome {
                        protocol: *protocol,
                        result: Err(PubSubError::Encode(reason.clone())),
                    });
                }
                return PublishReport {
                    topic,
                    correlation_id: envelope.correlation_id.clone(),
                    outcomes,
                };
            }
        };

        for protocol in selector.protocols() {
            let result = self.publish_to(*protocol, &topic, payload.clone(), timeout).await;
            match &result {
                Ok(()) => {
                    log_envelope(MessageDirection::Outbound, *protocol, &topic, envelope);
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.observe_published(*protocol);
                    }
                }
                Err(err) => {
                    warn!(
                        protocol = protocol.as_str(),
                        topic = %topic,
                        correlation_id = %envelope.correlation_id,
                        error = %err,
                        "publish failed"
                    );
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.observe_publish_failure(*protocol);
                    }
                }
            }
            outcomes.push(PublishOutcome {
                protocol: *protocol,
                result,
            });
        }

        PublishReport {
            topic,
            correlation_id: envelope.correlation_id.clone(),
            outcomes,
        }
    }

    async fn publish_to(
        &self,
        protocol: Protocol,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let transport = self
            .slot(protocol)
            .active()
            .ok_or(PubSubError::TransportFailure {
                protocol,
                source: TransportError::NotActive,
            })?;
        match tokio::time::timeout(timeout, transport.publish(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(PubSubError::TransportFailure { protocol, source }),
            Err(_) => Err(PubSubError::TransportFailure {
                protocol,
                source: TransportError::Timeout(timeout),
            }),
        }
    }

    /// Wrap `message` in an error envelope and publish it to the egress topic.
    /// Never fails; publish problems are only logged.
    pub async fn publish_error(&self, selector: ProtocolSelector, message: impl Into<JsonValue>) {
        self.publish_error_with(selector, EnvelopeOptions::new().with_payload(message))
            .await;
    }

    /// Build an error envelope from `options` and publish it to the egress topic.
    /// Never fails; publish problems are only logged.
    pub async fn publish_error_with(&self, selector: ProtocolSelector, options: EnvelopeOptions) {
        self.publish_error_envelope(selector, &Envelope::build_error(options))
            .await;
    }

    /// Publish an already built error envelope to the egress topic.
    /// Never fails; publish problems are only logged.
    pub async fn publish_error_envelope(&self, selector: ProtocolSelector, envelope: &Envelope) {
        error!(
            correlation_id = %envelope.correlation_id,
            status = envelope.status,
            payload = %envelope.payload,
            "publishing error envelope"
        );
        let report = self.publish(selector, envelope, None).await;
        for (protocol, err) in report.failures() {
            error!(
                protocol = protocol.as_str(),
                correlation_id = %envelope.correlation_id,
                error = %err,
                "unable to publish error envelope"
            );
        }
    }

    /// Add `topic` to the selected subscription sets. Active transports subscribe
    /// immediately; inactive ones pick the topic up on activation. Topics already
    /// subscribed are not subscribed again.
    pub async fn subscribe(&self, selector: ProtocolSelector, topic: &str) -> Result<()> {
        let mut first_error = None;
        for protocol in selector.protocols() {
            let slot = self.slot(*protocol);
            let pending = {
                let mut guard = slot.state.lock();
                let state = &mut *guard;
                state.subscriptions.insert(topic);
                match (&state.transport, &state.inbound) {
                    (Some(transport), Some(inbound)) if !state.subscribed.contains(topic) => {
                        let pending = (Arc::clone(transport), inbound.clone());
                        state.subscribed.insert(topic);
                        Some(pending)
                    }
                    (Some(_), _) => None,
                    _ => {
                        debug!(
                            protocol = protocol.as_str(),
                            topic, "transport inactive; subscription deferred"
                        );
                        None
                    }
                }
            };

            if let Some((transport, inbound)) = pending {
                if let Err(err) = self.open_subscription(slot, transport, inbound, topic).await {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn open_subscription(
        &self,
        slot: &TransportSlot,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        topic: &str,
    ) -> Result<()> {
        let protocol = slot.protocol;
        let context = MessageContext::new()
            .with_protocol(protocol.as_str())
            .with_topic(topic);
        let timeout = self.inner.subscribe_timeout;
        let stream = match tokio::time::timeout(timeout, transport.subscribe(topic)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                slot.forget_subscribed(&transport, topic);
                let err = PubSubError::TransportFailure { protocol, source };
                log_lifecycle_event(
                    Some(&context),
                    "subscribe",
                    &err.to_string(),
                    LifecycleOutcome::Fault,
                );
                return Err(err);
            }
            Err(_) => {
                slot.forget_subscribed(&transport, topic);
                let err = PubSubError::TransportFailure {
                    protocol,
                    source: TransportError::Timeout(timeout),
                };
                log_lifecycle_event(
                    Some(&context),
                    "subscribe",
                    &err.to_string(),
                    LifecycleOutcome::Fault,
                );
                return Err(err);
            }
        };

        {
            let mut state = slot.state.lock();
            if !state.is_current(&transport) {
                // Deactivated while subscribing; the topic stays requested and
                // is replayed on the next activation.
                debug!(
                    protocol = protocol.as_str(),
                    topic, "transport replaced during subscribe; dropping stream"
                );
                return Ok(());
            }
            let handle = tokio::spawn(receive_loop(protocol, topic.to_owned(), stream, inbound));
            state.receivers.push(handle);
        }
        log_lifecycle_event(
            Some(&context),
            "subscribe",
            "subscription active",
            LifecycleOutcome::Success,
        );
        Ok(())
    }

    /// Connect `transport`, mark it active for `protocol` and subscribe every
    /// recorded topic. Frames from all topics are forwarded to `inbound`.
    ///
    /// The transport stays active even when some subscriptions fail; the first
    /// subscription failure is returned after every topic has been attempted.
    pub async fn activate(
        &self,
        protocol: Protocol,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
    ) -> Result<()> {
        let slot = self.slot(protocol);
        {
            let mut state = slot.state.lock();
            if state.transport.is_some() || state.activating {
                return Err(PubSubError::AlreadyActive(protocol));
            }
            state.activating = true;
        }

        let timeout = self.inner.subscribe_timeout;
        let connected = match tokio::time::timeout(timeout, transport.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(PubSubError::TransportFailure { protocol, source }),
            Err(_) => Err(PubSubError::TransportFailure {
                protocol,
                source: TransportError::Timeout(timeout),
            }),
        };
        let context = MessageContext::new().with_protocol(protocol.as_str());
        if let Err(err) = connected {
            slot.state.lock().activating = false;
            log_lifecycle_event(
                Some(&context),
                "activate",
                &err.to_string(),
                LifecycleOutcome::Fault,
            );
            return Err(err);
        }

        let topics: Vec<String> = {
            let mut guard = slot.state.lock();
            let state = &mut *guard;
            state.activating = false;
            state.transport = Some(Arc::clone(&transport));
            state.inbound = Some(inbound.clone());
            let topics: Vec<String> = state
                .subscriptions
                .iter()
                .filter(|topic| !state.subscribed.contains(topic))
                .map(ToOwned::to_owned)
                .collect();
            for topic in &topics {
                state.subscribed.insert(topic.clone());
            }
            topics
        };
        log_lifecycle_event(
            Some(&context),
            "activate",
            &format!("{} transport connected", transport.name()),
            LifecycleOutcome::Success,
        );

        let mut first_error = None;
        for topic in &topics {
            if let Err(err) = self
                .open_subscription(slot, Arc::clone(&transport), inbound.clone(), topic)
                .await
            {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deactivate both transports and stop their receive loops. Requested
    /// subscriptions are kept and replayed on the next activation.
    pub fn shutdown(&self) {
        for slot in [&self.inner.local, &self.inner.broker] {
            let receivers = {
                let mut state = slot.state.lock();
                if state.transport.take().is_none() {
                    continue;
                }
                state.inbound = None;
                state.subscribed.clear();
                std::mem::take(&mut state.receivers)
            };
            for receiver in receivers {
                receiver.abort();
            }
            let context = MessageContext::new().with_protocol(slot.protocol.as_str());
            log_lifecycle_event(
                Some(&context),
                "shutdown",
                "transport deactivated",
                LifecycleOutcome::Success,
            );
        }
    }
}

async fn receive_loop(
    protocol: Protocol,
    topic: String,
    mut stream: RawStream,
    inbound: mpsc::UnboundedSender<InboundFrame>,
) {
    while let Some(payload) = stream.next().await {
        let frame = InboundFrame {
            protocol,
            topic: topic.clone(),
            payload,
        };
        if inbound.send(frame).is_err() {
            break;
        }
    }
    debug!(protocol = protocol.as_str(), topic = %topic, "receive loop finished");
}
