//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Inbound message lifecycle: `received -> parsed -> validated -> routed ->
//! (invoked | rejected)`.
//!
//! Every rejection publishes exactly one error envelope on the transport the
//! frame arrived on. Nothing escapes [`Router::route`]; handler errors and
//! panics are converted the same way as malformed input.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use edgebus_logging::{bus_debug, bus_warn, MessageContext};
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};

use crate::dispatcher::Dispatcher;
use crate::envelope::{decode, is_compatible, Envelope, EnvelopeOptions, SCHEMA_VERSION};
use crate::logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
use crate::protocol::Protocol;
use crate::registry::{HandlerRegistry, InboundMessage, MessageHandler};
use crate::PubSubError;

/// Terminal state of one routed frame.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A handler ran to completion.
    Invoked {
        /// Route carried by the envelope.
        route: String,
        /// Whether the default handler was used because no route matched.
        used_default: bool,
    },
    /// The frame was rejected and an error envelope was published.
    Rejected(PubSubError),
}

impl RouteOutcome {
    /// Whether a handler completed successfully.
    pub fn is_invoked(&self) -> bool {
        matches!(self, RouteOutcome::Invoked { .. })
    }
}

/// Resolves inbound envelopes to handlers and reports failures as error envelopes.
pub struct Router {
    registry: Arc<HandlerRegistry>,
    default_handler: Arc<dyn MessageHandler>,
    dispatcher: Dispatcher,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

impl Router {
    /// Create a router. `default_handler` receives every envelope whose route
    /// is not registered.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        default_handler: Arc<dyn MessageHandler>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            registry,
            default_handler,
            dispatcher,
            metrics: None,
        }
    }

    /// Attach a metrics exporter.
    pub fn with_metrics(mut self, metrics: Option<Arc<MessagingMetricsExporter>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registry used for route resolution.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Process one raw frame received on `protocol`/`topic`.
    pub async fn route(&self, protocol: Protocol, topic: &str, raw: &[u8]) -> RouteOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.observe_received(protocol);
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => return self.reject(protocol, topic, raw, None, err).await,
        };
        if !is_compatible(&envelope.schema_version, SCHEMA_VERSION) {
            let err = PubSubError::IncompatibleVersion {
                remote: envelope.schema_version.clone(),
                local: SCHEMA_VERSION.to_owned(),
            };
            let correlation_id = envelope.correlation_id.clone();
            return self
                .reject(protocol, topic, raw, Some(correlation_id), err)
                .await;
        }
        log_envelope(MessageDirection::Inbound, protocol, topic, &envelope);

        let (handler, used_default) = match self.registry.resolve(&envelope.route) {
            Some(handler) => (handler, false),
            None => (Arc::clone(&self.default_handler), true),
        };
        let route = envelope.route.clone();
        let correlation_id = envelope.correlation_id.clone();
        let context = MessageContext::new()
            .with_protocol(protocol.as_str())
            .with_topic(topic)
            .with_correlation_id(&correlation_id)
            .with_route(&route);
        bus_debug!(context = context, "invoking handler (default: {used_default})");

        let message = InboundMessage::new(protocol, topic, envelope);
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_handler_latency(started.elapsed());
        }

        let reason = match result {
            Ok(Ok(())) => return RouteOutcome::Invoked { route, used_default },
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };
        let err = PubSubError::HandlerInvocation {
            route: route.clone(),
            reason,
        };
        self.reject(protocol, topic, raw, Some(correlation_id), err)
            .await
    }

    async fn reject(
        &self,
        protocol: Protocol,
        topic: &str,
        raw: &[u8],
        correlation_id: Option<String>,
        err: PubSubError,
    ) -> RouteOutcome {
        let mut context = MessageContext::new()
            .with_protocol(protocol.as_str())
            .with_topic(topic);
        if let Some(id) = correlation_id.as_deref() {
            context = context.with_correlation_id(id);
        }
        bus_warn!(context = context, "rejecting inbound message: {err}");
        if let Some(metrics) = &self.metrics {
            metrics.observe_rejected(protocol, err.kind());
        }

        let payload = json!({
            "error": err.kind(),
            "message": err.to_string(),
            "protocol": protocol.as_str(),
            "topic": topic,
            "payload": reported_payload(raw),
        });
        let mut options = EnvelopeOptions::new().with_payload(payload);
        if let Some(id) = correlation_id {
            options = options.with_correlation_id(id);
        }
        let envelope = Envelope::build_error(options);
        log_envelope(MessageDirection::Rejected, protocol, topic, &envelope);
        self.dispatcher
            .publish_error_envelope(protocol.into(), &envelope)
            .await;
        RouteOutcome::Rejected(err)
    }
}

fn reported_payload(raw: &[u8]) -> JsonValue {
    decode(raw).unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(raw).into_owned()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherOptions;
    use crate::registry::{handler_fn, GroupRegistrar, HandlerGroup, HandlerResult};
    use crate::transport::InMemoryTransport;
    use crate::ProtocolSelector;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const EGRESS: &str = "plant/dev-1/egress";
    const INGRESS: &str = "plant/dev-1/ingress";

    struct Sensor {
        dispatcher: Dispatcher,
        seen: Mutex<Vec<JsonValue>>,
    }

    impl Sensor {
        async fn get_temp(self: Arc<Self>, message: InboundMessage) -> HandlerResult {
            self.seen.lock().push(message.payload.clone());
            let sensor_id = message.payload["sensor_id"].clone();
            let response = Envelope::build(
                message.reply(json!({"sensor_id": sensor_id, "temp": 42})),
            );
            self.dispatcher
                .publish(message.protocol.into(), &response, None)
                .await
                .into_result()?;
            Ok(())
        }

        async fn fail(self: Arc<Self>, _message: InboundMessage) -> HandlerResult {
            anyhow::bail!("sensor offline")
        }

        async fn explode(self: Arc<Self>, _message: InboundMessage) -> HandlerResult {
            panic!("sensor exploded")
        }
    }

    impl HandlerGroup for Sensor {
        fn routes(registrar: &mut GroupRegistrar<Self>) {
            registrar
                .method("get_temp", Sensor::get_temp)
                .method("fail", Sensor::fail)
                .method("explode", Sensor::explode);
        }
    }

    struct Fixture {
        router: Router,
        local: InMemoryTransport,
        sensor: Arc<Sensor>,
        defaults: Arc<Mutex<Vec<InboundMessage>>>,
        _inbound: mpsc::UnboundedReceiver<crate::dispatcher::InboundFrame>,
    }

    async fn fixture() -> Fixture {
        let dispatcher = Dispatcher::new(EGRESS, DispatcherOptions::default());
        let local = InMemoryTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher
            .activate(Protocol::Local, Arc::new(local.clone()), tx)
            .await
            .expect("activate local");

        let registry = Arc::new(HandlerRegistry::new());
        let sensor = Arc::new(Sensor {
            dispatcher: dispatcher.clone(),
            seen: Mutex::new(Vec::new()),
        });
        registry.register("Sensor", sensor.clone()).expect("register");

        let defaults = Arc::new(Mutex::new(Vec::new()));
        let sink = defaults.clone();
        let default_handler = handler_fn(move |message| {
            let sink = sink.clone();
            async move {
                sink.lock().push(message);
                HandlerResult::Ok(())
            }
        });

        Fixture {
            router: Router::new(registry, default_handler, dispatcher),
            local,
            sensor,
            defaults,
            _inbound: rx,
        }
    }

    fn only_error(local: &InMemoryTransport) -> Envelope {
        let frames = local.published_on(EGRESS);
        assert_eq!(frames.len(), 1, "exactly one error envelope");
        let envelope = frames[0].envelope().expect("error envelope decodes");
        assert_eq!(envelope.status, 500);
        assert_eq!(envelope.route, "default_error_handler");
        envelope
    }

    #[tokio::test]
    async fn sensor_request_is_answered() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":"1","status":200,"route":"Sensor.get_temp","message":{"sensor_id":"S1"}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Invoked { ref route, used_default: false } if route == "Sensor.get_temp"
        ));
        assert_eq!(*fx.sensor.seen.lock(), vec![json!({"sensor_id": "S1"})]);

        let frames = fx.local.published_on(EGRESS);
        assert_eq!(frames.len(), 1);
        let response = frames[0].envelope().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.route, "Sensor.get_temp_response");
        assert_eq!(response.correlation_id, "1");
        assert_eq!(response.payload, json!({"sensor_id": "S1", "temp": 42}));
    }

    #[tokio::test]
    async fn unknown_route_falls_through_to_default_once() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.4.0","message_id":"abc","status":200,"route":"Nobody.home","message":{}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(outcome, RouteOutcome::Invoked { used_default: true, .. }));
        let defaults = fx.defaults.lock();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].route, "Nobody.home");
        assert_eq!(defaults[0].correlation_id, "abc");
        assert!(fx.local.published().is_empty());
    }

    #[tokio::test]
    async fn null_route_and_message_id_reach_default_handler() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":null,"status":200,"route":null,"message":{"k":1}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Invoked { ref route, used_default: true } if route == "default_message_handler"
        ));
        let defaults = fx.defaults.lock();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].route, "default_message_handler");
        assert!(!defaults[0].correlation_id.is_empty());
        assert_eq!(defaults[0].payload, json!({"k": 1}));
        assert!(fx.local.published().is_empty());
    }

    #[tokio::test]
    async fn string_status_is_accepted_when_numeric() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":"11","status":"200","route":"Sensor.get_temp","message":{"sensor_id":"S2"}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(outcome.is_invoked());
        assert_eq!(*fx.sensor.seen.lock(), vec![json!({"sensor_id": "S2"})]);
        let response = fx.local.published_on(EGRESS)[0].envelope().unwrap();
        assert_eq!(response.correlation_id, "11");
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn non_numeric_status_is_rejected() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":"12","status":"ok","route":"Sensor.get_temp","message":{}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(outcome, RouteOutcome::Rejected(PubSubError::InvalidEnvelope(_))));
        assert!(fx.sensor.seen.lock().is_empty());
        let error = only_error(&fx.local);
        assert_eq!(error.payload["error"], "invalid_envelope");
    }

    #[tokio::test]
    async fn incompatible_major_version_is_rejected_without_invoking() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"2.0.0","message_id":"7","status":200,"route":"Sensor.get_temp","message":{"sensor_id":"S1"}}"#;

        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Rejected(PubSubError::IncompatibleVersion { .. })
        ));
        assert!(fx.sensor.seen.lock().is_empty());
        let error = only_error(&fx.local);
        assert_eq!(error.correlation_id, "7");
        assert_eq!(error.payload["error"], "incompatible_version");
        let explanation = error.payload["message"].as_str().unwrap();
        assert!(explanation.contains("2.0.0") && explanation.contains("1.0.0"));
    }

    #[tokio::test]
    async fn malformed_json_produces_one_error_envelope() {
        let fx = fixture().await;
        let outcome = fx.router.route(Protocol::Local, INGRESS, b"not json").await;
        assert!(matches!(outcome, RouteOutcome::Rejected(PubSubError::ParseFailure(_))));

        let error = only_error(&fx.local);
        assert_eq!(error.payload["error"], "parse_failure");
        assert_eq!(error.payload["topic"], INGRESS);
        assert_eq!(error.payload["payload"], "not json");
        assert!(fx.defaults.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_keys_are_rejected() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","route":"Sensor.get_temp"}"#;
        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(outcome, RouteOutcome::Rejected(PubSubError::InvalidEnvelope(_))));
        let error = only_error(&fx.local);
        assert_eq!(error.payload["payload"]["route"], "Sensor.get_temp");
    }

    #[tokio::test]
    async fn handler_error_becomes_error_envelope() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":"9","status":200,"route":"Sensor.fail","message":{}}"#;
        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Rejected(PubSubError::HandlerInvocation { ref reason, .. })
                if reason.contains("sensor offline")
        ));
        let error = only_error(&fx.local);
        assert_eq!(error.correlation_id, "9");
        assert_eq!(error.payload["error"], "handler_invocation_failure");
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let fx = fixture().await;
        let raw = br#"{"sdk_version":"1.0.0","message_id":"10","status":200,"route":"Sensor.explode","message":{}}"#;
        let outcome = fx.router.route(Protocol::Local, INGRESS, raw).await;
        match outcome {
            RouteOutcome::Rejected(PubSubError::HandlerInvocation { route, reason }) => {
                assert_eq!(route, "Sensor.explode");
                assert!(reason.contains("sensor exploded"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        only_error(&fx.local);
    }

    #[tokio::test]
    async fn rejection_uses_arrival_protocol() {
        let fx = fixture().await;
        // broker is inactive, so an error for a broker frame cannot reach the local bus
        fx.router.route(Protocol::Broker, INGRESS, b"{").await;
        assert!(fx.local.published().is_empty());

        fx.router
            .dispatcher
            .publish_error(ProtocolSelector::Local, "manual")
            .await;
        assert_eq!(fx.local.published().len(), 1);
    }
}
