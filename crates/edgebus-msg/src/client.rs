//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::sync::Arc;

use edgebus_common::config::{AppConfig, TransportConfig};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherOptions, InboundFrame, PublishReport};
use crate::envelope::{Envelope, EnvelopeOptions};
use crate::logging::MessagingMetricsExporter;
use crate::pool::WorkerPool;
use crate::protocol::{Protocol, ProtocolSelector};
use crate::registry::{HandlerGroup, HandlerRegistry, MessageHandler};
use crate::router::Router;
use crate::topics::TopicSchema;
use crate::transport::Transport;
use crate::{PubSubError, Result};

/// Construction options for a [`PubSubClient`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Timeouts, extra startup subscriptions and metrics.
    pub dispatcher: DispatcherOptions,
    /// Concurrent handler invocations per transport.
    pub pool_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherOptions::default(),
            pool_size: TransportConfig::default().worker_pool_size(),
        }
    }
}

impl ClientOptions {
    /// Derive options from the `[transport]` and `[subscriptions]` sections.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dispatcher: DispatcherOptions {
                publish_timeout: config.transport.publish_timeout,
                subscribe_timeout: config.transport.subscribe_timeout,
                local_topics: config.subscriptions.local.clone(),
                broker_topics: config.subscriptions.broker.clone(),
                metrics: None,
            },
            pool_size: config.transport.worker_pool_size(),
        }
    }

    /// Attach a metrics exporter.
    pub fn with_metrics(mut self, metrics: Arc<MessagingMetricsExporter>) -> Self {
        self.dispatcher.metrics = Some(metrics);
        self
    }
}

struct Pump {
    protocol: Protocol,
    pool: WorkerPool,
    task: JoinHandle<()>,
}

/// Entry point tying the topic schema, handler registry, router and dispatcher together.
///
/// Handlers must be registered before the first [`PubSubClient::activate`];
/// activation seals the registry.
pub struct PubSubClient {
    topics: TopicSchema,
    registry: Arc<HandlerRegistry>,
    router: Arc<Router>,
    dispatcher: Dispatcher,
    pool_size: usize,
    pumps: Mutex<Vec<Pump>>,
}

impl PubSubClient {
    /// Create a client. The ingress topic is subscribed on both transports
    /// ahead of any extra topics in `options`.
    pub fn new(
        topics: TopicSchema,
        default_handler: Arc<dyn MessageHandler>,
        options: ClientOptions,
    ) -> Self {
        Self::with_default_handler(topics, options, |_| default_handler)
    }

    /// Like [`PubSubClient::new`], building the default handler from the
    /// client's dispatcher so it can reply to unrecognised routes.
    pub fn with_default_handler<F>(topics: TopicSchema, mut options: ClientOptions, make_default: F) -> Self
    where
        F: FnOnce(Dispatcher) -> Arc<dyn MessageHandler>,
    {
        let ingress = topics.ingress();
        for extra in [
            &mut options.dispatcher.local_topics,
            &mut options.dispatcher.broker_topics,
        ] {
            let mut seeded = IndexSet::with_capacity(extra.len() + 1);
            seeded.insert(ingress.clone());
            seeded.extend(extra.drain(..));
            *extra = seeded;
        }

        let metrics = options.dispatcher.metrics.clone();
        let dispatcher = Dispatcher::new(topics.egress(), options.dispatcher);
        let registry = Arc::new(HandlerRegistry::new());
        let default_handler = make_default(dispatcher.clone());
        let router = Router::new(Arc::clone(&registry), default_handler, dispatcher.clone())
            .with_metrics(metrics);

        Self {
            topics,
            registry,
            router: Arc::new(router),
            dispatcher,
            pool_size: options.pool_size,
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Build a client from loaded configuration.
    pub fn from_config<F>(config: &AppConfig, make_default: F) -> Result<Self>
    where
        F: FnOnce(Dispatcher) -> Arc<dyn MessageHandler>,
    {
        let topics = TopicSchema::from_config(&config.device)?;
        Ok(Self::with_default_handler(
            topics,
            ClientOptions::from_config(config),
            make_default,
        ))
    }

    /// Topic schema in use.
    pub fn topics(&self) -> &TopicSchema {
        &self.topics
    }

    /// Handler registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Dispatcher handed to handlers that need to publish.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a handler group under `label`.
    pub fn register_group<T: HandlerGroup>(&self, label: &str, group: Arc<T>) -> Result<Vec<String>> {
        self.registry.register(label, group)
    }

    /// Register a single handler under an explicit route.
    pub fn register_route(&self, route: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.registry.insert(route, handler)
    }

    /// Connect `transport` as `protocol`, replay subscriptions, start routing
    /// inbound frames and announce the activation on the egress topic.
    pub async fn activate(&self, protocol: Protocol, transport: Arc<dyn Transport>) -> Result<()> {
        self.registry.seal();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let activated = self.dispatcher.activate(protocol, transport, inbound_tx).await;
        let already_active = matches!(activated, Err(PubSubError::AlreadyActive(_)));
        if already_active || (activated.is_err() && !self.dispatcher.is_active(protocol)) {
            return activated;
        }

        let pool = WorkerPool::new(protocol.as_str(), self.pool_size);
        let task = tokio::spawn(pump(Arc::clone(&self.router), pool.clone(), inbound_rx));
        self.pumps.lock().push(Pump {
            protocol,
            pool,
            task,
        });
        info!(
            protocol = protocol.as_str(),
            ingress = %self.topics.ingress(),
            pool_size = self.pool_size,
            "client activated"
        );

        let event = Envelope::build(
            EnvelopeOptions::new()
                .with_payload(json!({"event": format!("{} Client Activated", protocol.title())})),
        );
        let report = self.dispatcher.publish(protocol.into(), &event, None).await;
        for (protocol, err) in report.failures() {
            warn!(protocol = protocol.as_str(), error = %err, "activation event not published");
        }
        activated
    }

    /// Subscribe to an additional topic on the selected transport(s).
    pub async fn subscribe(&self, selector: ProtocolSelector, topic: &str) -> Result<()> {
        self.dispatcher.subscribe(selector, topic).await
    }

    /// Publish an envelope; `topic` defaults to the egress topic.
    pub async fn publish(
        &self,
        selector: ProtocolSelector,
        envelope: &Envelope,
        topic: Option<&str>,
    ) -> PublishReport {
        self.dispatcher.publish(selector, envelope, topic).await
    }

    /// Publish an error envelope wrapping `message`. Never fails.
    pub async fn publish_error(&self, selector: ProtocolSelector, message: impl Into<JsonValue>) {
        self.dispatcher.publish_error(selector, message).await;
    }

    /// Deactivate both transports and stop dispatching. Handlers already
    /// running are left to finish.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        for pump in self.pumps.lock().drain(..) {
            pump.pool.close();
            pump.task.abort();
            debug!(protocol = pump.protocol.as_str(), "inbound pump stopped");
        }
    }
}

async fn pump(
    router: Arc<Router>,
    pool: WorkerPool,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
) {
    while let Some(frame) = inbound.recv().await {
        let router = Arc::clone(&router);
        let dispatched = pool
            .spawn(async move {
                router
                    .route(frame.protocol, &frame.topic, &frame.payload)
                    .await;
            })
            .await;
        if dispatched.is_none() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{handler_fn, HandlerResult};
    use crate::transport::InMemoryTransport;

    fn client() -> PubSubClient {
        PubSubClient::new(
            TopicSchema::new("plant", "dev-9"),
            handler_fn(|_| async { HandlerResult::Ok(()) }),
            ClientOptions::default(),
        )
    }

    #[test]
    fn ingress_is_seeded_first_on_both_transports() {
        let mut options = ClientOptions::default();
        options.dispatcher.broker_topics.insert("cloud/cmd".to_owned());
        let client = PubSubClient::new(
            TopicSchema::new("plant", "dev-9"),
            handler_fn(|_| async { HandlerResult::Ok(()) }),
            options,
        );
        let dispatcher = client.dispatcher();
        assert_eq!(dispatcher.subscriptions(Protocol::Local), vec!["plant/dev-9/ingress"]);
        assert_eq!(
            dispatcher.subscriptions(Protocol::Broker),
            vec!["plant/dev-9/ingress", "cloud/cmd"]
        );
        assert_eq!(dispatcher.egress_topic(), "plant/dev-9/egress");
    }

    #[test]
    fn default_pool_size_follows_transport_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.pool_size, TransportConfig::default().worker_pool_size());
        assert_eq!(
            options.pool_size,
            ClientOptions::from_config(&AppConfig::default()).pool_size
        );
    }

    #[tokio::test]
    async fn activation_publishes_event_and_seals_registry() {
        let client = client();
        let broker = InMemoryTransport::new();
        client
            .activate(Protocol::Broker, Arc::new(broker.clone()))
            .await
            .expect("activate");

        let frames = broker.published_on("plant/dev-9/egress");
        assert_eq!(frames.len(), 1);
        let event = frames[0].envelope().unwrap();
        assert_eq!(event.payload, json!({"event": "Broker Client Activated"}));
        assert!(client.registry().is_sealed());

        let err = client
            .register_route("Late.route", handler_fn(|_| async { HandlerResult::Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, PubSubError::RegistrationClosed(_)));

        let err = client
            .activate(Protocol::Broker, Arc::new(InMemoryTransport::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::AlreadyActive(Protocol::Broker)));
        client.shutdown();
    }

    #[test]
    fn from_config_uses_device_and_transport_sections() {
        let config: AppConfig = r#"
[device]
base_topic = "site"
device_id = "edge-3"

[transport]
publish_timeout_ms = 1500

[subscriptions]
local = ["site/alerts"]
"#
        .parse()
        .expect("config");
        let client = PubSubClient::from_config(&config, |_| {
            handler_fn(|_| async { HandlerResult::Ok(()) })
        })
        .expect("client");

        assert_eq!(client.topics().ingress(), "site/edge-3/ingress");
        let dispatcher = client.dispatcher();
        assert_eq!(dispatcher.publish_timeout(), std::time::Duration::from_millis(1500));
        assert_eq!(
            dispatcher.subscriptions(Protocol::Local),
            vec!["site/edge-3/ingress", "site/alerts"]
        );
        assert_eq!(dispatcher.subscriptions(Protocol::Broker), vec!["site/edge-3/ingress"]);
    }
}
