//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Route-keyed handler registry.
//!
//! Handlers are grouped on objects implementing [`HandlerGroup`]; each group
//! lists its eligible methods through a [`GroupRegistrar`] and every method is
//! indexed under `"<Label>.<method>"`. Registration must complete before any
//! transport is activated: once [`HandlerRegistry::seal`] has been called all
//! further registration fails with [`PubSubError::RegistrationClosed`].

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::envelope::{Envelope, EnvelopeOptions};
use crate::protocol::Protocol;
use crate::{PubSubError, Result};

/// Result returned by message handlers. Errors are converted into error envelopes.
pub type HandlerResult = anyhow::Result<()>;

/// Arguments of the fixed handler contract:
/// `(protocol, topic, correlation_id, status, route, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Transport the message arrived on.
    pub protocol: Protocol,
    /// Topic the message arrived on.
    pub topic: String,
    /// Correlation identifier of the inbound envelope.
    pub correlation_id: String,
    /// Status of the inbound envelope.
    pub status: i64,
    /// Route key of the inbound envelope, unchanged.
    pub route: String,
    /// Application payload.
    pub payload: JsonValue,
}

impl InboundMessage {
    /// Unpack a validated envelope received on `protocol`/`topic`.
    pub fn new(protocol: Protocol, topic: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            protocol,
            topic: topic.into(),
            correlation_id: envelope.correlation_id,
            status: envelope.status,
            route: envelope.route,
            payload: envelope.payload,
        }
    }

    /// Conventional route for a reply: `"<route>_response"`.
    pub fn response_route(&self) -> String {
        format!("{}_response", self.route)
    }

    /// Envelope options for a reply that keeps the correlation id.
    pub fn reply(&self, payload: impl Into<JsonValue>) -> EnvelopeOptions {
        EnvelopeOptions::new()
            .with_correlation_id(self.correlation_id.clone())
            .with_route(self.response_route())
            .with_payload(payload)
    }
}

/// A callable that services one routed message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process the message. Returning an error produces a status 500 error envelope.
    async fn handle(&self, message: InboundMessage) -> HandlerResult;
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        (self.func)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

struct MethodHandler<T, F> {
    target: Arc<T>,
    method: F,
}

#[async_trait]
impl<T, F, Fut> MessageHandler for MethodHandler<T, F>
where
    T: Send + Sync,
    F: Fn(Arc<T>, InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        (self.method)(Arc::clone(&self.target), message).await
    }
}

/// An object exposing a set of message-handling methods.
///
/// ```ignore
/// impl HandlerGroup for Sensor {
///     fn routes(registrar: &mut GroupRegistrar<Self>) {
///         registrar.method("get_temp", Sensor::get_temp);
///     }
/// }
/// ```
pub trait HandlerGroup: Send + Sync + Sized + 'static {
    /// Declare the methods that should be reachable by route.
    fn routes(registrar: &mut GroupRegistrar<Self>);
}

/// Collects the methods a [`HandlerGroup`] exposes.
pub struct GroupRegistrar<T> {
    target: Arc<T>,
    methods: Vec<(String, Arc<dyn MessageHandler>)>,
    _group: PhantomData<fn() -> T>,
}

impl<T: HandlerGroup> GroupRegistrar<T> {
    fn new(target: Arc<T>) -> Self {
        Self {
            target,
            methods: Vec::new(),
            _group: PhantomData,
        }
    }

    /// Expose `method` under `name`. Names starting with `_` are internal and skipped.
    pub fn method<F, Fut>(&mut self, name: &str, method: F) -> &mut Self
    where
        F: Fn(Arc<T>, InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if name.is_empty() || name.starts_with('_') {
            debug!(method = name, "skipping internal handler method");
            return self;
        }
        let handler = MethodHandler {
            target: Arc::clone(&self.target),
            method,
        };
        self.methods.push((name.to_owned(), Arc::new(handler)));
        self
    }
}

/// Mapping from route key to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    sealed: AtomicBool,
}

impl HandlerRegistry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every eligible method of `group` under `"<label>.<method>"`.
    /// Returns the route keys that were added.
    pub fn register<T: HandlerGroup>(&self, label: &str, group: Arc<T>) -> Result<Vec<String>> {
        let label = label.trim();
        if label.is_empty() {
            return Err(PubSubError::Config(
                "handler group label must not be empty".to_owned(),
            ));
        }
        let mut registrar = GroupRegistrar::new(group);
        T::routes(&mut registrar);

        let mut handlers = self.handlers.write();
        if self.sealed.load(Ordering::Acquire) {
            return Err(PubSubError::RegistrationClosed(format!("{label}.*")));
        }
        let mut routes = Vec::with_capacity(registrar.methods.len());
        for (method, handler) in registrar.methods {
            let route = format!("{label}.{method}");
            if handlers.insert(route.clone(), handler).is_some() {
                warn!(route = %route, "handler route re-registered; previous handler replaced");
            }
            routes.push(route);
        }
        debug!(label, routes = ?routes, "registered handler group");
        Ok(routes)
    }

    /// Register a single handler under an explicit route key.
    pub fn insert(&self, route: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let route = route.into();
        let mut handlers = self.handlers.write();
        if self.sealed.load(Ordering::Acquire) {
            return Err(PubSubError::RegistrationClosed(route));
        }
        if handlers.insert(route.clone(), handler).is_some() {
            warn!(route = %route, "handler route re-registered; previous handler replaced");
        }
        Ok(())
    }

    /// Exact-match lookup.
    pub fn resolve(&self, route: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(route).cloned()
    }

    /// Close the registry to further registration.
    pub fn seal(&self) {
        let _handlers = self.handlers.write();
        self.sealed.store(true, Ordering::Release);
    }

    /// Whether registration is closed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Registered route keys, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.handlers.read().keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
