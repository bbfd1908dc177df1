//! ---
//! eb_section: "03-logging"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Message-context logging adapters."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Structured logging helpers that attach the identity of the message being
//! processed (protocol, topic, correlation id, route) to every event.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Identity of the message a log event relates to.
#[derive(Debug, Default, Clone)]
pub struct MessageContext<'a> {
    /// Transport the message arrived on or is leaving through.
    pub protocol: Option<&'a str>,
    /// Topic the message was received on or published to.
    pub topic: Option<&'a str>,
    /// Correlation identifier carried by the envelope.
    pub correlation_id: Option<&'a str>,
    /// Route key carried by the envelope.
    pub route: Option<&'a str>,
}

impl<'a> MessageContext<'a> {
    /// Create an empty message context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a protocol name.
    pub fn with_protocol(mut self, protocol: &'a str) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Attach a topic.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a route key.
    pub fn with_route(mut self, route: &'a str) -> Self {
        self.route = Some(route);
        self
    }
}

/// Outcome attached to lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a lifecycle milestone (activation, subscription, shutdown) with an outcome.
pub fn log_lifecycle_event(
    context: Option<&MessageContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        LifecycleOutcome::Success => bus_info!(
            context = ctx,
            "{event} [{outcome}] {message}",
            outcome = outcome.as_str()
        ),
        LifecycleOutcome::Fault => bus_error!(
            context = ctx,
            "{event} [{outcome}] {message}",
            outcome = outcome.as_str()
        ),
    }
}
