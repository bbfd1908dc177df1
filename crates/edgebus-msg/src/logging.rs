//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;
use crate::protocol::Protocol;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope received from a transport and accepted.
    Inbound,
    /// Envelope published through a transport.
    Outbound,
    /// Inbound frame turned into an error envelope.
    Rejected,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, protocol: Protocol, topic: &str, envelope: &Envelope) {
    debug!(
        protocol = protocol.as_str(),
        topic,
        correlation_id = %envelope.correlation_id,
        route = %envelope.route,
        status = envelope.status,
        schema_version = %envelope.schema_version,
        direction = ?direction,
        "envelope activity"
    );
}

/// Prometheus metric handles for routing and publishing.
pub struct MessagingMetricsExporter {
    received: IntCounterVec,
    rejected: IntCounterVec,
    published: IntCounterVec,
    publish_failures: IntCounterVec,
    handler_latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let received = IntCounterVec::new(
            Opts::new("messages_received_total", "Inbound frames read from transports"),
            &["protocol"],
        )?;
        let rejected = IntCounterVec::new(
            Opts::new(
                "messages_rejected_total",
                "Inbound frames converted into error envelopes",
            ),
            &["protocol", "kind"],
        )?;
        let published = IntCounterVec::new(
            Opts::new("messages_published_total", "Envelopes acknowledged by transports"),
            &["protocol"],
        )?;
        let publish_failures = IntCounterVec::new(
            Opts::new(
                "publish_failures_total",
                "Publish attempts that failed or timed out",
            ),
            &["protocol"],
        )?;
        let handler_latency = Histogram::with_opts(HistogramOpts::new(
            "handler_latency_seconds",
            "Time spent inside routed message handlers",
        ))?;

        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(handler_latency.clone()))?;

        Ok(Self {
            received,
            rejected,
            published,
            publish_failures,
            handler_latency,
        })
    }

    /// Record an inbound frame.
    pub fn observe_received(&self, protocol: Protocol) {
        self.received.with_label_values(&[protocol.as_str()]).inc();
    }

    /// Record a rejected inbound frame.
    pub fn observe_rejected(&self, protocol: Protocol, kind: &str) {
        self.rejected
            .with_label_values(&[protocol.as_str(), kind])
            .inc();
    }

    /// Record a successful publish.
    pub fn observe_published(&self, protocol: Protocol) {
        self.published.with_label_values(&[protocol.as_str()]).inc();
    }

    /// Record a failed publish.
    pub fn observe_publish_failure(&self, protocol: Protocol) {
        self.publish_failures
            .with_label_values(&[protocol.as_str()])
            .inc();
    }

    /// Record time spent in a handler.
    pub fn observe_handler_latency(&self, duration: Duration) {
        self.handler_latency.observe(duration.as_secs_f64());
    }
}
