//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Versioned envelope protocol and publish/subscribe router sitting above a
//! local bus transport and a cloud broker transport.
//!
//! Inbound frames flow `transport -> Router -> HandlerRegistry -> handler`,
//! and handlers answer through the [`Dispatcher`], which fans publishes out
//! to one or both transports.

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod router;
pub mod subscriptions;
pub mod topics;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Error taxonomy for envelope processing, routing and publishing.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Inbound bytes are not valid envelope wire format.
    #[error("message is not valid JSON: {0}")]
    ParseFailure(String),
    /// Parsed, but missing required envelope fields.
    #[error("message does not meet the envelope format: {0}")]
    InvalidEnvelope(String),
    /// Major version mismatch between sender and local schema.
    #[error("received envelope schema version {remote} but major version of {local} is required")]
    IncompatibleVersion {
        /// Version carried by the inbound envelope.
        remote: String,
        /// Local schema version.
        local: String,
    },
    /// The selected handler returned an error or panicked.
    #[error("handler for route '{route}' failed: {reason}")]
    HandlerInvocation {
        /// Route the handler was selected for.
        route: String,
        /// Human-readable failure description.
        reason: String,
    },
    /// A protocol selector outside `local`, `broker`, `both`.
    #[error("unsupported protocol selector '{0}'; supported values: local, broker, both")]
    UnsupportedProtocol(String),
    /// Opaque failure reported by a transport collaborator.
    #[error("{protocol} transport failure: {source}")]
    TransportFailure {
        /// Transport the operation targeted.
        protocol: Protocol,
        /// Underlying collaborator error.
        source: TransportError,
    },
    /// Handler registration attempted after a transport was activated.
    #[error("handler registration is closed once a transport is active (route '{0}')")]
    RegistrationClosed(String),
    /// Activation requested for a transport that is already active.
    #[error("{0} transport is already active")]
    AlreadyActive(Protocol),
    /// Envelope could not be encoded for the wire.
    #[error("envelope encoding failed: {0}")]
    Encode(String),
    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Wrapper for IO errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON problems outside the envelope codec.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PubSubError {
    /// Stable snake_case identifier embedded in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            PubSubError::ParseFailure(_) => "parse_failure",
            PubSubError::InvalidEnvelope(_) => "invalid_envelope",
            PubSubError::IncompatibleVersion { .. } => "incompatible_version",
            PubSubError::HandlerInvocation { .. } => "handler_invocation_failure",
            PubSubError::UnsupportedProtocol(_) => "unsupported_protocol",
            PubSubError::TransportFailure { .. } => "transport_failure",
            PubSubError::RegistrationClosed(_) => "registration_closed",
            PubSubError::AlreadyActive(_) => "already_active",
            PubSubError::Encode(_) => "encode_failure",
            PubSubError::Config(_) => "config",
            PubSubError::Io(_) => "io",
            PubSubError::Json(_) => "json",
        }
    }
}

pub use client::{ClientOptions, PubSubClient};
pub use dispatcher::{Dispatcher, DispatcherOptions, InboundFrame, PublishOutcome, PublishReport};
pub use envelope::{
    is_compatible, is_valid, Envelope, EnvelopeOptions, DEFAULT_ERROR_ROUTE,
    DEFAULT_MESSAGE_ROUTE, SCHEMA_VERSION, STATUS_ACCEPTED, STATUS_INTERNAL_ERROR,
    STATUS_NOT_FOUND, STATUS_OK,
};
pub use logging::{log_envelope, MessageDirection, MessagingMetricsExporter};
pub use pool::WorkerPool;
pub use protocol::{Protocol, ProtocolSelector};
pub use registry::{
    handler_fn, GroupRegistrar, HandlerGroup, HandlerRegistry, HandlerResult, InboundMessage,
    MessageHandler,
};
pub use replay::{inject_envelope, replay_from_file};
pub use router::{RouteOutcome, Router};
pub use subscriptions::SubscriptionSet;
pub use topics::TopicSchema;
pub use transport::{InMemoryTransport, PublishedFrame, RawStream, Transport, TransportError};
