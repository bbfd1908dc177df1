//! ---
//! eb_section: "01-core-functionality"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Shared primitives and utilities for the core runtime."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Core shared primitives for the EdgeBus workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the router crates and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, DeviceConfig, LoadedAppConfig, LoggingConfig, SubscriptionConfig, TransportConfig,
};
pub use logging::{init_tracing, LogFormat};
