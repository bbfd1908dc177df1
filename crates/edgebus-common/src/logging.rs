//! ---
//! eb_section: "01-core-functionality"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Shared primitives and utilities for the core runtime."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Process-wide tracing setup for EdgeBus nodes.
//!
//! `edgebusd run` and `edgebusd replay` both log envelope traffic through
//! `tracing`; this module wires those events to the console and to a daily
//! rolling JSON file so the message lifecycle of a node can be audited after
//! the fact.
use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter directive variable read before `RUST_LOG`.
pub const LOG_ENV: &str = "EDGEBUS_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Non-blocking writer guards; dropping them would lose buffered lines.
struct WriterGuards {
    _console: WorkerGuard,
    _file: WorkerGuard,
}

static GUARDS: OnceCell<WriterGuards> = OnceCell::new();

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Console rendering for node logs. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers on the gateway.
    #[default]
    StructuredJson,
    /// Human-readable lines, handy when replaying captures locally.
    Pretty,
}

/// Install the tracing subscriber for an EdgeBus node.
///
/// The filter comes from `EDGEBUS_LOG`, then `RUST_LOG`, then `info`. Log
/// files are named after `config.file_prefix`, or `service_name` when unset.
/// Only the first call installs a subscriber; later calls still create the
/// log directory and return `Ok`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = resolve_filter(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
    );
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config.format, console_writer))
        .with(file_layer(file_writer))
        .try_init()
        .is_ok();

    if installed {
        let _ = GUARDS.set(WriterGuards {
            _console: console_guard,
            _file: file_guard,
        });
        announce(service_name, &config.directory, config.format);
    }
    Ok(())
}

/// Pick the first usable directive among `edgebus_log` and `rust_log`.
///
/// An unparsable `EDGEBUS_LOG` is reported on stderr, since no subscriber
/// exists yet, and skipped.
pub fn resolve_filter(edgebus_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directive) = edgebus_log {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {LOG_ENV} directive {directive:?}: {err}"),
        }
    }
    rust_log
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

fn file_layer<S>(writer: NonBlocking) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .json()
        .with_writer(writer)
        .boxed()
}

fn announce(service_name: &str, directory: &Path, format: LogFormat) {
    info!(
        service = %service_name,
        log_dir = %directory.display(),
        format = ?format,
        "edgebus node logging ready"
    );
}
