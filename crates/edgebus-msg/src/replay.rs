//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::protocol::{Protocol, ProtocolSelector};
use crate::transport::InMemoryTransport;
use crate::Result;

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    protocol: String,
    topic: String,
    #[serde(default)]
    delay_ms: Option<u64>,
    message: JsonValue,
}

/// Deliver `envelope` to subscribers of `topic` as if it arrived from another component.
pub fn inject_envelope(transport: &InMemoryTransport, topic: &str, envelope: &Envelope) -> Result<usize> {
    Ok(transport.inject(topic, envelope.to_bytes()?))
}

/// Replay inbound frames from a newline-delimited JSON file.
///
/// Each line is an object with `protocol` (`local`, `broker` or `both`),
/// `topic`, an optional `delay_ms` slept before delivery, and `message`. A
/// string `message` is delivered verbatim, which allows replaying malformed
/// frames; any other value is serialized as JSON. Returns the number of
/// records delivered.
pub async fn replay_from_file<P: AsRef<Path>>(
    local: &InMemoryTransport,
    broker: &InMemoryTransport,
    path: P,
) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(&line)?;
        let selector: ProtocolSelector = record.protocol.parse()?;
        if let Some(delay) = record.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let payload = match record.message {
            JsonValue::String(raw) => Bytes::from(raw),
            other => Bytes::from(serde_json::to_vec(&other)?),
        };
        for protocol in selector.protocols() {
            let transport = match protocol {
                Protocol::Local => local,
                Protocol::Broker => broker,
            };
            let reached = transport.inject(&record.topic, payload.clone());
            if reached == 0 {
                warn!(
                    line = index + 1,
                    protocol = protocol.as_str(),
                    topic = %record.topic,
                    "replayed frame had no subscribers"
                );
            }
        }
        count += 1;
    }

    debug!(records = count, "replay complete");
    Ok(count)
}
