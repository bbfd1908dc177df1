//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
//! Versioned message envelope and its wire codec.
//!
//! On the wire an envelope is a JSON object with exactly five keys:
//!
//! ```json
//! {"sdk_version": "1.0.0", "message_id": "...", "status": 200, "route": "...", "message": {}}
//! ```
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::{PubSubError, Result};

/// Schema version stamped on every envelope built by this crate.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Route used when a request does not name one.
pub const DEFAULT_MESSAGE_ROUTE: &str = "default_message_handler";

/// Route carried by every error envelope.
pub const DEFAULT_ERROR_ROUTE: &str = "default_error_handler";

/// OK, complete.
pub const STATUS_OK: i64 = 200;
/// Asynchronous request accepted.
pub const STATUS_ACCEPTED: i64 = 202;
/// Command or route not recognised.
pub const STATUS_NOT_FOUND: i64 = 404;
/// Internal component error.
pub const STATUS_INTERNAL_ERROR: i64 = 500;

/// Wire keys every envelope must carry.
pub const WIRE_KEYS: [&str; 5] = ["sdk_version", "message_id", "status", "route", "message"];

/// The unit of exchange between components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Semantic version of the envelope schema used by the sender.
    #[serde(rename = "sdk_version")]
    pub schema_version: String,
    /// Identifier used to track request/response flows.
    #[serde(rename = "message_id")]
    pub correlation_id: String,
    /// HTTP-like status code. Any integer is accepted.
    pub status: i64,
    /// Route key naming the handler on the receiving side.
    pub route: String,
    /// Arbitrary JSON payload.
    #[serde(rename = "message")]
    pub payload: JsonValue,
}

/// Optional fields for [`Envelope::build`]. Omitted or falsy values get defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeOptions {
    /// Defaults to a timestamp-derived identifier.
    pub correlation_id: Option<String>,
    /// Defaults to 200.
    pub status: Option<i64>,
    /// Defaults to `default_message_handler`.
    pub route: Option<String>,
    /// Defaults to an empty JSON object.
    pub payload: Option<JsonValue>,
}

impl EnvelopeOptions {
    /// Options with every field defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the status code.
    pub fn with_status(mut self, status: i64) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the route key.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<JsonValue>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

impl Envelope {
    /// Build an envelope, replacing omitted or falsy fields with their defaults.
    pub fn build(options: EnvelopeOptions) -> Self {
        let correlation_id = options
            .correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_correlation_id);
        let status = options
            .status
            .filter(|status| *status != 0)
            .unwrap_or(STATUS_OK);
        let route = options
            .route
            .filter(|route| !route.is_empty())
            .unwrap_or_else(|| DEFAULT_MESSAGE_ROUTE.to_owned());
        let payload = options
            .payload
            .filter(|payload| !is_falsy(payload))
            .unwrap_or_else(|| JsonValue::Object(Map::new()));

        Self {
            schema_version: SCHEMA_VERSION.to_owned(),
            correlation_id,
            status,
            route,
            payload,
        }
    }

    /// Build an error envelope: status 500 on the `default_error_handler` route.
    pub fn build_error(options: EnvelopeOptions) -> Self {
        Self::build(EnvelopeOptions {
            status: Some(STATUS_INTERNAL_ERROR),
            route: Some(DEFAULT_ERROR_ROUTE.to_owned()),
            ..options
        })
    }

    /// Decode and validate an envelope from wire bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw = decode(bytes)?;
        if !is_valid(&raw) {
            return Err(PubSubError::InvalidEnvelope(missing_keys_reason(&raw)));
        }
        Self::from_raw(raw)
    }

    /// Convert a raw JSON value that passed [`is_valid`] into an envelope.
    ///
    /// Lenient where senders commonly disagree on types:
    ///
    /// * `message_id` may be a string or a number (stringified); `null` gets a
    ///   freshly generated id.
    /// * `status` may be an integer or a string holding one; `null` means
    ///   [`STATUS_OK`].
    /// * `route: null` means [`DEFAULT_MESSAGE_ROUTE`].
    ///
    /// `sdk_version` must be a string. Any other type is rejected.
    pub fn from_raw(raw: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut map) = raw else {
            return Err(PubSubError::InvalidEnvelope(
                "envelope must be a JSON object".to_owned(),
            ));
        };

        let schema_version = take_string(&mut map, "sdk_version")?;
        let correlation_id = match map.remove("message_id") {
            Some(JsonValue::String(id)) => id,
            Some(JsonValue::Number(id)) => id.to_string(),
            Some(JsonValue::Null) => generate_correlation_id(),
            other => {
                return Err(PubSubError::InvalidEnvelope(format!(
                    "message_id must be a string or number, found {}",
                    describe(other.as_ref())
                )))
            }
        };
        let raw_status = map.remove("status");
        let status = match &raw_status {
            Some(JsonValue::Number(n)) => n.as_i64(),
            Some(JsonValue::String(text)) => text.trim().parse::<i64>().ok(),
            Some(JsonValue::Null) => Some(STATUS_OK),
            _ => None,
        }
        .ok_or_else(|| {
            PubSubError::InvalidEnvelope(format!(
                "status must be an integer or numeric string, found {}",
                describe(raw_status.as_ref())
            ))
        })?;
        let route = if matches!(map.get("route"), Some(JsonValue::Null)) {
            DEFAULT_MESSAGE_ROUTE.to_owned()
        } else {
            take_string(&mut map, "route")?
        };
        let payload = map.remove("message").unwrap_or(JsonValue::Null);

        Ok(Self {
            schema_version,
            correlation_id,
            status,
            route,
            payload,
        })
    }

    /// Encode the envelope into its wire form.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| PubSubError::Encode(err.to_string()))
    }

    /// Whether the envelope carries a 4xx/5xx status.
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Decode wire bytes into a raw JSON value without checking envelope shape.
pub fn decode(bytes: &[u8]) -> Result<JsonValue> {
    serde_json::from_slice(bytes).map_err(|err| PubSubError::ParseFailure(err.to_string()))
}

/// True iff `raw` is an object carrying all five wire keys.
///
/// Only presence is checked; field types are enforced by [`Envelope::from_raw`].
pub fn is_valid(raw: &JsonValue) -> bool {
    match raw.as_object() {
        Some(map) => WIRE_KEYS.iter().all(|key| map.contains_key(*key)),
        None => false,
    }
}

/// Compare only the leading major component of two version strings.
///
/// Inputs are not validated: `"1.garbage"` is compatible with `"1.0.0"`.
/// A warning is logged when the remote version is not valid semver.
pub fn is_compatible(remote_version: &str, local_version: &str) -> bool {
    if semver::Version::parse(remote_version).is_err() {
        warn!(
            remote_version,
            local_version, "envelope schema version is not valid semver; comparing major component only"
        );
    }
    let remote_major = remote_version.split('.').next();
    let local_major = local_version.split('.').next();
    remote_major == local_major
}

static LAST_ID_MICROS: AtomicI64 = AtomicI64::new(0);

/// Generate a correlation id from the current UTC time (`%Y%m%d%H%M%S` plus
/// six microsecond digits), bumped forward so ids never repeat within a process.
pub fn generate_correlation_id() -> String {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_ID_MICROS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(if now > last { now } else { last + 1 })
        })
        .unwrap_or(now);
    let micros = if now > previous { now } else { previous + 1 };
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S%6f")
        .to_string()
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

fn take_string(map: &mut Map<String, JsonValue>, key: &str) -> Result<String> {
    match map.remove(key) {
        Some(JsonValue::String(value)) => Ok(value),
        other => Err(PubSubError::InvalidEnvelope(format!(
            "{key} must be a string, found {}",
            describe(other.as_ref())
        ))),
    }
}

fn missing_keys_reason(raw: &JsonValue) -> String {
    match raw.as_object() {
        Some(map) => {
            let missing: Vec<&str> = WIRE_KEYS
                .iter()
                .copied()
                .filter(|key| !map.contains_key(*key))
                .collect();
            format!("missing required keys: {}", missing.join(", "))
        }
        None => format!("expected a JSON object, found {}", describe(Some(raw))),
    }
}

fn describe(value: Option<&JsonValue>) -> &'static str {
    match value {
        None => "nothing",
        Some(JsonValue::Null) => "null",
        Some(JsonValue::Bool(_)) => "a boolean",
        Some(JsonValue::Number(_)) => "a number",
        Some(JsonValue::String(_)) => "a string",
        Some(JsonValue::Array(_)) => "an array",
        Some(JsonValue::Object(_)) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_fills_defaults() {
        let envelope = Envelope::build(EnvelopeOptions::new());
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.status, STATUS_OK);
        assert_eq!(envelope.route, DEFAULT_MESSAGE_ROUTE);
        assert_eq!(envelope.payload, json!({}));
        assert_eq!(envelope.correlation_id.len(), 20);
        assert!(envelope.correlation_id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn build_replaces_falsy_values() {
        let envelope = Envelope::build(EnvelopeOptions {
            correlation_id: Some(String::new()),
            status: Some(0),
            route: Some(String::new()),
            payload: Some(json!([])),
        });
        assert_ne!(envelope.correlation_id, "");
        assert_eq!(envelope.status, STATUS_OK);
        assert_eq!(envelope.route, DEFAULT_MESSAGE_ROUTE);
        assert_eq!(envelope.payload, json!({}));
    }

    #[test]
    fn build_keeps_supplied_values() {
        let envelope = Envelope::build(
            EnvelopeOptions::new()
                .with_correlation_id("req-1")
                .with_status(202)
                .with_route("Sensor.get_temp")
                .with_payload(json!({"sensor_id": "S1"})),
        );
        assert_eq!(envelope.correlation_id, "req-1");
        assert_eq!(envelope.status, STATUS_ACCEPTED);
        assert_eq!(envelope.route, "Sensor.get_temp");
        assert_eq!(envelope.payload, json!({"sensor_id": "S1"}));
    }

    #[test]
    fn build_error_forces_status_and_route() {
        let envelope = Envelope::build_error(
            EnvelopeOptions::new()
                .with_status(200)
                .with_route("ignored")
                .with_payload("boom"),
        );
        assert_eq!(envelope.status, STATUS_INTERNAL_ERROR);
        assert_eq!(envelope.route, DEFAULT_ERROR_ROUTE);
        assert_eq!(envelope.payload, json!("boom"));
        assert!(envelope.is_error());
    }

    #[test]
    fn built_envelopes_are_always_valid() {
        let variants = [
            EnvelopeOptions::new(),
            EnvelopeOptions::new().with_status(404),
            EnvelopeOptions::new().with_payload(json!([1, 2, 3])),
            EnvelopeOptions::new().with_route("A.b").with_correlation_id("x"),
        ];
        for options in variants {
            let envelope = Envelope::build(options);
            let raw = serde_json::to_value(&envelope).expect("serialize");
            assert!(is_valid(&raw), "built envelope must be valid: {raw}");
        }
    }

    #[test]
    fn parse_inverts_to_bytes() {
        let envelope = Envelope::build(
            EnvelopeOptions::new()
                .with_route("Sensor.get_temp_response")
                .with_payload(json!({"sensor_id": "S1", "temp": 42})),
        );
        let bytes = envelope.to_bytes().expect("encode");
        assert_eq!(Envelope::parse(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn float_payloads_survive_the_wire_exactly() {
        let envelope = Envelope::build(
            EnvelopeOptions::new()
                .with_route("Sensor.calibrate")
                .with_payload(json!({
                    "offset": 1.0715660391465826e-75,
                    "gain": [-1.81996730402717e-179, 0.1, 1.0e-7],
                    "range": {"max": -1.603964615428183e143, "min": -9.643915712060552e-234},
                    "reading": 21.000000000000004
                })),
        );
        let bytes = envelope.to_bytes().expect("encode");
        assert_eq!(Envelope::parse(&bytes).expect("decode"), envelope);
    }

    #[test]
    fn wire_form_uses_exactly_five_keys() {
        let raw = serde_json::to_value(Envelope::build(EnvelopeOptions::new())).unwrap();
        let mut keys: Vec<&str> = raw.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["message", "message_id", "route", "sdk_version", "status"]);
    }

    #[test]
    fn parse_accepts_numeric_message_id() {
        let raw = br#"{"sdk_version":"1.0.0","message_id":123456,"status":200,"route":"r","message":null}"#;
        let envelope = Envelope::parse(raw).expect("parse");
        assert_eq!(envelope.correlation_id, "123456");
        assert_eq!(envelope.payload, JsonValue::Null);
    }

    #[test]
    fn parse_distinguishes_malformed_from_incomplete() {
        assert!(matches!(
            Envelope::parse(b"not json"),
            Err(PubSubError::ParseFailure(_))
        ));
        assert!(matches!(
            Envelope::parse(br#""not json""#),
            Err(PubSubError::InvalidEnvelope(_))
        ));
        let err = Envelope::parse(br#"{"sdk_version":"1.0.0","status":200,"route":"r"}"#)
            .unwrap_err();
        match err {
            PubSubError::InvalidEnvelope(reason) => {
                assert!(reason.contains("message_id"));
                assert!(reason.contains("message"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_non_integer_status() {
        for status in [r#""ok""#, "200.5", "[200]", "true"] {
            let raw = format!(
                r#"{{"sdk_version":"1.0.0","message_id":"1","status":{status},"route":"r","message":{{}}}}"#
            );
            assert!(
                matches!(Envelope::parse(raw.as_bytes()), Err(PubSubError::InvalidEnvelope(_))),
                "status {status} should be rejected"
            );
        }
    }

    #[test]
    fn parse_coerces_numeric_string_status() {
        let raw = br#"{"sdk_version":"1.0.0","message_id":"1","status":"202","route":"r","message":{}}"#;
        assert_eq!(Envelope::parse(raw).expect("parse").status, STATUS_ACCEPTED);
        let raw = br#"{"sdk_version":"1.0.0","message_id":"1","status":null,"route":"r","message":{}}"#;
        assert_eq!(Envelope::parse(raw).expect("parse").status, STATUS_OK);
    }

    #[test]
    fn parse_fills_null_route_and_message_id() {
        let raw = br#"{"sdk_version":"1.0.0","message_id":null,"status":200,"route":null,"message":{"a":1}}"#;
        let envelope = Envelope::parse(raw).expect("parse");
        assert_eq!(envelope.route, DEFAULT_MESSAGE_ROUTE);
        assert_eq!(envelope.correlation_id.len(), 20);
        assert!(envelope.correlation_id.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(envelope.payload, json!({"a": 1}));
    }

    #[test]
    fn parse_still_rejects_wrongly_typed_fields() {
        let cases: [&[u8]; 3] = [
            br#"{"sdk_version":null,"message_id":"1","status":200,"route":"r","message":{}}"#,
            br#"{"sdk_version":"1.0.0","message_id":["1"],"status":200,"route":"r","message":{}}"#,
            br#"{"sdk_version":"1.0.0","message_id":"1","status":200,"route":7,"message":{}}"#,
        ];
        for raw in cases {
            assert!(matches!(
                Envelope::parse(raw),
                Err(PubSubError::InvalidEnvelope(_))
            ));
        }
    }

    #[test]
    fn is_valid_checks_presence_only() {
        assert!(is_valid(&json!({
            "sdk_version": 7, "message_id": null, "status": "x", "route": [], "message": 0
        })));
        assert!(!is_valid(&json!({"sdk_version": "1.0.0"})));
        assert!(!is_valid(&json!([1, 2])));
    }

    #[test]
    fn compatibility_compares_major_component() {
        assert!(is_compatible("1.2.3", "1.9.0"));
        assert!(!is_compatible("2.0.0", "1.9.0"));
    }

    #[test]
    fn compatibility_is_permissive_for_malformed_versions() {
        // Known fragile behaviour: only the first segment is compared.
        assert!(is_compatible("1.garbage", "1.0.0"));
        assert!(is_compatible("1", "1.0.0"));
        assert!(!is_compatible("", "1.0.0"));
        assert!(!is_compatible("v1.0.0", "1.0.0"));
    }

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let ids: Vec<String> = (0..500).map(|_| generate_correlation_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    fn json_value() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::from),
            any::<i64>().prop_map(JsonValue::from),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(JsonValue::from),
            ".{0,12}".prop_map(JsonValue::from),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(JsonValue::from),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|map| JsonValue::Object(map.into_iter().collect())),
            ]
        })
    }

    fn envelope_options() -> impl Strategy<Value = EnvelopeOptions> {
        (
            proptest::option::of(".{0,24}"),
            proptest::option::of(any::<i64>()),
            proptest::option::of("[A-Za-z_.]{0,24}"),
            proptest::option::of(json_value()),
        )
            .prop_map(|(correlation_id, status, route, payload)| EnvelopeOptions {
                correlation_id,
                status,
                route,
                payload,
            })
    }

    proptest! {
        #[test]
        fn built_envelopes_are_valid(options in envelope_options()) {
            let envelope = Envelope::build(options);
            let raw = serde_json::to_value(&envelope).expect("serialize");
            prop_assert!(is_valid(&raw));
        }

        #[test]
        fn wire_form_round_trips(options in envelope_options()) {
            let envelope = Envelope::build(options);
            let bytes = envelope.to_bytes().expect("encode");
            prop_assert_eq!(Envelope::parse(&bytes).expect("decode"), envelope);
        }

        #[test]
        fn error_envelopes_round_trip(payload in json_value()) {
            let envelope = Envelope::build_error(EnvelopeOptions::new().with_payload(payload));
            prop_assert!(envelope.is_error());
            let bytes = envelope.to_bytes().expect("encode");
            prop_assert_eq!(Envelope::parse(&bytes).expect("decode"), envelope);
        }
    }
}
