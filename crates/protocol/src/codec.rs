//! Frame codec: validating decode and encode of [`GatewayFrame`]s.
//!
//! Decoding never panics. The `type` discriminator is checked first; field
//! validation then collects every violation (JSON path, expected type, found
//! type) so the caller gets a readable diff instead of serde's first-error
//! message. Unknown event names are not an error.

use std::fmt;

use serde_json::{Map, Value};

use crate::{GatewayFrame, MAX_PAYLOAD_BYTES};

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub path: String,
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.path, self.expected, self.found
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    PayloadTooLarge { size: usize, max: usize },
    Malformed(String),
    NotAnObject { found: &'static str },
    MissingType,
    UnknownType(String),
    Schema(Vec<FieldViolation>),
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, max } => {
                write!(f, "frame of {size} bytes exceeds limit of {max} bytes")
            },
            Self::Malformed(msg) => write!(f, "malformed JSON: {msg}"),
            Self::NotAnObject { found } => write!(f, "frame must be an object, found {found}"),
            Self::MissingType => f.write_str("type: expected \"req\" | \"res\" | \"event\", found missing"),
            Self::UnknownType(t) => {
                write!(f, "type: expected \"req\" | \"res\" | \"event\", found {t:?}")
            },
            Self::Schema(violations) => {
                let parts: Vec<String> = violations.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join("; "))
            },
        }
    }
}

/// Bytes of the offending frame kept in a [`DecodeError`].
pub const RAW_EXCERPT_BYTES: usize = 256;

/// A frame that could not be decoded, with the start of its raw text kept
/// for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid frame: {kind}")]
pub struct DecodeError {
    /// At most [`RAW_EXCERPT_BYTES`] of the frame, cut on a char boundary.
    pub raw: String,
    /// Length of the whole frame in bytes.
    pub raw_len: usize,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    fn new(raw: &str, kind: DecodeErrorKind) -> Self {
        let mut end = raw.len().min(RAW_EXCERPT_BYTES);
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            raw: raw[..end].to_string(),
            raw_len: raw.len(),
            kind,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.raw.len() < self.raw_len
    }

    /// Field violations, empty unless the failure was a schema mismatch.
    pub fn violations(&self) -> &[FieldViolation] {
        match &self.kind {
            DecodeErrorKind::Schema(v) => v,
            _ => &[],
        }
    }
}

/// Serialize a frame to its JSON text form.
pub fn encode(frame: &GatewayFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

/// Parse and validate one text frame.
pub fn decode(raw: &str) -> Result<GatewayFrame, DecodeError> {
    if raw.len() > MAX_PAYLOAD_BYTES {
        return Err(DecodeError::new(raw, DecodeErrorKind::PayloadTooLarge {
            size: raw.len(),
            max: MAX_PAYLOAD_BYTES,
        }));
    }

    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new(raw, DecodeErrorKind::Malformed(e.to_string())))?;

    let Some(obj) = value.as_object() else {
        return Err(DecodeError::new(raw, DecodeErrorKind::NotAnObject {
            found: type_name(&value),
        }));
    };

    let mut check = Validator::default();
    match obj.get("type") {
        None | Some(Value::Null) => return Err(DecodeError::new(raw, DecodeErrorKind::MissingType)),
        Some(Value::String(t)) => match t.as_str() {
            "req" => check.request(obj),
            "res" => check.response(obj),
            "event" => check.event(obj),
            other => {
                return Err(DecodeError::new(
                    raw,
                    DecodeErrorKind::UnknownType(other.to_string()),
                ));
            },
        },
        Some(other) => {
            return Err(DecodeError::new(
                raw,
                DecodeErrorKind::UnknownType(other.to_string()),
            ));
        },
    }

    if !check.violations.is_empty() {
        return Err(DecodeError::new(
            raw,
            DecodeErrorKind::Schema(check.violations),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| DecodeError::new(raw, DecodeErrorKind::Malformed(e.to_string())))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_u64() => "unsigned integer",
        Value::Number(n) if n.is_i64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Default)]
struct Validator {
    violations: Vec<FieldViolation>,
}

impl Validator {
    fn violation(&mut self, path: String, expected: &'static str, found: &'static str) {
        self.violations.push(FieldViolation {
            path,
            expected,
            found,
        });
    }

    fn required(
        &mut self,
        obj: &Map<String, Value>,
        prefix: &str,
        key: &str,
        expected: &'static str,
        ok: fn(&Value) -> bool,
    ) {
        let path = format!("{prefix}{key}");
        match obj.get(key) {
            None => self.violation(path, expected, "missing"),
            Some(v) if !ok(v) => self.violation(path, expected, type_name(v)),
            Some(_) => {},
        }
    }

    fn optional(
        &mut self,
        obj: &Map<String, Value>,
        prefix: &str,
        key: &str,
        expected: &'static str,
        ok: fn(&Value) -> bool,
    ) {
        if let Some(v) = obj.get(key)
            && !v.is_null()
            && !ok(v)
        {
            self.violation(format!("{prefix}{key}"), expected, type_name(v));
        }
    }

    fn request(&mut self, obj: &Map<String, Value>) {
        self.required(obj, "", "id", "string", Value::is_string);
        self.required(obj, "", "method", "string", Value::is_string);
        self.optional(obj, "", "channel", "string", Value::is_string);
    }

    fn response(&mut self, obj: &Map<String, Value>) {
        self.required(obj, "", "id", "string", Value::is_string);
        self.required(obj, "", "ok", "boolean", Value::is_boolean);
        self.optional(obj, "", "channel", "string", Value::is_string);
        match obj.get("error") {
            None | Some(Value::Null) => {},
            Some(Value::Object(err)) => {
                self.required(err, "error.", "code", "string", Value::is_string);
                self.required(err, "error.", "message", "string", Value::is_string);
                self.optional(err, "error.", "retryable", "boolean", Value::is_boolean);
                self.optional(
                    err,
                    "error.",
                    "retryAfterMs",
                    "unsigned integer",
                    Value::is_u64,
                );
            },
            Some(other) => self.violation("error".into(), "object", type_name(other)),
        }
    }

    fn event(&mut self, obj: &Map<String, Value>) {
        self.required(obj, "", "event", "string", Value::is_string);
        self.optional(obj, "", "seq", "unsigned integer", Value::is_u64);
        self.optional(obj, "", "stream", "string", Value::is_string);
        self.optional(obj, "", "done", "boolean", Value::is_boolean);
        self.optional(obj, "", "channel", "string", Value::is_string);
        match obj.get("stateVersion") {
            None | Some(Value::Null) => {},
            Some(Value::Object(sv)) => {
                self.required(
                    sv,
                    "stateVersion.",
                    "presence",
                    "unsigned integer",
                    Value::is_u64,
                );
                self.required(
                    sv,
                    "stateVersion.",
                    "health",
                    "unsigned integer",
                    Value::is_u64,
                );
            },
            Some(other) => self.violation("stateVersion".into(), "object", type_name(other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, crate::*, rstest::rstest};

    #[test]
    fn decodes_response_frame() {
        let raw = r#"{"type":"res","id":"r1","ok":true,"payload":{"agents":[]}}"#;
        let frame = decode(raw).unwrap();
        let GatewayFrame::Response(res) = frame else {
            panic!("expected response");
        };
        assert_eq!(res.id, "r1");
        assert!(res.ok);
        assert_eq!(res.payload, Some(serde_json::json!({"agents": []})));
    }

    #[test]
    fn decodes_error_response_with_retry_hints() {
        let raw = r#"{"type":"res","id":"r9","ok":false,"error":{"code":"UNAVAILABLE","message":"busy","retryable":true,"retryAfterMs":250}}"#;
        let GatewayFrame::Response(res) = decode(raw).unwrap() else {
            panic!("expected response");
        };
        let err = res.error.unwrap();
        assert_eq!(err.code, error_codes::UNAVAILABLE);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms, Some(250));
    }

    #[test]
    fn unknown_event_name_passes_through() {
        let raw = r#"{"type":"event","event":"vendor.custom","payload":{"x":1},"seq":3}"#;
        let GatewayFrame::Event(ev) = decode(raw).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(ev.event, "vendor.custom");
        assert!(!ev.is_known());
        assert_eq!(ev.seq, Some(3));
    }

    #[test]
    fn null_optional_fields_are_accepted() {
        let raw = r#"{"type":"event","event":"tick","payload":null,"seq":null,"stateVersion":null}"#;
        assert!(decode(raw).is_ok());
    }

    #[test]
    fn discriminator_checked_before_fields() {
        let err = decode(r#"{"type":"bogus","id":5}"#).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnknownType("bogus".into()));
        assert!(err.violations().is_empty());

        let err = decode(r#"{"id":"1","ok":true}"#).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MissingType);
    }

    #[test]
    fn schema_errors_report_every_field_path() {
        let raw = r#"{"type":"event","event":7,"seq":-1,"stateVersion":{"presence":"x"}}"#;
        let err = decode(raw).unwrap_err();
        let paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec![
            "event",
            "seq",
            "stateVersion.presence",
            "stateVersion.health"
        ]);
        assert_eq!(err.raw, raw);
        assert!(!err.is_truncated());
        let rendered = err.to_string();
        assert!(rendered.contains("event: expected string, found unsigned integer"));
        assert!(rendered.contains("stateVersion.health: expected unsigned integer, found missing"));
    }

    #[test]
    fn nested_error_shape_is_validated() {
        let raw = r#"{"type":"res","id":"1","ok":false,"error":{"code":1}}"#;
        let err = decode(raw).unwrap_err();
        let paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["error.code", "error.message"]);
    }

    #[rstest]
    #[case::not_json("{not json", "malformed")]
    #[case::array("[1,2]", "object")]
    #[case::string("\"req\"", "object")]
    fn rejects_non_frames(#[case] raw: &str, #[case] needle: &str) {
        let err = decode(raw).unwrap_err();
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn oversized_frames_are_rejected_without_parsing() {
        let raw = format!(
            r#"{{"type":"event","event":"chat","payload":"{}"}}"#,
            "a".repeat(MAX_PAYLOAD_BYTES)
        );
        let err = decode(&raw).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::PayloadTooLarge { .. }));
        assert!(err.is_truncated());
        assert_eq!(err.raw_len, raw.len());
        assert_eq!(err.raw.len(), RAW_EXCERPT_BYTES);
        assert!(raw.starts_with(&err.raw));
    }

    #[test]
    fn excerpt_is_cut_on_a_char_boundary() {
        // Two-byte chars put the byte limit in the middle of one.
        let raw = format!("{{\"xy\":\"{}", "é".repeat(RAW_EXCERPT_BYTES));
        let err = decode(&raw).unwrap_err();
        assert!(err.raw.len() <= RAW_EXCERPT_BYTES);
        assert!(err.raw.len() >= RAW_EXCERPT_BYTES - 1);
        assert!(raw.starts_with(&err.raw));
    }

    #[test]
    fn encode_emits_type_discriminator() {
        let frame = GatewayFrame::from(RequestFrame::new(
            "1-1",
            "agents.list",
            Some(serde_json::json!({})),
        ));
        let raw = encode(&frame).unwrap();
        assert!(raw.contains(r#""type":"req""#));
        assert_eq!(decode(&raw).unwrap(), frame);
    }
}
