//! Span Model
//!
//! Identifiers, spans, tags and the duration filter.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Tag key marking a span force-closed at execution end.
pub const TRUNCATED_TAG: &str = "truncated";

/// Span identifier, unique within one trace. Zero is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(pub u64);

impl SpanId {
    /// A random non-zero first id for a trace. The top 16 bits stay clear so
    /// the sequence never wraps and every id fits a positive guest `i64`.
    pub fn random_base() -> Self {
        let bytes = uuid::Uuid::new_v4();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes.as_bytes()[..8]);
        Self((u64::from_be_bytes(head) >> 16).max(1))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses the 16-hex-character span id of a W3C `traceparent`.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.is_ascii() {
            return None;
        }
        u64::from_str_radix(s, 16).ok().filter(|v| *v != 0).map(SpanId)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 128-bit trace identifier, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for TraceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(format!("trace id must be 32 hex characters, got {:?}", s));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("invalid hex in trace id {:?}", s))?;
        }
        let id = TraceId(bytes);
        if id.is_zero() {
            return Err("trace id must not be all zeros".to_string());
        }
        Ok(id)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One `(key, value)` pair. Order and duplicates are significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub id: SpanId,
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub tags: Vec<Tag>,
}

impl Span {
    pub fn new(id: SpanId, parent_id: Option<SpanId>, name: impl Into<String>, start_time: u64) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            start_time,
            end_time: None,
            tags: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Closes the span; an end earlier than the start is clamped to the start.
    pub(crate) fn close_at(&mut self, at: u64) {
        self.end_time = Some(at.max(self.start_time));
    }

    pub fn duration_micros(&self) -> Option<u64> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }

    pub fn is_truncated(&self) -> bool {
        self.tags
            .iter()
            .any(|t| t.key == TRUNCATED_TAG && t.value == "true")
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// Finalization-time duration predicate. The root span and truncated spans
/// are exempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanFilter {
    pub min_duration_micros: u64,
}

impl SpanFilter {
    pub fn new(min_duration_micros: u64) -> Self {
        Self { min_duration_micros }
    }

    pub fn retains(&self, span: &Span) -> bool {
        span.duration_micros()
            .map(|d| d >= self.min_duration_micros)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_parse_and_display() {
        let raw = "4bf92f3577b34da6a3ce929d0e0e4736";
        let id: TraceId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
        assert!("4bf92f35".parse::<TraceId>().is_err());
        assert!("zzf92f3577b34da6a3ce929d0e0e4736".parse::<TraceId>().is_err());
        assert!("00000000000000000000000000000000".parse::<TraceId>().is_err());
    }

    #[test]
    fn test_generated_trace_ids_differ() {
        assert_ne!(TraceId::generate(), TraceId::generate());
    }

    #[test]
    fn test_close_clamps_to_start() {
        let mut span = Span::new(SpanId(1), None, "work", 500);
        span.close_at(100);
        assert_eq!(span.end_time, Some(500));
        assert_eq!(span.duration_micros(), Some(0));
    }

    #[test]
    fn test_duration_never_underflows() {
        let mut span = Span::new(SpanId(1), None, "work", 500);
        span.end_time = Some(100);
        assert_eq!(span.duration_micros(), Some(0));
    }

    #[test]
    fn test_span_id_base_and_hex() {
        let a = SpanId::random_base();
        assert!(a.0 > 0 && a.0 < 1 << 48);
        assert_eq!(SpanId::from_hex("00f067aa0ba902b7"), Some(SpanId(0x00f0_67aa_0ba9_02b7)));
        assert_eq!(SpanId::from_hex("0000000000000000"), None);
        assert_eq!(SpanId::from_hex("00f067aa"), None);
    }

    #[test]
    fn test_filter_threshold() {
        let filter = SpanFilter::new(5_000);
        let mut short = Span::new(SpanId(2), Some(SpanId(1)), "short", 0);
        short.close_at(3_000);
        let mut long = Span::new(SpanId(3), Some(SpanId(1)), "long", 0);
        long.close_at(6_000);
        let mut exact = Span::new(SpanId(4), Some(SpanId(1)), "exact", 0);
        exact.close_at(5_000);
        assert!(!filter.retains(&short));
        assert!(filter.retains(&long));
        assert!(filter.retains(&exact));
    }
}
