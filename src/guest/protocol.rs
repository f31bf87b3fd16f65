//! Messages crossing the sandbox boundary.
//!
//! The guest never sees host memory: every call is copied out of guest
//! memory into a `GuestCall`, and every answer is a `GuestReply` reduced to a
//! single integer.

use crate::span::{SpanId, Tag};

/// Import module the guest links instrumentation calls from.
pub const IMPORT_MODULE: &str = "sandtrace";

pub const MAX_NAME_BYTES: usize = 256;
pub const MAX_TAG_BYTES: usize = 16 * 1024;

pub const REPLY_OK: i32 = 0;
pub const REPLY_REJECTED: i32 = -1;

/// Imports the guest may declare from `IMPORT_MODULE`.
pub const IMPORTS: &[&str] = &[
    "span_open",
    "span_close",
    "span_tags",
    "span_enter",
    "span_exit",
    "span_tags_current",
    "log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl GuestLogLevel {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(GuestLogLevel::Error),
            1 => Some(GuestLogLevel::Warn),
            2 => Some(GuestLogLevel::Info),
            3 => Some(GuestLogLevel::Debug),
            4 => Some(GuestLogLevel::Trace),
            _ => None,
        }
    }

    pub fn tag_key(&self) -> &'static str {
        match self {
            GuestLogLevel::Error => "log.error",
            GuestLogLevel::Warn => "log.warn",
            GuestLogLevel::Info => "log.info",
            GuestLogLevel::Debug => "log.debug",
            GuestLogLevel::Trace => "log.trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuestCall {
    OpenSpan { name: String, parent: Option<SpanId> },
    CloseSpan { id: SpanId },
    AttachTags { id: SpanId, tags: Vec<Tag> },
    EnterSpan { name: String },
    ExitSpan,
    TagCurrent { tags: Vec<Tag> },
    Log { level: GuestLogLevel, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestReply {
    Opened(SpanId),
    Ack,
    Rejected,
}

impl GuestReply {
    /// Encoding for calls returning a span id.
    pub fn as_i64(&self) -> i64 {
        match self {
            GuestReply::Opened(id) => id.0 as i64,
            GuestReply::Ack => REPLY_OK as i64,
            GuestReply::Rejected => REPLY_REJECTED as i64,
        }
    }

    /// Encoding for status-only calls.
    pub fn as_i32(&self) -> i32 {
        match self {
            GuestReply::Opened(_) | GuestReply::Ack => REPLY_OK,
            GuestReply::Rejected => REPLY_REJECTED,
        }
    }
}

/// Guest-side span reference; zero and negative values mean "none".
pub fn span_ref(raw: i64) -> Option<SpanId> {
    if raw > 0 {
        Some(SpanId(raw as u64))
    } else {
        None
    }
}

/// Validates text copied out of guest memory.
pub fn decode_text(bytes: &[u8], max: usize) -> Option<String> {
    if bytes.len() > max {
        return None;
    }
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Parses `key:value` entries separated by commas. An entry without a colon
/// becomes a key with an empty value.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((k, v)) => Tag::new(k.trim(), v.trim()),
            None => Tag::new(entry, ""),
        })
        .collect()
}
