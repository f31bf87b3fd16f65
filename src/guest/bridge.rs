//! Instrumentation Bridge
//!
//! Applies guest messages and engine-owned (automatic) span events to the
//! execution's `TraceContext`. Both kinds draw ids from the same context, so
//! manual and automatic spans never collide.

use crate::error::SandtraceError;
use crate::guest::hooks::PayloadTagger;
use crate::guest::protocol::{GuestCall, GuestReply, MAX_TAG_BYTES};
use crate::span::{Clock, SpanId, Tag, TraceContext};
use std::sync::Arc;
use tracing::debug;

pub const STDIN_SPAN: &str = "stdin.read";
pub const STDOUT_SPAN: &str = "stdout.write";
pub const INSTANTIATE_SPAN: &str = "instantiate";
pub const PAYLOAD_TRUNCATED_TAG: &str = "payload.truncated";

pub struct InstrumentationBridge {
    trace: TraceContext,
    clock: Arc<dyn Clock>,
    stack: Vec<SpanId>,
    auto: bool,
    tagger: Option<Arc<dyn PayloadTagger>>,
    stdin_span: Option<SpanId>,
    stdin_payload: Vec<u8>,
    payload_limit: usize,
    payload_truncated: bool,
    stdin_done: bool,
    rejected: u64,
}

impl InstrumentationBridge {
    pub fn new(trace: TraceContext, clock: Arc<dyn Clock>) -> Self {
        Self {
            trace,
            clock,
            stack: Vec::new(),
            auto: true,
            tagger: None,
            stdin_span: None,
            stdin_payload: Vec::new(),
            payload_limit: MAX_TAG_BYTES,
            payload_truncated: false,
            stdin_done: false,
            rejected: 0,
        }
    }

    pub fn with_auto_instrumentation(mut self, enabled: bool) -> Self {
        self.auto = enabled;
        self
    }

    pub fn with_tagger(mut self, tagger: Option<Arc<dyn PayloadTagger>>) -> Self {
        self.tagger = tagger;
        self
    }

    /// How much of stdin the payload tagger may see. The engine sets this to
    /// the full stdin length.
    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn rejected_calls(&self) -> u64 {
        self.rejected
    }

    pub fn now(&self) -> u64 {
        self.clock.now_micros()
    }

    fn current(&self) -> Option<SpanId> {
        self.stack.last().copied()
    }

    /// Applies one guest message. Protocol misuse is answered with
    /// `Rejected` and never interrupts the guest.
    pub fn handle(&mut self, call: GuestCall) -> GuestReply {
        let now = self.clock.now_micros();
        let result = match call {
            GuestCall::OpenSpan { name, parent } => {
                let parent = parent.or_else(|| self.current());
                self.trace
                    .open_span(name, parent, now)
                    .map(GuestReply::Opened)
            }
            GuestCall::CloseSpan { id } if id == self.trace.root_span_id() => {
                Err(SandtraceError::InvalidSpanReference(id.0))
            }
            GuestCall::CloseSpan { id } => self.trace.close_span(id, now).map(|_| GuestReply::Ack),
            GuestCall::AttachTags { id, tags } => {
                self.trace.attach_tags(id, tags).map(|_| GuestReply::Ack)
            }
            GuestCall::EnterSpan { name } => {
                let parent = self.current();
                self.trace.open_span(name, parent, now).map(|id| {
                    self.stack.push(id);
                    GuestReply::Opened(id)
                })
            }
            GuestCall::ExitSpan => match self.stack.pop() {
                Some(id) => self.trace.close_span(id, now).map(|_| GuestReply::Ack),
                None => Err(SandtraceError::InvalidSpanReference(0)),
            },
            GuestCall::TagCurrent { tags } => {
                let target = self.current().unwrap_or(self.trace.root_span_id());
                self.trace.attach_tags(target, tags).map(|_| GuestReply::Ack)
            }
            GuestCall::Log { level, message } => {
                let target = self.current().unwrap_or(self.trace.root_span_id());
                self.trace
                    .attach_tags(target, vec![Tag::new(level.tag_key(), message)])
                    .map(|_| GuestReply::Ack)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                self.rejected += 1;
                debug!(trace_id = %self.trace.trace_id(), error = %e, "rejected guest instrumentation call");
                GuestReply::Rejected
            }
        }
    }

    /// Answers a call whose arguments could not be decoded from guest memory.
    pub fn reject(&mut self, call: &str) -> GuestReply {
        self.rejected += 1;
        debug!(trace_id = %self.trace.trace_id(), call, "malformed guest instrumentation call");
        GuestReply::Rejected
    }

    /// Opens an engine-owned span under the current guest span.
    pub fn auto_begin(&mut self, name: &str) -> Option<SpanId> {
        if !self.auto {
            return None;
        }
        let now = self.clock.now_micros();
        let parent = self.current();
        match self.trace.open_span(name, parent, now) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(span = name, error = %e, "automatic span not recorded");
                None
            }
        }
    }

    pub fn auto_end(&mut self, id: Option<SpanId>, tags: Vec<Tag>) {
        if let Some(id) = id {
            let now = self.clock.now_micros();
            if !tags.is_empty() {
                let _ = self.trace.attach_tags(id, tags);
            }
            let _ = self.trace.close_span(id, now);
        }
    }

    /// Tracks the guest consuming stdin. The span covers the first read up to
    /// end-of-input; the payload tagger runs once the input is complete.
    pub fn on_stdin_read(&mut self, chunk: &[u8]) {
        if !self.auto || self.stdin_done {
            return;
        }
        if self.stdin_span.is_none() {
            self.stdin_span = self.auto_begin(STDIN_SPAN);
        }
        if !chunk.is_empty() {
            if self.tagger.is_some() {
                let room = self.payload_limit.saturating_sub(self.stdin_payload.len());
                if chunk.len() > room {
                    self.payload_truncated = true;
                }
                self.stdin_payload
                    .extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            return;
        }

        self.stdin_done = true;
        let mut tags = Vec::new();
        if let Some(tagger) = &self.tagger {
            // partial payloads are never inspected
            if self.payload_truncated {
                tags.push(Tag::new(PAYLOAD_TRUNCATED_TAG, "true"));
            } else {
                tags.extend(tagger.tag(&self.stdin_payload));
            }
        }
        let span = self.stdin_span.take();
        self.auto_end(span, tags);
    }

    /// Closes the root span at `ended_at` and hands the trace back. Guest
    /// spans still open stay open for the collector to truncate.
    pub fn finish(mut self, ended_at: u64) -> TraceContext {
        let root = self.trace.root_span_id();
        let _ = self.trace.close_span(root, ended_at);
        self.trace
    }

    /// Records a failure on the root span.
    pub fn mark_error(&mut self, kind: &str, message: &str) {
        let root = self.trace.root_span_id();
        let _ = self.trace.attach_tags(
            root,
            vec![Tag::new("error", "true"), Tag::new("error.kind", kind), Tag::new("error.message", message)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::hooks::JsonFieldTagger;
    use crate::guest::protocol::GuestLogLevel;
    use crate::span::{ManualClock, SpanFilter};

    fn bridge() -> (InstrumentationBridge, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let trace = TraceContext::new("module:test", SpanFilter::default(), clock.now_micros());
        (InstrumentationBridge::new(trace, clock.clone()), clock)
    }

    #[test]
    fn test_explicit_open_close() {
        let (mut b, clock) = bridge();
        let reply = b.handle(GuestCall::OpenSpan {
            name: "parse".into(),
            parent: None,
        });
        let id = match reply {
            GuestReply::Opened(id) => id,
            other => panic!("unexpected reply {:?}", other),
        };
        clock.advance(300);
        assert_eq!(b.handle(GuestCall::CloseSpan { id }), GuestReply::Ack);
        assert_eq!(b.handle(GuestCall::CloseSpan { id }), GuestReply::Rejected);
        assert_eq!(b.rejected_calls(), 1);
        assert_eq!(b.trace().span(id).unwrap().duration_micros(), Some(300));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let (mut b, _) = bridge();
        let reply = b.handle(GuestCall::OpenSpan {
            name: "orphan".into(),
            parent: Some(SpanId(77)),
        });
        assert_eq!(reply, GuestReply::Rejected);
        assert_eq!(b.trace().span_count(), 1);
    }

    #[test]
    fn test_enter_exit_nesting_and_logs() {
        let (mut b, _) = bridge();
        let outer = match b.handle(GuestCall::EnterSpan { name: "outer".into() }) {
            GuestReply::Opened(id) => id,
            r => panic!("{:?}", r),
        };
        let inner = match b.handle(GuestCall::EnterSpan { name: "inner".into() }) {
            GuestReply::Opened(id) => id,
            r => panic!("{:?}", r),
        };
        b.handle(GuestCall::Log {
            level: GuestLogLevel::Info,
            message: "hello world".into(),
        });
        assert_eq!(b.handle(GuestCall::ExitSpan), GuestReply::Ack);
        assert_eq!(b.handle(GuestCall::ExitSpan), GuestReply::Ack);
        assert_eq!(b.handle(GuestCall::ExitSpan), GuestReply::Rejected);

        let inner_span = b.trace().span(inner).unwrap();
        assert_eq!(inner_span.parent_id, Some(outer));
        assert_eq!(inner_span.tag_value("log.info"), Some("hello world"));
    }

    #[test]
    fn test_automatic_spans_share_id_space() {
        let (mut b, _) = bridge();
        let manual = match b.handle(GuestCall::EnterSpan { name: "main".into() }) {
            GuestReply::Opened(id) => id,
            r => panic!("{:?}", r),
        };
        let auto = b.auto_begin(STDOUT_SPAN).unwrap();
        b.auto_end(Some(auto), vec![Tag::new("bytes", "5")]);
        assert_ne!(manual, auto);
        assert_eq!(b.trace().span(auto).unwrap().parent_id, Some(manual));
    }

    #[test]
    fn test_stdin_span_with_tagger() {
        let (b, clock) = bridge();
        let mut b = b.with_tagger(Some(Arc::new(JsonFieldTagger::new(vec!["brand".into()]))));
        b.on_stdin_read(br#"{"brand":"#);
        clock.advance(6_000);
        b.on_stdin_read(br#""Apple"}"#);
        b.on_stdin_read(b"");
        let span = b.trace().find_span(STDIN_SPAN).unwrap();
        assert_eq!(span.tag_value("brand"), Some("Apple"));
        assert_eq!(span.duration_micros(), Some(6_000));
    }

    #[test]
    fn test_stdin_payload_larger_than_tag_limit() {
        let (b, _) = bridge();
        let payload = format!(r#"{{"brand":"Apple","description":"{}"}}"#, "x".repeat(20_000));
        let mut b = b
            .with_tagger(Some(Arc::new(JsonFieldTagger::new(vec!["brand".into()]))))
            .with_payload_limit(payload.len());
        for chunk in payload.as_bytes().chunks(4096) {
            b.on_stdin_read(chunk);
        }
        b.on_stdin_read(b"");
        let span = b.trace().find_span(STDIN_SPAN).unwrap();
        assert_eq!(span.tag_value("brand"), Some("Apple"));
        assert_eq!(span.tag_value(PAYLOAD_TRUNCATED_TAG), None);
    }

    #[test]
    fn test_payload_over_limit_is_not_inspected() {
        let (b, _) = bridge();
        let mut b = b
            .with_tagger(Some(Arc::new(JsonFieldTagger::new(vec!["brand".into()]))))
            .with_payload_limit(8);
        b.on_stdin_read(br#"{"brand":"Apple"}"#);
        b.on_stdin_read(b"");
        let span = b.trace().find_span(STDIN_SPAN).unwrap();
        assert_eq!(span.tag_value(PAYLOAD_TRUNCATED_TAG), Some("true"));
        assert_eq!(span.tag_value("brand"), None);
        assert_eq!(span.tag_value("payload.json"), None);
    }

    #[test]
    fn test_guest_cannot_close_root() {
        let (mut b, clock) = bridge();
        let root = b.trace().root_span_id();
        assert_eq!(b.handle(GuestCall::CloseSpan { id: root }), GuestReply::Rejected);
        assert!(b.trace().root_span().is_open());
        assert_eq!(b.rejected_calls(), 1);

        clock.advance(80);
        let late = match b.handle(GuestCall::OpenSpan {
            name: "late".into(),
            parent: None,
        }) {
            GuestReply::Opened(id) => id,
            r => panic!("{:?}", r),
        };
        let trace = b.finish(clock.now_micros());
        assert_eq!(trace.root_span().end_time, Some(1_080));
        assert!(trace.span(late).unwrap().start_time <= trace.root_span().end_time.unwrap());
    }

    #[test]
    fn test_auto_disabled() {
        let (b, _) = bridge();
        let mut b = b.with_auto_instrumentation(false);
        assert!(b.auto_begin(STDOUT_SPAN).is_none());
        b.on_stdin_read(b"");
        assert_eq!(b.trace().span_count(), 1);
    }

    #[test]
    fn test_finish_closes_root_only() {
        let (mut b, clock) = bridge();
        b.handle(GuestCall::EnterSpan { name: "never-exited".into() });
        clock.advance(50);
        let trace = b.finish(clock.now_micros());
        assert_eq!(trace.root_span().end_time, Some(1_050));
        assert_eq!(trace.open_span_ids().len(), 1);
    }
}
