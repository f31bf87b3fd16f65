//! Per-execution trace state.
//!
//! A `TraceContext` has exactly one writer: the execution that created it.
//! It moves `Collecting -> Finalized -> Sent | Dropped` and is never shared
//! between executions.

use crate::error::{Result, SandtraceError};
use crate::span::model::{Span, SpanFilter, SpanId, Tag, TraceId, TRUNCATED_TAG};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// Default cap on spans a single execution may open.
pub const DEFAULT_MAX_SPANS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    Collecting,
    Finalized,
    Sent,
    Dropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceContext {
    trace_id: TraceId,
    root_span_id: SpanId,
    #[serde(serialize_with = "serialize_spans")]
    spans: BTreeMap<SpanId, Span>,
    metadata: BTreeMap<String, String>,
    filter: SpanFilter,
    state: TraceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_parent: Option<SpanId>,
    #[serde(skip)]
    correlated: bool,
    #[serde(skip)]
    next_span_id: u64,
    #[serde(skip)]
    max_spans: usize,
}

fn serialize_spans<S: Serializer>(
    spans: &BTreeMap<SpanId, Span>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(spans.values())
}

impl TraceContext {
    /// Creates a context whose root span starts at `start`.
    pub fn new(root_name: impl Into<String>, filter: SpanFilter, start: u64) -> Self {
        let root_span_id = SpanId::random_base();
        let mut spans = BTreeMap::new();
        spans.insert(root_span_id, Span::new(root_span_id, None, root_name, start));
        Self {
            trace_id: TraceId::generate(),
            root_span_id,
            spans,
            metadata: BTreeMap::new(),
            filter,
            state: TraceState::Collecting,
            remote_parent: None,
            correlated: false,
            next_span_id: root_span_id.0 + 1,
            max_spans: DEFAULT_MAX_SPANS,
        }
    }

    pub fn with_max_spans(mut self, max_spans: usize) -> Self {
        self.max_spans = max_spans.max(1);
        self
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn root_span_id(&self) -> SpanId {
        self.root_span_id
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn filter(&self) -> SpanFilter {
        self.filter
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// The caller's span the root hangs under, once correlated.
    pub fn remote_parent(&self) -> Option<SpanId> {
        self.remote_parent
    }

    pub fn span(&self, id: SpanId) -> Option<&Span> {
        self.spans.get(&id)
    }

    pub fn root_span(&self) -> &Span {
        &self.spans[&self.root_span_id]
    }

    /// Spans in id (creation) order.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.values()
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn find_span(&self, name: &str) -> Option<&Span> {
        self.spans.values().find(|s| s.name == name)
    }

    pub fn open_span_ids(&self) -> Vec<SpanId> {
        self.spans
            .values()
            .filter(|s| s.is_open())
            .map(|s| s.id)
            .collect()
    }

    fn ensure_collecting(&self) -> Result<()> {
        if self.state == TraceState::Collecting {
            Ok(())
        } else {
            Err(SandtraceError::AlreadyFinalized(self.trace_id.to_string()))
        }
    }

    /// Opens a span. Without an explicit parent the span hangs off the root.
    pub fn open_span(&mut self, name: impl Into<String>, parent: Option<SpanId>, at: u64) -> Result<SpanId> {
        self.ensure_collecting()?;
        let parent = parent.unwrap_or(self.root_span_id);
        if !self.spans.contains_key(&parent) {
            return Err(SandtraceError::InvalidSpanReference(parent.0));
        }
        if self.spans.len() >= self.max_spans {
            return Err(SandtraceError::SpanLimitExceeded(self.max_spans));
        }

        let id = SpanId(self.next_span_id);
        self.next_span_id += 1;
        self.spans.insert(id, Span::new(id, Some(parent), name, at));
        Ok(id)
    }

    /// Closes an open span. Unknown or already-closed ids leave the trace untouched.
    pub fn close_span(&mut self, id: SpanId, at: u64) -> Result<()> {
        self.ensure_collecting()?;
        match self.spans.get_mut(&id) {
            Some(span) if span.is_open() => {
                span.close_at(at);
                Ok(())
            }
            _ => Err(SandtraceError::InvalidSpanReference(id.0)),
        }
    }

    /// Appends tags in order. Closed spans may still be tagged.
    pub fn attach_tags(&mut self, id: SpanId, tags: impl IntoIterator<Item = Tag>) -> Result<()> {
        self.ensure_collecting()?;
        let span = self
            .spans
            .get_mut(&id)
            .ok_or(SandtraceError::InvalidSpanReference(id.0))?;
        span.tags.extend(tags);
        Ok(())
    }

    /// Force-closes every open span at `at`, tagging it `truncated:true`.
    pub(crate) fn force_close_open_spans(&mut self, at: u64) -> usize {
        let mut closed = 0;
        for span in self.spans.values_mut().filter(|s| s.is_open()) {
            span.close_at(at);
            span.tags.push(Tag::new(TRUNCATED_TAG, "true"));
            closed += 1;
        }
        closed
    }

    /// Drops spans the filter rejects, keeping the root and truncated spans.
    /// Children of removed spans are re-parented to their nearest retained
    /// ancestor.
    pub(crate) fn apply_filter(&mut self) -> usize {
        let retained: BTreeSet<SpanId> = self
            .spans
            .values()
            .filter(|s| s.id == self.root_span_id || s.is_truncated() || self.filter.retains(s))
            .map(|s| s.id)
            .collect();

        let mut reparented = Vec::new();
        for id in &retained {
            let mut parent = self.spans[id].parent_id;
            while let Some(p) = parent {
                if retained.contains(&p) {
                    break;
                }
                parent = self.spans.get(&p).and_then(|s| s.parent_id);
            }
            if parent != self.spans[id].parent_id {
                reparented.push((*id, parent));
            }
        }
        for (id, parent) in reparented {
            if let Some(span) = self.spans.get_mut(&id) {
                span.parent_id = parent;
            }
        }

        let before = self.spans.len();
        self.spans.retain(|id, _| retained.contains(id));
        before - self.spans.len()
    }

    pub(crate) fn merge_metadata<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.metadata.insert(k.into(), v.into());
        }
    }

    /// Replaces the locally generated trace id with the surrounding request's.
    /// Allowed once per context, and never after the trace left the collector.
    pub fn set_trace_id(&mut self, parent: TraceId) -> Result<()> {
        self.correlate(parent, None)
    }

    /// Like `set_trace_id`, also hanging the root under the caller's span.
    pub fn correlate(&mut self, parent: TraceId, parent_span: Option<SpanId>) -> Result<()> {
        if self.correlated || matches!(self.state, TraceState::Sent | TraceState::Dropped) {
            return Err(SandtraceError::AlreadyFinalized(self.trace_id.to_string()));
        }
        self.trace_id = parent;
        self.remote_parent = parent_span;
        self.correlated = true;
        Ok(())
    }

    pub fn is_correlated(&self) -> bool {
        self.correlated
    }

    pub(crate) fn mark_finalized(&mut self) {
        self.state = TraceState::Finalized;
    }

    pub(crate) fn mark_sent(&mut self) {
        self.state = TraceState::Sent;
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.state = TraceState::Dropped;
    }
}
