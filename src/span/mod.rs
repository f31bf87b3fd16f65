pub mod clock;
pub mod context;
pub mod model;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{TraceContext, TraceState, DEFAULT_MAX_SPANS};
pub use model::{Span, SpanFilter, SpanId, Tag, TraceId, TRUNCATED_TAG};
