//! Guest Instrumentation Interface
//!
//! The contract exposed into the sandbox: a fixed set of request/response
//! messages for opening, closing and tagging spans, plus the spans the engine
//! records on the guest's behalf.

pub mod bridge;
pub mod hooks;
pub mod protocol;

pub use bridge::{InstrumentationBridge, INSTANTIATE_SPAN, PAYLOAD_TRUNCATED_TAG, STDIN_SPAN, STDOUT_SPAN};
pub use hooks::{JsonFieldTagger, PayloadTagger};
pub use protocol::{GuestCall, GuestLogLevel, GuestReply, IMPORT_MODULE};
