pub mod multipart;
pub mod request;
pub mod response;
pub mod server;

pub use request::{HttpRequest, RequestError};
pub use response::HttpResponse;
pub use server::{parse_traceparent, Server, TraceParent, TRACE_ID_HEADER};
