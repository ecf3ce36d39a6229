//! Wire-level plumbing: request headers, retrying HTTP client, event-stream parsing.

pub mod headers;
pub mod http;
pub mod sse;
