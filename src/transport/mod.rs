//! Delivery of pipeline events to callers.
//!
//! The orchestrator writes [`StreamEvent`](crate::pipeline::StreamEvent)s
//! into a bounded channel; this module drains it as newline-delimited JSON,
//! flushing every event, either to any async writer (the CLI uses stdout) or
//! as a streaming HTTP response.

pub mod ndjson;
pub mod server;

pub use ndjson::{decode_line, encode_event, NdjsonWriter, TransportError, NDJSON_CONTENT_TYPE};
pub use server::{router, serve, AppState, ErrorResponse, OrchestratorBuilder};
