//! Wire types and decoding for pulse-daemon.
//!
//! Everything that turns an OTLP/HTTP request body into [`TelemetryEvent`]s lives here,
//! along with the session types the daemon publishes. The daemon owns all state; this
//! crate is pure and has no I/O beyond reading the bytes it is handed.

pub mod ack;
pub mod decode;
pub mod error;
pub mod model;
pub mod naming;
pub mod otlp;
pub mod otlp_json;

pub use ack::{export_response, Signal};
pub use decode::{
    decode_logs, decode_metrics, decode_traces, DecodedBatch, MetricsHeartbeat, PayloadFormat,
};
pub use error::DecodeError;
pub use model::{
    AttributeValue, Session, SessionList, SessionListItem, SessionState, TelemetryEvent, Tool,
};

/// Largest request body accepted on the wire.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;
/// Largest body after decompression.
pub const MAX_DECOMPRESSED_BYTES: usize = 16 * 1024 * 1024;
