//! Export acknowledgements, encoded to match the request.

use prost::Message;
use serde_json::{json, Value};

use crate::decode::PayloadFormat;
use crate::otlp::{
    ExportLogsPartialSuccess, ExportLogsServiceResponse, ExportMetricsServiceResponse,
    ExportTracePartialSuccess, ExportTraceServiceResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Logs,
    Traces,
    Metrics,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Logs => "logs",
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
        }
    }

    /// OTLP/HTTP request path for this signal.
    pub fn path(&self) -> &'static str {
        match self {
            Signal::Logs => "/v1/logs",
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
        }
    }

    fn rejected_field(&self) -> &'static str {
        match self {
            Signal::Logs => "rejectedLogRecords",
            Signal::Traces => "rejectedSpans",
            Signal::Metrics => "rejectedDataPoints",
        }
    }
}

fn rejection_message(signal: Signal, rejected: u64) -> String {
    format!("{} {} record(s) could not be decoded", rejected, signal.as_str())
}

/// Empty success, or a partial success naming how many records were dropped.
pub fn export_response(signal: Signal, format: PayloadFormat, rejected: u64) -> Vec<u8> {
    match format {
        PayloadFormat::Protobuf => protobuf_response(signal, rejected),
        PayloadFormat::Json => json_response(signal, rejected).to_string().into_bytes(),
    }
}

fn protobuf_response(signal: Signal, rejected: u64) -> Vec<u8> {
    let count = i64::try_from(rejected).unwrap_or(i64::MAX);
    match signal {
        Signal::Logs => ExportLogsServiceResponse {
            partial_success: (rejected > 0).then(|| ExportLogsPartialSuccess {
                rejected_log_records: count,
                error_message: rejection_message(signal, rejected),
            }),
        }
        .encode_to_vec(),
        Signal::Traces => ExportTraceServiceResponse {
            partial_success: (rejected > 0).then(|| ExportTracePartialSuccess {
                rejected_spans: count,
                error_message: rejection_message(signal, rejected),
            }),
        }
        .encode_to_vec(),
        Signal::Metrics => ExportMetricsServiceResponse {
            partial_success: None,
        }
        .encode_to_vec(),
    }
}

fn json_response(signal: Signal, rejected: u64) -> Value {
    if rejected == 0 || signal == Signal::Metrics {
        return json!({});
    }
    let mut partial = serde_json::Map::new();
    // int64 fields are strings in OTLP/JSON.
    partial.insert(
        signal.rejected_field().to_string(),
        Value::String(rejected.to_string()),
    );
    partial.insert(
        "errorMessage".to_string(),
        Value::String(rejection_message(signal, rejected)),
    );
    json!({ "partialSuccess": partial })
}
