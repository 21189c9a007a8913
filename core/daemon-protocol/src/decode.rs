//! Request body → normalized telemetry events.
//!
//! Both encodings land in the [`crate::otlp`] message types first, so the extraction
//! below is the only place that knows how records become events.

use chrono::{DateTime, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use prost::Message;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use tracing::{debug, trace};

use crate::error::DecodeError;
use crate::model::{AttributeValue, TelemetryEvent, Tool};
use crate::naming::{
    find_session_id, infer_tool, span_event_name, tool_from_service_name, EVENT_NAME_KEYS,
    SERVICE_NAME_KEY,
};
use crate::otlp::{
    any_value, AnyValue, ExportLogsServiceRequest, ExportMetricsServiceRequest,
    ExportTraceServiceRequest, KeyValue, LogRecord, Resource, Span,
};
use crate::otlp_json;
use crate::MAX_DECOMPRESSED_BYTES;

pub const DURATION_ATTRIBUTE: &str = "duration_ms";
pub const SPAN_NAME_ATTRIBUTE: &str = "span.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Protobuf,
    Json,
}

impl PayloadFormat {
    /// Anything that is not explicitly protobuf is treated as JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return PayloadFormat::Json;
        };
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-protobuf" | "application/protobuf" => PayloadFormat::Protobuf,
            _ => PayloadFormat::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Protobuf => "application/x-protobuf",
            PayloadFormat::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBatch {
    pub events: Vec<TelemetryEvent>,
    /// Records that were present but could not be decoded.
    pub rejected: u64,
}

pub fn decompress<'a>(
    body: &'a [u8],
    content_encoding: Option<&str>,
) -> Result<Cow<'a, [u8]>, DecodeError> {
    let encoding = content_encoding
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match encoding.as_str() {
        "" | "identity" => Ok(Cow::Borrowed(body)),
        "gzip" | "x-gzip" => read_limited(GzDecoder::new(body), "gzip").map(Cow::Owned),
        "deflate" => read_limited(ZlibDecoder::new(body), "deflate").map(Cow::Owned),
        other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}

fn read_limited<R: Read>(reader: R, encoding: &'static str) -> Result<Vec<u8>, DecodeError> {
    let mut output = Vec::new();
    reader
        .take(MAX_DECOMPRESSED_BYTES as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|source| DecodeError::Decompress { encoding, source })?;
    if output.len() > MAX_DECOMPRESSED_BYTES {
        return Err(DecodeError::TooLarge {
            limit: MAX_DECOMPRESSED_BYTES,
        });
    }
    Ok(output)
}

pub fn decode_logs(
    body: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<DecodedBatch, DecodeError> {
    let raw = decompress(body, content_encoding)?;
    let (request, rejected) = match PayloadFormat::from_content_type(content_type) {
        PayloadFormat::Protobuf => (ExportLogsServiceRequest::decode(raw.as_ref())?, 0),
        PayloadFormat::Json => otlp_json::parse_logs(raw.as_ref())?,
    };
    let mut batch = extract_logs(&request, received_at);
    batch.rejected += rejected;
    Ok(batch)
}

pub fn decode_traces(
    body: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<DecodedBatch, DecodeError> {
    let raw = decompress(body, content_encoding)?;
    let (request, rejected) = match PayloadFormat::from_content_type(content_type) {
        PayloadFormat::Protobuf => (ExportTraceServiceRequest::decode(raw.as_ref())?, 0),
        PayloadFormat::Json => otlp_json::parse_traces(raw.as_ref())?,
    };
    let mut batch = extract_traces(&request, received_at);
    batch.rejected += rejected;
    Ok(batch)
}

/// Liveness signal carried by a metrics export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsHeartbeat {
    /// Tools that reported metrics in this request.
    pub tools: BTreeSet<Tool>,
    /// Sessions named on a resource, for senders that put `session.id` there.
    pub session_ids: BTreeSet<String>,
}

/// Metrics never become events; they only tell us a tool or session is alive.
pub fn decode_metrics(
    body: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) -> Result<MetricsHeartbeat, DecodeError> {
    let raw = decompress(body, content_encoding)?;
    let request = match PayloadFormat::from_content_type(content_type) {
        PayloadFormat::Protobuf => ExportMetricsServiceRequest::decode(raw.as_ref())?,
        PayloadFormat::Json => otlp_json::parse_metrics(raw.as_ref())?,
    };

    let mut heartbeat = MetricsHeartbeat::default();
    let empty = BTreeMap::new();
    for resource_metrics in &request.resource_metrics {
        let attributes = resource_attributes(resource_metrics.resource.as_ref());
        if let Some(tool) = attributes
            .get(SERVICE_NAME_KEY)
            .and_then(AttributeValue::as_str)
            .and_then(tool_from_service_name)
        {
            heartbeat.tools.insert(tool);
        }
        if let Some(session_id) = find_session_id(&empty, &attributes) {
            heartbeat.session_ids.insert(session_id);
        }
    }
    Ok(heartbeat)
}

pub fn extract_logs(request: &ExportLogsServiceRequest, received_at: DateTime<Utc>) -> DecodedBatch {
    let mut batch = DecodedBatch::default();

    for resource_logs in &request.resource_logs {
        let resource = resource_attributes(resource_logs.resource.as_ref());
        let service_name = resource.get(SERVICE_NAME_KEY).and_then(AttributeValue::as_str);

        for scope_logs in &resource_logs.scope_logs {
            for record in &scope_logs.log_records {
                match log_event(record, &resource, service_name, received_at) {
                    Ok(Some(event)) => batch.events.push(event),
                    Ok(None) => trace!("Discarding log record without an event name"),
                    Err(reason) => {
                        debug!(reason = %reason, "Skipping malformed log record");
                        batch.rejected += 1;
                    }
                }
            }
        }
    }

    batch
}

pub fn extract_traces(
    request: &ExportTraceServiceRequest,
    received_at: DateTime<Utc>,
) -> DecodedBatch {
    let mut batch = DecodedBatch::default();

    for resource_spans in &request.resource_spans {
        let resource = resource_attributes(resource_spans.resource.as_ref());
        let service_name = resource.get(SERVICE_NAME_KEY).and_then(AttributeValue::as_str);

        for scope_spans in &resource_spans.scope_spans {
            for span in &scope_spans.spans {
                match span_event(span, &resource, service_name, received_at) {
                    Ok(Some(event)) => batch.events.push(event),
                    Ok(None) => trace!(name = %span.name, "Discarding unmapped span"),
                    Err(reason) => {
                        debug!(name = %span.name, reason = %reason, "Skipping malformed span");
                        batch.rejected += 1;
                    }
                }
            }
        }
    }

    batch
}

fn log_event(
    record: &LogRecord,
    resource: &BTreeMap<String, AttributeValue>,
    service_name: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<Option<TelemetryEvent>, String> {
    let timestamp = nanos_to_datetime(record.time_unix_nano, "time_unix_nano")?
        .or(nanos_to_datetime(
            record.observed_time_unix_nano,
            "observed_time_unix_nano",
        )?)
        .unwrap_or(received_at);
    let attributes = flatten_attributes(&record.attributes);

    let Some(event_name) = record_event_name(record, &attributes) else {
        return Ok(None);
    };

    let mut event = TelemetryEvent::new(event_name, timestamp);
    event.session_id = find_session_id(&attributes, resource);
    event.tool = infer_tool(&event.event_name, service_name);
    event.trace_id = hex_id(&record.trace_id);
    event.span_id = hex_id(&record.span_id);
    event.attributes = attributes;
    Ok(Some(event))
}

fn span_event(
    span: &Span,
    resource: &BTreeMap<String, AttributeValue>,
    service_name: Option<&str>,
    received_at: DateTime<Utc>,
) -> Result<Option<TelemetryEvent>, String> {
    let Some(event_name) = span_event_name(&span.name) else {
        return Ok(None);
    };

    let start = nanos_to_datetime(span.start_time_unix_nano, "start_time_unix_nano")?;
    let end = nanos_to_datetime(span.end_time_unix_nano, "end_time_unix_nano")?;
    let timestamp = end.or(start).unwrap_or(received_at);

    let mut attributes = flatten_attributes(&span.attributes);
    if start.is_some() && end.is_some() && span.end_time_unix_nano >= span.start_time_unix_nano {
        let duration_ms = (span.end_time_unix_nano - span.start_time_unix_nano) / 1_000_000;
        attributes.insert(
            DURATION_ATTRIBUTE.to_string(),
            AttributeValue::Int(duration_ms as i64),
        );
    }
    attributes.insert(
        SPAN_NAME_ATTRIBUTE.to_string(),
        AttributeValue::String(span.name.clone()),
    );

    let mut event = TelemetryEvent::new(event_name, timestamp);
    event.session_id = find_session_id(&attributes, resource);
    event.tool = infer_tool(event_name, service_name);
    event.trace_id = hex_id(&span.trace_id);
    event.span_id = hex_id(&span.span_id);
    event.attributes = attributes;
    Ok(Some(event))
}

fn record_event_name(
    record: &LogRecord,
    attributes: &BTreeMap<String, AttributeValue>,
) -> Option<String> {
    let from_body = record.body.as_ref().and_then(|body| match &body.value {
        Some(any_value::Value::StringValue(value)) => non_empty(value),
        _ => None,
    });

    from_body
        .or_else(|| non_empty(&record.event_name))
        .or_else(|| {
            EVENT_NAME_KEYS
                .iter()
                .find_map(|key| attributes.get(*key).and_then(AttributeValue::as_str))
                .and_then(non_empty)
        })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn resource_attributes(resource: Option<&Resource>) -> BTreeMap<String, AttributeValue> {
    resource
        .map(|resource| flatten_attributes(&resource.attributes))
        .unwrap_or_default()
}

/// Keeps scalar attributes only. Arrays, maps, bytes, and valueless or keyless entries
/// are dropped individually; they never invalidate the record.
pub fn flatten_attributes(attributes: &[KeyValue]) -> BTreeMap<String, AttributeValue> {
    attributes
        .iter()
        .filter(|kv| !kv.key.is_empty())
        .filter_map(|kv| {
            let value = kv.value.as_ref().and_then(scalar_value)?;
            Some((kv.key.clone(), value))
        })
        .collect()
}

fn scalar_value(value: &AnyValue) -> Option<AttributeValue> {
    match value.value.as_ref()? {
        any_value::Value::StringValue(value) => Some(AttributeValue::String(value.clone())),
        any_value::Value::IntValue(value) => Some(AttributeValue::Int(*value)),
        any_value::Value::BoolValue(value) => Some(AttributeValue::Bool(*value)),
        any_value::Value::DoubleValue(value) => Some(AttributeValue::Double(*value)),
        any_value::Value::ArrayValue(_)
        | any_value::Value::KvlistValue(_)
        | any_value::Value::BytesValue(_) => None,
    }
}

/// Zero means "unset" in OTLP. Values past the i64 range cannot be a real clock reading
/// and make the record malformed.
fn nanos_to_datetime(nanos: u64, field: &str) -> Result<Option<DateTime<Utc>>, String> {
    if nanos == 0 {
        return Ok(None);
    }
    let nanos = i64::try_from(nanos).map_err(|_| format!("{} out of range: {}", field, nanos))?;
    Ok(Some(DateTime::from_timestamp_nanos(nanos)))
}

fn hex_id(bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| hex::encode(bytes))
}
