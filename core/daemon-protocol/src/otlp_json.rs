//! OTLP/JSON request shapes.
//!
//! JSON payloads are mapped onto the protobuf message types in [`crate::otlp`] so both
//! encodings share one extraction path. Log records and spans are decoded one at a time;
//! a record that fails to decode is dropped and counted instead of failing the request.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::otlp::{
    any_value, AnyValue, ArrayValue, ExportLogsServiceRequest, ExportMetricsServiceRequest,
    ExportTraceServiceRequest, InstrumentationScope, KeyValue, KeyValueList, LogRecord,
    Resource, ResourceLogs, ResourceMetrics, ResourceSpans, ScopeLogs, ScopeSpans, Span,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonLogsRequest {
    resource_logs: Vec<JsonResourceLogs>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonResourceLogs {
    resource: Option<JsonResource>,
    scope_logs: Vec<JsonScopeLogs>,
    schema_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonScopeLogs {
    scope: Option<JsonScope>,
    log_records: Vec<Value>,
    schema_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonLogRecord {
    #[serde(deserialize_with = "flexible_u64")]
    time_unix_nano: u64,
    #[serde(deserialize_with = "flexible_u64")]
    observed_time_unix_nano: u64,
    severity_number: i32,
    severity_text: String,
    body: Option<Value>,
    attributes: Vec<JsonKeyValue>,
    dropped_attributes_count: u32,
    flags: u32,
    trace_id: String,
    span_id: String,
    event_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonTracesRequest {
    resource_spans: Vec<JsonResourceSpans>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonResourceSpans {
    resource: Option<JsonResource>,
    scope_spans: Vec<JsonScopeSpans>,
    schema_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonScopeSpans {
    scope: Option<JsonScope>,
    spans: Vec<Value>,
    schema_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonSpan {
    trace_id: String,
    span_id: String,
    trace_state: String,
    parent_span_id: String,
    name: String,
    kind: i32,
    #[serde(deserialize_with = "flexible_u64")]
    start_time_unix_nano: u64,
    #[serde(deserialize_with = "flexible_u64")]
    end_time_unix_nano: u64,
    attributes: Vec<JsonKeyValue>,
    dropped_attributes_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonMetricsRequest {
    resource_metrics: Vec<JsonResourceMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonResourceMetrics {
    resource: Option<JsonResource>,
    schema_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonResource {
    attributes: Vec<JsonKeyValue>,
    dropped_attributes_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonScope {
    name: String,
    version: String,
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonKeyValue {
    key: String,
    // Kept raw so an empty or unrecognised value drops only this attribute.
    value: Option<Value>,
}

/// Externally tagged, matching the `{"stringValue": "..."}` shape of OTLP/JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum JsonAnyValue {
    StringValue(String),
    BoolValue(bool),
    IntValue(#[serde(deserialize_with = "flexible_i64")] i64),
    DoubleValue(f64),
    ArrayValue(JsonArrayValue),
    KvlistValue(JsonKeyValueList),
    // Base64 in JSON; bytes values are never read, so they stay opaque.
    BytesValue(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonArrayValue {
    values: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonKeyValueList {
    values: Vec<JsonKeyValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleInt {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleInt::deserialize(deserializer)? {
        FlexibleInt::Unsigned(value) => Ok(value),
        FlexibleInt::Signed(value) => u64::try_from(value).map_err(de::Error::custom),
        FlexibleInt::Text(value) => value.trim().parse().map_err(de::Error::custom),
    }
}

fn flexible_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleInt::deserialize(deserializer)? {
        FlexibleInt::Unsigned(value) => i64::try_from(value).map_err(de::Error::custom),
        FlexibleInt::Signed(value) => Ok(value),
        FlexibleInt::Text(value) => value.trim().parse().map_err(de::Error::custom),
    }
}

/// Parses an OTLP/JSON logs request. Returns the request plus the number of log records
/// that were dropped because they did not decode.
pub fn parse_logs(bytes: &[u8]) -> Result<(ExportLogsServiceRequest, u64), serde_json::Error> {
    let request: JsonLogsRequest = serde_json::from_slice(bytes)?;
    let mut rejected = 0u64;

    let resource_logs = request
        .resource_logs
        .into_iter()
        .map(|resource_logs| ResourceLogs {
            resource: resource_logs.resource.map(Resource::from),
            scope_logs: resource_logs
                .scope_logs
                .into_iter()
                .map(|scope_logs| ScopeLogs {
                    scope: scope_logs.scope.map(InstrumentationScope::from),
                    log_records: scope_logs
                        .log_records
                        .into_iter()
                        .filter_map(|raw| match log_record_from_value(raw) {
                            Ok(record) => Some(record),
                            Err(reason) => {
                                debug!(reason = %reason, "Skipping malformed JSON log record");
                                rejected += 1;
                                None
                            }
                        })
                        .collect(),
                    schema_url: scope_logs.schema_url,
                })
                .collect(),
            schema_url: resource_logs.schema_url,
        })
        .collect();

    Ok((ExportLogsServiceRequest { resource_logs }, rejected))
}

/// Parses an OTLP/JSON traces request. Returns the request plus the number of spans that
/// were dropped because they did not decode.
pub fn parse_traces(bytes: &[u8]) -> Result<(ExportTraceServiceRequest, u64), serde_json::Error> {
    let request: JsonTracesRequest = serde_json::from_slice(bytes)?;
    let mut rejected = 0u64;

    let resource_spans = request
        .resource_spans
        .into_iter()
        .map(|resource_spans| ResourceSpans {
            resource: resource_spans.resource.map(Resource::from),
            scope_spans: resource_spans
                .scope_spans
                .into_iter()
                .map(|scope_spans| ScopeSpans {
                    scope: scope_spans.scope.map(InstrumentationScope::from),
                    spans: scope_spans
                        .spans
                        .into_iter()
                        .filter_map(|raw| match span_from_value(raw) {
                            Ok(span) => Some(span),
                            Err(reason) => {
                                debug!(reason = %reason, "Skipping malformed JSON span");
                                rejected += 1;
                                None
                            }
                        })
                        .collect(),
                    schema_url: scope_spans.schema_url,
                })
                .collect(),
            schema_url: resource_spans.schema_url,
        })
        .collect();

    Ok((ExportTraceServiceRequest { resource_spans }, rejected))
}

pub fn parse_metrics(bytes: &[u8]) -> Result<ExportMetricsServiceRequest, serde_json::Error> {
    let request: JsonMetricsRequest = serde_json::from_slice(bytes)?;
    Ok(ExportMetricsServiceRequest {
        resource_metrics: request
            .resource_metrics
            .into_iter()
            .map(|resource_metrics| ResourceMetrics {
                resource: resource_metrics.resource.map(Resource::from),
                schema_url: resource_metrics.schema_url,
            })
            .collect(),
    })
}

fn log_record_from_value(raw: Value) -> Result<LogRecord, String> {
    let record: JsonLogRecord = serde_json::from_value(raw).map_err(|err| err.to_string())?;
    Ok(LogRecord {
        time_unix_nano: record.time_unix_nano,
        severity_number: record.severity_number,
        severity_text: record.severity_text,
        body: record.body.map(any_value_from_json),
        attributes: convert_attributes(record.attributes),
        dropped_attributes_count: record.dropped_attributes_count,
        flags: record.flags,
        trace_id: decode_hex_id(&record.trace_id, "traceId")?,
        span_id: decode_hex_id(&record.span_id, "spanId")?,
        observed_time_unix_nano: record.observed_time_unix_nano,
        event_name: record.event_name,
    })
}

fn span_from_value(raw: Value) -> Result<Span, String> {
    let span: JsonSpan = serde_json::from_value(raw).map_err(|err| err.to_string())?;
    Ok(Span {
        trace_id: decode_hex_id(&span.trace_id, "traceId")?,
        span_id: decode_hex_id(&span.span_id, "spanId")?,
        trace_state: span.trace_state,
        parent_span_id: decode_hex_id(&span.parent_span_id, "parentSpanId")?,
        name: span.name,
        kind: span.kind,
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: convert_attributes(span.attributes),
        dropped_attributes_count: span.dropped_attributes_count,
    })
}

fn decode_hex_id(value: &str, field: &str) -> Result<Vec<u8>, String> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(value).map_err(|err| format!("{} is not valid hex: {}", field, err))
}

fn convert_attributes(attributes: Vec<JsonKeyValue>) -> Vec<KeyValue> {
    attributes.into_iter().map(KeyValue::from).collect()
}

impl From<JsonKeyValue> for KeyValue {
    fn from(value: JsonKeyValue) -> Self {
        Self {
            key: value.key,
            value: value.value.map(any_value_from_json),
        }
    }
}

/// `{}` and unknown kinds become an `AnyValue` with nothing set, the same thing the
/// protobuf decoder yields for an empty value, so downstream skips just that attribute.
fn any_value_from_json(raw: Value) -> AnyValue {
    match serde_json::from_value::<JsonAnyValue>(raw) {
        Ok(value) => AnyValue::from(value),
        Err(err) => {
            debug!(error = %err, "Ignoring JSON attribute value without a known kind");
            AnyValue { value: None }
        }
    }
}

impl From<JsonAnyValue> for AnyValue {
    fn from(value: JsonAnyValue) -> Self {
        let value = match value {
            JsonAnyValue::StringValue(value) => any_value::Value::StringValue(value),
            JsonAnyValue::BoolValue(value) => any_value::Value::BoolValue(value),
            JsonAnyValue::IntValue(value) => any_value::Value::IntValue(value),
            JsonAnyValue::DoubleValue(value) => any_value::Value::DoubleValue(value),
            JsonAnyValue::ArrayValue(array) => any_value::Value::ArrayValue(ArrayValue {
                values: array.values.into_iter().map(any_value_from_json).collect(),
            }),
            JsonAnyValue::KvlistValue(list) => any_value::Value::KvlistValue(KeyValueList {
                values: convert_attributes(list.values),
            }),
            JsonAnyValue::BytesValue(value) => any_value::Value::BytesValue(value.into_bytes()),
        };
        AnyValue { value: Some(value) }
    }
}

impl From<JsonResource> for Resource {
    fn from(value: JsonResource) -> Self {
        Self {
            attributes: convert_attributes(value.attributes),
            dropped_attributes_count: value.dropped_attributes_count,
        }
    }
}

impl From<JsonScope> for InstrumentationScope {
    fn from(value: JsonScope) -> Self {
        Self {
            name: value.name,
            version: value.version,
            attributes: convert_attributes(value.attributes),
        }
    }
}
