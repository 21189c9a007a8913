//! OTLP/HTTP receiver.
//!
//! Handlers decode the body, hand every event to the tracker, and acknowledge in the
//! encoding the client used. A body that cannot be decoded at all is a 400 with a plain-text
//! reason; nothing reaches the tracker in that case.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pulse_protocol::{
    decode_logs, decode_metrics, decode_traces, export_response, DecodeError, DecodedBatch,
    PayloadFormat, Signal, MAX_REQUEST_BYTES,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::tracker::SessionTracker;

pub fn router(tracker: Arc<SessionTracker>) -> Router {
    Router::new()
        .route("/v1/logs", post(export_logs))
        .route("/v1/traces", post(export_traces))
        .route("/v1/metrics", post(export_metrics))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(tracker)
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn ack(signal: Signal, format: PayloadFormat, rejected: u64) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.content_type())],
        export_response(signal, format, rejected),
    )
        .into_response()
}

fn rejection(signal: Signal, headers: &HeaderMap, body_len: usize, err: &DecodeError) -> Response {
    warn!(
        path = signal.path(),
        content_type = header_str(headers, header::CONTENT_TYPE).unwrap_or("-"),
        content_encoding = header_str(headers, header::CONTENT_ENCODING).unwrap_or("-"),
        body_bytes = body_len,
        code = err.code(),
        error = %err,
        "Rejecting undecodable export request"
    );
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        err.to_string(),
    )
        .into_response()
}

async fn ingest(
    tracker: &Arc<SessionTracker>,
    signal: Signal,
    headers: &HeaderMap,
    body: &Bytes,
    decoded: Result<DecodedBatch, DecodeError>,
) -> Response {
    let format = PayloadFormat::from_content_type(header_str(headers, header::CONTENT_TYPE));
    let batch = match decoded {
        Ok(batch) => batch,
        Err(err) => return rejection(signal, headers, body.len(), &err),
    };

    if batch.rejected > 0 {
        debug!(
            path = signal.path(),
            rejected = batch.rejected,
            accepted = batch.events.len(),
            "Some records could not be decoded"
        );
    }
    for event in batch.events {
        tracker.process_event(event).await;
    }
    ack(signal, format, batch.rejected)
}

async fn export_logs(
    State(tracker): State<Arc<SessionTracker>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let decoded = decode_logs(
        &body,
        header_str(&headers, header::CONTENT_TYPE),
        header_str(&headers, header::CONTENT_ENCODING),
        Utc::now(),
    );
    ingest(&tracker, Signal::Logs, &headers, &body, decoded).await
}

async fn export_traces(
    State(tracker): State<Arc<SessionTracker>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let decoded = decode_traces(
        &body,
        header_str(&headers, header::CONTENT_TYPE),
        header_str(&headers, header::CONTENT_ENCODING),
        Utc::now(),
    );
    ingest(&tracker, Signal::Traces, &headers, &body, decoded).await
}

/// Metrics are only a liveness signal. The response is always a 200 so exporters never
/// back off because of it.
async fn export_metrics(
    State(tracker): State<Arc<SessionTracker>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = PayloadFormat::from_content_type(header_str(&headers, header::CONTENT_TYPE));
    match decode_metrics(
        &body,
        header_str(&headers, header::CONTENT_TYPE),
        header_str(&headers, header::CONTENT_ENCODING),
    ) {
        Ok(heartbeat) => {
            for tool in heartbeat.tools {
                tracker.process_heartbeat_for_tool(tool);
            }
            for session_id in &heartbeat.session_ids {
                tracker.process_heartbeat(session_id);
            }
        }
        Err(err) => debug!(code = err.code(), error = %err, "Ignoring undecodable metrics"),
    }
    ack(Signal::Metrics, format, 0)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
    version: &'static str,
    sessions: usize,
}

async fn health(State(tracker): State<Arc<SessionTracker>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: tracker.live_session_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NoopNotifier;
    use crate::output::MemorySink;
    use crate::tracker::TrackerSettings;
    use crate::window::NoopWindowResolver;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use prost::Message;
    use pulse_protocol::otlp::{
        AnyValue, ExportLogsServiceRequest, ExportLogsServiceResponse, KeyValue, LogRecord,
        Resource, ResourceLogs, ScopeLogs,
    };
    use pulse_protocol::{SessionState, Tool};
    use serde_json::Value;
    use std::io::Write;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const CODEX_START_JSON: &str = r#"{"resourceLogs":[{"resource":{"attributes":[
        {"key":"service.name","value":{"stringValue":"codex_cli_rs"}}]},
        "scopeLogs":[{"logRecords":[{
            "body":{"stringValue":"codex.conversation_starts"},
            "attributes":[{"key":"thread_id","value":{"stringValue":"abc"}}]
        }]}]}]}"#;

    fn tracker() -> Arc<SessionTracker> {
        Arc::new(SessionTracker::new(
            TrackerSettings {
                quiet_period: Duration::from_secs(5),
                completed_timeout: Duration::from_secs(30),
                session_timeout: Duration::from_secs(1800),
                notify_on_completion: false,
            },
            Arc::new(NoopWindowResolver),
            Arc::new(NoopNotifier),
            Arc::new(MemorySink::default()),
            CancellationToken::new(),
        ))
    }

    fn post_request(path: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, content_type)
            .body(body.into())
            .expect("request")
    }

    async fn body_bytes(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.expect("body")
    }

    fn claude_logs(records: Vec<LogRecord>) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(Resource {
                    attributes: vec![KeyValue::string("service.name", "claude-code")],
                    ..Default::default()
                }),
                scope_logs: vec![ScopeLogs {
                    log_records: records,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn claude_record(event: &str, session_id: &str) -> LogRecord {
        LogRecord {
            body: Some(AnyValue::string(event)),
            attributes: vec![KeyValue::string("session.id", session_id)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn json_logs_create_working_session() {
        let tracker = tracker();
        let response = router(Arc::clone(&tracker))
            .oneshot(post_request("/v1/logs", "application/json", CODEX_START_JSON))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/json"
        );
        assert_eq!(&body_bytes(response).await[..], b"{}");

        let session = tracker.session("abc").expect("session");
        assert_eq!(session.state, SessionState::Working);
        assert_eq!(session.tool, Tool::Codex);
    }

    #[tokio::test]
    async fn protobuf_logs_ack_in_protobuf() {
        let tracker = tracker();
        let body = claude_logs(vec![claude_record("claude_code.user_prompt", "c-1")])
            .encode_to_vec();
        let response = router(Arc::clone(&tracker))
            .oneshot(post_request("/v1/logs", "application/x-protobuf", body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/x-protobuf"
        );
        let ack = ExportLogsServiceResponse::decode(body_bytes(response).await).expect("ack");
        assert!(ack.partial_success.is_none());
        assert_eq!(
            tracker.session("c-1").expect("session").state,
            SessionState::Working
        );
    }

    #[tokio::test]
    async fn gzip_bodies_are_accepted() {
        let tracker = tracker();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(CODEX_START_JSON.as_bytes())
            .expect("gzip write");
        let body = encoder.finish().expect("gzip finish");

        let request = Request::builder()
            .method("POST")
            .uri("/v1/logs")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(body))
            .expect("request");
        let response = router(Arc::clone(&tracker))
            .oneshot(request)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(tracker.session("abc").is_some());
    }

    #[tokio::test]
    async fn corrupt_binary_body_is_rejected_and_health_stays_up() {
        let tracker = tracker();
        let app = router(Arc::clone(&tracker));
        let response = app
            .clone()
            .oneshot(post_request(
                "/v1/logs",
                "application/x-protobuf",
                vec![0x0a, 0xff, 0xff, 0xff, 0xff, 0x0f, 0x01],
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/plain")));
        assert!(!body_bytes(response).await.is_empty());
        assert_eq!(tracker.live_session_count(), 0);

        let health = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);
        let value: Value = serde_json::from_slice(&body_bytes(health).await).expect("json");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["sessions"], 0);
        assert_eq!(value["pid"], std::process::id());
    }

    #[tokio::test]
    async fn unsupported_encoding_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "br")
            .body(Body::from("{}"))
            .expect("request");
        let response = router(tracker()).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn partially_bad_json_reports_rejected_records() {
        let tracker = tracker();
        let body = r#"{"resourceLogs":[{"resource":{"attributes":[
            {"key":"service.name","value":{"stringValue":"gemini-cli"}}]},
            "scopeLogs":[{"logRecords":[
                {"body":{"stringValue":"gemini_cli.user_prompt"},
                 "attributes":[{"key":"session.id","value":{"stringValue":"g-1"}}]},
                {"body":{"stringValue":"gemini_cli.api_request"},
                 "traceId":"not-hex",
                 "attributes":[{"key":"session.id","value":{"stringValue":"g-1"}}]}
            ]}]}]}"#;
        let response = router(Arc::clone(&tracker))
            .oneshot(post_request("/v1/logs", "application/json", body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let value: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
        assert_eq!(value["partialSuccess"]["rejectedLogRecords"], "1");
        assert_eq!(
            tracker.session("g-1").expect("session").state,
            SessionState::Working
        );
    }

    #[tokio::test]
    async fn traces_feed_the_tracker() {
        let tracker = tracker();
        let body = r#"{"resourceSpans":[{"resource":{"attributes":[
            {"key":"service.name","value":{"stringValue":"codex_cli_rs"}}]},
            "scopeSpans":[{"spans":[{
                "name":"run_turn",
                "startTimeUnixNano":"1767225600000000000",
                "endTimeUnixNano":"1767225601000000000",
                "attributes":[{"key":"conversation.id","value":{"stringValue":"t-9"}}]
            }]}]}]}"#;
        let response = router(Arc::clone(&tracker))
            .oneshot(post_request("/v1/traces", "application/json", body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            tracker.session("t-9").expect("session").state,
            SessionState::Working
        );
    }

    #[tokio::test]
    async fn metrics_always_acknowledge() {
        let tracker = tracker();
        let app = router(Arc::clone(&tracker));

        let garbage = app
            .clone()
            .oneshot(post_request("/v1/metrics", "application/x-protobuf", vec![0xff; 8]))
            .await
            .expect("response");
        assert_eq!(garbage.status(), StatusCode::OK);

        let body = r#"{"resourceMetrics":[{"resource":{"attributes":[
            {"key":"service.name","value":{"stringValue":"codex_cli_rs"}}]}}]}"#;
        let ok = app
            .oneshot(post_request("/v1/metrics", "application/json", body))
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(&body_bytes(ok).await[..], b"{}");
        // Heartbeats never create sessions.
        assert_eq!(tracker.live_session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_named_in_metrics_stays_working() {
        let tracker = tracker();
        let app = router(Arc::clone(&tracker));
        let started = app
            .clone()
            .oneshot(post_request("/v1/logs", "application/json", CODEX_START_JSON))
            .await
            .expect("response");
        assert_eq!(started.status(), StatusCode::OK);

        // The service name maps to no tool, so only the session id keeps it alive.
        let metrics = r#"{"resourceMetrics":[{"resource":{"attributes":[
            {"key":"service.name","value":{"stringValue":"otel-collector"}},
            {"key":"thread_id","value":{"stringValue":"abc"}}]}}]}"#;
        tokio::time::sleep(Duration::from_secs(4)).await;
        let ok = app
            .oneshot(post_request("/v1/metrics", "application/json", metrics))
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            tracker.session("abc").expect("session").state,
            SessionState::Working
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            tracker.session("abc").expect("session").state,
            SessionState::Completed
        );
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let body = vec![b' '; MAX_REQUEST_BYTES + 1];
        let request = Request::builder()
            .method("POST")
            .uri("/v1/logs")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .expect("request");
        let response = router(tracker()).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
