//! Request logger: request id, real IP, the per-request `tracing` span,
//! allow-listed body logging, and the `http.request` trace span.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body::Body as _;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use opentelemetry::KeyValue;
use tower::{Layer, Service};
use tracing::{Instrument, Span};

use super::body::{self, BodyFormat, ParsedBody, Phase};
use super::interceptor::{self, ResponseBuffer, ResponseSink, StatusRecorder};
use super::meta::{self, RequestMeta};
use super::trace::{self, Tracer, TRACEPARENT};
use crate::network::config::{LoggerOptions, NetworkConfig};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");
pub const X_SPAN_ID: HeaderName = HeaderName::from_static("x-span-id");

/// Name of the trace span covering one HTTP exchange.
pub const REQUEST_SPAN: &str = "http.request";

// ---------------------------------------------------------------------------
// RequestLoggerLayer
// ---------------------------------------------------------------------------

/// Tower layer installing the request logger.
///
/// Must be the outermost application layer: it creates the request id, the
/// logging span, and the trace span that every inner stage relies on, and it
/// stamps the correlation headers on every response, including the ones it
/// produces itself when a body is rejected.
#[derive(Debug, Clone)]
pub struct RequestLoggerLayer {
    shared: Arc<LoggerShared>,
}

#[derive(Debug)]
struct LoggerShared {
    options: LoggerOptions,
    request_id_header: HeaderName,
    real_ip_header: HeaderName,
    tracer: Tracer,
}

impl RequestLoggerLayer {
    #[must_use]
    pub fn new(config: &NetworkConfig, tracer: Tracer) -> Self {
        Self {
            shared: Arc::new(LoggerShared {
                options: config.logger.clone(),
                request_id_header: config.request_id_header.clone(),
                real_ip_header: config.real_ip_header.clone(),
                tracer,
            }),
        }
    }

    /// Logger with default header names and the given body options.
    #[must_use]
    pub fn with_options(options: LoggerOptions, tracer: Tracer) -> Self {
        let config = NetworkConfig {
            logger: options,
            ..NetworkConfig::default()
        };
        Self::new(&config, tracer)
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggerService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service produced by [`RequestLoggerLayer`].
#[derive(Debug, Clone)]
pub struct RequestLoggerService<S> {
    inner: S,
    shared: Arc<LoggerShared>,
}

impl<S> Service<Request> for RequestLoggerService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The ready service handles this request; the fresh clone waits for the next poll_ready.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(Arc::clone(&self.shared).handle(req, inner))
    }
}

/// Correlation headers stamped on every response.
struct Correlation {
    request_id: String,
    trace_id: String,
    span_id: String,
    traceparent: Option<HeaderValue>,
}

impl Correlation {
    /// Inserts the headers unless the handler already set them.
    fn stamp(&self, headers: &mut HeaderMap) {
        let values = [
            (X_REQUEST_ID, HeaderValue::from_str(&self.request_id).ok()),
            (X_TRACE_ID, HeaderValue::from_str(&self.trace_id).ok()),
            (X_SPAN_ID, HeaderValue::from_str(&self.span_id).ok()),
            (HeaderName::from_static(TRACEPARENT), self.traceparent.clone()),
        ];
        for (name, value) in values {
            if headers.contains_key(&name) {
                continue;
            }
            if let Some(value) = value {
                headers.insert(name, value);
            }
        }
    }
}

impl LoggerShared {
    async fn handle<S>(self: Arc<Self>, req: Request, mut inner: S) -> Result<Response, S::Error>
    where
        S: Service<Request, Response = Response>,
    {
        let started_at = Instant::now();
        let request_id = meta::resolve_request_id(req.headers(), &self.request_id_header);
        let ip = meta::resolve_real_ip(&req, &self.real_ip_header);
        let user_agent = meta::user_agent(req.headers());
        let host = meta::host(&req);
        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_string(), ToString::to_string);

        let parent = trace::extract(req.headers());
        let otel_cx = self.tracer.start(REQUEST_SPAN, SpanKind::Server, &parent);
        otel_cx.span().set_attributes([
            KeyValue::new("http.method", method.to_string()),
            KeyValue::new("http.url", req.uri().to_string()),
            KeyValue::new("http.route", req.uri().path().to_string()),
            KeyValue::new("http.user_agent", user_agent.clone()),
            KeyValue::new("http.request_id", request_id.clone()),
            KeyValue::new("net.host.name", host.clone()),
            KeyValue::new("net.peer.ip", ip.clone()),
        ]);
        let span_context = otel_cx.span().span_context().clone();

        let logger = tracing::info_span!(
            "request",
            request_id = %request_id,
            path = %path,
            method = %method,
            trace_id = %span_context.trace_id(),
            span_id = %span_context.span_id(),
        );
        tracing::info!(
            parent: &logger,
            timestamp = unix_nanos(),
            host = %host,
            ip = %ip,
            user_agent = %user_agent,
            request_headers = ?meta::first_values(req.headers()),
            "request started"
        );

        let correlation = Correlation {
            request_id: request_id.clone(),
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
            traceparent: trace::traceparent(&otel_cx),
        };

        let mut req = if self.options.log_request_body {
            match self.log_request_body(req, &logger).await {
                Ok(req) => req,
                Err(mut rejection) => {
                    correlation.stamp(rejection.headers_mut());
                    complete(&logger, &otel_cx, started_at, &rejection);
                    return Ok(rejection);
                }
            }
        } else {
            req
        };

        req.extensions_mut().insert(RequestMeta {
            request_id,
            started_at,
            ip,
            user_agent,
            trace: span_context,
            logger: logger.clone(),
        });

        let mut response = inner.call(req).instrument(logger.clone()).await?;
        correlation.stamp(response.headers_mut());
        complete(&logger, &otel_cx, started_at, &response);

        if self.options.log_response_body && body::should_log(content_type(response.headers())) {
            response = self.log_response_body(response, &logger).await;
        }
        Ok(response)
    }

    /// Reads, validates, and logs an allow-listed request body, then puts an
    /// identical body back on the request. Returns the rejection response on
    /// a read or parse failure.
    async fn log_request_body(&self, req: Request, logger: &Span) -> Result<Request, Response> {
        let content_type = content_type(req.headers()).to_string();
        if !body::should_log(&content_type) {
            return Ok(req);
        }

        let (parts, raw) = req.into_parts();
        let drained = body::drain(raw).await;
        let req = Request::from_parts(parts, Body::from(drained.bytes.clone()));

        if let Some(err) = drained.error {
            tracing::error!(parent: logger, error = %err, "failed to read request-body");
            return Err(plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read request-body",
            ));
        }

        let format = BodyFormat::detect(&content_type, Phase::Request);
        match body::parse(format, &drained.bytes, self.options.max_body_length) {
            Ok(parsed) => {
                log_parsed(logger, Phase::Request, format, &parsed);
                Ok(req)
            }
            Err(err) => {
                let message = format.failure_message(Phase::Request);
                tracing::error!(parent: logger, error = %err, "{message}");
                Err(plain_error(StatusCode::BAD_REQUEST, &message))
            }
        }
    }

    /// Captures a response body small enough to buffer and logs it. Bodies
    /// without a bounded declared size are passed through untouched.
    async fn log_response_body(&self, response: Response, logger: &Span) -> Response {
        let limit = self.options.max_capture_bytes;
        let bounded = response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|upper| usize::try_from(upper).is_ok_and(|n| n <= limit));
        if !bounded {
            tracing::error!(
                parent: logger,
                "response body is streamed or too large to capture, response-body not logged"
            );
            return response;
        }

        let content_type = content_type(response.headers()).to_string();
        let mut sink = StatusRecorder::wrap(ResponseBuffer::with_limit(limit));
        if let Err(err) = interceptor::replay(response, &mut sink).await {
            tracing::error!(parent: logger, error = %err, "failed to read response-body");
            return sink.into_inner().into_response();
        }

        self.observe_response_body(&sink, &content_type, logger);
        sink.into_inner().into_response()
    }

    fn observe_response_body<S: ResponseSink>(
        &self,
        sink: &StatusRecorder<S>,
        content_type: &str,
        logger: &Span,
    ) {
        let Some(bytes) = sink.read_back() else {
            tracing::error!(parent: logger, "underlying response sink is not readable");
            return;
        };
        let format = BodyFormat::detect(content_type, Phase::Response);
        match body::parse(format, bytes, self.options.max_body_length) {
            Ok(parsed) => log_parsed(logger, Phase::Response, format, &parsed),
            Err(err) => {
                let message = format.failure_message(Phase::Response);
                tracing::error!(parent: logger, error = %err, "{message}");
            }
        }
    }
}

/// Records the outcome on the trace span and ends it, then logs completion.
fn complete(logger: &Span, otel_cx: &opentelemetry::Context, started_at: Instant, response: &Response) {
    let elapsed = started_at.elapsed();
    let duration_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
    let status = response.status();

    let span = otel_cx.span();
    span.set_attributes([
        KeyValue::new("http.request_duration_ms", duration_ms),
        KeyValue::new("http.status_code", i64::from(status.as_u16())),
    ]);
    if status.is_server_error() {
        span.set_status(Status::error(status.to_string()));
    }
    span.end();

    tracing::info!(
        parent: logger,
        duration = ?elapsed,
        completed = true,
        status_code = status.as_u16(),
        status_class = status_class(status),
        response_headers = ?meta::first_values(response.headers()),
        "request completed"
    );
}

fn log_parsed(logger: &Span, phase: Phase, format: BodyFormat, parsed: &ParsedBody) {
    let rendered = parsed.render();
    let message = format.parsed_message(phase);
    match phase {
        Phase::Request => tracing::info!(parent: logger, request_body = %rendered, "{message}"),
        Phase::Response => tracing::info!(parent: logger, response_body = %rendered, "{message}"),
    }
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Leading digit of the status code: `2` for 204, `5` for 502.
fn status_class(status: StatusCode) -> u16 {
    status.as_u16() / 100
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Plain-text error response with a trailing newline and `nosniff`.
pub(crate) fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut response = (status, format!("{message}\n")).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::Method;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use opentelemetry::trace::{SpanId, TraceId};
    use opentelemetry::Value;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};

    use super::*;
    use crate::middleware::trace::attribute;

    const INCOMING: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    /// Echoes the request body, and the request id the logger handed down.
    async fn echo(req: Request) -> Result<Response, Infallible> {
        let request_id = req
            .extensions()
            .get::<RequestMeta>()
            .map(|m| m.request_id.clone())
            .unwrap_or_default();
        let content_type = req.headers().get(CONTENT_TYPE).cloned();
        let body = req.into_body().collect().await.unwrap().to_bytes();

        let mut response = Response::new(Body::from(body));
        response.headers_mut().insert(
            "x-seen-request-id",
            HeaderValue::from_str(&request_id).unwrap(),
        );
        if let Some(ct) = content_type {
            response.headers_mut().insert(CONTENT_TYPE, ct);
        }
        Ok(response)
    }

    fn logger(options: LoggerOptions) -> (RequestLoggerLayer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let layer = RequestLoggerLayer::with_options(options, Tracer::with_exporter(exporter.clone()));
        (layer, exporter)
    }

    fn request_spans(exporter: &InMemorySpanExporter) -> Vec<SpanData> {
        exporter
            .get_finished_spans()
            .unwrap()
            .into_iter()
            .filter(|s| s.name == REQUEST_SPAN)
            .collect()
    }

    fn post(content_type: &str, body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/orders?draft=1")
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_body_is_restored_for_handler() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .oneshot(post("application/json", r#"{"qty":3}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(resp).await, r#"{"qty":3}"#);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_with_correlation_headers() {
        let (layer, exporter) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .oneshot(post("application/json", "{bad"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(resp.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert!(resp.headers().contains_key(X_REQUEST_ID));
        assert!(resp.headers().contains_key(TRACEPARENT));
        assert!(resp.headers().get("x-seen-request-id").is_none());
        assert_eq!(text(resp).await, "failed to parse JSON request-body\n");

        let spans = request_spans(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(attribute(&spans[0], "http.status_code"), Some(&Value::I64(400)));
    }

    #[tokio::test]
    async fn malformed_form_and_xml_are_rejected() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .clone()
            .oneshot(post("application/x-www-form-urlencoded", "a=%zz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(resp).await, "failed to parse form-urlencoded request-body\n");

        let resp = svc
            .oneshot(post("application/xml", "<open>"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text(resp).await, "failed to parse XML request-body\n");
    }

    #[tokio::test]
    async fn read_failure_is_internal_error() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"a\"")),
            Err(std::io::Error::other("reset")),
        ];
        let req = Request::builder()
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let resp = svc.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text(resp).await, "failed to read request-body\n");
    }

    #[tokio::test]
    async fn unlisted_content_types_pass_untouched() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .oneshot(post("text/plain", "{bad"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(resp).await, "{bad");
    }

    #[tokio::test]
    async fn body_checks_are_skipped_when_disabled() {
        let (layer, _) = logger(LoggerOptions::quiet());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .oneshot(post("application/json", "{bad"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn caller_request_id_is_propagated() {
        let (layer, exporter) = logger(LoggerOptions::quiet());
        let svc = layer.layer(tower::service_fn(echo));

        let req = Request::builder()
            .uri("/health")
            .header(X_REQUEST_ID, "req-42")
            .body(Body::empty())
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();

        assert_eq!(resp.headers()[X_REQUEST_ID], "req-42");
        assert_eq!(resp.headers()["x-seen-request-id"], "req-42");
        let span = &request_spans(&exporter)[0];
        assert_eq!(attribute(span, "http.request_id"), Some(&Value::from("req-42")));
        assert_eq!(
            resp.headers()[X_TRACE_ID],
            span.span_context.trace_id().to_string().as_str()
        );
        assert_eq!(
            resp.headers()[X_SPAN_ID],
            span.span_context.span_id().to_string().as_str()
        );
    }

    #[tokio::test]
    async fn incoming_trace_is_continued() {
        let (layer, exporter) = logger(LoggerOptions::quiet());
        let svc = layer.layer(tower::service_fn(echo));

        let req = Request::builder()
            .uri("/")
            .header(TRACEPARENT, INCOMING)
            .body(Body::empty())
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();

        let span = &request_spans(&exporter)[0];
        let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
        assert_eq!(span.span_context.trace_id(), trace_id);
        assert_eq!(span.parent_span_id, SpanId::from_hex("b7ad6b7169203331").unwrap());
        assert_eq!(span.span_kind, SpanKind::Server);
        let expected = format!("00-{trace_id}-{}-01", span.span_context.span_id());
        assert_eq!(resp.headers()[TRACEPARENT], expected.as_str());
    }

    #[tokio::test]
    async fn span_ends_when_handler_panics() {
        let (layer, exporter) = logger(LoggerOptions::quiet());
        async fn explode(_req: Request) -> Result<Response, Infallible> {
            panic!("handler failure")
        }
        let svc = layer.layer(tower::service_fn(explode));

        let joined = tokio::spawn(svc.oneshot(Request::new(Body::empty()))).await;
        assert!(joined.is_err());
        assert_eq!(request_spans(&exporter).len(), 1);
    }

    #[tokio::test]
    async fn server_errors_mark_the_span_failed() {
        let (layer, exporter) = logger(LoggerOptions::quiet());
        let svc = layer.layer(tower::service_fn(|_req: Request| async move {
            Ok::<_, Infallible>(StatusCode::BAD_GATEWAY.into_response())
        }));

        let resp = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let span = &request_spans(&exporter)[0];
        assert_eq!(attribute(span, "http.status_code"), Some(&Value::I64(502)));
        assert!(matches!(span.status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn response_body_is_captured_and_delivered() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(echo));

        let resp = svc
            .oneshot(post("application/json", r#"{"ok":true}"#))
            .await
            .unwrap();
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(text(resp).await, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn unparseable_json_response_is_delivered_unchanged() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(|_req: Request| async move {
            Ok::<_, Infallible>(([(CONTENT_TYPE, "application/json")], "{not json").into_response())
        }));

        let resp = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert!(resp.headers().contains_key(X_REQUEST_ID));
        assert_eq!(text(resp).await, "{not json");
    }

    #[tokio::test]
    async fn streamed_response_is_not_buffered() {
        let (layer, _) = logger(LoggerOptions::default());
        let svc = layer.layer(tower::service_fn(|_req: Request| async move {
            let chunks: Vec<Result<bytes::Bytes, Infallible>> =
                vec![Ok(bytes::Bytes::from_static(b"[1,")), Ok(bytes::Bytes::from_static(b"2]"))];
            let mut response = Response::new(Body::from_stream(futures_util::stream::iter(chunks)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok::<_, Infallible>(response)
        }));

        let resp = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(text(resp).await, "[1,2]");
    }

    #[test]
    fn unreadable_sink_is_reported_not_failed() {
        #[derive(Default)]
        struct Discard(HeaderMap);
        impl ResponseSink for Discard {
            fn headers_mut(&mut self) -> &mut HeaderMap {
                &mut self.0
            }
            fn write_header(&mut self, _status: StatusCode) {}
            fn write(&mut self, chunk: &[u8]) -> Result<usize, interceptor::SinkError> {
                Ok(chunk.len())
            }
        }

        let shared = LoggerShared {
            options: LoggerOptions::default(),
            request_id_header: X_REQUEST_ID,
            real_ip_header: HeaderName::from_static("x-real-ip"),
            tracer: Tracer::default(),
        };
        let sink = StatusRecorder::wrap(Discard::default());
        shared.observe_response_body(&sink, "application/json", &Span::none());
        assert!(sink.read_back().is_none());
    }

    #[test]
    fn status_class_groups_by_hundreds() {
        assert_eq!(status_class(StatusCode::OK), 2);
        assert_eq!(status_class(StatusCode::NO_CONTENT), 2);
        assert_eq!(status_class(StatusCode::NOT_FOUND), 4);
        assert_eq!(status_class(StatusCode::BAD_GATEWAY), 5);
    }
}
