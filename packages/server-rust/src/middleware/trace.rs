//! Distributed-trace spans on the OpenTelemetry SDK, with W3C
//! `traceparent` propagation over HTTP headers.
//!
//! A [`Tracer`] wraps an injected [`SdkTracerProvider`]. Started spans live
//! inside an OpenTelemetry [`Context`]; the SDK ends a span when the last
//! context holding it is dropped, so a span ends on every exit path of the
//! code holding it, unwinding included.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{self, Poll};

use axum::extract::Request;
use http::header::HOST;
use http::{HeaderMap, HeaderValue};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_http::{HeaderExtractor, HeaderInjector};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, SpanData, SpanExporter};
use tower::{Layer, Service};

/// W3C trace-context header.
pub const TRACEPARENT: &str = "traceparent";

/// `tracing` target of the events written by [`LogExporter`].
pub const LOG_TARGET: &str = "keel_server::trace";

const INSTRUMENTATION_SCOPE: &str = "keel-server";

/// Writes every finished span as a `tracing` debug event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
        for span in &batch {
            let duration_ms = span
                .end_time
                .duration_since(span.start_time)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            tracing::debug!(
                target: LOG_TARGET,
                name = %span.name,
                trace_id = %span.span_context.trace_id(),
                span_id = %span.span_context.span_id(),
                parent_span_id = %span.parent_span_id,
                duration_ms,
                attributes = ?span.attributes,
                "span finished"
            );
        }
        std::future::ready(Ok(()))
    }
}

/// Starts spans through an injected tracer provider.
#[derive(Clone)]
pub struct Tracer {
    provider: SdkTracerProvider,
    tracer: SdkTracer,
}

impl Tracer {
    #[must_use]
    pub fn new(provider: SdkTracerProvider) -> Self {
        let tracer = provider.tracer(INSTRUMENTATION_SCOPE);
        Self { provider, tracer }
    }

    /// Tracer that hands each span to `exporter` as soon as it ends.
    #[must_use]
    pub fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Self {
        Self::new(
            SdkTracerProvider::builder()
                .with_simple_exporter(exporter)
                .build(),
        )
    }

    #[must_use]
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    /// Starts a span as a child of the span in `parent`, or as a new root
    /// trace when `parent` holds none. Returns `parent` extended with the
    /// new span.
    #[must_use]
    pub fn start(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &Context,
    ) -> Context {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .start_with_context(&self.tracer, parent);
        parent.with_span(span)
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::with_exporter(LogExporter)
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("scope", &INSTRUMENTATION_SCOPE)
            .finish_non_exhaustive()
    }
}

/// Reads the caller's trace position from `traceparent`. A missing or
/// malformed header yields a context without a remote span, which starts a
/// new trace.
#[must_use]
pub fn extract(headers: &HeaderMap) -> Context {
    let cx = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
    if headers.contains_key(TRACEPARENT) && !cx.span().span_context().is_valid() {
        tracing::debug!(value = ?headers.get(TRACEPARENT), "ignoring malformed traceparent");
    }
    cx
}

/// Writes the span in `cx` as the `traceparent` header, replacing any
/// existing value.
pub fn inject(cx: &Context, headers: &mut HeaderMap) {
    TraceContextPropagator::new().inject_context(cx, &mut HeaderInjector(headers));
}

/// The `traceparent` value for the span in `cx`, `None` when it holds no
/// valid span.
#[must_use]
pub fn traceparent(cx: &Context) -> Option<HeaderValue> {
    let mut headers = HeaderMap::new();
    inject(cx, &mut headers);
    headers.remove(TRACEPARENT)
}

/// Latest value recorded for `key` on a finished span.
#[must_use]
pub fn attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .rev()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

// ---------------------------------------------------------------------------
// TracedLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps a named middleware stage in its own span.
///
/// The stage span is a child of the incoming trace position, and the
/// request's `traceparent` is rewritten so that inner stages become its
/// children.
#[derive(Debug, Clone)]
pub struct TracedLayer {
    name: Cow<'static, str>,
    tracer: Tracer,
}

impl TracedLayer {
    pub fn new(name: impl Into<Cow<'static, str>>, tracer: Tracer) -> Self {
        Self {
            name: name.into(),
            tracer,
        }
    }
}

impl<S> Layer<S> for TracedLayer {
    type Service = TracedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracedService {
            inner,
            name: self.name.clone(),
            tracer: self.tracer.clone(),
        }
    }
}

/// Service produced by [`TracedLayer`].
#[derive(Debug, Clone)]
pub struct TracedService<S> {
    inner: S,
    name: Cow<'static, str>,
    tracer: Tracer,
}

impl<S> Service<Request> for TracedService<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let parent = extract(req.headers());
        let cx = self.tracer.start(
            format!("middleware.{}", self.name),
            SpanKind::Internal,
            &parent,
        );
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        cx.span().set_attributes([
            KeyValue::new("middleware.name", self.name.to_string()),
            KeyValue::new("http.method", req.method().to_string()),
            KeyValue::new("http.url", req.uri().to_string()),
            KeyValue::new("http.host", host),
        ]);
        inject(&cx, req.headers_mut());

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            cx.span().end();
            result
        })
    }
}
