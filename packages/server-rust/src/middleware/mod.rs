//! HTTP middleware: request logging, trace propagation, locale negotiation,
//! and request-scope enrichment.

pub mod body;
pub mod interceptor;
pub mod locale;
pub mod logging;
pub mod meta;
pub mod scope;
pub mod trace;

pub use interceptor::{ResponseBuffer, ResponseSink, SinkError, StatusRecorder};
pub use locale::LocaleLayer;
pub use logging::{RequestLoggerLayer, X_REQUEST_ID, X_SPAN_ID, X_TRACE_ID};
pub use meta::RequestMeta;
pub use scope::{CurrentUser, ParamsSource, Scope, ScopeConfig, ScopeHook, ScopeLayer, ScopeRejection};
pub use trace::{attribute, LogExporter, TracedLayer, Tracer, TRACEPARENT};
