//! HTTP middleware stack for the Keel server.
//!
//! Builds the Tower middleware pipeline applied to all HTTP requests.
//! Middleware ordering follows the outer-to-inner convention: the first
//! layer listed is the outermost (processes the request first on the way
//! in, and the response last on the way out).

use axum::http::{Method, StatusCode};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use super::config::NetworkConfig;
use crate::middleware::{LocaleLayer, RequestLoggerLayer, ScopeConfig, ScopeLayer, Tracer};

/// The composed Tower layer type produced by [`build_http_layers`].
pub type HttpLayers = tower::layer::util::Stack<
    ScopeLayer,
    tower::layer::util::Stack<
        LocaleLayer,
        tower::layer::util::Stack<
            TimeoutLayer,
            tower::layer::util::Stack<
                CorsLayer,
                tower::layer::util::Stack<RequestLoggerLayer, tower::layer::util::Identity>,
            >,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `RequestLogger` -- request id, logging span, body logging, `http.request` span
/// 2. `CORS` -- Cross-Origin Resource Sharing based on configured origins
/// 3. `Timeout` -- enforces a maximum request processing duration
/// 4. `Locale` -- negotiates the request locale
/// 5. `Scope` -- attaches the typed request scope read by handlers
#[must_use]
pub fn build_http_layers(config: &NetworkConfig, tracer: Tracer, scope: ScopeConfig) -> HttpLayers {
    let locale = LocaleLayer::for_app(scope.app());

    ServiceBuilder::new()
        .layer(RequestLoggerLayer::new(config, tracer))
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(locale)
        .layer(ScopeLayer::new(scope))
        .into_inner()
}

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` in the origins list allows any origin. Otherwise,
/// each origin string is parsed and added to an explicit allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}
