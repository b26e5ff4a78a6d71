//! Request enrichment: builds the typed [`RequestScope`] every handler reads.
//!
//! Values are attached in a fixed order: logger, identity (user and
//! session), tenant, locale and page context, application, pool, and
//! request params. Registered [`ScopeHook`]s then run in registration
//! order, each seeing everything attached before it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{FromRequestParts, Request};
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use http::StatusCode;
use keel_core::{
    Application, ConnectionPool, Locale, Localizer, NullPool, PageContext, RequestParams,
    RequestScope, TenantId, User,
};
use tower::{Layer, Service};

use super::meta::{self, RequestMeta};
use crate::traits::{Anonymous, IdentityProvider};

/// Extra enrichment step run after the standard attachments.
pub trait ScopeHook: Send + Sync {
    fn apply(&self, scope: RequestScope, parts: &Parts) -> RequestScope;
}

impl<F> ScopeHook for F
where
    F: Fn(RequestScope, &Parts) -> RequestScope + Send + Sync,
{
    fn apply(&self, scope: RequestScope, parts: &Parts) -> RequestScope {
        self(scope, parts)
    }
}

/// Where [`RequestParams`] come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamsSource {
    /// Client address and user agent as seen by the request logger.
    Transport,
    /// Fixed values, for synthetic requests.
    Fixed { ip: String, user_agent: String },
}

/// Collaborators consulted while enriching a request.
pub struct ScopeConfig {
    app: Arc<Application>,
    identity: Arc<dyn IdentityProvider>,
    pool: Arc<dyn ConnectionPool>,
    default_tenant: Option<TenantId>,
    params: ParamsSource,
    hooks: Vec<Arc<dyn ScopeHook>>,
}

impl ScopeConfig {
    /// Anonymous identity, no pool, transport params, no hooks.
    #[must_use]
    pub fn new(app: Arc<Application>) -> Self {
        Self {
            app,
            identity: Arc::new(Anonymous),
            pool: Arc::new(NullPool),
            default_tenant: None,
            params: ParamsSource::Transport,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn identity(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = provider;
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Tenant attached when the identity does not name one.
    #[must_use]
    pub fn default_tenant(mut self, tenant: TenantId) -> Self {
        self.default_tenant = Some(tenant);
        self
    }

    #[must_use]
    pub fn params(mut self, params: ParamsSource) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn ScopeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn hooks(self, hooks: impl IntoIterator<Item = Arc<dyn ScopeHook>>) -> Self {
        hooks.into_iter().fold(self, Self::hook)
    }

    #[must_use]
    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    /// Builds the scope for one request.
    pub async fn enrich(&self, parts: &Parts) -> RequestScope {
        let meta = parts.extensions.get::<RequestMeta>();

        let mut scope = match meta {
            Some(meta) => RequestScope::new(meta.request_id.clone(), meta.started_at)
                .with_logger(meta.logger.clone())
                .with_trace(meta.trace.clone()),
            None => RequestScope::new(uuid::Uuid::new_v4().to_string(), Instant::now()),
        };

        let identity = match self.identity.resolve(parts).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(
                    parent: scope.logger(),
                    error = %err,
                    "identity lookup failed, continuing anonymously"
                );
                None
            }
        };
        scope = scope.with_user(identity.as_ref().map(|i| Arc::clone(&i.user)));
        if let Some(identity) = &identity {
            scope = scope.with_session(Arc::clone(&identity.session));
        }

        if let Some(tenant) = identity.as_ref().map(|i| i.tenant_id).or(self.default_tenant) {
            scope = scope.with_tenant(tenant);
        }

        let locale = page_locale(scope.user().map(Arc::as_ref), parts, &self.app);
        scope = scope.with_page(PageContext {
            locale,
            path: parts.uri.path().to_string(),
            localizer: Localizer::new(self.app.bundle(), locale),
        });

        let authenticated = scope.is_authenticated();
        let (ip, user_agent) = match &self.params {
            ParamsSource::Fixed { ip, user_agent } => (ip.clone(), user_agent.clone()),
            ParamsSource::Transport => transport_params(meta, parts),
        };
        scope = scope
            .with_app(Arc::clone(&self.app))
            .with_pool(Arc::clone(&self.pool))
            .with_params(RequestParams {
                ip,
                user_agent,
                authenticated,
            });

        self.hooks
            .iter()
            .fold(scope, |scope, hook| hook.apply(scope, parts))
    }
}

impl std::fmt::Debug for ScopeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("app", &self.app)
            .field("pool", &self.pool)
            .field("default_tenant", &self.default_tenant)
            .field("params", &self.params)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// The signed-in user's UI language, then the negotiated locale, then the default.
fn page_locale(user: Option<&User>, parts: &Parts, app: &Application) -> Locale {
    user.map(|u| u.ui_language)
        .or_else(|| parts.extensions.get::<Locale>().copied())
        .unwrap_or_else(|| app.default_locale())
}

fn transport_params(meta: Option<&RequestMeta>, parts: &Parts) -> (String, String) {
    match meta {
        Some(meta) => (meta.ip.clone(), meta.user_agent.clone()),
        None => (meta::peer_addr(&parts.extensions), meta::user_agent(&parts.headers)),
    }
}

// ---------------------------------------------------------------------------
// ScopeLayer
// ---------------------------------------------------------------------------

/// Tower layer that attaches a [`RequestScope`] to every request.
#[derive(Debug, Clone)]
pub struct ScopeLayer {
    config: Arc<ScopeConfig>,
}

impl ScopeLayer {
    #[must_use]
    pub fn new(config: ScopeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for ScopeLayer {
    type Service = ScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ScopeService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// Service produced by [`ScopeLayer`].
#[derive(Debug, Clone)]
pub struct ScopeService<S> {
    inner: S,
    config: Arc<ScopeConfig>,
}

impl<S> Service<Request> for ScopeService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let scope = config.enrich(&parts).await;
            parts.extensions.insert(scope);
            inner.call(Request::from_parts(parts, body)).await
        })
    }
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// Rejection for scope extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeRejection {
    #[error("request scope missing; is ScopeLayer installed?")]
    Missing,
    #[error("authentication required")]
    Unauthenticated,
}

impl IntoResponse for ScopeRejection {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Missing => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
        };
        super::logging::plain_error(status, &self.to_string())
    }
}

/// Extracts the request's [`RequestScope`].
#[derive(Debug, Clone)]
pub struct Scope(pub RequestScope);

impl<S> FromRequestParts<S> for Scope
where
    S: Send + Sync,
{
    type Rejection = ScopeRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestScope>()
            .cloned()
            .map(Scope)
            .ok_or(ScopeRejection::Missing)
    }
}

/// Extracts the signed-in user, rejecting anonymous requests with 401.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Arc<User>);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ScopeRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let scope = parts
            .extensions
            .get::<RequestScope>()
            .ok_or(ScopeRejection::Missing)?;
        scope
            .user()
            .cloned()
            .map(CurrentUser)
            .ok_or(ScopeRejection::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use http::header::USER_AGENT;
    use keel_core::{Bundle, Module, Session, UserId};
    use tower::ServiceExt;

    use super::*;
    use crate::traits::Identity;

    struct Greetings;

    impl Module for Greetings {
        fn name(&self) -> &'static str {
            "greetings"
        }

        fn register_messages(&self, bundle: &mut Bundle) {
            bundle.insert(Locale::En, "Hello", "Hello");
            bundle.insert(Locale::Ru, "Hello", "Привет");
        }
    }

    fn app() -> Arc<Application> {
        Arc::new(Application::builder().module(Arc::new(Greetings)).build())
    }

    fn user(tenant: TenantId, ui_language: Locale) -> Arc<User> {
        Arc::new(User {
            id: UserId(7),
            tenant_id: tenant,
            email: "ops@example.com".to_string(),
            first_name: "Olga".to_string(),
            last_name: "Petrova".to_string(),
            ui_language,
            permissions: vec!["orders.read".to_string()],
        })
    }

    struct Fixed(Identity);

    #[async_trait]
    impl IdentityProvider for Fixed {
        async fn resolve(&self, _parts: &Parts) -> anyhow::Result<Option<Identity>> {
            Ok(Some(self.0.clone()))
        }
    }

    struct Broken;

    #[async_trait]
    impl IdentityProvider for Broken {
        async fn resolve(&self, _parts: &Parts) -> anyhow::Result<Option<Identity>> {
            anyhow::bail!("session store unreachable")
        }
    }

    fn parts(locale: Option<Locale>) -> Parts {
        let mut req = Request::builder()
            .uri("/orders/7")
            .header(USER_AGENT, "curl/8")
            .body(())
            .unwrap();
        if let Some(locale) = locale {
            req.extensions_mut().insert(locale);
        }
        req.into_parts().0
    }

    #[tokio::test]
    async fn anonymous_scope_gets_negotiated_locale() {
        let config = ScopeConfig::new(app());
        let scope = config.enrich(&parts(Some(Locale::Ru))).await;

        assert!(!scope.is_authenticated());
        assert!(scope.tenant_id().is_none());
        assert_eq!(scope.locale(), Locale::Ru);
        assert_eq!(scope.page().unwrap().path, "/orders/7");
        assert_eq!(scope.page().unwrap().t("Hello"), "Привет");
        assert_eq!(scope.pool().unwrap().backend(), "null");
        assert_eq!(scope.params().unwrap().user_agent, "curl/8");
        assert!(!scope.params().unwrap().authenticated);
    }

    #[tokio::test]
    async fn transport_params_without_logger_use_the_peer_address() {
        let config = ScopeConfig::new(app());

        let mut connected = parts(None);
        connected
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 41000))));
        let scope = config.enrich(&connected).await;
        assert_eq!(scope.params().unwrap().ip, "10.0.0.5:41000");

        let scope = config.enrich(&parts(None)).await;
        assert_eq!(scope.params().unwrap().ip, "unknown");
    }

    #[tokio::test]
    async fn identity_sets_user_session_and_tenant() {
        let tenant = TenantId::random();
        let identity = Identity {
            user: user(tenant, Locale::En),
            tenant_id: tenant,
            session: Arc::new(Session::default()),
        };
        let config = ScopeConfig::new(app())
            .identity(Arc::new(Fixed(identity)))
            .default_tenant(TenantId::random());
        let scope = config.enrich(&parts(Some(Locale::Ru))).await;

        assert_eq!(scope.user().unwrap().id, UserId(7));
        assert!(scope.session().is_some());
        assert_eq!(scope.tenant_id(), Some(tenant));
        // The user's own UI language wins over Accept-Language.
        assert_eq!(scope.locale(), Locale::En);
        assert!(scope.params().unwrap().authenticated);
    }

    #[tokio::test]
    async fn identity_failure_degrades_to_anonymous() {
        let fallback = TenantId::random();
        let config = ScopeConfig::new(app())
            .identity(Arc::new(Broken))
            .default_tenant(fallback);
        let scope = config.enrich(&parts(None)).await;

        assert!(!scope.is_authenticated());
        assert_eq!(scope.tenant_id(), Some(fallback));
    }

    #[tokio::test]
    async fn hooks_run_in_order_after_standard_values() {
        let first: Arc<dyn ScopeHook> = Arc::new(|scope: RequestScope, _: &Parts| {
            assert!(scope.page().is_some());
            scope.with_params(RequestParams {
                ip: "first".to_string(),
                user_agent: String::new(),
                authenticated: false,
            })
        });
        let second: Arc<dyn ScopeHook> = Arc::new(|scope: RequestScope, _: &Parts| {
            let ip = scope.params().map(|p| format!("{}+second", p.ip)).unwrap_or_default();
            scope.with_params(RequestParams {
                ip,
                user_agent: String::new(),
                authenticated: false,
            })
        });
        let config = ScopeConfig::new(app()).hooks([first, second]);
        let scope = config.enrich(&parts(None)).await;

        assert_eq!(scope.params().unwrap().ip, "first+second");
    }

    #[tokio::test]
    async fn fixed_params_override_transport() {
        let config = ScopeConfig::new(app()).params(ParamsSource::Fixed {
            ip: "127.0.0.1".to_string(),
            user_agent: "test-agent".to_string(),
        });
        let scope = config.enrich(&parts(None)).await;
        let params = scope.params().unwrap();
        assert_eq!(params.ip, "127.0.0.1");
        assert_eq!(params.user_agent, "test-agent");
    }

    #[tokio::test]
    async fn layer_makes_scope_extractable() {
        let svc = ScopeLayer::new(ScopeConfig::new(app())).layer(tower::service_fn(
            |req: Request| async move {
                let (mut parts, _) = req.into_parts();
                let Scope(scope) = Scope::from_request_parts(&mut parts, &()).await.unwrap();
                let anonymous = CurrentUser::from_request_parts(&mut parts, &()).await;
                assert_eq!(anonymous.unwrap_err(), ScopeRejection::Unauthenticated);
                Ok::<_, Infallible>(Response::new(Body::from(scope.request_id().to_string())))
            },
        ));

        let resp = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_scope_is_a_server_error() {
        let mut parts = parts(None);
        let rejection = Scope::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(rejection, ScopeRejection::Missing);
        assert_eq!(
            rejection.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
