use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::trace::SpanContext;

use crate::app::Application;
use crate::i18n::Localizer;
use crate::locale::Locale;
use crate::traits::ConnectionPool;
use crate::types::{Session, TenantId, User};

/// Locale and navigation data used when rendering a page.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub locale: Locale,
    /// Request path the page is rendered for.
    pub path: String,
    pub localizer: Localizer,
}

impl PageContext {
    #[must_use]
    pub fn t<'a>(&'a self, key: &'a str) -> &'a str {
        self.localizer.localize(key)
    }
}

/// Transport facts about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParams {
    pub ip: String,
    pub user_agent: String,
    pub authenticated: bool,
}

/// Typed per-request scope threaded from the middleware pipeline to handlers.
///
/// Values are attached in a fixed order by the enrichment pipeline. Every
/// `with_*` method consumes the scope and returns the next layer, so a
/// value observed by one stage is never changed underneath it. A scope
/// belongs to exactly one request.
#[derive(Debug, Clone)]
pub struct RequestScope {
    request_id: String,
    started_at: Instant,
    logger: tracing::Span,
    trace: Option<SpanContext>,
    user: Option<Arc<User>>,
    tenant_id: Option<TenantId>,
    session: Option<Arc<Session>>,
    page: Option<Arc<PageContext>>,
    app: Option<Arc<Application>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    params: Option<RequestParams>,
}

impl RequestScope {
    /// Creates the initial scope. The logger starts as a disabled span until
    /// [`with_logger`](Self::with_logger) binds the request span.
    #[must_use]
    pub fn new(request_id: impl Into<String>, started_at: Instant) -> Self {
        Self {
            request_id: request_id.into(),
            started_at,
            logger: tracing::Span::none(),
            trace: None,
            user: None,
            tenant_id: None,
            session: None,
            page: None,
            app: None,
            pool: None,
            params: None,
        }
    }

    #[must_use]
    pub fn with_logger(self, logger: tracing::Span) -> Self {
        Self { logger, ..self }
    }

    #[must_use]
    pub fn with_trace(self, trace: SpanContext) -> Self {
        Self {
            trace: Some(trace),
            ..self
        }
    }

    /// Attaches the resolved user, or clears it for anonymous requests.
    #[must_use]
    pub fn with_user(self, user: Option<Arc<User>>) -> Self {
        Self { user, ..self }
    }

    #[must_use]
    pub fn with_session(self, session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
            ..self
        }
    }

    #[must_use]
    pub fn with_tenant(self, tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..self
        }
    }

    #[must_use]
    pub fn with_page(self, page: PageContext) -> Self {
        Self {
            page: Some(Arc::new(page)),
            ..self
        }
    }

    #[must_use]
    pub fn with_app(self, app: Arc<Application>) -> Self {
        Self {
            app: Some(app),
            ..self
        }
    }

    #[must_use]
    pub fn with_pool(self, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    #[must_use]
    pub fn with_params(self, params: RequestParams) -> Self {
        Self {
            params: Some(params),
            ..self
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Span bound with the request id, path, and method.
    #[must_use]
    pub fn logger(&self) -> &tracing::Span {
        &self.logger
    }

    #[must_use]
    pub fn trace(&self) -> Option<&SpanContext> {
        self.trace.as_ref()
    }

    #[must_use]
    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    #[must_use]
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    #[must_use]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn page(&self) -> Option<&PageContext> {
        self.page.as_deref()
    }

    #[must_use]
    pub fn app(&self) -> Option<&Arc<Application>> {
        self.app.as_ref()
    }

    #[must_use]
    pub fn pool(&self) -> Option<&Arc<dyn ConnectionPool>> {
        self.pool.as_ref()
    }

    #[must_use]
    pub fn params(&self) -> Option<&RequestParams> {
        self.params.as_ref()
    }

    /// Locale of the page context, or the default locale before one is attached.
    #[must_use]
    pub fn locale(&self) -> Locale {
        self.page.as_ref().map(|p| p.locale).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::Bundle;
    use crate::traits::NullPool;
    use crate::types::{TenantId, UserId};

    fn user() -> Arc<User> {
        Arc::new(User {
            id: UserId(1),
            tenant_id: TenantId::random(),
            email: "admin@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Admin".to_string(),
            ui_language: Locale::En,
            permissions: Vec::new(),
        })
    }

    #[test]
    fn new_scope_is_anonymous() {
        let scope = RequestScope::new("req-1", Instant::now());
        assert_eq!(scope.request_id(), "req-1");
        assert!(!scope.is_authenticated());
        assert!(scope.tenant_id().is_none());
        assert!(scope.page().is_none());
        assert_eq!(scope.locale(), Locale::En);
    }

    #[test]
    fn layering_does_not_touch_earlier_layers() {
        let base = RequestScope::new("req-2", Instant::now());
        let tenant = TenantId::random();
        let enriched = base
            .clone()
            .with_user(Some(user()))
            .with_tenant(tenant)
            .with_pool(Arc::new(NullPool));

        assert!(!base.is_authenticated());
        assert!(base.pool().is_none());
        assert!(enriched.is_authenticated());
        assert_eq!(enriched.tenant_id(), Some(tenant));
        assert_eq!(enriched.pool().map(|p| p.backend()), Some("null"));
    }

    #[test]
    fn page_context_localizes() {
        let mut bundle = Bundle::new(Locale::En);
        bundle.insert(Locale::Ru, "Home.Title", "Главная");
        let page = PageContext {
            locale: Locale::Ru,
            path: "/".to_string(),
            localizer: Localizer::new(Arc::new(bundle), Locale::Ru),
        };
        let scope = RequestScope::new("req-3", Instant::now()).with_page(page);
        assert_eq!(scope.locale(), Locale::Ru);
        assert_eq!(scope.page().unwrap().t("Home.Title"), "Главная");
    }

    #[test]
    fn with_user_none_clears_identity() {
        let scope = RequestScope::new("req-4", Instant::now())
            .with_user(Some(user()))
            .with_user(None);
        assert!(scope.user().is_none());
    }
}
