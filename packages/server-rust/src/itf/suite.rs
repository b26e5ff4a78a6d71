//! In-process test suite: one environment, one router, the production
//! middleware stack, and a synthetic identity.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::Router;
use http::request::Parts;
use http::Method;
use keel_core::{
    Application, ConnectionPool, Locale, Module, NullPool, RequestScope, Session, Tenant, User,
    UserId,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use parking_lot::RwLock;

use super::request::TestRequest;
use crate::controller::Controller;
use crate::middleware::{ParamsSource, ScopeConfig, ScopeHook, Tracer};
use crate::network::{build_http_layers, LoggerOptions, NetworkConfig};
use crate::traits::{Identity, IdentityProvider};

/// Client address every harness request appears to come from.
pub const TEST_IP: &str = "127.0.0.1";
/// User agent every harness request carries.
pub const TEST_USER_AGENT: &str = "test-agent";

/// Shared state of a suite, built once.
#[derive(Clone)]
pub struct TestEnvironment {
    pub app: Arc<Application>,
    pub pool: Arc<dyn ConnectionPool>,
    pub tenant: Tenant,
    /// Signed-in user; `None` runs requests anonymously.
    pub user: Option<Arc<User>>,
}

impl TestEnvironment {
    #[must_use]
    pub fn builder() -> TestEnvironmentBuilder {
        TestEnvironmentBuilder::default()
    }

    /// The user a fresh environment signs in as.
    #[must_use]
    pub fn default_user(tenant: &Tenant) -> User {
        User {
            id: UserId(1),
            tenant_id: tenant.id,
            email: "test@example.com".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            ui_language: Locale::En,
            permissions: Vec::new(),
        }
    }
}

impl fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("app", &self.app)
            .field("pool", &self.pool)
            .field("tenant", &self.tenant.name)
            .field("user", &self.user.as_ref().map(|u| u.email.as_str()))
            .finish()
    }
}

#[derive(Default)]
enum UserChoice {
    #[default]
    Default,
    User(User),
    Anonymous,
}

/// Builder for [`TestEnvironment`].
#[derive(Default)]
pub struct TestEnvironmentBuilder {
    modules: Vec<Arc<dyn Module>>,
    default_locale: Locale,
    tenant: Option<Tenant>,
    user: UserChoice,
    pool: Option<Arc<dyn ConnectionPool>>,
}

impl TestEnvironmentBuilder {
    #[must_use]
    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    #[must_use]
    pub fn modules(self, modules: impl IntoIterator<Item = Arc<dyn Module>>) -> Self {
        modules.into_iter().fold(self, Self::module)
    }

    #[must_use]
    pub fn default_locale(mut self, locale: Locale) -> Self {
        self.default_locale = locale;
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant: Tenant) -> Self {
        self.tenant = Some(tenant);
        self
    }

    #[must_use]
    pub fn user(mut self, user: User) -> Self {
        self.user = UserChoice::User(user);
        self
    }

    #[must_use]
    pub fn anonymous(mut self) -> Self {
        self.user = UserChoice::Anonymous;
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn build(self) -> TestEnvironment {
        let app = Application::builder()
            .default_locale(self.default_locale)
            .modules(self.modules)
            .build();
        let tenant = self.tenant.unwrap_or_else(|| Tenant::new("Test Tenant"));
        let user = match self.user {
            UserChoice::Default => Some(TestEnvironment::default_user(&tenant)),
            UserChoice::User(user) => Some(user),
            UserChoice::Anonymous => None,
        };
        TestEnvironment {
            app: Arc::new(app),
            pool: self.pool.unwrap_or_else(|| Arc::new(NullPool)),
            tenant,
            user: user.map(Arc::new),
        }
    }
}

/// Identity the suite dispatches as, relative to the environment.
#[derive(Debug, Clone, Default)]
enum ActingAs {
    #[default]
    Environment,
    User(Arc<User>),
    Anonymous,
}

/// Identity provider backed by the environment and the suite override.
struct SyntheticIdentity {
    env: TestEnvironment,
    acting: Arc<RwLock<ActingAs>>,
}

#[async_trait]
impl IdentityProvider for SyntheticIdentity {
    async fn resolve(&self, _parts: &Parts) -> anyhow::Result<Option<Identity>> {
        let user = match &*self.acting.read() {
            ActingAs::Environment => self.env.user.clone(),
            ActingAs::User(user) => Some(Arc::clone(user)),
            ActingAs::Anonymous => None,
        };
        Ok(user.map(|user| Identity {
            session: Arc::new(Session {
                token: "test-session".to_string(),
                user_id: Some(user.id),
                ip: TEST_IP.to_string(),
                user_agent: TEST_USER_AGENT.to_string(),
            }),
            tenant_id: self.env.tenant.id,
            user,
        }))
    }
}

/// An isolated router plus the production middleware stack.
///
/// ```ignore
/// let mut suite = Suite::new([Arc::new(Warehouse) as Arc<dyn Module>]);
/// suite.register(&PositionsController);
/// suite.get("/positions").expect().await.status(200).contains("Positions");
/// ```
///
/// The middleware stack is assembled on the first request and rebuilt
/// after any builder method changes the routes or hooks. The identity
/// override is read at dispatch time and never forces a rebuild.
pub struct Suite {
    env: TestEnvironment,
    routes: Router,
    controllers: Vec<&'static str>,
    acting: Arc<RwLock<ActingAs>>,
    before_each: Vec<Arc<dyn ScopeHook>>,
    middlewares: Vec<Arc<dyn ScopeHook>>,
    network: NetworkConfig,
    tracer: Tracer,
    spans: InMemorySpanExporter,
    service: OnceLock<Router>,
}

impl Suite {
    /// Suite over a default environment with `modules` registered.
    #[must_use]
    pub fn new(modules: impl IntoIterator<Item = Arc<dyn Module>>) -> Self {
        Self::with_environment(TestEnvironment::builder().modules(modules).build())
    }

    #[must_use]
    pub fn with_environment(env: TestEnvironment) -> Self {
        let spans = InMemorySpanExporter::default();
        Self {
            env,
            routes: Router::new(),
            controllers: Vec::new(),
            acting: Arc::default(),
            before_each: Vec::new(),
            middlewares: Vec::new(),
            network: NetworkConfig::default(),
            tracer: Tracer::with_exporter(spans.clone()),
            spans,
            service: OnceLock::new(),
        }
    }

    /// Dispatches subsequent requests as `user`.
    pub fn as_user(&self, user: User) -> &Self {
        *self.acting.write() = ActingAs::User(Arc::new(user));
        self
    }

    /// Dispatches subsequent requests without a signed-in user.
    pub fn as_anonymous(&self) -> &Self {
        *self.acting.write() = ActingAs::Anonymous;
        self
    }

    /// Returns to the environment's user.
    pub fn as_environment_user(&self) -> &Self {
        *self.acting.write() = ActingAs::Environment;
        self
    }

    /// Adds a controller's routes. A controller key seen before is skipped.
    pub fn register(&mut self, controller: &dyn Controller) -> &mut Self {
        let key = controller.key();
        if self.controllers.contains(&key) {
            tracing::warn!(controller = key, "controller already registered, skipping");
            return self;
        }
        self.controllers.push(key);
        self.routes = controller.register(std::mem::take(&mut self.routes));
        self.service.take();
        self
    }

    /// Appends a hook run after every before-each hook.
    pub fn with_middleware(&mut self, hook: impl ScopeHook + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(hook));
        self.service.take();
        self
    }

    /// Appends a hook run right after the standard attachments.
    pub fn before_each(
        &mut self,
        hook: impl Fn(RequestScope) -> RequestScope + Send + Sync + 'static,
    ) -> &mut Self {
        self.before_each
            .push(Arc::new(move |scope: RequestScope, _: &Parts| hook(scope)));
        self.service.take();
        self
    }

    pub fn with_logger_options(&mut self, options: LoggerOptions) -> &mut Self {
        self.network.logger = options;
        self.service.take();
        self
    }

    #[must_use]
    pub fn environment(&self) -> &TestEnvironment {
        &self.env
    }

    #[must_use]
    pub fn controllers(&self) -> &[&'static str] {
        &self.controllers
    }

    /// Spans exported by every request sent so far.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.get_finished_spans().unwrap_or_default()
    }

    /// Forgets the spans collected so far.
    pub fn clear_spans(&self) {
        self.spans.reset();
    }

    pub fn get(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::GET, path)
    }

    pub fn post(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::POST, path)
    }

    pub fn put(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> TestRequest<'_> {
        TestRequest::new(self, Method::DELETE, path)
    }

    pub(crate) fn service(&self) -> Router {
        self.service.get_or_init(|| self.build_service()).clone()
    }

    fn build_service(&self) -> Router {
        let identity = SyntheticIdentity {
            env: self.env.clone(),
            acting: Arc::clone(&self.acting),
        };
        let scope = ScopeConfig::new(Arc::clone(&self.env.app))
            .identity(Arc::new(identity))
            .pool(Arc::clone(&self.env.pool))
            .default_tenant(self.env.tenant.id)
            .params(ParamsSource::Fixed {
                ip: TEST_IP.to_string(),
                user_agent: TEST_USER_AGENT.to_string(),
            })
            .hooks(self.before_each.iter().cloned())
            .hooks(self.middlewares.iter().cloned());
        self.routes
            .clone()
            .layer(build_http_layers(&self.network, self.tracer.clone(), scope))
    }
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("env", &self.env)
            .field("controllers", &self.controllers)
            .field("acting", &*self.acting.read())
            .field("before_each", &self.before_each.len())
            .field("middlewares", &self.middlewares.len())
            .field("built", &self.service.get().is_some())
            .finish_non_exhaustive()
    }
}
