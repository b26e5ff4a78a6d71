use axum::Router;

/// A feature module's HTTP surface. Controllers add their routes to the
/// application router; the shared middleware stack is applied afterwards.
pub trait Controller: Send + Sync {
    /// Stable name, used in logs and to detect double registration.
    fn key(&self) -> &'static str;

    fn register(&self, router: Router) -> Router;
}
