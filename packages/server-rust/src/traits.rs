use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;
use keel_core::{Session, TenantId, User};

/// Identity resolved for one request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: Arc<User>,
    pub tenant_id: TenantId,
    pub session: Arc<Session>,
}

/// Session/identity collaborator consulted by the enrichment pipeline.
///
/// Implementations: cookie-session lookups in deployments, the harness's
/// synthetic identity in tests, [`Anonymous`] when nobody is signed in.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the signed-in identity, `None` for anonymous requests.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing session store cannot be reached.
    async fn resolve(&self, parts: &Parts) -> anyhow::Result<Option<Identity>>;
}

/// Provider that treats every request as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl IdentityProvider for Anonymous {
    async fn resolve(&self, _parts: &Parts) -> anyhow::Result<Option<Identity>> {
        Ok(None)
    }
}
