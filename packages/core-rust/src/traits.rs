use std::fmt;

use async_trait::async_trait;

/// Handle to the relational persistence pool, carried through the request
/// scope so repositories can borrow connections.
///
/// Implementations: a `PostgreSQL` pool in deployments, [`NullPool`] when no
/// database is attached (tests, the dev server).
#[async_trait]
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    /// Short backend name for logs (`"postgres"`, `"null"`).
    fn backend(&self) -> &'static str;

    /// Checks that a connection can be acquired.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Pool that owns no connections. `ping` always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPool;

#[async_trait]
impl ConnectionPool for NullPool {
    fn backend(&self) -> &'static str {
        "null"
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
