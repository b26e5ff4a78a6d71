use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::locale::Locale;

/// Numeric identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tenant (organization) for multi-tenant isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Generates a fresh random tenant identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An authenticated user as seen by request handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Preferred interface language.
    pub ui_language: Locale,
    /// Permission names granted through the user's roles.
    pub permissions: Vec<String>,
}

impl User {
    /// Returns `"first last"`, trimmed when either part is empty.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    #[must_use]
    pub fn can(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// A tenant (organization) owning users and data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub domain: Option<String>,
}

impl Tenant {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TenantId::random(),
            name: name.into(),
            domain: None,
        }
    }
}

/// Server-side session bound to a login.
///
/// `Default` yields an empty, anonymous session, which is what the test
/// harness attaches when no real session store is involved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: Option<UserId>,
    pub ip: String,
    pub user_agent: String,
}
