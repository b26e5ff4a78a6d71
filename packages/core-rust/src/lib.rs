//! Keel Core — request scope, identity, and localization types.

pub mod app;
pub mod context;
pub mod i18n;
pub mod locale;
pub mod traits;
pub mod types;

pub use app::{Application, ApplicationBuilder, Module};
pub use context::{PageContext, RequestParams, RequestScope};
pub use i18n::{Bundle, Localizer};
pub use locale::{Locale, LocaleError};
pub use traits::{ConnectionPool, NullPool};
pub use types::{Session, Tenant, TenantId, User, UserId};
