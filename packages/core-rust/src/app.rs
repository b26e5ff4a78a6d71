//! Application registry: the ordered set of feature modules and their
//! merged localization bundle.

use std::fmt;
use std::sync::Arc;

use crate::i18n::Bundle;
use crate::locale::Locale;

/// A feature module (finance, warehouse, core, ...) plugged into the application.
pub trait Module: Send + Sync {
    /// Stable module name, used in logs and for lookup.
    fn name(&self) -> &'static str;

    /// Contributes the module's localized messages.
    fn register_messages(&self, _bundle: &mut Bundle) {}
}

/// Process-wide application handle shared by every request.
pub struct Application {
    modules: Vec<Arc<dyn Module>>,
    bundle: Arc<Bundle>,
}

impl Application {
    #[must_use]
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    /// Module names in registration order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    #[must_use]
    pub fn module(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|m| m.name() == name)
    }

    #[must_use]
    pub fn bundle(&self) -> Arc<Bundle> {
        Arc::clone(&self.bundle)
    }

    #[must_use]
    pub fn default_locale(&self) -> Locale {
        self.bundle.default_locale()
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("modules", &self.module_names())
            .field("default_locale", &self.default_locale())
            .finish_non_exhaustive()
    }
}

/// Collects modules before the bundle is merged.
#[derive(Default)]
pub struct ApplicationBuilder {
    modules: Vec<Arc<dyn Module>>,
    default_locale: Locale,
}

impl ApplicationBuilder {
    #[must_use]
    pub fn default_locale(mut self, locale: Locale) -> Self {
        self.default_locale = locale;
        self
    }

    /// Appends a module. A module whose name is already registered is skipped.
    #[must_use]
    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        if self.modules.iter().all(|m| m.name() != module.name()) {
            self.modules.push(module);
        } else {
            tracing::warn!(module = module.name(), "module registered twice, ignoring");
        }
        self
    }

    #[must_use]
    pub fn modules(self, modules: impl IntoIterator<Item = Arc<dyn Module>>) -> Self {
        modules.into_iter().fold(self, Self::module)
    }

    #[must_use]
    pub fn build(self) -> Application {
        let mut bundle = Bundle::new(self.default_locale);
        for module in &self.modules {
            module.register_messages(&mut bundle);
        }
        Application {
            modules: self.modules,
            bundle: Arc::new(bundle),
        }
    }
}
