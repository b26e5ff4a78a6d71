//! Message bundles and per-request localizers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::locale::Locale;

/// Localized message catalogue for every supported locale.
///
/// Modules contribute their messages when the application is assembled;
/// later contributions overwrite earlier ones for the same key.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    default_locale: Locale,
    messages: HashMap<Locale, HashMap<String, String>>,
}

impl Bundle {
    #[must_use]
    pub fn new(default_locale: Locale) -> Self {
        Self {
            default_locale,
            messages: HashMap::new(),
        }
    }

    #[must_use]
    pub fn default_locale(&self) -> Locale {
        self.default_locale
    }

    /// Adds or replaces a single message.
    pub fn insert(&mut self, locale: Locale, key: impl Into<String>, text: impl Into<String>) {
        self.messages
            .entry(locale)
            .or_default()
            .insert(key.into(), text.into());
    }

    /// Adds every `(key, text)` pair for `locale`.
    pub fn extend<K, V>(&mut self, locale: Locale, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let catalogue = self.messages.entry(locale).or_default();
        for (key, text) in entries {
            catalogue.insert(key.into(), text.into());
        }
    }

    /// Locales that have at least one message, default locale first.
    #[must_use]
    pub fn locales(&self) -> Vec<Locale> {
        let mut locales = vec![self.default_locale];
        locales.extend(
            Locale::ALL
                .into_iter()
                .filter(|l| *l != self.default_locale && self.messages.contains_key(l)),
        );
        locales
    }

    /// Looks up a message for exactly `locale`, without fallback.
    #[must_use]
    pub fn get(&self, locale: Locale, key: &str) -> Option<&str> {
        self.messages
            .get(&locale)
            .and_then(|catalogue| catalogue.get(key))
            .map(String::as_str)
    }
}

/// Resolves message keys for one locale.
///
/// Lookup order: the bound locale, then the bundle's default locale, then
/// the key itself so missing translations stay visible in rendered pages.
#[derive(Debug, Clone)]
pub struct Localizer {
    bundle: Arc<Bundle>,
    locale: Locale,
}

impl Localizer {
    #[must_use]
    pub fn new(bundle: Arc<Bundle>, locale: Locale) -> Self {
        Self { bundle, locale }
    }

    #[must_use]
    pub fn locale(&self) -> Locale {
        self.locale
    }

    #[must_use]
    pub fn localize<'a>(&'a self, key: &'a str) -> &'a str {
        self.bundle
            .get(self.locale, key)
            .or_else(|| self.bundle.get(self.bundle.default_locale(), key))
            .unwrap_or(key)
    }

    /// Localizes `key` and substitutes `{name}` placeholders from `args`.
    #[must_use]
    pub fn localize_with(&self, key: &str, args: &[(&str, &str)]) -> String {
        let mut text = self.localize(key).to_string();
        for (name, value) in args {
            text = text.replace(&format!("{{{name}}}"), value);
        }
        text
    }
}
