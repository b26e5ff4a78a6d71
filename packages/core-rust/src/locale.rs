//! Supported interface languages and `Accept-Language` negotiation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Interface language offered by the application.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Ru,
    Uz,
}

impl Locale {
    /// Every supported locale, in display order.
    pub const ALL: [Locale; 3] = [Locale::En, Locale::Ru, Locale::Uz];

    /// Returns the BCP 47 primary language subtag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ru => "ru",
            Self::Uz => "uz",
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a language tag names an unsupported locale.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid language: {0:?}")]
pub struct LocaleError(pub String);

impl FromStr for Locale {
    type Err = LocaleError;

    /// Accepts a bare subtag (`"ru"`) or a full tag (`"ru-RU"`, `"uz_Latn"`),
    /// compared case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let primary = s
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "en" => Ok(Self::En),
            "ru" => Ok(Self::Ru),
            "uz" => Ok(Self::Uz),
            _ => Err(LocaleError(s.to_string())),
        }
    }
}

/// Picks the best supported locale for an `Accept-Language` header value.
///
/// Entries are ordered by their `q` weight (default 1.0, stable for ties);
/// entries with `q=0` or an unparsable weight are ignored. The wildcard
/// `*` matches the first locale in `supported`. Returns `None` when no
/// entry matches.
#[must_use]
pub fn negotiate(accept_language: &str, supported: &[Locale]) -> Option<Locale> {
    let mut ranges: Vec<(&str, f32)> = accept_language
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let tag = parts.next()?.trim();
            if tag.is_empty() {
                return None;
            }
            let mut quality = 1.0_f32;
            for param in parts {
                if let Some(q) = param.trim().strip_prefix("q=") {
                    quality = q.trim().parse().ok()?;
                }
            }
            (quality > 0.0).then_some((tag, quality))
        })
        .collect();

    ranges.sort_by(|a, b| b.1.total_cmp(&a.1));

    ranges.into_iter().find_map(|(tag, _)| {
        if tag == "*" {
            return supported.first().copied();
        }
        tag.parse::<Locale>()
            .ok()
            .filter(|locale| supported.contains(locale))
    })
}
