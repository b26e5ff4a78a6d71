//! XPath queries and assertions over an HTML response body.

use scraper::ElementRef;

use super::xpath::XPath;

/// Field-error marker rendered by form components.
const FIELD_ERROR_XPATH: &str = "//small[@data-testid='field-error' and @data-field-id={field}]";

/// A parsed HTML body.
#[derive(Debug, Clone, Copy)]
pub struct Html<'r> {
    doc: &'r scraper::Html,
}

impl<'r> Html<'r> {
    pub(crate) fn new(doc: &'r scraper::Html) -> Self {
        Self { doc }
    }

    /// First element matching `xpath`; the result may be empty.
    ///
    /// # Panics
    ///
    /// Panics if `xpath` is not a supported expression.
    #[track_caller]
    #[must_use]
    pub fn element(&self, xpath: &str) -> Element<'r> {
        Element {
            node: compile(xpath).select(self.doc).into_iter().next(),
            xpath: xpath.to_string(),
        }
    }

    /// Every element matching `xpath`.
    ///
    /// # Panics
    ///
    /// Panics if `xpath` is not a supported expression.
    #[track_caller]
    #[must_use]
    pub fn elements(&self, xpath: &str) -> Vec<Element<'r>> {
        compile(xpath)
            .select(self.doc)
            .into_iter()
            .map(|node| Element {
                node: Some(node),
                xpath: xpath.to_string(),
            })
            .collect()
    }

    /// Whether the form shows a validation error for `field_id`.
    ///
    /// # Panics
    ///
    /// Panics if `field_id` contains both quote characters and cannot be
    /// written as an XPath literal.
    #[track_caller]
    #[must_use]
    pub fn has_error_for(&self, field_id: &str) -> bool {
        let xpath = FIELD_ERROR_XPATH.replace("{field}", &literal(field_id));
        !compile(&xpath).select(self.doc).is_empty()
    }

    #[must_use]
    pub fn document(&self) -> &'r scraper::Html {
        self.doc
    }
}

/// Quotes `value` with whichever quote character it does not contain.
/// XPath 1.0 literals have no escapes, so a value holding both is left
/// unquoted and fails to compile.
fn literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

#[track_caller]
fn compile(xpath: &str) -> XPath {
    XPath::parse(xpath).unwrap_or_else(|err| panic!("invalid XPath expression {xpath:?}: {err}"))
}

/// Result of a single-element query. May hold no node.
#[derive(Debug, Clone)]
pub struct Element<'r> {
    node: Option<ElementRef<'r>>,
    xpath: String,
}

impl<'r> Element<'r> {
    #[track_caller]
    pub fn exists(&self) -> &Self {
        assert!(
            self.node.is_some(),
            "expected element matching {:?} to exist",
            self.xpath
        );
        self
    }

    #[track_caller]
    pub fn not_exists(&self) -> &Self {
        if let Some(node) = self.node {
            panic!(
                "expected no element matching {:?}, found {}",
                self.xpath,
                node.html()
            );
        }
        self
    }

    /// Concatenated text of the element and its descendants, empty when
    /// no element matched.
    #[must_use]
    pub fn text(&self) -> String {
        self.node.map(|n| n.text().collect::<String>()).unwrap_or_default()
    }

    /// Attribute value, `None` when the attribute or the element is missing.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&'r str> {
        self.node.and_then(|n| n.value().attr(name))
    }

    #[must_use]
    pub fn node(&self) -> Option<ElementRef<'r>> {
        self.node
    }
}
