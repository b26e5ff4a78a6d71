//! Captured responses and their assertions.
//!
//! Assertion failures panic with the response body, which is usually the
//! fastest way to see why a handler misbehaved.

use std::cell::OnceCell;

use bytes::Bytes;
use http::header::{LOCATION, SET_COOKIE};
use http::response::Parts;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use super::html::Html;

/// One `Set-Cookie` header, split into name, value, and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// Attribute name to value; flag attributes such as `HttpOnly` map to `""`.
    pub attributes: Vec<(String, String)>,
}

impl SetCookie {
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let mut segments = header.split(';');
        let (name, value) = segments.next()?.trim().split_once('=')?;
        if name.is_empty() {
            return None;
        }
        let attributes = segments
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (s.to_string(), String::new()),
            })
            .collect();
        Some(Self {
            name: name.to_string(),
            value: value.trim_matches('"').to_string(),
            attributes,
        })
    }

    /// Attribute value by case-insensitive name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully buffered response from the harness.
#[derive(Debug)]
pub struct TestResponse {
    parts: Parts,
    body: Bytes,
    document: OnceCell<scraper::Html>,
}

impl TestResponse {
    pub(crate) fn new(parts: Parts, body: Bytes) -> Self {
        Self {
            parts,
            body,
            document: OnceCell::new(),
        }
    }

    #[track_caller]
    pub fn status(&self, expected: u16) -> &Self {
        assert_eq!(
            self.parts.status.as_u16(),
            expected,
            "unexpected status code. Body:\n{}",
            self.text()
        );
        self
    }

    #[track_caller]
    pub fn redirect_to(&self, location: &str) -> &Self {
        assert!(
            self.parts.status.is_redirection(),
            "expected a redirect, got {}. Body:\n{}",
            self.parts.status,
            self.text()
        );
        assert_eq!(
            self.header(LOCATION.as_str()),
            Some(location),
            "unexpected redirect location"
        );
        self
    }

    #[track_caller]
    pub fn contains(&self, needle: &str) -> &Self {
        assert!(
            self.text().contains(needle),
            "expected body to contain {needle:?}. Body:\n{}",
            self.text()
        );
        self
    }

    #[track_caller]
    pub fn not_contains(&self, needle: &str) -> &Self {
        assert!(
            !self.text().contains(needle),
            "expected body not to contain {needle:?}. Body:\n{}",
            self.text()
        );
        self
    }

    /// Body as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    ///
    /// # Panics
    ///
    /// Panics if the body is not valid JSON for `T`.
    #[track_caller]
    #[must_use]
    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body).unwrap_or_else(|err| {
            panic!("failed to decode JSON response: {err}. Body:\n{}", self.text())
        })
    }

    /// First value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.parts.status
    }

    /// Every cookie set by the response.
    #[must_use]
    pub fn cookies(&self) -> Vec<SetCookie> {
        self.parts
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(SetCookie::parse)
            .collect()
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<SetCookie> {
        self.cookies().into_iter().find(|c| c.name == name)
    }

    /// Status line and headers as received.
    #[must_use]
    pub fn raw(&self) -> &Parts {
        &self.parts
    }

    /// The body parsed as HTML. Parsed once, on first use.
    pub fn html(&self) -> Html<'_> {
        Html::new(
            self.document
                .get_or_init(|| scraper::Html::parse_document(&self.text())),
        )
    }
}

#[cfg(test)]
mod tests {
    use http::Response;

    use super::*;

    fn response(status: u16, headers: &[(&'static str, &'static str)], body: &'static str) -> TestResponse {
        let mut builder = Response::builder().status(status);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        TestResponse::new(parts, Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn chained_assertions() {
        let resp = response(200, &[("content-type", "text/html")], "<h1>Orders</h1>");
        resp.status(200).contains("Orders").not_contains("Invoices");
        assert_eq!(resp.header("Content-Type"), Some("text/html"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[test]
    #[should_panic(expected = "unexpected status code. Body:\nboom")]
    fn status_failure_includes_body() {
        response(500, &[], "boom").status(200);
    }

    #[test]
    fn redirect_assertion() {
        let resp = response(302, &[("location", "/login")], "");
        resp.redirect_to("/login");
    }

    #[test]
    #[should_panic(expected = "expected a redirect")]
    fn redirect_requires_3xx() {
        response(200, &[("location", "/login")], "").redirect_to("/login");
    }

    #[test]
    fn cookies_are_parsed() {
        let resp = response(
            200,
            &[
                ("set-cookie", "sid=abc123; Path=/; HttpOnly"),
                ("set-cookie", "locale=ru; Max-Age=3600"),
            ],
            "",
        );
        let cookies = resp.cookies();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "sid");
        assert_eq!(cookies[0].attribute("path"), Some("/"));
        assert_eq!(cookies[0].attribute("HttpOnly"), Some(""));
        assert_eq!(resp.cookie("locale").unwrap().value, "ru");
    }

    #[test]
    fn html_is_parsed_lazily_once() {
        let resp = response(200, &[], "<p id='x'>hi</p>");
        assert_eq!(resp.html().element("//p[@id='x']").text(), "hi");
        let first: *const scraper::Html = resp.html().document();
        let second: *const scraper::Html = resp.html().document();
        assert_eq!(first, second);
    }

    #[test]
    fn json_decodes() {
        let resp = response(200, &[], r#"{"id":5}"#);
        let value: serde_json::Value = resp.json();
        assert_eq!(value["id"], 5);
    }
}
