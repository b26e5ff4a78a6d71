//! Fluent builder for synthetic requests against a [`Suite`].

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use http_body_util::BodyExt;
use serde::Serialize;
use tower::ServiceExt;

use super::multipart::Multipart;
use super::response::TestResponse;
use super::suite::Suite;

/// Header htmx sends with every request it issues.
pub const HX_REQUEST: HeaderName = HeaderName::from_static("hx-request");

/// A request being built. Nothing is sent until [`expect`](Self::expect).
#[derive(Debug)]
#[must_use = "a request does nothing until `expect` is awaited"]
pub struct TestRequest<'s> {
    suite: &'s Suite,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl<'s> TestRequest<'s> {
    pub(crate) fn new(suite: &'s Suite, method: Method, path: &str) -> Self {
        Self {
            suite,
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Sets a header, replacing earlier values.
    ///
    /// # Panics
    ///
    /// Panics if `name` or `value` is not a valid header.
    #[track_caller]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let header = HeaderName::try_from(name)
            .unwrap_or_else(|err| panic!("invalid header name {name:?}: {err}"));
        let value = HeaderValue::from_str(value)
            .unwrap_or_else(|err| panic!("invalid value for header {name:?}: {err}"));
        self.headers.insert(header, value);
        self
    }

    /// Adds a cookie as its own `Cookie` header line.
    ///
    /// # Panics
    ///
    /// Panics if the cookie cannot be encoded as a header value.
    #[track_caller]
    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        let cookie = HeaderValue::from_str(&format!("{name}={value}"))
            .unwrap_or_else(|err| panic!("invalid cookie {name:?}: {err}"));
        self.headers.append(COOKIE, cookie);
        self
    }

    /// Marks the request as issued by htmx.
    pub fn htmx(mut self) -> Self {
        self.headers.insert(HX_REQUEST, HeaderValue::from_static("true"));
        self
    }

    /// JSON-encodes `value` as the body.
    ///
    /// # Panics
    ///
    /// Panics if `value` cannot be serialized.
    #[track_caller]
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        let body = serde_json::to_vec(value)
            .unwrap_or_else(|err| panic!("failed to marshal JSON request body: {err}"));
        self.with_body("application/json", body)
    }

    /// Form-encodes `value` as the body.
    ///
    /// # Panics
    ///
    /// Panics if `value` cannot be form-encoded.
    #[track_caller]
    pub fn form<T: Serialize + ?Sized>(self, value: &T) -> Self {
        let body = serde_urlencoded::to_string(value)
            .unwrap_or_else(|err| panic!("failed to encode form request body: {err}"));
        self.with_body("application/x-www-form-urlencoded", body)
    }

    /// Uses `data` as a `multipart/form-data` body with a fresh boundary.
    pub fn multipart(self, data: &Multipart) -> Self {
        let (content_type, body) = data.encode();
        self.with_body(&content_type, body)
    }

    /// Uploads a single file.
    #[deprecated(note = "use `multipart` with `Multipart::new().add_file(..)`")]
    pub fn file(self, field_name: &str, file_name: &str, content: impl Into<Bytes>) -> Self {
        self.multipart(&Multipart::new().add_file(field_name, file_name, content))
    }

    /// Replaces the body bytes, keeping every header already set.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self.body(body)
    }

    /// Dispatches the request in-process and buffers the response.
    ///
    /// # Panics
    ///
    /// Panics if the path is not a valid URI or the response body cannot be read.
    pub async fn expect(self) -> TestResponse {
        let Self {
            suite,
            method,
            path,
            headers,
            body,
        } = self;

        let mut request = Request::builder()
            .method(method.clone())
            .uri(path.as_str())
            .body(body.map_or_else(Body::empty, Body::from))
            .unwrap_or_else(|err| panic!("invalid test request {method} {path}: {err}"));
        *request.headers_mut() = headers;
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));

        let response = suite
            .service()
            .oneshot(request)
            .await
            .unwrap_or_else(|never: Infallible| match never {});
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .unwrap_or_else(|err| panic!("failed to read response body for {method} {path}: {err}"))
            .to_bytes();
        TestResponse::new(parts, body)
    }
}
