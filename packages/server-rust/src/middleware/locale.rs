//! Locale negotiation. Resolves the request's [`Locale`] once, before
//! enrichment, and stores it in the request extensions.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use http::header::{ACCEPT_LANGUAGE, CONTENT_LANGUAGE, COOKIE};
use http::{HeaderMap, HeaderValue};
use keel_core::locale::negotiate;
use keel_core::{Application, Locale};
use tower::{Layer, Service};

/// Cookie that pins the UI language, set by the language switcher.
pub const LOCALE_COOKIE: &str = "locale";

/// Locales the application has messages for, plus its default.
#[derive(Debug, Clone)]
pub struct LocaleLayer {
    supported: Arc<[Locale]>,
    default_locale: Locale,
}

impl LocaleLayer {
    #[must_use]
    pub fn new(supported: Vec<Locale>, default_locale: Locale) -> Self {
        Self {
            supported: supported.into(),
            default_locale,
        }
    }

    #[must_use]
    pub fn for_app(app: &Application) -> Self {
        Self::new(app.bundle().locales(), app.default_locale())
    }

    /// Cookie first, then `Accept-Language`, then the default.
    #[must_use]
    pub fn resolve(&self, headers: &HeaderMap) -> Locale {
        if let Some(locale) = cookie_locale(headers).filter(|l| self.supported.contains(l)) {
            return locale;
        }
        headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| negotiate(v, &self.supported))
            .unwrap_or(self.default_locale)
    }
}

fn cookie_locale(headers: &HeaderMap) -> Option<Locale> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == LOCALE_COOKIE)
        .and_then(|(_, value)| value.parse().ok())
}

impl<S> Layer<S> for LocaleLayer {
    type Service = LocaleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LocaleService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`LocaleLayer`].
#[derive(Debug, Clone)]
pub struct LocaleService<S> {
    inner: S,
    layer: LocaleLayer,
}

impl<S, B> Service<Request> for LocaleService<S>
where
    S: Service<Request, Response = http::Response<B>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<S::Response, S::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let locale = self.layer.resolve(req.headers());
        req.extensions_mut().insert(locale);

        let fut = self.inner.call(req);
        Box::pin(async move {
            let mut response = fut.await?;
            response
                .headers_mut()
                .entry(CONTENT_LANGUAGE)
                .or_insert(HeaderValue::from_static(locale.as_str()));
            Ok(response)
        })
    }
}
