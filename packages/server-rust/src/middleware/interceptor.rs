//! Response interception.
//!
//! A [`ResponseSink`] is anything a response can be written into. Optional
//! abilities (flushing a partial stream, upgrading the connection, reading
//! back what was written) are separate capability traits that a sink
//! exposes through `as_*` accessors. [`StatusRecorder`] decorates a sink,
//! caches the status code written through it, and queries the capabilities
//! once, when it is wrapped.

use axum::body::Body;
use axum::response::Response;
use bytes::BytesMut;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;

/// Errors surfaced by response sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("underlying response sink does not support connection upgrade")]
    UpgradeUnsupported,
    #[error("connection upgrade was already taken")]
    UpgradeTaken,
    #[error("response body exceeds capture limit of {limit} bytes")]
    Overflow { limit: usize },
    #[error("failed to read response body: {0}")]
    Body(#[source] axum::Error),
}

/// Outbound response destination.
pub trait ResponseSink: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sets the status line. Called at most once per response by well-behaved writers.
    fn write_header(&mut self, status: StatusCode);

    /// Appends body bytes, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns an error when the sink cannot take more data.
    fn write(&mut self, chunk: &[u8]) -> Result<usize, SinkError>;

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    fn as_upgrade(&mut self) -> Option<&mut dyn Upgrade> {
        None
    }

    fn as_read_back(&self) -> Option<&dyn ReadBack> {
        None
    }
}

/// Pushes buffered bytes of a partially written response to the client.
pub trait Flush {
    /// # Errors
    ///
    /// Returns an error when the client side is gone.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Hands over the raw connection for protocol switching.
pub trait Upgrade {
    /// # Errors
    ///
    /// Returns an error when the upgrade handle was already taken.
    fn upgrade(&mut self) -> Result<OnUpgrade, SinkError>;
}

/// Exposes the body bytes written so far.
pub trait ReadBack {
    fn written(&self) -> &[u8];
}

/// Capabilities found on a sink at wrap time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub flush: bool,
    pub upgrade: bool,
    pub read_back: bool,
}

// ---------------------------------------------------------------------------
// StatusRecorder
// ---------------------------------------------------------------------------

/// Sink decorator that observes the status code.
#[derive(Debug)]
pub struct StatusRecorder<S> {
    inner: S,
    status: Option<StatusCode>,
    capabilities: Capabilities,
}

impl<S: ResponseSink> StatusRecorder<S> {
    pub fn wrap(mut inner: S) -> Self {
        let capabilities = Capabilities {
            flush: inner.as_flush().is_some(),
            upgrade: inner.as_upgrade().is_some(),
            read_back: inner.as_read_back().is_some(),
        };
        Self {
            inner,
            status: None,
            capabilities,
        }
    }

    /// The status written so far, `200 OK` if none was set.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Flushes the underlying sink; a no-op when it cannot flush.
    ///
    /// # Errors
    ///
    /// Propagates the underlying sink's flush error.
    pub fn flush(&mut self) -> Result<(), SinkError> {
        if !self.capabilities.flush {
            return Ok(());
        }
        match self.inner.as_flush() {
            Some(flusher) => flusher.flush(),
            None => Ok(()),
        }
    }

    /// Takes over the connection from the underlying sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::UpgradeUnsupported`] when the sink cannot upgrade.
    pub fn upgrade(&mut self) -> Result<OnUpgrade, SinkError> {
        if !self.capabilities.upgrade {
            return Err(SinkError::UpgradeUnsupported);
        }
        self.inner
            .as_upgrade()
            .ok_or(SinkError::UpgradeUnsupported)?
            .upgrade()
    }

    /// Body bytes written so far, when the sink can be read back.
    #[must_use]
    pub fn read_back(&self) -> Option<&[u8]> {
        if !self.capabilities.read_back {
            return None;
        }
        self.inner.as_read_back().map(ReadBack::written)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ResponseSink> ResponseSink for StatusRecorder<S> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.inner.write_header(status);
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, SinkError> {
        self.inner.write(chunk)
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.capabilities.flush {
            self.inner.as_flush()
        } else {
            None
        }
    }

    fn as_upgrade(&mut self) -> Option<&mut dyn Upgrade> {
        if self.capabilities.upgrade {
            self.inner.as_upgrade()
        } else {
            None
        }
    }

    fn as_read_back(&self) -> Option<&dyn ReadBack> {
        if self.capabilities.read_back {
            self.inner.as_read_back()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseBuffer
// ---------------------------------------------------------------------------

/// In-memory sink that keeps the whole response and can be read back.
#[derive(Debug)]
pub struct ResponseBuffer {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    limit: Option<usize>,
}

impl ResponseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            limit: None,
        }
    }

    /// A buffer that refuses writes past `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Converts the buffered status, headers, and body into a response.
    #[must_use]
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSink for ResponseBuffer {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, SinkError> {
        if let Some(limit) = self.limit {
            if self.body.len() + chunk.len() > limit {
                return Err(SinkError::Overflow { limit });
            }
        }
        self.body.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    fn as_read_back(&self) -> Option<&dyn ReadBack> {
        Some(self)
    }
}

impl ReadBack for ResponseBuffer {
    fn written(&self) -> &[u8] {
        &self.body
    }
}

/// Writes a finished response into `sink`: status, headers, then every data
/// frame of the body in order. Trailers are dropped.
///
/// # Errors
///
/// Returns the first body or sink error; bytes written before it stay in the sink.
pub async fn replay<S: ResponseSink>(response: Response, sink: &mut S) -> Result<(), SinkError> {
    let (parts, mut body) = response.into_parts();
    sink.write_header(parts.status);
    sink.headers_mut().extend(parts.headers);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(SinkError::Body)?;
        match frame.into_data() {
            Ok(data) => {
                sink.write(&data)?;
            }
            Err(_trailers) => tracing::debug!("dropping response trailers during replay"),
        }
    }
    Ok(())
}
