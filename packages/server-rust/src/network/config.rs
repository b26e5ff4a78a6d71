//! Network and request-logging configuration for the Keel server.

use std::time::Duration;

use axum::http::HeaderName;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Header carrying a caller-supplied request id.
    pub request_id_header: HeaderName,
    /// Header carrying the client address set by a reverse proxy.
    pub real_ip_header: HeaderName,
    /// Request/response logging behaviour.
    pub logger: LoggerOptions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            request_id_header: HeaderName::from_static("x-request-id"),
            real_ip_header: HeaderName::from_static("x-real-ip"),
            logger: LoggerOptions::default(),
        }
    }
}

/// Controls which bodies the request logger reads and how much of them it keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerOptions {
    /// Read, validate, and log allow-listed request bodies.
    pub log_request_body: bool,
    /// Capture and log allow-listed response bodies.
    pub log_response_body: bool,
    /// Maximum characters of raw (unparsed) body text written to the log.
    pub max_body_length: usize,
    /// Largest response body, by declared size, that is buffered for logging.
    pub max_capture_bytes: usize,
}

impl LoggerOptions {
    #[must_use]
    pub fn new(log_request_body: bool, log_response_body: bool, max_body_length: usize) -> Self {
        Self {
            log_request_body,
            log_response_body,
            max_body_length,
            ..Self::default()
        }
    }

    /// Options with both body logs switched off.
    #[must_use]
    pub fn quiet() -> Self {
        Self::new(false, false, 0)
    }
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            log_request_body: true,
            log_response_body: true,
            max_body_length: 512,
            max_capture_bytes: 1024 * 1024, // 1 MiB
        }
    }
}
