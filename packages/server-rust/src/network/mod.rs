//! Networking types, configuration, the HTTP middleware stack, and the server lifecycle.

pub mod config;
pub mod middleware;
pub mod module;

pub use config::*;
pub use middleware::{build_http_layers, HttpLayers};
pub use module::NetworkModule;
