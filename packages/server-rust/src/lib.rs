//! Keel Server — axum request pipeline with structured body logging, trace
//! propagation, request-scope enrichment, and an in-process test harness.

pub mod controller;
pub mod middleware;
pub mod network;
pub mod telemetry;
pub mod traits;

#[cfg(feature = "itf")]
pub mod itf;

pub use controller::Controller;
pub use network::{LoggerOptions, NetworkConfig, NetworkModule};
pub use traits::{Anonymous, Identity, IdentityProvider};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
