//! Development server: the full middleware stack in front of an echo
//! controller, for poking at body logging and trace propagation by hand.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, Method, Uri};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use keel_core::{Application, Bundle, Locale, Module};
use keel_server::middleware::Scope;
use keel_server::network::{LoggerOptions, NetworkConfig, NetworkModule};
use keel_server::telemetry::{self, LogFormat};
use keel_server::Controller;
use serde_json::{json, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "keel-dev-server", version, about)]
struct Args {
    #[arg(long, env = "KEEL_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "KEEL_PORT", default_value_t = 3200)]
    port: u16,

    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Used when `RUST_LOG` is unset.
    #[arg(long, env = "KEEL_LOG", default_value = telemetry::DEFAULT_DIRECTIVES)]
    log: String,

    #[arg(long, env = "KEEL_REQUEST_ID_HEADER", default_value = "x-request-id")]
    request_id_header: String,

    #[arg(long, env = "KEEL_REAL_IP_HEADER", default_value = "x-real-ip")]
    real_ip_header: String,

    /// Comma-separated; `*` allows any origin.
    #[arg(long, env = "KEEL_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    #[arg(long, env = "KEEL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, env = "KEEL_NO_REQUEST_BODY_LOG")]
    no_request_body_log: bool,

    #[arg(long, env = "KEEL_NO_RESPONSE_BODY_LOG")]
    no_response_body_log: bool,

    #[arg(long, env = "KEEL_MAX_BODY_LENGTH", default_value_t = 512)]
    max_body_length: usize,
}

impl Args {
    fn network_config(&self) -> anyhow::Result<NetworkConfig> {
        Ok(NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            request_id_header: HeaderName::try_from(self.request_id_header.as_str())?,
            real_ip_header: HeaderName::try_from(self.real_ip_header.as_str())?,
            logger: LoggerOptions::new(
                !self.no_request_body_log,
                !self.no_response_body_log,
                self.max_body_length,
            ),
        })
    }
}

struct Echo;

impl Module for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn register_messages(&self, bundle: &mut Bundle) {
        bundle.insert(Locale::En, "Echo.Greeting", "Hello");
        bundle.insert(Locale::Ru, "Echo.Greeting", "Привет");
        bundle.insert(Locale::Uz, "Echo.Greeting", "Salom");
    }
}

struct EchoController;

impl Controller for EchoController {
    fn key(&self) -> &'static str {
        "echo"
    }

    fn register(&self, router: Router) -> Router {
        router.route("/echo", get(echo).post(echo).put(echo).delete(echo))
    }
}

async fn echo(method: Method, uri: Uri, Scope(scope): Scope, body: String) -> Json<Value> {
    let greeting = scope.page().map_or("Hello", |page| page.t("Echo.Greeting"));
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "request_id": scope.request_id(),
        "trace_id": scope.trace().map(|t| t.trace_id().to_string()),
        "locale": scope.locale().as_str(),
        "greeting": greeting,
        "authenticated": scope.is_authenticated(),
        "body": body,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_format, &args.log)?;

    let config = args.network_config()?;
    let app = Arc::new(Application::builder().module(Arc::new(Echo)).build());

    let mut network = NetworkModule::new(config, app);
    network.register(&EchoController);
    let port = network.start().await?;
    info!(port, "keel dev server ready");

    network
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await
}
