//! Orchestrator API server: hosts the task store, the dispatcher and the
//! HTTP surface in one process.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use orchestrator::config::load_config;
use orchestrator::dispatcher::Dispatcher;
use orchestrator::engine::EngineDeps;
use orchestrator::io::ci::GitHubCi;
use orchestrator::io::generator::CliGenerator;
use orchestrator::io::git::GitCli;
use orchestrator::io::store::SqliteStore;
use orchestrator::service::TaskService;

use crate::state::{AppState, RequestId};

#[derive(Parser)]
#[command(name = "orchestrator-api")]
#[command(about = "HTTP API and dispatcher for the task orchestrator")]
struct Args {
    /// Address to bind the server to.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = "orchestrator.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orchestrator::logging::init();
    let args = Args::parse();
    let config = Arc::new(load_config(&args.config)?);

    let store = Arc::new(SqliteStore::open(&config.db_path).await?);
    let service = TaskService::new(Arc::clone(&store));

    let deps = EngineDeps {
        store: Arc::clone(&store),
        vcs: Arc::new(GitCli),
        generator: Arc::new(CliGenerator::new(config.generator.command.clone())),
        ci: Arc::new(GitHubCi::new(
            config.ci.api_base.clone(),
            (!config.ci.token.is_empty()).then(|| config.ci.token.clone()),
            config.ci_poll_interval(),
        )),
        config: Arc::clone(&config),
    };

    let shutdown = CancellationToken::new();
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_handle = tokio::spawn(async move {
        Dispatcher::new(deps).run(dispatcher_shutdown).await
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api/v1", routes::api_router())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(AppState::new(service));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");

    let serve_shutdown = shutdown.clone();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    // HTTP is down; drain the dispatcher before closing the store.
    shutdown.cancel();
    dispatcher_handle.await??;
    store.close().await;
    Ok(())
}

/// Attach a per-request id: available to handlers via extension, echoed to
/// clients in the `x-request-id` header.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = ulid::Ulid::new().to_string().to_lowercase();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
