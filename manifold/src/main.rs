#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use args::Args;
use clap::Parser;
use manifold_config::Config;
use manifold_proxy::ProxyState;
use tokio_util::sync::CancellationToken;

/// Exit codes: 0 clean, 1 configuration error, 2 runtime fatal,
/// 130 signal-initiated shutdown
fn main() {
    let args = Args::parse();
    std::process::exit(run(&args));
}

fn run(args: &Args) -> i32 {
    init_tracing(&args.log);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(config_path = %args.config.display(), error = %e, "configuration error");
            return 1;
        }
    };

    if args.check {
        tracing::info!(config_path = %args.config.display(), "configuration is valid");
        return 0;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return 2;
        }
    };

    match runtime.block_on(serve(&config)) {
        Ok(signalled) => {
            tracing::info!("manifold stopped");
            if signalled { 130 } else { 0 }
        }
        Err(e) => {
            tracing::error!(error = %e, "runtime fatal");
            2
        }
    }
}

/// Run the proxy until a shutdown signal; returns whether a signal fired
async fn serve(config: &Config) -> anyhow::Result<bool> {
    let state = ProxyState::from_config(config)?;

    let shutdown = CancellationToken::new();
    manifold_proxy::probe::spawn_probes(&state, config, &shutdown);

    let app = manifold_proxy::proxy_router(state.clone());

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {address}: {e}"))?;

    tracing::info!(%address, "manifold listening");

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_shutdown.cancelled().await;
        })
        .await?;

    // Stop intake, drain in-flight bounded, destroy stages
    state.shutdown().await;

    Ok(shutdown.is_cancelled())
}

/// Wait for `SIGINT` or `SIGTERM`
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
