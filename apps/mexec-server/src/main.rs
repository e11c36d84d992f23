use anyhow::Context as _;
use tracing::{error, info};

mod admission;
mod app_state;
mod attach;
mod bootstrap;
mod bridge;
pub mod config;
mod exec;
mod exec_api;
mod identity;
mod responses;
mod router;
mod rpc;
#[cfg(test)]
mod test_support;
mod tunnel;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    mexec_otel::init();

    let config = match config::ServerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    config.log_summary();

    if let Err(err) = run(config).await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: config::ServerConfig) -> anyhow::Result<()> {
    let addr = config.addr;
    let concurrency_limit = config.concurrency_limit;
    let bootstrap::BootstrapOutput { router, state } =
        bootstrap::build(config).context("bootstrap")?;

    let app = bootstrap::attach_http_layers(router, state.clone(), concurrency_limit);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind server socket {addr}"))?;
    info!(%addr, "mexec listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!(tunnels = state.tunnels().len(), "closing live tunnels");
    state.tunnels().close_all().await;
    state.bus().shutdown();
    Ok(())
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
