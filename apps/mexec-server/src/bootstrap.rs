use std::sync::Arc;

use mexec_events::Bus;
use tracing::info;

use crate::{
    app_state::AppState,
    config::ServerConfig,
    exec::{ExecBackend, ProcessBackend, SessionRegistry},
    exec_api,
    identity::{self, IdentityVerifier, KubeDirectory, NamespaceError},
    router::build_router,
    rpc::{RegistryError, RouteTable},
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum BootstrapError {
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error("route registry: {0}")]
    Routes(#[from] RegistryError),
}

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
}

/// Production wiring: kube-backed ownership checks and a process backend.
pub(crate) fn build(config: ServerConfig) -> Result<BootstrapOutput, BootstrapError> {
    let bus = Bus::new();
    let verifier = if config.use_bearer_token {
        let namespace = identity::read_namespace(&config.namespace_file)?;
        info!(%namespace, "bearer enforcement enabled");
        let directory = Arc::new(KubeDirectory::new(config.owner_annotation.clone()));
        Some(Arc::new(IdentityVerifier::new(directory, namespace, &config)))
    } else {
        None
    };
    let backend: Arc<dyn ExecBackend> = Arc::new(ProcessBackend::new(bus.clone()));
    assemble(config, bus, verifier, backend)
}

/// Composes the route table and state from already-built parts.
pub(crate) fn assemble(
    config: ServerConfig,
    bus: Bus,
    verifier: Option<Arc<IdentityVerifier>>,
    backend: Arc<dyn ExecBackend>,
) -> Result<BootstrapOutput, BootstrapError> {
    let sessions = Arc::new(SessionRegistry::new(config.output_replay));
    let routes = RouteTable::compose(vec![exec_api::routes(
        sessions.clone(),
        backend,
        config.use_bearer_token,
    )])?;
    routes.log_routes();

    let mut builder = AppState::builder(config, bus, routes).with_sessions(sessions);
    if let Some(verifier) = verifier {
        builder = builder.with_verifier(verifier);
    }
    let state = builder.build();

    let (router, endpoints) = build_router();
    info!(endpoints = ?endpoints, "http routes registered");
    Ok(BootstrapOutput { router, state })
}

pub(crate) fn attach_http_layers(
    router: axum::Router<AppState>,
    state: AppState,
    concurrency_limit: usize,
) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .with_state::<()>(state)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}
