use std::sync::Arc;

use mexec_events::Bus;

use crate::config::ServerConfig;
use crate::exec::SessionRegistry;
use crate::identity::IdentityVerifier;
use crate::rpc::RouteTable;
use crate::tunnel::TunnelRegistry;

#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<ServerConfig>,
    bus: Bus,
    verifier: Option<Arc<IdentityVerifier>>,
    routes: Arc<RouteTable>,
    tunnels: Arc<TunnelRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn builder(config: ServerConfig, bus: Bus, routes: RouteTable) -> AppStateBuilder {
        AppStateBuilder {
            config,
            bus,
            routes,
            verifier: None,
            sessions: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Present whenever bearer enforcement is on.
    pub fn verifier(&self) -> Option<&Arc<IdentityVerifier>> {
        self.verifier.as_ref()
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.clone()
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

pub(crate) struct AppStateBuilder {
    config: ServerConfig,
    bus: Bus,
    routes: RouteTable,
    verifier: Option<Arc<IdentityVerifier>>,
    sessions: Option<Arc<SessionRegistry>>,
}

impl AppStateBuilder {
    pub fn with_verifier(mut self, verifier: Arc<IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> AppState {
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(SessionRegistry::new(self.config.output_replay)));
        AppState {
            config: Arc::new(self.config),
            bus: self.bus,
            verifier: self.verifier,
            routes: Arc::new(self.routes),
            tunnels: Arc::new(TunnelRegistry::default()),
            sessions,
        }
    }
}
