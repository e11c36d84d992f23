use std::mem;

use axum::{extract::State, handler::Handler, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::{admission, app_state::AppState, attach};

pub(crate) mod paths {
    pub const CONNECT: &str = "/connect";
    pub const ATTACH: &str = "/attach/{id}";
    pub const HEALTHZ: &str = "/healthz";
}

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder
        .route_get(paths::HEALTHZ, healthz)
        .route_get(paths::CONNECT, admission::connect)
        .route_get(paths::ATTACH, attach::attach);
    builder.build()
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tunnels": state.tunnels().len(),
        "sessions": state.sessions().len(),
        "subscriptions": state.bus().subscriber_count(),
    }))
}
