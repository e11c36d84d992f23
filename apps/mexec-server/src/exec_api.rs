//! `exec` JSON-RPC route group: create, check and resize sessions.

use std::sync::Arc;

use mexec_protocol::RpcError;
use mexec_topics::{ATTR_BEARER_TOKEN, METHOD_EXEC_CHECK, METHOD_EXEC_CREATE, METHOD_EXEC_RESIZE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::exec::{ExecBackend, ExecError, ExecRequest, SessionId, SessionRegistry};
use crate::rpc::{decode_params, CallContext, Route, RoutesGroup};

pub(crate) const GROUP: &str = "exec";

#[derive(Clone)]
struct ExecApi {
    sessions: Arc<SessionRegistry>,
    backend: Arc<dyn ExecBackend>,
    require_token: bool,
}

#[derive(Deserialize)]
struct SessionRef {
    id: String,
}

#[derive(Deserialize)]
struct ResizeParams {
    id: String,
    cols: u16,
    rows: u16,
}

pub(crate) fn routes(
    sessions: Arc<SessionRegistry>,
    backend: Arc<dyn ExecBackend>,
    require_token: bool,
) -> RoutesGroup {
    let api = ExecApi {
        sessions,
        backend,
        require_token,
    };
    let create = api.clone();
    let check = api.clone();
    let resize = api;
    RoutesGroup {
        name: GROUP,
        routes: vec![
            Route::new(METHOD_EXEC_CREATE, move |ctx, params| {
                let api = create.clone();
                async move { api.create(ctx, params).await }
            }),
            Route::new(METHOD_EXEC_CHECK, move |ctx, params| {
                let api = check.clone();
                async move { api.check(ctx, params) }
            }),
            Route::new(METHOD_EXEC_RESIZE, move |ctx, params| {
                let api = resize.clone();
                async move { api.resize(ctx, params) }
            }),
        ],
    }
}

impl ExecApi {
    fn authorize(&self, ctx: &CallContext) -> Result<(), RpcError> {
        if !self.require_token {
            return Ok(());
        }
        match ctx.tunnel.attribute(ATTR_BEARER_TOKEN) {
            Some(token) if !token.is_empty() => Ok(()),
            _ => {
                warn!(tunnel = %ctx.tunnel.id(), "exec call without credential");
                Err(RpcError::unauthorized())
            }
        }
    }

    async fn create(&self, ctx: CallContext, params: Value) -> Result<Value, RpcError> {
        self.authorize(&ctx)?;
        let request: ExecRequest = decode_params(params)?;
        let session = self
            .sessions
            .create(request)
            .map_err(|err| RpcError::invalid_params(err.to_string()))?;
        debug!(tunnel = %ctx.tunnel.id(), session = %session.id(), "exec create");
        self.backend
            .start(session.clone())
            .await
            .map_err(|err| exec_failed(session.id(), err))?;
        Ok(json!({ "id": session.id() }))
    }

    fn check(&self, ctx: CallContext, params: Value) -> Result<Value, RpcError> {
        self.authorize(&ctx)?;
        let SessionRef { id } = decode_params(params)?;
        let session = self
            .sessions
            .get(&SessionId::from(id.as_str()))
            .ok_or_else(|| session_not_found(&id))?;
        let (cols, rows) = session.size();
        Ok(json!({
            "id": session.id(),
            "status": session.status(),
            "cols": cols,
            "rows": rows,
        }))
    }

    fn resize(&self, ctx: CallContext, params: Value) -> Result<Value, RpcError> {
        self.authorize(&ctx)?;
        let ResizeParams { id, cols, rows } = decode_params(params)?;
        let session = self
            .sessions
            .get(&SessionId::from(id.as_str()))
            .ok_or_else(|| session_not_found(&id))?;
        session
            .resize(cols, rows)
            .map_err(|err| RpcError::invalid_params(err.to_string()))?;
        Ok(json!({ "id": session.id(), "text": "resized" }))
    }
}

fn session_not_found(id: &str) -> RpcError {
    RpcError::new(RpcError::SESSION_NOT_FOUND, format!("exec session '{id}' not found"))
}

fn exec_failed(id: &SessionId, err: ExecError) -> RpcError {
    RpcError::new(RpcError::EXEC_FAILED, err.to_string()).with_data(json!({ "id": id }))
}
