use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chainbox_instance::InstanceId;
use chainbox_node::InstanceError;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::{ApiError, RpcError, RpcErrorKind};
use crate::proxy::{self, Envelope};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/new", post(create))
        .route("/kill", post(kill))
        .route("/:uuid", post(rpc_proxy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub ok: bool,
    pub uuid: String,
    pub seed_material: String,
}

async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CreateResponse>, ApiError> {
    if !state.gate.check(&headers) {
        return Err(ApiError::AuthFailure);
    }

    tracing::info!("launching node");
    let record = state.manager.create().await.map_err(|err| {
        tracing::error!(%err, "failed to launch node");
        ApiError::LaunchFailure
    })?;

    Ok(Json(CreateResponse {
        ok: true,
        uuid: record.uuid.0,
        seed_material: record.mnemonic,
    }))
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    uuid: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub ok: bool,
    pub message: &'static str,
}

async fn kill(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MessageResponse>, ApiError> {
    if !state.gate.check(&headers) {
        return Err(ApiError::AuthFailure);
    }

    let req: KillRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::MalformedRequest("expected a JSON body with a uuid field"))?;

    let Some(id) = InstanceId::parse(&req.uuid) else {
        tracing::info!(uuid = %req.uuid, "no instance to kill");
        return Err(ApiError::NotRunning);
    };

    match state.manager.kill(&id).await {
        Ok(()) => Ok(Json(MessageResponse {
            ok: true,
            message: "Instance killed",
        })),
        Err(InstanceError::NotFound(_)) => {
            tracing::info!(uuid = %id, "no instance to kill");
            Err(ApiError::NotRunning)
        }
        Err(err) => {
            tracing::error!(uuid = %id, %err, "kill failed");
            Err(ApiError::Internal)
        }
    }
}

async fn rpc_proxy(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !proxy::is_json_content_type(&headers) {
        return proxy::INVALID_CONTENT_TYPE.into_response();
    }
    let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return proxy::INVALID_CONTENT_TYPE.into_response();
    };

    let (id, method) = match proxy::classify(&parsed) {
        Envelope::Notification => return ().into_response(),
        Envelope::Invalid { id } => {
            return RpcError::new(id, RpcErrorKind::MalformedRequest).into_response();
        }
        Envelope::Call { id, method } => (id, method),
    };

    let Some(instance) = InstanceId::parse(&raw_id) else {
        return RpcError::new(id, RpcErrorKind::NotFound).into_response();
    };
    if !state.manager.is_live(&instance).await {
        return RpcError::new(id, RpcErrorKind::NotFound).into_response();
    }
    let record = match state.manager.lookup(&instance).await {
        Ok(record) => record,
        Err(InstanceError::NotFound(_)) => {
            return RpcError::new(id, RpcErrorKind::NotFound).into_response();
        }
        Err(err) => {
            tracing::error!(uuid = %instance, %err, "instance lookup failed");
            return RpcError::new(id, RpcErrorKind::NotFound).into_response();
        }
    };

    if !proxy::is_allowed(&method) && !state.gate.check(&headers) {
        tracing::debug!(uuid = %instance, method = %method, "blocked non-allow-listed method");
        return RpcError::new(id, RpcErrorKind::Forbidden).into_response();
    }

    match proxy::forward(&state.http, record.port, body, state.timeout).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(uuid = %instance, port = record.port, method = %method, %err, "forward to node failed");
            RpcError::new(id, RpcErrorKind::Upstream).into_response()
        }
    }
}
