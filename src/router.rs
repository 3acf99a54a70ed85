use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::engine::ProposeError;
use crate::node::{KvNode, FORWARDED_HEADER};
use crate::state::RoleKind;
use crate::types::Member;

#[derive(Deserialize)]
struct SetForm {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

/// HTTP routes of one node.
pub fn router(node: Arc<KvNode>) -> Router {
    Router::new()
        .route("/key", post(set_key))
        .route("/key/{key}", get(get_key))
        .route("/healthcheck", get(healthcheck))
        .route("/cluster/join", post(join))
        .route("/cluster/status", get(status))
        .with_state(node)
}

/// Serve the client API on `listener` until ctrl-c.
pub async fn serve(listener: TcpListener, node: Arc<KvNode>) -> io::Result<()> {
    info!(node = %node.id(), addr = %listener.local_addr()?, "client api listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

fn error(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "error": text }))).into_response()
}

fn propose_failure(err: ProposeError) -> Response {
    let status = match err {
        ProposeError::NotLeader
        | ProposeError::Timeout
        | ProposeError::LeadershipLost
        | ProposeError::ChangeInProgress => StatusCode::SERVICE_UNAVAILABLE,
        ProposeError::AlreadyConfigured | ProposeError::Halted | ProposeError::Apply(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error(status, &err.to_string())
}

fn was_forwarded(headers: &HeaderMap) -> bool {
    headers.contains_key(FORWARDED_HEADER)
}

/// The leader to forward to, or the response to give when there is none.
fn forward_target(node: &KvNode, headers: &HeaderMap) -> Result<Member, Response> {
    if was_forwarded(headers) {
        return Err(error(StatusCode::SERVICE_UNAVAILABLE, "not the leader"));
    }
    match node.current_leader() {
        Some(leader) if leader.id != node.id() => Ok(leader),
        _ => Err(error(StatusCode::SERVICE_UNAVAILABLE, "no leader available")),
    }
}

/// Send one request to the leader and relay its answer unchanged.
async fn relay(leader: &Member, request: reqwest::RequestBuilder) -> Response {
    let response = match request.header(FORWARDED_HEADER, "1").send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(leader = %leader.id, error = %err, "forwarding to leader failed");
            return error(StatusCode::SERVICE_UNAVAILABLE, "could not reach leader");
        }
    };
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    match response.bytes().await {
        Ok(body) => (status, [(CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            warn!(leader = %leader.id, error = %err, "reading leader response failed");
            error(StatusCode::SERVICE_UNAVAILABLE, "could not reach leader")
        }
    }
}

async fn set_key(
    State(node): State<Arc<KvNode>>,
    headers: HeaderMap,
    Form(form): Form<SetForm>,
) -> Response {
    if form.key.is_empty() || form.value.is_empty() {
        return error(StatusCode::BAD_REQUEST, "key and value are required");
    }

    if node.role() == RoleKind::Leader {
        return match node.propose_set(&form.key, &form.value).await {
            Ok(()) => message(StatusCode::OK, "key set"),
            Err(err) => propose_failure(err),
        };
    }

    let leader = match forward_target(&node, &headers) {
        Ok(leader) => leader,
        Err(response) => return response,
    };
    debug!(leader = %leader.id, key = %form.key, "forwarding write to leader");
    let request = node
        .http()
        .post(format!("http://{}/key", leader.api_addr))
        .form(&[("key", form.key.as_str()), ("value", form.value.as_str())]);
    relay(&leader, request).await
}

async fn get_key(State(node): State<Arc<KvNode>>, Path(key): Path<String>) -> Response {
    match node.store().get(key.as_bytes()) {
        Ok(Some(value)) => (
            StatusCode::OK,
            Json(json!({ "key": key, "value": String::from_utf8_lossy(&value) })),
        )
            .into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, "key not found"),
        Err(err) => {
            warn!(key = %key, error = %err, "read failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn healthcheck(State(node): State<Arc<KvNode>>) -> Response {
    match node.health() {
        Ok(()) => message(StatusCode::OK, "Database is alive"),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn join(State(node): State<Arc<KvNode>>, headers: HeaderMap, body: Bytes) -> Response {
    let member: Member = match serde_json::from_slice(&body) {
        Ok(member) => member,
        Err(err) => return error(StatusCode::BAD_REQUEST, &format!("invalid member: {err}")),
    };

    if node.role() == RoleKind::Leader {
        info!(node = %node.id(), new_member = %member.id, "join requested");
        return match node.add_voter(member).await {
            Ok(()) => message(StatusCode::OK, "member added"),
            Err(err) => propose_failure(err),
        };
    }

    let leader = match forward_target(&node, &headers) {
        Ok(leader) => leader,
        Err(response) => return response,
    };
    let request = node
        .http()
        .post(format!("http://{}/cluster/join", leader.api_addr))
        .json(&member);
    relay(&leader, request).await
}

async fn status(State(node): State<Arc<KvNode>>) -> Response {
    Json(node.status()).into_response()
}
