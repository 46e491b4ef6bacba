//! HTTP surface of a node
//!
//! `POST /raft/rpc` carries node-to-node traffic; the remaining routes are a
//! small JSON API for clients and operators.

use crate::types::{CmdRequest, CmdResponse, ServerStatus};
use crate::RaftNode;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use raftkv_core::{NodeAddr, RaftKvError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type AppState = Arc<RaftNode>;

pub fn router(node: Arc<RaftNode>) -> Router {
    Router::new()
        .route("/raft/rpc", post(rpc))
        .route("/kv/:key", get(get_key).put(put_key).delete(delete_key))
        .route("/cluster/servers", post(add_server))
        .route("/cluster/leader", get(leader))
        .route("/cluster/nodes", get(nodes))
        .route("/status", get(status))
        .with_state(node)
}

/// Error body returned to HTTP clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// True when the same request may succeed later or on another node
    pub retriable: bool,
    /// Set when the request must be retried on the leader
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<NodeAddr>,
}

pub struct ApiError(RaftKvError);

impl From<RaftKvError> for ApiError {
    fn from(e: RaftKvError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RaftKvError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            RaftKvError::NoQuorum => StatusCode::SERVICE_UNAVAILABLE,
            RaftKvError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            retriable: self.0.is_retriable(),
            leader: self.0.leader_hint().cloned(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ModeQuery {
    #[serde(default)]
    pub dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueBody {
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddServerBody {
    pub addr: NodeAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderBody {
    pub leader: Option<NodeAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesBody {
    pub nodes: Vec<NodeAddr>,
}

async fn rpc(State(node): State<AppState>, Json(request): Json<CmdRequest>) -> Json<CmdResponse> {
    Json(node.dispatch(request).await)
}

async fn get_key(
    State(node): State<AppState>,
    Path(key): Path<String>,
    Query(mode): Query<ModeQuery>,
) -> ApiResult<Response> {
    let value = if mode.dirty {
        node.dirty_read(key.as_str()).await?
    } else {
        node.read(key.as_str()).await?
    };
    let status = if value.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(KeyValue { key, value })).into_response())
}

async fn put_key(
    State(node): State<AppState>,
    Path(key): Path<String>,
    Query(mode): Query<ModeQuery>,
    Json(body): Json<ValueBody>,
) -> ApiResult<StatusCode> {
    if mode.dirty {
        node.dirty_write(key, body.value).await?;
    } else {
        node.write(key, body.value).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_key(State(node): State<AppState>, Path(key): Path<String>) -> ApiResult<StatusCode> {
    node.delete(key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_server(
    State(node): State<AppState>,
    Json(body): Json<AddServerBody>,
) -> ApiResult<StatusCode> {
    node.add_server(body.addr).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leader(State(node): State<AppState>) -> Json<LeaderBody> {
    Json(LeaderBody {
        leader: node.get_leader(),
    })
}

async fn nodes(State(node): State<AppState>) -> Json<NodesBody> {
    Json(NodesBody {
        nodes: node.get_all_nodes(),
    })
}

async fn status(State(node): State<AppState>) -> Json<ServerStatus> {
    Json(node.server_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use raftkv_core::{NodeConfig, Role};
    use raftkv_storage::MemEngine;
    use serde::de::DeserializeOwned;
    use std::time::Duration;
    use tower::ServiceExt;

    fn node(members: Vec<NodeAddr>) -> Arc<RaftNode> {
        let addr = members[0].clone();
        let config = NodeConfig {
            addr: addr.clone(),
            members,
            ..NodeConfig::default()
        };
        let network = LocalNetwork::new();
        Arc::new(
            RaftNode::with_engines(
                &config,
                Arc::new(MemEngine::new()),
                Arc::new(MemEngine::new()),
                network.transport(addr),
            )
            .unwrap(),
        )
    }

    async fn leader_node() -> Arc<RaftNode> {
        let node = node(vec![NodeAddr::new("127.0.0.1", 9201)]);
        node.start();
        for _ in 0..100 {
            if node.is_leader() {
                return node;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader");
    }

    fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let app = router(leader_node().await);

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/kv/x",
                Some(serde_json::json!({ "value": "1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.clone().oneshot(request(Method::GET, "/kv/x", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: KeyValue = json(response).await;
        assert_eq!(body.value.as_deref(), Some("1"));

        let response = app
            .oneshot(request(Method::GET, "/kv/missing?dirty=true", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete() {
        let app = router(leader_node().await);
        app.clone()
            .oneshot(request(
                Method::PUT,
                "/kv/gone",
                Some(serde_json::json!({ "value": "soon" })),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, "/kv/gone", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(request(Method::GET, "/kv/gone", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_follower_write_is_misdirected() {
        let node = node(vec![
            NodeAddr::new("127.0.0.1", 9211),
            NodeAddr::new("127.0.0.1", 9212),
            NodeAddr::new("127.0.0.1", 9213),
        ]);
        let app = router(node);

        let response = app
            .oneshot(request(
                Method::PUT,
                "/kv/x",
                Some(serde_json::json!({ "value": "1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
        let body: ErrorBody = json(response).await;
        assert!(body.error.contains("not leader"));
        assert!(body.retriable);
        assert!(body.leader.is_none());
    }

    #[tokio::test]
    async fn test_cluster_and_status_routes() {
        let node = leader_node().await;
        let app = router(node.clone());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/cluster/leader", None))
            .await
            .unwrap();
        let body: LeaderBody = json(response).await;
        assert_eq!(body.leader.as_ref(), Some(node.addr()));

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/cluster/nodes", None))
            .await
            .unwrap();
        let body: NodesBody = json(response).await;
        assert_eq!(body.nodes, vec![node.addr().clone()]);

        let response = app.oneshot(request(Method::GET, "/status", None)).await.unwrap();
        let status: ServerStatus = json(response).await;
        assert_eq!(status.role, Role::Leader);
    }

    #[tokio::test]
    async fn test_rpc_route() {
        let app = router(leader_node().await);
        let body = serde_json::to_value(CmdRequest::ServerStatus).unwrap();

        let response = app
            .oneshot(request(Method::POST, "/raft/rpc", Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: CmdResponse = json(response).await;
        assert!(matches!(reply, CmdResponse::ServerStatus(s) if s.role == Role::Leader));
    }
}
