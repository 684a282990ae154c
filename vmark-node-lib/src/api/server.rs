//! Persistent authenticated control API.
//!
//! POST-only, JSON-bodied. Every request must carry the `vmark_id` minted
//! during registration; a mismatch is rejected before any dispatch happens.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{json_response, reusable_listener};
use crate::dispatch::{dispatch, Node};
use crate::error::{NodeError, Result};
use crate::state::{epoch_now, RegisterState};

/// Serve the API until Ctrl-C. Requires a completed registration.
pub async fn serve(node: Arc<Node>, state: &RegisterState) -> Result<()> {
    let vmark_id = state
        .vmark_id
        .clone()
        .ok_or_else(|| NodeError::Validation("node is not registered: no vMark ID".into()))?;
    let listen_ip = state
        .listen_ip
        .as_deref()
        .ok_or_else(|| NodeError::Validation("no listen IP in registration state".into()))?
        .parse()
        .map_err(|_| NodeError::Validation("invalid listen IP in registration state".into()))?;
    let port = state
        .port
        .ok_or_else(|| NodeError::Validation("no port in registration state".into()))?;

    let addr = SocketAddr::new(listen_ip, port);
    let listener = reusable_listener(addr)?;
    info!(%addr, node_id = %state.node_id, "API server started");

    loop {
        let (stream, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("API server received Ctrl-C, shutting down");
                break;
            }
            conn = listener.accept() => match conn {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "API accept error");
                    continue;
                }
            },
        };

        let node = node.clone();
        let vmark_id = vmark_id.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let node = node.clone();
                let vmark_id = vmark_id.clone();
                async move { Ok::<_, hyper::Error>(handle(&node, &vmark_id, req).await) }
            });
            let builder = ConnBuilder::new(TokioExecutor::new());
            if let Err(err) = builder.serve_connection(TokioIo::new(stream), svc).await {
                warn!(?peer, %err, "API connection error");
            }
        });
    }

    node.registry.stop_all();
    info!("API server stopped");
    Ok(())
}

async fn handle(node: &Node, vmark_id: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(%err, "failed to read API request body");
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": "Unreadable request body"}),
            );
        }
    };

    let (status, payload) = handle_api_request(node, vmark_id, &method, &path, &body).await;
    json_response(status, &payload)
}

/// Route one API request. Split from the connection plumbing so the routing
/// and authentication rules are directly testable.
pub(crate) async fn handle_api_request(
    node: &Node,
    vmark_id: &str,
    method: &Method,
    path: &str,
    body: &[u8],
) -> (StatusCode, Value) {
    if method != Method::POST {
        return (
            StatusCode::NOT_IMPLEMENTED,
            json!({"error": "Unsupported method"}),
        );
    }

    let Ok(data) = serde_json::from_slice::<Value>(body) else {
        return (StatusCode::BAD_REQUEST, json!({"error": "Invalid JSON format"}));
    };

    if data.get("vmark_id").and_then(Value::as_str) != Some(vmark_id) {
        warn!(path, "request with missing or invalid vMark ID");
        return (StatusCode::FORBIDDEN, json!({"error": "Invalid vMark ID"}));
    }

    match path {
        // Heartbeats are deliberately not logged; controllers poll often.
        "/api/heartbeat" => (
            StatusCode::OK,
            json!({"status": "online", "timestamp": epoch_now()}),
        ),
        "/api/status" => {
            info!(path, "status request");
            (
                StatusCode::OK,
                json!({"status": "online", "timestamp": epoch_now()}),
            )
        }
        "/api/execute" => {
            let Some(command) = data.get("command").and_then(Value::as_str) else {
                warn!("execute request without 'command'");
                return (
                    StatusCode::BAD_REQUEST,
                    json!({"error": "Missing 'command' in request body"}),
                );
            };
            info!(command, "executing command");
            match dispatch(node, command).await {
                Ok(output) => (StatusCode::OK, json!({"output": output})),
                Err(NodeError::Unavailable(msg)) => {
                    (StatusCode::NOT_IMPLEMENTED, json!({"error": msg}))
                }
                Err(err) if err.is_caller_error() => {
                    (StatusCode::BAD_REQUEST, json!({"output": format!("Error: {err}")}))
                }
                Err(err) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"output": format!("Error executing command '{command}': {err}")}),
                ),
            }
        }
        _ => {
            warn!(path, "unknown endpoint");
            (StatusCode::NOT_FOUND, json!({"error": "Endpoint not found"}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePaths;
    use std::path::PathBuf;

    fn test_node() -> (tempfile::TempDir, Node) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::at(dir.path().to_path_buf()).unwrap();
        let node = Node::new(paths, PathBuf::from("/nonexistent/xdp_forwarding.o"));
        (dir, node)
    }

    #[tokio::test]
    async fn test_wrong_vmark_id_is_forbidden() {
        let (_dir, node) = test_node();
        let body = br#"{"vmark_id": "intruder", "command": "xdp-switch show-forwarding"}"#;
        let (status, payload) =
            handle_api_request(&node, "vm-1", &Method::POST, "/api/execute", body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(payload.get("error").is_some());
    }

    #[tokio::test]
    async fn test_missing_vmark_id_is_forbidden() {
        let (_dir, node) = test_node();
        let (status, _) =
            handle_api_request(&node, "vm-1", &Method::POST, "/api/status", br#"{}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_status_reports_online() {
        let (_dir, node) = test_node();
        let (status, payload) = handle_api_request(
            &node,
            "vm-1",
            &Method::POST,
            "/api/status",
            br#"{"vmark_id": "vm-1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "online");
        assert!(payload["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_execute_returns_output_json() {
        let (_dir, node) = test_node();
        let (status, payload) = handle_api_request(
            &node,
            "vm-1",
            &Method::POST,
            "/api/execute",
            br#"{"vmark_id": "vm-1", "command": "xdp-switch show-forwarding json"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let output = payload["output"].as_str().unwrap();
        // the output itself must be valid JSON matching the (empty) store
        let rules: Vec<serde_json::Value> = serde_json::from_str(output).unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_execute_caller_error_is_400() {
        let (_dir, node) = test_node();
        let (status, payload) = handle_api_request(
            &node,
            "vm-1",
            &Method::POST,
            "/api/execute",
            br#"{"vmark_id": "vm-1", "command": "xdp-switch delete-rule ghost"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["output"].as_str().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_404() {
        let (_dir, node) = test_node();
        let (status, _) = handle_api_request(
            &node,
            "vm-1",
            &Method::POST,
            "/api/wat",
            br#"{"vmark_id": "vm-1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_is_unsupported() {
        let (_dir, node) = test_node();
        let (status, _) =
            handle_api_request(&node, "vm-1", &Method::GET, "/api/status", b"{}").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }
}
