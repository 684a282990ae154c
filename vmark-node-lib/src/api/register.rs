//! One-shot registration handshake.
//!
//! The node mints an authentication token, prints it for the operator to
//! paste into the controller, and serves `POST /register` until the
//! controller presents the token together with the `vmark_id` it assigns.
//! Ctrl-C cancels and leaves the node unregistered.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use rand::{Rng, RngCore};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{json_response, reusable_listener};
use crate::error::Result;
use crate::state::{node_id, RegisterState, StatePaths};

pub enum RegistrationOutcome {
    Registered(RegisterState),
    Cancelled,
}

fn generate_token(use_pin: bool) -> String {
    if use_pin {
        format!("{:04}", rand::rng().random_range(0..10_000))
    } else {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

/// Run the registration listener until the controller registers or the
/// operator cancels.
pub async fn run_registration(
    paths: &StatePaths,
    listen_ip: IpAddr,
    port: u16,
    use_pin: bool,
) -> Result<RegistrationOutcome> {
    let token = generate_token(use_pin);
    let state = RegisterState {
        auth_token: token.clone(),
        registered: false,
        node_id: node_id(),
        vmark_id: None,
        listen_ip: Some(listen_ip.to_string()),
        port: Some(port),
    };
    state.save(paths)?;

    let addr = SocketAddr::new(listen_ip, port);
    let listener = reusable_listener(addr)?;
    info!(%addr, "registration server started");

    println!("Registration server started on {addr}");
    println!("Your authentication token is: {token}");
    println!();
    println!("Please use this token when adding this node in vMark.");
    println!("Waiting for registration... (Press Ctrl+C to cancel)");

    // The handler stores the vmark_id here once the token matched; the
    // accept loop checks it after each served connection.
    let accepted: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    loop {
        let (stream, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("registration cancelled by operator");
                return Ok(RegistrationOutcome::Cancelled);
            }
            conn = listener.accept() => match conn {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "registration accept error");
                    continue;
                }
            },
        };

        let token = token.clone();
        let slot = accepted.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let token = token.clone();
            let slot = slot.clone();
            async move { Ok::<_, hyper::Error>(handle_register(req, &token, &slot).await) }
        });

        // Registration is a single exchange; connections are served inline.
        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), svc)
            .await
        {
            warn!(%peer, %err, "registration connection error");
        }

        let vmark_id = accepted.lock().expect("registration mutex poisoned").take();
        if let Some(vmark_id) = vmark_id {
            let mut state = state.clone();
            state.vmark_id = Some(vmark_id);
            state.registered = true;
            state.save(paths)?;
            info!(node_id = %state.node_id, "registration complete");
            return Ok(RegistrationOutcome::Registered(state));
        }
    }
}

async fn handle_register(
    req: Request<Incoming>,
    expected_token: &str,
    accepted: &Mutex<Option<String>>,
) -> hyper::Response<Full<Bytes>> {
    if req.method() != Method::POST || req.uri().path() != "/register" {
        return json_response(StatusCode::NOT_FOUND, &json!({"error": "Not found"}));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(%err, "failed to read registration body");
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"error": "Unreadable request body"}),
            );
        }
    };
    let Ok(data) = serde_json::from_slice::<Value>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({"error": "Invalid JSON format"}),
        );
    };

    if data.get("auth_token").and_then(Value::as_str) != Some(expected_token) {
        warn!("registration attempt with invalid token");
        return json_response(
            StatusCode::UNAUTHORIZED,
            &json!({"error": "Invalid authentication token"}),
        );
    }
    let Some(vmark_id) = data.get("vmark_id").and_then(Value::as_str) else {
        warn!("registration request did not carry a vmark_id");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({"error": "Backend did not provide vMark ID"}),
        );
    };

    *accepted.lock().expect("registration mutex poisoned") = Some(vmark_id.to_string());
    json_response(
        StatusCode::OK,
        &json!({"status": "success", "node_id": node_id()}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_token_is_four_digits() {
        let pin = generate_token(true);
        assert_eq!(pin.len(), 4);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_full_token_is_urlsafe() {
        let token = generate_token(false);
        // 32 bytes base64url without padding
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
