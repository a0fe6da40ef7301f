//! HTTP-01 challenge responder.
//!
//! Runs two listeners:
//! - an RPC listener the load generator registers key authorizations with
//!   (`POST /add-http01`, `POST /del-http01`)
//! - the HTTP-01 listener the service under test validates against
//!   (`GET /.well-known/acme-challenge/{token}`)

use crate::client::Http01Registration;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registered tokens and their key authorizations.
#[derive(Clone, Default)]
pub struct ChallengeState {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: String, content: String) {
        self.tokens.insert(token, content);
    }

    pub fn remove(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Router for token registration.
pub fn rpc_router(state: ChallengeState) -> Router {
    Router::new()
        .route("/add-http01", post(add_http01_handler))
        .route("/del-http01", post(del_http01_handler))
        .with_state(state)
}

/// Router answering validation requests.
pub fn http01_router(state: ChallengeState) -> Router {
    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(challenge_handler),
        )
        .with_state(state)
}

async fn add_http01_handler(
    State(state): State<ChallengeState>,
    Json(registration): Json<Http01Registration>,
) -> StatusCode {
    debug!(token = %registration.token, "Registered HTTP-01 response");
    state.add(registration.token, registration.content);
    StatusCode::OK
}

async fn del_http01_handler(
    State(state): State<ChallengeState>,
    Json(registration): Json<Http01Registration>,
) -> StatusCode {
    if state.remove(&registration.token) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn challenge_handler(
    State(state): State<ChallengeState>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    state.get(&token).ok_or(StatusCode::NOT_FOUND)
}

/// Serve both listeners until `cancel` fires.
pub async fn serve(
    rpc_addr: SocketAddr,
    http_one_addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let state = ChallengeState::new();

    let rpc_listener = TcpListener::bind(rpc_addr).await?;
    let http_listener = TcpListener::bind(http_one_addr).await?;
    info!(rpc = %rpc_addr, http_one = %http_one_addr, "Challenge server listening");

    let rpc = axum::serve(rpc_listener, rpc_router(state.clone()))
        .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let http = axum::serve(http_listener, http01_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned());

    tokio::try_join!(
        async { rpc.await },
        async { http.await },
    )?;
    info!("Challenge server stopped");
    Ok(())
}
