//! In-process mock ACME service.
//!
//! Implements just enough of the protocol to exercise the load generator:
//! JWS signatures are verified, nonces are single-use, and HTTP-01
//! challenges are validated against a real challenge responder router.

#![allow(dead_code)]

use acme_loadgen::challsrv::{self, ChallengeState};
use acme_loadgen::client::jws::{FlattenedJws, Jwk};
use acme_loadgen::LoadgenConfig;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

struct MockAuthz {
    account: u64,
    domain: String,
    token: String,
    status: &'static str,
}

struct MockOrder {
    account: u64,
    domains: Vec<String>,
    authzs: Vec<u64>,
    status: &'static str,
    cert: Option<u64>,
}

struct MockCert {
    der: Vec<u8>,
    revoked: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    outstanding_nonces: HashSet<String>,
    accounts_by_thumbprint: HashMap<String, u64>,
    account_keys: HashMap<u64, (Jwk, String)>,
    authzs: HashMap<u64, MockAuthz>,
    orders: HashMap<u64, MockOrder>,
    certs: HashMap<u64, MockCert>,
}

impl Inner {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared state of the mock service.
pub struct MockState {
    base: String,
    inner: Mutex<Inner>,
    challenges: ChallengeState,
    pre_authorization: bool,
    pub head_probes: AtomicU64,
    pub bad_nonces: AtomicU64,
    pub revocations: AtomicU64,
    pub lookups: AtomicU64,
}

struct Verified {
    account: Option<u64>,
    jwk: Option<Jwk>,
    payload: Vec<u8>,
}

impl MockState {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn fresh_nonce(&self) -> String {
        let mut inner = self.inner.lock();
        let id = inner.id();
        let nonce = format!("nonce-{}", id);
        inner.outstanding_nonces.insert(nonce.clone());
        nonce
    }

    fn headers(&self, location: Option<String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.fresh_nonce()) {
            headers.insert("Replay-Nonce", v);
        }
        if let Some(location) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
            headers.insert(header::LOCATION, location);
        }
        headers
    }

    fn reply(&self, status: StatusCode, location: Option<String>, body: Value) -> Response {
        let mut headers = self.headers(location);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        (status, headers, body.to_string()).into_response()
    }

    fn problem(&self, status: StatusCode, kind: &str, detail: &str) -> Response {
        self.reply(
            status,
            None,
            json!({"type": format!("urn:ietf:params:acme:error:{}", kind), "detail": detail}),
        )
    }

    /// Check signature, URL, and nonce of a request.
    fn verify(&self, body: &Bytes, path: &str) -> Result<Verified, Response> {
        let bad = |detail: &str| self.problem(StatusCode::BAD_REQUEST, "malformed", detail);

        let jws: FlattenedJws = serde_json::from_slice(body).map_err(|_| bad("not a JWS"))?;
        let header = jws.header().map_err(|_| bad("bad protected header"))?;
        if header.alg != "ES256" {
            return Err(bad("unexpected alg"));
        }
        if header.url != self.url(path) {
            return Err(bad("url mismatch"));
        }
        if !self.inner.lock().outstanding_nonces.remove(&header.nonce) {
            self.bad_nonces.fetch_add(1, Ordering::SeqCst);
            return Err(self.problem(StatusCode::BAD_REQUEST, "badNonce", "unknown nonce"));
        }

        let (key, account, jwk) = match (&header.jwk, &header.kid) {
            (Some(jwk), None) => {
                let key = jwk.verifying_key().map_err(|_| bad("bad jwk"))?;
                (key, None, Some(jwk.clone()))
            }
            (None, Some(kid)) => {
                let id: u64 = kid
                    .strip_prefix(&self.url("/acct/"))
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| bad("bad kid"))?;
                let registered = self
                    .inner
                    .lock()
                    .account_keys
                    .get(&id)
                    .map(|(jwk, _)| jwk.clone())
                    .ok_or_else(|| {
                        self.problem(StatusCode::BAD_REQUEST, "accountDoesNotExist", "no such account")
                    })?;
                let key = registered.verifying_key().map_err(|_| bad("bad jwk"))?;
                (key, Some(id), None)
            }
            _ => return Err(bad("exactly one of jwk and kid is required")),
        };

        if !jws.verify(&key) {
            return Err(self.problem(StatusCode::UNAUTHORIZED, "unauthorized", "bad signature"));
        }
        let payload = jws.payload_bytes().map_err(|_| bad("bad payload"))?;
        Ok(Verified {
            account,
            jwk,
            payload,
        })
    }

    fn authz_json(&self, id: u64, authz: &MockAuthz) -> Value {
        json!({
            "status": authz.status,
            "identifier": {"type": "dns", "value": authz.domain},
            "challenges": [{
                "type": "http-01",
                "url": self.url(&format!("/chall/{}", id)),
                "token": authz.token,
                "status": authz.status,
            }],
        })
    }

    fn order_json(&self, id: u64, order: &MockOrder) -> Value {
        let mut value = json!({
            "status": order.status,
            "identifiers": order.domains.iter().map(|d| json!({"type": "dns", "value": d})).collect::<Vec<_>>(),
            "authorizations": order.authzs.iter().map(|a| self.url(&format!("/authz/{}", a))).collect::<Vec<_>>(),
            "finalize": self.url(&format!("/order/{}/finalize", id)),
        });
        if let (Some(cert), "valid") = (order.cert, order.status) {
            value["certificate"] = json!(self.url(&format!("/cert/{}", cert)));
        }
        value
    }
}

type Shared = State<Arc<MockState>>;

fn payload_json(verified: &Verified) -> Value {
    serde_json::from_slice(&verified.payload).unwrap_or(Value::Null)
}

async fn directory(State(state): Shared, method: Method) -> Response {
    if method == Method::HEAD {
        state.head_probes.fetch_add(1, Ordering::SeqCst);
        return (StatusCode::OK, state.headers(None)).into_response();
    }
    let mut directory = json!({
        "newNonce": state.url("/directory"),
        "newAccount": state.url("/new-acct"),
        "newOrder": state.url("/new-order"),
        "revokeCert": state.url("/revoke-cert"),
    });
    if state.pre_authorization {
        directory["newAuthz"] = json!(state.url("/new-authz"));
    }
    Json(directory).into_response()
}

async fn new_account(State(state): Shared, body: Bytes) -> Response {
    let verified = match state.verify(&body, "/new-acct") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(jwk) = verified.jwk.clone() else {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "jwk required");
    };
    let request = payload_json(&verified);
    let thumbprint = jwk.thumbprint();

    let existing = state
        .inner
        .lock()
        .accounts_by_thumbprint
        .get(&thumbprint)
        .copied();
    if request["onlyReturnExisting"] == json!(true) {
        state.lookups.fetch_add(1, Ordering::SeqCst);
        return match existing {
            Some(id) => state.reply(
                StatusCode::OK,
                Some(state.url(&format!("/acct/{}", id))),
                json!({"status": "valid"}),
            ),
            None => state.problem(
                StatusCode::BAD_REQUEST,
                "accountDoesNotExist",
                "no account for key",
            ),
        };
    }
    if let Some(id) = existing {
        return state.reply(
            StatusCode::OK,
            Some(state.url(&format!("/acct/{}", id))),
            json!({"status": "valid"}),
        );
    }

    let id = {
        let mut inner = state.inner.lock();
        let id = inner.id();
        inner.accounts_by_thumbprint.insert(thumbprint.clone(), id);
        inner.account_keys.insert(id, (jwk, thumbprint));
        id
    };
    state.reply(
        StatusCode::CREATED,
        Some(state.url(&format!("/acct/{}", id))),
        json!({"status": "valid"}),
    )
}

async fn new_authz(State(state): Shared, body: Bytes) -> Response {
    let verified = match state.verify(&body, "/new-authz") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(account) = verified.account else {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "kid required");
    };
    let request = payload_json(&verified);
    let Some(domain) = request["identifier"]["value"].as_str() else {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "identifier required");
    };

    let (id, body) = {
        let mut inner = state.inner.lock();
        let id = inner.id();
        let authz = MockAuthz {
            account,
            domain: domain.to_string(),
            token: format!("token-{}", id),
            status: "pending",
        };
        let body = state.authz_json(id, &authz);
        inner.authzs.insert(id, authz);
        (id, body)
    };
    state.reply(
        StatusCode::CREATED,
        Some(state.url(&format!("/authz/{}", id))),
        body,
    )
}

async fn get_authz(State(state): Shared, Path(id): Path<u64>, body: Bytes) -> Response {
    if let Err(resp) = state.verify(&body, &format!("/authz/{}", id)) {
        return resp;
    }
    let body = state
        .inner
        .lock()
        .authzs
        .get(&id)
        .map(|authz| state.authz_json(id, authz));
    match body {
        Some(body) => state.reply(StatusCode::OK, None, body),
        None => state.problem(StatusCode::NOT_FOUND, "malformed", "no such authorization"),
    }
}

async fn respond_challenge(State(state): Shared, Path(id): Path<u64>, body: Bytes) -> Response {
    let verified = match state.verify(&body, &format!("/chall/{}", id)) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut inner = state.inner.lock();
    let Some(thumbprint) = verified
        .account
        .and_then(|a| inner.account_keys.get(&a))
        .map(|(_, t)| t.clone())
    else {
        drop(inner);
        return state.problem(StatusCode::UNAUTHORIZED, "unauthorized", "unknown account");
    };
    let Some(authz) = inner.authzs.get_mut(&id) else {
        drop(inner);
        return state.problem(StatusCode::NOT_FOUND, "malformed", "no such challenge");
    };

    // Validate against what the challenge responder would serve.
    let expected = format!("{}.{}", authz.token, thumbprint);
    authz.status = if state.challenges.get(&authz.token).as_deref() == Some(expected.as_str()) {
        "valid"
    } else {
        "invalid"
    };
    let body = json!({
        "type": "http-01",
        "url": state.url(&format!("/chall/{}", id)),
        "token": authz.token,
        "status": authz.status,
    });
    drop(inner);
    state.reply(StatusCode::OK, None, body)
}

async fn new_order(State(state): Shared, body: Bytes) -> Response {
    let verified = match state.verify(&body, "/new-order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(account) = verified.account else {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "kid required");
    };
    let request = payload_json(&verified);
    let domains: Vec<String> = request["identifiers"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|i| i["value"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if domains.is_empty() {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "identifiers required");
    }

    let mut inner = state.inner.lock();
    let mut authzs = Vec::with_capacity(domains.len());
    let mut ready = true;
    for domain in &domains {
        let valid = inner
            .authzs
            .iter()
            .find(|(_, a)| a.account == account && a.domain == *domain && a.status == "valid")
            .map(|(id, _)| *id);
        match valid {
            Some(id) => authzs.push(id),
            None if state.pre_authorization => {
                drop(inner);
                return state.problem(
                    StatusCode::FORBIDDEN,
                    "unauthorized",
                    "identifiers not authorized",
                );
            }
            None => {
                let id = inner.id();
                inner.authzs.insert(
                    id,
                    MockAuthz {
                        account,
                        domain: domain.clone(),
                        token: format!("token-{}", id),
                        status: "pending",
                    },
                );
                authzs.push(id);
                ready = false;
            }
        }
    }

    let id = inner.id();
    let order = MockOrder {
        account,
        domains,
        authzs,
        status: if ready { "ready" } else { "pending" },
        cert: None,
    };
    let body = state.order_json(id, &order);
    inner.orders.insert(id, order);
    drop(inner);
    state.reply(
        StatusCode::CREATED,
        Some(state.url(&format!("/order/{}", id))),
        body,
    )
}

async fn finalize(State(state): Shared, Path(id): Path<u64>, body: Bytes) -> Response {
    let verified = match state.verify(&body, &format!("/order/{}/finalize", id)) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let request = payload_json(&verified);
    let csr_ok = request["csr"]
        .as_str()
        .and_then(|c| URL_SAFE_NO_PAD.decode(c).ok())
        .is_some_and(|der| !der.is_empty());
    if !csr_ok {
        return state.problem(StatusCode::BAD_REQUEST, "badCSR", "missing CSR");
    }

    let mut inner = state.inner.lock();
    let cert_id = inner.id();
    let Some(order) = inner.orders.get_mut(&id) else {
        drop(inner);
        return state.problem(StatusCode::NOT_FOUND, "malformed", "no such order");
    };
    if order.status != "ready" || Some(order.account) != verified.account {
        drop(inner);
        return state.problem(StatusCode::FORBIDDEN, "orderNotReady", "order not ready");
    }
    // Issuance completes on the next poll.
    order.status = "processing";
    order.cert = Some(cert_id);
    let body = state.order_json(id, order);
    inner.certs.insert(
        cert_id,
        MockCert {
            der: format!("mock-cert-{}", cert_id).into_bytes(),
            revoked: false,
        },
    );
    drop(inner);
    state.reply(StatusCode::OK, None, body)
}

async fn get_order(State(state): Shared, Path(id): Path<u64>, body: Bytes) -> Response {
    if let Err(resp) = state.verify(&body, &format!("/order/{}", id)) {
        return resp;
    }
    let body = {
        let mut inner = state.inner.lock();
        let Inner { orders, authzs, .. } = &mut *inner;
        orders.get_mut(&id).map(|order| {
            let authorized = order
                .authzs
                .iter()
                .all(|a| authzs.get(a).is_some_and(|a| a.status == "valid"));
            match order.status {
                "pending" if authorized => order.status = "ready",
                "processing" => order.status = "valid",
                _ => {}
            }
            state.order_json(id, order)
        })
    };
    match body {
        Some(body) => state.reply(StatusCode::OK, None, body),
        None => state.problem(StatusCode::NOT_FOUND, "malformed", "no such order"),
    }
}

async fn get_cert(State(state): Shared, Path(id): Path<u64>, body: Bytes) -> Response {
    if let Err(resp) = state.verify(&body, &format!("/cert/{}", id)) {
        return resp;
    }
    let der = state.inner.lock().certs.get(&id).map(|c| c.der.clone());
    let Some(der) = der else {
        return state.problem(StatusCode::NOT_FOUND, "malformed", "no such certificate");
    };
    let pem = format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        STANDARD.encode(der)
    );
    let mut headers = state.headers(None);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pem-certificate-chain"),
    );
    (StatusCode::OK, headers, pem).into_response()
}

async fn revoke_cert(State(state): Shared, body: Bytes) -> Response {
    let verified = match state.verify(&body, "/revoke-cert") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let request = payload_json(&verified);
    let Some(der) = request["certificate"]
        .as_str()
        .and_then(|c| URL_SAFE_NO_PAD.decode(c).ok())
    else {
        return state.problem(StatusCode::BAD_REQUEST, "malformed", "certificate required");
    };

    let revoked = {
        let mut inner = state.inner.lock();
        match inner.certs.values_mut().find(|c| c.der == der) {
            Some(cert) if !cert.revoked => {
                cert.revoked = true;
                true
            }
            _ => false,
        }
    };
    if !revoked {
        return state.problem(StatusCode::BAD_REQUEST, "alreadyRevoked", "unknown or revoked");
    }
    state.revocations.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, state.headers(None)).into_response()
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/directory", get(directory))
        .route("/new-acct", post(new_account))
        .route("/new-authz", post(new_authz))
        .route("/authz/{id}", post(get_authz))
        .route("/chall/{id}", post(respond_challenge))
        .route("/new-order", post(new_order))
        .route("/order/{id}", post(get_order))
        .route("/order/{id}/finalize", post(finalize))
        .route("/cert/{id}", post(get_cert))
        .route("/revoke-cert", post(revoke_cert))
        .with_state(state)
}

/// A running mock service plus its challenge responder.
pub struct MockAcme {
    pub state: Arc<MockState>,
    pub addr: SocketAddr,
    pub challenge_addr: SocketAddr,
}

impl MockAcme {
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// A service whose directory has no `newAuthz`, so authorizations only
    /// come from orders.
    pub async fn start_without_pre_authorization() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(pre_authorization: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let challenge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let challenge_addr = challenge_listener.local_addr().unwrap();

        let challenges = ChallengeState::new();
        let state = Arc::new(MockState {
            base: format!("http://{}", addr),
            inner: Mutex::new(Inner::default()),
            challenges: challenges.clone(),
            pre_authorization,
            head_probes: AtomicU64::new(0),
            bad_nonces: AtomicU64::new(0),
            revocations: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        });

        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let responder = challsrv::rpc_router(challenges);
        tokio::spawn(async move {
            axum::serve(challenge_listener, responder).await.unwrap();
        });

        Self {
            state,
            addr,
            challenge_addr,
        }
    }

    pub fn directory_url(&self) -> String {
        format!("http://{}/directory", self.addr)
    }

    /// Configuration pointing at this mock, with fast polling.
    pub fn config(&self) -> LoadgenConfig {
        let mut config = LoadgenConfig::new(self.directory_url())
            .with_skip_challenge_server(true)
            .with_seed(7);
        config.challenge.rpc_addr = self.challenge_addr.to_string();
        config.authz_poll_interval_ms = 10;
        config.request_timeout_ms = 5_000;
        config.domain_base = "example.test".to_string();
        config
    }

    pub fn head_probes(&self) -> u64 {
        self.state.head_probes.load(Ordering::SeqCst)
    }

    pub fn bad_nonces(&self) -> u64 {
        self.state.bad_nonces.load(Ordering::SeqCst)
    }

    pub fn revocations(&self) -> u64 {
        self.state.revocations.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> u64 {
        self.state.lookups.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> usize {
        self.state.inner.lock().orders.len()
    }
}
