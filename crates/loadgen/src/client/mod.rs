//! ACME client for driving the service under test.
//!
//! Covers only the protocol surface the load generator needs: account
//! creation and lookup, pre-authorization, HTTP-01 challenge response,
//! ordering, finalization, certificate download, and revocation.
//!
//! Every call is timed into the shared [`LatencyRecorder`], and every
//! response's `Replay-Nonce` header is fed back into the shared
//! [`NoncePool`].

pub mod jws;
mod types;

pub use types::*;

use crate::config::LoadgenConfig;
use crate::latency::{CallOutcome, LatencyRecorder};
use crate::nonce::{NoncePool, NonceProbe};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jws::{AccountSigner, KeyBinding, SignerError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, StatusCode};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::OnceCell;

/// Response header carrying a fresh replay nonce.
pub const REPLAY_NONCE: &str = "Replay-Nonce";

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Latency labels, one per logical endpoint.
mod endpoint {
    pub const DIRECTORY: &str = "GET /directory";
    pub const NONCE_PROBE: &str = "HEAD /directory";
    pub const NEW_ACCOUNT: &str = "POST /new-account";
    pub const FIND_ACCOUNT: &str = "POST /new-account (existing)";
    pub const NEW_AUTHZ: &str = "POST /new-authz";
    pub const AUTHZ: &str = "POST /authz";
    pub const CHALLENGE: &str = "POST /challenge";
    pub const NEW_ORDER: &str = "POST /new-order";
    pub const FINALIZE: &str = "POST /finalize";
    pub const ORDER: &str = "POST /order";
    pub const CERT: &str = "POST /cert";
    pub const REVOKE: &str = "POST /revoke-cert";
    pub const ADD_HTTP01: &str = "POST /add-http01";
}

/// A successful response.
struct Reply {
    location: Option<String>,
    body: Vec<u8>,
}

impl Reply {
    fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn location(&self) -> Result<String, ClientError> {
        self.location.clone().ok_or(ClientError::MissingLocation)
    }
}

/// Client for one ACME service.
pub struct AcmeClient {
    http: Client,
    directory_url: String,
    directory: OnceCell<Directory>,
    challenge_rpc_url: String,
    nonces: Arc<NoncePool>,
    latency: Arc<LatencyRecorder>,
}

impl AcmeClient {
    /// Create a client for the service configured in `config`.
    ///
    /// Certificate verification is disabled: the service under test usually
    /// runs with a throwaway TLS certificate.
    pub fn new(
        config: &LoadgenConfig,
        nonces: Arc<NoncePool>,
        latency: Arc<LatencyRecorder>,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Real-IP",
            HeaderValue::from_str(&config.real_ip)
                .map_err(|e| ClientError::InvalidHeader(e.to_string()))?,
        );

        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            http,
            directory_url: config.directory_url.clone(),
            directory: OnceCell::new(),
            challenge_rpc_url: config.challenge.rpc_url(),
            nonces,
            latency,
        })
    }

    /// The shared nonce pool.
    pub fn nonces(&self) -> &Arc<NoncePool> {
        &self.nonces
    }

    /// Fetch the directory, once.
    pub async fn directory(&self) -> Result<&Directory, ClientError> {
        self.directory
            .get_or_try_init(|| async {
                let reply = self
                    .send(endpoint::DIRECTORY, self.http.get(&self.directory_url))
                    .await?;
                reply.json::<Directory>()
            })
            .await
    }

    /// Register a new account for `signer` and bind the signer to it.
    pub async fn new_account(&self, signer: &AccountSigner) -> Result<String, ClientError> {
        let url = self.directory().await?.new_account.clone();
        let request = NewAccountRequest {
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let reply = self
            .post_jws(endpoint::NEW_ACCOUNT, &url, signer, Some(&request), KeyBinding::Jwk)
            .await?;
        let account_url = reply.location()?;
        signer.set_account_url(account_url.clone());
        Ok(account_url)
    }

    /// Look up the existing account for `signer` and bind the signer to it.
    pub async fn find_account(&self, signer: &AccountSigner) -> Result<String, ClientError> {
        let url = self.directory().await?.new_account.clone();
        let request = NewAccountRequest {
            terms_of_service_agreed: false,
            only_return_existing: true,
        };
        let reply = self
            .post_jws(endpoint::FIND_ACCOUNT, &url, signer, Some(&request), KeyBinding::Jwk)
            .await?;
        let account_url = reply.location()?;
        signer.set_account_url(account_url.clone());
        Ok(account_url)
    }

    /// Create a pre-authorization for a DNS name.
    pub async fn new_authz(
        &self,
        signer: &AccountSigner,
        domain: &str,
    ) -> Result<(String, AuthorizationResource), ClientError> {
        let url = self
            .directory()
            .await?
            .new_authz
            .clone()
            .ok_or(ClientError::NoNewAuthz)?;
        let request = NewAuthzRequest {
            identifier: Identifier::dns(domain),
        };
        let reply = self
            .post_jws(endpoint::NEW_AUTHZ, &url, signer, Some(&request), KeyBinding::Kid)
            .await?;
        Ok((reply.location()?, reply.json()?))
    }

    /// Fetch an authorization.
    pub async fn get_authz(
        &self,
        signer: &AccountSigner,
        url: &str,
    ) -> Result<AuthorizationResource, ClientError> {
        self.post_as_get(endpoint::AUTHZ, url, signer).await?.json()
    }

    /// Tell the service a challenge is ready for validation.
    pub async fn respond_challenge(
        &self,
        signer: &AccountSigner,
        url: &str,
    ) -> Result<Challenge, ClientError> {
        let reply = self
            .post_jws(
                endpoint::CHALLENGE,
                url,
                signer,
                Some(&serde_json::json!({})),
                KeyBinding::Kid,
            )
            .await?;
        reply.json()
    }

    /// Place an order for a set of DNS names.
    pub async fn new_order(
        &self,
        signer: &AccountSigner,
        domains: &[String],
    ) -> Result<(String, OrderResource), ClientError> {
        let url = self.directory().await?.new_order.clone();
        let request = NewOrderRequest {
            identifiers: domains.iter().map(Identifier::dns).collect(),
        };
        let reply = self
            .post_jws(endpoint::NEW_ORDER, &url, signer, Some(&request), KeyBinding::Kid)
            .await?;
        Ok((reply.location()?, reply.json()?))
    }

    /// Submit a DER encoded CSR to an order's finalize URL.
    pub async fn finalize(
        &self,
        signer: &AccountSigner,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderResource, ClientError> {
        let request = FinalizeRequest {
            csr: URL_SAFE_NO_PAD.encode(csr_der),
        };
        self.post_jws(endpoint::FINALIZE, finalize_url, signer, Some(&request), KeyBinding::Kid)
            .await?
            .json()
    }

    /// Fetch an order.
    pub async fn get_order(
        &self,
        signer: &AccountSigner,
        url: &str,
    ) -> Result<OrderResource, ClientError> {
        self.post_as_get(endpoint::ORDER, url, signer).await?.json()
    }

    /// Download a certificate and return the DER of the leaf.
    pub async fn download_certificate(
        &self,
        signer: &AccountSigner,
        url: &str,
    ) -> Result<Vec<u8>, ClientError> {
        let reply = self.post_as_get(endpoint::CERT, url, signer).await?;
        let pem = String::from_utf8_lossy(&reply.body);
        first_pem_certificate(&pem)
    }

    /// Revoke a DER encoded certificate.
    pub async fn revoke_certificate(
        &self,
        signer: &AccountSigner,
        cert_der: &[u8],
    ) -> Result<(), ClientError> {
        let url = self.directory().await?.revoke_cert.clone();
        let request = RevokeRequest {
            certificate: URL_SAFE_NO_PAD.encode(cert_der),
        };
        self.post_jws(endpoint::REVOKE, &url, signer, Some(&request), KeyBinding::Kid)
            .await?;
        Ok(())
    }

    /// Register an HTTP-01 response with the challenge responder.
    pub async fn register_http01(&self, token: &str, content: &str) -> Result<(), ClientError> {
        let registration = Http01Registration {
            token: token.to_string(),
            content: content.to_string(),
        };
        let request = self
            .http
            .post(format!("{}/add-http01", self.challenge_rpc_url))
            .json(&registration);
        self.send(endpoint::ADD_HTTP01, request).await?;
        Ok(())
    }

    async fn post_as_get(
        &self,
        label: &str,
        url: &str,
        signer: &AccountSigner,
    ) -> Result<Reply, ClientError> {
        self.post_jws::<()>(label, url, signer, None, KeyBinding::Kid)
            .await
    }

    /// Sign `payload` with a pooled nonce and POST it.
    async fn post_jws<T: Serialize>(
        &self,
        label: &str,
        url: &str,
        signer: &AccountSigner,
        payload: Option<&T>,
        binding: KeyBinding,
    ) -> Result<Reply, ClientError> {
        let payload = payload.map(serde_json::to_vec).transpose()?;
        let nonce = self.nonces.take(self).await?;
        let body = signer.sign(url, nonce, payload.as_deref(), binding)?;

        let request = self
            .http
            .request(Method::POST, url)
            .header(CONTENT_TYPE, JOSE_JSON)
            .header(ACCEPT, format!("application/json, {}", PEM_CHAIN))
            .json(&body);
        self.send(label, request).await
    }

    /// Send a request, harvest its nonce, and record its latency.
    async fn send(
        &self,
        label: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Reply, ClientError> {
        let sent = SystemTime::now();
        let result = self.exchange(request).await;
        let outcome = if result.is_ok() {
            CallOutcome::Good
        } else {
            CallOutcome::Error
        };
        self.latency.add(label, sent, SystemTime::now(), outcome);
        result
    }

    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<Reply, ClientError> {
        let response = request.send().await?;
        if let Some(nonce) = replay_nonce(response.headers()) {
            self.nonces.add(nonce);
        }

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        if !status.is_success() {
            let problem = serde_json::from_slice(&body).unwrap_or_else(|_| Problem {
                kind: String::new(),
                detail: String::from_utf8_lossy(&body).into_owned(),
            });
            return Err(ClientError::Status { status, problem });
        }

        Ok(Reply { location, body })
    }
}

#[async_trait]
impl NonceProbe for AcmeClient {
    /// `HEAD` the directory and take the nonce from the response.
    ///
    /// The nonce is returned directly rather than pooled.
    async fn probe_nonce(&self) -> Result<String, ClientError> {
        let sent = SystemTime::now();
        let result = async {
            let response = self.http.head(&self.directory_url).send().await?;
            replay_nonce(response.headers()).ok_or(ClientError::MissingNonce)
        }
        .await;
        let outcome = if result.is_ok() {
            CallOutcome::Good
        } else {
            CallOutcome::Error
        };
        self.latency
            .add(endpoint::NONCE_PROBE, sent, SystemTime::now(), outcome);
        result
    }
}

fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Decode the first certificate of a PEM chain.
pub fn first_pem_certificate(pem: &str) -> Result<Vec<u8>, ClientError> {
    let cert = CertificateDer::pem_slice_iter(pem.as_bytes())
        .next()
        .ok_or_else(|| ClientError::Pem("no certificate block".to_string()))?
        .map_err(|e| ClientError::Pem(e.to_string()))?;
    Ok(cert.to_vec())
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {} {}", .problem.kind, .problem.detail)]
    Status { status: StatusCode, problem: Problem },

    #[error("Response carried no Replay-Nonce header")]
    MissingNonce,

    #[error("Response carried no Location header")]
    MissingLocation,

    #[error("Directory has no newAuthz endpoint")]
    NoNewAuthz,

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signing error: {0}")]
    Signer(#[from] SignerError),
}
