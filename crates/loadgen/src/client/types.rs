//! Wire types for ACME requests and responses.

use serde::{Deserialize, Serialize};

/// Directory resource listing the service's endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_account: String,
    pub new_order: String,
    /// Pre-authorization endpoint. Optional in the protocol; without it,
    /// authorizations are obtained through orders.
    #[serde(default)]
    pub new_authz: Option<String>,
    pub revoke_cert: String,
}

/// An identifier to be authorized or certified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    /// A DNS identifier.
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// Request body for `newAccount`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountRequest {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terms_of_service_agreed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
}

/// Request body for `newAuthz`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewAuthzRequest {
    pub identifier: Identifier,
}

/// Request body for `newOrder`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
}

/// Request body for an order's finalize URL.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeRequest {
    /// base64url DER CSR.
    pub csr: String,
}

/// Request body for `revokeCert`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeRequest {
    /// base64url DER certificate.
    pub certificate: String,
}

/// A challenge within an authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub status: String,
}

/// Authorization resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResource {
    pub status: String,
    pub identifier: Identifier,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

impl AuthorizationResource {
    /// The HTTP-01 challenge, if offered.
    pub fn http01(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == "http-01")
    }
}

/// Order resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResource {
    pub status: String,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// RFC 7807 problem document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
}

/// Token registration sent to the challenge responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http01Registration {
    pub token: String,
    #[serde(default)]
    pub content: String,
}

/// Resource status values the engine reacts to.
pub mod status {
    pub const READY: &str = "ready";
    pub const VALID: &str = "valid";
    pub const INVALID: &str = "invalid";
}
