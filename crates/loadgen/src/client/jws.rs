//! JWS signing for ACME requests.
//!
//! Accounts sign with ECDSA over P-256 (`alg: ES256`). Requests use the
//! flattened JSON serialization with a protected header carrying the replay
//! nonce, the target URL, and either the account's JWK or its account URL
//! (`kid`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::{EncodedPoint, FieldBytes};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use p256::ecdsa::VerifyingKey;

/// JWS algorithm identifier for ECDSA P-256 with SHA-256.
const ALG: &str = "ES256";

/// Public key in JWK form (RFC 7518 EC).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let coordinate = |c: Option<&FieldBytes>| {
            c.map(|c| URL_SAFE_NO_PAD.encode(c)).unwrap_or_default()
        };
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: coordinate(point.x()),
            y: coordinate(point.y()),
        }
    }

    /// RFC 7638 thumbprint, base64url encoded.
    pub fn thumbprint(&self) -> String {
        // Required members only, lexicographic order, no whitespace.
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Recover the verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, SignerError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(SignerError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        let decode = |c: &str| -> Result<Vec<u8>, SignerError> {
            let bytes = URL_SAFE_NO_PAD
                .decode(c)
                .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
            if bytes.len() != 32 {
                return Err(SignerError::InvalidKey(
                    "coordinates must be 32 bytes".to_string(),
                ));
            }
            Ok(bytes)
        };
        let x = decode(&self.x)?;
        let y = decode(&self.y)?;
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&x),
            FieldBytes::from_slice(&y),
            false,
        );
        VerifyingKey::from_encoded_point(&point)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))
    }
}

/// Protected header of a request JWS.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub nonce: String,
    pub url: String,
}

/// Flattened JWS JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl FlattenedJws {
    /// Decode the protected header.
    pub fn header(&self) -> Result<ProtectedHeader, SignerError> {
        let raw = URL_SAFE_NO_PAD
            .decode(&self.protected)
            .map_err(|e| SignerError::Malformed(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(SignerError::Json)
    }

    /// Decode the payload. Empty for POST-as-GET.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, SignerError> {
        URL_SAFE_NO_PAD
            .decode(&self.payload)
            .map_err(|e| SignerError::Malformed(e.to_string()))
    }

    /// Verify the signature against a public key.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(&self.signature) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let signing_input = format!("{}.{}", self.protected, self.payload);
        key.verify(signing_input.as_bytes(), &sig).is_ok()
    }
}

/// Which key identification the protected header carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyBinding {
    /// Embed the public key (account creation and lookup).
    Jwk,
    /// Reference the registered account URL.
    Kid,
}

/// An account's signing identity.
///
/// The account URL is learned from the server after registration (or after
/// looking up an existing account for a restored key), so it sits behind its
/// own lock.
pub struct AccountSigner {
    key: SigningKey,
    account_url: RwLock<Option<String>>,
}

impl AccountSigner {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Wrap an existing signing key.
    pub fn from_signing_key(key: SigningKey) -> Self {
        Self {
            key,
            account_url: RwLock::new(None),
        }
    }

    /// Parse a PKCS#8 DER encoded private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, SignerError> {
        let key =
            SigningKey::from_pkcs8_der(der).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(key))
    }

    /// Encode the private key as PKCS#8 DER.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, SignerError> {
        let doc = self
            .key
            .to_pkcs8_der()
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Public half of the account key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.key)
    }

    /// Public key as a JWK.
    pub fn jwk(&self) -> Jwk {
        Jwk::from_verifying_key(self.key.verifying_key())
    }

    /// Key authorization for a challenge token: `token.thumbprint`.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.jwk().thumbprint())
    }

    /// Registered account URL, if known.
    pub fn account_url(&self) -> Option<String> {
        self.account_url.read().clone()
    }

    /// Bind the signer to a registered account URL.
    pub fn set_account_url(&self, url: impl Into<String>) {
        *self.account_url.write() = Some(url.into());
    }

    /// Sign a request.
    ///
    /// `payload` of `None` produces a POST-as-GET body (empty payload).
    pub fn sign(
        &self,
        url: &str,
        nonce: String,
        payload: Option<&[u8]>,
        binding: KeyBinding,
    ) -> Result<FlattenedJws, SignerError> {
        let (jwk, kid) = match binding {
            KeyBinding::Jwk => (Some(self.jwk()), None),
            KeyBinding::Kid => (None, Some(self.account_url().ok_or(SignerError::NoAccount)?)),
        };
        let header = ProtectedHeader {
            alg: ALG.to_string(),
            jwk,
            kid,
            nonce,
            url: url.to_string(),
        };

        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = payload.map(|p| URL_SAFE_NO_PAD.encode(p)).unwrap_or_default();
        let signing_input = format!("{}.{}", protected, payload);
        let signature: Signature = self.key.sign(signing_input.as_bytes());

        Ok(FlattenedJws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }
}

impl std::fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSigner")
            .field("jwk", &self.jwk())
            .field("account_url", &self.account_url())
            .finish()
    }
}

/// Signing errors.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signer is not bound to an account")]
    NoAccount,

    #[error("Malformed JWS: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
