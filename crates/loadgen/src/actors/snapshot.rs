//! Saving and restoring actor state between runs.
//!
//! File format:
//!
//! ```json
//! {"registrations": [{"certs": ["https://..."], "rawKey": "<base64 PKCS#8 DER>"}]}
//! ```
//!
//! Authorizations are not saved; they are short-lived and not worth replaying.
//! Account URLs are not saved either: a restored signer recovers its URL from
//! the service the first time it is used.

use super::{Actor, ActorStore};
use crate::client::jws::AccountSigner;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActor {
    #[serde(default)]
    certs: Vec<String>,
    #[serde(with = "base64_bytes")]
    raw_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    #[serde(alias = "Registrations")]
    registrations: Vec<RawActor>,
}

/// Serde helper module for base64 encoding/decoding of byte vectors.
mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        ENGINE.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use base64::Engine;
        let s = String::deserialize(deserializer)?;
        ENGINE.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Outcome of a restore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Records turned into actors.
    pub restored: usize,
    /// Records skipped because their key did not parse.
    pub skipped: usize,
}

impl ActorStore {
    /// Write every actor's certificates and key to `path`.
    ///
    /// The document is built fully in memory before the file is touched, so an
    /// encoding failure leaves both the file and the store untouched.
    pub fn snapshot(&self, path: &Path) -> Result<usize, SnapshotError> {
        let snapshot = {
            let actors = self.actors.read();
            let registrations = actors
                .iter()
                .map(|actor| {
                    Ok(RawActor {
                        certs: actor.certificates(),
                        raw_key: actor
                            .signer()
                            .to_pkcs8_der()
                            .map_err(|e| SnapshotError::Encode(e.to_string()))?,
                    })
                })
                .collect::<Result<Vec<_>, SnapshotError>>()?;
            Snapshot { registrations }
        };

        let contents = serde_json::to_vec(&snapshot)?;
        std::fs::write(path, contents)?;

        let count = snapshot.registrations.len();
        info!(path = %path.display(), actors = count, "Saved actor snapshot");
        Ok(count)
    }

    /// Append the actors saved at `path` to this store.
    ///
    /// Records with unparseable keys are skipped, but a document without a
    /// `registrations` list is an error. Existing actors are kept, and
    /// restored actors are added even past the population cap.
    pub fn restore(&self, path: &Path) -> Result<RestoreSummary, SnapshotError> {
        let contents = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&contents)?;

        let mut summary = RestoreSummary::default();
        for (idx, record) in snapshot.registrations.into_iter().enumerate() {
            let signer = match AccountSigner::from_pkcs8_der(&record.raw_key) {
                Ok(signer) => signer,
                Err(e) => {
                    warn!(record = idx, error = %e, "Skipping snapshot record with bad key");
                    summary.skipped += 1;
                    continue;
                }
            };
            self.push(Actor::with_certificates(signer, record.certs));
            summary.restored += 1;
        }

        info!(
            path = %path.display(),
            restored = summary.restored,
            skipped = summary.skipped,
            "Restored actor snapshot"
        );
        Ok(summary)
    }
}

/// Snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode key: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::jws::KeyBinding;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actors.json");

        let store = ActorStore::new(0);
        let original = store
            .try_insert(Actor::new(AccountSigner::generate()))
            .unwrap();
        original.add_certificate("c1".to_string());
        original.add_certificate("c2".to_string());
        original.add_authorization(super::super::Authorization {
            url: "https://ca.test/authz/1".to_string(),
            domain: "a.example.com".to_string(),
        });

        assert_eq!(store.snapshot(&path).unwrap(), 1);

        let fresh = ActorStore::new(0);
        let summary = fresh.restore(&path).unwrap();
        assert_eq!(summary, RestoreSummary { restored: 1, skipped: 0 });
        assert_eq!(fresh.len(), 1);

        let restored = fresh.get(0).unwrap();
        assert_eq!(restored.certificates(), vec!["c1".to_string(), "c2".to_string()]);
        // Authorizations are not persisted.
        assert_eq!(restored.authorization_count(), 0);
        assert!(restored.signer().account_url().is_none());

        // The restored signer produces signatures the original public key accepts.
        let jws = restored
            .signer()
            .sign("https://ca.test/x", "n".to_string(), Some(b"{}"), KeyBinding::Jwk)
            .unwrap();
        assert!(jws.verify(&original.signer().verifying_key()));
    }

    #[test]
    fn test_restore_skips_bad_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actors.json");

        let good = AccountSigner::generate().to_pkcs8_der().unwrap();
        let doc = serde_json::json!({
            "registrations": [
                {"certs": ["x"], "rawKey": "AAEC"},
                {"certs": ["y"], "rawKey": base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD, &good)},
            ]
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let store = ActorStore::new(0);
        let summary = store.restore(&path).unwrap();
        assert_eq!(summary, RestoreSummary { restored: 1, skipped: 1 });
        assert_eq!(store.get(0).unwrap().certificates(), vec!["y".to_string()]);
    }

    #[test]
    fn test_restore_accepts_capitalized_registrations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actors.json");

        let key = AccountSigner::generate().to_pkcs8_der().unwrap();
        let doc = serde_json::json!({
            "Registrations": [
                {"certs": ["c1"], "rawKey": base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD, &key)},
            ]
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let store = ActorStore::new(0);
        let summary = store.restore(&path).unwrap();
        assert_eq!(summary, RestoreSummary { restored: 1, skipped: 0 });
        assert_eq!(store.get(0).unwrap().certificates(), vec!["c1".to_string()]);
    }

    #[test]
    fn test_restore_rejects_unrecognized_document() {
        let dir = TempDir::new().unwrap();
        let store = ActorStore::new(0);

        for (name, contents) in [
            ("misspelled.json", r#"{"registration": [{"certs": [], "rawKey": "AAEC"}]}"#),
            ("empty.json", "{}"),
            ("list.json", "[]"),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            assert!(
                matches!(store.restore(&path), Err(SnapshotError::Json(_))),
                "{} restored without error",
                name
            );
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_restore_is_additive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actors.json");

        let source = ActorStore::new(0);
        for _ in 0..3 {
            let _ = source.try_insert(Actor::new(AccountSigner::generate()));
        }
        source.snapshot(&path).unwrap();

        // Restore ignores the cap and keeps what is already there.
        let target = ActorStore::new(2);
        let _ = target.try_insert(Actor::new(AccountSigner::generate()));
        target.restore(&path).unwrap();
        assert_eq!(target.len(), 4);
    }

    #[test]
    fn test_restore_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = ActorStore::new(0);
        assert!(matches!(
            store.restore(&dir.path().join("missing.json")),
            Err(SnapshotError::Io(_))
        ));
        assert!(store.is_empty());
    }
}
