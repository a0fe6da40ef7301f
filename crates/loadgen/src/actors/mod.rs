//! Simulated ACME accounts ("actors") and the store that holds them.
//!
//! # Locking
//!
//! Two lock levels exist: the store's population lock and each actor's own
//! list lock. The acquisition order is fixed: store lock first, actor lock
//! second, never the reverse. Hot paths go further and release the store lock
//! before touching an actor at all: [`ActorStore::random`] clones the actor's
//! `Arc` out from under the store lock, and callers then lock the actor.
//! Only whole-population reads ([`ActorStore::snapshot`],
//! [`ActorStore::totals`]) hold both at once, in the permitted order.
//!
//! Neither lock is ever held across an `.await`.

mod snapshot;

pub use snapshot::{RestoreSummary, SnapshotError};

use crate::client::jws::AccountSigner;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

/// An authorization the actor holds for a domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    /// Authorization resource URL.
    pub url: String,
    /// Authorized DNS name.
    pub domain: String,
}

#[derive(Default)]
struct ActorLists {
    authorizations: Vec<Authorization>,
    certificates: Vec<String>,
}

/// A simulated account: a signing key plus the artifacts it has obtained.
pub struct Actor {
    signer: AccountSigner,
    lists: RwLock<ActorLists>,
}

impl Actor {
    /// Create an actor with no authorizations or certificates.
    pub fn new(signer: AccountSigner) -> Self {
        Self::with_certificates(signer, Vec::new())
    }

    /// Create an actor that already holds certificates (restored state).
    pub fn with_certificates(signer: AccountSigner, certificates: Vec<String>) -> Self {
        Self {
            signer,
            lists: RwLock::new(ActorLists {
                authorizations: Vec::new(),
                certificates,
            }),
        }
    }

    /// The actor's signing identity.
    pub fn signer(&self) -> &AccountSigner {
        &self.signer
    }

    pub fn authorization_count(&self) -> usize {
        self.lists.read().authorizations.len()
    }

    pub fn certificate_count(&self) -> usize {
        self.lists.read().certificates.len()
    }

    /// Both list lengths under a single lock acquisition.
    pub fn counts(&self) -> (usize, usize) {
        let lists = self.lists.read();
        (lists.authorizations.len(), lists.certificates.len())
    }

    pub fn add_authorization(&self, authorization: Authorization) {
        self.lists.write().authorizations.push(authorization);
    }

    pub fn add_certificate(&self, url: String) {
        self.lists.write().certificates.push(url);
    }

    /// Remove a certificate. Returns false if it was not present.
    pub fn remove_certificate(&self, url: &str) -> bool {
        let mut lists = self.lists.write();
        match lists.certificates.iter().position(|c| c == url) {
            Some(idx) => {
                lists.certificates.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Copy of the authorization list.
    pub fn authorizations(&self) -> Vec<Authorization> {
        self.lists.read().authorizations.clone()
    }

    /// Copy of the certificate list.
    pub fn certificates(&self) -> Vec<String> {
        self.lists.read().certificates.clone()
    }

    /// Pick a random certificate URL.
    pub fn random_certificate(&self, rng: &mut (impl Rng + ?Sized)) -> Option<String> {
        self.lists.read().certificates.choose(rng).cloned()
    }

    /// Pick between one and all of the authorized domains, without repeats.
    pub fn random_domains(&self, rng: &mut (impl Rng + ?Sized)) -> Vec<String> {
        let lists = self.lists.read();
        if lists.authorizations.is_empty() {
            return Vec::new();
        }
        let mut domains: Vec<String> = lists
            .authorizations
            .iter()
            .map(|a| a.domain.clone())
            .collect();
        drop(lists);

        domains.sort();
        domains.dedup();
        let count = rng.gen_range(1..=domains.len());
        domains.shuffle(rng);
        domains.truncate(count);
        domains
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (authorizations, certificates) = self.counts();
        f.debug_struct("Actor")
            .field("signer", &self.signer)
            .field("authorizations", &authorizations)
            .field("certificates", &certificates)
            .finish()
    }
}

/// Append-only collection of actors with an optional population cap.
pub struct ActorStore {
    actors: RwLock<Vec<Arc<Actor>>>,
    /// 0 = unbounded.
    max_actors: usize,
}

impl ActorStore {
    /// Create an empty store.
    pub fn new(max_actors: usize) -> Self {
        Self {
            actors: RwLock::new(Vec::new()),
            max_actors,
        }
    }

    /// Population cap (0 = unbounded).
    pub fn max_actors(&self) -> usize {
        self.max_actors
    }

    /// Current population.
    pub fn len(&self) -> usize {
        self.actors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.read().is_empty()
    }

    /// Whether another actor may be added.
    pub fn has_capacity(&self) -> bool {
        self.max_actors == 0 || self.len() < self.max_actors
    }

    /// Add an actor unless the store is at its cap.
    ///
    /// The cap check and the append happen under one write lock, so concurrent
    /// inserts can never push the population past the cap. On rejection the
    /// actor is handed back.
    pub fn try_insert(&self, actor: Actor) -> Result<Arc<Actor>, Actor> {
        let mut actors = self.actors.write();
        if self.max_actors > 0 && actors.len() >= self.max_actors {
            return Err(actor);
        }
        let actor = Arc::new(actor);
        actors.push(Arc::clone(&actor));
        Ok(actor)
    }

    /// Append without checking the cap (restored state is always kept).
    pub(crate) fn push(&self, actor: Actor) {
        self.actors.write().push(Arc::new(actor));
    }

    /// Uniformly pick an existing actor.
    ///
    /// The store lock is released before returning, so the caller may lock the
    /// actor freely.
    pub fn random(&self, rng: &mut (impl Rng + ?Sized)) -> Option<Arc<Actor>> {
        self.actors.read().choose(rng).cloned()
    }

    /// Actor at a given position.
    pub fn get(&self, idx: usize) -> Option<Arc<Actor>> {
        self.actors.read().get(idx).cloned()
    }

    /// Totals across the population: (actors, authorizations, certificates).
    pub fn totals(&self) -> (usize, usize, usize) {
        let actors = self.actors.read();
        let (authzs, certs) = actors.iter().fold((0, 0), |(a, c), actor| {
            let (na, nc) = actor.counts();
            (a + na, c + nc)
        });
        (actors.len(), authzs, certs)
    }
}
