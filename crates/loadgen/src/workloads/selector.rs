//! Weighted choice of the next protocol action.

use super::ActionKind;
use crate::config::ActionWeights;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// What the selector needs to know about the current state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionContext {
    /// The population is below its cap (or uncapped).
    pub can_create: bool,
    /// The picked actor's (authorization, certificate) counts, if one exists.
    pub actor: Option<(usize, usize)>,
}

impl SelectionContext {
    /// Whether `kind` can run at all in this state.
    ///
    /// Authorizations need an actor, certificates need an authorization,
    /// and revocation needs a certificate.
    pub fn is_eligible(&self, kind: ActionKind) -> bool {
        match (kind, self.actor) {
            (ActionKind::NewActor, _) => self.can_create,
            (ActionKind::NewAuthorization, actor) => actor.is_some(),
            (ActionKind::NewCertificate, Some((authorizations, _))) => authorizations > 0,
            (ActionKind::RevokeCertificate, Some((_, certificates))) => certificates > 0,
            (_, None) => false,
        }
    }
}

/// Draws actions from a categorical distribution over the eligible set.
#[derive(Clone, Debug)]
pub struct ActionSelector {
    weights: ActionWeights,
}

impl ActionSelector {
    pub fn new(weights: ActionWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ActionWeights {
        &self.weights
    }

    fn weight(&self, kind: ActionKind) -> u32 {
        match kind {
            ActionKind::NewActor => self.weights.new_actor,
            ActionKind::NewAuthorization => self.weights.new_authorization,
            ActionKind::NewCertificate => self.weights.new_certificate,
            ActionKind::RevokeCertificate => self.weights.revoke_certificate,
        }
    }

    /// Eligible actions with their weights. Zero-weight actions are left out.
    pub fn candidates(&self, ctx: &SelectionContext) -> Vec<(ActionKind, u32)> {
        ActionKind::ALL
            .into_iter()
            .filter(|kind| ctx.is_eligible(*kind))
            .map(|kind| (kind, self.weight(kind)))
            .filter(|(_, w)| *w > 0)
            .collect()
    }

    /// Pick one action, or `None` if nothing is eligible.
    pub fn select(&self, ctx: &SelectionContext, rng: &mut (impl Rng + ?Sized)) -> Option<ActionKind> {
        let candidates = self.candidates(ctx);
        let dist = WeightedIndex::new(candidates.iter().map(|(_, w)| *w)).ok()?;
        Some(candidates[dist.sample(rng)].0)
    }
}
