//! Protocol actions executed against the service under test.
//!
//! Provides the [`Workload`] trait the runner dispatches through, the
//! [`ActionSelector`] that picks the next action, and [`AcmeWorkload`], the
//! implementation that talks to a live ACME service.

mod acme;
mod selector;

pub use acme::AcmeWorkload;
pub use selector::{ActionSelector, SelectionContext};

use crate::client::ClientError;
use async_trait::async_trait;
use std::fmt;

/// The protocol actions a simulated account can take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    NewActor,
    NewAuthorization,
    NewCertificate,
    RevokeCertificate,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::NewActor,
        ActionKind::NewAuthorization,
        ActionKind::NewCertificate,
        ActionKind::RevokeCertificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::NewActor => "new-actor",
            ActionKind::NewAuthorization => "new-authorization",
            ActionKind::NewCertificate => "new-certificate",
            ActionKind::RevokeCertificate => "revoke-certificate",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened on one dispatch tick.
#[derive(Debug)]
pub enum ActionOutcome {
    /// No action was eligible.
    Idle,
    /// The action ran to completion.
    Completed(ActionKind),
    /// The action failed. Only this attempt is affected.
    Failed(ActionKind, ActionError),
}

/// The unit of work the runner dispatches.
///
/// Implementations own all per-run state (accounts, nonces, clients). The
/// runner only decides when to call them.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Current actor population.
    fn population(&self) -> usize;

    /// Create one actor unconditionally (warmup).
    ///
    /// Returns `Ok(false)` if the population cap was reached.
    async fn create_actor(&self) -> Result<bool, ActionError>;

    /// Select and execute one weighted action.
    async fn execute_one(&self) -> ActionOutcome;
}

/// Errors from a single protocol action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("No http-01 challenge offered for {0}")]
    NoHttp01Challenge(String),

    #[error("{resource} not {expected} after {attempts} polls (last status: {status})")]
    PollExhausted {
        resource: &'static str,
        expected: &'static str,
        attempts: u32,
        status: String,
    },

    #[error("{0} {1} became invalid")]
    Invalid(&'static str, String),

    #[error("Order {0} lists no authorizations")]
    NoAuthorization(String),

    #[error("Order is valid but has no certificate URL")]
    NoCertificate,

    #[error("Failed to build CSR: {0}")]
    Csr(String),

    #[error("Actor has nothing to act on")]
    NothingToDo,
}
