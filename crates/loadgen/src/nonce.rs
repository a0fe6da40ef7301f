//! Replay-nonce pool.
//!
//! Every signed request consumes one nonce. Responses from the service carry
//! a fresh nonce in the `Replay-Nonce` header, which is fed back into the pool,
//! so under steady load the pool stays warm without dedicated refill requests.
//! When the pool runs dry, `take` falls back to a single probe request.

use crate::client::ClientError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// Something that can fetch a fresh nonce from the service.
#[async_trait]
pub trait NonceProbe: Send + Sync {
    /// Perform one request and return the nonce from its response headers.
    async fn probe_nonce(&self) -> Result<String, ClientError>;
}

/// FIFO store of unused nonces.
#[derive(Default)]
pub struct NoncePool {
    nonces: RwLock<VecDeque<String>>,
}

impl NoncePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a nonce harvested from a response.
    pub fn add(&self, nonce: String) {
        self.nonces.write().push_back(nonce);
    }

    /// Pop the oldest nonce without probing.
    pub fn try_take(&self) -> Option<String> {
        self.nonces.write().pop_front()
    }

    /// Take a nonce, probing the service once if the pool is empty.
    ///
    /// A probed nonce is handed straight to the caller and never enters the
    /// pool, so no nonce is returned twice. Probe failures fail only the
    /// calling action.
    pub async fn take(&self, probe: &dyn NonceProbe) -> Result<String, ClientError> {
        // The write guard is released before the probe is awaited.
        if let Some(nonce) = self.try_take() {
            return Ok(nonce);
        }
        probe.probe_nonce().await
    }

    /// Number of pooled nonces.
    pub fn len(&self) -> usize {
        self.nonces.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.nonces.read().is_empty()
    }
}
