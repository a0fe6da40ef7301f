//! Protocol actions against a live ACME service.

use super::{ActionError, ActionKind, ActionOutcome, ActionSelector, SelectionContext, Workload};
use crate::actors::{Actor, ActorStore, Authorization};
use crate::client::jws::AccountSigner;
use crate::client::{status, AcmeClient, AuthorizationResource, ClientError, OrderResource};
use crate::config::LoadgenConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Drives simulated accounts through the ACME lifecycle.
pub struct AcmeWorkload {
    client: Arc<AcmeClient>,
    actors: Arc<ActorStore>,
    selector: ActionSelector,
    rng: Mutex<ChaCha8Rng>,
    /// Key every CSR is generated over.
    cert_key: rcgen::KeyPair,
    domain_base: String,
    authz_poll_attempts: u32,
    authz_poll_interval: Duration,
    order_poll_attempts: u32,
}

impl AcmeWorkload {
    /// Create a workload over a shared client and actor store.
    pub fn new(
        config: &LoadgenConfig,
        client: Arc<AcmeClient>,
        actors: Arc<ActorStore>,
    ) -> Result<Self, ActionError> {
        let seed = config.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        });
        let cert_key = rcgen::KeyPair::generate().map_err(|e| ActionError::Csr(e.to_string()))?;

        Ok(Self {
            client,
            actors,
            selector: ActionSelector::new(config.weights),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            cert_key,
            domain_base: config.domain_base.clone(),
            authz_poll_attempts: config.authz_poll_attempts,
            authz_poll_interval: config.authz_poll_interval(),
            order_poll_attempts: config.order_poll_attempts,
        })
    }

    /// The actor store this workload populates.
    pub fn actors(&self) -> &Arc<ActorStore> {
        &self.actors
    }

    /// Pick an action and the actor it applies to.
    fn choose(&self) -> Option<(ActionKind, Option<Arc<Actor>>)> {
        let mut rng = self.rng.lock();
        let actor = self.actors.random(&mut *rng);
        let ctx = SelectionContext {
            can_create: self.actors.has_capacity(),
            actor: actor.as_ref().map(|a| a.counts()),
        };
        let kind = self.selector.select(&ctx, &mut *rng)?;
        Some((kind, actor))
    }

    fn random_domain(&self) -> String {
        let label: [u8; 8] = self.rng.lock().gen();
        format!("{}.{}", hex::encode(label), self.domain_base)
    }

    async fn new_actor(&self) -> Result<bool, ActionError> {
        if !self.actors.has_capacity() {
            return Ok(false);
        }
        let signer = AccountSigner::generate();
        let account_url = self.client.new_account(&signer).await?;
        match self.actors.try_insert(Actor::new(signer)) {
            Ok(_) => {
                debug!(account = %account_url, "Created actor");
                Ok(true)
            }
            // Lost the race for the last slot. The account exists server-side
            // but is not tracked.
            Err(_) => Ok(false),
        }
    }

    /// Restored actors carry no account URL until they are looked up.
    async fn ensure_account(&self, actor: &Actor) -> Result<(), ActionError> {
        if actor.signer().account_url().is_none() {
            self.client.find_account(actor.signer()).await?;
        }
        Ok(())
    }

    async fn new_authorization(&self, actor: &Actor) -> Result<(), ActionError> {
        self.ensure_account(actor).await?;
        let signer = actor.signer();
        let domain = self.random_domain();

        let (url, authz) = match self.client.new_authz(signer, &domain).await {
            Err(ClientError::NoNewAuthz) => self.authz_from_order(signer, &domain).await?,
            result => result?,
        };
        if authz.status != status::VALID {
            let challenge = authz
                .http01()
                .ok_or_else(|| ActionError::NoHttp01Challenge(domain.clone()))?
                .clone();
            let key_authorization = signer.key_authorization(&challenge.token);
            self.client
                .register_http01(&challenge.token, &key_authorization)
                .await?;
            self.client.respond_challenge(signer, &challenge.url).await?;
            self.poll_authz(signer, &url).await?;
        }

        actor.add_authorization(Authorization { url, domain });
        Ok(())
    }

    /// Without pre-authorization, an order for the name creates the
    /// authorization. The order itself is abandoned.
    async fn authz_from_order(
        &self,
        signer: &AccountSigner,
        domain: &str,
    ) -> Result<(String, AuthorizationResource), ActionError> {
        let (order_url, order) = self.client.new_order(signer, &[domain.to_string()]).await?;
        let url = order
            .authorizations
            .first()
            .cloned()
            .ok_or(ActionError::NoAuthorization(order_url))?;
        let authz = self.client.get_authz(signer, &url).await?;
        Ok((url, authz))
    }

    async fn poll_authz(&self, signer: &AccountSigner, url: &str) -> Result<(), ActionError> {
        let mut last = String::new();
        for _ in 0..self.authz_poll_attempts {
            tokio::time::sleep(self.authz_poll_interval).await;
            let authz = self.client.get_authz(signer, url).await?;
            match authz.status.as_str() {
                status::VALID => return Ok(()),
                status::INVALID => return Err(ActionError::Invalid("authorization", url.to_string())),
                _ => last = authz.status,
            }
        }
        Err(ActionError::PollExhausted {
            resource: "authorization",
            expected: status::VALID,
            attempts: self.authz_poll_attempts,
            status: last,
        })
    }

    async fn new_certificate(&self, actor: &Actor) -> Result<(), ActionError> {
        self.ensure_account(actor).await?;
        let signer = actor.signer();
        let domains = {
            let mut rng = self.rng.lock();
            actor.random_domains(&mut *rng)
        };
        if domains.is_empty() {
            return Err(ActionError::NothingToDo);
        }

        let (order_url, order) = self.client.new_order(signer, &domains).await?;
        let order = self
            .poll_order(signer, &order_url, order, status::READY)
            .await?;

        let csr = self.build_csr(&domains)?;
        let order = self.client.finalize(signer, &order.finalize, &csr).await?;
        let order = self
            .poll_order(signer, &order_url, order, status::VALID)
            .await?;

        let certificate = order.certificate.ok_or(ActionError::NoCertificate)?;
        actor.add_certificate(certificate);
        Ok(())
    }

    /// Poll until the order reaches `target`. A `valid` order also satisfies
    /// a `ready` target.
    async fn poll_order(
        &self,
        signer: &AccountSigner,
        url: &str,
        mut order: OrderResource,
        target: &'static str,
    ) -> Result<OrderResource, ActionError> {
        for attempt in 0..=self.order_poll_attempts {
            if order.status == target || order.status == status::VALID {
                return Ok(order);
            }
            if order.status == status::INVALID {
                return Err(ActionError::Invalid("order", url.to_string()));
            }
            if attempt == self.order_poll_attempts {
                break;
            }
            tokio::time::sleep(self.authz_poll_interval).await;
            order = self.client.get_order(signer, url).await?;
        }
        Err(ActionError::PollExhausted {
            resource: "order",
            expected: target,
            attempts: self.order_poll_attempts,
            status: order.status,
        })
    }

    fn build_csr(&self, domains: &[String]) -> Result<Vec<u8>, ActionError> {
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| ActionError::Csr(e.to_string()))?;
        let csr = params
            .serialize_request(&self.cert_key)
            .map_err(|e| ActionError::Csr(e.to_string()))?;
        Ok(csr.der().to_vec())
    }

    async fn revoke_certificate(&self, actor: &Actor) -> Result<(), ActionError> {
        self.ensure_account(actor).await?;
        let signer = actor.signer();
        let url = {
            let mut rng = self.rng.lock();
            actor.random_certificate(&mut *rng)
        }
        .ok_or(ActionError::NothingToDo)?;

        let der = self.client.download_certificate(signer, &url).await?;
        self.client.revoke_certificate(signer, &der).await?;
        actor.remove_certificate(&url);
        Ok(())
    }

    async fn run(&self, kind: ActionKind, actor: Option<Arc<Actor>>) -> Result<(), ActionError> {
        match (kind, actor) {
            (ActionKind::NewActor, _) => self.new_actor().await.map(|_| ()),
            (_, None) => Err(ActionError::NothingToDo),
            (ActionKind::NewAuthorization, Some(actor)) => self.new_authorization(&actor).await,
            (ActionKind::NewCertificate, Some(actor)) => self.new_certificate(&actor).await,
            (ActionKind::RevokeCertificate, Some(actor)) => self.revoke_certificate(&actor).await,
        }
    }
}

#[async_trait]
impl Workload for AcmeWorkload {
    fn population(&self) -> usize {
        self.actors.len()
    }

    async fn create_actor(&self) -> Result<bool, ActionError> {
        self.new_actor().await
    }

    async fn execute_one(&self) -> ActionOutcome {
        let Some((kind, actor)) = self.choose() else {
            return ActionOutcome::Idle;
        };
        match self.run(kind, actor).await {
            Ok(()) => ActionOutcome::Completed(kind),
            Err(e) => ActionOutcome::Failed(kind, e),
        }
    }
}
