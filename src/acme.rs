//! ACME session adapter
//!
//! Wraps an `instant_acme` account behind single-call operations. Polling of the remote
//! authority happens inside the calls and is bounded except for challenge validation, whose
//! duration is left to the caller's batch policy.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tracing::{debug, info, warn};

use crate::certificate::IssuedCertificate;
use crate::resource::RenewalConfig;
use crate::Error;

const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(10);
const ORDER_POLL_ATTEMPTS: u32 = 6;

/// Opaque, session-scoped reference to an ACME order
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OrderHandle(uuid::Uuid);

impl OrderHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// DNS-01 challenge of one order, `digest` is the TXT record value
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dns01Challenge {
    pub order: OrderHandle,
    pub domain: String,
    pub url: String,
    pub digest: String,
}

pub struct Login {
    pub session: Arc<dyn AcmeSession>,
    /// Set when a new account was registered, the caller persists it into the config
    pub new_credentials: Option<String>,
}

#[async_trait::async_trait]
pub trait AcmeConnector: Send + Sync {
    /// Reuses the account of `config` or registers one
    async fn login(&self, config: &RenewalConfig) -> Result<Login, Error>;
}

#[async_trait::async_trait]
pub trait AcmeSession: Send + Sync {
    /// New order for `domain` and its DNS-01 challenge
    async fn challenge_init(&self, domain: &str) -> Result<(OrderHandle, Dns01Challenge), Error>;

    /// Ask for validation and wait until the authority decides
    async fn challenge_complete(&self, challenge: &Dns01Challenge) -> Result<(), Error>;

    /// Finalize with the DER `csr`, wait for issuance and download the chain
    async fn request_certificate(
        &self,
        order: &OrderHandle,
        domain: &str,
        csr: &[u8],
    ) -> Result<IssuedCertificate, Error>;
}

#[derive(Debug, Default)]
pub struct InstantAcmeConnector;

#[async_trait::async_trait]
impl AcmeConnector for InstantAcmeConnector {
    async fn login(&self, config: &RenewalConfig) -> Result<Login, Error> {
        let (account, new_credentials) = match config.account_credentials.as_deref() {
            Some(creds_json) if !creds_json.is_empty() => {
                let credentials = serde_json::from_str::<AccountCredentials>(creds_json)?;
                let account = Account::from_credentials(credentials).await?;
                debug!(config = %config.name, "Logged in with stored account");
                (account, None)
            }
            _ => {
                info!(
                    config = %config.name,
                    directory = %config.directory_url(),
                    "Registering account"
                );
                let contact = format!("mailto:{}", config.contact_email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[contact.as_str()],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    config.directory_url(),
                    None,
                )
                .await?;
                (account, Some(serde_json::to_string(&credentials)?))
            }
        };

        Ok(Login {
            session: Arc::new(InstantAcmeSession::new(account)),
            new_credentials,
        })
    }
}

pub struct InstantAcmeSession {
    account: Account,
    orders: tokio::sync::Mutex<HashMap<OrderHandle, Order>>,
}

impl InstantAcmeSession {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            orders: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

}

/// Remote state that is fetched again on every call
#[async_trait::async_trait]
trait StatusSource: Send {
    type Status: Send;

    async fn status(&mut self) -> Result<Self::Status, Error>;
}

/// Authorization owning one challenge URL
struct AuthorizationOf<'a> {
    order: &'a mut Order,
    challenge_url: &'a str,
}

#[async_trait::async_trait]
impl<'a> StatusSource for AuthorizationOf<'a> {
    type Status = AuthorizationStatus;

    async fn status(&mut self) -> Result<AuthorizationStatus, Error> {
        let challenge_url = self.challenge_url;
        self.order
            .authorizations()
            .await?
            .into_iter()
            .find(|auth| auth.challenges.iter().any(|c| c.url == challenge_url))
            .map(|auth| auth.status)
            .ok_or_else(|| Error::Protocol(format!("No authorization holds {}", challenge_url)))
    }
}

struct Refreshed<'a>(&'a mut Order);

#[async_trait::async_trait]
impl<'a> StatusSource for Refreshed<'a> {
    type Status = OrderStatus;

    async fn status(&mut self) -> Result<OrderStatus, Error> {
        Ok(self.0.refresh().await?.status)
    }
}

/// First DNS-01 challenge, or what was offered instead
fn select_dns01<T>(
    domain: &str,
    challenges: impl IntoIterator<Item = (ChallengeType, T)>,
) -> Result<T, Error> {
    let mut offered = Vec::new();
    for (kind, challenge) in challenges {
        if kind == ChallengeType::Dns01 {
            return Ok(challenge);
        }
        offered.push(format!("{:?}", kind));
    }
    Err(Error::ChallengeUnavailable {
        domain: domain.to_string(),
        offered: offered.join(", "),
    })
}

/// Polls until the authorization leaves `Pending`, only `Valid` passes
async fn await_authorization<S>(domain: &str, source: &mut S) -> Result<(), Error>
where
    S: StatusSource<Status = AuthorizationStatus>,
{
    loop {
        tokio::time::sleep(CHALLENGE_POLL_INTERVAL).await;
        let status = source.status().await?;
        debug!(domain = %domain, status = ?status, "Current status");
        match status {
            AuthorizationStatus::Valid => return Ok(()),
            AuthorizationStatus::Pending => continue,
            other => {
                return Err(Error::ChallengeFailed {
                    domain: domain.to_string(),
                    reason: format!("authorization is {:?}", other),
                })
            }
        }
    }
}

/// Refreshes the order `interval` apart until `reached` holds, at most `attempts` times
async fn await_order<S>(
    domain: &str,
    source: &mut S,
    current: OrderStatus,
    reached: impl Fn(&OrderStatus) -> bool + Send,
    interval: Duration,
    attempts: u32,
) -> Result<OrderStatus, Error>
where
    S: StatusSource<Status = OrderStatus>,
{
    let mut status = current;
    let mut polls = 0;
    loop {
        if reached(&status) {
            return Ok(status);
        }
        if matches!(status, OrderStatus::Invalid) {
            return Err(Error::OrderFailed {
                domain: domain.to_string(),
            });
        }
        if polls == attempts {
            warn!(domain = %domain, status = ?status, "Order did not move on");
            return Err(Error::OrderTimeout {
                domain: domain.to_string(),
                status: format!("{:?}", status),
            });
        }

        tokio::time::sleep(interval).await;
        status = source.status().await?;
        polls += 1;
        debug!(domain = %domain, attempt = polls, status = ?status, "Current order status");
    }
}

#[async_trait::async_trait]
impl AcmeSession for InstantAcmeSession {
    async fn challenge_init(&self, domain: &str) -> Result<(OrderHandle, Dns01Challenge), Error> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| Error::Protocol(format!("Could not ask for domain {}: {}", domain, e)))?;

        let authorizations = order.authorizations().await?;

        let challenge = select_dns01(
            domain,
            authorizations
                .iter()
                .flat_map(|auth| auth.challenges.iter())
                .map(|c| (c.r#type.clone(), c)),
        )?;
        let url = challenge.url.clone();
        let digest = order.key_authorization(challenge).dns_value();

        let handle = OrderHandle::generate();
        self.orders.lock().await.insert(handle, order);

        Ok((
            handle,
            Dns01Challenge {
                order: handle,
                domain: domain.to_string(),
                url,
                digest,
            },
        ))
    }

    async fn challenge_complete(&self, challenge: &Dns01Challenge) -> Result<(), Error> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&challenge.order)
            .ok_or_else(|| Error::UnknownOrder(challenge.order.to_string()))?;

        // A recent validation of the same account may still hold
        let status = AuthorizationOf {
            order: &mut *order,
            challenge_url: &challenge.url,
        }
        .status()
        .await?;
        if let AuthorizationStatus::Valid = status {
            debug!(domain = %challenge.domain, "Authorization already valid");
            return Ok(());
        }

        info!(domain = %challenge.domain, "Triggering the challenge");
        order.set_challenge_ready(&challenge.url).await?;

        await_authorization(
            &challenge.domain,
            &mut AuthorizationOf {
                order,
                challenge_url: &challenge.url,
            },
        )
        .await
    }

    async fn request_certificate(
        &self,
        order: &OrderHandle,
        domain: &str,
        csr: &[u8],
    ) -> Result<IssuedCertificate, Error> {
        let mut order = self
            .orders
            .lock()
            .await
            .remove(order)
            .ok_or_else(|| Error::UnknownOrder(order.to_string()))?;

        // Validation may still be settling on the authority's side
        let current = order.state().status;
        let status = await_order(
            domain,
            &mut Refreshed(&mut order),
            current,
            |status| {
                matches!(
                    status,
                    OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid
                )
            },
            CHALLENGE_POLL_INTERVAL,
            ORDER_POLL_ATTEMPTS,
        )
        .await?;
        if let OrderStatus::Ready = status {
            order.finalize(csr).await?;
        }

        let current = order.state().status;
        await_order(
            domain,
            &mut Refreshed(&mut order),
            current,
            |status| matches!(status, OrderStatus::Valid),
            ORDER_POLL_INTERVAL,
            ORDER_POLL_ATTEMPTS,
        )
        .await?;

        let crt_pem_str = order.certificate().await?.ok_or_else(|| {
            Error::Protocol(format!("Order for {} is valid but has no certificate", domain))
        })?;
        IssuedCertificate::from_pem_chain(&crt_pem_str)
    }
}
