//! Renewal workflow
//!
//! A batch moves through four steps, each one a separate scheduler invocation:
//!
//! 1. the expiry scan picks certificates close to expiry ([`scanner`])
//! 2. challenges are obtained and published as DNS entries ([`publisher`])
//! 3. a sentinel record is polled until it resolves ([`waiter`])
//! 4. challenges are completed, certificates downloaded and swapped in, DNS entries removed
//!    ([`reconciler`])
//!
//! Batch state lives in the scheduled [`Step`] only. A restart drops in-flight batches, the next
//! scan purges their DNS entries and starts over.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::acme::{AcmeConnector, AcmeSession, Dns01Challenge, OrderHandle};
use crate::alert::{AlertSink, RENEWAL_PROBLEM};
use crate::config::Settings;
use crate::dns::HostResolver;
use crate::resource::{Certificate, DnsEntry, RenewalConfig, ResourceId};
use crate::scheduler::{Scheduler, Step};
use crate::store::{CertificateQuery, ChangeSet, ResourceStore};
use crate::Error;

mod publisher;
mod reconciler;
mod scanner;
mod waiter;

pub use waiter::PropagationState;

/// Challenge obtained for one domain of a batch
#[derive(Clone, Debug)]
pub struct PendingChallenge {
    pub order: OrderHandle,
    pub challenge: Dns01Challenge,
    pub certificate: ResourceId,
}

/// Everything a batch carries from the publisher to the reconciler
pub struct PendingBatch {
    config: RenewalConfig,
    session: Arc<dyn AcmeSession>,
    sentinel: DnsEntry,
    challenges: BTreeMap<String, PendingChallenge>,
    /// Every certificate the batch was started for, including ones without challenge
    certificates: Vec<ResourceId>,
    domains: Vec<String>,
    /// Entries published for the batch, sentinel included
    dns_entries: Vec<ResourceId>,
    state: PropagationState,
}

impl PendingBatch {
    pub fn sentinel(&self) -> &DnsEntry {
        &self.sentinel
    }

    pub fn config(&self) -> &RenewalConfig {
        &self.config
    }

    pub fn state(&self) -> PropagationState {
        self.state
    }

    /// Domains with a pending challenge
    pub fn challenge_domains(&self) -> impl Iterator<Item = &str> {
        self.challenges.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for PendingBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBatch")
            .field("config", &self.config.name)
            .field("sentinel", &self.sentinel.name)
            .field("challenges", &self.challenges.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

/// What running batches hold, guarded against overlapping batches in this process
#[derive(Debug, Default)]
struct InFlight {
    domains: HashSet<String>,
    dns_entries: HashSet<ResourceId>,
}

pub struct Workflow {
    store: Arc<dyn ResourceStore>,
    scheduler: Arc<dyn Scheduler>,
    alerts: Arc<dyn AlertSink>,
    resolver: Arc<dyn HostResolver>,
    connector: Arc<dyn AcmeConnector>,
    settings: Settings,
    in_flight: Mutex<InFlight>,
}

impl Workflow {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        scheduler: Arc<dyn Scheduler>,
        alerts: Arc<dyn AlertSink>,
        resolver: Arc<dyn HostResolver>,
        connector: Arc<dyn AcmeConnector>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            scheduler,
            alerts,
            resolver,
            connector,
            settings,
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /// Single entry point of every scheduled step
    pub async fn run(&self, step: Step) {
        let name = step.name();
        let result = match step {
            Step::Scan => self.scan().await,
            Step::Renew { certificates } => self.renew_certificates(&certificates).await,
            Step::AwaitPropagation(batch) => {
                self.await_propagation(batch).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(step = name, error = %e, "Problem while managing Lets Encrypt");
            self.alerts.error(RENEWAL_PROBLEM, &e.to_string());
        }
    }

    /// Start renewing `certificates` now, one batch
    pub async fn renew_batch(&self, certificates: Vec<Certificate>) -> Result<(), Error> {
        self.publish(certificates).await
    }

    async fn renew_certificates(&self, ids: &[ResourceId]) -> Result<(), Error> {
        let mut certificates = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.certificate(id)? {
                Some(crt) => certificates.push(crt),
                None => warn!(certificate = %id, "Certificate vanished before renewal"),
            }
        }

        if certificates.is_empty() {
            return Ok(());
        }
        self.renew_batch(certificates).await
    }

    /// Puts `domain` under automatic management
    ///
    /// A missing, expired or empty certificate gets a one-day self-signed placeholder and a
    /// renewal is requested right away. A valid managed certificate is returned untouched.
    pub fn manage_domain(&self, domain: &str) -> Result<Certificate, Error> {
        let domain = validate_domain(domain)?;

        let existing = self
            .store
            .certificates(&CertificateQuery::managed().primary_domain(&domain))?
            .into_iter()
            .next();

        let mut changes = ChangeSet::new();
        let certificate = match existing {
            Some(crt) if !crt.certificate_pem.is_empty() && crt.not_after > Utc::now() => {
                info!(domain = %domain, "Domain is already managed");
                return Ok(crt);
            }
            Some(crt) => {
                let mut fresh = crate::certificate::placeholder(&domain)?;
                fresh.id = crt.id;
                changes.replace_certificate(fresh.clone());
                fresh
            }
            None => {
                let fresh = crate::certificate::placeholder(&domain)?;
                changes.add_certificate(fresh.clone());
                fresh
            }
        };
        self.store.apply(changes)?;

        info!(domain = %domain, "Requesting a certificate");
        self.scheduler.schedule_once(
            Step::Renew {
                certificates: vec![certificate.id],
            },
            Duration::ZERO,
        );
        Ok(certificate)
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keeps certificates no other batch works on and marks their domains busy
    fn claim(&self, certificates: Vec<Certificate>) -> Vec<Certificate> {
        let mut in_flight = self.in_flight();
        certificates
            .into_iter()
            .filter(|crt| {
                let Some(domain) = crt.primary_domain() else {
                    warn!(certificate = %crt.id, "Certificate has no domain name, skipping");
                    return false;
                };
                if !in_flight.domains.insert(domain.to_string()) {
                    info!(domain = %domain, "Renewal already in progress, skipping");
                    return false;
                }
                true
            })
            .collect()
    }

    fn track_dns_entries(&self, ids: impl IntoIterator<Item = ResourceId>) {
        self.in_flight().dns_entries.extend(ids);
    }

    fn release<'a>(
        &self,
        domains: impl IntoIterator<Item = &'a String>,
        dns_entries: impl IntoIterator<Item = &'a ResourceId>,
    ) {
        let mut in_flight = self.in_flight();
        for domain in domains {
            in_flight.domains.remove(domain);
        }
        for id in dns_entries {
            in_flight.dns_entries.remove(id);
        }
    }

    fn is_in_flight(&self, dns_entry: &ResourceId) -> bool {
        self.in_flight().dns_entries.contains(dns_entry)
    }
}

/// Lowercased host name, `*.` wildcard prefix allowed
pub(crate) fn validate_domain(domain: &str) -> Result<String, Error> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = normalized.strip_prefix("*.").unwrap_or(&normalized);

    let labels = host.split('.').collect::<Vec<_>>();
    let valid = host.len() <= 253
        && labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(normalized)
    } else {
        Err(Error::InvalidDomain(domain.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation() {
        assert_eq!(validate_domain(" Example.COM. ").unwrap(), "example.com");
        assert_eq!(validate_domain("*.example.com").unwrap(), "*.example.com");
        assert_eq!(validate_domain("a-b.c.example.com").unwrap(), "a-b.c.example.com");

        for bad in ["", "localhost", "-a.example.com", "a..example.com", "exa mple.com", "*.com"] {
            assert!(
                matches!(validate_domain(bad), Err(Error::InvalidDomain(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
