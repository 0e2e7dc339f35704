use std::collections::BTreeMap;

use tracing::{error, info};

use super::{PendingBatch, PendingChallenge, PropagationState, Workflow};
use crate::acme::Login;
use crate::alert::DOMAINS_WITHOUT_CHALLENGE;
use crate::dns::sentinel_name;
use crate::resource::{Certificate, DnsEntry, Relation, RenewalConfig};
use crate::scheduler::Step;
use crate::store::ChangeSet;
use crate::Error;

impl Workflow {
    /// Obtains challenges for `certificates`, publishes them and schedules the propagation check
    pub(super) async fn publish(&self, certificates: Vec<Certificate>) -> Result<(), Error> {
        let config = self.store.active_config()?.ok_or_else(|| {
            Error::ConfigurationMissing(
                "Could not find a renewal config. Create one first".to_string(),
            )
        })?;
        let tag = config
            .tag()
            .ok_or_else(|| {
                Error::ConfigurationMissing(format!(
                    "The renewal config {} does not have a tag name",
                    config.name
                ))
            })?
            .to_string();

        let certificates = self.claim(certificates);
        if certificates.is_empty() {
            return Ok(());
        }
        let domains = certificates
            .iter()
            .filter_map(|crt| crt.primary_domain().map(str::to_string))
            .collect::<Vec<_>>();

        let result = self.publish_claimed(config, &tag, certificates, domains.clone()).await;
        if result.is_err() {
            self.release(&domains, []);
        }
        result
    }

    async fn publish_claimed(
        &self,
        config: RenewalConfig,
        tag: &str,
        certificates: Vec<Certificate>,
        domains: Vec<String>,
    ) -> Result<(), Error> {
        info!(domains = ?domains, "Will update certificates");

        let Login {
            session,
            new_credentials,
        } = self.connector.login(&config).await?;

        let mut account_changes = ChangeSet::new();
        let mut config = config;
        if let Some(credentials) = new_credentials {
            info!(config = %config.name, "Saving the new account");
            config.account_credentials = Some(credentials);
            account_changes.update_config(config.clone());
        }

        let mut changes = account_changes.clone();
        let mut challenges = BTreeMap::new();
        let mut published = Vec::new();
        let mut failures = Vec::new();
        for certificate in &certificates {
            let Some(domain) = certificate.primary_domain() else {
                continue;
            };

            match session.challenge_init(domain).await {
                Ok((order, challenge)) => {
                    info!(domain = %domain, "Got the challenge");
                    let entry = DnsEntry::challenge(domain, &challenge.digest);
                    changes.add_dns_entry(entry.clone());
                    changes.link_add(certificate.id, Relation::Manages, entry.id);
                    changes.tag_add(entry.id, tag);
                    published.push(entry.id);

                    challenges.insert(
                        domain.to_string(),
                        PendingChallenge {
                            order,
                            challenge,
                            certificate: certificate.id,
                        },
                    );
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Could not get a challenge");
                    failures.push(format!("{} : {}", domain, e));
                }
            }
        }

        if !failures.is_empty() {
            self.alerts.warn(DOMAINS_WITHOUT_CHALLENGE, &failures.join("\n"));
        }
        if challenges.is_empty() {
            // A freshly registered account is kept even without challenges
            if !account_changes.is_empty() {
                self.store.apply(account_changes)?;
            }
            return Err(Error::NoChallengesObtained);
        }

        let sentinel = DnsEntry::sentinel(&sentinel_name(&config.propagation_domain));
        changes.add_dns_entry(sentinel.clone());
        changes.link_add(config.id, Relation::Manages, sentinel.id);
        changes.tag_add(sentinel.id, tag);
        published.push(sentinel.id);

        self.store.apply(changes)?;
        self.track_dns_entries(published.iter().copied());

        info!(
            sentinel = %sentinel.name,
            challenges = challenges.len(),
            "DNS entries published, waiting for propagation"
        );
        let batch = PendingBatch {
            config,
            session,
            sentinel,
            challenges,
            certificates: certificates.iter().map(|crt| crt.id).collect(),
            domains,
            dns_entries: published,
            state: PropagationState::WaitingForRecord,
        };
        self.scheduler
            .schedule_once(Step::AwaitPropagation(batch), self.settings.propagation_wait());
        Ok(())
    }
}
