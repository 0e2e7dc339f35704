use chrono::Utc;
use tracing::{error, info, warn};

use super::{PendingBatch, PendingChallenge, Workflow};
use crate::alert::{DOMAINS_WITHOUT_CERTIFICATE, RENEWAL_PROBLEM};
use crate::certificate::CertificateRequest;
use crate::resource::{Certificate, Relation};
use crate::store::{CertificateQuery, ChangeSet};
use crate::Error;

impl Workflow {
    /// Completes the challenges of `batch`, swaps in the new certificates and removes its DNS
    /// entries
    ///
    /// The DNS entries are removed whatever happened to the certificates.
    pub(super) async fn reconcile(&self, batch: PendingBatch) {
        let mut changes = ChangeSet::new();
        if let Err(e) = self.complete_batch(&batch, &mut changes).await {
            error!(error = %e, "Problem while managing Lets Encrypt");
            self.alerts.error(RENEWAL_PROBLEM, &e.to_string());
        }

        let cleanup = self.cleanup_changes(&batch);
        for change in cleanup.iter() {
            changes.push(change.clone());
        }

        if let Err(e) = self.store.apply(changes) {
            error!(error = %e, "Could not save the renewal, removing the DNS entries only");
            self.alerts.error(RENEWAL_PROBLEM, &e.to_string());
            if let Err(e) = self.store.apply(cleanup) {
                error!(error = %e, "Could not remove the DNS entries");
            }
        }

        self.release(&batch.domains, &batch.dns_entries);
        info!(sentinel = %batch.sentinel.name, "Timer completed");
    }

    async fn complete_batch(
        &self,
        batch: &PendingBatch,
        changes: &mut ChangeSet,
    ) -> Result<(), Error> {
        let mut validated = Vec::<(&str, &PendingChallenge)>::new();
        for (domain, pending) in &batch.challenges {
            match batch.session.challenge_complete(&pending.challenge).await {
                Ok(()) => validated.push((domain.as_str(), pending)),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Challenge failed");
                    if let Err(e) = self.record_failure(domain, changes) {
                        error!(domain = %domain, error = %e, "Could not record the failure");
                    }
                }
            }
        }

        let mut renewed = Vec::new();
        let mut failures = Vec::new();
        for (domain, pending) in validated {
            match self.retrieve(batch, domain, pending).await {
                Ok(certificate) => renewed.push(certificate),
                Err(e) => {
                    error!(domain = %domain, error = %e, "Could not get the certificate");
                    failures.push(format!("{} : {}", domain, e));
                }
            }
        }

        if !failures.is_empty() {
            self.alerts.warn(DOMAINS_WITHOUT_CERTIFICATE, &failures.join("\n"));
        }

        for certificate in renewed {
            info!(
                domain = certificate.primary_domain().unwrap_or_default(),
                not_after = %certificate.not_after,
                "Certificate renewed"
            );
            changes.replace_certificate(certificate);
        }
        Ok(())
    }

    /// Marks every managed certificate of `domain` as just failed
    fn record_failure(&self, domain: &str, changes: &mut ChangeSet) -> Result<(), Error> {
        let now = Utc::now();
        for mut certificate in self
            .store
            .certificates(&CertificateQuery::managed().primary_domain(domain))?
        {
            certificate.set_last_failure(now);
            changes.update_certificate(certificate);
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        batch: &PendingBatch,
        domain: &str,
        pending: &PendingChallenge,
    ) -> Result<Certificate, Error> {
        let request = CertificateRequest::for_domain(domain)?;
        let issued = batch
            .session
            .request_certificate(&pending.order, domain, request.der_bytes())
            .await?;

        let previous = match self.store.certificate(&pending.certificate)? {
            Some(previous) => previous,
            None => self
                .store
                .certificates(&CertificateQuery::managed().primary_domain(domain))?
                .into_iter()
                .next()
                .ok_or_else(|| Error::UnknownResource(pending.certificate))?,
        };

        let certificate = issued.into_certificate(previous.id, request.key_pair_pem())?;
        if !certificate
            .primary_domain()
            .is_some_and(|name| name.eq_ignore_ascii_case(domain))
        {
            return Err(Error::CertificateParse(format!(
                "issued certificate names {:?} instead of {}",
                certificate.primary_domain(),
                domain
            )));
        }
        Ok(certificate)
    }

    /// Entries the batch published plus anything else linked from its certificates
    fn cleanup_changes(&self, batch: &PendingBatch) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for id in &batch.dns_entries {
            changes.delete_dns_entry(*id);
        }

        for certificate in &batch.certificates {
            match self.store.linked_dns_entries(certificate, Relation::Manages) {
                Ok(entries) => {
                    for entry in entries {
                        changes.delete_dns_entry(entry.id);
                    }
                }
                Err(e) => {
                    warn!(certificate = %certificate, error = %e, "Could not list the DNS entries")
                }
            }
        }
        changes
    }
}
