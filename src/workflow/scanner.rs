use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::Workflow;
use crate::account::ensure_renewal_config;
use crate::resource::Certificate;
use crate::store::{CertificateQuery, ChangeSet};
use crate::Error;

impl Workflow {
    /// Daily expiry scan
    ///
    /// Stale DNS entries are purged first, a failure there does not stop the renewal.
    pub(super) async fn scan(&self) -> Result<(), Error> {
        if let Err(e) = self.backfill_configs() {
            warn!(error = %e, "Could not complete the renewal configs");
        }
        if let Err(e) = self.purge_stale_entries() {
            warn!(error = %e, "Could not clean old DnsEntries");
        }

        let now = Utc::now();
        let horizon = now
            .checked_add_signed(self.settings.renew_before())
            .ok_or_else(|| Error::InvalidSetting("renew_before_days is out of range".to_string()))?;
        let expiring = self
            .store
            .certificates(&CertificateQuery::managed().expiring_before(horizon))?;
        info!(count = expiring.len(), "Got certificates that will expire");

        let candidates = without_recent_failures(expiring, now, self.settings.failure_cooldown());
        info!(count = candidates.len(), "Got certificates to update");

        if candidates.is_empty() {
            return Ok(());
        }
        self.renew_batch(candidates).await
    }

    fn backfill_configs(&self) -> Result<(), Error> {
        let mut changes = ChangeSet::new();
        for config in self.store.renewal_configs()? {
            if let Some(updated) = ensure_renewal_config(&config) {
                changes.update_config(updated);
            }
        }

        if changes.is_empty() {
            return Ok(());
        }
        self.store.apply(changes)
    }

    /// Deletes DNS entries left behind by batches that never finished
    fn purge_stale_entries(&self) -> Result<(), Error> {
        let tags = self
            .store
            .renewal_configs()?
            .iter()
            .filter_map(|config| config.tag().map(str::to_string))
            .collect::<Vec<_>>();
        if tags.is_empty() {
            return Ok(());
        }

        let mut changes = ChangeSet::new();
        for entry in self.store.dns_entries_tagged(&tags)? {
            // Entries of batches running right now are theirs to delete
            if !self.is_in_flight(&entry.id) {
                changes.delete_dns_entry(entry.id);
            }
        }

        info!(count = changes.len(), "Cleaned old DnsEntries");
        if changes.is_empty() {
            return Ok(());
        }
        self.store.apply(changes)
    }
}

/// Drops certificates whose last failure is within `cooldown` of `now`
fn without_recent_failures(
    certificates: Vec<Certificate>,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> Vec<Certificate> {
    let cutoff = now
        .checked_sub_signed(cooldown)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    certificates
        .into_iter()
        .filter(|crt| match crt.last_failure() {
            Some(failed_at) if failed_at > cutoff => {
                info!(
                    domain = crt.primary_domain().unwrap_or_default(),
                    failed_at = %failed_at,
                    "Recently failed, skipping"
                );
                false
            }
            _ => true,
        })
        .collect()
}
