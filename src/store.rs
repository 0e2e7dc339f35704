//! Resource store: queries plus atomic changesets
//!
//! Workflow steps never mutate the store directly. Every mutation is collected as a named
//! [`Change`] into a [`ChangeSet`] which the store applies all-or-nothing once the step is done.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::resource::{Certificate, DnsEntry, Relation, RenewalConfig, ResourceId};
use crate::Error;

#[derive(Clone, Debug)]
pub enum Change {
    AddConfig(RenewalConfig),
    UpdateConfig(RenewalConfig),
    AddCertificate(Certificate),
    /// Same material, e.g. metadata only
    UpdateCertificate(Certificate),
    /// New material swapped in for the certificate with the same id
    ReplaceCertificate(Certificate),
    AddDnsEntry(DnsEntry),
    DeleteDnsEntry(ResourceId),
    LinkAdd {
        from: ResourceId,
        relation: Relation,
        to: ResourceId,
    },
    TagAdd {
        resource: ResourceId,
        tag: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn add_config(&mut self, config: RenewalConfig) {
        self.push(Change::AddConfig(config));
    }

    pub fn update_config(&mut self, config: RenewalConfig) {
        self.push(Change::UpdateConfig(config));
    }

    pub fn add_certificate(&mut self, certificate: Certificate) {
        self.push(Change::AddCertificate(certificate));
    }

    pub fn update_certificate(&mut self, certificate: Certificate) {
        self.push(Change::UpdateCertificate(certificate));
    }

    pub fn replace_certificate(&mut self, certificate: Certificate) {
        self.push(Change::ReplaceCertificate(certificate));
    }

    pub fn add_dns_entry(&mut self, entry: DnsEntry) {
        self.push(Change::AddDnsEntry(entry));
    }

    pub fn delete_dns_entry(&mut self, id: ResourceId) {
        self.push(Change::DeleteDnsEntry(id));
    }

    pub fn link_add(&mut self, from: ResourceId, relation: Relation, to: ResourceId) {
        self.push(Change::LinkAdd { from, relation, to });
    }

    pub fn tag_add(&mut self, resource: ResourceId, tag: &str) {
        self.push(Change::TagAdd {
            resource,
            tag: tag.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }
}

/// Filter for certificate lookups, all set conditions must match
#[derive(Clone, Debug, Default)]
pub struct CertificateQuery {
    managed_only: bool,
    expiring_before: Option<DateTime<Utc>>,
    primary_domain: Option<String>,
}

impl CertificateQuery {
    pub fn managed() -> Self {
        Self {
            managed_only: true,
            ..Default::default()
        }
    }

    pub fn expiring_before(mut self, at: DateTime<Utc>) -> Self {
        self.expiring_before = Some(at);
        self
    }

    pub fn primary_domain(mut self, domain: &str) -> Self {
        self.primary_domain = Some(domain.to_ascii_lowercase());
        self
    }

    pub fn matches(&self, certificate: &Certificate) -> bool {
        if self.managed_only && !certificate.managed {
            return false;
        }
        if let Some(at) = self.expiring_before {
            if certificate.not_after > at {
                return false;
            }
        }
        if let Some(domain) = &self.primary_domain {
            if !certificate
                .primary_domain()
                .is_some_and(|name| name.eq_ignore_ascii_case(domain))
            {
                return false;
            }
        }
        true
    }
}

pub trait ResourceStore: Send + Sync {
    fn renewal_configs(&self) -> Result<Vec<RenewalConfig>, Error>;

    fn certificates(&self, query: &CertificateQuery) -> Result<Vec<Certificate>, Error>;

    fn certificate(&self, id: &ResourceId) -> Result<Option<Certificate>, Error>;

    /// Entries carrying any of `tags`
    fn dns_entries_tagged(&self, tags: &[String]) -> Result<Vec<DnsEntry>, Error>;

    fn linked_dns_entries(
        &self,
        from: &ResourceId,
        relation: Relation,
    ) -> Result<Vec<DnsEntry>, Error>;

    /// Applies every change or none of them
    fn apply(&self, changes: ChangeSet) -> Result<(), Error>;

    /// The config renewal batches run with
    fn active_config(&self) -> Result<Option<RenewalConfig>, Error> {
        Ok(self.renewal_configs()?.into_iter().next())
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
struct StoreState {
    #[serde(default)]
    configs: BTreeMap<ResourceId, RenewalConfig>,
    #[serde(default)]
    certificates: BTreeMap<ResourceId, Certificate>,
    #[serde(default)]
    dns_entries: BTreeMap<ResourceId, DnsEntry>,
    #[serde(default)]
    links: Vec<(ResourceId, Relation, ResourceId)>,
    #[serde(default)]
    tags: BTreeMap<ResourceId, BTreeSet<String>>,
}

impl StoreState {
    fn contains(&self, id: &ResourceId) -> bool {
        self.configs.contains_key(id)
            || self.certificates.contains_key(id)
            || self.dns_entries.contains_key(id)
    }

    fn apply_one(&mut self, change: Change) -> Result<(), Error> {
        match change {
            Change::AddConfig(config) => {
                self.configs.insert(config.id, config);
            }
            Change::UpdateConfig(config) => {
                let slot = self
                    .configs
                    .get_mut(&config.id)
                    .ok_or(Error::UnknownResource(config.id))?;
                *slot = config;
            }
            Change::AddCertificate(certificate) => {
                self.certificates.insert(certificate.id, certificate);
            }
            Change::UpdateCertificate(certificate) | Change::ReplaceCertificate(certificate) => {
                let slot = self
                    .certificates
                    .get_mut(&certificate.id)
                    .ok_or(Error::UnknownResource(certificate.id))?;
                *slot = certificate;
            }
            Change::AddDnsEntry(entry) => {
                self.dns_entries.insert(entry.id, entry);
            }
            Change::DeleteDnsEntry(id) => {
                // Already gone is fine, the scanner may have purged it
                if self.dns_entries.remove(&id).is_some() {
                    self.links.retain(|(from, _, to)| *from != id && *to != id);
                    self.tags.remove(&id);
                }
            }
            Change::LinkAdd { from, relation, to } => {
                for id in [from, to] {
                    if !self.contains(&id) {
                        return Err(Error::UnknownResource(id));
                    }
                }
                let link = (from, relation, to);
                if !self.links.contains(&link) {
                    self.links.push(link);
                }
            }
            Change::TagAdd { resource, tag } => {
                if !self.contains(&resource) {
                    return Err(Error::UnknownResource(resource));
                }
                self.tags.entry(resource).or_default().insert(tag);
            }
        }
        Ok(())
    }
}

/// In-memory store, optionally snapshotted to a JSON file after every changeset
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    snapshot_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the snapshot if the file exists
    pub fn open<P: AsRef<Path>>(snapshot_file: P) -> Result<Self, Error> {
        let snapshot_file = snapshot_file.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&snapshot_file) {
            Ok(json) => serde_json::from_str::<StoreState>(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot_file: Some(snapshot_file),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>, Error> {
        self.state
            .read()
            .map_err(|_| Error::Store("store lock poisoned".to_string()))
    }

    fn save(&self, state: &StoreState) -> Result<(), Error> {
        let Some(snapshot_file) = &self.snapshot_file else {
            return Ok(());
        };

        // Write beside the target then rename, a crash leaves the old snapshot intact
        let tmp_file = snapshot_file.with_extension("json.tmp");
        std::fs::write(&tmp_file, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp_file, snapshot_file)?;
        Ok(())
    }
}

impl ResourceStore for MemoryStore {
    fn renewal_configs(&self) -> Result<Vec<RenewalConfig>, Error> {
        Ok(self.read()?.configs.values().cloned().collect())
    }

    fn certificates(&self, query: &CertificateQuery) -> Result<Vec<Certificate>, Error> {
        Ok(self
            .read()?
            .certificates
            .values()
            .filter(|crt| query.matches(crt))
            .cloned()
            .collect())
    }

    fn certificate(&self, id: &ResourceId) -> Result<Option<Certificate>, Error> {
        Ok(self.read()?.certificates.get(id).cloned())
    }

    fn dns_entries_tagged(&self, tags: &[String]) -> Result<Vec<DnsEntry>, Error> {
        let state = self.read()?;
        Ok(state
            .dns_entries
            .values()
            .filter(|entry| {
                state
                    .tags
                    .get(&entry.id)
                    .is_some_and(|entry_tags| tags.iter().any(|tag| entry_tags.contains(tag)))
            })
            .cloned()
            .collect())
    }

    fn linked_dns_entries(
        &self,
        from: &ResourceId,
        relation: Relation,
    ) -> Result<Vec<DnsEntry>, Error> {
        let state = self.read()?;
        Ok(state
            .links
            .iter()
            .filter(|(link_from, link_relation, _)| link_from == from && *link_relation == relation)
            .filter_map(|(_, _, to)| state.dns_entries.get(to))
            .cloned()
            .collect())
    }

    fn apply(&self, changes: ChangeSet) -> Result<(), Error> {
        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Store("store lock poisoned".to_string()))?;

        let count = changes.len();
        let mut next = state.clone();
        for change in changes.changes {
            next.apply_one(change)?;
        }
        self.save(&next)?;
        *state = next;

        debug!(changes = count, "Applied changeset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::DnsEntryType;

    fn certificate(domain: &str, expires_in_days: i64) -> Certificate {
        let mut crt = crate::certificate::placeholder(domain).unwrap();
        crt.not_after = Utc::now() + chrono::Duration::days(expires_in_days);
        crt
    }

    #[test]
    fn query_filters() {
        let store = MemoryStore::new();
        let mut unmanaged = certificate("manual.example.com", 5);
        unmanaged.managed = false;

        let mut changes = ChangeSet::new();
        changes.add_certificate(certificate("soon.example.com", 5));
        changes.add_certificate(certificate("later.example.com", 60));
        changes.add_certificate(unmanaged);
        store.apply(changes).unwrap();

        let expiring = store
            .certificates(
                &CertificateQuery::managed().expiring_before(Utc::now() + chrono::Duration::weeks(3)),
            )
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].primary_domain(), Some("soon.example.com"));

        let by_domain = store
            .certificates(&CertificateQuery::default().primary_domain("Manual.example.com"))
            .unwrap();
        assert_eq!(by_domain.len(), 1);
    }

    #[test]
    fn domain_query_ignores_stored_case() {
        let store = MemoryStore::new();
        let mut crt = certificate("www.example.com", 5);
        crt.domain_names = vec!["WWW.Example.com".to_string()];

        let mut changes = ChangeSet::new();
        changes.add_certificate(crt.clone());
        store.apply(changes).unwrap();

        let found = store
            .certificates(&CertificateQuery::managed().primary_domain("www.example.COM"))
            .unwrap();
        assert_eq!(found, vec![crt]);
    }

    #[test]
    fn tags_are_or_matched_and_deleted_with_the_entry() {
        let store = MemoryStore::new();
        let first = DnsEntry::new("a.example.com", DnsEntryType::A, "127.0.0.1");
        let second = DnsEntry::new("b.example.com", DnsEntryType::A, "127.0.0.1");
        let untagged = DnsEntry::new("c.example.com", DnsEntryType::A, "127.0.0.1");

        let mut changes = ChangeSet::new();
        changes.add_dns_entry(first.clone());
        changes.add_dns_entry(second.clone());
        changes.add_dns_entry(untagged);
        changes.tag_add(first.id, "t1");
        changes.tag_add(second.id, "t2");
        store.apply(changes).unwrap();

        let tags = vec!["t1".to_string(), "t2".to_string()];
        assert_eq!(store.dns_entries_tagged(&tags).unwrap().len(), 2);

        let mut changes = ChangeSet::new();
        changes.delete_dns_entry(first.id);
        // Deleting twice is harmless
        changes.delete_dns_entry(first.id);
        store.apply(changes).unwrap();

        let remaining = store.dns_entries_tagged(&tags).unwrap();
        assert_eq!(remaining, vec![second]);
    }

    #[test]
    fn links_follow_the_relation() {
        let store = MemoryStore::new();
        let crt = certificate("example.com", 5);
        let txt = DnsEntry::challenge("example.com", "digest");

        let mut changes = ChangeSet::new();
        changes.add_certificate(crt.clone());
        changes.add_dns_entry(txt.clone());
        changes.link_add(crt.id, Relation::Manages, txt.id);
        store.apply(changes).unwrap();

        assert_eq!(
            store.linked_dns_entries(&crt.id, Relation::Manages).unwrap(),
            vec![txt.clone()]
        );

        let mut changes = ChangeSet::new();
        changes.delete_dns_entry(txt.id);
        store.apply(changes).unwrap();
        assert!(store
            .linked_dns_entries(&crt.id, Relation::Manages)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failing_change_discards_the_whole_set() {
        let store = MemoryStore::new();
        let entry = DnsEntry::sentinel("abc.dnscheck.example.com");

        let mut changes = ChangeSet::new();
        changes.add_dns_entry(entry.clone());
        changes.update_certificate(certificate("missing.example.com", 5));
        assert!(matches!(store.apply(changes), Err(Error::UnknownResource(_))));

        let all = store.state.read().unwrap();
        assert!(all.dns_entries.is_empty());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let path = std::env::temp_dir().join(format!("store-{}.json", ResourceId::generate()));
        let config = RenewalConfig::new("main", "ops@example.com", "dnscheck.example.com", true);

        {
            let store = MemoryStore::open(&path).unwrap();
            let mut changes = ChangeSet::new();
            changes.add_config(config.clone());
            store.apply(changes).unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.renewal_configs().unwrap(), vec![config]);
        std::fs::remove_file(&path).unwrap();
    }
}
