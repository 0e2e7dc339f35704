//! Resources kept in the store: renewal configs, certificates and DNS entries
//!
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding the epoch milliseconds of the last failed renewal
pub const LAST_FAILURE: &str = "lastFailureTimestamp";

/// Sentinel A records point here, they only need to exist
pub const SENTINEL_ADDRESS: &str = "127.0.0.1";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(uuid::Uuid);

impl ResourceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One ACME account context
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenewalConfig {
    pub id: ResourceId,
    pub name: String,
    pub contact_email: String,
    /// Serialized `instant_acme::AccountCredentials`, holds the account key pair
    #[serde(default)]
    pub account_credentials: Option<String>,
    /// Sentinel records are created as `<random>.<propagation_domain>`
    pub propagation_domain: String,
    #[serde(default)]
    pub staging: bool,
    /// Overrides the Let's Encrypt directories, e.g. for a private CA
    #[serde(default)]
    pub directory_url: Option<String>,
    /// Groups every DNS entry created for this account's in-flight batches
    #[serde(default)]
    pub tag: Option<String>,
}

impl RenewalConfig {
    pub fn new(name: &str, contact_email: &str, propagation_domain: &str, staging: bool) -> Self {
        Self {
            id: ResourceId::generate(),
            name: name.to_string(),
            contact_email: contact_email.to_string(),
            account_credentials: None,
            propagation_domain: propagation_domain.to_ascii_lowercase(),
            staging,
            directory_url: None,
            tag: None,
        }
    }

    pub fn directory_url(&self) -> &str {
        if let Some(url) = self.directory_url.as_deref() {
            url
        } else if self.staging {
            instant_acme::LetsEncrypt::Staging.url()
        } else {
            instant_acme::LetsEncrypt::Production.url()
        }
    }

    /// Tag, only when it is usable
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref().filter(|tag| !tag.is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.account_credentials
            .as_deref()
            .is_some_and(|creds| !creds.is_empty())
    }
}

/// An issued certificate bound to one primary domain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: ResourceId,
    /// First entry is the common name
    pub domain_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub certificate_pem: String,
    #[serde(default)]
    pub chain_pem: String,
    pub private_key_pem: String,
    pub thumbprint: String,
    /// Renewed automatically by this crate
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Certificate {
    pub fn primary_domain(&self) -> Option<&str> {
        self.domain_names.first().map(String::as_str)
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.meta
            .get(LAST_FAILURE)
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn set_last_failure(&mut self, at: DateTime<Utc>) {
        self.meta
            .insert(LAST_FAILURE.to_string(), at.timestamp_millis().to_string());
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DnsEntryType {
    A,
    TXT,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub id: ResourceId,
    pub name: String,
    pub kind: DnsEntryType,
    pub value: String,
}

impl DnsEntry {
    pub fn new(name: &str, kind: DnsEntryType, value: &str) -> Self {
        Self {
            id: ResourceId::generate(),
            name: name.to_ascii_lowercase(),
            kind,
            value: value.to_string(),
        }
    }

    /// `_acme-challenge.<domain>` TXT record holding the challenge digest
    pub fn challenge(domain: &str, digest: &str) -> Self {
        Self::new(&crate::dns::challenge_record_name(domain), DnsEntryType::TXT, digest)
    }

    pub fn sentinel(name: &str) -> Self {
        Self::new(name, DnsEntryType::A, SENTINEL_ADDRESS)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Relation {
    /// The source resource owns the target, e.g. a certificate and its challenge records
    Manages,
}
