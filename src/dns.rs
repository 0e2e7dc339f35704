//! DNS record naming and the resolver used to detect propagation
use std::net::IpAddr;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

use crate::Error;

const ACME_CHALLENGE_PREFIX: &str = "_acme-challenge";

/// `_acme-challenge.<domain>`, wildcards validate on the base domain
pub fn challenge_record_name(domain: &str) -> String {
    let domain = domain.trim_start_matches("*.").trim_end_matches('.');
    format!("{}.{}", ACME_CHALLENGE_PREFIX, domain.to_ascii_lowercase())
}

/// Throwaway host name under the propagation sub-domain, unique per batch
pub fn sentinel_name(propagation_domain: &str) -> String {
    format!(
        "{}.{}",
        random_hex(10),
        propagation_domain.trim_matches('.').to_ascii_lowercase()
    )
}

pub(crate) fn random_hex(len: usize) -> String {
    use rand::Rng;

    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Answers whether a host name currently resolves
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolves(&self, host: &str) -> Result<bool, Error>;
}

pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// System configuration when `nameservers` is empty
    pub fn new(nameservers: &[IpAddr]) -> Result<Self, Error> {
        let resolver = if nameservers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()?
        } else {
            let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        };
        Ok(Self { resolver })
    }
}

#[async_trait::async_trait]
impl HostResolver for SystemResolver {
    async fn resolves(&self, host: &str) -> Result<bool, Error> {
        // Negative answers are cached too, each check must ask again
        self.resolver.clear_cache();
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(e.into()),
            },
        }
    }
}
