use tracing::info;

use crate::acme::AcmeConnector;
use crate::resource::RenewalConfig;
use crate::store::{ChangeSet, ResourceStore};
use crate::Error;

/// Tag grouping the DNS entries of one config
pub fn generate_tag() -> String {
    format!("letsencrypt_{}", crate::dns::random_hex(10))
}

/// Backfills what a config needs before running a batch, `None` when already complete
///
/// The account itself is registered lazily on the first login.
pub fn ensure_renewal_config(config: &RenewalConfig) -> Option<RenewalConfig> {
    if config.tag().is_some() {
        return None;
    }

    info!(config = %config.name, "Generating a Tag name");
    let mut updated = config.clone();
    updated.tag = Some(generate_tag());
    Some(updated)
}

/// Creates a new renewal config and registers its ACME account right away
pub async fn register_config(
    store: &dyn ResourceStore,
    connector: &dyn AcmeConnector,
    mut config: RenewalConfig,
) -> Result<RenewalConfig, Error> {
    // check if config already exists.
    if store
        .renewal_configs()?
        .iter()
        .any(|existing| existing.name == config.name)
    {
        return Err(Error::ConfigExists(config.name));
    }
    if config.contact_email.is_empty() {
        return Err(Error::ConfigurationMissing(
            "a contact email is required".to_string(),
        ));
    }
    config.propagation_domain = crate::workflow::validate_domain(&config.propagation_domain)?;

    if let Some(updated) = ensure_renewal_config(&config) {
        config = updated;
    }

    let login = connector.login(&config).await?;
    if let Some(credentials) = login.new_credentials {
        config.account_credentials = Some(credentials);
    }

    let mut changes = ChangeSet::new();
    changes.add_config(config.clone());
    store.apply(changes)?;

    info!(config = %config.name, tag = ?config.tag, "Renewal config registered");
    Ok(config)
}
