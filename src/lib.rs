mod account;
mod acme;
mod alert;
mod certificate;
mod config;
mod dns;
mod resource;
mod scheduler;
mod store;
mod workflow;

// re-exports
pub use account::{ensure_renewal_config, generate_tag, register_config};
pub use acme::{
    AcmeConnector, AcmeSession, Dns01Challenge, InstantAcmeConnector, Login, OrderHandle,
};
pub use alert::{AlertSink, LogAlertSink};
pub use certificate::{placeholder, self_signed, thumbprint, CertificateRequest, IssuedCertificate};
pub use config::Settings;
pub use dns::{challenge_record_name, sentinel_name, HostResolver, SystemResolver};
pub use resource::{
    Certificate, DnsEntry, DnsEntryType, Relation, RenewalConfig, ResourceId, LAST_FAILURE,
    SENTINEL_ADDRESS,
};
pub use scheduler::{Runner, ScheduledSteps, Scheduler, Step, TokioScheduler};
pub use store::{CertificateQuery, Change, ChangeSet, MemoryStore, ResourceStore};
pub use workflow::{PendingBatch, PendingChallenge, PropagationState, Workflow};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("DNS challenge not found for {domain} ; Available challenges are: [{offered}]")]
    ChallengeUnavailable { domain: String, offered: String },
    #[error("The challenge failed for {domain}: {reason}")]
    ChallengeFailed { domain: String, reason: String },
    #[error("The order failed for {domain}")]
    OrderFailed { domain: String },
    #[error("Order for {domain} is still not valid after 1 minute. Status is {status}")]
    OrderTimeout { domain: String, status: String },
    #[error("Could not get any challenge")]
    NoChallengesObtained,
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
    #[error("ACME protocol error: {0}")]
    Protocol(String),
    #[error("Renewal config already exists: {0}")]
    ConfigExists(String),
    #[error("Unknown order handle {0}")]
    UnknownOrder(String),
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
    #[error("Resource not found: {0}")]
    UnknownResource(ResourceId),
    #[error("Resource store error: {0}")]
    Store(String),
    #[error(transparent)]
    KeyGeneration(#[from] rcgen::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    DnsResolveError(#[from] hickory_resolver::error::ResolveError),
}

impl From<instant_acme::Error> for Error {
    fn from(e: instant_acme::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
