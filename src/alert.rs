//! Human-visible notifications
use tracing::{error, warn};

pub const DOMAINS_WITHOUT_CHALLENGE: &str = "Let's Encrypt - Domains Without Challenge";
pub const DOMAINS_WITHOUT_CERTIFICATE: &str = "Let's Encrypt - Domains Couldn't get certificate";
pub const RENEWAL_PROBLEM: &str = "Problem while managing Lets Encrypt";

pub trait AlertSink: Send + Sync {
    fn warn(&self, title: &str, body: &str);
    fn error(&self, title: &str, body: &str);
}

/// Emits alerts as log events
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn warn(&self, title: &str, body: &str) {
        warn!(alert = %title, "{}", body);
    }

    fn error(&self, title: &str, body: &str) {
        error!(alert = %title, "{}", body);
    }
}
