#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acme_dns_renewal::*;

#[derive(Default)]
pub struct Script {
    pub init_fails: HashSet<String>,
    pub complete_fails: HashSet<String>,
    pub request_fails: HashSet<String>,
}

/// ACME session issuing self-signed 90-day certificates
#[derive(Default)]
pub struct FakeAcme {
    pub script: Mutex<Script>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeAcme {
    pub fn fail_init(&self, domain: &str) {
        self.script.lock().unwrap().init_fails.insert(domain.to_string());
    }

    pub fn fail_complete(&self, domain: &str) {
        self.script.lock().unwrap().complete_fails.insert(domain.to_string());
    }

    pub fn fail_request(&self, domain: &str) {
        self.script.lock().unwrap().request_fails.insert(domain.to_string());
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct FakeConnector(pub Arc<FakeAcme>);

#[async_trait::async_trait]
impl AcmeConnector for FakeConnector {
    async fn login(&self, config: &RenewalConfig) -> Result<Login, Error> {
        self.0.record(format!("login {}", config.name));
        Ok(Login {
            session: self.0.clone(),
            new_credentials: (!config.has_credentials()).then(|| "{\"id\":\"fake\"}".to_string()),
        })
    }
}

#[async_trait::async_trait]
impl AcmeSession for FakeAcme {
    async fn challenge_init(&self, domain: &str) -> Result<(OrderHandle, Dns01Challenge), Error> {
        self.record(format!("init {}", domain));
        if self.script.lock().unwrap().init_fails.contains(domain) {
            return Err(Error::ChallengeUnavailable {
                domain: domain.to_string(),
                offered: "Http01".to_string(),
            });
        }

        let order = OrderHandle::generate();
        Ok((
            order,
            Dns01Challenge {
                order,
                domain: domain.to_string(),
                url: format!("https://acme.test/chall/{}", domain),
                digest: format!("digest-{}", domain),
            },
        ))
    }

    async fn challenge_complete(&self, challenge: &Dns01Challenge) -> Result<(), Error> {
        self.record(format!("complete {}", challenge.domain));
        if self
            .script
            .lock()
            .unwrap()
            .complete_fails
            .contains(&challenge.domain)
        {
            return Err(Error::ChallengeFailed {
                domain: challenge.domain.clone(),
                reason: "authorization is Invalid".to_string(),
            });
        }
        Ok(())
    }

    async fn request_certificate(
        &self,
        _order: &OrderHandle,
        domain: &str,
        csr: &[u8],
    ) -> Result<IssuedCertificate, Error> {
        self.record(format!("request {}", domain));
        assert!(!csr.is_empty());
        if self.script.lock().unwrap().request_fails.contains(domain) {
            return Err(Error::OrderFailed {
                domain: domain.to_string(),
            });
        }

        let (leaf, _key) = self_signed(domain, chrono::Duration::days(90))?;
        let (issuer, _key) = self_signed("fake-issuer.example.net", chrono::Duration::days(900))?;
        IssuedCertificate::from_pem_chain(&format!("{}{}", leaf, issuer))
    }
}

/// Answers from a queue, then `fallback`
pub struct ScriptedResolver {
    pub answers: Mutex<VecDeque<bool>>,
    pub fallback: Mutex<bool>,
    pub asked: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn always(found: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(found),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, found: bool) {
        *self.fallback.lock().unwrap() = found;
    }
}

#[async_trait::async_trait]
impl HostResolver for ScriptedResolver {
    async fn resolves(&self, host: &str) -> Result<bool, Error> {
        self.asked.lock().unwrap().push(host.to_string());
        let answer = self.answers.lock().unwrap().pop_front();
        Ok(answer.unwrap_or(*self.fallback.lock().unwrap()))
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    pub steps: Mutex<Vec<(Step, Duration)>>,
}

impl RecordingScheduler {
    pub fn take(&self) -> Vec<(Step, Duration)> {
        std::mem::take(&mut *self.steps.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule_once(&self, step: Step, delay: Duration) {
        self.steps.lock().unwrap().push((step, delay));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Level {
    Warn,
    Error,
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<(Level, String, String)>>,
}

impl RecordingAlerts {
    pub fn all(&self) -> Vec<(Level, String, String)> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn warn(&self, title: &str, body: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((Level::Warn, title.to_string(), body.to_string()));
    }

    fn error(&self, title: &str, body: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((Level::Error, title.to_string(), body.to_string()));
    }
}

/// Memory store whose certificate queries can be made to fail
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl TestStore {
    pub fn fail_queries(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

impl ResourceStore for TestStore {
    fn renewal_configs(&self) -> Result<Vec<RenewalConfig>, Error> {
        self.inner.renewal_configs()
    }

    fn certificates(&self, query: &CertificateQuery) -> Result<Vec<Certificate>, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Store("query failed".to_string()));
        }
        self.inner.certificates(query)
    }

    fn certificate(&self, id: &ResourceId) -> Result<Option<Certificate>, Error> {
        self.inner.certificate(id)
    }

    fn dns_entries_tagged(&self, tags: &[String]) -> Result<Vec<DnsEntry>, Error> {
        self.inner.dns_entries_tagged(tags)
    }

    fn linked_dns_entries(
        &self,
        from: &ResourceId,
        relation: Relation,
    ) -> Result<Vec<DnsEntry>, Error> {
        self.inner.linked_dns_entries(from, relation)
    }

    fn apply(&self, changes: ChangeSet) -> Result<(), Error> {
        self.inner.apply(changes)
    }
}

pub const TAG: &str = "letsencrypt_0123456789";

pub struct Harness {
    pub store: Arc<TestStore>,
    pub scheduler: Arc<RecordingScheduler>,
    pub alerts: Arc<RecordingAlerts>,
    pub resolver: Arc<ScriptedResolver>,
    pub acme: Arc<FakeAcme>,
    pub workflow: Workflow,
}

impl Harness {
    /// Registered config with credentials and tag, sentinel always resolving
    pub fn new() -> Self {
        let harness = Self::without_config();
        let mut config =
            RenewalConfig::new("main", "ops@example.com", "dnscheck.example.com", true);
        config.tag = Some(TAG.to_string());
        config.account_credentials = Some("{\"id\":\"stored\"}".to_string());

        let mut changes = ChangeSet::new();
        changes.add_config(config);
        harness.store.apply(changes).unwrap();
        harness
    }

    pub fn without_config() -> Self {
        let store = Arc::new(TestStore::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let resolver = Arc::new(ScriptedResolver::always(true));
        let acme = Arc::new(FakeAcme::default());

        let workflow = Workflow::new(
            store.clone(),
            scheduler.clone(),
            alerts.clone(),
            resolver.clone(),
            Arc::new(FakeConnector(acme.clone())),
            Settings::default(),
        );

        Self {
            store,
            scheduler,
            alerts,
            resolver,
            acme,
            workflow,
        }
    }

    pub fn config(&self) -> RenewalConfig {
        self.store.renewal_configs().unwrap().remove(0)
    }

    /// Managed certificate for `domain` expiring in `days`
    pub fn add_certificate(&self, domain: &str, days: i64) -> Certificate {
        let mut crt = placeholder(domain).unwrap();
        crt.not_after = chrono::Utc::now() + chrono::Duration::days(days);

        let mut changes = ChangeSet::new();
        changes.add_certificate(crt.clone());
        self.store.apply(changes).unwrap();
        crt
    }

    /// Managed certificate whose stored name keeps the given spelling
    pub fn add_certificate_named(&self, name: &str, days: i64) -> Certificate {
        let mut crt = placeholder(&name.to_ascii_lowercase()).unwrap();
        crt.domain_names = vec![name.to_string()];
        crt.not_after = chrono::Utc::now() + chrono::Duration::days(days);

        let mut changes = ChangeSet::new();
        changes.add_certificate(crt.clone());
        self.store.apply(changes).unwrap();
        crt
    }

    pub fn certificate(&self, id: &ResourceId) -> Certificate {
        self.store.certificate(id).unwrap().unwrap()
    }

    pub fn tagged_entries(&self) -> Vec<DnsEntry> {
        self.store.dns_entries_tagged(&[TAG.to_string()]).unwrap()
    }

    /// Runs every scheduled step, and what those schedule, until none is left
    pub async fn drive(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        for _ in 0..20 {
            let steps = self.scheduler.take();
            if steps.is_empty() {
                return delays;
            }
            for (step, delay) in steps {
                delays.push(delay);
                self.workflow.run(step).await;
            }
        }
        panic!("steps keep getting scheduled");
    }

    /// Runs the one scheduled step
    pub async fn step(&self) -> Duration {
        let mut steps = self.scheduler.take();
        assert_eq!(steps.len(), 1, "expected exactly one scheduled step");
        let (step, delay) = steps.remove(0);
        self.workflow.run(step).await;
        delay
    }
}
