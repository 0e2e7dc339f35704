//! Deferred workflow steps
//!
//! Waiting is never a blocking sleep: a step that needs time asks to be scheduled again and
//! returns. The [`Runner`] executes delivered steps one at a time through [`Workflow::run`].
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::resource::ResourceId;
use crate::workflow::{PendingBatch, Workflow};

#[derive(Debug)]
pub enum Step {
    /// Periodic expiry scan
    Scan,
    /// Renew these certificates now, e.g. right after a domain became managed
    Renew { certificates: Vec<ResourceId> },
    /// Check whether the batch's DNS changes are visible yet
    AwaitPropagation(PendingBatch),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Scan => "scan",
            Step::Renew { .. } => "renew",
            Step::AwaitPropagation(_) => "await-propagation",
        }
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `step` once after `delay`
    fn schedule_once(&self, step: Step, delay: Duration);
}

pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<Step>,
    pending: Arc<AtomicUsize>,
}

/// Receiving side of a [`TokioScheduler`]
pub struct ScheduledSteps {
    rx: mpsc::UnboundedReceiver<Step>,
    pending: Arc<AtomicUsize>,
}

impl TokioScheduler {
    pub fn new() -> (Self, ScheduledSteps) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            ScheduledSteps { rx, pending },
        )
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, step: Step, delay: Duration) {
        debug!(step = step.name(), delay_secs = delay.as_secs(), "Scheduling step");
        self.pending.fetch_add(1, Ordering::SeqCst);

        let tx = self.tx.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(mpsc::error::SendError(step)) = tx.send(step) {
                pending.fetch_sub(1, Ordering::SeqCst);
                warn!(step = step.name(), "Runner is gone, dropping step");
            }
        });
    }
}

impl ScheduledSteps {
    async fn next(&mut self) -> Option<Step> {
        let step = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(step)
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

pub struct Runner {
    workflow: Arc<Workflow>,
    steps: ScheduledSteps,
    scan_interval: Duration,
}

impl Runner {
    pub fn new(workflow: Arc<Workflow>, steps: ScheduledSteps, scan_interval: Duration) -> Self {
        Self {
            workflow,
            steps,
            scan_interval,
        }
    }

    /// Scans immediately, then every scan interval, and runs scheduled steps in between
    pub async fn run(mut self) {
        info!(
            scan_interval_hours = self.scan_interval.as_secs() / 3600,
            "Starting renewal runner"
        );

        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.workflow.run(Step::Scan).await,
                step = self.steps.next() => match step {
                    Some(step) => self.workflow.run(step).await,
                    None => break,
                },
            }
        }
    }

    /// Runs scheduled steps, and whatever they schedule in turn, until nothing is pending
    pub async fn run_until_idle(mut self) {
        while !self.steps.is_idle() {
            match self.steps.next().await {
                Some(step) => self.workflow.run(step).await,
                None => break,
            }
        }
        info!("No more pending steps");
    }
}
