use tracing::{info, warn};

use super::{PendingBatch, Workflow};
use crate::scheduler::Step;

/// Where a batch stands in waiting for its DNS entries
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropagationState {
    /// Sentinel not seen yet
    WaitingForRecord,
    /// Sentinel seen once, one more check after the settle delay
    WaitingSettle,
    /// Sentinel seen twice, challenges are being completed
    Completing,
}

impl PropagationState {
    /// State after the sentinel resolved once more
    pub fn resolved(self) -> Self {
        match self {
            Self::WaitingForRecord => Self::WaitingSettle,
            Self::WaitingSettle | Self::Completing => Self::Completing,
        }
    }
}

impl Workflow {
    /// One propagation check, reschedules itself until the sentinel resolved twice
    pub(super) async fn await_propagation(&self, mut batch: PendingBatch) {
        let host = batch.sentinel.name.clone();
        let found = match self.resolver.resolves(&host).await {
            Ok(found) => found,
            Err(e) => {
                warn!(host = %host, error = %e, "Could not resolve the sentinel");
                false
            }
        };

        if !found {
            info!(host = %host, "Entry not present. Waiting");
            self.scheduler.schedule_once(
                Step::AwaitPropagation(batch),
                self.settings.propagation_wait(),
            );
            return;
        }

        batch.state = batch.state.resolved();
        match batch.state {
            PropagationState::WaitingSettle => {
                info!(host = %host, "Entry present. Waiting a bit more");
                self.scheduler.schedule_once(
                    Step::AwaitPropagation(batch),
                    self.settings.propagation_settle(),
                );
            }
            PropagationState::Completing => {
                info!(host = %host, "Entry present. Completing the challenges");
                self.reconcile(batch).await;
            }
            PropagationState::WaitingForRecord => {
                // resolved() never goes back
                warn!(host = %host, "Batch fell back to waiting for its record");
                self.scheduler.schedule_once(
                    Step::AwaitPropagation(batch),
                    self.settings.propagation_wait(),
                );
            }
        }
    }
}
