//! Tracks which validators have recently shown signs of life.
//!
//! A validator is considered live in an epoch if it published an attestation
//! voting in that epoch or proposed a block imported in it. Observations are
//! delivered by the attestation pipeline; queries come from API handlers
//! asking whether a doppelganger check or an exit is safe.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use fork_choice_control::LivenessMessage;
use futures::{channel::mpsc::UnboundedReceiver, StreamExt as _};
use log::debug;
use parking_lot::RwLock;
use types::phase0::primitives::{Epoch, ValidatorIndex};

/// How many epochs of observations are kept, current epoch included.
const TRACKED_EPOCHS: u64 = 2;

#[derive(Default)]
pub struct LivenessTracker {
    live: RwLock<BTreeMap<Epoch, HashSet<ValidatorIndex>>>,
}

impl LivenessTracker {
    pub fn on_attestation(
        &self,
        epoch: Epoch,
        attesting_indices: impl IntoIterator<Item = ValidatorIndex>,
    ) {
        let mut live = self.live.write();
        let seen = live.entry(epoch).or_default();

        seen.extend(attesting_indices);

        Self::prune(&mut live);
    }

    pub fn on_block_imported(&self, epoch: Epoch, proposer_index: ValidatorIndex) {
        let mut live = self.live.write();

        live.entry(epoch).or_default().insert(proposer_index);

        Self::prune(&mut live);
    }

    #[must_use]
    pub fn is_live(&self, validator_index: ValidatorIndex, epoch: Epoch) -> bool {
        self.live
            .read()
            .get(&epoch)
            .is_some_and(|seen| seen.contains(&validator_index))
    }

    fn prune(live: &mut BTreeMap<Epoch, HashSet<ValidatorIndex>>) {
        let Some(latest) = live.keys().next_back().copied() else {
            return;
        };

        let earliest_kept = latest.saturating_sub(TRACKED_EPOCHS - 1);
        *live = live.split_off(&earliest_kept);
    }
}

/// Drives a [`LivenessTracker`] from pipeline notifications.
pub struct LivenessService {
    tracker: Arc<LivenessTracker>,
    rx: UnboundedReceiver<LivenessMessage>,
}

impl LivenessService {
    #[must_use]
    pub const fn new(tracker: Arc<LivenessTracker>, rx: UnboundedReceiver<LivenessMessage>) -> Self {
        Self { tracker, rx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(message) = self.rx.next().await {
            match message {
                LivenessMessage::Attestation {
                    epoch,
                    attesting_indices,
                } => self.tracker.on_attestation(epoch, attesting_indices),
                LivenessMessage::BlockImported {
                    epoch,
                    proposer_index,
                } => self.tracker.on_block_imported(epoch, proposer_index),
                LivenessMessage::Stop => break,
            }
        }

        debug!("liveness service stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestations_and_proposals_mark_validators_live() {
        let tracker = LivenessTracker::default();

        tracker.on_attestation(3, [1, 2]);
        tracker.on_block_imported(3, 7);

        assert!(tracker.is_live(1, 3));
        assert!(tracker.is_live(7, 3));
        assert!(!tracker.is_live(1, 2));
        assert!(!tracker.is_live(3, 3));
    }

    #[test]
    fn observations_older_than_the_window_are_pruned() {
        let tracker = LivenessTracker::default();

        tracker.on_attestation(1, [1]);
        tracker.on_attestation(2, [2]);
        tracker.on_attestation(5, [3]);

        assert!(!tracker.is_live(1, 1));
        assert!(!tracker.is_live(2, 2));
        assert!(tracker.is_live(3, 5));
    }

    #[tokio::test]
    async fn service_applies_messages_until_stopped() -> Result<()> {
        let tracker = Arc::new(LivenessTracker::default());
        let (tx, rx) = futures::channel::mpsc::unbounded();

        let service = LivenessService::new(Arc::clone(&tracker), rx);

        tx.unbounded_send(LivenessMessage::Attestation {
            epoch: 1,
            attesting_indices: vec![4],
        })?;
        tx.unbounded_send(LivenessMessage::Stop)?;

        service.run().await?;

        assert!(tracker.is_live(4, 1));

        Ok(())
    }
}
