//! The three waiting areas owned by the mutator.
//!
//! Objects land here when the store reports that they cannot be processed
//! yet. Each area has a distinct trigger that drains it:
//! - [`DelayedUntilBlock`] is drained by the import of the block it keys on.
//! - [`DelayedUntilSlot`] is drained by slot ticks.
//! - [`DeferredAttestations`] holds votes for the current slot until the next
//!   slot tick.
//!
//! All three are bounded. Overflow evicts the oldest bucket, logged at debug.
//! None of them survive a restart; they are rebuilt from gossip.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use fork_choice_store::{DeferredVotes, LatestMessage};
use log::debug;
use tree_hash::TreeHash as _;
use types::{
    phase0::primitives::{Slot, ValidatorIndex, H256},
    preset::Preset,
};

use crate::misc::{PendingAggregateAndProof, PendingAttestation, PendingBlock};

/// Objects delayed until a single block root becomes known.
#[derive(Default)]
pub struct Delayed<P: Preset> {
    pub blocks: Vec<PendingBlock<P>>,
    pub aggregates: Vec<PendingAggregateAndProof<P>>,
    pub attestations: Vec<PendingAttestation<P>>,
}

impl<P: Preset> Delayed<P> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let Self {
            blocks,
            aggregates,
            attestations,
        } = self;

        blocks.is_empty() && aggregates.is_empty() && attestations.is_empty()
    }
}

/// The park keyed by required block root.
///
/// An attestation sits here iff the block it depends on is unknown locally.
/// `contains_attestation` is O(1) so duplicate submissions short-circuit.
pub struct DelayedUntilBlock<P: Preset> {
    max_roots: usize,
    delayed: HashMap<H256, Delayed<P>>,
    insertion_order: VecDeque<H256>,
    attestation_keys: HashSet<H256>,
}

impl<P: Preset> DelayedUntilBlock<P> {
    #[must_use]
    pub fn new(max_roots: usize) -> Self {
        Self {
            max_roots,
            delayed: HashMap::new(),
            insertion_order: VecDeque::new(),
            attestation_keys: HashSet::new(),
        }
    }

    #[must_use]
    pub fn contains_attestation(&self, attestation: &PendingAttestation<P>) -> bool {
        self.attestation_keys
            .contains(&attestation.item.tree_hash_root())
    }

    /// Parks an attestation. Returns `false` if an identical attestation is
    /// already waiting on some block.
    pub fn delay_attestation(&mut self, attestation: PendingAttestation<P>, block_root: H256) -> bool {
        let key = attestation.item.tree_hash_root();

        if !self.attestation_keys.insert(key) {
            return false;
        }

        self.bucket(block_root).attestations.push(attestation);
        true
    }

    pub fn delay_aggregate(
        &mut self,
        aggregate_and_proof: PendingAggregateAndProof<P>,
        block_root: H256,
    ) {
        self.bucket(block_root).aggregates.push(aggregate_and_proof);
    }

    pub fn delay_block(&mut self, pending_block: PendingBlock<P>) {
        let parent_root = pending_block.block.parent_root();
        self.bucket(parent_root).blocks.push(pending_block);
    }

    /// Removes and returns everything waiting on `block_root`.
    pub fn take(&mut self, block_root: H256) -> Option<Delayed<P>> {
        let delayed = self.delayed.remove(&block_root)?;

        self.insertion_order.retain(|root| *root != block_root);

        for attestation in &delayed.attestations {
            self.attestation_keys
                .remove(&attestation.item.tree_hash_root());
        }

        Some(delayed)
    }

    fn bucket(&mut self, block_root: H256) -> &mut Delayed<P> {
        if !self.delayed.contains_key(&block_root) {
            if self.delayed.len() >= self.max_roots {
                self.evict_oldest();
            }

            self.insertion_order.push_back(block_root);
        }

        self.delayed.entry(block_root).or_default()
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.insertion_order.pop_front() else {
            return;
        };

        if let Some(delayed) = self.delayed.remove(&oldest) {
            for attestation in &delayed.attestations {
                self.attestation_keys
                    .remove(&attestation.item.tree_hash_root());
            }

            debug!(
                "dropped objects delayed until block {oldest:?} \
                 ({} blocks, {} aggregates, {} attestations)",
                delayed.blocks.len(),
                delayed.aggregates.len(),
                delayed.attestations.len(),
            );
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.delayed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }
}

/// The park keyed by slot, for objects from slots the local clock has not
/// reached. The watermark advances on every slot tick; buckets at or before
/// it are returned by `prune`.
pub struct DelayedUntilSlot<P: Preset> {
    max_buckets: usize,
    watermark: Slot,
    buckets: BTreeMap<Slot, Delayed<P>>,
}

impl<P: Preset> DelayedUntilSlot<P> {
    #[must_use]
    pub fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets,
            watermark: 0,
            buckets: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn watermark(&self) -> Slot {
        self.watermark
    }

    pub fn on_slot(&mut self, slot: Slot) {
        self.watermark = self.watermark.max(slot);
    }

    /// Parks an object under `slot`. Stale slots are the caller's bug; the
    /// store only reports `DelayUntilSlot` for future slots.
    pub fn delay(&mut self, slot: Slot, insert: impl FnOnce(&mut Delayed<P>)) {
        debug_assert!(slot > self.watermark);

        insert(self.buckets.entry(slot).or_default());

        while self.buckets.len() > self.max_buckets {
            if let Some((slot, delayed)) = self.buckets.pop_first() {
                debug!(
                    "dropped objects delayed until slot {slot} \
                     ({} blocks, {} aggregates, {} attestations)",
                    delayed.blocks.len(),
                    delayed.aggregates.len(),
                    delayed.attestations.len(),
                );
            }
        }
    }

    /// Removes and returns every bucket with slot ≤ `slot`.
    pub fn prune(&mut self, slot: Slot) -> impl Iterator<Item = Delayed<P>> {
        let later = match slot.checked_add(1) {
            Some(next_slot) => self.buckets.split_off(&next_slot),
            None => BTreeMap::new(),
        };

        core::mem::replace(&mut self.buckets, later).into_values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Votes for the current slot, waiting one tick before being applied.
///
/// Buckets are keyed by the slot at which the votes become applicable.
/// Votes are aggregated per validator index, so duplicates collapse.
pub struct DeferredAttestations {
    max_buckets: usize,
    buckets: BTreeMap<Slot, DeferredVotes>,
}

impl DeferredAttestations {
    #[must_use]
    pub fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets,
            buckets: BTreeMap::new(),
        }
    }

    pub fn add(
        &mut self,
        applicable_slot: Slot,
        attesting_indices: impl IntoIterator<Item = ValidatorIndex>,
        message: LatestMessage,
    ) {
        self.buckets
            .entry(applicable_slot)
            .or_default()
            .add_votes(attesting_indices, message);

        while self.buckets.len() > self.max_buckets {
            if let Some((slot, votes)) = self.buckets.pop_first() {
                debug!(
                    "dropped {} deferred votes for slot {slot}",
                    votes.len(),
                );
            }
        }
    }

    /// Atomically removes and returns every bucket applicable at `slot`.
    pub fn prune(&mut self, slot: Slot) -> Vec<DeferredVotes> {
        let later = match slot.checked_add(1) {
            Some(next_slot) => self.buckets.split_off(&next_slot),
            None => BTreeMap::new(),
        };

        core::mem::replace(&mut self.buckets, later)
            .into_values()
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fork_choice_store::{AttestationItem, AttestationOrigin, LatestMessage};
    use ssz_types::BitList;
    use types::{
        phase0::containers::{Attestation, AttestationData},
        phase0::primitives::SignatureBytes,
        preset::Minimal,
    };

    use super::*;

    fn attestation_at_slot(slot: Slot) -> PendingAttestation<Minimal> {
        let attestation = Attestation {
            aggregation_bits: BitList::with_capacity(1).expect("length is under the limit"),
            data: AttestationData {
                slot,
                ..AttestationData::default()
            },
            signature: SignatureBytes::ZERO,
        };

        AttestationItem::unverified(Arc::new(attestation), AttestationOrigin::Test)
    }

    #[test]
    fn delayed_until_block_detects_duplicates() {
        let mut park = DelayedUntilBlock::<Minimal>::new(8);
        let root = H256::repeat_byte(1);

        assert!(park.delay_attestation(attestation_at_slot(3), root));
        assert!(park.contains_attestation(&attestation_at_slot(3)));
        assert!(!park.delay_attestation(attestation_at_slot(3), root));

        let delayed = park.take(root).expect("objects were parked under the root");

        assert_eq!(delayed.attestations.len(), 1);
        assert!(!park.contains_attestation(&attestation_at_slot(3)));
        assert!(park.is_empty());
    }

    #[test]
    fn delayed_until_block_evicts_oldest_root() {
        let mut park = DelayedUntilBlock::<Minimal>::new(2);

        park.delay_attestation(attestation_at_slot(1), H256::repeat_byte(1));
        park.delay_attestation(attestation_at_slot(2), H256::repeat_byte(2));
        park.delay_attestation(attestation_at_slot(3), H256::repeat_byte(3));

        assert_eq!(park.len(), 2);
        assert!(park.take(H256::repeat_byte(1)).is_none());
        assert!(!park.contains_attestation(&attestation_at_slot(1)));
        assert!(park.take(H256::repeat_byte(3)).is_some());
    }

    #[test]
    fn delayed_until_slot_prunes_up_to_and_including_the_slot() {
        let mut park = DelayedUntilSlot::<Minimal>::new(8);

        park.delay(5, |delayed| delayed.attestations.push(attestation_at_slot(5)));
        park.delay(6, |delayed| delayed.attestations.push(attestation_at_slot(6)));
        park.delay(9, |delayed| delayed.attestations.push(attestation_at_slot(9)));

        assert_eq!(park.prune(4).count(), 0);
        assert_eq!(park.prune(6).count(), 2);
        assert_eq!(park.len(), 1);

        park.on_slot(6);
        assert_eq!(park.watermark(), 6);
    }

    #[test]
    fn deferred_attestations_collapse_duplicate_votes() {
        let mut park = DeferredAttestations::new(4);

        let message = LatestMessage {
            epoch: 0,
            beacon_block_root: H256::repeat_byte(1),
        };

        park.add(4, [1, 2], message);
        park.add(4, [2, 3], message);

        let buckets = park.prune(4);

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].len(), 3);
        assert!(park.is_empty());
    }

    #[test]
    fn deferred_attestations_drain_atomically() {
        let mut park = DeferredAttestations::new(4);

        let message = LatestMessage {
            epoch: 0,
            beacon_block_root: H256::repeat_byte(1),
        };

        park.add(4, [1], message);
        park.add(5, [2], message);

        assert_eq!(park.prune(3).len(), 0);
        assert_eq!(park.prune(5).len(), 2);
        assert!(park.is_empty());
    }
}
