//! The pool of attestations available for block production.
//!
//! Attestations are grouped by target epoch and attestation data. Singular
//! attestations and aggregates are kept separately because they are consumed
//! differently: aggregates are served whole, singular attestations are left
//! for the proposer's packer to combine. The pool grows append-only within an
//! epoch and is trimmed on epoch boundaries and on finality.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use helper_functions::misc;
use itertools::Itertools as _;
use log::debug;
use parking_lot::RwLock;
use ssz_types::BitList;
use std_ext::ArcExt as _;
use types::{
    phase0::consts::GENESIS_EPOCH,
    phase0::containers::{Attestation, AttestationData},
    phase0::primitives::{AggregateSignatureBytes, Epoch, Slot},
    preset::Preset,
};

#[derive(Clone)]
struct Aggregate<P: Preset> {
    aggregation_bits: BitList<P::MaxValidatorsPerCommittee>,
    signature: AggregateSignatureBytes,
}

type AggregateMap<P> = HashMap<AttestationData, Vec<Aggregate<P>>>;
type AttestationMap<P> = HashMap<AttestationData, Vec<Arc<Attestation<P>>>>;

#[derive(Default)]
pub struct AttestationAggPool<P: Preset> {
    aggregates: RwLock<BTreeMap<Epoch, AggregateMap<P>>>,
    singular_attestations: RwLock<BTreeMap<Epoch, AttestationMap<P>>>,
}

impl<P: Preset> AttestationAggPool<P> {
    pub fn insert_attestation(&self, attestation: Arc<Attestation<P>>) {
        let data = attestation.data;
        let epoch = data.target.epoch;

        if attestation.aggregation_bits.num_set_bits() == 1 {
            let mut singular_attestations = self.singular_attestations.write();

            let attestations = singular_attestations
                .entry(epoch)
                .or_default()
                .entry(data)
                .or_default();

            let duplicate = attestations
                .iter()
                .any(|existing| existing.aggregation_bits == attestation.aggregation_bits);

            if !duplicate {
                attestations.push(attestation);
            }

            return;
        }

        let mut aggregates = self.aggregates.write();

        let aggregates = aggregates.entry(epoch).or_default().entry(data).or_default();

        // An aggregate no better than an existing one adds nothing.
        let superseded = aggregates.iter().any(|existing| {
            is_subset::<P>(&attestation.aggregation_bits, &existing.aggregation_bits)
        });

        if superseded {
            return;
        }

        // Conversely, the new aggregate may supersede older ones.
        aggregates
            .retain(|existing| !is_subset::<P>(&existing.aggregation_bits, &attestation.aggregation_bits));

        aggregates.push(Aggregate {
            aggregation_bits: attestation.aggregation_bits.clone(),
            signature: attestation.signature,
        });
    }

    #[must_use]
    pub fn best_aggregate_attestation(&self, data: AttestationData) -> Option<Attestation<P>> {
        self.aggregates
            .read()
            .get(&data.target.epoch)?
            .get(&data)?
            .iter()
            .max_by_key(|aggregate| aggregate.aggregation_bits.num_set_bits())
            .map(|aggregate| Attestation {
                aggregation_bits: aggregate.aggregation_bits.clone(),
                data,
                signature: aggregate.signature,
            })
    }

    #[must_use]
    pub fn singular_attestations(&self, data: AttestationData) -> Vec<Arc<Attestation<P>>> {
        self.singular_attestations
            .read()
            .get(&data.target.epoch)
            .and_then(|epoch_attestations| epoch_attestations.get(&data))
            .map(|attestations| {
                attestations
                    .iter()
                    .map(|attestation| attestation.clone_arc())
                    .collect_vec()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn aggregate_count(&self) -> usize {
        self.aggregates
            .read()
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Drops attestations too old to be included in any future block.
    pub fn on_slot(&self, slot: Slot) {
        if !misc::is_epoch_start::<P>(slot) {
            return;
        }

        let current_epoch = misc::compute_epoch_at_slot::<P>(slot);
        let previous_epoch = current_epoch.saturating_sub(1).max(GENESIS_EPOCH);

        let mut aggregates = self.aggregates.write();
        *aggregates = aggregates.split_off(&previous_epoch);

        let mut singular_attestations = self.singular_attestations.write();
        *singular_attestations = singular_attestations.split_off(&previous_epoch);
    }

    pub fn prune_finalized(&self, finalized_epoch: Epoch) {
        let mut aggregates = self.aggregates.write();
        let pruned = aggregates.len();
        *aggregates = aggregates.split_off(&finalized_epoch);
        let pruned = pruned - aggregates.len();

        let mut singular_attestations = self.singular_attestations.write();
        *singular_attestations = singular_attestations.split_off(&finalized_epoch);

        if pruned > 0 {
            debug!("pruned aggregates from {pruned} finalized epochs");
        }
    }
}

fn is_subset<P: Preset>(
    subset: &BitList<P::MaxValidatorsPerCommittee>,
    superset: &BitList<P::MaxValidatorsPerCommittee>,
) -> bool {
    subset.len() == superset.len()
        && subset
            .iter()
            .zip(superset.iter())
            .all(|(in_subset, in_superset)| !in_subset || in_superset)
}

#[cfg(test)]
mod tests {
    use types::{phase0::containers::Checkpoint, preset::Minimal};

    use super::*;

    fn attestation_with_bits(positions: &[usize], epoch: Epoch) -> Arc<Attestation<Minimal>> {
        let mut bits = BitList::with_capacity(8).expect("length is under the limit");

        for position in positions {
            bits.set(*position, true).expect("position is within length");
        }

        Arc::new(Attestation {
            aggregation_bits: bits,
            data: AttestationData {
                slot: epoch * 8,
                target: Checkpoint {
                    epoch,
                    ..Checkpoint::default()
                },
                ..AttestationData::default()
            },
            signature: AggregateSignatureBytes::ZERO,
        })
    }

    #[test]
    fn supersets_replace_subsets() {
        let pool = AttestationAggPool::<Minimal>::default();
        let data = attestation_with_bits(&[0, 1], 0).data;

        pool.insert_attestation(attestation_with_bits(&[0, 1], 0));
        pool.insert_attestation(attestation_with_bits(&[0, 1, 2], 0));
        // A subset of what is already known adds nothing.
        pool.insert_attestation(attestation_with_bits(&[1, 2], 0));

        assert_eq!(pool.aggregate_count(), 1);

        let best = pool
            .best_aggregate_attestation(data)
            .expect("aggregates were inserted");

        assert_eq!(best.aggregation_bits.num_set_bits(), 3);
    }

    #[test]
    fn singular_attestations_are_deduplicated() {
        let pool = AttestationAggPool::<Minimal>::default();
        let data = attestation_with_bits(&[3], 0).data;

        pool.insert_attestation(attestation_with_bits(&[3], 0));
        pool.insert_attestation(attestation_with_bits(&[3], 0));
        pool.insert_attestation(attestation_with_bits(&[4], 0));

        assert_eq!(pool.singular_attestations(data).len(), 2);
    }

    #[test]
    fn epoch_rollover_prunes_older_epochs() {
        let pool = AttestationAggPool::<Minimal>::default();

        pool.insert_attestation(attestation_with_bits(&[0, 1], 0));
        pool.insert_attestation(attestation_with_bits(&[0, 1], 2));

        // Start of epoch 3 keeps epochs 2 and 3 only.
        pool.on_slot(24);

        assert_eq!(pool.aggregate_count(), 1);
    }

    #[test]
    fn finalization_prunes_finalized_epochs() {
        let pool = AttestationAggPool::<Minimal>::default();

        pool.insert_attestation(attestation_with_bits(&[0, 1], 0));
        pool.insert_attestation(attestation_with_bits(&[0, 1], 1));

        pool.prune_finalized(1);

        assert_eq!(pool.aggregate_count(), 1);
    }
}
