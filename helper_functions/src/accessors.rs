use itertools::Itertools as _;
use ssz_types::VariableList;
use tree_hash::TreeHash as _;
use types::{
    phase0::consts::GENESIS_EPOCH,
    phase0::containers::{Attestation, BeaconState, IndexedAttestation},
    phase0::primitives::{
        CommitteeIndex, Epoch, Gwei, PublicKeyBytes, Slot, ValidatorIndex, H256,
    },
    preset::Preset,
};
use typenum::Unsigned as _;

use crate::{error::Error, misc, predicates};

#[must_use]
pub fn get_current_epoch<P: Preset>(state: &BeaconState<P>) -> Epoch {
    misc::compute_epoch_at_slot::<P>(state.slot)
}

#[must_use]
pub fn get_previous_epoch<P: Preset>(state: &BeaconState<P>) -> Epoch {
    get_current_epoch(state)
        .checked_sub(1)
        .unwrap_or(GENESIS_EPOCH)
}

pub fn active_validator_indices<P: Preset>(
    state: &BeaconState<P>,
    epoch: Epoch,
) -> impl Iterator<Item = ValidatorIndex> + '_ {
    state
        .validators
        .iter()
        .enumerate()
        .filter(move |(_, validator)| predicates::is_active_validator(validator, epoch))
        .map(|(index, _)| index as ValidatorIndex)
}

#[must_use]
pub fn total_active_balance<P: Preset>(state: &BeaconState<P>, epoch: Epoch) -> Gwei {
    let sum = active_validator_indices(state, epoch)
        .map(|index| state.validators[index as usize].effective_balance)
        .sum();

    // Guards divisions performed by callers computing justification thresholds.
    core::cmp::max(1, sum)
}

#[must_use]
pub fn get_committee_count_per_slot<P: Preset>(state: &BeaconState<P>, epoch: Epoch) -> u64 {
    let active_count = active_validator_indices(state, epoch).count() as u64;

    (active_count / P::SlotsPerEpoch::U64 / P::TARGET_COMMITTEE_SIZE)
        .clamp(1, P::MAX_COMMITTEES_PER_SLOT)
}

/// Returns the committee assigned to `(slot, committee_index)`.
///
/// Committees are index-ordered partitions of the active validator set. The
/// partition is deterministic for a given state, which is all that vote
/// accounting requires.
pub fn beacon_committee<P: Preset>(
    state: &BeaconState<P>,
    slot: Slot,
    committee_index: CommitteeIndex,
) -> Result<Vec<ValidatorIndex>, Error> {
    let epoch = misc::compute_epoch_at_slot::<P>(slot);
    let committees_per_slot = get_committee_count_per_slot(state, epoch);

    if committee_index >= committees_per_slot {
        return Err(Error::CommitteeIndexOutOfBounds {
            index: committee_index,
            committees_per_slot,
        });
    }

    let active = active_validator_indices(state, epoch).collect_vec();
    let committees_in_epoch = committees_per_slot * P::SlotsPerEpoch::U64;
    let position = misc::slots_since_epoch_start::<P>(slot) * committees_per_slot + committee_index;

    let start = active.len() as u64 * position / committees_in_epoch;
    let end = active.len() as u64 * (position + 1) / committees_in_epoch;

    Ok(active[start as usize..end as usize].to_vec())
}

/// Expands an attestation's aggregation bits into validator indices.
pub fn get_indexed_attestation<P: Preset>(
    state: &BeaconState<P>,
    attestation: &Attestation<P>,
) -> Result<IndexedAttestation<P>, Error> {
    let committee = beacon_committee(state, attestation.data.slot, attestation.data.index)?;

    let bits = &attestation.aggregation_bits;

    if bits.len() != committee.len() {
        return Err(Error::CommitteeLengthMismatch {
            bits: bits.len(),
            committee: committee.len(),
        });
    }

    let mut attesting_indices = committee
        .into_iter()
        .enumerate()
        .filter(|(position, _)| bits.get(*position).unwrap_or_default())
        .map(|(_, validator_index)| validator_index)
        .collect_vec();

    attesting_indices.sort_unstable();

    Ok(IndexedAttestation {
        attesting_indices: VariableList::from(attesting_indices),
        data: attestation.data,
        signature: attestation.signature,
    })
}

pub fn public_key<P: Preset>(
    state: &BeaconState<P>,
    validator_index: ValidatorIndex,
) -> Result<PublicKeyBytes, Error> {
    state
        .validators
        .get(validator_index as usize)
        .map(|validator| validator.pubkey)
        .ok_or(Error::ValidatorIndexOutOfBounds { validator_index })
}

/// Deterministic round-robin proposer selection over the active set.
pub fn get_beacon_proposer_index<P: Preset>(
    state: &BeaconState<P>,
    slot: Slot,
) -> Option<ValidatorIndex> {
    let epoch = misc::compute_epoch_at_slot::<P>(slot);
    let active = active_validator_indices(state, epoch).collect_vec();

    if active.is_empty() {
        return None;
    }

    Some(active[slot as usize % active.len()])
}

/// The root of the latest block header, with the state root filled in if block
/// processing has not done so yet.
#[must_use]
pub fn latest_block_root<P: Preset>(state: &BeaconState<P>) -> H256 {
    let mut header = state.latest_block_header;

    if header.state_root.is_zero() {
        header.state_root = state.tree_hash_root();
    }

    header.tree_hash_root()
}

#[cfg(test)]
mod tests {
    use types::{phase0::containers::Validator, preset::Minimal};

    use super::*;

    fn state_with_validators(count: usize) -> BeaconState<Minimal> {
        let validators = (0..count)
            .map(|index| Validator {
                pubkey: PublicKeyBytes::repeat_byte(index as u8),
                effective_balance: 32_000_000_000,
                activation_epoch: 0,
                exit_epoch: u64::MAX,
            })
            .collect_vec();

        BeaconState {
            validators: VariableList::from(validators),
            ..BeaconState::default()
        }
    }

    #[test]
    fn committees_partition_the_active_set() -> Result<(), Error> {
        let state = state_with_validators(64);
        let epoch = 0;
        let committees_per_slot = get_committee_count_per_slot(&state, epoch);

        let mut assigned = vec![];

        for slot in misc::slots_in_epoch::<Minimal>(epoch) {
            for index in 0..committees_per_slot {
                let committee = beacon_committee(&state, slot, index)?;
                assert!(!committee.is_empty());
                assigned.extend(committee);
            }
        }

        assigned.sort_unstable();

        assert_eq!(assigned, (0..64).collect_vec());

        Ok(())
    }

    #[test]
    fn committee_index_out_of_bounds_is_rejected() {
        let state = state_with_validators(8);

        assert!(beacon_committee(&state, 0, 64).is_err());
    }

    #[test]
    fn exited_validators_are_not_active() {
        let mut state = state_with_validators(4);
        state.validators[0].exit_epoch = 0;

        assert_eq!(active_validator_indices(&state, 0).collect_vec(), [1, 2, 3]);
    }
}
