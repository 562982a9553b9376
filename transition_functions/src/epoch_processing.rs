use anyhow::Result;
use helper_functions::{accessors, misc, predicates};
use ssz_types::VariableList;
use tree_hash::TreeHash as _;
use typenum::Unsigned as _;
use types::{
    phase0::consts::{GENESIS_EPOCH, TIMELY_TARGET_FLAG},
    phase0::containers::{BeaconState, Checkpoint},
    phase0::primitives::{Epoch, Gwei, H256},
    preset::Preset,
};

use crate::error::Error;

/// Runs at every epoch boundary during slot processing, before the slot is
/// incremented into the new epoch.
pub fn process_epoch<P: Preset>(state: &mut BeaconState<P>) -> Result<()> {
    process_justification_and_finalization(state)?;
    process_historical_roots_update(state);
    rotate_participation(state);

    Ok(())
}

fn process_justification_and_finalization<P: Preset>(state: &mut BeaconState<P>) -> Result<()> {
    let current_epoch = accessors::get_current_epoch(state);

    // Both participation views are still unreliable in the first two epochs.
    if current_epoch <= GENESIS_EPOCH + 1 {
        return Ok(());
    }

    let previous_epoch = accessors::get_previous_epoch(state);
    let total_balance = accessors::total_active_balance(state, current_epoch);

    let previous_target_balance = target_balance(state, &state.previous_epoch_participation);
    let current_target_balance = target_balance(state, &state.current_epoch_participation);

    weigh_justification_and_finalization(
        state,
        previous_epoch,
        current_epoch,
        total_balance,
        previous_target_balance,
        current_target_balance,
    )
}

fn target_balance<P: Preset>(
    state: &BeaconState<P>,
    participation: &VariableList<u8, P::ValidatorRegistryLimit>,
) -> Gwei {
    participation
        .iter()
        .zip(state.validators.iter())
        .filter(|(flags, _)| predicates::has_flag(**flags, TIMELY_TARGET_FLAG))
        .map(|(_, validator)| validator.effective_balance)
        .sum()
}

fn weigh_justification_and_finalization<P: Preset>(
    state: &mut BeaconState<P>,
    previous_epoch: Epoch,
    current_epoch: Epoch,
    total_balance: Gwei,
    previous_target_balance: Gwei,
    current_target_balance: Gwei,
) -> Result<()> {
    let old_previous_justified = state.previous_justified_checkpoint;
    let old_current_justified = state.current_justified_checkpoint;

    state.previous_justified_checkpoint = state.current_justified_checkpoint;
    shift_justification_bits(state);

    if previous_target_balance * 3 >= total_balance * 2 {
        state.current_justified_checkpoint = Checkpoint {
            epoch: previous_epoch,
            root: epoch_boundary_block_root(state, previous_epoch)?,
        };

        state
            .justification_bits
            .set(1, true)
            .expect("justification bits are long enough");
    }

    if current_target_balance * 3 >= total_balance * 2 {
        state.current_justified_checkpoint = Checkpoint {
            epoch: current_epoch,
            root: epoch_boundary_block_root(state, current_epoch)?,
        };

        state
            .justification_bits
            .set(0, true)
            .expect("justification bits are long enough");
    }

    let bit = |index: usize| state.justification_bits.get(index).unwrap_or_default();

    // The 2nd/3rd/4th most recent epochs are justified, the 2nd using the 4th as source.
    if bit(1) && bit(2) && bit(3) && old_previous_justified.epoch + 3 == current_epoch {
        state.finalized_checkpoint = old_previous_justified;
    }

    // The 2nd/3rd most recent epochs are justified, the 2nd using the 3rd as source.
    if bit(1) && bit(2) && old_previous_justified.epoch + 2 == current_epoch {
        state.finalized_checkpoint = old_previous_justified;
    }

    // The 1st/2nd/3rd most recent epochs are justified, the 1st using the 3rd as source.
    if bit(0) && bit(1) && bit(2) && old_current_justified.epoch + 2 == current_epoch {
        state.finalized_checkpoint = old_current_justified;
    }

    // The 1st/2nd most recent epochs are justified, the 1st using the 2nd as source.
    if bit(0) && bit(1) && old_current_justified.epoch + 1 == current_epoch {
        state.finalized_checkpoint = old_current_justified;
    }

    Ok(())
}

fn shift_justification_bits<P: Preset>(state: &mut BeaconState<P>) {
    let length = state.justification_bits.len();

    for index in (1..length).rev() {
        let previous = state.justification_bits.get(index - 1).unwrap_or_default();

        state
            .justification_bits
            .set(index, previous)
            .expect("index is within justification bits length");
    }

    state
        .justification_bits
        .set(0, false)
        .expect("justification bits are not empty");
}

/// The block root in effect at the start of `epoch`, read from the ring buffer.
pub fn epoch_boundary_block_root<P: Preset>(
    state: &BeaconState<P>,
    epoch: Epoch,
) -> Result<H256, Error> {
    let slot = misc::compute_start_slot_at_epoch::<P>(epoch);

    if slot == state.slot {
        // The boundary block root for the slot being processed is the latest header.
        return Ok(accessors::latest_block_root(state));
    }

    if slot + P::SlotsPerHistoricalRoot::U64 <= state.slot || slot > state.slot {
        return Err(Error::BlockRootOutOfRange {
            slot,
            state_slot: state.slot,
        });
    }

    Ok(state.block_roots[(slot % P::SlotsPerHistoricalRoot::U64) as usize])
}

fn process_historical_roots_update<P: Preset>(state: &mut BeaconState<P>) {
    let next_slot = state.slot + 1;

    if next_slot % P::SlotsPerHistoricalRoot::U64 == 0 {
        // A full historical accumulator is unnecessary here. The block root
        // summary alone keeps the accrual observable and deterministic.
        let batch_root = state.block_roots.tree_hash_root();
        let _ = state.historical_roots.push(batch_root);
    }
}

fn rotate_participation<P: Preset>(state: &mut BeaconState<P>) {
    let empty = VariableList::from(vec![0_u8; state.validators.len()]);

    state.previous_epoch_participation =
        core::mem::replace(&mut state.current_epoch_participation, empty);
}
