use anyhow::{ensure, Result};
use helper_functions::misc;
use tree_hash::TreeHash as _;
use typenum::Unsigned as _;
use types::{phase0::containers::BeaconState, phase0::primitives::Slot, preset::Preset};

use crate::{epoch_processing, error::Error};

/// Advances `state` through empty slots up to and including `slot`.
///
/// Epoch processing runs when the advance crosses an epoch boundary. The
/// function is deterministic; two advances of equal states to the same slot
/// produce equal states.
pub fn process_slots<P: Preset>(state: &mut BeaconState<P>, slot: Slot) -> Result<()> {
    ensure!(
        state.slot < slot,
        Error::SlotNotLater {
            current: state.slot,
            target: slot,
        },
    );

    while state.slot < slot {
        process_slot(state);

        if misc::is_epoch_start::<P>(state.slot + 1) {
            epoch_processing::process_epoch(state)?;
        }

        state.slot += 1;
    }

    Ok(())
}

/// Caches the roots of the slot being left behind into the ring buffers.
fn process_slot<P: Preset>(state: &mut BeaconState<P>) {
    let ring_index = (state.slot % P::SlotsPerHistoricalRoot::U64) as usize;

    let previous_state_root = state.tree_hash_root();
    state.state_roots[ring_index] = previous_state_root;

    if state.latest_block_header.state_root.is_zero() {
        state.latest_block_header.state_root = previous_state_root;
    }

    state.block_roots[ring_index] = state.latest_block_header.tree_hash_root();
}
