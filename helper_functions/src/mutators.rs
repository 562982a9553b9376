use types::{
    phase0::containers::BeaconState,
    phase0::primitives::{Epoch, ParticipationFlags, ValidatorIndex},
    preset::Preset,
};

use crate::accessors;

/// Sets participation flags for a validator in the epoch the flags belong to.
/// Flags for epochs other than the previous and current one are discarded.
pub fn add_participation_flags<P: Preset>(
    state: &mut BeaconState<P>,
    validator_index: ValidatorIndex,
    epoch: Epoch,
    flags: ParticipationFlags,
) {
    let current_epoch = accessors::get_current_epoch(state);
    let previous_epoch = accessors::get_previous_epoch(state);

    let participation = if epoch == current_epoch {
        &mut state.current_epoch_participation
    } else if epoch == previous_epoch {
        &mut state.previous_epoch_participation
    } else {
        return;
    };

    if let Some(entry) = participation.get_mut(validator_index as usize) {
        *entry |= flags;
    }
}
