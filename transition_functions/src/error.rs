use thiserror::Error;
use types::phase0::{
    containers::Checkpoint,
    primitives::{Epoch, Slot, ValidatorIndex, H256},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("attestation slot {attestation_slot} is outside the inclusion window at slot {state_slot}")]
    AttestationOutsideInclusionWindow {
        attestation_slot: Slot,
        state_slot: Slot,
    },
    #[error("attestation target {target:?} does not match the epoch of slot {slot}")]
    AttestationTargetsWrongEpoch { target: Checkpoint, slot: Slot },
    #[error("block parent root {in_block:?} does not match expected {computed:?}")]
    ParentRootMismatch { in_block: H256, computed: H256 },
    #[error("block root for slot {slot} is no longer in the ring buffer of the state at slot {state_slot}")]
    BlockRootOutOfRange { slot: Slot, state_slot: Slot },
    #[error("block slot {block_slot} does not match state slot {state_slot}")]
    SlotMismatch { block_slot: Slot, state_slot: Slot },
    #[error("state slot {current} is not earlier than target slot {target}")]
    SlotNotLater { current: Slot, target: Slot },
    #[error("proposer {in_block} is not the expected proposer for slot (expected {computed:?})")]
    UnexpectedProposer {
        in_block: ValidatorIndex,
        computed: Option<ValidatorIndex>,
    },
    #[error("attestation source {attestation_source:?} does not match the justified checkpoint {justified:?}")]
    SourceMismatch {
        attestation_source: Checkpoint,
        justified: Checkpoint,
    },
    #[error("target epoch {epoch} is neither the current nor the previous epoch")]
    TargetEpochOutOfRange { epoch: Epoch },
}
