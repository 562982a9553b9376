use core::fmt::Debug;

use thiserror::Error;
use types::{
    phase0::primitives::{Slot, SubnetId},
    preset::Preset,
};

use crate::misc::AttestationItem;

/// Validation failures that warrant dropping the attestation and penalizing
/// its source. The offending item is carried so the caller can recover the
/// origin and reply to it.
#[derive(Debug, Error)]
pub enum AttestationValidationError<P: Preset, I: Debug> {
    #[error("attestation votes for a block from a later slot (block slot: {block_slot})")]
    AttestationForFutureBlock {
        attestation: AttestationItem<P, I>,
        block_slot: Slot,
    },
    #[error("attestation target is not the epoch of its slot")]
    AttestationTargetsWrongEpoch { attestation: AttestationItem<P, I> },
    #[error("LMD vote is inconsistent with FFG vote target")]
    LmdGhostInconsistentWithFfgTarget { attestation: AttestationItem<P, I> },
    #[error("singular attestation has {set_bits} aggregation bits set")]
    SingularAttestationHasMultipleAggregationBitsSet {
        attestation: AttestationItem<P, I>,
        set_bits: usize,
    },
    #[error("attestation is on incorrect subnet (expected: {expected}, actual: {actual})")]
    SingularAttestationOnIncorrectSubnet {
        attestation: AttestationItem<P, I>,
        expected: SubnetId,
        actual: SubnetId,
    },
    #[error("attestation is invalid: {source}")]
    Invalid {
        attestation: AttestationItem<P, I>,
        source: helper_functions::error::Error,
    },
}

impl<P: Preset, I: Debug> AttestationValidationError<P, I> {
    #[must_use]
    pub fn attestation(self) -> AttestationItem<P, I> {
        match self {
            Self::AttestationForFutureBlock { attestation, .. }
            | Self::AttestationTargetsWrongEpoch { attestation }
            | Self::LmdGhostInconsistentWithFfgTarget { attestation }
            | Self::SingularAttestationHasMultipleAggregationBitsSet { attestation, .. }
            | Self::SingularAttestationOnIncorrectSubnet { attestation, .. }
            | Self::Invalid { attestation, .. } => attestation,
        }
    }
}
