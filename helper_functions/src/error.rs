use strum::AsRefStr;
use thiserror::Error;
use types::phase0::primitives::{CommitteeIndex, ValidatorIndex};

#[derive(Clone, Copy, Debug, AsRefStr)]
pub enum SignatureKind {
    AggregateAndProof,
    Attestation,
    Block,
    SelectionProof,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("attestation has no attesting indices")]
    AttestationHasNoAttestingIndices,
    #[error("attesting indices are not sorted and unique")]
    AttestingIndicesNotSortedAndUnique,
    #[error("aggregation bitlist length {bits} does not match committee size {committee}")]
    CommitteeLengthMismatch { bits: usize, committee: usize },
    #[error("committee index {index} is out of bounds ({committees_per_slot} committees per slot)")]
    CommitteeIndexOutOfBounds {
        index: CommitteeIndex,
        committees_per_slot: u64,
    },
    #[error("{kind:?} signature is invalid")]
    SignatureInvalid { kind: SignatureKind },
    #[error("validator index {validator_index} is out of bounds")]
    ValidatorIndexOutOfBounds { validator_index: ValidatorIndex },
}
