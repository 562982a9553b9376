use itertools::Itertools as _;
use types::{
    phase0::consts::DOMAIN_BEACON_ATTESTER,
    phase0::containers::{BeaconState, IndexedAttestation, Validator},
    phase0::primitives::{Epoch, ParticipationFlags},
    preset::Preset,
};

use crate::{
    accessors, misc,
    error::{Error, SignatureKind},
    verifier::Verifier,
};

#[must_use]
pub fn is_active_validator(validator: &Validator, epoch: Epoch) -> bool {
    validator.activation_epoch <= epoch && epoch < validator.exit_epoch
}

#[must_use]
pub const fn has_flag(participation: ParticipationFlags, flag: ParticipationFlags) -> bool {
    participation & flag == flag
}

/// Validates an indexed attestation constructed locally from a verified
/// committee lookup. Index bounds and ordering are checked unconditionally;
/// the signature goes through `verifier`, which may batch it.
pub fn validate_constructed_indexed_attestation<P: Preset>(
    state: &BeaconState<P>,
    indexed_attestation: &IndexedAttestation<P>,
    verifier: &mut impl Verifier,
) -> Result<(), Error> {
    let indices = &indexed_attestation.attesting_indices;

    if indices.is_empty() {
        return Err(Error::AttestationHasNoAttestingIndices);
    }

    let sorted_and_unique = indices
        .iter()
        .tuple_windows()
        .all(|(previous, next)| previous < next);

    if !sorted_and_unique {
        return Err(Error::AttestingIndicesNotSortedAndUnique);
    }

    let public_keys = indices
        .iter()
        .map(|validator_index| accessors::public_key(state, *validator_index))
        .collect::<Result<Vec<_>, _>>()?;

    let domain = misc::compute_domain(DOMAIN_BEACON_ATTESTER, state.genesis_validators_root);
    let signing_root = misc::compute_signing_root(&indexed_attestation.data, domain);

    verifier.verify_aggregate(
        signing_root,
        indexed_attestation.signature,
        public_keys,
        SignatureKind::Attestation,
    )
}
