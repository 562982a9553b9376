use core::ops::Range;

use tree_hash::TreeHash;
use typenum::Unsigned as _;
use types::{
    phase0::consts::ATTESTATION_SUBNET_COUNT,
    phase0::containers::SigningData,
    phase0::primitives::{CommitteeIndex, Domain, DomainType, Epoch, Slot, SubnetId, H256},
    preset::Preset,
};

use crate::error::Error;

#[must_use]
pub fn compute_epoch_at_slot<P: Preset>(slot: Slot) -> Epoch {
    slot / P::SlotsPerEpoch::U64
}

#[must_use]
pub const fn compute_start_slot_at_epoch<P: Preset>(epoch: Epoch) -> Slot {
    epoch.saturating_mul(P::SlotsPerEpoch::U64)
}

#[must_use]
pub fn is_epoch_start<P: Preset>(slot: Slot) -> bool {
    slots_since_epoch_start::<P>(slot) == 0
}

#[must_use]
pub fn slots_since_epoch_start<P: Preset>(slot: Slot) -> u64 {
    slot - compute_start_slot_at_epoch::<P>(compute_epoch_at_slot::<P>(slot))
}

#[must_use]
pub const fn slots_in_epoch<P: Preset>(epoch: Epoch) -> Range<Slot> {
    compute_start_slot_at_epoch::<P>(epoch)..compute_start_slot_at_epoch::<P>(epoch + 1)
}

pub fn compute_subnet_for_attestation<P: Preset>(
    committees_per_slot: u64,
    slot: Slot,
    committee_index: CommitteeIndex,
) -> Result<SubnetId, Error> {
    if committee_index >= committees_per_slot {
        return Err(Error::CommitteeIndexOutOfBounds {
            index: committee_index,
            committees_per_slot,
        });
    }

    let slots_since_epoch_start = slots_since_epoch_start::<P>(slot);
    let committees_since_epoch_start = committees_per_slot * slots_since_epoch_start;

    Ok((committees_since_epoch_start + committee_index) % ATTESTATION_SUBNET_COUNT)
}

/// Mixes the domain type with the genesis validators root.
///
/// This chain has a single fork, so the full fork-data construction collapses
/// to the genesis validators root.
#[must_use]
pub fn compute_domain(domain_type: DomainType, genesis_validators_root: H256) -> Domain {
    let mut domain = [0; 32];
    domain[..4].copy_from_slice(domain_type.as_slice());
    domain[4..].copy_from_slice(&genesis_validators_root.as_slice()[..28]);
    H256::from(domain)
}

#[must_use]
pub fn compute_signing_root(object: &impl TreeHash, domain: Domain) -> H256 {
    SigningData {
        object_root: object.tree_hash_root(),
        domain,
    }
    .tree_hash_root()
}

#[cfg(test)]
mod tests {
    use types::preset::Minimal;

    use super::*;

    #[test]
    fn epoch_arithmetic() {
        assert_eq!(compute_epoch_at_slot::<Minimal>(0), 0);
        assert_eq!(compute_epoch_at_slot::<Minimal>(7), 0);
        assert_eq!(compute_epoch_at_slot::<Minimal>(8), 1);
        assert_eq!(compute_start_slot_at_epoch::<Minimal>(2), 16);
        assert!(is_epoch_start::<Minimal>(16));
        assert!(!is_epoch_start::<Minimal>(17));
        assert_eq!(slots_since_epoch_start::<Minimal>(19), 3);
        assert_eq!(slots_in_epoch::<Minimal>(1), 8..16);
    }

    #[test]
    fn subnet_rejects_out_of_range_committee_index() {
        assert!(compute_subnet_for_attestation::<Minimal>(2, 5, 2).is_err());
        assert!(compute_subnet_for_attestation::<Minimal>(2, 5, 1).is_ok());
    }

    #[test]
    fn domains_differ_by_type() {
        let root = H256::repeat_byte(3);

        assert_ne!(
            compute_domain(types::phase0::consts::DOMAIN_BEACON_ATTESTER, root),
            compute_domain(types::phase0::consts::DOMAIN_BEACON_PROPOSER, root),
        );
    }
}
