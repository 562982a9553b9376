use crate::phase0::primitives::{DomainType, Epoch, ParticipationFlags, Slot};

pub const GENESIS_SLOT: Slot = 0;
pub const GENESIS_EPOCH: Epoch = 0;
pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

/// Attestations older than this many slots are not propagated on gossip.
pub const ATTESTATION_PROPAGATION_SLOT_RANGE: u64 = 32;

pub const ATTESTATION_SUBNET_COUNT: u64 = 64;

pub const MIN_ATTESTATION_INCLUSION_DELAY: u64 = 1;

pub const DOMAIN_BEACON_PROPOSER: DomainType = DomainType::new([0, 0, 0, 0]);
pub const DOMAIN_BEACON_ATTESTER: DomainType = DomainType::new([1, 0, 0, 0]);
pub const DOMAIN_SELECTION_PROOF: DomainType = DomainType::new([5, 0, 0, 0]);
pub const DOMAIN_AGGREGATE_AND_PROOF: DomainType = DomainType::new([6, 0, 0, 0]);

pub const TIMELY_SOURCE_FLAG: ParticipationFlags = 0b001;
pub const TIMELY_TARGET_FLAG: ParticipationFlags = 0b010;
pub const TIMELY_HEAD_FLAG: ParticipationFlags = 0b100;

pub type JustificationBitsLength = typenum::U4;
