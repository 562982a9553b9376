use core::fmt::Debug;
use core::hash::Hash;

use typenum::{Unsigned, U1099511627776, U128, U16777216, U2048, U32, U64, U8, U8192};

/// Compile-time constants that vary between presets.
///
/// Lengths that appear in SSZ containers are associated types so collection
/// types can be parameterized directly. Scalar limits are associated constants.
pub trait Preset:
    Copy + Clone + Debug + Default + Eq + PartialEq + Hash + Send + Sync + Unpin + 'static
{
    type SlotsPerEpoch: Unsigned + Clone + Debug + Eq + PartialEq + Send + Sync + Unpin + 'static;
    type SlotsPerHistoricalRoot: Unsigned
        + Clone
        + Debug
        + Eq
        + PartialEq
        + Send
        + Sync
        + Unpin
        + 'static;
    type HistoricalRootsLimit: Unsigned
        + Clone
        + Debug
        + Eq
        + PartialEq
        + Send
        + Sync
        + Unpin
        + 'static;
    type MaxAttestationsPerBlock: Unsigned
        + Clone
        + Debug
        + Eq
        + PartialEq
        + Send
        + Sync
        + Unpin
        + 'static;
    type MaxValidatorsPerCommittee: Unsigned
        + Clone
        + Debug
        + Eq
        + PartialEq
        + Send
        + Sync
        + Unpin
        + 'static;
    type ValidatorRegistryLimit: Unsigned
        + Clone
        + Debug
        + Eq
        + PartialEq
        + Send
        + Sync
        + Unpin
        + 'static;

    const MAX_COMMITTEES_PER_SLOT: u64;
    const TARGET_COMMITTEE_SIZE: u64;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Mainnet;

impl Preset for Mainnet {
    type SlotsPerEpoch = U32;
    type SlotsPerHistoricalRoot = U8192;
    type HistoricalRootsLimit = U16777216;
    type MaxAttestationsPerBlock = U128;
    type MaxValidatorsPerCommittee = U2048;
    type ValidatorRegistryLimit = U1099511627776;

    const MAX_COMMITTEES_PER_SLOT: u64 = 64;
    const TARGET_COMMITTEE_SIZE: u64 = 128;
}

/// The small preset used by tests. Epochs are 8 slots long, which makes
/// justification and finalization reachable in test chains of modest length.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Minimal;

impl Preset for Minimal {
    type SlotsPerEpoch = U8;
    type SlotsPerHistoricalRoot = U64;
    type HistoricalRootsLimit = U16777216;
    type MaxAttestationsPerBlock = U128;
    type MaxValidatorsPerCommittee = U2048;
    type ValidatorRegistryLimit = U1099511627776;

    const MAX_COMMITTEES_PER_SLOT: u64 = 4;
    const TARGET_COMMITTEE_SIZE: u64 = 4;
}
