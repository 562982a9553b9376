use ssz_derive::{Decode, Encode};
use ssz_types::{BitList, BitVector, FixedVector, VariableList};
use tree_hash_derive::TreeHash;

use crate::{
    phase0::consts::JustificationBitsLength,
    phase0::primitives::{
        CommitteeIndex, Epoch, Gwei, PublicKeyBytes, SignatureBytes, Slot, UnixSeconds,
        ValidatorIndex, H256,
    },
    preset::Preset,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Encode, Decode, TreeHash)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: H256,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Encode, Decode, TreeHash)]
pub struct SigningData {
    pub object_root: H256,
    pub domain: H256,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Encode, Decode, TreeHash)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: CommitteeIndex,
    pub beacon_block_root: H256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct Attestation<P: Preset> {
    pub aggregation_bits: BitList<P::MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct IndexedAttestation<P: Preset> {
    pub attesting_indices: VariableList<ValidatorIndex, P::MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct AggregateAndProof<P: Preset> {
    pub aggregator_index: ValidatorIndex,
    pub aggregate: Attestation<P>,
    pub selection_proof: SignatureBytes,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct SignedAggregateAndProof<P: Preset> {
    pub message: AggregateAndProof<P>,
    pub signature: SignatureBytes,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: H256,
    pub state_root: H256,
    pub body_root: H256,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct BeaconBlockBody<P: Preset> {
    // `graffiti` makes otherwise identical blocks distinct, which tests rely on.
    pub graffiti: H256,
    pub attestations: VariableList<Attestation<P>, P::MaxAttestationsPerBlock>,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct BeaconBlock<P: Preset> {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: H256,
    pub state_root: H256,
    pub body: BeaconBlockBody<P>,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct SignedBeaconBlock<P: Preset> {
    pub message: BeaconBlock<P>,
    pub signature: SignatureBytes,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct Validator {
    pub pubkey: PublicKeyBytes,
    pub effective_balance: Gwei,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
}

#[derive(Clone, Debug, Eq, PartialEq, Encode, Decode, TreeHash)]
pub struct BeaconState<P: Preset> {
    pub genesis_time: UnixSeconds,
    pub genesis_validators_root: H256,
    pub slot: Slot,
    pub latest_block_header: BeaconBlockHeader,
    pub block_roots: FixedVector<H256, P::SlotsPerHistoricalRoot>,
    pub state_roots: FixedVector<H256, P::SlotsPerHistoricalRoot>,
    pub historical_roots: VariableList<H256, P::HistoricalRootsLimit>,
    pub validators: VariableList<Validator, P::ValidatorRegistryLimit>,
    pub previous_epoch_participation: VariableList<u8, P::ValidatorRegistryLimit>,
    pub current_epoch_participation: VariableList<u8, P::ValidatorRegistryLimit>,
    pub justification_bits: BitVector<JustificationBitsLength>,
    pub previous_justified_checkpoint: Checkpoint,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
}

impl<P: Preset> Default for BeaconState<P> {
    fn default() -> Self {
        Self {
            genesis_time: 0,
            genesis_validators_root: H256::ZERO,
            slot: 0,
            latest_block_header: BeaconBlockHeader::default(),
            block_roots: FixedVector::default(),
            state_roots: FixedVector::default(),
            historical_roots: VariableList::default(),
            validators: VariableList::default(),
            previous_epoch_participation: VariableList::default(),
            current_epoch_participation: VariableList::default(),
            justification_bits: BitVector::default(),
            previous_justified_checkpoint: Checkpoint::default(),
            current_justified_checkpoint: Checkpoint::default(),
            finalized_checkpoint: Checkpoint::default(),
        }
    }
}

impl<P: Preset> SignedBeaconBlock<P> {
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.message.slot
    }

    #[must_use]
    pub fn parent_root(&self) -> H256 {
        self.message.parent_root
    }

    #[must_use]
    pub fn proposer_index(&self) -> ValidatorIndex {
        self.message.proposer_index
    }
}

impl<P: Preset> BeaconBlock<P> {
    /// The header with `state_root` as stored in `BeaconState.latest_block_header`
    /// at the start of block processing, before the post-state root is known.
    #[must_use]
    pub fn to_header(&self) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot: self.slot,
            proposer_index: self.proposer_index,
            parent_root: self.parent_root,
            state_root: H256::ZERO,
            body_root: tree_hash::TreeHash::tree_hash_root(&self.body),
        }
    }
}
