use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use futures::channel::oneshot::Sender as OneshotSender;
use std_ext::ArcExt as _;
use strum::AsRefStr;
use types::{
    nonstandard::ValidationOutcome,
    phase0::containers::{
        Attestation, AttestationData, BeaconState, Checkpoint, SignedAggregateAndProof,
        SignedBeaconBlock,
    },
    phase0::primitives::{Epoch, Slot, SubnetId, ValidatorIndex, H256},
    preset::Preset,
};

/// A block accepted into the store together with its post-state and the
/// checkpoints its state carries.
#[derive(Clone, Debug)]
pub struct ChainLink<P: Preset> {
    pub block_root: H256,
    pub block: Arc<SignedBeaconBlock<P>>,
    pub state: Arc<BeaconState<P>>,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
}

impl<P: Preset> ChainLink<P> {
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.block.slot()
    }

    #[must_use]
    pub fn parent_root(&self) -> H256 {
        self.block.parent_root()
    }

    #[must_use]
    pub fn state(&self) -> Arc<BeaconState<P>> {
        self.state.clone_arc()
    }
}

#[derive(Clone, Copy, Debug, AsRefStr)]
pub enum SignatureStatus {
    Verified,
    Unverified,
}

impl SignatureStatus {
    #[must_use]
    pub const fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }
}

#[derive(Debug)]
pub struct AttestationItem<P: Preset, I> {
    pub item: Arc<Attestation<P>>,
    pub origin: AttestationOrigin<I>,
    pub signature_status: SignatureStatus,
    gossiped: bool,
    retried: bool,
}

impl<P: Preset, I> AttestationItem<P, I> {
    #[must_use]
    pub fn unverified(
        item: Arc<Attestation<P>>,
        origin: AttestationOrigin<I>,
    ) -> Self {
        Self {
            item,
            origin,
            signature_status: SignatureStatus::Unverified,
            gossiped: false,
            retried: false,
        }
    }

    #[must_use]
    pub fn verified(
        item: Arc<Attestation<P>>,
        origin: AttestationOrigin<I>,
    ) -> Self {
        Self {
            item,
            origin,
            signature_status: SignatureStatus::Verified,
            gossiped: false,
            retried: false,
        }
    }

    #[must_use]
    pub fn into_verified(self) -> Self {
        Self {
            signature_status: SignatureStatus::Verified,
            ..self
        }
    }

    /// Marks an attestation drained from the slot park. It is already one
    /// tick old, so the wait-one-tick rule no longer applies to it.
    #[must_use]
    pub fn into_retried(self) -> Self {
        Self {
            retried: true,
            ..self
        }
    }

    #[must_use]
    pub const fn is_retried(&self) -> bool {
        self.retried
    }

    /// An attestation transitions to gossiped at most once.
    /// Returns whether this call performed the transition.
    pub fn mark_gossiped(&mut self) -> bool {
        !core::mem::replace(&mut self.gossiped, true)
    }

    #[must_use]
    pub const fn is_gossiped(&self) -> bool {
        self.gossiped
    }

    #[must_use]
    pub fn verify_signatures(&self) -> bool {
        !self.signature_status.is_verified() && self.origin.verify_signatures()
    }

    #[must_use]
    pub fn slot(&self) -> Slot {
        self.data().slot
    }

    #[must_use]
    pub fn data(&self) -> AttestationData {
        self.item.data
    }
}

#[derive(Debug, AsRefStr)]
pub enum AttestationOrigin<I> {
    Gossip(SubnetId, I),
    Own(SubnetId),
    Api(SubnetId, OneshotSender<Result<ValidationOutcome>>),
    Block,
    Test,
}

impl<I> AttestationOrigin<I> {
    #[must_use]
    pub fn split(self) -> (Option<I>, Option<OneshotSender<Result<ValidationOutcome>>>) {
        match self {
            Self::Gossip(_, gossip_id) => (Some(gossip_id), None),
            Self::Api(_, sender) => (None, Some(sender)),
            Self::Own(_) | Self::Block | Self::Test => (None, None),
        }
    }

    #[must_use]
    pub const fn subnet_id(&self) -> Option<SubnetId> {
        match *self {
            Self::Gossip(subnet_id, _) | Self::Own(subnet_id) | Self::Api(subnet_id, _) => {
                Some(subnet_id)
            }
            Self::Block | Self::Test => None,
        }
    }

    #[must_use]
    pub const fn gossip_id_ref(&self) -> Option<&I> {
        match self {
            Self::Gossip(_, gossip_id) => Some(gossip_id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_from_block(&self) -> bool {
        matches!(self, Self::Block)
    }

    #[must_use]
    pub const fn produced_locally(&self) -> bool {
        matches!(self, Self::Own(_))
    }

    #[must_use]
    pub const fn validate_as_gossip(&self) -> bool {
        match self {
            Self::Gossip(_, _) | Self::Own(_) | Self::Api(_, _) | Self::Test => true,
            Self::Block => false,
        }
    }

    #[must_use]
    pub const fn must_be_singular(&self) -> bool {
        match self {
            Self::Gossip(_, _) | Self::Own(_) | Self::Api(_, _) => true,
            Self::Block | Self::Test => false,
        }
    }

    #[must_use]
    pub const fn verify_signatures(&self) -> bool {
        match self {
            Self::Gossip(_, _) | Self::Api(_, _) | Self::Test => true,
            // Attestations from blocks are verified during block processing.
            // Locally produced ones were just signed by this process.
            Self::Block | Self::Own(_) => false,
        }
    }

    #[must_use]
    pub const fn send_to_liveness_tracker(&self) -> bool {
        match self {
            Self::Gossip(_, _) | Self::Api(_, _) | Self::Own(_) => true,
            Self::Block | Self::Test => false,
        }
    }

    /// Subscribers only care about attestations that entered through the
    /// manager. Attestations swept out of block bodies are already public.
    #[must_use]
    pub const fn should_notify_subscribers(&self) -> bool {
        !matches!(self, Self::Block)
    }
}

#[derive(Debug, AsRefStr)]
pub enum AggregateAndProofOrigin<I> {
    Gossip(I),
    Own,
    Api(OneshotSender<Result<ValidationOutcome>>),
}

impl<I> AggregateAndProofOrigin<I> {
    #[must_use]
    pub fn split(self) -> (Option<I>, Option<OneshotSender<Result<ValidationOutcome>>>) {
        match self {
            Self::Gossip(gossip_id) => (Some(gossip_id), None),
            Self::Api(sender) => (None, Some(sender)),
            Self::Own => (None, None),
        }
    }

    #[must_use]
    pub const fn gossip_id_ref(&self) -> Option<&I> {
        match self {
            Self::Gossip(gossip_id) => Some(gossip_id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn produced_locally(&self) -> bool {
        matches!(self, Self::Own)
    }

    #[must_use]
    pub const fn verify_signatures(&self) -> bool {
        match self {
            Self::Gossip(_) | Self::Api(_) => true,
            Self::Own => false,
        }
    }
}

#[derive(Clone, Copy, Debug, AsRefStr)]
pub enum BlockOrigin {
    Gossip,
    Requested,
    Own,
    Persisted,
}

impl BlockOrigin {
    #[must_use]
    pub const fn verify_signatures(self) -> bool {
        match self {
            Self::Gossip | Self::Requested => true,
            Self::Own | Self::Persisted => false,
        }
    }
}

pub enum BlockAction<P: Preset> {
    Accept(ChainLink<P>),
    Ignore,
    DelayUntilParent(Arc<SignedBeaconBlock<P>>),
    DelayUntilSlot(Arc<SignedBeaconBlock<P>>),
}

pub enum AttestationAction<P: Preset, I> {
    Accept {
        attestation: AttestationItem<P, I>,
        attesting_indices: Vec<ValidatorIndex>,
    },
    Ignore(AttestationItem<P, I>),
    DelayUntilBlock(AttestationItem<P, I>, H256),
    DelayUntilSlot(AttestationItem<P, I>),
    DeferUntilNextSlot {
        attestation: AttestationItem<P, I>,
        attesting_indices: Vec<ValidatorIndex>,
    },
}

impl<P: Preset, I> AttestationAction<P, I> {
    #[must_use]
    pub fn into_verified(self) -> Self {
        match self {
            Self::Accept {
                attestation,
                attesting_indices,
            } => Self::Accept {
                attestation: attestation.into_verified(),
                attesting_indices,
            },
            Self::Ignore(attestation) => Self::Ignore(attestation.into_verified()),
            Self::DelayUntilBlock(attestation, block_root) => {
                Self::DelayUntilBlock(attestation.into_verified(), block_root)
            }
            Self::DelayUntilSlot(attestation) => Self::DelayUntilSlot(attestation.into_verified()),
            Self::DeferUntilNextSlot {
                attestation,
                attesting_indices,
            } => Self::DeferUntilNextSlot {
                attestation: attestation.into_verified(),
                attesting_indices,
            },
        }
    }
}

pub enum AggregateAndProofAction<P: Preset> {
    Accept {
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        attesting_indices: Vec<ValidatorIndex>,
    },
    Ignore,
    DelayUntilBlock(Arc<SignedAggregateAndProof<P>>, H256),
    DelayUntilSlot(Arc<SignedAggregateAndProof<P>>),
    DeferUntilNextSlot {
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        attesting_indices: Vec<ValidatorIndex>,
    },
}

/// A fully validated attestation reduced to what vote accounting needs.
#[derive(Clone, Debug)]
pub struct ValidAttestation {
    pub data: AttestationData,
    pub attesting_indices: Vec<ValidatorIndex>,
    pub is_from_block: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatestMessage {
    pub epoch: Epoch,
    pub beacon_block_root: H256,
}

/// A per-slot bucket of votes awaiting the next slot tick.
///
/// Votes are keyed by validator index, so resubmitting the same validator's
/// vote collapses into one entry.
#[derive(Clone, Debug, Default)]
pub struct DeferredVotes {
    pub votes: BTreeMap<ValidatorIndex, LatestMessage>,
}

impl DeferredVotes {
    pub fn add_votes(
        &mut self,
        attesting_indices: impl IntoIterator<Item = ValidatorIndex>,
        message: LatestMessage,
    ) {
        for validator_index in attesting_indices {
            self.votes.insert(validator_index, message);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.votes.len()
    }
}

pub enum ApplyTickChanges {
    TickUpdated,
    SlotUpdated,
}

impl ApplyTickChanges {
    #[must_use]
    pub const fn is_slot_updated(&self) -> bool {
        matches!(self, Self::SlotUpdated)
    }
}

pub enum ApplyBlockChanges<P: Preset> {
    CanonicalChainExtended {
        finalized_checkpoint_updated: bool,
    },
    Reorganized {
        finalized_checkpoint_updated: bool,
        old_head: ChainLink<P>,
    },
    AlternateChainExtended {
        finalized_checkpoint_updated: bool,
    },
}

impl<P: Preset> ApplyBlockChanges<P> {
    #[must_use]
    pub const fn is_finalized_checkpoint_updated(&self) -> bool {
        match self {
            Self::CanonicalChainExtended {
                finalized_checkpoint_updated,
            }
            | Self::Reorganized {
                finalized_checkpoint_updated,
                ..
            }
            | Self::AlternateChainExtended {
                finalized_checkpoint_updated,
            } => *finalized_checkpoint_updated,
        }
    }
}
