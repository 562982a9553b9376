use std::sync::{mpsc::Sender, Arc};

use anyhow::Result;
use clock::Tick;
use fork_choice_store::{
    AggregateAndProofOrigin, AttestationItem, BlockAction, BlockOrigin,
};
use log::debug;
use types::{
    phase0::containers::{Checkpoint, SignedAggregateAndProof},
    phase0::primitives::{Epoch, Slot, ValidatorIndex, H256},
    preset::Preset,
};

use crate::{
    misc::{GossipId, MutatorRejectionReason, PeerId, VerifyAggregateAndProofResult, VerifyAttestationResult},
    unbounded_sink::UnboundedSink,
};

pub enum AttestationVerifierMessage<P: Preset, W> {
    AggregateAndProof {
        wait_group: W,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        origin: AggregateAndProofOrigin<GossipId>,
    },
    Attestation {
        wait_group: W,
        attestation: AttestationItem<P, GossipId>,
    },
    Stop,
}

impl<P: Preset, W> AttestationVerifierMessage<P, W> {
    pub fn send(self, tx: &impl UnboundedSink<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to attestation verifier failed because the receiver was dropped");
        }
    }
}

pub enum MutatorMessage<P: Preset, W> {
    Tick {
        wait_group: W,
        tick: Tick,
    },
    Block {
        wait_group: W,
        result: Result<BlockAction<P>>,
        origin: BlockOrigin,
        block_root: H256,
    },
    Attestation {
        wait_group: W,
        result: VerifyAttestationResult<P>,
    },
    AttestationBatch {
        wait_group: W,
        results: Vec<VerifyAttestationResult<P>>,
    },
    AggregateAndProof {
        wait_group: W,
        result: VerifyAggregateAndProofResult<P>,
    },
    AggregateAndProofBatch {
        wait_group: W,
        results: Vec<VerifyAggregateAndProofResult<P>>,
    },
    // It doesn't make sense for this to have a `wait_group` field because this
    // is only sent when the corresponding `Controller` is dropped or stopped.
    Stop,
}

impl<P: Preset, W> MutatorMessage<P, W> {
    pub(crate) fn send(self, tx: &Sender<Self>) {
        // Don't log the value because it can contain entire `BeaconState`s.
        if tx.send(self).is_err() {
            // This can happen if the mutator thread exits early due to failure
            // or if a task completes after the `Controller` is dropped.
            debug!("send to mutator failed because the receiver was dropped");
        }
    }
}

pub enum P2pMessage {
    Slot(Slot),
    Accept(GossipId),
    Ignore(GossipId),
    Reject(GossipId, MutatorRejectionReason),
    BlockNeeded(H256, Option<PeerId>),
    FinalizedCheckpoint(Checkpoint),
    Stop,
}

impl P2pMessage {
    pub(crate) fn send(self, tx: &impl UnboundedSink<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to p2p failed because the receiver was dropped");
        }
    }
}

/// Out-edges for validator liveness tracking.
pub enum LivenessMessage {
    Attestation {
        epoch: Epoch,
        attesting_indices: Vec<ValidatorIndex>,
    },
    BlockImported {
        epoch: Epoch,
        proposer_index: ValidatorIndex,
    },
    Stop,
}

impl LivenessMessage {
    pub(crate) fn send(self, tx: &impl UnboundedSink<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to liveness tracker failed because the receiver was dropped");
        }
    }
}
