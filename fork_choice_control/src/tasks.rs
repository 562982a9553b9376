use core::panic::AssertUnwindSafe;
use std::sync::{mpsc::Sender, Arc};

use fork_choice_store::{AggregateAndProofOrigin, AttestationItem, BlockOrigin, Store};
use tree_hash::TreeHash as _;
use types::{
    phase0::containers::{SignedAggregateAndProof, SignedBeaconBlock},
    preset::Preset,
};

use crate::{
    messages::MutatorMessage,
    misc::{GossipId, VerifyAggregateAndProofResult},
};

pub trait Run {
    fn run(self);

    fn run_and_handle_panics(self)
    where
        Self: Sized,
    {
        // All tasks should be unwind safe.
        // Running a task consumes it, making it impossible to observe any invalid state.
        std::panic::catch_unwind(AssertUnwindSafe(|| self.run())).unwrap_or_else(panics::log)
    }
}

pub struct BlockTask<P: Preset, W> {
    pub store_snapshot: Arc<Store<P>>,
    pub mutator_tx: Sender<MutatorMessage<P, W>>,
    pub wait_group: W,
    pub block: Arc<SignedBeaconBlock<P>>,
    pub origin: BlockOrigin,
}

impl<P: Preset, W> Run for BlockTask<P, W> {
    fn run(self) {
        let Self {
            store_snapshot,
            mutator_tx,
            wait_group,
            block,
            origin,
        } = self;

        let block_root = block.message.tree_hash_root();
        let result = store_snapshot.validate_block(block, origin);

        MutatorMessage::Block {
            wait_group,
            result,
            origin,
            block_root,
        }
        .send(&mutator_tx);
    }
}

pub struct AttestationTask<P: Preset, W> {
    pub store_snapshot: Arc<Store<P>>,
    pub mutator_tx: Sender<MutatorMessage<P, W>>,
    pub wait_group: W,
    pub attestation: AttestationItem<P, GossipId>,
}

impl<P: Preset, W> Run for AttestationTask<P, W> {
    fn run(self) {
        let Self {
            store_snapshot,
            mutator_tx,
            wait_group,
            attestation,
        } = self;

        let result = store_snapshot.validate_attestation(attestation, false);

        MutatorMessage::Attestation { wait_group, result }.send(&mutator_tx);
    }
}

pub struct AggregateAndProofTask<P: Preset, W> {
    pub store_snapshot: Arc<Store<P>>,
    pub mutator_tx: Sender<MutatorMessage<P, W>>,
    pub wait_group: W,
    pub aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
    pub origin: AggregateAndProofOrigin<GossipId>,
}

impl<P: Preset, W> Run for AggregateAndProofTask<P, W> {
    fn run(self) {
        let Self {
            store_snapshot,
            mutator_tx,
            wait_group,
            aggregate_and_proof,
            origin,
        } = self;

        let result =
            store_snapshot.validate_aggregate_and_proof(aggregate_and_proof, &origin, false);

        let result = VerifyAggregateAndProofResult { result, origin };

        MutatorMessage::AggregateAndProof { wait_group, result }.send(&mutator_tx);
    }
}
