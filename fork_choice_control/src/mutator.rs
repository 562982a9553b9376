// `Mutator::run` is executed in a background thread and performs all mutations
// on a uniquely owned copy of `Store` as an alternative to locking. Queries
// operate on the latest published snapshot and never wait. Tasks submit their
// validation results through a channel, so everything that mutates the store
// or the waiting areas is serialized here.

use std::sync::{
    mpsc::{Receiver, Sender},
    Arc,
};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use clock::Tick;
use fork_choice_store::{
    AggregateAndProofAction, AggregateAndProofOrigin, ApplyBlockChanges, AttestationAction,
    AttestationItem, AttestationOrigin, BlockAction, BlockOrigin, ChainLink, DeferredVotes,
    LatestMessage, Store, ValidAttestation,
};
use futures::channel::oneshot::Sender as OneshotSender;
use helper_functions::misc;
use itertools::Itertools as _;
use log::{debug, info, warn};
use operation_pools::AttestationAggPool;
use std_ext::ArcExt as _;
use types::{
    nonstandard::ValidationOutcome,
    phase0::containers::SignedAggregateAndProof,
    phase0::primitives::{Slot, ValidatorIndex, H256},
    preset::Preset,
};

use crate::{
    messages::{LivenessMessage, MutatorMessage, P2pMessage},
    misc::{
        GossipId, MutatorRejectionReason, PendingAggregateAndProof, PendingAttestation,
        PendingBlock, VerifyAggregateAndProofResult, VerifyAttestationResult,
    },
    storage::Storage,
    subscribers::Subscribers,
    tasks::{AggregateAndProofTask, AttestationTask, BlockTask},
    thread_pool::ThreadPool,
    unbounded_sink::UnboundedSink,
    wait::Wait,
    waiting::{DeferredAttestations, Delayed, DelayedUntilBlock, DelayedUntilSlot},
};

pub struct Mutator<P: Preset, W, PS, LS> {
    store: Arc<Store<P>>,
    store_snapshot: Arc<ArcSwap<Store<P>>>,
    delayed_until_block: DelayedUntilBlock<P>,
    delayed_until_slot: DelayedUntilSlot<P>,
    deferred_attestations: DeferredAttestations,
    attestation_agg_pool: Arc<AttestationAggPool<P>>,
    subscribers: Arc<Subscribers<P>>,
    storage: Arc<Storage<P>>,
    thread_pool: ThreadPool<P, W>,
    mutator_tx: Sender<MutatorMessage<P, W>>,
    mutator_rx: Receiver<MutatorMessage<P, W>>,
    p2p_tx: PS,
    liveness_tx: LS,
}

impl<P, W, PS, LS> Mutator<P, W, PS, LS>
where
    P: Preset,
    W: Wait,
    PS: UnboundedSink<P2pMessage>,
    LS: UnboundedSink<LivenessMessage>,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        store_snapshot: Arc<ArcSwap<Store<P>>>,
        attestation_agg_pool: Arc<AttestationAggPool<P>>,
        subscribers: Arc<Subscribers<P>>,
        storage: Arc<Storage<P>>,
        thread_pool: ThreadPool<P, W>,
        mutator_tx: Sender<MutatorMessage<P, W>>,
        mutator_rx: Receiver<MutatorMessage<P, W>>,
        p2p_tx: PS,
        liveness_tx: LS,
    ) -> Self {
        let store = store_snapshot.load_full();
        let store_config = store.store_config();

        Self {
            store,
            store_snapshot,
            delayed_until_block: DelayedUntilBlock::new(
                store_config.max_delayed_until_block_roots,
            ),
            delayed_until_slot: DelayedUntilSlot::new(store_config.max_delayed_until_slot_buckets),
            deferred_attestations: DeferredAttestations::new(
                store_config.max_deferred_slot_buckets,
            ),
            attestation_agg_pool,
            subscribers,
            storage,
            thread_pool,
            mutator_tx,
            mutator_rx,
            p2p_tx,
            liveness_tx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            match self
                .mutator_rx
                .recv()
                .expect("sender in Controller is not dropped until mutator thread exits")
            {
                MutatorMessage::Tick { wait_group, tick } => self.handle_tick(&wait_group, tick)?,
                MutatorMessage::Block {
                    wait_group,
                    result,
                    origin,
                    block_root,
                } => self.handle_block(&wait_group, result, origin, block_root)?,
                MutatorMessage::Attestation { wait_group, result } => {
                    self.handle_attestation(&wait_group, result);
                }
                MutatorMessage::AttestationBatch {
                    wait_group,
                    results,
                } => {
                    for result in results {
                        self.handle_attestation(&wait_group, result);
                    }
                }
                MutatorMessage::AggregateAndProof { wait_group, result } => {
                    self.handle_aggregate_and_proof(&wait_group, result);
                }
                MutatorMessage::AggregateAndProofBatch {
                    wait_group,
                    results,
                } => {
                    for result in results {
                        self.handle_aggregate_and_proof(&wait_group, result);
                    }
                }
                MutatorMessage::Stop => {
                    P2pMessage::Stop.send(&self.p2p_tx);
                    LivenessMessage::Stop.send(&self.liveness_tx);
                    break Ok(());
                }
            }
        }
    }

    fn handle_tick(&mut self, wait_group: &W, tick: Tick) -> Result<()> {
        let Some(changes) = self.store_mut().apply_tick(tick) else {
            return Ok(());
        };

        self.update_store_snapshot();

        if changes.is_slot_updated() {
            let slot = tick.slot;

            // Deferred votes must be applied before the future park drains.
            self.apply_deferred_attestations(slot);

            self.delayed_until_slot.on_slot(slot);

            debug!("retrying objects delayed until slot {slot}");

            for mut delayed in self.delayed_until_slot.prune(slot).collect_vec() {
                // Attestations drained here are due at this very slot.
                // The wait-one-tick rule must not defer them again.
                delayed.attestations = delayed
                    .attestations
                    .into_iter()
                    .map(PendingAttestation::into_retried)
                    .collect();

                self.retry_delayed(delayed, wait_group);
            }

            self.attestation_agg_pool.on_slot(slot);

            P2pMessage::Slot(slot).send(&self.p2p_tx);
        }

        Ok(())
    }

    fn apply_deferred_attestations(&mut self, slot: Slot) {
        let buckets = self.deferred_attestations.prune(slot);

        if buckets.is_empty() {
            return;
        }

        let vote_count = buckets.iter().map(DeferredVotes::len).sum::<usize>();

        debug!("applying {vote_count} deferred votes at slot {slot}");

        let old_head = self.store_mut().apply_deferred_attestations(buckets);

        self.update_store_snapshot();

        if let Some(old_head) = old_head {
            self.log_head_change(&old_head);
        }
    }

    fn handle_block(
        &mut self,
        wait_group: &W,
        result: Result<BlockAction<P>>,
        origin: BlockOrigin,
        block_root: H256,
    ) -> Result<()> {
        match result {
            Ok(BlockAction::Accept(chain_link)) => {
                self.accept_block(wait_group, chain_link)?;
            }
            Ok(BlockAction::Ignore) => {
                debug!("block {block_root:?} ignored (origin: {origin:?})");
            }
            Ok(BlockAction::DelayUntilParent(block)) => {
                let parent_root = block.parent_root();

                if self.store.contains_block(parent_root) {
                    self.retry_block(wait_group.clone(), PendingBlock { block, origin });
                } else {
                    debug!("block {block_root:?} delayed until block {parent_root:?}");

                    P2pMessage::BlockNeeded(parent_root, None).send(&self.p2p_tx);

                    self.delayed_until_block
                        .delay_block(PendingBlock { block, origin });
                }
            }
            Ok(BlockAction::DelayUntilSlot(block)) => {
                let slot = block.slot();

                if slot <= self.store.slot() {
                    self.retry_block(wait_group.clone(), PendingBlock { block, origin });
                } else {
                    debug!("block {block_root:?} delayed until slot {slot}");

                    self.delayed_until_slot.delay(slot, |delayed| {
                        delayed.blocks.push(PendingBlock { block, origin });
                    });
                }
            }
            Err(error) => {
                warn!("block {block_root:?} rejected (error: {error}, origin: {origin:?})");
            }
        }

        Ok(())
    }

    fn accept_block(&mut self, wait_group: &W, chain_link: ChainLink<P>) -> Result<()> {
        let block_root = chain_link.block_root;
        let block = chain_link.block.clone_arc();
        let slot = chain_link.slot();
        let proposer_index = chain_link.block.proposer_index();
        let epoch = misc::compute_epoch_at_slot::<P>(slot);

        debug!("block {block_root:?} accepted (slot: {slot})");

        let changes = self.store_mut().apply_block(chain_link);

        if changes.is_finalized_checkpoint_updated() {
            let archived = self.store_mut().archive_finalized()?;

            self.storage.archive_finalized(&archived)?;

            self.attestation_agg_pool
                .prune_finalized(self.store.finalized_epoch());

            self.notify_about_finalized_checkpoint();
        }

        // The snapshot must be updated before tasks are spawned to retry
        // delayed objects, so they cannot observe the store without the block.
        self.update_store_snapshot();

        LivenessMessage::BlockImported {
            epoch,
            proposer_index,
        }
        .send(&self.liveness_tx);

        if let Some(delayed) = self.delayed_until_block.take(block_root) {
            debug!("retrying objects delayed until block {block_root:?}");
            self.retry_delayed(delayed, wait_group);
        }

        // Attestations carried in the block also count as fork choice votes.
        // Their signatures were verified during the state transition.
        for attestation in &block.message.body.attestations {
            self.thread_pool.spawn(AttestationTask {
                store_snapshot: self.owned_store(),
                mutator_tx: self.owned_mutator_tx(),
                wait_group: wait_group.clone(),
                attestation: AttestationItem::verified(
                    Arc::new(attestation.clone()),
                    AttestationOrigin::Block,
                ),
            });
        }

        if let ApplyBlockChanges::Reorganized { old_head, .. } = changes {
            self.log_head_change(&old_head);
        }

        Ok(())
    }

    fn handle_attestation(&mut self, wait_group: &W, result: VerifyAttestationResult<P>) {
        match result {
            Ok(AttestationAction::Accept {
                attestation,
                attesting_indices,
            }) => {
                self.accept_attestation(attestation, attesting_indices, false);
            }
            Ok(AttestationAction::Ignore(attestation)) => {
                let (gossip_id, sender) = attestation.origin.split();

                if let Some(gossip_id) = gossip_id {
                    P2pMessage::Ignore(gossip_id).send(&self.p2p_tx);
                }

                reply_to_http_api(sender, Ok(ValidationOutcome::Ignore));
            }
            Ok(AttestationAction::DelayUntilBlock(attestation, block_root)) => {
                self.delay_attestation_until_block(wait_group, attestation, block_root);
            }
            Ok(AttestationAction::DelayUntilSlot(attestation)) => {
                let slot = attestation.slot();

                if slot <= self.store.slot() {
                    self.retry_attestation(wait_group.clone(), attestation);
                } else {
                    debug!("attestation delayed until slot {slot}");

                    self.delayed_until_slot.delay(slot, |delayed| {
                        delayed.attestations.push(attestation);
                    });
                }
            }
            Ok(AttestationAction::DeferUntilNextSlot {
                attestation,
                attesting_indices,
            }) => {
                self.accept_attestation(attestation, attesting_indices, true);
            }
            Err(error) => {
                warn!("attestation rejected (error: {error})");

                let reason = error.to_string();
                let attestation = error.attestation();
                let (gossip_id, sender) = attestation.origin.split();

                if let Some(gossip_id) = gossip_id {
                    P2pMessage::Reject(gossip_id, MutatorRejectionReason::InvalidAttestation)
                        .send(&self.p2p_tx);
                }

                reply_to_http_api(sender, Err(anyhow!(reason)));
            }
        }
    }

    /// Common tail of SUCCESSFUL and DEFER_FORK_CHOICE_PROCESSING outcomes.
    /// The only difference is whether the votes go into the store now or into
    /// the deferred park until the next slot tick.
    fn accept_attestation(
        &mut self,
        mut attestation: PendingAttestation<P>,
        attesting_indices: Vec<ValidatorIndex>,
        defer: bool,
    ) {
        let data = attestation.data();
        let is_from_block = attestation.origin.is_from_block();
        let produced_locally = attestation.origin.produced_locally();

        if attestation.origin.send_to_liveness_tracker() {
            LivenessMessage::Attestation {
                epoch: data.target.epoch,
                attesting_indices: attesting_indices.clone(),
            }
            .send(&self.liveness_tx);
        }

        self.attestation_agg_pool
            .insert_attestation(attestation.item.clone_arc());

        if attestation.origin.should_notify_subscribers() {
            self.subscribers
                .notify_all_valid_attestations(&attestation.item);

            if produced_locally && attestation.mark_gossiped() {
                self.subscribers
                    .notify_attestations_to_send(&attestation.item);
            }
        }

        let (gossip_id, sender) = attestation.origin.split();

        if let Some(gossip_id) = gossip_id {
            P2pMessage::Accept(gossip_id).send(&self.p2p_tx);
        }

        reply_to_http_api(sender, Ok(ValidationOutcome::Accept));

        if defer {
            debug!(
                "deferring fork choice processing of attestation at slot {} to the next slot",
                data.slot,
            );

            self.deferred_attestations.add(
                data.slot + 1,
                attesting_indices,
                LatestMessage {
                    epoch: data.target.epoch,
                    beacon_block_root: data.beacon_block_root,
                },
            );

            return;
        }

        let old_head = self.store_mut().apply_attestation(ValidAttestation {
            data,
            attesting_indices,
            is_from_block,
        });

        self.update_store_snapshot();

        if let Some(old_head) = old_head {
            self.log_head_change(&old_head);
        }
    }

    fn delay_attestation_until_block(
        &mut self,
        wait_group: &W,
        attestation: PendingAttestation<P>,
        block_root: H256,
    ) {
        // The block may have arrived while the validation task was in flight.
        if self.store.contains_block(block_root) {
            self.retry_attestation(wait_group.clone(), attestation);
            return;
        }

        if self.delayed_until_block.contains_attestation(&attestation) {
            // A resubmission of an attestation already waiting on its block.
            // It is already saved for the future; do not re-gossip it.
            let (gossip_id, sender) = attestation.origin.split();

            if let Some(gossip_id) = gossip_id {
                P2pMessage::Ignore(gossip_id).send(&self.p2p_tx);
            }

            reply_to_http_api(sender, Ok(ValidationOutcome::SaveForFuture));

            return;
        }

        debug!("attestation delayed until block {block_root:?}");

        let peer_id = attestation
            .origin
            .gossip_id_ref()
            .map(|gossip_id| gossip_id.source);

        P2pMessage::BlockNeeded(block_root, peer_id).send(&self.p2p_tx);

        self.delayed_until_block
            .delay_attestation(attestation, block_root);
    }

    fn handle_aggregate_and_proof(
        &mut self,
        wait_group: &W,
        result: VerifyAggregateAndProofResult<P>,
    ) {
        let VerifyAggregateAndProofResult { result, origin } = result;

        match result {
            Ok(AggregateAndProofAction::Accept {
                aggregate_and_proof,
                attesting_indices,
            }) => {
                self.accept_aggregate_and_proof(
                    aggregate_and_proof,
                    origin,
                    attesting_indices,
                    false,
                );
            }
            Ok(AggregateAndProofAction::DeferUntilNextSlot {
                aggregate_and_proof,
                attesting_indices,
            }) => {
                self.accept_aggregate_and_proof(
                    aggregate_and_proof,
                    origin,
                    attesting_indices,
                    true,
                );
            }
            Ok(AggregateAndProofAction::Ignore) => {
                let (gossip_id, sender) = origin.split();

                if let Some(gossip_id) = gossip_id {
                    P2pMessage::Ignore(gossip_id).send(&self.p2p_tx);
                }

                reply_to_http_api(sender, Ok(ValidationOutcome::Ignore));
            }
            Ok(AggregateAndProofAction::DelayUntilBlock(aggregate_and_proof, block_root)) => {
                if self.store.contains_block(block_root) {
                    self.retry_aggregate_and_proof(
                        wait_group.clone(),
                        PendingAggregateAndProof {
                            aggregate_and_proof,
                            origin,
                        },
                    );
                    return;
                }

                debug!("aggregate and proof delayed until block {block_root:?}");

                let peer_id = origin.gossip_id_ref().map(|gossip_id| gossip_id.source);

                P2pMessage::BlockNeeded(block_root, peer_id).send(&self.p2p_tx);

                self.delayed_until_block.delay_aggregate(
                    PendingAggregateAndProof {
                        aggregate_and_proof,
                        origin,
                    },
                    block_root,
                );
            }
            Ok(AggregateAndProofAction::DelayUntilSlot(aggregate_and_proof)) => {
                let slot = aggregate_and_proof.message.aggregate.data.slot;

                if slot <= self.store.slot() {
                    self.retry_aggregate_and_proof(
                        wait_group.clone(),
                        PendingAggregateAndProof {
                            aggregate_and_proof,
                            origin,
                        },
                    );
                } else {
                    debug!("aggregate and proof delayed until slot {slot}");

                    self.delayed_until_slot.delay(slot, |delayed| {
                        delayed.aggregates.push(PendingAggregateAndProof {
                            aggregate_and_proof,
                            origin,
                        });
                    });
                }
            }
            Err(error) => {
                warn!("aggregate and proof rejected (error: {error})");

                let (gossip_id, sender) = origin.split();

                if let Some(gossip_id) = gossip_id {
                    P2pMessage::Reject(gossip_id, MutatorRejectionReason::InvalidAggregateAndProof)
                        .send(&self.p2p_tx);
                }

                reply_to_http_api(sender, Err(error));
            }
        }
    }

    fn accept_aggregate_and_proof(
        &mut self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        origin: AggregateAndProofOrigin<GossipId>,
        attesting_indices: Vec<ValidatorIndex>,
        defer: bool,
    ) {
        let aggregate = Arc::new(aggregate_and_proof.message.aggregate.clone());
        let data = aggregate.data;
        let produced_locally = origin.produced_locally();

        LivenessMessage::Attestation {
            epoch: data.target.epoch,
            attesting_indices: attesting_indices.clone(),
        }
        .send(&self.liveness_tx);

        self.attestation_agg_pool
            .insert_attestation(aggregate.clone_arc());

        self.subscribers.notify_all_valid_attestations(&aggregate);

        if produced_locally {
            self.subscribers.notify_attestations_to_send(&aggregate);
        }

        let (gossip_id, sender) = origin.split();

        if let Some(gossip_id) = gossip_id {
            P2pMessage::Accept(gossip_id).send(&self.p2p_tx);
        }

        reply_to_http_api(sender, Ok(ValidationOutcome::Accept));

        if defer {
            debug!(
                "deferring fork choice processing of aggregate at slot {} to the next slot",
                data.slot,
            );

            self.deferred_attestations.add(
                data.slot + 1,
                attesting_indices,
                LatestMessage {
                    epoch: data.target.epoch,
                    beacon_block_root: data.beacon_block_root,
                },
            );

            return;
        }

        let old_head = self.store_mut().apply_attestation(ValidAttestation {
            data,
            attesting_indices,
            is_from_block: false,
        });

        self.update_store_snapshot();

        if let Some(old_head) = old_head {
            self.log_head_change(&old_head);
        }
    }

    // `wait_group` is passed by reference not just for Clippy but for
    // correctness. The referenced value must not be dropped before the
    // current message is fully handled.
    fn retry_delayed(&self, delayed: Delayed<P>, wait_group: &W) {
        let Delayed {
            blocks,
            aggregates,
            attestations,
        } = delayed;

        for pending_block in blocks {
            self.retry_block(wait_group.clone(), pending_block);
        }

        for pending_aggregate_and_proof in aggregates {
            self.retry_aggregate_and_proof(wait_group.clone(), pending_aggregate_and_proof);
        }

        for pending_attestation in attestations {
            self.retry_attestation(wait_group.clone(), pending_attestation);
        }
    }

    fn retry_block(&self, wait_group: W, pending_block: PendingBlock<P>) {
        let PendingBlock { block, origin } = pending_block;

        self.thread_pool.spawn(BlockTask {
            store_snapshot: self.owned_store(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group,
            block,
            origin,
        });
    }

    // Retried attestations are resubmitted to fork choice directly.
    // Gossip-rule validation already happened before they were parked.
    fn retry_attestation(&self, wait_group: W, attestation: PendingAttestation<P>) {
        self.thread_pool.spawn(AttestationTask {
            store_snapshot: self.owned_store(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group,
            attestation,
        });
    }

    fn retry_aggregate_and_proof(
        &self,
        wait_group: W,
        pending_aggregate_and_proof: PendingAggregateAndProof<P>,
    ) {
        let PendingAggregateAndProof {
            aggregate_and_proof,
            origin,
        } = pending_aggregate_and_proof;

        self.thread_pool.spawn(AggregateAndProofTask {
            store_snapshot: self.owned_store(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group,
            aggregate_and_proof,
            origin,
        });
    }

    fn notify_about_finalized_checkpoint(&self) {
        let finalized_checkpoint = self.store.finalized_checkpoint();
        let head = self.store.head();

        info!(
            "new finalized checkpoint \
             (epoch: {}, root: {:?}, head slot: {}, head root: {:?})",
            finalized_checkpoint.epoch,
            finalized_checkpoint.root,
            head.slot(),
            head.block_root,
        );

        P2pMessage::FinalizedCheckpoint(finalized_checkpoint).send(&self.p2p_tx);
    }

    fn log_head_change(&self, old_head: &ChainLink<P>) {
        let new_head = self.store.head();

        info!(
            "chain reorganized (old head: {:?}, new head: {:?})",
            old_head.block_root, new_head.block_root,
        );
    }

    fn store_mut(&mut self) -> &mut Store<P> {
        Arc::make_mut(&mut self.store)
    }

    fn owned_store(&self) -> Arc<Store<P>> {
        self.store.clone_arc()
    }

    fn owned_mutator_tx(&self) -> Sender<MutatorMessage<P, W>> {
        self.mutator_tx.clone()
    }

    fn update_store_snapshot(&self) {
        self.store_snapshot.store(self.store.clone_arc());
    }
}

fn reply_to_http_api(
    sender: Option<OneshotSender<Result<ValidationOutcome>>>,
    reply: Result<ValidationOutcome>,
) {
    if let Some(sender) = sender {
        if sender.send(reply).is_err() {
            debug!("reply to HTTP API failed because the receiver was dropped");
        }
    }
}
