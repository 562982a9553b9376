// Instead of mutating `Store` directly, the `on_*` methods spawn tasks that do
// so in the background. Query methods operate on a recent but potentially
// out-of-date snapshot of `Store`. This accomplishes 3 things:
// - Independent blocks and attestations can be processed in parallel.
// - Query methods do not need to wait.
// - The `on_*` methods return quickly and can thus be called from `async` tasks.
//
// The downside is that submitting the same object multiple times in quick
// succession will result in it being processed multiple times in parallel
// redundantly.

use core::panic::AssertUnwindSafe;
use std::{
    sync::{mpsc::Sender, Arc},
    thread::{Builder, JoinHandle},
};

use anyhow::{Context as _, Result};
use arc_swap::{ArcSwap, Guard};
use clock::Tick;
use crossbeam_utils::sync::WaitGroup;
use fork_choice_store::{
    AggregateAndProofOrigin, AttestationItem, AttestationOrigin, BlockOrigin,
    StateCacheProcessor, Store, StoreConfig,
};
use futures::channel::{mpsc::UnboundedReceiver, oneshot::Sender as OneshotSender};
use operation_pools::AttestationAggPool;
use std_ext::ArcExt as _;
use thiserror::Error;
use types::{
    nonstandard::ValidationOutcome,
    phase0::containers::{Attestation, BeaconState, SignedAggregateAndProof, SignedBeaconBlock},
    phase0::primitives::SubnetId,
    preset::Preset,
};

use crate::{
    messages::{AttestationVerifierMessage, LivenessMessage, MutatorMessage, P2pMessage},
    misc::{GossipId, VerifyAggregateAndProofResult, VerifyAttestationResult},
    mutator::Mutator,
    state_at_slot_cache::StateAtSlotCache,
    storage::Storage,
    subscribers::{SubscriptionId, Subscribers},
    tasks::{AggregateAndProofTask, AttestationTask, BlockTask},
    thread_pool::{Spawn, ThreadPool},
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

pub struct Controller<P: Preset, A, W: Wait> {
    // The latest consistent snapshot of the store.
    store_snapshot: Arc<ArcSwap<Store<P>>>,
    state_cache: Arc<StateCacheProcessor<P>>,
    state_at_slot_cache: Arc<StateAtSlotCache<P>>,
    storage: Arc<Storage<P>>,
    attestation_agg_pool: Arc<AttestationAggPool<P>>,
    subscribers: Arc<Subscribers<P>>,
    thread_pool: ThreadPool<P, W>,
    wait_group: W::Swappable,
    mutator_tx: Sender<MutatorMessage<P, W>>,
    attestation_verifier_tx: A,
}

impl<P: Preset, A, W: Wait> Drop for Controller<P, A, W> {
    fn drop(&mut self) {
        MutatorMessage::Stop.send(&self.mutator_tx);
    }
}

impl<P, A, W> Controller<P, A, W>
where
    P: Preset,
    A: UnboundedSink<AttestationVerifierMessage<P, W>>,
    W: Wait,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        store_config: StoreConfig,
        anchor_block: Arc<SignedBeaconBlock<P>>,
        anchor_state: Arc<BeaconState<P>>,
        tick: Tick,
        storage: Arc<Storage<P>>,
        attestation_agg_pool: Arc<AttestationAggPool<P>>,
        attestation_verifier_tx: A,
        p2p_tx: impl UnboundedSink<P2pMessage>,
        liveness_tx: impl UnboundedSink<LivenessMessage>,
    ) -> Result<(Arc<Self>, MutatorHandle<P, W>)> {
        let mut store = Store::new(store_config, anchor_block, anchor_state);

        let _changes = store.apply_tick(tick);

        let store_snapshot = Arc::new(ArcSwap::from_pointee(store));
        let subscribers = Arc::new(Subscribers::default());
        let thread_pool = ThreadPool::new()?;
        let (mutator_tx, mutator_rx) = std::sync::mpsc::channel();

        let mut mutator = Mutator::new(
            store_snapshot.clone_arc(),
            attestation_agg_pool.clone_arc(),
            subscribers.clone_arc(),
            storage.clone_arc(),
            thread_pool.clone(),
            mutator_tx.clone(),
            mutator_rx,
            p2p_tx,
            liveness_tx,
        );

        let join_handle = Builder::new().name("store-mutator".to_owned()).spawn(|| {
            // The closure should be unwind safe.
            // The instance of `Store` used by the mutator may become
            // inconsistent on a panic but cannot be observed because the
            // shared snapshot is only updated with consistent values.
            std::panic::catch_unwind(AssertUnwindSafe(move || mutator.run()))
                .map_err(panics::payload_into_error)
                .context(Error::MutatorPanicked)?
                .context(Error::MutatorFailed)
        })?;

        let controller = Arc::new(Self {
            store_snapshot,
            state_cache: Arc::new(StateCacheProcessor::default()),
            state_at_slot_cache: Arc::new(StateAtSlotCache::build()),
            storage,
            attestation_agg_pool,
            subscribers,
            thread_pool,
            wait_group: W::Swappable::default(),
            mutator_tx: mutator_tx.clone(),
            attestation_verifier_tx,
        });

        let mutator_handle = MutatorHandle {
            join_handle: Some(join_handle),
            mutator_tx,
        };

        Ok((controller, mutator_handle))
    }

    // This should be called at the start of every tick.
    // The fork choice rule does not need a precise timestamp.
    pub fn on_tick(&self, tick: Tick) {
        // Don't spawn a new task because it would have very little to do.
        // Don't check if the tick is newer because `Store` has to do it anyway.
        MutatorMessage::Tick {
            wait_group: self.owned_wait_group(),
            tick,
        }
        .send(&self.mutator_tx);
    }

    pub fn on_gossip_block(&self, block: Arc<SignedBeaconBlock<P>>) {
        self.spawn_block_task(block, BlockOrigin::Gossip);
    }

    pub fn on_requested_block(&self, block: Arc<SignedBeaconBlock<P>>) {
        self.spawn_block_task(block, BlockOrigin::Requested);
    }

    pub fn on_own_block(&self, block: Arc<SignedBeaconBlock<P>>) {
        self.spawn_block_task(block, BlockOrigin::Own);
    }

    pub fn on_gossip_attestation(
        &self,
        attestation: Arc<Attestation<P>>,
        subnet_id: SubnetId,
        gossip_id: GossipId,
    ) {
        AttestationVerifierMessage::Attestation {
            wait_group: self.owned_wait_group(),
            attestation: AttestationItem::unverified(
                attestation,
                AttestationOrigin::Gossip(subnet_id, gossip_id),
            ),
        }
        .send(&self.attestation_verifier_tx);
    }

    pub fn on_api_attestation(
        &self,
        attestation: Arc<Attestation<P>>,
        subnet_id: SubnetId,
        sender: OneshotSender<Result<ValidationOutcome>>,
    ) {
        AttestationVerifierMessage::Attestation {
            wait_group: self.owned_wait_group(),
            attestation: AttestationItem::unverified(
                attestation,
                AttestationOrigin::Api(subnet_id, sender),
            ),
        }
        .send(&self.attestation_verifier_tx);
    }

    /// Locally produced attestations skip the signature verification service.
    /// This process just signed them.
    pub fn on_own_attestation(&self, attestation: Arc<Attestation<P>>, subnet_id: SubnetId) {
        self.on_singular_attestation(AttestationItem::unverified(
            attestation,
            AttestationOrigin::Own(subnet_id),
        ));
    }

    pub fn on_singular_attestation(&self, attestation: AttestationItem<P, GossipId>) {
        self.spawn(AttestationTask {
            store_snapshot: self.owned_store_snapshot(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group: self.owned_wait_group(),
            attestation,
        });
    }

    pub fn on_attestation_batch(&self, results: Vec<VerifyAttestationResult<P>>) {
        if results.is_empty() {
            return;
        }

        MutatorMessage::AttestationBatch {
            wait_group: self.owned_wait_group(),
            results,
        }
        .send(&self.mutator_tx);
    }

    pub fn on_gossip_aggregate_and_proof(
        &self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        gossip_id: GossipId,
    ) {
        AttestationVerifierMessage::AggregateAndProof {
            wait_group: self.owned_wait_group(),
            aggregate_and_proof,
            origin: AggregateAndProofOrigin::Gossip(gossip_id),
        }
        .send(&self.attestation_verifier_tx);
    }

    pub fn on_api_aggregate_and_proof(
        &self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        sender: OneshotSender<Result<ValidationOutcome>>,
    ) {
        AttestationVerifierMessage::AggregateAndProof {
            wait_group: self.owned_wait_group(),
            aggregate_and_proof,
            origin: AggregateAndProofOrigin::Api(sender),
        }
        .send(&self.attestation_verifier_tx);
    }

    pub fn on_own_aggregate_and_proof(&self, aggregate_and_proof: Arc<SignedAggregateAndProof<P>>) {
        self.on_aggregate_and_proof(aggregate_and_proof, AggregateAndProofOrigin::Own);
    }

    pub fn on_aggregate_and_proof(
        &self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        origin: AggregateAndProofOrigin<GossipId>,
    ) {
        self.spawn(AggregateAndProofTask {
            store_snapshot: self.owned_store_snapshot(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group: self.owned_wait_group(),
            aggregate_and_proof,
            origin,
        });
    }

    pub fn on_aggregate_and_proof_batch(&self, results: Vec<VerifyAggregateAndProofResult<P>>) {
        if results.is_empty() {
            return;
        }

        MutatorMessage::AggregateAndProofBatch {
            wait_group: self.owned_wait_group(),
            results,
        }
        .send(&self.mutator_tx);
    }

    pub fn subscribe_to_all_valid_attestations(
        &self,
    ) -> (SubscriptionId, UnboundedReceiver<Arc<Attestation<P>>>) {
        self.subscribers.subscribe_to_all_valid_attestations()
    }

    pub fn subscribe_to_attestations_to_send(
        &self,
    ) -> (SubscriptionId, UnboundedReceiver<Arc<Attestation<P>>>) {
        self.subscribers.subscribe_to_attestations_to_send()
    }

    pub fn unsubscribe_from_all_valid_attestations(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe_from_all_valid_attestations(id);
    }

    pub fn unsubscribe_from_attestations_to_send(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe_from_attestations_to_send(id);
    }

    /// Stops the signature verification service first, then the mutator.
    pub fn stop(&self) {
        AttestationVerifierMessage::Stop.send(&self.attestation_verifier_tx);
        MutatorMessage::Stop.send(&self.mutator_tx);
    }

    #[must_use]
    pub fn attestation_agg_pool(&self) -> &Arc<AttestationAggPool<P>> {
        &self.attestation_agg_pool
    }

    pub(crate) fn spawn(&self, task: impl Spawn<P, W>) {
        self.thread_pool.spawn(task);
    }

    fn spawn_block_task(&self, block: Arc<SignedBeaconBlock<P>>, origin: BlockOrigin) {
        self.spawn(BlockTask {
            store_snapshot: self.owned_store_snapshot(),
            mutator_tx: self.owned_mutator_tx(),
            wait_group: self.owned_wait_group(),
            block,
            origin,
        });
    }

    pub(crate) fn store_snapshot(&self) -> Guard<Arc<Store<P>>> {
        self.store_snapshot.load()
    }

    pub(crate) fn owned_store_snapshot(&self) -> Arc<Store<P>> {
        self.store_snapshot.load_full()
    }

    pub(crate) fn storage(&self) -> &Storage<P> {
        &self.storage
    }

    pub(crate) const fn state_cache(&self) -> &Arc<StateCacheProcessor<P>> {
        &self.state_cache
    }

    pub(crate) const fn state_at_slot_cache(&self) -> &Arc<StateAtSlotCache<P>> {
        &self.state_at_slot_cache
    }

    pub(crate) fn owned_wait_group(&self) -> W {
        Wait::load_and_clone(&self.wait_group)
    }

    pub(crate) fn owned_mutator_tx(&self) -> Sender<MutatorMessage<P, W>> {
        self.mutator_tx.clone()
    }
}

impl<P, A> Controller<P, A, WaitGroup>
where
    P: Preset,
    A: UnboundedSink<AttestationVerifierMessage<P, WaitGroup>>,
{
    /// Waits until every submitted task and the mutator messages they produce
    /// have been fully handled. Only meaningful with [`WaitGroup`] waiting,
    /// which tests use.
    pub fn wait_for_tasks(&self) {
        let wait_group = core::mem::take(&mut *self.wait_group.lock());
        wait_group.wait();
    }
}

/// A wrapper over [`JoinHandle`] that can be used to wait for the mutator
/// thread to finish.
///
/// In normal operation the mutator thread should be joined explicitly using
/// [`MutatorHandle::join`]. Tests may drop [`MutatorHandle`], at which point
/// the mutator thread is joined implicitly.
pub struct MutatorHandle<P: Preset, W> {
    join_handle: Option<JoinHandle<Result<()>>>,
    mutator_tx: Sender<MutatorMessage<P, W>>,
}

impl<P: Preset, W> Drop for MutatorHandle<P, W> {
    fn drop(&mut self) {
        // Stop the mutator thread to avoid a deadlock if the corresponding
        // `Controller` hasn't been dropped yet.
        self.stop();

        let result = self.join_internal();

        if !std::thread::panicking() {
            result.expect("mutator thread should succeed when joined implicitly");
        }
    }
}

impl<P: Preset, W> MutatorHandle<P, W> {
    pub fn join(mut self) -> Result<()> {
        self.join_internal()
    }

    fn stop(&self) {
        MutatorMessage::Stop.send(&self.mutator_tx);
    }

    fn join_internal(&mut self) -> Result<()> {
        // Don't use `Option::expect` here.
        // `MutatorHandle::join_internal` is called twice in normal operation.
        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .join()
                .expect("mutator thread handles panics internally"),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("mutator panicked")]
    MutatorPanicked,
    #[error("mutator failed")]
    MutatorFailed,
}
