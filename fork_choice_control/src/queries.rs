use std::sync::Arc;

use anyhow::Result;
use arc_swap::Guard;
use fork_choice_store::{
    AggregateAndProofOrigin, AttestationItem, Store,
};
use itertools::Itertools as _;
use log::debug;
use std_ext::ArcExt as _;
use tree_hash::TreeHash as _;
use types::{
    nonstandard::WithStatus,
    phase0::containers::{BeaconState, Checkpoint, SignedAggregateAndProof, SignedBeaconBlock},
    phase0::primitives::{Epoch, Slot, H256},
    preset::Preset,
};

use crate::{
    controller::Controller,
    messages::AttestationVerifierMessage,
    misc::{GossipId, VerifyAggregateAndProofResult, VerifyAttestationResult},
    storage::Storage,
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

// Some of the methods defined here may take a while to execute.
// Do not call them directly in `async` tasks.
// Use something like `tokio::task::spawn_blocking`.
impl<P, A, W> Controller<P, A, W>
where
    P: Preset,
    A: UnboundedSink<AttestationVerifierMessage<P, W>>,
    W: Wait,
{
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.store_snapshot().slot()
    }

    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        self.store_snapshot().finalized_epoch()
    }

    #[must_use]
    pub fn finalized_root(&self) -> H256 {
        self.store_snapshot().finalized_root()
    }

    #[must_use]
    pub fn justified_checkpoint(&self) -> Checkpoint {
        self.store_snapshot().justified_checkpoint()
    }

    #[must_use]
    pub fn head_slot(&self) -> Slot {
        self.store_snapshot().head().slot()
    }

    #[must_use]
    pub fn head_block_root(&self) -> H256 {
        self.store_snapshot().head().block_root
    }

    #[must_use]
    pub fn head_block(&self) -> Arc<SignedBeaconBlock<P>> {
        self.store_snapshot().head().block.clone_arc()
    }

    #[must_use]
    pub fn head_state(&self) -> Arc<BeaconState<P>> {
        self.store_snapshot().head().state()
    }

    #[must_use]
    pub fn last_finalized_block_slot(&self) -> Slot {
        self.store_snapshot().latest_finalized_block_slot()
    }

    /// Whether everything at `slot` is irrevocable:
    /// the finalized epoch's start slot is at or after `slot`.
    #[must_use]
    pub fn is_finalized(&self, slot: Slot) -> bool {
        self.store_snapshot().is_slot_finalized(slot)
    }

    pub fn block_by_root(
        &self,
        block_root: H256,
    ) -> Result<Option<WithStatus<Arc<SignedBeaconBlock<P>>>>> {
        let store = self.store_snapshot();

        if let Some(chain_link) = store.chain_link(block_root) {
            return Ok(Some(WithStatus {
                value: chain_link.block.clone_arc(),
                finalized: store.is_slot_finalized(chain_link.slot()),
            }));
        }

        Ok(self
            .storage()
            .finalized_block_by_root(block_root)?
            .map(WithStatus::finalized))
    }

    /// The block proposed in `slot` exactly. An empty slot yields nothing.
    pub fn block_at_slot_exact(
        &self,
        slot: Slot,
    ) -> Result<Option<WithStatus<Arc<SignedBeaconBlock<P>>>>> {
        Ok(self
            .block_in_effect_at_slot(slot)?
            .filter(|block| block.value.slot() == slot))
    }

    /// The block proposed in or most recently before `slot`.
    pub fn block_in_effect_at_slot(
        &self,
        slot: Slot,
    ) -> Result<Option<WithStatus<Arc<SignedBeaconBlock<P>>>>> {
        let store = self.store_snapshot();

        if let Some(chain_link) = store.chain_link_before_or_at(slot) {
            return Ok(Some(WithStatus {
                value: chain_link.block.clone_arc(),
                finalized: store.is_slot_finalized(chain_link.slot()),
            }));
        }

        Ok(self
            .storage()
            .latest_finalized_block_at_slot(slot)?
            .map(|(block, _)| WithStatus::finalized(block)))
    }

    /// Like [`Self::block_in_effect_at_slot`] but on the chain ending with
    /// `head_block_root` instead of the current head.
    pub fn block_in_effect_at_slot_on_chain(
        &self,
        slot: Slot,
        head_block_root: H256,
    ) -> Result<Option<Arc<SignedBeaconBlock<P>>>> {
        let store = self.store_snapshot();

        if let Some(ancestor_root) = store.ancestor(head_block_root, slot) {
            if let Some(chain_link) = store.chain_link(ancestor_root) {
                return Ok(Some(chain_link.block.clone_arc()));
            }
        }

        Ok(self
            .storage()
            .latest_finalized_block_at_slot(slot)?
            .map(|(block, _)| block))
    }

    pub fn block_and_state_in_effect_at_slot(
        &self,
        slot: Slot,
    ) -> Result<Option<(Arc<SignedBeaconBlock<P>>, Arc<BeaconState<P>>)>> {
        let Some(block) = self.block_in_effect_at_slot(slot)? else {
            return Ok(None);
        };

        let block = block.value;
        let block_root = block.message.tree_hash_root();

        let Some(state) = self.state_by_block_root(block_root)? else {
            return Ok(None);
        };

        Ok(Some((block, state)))
    }

    pub fn state_by_block_root(&self, block_root: H256) -> Result<Option<Arc<BeaconState<P>>>> {
        if let Some(chain_link) = self.store_snapshot().chain_link(block_root) {
            return Ok(Some(chain_link.state()));
        }

        self.storage().finalized_state_by_block_root(block_root)
    }

    /// The state whose slot is exactly `slot`, regenerated from the in-effect
    /// block's state when the slot is empty. Regeneration failures surface as
    /// an empty result, not an error.
    pub fn state_at_slot_exact(&self, slot: Slot) -> Result<Option<Arc<BeaconState<P>>>> {
        self.state_at_slot_cache().get_or_try_init(slot, || {
            let Some((block, base_state)) = self.block_and_state_in_effect_at_slot(slot)? else {
                debug!("no block in effect at slot {slot}; no state to regenerate from");
                return Ok(None);
            };

            let store = self.store_snapshot();
            let block_root = block.message.tree_hash_root();

            match self
                .state_cache()
                .process_slots(&store, base_state, block_root, slot)
            {
                Ok(state) => Ok(Some(state)),
                Err(error) => {
                    debug!("state transition to slot {slot} failed: {error}");
                    Ok(None)
                }
            }
        })
    }

    /// The latest state at `slot` on the current chain.
    pub fn latest_state_at_slot(&self, slot: Slot) -> Result<Option<Arc<BeaconState<P>>>> {
        let store = self.store_snapshot();

        if slot >= store.latest_finalized_block_slot() {
            if let Some(chain_link) = store.chain_link_before_or_at(slot) {
                return Ok(Some(chain_link.state()));
            }

            // Fall through to the historical query in case the slot moved into
            // the historical range during processing.
        }

        self.storage().latest_finalized_state_at_slot(slot)
    }

    pub fn state_by_state_root(&self, state_root: H256) -> Result<Option<Arc<BeaconState<P>>>> {
        let store = self.store_snapshot();

        if let Some(chain_link) = store.state_by_state_root(state_root) {
            return Ok(Some(chain_link.state()));
        }

        drop(store);

        if let Some((slot, block_root)) = self
            .storage()
            .slot_and_block_root_by_state_root(state_root)?
        {
            let Some(state) = self.state_by_block_root(block_root)? else {
                debug!(
                    "state root {state_root:?} is indexed under block {block_root:?} \
                     but the block's state is not stored",
                );
                return Ok(None);
            };

            if state.slot == slot {
                return Ok(Some(state));
            }

            let store = self.store_snapshot();

            return match self
                .state_cache()
                .process_slots(&store, state, block_root, slot)
            {
                Ok(state) => Ok(Some(state)),
                Err(error) => {
                    debug!("state transition to slot {slot} failed: {error}");
                    Ok(None)
                }
            };
        }

        match self.storage().finalized_slot_by_state_root(state_root)? {
            Some(slot) => self.state_at_slot_exact(slot),
            None => Ok(None),
        }
    }

    /// An ordered walk over the recent chain:
    /// the roots in effect at `start_slot`, `start_slot + step`, and so on.
    #[must_use]
    pub fn ancestor_roots(&self, start_slot: Slot, step: u64, count: u64) -> Vec<(Slot, H256)> {
        let store = self.store_snapshot();
        let step = step.max(1);

        (0..count)
            .map(|index| start_slot + index * step)
            .filter_map(|slot| {
                let chain_link = store.chain_link_before_or_at(slot)?;
                Some((slot, chain_link.block_root))
            })
            .collect_vec()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot<'_, P> {
        Snapshot {
            store_snapshot: self.store_snapshot(),
            storage: self.storage(),
        }
    }
}

/// A snapshot of the fork choice store that can also look up values in the
/// database. Note that the contents of the database are not snapshotted;
/// they may change between calls to methods of a single [`Snapshot`].
pub struct Snapshot<'storage, P: Preset> {
    store_snapshot: Guard<Arc<Store<P>>>,
    storage: &'storage Storage<P>,
}

impl<P: Preset> Snapshot<'_, P> {
    #[must_use]
    pub fn head_state(&self) -> Arc<BeaconState<P>> {
        self.store_snapshot.head().state()
    }

    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        self.store_snapshot.finalized_epoch()
    }

    pub fn finalized_block_by_root(
        &self,
        block_root: H256,
    ) -> Result<Option<Arc<SignedBeaconBlock<P>>>> {
        self.storage.finalized_block_by_root(block_root)
    }

    /// Validation without signature verification, for the signature
    /// verification service. Accepted results still need their signatures
    /// batch-verified before being submitted to the mutator.
    #[must_use]
    pub fn prevalidate_verifier_attestation(
        &self,
        attestation: AttestationItem<P, GossipId>,
    ) -> VerifyAttestationResult<P> {
        self.store_snapshot.validate_attestation(attestation, true)
    }

    #[must_use]
    pub fn prevalidate_verifier_aggregate_and_proof(
        &self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        origin: AggregateAndProofOrigin<GossipId>,
    ) -> VerifyAggregateAndProofResult<P> {
        let result =
            self.store_snapshot
                .validate_aggregate_and_proof(aggregate_and_proof, &origin, true);

        VerifyAggregateAndProofResult { result, origin }
    }
}
