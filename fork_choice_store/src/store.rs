use core::fmt::Debug;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{ensure, Result};
use clock::Tick;
use helper_functions::{
    accessors, misc, predicates,
    verifier::{NullVerifier, SingleVerifier, Verifier as _},
};
use im::HashMap as PersistentHashMap;
use itertools::Itertools as _;
use log::debug;
use std_ext::ArcExt as _;
use thiserror::Error;
use tree_hash::TreeHash as _;
use types::{
    phase0::consts::ATTESTATION_PROPAGATION_SLOT_RANGE,
    phase0::containers::{BeaconState, Checkpoint, SignedAggregateAndProof, SignedBeaconBlock},
    phase0::primitives::{Epoch, Gwei, Slot, ValidatorIndex, H256},
    preset::Preset,
};

use crate::{
    error::AttestationValidationError,
    misc::{
        AggregateAndProofAction, AggregateAndProofOrigin, ApplyBlockChanges, ApplyTickChanges,
        AttestationAction, AttestationItem, BlockAction, BlockOrigin, ChainLink, DeferredVotes,
        LatestMessage, ValidAttestation,
    },
    store_config::StoreConfig,
};

/// The fork choice vote store.
///
/// Holds the last finalized block, every known unfinalized block with its
/// post-state, and the latest vote of every validator. All mutation goes
/// through the single mutator thread; `validate_*` methods run on immutable
/// snapshots in parallel. Persistent maps keep snapshot clones cheap.
#[derive(Clone)]
pub struct Store<P: Preset> {
    store_config: StoreConfig,
    tick: Tick,
    chain: PersistentHashMap<H256, ChainLink<P>>,
    children: PersistentHashMap<H256, Vec<H256>>,
    last_finalized_root: H256,
    head_root: H256,
    justified_checkpoint: Checkpoint,
    finalized_checkpoint: Checkpoint,
    latest_messages: PersistentHashMap<ValidatorIndex, LatestMessage>,
}

impl<P: Preset> Store<P> {
    #[must_use]
    pub fn new(
        store_config: StoreConfig,
        anchor_block: Arc<SignedBeaconBlock<P>>,
        anchor_state: Arc<BeaconState<P>>,
    ) -> Self {
        let anchor_root = anchor_block.message.tree_hash_root();

        let anchor = ChainLink {
            block_root: anchor_root,
            block: anchor_block,
            current_justified_checkpoint: anchor_state.current_justified_checkpoint,
            finalized_checkpoint: anchor_state.finalized_checkpoint,
            state: anchor_state,
        };

        let tick = Tick::start_of_slot(anchor.slot());

        let justified_checkpoint = Checkpoint {
            epoch: anchor.current_justified_checkpoint.epoch,
            root: anchor_root,
        };

        let finalized_checkpoint = Checkpoint {
            epoch: anchor.finalized_checkpoint.epoch,
            root: anchor_root,
        };

        let mut chain = PersistentHashMap::new();
        chain.insert(anchor_root, anchor);

        Self {
            store_config,
            tick,
            chain,
            children: PersistentHashMap::new(),
            last_finalized_root: anchor_root,
            head_root: anchor_root,
            justified_checkpoint,
            finalized_checkpoint,
            latest_messages: PersistentHashMap::new(),
        }
    }

    #[must_use]
    pub const fn store_config(&self) -> StoreConfig {
        self.store_config
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.tick.slot
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        misc::compute_epoch_at_slot::<P>(self.slot())
    }

    #[must_use]
    pub fn previous_epoch(&self) -> Epoch {
        self.current_epoch().saturating_sub(1)
    }

    #[must_use]
    pub const fn justified_checkpoint(&self) -> Checkpoint {
        self.justified_checkpoint
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized_checkpoint
    }

    #[must_use]
    pub const fn finalized_epoch(&self) -> Epoch {
        self.finalized_checkpoint.epoch
    }

    #[must_use]
    pub const fn finalized_root(&self) -> H256 {
        self.finalized_checkpoint.root
    }

    #[must_use]
    pub fn is_slot_finalized(&self, slot: Slot) -> bool {
        slot <= misc::compute_start_slot_at_epoch::<P>(self.finalized_epoch())
    }

    #[must_use]
    pub fn head(&self) -> &ChainLink<P> {
        self.chain
            .get(&self.head_root)
            .expect("head root always refers to a block in the store")
    }

    #[must_use]
    pub fn last_finalized(&self) -> &ChainLink<P> {
        self.chain
            .get(&self.last_finalized_root)
            .expect("the last finalized block is kept in the store")
    }

    #[must_use]
    pub fn latest_finalized_block_slot(&self) -> Slot {
        self.last_finalized().slot()
    }

    #[must_use]
    pub fn contains_block(&self, block_root: H256) -> bool {
        self.chain.contains_key(&block_root)
    }

    #[must_use]
    pub fn chain_link(&self, block_root: H256) -> Option<&ChainLink<P>> {
        self.chain.get(&block_root)
    }

    /// Blocks from the head back to the last finalized block, newest first.
    pub fn canonical_chain(&self) -> impl Iterator<Item = &ChainLink<P>> {
        core::iter::successors(Some(self.head()), |chain_link| {
            if chain_link.block_root == self.last_finalized_root {
                return None;
            }

            let parent = self.chain.get(&chain_link.parent_root());

            assert!(
                parent.is_some(),
                "unfinalized blocks always have parents in the store",
            );

            parent
        })
    }

    #[must_use]
    pub fn chain_link_before_or_at(&self, slot: Slot) -> Option<&ChainLink<P>> {
        self.canonical_chain()
            .find(|chain_link| chain_link.slot() <= slot)
    }

    /// The post-state whose root a block on the canonical chain committed to.
    #[must_use]
    pub fn state_by_state_root(&self, state_root: H256) -> Option<&ChainLink<P>> {
        self.canonical_chain()
            .find(|chain_link| chain_link.block.message.state_root == state_root)
    }

    /// The ancestor of `block_root` in effect at `slot`.
    #[must_use]
    pub fn ancestor(&self, block_root: H256, slot: Slot) -> Option<H256> {
        let mut chain_link = self.chain.get(&block_root)?;

        loop {
            if chain_link.slot() <= slot {
                return Some(chain_link.block_root);
            }

            if chain_link.block_root == self.last_finalized_root {
                // Anything at or before the last finalized slot is an ancestor
                // of every block in the store.
                return Some(self.last_finalized_root);
            }

            chain_link = self.chain.get(&chain_link.parent_root())?;
        }
    }

    pub fn apply_tick(&mut self, new_tick: Tick) -> Option<ApplyTickChanges> {
        // If multiple tick updates are performed in quick succession,
        // they can come in any order.
        if new_tick <= self.tick {
            return None;
        }

        let old_tick = self.tick;
        self.tick = new_tick;

        if new_tick.slot <= old_tick.slot {
            return Some(ApplyTickChanges::TickUpdated);
        }

        Some(ApplyTickChanges::SlotUpdated)
    }

    /// Performs the full state transition for a block without mutating the store.
    pub fn validate_block(
        &self,
        block: Arc<SignedBeaconBlock<P>>,
        origin: BlockOrigin,
    ) -> Result<BlockAction<P>> {
        let block_root = block.message.tree_hash_root();

        if self.contains_block(block_root) {
            return Ok(BlockAction::Ignore);
        }

        if block.slot() > self.slot() {
            return Ok(BlockAction::DelayUntilSlot(block));
        }

        if self.is_slot_finalized(block.slot()) {
            debug!(
                "ignoring block {block_root:?} from already finalized slot {}",
                block.slot(),
            );
            return Ok(BlockAction::Ignore);
        }

        let Some(parent) = self.chain.get(&block.parent_root()) else {
            return Ok(BlockAction::DelayUntilParent(block));
        };

        ensure!(
            parent.slot() < block.slot(),
            Error::BlockNotLaterThanParent {
                block_root,
                block_slot: block.slot(),
                parent_slot: parent.slot(),
            },
        );

        let mut state = parent.state.as_ref().clone();

        if state.slot < block.slot() {
            transition_functions::process_slots(&mut state, block.slot())?;
        }

        if origin.verify_signatures() {
            transition_functions::validate_block_signature(&state, &block, &mut SingleVerifier)?;
            transition_functions::process_block(&mut state, &block.message, &mut SingleVerifier)?;
        } else {
            transition_functions::process_block(&mut state, &block.message, &mut NullVerifier)?;
        }

        let computed_state_root = state.tree_hash_root();

        ensure!(
            block.message.state_root == computed_state_root,
            Error::BlockStateRootMismatch {
                block_root,
                in_block: block.message.state_root,
                computed: computed_state_root,
            },
        );

        Ok(BlockAction::Accept(ChainLink {
            block_root,
            block,
            current_justified_checkpoint: state.current_justified_checkpoint,
            finalized_checkpoint: state.finalized_checkpoint,
            state: Arc::new(state),
        }))
    }

    /// Applies a block previously validated with [`Store::validate_block`].
    pub fn apply_block(&mut self, chain_link: ChainLink<P>) -> ApplyBlockChanges<P> {
        let block_root = chain_link.block_root;
        let parent_root = chain_link.parent_root();

        // `fork_choice_control::Mutator::accept_block` ensures this is true.
        assert!(!self.contains_block(block_root));

        let finalized_checkpoint_updated = self.update_checkpoints(
            chain_link.current_justified_checkpoint,
            chain_link.finalized_checkpoint,
        );

        self.chain.insert(block_root, chain_link);

        let mut siblings = self.children.get(&parent_root).cloned().unwrap_or_default();
        siblings.push(block_root);
        self.children.insert(parent_root, siblings);

        let old_head_root = self.head_root;
        self.update_head();

        if self.head_root == old_head_root {
            return ApplyBlockChanges::AlternateChainExtended {
                finalized_checkpoint_updated,
            };
        }

        let extended = self
            .ancestor(self.head_root, self.chain[&old_head_root].slot())
            .is_some_and(|ancestor| ancestor == old_head_root);

        if extended {
            ApplyBlockChanges::CanonicalChainExtended {
                finalized_checkpoint_updated,
            }
        } else {
            let old_head = self.chain[&old_head_root].clone();

            ApplyBlockChanges::Reorganized {
                finalized_checkpoint_updated,
                old_head,
            }
        }
    }

    /// Validates a singular attestation against this snapshot.
    ///
    /// Outcomes map onto attestation processing results as follows:
    /// `Accept` is SUCCESSFUL, `DelayUntilBlock` is UNKNOWN_BLOCK,
    /// `DelayUntilSlot` is SAVED_FOR_FUTURE, `DeferUntilNextSlot` is
    /// DEFER_FORK_CHOICE_PROCESSING, and `Err` is INVALID.
    pub fn validate_attestation<I: Debug>(
        &self,
        attestation: AttestationItem<P, I>,
        skip_signature_verification: bool,
    ) -> Result<AttestationAction<P, I>, AttestationValidationError<P, I>> {
        let data = attestation.data();

        if !attestation.origin.is_from_block() {
            // > Attestations must be from the current or previous epoch
            if data.target.epoch < self.previous_epoch() {
                return Ok(AttestationAction::Ignore(attestation));
            }

            // > If attestation target is from a future epoch,
            // > delay consideration until the epoch arrives
            if self.slot() < data.slot {
                return Ok(AttestationAction::DelayUntilSlot(attestation));
            }
        }

        // > Check that the epoch number and slot number are matching
        if data.target.epoch != misc::compute_epoch_at_slot::<P>(data.slot) {
            return Err(AttestationValidationError::AttestationTargetsWrongEpoch { attestation });
        }

        if attestation.origin.validate_as_gossip()
            && data.slot + ATTESTATION_PROPAGATION_SLOT_RANGE < self.slot()
        {
            return Ok(AttestationAction::Ignore(attestation));
        }

        if attestation.origin.must_be_singular() {
            let set_bits = attestation.item.aggregation_bits.num_set_bits();

            if set_bits != 1 {
                return Err(
                    AttestationValidationError::SingularAttestationHasMultipleAggregationBitsSet {
                        attestation,
                        set_bits,
                    },
                );
            }
        }

        // > Attestation target must be for a known block.
        // > If target block is unknown, delay consideration until block is found
        if !self.contains_block(data.target.root) {
            return Ok(AttestationAction::DelayUntilBlock(
                attestation,
                data.target.root,
            ));
        }

        // > Attestations must be for a known block.
        // > If block is unknown, delay consideration until the block is found
        let Some(voted_block) = self.chain_link(data.beacon_block_root) else {
            return Ok(AttestationAction::DelayUntilBlock(
                attestation,
                data.beacon_block_root,
            ));
        };

        // > Attestations must not be for blocks in the future.
        // > If not, the attestation should not be considered
        if voted_block.slot() > data.slot {
            let block_slot = voted_block.slot();

            return Err(AttestationValidationError::AttestationForFutureBlock {
                attestation,
                block_slot,
            });
        }

        // > LMD vote must be consistent with FFG vote target
        let epoch_boundary_slot = misc::compute_start_slot_at_epoch::<P>(data.target.epoch);

        let ancestor_at_boundary = self
            .ancestor(data.beacon_block_root, epoch_boundary_slot)
            .expect("the voted block was found in the store above");

        if data.target.root != ancestor_at_boundary {
            return Err(AttestationValidationError::LmdGhostInconsistentWithFfgTarget {
                attestation,
            });
        }

        // Committee computation only depends on the validator registry, so the
        // target block's state is usable directly without regeneration.
        let target_state = &self
            .chain_link(data.target.root)
            .expect("the target block was found in the store above")
            .state;

        if let Some(actual) = attestation.origin.subnet_id() {
            let committees_per_slot =
                accessors::get_committee_count_per_slot(target_state, data.target.epoch);

            let expected = match misc::compute_subnet_for_attestation::<P>(
                committees_per_slot,
                data.slot,
                data.index,
            ) {
                Ok(expected) => expected,
                Err(source) => {
                    return Err(AttestationValidationError::Invalid {
                        attestation,
                        source,
                    })
                }
            };

            // > The attestation is for the correct subnet
            if actual != expected {
                return Err(
                    AttestationValidationError::SingularAttestationOnIncorrectSubnet {
                        attestation,
                        expected,
                        actual,
                    },
                );
            }
        }

        let indexed_attestation =
            match accessors::get_indexed_attestation(target_state, &attestation.item) {
                Ok(indexed_attestation) => indexed_attestation,
                Err(source) => {
                    return Err(AttestationValidationError::Invalid {
                        attestation,
                        source,
                    })
                }
            };

        let verify = !skip_signature_verification && attestation.verify_signatures();

        let validation_result = if verify {
            predicates::validate_constructed_indexed_attestation(
                target_state,
                &indexed_attestation,
                &mut SingleVerifier,
            )
        } else {
            predicates::validate_constructed_indexed_attestation(
                target_state,
                &indexed_attestation,
                &mut NullVerifier,
            )
        };

        if let Err(source) = validation_result {
            return Err(AttestationValidationError::Invalid {
                attestation,
                source,
            });
        }

        let attestation = if verify {
            attestation.into_verified()
        } else {
            attestation
        };

        let attesting_indices = indexed_attestation.attesting_indices.to_vec();

        // Votes for the current slot can only affect the head starting with
        // the next slot. They are parked and applied on the next slot tick.
        // Attestations drained from the slot park are already one tick old.
        if data.slot == self.slot()
            && !attestation.origin.is_from_block()
            && !attestation.is_retried()
        {
            return Ok(AttestationAction::DeferUntilNextSlot {
                attestation,
                attesting_indices,
            });
        }

        Ok(AttestationAction::Accept {
            attestation,
            attesting_indices,
        })
    }

    pub fn validate_aggregate_and_proof<I: Debug>(
        &self,
        aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
        origin: &AggregateAndProofOrigin<I>,
        skip_signature_verification: bool,
    ) -> Result<AggregateAndProofAction<P>> {
        let message = &aggregate_and_proof.message;
        let data = message.aggregate.data;

        if data.target.epoch < self.previous_epoch() {
            return Ok(AggregateAndProofAction::Ignore);
        }

        if self.slot() < data.slot {
            return Ok(AggregateAndProofAction::DelayUntilSlot(aggregate_and_proof));
        }

        ensure!(
            data.target.epoch == misc::compute_epoch_at_slot::<P>(data.slot),
            Error::AggregateTargetsWrongEpoch {
                aggregator_index: message.aggregator_index,
            },
        );

        if data.slot + ATTESTATION_PROPAGATION_SLOT_RANGE < self.slot() {
            return Ok(AggregateAndProofAction::Ignore);
        }

        if !self.contains_block(data.target.root) {
            return Ok(AggregateAndProofAction::DelayUntilBlock(
                aggregate_and_proof,
                data.target.root,
            ));
        }

        let Some(voted_block) = self.chain_link(data.beacon_block_root) else {
            return Ok(AggregateAndProofAction::DelayUntilBlock(
                aggregate_and_proof,
                data.beacon_block_root,
            ));
        };

        ensure!(
            voted_block.slot() <= data.slot,
            Error::AggregateForFutureBlock {
                aggregator_index: message.aggregator_index,
                block_slot: voted_block.slot(),
            },
        );

        let epoch_boundary_slot = misc::compute_start_slot_at_epoch::<P>(data.target.epoch);

        let ancestor_at_boundary = self
            .ancestor(data.beacon_block_root, epoch_boundary_slot)
            .expect("the voted block was found in the store above");

        ensure!(
            data.target.root == ancestor_at_boundary,
            Error::AggregateLmdGhostInconsistentWithFfgTarget {
                aggregator_index: message.aggregator_index,
            },
        );

        let target_state = &self
            .chain_link(data.target.root)
            .expect("the target block was found in the store above")
            .state;

        let indexed_attestation =
            accessors::get_indexed_attestation(target_state, &message.aggregate)?;

        if !skip_signature_verification && origin.verify_signatures() {
            self.verify_aggregate_signatures(target_state, &aggregate_and_proof)?;

            predicates::validate_constructed_indexed_attestation(
                target_state,
                &indexed_attestation,
                &mut SingleVerifier,
            )?;
        }

        let attesting_indices = indexed_attestation.attesting_indices.to_vec();

        if data.slot == self.slot() {
            return Ok(AggregateAndProofAction::DeferUntilNextSlot {
                aggregate_and_proof,
                attesting_indices,
            });
        }

        Ok(AggregateAndProofAction::Accept {
            aggregate_and_proof,
            attesting_indices,
        })
    }

    fn verify_aggregate_signatures(
        &self,
        state: &BeaconState<P>,
        aggregate_and_proof: &SignedAggregateAndProof<P>,
    ) -> Result<()> {
        use helper_functions::error::SignatureKind;
        use types::phase0::consts::{DOMAIN_AGGREGATE_AND_PROOF, DOMAIN_SELECTION_PROOF};

        let message = &aggregate_and_proof.message;
        let public_key = accessors::public_key(state, message.aggregator_index)?;

        let selection_domain =
            misc::compute_domain(DOMAIN_SELECTION_PROOF, state.genesis_validators_root);

        SingleVerifier.verify_singular(
            misc::compute_signing_root(&message.aggregate.data.slot, selection_domain),
            message.selection_proof,
            public_key,
            SignatureKind::SelectionProof,
        )?;

        let aggregate_and_proof_domain =
            misc::compute_domain(DOMAIN_AGGREGATE_AND_PROOF, state.genesis_validators_root);

        SingleVerifier.verify_singular(
            misc::compute_signing_root(message, aggregate_and_proof_domain),
            aggregate_and_proof.signature,
            public_key,
            SignatureKind::AggregateAndProof,
        )?;

        Ok(())
    }

    /// Applies a validated attestation to the vote store.
    ///
    /// Returns the old head if the application changed the head.
    pub fn apply_attestation(&mut self, valid_attestation: ValidAttestation) -> Option<ChainLink<P>> {
        self.apply_attestation_batch(core::iter::once(valid_attestation))
    }

    pub fn apply_attestation_batch(
        &mut self,
        valid_attestations: impl IntoIterator<Item = ValidAttestation>,
    ) -> Option<ChainLink<P>> {
        for valid_attestation in valid_attestations {
            let message = LatestMessage {
                epoch: valid_attestation.data.target.epoch,
                beacon_block_root: valid_attestation.data.beacon_block_root,
            };

            for validator_index in valid_attestation.attesting_indices.iter().copied() {
                self.update_latest_message(validator_index, message);
            }
        }

        self.update_head_returning_old()
    }

    /// Applies buckets drained from the deferred park. Each bucket is a batch;
    /// all buckets are applied before the head is recomputed once.
    pub fn apply_deferred_attestations(
        &mut self,
        deferred: impl IntoIterator<Item = DeferredVotes>,
    ) -> Option<ChainLink<P>> {
        for bucket in deferred {
            for (validator_index, message) in bucket.votes {
                self.update_latest_message(validator_index, message);
            }
        }

        self.update_head_returning_old()
    }

    fn update_latest_message(&mut self, validator_index: ValidatorIndex, message: LatestMessage) {
        match self.latest_messages.get(&validator_index) {
            // Re-submitting the same attestation is a no-op,
            // which keeps attestation processing idempotent.
            Some(existing) if message.epoch <= existing.epoch => {}
            _ => {
                self.latest_messages.insert(validator_index, message);
            }
        }
    }

    fn update_head_returning_old(&mut self) -> Option<ChainLink<P>> {
        let old_head_root = self.head_root;

        self.update_head();

        (self.head_root != old_head_root).then(|| self.chain[&old_head_root].clone())
    }

    /// Greedy heaviest-observed-subtree walk from the justified block.
    fn update_head(&mut self) {
        let subtree_weights = self.subtree_weights();

        let mut current = if self.contains_block(self.justified_checkpoint.root) {
            self.justified_checkpoint.root
        } else {
            self.last_finalized_root
        };

        loop {
            let Some(children) = self.children.get(&current) else {
                break;
            };

            let best_child = children
                .iter()
                .filter(|child| self.chain.contains_key(*child))
                .max_by_key(|child| (subtree_weights.get(*child).copied().unwrap_or(0), **child));

            match best_child {
                Some(child) => current = *child,
                None => break,
            }
        }

        self.head_root = current;
    }

    /// Attesting balance of every block's subtree, computed bottom-up.
    /// Children always have later slots than parents, so one pass over the
    /// links in slot-descending order propagates all weights.
    fn subtree_weights(&self) -> HashMap<H256, Gwei> {
        let balance_source = self.last_finalized().state.clone_arc();

        let mut weights = HashMap::<H256, Gwei>::with_capacity(self.chain.len());

        for (validator_index, message) in &self.latest_messages {
            if self.chain.contains_key(&message.beacon_block_root) {
                let balance = balance_source
                    .validators
                    .get(*validator_index as usize)
                    .map(|validator| validator.effective_balance)
                    .unwrap_or_default();

                *weights.entry(message.beacon_block_root).or_default() += balance;
            }
        }

        let descending = self
            .chain
            .values()
            .sorted_by_key(|chain_link| core::cmp::Reverse(chain_link.slot()))
            .map(|chain_link| (chain_link.block_root, chain_link.parent_root()))
            .collect_vec();

        for (block_root, parent_root) in descending {
            if block_root == self.last_finalized_root {
                continue;
            }

            let weight = weights.get(&block_root).copied().unwrap_or(0);
            *weights.entry(parent_root).or_default() += weight;
        }

        weights
    }

    /// Moves everything that is no longer needed in memory out of the store.
    ///
    /// Returns the newly finalized chain links ordered oldest first, ready for
    /// archival. The new finalized block itself stays in the store as the root
    /// of the unfinalized tree.
    pub fn archive_finalized(&mut self) -> Result<Vec<ChainLink<P>>> {
        let new_finalized_root = self.finalized_checkpoint.root;

        if new_finalized_root == self.last_finalized_root {
            return Ok(vec![]);
        }

        ensure!(
            self.contains_block(new_finalized_root),
            Error::FinalizedBlockNotInStore {
                finalized_root: new_finalized_root,
            },
        );

        // Everything that does not descend from the new finalized block is
        // either newly finalized or orphaned.
        let mut retained = HashSet::from([new_finalized_root]);
        let mut stack = vec![new_finalized_root];

        while let Some(parent) = stack.pop() {
            for child in self.children.get(&parent).into_iter().flatten() {
                if self.chain.contains_key(child) && retained.insert(*child) {
                    stack.push(*child);
                }
            }
        }

        let mut archived = vec![];
        let mut orphaned = 0_usize;

        let removed_roots = self
            .chain
            .keys()
            .filter(|root| !retained.contains(*root))
            .copied()
            .collect_vec();

        let canonical = {
            let mut path = HashSet::new();
            let mut current = new_finalized_root;

            while let Some(chain_link) = self.chain.get(&current) {
                if current != new_finalized_root {
                    path.insert(current);
                }

                if current == self.last_finalized_root {
                    break;
                }

                current = chain_link.parent_root();
            }

            path
        };

        for root in removed_roots {
            let chain_link = self
                .chain
                .remove(&root)
                .expect("roots were collected from the chain map");

            self.children.remove(&root);

            if canonical.contains(&root) {
                archived.push(chain_link);
            } else {
                orphaned += 1;
            }
        }

        if orphaned > 0 {
            debug!("pruned {orphaned} orphaned blocks at finalization");
        }

        archived.sort_by_key(ChainLink::slot);

        self.last_finalized_root = new_finalized_root;

        // Votes that can no longer influence the head are dropped.
        let finalized_epoch = self.finalized_epoch();
        self.latest_messages
            .retain(|_, message| message.epoch >= finalized_epoch);

        self.update_head();

        Ok(archived)
    }

    fn update_checkpoints(
        &mut self,
        justified_checkpoint: Checkpoint,
        finalized_checkpoint: Checkpoint,
    ) -> bool {
        if justified_checkpoint.epoch > self.justified_checkpoint.epoch {
            self.justified_checkpoint = justified_checkpoint;
        }

        let finalized_checkpoint_updated =
            finalized_checkpoint.epoch > self.finalized_checkpoint.epoch;

        if finalized_checkpoint_updated {
            self.finalized_checkpoint = finalized_checkpoint;
        }

        finalized_checkpoint_updated
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error(
        "aggregate from aggregator {aggregator_index} votes for a block \
         from a later slot (block slot: {block_slot})"
    )]
    AggregateForFutureBlock {
        aggregator_index: ValidatorIndex,
        block_slot: Slot,
    },
    #[error("aggregate from aggregator {aggregator_index} has an LMD vote inconsistent with its FFG target")]
    AggregateLmdGhostInconsistentWithFfgTarget { aggregator_index: ValidatorIndex },
    #[error("aggregate from aggregator {aggregator_index} targets the wrong epoch")]
    AggregateTargetsWrongEpoch { aggregator_index: ValidatorIndex },
    #[error("block {block_root:?} at slot {block_slot} is not later than its parent at {parent_slot}")]
    BlockNotLaterThanParent {
        block_root: H256,
        block_slot: Slot,
        parent_slot: Slot,
    },
    #[error(
        "block {block_root:?} commits to state root {in_block:?} \
         but its state transition produced {computed:?}"
    )]
    BlockStateRootMismatch {
        block_root: H256,
        in_block: H256,
        computed: H256,
    },
    #[error("finalized block {finalized_root:?} is not in the store")]
    FinalizedBlockNotInStore { finalized_root: H256 },
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use ssz_types::VariableList;
    use types::{
        phase0::containers::{
            AttestationData, BeaconBlock, BeaconBlockBody,
            SignedBeaconBlock as SignedBeaconBlockContainer, Validator,
        },
        phase0::primitives::{PublicKeyBytes, SignatureBytes},
        preset::Minimal,
    };

    use super::*;

    fn anchor_state() -> Arc<BeaconState<Minimal>> {
        let validators = (0..4_u8)
            .map(|index| Validator {
                pubkey: PublicKeyBytes::repeat_byte(index),
                effective_balance: 32_000_000_000,
                activation_epoch: 0,
                exit_epoch: u64::MAX,
            })
            .collect_vec();

        Arc::new(BeaconState {
            validators: VariableList::from(validators),
            ..BeaconState::default()
        })
    }

    fn block(slot: Slot, parent_root: H256, graffiti: H256) -> Arc<SignedBeaconBlockContainer<Minimal>> {
        Arc::new(SignedBeaconBlockContainer {
            message: BeaconBlock {
                slot,
                proposer_index: 0,
                parent_root,
                state_root: H256::ZERO,
                body: BeaconBlockBody {
                    graffiti,
                    attestations: VariableList::default(),
                },
            },
            signature: SignatureBytes::ZERO,
        })
    }

    fn chain_link_for(
        block: Arc<SignedBeaconBlockContainer<Minimal>>,
        state: Arc<BeaconState<Minimal>>,
    ) -> ChainLink<Minimal> {
        ChainLink {
            block_root: block.message.tree_hash_root(),
            current_justified_checkpoint: state.current_justified_checkpoint,
            finalized_checkpoint: state.finalized_checkpoint,
            block,
            state,
        }
    }

    fn store_with_two_forks() -> (Store<Minimal>, H256, H256) {
        let state = anchor_state();
        let anchor = block(0, H256::ZERO, H256::ZERO);
        let anchor_root = anchor.message.tree_hash_root();

        let mut store = Store::new(StoreConfig::default(), anchor, state.clone());

        let _changes = store.apply_tick(Tick::start_of_slot(2));

        let first = block(1, anchor_root, H256::repeat_byte(1));
        let second = block(1, anchor_root, H256::repeat_byte(2));

        let first_root = first.message.tree_hash_root();
        let second_root = second.message.tree_hash_root();

        let _changes = store.apply_block(chain_link_for(first, state.clone()));
        let _changes = store.apply_block(chain_link_for(second, state));

        (store, first_root, second_root)
    }

    #[test]
    fn stale_ticks_are_ignored() {
        let (mut store, _, _) = store_with_two_forks();

        assert!(store.apply_tick(Tick::start_of_slot(2)).is_none());
        assert!(store.apply_tick(Tick::start_of_slot(1)).is_none());
        assert!(store
            .apply_tick(Tick::start_of_slot(3))
            .is_some_and(|changes| changes.is_slot_updated()));
    }

    #[test]
    fn votes_move_the_head_and_reapplication_is_a_no_op() {
        let (mut store, first_root, second_root) = store_with_two_forks();

        // With no votes the tie is broken by the greater root.
        assert_eq!(store.head().block_root, first_root.max(second_root));

        let lesser_root = first_root.min(second_root);

        let vote = ValidAttestation {
            data: AttestationData {
                slot: 1,
                beacon_block_root: lesser_root,
                ..AttestationData::default()
            },
            attesting_indices: vec![0, 1, 2],
            is_from_block: false,
        };

        let old_head = store.apply_attestation(vote.clone());

        assert!(old_head.is_some());
        assert_eq!(store.head().block_root, lesser_root);

        // Resubmission after UNKNOWN_BLOCK resolution must not change anything.
        assert!(store.apply_attestation(vote).is_none());
        assert_eq!(store.head().block_root, lesser_root);
    }

    #[test]
    fn archive_finalized_moves_canonical_links_out_and_prunes_orphans() -> Result<()> {
        let (mut store, first_root, second_root) = store_with_two_forks();

        let canonical_root = first_root.max(second_root);
        let orphan_root = first_root.min(second_root);

        let state = anchor_state();
        let child = block(8, canonical_root, H256::repeat_byte(3));
        let child_root = child.message.tree_hash_root();

        let mut chain_link = chain_link_for(child, state);
        chain_link.finalized_checkpoint = Checkpoint {
            epoch: 1,
            root: canonical_root,
        };

        let _changes = store.apply_tick(Tick::start_of_slot(8));
        let changes = store.apply_block(chain_link);

        assert!(changes.is_finalized_checkpoint_updated());

        let archived = store.archive_finalized()?;

        // The anchor is archived, the orphaned fork is dropped, and the new
        // finalized block stays as the root of the tree.
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].slot(), 0);

        assert!(store.contains_block(canonical_root));
        assert!(store.contains_block(child_root));
        assert!(!store.contains_block(orphan_root));

        assert_eq!(store.last_finalized().block_root, canonical_root);
        assert_eq!(store.head().block_root, child_root);

        Ok(())
    }
}
