use std::sync::Arc;

use anyhow::Result;
use futures::channel::mpsc::UnboundedReceiver;
use itertools::Itertools as _;
use tree_hash::TreeHash as _;
use types::{
    phase0::containers::{AggregateAndProof, Attestation, SignedAggregateAndProof},
    phase0::primitives::{SignatureBytes, H256},
    preset::Minimal,
};

use crate::{
    helpers::{gossip_id, Context},
    messages::{LivenessMessage, P2pMessage},
};

fn drain_attestations(
    receiver: &mut UnboundedReceiver<Arc<Attestation<Minimal>>>,
) -> Vec<Arc<Attestation<Minimal>>> {
    core::iter::from_fn(|| receiver.try_next().ok().flatten()).collect_vec()
}

// Scenario: an attestation voting for an unknown block is parked, the block's
// import drains the park, and subscribers observe the attestation exactly once.
#[test]
fn attestation_for_unknown_block_is_parked_and_drained_on_block_import() -> Result<()> {
    let mut context = Context::new()?;
    let controller = context.controller().clone();

    let (_id, mut all_valid) = controller.subscribe_to_all_valid_attestations();

    let genesis_state = context.genesis_state();
    let (block, block_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(1))?;
    let block_root = block.message.tree_hash_root();

    context.on_slot(1);

    let attestation = context.singular_attestation(&block_state, 1, 0, block_root)?;

    context.on_gossip_singular_attestation(attestation.clone(), gossip_id(1));

    // The attestation is waiting on the block; nothing was delivered.
    assert!(drain_attestations(&mut all_valid).is_empty());

    let p2p_messages = context.drain_p2p_messages();

    assert!(p2p_messages
        .iter()
        .any(|message| matches!(message, P2pMessage::BlockNeeded(root, _) if *root == block_root)));

    context.on_slot(2);
    context.on_own_block(block);

    let observed = drain_attestations(&mut all_valid);

    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0], attestation);

    assert_eq!(controller.head_block_root(), block_root);

    // The liveness tracker hears about the imported block and the attestation.
    let mut liveness_messages = vec![];

    while let Some(message) = context.next_liveness_message() {
        liveness_messages.push(message);
    }

    assert!(liveness_messages
        .iter()
        .any(|message| matches!(message, LivenessMessage::BlockImported { .. })));
    assert!(liveness_messages
        .iter()
        .any(|message| matches!(message, LivenessMessage::Attestation { .. })));

    Ok(())
}

// Scenario: resubmitting an attestation already waiting on its block
// short-circuits, and the block import still applies it exactly once.
#[test]
fn duplicate_of_parked_attestation_short_circuits() -> Result<()> {
    let mut context = Context::new()?;
    let controller = context.controller().clone();

    let (_id, mut all_valid) = controller.subscribe_to_all_valid_attestations();

    let genesis_state = context.genesis_state();
    let (block, block_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(1))?;
    let block_root = block.message.tree_hash_root();

    context.on_slot(1);

    let attestation = context.singular_attestation(&block_state, 1, 0, block_root)?;

    context.on_gossip_singular_attestation(attestation.clone(), gossip_id(1));
    context.drain_p2p_messages();

    context.on_gossip_singular_attestation(attestation, gossip_id(2));

    // The duplicate is ignored for propagation purposes rather than parked again.
    let p2p_messages = context.drain_p2p_messages();

    assert!(p2p_messages
        .iter()
        .any(|message| matches!(message, P2pMessage::Ignore(id) if id.message_id == 2)));

    context.on_slot(2);
    context.on_own_block(block);

    assert_eq!(drain_attestations(&mut all_valid).len(), 1);

    Ok(())
}

// Scenario: an attestation from a future slot waits in the slot park and is
// applied when its slot arrives, not earlier.
#[test]
fn attestation_from_future_slot_waits_for_its_slot() -> Result<()> {
    let mut context = Context::new()?;
    let controller = context.controller().clone();

    let (_id, mut all_valid) = controller.subscribe_to_all_valid_attestations();

    let genesis_state = context.genesis_state();
    let genesis_root = controller.head_block_root();

    context.on_slot(1);

    let attestation = context.singular_attestation(&genesis_state, 3, 0, genesis_root)?;

    context.on_gossip_singular_attestation(attestation.clone(), gossip_id(1));

    assert!(drain_attestations(&mut all_valid).is_empty());

    context.on_slot(2);

    assert!(drain_attestations(&mut all_valid).is_empty());

    context.on_slot(3);

    let observed = drain_attestations(&mut all_valid);

    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0], attestation);

    context.drain_p2p_messages();

    Ok(())
}

// Scenario: a vote for the current slot is deferred one tick. The vote has no
// effect on the head until the next slot begins.
#[test]
fn current_slot_attestation_defers_fork_choice_one_tick() -> Result<()> {
    let mut context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();

    let (first, first_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(1))?;
    let (second, second_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(2))?;

    let first_root = first.message.tree_hash_root();
    let second_root = second.message.tree_hash_root();

    context.on_slot(1);
    context.on_own_block(first);
    context.on_own_block(second);

    // With no votes the tie is broken by the greater root.
    let tie_break_head = controller.head_block_root();
    assert_eq!(tie_break_head, first_root.max(second_root));

    let (lesser_root, lesser_state) = if first_root < second_root {
        (first_root, first_state)
    } else {
        (second_root, second_state)
    };

    let attestation = context.singular_attestation(&lesser_state, 1, 0, lesser_root)?;

    context.on_gossip_singular_attestation(attestation, gossip_id(1));

    // The vote was valid but must wait out the tick.
    assert_eq!(controller.head_block_root(), tie_break_head);

    context.on_slot(2);

    assert_eq!(controller.head_block_root(), lesser_root);

    context.drain_p2p_messages();

    Ok(())
}

// Scenario: locally produced attestations are re-fired to the "to send"
// subscribers and marked gossiped at most once.
#[test]
fn own_attestation_is_sent_out_exactly_once() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let (_id, mut to_send) = controller.subscribe_to_attestations_to_send();
    let (_id, mut all_valid) = controller.subscribe_to_all_valid_attestations();

    let genesis_state = context.genesis_state();
    let genesis_root = controller.head_block_root();

    context.on_slot(1);

    let attestation = context.singular_attestation(&genesis_state, 1, 0, genesis_root)?;

    context.on_own_singular_attestation(attestation.clone());

    let sent = drain_attestations(&mut to_send);

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], attestation);
    assert_eq!(drain_attestations(&mut all_valid).len(), 1);

    // The deferred vote applying on the next tick does not re-send anything.
    context.on_slot(2);

    assert!(drain_attestations(&mut to_send).is_empty());

    Ok(())
}

// Scenario: a locally produced aggregate goes through the aggregate rule set
// and ends up in the aggregating pool.
#[test]
fn own_aggregate_and_proof_is_accepted_into_the_pool() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let (_id, mut all_valid) = controller.subscribe_to_all_valid_attestations();

    let genesis_state = context.genesis_state();
    let genesis_root = controller.head_block_root();

    context.on_slot(2);

    let attestation = context.singular_attestation(&genesis_state, 1, 0, genesis_root)?;

    let aggregate_and_proof = Arc::new(SignedAggregateAndProof {
        message: AggregateAndProof {
            aggregator_index: 1,
            aggregate: attestation.as_ref().clone(),
            selection_proof: SignatureBytes::ZERO,
        },
        signature: SignatureBytes::ZERO,
    });

    controller.on_own_aggregate_and_proof(aggregate_and_proof);
    controller.wait_for_tasks();

    assert_eq!(drain_attestations(&mut all_valid).len(), 1);

    assert_eq!(
        controller
            .attestation_agg_pool()
            .singular_attestations(attestation.data)
            .len(),
        1,
    );

    Ok(())
}

// Scenario: an attestation with an invalid signature is rejected and the
// source is penalized.
#[test]
fn attestation_with_invalid_signature_is_rejected() -> Result<()> {
    let mut context = Context::new()?;

    let genesis_state = context.genesis_state();
    let genesis_root = context.controller().head_block_root();

    context.on_slot(2);

    let attestation = context.singular_attestation(&genesis_state, 1, 0, genesis_root)?;

    let mut tampered = attestation.as_ref().clone();
    tampered.signature = SignatureBytes::repeat_byte(0xab);

    context.on_gossip_singular_attestation(Arc::new(tampered), gossip_id(9));

    let p2p_messages = context.drain_p2p_messages();

    assert!(p2p_messages
        .iter()
        .any(|message| matches!(message, P2pMessage::Reject(id, _) if id.message_id == 9)));

    Ok(())
}

// Scenario: a block whose parent is unknown waits for the parent.
#[test]
fn block_with_unknown_parent_waits_for_parent() -> Result<()> {
    let mut context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();

    let (parent, parent_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(1))?;
    let (child, _) = context.empty_block(&parent_state, 2, H256::repeat_byte(2))?;

    let parent_root = parent.message.tree_hash_root();
    let child_root = child.message.tree_hash_root();

    context.on_slot(2);
    context.on_gossip_block(child);

    assert_eq!(controller.head_block_root(), controller.finalized_root());

    let p2p_messages = context.drain_p2p_messages();

    assert!(p2p_messages
        .iter()
        .any(|message| matches!(message, P2pMessage::BlockNeeded(root, _) if *root == parent_root)));

    context.on_gossip_block(parent);

    assert_eq!(controller.head_block_root(), child_root);

    Ok(())
}

// Scenario: queries about an empty slot return nothing for the exact-slot
// variant and the in-effect block otherwise.
#[test]
fn empty_slot_queries_fall_back_to_the_in_effect_block() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();

    context.on_slot(10);

    let (block, _) = context.empty_block(&genesis_state, 10, H256::repeat_byte(1))?;
    let block_root = block.message.tree_hash_root();

    context.on_own_block(block.clone());
    context.on_slot(11);

    assert!(controller.block_at_slot_exact(11)?.is_none());

    let in_effect = controller
        .block_in_effect_at_slot(11)?
        .expect("a block is in effect at slot 11");

    assert_eq!(in_effect.value, block);

    let exact = controller
        .block_at_slot_exact(10)?
        .expect("a block was proposed in slot 10");

    assert_eq!(exact.value, block);

    let (found_block, found_state) = controller
        .block_and_state_in_effect_at_slot(11)?
        .expect("a block is in effect at slot 11");

    assert_eq!(found_block, block);
    assert_eq!(found_state.tree_hash_root(), block.message.state_root);

    assert_eq!(
        controller.state_by_block_root(block_root)?.map(|state| state.slot),
        Some(10),
    );

    Ok(())
}

// Scenario: `state_at_slot_exact` regenerates the state forward through empty
// slots deterministically.
#[test]
fn state_at_slot_exact_regenerates_forward() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();

    context.on_slot(10);

    let (block, block_state) = context.empty_block(&genesis_state, 10, H256::repeat_byte(1))?;

    context.on_own_block(block);
    context.on_slot(13);

    let state = controller
        .state_at_slot_exact(13)?
        .expect("the state can be regenerated from the block at slot 10");

    assert_eq!(state.slot, 13);

    let mut expected = block_state.as_ref().clone();
    transition_functions::process_slots(&mut expected, 13)?;

    assert_eq!(*state, expected);

    // Regeneration to a slot after the current one fails into an empty result.
    assert!(controller.state_at_slot_exact(64)?.is_none());

    Ok(())
}

// Scenario: a chain with full attestation participation justifies and
// finalizes; finalized blocks move to storage and remain queryable.
#[test]
fn finalization_archives_blocks_and_answers_historical_queries() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();
    let genesis_root = controller.head_block_root();

    let mut blocks = vec![(genesis_root, controller.head_block())];
    let mut states = vec![genesis_state];

    for slot in 1..=32 {
        let previous_root = blocks[slot as usize - 1].0;
        let previous_state = &states[slot as usize - 1];

        let attestation =
            context.singular_attestation(previous_state, slot - 1, 0, previous_root)?;

        let (block, state) = context.block_with_attestations(
            previous_state,
            slot,
            H256::repeat_byte(slot as u8),
            vec![attestation.as_ref().clone()],
        )?;

        context.on_slot(slot);
        context.on_own_block(block.clone());

        blocks.push((block.message.tree_hash_root(), block));
        states.push(state);
    }

    assert_eq!(controller.finalized_epoch(), 2);

    // The boundary: epoch 2 starts at slot 16.
    assert!(controller.is_finalized(15));
    assert!(controller.is_finalized(16));
    assert!(!controller.is_finalized(17));

    // Archived blocks are served from storage through the same query surface.
    let (root_at_3, block_at_3) = &blocks[3];

    let found = controller
        .block_at_slot_exact(3)?
        .expect("the block at slot 3 is archived");

    assert!(found.finalized);
    assert_eq!(found.value, *block_at_3);

    assert_eq!(
        controller
            .block_by_root(*root_at_3)?
            .map(|block| block.value),
        Some(block_at_3.clone()),
    );

    // The chain is still queryable across the finalization boundary.
    let in_effect = controller
        .block_in_effect_at_slot(20)?
        .expect("a block is in effect at slot 20");

    assert_eq!(in_effect.value.slot(), 20);

    // State root round trip through the historical index.
    let state_root_at_3 = block_at_3.message.state_root;

    let state = controller
        .state_by_state_root(state_root_at_3)?
        .expect("the state at slot 3 is archived");

    assert_eq!(state.tree_hash_root(), state_root_at_3);

    let latest_state = controller
        .latest_state_at_slot(3)?
        .expect("a state is in effect at slot 3");

    assert_eq!(latest_state.slot, 3);

    Ok(())
}

// Ancestor walks stay on the canonical chain and are ordered by slot.
#[test]
fn ancestor_roots_walk_the_recent_chain() -> Result<()> {
    let context = Context::new()?;
    let controller = context.controller().clone();

    let genesis_state = context.genesis_state();

    let (first, first_state) = context.empty_block(&genesis_state, 1, H256::repeat_byte(1))?;
    let (second, _) = context.empty_block(&first_state, 3, H256::repeat_byte(2))?;

    context.on_slot(3);
    context.on_own_block(first.clone());
    context.on_own_block(second.clone());

    let roots = controller.ancestor_roots(1, 1, 3);

    assert_eq!(
        roots,
        vec![
            (1, first.message.tree_hash_root()),
            (2, first.message.tree_hash_root()),
            (3, second.message.tree_hash_root()),
        ],
    );

    Ok(())
}
