use anyhow::{ensure, Result};
use helper_functions::{
    accessors, misc, mutators, predicates,
    error::SignatureKind,
    verifier::Verifier,
};
use tree_hash::TreeHash as _;
use types::{
    phase0::consts::{
        DOMAIN_BEACON_PROPOSER, MIN_ATTESTATION_INCLUSION_DELAY, TIMELY_SOURCE_FLAG,
        TIMELY_TARGET_FLAG,
    },
    phase0::containers::{Attestation, BeaconBlock, BeaconState, SignedBeaconBlock},
    phase0::primitives::ParticipationFlags,
    preset::Preset,
};

use crate::{epoch_processing, error::Error};

/// Applies a block to a state already advanced to the block's slot.
///
/// The proposer signature is checked separately through
/// [`validate_block_signature`] so callers can skip it for trusted blocks.
pub fn process_block<P: Preset>(
    state: &mut BeaconState<P>,
    block: &BeaconBlock<P>,
    verifier: &mut impl Verifier,
) -> Result<()> {
    process_block_header(state, block)?;

    for attestation in &block.body.attestations {
        process_attestation(state, attestation, verifier)?;
    }

    Ok(())
}

pub fn validate_block_signature<P: Preset>(
    state: &BeaconState<P>,
    block: &SignedBeaconBlock<P>,
    verifier: &mut impl Verifier,
) -> Result<()> {
    let public_key = accessors::public_key(state, block.proposer_index())?;
    let domain = misc::compute_domain(DOMAIN_BEACON_PROPOSER, state.genesis_validators_root);
    let signing_root = misc::compute_signing_root(&block.message, domain);

    verifier.verify_singular(signing_root, block.signature, public_key, SignatureKind::Block)?;

    Ok(())
}

fn process_block_header<P: Preset>(state: &mut BeaconState<P>, block: &BeaconBlock<P>) -> Result<()> {
    ensure!(
        block.slot == state.slot,
        Error::SlotMismatch {
            block_slot: block.slot,
            state_slot: state.slot,
        },
    );

    let expected_parent_root = accessors::latest_block_root(state);

    ensure!(
        block.parent_root == expected_parent_root,
        Error::ParentRootMismatch {
            in_block: block.parent_root,
            computed: expected_parent_root,
        },
    );

    let expected_proposer = accessors::get_beacon_proposer_index(state, block.slot);

    ensure!(
        expected_proposer == Some(block.proposer_index),
        Error::UnexpectedProposer {
            in_block: block.proposer_index,
            computed: expected_proposer,
        },
    );

    state.latest_block_header = block.to_header();

    Ok(())
}

fn process_attestation<P: Preset>(
    state: &mut BeaconState<P>,
    attestation: &Attestation<P>,
    verifier: &mut impl Verifier,
) -> Result<()> {
    let data = attestation.data;
    let current_epoch = accessors::get_current_epoch(state);
    let previous_epoch = accessors::get_previous_epoch(state);

    ensure!(
        data.target.epoch == current_epoch || data.target.epoch == previous_epoch,
        Error::TargetEpochOutOfRange {
            epoch: data.target.epoch,
        },
    );

    ensure!(
        data.target.epoch == misc::compute_epoch_at_slot::<P>(data.slot),
        Error::AttestationTargetsWrongEpoch {
            target: data.target,
            slot: data.slot,
        },
    );

    ensure!(
        data.slot + MIN_ATTESTATION_INCLUSION_DELAY <= state.slot,
        Error::AttestationOutsideInclusionWindow {
            attestation_slot: data.slot,
            state_slot: state.slot,
        },
    );

    let justified = if data.target.epoch == current_epoch {
        state.current_justified_checkpoint
    } else {
        state.previous_justified_checkpoint
    };

    ensure!(
        data.source == justified,
        Error::SourceMismatch {
            attestation_source: data.source,
            justified,
        },
    );

    let indexed_attestation = accessors::get_indexed_attestation(state, attestation)?;

    predicates::validate_constructed_indexed_attestation(state, &indexed_attestation, verifier)?;

    let flags = participation_flags(state, attestation)?;

    for validator_index in &indexed_attestation.attesting_indices {
        mutators::add_participation_flags(state, *validator_index, data.target.epoch, flags);
    }

    Ok(())
}

fn participation_flags<P: Preset>(
    state: &BeaconState<P>,
    attestation: &Attestation<P>,
) -> Result<ParticipationFlags> {
    let data = attestation.data;
    let mut flags = TIMELY_SOURCE_FLAG;

    let boundary_root = epoch_processing::epoch_boundary_block_root(state, data.target.epoch)?;

    if data.target.root == boundary_root {
        flags |= TIMELY_TARGET_FLAG;
    }

    Ok(flags)
}
