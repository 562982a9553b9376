//! The signature verification service.
//!
//! Attestations and aggregates submitted through the controller are buffered
//! here, prevalidated against a store snapshot in parallel, and have their
//! BLS signatures verified in batches. A failed batch falls back to singular
//! processing so one bad signature cannot poison valid attestations submitted
//! alongside it.
//!
//! The service's lifecycle is owned by the controller: it runs until it
//! receives [`AttestationVerifierMessage::Stop`], which the controller sends
//! before stopping the mutator.

use std::sync::Arc;

use anyhow::Result;
use fork_choice_control::{
    AttestationVerifierMessage, Controller, GossipId, UnboundedSink,
    VerifyAggregateAndProofResult, VerifyAttestationResult, Wait,
};
use fork_choice_store::{AggregateAndProofAction, AggregateAndProofOrigin, AttestationAction, AttestationItem};
use futures::{channel::mpsc::UnboundedReceiver, StreamExt as _};
use helper_functions::{accessors, predicates, verifier::{MultiVerifier, Verifier as _}};
use itertools::Either;
use log::{debug, warn};
use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};
use types::{
    phase0::containers::{BeaconState, SignedAggregateAndProof},
    preset::Preset,
};

const MAX_BATCH_SIZE: usize = 64;

pub struct AttestationVerifier<P: Preset, A, W: Wait> {
    controller: Arc<Controller<P, A, W>>,
    rx: UnboundedReceiver<AttestationVerifierMessage<P, W>>,
}

impl<P, A, W> AttestationVerifier<P, A, W>
where
    P: Preset,
    A: UnboundedSink<AttestationVerifierMessage<P, W>>,
    W: Wait,
{
    #[must_use]
    pub const fn new(
        controller: Arc<Controller<P, A, W>>,
        rx: UnboundedReceiver<AttestationVerifierMessage<P, W>>,
    ) -> Self {
        Self { controller, rx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(message) = self.rx.next().await {
            let mut attestations = vec![];
            let mut aggregates = vec![];
            // Wait groups are kept alive until the whole batch is handed off.
            let mut wait_groups = vec![];

            let mut stop = !Self::buffer_message(
                message,
                &mut attestations,
                &mut aggregates,
                &mut wait_groups,
            );

            // Whatever accumulated while the previous batch was being
            // verified coalesces into the next batch.
            while !stop
                && attestations.len() < MAX_BATCH_SIZE
                && aggregates.len() < MAX_BATCH_SIZE
            {
                match self.rx.try_next() {
                    Ok(Some(message)) => {
                        stop = !Self::buffer_message(
                            message,
                            &mut attestations,
                            &mut aggregates,
                            &mut wait_groups,
                        );
                    }
                    // The channel is empty but the controller is still alive.
                    Err(_) => break,
                    // The channel was closed.
                    Ok(None) => {
                        stop = true;
                    }
                }
            }

            if !attestations.is_empty() {
                self.process_attestation_batch(attestations);
            }

            if !aggregates.is_empty() {
                self.process_aggregate_batch(aggregates);
            }

            drop(wait_groups);

            if stop {
                break;
            }
        }

        debug!("attestation verifier stopped");

        Ok(())
    }

    /// Returns `false` if the service should stop.
    fn buffer_message(
        message: AttestationVerifierMessage<P, W>,
        attestations: &mut Vec<AttestationItem<P, GossipId>>,
        aggregates: &mut Vec<AggregateWithOrigin<P>>,
        wait_groups: &mut Vec<W>,
    ) -> bool {
        match message {
            AttestationVerifierMessage::Attestation {
                wait_group,
                attestation,
            } => {
                attestations.push(attestation);
                wait_groups.push(wait_group);
                true
            }
            AttestationVerifierMessage::AggregateAndProof {
                wait_group,
                aggregate_and_proof,
                origin,
            } => {
                aggregates.push(AggregateWithOrigin {
                    aggregate: aggregate_and_proof,
                    origin,
                });
                wait_groups.push(wait_group);
                true
            }
            AttestationVerifierMessage::Stop => false,
        }
    }

    fn process_attestation_batch(&self, attestations: Vec<AttestationItem<P, GossipId>>) {
        let snapshot = self.controller.snapshot();

        let (accepted, other): (Vec<_>, Vec<_>) = attestations
            .into_par_iter()
            .map(|attestation| snapshot.prevalidate_verifier_attestation(attestation))
            .partition_map(|result| match result {
                Ok(AttestationAction::Accept { .. })
                | Ok(AttestationAction::DeferUntilNextSlot { .. }) => Either::Left(result),
                _ => Either::Right(result),
            });

        self.send_results_to_fork_choice(other);

        match Self::verify_attestation_batch_signatures(&accepted, &snapshot.head_state()) {
            Ok(()) => {
                let accepted = accepted
                    .into_iter()
                    .map(|result| result.map(AttestationAction::into_verified))
                    .collect();

                self.send_results_to_fork_choice(accepted);
            }
            Err(error) => {
                warn!("signature verification for gossip attestation batch failed: {error}");

                for result in accepted.into_iter().flatten() {
                    match result {
                        AttestationAction::Accept { attestation, .. }
                        | AttestationAction::DeferUntilNextSlot { attestation, .. } => {
                            self.controller.on_singular_attestation(attestation);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn send_results_to_fork_choice(&self, results: Vec<VerifyAttestationResult<P>>) {
        if results.is_empty() {
            return;
        }

        self.controller.on_attestation_batch(results);
    }

    fn verify_attestation_batch_signatures(
        results: &[VerifyAttestationResult<P>],
        state: &BeaconState<P>,
    ) -> Result<()> {
        let mut verifier = MultiVerifier::default();

        verifier.reserve(results.len());

        for result in results {
            let attestation = match result {
                Ok(AttestationAction::Accept { attestation, .. })
                | Ok(AttestationAction::DeferUntilNextSlot { attestation, .. }) => attestation,
                _ => continue,
            };

            if !attestation.verify_signatures() {
                continue;
            }

            let indexed_attestation = accessors::get_indexed_attestation(state, &attestation.item)?;

            predicates::validate_constructed_indexed_attestation(
                state,
                &indexed_attestation,
                &mut verifier,
            )?;
        }

        verifier.finish()?;

        Ok(())
    }

    fn process_aggregate_batch(&self, aggregates: Vec<AggregateWithOrigin<P>>) {
        let snapshot = self.controller.snapshot();

        let (accepted, other): (Vec<_>, Vec<_>) = aggregates
            .into_par_iter()
            .map(|aggregate_with_origin| {
                let AggregateWithOrigin { aggregate, origin } = aggregate_with_origin;
                snapshot.prevalidate_verifier_aggregate_and_proof(aggregate, origin)
            })
            .partition_map(|result| match result.result {
                Ok(AggregateAndProofAction::Accept { .. })
                | Ok(AggregateAndProofAction::DeferUntilNextSlot { .. }) => Either::Left(result),
                _ => Either::Right(result),
            });

        self.send_aggregate_results_to_fork_choice(other);

        match Self::verify_aggregate_batch_signatures(&accepted, &snapshot.head_state()) {
            Ok(()) => {
                self.send_aggregate_results_to_fork_choice(accepted);
            }
            Err(error) => {
                warn!(
                    "signature verification for gossip aggregate and proof batch failed: {error}",
                );

                for verify_result in accepted {
                    let VerifyAggregateAndProofResult { result, origin } = verify_result;

                    let aggregate_and_proof = match result {
                        Ok(AggregateAndProofAction::Accept {
                            aggregate_and_proof,
                            ..
                        })
                        | Ok(AggregateAndProofAction::DeferUntilNextSlot {
                            aggregate_and_proof,
                            ..
                        }) => aggregate_and_proof,
                        _ => continue,
                    };

                    self.controller
                        .on_aggregate_and_proof(aggregate_and_proof, origin);
                }
            }
        }
    }

    fn send_aggregate_results_to_fork_choice(&self, results: Vec<VerifyAggregateAndProofResult<P>>) {
        if results.is_empty() {
            return;
        }

        self.controller.on_aggregate_and_proof_batch(results);
    }

    fn verify_aggregate_batch_signatures(
        results: &[VerifyAggregateAndProofResult<P>],
        state: &BeaconState<P>,
    ) -> Result<()> {
        use helper_functions::error::SignatureKind;
        use helper_functions::misc;
        use types::phase0::consts::{DOMAIN_AGGREGATE_AND_PROOF, DOMAIN_SELECTION_PROOF};

        let mut verifier = MultiVerifier::default();

        verifier.reserve(results.len() * 3);

        for verify_result in results {
            let aggregate_and_proof = match &verify_result.result {
                Ok(AggregateAndProofAction::Accept {
                    aggregate_and_proof,
                    ..
                })
                | Ok(AggregateAndProofAction::DeferUntilNextSlot {
                    aggregate_and_proof,
                    ..
                }) => aggregate_and_proof,
                _ => continue,
            };

            if !verify_result.origin.verify_signatures() {
                continue;
            }

            let SignedAggregateAndProof { message, signature } = aggregate_and_proof.as_ref();

            let public_key = accessors::public_key(state, message.aggregator_index)?;

            let selection_domain =
                misc::compute_domain(DOMAIN_SELECTION_PROOF, state.genesis_validators_root);

            verifier.verify_singular(
                misc::compute_signing_root(&message.aggregate.data.slot, selection_domain),
                message.selection_proof,
                public_key,
                SignatureKind::SelectionProof,
            )?;

            let aggregate_and_proof_domain =
                misc::compute_domain(DOMAIN_AGGREGATE_AND_PROOF, state.genesis_validators_root);

            verifier.verify_singular(
                misc::compute_signing_root(message, aggregate_and_proof_domain),
                *signature,
                public_key,
                SignatureKind::AggregateAndProof,
            )?;

            let indexed_attestation =
                accessors::get_indexed_attestation(state, &message.aggregate)?;

            predicates::validate_constructed_indexed_attestation(
                state,
                &indexed_attestation,
                &mut verifier,
            )?;
        }

        verifier.finish()?;

        Ok(())
    }
}

struct AggregateWithOrigin<P: Preset> {
    aggregate: Arc<SignedAggregateAndProof<P>>,
    origin: AggregateAndProofOrigin<GossipId>,
}

#[cfg(test)]
mod tests {
    use clock::Tick;
    use crossbeam_utils::sync::WaitGroup;
    use database::Database;
    use fork_choice_control::{P2pMessage, Storage};
    use fork_choice_store::StoreConfig;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
    use operation_pools::AttestationAggPool;
    use ssz_types::{BitList, VariableList};
    use tree_hash::TreeHash as _;
    use types::{
        phase0::containers::{
            Attestation, AttestationData, BeaconBlock, BeaconBlockBody, BeaconState, Checkpoint,
            SignedBeaconBlock, Validator,
        },
        phase0::primitives::{PublicKeyBytes, SignatureBytes, H256},
        preset::Minimal,
    };

    use super::*;

    type TestController = Controller<
        Minimal,
        UnboundedSender<AttestationVerifierMessage<Minimal, WaitGroup>>,
        WaitGroup,
    >;

    fn genesis() -> (Arc<SignedBeaconBlock<Minimal>>, Arc<BeaconState<Minimal>>) {
        let validators = (0..8_u8)
            .map(|index| Validator {
                pubkey: PublicKeyBytes::repeat_byte(index),
                effective_balance: 32_000_000_000,
                activation_epoch: 0,
                exit_epoch: u64::MAX,
            })
            .collect::<Vec<_>>();

        let participation = vec![0_u8; validators.len()];

        let mut state = BeaconState::<Minimal> {
            validators: VariableList::from(validators),
            previous_epoch_participation: VariableList::from(participation.clone()),
            current_epoch_participation: VariableList::from(participation),
            ..BeaconState::default()
        };

        let mut message = BeaconBlock::<Minimal> {
            slot: 0,
            proposer_index: 0,
            parent_root: H256::ZERO,
            state_root: H256::ZERO,
            body: BeaconBlockBody {
                graffiti: H256::ZERO,
                attestations: VariableList::default(),
            },
        };

        state.latest_block_header = message.to_header();
        message.state_root = state.tree_hash_root();

        (
            Arc::new(SignedBeaconBlock {
                message,
                signature: SignatureBytes::ZERO,
            }),
            Arc::new(state),
        )
    }

    #[tokio::test]
    async fn service_routes_prevalidated_results_to_the_mutator() -> Result<()> {
        let (genesis_block, genesis_state) = genesis();
        let genesis_root = genesis_block.message.tree_hash_root();

        let (verifier_tx, verifier_rx) = futures::channel::mpsc::unbounded();
        let (p2p_tx, mut p2p_rx): (_, UnboundedReceiver<P2pMessage>) =
            futures::channel::mpsc::unbounded();
        let (liveness_tx, _liveness_rx) = futures::channel::mpsc::unbounded();

        let (controller, _mutator_handle): (Arc<TestController>, _) = Controller::new(
            StoreConfig::default(),
            genesis_block,
            genesis_state,
            Tick::start_of_slot(0),
            Arc::new(Storage::new(Database::in_memory())),
            Arc::new(AttestationAggPool::default()),
            Clone::clone(&verifier_tx),
            p2p_tx,
            liveness_tx,
        )?;

        controller.on_tick(Tick::start_of_slot(1));
        controller.wait_for_tasks();

        let unknown_root = H256::repeat_byte(0xaa);

        let mut aggregation_bits = BitList::with_capacity(1).expect("length is under the limit");
        aggregation_bits.set(0, true).expect("bit 0 exists");

        let attestation = Arc::new(Attestation::<Minimal> {
            aggregation_bits,
            data: AttestationData {
                slot: 1,
                index: 0,
                beacon_block_root: unknown_root,
                source: Checkpoint::default(),
                target: Checkpoint {
                    epoch: 0,
                    root: genesis_root,
                },
            },
            signature: SignatureBytes::ZERO,
        });

        // Subnet 1 corresponds to slot 1 with one committee per slot.
        controller.on_gossip_attestation(attestation, 1, GossipId {
            source: 1,
            message_id: 7,
        });

        // The batch buffered before the stop message is still processed.
        AttestationVerifierMessage::Stop.send(&verifier_tx);

        let verifier = AttestationVerifier::new(Arc::clone(&controller), verifier_rx);
        verifier.run().await?;

        controller.wait_for_tasks();

        // The attestation depends on an unknown block,
        // so the pipeline asked the network for it.
        let mut block_needed = false;

        while let Ok(Some(message)) = p2p_rx.try_next() {
            if matches!(message, P2pMessage::BlockNeeded(root, _) if root == unknown_root) {
                block_needed = true;
            }
        }

        assert!(block_needed);

        Ok(())
    }
}
