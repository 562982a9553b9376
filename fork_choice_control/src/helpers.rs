use std::sync::Arc;

use anyhow::Result;
use bls::SecretKey;
use clock::Tick;
use crossbeam_utils::sync::WaitGroup;
use database::Database;
use fork_choice_store::{AttestationItem, AttestationOrigin, StoreConfig};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use helper_functions::{accessors, misc, verifier::NullVerifier};
use itertools::Itertools as _;
use operation_pools::AttestationAggPool;
use ssz_types::{BitList, VariableList};
use tree_hash::TreeHash as _;
use types::{
    phase0::consts::{DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER},
    phase0::containers::{
        Attestation, AttestationData, BeaconBlock, BeaconBlockBody, BeaconState, Checkpoint,
        SignedBeaconBlock, Validator,
    },
    phase0::primitives::{CommitteeIndex, SignatureBytes, Slot, SubnetId, H256},
    preset::Minimal,
};

use crate::{
    controller::{Controller, MutatorHandle},
    messages::{AttestationVerifierMessage, LivenessMessage, P2pMessage},
    misc::GossipId,
    storage::Storage,
};

pub type TestController =
    Controller<Minimal, UnboundedSender<AttestationVerifierMessage<Minimal, WaitGroup>>, WaitGroup>;

const VALIDATOR_COUNT: usize = 8;
const EFFECTIVE_BALANCE: u64 = 32_000_000_000;

pub struct Context {
    controller: Arc<TestController>,
    #[expect(
        dead_code,
        reason = "Keep the `MutatorHandle` around to avoid joining the mutator thread prematurely."
    )]
    mutator_handle: MutatorHandle<Minimal, WaitGroup>,
    secret_keys: Vec<SecretKey>,
    p2p_rx: UnboundedReceiver<P2pMessage>,
    liveness_rx: UnboundedReceiver<LivenessMessage>,
    #[expect(
        dead_code,
        reason = "Dropping the receiver would make submissions through the verifier channel fail."
    )]
    verifier_rx: UnboundedReceiver<AttestationVerifierMessage<Minimal, WaitGroup>>,
}

impl Context {
    pub fn new() -> Result<Self> {
        let secret_keys = (0..VALIDATOR_COUNT)
            .map(|index| {
                let seed = [index as u8 + 1; 32];
                SecretKey::derive(&seed)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (genesis_block, genesis_state) = genesis(&secret_keys);

        let storage = Arc::new(Storage::new(Database::in_memory()));
        let attestation_agg_pool = Arc::new(AttestationAggPool::default());

        let (verifier_tx, verifier_rx) = futures::channel::mpsc::unbounded();
        let (p2p_tx, p2p_rx) = futures::channel::mpsc::unbounded();
        let (liveness_tx, liveness_rx) = futures::channel::mpsc::unbounded();

        let (controller, mutator_handle) = Controller::new(
            StoreConfig::default(),
            genesis_block,
            genesis_state,
            Tick::start_of_slot(0),
            storage,
            attestation_agg_pool,
            verifier_tx,
            p2p_tx,
            liveness_tx,
        )?;

        Ok(Self {
            controller,
            mutator_handle,
            secret_keys,
            p2p_rx,
            liveness_rx,
            verifier_rx,
        })
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<TestController> {
        &self.controller
    }

    pub fn on_slot(&self, slot: Slot) {
        self.controller.on_tick(Tick::start_of_slot(slot));
        self.controller.wait_for_tasks();
    }

    pub fn on_own_block(&self, block: Arc<SignedBeaconBlock<Minimal>>) {
        self.controller.on_own_block(block);
        self.controller.wait_for_tasks();
    }

    pub fn on_gossip_block(&self, block: Arc<SignedBeaconBlock<Minimal>>) {
        self.controller.on_gossip_block(block);
        self.controller.wait_for_tasks();
    }

    pub fn on_gossip_singular_attestation(
        &self,
        attestation: Arc<Attestation<Minimal>>,
        gossip_id: GossipId,
    ) {
        let subnet_id = subnet_for(&attestation);

        self.controller.on_singular_attestation(AttestationItem::unverified(
            attestation,
            AttestationOrigin::Gossip(subnet_id, gossip_id),
        ));

        self.controller.wait_for_tasks();
    }

    pub fn on_own_singular_attestation(&self, attestation: Arc<Attestation<Minimal>>) {
        let subnet_id = subnet_for(&attestation);

        self.controller.on_own_attestation(attestation, subnet_id);
        self.controller.wait_for_tasks();
    }

    pub fn next_liveness_message(&mut self) -> Option<LivenessMessage> {
        self.liveness_rx.try_next().ok().flatten()
    }

    pub fn drain_p2p_messages(&mut self) -> Vec<P2pMessage> {
        core::iter::from_fn(|| self.p2p_rx.try_next().ok().flatten()).collect_vec()
    }

    /// Builds a block with the given attestations on top of `pre_state` and
    /// returns it along with its post-state.
    pub fn block_with_attestations(
        &self,
        pre_state: &Arc<BeaconState<Minimal>>,
        slot: Slot,
        graffiti: H256,
        attestations: Vec<Attestation<Minimal>>,
    ) -> Result<(Arc<SignedBeaconBlock<Minimal>>, Arc<BeaconState<Minimal>>)> {
        let mut state = pre_state.as_ref().clone();

        if state.slot < slot {
            transition_functions::process_slots(&mut state, slot)?;
        }

        let proposer_index = accessors::get_beacon_proposer_index(&state, slot)
            .expect("the test validator registry is not empty");

        let mut message = BeaconBlock {
            slot,
            proposer_index,
            parent_root: accessors::latest_block_root(&state),
            state_root: H256::ZERO,
            body: BeaconBlockBody {
                graffiti,
                attestations: VariableList::from(attestations),
            },
        };

        transition_functions::process_block(&mut state, &message, &mut NullVerifier)?;

        message.state_root = state.tree_hash_root();

        let domain = misc::compute_domain(DOMAIN_BEACON_PROPOSER, state.genesis_validators_root);
        let signing_root = misc::compute_signing_root(&message, domain);
        let signature = self.secret_keys[proposer_index as usize].sign(signing_root);

        Ok((
            Arc::new(SignedBeaconBlock { message, signature }),
            Arc::new(state),
        ))
    }

    pub fn empty_block(
        &self,
        pre_state: &Arc<BeaconState<Minimal>>,
        slot: Slot,
        graffiti: H256,
    ) -> Result<(Arc<SignedBeaconBlock<Minimal>>, Arc<BeaconState<Minimal>>)> {
        self.block_with_attestations(pre_state, slot, graffiti, vec![])
    }

    /// A signed singular attestation by the only member of the committee at
    /// `(slot, committee_index)`, voting for `head_root` on the chain whose
    /// post-state at `head_root` is `head_state`.
    pub fn singular_attestation(
        &self,
        head_state: &BeaconState<Minimal>,
        slot: Slot,
        committee_index: CommitteeIndex,
        head_root: H256,
    ) -> Result<Arc<Attestation<Minimal>>> {
        let committee = accessors::beacon_committee(head_state, slot, committee_index)?;

        let mut aggregation_bits =
            BitList::with_capacity(committee.len()).expect("committee fits in aggregation bitlist");

        aggregation_bits
            .set(0, true)
            .expect("the committee is not empty");

        let epoch = misc::compute_epoch_at_slot::<Minimal>(slot);
        let epoch_start_slot = misc::compute_start_slot_at_epoch::<Minimal>(epoch);

        // The boundary block root comes from the head state's ring buffer, so
        // attestations can be constructed for blocks not yet in the store.
        let target_root = if head_state.slot <= epoch_start_slot {
            accessors::latest_block_root(head_state)
        } else {
            let ring_length = head_state.block_roots.len() as u64;
            head_state.block_roots[(epoch_start_slot % ring_length) as usize]
        };

        let data = AttestationData {
            slot,
            index: committee_index,
            beacon_block_root: head_root,
            source: head_state.current_justified_checkpoint,
            target: Checkpoint {
                epoch,
                root: target_root,
            },
        };

        let domain =
            misc::compute_domain(DOMAIN_BEACON_ATTESTER, head_state.genesis_validators_root);
        let signing_root = misc::compute_signing_root(&data, domain);
        let validator_index = committee[0];
        let signature = self.secret_keys[validator_index as usize].sign(signing_root);

        Ok(Arc::new(Attestation {
            aggregation_bits,
            data,
            signature,
        }))
    }

    #[must_use]
    pub fn genesis_state(&self) -> Arc<BeaconState<Minimal>> {
        self.controller.head_state()
    }
}

#[must_use]
pub fn gossip_id(message_id: u64) -> GossipId {
    GossipId {
        source: 1,
        message_id,
    }
}

#[must_use]
pub fn subnet_for(attestation: &Attestation<Minimal>) -> SubnetId {
    let committees_per_slot = 1;

    misc::compute_subnet_for_attestation::<Minimal>(
        committees_per_slot,
        attestation.data.slot,
        attestation.data.index,
    )
    .expect("the committee index is within bounds")
}

fn genesis(
    secret_keys: &[SecretKey],
) -> (Arc<SignedBeaconBlock<Minimal>>, Arc<BeaconState<Minimal>>) {
    let validators = secret_keys
        .iter()
        .map(|secret_key| Validator {
            pubkey: secret_key.to_public_key(),
            effective_balance: EFFECTIVE_BALANCE,
            activation_epoch: 0,
            exit_epoch: u64::MAX,
        })
        .collect_vec();

    let participation = vec![0_u8; validators.len()];

    let mut state = BeaconState::<Minimal> {
        genesis_time: 0,
        genesis_validators_root: H256::repeat_byte(0x42),
        validators: VariableList::from(validators),
        previous_epoch_participation: VariableList::from(participation.clone()),
        current_epoch_participation: VariableList::from(participation),
        ..BeaconState::default()
    };

    let mut message = BeaconBlock {
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
