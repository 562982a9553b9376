use std::sync::Arc;

use fork_choice_store::{
    AggregateAndProofAction, AggregateAndProofOrigin, AttestationAction, AttestationItem,
    AttestationValidationError, BlockOrigin,
};
use serde::Serialize;
use strum::IntoStaticStr;
use types::{
    phase0::containers::{SignedAggregateAndProof, SignedBeaconBlock},
    preset::Preset,
};

/// An opaque handle to a gossip message. The transport hands it in with every
/// gossiped object and expects it back with the propagation verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct GossipId {
    pub source: PeerId,
    pub message_id: u64,
}

pub type PeerId = u64;

pub struct PendingBlock<P: Preset> {
    pub block: Arc<SignedBeaconBlock<P>>,
    pub origin: BlockOrigin,
}

pub type PendingAttestation<P> = AttestationItem<P, GossipId>;

pub struct PendingAggregateAndProof<P: Preset> {
    pub aggregate_and_proof: Arc<SignedAggregateAndProof<P>>,
    pub origin: AggregateAndProofOrigin<GossipId>,
}

pub type VerifyAttestationResult<P> =
    Result<AttestationAction<P, GossipId>, AttestationValidationError<P, GossipId>>;

pub struct VerifyAggregateAndProofResult<P: Preset> {
    pub result: anyhow::Result<AggregateAndProofAction<P>>,
    pub origin: AggregateAndProofOrigin<GossipId>,
}

#[derive(Clone, Copy, Debug, IntoStaticStr, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum MutatorRejectionReason {
    InvalidAggregateAndProof,
    InvalidAttestation,
    InvalidBlock,
}
