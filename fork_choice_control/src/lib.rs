//! Orchestration around the fork choice store.
//!
//! This crate handles the following concerns:
//! - The public ingestion surface ([`Controller`]) and the single-writer
//!   mutator thread behind it.
//! - Parking and retrying objects that cannot be processed immediately
//!   ([`waiting`]).
//! - [Persistence of the finalized chain](`storage`).
//! - Parallel validation and task priorities ([`Controller::wait_for_tasks`]
//!   exists to make this deterministic in tests).
//! - Combined recent-and-historical chain data queries ([`queries`]).
//! - Notifying subscribers and other components about processed attestations.
//!
//! This crate exists primarily to separate [`fork_choice_store`] from
//! persistence. [`fork_choice_store`] should never depend on a database.

pub use crate::{
    controller::{Controller, MutatorHandle},
    messages::{AttestationVerifierMessage, LivenessMessage, MutatorMessage, P2pMessage},
    misc::{
        GossipId, MutatorRejectionReason, PeerId, VerifyAggregateAndProofResult,
        VerifyAttestationResult,
    },
    queries::Snapshot,
    storage::Storage,
    subscribers::{Subscribers, SubscriptionId},
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

mod controller;
mod messages;
mod misc;
mod mutator;
mod queries;
mod state_at_slot_cache;
mod storage;
mod subscribers;
mod tasks;
mod thread_pool;
mod unbounded_sink;
mod wait;
mod waiting;

#[cfg(test)]
mod extra_tests;
#[cfg(test)]
mod helpers;
