//! The vote store behind the fork choice gateway.
//!
//! Block and attestation processing is split into pairs of `validate_*` and
//! `apply_*` methods. The `validate_*` methods do not mutate [`Store`] and can
//! run on snapshots in parallel. The `apply_*` methods are only ever called by
//! the single mutator thread, so the store itself needs no interior
//! synchronization.
//!
//! Statements that would delay an object in the fork choice specification are
//! represented by `DelayUntil*`/`DeferUntilNextSlot` action variants rather
//! than errors. Validation failures that warrant penalizing the source are
//! represented by [`AttestationValidationError`].

pub use crate::{
    error::AttestationValidationError,
    misc::{
        AggregateAndProofAction, AggregateAndProofOrigin, ApplyBlockChanges, ApplyTickChanges,
        AttestationAction, AttestationItem, AttestationOrigin, BlockAction, BlockOrigin,
        ChainLink, DeferredVotes, LatestMessage, SignatureStatus, ValidAttestation,
    },
    state_cache::StateCacheProcessor,
    store::Store,
    store_config::StoreConfig,
};

mod error;
mod misc;
mod state_cache;
mod store;
mod store_config;
