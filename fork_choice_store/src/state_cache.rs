use std::sync::Arc;

use anyhow::{ensure, Result};
use cached::{Cached as _, SizedCache};
use parking_lot::Mutex;
use std_ext::ArcExt as _;
use thiserror::Error;
use types::{
    phase0::containers::BeaconState,
    phase0::primitives::{Slot, H256},
    preset::Preset,
};

use crate::store::Store;

const DEFAULT_CACHE_SIZE: usize = 32;

/// Replays the deterministic empty-slot advance on demand.
///
/// Regeneration is pure. Results are cached per `(block root, slot)` pair so
/// repeated queries for the same historical state do not redo the replay.
pub struct StateCacheProcessor<P: Preset> {
    cache: Mutex<SizedCache<(H256, Slot), Arc<BeaconState<P>>>>,
}

impl<P: Preset> Default for StateCacheProcessor<P> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl<P: Preset> StateCacheProcessor<P> {
    #[must_use]
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: Mutex::new(SizedCache::with_size(cache_size)),
        }
    }

    /// Like [`Self::state_at_slot`] but reports an unknown base block as
    /// `None` rather than an error.
    pub fn try_state_at_slot(
        &self,
        store: &Store<P>,
        block_root: H256,
        slot: Slot,
    ) -> Result<Option<Arc<BeaconState<P>>>> {
        let Some(chain_link) = store.chain_link(block_root) else {
            return Ok(None);
        };

        self.process_slots(store, chain_link.state(), block_root, slot)
            .map(Some)
    }

    pub fn state_at_slot(
        &self,
        store: &Store<P>,
        block_root: H256,
        slot: Slot,
    ) -> Result<Arc<BeaconState<P>>> {
        self.try_state_at_slot(store, block_root, slot)?
            .ok_or(Error::BaseBlockNotFound { block_root })
            .map_err(Into::into)
    }

    /// Advances `state` to `slot` by applying empty-slot transitions.
    pub fn process_slots(
        &self,
        store: &Store<P>,
        state: Arc<BeaconState<P>>,
        block_root: H256,
        slot: Slot,
    ) -> Result<Arc<BeaconState<P>>> {
        if state.slot == slot {
            return Ok(state);
        }

        ensure!(
            slot <= store.slot(),
            Error::StateFromFutureSlot {
                requested: slot,
                current: store.slot(),
            },
        );

        ensure!(
            state.slot < slot,
            Error::RequestedSlotBeforeState {
                requested: slot,
                state_slot: state.slot,
            },
        );

        if let Some(state) = self.cache.lock().cache_get(&(block_root, slot)) {
            return Ok(state.clone_arc());
        }

        let mut post_state = state.as_ref().clone();
        transition_functions::process_slots(&mut post_state, slot)?;

        let post_state = Arc::new(post_state);

        self.cache
            .lock()
            .cache_set((block_root, slot), post_state.clone_arc());

        Ok(post_state)
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("base block {block_root:?} is not in the store")]
    BaseBlockNotFound { block_root: H256 },
    #[error("requested slot {requested} is earlier than the base state's slot {state_slot}")]
    RequestedSlotBeforeState { requested: Slot, state_slot: Slot },
    #[error("requested slot {requested} is later than the current slot {current}")]
    StateFromFutureSlot { requested: Slot, current: Slot },
}
