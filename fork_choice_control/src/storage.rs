//! Persistence for the finalized portion of the chain.
//!
//! Everything here is append-only. Keys are prefixed and big-endian encoded so
//! `Database::prev` answers at-or-before-slot queries directly:
//! - `b` + block root → finalized block (SSZ)
//! - `r` + slot → canonical block root at that slot
//! - `s` + block root → post-state of the finalized block (SSZ)
//! - `t` + state root → slot and block root of the state

use core::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use database::Database;
use fork_choice_store::ChainLink;
use ssz::{Decode as _, Encode as _};
use thiserror::Error;
use types::{
    phase0::containers::{BeaconState, SignedBeaconBlock},
    phase0::primitives::{Slot, H256},
    preset::Preset,
};

const BLOCK_BY_ROOT_PREFIX: u8 = b'b';
const BLOCK_ROOT_BY_SLOT_PREFIX: u8 = b'r';
const STATE_BY_BLOCK_ROOT_PREFIX: u8 = b's';
const SLOT_BY_STATE_ROOT_PREFIX: u8 = b't';

pub struct Storage<P> {
    database: Database,
    phantom: PhantomData<P>,
}

impl<P: Preset> Storage<P> {
    #[must_use]
    pub const fn new(database: Database) -> Self {
        Self {
            database,
            phantom: PhantomData,
        }
    }

    /// Appends newly finalized chain links, oldest first.
    pub fn archive_finalized<'links>(
        &self,
        chain_links: impl IntoIterator<Item = &'links ChainLink<P>>,
    ) -> Result<()> {
        let mut batch = vec![];

        for chain_link in chain_links {
            let block_root = chain_link.block_root;
            let slot = chain_link.slot();
            let state_root = chain_link.block.message.state_root;

            batch.push((
                prefixed_root(BLOCK_BY_ROOT_PREFIX, block_root),
                chain_link.block.as_ssz_bytes(),
            ));

            batch.push((
                prefixed_slot(BLOCK_ROOT_BY_SLOT_PREFIX, slot),
                block_root.as_slice().to_vec(),
            ));

            batch.push((
                prefixed_root(STATE_BY_BLOCK_ROOT_PREFIX, block_root),
                chain_link.state.as_ssz_bytes(),
            ));

            let mut slot_and_block_root = Vec::with_capacity(40);
            slot_and_block_root.extend_from_slice(&slot.to_be_bytes());
            slot_and_block_root.extend_from_slice(block_root.as_slice());

            batch.push((
                prefixed_root(SLOT_BY_STATE_ROOT_PREFIX, state_root),
                slot_and_block_root,
            ));
        }

        self.database.put_batch(batch)
    }

    pub fn contains_finalized_block(&self, block_root: H256) -> Result<bool> {
        self.database
            .contains_key(prefixed_root(BLOCK_BY_ROOT_PREFIX, block_root))
    }

    pub fn finalized_block_by_root(
        &self,
        block_root: H256,
    ) -> Result<Option<Arc<SignedBeaconBlock<P>>>> {
        self.database
            .get(prefixed_root(BLOCK_BY_ROOT_PREFIX, block_root))?
            .map(|bytes| decode_block(&bytes))
            .transpose()
    }

    /// The canonical finalized block proposed in or most recently before `slot`.
    pub fn latest_finalized_block_at_slot(
        &self,
        slot: Slot,
    ) -> Result<Option<(Arc<SignedBeaconBlock<P>>, H256)>> {
        let Some(block_root) = self.finalized_block_root_before_or_at(slot)? else {
            return Ok(None);
        };

        let block = self
            .finalized_block_by_root(block_root)?
            .ok_or(Error::BlockMissingForIndexedRoot { block_root })?;

        Ok(Some((block, block_root)))
    }

    pub fn finalized_state_by_block_root(
        &self,
        block_root: H256,
    ) -> Result<Option<Arc<BeaconState<P>>>> {
        self.database
            .get(prefixed_root(STATE_BY_BLOCK_ROOT_PREFIX, block_root))?
            .map(|bytes| decode_state(&bytes))
            .transpose()
    }

    /// The post-state of the latest finalized block in effect at `slot`.
    pub fn latest_finalized_state_at_slot(
        &self,
        slot: Slot,
    ) -> Result<Option<Arc<BeaconState<P>>>> {
        let Some(block_root) = self.finalized_block_root_before_or_at(slot)? else {
            return Ok(None);
        };

        self.finalized_state_by_block_root(block_root)
    }

    pub fn slot_and_block_root_by_state_root(
        &self,
        state_root: H256,
    ) -> Result<Option<(Slot, H256)>> {
        let Some(bytes) = self
            .database
            .get(prefixed_root(SLOT_BY_STATE_ROOT_PREFIX, state_root))?
        else {
            return Ok(None);
        };

        let (slot_bytes, root_bytes) = bytes
            .split_first_chunk::<8>()
            .ok_or(Error::MalformedSlotAndBlockRoot { state_root })?;

        let slot = Slot::from_be_bytes(*slot_bytes);
        let block_root = H256::try_from(root_bytes)
            .map_err(|_| Error::MalformedSlotAndBlockRoot { state_root })?;

        Ok(Some((slot, block_root)))
    }

    pub fn finalized_slot_by_state_root(&self, state_root: H256) -> Result<Option<Slot>> {
        Ok(self
            .slot_and_block_root_by_state_root(state_root)?
            .map(|(slot, _)| slot))
    }

    fn finalized_block_root_before_or_at(&self, slot: Slot) -> Result<Option<H256>> {
        let Some((key, value)) = self
            .database
            .prev(prefixed_slot(BLOCK_ROOT_BY_SLOT_PREFIX, slot))?
        else {
            return Ok(None);
        };

        // `prev` may cross into a lower key space when no slot index exists.
        if key.first() != Some(&BLOCK_ROOT_BY_SLOT_PREFIX) {
            return Ok(None);
        }

        H256::try_from(value.as_slice())
            .map(Some)
            .map_err(|_| Error::MalformedBlockRootIndex.into())
    }
}

fn prefixed_root(prefix: u8, root: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(prefix);
    key.extend_from_slice(root.as_slice());
    key
}

fn prefixed_slot(prefix: u8, slot: Slot) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&slot.to_be_bytes());
    key
}

fn decode_block<P: Preset>(bytes: &[u8]) -> Result<Arc<SignedBeaconBlock<P>>> {
    SignedBeaconBlock::from_ssz_bytes(bytes)
        .map(Arc::new)
        .map_err(|error| Error::Deserialization(format!("{error:?}")).into())
}

fn decode_state<P: Preset>(bytes: &[u8]) -> Result<Arc<BeaconState<P>>> {
    BeaconState::from_ssz_bytes(bytes)
        .map(Arc::new)
        .map_err(|error| Error::Deserialization(format!("{error:?}")).into())
}

#[derive(Debug, Error)]
enum Error {
    #[error("slot index refers to block {block_root:?} that is not stored")]
    BlockMissingForIndexedRoot { block_root: H256 },
    #[error("stored value failed to deserialize: {0}")]
    Deserialization(String),
    #[error("block root index value has the wrong length")]
    MalformedBlockRootIndex,
    #[error("slot and block root for state root {state_root:?} have the wrong length")]
    MalformedSlotAndBlockRoot { state_root: H256 },
}
