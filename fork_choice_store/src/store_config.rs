#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// How many distinct block roots the pending park may key before the
    /// oldest bucket is evicted.
    pub max_delayed_until_block_roots: usize,
    /// How many future slots the future park may hold buckets for.
    pub max_delayed_until_slot_buckets: usize,
    /// How many slots of deferred votes may be waiting at once.
    pub max_deferred_slot_buckets: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_delayed_until_block_roots: 16_384,
            max_delayed_until_slot_buckets: 16,
            max_deferred_slot_buckets: 4,
        }
    }
}

impl StoreConfig {
    /// Small bounds for tests exercising eviction.
    #[must_use]
    pub const fn tiny() -> Self {
        Self {
            max_delayed_until_block_roots: 2,
            max_delayed_until_slot_buckets: 2,
            max_deferred_slot_buckets: 2,
        }
    }
}
