pub use crate::attestation_agg_pool::AttestationAggPool;

mod attestation_agg_pool;
