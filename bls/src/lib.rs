//! Byte-level BLS12-381 types and verification routines over [`blst`].
//!
//! Keys and signatures are passed around the application in compressed form
//! and only decompressed at verification sites. Decompression failures are
//! reported as [`Error`], never panics.

pub use crate::{
    error::Error,
    secret_key::SecretKey,
    signature::{aggregate_signatures, fast_aggregate_verify, verify},
};

pub type PublicKeyBytes = alloy_primitives::FixedBytes<PUBLIC_KEY_SIZE>;
pub type SignatureBytes = alloy_primitives::FixedBytes<SIGNATURE_SIZE>;
pub type AggregateSignatureBytes = SignatureBytes;

pub const PUBLIC_KEY_SIZE: usize = 48;
pub const SIGNATURE_SIZE: usize = 96;

/// Domain separation tag for the proof-of-possession signature scheme.
pub const DOMAIN_SEPARATION_TAG: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

mod error;
mod secret_key;
mod signature;
