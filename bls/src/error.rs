use blst::BLST_ERROR;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Error)]
pub enum Error {
    #[error("public key bytes do not represent a valid point")]
    InvalidPublicKey,
    #[error("secret key bytes do not represent a valid scalar")]
    InvalidSecretKey,
    #[error("signature bytes do not represent a valid point")]
    InvalidSignature,
    #[error("signature aggregation failed: {0:?}")]
    AggregationFailed(BLST_ERROR),
    #[error("signature verification failed: {0:?}")]
    VerificationFailed(BLST_ERROR),
    #[error("no public keys to aggregate")]
    NoPublicKeys,
}
