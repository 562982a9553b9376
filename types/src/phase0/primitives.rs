pub use bls::{AggregateSignatureBytes, PublicKeyBytes, SignatureBytes};

pub type Slot = u64;
pub type Epoch = u64;
pub type CommitteeIndex = u64;
pub type SubnetId = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;
pub type UnixSeconds = u64;
pub type ParticipationFlags = u8;

pub type H256 = alloy_primitives::B256;
pub type DomainType = alloy_primitives::FixedBytes<4>;
pub type Domain = H256;
