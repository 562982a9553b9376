use blst::min_pk::SecretKey as RawSecretKey;

use crate::{
    error::Error, PublicKeyBytes, SignatureBytes, DOMAIN_SEPARATION_TAG,
};

/// A secret key kept only for locally controlled validators and test fixtures.
pub struct SecretKey(RawSecretKey);

impl SecretKey {
    /// Derives a key from input keying material. `ikm` must be at least 32 bytes.
    pub fn derive(ikm: &[u8]) -> Result<Self, Error> {
        RawSecretKey::key_gen(ikm, &[])
            .map(Self)
            .map_err(|_| Error::InvalidSecretKey)
    }

    #[must_use]
    pub fn to_public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from(self.0.sk_to_pk().compress())
    }

    #[must_use]
    pub fn sign(&self, message: impl AsRef<[u8]>) -> SignatureBytes {
        let signature = self.0.sign(message.as_ref(), DOMAIN_SEPARATION_TAG, &[]);
        SignatureBytes::from(signature.compress())
    }
}
