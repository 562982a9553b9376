use blst::{
    min_pk::{AggregateSignature, PublicKey, Signature},
    BLST_ERROR,
};

use crate::{error::Error, PublicKeyBytes, SignatureBytes, DOMAIN_SEPARATION_TAG};

/// Verifies a single signature over `message`.
pub fn verify(
    message: &[u8],
    signature: SignatureBytes,
    public_key: PublicKeyBytes,
) -> Result<(), Error> {
    let signature = uncompress_signature(signature)?;
    let public_key = uncompress_public_key(public_key)?;

    let error = signature.verify(true, message, DOMAIN_SEPARATION_TAG, &[], &public_key, true);

    if error == BLST_ERROR::BLST_SUCCESS {
        Ok(())
    } else {
        Err(Error::VerificationFailed(error))
    }
}

/// Verifies an aggregate signature over a single `message` signed by every key
/// in `public_keys`.
pub fn fast_aggregate_verify(
    message: &[u8],
    signature: SignatureBytes,
    public_keys: impl IntoIterator<Item = PublicKeyBytes>,
) -> Result<(), Error> {
    let signature = uncompress_signature(signature)?;

    let public_keys = public_keys
        .into_iter()
        .map(uncompress_public_key)
        .collect::<Result<Vec<_>, _>>()?;

    if public_keys.is_empty() {
        return Err(Error::NoPublicKeys);
    }

    let references = public_keys.iter().collect::<Vec<_>>();

    let error =
        signature.fast_aggregate_verify(true, message, DOMAIN_SEPARATION_TAG, &references);

    if error == BLST_ERROR::BLST_SUCCESS {
        Ok(())
    } else {
        Err(Error::VerificationFailed(error))
    }
}

/// Aggregates individual signatures over a common message into one.
pub fn aggregate_signatures(
    signatures: impl IntoIterator<Item = SignatureBytes>,
) -> Result<SignatureBytes, Error> {
    let signatures = signatures
        .into_iter()
        .map(uncompress_signature)
        .collect::<Result<Vec<_>, _>>()?;

    let references = signatures.iter().collect::<Vec<_>>();

    let aggregate = AggregateSignature::aggregate(&references, true)
        .map_err(Error::AggregationFailed)?;

    Ok(SignatureBytes::from(aggregate.to_signature().compress()))
}

fn uncompress_signature(bytes: SignatureBytes) -> Result<Signature, Error> {
    Signature::uncompress(bytes.as_slice()).map_err(|_| Error::InvalidSignature)
}

fn uncompress_public_key(bytes: PublicKeyBytes) -> Result<PublicKey, Error> {
    PublicKey::uncompress(bytes.as_slice()).map_err(|_| Error::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use crate::SecretKey;

    use super::*;

    #[test]
    fn single_signature_round_trip() -> Result<(), Error> {
        let secret_key = SecretKey::derive(&[1; 32])?;
        let message = b"attestation data root";
        let signature = secret_key.sign(message);

        verify(message, signature, secret_key.to_public_key())
    }

    #[test]
    fn aggregate_round_trip() -> Result<(), Error> {
        let message = b"attestation data root";

        let secret_keys = (1..=3)
            .map(|byte| SecretKey::derive(&[byte; 32]))
            .collect::<Result<Vec<_>, _>>()?;

        let aggregate = aggregate_signatures(
            secret_keys.iter().map(|secret_key| secret_key.sign(message)),
        )?;

        fast_aggregate_verify(
            message,
            aggregate,
            secret_keys.iter().map(SecretKey::to_public_key),
        )
    }

    #[test]
    fn tampered_message_fails() -> Result<(), Error> {
        let secret_key = SecretKey::derive(&[2; 32])?;
        let signature = secret_key.sign(b"original");

        assert!(verify(b"tampered", signature, secret_key.to_public_key()).is_err());

        Ok(())
    }
}
