use bls::{AggregateSignatureBytes, PublicKeyBytes, SignatureBytes};
use types::phase0::primitives::H256;

use crate::error::{Error, SignatureKind};

/// The seam through which all signature checks go.
///
/// Implementations differ in when verification happens:
/// - [`SingleVerifier`] verifies every signature eagerly.
/// - [`MultiVerifier`] collects signatures and verifies them in `finish`,
///   which lets the signature verification service batch related work.
/// - [`NullVerifier`] skips verification for trusted inputs.
pub trait Verifier {
    fn reserve(&mut self, additional: usize);

    fn verify_singular(
        &mut self,
        message: H256,
        signature: SignatureBytes,
        public_key: PublicKeyBytes,
        kind: SignatureKind,
    ) -> Result<(), Error>;

    fn verify_aggregate(
        &mut self,
        message: H256,
        signature: AggregateSignatureBytes,
        public_keys: impl IntoIterator<Item = PublicKeyBytes>,
        kind: SignatureKind,
    ) -> Result<(), Error>;

    fn finish(self) -> Result<(), Error>;
}

#[derive(Clone, Copy, Default)]
pub struct NullVerifier;

impl Verifier for NullVerifier {
    fn reserve(&mut self, _additional: usize) {}

    fn verify_singular(
        &mut self,
        _message: H256,
        _signature: SignatureBytes,
        _public_key: PublicKeyBytes,
        _kind: SignatureKind,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn verify_aggregate(
        &mut self,
        _message: H256,
        _signature: AggregateSignatureBytes,
        _public_keys: impl IntoIterator<Item = PublicKeyBytes>,
        _kind: SignatureKind,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn finish(self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
pub struct SingleVerifier;

impl Verifier for SingleVerifier {
    fn reserve(&mut self, _additional: usize) {}

    fn verify_singular(
        &mut self,
        message: H256,
        signature: SignatureBytes,
        public_key: PublicKeyBytes,
        kind: SignatureKind,
    ) -> Result<(), Error> {
        bls::verify(message.as_slice(), signature, public_key)
            .map_err(|_| Error::SignatureInvalid { kind })
    }

    fn verify_aggregate(
        &mut self,
        message: H256,
        signature: AggregateSignatureBytes,
        public_keys: impl IntoIterator<Item = PublicKeyBytes>,
        kind: SignatureKind,
    ) -> Result<(), Error> {
        bls::fast_aggregate_verify(message.as_slice(), signature, public_keys)
            .map_err(|_| Error::SignatureInvalid { kind })
    }

    fn finish(self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct Triple {
    message: H256,
    signature: SignatureBytes,
    public_keys: Vec<PublicKeyBytes>,
    kind: SignatureKind,
}

#[derive(Default)]
pub struct MultiVerifier {
    triples: Vec<Triple>,
}

impl MultiVerifier {
    pub fn extend(
        &mut self,
        triples: impl IntoIterator<Item = Triple>,
    ) {
        self.triples.extend(triples);
    }
}

impl Verifier for MultiVerifier {
    fn reserve(&mut self, additional: usize) {
        self.triples.reserve(additional);
    }

    fn verify_singular(
        &mut self,
        message: H256,
        signature: SignatureBytes,
        public_key: PublicKeyBytes,
        kind: SignatureKind,
    ) -> Result<(), Error> {
        self.triples.push(Triple {
            message,
            signature,
            public_keys: vec![public_key],
            kind,
        });

        Ok(())
    }

    fn verify_aggregate(
        &mut self,
        message: H256,
        signature: AggregateSignatureBytes,
        public_keys: impl IntoIterator<Item = PublicKeyBytes>,
        kind: SignatureKind,
    ) -> Result<(), Error> {
        self.triples.push(Triple {
            message,
            signature,
            public_keys: public_keys.into_iter().collect(),
            kind,
        });

        Ok(())
    }

    fn finish(self) -> Result<(), Error> {
        for triple in self.triples {
            let Triple {
                message,
                signature,
                public_keys,
                kind,
            } = triple;

            bls::fast_aggregate_verify(message.as_slice(), signature, public_keys)
                .map_err(|_| Error::SignatureInvalid { kind })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bls::SecretKey;

    use super::*;

    #[test]
    fn multi_verifier_accepts_collected_valid_signatures() -> Result<(), Error> {
        let secret_key = SecretKey::derive(&[7; 32]).expect("seed is 32 bytes");
        let message = H256::repeat_byte(1);
        let signature = secret_key.sign(message);

        let mut verifier = MultiVerifier::default();

        verifier.verify_singular(
            message,
            signature,
            secret_key.to_public_key(),
            SignatureKind::Attestation,
        )?;

        verifier.finish()
    }

    #[test]
    fn multi_verifier_reports_failures_at_finish() {
        let secret_key = SecretKey::derive(&[8; 32]).expect("seed is 32 bytes");
        let signature = secret_key.sign(H256::repeat_byte(1));

        let mut verifier = MultiVerifier::default();

        verifier
            .verify_singular(
                H256::repeat_byte(2),
                signature,
                secret_key.to_public_key(),
                SignatureKind::Attestation,
            )
            .expect("multi verifier defers verification");

        assert!(verifier.finish().is_err());
    }
}
