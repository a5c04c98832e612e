//! Verification against a set of trusted signer keys.

use std::collections::BTreeMap;

use crate::{CryptoError, KeyPair};

/// A set of trusted public keys, indexed by key id, used to verify catalog/assignment/
/// module signatures against whichever key actually signed them.
#[derive(Debug, Default, Clone)]
pub struct Verifier {
    trusted_keys: BTreeMap<String, KeyPair>,
}

impl Verifier {
    /// An empty verifier, trusting nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to the trusted set, indexed by its key id.
    pub fn add_trusted_key(&mut self, key_pair: KeyPair) {
        self.trusted_keys.insert(key_pair.key_id.clone(), key_pair);
    }

    /// Whether a given key id is currently trusted.
    #[must_use]
    pub fn has_trusted_key(&self, key_id: &str) -> bool {
        self.trusted_keys.contains_key(key_id)
    }

    /// Every trusted key id, for diagnostics.
    #[must_use]
    pub fn trusted_key_ids(&self) -> Vec<String> {
        self.trusted_keys.keys().cloned().collect()
    }

    /// Verify `signature` over `message`, claimed to be from `signer_id`.
    ///
    /// # Errors
    /// [`CryptoError::UnknownSigner`] if `signer_id` isn't trusted,
    /// [`CryptoError::BadSignature`] if the signature doesn't verify.
    pub fn verify(
        &self,
        signer_id: &str,
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let key = self
            .trusted_keys
            .get(signer_id)
            .ok_or_else(|| CryptoError::UnknownSigner(signer_id.to_string()))?;
        key.verify(message, signature)
    }
}
