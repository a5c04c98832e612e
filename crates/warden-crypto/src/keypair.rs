//! Ed25519 key lifecycle: generation, signing, and PEM persistence.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::CryptoError;

/// An Ed25519 keypair, optionally verify-only (no private key).
#[derive(Clone)]
pub struct KeyPair {
    /// Raw 32-byte public key.
    pub public_key: [u8; 32],
    /// Raw 64-byte private key (signing key + public key), absent for verify-only clients.
    signing_key: Option<SigningKey>,
    /// First 8 bytes of `sha256(public_key)`, hex-encoded — 16 hex characters.
    pub key_id: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("has_private_key", &self.signing_key.is_some())
            .finish()
    }
}

/// Derive the 16-hex-character key id from a raw public key.
#[must_use]
pub fn compute_key_id(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex_encode(&digest[..8])
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl KeyPair {
    /// Generate a fresh random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let public_key = signing_key.verifying_key().to_bytes();
        let key_id = compute_key_id(&public_key);
        Self {
            public_key,
            signing_key: Some(signing_key),
            key_id,
        }
    }

    /// Build a verify-only `KeyPair` from a raw public key (no signing capability).
    #[must_use]
    pub fn from_public_key(public_key: [u8; 32]) -> Self {
        let key_id = compute_key_id(&public_key);
        Self {
            public_key,
            signing_key: None,
            key_id,
        }
    }

    /// `true` if this keypair can sign (i.e. holds a private key).
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Sign `message`, returning a 64-byte signature.
    ///
    /// # Errors
    /// Returns [`CryptoError::NoPrivateKey`] if this is a verify-only keypair.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], CryptoError> {
        let signing_key = self.signing_key.as_ref().ok_or(CryptoError::NoPrivateKey)?;
        Ok(signing_key.sign(message).to_bytes())
    }

    /// Verify a signature produced by this keypair's own public key.
    ///
    /// # Errors
    /// Returns [`CryptoError::BadSignature`] if verification fails.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| CryptoError::BadSignature)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Save the private key to a PEM file with `Key-Id`/`Created-At` headers, mode 0600.
    ///
    /// # Errors
    /// Returns [`CryptoError::NoPrivateKey`] if verify-only, or an I/O error.
    pub fn save_private_key(&self, path: &Path) -> Result<(), CryptoError> {
        let signing_key = self.signing_key.as_ref().ok_or(CryptoError::NoPrivateKey)?;
        let mut contents = String::new();
        contents.push_str(&format!("Key-Id: {}\n", self.key_id));
        contents.push_str(&format!("Created-At: {}\n", chrono::Utc::now().to_rfc3339()));
        contents.push('\n');
        let pem = pem::Pem::new("ED25519 PRIVATE KEY", signing_key.to_bytes().to_vec());
        contents.push_str(&pem::encode(&pem));
        fs::write(path, contents)?;
        set_permissions(path, 0o600)?;
        Ok(())
    }

    /// Save the public key to a PEM file with a `Key-Id` header, mode 0644.
    pub fn save_public_key(&self, path: &Path) -> Result<(), CryptoError> {
        let mut contents = String::new();
        contents.push_str(&format!("Key-Id: {}\n", self.key_id));
        contents.push('\n');
        let pem = pem::Pem::new("ED25519 PUBLIC KEY", self.public_key.to_vec());
        contents.push_str(&pem::encode(&pem));
        fs::write(path, contents)?;
        set_permissions(path, 0o644)?;
        Ok(())
    }

    /// Load a private key previously written by [`KeyPair::save_private_key`].
    pub fn load_private_key(path: &Path) -> Result<Self, CryptoError> {
        let contents = fs::read_to_string(path)?;
        let parsed = pem::parse(extract_pem_block(&contents)?)
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
        if parsed.tag() != "ED25519 PRIVATE KEY" {
            return Err(CryptoError::InvalidPem(format!(
                "unexpected PEM type: {}",
                parsed.tag()
            )));
        }
        let bytes: [u8; 32] = parsed
            .contents()
            .try_into()
            .map_err(|_| CryptoError::InvalidPem("private key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let public_key = signing_key.verifying_key().to_bytes();
        let key_id = compute_key_id(&public_key);
        Ok(Self {
            public_key,
            signing_key: Some(signing_key),
            key_id,
        })
    }

    /// Load a public key previously written by [`KeyPair::save_public_key`].
    pub fn load_public_key(path: &Path) -> Result<Self, CryptoError> {
        let contents = fs::read_to_string(path)?;
        let parsed = pem::parse(extract_pem_block(&contents)?)
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
        if parsed.tag() != "ED25519 PUBLIC KEY" {
            return Err(CryptoError::InvalidPem(format!(
                "unexpected PEM type: {}",
                parsed.tag()
            )));
        }
        let bytes: [u8; 32] = parsed
            .contents()
            .try_into()
            .map_err(|_| CryptoError::InvalidPem("public key must be 32 bytes".into()))?;
        Ok(Self::from_public_key(bytes))
    }
}

/// The PEM headers precede the `-----BEGIN ...` block; slice from there.
fn extract_pem_block(contents: &str) -> Result<&str, CryptoError> {
    contents
        .find("-----BEGIN")
        .map(|idx| &contents[idx..])
        .ok_or_else(|| CryptoError::InvalidPem("no PEM block found".into()))
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), CryptoError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello").unwrap();
        kp.verify(b"hello", &sig).unwrap();
    }

    #[test]
    fn verify_fails_on_tampered_message() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello").unwrap();
        assert!(kp.verify(b"goodbye", &sig).is_err());
    }

    #[test]
    fn verify_only_keypair_cannot_sign() {
        let kp = KeyPair::generate();
        let verify_only = KeyPair::from_public_key(kp.public_key);
        assert!(!verify_only.can_sign());
        assert!(matches!(
            verify_only.sign(b"x"),
            Err(CryptoError::NoPrivateKey)
        ));
    }

    #[test]
    fn key_id_is_stable_for_same_public_key() {
        let kp = KeyPair::generate();
        let copy = KeyPair::from_public_key(kp.public_key);
        assert_eq!(kp.key_id, copy.key_id);
        assert_eq!(kp.key_id.len(), 16);
    }

    #[test]
    fn save_then_load_private_key_preserves_key_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");
        let kp = KeyPair::generate();
        kp.save_private_key(&path).unwrap();
        let loaded = KeyPair::load_private_key(&path).unwrap();
        assert_eq!(kp.key_id, loaded.key_id);
        let sig = loaded.sign(b"data").unwrap();
        kp.verify(b"data", &sig).unwrap();
    }

    #[test]
    fn save_then_load_public_key_preserves_key_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.pub");
        let kp = KeyPair::generate();
        kp.save_public_key(&path).unwrap();
        let loaded = KeyPair::load_public_key(&path).unwrap();
        assert_eq!(kp.key_id, loaded.key_id);
        assert!(!loaded.can_sign());
    }

    #[test]
    fn loading_wrong_pem_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.pub");
        let kp = KeyPair::generate();
        kp.save_private_key(&path).unwrap();
        assert!(matches!(
            KeyPair::load_public_key(&path),
            Err(CryptoError::InvalidPem(_))
        ));
    }
}
