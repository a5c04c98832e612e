// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ed25519 signing primitives and trusted-key verification.
//!
//! Mirrors the key-id scheme, PEM header convention, and verifier shape used
//! throughout the catalog, pairing, and module-signing components: the key id is the
//! first 8 bytes of `sha256(public_key)`, hex-encoded.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod keypair;
mod verifier;

pub use keypair::{KeyPair, compute_key_id};
pub use verifier::Verifier;

use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from key generation, signing, verification, or PEM persistence.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Attempted to sign or save a private key with a verify-only [`KeyPair`].
    #[error("keypair has no private key")]
    NoPrivateKey,

    /// Signature verification failed.
    #[error("signature verification failed")]
    BadSignature,

    /// The claimed signer is not in the trusted key set.
    #[error("unknown signer: {0}")]
    UnknownSigner(String),

    /// A PEM file was malformed or of the wrong type.
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// Underlying I/O failure reading or writing key material.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AsErrorCode for CryptoError {
    fn code(&self) -> ErrorCode {
        match self {
            CryptoError::NoPrivateKey | CryptoError::InvalidPem(_) | CryptoError::Io(_) => {
                ErrorCode::Fatal
            }
            CryptoError::BadSignature | CryptoError::UnknownSigner(_) => {
                ErrorCode::InvalidSignature
            }
        }
    }
}
