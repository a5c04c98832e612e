// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module manifest signing and the versioned catalog/assignment service.
//!
//! A [`ModuleImage`](warden_core::ModuleImage) carries its own signature over a
//! [`ModuleManifest`](warden_core::ModuleManifest) envelope; the [`ModuleCatalog`] and
//! each agent's [`AgentModuleConfig`] are additionally signed as a whole, so an agent
//! can trust a catalog snapshot or its own assignments without re-verifying every
//! individual module signature.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod service;
mod signing;

pub use service::CatalogService;
pub use signing::{
    sign_agent_config, sign_catalog, sign_image, verify_agent_config, verify_catalog,
    verify_image,
};

use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from manifest signing/verification or catalog/assignment storage.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Underlying key-value store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// Serialization of a manifest, catalog, or assignment config failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Signing or verification failed at the cryptography layer.
    #[error("crypto error: {0}")]
    Crypto(#[from] warden_crypto::CryptoError),

    /// A signature field was base64-malformed or not 64 bytes once decoded.
    #[error("malformed signature encoding")]
    BadSignatureEncoding,

    /// Verification was attempted on something that was never signed.
    #[error("object is unsigned")]
    Unsigned,
}

impl AsErrorCode for CatalogError {
    fn code(&self) -> ErrorCode {
        match self {
            CatalogError::Kv(_) | CatalogError::Codec(_) => ErrorCode::Fatal,
            CatalogError::Crypto(e) => e.code(),
            CatalogError::BadSignatureEncoding | CatalogError::Unsigned => {
                ErrorCode::InvalidSignature
            }
        }
    }
}
