//! Manifest, catalog, and assignment signing/verification.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use sha2::{Digest, Sha256};
use warden_core::{AgentModuleConfig, ModuleCatalog, ModuleImage, ModuleManifest};
use warden_crypto::{KeyPair, Verifier};

use crate::CatalogError;

fn manifest_bytes(manifest: &ModuleManifest) -> Result<Vec<u8>, CatalogError> {
    Ok(serde_json::to_vec(manifest)?)
}

/// Every signature in this module covers `sha256(bytes)`, not `bytes` directly.
fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn decode_signature(encoded: &str) -> Result<[u8; 64], CatalogError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CatalogError::BadSignatureEncoding)?;
    bytes
        .try_into()
        .map_err(|_| CatalogError::BadSignatureEncoding)
}

/// Sign `image`'s manifest envelope with `keypair`, filling in `signature`/`signed_by`/`signed_at`.
pub fn sign_image(keypair: &KeyPair, image: &mut ModuleImage) -> Result<(), CatalogError> {
    let manifest = ModuleManifest {
        module_id: image.id.clone(),
        version: image.version.clone(),
        payload_sha256: image.digest.clone(),
        timestamp: Utc::now(),
    };
    let signature = keypair.sign(&sha256(&manifest_bytes(&manifest)?))?;
    image.signature = Some(BASE64.encode(signature));
    image.signed_by = Some(keypair.key_id.clone());
    image.signed_at = Some(manifest.timestamp);
    Ok(())
}

/// Verify `image`'s manifest envelope against `verifier`'s trusted keys.
///
/// # Errors
/// [`CatalogError::Unsigned`] if the image carries no signature, or a crypto error if
/// verification fails.
pub fn verify_image(verifier: &Verifier, image: &ModuleImage) -> Result<(), CatalogError> {
    let signature = image.signature.as_deref().ok_or(CatalogError::Unsigned)?;
    let signed_by = image.signed_by.as_deref().ok_or(CatalogError::Unsigned)?;
    let signed_at = image.signed_at.ok_or(CatalogError::Unsigned)?;
    let manifest = ModuleManifest {
        module_id: image.id.clone(),
        version: image.version.clone(),
        payload_sha256: image.digest.clone(),
        timestamp: signed_at,
    };
    let sig = decode_signature(signature)?;
    verifier.verify(signed_by, &sha256(&manifest_bytes(&manifest)?), &sig)?;
    Ok(())
}

/// Sign `catalog` as a whole, with `signature`/`signed_by` cleared before hashing.
pub fn sign_catalog(keypair: &KeyPair, catalog: &mut ModuleCatalog) -> Result<(), CatalogError> {
    catalog.signature = None;
    catalog.signed_by = None;
    let signature = keypair.sign(&sha256(&serde_json::to_vec(&*catalog)?))?;
    catalog.signature = Some(BASE64.encode(signature));
    catalog.signed_by = Some(keypair.key_id.clone());
    Ok(())
}

/// Verify a whole-catalog signature against `verifier`'s trusted keys.
pub fn verify_catalog(verifier: &Verifier, catalog: &ModuleCatalog) -> Result<(), CatalogError> {
    let signature = catalog.signature.clone().ok_or(CatalogError::Unsigned)?;
    let signed_by = catalog.signed_by.clone().ok_or(CatalogError::Unsigned)?;
    let mut unsigned = catalog.clone();
    unsigned.signature = None;
    unsigned.signed_by = None;
    let sig = decode_signature(&signature)?;
    verifier.verify(&signed_by, &sha256(&serde_json::to_vec(&unsigned)?), &sig)?;
    Ok(())
}

/// Sign an agent's assignment config, with `signature` cleared before hashing.
///
/// `AgentModuleConfig` carries no `signed_by` field (the agent trusts exactly one
/// master signing key from enrollment), so verification tries every key the caller
/// supplies rather than looking one up by id.
pub fn sign_agent_config(
    keypair: &KeyPair,
    config: &mut AgentModuleConfig,
) -> Result<(), CatalogError> {
    config.signature = None;
    let signature = keypair.sign(&sha256(&serde_json::to_vec(&*config)?))?;
    config.signature = Some(BASE64.encode(signature));
    Ok(())
}

/// Verify an agent's assignment config against a single known signer key.
pub fn verify_agent_config(
    signer: &KeyPair,
    config: &AgentModuleConfig,
) -> Result<(), CatalogError> {
    let signature = config.signature.clone().ok_or(CatalogError::Unsigned)?;
    let mut unsigned = config.clone();
    unsigned.signature = None;
    let sig = decode_signature(&signature)?;
    signer
        .verify(&sha256(&serde_json::to_vec(&unsigned)?), &sig)
        .map_err(CatalogError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use warden_core::{RequiredCapabilities, ResourceLimits};

    fn sample_image() -> ModuleImage {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        ModuleImage {
            id: "ssh-honeypot".into(),
            version: "1.0.0".into(),
            digest: "sha256:deadbeef".into(),
            image_ref: None,
            size_bytes: 10,
            signature: None,
            signed_by: None,
            signed_at: None,
            required_capabilities: RequiredCapabilities::default(),
            min_agent_version: None,
            protocols: vec![],
            resources: ResourceLimits::default(),
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn sign_then_verify_image_round_trips() {
        let keypair = KeyPair::generate();
        let mut verifier = Verifier::new();
        verifier.add_trusted_key(KeyPair::from_public_key(keypair.public_key));

        let mut image = sample_image();
        sign_image(&keypair, &mut image).unwrap();
        assert!(image.is_signed());
        verify_image(&verifier, &image).unwrap();
    }

    #[test]
    fn verify_image_rejects_tampered_digest_after_signing() {
        let keypair = KeyPair::generate();
        let mut verifier = Verifier::new();
        verifier.add_trusted_key(KeyPair::from_public_key(keypair.public_key));

        let mut image = sample_image();
        sign_image(&keypair, &mut image).unwrap();
        image.digest = "sha256:tampered".into();
        assert!(verify_image(&verifier, &image).is_err());
    }

    #[test]
    fn verify_image_rejects_unsigned_image() {
        let verifier = Verifier::new();
        let image = sample_image();
        assert!(matches!(
            verify_image(&verifier, &image),
            Err(CatalogError::Unsigned)
        ));
    }

    #[test]
    fn sign_then_verify_catalog_round_trips() {
        let keypair = KeyPair::generate();
        let mut verifier = Verifier::new();
        verifier.add_trusted_key(KeyPair::from_public_key(keypair.public_key));

        let mut catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![sample_image()],
            signature: None,
            signed_by: None,
        };
        sign_catalog(&keypair, &mut catalog).unwrap();
        verify_catalog(&verifier, &catalog).unwrap();
    }

    #[test]
    fn verify_catalog_rejects_mutation_after_signing() {
        let keypair = KeyPair::generate();
        let mut verifier = Verifier::new();
        verifier.add_trusted_key(KeyPair::from_public_key(keypair.public_key));

        let mut catalog = ModuleCatalog {
            version: 1,
            updated_at: Utc::now(),
            modules: vec![],
            signature: None,
            signed_by: None,
        };
        sign_catalog(&keypair, &mut catalog).unwrap();
        catalog.version = 2;
        assert!(verify_catalog(&verifier, &catalog).is_err());
    }

    #[test]
    fn sign_then_verify_agent_config_round_trips() {
        let keypair = KeyPair::generate();
        let verify_only = KeyPair::from_public_key(keypair.public_key);

        let mut config = AgentModuleConfig {
            agent_id: "agent-1".into(),
            assignments: vec![],
            version: 1,
            signature: None,
        };
        sign_agent_config(&keypair, &mut config).unwrap();
        verify_agent_config(&verify_only, &config).unwrap();
    }
}
