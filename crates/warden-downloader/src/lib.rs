// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent-side module artifact download, verify, and atomic cache materialization.
//!
//! Mirrors [`warden_artifact::ArtifactStore`]'s temp-file/rename pattern, but the bytes
//! arrive over the network rather than already in memory: each chunk is written to the
//! temp file and folded into a running digest as it streams in, so a multi-hundred-
//! megabyte image is never buffered whole before the hash can be checked.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use warden_core::{ModuleCacheEntry, ModuleImage, RequiredCapabilities, ResourceLimits};
use warden_crypto::Verifier;
use warden_error::{AsErrorCode, ErrorCode};
use warden_kv::{Bucket, Store};
use warden_protocol::rpc::{VerifyModuleRequest, VerifyModuleResponse};

/// Errors arising from a module download or cache lookup.
#[derive(Debug, thiserror::Error)]
pub enum DownloaderError {
    /// I/O failure writing the temp file or renaming it into place.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP request to the master failed or returned a non-success status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Underlying cache-index store failure.
    #[error("store error: {0}")]
    Kv(#[from] warden_kv::KvError),

    /// The module's signature failed verification against the trusted key set.
    #[error("signature verification failed: {0}")]
    Signature(#[from] warden_catalog::CatalogError),

    /// The master has no record of `(module_id, version)` in its catalog.
    #[error("module not found in catalog: {0}@{1}")]
    NotFound(String, String),

    /// The locally recomputed digest didn't match what the master's catalog records.
    #[error("digest mismatch downloading {module_id}@{version}")]
    DigestMismatch {
        /// Module id being downloaded.
        module_id: String,
        /// Version being downloaded.
        version: String,
    },
}

impl AsErrorCode for DownloaderError {
    fn code(&self) -> ErrorCode {
        match self {
            DownloaderError::Io(_) | DownloaderError::Kv(_) => ErrorCode::Fatal,
            DownloaderError::Http(_) => ErrorCode::Transient,
            DownloaderError::Signature(e) => e.code(),
            DownloaderError::NotFound(..) => ErrorCode::NotFound,
            DownloaderError::DigestMismatch { .. } => ErrorCode::InvariantViolation,
        }
    }
}

/// Downloads module images from the master, verifies digest and signature, and
/// materializes them into a local cache directory.
pub struct Downloader {
    http: reqwest::Client,
    master_base_url: String,
    cache_dir: PathBuf,
    entries: Bucket<ModuleCacheEntry>,
    verifier: Verifier,
}

fn cache_key(module_id: &str, version: &str) -> String {
    format!("{module_id}_{version}")
}

impl Downloader {
    /// Open the downloader's cache-entry index in `store` and create `cache_dir` if
    /// it doesn't exist. `http` should already carry whatever mTLS client identity the
    /// agent enrolled with; `master_base_url` is e.g. `"https://10.0.0.1:8443"`.
    ///
    /// # Errors
    /// Propagates I/O failure creating `cache_dir`, or a store-open failure.
    pub async fn open(
        store: &Store,
        cache_dir: impl Into<PathBuf>,
        http: reqwest::Client,
        master_base_url: impl Into<String>,
        verifier: Verifier,
    ) -> Result<Self, DownloaderError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            http,
            master_base_url: master_base_url.into(),
            cache_dir,
            entries: store.bucket("module_cache")?,
            verifier,
        })
    }

    fn final_path(&self, module_id: &str, version: &str) -> PathBuf {
        self.cache_dir.join(format!("{module_id}_{version}.tar"))
    }

    fn temp_path(&self, module_id: &str, version: &str) -> PathBuf {
        self.cache_dir.join(format!("{module_id}_{version}.tar.tmp"))
    }

    /// Path on disk a verified module's image would live at, for the supervisor to
    /// hand to the runtime.
    #[must_use]
    pub fn image_path(&self, module_id: &str, version: &str) -> PathBuf {
        self.final_path(module_id, version)
    }

    /// The cache entry for `(module_id, version)`, if one has ever been written.
    ///
    /// # Errors
    /// Propagates the underlying store's read failure.
    pub fn cached(&self, module_id: &str, version: &str) -> Result<Option<ModuleCacheEntry>, DownloaderError> {
        Ok(self.entries.get(cache_key(module_id, version))?)
    }

    /// Ensure `(module_id, version)` is present, verified, and on disk, downloading it
    /// if necessary. Returns the cache entry either way.
    ///
    /// Algorithm: a cache hit short-circuits only when the entry is `verified` *and*
    /// its image file still exists — a cache record surviving an operator deleting the
    /// underlying file (or a half-finished prior run) must not be trusted blindly.
    /// Otherwise: stream the download to a temp file while hashing it, confirm the
    /// digest against the master's catalog, verify the manifest signature against the
    /// trusted key set, and only then rename the temp file into place and persist the
    /// entry. Any failure along the way deletes the temp file; the rename is the only
    /// commit point.
    ///
    /// # Errors
    /// [`DownloaderError::NotFound`] if the master's catalog has no such entry,
    /// [`DownloaderError::DigestMismatch`] or [`DownloaderError::Signature`] if
    /// verification fails, or an I/O/HTTP/store failure from any step.
    pub async fn ensure(&self, module_id: &str, version: &str) -> Result<ModuleCacheEntry, DownloaderError> {
        if let Some(entry) = self.cached(module_id, version)? {
            let final_path = self.final_path(module_id, version);
            if entry.verified && fs::metadata(&final_path).await.is_ok() {
                return Ok(entry);
            }
        }

        match self.download_and_verify(module_id, version).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let _ = fs::remove_file(self.temp_path(module_id, version)).await;
                Err(e)
            }
        }
    }

    async fn download_and_verify(&self, module_id: &str, version: &str) -> Result<ModuleCacheEntry, DownloaderError> {
        let digest = self.stream_to_temp(module_id, version).await?;

        let verify_url = format!("{}/rpc/v1/verify-module", self.master_base_url);
        let verified: VerifyModuleResponse = self
            .http
            .post(verify_url)
            .json(&VerifyModuleRequest {
                module_id: module_id.to_string(),
                version: version.to_string(),
                digest: digest.clone(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !verified.valid {
            return Err(DownloaderError::DigestMismatch {
                module_id: module_id.to_string(),
                version: version.to_string(),
            });
        }

        let size_bytes = fs::metadata(self.temp_path(module_id, version)).await?.len();
        let image = ephemeral_image(module_id, version, &digest, size_bytes, &verified);
        warden_catalog::verify_image(&self.verifier, &image)?;

        let final_path = self.final_path(module_id, version);
        fs::rename(self.temp_path(module_id, version), &final_path).await?;

        let entry = ModuleCacheEntry {
            module_id: module_id.to_string(),
            version: version.to_string(),
            digest,
            image_path: final_path.display().to_string(),
            size_bytes,
            signature: verified.signature,
            signed_by: verified.signed_by,
            downloaded_at: Utc::now(),
            verified: true,
        };
        self.entries.put(cache_key(module_id, version), &entry)?;
        Ok(entry)
    }

    async fn stream_to_temp(&self, module_id: &str, version: &str) -> Result<String, DownloaderError> {
        let download_url = format!(
            "{}/api/v1/modules/{module_id}/{version}/download",
            self.master_base_url
        );
        let response = self.http.get(download_url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloaderError::NotFound(module_id.to_string(), version.to_string()));
        }
        let mut response = response.error_for_status()?;

        let temp_path = self.temp_path(module_id, version);
        let mut file = fs::File::create(&temp_path).await?;
        let mut digest = warden_artifact::StreamingDigest::new();
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            digest.update(&chunk);
        }
        file.flush().await?;
        Ok(digest.finish())
    }
}

fn ephemeral_image(
    module_id: &str,
    version: &str,
    digest: &str,
    size_bytes: u64,
    verified: &VerifyModuleResponse,
) -> ModuleImage {
    let now = Utc::now();
    ModuleImage {
        id: module_id.to_string(),
        version: version.to_string(),
        digest: digest.to_string(),
        image_ref: None,
        size_bytes,
        signature: verified.signature.clone(),
        signed_by: verified.signed_by.clone(),
        signed_at: verified.signed_at,
        required_capabilities: RequiredCapabilities::default(),
        min_agent_version: None,
        protocols: Vec::new(),
        resources: ResourceLimits::default(),
        labels: BTreeMap::new(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_crypto::KeyPair;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn signed_image(keypair: &KeyPair, module_id: &str, version: &str, bytes: &[u8]) -> ModuleImage {
        let now = Utc::now();
        let mut image = ModuleImage {
            id: module_id.to_string(),
            version: version.to_string(),
            digest: warden_artifact::format_digest(bytes),
            image_ref: None,
            size_bytes: bytes.len() as u64,
            signature: None,
            signed_by: None,
            signed_at: None,
            required_capabilities: RequiredCapabilities::default(),
            min_agent_version: None,
            protocols: Vec::new(),
            resources: ResourceLimits::default(),
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        warden_catalog::sign_image(keypair, &mut image).unwrap();
        image
    }

    async fn harness() -> (MockServer, KeyPair, Store, tempfile::TempDir) {
        let server = MockServer::start().await;
        let keypair = KeyPair::generate();
        let store = Store::open_temporary().unwrap();
        let dir = tempfile::tempdir().unwrap();
        (server, keypair, store, dir)
    }

    async fn downloader(server: &MockServer, store: &Store, dir: &Path, keypair: &KeyPair) -> Downloader {
        let mut verifier = Verifier::new();
        verifier.add_trusted_key(KeyPair::from_public_key(keypair.public_key));
        Downloader::open(store, dir.to_path_buf(), reqwest::Client::new(), server.uri(), verifier)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ensure_downloads_verifies_and_materializes() {
        let (server, keypair, store, dir) = harness().await;
        let bytes = b"module-image-bytes".to_vec();
        let image = signed_image(&keypair, "ssh-honeypot", "1.0.1", &bytes).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/modules/ssh-honeypot/1.0.1/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/verify-module"))
            .respond_with(ResponseTemplate::new(200).set_body_json(VerifyModuleResponse {
                valid: true,
                signature: image.signature.clone(),
                signed_by: image.signed_by.clone(),
                signed_at: image.signed_at,
            }))
            .mount(&server)
            .await;

        let downloader = downloader(&server, &store, dir.path(), &keypair).await;
        let entry = downloader.ensure("ssh-honeypot", "1.0.1").await.unwrap();
        assert!(entry.verified);
        assert_eq!(entry.digest, warden_artifact::format_digest(&bytes));
        assert_eq!(tokio::fs::read(&entry.image_path).await.unwrap(), bytes);
        assert!(!dir.path().join("ssh-honeypot_1.0.1.tar.tmp").exists());
    }

    #[tokio::test]
    async fn ensure_short_circuits_on_verified_cache_hit() {
        let (server, keypair, store, dir) = harness().await;
        let downloader = downloader(&server, &store, dir.path(), &keypair).await;

        let final_path = downloader.final_path("m", "1.0");
        tokio::fs::write(&final_path, b"cached").await.unwrap();
        let entry = ModuleCacheEntry {
            module_id: "m".into(),
            version: "1.0".into(),
            digest: warden_artifact::format_digest(b"cached"),
            image_path: final_path.display().to_string(),
            size_bytes: 6,
            signature: None,
            signed_by: None,
            downloaded_at: Utc::now(),
            verified: true,
        };
        downloader.entries.put(cache_key("m", "1.0"), &entry).unwrap();

        // No mocks registered on `server` — a real download attempt would panic wiremock.
        let result = downloader.ensure("m", "1.0").await.unwrap();
        assert_eq!(result, entry);
    }

    #[tokio::test]
    async fn tampered_download_is_rejected_and_temp_file_removed() {
        let (server, keypair, store, dir) = harness().await;
        let bytes = b"module-image-bytes".to_vec();
        let image = signed_image(&keypair, "ssh-honeypot", "1.0.1", &bytes).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/modules/ssh-honeypot/1.0.1/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered-bytes!!!!!".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/verify-module"))
            .respond_with(ResponseTemplate::new(200).set_body_json(VerifyModuleResponse {
                valid: false,
                signature: image.signature.clone(),
                signed_by: image.signed_by.clone(),
                signed_at: image.signed_at,
            }))
            .mount(&server)
            .await;

        let downloader = downloader(&server, &store, dir.path(), &keypair).await;
        let err = downloader.ensure("ssh-honeypot", "1.0.1").await.unwrap_err();
        assert!(matches!(err, DownloaderError::DigestMismatch { .. }));
        assert!(!dir.path().join("ssh-honeypot_1.0.1.tar.tmp").exists());
        assert!(!dir.path().join("ssh-honeypot_1.0.1.tar").exists());
    }

    #[tokio::test]
    async fn untrusted_signer_is_rejected() {
        let (server, keypair, store, dir) = harness().await;
        let impostor = KeyPair::generate();
        let bytes = b"module-image-bytes".to_vec();
        let image = signed_image(&impostor, "ssh-honeypot", "1.0.1", &bytes).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/modules/ssh-honeypot/1.0.1/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc/v1/verify-module"))
            .respond_with(ResponseTemplate::new(200).set_body_json(VerifyModuleResponse {
                valid: true,
                signature: image.signature.clone(),
                signed_by: image.signed_by.clone(),
                signed_at: image.signed_at,
            }))
            .mount(&server)
            .await;

        // `downloader` only trusts `keypair`, not `impostor`.
        let downloader = downloader(&server, &store, dir.path(), &keypair).await;
        let err = downloader.ensure("ssh-honeypot", "1.0.1").await.unwrap_err();
        assert!(matches!(err, DownloaderError::Signature(_)));
    }
}
