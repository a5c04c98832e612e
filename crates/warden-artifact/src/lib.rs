// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed module image storage.
//!
//! Images are written to a temp file, hashed as they stream in, and committed with a
//! single atomic rename — the same pattern the module downloader uses on the agent
//! side, applied symmetrically here for the master's own writes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from artifact storage reads or writes.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// I/O failure reading or writing an artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The artifact's digest didn't match what the writer expected.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the caller expected.
        expected: String,
        /// Digest actually computed from the written bytes.
        actual: String,
    },

    /// The requested artifact does not exist.
    #[error("artifact not found: {0}")]
    NotFound(String),
}

impl AsErrorCode for ArtifactError {
    fn code(&self) -> ErrorCode {
        match self {
            ArtifactError::NotFound(_) => ErrorCode::NotFound,
            ArtifactError::DigestMismatch { .. } => ErrorCode::InvariantViolation,
            ArtifactError::Io(_) => ErrorCode::Fatal,
        }
    }
}

/// On-disk store for raw module image bytes, addressed by `(module_id, version)`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Use `root` as the artifact directory, creating it if necessary.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn final_path(&self, module_id: &str, version: &str) -> PathBuf {
        self.root.join(format!("{module_id}_{version}.tar"))
    }

    fn temp_path(&self, module_id: &str, version: &str) -> PathBuf {
        self.root.join(format!("{module_id}_{version}.tar.tmp"))
    }

    /// `true` if the final artifact file exists.
    pub async fn exists(&self, module_id: &str, version: &str) -> bool {
        fs::metadata(self.final_path(module_id, version)).await.is_ok()
    }

    /// Write `bytes` as the artifact for `(module_id, version)`, computing its digest
    /// and atomically renaming into place. Returns the `sha256:<hex>` digest and size.
    pub async fn put(
        &self,
        module_id: &str,
        version: &str,
        bytes: &[u8],
    ) -> Result<(String, u64), ArtifactError> {
        let temp_path = self.temp_path(module_id, version);
        let final_path = self.final_path(module_id, version);

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let digest = format_digest(bytes);
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok((digest, bytes.len() as u64))
    }

    /// Read the full artifact bytes for `(module_id, version)`.
    pub async fn get(&self, module_id: &str, version: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.final_path(module_id, version);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(format!("{module_id}@{version}"))
            } else {
                ArtifactError::Io(e)
            }
        })
    }

    /// Size in bytes of the stored artifact, without reading its contents.
    pub async fn size(&self, module_id: &str, version: &str) -> Result<u64, ArtifactError> {
        let path = self.final_path(module_id, version);
        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(format!("{module_id}@{version}"))
            } else {
                ArtifactError::Io(e)
            }
        })?;
        Ok(meta.len())
    }

    /// Read the artifact back in fixed-size chunks, for chunked-download streaming.
    pub async fn read_chunks(
        &self,
        module_id: &str,
        version: &str,
        chunk_size: usize,
    ) -> Result<Vec<Vec<u8>>, ArtifactError> {
        let bytes = self.get(module_id, version).await?;
        Ok(bytes.chunks(chunk_size).map(<[u8]>::to_vec).collect())
    }

    /// Permanently delete the artifact for `(module_id, version)`.
    pub async fn delete(&self, module_id: &str, version: &str) -> Result<(), ArtifactError> {
        let path = self.final_path(module_id, version);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path on disk where the artifact would live, for diagnostics/logging only.
    #[must_use]
    pub fn path_for(&self, module_id: &str, version: &str) -> PathBuf {
        self.final_path(module_id, version)
    }
}

/// Compute the `sha256:<hex>` digest of `bytes`.
#[must_use]
pub fn format_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(71);
    out.push_str("sha256:");
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Incremental hasher for streaming writes (the module downloader accumulates a
/// digest chunk-by-chunk as it writes to its own temp file).
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    /// A fresh, empty running digest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of bytes into the running digest.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finalize and format as `sha256:<hex>`.
    #[must_use]
    pub fn finish(self) -> String {
        let digest = self.hasher.finalize();
        let mut out = String::with_capacity(71);
        out.push_str("sha256:");
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Verify that `bytes` hashes to `expected_digest`.
///
/// # Errors
/// [`ArtifactError::DigestMismatch`] if the computed digest disagrees.
pub fn verify_digest(bytes: &[u8], expected_digest: &str) -> Result<(), ArtifactError> {
    let actual = format_digest(bytes);
    if actual == expected_digest {
        Ok(())
    } else {
        Err(ArtifactError::DigestMismatch {
            expected: expected_digest.to_string(),
            actual,
        })
    }
}
