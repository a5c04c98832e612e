//! Agent-side module cache bookkeeping (§3, §4.6).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Record of a downloaded, verified module image sitting in the agent's local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleCacheEntry {
    /// Module id.
    pub module_id: String,
    /// Module version.
    pub version: String,
    /// `sha256:<hex>` digest, recomputed locally from the downloaded bytes.
    pub digest: String,
    /// Path to the materialized image file.
    pub image_path: String,
    /// Size of the image in bytes.
    pub size_bytes: u64,
    /// Signature carried by the verified [`crate::module::ModuleImage`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Key id of the signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    /// When the download completed.
    pub downloaded_at: DateTime<Utc>,
    /// `true` once digest and signature verification both passed. A cache entry is
    /// only ever persisted in this state — see the downloader's commit-point contract.
    pub verified: bool,
}
