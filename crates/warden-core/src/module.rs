//! Module image, manifest, and catalog entities (§3, §4.1, §4.4 of the design doc).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource limits requested for a module instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// CPU limit expressed in millicores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u64>,
}

/// Capability flags a module image declares it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequiredCapabilities {
    /// The module needs root/administrator privileges to run.
    #[serde(default)]
    pub requires_root: bool,
    /// The module needs to observe or craft raw IP packets.
    #[serde(default)]
    pub can_handle_raw_packets: bool,
}

/// A single signed, content-addressed module image published to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleImage {
    /// Stable module identifier (e.g. `"ssh-honeypot"`).
    pub id: String,
    /// Semantic version string for this image.
    pub version: String,
    /// `sha256:<hex>` digest of the raw image bytes.
    pub digest: String,
    /// Opaque reference to where the image bytes live (local path or URL), informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    /// Size of the raw image in bytes.
    pub size_bytes: u64,
    /// Ed25519 signature over the serialized [`ModuleManifest`], base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Key id of the signer, if signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    /// Timestamp the manifest was signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    /// Capabilities required to run this module.
    #[serde(default)]
    pub required_capabilities: RequiredCapabilities,
    /// Minimum supported agent version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_agent_version: Option<String>,
    /// Network protocols this module speaks (informational; listeners carry the real port/proto).
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Default resource limits for instances of this module.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Free-form labels for filtering/display.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// When this image was first published.
    pub created_at: DateTime<Utc>,
    /// When this image's metadata was last updated (re-signing, label changes).
    pub updated_at: DateTime<Utc>,
}

impl ModuleImage {
    /// `true` once a signature and signer key id are both present.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.signed_by.is_some()
    }

    /// Identity key used for "latest version wins" comparisons and catalog indexing.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.id.clone(), self.version.clone())
    }
}

/// The signed envelope binding `(module_id, version, digest)` together.
///
/// The signature in [`ModuleImage::signature`] is computed over
/// `sha256(serialize(ModuleManifest))`, not over the image bytes directly — this makes
/// the signed statement "the publisher, at this timestamp, vouches that this digest is
/// module X version Y" independently auditable from the image bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleManifest {
    /// The module id this manifest binds.
    pub module_id: String,
    /// The version this manifest binds.
    pub version: String,
    /// `sha256:<hex>` digest of the raw image bytes.
    pub payload_sha256: String,
    /// Timestamp the manifest was constructed, for audit purposes.
    pub timestamp: DateTime<Utc>,
}

/// The fleet-wide, versioned, signed list of every published module image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleCatalog {
    /// Monotonically increasing catalog version. A higher version always supersedes.
    pub version: i64,
    /// When this catalog snapshot was produced.
    pub updated_at: DateTime<Utc>,
    /// Every known module image, across all ids and versions.
    pub modules: Vec<ModuleImage>,
    /// Signature over the catalog with `signature`/`signed_by` cleared, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Key id of the catalog signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
}

impl ModuleCatalog {
    /// The highest version of `module_id` present in the catalog, if any.
    ///
    /// "Latest" is defined as the lexicographically greatest version string among
    /// entries sharing `module_id`, matching the glob+reverse-sort convention of the
    /// on-disk store this type mirrors.
    #[must_use]
    pub fn latest(&self, module_id: &str) -> Option<&ModuleImage> {
        self.modules
            .iter()
            .filter(|m| m.id == module_id)
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// A specific `(module_id, version)` entry, if present.
    #[must_use]
    pub fn get(&self, module_id: &str, version: &str) -> Option<&ModuleImage> {
        self.modules
            .iter()
            .find(|m| m.id == module_id && m.version == version)
    }
}
