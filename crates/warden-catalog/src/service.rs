//! Versioned catalog and per-agent assignment storage.

use chrono::Utc;
use warden_core::{AgentModuleConfig, ModuleAssignment, ModuleCatalog, ModuleImage};
use warden_crypto::KeyPair;
use warden_kv::{Bucket, Store};

use crate::signing::{sign_agent_config, sign_catalog, sign_image};
use crate::CatalogError;

const CATALOG_KEY: &str = "catalog";
const CATALOG_VERSION_KEY: &str = "catalog";

/// Owns the `ModuleCatalog` bucket, the per-agent `AgentModuleConfig` bucket, and the
/// monotonic version counters for both, re-signing on every mutation.
pub struct CatalogService {
    catalog: Bucket<ModuleCatalog>,
    assignments: Bucket<AgentModuleConfig>,
    versions: Bucket<i64>,
}

impl CatalogService {
    /// Open (or create) the catalog and assignment buckets within `store`.
    pub fn open(store: &Store) -> Result<Self, CatalogError> {
        Ok(Self {
            catalog: store.bucket("modules")?,
            assignments: store.bucket("deployments")?,
            versions: store.bucket("versions")?,
        })
    }

    /// The current catalog snapshot, or an empty, unsigned, version-0 catalog if none
    /// has ever been published.
    pub fn catalog(&self) -> Result<ModuleCatalog, CatalogError> {
        Ok(self.catalog.get(CATALOG_KEY)?.unwrap_or_default())
    }

    /// Publish (or replace, if `(id, version)` already exists) a module image, bump the
    /// catalog version, and re-sign the whole catalog.
    pub fn publish_module(
        &self,
        keypair: &KeyPair,
        mut image: ModuleImage,
    ) -> Result<ModuleCatalog, CatalogError> {
        sign_image(keypair, &mut image)?;

        let next_version = self
            .versions
            .update_and_fetch(CATALOG_VERSION_KEY, |cur| cur.unwrap_or(0) + 1)?;

        let mut catalog = self.catalog()?;
        catalog.modules.retain(|m| m.key() != image.key());
        catalog.modules.push(image);
        catalog.version = next_version;
        catalog.updated_at = Utc::now();
        sign_catalog(keypair, &mut catalog)?;

        self.catalog.put(CATALOG_KEY, &catalog)?;
        Ok(catalog)
    }

    /// Remove a module image and re-sign the catalog. A no-op, still bumping the
    /// version, if `(module_id, version)` was never present.
    pub fn retract_module(
        &self,
        keypair: &KeyPair,
        module_id: &str,
        version: &str,
    ) -> Result<ModuleCatalog, CatalogError> {
        let next_version = self
            .versions
            .update_and_fetch(CATALOG_VERSION_KEY, |cur| cur.unwrap_or(0) + 1)?;

        let mut catalog = self.catalog()?;
        catalog
            .modules
            .retain(|m| !(m.id == module_id && m.version == version));
        catalog.version = next_version;
        catalog.updated_at = Utc::now();
        sign_catalog(keypair, &mut catalog)?;

        self.catalog.put(CATALOG_KEY, &catalog)?;
        Ok(catalog)
    }

    /// The current signed assignment config for `agent_id`, if one has ever been set.
    pub fn agent_config(&self, agent_id: &str) -> Result<Option<AgentModuleConfig>, CatalogError> {
        Ok(self.assignments.get(agent_id)?)
    }

    /// Replace `agent_id`'s module assignments, bump its version, and re-sign.
    pub fn set_agent_assignments(
        &self,
        keypair: &KeyPair,
        agent_id: &str,
        assignments: Vec<ModuleAssignment>,
    ) -> Result<AgentModuleConfig, CatalogError> {
        let version_key = format!("agent:{agent_id}");
        let next_version = self
            .versions
            .update_and_fetch(version_key, |cur| cur.unwrap_or(0) + 1)?;

        let mut config = AgentModuleConfig {
            agent_id: agent_id.to_string(),
            assignments,
            version: next_version,
            signature: None,
        };
        sign_agent_config(keypair, &mut config)?;

        self.assignments.put(agent_id, &config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use warden_core::{RequiredCapabilities, ResourceLimits};

    fn sample_image(id: &str, version: &str) -> ModuleImage {
        ModuleImage {
            id: id.into(),
            version: version.into(),
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn publish_module_bumps_version_and_signs_catalog() {
        let store = Store::open_temporary().unwrap();
        let service = CatalogService::open(&store).unwrap();
        let keypair = KeyPair::generate();

        let catalog = service
            .publish_module(&keypair, sample_image("ssh-honeypot", "1.0.0"))
            .unwrap();
        assert_eq!(catalog.version, 1);
        assert!(catalog.signature.is_some());

        let catalog = service
            .publish_module(&keypair, sample_image("telnet-honeypot", "1.0.0"))
            .unwrap();
        assert_eq!(catalog.version, 2);
        assert_eq!(catalog.modules.len(), 2);
    }

    #[test]
    fn publish_module_replaces_same_id_and_version() {
        let store = Store::open_temporary().unwrap();
        let service = CatalogService::open(&store).unwrap();
        let keypair = KeyPair::generate();

        service
            .publish_module(&keypair, sample_image("a", "1.0.0"))
            .unwrap();
        let mut updated = sample_image("a", "1.0.0");
        updated.size_bytes = 999;
        let catalog = service.publish_module(&keypair, updated).unwrap();

        assert_eq!(catalog.modules.len(), 1);
        assert_eq!(catalog.modules[0].size_bytes, 999);
    }

    #[test]
    fn retract_module_removes_entry_and_bumps_version() {
        let store = Store::open_temporary().unwrap();
        let service = CatalogService::open(&store).unwrap();
        let keypair = KeyPair::generate();

        service
            .publish_module(&keypair, sample_image("a", "1.0.0"))
            .unwrap();
        let catalog = service.retract_module(&keypair, "a", "1.0.0").unwrap();
        assert!(catalog.modules.is_empty());
        assert_eq!(catalog.version, 2);
    }

    #[test]
    fn set_agent_assignments_bumps_version_independently_per_agent() {
        let store = Store::open_temporary().unwrap();
        let service = CatalogService::open(&store).unwrap();
        let keypair = KeyPair::generate();

        let config_a1 = service
            .set_agent_assignments(&keypair, "agent-a", vec![])
            .unwrap();
        let config_b1 = service
            .set_agent_assignments(&keypair, "agent-b", vec![])
            .unwrap();
        let config_a2 = service
            .set_agent_assignments(&keypair, "agent-a", vec![])
            .unwrap();

        assert_eq!(config_a1.version, 1);
        assert_eq!(config_b1.version, 1);
        assert_eq!(config_a2.version, 2);
    }

    #[test]
    fn agent_config_returns_none_before_first_assignment() {
        let store = Store::open_temporary().unwrap();
        let service = CatalogService::open(&store).unwrap();
        assert!(service.agent_config("agent-a").unwrap().is_none());
    }
}
