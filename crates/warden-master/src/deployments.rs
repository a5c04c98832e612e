//! Per-satellite desired-state store: an admin-editable `Deployment` that the catalog
//! service signs into the `AgentModuleConfig` the agent actually pulls.

use chrono::Utc;
use warden_core::{Deployment, ModuleAssignment};
use warden_kv::{Bucket, Store};

use crate::MasterError;

/// Master-side store of desired per-satellite module deployments, keyed by satellite id.
pub struct DeploymentStore {
    deployments: Bucket<Deployment>,
}

impl DeploymentStore {
    /// Open (or create) the deployment bucket within `store`.
    pub fn open(store: &Store) -> Result<Self, MasterError> {
        Ok(Self {
            deployments: store.bucket("deployments_desired")?,
        })
    }

    /// The current desired deployment for `satellite_id`, if one has ever been set.
    pub fn get(&self, satellite_id: &str) -> Result<Option<Deployment>, MasterError> {
        Ok(self.deployments.get(satellite_id)?)
    }

    /// List every satellite's current desired deployment.
    pub fn list(&self) -> Result<Vec<Deployment>, MasterError> {
        let mut out = Vec::new();
        for deployment in self.deployments.iter_values() {
            out.push(deployment?);
        }
        Ok(out)
    }

    /// Replace `satellite_id`'s desired module set, bumping its version.
    pub fn set(
        &self,
        satellite_id: &str,
        modules: Vec<ModuleAssignment>,
    ) -> Result<Deployment, MasterError> {
        let next_version = self.get(satellite_id)?.map_or(1, |d| d.version + 1);
        let deployment = Deployment {
            satellite_id: satellite_id.to_string(),
            modules,
            version: next_version,
            signature: None,
            updated_at: Utc::now(),
        };
        self.deployments.put(satellite_id, &deployment)?;
        Ok(deployment)
    }

    /// Remove `satellite_id`'s desired deployment.
    pub fn delete(&self, satellite_id: &str) -> Result<(), MasterError> {
        self.deployments.remove(satellite_id)?;
        Ok(())
    }
}
