//! Persistent registry of enrolled satellites (fleet agents).

use chrono::Utc;
use warden_core::{Satellite, SatelliteStatus};
use warden_kv::{Bucket, Store};

use crate::MasterError;

/// Master-side store of every enrolled [`Satellite`], keyed by agent id.
pub struct SatelliteStore {
    satellites: Bucket<Satellite>,
}

impl SatelliteStore {
    /// Open (or create) the satellite bucket within `store`.
    pub fn open(store: &Store) -> Result<Self, MasterError> {
        Ok(Self {
            satellites: store.bucket("satellites")?,
        })
    }

    /// Record a newly enrolled satellite.
    pub fn register(&self, satellite: Satellite) -> Result<(), MasterError> {
        self.satellites.put(&satellite.id, &satellite)?;
        Ok(())
    }

    /// Look up a satellite by id.
    pub fn get(&self, id: &str) -> Result<Option<Satellite>, MasterError> {
        Ok(self.satellites.get(id)?)
    }

    /// List every enrolled satellite.
    pub fn list(&self) -> Result<Vec<Satellite>, MasterError> {
        let mut out = Vec::new();
        for satellite in self.satellites.iter_values() {
            out.push(satellite?);
        }
        Ok(out)
    }

    /// Record a heartbeat: bump `last_seen_at`, and transition to `Online` if the
    /// satellite wasn't already.
    ///
    /// # Errors
    /// [`MasterError::NotFound`] if `id` is not an enrolled satellite.
    pub fn heartbeat(&self, id: &str) -> Result<Satellite, MasterError> {
        let mut satellite = self
            .satellites
            .get(id)?
            .ok_or_else(|| MasterError::NotFound(id.to_string()))?;
        satellite.last_seen_at = Utc::now();
        if satellite.status != SatelliteStatus::Online {
            satellite.status = SatelliteStatus::Online;
        }
        self.satellites.put(id, &satellite)?;
        Ok(satellite)
    }
}
