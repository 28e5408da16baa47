//! Persistent driver state
//!
//! A single JSON document carrying the user-facing controls and the open
//! session across restarts. Writes go to a sibling temp file that is synced
//! and renamed over the target, so the loader can never observe a partial
//! document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{ChargeMode, StartStop};
use crate::error::{DriverError, Result};
use crate::session::ChargingSession;
use crate::status::EvChargerStatus;

/// State carried across restarts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PersistedState {
    pub mode: ChargeMode,
    pub start_stop: StartStop,
    /// User-intended current (A)
    pub set_current: f64,
    /// Last current confirmed to the charger (A)
    pub applied_current: f64,
    /// Last phase count written (0 = never written)
    pub applied_phases: u8,
    pub status: EvChargerStatus,
    pub session: Option<ChargingSession>,
}

/// Loads and atomically saves the state file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state; missing file or corruption yields defaults
    pub fn load(&self) -> PersistedState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting fresh", self.path.display());
                return PersistedState::default();
            },
            Err(e) => {
                warn!("Cannot read state file {}: {e}", self.path.display());
                return PersistedState::default();
            },
        };

        match serde_json::from_str(&raw) {
            Ok(state) => {
                debug!("Loaded state from {}", self.path.display());
                state
            },
            Err(e) => {
                warn!(
                    "Corrupt state file {}, starting fresh: {e}",
                    self.path.display()
                );
                PersistedState::default()
            },
        }
    }

    /// Atomically persist the state: temp file in the same directory, fsync,
    /// rename over the target.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        use std::io::Write;

        let payload = serde_json::to_vec_pretty(state)
            .map_err(|e| DriverError::persistence(format!("serialize failed: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DriverError::persistence(format!(
                        "cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
                DriverError::persistence(format!("cannot create {}: {e}", tmp_path.display()))
            })?;
            file.write_all(&payload)
                .map_err(|e| DriverError::persistence(format!("write failed: {e}")))?;
            file.sync_all()
                .map_err(|e| DriverError::persistence(format!("sync failed: {e}")))?;
        }

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| DriverError::persistence(format!("rename failed: {e}")))?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
