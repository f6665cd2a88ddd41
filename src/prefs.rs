// Dashboard preferences module
// Persisted view settings for the device dashboard: selected group, refresh
// cadence, tile layout and the preferred decoder back-end

use crate::decoder::DecoderType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrefsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Persisted dashboard state
///
/// Unknown or missing fields load as defaults, so the schema can grow without
/// invalidating stored files. The decoder preference round-trips through the
/// stable `DecoderType` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardPrefs {
    /// Currently selected device group, if any
    pub selected_group_id: Option<i64>,
    /// Tile refresh interval in seconds, 0 disables periodic refresh
    pub refresh_interval: u64,
    /// Dashboard tile columns
    pub column_count: u32,
    /// Decoder back-end the user pinned, if any
    pub preferred_decoder: Option<DecoderType>,
}

impl Default for DashboardPrefs {
    fn default() -> Self {
        Self {
            selected_group_id: None,
            refresh_interval: 0,
            column_count: 4,
            preferred_decoder: None,
        }
    }
}

/// File-backed preference store; every setter persists immediately
pub struct PrefsStore {
    path: PathBuf,
    prefs: RwLock<DashboardPrefs>,
}

impl PrefsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let prefs = Self::load(&path);
        Self {
            path,
            prefs: RwLock::new(prefs),
        }
    }

    /// Store under the platform config directory
    pub fn open_default() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleet-console");
        Self::new(dir.join("dashboard.json"))
    }

    fn load(path: &Path) -> DashboardPrefs {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(prefs) => prefs,
                Err(e) => {
                    log::warn!("Corrupt preferences at {}: {}, using defaults", path.display(), e);
                    DashboardPrefs::default()
                }
            },
            Err(_) => DashboardPrefs::default(),
        }
    }

    pub fn get(&self) -> DashboardPrefs {
        self.prefs.read().clone()
    }

    pub fn set_selected_group(&self, group_id: Option<i64>) -> Result<(), PrefsError> {
        self.update(|p| p.selected_group_id = group_id)
    }

    pub fn set_refresh_interval(&self, seconds: u64) -> Result<(), PrefsError> {
        self.update(|p| p.refresh_interval = seconds)
    }

    pub fn set_column_count(&self, count: u32) -> Result<(), PrefsError> {
        self.update(|p| p.column_count = count)
    }

    pub fn set_preferred_decoder(&self, decoder: Option<DecoderType>) -> Result<(), PrefsError> {
        self.update(|p| p.preferred_decoder = decoder)
    }

    fn update(&self, apply: impl FnOnce(&mut DashboardPrefs)) -> Result<(), PrefsError> {
        let snapshot = {
            let mut prefs = self.prefs.write();
            apply(&mut prefs);
            prefs.clone()
        };
        self.save(&snapshot)
    }

    fn save(&self, prefs: &DashboardPrefs) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(prefs)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Reset to defaults and remove the stored file
    pub fn clear(&self) -> Result<(), PrefsError> {
        *self.prefs.write() = DashboardPrefs::default();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Global preference store
static PREFS_STORE: once_cell::sync::Lazy<Arc<PrefsStore>> =
    once_cell::sync::Lazy::new(|| Arc::new(PrefsStore::open_default()));

/// Get the global preference store
pub fn get_prefs_store() -> Arc<PrefsStore> {
    PREFS_STORE.clone()
}
