//! World persistence.
//!
//! A save is a single versioned JSON document holding the whole world:
//! every sim with its memory log, relationships and object memories, the
//! locations and the simulation clock.

use crate::config::EngineConfig;
use crate::world::{SharedWorld, Sim, SimId, World, WorldError};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("no save path configured (set SIM_SAVE_PATH)")]
    NoSavePath,
}

/// Current save file version.
const SAVE_VERSION: u32 = 1;

/// A saved world with everything needed to resume the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedWorld {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// Wall-clock time of the save, RFC 3339.
    pub saved_at: String,

    pub metadata: SaveMetadata,

    pub world: World,
}

/// Summary of a save, readable without loading the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub sims: usize,
    pub locations: usize,
    /// Memory entries across all sims.
    pub memories: usize,
    /// Simulation time at the save.
    pub sim_time: NaiveDateTime,
}

impl SavedWorld {
    pub fn new(world: World) -> Self {
        let metadata = SaveMetadata {
            sims: world.sims.len(),
            locations: world.locations.len(),
            memories: world.sims.values().map(|sim| sim.memory.len()).sum(),
            sim_time: world.now(),
        };
        Self {
            version: SAVE_VERSION,
            saved_at: Utc::now().to_rfc3339(),
            metadata,
            world,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;
        check_version(saved.version)?;
        Ok(saved)
    }

    /// Read a save's metadata without loading the world.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<SaveMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: SaveMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;
        check_version(partial.version)?;
        Ok(partial.metadata)
    }
}

fn check_version(found: u32) -> Result<(), PersistError> {
    if found != SAVE_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SAVE_VERSION,
            found,
        });
    }
    Ok(())
}

/// Where sims live between runs.
#[async_trait]
pub trait SimStorage: Send + Sync {
    /// A snapshot of one sim.
    async fn get_sim(&self, id: SimId) -> Result<Sim, PersistError>;

    /// Write the current state out.
    async fn save(&self) -> Result<(), PersistError>;
}

/// Keeps the shared world in a JSON save file.
#[derive(Clone)]
pub struct JsonStorage {
    world: SharedWorld,
    path: PathBuf,
}

impl JsonStorage {
    pub fn new(world: SharedWorld, path: impl Into<PathBuf>) -> Self {
        Self {
            world,
            path: path.into(),
        }
    }

    /// Load the world saved at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let saved = SavedWorld::load_json(&path).await?;
        info!(path = %path.display(), sims = saved.metadata.sims, "World loaded");
        Ok(Self::new(saved.world.into_shared(), path))
    }

    /// Load the world saved at `path`, or start from `fallback` when there is
    /// no save yet.
    pub async fn open_or(path: impl Into<PathBuf>, fallback: World) -> Result<Self, PersistError> {
        let path = path.into();
        match fs::try_exists(&path).await? {
            true => Self::open(path).await,
            false => Ok(Self::new(fallback.into_shared(), path)),
        }
    }

    /// Open the save at the configured `save_path`, or start from `fallback`
    /// when nothing has been saved there yet.
    pub async fn from_config(config: &EngineConfig, fallback: World) -> Result<Self, PersistError> {
        let path = config.save_path.clone().ok_or(PersistError::NoSavePath)?;
        Self::open_or(path, fallback).await
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SimStorage for JsonStorage {
    async fn get_sim(&self, id: SimId) -> Result<Sim, PersistError> {
        Ok(self.world.read().await.sim(id)?.clone())
    }

    async fn save(&self) -> Result<(), PersistError> {
        let saved = SavedWorld::new(self.world.read().await.clone());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        saved.save_json(&self.path).await?;
        info!(path = %self.path.display(), memories = saved.metadata.memories, "World saved");
        Ok(())
    }
}
