//! Server configuration.
//!
//! Loaded from `mural.toml` (or the path given on the command line). Every
//! field has a default, so a partial file is fine.

use mural_world::{FlushLimits, ManagerConfig, WorldManager, WorldSettings, DEFAULT_WORLD_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default configuration file path.
pub const CONFIG_FILE: &str = "mural.toml";

/// Server configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // === Storage ===
    /// Directory holding one subdirectory per world
    pub worlds_dir: PathBuf,
    /// World opened at startup and used when a client names none
    pub default_world: String,

    // === Timers ===
    /// Milliseconds between ticks
    pub tick_interval_ms: u64,
    /// Seconds between idle-chunk sweeps
    pub sweep_interval_secs: u64,
    /// Seconds between autosaves
    pub save_interval_secs: u64,

    // === Chunks ===
    /// Render worker threads
    pub render_threads: usize,
    /// Seconds a chunk may sit unmodified before a sweep evicts it
    pub chunk_idle_secs: u64,
    /// Resident chunks per world before a forced eviction
    pub max_resident_chunks: usize,

    // === Updates ===
    /// Player positions per update message
    pub max_player_updates: usize,
    /// Pixels per update message
    pub max_pixel_updates: usize,
    /// Departed players per update message
    pub max_player_left_updates: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = FlushLimits::default();
        Self {
            worlds_dir: PathBuf::from("worlds"),
            default_world: DEFAULT_WORLD_NAME.to_string(),
            tick_interval_ms: 50,
            sweep_interval_secs: 60,
            save_interval_secs: 300,
            render_threads: 2,
            chunk_idle_secs: 60,
            max_resident_chunks: 64,
            max_player_updates: limits.player_updates,
            max_pixel_updates: limits.pixel_updates,
            max_player_left_updates: limits.player_left,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        let mut config: Self = match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                },
                Err(e) => {
                    warn!("Failed to parse config file: {e}");
                    Self::default()
                },
            },
            Err(e) => {
                warn!("Failed to read config file: {e}");
                Self::default()
            },
        };
        config.validate();
        config
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        if !WorldManager::verify_world_name(&self.default_world) {
            warn!(
                "Invalid default_world {:?}, using {DEFAULT_WORLD_NAME}",
                self.default_world
            );
            self.default_world = DEFAULT_WORLD_NAME.to_string();
        }

        // Timers
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1000);
        self.sweep_interval_secs = self.sweep_interval_secs.clamp(1, 3600);
        self.save_interval_secs = self.save_interval_secs.clamp(1, 86_400);

        // Chunks
        self.render_threads = self.render_threads.clamp(1, 64);
        self.chunk_idle_secs = self.chunk_idle_secs.clamp(1, 86_400);
        self.max_resident_chunks = self.max_resident_chunks.clamp(1, 65_536);

        // Updates
        let limits = self.flush_limits();
        self.max_player_updates = limits.player_updates;
        self.max_pixel_updates = limits.pixel_updates;
        self.max_player_left_updates = limits.player_left;
    }

    /// Per-message caps, clamped to the wire format.
    pub fn flush_limits(&self) -> FlushLimits {
        FlushLimits {
            player_updates: self.max_player_updates,
            pixel_updates: self.max_pixel_updates,
            player_left: self.max_player_left_updates,
        }
        .clamped()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    /// Settings for the world manager.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            worlds_dir: self.worlds_dir.clone(),
            default_world: self.default_world.clone(),
            render_threads: self.render_threads,
            world: WorldSettings {
                idle_threshold: Duration::from_secs(self.chunk_idle_secs),
                max_resident_chunks: self.max_resident_chunks,
                limits: self.flush_limits(),
            },
        }
    }
}
