//! Per-world properties persisted to `props.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use mural_common::{Rgb, SchemaVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::chunk::{ChunkGeometry, DEFAULT_CHUNK_SIZE, PROTECTION_AREA_SIZE};

/// Properties file name inside a world directory.
pub const PROPS_FILE_NAME: &str = "props.toml";

/// Default pixels per second granted to new players.
pub const DEFAULT_PAINT_RATE: u32 = 32;

/// Errors that can occur reading or writing world properties.
#[derive(Debug, Error)]
pub enum PropsError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// TOML deserialization error.
    #[error("TOML parse error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    /// File written by an incompatible version.
    #[error("Unsupported props version {found}, expected {expected}")]
    VersionMismatch {
        /// Version this build writes
        expected: SchemaVersion,
        /// Version found in the file
        found: SchemaVersion,
    },
}

/// Result type for props operations.
pub type PropsResult<T> = Result<T, PropsError>;

/// Serialized form of the properties file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropsData {
    /// Message of the day shown on join.
    pub motd: Option<String>,
    /// Password required to paint; `None` for an open world.
    pub password: Option<String>,
    /// Background colour of untouched pixels.
    pub bgcolor: Rgb,
    /// Pixels per second a player may paint.
    pub paint_rate: u32,
    /// Chunk side in pixels.
    pub chunk_size: u32,
    /// File format version.
    pub version: SchemaVersion,
}

impl Default for PropsData {
    fn default() -> Self {
        Self {
            motd: None,
            password: None,
            bgcolor: Rgb::WHITE,
            paint_rate: DEFAULT_PAINT_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            version: SchemaVersion::WORLD_PROPS,
        }
    }
}

impl PropsData {
    /// Replaces out-of-range values with defaults.
    pub fn validate(&mut self) {
        if ChunkGeometry::new(self.chunk_size, PROTECTION_AREA_SIZE).is_none() {
            warn!(
                "Invalid chunk_size {}, falling back to {DEFAULT_CHUNK_SIZE}",
                self.chunk_size
            );
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        self.paint_rate = self.paint_rate.max(1);
        if self.password.as_deref() == Some("") {
            self.password = None;
        }
    }

    /// Serializes to TOML string.
    pub fn to_toml(&self) -> PropsResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Deserializes and validates from a TOML string.
    pub fn from_toml(toml: &str) -> PropsResult<Self> {
        let mut data: Self = toml::from_str(toml)?;
        if !SchemaVersion::WORLD_PROPS.can_read(&data.version) {
            return Err(PropsError::VersionMismatch {
                expected: SchemaVersion::WORLD_PROPS,
                found: data.version,
            });
        }
        data.validate();
        Ok(data)
    }
}

/// Properties of one world plus change tracking.
#[derive(Debug)]
pub struct WorldProps {
    /// Current values.
    data: PropsData,
    /// Path to `props.toml`.
    path: PathBuf,
    /// Whether values changed since the last save.
    dirty: bool,
}

impl WorldProps {
    /// Loads properties from `world_dir`.
    ///
    /// A missing file yields defaults. An unreadable or incompatible file
    /// also yields defaults, with a warning; it is left on disk until the
    /// next change is saved over it.
    #[must_use]
    pub fn load(world_dir: &Path) -> Self {
        let path = world_dir.join(PROPS_FILE_NAME);
        let data = match fs::read_to_string(&path) {
            Ok(contents) => PropsData::from_toml(&contents).unwrap_or_else(|e| {
                warn!("Ignoring unreadable {:?}: {e}", path);
                PropsData::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PropsData::default(),
            Err(e) => {
                warn!("Failed to read {:?}: {e}", path);
                PropsData::default()
            },
        };
        Self {
            data,
            path,
            dirty: false,
        }
    }

    /// Writes the file if anything changed. Returns whether it wrote.
    pub fn save(&mut self) -> PropsResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml = self.data.to_toml()?;
        let temp_path = self.path.with_extension("toml.tmp");
        fs::write(&temp_path, toml)?;
        fs::rename(&temp_path, &self.path)?;
        self.dirty = false;

        info!("Props saved to {:?}", self.path);
        Ok(true)
    }

    /// Path of the properties file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current values.
    #[must_use]
    pub fn data(&self) -> &PropsData {
        &self.data
    }

    /// Whether there are unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn motd(&self) -> Option<&str> {
        self.data.motd.as_deref()
    }

    pub fn set_motd(&mut self, motd: Option<String>) {
        if self.data.motd != motd {
            self.data.motd = motd;
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.data.password.as_deref()
    }

    #[must_use]
    pub fn has_password(&self) -> bool {
        self.data.password.is_some()
    }

    /// Sets or clears the password. An empty string clears it.
    pub fn set_password(&mut self, password: Option<String>) {
        let password = password.filter(|p| !p.is_empty());
        if self.data.password != password {
            self.data.password = password;
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn background(&self) -> Rgb {
        self.data.bgcolor
    }

    /// Sets the background colour.
    ///
    /// Resident chunks keep the colour they were created with; the change
    /// applies to chunks loaded afterwards.
    pub fn set_background(&mut self, color: Rgb) {
        if self.data.bgcolor != color {
            self.data.bgcolor = color;
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn paint_rate(&self) -> u32 {
        self.data.paint_rate
    }

    pub fn set_paint_rate(&mut self, rate: u32) {
        let rate = rate.max(1);
        if self.data.paint_rate != rate {
            self.data.paint_rate = rate;
            self.dirty = true;
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> u32 {
        self.data.chunk_size
    }

    /// Sets the chunk size used the next time the world is opened.
    ///
    /// Returns false and leaves the value alone if the size is invalid.
    pub fn set_chunk_size(&mut self, size: u32) -> bool {
        if ChunkGeometry::new(size, PROTECTION_AREA_SIZE).is_none() {
            return false;
        }
        if self.data.chunk_size != size {
            self.data.chunk_size = size;
            self.dirty = true;
        }
        true
    }

    /// Geometry derived from the stored chunk size.
    #[must_use]
    pub fn geometry(&self) -> ChunkGeometry {
        ChunkGeometry::new(self.data.chunk_size, PROTECTION_AREA_SIZE).unwrap_or_default()
    }
}
