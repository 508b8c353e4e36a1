//! Error types for Mural.

use thiserror::Error;

/// Top-level error type for Mural operations.
#[derive(Debug, Error)]
pub enum MuralError {
    /// World/chunk errors
    #[error("World error: {0}")]
    World(#[from] WorldError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller errors raised by world operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// Chunk coordinate lies outside the canvas border
    #[error("Chunk ({x}, {y}) is outside the canvas border")]
    OutOfBorder {
        /// X coordinate
        x: i32,
        /// Y coordinate
        y: i32,
    },

    /// World name is empty, too long, or uses forbidden characters
    #[error("Invalid world name: {0:?}")]
    InvalidWorldName(String),

    /// World is not loaded
    #[error("World not loaded: {0}")]
    NotLoaded(String),
}

/// Result type alias for world operations.
pub type WorldResult<T> = Result<T, WorldError>;

/// Result type alias for Mural operations.
pub type MuralResult<T> = Result<T, MuralError>;
