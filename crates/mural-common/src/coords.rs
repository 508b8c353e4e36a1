//! Coordinate types for chunk and protection-cell positions.

use serde::{Deserialize, Serialize};

/// Chunk coordinate (identifies a chunk in the canvas grid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// X coordinate in chunk space
    pub x: i32,
    /// Y coordinate in chunk space
    pub y: i32,
}

impl ChunkCoord {
    /// Creates a new chunk coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns the chunk containing the canvas pixel `(x, y)`.
    ///
    /// `shift` is `log2(chunk_size)`. Arithmetic shift keeps negative
    /// pixels in the chunk to their left/top.
    #[must_use]
    pub const fn from_pixel(x: i32, y: i32, shift: u32) -> Self {
        Self {
            x: x >> shift,
            y: y >> shift,
        }
    }

    /// Returns the chunk owning the protection cell `(cell_x, cell_y)`.
    ///
    /// `shift` is `log2(cells_per_side)`.
    #[must_use]
    pub const fn from_cell(cell_x: i32, cell_y: i32, shift: u32) -> Self {
        Self::from_pixel(cell_x, cell_y, shift)
    }

    /// Packs both axes into one map key (`x` low, `y` high).
    #[must_use]
    pub const fn key(self) -> u64 {
        (self.x as u32 as u64) | ((self.y as u32 as u64) << 32)
    }

    /// Unpacks a key produced by [`ChunkCoord::key`].
    #[must_use]
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: key as u32 as i32,
            y: (key >> 32) as u32 as i32,
        }
    }

    /// Whether both axes lie inside `[!border, border]`.
    #[must_use]
    pub const fn within_border(self, border: i32) -> bool {
        self.x <= border && self.y <= border && self.x >= !border && self.y >= !border
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Largest chunk coordinate magnitude for a given chunk size, so that every
/// pixel of every valid chunk is addressable with an `i32`.
#[must_use]
pub const fn chunk_border(chunk_size: u32) -> i32 {
    i32::MAX / chunk_size as i32
}
