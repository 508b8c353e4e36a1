//! Per-chunk protection grid and its run-length codec.
//!
//! Wire layout of an encoded grid:
//!
//! ```text
//! varint total_items
//! { varint run_length, varint value } * n     // sum(run_length) == total_items
//! ```
//!
//! All integers are unsigned LEB128. An all-zero grid encodes to an empty
//! block, which the chunk store omits from the file entirely.

use thiserror::Error;

/// Group id meaning "anyone may paint here".
pub const UNPROTECTED: u32 = 0;

/// Group id written by [`crate::World::set_area_protection`] when enabling.
pub const PROTECTED: u32 = 1;

/// Protection block could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtectionError {
    /// Stream ended inside a varint or before all runs were read
    #[error("Protection data truncated")]
    Truncated,
    /// Varint does not fit in 32 bits
    #[error("Protection varint overflows u32")]
    Overflow,
    /// Header item count differs from the grid size
    #[error("Protection item count mismatch: expected {expected}, got {actual}")]
    CountMismatch {
        /// Cells in the grid
        expected: usize,
        /// Count found in the stream
        actual: usize,
    },
    /// A run of length zero or runs overshooting the item count
    #[error("Protection run lengths are inconsistent")]
    BadRun,
    /// Bytes left over after the last run
    #[error("{0} trailing bytes after protection data")]
    TrailingBytes(usize),
}

/// Square grid of protection group ids for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionGrid {
    side: u32,
    cells: Vec<u32>,
}

impl ProtectionGrid {
    /// Creates an all-unprotected grid of `side × side` cells.
    ///
    /// `side` must be a power of two.
    #[must_use]
    pub fn new(side: u32) -> Self {
        debug_assert!(side.is_power_of_two());
        Self {
            side,
            cells: vec![UNPROTECTED; (side * side) as usize],
        }
    }

    /// Cells per side.
    #[must_use]
    pub const fn side(&self) -> u32 {
        self.side
    }

    /// Raw cells, row-major.
    #[must_use]
    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    fn index(&self, x: i32, y: i32) -> usize {
        let mask = self.side - 1;
        ((y as u32 & mask) * self.side + (x as u32 & mask)) as usize
    }

    /// Group id at `(x, y)`, wrapped into the grid.
    #[must_use]
    pub fn get(&self, x: i32, y: i32) -> u32 {
        self.cells[self.index(x, y)]
    }

    /// Sets the group id at `(x, y)`. Returns whether it changed.
    pub fn set(&mut self, x: i32, y: i32, gid: u32) -> bool {
        let index = self.index(x, y);
        let changed = self.cells[index] != gid;
        self.cells[index] = gid;
        changed
    }

    /// True if every cell is unprotected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|&gid| gid == UNPROTECTED)
    }

    /// Clears every cell.
    pub fn reset(&mut self) {
        self.cells.fill(UNPROTECTED);
    }

    /// Encodes the grid. Empty grids produce an empty block.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        encode(&self.cells)
    }

    /// Replaces the grid contents with a decoded block.
    ///
    /// An empty block means "no protection". On error the grid is left
    /// reset, never half-written.
    pub fn load(&mut self, block: &[u8]) -> Result<(), ProtectionError> {
        if block.is_empty() {
            self.reset();
            return Ok(());
        }
        match decode(block, self.cells.len()) {
            Ok(cells) => {
                self.cells = cells;
                Ok(())
            },
            Err(e) => {
                self.reset();
                Err(e)
            },
        }
    }
}

/// Run-length encodes `cells`.
#[must_use]
pub fn encode(cells: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    write_varint(&mut out, cells.len() as u32);

    let mut iter = cells.iter().copied();
    let Some(mut current) = iter.next() else {
        return out;
    };
    let mut run: u32 = 1;
    for value in iter {
        if value == current {
            run += 1;
        } else {
            write_varint(&mut out, run);
            write_varint(&mut out, current);
            current = value;
            run = 1;
        }
    }
    write_varint(&mut out, run);
    write_varint(&mut out, current);
    out
}

/// Decodes a block, requiring exactly `expected` items.
pub fn decode(data: &[u8], expected: usize) -> Result<Vec<u32>, ProtectionError> {
    let mut pos = 0;
    let total = read_varint(data, &mut pos)? as usize;
    if total != expected {
        return Err(ProtectionError::CountMismatch {
            expected,
            actual: total,
        });
    }

    let mut cells = Vec::with_capacity(total);
    while cells.len() < total {
        let run = read_varint(data, &mut pos)? as usize;
        let value = read_varint(data, &mut pos)?;
        if run == 0 || cells.len() + run > total {
            return Err(ProtectionError::BadRun);
        }
        cells.resize(cells.len() + run, value);
    }

    if pos != data.len() {
        return Err(ProtectionError::TrailingBytes(data.len() - pos));
    }
    Ok(cells)
}

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u32, ProtectionError> {
    let mut result: u32 = 0;
    for shift in (0..35).step_by(7) {
        let byte = *data.get(*pos).ok_or(ProtectionError::Truncated)?;
        *pos += 1;
        let bits = u32::from(byte & 0x7F);
        if shift == 28 && bits > 0x0F {
            return Err(ProtectionError::Overflow);
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ProtectionError::Overflow)
}
