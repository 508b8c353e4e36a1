//! Chunk data structure: pixels, protection, dirty tracking, render cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mural_common::{chunk_border, ChunkCoord, Rgb};
use tracing::{debug, warn};

use crate::protection::ProtectionGrid;
use crate::render::{ChunkEncoder, PixelSnapshot, RenderError};
use crate::store::{ChunkStore, StoreResult};

/// Canonical chunk width and height in pixels.
pub const DEFAULT_CHUNK_SIZE: u32 = 512;

/// Width and height of one protection cell in pixels.
pub const PROTECTION_AREA_SIZE: u32 = 16;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: u32 = 32;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: u32 = 4096;

/// Idle time after which a chunk may be evicted.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Bytes per pixel in the buffer (RGB).
pub const BYTES_PER_PIXEL: usize = 3;

/// Size-derived constants shared by every chunk of a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    size: u32,
    protection_area: u32,
}

impl Default for ChunkGeometry {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            protection_area: PROTECTION_AREA_SIZE,
        }
    }
}

impl ChunkGeometry {
    /// Validates and builds a geometry.
    ///
    /// Both values must be powers of two, the size within
    /// [`MIN_CHUNK_SIZE`]..=[`MAX_CHUNK_SIZE`], and the protection area no
    /// larger than the chunk.
    #[must_use]
    pub fn new(size: u32, protection_area: u32) -> Option<Self> {
        let valid = size.is_power_of_two()
            && protection_area.is_power_of_two()
            && (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size)
            && protection_area <= size;
        valid.then_some(Self {
            size,
            protection_area,
        })
    }

    /// Chunk side in pixels.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Protection cell side in pixels.
    #[must_use]
    pub const fn protection_area(&self) -> u32 {
        self.protection_area
    }

    /// Protection cells per chunk side (`pc`).
    #[must_use]
    pub const fn cells_per_side(&self) -> u32 {
        self.size / self.protection_area
    }

    /// `log2(size)`: pixel → chunk shift.
    #[must_use]
    pub const fn pixel_shift(&self) -> u32 {
        self.size.trailing_zeros()
    }

    /// `log2(protection_area)`: pixel → cell shift.
    #[must_use]
    pub const fn area_shift(&self) -> u32 {
        self.protection_area.trailing_zeros()
    }

    /// `log2(pc)`: cell → chunk shift.
    #[must_use]
    pub const fn cell_shift(&self) -> u32 {
        self.cells_per_side().trailing_zeros()
    }

    /// Largest valid chunk coordinate magnitude.
    #[must_use]
    pub const fn border(&self) -> i32 {
        chunk_border(self.size)
    }

    /// Length of the RGB pixel buffer.
    #[must_use]
    pub const fn buffer_len(&self) -> usize {
        (self.size as usize) * (self.size as usize) * BYTES_PER_PIXEL
    }
}

/// One fixed-size tile of the canvas.
#[derive(Debug)]
pub struct Chunk {
    /// Chunk coordinate
    coord: ChunkCoord,
    /// Shared world geometry
    geometry: ChunkGeometry,
    /// Colour of untouched pixels
    background: Rgb,
    /// RGB pixels, copy-on-write while a render snapshot is alive
    pixels: Arc<Vec<u8>>,
    /// Protection cells
    protection: ProtectionGrid,
    /// Last time the chunk was created or modified
    last_action: Instant,
    /// Prevents eviction while set
    pinned: bool,
    /// Whether the chunk changed since the last save
    pixels_dirty: bool,
    /// Whether `image_cache` is stale
    image_cache_dirty: bool,
    /// Last rendered image
    image_cache: Option<Arc<[u8]>>,
    /// Bumped on every pixel change
    revision: u64,
    /// A file exists for this chunk but could not be read
    backing_unreadable: bool,
}

impl Chunk {
    /// Creates a background-filled, unprotected chunk.
    #[must_use]
    pub fn new(coord: ChunkCoord, geometry: ChunkGeometry, background: Rgb) -> Self {
        let pixels = background
            .to_bytes()
            .into_iter()
            .cycle()
            .take(geometry.buffer_len())
            .collect();
        Self::with_pixels(coord, geometry, background, pixels)
    }

    fn with_pixels(
        coord: ChunkCoord,
        geometry: ChunkGeometry,
        background: Rgb,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            coord,
            geometry,
            background,
            pixels: Arc::new(pixels),
            protection: ProtectionGrid::new(geometry.cells_per_side()),
            last_action: Instant::now(),
            pinned: false,
            pixels_dirty: false,
            image_cache_dirty: true,
            image_cache: None,
            revision: 0,
            backing_unreadable: false,
        }
    }

    /// Loads the chunk from `store`, or allocates a blank one.
    ///
    /// Missing and unreadable files both yield a blank chunk. An unreadable
    /// file is left on disk until the chunk has content to replace it.
    /// Corrupted protection data is dropped and the chunk flagged for re-save.
    #[must_use]
    pub fn load(
        coord: ChunkCoord,
        geometry: ChunkGeometry,
        background: Rgb,
        store: &ChunkStore,
    ) -> Self {
        let stored = match store.load(coord) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Self::new(coord, geometry, background),
            Err(e) => {
                warn!("Chunk {coord} unreadable, starting blank: {e}");
                let mut chunk = Self::new(coord, geometry, background);
                chunk.backing_unreadable = true;
                return chunk;
            },
        };

        let mut chunk = Self::with_pixels(coord, geometry, background, stored.pixels);
        if let Err(e) = chunk.protection.load(&stored.protection) {
            warn!("Protection data corrupted for chunk {coord}, resetting: {e}");
            chunk.pixels_dirty = true;
            chunk.image_cache_dirty = true;
        }
        debug!("Loaded chunk {coord} from disk");
        chunk
    }

    /// Returns the chunk coordinate.
    #[must_use]
    pub const fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// Returns the chunk geometry.
    #[must_use]
    pub const fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    fn pixel_offset(&self, x: i32, y: i32) -> usize {
        let mask = self.geometry.size - 1;
        let index = (y as u32 & mask) * self.geometry.size + (x as u32 & mask);
        index as usize * BYTES_PER_PIXEL
    }

    /// Colour at `(x, y)`, masked into the chunk.
    #[must_use]
    pub fn pixel(&self, x: i32, y: i32) -> Rgb {
        let offset = self.pixel_offset(x, y);
        Rgb::new(
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        )
    }

    /// Sets the colour at `(x, y)`, masked into the chunk.
    ///
    /// Returns false without touching anything if the colour is unchanged.
    pub fn set_pixel(&mut self, x: i32, y: i32, color: Rgb) -> bool {
        let offset = self.pixel_offset(x, y);
        let bytes = color.to_bytes();
        if self.pixels[offset..offset + BYTES_PER_PIXEL] == bytes {
            return false;
        }

        Arc::make_mut(&mut self.pixels)[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&bytes);
        self.revision += 1;
        self.mark_modified();
        true
    }

    /// Group id of protection cell `(x, y)`, masked into the chunk.
    #[must_use]
    pub fn protection_gid(&self, x: i32, y: i32) -> u32 {
        self.protection.get(x, y)
    }

    /// Sets the group id of protection cell `(x, y)`, masked into the chunk.
    pub fn set_protection_gid(&mut self, x: i32, y: i32, gid: u32) {
        if self.protection.set(x, y, gid) {
            self.mark_modified();
        }
    }

    fn mark_modified(&mut self) {
        self.pixels_dirty = true;
        self.image_cache_dirty = true;
        self.last_action = Instant::now();
    }

    /// Whether the chunk has unsaved changes.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.pixels_dirty
    }

    /// Whether the rendered image is stale.
    #[must_use]
    pub const fn is_image_cache_outdated(&self) -> bool {
        self.image_cache_dirty
    }

    /// Rendered image, if it matches the current pixels.
    #[must_use]
    pub fn cached_image(&self) -> Option<Arc<[u8]>> {
        if self.image_cache_dirty {
            return None;
        }
        self.image_cache.clone()
    }

    /// Read-only view of the pixels for an off-thread encode.
    #[must_use]
    pub fn snapshot(&self) -> PixelSnapshot {
        PixelSnapshot {
            coord: self.coord,
            size: self.geometry.size,
            revision: self.revision,
            pixels: Arc::clone(&self.pixels),
        }
    }

    /// Stores a finished render of the pixels at `revision`.
    ///
    /// The cache only counts as fresh if no pixel changed since the
    /// snapshot was taken. Returns whether it is fresh.
    pub fn apply_render(&mut self, revision: u64, image: Arc<[u8]>) -> bool {
        self.image_cache = Some(image);
        if revision == self.revision {
            self.image_cache_dirty = false;
        }
        !self.image_cache_dirty
    }

    /// Re-encodes the image cache on the calling thread.
    pub fn refresh_image_cache(&mut self, encoder: &dyn ChunkEncoder) -> Result<(), RenderError> {
        let snapshot = self.snapshot();
        let image = encoder.encode(&snapshot)?;
        self.apply_render(snapshot.revision, image.into());
        Ok(())
    }

    /// Whether the chunk is pinned against eviction.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Pins or unpins the chunk.
    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    /// Time since the last modification or load.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_action.elapsed()
    }

    /// Whether the chunk can be evicted now.
    #[must_use]
    pub fn should_unload(&self, ignore_age: bool, idle_threshold: Duration) -> bool {
        !self.pinned && (ignore_age || self.idle_time() > idle_threshold)
    }

    /// True if unprotected and every pixel equals the background.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let background = self.background.to_bytes();
        self.protection.is_empty()
            && self
                .pixels
                .chunks_exact(BYTES_PER_PIXEL)
                .all(|px| px == background)
    }

    /// Writes pending changes. Returns whether anything was written.
    ///
    /// An empty chunk removes its file instead, unless that file could not
    /// be read. An unreadable file is moved aside before new content is
    /// written over it. On error the chunk stays dirty so a later save
    /// retries.
    pub fn save(&mut self, store: &ChunkStore) -> StoreResult<bool> {
        if !self.pixels_dirty {
            return Ok(false);
        }

        if self.is_empty() {
            if self.backing_unreadable {
                self.pixels_dirty = false;
                return Ok(false);
            }
            store.remove(self.coord)?;
        } else {
            if self.backing_unreadable {
                if let Some(path) = store.quarantine(self.coord)? {
                    warn!("Moved unreadable chunk {} to {}", self.coord, path.display());
                }
                self.backing_unreadable = false;
            }
            store.write(self.coord, &self.pixels, &self.protection.encode())?;
        }
        self.pixels_dirty = false;
        Ok(true)
    }

    /// Final save before the chunk is dropped.
    ///
    /// Empty chunks delete their backing file even if nothing changed, so
    /// the store only holds chunks with content. A file that failed to load
    /// is never deleted. Callers should keep the
    /// chunk if this fails.
    pub fn release(&mut self, store: &ChunkStore) -> StoreResult<bool> {
        if self.is_empty() {
            if self.backing_unreadable {
                return Ok(false);
            }
            return store.remove(self.coord);
        }
        self.save(store)
    }
}
