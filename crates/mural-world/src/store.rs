//! On-disk chunk persistence.
//!
//! Each chunk is one RGB PNG named `r.<cx>.<cy>.png` inside the world
//! directory. The protection grid, when non-empty, travels in a private
//! ancillary PNG chunk tagged `woPp`, so the files stay viewable in any
//! image tool.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use mural_common::{ChunkCoord, MagicBytes};
use thiserror::Error;

use crate::chunk::ChunkGeometry;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

/// Errors that can occur while reading or writing chunk files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a readable PNG
    #[error("PNG decode failed: {0}")]
    Decode(String),

    /// PNG encoder rejected the data
    #[error("PNG encode failed: {0}")]
    Encode(String),

    /// Image dimensions differ from the world's chunk size
    #[error("Chunk image is {width}x{height}, expected {expected}x{expected}")]
    SizeMismatch {
        /// Configured chunk size
        expected: u32,
        /// Width found
        width: u32,
        /// Height found
        height: u32,
    },

    /// Pixel buffer handed to `write` has the wrong length
    #[error("Pixel buffer is {actual} bytes, expected {expected}")]
    BufferLength {
        /// Bytes for one chunk
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// PNG colour layout other than 8-bit RGB/RGBA
    #[error("Unsupported chunk image format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Raw contents of one chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// RGB pixels, row-major
    pub pixels: Vec<u8>,
    /// Encoded protection block; empty if the file carried none
    pub protection: Vec<u8>,
}

/// Reads and writes chunk files for one world.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    /// World directory
    dir: PathBuf,
    /// Expected image geometry
    geometry: ChunkGeometry,
}

impl ChunkStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, geometry: ChunkGeometry) -> Self {
        Self {
            dir: dir.into(),
            geometry,
        }
    }

    /// World directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `coord`.
    #[must_use]
    pub fn chunk_path(&self, coord: ChunkCoord) -> PathBuf {
        self.dir.join(format!("r.{}.{}.png", coord.x, coord.y))
    }

    fn temp_path(&self, coord: ChunkCoord) -> PathBuf {
        self.dir.join(format!("r.{}.{}.png.tmp", coord.x, coord.y))
    }

    /// Whether a file exists for `coord`.
    #[must_use]
    pub fn exists(&self, coord: ChunkCoord) -> bool {
        self.chunk_path(coord).exists()
    }

    /// Reads the file for `coord`. Returns `None` if there is none.
    pub fn load(&self, coord: ChunkCoord) -> StoreResult<Option<StoredChunk>> {
        let bytes = match fs::read(self.chunk_path(coord)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let pixels = self.decode_pixels(&bytes)?;
        let protection = find_private_chunk(&bytes, MagicBytes::PROTECTION)?.unwrap_or_default();
        Ok(Some(StoredChunk { pixels, protection }))
    }

    fn decode_pixels(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(png::Transformations::EXPAND);
        let mut reader = decoder
            .read_info()
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader
            .next_frame(&mut buf)
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let size = self.geometry.size();
        if info.width != size || info.height != size {
            return Err(StoreError::SizeMismatch {
                expected: size,
                width: info.width,
                height: info.height,
            });
        }
        if info.bit_depth != png::BitDepth::Eight {
            return Err(StoreError::UnsupportedFormat(format!("{:?}", info.bit_depth)));
        }
        buf.truncate(info.buffer_size());

        match info.color_type {
            png::ColorType::Rgb => Ok(buf),
            png::ColorType::Rgba => Ok(buf
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect()),
            other => Err(StoreError::UnsupportedFormat(format!("{other:?}"))),
        }
    }

    /// Writes `coord` atomically (temp file, then rename).
    ///
    /// An empty `protection` block omits the private chunk.
    pub fn write(&self, coord: ChunkCoord, pixels: &[u8], protection: &[u8]) -> StoreResult<()> {
        if pixels.len() != self.geometry.buffer_len() {
            return Err(StoreError::BufferLength {
                expected: self.geometry.buffer_len(),
                actual: pixels.len(),
            });
        }

        let encoded = self.encode(pixels, protection)?;
        fs::create_dir_all(&self.dir)?;

        let temp_path = self.temp_path(coord);
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.chunk_path(coord))?;
        Ok(())
    }

    fn encode(&self, pixels: &[u8], protection: &[u8]) -> StoreResult<Vec<u8>> {
        let encode_err = |e: png::EncodingError| StoreError::Encode(e.to_string());
        let size = self.geometry.size();

        let mut out = Vec::with_capacity(pixels.len() / 4);
        let mut encoder = png::Encoder::new(&mut out, size, size);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);

        let mut writer = encoder.write_header().map_err(encode_err)?;
        if !protection.is_empty() {
            writer
                .write_chunk(png::chunk::ChunkType(MagicBytes::PROTECTION.0), protection)
                .map_err(encode_err)?;
        }
        writer.write_image_data(pixels).map_err(encode_err)?;
        writer.finish().map_err(encode_err)?;
        Ok(out)
    }

    /// Moves an unreadable file for `coord` aside as `r.<cx>.<cy>.png.corrupt`.
    ///
    /// Returns the new path, or `None` if there was no file.
    pub fn quarantine(&self, coord: ChunkCoord) -> StoreResult<Option<PathBuf>> {
        let target = self.dir.join(format!("r.{}.{}.png.corrupt", coord.x, coord.y));
        match fs::rename(self.chunk_path(coord), &target) {
            Ok(()) => Ok(Some(target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the file for `coord`. Returns whether one existed.
    pub fn remove(&self, coord: ChunkCoord) -> StoreResult<bool> {
        match fs::remove_file(self.chunk_path(coord)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Finds the data of the first PNG chunk tagged `tag`.
fn find_private_chunk(bytes: &[u8], tag: MagicBytes) -> StoreResult<Option<Vec<u8>>> {
    let truncated = || StoreError::Decode("PNG chunk stream truncated".to_string());

    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err(StoreError::Decode("missing PNG signature".to_string()));
    }

    let mut pos = PNG_SIGNATURE.len();
    while pos < bytes.len() {
        let header = bytes.get(pos..pos + 8).ok_or_else(truncated)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];
        let data_start = pos + 8;
        let data = bytes
            .get(data_start..data_start + len)
            .ok_or_else(truncated)?;

        if kind == tag.0 {
            return Ok(Some(data.to_vec()));
        }
        if kind == MagicBytes::PNG_END.0 {
            break;
        }
        // data + CRC
        pos = data_start + len + 4;
    }
    Ok(None)
}
