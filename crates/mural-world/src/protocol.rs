//! Binary messages broadcast to players.
//!
//! All integers are little-endian. A world update is laid out as:
//!
//! ```text
//! u8   opcode = WORLD_UPDATE
//! u8   n      { i32 id, i32 x, i32 y } * n                    // moved players
//! u16  m      { i32 placer, i32 x, i32 y, u8 r, u8 g, u8 b } * m
//! u8   k      { i32 id } * k                                  // players left
//! ```

use mural_common::{PlayerId, Rgb};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opcode of a batched world update.
pub const WORLD_UPDATE: u8 = 8;

/// Opcode of a protection cell change.
pub const PROTECTION_UPDATE: u8 = 10;

/// Largest player-update count per message.
pub const MAX_PLAYER_UPDATES: usize = u8::MAX as usize;

/// Largest pixel-update count per message.
pub const MAX_PIXEL_UPDATES: usize = u16::MAX as usize;

/// Largest player-left count per message.
pub const MAX_PLAYER_LEFT_UPDATES: usize = u8::MAX as usize;

const PLAYER_ENTRY_LEN: usize = 12;
const PIXEL_ENTRY_LEN: usize = 15;
const LEFT_ENTRY_LEN: usize = 4;

/// Malformed or oversized message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message ended early
    #[error("Message truncated")]
    Truncated,
    /// First byte is not the expected opcode
    #[error("Unexpected opcode {0}")]
    UnexpectedOpcode(u8),
    /// A section holds more entries than its count field can express
    #[error("Too many {section}: {count} > {max}")]
    TooMany {
        /// Section name
        section: &'static str,
        /// Entries supplied
        count: usize,
        /// Field maximum
        max: usize,
    },
    /// Bytes left after the last section
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Per-message caps for each update section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushLimits {
    /// Moved players per flush
    pub player_updates: usize,
    /// Pixels per flush
    pub pixel_updates: usize,
    /// Departed players per flush
    pub player_left: usize,
}

impl Default for FlushLimits {
    fn default() -> Self {
        Self {
            player_updates: MAX_PLAYER_UPDATES,
            pixel_updates: MAX_PIXEL_UPDATES,
            player_left: MAX_PLAYER_LEFT_UPDATES,
        }
    }
}

impl FlushLimits {
    /// Clamps every cap into `1..=field maximum`.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            player_updates: self.player_updates.clamp(1, MAX_PLAYER_UPDATES),
            pixel_updates: self.pixel_updates.clamp(1, MAX_PIXEL_UPDATES),
            player_left: self.player_left.clamp(1, MAX_PLAYER_LEFT_UPDATES),
        }
    }
}

/// A player's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerPosition {
    /// Player
    pub id: PlayerId,
    /// World x in pixels
    pub x: i32,
    /// World y in pixels
    pub y: i32,
}

/// One painted pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelUpdate {
    /// Player who painted it
    pub placer: PlayerId,
    /// World x in pixels
    pub x: i32,
    /// World y in pixels
    pub y: i32,
    /// New colour
    pub color: Rgb,
}

/// Contents of one `WORLD_UPDATE` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldUpdate {
    /// Players whose position changed
    pub players: Vec<PlayerPosition>,
    /// Painted pixels in paint order
    pub pixels: Vec<PixelUpdate>,
    /// Players who left
    pub players_left: Vec<PlayerId>,
}

impl WorldUpdate {
    /// True if every section is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.pixels.is_empty() && self.players_left.is_empty()
    }

    /// Serializes the update.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        check_count("player updates", self.players.len(), MAX_PLAYER_UPDATES)?;
        check_count("pixel updates", self.pixels.len(), MAX_PIXEL_UPDATES)?;
        check_count("players left", self.players_left.len(), MAX_PLAYER_LEFT_UPDATES)?;

        let mut out = Vec::with_capacity(
            5 + self.players.len() * PLAYER_ENTRY_LEN
                + self.pixels.len() * PIXEL_ENTRY_LEN
                + self.players_left.len() * LEFT_ENTRY_LEN,
        );
        out.push(WORLD_UPDATE);

        out.push(self.players.len() as u8);
        for p in &self.players {
            out.extend_from_slice(&p.id.raw().to_le_bytes());
            out.extend_from_slice(&p.x.to_le_bytes());
            out.extend_from_slice(&p.y.to_le_bytes());
        }

        out.extend_from_slice(&(self.pixels.len() as u16).to_le_bytes());
        for px in &self.pixels {
            out.extend_from_slice(&px.placer.raw().to_le_bytes());
            out.extend_from_slice(&px.x.to_le_bytes());
            out.extend_from_slice(&px.y.to_le_bytes());
            out.extend_from_slice(&px.color.to_bytes());
        }

        out.push(self.players_left.len() as u8);
        for id in &self.players_left {
            out.extend_from_slice(&id.raw().to_le_bytes());
        }
        Ok(out)
    }

    /// Parses a complete `WORLD_UPDATE` message.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut r = Reader::new(data);
        let opcode = r.u8()?;
        if opcode != WORLD_UPDATE {
            return Err(ProtocolError::UnexpectedOpcode(opcode));
        }

        let n = r.u8()? as usize;
        let mut players = Vec::with_capacity(n);
        for _ in 0..n {
            players.push(PlayerPosition {
                id: PlayerId::new(r.u32()?),
                x: r.i32()?,
                y: r.i32()?,
            });
        }

        let m = r.u16()? as usize;
        let mut pixels = Vec::with_capacity(m);
        for _ in 0..m {
            pixels.push(PixelUpdate {
                placer: PlayerId::new(r.u32()?),
                x: r.i32()?,
                y: r.i32()?,
                color: Rgb::new(r.u8()?, r.u8()?, r.u8()?),
            });
        }

        let k = r.u8()? as usize;
        let mut players_left = Vec::with_capacity(k);
        for _ in 0..k {
            players_left.push(PlayerId::new(r.u32()?));
        }

        r.finish()?;
        Ok(Self {
            players,
            pixels,
            players_left,
        })
    }
}

/// Contents of one `PROTECTION_UPDATE` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionUpdate {
    /// Protection cell x
    pub cell_x: i32,
    /// Protection cell y
    pub cell_y: i32,
    /// New group id
    pub gid: u32,
}

impl ProtectionUpdate {
    /// Encoded message length.
    pub const LEN: usize = 13;

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = PROTECTION_UPDATE;
        out[1..5].copy_from_slice(&self.cell_x.to_le_bytes());
        out[5..9].copy_from_slice(&self.cell_y.to_le_bytes());
        out[9..13].copy_from_slice(&self.gid.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut r = Reader::new(data);
        let opcode = r.u8()?;
        if opcode != PROTECTION_UPDATE {
            return Err(ProtocolError::UnexpectedOpcode(opcode));
        }
        let update = Self {
            cell_x: r.i32()?,
            cell_y: r.i32()?,
            gid: r.u32()?,
        };
        r.finish()?;
        Ok(update)
    }
}

fn check_count(section: &'static str, count: usize, max: usize) -> ProtocolResult<()> {
    if count > max {
        return Err(ProtocolError::TooMany {
            section,
            count,
            max,
        });
    }
    Ok(())
}

/// Little-endian cursor over a message.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or(ProtocolError::Truncated)?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> ProtocolResult<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> ProtocolResult<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> ProtocolResult<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn finish(&self) -> ProtocolResult<()> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorldUpdate {
        WorldUpdate {
            players: vec![PlayerPosition {
                id: PlayerId::new(1),
                x: -5,
                y: 7,
            }],
            pixels: vec![PixelUpdate {
                placer: PlayerId::new(2),
                x: 100,
                y: -200,
                color: Rgb::new(1, 2, 3),
            }],
            players_left: vec![PlayerId::new(9)],
        }
    }

    #[test]
    fn test_world_update_layout() {
        let bytes = sample().encode().expect("encode");
        assert_eq!(bytes[0], WORLD_UPDATE);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..6], &1u32.to_le_bytes());
        assert_eq!(&bytes[6..10], &(-5i32).to_le_bytes());
        assert_eq!(&bytes[14..16], &1u16.to_le_bytes());
        assert_eq!(&bytes[28..31], &[1, 2, 3]);
        assert_eq!(bytes[31], 1);
        assert_eq!(&bytes[32..36], &9u32.to_le_bytes());
        assert_eq!(bytes.len(), 36);
    }

    #[test]
    fn test_world_update_decode_matches() {
        let update = sample();
        let bytes = update.encode().expect("encode");
        assert_eq!(WorldUpdate::decode(&bytes), Ok(update));
    }

    #[test]
    fn test_empty_update_is_five_bytes() {
        let bytes = WorldUpdate::default().encode().expect("encode");
        assert_eq!(bytes, vec![WORLD_UPDATE, 0, 0, 0, 0]);
    }

    #[test]
    fn test_oversized_section_rejected() {
        let update = WorldUpdate {
            players_left: vec![PlayerId::new(1); 256],
            ..WorldUpdate::default()
        };
        assert_eq!(
            update.encode(),
            Err(ProtocolError::TooMany {
                section: "players left",
                count: 256,
                max: 255
            })
        );
    }

    #[test]
    fn test_decode_errors() {
        let bytes = sample().encode().expect("encode");
        assert_eq!(
            WorldUpdate::decode(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Truncated)
        );
        assert_eq!(
            WorldUpdate::decode(&[PROTECTION_UPDATE]),
            Err(ProtocolError::UnexpectedOpcode(PROTECTION_UPDATE))
        );
        let mut long = bytes;
        long.push(0);
        assert_eq!(WorldUpdate::decode(&long), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn test_protection_update_layout() {
        let update = ProtectionUpdate {
            cell_x: -1,
            cell_y: 2,
            gid: 1,
        };
        let bytes = update.encode();
        assert_eq!(bytes[0], PROTECTION_UPDATE);
        assert_eq!(&bytes[1..5], &[0xFF; 4]);
        assert_eq!(ProtectionUpdate::decode(&bytes), Ok(update));
    }

    #[test]
    fn test_limits_clamped() {
        let limits = FlushLimits {
            player_updates: 0,
            pixel_updates: 1_000_000,
            player_left: 3,
        }
        .clamped();
        assert_eq!(limits.player_updates, 1);
        assert_eq!(limits.pixel_updates, MAX_PIXEL_UPDATES);
        assert_eq!(limits.player_left, 3);
    }
}
