//! Interface to connected players.
//!
//! Players live in the transport layer; worlds only hold shared handles to
//! them while they are joined.

use std::sync::Arc;

use mural_common::PlayerId;

/// A connected player as seen by a world.
pub trait Player: Send + Sync {
    /// Id assigned by [`crate::World::admit_player`].
    fn id(&self) -> PlayerId;

    /// Current position in world pixels.
    fn position(&self) -> (i32, i32);

    /// Whether the player may paint and edit the world.
    fn can_modify_world(&self) -> bool;

    /// Queues a binary message for delivery.
    fn send(&self, message: &Arc<[u8]>);
}

/// What a player needs to know on joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTicket {
    /// Allocated player id
    pub id: PlayerId,
    /// Spawn position in world pixels
    pub spawn: (i32, i32),
    /// Pixels per second the player may paint
    pub paint_rate: u32,
    /// False when the world is password protected
    pub can_modify: bool,
}
