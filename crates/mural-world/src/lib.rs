//! # Mural World
//!
//! Canvas storage and serving for Mural.
//!
//! This crate handles:
//! - Chunk pixels and per-cell protection, with its run-length codec
//! - Chunk persistence as PNG files
//! - Off-thread chunk rendering with request coalescing
//! - Batched delta updates to joined players
//! - World lifecycle and the world manager

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod chunk;
pub mod manager;
pub mod player;
pub mod props;
pub mod protection;
pub mod protocol;
pub mod render;
pub mod store;
pub mod timing;
pub mod world;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::chunk::*;
    pub use crate::manager::*;
    pub use crate::player::*;
    pub use crate::props::*;
    pub use crate::protection::{ProtectionError, ProtectionGrid, PROTECTED, UNPROTECTED};
    pub use crate::protocol::*;
    pub use crate::render::*;
    pub use crate::store::*;
    pub use crate::timing::*;
    pub use crate::world::*;
}

pub use prelude::*;
