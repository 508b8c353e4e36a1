//! # Mural Common
//!
//! Common types, utilities, and shared abstractions for the Mural canvas.
//!
//! This crate provides foundational types used across all Mural subsystems:
//! - Coordinate types (chunk, protection cell) and border math
//! - RGB colour
//! - Player IDs and the smallest-free ID allocator
//! - Schema versions and file tags
//! - Common error types

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod color;
pub mod coords;
pub mod error;
pub mod ids;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::color::*;
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::ids::*;
    pub use crate::version::*;
}

pub use prelude::*;
