//! ID types for players and the per-world ID allocator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a player inside one world.
///
/// IDs are small and reused: a freed ID is handed out again before any new
/// one, so clients can index players in compact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(u32);

impl PlayerId {
    /// Creates a player ID from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out the smallest currently unused [`PlayerId`], starting at 1.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    /// One past the highest ID ever handed out and not trimmed back
    next: u32,
    /// Released IDs below `next`
    free: BTreeSet<u32>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Creates an allocator with no IDs in use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    /// Returns the smallest free ID.
    pub fn acquire(&mut self) -> PlayerId {
        if let Some(id) = self.free.pop_first() {
            return PlayerId(id);
        }
        let id = self.next;
        self.next = self.next.saturating_add(1);
        PlayerId(id)
    }

    /// Returns `id` to the pool. Returns false if it was not in use.
    pub fn release(&mut self, id: PlayerId) -> bool {
        let raw = id.0;
        if raw == 0 || raw >= self.next || self.free.contains(&raw) {
            return false;
        }

        if raw + 1 == self.next {
            // Trim the tail so `next` stays as low as possible.
            self.next = raw;
            while let Some(&last) = self.free.last() {
                if last + 1 != self.next {
                    break;
                }
                self.free.remove(&last);
                self.next = last;
            }
        } else {
            self.free.insert(raw);
        }
        true
    }

    /// Number of IDs currently in use.
    #[must_use]
    pub fn in_use(&self) -> usize {
        (self.next - 1) as usize - self.free.len()
    }
}
