// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Fixed-capacity value arena.
//!
//! Buffered values live in a slab of slots with an intrusive free list.
//! Slots are addressed by [`ValueRef`] index handles, never by pointer, and
//! each occupied slot carries the chain link to the next (newer) value of
//! the same item.
//!
//! The arena has a hard capacity fixed at construction. `alloc` failing
//! with [`CacheError::ArenaExhausted`] is the cache's backpressure signal:
//! the committing writer releases the cache lock, sleeps, and retries the
//! same value once syncers have drained space.

use silo_core::error::CacheError;
use silo_core::types::BufferedValue;

// =============================================================================
// Value Reference
// =============================================================================

/// An index handle to an occupied arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef(u32);

impl ValueRef {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

// =============================================================================
// Slots
// =============================================================================

#[derive(Debug)]
enum Slot {
    Free { next_free: Option<u32> },
    Used { value: BufferedValue, next: Option<ValueRef> },
}

// =============================================================================
// Value Arena
// =============================================================================

/// A fixed-capacity slab of buffered values with a free list.
#[derive(Debug)]
pub struct ValueArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
    capacity: usize,
}

impl ValueArena {
    /// Creates an arena with the given slot capacity.
    ///
    /// Slot storage grows on demand up to the capacity; freed slots are
    /// reused before new ones are claimed.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(4096)),
            free_head: None,
            len: 0,
            capacity,
        }
    }

    /// Allocates a slot for `value`.
    ///
    /// # Returns
    ///
    /// - `Ok(ValueRef)` with the handle of the new slot
    /// - `Err(CacheError::ArenaExhausted)` if the arena is at capacity
    pub fn alloc(&mut self, value: BufferedValue) -> Result<ValueRef, CacheError> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            self.free_head = match slot {
                Slot::Free { next_free } => *next_free,
                Slot::Used { .. } => return Err(CacheError::InvalidHandle { index }),
            };
            *slot = Slot::Used { value, next: None };
            self.len += 1;
            return Ok(ValueRef(index));
        }

        if self.slots.len() >= self.capacity {
            return Err(CacheError::arena_exhausted(self.capacity));
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Used { value, next: None });
        self.len += 1;
        Ok(ValueRef(index))
    }

    /// Frees a slot and returns its value.
    ///
    /// Returns `None` if the handle does not address an occupied slot.
    pub fn free(&mut self, handle: ValueRef) -> Option<BufferedValue> {
        let slot = self.slots.get_mut(handle.0 as usize)?;
        if matches!(slot, Slot::Free { .. }) {
            return None;
        }

        let freed = std::mem::replace(
            slot,
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(handle.0);
        self.len -= 1;

        match freed {
            Slot::Used { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Returns the value stored in a slot.
    pub fn value(&self, handle: ValueRef) -> Option<&BufferedValue> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Used { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Returns the chain link of a slot.
    pub fn next_of(&self, handle: ValueRef) -> Option<ValueRef> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Used { next, .. }) => *next,
            _ => None,
        }
    }

    /// Sets the chain link of a slot.
    ///
    /// Returns `false` if the handle does not address an occupied slot.
    pub fn set_next(&mut self, handle: ValueRef, next: Option<ValueRef>) -> bool {
        match self.slots.get_mut(handle.0 as usize) {
            Some(Slot::Used { next: link, .. }) => {
                *link = next;
                true
            }
            _ => false,
        }
    }

    /// Returns the number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slots are occupied.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the slot capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if the arena is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }
}

// =============================================================================
// Tests
// =============================================================================
