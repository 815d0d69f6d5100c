//! In-process check exclusion.
//!
//! A fixed arena with one slot per worker. A worker claims a trigger by
//! writing its id into its own slot, which only succeeds if no other slot
//! holds the same id. The slot is cleared when the guard drops.

use std::sync::Mutex;

use crate::trigger::TriggerId;

/// Slot arena of trigger ids currently being checked.
#[derive(Debug)]
pub struct LockArena {
    slots: Mutex<Vec<Option<TriggerId>>>,
}

impl LockArena {
    /// Creates an arena with `size` slots.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; size.max(1)]),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().map_or(0, |slots| slots.len())
    }

    /// Claims `id` in `slot`. Returns `None` if another slot holds `id`,
    /// if `slot` is already in use, or if `slot` is out of range.
    #[must_use]
    pub fn try_acquire(&self, slot: usize, id: TriggerId) -> Option<SlotGuard<'_>> {
        let mut slots = self.slots.lock().ok()?;
        if slots.iter().any(|s| *s == Some(id)) {
            return None;
        }
        let cell = slots.get_mut(slot)?;
        if cell.is_some() {
            return None;
        }
        *cell = Some(id);
        Some(SlotGuard { arena: self, slot })
    }

    /// Returns true if some slot currently holds `id`.
    #[must_use]
    pub fn is_held(&self, id: TriggerId) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.iter().any(|s| *s == Some(id)))
            .unwrap_or(false)
    }

    fn release(&self, slot: usize) {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cell) = slots.get_mut(slot) {
            *cell = None;
        }
    }
}

/// Clears its slot on drop.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    arena: &'a LockArena,
    slot: usize,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.arena.release(self.slot);
    }
}
