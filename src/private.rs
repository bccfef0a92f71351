//! Caller data attached to descriptors.

use rustix::fd::RawFd;

use crate::{Error, Result};

/// A sparse array indexed directly by descriptor value.
///
/// Grows to `max(fd) + 1` slots on demand and never shrinks. An empty slot means "no data",
/// which is the same thing as "never seen".
#[derive(Debug)]
pub(crate) struct PrivateIndex<T> {
    slots: Vec<Option<T>>,
}

impl<T> PrivateIndex<T> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Stores `value` for `fd`, or clears the slot if `value` is `None`.
    ///
    /// Clearing never grows the index.
    pub(crate) fn set(&mut self, fd: RawFd, value: Option<T>) -> Result<()> {
        let index = slot(fd);

        let value = match value {
            Some(value) => value,
            None => {
                self.clear(fd);
                return Ok(());
            }
        };

        if index >= self.slots.len() {
            let need = index
                .checked_add(1)
                .ok_or(Error::InvalidUse("descriptor out of range"))?;
            self.slots
                .try_reserve(need - self.slots.len())
                .map_err(|e| Error::from_reserve(e, "private data index"))?;
            self.slots.resize_with(need, || None);
        }

        self.slots[index] = Some(value);
        Ok(())
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&T> {
        self.slots.get(slot(fd)).and_then(Option::as_ref)
    }

    /// Empties the slot for `fd`, returning what it held.
    pub(crate) fn take(&mut self, fd: RawFd) -> Option<T> {
        self.slots.get_mut(slot(fd)).and_then(Option::take)
    }

    pub(crate) fn clear(&mut self, fd: RawFd) {
        drop(self.take(fd));
    }

    /// Number of slots currently allocated.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Negative descriptors are rejected before reaching the index; map them out of range anyway.
fn slot(fd: RawFd) -> usize {
    usize::try_from(fd).unwrap_or(usize::MAX)
}
