//! The ordered set of watched descriptors.

// Each backend uses a different subset of the accessors.
#![allow(dead_code)]

use std::ops::Index;

use rustix::fd::RawFd;

use crate::{Error, Result};

/// A record stored in a [`DescriptorTable`].
pub(crate) trait Entry {
    /// The descriptor this record watches.
    fn fd(&self) -> RawFd;
}

/// Watched-descriptor records in insertion order.
///
/// Removal keeps the relative order of the remaining records, so a backend may pin records at
/// fixed leading positions (the `poll` backend keeps the wake channel at index 0).
#[derive(Debug)]
pub(crate) struct DescriptorTable<E> {
    entries: Vec<E>,
}

impl<E: Entry> DescriptorTable<E> {
    /// Creates a table with room for `capacity` records.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve(capacity)
            .map_err(|e| Error::from_reserve(e, "descriptor table"))?;
        Ok(Self { entries })
    }

    /// Appends a record without checking for duplicates.
    pub(crate) fn insert(&mut self, entry: E) -> Result<()> {
        self.entries
            .try_reserve(1)
            .map_err(|e| Error::from_reserve(e, "descriptor table"))?;
        self.entries.push(entry);
        Ok(())
    }

    /// Removes the first record watching `fd`.
    pub(crate) fn remove(&mut self, fd: RawFd) -> Option<E> {
        let index = self.position(fd)?;
        Some(self.entries.remove(index))
    }

    /// The first record watching `fd`.
    pub(crate) fn find(&self, fd: RawFd) -> Option<&E> {
        self.entries.iter().find(|entry| entry.fd() == fd)
    }

    /// The first record watching `fd`, mutably.
    pub(crate) fn find_mut(&mut self, fd: RawFd) -> Option<&mut E> {
        self.entries.iter_mut().find(|entry| entry.fd() == fd)
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.position(fd).is_some()
    }

    /// Drops every record past the first `keep`, returning them.
    pub(crate) fn truncate(&mut self, keep: usize) -> impl Iterator<Item = E> + '_ {
        let keep = keep.min(self.entries.len());
        self.entries.drain(keep..)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.entries.iter()
    }

    /// The records as one contiguous slice, for handing to the OS.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [E] {
        &mut self.entries
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.entries.iter().position(|entry| entry.fd() == fd)
    }
}

impl<E> Index<usize> for DescriptorTable<E> {
    type Output = E;

    fn index(&self, index: usize) -> &E {
        &self.entries[index]
    }
}
