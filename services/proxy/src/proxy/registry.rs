//! Lookup of relay connections by either of their descriptors.
//!
//! Entries live in one arena keyed by [`ConnectionId`]. Two side maps take
//! the client fd and the backend fd to that ID. Insert and remove are the
//! only mutations and always update all three maps together.

use std::collections::HashMap;
use std::os::fd::RawFd;

use super::relay::{ConnectionId, Leg};

#[derive(Debug)]
struct Entry<T> {
    client_fd: RawFd,
    backend_fd: RawFd,
    value: T,
}

/// Connection registry, generic over the stored value.
#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<ConnectionId, Entry<T>>,
    by_client: HashMap<RawFd, ConnectionId>,
    by_backend: HashMap<RawFd, ConnectionId>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_client: HashMap::new(),
            by_backend: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its ID and both descriptors.
    ///
    /// Returns the value back if the ID or either descriptor is already
    /// taken; nothing is modified in that case.
    pub fn insert(
        &mut self,
        id: ConnectionId,
        client_fd: RawFd,
        backend_fd: RawFd,
        value: T,
    ) -> Result<(), T> {
        if self.entries.contains_key(&id)
            || self.by_client.contains_key(&client_fd)
            || self.by_backend.contains_key(&backend_fd)
        {
            return Err(value);
        }
        self.by_client.insert(client_fd, id);
        self.by_backend.insert(backend_fd, id);
        self.entries.insert(
            id,
            Entry {
                client_fd,
                backend_fd,
                value,
            },
        );
        Ok(())
    }

    /// Find which connection owns `fd`, and which of its legs it is.
    pub fn resolve(&self, fd: RawFd) -> Option<(ConnectionId, Leg)> {
        if let Some(id) = self.by_client.get(&fd) {
            return Some((*id, Leg::Client));
        }
        self.by_backend.get(&fd).map(|id| (*id, Leg::Backend))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.entries.get(&id).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.entries.get_mut(&id).map(|e| &mut e.value)
    }

    /// Remove a connection and both of its descriptor keys.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let entry = self.entries.remove(&id)?;
        self.by_client.remove(&entry.client_fd);
        self.by_backend.remove(&entry.backend_fd);
        Some(entry.value)
    }

    /// IDs of all entries matching `pred`, in ascending order.
    pub fn select(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(&e.value))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values().map(|e| &e.value)
    }
}
