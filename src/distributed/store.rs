//! Key-value rendezvous store used before any communicator exists.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

use crate::utils::error::{Result, XcclError};

/// Atomic `set` / blocking `get` store shared by every participant.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Blocks until `key` has a value.
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Store backed by process memory, for ranks running as threads.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    published: Condvar,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Store for InMemoryStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(XcclError::Store("empty key".to_string()));
        }
        self.entries.lock().insert(key.to_string(), value.to_vec());
        self.published.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut entries = self.entries.lock();
        loop {
            if let Some(value) = entries.get(key) {
                return Ok(value.clone());
            }
            self.published.wait(&mut entries);
        }
    }
}
