// src/cache/memory.rs
//
// In-process cache provider: a map behind a read/write lock. Never evicts.

use super::CacheProvider;
use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CacheProvider for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, data: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_string(), data);
        Ok(())
    }

    fn shutdown(&self) {}
}
