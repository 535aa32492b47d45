//! Auth token pass-through cache
//!
//! The coordinator only relays token records between nodes; what a record
//! means is up to the session store that owns it.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub trait TokenCache: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<String>;

    /// Insert or overwrite
    fn put(&self, id: Uuid, record: String);

    /// Replace an existing record; false if `id` is not cached
    fn set(&self, id: Uuid, record: String) -> bool;

    fn evict(&self, id: &Uuid) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    tokens: Mutex<HashMap<Uuid, String>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TokenCache for MemoryTokenCache {
    fn get(&self, id: &Uuid) -> Option<String> {
        self.tokens.lock().ok()?.get(id).cloned()
    }

    fn put(&self, id: Uuid, record: String) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, record);
        }
    }

    fn set(&self, id: Uuid, record: String) -> bool {
        match self.tokens.lock() {
            Ok(mut tokens) => match tokens.get_mut(&id) {
                Some(existing) => {
                    *existing = record;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn evict(&self, id: &Uuid) -> bool {
        self.tokens
            .lock()
            .map(|mut t| t.remove(id).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_set() {
        let cache = MemoryTokenCache::new();
        let id = Uuid::new_v4();

        assert!(cache.get(&id).is_none());
        assert!(!cache.set(id, "v2".into()));

        cache.put(id, "v1".into());
        assert_eq!(cache.get(&id).as_deref(), Some("v1"));
        assert!(cache.set(id, "v2".into()));
        assert_eq!(cache.get(&id).as_deref(), Some("v2"));

        assert!(cache.evict(&id));
        assert!(cache.is_empty());
    }
}
