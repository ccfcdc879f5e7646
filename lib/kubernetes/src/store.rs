use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::resource::{DynamicObject, ObjectKey};

/// The last known state of every watched object, indexed by [`ObjectKey`].
///
/// Cloning is cheap, all clones share the same cache. Only the controller loop
/// writes to it, everyone else should treat it as read only.
#[derive(Clone, Default)]
pub struct Store {
    cache: Arc<RwLock<HashMap<ObjectKey, Arc<DynamicObject>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.cache.read().get(key).cloned()
    }

    #[inline]
    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.cache.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Insert or overwrite an object, returning what was cached before.
    pub fn update(&self, obj: Arc<DynamicObject>) -> Option<Arc<DynamicObject>> {
        self.cache.write().insert(obj.key(), obj)
    }

    /// Remove an object, returning its last known state.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.cache.write().remove(key)
    }
}
