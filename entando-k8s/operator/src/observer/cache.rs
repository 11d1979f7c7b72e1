use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use kube::ResourceExt;

use crate::util::lock;

/// Last accepted snapshot of every observed resource, keyed by UID.
/// Only used to detect duplicate and out of order events.
pub(crate) struct ObserverCache<K> {
    entries: Mutex<HashMap<String, K>>,
}

impl<K> Default for ObserverCache<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> ObserverCache<K>
where
    K: ResourceExt + Clone,
{
    /// resourceVersion of the cached snapshot for `uid`
    pub(crate) fn resource_version(&self, uid: &str) -> Option<String> {
        lock(&self.entries)
            .get(uid)
            .and_then(|resource| resource.resource_version())
    }

    #[cfg(test)]
    pub(crate) fn get(&self, uid: &str) -> Option<K> {
        lock(&self.entries).get(uid).cloned()
    }

    pub(crate) fn insert(&self, uid: String, resource: K) -> Option<K> {
        lock(&self.entries).insert(uid, resource)
    }

    pub(crate) fn remove(&self, uid: &str) -> Option<K> {
        lock(&self.entries).remove(uid)
    }

    /// Drop every entry whose UID is not in `uids`
    pub(crate) fn retain_only(&self, uids: &HashSet<String>) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|uid, _| uids.contains(uid));
        before - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}
