//! Shared header store attached to outgoing key requests.
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe mapping of header name to value.
///
/// Names compare ignoring ASCII case, as HTTP header names do: setting
/// `x-token` replaces `X-Token`, and the spelling of the latest `set` is what
/// [`snapshot`](Self::snapshot) reports.
///
/// Clones share the same underlying map. Every operation takes the lock for a
/// single map operation only; `snapshot` copies the map and releases the lock
/// before returning, so callers never hold it across a network call.
#[derive(Debug, Clone, Default)]
pub struct RequestPropertyStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl RequestPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value under the same name in any
    /// letter case.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.write().insert(
            key(&name),
            Entry {
                name,
                value: value.into(),
            },
        );
    }

    /// Set several headers at once. A concurrent snapshot sees all of them or
    /// none of them.
    pub fn extend<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: Vec<(String, Entry)> = entries
            .into_iter()
            .map(|(name, value)| {
                let name = name.into();
                (
                    key(&name),
                    Entry {
                        name,
                        value: value.into(),
                    },
                )
            })
            .collect();
        self.write().extend(entries);
    }

    /// Remove a header, ignoring case. Absent names are ignored.
    pub fn remove(&self, name: &str) {
        self.write().remove(&key(name));
    }

    /// Remove every header.
    pub fn clear_all(&self) {
        self.write().clear();
    }

    /// Value registered under `name`, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(&key(name)).map(|entry| entry.value.clone())
    }

    /// Copy of the current headers, one entry per case-insensitive name.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.read()
            .values()
            .map(|entry| (entry.name.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Entries are plain strings, so a writer that panicked cannot have left a
    // half-written value behind; recover the guard instead of propagating.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
