use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stored_at: DateTime<Utc>,
}

/// Keyed cache whose entries expire after a fixed duration. An entry past
/// its TTL is treated as absent. The clock is a parameter so expiry is
/// testable without sleeping.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let entries = self.entries();
        let entry = entries.get(key)?;
        if now.signed_duration_since(entry.stored_at) < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Returns the cached value without calling `fetch` when a fresh entry
    /// exists; otherwise awaits `fetch` (the lock is not held across the
    /// await) and stores the result before returning it. A failed fetch is
    /// never cached and propagates to the caller.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: K,
        now: DateTime<Utc>,
        fetch: F,
    ) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.get(&key, now) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.entries().insert(
            key,
            Entry {
                value: value.clone(),
                stored_at: now,
            },
        );
        Ok(value)
    }

    pub fn invalidate_all(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
