// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Mutual exclusion keyed by arbitrary strings.
//!
//! The coarse map lock is only held while looking up or inserting the per-key
//! lock. The per-key lock is an async mutex so that its owner can await
//! network I/O while holding it. Entries are reference counted and dropped
//! from the map as soon as nobody holds or waits on them.
//!
//! Re-entering a key from the task that already holds it deadlocks.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static CHART_LOCKS: LazyLock<Arc<KeyLock>> = LazyLock::new(|| Arc::new(KeyLock::new()));
static INDEX_LOCKS: LazyLock<Arc<KeyLock>> = LazyLock::new(|| Arc::new(KeyLock::new()));

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

/// A registry of per-key exclusive locks.
#[derive(Default)]
pub struct KeyLock {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Exclusive ownership of one key. Dropping it releases the key.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard<'a> {
    // Field order matters: the mutex is released before the slot is unregistered.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

struct Registration<'a> {
    owner: &'a KeyLock,
    key: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.owner.unregister(&self.key);
    }
}

impl KeyLock {
    /// Create an empty, isolated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process wide registry used for chart fetches, keyed by cache path.
    pub fn global_chart_locks() -> Arc<Self> {
        CHART_LOCKS.clone()
    }

    /// Process wide registry used for index and tag fetches, keyed by repository.
    pub fn global_index_locks() -> Arc<Self> {
        INDEX_LOCKS.clone()
    }

    /// Wait until `key` is exclusively owned by the caller.
    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard<'_> {
        let key = key.into();
        let lock = self.register(&key);
        // Registered before awaiting, so a cancelled waiter still unregisters.
        let registration = Registration { owner: self, key };
        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(AsyncMutex::new(())),
            users: 0,
        });
        slot.users += 1;
        slot.lock.clone()
    }

    fn unregister(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(key);
            }
        }
    }
}
