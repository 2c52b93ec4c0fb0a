//! Per-record serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::CoordinatorError;
use crate::record::RecordId;

/// One mutex per record with work in flight. Different records never
/// contend; entries are dropped once nobody holds or waits for them.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<RecordId, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the record's lock.
    pub fn with<T>(
        &self,
        id: RecordId,
        f: impl FnOnce() -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        let lock = {
            let mut map = self.locks.lock().map_err(|_| CoordinatorError::LockPoisoned)?;
            Arc::clone(map.entry(id).or_default())
        };

        let result = {
            let _guard = lock.lock().map_err(|_| CoordinatorError::LockPoisoned)?;
            f()
        };

        drop(lock);
        self.prune(id);
        result
    }

    fn prune(&self, id: RecordId) {
        if let Ok(mut map) = self.locks.lock() {
            // Clones are only taken under the map lock, so a count of one
            // means no holder and no waiter.
            if map.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
                map.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
