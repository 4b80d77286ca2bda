use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::models::Reading;

/// Last reading per device, overwritten every tick. Volatile.
#[derive(Debug, Default)]
pub struct LatestCache {
    readings: Mutex<HashMap<String, Reading>>,
}

impl LatestCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written Reading
    // behind (insert is a single move), so a poisoned map is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Reading>> {
        self.readings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, reading: Reading) {
        self.lock().insert(reading.device_id.clone(), reading);
    }

    pub fn get(&self, device_id: &str) -> Option<Reading> {
        self.lock().get(device_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        let mut all: Vec<Reading> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
