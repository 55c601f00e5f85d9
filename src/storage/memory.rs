use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::store::{DayBucket, DictionarySnapshot};

use super::{Persistence, StorageError};

/// In-memory persistence for tests, with write failure injection and a
/// counter of day loads that reached "disk".
#[derive(Default)]
pub(crate) struct MemoryStorage {
    days: Mutex<HashMap<i32, DayBucket>>,
    users: Mutex<HashMap<String, String>>,
    dictionary: Mutex<DictionarySnapshot>,
    current_day: Mutex<i32>,
    fail_writes: AtomicBool,
    day_loads: AtomicUsize,
}

impl MemoryStorage {
    pub(crate) fn with_day(self, day: i32, bucket: DayBucket) -> Self {
        self.days.lock().expect("memory days lock poisoned").insert(day, bucket);
        self
    }

    pub(crate) fn with_current_day(self, day: i32) -> Self {
        *self
            .current_day
            .lock()
            .expect("memory current day lock poisoned") = day;
        self
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn day_loads(&self) -> usize {
        self.day_loads.load(Ordering::SeqCst)
    }

    pub(crate) fn stored_day(&self, day: i32) -> Option<DayBucket> {
        self.days
            .lock()
            .expect("memory days lock poisoned")
            .get(&day)
            .cloned()
    }

    pub(crate) fn stored_current_day(&self) -> i32 {
        *self
            .current_day
            .lock()
            .expect("memory current day lock poisoned")
    }

    pub(crate) fn stored_users(&self) -> HashMap<String, String> {
        self.users.lock().expect("memory users lock poisoned").clone()
    }

    pub(crate) fn stored_dictionary(&self) -> DictionarySnapshot {
        self.dictionary
            .lock()
            .expect("memory dictionary lock poisoned")
            .clone()
    }

    fn check_writable(&self, record: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: PathBuf::from(format!("memory://{record}")),
                source: io::Error::new(io::ErrorKind::Other, "injected write failure"),
            });
        }
        Ok(())
    }
}

impl Persistence for MemoryStorage {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError> {
        self.check_writable(&format!("day-{day}"))?;
        self.days
            .lock()
            .expect("memory days lock poisoned")
            .insert(day, bucket.clone());
        Ok(())
    }

    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError> {
        self.day_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.stored_day(day).unwrap_or_default())
    }

    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError> {
        self.check_writable("users")?;
        *self.users.lock().expect("memory users lock poisoned") = users.clone();
        Ok(())
    }

    fn load_users(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.stored_users())
    }

    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError> {
        self.check_writable("dictionary")?;
        *self
            .dictionary
            .lock()
            .expect("memory dictionary lock poisoned") = snapshot.clone();
        Ok(())
    }

    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError> {
        Ok(self.stored_dictionary())
    }

    fn save_current_day(&self, day: i32) -> Result<(), StorageError> {
        self.check_writable("current_day")?;
        *self
            .current_day
            .lock()
            .expect("memory current day lock poisoned") = day;
        Ok(())
    }

    fn load_current_day(&self) -> Result<i32, StorageError> {
        Ok(self.stored_current_day())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
