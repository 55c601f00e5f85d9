use std::collections::HashMap;

use crate::store::{DayBucket, DictionarySnapshot};

use super::StorageError;

/// Durable home of everything the store does not keep in memory.
/// Missing records load as empty: no sales, no users, an empty dictionary
/// and day 0.
pub trait Persistence: Send + Sync {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError>;
    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError>;
    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError>;
    fn load_users(&self) -> Result<HashMap<String, String>, StorageError>;
    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError>;
    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError>;
    fn save_current_day(&self, day: i32) -> Result<(), StorageError>;
    fn load_current_day(&self) -> Result<i32, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

impl<P: Persistence + ?Sized> Persistence for std::sync::Arc<P> {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError> {
        (**self).save_day(day, bucket)
    }

    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError> {
        (**self).load_day(day)
    }

    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError> {
        (**self).save_users(users)
    }

    fn load_users(&self) -> Result<HashMap<String, String>, StorageError> {
        (**self).load_users()
    }

    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError> {
        (**self).save_dictionary(snapshot)
    }

    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError> {
        (**self).load_dictionary()
    }

    fn save_current_day(&self, day: i32) -> Result<(), StorageError> {
        (**self).save_current_day(day)
    }

    fn load_current_day(&self) -> Result<i32, StorageError> {
        (**self).load_current_day()
    }

    fn flush(&self) -> Result<(), StorageError> {
        (**self).flush()
    }
}
