use std::collections::HashMap;
use std::path::Path;

use crate::store::{DayBucket, DictionarySnapshot};

use super::format::{
    decode_day, decode_day_number, decode_dictionary, decode_users, encode_day,
    encode_day_number, encode_dictionary, encode_users,
};
use super::{Persistence, SledMode, StorageError};

const KEYSPACE_VERSION: &str = "v1";
const USERS_KEY: &[u8] = b"v1:users";
const DICTIONARY_KEY: &[u8] = b"v1:dictionary";
const CURRENT_DAY_KEY: &[u8] = b"v1:current_day";

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(mode.into());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(key, value).map_err(StorageError::Sled)?;
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn get(&self, key: &[u8]) -> Result<Option<sled::IVec>, StorageError> {
        self.db.get(key).map_err(StorageError::Sled)
    }
}

fn day_key(day: i32) -> String {
    format!("{KEYSPACE_VERSION}:day:{day}")
}

impl Persistence for SledStorage {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError> {
        self.put(day_key(day).as_bytes(), encode_day(bucket))
    }

    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError> {
        match self.get(day_key(day).as_bytes())? {
            Some(raw) => decode_day(day, raw.as_ref()),
            None => Ok(DayBucket::new()),
        }
    }

    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError> {
        self.put(USERS_KEY, encode_users(users)?)
    }

    fn load_users(&self) -> Result<HashMap<String, String>, StorageError> {
        match self.get(USERS_KEY)? {
            Some(raw) => decode_users(raw.as_ref()),
            None => Ok(HashMap::new()),
        }
    }

    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError> {
        self.put(DICTIONARY_KEY, encode_dictionary(snapshot)?)
    }

    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError> {
        match self.get(DICTIONARY_KEY)? {
            Some(raw) => decode_dictionary(raw.as_ref()),
            None => Ok(DictionarySnapshot::default()),
        }
    }

    fn save_current_day(&self, day: i32) -> Result<(), StorageError> {
        self.put(CURRENT_DAY_KEY, encode_day_number(day))
    }

    fn load_current_day(&self) -> Result<i32, StorageError> {
        match self.get(CURRENT_DAY_KEY)? {
            Some(raw) => decode_day_number(raw.as_ref()),
            None => Ok(0),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }
}
