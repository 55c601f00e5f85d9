use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::store::{DayBucket, DictionarySnapshot};

use super::format::{
    decode_day, decode_day_number, decode_dictionary, decode_users, encode_day,
    encode_day_number, encode_dictionary, encode_users,
};
use super::{Persistence, StorageError};

const USERS_FILE: &str = "users.dat";
const DICTIONARY_FILE: &str = "dictionary.dat";
const CURRENT_DAY_FILE: &str = "current_day.dat";

/// One file per record under a data directory. Writes go to a temp file
/// that is renamed over the target, so readers see the old or the new
/// content and never a torn file.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|source| StorageError::CreateDataDir {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn day_path(&self, day: i32) -> PathBuf {
        self.dir.join(day_file_name(day))
    }

    fn write_atomically(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.dir.join(name);
        let temp = self.dir.join(format!(".{name}.tmp"));
        let io_error = |source| StorageError::Io {
            path: target.clone(),
            source,
        };

        let mut file = File::create(&temp).map_err(io_error)?;
        file.write_all(bytes).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);
        fs::rename(&temp, &target).map_err(io_error)
    }

    fn read_if_present(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

fn day_file_name(day: i32) -> String {
    format!("day-{day}.sales")
}

impl Persistence for FileStorage {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError> {
        self.write_atomically(&day_file_name(day), &encode_day(bucket))
    }

    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError> {
        match self.read_if_present(&day_file_name(day))? {
            Some(bytes) => decode_day(day, &bytes),
            None => Ok(DayBucket::new()),
        }
    }

    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError> {
        self.write_atomically(USERS_FILE, &encode_users(users)?)
    }

    fn load_users(&self) -> Result<HashMap<String, String>, StorageError> {
        match self.read_if_present(USERS_FILE)? {
            Some(bytes) => decode_users(&bytes),
            None => Ok(HashMap::new()),
        }
    }

    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError> {
        self.write_atomically(DICTIONARY_FILE, &encode_dictionary(snapshot)?)
    }

    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError> {
        match self.read_if_present(DICTIONARY_FILE)? {
            Some(bytes) => decode_dictionary(&bytes),
            None => Ok(DictionarySnapshot::default()),
        }
    }

    fn save_current_day(&self, day: i32) -> Result<(), StorageError> {
        self.write_atomically(CURRENT_DAY_FILE, &encode_day_number(day))
    }

    fn load_current_day(&self) -> Result<i32, StorageError> {
        match self.read_if_present(CURRENT_DAY_FILE)? {
            Some(bytes) => decode_day_number(&bytes),
            None => Ok(0),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
