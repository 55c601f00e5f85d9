use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::store::{DayBucket, DictionarySnapshot};

use super::{EngineSelection, FileStorage, Persistence, SledStorage, StorageEngine, StorageError};

/// Configured persistence engine behind one [`Persistence`] implementation.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn Persistence>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let selection = EngineSelection::from_config(&app_config.storage)?;
        let data_path = selection.data_path.clone();

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": selection.engine.to_string(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
            })),
        );

        let backend: Box<dyn Persistence> = match selection.engine {
            StorageEngine::Files => Box::new(FileStorage::open(&data_path)?),
            StorageEngine::Sled => {
                logger.log(
                    LogLevel::Debug,
                    Some("storage::init"),
                    "Opening sled keyspace",
                    Some(json!({
                        "cache_capacity": selection.sled_cache_capacity,
                        "mode": app_config.storage.sled.mode,
                    })),
                );
                std::fs::create_dir_all(&data_path).map_err(|source| {
                    StorageError::CreateDataDir {
                        path: data_path.clone(),
                        source,
                    }
                })?;
                Box::new(SledStorage::open(
                    &data_path,
                    selection.sled_cache_capacity,
                    selection.sled_mode,
                )?)
            }
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": selection.engine.to_string(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self {
            engine: selection.engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

impl Persistence for StorageFacade {
    fn save_day(&self, day: i32, bucket: &DayBucket) -> Result<(), StorageError> {
        self.backend.save_day(day, bucket)
    }

    fn load_day(&self, day: i32) -> Result<DayBucket, StorageError> {
        self.backend.load_day(day)
    }

    fn save_users(&self, users: &HashMap<String, String>) -> Result<(), StorageError> {
        self.backend.save_users(users)
    }

    fn load_users(&self) -> Result<HashMap<String, String>, StorageError> {
        self.backend.load_users()
    }

    fn save_dictionary(&self, snapshot: &DictionarySnapshot) -> Result<(), StorageError> {
        self.backend.save_dictionary(snapshot)
    }

    fn load_dictionary(&self) -> Result<DictionarySnapshot, StorageError> {
        self.backend.load_dictionary()
    }

    fn save_current_day(&self, day: i32) -> Result<(), StorageError> {
        self.backend.save_current_day(day)
    }

    fn load_current_day(&self) -> Result<i32, StorageError> {
        self.backend.load_current_day()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}
