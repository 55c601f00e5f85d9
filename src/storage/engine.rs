use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::StorageConfig;

use super::{expand_home_path, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    /// One file per record under the data directory.
    Files,
    Sled,
}

impl FromStr for StorageEngine {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "files" => Ok(Self::Files),
            "sled" => Ok(Self::Sled),
            other => Err(StorageError::UnsupportedEngine {
                engine: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Files => "files",
            Self::Sled => "sled",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl FromStr for SledMode {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "low_space" => Ok(Self::LowSpace),
            "high_throughput" => Ok(Self::HighThroughput),
            other => Err(StorageError::InvalidSledMode {
                mode: other.to_owned(),
            }),
        }
    }
}

impl From<SledMode> for sled::Mode {
    fn from(value: SledMode) -> Self {
        match value {
            SledMode::LowSpace => sled::Mode::LowSpace,
            SledMode::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}

/// `[storage]` settings checked and resolved before anything is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSelection {
    pub engine: StorageEngine,
    pub data_path: PathBuf,
    pub sled_cache_capacity: Option<u64>,
    pub sled_mode: Option<SledMode>,
}

impl EngineSelection {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let engine = config.engine.parse()?;
        let sled_mode = config
            .sled
            .mode
            .as_deref()
            .map(SledMode::from_str)
            .transpose()?;

        Ok(Self {
            engine,
            data_path: expand_home_path(&config.path)?,
            sled_cache_capacity: config.sled.cache_capacity,
            sled_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StorageConfig;
    use crate::storage::StorageError;

    use super::{EngineSelection, SledMode, StorageEngine};

    #[test]
    fn resolves_engine_mode_and_path() {
        let mut config = StorageConfig::default();
        config.engine = "sled".to_owned();
        config.path = "/srv/ledger".to_owned();
        config.sled.mode = Some("high_throughput".to_owned());
        config.sled.cache_capacity = Some(4096);

        let selection = EngineSelection::from_config(&config).expect("selection should resolve");
        assert_eq!(selection.engine, StorageEngine::Sled);
        assert_eq!(selection.data_path, std::path::PathBuf::from("/srv/ledger"));
        assert_eq!(selection.sled_mode, Some(SledMode::HighThroughput));
        assert_eq!(selection.sled_cache_capacity, Some(4096));
        assert_eq!(selection.engine.to_string(), "sled");
    }

    #[test]
    fn files_engine_ignores_missing_sled_settings() {
        let selection =
            EngineSelection::from_config(&StorageConfig::default()).expect("defaults resolve");
        assert_eq!(selection.engine, StorageEngine::Files);
        assert_eq!(selection.sled_mode, None);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        assert!(matches!(
            "postgres".parse::<StorageEngine>(),
            Err(StorageError::UnsupportedEngine { .. })
        ));
        assert!(matches!(
            "turbo".parse::<SledMode>(),
            Err(StorageError::InvalidSledMode { .. })
        ));
    }
}
