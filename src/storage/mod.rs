mod backend;
mod engine;
mod error;
mod facade;
mod file_backend;
mod format;
#[cfg(test)]
pub(crate) mod memory;
mod path;
mod sled_backend;

pub use backend::Persistence;
pub use engine::{EngineSelection, SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
pub use file_backend::FileStorage;
use path::expand_home_path;
pub use sled_backend::SledStorage;
