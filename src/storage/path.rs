use std::path::PathBuf;

use super::StorageError;

/// Resolves a leading `~` or `$HOME` against the `HOME` variable. Anything
/// else is used as given.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let rest = ["~", "$HOME"].iter().find_map(|prefix| {
        let rest = raw_path.strip_prefix(prefix)?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    });

    match rest {
        Some(rest) => Ok(home_dir()?.join(rest.trim_start_matches('/'))),
        None => Ok(PathBuf::from(raw_path)),
    }
}

fn home_dir() -> Result<PathBuf, StorageError> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .ok_or(StorageError::HomeDirectoryUnavailable)
}
