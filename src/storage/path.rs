use std::path::PathBuf;

use super::StorageError;

/// Resolves `~` and `$HOME` prefixes in a configured storage path.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let suffix = if let Some(rest) = raw_path.strip_prefix('~') {
        rest
    } else if let Some(rest) = raw_path.strip_prefix("$HOME") {
        rest
    } else {
        return Ok(PathBuf::from(raw_path));
    };

    if !suffix.is_empty() && !suffix.starts_with('/') {
        return Ok(PathBuf::from(raw_path));
    }

    let home = std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable)?;
    let mut resolved = PathBuf::from(home);
    let relative = suffix.trim_start_matches('/');
    if !relative.is_empty() {
        resolved.push(relative);
    }
    Ok(resolved)
}
