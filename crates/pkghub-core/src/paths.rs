use dirs::home_dir;
use std::path::PathBuf;

/// Returns the pkghub home directory, or None if the user's home cannot be resolved.
pub fn try_pkghub_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("PKGHUB_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".pkghub"))
}

/// Returns the pkghub home directory (`~/.pkghub`), falling back to
/// `./.pkghub` when no home directory can be resolved (e.g. in containers).
pub fn pkghub_home() -> PathBuf {
    try_pkghub_home().unwrap_or_else(|| PathBuf::from(".pkghub"))
}

/// Default configuration file: ~/.pkghub/config.toml
pub fn config_path() -> PathBuf {
    pkghub_home().join("config.toml")
}

/// Default filesystem storage root: ~/.pkghub/data
pub fn storage_root() -> PathBuf {
    pkghub_home().join("data")
}
