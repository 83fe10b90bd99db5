//! Local filesystem layout.
//!
//! Everything qpg persists lives under the XDG cache directory:
//! the catalog at `~/.cache/qpg/index.sqlite` and model assets under
//! `~/.cache/qpg/models/`. The YAML config is read from the XDG config
//! directory. `QPG_CACHE_DIR` overrides the cache root (used by tests).

use std::path::PathBuf;

use crate::error::Result;

pub const APP_NAME: &str = "qpg";
pub const INDEX_FILENAME: &str = "index.sqlite";

/// Resolved filesystem locations for the catalog and model cache.
#[derive(Debug, Clone)]
pub struct Paths {
    pub cache_dir: PathBuf,
    pub index_db: PathBuf,
    pub models_dir: PathBuf,
}

fn env_dir(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    env_dir("HOME").unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve qpg's directories without touching the filesystem.
pub fn get_paths() -> Paths {
    let cache_root = env_dir("QPG_CACHE_DIR")
        .or_else(|| env_dir("XDG_CACHE_HOME").map(|p| p.join(APP_NAME)))
        .unwrap_or_else(|| home_dir().join(".cache").join(APP_NAME));
    Paths {
        index_db: cache_root.join(INDEX_FILENAME),
        models_dir: cache_root.join("models"),
        cache_dir: cache_root,
    }
}

/// Resolve and create qpg's directories.
pub fn ensure_dirs() -> Result<Paths> {
    let paths = get_paths();
    std::fs::create_dir_all(&paths.cache_dir)?;
    std::fs::create_dir_all(&paths.models_dir)?;
    Ok(paths)
}

/// Location of the YAML configuration file.
pub fn config_yaml_path() -> PathBuf {
    let config_root = env_dir("XDG_CONFIG_HOME")
        .unwrap_or_else(|| home_dir().join(".config"));
    config_root.join(APP_NAME).join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_layout_is_under_one_root() {
        let paths = get_paths();
        assert!(paths.index_db.starts_with(&paths.cache_dir));
        assert!(paths.models_dir.starts_with(&paths.cache_dir));
        assert_eq!(paths.index_db.file_name().unwrap(), INDEX_FILENAME);
    }
}
