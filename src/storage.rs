use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::peer::PeerId;
use crate::settings::Settings;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `~/.breaksync`, used when no home directory is configured.
pub fn default_home() -> Result<PathBuf, StorageError> {
    let base = directories::BaseDirs::new().ok_or(StorageError::NoHome)?;
    Ok(base.home_dir().join(".breaksync"))
}

pub fn id_file(home: &Path, port: u16) -> PathBuf {
    home.join(format!("id-{}", port))
}

/// Loads the instance id kept in `id-<port>`, generating and persisting a new
/// one when the file is missing or does not hold a valid id.
pub fn load_or_create_id(home: &Path, port: u16) -> Result<PeerId, StorageError> {
    let path = id_file(home, port);

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(content) => {
                if let Some(id) = PeerId::parse(&content) {
                    tracing::info!(%id, "loaded instance id from {}", path.display());
                    return Ok(id);
                }
                tracing::warn!("malformed instance id in {}, regenerating", path.display());
            }
            Err(e) => {
                tracing::warn!("failed to read {}: {}, regenerating", path.display(), e);
            }
        }
    }

    let id = PeerId::random();

    // Ensure directory exists
    fs::create_dir_all(home).map_err(|source| StorageError::Io {
        path: home.to_path_buf(),
        source,
    })?;
    fs::write(&path, format!("{}\n", id)).map_err(|source| StorageError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::info!(%id, "generated new instance id in {}", path.display());
    Ok(id)
}

/// Reads `settings.json` from `home`. A missing file yields the defaults; an
/// unreadable or unparsable file is logged and also yields the defaults.
pub fn load_settings(home: &Path) -> Settings {
    let path = home.join(SETTINGS_FILE);

    if !path.exists() {
        return Settings::default();
    }

    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => {
                tracing::info!("loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                tracing::error!("failed to parse {}: {}", path.display(), e);
                Settings::default()
            }
        },
        Err(e) => {
            tracing::error!("failed to read {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

pub fn save_settings(home: &Path, settings: &Settings) -> Result<(), StorageError> {
    let path = home.join(SETTINGS_FILE);

    fs::create_dir_all(home).map_err(|source| StorageError::Io {
        path: home.to_path_buf(),
        source,
    })?;

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&path, json).map_err(|source| StorageError::Io { path, source })?;
    Ok(())
}
