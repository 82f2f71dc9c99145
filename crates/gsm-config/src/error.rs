use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Home directory not found. Set GSM_STATE_DIR to choose a state directory")]
    HomeDirNotFound,

    #[error("Catalog file not found: {0}")]
    CatalogNotFound(PathBuf),

    #[error("Invalid settings file {path}: {source}")]
    InvalidSettings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
