//! Error type shared by the playback modules.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Playlist item names a source the configuration does not know
    #[error("unknown media source: {0}")]
    UnknownSource(String),

    /// Resolved file does not exist (or is not a regular file)
    #[error("media file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Relative path escapes its source root
    #[error("path {} lies outside of its source", .0.display())]
    OutsideSource(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("player IPC error: {0}")]
    Ipc(String),

    #[error("transition rendering failed: {0}")]
    Transition(String),

    /// Work abandoned because its cycle ended
    #[error("cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
