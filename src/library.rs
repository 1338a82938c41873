//! Playlists built from named local directories.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{AppConfig, MediaSource};
use crate::error::{Error, Result};
use crate::state::MediaKind;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "m4v"];

/// One playable file, addressed relative to its source.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub source: String,
    pub path: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: MediaKind,
    /// Per-item still time in seconds, overriding the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl PlaylistItem {
    pub fn new(source: impl Into<String>, path: impl Into<String>, kind: MediaKind) -> Self {
        Self { source: source.into(), path: path.into(), kind, duration: None }
    }

    /// `source:path`, as shown in the playback state
    pub fn label(&self) -> String {
        format!("{}:{}", self.source, self.path)
    }
}

pub trait PlaylistProvider: Send + Sync {
    /// The unified playlist for fullscreen playback.
    fn playlist(&self, config: &AppConfig) -> Vec<PlaylistItem>;

    /// Independent `(left, right)` playlists for splitscreen playback.
    fn split_playlists(&self, config: &AppConfig) -> (Vec<PlaylistItem>, Vec<PlaylistItem>);
}

pub trait MediaResolver: Send + Sync {
    fn resolve(&self, config: &AppConfig, source: &str, relative: &str) -> Result<PathBuf>;
}

pub fn detect_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Trims separators; `None` for empty paths or ones that climb out with `..`.
fn normalize_subpath(raw: &str) -> Option<PathBuf> {
    let cleaned = raw.replace('\\', "/");
    let cleaned = cleaned.trim().trim_matches('/');
    if cleaned.is_empty() {
        return None;
    }
    let path = PathBuf::from(cleaned);
    if path.components().any(|c| !matches!(c, Component::Normal(_))) {
        warn!("Ignoring sub-path {raw:?}");
        return None;
    }
    Some(path)
}

fn relative_string(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Media under the library's local directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLibrary;

impl LocalLibrary {
    /// Lists the media files below `subpath` (or the whole source), sorted by path.
    pub fn scan(&self, source: &MediaSource, subpath: Option<&str>) -> Vec<PlaylistItem> {
        let root = source.path.as_path();
        let base = match subpath.and_then(normalize_subpath) {
            Some(subpath) => root.join(subpath),
            None => root.to_path_buf(),
        };
        if !base.exists() {
            warn!(source = %source.name, "Directory {} does not exist", base.display());
            return Vec::new();
        }

        let mut items: Vec<PlaylistItem> = WalkDir::new(&base)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(source = %source.name, "Skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let kind = detect_kind(entry.path())?;
                let relative = relative_string(entry.path(), root)?;
                Some(PlaylistItem::new(source.name.clone(), relative, kind))
            })
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items
    }

    fn split_side(&self, config: &AppConfig, source: Option<&str>, path: &str, label: &str) -> Vec<PlaylistItem> {
        let Some(name) = source.filter(|name| !name.trim().is_empty()) else {
            return Vec::new();
        };
        let Some(source) = config.source(name) else {
            warn!("Unknown {label} source {name}");
            return Vec::new();
        };
        let subpath = if path.trim().is_empty() { source.subpath.as_deref() } else { Some(path) };
        self.scan(source, subpath)
            .into_iter()
            .filter(|item| !config.is_disabled(&item.source, &item.path))
            .collect()
    }
}

impl PlaylistProvider for LocalLibrary {
    fn playlist(&self, config: &AppConfig) -> Vec<PlaylistItem> {
        let manual: Vec<PlaylistItem> = config
            .playlist
            .iter()
            .filter(|item| !config.is_disabled(&item.source, &item.path))
            .cloned()
            .collect();

        let mut seen: HashSet<(String, String)> = manual
            .iter()
            .map(|item| (item.source.clone(), item.path.clone()))
            .chain(config.disabled_media.iter().map(|m| (m.source.clone(), m.path.clone())))
            .collect();

        let mut scanned = Vec::new();
        for source in config.sources.iter().filter(|source| source.auto_scan) {
            for item in self.scan(source, source.subpath.as_deref()) {
                if seen.insert((item.source.clone(), item.path.clone())) {
                    scanned.push(item);
                }
            }
        }
        scanned.sort_by(|a, b| (&a.source, &a.path).cmp(&(&b.source, &b.path)));

        manual.into_iter().chain(scanned).collect()
    }

    fn split_playlists(&self, config: &AppConfig) -> (Vec<PlaylistItem>, Vec<PlaylistItem>) {
        let playback = &config.playback;
        let left = self.split_side(
            config,
            playback.splitscreen_left_source.as_deref(),
            &playback.splitscreen_left_path,
            "left",
        );
        let right = self.split_side(
            config,
            playback.splitscreen_right_source.as_deref(),
            &playback.splitscreen_right_path,
            "right",
        );
        (left, right)
    }
}

impl MediaResolver for LocalLibrary {
    fn resolve(&self, config: &AppConfig, source: &str, relative: &str) -> Result<PathBuf> {
        let media_source = config
            .source(source)
            .ok_or_else(|| Error::UnknownSource(source.to_string()))?;
        let base = fs::canonicalize(&media_source.path)
            .map_err(|_| Error::NotFound(media_source.path.clone()))?;
        let joined = base.join(relative);
        let target = fs::canonicalize(&joined).map_err(|_| Error::NotFound(joined.clone()))?;
        if !target.starts_with(&base) {
            return Err(Error::OutsideSource(joined));
        }
        if !target.is_file() {
            return Err(Error::NotFound(target));
        }
        Ok(target)
    }
}
