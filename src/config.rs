//! TOML configuration and the per-cycle snapshot handed to the orchestrator.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::layout::{Resolution, clamp_ratio};
use crate::library::PlaylistItem;
use crate::preprocess::{ImageFit, Rotation};
use crate::transition::{TransitionKind, clamp_duration};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the rendered info screen is written
    pub data_dir: PathBuf,
    pub sources: Vec<MediaSource>,
    /// Manually curated entries, played before scanned ones
    pub playlist: Vec<PlaylistItem>,
    pub disabled_media: Vec<MediaRef>,
    pub playback: PlaybackConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = env::var_os("SIGNAGE_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".signage")))
            .unwrap_or_else(|| env::temp_dir().join("signage"));
        Self {
            sources: vec![MediaSource {
                name: "local".to_string(),
                path: data_dir.join("media"),
                auto_scan: true,
                subpath: None,
            }],
            data_dir,
            playlist: Vec::new(),
            disabled_media: Vec::new(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn source(&self, name: &str) -> Option<&MediaSource> {
        self.sources.iter().find(|source| source.name == name)
    }

    pub fn is_disabled(&self, source: &str, path: &str) -> bool {
        self.disabled_media
            .iter()
            .any(|entry| entry.source == source && entry.path == path)
    }

    /// Clamps and cleans values the way every consumer expects them.
    pub fn normalized(mut self) -> Self {
        let playback = &mut self.playback;
        playback.image_duration = playback.image_duration.max(1);
        playback.refresh_interval = playback.refresh_interval.max(MIN_REFRESH_INTERVAL);
        playback.transition_duration = clamp_duration(playback.transition_duration);
        playback.splitscreen_ratio = clamp_ratio(playback.splitscreen_ratio);
        playback.video_player_args = clean_args(&playback.video_player_args);
        playback.image_viewer_args = clean_args(&playback.image_viewer_args);
        self
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MediaSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub auto_scan: bool,
    #[serde(default)]
    pub subpath: Option<String>,
}

/// A `(source, path)` pair, used to exclude files from playback.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub source: String,
    pub path: String,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub image_duration: u64,
    pub video_player: String,
    pub image_viewer: String,
    pub video_player_args: Vec<String>,
    pub image_viewer_args: Vec<String>,
    pub refresh_interval: u64,
    pub info_screen_enabled: bool,
    pub image_fit: ImageFit,
    pub image_rotation: Rotation,
    pub transition_type: TransitionKind,
    pub transition_duration: f64,
    pub transition_tool: String,
    pub display_resolution: Resolution,
    pub splitscreen_enabled: bool,
    pub splitscreen_ratio: u32,
    pub splitscreen_left_source: Option<String>,
    pub splitscreen_left_path: String,
    pub splitscreen_right_source: Option<String>,
    pub splitscreen_right_path: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            image_duration: 10,
            video_player: "mpv".to_string(),
            image_viewer: "mpv".to_string(),
            video_player_args: Vec::new(),
            image_viewer_args: Vec::new(),
            refresh_interval: 30,
            info_screen_enabled: true,
            image_fit: ImageFit::Contain,
            image_rotation: Rotation::None,
            transition_type: TransitionKind::None,
            transition_duration: 1.0,
            transition_tool: "ffmpeg".to_string(),
            display_resolution: Resolution::default(),
            splitscreen_enabled: false,
            splitscreen_ratio: 50,
            splitscreen_left_source: None,
            splitscreen_left_path: String::new(),
            splitscreen_right_source: None,
            splitscreen_right_path: String::new(),
        }
    }
}

impl PlaybackConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(MIN_REFRESH_INTERVAL))
    }

    /// Splitscreen ratio when splitscreen is on.
    pub fn split_ratio(&self) -> Option<u32> {
        self.splitscreen_enabled.then(|| clamp_ratio(self.splitscreen_ratio))
    }

    /// Extra arguments for the persistent player, video ones first, de-duplicated.
    pub fn mpv_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        for arg in self.video_player_args.iter().chain(&self.image_viewer_args) {
            if !args.contains(arg) {
                args.push(arg.clone());
            }
        }
        args
    }
}

fn clean_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.trim())
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn load(path: &Path) -> Result<AppConfig> {
    let text = fs::read_to_string(path)?;
    let config: AppConfig =
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(config.normalized())
}

/// Live configuration, read once per playback cycle.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> AppConfig;
}

/// Re-reads the file on every snapshot and keeps the last config that parsed.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    last_good: Mutex<AppConfig>,
}

impl ConfigFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            load(&path)?
        } else {
            info!(path = %path.display(), "No configuration file, using defaults");
            AppConfig::default()
        };
        Ok(Self { path, last_good: Mutex::new(config) })
    }
}

impl ConfigSource for ConfigFile {
    fn snapshot(&self) -> AppConfig {
        if !self.path.exists() {
            return self.last_good.lock().clone();
        }
        match load(&self.path) {
            Ok(config) => {
                *self.last_good.lock() = config.clone();
                config
            }
            Err(e) => {
                warn!("Keeping previous configuration: {e}");
                self.last_good.lock().clone()
            }
        }
    }
}

/// In-memory configuration that can be swapped at runtime.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryConfig(Mutex<AppConfig>);

#[cfg(test)]
impl MemoryConfig {
    pub fn new(config: AppConfig) -> Self {
        Self(Mutex::new(config.normalized()))
    }

    pub fn replace(&self, config: AppConfig) {
        *self.0.lock() = config.normalized();
    }
}

#[cfg(test)]
impl ConfigSource for MemoryConfig {
    fn snapshot(&self) -> AppConfig {
        self.0.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MediaKind;

    const SAMPLE: &str = r#"
data_dir = "/srv/signage"
disabled_media = [{ source = "local", path = "old.jpg" }]

[[sources]]
name = "local"
path = "/srv/signage/media"
auto_scan = true

[[playlist]]
source = "local"
path = "intro.mp4"
type = "video"

[playback]
image_duration = 5
transition_type = "slide"
transition_duration = 30
image_rotation = -90
image_fit = "STRETCH"
display_resolution = "1280x720"
splitscreen_enabled = true
splitscreen_ratio = 95
refresh_interval = 1
video_player_args = ["--hwdec=auto", " ", "--mute"]
image_viewer_args = ["--mute"]
"#;

    #[test]
    fn parses_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = load(&path).unwrap();
        let playback = &config.playback;
        assert_eq!(playback.image_duration, 5);
        assert_eq!(playback.transition_type, TransitionKind::SlideLeft);
        assert_eq!(playback.transition_duration, 10.0);
        assert_eq!(playback.image_rotation, Rotation::Cw270);
        assert_eq!(playback.image_fit, ImageFit::Stretch);
        assert_eq!(playback.display_resolution, Resolution { width: 1280, height: 720 });
        assert_eq!(playback.split_ratio(), Some(90));
        assert_eq!(playback.refresh(), Duration::from_secs(5));
        assert_eq!(playback.mpv_args(), vec!["--hwdec=auto".to_string(), "--mute".to_string()]);
        assert_eq!(playback.video_player, "mpv");
        assert_eq!(config.playlist[0].kind, MediaKind::Video);
        assert!(config.is_disabled("local", "old.jpg"));
        assert_eq!(config.source("local").unwrap().path, PathBuf::from("/srv/signage/media"));
    }

    #[test]
    fn broken_file_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[playback]\nimage_duration = 7\n").unwrap();
        let source = ConfigFile::open(&path).unwrap();
        assert_eq!(source.snapshot().playback.image_duration, 7);

        fs::write(&path, "[playback\nimage_duration = ").unwrap();
        assert_eq!(source.snapshot().playback.image_duration, 7);

        fs::write(&path, "[playback]\nimage_duration = 3\n").unwrap();
        assert_eq!(source.snapshot().playback.image_duration, 3);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConfigFile::open(dir.path().join("absent.toml")).unwrap();
        let config = source.snapshot();
        assert_eq!(config.playback, PlaybackConfig::default());
        assert_eq!(config.playback.split_ratio(), None);
    }
}
