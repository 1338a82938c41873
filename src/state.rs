//! Playback state model and its on-disk projection.
//!
//! The record always holds both sides. Writers go through [`StateStore::update`], which
//! reloads the full record under the writer lock and only touches the fields the closure
//! changes, so two side workers never clobber each other.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Primary,   // Whole screen, or the left region in splitscreen mode
    Secondary, // Right region, splitscreen only
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Primary, Side::Secondary];

    pub fn index(self) -> usize {
        match self {
            Side::Primary => 0,
            Side::Secondary => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Primary => "primary",
            Side::Secondary => "secondary",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Stopped,
    Idle,
    Playing,
    Completed,
    Info,
}

/// What a side is showing. `Info` only ever appears in state records.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Info,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SideState {
    pub label: Option<String>,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub media_path: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub preview_path: Option<PathBuf>,
}

impl SideState {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn idle() -> Self {
        Self {
            status: Status::Idle,
            ..Self::default()
        }
    }

    /// Starts showing something new; `started_at` is stamped now.
    pub fn showing(status: Status, media: &ShownMedia) -> Self {
        Self {
            label: Some(media.label.clone()),
            status,
            started_at: Some(Utc::now()),
            source: media.source.clone(),
            media_path: media.media_path.clone(),
            media_kind: Some(media.kind),
            preview_path: Some(media.preview.clone()),
        }
    }

    /// Moves to `status` while keeping what is shown and when it started.
    /// A record that shows something else is replaced instead.
    pub fn finish(&mut self, status: Status, media: &ShownMedia) {
        if self.label.as_deref() == Some(media.label.as_str()) {
            self.status = status;
            self.preview_path = Some(media.preview.clone());
        } else {
            *self = Self::showing(status, media);
        }
    }
}

/// Descriptor of one displayed item, as projected into the state record.
#[derive(Debug, Clone)]
pub struct ShownMedia {
    pub label: String,
    pub source: Option<String>,
    pub media_path: Option<String>,
    pub kind: MediaKind,
    pub preview: PathBuf,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackRecord {
    pub primary: SideState,
    pub secondary: SideState,
    pub info_screen: bool,
    pub info_manual: bool,
}

impl PlaybackRecord {
    pub fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Primary => &self.primary,
            Side::Secondary => &self.secondary,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Primary => &mut self.primary,
            Side::Secondary => &mut self.secondary,
        }
    }
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Best-effort read. Missing or corrupt files read as the all-stopped default.
    pub fn snapshot(&self) -> PlaybackRecord {
        read_record(&self.path)
    }

    /// Read-modify-write of the full record under the writer lock.
    pub fn update(&self, mutate: impl FnOnce(&mut PlaybackRecord)) -> PlaybackRecord {
        let _guard = self.writer.lock();
        let mut record = read_record(&self.path);
        mutate(&mut record);
        if let Err(e) = write_record(&self.path, &record) {
            warn!(path = %self.path.display(), "Could not persist playback state: {e}");
        }
        record
    }

    /// Writes `state` for one side and the shared flags, leaving the other side alone.
    #[cfg(test)]
    pub fn set_side(&self, side: Side, state: SideState, info_screen: bool, info_manual: bool) {
        self.update(|record| {
            *record.side_mut(side) = state;
            record.info_screen = info_screen;
            record.info_manual = info_manual;
        });
    }

    /// Both sides stopped, used at service start and stop.
    pub fn reset(&self, info_manual: bool) {
        self.update(|record| {
            record.primary = SideState::stopped();
            record.secondary = SideState::stopped();
            record.info_screen = false;
            record.info_manual = info_manual;
        });
    }
}

pub fn read_record(path: &Path) -> PlaybackRecord {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

// Temp file + rename keeps readers from ever seeing a torn record
fn write_record(path: &Path, record: &PlaybackRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(label: &str) -> ShownMedia {
        ShownMedia {
            label: label.to_string(),
            source: Some("local".into()),
            media_path: Some(label.trim_start_matches("local/").into()),
            kind: MediaKind::Image,
            preview: PathBuf::from("/tmp/preview.jpg"),
        }
    }

    #[test]
    fn missing_file_reads_as_all_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let record = store.snapshot();
        assert_eq!(record, PlaybackRecord::default());
        assert_eq!(record.primary.status, Status::Stopped);
        assert_eq!(record.secondary.status, Status::Stopped);
    }

    #[test]
    fn corrupt_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = StateStore::new(&path);
        assert_eq!(store.snapshot(), PlaybackRecord::default());
    }

    #[test]
    fn writing_one_side_keeps_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        store.set_side(Side::Secondary, SideState::showing(Status::Playing, &media("local/b.jpg")), false, false);
        store.set_side(Side::Primary, SideState::showing(Status::Playing, &media("local/a.jpg")), false, true);

        let record = store.snapshot();
        assert_eq!(record.primary.label.as_deref(), Some("local/a.jpg"));
        assert_eq!(record.secondary.label.as_deref(), Some("local/b.jpg"));
        assert_eq!(record.secondary.status, Status::Playing);
        assert!(record.info_manual);
    }

    #[test]
    fn finish_keeps_start_time_of_the_same_item() {
        let shown = media("local/a.jpg");
        let mut state = SideState::showing(Status::Playing, &shown);
        let started = state.started_at;
        state.finish(Status::Completed, &shown);
        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.started_at, started);

        state.finish(Status::Completed, &media("local/other.jpg"));
        assert_eq!(state.label.as_deref(), Some("local/other.jpg"));
    }

    #[test]
    fn reset_stops_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.set_side(Side::Primary, SideState::showing(Status::Info, &media("system/info.png")), true, true);
        store.reset(true);
        let record = store.snapshot();
        assert_eq!(record.primary, SideState::stopped());
        assert_eq!(record.secondary, SideState::stopped());
        assert!(!record.info_screen);
        assert!(record.info_manual);
    }
}
