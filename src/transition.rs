//! Crossfade clips between consecutive stills.
//!
//! A failed transition never blocks the slideshow: every error path reports zero time
//! consumed so the next still keeps its full duration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Hold, PlayOutcome, Player};
use crate::cancel::CancelToken;
use crate::constants::{MAX_TRANSITION, MIN_TRANSITION};
use crate::error::Error;
use crate::ffmpeg;
use crate::state::Side;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransitionKind {
    #[default]
    None,
    Fade,
    FadeBlack,
    FadeWhite,
    WipeLeft,
    WipeRight,
    WipeUp,
    WipeDown,
    SlideLeft,
    SlideRight,
    SlideUp,
    SlideDown,
}

impl TransitionKind {
    /// Name of the matching ffmpeg `xfade` transition.
    pub fn xfade_name(self) -> Option<&'static str> {
        Some(match self {
            TransitionKind::None => return None,
            TransitionKind::Fade => "fade",
            TransitionKind::FadeBlack => "fadeblack",
            TransitionKind::FadeWhite => "fadewhite",
            TransitionKind::WipeLeft => "wipeleft",
            TransitionKind::WipeRight => "wiperight",
            TransitionKind::WipeUp => "wipeup",
            TransitionKind::WipeDown => "wipedown",
            TransitionKind::SlideLeft => "slideleft",
            TransitionKind::SlideRight => "slideright",
            TransitionKind::SlideUp => "slideup",
            TransitionKind::SlideDown => "slidedown",
        })
    }
}

impl From<String> for TransitionKind {
    fn from(value: String) -> Self {
        let normalized: String = value
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect();
        match normalized.as_str() {
            "fade" => TransitionKind::Fade,
            "fadeblack" => TransitionKind::FadeBlack,
            "fadewhite" => TransitionKind::FadeWhite,
            "wipeleft" => TransitionKind::WipeLeft,
            "wiperight" => TransitionKind::WipeRight,
            "wipeup" => TransitionKind::WipeUp,
            "wipedown" => TransitionKind::WipeDown,
            "slide" | "slideleft" => TransitionKind::SlideLeft,
            "slideright" => TransitionKind::SlideRight,
            "slideup" => TransitionKind::SlideUp,
            "slidedown" => TransitionKind::SlideDown,
            _ => TransitionKind::None,
        }
    }
}

impl From<TransitionKind> for String {
    fn from(value: TransitionKind) -> Self {
        value.xfade_name().unwrap_or("none").to_string()
    }
}

pub fn clamp_duration(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return MIN_TRANSITION;
    }
    seconds.clamp(MIN_TRANSITION, MAX_TRANSITION)
}

/// What a transition cost the following still.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct TransitionOutcome {
    pub consumed: Duration,
    /// Clip still loaded in a persistent player; delete it once the next still is shown
    pub clip: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TransitionRenderer {
    tool: String,
}

impl TransitionRenderer {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    /// Renders the clip from `previous` to `next` and plays it on `player`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        previous: Option<&Path>,
        next: &Path,
        kind: TransitionKind,
        seconds: f64,
        scratch: Option<&Path>,
        side: Side,
        player: &mut Player,
        cancel: &CancelToken,
    ) -> TransitionOutcome {
        let Some(transition) = kind.xfade_name() else {
            return TransitionOutcome::default();
        };
        let Some(previous) = previous.filter(|p| p.exists()) else {
            return TransitionOutcome::default();
        };
        let Some(scratch) = scratch else {
            warn!("No scratch directory, skipping {transition} transition");
            return TransitionOutcome::default();
        };

        let seconds = clamp_duration(seconds);
        let clip = scratch.join(format!("transition-{}.mp4", side.as_str()));
        match ffmpeg::render_xfade(&self.tool, previous, next, transition, seconds, &clip, cancel) {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                info!(side = side.as_str(), "Transition render cancelled");
                remove_clip(&clip);
                return TransitionOutcome::default();
            }
            Err(e) => {
                warn!("Skipping {transition} transition: {e}");
                remove_clip(&clip);
                return TransitionOutcome::default();
            }
        }
        debug!(clip = %clip.display(), "Rendered {transition} transition ({seconds}s)");
        if cancel.is_cancelled() {
            remove_clip(&clip);
            return TransitionOutcome::default();
        }

        let consumed = Duration::from_secs_f64(seconds);
        match player.play(&clip, Hold::UntilEnd, cancel) {
            PlayOutcome::Completed if player.is_persistent() => TransitionOutcome { consumed, clip: Some(clip) },
            PlayOutcome::Completed => {
                remove_clip(&clip);
                TransitionOutcome { consumed, clip: None }
            }
            PlayOutcome::Interrupted => {
                info!(side = side.as_str(), "Transition interrupted");
                remove_clip(&clip);
                TransitionOutcome::default()
            }
            PlayOutcome::Failed => {
                warn!(side = side.as_str(), "Transition clip could not be played");
                remove_clip(&clip);
                TransitionOutcome::default()
            }
        }
    }
}

pub fn remove_clip(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            debug!(path = %path.display(), "Could not remove transition clip: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OneShot;
    use std::os::unix::fs::PermissionsExt;

    fn stills(dir: &Path) -> (PathBuf, PathBuf) {
        let previous = dir.join("a.jpg");
        let next = dir.join("b.jpg");
        fs::write(&previous, b"a").unwrap();
        fs::write(&next, b"b").unwrap();
        (previous, next)
    }

    fn viewer() -> Player {
        Player::OneShot(OneShot::new("true", Vec::new()))
    }

    #[test]
    fn missing_tool_consumes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (previous, next) = stills(dir.path());
        let renderer = TransitionRenderer::new(dir.path().join("no-ffmpeg").to_string_lossy());
        let outcome = renderer.run(
            Some(&previous), &next, TransitionKind::Fade, 1.0,
            Some(dir.path()), Side::Primary, &mut viewer(), &CancelToken::new(),
        );
        assert_eq!(outcome, TransitionOutcome { consumed: Duration::ZERO, clip: None });
    }

    #[test]
    fn failing_tool_consumes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (previous, next) = stills(dir.path());
        let renderer = TransitionRenderer::new("false");
        let outcome = renderer.run(
            Some(&previous), &next, TransitionKind::WipeUp, 1.0,
            Some(dir.path()), Side::Primary, &mut viewer(), &CancelToken::new(),
        );
        assert_eq!(outcome, TransitionOutcome::default());
        assert!(!dir.path().join("transition-primary.mp4").exists());
    }

    #[test]
    fn nothing_to_blend_from() {
        let dir = tempfile::tempdir().unwrap();
        let (previous, next) = stills(dir.path());
        let renderer = TransitionRenderer::new("false");
        let none = renderer.run(
            Some(&previous), &next, TransitionKind::None, 1.0,
            Some(dir.path()), Side::Primary, &mut viewer(), &CancelToken::new(),
        );
        assert_eq!(none, TransitionOutcome::default());
        let gone = dir.path().join("deleted.jpg");
        let first = renderer.run(
            Some(&gone), &next, TransitionKind::Fade, 1.0,
            Some(dir.path()), Side::Primary, &mut viewer(), &CancelToken::new(),
        );
        assert_eq!(first, TransitionOutcome::default());
    }

    #[test]
    fn one_shot_playback_removes_the_clip() {
        let dir = tempfile::tempdir().unwrap();
        let (previous, next) = stills(dir.path());
        // Writes an empty file at its last argument, like a successful render
        let tool = dir.path().join("fake-ffmpeg");
        fs::write(&tool, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let renderer = TransitionRenderer::new(tool.to_string_lossy());
        let outcome = renderer.run(
            Some(&previous), &next, TransitionKind::Fade, 0.05,
            Some(dir.path()), Side::Secondary, &mut viewer(), &CancelToken::new(),
        );
        assert_eq!(outcome.consumed, Duration::from_secs_f64(MIN_TRANSITION));
        assert_eq!(outcome.clip, None);
        assert!(!dir.path().join("transition-secondary.mp4").exists());
    }

    #[test]
    fn cancelled_before_playback_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (previous, next) = stills(dir.path());
        let tool = dir.path().join("fake-ffmpeg");
        fs::write(&tool, "#!/bin/sh\nfor last; do :; done\n: > \"$last\"\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        // Would leave a marker if the clip were ever handed to it
        let marker = dir.path().join("played");
        let mut player = Player::OneShot(OneShot::new("touch", vec![marker.to_string_lossy().into_owned()]));

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = TransitionRenderer::new(tool.to_string_lossy()).run(
            Some(&previous), &next, TransitionKind::Fade, 1.0,
            Some(dir.path()), Side::Primary, &mut player, &cancel,
        );
        assert_eq!(outcome, TransitionOutcome::default());
        assert!(!marker.exists());
        assert!(!dir.path().join("transition-primary.mp4").exists());
    }

    #[test]
    fn kinds_parse_leniently() {
        assert_eq!(TransitionKind::from("slide".to_string()), TransitionKind::SlideLeft);
        assert_eq!(TransitionKind::from("Fade-Black".to_string()), TransitionKind::FadeBlack);
        assert_eq!(TransitionKind::from("dissolve".to_string()), TransitionKind::None);
        assert_eq!(String::from(TransitionKind::WipeDown), "wipedown");
        assert_eq!(clamp_duration(42.0), MAX_TRANSITION);
    }
}
