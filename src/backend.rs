//! Uniform playback contract over the two kinds of player backends.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::constants::ONE_SHOT_POLL;
use crate::mpv::MpvController;

/// How long a loaded file stays on screen.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Hold {
    For(Duration), // Stills
    UntilEnd,      // Videos and transition clips
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PlayOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// A player started once per file.
#[derive(Debug)]
pub struct OneShot {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl OneShot {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, child: None }
    }

    fn spawn(&mut self, path: &Path) -> bool {
        self.kill();
        match Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(pid = child.id(), path = %path.display(), "Started {}", self.program);
                self.child = Some(child);
                true
            }
            Err(e) => {
                warn!("Could not start {}: {e}", self.program);
                false
            }
        }
    }

    fn exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                if let Err(e) = child.kill() {
                    debug!(pid = child.id(), "Could not kill {}: {e}", self.program);
                }
            }
            if let Err(e) = child.wait() {
                debug!(pid = child.id(), "Could not reap {}: {e}", self.program);
            }
        }
    }

    fn hold(&mut self, hold: Hold, cancel: &CancelToken) -> PlayOutcome {
        let deadline = match hold {
            Hold::For(duration) => Some(Instant::now() + duration),
            Hold::UntilEnd => None,
        };
        loop {
            if self.exited() {
                self.kill();
                return PlayOutcome::Completed;
            }
            let step = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        // Stills end when their time is up
                        self.kill();
                        return PlayOutcome::Completed;
                    }
                    remaining.min(ONE_SHOT_POLL)
                }
                None => ONE_SHOT_POLL,
            };
            if !cancel.sleep(step) {
                self.kill();
                return PlayOutcome::Interrupted;
            }
        }
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug)]
pub enum Player {
    Persistent(Arc<MpvController>),
    OneShot(OneShot),
}

impl Player {
    pub fn is_persistent(&self) -> bool {
        matches!(self, Player::Persistent(_))
    }

    /// Hands `path` to the player. For one-shot players this starts the process.
    pub fn load(&mut self, path: &Path) -> bool {
        match self {
            Player::Persistent(controller) => controller.load_file(path),
            Player::OneShot(one_shot) => one_shot.spawn(path),
        }
    }

    /// Waits out `hold`. On cancellation the playback is stopped before returning.
    pub fn hold(&mut self, hold: Hold, cancel: &CancelToken) -> PlayOutcome {
        match self {
            Player::Persistent(controller) => {
                let finished = match hold {
                    Hold::For(duration) => cancel.sleep(duration),
                    Hold::UntilEnd => controller.wait_until_idle(|| cancel.is_cancelled()),
                };
                if finished {
                    PlayOutcome::Completed
                } else {
                    controller.stop_playback();
                    PlayOutcome::Interrupted
                }
            }
            Player::OneShot(one_shot) => one_shot.hold(hold, cancel),
        }
    }

    pub fn play(&mut self, path: &Path, hold: Hold, cancel: &CancelToken) -> PlayOutcome {
        if !self.load(path) {
            return PlayOutcome::Failed;
        }
        self.hold(hold, cancel)
    }

    /// Tells a persistent player how long stills last on their own.
    pub fn set_image_duration(&self, seconds: f64) {
        if let Player::Persistent(controller) = self {
            controller.set_property("image-display-duration", seconds);
        }
    }

    /// Freezes the current frame of a persistent player.
    pub fn pause(&self) {
        if let Player::Persistent(controller) = self {
            if !controller.set_property("pause", true) {
                debug!("Could not pause player to hold the frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn one_shot_still_is_cut_after_its_duration() {
        let mut player = Player::OneShot(OneShot::new("sleep", Vec::new()));
        let started = Instant::now();
        let outcome = player.play(Path::new("30"), Hold::For(Duration::from_millis(300)), &CancelToken::new());
        assert_eq!(outcome, PlayOutcome::Completed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn one_shot_video_runs_until_exit() {
        let mut player = Player::OneShot(OneShot::new("true", Vec::new()));
        let outcome = player.play(Path::new("clip.mp4"), Hold::UntilEnd, &CancelToken::new());
        assert_eq!(outcome, PlayOutcome::Completed);
    }

    #[test]
    fn cancellation_interrupts_one_shot() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            let mut player = Player::OneShot(OneShot::new("sleep", Vec::new()));
            player.play(Path::new("30"), Hold::UntilEnd, &cancel)
        });
        thread::sleep(Duration::from_millis(200));
        trigger.cancel();
        assert_eq!(handle.join().unwrap(), PlayOutcome::Interrupted);
    }

    #[test]
    fn interrupted_one_shot_is_reaped() {
        let mut one_shot = OneShot::new("sleep", Vec::new());
        assert!(one_shot.spawn(Path::new("30")));
        let pid = one_shot.child.as_ref().unwrap().id();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(one_shot.hold(Hold::UntilEnd, &cancel), PlayOutcome::Interrupted);
        assert!(one_shot.child.is_none());
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
        // Nothing left to kill
        one_shot.kill();
    }

    #[test]
    fn missing_program_fails() {
        let mut player = Player::OneShot(OneShot::new("/nonexistent/viewer", Vec::new()));
        let outcome = player.play(Path::new("a.jpg"), Hold::For(Duration::from_secs(5)), &CancelToken::new());
        assert_eq!(outcome, PlayOutcome::Failed);
    }
}
