use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::constants::RENDER_POLL;
use crate::error::{Error, Result};

/// Renders an `xfade` clip of `duration` seconds from `previous` to `next`.
///
/// The render is killed as soon as `cancel` fires; the partial output is removed and
/// [`Error::Cancelled`] is returned.
pub fn render_xfade(
    tool: &str,
    previous: &Path,
    next: &Path,
    transition: &str,
    duration: f64,
    output: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let length = format!("{duration}");
    let spawned = Command::new(tool)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .arg("-y")
        .args(["-loglevel", "error"])
        // Both stills looped for the clip length
        .args(["-loop", "1", "-t", &length])
        .arg("-i")
        .arg(previous)
        .args(["-loop", "1", "-t", &length])
        .arg("-i")
        .arg(next)
        .arg("-filter_complex")
        .arg(format!("xfade=transition={transition}:duration={duration}:offset=0"))
        .args(["-pix_fmt", "yuv420p"])
        .arg(output)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::Transition(format!("{tool} not found")));
        }
        Err(e) => return Err(e.into()),
    };
    let stderr = collect_stderr(&mut child);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill(&mut child);
                return Err(e.into());
            }
        }
        if !cancel.sleep(RENDER_POLL) {
            debug!(pid = child.id(), "Cancelling {tool}");
            kill(&mut child);
            remove_partial(output);
            return Err(Error::Cancelled);
        }
    };

    if !status.success() {
        let stderr = stderr.and_then(|reader| reader.join().ok()).unwrap_or_default();
        return Err(Error::Transition(format!("{tool} exited with {status}: {}", stderr.trim())));
    }
    if !output.exists() {
        return Err(Error::Transition(format!("{tool} produced no output")));
    }
    Ok(())
}

// Drained on its own thread so a chatty tool never blocks on a full pipe
fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut pipe = child.stderr.take()?;
    thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            let mut text = String::new();
            if let Err(e) = pipe.read_to_string(&mut text) {
                debug!("Could not read ffmpeg stderr: {e}");
            }
            text
        })
        .map_err(|e| debug!("Could not spawn stderr reader: {e}"))
        .ok()
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), "Could not kill render: {e}");
    }
    if let Err(e) = child.wait() {
        debug!(pid = child.id(), "Could not reap render: {e}");
    }
}

fn remove_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            debug!(path = %output.display(), "Could not remove partial clip: {e}");
        }
    }
}
