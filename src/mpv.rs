//! Persistent mpv instance driven over its JSON IPC socket.
//!
//! One controller owns one process. The window geometry is fixed for the lifetime of
//! the controller; a different placement needs a new controller.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::layout::Geometry;

#[derive(Debug, Clone)]
pub struct MpvOptions {
    pub binary: String,
    pub extra_args: Vec<String>,
    /// Parent of the private socket directories, the system temp dir when unset
    pub runtime_dir: Option<PathBuf>,
    pub quit_grace: Duration,
    pub term_grace: Duration,
}

impl Default for MpvOptions {
    fn default() -> Self {
        Self {
            binary: "mpv".to_string(),
            extra_args: Vec::new(),
            runtime_dir: None,
            quit_grace: QUIT_GRACE,
            term_grace: TERM_GRACE,
        }
    }
}

/// Commands understood by the player.
#[derive(Debug)]
enum Request<'a> {
    LoadFile(&'a Path),
    Stop,
    Quit,
    SetProperty(&'a str, Value),
    GetProperty(&'a str),
}

impl Request<'_> {
    fn args(&self) -> Vec<Value> {
        match self {
            Request::LoadFile(path) => vec![
                json!("loadfile"),
                json!(path.to_string_lossy()),
                json!("replace"),
            ],
            Request::Stop => vec![json!("stop")],
            Request::Quit => vec![json!("quit")],
            Request::SetProperty(name, value) => vec![json!("set_property"), json!(name), value.clone()],
            Request::GetProperty(name) => vec![json!("get_property"), json!(name)],
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope {
    command: Vec<Value>,
    request_id: u64,
}

#[derive(Debug, Deserialize)]
struct Reply {
    error: Option<String>,
    data: Option<Value>,
    request_id: Option<u64>,
    event: Option<String>,
}

impl Reply {
    fn is_success(&self) -> bool {
        self.error.as_deref() == Some("success")
    }
}

#[derive(Debug, Default)]
struct Process {
    child: Option<Child>,
    socket_dir: Option<TempDir>,
}

impl Process {
    fn socket_path(&self) -> Option<PathBuf> {
        self.socket_dir.as_ref().map(|dir| dir.path().join("socket"))
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    // Removes the socket and its private directory whatever state the process is in
    fn cleanup_socket(&mut self) {
        if let Some(path) = self.socket_path() {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), "Could not remove IPC socket: {e}");
                }
            }
        }
        if let Some(dir) = self.socket_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                debug!(path = %path.display(), "Could not remove socket directory: {e}");
            }
        }
    }
}

#[derive(Debug)]
pub struct MpvController {
    geometry: Option<Geometry>,
    options: MpvOptions,
    process: Mutex<Process>,
    next_request: AtomicU64,
}

impl MpvController {
    pub fn new(geometry: Option<Geometry>, options: MpvOptions) -> Self {
        Self {
            geometry,
            options,
            process: Mutex::new(Process::default()),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn extra_args(&self) -> &[String] {
        &self.options.extra_args
    }

    // --- Lifecycle ---

    /// Launches mpv unless it already runs, then waits for the IPC socket.
    pub fn start(&self) -> bool {
        {
            let mut process = self.process.lock();
            if process.is_alive() {
                return true;
            }
            process.cleanup_socket();

            let mut builder = tempfile::Builder::new();
            builder.prefix("signage-mpv-");
            let socket_dir = match &self.options.runtime_dir {
                Some(parent) => builder.tempdir_in(parent),
                None => builder.tempdir(),
            };
            let socket_dir = match socket_dir {
                Ok(dir) => dir,
                Err(e) => {
                    error!("Could not create IPC socket directory: {e}");
                    return false;
                }
            };
            let socket = socket_dir.path().join("socket");

            let mut command = Command::new(&self.options.binary);
            command
                .args(["--no-terminal", "--quiet", "--idle=yes", "--force-window=yes", "--keep-open=yes"])
                .arg(format!("--input-ipc-server={}", socket.display()));
            match self.geometry {
                Some(geometry) => command.arg(format!("--geometry={geometry}")),
                None => command.arg("--fullscreen"),
            };
            command
                .args(&self.options.extra_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match command.spawn() {
                Ok(child) => {
                    info!(pid = child.id(), geometry = ?self.geometry, "Started {}", self.options.binary);
                    process.child = Some(child);
                    process.socket_dir = Some(socket_dir);
                }
                Err(e) => {
                    error!("Could not start {}: {e}", self.options.binary);
                    return false;
                }
            }
        }

        if self.wait_for_socket() {
            true
        } else {
            self.stop();
            false
        }
    }

    /// Restarts the process if it has exited.
    pub fn ensure_running(&self) -> bool {
        if self.is_running() {
            return true;
        }
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.process.lock().is_alive()
    }

    /// Asks mpv to quit, then escalates to SIGTERM and SIGKILL. The socket directory is
    /// removed in every case.
    pub fn stop(&self) {
        let mut process = self.process.lock();
        if let Some(mut child) = process.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                if let Some(socket) = process.socket_path() {
                    if let Err(e) = self.exchange(&socket, &Request::Quit) {
                        debug!("Quit command failed: {e}");
                    }
                }
                if !wait_for_exit(&mut child, self.options.quit_grace) {
                    warn!(pid = child.id(), "Player ignored quit, terminating");
                    terminate(&child);
                    if !wait_for_exit(&mut child, self.options.term_grace) {
                        warn!(pid = child.id(), "Player ignored SIGTERM, killing");
                        if let Err(e) = child.kill() {
                            debug!(pid = child.id(), "SIGKILL failed: {e}");
                        }
                        if let Err(e) = child.wait() {
                            debug!(pid = child.id(), "Could not reap player: {e}");
                        }
                    }
                }
            }
            info!(pid = child.id(), "Player stopped");
        }
        process.cleanup_socket();
    }

    // --- Commands ---

    /// Replaces the current file. A successful load also clears any pause.
    pub fn load_file(&self, path: &Path) -> bool {
        if !self.ensure_running() {
            return false;
        }
        match self.command(&Request::LoadFile(path)) {
            Some(reply) if reply.is_success() => {
                self.set_property("pause", false);
                true
            }
            Some(reply) => {
                warn!(path = %path.display(), "Player refused file: {:?}", reply.error);
                false
            }
            None => false,
        }
    }

    pub fn stop_playback(&self) {
        self.command(&Request::Stop);
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> bool {
        self.command(&Request::SetProperty(name, value.into()))
            .is_some_and(|reply| reply.is_success())
    }

    /// `None` when the player could not be asked or did not answer with a boolean.
    pub fn get_property_bool(&self, name: &str) -> Option<bool> {
        self.command(&Request::GetProperty(name))
            .filter(Reply::is_success)
            .and_then(|reply| reply.data)
            .and_then(|data| data.as_bool())
    }

    /// Polls until the player is done with the current file. Returns `false` as soon as
    /// `should_abort` says so; playback keeps running in that case.
    pub fn wait_until_idle(&self, should_abort: impl Fn() -> bool) -> bool {
        loop {
            if should_abort() {
                return false;
            }
            if !self.is_running() {
                return true;
            }
            if self.get_property_bool("idle-active") == Some(true) {
                return true;
            }
            if self.get_property_bool("eof-reached") == Some(true) {
                // Reset keep-open state for the next file
                self.stop_playback();
                return true;
            }
            // With keep-open, a paused player has finished its file
            if self.get_property_bool("pause") == Some(true) {
                return true;
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    // --- IPC ---

    fn command(&self, request: &Request<'_>) -> Option<Reply> {
        let process = self.process.lock();
        let socket = process.socket_path()?;
        match self.exchange(&socket, request) {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(command = ?request, "Player unavailable: {e}");
                None
            }
        }
    }

    // Caller holds the process lock
    fn exchange(&self, socket: &Path, request: &Request<'_>) -> Result<Reply> {
        if !socket.exists() {
            return Err(Error::Ipc("socket missing".into()));
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let stream = UnixStream::connect(socket)?;
        stream.set_read_timeout(Some(IPC_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IPC_IO_TIMEOUT))?;

        let mut line = serde_json::to_vec(&Envelope { command: request.args(), request_id })?;
        line.push(b'\n');
        (&stream).write_all(&line)?;

        let mut reader = BufReader::new(&stream);
        loop {
            let mut text = String::new();
            if reader.read_line(&mut text)? == 0 {
                return Err(Error::Ipc("connection closed before reply".into()));
            }
            let Ok(reply) = serde_json::from_str::<Reply>(&text) else {
                debug!("Ignoring malformed player line: {}", text.trim_end());
                continue;
            };
            // Events are broadcast to every client, skip them
            if reply.event.is_some() {
                continue;
            }
            if reply.request_id.is_none_or(|id| id == request_id) {
                return Ok(reply);
            }
        }
    }

    fn wait_for_socket(&self) -> bool {
        let deadline = Instant::now() + SOCKET_READY_TIMEOUT;
        while Instant::now() < deadline {
            {
                let mut process = self.process.lock();
                if process.socket_path().is_some_and(|path| path.exists()) {
                    return true;
                }
                if !process.is_alive() {
                    error!("{} exited before opening its IPC socket", self.options.binary);
                    return false;
                }
            }
            thread::sleep(SOCKET_READY_STEP);
        }
        error!("{} did not create its IPC socket in time", self.options.binary);
        false
    }
}

impl Drop for MpvController {
    fn drop(&mut self) {
        if self.process.get_mut().child.is_some() {
            self.stop();
        }
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

fn terminate(child: &Child) {
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid = child.id(), "SIGTERM failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;

    pub type Log = Arc<Mutex<Vec<Vec<Value>>>>;

    /// Stand-in player binary: appends its arguments to `fake-mpv.args` and stays alive.
    pub fn fake_binary(dir: &Path) -> PathBuf {
        let path = dir.join("fake-mpv");
        let script = format!("#!/bin/sh\necho \"$@\" >> \"{}\"\nexec sleep 30\n", dir.join("fake-mpv.args").display());
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Argument lines of every fake player started in `dir`, oldest first.
    pub fn launches(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("fake-mpv.args"))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Serves the mpv IPC protocol on every socket directory that appears in `runtime`,
    /// answering each command with `respond` and logging it. Stops watching once
    /// `runtime` is gone.
    pub fn serve(runtime: PathBuf, respond: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Log {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);
        let seen = log.clone();
        thread::spawn(move || {
            let mut served: Vec<PathBuf> = Vec::new();
            while let Ok(entries) = std::fs::read_dir(&runtime) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !entry.file_name().to_string_lossy().starts_with("signage-mpv-") || served.contains(&path) {
                        continue;
                    }
                    let Ok(listener) = UnixListener::bind(path.join("socket")) else { continue };
                    served.push(path);
                    let (seen, respond) = (seen.clone(), respond.clone());
                    thread::spawn(move || answer(listener, &seen, respond.as_ref()));
                }
                thread::sleep(Duration::from_millis(10));
            }
        });
        log
    }

    fn answer(listener: UnixListener, seen: &Log, respond: &dyn Fn(&[Value]) -> Value) {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let request: Value = serde_json::from_str(&line).unwrap();
                let command = request["command"].as_array().cloned().unwrap_or_default();
                seen.lock().push(command.clone());
                let reply = json!({
                    "error": "success",
                    "data": respond(&command),
                    "request_id": request["request_id"],
                });
                // An unrelated event first, like a real player would interleave
                if writeln!(writer, "{}", json!({"event": "playback-restart"})).is_err()
                    || writeln!(writer, "{reply}").is_err()
                {
                    break;
                }
                line.clear();
            }
        }
    }

    pub fn options(dir: &Path) -> MpvOptions {
        MpvOptions {
            binary: fake_binary(dir).to_string_lossy().into_owned(),
            extra_args: Vec::new(),
            runtime_dir: Some(dir.to_path_buf()),
            quit_grace: Duration::from_millis(200),
            term_grace: Duration::from_millis(500),
        }
    }

    pub fn socket_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("signage-mpv-"))
            .count()
    }

    #[test]
    fn abort_leaves_the_player_running() {
        let dir = tempfile::tempdir().unwrap();
        serve(dir.path().to_path_buf(), |_| json!(false));
        let controller = MpvController::new(None, options(dir.path()));
        assert!(controller.start());

        assert!(!controller.wait_until_idle(|| true));
        assert!(controller.is_running());

        controller.stop();
        assert!(!controller.is_running());
        assert_eq!(socket_dirs(dir.path()), 0);
    }

    #[test]
    fn idle_player_ends_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        serve(dir.path().to_path_buf(), |command| {
            json!(command.get(1) == Some(&json!("idle-active")))
        });
        let controller = MpvController::new(None, options(dir.path()));
        assert!(controller.start());
        assert!(controller.wait_until_idle(|| false));
        controller.stop();
    }

    #[test]
    fn load_file_clears_pause() {
        let dir = tempfile::tempdir().unwrap();
        let log = serve(dir.path().to_path_buf(), |_| Value::Null);
        let geometry = Geometry { width: 576, height: 1080, x: 0, y: 0 };
        let controller = MpvController::new(Some(geometry), options(dir.path()));
        assert!(controller.start());
        assert!(controller.load_file(Path::new("/media/a.jpg")));
        assert_eq!(controller.get_property_bool("pause"), None);
        controller.stop();

        let log = log.lock();
        assert_eq!(log[0], vec![json!("loadfile"), json!("/media/a.jpg"), json!("replace")]);
        assert_eq!(log[1], vec![json!("set_property"), json!("pause"), json!(false)]);
        assert_eq!(log.last().unwrap(), &vec![json!("quit")]);
    }

    #[test]
    fn missing_binary_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let options = MpvOptions {
            binary: dir.path().join("no-such-player").to_string_lossy().into_owned(),
            runtime_dir: Some(dir.path().to_path_buf()),
            ..MpvOptions::default()
        };
        let controller = MpvController::new(None, options);
        assert!(!controller.start());
        assert!(!controller.is_running());
        assert!(!controller.load_file(Path::new("/media/a.jpg")));
        assert_eq!(socket_dirs(dir.path()), 0);
    }

    #[test]
    fn commands_without_a_player_are_harmless() {
        let controller = MpvController::new(None, MpvOptions::default());
        assert!(!controller.set_property("pause", true));
        assert_eq!(controller.get_property_bool("idle-active"), None);
        controller.stop_playback();
        controller.stop();
    }
}
