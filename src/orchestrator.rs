//! Top-level playback state machine.
//!
//! One control thread re-reads the configuration every cycle and picks a mode: the
//! manual info screen, splitscreen with one worker per side, or a sequential fullscreen
//! pass. Reload, override changes and stop cancel the current cycle token, which wakes
//! every wait in the cycle at once.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::backend::{Hold, OneShot, PlayOutcome, Player};
use crate::cancel::CancelToken;
use crate::config::{AppConfig, ConfigSource};
use crate::constants::*;
use crate::info::{self, InfoScreen};
use crate::layout::{Geometry, Resolution, split_geometry, target_box};
use crate::library::{MediaResolver, PlaylistItem, PlaylistProvider};
use crate::mpv::{MpvController, MpvOptions};
use crate::preprocess::{Prepared, prepare_image};
use crate::state::{MediaKind, PlaybackRecord, ShownMedia, Side, SideState, StateStore, Status};
use crate::transition::{TransitionOutcome, TransitionRenderer, remove_clip};

/// Where one side plays and how its writes are projected.
#[derive(Debug, Clone, Copy)]
struct Placement {
    side: Side,
    geometry: Option<Geometry>,
    target: (u32, u32),
    /// Fullscreen playback, Secondary is cleared on every Primary write
    single: bool,
}

impl Placement {
    fn fullscreen(resolution: Resolution) -> Self {
        Self {
            side: Side::Primary,
            geometry: None,
            target: target_box(resolution, None, Side::Primary),
            single: true,
        }
    }

    fn split(resolution: Resolution, ratio: u32, side: Side) -> Self {
        Self {
            side,
            geometry: Some(split_geometry(resolution, ratio, side)),
            target: target_box(resolution, Some(ratio), side),
            single: false,
        }
    }
}

/// Status projection for one still.
#[derive(Debug, Clone, Copy)]
struct Still {
    seconds: f64,
    start: Status,
    end: Status,
    info_screen: bool,
}

impl Still {
    fn slide(seconds: u64) -> Self {
        Self { seconds: seconds as f64, start: Status::Playing, end: Status::Completed, info_screen: false }
    }

    fn info(hold: Duration) -> Self {
        Self { seconds: hold.as_secs_f64(), start: Status::Info, end: Status::Info, info_screen: true }
    }
}

fn discard(prepared: Prepared) {
    if prepared.temporary {
        if let Err(e) = fs::remove_file(&prepared.path) {
            debug!(path = %prepared.path.display(), "Could not remove frame: {e}");
        }
    }
}

/// Joins `handle` to completion. Every wait inside a cycle is cancellable, so once the
/// cycle token fires this returns promptly.
fn join(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        error!("{name} thread panicked");
    }
}

struct Shared {
    config: Arc<dyn ConfigSource>,
    playlists: Arc<dyn PlaylistProvider>,
    resolver: Arc<dyn MediaResolver>,
    store: Arc<StateStore>,
    mpv: MpvOptions,
    running: AtomicBool,
    info_manual: AtomicBool,
    cycle: Mutex<CancelToken>,
    controllers: Mutex<[Option<Arc<MpvController>>; 2]>,
    previous: Mutex<[Option<Prepared>; 2]>,
    scratch: Mutex<Option<TempDir>>,
    info: Mutex<Option<(PathBuf, InfoScreen)>>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    service: Mutex<CancelToken>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        playlists: Arc<dyn PlaylistProvider>,
        resolver: Arc<dyn MediaResolver>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                playlists,
                resolver,
                store,
                mpv: MpvOptions::default(),
                running: AtomicBool::new(false),
                info_manual: AtomicBool::new(false),
                cycle: Mutex::new(CancelToken::new()),
                controllers: Mutex::new([None, None]),
                previous: Mutex::new([None, None]),
                scratch: Mutex::new(None),
                info: Mutex::new(None),
            }),
            service: Mutex::new(CancelToken::new()),
            control: Mutex::new(None),
        }
    }

    /// Launch options for the persistent players. Only takes effect before `start`.
    pub fn with_mpv_options(mut self, options: MpvOptions) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.mpv = options;
        }
        self
    }

    /// Starts the control thread. Does nothing when already running.
    pub fn start(&self) {
        let mut control = self.control.lock();
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stale) = control.take() {
            join(stale, "control");
        }

        self.shared.open_scratch();
        self.shared.store.reset(self.shared.info_manual.load(Ordering::SeqCst));

        let service = CancelToken::new();
        *self.service.lock() = service.clone();
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("signage-control".to_string())
            .spawn(move || shared.control_loop(service))
        {
            Ok(handle) => {
                info!("Playback service started");
                *control = Some(handle);
            }
            Err(e) => {
                error!("Could not spawn control thread: {e}");
                self.shared.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Cancels all work, tears down every player and records both sides as stopped.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.shared.running.store(false, Ordering::SeqCst);
        self.service.lock().cancel();
        self.shared.cycle.lock().cancel();
        if let Some(handle) = control.take() {
            join(handle, "control");
        }
        self.shared.teardown();
        self.shared.store.reset(self.shared.info_manual.load(Ordering::SeqCst));
        info!("Playback service stopped");
    }

    /// Ends the current cycle; the next one re-reads the configuration.
    pub fn reload(&self) {
        info!("Reloading playback");
        self.shared.cycle.lock().cancel();
    }

    pub fn set_info_override(&self, enabled: bool) {
        info!(enabled, "Manual info screen");
        self.shared.info_manual.store(enabled, Ordering::SeqCst);
        self.shared.store.update(|record| record.info_manual = enabled);
        self.reload();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlaybackRecord {
        self.shared.store.snapshot()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

impl Shared {
    fn control_loop(self: Arc<Self>, service: CancelToken) {
        loop {
            let cycle = self.begin_cycle();
            if service.is_cancelled() {
                break;
            }
            let config = self.config.snapshot();
            self.run_cycle(&config, &cycle);
        }
        debug!("Control loop finished");
    }

    fn begin_cycle(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.cycle.lock() = token.clone();
        token
    }

    fn run_cycle(self: &Arc<Self>, config: &AppConfig, cycle: &CancelToken) {
        if self.info_manual.load(Ordering::SeqCst) {
            self.stop_controller(Side::Secondary);
            self.info_or_idle(config, true, cycle);
            return;
        }

        if let Some(ratio) = config.playback.split_ratio() {
            let (left, right) = self.playlists.split_playlists(config);
            if left.is_empty() && right.is_empty() {
                debug!("Both splitscreen playlists are empty");
                self.stop_controller(Side::Primary);
                self.stop_controller(Side::Secondary);
                self.info_or_idle(config, false, cycle);
            } else {
                self.run_split(config, ratio, left, right, cycle);
            }
            return;
        }

        self.stop_controller(Side::Secondary);
        let playlist = self.playlists.playlist(config);
        if playlist.is_empty() {
            self.info_or_idle(config, false, cycle);
            return;
        }
        let placement = Placement::fullscreen(config.playback.display_resolution);
        if self.run_pass(config, &playlist, placement, cycle) == 0 {
            debug!("Nothing could be shown this pass");
            cycle.sleep(EMPTY_PASS_BACKOFF);
        }
    }

    fn run_split(
        self: &Arc<Self>,
        config: &AppConfig,
        ratio: u32,
        left: Vec<PlaylistItem>,
        right: Vec<PlaylistItem>,
        cycle: &CancelToken,
    ) {
        let resolution = config.playback.display_resolution;
        let mut workers = Vec::new();
        for (side, items) in [(Side::Primary, left), (Side::Secondary, right)] {
            let placement = Placement::split(resolution, ratio, side);
            if items.is_empty() {
                self.stop_controller(side);
                self.publish(placement, false, |state| *state = SideState::idle());
                continue;
            }
            let shared = Arc::clone(self);
            let config = config.clone();
            let cancel = cycle.clone();
            let spawned = thread::Builder::new()
                .name(format!("signage-{}", side.as_str()))
                .spawn(move || shared.side_loop(&config, &items, placement, &cancel));
            match spawned {
                Ok(handle) => workers.push((side, handle)),
                Err(e) => error!(side = side.as_str(), "Could not spawn worker: {e}"),
            }
        }

        cycle.wait();
        // A side never gets a second worker while its previous one is still winding down
        for (side, handle) in workers {
            join(handle, side.as_str());
        }
    }

    /// Cycles one side's playlist until the cycle ends.
    fn side_loop(&self, config: &AppConfig, items: &[PlaylistItem], placement: Placement, cancel: &CancelToken) {
        info!(side = placement.side.as_str(), items = items.len(), geometry = ?placement.geometry, "Side worker started");
        while !cancel.is_cancelled() {
            if self.run_pass(config, items, placement, cancel) == 0 && !cancel.sleep(EMPTY_PASS_BACKOFF) {
                break;
            }
        }
        debug!(side = placement.side.as_str(), "Side worker finished");
    }

    /// Plays `items` once; returns how many were shown.
    fn run_pass(&self, config: &AppConfig, items: &[PlaylistItem], placement: Placement, cancel: &CancelToken) -> usize {
        let mut shown = 0;
        for item in items {
            if cancel.is_cancelled() {
                break;
            }
            if self.play_item(config, item, placement, cancel) {
                shown += 1;
            }
        }
        shown
    }

    fn play_item(&self, config: &AppConfig, item: &PlaylistItem, placement: Placement, cancel: &CancelToken) -> bool {
        let path = match self.resolver.resolve(config, &item.source, &item.path) {
            Ok(path) => path,
            Err(e) => {
                warn!(side = placement.side.as_str(), item = %item.label(), "Skipping: {e}");
                return false;
            }
        };
        let media = ShownMedia {
            label: item.label(),
            source: Some(item.source.clone()),
            media_path: Some(item.path.clone()),
            kind: item.kind,
            preview: path.clone(),
        };
        match item.kind {
            MediaKind::Video => self.play_video(config, &path, media, placement, cancel),
            MediaKind::Image => {
                let seconds = item.duration.unwrap_or(config.playback.image_duration);
                self.show_image(config, &path, media, Still::slide(seconds), placement, cancel)
            }
            MediaKind::Info => {
                warn!(item = %item.label(), "Info entries are not playable");
                false
            }
        }
    }

    fn play_video(
        &self,
        config: &AppConfig,
        path: &Path,
        media: ShownMedia,
        placement: Placement,
        cancel: &CancelToken,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(mut player) = self.player(config, placement, MediaKind::Video) else {
            self.publish(placement, false, |state| *state = SideState::idle());
            return false;
        };
        info!(side = placement.side.as_str(), "Playing video {}", media.label);
        self.publish(placement, false, |state| *state = SideState::showing(Status::Playing, &media));
        let outcome = player.play(path, Hold::UntilEnd, cancel);
        if outcome == PlayOutcome::Failed {
            warn!(side = placement.side.as_str(), "Could not play {}", path.display());
        }
        self.publish(placement, false, |state| state.finish(Status::Completed, &media));
        outcome != PlayOutcome::Failed
    }

    fn show_image(
        &self,
        config: &AppConfig,
        path: &Path,
        media: ShownMedia,
        still: Still,
        placement: Placement,
        cancel: &CancelToken,
    ) -> bool {
        let playback = &config.playback;
        let side = placement.side;
        let Some(mut player) = self.player(config, placement, MediaKind::Image) else {
            self.publish(placement, false, |state| *state = SideState::idle());
            return false;
        };

        let scratch = self.scratch_dir();
        let prepared = prepare_image(
            path,
            placement.target,
            playback.image_rotation,
            playback.image_fit,
            scratch.as_deref(),
            side,
        );

        let previous = self.previous.lock()[side.index()].take();
        let transition = match &previous {
            Some(previous) => {
                let mut clip_player = self.transition_player(config, placement, &player);
                TransitionRenderer::new(playback.transition_tool.as_str()).run(
                    Some(&previous.path),
                    &prepared.path,
                    playback.transition_type,
                    playback.transition_duration,
                    scratch.as_deref(),
                    side,
                    &mut clip_player,
                    cancel,
                )
            }
            None => TransitionOutcome::default(),
        };
        if let Some(previous) = previous {
            if previous.path != prepared.path {
                discard(previous);
            }
        }
        if cancel.is_cancelled() {
            self.remember(side, prepared);
            return false;
        }

        let seconds = (still.seconds - transition.consumed.as_secs_f64()).max(MIN_IMAGE_DURATION);
        let shown = ShownMedia { preview: prepared.path.clone(), ..media };
        debug!(side = side.as_str(), seconds, "Showing {}", shown.label);
        self.publish(placement, still.info_screen, |state| *state = SideState::showing(still.start, &shown));

        player.set_image_duration(seconds);
        let loaded = player.load(&prepared.path);
        if let Some(clip) = &transition.clip {
            remove_clip(clip);
        }
        if !loaded {
            warn!(side = side.as_str(), "Could not display {}", prepared.path.display());
            self.publish(placement, false, |state| *state = SideState::idle());
            self.remember(side, prepared);
            return false;
        }

        let outcome = player.hold(Hold::For(Duration::from_secs_f64(seconds)), cancel);
        if outcome == PlayOutcome::Completed && still.end == Status::Info {
            player.pause();
        }
        self.publish(placement, still.info_screen, |state| state.finish(still.end, &shown));
        self.remember(side, prepared);
        outcome != PlayOutcome::Failed
    }

    /// Shows the info screen when enabled, otherwise parks Primary as idle.
    fn info_or_idle(&self, config: &AppConfig, manual: bool, cycle: &CancelToken) {
        let playback = &config.playback;
        if playback.info_screen_enabled && self.show_info(config, manual, cycle) {
            return;
        }
        if cycle.is_cancelled() {
            return;
        }
        let info_manual = self.info_manual.load(Ordering::SeqCst);
        self.store.update(|record| {
            record.primary = SideState::idle();
            record.secondary = SideState::stopped();
            record.info_screen = false;
            record.info_manual = info_manual;
        });
        cycle.sleep(playback.refresh());
    }

    fn show_info(&self, config: &AppConfig, manual: bool, cycle: &CancelToken) -> bool {
        let rendered = {
            let mut slot = self.info.lock();
            let dir = config.data_dir.join("info");
            let screen = match slot.take() {
                Some((cached, screen)) if cached == dir => screen,
                _ => InfoScreen::new(&dir),
            };
            let rendered = screen.render(&info::hostname(), &info::ip_addresses(), manual, &info::details(config));
            *slot = Some((dir, screen));
            rendered
        };
        let path = match rendered {
            Ok(path) => path,
            Err(e) => {
                error!("Could not render info screen: {e}");
                return false;
            }
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let media = ShownMedia {
            label: format!("system/{name}"),
            source: Some("system".to_string()),
            media_path: Some(name),
            kind: MediaKind::Info,
            preview: path.clone(),
        };
        let placement = Placement::fullscreen(config.playback.display_resolution);
        self.show_image(config, &path, media, Still::info(config.playback.refresh()), placement, cycle)
    }

    // --- Players ---

    fn player(&self, config: &AppConfig, placement: Placement, kind: MediaKind) -> Option<Player> {
        let playback = &config.playback;
        let (program, args) = match kind {
            MediaKind::Video => (&playback.video_player, &playback.video_player_args),
            MediaKind::Image | MediaKind::Info => (&playback.image_viewer, &playback.image_viewer_args),
        };
        if program == "mpv" {
            self.controller(config, placement).map(Player::Persistent)
        } else {
            Some(Player::OneShot(OneShot::new(program.clone(), args.clone())))
        }
    }

    /// The persistent player when there is one, otherwise a single-use mpv.
    fn transition_player(&self, config: &AppConfig, placement: Placement, player: &Player) -> Player {
        match player {
            Player::Persistent(controller) => Player::Persistent(Arc::clone(controller)),
            Player::OneShot(_) => {
                let mut args: Vec<String> = ["--no-terminal", "--quiet", "--loop-file=no", "--force-window=yes", "--keep-open=no"]
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                args.extend(config.playback.mpv_args());
                args.push(match placement.geometry {
                    Some(geometry) => format!("--geometry={geometry}"),
                    None => "--fullscreen".to_string(),
                });
                Player::OneShot(OneShot::new(self.mpv.binary.clone(), args))
            }
        }
    }

    /// Running controller for the placement, replacing one with another geometry.
    fn controller(&self, config: &AppConfig, placement: Placement) -> Option<Arc<MpvController>> {
        let side = placement.side;
        let extra_args = config.playback.mpv_args();
        let (controller, replaced) = {
            let mut controllers = self.controllers.lock();
            let slot = &mut controllers[side.index()];
            let stale = slot
                .as_ref()
                .is_some_and(|c| c.geometry() != placement.geometry || c.extra_args() != extra_args.as_slice());
            let replaced = if stale { slot.take() } else { None };
            let controller = slot.get_or_insert_with(|| {
                let options = MpvOptions { extra_args, ..self.mpv.clone() };
                Arc::new(MpvController::new(placement.geometry, options))
            });
            (Arc::clone(controller), replaced)
        };
        if let Some(old) = replaced {
            info!(side = side.as_str(), geometry = ?placement.geometry, "Player placement changed, restarting");
            old.stop();
            self.forget_previous(side);
        }

        if controller.ensure_running() {
            return Some(controller);
        }
        error!(side = side.as_str(), "Player unavailable");
        let mut controllers = self.controllers.lock();
        let slot = &mut controllers[side.index()];
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &controller)) {
            slot.take();
        }
        None
    }

    fn stop_controller(&self, side: Side) {
        let controller = self.controllers.lock()[side.index()].take();
        if let Some(controller) = controller {
            controller.stop();
        }
        self.forget_previous(side);
    }

    // --- Bookkeeping ---

    /// Writes one side's state; single mode clears Secondary in the same write.
    fn publish(&self, placement: Placement, info_screen: bool, change: impl FnOnce(&mut SideState)) {
        let info_manual = self.info_manual.load(Ordering::SeqCst);
        self.store.update(|record| {
            change(record.side_mut(placement.side));
            if placement.single && placement.side == Side::Primary {
                record.secondary = SideState::stopped();
            }
            record.info_screen = info_screen;
            record.info_manual = info_manual;
        });
    }

    fn remember(&self, side: Side, prepared: Prepared) {
        let old = self.previous.lock()[side.index()].replace(prepared);
        if let Some(old) = old {
            discard(old);
        }
    }

    fn forget_previous(&self, side: Side) {
        let old = self.previous.lock()[side.index()].take();
        if let Some(old) = old {
            discard(old);
        }
    }

    fn open_scratch(&self) {
        let dir = tempfile::Builder::new().prefix("signage-frames-").tempdir();
        *self.scratch.lock() = match dir {
            Ok(dir) => {
                debug!(path = %dir.path().display(), "Scratch directory ready");
                Some(dir)
            }
            Err(e) => {
                warn!("No scratch directory, images are shown unprocessed: {e}");
                None
            }
        };
    }

    fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch.lock().as_ref().map(|dir| dir.path().to_path_buf())
    }

    fn teardown(&self) {
        for side in Side::ALL {
            self.stop_controller(side);
        }
        if let Some(dir) = self.scratch.lock().take() {
            if let Err(e) = dir.close() {
                warn!("Could not remove scratch directory: {e}");
            }
        }
    }
}
