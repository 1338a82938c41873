use std::time::Duration;

pub const DEFAULT_WIDTH: u32 = 1920;                 // Fallback display resolution
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const MIN_WIDTH: u32 = 320;                      // Smallest accepted display box
pub const MIN_HEIGHT: u32 = 240;

pub const MIN_IMAGE_DURATION: f64 = 1.0;             // Shortest still hold (seconds)
pub const MIN_REFRESH_INTERVAL: u64 = 5;             // Idle/info re-evaluation floor (seconds)
pub const MIN_TRANSITION: f64 = 0.2;                 // Transition clip length bounds (seconds)
pub const MAX_TRANSITION: f64 = 10.0;
pub const MIN_SPLIT_RATIO: u32 = 10;                 // Percent of the width given to the left side
pub const MAX_SPLIT_RATIO: u32 = 90;

pub const SOCKET_READY_TIMEOUT: Duration = Duration::from_secs(5);
pub const SOCKET_READY_STEP: Duration = Duration::from_millis(100);
pub const IPC_IO_TIMEOUT: Duration = Duration::from_secs(1);
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const QUIT_GRACE: Duration = Duration::from_secs(5);   // mpv "quit" -> SIGTERM
pub const TERM_GRACE: Duration = Duration::from_secs(3);   // SIGTERM -> SIGKILL

pub const EMPTY_PASS_BACKOFF: Duration = Duration::from_secs(1);
pub const ONE_SHOT_POLL: Duration = Duration::from_millis(100);
pub const RENDER_POLL: Duration = Duration::from_millis(100);     // Transition render cancel check

pub const JPEG_QUALITY: u8 = 90;
pub const INFO_WIDTH: u32 = 1280;
pub const INFO_HEIGHT: u32 = 720;
