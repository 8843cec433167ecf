//! Interfaces of the systems the companion drives: the media server that
//! owns metadata and play queues, the local player, and the user-facing
//! notification surface.

use tracing::error;

use crate::errors::Result;
use crate::model::{MediaDescriptor, MediaKind, PlayerStatus, RemoteQueue};
use crate::playqueue::PlayQueue;

/// Read access to the media server. Failures surface as `None`.
pub trait MediaServerApi: Send + Sync {
    fn fetch_metadata(&self, key: &str) -> Option<MediaDescriptor>;

    fn fetch_children(&self, plex_id: &str) -> Option<Vec<MediaDescriptor>>;

    fn fetch_remote_queue(&self, play_queue_id: &str) -> Option<RemoteQueue>;
}

/// How a single item should be started.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackOptions {
    pub token: Option<String>,
    pub resume: bool,
    pub offset_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    SkipNext,
    SkipPrevious,
    StepForward,
    StepBack,
}

impl TransportCommand {
    /// Parses the last segment of a `/player/playback/...` route.
    pub fn from_route(name: &str) -> Option<Self> {
        match name {
            "play" => Some(TransportCommand::Play),
            "pause" => Some(TransportCommand::Pause),
            "stop" => Some(TransportCommand::Stop),
            "skipNext" => Some(TransportCommand::SkipNext),
            "skipPrevious" => Some(TransportCommand::SkipPrevious),
            "stepForward" => Some(TransportCommand::StepForward),
            "stepBack" => Some(TransportCommand::StepBack),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavigationCommand {
    Up,
    Down,
    Left,
    Right,
    Select,
    Home,
    Back,
}

impl NavigationCommand {
    /// Parses the last segment of a `/player/navigation/...` route.
    pub fn from_route(name: &str) -> Option<Self> {
        match name {
            "moveUp" => Some(NavigationCommand::Up),
            "moveDown" => Some(NavigationCommand::Down),
            "moveLeft" => Some(NavigationCommand::Left),
            "moveRight" => Some(NavigationCommand::Right),
            "select" => Some(NavigationCommand::Select),
            "home" => Some(NavigationCommand::Home),
            "back" => Some(NavigationCommand::Back),
            _ => None,
        }
    }
}

/// The local playback engine.
pub trait Player: Send + Sync {
    /// Starts `queue` at its cursor, `start_offset_secs` into the first item.
    fn play(&self, queue: &PlayQueue, start_offset_secs: Option<f64>) -> Result<()>;

    fn play_item(&self, item: &MediaDescriptor, options: &PlaybackOptions) -> Result<()>;

    fn navigate_node(&self, key: &str, offset_ms: u64) -> Result<()>;

    fn set_audio_stream(&self, index: usize) -> Result<()>;

    /// `None` disables subtitles.
    fn set_subtitle_stream(&self, index: Option<usize>) -> Result<()>;

    /// Cursor of the player's playlist for `kind`, if it is active.
    fn position(&self, kind: MediaKind) -> Option<usize>;

    fn status(&self, kind: MediaKind) -> Option<PlayerStatus>;

    fn transport(&self, kind: Option<MediaKind>, command: TransportCommand) -> Result<()>;

    fn seek(&self, kind: Option<MediaKind>, offset_ms: u64) -> Result<()>;

    fn set_volume(&self, volume: u8) -> Result<()>;

    fn navigate(&self, command: NavigationCommand) -> Result<()>;
}

/// User-visible error reporting.
pub trait Notifier: Send + Sync {
    fn notify_error(&self, title: &str, message: &str);
}

/// Notifier that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_error(&self, title: &str, message: &str) {
        error!(title, "{}", message);
    }
}
