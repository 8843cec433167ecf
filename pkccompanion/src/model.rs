//! Plain data types shared by the companion components.

use std::fmt;

/// The three queue families a player keeps side by side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Photo,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Video, MediaKind::Audio, MediaKind::Photo];

    /// Maps a media server item type (`movie`, `track`, ...) to its kind.
    pub fn from_plex_type(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "movie" | "episode" | "clip" | "video" | "show" | "season" => Some(MediaKind::Video),
            "track" | "album" | "artist" | "music" | "audio" => Some(MediaKind::Audio),
            "photo" | "photoalbum" | "picture" => Some(MediaKind::Photo),
            _ => None,
        }
    }

    /// Name used in timeline documents and `type` parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "music",
            MediaKind::Photo => "photo",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

impl RepeatMode {
    /// Parses the numeric `repeat` parameter (0, 1, 2).
    pub fn from_param(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(RepeatMode::Off),
            "1" => Some(RepeatMode::One),
            "2" => Some(RepeatMode::All),
            _ => None,
        }
    }

    pub fn as_param(&self) -> &'static str {
        match self {
            RepeatMode::Off => "0",
            RepeatMode::One => "1",
            RepeatMode::All => "2",
        }
    }
}

/// Media server `streamType` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
}

impl StreamType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(StreamType::Video),
            2 => Some(StreamType::Audio),
            3 => Some(StreamType::Subtitle),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Buffering,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Buffering => "buffering",
        }
    }
}

/// What the player reports for one kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub time_ms: u64,
    pub duration_ms: Option<u64>,
    pub volume: Option<u8>,
    pub shuffled: bool,
    pub repeat: RepeatMode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub stream_type: StreamType,
    pub external: bool,
    pub selected: bool,
    pub language: Option<String>,
}

/// Metadata of one item as served by the media server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaDescriptor {
    pub plex_id: String,
    pub plex_type: String,
    pub title: String,
    pub key: String,
    pub duration_ms: Option<u64>,
    /// Direct-play part path, if any.
    pub file: Option<String>,
    pub streams: Vec<MediaStream>,
    pub play_queue_item_id: Option<String>,
}

impl MediaDescriptor {
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_plex_type(&self.plex_type)
    }

    pub fn is_album(&self) -> bool {
        self.plex_type.eq_ignore_ascii_case("album")
    }
}

/// A play queue downloaded from the media server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteQueue {
    pub id: String,
    pub version: Option<u64>,
    pub selected_item_id: Option<String>,
    pub source_uri: Option<String>,
    pub shuffled: bool,
    pub items: Vec<MediaDescriptor>,
}

impl RemoteQueue {
    /// Kind implied by the items, taken from the first item.
    pub fn implied_kind(&self) -> Option<MediaKind> {
        self.items.first().and_then(MediaDescriptor::kind)
    }
}
