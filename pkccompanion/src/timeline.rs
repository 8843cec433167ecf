//! Timeline documents pushed to subscribers and served on poll.

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::collaborators::Player;
use crate::discovery::ServerAddress;
use crate::model::{MediaKind, PlaybackState, StreamType};
use crate::playqueue::PlayQueues;

const CONTROLLABLE: &str =
    "playPause,play,stop,skipPrevious,skipNext,volume,stepBack,stepForward,seekTo,subtitleStream,audioStream";

/// What a subscriber wants to receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimelineContent {
    #[default]
    All,
    Kind(MediaKind),
    Navigation,
}

impl TimelineContent {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("all") => TimelineContent::All,
            Some("navigation") => TimelineContent::Navigation,
            Some(other) => MediaKind::from_plex_type(other)
                .map(TimelineContent::Kind)
                .unwrap_or_default(),
        }
    }

    fn includes(&self, kind: MediaKind) -> bool {
        match self {
            TimelineContent::All => true,
            TimelineContent::Kind(k) => *k == kind,
            TimelineContent::Navigation => false,
        }
    }
}

/// State of one media kind at capture time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimelineEntry {
    pub kind: Option<MediaKind>,
    pub state: PlaybackState,
    pub time_ms: u64,
    pub duration_ms: Option<u64>,
    pub rating_key: Option<String>,
    pub key: Option<String>,
    pub play_queue_id: Option<String>,
    pub play_queue_version: Option<u64>,
    pub play_queue_item_id: Option<String>,
    pub volume: Option<u8>,
    pub shuffled: bool,
    pub repeat: &'static str,
    pub audio_stream_id: Option<String>,
    pub subtitle_stream_id: Option<String>,
    pub token: Option<String>,
}

/// Read-only picture of every queue and the player, taken once per notify.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimelineSnapshot {
    pub entries: Vec<TimelineEntry>,
    pub server: Option<ServerAddress>,
}

impl TimelineSnapshot {
    pub fn capture(
        queues: &PlayQueues,
        player: &dyn Player,
        server: Option<&ServerAddress>,
    ) -> Self {
        let entries = MediaKind::ALL
            .into_iter()
            .map(|kind| capture_kind(queues, player, kind))
            .collect();
        Self {
            entries,
            server: server.cloned(),
        }
    }

    /// Snapshot reporting every kind as stopped.
    pub fn stopped(server: Option<&ServerAddress>) -> Self {
        Self {
            entries: MediaKind::ALL
                .into_iter()
                .map(|kind| TimelineEntry {
                    kind: Some(kind),
                    repeat: "0",
                    ..TimelineEntry::default()
                })
                .collect(),
            server: server.cloned(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.entries.iter().any(|e| e.state != PlaybackState::Stopped)
    }

    fn location(&self) -> &'static str {
        let active = |kind| {
            self.entries
                .iter()
                .any(|e| e.kind == Some(kind) && e.state != PlaybackState::Stopped)
        };
        if active(MediaKind::Video) {
            "fullScreenVideo"
        } else if active(MediaKind::Audio) {
            "fullScreenMusic"
        } else if active(MediaKind::Photo) {
            "fullScreenPhoto"
        } else {
            "navigation"
        }
    }

    /// Renders the `MediaContainer` document for one recipient.
    pub fn to_xml(&self, command_id: Option<&str>, content: TimelineContent) -> String {
        let mut root = Element::new("MediaContainer");
        root.attributes
            .insert("location".to_string(), self.location().to_string());
        if let Some(id) = command_id {
            root.attributes.insert("commandID".to_string(), id.to_string());
        }

        for entry in &self.entries {
            let Some(kind) = entry.kind else { continue };
            if !content.includes(kind) {
                continue;
            }
            root.children.push(XMLNode::Element(self.entry_element(kind, entry)));
        }

        let mut buf = Vec::new();
        let config = EmitterConfig::new()
            .write_document_declaration(true)
            .perform_indent(false);
        if root.write_with_config(&mut buf, config).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn entry_element(&self, kind: MediaKind, entry: &TimelineEntry) -> Element {
        let mut timeline = Element::new("Timeline");
        let mut set = |name: &str, value: String| {
            timeline.attributes.insert(name.to_string(), value);
        };

        set("type", kind.as_str().to_string());
        set("state", entry.state.as_str().to_string());
        if entry.state == PlaybackState::Stopped {
            return timeline;
        }

        set("time", entry.time_ms.to_string());
        set("controllable", CONTROLLABLE.to_string());
        set("shuffle", if entry.shuffled { "1" } else { "0" }.to_string());
        set("repeat", entry.repeat.to_string());
        if let Some(duration) = entry.duration_ms {
            set("duration", duration.to_string());
        }
        if let Some(volume) = entry.volume {
            set("volume", volume.to_string());
        }
        if let Some(rating_key) = &entry.rating_key {
            set("ratingKey", rating_key.clone());
        }
        if let Some(key) = &entry.key {
            set("key", key.clone());
        }
        if let Some(id) = &entry.play_queue_id {
            set("playQueueID", id.clone());
            set("containerKey", format!("/playQueues/{}", id));
        }
        if let Some(version) = entry.play_queue_version {
            set("playQueueVersion", version.to_string());
        }
        if let Some(item_id) = &entry.play_queue_item_id {
            set("playQueueItemID", item_id.clone());
        }
        if let Some(stream) = &entry.audio_stream_id {
            set("audioStreamID", stream.clone());
        }
        if let Some(stream) = &entry.subtitle_stream_id {
            set("subtitleStreamID", stream.clone());
        }
        if let Some(token) = &entry.token {
            set("token", token.clone());
        }
        if let Some(server) = &self.server {
            set("machineIdentifier", server.identifier.clone());
            set("address", server.host.clone());
            set("port", server.port.to_string());
            set("protocol", "http".to_string());
        }
        timeline
    }
}

fn capture_kind(queues: &PlayQueues, player: &dyn Player, kind: MediaKind) -> TimelineEntry {
    let Some(status) = player.status(kind) else {
        return TimelineEntry {
            kind: Some(kind),
            repeat: "0",
            ..TimelineEntry::default()
        };
    };

    let position = player.position(kind);
    let queue = queues.lock(kind);
    let cursor = position.or(queue.position);

    let mut entry = TimelineEntry {
        kind: Some(kind),
        state: status.state,
        time_ms: status.time_ms,
        duration_ms: status.duration_ms,
        volume: status.volume,
        shuffled: status.shuffled || queue.shuffled,
        repeat: status.repeat.as_param(),
        play_queue_id: queue.id.clone(),
        play_queue_version: queue.version,
        token: queue.transient_token.clone(),
        ..TimelineEntry::default()
    };

    if let Some(item) = cursor.and_then(|pos| queue.items.get(pos)) {
        entry.rating_key = Some(item.plex_id.clone());
        entry.key = Some(item.descriptor.key.clone());
        entry.play_queue_item_id = item.play_queue_item_id.clone();
        entry.duration_ms = entry.duration_ms.or(item.descriptor.duration_ms);
        let selected = |stream_type| {
            item.descriptor
                .streams
                .iter()
                .find(|s| s.selected && s.stream_type == stream_type)
                .map(|s| s.id.clone())
        };
        entry.audio_stream_id = selected(StreamType::Audio);
        entry.subtitle_stream_id = selected(StreamType::Subtitle);
    }
    entry
}
