//! Local play queues mirroring the media server's play queues.
//!
//! One [`PlayQueue`] exists per [`MediaKind`]. Downloaded remote queues are
//! applied through [`PlayQueues::apply`], which enforces the revision rule:
//! an update for the same remote queue whose `playQueueVersion` is not newer
//! than the local one is discarded, unless forced.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::model::{MediaDescriptor, MediaKind, MediaStream, RemoteQueue, RepeatMode, StreamType};

/// Remote stream id to local player stream index, per stream type.
///
/// Audio indices follow the order of audio streams. Subtitle indices list
/// embedded streams first and external ones after, which is how the player
/// enumerates them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMapping {
    audio: HashMap<String, usize>,
    subtitle: HashMap<String, usize>,
}

impl StreamMapping {
    pub fn from_streams(streams: &[MediaStream]) -> Self {
        let audio = streams
            .iter()
            .filter(|s| s.stream_type == StreamType::Audio)
            .enumerate()
            .map(|(index, s)| (s.id.clone(), index))
            .collect();

        let embedded = streams
            .iter()
            .filter(|s| s.stream_type == StreamType::Subtitle && !s.external);
        let external = streams
            .iter()
            .filter(|s| s.stream_type == StreamType::Subtitle && s.external);
        let subtitle = embedded
            .chain(external)
            .enumerate()
            .map(|(index, s)| (s.id.clone(), index))
            .collect();

        Self { audio, subtitle }
    }

    pub fn local_index(&self, remote_id: &str, stream_type: StreamType) -> Option<usize> {
        match stream_type {
            StreamType::Audio => self.audio.get(remote_id).copied(),
            StreamType::Subtitle => self.subtitle.get(remote_id).copied(),
            StreamType::Video => None,
        }
    }

    pub fn remote_id(&self, local_index: usize, stream_type: StreamType) -> Option<&str> {
        let map = match stream_type {
            StreamType::Audio => &self.audio,
            StreamType::Subtitle => &self.subtitle,
            StreamType::Video => return None,
        };
        map.iter()
            .find(|(_, index)| **index == local_index)
            .map(|(id, _)| id.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayQueueItem {
    pub plex_id: String,
    pub play_queue_item_id: Option<String>,
    pub descriptor: MediaDescriptor,
    streams: Option<StreamMapping>,
}

impl PlayQueueItem {
    pub fn from_descriptor(descriptor: MediaDescriptor) -> Self {
        Self {
            plex_id: descriptor.plex_id.clone(),
            play_queue_item_id: descriptor.play_queue_item_id.clone(),
            descriptor,
            streams: None,
        }
    }

    /// Whether stream metadata is present for building the mapping.
    pub fn has_stream_info(&self) -> bool {
        !self.descriptor.streams.is_empty()
    }

    /// Replaces stream metadata, invalidating the cached mapping.
    pub fn attach_streams(&mut self, streams: Vec<MediaStream>) {
        self.descriptor.streams = streams;
        self.streams = None;
    }

    fn mapping(&mut self) -> &StreamMapping {
        let streams = &self.descriptor.streams;
        self.streams
            .get_or_insert_with(|| StreamMapping::from_streams(streams))
    }

    pub fn local_stream_index(&mut self, remote_id: &str, stream_type: StreamType) -> Option<usize> {
        self.mapping().local_index(remote_id, stream_type)
    }

    pub fn remote_stream_id(&mut self, local_index: usize, stream_type: StreamType) -> Option<String> {
        self.mapping()
            .remote_id(local_index, stream_type)
            .map(str::to_string)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayQueue {
    pub kind: MediaKind,
    pub id: Option<String>,
    pub version: Option<u64>,
    pub items: Vec<PlayQueueItem>,
    pub position: Option<usize>,
    pub repeat: RepeatMode,
    pub shuffled: bool,
    pub transient_token: Option<String>,
    /// Pending start offset in milliseconds.
    pub offset_ms: u64,
}

impl PlayQueue {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            id: None,
            version: None,
            items: Vec::new(),
            position: None,
            repeat: RepeatMode::Off,
            shuffled: false,
            transient_token: None,
            offset_ms: 0,
        }
    }

    /// Empties the queue. Identity and revision are kept.
    pub fn clear(&mut self) {
        self.items.clear();
        self.position = None;
        self.offset_ms = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_item(&self) -> Option<&PlayQueueItem> {
        self.position.and_then(|pos| self.items.get(pos))
    }

    /// Start offset in seconds, `None` when playback starts at the beginning.
    pub fn start_offset_secs(&self) -> Option<f64> {
        offset_to_seconds(self.offset_ms)
    }

    fn replace_items(&mut self, items: Vec<MediaDescriptor>, selected: Option<&str>) {
        self.items = items.into_iter().map(PlayQueueItem::from_descriptor).collect();
        self.position = if self.items.is_empty() {
            None
        } else {
            selected
                .and_then(|sel| {
                    self.items
                        .iter()
                        .position(|item| item.play_queue_item_id.as_deref() == Some(sel))
                })
                .or(Some(0))
        };
    }
}

pub fn offset_to_seconds(offset_ms: u64) -> Option<f64> {
    (offset_ms > 0).then(|| offset_ms as f64 / 1000.0)
}

/// Parameters applied together with a downloaded remote queue.
#[derive(Clone, Debug)]
pub struct QueueUpdate<'a> {
    pub remote: &'a RemoteQueue,
    pub kind_hint: Option<MediaKind>,
    pub repeat: Option<RepeatMode>,
    pub token: Option<String>,
    pub offset_ms: u64,
    /// Bypasses the revision check.
    pub force: bool,
}

impl<'a> QueueUpdate<'a> {
    pub fn new(remote: &'a RemoteQueue) -> Self {
        Self {
            remote,
            kind_hint: None,
            repeat: None,
            token: None,
            offset_ms: 0,
            force: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Revision not newer than the local one; nothing changed.
    Stale(MediaKind),
    Cleared(MediaKind),
    Replaced(MediaKind),
    /// No kind could be derived; nothing changed.
    Unsupported,
}

/// The per-kind queue set, one mutex per kind.
#[derive(Debug)]
pub struct PlayQueues {
    video: Mutex<PlayQueue>,
    audio: Mutex<PlayQueue>,
    photo: Mutex<PlayQueue>,
}

impl Default for PlayQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayQueues {
    pub fn new() -> Self {
        Self {
            video: Mutex::new(PlayQueue::new(MediaKind::Video)),
            audio: Mutex::new(PlayQueue::new(MediaKind::Audio)),
            photo: Mutex::new(PlayQueue::new(MediaKind::Photo)),
        }
    }

    pub fn lock(&self, kind: MediaKind) -> MutexGuard<'_, PlayQueue> {
        match kind {
            MediaKind::Video => self.video.lock(),
            MediaKind::Audio => self.audio.lock(),
            MediaKind::Photo => self.photo.lock(),
        }
    }

    pub fn snapshot(&self, kind: MediaKind) -> PlayQueue {
        self.lock(kind).clone()
    }

    /// Kind of the local queue currently mirroring remote queue `id`.
    pub fn kind_of_queue(&self, id: &str) -> Option<MediaKind> {
        MediaKind::ALL
            .into_iter()
            .find(|kind| self.lock(*kind).id.as_deref() == Some(id))
    }

    /// Empties the queue of `kind`. A given `version` is recorded only when
    /// it is newer than the stored one; the revision never goes back.
    pub fn clear_kind(&self, kind: MediaKind, version: Option<u64>) {
        let mut queue = self.lock(kind);
        queue.clear();
        if let Some(incoming) = version {
            if queue.version.is_none_or(|current| incoming > current) {
                queue.version = Some(incoming);
            } else {
                debug!(kind = %kind, incoming, local = ?queue.version, "Older revision not recorded");
            }
        }
        debug!(kind = %kind, "Play queue cleared");
    }

    /// Seeds a local-only queue (no remote counterpart) from `items`.
    pub fn replace_local(
        &self,
        kind: MediaKind,
        items: Vec<MediaDescriptor>,
        token: Option<String>,
    ) -> PlayQueue {
        let mut queue = self.lock(kind);
        queue.id = None;
        queue.version = None;
        queue.replace_items(items, None);
        queue.transient_token = token;
        queue.offset_ms = 0;
        queue.clone()
    }

    /// Synchronizes the matching local queue with a downloaded remote queue.
    pub fn apply(&self, update: QueueUpdate<'_>) -> SyncOutcome {
        let remote = update.remote;

        let kind = if remote.items.is_empty() {
            update.kind_hint.or_else(|| self.kind_of_queue(&remote.id))
        } else {
            match remote.implied_kind() {
                Some(kind) => Some(kind),
                None => {
                    warn!(
                        play_queue = remote.id.as_str(),
                        plex_type = remote.items[0].plex_type.as_str(),
                        "Play queue item type maps to no supported kind, update dropped"
                    );
                    return SyncOutcome::Unsupported;
                }
            }
        };
        let Some(kind) = kind else {
            warn!(
                play_queue = remote.id.as_str(),
                "Cannot determine the kind of an empty play queue"
            );
            return SyncOutcome::Unsupported;
        };

        let mut queue = self.lock(kind);
        let same_queue = queue.id.as_deref() == Some(remote.id.as_str());

        if !update.force && same_queue {
            if let (Some(incoming), Some(local)) = (remote.version, queue.version) {
                if incoming <= local {
                    debug!(
                        kind = %kind,
                        play_queue = remote.id.as_str(),
                        incoming,
                        local,
                        "Stale play queue update ignored"
                    );
                    return SyncOutcome::Stale(kind);
                }
            }
        }

        if remote.items.is_empty() {
            queue.clear();
            queue.id = Some(remote.id.clone());
            if remote.version.is_some() {
                queue.version = remote.version;
            }
            info!(kind = %kind, play_queue = remote.id.as_str(), "Remote play queue empty, local queue cleared");
            return SyncOutcome::Cleared(kind);
        }

        queue.replace_items(remote.items.clone(), remote.selected_item_id.as_deref());
        queue.id = Some(remote.id.clone());
        if remote.version.is_some() || !same_queue {
            queue.version = remote.version;
        }
        if let Some(repeat) = update.repeat {
            queue.repeat = repeat;
        }
        queue.shuffled = remote.shuffled;
        queue.transient_token = update.token;
        queue.offset_ms = update.offset_ms;

        info!(
            kind = %kind,
            play_queue = remote.id.as_str(),
            version = ?queue.version,
            items = queue.items.len(),
            "Play queue synchronized"
        );
        SyncOutcome::Replaced(kind)
    }
}
