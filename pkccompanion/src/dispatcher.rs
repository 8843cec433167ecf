//! Routes decoded tasks to their handlers.
//!
//! Each queue-mutating handler runs under its own exclusive lock so that two
//! tasks of the same action never interleave. Handler errors are logged and
//! never escape [`TaskDispatcher::process_task`]; failures that prevent the
//! requested playback are also shown to the user through the [`Notifier`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collaborators::{MediaServerApi, Notifier, PlaybackOptions, Player};
use crate::context::ServiceContext;
use crate::errors::{CompanionError, Result};
use crate::model::{MediaKind, StreamType};
use crate::playqueue::{PlayQueues, QueueUpdate, SyncOutcome};
use crate::tasks::{
    NavigateNodeRequest, PlayItemRequest, PlayPlaylistRequest, RefreshRequest, SetStreamsRequest,
    StreamChange, SubtitleChange, Task, TaskAction,
};

const PLAYBACK_ERROR_TITLE: &str = "Playback error";

pub struct TaskDispatcher {
    server: Arc<dyn MediaServerApi>,
    player: Arc<dyn Player>,
    notifier: Arc<dyn Notifier>,
    queues: Arc<PlayQueues>,
    ctx: Arc<ServiceContext>,
    play_item_lock: Mutex<()>,
    playlist_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
    streams_lock: Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(
        server: Arc<dyn MediaServerApi>,
        player: Arc<dyn Player>,
        notifier: Arc<dyn Notifier>,
        queues: Arc<PlayQueues>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        Self {
            server,
            player,
            notifier,
            queues,
            ctx,
            play_item_lock: Mutex::new(()),
            playlist_lock: Mutex::new(()),
            refresh_lock: Mutex::new(()),
            streams_lock: Mutex::new(()),
        }
    }

    pub fn queues(&self) -> &Arc<PlayQueues> {
        &self.queues
    }

    pub fn player(&self) -> &Arc<dyn Player> {
        &self.player
    }

    /// Runs `task` to completion.
    pub fn process_task(&self, task: Task) {
        let action = task.action();
        debug!(task = action.as_str(), "Processing task");

        let result = match task {
            Task::PlayItem(request) => self.play_item(request),
            Task::PlayPlaylist(request) => self.play_playlist(request),
            Task::RefreshPlayQueue(request) => self.refresh_play_queue(request),
            Task::SetStreams(request) => self.set_streams(request),
            Task::NavigateNode(request) => self.navigate_node(request),
        };

        match result {
            Ok(()) => self.ctx.mark_state_changed(),
            Err(err) => {
                warn!(task = action.as_str(), error = %err, "Task failed");
                if blocks_playback(action) {
                    self.notifier.notify_error(PLAYBACK_ERROR_TITLE, &err.to_string());
                }
            }
        }
    }

    fn play_item(&self, request: PlayItemRequest) -> Result<()> {
        let _guard = self.play_item_lock.lock();

        let item = self
            .server
            .fetch_metadata(&request.key)
            .ok_or_else(|| CompanionError::MetadataUnavailable(request.key.clone()))?;

        if request.from_assistant && item.is_album() {
            debug!(album = item.plex_id.as_str(), "Album requested, queueing its tracks");
            let tracks = self
                .server
                .fetch_children(&item.plex_id)
                .filter(|children| !children.is_empty())
                .ok_or_else(|| CompanionError::MetadataUnavailable(item.key.clone()))?;
            let queue = self
                .queues
                .replace_local(MediaKind::Audio, tracks, request.token);
            return self.player.play(&queue, None);
        }

        if let Some(play_queue_id) = request.queue_reference() {
            let remote = self
                .server
                .fetch_remote_queue(&play_queue_id)
                .ok_or(CompanionError::QueueUnavailable(play_queue_id))?;
            let outcome = self.queues.apply(QueueUpdate {
                kind_hint: item.kind(),
                token: request.token,
                offset_ms: request.offset_ms,
                force: true,
                ..QueueUpdate::new(&remote)
            });
            return self.play_outcome(outcome, &item.plex_type, None);
        }

        let options = PlaybackOptions {
            resume: request.offset_ms > 0,
            token: request.token,
            offset_ms: request.offset_ms,
        };
        self.player.play_item(&item, &options)
    }

    fn play_playlist(&self, request: PlayPlaylistRequest) -> Result<()> {
        let _guard = self.playlist_lock.lock();

        let kind = match request.kind {
            Some(kind) => kind,
            None => {
                // Some controllers omit the media type.
                let key = request
                    .key
                    .as_deref()
                    .ok_or_else(|| CompanionError::missing("type"))?;
                let item = self
                    .server
                    .fetch_metadata(key)
                    .ok_or_else(|| CompanionError::MetadataUnavailable(key.to_string()))?;
                item.kind()
                    .ok_or(CompanionError::UnsupportedKind(item.plex_type))?
            }
        };

        let remote = self
            .server
            .fetch_remote_queue(&request.play_queue_id)
            .ok_or_else(|| CompanionError::QueueUnavailable(request.play_queue_id.clone()))?;

        let outcome = self.queues.apply(QueueUpdate {
            kind_hint: Some(kind),
            repeat: request.repeat,
            token: request.token,
            offset_ms: request.offset_ms,
            ..QueueUpdate::new(&remote)
        });
        self.play_outcome(outcome, kind.as_str(), Some(request.offset_ms))
    }

    /// Starts playback after a synchronization. A stale update still plays
    /// the already synchronized queue, at `stale_offset_ms` when given.
    fn play_outcome(
        &self,
        outcome: SyncOutcome,
        plex_type: &str,
        stale_offset_ms: Option<u64>,
    ) -> Result<()> {
        match outcome {
            SyncOutcome::Replaced(kind) => {
                let queue = self.queues.snapshot(kind);
                self.player.play(&queue, queue.start_offset_secs())
            }
            SyncOutcome::Stale(kind) => {
                let queue = self.queues.snapshot(kind);
                let offset = stale_offset_ms.and_then(crate::playqueue::offset_to_seconds);
                self.player.play(&queue, offset)
            }
            SyncOutcome::Cleared(kind) => {
                info!(kind = %kind, "Remote play queue is empty, nothing to play");
                Ok(())
            }
            SyncOutcome::Unsupported => Err(CompanionError::UnsupportedKind(plex_type.to_string())),
        }
    }

    fn refresh_play_queue(&self, request: RefreshRequest) -> Result<()> {
        let _guard = self.refresh_lock.lock();

        let remote = self
            .server
            .fetch_remote_queue(&request.play_queue_id)
            .ok_or_else(|| CompanionError::QueueUnavailable(request.play_queue_id.clone()))?;

        if !remote.items.is_empty() {
            let outcome = self.queues.apply(QueueUpdate {
                kind_hint: request.kind,
                ..QueueUpdate::new(&remote)
            });
            return match outcome {
                SyncOutcome::Unsupported => Err(CompanionError::UnsupportedKind(
                    remote.items[0].plex_type.clone(),
                )),
                _ => Ok(()),
            };
        }

        let kind = request
            .kind
            .or_else(|| self.queues.kind_of_queue(&remote.id))
            .or_else(|| self.kind_from_source(remote.source_uri.as_deref()));
        match kind {
            Some(kind) => {
                debug!(kind = %kind, play_queue = remote.id.as_str(), "Empty play queue received");
                self.queues.clear_kind(kind, remote.version);
                Ok(())
            }
            None => {
                warn!(
                    play_queue = remote.id.as_str(),
                    "Empty play queue of unknown kind, nothing cleared"
                );
                Ok(())
            }
        }
    }

    fn kind_from_source(&self, source_uri: Option<&str>) -> Option<MediaKind> {
        let key = source_key(source_uri?)?;
        self.server.fetch_metadata(&key)?.kind()
    }

    fn set_streams(&self, request: SetStreamsRequest) -> Result<()> {
        let _guard = self.streams_lock.lock();

        let (remote_id, stream_type) = match request.change {
            StreamChange::Subtitle(SubtitleChange::Off) => {
                return self.player.set_subtitle_stream(None);
            }
            StreamChange::Subtitle(SubtitleChange::Stream(id)) => (id, StreamType::Subtitle),
            StreamChange::Audio(id) => (id, StreamType::Audio),
        };

        let kind = request.kind;
        let position = self
            .player
            .position(kind)
            .ok_or(CompanionError::NothingPlaying(kind))?;

        let index = self
            .local_stream_index(kind, position, &remote_id, stream_type)?
            .ok_or_else(|| CompanionError::UnknownStream(remote_id.clone()))?;

        match stream_type {
            StreamType::Audio => self.player.set_audio_stream(index),
            _ => self.player.set_subtitle_stream(Some(index)),
        }
    }

    /// Maps a remote stream id for the item at `position`, fetching stream
    /// metadata first if the item has none. The fetch happens outside the
    /// queue lock.
    fn local_stream_index(
        &self,
        kind: MediaKind,
        position: usize,
        remote_id: &str,
        stream_type: StreamType,
    ) -> Result<Option<usize>> {
        let missing_key = {
            let mut queue = self.queues.lock(kind);
            let item = queue
                .items
                .get_mut(position)
                .ok_or(CompanionError::NothingPlaying(kind))?;
            if item.has_stream_info() {
                return Ok(item.local_stream_index(remote_id, stream_type));
            }
            (item.plex_id.clone(), item.descriptor.key.clone())
        };

        let (plex_id, key) = missing_key;
        let detailed = self
            .server
            .fetch_metadata(&key)
            .ok_or_else(|| CompanionError::MetadataUnavailable(key.clone()))?;

        let mut queue = self.queues.lock(kind);
        match queue.items.get_mut(position) {
            Some(item) if item.plex_id == plex_id => {
                item.attach_streams(detailed.streams);
                Ok(item.local_stream_index(remote_id, stream_type))
            }
            _ => Err(CompanionError::NothingPlaying(kind)),
        }
    }

    fn navigate_node(&self, request: NavigateNodeRequest) -> Result<()> {
        self.player.navigate_node(&request.key, request.offset_ms)
    }
}

fn blocks_playback(action: TaskAction) -> bool {
    matches!(
        action,
        TaskAction::PlayItem | TaskAction::PlayPlaylist | TaskAction::NavigateNode
    )
}

/// Metadata key of a play queue source, e.g.
/// `library://abc/item/%2Flibrary%2Fmetadata%2F12` gives `/library/metadata/12`.
pub(crate) fn source_key(source_uri: &str) -> Option<String> {
    let (_, encoded) = source_uri
        .split_once("/item/")
        .or_else(|| source_uri.split_once("/directory/"))?;
    let decoded = urlencoding::decode(encoded).ok()?;
    let key = decoded.split('?').next().unwrap_or_default();
    key.starts_with('/').then(|| key.to_string())
}
