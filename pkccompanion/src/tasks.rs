//! Remote commands decoded into typed tasks, and the bounded queue that
//! carries them from the listener to the dispatcher.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::errors::{CompanionError, Result};
use crate::model::{MediaKind, RepeatMode};

/// Action tag carried by a remote command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    PlayItem,
    PlayPlaylist,
    RefreshPlayQueue,
    SetStreams,
    NavigateNode,
}

impl TaskAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "playItem" | "alexa" => Some(TaskAction::PlayItem),
            "playPlaylist" | "playlist" => Some(TaskAction::PlayPlaylist),
            "refreshPlayQueue" => Some(TaskAction::RefreshPlayQueue),
            "setStreams" => Some(TaskAction::SetStreams),
            "navigateNode" | "node" => Some(TaskAction::NavigateNode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::PlayItem => "playItem",
            TaskAction::PlayPlaylist => "playPlaylist",
            TaskAction::RefreshPlayQueue => "refreshPlayQueue",
            TaskAction::SetStreams => "setStreams",
            TaskAction::NavigateNode => "navigateNode",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayItemRequest {
    pub key: String,
    pub container_key: Option<String>,
    pub offset_ms: u64,
    pub token: Option<String>,
    /// Sent by a voice assistant rather than a Plex controller.
    pub from_assistant: bool,
}

impl PlayItemRequest {
    /// Remote queue id when the container key references a play queue.
    pub fn queue_reference(&self) -> Option<String> {
        let container = self.container_key.as_deref()?;
        if !container.starts_with("/playQueues/") {
            return None;
        }
        let (id, _) = parse_container_key(container);
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayPlaylistRequest {
    pub key: Option<String>,
    pub play_queue_id: String,
    pub kind: Option<MediaKind>,
    pub repeat: Option<RepeatMode>,
    pub offset_ms: u64,
    pub token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RefreshRequest {
    pub play_queue_id: String,
    pub kind: Option<MediaKind>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubtitleChange {
    Off,
    Stream(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamChange {
    Audio(String),
    Subtitle(SubtitleChange),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetStreamsRequest {
    pub kind: MediaKind,
    pub change: StreamChange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NavigateNodeRequest {
    pub key: String,
    pub offset_ms: u64,
}

/// One remote command, consumed exactly once by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    PlayItem(PlayItemRequest),
    PlayPlaylist(PlayPlaylistRequest),
    RefreshPlayQueue(RefreshRequest),
    SetStreams(SetStreamsRequest),
    NavigateNode(NavigateNodeRequest),
}

impl Task {
    pub fn action(&self) -> TaskAction {
        match self {
            Task::PlayItem(_) => TaskAction::PlayItem,
            Task::PlayPlaylist(_) => TaskAction::PlayPlaylist,
            Task::RefreshPlayQueue(_) => TaskAction::RefreshPlayQueue,
            Task::SetStreams(_) => TaskAction::SetStreams,
            Task::NavigateNode(_) => TaskAction::NavigateNode,
        }
    }

    /// Decodes a raw `{action, params}` pair. The `alexa` action marks a
    /// play request as coming from a voice assistant.
    pub fn from_raw(raw: &str, params: &HashMap<String, String>) -> Result<Self> {
        let action =
            TaskAction::parse(raw).ok_or_else(|| CompanionError::UnknownAction(raw.into()))?;
        let task = Self::decode(action, params)?;
        Ok(if raw == "alexa" {
            task.from_assistant()
        } else {
            task
        })
    }

    /// Tags a play request with an assistant origin; other tasks are unchanged.
    pub fn from_assistant(self) -> Self {
        match self {
            Task::PlayItem(request) => Task::PlayItem(PlayItemRequest {
                from_assistant: true,
                ..request
            }),
            other => other,
        }
    }

    /// Builds the typed payload for `action` from the request parameters.
    pub fn decode(action: TaskAction, params: &HashMap<String, String>) -> Result<Self> {
        match action {
            TaskAction::PlayItem => Ok(Task::PlayItem(PlayItemRequest {
                key: required(params, "key")?,
                container_key: optional(params, "containerKey"),
                offset_ms: offset_ms(params)?,
                token: optional(params, "token"),
                from_assistant: false,
            })),
            TaskAction::PlayPlaylist => {
                let container = required(params, "containerKey")?;
                let (play_queue_id, query) = parse_container_key(&container);
                if play_queue_id.is_empty() {
                    return Err(CompanionError::invalid("containerKey", &container));
                }
                Ok(Task::PlayPlaylist(PlayPlaylistRequest {
                    key: optional(params, "key"),
                    play_queue_id,
                    kind: kind_hint(params),
                    repeat: query.get("repeat").and_then(|r| RepeatMode::from_param(r)),
                    offset_ms: offset_ms(params)?,
                    token: optional(params, "token"),
                }))
            }
            TaskAction::RefreshPlayQueue => Ok(Task::RefreshPlayQueue(RefreshRequest {
                play_queue_id: required(params, "playQueueID")?,
                kind: kind_hint(params),
            })),
            TaskAction::SetStreams => {
                let raw_kind = required(params, "type")?;
                let kind = MediaKind::from_plex_type(&raw_kind)
                    .ok_or(CompanionError::UnsupportedKind(raw_kind))?;
                let change = if let Some(audio) = optional(params, "audioStreamID") {
                    StreamChange::Audio(audio)
                } else if let Some(subtitle) = optional(params, "subtitleStreamID") {
                    if subtitle == "0" {
                        StreamChange::Subtitle(SubtitleChange::Off)
                    } else {
                        StreamChange::Subtitle(SubtitleChange::Stream(subtitle))
                    }
                } else {
                    return Err(CompanionError::missing("audioStreamID|subtitleStreamID"));
                };
                Ok(Task::SetStreams(SetStreamsRequest { kind, change }))
            }
            TaskAction::NavigateNode => Ok(Task::NavigateNode(NavigateNodeRequest {
                key: required(params, "key")?,
                offset_ms: offset_ms(params)?,
            })),
        }
    }
}

fn optional(params: &HashMap<String, String>, name: &str) -> Option<String> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(params: &HashMap<String, String>, name: &str) -> Result<String> {
    optional(params, name).ok_or_else(|| CompanionError::missing(name))
}

fn kind_hint(params: &HashMap<String, String>) -> Option<MediaKind> {
    params.get("type").and_then(|t| MediaKind::from_plex_type(t))
}

/// Offsets arrive in milliseconds, sometimes with a fractional part.
fn offset_ms(params: &HashMap<String, String>) -> Result<u64> {
    match optional(params, "offset") {
        None => Ok(0),
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
            .ok_or_else(|| CompanionError::invalid("offset", &raw)),
    }
}

/// Splits `/playQueues/6669?own=1&repeat=0` into `6669` and its query.
pub fn parse_container_key(raw: &str) -> (String, HashMap<String, String>) {
    let (path, query) = raw.split_once('?').unwrap_or((raw, ""));
    let id = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    (id, query)
}

/// Bounded FIFO of tasks. Producers never block: when full, the oldest
/// task is evicted with a warning.
#[derive(Clone, Debug)]
pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Appends `task`. Returns the number of tasks evicted to make room.
    pub fn push(&self, task: Task) -> usize {
        let mut evicted = 0;
        let mut pending = task;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    if let Ok(old) = self.rx.try_recv() {
                        evicted += 1;
                        warn!(
                            dropped = old.action().as_str(),
                            incoming = back.action().as_str(),
                            "Task queue full, dropping oldest task"
                        );
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(back)) => {
                    warn!(task = back.action().as_str(), "Task queue closed, dropping task");
                    return evicted;
                }
            }
        }
    }

    /// Waits up to `timeout` for the next task.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Task> {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                debug!(task = task.action().as_str(), "Task dequeued");
                Some(task)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
