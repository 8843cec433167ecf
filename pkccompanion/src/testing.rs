//! Fake collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use axum::Router;
use axum::body::{Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::collaborators::{
    MediaServerApi, NavigationCommand, Notifier, PlaybackOptions, Player, TransportCommand,
};
use crate::errors::Result;
use crate::model::{MediaDescriptor, MediaKind, PlayerStatus, RemoteQueue};
use crate::playqueue::PlayQueue;
use crate::subscribers::{Subscriber, TimelineSink};

pub fn descriptor(id: &str, plex_type: &str) -> MediaDescriptor {
    MediaDescriptor {
        plex_id: id.to_string(),
        plex_type: plex_type.to_string(),
        title: format!("Item {}", id),
        key: format!("/library/metadata/{}", id),
        ..Default::default()
    }
}

pub fn remote_queue(id: &str, version: Option<u64>, plex_type: &str, count: usize) -> RemoteQueue {
    RemoteQueue {
        id: id.to_string(),
        version,
        items: (0..count)
            .map(|i| MediaDescriptor {
                play_queue_item_id: Some(format!("{}", i + 1)),
                ..descriptor(&format!("{}", 500 + i), plex_type)
            })
            .collect(),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeServer {
    pub metadata: Mutex<HashMap<String, MediaDescriptor>>,
    pub children: Mutex<HashMap<String, Vec<MediaDescriptor>>>,
    pub queues: Mutex<HashMap<String, RemoteQueue>>,
    pub metadata_calls: AtomicUsize,
    pub queue_calls: AtomicUsize,
    /// Delay applied inside `fetch_remote_queue`.
    pub queue_delay: Option<Duration>,
    pub events: Mutex<Vec<String>>,
}

impl FakeServer {
    pub fn with_metadata(self, item: MediaDescriptor) -> Self {
        self.metadata.lock().insert(item.key.clone(), item);
        self
    }

    pub fn with_children(self, parent: &str, items: Vec<MediaDescriptor>) -> Self {
        self.children.lock().insert(parent.to_string(), items);
        self
    }

    pub fn with_queue(self, queue: RemoteQueue) -> Self {
        self.queues.lock().insert(queue.id.clone(), queue);
        self
    }
}

impl MediaServerApi for FakeServer {
    fn fetch_metadata(&self, key: &str) -> Option<MediaDescriptor> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.metadata.lock().get(key).cloned()
    }

    fn fetch_children(&self, plex_id: &str) -> Option<Vec<MediaDescriptor>> {
        self.children.lock().get(plex_id).cloned()
    }

    fn fetch_remote_queue(&self, play_queue_id: &str) -> Option<RemoteQueue> {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("enter:{}", play_queue_id));
        if let Some(delay) = self.queue_delay {
            thread::sleep(delay);
        }
        self.events.lock().push(format!("exit:{}", play_queue_id));
        self.queues.lock().get(play_queue_id).cloned()
    }
}

#[derive(Default)]
pub struct RecordingPlayer {
    pub calls: Mutex<Vec<String>>,
    pub positions: Mutex<HashMap<MediaKind, usize>>,
    pub statuses: Mutex<HashMap<MediaKind, PlayerStatus>>,
}

impl RecordingPlayer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().push(call);
        Ok(())
    }
}

impl Player for RecordingPlayer {
    fn play(&self, queue: &PlayQueue, start_offset_secs: Option<f64>) -> Result<()> {
        self.record(format!(
            "play:{}:{}:{:?}",
            queue.kind,
            queue.len(),
            start_offset_secs
        ))
    }

    fn play_item(&self, item: &MediaDescriptor, options: &PlaybackOptions) -> Result<()> {
        self.record(format!(
            "play_item:{}:{}:{:?}",
            item.plex_id, options.resume, options.token
        ))
    }

    fn navigate_node(&self, key: &str, offset_ms: u64) -> Result<()> {
        self.record(format!("node:{}:{}", key, offset_ms))
    }

    fn set_audio_stream(&self, index: usize) -> Result<()> {
        self.record(format!("audio:{}", index))
    }

    fn set_subtitle_stream(&self, index: Option<usize>) -> Result<()> {
        self.record(format!("subtitle:{:?}", index))
    }

    fn position(&self, kind: MediaKind) -> Option<usize> {
        self.positions.lock().get(&kind).copied()
    }

    fn status(&self, kind: MediaKind) -> Option<PlayerStatus> {
        self.statuses.lock().get(&kind).cloned()
    }

    fn transport(&self, kind: Option<MediaKind>, command: TransportCommand) -> Result<()> {
        self.record(format!("transport:{:?}:{:?}", kind, command))
    }

    fn seek(&self, kind: Option<MediaKind>, offset_ms: u64) -> Result<()> {
        self.record(format!("seek:{:?}:{}", kind, offset_ms))
    }

    fn set_volume(&self, volume: u8) -> Result<()> {
        self.record(format!("volume:{}", volume))
    }

    fn navigate(&self, command: NavigationCommand) -> Result<()> {
        self.record(format!("navigate:{:?}", command))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, title: &str, message: &str) {
        self.messages.lock().push(format!("{}: {}", title, message));
    }
}

/// Timeline sink recording every delivery and always succeeding.
#[derive(Default)]
pub struct RecordingSink {
    pub deliveries: Mutex<Vec<(String, String)>>,
}

impl TimelineSink for RecordingSink {
    fn deliver(&self, subscriber: &Subscriber, body: &str) -> Result<()> {
        self.deliveries
            .lock()
            .push((subscriber.id.clone(), body.to_string()));
        Ok(())
    }
}

/// A request seen by [`stub_http`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type StubAnswer = dyn Fn(usize, &RecordedRequest) -> (StatusCode, String) + Send + Sync;

struct Stub {
    answer: Box<StubAnswer>,
    served: AtomicUsize,
    seen: mpsc::UnboundedSender<RecordedRequest>,
}

async fn stub_reply(State(stub): State<Arc<Stub>>, request: Request) -> (StatusCode, String) {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
    let recorded = RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        body,
    };
    let index = stub.served.fetch_add(1, Ordering::SeqCst);
    let reply = (stub.answer)(index, &recorded);
    let _ = stub.seen.send(recorded);
    reply
}

/// Serves `count` requests on a loopback port with axum, answering the
/// n-th one with `answer(n, request)`. The handle yields what was received.
pub fn stub_http<F>(count: usize, answer: F) -> (u16, thread::JoinHandle<Vec<RecordedRequest>>)
where
    F: Fn(usize, &RecordedRequest) -> (StatusCode, String) + Send + Sync + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let stub = Arc::new(Stub {
                answer: Box::new(answer),
                served: AtomicUsize::new(0),
                seen: tx,
            });
            let app = Router::new().fallback(stub_reply).with_state(stub);
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();

            let seen = Arc::new(Mutex::new(Vec::new()));
            let collected = seen.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    for _ in 0..count {
                        match rx.recv().await {
                            Some(request) => collected.lock().push(request),
                            None => break,
                        }
                    }
                })
                .await
                .unwrap();
            std::mem::take(&mut *seen.lock())
        })
    });
    (port, handle)
}
