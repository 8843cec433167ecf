//! Timeline subscribers and push delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use ureq::Agent;

use crate::collaborators::Player;
use crate::discovery::{ClientIdentity, ServerAddress};
use crate::errors::{CompanionError, Result};
use crate::playqueue::PlayQueues;
use crate::timeline::{TimelineContent, TimelineSnapshot};

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriberSettings {
    /// Consecutive failed deliveries before a subscriber is dropped.
    pub max_failures: u32,
    /// A subscriber that does not subscribe again within this delay is dropped.
    pub timeout: Duration,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            max_failures: 3,
            timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub command_id: Option<String>,
    pub content: TimelineContent,
}

#[derive(Clone, Debug)]
pub struct Subscriber {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub command_id: Option<String>,
    pub content: TimelineContent,
    pub subscribed_at: Instant,
    pub last_contact: Option<Instant>,
    pub failures: u32,
}

impl Subscriber {
    pub fn timeline_url(&self) -> String {
        format!("{}://{}:{}/:/timeline", self.protocol, self.host, self.port)
    }
}

/// Transport for timeline pushes.
pub trait TimelineSink: Send + Sync {
    fn deliver(&self, subscriber: &Subscriber, body: &str) -> Result<()>;
}

/// Posts timelines over HTTP with the client identification headers.
pub struct HttpTimelineSink {
    agent: Agent,
    identity: ClientIdentity,
}

impl HttpTimelineSink {
    pub fn new(identity: ClientIdentity, timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, identity }
    }
}

impl TimelineSink for HttpTimelineSink {
    fn deliver(&self, subscriber: &Subscriber, body: &str) -> Result<()> {
        let url = subscriber.timeline_url();
        let response = self
            .agent
            .post(&url)
            .header("Content-Type", "application/xml")
            .header("X-Plex-Client-Identifier", &self.identity.identifier)
            .header("X-Plex-Device-Name", &self.identity.name)
            .header("X-Plex-Product", &self.identity.product)
            .header("X-Plex-Version", &self.identity.version)
            .header("X-Plex-Platform", &self.identity.platform)
            .header("X-Plex-Platform-Version", &self.identity.platform_version)
            .header("X-Plex-Device-Class", &self.identity.device_class)
            .send(body)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CompanionError::HttpStatus(url, response.status().as_u16()))
        }
    }
}

/// Owns the subscriber roster and pushes timelines to it.
pub struct SubscriptionManager {
    subscribers: Mutex<HashMap<String, Subscriber>>,
    servers: Mutex<Vec<ServerAddress>>,
    sink: Arc<dyn TimelineSink>,
    queues: Arc<PlayQueues>,
    player: Arc<dyn Player>,
    settings: SubscriberSettings,
}

impl SubscriptionManager {
    pub fn new(
        sink: Arc<dyn TimelineSink>,
        queues: Arc<PlayQueues>,
        player: Arc<dyn Player>,
        settings: SubscriberSettings,
    ) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            servers: Mutex::new(Vec::new()),
            sink,
            queues,
            player,
            settings,
        }
    }

    /// Adds or refreshes a subscriber. Returns `true` when it is new.
    pub fn subscribe(&self, request: SubscribeRequest) -> bool {
        let mut subscribers = self.subscribers.lock();
        let now = Instant::now();
        match subscribers.get_mut(&request.client_id) {
            Some(existing) => {
                existing.host = request.host;
                existing.port = request.port;
                existing.protocol = request.protocol;
                existing.command_id = request.command_id;
                existing.content = request.content;
                existing.subscribed_at = now;
                debug!(subscriber = existing.id.as_str(), "Subscription refreshed");
                false
            }
            None => {
                info!(
                    subscriber = request.client_id.as_str(),
                    host = request.host.as_str(),
                    port = request.port,
                    "New timeline subscriber"
                );
                subscribers.insert(
                    request.client_id.clone(),
                    Subscriber {
                        id: request.client_id,
                        host: request.host,
                        port: request.port,
                        protocol: request.protocol,
                        command_id: request.command_id,
                        content: request.content,
                        subscribed_at: now,
                        last_contact: None,
                        failures: 0,
                    },
                );
                true
            }
        }
    }

    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let removed = self.subscribers.lock().remove(client_id).is_some();
        if removed {
            info!(subscriber = client_id, "Timeline subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn subscriber(&self, client_id: &str) -> Option<Subscriber> {
        self.subscribers.lock().get(client_id).cloned()
    }

    pub fn set_server_list(&self, servers: Vec<ServerAddress>) {
        *self.servers.lock() = servers;
    }

    fn current_server(&self) -> Option<ServerAddress> {
        self.servers.lock().first().cloned()
    }

    fn snapshot(&self) -> TimelineSnapshot {
        let server = self.current_server();
        TimelineSnapshot::capture(&self.queues, self.player.as_ref(), server.as_ref())
    }

    /// Drops subscribers that did not renew in time; returns the others.
    fn live_subscribers(&self) -> Vec<Subscriber> {
        let mut subscribers = self.subscribers.lock();
        let timeout = self.settings.timeout;
        subscribers.retain(|id, sub| {
            let alive = sub.subscribed_at.elapsed() <= timeout;
            if !alive {
                info!(subscriber = id.as_str(), "Timeline subscriber expired");
            }
            alive
        });
        subscribers.values().cloned().collect()
    }

    /// Pushes one snapshot to every subscriber. Returns the number of
    /// successful deliveries.
    pub fn notify(&self) -> usize {
        let targets = self.live_subscribers();
        if targets.is_empty() {
            return 0;
        }

        let snapshot = self.snapshot();
        let mut delivered = 0;
        for target in targets {
            let body = snapshot.to_xml(target.command_id.as_deref(), target.content);
            let outcome = self.sink.deliver(&target, &body);

            let mut subscribers = self.subscribers.lock();
            let Some(subscriber) = subscribers.get_mut(&target.id) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    subscriber.failures = 0;
                    subscriber.last_contact = Some(Instant::now());
                }
                Err(err) => {
                    subscriber.failures += 1;
                    warn!(
                        subscriber = target.id.as_str(),
                        failures = subscriber.failures,
                        error = %err,
                        "Timeline delivery failed"
                    );
                    if subscriber.failures >= self.settings.max_failures {
                        subscribers.remove(&target.id);
                        info!(subscriber = target.id.as_str(), "Timeline subscriber dropped");
                    }
                }
            }
        }
        delivered
    }

    /// Tells every subscriber that playback stopped.
    pub fn signal_stop(&self) {
        let server = self.current_server();
        let stopped = TimelineSnapshot::stopped(server.as_ref());
        let targets: Vec<Subscriber> = self.subscribers.lock().values().cloned().collect();
        for target in targets {
            let body = stopped.to_xml(target.command_id.as_deref(), target.content);
            if let Err(err) = self.sink.deliver(&target, &body) {
                debug!(subscriber = target.id.as_str(), error = %err, "Final timeline not delivered");
            }
        }
    }

    /// Timeline for `/player/timeline/poll`. A known poller counts as a renewal.
    pub fn poll(&self, command_id: Option<&str>, client_id: Option<&str>) -> String {
        let mut content = TimelineContent::All;
        if let Some(id) = client_id {
            if let Some(subscriber) = self.subscribers.lock().get_mut(id) {
                subscriber.subscribed_at = Instant::now();
                subscriber.command_id = command_id.map(str::to_string);
                content = subscriber.content;
            }
        }
        self.snapshot().to_xml(command_id, content)
    }
}
