//! The companion service loop.
//!
//! One thread runs the HTTP listener (bind with retry, then serve); the
//! caller's thread runs [`CompanionService::run`], which keeps the listener
//! alive, refreshes the GDM registration, pushes timelines and dispatches
//! queued tasks one at a time.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::collaborators::{MediaServerApi, Notifier, Player};
use crate::config_ext::CompanionSettings;
use crate::context::ServiceContext;
use crate::discovery::{GdmClient, ServerAddress};
use crate::dispatcher::TaskDispatcher;
use crate::errors::Result;
use crate::listener::{CommandListener, CommandRouter, bind_with_retry};
use crate::playqueue::PlayQueues;
use crate::subscribers::{HttpTimelineSink, SubscriptionManager, TimelineSink};
use crate::tasks::TaskQueue;

type ListenerSlot = Arc<Mutex<Option<Arc<CommandListener>>>>;
type ServerListHook = Box<dyn Fn(&[ServerAddress]) + Send + Sync>;

/// Cheap handle used to control a running service from another thread.
#[derive(Clone)]
pub struct CompanionHandle {
    ctx: Arc<ServiceContext>,
}

impl CompanionHandle {
    pub fn stop(&self) {
        self.ctx.request_stop();
    }

    pub fn suspend(&self) {
        self.ctx.suspend();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.ctx.is_suspended()
    }
}

enum ListenerState {
    Idle,
    Running(JoinHandle<bool>),
    /// Bind retries exhausted; the service keeps running without HTTP.
    Unavailable,
}

/// Closes the current listener socket on every exit path of `run`.
struct ListenerGuard<'a>(&'a ListenerSlot);

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        if let Some(listener) = self.0.lock().take() {
            listener.close();
        }
    }
}

fn due(last: Option<Instant>, interval: Duration) -> bool {
    last.is_none_or(|at| at.elapsed() >= interval)
}

pub struct CompanionService {
    settings: CompanionSettings,
    ctx: Arc<ServiceContext>,
    tasks: TaskQueue,
    dispatcher: TaskDispatcher,
    subscribers: Arc<SubscriptionManager>,
    router: Arc<CommandRouter>,
    gdm: Arc<GdmClient>,
    listener: ListenerSlot,
    on_server_list: Option<ServerListHook>,
}

impl CompanionService {
    pub fn new(
        settings: CompanionSettings,
        server: Arc<dyn MediaServerApi>,
        player: Arc<dyn Player>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let sink = Arc::new(HttpTimelineSink::new(
            settings.identity.clone(),
            settings.http_timeout,
        ));
        Self::with_sink(settings, server, player, notifier, sink)
    }

    /// Same as [`CompanionService::new`] with a custom timeline transport.
    pub fn with_sink(
        settings: CompanionSettings,
        server: Arc<dyn MediaServerApi>,
        player: Arc<dyn Player>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn TimelineSink>,
    ) -> Result<Self> {
        let ctx = Arc::new(ServiceContext::new());
        let queues = Arc::new(PlayQueues::new());
        let tasks = TaskQueue::new(settings.task_queue_capacity);

        let subscribers = Arc::new(SubscriptionManager::new(
            sink,
            queues.clone(),
            player.clone(),
            settings.subscribers.clone(),
        ));
        let router = Arc::new(CommandRouter::new(
            tasks.clone(),
            subscribers.clone(),
            player.clone(),
            settings.identity.clone(),
            ctx.clone(),
        ));
        let dispatcher = TaskDispatcher::new(server, player, notifier, queues, ctx.clone());
        let gdm = Arc::new(GdmClient::new(
            settings.identity.clone(),
            settings.gdm.clone(),
        )?);

        Ok(Self {
            settings,
            ctx,
            tasks,
            dispatcher,
            subscribers,
            router,
            gdm,
            listener: Arc::new(Mutex::new(None)),
            on_server_list: None,
        })
    }

    /// Called with the server list after each successful registration.
    pub fn on_server_list<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[ServerAddress]) + Send + Sync + 'static,
    {
        self.on_server_list = Some(Box::new(hook));
        self
    }

    pub fn handle(&self) -> CompanionHandle {
        CompanionHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Address the listener is bound to, once it is serving.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    pub fn subscribers(&self) -> &Arc<SubscriptionManager> {
        &self.subscribers
    }

    pub fn gdm(&self) -> &Arc<GdmClient> {
        &self.gdm
    }

    fn spawn_listener(&self) -> io::Result<JoinHandle<bool>> {
        let router = self.router.clone();
        let ctx = self.ctx.clone();
        let slot = self.listener.clone();
        let settings = self.settings.listener.clone();

        thread::Builder::new()
            .name("pkc-listener".into())
            .spawn(move || {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.port));
                let outcome = bind_with_retry(
                    || CommandListener::bind(addr, router.clone()),
                    settings.port,
                    settings.bind_attempts,
                    settings.bind_cooldown,
                    &ctx,
                );
                let Some(listener) = outcome.bound else {
                    return false;
                };

                let listener = Arc::new(listener);
                *slot.lock() = Some(listener.clone());
                if let Err(err) = listener.serve_forever(ctx.clone(), settings.shutdown_poll) {
                    error!(error = %err, "Companion listener failed");
                }
                slot.lock().take();
                listener.close();
                true
            })
    }

    /// Starts the listener thread, or restarts it if it died.
    fn ensure_listener(&self, state: &mut ListenerState) {
        let restart = match state {
            ListenerState::Unavailable => false,
            ListenerState::Idle => true,
            ListenerState::Running(handle) => handle.is_finished(),
        };
        if !restart {
            return;
        }

        if let ListenerState::Running(handle) = std::mem::replace(state, ListenerState::Idle) {
            match handle.join() {
                Ok(true) => warn!("Companion listener stopped, restarting it"),
                Ok(false) => {
                    *state = ListenerState::Unavailable;
                    return;
                }
                Err(_) => error!("Companion listener thread panicked, restarting it"),
            }
        }
        if self.ctx.should_stop() {
            return;
        }

        match self.spawn_listener() {
            Ok(handle) => *state = ListenerState::Running(handle),
            Err(err) => error!(error = %err, "Could not start the companion listener thread"),
        }
    }

    fn refresh_registration(&self) {
        if self.gdm.check_client_registration() {
            debug!("Client registration still valid");
            return;
        }
        match self.gdm.register_as_client() {
            Ok(()) => {
                let servers = self.gdm.list_servers();
                info!(servers = servers.len(), "Registered as companion client");
                if let Some(hook) = &self.on_server_list {
                    hook(&servers);
                }
            }
            Err(err) => warn!(error = %err, "Client registration failed"),
        }
    }

    fn refresh_timelines(&self) {
        self.subscribers.set_server_list(self.gdm.list_servers());
        let delivered = self.subscribers.notify();
        if delivered > 0 {
            debug!(delivered, "Timelines pushed");
        }
    }

    /// Runs until [`CompanionHandle::stop`] is called.
    pub fn run(&self) {
        info!(
            client = self.settings.identity.identifier.as_str(),
            port = self.settings.listener.port,
            "Companion service starting"
        );
        if let Err(err) = self.gdm.start_all(self.ctx.clone()) {
            warn!(error = %err, "GDM responder unavailable");
        }

        let _guard = ListenerGuard(&self.listener);
        let mut listener_state = ListenerState::Idle;
        let mut last_registration: Option<Instant> = None;
        let mut last_notify: Option<Instant> = None;

        while !self.ctx.should_stop() {
            if self.ctx.is_suspended() {
                info!("Companion service suspended");
                if !self.ctx.wait_while_suspended() {
                    break;
                }
                info!("Companion service resumed");
                continue;
            }

            self.ensure_listener(&mut listener_state);

            if due(last_registration, self.settings.registration_interval) {
                last_registration = Some(Instant::now());
                self.refresh_registration();
            }

            if self.ctx.take_state_changed() || due(last_notify, self.settings.notify_interval) {
                last_notify = Some(Instant::now());
                self.refresh_timelines();
            }

            if let Some(task) = self.tasks.pop_timeout(self.settings.idle_wait) {
                self.dispatcher.process_task(task);
            }
        }

        info!("Companion service stopping");
        self.subscribers.signal_stop();
        self.gdm.stop_all();
        if let Some(listener) = self.listener.lock().take() {
            listener.close();
        }
        if let ListenerState::Running(handle) = listener_state {
            if handle.join().is_err() {
                warn!("Companion listener thread panicked");
            }
        }
        info!("Companion service stopped");
    }
}
