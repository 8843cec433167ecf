//! Companion HTTP surface.
//!
//! [`CommandRouter`] turns requests into tasks, subscriptions and direct
//! player commands; [`app`] exposes it as an axum [`Router`] and
//! [`CommandListener`] serves that router on its own thread until the
//! service stops or the socket is closed.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, any};
use parking_lot::Mutex;
use pkcutils::{TransportProtocol, find_process_using_port};
use tokio::sync::watch;
use tokio::{runtime, task, time};
use tracing::{debug, error, info, warn};
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::collaborators::{NavigationCommand, Player, TransportCommand};
use crate::context::ServiceContext;
use crate::discovery::{CLIENT_CAPABILITIES, ClientIdentity};
use crate::errors::{CompanionError, Result};
use crate::model::MediaKind;
use crate::subscribers::{SubscribeRequest, SubscriptionManager};
use crate::tasks::{Task, TaskAction, TaskQueue};
use crate::timeline::TimelineContent;

const ACK_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response code="200" status="OK" />"#;
const NODE_ADDRESS: &str = "node.plexapp.com";
const CLIENT_ID_HEADER: HeaderName = HeaderName::from_static("x-plex-client-identifier");

/// Upper bound for one command against the player.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// How long open connections may linger once a stop is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const MIN_SHUTDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub struct ListenerSettings {
    pub port: u16,
    pub bind_attempts: u32,
    pub bind_cooldown: Duration,
    /// How often the serving thread checks for a stop request.
    pub shutdown_poll: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            port: 3005,
            bind_attempts: 10,
            bind_cooldown: Duration::from_secs(3),
            shutdown_poll: Duration::from_millis(500),
        }
    }
}

/// What a companion route needs from the HTTP request.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub peer: IpAddr,
}

impl CommandRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl<S> FromRequestParts<S> for CommandRequest
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let query = parts
            .uri
            .query()
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() else {
            error!("Companion request without peer address");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        };
        Ok(Self {
            query,
            headers: parts.headers.clone(),
            peer: peer.ip(),
        })
    }
}

/// XML reply of a companion route.
#[derive(Clone, Debug, PartialEq)]
pub struct CompanionReply {
    pub status: StatusCode,
    pub body: String,
}

impl CompanionReply {
    pub fn ack() -> Self {
        Self::xml(ACK_BODY.to_string())
    }

    pub fn xml(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

impl IntoResponse for CompanionReply {
    fn into_response(self) -> Response {
        if self.body.is_empty() {
            return self.status.into_response();
        }
        (
            self.status,
            [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
            self.body,
        )
            .into_response()
    }
}

/// Maps companion requests to their effect and builds the reply.
pub struct CommandRouter {
    tasks: TaskQueue,
    subscribers: Arc<SubscriptionManager>,
    player: Arc<dyn Player>,
    identity: ClientIdentity,
    identity_header: Option<HeaderValue>,
    ctx: Arc<ServiceContext>,
}

impl CommandRouter {
    pub fn new(
        tasks: TaskQueue,
        subscribers: Arc<SubscriptionManager>,
        player: Arc<dyn Player>,
        identity: ClientIdentity,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        let identity_header = HeaderValue::from_str(&identity.identifier).ok();
        if identity_header.is_none() {
            warn!(
                client = identity.identifier.as_str(),
                "Client identifier is not a valid header value"
            );
        }
        Self {
            tasks,
            subscribers,
            player,
            identity,
            identity_header,
            ctx,
        }
    }

    pub fn acknowledge(&self, _request: &CommandRequest) -> CompanionReply {
        CompanionReply::ack()
    }

    pub fn resources(&self, _request: &CommandRequest) -> CompanionReply {
        CompanionReply::xml(self.resources_xml())
    }

    pub fn subscribe(&self, request: &CommandRequest) -> CompanionReply {
        let Some(client_id) = request.header("X-Plex-Client-Identifier") else {
            warn!(peer = %request.peer, "Subscription without client identifier");
            return CompanionReply::ack();
        };
        let Some(port) = request.param("port").and_then(|p| p.parse::<u16>().ok()) else {
            warn!(subscriber = client_id, "Subscription without a valid port");
            return CompanionReply::ack();
        };

        self.subscribers.subscribe(SubscribeRequest {
            client_id: client_id.to_string(),
            host: request.peer.to_string(),
            port,
            protocol: request.param("protocol").unwrap_or("http").to_string(),
            command_id: request.param("commandID").map(str::to_string),
            content: TimelineContent::parse(request.param("content")),
        });
        self.ctx.mark_state_changed();
        CompanionReply::ack()
    }

    pub fn unsubscribe(&self, request: &CommandRequest) -> CompanionReply {
        if let Some(id) = request.header("X-Plex-Client-Identifier") {
            self.subscribers.unsubscribe(id);
        }
        CompanionReply::ack()
    }

    pub fn poll(&self, request: &CommandRequest) -> CompanionReply {
        CompanionReply::xml(self.subscribers.poll(
            request.param("commandID"),
            request.header("X-Plex-Client-Identifier"),
        ))
    }

    pub fn play_media(&self, request: &CommandRequest) -> CompanionReply {
        self.enqueue(playmedia_action(request), request, is_assistant(request))
    }

    pub fn refresh_play_queue(&self, request: &CommandRequest) -> CompanionReply {
        self.enqueue(TaskAction::RefreshPlayQueue, request, false)
    }

    pub fn set_streams(&self, request: &CommandRequest) -> CompanionReply {
        self.enqueue(TaskAction::SetStreams, request, false)
    }

    pub fn seek_to(&self, request: &CommandRequest) -> CompanionReply {
        let result = request
            .param("offset")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| CompanionError::missing("offset"))
            .and_then(|offset| self.player.seek(kind_param(request), offset as u64));
        self.report("seekTo", result);
        CompanionReply::ack()
    }

    pub fn set_parameters(&self, request: &CommandRequest) -> CompanionReply {
        match request.param("volume").and_then(|v| v.parse::<u32>().ok()) {
            Some(volume) => {
                let volume = volume.min(100) as u8;
                self.report("setParameters", self.player.set_volume(volume));
            }
            None => debug!("setParameters without volume"),
        }
        CompanionReply::ack()
    }

    /// `/player/playback/<name>` commands sent straight to the player.
    pub fn transport(&self, name: &str, request: &CommandRequest) -> CompanionReply {
        let Some(command) = TransportCommand::from_route(name) else {
            debug!(command = name, "Unknown playback command");
            return CompanionReply::empty(StatusCode::NOT_FOUND);
        };
        self.report(name, self.player.transport(kind_param(request), command));
        CompanionReply::ack()
    }

    pub fn navigation(&self, name: &str, _request: &CommandRequest) -> CompanionReply {
        let Some(command) = NavigationCommand::from_route(name) else {
            debug!(command = name, "Unknown navigation command");
            return CompanionReply::empty(StatusCode::NOT_FOUND);
        };
        self.report(name, self.player.navigate(command));
        CompanionReply::ack()
    }

    fn decorate(&self, headers: &mut HeaderMap) {
        if let Some(identifier) = &self.identity_header {
            headers.insert(CLIENT_ID_HEADER, identifier.clone());
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("X-Plex-Client-Identifier"),
        );
    }

    fn enqueue(&self, action: TaskAction, request: &CommandRequest, from_assistant: bool) -> CompanionReply {
        let mut params = request.query.clone();
        if !params.contains_key("token") {
            if let Some(token) = request.header("X-Plex-Token") {
                params.insert("token".to_string(), token.to_string());
            }
        }

        match Task::decode(action, &params) {
            Ok(task) => {
                let task = if from_assistant { task.from_assistant() } else { task };
                info!(task = action.as_str(), "Remote command queued");
                self.tasks.push(task);
            }
            Err(err) => warn!(task = action.as_str(), error = %err, "Dropping malformed command"),
        }
        CompanionReply::ack()
    }

    fn report(&self, command: &str, result: Result<()>) {
        match result {
            Ok(()) => self.ctx.mark_state_changed(),
            Err(err) => warn!(command, error = %err, "Player command failed"),
        }
    }

    fn resources_xml(&self) -> String {
        let mut root = Element::new("MediaContainer");
        let mut player = Element::new("Player");
        let id = &self.identity;
        for (name, value) in [
            ("title", id.name.as_str()),
            ("protocol", "plex"),
            ("protocolVersion", "1"),
            ("protocolCapabilities", CLIENT_CAPABILITIES),
            ("machineIdentifier", id.identifier.as_str()),
            ("product", id.product.as_str()),
            ("platform", id.platform.as_str()),
            ("platformVersion", id.platform_version.as_str()),
            ("deviceClass", id.device_class.as_str()),
        ] {
            player.attributes.insert(name.to_string(), value.to_string());
        }
        root.children.push(XMLNode::Element(player));

        let mut buf = Vec::new();
        let config = EmitterConfig::new()
            .write_document_declaration(true)
            .perform_indent(false);
        if root.write_with_config(&mut buf, config).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn kind_param(request: &CommandRequest) -> Option<MediaKind> {
    request.param("type").and_then(MediaKind::from_plex_type)
}

fn is_assistant(request: &CommandRequest) -> bool {
    ["X-Plex-Product", "X-Plex-Device-Name", "X-Plex-Device"]
        .iter()
        .filter_map(|h| request.header(h))
        .any(|v| v.to_ascii_lowercase().contains("alexa"))
}

/// Decides which task a `playMedia` request becomes.
fn playmedia_action(request: &CommandRequest) -> TaskAction {
    if request.param("address") == Some(NODE_ADDRESS) {
        TaskAction::NavigateNode
    } else if is_assistant(request) {
        TaskAction::PlayItem
    } else if request
        .param("containerKey")
        .is_some_and(|c| c.starts_with("/playQueues"))
    {
        TaskAction::PlayPlaylist
    } else {
        TaskAction::PlayItem
    }
}

type RouteFn = fn(&CommandRouter, &CommandRequest) -> CompanionReply;

/// Runs `work` off the async thread; the player may block on Kodi.
async fn run_blocking<F>(work: F) -> CompanionReply
where
    F: FnOnce() -> CompanionReply + Send + 'static,
{
    match time::timeout(COMMAND_TIMEOUT, task::spawn_blocking(work)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            warn!(error = %err, "Companion command task failed");
            CompanionReply::empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => {
            warn!(timeout = ?COMMAND_TIMEOUT, "Companion command exceeded its time limit");
            CompanionReply::empty(StatusCode::GATEWAY_TIMEOUT)
        }
    }
}

fn route(handler: RouteFn) -> MethodRouter<Arc<CommandRouter>> {
    any(
        move |State(router): State<Arc<CommandRouter>>, request: CommandRequest| {
            run_blocking(move || handler(&router, &request))
        },
    )
}

async fn playback_command(
    State(router): State<Arc<CommandRouter>>,
    Path(name): Path<String>,
    request: CommandRequest,
) -> CompanionReply {
    run_blocking(move || router.transport(&name, &request)).await
}

async fn navigation_command(
    State(router): State<Arc<CommandRouter>>,
    Path(name): Path<String>,
    request: CommandRequest,
) -> CompanionReply {
    run_blocking(move || router.navigation(&name, &request)).await
}

async fn unknown_route(request: Request) -> StatusCode {
    debug!(path = request.uri().path(), "Unknown companion route");
    StatusCode::NOT_FOUND
}

/// Answers CORS preflights and stamps every reply with the client identity.
async fn companion_headers(
    State(router): State<Arc<CommandRouter>>,
    request: Request,
    next: Next,
) -> Response {
    debug!(
        method = %request.method(),
        path = request.uri().path(),
        "Companion request"
    );
    let mut response = if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, OPTIONS"),
        );
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("1209600"));
        response
    } else {
        next.run(request).await
    };
    router.decorate(response.headers_mut());
    response
}

/// The companion routes. Requests must carry `ConnectInfo<SocketAddr>`.
pub fn app(router: Arc<CommandRouter>) -> Router {
    Router::new()
        .route("/version", route(CommandRouter::acknowledge))
        .route("/verify", route(CommandRouter::acknowledge))
        .route("/resources", route(CommandRouter::resources))
        .route("/player/timeline/subscribe", route(CommandRouter::subscribe))
        .route("/player/timeline/unsubscribe", route(CommandRouter::unsubscribe))
        .route("/player/timeline/poll", route(CommandRouter::poll))
        .route("/player/playback/playMedia", route(CommandRouter::play_media))
        .route(
            "/player/playback/refreshPlayQueue",
            route(CommandRouter::refresh_play_queue),
        )
        .route("/player/playback/setStreams", route(CommandRouter::set_streams))
        .route("/player/playback/seekTo", route(CommandRouter::seek_to))
        .route("/player/playback/setParameters", route(CommandRouter::set_parameters))
        .route("/player/playback/{command}", any(playback_command))
        .route("/player/navigation/{command}", any(navigation_command))
        .fallback(unknown_route)
        .layer(middleware::from_fn_with_state(router.clone(), companion_headers))
        .with_state(router)
}

/// Resolves once the service stops or the listener is closed.
async fn stop_requested(ctx: Arc<ServiceContext>, mut closed: watch::Receiver<bool>, poll: Duration) {
    let mut ticker = time::interval(poll.max(MIN_SHUTDOWN_POLL));
    loop {
        if ctx.should_stop() || *closed.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = closed.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// TCP side of the companion surface.
pub struct CommandListener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    router: Arc<CommandRouter>,
    closed: watch::Sender<bool>,
}

impl CommandListener {
    pub fn bind(addr: SocketAddr, router: Arc<CommandRouter>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Companion listener bound");
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            router,
            closed: watch::Sender::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Serves the companion routes on a single-threaded runtime owned by the
    /// calling thread. Returns once a stop is requested or [`close`] is
    /// called; connections still open after a short grace are dropped.
    ///
    /// [`close`]: CommandListener::close
    pub fn serve_forever(&self, ctx: Arc<ServiceContext>, poll: Duration) -> io::Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "listener closed"));
        };
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let service = app(self.router.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let closed = self.closed.subscribe();

        let served: io::Result<()> = runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let graceful = stop_requested(ctx.clone(), closed.clone(), poll);
            let server = axum::serve(listener, service).with_graceful_shutdown(graceful);
            tokio::select! {
                served = server.into_future() => served,
                _ = async {
                    stop_requested(ctx, closed, poll).await;
                    time::sleep(SHUTDOWN_GRACE).await;
                } => {
                    warn!("Companion connections still open, dropping them");
                    Ok(())
                }
            }
        });
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        self.close();
        debug!("Companion listener loop finished");
        served
    }

    pub fn close(&self) {
        let was_closed = self.closed.send_replace(true);
        self.listener.lock().take();
        if !was_closed {
            info!(address = %self.local_addr, "Companion listener closed");
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
pub struct BindOutcome<T> {
    pub bound: Option<T>,
    pub failures: u32,
    /// Retries ended because a stop was requested.
    pub stopped: bool,
}

/// Calls `attempt` until it succeeds, at most `attempts` times, sleeping
/// `cooldown` between tries. Returns early when a stop is requested.
pub fn bind_with_retry<T, F>(
    mut attempt: F,
    port: u16,
    attempts: u32,
    cooldown: Duration,
    ctx: &ServiceContext,
) -> BindOutcome<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut failures = 0;
    for n in 1..=attempts.max(1) {
        if ctx.should_stop() {
            break;
        }
        match attempt() {
            Ok(bound) => {
                return BindOutcome {
                    bound: Some(bound),
                    failures,
                    stopped: false,
                };
            }
            Err(err) => {
                failures += 1;
                error!(port, attempt = n, error = %err, "Companion listener bind failed");
                if err.kind() == ErrorKind::AddrInUse {
                    if let Some(owner) = find_process_using_port(port, TransportProtocol::Tcp) {
                        warn!(port, owner = %owner, "Port already in use");
                    }
                }
                if n < attempts && !ctx.sleep(cooldown) {
                    break;
                }
            }
        }
    }

    let stopped = ctx.should_stop();
    if stopped {
        debug!(port, failures, "Companion listener bind abandoned on stop");
    } else {
        error!(port, failures, "Companion listener unavailable, running discovery only");
    }
    BindOutcome {
        bound: None,
        failures,
        stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playqueue::PlayQueues;
    use crate::subscribers::SubscriberSettings;
    use crate::tasks::{StreamChange, SubtitleChange};
    use crate::testing::{RecordingPlayer, RecordingSink};
    use axum::body::{Body, to_bytes};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::thread;
    use std::time::Instant;
    use tower::ServiceExt;

    struct Fixture {
        router: CommandRouter,
        tasks: TaskQueue,
        subscribers: Arc<SubscriptionManager>,
        player: Arc<RecordingPlayer>,
    }

    fn identity() -> ClientIdentity {
        ClientIdentity {
            identifier: "client-1".into(),
            name: "Living room".into(),
            product: "PKCompanion".into(),
            version: "0.1.0".into(),
            port: 3005,
            device_class: "pc".into(),
            platform: "Linux".into(),
            platform_version: "6.1".into(),
        }
    }

    fn fixture() -> Fixture {
        let tasks = TaskQueue::new(8);
        let player = Arc::new(RecordingPlayer::default());
        let subscribers = Arc::new(SubscriptionManager::new(
            Arc::new(RecordingSink::default()),
            Arc::new(PlayQueues::new()),
            player.clone(),
            SubscriberSettings::default(),
        ));
        let router = CommandRouter::new(
            tasks.clone(),
            subscribers.clone(),
            player.clone(),
            identity(),
            Arc::new(ServiceContext::new()),
        );
        Fixture {
            router,
            tasks,
            subscribers,
            player,
        }
    }

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    fn request(query: &[(&str, &str)], headers: &[(&str, &str)]) -> CommandRequest {
        CommandRequest {
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: headers
                .iter()
                .map(|(k, v)| {
                    (
                        HeaderName::from_bytes(k.as_bytes()).unwrap(),
                        HeaderValue::from_str(v).unwrap(),
                    )
                })
                .collect(),
            peer: peer(),
        }
    }

    fn next_task(tasks: &TaskQueue) -> Option<Task> {
        tasks.pop_timeout(Duration::from_millis(10))
    }

    /// Sends one request through the axum app, as if from `peer()`.
    async fn call(router: CommandRouter, method: Method, uri: &str, headers: &[(&str, &str)]) -> Response {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::new(peer(), 50_000)));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        app(Arc::new(router))
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_playmedia_with_queue_becomes_playlist_task() {
        let f = fixture();
        let reply = f.router.play_media(&request(
            &[
                ("key", "/library/metadata/12"),
                ("containerKey", "/playQueues/77?repeat=1"),
                ("type", "video"),
                ("offset", "4000"),
            ],
            &[("X-Plex-Token", "transient-1")],
        ));
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.body.contains(r#"code="200""#));

        match next_task(&f.tasks) {
            Some(Task::PlayPlaylist(req)) => {
                assert_eq!(req.play_queue_id, "77");
                assert_eq!(req.kind, Some(MediaKind::Video));
                assert_eq!(req.offset_ms, 4000);
                assert_eq!(req.token.as_deref(), Some("transient-1"));
            }
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[test]
    fn test_playmedia_routing() {
        let f = fixture();
        f.router.play_media(&request(
            &[("key", "/library/sections/1"), ("address", "node.plexapp.com")],
            &[],
        ));
        assert!(matches!(next_task(&f.tasks), Some(Task::NavigateNode(_))));

        f.router.play_media(&request(
            &[("key", "/library/metadata/3"), ("containerKey", "/playQueues/5")],
            &[("X-Plex-Product", "Plex for Alexa")],
        ));
        match next_task(&f.tasks) {
            Some(Task::PlayItem(req)) => assert!(req.from_assistant),
            other => panic!("unexpected task {:?}", other),
        }

        f.router
            .play_media(&request(&[("key", "/library/metadata/3")], &[]));
        match next_task(&f.tasks) {
            Some(Task::PlayItem(req)) => assert!(!req.from_assistant),
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[test]
    fn test_set_streams_and_refresh_are_queued() {
        let f = fixture();
        f.router
            .set_streams(&request(&[("type", "video"), ("subtitleStreamID", "0")], &[]));
        f.router
            .refresh_play_queue(&request(&[("playQueueID", "42"), ("type", "music")], &[]));

        match next_task(&f.tasks) {
            Some(Task::SetStreams(req)) => {
                assert_eq!(req.change, StreamChange::Subtitle(SubtitleChange::Off))
            }
            other => panic!("unexpected task {:?}", other),
        }
        assert!(matches!(next_task(&f.tasks), Some(Task::RefreshPlayQueue(_))));
    }

    #[test]
    fn test_malformed_command_is_acknowledged_and_dropped() {
        let f = fixture();
        let reply = f.router.refresh_play_queue(&request(&[], &[]));
        assert_eq!(reply.status, StatusCode::OK);
        assert!(f.tasks.is_empty());
    }

    #[test]
    fn test_subscribe_uses_peer_address() {
        let f = fixture();
        f.router.subscribe(&request(
            &[("protocol", "http"), ("port", "32500"), ("commandID", "3")],
            &[("X-Plex-Client-Identifier", "remote-a")],
        ));
        let subscriber = f.subscribers.subscriber("remote-a").unwrap();
        assert_eq!(subscriber.host, "10.0.0.7");
        assert_eq!(subscriber.port, 32500);
        assert_eq!(subscriber.command_id.as_deref(), Some("3"));

        f.router
            .unsubscribe(&request(&[], &[("X-Plex-Client-Identifier", "remote-a")]));
        assert_eq!(f.subscribers.subscriber_count(), 0);
    }

    #[test]
    fn test_direct_player_commands() {
        let f = fixture();
        f.router.transport("pause", &request(&[("type", "music")], &[]));
        f.router.seek_to(&request(&[("offset", "9000")], &[]));
        f.router.set_parameters(&request(&[("volume", "150")], &[]));
        f.router.navigation("moveUp", &request(&[], &[]));

        assert_eq!(
            f.player.calls(),
            vec![
                "transport:Some(Audio):Pause",
                "seek:None:9000",
                "volume:100",
                "navigate:Up",
            ]
        );
        assert!(f.tasks.is_empty());
        assert_eq!(
            f.router.transport("explode", &request(&[], &[])).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_resources_and_poll() {
        let f = fixture();
        let xml = f.router.resources(&request(&[], &[])).body;
        assert!(xml.contains(r#"machineIdentifier="client-1""#));
        assert!(xml.contains(r#"protocolCapabilities="timeline,playback,navigation,playqueues""#));

        let poll = f.router.poll(&request(&[("commandID", "8")], &[]));
        assert!(poll.body.contains(r#"commandID="8""#));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = call(fixture().router, Method::GET, "/nope", &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CLIENT_ID_HEADER], "client-1");

        let response = call(fixture().router, Method::GET, "/player/playback/explode", &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_options_preflight_has_cors_headers() {
        let f = fixture();
        let player = f.player.clone();
        let response = call(f.router, Method::OPTIONS, "/player/playback/play", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "1209600");
        assert!(player.calls().is_empty());
    }

    #[tokio::test]
    async fn test_app_routes_commands() {
        let f = fixture();
        let tasks = f.tasks.clone();
        let player = f.player.clone();
        let app = app(Arc::new(f.router));
        let peer_info = ConnectInfo(SocketAddr::new(peer(), 50_000));

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/player/playback/playMedia?key=%2Flibrary%2Fmetadata%2F3&type=music")
                    .header("X-Plex-Device-Name", "Alexa Echo")
                    .extension(peer_info)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CLIENT_ID_HEADER], "client-1");
        assert!(body_text(response).await.contains(r#"status="OK""#));
        match next_task(&tasks) {
            Some(Task::PlayItem(req)) => {
                assert_eq!(req.key, "/library/metadata/3");
                assert!(req.from_assistant);
            }
            other => panic!("unexpected task {:?}", other),
        }

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::PUT)
                    .uri("/player/navigation/back")
                    .extension(peer_info)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(player.calls(), vec!["navigate:Back"]);
    }

    #[tokio::test]
    async fn test_resources_over_app() {
        let response = call(fixture().router, Method::GET, "/resources", &[]).await;
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/xml; charset=utf-8"
        );
        assert!(body_text(response).await.contains(r#"<Player title="Living room""#));
    }

    #[test]
    fn test_stalled_client_does_not_block_commands_or_shutdown() {
        let f = fixture();
        let tasks = f.tasks.clone();
        let ctx = Arc::new(ServiceContext::new());
        let listener = Arc::new(
            CommandListener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(f.router)).unwrap(),
        );
        let addr = listener.local_addr();
        let server = {
            let listener = listener.clone();
            let ctx = ctx.clone();
            thread::spawn(move || listener.serve_forever(ctx, Duration::from_millis(20)))
        };

        let mut stalled = TcpStream::connect(addr).unwrap();
        stalled.write_all(b"GET /player/playback/pla").unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(
                b"GET /player/playback/refreshPlayQueue?playQueueID=9&type=video HTTP/1.1\r\n\
                  Host: localhost\r\nConnection: close\r\n\r\n",
            )
            .unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply
            .to_ascii_lowercase()
            .contains("x-plex-client-identifier: client-1"));
        assert!(matches!(next_task(&tasks), Some(Task::RefreshPlayQueue(_))));

        let started = Instant::now();
        listener.close();
        server.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!listener.is_open());
        drop(stalled);
    }

    #[test]
    fn test_serve_stops_on_request_and_close_is_final() {
        let f = fixture();
        let ctx = Arc::new(ServiceContext::new());
        let listener = Arc::new(
            CommandListener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(f.router)).unwrap(),
        );
        assert!(listener.is_open());
        let server = {
            let listener = listener.clone();
            let ctx = ctx.clone();
            thread::spawn(move || listener.serve_forever(ctx, Duration::from_millis(20)))
        };

        thread::sleep(Duration::from_millis(50));
        ctx.request_stop();
        server.join().unwrap().unwrap();
        assert!(!listener.is_open());

        let err = listener
            .serve_forever(Arc::new(ServiceContext::new()), Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_bind_succeeds_after_three_failures() {
        let ctx = ServiceContext::new();
        let mut calls = 0;
        let outcome = bind_with_retry(
            || {
                calls += 1;
                if calls <= 3 {
                    Err(io::Error::other("busy"))
                } else {
                    Ok(calls)
                }
            },
            3005,
            10,
            Duration::from_millis(1),
            &ctx,
        );
        assert_eq!(outcome.failures, 3);
        assert_eq!(outcome.bound, Some(4));
    }

    #[test]
    fn test_bind_gives_up_after_attempts() {
        let ctx = ServiceContext::new();
        let outcome: BindOutcome<()> = bind_with_retry(
            || Err(io::Error::other("busy")),
            3005,
            2,
            Duration::from_millis(1),
            &ctx,
        );
        assert!(outcome.bound.is_none());
        assert_eq!(outcome.failures, 2);
        assert!(!outcome.stopped);
    }

    #[test]
    fn test_bind_stops_when_requested() {
        let ctx = ServiceContext::new();
        ctx.request_stop();
        let outcome: BindOutcome<()> =
            bind_with_retry(|| Ok(()), 3005, 5, Duration::from_millis(1), &ctx);
        assert!(outcome.bound.is_none());
        assert_eq!(outcome.failures, 0);
        assert!(outcome.stopped);
    }

    #[test]
    fn test_bind_interrupted_by_stop_during_cooldown() {
        let ctx = Arc::new(ServiceContext::new());
        let stopper = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctx.request_stop();
            })
        };
        let started = Instant::now();
        let outcome: BindOutcome<()> = bind_with_retry(
            || Err(io::Error::other("busy")),
            3005,
            10,
            Duration::from_secs(5),
            &ctx,
        );
        stopper.join().unwrap();
        assert!(outcome.bound.is_none());
        assert_eq!(outcome.failures, 1);
        assert!(outcome.stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
