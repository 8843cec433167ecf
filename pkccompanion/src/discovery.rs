//! GDM ("G'Day Mate") discovery: announces this player on the local network
//! and finds media servers.
//!
//! Three UDP ports are involved, all on the GDM multicast group:
//!
//! * register port (32413): `HELLO` / `BYE` presence announcements,
//! * discover port (32414): `M-SEARCH` searches for servers, answered by
//!   unicast `HTTP/1.0 200 OK` datagrams,
//! * update port (32412): servers search for players here; the responder thread
//!   started by [`GdmClient::start_all`] answers with the client details.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quick_xml::Reader;
use quick_xml::events::Event;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};
use ureq::Agent;

use crate::context::ServiceContext;
use crate::errors::{CompanionError, Result};

pub const GDM_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 250);
pub const CLIENT_CAPABILITIES: &str = "timeline,playback,navigation,playqueues";

const RECV_POLL: Duration = Duration::from_millis(250);
const DEFAULT_SERVER_PORT: u16 = 32400;

#[derive(Clone, Debug, PartialEq)]
pub struct GdmSettings {
    pub multicast_address: Ipv4Addr,
    pub register_port: u16,
    pub discover_port: u16,
    pub update_port: u16,
    pub discover_timeout: Duration,
    pub discover_interval: Duration,
    /// Servers silent for longer than this are forgotten.
    pub server_ttl: Duration,
    pub http_timeout: Duration,
}

impl Default for GdmSettings {
    fn default() -> Self {
        Self {
            multicast_address: GDM_MULTICAST_ADDR,
            register_port: 32413,
            discover_port: 32414,
            update_port: 32412,
            discover_timeout: Duration::from_secs(2),
            discover_interval: Duration::from_secs(120),
            server_ttl: Duration::from_secs(600),
            http_timeout: Duration::from_secs(5),
        }
    }
}

/// How this player presents itself to servers and controllers.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientIdentity {
    pub identifier: String,
    pub name: String,
    pub product: String,
    pub version: String,
    pub port: u16,
    pub device_class: String,
    pub platform: String,
    pub platform_version: String,
}

impl ClientIdentity {
    /// Header block shared by `HELLO`, `BYE` and search replies.
    pub fn client_details(&self) -> String {
        format!(
            "Content-Type: plex/media-player\r\n\
             Resource-Identifier: {}\r\n\
             Name: {}\r\n\
             Port: {}\r\n\
             Product: {}\r\n\
             Version: {}\r\n\
             Protocol: plex\r\n\
             Protocol-Version: 1\r\n\
             Protocol-Capabilities: {}\r\n\
             Device-Class: {}\r\n",
            self.identifier,
            self.name,
            self.port,
            self.product,
            self.version,
            CLIENT_CAPABILITIES,
            self.device_class
        )
    }
}

/// A media server learned from a GDM reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerAddress {
    pub identifier: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub content_type: Option<String>,
    pub version: Option<String>,
    pub updated_at: Option<String>,
}

impl ServerAddress {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Identity plus the servers known at the last discovery.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientRegistration {
    pub identity: ClientIdentity,
    pub servers: Vec<ServerAddress>,
}

struct KnownServer {
    server: ServerAddress,
    last_seen: Instant,
}

pub struct GdmClient {
    settings: GdmSettings,
    identity: ClientIdentity,
    socket: UdpSocket,
    servers: Mutex<Vec<KnownServer>>,
    discover_lock: Mutex<()>,
    agent: Agent,
    running: Arc<AtomicBool>,
    responder: Mutex<Option<JoinHandle<()>>>,
    responder_port: Mutex<Option<u16>>,
}

impl GdmClient {
    /// Opens the announcement socket used for the lifetime of the client.
    pub fn new(identity: ClientIdentity, settings: GdmSettings) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&bind_addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_POLL))?;
        socket.set_multicast_ttl_v4(1)?;

        debug!(
            client = identity.identifier.as_str(),
            "GDM client details:\n{}",
            identity.client_details()
        );

        let agent = Agent::config_builder()
            .timeout_global(Some(settings.http_timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(Self {
            settings,
            identity,
            socket,
            servers: Mutex::new(Vec::new()),
            discover_lock: Mutex::new(()),
            agent,
            running: Arc::new(AtomicBool::new(false)),
            responder: Mutex::new(None),
            responder_port: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn registration(&self) -> ClientRegistration {
        ClientRegistration {
            identity: self.identity.clone(),
            servers: self.list_servers(),
        }
    }

    fn send_announcement(&self, verb: &str) -> io::Result<()> {
        let message = format!("{} * HTTP/1.0\r\n{}", verb, self.identity.client_details());
        let target = SocketAddrV4::new(self.settings.multicast_address, self.settings.register_port);
        self.socket.send_to(message.as_bytes(), target)?;
        trace!(verb, %target, "GDM announcement sent");
        Ok(())
    }

    /// Announces this client, then collects server replies for up to the
    /// discovery timeout.
    pub fn register_as_client(&self) -> Result<()> {
        self.send_announcement("HELLO")?;
        self.discover()?;
        Ok(())
    }

    /// Searches the discover port and returns the servers that answered this
    /// round. Answers are merged into the known server list.
    pub fn discover(&self) -> Result<Vec<ServerAddress>> {
        let _guard = self.discover_lock.lock();

        let search = "M-SEARCH * HTTP/1.0\r\n\r\n";
        let target = SocketAddrV4::new(self.settings.multicast_address, self.settings.discover_port);
        self.socket.send_to(search.as_bytes(), target)?;

        let deadline = Instant::now() + self.settings.discover_timeout;
        let mut found: Vec<ServerAddress> = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let data = String::from_utf8_lossy(&buf[..n]);
                    match parse_server_reply(&data, from) {
                        Some(server) => {
                            if !found.iter().any(|s| s.identifier == server.identifier) {
                                debug!(
                                    server = server.name.as_str(),
                                    address = %from,
                                    "GDM server found"
                                );
                                found.push(server);
                            }
                        }
                        None => trace!(%from, "Ignoring GDM datagram"),
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("GDM read error: {}", e);
                    break;
                }
            }
        }

        info!(count = found.len(), "GDM discovery finished");
        self.merge_servers(&found, Instant::now());
        Ok(found)
    }

    /// Refreshes the entries of `found` and drops the servers not heard
    /// from within the server ttl. First-seen order is kept.
    fn merge_servers(&self, found: &[ServerAddress], now: Instant) {
        let ttl = self.settings.server_ttl;
        let mut known = self.servers.lock();
        known.retain(|entry| {
            let answered = found.iter().any(|s| s.identifier == entry.server.identifier);
            let fresh = now.saturating_duration_since(entry.last_seen) < ttl;
            if !answered && !fresh {
                info!(server = entry.server.name.as_str(), "GDM server expired");
            }
            answered || fresh
        });
        for server in found {
            match known
                .iter_mut()
                .find(|entry| entry.server.identifier == server.identifier)
            {
                Some(entry) => {
                    entry.server = server.clone();
                    entry.last_seen = now;
                }
                None => known.push(KnownServer {
                    server: server.clone(),
                    last_seen: now,
                }),
            }
        }
    }

    /// Known servers. Empty when none has answered yet.
    pub fn list_servers(&self) -> Vec<ServerAddress> {
        self.servers
            .lock()
            .iter()
            .map(|entry| entry.server.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_servers(&self, servers: Vec<ServerAddress>) {
        self.servers.lock().clear();
        self.merge_servers(&servers, Instant::now());
    }

    /// Whether the first known server lists this client in its roster.
    pub fn check_client_registration(&self) -> bool {
        let first = self.servers.lock().first().map(|entry| entry.server.clone());
        let Some(server) = first else {
            debug!("No server known, client not registered");
            return false;
        };

        match self.fetch_roster(&server) {
            Ok(listed) => {
                if !listed {
                    debug!(server = server.name.as_str(), "Client missing from server roster");
                }
                listed
            }
            Err(err) => {
                warn!(server = server.name.as_str(), error = %err, "Client roster check failed");
                false
            }
        }
    }

    fn fetch_roster(&self, server: &ServerAddress) -> Result<bool> {
        let url = format!("{}/clients", server.base_url());
        let response = self
            .agent
            .get(&url)
            .header("X-Plex-Client-Identifier", &self.identity.identifier)
            .header("Accept", "application/xml")
            .call()?;
        if !response.status().is_success() {
            return Err(CompanionError::HttpStatus(url, response.status().as_u16()));
        }
        let (_parts, body) = response.into_parts();
        roster_contains(BufReader::new(body.into_reader()), &self.identity.identifier)
    }

    /// Starts the responder thread on the update port. Periodic discovery
    /// pauses while `ctx` is suspended.
    pub fn start_all(self: &Arc<Self>, ctx: Arc<ServiceContext>) -> Result<()> {
        let mut responder = self.responder.lock();
        if responder.is_some() {
            return Ok(());
        }

        let socket = open_update_socket(&self.settings)?;
        let port = socket.local_addr()?.port();
        *self.responder_port.lock() = Some(port);
        self.running.store(true, Ordering::SeqCst);

        let client = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gdm-responder".into())
            .spawn(move || client.run_responder(socket, &ctx))?;
        *responder = Some(handle);

        info!(port, "GDM responder started");
        Ok(())
    }

    /// Port the responder is listening on, once started.
    pub fn responder_port(&self) -> Option<u16> {
        *self.responder_port.lock()
    }

    fn run_responder(&self, socket: UdpSocket, ctx: &ServiceContext) {
        let reply = format!("HTTP/1.0 200 OK\r\n{}", self.identity.client_details());
        let mut last_discovery = Instant::now();
        let mut buf = [0u8; 2048];

        while self.running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let data = String::from_utf8_lossy(&buf[..n]);
                    if data.starts_with("M-SEARCH * HTTP/1.") {
                        trace!(%from, "Answering GDM search");
                        if let Err(e) = socket.send_to(reply.as_bytes(), from) {
                            warn!(%from, "Failed to answer GDM search: {}", e);
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("GDM responder read error: {}", e);
                    thread::sleep(RECV_POLL);
                }
            }

            if !ctx.is_suspended() && last_discovery.elapsed() >= self.settings.discover_interval {
                last_discovery = Instant::now();
                if let Err(err) = self.discover() {
                    warn!(error = %err, "Periodic GDM discovery failed");
                }
            }
        }
        debug!("GDM responder stopped");
    }

    /// Says `BYE` and stops the responder thread.
    pub fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.send_announcement("BYE") {
            warn!("Failed to send GDM BYE: {}", e);
        }
        if let Some(handle) = self.responder.lock().take() {
            if handle.join().is_err() {
                warn!("GDM responder thread panicked");
            }
        }
        *self.responder_port.lock() = None;
        info!("GDM client stopped");
    }
}

fn open_update_socket(settings: &GdmSettings) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.update_port);
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(RECV_POLL))?;

    if settings.multicast_address.is_multicast() {
        for iface in pkcutils::ipv4_interfaces() {
            match socket.join_multicast_v4(&settings.multicast_address, &iface) {
                Ok(()) => debug!("GDM: joined {} on {}", settings.multicast_address, iface),
                Err(e) => warn!(
                    "GDM: failed to join {} on {}: {}",
                    settings.multicast_address, iface, e
                ),
            }
        }
    }
    Ok(socket)
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

/// Parses a server's `HTTP/1.0 200 OK` reply to an `M-SEARCH`.
pub fn parse_server_reply(data: &str, from: SocketAddr) -> Option<ServerAddress> {
    let mut lines = data.lines();
    let status = lines.next()?.trim();
    if !(status.starts_with("HTTP/1.") && status.contains(" 200 ")) && !status.ends_with(" 200") {
        return None;
    }
    let headers = parse_headers(lines);
    let identifier = headers.get("resource-identifier")?.clone();
    if identifier.is_empty() {
        return None;
    }

    Some(ServerAddress {
        name: headers.get("name").cloned().unwrap_or_else(|| identifier.clone()),
        identifier,
        host: from.ip().to_string(),
        port: headers
            .get("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_SERVER_PORT),
        content_type: headers.get("content-type").cloned(),
        version: headers.get("version").cloned(),
        updated_at: headers.get("updated-at").cloned(),
    })
}

/// Scans a `/clients` document for a `Server` entry with our identifier.
pub fn roster_contains<R: BufRead>(input: R, identifier: &str) -> Result<bool> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(CompanionError::xml)? {
            Event::Start(e) | Event::Empty(e) => {
                let listed = e.attributes().flatten().any(|attr| {
                    attr.key.as_ref() == b"machineIdentifier"
                        && attr.value.as_ref() == identifier.as_bytes()
                });
                if listed {
                    return Ok(true);
                }
            }
            Event::Eof => return Ok(false),
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_http;
    use axum::http::StatusCode;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            identifier: "client-1".into(),
            name: "Kodi".into(),
            product: "PlexKodiConnect".into(),
            version: "2.0.0".into(),
            port: 3005,
            device_class: "pc".into(),
            platform: "Linux".into(),
            platform_version: "6".into(),
        }
    }

    fn loopback_settings() -> GdmSettings {
        GdmSettings {
            multicast_address: Ipv4Addr::LOCALHOST,
            discover_timeout: Duration::from_millis(400),
            update_port: 0,
            ..GdmSettings::default()
        }
    }

    #[test]
    fn test_client_details_headers() {
        let details = identity().client_details();
        assert!(details.starts_with("Content-Type: plex/media-player\r\n"));
        assert!(details.contains("Resource-Identifier: client-1\r\n"));
        assert!(details.contains("Port: 3005\r\n"));
        assert!(details.contains("Protocol-Capabilities: timeline,playback,navigation,playqueues\r\n"));
    }

    #[test]
    fn test_parse_server_reply() {
        let from: SocketAddr = "192.168.1.20:32414".parse().unwrap();
        let reply = "HTTP/1.0 200 OK\r\n\
                     Content-Type: plex/media-server\r\n\
                     Resource-Identifier: srv-1\r\n\
                     Name: Living Room\r\n\
                     Port: 32401\r\n\
                     Updated-At: 1700000000\r\n\
                     Version: 1.40.0\r\n\r\n";
        let server = parse_server_reply(reply, from).unwrap();
        assert_eq!(server.identifier, "srv-1");
        assert_eq!(server.name, "Living Room");
        assert_eq!(server.base_url(), "http://192.168.1.20:32401");
        assert_eq!(server.updated_at.as_deref(), Some("1700000000"));

        assert!(parse_server_reply("M-SEARCH * HTTP/1.0\r\n\r\n", from).is_none());
        assert!(parse_server_reply("HTTP/1.0 200 OK\r\nName: x\r\n", from).is_none());
    }

    #[test]
    fn test_roster_contains() {
        let xml = r#"<MediaContainer size="2">
            <Server name="TV" host="10.0.0.4" machineIdentifier="other" />
            <Server name="Kodi" host="10.0.0.3" machineIdentifier="client-1" />
        </MediaContainer>"#;
        assert!(roster_contains(xml.as_bytes(), "client-1").unwrap());
        assert!(!roster_contains(xml.as_bytes(), "client-2").unwrap());
    }

    #[test]
    fn test_discover_against_loopback_server() {
        let fake = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fake_port = fake.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let mut buf = [0u8; 1024];
            let (n, from) = fake.recv_from(&mut buf).unwrap();
            let search = String::from_utf8_lossy(&buf[..n]).to_string();
            let reply = "HTTP/1.0 200 OK\r\n\
                         Content-Type: plex/media-server\r\n\
                         Resource-Identifier: srv-1\r\n\
                         Name: Den\r\n\
                         Port: 32400\r\n\r\n";
            fake.send_to(reply.as_bytes(), from).unwrap();
            search
        });

        let client = GdmClient::new(
            identity(),
            GdmSettings {
                discover_port: fake_port,
                ..loopback_settings()
            },
        )
        .unwrap();
        let found = client.discover().unwrap();

        assert!(server.join().unwrap().starts_with("M-SEARCH * HTTP/1.0"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "127.0.0.1");
        assert_eq!(client.list_servers(), found);
    }

    fn server(identifier: &str, updated_at: &str) -> ServerAddress {
        ServerAddress {
            identifier: identifier.into(),
            name: format!("Server {}", identifier),
            host: "10.0.0.2".into(),
            port: 32400,
            content_type: None,
            version: None,
            updated_at: Some(updated_at.into()),
        }
    }

    #[test]
    fn test_server_list_merges_and_expires() {
        let client = GdmClient::new(
            identity(),
            GdmSettings {
                server_ttl: Duration::from_secs(60),
                ..loopback_settings()
            },
        )
        .unwrap();
        let t0 = Instant::now();

        client.merge_servers(&[server("srv-1", "1"), server("srv-2", "1")], t0);
        client.merge_servers(&[server("srv-1", "2")], t0 + Duration::from_secs(30));
        let listed = client.list_servers();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identifier, "srv-1");
        assert_eq!(listed[0].updated_at.as_deref(), Some("2"));
        assert_eq!(listed[1].identifier, "srv-2");

        client.merge_servers(&[], t0 + Duration::from_secs(70));
        let listed = client.list_servers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, "srv-1");

        client.merge_servers(&[], t0 + Duration::from_secs(100));
        assert!(client.list_servers().is_empty());
    }

    #[test]
    fn test_silent_round_keeps_known_server() {
        let fake = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fake_port = fake.local_addr().unwrap().port();
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 1024];
            let (_, from) = fake.recv_from(&mut buf).unwrap();
            let reply = "HTTP/1.0 200 OK\r\n\
                         Content-Type: plex/media-server\r\n\
                         Resource-Identifier: srv-1\r\n\
                         Name: Den\r\n\
                         Port: 32400\r\n\r\n";
            fake.send_to(reply.as_bytes(), from).unwrap();
            fake
        });

        let client = GdmClient::new(
            identity(),
            GdmSettings {
                discover_port: fake_port,
                discover_timeout: Duration::from_millis(200),
                ..loopback_settings()
            },
        )
        .unwrap();
        assert_eq!(client.discover().unwrap().len(), 1);
        let _fake = responder.join().unwrap();

        assert!(client.discover().unwrap().is_empty());
        let listed = client.list_servers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, "srv-1");
    }

    #[test]
    fn test_suspended_responder_skips_discovery() {
        let fake = UdpSocket::bind("127.0.0.1:0").unwrap();
        fake.set_read_timeout(Some(Duration::from_millis(600))).unwrap();
        let ctx = Arc::new(ServiceContext::new());
        ctx.suspend();

        let client = Arc::new(
            GdmClient::new(
                identity(),
                GdmSettings {
                    discover_port: fake.local_addr().unwrap().port(),
                    discover_interval: Duration::ZERO,
                    discover_timeout: Duration::from_millis(20),
                    ..loopback_settings()
                },
            )
            .unwrap(),
        );
        client.start_all(ctx.clone()).unwrap();

        let mut buf = [0u8; 1024];
        assert!(fake.recv_from(&mut buf).is_err());

        ctx.resume();
        fake.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (n, _) = fake.recv_from(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("M-SEARCH * HTTP/1.0"));

        client.stop_all();
    }

    #[test]
    fn test_no_servers_means_not_registered() {
        let client = GdmClient::new(identity(), loopback_settings()).unwrap();
        assert!(client.list_servers().is_empty());
        assert!(!client.check_client_registration());
    }

    #[test]
    fn test_register_sends_hello() {
        let fake = UdpSocket::bind("127.0.0.1:0").unwrap();
        fake.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let client = GdmClient::new(
            identity(),
            GdmSettings {
                register_port: fake.local_addr().unwrap().port(),
                discover_timeout: Duration::from_millis(50),
                ..loopback_settings()
            },
        )
        .unwrap();
        client.register_as_client().unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = fake.recv_from(&mut buf).unwrap();
        let hello = String::from_utf8_lossy(&buf[..n]);
        assert!(hello.starts_with("HELLO * HTTP/1.0\r\n"));
        assert!(hello.contains("Resource-Identifier: client-1"));
    }

    #[test]
    fn test_check_client_registration_reads_roster() {
        let body = r#"<MediaContainer size="1"><Server machineIdentifier="client-1"/></MediaContainer>"#;
        let (port, server) = stub_http(1, move |_, _| (StatusCode::OK, body.to_string()));

        let client = GdmClient::new(identity(), loopback_settings()).unwrap();
        client.set_servers(vec![ServerAddress {
            identifier: "srv-1".into(),
            name: "Den".into(),
            host: "127.0.0.1".into(),
            port,
            content_type: None,
            version: None,
            updated_at: None,
        }]);

        assert!(client.check_client_registration());
        let requests = server.join().unwrap();
        assert_eq!(requests[0].path, "/clients");
        assert_eq!(requests[0].header("X-Plex-Client-Identifier"), Some("client-1"));
    }

    #[test]
    fn test_responder_answers_search() {
        let client = Arc::new(GdmClient::new(identity(), loopback_settings()).unwrap());
        client.start_all(Arc::new(ServiceContext::new())).unwrap();
        let port = client.responder_port().unwrap();

        let searcher = UdpSocket::bind("127.0.0.1:0").unwrap();
        searcher.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        searcher
            .send_to(b"M-SEARCH * HTTP/1.0\r\n\r\n", ("127.0.0.1", port))
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = searcher.recv_from(&mut buf).unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(reply.contains("Resource-Identifier: client-1"));

        client.stop_all();
        assert!(client.responder_port().is_none());
    }
}
