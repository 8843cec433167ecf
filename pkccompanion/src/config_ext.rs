//! Companion settings read from `pkcconfig`.
//!
//! [`CompanionConfigExt`] extends `pkcconfig::Config` with the `companion`,
//! `gdm`, `kodi` and `server` sections and gathers them into one
//! [`CompanionSettings`] value handed to the service.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use pkcconfig::Config;
use tracing::warn;

use crate::discovery::{ClientIdentity, GDM_MULTICAST_ADDR, GdmSettings};
use crate::kodi::KodiSettings;
use crate::listener::ListenerSettings;
use crate::subscribers::SubscriberSettings;

const DEFAULT_PRODUCT: &str = "PlexKodiConnect";
const DEFAULT_DEVICE_CLASS: &str = "pc";

/// Everything the companion service needs, resolved once at start-up.
#[derive(Clone, Debug, PartialEq)]
pub struct CompanionSettings {
    pub enabled: bool,
    pub identity: ClientIdentity,
    pub listener: ListenerSettings,
    pub gdm: GdmSettings,
    pub subscribers: SubscriberSettings,
    pub kodi: KodiSettings,
    /// Configured media server; discovery is used when absent.
    pub server_url: Option<String>,
    pub server_token: Option<String>,
    pub server_timeout: Duration,
    /// Timeout of timeline pushes.
    pub http_timeout: Duration,
    pub task_queue_capacity: usize,
    /// Longest wait for a task in one loop iteration.
    pub idle_wait: Duration,
    pub registration_interval: Duration,
    pub notify_interval: Duration,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        let (platform, platform_version) = pkcutils::get_platform();
        let listener = ListenerSettings::default();
        Self {
            enabled: true,
            identity: ClientIdentity {
                identifier: uuid::Uuid::new_v4().to_string(),
                name: "Kodi".to_string(),
                product: DEFAULT_PRODUCT.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                port: listener.port,
                device_class: DEFAULT_DEVICE_CLASS.to_string(),
                platform,
                platform_version,
            },
            listener,
            gdm: GdmSettings::default(),
            subscribers: SubscriberSettings::default(),
            kodi: KodiSettings::default(),
            server_url: None,
            server_token: None,
            server_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(5),
            task_queue_capacity: 64,
            idle_wait: Duration::from_millis(50),
            registration_interval: Duration::from_secs(150),
            notify_interval: Duration::from_millis(1500),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub trait CompanionConfigExt {
    /// Port of the companion HTTP listener (default 3005).
    fn get_companion_port(&self) -> u16;

    fn get_task_queue_capacity(&self) -> usize;

    fn get_listener_settings(&self) -> ListenerSettings;

    fn get_gdm_settings(&self) -> GdmSettings;

    fn get_subscriber_settings(&self) -> SubscriberSettings;

    /// Kodi endpoint; a sealed password is decrypted.
    fn get_kodi_settings(&self) -> Result<KodiSettings>;

    /// Identity advertised over GDM and in HTTP headers. Generates and
    /// persists the identifier on first use.
    fn get_client_identity(&self) -> Result<ClientIdentity>;

    fn get_companion_settings(&self) -> Result<CompanionSettings>;
}

impl CompanionConfigExt for Config {
    fn get_companion_port(&self) -> u16 {
        let port = self.get_u64_or(&["companion", "http_port"], 3005);
        u16::try_from(port).unwrap_or_else(|_| {
            warn!(port, "Companion port out of range, using 3005");
            3005
        })
    }

    fn get_task_queue_capacity(&self) -> usize {
        self.get_u64_or(&["companion", "task_queue_capacity"], 64).max(1) as usize
    }

    fn get_listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            port: self.get_companion_port(),
            bind_attempts: self.get_u64_or(&["companion", "bind_attempts"], 10) as u32,
            bind_cooldown: Duration::from_millis(
                self.get_u64_or(&["companion", "bind_cooldown_ms"], 3000),
            ),
            shutdown_poll: Duration::from_millis(
                self.get_u64_or(&["companion", "shutdown_poll_ms"], 500),
            ),
        }
    }

    fn get_gdm_settings(&self) -> GdmSettings {
        let defaults = GdmSettings::default();
        let port = |key: &str, default: u16| {
            u16::try_from(self.get_u64_or(&["gdm", key], default as u64)).unwrap_or(default)
        };
        let multicast_address = self
            .get_string_or(&["gdm", "multicast_address"], "")
            .parse::<Ipv4Addr>()
            .unwrap_or(GDM_MULTICAST_ADDR);
        GdmSettings {
            multicast_address,
            register_port: port("register_port", defaults.register_port),
            discover_port: port("discover_port", defaults.discover_port),
            update_port: port("update_port", defaults.update_port),
            discover_timeout: Duration::from_millis(
                self.get_u64_or(&["gdm", "discover_timeout_ms"], 2000),
            ),
            discover_interval: Duration::from_secs(
                self.get_u64_or(&["gdm", "discover_interval_secs"], 120),
            ),
            server_ttl: Duration::from_secs(self.get_u64_or(&["gdm", "server_ttl_secs"], 600)),
            http_timeout: Duration::from_secs(
                self.get_u64_or(&["companion", "http_timeout_secs"], 5),
            ),
        }
    }

    fn get_subscriber_settings(&self) -> SubscriberSettings {
        SubscriberSettings {
            max_failures: self
                .get_u64_or(&["companion", "subscribers", "max_failures"], 3)
                .max(1) as u32,
            timeout: Duration::from_secs(
                self.get_u64_or(&["companion", "subscribers", "timeout_secs"], 90),
            ),
        }
    }

    fn get_kodi_settings(&self) -> Result<KodiSettings> {
        let defaults = KodiSettings::default();
        let password = match non_empty(self.get_string_or(&["kodi", "password"], "")) {
            Some(raw) => Some(pkcconfig::secrets::get_secret(&raw)?),
            None => None,
        };
        Ok(KodiSettings {
            url: self.get_string_or(&["kodi", "url"], &defaults.url),
            username: non_empty(self.get_string_or(&["kodi", "username"], "")),
            password,
            timeout: Duration::from_secs(self.get_u64_or(&["kodi", "timeout_secs"], 5)),
        })
    }

    fn get_client_identity(&self) -> Result<ClientIdentity> {
        let (platform, platform_version) = pkcutils::get_platform();
        Ok(ClientIdentity {
            identifier: self.get_client_identifier()?,
            name: self.get_client_name(),
            product: self.get_string_or(&["client", "product"], DEFAULT_PRODUCT),
            version: self.get_string_or(&["client", "version"], env!("CARGO_PKG_VERSION")),
            port: self.get_companion_port(),
            device_class: self.get_string_or(&["client", "device_class"], DEFAULT_DEVICE_CLASS),
            platform,
            platform_version,
        })
    }

    fn get_companion_settings(&self) -> Result<CompanionSettings> {
        Ok(CompanionSettings {
            enabled: self.get_bool_or(&["companion", "enabled"], true),
            identity: self.get_client_identity()?,
            listener: self.get_listener_settings(),
            gdm: self.get_gdm_settings(),
            subscribers: self.get_subscriber_settings(),
            kodi: self.get_kodi_settings()?,
            server_url: non_empty(self.get_server_url()),
            server_token: self.get_server_token()?,
            server_timeout: Duration::from_secs(self.get_server_timeout_secs()?),
            http_timeout: Duration::from_secs(
                self.get_u64_or(&["companion", "http_timeout_secs"], 5),
            ),
            task_queue_capacity: self.get_task_queue_capacity(),
            idle_wait: Duration::from_millis(self.get_u64_or(&["companion", "idle_wait_ms"], 50)),
            registration_interval: Duration::from_secs(
                self.get_u64_or(&["companion", "registration_interval_secs"], 150),
            ),
            notify_interval: Duration::from_millis(
                self.get_u64_or(&["companion", "notify_interval_ms"], 1500),
            ),
        })
    }
}
