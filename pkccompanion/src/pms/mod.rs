//! HTTP client for the Plex Media Server endpoints the companion needs.

mod parser;

pub use parser::{parse_descriptor, parse_metadata_list, parse_play_queue};

use std::io::BufReader;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use ureq::{Agent, BodyReader};

use crate::collaborators::MediaServerApi;
use crate::discovery::{ClientIdentity, ServerAddress};
use crate::errors::{CompanionError, Result};
use crate::model::{MediaDescriptor, RemoteQueue};

pub struct PlexServerClient {
    agent: Agent,
    identity: ClientIdentity,
    token: Option<String>,
    base_url: Mutex<Option<String>>,
}

impl PlexServerClient {
    pub fn new(identity: ClientIdentity, token: Option<String>, timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            identity,
            token,
            base_url: Mutex::new(None),
        }
    }

    /// Fixed server address, e.g. `http://10.0.0.2:32400`.
    pub fn with_base_url(self, url: impl Into<String>) -> Self {
        *self.base_url.lock() = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn base_url(&self) -> Option<String> {
        self.base_url.lock().clone()
    }

    /// Follows discovery when no address was configured.
    pub fn use_discovered(&self, server: &ServerAddress) {
        let mut base = self.base_url.lock();
        if base.is_none() {
            debug!(server = server.name.as_str(), "Using discovered media server");
            *base = Some(server.base_url());
        }
    }

    fn get<T, F>(&self, path: &str, parse: F) -> Result<T>
    where
        F: FnOnce(BufReader<BodyReader<'static>>) -> Result<T>,
    {
        let base = self.base_url().ok_or(CompanionError::NoServer)?;
        let url = format!("{}{}", base, path);

        let mut request = self
            .agent
            .get(&url)
            .header("Accept", "application/xml")
            .header("X-Plex-Client-Identifier", &self.identity.identifier)
            .header("X-Plex-Product", &self.identity.product)
            .header("X-Plex-Version", &self.identity.version)
            .header("X-Plex-Device-Name", &self.identity.name)
            .header("X-Plex-Platform", &self.identity.platform)
            .header("X-Plex-Platform-Version", &self.identity.platform_version);
        if let Some(token) = &self.token {
            request = request.header("X-Plex-Token", token);
        }

        let response = request.call()?;
        if !response.status().is_success() {
            return Err(CompanionError::HttpStatus(url, response.status().as_u16()));
        }
        let (_parts, body) = response.into_parts();
        parse(BufReader::new(body.into_reader()))
    }

    fn logged<T>(what: &str, id: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(request = what, id, error = %err, "Media server request failed");
                None
            }
        }
    }
}

fn metadata_path(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/library/metadata/{}", key)
    }
}

impl MediaServerApi for PlexServerClient {
    fn fetch_metadata(&self, key: &str) -> Option<MediaDescriptor> {
        let result = self.get(&metadata_path(key), |body| parse_metadata_list(body));
        Self::logged("metadata", key, result)?.into_iter().next()
    }

    fn fetch_children(&self, plex_id: &str) -> Option<Vec<MediaDescriptor>> {
        let path = format!("/library/metadata/{}/children", plex_id);
        let result = self.get(&path, |body| parse_metadata_list(body));
        Self::logged("children", plex_id, result)
    }

    fn fetch_remote_queue(&self, play_queue_id: &str) -> Option<RemoteQueue> {
        let path = format!("/playQueues/{}?own=1", play_queue_id);
        let result = self.get(&path, |body| parse_play_queue(body));
        Self::logged("playQueue", play_queue_id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordedRequest, stub_http};
    use axum::http::StatusCode;
    use std::thread;

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

    /// Serves one canned response and hands back the request it got.
    fn serve_once(
        status: StatusCode,
        body: &'static str,
    ) -> (u16, thread::JoinHandle<RecordedRequest>) {
        let (port, stub) = stub_http(1, move |_, _| (status, body.to_string()));
        let handle = thread::spawn(move || stub.join().unwrap().remove(0));
        (port, handle)
    }

    #[test]
    fn test_metadata_path() {
        assert_eq!(metadata_path("12"), "/library/metadata/12");
        assert_eq!(metadata_path("/library/metadata/12"), "/library/metadata/12");
    }

    #[test]
    fn test_no_server_yields_none() {
        let client = PlexServerClient::new(identity(), None, Duration::from_secs(1));
        assert!(client.fetch_metadata("12").is_none());
    }

    #[test]
    fn test_fetch_remote_queue_sends_identity_and_token() {
        let (port, server) = serve_once(
            StatusCode::OK,
            r#"<MediaContainer playQueueID="42" playQueueVersion="2"><Video ratingKey="9" type="episode"/></MediaContainer>"#,
        );
        let client = PlexServerClient::new(identity(), Some("secret".into()), Duration::from_secs(2))
            .with_base_url(format!("http://127.0.0.1:{}/", port));

        let queue = client.fetch_remote_queue("42").unwrap();
        assert_eq!(queue.id, "42");
        assert_eq!(queue.items.len(), 1);

        let request = server.join().unwrap();
        assert_eq!(request.path, "/playQueues/42");
        assert_eq!(request.header("X-Plex-Token"), Some("secret"));
        assert_eq!(request.header("X-Plex-Client-Identifier"), Some("client-1"));
    }

    #[test]
    fn test_http_error_yields_none() {
        let (port, server) = serve_once(StatusCode::NOT_FOUND, "");
        let client = PlexServerClient::new(identity(), None, Duration::from_secs(2))
            .with_base_url(format!("http://127.0.0.1:{}", port));
        assert!(client.fetch_children("12").is_none());
        assert_eq!(server.join().unwrap().path, "/library/metadata/12/children");
    }

    #[test]
    fn test_discovered_server_does_not_override_configured() {
        let client = PlexServerClient::new(identity(), None, Duration::from_secs(1))
            .with_base_url("http://10.0.0.2:32400");
        client.use_discovered(&ServerAddress {
            identifier: "srv".into(),
            name: "Other".into(),
            host: "10.0.0.3".into(),
            port: 32400,
            content_type: None,
            version: None,
            updated_at: None,
        });
        assert_eq!(client.base_url().as_deref(), Some("http://10.0.0.2:32400"));
    }
}
