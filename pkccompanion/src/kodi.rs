//! Kodi JSON-RPC client used as the local player and notifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace, warn};
use ureq::Agent;

use crate::collaborators::{NavigationCommand, Notifier, PlaybackOptions, Player, TransportCommand};
use crate::errors::{CompanionError, Result};
use crate::model::{MediaDescriptor, MediaKind, PlaybackState, PlayerStatus, RepeatMode};
use crate::playqueue::PlayQueue;

/// Addon entry point used when an item has no direct-play path.
const PLUGIN_URL: &str = "plugin://plugin.video.plexkodiconnect/";

#[derive(Clone, Debug, PartialEq)]
pub struct KodiSettings {
    /// JSON-RPC endpoint, e.g. `http://127.0.0.1:8080/jsonrpc`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for KodiSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/jsonrpc".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ActivePlayer {
    playerid: i64,
    #[serde(rename = "type")]
    player_type: String,
}

/// Kodi's `Global.Time` object.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KodiTime {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub milliseconds: u64,
}

impl KodiTime {
    pub fn from_ms(ms: u64) -> Self {
        Self {
            hours: ms / 3_600_000,
            minutes: (ms / 60_000) % 60,
            seconds: (ms / 1000) % 60,
            milliseconds: ms % 1000,
        }
    }

    pub fn as_ms(&self) -> u64 {
        ((self.hours * 60 + self.minutes) * 60 + self.seconds) * 1000 + self.milliseconds
    }
}

/// Kodi playlist holding items of `kind`.
pub fn playlist_id(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Audio => 0,
        MediaKind::Video => 1,
        MediaKind::Photo => 2,
    }
}

fn player_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
        MediaKind::Photo => "picture",
    }
}

fn repeat_name(repeat: RepeatMode) -> &'static str {
    match repeat {
        RepeatMode::Off => "off",
        RepeatMode::One => "one",
        RepeatMode::All => "all",
    }
}

fn playlist_item(item: &MediaDescriptor) -> Value {
    match &item.file {
        Some(file) => json!({ "file": file }),
        None => json!({
            "file": format!(
                "{}?mode=play&plex_id={}&plex_type={}",
                PLUGIN_URL, item.plex_id, item.plex_type
            )
        }),
    }
}

/// Builds a status from a `Player.GetProperties` result.
fn parse_status(properties: &Value, volume: Option<u8>) -> Option<PlayerStatus> {
    let time: KodiTime = serde_json::from_value(properties.get("time")?.clone()).ok()?;
    let total: Option<KodiTime> = properties
        .get("totaltime")
        .and_then(|t| serde_json::from_value(t.clone()).ok());
    let speed = properties.get("speed").and_then(Value::as_i64).unwrap_or(0);
    let repeat = match properties.get("repeat").and_then(Value::as_str) {
        Some("one") => RepeatMode::One,
        Some("all") => RepeatMode::All,
        _ => RepeatMode::Off,
    };
    Some(PlayerStatus {
        state: if speed == 0 {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        },
        time_ms: time.as_ms(),
        duration_ms: total.map(|t| t.as_ms()).filter(|ms| *ms > 0),
        volume,
        shuffled: properties
            .get("shuffled")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        repeat,
    })
}

pub struct KodiClient {
    agent: Agent,
    url: String,
    authorization: Option<String>,
    next_id: AtomicU64,
}

impl KodiClient {
    pub fn new(settings: &KodiSettings) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        let authorization = settings.username.as_ref().map(|user| {
            let password = settings.password.as_deref().unwrap_or_default();
            format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
        });
        Self {
            agent,
            url: settings.url.clone(),
            authorization,
            next_id: AtomicU64::new(1),
        }
    }

    /// Sends one JSON-RPC call and returns its `result`.
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let payload = serde_json::to_string(&request).map_err(CompanionError::player)?;
        trace!(method, "Kodi call");

        let mut builder = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth);
        }
        let response = builder.send(payload.as_str())?;
        if !response.status().is_success() {
            return Err(CompanionError::HttpStatus(
                self.url.clone(),
                response.status().as_u16(),
            ));
        }

        let (_parts, body) = response.into_parts();
        let reply: RpcResponse =
            serde_json::from_reader(body.into_reader()).map_err(CompanionError::player)?;
        if let Some(err) = reply.error {
            return Err(CompanionError::Player(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    fn active_players(&self) -> Result<Vec<ActivePlayer>> {
        let result = self.call("Player.GetActivePlayers", json!({}))?;
        serde_json::from_value(result).map_err(CompanionError::player)
    }

    fn player_id(&self, kind: Option<MediaKind>) -> Result<i64> {
        let players = self.active_players()?;
        let found = match kind {
            Some(kind) => players
                .iter()
                .find(|p| p.player_type == player_type(kind)),
            None => players.first(),
        };
        match (found, kind) {
            (Some(player), _) => Ok(player.playerid),
            (None, Some(kind)) => Err(CompanionError::NothingPlaying(kind)),
            (None, None) => Err(CompanionError::Player("no active player".into())),
        }
    }

    fn player_properties(&self, kind: MediaKind, properties: &[&str]) -> Option<Value> {
        let player_id = self.player_id(Some(kind)).ok()?;
        self.call(
            "Player.GetProperties",
            json!({ "playerid": player_id, "properties": properties }),
        )
        .map_err(|err| debug!(kind = %kind, error = %err, "Player properties unavailable"))
        .ok()
    }

    fn volume(&self) -> Option<u8> {
        self.call("Application.GetProperties", json!({ "properties": ["volume"] }))
            .ok()?
            .get("volume")
            .and_then(Value::as_u64)
            .map(|v| v.min(100) as u8)
    }
}

impl Player for KodiClient {
    fn play(&self, queue: &PlayQueue, start_offset_secs: Option<f64>) -> Result<()> {
        let playlist = playlist_id(queue.kind);
        self.call("Playlist.Clear", json!({ "playlistid": playlist }))?;
        let items: Vec<Value> = queue.items.iter().map(|i| playlist_item(&i.descriptor)).collect();
        if items.is_empty() {
            return Ok(());
        }
        self.call("Playlist.Add", json!({ "playlistid": playlist, "item": items }))?;

        let mut options = json!({
            "repeat": repeat_name(queue.repeat),
            "shuffled": queue.shuffled,
        });
        if let Some(secs) = start_offset_secs {
            options["resume"] = json!(KodiTime::from_ms((secs * 1000.0) as u64));
        }
        debug!(
            kind = %queue.kind,
            items = queue.len(),
            position = queue.position.unwrap_or(0),
            "Starting Kodi playlist"
        );
        self.call(
            "Player.Open",
            json!({
                "item": { "playlistid": playlist, "position": queue.position.unwrap_or(0) },
                "options": options,
            }),
        )?;
        Ok(())
    }

    fn play_item(&self, item: &MediaDescriptor, options: &PlaybackOptions) -> Result<()> {
        let mut open_options = json!({});
        if options.resume && options.offset_ms > 0 {
            open_options["resume"] = json!(KodiTime::from_ms(options.offset_ms));
        }
        self.call(
            "Player.Open",
            json!({ "item": playlist_item(item), "options": open_options }),
        )?;
        Ok(())
    }

    fn navigate_node(&self, key: &str, offset_ms: u64) -> Result<()> {
        let target = format!(
            "{}?mode=browseplex&key={}&offset={}",
            PLUGIN_URL,
            urlencoding::encode(key),
            offset_ms
        );
        self.call(
            "GUI.ActivateWindow",
            json!({ "window": "videos", "parameters": [target, "return"] }),
        )?;
        Ok(())
    }

    fn set_audio_stream(&self, index: usize) -> Result<()> {
        let player_id = self.player_id(Some(MediaKind::Video))?;
        self.call(
            "Player.SetAudioStream",
            json!({ "playerid": player_id, "stream": index }),
        )?;
        Ok(())
    }

    fn set_subtitle_stream(&self, index: Option<usize>) -> Result<()> {
        let player_id = self.player_id(Some(MediaKind::Video))?;
        let params = match index {
            Some(i) => json!({ "playerid": player_id, "subtitle": i, "enable": true }),
            None => json!({ "playerid": player_id, "subtitle": "off" }),
        };
        self.call("Player.SetSubtitle", params)?;
        Ok(())
    }

    fn position(&self, kind: MediaKind) -> Option<usize> {
        self.player_properties(kind, &["position"])?
            .get("position")
            .and_then(Value::as_i64)
            .and_then(|p| usize::try_from(p).ok())
    }

    fn status(&self, kind: MediaKind) -> Option<PlayerStatus> {
        let properties =
            self.player_properties(kind, &["time", "totaltime", "speed", "shuffled", "repeat"])?;
        parse_status(&properties, self.volume())
    }

    fn transport(&self, kind: Option<MediaKind>, command: TransportCommand) -> Result<()> {
        let player_id = self.player_id(kind)?;
        let (method, params) = match command {
            TransportCommand::Play => ("Player.PlayPause", json!({ "playerid": player_id, "play": true })),
            TransportCommand::Pause => ("Player.PlayPause", json!({ "playerid": player_id, "play": false })),
            TransportCommand::Stop => ("Player.Stop", json!({ "playerid": player_id })),
            TransportCommand::SkipNext => ("Player.GoTo", json!({ "playerid": player_id, "to": "next" })),
            TransportCommand::SkipPrevious => {
                ("Player.GoTo", json!({ "playerid": player_id, "to": "previous" }))
            }
            TransportCommand::StepForward => (
                "Player.Seek",
                json!({ "playerid": player_id, "value": { "step": "smallforward" } }),
            ),
            TransportCommand::StepBack => (
                "Player.Seek",
                json!({ "playerid": player_id, "value": { "step": "smallbackward" } }),
            ),
        };
        self.call(method, params)?;
        Ok(())
    }

    fn seek(&self, kind: Option<MediaKind>, offset_ms: u64) -> Result<()> {
        let player_id = self.player_id(kind)?;
        self.call(
            "Player.Seek",
            json!({ "playerid": player_id, "value": { "time": KodiTime::from_ms(offset_ms) } }),
        )?;
        Ok(())
    }

    fn set_volume(&self, volume: u8) -> Result<()> {
        self.call("Application.SetVolume", json!({ "volume": volume }))?;
        Ok(())
    }

    fn navigate(&self, command: NavigationCommand) -> Result<()> {
        let method = match command {
            NavigationCommand::Up => "Input.Up",
            NavigationCommand::Down => "Input.Down",
            NavigationCommand::Left => "Input.Left",
            NavigationCommand::Right => "Input.Right",
            NavigationCommand::Select => "Input.Select",
            NavigationCommand::Home => "Input.Home",
            NavigationCommand::Back => "Input.Back",
        };
        self.call(method, json!({}))?;
        Ok(())
    }
}

impl Notifier for KodiClient {
    fn notify_error(&self, title: &str, message: &str) {
        let params = json!({ "title": title, "message": message, "image": "error" });
        if let Err(err) = self.call("GUI.ShowNotification", params) {
            warn!(title, message, error = %err, "Could not show notification in Kodi");
        }
    }
}
