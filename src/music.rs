//! Spotify Web API client: playback tools plus ambient-media ducking.
//! Ducking runs on its own worker thread so mode transitions never wait on
//! the network.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as cb;
use parking_lot::Mutex;
use reqwest::blocking::RequestBuilder;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::mode::AmbientMedia;
use crate::tools::{MusicAction, MusicService, ToolError};

const API_BASE: &str = "https://api.spotify.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Volume ambient music is lowered to while the assistant talks.
pub const DUCK_LEVEL: u8 = 20;
const DEFAULT_ORIGINAL_VOLUME: u8 = 75;

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Playback target: a name containing one of `preferred` (the assistant's own
/// speaker), else the active device, else the first one listed.
pub fn pick_device<'a>(devices: &'a [Device], preferred: &[String]) -> Option<&'a Device> {
    let usable: Vec<&Device> = devices.iter().filter(|d| d.id.is_some()).collect();
    if let Some(own) = usable.iter().find(|d| {
        let name = d.name.to_lowercase();
        preferred.iter().any(|p| name.contains(&p.to_lowercase()))
    }) {
        return Some(*own);
    }
    if !usable.is_empty() {
        let names: Vec<&str> = usable.iter().map(|d| d.name.as_str()).collect();
        warn!(available = ?names, "preferred playback device not found");
    }
    usable
        .iter()
        .find(|d| d.is_active)
        .or_else(|| usable.first())
        .copied()
}

/// What a search resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub kind: &'static str,
    pub uri: String,
    pub name: String,
}

impl SearchHit {
    /// Tracks play as a single uri, albums and playlists as a context.
    pub fn play_body(&self) -> Value {
        if self.kind == "track" {
            json!({ "uris": [self.uri] })
        } else {
            json!({ "context_uri": self.uri })
        }
    }
}

/// First hit in track, album, playlist order.
pub fn pick_search_result(results: &Value) -> Option<SearchHit> {
    for (kind, key) in [("track", "tracks"), ("album", "albums"), ("playlist", "playlists")] {
        let first = results
            .pointer(&format!("/{key}/items"))
            .and_then(Value::as_array)
            .and_then(|items| items.iter().find(|item| !item.is_null()));
        if let Some(item) = first {
            let uri = item.get("uri").and_then(Value::as_str);
            let name = item.get("name").and_then(Value::as_str).unwrap_or_default();
            if let Some(uri) = uri {
                return Some(SearchHit {
                    kind,
                    uri: uri.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }
    None
}

/// Volume to remember before ducking, when the player is audible above the duck level.
pub fn duck_from(playback: &Value) -> Option<u8> {
    if !playback.get("is_playing").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let volume = playback
        .pointer("/device/volume_percent")
        .and_then(Value::as_u64)?;
    (volume > u64::from(DUCK_LEVEL)).then_some(volume.min(100) as u8)
}

pub struct SpotifyClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::blocking::Client,
    token: String,
    base_url: String,
    preferred_devices: Vec<String>,
}

impl SpotifyClient {
    pub fn new(access_token: impl Into<String>, preferred_devices: Vec<String>) -> Result<Self, ToolError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                token: access_token.into(),
                base_url: API_BASE.to_string(),
                preferred_devices,
            }),
        })
    }

    /// Start the ducking worker that drives this account's player volume.
    pub fn ducker(&self) -> Result<AmbientDucker, ToolError> {
        AmbientDucker::spawn(Arc::clone(&self.inner) as Arc<dyn PlayerVolume>)
    }

    /// Resolve the playback device id.
    fn device_id(&self) -> Result<String, ToolError> {
        let list: DeviceList = self.inner.get("/me/player/devices")?;
        let names: Vec<&str> = list.devices.iter().map(|d| d.name.as_str()).collect();
        debug!(devices = ?names, "available playback devices");
        pick_device(&list.devices, &self.inner.preferred_devices)
            .and_then(|d| d.id.clone())
            .ok_or_else(|| ToolError::Failed("No playback devices found".into()))
    }

    fn play(&self, query: Option<&str>) -> Result<String, ToolError> {
        let device_id = self.device_id()?;
        let Some(query) = query else {
            self.inner
                .send(self.inner.put("/me/player/play").query(&[("device_id", &device_id)]))?;
            return Ok("Resuming playback".into());
        };

        let results: Value = self.inner.get_with(
            "/search",
            &[("q", query), ("type", "track,album,playlist"), ("limit", "1")],
        )?;
        let hit = pick_search_result(&results).ok_or_else(|| ToolError::Failed("No music found".into()))?;
        self.inner.send(
            self.inner
                .put("/me/player/play")
                .query(&[("device_id", &device_id)])
                .json(&hit.play_body()),
        )?;
        info!(kind = hit.kind, name = %hit.name, "music playback started");
        Ok(format!("Playing {} {}", hit.kind, hit.name))
    }

    fn skip(&self, path: &str, message: &str) -> Result<String, ToolError> {
        let device_id = self.device_id()?;
        self.inner
            .send(self.inner.post(path).query(&[("device_id", &device_id)]))?;
        Ok(message.to_string())
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.http.put(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ToolError> {
        self.get_with(path, &[])
    }

    fn get_with<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ToolError> {
        let response = self.send(self.http.get(self.url(path)).bearer_auth(&self.token).query(query))?;
        response.json().map_err(|e| ToolError::Failed(e.to_string()))
    }

    /// Send and map non-success statuses to errors.
    fn send(&self, request: RequestBuilder) -> Result<reqwest::blocking::Response, ToolError> {
        let response = request.send().map_err(|e| ToolError::Failed(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(ToolError::Failed(format!("HTTP {}: {}", status.as_u16(), body.trim())))
    }
}

impl PlayerVolume for Inner {
    /// `None` when nothing is playing anywhere (204).
    fn playback(&self) -> Result<Option<Value>, ToolError> {
        let response = self.send(self.http.get(self.url("/me/player")).bearer_auth(&self.token))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        response
            .json()
            .map(Some)
            .map_err(|e| ToolError::Failed(e.to_string()))
    }

    fn set_volume(&self, percent: u8) -> Result<(), ToolError> {
        self.send(
            self.put("/me/player/volume")
                .query(&[("volume_percent", percent.to_string())]),
        )?;
        Ok(())
    }
}

impl MusicService for SpotifyClient {
    fn execute_music_command(&self, action: MusicAction) -> Result<String, ToolError> {
        info!(action = ?action, "music command");
        let outcome = match &action {
            MusicAction::Play { query } => self.play(query.as_deref()),
            MusicAction::Next => self.skip("/me/player/next", "Skipped to next track"),
            MusicAction::Previous => self.skip("/me/player/previous", "Skipped to previous track"),
        };
        if let Err(e) = &outcome {
            error!(action = ?action, error = %e, "music command failed");
        }
        outcome
    }
}

/// Player volume as the ducking worker sees it.
pub trait PlayerVolume: Send + Sync {
    /// Current playback state, `None` when idle.
    fn playback(&self) -> Result<Option<Value>, ToolError>;
    fn set_volume(&self, percent: u8) -> Result<(), ToolError>;
}

enum DuckCommand {
    Duck,
    Restore,
    Stop,
}

struct DuckState {
    is_ducked: bool,
    original_volume: u8,
}

/// Ambient media over a single `music-ducking` worker. Duck and restore
/// requests are queued and applied strictly in call order, so a restore
/// issued right after a duck always lands after it.
pub struct AmbientDucker {
    tx: cb::Sender<DuckCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AmbientDucker {
    pub fn spawn(player: Arc<dyn PlayerVolume>) -> Result<Self, ToolError> {
        let (tx, rx) = cb::unbounded();
        let thread = std::thread::Builder::new()
            .name("music-ducking".into())
            .spawn(move || run_ducking(player, rx))
            .map_err(|e| ToolError::Failed(format!("failed to spawn ducking thread: {e}")))?;
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, command: DuckCommand) {
        if self.tx.send(command).is_err() {
            debug!("ducking worker already stopped");
        }
    }
}

impl AmbientMedia for AmbientDucker {
    fn duck(&self) {
        self.send(DuckCommand::Duck);
    }

    fn restore(&self) {
        self.send(DuckCommand::Restore);
    }

    /// Put the music back where it was, then stop the worker.
    fn close(&self) {
        self.send(DuckCommand::Restore);
        self.send(DuckCommand::Stop);
    }

    fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }
}

fn run_ducking(player: Arc<dyn PlayerVolume>, rx: cb::Receiver<DuckCommand>) {
    let mut state = DuckState {
        is_ducked: false,
        original_volume: DEFAULT_ORIGINAL_VOLUME,
    };
    debug!("ducking worker started");
    while let Ok(command) = rx.recv() {
        match command {
            DuckCommand::Duck => duck_now(player.as_ref(), &mut state),
            DuckCommand::Restore => restore_now(player.as_ref(), &mut state),
            DuckCommand::Stop => break,
        }
    }
    debug!("ducking worker stopped");
}

fn duck_now(player: &dyn PlayerVolume, state: &mut DuckState) {
    if state.is_ducked {
        return;
    }
    let playback = match player.playback() {
        Ok(playback) => playback,
        Err(e) => {
            error!(error = %e, "music duck error");
            return;
        }
    };
    let Some(original) = playback.as_ref().and_then(duck_from) else {
        return;
    };
    match player.set_volume(DUCK_LEVEL) {
        Ok(()) => {
            state.original_volume = original;
            state.is_ducked = true;
            debug!(from = original, to = DUCK_LEVEL, "music volume ducked");
        }
        Err(ToolError::Failed(msg)) if msg.contains("VOLUME_CONTROL_DISALLOW") => {
            info!("music volume control not allowed on this device, ducking skipped");
        }
        Err(e) => error!(error = %e, "music duck error"),
    }
}

fn restore_now(player: &dyn PlayerVolume, state: &mut DuckState) {
    if !state.is_ducked {
        return;
    }
    match player.set_volume(state.original_volume) {
        Ok(()) => debug!(to = state.original_volume, "music volume restored"),
        Err(e) => error!(error = %e, "music restore error"),
    }
    state.is_ducked = false;
}
