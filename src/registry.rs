//! Client registry: per-source rolling windows and per-model detection state.
//! Shared by the capture thread, the pipeline stage threads, the mode machine
//! and button callback threads, so every access goes through one lock.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audio::rolling::RollingWindow;
use crate::audio::{EMBEDDING_DIM, MAX_AUDIO_SAMPLES, MAX_EMBEDDINGS, MAX_MEL_FRAMES, NUM_MELS};

/// Identifier of the built-in microphone client.
pub const DEFAULT_CLIENT: &str = "local_mic";

/// Detection parameters for one wake word model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub name: String,
    pub threshold: f32,
    pub trigger_level: u32,
}

impl ModelParams {
    pub fn new(name: impl Into<String>, threshold: f32, trigger_level: u32) -> Self {
        Self {
            name: name.into(),
            threshold,
            trigger_level: trigger_level.max(1),
        }
    }
}

/// Per-client, per-model detection state.
pub struct WakeWordModelState {
    pub threshold: f32,
    pub trigger_level: u32,
    pub activations: u32,
    pub is_detected: bool,
    pub embeddings: RollingWindow,
}

impl WakeWordModelState {
    fn new(params: &ModelParams) -> Self {
        Self {
            threshold: params.threshold,
            trigger_level: params.trigger_level,
            activations: 0,
            is_detected: false,
            embeddings: RollingWindow::new(MAX_EMBEDDINGS, EMBEDDING_DIM),
        }
    }

    fn reset(&mut self) {
        self.embeddings.clear();
        self.activations = 0;
        self.is_detected = false;
    }
}

/// One audio source: raw audio window, mel window, model states.
pub struct ClientData {
    pub audio: RollingWindow,
    pub mels: RollingWindow,
    pub models: HashMap<String, WakeWordModelState>,
}

impl ClientData {
    pub fn new() -> Self {
        Self {
            audio: RollingWindow::scalar(MAX_AUDIO_SAMPLES),
            mels: RollingWindow::new(MAX_MEL_FRAMES, NUM_MELS),
            models: HashMap::new(),
        }
    }

    /// Create the model state on first association; refresh parameters otherwise.
    pub fn ensure_model(&mut self, params: &ModelParams) -> &mut WakeWordModelState {
        let state = self
            .models
            .entry(params.name.clone())
            .or_insert_with(|| WakeWordModelState::new(params));
        state.threshold = params.threshold;
        state.trigger_level = params.trigger_level;
        state
    }

    /// Zero all windows and counters and clear every model's detection state.
    pub fn reset(&mut self) {
        self.audio.clear();
        self.mels.clear();
        for model in self.models.values_mut() {
            model.reset();
        }
    }
}

impl Default for ClientData {
    fn default() -> Self {
        Self::new()
    }
}

/// Which window of a client a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage<'a> {
    Audio,
    Mels,
    Embeddings(&'a str),
}

/// Client id → client data, plus the model set every client is associated with.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ClientData>>,
    models: Vec<ModelParams>,
}

impl ClientRegistry {
    pub fn new(models: Vec<ModelParams>) -> Self {
        let registry = Self {
            clients: Mutex::new(HashMap::new()),
            models,
        };
        registry.with_client(DEFAULT_CLIENT, |_| ());
        info!(models = registry.models.len(), "client_registry_ready");
        registry
    }

    pub fn models(&self) -> &[ModelParams] {
        &self.models
    }

    /// Run `f` on the client's data, creating the client on first use.
    /// `f` runs under the registry lock, which is not re-entrant: calling
    /// back into the registry from `f` deadlocks.
    pub fn with_client<R>(&self, id: &str, f: impl FnOnce(&mut ClientData) -> R) -> R {
        let mut clients = self.clients.lock();
        let client = clients.entry(id.to_string()).or_insert_with(|| {
            debug!(client = id, "client_created");
            let mut data = ClientData::new();
            for params in &self.models {
                data.ensure_model(params);
            }
            data
        });
        f(client)
    }

    /// Run `f` on an existing client only.
    pub fn with_existing<R>(&self, id: &str, f: impl FnOnce(&mut ClientData) -> R) -> Option<R> {
        self.clients.lock().get_mut(id).map(f)
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Append frames to one window of a client. Returns frames written
    /// (0 when the target model is not associated with the client).
    pub fn append(&self, id: &str, stage: Stage<'_>, frames: &[f32]) -> usize {
        self.with_client(id, |client| match stage {
            Stage::Audio => client.audio.append(frames),
            Stage::Mels => client.mels.append(frames),
            Stage::Embeddings(model) => client
                .models
                .get_mut(model)
                .map_or(0, |state| state.embeddings.append(frames)),
        })
    }

    /// Logically reset a client (windows, counters, detection flags).
    pub fn reset(&self, id: &str) {
        if self.with_existing(id, ClientData::reset).is_some() {
            debug!(client = id, "client_reset");
        }
    }
}
