//! voice-assist: always-listening voice assistant.
//! Local wake word pipeline, interaction mode machine, speech session bridge
//! and the worker threads tying them together.

pub mod audio;
pub mod buttons;
pub mod cancellation;
pub mod config;
pub mod gate;
pub mod home;
pub mod indicator;
pub mod kernel;
pub mod location;
pub mod mode;
pub mod music;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod tools;
pub mod volume;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use audio::capture::CaptureLoop;
use audio::device::{AudioBackend, CpalBackend};
use audio::playback::PlaybackLoop;
use audio::AudioQueue;
use buttons::{ButtonPanel, ButtonPins};
use config::Config;
use home::HomeAssistantClient;
use indicator::{Indicator, LogIndicator};
use kernel::Kernel;
use mode::{AmbientMedia, InteractionMode, ModeEffects, ModeMachine, NoAmbientMedia};
use music::SpotifyClient;
use pipeline::{Detection, DetectionHandler, PipelineContext};
use registry::{ClientRegistry, DEFAULT_CLIENT};
use session::{SessionBridge, SessionConfig, SessionConnector, SessionControl, UnavailableConnector};
use settings::SettingsStore;
use supervisor::{StartupError, StopHandle, Supervisor, WorkerRole};
use tools::{HomeAutomation, MusicService, ToolDispatcher};
use volume::{AmixerVolume, OutputVolume, VolumeController};

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "voice_assist=info",
        1 => "voice_assist=debug",
        _ => "voice_assist=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// External collaborators, fixed at launch.
pub struct Collaborators {
    pub audio: Arc<dyn AudioBackend>,
    pub connector: Arc<dyn SessionConnector>,
    pub indicator: Arc<dyn Indicator>,
    pub output_volume: Arc<dyn OutputVolume>,
    pub kernel: Kernel,
    pub home: Option<Arc<dyn HomeAutomation>>,
    pub music: Option<Arc<dyn MusicService>>,
    pub ambient: Arc<dyn AmbientMedia>,
}

impl Collaborators {
    /// Device defaults: cpal audio, amixer volume, logging indicator, placeholder
    /// kernel, and whichever network executors the config enables.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let home: Option<Arc<dyn HomeAutomation>> = match &config.home_assistant {
            Some(ha) => {
                info!(url = %ha.url, "home assistant integration enabled");
                Some(Arc::new(HomeAssistantClient::new(&ha.url, &ha.token)?))
            }
            None => {
                warn!("home assistant url or token not configured, integration disabled");
                None
            }
        };

        let (music, ambient): (Option<Arc<dyn MusicService>>, Arc<dyn AmbientMedia>) =
            match &config.spotify_token {
                Some(token) => {
                    let spotify = SpotifyClient::new(token, config.preferred_music_devices.clone())?;
                    let ducker = spotify.ducker()?;
                    info!("music integration enabled");
                    (Some(Arc::new(spotify)), Arc::new(ducker))
                }
                None => {
                    warn!("music credentials not found, integration disabled");
                    (None, Arc::new(NoAmbientMedia))
                }
            };

        Ok(Self {
            audio: Arc::new(CpalBackend::default()),
            connector: Arc::new(UnavailableConnector),
            indicator: Arc::new(LogIndicator),
            output_volume: Arc::new(AmixerVolume::default()),
            kernel: Kernel::placeholder(&config.wake_models),
            home,
            music,
            ambient,
        })
    }
}

/// A running assistant. `run` blocks in the watchdog until stopped, then shuts down.
pub struct Assistant {
    pub supervisor: Supervisor,
    pub ctx: Arc<PipelineContext>,
    pub modes: Arc<ModeMachine>,
    pub session: Arc<SessionBridge>,
    pub volume: Arc<VolumeController>,
    pub settings: Arc<SettingsStore>,
}

impl Assistant {
    pub fn stop_handle(&self) -> StopHandle {
        self.supervisor.stop_handle()
    }

    /// Button handlers for a hardware driver.
    pub fn button_panel(&self, pins: Arc<dyn ButtonPins>, config: &Config) -> ButtonPanel {
        ButtonPanel::new(
            pins,
            Arc::clone(&self.modes),
            Arc::clone(&self.session) as Arc<dyn SessionControl>,
            Arc::clone(&self.volume),
            config.button_settle,
        )
    }

    pub fn run(self) {
        self.supervisor.run();
    }
}

/// Wire every component and start the worker threads.
pub fn launch(
    config: &Config,
    location: &str,
    collaborators: Collaborators,
) -> Result<Assistant, StartupError> {
    let Collaborators {
        audio,
        connector,
        indicator,
        output_volume,
        kernel,
        home,
        music,
        ambient,
    } = collaborators;

    let settings = Arc::new(SettingsStore::load(&config.settings_path));
    info!(path = %settings.path().display(), "configuration loaded");
    let volume = Arc::new(VolumeController::new(output_volume, Arc::clone(&settings)));
    volume.restore();

    let registry = Arc::new(ClientRegistry::new(config.wake_models.clone()));
    let ctx = Arc::new(PipelineContext::new(Arc::clone(&registry)));
    let ambient_thread = ambient.take_thread();
    let modes = Arc::new(ModeMachine::new(
        registry,
        Arc::new(AudioQueue::new()),
        Arc::new(AudioQueue::new()),
        ModeEffects {
            indicator: Arc::clone(&indicator),
            ambient,
        },
    ));

    let tools = Arc::new(ToolDispatcher::new(Arc::clone(&volume), home, music));
    let session_config = SessionConfig::new(&settings.get().voice_name, location, tools.declarations());
    let session = Arc::new(SessionBridge::spawn(
        connector,
        session_config,
        tools,
        Arc::clone(&modes),
    )?);
    let control: Arc<dyn SessionControl> = session.clone();

    let mut supervisor = Supervisor::new(Arc::clone(&ctx), Arc::clone(&modes), Arc::clone(&control), config);
    if let Some(thread) = session.take_thread() {
        supervisor.adopt("session-runtime", thread);
    }
    if let Some(thread) = ambient_thread {
        supervisor.adopt("music-ducking", thread);
    }

    spawn_pipeline(&mut supervisor, &ctx, kernel, detection_handler(Arc::clone(&modes), Arc::clone(&control)))?;

    let playback = PlaybackLoop::new(
        Arc::clone(&audio),
        Arc::clone(&modes),
        Arc::clone(&ctx),
        config.output_sample_rate,
        config.playback_poll,
        config.playback_reopen_backoff,
    );
    supervisor.spawn("audio-playback", WorkerRole::Background, move || playback.run())?;

    let capture = CaptureLoop::new(
        audio,
        Arc::clone(&modes),
        Arc::clone(&ctx),
        DEFAULT_CLIENT,
        config.input_sample_rate,
    );
    supervisor.spawn("audio-capture", WorkerRole::Critical, move || {
        // Errors were logged by the loop; the watchdog sees the thread end.
        let _ = capture.run();
    })?;

    {
        let ctx = Arc::clone(&ctx);
        let modes = Arc::clone(&modes);
        supervisor.spawn("session-uplink", WorkerRole::Background, move || {
            session::run_uplink_forwarder(ctx, modes, control)
        })?;
    }

    indicator.on_mode_change(InteractionMode::WakeWord);
    info!(threads = ?supervisor.worker_names(), "voice assistant started");

    Ok(Assistant {
        supervisor,
        ctx,
        modes,
        session,
        volume,
        settings,
    })
}

/// Mel, embedding and one classifier thread per model.
fn spawn_pipeline(
    supervisor: &mut Supervisor,
    ctx: &Arc<PipelineContext>,
    kernel: Kernel,
    on_detection: DetectionHandler,
) -> Result<(), StartupError> {
    let Kernel {
        mels,
        embeddings,
        mut classifiers,
    } = kernel;

    let mel_ctx = Arc::clone(ctx);
    supervisor.spawn("ww-mels", WorkerRole::Background, move || {
        pipeline::run_mel_stage(mel_ctx, mels)
    })?;
    let emb_ctx = Arc::clone(ctx);
    supervisor.spawn("ww-embeddings", WorkerRole::Background, move || {
        pipeline::run_embedding_stage(emb_ctx, embeddings)
    })?;

    for params in ctx.registry.models() {
        let Some(classifier) = classifiers.remove(&params.name) else {
            warn!(model = %params.name, "no classifier for wake word model");
            continue;
        };
        let ctx = Arc::clone(ctx);
        let model = params.name.clone();
        let on_detection = Arc::clone(&on_detection);
        supervisor.spawn(format!("ww-{model}"), WorkerRole::Background, move || {
            pipeline::run_classifier_stage(ctx, model, classifier, on_detection)
        })?;
    }
    Ok(())
}

/// Wake word fired: enter LISTENING and connect, unless already listening.
pub fn detection_handler(modes: Arc<ModeMachine>, session: Arc<dyn SessionControl>) -> DetectionHandler {
    Arc::new(move |detection: &Detection| {
        let mode = modes.current_mode();
        if mode == InteractionMode::Listening {
            return;
        }
        info!(model = %detection.model, mode = %mode, "wake word detected");
        if modes.activate() {
            session.start_session();
        }
    })
}
