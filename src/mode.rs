//! Interaction mode machine: WAKE_WORD → LISTENING → RESPONSE / EXECUTE → LISTENING → WAKE_WORD.
//! Single writer of the mode. Every transition updates the mode and then runs
//! the side-effect set of the target mode, serialized against other transitions.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::audio::{AudioQueue, Uplink};
use crate::indicator::Indicator;
use crate::registry::{ClientRegistry, DEFAULT_CLIENT};

/// The device's interaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InteractionMode {
    /// Audio feeds the wake word pipeline.
    WakeWord,
    /// Audio streams to the speech session.
    Listening,
    /// Response audio is playing.
    Response,
    /// A tool call batch is running.
    Execute,
}

impl std::fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionMode::WakeWord => write!(f, "WAKE_WORD"),
            InteractionMode::Listening => write!(f, "LISTENING"),
            InteractionMode::Response => write!(f, "RESPONSE"),
            InteractionMode::Execute => write!(f, "EXECUTE"),
        }
    }
}

/// One side effect of entering a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    ClearUplink,
    ClearPlayback,
    ResetDefaultClient,
    StampListening,
    DuckMedia,
    RestoreMedia,
    NotifyIndicator,
}

impl InteractionMode {
    /// Side effects of entering `self`, in execution order. Depends only on the
    /// target, never on the mode being left.
    pub fn entry_effects(self) -> &'static [SideEffect] {
        use SideEffect::*;
        match self {
            InteractionMode::Listening => &[
                ClearUplink,
                ClearPlayback,
                ResetDefaultClient,
                StampListening,
                DuckMedia,
                NotifyIndicator,
            ],
            InteractionMode::Response | InteractionMode::Execute => &[DuckMedia, NotifyIndicator],
            InteractionMode::WakeWord => &[ClearPlayback, RestoreMedia, NotifyIndicator],
        }
    }

    /// Whether captured audio goes to the wake word pipeline in this mode.
    pub fn feeds_wake_word(self) -> bool {
        !matches!(self, InteractionMode::Listening)
    }
}

/// Ambient media playback (e.g. a music service) that is lowered while the
/// assistant interacts. Implementations must not block the caller and must
/// tolerate repeated calls.
pub trait AmbientMedia: Send + Sync {
    fn duck(&self);
    fn restore(&self);
    /// Shutdown: leave the media restored and stop any worker.
    fn close(&self) {}
    /// Worker thread to join at shutdown, if there is one.
    fn take_thread(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Ambient media stand-in when no music service is configured.
pub struct NoAmbientMedia;

impl AmbientMedia for NoAmbientMedia {
    fn duck(&self) {}
    fn restore(&self) {}
}

/// Collaborators the mode machine drives on every transition. Fixed at construction.
#[derive(Clone)]
pub struct ModeEffects {
    pub indicator: Arc<dyn Indicator>,
    pub ambient: Arc<dyn AmbientMedia>,
}

struct ModeState {
    mode: InteractionMode,
    listening_since: Instant,
}

/// Thread-safe mode machine. Owns the capture-to-session and playback queues
/// because some transitions clear them.
pub struct ModeMachine {
    /// Serializes whole transitions (mode write + side effects). Re-entrant so
    /// an indicator callback may query or even transition on the same thread.
    transition: ReentrantMutex<()>,
    state: Mutex<ModeState>,
    uplink: Arc<AudioQueue<Uplink>>,
    playback: Arc<AudioQueue<Vec<u8>>>,
    registry: Arc<ClientRegistry>,
    effects: ModeEffects,
    mode_tx: watch::Sender<InteractionMode>,
    mode_rx: watch::Receiver<InteractionMode>,
}

impl ModeMachine {
    pub fn new(
        registry: Arc<ClientRegistry>,
        uplink: Arc<AudioQueue<Uplink>>,
        playback: Arc<AudioQueue<Vec<u8>>>,
        effects: ModeEffects,
    ) -> Self {
        let (mode_tx, mode_rx) = watch::channel(InteractionMode::WakeWord);
        Self {
            transition: ReentrantMutex::new(()),
            state: Mutex::new(ModeState {
                mode: InteractionMode::WakeWord,
                listening_since: Instant::now(),
            }),
            uplink,
            playback,
            registry,
            effects,
            mode_tx,
            mode_rx,
        }
    }

    pub fn current_mode(&self) -> InteractionMode {
        self.state.lock().mode
    }

    pub fn enter_listening(&self) {
        self.transition_to(InteractionMode::Listening);
    }

    pub fn enter_response(&self) {
        self.transition_to(InteractionMode::Response);
    }

    pub fn enter_execute(&self) {
        self.transition_to(InteractionMode::Execute);
    }

    pub fn enter_wake_word(&self) {
        self.transition_to(InteractionMode::WakeWord);
    }

    /// Restart the idle clock without changing mode.
    pub fn touch_listening_timestamp(&self) {
        self.state.lock().listening_since = Instant::now();
    }

    /// Time spent in LISTENING since entry or the last touch; `None` in other modes.
    pub fn listening_elapsed(&self) -> Option<Duration> {
        let state = self.state.lock();
        (state.mode == InteractionMode::Listening).then(|| state.listening_since.elapsed())
    }

    /// Wake word detection or explicit activation. Returns false (and does
    /// nothing) when already listening.
    pub fn activate(&self) -> bool {
        let _serial = self.transition.lock();
        if self.current_mode() == InteractionMode::Listening {
            return false;
        }
        self.enter_listening();
        true
    }

    /// Playback received a chunk: enter RESPONSE unless already there.
    pub fn begin_response(&self) -> bool {
        let _serial = self.transition.lock();
        if self.current_mode() == InteractionMode::Response {
            return false;
        }
        self.enter_response();
        true
    }

    /// Playback went idle: leave RESPONSE for LISTENING. No-op in other modes.
    pub fn end_response(&self) -> bool {
        let _serial = self.transition.lock();
        if self.current_mode() != InteractionMode::Response {
            return false;
        }
        self.enter_listening();
        true
    }

    /// Watchdog check: revert LISTENING to WAKE_WORD once the idle clock passes
    /// `timeout`. The check and the transition are atomic, so concurrent
    /// callers revert at most once.
    pub fn revert_if_idle(&self, timeout: Duration) -> bool {
        self.revert_if_idle_with(timeout, || {})
    }

    /// Like `revert_if_idle`, running `before_revert` (session teardown)
    /// inside the same transition, ahead of the mode change.
    pub fn revert_if_idle_with(&self, timeout: Duration, before_revert: impl FnOnce()) -> bool {
        let _serial = self.transition.lock();
        match self.listening_elapsed() {
            Some(elapsed) if elapsed > timeout => {
                info!(idle_ms = elapsed.as_millis() as u64, "listening_idle_timeout");
                before_revert();
                self.enter_wake_word();
                true
            }
            _ => false,
        }
    }

    /// Queue response audio for playback. Audio arriving in WAKE_WORD is an
    /// implicit wake: enter LISTENING first.
    pub fn queue_response_audio(&self, chunk: Vec<u8>) {
        self.queue_response_audio_while(chunk, || true);
    }

    /// Queue response audio only if `live` still holds once transitions are
    /// held off. A chunk from a session torn down by a concurrent revert is
    /// dropped instead of waking the device again. Returns whether it was queued.
    pub fn queue_response_audio_while(&self, chunk: Vec<u8>, live: impl FnOnce() -> bool) -> bool {
        let _serial = self.transition.lock();
        if !live() {
            debug!("response audio from a closed session dropped");
            return false;
        }
        if self.current_mode() == InteractionMode::WakeWord {
            self.activate();
        }
        self.playback.push(chunk);
        true
    }

    /// Shutdown hook for the ambient media collaborator.
    pub fn close_ambient(&self) {
        self.effects.ambient.close();
    }

    /// Subscribe to mode changes.
    pub fn subscribe(&self) -> watch::Receiver<InteractionMode> {
        self.mode_rx.clone()
    }

    pub fn uplink(&self) -> &Arc<AudioQueue<Uplink>> {
        &self.uplink
    }

    pub fn playback(&self) -> &Arc<AudioQueue<Vec<u8>>> {
        &self.playback
    }

    fn transition_to(&self, next: InteractionMode) {
        let _serial = self.transition.lock();
        let prev = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.mode, next)
        };
        info!(from = %prev, to = %next, "mode_transition");

        for effect in next.entry_effects() {
            self.apply(*effect, next);
        }
        let _ = self.mode_tx.send(next);
    }

    fn apply(&self, effect: SideEffect, mode: InteractionMode) {
        match effect {
            SideEffect::ClearUplink => {
                let dropped = self.uplink.clear();
                if dropped > 0 {
                    debug!(dropped, "uplink_queue_cleared");
                }
            }
            SideEffect::ClearPlayback => {
                let dropped = self.playback.clear();
                if dropped > 0 {
                    debug!(dropped, "playback_queue_cleared");
                }
            }
            SideEffect::ResetDefaultClient => self.registry.reset(DEFAULT_CLIENT),
            SideEffect::StampListening => self.touch_listening_timestamp(),
            SideEffect::DuckMedia => self.effects.ambient.duck(),
            SideEffect::RestoreMedia => self.effects.ambient.restore(),
            SideEffect::NotifyIndicator => self.effects.indicator.on_mode_change(mode),
        }
    }
}
