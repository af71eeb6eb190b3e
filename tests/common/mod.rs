//! Shared fakes for the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use voice_assist::audio::device::{AudioBackend, InputDevice, OutputDevice};
use voice_assist::audio::{AudioError, AudioQueue};
use voice_assist::indicator::Indicator;
use voice_assist::mode::{AmbientMedia, InteractionMode, ModeEffects, ModeMachine};
use voice_assist::pipeline::PipelineContext;
use voice_assist::registry::{ClientRegistry, ModelParams};
use voice_assist::session::SessionControl;
use voice_assist::volume::OutputVolume;

pub const MODEL: &str = "test_model";

/// Every indicator call and ambient media call, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Duck,
    Restore,
    Indicator(InteractionMode),
}

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn modes(&self) -> Vec<InteractionMode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Indicator(mode) => Some(mode),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events().into_iter().filter(|e| *e == event).count()
    }

    pub fn ducks(&self) -> usize {
        self.count(Event::Duck)
    }

    pub fn restores(&self) -> usize {
        self.count(Event::Restore)
    }
}

impl Indicator for EventLog {
    fn on_mode_change(&self, mode: InteractionMode) {
        self.events.lock().push(Event::Indicator(mode));
    }
}

impl AmbientMedia for EventLog {
    fn duck(&self) {
        self.events.lock().push(Event::Duck);
    }

    fn restore(&self) {
        self.events.lock().push(Event::Restore);
    }
}

pub struct Rig {
    pub registry: Arc<ClientRegistry>,
    pub ctx: Arc<PipelineContext>,
    pub modes: Arc<ModeMachine>,
    pub log: Arc<EventLog>,
}

pub fn rig_with(threshold: f32, trigger_level: u32) -> Rig {
    let registry = Arc::new(ClientRegistry::new(vec![ModelParams::new(
        MODEL,
        threshold,
        trigger_level,
    )]));
    let ctx = Arc::new(PipelineContext::new(Arc::clone(&registry)));
    let log = Arc::new(EventLog::default());
    let modes = Arc::new(ModeMachine::new(
        Arc::clone(&registry),
        Arc::new(AudioQueue::new()),
        Arc::new(AudioQueue::new()),
        ModeEffects {
            indicator: log.clone(),
            ambient: log.clone(),
        },
    ));
    Rig {
        registry,
        ctx,
        modes,
        log,
    }
}

pub fn rig() -> Rig {
    rig_with(0.5, 1)
}

#[derive(Default)]
pub struct CountingSession {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fed: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CountingSession {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl SessionControl for CountingSession {
    fn start_session(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_session(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn feed_audio(&self, _chunk: Vec<u8>) {
        self.fed.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct NullMixer;

impl OutputVolume for NullMixer {
    fn set_output_volume(&self, _percent: u8) -> std::io::Result<()> {
        Ok(())
    }
}

/// Audio backend with a scripted microphone and a recording speaker.
#[derive(Default)]
pub struct FakeAudio {
    pub frames: Mutex<VecDeque<Vec<i16>>>,
    pub written: Arc<Mutex<Vec<Vec<u8>>>>,
    pub fail_input: bool,
}

struct FakeInput {
    backend_frames: Arc<FakeAudio>,
}

impl InputDevice for FakeInput {
    fn read(&mut self, samples: usize) -> Result<Vec<i16>, AudioError> {
        std::thread::sleep(Duration::from_millis(2));
        let next = self.backend_frames.frames.lock().pop_front();
        Ok(next.unwrap_or_else(|| vec![0; samples]))
    }
}

struct FakeOutput {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl OutputDevice for FakeOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.written.lock().push(pcm.to_vec());
        Ok(())
    }
}

/// `AudioBackend` over a shared `FakeAudio`.
pub struct FakeBackend(pub Arc<FakeAudio>);

impl AudioBackend for FakeBackend {
    fn open_input(&self, _sample_rate: u32) -> Result<Box<dyn InputDevice>, AudioError> {
        if self.0.fail_input {
            return Err(AudioError::NoDevice("fake microphone missing".into()));
        }
        Ok(Box::new(FakeInput {
            backend_frames: Arc::clone(&self.0),
        }))
    }

    fn open_output(&self, _sample_rate: u32) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(FakeOutput {
            written: Arc::clone(&self.0.written),
        }))
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
