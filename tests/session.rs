//! Session bridge integration tests
//!
//! Drives the bridge's runtime thread against an in-memory remote

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use voice_assist::mode::InteractionMode;
use voice_assist::session::{
    SessionBridge, SessionConfig, SessionConnector, SessionControl, SessionError, SessionEvent,
    SessionReceiver, SessionSender, SessionStatus, UnavailableConnector,
};
use voice_assist::settings::SettingsStore;
use voice_assist::supervisor::join_with_timeout;
use voice_assist::tools::{HomeAutomation, ToolCall, ToolDispatcher, ToolError, ToolResult};
use voice_assist::volume::VolumeController;

mod common;
use common::{rig, wait_until, Event, NullMixer, Rig};

const WAIT: Duration = Duration::from_secs(2);

type Inbound = Result<SessionEvent, SessionError>;

type ConnectHook = Box<dyn Fn() + Send + Sync>;

/// Remote end of the fake session: records what the bridge sent and lets the
/// test push inbound events into the live connection.
#[derive(Default)]
struct Remote {
    connects: AtomicUsize,
    closes: AtomicUsize,
    audio: Mutex<Vec<Vec<u8>>>,
    results: Mutex<Vec<Vec<ToolResult>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    /// Runs inside `connect`, just before it succeeds.
    on_connect: Mutex<Option<ConnectHook>>,
}

impl Remote {
    fn push(&self, event: SessionEvent) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            // The bridge may already have dropped a stopped session's receiver.
            let _ = tx.send(Ok(event));
        }
    }

    /// Remote hangs up.
    fn hang_up(&self) {
        self.inbound.lock().take();
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct FakeConnector(Arc<Remote>);

struct FakeSender(Arc<Remote>);

struct FakeReceiver(mpsc::UnboundedReceiver<Inbound>);

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Box<dyn SessionSender>, Box<dyn SessionReceiver>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.inbound.lock() = Some(tx);
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        let hook = self.0.on_connect.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok((Box::new(FakeSender(Arc::clone(&self.0))), Box::new(FakeReceiver(rx))))
    }
}

#[async_trait]
impl SessionSender for FakeSender {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), SessionError> {
        self.0.audio.lock().push(chunk);
        Ok(())
    }

    async fn send_tool_results(&mut self, results: Vec<ToolResult>) -> Result<(), SessionError> {
        self.0.results.lock().push(results);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SessionReceiver for FakeReceiver {
    async fn next_event(&mut self) -> Option<Inbound> {
        self.0.recv().await
    }
}

struct FakeHome;

impl HomeAutomation for FakeHome {
    fn execute_home_command(&self, command: &str) -> Result<String, ToolError> {
        if command.contains("oven") {
            Err(ToolError::Failed("Could not control: oven".into()))
        } else {
            Ok("Command processed.".into())
        }
    }
}

struct Harness {
    rig: Rig,
    remote: Arc<Remote>,
    bridge: Arc<SessionBridge>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let remote = Arc::new(Remote::default());
        Self::with_connector(Arc::clone(&remote), Arc::new(FakeConnector(remote)))
    }

    fn with_connector(remote: Arc<Remote>, connector: Arc<dyn SessionConnector>) -> Self {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("config.json")));
        let volume = Arc::new(VolumeController::new(Arc::new(NullMixer), settings));
        let tools = Arc::new(ToolDispatcher::new(volume, Some(Arc::new(FakeHome)), None));
        let config = SessionConfig::new("Ollie", "Sofia, Bulgaria", tools.declarations());
        let bridge =
            Arc::new(SessionBridge::spawn(connector, config, tools, Arc::clone(&rig.modes)).unwrap());
        Self {
            rig,
            remote,
            bridge,
            _dir: dir,
        }
    }

    fn connect(&self) {
        self.bridge.start_session();
        assert!(wait_until(WAIT, || self.bridge.is_connected()));
    }

    fn close(self) {
        self.bridge.close();
        let thread = self.bridge.take_thread().unwrap();
        assert!(join_with_timeout(thread, WAIT));
    }
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        args,
    }
}

#[test]
fn test_tool_batch_yields_one_result_per_call() {
    let h = Harness::new();
    h.rig.modes.enter_listening();
    h.connect();

    h.remote.push(SessionEvent::ToolCall(vec![
        call("c1", "adjust_volume", json!({"action": "set", "level": 40})),
        call("c2", "control_smart_device", json!({"command": "preheat the oven"})),
        call("c3", "control_smart_device", json!({"command": "lights off"})),
        call("c4", "fly_to_moon", json!({})),
    ]));
    assert!(wait_until(WAIT, || h.remote.results.lock().len() == 1));

    let batch = h.remote.results.lock()[0].clone();
    let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
    assert_eq!(batch[0].response, json!({"level": 40}));
    assert_eq!(batch[1].response, json!({"error": "Could not control: oven"}));
    assert_eq!(batch[2].response, json!({"result": "Command processed."}));
    assert!(batch[3].is_error());

    assert_eq!(h.rig.modes.current_mode(), InteractionMode::Listening);
    let modes = h.rig.log.modes();
    assert_eq!(
        &modes[modes.len() - 2..],
        &[InteractionMode::Execute, InteractionMode::Listening]
    );
    h.close();
}

#[test]
fn test_stop_without_session_is_safe() {
    let h = Harness::new();
    h.bridge.stop_session();
    h.bridge.stop_session();
    h.bridge.feed_audio(vec![1, 2, 3]);

    assert_eq!(h.bridge.status(), SessionStatus::Idle);
    assert_eq!(h.remote.connects(), 0);
    h.close();
}

#[test]
fn test_audio_is_forwarded_only_while_connected() {
    let h = Harness::new();
    h.bridge.feed_audio(vec![0; 8]);

    h.connect();
    h.bridge.feed_audio(vec![1; 8]);
    h.bridge.feed_audio(vec![2; 8]);
    assert!(wait_until(WAIT, || h.remote.audio.lock().len() == 2));
    assert_eq!(h.remote.audio.lock()[0], vec![1; 8]);

    h.bridge.stop_session();
    assert_eq!(h.bridge.status(), SessionStatus::Idle);
    h.bridge.feed_audio(vec![3; 8]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.remote.audio.lock().len(), 2);
    h.close();
}

#[test]
fn test_start_is_a_noop_while_active() {
    let h = Harness::new();
    h.connect();
    h.bridge.start_session();
    h.bridge.start_session();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.remote.connects(), 1);
    h.close();
}

#[test]
fn test_response_audio_reaches_playback_queue() {
    let h = Harness::new();
    h.connect();
    assert_eq!(h.rig.modes.current_mode(), InteractionMode::WakeWord);

    h.remote.push(SessionEvent::Audio(vec![7; 96]));
    assert!(wait_until(WAIT, || h.rig.modes.playback().len() == 1));
    assert_eq!(h.rig.modes.current_mode(), InteractionMode::Listening);
    assert_eq!(h.rig.log.ducks(), 1);
    assert_eq!(h.rig.modes.playback().try_recv(), Some(vec![7; 96]));
    h.close();
}

#[test]
fn test_remote_close_allows_reconnect() {
    let h = Harness::new();
    h.connect();
    h.remote.hang_up();
    assert!(wait_until(WAIT, || h.bridge.status() == SessionStatus::Idle));

    h.connect();
    assert_eq!(h.remote.connects(), 2);
    h.close();
}

#[test]
fn test_unavailable_backend_returns_to_idle() {
    let remote = Arc::new(Remote::default());
    let h = Harness::with_connector(remote, Arc::new(UnavailableConnector));
    h.bridge.start_session();
    assert!(wait_until(WAIT, || h.bridge.status() == SessionStatus::Idle));
    assert!(!h.bridge.is_connected());
    assert!(h.rig.log.events().iter().all(|e| *e != Event::Restore));
    h.close();
}

#[test]
fn test_session_cancelled_during_connect_is_closed() {
    let h = Harness::new();
    let bridge: Weak<SessionBridge> = Arc::downgrade(&h.bridge);
    *h.remote.on_connect.lock() = Some(Box::new(move || {
        if let Some(bridge) = bridge.upgrade() {
            bridge.stop_session();
        }
    }));

    h.bridge.start_session();
    assert!(wait_until(WAIT, || h.remote.closes() == 1));
    assert_eq!(h.remote.connects(), 1);
    assert_eq!(h.bridge.status(), SessionStatus::Idle);

    h.bridge.feed_audio(vec![5; 8]);
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.remote.audio.lock().is_empty());
    h.close();
}

#[test]
fn test_late_response_audio_from_stopped_session_is_dropped() {
    let h = Harness::new();
    h.rig.modes.enter_listening();
    h.connect();
    h.bridge.stop_session();
    h.rig.modes.enter_wake_word();

    h.remote.push(SessionEvent::Audio(vec![9; 96]));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.rig.modes.current_mode(), InteractionMode::WakeWord);
    assert!(h.rig.modes.playback().is_empty());
    h.close();
}
