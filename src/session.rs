//! Speech session bridge.
//!
//! The session's async tasks run on a dedicated `session-runtime` thread that
//! owns a current-thread tokio runtime. Other threads talk to it only through
//! channels: `start_session` spawns a task on the runtime handle,
//! `feed_audio` pushes onto the session's outbound channel, and `stop_session`
//! cancels the session token and pushes a close sentinel. None of them block.
//!
//! One session = one task that selects over a send loop (outbound audio) and
//! a receive loop (response audio, tool call batches). Each session carries a
//! generation guard so a stale session ending late cannot reset a newer one.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::audio::Uplink;
use crate::cancellation::{GenerationGuard, SessionGenerations};
use crate::mode::ModeMachine;
use crate::pipeline::PipelineContext;
use crate::tools::{ToolCall, ToolDeclaration, ToolDispatcher, ToolResult};

/// How long the runtime may take to wind down its tasks at close.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll interval of the uplink forwarder.
const UPLINK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("session closed by remote")]
    Closed,
    #[error("session timed out")]
    Timeout,
    #[error("speech session backend unavailable: {0}")]
    Unavailable(String),
    #[error("session runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

impl SessionError {
    /// Normal ends of a conversation, logged at info rather than error.
    pub fn is_benign(&self) -> bool {
        matches!(self, SessionError::Closed | SessionError::Timeout)
    }
}

/// Parameters of every session connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub location: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
}

impl SessionConfig {
    pub fn new(voice_name: &str, location: impl Into<String>, tools: Vec<ToolDeclaration>) -> Self {
        let location = location.into();
        Self {
            system_instruction: system_instruction(voice_name, &location),
            location,
            tools,
        }
    }
}

pub fn system_instruction(voice_name: &str, location: &str) -> String {
    format!(
        "You are a helpful and friendly AI assistant. Your name is {voice_name}. \
         You are located in {location}."
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Raw 16-bit PCM at the output rate.
    Audio(Vec<u8>),
    /// One batch of function calls; answered with one result batch.
    ToolCall(Vec<ToolCall>),
}

/// Establishes sessions. The wire protocol lives behind this trait.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn SessionSender>, Box<dyn SessionReceiver>), SessionError>;
}

#[async_trait]
pub trait SessionSender: Send {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), SessionError>;

    async fn send_tool_results(&mut self, results: Vec<ToolResult>) -> Result<(), SessionError>;

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[async_trait]
pub trait SessionReceiver: Send {
    /// Next inbound event; `None` once the remote ended the stream.
    async fn next_event(&mut self) -> Option<Result<SessionEvent, SessionError>>;
}

/// Connector used when no speech backend is compiled in. Every connection
/// attempt fails, which the bridge handles like any other session error.
pub struct UnavailableConnector;

#[async_trait]
impl SessionConnector for UnavailableConnector {
    async fn connect(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Box<dyn SessionSender>, Box<dyn SessionReceiver>), SessionError> {
        Err(SessionError::Unavailable("no speech session transport configured".into()))
    }
}

/// Session control as seen by the wake word handler, buttons and supervisor.
pub trait SessionControl: Send + Sync {
    /// Connect unless a session is connected or connecting.
    fn start_session(&self);
    /// End the current session, if any. Never blocks.
    fn stop_session(&self);
    /// Forward microphone audio; dropped unless connected.
    fn feed_audio(&self, chunk: Vec<u8>);
    /// Stop the bridge's worker for good.
    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
}

enum Outbound {
    Audio(Vec<u8>),
    Close,
}

struct Link {
    status: SessionStatus,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

struct Shared {
    connector: Arc<dyn SessionConnector>,
    config: SessionConfig,
    tools: Arc<ToolDispatcher>,
    modes: Arc<ModeMachine>,
    generations: SessionGenerations,
    link: Mutex<Link>,
}

impl Shared {
    /// Reset the link, unless a newer session already owns it.
    fn finish(&self, guard: &GenerationGuard) {
        let mut link = self.link.lock();
        if guard.is_current() {
            link.status = SessionStatus::Idle;
            link.outbound = None;
        }
    }
}

pub struct SessionBridge {
    handle: Handle,
    shared: Arc<Shared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBridge {
    /// Start the `session-runtime` thread and return once its runtime is up.
    pub fn spawn(
        connector: Arc<dyn SessionConnector>,
        config: SessionConfig,
        tools: Arc<ToolDispatcher>,
        modes: Arc<ModeMachine>,
    ) -> Result<Self, SessionError> {
        let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("session-runtime".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
                info!("session runtime stopped");
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| SessionError::Runtime(std::io::Error::other("session runtime exited during startup")))??;
        info!(tools = config.tools.len(), "session bridge started");

        Ok(Self {
            handle,
            shared: Arc::new(Shared {
                connector,
                config,
                tools,
                modes,
                generations: SessionGenerations::new(),
                link: Mutex::new(Link {
                    status: SessionStatus::Idle,
                    outbound: None,
                }),
            }),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.link.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    /// The runtime thread, for the supervisor's bounded join.
    pub fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }
}

impl SessionControl for SessionBridge {
    fn start_session(&self) {
        let guard = {
            let mut link = self.shared.link.lock();
            if link.status != SessionStatus::Idle {
                debug!(status = ?link.status, "session already active");
                return;
            }
            link.status = SessionStatus::Connecting;
            self.shared.generations.advance()
        };
        self.handle.spawn(run_session(Arc::clone(&self.shared), guard));
    }

    fn stop_session(&self) {
        let mut link = self.shared.link.lock();
        if link.status == SessionStatus::Idle {
            return;
        }
        info!(status = ?link.status, "stopping session");
        link.status = SessionStatus::Idle;
        self.shared.generations.cancel_current();
        if let Some(tx) = link.outbound.take() {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn feed_audio(&self, chunk: Vec<u8>) {
        let link = self.shared.link.lock();
        if link.status != SessionStatus::Connected {
            return;
        }
        if let Some(tx) = &link.outbound {
            let _ = tx.send(Outbound::Audio(chunk));
        }
    }

    fn close(&self) {
        self.stop_session();
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

async fn run_session(shared: Arc<Shared>, guard: GenerationGuard) {
    let generation = guard.my_generation();
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(generation, %session_id, location = %shared.config.location, "session connecting");

    // A connection that did complete is closed below, not dropped.
    let connected = tokio::select! {
        biased;
        result = shared.connector.connect(&shared.config) => result,
        _ = guard.token().cancelled() => {
            debug!(generation, "session cancelled while connecting");
            shared.finish(&guard);
            return;
        }
    };
    let (mut sender, receiver) = match connected {
        Ok(halves) => halves,
        Err(e) => {
            error!(generation, error = %e, "session connection error");
            shared.finish(&guard);
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let published = {
        let mut link = shared.link.lock();
        let live = guard.should_continue();
        if live {
            link.status = SessionStatus::Connected;
            link.outbound = Some(tx);
        }
        live
    };
    if !published {
        debug!(generation, %session_id, "session superseded before it connected");
        if let Err(e) = sender.close().await {
            debug!(generation, error = %e, "session close error");
        }
        return;
    }
    info!(generation, %session_id, "session connected");

    let sender = tokio::sync::Mutex::new(sender);
    let outcome = tokio::select! {
        result = send_loop(&sender, rx) => result,
        result = receive_loop(&shared, &guard, &sender, receiver) => result,
        _ = guard.token().cancelled() => Ok(()),
    };
    match outcome {
        Ok(()) => info!(generation, %session_id, "session ended"),
        Err(e) if e.is_benign() => info!(generation, %session_id, reason = %e, "session ended"),
        Err(e) => error!(generation, %session_id, error = %e, "session error"),
    }
    if let Err(e) = sender.lock().await.close().await {
        debug!(generation, error = %e, "session close error");
    }
    shared.finish(&guard);
}

async fn send_loop(
    sender: &tokio::sync::Mutex<Box<dyn SessionSender>>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), SessionError> {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Audio(chunk) => sender.lock().await.send_audio(chunk).await?,
            Outbound::Close => break,
        }
    }
    Ok(())
}

async fn receive_loop(
    shared: &Shared,
    guard: &GenerationGuard,
    sender: &tokio::sync::Mutex<Box<dyn SessionSender>>,
    mut receiver: Box<dyn SessionReceiver>,
) -> Result<(), SessionError> {
    while let Some(event) = receiver.next_event().await {
        match event? {
            SessionEvent::Audio(chunk) => {
                if shared
                    .modes
                    .queue_response_audio_while(chunk, || guard.should_continue())
                {
                    shared.modes.touch_listening_timestamp();
                }
            }
            SessionEvent::ToolCall(calls) => {
                let results = handle_tool_calls(shared, calls).await;
                if !results.is_empty() {
                    sender.lock().await.send_tool_results(results).await?;
                }
            }
        }
    }
    Err(SessionError::Closed)
}

/// EXECUTE for the whole batch, LISTENING once every call finished.
async fn handle_tool_calls(shared: &Shared, calls: Vec<ToolCall>) -> Vec<ToolResult> {
    shared.modes.enter_execute();
    let results = shared.tools.dispatch(calls).await;
    let failed = results.iter().filter(|r| r.is_error()).count();
    info!(calls = results.len(), failed, "tool batch finished");
    shared.modes.enter_listening();
    results
}

/// `session-uplink` thread body: drain the capture-to-session queue into the
/// session until the shutdown sentinel or the running flag clears.
pub fn run_uplink_forwarder(
    ctx: Arc<PipelineContext>,
    modes: Arc<ModeMachine>,
    session: Arc<dyn SessionControl>,
) {
    info!("uplink forwarder started");
    while ctx.is_running() {
        match modes.uplink().recv_timeout(UPLINK_POLL) {
            Some(Uplink::Audio(chunk)) => session.feed_audio(chunk),
            Some(Uplink::Shutdown) => {
                debug!("uplink shutdown sentinel received");
                break;
            }
            None => {}
        }
    }
    if ctx.is_running() {
        warn!("uplink forwarder stopped while pipeline still running");
    }
    info!("uplink forwarder stopped");
}
