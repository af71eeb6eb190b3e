//! Supervisor: owns every worker thread, runs the watchdog and performs the
//! ordered shutdown.
//!
//! Watchdog (once per interval): a dead critical worker (the capture loop)
//! stops the device; LISTENING past the idle timeout reverts to WAKE_WORD and
//! tears the session down.
//!
//! Shutdown: running flag off → gates released → uplink sentinel → session
//! closed → ambient media restored → bounded join per thread. Threads that overstay are logged and
//! left to die with the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::audio::Uplink;
use crate::config::{Config, ConfigError};
use crate::mode::ModeMachine;
use crate::pipeline::PipelineContext;
use crate::session::{SessionControl, SessionError};
use crate::tools::ToolError;

const JOIN_POLL: Duration = Duration::from_millis(10);
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no internet connection or location service unavailable")]
    NoConnectivity,
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("executor setup failed: {0}")]
    Executor(#[from] ToolError),
}

/// Whether a worker's exit ends the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Critical,
    Background,
}

struct Worker {
    name: String,
    role: WorkerRole,
    handle: JoinHandle<()>,
}

/// Requests a stop from another thread (signal handler, tests).
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// Stop: a critical worker died.
    Stop,
}

pub struct Supervisor {
    ctx: Arc<PipelineContext>,
    modes: Arc<ModeMachine>,
    session: Arc<dyn SessionControl>,
    workers: Vec<Worker>,
    idle_timeout: Duration,
    watchdog_interval: Duration,
    join_timeout: Duration,
    stop: StopHandle,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<PipelineContext>,
        modes: Arc<ModeMachine>,
        session: Arc<dyn SessionControl>,
        config: &Config,
    ) -> Self {
        Self {
            ctx,
            modes,
            session,
            workers: Vec::new(),
            idle_timeout: config.idle_timeout,
            watchdog_interval: config.watchdog_interval,
            join_timeout: config.join_timeout,
            stop: StopHandle::default(),
        }
    }

    /// Start a named worker thread.
    pub fn spawn<F>(&mut self, name: impl Into<String>, role: WorkerRole, body: F) -> Result<(), StartupError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| StartupError::Spawn {
                name: name.clone(),
                source,
            })?;
        debug!(thread = %name, role = ?role, "worker started");
        self.workers.push(Worker { name, role, handle });
        Ok(())
    }

    /// Track a thread started elsewhere so shutdown joins it too.
    pub fn adopt(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.workers.push(Worker {
            name: name.into(),
            role: WorkerRole::Background,
            handle,
        });
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// One watchdog pass.
    pub fn watchdog_tick(&self) -> Tick {
        if let Some(dead) = self
            .workers
            .iter()
            .find(|w| w.role == WorkerRole::Critical && w.handle.is_finished())
        {
            error!(thread = %dead.name, "critical thread has died, stopping");
            return Tick::Stop;
        }

        // Session first, inside the revert: late response audio must not re-wake.
        let reverted = self
            .modes
            .revert_if_idle_with(self.idle_timeout, || self.session.stop_session());
        if reverted {
            info!(timeout_s = self.idle_timeout.as_secs_f32(), "session idle timeout");
        }
        Tick::Continue
    }

    /// Watchdog loop until a stop request or a dead critical worker, then shut down.
    pub fn run(self) {
        info!(workers = self.workers.len(), "ready");
        loop {
            if self.stop.is_stop_requested() || !self.ctx.is_running() {
                info!("stop requested");
                break;
            }
            if self.watchdog_tick() == Tick::Stop {
                break;
            }
            self.pause(self.watchdog_interval);
        }
        self.shutdown();
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop.is_stop_requested() && self.ctx.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    /// Ordered shutdown. Returns the names of threads that did not exit in time.
    pub fn shutdown(self) -> Vec<String> {
        info!("shutdown sequence initiated");
        self.ctx.stop();
        let released = self.ctx.unblock_all();
        debug!(released, "stage gates released");
        self.modes.uplink().push(Uplink::Shutdown);
        self.session.close();
        self.modes.close_ambient();

        let mut abandoned = Vec::new();
        for worker in self.workers {
            // A stage may have re-entered its wait after the first release.
            self.ctx.unblock_all();
            debug!(thread = %worker.name, "joining thread");
            if !join_with_timeout(worker.handle, self.join_timeout) {
                warn!(thread = %worker.name, "thread did not exit cleanly after timeout");
                abandoned.push(worker.name);
            }
        }
        info!(abandoned = abandoned.len(), "all threads joined or timed out");
        abandoned
    }
}

/// Join `handle` if it finishes within `timeout`; otherwise detach it.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("thread exited with a panic");
    }
    true
}
