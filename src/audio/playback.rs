//! Playback loop: drains the response queue to the speaker. A chunk moves the
//! mode to RESPONSE; an empty poll while in RESPONSE moves it back to
//! LISTENING, so a response ends as soon as audio stops arriving.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use super::device::{AudioBackend, OutputDevice};
use crate::mode::ModeMachine;
use crate::pipeline::PipelineContext;

pub struct PlaybackLoop {
    backend: Arc<dyn AudioBackend>,
    modes: Arc<ModeMachine>,
    ctx: Arc<PipelineContext>,
    sample_rate: u32,
    poll_interval: Duration,
    reopen_backoff: Duration,
}

impl PlaybackLoop {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        modes: Arc<ModeMachine>,
        ctx: Arc<PipelineContext>,
        sample_rate: u32,
        poll_interval: Duration,
        reopen_backoff: Duration,
    ) -> Self {
        Self {
            backend,
            modes,
            ctx,
            sample_rate,
            poll_interval,
            reopen_backoff,
        }
    }

    pub fn run(self) {
        let Some(mut device) = self.open_device() else {
            info!("audio playback stopped before device opened");
            return;
        };
        info!("audio playback loop started");

        while self.ctx.is_running() {
            match self.modes.playback().recv_timeout(self.poll_interval) {
                Some(chunk) => {
                    self.modes.begin_response();
                    if let Err(e) = device.write(&chunk) {
                        error!(error = %e, "error in output loop");
                        self.ctx.sleep(Duration::from_millis(100));
                    }
                }
                None => {
                    self.modes.end_response();
                }
            }
        }
        info!("audio playback stopped");
    }

    /// Retry with a fixed back-off until the device opens or shutdown.
    fn open_device(&self) -> Option<Box<dyn OutputDevice>> {
        while self.ctx.is_running() {
            match self.backend.open_output(self.sample_rate) {
                Ok(device) => return Some(device),
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in_ms = self.reopen_backoff.as_millis() as u64,
                        "failed to open audio output stream"
                    );
                    self.ctx.sleep(self.reopen_backoff);
                }
            }
        }
        None
    }
}
