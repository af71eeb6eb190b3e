//! Capture loop: reads fixed-size frames from the microphone and routes each
//! one by the current mode, either into the client's raw audio window (wake
//! word pipeline) or unmodified onto the capture-to-session queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::device::AudioBackend;
use super::{i16_to_f32, i16_to_pcm_bytes, AudioError, Uplink, CHUNK_SIZE_SESSION, CHUNK_SIZE_WAKE};
use crate::mode::{InteractionMode, ModeMachine};
use crate::pipeline::PipelineContext;
use crate::registry::Stage;

/// Back-off after a failed device read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct CaptureLoop {
    backend: Arc<dyn AudioBackend>,
    modes: Arc<ModeMachine>,
    ctx: Arc<PipelineContext>,
    client_id: String,
    sample_rate: u32,
}

impl CaptureLoop {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        modes: Arc<ModeMachine>,
        ctx: Arc<PipelineContext>,
        client_id: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            backend,
            modes,
            ctx,
            client_id: client_id.into(),
            sample_rate,
        }
    }

    /// Frame size for a mode: session chunking while listening, wake word chunking otherwise.
    pub fn frame_size(mode: InteractionMode) -> usize {
        if mode == InteractionMode::Listening {
            CHUNK_SIZE_SESSION
        } else {
            CHUNK_SIZE_WAKE
        }
    }

    /// Run until the pipeline stops. A device that cannot be opened, or that
    /// closes, ends the loop with an error; read errors are retried.
    pub fn run(self) -> Result<(), AudioError> {
        info!(client = %self.client_id, "starting audio capture");
        let mut device = self.backend.open_input(self.sample_rate).map_err(|e| {
            error!(error = %e, "audio capture failed to open");
            e
        })?;

        while self.ctx.is_running() {
            let mode = self.modes.current_mode();
            let frame = match device.read(Self::frame_size(mode)) {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "audio read error");
                    self.ctx.sleep(READ_RETRY_DELAY);
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "audio capture stream lost");
                    return Err(e);
                }
            };
            self.route(mode, &frame);
        }

        info!("audio capture stopped");
        Ok(())
    }

    /// Route one frame captured while in `mode`.
    pub fn route(&self, mode: InteractionMode, frame: &[i16]) {
        if mode.feeds_wake_word() {
            let samples = i16_to_f32(frame);
            {
                let _stage = self.ctx.audio_ready.lock();
                self.ctx
                    .registry
                    .append(&self.client_id, Stage::Audio, &samples);
            }
            self.ctx.audio_ready.signal();
        } else {
            self.modes
                .uplink()
                .push(Uplink::Audio(i16_to_pcm_bytes(frame)));
        }
    }
}
