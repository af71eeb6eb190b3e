//! Audio layer: device access, sample conversion, the rolling windows fed to
//! the wake word pipeline, and the capture/playback loops.
//! Capture runs on its own thread and routes each frame by interaction mode.
//! Playback drains the response queue and drives RESPONSE ↔ LISTENING.

pub mod capture;
pub mod device;
pub mod playback;
pub mod rolling;

use std::time::Duration;

use crossbeam_channel as cb;

/// Microphone rate; also the rate audio is streamed to the speech session.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of the synthesized audio returned by the speech session.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per read while streaming to the speech session.
pub const CHUNK_SIZE_SESSION: usize = 1024;
/// Samples per read while feeding the wake word pipeline (80 ms).
pub const CHUNK_SIZE_WAKE: usize = 1280;

/// Raw audio window: 10 s of samples.
pub const MAX_AUDIO_SAMPLES: usize = 10 * INPUT_SAMPLE_RATE as usize;
/// Samples consumed per mel extraction pass.
pub const MEL_SAMPLES: usize = 1280;
pub const NUM_MELS: usize = 32;
pub const MAX_MEL_FRAMES: usize = 120;
/// Mel frames per embedding (≈775 ms).
pub const EMB_FEATURES: usize = 76;
/// Mel frames between consecutive embeddings.
pub const EMB_STEP: usize = 8;
pub const EMBEDDING_DIM: usize = 96;
pub const MAX_EMBEDDINGS: usize = 100;
/// Embeddings per classifier pass.
pub const WW_WINDOWS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio device: {0}")]
    NoDevice(String),
    #[error("failed to open audio stream: {0}")]
    Open(String),
    #[error("audio stream error: {0}")]
    Stream(String),
    #[error("audio read timed out")]
    Timeout,
    #[error("audio stream closed")]
    Closed,
}

impl AudioError {
    /// Transient errors are retried by the loops; the rest end them.
    pub fn is_transient(&self) -> bool {
        matches!(self, AudioError::Stream(_) | AudioError::Timeout)
    }
}

/// Item on the capture-to-session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uplink {
    /// Raw little-endian 16-bit PCM at `INPUT_SAMPLE_RATE`.
    Audio(Vec<u8>),
    /// Shutdown sentinel for the uplink forwarder.
    Shutdown,
}

/// Unbounded FIFO shared between threads. Clearing discards pending items.
pub struct AudioQueue<T> {
    tx: cb::Sender<T>,
    rx: cb::Receiver<T>,
}

impl<T> AudioQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = cb::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(item);
    }

    /// Wait up to `timeout` for the next item.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discard all pending items. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for AudioQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 16-bit PCM samples → normalized floats in [-1.0, 1.0).
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// 16-bit PCM samples → little-endian bytes.
pub fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Little-endian bytes → 16-bit PCM samples. A trailing odd byte is dropped.
pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
