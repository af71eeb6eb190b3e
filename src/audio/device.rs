//! Audio device adapters. The capture and playback loops own their device
//! exclusively and open it on their own thread (cpal streams are not `Send`
//! on every platform).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{error, info};

use super::{pcm_bytes_to_i16, AudioError};

/// Blocking microphone reader.
pub trait InputDevice {
    /// Read exactly `samples` mono samples, or fail after the device's read timeout.
    fn read(&mut self, samples: usize) -> Result<Vec<i16>, AudioError>;
}

/// Blocking speaker writer.
pub trait OutputDevice {
    /// Write raw little-endian 16-bit PCM; blocks roughly in real time.
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
}

/// Opens devices. Shared between threads; each opened device stays on the
/// thread that opened it.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputDevice>, AudioError>;
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Default host devices through cpal, mono 16-bit.
pub struct CpalBackend {
    read_timeout: Duration,
}

impl CpalBackend {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputDevice>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::NoDevice("no audio input device available".into()))?;

        let stream_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = cb::unbounded::<Result<Vec<i16>, String>>();
        let err_tx = tx.clone();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    // Callback thread: copy out and return, no blocking.
                    let _ = tx.send(Ok(data.to_vec()));
                },
                move |err| {
                    error!(error = %err, "audio capture error");
                    let _ = err_tx.send(Err(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::Open(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AudioError::Open(format!("failed to start input stream: {e}")))?;
        info!(sample_rate, "audio capture stream started");

        Ok(Box::new(CpalInput {
            _stream: stream,
            rx,
            pending: VecDeque::new(),
            read_timeout: self.read_timeout,
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::NoDevice("no audio output device available".into()))?;

        let stream_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let pending: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let source = Arc::clone(&pending);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut queue = source.lock();
                    for out in data.iter_mut() {
                        *out = queue.pop_front().unwrap_or(0);
                    }
                },
                |err| {
                    error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| AudioError::Open(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AudioError::Open(format!("failed to start output stream: {e}")))?;
        info!(sample_rate, "audio playback stream started");

        Ok(Box::new(CpalOutput {
            _stream: stream,
            pending,
            // Keep at most ~100 ms queued ahead of the device.
            high_water: sample_rate as usize / 10,
        }))
    }
}

struct CpalInput {
    _stream: cpal::Stream,
    rx: cb::Receiver<Result<Vec<i16>, String>>,
    pending: VecDeque<i16>,
    read_timeout: Duration,
}

impl InputDevice for CpalInput {
    fn read(&mut self, samples: usize) -> Result<Vec<i16>, AudioError> {
        while self.pending.len() < samples {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(Ok(chunk)) => self.pending.extend(chunk),
                Ok(Err(msg)) => return Err(AudioError::Stream(msg)),
                Err(cb::RecvTimeoutError::Timeout) => return Err(AudioError::Timeout),
                Err(cb::RecvTimeoutError::Disconnected) => return Err(AudioError::Closed),
            }
        }
        Ok(self.pending.drain(..samples).collect())
    }
}

struct CpalOutput {
    _stream: cpal::Stream,
    pending: Arc<Mutex<VecDeque<i16>>>,
    high_water: usize,
}

impl OutputDevice for CpalOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.pending.lock().extend(pcm_bytes_to_i16(pcm));
        while self.pending.lock().len() > self.high_water {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}
