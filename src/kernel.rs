//! Wake word kernel adapters: mel extraction, embedding, per-model classifier.
//! Each runs on its own pipeline thread, so implementations only need `Send`.
//! The energy-based kernel below is a placeholder that lets the device run
//! without trained models; replace it with a real keyword-spotting model.

use std::collections::HashMap;

use crate::audio::{EMBEDDING_DIM, MEL_SAMPLES, NUM_MELS};
use crate::registry::ModelParams;

/// Samples between mel frames (10 ms at 16 kHz).
const MEL_HOP: usize = 160;

/// Raw audio → mel frames (`k * NUM_MELS` floats).
pub trait MelExtractor: Send {
    fn extract(&mut self, samples: &[f32]) -> Vec<f32>;
}

/// Mel context window (`EMB_FEATURES * NUM_MELS` floats) → one embedding (`EMBEDDING_DIM`).
pub trait EmbeddingModel: Send {
    fn embed(&mut self, mels: &[f32]) -> Vec<f32>;
}

/// Newest embeddings (`n * EMBEDDING_DIM` floats) → wake word probability in [0.0, 1.0].
pub trait WakeWordClassifier: Send {
    fn predict(&mut self, embeddings: &[f32]) -> f32;
}

/// Kernel instances handed to the pipeline threads.
pub struct Kernel {
    pub mels: Box<dyn MelExtractor>,
    pub embeddings: Box<dyn EmbeddingModel>,
    /// Model name → classifier.
    pub classifiers: HashMap<String, Box<dyn WakeWordClassifier>>,
}

impl Kernel {
    /// Energy placeholder kernel with one classifier per model.
    pub fn placeholder(models: &[ModelParams]) -> Self {
        Self {
            mels: Box::new(EnergyMels),
            embeddings: Box::new(EnergyEmbedding),
            classifiers: models
                .iter()
                .map(|m| {
                    (
                        m.name.clone(),
                        Box::new(EnergyPatternClassifier::new()) as Box<dyn WakeWordClassifier>,
                    )
                })
                .collect(),
        }
    }
}

/// RMS energy over a frame of normalized samples.
#[inline]
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = f64::from(s);
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// One "mel" frame per hop, every bin holding the hop's log energy.
pub struct EnergyMels;

impl MelExtractor for EnergyMels {
    fn extract(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(MEL_SAMPLES / MEL_HOP * NUM_MELS);
        for hop in samples.chunks(MEL_HOP) {
            let log_energy = (compute_rms(hop) + 1e-6).log10();
            out.extend(std::iter::repeat(log_energy).take(NUM_MELS));
        }
        out
    }
}

/// Embedding slot 0: mean log energy of the newest 8 frames; slot 1: of the whole window.
pub struct EnergyEmbedding;

impl EmbeddingModel for EnergyEmbedding {
    fn embed(&mut self, mels: &[f32]) -> Vec<f32> {
        let frames: Vec<f32> = mels.chunks(NUM_MELS).map(|f| f[0]).collect();
        let mean = |xs: &[f32]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f32>() / xs.len() as f32
            }
        };
        let recent = &frames[frames.len().saturating_sub(8)..];
        let mut embedding = vec![0.0; EMBEDDING_DIM];
        embedding[0] = mean(recent);
        embedding[1] = mean(&frames);
        embedding
    }
}

/// Energy-spike pattern matcher: a sudden rise of recent energy over the
/// background may indicate a wake word.
pub struct EnergyPatternClassifier {
    spike_ratio_threshold: f32,
}

impl EnergyPatternClassifier {
    pub fn new() -> Self {
        Self {
            spike_ratio_threshold: 3.0,
        }
    }
}

impl Default for EnergyPatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeWordClassifier for EnergyPatternClassifier {
    fn predict(&mut self, embeddings: &[f32]) -> f32 {
        let Some(newest) = embeddings.rchunks(EMBEDDING_DIM).next() else {
            return 0.0;
        };
        if newest.len() < 2 {
            return 0.0;
        }
        // Log-energy difference back to a linear RMS ratio.
        let ratio = 10f32.powf(newest[0] - newest[1]);
        let raw = (ratio - self.spike_ratio_threshold) / self.spike_ratio_threshold;
        raw.clamp(0.0, 1.0)
    }
}
