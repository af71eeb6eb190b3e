//! Wake word pipeline: shared context (registry, gates, running flag) and the
//! three consumer stages between the gates and the kernel.
//! capture → [audio gate] → mels → [mel gate] → embeddings → [model gate] → classifier → detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::audio::{EMB_FEATURES, EMB_STEP, MEL_SAMPLES, WW_WINDOWS};
use crate::gate::StageGate;
use crate::kernel::{EmbeddingModel, MelExtractor, WakeWordClassifier};
use crate::registry::{ClientRegistry, Stage, WakeWordModelState};

/// A wake word fired for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub model: String,
    pub client: String,
    pub probability: f32,
}

/// Invoked on the classification thread for every detection.
pub type DetectionHandler = Arc<dyn Fn(&Detection) + Send + Sync>;

/// State shared by every pipeline component, passed explicitly at construction.
pub struct PipelineContext {
    pub registry: Arc<ClientRegistry>,
    pub audio_ready: StageGate,
    pub mels_ready: StageGate,
    /// Model name → embeddings gate.
    pub embeddings_ready: HashMap<String, StageGate>,
    running: AtomicBool,
}

impl PipelineContext {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        let embeddings_ready = registry
            .models()
            .iter()
            .map(|m| (m.name.clone(), StageGate::new("embeddings")))
            .collect();
        Self {
            registry,
            audio_ready: StageGate::new("audio"),
            mels_ready: StageGate::new("mels"),
            embeddings_ready,
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip the global running flag. Threads observe it at their next wakeup.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Release every gate enough to unblock all blocked consumers.
    /// Returns the number of permits released.
    pub fn unblock_all(&self) -> usize {
        self.audio_ready.unblock_all()
            + self.mels_ready.unblock_all()
            + self
                .embeddings_ready
                .values()
                .map(StageGate::unblock_all)
                .sum::<usize>()
    }

    /// Sleep up to `duration`, returning early once stopped.
    /// Returns whether the pipeline is still running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
        false
    }
}

/// Mel stage: audio gate → kernel mel extraction → client mel window.
pub fn run_mel_stage(ctx: Arc<PipelineContext>, mut extractor: Box<dyn MelExtractor>) {
    info!("mel stage started");
    loop {
        ctx.audio_ready.wait();
        if !ctx.is_running() {
            break;
        }
        for id in ctx.registry.client_ids() {
            while let Some(chunk) = take_audio_chunk(&ctx, &id) {
                let frames = extractor.extract(&chunk);
                {
                    let _stage = ctx.mels_ready.lock();
                    ctx.registry.append(&id, Stage::Mels, &frames);
                }
                ctx.mels_ready.signal();
            }
        }
    }
    info!("mel stage stopping");
}

fn take_audio_chunk(ctx: &PipelineContext, id: &str) -> Option<Vec<f32>> {
    let _stage = ctx.audio_ready.lock();
    ctx.registry.with_client(id, |client| {
        if client.audio.new_count() < MEL_SAMPLES {
            return None;
        }
        let chunk = client.audio.peek_unconsumed(MEL_SAMPLES);
        client.audio.consume(MEL_SAMPLES);
        Some(chunk)
    })
}

/// Embedding stage: mel gate → kernel embedding → every model window of the client.
pub fn run_embedding_stage(ctx: Arc<PipelineContext>, mut model: Box<dyn EmbeddingModel>) {
    info!("embedding stage started");
    loop {
        ctx.mels_ready.wait();
        if !ctx.is_running() {
            break;
        }
        for id in ctx.registry.client_ids() {
            while let Some(step) = take_mel_step(&ctx, &id) {
                let Some(window) = step else { continue };
                let embedding = model.embed(&window);
                for (name, gate) in &ctx.embeddings_ready {
                    let written = {
                        let _stage = gate.lock();
                        ctx.registry.append(&id, Stage::Embeddings(name), &embedding)
                    };
                    if written > 0 {
                        gate.signal();
                    }
                }
            }
        }
    }
    info!("embedding stage stopping");
}

/// Consume one step of unconsumed mel frames. `Some(None)` means the step was
/// consumed but the window does not yet hold a full context before it.
fn take_mel_step(ctx: &PipelineContext, id: &str) -> Option<Option<Vec<f32>>> {
    let _stage = ctx.mels_ready.lock();
    ctx.registry.with_client(id, |client| {
        let mels = &mut client.mels;
        if mels.new_count() < EMB_STEP {
            return None;
        }
        // Logical end (exclusive) of the step being consumed.
        let end = mels.capacity() - mels.new_count() + EMB_STEP;
        mels.consume(EMB_STEP);
        Some((end >= EMB_FEATURES).then(|| mels.range(end - EMB_FEATURES, EMB_FEATURES)))
    })
}

/// Classification stage for one model: embeddings gate → classifier → detection.
pub fn run_classifier_stage(
    ctx: Arc<PipelineContext>,
    model: String,
    mut classifier: Box<dyn WakeWordClassifier>,
    on_detection: DetectionHandler,
) {
    let Some(gate) = ctx.embeddings_ready.get(&model) else {
        tracing::error!(model = %model, "no embeddings gate for model");
        return;
    };
    info!(model = %model, "classifier stage started");
    loop {
        gate.wait();
        if !ctx.is_running() {
            break;
        }
        for id in ctx.registry.client_ids() {
            let input = {
                let _stage = gate.lock();
                ctx.registry.with_client(&id, |client| {
                    let state = client.models.get_mut(&model)?;
                    if state.embeddings.new_count() == 0 {
                        return None;
                    }
                    state.embeddings.consume(state.embeddings.new_count());
                    Some(state.embeddings.last(WW_WINDOWS))
                })
            };
            let Some(input) = input else { continue };

            let probability = classifier.predict(&input);
            let fired = {
                let _stage = gate.lock();
                ctx.registry.with_client(&id, |client| {
                    client
                        .models
                        .get_mut(&model)
                        .is_some_and(|state| state.record_probability(probability))
                })
            };
            if fired {
                info!(model = %model, client = %id, probability, "wake_word_detected");
                on_detection(&Detection {
                    model: model.clone(),
                    client: id.clone(),
                    probability,
                });
            } else {
                debug!(model = %model, client = %id, probability, "wake_word_probability");
            }
        }
    }
    info!(model = %model, "classifier stage stopping");
}

impl WakeWordModelState {
    /// Fold one classifier output into the activation counter. Returns true
    /// exactly when the model fires; it stays detected until the client resets.
    pub fn record_probability(&mut self, probability: f32) -> bool {
        if probability > self.threshold {
            self.activations += 1;
            if self.activations >= self.trigger_level && !self.is_detected {
                self.is_detected = true;
                self.activations = 0;
                return true;
            }
        } else {
            self.activations = self.activations.saturating_sub(1);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelParams, DEFAULT_CLIENT};

    fn context(trigger: u32) -> PipelineContext {
        PipelineContext::new(Arc::new(ClientRegistry::new(vec![ModelParams::new(
            "m", 0.5, trigger,
        )])))
    }

    #[test]
    fn trigger_level_needs_consecutive_activations() {
        let ctx = context(2);
        ctx.registry.with_client(DEFAULT_CLIENT, |c| {
            let state = c.models.get_mut("m").unwrap();
            assert!(!state.record_probability(0.9));
            assert!(!state.record_probability(0.1));
            assert_eq!(state.activations, 0);
            assert!(!state.record_probability(0.9));
            assert!(state.record_probability(0.9));
            assert!(state.is_detected);
            // Stays latched until reset.
            assert!(!state.record_probability(0.9));
            assert!(!state.record_probability(0.9));
        });
    }

    #[test]
    fn audio_chunks_are_taken_in_order() {
        let ctx = context(1);
        let first: Vec<f32> = (0..MEL_SAMPLES).map(|i| i as f32).collect();
        let second = vec![-1.0; MEL_SAMPLES];
        ctx.registry.append(DEFAULT_CLIENT, Stage::Audio, &first);
        ctx.registry.append(DEFAULT_CLIENT, Stage::Audio, &second);

        assert_eq!(take_audio_chunk(&ctx, DEFAULT_CLIENT), Some(first));
        assert_eq!(take_audio_chunk(&ctx, DEFAULT_CLIENT), Some(second));
        assert_eq!(take_audio_chunk(&ctx, DEFAULT_CLIENT), None);
    }

    #[test]
    fn mel_steps_wait_for_full_context() {
        let ctx = context(1);
        ctx.registry
            .append(DEFAULT_CLIENT, Stage::Mels, &vec![1.0; EMB_STEP * crate::audio::NUM_MELS]);
        // Fresh window: the step sits at the tail, preceded by zero frames.
        let step = take_mel_step(&ctx, DEFAULT_CLIENT).unwrap().unwrap();
        assert_eq!(step.len(), EMB_FEATURES * crate::audio::NUM_MELS);
        assert!(step[step.len() - 1] == 1.0);
        assert!(take_mel_step(&ctx, DEFAULT_CLIENT).is_none());
    }

    #[test]
    fn sleep_returns_early_when_stopped() {
        let ctx = context(1);
        ctx.stop();
        let start = Instant::now();
        assert!(!ctx.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
