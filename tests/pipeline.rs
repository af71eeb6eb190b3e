//! Capture, wake word pipeline and playback scenarios
//!
//! Runs the real loops against fake devices and a scripted kernel

use std::sync::Arc;
use std::time::Duration;

use voice_assist::audio::capture::CaptureLoop;
use voice_assist::audio::playback::PlaybackLoop;
use voice_assist::audio::{
    i16_to_pcm_bytes, Uplink, CHUNK_SIZE_WAKE, INPUT_SAMPLE_RATE, MAX_AUDIO_SAMPLES, OUTPUT_SAMPLE_RATE,
};
use voice_assist::detection_handler;
use voice_assist::kernel::{EnergyEmbedding, EnergyMels, WakeWordClassifier};
use voice_assist::mode::InteractionMode;
use voice_assist::pipeline::{run_classifier_stage, run_embedding_stage, run_mel_stage};
use voice_assist::registry::DEFAULT_CLIENT;
use voice_assist::session::SessionControl;
use voice_assist::supervisor::join_with_timeout;

mod common;
use common::{rig, rig_with, wait_until, CountingSession, FakeAudio, FakeBackend, MODEL};

/// Classifier returning a fixed probability.
struct Fixed(f32);

impl WakeWordClassifier for Fixed {
    fn predict(&mut self, _embeddings: &[f32]) -> f32 {
        self.0
    }
}

fn capture_for(rig: &common::Rig) -> CaptureLoop {
    CaptureLoop::new(
        Arc::new(FakeBackend(Arc::new(FakeAudio::default()))),
        Arc::clone(&rig.modes),
        Arc::clone(&rig.ctx),
        DEFAULT_CLIENT,
        INPUT_SAMPLE_RATE,
    )
}

#[test]
fn test_wake_word_audio_rotates_buffers_without_mode_change() {
    let rig = rig();
    let capture = capture_for(&rig);
    let frames = MAX_AUDIO_SAMPLES / CHUNK_SIZE_WAKE + 5;

    for i in 0..frames {
        let frame = vec![i as i16; CHUNK_SIZE_WAKE];
        capture.route(InteractionMode::WakeWord, &frame);
    }

    rig.registry.with_client(DEFAULT_CLIENT, |client| {
        assert_eq!(client.audio.new_count(), MAX_AUDIO_SAMPLES);
        let newest = client.audio.last(CHUNK_SIZE_WAKE);
        let expected = (frames - 1) as f32 / 32768.0;
        assert!(newest.iter().all(|&s| (s - expected).abs() < 1e-9));
    });
    assert_eq!(rig.ctx.audio_ready.pending(), frames);
    assert_eq!(rig.modes.current_mode(), InteractionMode::WakeWord);
    assert!(rig.modes.uplink().is_empty());
    assert!(rig.log.events().is_empty());
}

#[test]
fn test_listening_frames_go_to_session_queue_unmodified() {
    let rig = rig();
    let capture = capture_for(&rig);
    rig.modes.enter_listening();

    let frame: Vec<i16> = (0..1024).map(|i| (i * 7 - 3000) as i16).collect();
    capture.route(InteractionMode::Listening, &frame);

    assert_eq!(
        rig.modes.uplink().try_recv(),
        Some(Uplink::Audio(i16_to_pcm_bytes(&frame)))
    );
    assert_eq!(rig.ctx.audio_ready.pending(), 0);
}

#[test]
fn test_frame_size_follows_mode() {
    assert_eq!(CaptureLoop::frame_size(InteractionMode::Listening), 1024);
    assert_eq!(CaptureLoop::frame_size(InteractionMode::WakeWord), 1280);
    assert_eq!(CaptureLoop::frame_size(InteractionMode::Response), 1280);
}

#[test]
fn test_capture_open_failure_ends_loop_with_error() {
    let rig = rig();
    let capture = CaptureLoop::new(
        Arc::new(FakeBackend(Arc::new(FakeAudio {
            fail_input: true,
            ..FakeAudio::default()
        }))),
        Arc::clone(&rig.modes),
        Arc::clone(&rig.ctx),
        DEFAULT_CLIENT,
        INPUT_SAMPLE_RATE,
    );
    assert!(capture.run().is_err());
}

#[test]
fn test_detection_enters_listening_with_single_duck() {
    let rig = rig_with(0.5, 1);
    let session = Arc::new(CountingSession::default());
    let handler = detection_handler(
        Arc::clone(&rig.modes),
        Arc::clone(&session) as Arc<dyn SessionControl>,
    );

    let mut threads = Vec::new();
    {
        let ctx = Arc::clone(&rig.ctx);
        threads.push(std::thread::spawn(move || run_mel_stage(ctx, Box::new(EnergyMels))));
        let ctx = Arc::clone(&rig.ctx);
        threads.push(std::thread::spawn(move || run_embedding_stage(ctx, Box::new(EnergyEmbedding))));
        let ctx = Arc::clone(&rig.ctx);
        threads.push(std::thread::spawn(move || {
            run_classifier_stage(ctx, MODEL.to_string(), Box::new(Fixed(0.9)), handler)
        }));
    }

    let capture = capture_for(&rig);
    for _ in 0..4 {
        capture.route(InteractionMode::WakeWord, &[1000; CHUNK_SIZE_WAKE]);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        rig.modes.current_mode() == InteractionMode::Listening
    }));

    // Let the first batch drain, then keep feeding the pipeline: further
    // detections while listening must not transition again.
    std::thread::sleep(Duration::from_millis(100));
    for _ in 0..4 {
        capture.route(InteractionMode::WakeWord, &[1000; CHUNK_SIZE_WAKE]);
    }
    std::thread::sleep(Duration::from_millis(200));

    rig.ctx.stop();
    rig.ctx.unblock_all();
    for handle in threads {
        assert!(join_with_timeout(handle, Duration::from_secs(1)));
    }

    assert_eq!(session.starts(), 1);
    assert_eq!(rig.log.modes(), vec![InteractionMode::Listening]);
    assert_eq!(rig.log.ducks(), 1);
}

#[test]
fn test_silence_below_threshold_never_fires() {
    let rig = rig_with(0.5, 1);
    let session = Arc::new(CountingSession::default());
    let handler = detection_handler(
        Arc::clone(&rig.modes),
        Arc::clone(&session) as Arc<dyn SessionControl>,
    );
    let ctx = Arc::clone(&rig.ctx);
    let classifier = std::thread::spawn(move || {
        run_classifier_stage(ctx, MODEL.to_string(), Box::new(Fixed(0.1)), handler)
    });
    let ctx = Arc::clone(&rig.ctx);
    let embeddings = std::thread::spawn(move || run_embedding_stage(ctx, Box::new(EnergyEmbedding)));
    let ctx = Arc::clone(&rig.ctx);
    let mels = std::thread::spawn(move || run_mel_stage(ctx, Box::new(EnergyMels)));

    let capture = capture_for(&rig);
    for _ in 0..10 {
        capture.route(InteractionMode::WakeWord, &[0; CHUNK_SIZE_WAKE]);
    }
    std::thread::sleep(Duration::from_millis(300));
    rig.registry.with_client(DEFAULT_CLIENT, |client| {
        assert_eq!(client.audio.new_count(), 0);
        assert!(!client.models[MODEL].is_detected);
    });

    rig.ctx.stop();
    rig.ctx.unblock_all();
    for handle in [classifier, embeddings, mels] {
        assert!(join_with_timeout(handle, Duration::from_secs(1)));
    }
    assert_eq!(session.starts(), 0);
    assert_eq!(rig.modes.current_mode(), InteractionMode::WakeWord);
}

#[test]
fn test_playback_drives_response_and_back() {
    let rig = rig();
    let audio = Arc::new(FakeAudio::default());

    for _ in 0..3 {
        rig.modes.queue_response_audio(vec![0; 480]);
    }
    assert_eq!(rig.modes.current_mode(), InteractionMode::Listening);

    let playback = PlaybackLoop::new(
        Arc::new(FakeBackend(Arc::clone(&audio))),
        Arc::clone(&rig.modes),
        Arc::clone(&rig.ctx),
        OUTPUT_SAMPLE_RATE,
        Duration::from_millis(50),
        Duration::from_millis(10),
    );
    let handle = std::thread::spawn(move || playback.run());

    assert!(wait_until(Duration::from_secs(2), || audio.written.lock().len() == 3));
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(rig.modes.current_mode(), InteractionMode::Listening);
    assert_eq!(
        rig.log.modes(),
        vec![
            InteractionMode::Listening,
            InteractionMode::Response,
            InteractionMode::Listening
        ]
    );

    rig.ctx.stop();
    assert!(join_with_timeout(handle, Duration::from_secs(1)));
}

#[test]
fn test_shutdown_unblocks_stage_threads() {
    let rig = rig();
    let mut threads = Vec::new();
    for _ in 0..3 {
        let ctx = Arc::clone(&rig.ctx);
        threads.push(std::thread::spawn(move || run_mel_stage(ctx, Box::new(EnergyMels))));
    }
    let ctx = Arc::clone(&rig.ctx);
    threads.push(std::thread::spawn(move || run_embedding_stage(ctx, Box::new(EnergyEmbedding))));

    assert!(wait_until(Duration::from_secs(2), || {
        rig.ctx.audio_ready.waiters() == 3 && rig.ctx.mels_ready.waiters() == 1
    }));

    rig.ctx.stop();
    assert_eq!(rig.ctx.unblock_all(), 3 + 1 + 1);
    for handle in threads {
        assert!(join_with_timeout(handle, Duration::from_millis(500)));
    }
}
