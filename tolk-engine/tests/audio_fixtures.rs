//! WAV-fixture pipeline integrity test
//!
//! Writes a speech-shaped utterance to a WAV file on disk, reads it back,
//! and drives the conditioner, detector and segmenter with it the way the
//! engine's pipeline task does. Catches regressions in the capture chain
//! against a stable on-disk fixture rather than in-memory buffers.

use tolk_common::config::{AudioPreset, VadSensitivity, PIPELINE_SAMPLE_RATE};
use tolk_engine::audio::resampler::StreamResampler;
use tolk_engine::dsp::aec::AecParams;
use tolk_engine::dsp::chain::Conditioner;
use tolk_engine::segment::Segmenter;
use tolk_engine::vad::{VadConfig, VadEvent, VoiceDetector, VAD_FRAME_SAMPLES};

const FIXTURE_RATE: u32 = 48_000;

/// Lead-in silence, a 220 Hz tone burst, then enough trailing silence for
/// the detector to close the utterance.
fn fixture_samples(speech_secs: f32) -> Vec<i16> {
    let mut samples = Vec::new();
    let silence = |secs: f32| (secs * FIXTURE_RATE as f32) as usize;
    samples.extend(std::iter::repeat(0i16).take(silence(0.4)));
    for i in 0..(speech_secs * FIXTURE_RATE as f32) as usize {
        let t = i as f32 / FIXTURE_RATE as f32;
        let value = 0.5 * (2.0 * std::f32::consts::PI * 220.0 * t).sin();
        samples.push((value * i16::MAX as f32) as i16);
    }
    samples.extend(std::iter::repeat(0i16).take(silence(1.0)));
    samples
}

fn write_fixture(path: &std::path::Path, samples: &[i16]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: FIXTURE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

fn read_fixture(path: &std::path::Path) -> Vec<f32> {
    let mut reader = hound::WavReader::open(path).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, FIXTURE_RATE);
    reader
        .samples::<i16>()
        .map(|s| s.unwrap() as f32 / i16::MAX as f32)
        .collect()
}

#[test]
fn test_wav_fixture_survives_the_capture_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterance.wav");

    let written = fixture_samples(1.2);
    write_fixture(&path, &written);
    let audio = read_fixture(&path);
    assert_eq!(audio.len(), written.len());

    // The same leaves the engine's pipeline task composes
    let mut resampler = StreamResampler::new(FIXTURE_RATE, PIPELINE_SAMPLE_RATE).unwrap();
    let mut chain = Conditioner::new(
        PIPELINE_SAMPLE_RATE as f32,
        AecParams {
            filter_len: 128,
            max_delay: 600,
            ..AecParams::default()
        },
    );
    let preset = AudioPreset::LowLatency;
    let mut vad = VoiceDetector::new(VadConfig::from_preset(
        preset,
        VadSensitivity::Medium,
        PIPELINE_SAMPLE_RATE,
    ));
    let mut segmenter = Segmenter::new(preset);

    let mut starts = 0;
    let mut ends = 0;
    let mut segments = Vec::new();
    let mut pending: Vec<f32> = Vec::new();
    let zero_reference = [0.0f32; VAD_FRAME_SAMPLES];
    let mut clock_samples: u64 = 0;

    for chunk in audio.chunks(128) {
        pending.extend_from_slice(&resampler.push(chunk).unwrap());
        while pending.len() >= VAD_FRAME_SAMPLES {
            let mut block = [0.0f32; VAD_FRAME_SAMPLES];
            block.copy_from_slice(&pending[..VAD_FRAME_SAMPLES]);
            pending.drain(..VAD_FRAME_SAMPLES);
            chain.process_frame(&mut block, &zero_reference);

            clock_samples += VAD_FRAME_SAMPLES as u64;
            let ts_ns = clock_samples * 1_000_000_000 / PIPELINE_SAMPLE_RATE as u64;
            match vad.process_frame(&block, ts_ns) {
                Some(VadEvent::SpeechStart { .. }) => {
                    starts += 1;
                    segmenter.on_speech_start(ts_ns);
                    segmenter.push_samples(&block);
                }
                Some(VadEvent::SpeechEnd { .. }) => {
                    ends += 1;
                    segmenter.push_samples(&block);
                    if let Some(segment) = segmenter.on_speech_end(ts_ns) {
                        segments.push(segment);
                    }
                }
                None => segmenter.push_samples(&block),
            }
        }
    }

    assert_eq!(starts, 1, "fixture holds exactly one utterance");
    assert_eq!(ends, 1);
    assert_eq!(segments.len(), 1);

    let segment = &segments[0];
    assert_eq!(segment.id, 1);
    // The 1.2 s burst plus pre-roll and hangover tail lands well over the
    // preset minimum and under the fixture length
    assert!(
        segment.duration_ms() >= preset.min_speech_ms() as u64,
        "segment too short: {} ms",
        segment.duration_ms()
    );
    assert!(segment.duration_ms() < 2600);
    // Conditioned speech keeps real amplitude after PCM16 conversion
    let peak = segment.samples.iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!(peak > 500, "utterance audio lost in the chain: peak {peak}");
}
