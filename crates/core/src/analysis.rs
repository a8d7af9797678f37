//! Frame-based audio feature extraction.
//!
//! This is the standard-mode analyzer: deterministic DSP features (rhythm,
//! key, energy, spectral shape) plus hand-tuned heuristic estimates for the
//! mood scalars. ML-backed scorers stay behind the vibe-model interface and
//! are not part of this module.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::errors::JobError;

const FRAME_SIZE: usize = 2048;
const HOP_SIZE: usize = 1024;
const MIN_DURATION_SECS: f32 = 5.0;
const SILENCE_RMS: f32 = 0.001;
const SILENCE_RATIO: f32 = 0.8;

/// Mode string persisted with every analyzed row.
pub const ANALYSIS_MODE_STANDARD: &str = "standard";
/// Version stamp for rows produced by this analyzer.
pub const ANALYSIS_VERSION: &str = "audioscope-dsp-v1";

/// All features extracted for a single track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFeatures {
    pub bpm: f32,
    pub beats_count: i32,
    pub key_name: String,
    pub key_scale: String,
    pub key_strength: f32,
    pub energy: f32,
    pub loudness: f32,
    pub dynamic_range: f32,
    pub danceability: f32,
    pub valence: f32,
    pub arousal: f32,
    pub instrumentalness: f32,
    pub acousticness: f32,
    pub speechiness: f32,
    pub mood_tags: Vec<String>,
    pub analysis_mode: String,
}

/// Per-frame aggregates feeding the heuristics.
#[derive(Debug, Clone, Copy)]
struct SpectralSummary {
    avg_rms: f32,
    avg_centroid: f32,
    avg_flatness_db: f32,
    avg_zcr: f32,
    frame_loudness_spread: f32,
}

/// Analyzer with a reusable FFT plan. One instance per pool worker.
pub struct Analyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let fft = FftPlanner::new().plan_fft_forward(FRAME_SIZE);
        let window = (0..FRAME_SIZE)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (FRAME_SIZE - 1) as f32).cos())
            .collect();
        Self { fft, window }
    }

    /// Reject audio that would crash or poison downstream extraction.
    pub fn validate(&self, samples: &[f32], sample_rate: u32) -> Result<(), JobError> {
        if samples.is_empty() {
            return Err(JobError::recoverable("Audio is empty"));
        }

        let duration = samples.len() as f32 / sample_rate as f32;
        if duration < MIN_DURATION_SECS {
            return Err(JobError::recoverable(format!(
                "Audio too short: {:.1}s (minimum {}s)",
                duration, MIN_DURATION_SECS as u32
            )));
        }

        if samples.iter().any(|s| !s.is_finite()) {
            return Err(JobError::recoverable(
                "Audio contains NaN or Inf values (corrupted)",
            ));
        }

        let mut frames = 0usize;
        let mut silent = 0usize;
        let mut i = 0;
        while i + FRAME_SIZE <= samples.len() {
            let rms = frame_rms(&samples[i..i + FRAME_SIZE]);
            if rms < SILENCE_RMS {
                silent += 1;
            }
            frames += 1;
            i += HOP_SIZE;
        }

        if frames > 0 {
            let ratio = silent as f32 / frames as f32;
            if ratio > SILENCE_RATIO {
                return Err(JobError::recoverable(format!(
                    "Audio is {:.0}% silence (likely corrupted or blank)",
                    ratio * 100.0
                )));
            }
        }

        Ok(())
    }

    /// Extract the full feature set from mono audio.
    pub fn analyze(&self, samples: &[f32], sample_rate: u32) -> Result<TrackFeatures, JobError> {
        self.validate(samples, sample_rate)?;

        let (summary, onset_envelope, chroma) = self.spectral_pass(samples);

        let (bpm, beats_count, tempo_confidence) =
            estimate_tempo(&onset_envelope, sample_rate, HOP_SIZE);
        let (key_name, key_scale, key_strength) = estimate_key(&chroma);

        let energy = round3((summary.avg_rms * 3.0).min(1.0));
        let loudness = round2(10.0 * (mean_square(samples) + 1e-10).log10());
        let dynamic_range = round2(summary.frame_loudness_spread);
        let danceability = round3((tempo_confidence * 0.6 + energy * 0.4).clamp(0.0, 1.0));

        let mut features = TrackFeatures {
            bpm,
            beats_count,
            key_name,
            key_scale,
            key_strength,
            energy,
            loudness,
            dynamic_range,
            danceability,
            valence: 0.5,
            arousal: 0.5,
            instrumentalness: 0.5,
            acousticness: 0.5,
            speechiness: 0.1,
            mood_tags: Vec::new(),
            analysis_mode: ANALYSIS_MODE_STANDARD.to_string(),
        };

        apply_standard_estimates(&mut features, &summary);
        features.mood_tags = generate_mood_tags(&features);

        Ok(features)
    }

    /// One pass over the frames: windowed FFT, onset envelope, chroma.
    fn spectral_pass(&self, samples: &[f32]) -> (SpectralSummary, Vec<f32>, [f32; 12]) {
        let mut rms_sum = 0.0f64;
        let mut centroid_sum = 0.0f64;
        let mut flatness_sum = 0.0f64;
        let mut zcr_sum = 0.0f64;
        let mut frame_db = Vec::new();

        let mut onset_envelope = Vec::new();
        let mut prev_mags: Vec<f32> = Vec::new();
        let mut chroma = [0.0f32; 12];

        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); FRAME_SIZE];
        let half = FRAME_SIZE / 2;
        let mut frames = 0usize;

        let mut i = 0;
        while i + FRAME_SIZE <= samples.len() {
            let frame = &samples[i..i + FRAME_SIZE];

            for (j, sample) in frame.iter().enumerate() {
                buffer[j] = Complex::new(sample * self.window[j], 0.0);
            }
            self.fft.process(&mut buffer);

            let mags: Vec<f32> = buffer[..half].iter().map(|c| c.norm()).collect();

            let rms = frame_rms(frame);
            rms_sum += rms as f64;
            frame_db.push(20.0 * (rms + 1e-10).log10());
            zcr_sum += zero_crossing_rate(frame) as f64;
            centroid_sum += spectral_centroid(&mags) as f64;
            flatness_sum += spectral_flatness_db(&mags) as f64;

            // Positive spectral flux drives onset detection.
            let flux: f32 = if prev_mags.is_empty() {
                0.0
            } else {
                mags.iter()
                    .zip(prev_mags.iter())
                    .map(|(m, p)| (m - p).max(0.0))
                    .sum()
            };
            onset_envelope.push(flux);
            prev_mags = mags.clone();

            accumulate_chroma(&mut chroma, &mags);

            frames += 1;
            i += HOP_SIZE;
        }

        let n = frames.max(1) as f64;
        let mean_db = frame_db.iter().sum::<f32>() / frames.max(1) as f32;
        let spread = if frames > 0 {
            frame_db
                .iter()
                .map(|db| (db - mean_db).abs())
                .sum::<f32>()
                / frames as f32
        } else {
            8.0
        };

        let summary = SpectralSummary {
            avg_rms: (rms_sum / n) as f32,
            avg_centroid: (centroid_sum / n) as f32,
            avg_flatness_db: (flatness_sum / n) as f32,
            avg_zcr: (zcr_sum / n) as f32,
            frame_loudness_spread: spread,
        };

        (summary, onset_envelope, chroma)
    }
}

fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

fn mean_square(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / frame.len() as f32
}

/// Spectral centroid as a fraction of Nyquist (0..1).
fn spectral_centroid(mags: &[f32]) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 1e-10 {
        return 0.0;
    }
    let weighted: f32 = mags
        .iter()
        .enumerate()
        .map(|(bin, m)| bin as f32 * m)
        .sum();
    weighted / total / mags.len() as f32
}

/// Spectral flatness (geometric / arithmetic mean of power) in dB.
fn spectral_flatness_db(mags: &[f32]) -> f32 {
    if mags.is_empty() {
        return -60.0;
    }
    let mut log_sum = 0.0f64;
    let mut lin_sum = 0.0f64;
    for m in mags {
        let power = (m * m) as f64 + 1e-12;
        log_sum += power.ln();
        lin_sum += power;
    }
    let n = mags.len() as f64;
    let geometric = (log_sum / n).exp();
    let arithmetic = lin_sum / n;
    (10.0 * (geometric / arithmetic).log10()) as f32
}

/// Map FFT bins onto pitch classes (A440 tuning) over the musical range.
fn accumulate_chroma(chroma: &mut [f32; 12], mags: &[f32]) {
    // Bin width for 2048-point FFT at the analysis rate.
    let bin_hz = crate::audio::ANALYSIS_SAMPLE_RATE as f32 / FRAME_SIZE as f32;
    for (bin, m) in mags.iter().enumerate().skip(1) {
        let freq = bin as f32 * bin_hz;
        if !(55.0..=2000.0).contains(&freq) {
            continue;
        }
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        let pitch_class = ((midi.round() as i32 % 12) + 12) % 12;
        chroma[pitch_class as usize] += m;
    }
}

/// Krumhansl-Schmuckler key profiles.
const MAJOR_PROFILE: [f32; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f32; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];
const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len() as f32;
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;
    let mut num = 0.0;
    let mut den_a = 0.0;
    let mut den_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        num += da * db;
        den_a += da * da;
        den_b += db * db;
    }
    if den_a <= 1e-10 || den_b <= 1e-10 {
        return 0.0;
    }
    num / (den_a.sqrt() * den_b.sqrt())
}

/// Correlate the averaged chroma against all 24 rotated key profiles.
fn estimate_key(chroma: &[f32; 12]) -> (String, String, f32) {
    if chroma.iter().all(|c| *c <= 1e-10) {
        return ("C".to_string(), "major".to_string(), 0.0);
    }

    let mut best = ("C", "major", -2.0f32);
    for tonic in 0..12 {
        let rotated: Vec<f32> = (0..12).map(|i| chroma[(i + tonic) % 12]).collect();
        let major = correlation(&rotated, &MAJOR_PROFILE);
        let minor = correlation(&rotated, &MINOR_PROFILE);
        if major > best.2 {
            best = (PITCH_NAMES[tonic], "major", major);
        }
        if minor > best.2 {
            best = (PITCH_NAMES[tonic], "minor", minor);
        }
    }

    (
        best.0.to_string(),
        best.1.to_string(),
        round3(best.2.clamp(0.0, 1.0)),
    )
}

/// Tempo from the autocorrelation of the onset envelope.
///
/// Returns (bpm, beats count, confidence). Falls back to 120 BPM when the
/// envelope carries no usable periodicity.
fn estimate_tempo(envelope: &[f32], sample_rate: u32, hop: usize) -> (f32, i32, f32) {
    let frames_per_sec = sample_rate as f32 / hop as f32;
    let min_lag = (frames_per_sec * 60.0 / 180.0).floor() as usize; // 180 BPM
    let max_lag = (frames_per_sec * 60.0 / 60.0).ceil() as usize; // 60 BPM

    if envelope.len() < max_lag * 2 || min_lag == 0 {
        return (120.0, 0, 0.3);
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let centered: Vec<f32> = envelope.iter().map(|v| v - mean).collect();
    let energy: f32 = centered.iter().map(|v| v * v).sum();
    if energy <= 1e-10 {
        return (120.0, 0, 0.3);
    }

    let mut best_lag = 0usize;
    let mut best_score = 0.0f32;
    for lag in min_lag..=max_lag.min(centered.len() - 1) {
        let score: f32 = centered[lag..]
            .iter()
            .zip(centered.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>()
            / energy;
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }

    if best_lag == 0 || best_score <= 0.0 {
        return (120.0, 0, 0.3);
    }

    let bpm = (frames_per_sec * 60.0 / best_lag as f32).clamp(60.0, 180.0);

    // Beats are onsets clearly above the envelope noise floor.
    let spread = (centered.iter().map(|v| v * v).sum::<f32>() / centered.len() as f32).sqrt();
    let threshold = mean + spread;
    let beats = envelope.iter().filter(|v| **v > threshold).count() as i32;

    ((bpm * 10.0).round() / 10.0, beats, best_score.clamp(0.0, 1.0))
}

/// Heuristic mood estimates.
///
/// Coefficients are hand-tuned against the same intuition as the upstream
/// standard mode: key correlates with valence, tempo and energy with
/// arousal, spectral flatness with instrumentalness, dynamic range with
/// acousticness.
fn apply_standard_estimates(features: &mut TrackFeatures, summary: &SpectralSummary) {
    let energy = features.energy;
    let dynamic_range = features.dynamic_range.max(0.0);
    let bpm = features.bpm;
    let centroid = summary.avg_centroid;
    let flatness = summary.avg_flatness_db;
    let zcr = summary.avg_zcr;

    // Valence: key is the strongest indicator, then tempo and brightness.
    let key_valence = if features.key_scale == "major" { 0.65 } else { 0.35 };
    let bpm_valence = if bpm >= 120.0 {
        (0.5 + (bpm - 120.0) / 200.0).min(0.8)
    } else if bpm <= 80.0 {
        (0.5 - (80.0 - bpm) / 100.0).max(0.2)
    } else {
        0.5
    };
    let brightness_valence = (centroid * 1.5).min(1.0);
    features.valence = round3(
        key_valence * 0.4 + bpm_valence * 0.25 + brightness_valence * 0.2 + energy * 0.15,
    );

    // Arousal: tempo and energy dominate; compression adds intensity.
    let bpm_arousal = ((bpm - 60.0) / 140.0).clamp(0.1, 0.9);
    let compression_arousal = (1.0 - dynamic_range / 20.0).clamp(0.0, 1.0);
    let brightness_arousal = (centroid * 1.2).min(1.0);
    features.arousal = round3(
        bpm_arousal * 0.35
            + energy * 0.35
            + brightness_arousal * 0.15
            + compression_arousal * 0.15,
    );

    // Instrumentalness: flat spectra read as noise/instrumental; sustained
    // low-ZCR content likewise.
    let flatness_normalized = ((flatness + 40.0) / 40.0).clamp(0.0, 1.0);
    let zcr_instrumental = if zcr < 0.05 {
        0.7
    } else if zcr > 0.15 {
        0.4
    } else {
        0.5
    };
    features.instrumentalness = round3(flatness_normalized * 0.6 + zcr_instrumental * 0.4);

    // Acousticness: natural dynamics vs. compressed/electronic.
    features.acousticness = round3((dynamic_range / 12.0).min(1.0));

    // Speechiness: speech sits in a characteristic ZCR/centroid band.
    features.speechiness = if zcr > 0.08 && zcr < 0.2 && centroid > 0.1 && centroid < 0.4 {
        round3((zcr * 3.0).min(0.5))
    } else {
        0.1
    };
}

/// Threshold-driven mood tags, deduplicated and capped at 12.
fn generate_mood_tags(features: &TrackFeatures) -> Vec<String> {
    let mut tags: Vec<&str> = Vec::new();
    let mut push = |tags: &mut Vec<&str>, tag: &'static str| {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    let bpm = features.bpm;
    let valence = features.valence;
    let arousal = features.arousal;
    let danceability = features.danceability;

    if arousal >= 0.7 {
        push(&mut tags, "energetic");
        push(&mut tags, "upbeat");
    } else if arousal <= 0.3 {
        push(&mut tags, "calm");
        push(&mut tags, "peaceful");
    }

    if valence >= 0.7 {
        push(&mut tags, "happy");
        push(&mut tags, "uplifting");
    } else if valence <= 0.3 {
        push(&mut tags, "sad");
        push(&mut tags, "melancholic");
    }

    if danceability >= 0.7 {
        push(&mut tags, "dance");
        push(&mut tags, "groovy");
    }

    if bpm >= 140.0 {
        push(&mut tags, "fast");
    } else if bpm <= 80.0 {
        push(&mut tags, "slow");
    }

    if features.key_scale == "minor" && !tags.contains(&"happy") {
        push(&mut tags, "moody");
    }

    if arousal >= 0.7 && bpm >= 120.0 {
        push(&mut tags, "workout");
    }
    if arousal <= 0.4 && valence <= 0.4 {
        push(&mut tags, "atmospheric");
    }
    if arousal <= 0.3 && bpm <= 90.0 {
        push(&mut tags, "chill");
    }

    tags.truncate(12);
    tags.into_iter().map(String::from).collect()
}

fn round2(x: f32) -> f32 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f32) -> f32 {
    (x * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ANALYSIS_SAMPLE_RATE;

    fn sine(freq: f32, secs: f32, rate: u32) -> Vec<f32> {
        (0..(secs * rate as f32) as usize)
            .map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_validate_rejects_short_audio() {
        let analyzer = Analyzer::new();
        let samples = sine(440.0, 2.0, ANALYSIS_SAMPLE_RATE);
        let err = analyzer
            .validate(&samples, ANALYSIS_SAMPLE_RATE)
            .unwrap_err();
        assert_eq!(err.to_string(), "Audio too short: 2.0s (minimum 5s)");
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let analyzer = Analyzer::new();
        let mut samples = sine(440.0, 6.0, ANALYSIS_SAMPLE_RATE);
        samples[1000] = f32::NAN;
        let err = analyzer
            .validate(&samples, ANALYSIS_SAMPLE_RATE)
            .unwrap_err();
        assert!(err.to_string().contains("NaN or Inf"));
    }

    #[test]
    fn test_validate_rejects_silence() {
        let analyzer = Analyzer::new();
        let samples = vec![0.0f32; ANALYSIS_SAMPLE_RATE as usize * 10];
        let err = analyzer
            .validate(&samples, ANALYSIS_SAMPLE_RATE)
            .unwrap_err();
        assert!(err.to_string().contains("silence"));
    }

    #[test]
    fn test_validate_accepts_tone() {
        let analyzer = Analyzer::new();
        let samples = sine(440.0, 6.0, ANALYSIS_SAMPLE_RATE);
        assert!(analyzer.validate(&samples, ANALYSIS_SAMPLE_RATE).is_ok());
    }

    #[test]
    fn test_analyze_produces_bounded_features() {
        let analyzer = Analyzer::new();
        // Amplitude-modulated tone at 2 Hz gives a 120 BPM pulse.
        let rate = ANALYSIS_SAMPLE_RATE;
        let samples: Vec<f32> = (0..rate as usize * 12)
            .map(|i| {
                let t = i as f32 / rate as f32;
                let pulse = (0.55 + 0.45 * (2.0 * PI * 2.0 * t).sin()).max(0.0);
                (2.0 * PI * 220.0 * t).sin() * 0.4 * pulse
            })
            .collect();

        let features = analyzer.analyze(&samples, rate).unwrap();
        assert!((60.0..=180.0).contains(&features.bpm));
        assert!((0.0..=1.0).contains(&features.energy));
        assert!((0.0..=1.0).contains(&features.valence));
        assert!((0.0..=1.0).contains(&features.arousal));
        assert!((0.0..=1.0).contains(&features.danceability));
        assert!((0.0..=1.0).contains(&features.instrumentalness));
        assert!(PITCH_NAMES.contains(&features.key_name.as_str()));
        assert!(features.key_scale == "major" || features.key_scale == "minor");
        assert_eq!(features.analysis_mode, ANALYSIS_MODE_STANDARD);
        assert!(features.mood_tags.len() <= 12);
    }

    #[test]
    fn test_key_estimate_finds_tonic_bias() {
        // Chroma heavily weighted on A should pick A as tonic.
        let mut chroma = [0.1f32; 12];
        chroma[9] = 10.0; // A
        chroma[1] = 5.0; // C# (major third of A)
        chroma[4] = 4.0; // E (fifth of A)
        let (key, _scale, strength) = estimate_key(&chroma);
        assert_eq!(key, "A");
        assert!(strength > 0.0);
    }

    #[test]
    fn test_mood_tags_deduplicated_and_capped() {
        let features = TrackFeatures {
            bpm: 150.0,
            beats_count: 300,
            key_name: "A".into(),
            key_scale: "minor".into(),
            key_strength: 0.8,
            energy: 0.9,
            loudness: -8.0,
            dynamic_range: 4.0,
            danceability: 0.9,
            valence: 0.8,
            arousal: 0.9,
            instrumentalness: 0.5,
            acousticness: 0.2,
            speechiness: 0.1,
            mood_tags: vec![],
            analysis_mode: ANALYSIS_MODE_STANDARD.into(),
        };
        let tags = generate_mood_tags(&features);
        assert!(tags.contains(&"energetic".to_string()));
        assert!(tags.contains(&"workout".to_string()));
        assert!(tags.len() <= 12);
        let mut deduped = tags.clone();
        deduped.dedup();
        assert_eq!(tags, deduped);
    }

    #[test]
    fn test_minor_key_sets_moody_without_happy() {
        let features = TrackFeatures {
            bpm: 90.0,
            beats_count: 100,
            key_name: "D".into(),
            key_scale: "minor".into(),
            key_strength: 0.6,
            energy: 0.4,
            loudness: -14.0,
            dynamic_range: 10.0,
            danceability: 0.4,
            valence: 0.45,
            arousal: 0.5,
            instrumentalness: 0.5,
            acousticness: 0.7,
            speechiness: 0.1,
            mood_tags: vec![],
            analysis_mode: ANALYSIS_MODE_STANDARD.into(),
        };
        let tags = generate_mood_tags(&features);
        assert!(tags.contains(&"moody".to_string()));
        assert!(!tags.contains(&"happy".to_string()));
    }
}
