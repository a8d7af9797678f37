//! Vibe model handle.
//!
//! The embedding model is an opaque scorer behind a uniform interface: it
//! turns audio or text into a 512-dimensional ℓ²-normalized vector. One
//! handle is shared per process; loading is lazy and idempotent, encoding is
//! serialized under a mutex (the underlying kernels are not reentrant), and
//! unloading drops the model and asks the allocator to return freed pages to
//! the OS.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::info;

/// Fixed embedding dimensionality.
pub const EMBEDDING_DIM: usize = 512;
/// Version stamp persisted with every embedding row and response.
pub const MODEL_VERSION: &str = "vibe-spectral-v1";
/// Model-native sample rate for audio embeddings.
pub const VIBE_SAMPLE_RATE: u32 = 48_000;

/// Uniform scorer interface. Implementations must return ℓ²-normalized
/// vectors of exactly [`EMBEDDING_DIM`] elements.
pub trait VibeModel: Send {
    fn encode_audio(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>>;
    fn encode_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Factory that builds a fresh model instance on (re)load.
pub type ModelLoader = Box<dyn Fn() -> Result<Box<dyn VibeModel>> + Send + Sync>;

/// Lazily-loaded, thread-safe model handle with idle-unload support.
pub struct ModelHandle {
    model: Mutex<Option<Box<dyn VibeModel>>>,
    loader: ModelLoader,
    last_work: Mutex<Instant>,
}

impl ModelHandle {
    pub fn new(loader: ModelLoader) -> Arc<Self> {
        Arc::new(Self {
            model: Mutex::new(None),
            loader,
            last_work: Mutex::new(Instant::now()),
        })
    }

    /// Handle backed by the standard spectral scorer.
    pub fn spectral() -> Arc<Self> {
        Self::new(Box::new(|| {
            Ok(Box::new(SpectralVibeModel::new()) as Box<dyn VibeModel>)
        }))
    }

    /// Load the model if it is not resident. Idempotent and thread-safe.
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut guard = self.model.lock().expect("model mutex poisoned");
        if guard.is_none() {
            info!("Loading vibe model (work arrived)");
            *guard = Some((self.loader)()?);
            self.stamp_work();
        }
        Ok(())
    }

    /// Drop the model and release heap pages back to the OS.
    pub fn unload(&self) {
        let mut guard = self.model.lock().expect("model mutex poisoned");
        if guard.take().is_some() {
            info!("Unloading vibe model to free memory");
            drop(guard);
            release_heap();
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().expect("model mutex poisoned").is_some()
    }

    /// Time since the last successful encode (or load).
    pub fn idle_for(&self) -> Duration {
        self.last_work.lock().expect("clock mutex poisoned").elapsed()
    }

    fn stamp_work(&self) {
        *self.last_work.lock().expect("clock mutex poisoned") = Instant::now();
    }

    pub fn encode_audio(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        self.stamp_work();
        let guard = self.model.lock().expect("model mutex poisoned");
        let model = guard.as_ref().context("vibe model unloaded mid-encode")?;
        let embedding = model.encode_audio(samples, sample_rate)?;
        debug_assert_eq!(embedding.len(), EMBEDDING_DIM);
        Ok(embedding)
    }

    pub fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        self.stamp_work();
        let guard = self.model.lock().expect("model mutex poisoned");
        let model = guard.as_ref().context("vibe model unloaded mid-encode")?;
        let embedding = model.encode_text(text)?;
        debug_assert_eq!(embedding.len(), EMBEDDING_DIM);
        Ok(embedding)
    }
}

/// Best-effort OS-level heap trim. No-op off Linux.
pub fn release_heap() {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::malloc_trim(0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Standard-mode spectral scorer
// ─────────────────────────────────────────────────────────────────────────────

const FRAME_SIZE: usize = 2048;
const HOP_SIZE: usize = 1024;
const BANDS: usize = 128;
const CHROMA_BINS: usize = 12;
const ENVELOPE_LAGS: usize = EMBEDDING_DIM - 3 * BANDS - CHROMA_BINS;

/// Deterministic spectral embedding model.
///
/// Layout: 128 log band-energy means, 128 band-energy spreads, 128 mean
/// positive band fluxes, 12 chroma bins, and 116 loudness-envelope
/// autocorrelation lags, ℓ²-normalized.
pub struct SpectralVibeModel {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl SpectralVibeModel {
    pub fn new() -> Self {
        let fft = FftPlanner::new().plan_fft_forward(FRAME_SIZE);
        let window = (0..FRAME_SIZE)
            .map(|i| {
                0.5 - 0.5
                    * (2.0 * std::f32::consts::PI * i as f32 / (FRAME_SIZE - 1) as f32).cos()
            })
            .collect();
        Self { fft, window }
    }

    /// Log-spaced band edge (in bins) for band `b` of `BANDS`.
    fn band_edge(b: usize, half: usize) -> usize {
        let min_bin = 2.0f32;
        let max_bin = half as f32;
        let ratio = (max_bin / min_bin).powf(b as f32 / BANDS as f32);
        ((min_bin * ratio) as usize).min(half)
    }
}

impl Default for SpectralVibeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl VibeModel for SpectralVibeModel {
    fn encode_audio(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        if samples.len() < FRAME_SIZE {
            bail!(
                "Audio too short to embed: {} samples (< one frame)",
                samples.len()
            );
        }

        let half = FRAME_SIZE / 2;
        let mut band_sums = vec![0.0f64; BANDS];
        let mut band_sq_sums = vec![0.0f64; BANDS];
        let mut band_flux = vec![0.0f64; BANDS];
        let mut prev_bands: Option<Vec<f32>> = None;
        let mut chroma = vec![0.0f64; CHROMA_BINS];
        let mut envelope = Vec::new();

        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); FRAME_SIZE];
        let mut frames = 0usize;

        let mut i = 0;
        while i + FRAME_SIZE <= samples.len() {
            let frame = &samples[i..i + FRAME_SIZE];
            for (j, s) in frame.iter().enumerate() {
                buffer[j] = Complex::new(s * self.window[j], 0.0);
            }
            self.fft.process(&mut buffer);

            let mut bands = vec![0.0f32; BANDS];
            for b in 0..BANDS {
                let lo = Self::band_edge(b, half);
                let hi = Self::band_edge(b + 1, half).max(lo + 1).min(half);
                let energy: f32 = buffer[lo..hi].iter().map(|c| c.norm_sqr()).sum();
                bands[b] = (energy / (hi - lo) as f32 + 1e-10).ln();
            }

            for b in 0..BANDS {
                band_sums[b] += bands[b] as f64;
                band_sq_sums[b] += (bands[b] * bands[b]) as f64;
                if let Some(prev) = &prev_bands {
                    band_flux[b] += (bands[b] - prev[b]).max(0.0) as f64;
                }
            }
            prev_bands = Some(bands);

            let bin_hz = sample_rate as f32 / FRAME_SIZE as f32;
            for (bin, c) in buffer[..half].iter().enumerate().skip(1) {
                let freq = bin as f32 * bin_hz;
                if !(55.0..=2000.0).contains(&freq) {
                    continue;
                }
                let midi = 69.0 + 12.0 * (freq / 440.0).log2();
                let pc = ((midi.round() as i32 % 12) + 12) % 12;
                chroma[pc as usize] += c.norm() as f64;
            }

            let rms =
                (frame.iter().map(|s| s * s).sum::<f32>() / FRAME_SIZE as f32).sqrt();
            envelope.push(rms);

            frames += 1;
            i += HOP_SIZE;
        }

        let n = frames.max(1) as f64;
        let mut embedding = Vec::with_capacity(EMBEDDING_DIM);
        for b in 0..BANDS {
            embedding.push((band_sums[b] / n) as f32);
        }
        for b in 0..BANDS {
            let mean = band_sums[b] / n;
            let var = (band_sq_sums[b] / n - mean * mean).max(0.0);
            embedding.push(var.sqrt() as f32);
        }
        for b in 0..BANDS {
            embedding.push((band_flux[b] / n) as f32);
        }
        let chroma_total: f64 = chroma.iter().sum::<f64>().max(1e-10);
        for c in &chroma {
            embedding.push((c / chroma_total) as f32);
        }

        // Loudness-envelope autocorrelation at evenly spaced lags captures
        // rhythm structure.
        let env_mean = envelope.iter().sum::<f32>() / envelope.len().max(1) as f32;
        let centered: Vec<f32> = envelope.iter().map(|v| v - env_mean).collect();
        let env_energy: f32 = centered.iter().map(|v| v * v).sum::<f32>().max(1e-10);
        let max_lag = centered.len().saturating_sub(1).max(1);
        for k in 0..ENVELOPE_LAGS {
            let lag = 1 + k * max_lag / ENVELOPE_LAGS;
            let score: f32 = if lag < centered.len() {
                centered[lag..]
                    .iter()
                    .zip(centered.iter())
                    .map(|(a, b)| a * b)
                    .sum::<f32>()
                    / env_energy
            } else {
                0.0
            };
            embedding.push(score);
        }

        debug_assert_eq!(embedding.len(), EMBEDDING_DIM);
        l2_normalize(&mut embedding)?;
        Ok(embedding)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            bail!("Empty text provided for embedding");
        }

        let mut embedding = vec![0.0f32; EMBEDDING_DIM];
        for token in trimmed
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.as_bytes());
            // Four pseudo-random projections per token.
            for k in 0..4u64 {
                let mixed = hash
                    .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                    .wrapping_add(k.wrapping_mul(0x2545_F491_4F6C_DD1D));
                let idx = (mixed % EMBEDDING_DIM as u64) as usize;
                let sign = if mixed & (1 << 63) == 0 { 1.0 } else { -1.0 };
                embedding[idx] += sign;
            }
        }

        l2_normalize(&mut embedding)?;
        Ok(embedding)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

fn l2_normalize(vector: &mut [f32]) -> Result<()> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= 1e-10 || !norm.is_finite() {
        bail!("Degenerate embedding (zero norm)");
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, secs: f32) -> Vec<f32> {
        (0..(secs * VIBE_SAMPLE_RATE as f32) as usize)
            .map(|i| {
                (2.0 * std::f32::consts::PI * freq * i as f32 / VIBE_SAMPLE_RATE as f32).sin()
                    * 0.5
            })
            .collect()
    }

    #[test]
    fn test_audio_embedding_dimension_and_norm() {
        let model = SpectralVibeModel::new();
        let embedding = model.encode_audio(&tone(440.0, 3.0), VIBE_SAMPLE_RATE).unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_audio_embedding_deterministic() {
        let model = SpectralVibeModel::new();
        let samples = tone(330.0, 2.0);
        let a = model.encode_audio(&samples, VIBE_SAMPLE_RATE).unwrap();
        let b = model.encode_audio(&samples, VIBE_SAMPLE_RATE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_audio_produces_different_embeddings() {
        let model = SpectralVibeModel::new();
        let a = model.encode_audio(&tone(220.0, 2.0), VIBE_SAMPLE_RATE).unwrap();
        let b = model.encode_audio(&tone(880.0, 2.0), VIBE_SAMPLE_RATE).unwrap();
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!(dot < 0.999);
    }

    #[test]
    fn test_text_embedding_rejects_empty() {
        let model = SpectralVibeModel::new();
        assert!(model.encode_text("   ").is_err());
    }

    #[test]
    fn test_text_embedding_normalized_and_stable() {
        let model = SpectralVibeModel::new();
        let a = model.encode_text("upbeat electronic dance music").unwrap();
        let b = model.encode_text("upbeat electronic dance music").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let c = model.encode_text("slow melancholic piano").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_handle_lazy_load_and_unload() {
        let handle = ModelHandle::spectral();
        assert!(!handle.is_loaded());

        handle.ensure_loaded().unwrap();
        assert!(handle.is_loaded());

        // Idempotent.
        handle.ensure_loaded().unwrap();
        assert!(handle.is_loaded());

        handle.unload();
        assert!(!handle.is_loaded());

        // Encoding transparently reloads.
        let embedding = handle.encode_text("warm analog synth").unwrap();
        assert!(handle.is_loaded());
        assert_eq!(embedding.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_handle_stamps_work_time() {
        let handle = ModelHandle::spectral();
        handle.encode_text("ambient drone").unwrap();
        assert!(handle.idle_for() < Duration::from_secs(1));
    }
}
