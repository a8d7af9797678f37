//! Audio decoding via symphonia.
//!
//! Tracks are decoded to mono f32 and linearly resampled to the caller's
//! target rate. Embedding extraction reads only the middle window of longer
//! tracks; feature analysis reads the first `max_secs` seconds.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Fixed rate used by the feature analyzer.
pub const ANALYSIS_SAMPLE_RATE: u32 = 44_100;

/// Offset of the extracted middle window for a track of `duration` seconds.
pub fn middle_offset(duration: f64, window_secs: f64) -> f64 {
    if duration > window_secs {
        (duration - window_secs) / 2.0
    } else {
        0.0
    }
}

/// Probe a file's duration in seconds without decoding it fully.
pub fn probe_duration(path: &Path) -> Result<f64> {
    let file = File::open(path).with_context(|| format!("Audio file not found: {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("Unsupported audio format: {:?}", path))?;

    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No decodable audio track in {:?}", path))?;

    let params = &track.codec_params;
    match (params.n_frames, params.sample_rate) {
        (Some(frames), Some(rate)) if rate > 0 => Ok(frames as f64 / rate as f64),
        _ => bail!("Audio duration unavailable for {:?}", path),
    }
}

/// Decode a window of audio to mono at `target_rate`.
///
/// `offset_secs` seconds are skipped before collection starts and at most
/// `max_secs` seconds are decoded. Decode errors on individual packets are
/// skipped; running out of packets ends the window early.
pub fn load_audio_window(
    path: &Path,
    target_rate: u32,
    offset_secs: f64,
    max_secs: f64,
) -> Result<Vec<f32>> {
    let file = File::open(path).with_context(|| format!("Audio file not found: {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("Unsupported audio format: {:?}", path))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No decodable audio track in {:?}", path))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate for {:?}", path))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .with_context(|| format!("Failed to create decoder for {:?}", path))?;

    let skip_samples = (offset_secs * source_rate as f64) as usize;
    let max_samples = (max_secs * source_rate as f64) as usize;

    let mut mono: Vec<f32> = Vec::with_capacity(max_samples.min(source_rate as usize * 90));
    let mut skipped = 0usize;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        if mono.len() >= max_samples {
            break;
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).with_context(|| format!("Packet read failed for {:?}", path)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Skip over corrupt packets rather than failing the whole track.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(e).with_context(|| format!("Decode failed for {:?}", path)),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let needed = decoded.capacity() * channels;
        let buf = match &mut sample_buf {
            Some(buf) if buf.capacity() >= needed => buf,
            _ => sample_buf
                .insert(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)),
        };
        buf.copy_interleaved_ref(decoded);

        for frame in buf.samples().chunks_exact(channels) {
            if skipped < skip_samples {
                skipped += 1;
                continue;
            }
            if mono.len() >= max_samples {
                break;
            }
            let sum: f32 = frame.iter().sum();
            mono.push(sum / channels as f32);
        }
    }

    if mono.is_empty() {
        bail!("Decoded no audio from {:?}", path);
    }

    Ok(resample_linear(&mono, source_rate, target_rate))
}

/// Linear-interpolation resampler. Identity when rates match.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() {
            samples[idx + 1]
        } else {
            a
        };
        out.push(a + (b - a) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_middle_offset_long_track() {
        assert_eq!(middle_offset(180.0, 60.0), 60.0);
        assert_eq!(middle_offset(61.0, 60.0), 0.5);
    }

    #[test]
    fn test_middle_offset_short_track() {
        assert_eq!(middle_offset(42.0, 60.0), 0.0);
        assert_eq!(middle_offset(60.0, 60.0), 0.0);
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.0, 0.5, 1.0];
        assert_eq!(resample_linear(&samples, 44_100, 44_100), samples);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 48_000, 24_000);
        assert_eq!(out.len(), 500);
        // Linear interpolation preserves monotonicity on a ramp.
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_resample_upsamples() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 22_050, 44_100);
        assert_eq!(out.len(), 200);
    }
}
