//! Multimodal payload rendering.
//!
//! Image datasets render each prompt into a small JPEG card; audio datasets
//! synthesize a short WAV clip.  Results are cached on disk keyed by prompt
//! content so re-runs are cheap.  Concurrent writers to the same key are
//! fine: values are deterministic given the key, last write wins.

use std::io::Cursor;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};

use crate::util::content_hash;

const CARD_WIDTH: u32 = 512;
const CARD_HEIGHT: u32 = 256;
const CELL: u32 = 6;
const GRID_COLS: u32 = 64;
const GRID_ROWS: u32 = 32;

const SAMPLE_RATE: u32 = 16_000;
const TONE_SAMPLES: usize = 640; // 40 ms per byte at 16 kHz

#[derive(Clone, Debug)]
pub struct MediaCache {
    dir: PathBuf,
}

impl MediaCache {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Base64 JPEG card for a prompt, from cache when present.
    pub fn image_b64(&self, prompt: &str) -> anyhow::Result<String> {
        let path = self.dir.join(format!("{:016x}.jpg", content_hash(prompt)));
        if let Ok(bytes) = std::fs::read(&path) {
            return Ok(STANDARD.encode(bytes));
        }
        let bytes = render_card(prompt)?;
        std::fs::write(&path, &bytes)?;
        Ok(STANDARD.encode(bytes))
    }

    /// Base64 WAV clip for a prompt, from cache when present.
    pub fn audio_b64(&self, prompt: &str) -> anyhow::Result<String> {
        let path = self.dir.join(format!("{:016x}.wav", content_hash(prompt)));
        if let Ok(bytes) = std::fs::read(&path) {
            return Ok(STANDARD.encode(bytes));
        }
        let bytes = synth_clip(prompt)?;
        std::fs::write(&path, &bytes)?;
        Ok(STANDARD.encode(bytes))
    }
}

/// Fixed 512x256 card: light-blue background with the prompt bytes drawn as
/// a centered block pattern.  The target treats the payload as opaque, so
/// the encoding only has to be deterministic, not legible.
fn render_card(prompt: &str) -> anyhow::Result<Vec<u8>> {
    let mut img = RgbImage::from_pixel(CARD_WIDTH, CARD_HEIGHT, Rgb([173, 216, 230]));
    let ink = Rgb([25, 40, 90]);

    let offset_x = (CARD_WIDTH - GRID_COLS * CELL) / 2;
    let offset_y = (CARD_HEIGHT - GRID_ROWS * CELL) / 2;
    let capacity_bits = (GRID_COLS * GRID_ROWS) as usize;

    for (bit_idx, _) in prompt
        .as_bytes()
        .iter()
        .flat_map(|byte| (0..8).map(move |b| byte >> b & 1))
        .enumerate()
        .filter(|(_, bit)| *bit == 1)
        .take_while(|(i, _)| *i < capacity_bits)
    {
        let col = (bit_idx as u32) % GRID_COLS;
        let row = (bit_idx as u32) / GRID_COLS;
        for dy in 0..CELL {
            for dx in 0..CELL {
                img.put_pixel(offset_x + col * CELL + dx, offset_y + row * CELL + dy, ink);
            }
        }
    }

    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Jpeg)?;
    Ok(cursor.into_inner())
}

/// Short mono 16 kHz WAV: one tone per prompt byte, frequency derived from
/// the byte value, capped at 64 tones (~2.5 s).
fn synth_clip(prompt: &str) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &byte in prompt.as_bytes().iter().take(64) {
            let freq = 200.0 + f64::from(byte % 64) * 12.5;
            for n in 0..TONE_SAMPLES {
                let t = n as f64 / f64::from(SAMPLE_RATE);
                let sample = (t * freq * 2.0 * std::f64::consts::PI).sin() * 0.4;
                writer.write_sample((sample * f64::from(i16::MAX)) as i16)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_render_is_deterministic_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path()).unwrap();
        let a = cache.image_b64("render me").unwrap();
        let b = cache.image_b64("render me").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, cache.image_b64("render me differently").unwrap());
        // One cached jpg per distinct prompt.
        let jpgs = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map(|x| x == "jpg")
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(jpgs, 2);
    }

    #[test]
    fn audio_clip_is_valid_wav() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path()).unwrap();
        let b64 = cache.audio_b64("say this").unwrap();
        let bytes = STANDARD.decode(b64).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert!(reader.len() > 0);
    }
}
