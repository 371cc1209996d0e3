//! Stage 2: denoise, flatten the background and stretch contrast.

use anyhow::{Context, Result};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use tracing::{debug, info, warn};

use crate::config::{DenoiseMethod, PreprocessingConfig};
use crate::error::{ConfigurationError, StageError};
use crate::models::{PreprocessedImage, PreprocessingStats, RawImage};
use crate::pipeline::{PipelineContext, Stage, StageKind};

const GAUSSIAN_SIGMA: f32 = 1.1;

const BILATERAL_DIAMETER: u32 = 9;
const BILATERAL_SIGMA_COLOR: f64 = 75.0;
const BILATERAL_SIGMA_SPACE: f64 = 75.0;

const NLM_PATCH_RADIUS: i64 = 1;
const NLM_SEARCH_RADIUS: i64 = 3;
const NLM_H: f64 = 10.0;

const LOW_PERCENTILE: f64 = 1.0;
const HIGH_PERCENTILE: f64 = 99.0;
const BACKGROUND_PERCENTILE: f64 = 10.0;

/// SNR reported for a perfectly flat frame
const FLAT_SNR_DB: f64 = 100.0;

pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

pub fn gaussian_denoise(image: &RgbImage) -> RgbImage {
    gaussian_blur_f32(image, GAUSSIAN_SIGMA)
}

/// Edge-preserving smoothing. Colour distance is the summed absolute
/// difference over the three channels.
pub fn bilateral_denoise(image: &RgbImage) -> RgbImage {
    let radius = (BILATERAL_DIAMETER / 2) as i64;
    let (width, height) = image.dimensions();

    let color_coeff = -0.5 / (BILATERAL_SIGMA_COLOR * BILATERAL_SIGMA_COLOR);
    let space_coeff = -0.5 / (BILATERAL_SIGMA_SPACE * BILATERAL_SIGMA_SPACE);
    let color_weight: Vec<f64> = (0..=255 * 3)
        .map(|d| ((d * d) as f64 * color_coeff).exp())
        .collect();

    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = dx * dx + dy * dy;
            if r2 <= radius * radius {
                offsets.push((dx, dy, (r2 as f64 * space_coeff).exp()));
            }
        }
    }

    RgbImage::from_fn(width, height, |x, y| {
        let center = image.get_pixel(x, y);
        let mut sum = [0.0f64; 3];
        let mut norm = 0.0;
        for &(dx, dy, space_w) in &offsets {
            let p = image.get_pixel(
                clamp_coord(x as i64 + dx, width),
                clamp_coord(y as i64 + dy, height),
            );
            let diff: usize = (0..3)
                .map(|c| (p[c] as i32 - center[c] as i32).unsigned_abs() as usize)
                .sum();
            let w = space_w * color_weight[diff];
            for c in 0..3 {
                sum[c] += w * p[c] as f64;
            }
            norm += w;
        }
        Rgb([
            round_u8(sum[0] / norm),
            round_u8(sum[1] / norm),
            round_u8(sum[2] / norm),
        ])
    })
}

/// Non-local means over a small search window
pub fn nlm_denoise(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let patch_len = ((2 * NLM_PATCH_RADIUS + 1) * (2 * NLM_PATCH_RADIUS + 1) * 3) as f64;
    let h2 = NLM_H * NLM_H;

    let px = |x: i64, y: i64| image.get_pixel(clamp_coord(x, width), clamp_coord(y, height));

    RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let mut sum = [0.0f64; 3];
        let mut norm = 0.0;
        for sy in -NLM_SEARCH_RADIUS..=NLM_SEARCH_RADIUS {
            for sx in -NLM_SEARCH_RADIUS..=NLM_SEARCH_RADIUS {
                let mut dist = 0.0;
                for py in -NLM_PATCH_RADIUS..=NLM_PATCH_RADIUS {
                    for px_off in -NLM_PATCH_RADIUS..=NLM_PATCH_RADIUS {
                        let a = px(x + px_off, y + py);
                        let b = px(x + sx + px_off, y + sy + py);
                        for c in 0..3 {
                            let d = a[c] as f64 - b[c] as f64;
                            dist += d * d;
                        }
                    }
                }
                let w = (-(dist / patch_len) / h2).exp();
                let q = px(x + sx, y + sy);
                for c in 0..3 {
                    sum[c] += w * q[c] as f64;
                }
                norm += w;
            }
        }
        Rgb([
            round_u8(sum[0] / norm),
            round_u8(sum[1] / norm),
            round_u8(sum[2] / norm),
        ])
    })
}

/// Running min or max along rows, then columns, over a square window.
fn separable_rank_filter(image: &GrayImage, radius: u32, take_max: bool) -> GrayImage {
    let (width, height) = image.dimensions();
    let r = radius as i64;
    let pick = |a: u8, b: u8| if take_max { a.max(b) } else { a.min(b) };
    let init = if take_max { u8::MIN } else { u8::MAX };

    let mut rows = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let lo = (x as i64 - r).max(0) as u32;
            let hi = (x as i64 + r).min(width as i64 - 1) as u32;
            let v = (lo..=hi).fold(init, |acc, xx| pick(acc, image.get_pixel(xx, y)[0]));
            rows.put_pixel(x, y, Luma([v]));
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        let lo = (y as i64 - r).max(0) as u32;
        let hi = (y as i64 + r).min(height as i64 - 1) as u32;
        for x in 0..width {
            let v = (lo..=hi).fold(init, |acc, yy| pick(acc, rows.get_pixel(x, yy)[0]));
            out.put_pixel(x, y, Luma([v]));
        }
    }
    out
}

/// Greyscale opening (erode then dilate) with a square window
pub fn grayscale_opening(image: &GrayImage, radius: u32) -> GrayImage {
    let eroded = separable_rank_filter(image, radius, false);
    separable_rank_filter(&eroded, radius, true)
}

/// Smooth bright background under dark organisms.
///
/// The opening runs on the inverted frame so the dark organisms are
/// removed from the estimate instead of the background.
pub fn estimate_background(gray: &GrayImage, radius: u32) -> GrayImage {
    let mut inverted = gray.clone();
    image::imageops::invert(&mut inverted);
    let mut background = grayscale_opening(&inverted, radius);
    image::imageops::invert(&mut background);
    background
}

pub fn correct_background(image: &RgbImage, radius: u32, offset: u8) -> RgbImage {
    let background = estimate_background(&to_grayscale(image), radius);
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let bg = background.get_pixel(x, y)[0] as i32;
        Rgb([0, 1, 2].map(|c| (p[c] as i32 - bg + offset as i32).clamp(0, 255) as u8))
    })
}

/// Percentile of a 256-bin histogram with linear interpolation between
/// ranks.
pub fn histogram_percentile(histogram: &[u64; 256], percentile: f64) -> f64 {
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let rank = percentile / 100.0 * (total - 1) as f64;
    let lower = rank.floor() as u64;
    let frac = rank - lower as f64;

    let value_at = |k: u64| -> f64 {
        let mut seen = 0u64;
        for (value, &count) in histogram.iter().enumerate() {
            seen += count;
            if seen > k {
                return value as f64;
            }
        }
        255.0
    };

    let lo = value_at(lower);
    if frac == 0.0 {
        lo
    } else {
        lo + frac * (value_at(lower + 1) - lo)
    }
}

fn channel_histogram(image: &RgbImage, channel: usize) -> [u64; 256] {
    let mut histogram = [0u64; 256];
    for p in image.pixels() {
        histogram[p[channel] as usize] += 1;
    }
    histogram
}

/// Per-channel 1st/99th percentile stretch. Flat channels stay as they are.
pub fn normalize_contrast(image: &RgbImage) -> RgbImage {
    let ranges: [Option<(f64, f64)>; 3] = [0, 1, 2].map(|c| {
        let histogram = channel_histogram(image, c);
        let lo = histogram_percentile(&histogram, LOW_PERCENTILE);
        let hi = histogram_percentile(&histogram, HIGH_PERCENTILE);
        (hi > lo).then_some((lo, hi))
    });

    let mut out = image.clone();
    for p in out.pixels_mut() {
        for c in 0..3 {
            if let Some((lo, hi)) = ranges[c] {
                let v = (p[c] as f64 - lo) * 255.0 / (hi - lo);
                p[c] = v.clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Illumination profile scaled to mean 1
pub fn normalized_profile(profile: &GrayImage) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let count = (profile.width() as f64 * profile.height() as f64).max(1.0);
    let mean = profile.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
    let mean = if mean > 0.0 { mean } else { 1.0 };
    ImageBuffer::from_fn(profile.width(), profile.height(), |x, y| {
        Luma([(profile.get_pixel(x, y)[0] as f64 / mean) as f32])
    })
}

pub fn flatfield_correct(image: &RgbImage, profile: &ImageBuffer<Luma<f32>, Vec<f32>>) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let gain = profile.get_pixel(x, y)[0] as f64 + 1e-6;
        Rgb([0, 1, 2].map(|c| (p[c] as f64 / gain).clamp(0.0, 255.0) as u8))
    })
}

pub fn compute_stats(image: &RgbImage) -> PreprocessingStats {
    let gray = to_grayscale(image);
    let n = (gray.width() as f64 * gray.height() as f64).max(1.0);

    let mut histogram = [0u64; 256];
    let mut sum = 0.0;
    for p in gray.pixels() {
        histogram[p[0] as usize] += 1;
        sum += p[0] as f64;
    }
    let mean = sum / n;
    let variance = gray
        .pixels()
        .map(|p| {
            let d = p[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = variance.sqrt();

    let snr_db = if std > 0.0 {
        20.0 * (mean / std).log10()
    } else {
        FLAT_SNR_DB
    };

    PreprocessingStats {
        mean_intensity: mean,
        std_intensity: std,
        snr_db,
        background_level: histogram_percentile(&histogram, BACKGROUND_PERCENTILE),
    }
}

fn clamp_coord(v: i64, len: u32) -> u32 {
    v.clamp(0, len as i64 - 1) as u32
}

fn round_u8(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

pub struct PreprocessingStage {
    config: PreprocessingConfig,
    profile: Option<ImageBuffer<Luma<f32>, Vec<f32>>>,
}

impl PreprocessingStage {
    pub fn new(config: PreprocessingConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let profile = match (&config.illumination_profile, config.flatfield_correction) {
            (Some(path), true) => {
                let gray = load_profile(path)
                    .map_err(|e| ConfigurationError::invalid("preprocessing", format!("{:#}", e)))?;
                Some(normalized_profile(&gray))
            }
            _ => None,
        };

        info!(
            "Preprocessing stage initialized (denoise: {:?}, background: {}, normalize: {}, flat-field: {})",
            config.denoise_method,
            config.background_correction,
            config.normalize,
            profile.is_some()
        );
        Ok(Self { config, profile })
    }

    fn denoise(&self, image: &RgbImage) -> RgbImage {
        match self.config.denoise_method {
            DenoiseMethod::None => image.clone(),
            DenoiseMethod::Gaussian => gaussian_denoise(image),
            DenoiseMethod::Bilateral => bilateral_denoise(image),
            DenoiseMethod::Nlm => nlm_denoise(image),
        }
    }
}

fn load_profile(path: &std::path::Path) -> Result<GrayImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to load illumination profile {}", path.display()))?;
    Ok(image.to_luma8())
}

impl Stage for PreprocessingStage {
    type Input<'a> = &'a RawImage;
    type Output = PreprocessedImage;

    fn kind(&self) -> StageKind {
        StageKind::Preprocessing
    }

    fn validate_input(&self, raw: &&RawImage) -> Result<(), StageError> {
        let (width, height) = raw.image.dimensions();
        if width == 0 || height == 0 {
            return Err(StageError::validation("input image is empty"));
        }
        if let Some(profile) = &self.profile {
            if profile.dimensions() != (width, height) {
                return Err(StageError::validation(format!(
                    "illumination profile is {}x{} but the frame is {}x{}",
                    profile.width(),
                    profile.height(),
                    width,
                    height
                )));
            }
        }
        Ok(())
    }

    fn process(&self, raw: &RawImage, context: &mut PipelineContext) -> Result<PreprocessedImage, StageError> {
        let mut image = self.denoise(&raw.image);
        debug!("Denoised with {:?}", self.config.denoise_method);

        if self.config.background_correction {
            image = correct_background(
                &image,
                self.config.background_kernel_radius,
                self.config.background_offset,
            );
        }
        if self.config.normalize {
            image = normalize_contrast(&image);
        }
        match &self.profile {
            Some(profile) => image = flatfield_correct(&image, profile),
            None if self.config.flatfield_correction => {
                warn!("Flat-field correction skipped: no illumination profile")
            }
            None => {}
        }

        let stats = compute_stats(&image);
        context.record(format!(
            "Preprocessed: mean {:.1}, std {:.1}, SNR {:.1} dB, background {:.1}",
            stats.mean_intensity, stats.std_intensity, stats.snr_db, stats.background_level
        ));

        Ok(PreprocessedImage { image, stats })
    }
}
