//! Stage 1: obtain a frame and attach capture metadata.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use uuid::Uuid;

use crate::config::{AcquisitionConfig, MAX_MAGNIFICATION, MIN_MAGNIFICATION, SyntheticConfig};
use crate::error::{ConfigurationError, StageError};
use crate::models::{AcquisitionMode, CaptureMetadata, GpsCoordinates, RawImage};
use crate::pipeline::{PipelineContext, Stage, StageKind};

const FRAME_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Free-form fields the caller attaches to a capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRequestMetadata {
    /// RFC 3339; the current time is used when absent
    pub timestamp: Option<String>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub operator_id: Option<String>,
}

/// Parameters of one capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub mode: AcquisitionMode,
    pub magnification: f64,
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u32,
    #[serde(default)]
    pub focus_position: Option<i32>,
    #[serde(default)]
    pub capture_metadata: CaptureRequestMetadata,
    /// Image file (`file`) or frame directory (`video`)
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Frame to take from a `video` source
    #[serde(default)]
    pub frame_index: Option<usize>,
}

fn default_exposure_ms() -> u32 {
    100
}

impl AcquisitionParams {
    pub fn synthetic(magnification: f64) -> Self {
        Self {
            mode: AcquisitionMode::Synthetic,
            magnification,
            exposure_ms: default_exposure_ms(),
            focus_position: None,
            capture_metadata: CaptureRequestMetadata::default(),
            source: None,
            frame_index: None,
        }
    }

    pub fn from_file<P: Into<PathBuf>>(path: P, magnification: f64) -> Self {
        Self {
            mode: AcquisitionMode::File,
            source: Some(path.into()),
            ..Self::synthetic(magnification)
        }
    }

    pub fn from_video<P: Into<PathBuf>>(dir: P, frame_index: usize, magnification: f64) -> Self {
        Self {
            mode: AcquisitionMode::Video,
            source: Some(dir.into()),
            frame_index: Some(frame_index),
            ..Self::synthetic(magnification)
        }
    }

    pub fn camera(magnification: f64) -> Self {
        Self {
            mode: AcquisitionMode::Camera,
            ..Self::synthetic(magnification)
        }
    }

    pub fn with_operator(mut self, operator_id: impl Into<String>) -> Self {
        self.capture_metadata.operator_id = Some(operator_id.into());
        self
    }

    pub fn with_gps(mut self, lat: f64, lon: f64) -> Self {
        self.capture_metadata.gps_lat = Some(lat);
        self.capture_metadata.gps_lon = Some(lon);
        self
    }
}

/// What a frame source is asked for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRequest {
    pub exposure_ms: u32,
    pub focus_position: Option<i32>,
    pub frame_index: usize,
}

/// Anything that can hand out RGB frames: a camera driver, a recorded
/// sequence, a test double.
pub trait FrameSource: Send + Sync {
    fn name(&self) -> &str;
    fn grab(&self, request: &FrameRequest) -> Result<RgbImage>;
}

/// Recorded sequence stored as one image file per frame. Frames are ordered
/// by file name.
pub struct FrameDirectorySource {
    dir: PathBuf,
}

impl FrameDirectorySource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn frames(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read frame directory {}", self.dir.display()))?;

        let mut frames = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && has_frame_extension(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }
}

fn has_frame_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for FrameDirectorySource {
    fn name(&self) -> &str {
        "frame-directory"
    }

    fn grab(&self, request: &FrameRequest) -> Result<RgbImage> {
        let frames = self.frames()?;
        let path = frames.get(request.frame_index).ok_or_else(|| {
            anyhow::anyhow!(
                "frame {} requested but {} holds {} frame(s)",
                request.frame_index,
                self.dir.display(),
                frames.len()
            )
        })?;
        let image = image::open(path).with_context(|| format!("Failed to decode frame {}", path.display()))?;
        Ok(image.to_rgb8())
    }
}

/// Draw a light noisy background with dark disc-shaped organisms.
pub fn synthetic_frame<R: Rng>(config: &SyntheticConfig, rng: &mut R) -> RgbImage {
    let (width, height) = (config.width, config.height);
    let mut image = RgbImage::from_fn(width, height, |_, _| {
        Rgb([
            rng.random_range(200..230u8),
            rng.random_range(200..230u8),
            rng.random_range(200..230u8),
        ])
    });

    let scale = width.min(height) as f64 / 2048.0;
    let min_radius = ((20.0 * scale) as u32).max(3);
    let max_radius = ((80.0 * scale) as u32).clamp(min_radius + 1, width.min(height) / 4);
    let count = rng.random_range(config.min_organisms..=config.max_organisms);

    for _ in 0..count {
        let radius = rng.random_range(min_radius..=max_radius);
        let cx = rng.random_range(radius..width - radius);
        let cy = rng.random_range(radius..height - radius);
        let color = Rgb([
            rng.random_range(50..150u8),
            rng.random_range(50..150u8),
            rng.random_range(50..150u8),
        ]);
        fill_disc(&mut image, cx, cy, radius, color);
    }

    image
}

pub fn fill_disc(image: &mut RgbImage, cx: u32, cy: u32, radius: u32, color: Rgb<u8>) {
    let r = radius as i64;
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let x = cx as i64 + dx;
            let y = cy as i64 + dy;
            if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
                image.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

pub struct AcquisitionStage {
    config: AcquisitionConfig,
    camera: Option<Box<dyn FrameSource>>,
}

impl AcquisitionStage {
    pub fn new(config: AcquisitionConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        info!("Acquisition stage initialized ({} camera)", config.camera_type);
        Ok(Self { config, camera: None })
    }

    pub fn with_camera(mut self, camera: Box<dyn FrameSource>) -> Self {
        info!("Camera source attached: {}", camera.name());
        self.camera = Some(camera);
        self
    }

    fn grab_frame(&self, params: &AcquisitionParams) -> Result<RgbImage, StageError> {
        let request = FrameRequest {
            exposure_ms: params.exposure_ms,
            focus_position: params.focus_position,
            frame_index: params.frame_index.unwrap_or(0),
        };

        match params.mode {
            AcquisitionMode::Synthetic => {
                let synthetic = &self.config.synthetic;
                let mut rng = match synthetic.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                Ok(synthetic_frame(synthetic, &mut rng))
            }
            AcquisitionMode::File => {
                let path = required_source(params)?;
                let image = image::open(path).map_err(|e| {
                    StageError::validation(format!("cannot read image {}: {}", path.display(), e))
                })?;
                Ok(image.to_rgb8())
            }
            AcquisitionMode::Video => {
                let dir = required_source(params)?;
                FrameDirectorySource::new(dir)
                    .grab(&request)
                    .map_err(|e| StageError::validation(format!("{:#}", e)))
            }
            AcquisitionMode::Camera => {
                let camera = self
                    .camera
                    .as_ref()
                    .ok_or_else(|| StageError::validation("no camera frame source attached"))?;
                Ok(camera.grab(&request)?)
            }
        }
    }

    fn build_metadata(&self, params: &AcquisitionParams, image: &RgbImage) -> Result<CaptureMetadata> {
        let resolution_um_per_px = self.config.sensor_pixel_size_um / params.magnification;
        let timestamp = match &params.capture_metadata.timestamp {
            Some(ts) => ts.clone(),
            None => OffsetDateTime::now_local()
                .unwrap_or_else(|_| OffsetDateTime::now_utc())
                .format(&Rfc3339)?,
        };
        let request = &params.capture_metadata;
        let gps = match (request.gps_lat, request.gps_lon) {
            (Some(lat), Some(lon)) => Some(GpsCoordinates { lat, lon }),
            _ => None,
        };

        Ok(CaptureMetadata {
            capture_id: Uuid::new_v4().to_string(),
            timestamp,
            gps,
            magnification: params.magnification,
            exposure_ms: params.exposure_ms,
            focus_position: params.focus_position,
            resolution_um_per_px,
            fov_mm: [
                image.width() as f64 * resolution_um_per_px / 1000.0,
                image.height() as f64 * resolution_um_per_px / 1000.0,
            ],
            operator_id: request.operator_id.clone(),
            mode: params.mode,
        })
    }
}

fn required_source(params: &AcquisitionParams) -> Result<&Path, StageError> {
    params
        .source
        .as_deref()
        .ok_or_else(|| StageError::validation(format!("{:?} mode requires a source path", params.mode)))
}

impl Stage for AcquisitionStage {
    type Input<'a> = &'a AcquisitionParams;
    type Output = RawImage;

    fn kind(&self) -> StageKind {
        StageKind::Acquisition
    }

    fn validate_input(&self, params: &&AcquisitionParams) -> Result<(), StageError> {
        let m = params.magnification;
        if !(m.is_finite() && m > 0.0) {
            return Err(StageError::validation(format!("magnification must be positive, got {}", m)));
        }
        if params.mode.checks_magnification() && !(MIN_MAGNIFICATION..=MAX_MAGNIFICATION).contains(&m) {
            return Err(StageError::validation(format!(
                "Magnification {} out of range [{}, {}]",
                m, MIN_MAGNIFICATION, MAX_MAGNIFICATION
            )));
        }
        let request = &params.capture_metadata;
        if request.gps_lat.is_some() != request.gps_lon.is_some() {
            return Err(StageError::validation("gps_lat and gps_lon must be given together"));
        }
        if let Some(ts) = &request.timestamp {
            OffsetDateTime::parse(ts, &Rfc3339)
                .map_err(|e| StageError::validation(format!("timestamp `{}` is not RFC 3339: {}", ts, e)))?;
        }
        Ok(())
    }

    fn process(&self, params: &AcquisitionParams, context: &mut PipelineContext) -> Result<RawImage, StageError> {
        let image = self.grab_frame(params)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(StageError::validation("acquired frame is empty"));
        }
        let metadata = self.build_metadata(params, &image)?;

        context.record(format!(
            "Acquired {}x{} frame ({:?}), {:.3} um/px, capture {}",
            image.width(),
            image.height(),
            params.mode,
            metadata.resolution_um_per_px,
            metadata.capture_id
        ));

        Ok(RawImage { image, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> AcquisitionStage {
        let mut config = AcquisitionConfig::default();
        config.synthetic.width = 256;
        config.synthetic.height = 192;
        config.synthetic.seed = Some(7);
        AcquisitionStage::new(config).unwrap()
    }

    #[test]
    fn test_synthetic_capture_metadata() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        let raw = stage.run(&AcquisitionParams::synthetic(2.0), &mut context).unwrap();

        assert_eq!(raw.image.dimensions(), (256, 192));
        assert_eq!(raw.metadata.resolution_um_per_px, 1.55 / 2.0);
        assert!((raw.metadata.fov_mm[0] - 256.0 * 0.775 / 1000.0).abs() < 1e-12);
        assert!(OffsetDateTime::parse(&raw.metadata.timestamp, &Rfc3339).is_ok());
    }

    #[test]
    fn test_seeded_synthetic_frames_repeat() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        let a = stage.run(&AcquisitionParams::synthetic(1.0), &mut context).unwrap();
        let b = stage.run(&AcquisitionParams::synthetic(1.0), &mut context).unwrap();
        assert_eq!(a.image, b.image);
        assert_ne!(a.metadata.capture_id, b.metadata.capture_id);
    }

    #[test]
    fn test_magnification_range() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        for m in [0.5, 5.0, 0.0, f64::NAN] {
            let err = stage.run(&AcquisitionParams::synthetic(m), &mut context).unwrap_err();
            assert!(matches!(err, StageError::Validation(_)), "magnification {}", m);
        }
        assert!(stage.run(&AcquisitionParams::synthetic(4.5), &mut context).is_ok());
    }

    #[test]
    fn test_resolution_follows_magnification_across_range() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        for m in [MIN_MAGNIFICATION, 1.0, 1.5, 2.25, 3.0, 4.0, MAX_MAGNIFICATION] {
            let raw = stage.run(&AcquisitionParams::synthetic(m), &mut context).unwrap();
            assert_eq!(raw.metadata.magnification, m);
            assert_eq!(raw.metadata.resolution_um_per_px, 1.55 / m, "magnification {}", m);
        }
    }

    #[test]
    fn test_missing_camera_is_validation_error() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        let err = stage.run(&AcquisitionParams::camera(1.0), &mut context).unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
    }

    #[test]
    fn test_half_gps_rejected() {
        let stage = stage();
        let mut context = PipelineContext::new(false, None);
        let mut params = AcquisitionParams::synthetic(1.0);
        params.capture_metadata.gps_lat = Some(54.3);
        assert!(stage.run(&params, &mut context).is_err());
    }
}
