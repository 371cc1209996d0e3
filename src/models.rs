//! Records exchanged between pipeline stages.
//!
//! Every record is produced by exactly one stage and only read by the
//! stages after it. Stages hand each other shared references, so nothing
//! downstream can modify what an earlier stage returned.

use std::collections::BTreeMap;

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

/// Where the frame of a capture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    Synthetic,
    File,
    Camera,
    Video,
}

impl AcquisitionMode {
    /// File captures carry magnification as metadata only.
    pub fn checks_magnification(&self) -> bool {
        !matches!(self, AcquisitionMode::File)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Unique per capture, names every exported artifact of the run
    pub capture_id: String,
    /// RFC 3339
    pub timestamp: String,
    pub gps: Option<GpsCoordinates>,
    pub magnification: f64,
    pub exposure_ms: u32,
    pub focus_position: Option<i32>,
    pub resolution_um_per_px: f64,
    /// Field of view `[width, height]` in millimetres
    pub fov_mm: [f64; 2],
    pub operator_id: Option<String>,
    pub mode: AcquisitionMode,
}

/// Output of acquisition: an RGB frame plus its capture metadata.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub image: RgbImage,
    pub metadata: CaptureMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingStats {
    pub mean_intensity: f64,
    pub std_intensity: f64,
    pub snr_db: f64,
    pub background_level: f64,
}

/// Cleaned frame, same shape as the raw one.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pub image: RgbImage,
    pub stats: PreprocessingStats,
}

/// Bounding box in full-image pixel coordinates (inclusive extent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn from_extent(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        }
    }

    pub fn max_x(&self) -> u32 {
        self.x + self.width - 1
    }

    pub fn max_y(&self) -> u32 {
        self.y + self.height - 1
    }

    pub fn center(&self) -> (u32, u32) {
        ((self.x + self.max_x()) / 2, (self.y + self.max_y()) / 2)
    }

    /// Grow the box by `padding` on every side, clamped to the image.
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn padded(&self, padding: u32, image_width: u32, image_height: u32) -> Option<Self> {
        if self.x >= image_width || self.y >= image_height || self.width == 0 || self.height == 0 {
            return None;
        }
        let x = self.x.saturating_sub(padding);
        let y = self.y.saturating_sub(padding);
        let max_x = (self.max_x().saturating_add(padding)).min(image_width - 1);
        let max_y = (self.max_y().saturating_add(padding)).min(image_height - 1);
        Some(Self::from_extent(x, y, max_x, max_y))
    }
}

/// Binary mask of one organism.
///
/// Pixels are stored only inside the bounding box but the mask is addressed
/// in full-image coordinates; everything outside the box is unset.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMask {
    pub image_width: u32,
    pub image_height: u32,
    pub bbox: BoundingBox,
    pixels: GrayImage,
}

impl RegionMask {
    pub fn new(image_width: u32, image_height: u32, bbox: BoundingBox) -> Self {
        Self {
            image_width,
            image_height,
            bbox,
            pixels: GrayImage::new(bbox.width, bbox.height),
        }
    }

    pub fn set(&mut self, x: u32, y: u32) {
        if self.in_box(x, y) {
            self.pixels
                .put_pixel(x - self.bbox.x, y - self.bbox.y, Luma([255]));
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.in_box(x, y) && self.pixels.get_pixel(x - self.bbox.x, y - self.bbox.y)[0] > 0
    }

    pub fn area(&self) -> u32 {
        self.pixels.pixels().filter(|p| p[0] > 0).count() as u32
    }

    /// Expand to a full-size 0/255 image
    pub fn to_full_image(&self) -> GrayImage {
        let mut full = GrayImage::new(self.image_width, self.image_height);
        for (x, y, p) in self.pixels.enumerate_pixels() {
            if p[0] > 0 {
                full.put_pixel(x + self.bbox.x, y + self.bbox.y, Luma([255]));
            }
        }
        full
    }

    fn in_box(&self, x: u32, y: u32) -> bool {
        x >= self.bbox.x && y >= self.bbox.y && x <= self.bbox.max_x() && y <= self.bbox.max_y()
    }
}

/// One organism candidate found by segmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub mask: RegionMask,
    pub bbox: BoundingBox,
    pub centroid: (u32, u32),
    pub area_px: u32,
}

/// Batch of detections. Mask, box, centroid and area of one organism live
/// in the same record, so the sequences cannot drift apart.
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    pub detections: Vec<Detection>,
    pub num_detected: usize,
}

impl SegmentationOutput {
    pub fn new(detections: Vec<Detection>) -> Self {
        let num_detected = detections.len();
        Self {
            detections,
            num_detected,
        }
    }

    pub fn masks(&self) -> impl Iterator<Item = &RegionMask> {
        self.detections.iter().map(|d| &d.mask)
    }

    pub fn boxes(&self) -> impl Iterator<Item = &BoundingBox> {
        self.detections.iter().map(|d| &d.bbox)
    }

    pub fn centroids(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.detections.iter().map(|d| d.centroid)
    }

    pub fn areas(&self) -> impl Iterator<Item = u32> + '_ {
        self.detections.iter().map(|d| d.area_px)
    }

    pub fn is_consistent(&self) -> bool {
        self.num_detected == self.detections.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedClass {
    pub class_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub organism_index: usize,
    pub class_name: String,
    pub confidence: f64,
    pub top_k: Vec<RankedClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub input_size: u32,
    pub inference_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ClassificationOutput {
    pub predictions: Vec<Prediction>,
    pub model: ModelInfo,
}

/// A detection that passed the confidence and size filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organism {
    pub organism_id: usize,
    pub class_name: String,
    pub confidence: f64,
    pub size_um: f64,
    pub area_px: u32,
    pub bbox: BoundingBox,
    pub centroid_px: (u32, u32),
    pub centroid_um: (f64, f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeDistribution {
    pub mean_um: f64,
    pub std_um: f64,
    pub min_um: f64,
    pub max_um: f64,
    pub histogram: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct CountingOutput {
    pub counts_by_class: BTreeMap<String, usize>,
    pub total_count: usize,
    pub size_distribution: BTreeMap<String, SizeDistribution>,
    pub organisms: Vec<Organism>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiversityIndices {
    pub shannon: f64,
    pub simpson: f64,
    pub species_richness: usize,
}

impl DiversityIndices {
    pub fn empty() -> Self {
        Self {
            shannon: 0.0,
            simpson: 0.0,
            species_richness: 0,
        }
    }
}

/// Bloom severity, ordered from mildest to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 3.0 {
            Severity::Critical
        } else if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Moderate
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomAlert {
    pub class_name: String,
    pub count: usize,
    pub threshold: usize,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassTrend {
    pub current: usize,
    pub previous: usize,
    pub change_pct: f64,
    pub direction: TrendDirection,
}

/// Counts of an earlier sample, used for trend analysis. Deserializes from
/// a JSON snapshot written by the export stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSample {
    pub counts_by_class: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsOutput {
    pub diversity: Option<DiversityIndices>,
    pub composition: Option<BTreeMap<String, f64>>,
    pub bloom_alerts: Vec<BloomAlert>,
    pub trends: Option<BTreeMap<String, ClassTrend>>,
}

#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub exported_files: Vec<String>,
}

/// Per-stage figures kept in the final report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummaries {
    pub preprocessing: PreprocessingStats,
    pub num_detected: usize,
    pub model: ModelInfo,
}

/// Final aggregate of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub metadata: CaptureMetadata,
    pub counts_by_class: BTreeMap<String, usize>,
    pub total_count: usize,
    pub organisms: Vec<Organism>,
    pub size_distribution: BTreeMap<String, SizeDistribution>,
    pub diversity: Option<DiversityIndices>,
    pub composition: Option<BTreeMap<String, f64>>,
    pub bloom_alerts: Vec<BloomAlert>,
    pub trends: Option<BTreeMap<String, ClassTrend>>,
    pub exported_files: Vec<String>,
    pub stages: StageSummaries,
    pub trace: Vec<String>,
}
