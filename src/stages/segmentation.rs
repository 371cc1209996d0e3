//! Stage 3: find organism regions in the preprocessed frame.

use std::collections::BTreeMap;

use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::{Norm, euclidean_squared_distance_transform};
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, open};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::{debug, info};

use crate::config::{SegmentationConfig, SegmentationMethod};
use crate::error::{ConfigurationError, StageError};
use crate::models::{BoundingBox, Detection, PreprocessedImage, RegionMask, SegmentationOutput};
use crate::pipeline::{PipelineContext, Stage, StageKind};
use crate::stages::preprocessing::to_grayscale;
use crate::stages::watershed;

/// Radius of the opening that removes speckle from binary masks
const OPEN_RADIUS: u8 = 2;
/// Radius of the dilation giving the sure-background region
const SURE_BG_RADIUS: u8 = 3;

/// Per-label accumulator: extent, pixel count and coordinate sums
#[derive(Debug, Clone, Copy)]
struct RegionStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    count: u32,
    sum_x: u64,
    sum_y: u64,
}

impl RegionStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            count: 0,
            sum_x: 0,
            sum_y: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.count += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
    }

    fn bbox(&self) -> BoundingBox {
        BoundingBox::from_extent(self.min_x, self.min_y, self.max_x, self.max_y)
    }

    /// First-order moments, falling back to the box centre
    fn centroid(&self) -> (u32, u32) {
        if self.count == 0 {
            return self.bbox().center();
        }
        (
            (self.sum_x / self.count as u64) as u32,
            (self.sum_y / self.count as u64) as u32,
        )
    }
}

/// Turn a label map into detections. Labels below `first_label` are
/// background; regions outside `[min_area, max_area]` are dropped.
/// Detections come out in label order.
fn collect_regions(
    labels: &[i32],
    width: u32,
    height: u32,
    first_label: i32,
    min_area: u32,
    max_area: u32,
) -> Vec<Detection> {
    let mut regions: BTreeMap<i32, RegionStats> = BTreeMap::new();

    for y in 0..height {
        for x in 0..width {
            let label = labels[(y * width + x) as usize];
            if label < first_label {
                continue;
            }
            regions
                .entry(label)
                .or_insert_with(|| RegionStats::new(x, y))
                .add(x, y);
        }
    }

    let kept: BTreeMap<i32, RegionStats> = regions
        .into_iter()
        .filter(|(_, r)| r.count >= min_area && r.count <= max_area)
        .collect();

    let mut masks: BTreeMap<i32, RegionMask> = kept
        .iter()
        .map(|(&label, r)| (label, RegionMask::new(width, height, r.bbox())))
        .collect();

    for (&label, r) in &kept {
        let Some(mask) = masks.get_mut(&label) else {
            continue;
        };
        for y in r.min_y..=r.max_y {
            for x in r.min_x..=r.max_x {
                if labels[(y * width + x) as usize] == label {
                    mask.set(x, y);
                }
            }
        }
    }

    kept.into_iter()
        .filter_map(|(label, r)| {
            masks.remove(&label).map(|mask| Detection {
                mask,
                bbox: r.bbox(),
                centroid: r.centroid(),
                area_px: r.count,
            })
        })
        .collect()
}

fn label_components(binary: &GrayImage) -> Vec<i32> {
    connected_components(binary, Connectivity::Eight, Luma([0u8]))
        .pixels()
        .map(|p| p[0] as i32)
        .collect()
}

/// Adaptive Gaussian threshold, inverted: dark pixels sufficiently below
/// their local mean become foreground (255).
pub fn adaptive_threshold_inv(gray: &GrayImage, block_size: u32, offset: i32) -> GrayImage {
    let sigma = 0.3 * ((block_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let local_mean = gaussian_blur_f32(gray, sigma);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0] as i32;
        let mean = local_mean.get_pixel(x, y)[0] as i32;
        Luma([if v <= mean - offset { 255 } else { 0 }])
    })
}

/// Global Otsu threshold, inverted
pub fn otsu_threshold_inv(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if gray.get_pixel(x, y)[0] <= level { 255 } else { 0 }])
    })
}

pub fn threshold_segment(image: &RgbImage, config: &SegmentationConfig) -> Vec<Detection> {
    let gray = to_grayscale(image);
    let binary = adaptive_threshold_inv(&gray, config.block_size, config.threshold_offset);
    let cleaned = open(&binary, Norm::LInf, OPEN_RADIUS);
    let labels = label_components(&cleaned);
    collect_regions(
        &labels,
        image.width(),
        image.height(),
        1,
        config.min_area_px,
        config.max_area_px,
    )
}

/// Seeds for the watershed: sure foreground components numbered from 2,
/// sure background 1, the band in between 0.
pub fn watershed_markers(gray: &GrayImage, foreground_fraction: f64) -> Option<Vec<i32>> {
    let first = gray.pixels().next()?[0];
    if gray.pixels().all(|p| p[0] == first) {
        return None;
    }

    let binary = otsu_threshold_inv(gray);
    let opening = open(&binary, Norm::LInf, OPEN_RADIUS);
    let foreground = opening.pixels().filter(|p| p[0] > 0).count();
    if foreground == 0 || foreground == (opening.width() * opening.height()) as usize {
        return None;
    }
    let sure_bg = dilate(&opening, Norm::LInf, SURE_BG_RADIUS);

    // distance of every foreground pixel to the nearest background pixel
    let mut background = opening.clone();
    image::imageops::invert(&mut background);
    let dist_sq = euclidean_squared_distance_transform(&background);
    let max_dist = dist_sq.pixels().map(|p| p[0]).fold(0.0f64, f64::max).sqrt();
    if !(max_dist.is_finite() && max_dist > 0.0) {
        return None;
    }

    let cutoff = foreground_fraction * max_dist;
    let sure_fg = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if dist_sq.get_pixel(x, y)[0].sqrt() > cutoff { 255 } else { 0 }])
    });

    let seeds = label_components(&sure_fg);
    let markers = seeds
        .iter()
        .zip(sure_bg.pixels().zip(sure_fg.pixels()))
        .map(|(&seed, (bg, fg))| {
            let unknown = bg[0] > 0 && fg[0] == 0;
            if unknown { 0 } else { seed + 1 }
        })
        .collect();
    Some(markers)
}

pub fn watershed_segment(image: &RgbImage, config: &SegmentationConfig) -> Vec<Detection> {
    let gray = to_grayscale(image);
    let Some(mut markers) = watershed_markers(&gray, config.foreground_fraction) else {
        debug!("No foreground found for watershed seeds");
        return Vec::new();
    };
    watershed::flood(image, &mut markers);
    collect_regions(
        &markers,
        image.width(),
        image.height(),
        2,
        config.min_area_px,
        config.max_area_px,
    )
}

/// All detection masks merged into one full-size image
pub fn mask_union(segmentation: &SegmentationOutput, width: u32, height: u32) -> GrayImage {
    let mut union = GrayImage::new(width, height);
    for mask in segmentation.masks() {
        let b = mask.bbox;
        for y in b.y..=b.max_y() {
            for x in b.x..=b.max_x() {
                if mask.contains(x, y) && x < width && y < height {
                    union.put_pixel(x, y, Luma([255]));
                }
            }
        }
    }
    union
}

pub struct SegmentationStage {
    config: SegmentationConfig,
}

impl SegmentationStage {
    pub fn new(config: SegmentationConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        info!(
            "Segmentation stage initialized ({:?}, area {}..={} px)",
            config.method, config.min_area_px, config.max_area_px
        );
        Ok(Self { config })
    }

    pub fn segment(&self, image: &RgbImage) -> SegmentationOutput {
        let detections = match self.config.method {
            SegmentationMethod::Threshold => threshold_segment(image, &self.config),
            SegmentationMethod::Watershed => watershed_segment(image, &self.config),
        };
        SegmentationOutput::new(detections)
    }
}

impl Stage for SegmentationStage {
    type Input<'a> = &'a PreprocessedImage;
    type Output = SegmentationOutput;

    fn kind(&self) -> StageKind {
        StageKind::Segmentation
    }

    fn validate_input(&self, input: &&PreprocessedImage) -> Result<(), StageError> {
        let (width, height) = input.image.dimensions();
        if width == 0 || height == 0 {
            return Err(StageError::validation("input image is empty"));
        }
        Ok(())
    }

    fn process(
        &self,
        input: &PreprocessedImage,
        context: &mut PipelineContext,
    ) -> Result<SegmentationOutput, StageError> {
        let output = self.segment(&input.image);
        if !output.is_consistent() {
            return Err(StageError::processing("detection count does not match detections"));
        }
        context.record(format!(
            "Segmented {} organism(s) with {:?}",
            output.num_detected, self.config.method
        ));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::acquisition::fill_disc;
    use image::Rgb;

    fn blob_image(centers: &[(u32, u32, u32)]) -> RgbImage {
        let mut image = RgbImage::from_pixel(200, 200, Rgb([220, 220, 220]));
        for &(cx, cy, r) in centers {
            fill_disc(&mut image, cx, cy, r, Rgb([40, 40, 40]));
        }
        image
    }

    #[test]
    fn test_collect_regions_filters_by_area() {
        // label 1: 4 px, label 2: 1 px
        let labels = vec![1, 1, 0, 2, 1, 1, 0, 0];
        let detections = collect_regions(&labels, 4, 2, 1, 2, 10);
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.area_px, 4);
        assert_eq!(d.bbox, BoundingBox::from_extent(0, 0, 1, 1));
        assert_eq!(d.centroid, (0, 0));
        assert_eq!(d.mask.area(), 4);
    }

    #[test]
    fn test_watershed_separates_blobs() {
        let image = blob_image(&[(50, 50, 15), (140, 130, 20)]);
        let config = SegmentationConfig::default();
        let detections = watershed_segment(&image, &config);
        assert_eq!(detections.len(), 2);
        for d in &detections {
            assert_eq!(d.mask.area(), d.area_px);
            assert!(d.area_px >= config.min_area_px && d.area_px <= config.max_area_px);
            assert!(d.mask.contains(d.centroid.0, d.centroid.1));
        }
    }

    #[test]
    fn test_threshold_finds_small_dots() {
        let image = blob_image(&[(30, 30, 3), (100, 60, 3), (160, 170, 3)]);
        let config = SegmentationConfig {
            method: SegmentationMethod::Threshold,
            min_area_px: 5,
            ..SegmentationConfig::default()
        };
        let detections = threshold_segment(&image, &config);
        assert_eq!(detections.len(), 3);
    }

    #[test]
    fn test_blank_frame_has_no_detections() {
        let image = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        let stage = SegmentationStage::new(SegmentationConfig::default()).unwrap();
        assert_eq!(stage.segment(&image).num_detected, 0);
    }
}
