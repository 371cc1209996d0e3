//! Stage 5: filter predictions into organisms, count and size them.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use tracing::{debug, info};

use crate::config::CountingConfig;
use crate::error::{ConfigurationError, StageError};
use crate::models::{CaptureMetadata, CountingOutput, Organism, Prediction, SegmentationOutput, SizeDistribution};
use crate::pipeline::{PipelineContext, Stage, StageKind};

pub const HISTOGRAM_BINS: usize = 10;

/// Diameter of the circle with the same area, in micrometres
pub fn equivalent_diameter_um(area_px: u32, resolution_um_per_px: f64) -> f64 {
    2.0 * (area_px as f64 / PI).sqrt() * resolution_um_per_px
}

/// Counts over `HISTOGRAM_BINS` equal bins spanning the sample range. A
/// sample without spread gets a unit-wide range around its value.
pub fn histogram(values: &[f64]) -> Vec<u32> {
    let mut bins = vec![0u32; HISTOGRAM_BINS];
    if values.is_empty() {
        return bins;
    }
    let mut min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let mut max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        min -= 0.5;
        max += 0.5;
    }
    let width = (max - min) / HISTOGRAM_BINS as f64;
    for &v in values {
        // the right edge belongs to the last bin
        let index = (((v - min) / width) as usize).min(HISTOGRAM_BINS - 1);
        bins[index] += 1;
    }
    bins
}

pub fn size_distribution(sizes: &[f64]) -> Option<SizeDistribution> {
    if sizes.is_empty() {
        return None;
    }
    let n = sizes.len() as f64;
    let mean = sizes.iter().sum::<f64>() / n;
    let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Some(SizeDistribution {
        mean_um: mean,
        std_um: variance.sqrt(),
        min_um: sizes.iter().copied().fold(f64::INFINITY, f64::min),
        max_um: sizes.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        histogram: histogram(sizes),
    })
}

pub struct CountingInput<'a> {
    pub predictions: &'a [Prediction],
    pub segmentation: &'a SegmentationOutput,
    pub metadata: &'a CaptureMetadata,
}

pub struct CountingStage {
    config: CountingConfig,
}

impl CountingStage {
    pub fn new(config: CountingConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        info!(
            "Counting stage initialized (confidence >= {}, size {:?} um)",
            config.confidence_threshold, config.size_range_um
        );
        Ok(Self { config })
    }

    pub fn count(&self, input: &CountingInput<'_>) -> CountingOutput {
        let resolution = input.metadata.resolution_um_per_px;
        let [min_size, max_size] = self.config.size_range_um;

        let mut organisms = Vec::new();
        for (prediction, detection) in input.predictions.iter().zip(&input.segmentation.detections) {
            if prediction.confidence < self.config.confidence_threshold {
                continue;
            }
            let size_um = equivalent_diameter_um(detection.area_px, resolution);
            if size_um < min_size || size_um > max_size {
                debug!(
                    "Organism {} dropped: {:.1} um outside [{}, {}]",
                    prediction.organism_index, size_um, min_size, max_size
                );
                continue;
            }
            let (cx, cy) = detection.centroid;
            organisms.push(Organism {
                organism_id: organisms.len(),
                class_name: prediction.class_name.clone(),
                confidence: prediction.confidence,
                size_um,
                area_px: detection.area_px,
                bbox: detection.bbox,
                centroid_px: detection.centroid,
                centroid_um: (cx as f64 * resolution, cy as f64 * resolution),
            });
        }

        let mut counts_by_class: BTreeMap<String, usize> = BTreeMap::new();
        let mut sizes_by_class: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for organism in &organisms {
            *counts_by_class.entry(organism.class_name.clone()).or_default() += 1;
            sizes_by_class
                .entry(organism.class_name.clone())
                .or_default()
                .push(organism.size_um);
        }

        let size_distribution = sizes_by_class
            .into_iter()
            .filter_map(|(class, sizes)| size_distribution(&sizes).map(|d| (class, d)))
            .collect();

        CountingOutput {
            counts_by_class,
            total_count: organisms.len(),
            size_distribution,
            organisms,
        }
    }
}

impl Stage for CountingStage {
    type Input<'a> = CountingInput<'a>;
    type Output = CountingOutput;

    fn kind(&self) -> StageKind {
        StageKind::Counting
    }

    fn validate_input(&self, input: &CountingInput<'_>) -> Result<(), StageError> {
        let segmentation = input.segmentation;
        if !segmentation.is_consistent() {
            return Err(StageError::validation("segmentation detection count is inconsistent"));
        }
        if input.predictions.len() != segmentation.detections.len() {
            return Err(StageError::validation(format!(
                "{} predictions for {} detections",
                input.predictions.len(),
                segmentation.detections.len()
            )));
        }
        if let Some((i, p)) = input
            .predictions
            .iter()
            .enumerate()
            .find(|(i, p)| p.organism_index != *i)
        {
            return Err(StageError::validation(format!(
                "prediction {} refers to organism {}",
                i, p.organism_index
            )));
        }
        let resolution = input.metadata.resolution_um_per_px;
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(StageError::validation(format!("invalid resolution {} um/px", resolution)));
        }
        Ok(())
    }

    fn process(&self, input: CountingInput<'_>, context: &mut PipelineContext) -> Result<CountingOutput, StageError> {
        let output = self.count(&input);
        context.record(format!(
            "Counted {} organism(s) in {} class(es)",
            output.total_count,
            output.counts_by_class.len()
        ));
        for (class, count) in &output.counts_by_class {
            context.record(format!("  {}: {}", class, count));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AcquisitionMode, BoundingBox, Detection, RankedClass, RegionMask};

    fn metadata(resolution: f64) -> CaptureMetadata {
        CaptureMetadata {
            capture_id: "test".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            gps: None,
            magnification: 1.0,
            exposure_ms: 100,
            focus_position: None,
            resolution_um_per_px: resolution,
            fov_mm: [1.0, 1.0],
            operator_id: None,
            mode: AcquisitionMode::Synthetic,
        }
    }

    fn detection(area_px: u32) -> Detection {
        let bbox = BoundingBox { x: 10, y: 20, width: 5, height: 5 };
        Detection { mask: RegionMask::new(100, 100, bbox), bbox, centroid: (12, 22), area_px }
    }

    fn prediction(index: usize, class: &str, confidence: f64) -> Prediction {
        Prediction {
            organism_index: index,
            class_name: class.into(),
            confidence,
            top_k: vec![RankedClass { class_name: class.into(), score: confidence }],
        }
    }

    fn stage() -> CountingStage {
        CountingStage::new(CountingConfig::default()).unwrap()
    }

    #[test]
    fn test_equivalent_diameter() {
        // a 30 px radius disc at 0.775 um/px
        let area = (PI * 900.0).round() as u32;
        assert!((equivalent_diameter_um(area, 0.775) - 46.5).abs() < 0.05);
    }

    #[test]
    fn test_filters_confidence_and_size() {
        let segmentation = SegmentationOutput::new(vec![detection(2000), detection(2000), detection(1)]);
        let predictions = vec![
            prediction(0, "Diatom", 0.9),
            prediction(1, "Diatom", 0.5),
            prediction(2, "Copepod", 0.95),
        ];
        let meta = metadata(1.0);
        let output = stage().count(&CountingInput {
            predictions: &predictions,
            segmentation: &segmentation,
            metadata: &meta,
        });

        assert_eq!(output.total_count, 1);
        assert_eq!(output.counts_by_class.get("Diatom"), Some(&1));
        assert!(!output.counts_by_class.contains_key("Copepod"));
        assert_eq!(output.organisms[0].organism_id, 0);
        assert_eq!(output.organisms[0].centroid_um, (12.0, 22.0));
        assert_eq!(output.size_distribution["Diatom"].histogram.iter().sum::<u32>(), 1);
    }

    #[test]
    fn test_misaligned_predictions_rejected() {
        let segmentation = SegmentationOutput::new(vec![detection(2000)]);
        let predictions = vec![prediction(0, "Diatom", 0.9), prediction(1, "Diatom", 0.9)];
        let meta = metadata(1.0);
        let mut context = PipelineContext::new(false, None);
        let err = stage()
            .run(
                CountingInput { predictions: &predictions, segmentation: &segmentation, metadata: &meta },
                &mut context,
            )
            .unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
    }

    #[test]
    fn test_histogram_edges() {
        let h = histogram(&[0.0, 5.0, 10.0]);
        assert_eq!(h[0], 1);
        assert_eq!(h[5], 1);
        assert_eq!(h[9], 1);
        assert_eq!(histogram(&[7.0, 7.0]).iter().sum::<u32>(), 2);
    }

    #[test]
    fn test_size_distribution_population_std() {
        let d = size_distribution(&[10.0, 20.0]).unwrap();
        assert_eq!(d.mean_um, 15.0);
        assert_eq!(d.std_um, 5.0);
        assert_eq!((d.min_um, d.max_um), (10.0, 20.0));
    }
}
