//! Stage 4: assign a class and confidence to every detection.

mod ensemble;
mod heuristic;
mod linear;

use std::time::Instant;

use anyhow::Result;
use image::RgbImage;
use image::imageops::{self, FilterType};
use tracing::{debug, info};

pub use ensemble::EnsembleModel;
pub use heuristic::HeuristicModel;
pub use linear::{FEATURE_NAMES, LinearModel, crop_features};

use crate::config::{ClassificationConfig, ClassifierMode};
use crate::error::{ConfigurationError, StageError};
use crate::models::{ClassificationOutput, ModelInfo, Prediction, RankedClass, SegmentationOutput};
use crate::pipeline::{PipelineContext, Stage, StageKind};

/// A classifier that turns an organism crop into one probability per class.
///
/// Implementations receive the padded crop at its native size and resize it
/// themselves. The returned vector is aligned with [`class_names`].
///
/// [`class_names`]: ProbabilityModel::class_names
pub trait ProbabilityModel: Send + Sync {
    fn name(&self) -> &str;
    fn class_names(&self) -> &[String];
    /// Side length of the square input the model works on
    fn input_size(&self) -> u32;
    fn predict(&self, crop: &RgbImage) -> Result<Vec<f64>>;
}

/// Resize a crop to the model's square input
pub fn prepare_input(crop: &RgbImage, size: u32) -> RgbImage {
    imageops::resize(crop, size, size, FilterType::Triangle)
}

pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Build the model described by `config`
pub fn load_model(config: &ClassificationConfig) -> Result<Box<dyn ProbabilityModel>, ConfigurationError> {
    let load = |path: &std::path::Path| -> Result<Box<dyn ProbabilityModel>, ConfigurationError> {
        let model = LinearModel::load(path)
            .map_err(|e| ConfigurationError::invalid("classification", format!("{:#}", e)))?;
        Ok(Box::new(model))
    };

    match config.mode {
        ClassifierMode::Heuristic => Ok(Box::new(HeuristicModel::new(
            config.class_names.clone(),
            config.input_size,
        ))),
        ClassifierMode::Model => {
            let path = config.model_path.as_deref().ok_or_else(|| {
                ConfigurationError::invalid("classification", "mode `model` requires model_path")
            })?;
            load(path)
        }
        ClassifierMode::Ensemble => {
            let mut members = Vec::with_capacity(config.ensemble.len());
            for member in &config.ensemble {
                let model = match &member.model_path {
                    Some(path) => load(path)?,
                    None => Box::new(HeuristicModel::new(config.class_names.clone(), config.input_size)),
                };
                members.push((model, member.weight));
            }
            Ok(Box::new(EnsembleModel::new(members)?))
        }
    }
}

pub struct ClassificationInput<'a> {
    pub image: &'a RgbImage,
    pub segmentation: &'a SegmentationOutput,
}

pub struct ClassificationStage {
    model: Box<dyn ProbabilityModel>,
    class_names: Vec<String>,
    crop_padding: u32,
    top_k: usize,
}

impl ClassificationStage {
    pub fn new(config: &ClassificationConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let model = load_model(config)?;
        Self::with_model(config, model)
    }

    /// Use an already built model. Its vocabulary must equal the
    /// configured class names, in order.
    pub fn with_model(
        config: &ClassificationConfig,
        model: Box<dyn ProbabilityModel>,
    ) -> Result<Self, ConfigurationError> {
        if model.class_names() != config.class_names.as_slice() {
            return Err(ConfigurationError::invalid(
                "classification",
                format!(
                    "model `{}` classes {:?} do not match configured class_names {:?}",
                    model.name(),
                    model.class_names(),
                    config.class_names
                ),
            ));
        }
        info!(
            "Classification stage initialized (model: {}, {} classes, top-{})",
            model.name(),
            config.class_names.len(),
            config.top_k
        );
        Ok(Self {
            model,
            class_names: config.class_names.clone(),
            crop_padding: config.crop_padding,
            top_k: config.top_k,
        })
    }

    fn rank(&self, organism_index: usize, probabilities: &[f64]) -> Prediction {
        let mut ranked: Vec<RankedClass> = self
            .class_names
            .iter()
            .zip(probabilities)
            .map(|(name, &score)| RankedClass {
                class_name: name.clone(),
                score,
            })
            .collect();
        // stable: ties keep vocabulary order
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.top_k.min(self.class_names.len()));

        let best = ranked[0].clone();
        Prediction {
            organism_index,
            class_name: best.class_name,
            confidence: best.score,
            top_k: ranked,
        }
    }

    fn classify_crop(&self, crop: Option<RgbImage>) -> Result<Vec<f64>, StageError> {
        let n = self.class_names.len();
        let Some(crop) = crop else {
            // nothing to look at: no class is preferred
            return Ok(vec![1.0 / n as f64; n]);
        };

        let probabilities = self.model.predict(&crop)?;
        if probabilities.len() != n {
            return Err(StageError::processing(format!(
                "model `{}` returned {} scores for {} classes",
                self.model.name(),
                probabilities.len(),
                n
            )));
        }
        if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0 + 1e-9) {
            return Err(StageError::processing(format!(
                "model `{}` returned scores outside [0, 1]",
                self.model.name()
            )));
        }
        Ok(probabilities.into_iter().map(|p| p.min(1.0)).collect())
    }
}

/// Padded crop of the box, or `None` when it is empty or outside the image
pub fn extract_crop(image: &RgbImage, bbox: &crate::models::BoundingBox, padding: u32) -> Option<RgbImage> {
    let padded = bbox.padded(padding, image.width(), image.height())?;
    let crop = imageops::crop_imm(image, padded.x, padded.y, padded.width, padded.height).to_image();
    (crop.width() > 0 && crop.height() > 0).then_some(crop)
}

impl Stage for ClassificationStage {
    type Input<'a> = ClassificationInput<'a>;
    type Output = ClassificationOutput;

    fn kind(&self) -> StageKind {
        StageKind::Classification
    }

    fn validate_input(&self, input: &ClassificationInput<'_>) -> Result<(), StageError> {
        if !input.segmentation.is_consistent() {
            return Err(StageError::validation(format!(
                "num_detected is {} but {} detections were passed",
                input.segmentation.num_detected,
                input.segmentation.detections.len()
            )));
        }
        if input.image.width() == 0 || input.image.height() == 0 {
            return Err(StageError::validation("input image is empty"));
        }
        Ok(())
    }

    fn process(
        &self,
        input: ClassificationInput<'_>,
        context: &mut PipelineContext,
    ) -> Result<ClassificationOutput, StageError> {
        let started = Instant::now();
        let mut predictions = Vec::with_capacity(input.segmentation.num_detected);

        for (i, detection) in input.segmentation.detections.iter().enumerate() {
            let crop = extract_crop(input.image, &detection.bbox, self.crop_padding);
            let probabilities = self.classify_crop(crop)?;
            let prediction = self.rank(i, &probabilities);
            debug!(
                "Organism {}: {} ({:.3})",
                i, prediction.class_name, prediction.confidence
            );
            predictions.push(prediction);
        }

        let model = ModelInfo {
            name: self.model.name().to_string(),
            input_size: self.model.input_size(),
            inference_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        context.record(format!(
            "Classified {} organism(s) with {} in {:.1} ms",
            predictions.len(),
            model.name,
            model.inference_time_ms
        ));

        Ok(ClassificationOutput { predictions, model })
    }
}
