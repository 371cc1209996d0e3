//! Pipeline configuration: one optional section per stage.
//!
//! Missing sections and keys fall back to the defaults below. Typed
//! validation runs when a stage is constructed; [`ConfigValidator`] works on
//! the raw YAML tree and reports every problem at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{error, info, warn};

use crate::error::ConfigurationError;

pub const SECTIONS: [&str; 7] = [
    "acquisition",
    "preprocessing",
    "segmentation",
    "classification",
    "counting",
    "analytics",
    "export",
];

pub const MIN_MAGNIFICATION: f64 = 0.7;
pub const MAX_MAGNIFICATION: f64 = 4.5;

/// Allowed deviation of the ensemble weight sum from 1.0
pub const ENSEMBLE_WEIGHT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub acquisition: AcquisitionConfig,
    pub preprocessing: PreprocessingConfig,
    pub segmentation: SegmentationConfig,
    pub classification: ClassificationConfig,
    pub counting: CountingConfig,
    pub analytics: AnalyticsConfig,
    pub export: ExportConfig,
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigurationError> {
        // An empty document means "all defaults"
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.acquisition.validate()?;
        self.preprocessing.validate()?;
        self.segmentation.validate()?;
        self.classification.validate()?;
        self.counting.validate()?;
        self.analytics.validate()?;
        self.export.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub camera_type: String,
    pub sensor_pixel_size_um: f64,
    pub synthetic: SyntheticConfig,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            camera_type: "synthetic".to_string(),
            sensor_pixel_size_um: 1.55,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.sensor_pixel_size_um.is_finite() && self.sensor_pixel_size_um > 0.0) {
            return Err(ConfigurationError::invalid(
                "acquisition",
                format!("sensor_pixel_size_um must be positive, got {}", self.sensor_pixel_size_um),
            ));
        }
        let s = &self.synthetic;
        if s.width < 32 || s.height < 32 {
            return Err(ConfigurationError::invalid(
                "acquisition",
                "synthetic frame must be at least 32x32",
            ));
        }
        if s.min_organisms > s.max_organisms {
            return Err(ConfigurationError::invalid(
                "acquisition",
                "synthetic.min_organisms exceeds synthetic.max_organisms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub min_organisms: u32,
    pub max_organisms: u32,
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            min_organisms: 5,
            max_organisms: 20,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenoiseMethod {
    None,
    Gaussian,
    Bilateral,
    Nlm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub denoise_method: DenoiseMethod,
    pub background_correction: bool,
    pub background_kernel_radius: u32,
    pub background_offset: u8,
    pub normalize: bool,
    pub flatfield_correction: bool,
    pub illumination_profile: Option<PathBuf>,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            denoise_method: DenoiseMethod::Bilateral,
            background_correction: true,
            background_kernel_radius: 50,
            background_offset: 128,
            normalize: true,
            flatfield_correction: false,
            illumination_profile: None,
        }
    }
}

impl PreprocessingConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.background_correction && self.background_kernel_radius == 0 {
            return Err(ConfigurationError::invalid(
                "preprocessing",
                "background_kernel_radius must be positive",
            ));
        }
        if self.flatfield_correction && self.illumination_profile.is_none() {
            warn!("flatfield_correction enabled without illumination_profile; step will be skipped");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationMethod {
    Threshold,
    Watershed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub method: SegmentationMethod,
    pub min_area_px: u32,
    pub max_area_px: u32,
    /// Neighbourhood size of the adaptive threshold, odd
    pub block_size: u32,
    /// Constant subtracted from the local mean
    pub threshold_offset: i32,
    /// Share of the maximum distance that marks sure foreground
    pub foreground_fraction: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            method: SegmentationMethod::Watershed,
            min_area_px: 100,
            max_area_px: 50_000,
            block_size: 11,
            threshold_offset: 2,
            foreground_fraction: 0.3,
        }
    }
}

impl SegmentationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_area_px == 0 {
            return Err(ConfigurationError::invalid("segmentation", "min_area_px must be positive"));
        }
        if self.max_area_px < self.min_area_px {
            return Err(ConfigurationError::invalid(
                "segmentation",
                format!(
                    "max_area_px ({}) is smaller than min_area_px ({})",
                    self.max_area_px, self.min_area_px
                ),
            ));
        }
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(ConfigurationError::invalid(
                "segmentation",
                format!("block_size must be odd and at least 3, got {}", self.block_size),
            ));
        }
        if !(self.foreground_fraction > 0.0 && self.foreground_fraction < 1.0) {
            return Err(ConfigurationError::invalid(
                "segmentation",
                "foreground_fraction must lie in (0, 1)",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    Heuristic,
    Model,
    Ensemble,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMember {
    /// Trained model file; the heuristic model is used when absent
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub mode: ClassifierMode,
    pub class_names: Vec<String>,
    pub input_size: u32,
    pub crop_padding: u32,
    pub top_k: usize,
    pub model_path: Option<PathBuf>,
    pub ensemble: Vec<EnsembleMember>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::Heuristic,
            class_names: ["Copepod", "Diatom", "Dinoflagellate", "Ciliate", "Other"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            input_size: 64,
            crop_padding: 5,
            top_k: 3,
            model_path: None,
            ensemble: Vec::new(),
        }
    }
}

impl ClassificationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.class_names.is_empty() {
            return Err(ConfigurationError::invalid("classification", "class_names must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.class_names {
            if !seen.insert(name) {
                return Err(ConfigurationError::invalid(
                    "classification",
                    format!("duplicate class name `{}`", name),
                ));
            }
        }
        if self.top_k == 0 {
            return Err(ConfigurationError::invalid("classification", "top_k must be positive"));
        }
        if self.input_size == 0 {
            return Err(ConfigurationError::invalid("classification", "input_size must be positive"));
        }
        match self.mode {
            ClassifierMode::Heuristic => {}
            ClassifierMode::Model => {
                if self.model_path.is_none() {
                    return Err(ConfigurationError::invalid(
                        "classification",
                        "mode `model` requires model_path",
                    ));
                }
            }
            ClassifierMode::Ensemble => {
                if self.ensemble.len() != 2 {
                    return Err(ConfigurationError::invalid(
                        "classification",
                        format!("ensemble needs exactly 2 members, got {}", self.ensemble.len()),
                    ));
                }
                let weights: Vec<f64> = self.ensemble.iter().map(|m| m.weight).collect();
                check_ensemble_weights(&weights)
                    .map_err(|message| ConfigurationError::invalid("classification", message))?;
            }
        }
        Ok(())
    }
}

pub fn check_ensemble_weights(weights: &[f64]) -> Result<(), String> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err("ensemble weights must be non-negative numbers".to_string());
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > ENSEMBLE_WEIGHT_TOLERANCE {
        return Err(format!("ensemble weights must sum to 1.0, got {:.3}", sum));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub confidence_threshold: f64,
    pub size_range_um: [f64; 2],
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            size_range_um: [10.0, 1000.0],
        }
    }
}

impl CountingConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigurationError::invalid(
                "counting",
                format!("confidence_threshold must lie in [0, 1], got {}", self.confidence_threshold),
            ));
        }
        let [min, max] = self.size_range_um;
        if !(min >= 0.0 && min <= max) {
            return Err(ConfigurationError::invalid(
                "counting",
                format!("size_range_um [{}, {}] is not a valid range", min, max),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub compute_diversity: bool,
    pub compute_composition: bool,
    pub bloom_thresholds: BTreeMap<String, usize>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            compute_diversity: true,
            compute_composition: true,
            bloom_thresholds: BTreeMap::new(),
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some((name, _)) = self.bloom_thresholds.iter().find(|(_, t)| **t == 0) {
            return Err(ConfigurationError::invalid(
                "analytics",
                format!("bloom threshold for `{}` must be positive", name),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub write_summary: bool,
    pub write_organisms: bool,
    pub write_snapshot: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./results"),
            write_summary: true,
            write_organisms: true,
            write_snapshot: true,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::invalid("export", "output_dir must not be empty"));
        }
        Ok(())
    }
}

/// Outcome of [`ConfigValidator::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks the shape of a raw configuration tree before any stage is built.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_file<P: AsRef<Path>>(path: P) -> Result<ValidationReport, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let value: Value = serde_yaml::from_str(&contents)?;
        Ok(Self::validate(&value))
    }

    pub fn validate(config: &Value) -> ValidationReport {
        let mut report = ValidationReport::default();

        if !config.is_mapping() {
            report.errors.push("configuration root must be a mapping".to_string());
            Self::log(&report);
            return report;
        }

        for section in SECTIONS {
            match config.get(section) {
                None => report
                    .warnings
                    .push(format!("missing section `{}` (using defaults)", section)),
                Some(v) if !v.is_mapping() => {
                    report.errors.push(format!("section `{}` must be a mapping", section))
                }
                Some(_) => {}
            }
        }

        if let Some(acq) = config.get("acquisition").filter(|v| v.is_mapping()) {
            positive_number(acq, "acquisition", "sensor_pixel_size_um", &mut report);
        }

        if let Some(pre) = config.get("preprocessing").filter(|v| v.is_mapping()) {
            one_of(pre, "preprocessing", "denoise_method", &["none", "gaussian", "bilateral", "nlm"], &mut report);
            boolean(pre, "preprocessing", "background_correction", &mut report);
            boolean(pre, "preprocessing", "normalize", &mut report);
            boolean(pre, "preprocessing", "flatfield_correction", &mut report);
        }

        if let Some(seg) = config.get("segmentation").filter(|v| v.is_mapping()) {
            one_of(seg, "segmentation", "method", &["threshold", "watershed"], &mut report);
            let min = positive_number(seg, "segmentation", "min_area_px", &mut report);
            let max = positive_number(seg, "segmentation", "max_area_px", &mut report);
            if let (Some(min), Some(max)) = (min, max) {
                if max < min {
                    report
                        .errors
                        .push("segmentation.max_area_px must not be smaller than min_area_px".to_string());
                }
            }
        }

        match config.get("classification").filter(|v| v.is_mapping()) {
            Some(cls) => {
                match cls.get("class_names") {
                    None => report.errors.push("classification.class_names is required".to_string()),
                    Some(names) => match names.as_sequence() {
                        Some(seq) if seq.is_empty() => report
                            .errors
                            .push("classification.class_names must not be empty".to_string()),
                        Some(seq) if seq.iter().any(|n| n.as_str().is_none()) => report
                            .errors
                            .push("classification.class_names must contain only strings".to_string()),
                        Some(_) => {}
                        None => report
                            .errors
                            .push("classification.class_names must be a list".to_string()),
                    },
                }
                one_of(cls, "classification", "mode", &["heuristic", "model", "ensemble"], &mut report);
                positive_number(cls, "classification", "top_k", &mut report);
                if let Some(members) = cls.get("ensemble") {
                    match members.as_sequence() {
                        Some(seq) => {
                            let weights: Vec<f64> = seq
                                .iter()
                                .filter_map(|m| m.get("weight").and_then(Value::as_f64))
                                .collect();
                            if weights.len() != seq.len() {
                                report
                                    .errors
                                    .push("every classification.ensemble member needs a numeric weight".to_string());
                            } else if cls.get("mode").and_then(Value::as_str) == Some("ensemble") {
                                if let Err(message) = check_ensemble_weights(&weights) {
                                    report.errors.push(format!("classification.ensemble: {}", message));
                                }
                            }
                        }
                        None => report.errors.push("classification.ensemble must be a list".to_string()),
                    }
                }
            }
            None => {
                if config.get("classification").is_none() {
                    report.errors.push("classification.class_names is required".to_string());
                }
            }
        }

        if let Some(cnt) = config.get("counting").filter(|v| v.is_mapping()) {
            if let Some(t) = cnt.get("confidence_threshold") {
                match t.as_f64() {
                    Some(t) if (0.0..=1.0).contains(&t) => {}
                    _ => report
                        .errors
                        .push("counting.confidence_threshold must be a number in [0, 1]".to_string()),
                }
            }
            if let Some(range) = cnt.get("size_range_um") {
                let bounds: Option<Vec<f64>> = range
                    .as_sequence()
                    .map(|seq| seq.iter().filter_map(Value::as_f64).collect());
                match bounds {
                    Some(b) if b.len() == 2 && b[0] <= b[1] => {}
                    _ => report
                        .errors
                        .push("counting.size_range_um must be a [min, max] pair".to_string()),
                }
            }
        }

        if let Some(ana) = config.get("analytics").filter(|v| v.is_mapping()) {
            if let Some(thresholds) = ana.get("bloom_thresholds") {
                match thresholds.as_mapping() {
                    Some(map) => {
                        for (name, value) in map {
                            let name = name.as_str().unwrap_or("?");
                            if !matches!(value.as_u64(), Some(t) if t > 0) {
                                report.errors.push(format!(
                                    "analytics.bloom_thresholds.{} must be a positive integer",
                                    name
                                ));
                            }
                        }
                    }
                    None => report
                        .errors
                        .push("analytics.bloom_thresholds must be a mapping".to_string()),
                }
            }
        }

        if let Some(exp) = config.get("export").filter(|v| v.is_mapping()) {
            if let Some(dir) = exp.get("output_dir") {
                if dir.as_str().map_or(true, str::is_empty) {
                    report.errors.push("export.output_dir must be a non-empty string".to_string());
                }
            }
        }

        // Anything the typed config still rejects
        if report.errors.is_empty() {
            if let Err(e) = serde_yaml::from_value::<PipelineConfig>(config.clone()) {
                report.errors.push(format!("config does not deserialize: {}", e));
            }
        }

        Self::log(&report);
        report
    }

    fn log(report: &ValidationReport) {
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        if report.is_valid() {
            info!("Configuration validated successfully");
        } else {
            error!("Configuration validation failed:");
            for e in &report.errors {
                error!("  - {}", e);
            }
        }
    }
}

fn positive_number(section: &Value, name: &str, key: &str, report: &mut ValidationReport) -> Option<f64> {
    let value = section.get(key)?;
    match value.as_f64() {
        Some(v) if v > 0.0 => Some(v),
        _ => {
            report.errors.push(format!("{}.{} must be a positive number", name, key));
            None
        }
    }
}

fn boolean(section: &Value, name: &str, key: &str, report: &mut ValidationReport) {
    if let Some(value) = section.get(key) {
        if value.as_bool().is_none() {
            report.errors.push(format!("{}.{} must be true or false", name, key));
        }
    }
}

fn one_of(section: &Value, name: &str, key: &str, allowed: &[&str], report: &mut ValidationReport) {
    if let Some(value) = section.get(key) {
        match value.as_str() {
            Some(v) if allowed.contains(&v) => {}
            _ => report.errors.push(format!(
                "{}.{} must be one of {}",
                name,
                key,
                allowed.join(", ")
            )),
        }
    }
}
