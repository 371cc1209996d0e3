mod common;

use std::io::Write;

use anyhow::Result;
use common::*;
use plankton_pipeline::{ConfigValidator, ConfigurationError};

fn write_yaml(contents: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file)
}

const FULL_CONFIG: &str = r#"
acquisition:
  camera_type: synthetic
  sensor_pixel_size_um: 1.55
  synthetic:
    width: 256
    height: 256
    seed: 3
preprocessing:
  denoise_method: gaussian
  background_kernel_radius: 25
segmentation:
  method: threshold
  min_area_px: 20
  max_area_px: 8000
classification:
  class_names: [Copepod, Diatom, Dinoflagellate, Ciliate, Other]
  top_k: 2
counting:
  confidence_threshold: 0.6
  size_range_um: [5.0, 500.0]
analytics:
  bloom_thresholds:
    Diatom: 200
export:
  output_dir: ./out
"#;

#[test]
fn test_load_full_config() -> Result<()> {
    let file = write_yaml(FULL_CONFIG)?;
    let config = PipelineConfig::load(file.path())?;

    assert_eq!(config.acquisition.synthetic.width, 256);
    assert_eq!(config.preprocessing.denoise_method, DenoiseMethod::Gaussian);
    assert_eq!(config.segmentation.method, SegmentationMethod::Threshold);
    assert_eq!(config.classification.top_k, 2);
    assert_eq!(config.counting.size_range_um, [5.0, 500.0]);
    assert_eq!(config.analytics.bloom_thresholds.get("Diatom"), Some(&200));
    // untouched keys keep their defaults
    assert!(config.preprocessing.normalize);

    let report = ConfigValidator::validate_file(file.path())?;
    assert!(report.is_valid(), "{:?}", report.errors);
    assert!(report.warnings.is_empty());
    Ok(())
}

#[test]
fn test_invalid_section_blocks_construction() -> Result<()> {
    let mut config = PipelineConfig::default();
    config.segmentation.min_area_px = 500;
    config.segmentation.max_area_px = 100;

    match Pipeline::new(config) {
        Err(ConfigurationError::Invalid { section, .. }) => assert_eq!(section, "segmentation"),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("pipeline built from invalid config"),
    }
    Ok(())
}

#[test]
fn test_missing_model_file_is_configuration_error() {
    let mut config = PipelineConfig::default();
    config.classification.mode = plankton_pipeline::config::ClassifierMode::Model;
    config.classification.model_path = Some("/nonexistent/model.json".into());
    assert!(matches!(Pipeline::new(config), Err(ConfigurationError::Invalid { .. })));
}

#[test]
fn test_malformed_yaml_is_parse_error() -> Result<()> {
    let file = write_yaml("segmentation: [unclosed")?;
    assert!(matches!(PipelineConfig::load(file.path()), Err(ConfigurationError::Parse(_))));
    assert!(matches!(
        PipelineConfig::load("/nonexistent/config.yaml"),
        Err(ConfigurationError::Read { .. })
    ));
    Ok(())
}

#[test]
fn test_validator_collects_problems() -> Result<()> {
    let file = write_yaml(
        r#"
segmentation:
  method: magic
classification:
  mode: ensemble
  class_names: [A, B]
  ensemble:
    - weight: 0.8
    - weight: 0.8
"#,
    )?;
    let report = ConfigValidator::validate_file(file.path())?;

    assert!(!report.is_valid());
    assert!(report.errors.iter().any(|e| e.contains("segmentation.method")));
    assert!(report.errors.iter().any(|e| e.contains("ensemble")));
    assert!(report.warnings.iter().any(|w| w.contains("export")));
    Ok(())
}
