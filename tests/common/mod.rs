mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from plankton_pipeline for tests
pub use plankton_pipeline::config::{DenoiseMethod, PipelineConfig, SegmentationMethod};
pub use plankton_pipeline::models::{AcquisitionMode, HistoricalSample, Severity};
pub use plankton_pipeline::{AcquisitionParams, ErrorKind, Pipeline, StageKind};
