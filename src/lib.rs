pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stages;

pub use config::{ConfigValidator, PipelineConfig, ValidationReport};
pub use error::{ConfigurationError, ErrorKind, PipelineFailure, StageError};
pub use models::{HistoricalSample, PipelineResult};
pub use pipeline::{DebugConfig, Pipeline, PipelineContext, PipelineState, Stage, StageKind};
pub use stages::{AcquisitionParams, FrameRequest, FrameSource, ProbabilityModel};
