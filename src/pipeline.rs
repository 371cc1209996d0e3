use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigurationError, PipelineFailure, StageError};
use crate::models::{HistoricalSample, PipelineResult, StageSummaries};
use crate::stages::acquisition::{AcquisitionParams, AcquisitionStage, FrameSource};
use crate::stages::analytics::{AnalyticsInput, AnalyticsStage};
use crate::stages::classification::{ClassificationInput, ClassificationStage, ProbabilityModel};
use crate::stages::counting::{CountingInput, CountingStage};
use crate::stages::export::{ExportInput, ExportStage};
use crate::stages::preprocessing::PreprocessingStage;
use crate::stages::segmentation::SegmentationStage;

/// The seven stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Acquisition,
    Preprocessing,
    Segmentation,
    Classification,
    Counting,
    Analytics,
    Export,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Acquisition,
        StageKind::Preprocessing,
        StageKind::Segmentation,
        StageKind::Classification,
        StageKind::Counting,
        StageKind::Analytics,
        StageKind::Export,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Acquisition => "acquisition",
            StageKind::Preprocessing => "preprocessing",
            StageKind::Segmentation => "segmentation",
            StageKind::Classification => "classification",
            StageKind::Counting => "counting",
            StageKind::Analytics => "analytics",
            StageKind::Export => "export",
        }
    }

    /// Human-readable name (used in the execution trace)
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Acquisition => "Image Acquisition",
            StageKind::Preprocessing => "Preprocessing",
            StageKind::Segmentation => "Segmentation",
            StageKind::Classification => "Classification",
            StageKind::Counting => "Counting & Sizing",
            StageKind::Analytics => "Analytics",
            StageKind::Export => "Export",
        }
    }

    pub fn index(&self) -> usize {
        StageKind::ALL.iter().position(|k| k == self).unwrap_or(0)
    }

    pub fn next(&self) -> Option<StageKind> {
        StageKind::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of a single pipeline run. Runs move strictly forward through the
/// stages and end in `Success` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running(StageKind),
    Success,
    Failed(StageKind),
}

impl PipelineState {
    pub fn initial() -> Self {
        PipelineState::Running(StageKind::Acquisition)
    }

    /// State after the current stage succeeded
    pub fn advance(self) -> Self {
        match self {
            PipelineState::Running(stage) => match stage.next() {
                Some(next) => PipelineState::Running(next),
                None => PipelineState::Success,
            },
            terminal => terminal,
        }
    }

    /// State after the current stage failed
    pub fn fail(self) -> Self {
        match self {
            PipelineState::Running(stage) => PipelineState::Failed(stage),
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Running(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Running(stage) => write!(f, "{}", stage),
            PipelineState::Success => write!(f, "success"),
            PipelineState::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

/// Debug configuration for pipeline execution
#[derive(Clone, Debug)]
pub struct DebugConfig {
    /// Root directory for debug outputs
    pub output_dir: PathBuf,
    /// Whether debug mode is enabled
    pub enabled: bool,
}

/// Reporting sink threaded through every stage call of one run.
///
/// Collects the human-readable execution trace and owns the optional debug
/// output directory. A fresh context is created for every run.
pub struct PipelineContext {
    pub verbose: bool,
    pub debug: Option<DebugConfig>,
    state: PipelineState,
    visited: Vec<PipelineState>,
    trace: Vec<String>,
    started: Instant,
}

impl PipelineContext {
    pub fn new(verbose: bool, debug: Option<DebugConfig>) -> Self {
        Self {
            verbose,
            debug,
            state: PipelineState::initial(),
            visited: vec![PipelineState::initial()],
            trace: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state the run has been in, in order
    pub fn visited(&self) -> &[PipelineState] {
        &self.visited
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Append a line to the execution trace
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        let line = format!("[{:>7.1} ms] {}", self.elapsed_ms(), message);
        if self.verbose {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
        self.trace.push(line);
    }

    fn transition(&mut self, next: PipelineState) {
        self.state = next;
        self.visited.push(next);
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Save an intermediate image when debug mode is on. Failures are
    /// logged and never abort the run.
    /// Whether debug images are written for this run
    pub fn debug_enabled(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.enabled)
    }

    pub fn save_debug_image(&self, stage: StageKind, file_stem: &str, image: &DynamicImage) {
        let Some(debug_config) = &self.debug else {
            return;
        };
        if !debug_config.enabled {
            return;
        }

        let step_dir_name = format!("{:02}_{}", stage.index(), stage.name());
        let step_dir = debug_config.output_dir.join(&step_dir_name);
        let output_path = step_dir.join(format!("{}.png", file_stem));

        let saved = std::fs::create_dir_all(&step_dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| image.save(&output_path).map_err(anyhow::Error::from));

        match saved {
            Ok(()) => debug!("Debug: saved {}/{}.png", step_dir_name, file_stem),
            Err(e) => warn!("Failed to save debug image {}: {}", output_path.display(), e),
        }
    }
}

/// Contract every stage implements.
///
/// `validate_input` checks the incoming record, `process` does the work.
/// Callers go through `run`, which does both, so a stage failure is always
/// an `Err` carrying the error kind and message.
pub trait Stage {
    type Input<'a>;
    type Output;

    fn kind(&self) -> StageKind;

    fn validate_input(&self, _input: &Self::Input<'_>) -> Result<(), StageError> {
        Ok(())
    }

    fn process(
        &self,
        input: Self::Input<'_>,
        context: &mut PipelineContext,
    ) -> Result<Self::Output, StageError>;

    fn run(
        &self,
        input: Self::Input<'_>,
        context: &mut PipelineContext,
    ) -> Result<Self::Output, StageError> {
        self.validate_input(&input)?;
        self.process(input, context)
    }
}

/// Runs one stage, moving the state machine forward or into `Failed`.
fn step<S: Stage>(
    stage: &S,
    input: S::Input<'_>,
    context: &mut PipelineContext,
) -> Result<S::Output, PipelineFailure> {
    let kind = stage.kind();
    context.record(format!("[{}/7] {}", kind.index() + 1, kind.label()));
    let started = Instant::now();

    match stage.run(input, context) {
        Ok(output) => {
            context.record(format!(
                "{} finished in {:.1} ms",
                kind.label(),
                started.elapsed().as_secs_f64() * 1000.0
            ));
            let next = context.state().advance();
            context.transition(next);
            Ok(output)
        }
        Err(err) => {
            let failed = context.state().fail();
            context.transition(failed);
            error!("Pipeline failed at stage: {}", kind);
            error!("Error: {}", err);
            context.record(format!("{} -> {}: {}", kind.label(), failed, err));
            Err(PipelineFailure {
                stage: kind,
                kind: err.kind(),
                message: err.to_string(),
                trace: context.trace().to_vec(),
            })
        }
    }
}

/// Orchestrates the seven stages.
///
/// Stages are built once from configuration; each call to
/// [`Pipeline::execute_pipeline`] is independent of every other call.
pub struct Pipeline {
    config: PipelineConfig,
    acquisition: AcquisitionStage,
    preprocessing: PreprocessingStage,
    segmentation: SegmentationStage,
    classification: ClassificationStage,
    counting: CountingStage,
    analytics: AnalyticsStage,
    export: ExportStage,
    verbose: bool,
    debug: Option<DebugConfig>,
}

impl Pipeline {
    /// Build every stage from `config`.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigurationError> {
        info!("Initializing pipeline stages...");
        config.validate()?;

        let pipeline = Self {
            acquisition: AcquisitionStage::new(config.acquisition.clone())?,
            preprocessing: PreprocessingStage::new(config.preprocessing.clone())?,
            segmentation: SegmentationStage::new(config.segmentation.clone())?,
            classification: ClassificationStage::new(&config.classification)?,
            counting: CountingStage::new(config.counting.clone())?,
            analytics: AnalyticsStage::new(config.analytics.clone())?,
            export: ExportStage::new(config.export.clone())?,
            config,
            verbose: false,
            debug: None,
        };

        info!("All stages initialized successfully");
        Ok(pipeline)
    }

    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        Self::new(PipelineConfig::load(path)?)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Enable verbose output
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enable debug mode with output directory
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        if output_dir.exists() {
            let entries = std::fs::read_dir(&output_dir)?;
            if entries.count() > 0 {
                return Err(anyhow::anyhow!(
                    "Debug directory is not empty: {}",
                    output_dir.display()
                ));
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.debug = Some(DebugConfig {
            output_dir,
            enabled: true,
        });

        Ok(self)
    }

    /// Replace the configured classifier model
    pub fn with_model(mut self, model: Box<dyn ProbabilityModel>) -> Result<Self, ConfigurationError> {
        self.classification = ClassificationStage::with_model(&self.config.classification, model)?;
        Ok(self)
    }

    /// Attach the frame source used by `camera` captures
    pub fn with_camera(mut self, source: Box<dyn FrameSource>) -> Self {
        self.acquisition = self.acquisition.with_camera(source);
        self
    }

    pub fn execute_pipeline(&self, params: &AcquisitionParams) -> Result<PipelineResult, PipelineFailure> {
        self.execute_pipeline_with_history(params, &[])
    }

    /// Run all stages. `history` holds earlier samples, oldest first; trends
    /// compare against the last one only.
    pub fn execute_pipeline_with_history(
        &self,
        params: &AcquisitionParams,
        history: &[HistoricalSample],
    ) -> Result<PipelineResult, PipelineFailure> {
        let mut context = PipelineContext::new(self.verbose, self.debug.clone());
        self.run_stages(params, history, &mut context)
    }

    fn run_stages(
        &self,
        params: &AcquisitionParams,
        history: &[HistoricalSample],
        context: &mut PipelineContext,
    ) -> Result<PipelineResult, PipelineFailure> {
        info!("Starting pipeline execution ({:?} mode)", params.mode);

        let raw = step(&self.acquisition, params, context)?;
        let capture_id = raw.metadata.capture_id.clone();
        if context.debug_enabled() {
            context.save_debug_image(
                StageKind::Acquisition,
                &capture_id,
                &DynamicImage::ImageRgb8(raw.image.clone()),
            );
        }

        let preprocessed = step(&self.preprocessing, &raw, context)?;
        if context.debug_enabled() {
            context.save_debug_image(
                StageKind::Preprocessing,
                &capture_id,
                &DynamicImage::ImageRgb8(preprocessed.image.clone()),
            );
        }

        let segmentation = step(&self.segmentation, &preprocessed, context)?;
        if context.debug_enabled() {
            let union = crate::stages::segmentation::mask_union(
                &segmentation,
                preprocessed.image.width(),
                preprocessed.image.height(),
            );
            context.save_debug_image(StageKind::Segmentation, &capture_id, &DynamicImage::ImageLuma8(union));
        }

        let classification = step(
            &self.classification,
            ClassificationInput {
                image: &preprocessed.image,
                segmentation: &segmentation,
            },
            context,
        )?;

        let counting = step(
            &self.counting,
            CountingInput {
                predictions: &classification.predictions,
                segmentation: &segmentation,
                metadata: &raw.metadata,
            },
            context,
        )?;

        let analytics = step(
            &self.analytics,
            AnalyticsInput {
                counts_by_class: &counting.counts_by_class,
                history,
            },
            context,
        )?;

        let export = step(
            &self.export,
            ExportInput {
                metadata: &raw.metadata,
                counting: &counting,
                analytics: &analytics,
            },
            context,
        )?;

        context.record(format!(
            "Pipeline execution complete: {} organisms, {} classes, {} bloom alert(s)",
            counting.total_count,
            counting.counts_by_class.len(),
            analytics.bloom_alerts.len()
        ));
        if let Some(diversity) = &analytics.diversity {
            context.record(format!(
                "Species richness: {}, Shannon diversity: {:.3}",
                diversity.species_richness, diversity.shannon
            ));
        }
        if let Some(first) = export.exported_files.first() {
            context.record(format!("Results exported to: {}", first));
        }

        Ok(PipelineResult {
            metadata: raw.metadata.clone(),
            counts_by_class: counting.counts_by_class.clone(),
            total_count: counting.total_count,
            organisms: counting.organisms.clone(),
            size_distribution: counting.size_distribution.clone(),
            diversity: analytics.diversity,
            composition: analytics.composition.clone(),
            bloom_alerts: analytics.bloom_alerts.clone(),
            trends: analytics.trends.clone(),
            exported_files: export.exported_files,
            stages: StageSummaries {
                preprocessing: preprocessed.stats,
                num_detected: segmentation.num_detected,
                model: classification.model.clone(),
            },
            trace: context.trace().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_walks_all_stages() {
        let mut state = PipelineState::initial();
        let mut seen = vec![state];
        while !state.is_terminal() {
            state = state.advance();
            seen.push(state);
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[6], PipelineState::Running(StageKind::Export));
        assert_eq!(seen[7], PipelineState::Success);
    }

    #[test]
    fn test_failure_names_the_stage() {
        let state = PipelineState::Running(StageKind::Segmentation).fail();
        assert_eq!(state, PipelineState::Failed(StageKind::Segmentation));
        assert_eq!(state.to_string(), "failed(segmentation)");
        // terminal states stay put
        assert_eq!(state.advance(), state);
    }

    #[test]
    fn test_context_records_trace() {
        let mut context = PipelineContext::new(false, None);
        context.record("hello");
        assert_eq!(context.trace().len(), 1);
        assert!(context.trace()[0].ends_with("hello"));
    }

    #[test]
    fn test_debug_images_only_with_enabled_config() {
        assert!(!PipelineContext::new(false, None).debug_enabled());
        let disabled = DebugConfig { output_dir: PathBuf::from("unused"), enabled: false };
        assert!(!PipelineContext::new(false, Some(disabled)).debug_enabled());
        let enabled = DebugConfig { output_dir: PathBuf::from("unused"), enabled: true };
        assert!(PipelineContext::new(false, Some(enabled)).debug_enabled());
    }
}
