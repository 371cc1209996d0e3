//! Stage 7: persist the run as CSV tables and a JSON snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ExportConfig;
use crate::error::{ConfigurationError, StageError};
use crate::models::{
    AnalyticsOutput, BloomAlert, CaptureMetadata, ClassTrend, CountingOutput, DiversityIndices, ExportOutput,
    HistoricalSample, Organism, SizeDistribution,
};
use crate::pipeline::{PipelineContext, Stage, StageKind};

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    sample_id: &'a str,
    timestamp: &'a str,
    gps_lat: Option<f64>,
    gps_lon: Option<f64>,
    magnification: f64,
    class_name: &'a str,
    count: usize,
    mean_size_um: Option<f64>,
    shannon_diversity: Option<f64>,
    bloom_alert: bool,
}

#[derive(Debug, Serialize)]
struct OrganismRow<'a> {
    sample_id: &'a str,
    organism_id: usize,
    class_name: &'a str,
    confidence: f64,
    size_um: f64,
    centroid_x_px: u32,
    centroid_y_px: u32,
    centroid_x_um: f64,
    centroid_y_um: f64,
    area_px: u32,
}

/// Everything a later run needs for trend analysis, and a full record of
/// this one.
#[derive(Debug, Serialize)]
struct Snapshot<'a> {
    metadata: &'a CaptureMetadata,
    counts_by_class: &'a BTreeMap<String, usize>,
    total_count: usize,
    size_distribution: &'a BTreeMap<String, SizeDistribution>,
    organisms: &'a [Organism],
    diversity: &'a Option<DiversityIndices>,
    composition: &'a Option<BTreeMap<String, f64>>,
    bloom_alerts: &'a [BloomAlert],
    trends: &'a Option<BTreeMap<String, ClassTrend>>,
}

pub struct ExportInput<'a> {
    pub metadata: &'a CaptureMetadata,
    pub counting: &'a CountingOutput,
    pub analytics: &'a AnalyticsOutput,
}

/// Read earlier JSON snapshots, in the given order
pub fn load_history<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<HistoricalSample>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Failed to parse snapshot {}", path.display()))
        })
        .collect()
}

pub struct ExportStage {
    config: ExportConfig,
}

impl ExportStage {
    pub fn new(config: ExportConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        info!("Export stage initialized (output: {})", config.output_dir.display());
        Ok(Self { config })
    }

    fn write_summary(&self, path: &Path, input: &ExportInput<'_>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let meta = input.metadata;
        let analytics = input.analytics;
        for (class_name, &count) in &input.counting.counts_by_class {
            writer.serialize(SummaryRow {
                sample_id: &meta.capture_id,
                timestamp: &meta.timestamp,
                gps_lat: meta.gps.map(|g| g.lat),
                gps_lon: meta.gps.map(|g| g.lon),
                magnification: meta.magnification,
                class_name,
                count,
                mean_size_um: input.counting.size_distribution.get(class_name).map(|d| d.mean_um),
                shannon_diversity: analytics.diversity.map(|d| d.shannon),
                bloom_alert: analytics.bloom_alerts.iter().any(|a| &a.class_name == class_name),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_organisms(&self, path: &Path, input: &ExportInput<'_>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for o in &input.counting.organisms {
            writer.serialize(OrganismRow {
                sample_id: &input.metadata.capture_id,
                organism_id: o.organism_id,
                class_name: &o.class_name,
                confidence: o.confidence,
                size_um: o.size_um,
                centroid_x_px: o.centroid_px.0,
                centroid_y_px: o.centroid_px.1,
                centroid_x_um: o.centroid_um.0,
                centroid_y_um: o.centroid_um.1,
                area_px: o.area_px,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_snapshot(&self, path: &Path, input: &ExportInput<'_>) -> Result<()> {
        let counting = input.counting;
        let analytics = input.analytics;
        let snapshot = Snapshot {
            metadata: input.metadata,
            counts_by_class: &counting.counts_by_class,
            total_count: counting.total_count,
            size_distribution: &counting.size_distribution,
            organisms: &counting.organisms,
            diversity: &analytics.diversity,
            composition: &analytics.composition,
            bloom_alerts: &analytics.bloom_alerts,
            trends: &analytics.trends,
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

type Writer = fn(&ExportStage, &Path, &ExportInput<'_>) -> Result<()>;

impl Stage for ExportStage {
    type Input<'a> = ExportInput<'a>;
    type Output = ExportOutput;

    fn kind(&self) -> StageKind {
        StageKind::Export
    }

    fn process(&self, input: ExportInput<'_>, context: &mut PipelineContext) -> Result<ExportOutput, StageError> {
        let dir = &self.config.output_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            StageError::processing(format!("cannot create output directory {}: {}", dir.display(), e))
        })?;

        let id = &input.metadata.capture_id;
        let planned: [(bool, PathBuf, Writer); 3] = [
            (
                self.config.write_summary,
                dir.join(format!("summary_{}.csv", id)),
                ExportStage::write_summary,
            ),
            (
                self.config.write_organisms,
                dir.join(format!("organisms_{}.csv", id)),
                ExportStage::write_organisms,
            ),
            (
                self.config.write_snapshot,
                dir.join(format!("results_{}.json", id)),
                ExportStage::write_snapshot,
            ),
        ];

        let mut exported_files = Vec::new();
        for (enabled, path, write) in planned {
            if !enabled {
                continue;
            }
            match write(self, &path, &input) {
                Ok(()) => exported_files.push(path.display().to_string()),
                Err(e) => warn!("Failed to write {}: {:#}", path.display(), e),
            }
        }

        context.record(format!("Exported {} file(s) to {}", exported_files.len(), dir.display()));
        Ok(ExportOutput { exported_files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AcquisitionMode;

    fn metadata() -> CaptureMetadata {
        CaptureMetadata {
            capture_id: "abc".into(),
            timestamp: "2024-05-01T12:00:00Z".into(),
            gps: None,
            magnification: 2.0,
            exposure_ms: 100,
            focus_position: None,
            resolution_um_per_px: 0.775,
            fov_mm: [0.8, 0.8],
            operator_id: Some("op".into()),
            mode: AcquisitionMode::Synthetic,
        }
    }

    fn counting() -> CountingOutput {
        CountingOutput {
            counts_by_class: [("Diatom".to_string(), 3)].into_iter().collect(),
            total_count: 3,
            size_distribution: BTreeMap::new(),
            organisms: Vec::new(),
        }
    }

    fn analytics() -> AnalyticsOutput {
        AnalyticsOutput {
            diversity: None,
            composition: None,
            bloom_alerts: Vec::new(),
            trends: None,
        }
    }

    #[test]
    fn test_writes_files_and_snapshot_reloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stage = ExportStage::new(ExportConfig {
            output_dir: dir.path().join("out"),
            ..ExportConfig::default()
        })?;
        let (meta, counts, stats) = (metadata(), counting(), analytics());
        let mut context = PipelineContext::new(false, None);
        let output = stage.run(
            ExportInput { metadata: &meta, counting: &counts, analytics: &stats },
            &mut context,
        )?;

        assert_eq!(output.exported_files.len(), 3);
        assert!(output.exported_files[0].ends_with("summary_abc.csv"));

        let summary = std::fs::read_to_string(&output.exported_files[0])?;
        assert!(summary.starts_with("sample_id,timestamp,gps_lat,gps_lon,magnification,class_name,count"));
        assert!(summary.contains("abc,2024-05-01T12:00:00Z,,,"));
        assert!(summary.contains(",Diatom,3,,,false"));

        let history = load_history(&[&output.exported_files[2]])?;
        assert_eq!(history[0].counts_by_class.get("Diatom"), Some(&3));
        Ok(())
    }

    #[test]
    fn test_uncreatable_directory_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x")?;
        let stage = ExportStage::new(ExportConfig {
            output_dir: blocker.join("sub"),
            ..ExportConfig::default()
        })?;
        let (meta, counts, stats) = (metadata(), counting(), analytics());
        let mut context = PipelineContext::new(false, None);
        let err = stage
            .run(ExportInput { metadata: &meta, counting: &counts, analytics: &stats }, &mut context)
            .unwrap_err();
        assert!(matches!(err, StageError::Processing(_)));
        Ok(())
    }

    #[test]
    fn test_disabled_outputs_are_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stage = ExportStage::new(ExportConfig {
            output_dir: dir.path().to_path_buf(),
            write_summary: false,
            write_organisms: false,
            write_snapshot: true,
        })?;
        let (meta, counts, stats) = (metadata(), counting(), analytics());
        let mut context = PipelineContext::new(false, None);
        let output = stage.run(ExportInput { metadata: &meta, counting: &counts, analytics: &stats }, &mut context)?;
        assert_eq!(output.exported_files.len(), 1);
        Ok(())
    }
}
