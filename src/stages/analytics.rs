//! Stage 6: community metrics over the class counts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::config::AnalyticsConfig;
use crate::error::{ConfigurationError, StageError};
use crate::models::{AnalyticsOutput, BloomAlert, ClassTrend, DiversityIndices, HistoricalSample, Severity, TrendDirection};
use crate::pipeline::{PipelineContext, Stage, StageKind};

/// Keeps `ln` finite for empty classes
const LOG_EPSILON: f64 = 1e-10;

fn total(counts: &BTreeMap<String, usize>) -> usize {
    counts.values().sum()
}

pub fn shannon_index(counts: &BTreeMap<String, usize>) -> f64 {
    let total = total(counts);
    if total == 0 {
        return 0.0;
    }
    let h: f64 = counts
        .values()
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * (p + LOG_EPSILON).ln()
        })
        .sum();
    h.max(0.0)
}

pub fn simpson_index(counts: &BTreeMap<String, usize>) -> f64 {
    let total = total(counts);
    if total == 0 {
        return 0.0;
    }
    let dominance: f64 = counts
        .values()
        .map(|&c| (c as f64 / total as f64).powi(2))
        .sum();
    (1.0 - dominance).clamp(0.0, 1.0)
}

pub fn species_richness(counts: &BTreeMap<String, usize>) -> usize {
    counts.values().filter(|&&c| c > 0).count()
}

pub fn diversity(counts: &BTreeMap<String, usize>) -> DiversityIndices {
    if total(counts) == 0 {
        return DiversityIndices::empty();
    }
    DiversityIndices {
        shannon: shannon_index(counts),
        simpson: simpson_index(counts),
        species_richness: species_richness(counts),
    }
}

/// Share of each class in percent
pub fn composition(counts: &BTreeMap<String, usize>) -> BTreeMap<String, f64> {
    let total = total(counts);
    if total == 0 {
        return BTreeMap::new();
    }
    counts
        .iter()
        .map(|(class, &c)| (class.clone(), c as f64 / total as f64 * 100.0))
        .collect()
}

pub fn detect_blooms(counts: &BTreeMap<String, usize>, thresholds: &BTreeMap<String, usize>) -> Vec<BloomAlert> {
    thresholds
        .iter()
        .filter_map(|(class, &threshold)| {
            let count = counts.get(class).copied().unwrap_or(0);
            (threshold > 0 && count >= threshold).then(|| BloomAlert {
                class_name: class.clone(),
                count,
                threshold,
                severity: Severity::from_ratio(count as f64 / threshold as f64),
            })
        })
        .collect()
}

pub fn trend(current: usize, previous: usize) -> ClassTrend {
    let change_pct = if previous > 0 {
        (current as f64 - previous as f64) / previous as f64 * 100.0
    } else if current > 0 {
        100.0
    } else {
        0.0
    };
    let direction = if change_pct > 0.0 {
        TrendDirection::Increasing
    } else if change_pct < 0.0 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };
    ClassTrend {
        current,
        previous,
        change_pct,
        direction,
    }
}

/// Compare against the most recent sample, over every class seen in either
pub fn compute_trends(
    current: &BTreeMap<String, usize>,
    history: &[HistoricalSample],
) -> Option<BTreeMap<String, ClassTrend>> {
    let previous = &history.last()?.counts_by_class;
    let classes: BTreeSet<&String> = current.keys().chain(previous.keys()).collect();
    Some(
        classes
            .into_iter()
            .map(|class| {
                let now = current.get(class).copied().unwrap_or(0);
                let before = previous.get(class).copied().unwrap_or(0);
                (class.clone(), trend(now, before))
            })
            .collect(),
    )
}

pub struct AnalyticsInput<'a> {
    pub counts_by_class: &'a BTreeMap<String, usize>,
    /// Earlier samples, oldest first
    pub history: &'a [HistoricalSample],
}

pub struct AnalyticsStage {
    config: AnalyticsConfig,
}

impl AnalyticsStage {
    pub fn new(config: AnalyticsConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        info!(
            "Analytics stage initialized ({} bloom threshold(s))",
            config.bloom_thresholds.len()
        );
        Ok(Self { config })
    }

    pub fn analyze(&self, input: &AnalyticsInput<'_>) -> AnalyticsOutput {
        let counts = input.counts_by_class;
        AnalyticsOutput {
            diversity: self.config.compute_diversity.then(|| diversity(counts)),
            composition: self.config.compute_composition.then(|| composition(counts)),
            bloom_alerts: detect_blooms(counts, &self.config.bloom_thresholds),
            trends: compute_trends(counts, input.history),
        }
    }
}

impl Stage for AnalyticsStage {
    type Input<'a> = AnalyticsInput<'a>;
    type Output = AnalyticsOutput;

    fn kind(&self) -> StageKind {
        StageKind::Analytics
    }

    fn process(&self, input: AnalyticsInput<'_>, context: &mut PipelineContext) -> Result<AnalyticsOutput, StageError> {
        let output = self.analyze(&input);

        if let Some(d) = &output.diversity {
            context.record(format!(
                "Diversity: Shannon {:.3}, Simpson {:.3}, richness {}",
                d.shannon, d.simpson, d.species_richness
            ));
        }
        for alert in &output.bloom_alerts {
            warn!(
                "Bloom alert: {} count {} >= {} ({})",
                alert.class_name,
                alert.count,
                alert.threshold,
                alert.severity.as_str()
            );
            context.record(format!(
                "Bloom alert: {} ({}, {} >= {})",
                alert.class_name,
                alert.severity.as_str(),
                alert.count,
                alert.threshold
            ));
        }
        if let Some(trends) = &output.trends {
            context.record(format!("Trends computed for {} class(es)", trends.len()));
        }

        Ok(output)
    }
}
