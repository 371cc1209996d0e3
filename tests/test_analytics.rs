mod common;

use anyhow::Result;
use common::*;
use plankton_pipeline::config::AnalyticsConfig;
use plankton_pipeline::stages::analytics::{AnalyticsInput, AnalyticsStage, composition, diversity};

fn survey_counts() -> std::collections::BTreeMap<String, usize> {
    make_counts(&[("Copepod", 45), ("Diatom", 230), ("Dinoflagellate", 12), ("Ciliate", 8)])
}

#[test]
fn test_diatom_bloom_scenario() -> Result<()> {
    let config = AnalyticsConfig {
        bloom_thresholds: make_counts(&[("Diatom", 200)]),
        ..AnalyticsConfig::default()
    };
    let stage = AnalyticsStage::new(config)?;
    let counts = survey_counts();

    let output = stage.analyze(&AnalyticsInput {
        counts_by_class: &counts,
        history: &[],
    });

    // 1. One alert, ratio 1.15 is the lowest tier
    assert_eq!(output.bloom_alerts.len(), 1);
    let alert = &output.bloom_alerts[0];
    assert_eq!(alert.class_name, "Diatom");
    assert_eq!(alert.count, 230);
    assert_eq!(alert.severity, Severity::Low);

    // 2. Diversity
    let d = output.diversity.expect("diversity enabled");
    assert_eq!(d.species_richness, 4);
    assert!(d.shannon > 0.0 && d.shannon <= (4f64).ln() + 1e-9);
    assert!(d.simpson > 0.0 && d.simpson < 1.0);

    // 3. Composition is in percent
    let c = output.composition.expect("composition enabled");
    assert!((c["Diatom"] - 230.0 / 295.0 * 100.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_diversity_bounds_hold() {
    let samples = [
        make_counts(&[("A", 1)]),
        make_counts(&[("A", 1), ("B", 1)]),
        make_counts(&[("A", 1000), ("B", 1), ("C", 1)]),
        make_counts(&[("A", 7), ("B", 7), ("C", 7), ("D", 7), ("E", 7)]),
        survey_counts(),
    ];
    for counts in &samples {
        let d = diversity(counts);
        let richness = counts.len();
        assert!(d.shannon >= 0.0);
        assert!(d.shannon <= (richness as f64).ln() + 1e-9);
        assert!((0.0..=1.0).contains(&d.simpson));
        assert_eq!(d.species_richness, richness);

        let total: f64 = composition(counts).values().sum();
        assert!((total - 100.0).abs() < 0.01);
    }
}

#[test]
fn test_severity_grows_with_count() {
    let threshold = 100;
    let mut last = Severity::Low;
    for count in (100..=500).step_by(10) {
        let config = AnalyticsConfig {
            bloom_thresholds: make_counts(&[("Diatom", threshold)]),
            ..AnalyticsConfig::default()
        };
        let stage = AnalyticsStage::new(config).unwrap();
        let counts = make_counts(&[("Diatom", count)]);
        let output = stage.analyze(&AnalyticsInput {
            counts_by_class: &counts,
            history: &[],
        });
        let severity = output.bloom_alerts[0].severity;
        assert!(severity >= last, "{} gave {:?} after {:?}", count, severity, last);
        last = severity;
    }
    assert_eq!(last, Severity::Critical);
}

#[test]
fn test_disabled_metrics_are_absent() -> Result<()> {
    let stage = AnalyticsStage::new(AnalyticsConfig {
        compute_diversity: false,
        compute_composition: false,
        ..AnalyticsConfig::default()
    })?;
    let counts = survey_counts();
    let output = stage.analyze(&AnalyticsInput {
        counts_by_class: &counts,
        history: &[],
    });
    assert!(output.diversity.is_none());
    assert!(output.composition.is_none());
    assert!(output.bloom_alerts.is_empty());
    Ok(())
}
