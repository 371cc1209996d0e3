//! Runs the full pipeline on a few seeded synthetic frames and feeds each
//! snapshot into the next run as history.

use std::path::PathBuf;

use plankton_pipeline::stages::export::load_history;
use plankton_pipeline::{AcquisitionParams, Pipeline, PipelineConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let output_dir = std::env::temp_dir().join("plankton-demo");
    let mut snapshots: Vec<PathBuf> = Vec::new();

    for seed in 1..=3u64 {
        let mut config = PipelineConfig::default();
        config.acquisition.synthetic.width = 512;
        config.acquisition.synthetic.height = 512;
        config.acquisition.synthetic.seed = Some(seed);
        config.export.output_dir = output_dir.clone();
        config.analytics.bloom_thresholds.insert("Copepod".to_string(), 5);

        let pipeline = Pipeline::new(config)?;
        let history = load_history(&snapshots)?;
        let result = pipeline.execute_pipeline_with_history(&AcquisitionParams::synthetic(1.5), &history)?;

        println!(
            "run {}: {} organisms, {:?}",
            seed, result.total_count, result.counts_by_class
        );
        if let Some(trends) = &result.trends {
            for (class, t) in trends {
                println!("  {} {:?} ({:+.1}%)", class, t.direction, t.change_pct);
            }
        }
        for alert in &result.bloom_alerts {
            println!("  bloom: {} ({})", alert.class_name, alert.severity.as_str());
        }

        if let Some(snapshot) = result.exported_files.iter().find(|f| f.ends_with(".json")) {
            snapshots.push(PathBuf::from(snapshot));
        }
    }

    println!("Results in {}", output_dir.display());
    Ok(())
}
