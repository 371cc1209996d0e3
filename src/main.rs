use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::Level;

use plankton_pipeline::models::AcquisitionMode;
use plankton_pipeline::stages::export::load_history;
use plankton_pipeline::{AcquisitionParams, ConfigValidator, Pipeline, PipelineConfig, PipelineResult};

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Synthetic,
    File,
    Video,
}

impl From<Mode> for AcquisitionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Synthetic => AcquisitionMode::Synthetic,
            Mode::File => AcquisitionMode::File,
            Mode::Video => AcquisitionMode::Video,
        }
    }
}

#[derive(Parser)]
#[command(name = "plankton")]
#[command(about = "Count, size and classify plankton in microscope frames")]
struct Cli {
    /// Pipeline configuration (YAML); built-in defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where the frame comes from
    #[arg(long, value_enum, default_value = "synthetic")]
    mode: Mode,

    /// Image file (file mode) or frame directory (video mode)
    #[arg(short, long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Frame to analyse in video mode
    #[arg(long, default_value_t = 0)]
    frame: usize,

    /// Objective magnification
    #[arg(short, long, default_value_t = 1.0)]
    magnification: f64,

    #[arg(long, default_value_t = 100)]
    exposure_ms: u32,

    /// Operator recorded in the capture metadata
    #[arg(long)]
    operator: Option<String>,

    /// Override the export directory from the config
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Earlier JSON snapshots, oldest first, for trend analysis
    #[arg(long, value_name = "FILE")]
    history: Vec<PathBuf>,

    /// Save debug outputs to directory (must be empty)
    #[arg(long, value_name = "DIR")]
    debug_out: Option<PathBuf>,

    /// Only check the config file and report problems
    #[arg(long)]
    validate_config: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> anyhow::Result<ExitCode> {
    if args.validate_config {
        let path = args
            .config
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--validate-config needs --config"))?;
        let report = ConfigValidator::validate_file(path)?;
        for warning in &report.warnings {
            println!("warning: {}", warning);
        }
        for error in &report.errors {
            println!("error: {}", error);
        }
        if report.is_valid() {
            println!("Configuration is valid: {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        return Ok(ExitCode::FAILURE);
    }

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.export.output_dir = dir.clone();
    }

    let mut pipeline = Pipeline::new(config)?.with_verbose(args.verbose);
    if let Some(debug_dir) = args.debug_out.clone() {
        pipeline = pipeline.with_debug(debug_dir)?;
    }

    let history = load_history(&args.history)?;

    let mut params = AcquisitionParams::synthetic(args.magnification);
    params.mode = args.mode.into();
    params.exposure_ms = args.exposure_ms;
    params.source = args.input.clone();
    params.frame_index = Some(args.frame);
    params.capture_metadata.operator_id = args.operator.clone();

    match pipeline.execute_pipeline_with_history(&params, &history) {
        Ok(result) => {
            print_result(&result, args.verbose);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprintln!("\n=== Pipeline Failed ===");
            eprintln!("Stage: {}", failure.stage);
            eprintln!("{}: {}", failure.kind, failure.message);
            if args.verbose {
                for line in &failure.trace {
                    eprintln!("  {}", line);
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_result(result: &PipelineResult, verbose: bool) {
    println!("\n=== Plankton Analysis Results ===");
    println!("Capture: {}", result.metadata.capture_id);
    println!("Total organisms: {}", result.total_count);

    if result.counts_by_class.is_empty() {
        println!("No organisms passed the filters.");
    } else {
        println!("\nCounts by class:");
        for (class, count) in &result.counts_by_class {
            let size = result
                .size_distribution
                .get(class)
                .map(|d| format!(" - mean size {:.1} um", d.mean_um))
                .unwrap_or_default();
            println!("  {}: {}{}", class, count, size);
        }
    }

    if let Some(d) = &result.diversity {
        println!(
            "\nDiversity: Shannon {:.3}, Simpson {:.3}, richness {}",
            d.shannon, d.simpson, d.species_richness
        );
    }

    for alert in &result.bloom_alerts {
        println!(
            "BLOOM ALERT: {} at {} (threshold {}, {})",
            alert.class_name,
            alert.count,
            alert.threshold,
            alert.severity.as_str()
        );
    }

    if let Some(trends) = &result.trends {
        println!("\nTrends vs previous sample:");
        for (class, t) in trends {
            println!("  {}: {} -> {} ({:+.1}%)", class, t.previous, t.current, t.change_pct);
        }
    }

    if !result.exported_files.is_empty() {
        println!("\nExported:");
        for file in &result.exported_files {
            println!("  {}", file);
        }
    }

    if verbose {
        println!("\nExecution trace:");
        for line in &result.trace {
            println!("  {}", line);
        }
    }
}
