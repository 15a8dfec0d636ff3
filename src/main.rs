//! Command-line driver for the grainscan analysis pipeline.
//!
//! ## Usage
//!
//! ```bash
//! grainscan --in <slice_folder> --out <output_dir> --max-radius 10
//! grainscan --in scan/ --out results/ --connectivity 26 --enable-clahe
//! grainscan --in scan/ --out results/ --polarity dark --threshold-method triangle
//! ```
//!
//! The output directory receives `optimization_results.csv` (one row per
//! swept radius) and `labels_r{r*}.npy` (the label volume at the selected
//! radius).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use grainscan::pipeline::{CancelToken, PipelineOptions, ProgressEvent, ProgressSink};
use grainscan::{BinarizeOptions, Connectivity, Polarity, RoiMode, SelectorOptions, ThresholdMethod};

#[derive(Parser, Debug)]
#[command(name = "grainscan")]
#[command(about = "Analyze packed-particle CT stacks: split touching grains and pick the best erosion radius")]
struct CliArgs {
    /// Input folder containing grayscale slice images (.tif/.tiff)
    #[arg(long = "in")]
    input: PathBuf,

    /// Output directory for the sweep table and selected label volume
    #[arg(long = "out")]
    output: PathBuf,

    /// Sweep erosion radii 1..=max-radius
    #[arg(long, default_value_t = 10)]
    max_radius: u32,

    /// Neighborhood connectivity for labeling and contacts (6 or 26)
    #[arg(long, default_value_t = 6)]
    connectivity: u32,

    /// Largest-particle dominance threshold for the selector
    #[arg(long, default_value_t = 0.03)]
    tau_ratio: f64,

    /// Lower bound of the accepted mean-contact range
    #[arg(long, default_value_t = 5.0)]
    contacts_min: f64,

    /// Upper bound of the accepted mean-contact range
    #[arg(long, default_value_t = 9.0)]
    contacts_max: f64,

    /// Moving-average window for the selector signals (0 = off)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=2))]
    smoothing_window: u32,

    /// Foreground polarity
    #[arg(long, value_enum, default_value_t = PolarityArg::Auto)]
    polarity: PolarityArg,

    /// Threshold method for the second binarization stage
    #[arg(long, value_enum, default_value_t = ThresholdArg::Otsu)]
    threshold_method: ThresholdArg,

    /// Apply CLAHE contrast enhancement before thresholding
    #[arg(long)]
    enable_clahe: bool,

    /// Restrict thresholding to the per-slice largest-component ROI
    #[arg(long)]
    roi: bool,

    /// Remove foreground components smaller than this many voxels
    #[arg(long, default_value_t = 100)]
    min_object_size: usize,

    /// Radius of the spherical closing element (0 = no closing)
    #[arg(long, default_value_t = 0)]
    closing_radius: u32,

    /// Stop the sweep early once the particle count plateaus
    #[arg(long)]
    early_stop: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolarityArg {
    Auto,
    Bright,
    Dark,
}

impl From<PolarityArg> for Polarity {
    fn from(value: PolarityArg) -> Self {
        match value {
            PolarityArg::Auto => Polarity::Auto,
            PolarityArg::Bright => Polarity::Bright,
            PolarityArg::Dark => Polarity::Dark,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ThresholdArg {
    Otsu,
    Triangle,
}

impl From<ThresholdArg> for ThresholdMethod {
    fn from(value: ThresholdArg) -> Self {
        match value {
            ThresholdArg::Otsu => ThresholdMethod::Otsu,
            ThresholdArg::Triangle => ThresholdMethod::Triangle,
        }
    }
}

/// Progress sink that narrates the run on stdout.
struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StageChanged(stage) => {
                println!("=== {} ===", stage.as_str());
            }
            ProgressEvent::SweepRecord(record) => {
                println!(
                    "✓ r={}: {} particles, {:.1} mean contacts, {:.1}% largest ({:.1}s)",
                    record.radius,
                    record.particle_count,
                    record.mean_contacts,
                    record.largest_particle_ratio * 100.0,
                    record.processing_time
                );
            }
            ProgressEvent::ProgressText(text) => println!("  {text}"),
            ProgressEvent::ProgressPercentage(_) => {}
            ProgressEvent::Error(message) => eprintln!("✗ {message}"),
            ProgressEvent::Completed(summary) => {
                if let Some(selection) = summary.selection {
                    println!(
                        "\n✓ Selected r={} (reason: {}) in {:.1}s",
                        summary.best_radius,
                        selection.reason.as_str(),
                        summary.total_time
                    );
                } else {
                    println!("\n✓ Completed with no particles in {:.1}s", summary.total_time);
                }
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = CliArgs::parse();

    let connectivity = Connectivity::try_from(args.connectivity)
        .with_context(|| "invalid --connectivity value")?;

    let mut options = PipelineOptions::new(&args.output);
    options.radii = (1..=args.max_radius.max(1)).collect();
    options.connectivity = connectivity;
    options.early_stopping = args.early_stop;
    options.binarize = BinarizeOptions {
        min_object_size: args.min_object_size,
        closing_radius: args.closing_radius,
        polarity: args.polarity.into(),
        threshold_method: args.threshold_method.into(),
        clahe_enabled: args.enable_clahe,
        roi_mode: if args.roi {
            RoiMode::PerSliceLargestComponent
        } else {
            RoiMode::None
        },
    };
    options.selector = SelectorOptions {
        tau_ratio: args.tau_ratio,
        contacts_range: (args.contacts_min, args.contacts_max),
        smoothing_window: match args.smoothing_window {
            0 | 1 => None,
            w => Some(w as usize),
        },
    };

    let summary = grainscan::run(&args.input, &options, &ConsoleSink, &CancelToken::new())
        .with_context(|| format!("analysis failed for {:?}", args.input))?;

    println!(
        "Results written to {:?} ({} radii swept)",
        args.output,
        summary.records.len()
    );
    Ok(())
}
