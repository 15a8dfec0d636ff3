//! Pipeline orchestration: load → binarize → sweep → select → persist,
//! with a typed progress-event stream and cooperative cancellation.
//!
//! The pipeline itself is single-threaded; parallelism lives inside the
//! splitter and the contact engine. Cancellation is observed at stage
//! boundaries and between sweep radii only, so a long radius always runs
//! to completion before the flag takes effect.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{info, warn};

use crate::binarize::{BinarizationInfo, BinarizeOptions, binarize};
use crate::error::{Error, Result};
use crate::loader::{DEFAULT_EXTENSIONS, load_volume};
use crate::report::{write_labels_npy, write_sweep_csv};
use crate::select::{SelectorOptions, SweepSummary, select_radius, select_radius_pareto};
use crate::split::split_particles;
use crate::sweep::{SweepOptions, SweepRecord, sweep};

/// Contact proximity target used by the Pareto fallback tie-break.
const PARETO_TARGET_CONTACTS: f64 = 6.0;

/// Cooperative cancellation flag, shared between the pipeline and its
/// caller (typically a GUI worker or a Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect at the next progress boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Coarse pipeline stage, for progress displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialization,
    Optimization,
    Finalization,
}

impl Stage {
    /// Stable string form used in progress displays.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialization => "initialization",
            Stage::Optimization => "optimization",
            Stage::Finalization => "finalization",
        }
    }
}

/// One-way progress stream from the pipeline to its consumer. Events are
/// emitted in order; the consumer cannot reject or reorder them.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageChanged(Stage),
    /// One per completed radius, in ascending radius order.
    SweepRecord(SweepRecord),
    ProgressText(String),
    /// Monotonically non-decreasing, 0..=100.
    ProgressPercentage(u8),
    Error(String),
    Completed(SweepSummary),
}

/// Consumer of the progress stream. Implementations must tolerate being
/// called from the pipeline thread and should return quickly.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Erosion radii to sweep, ascending.
    pub radii: Vec<u32>,
    pub connectivity: crate::morphology::Connectivity,
    pub binarize: BinarizeOptions,
    pub selector: SelectorOptions,
    pub early_stopping: bool,
    pub plateau_threshold: f64,
    /// Accepted slice file extensions (case-insensitive).
    pub extensions: Vec<String>,
    /// Where the sweep table and the selected label volume are written.
    pub output_dir: PathBuf,
}

impl PipelineOptions {
    /// Defaults everywhere, radii `1..=10`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            radii: (1..=10).collect(),
            connectivity: crate::morphology::Connectivity::Six,
            binarize: BinarizeOptions::default(),
            selector: SelectorOptions::default(),
            early_stopping: false,
            plateau_threshold: 0.01,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_string()).collect(),
            output_dir: output_dir.into(),
        }
    }

    /// Validate and normalize: radii sorted, deduplicated, all `>= 1`.
    fn normalized_radii(&self) -> Result<Vec<u32>> {
        if let Some(&bad) = self.radii.iter().find(|&&r| r < 1) {
            return Err(Error::InvalidRadius(i64::from(bad)));
        }
        let mut radii = self.radii.clone();
        radii.sort_unstable();
        radii.dedup();
        if radii.is_empty() {
            return Err(Error::InvalidRadius(0));
        }
        Ok(radii)
    }
}

/// Run the full analysis over a folder of slices.
///
/// Emits progress events to `sink` throughout; on success the final event
/// is `Completed` with the returned summary, on failure a single `Error`
/// event precedes the returned error. Only the label volume at the chosen
/// radius is ever written to disk.
pub fn run(
    input: &Path,
    options: &PipelineOptions,
    sink: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<SweepSummary> {
    match run_inner(input, options, sink, cancel) {
        Ok(summary) => {
            sink.emit(ProgressEvent::Completed(summary.clone()));
            Ok(summary)
        }
        Err(err) => {
            sink.emit(ProgressEvent::Error(err.to_string()));
            Err(err)
        }
    }
}

fn run_inner(
    input: &Path,
    options: &PipelineOptions,
    sink: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<SweepSummary> {
    let start = Instant::now();
    let radii = options.normalized_radii()?;
    options.selector.validate()?;

    sink.emit(ProgressEvent::StageChanged(Stage::Initialization));
    sink.emit(ProgressEvent::ProgressPercentage(0));
    sink.emit(ProgressEvent::ProgressText(format!(
        "Loading slices from {input:?}"
    )));

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let extensions: Vec<&str> = options.extensions.iter().map(String::as_str).collect();
    let raw = load_volume(input, &extensions)?;
    let shape = raw.shape();
    info!(
        "loaded {} slices of {}x{} at {} bits",
        shape.slices,
        shape.rows,
        shape.cols,
        raw.bit_depth()
    );
    sink.emit(ProgressEvent::ProgressPercentage(5));
    sink.emit(ProgressEvent::ProgressText("Binarizing volume".to_string()));

    // The raw volume is dropped right after binarization; only the boolean
    // mask is shared with the sweep.
    let (binary, bin_info) = binarize(&raw, &options.binarize);
    drop(raw);
    log_binarization(&bin_info);

    if !binary.any() {
        warn!("empty foreground: completing with zero particles");
        sink.emit(ProgressEvent::ProgressText(
            "Empty foreground after binarization".to_string(),
        ));
        write_sweep_csv(&[], &options.output_dir)?;
        sink.emit(ProgressEvent::ProgressPercentage(100));
        return Ok(SweepSummary {
            records: Vec::new(),
            best_radius: 0,
            selection: None,
            total_time: start.elapsed().as_secs_f64(),
        });
    }

    sink.emit(ProgressEvent::ProgressPercentage(10));
    sink.emit(ProgressEvent::StageChanged(Stage::Optimization));

    let sweep_options = SweepOptions {
        connectivity: options.connectivity,
        early_stopping: options.early_stopping,
        plateau_threshold: options.plateau_threshold,
        collect_diagnostics: true,
    };

    // Keep a copy of each record as it lands so a failed sweep can still
    // persist its partial table.
    let total = radii.len();
    let mut completed: Vec<SweepRecord> = Vec::with_capacity(total);
    let outcome = {
        let on_record = |record: &SweepRecord| {
            completed.push(record.clone());
            let done = completed.len();
            sink.emit(ProgressEvent::SweepRecord(record.clone()));
            sink.emit(ProgressEvent::ProgressText(format!(
                "Radius {}: {} particles",
                record.radius, record.particle_count
            )));
            let pct = 10 + (80 * done / total) as u8;
            sink.emit(ProgressEvent::ProgressPercentage(pct.min(90)));
        };
        sweep(&binary, &radii, &sweep_options, cancel, on_record)
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if !completed.is_empty() {
                warn!(
                    "sweep aborted after {} radii; persisting the partial table",
                    completed.len()
                );
                write_sweep_csv(&completed, &options.output_dir)?;
            }
            return Err(err);
        }
    };

    sink.emit(ProgressEvent::StageChanged(Stage::Finalization));
    sink.emit(ProgressEvent::ProgressText("Selecting radius".to_string()));

    // An empty record list can only mean an empty sweep, which was handled
    // above; degrade gracefully all the same.
    let Some(selection) = select_radius(&outcome.records, &options.selector) else {
        return Ok(SweepSummary {
            records: outcome.records,
            best_radius: 0,
            selection: None,
            total_time: start.elapsed().as_secs_f64(),
        });
    };
    info!(
        "selected r={} (reason={}, r_star={:?}, r_peak={:?})",
        selection.best_radius,
        selection.reason.as_str(),
        selection.r_star,
        selection.r_peak
    );

    // Diagnostic comparison against the Pareto fallback.
    if let Some(diag) = outcome.diagnostics.as_ref() {
        if let Some(pareto_r) =
            select_radius_pareto(&outcome.records, diag, PARETO_TARGET_CONTACTS)
        {
            if pareto_r != selection.best_radius {
                info!(
                    "pareto fallback disagrees: constraint r={}, pareto r={pareto_r}",
                    selection.best_radius
                );
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    sink.emit(ProgressEvent::ProgressPercentage(92));
    sink.emit(ProgressEvent::ProgressText(format!(
        "Recomputing labels at r={}",
        selection.best_radius
    )));

    // Recompute the winning labels instead of keeping every radius's
    // volume alive across the sweep.
    let labels = split_particles(&binary, selection.best_radius)?;

    write_sweep_csv(&outcome.records, &options.output_dir)?;
    write_labels_npy(&labels, selection.best_radius, &options.output_dir)?;
    sink.emit(ProgressEvent::ProgressPercentage(100));

    Ok(SweepSummary {
        records: outcome.records,
        best_radius: selection.best_radius,
        selection: Some(selection),
        total_time: start.elapsed().as_secs_f64(),
    })
}

fn log_binarization(info: &BinarizationInfo) {
    info!(
        "binarized {:?} ({}): t1={:.4}, t2={:.4}, polarity={}, foreground={:.2}%",
        info.shape,
        info.source_dtype,
        info.threshold_stage1,
        info.threshold_stage2,
        info.polarity.as_str(),
        info.foreground_ratio * 100.0
    );
}
