//! Radius sweep: run the splitter, metrics, and contact engine for every
//! requested erosion radius and assemble one record per radius.
//!
//! Label volumes are ephemeral — at most the previous radius's labels stay
//! in memory, and only when the instability diagnostics for the fallback
//! selector were requested. Nothing is persisted here.

use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use crate::contacts::{analyze_contacts, summarize_contacts};
use crate::error::{Error, Result};
use crate::metrics::{hhi_from_volumes, largest_ratio_from_volumes, particle_volumes, variation_of_information};
use crate::morphology::Connectivity;
use crate::pipeline::CancelToken;
use crate::split::{particle_count, split_particles};
use crate::volume::Volume;

/// Results for a single swept radius. Field order matches the columns of
/// the persisted sweep table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepRecord {
    pub radius: u32,
    pub particle_count: u32,
    /// Mean contact count over interior particles (0 when none).
    pub mean_contacts: f64,
    pub largest_particle_ratio: f64,
    pub interior_particle_count: usize,
    pub excluded_particle_count: usize,
    /// Wall time for this radius, seconds.
    pub processing_time: f64,
    /// Total foreground voxels across all particles.
    pub total_volume: u64,
    pub largest_particle_volume: u64,
}

/// Sweep configuration.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub connectivity: Connectivity,
    /// Stop early once the particle count plateaus.
    pub early_stopping: bool,
    /// Relative particle-count change below which the sweep stops.
    pub plateau_threshold: f64,
    /// Collect the per-radius signals the Pareto fallback selector needs
    /// (HHI and label instability between adjacent radii).
    pub collect_diagnostics: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            connectivity: Connectivity::Six,
            early_stopping: false,
            plateau_threshold: 0.01,
            collect_diagnostics: true,
        }
    }
}

/// Per-radius signals for the fallback selector, collected during the
/// sweep so label volumes never need to be revisited.
#[derive(Debug, Clone, Default)]
pub struct SweepDiagnostics {
    /// HHI over particle volume shares, one per completed radius.
    pub hhi: Vec<f64>,
    /// Variation of Information between consecutive radii's labelings;
    /// `adjacent_vi[i]` compares radius `i` with radius `i + 1`.
    pub adjacent_vi: Vec<f64>,
}

/// Everything the sweep produced.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// One record per completed radius, in ascending radius order.
    pub records: Vec<SweepRecord>,
    pub diagnostics: Option<SweepDiagnostics>,
}

/// Run the splitter over every radius in `radii` (ascending), calling
/// `on_record` after each one completes. Checks the cancellation flag
/// between radii; a cancelled sweep returns [`Error::Cancelled`] and drops
/// its partial results (the orchestrator keeps its own copy via
/// `on_record`).
pub fn sweep(
    mask: &Volume<bool>,
    radii: &[u32],
    options: &SweepOptions,
    cancel: &CancelToken,
    mut on_record: impl FnMut(&SweepRecord),
) -> Result<SweepOutcome> {
    let mut records: Vec<SweepRecord> = Vec::with_capacity(radii.len());
    let mut diagnostics = options.collect_diagnostics.then(SweepDiagnostics::default);
    let mut previous_labels: Option<Volume<i32>> = None;
    let mut previous_count: Option<u32> = None;

    for (i, &radius) in radii.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let step_start = Instant::now();
        info!("processing radius {radius} ({}/{})", i + 1, radii.len());

        let labels = split_particles(mask, radius)?;
        let n = particle_count(&labels);

        let volumes = particle_volumes(&labels);
        let (largest_ratio, largest_volume, total_volume) = largest_ratio_from_volumes(&volumes);

        let analysis = analyze_contacts(&labels, options.connectivity);
        let mean_contacts = analysis.mean_interior_contacts();

        let interior_counts: Vec<u32> =
            analysis.interior_contacts().iter().map(|&(_, c)| c).collect();
        let contact_summary = summarize_contacts(&interior_counts);
        debug!(
            "interior contacts at r={radius}: median={:.1}, iqr=[{:.1}, {:.1}], max={}",
            contact_summary.median, contact_summary.q25, contact_summary.q75, contact_summary.max
        );

        let record = SweepRecord {
            radius,
            particle_count: n,
            mean_contacts,
            largest_particle_ratio: largest_ratio,
            interior_particle_count: analysis.stats.interior_particles,
            excluded_particle_count: analysis.stats.excluded_particles,
            processing_time: step_start.elapsed().as_secs_f64(),
            total_volume,
            largest_particle_volume: largest_volume,
        };

        info!(
            "radius {radius}: {n} particles, {:.1}% largest, {:.1} mean interior contacts",
            largest_ratio * 100.0,
            mean_contacts
        );

        if let Some(diag) = diagnostics.as_mut() {
            diag.hhi.push(hhi_from_volumes(&volumes));
            if let Some(prev) = previous_labels.as_ref() {
                diag.adjacent_vi
                    .push(variation_of_information(prev, &labels, true));
            }
            previous_labels = Some(labels);
        }

        on_record(&record);
        records.push(record);

        // Plateau detection: relative change in particle count.
        if options.early_stopping {
            if let Some(prev) = previous_count {
                if prev > 0 {
                    let rel_change = (f64::from(n) - f64::from(prev)).abs() / f64::from(prev);
                    if rel_change < options.plateau_threshold {
                        info!("early stop at radius {radius} (particle count plateau)");
                        break;
                    }
                }
            }
        }
        previous_count = Some(n);
    }

    Ok(SweepOutcome {
        records,
        diagnostics,
    })
}
