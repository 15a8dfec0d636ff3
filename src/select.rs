//! Erosion-radius selection over the sweep table.
//!
//! The primary selector is an ordered constraint procedure over three
//! signals: largest-particle dominance, particle-count peak, and the mean
//! interior contact range. A Pareto + normalized-distance selector is kept
//! as a fallback and for diagnostic comparison.

use log::info;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::sweep::{SweepDiagnostics, SweepRecord};

/// Which branch of the decision procedure picked the radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorReason {
    /// Particle-count peak whose mean contacts fall in the accepted range.
    PeakAndContacts,
    /// Smallest radius past `r*` with mean contacts in range.
    ContactsOnly,
    /// Particle-count peak, contacts constraint unmet.
    RPeak,
    /// `r*` itself (dominance constraint met, nothing better).
    RStar,
    /// Largest swept radius; no constraint was ever met.
    MaxR,
}

impl SelectorReason {
    /// Stable string form used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorReason::PeakAndContacts => "peak_and_contacts",
            SelectorReason::ContactsOnly => "contacts_only",
            SelectorReason::RPeak => "r_peak",
            SelectorReason::RStar => "r_star",
            SelectorReason::MaxR => "max_r",
        }
    }
}

/// Thresholds the decision was evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelectorThresholds {
    pub tau_ratio: f64,
    pub contacts_min: f64,
    pub contacts_max: f64,
}

/// Selector configuration.
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Dominance threshold on `largest_particle_ratio`.
    pub tau_ratio: f64,
    /// Accepted mean-interior-contact range, inclusive.
    pub contacts_range: (f64, f64),
    /// Centered moving-average window for the decision signals; `None`, 0,
    /// and 1 disable smoothing.
    pub smoothing_window: Option<usize>,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            tau_ratio: 0.03,
            contacts_range: (5.0, 9.0),
            smoothing_window: None,
        }
    }
}

impl SelectorOptions {
    /// Reject a range whose lower bound exceeds its upper bound.
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.contacts_range;
        if lo > hi {
            return Err(Error::InvalidContactsRange(lo, hi));
        }
        Ok(())
    }
}

/// The selector's decision for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Selection {
    pub best_radius: u32,
    pub reason: SelectorReason,
    /// Smallest radius meeting the dominance constraint (bookkeeping value
    /// when the constraint was never met).
    pub r_star: Option<u32>,
    /// Particle-count peak within the constrained region.
    pub r_peak: Option<u32>,
    pub thresholds: SelectorThresholds,
}

/// Full sweep result: every record plus the selector's decision.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    /// Records in ascending radius order.
    pub records: Vec<SweepRecord>,
    /// Selected radius, 0 when nothing was swept (empty foreground).
    pub best_radius: u32,
    /// Absent only when there was nothing to select from.
    pub selection: Option<Selection>,
    /// Total pipeline wall time, seconds.
    pub total_time: f64,
}

/// Apply the ordered decision procedure to the sweep records (which must be
/// in ascending radius order). Returns `None` for an empty table.
pub fn select_radius(records: &[SweepRecord], options: &SelectorOptions) -> Option<Selection> {
    if records.is_empty() {
        return None;
    }
    debug_assert!(
        records.windows(2).all(|w| w[0].radius < w[1].radius),
        "sweep records must be radius-ascending"
    );

    let (c_min, c_max) = options.contacts_range;
    let thresholds = SelectorThresholds {
        tau_ratio: options.tau_ratio,
        contacts_min: c_min,
        contacts_max: c_max,
    };

    // Smoothing applies to the decision signals only; contacts are always
    // compared raw.
    let lpr: Vec<f64> = records.iter().map(|r| r.largest_particle_ratio).collect();
    let pc: Vec<f64> = records.iter().map(|r| f64::from(r.particle_count)).collect();
    let lpr_s = moving_average(&lpr, options.smoothing_window);
    let pc_s = moving_average(&pc, options.smoothing_window);

    let in_range = |c: f64| c >= c_min && c <= c_max;

    // 1) r*: smallest radius passing the dominance constraint.
    let star_idx = lpr_s.iter().position(|&v| v <= options.tau_ratio);

    if let Some(star) = star_idx {
        let r_star = records[star].radius;

        // 2) R_peak: maximal (smoothed) particle count among radii at or
        // past r* that still pass the constraint; first maximum wins so
        // ties go to the smaller radius.
        let mut peak_idx: Option<usize> = None;
        for i in star..records.len() {
            if lpr_s[i] <= options.tau_ratio
                && peak_idx.is_none_or(|best| pc_s[i] > pc_s[best])
            {
                peak_idx = Some(i);
            }
        }
        let r_peak = peak_idx.map(|i| records[i].radius);

        // (A) peak whose raw contacts fall in range.
        if let Some(peak) = peak_idx {
            if in_range(records[peak].mean_contacts) {
                return Some(Selection {
                    best_radius: records[peak].radius,
                    reason: SelectorReason::PeakAndContacts,
                    r_star: Some(r_star),
                    r_peak,
                    thresholds,
                });
            }
        }

        // (B) smallest radius at or past r* with contacts in range.
        for record in &records[star..] {
            if in_range(record.mean_contacts) {
                return Some(Selection {
                    best_radius: record.radius,
                    reason: SelectorReason::ContactsOnly,
                    r_star: Some(r_star),
                    r_peak,
                    thresholds,
                });
            }
        }

        // (C) peak without the contacts constraint.
        if let Some(peak) = peak_idx {
            return Some(Selection {
                best_radius: records[peak].radius,
                reason: SelectorReason::RPeak,
                r_star: Some(r_star),
                r_peak,
                thresholds,
            });
        }

        // (D) r* itself.
        return Some(Selection {
            best_radius: r_star,
            reason: SelectorReason::RStar,
            r_star: Some(r_star),
            r_peak,
            thresholds,
        });
    }

    // (E) nothing ever passed the dominance constraint: largest radius.
    // The smallest radius is kept as the bookkeeping r*.
    let last = records.len() - 1;
    Some(Selection {
        best_radius: records[last].radius,
        reason: SelectorReason::MaxR,
        r_star: Some(records[0].radius),
        r_peak: None,
        thresholds,
    })
}

/// Centered moving average with the given window; `None`, 0, and 1 leave
/// the signal untouched. The window spans `[i - (w-1)/2, i + w/2]`, clamped
/// at the ends.
pub fn moving_average(values: &[f64], window: Option<usize>) -> Vec<f64> {
    let w = window.unwrap_or(0);
    if w <= 1 || values.is_empty() {
        return values.to_vec();
    }
    let left = (w - 1) / 2;
    let right = w / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(left);
            let hi = (i + right).min(values.len() - 1);
            let span = &values[lo..=hi];
            span.iter().sum::<f64>() / span.len() as f64
        })
        .collect()
}

/// Kneedle knee detection on min–max-normalized coordinates: the index
/// maximizing the vertical distance between the curve and the diagonal.
/// Fewer than three points gives 0.
pub fn detect_knee(x: &[f64], y: &[f64]) -> usize {
    if x.len() < 3 || x.len() != y.len() {
        return 0;
    }
    let norm = |values: &[f64]| -> Vec<f64> {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max <= min {
            return vec![0.0; values.len()];
        }
        values.iter().map(|&v| (v - min) / (max - min)).collect()
    };
    let xn = norm(x);
    let yn = norm(y);

    let mut best = 0;
    let mut best_diff = f64::NEG_INFINITY;
    for i in 0..xn.len() {
        let diff = yn[i] - xn[i];
        if diff > best_diff {
            best_diff = diff;
            best = i;
        }
    }
    best
}

/// Pareto + normalized-distance fallback selector.
///
/// Objectives to minimize per radius: dominance (HHI), knee distance on the
/// particle-count curve, and instability (mean VI against the sweep
/// neighbors). Among the non-dominated radii the one closest to the origin
/// wins; ties break to the smaller radius, then smaller raw HHI, then
/// contact proximity to `target_contacts`.
pub fn select_radius_pareto(
    records: &[SweepRecord],
    diagnostics: &SweepDiagnostics,
    target_contacts: f64,
) -> Option<u32> {
    if records.is_empty() {
        return None;
    }
    let n = records.len();

    let radii: Vec<f64> = records.iter().map(|r| f64::from(r.radius)).collect();
    let counts: Vec<f64> = records.iter().map(|r| f64::from(r.particle_count)).collect();
    let knee_idx = detect_knee(&radii, &counts);

    let hhi: Vec<f64> = (0..n)
        .map(|i| diagnostics.hhi.get(i).copied().unwrap_or(1.0))
        .collect();
    let knee_dist: Vec<f64> = (0..n).map(|i| (i as f64 - knee_idx as f64).abs()).collect();
    let instability: Vec<f64> = (0..n)
        .map(|i| {
            let mut values = Vec::with_capacity(2);
            if i > 0 {
                if let Some(&vi) = diagnostics.adjacent_vi.get(i - 1) {
                    values.push(vi);
                }
            }
            if let Some(&vi) = diagnostics.adjacent_vi.get(i) {
                values.push(vi);
            }
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        })
        .collect();

    let normalize = |values: &[f64]| -> Vec<f64> {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max <= min {
            return vec![0.0; values.len()];
        }
        values.iter().map(|&v| (v - min) / (max - min)).collect()
    };
    let hhi_n = normalize(&hhi);
    let knee_n = normalize(&knee_dist);
    let instab_n = normalize(&instability);

    let objectives: Vec<[f64; 3]> = (0..n).map(|i| [hhi_n[i], knee_n[i], instab_n[i]]).collect();

    let dominates = |a: usize, b: usize| -> bool {
        let (oa, ob) = (&objectives[a], &objectives[b]);
        oa.iter().zip(ob).all(|(x, y)| x <= y) && oa.iter().zip(ob).any(|(x, y)| x < y)
    };

    let non_dominated: Vec<usize> = (0..n)
        .filter(|&i| !(0..n).any(|j| j != i && dominates(j, i)))
        .collect();
    let candidates = if non_dominated.is_empty() {
        (0..n).collect()
    } else {
        non_dominated
    };

    let distance = |i: usize| -> f64 {
        objectives[i].iter().map(|v| v * v).sum::<f64>().sqrt()
    };

    let best = candidates.into_iter().min_by(|&a, &b| {
        distance(a)
            .total_cmp(&distance(b))
            .then_with(|| records[a].radius.cmp(&records[b].radius))
            .then_with(|| hhi[a].total_cmp(&hhi[b]))
            .then_with(|| {
                (records[a].mean_contacts - target_contacts)
                    .abs()
                    .total_cmp(&(records[b].mean_contacts - target_contacts).abs())
            })
    })?;

    info!(
        "pareto fallback: r={} (knee@r={}, hhi={:.3}, instability={:.3})",
        records[best].radius, records[knee_idx].radius, hhi[best], instability[best]
    );
    Some(records[best].radius)
}
