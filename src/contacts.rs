//! Contact counting over a label volume, with the guard-volume filter that
//! separates statistically valid interior particles from boundary ones.
//!
//! The hot loop is a shifted-slab comparison: for every neighborhood offset
//! the volume is compared against itself shifted by that offset, and label
//! pairs that differ across the shift are contacts. Offsets are independent
//! and run in parallel.

use std::collections::HashSet;
use std::f64::consts::PI;

use log::{debug, info};
use rayon::prelude::*;

use crate::morphology::Connectivity;
use crate::volume::Volume;

/// Minimum guard margin in voxels.
pub const MIN_GUARD_MARGIN: usize = 10;

/// Guard margin as a multiple of the largest equivalent-sphere radius.
pub const GUARD_MARGIN_MULTIPLIER: f64 = 0.3;

/// Cap on the margin as a fraction of each volume dimension.
const GUARD_MARGIN_DIM_FRACTION: f64 = 0.06;

/// Guard partition sizes for one label volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardStats {
    pub total_particles: usize,
    pub interior_particles: usize,
    pub excluded_particles: usize,
}

/// Contact analysis output: counts per particle id plus the guard
/// partition. Columnar, indexed by label id (index 0 unused).
#[derive(Debug, Clone)]
pub struct ContactAnalysis {
    /// Distinct-neighbor count per particle id, for all particles.
    pub contact_counts: Vec<u32>,
    /// Whether each particle lies entirely inside the guard interior.
    pub interior: Vec<bool>,
    /// Guard margin used, in voxels.
    pub margin: usize,
    pub stats: GuardStats,
}

impl ContactAnalysis {
    /// Mean contact count over interior particles only; contacts with
    /// boundary particles still count, only the key set is filtered.
    pub fn mean_interior_contacts(&self) -> f64 {
        let mut sum = 0_u64;
        let mut n = 0_u64;
        for id in 1..self.contact_counts.len() {
            if self.interior[id] {
                sum += u64::from(self.contact_counts[id]);
                n += 1;
            }
        }
        if n == 0 { 0.0 } else { sum as f64 / n as f64 }
    }

    /// Contact counts restricted to interior particle ids.
    pub fn interior_contacts(&self) -> Vec<(u32, u32)> {
        (1..self.contact_counts.len())
            .filter(|&id| self.interior[id])
            .map(|id| (id as u32, self.contact_counts[id]))
            .collect()
    }
}

/// Count pairwise contacts in `labels` and apply the guard-volume filter.
/// The label volume is never mutated.
pub fn analyze_contacts(labels: &Volume<i32>, connectivity: Connectivity) -> ContactAnalysis {
    let volumes = crate::metrics::particle_volumes(labels);
    let n = volumes.len() - 1;

    let pairs = contact_pairs(labels, connectivity);
    let mut neighbor_sets: Vec<HashSet<u32>> = vec![HashSet::new(); n + 1];
    for &(a, b) in &pairs {
        neighbor_sets[a as usize].insert(b);
        neighbor_sets[b as usize].insert(a);
    }
    let contact_counts: Vec<u32> = neighbor_sets.iter().map(|s| s.len() as u32).collect();

    let margin = guard_margin(labels.shape().min_dim(), &volumes);
    let interior = interior_particles(labels, margin, n);
    let interior_count = interior.iter().skip(1).filter(|&&v| v).count();

    let stats = GuardStats {
        total_particles: n,
        interior_particles: interior_count,
        excluded_particles: n - interior_count,
    };
    info!(
        "guard filter: margin={margin} voxels, {} interior / {} total particles",
        stats.interior_particles, stats.total_particles
    );

    ContactAnalysis {
        contact_counts,
        interior,
        margin,
        stats,
    }
}

/// Distinct contacting label pairs `(min, max)` found across all offsets of
/// the connectivity, deduplicated.
fn contact_pairs(labels: &Volume<i32>, connectivity: Connectivity) -> Vec<(u32, u32)> {
    let offsets = connectivity.offsets();

    let per_offset: Vec<HashSet<(u32, u32)>> = offsets
        .par_iter()
        .map(|&offset| pairs_for_offset(labels, offset))
        .collect();

    let mut merged: HashSet<(u32, u32)> = HashSet::new();
    for set in per_offset {
        merged.extend(set);
    }
    let mut pairs: Vec<(u32, u32)> = merged.into_iter().collect();
    pairs.sort_unstable();
    pairs
}

/// Contacting label pairs across a single `(dz, dy, dx)` shift.
fn pairs_for_offset(labels: &Volume<i32>, offset: (i32, i32, i32)) -> HashSet<(u32, u32)> {
    let shape = labels.shape();
    let (slices, rows, cols) = (
        shape.slices as i32,
        shape.rows as i32,
        shape.cols as i32,
    );
    let (dz, dy, dx) = offset;

    // Overlap of the volume with itself shifted by the offset.
    let z_range = (-dz).max(0)..(slices - dz).min(slices);
    let y_range = (-dy).max(0)..(rows - dy).min(rows);
    let x_range = (-dx).max(0)..(cols - dx).min(cols);

    let mut pairs = HashSet::new();
    let data = labels.data();
    let stride =
        dx as isize + dy as isize * cols as isize + dz as isize * cols as isize * rows as isize;

    for z in z_range {
        for y in y_range.clone() {
            let row_base = shape.index(z as usize, y as usize, 0);
            for x in x_range.clone() {
                let idx = row_base + x as usize;
                let a = data[idx];
                if a <= 0 {
                    continue;
                }
                let b = data[(idx as isize + stride) as usize];
                if b > 0 && a != b {
                    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                    pairs.insert((lo as u32, hi as u32));
                }
            }
        }
    }
    pairs
}

/// Guard margin from the largest equivalent-sphere radius:
/// `max(min_margin, ceil(α · r_eq))`, capped at 6 % of the shortest
/// dimension — but never below the minimum margin, which takes priority.
pub fn guard_margin(min_dim: usize, volumes: &[u64]) -> usize {
    let v_max = volumes.iter().skip(1).copied().max().unwrap_or(0);
    // r_eq = (3 V / 4π)^(1/3)
    let r_eq = (3.0 * v_max as f64 / (4.0 * PI)).cbrt();
    let scaled = (GUARD_MARGIN_MULTIPLIER * r_eq).ceil() as usize;
    let margin = scaled.max(MIN_GUARD_MARGIN);

    let max_allowed = (min_dim as f64 * GUARD_MARGIN_DIM_FRACTION) as usize;
    let capped = margin.min(max_allowed).max(MIN_GUARD_MARGIN);
    if capped != margin {
        debug!("guard margin {margin} capped to {capped} by volume size");
    }
    capped
}

/// For each particle, whether every voxel lies at least `margin` away from
/// all six faces. Computed from per-label bounding boxes in one pass; the
/// interior region is a box, so the bounding-box test is exact.
fn interior_particles(labels: &Volume<i32>, margin: usize, n: usize) -> Vec<bool> {
    let shape = labels.shape();
    let (slices, rows, cols) = (shape.slices, shape.rows, shape.cols);

    // Bounding boxes as (min_z, min_y, min_x, max_z, max_y, max_x).
    let mut bbox_min = vec![(usize::MAX, usize::MAX, usize::MAX); n + 1];
    let mut bbox_max = vec![(0_usize, 0_usize, 0_usize); n + 1];

    let data = labels.data();
    let mut idx = 0;
    for z in 0..slices {
        for y in 0..rows {
            for x in 0..cols {
                let l = data[idx];
                idx += 1;
                if l <= 0 {
                    continue;
                }
                let id = l as usize;
                let mn = &mut bbox_min[id];
                mn.0 = mn.0.min(z);
                mn.1 = mn.1.min(y);
                mn.2 = mn.2.min(x);
                let mx = &mut bbox_max[id];
                mx.0 = mx.0.max(z);
                mx.1 = mx.1.max(y);
                mx.2 = mx.2.max(x);
            }
        }
    }

    // The interior box is empty when the margin swallows a dimension; every
    // particle is boundary then.
    let fits = slices > 2 * margin && rows > 2 * margin && cols > 2 * margin;

    let mut interior = vec![false; n + 1];
    if fits {
        for id in 1..=n {
            let (z0, y0, x0) = bbox_min[id];
            if z0 == usize::MAX {
                continue;
            }
            let (z1, y1, x1) = bbox_max[id];
            interior[id] = z0 >= margin
                && y0 >= margin
                && x0 >= margin
                && z1 < slices - margin
                && y1 < rows - margin
                && x1 < cols - margin;
        }
    }
    interior
}

/// Summary statistics over a set of contact counts, used for diagnostics
/// logging alongside the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: u32,
    pub max: u32,
    pub q25: f64,
    pub q75: f64,
}

/// Compute [`ContactSummary`] over the given counts. Empty input yields the
/// all-zero summary.
pub fn summarize_contacts(counts: &[u32]) -> ContactSummary {
    if counts.is_empty() {
        return ContactSummary {
            count: 0,
            mean: 0.0,
            median: 0.0,
            std_dev: 0.0,
            min: 0,
            max: 0,
            q25: 0.0,
            q75: 0.0,
        };
    }

    let mut sorted = counts.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let mean = sorted.iter().map(|&c| f64::from(c)).sum::<f64>() / n as f64;
    let var = sorted
        .iter()
        .map(|&c| {
            let d = f64::from(c) - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;

    // Linear-interpolated percentile over the sorted counts.
    let percentile = |p: f64| -> f64 {
        let rank = p * (n - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f64;
        f64::from(sorted[lo]) * (1.0 - frac) + f64::from(sorted[hi]) * frac
    };

    ContactSummary {
        count: n,
        mean,
        median: percentile(0.5),
        std_dev: var.sqrt(),
        min: sorted[0],
        max: sorted[n - 1],
        q25: percentile(0.25),
        q75: percentile(0.75),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeShape;

    fn shape(z: usize, y: usize, x: usize) -> VolumeShape {
        VolumeShape {
            slices: z,
            rows: y,
            cols: x,
        }
    }

    fn add_box(
        vol: &mut Volume<i32>,
        label: i32,
        z: std::ops::Range<usize>,
        y: std::ops::Range<usize>,
        x: std::ops::Range<usize>,
    ) {
        for zz in z {
            for yy in y.clone() {
                for xx in x.clone() {
                    vol.set(zz, yy, xx, label);
                }
            }
        }
    }

    // =========================================================================
    // Contact Counting Tests
    // =========================================================================

    mod counting {
        use super::*;

        #[test]
        fn touching_boxes_contact_each_other() {
            let mut labels = Volume::filled(shape(4, 4, 8), 0_i32);
            add_box(&mut labels, 1, 0..4, 0..4, 0..4);
            add_box(&mut labels, 2, 0..4, 0..4, 4..8);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.contact_counts[1], 1);
            assert_eq!(analysis.contact_counts[2], 1);
        }

        #[test]
        fn separated_boxes_have_no_contacts() {
            let mut labels = Volume::filled(shape(4, 4, 10), 0_i32);
            add_box(&mut labels, 1, 0..4, 0..4, 0..3);
            add_box(&mut labels, 2, 0..4, 0..4, 6..10);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.contact_counts[1], 0);
            assert_eq!(analysis.contact_counts[2], 0);
        }

        #[test]
        fn diagonal_touch_counts_only_under_26() {
            // Two voxels sharing only a corner.
            let mut labels = Volume::filled(shape(2, 2, 2), 0_i32);
            labels.set(0, 0, 0, 1);
            labels.set(1, 1, 1, 2);

            let six = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(six.contact_counts[1], 0);
            assert_eq!(six.contact_counts[2], 0);

            let full = analyze_contacts(&labels, Connectivity::TwentySix);
            assert_eq!(full.contact_counts[1], 1);
            assert_eq!(full.contact_counts[2], 1);
        }

        #[test]
        fn edge_adjacency_counts_only_under_26() {
            // Two boxes sharing an edge, not a face.
            let mut labels = Volume::filled(shape(2, 4, 4), 0_i32);
            add_box(&mut labels, 1, 0..2, 0..2, 0..2);
            add_box(&mut labels, 2, 0..2, 2..4, 2..4);

            let six = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(six.contact_counts[1], 0);
            assert_eq!(six.contact_counts[2], 0);

            let full = analyze_contacts(&labels, Connectivity::TwentySix);
            assert_eq!(full.contact_counts[1], 1);
            assert_eq!(full.contact_counts[2], 1);
        }

        #[test]
        fn contacts_are_symmetric() {
            // A chain 1-2-3: ends touch only the middle.
            let mut labels = Volume::filled(shape(2, 2, 9), 0_i32);
            add_box(&mut labels, 1, 0..2, 0..2, 0..3);
            add_box(&mut labels, 2, 0..2, 0..2, 3..6);
            add_box(&mut labels, 3, 0..2, 0..2, 6..9);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.contact_counts[1], 1);
            assert_eq!(analysis.contact_counts[2], 2);
            assert_eq!(analysis.contact_counts[3], 1);
        }

        #[test]
        fn multiple_shared_faces_count_once() {
            // Labels 1 and 2 share a large flat interface: still one
            // distinct neighbor each.
            let mut labels = Volume::filled(shape(6, 6, 6), 0_i32);
            add_box(&mut labels, 1, 0..6, 0..6, 0..3);
            add_box(&mut labels, 2, 0..6, 0..6, 3..6);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.contact_counts[1], 1);
            assert_eq!(analysis.contact_counts[2], 1);
        }

        #[test]
        fn empty_volume_has_no_particles() {
            let labels = Volume::filled(shape(3, 3, 3), 0_i32);
            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.stats.total_particles, 0);
            assert_eq!(analysis.contact_counts.len(), 1);
        }
    }

    // =========================================================================
    // Guard Margin Tests
    // =========================================================================

    mod guard {
        use super::*;

        #[test]
        fn margin_never_drops_below_minimum() {
            // Tiny particles: scaled margin is small, minimum wins even
            // though the 6 % cap is smaller still.
            let volumes = vec![0_u64, 10, 12];
            assert_eq!(guard_margin(40, &volumes), MIN_GUARD_MARGIN);
        }

        #[test]
        fn margin_scales_with_large_particles() {
            // r_eq for 4e6 voxels is ~98.4; 0.3 * r_eq ≈ 30. Cap for a 600³
            // volume is 36, so the scaled value survives.
            let volumes = vec![0_u64, 4_000_000];
            let m = guard_margin(600, &volumes);
            assert!(m > MIN_GUARD_MARGIN, "margin {m} should exceed minimum");
            assert!(m <= 36);
        }

        #[test]
        fn cap_limits_margin_on_small_volumes() {
            // Large particle in a small volume: cap (6 % of 300 = 18)
            // applies below the scaled value but above the minimum.
            let volumes = vec![0_u64, 4_000_000];
            assert_eq!(guard_margin(300, &volumes), 18);
        }

        #[test]
        fn cap_never_pushes_below_the_minimum() {
            // Tiny volume: the 6 % cap would allow only 3 voxels, but the
            // minimum margin wins.
            let volumes = vec![0_u64, 4_000_000];
            assert_eq!(guard_margin(50, &volumes), MIN_GUARD_MARGIN);
        }

        #[test]
        fn no_particles_gives_minimum_margin() {
            let volumes = vec![0_u64];
            assert_eq!(guard_margin(100, &volumes), MIN_GUARD_MARGIN);
        }
    }

    // =========================================================================
    // Interior Partition Tests
    // =========================================================================

    mod interior {
        use super::*;

        #[test]
        fn central_particle_is_interior() {
            // 40³ volume: margin 10, interior box [10, 30).
            let mut labels = Volume::filled(shape(40, 40, 40), 0_i32);
            add_box(&mut labels, 1, 18..22, 18..22, 18..22);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert!(analysis.interior[1]);
            assert_eq!(analysis.stats.interior_particles, 1);
            assert_eq!(analysis.stats.excluded_particles, 0);
        }

        #[test]
        fn particle_touching_margin_is_excluded() {
            let mut labels = Volume::filled(shape(40, 40, 40), 0_i32);
            add_box(&mut labels, 1, 5..9, 18..22, 18..22);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert!(!analysis.interior[1]);
            assert_eq!(analysis.stats.excluded_particles, 1);
        }

        #[test]
        fn partition_is_total() {
            let mut labels = Volume::filled(shape(40, 40, 40), 0_i32);
            add_box(&mut labels, 1, 0..4, 0..4, 0..4);
            add_box(&mut labels, 2, 18..22, 18..22, 18..22);
            add_box(&mut labels, 3, 36..40, 36..40, 36..40);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            let stats = analysis.stats;
            assert_eq!(
                stats.interior_particles + stats.excluded_particles,
                stats.total_particles
            );
            assert_eq!(stats.interior_particles, 1);
        }

        #[test]
        fn interior_contacts_keep_boundary_neighbors_in_the_count() {
            // Interior particle 2 touches boundary particle 1; particle 2's
            // count still includes that contact.
            let mut labels = Volume::filled(shape(40, 40, 40), 0_i32);
            add_box(&mut labels, 1, 5..15, 15..25, 15..25);
            add_box(&mut labels, 2, 15..25, 15..25, 15..25);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert!(!analysis.interior[1]);
            assert!(analysis.interior[2]);
            assert_eq!(analysis.contact_counts[2], 1);
            assert!((analysis.mean_interior_contacts() - 1.0).abs() < 1e-12);

            let interior = analysis.interior_contacts();
            assert_eq!(interior, vec![(2, 1)]);
        }

        #[test]
        fn tiny_volume_excludes_everything() {
            // 12³ with margin 10: the interior box is empty.
            let mut labels = Volume::filled(shape(12, 12, 12), 0_i32);
            add_box(&mut labels, 1, 4..8, 4..8, 4..8);

            let analysis = analyze_contacts(&labels, Connectivity::Six);
            assert_eq!(analysis.stats.interior_particles, 0);
            assert_eq!(analysis.mean_interior_contacts(), 0.0);
        }
    }

    // =========================================================================
    // Contact Summary Tests
    // =========================================================================

    mod summary {
        use super::*;

        #[test]
        fn empty_counts_give_zero_summary() {
            let s = summarize_contacts(&[]);
            assert_eq!(s.count, 0);
            assert_eq!(s.mean, 0.0);
        }

        #[test]
        fn mean_and_extremes() {
            let s = summarize_contacts(&[2, 4, 6]);
            assert_eq!(s.count, 3);
            assert!((s.mean - 4.0).abs() < 1e-12);
            assert_eq!(s.min, 2);
            assert_eq!(s.max, 6);
            assert!((s.median - 4.0).abs() < 1e-12);
        }

        #[test]
        fn quartiles_interpolate() {
            let s = summarize_contacts(&[1, 2, 3, 4]);
            assert!((s.q25 - 1.75).abs() < 1e-12);
            assert!((s.q75 - 3.25).abs() < 1e-12);
        }
    }
}
