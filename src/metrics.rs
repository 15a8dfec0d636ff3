//! Per-particle metrics over label volumes: size statistics, dominance
//! indices, and partition-comparison measures.
//!
//! Particles are plain integer ids, so everything here works on parallel
//! arrays indexed by label instead of per-particle objects.

use std::collections::HashMap;

use crate::volume::Volume;

/// Voxel count per particle, computed with a single histogram pass.
///
/// The returned vector has length `N + 1`; index 0 (background) is always 0.
pub fn particle_volumes(labels: &Volume<i32>) -> Vec<u64> {
    let max_label = labels.data().iter().copied().max().unwrap_or(0).max(0);
    let mut volumes = vec![0_u64; max_label as usize + 1];
    for &l in labels.data() {
        if l > 0 {
            volumes[l as usize] += 1;
        }
    }
    volumes
}

/// Ratio of the largest particle's volume to the total particle volume,
/// with the contributing voxel counts. Zero particles gives `(0.0, 0, 0)`.
pub fn largest_particle_ratio(labels: &Volume<i32>) -> (f64, u64, u64) {
    let volumes = particle_volumes(labels);
    largest_ratio_from_volumes(&volumes)
}

/// Same as [`largest_particle_ratio`], from a precomputed volume histogram.
pub fn largest_ratio_from_volumes(volumes: &[u64]) -> (f64, u64, u64) {
    let largest = volumes.iter().skip(1).copied().max().unwrap_or(0);
    let total: u64 = volumes.iter().skip(1).sum();
    if total == 0 {
        return (0.0, 0, 0);
    }
    (largest as f64 / total as f64, largest, total)
}

/// Cumulative volume share of the `k` largest particles, `k >= 1` clamped
/// to the particle count. 0 when there are no particles.
pub fn topk_share(labels: &Volume<i32>, k: usize) -> f64 {
    let k = k.max(1);
    let mut volumes: Vec<u64> = particle_volumes(labels)
        .into_iter()
        .skip(1)
        .filter(|&v| v > 0)
        .collect();
    if volumes.is_empty() {
        return 0.0;
    }
    volumes.sort_unstable_by(|a, b| b.cmp(a));
    let total: u64 = volumes.iter().sum();
    let top: u64 = volumes.iter().take(k).sum();
    top as f64 / total as f64
}

/// Herfindahl–Hirschman Index over particle volume shares: `Σ sᵢ²`.
/// In `(0, 1]` for one or more particles, 0 for none.
pub fn hhi(labels: &Volume<i32>) -> f64 {
    hhi_from_volumes(&particle_volumes(labels))
}

/// Same as [`hhi`], from a precomputed volume histogram.
pub fn hhi_from_volumes(volumes: &[u64]) -> f64 {
    let total: u64 = volumes.iter().skip(1).sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    volumes
        .iter()
        .skip(1)
        .map(|&v| {
            let share = v as f64 / total;
            share * share
        })
        .sum()
}

/// Gini coefficient of the particle volume distribution, Lorenz-curve
/// formula, clamped to `[0, 1]`. 0 for uniform sizes.
pub fn gini(labels: &Volume<i32>) -> f64 {
    let mut volumes: Vec<u64> = particle_volumes(labels)
        .into_iter()
        .skip(1)
        .filter(|&v| v > 0)
        .collect();
    let n = volumes.len();
    if n <= 1 {
        return 0.0;
    }
    volumes.sort_unstable();
    let total: u64 = volumes.iter().sum();
    if total == 0 {
        return 0.0;
    }

    // G = (n + 1 - 2 Σ (n + 1 - i) xᵢ / Σ xᵢ) / n with ascending xᵢ.
    let n_f = n as f64;
    let weighted: f64 = volumes
        .iter()
        .enumerate()
        .map(|(i, &v)| (n_f + 1.0 - (i as f64 + 1.0)) * v as f64)
        .sum();
    let g = (n_f + 1.0 - 2.0 * weighted / total as f64) / n_f;
    g.clamp(0.0, 1.0)
}

/// Variation of Information between two labelings of the same shape, in
/// bits: `VI = H(A) + H(B) - 2 I(A; B)`. Zero iff the partitions agree.
///
/// With `ignore_background` (the usual setting) only voxels where either
/// labeling is nonzero participate. The contingency table is built sparsely
/// over observed label pairs, never over the label-set product.
pub fn variation_of_information(
    a: &Volume<i32>,
    b: &Volume<i32>,
    ignore_background: bool,
) -> f64 {
    assert_eq!(
        a.shape(),
        b.shape(),
        "label volumes must share a shape for VI"
    );

    let mut joint: HashMap<(i32, i32), u64> = HashMap::new();
    let mut n = 0_u64;
    for (&la, &lb) in a.data().iter().zip(b.data()) {
        if ignore_background && la == 0 && lb == 0 {
            continue;
        }
        *joint.entry((la, lb)).or_insert(0) += 1;
        n += 1;
    }
    if n == 0 {
        return 0.0;
    }

    let mut marginal_a: HashMap<i32, u64> = HashMap::new();
    let mut marginal_b: HashMap<i32, u64> = HashMap::new();
    for (&(la, lb), &count) in &joint {
        *marginal_a.entry(la).or_insert(0) += count;
        *marginal_b.entry(lb).or_insert(0) += count;
    }

    let n_f = n as f64;
    let entropy = |counts: &HashMap<i32, u64>| -> f64 {
        counts
            .values()
            .map(|&c| {
                let p = c as f64 / n_f;
                -p * p.log2()
            })
            .sum()
    };
    let h_a = entropy(&marginal_a);
    let h_b = entropy(&marginal_b);

    let mut mutual = 0.0_f64;
    for (&(la, lb), &count) in &joint {
        let p_xy = count as f64 / n_f;
        let p_x = marginal_a[&la] as f64 / n_f;
        let p_y = marginal_b[&lb] as f64 / n_f;
        mutual += p_xy * (p_xy / (p_x * p_y)).log2();
    }

    // Floating-point noise can push the result a hair below zero.
    (h_a + h_b - 2.0 * mutual).max(0.0)
}

/// Dice coefficient between two binary masks of the same shape, in `[0, 1]`.
/// Two empty masks count as a perfect match.
pub fn dice_coefficient(a: &Volume<bool>, b: &Volume<bool>) -> f64 {
    assert_eq!(a.shape(), b.shape(), "masks must share a shape for Dice");
    let mut inter = 0_u64;
    let mut sum = 0_u64;
    for (&va, &vb) in a.data().iter().zip(b.data()) {
        inter += u64::from(va && vb);
        sum += u64::from(va) + u64::from(vb);
    }
    if sum == 0 {
        return 1.0;
    }
    2.0 * inter as f64 / sum as f64
}
