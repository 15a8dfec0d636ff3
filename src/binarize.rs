//! High-precision 3D binarization: two-stage Otsu (or Triangle)
//! thresholding with automatic polarity, optional CLAHE contrast
//! enhancement, optional per-slice ROI, and morphological cleanup.
//!
//! Integer volumes are thresholded on exact-value histograms — one bin per
//! intensity, up to 65,536 bins for 16-bit sources — so nothing is ever
//! downscaled to 8 bits. The CLAHE path normalizes to `f32` in `[0, 1]`
//! and reports its thresholds in that space; only the boolean mask leaves
//! this module, so the float working volume never escapes.

use std::str::FromStr;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::morphology::{
    SliceMask, close_ball, close_square_2d, fill_holes_2d, largest_component_2d,
    remove_small_objects,
};
use crate::volume::{GrayVolume, Volume, VolumeShape};

/// Histogram bins for thresholding float (CLAHE) volumes.
const FLOAT_HISTOGRAM_BINS: usize = 256;

/// CLAHE tile grid (8x8 tiles per slice).
const CLAHE_TILES: usize = 8;

/// CLAHE clip limit as a fraction of the per-tile pixel count.
const CLAHE_CLIP_LIMIT: f64 = 0.01;

/// CLAHE histogram bins.
const CLAHE_BINS: usize = 256;

/// Half-width of the square element used to close per-slice ROI masks
/// (5x5 square).
const ROI_CLOSING_HALF: usize = 2;

/// Requested foreground polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// Pick the minority phase automatically.
    #[default]
    Auto,
    /// Foreground is above the threshold.
    Bright,
    /// Foreground is at or below the threshold.
    Dark,
}

impl FromStr for Polarity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Polarity::Auto),
            "bright" => Ok(Polarity::Bright),
            "dark" => Ok(Polarity::Dark),
            other => Err(Error::UnsupportedPolarity(other.to_string())),
        }
    }
}

/// How the stage-2 threshold is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    #[default]
    Otsu,
    Triangle,
}

impl FromStr for ThresholdMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "otsu" => Ok(ThresholdMethod::Otsu),
            "triangle" => Ok(ThresholdMethod::Triangle),
            other => Err(Error::UnsupportedThresholdMethod(other.to_string())),
        }
    }
}

/// Region-of-interest handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoiMode {
    /// Threshold the whole volume.
    #[default]
    None,
    /// Per slice: close the nonzero mask, fill holes, keep the largest
    /// component; thresholds and polarity counts are then restricted to
    /// the stacked ROI.
    PerSliceLargestComponent,
}

/// How the polarity was actually resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolarityOutcome {
    AutoNormal,
    AutoInverted,
    ForcedBright,
    ForcedDark,
}

impl PolarityOutcome {
    /// Stable string form used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolarityOutcome::AutoNormal => "auto-normal",
            PolarityOutcome::AutoInverted => "auto-inverted",
            PolarityOutcome::ForcedBright => "forced-bright",
            PolarityOutcome::ForcedDark => "forced-dark",
        }
    }
}

/// Binarizer configuration.
#[derive(Debug, Clone)]
pub struct BinarizeOptions {
    /// Remove 6-connected foreground components below this voxel count.
    pub min_object_size: usize,
    /// Radius of the spherical closing element; 0 disables closing.
    pub closing_radius: u32,
    pub polarity: Polarity,
    pub threshold_method: ThresholdMethod,
    pub clahe_enabled: bool,
    pub roi_mode: RoiMode,
}

impl Default for BinarizeOptions {
    fn default() -> Self {
        Self {
            min_object_size: 100,
            closing_radius: 0,
            polarity: Polarity::Auto,
            threshold_method: ThresholdMethod::Otsu,
            clahe_enabled: false,
            roi_mode: RoiMode::None,
        }
    }
}

/// Everything worth knowing about one binarization run.
#[derive(Debug, Clone, Serialize)]
pub struct BinarizationInfo {
    pub num_slices: usize,
    /// `(Z, Y, X)`.
    pub shape: (usize, usize, usize),
    /// `"u8"` or `"u16"`.
    pub source_dtype: String,
    /// Stage-1 threshold, in source units (normalized units under CLAHE).
    pub threshold_stage1: f64,
    /// Stage-2 threshold, same space as stage 1.
    pub threshold_stage2: f64,
    pub polarity: PolarityOutcome,
    /// Fraction of voxels that ended up foreground.
    pub foreground_ratio: f64,
    /// Mean intensity at or below the stage-2 threshold.
    pub mean_below: f64,
    /// Mean intensity above the stage-2 threshold.
    pub mean_above: f64,
    pub closing_radius: u32,
    pub min_object_size: usize,
    pub threshold_method: ThresholdMethod,
    pub clahe_enabled: bool,
}

impl BinarizationInfo {
    /// Whether the run produced no foreground at all. Informational, not
    /// an error: the pipeline completes cleanly with zero particles.
    pub fn empty_foreground(&self) -> bool {
        self.foreground_ratio == 0.0
    }
}

/// Binarize a grayscale volume. Always succeeds; an empty foreground is
/// reported through the info record.
pub fn binarize(volume: &GrayVolume, options: &BinarizeOptions) -> (Volume<bool>, BinarizationInfo) {
    let shape = volume.shape();

    // CLAHE converts to a normalized float volume; both paths then share
    // the same two-stage threshold machinery via per-voxel sampling.
    let working = if options.clahe_enabled {
        debug!("applying CLAHE slice by slice");
        Working::Float(clahe_volume(volume))
    } else {
        Working::Int(volume)
    };

    let roi = match options.roi_mode {
        RoiMode::None => None,
        RoiMode::PerSliceLargestComponent => Some(build_roi(&working, shape)),
    };

    // Stage 1: Otsu over the whole volume, ignoring exact-zero voxels when
    // any are present (CT air padding would otherwise swamp the histogram).
    let zeros_present = (0..shape.len()).any(|i| working.value(i) == 0.0);
    let t1 = threshold(
        &working,
        ThresholdMethod::Otsu,
        |i, v| !(zeros_present && v == 0.0) && roi_allows(&roi, i),
    )
    .unwrap_or_else(|| working.min_value());

    // Stage 2: threshold the survivors of stage 1. A degenerate survivor
    // set (empty, or a single intensity) falls back to t1 — a uniform
    // bright phase must not threshold itself away.
    let t2 = threshold(&working, options.threshold_method, |i, v| {
        v > t1 && roi_allows(&roi, i)
    })
    .unwrap_or(t1);

    debug!("stage thresholds: t1={t1:.4}, t2={t2:.4}");

    // Polarity: the minority side of t2 is the foreground. Counts are
    // restricted to the ROI when one is active.
    let mut below = 0_u64;
    let mut above = 0_u64;
    let mut sum_below = 0.0_f64;
    let mut sum_above = 0.0_f64;
    for i in 0..shape.len() {
        if !roi_allows(&roi, i) {
            continue;
        }
        let v = working.value(i);
        if v > t2 {
            above += 1;
            sum_above += v;
        } else {
            below += 1;
            sum_below += v;
        }
    }

    let outcome = match options.polarity {
        Polarity::Bright => PolarityOutcome::ForcedBright,
        Polarity::Dark => PolarityOutcome::ForcedDark,
        Polarity::Auto => {
            if above <= below {
                PolarityOutcome::AutoNormal
            } else {
                PolarityOutcome::AutoInverted
            }
        }
    };

    let take_above = matches!(
        outcome,
        PolarityOutcome::AutoNormal | PolarityOutcome::ForcedBright
    );
    let mask_data: Vec<bool> = (0..shape.len())
        .map(|i| {
            let keep = if take_above {
                working.value(i) > t2
            } else {
                working.value(i) <= t2
            };
            keep && roi_allows(&roi, i)
        })
        .collect();
    let mut mask = Volume::from_vec(shape, mask_data);

    if options.closing_radius > 0 {
        debug!("binary closing (radius={})", options.closing_radius);
        mask = close_ball(&mask, options.closing_radius);
    }
    if options.min_object_size > 0 {
        mask = remove_small_objects(&mask, options.min_object_size);
    }

    let foreground = mask.count_true();
    let foreground_ratio = if shape.is_empty() {
        0.0
    } else {
        foreground as f64 / shape.len() as f64
    };
    if foreground == 0 {
        warn!("binarization produced an empty foreground");
    }

    let info = BinarizationInfo {
        num_slices: shape.slices,
        shape: (shape.slices, shape.rows, shape.cols),
        source_dtype: match volume {
            GrayVolume::U8(_) => "u8".to_string(),
            GrayVolume::U16(_) => "u16".to_string(),
        },
        threshold_stage1: t1,
        threshold_stage2: t2,
        polarity: outcome,
        foreground_ratio,
        mean_below: if below == 0 { 0.0 } else { sum_below / below as f64 },
        mean_above: if above == 0 { 0.0 } else { sum_above / above as f64 },
        closing_radius: options.closing_radius,
        min_object_size: options.min_object_size,
        threshold_method: options.threshold_method,
        clahe_enabled: options.clahe_enabled,
    };

    info!(
        "binarization: polarity={}, foreground={:.2}%, t1={:.4}, t2={:.4}",
        info.polarity.as_str(),
        info.foreground_ratio * 100.0,
        t1,
        t2
    );

    (mask, info)
}

/// Working intensity source: native integers, or the normalized CLAHE
/// output.
enum Working<'a> {
    Int(&'a GrayVolume),
    Float(Vec<f32>),
}

impl Working<'_> {
    #[inline]
    fn value(&self, idx: usize) -> f64 {
        match self {
            Working::Int(gray) => f64::from(gray.value_at(idx)),
            Working::Float(values) => f64::from(values[idx]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Working::Int(gray) => gray.shape().len(),
            Working::Float(values) => values.len(),
        }
    }

    fn min_value(&self) -> f64 {
        let min = (0..self.len())
            .map(|i| self.value(i))
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() { min } else { 0.0 }
    }
}

#[inline]
fn roi_allows(roi: &Option<Volume<bool>>, idx: usize) -> bool {
    roi.as_ref().is_none_or(|r| r.data()[idx])
}

/// Threshold the voxels passing `filter` with the given method. Returns
/// `None` when the selection is empty or has a single distinct intensity.
fn threshold(
    working: &Working,
    method: ThresholdMethod,
    filter: impl Fn(usize, f64) -> bool,
) -> Option<f64> {
    let hist = build_histogram(working, &filter)?;
    let bin = match method {
        ThresholdMethod::Otsu => otsu_bin(&hist.counts)?,
        ThresholdMethod::Triangle => triangle_bin(&hist.counts)?,
    };
    Some(hist.threshold_value(bin))
}

/// Histogram over a filtered voxel selection. Integer sources get one bin
/// per intensity value; float sources get 256 min–max bins.
struct Histogram {
    counts: Vec<u64>,
    min: f64,
    width: f64,
    /// Integer histograms threshold at the bin value itself; float
    /// histograms at the bin's upper edge.
    integer: bool,
}

impl Histogram {
    fn threshold_value(&self, bin: usize) -> f64 {
        if self.integer {
            self.min + bin as f64
        } else {
            self.min + (bin as f64 + 1.0) * self.width
        }
    }
}

fn build_histogram(working: &Working, filter: &impl Fn(usize, f64) -> bool) -> Option<Histogram> {
    match working {
        Working::Int(gray) => {
            let mut counts = vec![0_u64; gray.dtype_max() as usize + 1];
            for i in 0..working.len() {
                let v = working.value(i);
                if filter(i, v) {
                    counts[v as usize] += 1;
                }
            }
            Some(Histogram {
                counts,
                min: 0.0,
                width: 1.0,
                integer: true,
            })
        }
        Working::Float(values) => {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            let mut any = false;
            for (i, &v) in values.iter().enumerate() {
                let v = f64::from(v);
                if filter(i, v) {
                    min = min.min(v);
                    max = max.max(v);
                    any = true;
                }
            }
            if !any || max <= min {
                return None;
            }
            let width = (max - min) / FLOAT_HISTOGRAM_BINS as f64;
            let mut counts = vec![0_u64; FLOAT_HISTOGRAM_BINS];
            for (i, &v) in values.iter().enumerate() {
                let v = f64::from(v);
                if filter(i, v) {
                    let bin = (((v - min) / width) as usize).min(FLOAT_HISTOGRAM_BINS - 1);
                    counts[bin] += 1;
                }
            }
            Some(Histogram {
                counts,
                min,
                width,
                integer: false,
            })
        }
    }
}

/// Otsu's threshold over a histogram: the bin maximizing the between-class
/// variance, averaging the first and last bin of a tied maximum. `None`
/// when the histogram holds fewer than two distinct intensities.
fn otsu_bin(counts: &[u64]) -> Option<usize> {
    let total: u64 = counts.iter().sum();
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || distinct < 2 {
        return None;
    }

    let total_f = total as f64;
    let total_sum: f64 = counts
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut best_first = 0_usize;
    let mut best_last = 0_usize;
    let mut best_variance = 0.0_f64;
    let mut bg_count = 0.0_f64;
    let mut bg_sum = 0.0_f64;

    for (t, &count) in counts.iter().enumerate() {
        bg_count += count as f64;
        if bg_count == 0.0 {
            continue;
        }
        let fg_count = total_f - bg_count;
        if fg_count == 0.0 {
            break;
        }
        bg_sum += t as f64 * count as f64;
        let fg_sum = total_sum - bg_sum;

        let mean_bg = bg_sum / bg_count;
        let mean_fg = fg_sum / fg_count;
        let diff = mean_bg - mean_fg;
        let variance = bg_count * fg_count * diff * diff;

        if variance > best_variance {
            best_variance = variance;
            best_first = t;
            best_last = t;
        } else if (variance - best_variance).abs() <= f64::EPSILON * best_variance.abs() {
            best_last = t;
        }
    }

    Some((best_first + best_last) / 2)
}

/// Triangle threshold: the bin of maximum vertical distance between the
/// histogram and the line from its peak to the far end of the longer
/// tail. `None` for degenerate histograms.
fn triangle_bin(counts: &[u64]) -> Option<usize> {
    let total: u64 = counts.iter().sum();
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if total == 0 || distinct < 2 {
        return None;
    }

    let peak = counts
        .iter()
        .enumerate()
        .max_by_key(|&(_, &c)| c)
        .map(|(i, _)| i)?;
    let first = counts.iter().position(|&c| c > 0)?;
    let last = counts.iter().rposition(|&c| c > 0)?;

    let peak_height = counts[peak] as f64;
    // Walk the longer tail; the shorter one carries no valley.
    let right_tail = last - peak >= peak - first;
    let (from, to) = if right_tail { (peak, last) } else { (first, peak) };
    if to == from {
        return None;
    }

    let mut best = from;
    let mut best_dist = f64::NEG_INFINITY;
    for b in from..=to {
        // Height of the peak-to-tail-end line at bin b.
        let frac = if right_tail {
            (to - b) as f64 / (to - from) as f64
        } else {
            (b - from) as f64 / (to - from) as f64
        };
        let line = peak_height * frac;
        let dist = line - counts[b] as f64;
        if dist > best_dist {
            best_dist = dist;
            best = b;
        }
    }
    Some(best)
}

/// Stack of per-slice ROIs: nonzero mask, 5x5 closing, hole fill, largest
/// 8-connected component.
fn build_roi(working: &Working, shape: VolumeShape) -> Volume<bool> {
    let slice_len = shape.rows * shape.cols;
    let mut roi = Volume::filled(shape, false);

    for z in 0..shape.slices {
        let base = z * slice_len;
        let data: Vec<bool> = (0..slice_len).map(|i| working.value(base + i) > 0.0).collect();
        let mask = SliceMask {
            rows: shape.rows,
            cols: shape.cols,
            data,
        };
        let closed = close_square_2d(&mask, ROI_CLOSING_HALF);
        let filled = fill_holes_2d(&closed);
        let largest = largest_component_2d(&filled);
        roi.data_mut()[base..base + slice_len].copy_from_slice(&largest.data);
    }
    roi
}

// =============================================================================
// CLAHE
// =============================================================================

/// Contrast-limited adaptive histogram equalization, slice by slice, over
/// a dtype-normalized copy of the volume. Output values are in `[0, 1]`.
fn clahe_volume(volume: &GrayVolume) -> Vec<f32> {
    let shape = volume.shape();
    let slice_len = shape.rows * shape.cols;
    let scale = 1.0 / volume.dtype_max() as f32;

    let mut out = vec![0.0_f32; shape.len()];
    out.par_chunks_mut(slice_len)
        .enumerate()
        .for_each(|(z, slice_out)| {
            let base = z * slice_len;
            let normalized: Vec<f32> = (0..slice_len)
                .map(|i| volume.value_at(base + i) as f32 * scale)
                .collect();
            clahe_slice(&normalized, shape.rows, shape.cols, slice_out);
        });
    out
}

/// CLAHE on one normalized slice: per-tile clipped histograms, CDF
/// mappings, bilinear interpolation between the four surrounding tiles.
fn clahe_slice(values: &[f32], rows: usize, cols: usize, out: &mut [f32]) {
    let tiles_y = CLAHE_TILES.min(rows.max(1));
    let tiles_x = CLAHE_TILES.min(cols.max(1));
    let tile_h = rows.div_ceil(tiles_y);
    let tile_w = cols.div_ceil(tiles_x);

    let bin_of = |v: f32| -> usize {
        ((f64::from(v) * (CLAHE_BINS - 1) as f64).round() as usize).min(CLAHE_BINS - 1)
    };

    // Per-tile equalization mapping: bin -> output level in [0, 1].
    let mut mappings = vec![vec![0.0_f32; CLAHE_BINS]; tiles_y * tiles_x];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let y0 = ty * tile_h;
            let y1 = ((ty + 1) * tile_h).min(rows);
            let x0 = tx * tile_w;
            let x1 = ((tx + 1) * tile_w).min(cols);

            let mut hist = vec![0_u64; CLAHE_BINS];
            let mut pixels = 0_u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[bin_of(values[x + y * cols])] += 1;
                    pixels += 1;
                }
            }
            if pixels == 0 {
                continue;
            }

            // Clip and redistribute the excess uniformly.
            let clip = ((CLAHE_CLIP_LIMIT * pixels as f64) as u64).max(1);
            let mut excess = 0_u64;
            for h in hist.iter_mut() {
                if *h > clip {
                    excess += *h - clip;
                    *h = clip;
                }
            }
            let share = excess / CLAHE_BINS as u64;
            let mut remainder = (excess % CLAHE_BINS as u64) as usize;
            for h in hist.iter_mut() {
                *h += share;
                if remainder > 0 {
                    *h += 1;
                    remainder -= 1;
                }
            }

            let mapping = &mut mappings[tx + ty * tiles_x];
            let mut cum = 0_u64;
            for (bin, &h) in hist.iter().enumerate() {
                cum += h;
                mapping[bin] = (cum as f64 / pixels as f64) as f32;
            }
        }
    }

    // Bilinear interpolation between tile centers.
    for y in 0..rows {
        for x in 0..cols {
            let bin = bin_of(values[x + y * cols]);

            // Position relative to tile centers, clamped so border pixels
            // stay with their edge tile instead of extrapolating.
            let fy = ((y as f64 - tile_h as f64 / 2.0) / tile_h as f64).max(0.0);
            let fx = ((x as f64 - tile_w as f64 / 2.0) / tile_w as f64).max(0.0);
            let ty0 = (fy.floor() as usize).min(tiles_y - 1);
            let tx0 = (fx.floor() as usize).min(tiles_x - 1);
            let ty1 = (ty0 + 1).min(tiles_y - 1);
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let wy = (fy - fy.floor()).clamp(0.0, 1.0);
            let wx = (fx - fx.floor()).clamp(0.0, 1.0);
            let (wy, wx) = (wy as f32, wx as f32);

            let m00 = mappings[tx0 + ty0 * tiles_x][bin];
            let m01 = mappings[tx1 + ty0 * tiles_x][bin];
            let m10 = mappings[tx0 + ty1 * tiles_x][bin];
            let m11 = mappings[tx1 + ty1 * tiles_x][bin];

            let top = m00 * (1.0 - wx) + m01 * wx;
            let bottom = m10 * (1.0 - wx) + m11 * wx;
            out[x + y * cols] = top * (1.0 - wy) + bottom * wy;
        }
    }
}
