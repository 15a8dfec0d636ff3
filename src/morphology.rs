//! Binary morphology on 3D volumes and the 2D helpers used by the
//! per-slice ROI extraction.

use std::collections::VecDeque;

use crate::distance::squared_edt_to_background;
use crate::error::{Error, Result};
use crate::volume::{Volume, VolumeShape};

/// Neighborhood connectivity for component labeling and contact counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// 6 face neighbors.
    Six,
    /// Full 3x3x3 neighborhood minus the center (26 neighbors).
    TwentySix,
}

/// Face-neighbor offsets in `(dz, dy, dx)` order.
const OFFSETS_6: [(i32, i32, i32); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

impl Connectivity {
    /// Offset vectors of this neighborhood, `(dz, dy, dx)`.
    pub fn offsets(&self) -> Vec<(i32, i32, i32)> {
        match self {
            Connectivity::Six => OFFSETS_6.to_vec(),
            Connectivity::TwentySix => {
                let mut offsets = Vec::with_capacity(26);
                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            if (dz, dy, dx) != (0, 0, 0) {
                                offsets.push((dz, dy, dx));
                            }
                        }
                    }
                }
                offsets
            }
        }
    }

    /// Number of neighbors (6 or 26).
    pub fn degree(&self) -> u32 {
        match self {
            Connectivity::Six => 6,
            Connectivity::TwentySix => 26,
        }
    }
}

impl TryFrom<u32> for Connectivity {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            6 => Ok(Connectivity::Six),
            26 => Ok(Connectivity::TwentySix),
            other => Err(Error::InvalidConnectivity(other)),
        }
    }
}

/// Discretized ball structuring element of radius `r`: voxels with
/// `x² + y² + z² ≤ r²`. Returned as offsets from the center.
pub fn ball_offsets(radius: u32) -> Vec<(i32, i32, i32)> {
    let r = radius as i32;
    let r2 = r * r;
    let mut offsets = Vec::new();
    for dz in -r..=r {
        for dy in -r..=r {
            for dx in -r..=r {
                if dz * dz + dy * dy + dx * dx <= r2 {
                    offsets.push((dz, dy, dx));
                }
            }
        }
    }
    offsets
}

/// Erosion by the ball element of radius `r`, with everything outside the
/// volume treated as background (a particle touching a face erodes there
/// like anywhere else).
///
/// A voxel survives iff every offset within the ball stays on foreground,
/// which is exactly `squared distance to background > r²` for the discrete
/// ball; the separable transform makes this O(n) instead of O(n·|ball|).
pub fn erode_ball(mask: &Volume<bool>, radius: u32) -> Volume<bool> {
    let shape = mask.shape();
    let r = radius as usize;
    let r2 = (radius * radius) as f32;
    let sq = squared_edt_to_background(mask);

    let mut out = Volume::filled(shape, false);
    // The nearest out-of-volume voxel sits one step past the face, so
    // anything closer than r to a face erodes unconditionally.
    for z in r..shape.slices.saturating_sub(r) {
        for y in r..shape.rows.saturating_sub(r) {
            for x in r..shape.cols.saturating_sub(r) {
                let idx = shape.index(z, y, x);
                if sq.data()[idx] > r2 {
                    out.data_mut()[idx] = true;
                }
            }
        }
    }
    out
}

/// Dilation by the ball element of radius `r`: a voxel turns on iff some
/// foreground voxel lies within the ball.
pub fn dilate_ball(mask: &Volume<bool>, radius: u32) -> Volume<bool> {
    let r2 = (radius * radius) as f32;
    let complement = Volume::from_vec(mask.shape(), mask.data().iter().map(|&v| !v).collect());
    let sq = squared_edt_to_background(&complement);
    let data = sq.data().iter().map(|&d| d <= r2).collect();
    Volume::from_vec(mask.shape(), data)
}

/// 3D binary closing with the ball element: dilation followed by erosion.
///
/// The erosion step here treats the outside of the volume as foreground so
/// that closing never eats a border ring off the mask.
pub fn close_ball(mask: &Volume<bool>, radius: u32) -> Volume<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let dilated = dilate_ball(mask, radius);
    let r2 = (radius * radius) as f32;
    let sq = squared_edt_to_background(&dilated);
    let data = sq.data().iter().map(|&d| d > r2).collect();
    Volume::from_vec(mask.shape(), data)
}

/// Label connected components of `mask` with the given connectivity.
///
/// Components are discovered in raster order with a breadth-first flood,
/// so labels come out dense in `1..=count` and the assignment is
/// deterministic. Returns the label volume and the component count.
pub fn label_components(mask: &Volume<bool>, connectivity: Connectivity) -> (Volume<i32>, u32) {
    let shape = mask.shape();
    let (slices, rows, cols) = (shape.slices, shape.rows, shape.cols);
    let offsets = connectivity.offsets();

    let mut labels = Volume::filled(shape, 0_i32);
    let mut next_label = 0_u32;
    let mut queue: VecDeque<(usize, usize, usize)> = VecDeque::new();

    for z in 0..slices {
        for y in 0..rows {
            for x in 0..cols {
                let idx = shape.index(z, y, x);
                if !mask.data()[idx] || labels.data()[idx] != 0 {
                    continue;
                }
                next_label += 1;
                labels.data_mut()[idx] = next_label as i32;
                queue.push_back((z, y, x));

                while let Some((cz, cy, cx)) = queue.pop_front() {
                    for &(dz, dy, dx) in &offsets {
                        let nz = cz as i32 + dz;
                        let ny = cy as i32 + dy;
                        let nx = cx as i32 + dx;
                        if nz < 0
                            || ny < 0
                            || nx < 0
                            || nz >= slices as i32
                            || ny >= rows as i32
                            || nx >= cols as i32
                        {
                            continue;
                        }
                        let nidx = shape.index(nz as usize, ny as usize, nx as usize);
                        if mask.data()[nidx] && labels.data()[nidx] == 0 {
                            labels.data_mut()[nidx] = next_label as i32;
                            queue.push_back((nz as usize, ny as usize, nx as usize));
                        }
                    }
                }
            }
        }
    }

    (labels, next_label)
}

/// Remove 6-connected components smaller than `min_size` voxels.
pub fn remove_small_objects(mask: &Volume<bool>, min_size: usize) -> Volume<bool> {
    if min_size == 0 {
        return mask.clone();
    }

    let (labels, count) = label_components(mask, Connectivity::Six);
    let mut sizes = vec![0_usize; count as usize + 1];
    for &l in labels.data() {
        sizes[l as usize] += 1;
    }
    sizes[0] = 0;

    let data = labels
        .data()
        .iter()
        .map(|&l| l != 0 && sizes[l as usize] >= min_size)
        .collect();
    Volume::from_vec(mask.shape(), data)
}

// =============================================================================
// 2D helpers for the per-slice ROI extraction
// =============================================================================

/// One 2D slice as a flat boolean grid (`rows` x `cols`, X-fastest).
pub struct SliceMask {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<bool>,
}

impl SliceMask {
    #[inline]
    fn idx(&self, y: usize, x: usize) -> usize {
        x + y * self.cols
    }
}

/// Binary closing of a 2D mask with a square element of the given half
/// width (5x5 square for `half = 2`): dilation then erosion, both by
/// Chebyshev-distance `half`.
pub fn close_square_2d(mask: &SliceMask, half: usize) -> SliceMask {
    let dilated = square_op_2d(mask, half, true);
    square_op_2d(&dilated, half, false)
}

fn square_op_2d(mask: &SliceMask, half: usize, dilate: bool) -> SliceMask {
    let (rows, cols) = (mask.rows, mask.cols);
    let h = half as i32;
    let mut out = vec![false; rows * cols];
    for y in 0..rows {
        for x in 0..cols {
            let mut hit = !dilate;
            'scan: for dy in -h..=h {
                for dx in -h..=h {
                    let ny = y as i32 + dy;
                    let nx = x as i32 + dx;
                    let value = if ny < 0 || nx < 0 || ny >= rows as i32 || nx >= cols as i32 {
                        // Outside the slice: background for the dilation,
                        // foreground for the erosion, so closing leaves the
                        // border intact.
                        !dilate
                    } else {
                        mask.data[mask.idx(ny as usize, nx as usize)]
                    };
                    if dilate && value {
                        hit = true;
                        break 'scan;
                    }
                    if !dilate && !value {
                        hit = false;
                        break 'scan;
                    }
                }
            }
            out[x + y * cols] = hit;
        }
    }
    SliceMask {
        rows,
        cols,
        data: out,
    }
}

/// Fill holes of a 2D mask: background regions not reachable from the
/// slice border become foreground.
pub fn fill_holes_2d(mask: &SliceMask) -> SliceMask {
    let (rows, cols) = (mask.rows, mask.cols);
    if rows == 0 || cols == 0 {
        return SliceMask {
            rows,
            cols,
            data: Vec::new(),
        };
    }
    let mut reachable = vec![false; rows * cols];
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

    let try_seed = |y: usize, x: usize, reachable: &mut Vec<bool>, queue: &mut VecDeque<(usize, usize)>| {
        let i = x + y * cols;
        if !mask.data[i] && !reachable[i] {
            reachable[i] = true;
            queue.push_back((y, x));
        }
    };

    for x in 0..cols {
        try_seed(0, x, &mut reachable, &mut queue);
        try_seed(rows - 1, x, &mut reachable, &mut queue);
    }
    for y in 0..rows {
        try_seed(y, 0, &mut reachable, &mut queue);
        try_seed(y, cols - 1, &mut reachable, &mut queue);
    }

    while let Some((y, x)) = queue.pop_front() {
        let neighbors = [
            (y.wrapping_sub(1), x),
            (y + 1, x),
            (y, x.wrapping_sub(1)),
            (y, x + 1),
        ];
        for (ny, nx) in neighbors {
            if ny >= rows || nx >= cols {
                continue;
            }
            let i = nx + ny * cols;
            if !mask.data[i] && !reachable[i] {
                reachable[i] = true;
                queue.push_back((ny, nx));
            }
        }
    }

    let data = mask
        .data
        .iter()
        .zip(&reachable)
        .map(|(&fg, &bg)| fg || !bg)
        .collect();
    SliceMask {
        rows,
        cols,
        data,
    }
}

/// Keep only the largest 8-connected component of a 2D mask.
pub fn largest_component_2d(mask: &SliceMask) -> SliceMask {
    let (rows, cols) = (mask.rows, mask.cols);
    let mut labels = vec![0_u32; rows * cols];
    let mut sizes: Vec<usize> = vec![0];
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

    for sy in 0..rows {
        for sx in 0..cols {
            let si = sx + sy * cols;
            if !mask.data[si] || labels[si] != 0 {
                continue;
            }
            let label = sizes.len() as u32;
            let mut size = 0_usize;
            labels[si] = label;
            queue.push_back((sy, sx));
            while let Some((y, x)) = queue.pop_front() {
                size += 1;
                for dy in -1_i32..=1 {
                    for dx in -1_i32..=1 {
                        if dy == 0 && dx == 0 {
                            continue;
                        }
                        let ny = y as i32 + dy;
                        let nx = x as i32 + dx;
                        if ny < 0 || nx < 0 || ny >= rows as i32 || nx >= cols as i32 {
                            continue;
                        }
                        let ni = nx as usize + ny as usize * cols;
                        if mask.data[ni] && labels[ni] == 0 {
                            labels[ni] = label;
                            queue.push_back((ny as usize, nx as usize));
                        }
                    }
                }
            }
            sizes.push(size);
        }
    }

    let best = sizes
        .iter()
        .enumerate()
        .skip(1)
        .max_by_key(|&(_, &s)| s)
        .map(|(i, _)| i as u32)
        .unwrap_or(0);

    let data = labels.iter().map(|&l| best != 0 && l == best).collect();
    SliceMask {
        rows,
        cols,
        data,
    }
}
