//! Distance transforms over binary volumes.
//!
//! The splitter's erosion and watershed both run on distances to the
//! background. The exact squared Euclidean transform is computed with the
//! separable lower-envelope scan (Felzenszwalb & Huttenlocher), one axis at
//! a time; a two-pass 6-neighbor chamfer scan provides the taxicab fallback
//! for volumes too large for comfortable Euclidean processing.

use rayon::prelude::*;

use crate::volume::Volume;

/// Above this voxel count the splitter switches from the Euclidean to the
/// taxicab transform to bound peak memory and runtime.
pub const EDT_VOXEL_LIMIT: usize = 20_000_000;

/// Distance values are capped here instead of infinity so that `f32`
/// arithmetic stays well-behaved on fully-foreground volumes.
const FAR: f32 = 1.0e12;

/// Squared Euclidean distance from every voxel to the nearest `false` voxel
/// of `mask`. Background voxels get 0.
///
/// Exact: the ball erosion `sq > r²` relies on small squared distances being
/// represented exactly, which holds for `f32` well past any practical
/// erosion radius.
pub fn squared_edt_to_background(mask: &Volume<bool>) -> Volume<f32> {
    let shape = mask.shape();
    let (slices, rows, cols) = (shape.slices, shape.rows, shape.cols);
    let mut dist = Volume::filled(shape, 0.0_f32);

    // Seed: 0 at background, far elsewhere.
    for (d, &m) in dist.data_mut().iter_mut().zip(mask.data()) {
        *d = if m { FAR } else { 0.0 };
    }

    if slices == 0 || rows == 0 || cols == 0 {
        return dist;
    }

    // X pass: rows are contiguous.
    dist.data_mut().par_chunks_mut(cols).for_each(|row| {
        envelope_1d_inplace(row);
    });

    // Y pass: each Z-slice is contiguous; columns within it are strided.
    let slice_len = rows * cols;
    dist.data_mut()
        .par_chunks_mut(slice_len)
        .for_each(|slice| {
            let mut line = vec![0.0_f32; rows];
            for x in 0..cols {
                for y in 0..rows {
                    line[y] = slice[x + y * cols];
                }
                envelope_1d_inplace(&mut line);
                for y in 0..rows {
                    slice[x + y * cols] = line[y];
                }
            }
        });

    // Z pass: columns cross slice boundaries, processed sequentially.
    if slices > 1 {
        let data = dist.data_mut();
        let mut line = vec![0.0_f32; slices];
        for y in 0..rows {
            for x in 0..cols {
                let base = x + y * cols;
                for z in 0..slices {
                    line[z] = data[base + z * slice_len];
                }
                envelope_1d_inplace(&mut line);
                for z in 0..slices {
                    data[base + z * slice_len] = line[z];
                }
            }
        }
    }

    dist
}

/// Euclidean distance from every foreground voxel to the nearest background
/// voxel (0 on background).
pub fn euclidean_distance(mask: &Volume<bool>) -> Volume<f32> {
    let mut dist = squared_edt_to_background(mask);
    for d in dist.data_mut() {
        *d = d.sqrt();
    }
    dist
}

/// Taxicab (L1) distance from every foreground voxel to the nearest
/// background voxel, by forward/backward chamfer scans over the 6
/// face-neighbor offsets.
pub fn taxicab_distance(mask: &Volume<bool>) -> Volume<f32> {
    let shape = mask.shape();
    let (slices, rows, cols) = (shape.slices, shape.rows, shape.cols);
    let mut dist = Volume::filled(shape, 0.0_f32);

    for (d, &m) in dist.data_mut().iter_mut().zip(mask.data()) {
        *d = if m { FAR } else { 0.0 };
    }

    let slice_len = rows * cols;
    let data = dist.data_mut();

    // Forward scan: predecessors along -z, -y, -x.
    for z in 0..slices {
        for y in 0..rows {
            for x in 0..cols {
                let idx = x + y * cols + z * slice_len;
                if data[idx] == 0.0 {
                    continue;
                }
                let mut best = data[idx];
                if x > 0 {
                    best = best.min(data[idx - 1] + 1.0);
                }
                if y > 0 {
                    best = best.min(data[idx - cols] + 1.0);
                }
                if z > 0 {
                    best = best.min(data[idx - slice_len] + 1.0);
                }
                data[idx] = best;
            }
        }
    }

    // Backward scan: successors along +z, +y, +x.
    for z in (0..slices).rev() {
        for y in (0..rows).rev() {
            for x in (0..cols).rev() {
                let idx = x + y * cols + z * slice_len;
                if data[idx] == 0.0 {
                    continue;
                }
                let mut best = data[idx];
                if x + 1 < cols {
                    best = best.min(data[idx + 1] + 1.0);
                }
                if y + 1 < rows {
                    best = best.min(data[idx + cols] + 1.0);
                }
                if z + 1 < slices {
                    best = best.min(data[idx + slice_len] + 1.0);
                }
                data[idx] = best;
            }
        }
    }

    dist
}

/// 1D squared distance transform, lower-envelope scan with unit sample
/// spacing. Operates in place on a line already holding squared distances
/// (0 at sites, large elsewhere).
fn envelope_1d_inplace(f: &mut [f32]) {
    let n = f.len();
    if n <= 1 {
        return;
    }

    // Parabola apexes and boundaries of the lower envelope.
    let mut v = vec![0_usize; n];
    let mut z = vec![0.0_f32; n + 1];
    let mut k = 0_usize;
    v[0] = 0;
    z[0] = -FAR;
    z[1] = FAR;

    let sq = |q: usize| (q * q) as f32;

    for q in 1..n {
        let fq = f[q];
        loop {
            let p = v[k];
            let s = (fq + sq(q) - (f[p] + sq(p))) / (2.0 * (q as f32 - p as f32));
            if s <= z[k] {
                if k == 0 {
                    // Degenerate: replace the first parabola.
                    v[0] = q;
                    z[0] = -FAR;
                    z[1] = FAR;
                    break;
                }
                k -= 1;
            } else {
                k += 1;
                v[k] = q;
                z[k] = s;
                z[k + 1] = FAR;
                break;
            }
        }
    }

    let mut out = vec![0.0_f32; n];
    let mut k = 0_usize;
    for (q, out_q) in out.iter_mut().enumerate() {
        while z[k + 1] < q as f32 {
            k += 1;
        }
        let p = v[k];
        let d = q as f32 - p as f32;
        *out_q = (d * d + f[p]).min(FAR);
    }
    f.copy_from_slice(&out);
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

    fn all_true(s: VolumeShape) -> Volume<bool> {
        Volume::filled(s, true)
    }

    // =========================================================================
    // Squared EDT Tests
    // =========================================================================

    mod squared_edt {
        use super::*;

        #[test]
        fn background_voxels_are_zero() {
            let mut mask = all_true(shape(3, 3, 3));
            mask.set(1, 1, 1, false);
            let d = squared_edt_to_background(&mask);
            assert_eq!(d.get(1, 1, 1), 0.0);
        }

        #[test]
        fn single_background_voxel_gives_squared_offsets() {
            let mut mask = all_true(shape(5, 5, 5));
            mask.set(2, 2, 2, false);
            let d = squared_edt_to_background(&mask);

            assert_eq!(d.get(2, 2, 3), 1.0);
            assert_eq!(d.get(2, 3, 3), 2.0);
            assert_eq!(d.get(3, 3, 3), 3.0);
            assert_eq!(d.get(2, 2, 0), 4.0);
            assert_eq!(d.get(0, 0, 0), 12.0);
        }

        #[test]
        fn plane_of_background_gives_axis_distance() {
            // Background plane at z=0; distance along z only.
            let s = shape(4, 3, 3);
            let mut mask = all_true(s);
            for y in 0..3 {
                for x in 0..3 {
                    mask.set(0, y, x, false);
                }
            }
            let d = squared_edt_to_background(&mask);
            for y in 0..3 {
                for x in 0..3 {
                    assert_eq!(d.get(1, y, x), 1.0);
                    assert_eq!(d.get(2, y, x), 4.0);
                    assert_eq!(d.get(3, y, x), 9.0);
                }
            }
        }

        #[test]
        fn two_sites_partition_a_bar() {
            let mut mask = all_true(shape(1, 1, 7));
            mask.set(0, 0, 0, false);
            mask.set(0, 0, 6, false);
            let d = squared_edt_to_background(&mask);
            let expected = [0.0, 1.0, 4.0, 9.0, 4.0, 1.0, 0.0];
            assert_eq!(d.data(), &expected);
        }

        #[test]
        fn all_background_is_all_zero() {
            let mask = Volume::filled(shape(2, 2, 2), false);
            let d = squared_edt_to_background(&mask);
            assert!(d.data().iter().all(|&v| v == 0.0));
        }

        #[test]
        fn euclidean_is_square_root_of_squared() {
            let mut mask = all_true(shape(1, 1, 5));
            mask.set(0, 0, 0, false);
            let d = euclidean_distance(&mask);
            assert_eq!(d.get(0, 0, 3), 3.0);
            assert_eq!(d.get(0, 0, 4), 4.0);
        }
    }

    // =========================================================================
    // Taxicab Tests
    // =========================================================================

    mod taxicab {
        use super::*;

        #[test]
        fn single_background_voxel_gives_manhattan_distance() {
            let mut mask = all_true(shape(5, 5, 5));
            mask.set(2, 2, 2, false);
            let d = taxicab_distance(&mask);

            assert_eq!(d.get(2, 2, 3), 1.0);
            assert_eq!(d.get(2, 3, 3), 2.0);
            assert_eq!(d.get(3, 3, 3), 3.0);
            assert_eq!(d.get(0, 0, 0), 6.0);
        }

        #[test]
        fn matches_euclidean_along_an_axis() {
            let mut mask = all_true(shape(1, 1, 6));
            mask.set(0, 0, 0, false);
            let l1 = taxicab_distance(&mask);
            let l2 = euclidean_distance(&mask);
            for x in 0..6 {
                assert_eq!(l1.get(0, 0, x), l2.get(0, 0, x));
            }
        }

        #[test]
        fn never_below_euclidean() {
            let mut mask = all_true(shape(4, 4, 4));
            mask.set(0, 0, 0, false);
            mask.set(3, 3, 3, false);
            let l1 = taxicab_distance(&mask);
            let l2 = euclidean_distance(&mask);
            for (a, b) in l1.data().iter().zip(l2.data()) {
                assert!(a + 1e-4 >= *b, "taxicab {a} below euclidean {b}");
            }
        }
    }
}
