//! Seeded watershed on a distance topography.
//!
//! Floods `-distance` restricted to the binary mask from the seed labels:
//! every foreground voxel ends up in the basin of the seed that reaches it
//! first along the priority-queue ordering, which assigns voxels to seeds
//! by ascending distance from the background ridge.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::volume::Volume;

/// Queue entry: smallest `priority` first, insertion order breaks ties so
/// the flood is deterministic.
struct Entry {
    priority: f32,
    order: u64,
    index: usize,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest priority
        // (then the earliest insertion) on top.
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Grow `seeds` over every `true` voxel of `mask`, flooding in ascending
/// `-distance[v]` order through the 6-neighborhood.
///
/// `seeds` must be 0 on unlabeled voxels; seed voxels keep their label.
/// Mask voxels in components that contain no seed are left at 0 — the
/// splitter labels those separately.
pub fn watershed(
    distance: &Volume<f32>,
    seeds: &Volume<i32>,
    mask: &Volume<bool>,
) -> Volume<i32> {
    let shape = mask.shape();
    let (slices, rows, cols) = (shape.slices, shape.rows, shape.cols);
    let slice_len = rows * cols;

    let mut labels = seeds.clone();
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut order = 0_u64;

    // Seed the queue in raster order.
    for (idx, &label) in seeds.data().iter().enumerate() {
        if label != 0 && mask.data()[idx] {
            heap.push(Entry {
                priority: -distance.data()[idx],
                order,
                index: idx,
            });
            order += 1;
        }
    }

    while let Some(entry) = heap.pop() {
        let idx = entry.index;
        let label = labels.data()[idx];

        let z = idx / slice_len;
        let rem = idx % slice_len;
        let y = rem / cols;
        let x = rem % cols;

        let mut visit = |nidx: usize, heap: &mut BinaryHeap<Entry>, labels: &mut Volume<i32>| {
            if mask.data()[nidx] && labels.data()[nidx] == 0 {
                labels.data_mut()[nidx] = label;
                heap.push(Entry {
                    priority: -distance.data()[nidx],
                    order,
                    index: nidx,
                });
                order += 1;
            }
        };

        if x > 0 {
            visit(idx - 1, &mut heap, &mut labels);
        }
        if x + 1 < cols {
            visit(idx + 1, &mut heap, &mut labels);
        }
        if y > 0 {
            visit(idx - cols, &mut heap, &mut labels);
        }
        if y + 1 < rows {
            visit(idx + cols, &mut heap, &mut labels);
        }
        if z > 0 {
            visit(idx - slice_len, &mut heap, &mut labels);
        }
        if z + 1 < slices {
            visit(idx + slice_len, &mut heap, &mut labels);
        }
    }

    labels
}
