//! Dense read pipeline: cross-fragment merge with fill
//!
//! Dense reads never scan coordinates. The subarray is decomposed into
//! slabs: maximal runs of cells along the layout's fastest-varying
//! dimension, split at tile boundaries so each slab lies in exactly one
//! tile. Per slab, the per-fragment covered segments are merged with
//! recency precedence; uncovered stretches become fill ranges. Slab order
//! is the query layout, so the collected ranges partition the subarray in
//! exactly the order cells must be emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use crate::array::domain::{self, for_each_in_box, TileGrid};
use crate::array::{ArraySchema, DomainValue, Layout};
use crate::fragment::FragmentMetadata;
use crate::query::types::{
    DenseCellRange, OverlappingCellRange, OverlappingCellRangeList, OverlappingTile, NO_FRAGMENT,
};
use crate::{Result, TesseraError};

/// Compute the merged dense cell ranges for the subarray in the given
/// layout. Positions are in each tile's cell-order space.
pub fn compute_dense_cell_ranges<T: DomainValue>(
    schema: &ArraySchema,
    fragments: &[Arc<FragmentMetadata>],
    subarray: &[T],
    layout: Layout,
    cancelled: &AtomicBool,
) -> Result<Vec<DenseCellRange>> {
    let dim_num = schema.dim_num() as usize;
    let domain = schema.domain_as::<T>();
    let extents = schema.tile_extents_as::<T>();
    let grid = TileGrid::new(&domain, &extents, schema.tile_order());

    let mut merger = DenseMerger {
        dim_num,
        domain,
        extents,
        grid,
        cell_order: schema.cell_order(),
        frag_domains: fragments
            .iter()
            .map(|m| m.non_empty_domain_as::<T>())
            .collect(),
        cancelled,
        out: Vec::new(),
    };

    match layout {
        Layout::GlobalOrder => {
            // Tile by tile in tile order; within a tile, cell-order slabs.
            let lo = merger.grid.tile_coords_of(&rect_lows(subarray));
            let hi = merger.grid.tile_coords_of(&rect_highs(subarray));
            let mut tile_boxes = Vec::new();
            for_each_in_box(&lo, &hi, schema.tile_order(), |tc| tile_boxes.push(tc.to_vec()));
            for tc in tile_boxes {
                let rect = merger.grid.tile_rect(&tc);
                let region = domain::intersect(&rect, subarray, dim_num as u32)
                    .expect("planned tile does not intersect subarray");
                let cell_order = merger.cell_order;
                merger.walk(&region, cell_order)?;
            }
        }
        _ => merger.walk(subarray, layout)?,
    }
    Ok(merger.out)
}

struct DenseMerger<'a, T: DomainValue> {
    dim_num: usize,
    domain: Vec<T>,
    extents: Vec<T>,
    grid: TileGrid<T>,
    cell_order: Layout,
    frag_domains: Vec<Vec<T>>,
    cancelled: &'a AtomicBool,
    out: Vec<DenseCellRange>,
}

impl<'a, T: DomainValue> DenseMerger<'a, T> {
    /// Decompose `region` into slabs along the layout's fastest dimension
    /// and merge each one.
    fn walk(&mut self, region: &[T], layout: Layout) -> Result<()> {
        let fd = match layout {
            Layout::ColMajor => 0,
            _ => self.dim_num - 1,
        };
        let outer_dims: Vec<usize> = (0..self.dim_num).filter(|d| *d != fd).collect();
        let lo = vec![0u64; outer_dims.len()];
        let hi: Vec<u64> = outer_dims
            .iter()
            .map(|&d| region[2 * d + 1].span_from(region[2 * d]))
            .collect();

        // Removing the fastest dimension keeps the remaining dims in the
        // same relative significance, so the reduced box reuses the layout.
        let mut outer_combos = Vec::new();
        for_each_in_box(&lo, &hi, layout, |rel| outer_combos.push(rel.to_vec()));

        let mut coords = vec![T::zero(); self.dim_num];
        for rel in outer_combos {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(TesseraError::InvalidState("query cancelled".into()));
            }
            for (k, &d) in outer_dims.iter().enumerate() {
                coords[d] = region[2 * d].add_units(rel[k]);
            }
            self.walk_fastest(&mut coords, fd, region)?;
        }
        Ok(())
    }

    /// Walk the fastest dimension of one slab line, splitting at tile
    /// boundaries.
    fn walk_fastest(&mut self, coords: &mut [T], fd: usize, region: &[T]) -> Result<()> {
        let origin = self.domain[2 * fd];
        let extent = self.extents[fd];
        let extent_units = extent.span_from(T::zero());
        let region_hi = region[2 * fd + 1];

        let mut cur = region[2 * fd];
        loop {
            let tile_i = cur.tile_index(origin, extent);
            let tile_hi = T::tile_low(origin, extent, tile_i).add_units(extent_units - 1);
            let seg_hi = if tile_hi < region_hi { tile_hi } else { region_hi };
            coords[fd] = cur;
            self.merge_slab(coords, fd, cur, seg_hi);
            if !(seg_hi < region_hi) {
                return Ok(());
            }
            cur = seg_hi.add_units(1);
        }
    }

    /// Merge one slab across fragments with recency precedence.
    fn merge_slab(&mut self, coords: &[T], fd: usize, lo: T, hi: T) {
        let len = hi.span_from(lo) + 1;
        let tile_coords = self.grid.tile_coords_of(coords);
        let tile_rect = self.grid.tile_rect(&tile_coords);
        let p0 = domain::cell_pos_in_rect(coords, &tile_rect, self.cell_order);
        let stride = self.fastest_dim_stride(fd);

        // Per-fragment covered segment of this slab, slab-relative
        let mut covers: Vec<(u32, u64, u64)> = Vec::new();
        for (fi, fdom) in self.frag_domains.iter().enumerate() {
            let outer_ok = (0..self.dim_num).all(|d| {
                d == fd || (coords[d] >= fdom[2 * d] && coords[d] <= fdom[2 * d + 1])
            });
            if !outer_ok {
                continue;
            }
            let a = if fdom[2 * fd] > lo { fdom[2 * fd] } else { lo };
            let b = if fdom[2 * fd + 1] < hi {
                fdom[2 * fd + 1]
            } else {
                hi
            };
            if b < a {
                continue;
            }
            covers.push((fi as u32, a.span_from(lo), b.span_from(lo)));
        }

        for (fragment_idx, rel_a, rel_b) in sweep_covers(&covers, len) {
            if stride == 1 {
                self.push_range(DenseCellRange {
                    fragment_idx,
                    tile_coords: tile_coords.clone(),
                    start: p0 + rel_a,
                    end: p0 + rel_b,
                });
            } else {
                // The slab is strided in the tile's cell order; positions
                // are not contiguous, so each cell is its own range.
                for rel in rel_a..=rel_b {
                    self.push_range(DenseCellRange {
                        fragment_idx,
                        tile_coords: tile_coords.clone(),
                        start: p0 + rel * stride,
                        end: p0 + rel * stride,
                    });
                }
            }
        }
    }

    /// Append a range, extending the previous one when it continues the
    /// same fragment and tile at the next position.
    fn push_range(&mut self, range: DenseCellRange) {
        if let Some(last) = self.out.last_mut() {
            if last.fragment_idx == range.fragment_idx
                && last.tile_coords == range.tile_coords
                && range.start == last.end + 1
            {
                last.end = range.end;
                return;
            }
        }
        self.out.push(range);
    }

    /// Position delta of one unit step along `fd` in the tile's cell order.
    fn fastest_dim_stride(&self, fd: usize) -> u64 {
        let unit = |d: usize| self.extents[d].span_from(T::zero());
        match self.cell_order {
            Layout::ColMajor => (0..fd).map(unit).product(),
            _ => (fd + 1..self.dim_num).map(unit).product(),
        }
    }
}

/// Sweep slab-relative fragment segments, emitting `(fragment, start, end)`
/// runs that partition `[0, len)`. Among fragments covering the cursor the
/// largest index wins; a more recent fragment starting inside a run
/// truncates it. Uncovered stretches come out as fill runs.
fn sweep_covers(covers: &[(u32, u64, u64)], len: u64) -> Vec<(i32, u64, u64)> {
    let mut out = Vec::new();
    let mut c = 0u64;
    while c < len {
        let mut winner: Option<&(u32, u64, u64)> = None;
        let mut next_start = len;
        for cov in covers {
            if cov.1 <= c && c <= cov.2 {
                if winner.map_or(true, |w| cov.0 > w.0) {
                    winner = Some(cov);
                }
            } else if cov.1 > c && cov.1 < next_start {
                next_start = cov.1;
            }
        }
        match winner {
            Some(w) => {
                let mut end = w.2;
                for cov in covers {
                    if cov.0 > w.0 && cov.1 > c && cov.1 <= end {
                        end = cov.1 - 1;
                    }
                }
                out.push((w.0 as i32, c, end));
                c = end + 1;
            }
            None => {
                out.push((NO_FRAGMENT, c, next_start - 1));
                c = next_start;
            }
        }
    }
    out
}

/// Pair each dense range with its overlapping tile, turning the merge output
/// into the range list the copier consumes. Tile indices are global grid
/// positions, shared with the planner. Fill ranges keep no tile.
pub fn attach_tiles<T: DomainValue>(
    schema: &ArraySchema,
    dense_ranges: Vec<DenseCellRange>,
    tiles_by_key: &AHashMap<(u32, u64), Arc<OverlappingTile>>,
) -> Result<OverlappingCellRangeList> {
    let grid = TileGrid::new(
        &schema.domain_as::<T>(),
        &schema.tile_extents_as::<T>(),
        schema.tile_order(),
    );

    dense_ranges
        .into_iter()
        .map(|range| {
            if range.fragment_idx == NO_FRAGMENT {
                return Ok(OverlappingCellRange {
                    tile: None,
                    start: range.start,
                    end: range.end,
                });
            }
            let tile_idx = grid.tile_pos(&range.tile_coords);
            let tile = tiles_by_key
                .get(&(range.fragment_idx as u32, tile_idx))
                .cloned()
                .ok_or_else(|| {
                    TesseraError::InvalidState("dense range references an unplanned tile".into())
                })?;
            Ok(OverlappingCellRange {
                tile: Some(tile),
                start: range.start,
                end: range.end,
            })
        })
        .collect()
}

fn rect_lows<T: DomainValue>(rect: &[T]) -> Vec<T> {
    rect.iter().step_by(2).copied().collect()
}

fn rect_highs<T: DomainValue>(rect: &[T]) -> Vec<T> {
    rect.iter().skip(1).step_by(2).copied().collect()
}
