//! Sparse read pipeline: coordinate scan, ordering, range coalescing
//!
//! Coordinates are extracted from each overlapping tile in stored order,
//! sorted into the query layout with recency tie-breaks, deduplicated in
//! place with tombstones, and folded into maximal contiguous cell ranges.

use std::cmp::Ordering;
use std::sync::Arc;

use rayon::prelude::*;

use crate::array::domain::{self, TileGrid};
use crate::array::{ArraySchema, DomainValue, Layout, COORDS};
use crate::query::types::{
    OverlappingCellRange, OverlappingCellRangeList, OverlappingCoords, OverlappingCoordsVec,
    OverlappingTile,
};
use crate::{Result, TesseraError};

/// Sorts above this size go parallel
const PAR_SORT_THRESHOLD: usize = 10_000;

/// Extract the cell positions of one tile whose coordinates fall in the
/// subarray. Fully-overlapped tiles skip the per-cell containment test.
/// Iteration follows the tile's stored cell order; no reordering happens here.
pub fn compute_overlapping_coords<T: DomainValue>(
    schema: &ArraySchema,
    tile: &Arc<OverlappingTile>,
    subarray: &[T],
) -> Result<Vec<OverlappingCoords<T>>> {
    let pair = tile
        .attr_tile(COORDS)
        .ok_or_else(|| TesseraError::InvalidState("coordinates tile not loaded".into()))?;
    let dim_num = schema.dim_num() as usize;
    let data = pair.main.data();
    let cell_num = pair.main.cell_num(schema.coords_size());

    let mut out = Vec::new();
    for p in 0..cell_num {
        let base = (p * schema.coords_size()) as usize;
        let coords: Vec<T> = (0..dim_num)
            .map(|d| T::read_le(&data[base + d * T::SIZE..]))
            .collect();
        if tile.full_overlap || domain::coords_in_rect(&coords, subarray, dim_num as u32) {
            out.push(OverlappingCoords {
                tile: tile.clone(),
                coords,
                pos: p,
            });
        }
    }
    Ok(out)
}

/// Sort coordinates into the query layout. Ties on equal coordinates are
/// broken by fragment index descending (most recent first), then position
/// ascending, which makes the downstream dedup a keep-first scan.
pub fn sort_coords<T: DomainValue>(
    schema: &ArraySchema,
    coords: &mut [OverlappingCoords<T>],
    layout: Layout,
) {
    let grid = TileGrid::new(
        &schema.domain_as::<T>(),
        &schema.tile_extents_as::<T>(),
        schema.tile_order(),
    );
    let cell_order = schema.cell_order();
    let cmp = |a: &OverlappingCoords<T>, b: &OverlappingCoords<T>| -> Ordering {
        let key = match layout {
            Layout::GlobalOrder => {
                let (at, ap) = global_order_key(&grid, cell_order, &a.coords);
                let (bt, bp) = global_order_key(&grid, cell_order, &b.coords);
                at.cmp(&bt).then(ap.cmp(&bp))
            }
            _ => domain::cmp_coords(&a.coords, &b.coords, layout),
        };
        key.then_with(|| b.tile.fragment_idx.cmp(&a.tile.fragment_idx))
            .then_with(|| a.pos.cmp(&b.pos))
    };
    if coords.len() >= PAR_SORT_THRESHOLD {
        coords.par_sort_by(cmp);
    } else {
        coords.sort_by(cmp);
    }
}

/// Global order: tile position in tile order, then cell position within the
/// tile in cell order.
fn global_order_key<T: DomainValue>(
    grid: &TileGrid<T>,
    cell_order: Layout,
    coords: &[T],
) -> (u64, u64) {
    let tile_coords = grid.tile_coords_of(coords);
    let tile_pos = grid.tile_pos(&tile_coords);
    let rect = grid.tile_rect(&tile_coords);
    let cell_pos = domain::cell_pos_in_rect(coords, &rect, cell_order);
    (tile_pos, cell_pos)
}

/// Deduplicate a sorted coordinate vector. Runs of equal coordinates keep
/// their first entry (the most recent fragment, by the sort's tie-break);
/// the rest become in-place tombstones so original offsets stay valid.
pub fn dedup_coords<T: DomainValue>(sorted: Vec<OverlappingCoords<T>>) -> OverlappingCoordsVec<T> {
    let mut out: OverlappingCoordsVec<T> = sorted.into_iter().map(Some).collect();
    let mut last_kept = 0;
    for i in 1..out.len() {
        let duplicate = {
            let kept = out[last_kept].as_ref().unwrap();
            let cur = out[i].as_ref().unwrap();
            kept.coords == cur.coords
        };
        if duplicate {
            out[i] = None;
        } else {
            last_kept = i;
        }
    }
    out
}

/// Fold the ordered, deduplicated coordinates into maximal runs of
/// contiguous positions within a tile. Tombstones are skipped.
pub fn compute_cell_ranges<T: DomainValue>(
    coords: &OverlappingCoordsVec<T>,
) -> OverlappingCellRangeList {
    let mut ranges: OverlappingCellRangeList = Vec::new();
    let mut open: Option<OverlappingCellRange> = None;

    for entry in coords.iter().flatten() {
        match open.as_mut() {
            Some(range)
                if Arc::ptr_eq(range.tile.as_ref().unwrap(), &entry.tile)
                    && entry.pos == range.end + 1 =>
            {
                range.end = entry.pos;
            }
            _ => {
                if let Some(range) = open.take() {
                    ranges.push(range);
                }
                open = Some(OverlappingCellRange {
                    tile: Some(entry.tile.clone()),
                    start: entry.pos,
                    end: entry.pos,
                });
            }
        }
    }
    if let Some(range) = open {
        ranges.push(range);
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, Datatype};
    use crate::storage::{Tile, TilePair};

    fn schema_1d() -> ArraySchema {
        ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 100],
            &[10i64],
            false,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap()
    }

    fn coords_tile(fragment_idx: u32, tile_idx: u64, coords: &[i64]) -> Arc<OverlappingTile> {
        let tile = Arc::new(OverlappingTile::new(fragment_idx, tile_idx, false));
        let mut bytes = Vec::new();
        for c in coords {
            c.write_le(&mut bytes);
        }
        tile.set_attr_tile(COORDS, TilePair::fixed(Tile::from_vec(bytes)));
        tile
    }

    #[test]
    fn test_scan_filters_by_subarray() {
        let schema = schema_1d();
        let tile = coords_tile(0, 0, &[5, 10, 50, 99]);
        let got = compute_overlapping_coords::<i64>(&schema, &tile, &[1, 20]).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].coords, vec![5]);
        assert_eq!(got[0].pos, 0);
        assert_eq!(got[1].coords, vec![10]);
        assert_eq!(got[1].pos, 1);
    }

    #[test]
    fn test_scan_full_overlap_skips_checks() {
        let schema = schema_1d();
        let tile = Arc::new(OverlappingTile::new(0, 0, true));
        let mut bytes = Vec::new();
        for c in [500i64, 600] {
            c.write_le(&mut bytes);
        }
        tile.set_attr_tile(COORDS, TilePair::fixed(Tile::from_vec(bytes)));
        // Out-of-subarray coords are emitted unconditionally on full overlap
        let got = compute_overlapping_coords::<i64>(&schema, &tile, &[1, 100]).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_sort_dedup_recency() {
        let schema = schema_1d();
        let t0 = coords_tile(0, 0, &[5, 10, 10, 15]);
        let t1 = coords_tile(1, 0, &[10, 20]);

        let mut coords = compute_overlapping_coords::<i64>(&schema, &t0, &[1, 100]).unwrap();
        coords.extend(compute_overlapping_coords::<i64>(&schema, &t1, &[1, 100]).unwrap());

        sort_coords(&schema, &mut coords, Layout::RowMajor);
        let deduped = dedup_coords(coords);

        let kept: Vec<(i64, u32, u64)> = deduped
            .iter()
            .flatten()
            .map(|c| (c.coords[0], c.tile.fragment_idx, c.pos))
            .collect();
        // Coordinate 10 resolves to fragment 1; the intra-fragment duplicate
        // in fragment 0 is tombstoned as well.
        assert_eq!(kept, vec![(5, 0, 0), (10, 1, 0), (15, 0, 3), (20, 1, 1)]);

        // Tombstones stay in place
        assert_eq!(deduped.len(), 6);
        assert_eq!(deduped.iter().filter(|e| e.is_none()).count(), 2);
    }

    #[test]
    fn test_dedup_idempotent() {
        let schema = schema_1d();
        let t0 = coords_tile(0, 0, &[5, 10, 10, 15]);
        let t1 = coords_tile(1, 0, &[10, 20]);

        let mut coords = compute_overlapping_coords::<i64>(&schema, &t0, &[1, 100]).unwrap();
        coords.extend(compute_overlapping_coords::<i64>(&schema, &t1, &[1, 100]).unwrap());
        sort_coords(&schema, &mut coords, Layout::RowMajor);

        let once = dedup_coords(coords);
        let mut again: Vec<OverlappingCoords<i64>> = once.iter().flatten().cloned().collect();
        sort_coords(&schema, &mut again, Layout::RowMajor);
        let twice = dedup_coords(again);

        let a: Vec<i64> = once.iter().flatten().map(|c| c.coords[0]).collect();
        let b: Vec<i64> = twice.iter().flatten().map(|c| c.coords[0]).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cell_ranges_coalesce() {
        let schema = schema_1d();
        // Consecutive positions within one tile coalesce into one range
        let tile = coords_tile(0, 0, &[2, 3, 4, 9]);
        let mut coords = compute_overlapping_coords::<i64>(&schema, &tile, &[1, 100]).unwrap();
        sort_coords(&schema, &mut coords, Layout::RowMajor);
        let ranges = compute_cell_ranges(&dedup_coords(coords));

        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (0, 3));
    }

    #[test]
    fn test_cell_ranges_split_on_tile_change() {
        let schema = schema_1d();
        let t0 = coords_tile(0, 0, &[2, 3]);
        let t1 = coords_tile(0, 1, &[4, 5]);
        let mut coords = compute_overlapping_coords::<i64>(&schema, &t0, &[1, 100]).unwrap();
        coords.extend(compute_overlapping_coords::<i64>(&schema, &t1, &[1, 100]).unwrap());
        sort_coords(&schema, &mut coords, Layout::RowMajor);
        let ranges = compute_cell_ranges(&dedup_coords(coords));

        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].tile.as_ref().unwrap().tile_idx, 0);
        assert_eq!(ranges[1].tile.as_ref().unwrap().tile_idx, 1);
    }

    #[test]
    fn test_global_order_sort() {
        let schema = schema_1d();
        // Tiles span [1,10], [11,20], ...: global order equals coordinate order
        let tile = coords_tile(0, 0, &[35, 12, 3]);
        let mut coords = compute_overlapping_coords::<i64>(&schema, &tile, &[1, 100]).unwrap();
        sort_coords(&schema, &mut coords, Layout::GlobalOrder);
        let sorted: Vec<i64> = coords.iter().map(|c| c.coords[0]).collect();
        assert_eq!(sorted, vec![3, 12, 35]);
    }
}
