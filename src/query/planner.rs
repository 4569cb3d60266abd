//! Overlap planning
//!
//! Enumerates the tiles of every fragment that intersect the query subarray
//! and classifies each overlap as full or partial. Output order is fragment
//! index ascending, then tile index ascending. Dense fragment domains are
//! aligned to the global tile grid, so their tile indices are comparable
//! across fragments; sparse tile indices are fragment-local and the order is
//! only a stable enumeration.

use std::sync::Arc;

use crate::array::domain::{self, for_each_in_box, TileGrid};
use crate::array::{ArraySchema, DomainValue};
use crate::fragment::FragmentMetadata;
use crate::query::types::{OverlappingTile, OverlappingTileVec};
use crate::Result;

/// Compute the overlapping tiles of all fragments with the subarray.
pub fn compute_overlapping_tiles<T: DomainValue>(
    schema: &ArraySchema,
    fragments: &[Arc<FragmentMetadata>],
    subarray: &[T],
) -> Result<OverlappingTileVec> {
    let mut tiles = Vec::new();
    for (f, meta) in fragments.iter().enumerate() {
        if meta.is_dense() {
            dense_fragment_tiles(schema, f as u32, meta, subarray, &mut tiles);
        } else {
            sparse_fragment_tiles(schema, f as u32, meta, subarray, &mut tiles);
        }
    }
    Ok(tiles)
}

/// Dense fragments: walk the tile subgrid covering `subarray ∩ domain` on
/// the array's global tile grid. Tile indices are global positions, so they
/// are directly comparable across fragments; the fragment footer translates
/// them to stored frames.
fn dense_fragment_tiles<T: DomainValue>(
    schema: &ArraySchema,
    fragment_idx: u32,
    meta: &FragmentMetadata,
    subarray: &[T],
    out: &mut OverlappingTileVec,
) {
    let dim_num = schema.dim_num();
    let frag_domain = meta.non_empty_domain_as::<T>();
    let Some(isect) = domain::intersect(&frag_domain, subarray, dim_num) else {
        return;
    };

    let extents = schema.tile_extents_as::<T>();
    let grid = TileGrid::new(&schema.domain_as::<T>(), &extents, schema.tile_order());
    let lo = grid.tile_coords_of(&rect_lows(&isect));
    let hi = grid.tile_coords_of(&rect_highs(&isect));

    // Walking in tile order keeps the linearized indices ascending.
    for_each_in_box(&lo, &hi, schema.tile_order(), |tile_coords| {
        let tile_idx = grid.tile_pos(tile_coords);
        let rect = grid.tile_rect(tile_coords);
        let (intersects, full) = domain::overlap(subarray, &rect, dim_num);
        debug_assert!(intersects);
        out.push(Arc::new(OverlappingTile::new(fragment_idx, tile_idx, full)));
    });
}

/// Sparse fragments: test every tile MBR against the subarray.
fn sparse_fragment_tiles<T: DomainValue>(
    schema: &ArraySchema,
    fragment_idx: u32,
    meta: &FragmentMetadata,
    subarray: &[T],
    out: &mut OverlappingTileVec,
) {
    let dim_num = schema.dim_num();
    for tile_idx in 0..meta.tile_num() {
        let mbr = meta.mbr_as::<T>(tile_idx);
        let (intersects, full) = domain::overlap(subarray, &mbr, dim_num);
        if intersects {
            out.push(Arc::new(OverlappingTile::new(fragment_idx, tile_idx, full)));
        }
    }
}

fn rect_lows<T: DomainValue>(rect: &[T]) -> Vec<T> {
    rect.iter().step_by(2).copied().collect()
}

fn rect_highs<T: DomainValue>(rect: &[T]) -> Vec<T> {
    rect.iter().skip(1).step_by(2).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, Datatype};

    fn schema_4x4() -> ArraySchema {
        ArraySchema::new(
            2,
            Datatype::Int64,
            &[1i64, 4, 1, 4],
            &[2i64, 2],
            true,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap()
    }

    fn dense_meta(domain: &[i64]) -> Arc<FragmentMetadata> {
        let mut bytes = Vec::new();
        for v in domain {
            v.write_le(&mut bytes);
        }
        let mut meta = FragmentMetadata::new("__000000_1".into(), true, bytes);
        meta.set_tile_num(4);
        Arc::new(meta)
    }

    fn sparse_meta(mbrs: &[&[i64]]) -> Arc<FragmentMetadata> {
        let mut domain = Vec::new();
        for v in [1i64, 100] {
            v.write_le(&mut domain);
        }
        let mut meta = FragmentMetadata::new("__000000_1".into(), false, domain);
        meta.set_tile_num(mbrs.len() as u64);
        for mbr in mbrs {
            let mut bytes = Vec::new();
            for v in *mbr {
                v.write_le(&mut bytes);
            }
            meta.push_mbr(bytes);
        }
        Arc::new(meta)
    }

    #[test]
    fn test_dense_full_domain() {
        let schema = schema_4x4();
        let frags = vec![dense_meta(&[1, 4, 1, 4])];
        let tiles =
            compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 4, 1, 4]).unwrap();
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().all(|t| t.full_overlap));
        let idxs: Vec<u64> = tiles.iter().map(|t| t.tile_idx).collect();
        assert_eq!(idxs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dense_partial_overlap() {
        let schema = schema_4x4();
        let frags = vec![dense_meta(&[1, 4, 1, 4])];
        // Top two rows: intersects all of tile row 0
        let tiles =
            compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 2, 1, 4]).unwrap();
        assert_eq!(tiles.len(), 2);
        assert!(tiles.iter().all(|t| t.full_overlap));

        // One cell: single partial tile
        let tiles =
            compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 1, 1, 1]).unwrap();
        assert_eq!(tiles.len(), 1);
        assert!(!tiles[0].full_overlap);
        assert_eq!(tiles[0].tile_idx, 0);
    }

    #[test]
    fn test_dense_fragment_subdomain() {
        let schema = schema_4x4();
        // Fragment covering only the lower-right tile; its one tile carries
        // the global grid index
        let frags = vec![dense_meta(&[3, 4, 3, 4])];
        let tiles =
            compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 4, 1, 4]).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].tile_idx, 3);

        let none = compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 2, 1, 2]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_mixed_fragments_fragment_order() {
        let schema = schema_4x4();
        let frags = vec![dense_meta(&[1, 2, 1, 2]), dense_meta(&[1, 4, 1, 4])];
        let tiles =
            compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 4, 1, 4]).unwrap();
        let order: Vec<(u32, u64)> = tiles.iter().map(|t| (t.fragment_idx, t.tile_idx)).collect();
        assert_eq!(order, vec![(0, 0), (1, 0), (1, 1), (1, 2), (1, 3)]);
    }

    #[test]
    fn test_sparse_mbr_overlap() {
        let schema = ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 100],
            &[10i64],
            false,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap();
        let frags = vec![sparse_meta(&[&[5, 15], &[40, 60], &[90, 95]])];

        let tiles = compute_overlapping_tiles::<i64>(&schema, &frags, &[10, 50]).unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0].tile_idx, 0);
        assert!(!tiles[0].full_overlap);
        assert_eq!(tiles[1].tile_idx, 1);

        let tiles = compute_overlapping_tiles::<i64>(&schema, &frags, &[1, 100]).unwrap();
        assert_eq!(tiles.len(), 3);
        assert!(tiles.iter().all(|t| t.full_overlap));
    }
}
