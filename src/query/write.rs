//! Write path: append one immutable fragment
//!
//! Dense writes re-bin caller buffers (given in an ordered layout) into
//! full tiles of the global tile grid. The written region may be
//! tile-unaligned; covering tiles are padded with attribute fill values and
//! the fragment's non-empty domain records the actual region. Sparse writes
//! carry explicit coordinates, are sorted into global order when unordered,
//! and are binned into capacity-sized tiles with per-tile MBRs.

use std::path::Path;

use crate::array::domain::{self, for_each_in_box, TileGrid};
use crate::array::{ArraySchema, Attribute, DomainValue, Layout, COORDS};
use crate::fragment::FragmentMetadata;
use crate::storage::StorageManager;
use crate::{Result, TesseraError};

/// One attribute's input buffers for a write
pub struct AttrWriteBuf<'a> {
    pub attr: &'a Attribute,
    /// Fixed-size cell data, or packed u64 offsets for var attributes
    pub data: &'a [u8],
    /// Var-sized value bytes
    pub var: Option<&'a [u8]>,
}

/// Append a dense fragment covering `region`, with cells supplied in
/// `layout` order. Returns the committed metadata.
pub fn write_dense<T: DomainValue>(
    storage: &StorageManager,
    array: &Path,
    schema: &ArraySchema,
    name: &str,
    region: &[T],
    layout: Layout,
    attr_bufs: &[AttrWriteBuf<'_>],
) -> Result<FragmentMetadata> {
    let dim_num = schema.dim_num() as usize;
    let n_cells = domain::cell_num(region, dim_num as u32);
    for buf in attr_bufs {
        check_cell_count(buf, n_cells)?;
    }

    // Expand the region to full tiles; padding cells get fill values.
    let array_domain = schema.domain_as::<T>();
    let extents = schema.tile_extents_as::<T>();
    let expanded = domain::expand_to_tile_grid(region, &array_domain, &extents);

    let grid = TileGrid::new(&expanded, &extents, schema.tile_order());
    let tile_lo = vec![0u64; dim_num];
    let tile_hi: Vec<u64> = grid.tiles_per_dim().iter().map(|n| n - 1).collect();
    let mut tile_boxes = Vec::new();
    for_each_in_box(&tile_lo, &tile_hi, schema.tile_order(), |tc| {
        tile_boxes.push(tc.to_vec())
    });

    // Stored tiles are addressed by their position on the array's global
    // tile grid; walking the expanded subgrid in tile order keeps those
    // positions ascending.
    let global_grid = TileGrid::new(&array_domain, &extents, schema.tile_order());
    let origin_tiles: Vec<u64> = (0..dim_num)
        .map(|d| expanded[2 * d].tile_index(array_domain[2 * d], extents[d]))
        .collect();

    let mut region_bytes = Vec::new();
    for v in region {
        v.write_le(&mut region_bytes);
    }
    let mut meta = FragmentMetadata::new(name.to_string(), true, region_bytes);
    let mut writer = storage.fragment_writer(array, name)?;

    // Running rank of region cells in iteration order; for global-order
    // input this is exactly the source cell index.
    let mut global_rank = 0u64;
    let rel_lo = vec![0u64; dim_num];
    for tile_coords in &tile_boxes {
        let rect = grid.tile_rect(tile_coords);
        let global_coords: Vec<u64> = (0..dim_num)
            .map(|d| origin_tiles[d] + tile_coords[d])
            .collect();
        meta.push_tile_position(global_grid.tile_pos(&global_coords));

        // Source index of each region cell of this tile, fill marker
        // (u64::MAX) for padding cells.
        let mut src_idx = Vec::new();
        let rel_hi: Vec<u64> = (0..dim_num)
            .map(|d| rect[2 * d + 1].span_from(rect[2 * d]))
            .collect();
        for_each_in_box(&rel_lo, &rel_hi, schema.cell_order(), |rel| {
            let coords: Vec<T> = (0..dim_num)
                .map(|d| rect[2 * d].add_units(rel[d]))
                .collect();
            if domain::coords_in_rect(&coords, region, dim_num as u32) {
                let idx = match layout {
                    Layout::GlobalOrder => {
                        let idx = global_rank;
                        global_rank += 1;
                        idx
                    }
                    _ => domain::cell_pos_in_rect(&coords, region, layout),
                };
                src_idx.push(idx);
            } else {
                src_idx.push(u64::MAX);
            }
        });

        for buf in attr_bufs {
            write_attr_tile(&mut writer, &mut meta, buf, &src_idx)?;
        }
    }

    meta.set_tile_num(tile_boxes.len() as u64);
    writer.commit(&meta)?;
    Ok(meta)
}

/// Append a sparse fragment from explicit coordinates. Unordered input is
/// sorted into the array's global cell order first.
pub fn write_sparse<T: DomainValue>(
    storage: &StorageManager,
    array: &Path,
    schema: &ArraySchema,
    name: &str,
    layout: Layout,
    coords_buf: &[u8],
    attr_bufs: &[AttrWriteBuf<'_>],
) -> Result<FragmentMetadata> {
    let dim_num = schema.dim_num() as usize;
    let coords_size = schema.coords_size();
    if coords_buf.len() as u64 % coords_size != 0 {
        return Err(TesseraError::InvalidState(
            "coordinates buffer is not a whole number of cells".into(),
        ));
    }
    let n_cells = coords_buf.len() as u64 / coords_size;
    if n_cells == 0 {
        return Err(TesseraError::InvalidState(
            "sparse write carries no cells".into(),
        ));
    }
    for buf in attr_bufs {
        check_cell_count(buf, n_cells)?;
    }

    let array_domain = schema.domain_as::<T>();
    let cell_coords: Vec<Vec<T>> = (0..n_cells)
        .map(|i| {
            let base = (i * coords_size) as usize;
            (0..dim_num)
                .map(|d| T::read_le(&coords_buf[base + d * T::SIZE..]))
                .collect()
        })
        .collect();
    for coords in &cell_coords {
        if !domain::coords_in_rect(coords, &array_domain, dim_num as u32) {
            return Err(TesseraError::InvalidSubarray(
                "write coordinates fall outside the array domain".into(),
            ));
        }
    }

    let mut order: Vec<u64> = (0..n_cells).collect();
    if layout == Layout::Unordered {
        let grid = TileGrid::new(
            &array_domain,
            &schema.tile_extents_as::<T>(),
            schema.tile_order(),
        );
        let cell_order = schema.cell_order();
        order.sort_by(|&a, &b| {
            let ka = global_key(&grid, cell_order, &cell_coords[a as usize]);
            let kb = global_key(&grid, cell_order, &cell_coords[b as usize]);
            ka.cmp(&kb)
        });
    }

    let mut ne_domain = Vec::with_capacity(2 * dim_num);
    for d in 0..dim_num {
        let mut lo = cell_coords[0][d];
        let mut hi = cell_coords[0][d];
        for coords in &cell_coords {
            if coords[d] < lo {
                lo = coords[d];
            }
            if coords[d] > hi {
                hi = coords[d];
            }
        }
        ne_domain.push(lo);
        ne_domain.push(hi);
    }
    let mut ne_bytes = Vec::new();
    for v in &ne_domain {
        v.write_le(&mut ne_bytes);
    }

    let mut meta = FragmentMetadata::new(name.to_string(), false, ne_bytes);
    let mut writer = storage.fragment_writer(array, name)?;

    let capacity = schema.capacity().max(1) as usize;
    let mut tile_num = 0u64;
    for chunk in order.chunks(capacity) {
        // Coordinates tile and MBR
        let mut coords_body = Vec::with_capacity(chunk.len() * coords_size as usize);
        let mut mbr: Vec<T> = Vec::with_capacity(2 * dim_num);
        for d in 0..dim_num {
            mbr.push(cell_coords[chunk[0] as usize][d]);
            mbr.push(cell_coords[chunk[0] as usize][d]);
        }
        for &i in chunk {
            let coords = &cell_coords[i as usize];
            for d in 0..dim_num {
                coords[d].write_le(&mut coords_body);
                if coords[d] < mbr[2 * d] {
                    mbr[2 * d] = coords[d];
                }
                if coords[d] > mbr[2 * d + 1] {
                    mbr[2 * d + 1] = coords[d];
                }
            }
        }
        let offset = writer.write_tile(COORDS, false, &coords_body)?;
        meta.push_tile(COORDS, offset, coords_body.len() as u64);
        let mut mbr_bytes = Vec::new();
        for v in &mbr {
            v.write_le(&mut mbr_bytes);
        }
        meta.push_mbr(mbr_bytes);

        let src_idx: Vec<u64> = chunk.to_vec();
        for buf in attr_bufs {
            write_attr_tile(&mut writer, &mut meta, buf, &src_idx)?;
        }
        tile_num += 1;
    }

    meta.set_tile_num(tile_num);
    writer.commit(&meta)?;
    Ok(meta)
}

fn global_key<T: DomainValue>(grid: &TileGrid<T>, cell_order: Layout, coords: &[T]) -> (u64, u64) {
    let tc = grid.tile_coords_of(coords);
    let rect = grid.tile_rect(&tc);
    (
        grid.tile_pos(&tc),
        domain::cell_pos_in_rect(coords, &rect, cell_order),
    )
}

fn check_cell_count(buf: &AttrWriteBuf<'_>, n_cells: u64) -> Result<()> {
    let expected = match buf.attr.cell_size() {
        Some(size) => n_cells * size,
        None => n_cells * 8,
    };
    if buf.data.len() as u64 != expected {
        return Err(TesseraError::BufferCountMismatch {
            expected: expected as usize,
            actual: buf.data.len(),
        });
    }
    Ok(())
}

/// Gather one tile of one attribute from the caller buffers and append it.
/// `src_idx` maps tile cell positions to source cell indices; `u64::MAX`
/// marks a padding cell that takes the fill value.
fn write_attr_tile(
    writer: &mut crate::storage::FragmentWriter<'_>,
    meta: &mut FragmentMetadata,
    buf: &AttrWriteBuf<'_>,
    src_idx: &[u64],
) -> Result<()> {
    let attr = buf.attr;
    match attr.cell_size() {
        Some(size) => {
            let size = size as usize;
            let mut body = Vec::with_capacity(src_idx.len() * size);
            for &i in src_idx {
                if i == u64::MAX {
                    body.extend_from_slice(attr.fill_value());
                } else {
                    let at = i as usize * size;
                    body.extend_from_slice(&buf.data[at..at + size]);
                }
            }
            let offset = writer.write_tile(attr.name(), false, &body)?;
            meta.push_tile(attr.name(), offset, body.len() as u64);
        }
        None => {
            let values = buf.var.ok_or_else(|| {
                TesseraError::InvalidState(format!("{} has no values buffer", attr.name()))
            })?;
            let n_src = buf.data.len() / 8;
            let src_off = |i: usize| -> u64 {
                u64::from_le_bytes(buf.data[i * 8..i * 8 + 8].try_into().unwrap())
            };
            let mut offsets_body = Vec::with_capacity(src_idx.len() * 8);
            let mut values_body = Vec::new();
            for &i in src_idx {
                offsets_body.extend_from_slice(&(values_body.len() as u64).to_le_bytes());
                if i == u64::MAX {
                    values_body.extend_from_slice(attr.fill_value());
                } else {
                    let i = i as usize;
                    let start = src_off(i) as usize;
                    let end = if i + 1 < n_src {
                        src_off(i + 1) as usize
                    } else {
                        values.len()
                    };
                    values_body.extend_from_slice(&values[start..end]);
                }
            }
            let offset = writer.write_tile(attr.name(), false, &offsets_body)?;
            meta.push_tile(attr.name(), offset, offsets_body.len() as u64);
            let var_offset = writer.write_tile(attr.name(), true, &values_body)?;
            meta.push_var_tile(attr.name(), var_offset, values_body.len() as u64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Datatype;
    use crate::storage::StorageConfig;
    use tempfile::tempdir;

    fn i32_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_dense_write_pads_partial_tiles() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(StorageConfig::default());
        let schema = ArraySchema::new(
            2,
            Datatype::Int64,
            &[1i64, 4, 1, 4],
            &[2i64, 2],
            true,
            vec![Attribute::new("a", Datatype::Int32).with_fill(i32_bytes(&[-1]))],
        )
        .unwrap();
        storage.create_array(dir.path(), &schema).unwrap();

        // Write a single cell; its tile is padded with the fill value
        let data = i32_bytes(&[7]);
        let bufs = [AttrWriteBuf {
            attr: schema.attribute("a").unwrap(),
            data: &data,
            var: None,
        }];
        let meta = write_dense(
            &storage,
            dir.path(),
            &schema,
            "__000000_1",
            &[2i64, 2, 2, 2],
            Layout::RowMajor,
            &bufs,
        )
        .unwrap();

        assert_eq!(meta.tile_num(), 1);
        assert_eq!(meta.non_empty_domain_as::<i64>(), vec![2, 2, 2, 2]);

        let tile = storage
            .load_tile(dir.path(), "__000000_1", "a", 0, false, 0)
            .unwrap();
        // Tile [1,2]x[1,2] row-major: (1,1) (1,2) (2,1) (2,2)
        let cells: Vec<i32> = tile
            .data()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(cells, vec![-1, -1, -1, 7]);
    }

    #[test]
    fn test_dense_write_rejects_short_buffer() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(StorageConfig::default());
        let schema = ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 4],
            &[2i64],
            true,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap();
        storage.create_array(dir.path(), &schema).unwrap();

        let data = i32_bytes(&[1, 2]); // region needs 4 cells
        let bufs = [AttrWriteBuf {
            attr: schema.attribute("a").unwrap(),
            data: &data,
            var: None,
        }];
        let r = write_dense(
            &storage,
            dir.path(),
            &schema,
            "__000000_1",
            &[1i64, 4],
            Layout::RowMajor,
            &bufs,
        );
        assert!(matches!(r, Err(TesseraError::BufferCountMismatch { .. })));
    }

    #[test]
    fn test_sparse_write_sorts_and_bins() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(StorageConfig::default());
        let schema = ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 100],
            &[10i64],
            false,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap()
        .with_capacity(2);
        storage.create_array(dir.path(), &schema).unwrap();

        let coords = i64_bytes(&[50, 5, 20]);
        let data = i32_bytes(&[500, 55, 200]);
        let bufs = [AttrWriteBuf {
            attr: schema.attribute("a").unwrap(),
            data: &data,
            var: None,
        }];
        let meta = write_sparse::<i64>(
            &storage,
            dir.path(),
            &schema,
            "__000000_1",
            Layout::Unordered,
            &coords,
            &bufs,
        )
        .unwrap();

        assert_eq!(meta.tile_num(), 2);
        assert_eq!(meta.non_empty_domain_as::<i64>(), vec![5, 50]);
        assert_eq!(meta.mbr_as::<i64>(0), vec![5, 20]);
        assert_eq!(meta.mbr_as::<i64>(1), vec![50, 50]);

        // First tile holds the two smallest coords in sorted order
        let off = meta.tile_offset(COORDS, 0, false).unwrap();
        let tile = storage
            .load_tile(dir.path(), "__000000_1", COORDS, 0, false, off)
            .unwrap();
        let got: Vec<i64> = tile
            .data()
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(got, vec![5, 20]);

        let off = meta.tile_offset("a", 0, false).unwrap();
        let tile = storage
            .load_tile(dir.path(), "__000000_1", "a", 0, false, off)
            .unwrap();
        let got: Vec<i32> = tile
            .data()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(got, vec![55, 200]);
    }

    #[test]
    fn test_sparse_write_rejects_out_of_domain() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(StorageConfig::default());
        let schema = ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 100],
            &[10i64],
            false,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap();
        storage.create_array(dir.path(), &schema).unwrap();

        let coords = i64_bytes(&[500]);
        let data = i32_bytes(&[1]);
        let bufs = [AttrWriteBuf {
            attr: schema.attribute("a").unwrap(),
            data: &data,
            var: None,
        }];
        let r = write_sparse::<i64>(
            &storage,
            dir.path(),
            &schema,
            "__000000_1",
            Layout::Unordered,
            &coords,
            &bufs,
        );
        assert!(matches!(r, Err(TesseraError::InvalidSubarray(_))));
    }

    #[test]
    fn test_var_attr_write_rebuilds_offsets() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(StorageConfig::default());
        let schema = ArraySchema::new(
            1,
            Datatype::Int64,
            &[1i64, 100],
            &[10i64],
            false,
            vec![Attribute::new_var("v", Datatype::UInt8).with_fill(b"~".to_vec())],
        )
        .unwrap()
        .with_capacity(10);
        storage.create_array(dir.path(), &schema).unwrap();

        // Cells at coords 9, 3: values "nine", "three" (unordered input)
        let coords = i64_bytes(&[9, 3]);
        let offsets: Vec<u8> = [0u64, 4]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let values = b"ninethree".to_vec();
        let bufs = [AttrWriteBuf {
            attr: schema.attribute("v").unwrap(),
            data: &offsets,
            var: Some(&values),
        }];
        let meta = write_sparse::<i64>(
            &storage,
            dir.path(),
            &schema,
            "__000000_1",
            Layout::Unordered,
            &coords,
            &bufs,
        )
        .unwrap();

        // After the global sort, cell order is coord 3 then 9
        let off = meta.tile_offset("v", 0, false).unwrap();
        let offs_tile = storage
            .load_tile(dir.path(), "__000000_1", "v", 0, false, off)
            .unwrap();
        let offs: Vec<u64> = offs_tile
            .data()
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(offs, vec![0, 5]);

        let voff = meta.tile_offset("v", 0, true).unwrap();
        let vals_tile = storage
            .load_tile(dir.path(), "__000000_1", "v", 0, true, voff)
            .unwrap();
        assert_eq!(vals_tile.data(), b"threenine");
    }
}
