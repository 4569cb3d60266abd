//! Cell copying into caller buffers
//!
//! Emits the cell bytes of a range list into one attribute's output
//! buffer(s), in range order. A range either fits entirely or copying stops
//! before it with the overflow flag raised; per-range watermarks let the
//! driver truncate every attribute to a common range prefix afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::query::types::OverlappingCellRangeList;
use crate::{Result, TesseraError};

/// Cumulative output state after one copied range
#[derive(Debug, Clone, Copy)]
pub struct CopyMark {
    pub main_bytes: u64,
    pub var_bytes: u64,
    pub cells: u64,
}

/// Result of one attribute's copy pass
#[derive(Debug)]
pub struct CopyOutcome {
    /// Number of leading ranges copied in full
    pub ranges_copied: usize,
    /// Whether the buffer ran out before all ranges were copied
    pub overflow: bool,
    /// Watermark after each copied range
    pub marks: Vec<CopyMark>,
}

/// Copy a fixed-size attribute. `fill` must be one cell's bytes.
pub fn copy_fixed_cells(
    attr: &str,
    cell_size: u64,
    fill: &[u8],
    ranges: &OverlappingCellRangeList,
    out: &mut [u8],
    cancelled: &AtomicBool,
) -> Result<CopyOutcome> {
    let mut cursor = 0usize;
    let mut cells = 0u64;
    let mut marks = Vec::with_capacity(ranges.len());

    for (i, range) in ranges.iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            return Err(TesseraError::InvalidState("query cancelled".into()));
        }
        let n = range.cell_num();
        let nbytes = (n * cell_size) as usize;
        if cursor + nbytes > out.len() {
            return Ok(CopyOutcome {
                ranges_copied: i,
                overflow: true,
                marks,
            });
        }
        match &range.tile {
            Some(tile) => {
                let pair = tile.attr_tile(attr).ok_or_else(|| {
                    TesseraError::InvalidState(format!("tile not loaded for {}", attr))
                })?;
                out[cursor..cursor + nbytes]
                    .copy_from_slice(pair.main.cell_slice(range.start, range.end, cell_size));
            }
            None => {
                if fill.len() as u64 != cell_size {
                    return Err(TesseraError::InvalidState(format!(
                        "fill value size mismatch for {}",
                        attr
                    )));
                }
                for k in 0..n as usize {
                    let at = cursor + k * cell_size as usize;
                    out[at..at + fill.len()].copy_from_slice(fill);
                }
            }
        }
        cursor += nbytes;
        cells += n;
        marks.push(CopyMark {
            main_bytes: cursor as u64,
            var_bytes: 0,
            cells,
        });
    }
    Ok(CopyOutcome {
        ranges_copied: ranges.len(),
        overflow: false,
        marks,
    })
}

/// Copy a var-sized attribute into its offsets and values buffers. Each
/// emitted cell contributes one cumulative `u64` offset and its value bytes;
/// overflow in either buffer stops the pass.
pub fn copy_var_cells(
    attr: &str,
    fill: &[u8],
    ranges: &OverlappingCellRangeList,
    offsets_out: &mut [u8],
    values_out: &mut [u8],
    cancelled: &AtomicBool,
) -> Result<CopyOutcome> {
    let mut off_cursor = 0usize;
    let mut val_cursor = 0usize;
    let mut cells = 0u64;
    let mut marks = Vec::with_capacity(ranges.len());

    for (i, range) in ranges.iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            return Err(TesseraError::InvalidState("query cancelled".into()));
        }
        let n = range.cell_num() as usize;
        let off_bytes = n * 8;

        match &range.tile {
            Some(tile) => {
                let pair = tile.attr_tile(attr).ok_or_else(|| {
                    TesseraError::InvalidState(format!("tile not loaded for {}", attr))
                })?;
                let var = pair.var.as_ref().ok_or_else(|| {
                    TesseraError::InvalidState(format!("{} has no var tile", attr))
                })?;
                let (v_start, _) = pair.var_cell_range(range.start);
                let (_, v_end) = pair.var_cell_range(range.end);
                let chunk = &var.data()[v_start as usize..v_end as usize];

                if off_cursor + off_bytes > offsets_out.len()
                    || val_cursor + chunk.len() > values_out.len()
                {
                    return Ok(CopyOutcome {
                        ranges_copied: i,
                        overflow: true,
                        marks,
                    });
                }

                for (k, p) in (range.start..=range.end).enumerate() {
                    let cell_off = val_cursor as u64 + (pair.main.u64_at(p) - v_start);
                    let at = off_cursor + k * 8;
                    offsets_out[at..at + 8].copy_from_slice(&cell_off.to_le_bytes());
                }
                values_out[val_cursor..val_cursor + chunk.len()].copy_from_slice(chunk);
                val_cursor += chunk.len();
            }
            None => {
                let val_bytes = n * fill.len();
                if off_cursor + off_bytes > offsets_out.len()
                    || val_cursor + val_bytes > values_out.len()
                {
                    return Ok(CopyOutcome {
                        ranges_copied: i,
                        overflow: true,
                        marks,
                    });
                }
                for k in 0..n {
                    let cell_off = (val_cursor + k * fill.len()) as u64;
                    let at = off_cursor + k * 8;
                    offsets_out[at..at + 8].copy_from_slice(&cell_off.to_le_bytes());
                    let vat = val_cursor + k * fill.len();
                    values_out[vat..vat + fill.len()].copy_from_slice(fill);
                }
                val_cursor += val_bytes;
            }
        }
        off_cursor += off_bytes;
        cells += n as u64;
        marks.push(CopyMark {
            main_bytes: off_cursor as u64,
            var_bytes: val_cursor as u64,
            cells,
        });
    }
    Ok(CopyOutcome {
        ranges_copied: ranges.len(),
        overflow: false,
        marks,
    })
}
