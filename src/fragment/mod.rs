//! Fragment metadata
//!
//! A fragment is one immutable batch of writes. Its metadata footer records
//! the non-empty domain, per-tile MBRs (sparse), and the frame offsets and
//! decoded sizes of every attribute tile. Dense fragments address tiles by
//! their position on the array's global tile grid; the footer keeps the
//! global position of every stored tile so lookups translate to frame
//! indices. Footers are bincode-encoded and guarded by a CRC32 checksum.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::array::domain::DomainValue;
use crate::array::schema::decode_values;
use crate::{Result, TesseraError};

/// Magic bytes at the head of a metadata footer
const META_MAGIC: &[u8; 8] = b"TESSFRAG";
/// Footer format version
const META_VERSION: u32 = 1;

/// Per-attribute tile locations within the fragment's data files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrTiles {
    /// Frame start offsets in the attribute data file, one per tile
    pub offsets: Vec<u64>,
    /// Decoded tile sizes in bytes, one per tile
    pub sizes: Vec<u64>,
    /// Frame start offsets of the var part (var-sized attributes only)
    pub var_offsets: Vec<u64>,
    /// Decoded var-part sizes (var-sized attributes only)
    pub var_sizes: Vec<u64>,
}

/// Metadata of one immutable fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentMetadata {
    name: String,
    dense: bool,
    /// 2 * dim_num domain values, little-endian
    non_empty_domain: Vec<u8>,
    tile_num: u64,
    /// Per-tile minimum bounding rectangles (sparse fragments only)
    mbrs: Vec<Vec<u8>>,
    /// Global tile-grid positions of the stored tiles, ascending (dense
    /// fragments only; sparse tiles are addressed by stored order)
    tile_positions: Vec<u64>,
    attr_tiles: BTreeMap<String, AttrTiles>,
}

impl FragmentMetadata {
    pub fn new(name: String, dense: bool, non_empty_domain: Vec<u8>) -> Self {
        Self {
            name,
            dense,
            non_empty_domain,
            tile_num: 0,
            mbrs: Vec::new(),
            tile_positions: Vec::new(),
            attr_tiles: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_num
    }

    pub fn set_tile_num(&mut self, n: u64) {
        self.tile_num = n;
    }

    /// Raw non-empty domain bytes (2 * dim_num values)
    pub fn non_empty_domain_bytes(&self) -> &[u8] {
        &self.non_empty_domain
    }

    pub fn non_empty_domain_as<T: DomainValue>(&self) -> Vec<T> {
        decode_values(&self.non_empty_domain)
    }

    /// MBR of a sparse tile
    pub fn mbr(&self, tile_idx: u64) -> &[u8] {
        &self.mbrs[tile_idx as usize]
    }

    pub fn mbr_as<T: DomainValue>(&self, tile_idx: u64) -> Vec<T> {
        decode_values(&self.mbrs[tile_idx as usize])
    }

    pub fn push_mbr(&mut self, mbr: Vec<u8>) {
        self.mbrs.push(mbr);
    }

    /// Record the global grid position of the next stored tile (dense
    /// fragments). Positions must be recorded ascending.
    pub fn push_tile_position(&mut self, pos: u64) {
        self.tile_positions.push(pos);
    }

    /// Record the location of one tile of `attr`. Tiles must be recorded in
    /// stored order.
    pub fn push_tile(&mut self, attr: &str, offset: u64, size: u64) {
        let entry = self.attr_tiles.entry(attr.to_string()).or_default();
        entry.offsets.push(offset);
        entry.sizes.push(size);
    }

    /// Record the var-part location of one tile of a var-sized attribute.
    pub fn push_var_tile(&mut self, attr: &str, offset: u64, size: u64) {
        let entry = self.attr_tiles.entry(attr.to_string()).or_default();
        entry.var_offsets.push(offset);
        entry.var_sizes.push(size);
    }

    /// Tile index of the `stored`-th tile: its global grid position for
    /// dense fragments, `stored` itself for sparse ones.
    pub fn tile_index_at(&self, stored: u64) -> u64 {
        if self.tile_positions.is_empty() {
            stored
        } else {
            self.tile_positions[stored as usize]
        }
    }

    /// Stored (frame) index of a tile. Dense fragments address tiles by
    /// global grid position; sparse tiles by stored order.
    fn stored_index(&self, attr: &str, tile_idx: u64) -> Result<usize> {
        if self.tile_positions.is_empty() {
            return Ok(tile_idx as usize);
        }
        self.tile_positions
            .binary_search(&tile_idx)
            .map_err(|_| TesseraError::CorruptTile(format!("{}: no tile {}", attr, tile_idx)))
    }

    /// Frame offset of a tile in the attribute's data file
    pub fn tile_offset(&self, attr: &str, tile_idx: u64, var_part: bool) -> Result<u64> {
        let tiles = self
            .attr_tiles
            .get(attr)
            .ok_or_else(|| TesseraError::InvalidAttribute(attr.to_string()))?;
        let stored = self.stored_index(attr, tile_idx)?;
        let offsets = if var_part { &tiles.var_offsets } else { &tiles.offsets };
        offsets
            .get(stored)
            .copied()
            .ok_or_else(|| TesseraError::CorruptTile(format!("{}: no tile {}", attr, tile_idx)))
    }

    /// Decoded size of a tile in bytes
    pub fn tile_size(&self, attr: &str, tile_idx: u64, var_part: bool) -> Result<u64> {
        let tiles = self
            .attr_tiles
            .get(attr)
            .ok_or_else(|| TesseraError::InvalidAttribute(attr.to_string()))?;
        let stored = self.stored_index(attr, tile_idx)?;
        let sizes = if var_part { &tiles.var_sizes } else { &tiles.sizes };
        sizes
            .get(stored)
            .copied()
            .ok_or_else(|| TesseraError::CorruptTile(format!("{}: no tile {}", attr, tile_idx)))
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attr_tiles.contains_key(attr)
    }

    /// Serialize to footer bytes: magic, version, bincode body, CRC32.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
        let mut buf = Vec::with_capacity(body.len() + 24);
        buf.extend_from_slice(META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Deserialize from footer bytes, verifying magic, version and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 24 {
            return Err(TesseraError::InvalidFileFormat);
        }
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != META_MAGIC {
            return Err(TesseraError::InvalidFileFormat);
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != META_VERSION {
            return Err(TesseraError::VersionMismatch {
                expected: META_VERSION,
                actual: version,
            });
        }
        let body_len = cursor.read_u64::<LittleEndian>()? as usize;
        let body_start = cursor.position() as usize;
        if bytes.len() < body_start + body_len + 4 {
            return Err(TesseraError::InvalidFileFormat);
        }
        cursor.set_position((body_start + body_len) as u64);
        let crc = cursor.read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&bytes[..body_start + body_len]);
        if crc != computed {
            return Err(TesseraError::SerializationError(
                "fragment footer checksum mismatch".into(),
            ));
        }
        bincode::deserialize(&bytes[body_start..body_start + body_len])
            .map_err(|e| TesseraError::SerializationError(e.to_string()))
    }
}

/// A new fragment name: `__<seq>_<millis>`. Zero-padding the sequence keeps
/// lexicographic order equal to write order.
pub fn new_fragment_name(seq: u64) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("__{:06}_{}", seq, millis)
}
