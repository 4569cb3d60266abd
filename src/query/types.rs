//! Shared read-pipeline records
//!
//! `OverlappingTile` handles are shared across the pipeline: coordinate
//! records and cell ranges keep references to them until the range list is
//! consumed by the copier, after which all decoded tiles are released.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::array::DomainValue;
use crate::storage::TilePair;

/// One tile of one fragment that intersects the query subarray. Attribute
/// tile slots are populated lazily as each attribute is read.
#[derive(Debug)]
pub struct OverlappingTile {
    pub fragment_idx: u32,
    /// Tile index within the fragment
    pub tile_idx: u64,
    /// Whether the tile lies entirely inside the subarray
    pub full_overlap: bool,
    attr_tiles: RwLock<AHashMap<String, TilePair>>,
}

impl OverlappingTile {
    pub fn new(fragment_idx: u32, tile_idx: u64, full_overlap: bool) -> Self {
        Self {
            fragment_idx,
            tile_idx,
            full_overlap,
            attr_tiles: RwLock::new(AHashMap::new()),
        }
    }

    pub fn set_attr_tile(&self, attr: &str, pair: TilePair) {
        self.attr_tiles.write().insert(attr.to_string(), pair);
    }

    /// Cloning a pair is cheap: tiles are shared byte blocks.
    pub fn attr_tile(&self, attr: &str) -> Option<TilePair> {
        self.attr_tiles.read().get(attr).cloned()
    }

    pub fn has_attr_tile(&self, attr: &str) -> bool {
        self.attr_tiles.read().contains_key(attr)
    }
}

/// Overlapping tiles in fragment-then-tile order
pub type OverlappingTileVec = Vec<Arc<OverlappingTile>>;

/// One cell of a sparse tile that falls inside the subarray
#[derive(Debug, Clone)]
pub struct OverlappingCoords<T: DomainValue> {
    pub tile: Arc<OverlappingTile>,
    pub coords: Vec<T>,
    /// Cell position inside the tile
    pub pos: u64,
}

/// Sorted, tombstone-deduplicated coordinate vector. Duplicates are kept in
/// place as `None` so positions remain stable for downstream consumers.
pub type OverlappingCoordsVec<T> = Vec<Option<OverlappingCoords<T>>>;

/// A maximal run of contiguous cell positions within one tile. `tile == None`
/// marks a fill range, materialized from the attribute's fill value.
#[derive(Debug, Clone)]
pub struct OverlappingCellRange {
    pub tile: Option<Arc<OverlappingTile>>,
    pub start: u64,
    pub end: u64,
}

impl OverlappingCellRange {
    pub fn cell_num(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Cell ranges in layout order
pub type OverlappingCellRangeList = Vec<OverlappingCellRange>;

/// A cell range produced by the dense merge, before tiles are attached.
/// `fragment_idx == -1` marks a fill range. Positions are cell positions in
/// the tile's cell-order space; `tile_coords` are on the array's tile grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseCellRange {
    pub fragment_idx: i32,
    pub tile_coords: Vec<u64>,
    pub start: u64,
    pub end: u64,
}

/// Fill-range marker for [`DenseCellRange::fragment_idx`]
pub const NO_FRAGMENT: i32 = -1;
