//! Process-wide tile cache

pub mod tile_cache;

pub use tile_cache::{tile_cache, TileCache, TileKey};
