//! Decoded in-memory tiles
//!
//! A tile is an immutable decoded byte block shared by reference across the
//! read pipeline. Var-sized attributes use a pair: an offsets tile (packed
//! `u64` byte offsets) and a values tile.

use bytes::Bytes;

/// An immutable decoded tile
#[derive(Debug, Clone)]
pub struct Tile {
    data: Bytes,
}

impl Tile {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of cells for a fixed cell size
    pub fn cell_num(&self, cell_size: u64) -> u64 {
        self.len() / cell_size
    }

    /// The `i`-th packed little-endian u64 (offsets tiles)
    pub fn u64_at(&self, i: u64) -> u64 {
        let start = (i * 8) as usize;
        u64::from_le_bytes(self.data[start..start + 8].try_into().unwrap())
    }

    /// Byte slice of cells `[start, end]` for a fixed cell size
    pub fn cell_slice(&self, start: u64, end: u64, cell_size: u64) -> &[u8] {
        &self.data[(start * cell_size) as usize..((end + 1) * cell_size) as usize]
    }
}

/// A decoded attribute tile. Fixed-sized attributes use only `main`;
/// var-sized attributes keep offsets in `main` and values in `var`.
#[derive(Debug, Clone)]
pub struct TilePair {
    pub main: Tile,
    pub var: Option<Tile>,
}

impl TilePair {
    pub fn fixed(main: Tile) -> Self {
        Self { main, var: None }
    }

    pub fn var_sized(offsets: Tile, values: Tile) -> Self {
        Self {
            main: offsets,
            var: Some(values),
        }
    }

    /// Value byte range of cell `p` for a var-sized pair. The last cell's
    /// end is the values tile length.
    pub fn var_cell_range(&self, p: u64) -> (u64, u64) {
        let var = self.var.as_ref().expect("fixed-size tile pair");
        let cell_num = self.main.cell_num(8);
        let start = self.main.u64_at(p);
        let end = if p + 1 < cell_num {
            self.main.u64_at(p + 1)
        } else {
            var.len()
        };
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_accessors() {
        let tile = Tile::from_vec(vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(tile.len(), 8);
        assert_eq!(tile.cell_num(4), 2);
        assert_eq!(tile.cell_slice(1, 1, 4), &[2, 0, 0, 0]);
    }

    #[test]
    fn test_var_cell_range() {
        let mut offsets = Vec::new();
        for o in [0u64, 3, 5] {
            offsets.extend_from_slice(&o.to_le_bytes());
        }
        let pair = TilePair::var_sized(Tile::from_vec(offsets), Tile::from_vec(b"abcdefg".to_vec()));
        assert_eq!(pair.var_cell_range(0), (0, 3));
        assert_eq!(pair.var_cell_range(1), (3, 5));
        assert_eq!(pair.var_cell_range(2), (5, 7));
    }
}
