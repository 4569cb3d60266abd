//! Array schema: datatypes, layouts, attributes
//!
//! The schema fixes the array's dimensionality, domain, tile extents, cell
//! and tile orders, and the attribute set. Domains and tile extents are kept
//! as little-endian bytes so the schema stays untyped at rest; typed views
//! are produced on demand via [`DomainValue`].

use serde::{Deserialize, Serialize};

use crate::array::domain::DomainValue;
use crate::{Result, TesseraError};

/// Name of the special coordinates attribute (always present in sparse reads).
pub const COORDS: &str = "__coords";

// Datatype identifiers
const TYPE_INT8: u8 = 0;
const TYPE_INT16: u8 = 1;
const TYPE_INT32: u8 = 2;
const TYPE_INT64: u8 = 3;
const TYPE_UINT8: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_UINT64: u8 = 7;
const TYPE_FLOAT32: u8 = 8;
const TYPE_FLOAT64: u8 = 9;

/// Cell datatype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Datatype {
    Int8 = TYPE_INT8,
    Int16 = TYPE_INT16,
    Int32 = TYPE_INT32,
    Int64 = TYPE_INT64,
    UInt8 = TYPE_UINT8,
    UInt16 = TYPE_UINT16,
    UInt32 = TYPE_UINT32,
    UInt64 = TYPE_UINT64,
    Float32 = TYPE_FLOAT32,
    Float64 = TYPE_FLOAT64,
}

impl Datatype {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            TYPE_INT8 => Some(Datatype::Int8),
            TYPE_INT16 => Some(Datatype::Int16),
            TYPE_INT32 => Some(Datatype::Int32),
            TYPE_INT64 => Some(Datatype::Int64),
            TYPE_UINT8 => Some(Datatype::UInt8),
            TYPE_UINT16 => Some(Datatype::UInt16),
            TYPE_UINT32 => Some(Datatype::UInt32),
            TYPE_UINT64 => Some(Datatype::UInt64),
            TYPE_FLOAT32 => Some(Datatype::Float32),
            TYPE_FLOAT64 => Some(Datatype::Float64),
            _ => None,
        }
    }

    /// Size of one value in bytes
    pub fn size(&self) -> u64 {
        match self {
            Datatype::Int8 | Datatype::UInt8 => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// Whether the type is an integer type (float domains are sparse-only)
    pub fn is_integral(&self) -> bool {
        !matches!(self, Datatype::Float32 | Datatype::Float64)
    }

    /// The engine-default fill value for one cell of this type
    pub fn default_fill(&self) -> Vec<u8> {
        match self {
            Datatype::Int8 => i8::MIN.to_le_bytes().to_vec(),
            Datatype::Int16 => i16::MIN.to_le_bytes().to_vec(),
            Datatype::Int32 => i32::MIN.to_le_bytes().to_vec(),
            Datatype::Int64 => i64::MIN.to_le_bytes().to_vec(),
            Datatype::UInt8 => u8::MAX.to_le_bytes().to_vec(),
            Datatype::UInt16 => u16::MAX.to_le_bytes().to_vec(),
            Datatype::UInt32 => u32::MAX.to_le_bytes().to_vec(),
            Datatype::UInt64 => u64::MAX.to_le_bytes().to_vec(),
            Datatype::Float32 => f32::NAN.to_le_bytes().to_vec(),
            Datatype::Float64 => f64::NAN.to_le_bytes().to_vec(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Int8 => "int8",
            Datatype::Int16 => "int16",
            Datatype::Int32 => "int32",
            Datatype::Int64 => "int64",
            Datatype::UInt8 => "uint8",
            Datatype::UInt16 => "uint16",
            Datatype::UInt32 => "uint32",
            Datatype::UInt64 => "uint64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
        }
    }
}

/// Cell ordering for reads, writes and on-disk tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Layout {
    RowMajor = 0,
    ColMajor = 1,
    /// Tile order, then intra-tile cell order
    GlobalOrder = 2,
    /// Write-only: cells carry explicit coordinates in any order
    Unordered = 3,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::RowMajor => "row-major",
            Layout::ColMajor => "col-major",
            Layout::GlobalOrder => "global-order",
            Layout::Unordered => "unordered",
        }
    }
}

/// A named, typed attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    var_sized: bool,
    /// Fill bytes for one cell, emitted for uncovered dense cells
    fill: Vec<u8>,
}

impl Attribute {
    /// Fixed-size attribute with the engine-default fill value
    pub fn new(name: &str, datatype: Datatype) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            var_sized: false,
            fill: datatype.default_fill(),
        }
    }

    /// Variable-sized attribute; each cell is a byte string
    pub fn new_var(name: &str, datatype: Datatype) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            var_sized: true,
            fill: datatype.default_fill(),
        }
    }

    pub fn with_fill(mut self, fill: Vec<u8>) -> Self {
        self.fill = fill;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn is_var_sized(&self) -> bool {
        self.var_sized
    }

    /// Bytes per cell; `None` for var-sized attributes
    pub fn cell_size(&self) -> Option<u64> {
        if self.var_sized {
            None
        } else {
            Some(self.datatype.size())
        }
    }

    pub fn fill_value(&self) -> &[u8] {
        &self.fill
    }
}

/// Array schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySchema {
    dim_num: u32,
    datatype: Datatype,
    /// 2 * dim_num values, little-endian: [lo_0, hi_0, lo_1, hi_1, ...]
    domain: Vec<u8>,
    /// dim_num values, little-endian
    tile_extents: Vec<u8>,
    cell_order: Layout,
    tile_order: Layout,
    dense: bool,
    key_value: bool,
    /// Maximum cells per sparse data tile
    capacity: u64,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    /// Build and validate a schema. `domain` and `tile_extents` are typed
    /// values of the domain datatype.
    pub fn new<T: DomainValue>(
        dim_num: u32,
        datatype: Datatype,
        domain: &[T],
        tile_extents: &[T],
        dense: bool,
        attributes: Vec<Attribute>,
    ) -> Result<Self> {
        if dim_num == 0 {
            return Err(TesseraError::InvalidSchema("zero dimensions".into()));
        }
        if domain.len() != 2 * dim_num as usize {
            return Err(TesseraError::InvalidSchema(format!(
                "domain must have {} values, got {}",
                2 * dim_num,
                domain.len()
            )));
        }
        if tile_extents.len() != dim_num as usize {
            return Err(TesseraError::InvalidSchema(format!(
                "tile extents must have {} values, got {}",
                dim_num,
                tile_extents.len()
            )));
        }
        if T::DATATYPE != datatype {
            return Err(TesseraError::InvalidSchema(format!(
                "domain values are {}, schema declares {}",
                T::DATATYPE.as_str(),
                datatype.as_str()
            )));
        }
        if dense && !datatype.is_integral() {
            return Err(TesseraError::InvalidSchema(
                "dense arrays require an integral domain type".into(),
            ));
        }
        if attributes.is_empty() {
            return Err(TesseraError::InvalidSchema("no attributes".into()));
        }
        for (i, a) in attributes.iter().enumerate() {
            if a.name() == COORDS {
                return Err(TesseraError::InvalidSchema(format!(
                    "attribute name {} is reserved",
                    COORDS
                )));
            }
            if attributes[..i].iter().any(|b| b.name() == a.name()) {
                return Err(TesseraError::InvalidSchema(format!(
                    "duplicate attribute {}",
                    a.name()
                )));
            }
            if !a.is_var_sized() && a.fill_value().len() as u64 != a.datatype().size() {
                return Err(TesseraError::InvalidSchema(format!(
                    "fill value of {} must be one {} cell",
                    a.name(),
                    a.datatype().as_str()
                )));
            }
        }
        for d in 0..dim_num as usize {
            let (lo, hi) = (domain[2 * d], domain[2 * d + 1]);
            if !(lo <= hi) {
                return Err(TesseraError::InvalidSchema(format!(
                    "dimension {} domain is inverted",
                    d
                )));
            }
            if datatype.is_integral() {
                let extent = tile_extents[d].span_from(T::zero());
                if extent == 0 {
                    return Err(TesseraError::InvalidSchema(format!(
                        "dimension {} tile extent is zero",
                        d
                    )));
                }
                // Dense tiles are always full extent; the grid must cover the
                // domain exactly.
                if dense {
                    let span = domain[2 * d + 1].span_from(domain[2 * d]) + 1;
                    if span % extent != 0 {
                        return Err(TesseraError::InvalidSchema(format!(
                            "dimension {} span {} is not a multiple of tile extent {}",
                            d, span, extent
                        )));
                    }
                }
            }
        }

        let mut domain_bytes = Vec::with_capacity(domain.len() * T::SIZE);
        for v in domain {
            v.write_le(&mut domain_bytes);
        }
        let mut extent_bytes = Vec::with_capacity(tile_extents.len() * T::SIZE);
        for v in tile_extents {
            v.write_le(&mut extent_bytes);
        }

        Ok(Self {
            dim_num,
            datatype,
            domain: domain_bytes,
            tile_extents: extent_bytes,
            cell_order: Layout::RowMajor,
            tile_order: Layout::RowMajor,
            dense,
            key_value: false,
            capacity: 10_000,
            attributes,
        })
    }

    pub fn with_cell_order(mut self, order: Layout) -> Self {
        self.cell_order = order;
        self
    }

    pub fn with_tile_order(mut self, order: Layout) -> Self {
        self.tile_order = order;
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Mark the array as a key-value store; its layout is fixed by the schema.
    pub fn with_key_value(mut self) -> Self {
        self.key_value = true;
        self
    }

    pub fn dim_num(&self) -> u32 {
        self.dim_num
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn is_key_value(&self) -> bool {
        self.key_value
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Raw little-endian domain bytes (2 * dim_num values)
    pub fn domain_bytes(&self) -> &[u8] {
        &self.domain
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| TesseraError::InvalidAttribute(name.to_string()))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name() == name)
    }

    /// Size of one coordinates tuple in bytes
    pub fn coords_size(&self) -> u64 {
        self.dim_num as u64 * self.datatype.size()
    }

    /// Typed domain view: 2 * dim_num values
    pub fn domain_as<T: DomainValue>(&self) -> Vec<T> {
        decode_values(&self.domain)
    }

    /// Typed tile extents view: dim_num values
    pub fn tile_extents_as<T: DomainValue>(&self) -> Vec<T> {
        decode_values(&self.tile_extents)
    }

    /// Number of cells a full tile holds
    pub fn tile_cell_num<T: DomainValue>(&self) -> u64 {
        self.tile_extents_as::<T>()
            .iter()
            .map(|e| e.span_from(T::zero()))
            .product()
    }
}

pub(crate) fn decode_values<T: DomainValue>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

/// Dispatch a generic body on the schema's domain datatype.
macro_rules! dispatch_domain {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::array::Datatype::Int8 => {
                type $T = i8;
                $body
            }
            $crate::array::Datatype::Int16 => {
                type $T = i16;
                $body
            }
            $crate::array::Datatype::Int32 => {
                type $T = i32;
                $body
            }
            $crate::array::Datatype::Int64 => {
                type $T = i64;
                $body
            }
            $crate::array::Datatype::UInt8 => {
                type $T = u8;
                $body
            }
            $crate::array::Datatype::UInt16 => {
                type $T = u16;
                $body
            }
            $crate::array::Datatype::UInt32 => {
                type $T = u32;
                $body
            }
            $crate::array::Datatype::UInt64 => {
                type $T = u64;
                $body
            }
            $crate::array::Datatype::Float32 => {
                type $T = f32;
                $body
            }
            $crate::array::Datatype::Float64 => {
                type $T = f64;
                $body
            }
        }
    };
}

pub(crate) use dispatch_domain;

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_2d() -> ArraySchema {
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

    #[test]
    fn test_schema_basic() {
        let schema = schema_2d();
        assert_eq!(schema.dim_num(), 2);
        assert!(schema.is_dense());
        assert_eq!(schema.domain_as::<i64>(), vec![1, 4, 1, 4]);
        assert_eq!(schema.tile_extents_as::<i64>(), vec![2, 2]);
        assert_eq!(schema.tile_cell_num::<i64>(), 4);
        assert_eq!(schema.coords_size(), 16);
    }

    #[test]
    fn test_schema_rejects_misaligned_tiles() {
        let r = ArraySchema::new(
            1,
            Datatype::Int64,
            &[0i64, 9],
            &[3i64],
            true,
            vec![Attribute::new("a", Datatype::Int32)],
        );
        assert!(matches!(r, Err(TesseraError::InvalidSchema(_))));
    }

    #[test]
    fn test_schema_rejects_dense_float() {
        let r = ArraySchema::new(
            1,
            Datatype::Float32,
            &[0.0f32, 10.0],
            &[1.0f32],
            true,
            vec![Attribute::new("a", Datatype::Int32)],
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_schema_rejects_reserved_name() {
        let r = ArraySchema::new(
            1,
            Datatype::Int64,
            &[0i64, 9],
            &[5i64],
            true,
            vec![Attribute::new(COORDS, Datatype::Int32)],
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_attribute_fill() {
        let a = Attribute::new("a", Datatype::Int32).with_fill((-1i32).to_le_bytes().to_vec());
        assert_eq!(a.fill_value(), &(-1i32).to_le_bytes());
        assert_eq!(a.cell_size(), Some(4));

        let v = Attribute::new_var("v", Datatype::UInt8);
        assert_eq!(v.cell_size(), None);
    }

    #[test]
    fn test_datatype_roundtrip() {
        for v in 0..10u8 {
            let dt = Datatype::from_u8(v).unwrap();
            assert_eq!(dt as u8, v);
        }
        assert!(Datatype::from_u8(200).is_none());
    }
}
