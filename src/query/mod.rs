//! Query execution
//!
//! A `Query` answers a subarray read or appends a fragment on write. The
//! read pipeline plans overlapping tiles, produces an ordered list of cell
//! ranges (dense merge or sparse scan/sort/dedup/coalesce), and copies cell
//! bytes per attribute into caller buffers with overflow tracking.
//! Per-attribute tile reads and copy passes run as parallel tasks; the
//! planner, orderer and merger run on the caller thread.

pub mod copier;
pub mod dense;
pub mod planner;
pub mod sparse;
pub mod types;
pub mod write;


use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::array::domain::{self, DomainValue};
use crate::array::schema::dispatch_domain;
use crate::array::{ArraySchema, Layout, COORDS};
use crate::fragment::{self, FragmentMetadata};
use crate::storage::{StorageManager, TilePair};
use crate::{Result, TesseraError};

use copier::CopyOutcome;
use types::{OverlappingCellRangeList, OverlappingTile, OverlappingTileVec};

/// Query type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Read,
    Write,
}

/// Query status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Created but not initialized
    Uninitialized,
    /// Initialized and ready to process
    InProgress,
    /// Finished; all results delivered
    Completed,
    /// An output buffer overflowed; resubmit with larger buffers
    Incomplete,
    /// A fatal error occurred
    Failed,
}

/// One caller buffer. For reads the vector's length is the capacity and
/// `size` reports the useful bytes written; for writes the whole vector is
/// input.
#[derive(Debug, Clone)]
pub struct QueryBuffer {
    data: Vec<u8>,
    size: u64,
}

impl QueryBuffer {
    /// Read buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            size: 0,
        }
    }

    /// Write buffer wrapping input data
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { data, size }
    }

    /// Useful bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The useful prefix
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

/// Cooperative cancellation handle, checked at range and tile boundaries.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-attribute copy parameters resolved from the schema
struct AttrInfo {
    name: String,
    /// `None` for var-sized attributes
    cell_size: Option<u64>,
    fill: Vec<u8>,
    /// Index of the attribute's first buffer
    buf_idx: usize,
}

/// Processes a read or write query against one array.
pub struct Query {
    storage: Arc<StorageManager>,
    array: PathBuf,
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<FragmentMetadata>>,
    fragments_borrowed: bool,
    qtype: QueryType,
    layout: Layout,
    /// 2 * dim_num domain values; defaults to the full domain at init
    subarray: Option<Vec<u8>>,
    attributes: Vec<String>,
    buffers: Vec<QueryBuffer>,
    overflow_flags: Vec<bool>,
    status: QueryStatus,
    cancelled: Arc<AtomicBool>,
    last_fragment: Option<String>,
}

impl Query {
    /// Build a query over caller-loaned fragment metadata. The fragments are
    /// not released on [`finalize`](Query::finalize).
    pub fn new(
        storage: Arc<StorageManager>,
        array: &Path,
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentMetadata>>,
        qtype: QueryType,
    ) -> Self {
        let layout = if schema.is_key_value() {
            Layout::GlobalOrder
        } else {
            Layout::RowMajor
        };
        Self {
            storage,
            array: array.to_path_buf(),
            schema,
            fragments,
            fragments_borrowed: true,
            qtype,
            layout,
            subarray: None,
            attributes: Vec::new(),
            buffers: Vec::new(),
            overflow_flags: Vec::new(),
            status: QueryStatus::Uninitialized,
            cancelled: Arc::new(AtomicBool::new(false)),
            last_fragment: None,
        }
    }

    /// Open an array and build a query that owns its fragment handles.
    pub fn open(storage: Arc<StorageManager>, array: &Path, qtype: QueryType) -> Result<Self> {
        let schema = Arc::new(storage.load_schema(array)?);
        let fragments = match qtype {
            QueryType::Read => storage.open_fragments(array)?,
            QueryType::Write => Vec::new(),
        };
        let mut query = Self::new(storage, array, schema, fragments, qtype);
        query.fragments_borrowed = false;
        Ok(query)
    }

    // ========== Setters ==========

    /// Set the cell layout. Key-value arrays keep their schema-defined
    /// default layout and reject this call.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        if self.schema.is_key_value() {
            return Err(TesseraError::UnsupportedLayout(
                "key-value arrays use their default layout".into(),
            ));
        }
        self.layout = layout;
        Ok(())
    }

    /// Set the subarray from little-endian domain values; `None` selects the
    /// full domain.
    pub fn set_subarray(&mut self, subarray: Option<&[u8]>) -> Result<()> {
        match subarray {
            None => {
                self.subarray = Some(self.schema.domain_bytes().to_vec());
            }
            Some(bytes) => {
                let expected = 2 * self.schema.dim_num() as usize
                    * self.schema.datatype().size() as usize;
                if bytes.len() != expected {
                    return Err(TesseraError::InvalidSubarray(format!(
                        "expected {} bytes, got {}",
                        expected,
                        bytes.len()
                    )));
                }
                dispatch_domain!(self.schema.datatype(), T => {
                    self.check_subarray::<T>(bytes)?;
                });
                self.subarray = Some(bytes.to_vec());
            }
        }
        Ok(())
    }

    /// Typed convenience over [`set_subarray`](Query::set_subarray).
    pub fn set_subarray_typed<T: DomainValue>(&mut self, subarray: &[T]) -> Result<()> {
        let mut bytes = Vec::with_capacity(subarray.len() * T::SIZE);
        for v in subarray {
            v.write_le(&mut bytes);
        }
        self.set_subarray(Some(&bytes))
    }

    fn check_subarray<T: DomainValue>(&self, bytes: &[u8]) -> Result<()> {
        let sub: Vec<T> = crate::array::schema::decode_values(bytes);
        let dom = self.schema.domain_as::<T>();
        for d in 0..self.schema.dim_num() as usize {
            let (lo, hi) = (sub[2 * d], sub[2 * d + 1]);
            if hi < lo {
                return Err(TesseraError::InvalidSubarray(format!(
                    "dimension {} range is inverted",
                    d
                )));
            }
            if lo < dom[2 * d] || dom[2 * d + 1] < hi {
                return Err(TesseraError::InvalidSubarray(format!(
                    "dimension {} range falls outside the domain",
                    d
                )));
            }
        }
        Ok(())
    }

    /// Set the attributes and their buffers: one buffer per fixed-size
    /// attribute, two (offsets, values) per var-sized one, in attribute
    /// order.
    pub fn set_buffers(&mut self, attributes: &[&str], buffers: Vec<QueryBuffer>) -> Result<()> {
        self.attributes = attributes.iter().map(|a| a.to_string()).collect();
        self.overflow_flags = vec![false; buffers.len()];
        self.buffers = buffers;
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Validate the query and move it to `InProgress`. Caller errors are
    /// reported here, before any I/O.
    pub fn init(&mut self) -> Result<()> {
        match self.init_checks() {
            Ok(()) => {
                self.status = QueryStatus::InProgress;
                Ok(())
            }
            Err(e) => {
                self.status = QueryStatus::Failed;
                Err(e)
            }
        }
    }

    fn init_checks(&mut self) -> Result<()> {
        if self.attributes.is_empty() {
            return Err(TesseraError::InvalidAttribute(
                "no attributes specified".into(),
            ));
        }
        for (i, name) in self.attributes.iter().enumerate() {
            if self.attributes[..i].contains(name) {
                return Err(TesseraError::InvalidAttribute(format!(
                    "duplicate attribute {}",
                    name
                )));
            }
            if name == COORDS {
                if self.schema.is_dense() {
                    return Err(TesseraError::InvalidAttribute(
                        "dense arrays have no coordinates attribute".into(),
                    ));
                }
            } else {
                self.schema.attribute(name)?;
            }
        }

        let expected: usize = self
            .attributes
            .iter()
            .map(|name| {
                if name != COORDS && self.schema.attribute(name).unwrap().is_var_sized() {
                    2
                } else {
                    1
                }
            })
            .sum();
        if self.buffers.len() != expected {
            return Err(TesseraError::BufferCountMismatch {
                expected,
                actual: self.buffers.len(),
            });
        }

        match self.qtype {
            QueryType::Read => {
                if self.layout == Layout::Unordered {
                    return Err(TesseraError::UnsupportedLayout(
                        "unordered layout is write-only".into(),
                    ));
                }
            }
            QueryType::Write => {
                if self.schema.is_dense() && self.layout == Layout::Unordered {
                    return Err(TesseraError::UnsupportedLayout(
                        "dense writes require an ordered layout".into(),
                    ));
                }
                if !self.schema.is_dense() {
                    if !matches!(self.layout, Layout::Unordered | Layout::GlobalOrder) {
                        return Err(TesseraError::UnsupportedLayout(
                            "sparse writes accept unordered or global order".into(),
                        ));
                    }
                    if !self.attributes.iter().any(|a| a == COORDS) {
                        return Err(TesseraError::InvalidAttribute(
                            "sparse writes require the coordinates attribute".into(),
                        ));
                    }
                }
            }
        }

        if self.subarray.is_none() {
            self.subarray = Some(self.schema.domain_bytes().to_vec());
        }
        Ok(())
    }

    /// Execute the query. Overflow yields `Incomplete`; fatal errors yield
    /// `Failed` and propagate.
    pub fn process(&mut self) -> Result<QueryStatus> {
        match self.status {
            QueryStatus::Uninitialized => {
                return Err(TesseraError::InvalidState(
                    "query is not initialized".into(),
                ))
            }
            QueryStatus::Failed => {
                return Err(TesseraError::InvalidState("query has failed".into()))
            }
            _ => {}
        }
        let result = match self.qtype {
            QueryType::Read => self.read(),
            QueryType::Write => self.write(),
        };
        match result {
            Ok(()) => {
                self.status = if self.overflow() {
                    QueryStatus::Incomplete
                } else {
                    QueryStatus::Completed
                };
                Ok(self.status)
            }
            Err(e) => {
                self.status = QueryStatus::Failed;
                Err(e)
            }
        }
    }

    /// Run the query on a worker thread, invoking `callback` on termination.
    pub fn async_process<F>(mut self, callback: F) -> std::thread::JoinHandle<Query>
    where
        F: FnOnce(&Query) + Send + 'static,
    {
        std::thread::spawn(move || {
            if let Err(e) = self.process() {
                log::debug!("async query failed: {}", e);
            }
            callback(&self);
            self
        })
    }

    /// Release fragment handles owned by the query. Loaned fragments are
    /// left untouched.
    pub fn finalize(&mut self) -> Result<()> {
        if !self.fragments_borrowed {
            self.fragments.clear();
        }
        Ok(())
    }

    // ========== Accessors ==========

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn query_type(&self) -> QueryType {
        self.qtype
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancelled.clone())
    }

    /// Whether any buffer overflowed
    pub fn overflow(&self) -> bool {
        self.overflow_flags.iter().any(|f| *f)
    }

    /// Whether the attribute's buffer overflowed
    pub fn attribute_overflow(&self, attribute: &str) -> Result<bool> {
        let infos = self.attr_infos()?;
        let info = infos
            .iter()
            .find(|i| i.name == attribute)
            .ok_or_else(|| TesseraError::InvalidAttribute(attribute.to_string()))?;
        let mut flag = self.overflow_flags[info.buf_idx];
        if info.cell_size.is_none() {
            flag |= self.overflow_flags[info.buf_idx + 1];
        }
        Ok(flag)
    }

    /// Useful bytes written to each buffer, in buffer order
    pub fn buffer_sizes(&self) -> Vec<u64> {
        self.buffers.iter().map(|b| b.size).collect()
    }

    pub fn buffer(&self, index: usize) -> &QueryBuffer {
        &self.buffers[index]
    }

    /// Names of the fragments involved in the query
    pub fn fragment_uris(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn fragment_num(&self) -> usize {
        self.fragments.len()
    }

    /// Name of the fragment created by the last write
    pub fn last_fragment_uri(&self) -> Option<&str> {
        self.last_fragment.as_deref()
    }

    /// Partition the subarray into pieces whose estimated result sizes fit
    /// the current buffers. Pieces stop splitting at single cells.
    pub fn compute_subarrays(&self) -> Result<Vec<Vec<u8>>> {
        let subarray = self
            .subarray
            .clone()
            .unwrap_or_else(|| self.schema.domain_bytes().to_vec());
        if !self.schema.datatype().is_integral() {
            return Ok(vec![subarray]);
        }
        let infos = self.attr_infos()?;
        let var_bounds: Vec<u64> = infos
            .iter()
            .map(|info| match info.cell_size {
                Some(_) => 0,
                None => self.var_cell_upper_bound(&info.name, info.fill.len() as u64),
            })
            .collect();
        dispatch_domain!(self.schema.datatype(), T => {
            let sub: Vec<T> = crate::array::schema::decode_values(&subarray);
            let mut out = Vec::new();
            self.partition_rect::<T>(&sub, &infos, &var_bounds, &mut out);
            Ok(out
                .into_iter()
                .map(|rect| {
                    let mut bytes = Vec::with_capacity(rect.len() * T::SIZE);
                    for v in &rect {
                        v.write_le(&mut bytes);
                    }
                    bytes
                })
                .collect())
        })
    }

    /// Largest observed bytes-per-cell of a var-sized attribute across the
    /// fragments' tiles, floored at the fill size.
    fn var_cell_upper_bound(&self, attr: &str, fill_len: u64) -> u64 {
        let mut bound = fill_len.max(1);
        for meta in &self.fragments {
            if !meta.has_attribute(attr) {
                continue;
            }
            for t in 0..meta.tile_num() {
                let tile_idx = meta.tile_index_at(t);
                let (Ok(main), Ok(var)) = (
                    meta.tile_size(attr, tile_idx, false),
                    meta.tile_size(attr, tile_idx, true),
                ) else {
                    continue;
                };
                let cells = (main / 8).max(1);
                bound = bound.max((var + cells - 1) / cells);
            }
        }
        bound
    }

    fn partition_rect<T: DomainValue>(
        &self,
        rect: &[T],
        infos: &[AttrInfo],
        var_bounds: &[u64],
        out: &mut Vec<Vec<T>>,
    ) {
        let dim_num = self.schema.dim_num();
        let cells = domain::cell_num(rect, dim_num);
        let fits = infos.iter().zip(var_bounds).all(|(info, &value_bound)| {
            let cap = |i: usize| self.buffers[i].capacity() as u64;
            match info.cell_size {
                Some(size) => cells.saturating_mul(size) <= cap(info.buf_idx),
                None => {
                    cells.saturating_mul(8) <= cap(info.buf_idx)
                        && cells.saturating_mul(value_bound) <= cap(info.buf_idx + 1)
                }
            }
        });
        if fits {
            out.push(rect.to_vec());
            return;
        }
        match domain::split_longest_dim(rect, dim_num) {
            Some((left, right)) => {
                self.partition_rect(&left, infos, var_bounds, out);
                self.partition_rect(&right, infos, var_bounds, out);
            }
            // A single cell that still overflows is accepted as-is
            None => out.push(rect.to_vec()),
        }
    }

    // ========== Read pipeline ==========

    fn read(&mut self) -> Result<()> {
        for buf in &mut self.buffers {
            buf.size = 0;
        }
        for flag in &mut self.overflow_flags {
            *flag = false;
        }
        dispatch_domain!(self.schema.datatype(), T => {
            if self.schema.is_dense() {
                self.dense_read::<T>()
            } else {
                self.sparse_read::<T>()
            }
        })
    }

    fn subarray_as<T: DomainValue>(&self) -> Vec<T> {
        crate::array::schema::decode_values(
            self.subarray.as_deref().unwrap_or(self.schema.domain_bytes()),
        )
    }

    fn dense_read<T: DomainValue>(&mut self) -> Result<()> {
        let subarray = self.subarray_as::<T>();
        let tiles =
            planner::compute_overlapping_tiles::<T>(&self.schema, &self.fragments, &subarray)?;
        let tiles_by_key: AHashMap<(u32, u64), Arc<OverlappingTile>> = tiles
            .iter()
            .map(|t| ((t.fragment_idx, t.tile_idx), t.clone()))
            .collect();

        let dense_ranges = dense::compute_dense_cell_ranges::<T>(
            &self.schema,
            &self.fragments,
            &subarray,
            self.layout,
            &self.cancelled,
        )?;
        let ranges = dense::attach_tiles::<T>(&self.schema, dense_ranges, &tiles_by_key)?;
        let needed = referenced_tiles(&ranges);
        self.copy_attributes(&ranges, &needed)
    }

    fn sparse_read<T: DomainValue>(&mut self) -> Result<()> {
        let subarray = self.subarray_as::<T>();
        let tiles =
            planner::compute_overlapping_tiles::<T>(&self.schema, &self.fragments, &subarray)?;

        // Coordinates drive the scan and are read for every overlapping
        // tile, whether or not the caller asked for them.
        self.load_attr_tiles(COORDS, false, &tiles)?;

        let mut coords = Vec::new();
        for tile in &tiles {
            coords.extend(sparse::compute_overlapping_coords::<T>(
                &self.schema,
                tile,
                &subarray,
            )?);
        }
        sparse::sort_coords(&self.schema, &mut coords, self.layout);
        let deduped = sparse::dedup_coords(coords);
        let ranges = sparse::compute_cell_ranges(&deduped);
        let needed = referenced_tiles(&ranges);
        self.copy_attributes(&ranges, &needed)
    }

    /// Load one attribute's tiles into the given overlapping tiles.
    fn load_attr_tiles(
        &self,
        attr: &str,
        var_sized: bool,
        tiles: &OverlappingTileVec,
    ) -> Result<()> {
        tiles.par_iter().try_for_each(|tile| -> Result<()> {
            if tile.has_attr_tile(attr) {
                return Ok(());
            }
            let meta = &self.fragments[tile.fragment_idx as usize];
            let offset = meta.tile_offset(attr, tile.tile_idx, false)?;
            let main = self.storage.load_tile(
                &self.array,
                meta.name(),
                attr,
                tile.tile_idx,
                false,
                offset,
            )?;
            let pair = if var_sized {
                let var_offset = meta.tile_offset(attr, tile.tile_idx, true)?;
                let var = self.storage.load_tile(
                    &self.array,
                    meta.name(),
                    attr,
                    tile.tile_idx,
                    true,
                    var_offset,
                )?;
                TilePair::var_sized(main, var)
            } else {
                TilePair::fixed(main)
            };
            tile.set_attr_tile(attr, pair);
            Ok(())
        })
    }

    /// Copy every requested attribute for the range list, in parallel, then
    /// settle buffer sizes and overflow flags on a common range prefix.
    fn copy_attributes(
        &mut self,
        ranges: &OverlappingCellRangeList,
        needed: &OverlappingTileVec,
    ) -> Result<()> {
        let infos = self.attr_infos()?;
        let storage = self.storage.clone();
        let fragments = self.fragments.clone();
        let array = self.array.clone();
        let cancelled = self.cancelled.clone();

        let mut chunks: Vec<&mut [QueryBuffer]> = Vec::with_capacity(infos.len());
        let mut rest: &mut [QueryBuffer] = &mut self.buffers;
        for info in &infos {
            let take = if info.cell_size.is_none() { 2 } else { 1 };
            let (chunk, tail) = rest.split_at_mut(take);
            chunks.push(chunk);
            rest = tail;
        }

        // One pool task per attribute: load its tiles, then copy. Distinct
        // attributes touch disjoint buffers.
        let outcomes: Vec<Result<CopyOutcome>> = infos
            .par_iter()
            .zip(chunks.into_par_iter())
            .map(|(info, bufs)| {
                let result = (|| {
                    load_tiles_for(&storage, &array, &fragments, info, needed)?;
                    match info.cell_size {
                        Some(size) => {
                            let out = bufs[0].data.as_mut_slice();
                            copier::copy_fixed_cells(
                                &info.name, size, &info.fill, ranges, out, &cancelled,
                            )
                        }
                        None => {
                            let (offsets, values) = bufs.split_at_mut(1);
                            copier::copy_var_cells(
                                &info.name,
                                &info.fill,
                                ranges,
                                offsets[0].data.as_mut_slice(),
                                values[0].data.as_mut_slice(),
                                &cancelled,
                            )
                        }
                    }
                })();
                if result.is_err() {
                    cancelled.store(true, Ordering::Relaxed);
                }
                result
            })
            .collect();

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.push(outcome?);
        }

        // Truncate every attribute to the common prefix of fully-copied
        // ranges so all buffers report the same cell count.
        let common = results.iter().map(|o| o.ranges_copied).min().unwrap_or(0);
        for (info, outcome) in infos.iter().zip(&results) {
            let (main_bytes, var_bytes) = if common == 0 {
                (0, 0)
            } else {
                let mark = outcome.marks[common - 1];
                (mark.main_bytes, mark.var_bytes)
            };
            self.buffers[info.buf_idx].size = main_bytes;
            if info.cell_size.is_none() {
                self.buffers[info.buf_idx + 1].size = var_bytes;
            }
            if outcome.overflow {
                self.overflow_flags[info.buf_idx] = true;
                if info.cell_size.is_none() {
                    self.overflow_flags[info.buf_idx + 1] = true;
                }
            }
        }
        Ok(())
    }

    fn attr_infos(&self) -> Result<Vec<AttrInfo>> {
        let mut infos = Vec::with_capacity(self.attributes.len());
        let mut buf_idx = 0;
        for name in &self.attributes {
            if name == COORDS {
                infos.push(AttrInfo {
                    name: name.clone(),
                    cell_size: Some(self.schema.coords_size()),
                    fill: vec![0; self.schema.coords_size() as usize],
                    buf_idx,
                });
                buf_idx += 1;
            } else {
                let attr = self.schema.attribute(name)?;
                infos.push(AttrInfo {
                    name: name.clone(),
                    cell_size: attr.cell_size(),
                    fill: attr.fill_value().to_vec(),
                    buf_idx,
                });
                buf_idx += if attr.is_var_sized() { 2 } else { 1 };
            }
        }
        Ok(infos)
    }

    // ========== Write pipeline ==========

    fn write(&mut self) -> Result<()> {
        let seq = self.storage.list_fragments(&self.array)?.len() as u64;
        let name = fragment::new_fragment_name(seq);
        let infos = self.attr_infos()?;

        dispatch_domain!(self.schema.datatype(), T => {
            if self.schema.is_dense() {
                let region = self.subarray_as::<T>();
                let bufs = self.write_bufs(&infos, None)?;
                write::write_dense::<T>(
                    &self.storage,
                    &self.array,
                    &self.schema,
                    &name,
                    &region,
                    self.layout,
                    &bufs,
                )?;
            } else {
                let coords_info = infos
                    .iter()
                    .find(|i| i.name == COORDS)
                    .expect("validated at init");
                let coords_buf = self.buffers[coords_info.buf_idx].bytes();
                let bufs = self.write_bufs(&infos, Some(COORDS))?;
                write::write_sparse::<T>(
                    &self.storage,
                    &self.array,
                    &self.schema,
                    &name,
                    self.layout,
                    coords_buf,
                    &bufs,
                )?;
            }
        });

        log::debug!("wrote fragment {} to {}", name, self.array.display());
        self.last_fragment = Some(name);
        Ok(())
    }

    fn write_bufs<'a>(
        &'a self,
        infos: &'a [AttrInfo],
        skip: Option<&str>,
    ) -> Result<Vec<write::AttrWriteBuf<'a>>> {
        infos
            .iter()
            .filter(|info| Some(info.name.as_str()) != skip)
            .map(|info| {
                let attr = self.schema.attribute(&info.name)?;
                Ok(write::AttrWriteBuf {
                    attr,
                    data: self.buffers[info.buf_idx].bytes(),
                    var: if attr.is_var_sized() {
                        Some(self.buffers[info.buf_idx + 1].bytes())
                    } else {
                        None
                    },
                })
            })
            .collect()
    }
}

/// The distinct tiles a range list references.
fn referenced_tiles(ranges: &OverlappingCellRangeList) -> OverlappingTileVec {
    let mut seen: AHashMap<(u32, u64), Arc<OverlappingTile>> = AHashMap::new();
    for range in ranges {
        if let Some(tile) = &range.tile {
            seen.entry((tile.fragment_idx, tile.tile_idx))
                .or_insert_with(|| tile.clone());
        }
    }
    seen.into_values().collect()
}

/// Populate one attribute's tile slots for the given tiles.
fn load_tiles_for(
    storage: &StorageManager,
    array: &Path,
    fragments: &[Arc<FragmentMetadata>],
    info: &AttrInfo,
    needed: &OverlappingTileVec,
) -> Result<()> {
    for tile in needed {
        if tile.has_attr_tile(&info.name) {
            continue;
        }
        let meta = &fragments[tile.fragment_idx as usize];
        let offset = meta.tile_offset(&info.name, tile.tile_idx, false)?;
        let main = storage.load_tile(array, meta.name(), &info.name, tile.tile_idx, false, offset)?;
        let pair = if info.cell_size.is_none() {
            let var_offset = meta.tile_offset(&info.name, tile.tile_idx, true)?;
            let var =
                storage.load_tile(array, meta.name(), &info.name, tile.tile_idx, true, var_offset)?;
            TilePair::var_sized(main, var)
        } else {
            TilePair::fixed(main)
        };
        tile.set_attr_tile(&info.name, pair);
    }
    Ok(())
}
