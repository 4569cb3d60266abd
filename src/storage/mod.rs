//! Storage manager
//!
//! Owns the on-disk array layout and the tile codec. An array is a directory
//! holding a checksummed schema file and one subdirectory per fragment; each
//! fragment keeps one data file per attribute (plus a second file for the
//! var part of var-sized attributes) and a metadata footer written last.
//!
//! ```text
//! array_dir/
//! ├── __schema.bin
//! ├── __000000_1712000000000/
//! │   ├── a.tdat            # framed tiles, one frame per tile
//! │   ├── v.tdat            # var attribute: offsets tiles
//! │   ├── v_var.tdat        # var attribute: value tiles
//! │   ├── __coords.tdat     # sparse fragments only
//! │   └── __meta.bin        # fragment footer, written on commit
//! └── __000001_1712000012345/
//! ```
//!
//! Tile frames are self-describing: original length, stored length, a
//! compression flag and a CRC32 of the stored body. Reads are served from
//! per-file memory maps.

pub mod tile;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::RwLock;

use crate::array::ArraySchema;
use crate::cache::{tile_cache, TileKey};
use crate::fragment::FragmentMetadata;
use crate::{Result, TesseraError};

pub use tile::{Tile, TilePair};

/// Array schema file name
pub const SCHEMA_FILE: &str = "__schema.bin";
/// Fragment metadata footer file name
pub const FRAGMENT_META_FILE: &str = "__meta.bin";
/// Attribute data file extension
pub const DATA_EXT: &str = "tdat";

const SCHEMA_MAGIC: &[u8; 8] = b"TESSARRY";
const SCHEMA_VERSION: u32 = 1;

// Tile frame: orig_len(u32) stored_len(u32) flag(u8) crc32(u32) body
const FRAME_HEADER_SIZE: usize = 13;

const FLAG_COMPRESS_NONE: u8 = 0;
const FLAG_COMPRESS_LZ4: u8 = 1;
const FLAG_COMPRESS_ZSTD: u8 = 2;

/// Bodies below this size are stored raw
const COMPRESS_MIN_BODY_SIZE: usize = 512;

/// Tile compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression
    None,
    /// LZ4 block compression. Fast with moderate ratio.
    Lz4,
    /// Zstd compression (level 1). Better ratio, slower than LZ4.
    Zstd,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Zstd => "zstd",
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Codec applied to tile bodies on write
    pub compression: CompressionType,
    /// Process-wide tile cache capacity in bytes
    pub tile_cache_bytes: u64,
    /// Whether to fsync data files and footers on commit
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionType::Lz4,
            tile_cache_bytes: 64 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

/// Storage manager: array directories, fragment files, framed tile I/O
pub struct StorageManager {
    config: StorageConfig,
    /// One memory map per open data file
    mmaps: RwLock<AHashMap<PathBuf, Arc<Mmap>>>,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Self {
        tile_cache().set_capacity(config.tile_cache_bytes);
        Self {
            config,
            mmaps: RwLock::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // ========== Array lifecycle ==========

    /// Create a new array directory and persist its schema.
    pub fn create_array(&self, path: &Path, schema: &ArraySchema) -> Result<()> {
        if path.join(SCHEMA_FILE).exists() {
            return Err(TesseraError::InvalidSchema(format!(
                "array already exists at {}",
                path.display()
            )));
        }
        fs::create_dir_all(path)?;

        let body = bincode::serialize(schema)
            .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
        let mut buf = Vec::with_capacity(body.len() + 24);
        buf.extend_from_slice(SCHEMA_MAGIC);
        buf.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let file_path = path.join(SCHEMA_FILE);
        let mut file = File::create(&file_path)?;
        file.write_all(&buf)?;
        if self.config.sync_writes {
            file.sync_all()?;
        }
        log::debug!("created array at {}", path.display());
        Ok(())
    }

    /// Load and validate an array schema.
    pub fn load_schema(&self, path: &Path) -> Result<ArraySchema> {
        let bytes = fs::read(path.join(SCHEMA_FILE))?;
        if bytes.len() < 24 {
            return Err(TesseraError::InvalidFileFormat);
        }
        let mut cursor = Cursor::new(bytes.as_slice());

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != SCHEMA_MAGIC {
            return Err(TesseraError::InvalidFileFormat);
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != SCHEMA_VERSION {
            return Err(TesseraError::VersionMismatch {
                expected: SCHEMA_VERSION,
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
        if crc != crc32fast::hash(&bytes[..body_start + body_len]) {
            return Err(TesseraError::SerializationError(
                "schema checksum mismatch".into(),
            ));
        }
        bincode::deserialize(&bytes[body_start..body_start + body_len])
            .map_err(|e| TesseraError::SerializationError(e.to_string()))
    }

    /// Fragment names in write order (oldest first). In-progress fragments
    /// (dot-prefixed) are skipped.
    pub fn list_fragments(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("__") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_fragment_metadata(&self, path: &Path, name: &str) -> Result<FragmentMetadata> {
        let bytes = fs::read(path.join(name).join(FRAGMENT_META_FILE))
            .map_err(|_| TesseraError::FragmentNotFound(name.to_string()))?;
        FragmentMetadata::from_bytes(&bytes)
    }

    /// Load the metadata of every committed fragment, oldest first.
    pub fn open_fragments(&self, path: &Path) -> Result<Vec<Arc<FragmentMetadata>>> {
        self.list_fragments(path)?
            .iter()
            .map(|name| self.load_fragment_metadata(path, name).map(Arc::new))
            .collect()
    }

    // ========== Tile I/O ==========

    /// Read and decode one tile through the process-wide cache. Concurrent
    /// loads of the same tile coalesce into a single underlying read.
    pub fn load_tile(
        &self,
        array: &Path,
        fragment: &str,
        attr: &str,
        tile_idx: u64,
        var_part: bool,
        frame_offset: u64,
    ) -> Result<Tile> {
        let path = self.data_file(array, fragment, attr, var_part);
        let key = TileKey::new(&path, frame_offset);
        let bytes =
            tile_cache().get_or_load(&key, || self.read_frame(&path, frame_offset, tile_idx))?;
        Ok(Tile::new(bytes))
    }

    /// The data file path of an attribute within a fragment.
    pub fn data_file(&self, array: &Path, fragment: &str, attr: &str, var_part: bool) -> PathBuf {
        let file = if var_part {
            format!("{}_var.{}", attr, DATA_EXT)
        } else {
            format!("{}.{}", attr, DATA_EXT)
        };
        array.join(fragment).join(file)
    }

    /// Decode the frame at `offset`, verifying bounds and checksum.
    fn read_frame(&self, path: &Path, offset: u64, tile_idx: u64) -> Result<Bytes> {
        let mmap = self.mmap_for(path)?;
        let data: &[u8] = &mmap;
        let start = offset as usize;
        if start + FRAME_HEADER_SIZE > data.len() {
            return Err(TesseraError::CorruptTile(format!(
                "tile {} frame header out of bounds in {}",
                tile_idx,
                path.display()
            )));
        }
        let mut cursor = Cursor::new(&data[start..start + FRAME_HEADER_SIZE]);
        let orig_len = cursor.read_u32::<LittleEndian>()? as usize;
        let stored_len = cursor.read_u32::<LittleEndian>()? as usize;
        let flag = cursor.read_u8()?;
        let crc = cursor.read_u32::<LittleEndian>()?;

        let body_start = start + FRAME_HEADER_SIZE;
        if body_start + stored_len > data.len() {
            return Err(TesseraError::CorruptTile(format!(
                "tile {} body out of bounds in {}",
                tile_idx,
                path.display()
            )));
        }
        let body = &data[body_start..body_start + stored_len];
        let computed = crc32fast::hash(body);
        if computed != crc {
            log::warn!(
                "tile {} checksum mismatch in {} ({:#010x} != {:#010x})",
                tile_idx,
                path.display(),
                computed,
                crc
            );
            return Err(TesseraError::CorruptTile(format!(
                "tile {} checksum mismatch in {}",
                tile_idx,
                path.display()
            )));
        }

        let decoded = match flag {
            FLAG_COMPRESS_NONE => body.to_vec(),
            FLAG_COMPRESS_LZ4 => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| TesseraError::CorruptTile(format!("LZ4 decompress failed: {}", e)))?,
            FLAG_COMPRESS_ZSTD => zstd::bulk::decompress(body, orig_len)
                .map_err(|e| TesseraError::CorruptTile(format!("Zstd decompress failed: {}", e)))?,
            other => {
                return Err(TesseraError::CorruptTile(format!(
                    "unknown compression flag {}",
                    other
                )))
            }
        };
        if decoded.len() != orig_len {
            return Err(TesseraError::CorruptTile(format!(
                "tile {} decoded to {} bytes, expected {}",
                tile_idx,
                decoded.len(),
                orig_len
            )));
        }
        Ok(Bytes::from(decoded))
    }

    fn mmap_for(&self, path: &Path) -> Result<Arc<Mmap>> {
        if let Some(m) = self.mmaps.read().get(path) {
            return Ok(m.clone());
        }
        let file = File::open(path)?;
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });
        self.mmaps
            .write()
            .insert(path.to_path_buf(), mmap.clone());
        Ok(mmap)
    }

    /// Start writing a new fragment. Data lands in a dot-prefixed directory
    /// that becomes visible only on [`FragmentWriter::commit`].
    pub fn fragment_writer(&self, array: &Path, name: &str) -> Result<FragmentWriter<'_>> {
        let tmp_dir = array.join(format!(".{}", name));
        fs::create_dir_all(&tmp_dir)?;
        Ok(FragmentWriter {
            storage: self,
            array: array.to_path_buf(),
            name: name.to_string(),
            tmp_dir,
            files: AHashMap::new(),
        })
    }
}

/// Encode one tile body into a frame using the configured codec. Compression
/// is skipped for small bodies and dropped when it does not shrink.
fn frame_tile(body: &[u8], compression: CompressionType) -> Vec<u8> {
    let (flag, stored) = if body.len() < COMPRESS_MIN_BODY_SIZE {
        (FLAG_COMPRESS_NONE, None)
    } else {
        match compression {
            CompressionType::None => (FLAG_COMPRESS_NONE, None),
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(body);
                if compressed.len() < body.len() {
                    (FLAG_COMPRESS_LZ4, Some(compressed))
                } else {
                    (FLAG_COMPRESS_NONE, None)
                }
            }
            CompressionType::Zstd => match zstd::bulk::compress(body, 1) {
                Ok(compressed) if compressed.len() < body.len() => {
                    (FLAG_COMPRESS_ZSTD, Some(compressed))
                }
                _ => (FLAG_COMPRESS_NONE, None),
            },
        }
    };
    let stored = stored.as_deref().unwrap_or(body);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + stored.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(stored.len() as u32).to_le_bytes());
    frame.push(flag);
    frame.extend_from_slice(&crc32fast::hash(stored).to_le_bytes());
    frame.extend_from_slice(stored);
    frame
}

/// Writes one fragment: framed tiles per attribute file, footer last.
pub struct FragmentWriter<'a> {
    storage: &'a StorageManager,
    array: PathBuf,
    name: String,
    tmp_dir: PathBuf,
    files: AHashMap<String, (BufWriter<File>, u64)>,
}

impl<'a> FragmentWriter<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one tile body to the attribute's data file. Returns the frame
    /// offset to be recorded in the fragment metadata.
    pub fn write_tile(&mut self, attr: &str, var_part: bool, body: &[u8]) -> Result<u64> {
        let file_name = if var_part {
            format!("{}_var.{}", attr, DATA_EXT)
        } else {
            format!("{}.{}", attr, DATA_EXT)
        };
        if !self.files.contains_key(&file_name) {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(self.tmp_dir.join(&file_name))?;
            self.files
                .insert(file_name.clone(), (BufWriter::new(file), 0));
        }
        let (writer, offset) = self.files.get_mut(&file_name).unwrap();
        let frame = frame_tile(body, self.storage.config.compression);
        let frame_offset = *offset;
        writer.write_all(&frame)?;
        *offset += frame.len() as u64;
        Ok(frame_offset)
    }

    /// Flush data files, write the metadata footer, and atomically publish
    /// the fragment by renaming it into place.
    pub fn commit(mut self, meta: &FragmentMetadata) -> Result<()> {
        let sync = self.storage.config.sync_writes;
        for (_, (writer, _)) in self.files.iter_mut() {
            writer.flush()?;
            if sync {
                writer.get_ref().sync_all()?;
            }
        }

        let footer = meta.to_bytes()?;
        let meta_path = self.tmp_dir.join(FRAGMENT_META_FILE);
        let mut file = File::create(&meta_path)?;
        file.write_all(&footer)?;
        if sync {
            file.sync_all()?;
        }

        let final_dir = self.array.join(&self.name);
        fs::rename(&self.tmp_dir, &final_dir)?;
        log::debug!("committed fragment {}", final_dir.display());
        Ok(())
    }

    /// Discard the in-progress fragment.
    pub fn abort(self) {
        let _ = fs::remove_dir_all(&self.tmp_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, Datatype, DomainValue};
    use tempfile::tempdir;

    fn test_schema() -> ArraySchema {
        ArraySchema::new(
            1,
            Datatype::Int64,
            &[0i64, 99],
            &[10i64],
            true,
            vec![Attribute::new("a", Datatype::Int32)],
        )
        .unwrap()
    }

    #[test]
    fn test_schema_roundtrip() {
        let dir = tempdir().unwrap();
        let sm = StorageManager::new(StorageConfig::default());
        let schema = test_schema();

        sm.create_array(dir.path(), &schema).unwrap();
        let restored = sm.load_schema(dir.path()).unwrap();
        assert_eq!(restored.dim_num(), 1);
        assert_eq!(restored.domain_as::<i64>(), vec![0, 99]);

        // Double create fails
        assert!(sm.create_array(dir.path(), &schema).is_err());
    }

    #[test]
    fn test_tile_roundtrip() {
        let dir = tempdir().unwrap();
        let sm = StorageManager::new(StorageConfig::default());
        sm.create_array(dir.path(), &test_schema()).unwrap();

        let body: Vec<u8> = (0..200u8).cycle().take(4096).collect();
        let mut writer = sm.fragment_writer(dir.path(), "__000000_1").unwrap();
        let off0 = writer.write_tile("a", false, &body).unwrap();
        let off1 = writer.write_tile("a", false, &body[..64]).unwrap();

        let mut domain = Vec::new();
        for v in [0i64, 99] {
            v.write_le(&mut domain);
        }
        let mut meta = FragmentMetadata::new("__000000_1".into(), true, domain);
        meta.set_tile_num(2);
        meta.push_tile("a", off0, body.len() as u64);
        meta.push_tile("a", off1, 64);
        writer.commit(&meta).unwrap();

        let tile = sm
            .load_tile(dir.path(), "__000000_1", "a", 0, false, off0)
            .unwrap();
        assert_eq!(tile.data(), &body[..]);
        let tile = sm
            .load_tile(dir.path(), "__000000_1", "a", 1, false, off1)
            .unwrap();
        assert_eq!(tile.data(), &body[..64]);
    }

    #[test]
    fn test_corrupt_tile_detected() {
        let dir = tempdir().unwrap();
        let sm = StorageManager::new(StorageConfig {
            compression: CompressionType::None,
            ..Default::default()
        });
        sm.create_array(dir.path(), &test_schema()).unwrap();

        let body = vec![7u8; 1024];
        let mut writer = sm.fragment_writer(dir.path(), "__000000_2").unwrap();
        let off = writer.write_tile("a", false, &body).unwrap();
        let mut domain = Vec::new();
        for v in [0i64, 99] {
            v.write_le(&mut domain);
        }
        let mut meta = FragmentMetadata::new("__000000_2".into(), true, domain);
        meta.set_tile_num(1);
        meta.push_tile("a", off, 1024);
        writer.commit(&meta).unwrap();

        // Flip a body byte on disk
        let path = sm.data_file(dir.path(), "__000000_2", "a", false);
        let mut bytes = fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 1] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let r = sm.load_tile(dir.path(), "__000000_2", "a", 0, false, off);
        assert!(matches!(r, Err(TesseraError::CorruptTile(_))));
    }

    #[test]
    fn test_list_fragments_sorted() {
        let dir = tempdir().unwrap();
        let sm = StorageManager::new(StorageConfig::default());
        fs::create_dir(dir.path().join("__000001_5")).unwrap();
        fs::create_dir(dir.path().join("__000000_9")).unwrap();
        fs::create_dir(dir.path().join(".__000002_1")).unwrap();

        let names = sm.list_fragments(dir.path()).unwrap();
        assert_eq!(names, vec!["__000000_9", "__000001_5"]);
    }

    #[test]
    fn test_frame_small_body_stays_raw() {
        let frame = frame_tile(b"tiny", CompressionType::Lz4);
        assert_eq!(frame[8], FLAG_COMPRESS_NONE);
    }
}
