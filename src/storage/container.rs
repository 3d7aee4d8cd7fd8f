//! Container file: datasets, chunk records and external links in a single
//! append-only file.
//!
//! ## File Layout
//!
//! ```text
//! [FileHeader  : 64 bytes]
//!   magic      : [u8;8]  = b"CHNKLNK1"
//!   version    : u32     (LE)
//!   created_at : i64     (unix seconds, LE)
//!   reserved   : [u8;44]
//!
//! [DatasetRecord]
//!   magic      : [u8;4]  = b"DSET"
//!   name       : u16 len (LE) + UTF-8
//!   rank       : u8
//!   shape      : u64 × rank (LE)
//!   chunks     : u64 × rank (LE)
//!   elem_size  : u32     (LE)
//!   n_filters  : u8
//!   filters    : (id u16, param i32) × n_filters (LE)
//!
//! [ChunkRecord]
//!   magic      : [u8;4]  = b"CHNK"
//!   dataset    : u16 len (LE) + UTF-8
//!   rank       : u8
//!   offset     : u64 × rank (LE)
//!   filter_mask: u32     (LE)
//!   data_len   : u64     (LE)
//!   data       : data_len bytes   ← chunk storage address points here
//!
//! [LinkRecord]
//!   magic      : [u8;4]  = b"ELNK"
//!   name       : u16 len (LE) + UTF-8
//!   file       : u16 len (LE) + UTF-8
//!   object     : u16 len (LE) + UTF-8
//! ```
//!
//! A chunk rewritten at the same offset is appended again; the index keeps
//! the latest record. The index is rebuilt by scanning on open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ChunkError, Result};
use crate::storage::access::{AccessFlags, AccessMode, FileAccess, LinkAccessProps, DEFAULT_NLINKS};
use crate::storage::dataset::Dataset;
use crate::storage::filters::{Filter, FilterPipeline};
use crate::storage::index::{ChunkIndex, ChunkLocation, ScannedChunk};
use crate::storage::layout::DatasetSpec;

// ─────────────────────────────── constants ───────────────────────────────────

pub const FILE_MAGIC: &[u8; 8] = b"CHNKLNK1";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: u64 = 64;
pub const DATASET_MAGIC: &[u8; 4] = b"DSET";
pub const CHUNK_MAGIC: &[u8; 4] = b"CHNK";
pub const LINK_MAGIC: &[u8; 4] = b"ELNK";

/// Expands to the directory of the referencing container inside a link prefix.
pub const ORIGIN_TOKEN: &str = "${ORIGIN}";

// ─────────────────────────────── types ───────────────────────────────────────

/// Target of an external link: an object inside another container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLink {
    pub target_file: String,
    pub target_path: String,
}

enum Record {
    Dataset { name: String, spec: DatasetSpec },
    Chunk(ScannedChunk),
    Link { name: String, link: ExternalLink },
}

struct ContainerState {
    path: PathBuf,
    /// `None` once the container has been closed.
    file: Option<File>,
    flags: AccessFlags,
    access: FileAccess,
    created_at: DateTime<Utc>,
    datasets: BTreeMap<String, DatasetSpec>,
    links: BTreeMap<String, ExternalLink>,
    index: ChunkIndex,
    /// End of the last complete record; appends and refresh scans start here.
    end: u64,
}

impl ContainerState {
    fn file_mut(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file
            .as_mut()
            .ok_or_else(|| ChunkError::Storage(format!("container {path:?} is closed")))
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.flags.is_writable() {
            return Err(ChunkError::ReadOnly { path: self.path.clone() });
        }
        Ok(())
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(ChunkError::Config(format!("invalid object name {name:?}")));
        }
        if self.datasets.contains_key(name) || self.links.contains_key(name) {
            return Err(ChunkError::Config(format!("object '{name}' already exists")));
        }
        Ok(())
    }

    fn apply(&mut self, records: Vec<Record>) {
        let mut chunks = Vec::new();
        for record in records {
            match record {
                Record::Dataset { name, spec } => {
                    self.datasets.insert(name, spec);
                }
                Record::Link { name, link } => {
                    self.links.insert(name, link);
                }
                Record::Chunk(c) => chunks.push(c),
            }
        }
        self.index.extend_from_scanned(chunks);
    }

    /// Append one encoded record at `end`. Returns the record's start position.
    ///
    /// The record is written in a single call and `end` only advances on
    /// success, so a failed append leaves the indexed state untouched.
    fn append(&mut self, record: &[u8]) -> Result<u64> {
        let start = self.end;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(start))?;
        file.write_all(record)?;
        file.flush()?;
        self.end = start + record.len() as u64;
        Ok(start)
    }
}

// ─────────────────────────────── Container ───────────────────────────────────

/// Handle to an open container file. Clones share the same open file.
#[derive(Clone)]
pub struct Container {
    inner: Arc<RwLock<ContainerState>>,
}

impl Container {
    /// Create (or truncate) a container at `path`, opened read-write.
    pub fn create(path: &Path, access: FileAccess) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ChunkError::Storage(format!("create {path:?}: {e}")))?;
        // Lock before truncating so a locked container is never clobbered.
        acquire_lock(&file, path, AccessFlags::RDWR, &access)?;
        file.set_len(0)?;

        let created_at = Utc::now();
        write_file_header(&mut file, created_at)?;
        info!(path = ?path, "Created container");

        Ok(Self::from_state(ContainerState {
            path: path.to_path_buf(),
            file: Some(file),
            flags: AccessFlags::RDWR,
            access,
            created_at,
            datasets: BTreeMap::new(),
            links: BTreeMap::new(),
            index: ChunkIndex::new(),
            end: FILE_HEADER_SIZE,
        }))
    }

    /// Open an existing container and rebuild its index from the records on disk.
    pub fn open(path: &Path, flags: AccessFlags, access: FileAccess) -> Result<Self> {
        flags.validate()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(flags.is_writable())
            .open(path)
            .map_err(|e| ChunkError::Storage(format!("open {path:?}: {e}")))?;
        acquire_lock(&file, path, flags, &access)?;

        let created_at = read_file_header(&mut file, path)?;
        let (records, end) = scan_records(&file, FILE_HEADER_SIZE)?;

        let mut state = ContainerState {
            path: path.to_path_buf(),
            file: Some(file),
            flags,
            access,
            created_at,
            datasets: BTreeMap::new(),
            links: BTreeMap::new(),
            index: ChunkIndex::new(),
            end,
        };
        state.apply(records);
        info!(
            path = ?path,
            mode = %flags.mode(),
            swmr = flags.is_swmr(),
            datasets = state.datasets.len(),
            chunks = state.index.total_chunks(),
            "Opened container"
        );
        Ok(Self::from_state(state))
    }

    fn from_state(state: ContainerState) -> Self {
        Self { inner: Arc::new(RwLock::new(state)) }
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }

    pub fn flags(&self) -> AccessFlags {
        self.inner.read().flags
    }

    pub fn mode(&self) -> AccessMode {
        self.flags().mode()
    }

    pub fn swmr_mode(&self) -> bool {
        self.flags().is_swmr()
    }

    /// A copy of the file-access configuration this container was opened with.
    pub fn access_config(&self) -> FileAccess {
        self.inner.read().access.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.read().created_at
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.inner.read().datasets.keys().cloned().collect()
    }

    pub fn create_dataset(&self, name: &str, spec: DatasetSpec) -> Result<Dataset> {
        spec.validate()?;
        let mut state = self.inner.write();
        state.ensure_writable()?;
        state.ensure_name_free(name)?;

        state.append(&encode_dataset_record(name, &spec)?)?;
        state.datasets.insert(name.to_string(), spec.clone());
        debug!(dataset = name, shape = ?spec.shape, chunks = ?spec.chunk_shape, "Dataset created");
        drop(state);

        Ok(Dataset::new(self.clone(), name, spec))
    }

    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let spec = self
            .inner
            .read()
            .datasets
            .get(name)
            .cloned()
            .ok_or_else(|| ChunkError::DatasetNotFound { name: name.to_string() })?;
        Ok(Dataset::new(self.clone(), name, spec))
    }

    pub fn create_external_link(&self, name: &str, target_file: &str, target_path: &str) -> Result<()> {
        let mut state = self.inner.write();
        state.ensure_writable()?;
        state.ensure_name_free(name)?;

        let link = ExternalLink {
            target_file: target_file.to_string(),
            target_path: target_path.to_string(),
        };
        state.append(&encode_link_record(name, &link)?)?;
        state.links.insert(name.to_string(), link);
        debug!(link = name, target_file, target_path, "External link created");
        Ok(())
    }

    pub fn external_link(&self, name: &str) -> Option<ExternalLink> {
        self.inner.read().links.get(name).cloned()
    }

    /// Follow the external link `name` to the dataset it targets.
    ///
    /// Links whose target is itself an external link are followed until a
    /// dataset is reached; more than `nlinks` hops fail with
    /// [`ChunkError::LinkDepthExceeded`].
    ///
    /// A file already open along the chain (this container included) is
    /// reused instead of reopened, so cycles and self-references never
    /// contend with the locks this chain already holds. The final hop only
    /// reuses a handle opened with the requested flags.
    pub fn open_external(&self, name: &str, props: Option<&LinkAccessProps>) -> Result<Dataset> {
        let limit = props.and_then(LinkAccessProps::nlinks).unwrap_or(DEFAULT_NLINKS);
        let mut current = self.clone();
        let mut link_name = name.to_string();
        let mut hops = 0u32;
        let mut visited = vec![(canonical(&self.path()), self.clone())];

        loop {
            let link = current
                .external_link(&link_name)
                .ok_or_else(|| ChunkError::LinkNotFound { name: link_name.clone() })?;
            hops += 1;
            if hops > limit {
                return Err(ChunkError::LinkDepthExceeded { link: name.to_string(), limit });
            }

            let target_file = current.resolve_target(&link.target_file, props);
            let flags = props
                .and_then(LinkAccessProps::elink_acc_flags)
                .unwrap_or_else(|| current.flags());
            debug!(link = %link_name, hop = hops, target = ?target_file, flags = ?flags, "Following external link");

            let key = canonical(&target_file);
            let reusable = visited
                .iter()
                .find(|(path, _)| *path == key)
                .map(|(_, open)| open.clone())
                .filter(|open| open.external_link(&link.target_path).is_some() || open.flags() == flags);
            let target = match reusable {
                Some(open) => {
                    debug!(target = ?target_file, "Reusing open container");
                    open
                }
                None => {
                    let access = props
                        .and_then(LinkAccessProps::elink_fapl)
                        .cloned()
                        .unwrap_or_else(|| current.access_config());
                    let opened = Container::open(&target_file, flags, access)?;
                    visited.push((key, opened.clone()));
                    opened
                }
            };
            if target.external_link(&link.target_path).is_some() {
                current = target;
                link_name = link.target_path;
                continue;
            }
            return target.dataset(&link.target_path);
        }
    }

    fn resolve_target(&self, target_file: &str, props: Option<&LinkAccessProps>) -> PathBuf {
        let target = Path::new(target_file);
        if target.is_absolute() {
            return target.to_path_buf();
        }
        let path = self.path();
        let origin = path.parent().unwrap_or_else(|| Path::new(""));
        match props.and_then(LinkAccessProps::elink_prefix) {
            Some(prefix) => match prefix.strip_prefix(ORIGIN_TOKEN) {
                Some(rest) => origin.join(rest.trim_start_matches('/')).join(target),
                None => Path::new(prefix).join(target),
            },
            None => origin.join(target),
        }
    }

    /// Force appended records to stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.write();
        state.file_mut()?.sync_data()?;
        Ok(())
    }

    /// Pick up records appended by other handles since the last scan.
    pub fn refresh(&self) -> Result<()> {
        let mut state = self.inner.write();
        let start = state.end;
        let (records, end) = scan_records(state.file_mut()?, start)?;
        let found = records.len();
        state.apply(records);
        state.end = end;
        if found > 0 {
            debug!(path = ?state.path, records = found, "Container refreshed");
        }
        Ok(())
    }

    /// Flush and release the file (and its advisory lock).
    ///
    /// Dataset handles still referencing the container fail afterwards.
    pub fn close(self) -> Result<()> {
        let mut state = self.inner.write();
        if let Some(file) = state.file.take() {
            if state.flags.is_writable() {
                file.sync_all()?;
            }
            info!(path = ?state.path, "Closed container");
        }
        Ok(())
    }

    // ─────────────────────── chunk storage primitives ─────────────────────────

    pub(crate) fn chunk_location(&self, dataset: &str, offset: &[u64]) -> Option<ChunkLocation> {
        self.inner.read().index.get(dataset, offset)
    }

    pub(crate) fn chunk_count(&self, dataset: &str) -> usize {
        self.inner.read().index.count(dataset)
    }

    pub(crate) fn nth_chunk(&self, dataset: &str, n: usize) -> Option<(Vec<u64>, ChunkLocation)> {
        self.inner
            .read()
            .index
            .nth(dataset, n)
            .map(|(offset, loc)| (offset.to_vec(), loc))
    }

    /// Read exactly `buf.len()` stored bytes starting at `address`.
    pub(crate) fn read_at(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        // Seeking needs the file mutably.
        let mut state = self.inner.write();
        let file = state.file_mut()?;
        file.seek(SeekFrom::Start(address))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Append a chunk record and point the index at it.
    pub(crate) fn append_chunk(
        &self,
        dataset: &str,
        offset: &[u64],
        data: &[u8],
        filter_mask: u32,
    ) -> Result<ChunkLocation> {
        let mut state = self.inner.write();
        state.ensure_writable()?;

        let record = encode_chunk_record(dataset, offset, data, filter_mask)?;
        let header_len = (record.len() - data.len()) as u64;
        let start = state.append(&record)?;

        let location = ChunkLocation {
            address: start + header_len,
            size: data.len() as u64,
            filter_mask,
        };
        if state.index.insert(dataset, offset, location).is_none() {
            debug!(dataset, offset = ?offset, address = location.address, "Chunk storage allocated");
        }
        Ok(location)
    }
}

/// Canonical form of `path` for identity checks; falls back to `path` itself
/// when it cannot be resolved.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// ─────────────────────────────── locking ─────────────────────────────────────

fn acquire_lock(file: &File, path: &Path, flags: AccessFlags, access: &FileAccess) -> Result<()> {
    let locking = access.file_locking();
    if !locking.use_file_locking {
        debug!(path = ?path, "File locking disabled");
        return Ok(());
    }
    if flags.contains(AccessFlags::SWMR_READ) {
        debug!(path = ?path, "SWMR reader, no lock taken");
        return Ok(());
    }

    let attempt = if flags.is_writable() {
        FileExt::try_lock_exclusive(file)
    } else {
        FileExt::try_lock_shared(file)
    };
    match attempt {
        Ok(()) => Ok(()),
        Err(e) if locking.ignore_when_disabled => {
            warn!(path = ?path, error = %e, "Could not lock container, continuing without lock");
            Ok(())
        }
        Err(e) => Err(ChunkError::LockFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

// ─────────────────────────────── encoding ────────────────────────────────────

fn write_file_header(file: &mut File, created_at: DateTime<Utc>) -> Result<()> {
    let mut header = Vec::with_capacity(FILE_HEADER_SIZE as usize);
    header.extend_from_slice(FILE_MAGIC);
    header.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    header.write_i64::<LittleEndian>(created_at.timestamp())?;
    header.resize(FILE_HEADER_SIZE as usize, 0); // reserved
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.flush()?;
    Ok(())
}

fn read_file_header(file: &mut File, path: &Path) -> Result<DateTime<Utc>> {
    let mut header = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)
        .map_err(|e| ChunkError::Storage(format!("read header of {path:?}: {e}")))?;
    if &header[..8] != FILE_MAGIC {
        return Err(ChunkError::Storage(format!("{path:?} is not a chunk container")));
    }
    let mut rest = &header[8..];
    let version = rest.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(ChunkError::Storage(format!(
            "{path:?} has unsupported format version {version}"
        )));
    }
    let ts = rest.read_i64::<LittleEndian>()?;
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| ChunkError::Storage(format!("{path:?} has invalid creation time {ts}")))
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| ChunkError::Config(format!("name too long: {} bytes", s.len())))?;
    buf.write_u16::<LittleEndian>(len)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_dims(buf: &mut Vec<u8>, dims: &[u64]) -> Result<()> {
    for &d in dims {
        buf.write_u64::<LittleEndian>(d)?;
    }
    Ok(())
}

fn encode_dataset_record(name: &str, spec: &DatasetSpec) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(DATASET_MAGIC);
    write_str(&mut buf, name)?;
    buf.write_u8(spec.shape.len() as u8)?;
    write_dims(&mut buf, &spec.shape)?;
    write_dims(&mut buf, &spec.chunk_shape)?;
    buf.write_u32::<LittleEndian>(spec.element_size)?;
    buf.write_u8(spec.pipeline.filters().len() as u8)?;
    for filter in spec.pipeline.filters() {
        buf.write_u16::<LittleEndian>(filter.id())?;
        buf.write_i32::<LittleEndian>(filter.param())?;
    }
    Ok(buf)
}

fn encode_chunk_record(dataset: &str, offset: &[u64], data: &[u8], filter_mask: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + data.len());
    buf.extend_from_slice(CHUNK_MAGIC);
    write_str(&mut buf, dataset)?;
    buf.write_u8(offset.len() as u8)?;
    write_dims(&mut buf, offset)?;
    buf.write_u32::<LittleEndian>(filter_mask)?;
    buf.write_u64::<LittleEndian>(data.len() as u64)?;
    buf.extend_from_slice(data);
    Ok(buf)
}

fn encode_link_record(name: &str, link: &ExternalLink) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(LINK_MAGIC);
    write_str(&mut buf, name)?;
    write_str(&mut buf, &link.target_file)?;
    write_str(&mut buf, &link.target_path)?;
    Ok(buf)
}

// ─────────────────────────────── scanning ────────────────────────────────────

/// Scan records from `start` to end of file.
///
/// A record cut short by the end of file is a torn append: the scan stops
/// there and returns the records read plus the end of the last complete one.
/// Any other decode failure means the file is corrupt and is returned as
/// [`ChunkError::Storage`].
fn scan_records(file: &File, start: u64) -> Result<(Vec<Record>, u64)> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start))?;

    let mut records = Vec::new();
    let mut pos = start;
    while pos < file_len {
        match read_record(&mut reader, file_len) {
            Ok(record) => {
                records.push(record);
                pos = reader.stream_position()?;
            }
            Err(ChunkError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset = pos, file_len, error = %e, "Incomplete record, scan stopped");
                break;
            }
            Err(e) => {
                return Err(ChunkError::Storage(format!("corrupt record at offset {pos}: {e}")));
            }
        }
    }
    Ok((records, pos))
}

fn read_str<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| ChunkError::Storage(format!("invalid UTF-8 name: {e}")))
}

fn read_dims<R: Read>(reader: &mut R, rank: usize) -> Result<Vec<u64>> {
    (0..rank)
        .map(|_| reader.read_u64::<LittleEndian>().map_err(ChunkError::from))
        .collect()
}

fn read_record(reader: &mut BufReader<&File>, file_len: u64) -> Result<Record> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    let name = read_str(reader)?;

    match &magic {
        DATASET_MAGIC => {
            let rank = reader.read_u8()? as usize;
            let shape = read_dims(reader, rank)?;
            let chunk_shape = read_dims(reader, rank)?;
            let element_size = reader.read_u32::<LittleEndian>()?;
            let n_filters = reader.read_u8()? as usize;
            let mut filters = Vec::with_capacity(n_filters);
            for _ in 0..n_filters {
                let id = reader.read_u16::<LittleEndian>()?;
                let param = reader.read_i32::<LittleEndian>()?;
                filters.push(Filter::from_parts(id, param)?);
            }
            let spec = DatasetSpec::new(&shape, &chunk_shape, element_size)
                .with_pipeline(FilterPipeline::new(filters)?);
            spec.validate()?;
            Ok(Record::Dataset { name, spec })
        }
        CHUNK_MAGIC => {
            let rank = reader.read_u8()? as usize;
            let offset = read_dims(reader, rank)?;
            let filter_mask = reader.read_u32::<LittleEndian>()?;
            let size = reader.read_u64::<LittleEndian>()?;
            let address = reader.stream_position()?;
            if address.saturating_add(size) > file_len {
                return Err(ChunkError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("chunk payload of {size} bytes at {address} runs past end of file"),
                )));
            }
            reader.seek_relative(size as i64)?;
            Ok(Record::Chunk(ScannedChunk {
                dataset: name,
                offset,
                location: ChunkLocation { address, size, filter_mask },
            }))
        }
        LINK_MAGIC => {
            let target_file = read_str(reader)?;
            let target_path = read_str(reader)?;
            Ok(Record::Link { name, link: ExternalLink { target_file, target_path } })
        }
        other => Err(ChunkError::Storage(format!("unknown record magic {other:?}"))),
    }
}
