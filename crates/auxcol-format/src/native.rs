//! Native ntuple files
//!
//! An ntuple holds one field per column. Rows are always filled for all
//! fields at once and grouped in clusters of `cluster_entries` rows; each
//! cluster stores one page per field. The directory of fields and clusters
//! is written as the file footer on close.
//!
//! A field added after rows were already filled is deferred: it records the
//! row it starts at, earlier rows have no stored entry and read as absent.

use crate::frame::{self, FILE_HEADER_SIZE, Record, RecordKind};
use crate::{ColumnDesc, ColumnHandle, IoStats, NTUPLE_MAGIC};
use auxcol_common::{Checksum, Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Description of one field
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDesc {
    pub name: String,
    /// On-disk type name
    pub type_name: String,
    /// Bit width of packed fields
    pub nbits: Option<u8>,
    /// First row with a stored entry
    pub first_entry: u64,
}

impl FieldDesc {
    /// True if the field was added after the first row
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.first_entry > 0
    }
}

/// Location of the page of one field within one cluster
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct PageLoc {
    field: u32,
    first_entry: u64,
    n_entries: u32,
    offset: u64,
    len: u32,
    checksum: Checksum,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ClusterDesc {
    first_entry: u64,
    n_entries: u64,
    pages: Vec<PageLoc>,
}

impl ClusterDesc {
    const fn end_entry(&self) -> u64 {
        self.first_entry + self.n_entries
    }
}

/// Footer of an ntuple file
#[derive(Debug, Serialize, Deserialize)]
struct NTupleDirectory {
    name: String,
    entries: u64,
    fields: Vec<FieldDesc>,
    clusters: Vec<ClusterDesc>,
}

struct FieldState {
    desc: FieldDesc,
    staged: Option<Bytes>,
    page: Vec<Bytes>,
}

/// Writer of a native ntuple file
pub struct NTupleWriter {
    path: PathBuf,
    name: String,
    out: BufWriter<File>,
    offset: u64,
    fields: Vec<FieldState>,
    by_name: HashMap<String, ColumnHandle>,
    entries: u64,
    cluster_first_entry: u64,
    cluster_entries: u64,
    clusters: Vec<ClusterDesc>,
    bytes_written: u64,
    closed: bool,
}

impl NTupleWriter {
    /// Create a new ntuple file, truncating any existing file
    pub fn create(path: impl AsRef<Path>, name: &str, cluster_entries: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        frame::write_header(&mut out, NTUPLE_MAGIC)?;

        info!("Created ntuple {} in {}", name, path.display());

        Ok(Self {
            path,
            name: name.to_string(),
            out,
            offset: FILE_HEADER_SIZE,
            fields: Vec::new(),
            by_name: HashMap::new(),
            entries: 0,
            cluster_first_entry: 0,
            cluster_entries: cluster_entries.max(1) as u64,
            clusters: Vec::new(),
            bytes_written: FILE_HEADER_SIZE,
            closed: false,
        })
    }

    /// Ntuple name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_argument(format!("ntuple {} is closed", self.name)));
        }
        Ok(())
    }

    /// Add a field. Fields added after the first fill are deferred to the
    /// current row.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_field(&mut self, name: &str, type_name: &str, nbits: Option<u8>) -> Result<ColumnHandle> {
        self.check_open()?;
        if self.by_name.contains_key(name) {
            return Err(Error::invalid_argument(format!("field {name} already exists")));
        }

        let handle = ColumnHandle::new(self.fields.len() as u32);
        self.fields.push(FieldState {
            desc: FieldDesc {
                name: name.to_string(),
                type_name: type_name.to_string(),
                nbits,
                first_entry: self.entries,
            },
            staged: None,
            page: Vec::new(),
        });
        self.by_name.insert(name.to_string(), handle);

        if self.entries > 0 {
            debug!(
                "Added deferred field {} ({}) to ntuple {} from entry {}",
                name, type_name, self.name, self.entries
            );
        } else {
            debug!("Added field {} ({}) to ntuple {}", name, type_name, self.name);
        }
        Ok(handle)
    }

    /// Look up a field by name
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<ColumnHandle> {
        self.by_name.get(name).copied()
    }

    /// Description of a field
    #[must_use]
    pub fn field(&self, handle: ColumnHandle) -> Option<&FieldDesc> {
        self.fields.get(handle.index()).map(|f| &f.desc)
    }

    /// Rows filled so far
    #[must_use]
    pub const fn entries(&self) -> u64 {
        self.entries
    }

    /// Bytes written to the file so far
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Stage the value of the current row of a field
    pub fn stage(&mut self, handle: ColumnHandle, data: Bytes) -> Result<()> {
        self.check_open()?;
        let field = self
            .fields
            .get_mut(handle.index())
            .ok_or_else(|| Error::invalid_argument(format!("no field with handle {}", handle.as_u32())))?;
        field.staged = Some(data);
        Ok(())
    }

    /// True if any field has a staged value
    #[must_use]
    pub fn has_staged(&self) -> bool {
        self.fields.iter().any(|f| f.staged.is_some())
    }

    /// Fill one row from the staged values of all fields.
    ///
    /// Returns the number of bytes appended.
    pub fn fill(&mut self) -> Result<usize> {
        self.check_open()?;
        if let Some(missing) = self.fields.iter().find(|f| f.staged.is_none()) {
            return Err(Error::invalid_argument(format!(
                "field {} has no value for row {}",
                missing.desc.name, self.entries
            )));
        }

        let mut total = 0;
        for field in &mut self.fields {
            if let Some(data) = field.staged.take() {
                total += data.len();
                field.page.push(data);
            }
        }
        self.entries += 1;

        if self.entries - self.cluster_first_entry >= self.cluster_entries {
            self.flush_cluster()?;
        }
        Ok(total)
    }

    /// Write the open cluster, if it has rows
    #[allow(clippy::cast_possible_truncation)]
    pub fn flush_cluster(&mut self) -> Result<()> {
        if self.entries == self.cluster_first_entry {
            return Ok(());
        }

        let mut pages = Vec::with_capacity(self.fields.len());
        for (idx, field) in self.fields.iter_mut().enumerate() {
            if field.page.is_empty() {
                continue;
            }
            let entries = std::mem::take(&mut field.page);
            let n_entries = entries.len() as u32;
            let first_entry = self.cluster_first_entry.max(field.desc.first_entry);
            let payload = frame::pack_entries(&entries);
            let checksum = Checksum::compute(&payload);
            let record = Record {
                kind: RecordKind::Page,
                column: idx as u32,
                first_entry,
                n_entries,
                payload,
            }
            .to_bytes();

            self.out.write_all(&record)?;
            pages.push(PageLoc {
                field: idx as u32,
                first_entry,
                n_entries,
                offset: self.offset,
                len: record.len() as u32,
                checksum,
            });
            self.offset += record.len() as u64;
            self.bytes_written += record.len() as u64;
        }

        let cluster = ClusterDesc {
            first_entry: self.cluster_first_entry,
            n_entries: self.entries - self.cluster_first_entry,
            pages,
        };
        debug!(
            "Flushed cluster [{}, {}) of ntuple {} with {} pages",
            cluster.first_entry,
            cluster.end_entry(),
            self.name,
            cluster.pages.len()
        );
        self.clusters.push(cluster);
        self.cluster_first_entry = self.entries;
        Ok(())
    }

    /// Write the open cluster and the directory.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.flush_cluster()?;
        for field in &mut self.fields {
            if field.staged.take().is_some() {
                warn!("Discarding unfilled value of field {} on close", field.desc.name);
            }
        }

        let directory = NTupleDirectory {
            name: self.name.clone(),
            entries: self.entries,
            fields: self.fields.iter().map(|f| f.desc.clone()).collect(),
            clusters: std::mem::take(&mut self.clusters),
        };
        self.bytes_written +=
            frame::write_footer(&mut self.out, self.offset, &directory, NTUPLE_MAGIC)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        self.closed = true;

        info!(
            "Closed ntuple {} ({} entries, {} fields, {} clusters, {} bytes)",
            self.name,
            directory.entries,
            directory.fields.len(),
            directory.clusters.len(),
            self.bytes_written
        );
        Ok(())
    }
}

impl Drop for NTupleWriter {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.close()
        {
            warn!("Failed to close ntuple {}: {}", self.name, e);
        }
    }
}

struct CachedPage {
    first_entry: u64,
    entries: Vec<Bytes>,
}

impl CachedPage {
    fn get(&self, entry: u64) -> Option<&Bytes> {
        let pos = entry.checked_sub(self.first_entry)?;
        self.entries.get(usize::try_from(pos).ok()?)
    }
}

/// Reader of a native ntuple file.
///
/// With prefetch enabled the page of the cluster holding the last row read
/// is kept per field, so later rows of the same cluster are served from
/// memory.
pub struct NTupleReader {
    path: PathBuf,
    directory: NTupleDirectory,
    by_name: HashMap<String, ColumnHandle>,
    file: Mutex<File>,
    pages: Mutex<HashMap<ColumnHandle, CachedPage>>,
    prefetch: bool,
    stats: IoStats,
}

impl NTupleReader {
    /// Open a closed ntuple file with cluster prefetch enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_prefetch(path, true)
    }

    /// Open a closed ntuple file
    pub fn open_with_prefetch(path: impl AsRef<Path>, prefetch: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        frame::read_header(&mut file, NTUPLE_MAGIC)?;
        let directory: NTupleDirectory = frame::read_footer(&mut file, NTUPLE_MAGIC)?;

        #[allow(clippy::cast_possible_truncation)]
        let by_name = directory
            .fields
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.name.clone(), ColumnHandle::new(idx as u32)))
            .collect();

        info!(
            "Opened ntuple {} from {} ({} entries, {} fields, {} clusters)",
            directory.name,
            path.display(),
            directory.entries,
            directory.fields.len(),
            directory.clusters.len()
        );

        Ok(Self {
            path,
            directory,
            by_name,
            file: Mutex::new(file),
            pages: Mutex::new(HashMap::new()),
            prefetch,
            stats: IoStats::default(),
        })
    }

    /// Ntuple name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.directory.name
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows in the ntuple
    #[must_use]
    pub const fn entries(&self) -> u64 {
        self.directory.entries
    }

    /// Number of clusters
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.directory.clusters.len()
    }

    /// All fields in creation order
    #[must_use]
    pub fn fields(&self) -> &[FieldDesc] {
        &self.directory.fields
    }

    /// Look up a field by name
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<ColumnHandle> {
        self.by_name.get(name).copied()
    }

    /// Description of a field
    #[must_use]
    pub fn field(&self, handle: ColumnHandle) -> Option<&FieldDesc> {
        self.directory.fields.get(handle.index())
    }

    /// Backend-independent view of all fields
    #[must_use]
    pub fn columns(&self) -> Vec<ColumnDesc> {
        self.directory
            .fields
            .iter()
            .map(|f| ColumnDesc {
                name: f.name.clone(),
                type_name: f.type_name.clone(),
                nbits: f.nbits,
                first_entry: f.first_entry,
                entries: self.directory.entries,
            })
            .collect()
    }

    /// Read statistics
    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read the raw bytes of one entry of a field.
    ///
    /// Returns `None` for rows before the first entry of a deferred field.
    pub fn read_entry(&self, handle: ColumnHandle, entry: u64) -> Result<Option<Bytes>> {
        let field = self
            .field(handle)
            .ok_or_else(|| Error::invalid_argument(format!("no field with handle {}", handle.as_u32())))?;
        if entry >= self.directory.entries {
            return Err(Error::invalid_argument(format!(
                "entry {} out of range for ntuple {} ({} entries)",
                entry, self.directory.name, self.directory.entries
            )));
        }
        if entry < field.first_entry {
            return Ok(None);
        }

        if let Some(data) = self
            .pages
            .lock()
            .get(&handle)
            .and_then(|page| page.get(entry))
            .cloned()
        {
            self.stats.record_hit();
            return Ok(Some(data));
        }

        let clusters = &self.directory.clusters;
        let cluster = clusters
            .get(clusters.partition_point(|c| c.end_entry() <= entry))
            .ok_or_else(|| Error::format(format!("no cluster holds entry {entry}")))?;
        let loc = cluster
            .pages
            .iter()
            .find(|p| p.field == handle.as_u32())
            .ok_or_else(|| {
                Error::format(format!(
                    "cluster at entry {} has no page for field {}",
                    cluster.first_entry, field.name
                ))
            })?;

        let record = {
            let mut file = self.file.lock();
            frame::read_record(&mut file, loc.offset, loc.len)?
        };
        if record.kind != RecordKind::Page
            || record.column != handle.as_u32()
            || record.first_entry != loc.first_entry
            || record.n_entries != loc.n_entries
        {
            return Err(Error::format(format!(
                "page at offset {} does not belong to field {}",
                loc.offset, field.name
            )));
        }
        if !loc.checksum.verify_full(&record.payload) {
            return Err(Error::format(format!(
                "page content hash mismatch in field {}",
                field.name
            )));
        }

        let page = CachedPage {
            first_entry: loc.first_entry,
            entries: frame::unpack_entries(&record.payload, record.n_entries)?,
        };
        let data = page
            .get(entry)
            .cloned()
            .ok_or_else(|| Error::format(format!("page of field {} is short", field.name)))?;
        self.stats.record_load(u64::from(loc.len));
        if self.prefetch {
            self.pages.lock().insert(handle, page);
        }

        debug!(
            "Loaded page of field {} for cluster [{}, {})",
            field.name,
            cluster.first_entry,
            cluster.end_entry()
        );
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(i: u64) -> Bytes {
        Bytes::from(i.to_le_bytes().to_vec())
    }

    #[test]
    fn test_fill_roundtrip_across_clusters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ntuple");

        let mut writer = NTupleWriter::create(&path, "EventData", 4).unwrap();
        let base = writer.add_field("ElectronsAux.", "xAOD::AuxContainerBase", None).unwrap();
        let pt = writer.add_field("ElectronsAuxDyn.pt", "std::vector<float>", None).unwrap();
        for i in 0..10 {
            writer.stage(base, entry(i)).unwrap();
            writer.stage(pt, entry(i + 1000)).unwrap();
            writer.fill().unwrap();
        }
        writer.close().unwrap();

        let reader = NTupleReader::open(&path).unwrap();
        assert_eq!(reader.name(), "EventData");
        assert_eq!(reader.entries(), 10);
        assert_eq!(reader.cluster_count(), 3);
        let pt = reader.find_field("ElectronsAuxDyn.pt").unwrap();
        for i in 0..10 {
            assert_eq!(reader.read_entry(pt, i).unwrap(), Some(entry(i + 1000)));
        }
        assert!(reader.read_entry(pt, 10).is_err());
    }

    #[test]
    fn test_deferred_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deferred.ntuple");

        let mut writer = NTupleWriter::create(&path, "t", 4).unwrap();
        let x = writer.add_field("x", "float", None).unwrap();
        for i in 0..5 {
            writer.stage(x, entry(i)).unwrap();
            writer.fill().unwrap();
        }
        let y = writer.add_field("y", "int", None).unwrap();
        assert!(writer.field(y).unwrap().is_deferred());
        for i in 5..10 {
            writer.stage(x, entry(i)).unwrap();
            writer.stage(y, entry(i * 10)).unwrap();
            writer.fill().unwrap();
        }
        writer.close().unwrap();

        let reader = NTupleReader::open(&path).unwrap();
        let y = reader.find_field("y").unwrap();
        assert_eq!(reader.field(y).unwrap().first_entry, 5);
        for i in 0..5 {
            assert_eq!(reader.read_entry(y, i).unwrap(), None);
        }
        for i in 5..10 {
            assert_eq!(reader.read_entry(y, i).unwrap(), Some(entry(i * 10)));
        }
        let columns = reader.columns();
        assert_eq!(columns[1].first_entry, 5);
        assert_eq!(columns[1].entries, 10);
    }

    #[test]
    fn test_prefetch_serves_cluster_from_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefetch.ntuple");

        let mut writer = NTupleWriter::create(&path, "t", 5).unwrap();
        let x = writer.add_field("x", "int", None).unwrap();
        for i in 0..10 {
            writer.stage(x, entry(i)).unwrap();
            writer.fill().unwrap();
        }
        writer.close().unwrap();

        let reader = NTupleReader::open(&path).unwrap();
        for i in 0..5 {
            reader.read_entry(x, i).unwrap();
        }
        assert_eq!(reader.stats().records_loaded(), 1);

        let uncached = NTupleReader::open_with_prefetch(&path, false).unwrap();
        for i in 0..5 {
            uncached.read_entry(x, i).unwrap();
        }
        assert_eq!(uncached.stats().records_loaded(), 5);
    }

    #[test]
    fn test_fill_requires_all_fields() {
        let dir = tempdir().unwrap();
        let mut writer = NTupleWriter::create(dir.path().join("x.ntuple"), "t", 4).unwrap();
        let a = writer.add_field("a", "int", None).unwrap();
        writer.add_field("b", "int", None).unwrap();
        writer.stage(a, entry(1)).unwrap();
        assert!(writer.has_staged());
        assert!(writer.fill().is_err());
        assert_eq!(writer.entries(), 0);
    }

    #[test]
    fn test_corrupted_footer_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.ntuple");
        {
            let mut writer = NTupleWriter::create(&path, "t", 4).unwrap();
            let a = writer.add_field("a", "int", None).unwrap();
            writer.stage(a, entry(1)).unwrap();
            writer.fill().unwrap();
            writer.close().unwrap();
        }

        let mut data = std::fs::read(&path).unwrap();
        let footer_byte = data.len() - frame::TRAILER_SIZE as usize - 1;
        data[footer_byte] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        assert!(matches!(NTupleReader::open(&path), Err(Error::Format(_))));
    }
}
