//! Legacy tree files
//!
//! A tree holds one branch per column. Entries of a branch are buffered and
//! written in baskets of `basket_entries` entries; the directory of branches
//! and basket locations is written as the file footer on close.
//!
//! Branches may be filled one at a time (`fill_branch`) or all together
//! (`fill`). A branch created after rows were already written starts empty
//! and must be brought level with `append_entry` before it is filled again.

use crate::frame::{self, FILE_HEADER_SIZE, Record, RecordKind};
use crate::{ColumnDesc, ColumnHandle, IoStats, TREE_MAGIC};
use auxcol_common::{Checksum, Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Location of one basket within the file
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub(crate) struct BasketLoc {
    first_entry: u64,
    n_entries: u32,
    offset: u64,
    len: u32,
    checksum: Checksum,
}

impl BasketLoc {
    const fn end_entry(&self) -> u64 {
        self.first_entry + self.n_entries as u64
    }
}

/// Description of one branch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchDesc {
    pub name: String,
    /// On-disk type name
    pub type_name: String,
    /// Bit width of packed branches
    pub nbits: Option<u8>,
    /// Entries per basket
    pub basket_entries: u32,
    /// Entries written
    pub entries: u64,
    baskets: Vec<BasketLoc>,
}

impl BranchDesc {
    /// Backend-independent view of this branch
    #[must_use]
    pub fn column_desc(&self) -> ColumnDesc {
        ColumnDesc {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            nbits: self.nbits,
            first_entry: 0,
            entries: self.entries,
        }
    }

    /// Number of baskets written
    #[must_use]
    pub fn basket_count(&self) -> usize {
        self.baskets.len()
    }
}

/// Footer of a tree file
#[derive(Debug, Serialize, Deserialize)]
struct TreeDirectory {
    name: String,
    entries: u64,
    branches: Vec<BranchDesc>,
}

struct BranchState {
    desc: BranchDesc,
    staged: Option<Bytes>,
    pending: Vec<Bytes>,
}

/// Writer of a legacy tree file
pub struct TreeWriter {
    path: PathBuf,
    name: String,
    out: BufWriter<File>,
    offset: u64,
    branches: Vec<BranchState>,
    by_name: HashMap<String, ColumnHandle>,
    bytes_written: u64,
    closed: bool,
}

impl TreeWriter {
    /// Create a new tree file, truncating any existing file
    pub fn create(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        frame::write_header(&mut out, TREE_MAGIC)?;

        info!("Created tree {} in {}", name, path.display());

        Ok(Self {
            path,
            name: name.to_string(),
            out,
            offset: FILE_HEADER_SIZE,
            branches: Vec::new(),
            by_name: HashMap::new(),
            bytes_written: FILE_HEADER_SIZE,
            closed: false,
        })
    }

    /// Tree name
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
            return Err(Error::invalid_argument(format!("tree {} is closed", self.name)));
        }
        Ok(())
    }

    fn state_mut(&mut self, handle: ColumnHandle) -> Result<&mut BranchState> {
        self.branches
            .get_mut(handle.index())
            .ok_or_else(|| Error::invalid_argument(format!("no branch with handle {}", handle.as_u32())))
    }

    /// Add a branch. Branch names are unique within a tree.
    #[allow(clippy::cast_possible_truncation)]
    pub fn create_branch(
        &mut self,
        name: &str,
        type_name: &str,
        nbits: Option<u8>,
        basket_entries: usize,
    ) -> Result<ColumnHandle> {
        self.check_open()?;
        if self.by_name.contains_key(name) {
            return Err(Error::invalid_argument(format!("branch {name} already exists")));
        }

        let handle = ColumnHandle::new(self.branches.len() as u32);
        self.branches.push(BranchState {
            desc: BranchDesc {
                name: name.to_string(),
                type_name: type_name.to_string(),
                nbits,
                basket_entries: basket_entries.clamp(1, u32::MAX as usize) as u32,
                entries: 0,
                baskets: Vec::new(),
            },
            staged: None,
            pending: Vec::new(),
        });
        self.by_name.insert(name.to_string(), handle);

        debug!("Created branch {} ({}) in tree {}", name, type_name, self.name);
        Ok(handle)
    }

    /// Look up a branch by name
    #[must_use]
    pub fn find_branch(&self, name: &str) -> Option<ColumnHandle> {
        self.by_name.get(name).copied()
    }

    /// Description of a branch
    #[must_use]
    pub fn branch(&self, handle: ColumnHandle) -> Option<&BranchDesc> {
        self.branches.get(handle.index()).map(|b| &b.desc)
    }

    /// Entries written to a branch so far
    #[must_use]
    pub fn branch_entries(&self, handle: ColumnHandle) -> u64 {
        self.branch(handle).map_or(0, |b| b.entries)
    }

    /// Rows in the tree: the longest branch
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.branches.iter().map(|b| b.desc.entries).max().unwrap_or(0)
    }

    /// Bytes written to the file so far
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Stage the value of the current row of a branch
    pub fn set_entry(&mut self, handle: ColumnHandle, data: Bytes) -> Result<()> {
        self.check_open()?;
        self.state_mut(handle)?.staged = Some(data);
        Ok(())
    }

    /// True if any branch has a staged value
    #[must_use]
    pub fn has_staged(&self) -> bool {
        self.branches.iter().any(|b| b.staged.is_some())
    }

    /// Append the staged value of one branch.
    ///
    /// Returns the number of bytes appended.
    pub fn fill_branch(&mut self, handle: ColumnHandle) -> Result<usize> {
        self.check_open()?;
        let state = self.state_mut(handle)?;
        let data = state.staged.take().ok_or_else(|| {
            Error::invalid_argument(format!("branch {} has no staged value", state.desc.name))
        })?;
        self.append_entry(handle, data)
    }

    /// Append one entry to a branch directly, bypassing staging
    pub fn append_entry(&mut self, handle: ColumnHandle, data: Bytes) -> Result<usize> {
        self.check_open()?;
        let len = data.len();
        let state = self.state_mut(handle)?;
        state.pending.push(data);
        state.desc.entries += 1;
        if state.pending.len() >= state.desc.basket_entries as usize {
            self.flush_basket(handle)?;
        }
        Ok(len)
    }

    /// Append the staged values of all branches as one row.
    ///
    /// Every branch must have a staged value. Returns the number of bytes
    /// appended.
    pub fn fill(&mut self) -> Result<usize> {
        self.check_open()?;
        if let Some(missing) = self.branches.iter().find(|b| b.staged.is_none()) {
            return Err(Error::invalid_argument(format!(
                "branch {} has no value for row {}",
                missing.desc.name, missing.desc.entries
            )));
        }

        let mut total = 0;
        for idx in 0..self.branches.len() {
            #[allow(clippy::cast_possible_truncation)]
            let handle = ColumnHandle::new(idx as u32);
            total += self.fill_branch(handle)?;
        }
        Ok(total)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn flush_basket(&mut self, handle: ColumnHandle) -> Result<()> {
        let state = &mut self.branches[handle.index()];
        if state.pending.is_empty() {
            return Ok(());
        }

        let entries = std::mem::take(&mut state.pending);
        let n_entries = entries.len() as u32;
        let first_entry = state.desc.entries - u64::from(n_entries);
        let payload = frame::pack_entries(&entries);
        let checksum = Checksum::compute(&payload);
        let record = Record {
            kind: RecordKind::Basket,
            column: handle.as_u32(),
            first_entry,
            n_entries,
            payload,
        }
        .to_bytes();

        self.out.write_all(&record)?;
        state.desc.baskets.push(BasketLoc {
            first_entry,
            n_entries,
            offset: self.offset,
            len: record.len() as u32,
            checksum,
        });
        self.offset += record.len() as u64;
        self.bytes_written += record.len() as u64;

        debug!(
            "Flushed basket of {} entries for branch {} at offset {}",
            n_entries, state.desc.name, first_entry
        );
        Ok(())
    }

    /// Write all pending baskets and the directory.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        for idx in 0..self.branches.len() {
            #[allow(clippy::cast_possible_truncation)]
            let handle = ColumnHandle::new(idx as u32);
            self.flush_basket(handle)?;
            if self.branches[idx].staged.take().is_some() {
                warn!(
                    "Discarding unfilled value of branch {} on close",
                    self.branches[idx].desc.name
                );
            }
        }

        let directory = TreeDirectory {
            name: self.name.clone(),
            entries: self.entries(),
            branches: self.branches.iter().map(|b| b.desc.clone()).collect(),
        };
        self.bytes_written += frame::write_footer(&mut self.out, self.offset, &directory, TREE_MAGIC)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        self.closed = true;

        info!(
            "Closed tree {} ({} entries, {} branches, {} bytes)",
            self.name,
            directory.entries,
            directory.branches.len(),
            self.bytes_written
        );
        Ok(())
    }
}

impl Drop for TreeWriter {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.close()
        {
            warn!("Failed to close tree {}: {}", self.name, e);
        }
    }
}

struct CachedBasket {
    first_entry: u64,
    entries: Vec<Bytes>,
}

impl CachedBasket {
    fn get(&self, entry: u64) -> Option<&Bytes> {
        let pos = entry.checked_sub(self.first_entry)?;
        self.entries.get(usize::try_from(pos).ok()?)
    }
}

/// Reader of a legacy tree file.
///
/// The last basket read per branch is kept in memory.
pub struct TreeReader {
    path: PathBuf,
    directory: TreeDirectory,
    by_name: HashMap<String, ColumnHandle>,
    file: Mutex<File>,
    baskets: Mutex<HashMap<ColumnHandle, CachedBasket>>,
    stats: IoStats,
}

impl TreeReader {
    /// Open a closed tree file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        frame::read_header(&mut file, TREE_MAGIC)?;
        let directory: TreeDirectory = frame::read_footer(&mut file, TREE_MAGIC)?;

        #[allow(clippy::cast_possible_truncation)]
        let by_name = directory
            .branches
            .iter()
            .enumerate()
            .map(|(idx, b)| (b.name.clone(), ColumnHandle::new(idx as u32)))
            .collect();

        info!(
            "Opened tree {} from {} ({} entries, {} branches)",
            directory.name,
            path.display(),
            directory.entries,
            directory.branches.len()
        );

        Ok(Self {
            path,
            directory,
            by_name,
            file: Mutex::new(file),
            baskets: Mutex::new(HashMap::new()),
            stats: IoStats::default(),
        })
    }

    /// Tree name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.directory.name
    }

    /// File path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows in the tree
    #[must_use]
    pub const fn entries(&self) -> u64 {
        self.directory.entries
    }

    /// All branches in creation order
    #[must_use]
    pub fn branches(&self) -> &[BranchDesc] {
        &self.directory.branches
    }

    /// Look up a branch by name
    #[must_use]
    pub fn find_branch(&self, name: &str) -> Option<ColumnHandle> {
        self.by_name.get(name).copied()
    }

    /// Description of a branch
    #[must_use]
    pub fn branch(&self, handle: ColumnHandle) -> Option<&BranchDesc> {
        self.directory.branches.get(handle.index())
    }

    /// Backend-independent view of all branches
    #[must_use]
    pub fn columns(&self) -> Vec<ColumnDesc> {
        self.directory.branches.iter().map(BranchDesc::column_desc).collect()
    }

    /// Read statistics
    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read the raw bytes of one entry of a branch
    pub fn read_entry(&self, handle: ColumnHandle, entry: u64) -> Result<Bytes> {
        let branch = self
            .branch(handle)
            .ok_or_else(|| Error::invalid_argument(format!("no branch with handle {}", handle.as_u32())))?;
        if entry >= branch.entries {
            return Err(Error::invalid_argument(format!(
                "entry {} out of range for branch {} ({} entries)",
                entry, branch.name, branch.entries
            )));
        }

        if let Some(data) = self
            .baskets
            .lock()
            .get(&handle)
            .and_then(|basket| basket.get(entry))
            .cloned()
        {
            self.stats.record_hit();
            return Ok(data);
        }

        let idx = branch.baskets.partition_point(|b| b.end_entry() <= entry);
        let loc = branch
            .baskets
            .get(idx)
            .filter(|b| b.first_entry <= entry)
            .ok_or_else(|| Error::format(format!("no basket holds entry {} of branch {}", entry, branch.name)))?;

        let record = {
            let mut file = self.file.lock();
            frame::read_record(&mut file, loc.offset, loc.len)?
        };
        if record.kind != RecordKind::Basket
            || record.column != handle.as_u32()
            || record.first_entry != loc.first_entry
            || record.n_entries != loc.n_entries
        {
            return Err(Error::format(format!(
                "basket at offset {} does not belong to branch {}",
                loc.offset, branch.name
            )));
        }
        if !loc.checksum.verify_full(&record.payload) {
            return Err(Error::format(format!(
                "basket content hash mismatch in branch {}",
                branch.name
            )));
        }

        let basket = CachedBasket {
            first_entry: loc.first_entry,
            entries: frame::unpack_entries(&record.payload, record.n_entries)?,
        };
        let data = basket
            .get(entry)
            .cloned()
            .ok_or_else(|| Error::format(format!("basket of branch {} is short", branch.name)))?;
        self.stats.record_load(u64::from(loc.len));
        self.baskets.lock().insert(handle, basket);

        debug!(
            "Loaded basket [{}, {}) of branch {}",
            loc.first_entry,
            loc.end_entry(),
            branch.name
        );
        Ok(data)
    }
}
