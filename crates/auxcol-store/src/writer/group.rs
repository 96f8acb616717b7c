//! Shared outputs and grouped commits
//!
//! Several logical producers may write rows into one physical output. Each
//! producer registers as a client of the output's [`CommitGroup`]; the
//! physical row fill happens once every client has committed the row.

use auxcol_common::{Error, Result};
use auxcol_format::{FileKind, NTupleWriter, TreeWriter};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

/// Physical writer behind a shared output
pub enum PhysicalWriter {
    Tree(TreeWriter),
    NTuple(NTupleWriter),
}

impl PhysicalWriter {
    /// Physical layout written
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        match self {
            Self::Tree(_) => FileKind::Legacy,
            Self::NTuple(_) => FileKind::Native,
        }
    }

    /// Rows written so far
    #[must_use]
    pub fn entries(&self) -> u64 {
        match self {
            Self::Tree(tree) => tree.entries(),
            Self::NTuple(ntuple) => ntuple.entries(),
        }
    }

    /// True if any column has a staged value
    #[must_use]
    pub fn has_staged(&self) -> bool {
        match self {
            Self::Tree(tree) => tree.has_staged(),
            Self::NTuple(ntuple) => ntuple.has_staged(),
        }
    }

    fn fill(&mut self) -> Result<usize> {
        match self {
            Self::Tree(tree) => tree.fill(),
            Self::NTuple(ntuple) => ntuple.fill(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Tree(tree) => tree.close(),
            Self::NTuple(ntuple) => ntuple.close(),
        }
    }
}

/// Outcome of one producer committing a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Every producer committed; the caller fills the row
    Last,
    /// Other producers still have to commit. `filled` is the number of rows
    /// filled before the pending one.
    Waiting { filled: u64 },
}

#[derive(Debug, Default)]
struct Arrivals {
    arrived: usize,
    filled: u64,
}

/// Commit bookkeeping of the producers sharing one output
#[derive(Debug, Default)]
pub struct CommitGroup {
    clients: AtomicUsize,
    arrivals: Mutex<Arrivals>,
}

impl CommitGroup {
    /// Create a group without clients
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more producer. Returns the new client count.
    pub fn increase_client_count(&self) -> usize {
        self.clients.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of registered producers
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    /// True if more than one producer shares the output
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.client_count() > 1
    }

    /// Producers that committed the current row so far
    #[must_use]
    pub fn pending_arrivals(&self) -> usize {
        self.arrivals.lock().arrived
    }

    /// Rows completed by the last producer to commit
    #[must_use]
    pub fn filled_rows(&self) -> u64 {
        self.arrivals.lock().filled
    }

    /// Record that one producer committed the current row
    pub fn arrive(&self) -> Arrival {
        let mut arrivals = self.arrivals.lock();
        arrivals.arrived += 1;
        if arrivals.arrived >= self.client_count().max(1) {
            arrivals.arrived = 0;
            arrivals.filled += 1;
            Arrival::Last
        } else {
            Arrival::Waiting {
                filled: arrivals.filled,
            }
        }
    }
}

/// One physical output shared by all producers writing to it
pub struct SharedOutput {
    name: String,
    kind: FileKind,
    writer: Mutex<PhysicalWriter>,
    group: CommitGroup,
    fills: AtomicU64,
}

impl SharedOutput {
    fn new(name: &str, writer: PhysicalWriter) -> Self {
        Self {
            name: name.to_string(),
            kind: writer.kind(),
            writer: Mutex::new(writer),
            group: CommitGroup::new(),
            fills: AtomicU64::new(0),
        }
    }

    /// Create a legacy tree output
    pub fn tree(name: &str, path: impl AsRef<Path>, tree_name: &str) -> Result<Self> {
        let tree = TreeWriter::create(path, tree_name)?;
        Ok(Self::new(name, PhysicalWriter::Tree(tree)))
    }

    /// Create a native ntuple output
    pub fn ntuple(
        name: &str,
        path: impl AsRef<Path>,
        ntuple_name: &str,
        cluster_entries: usize,
    ) -> Result<Self> {
        let ntuple = NTupleWriter::create(path, ntuple_name, cluster_entries)?;
        Ok(Self::new(name, PhysicalWriter::NTuple(ntuple)))
    }

    /// Output name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical layout written
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        self.kind
    }

    /// Commit bookkeeping of the producers
    #[must_use]
    pub const fn group(&self) -> &CommitGroup {
        &self.group
    }

    /// Exclusive access to the physical writer
    pub fn writer(&self) -> MutexGuard<'_, PhysicalWriter> {
        self.writer.lock()
    }

    /// Rows written so far
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.writer.lock().entries()
    }

    /// Physical row fills performed
    #[must_use]
    pub fn fill_count(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }

    /// Fill one row from the staged values of all columns
    pub(crate) fn fill(&self) -> Result<usize> {
        let bytes = self.writer.lock().fill()?;
        let fills = self.fills.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Filled row {} of output {} ({} bytes)", fills - 1, self.name, bytes);
        Ok(bytes)
    }

    /// Flush and finalize the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.writer.lock().close()
    }
}

/// Outputs keyed by name
#[derive(Default)]
pub struct OutputRegistry {
    outputs: Mutex<HashMap<String, Arc<SharedOutput>>>,
}

impl OutputRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn open_with(
        &self,
        name: &str,
        kind: FileKind,
        create: impl FnOnce() -> Result<SharedOutput>,
    ) -> Result<Arc<SharedOutput>> {
        let mut outputs = self.outputs.lock();
        if let Some(existing) = outputs.get(name) {
            if existing.kind() != kind {
                return Err(Error::invalid_argument(format!(
                    "output {name} is already open as a {} file",
                    existing.kind()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let output = Arc::new(create()?);
        info!("Opened {} output {}", kind, name);
        outputs.insert(name.to_string(), Arc::clone(&output));
        Ok(output)
    }

    /// Return the legacy output `name`, creating it on first use
    pub fn open_tree(&self, name: &str, path: impl AsRef<Path>, tree_name: &str) -> Result<Arc<SharedOutput>> {
        self.open_with(name, FileKind::Legacy, || SharedOutput::tree(name, path, tree_name))
    }

    /// Return the native output `name`, creating it on first use
    pub fn open_ntuple(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        ntuple_name: &str,
        cluster_entries: usize,
    ) -> Result<Arc<SharedOutput>> {
        self.open_with(name, FileKind::Native, || {
            SharedOutput::ntuple(name, path, ntuple_name, cluster_entries)
        })
    }

    /// Look up an open output
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<SharedOutput>> {
        self.outputs.lock().get(name).cloned()
    }

    /// Number of open outputs
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    /// True if no output is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every output and forget them
    pub fn close_all(&self) -> Result<()> {
        let outputs: Vec<_> = self.outputs.lock().drain().collect();
        for (name, output) in outputs {
            output.close()?;
            info!("Closed output {} after {} rows", name, output.entries());
        }
        Ok(())
    }
}
