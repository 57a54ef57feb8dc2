//! An embedded, append-only, copy-on-write key-value engine built on an
//! adaptive radix trie in a memory-mapped segmented heap.
//!
//! The heap is one contiguous reservation grown in 32 MiB segments;
//! every object is reached through an 8-byte atomic control block, which
//! is what lets the compactor relocate live data underneath lock-free
//! readers. Writers get snapshot-isolated copy-on-write updates; readers
//! pay one wait-free atomic per lock scope.

use std::{
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc, Once},
};

use bytemuck::{Pod, Zeroable};

pub mod bitmap;
pub mod block_file;
pub mod control;
pub mod header;
pub mod node;
pub mod ring;
pub mod roots;
pub mod segment;
pub mod trie;

mod allocator;
mod error;
mod recover;
mod session;

pub use error::{Error, Result};
pub use session::Session;
pub use trie::cursor::Cursor;

pub(crate) use node::vtables;

use allocator::Allocator;
use control::PtrAddress;
use roots::RootTable;

/// Granularity of all heap addressing.
pub const CACHELINE_SIZE: usize = 64;

/// The super-page: unit of mmap, mlock, mprotect, msync and compaction.
pub const SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

pub const SEGMENT_HEADER_SIZE: usize = 64;
pub const SEGMENT_FOOTER_SIZE: usize = 64;

/// Compile-time ceiling on the database size; the runtime reservation is
/// `Config::max_database_size`.
pub const MAX_DATABASE_SIZE_CAP: u64 = 8 << 40;

pub const MAX_SEGMENT_COUNT: u64 = MAX_DATABASE_SIZE_CAP / SEGMENT_SIZE;

/// Sessions, and the reference-count overshoot margin.
pub const MAX_THREADS: u32 = 64;
pub const MAX_SESSIONS: usize = 64;

/// Largest single allocation: half a segment.
pub const MAX_OBJECT_SIZE: u64 = SEGMENT_SIZE / 2;

pub const MAX_KEY_LENGTH: usize = 1024;

/// Root object table slots.
pub const NUM_TOP_ROOTS: usize = 1024;

/// Branch count at which a setlist node becomes a full node.
pub const FULL_NODE_THRESHOLD: usize = 128;

/// Byte size past which a binary (leaf) node is split.
pub const BINARY_REFACTOR_THRESHOLD: usize = 4096;

pub const BINARY_NODE_MAX_KEYS: usize = 254;

/// Objects above this size are never promoted to the pinned cache.
pub const MAX_CACHEABLE_OBJECT_SIZE: usize = 4096;

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Durability ladder, weakest to strongest. Each level implies the ones
/// below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncLevel {
    /// Whenever the OS chooses.
    None,
    /// Write-protect committed pages; no flushing.
    Mprotect,
    /// `msync(MS_ASYNC)`.
    MsyncAsync,
    /// `msync(MS_SYNC)`.
    MsyncSync,
    /// `fsync` the backing file too.
    Fsync,
    /// `F_FULLFSYNC` on macOS; `fsync` elsewhere.
    Full,
}

/// Runtime-recognised engine options.
#[derive(Clone, Debug)]
pub struct Config {
    /// Virtual reservation for the heap; the hard size cap.
    pub max_database_size: u64,
    /// Upper bound on mlocked segment memory.
    pub max_pinned_cache_size_mb: u64,
    /// Full-cycle period of the read-bit decay thread.
    pub read_cache_window_sec: u64,
    /// When false, reads never promote objects to the pinned cache.
    pub enable_read_cache: bool,
    /// Apply `mprotect(PROT_READ)` on commit even at `SyncLevel::None`.
    pub write_protect_on_commit: bool,
    pub sync_mode: SyncLevel,
    /// Record a 64-bit checksum in every commit's sync header.
    pub checksum_commits: bool,
    pub update_checksum_on_modify: bool,
    pub update_checksum_on_compact: bool,
    pub validate_checksum_on_compact: bool,
    pub compact_pinned_unused_threshold_mb: u64,
    pub compact_unpinned_unused_threshold_mb: u64,
    pub provider_interval_ms: u64,
    pub compactor_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_database_size: 64 << 30,
            max_pinned_cache_size_mb: 8192,
            read_cache_window_sec: 5 * 60 * 60,
            enable_read_cache: true,
            write_protect_on_commit: false,
            sync_mode: SyncLevel::None,
            checksum_commits: true,
            update_checksum_on_modify: false,
            update_checksum_on_compact: true,
            validate_checksum_on_compact: true,
            compact_pinned_unused_threshold_mb: 4,
            compact_unpinned_unused_threshold_mb: 16,
            provider_interval_ms: 10,
            compactor_interval_ms: 100,
        }
    }
}

/// The geometry fingerprint stored in the `magic` file; a mismatch means
/// the directory was written by an incompatible build.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct ConfigState {
    max_database_size: u64,
    max_threads: u32,
    cacheline_size: u32,
    segment_size: u64,
}

fn magic_for(config: &Config) -> u32 {
    let state = ConfigState {
        max_database_size: config.max_database_size,
        max_threads: MAX_THREADS,
        cacheline_size: CACHELINE_SIZE as u32,
        segment_size: SEGMENT_SIZE,
    };
    xxhash_rust::xxh32::xxh32(bytemuck::bytes_of(&state), 0)
}

/// The concrete layout of a node, exposed for introspection and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Binary,
    Setlist,
    Full,
    Value,
}

/// A value read out of the tree.
#[derive(Debug)]
pub enum Value {
    Bytes(Vec<u8>),
    Subtree(NodeHandle),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Subtree(_) => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Subtree(_) => None,
        }
    }
}

impl PartialEq<&[u8]> for Value {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_bytes() == Some(other)
    }
}

/// An owned reference to a node (tree or subtree root). Dropping the
/// handle queues the reference for background release.
pub struct NodeHandle {
    engine: Arc<EngineInner>,
    addr: PtrAddress,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("addr", &self.addr).finish()
    }
}

impl NodeHandle {
    pub(crate) fn new(engine: Arc<EngineInner>, addr: PtrAddress) -> Self {
        Self { engine, addr }
    }

    pub(crate) fn address(&self) -> PtrAddress {
        self.addr
    }
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        let cb = self.engine.alloc.ctrl.get(self.addr);
        while !cb.retain() {
            std::hint::spin_loop();
        }
        Self {
            engine: self.engine.clone(),
            addr: self.addr,
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.engine.alloc.deferred_release(self.addr);
    }
}

pub(crate) struct EngineInner {
    pub(crate) alloc: Arc<Allocator>,
    pub(crate) roots: RootTable,
    #[allow(dead_code)]
    lock_file: std::fs::File,
    dir: PathBuf,
    close_once: Once,
    crashed: std::sync::atomic::AtomicBool,
}

impl EngineInner {
    fn close(&self) {
        self.close_once.call_once(|| {
            self.alloc.stop_threads();
            if self.crashed.load(Ordering::Relaxed) {
                log::warn!("database at {} dropped without clean close", self.dir.display());
                return;
            }
            // The background releaser is gone; drain what it left behind.
            while let Some(raw) = self.alloc.state().release_queue.pop() {
                self.alloc.release_address(PtrAddress::new(raw as u32));
            }
            let _ = self.roots.sync(SyncLevel::Fsync);
            let _ = self.alloc.block.fsync(false);
            self.alloc.mark_clean_exit();
            log::debug!("database at {} closed cleanly", self.dir.display());
        });
    }
}

/// An open database directory.
pub struct Database {
    inner: Arc<EngineInner>,
}

impl Database {
    /// Create a fresh database directory (or open an empty one).
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Database> {
        Self::open(path, &Config::default())
    }

    /// Open (creating as needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Database> {
        use fs4::fs_std::FileExt;

        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(Error::Open)?;

        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("lock"))
            .map_err(Error::Open)?;
        lock_file.try_lock_exclusive().map_err(Error::Lock)?;

        check_magic(&dir, config)?;

        let alloc = Allocator::open(&dir, config.clone())?;
        let roots = RootTable::open(&dir)?;

        if alloc.state_was_clean() {
            alloc.init_state(true);
            alloc
                .ctrl
                .set_alloc_seq(alloc.state().saved_alloc_seq.load(Ordering::Relaxed));
            log::debug!("clean reopen of {}", dir.display());
        } else {
            alloc.init_state(false);
            recover::recover(&alloc, &roots)?;
        }
        alloc.start_threads();

        Ok(Database {
            inner: Arc::new(EngineInner {
                alloc,
                roots,
                lock_file,
                dir,
                close_once: Once::new(),
                crashed: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }

    /// Open a new session for this thread.
    pub fn start_session(&self) -> Result<Session> {
        Session::new(self.inner.clone())
    }

    /// Flush the whole engine at the chosen durability level.
    pub fn sync(&self, level: SyncLevel) -> Result<()> {
        if level >= SyncLevel::MsyncAsync {
            let len = self.inner.alloc.block.num_blocks() * SEGMENT_SIZE;
            if len > 0 {
                self.inner
                    .alloc
                    .block
                    .msync(0, len, level >= SyncLevel::MsyncSync)?;
            }
        }
        if level >= SyncLevel::Fsync {
            self.inner.alloc.block.fsync(level >= SyncLevel::Full)?;
        }
        self.inner.roots.sync(level)
    }

    /// Stop background threads and mark a clean shutdown. Called
    /// automatically on drop; sessions must be closed first.
    pub fn close(self) {
        self.inner.close();
    }

    /// Tear down without marking a clean exit, so the next open must run
    /// crash recovery. For crash-consistency testing.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.inner.crashed.store(true, Ordering::Relaxed);
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn check_magic(dir: &Path, config: &Config) -> Result<()> {
    let expected = magic_for(config);
    let path = dir.join("magic");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let found = u32::from_le_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corruption("magic file has the wrong size"))?,
            );
            if found != expected {
                return Err(Error::MagicMismatch { found, expected });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&path, expected.to_le_bytes()).map_err(Error::Open)?;
            Ok(())
        }
        Err(e) => Err(Error::Open(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_tracks_geometry() {
        let a = magic_for(&Config::default());
        let mut cfg = Config::default();
        cfg.max_database_size = 128 << 30;
        let b = magic_for(&cfg);
        assert_ne!(a, b, "different reservations must not share a magic");
        assert_eq!(a, magic_for(&Config::default()));
    }

    #[test]
    fn sync_levels_are_ordered() {
        assert!(SyncLevel::None < SyncLevel::Mprotect);
        assert!(SyncLevel::Mprotect < SyncLevel::MsyncAsync);
        assert!(SyncLevel::MsyncSync < SyncLevel::Fsync);
        assert!(SyncLevel::Fsync < SyncLevel::Full);
    }
}
