//! The root object table: 1024 atomic address slots anchoring the
//! reachability graph, backed by their own memory-mapped file.
//!
//! Slots are the only globally visible mutable references in the system.
//! Each slot has a reader-writer lock for plain get/set and a separate
//! writer mutex so at most one transaction per slot is in flight.

use std::{
    fs::File,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, RwLock,
    },
};

use bytemuck::{Pod, Zeroable};
use memmap2::{MmapOptions, MmapRaw};

use crate::{control::PtrAddress, Error, Result, SyncLevel, NUM_TOP_ROOTS};

const PREAMBLE_SIZE: usize = 64;
const FILE_TYPE: [u8; 8] = *b"artdroot";
const ROOT_FILE_SIZE: usize = PREAMBLE_SIZE + NUM_TOP_ROOTS * 4;

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct RootPreamble {
    file_type: [u8; 8],
    version: u16,
    _reserved0: u16,
    _reserved1: u32,
    /// xxh3 over the fields above.
    checksum: u64,
    _reserved2: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<RootPreamble>() == PREAMBLE_SIZE);

impl RootPreamble {
    fn new() -> Self {
        let mut p = Self {
            file_type: FILE_TYPE,
            version: 1,
            _reserved0: 0,
            _reserved1: 0,
            checksum: 0,
            _reserved2: [0; 40],
        };
        p.checksum = p.calculate_checksum();
        p
    }

    fn calculate_checksum(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&bytemuck::bytes_of(self)[..16])
    }
}

pub struct RootTable {
    map: MmapRaw,
    file: File,
    slot_locks: Box<[RwLock<()>]>,
    txn_locks: Box<[Mutex<()>]>,
}

/// An in-flight multi-op transaction on one root slot. Holds the slot's
/// writer mutex until committed or aborted (dropping aborts).
pub struct RootTransaction<'a> {
    table: &'a RootTable,
    index: usize,
    /// The root value at transaction start; ownership of one reference
    /// passes to the caller.
    pub start: PtrAddress,
    _guard: MutexGuard<'a, ()>,
}

impl RootTransaction<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Install `new` and release the writer mutex. Returns the prior
    /// value; the caller owns its table reference now.
    pub fn commit(self, new: PtrAddress, level: SyncLevel) -> Result<PtrAddress> {
        let _slot = self.table.slot_locks[self.index].write().unwrap();
        let prior = PtrAddress::new(self.table.slot(self.index).swap(new.raw(), Ordering::AcqRel));
        self.table.sync(level)?;
        Ok(prior)
    }

    /// Drop the writer mutex without changing the slot.
    pub fn abort(self) {}
}

impl RootTable {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("root_objects");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::Open)?;
        let len = file.metadata().map_err(Error::Open)?.len();
        let fresh = len == 0;
        if fresh {
            file.set_len(ROOT_FILE_SIZE as u64)
                .map_err(|e| Error::ResizeFailed {
                    size: 0,
                    requested: ROOT_FILE_SIZE as u64,
                    source: e,
                })?;
        } else if len != ROOT_FILE_SIZE as u64 {
            return Err(Error::Corruption("root object file has the wrong size"));
        }
        let map = MmapOptions::new()
            .len(ROOT_FILE_SIZE)
            .map_raw(&file)
            .map_err(|e| Error::MapFailed {
                requested: ROOT_FILE_SIZE,
                source: e,
            })?;

        let table = Self {
            map,
            file,
            slot_locks: (0..NUM_TOP_ROOTS).map(|_| RwLock::new(())).collect(),
            txn_locks: (0..NUM_TOP_ROOTS).map(|_| Mutex::new(())).collect(),
        };
        if fresh {
            let preamble = RootPreamble::new();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytemuck::bytes_of(&preamble).as_ptr(),
                    table.map.as_mut_ptr(),
                    PREAMBLE_SIZE,
                );
            }
            table.sync(SyncLevel::Fsync)?;
        } else {
            let preamble: RootPreamble = unsafe {
                std::ptr::read_unaligned(table.map.as_ptr() as *const RootPreamble)
            };
            if preamble.file_type != FILE_TYPE || preamble.version != 1 {
                return Err(Error::Corruption("unrecognized root object file header"));
            }
            if preamble.checksum != preamble.calculate_checksum() {
                return Err(Error::Corruption("root object file preamble checksum mismatch"));
            }
        }
        Ok(table)
    }

    fn slot(&self, i: usize) -> &AtomicU32 {
        assert!(i < NUM_TOP_ROOTS, "root index out of range");
        unsafe { &*(self.map.as_ptr().add(PREAMBLE_SIZE) as *const AtomicU32).add(i) }
    }

    /// Current value of slot `i`, no reference taken.
    pub fn load(&self, i: usize) -> PtrAddress {
        let _lock = self.slot_locks[i].read().unwrap();
        PtrAddress::new(self.slot(i).load(Ordering::Acquire))
    }

    /// Load slot `i` and take a reference on the target before the slot
    /// lock drops, so the tree can't die under the caller.
    pub fn get(&self, i: usize, retain: impl Fn(PtrAddress) -> bool) -> PtrAddress {
        let _lock = self.slot_locks[i].read().unwrap();
        let addr = PtrAddress::new(self.slot(i).load(Ordering::Acquire));
        if addr.is_null() {
            return addr;
        }
        // Retain can only fail at saturation; spin, it is transient.
        while !retain(addr) {
            std::hint::spin_loop();
        }
        addr
    }

    /// Exchange slot `i`. The caller must already own a reference on
    /// `new` (it transfers to the table) and becomes owner of the
    /// returned prior value's reference.
    pub fn set(&self, i: usize, new: PtrAddress, level: SyncLevel) -> Result<PtrAddress> {
        let _lock = self.slot_locks[i].write().unwrap();
        let prior = PtrAddress::new(self.slot(i).swap(new.raw(), Ordering::AcqRel));
        self.sync(level)?;
        Ok(prior)
    }

    /// Compare-and-swap slot `i`; syncs on success. On failure returns
    /// the value actually found.
    pub fn cas(
        &self,
        i: usize,
        expect: PtrAddress,
        desire: PtrAddress,
        level: SyncLevel,
    ) -> Result<std::result::Result<(), PtrAddress>> {
        let _lock = self.slot_locks[i].write().unwrap();
        match self.slot(i).compare_exchange(
            expect.raw(),
            desire.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.sync(level)?;
                Ok(Ok(()))
            }
            Err(found) => Ok(Err(PtrAddress::new(found))),
        }
    }

    /// Hold the per-slot writer mutex for the duration of a mutation, so
    /// at most one writer rewrites paths under slot `i` at a time.
    pub(crate) fn writer_lock(&self, i: usize) -> MutexGuard<'_, ()> {
        assert!(i < NUM_TOP_ROOTS, "root index out of range");
        self.txn_locks[i].lock().unwrap()
    }

    /// Begin a transaction on slot `i`: take the per-slot writer mutex
    /// and return the current value (caller must retain it).
    pub fn start_transaction(
        &self,
        i: usize,
        retain: impl Fn(PtrAddress) -> bool,
    ) -> RootTransaction<'_> {
        assert!(i < NUM_TOP_ROOTS, "root index out of range");
        let guard = self.txn_locks[i].lock().unwrap();
        let start = self.get(i, retain);
        RootTransaction {
            table: self,
            index: i,
            start,
            _guard: guard,
        }
    }

    /// Flush the root file at the requested durability level.
    pub fn sync(&self, level: SyncLevel) -> Result<()> {
        match level {
            SyncLevel::None | SyncLevel::Mprotect => Ok(()),
            SyncLevel::MsyncAsync => self.map.flush_async().map_err(Error::Sync),
            SyncLevel::MsyncSync => self.map.flush().map_err(Error::Sync),
            SyncLevel::Fsync | SyncLevel::Full => {
                self.map.flush().map_err(Error::Sync)?;
                #[cfg(target_os = "macos")]
                if level == SyncLevel::Full {
                    use std::os::fd::AsRawFd;
                    let r = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_FULLFSYNC) };
                    if r == -1 {
                        return Err(Error::Sync(std::io::Error::last_os_error()));
                    }
                    return Ok(());
                }
                self.file.sync_data().map_err(Error::Sync)
            }
        }
    }

    /// Recovery: walk the non-null roots.
    pub fn for_each_root(&self, mut f: impl FnMut(usize, PtrAddress)) {
        for i in 0..NUM_TOP_ROOTS {
            let addr = PtrAddress::new(self.slot(i).load(Ordering::Acquire));
            if !addr.is_null() {
                f(i, addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_table(name: &str) -> (std::path::PathBuf, RootTable) {
        let mut path = std::env::temp_dir();
        path.push(format!("artdb-roots-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        let table = RootTable::open(&path).unwrap();
        (path, table)
    }

    #[test]
    fn set_get_cas_roundtrip() {
        let (_path, table) = temp_table("basic");
        assert!(table.load(3).is_null());
        let prior = table.set(3, PtrAddress::new(77), SyncLevel::None).unwrap();
        assert!(prior.is_null());
        assert_eq!(table.get(3, |_| true), PtrAddress::new(77));
        let r = table
            .cas(3, PtrAddress::new(77), PtrAddress::new(88), SyncLevel::None)
            .unwrap();
        assert!(r.is_ok());
        let r = table
            .cas(3, PtrAddress::new(77), PtrAddress::new(99), SyncLevel::None)
            .unwrap();
        assert_eq!(r, Err(PtrAddress::new(88)));
    }

    #[test]
    fn reopen_preserves_roots() {
        let (path, table) = temp_table("reopen");
        table.set(0, PtrAddress::new(41), SyncLevel::Fsync).unwrap();
        drop(table);
        let table = RootTable::open(&path).unwrap();
        assert_eq!(table.load(0), PtrAddress::new(41));
    }

    #[test]
    fn transaction_excludes_other_transactions() {
        let (_path, table) = temp_table("txn");
        table.set(5, PtrAddress::new(10), SyncLevel::None).unwrap();
        let txn = table.start_transaction(5, |_| true);
        assert_eq!(txn.start, PtrAddress::new(10));
        // Plain reads still work while the writer mutex is held.
        assert_eq!(table.load(5), PtrAddress::new(10));
        let prior = txn.commit(PtrAddress::new(20), SyncLevel::None).unwrap();
        assert_eq!(prior, PtrAddress::new(10));
        let txn = table.start_transaction(5, |_| true);
        txn.abort();
        assert_eq!(table.load(5), PtrAddress::new(20));
    }
}
