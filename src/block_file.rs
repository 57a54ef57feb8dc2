//! The backing heap file: one contiguous memory mapping, grown in
//! fixed-size blocks.
//!
//! The whole `max_database_size` range is mapped once at open, so every
//! heap location is a plain offset from a single base pointer for the life
//! of the process. The file underneath is extended with `ftruncate` as
//! blocks are claimed; pages past the file's end are never touched.

use std::{
    fs::File,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

pub struct BlockFile {
    map: MmapRaw,
    file: File,
    block_size: u64,
    /// Total virtual reservation in bytes; the hard size cap.
    reserved: u64,
    /// Next block index to hand out. Only grows.
    next_block: AtomicU64,
    /// Number of blocks currently backed by file storage.
    backed: AtomicU64,
    resize: Mutex<()>,
}

// The mapping is shared memory; all mutation goes through raw pointers
// handed out by `block_slice`, synchronized by the segment ownership rules.
unsafe impl Send for BlockFile {}
unsafe impl Sync for BlockFile {}

impl BlockFile {
    /// Map `file` with a fixed `reserved`-byte virtual range. The current
    /// file length must be a multiple of `block_size`.
    pub fn open(file: File, block_size: u64, reserved: u64) -> Result<Self> {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");
        assert_eq!(reserved % block_size, 0);

        let file_len = file.metadata().map_err(Error::Open)?.len();
        if file_len % block_size != 0 || file_len > reserved {
            return Err(Error::Corruption("block file length is not a whole number of blocks"));
        }
        let map = MmapOptions::new()
            .len(reserved as usize)
            .map_raw(&file)
            .map_err(|e| Error::MapFailed {
                requested: reserved as usize,
                source: e,
            })?;
        let blocks = file_len / block_size;
        Ok(Self {
            map,
            file,
            block_size,
            reserved,
            next_block: AtomicU64::new(blocks),
            backed: AtomicU64::new(blocks),
            resize: Mutex::new(()),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Blocks handed out so far.
    pub fn num_blocks(&self) -> u64 {
        self.next_block.load(Ordering::Acquire)
    }

    pub fn max_blocks(&self) -> u64 {
        self.reserved / self.block_size
    }

    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Claim the next block index, extending the file if needed.
    ///
    /// Claiming an already-backed index is lock-free; extension takes the
    /// resize mutex. On extension failure the claim is rolled back.
    pub fn alloc(&self) -> Result<u64> {
        let block = self.next_block.fetch_add(1, Ordering::AcqRel);
        if block >= self.max_blocks() {
            self.rollback_claim(block);
            return Err(Error::OutOfSegments { cap: self.reserved });
        }
        if block >= self.backed.load(Ordering::Acquire) {
            if let Err(e) = self.extend_to(block + 1) {
                self.rollback_claim(block);
                return Err(e);
            }
        }
        Ok(block)
    }

    fn rollback_claim(&self, block: u64) {
        // Best effort: only unwinds if no later claim raced past us.
        let _ = self.next_block.compare_exchange(
            block + 1,
            block,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Ensure at least `blocks` blocks are backed by file storage.
    pub fn reserve(&self, blocks: u64) -> Result<()> {
        if blocks > self.max_blocks() {
            return Err(Error::OutOfSegments { cap: self.reserved });
        }
        if blocks > self.backed.load(Ordering::Acquire) {
            self.extend_to(blocks)?;
        }
        let mut next = self.next_block.load(Ordering::Acquire);
        while next < blocks {
            match self.next_block.compare_exchange(next, blocks, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(n) => next = n,
            }
        }
        Ok(())
    }

    fn extend_to(&self, blocks: u64) -> Result<()> {
        let _guard = self.resize.lock().unwrap();
        let backed = self.backed.load(Ordering::Acquire);
        if blocks <= backed {
            return Ok(());
        }
        let old_len = backed * self.block_size;
        let new_len = blocks * self.block_size;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::ResizeFailed {
                size: old_len,
                requested: new_len,
                source: e,
            })?;
        self.protect(old_len, new_len - old_len, libc::PROT_READ | libc::PROT_WRITE)?;
        self.backed.store(blocks, Ordering::Release);
        Ok(())
    }

    /// Shrink to `blocks` blocks. The released tail keeps its virtual
    /// reservation but becomes inaccessible.
    pub fn truncate(&self, blocks: u64) -> Result<()> {
        let _guard = self.resize.lock().unwrap();
        let backed = self.backed.load(Ordering::Acquire);
        if blocks >= backed {
            return Ok(());
        }
        let new_len = blocks * self.block_size;
        self.file
            .set_len(new_len)
            .map_err(|e| Error::ResizeFailed {
                size: backed * self.block_size,
                requested: new_len,
                source: e,
            })?;
        self.protect(new_len, (backed - blocks) * self.block_size, libc::PROT_NONE)?;
        self.backed.store(blocks, Ordering::Release);
        self.next_block.store(blocks, Ordering::Release);
        Ok(())
    }

    /// Raw block memory with an unbounded lifetime.
    ///
    /// # Safety
    ///
    /// The caller must ensure the slice doesn't outlive this `BlockFile`,
    /// that `block` has been claimed, and that the segment ownership rules
    /// make the access race-free.
    pub unsafe fn block_slice(&self, block: u64) -> &'static mut [u8] {
        debug_assert!(block < self.num_blocks());
        std::slice::from_raw_parts_mut(
            self.base().add((block * self.block_size) as usize),
            self.block_size as usize,
        )
    }

    /// A pointer to an absolute byte offset in the heap.
    ///
    /// # Safety
    ///
    /// `offset` must lie within backed storage.
    pub unsafe fn offset_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.backed.load(Ordering::Acquire) * self.block_size);
        self.base().add(offset as usize)
    }

    fn protect(&self, offset: u64, len: u64, prot: libc::c_int) -> Result<()> {
        let r = unsafe { libc::mprotect(self.base().add(offset as usize).cast(), len as usize, prot) };
        if r != 0 {
            return Err(Error::MemControl {
                call: "mprotect",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Write-protect a committed range.
    pub fn protect_read(&self, offset: u64, len: u64) -> Result<()> {
        self.protect(offset, len, libc::PROT_READ)
    }

    /// Re-enable writes on a range (segment reuse).
    pub fn protect_rw(&self, offset: u64, len: u64) -> Result<()> {
        self.protect(offset, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Flush a range of the mapping to the file, blocking when `sync`
    /// is true.
    pub fn msync(&self, offset: u64, len: u64, sync: bool) -> Result<()> {
        if sync {
            self.map
                .flush_range(offset as usize, len as usize)
                .map_err(Error::Sync)
        } else {
            self.map
                .flush_async_range(offset as usize, len as usize)
                .map_err(Error::Sync)
        }
    }

    /// Pin a range in RAM.
    pub fn mlock(&self, offset: u64, len: u64) -> Result<()> {
        let r = unsafe { libc::mlock(self.base().add(offset as usize).cast(), len as usize) };
        if r != 0 {
            return Err(Error::MemControl {
                call: "mlock",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn munlock(&self, offset: u64, len: u64) -> Result<()> {
        let r = unsafe { libc::munlock(self.base().add(offset as usize).cast(), len as usize) };
        if r != 0 {
            return Err(Error::MemControl {
                call: "munlock",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Flush file data to stable storage. With `full` on macOS this issues
    /// `F_FULLFSYNC` so the drive cache is flushed too.
    pub fn fsync(&self, full: bool) -> Result<()> {
        #[cfg(target_os = "macos")]
        if full {
            use std::os::fd::AsRawFd;
            let r = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_FULLFSYNC) };
            if r == -1 {
                return Err(Error::Sync(std::io::Error::last_os_error()));
            }
            return Ok(());
        }
        let _ = full;
        self.file.sync_data().map_err(Error::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> File {
        let mut path = std::env::temp_dir();
        path.push(format!("artdb-blockfile-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&path);
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn alloc_grows_and_is_contiguous() {
        const BS: u64 = 1 << 16;
        let bf = BlockFile::open(temp_file("grow"), BS, BS * 16).unwrap();
        assert_eq!(bf.num_blocks(), 0);
        let b0 = bf.alloc().unwrap();
        let b1 = bf.alloc().unwrap();
        assert_eq!((b0, b1), (0, 1));
        unsafe {
            bf.block_slice(b0)[0] = 0xAA;
            bf.block_slice(b1)[0] = 0xBB;
            // Contiguity: block 1 starts exactly one block after block 0.
            assert_eq!(*bf.offset_ptr(BS), 0xBB);
        }
        bf.fsync(false).unwrap();
    }

    #[test]
    fn alloc_respects_reservation_cap() {
        const BS: u64 = 1 << 16;
        let bf = BlockFile::open(temp_file("cap"), BS, BS * 2).unwrap();
        bf.alloc().unwrap();
        bf.alloc().unwrap();
        assert!(matches!(bf.alloc(), Err(Error::OutOfSegments { .. })));
        // The failed claim must roll back so a truncate+retry could succeed.
        assert_eq!(bf.num_blocks(), 2);
    }

    #[test]
    fn truncate_then_realloc() {
        const BS: u64 = 1 << 16;
        let bf = BlockFile::open(temp_file("trunc"), BS, BS * 8).unwrap();
        for _ in 0..4 {
            bf.alloc().unwrap();
        }
        bf.truncate(1).unwrap();
        assert_eq!(bf.num_blocks(), 1);
        let b = bf.alloc().unwrap();
        assert_eq!(b, 1);
        unsafe { bf.block_slice(b)[10] = 7 };
    }
}
