//! Per-thread writer/reader context.
//!
//! A session owns one of 64 slots, its own writable segment, and the
//! nested wait-free read lock that keeps the compactor from recycling
//! memory the session may still be dereferencing.

use std::{
    cell::{Cell, RefCell},
    sync::{atomic::Ordering, Arc},
};

use crate::{
    allocator::{ObjectAlloc, SegWriter},
    control::{ControlBlock, Location, PtrAddress},
    header::AllocHeader,
    segment::SegmentView,
    EngineInner, Result, SyncLevel, MAX_CACHEABLE_OBJECT_SIZE, SEGMENT_SIZE,
};

/// A writer/reader context bound to one session slot.
///
/// Sessions are single-threaded by construction (`Cell`/`RefCell`
/// interior state); create one per thread with
/// [`crate::Database::start_session`].
pub struct Session {
    pub(crate) engine: Arc<EngineInner>,
    slot: u32,
    nested_rlock: Cell<u32>,
    pub(crate) writer: RefCell<Option<SegWriter>>,
    seg_seq: Cell<u64>,
    rng: Cell<u64>,
}

/// Scoped read lock. The outermost guard publishes the session's R*;
/// nested acquisitions only bump a counter.
pub struct ReadGuard<'a> {
    session: &'a Session,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let n = self.session.nested_rlock.get();
        self.session.nested_rlock.set(n - 1);
        if n == 1 {
            self.session.engine.alloc.rlock_exit(self.session.slot);
        }
    }
}

impl Session {
    pub(crate) fn new(engine: Arc<EngineInner>) -> Result<Self> {
        let slot = engine.alloc.claim_session_slot()?;
        Ok(Self {
            engine,
            slot,
            nested_rlock: Cell::new(0),
            writer: RefCell::new(None),
            seg_seq: Cell::new(0),
            rng: Cell::new(0xABBA_7777 ^ ((slot as u64) << 32) | 1),
        })
    }

    /// Enter the read-side protocol for the duration of the guard.
    pub(crate) fn read_lock(&self) -> ReadGuard<'_> {
        let n = self.nested_rlock.get();
        self.nested_rlock.set(n + 1);
        if n == 0 {
            self.engine.alloc.rlock_enter(self.slot);
        }
        ReadGuard { session: self }
    }

    fn rng_next(&self) -> u64 {
        let mut x = self.rng.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Dereference a live address to its object header.
    ///
    /// Must be called with a [`ReadGuard`] held; the reference is only
    /// good for the guard's lifetime.
    pub(crate) fn deref(&self, addr: PtrAddress) -> &AllocHeader {
        debug_assert!(self.nested_rlock.get() > 0, "deref outside read lock");
        let cb = self.engine.alloc.ctrl.get(addr);
        let loc = cb.loc();
        let header = unsafe { self.engine.alloc.object_at(loc) };
        self.try_cache(cb, header.size());
        header
    }

    /// Sampled read-promotion: climb the control block's activity ladder
    /// when the PRNG beats the difficulty threshold. Small objects only;
    /// promoting big ones would evict too much hot data for one
    /// cacheline-bounce of gain.
    fn try_cache(&self, cb: &ControlBlock, size: u32) {
        if !self.engine.alloc.config.enable_read_cache
            || size as usize > MAX_CACHEABLE_OBJECT_SIZE
        {
            return;
        }
        let difficulty = self
            .engine
            .alloc
            .state()
            .cache_difficulty
            .load(Ordering::Relaxed);
        if (self.rng_next() as u32) >= difficulty {
            cb.try_inc_activity();
        }
    }

    pub(crate) fn retain(&self, addr: PtrAddress) -> bool {
        self.engine.alloc.ctrl.get(addr).retain()
    }

    /// Drop a reference, cascading destruction on the last one. Callable
    /// with or without an active read lock.
    pub(crate) fn release(&self, addr: PtrAddress) {
        if addr.is_null() {
            return;
        }
        let _lock = self.read_lock();
        self.engine.alloc.release_address(addr);
    }

    /// Allocate an unpublished object in this session's segment.
    pub(crate) fn alloc_object(
        &self,
        size: usize,
        type_tag: u8,
        hint: &[PtrAddress],
    ) -> Result<ObjectAlloc<'_>> {
        let mut writer = self.writer.borrow_mut();
        let mut seq = self.seg_seq.get();
        let out = self.engine.alloc.alloc_object(
            &mut writer,
            self.slot,
            &mut seq,
            false,
            size,
            type_tag,
            hint,
        );
        self.seg_seq.set(seq);
        out
    }

    /// Claim raw append space (no address) in this session's segment;
    /// used when a copy keeps an identity allocated elsewhere.
    pub(crate) fn alloc_space_raw(&self, size: usize) -> Result<(SegmentView, u64, u32, u32)> {
        let mut writer = self.writer.borrow_mut();
        let mut seq = self.seg_seq.get();
        let out = self.engine.alloc.alloc_space(
            &mut writer,
            self.slot,
            &mut seq,
            false,
            size,
            crate::now_ms(),
        );
        self.seg_seq.set(seq);
        out
    }

    /// Whether `loc` may be mutated in place: it must sit in this
    /// session's current writable segment, on a page the commit fence
    /// hasn't frozen.
    pub(crate) fn can_modify(&self, loc: Location) -> bool {
        let writer = self.writer.borrow();
        let Some(w) = writer.as_ref() else {
            return false;
        };
        let seg = loc.segment(SEGMENT_SIZE);
        if seg != w.seg {
            return false;
        }
        w.view.can_modify(
            loc.segment_offset(SEGMENT_SIZE) as u32,
            self.engine.alloc.page_size,
        )
    }

    /// Commit this session's writable segment at the given level. At
    /// `SyncLevel::None` there is no durability boundary to record, so
    /// this is a no-op unless commits write-protect.
    pub fn commit(&self, level: SyncLevel) -> Result<()> {
        if level == SyncLevel::None && !self.engine.alloc.config.write_protect_on_commit {
            return Ok(());
        }
        let mut writer = self.writer.borrow_mut();
        if let Some(w) = writer.as_mut() {
            w.last_commit_end =
                self.engine
                    .alloc
                    .commit_segment(&w.view, w.seg, w.last_commit_end, level, false)?;
        }
        Ok(())
    }

    /// Finalize the current writable segment immediately, making it a
    /// compaction candidate. Mainly for tests that need read-only
    /// segments without filling 32 MiB first.
    #[doc(hidden)]
    pub fn seal_segment(&self) -> Result<()> {
        if let Some(w) = self.writer.borrow_mut().take() {
            self.engine
                .alloc
                .finalize_segment(w, self.engine.alloc.config.sync_mode)?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(w) = self.writer.borrow_mut().take() {
            if let Err(e) = self
                .engine
                .alloc
                .finalize_segment(w, self.engine.alloc.config.sync_mode)
            {
                log::warn!("failed to finalize segment on session close: {e}");
            }
        }
        self.engine.alloc.release_session_slot(self.slot);
    }
}
