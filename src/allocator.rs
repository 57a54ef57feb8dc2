//! The segment allocator: owns the block file, the control-block table,
//! and the mapped allocator-state file; runs the provider, compactor and
//! read-bit-decay background threads.
//!
//! Nothing in `allocator_state` is durable — every field is rebuilt from
//! the block file on crash recovery. The file exists so that multiple
//! processes can share heartbeat/session bookkeeping and so a clean
//! shutdown can skip the recovery scan.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{debug, error, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::{
    bitmap::{HierarchicalBitmap, INVALID_INDEX},
    block_file::BlockFile,
    control::{ControlTable, Location, PtrAddress, PtrAddressSeq},
    header::{round_up_cacheline, AllocHeader, SyncHeader, TYPE_SYNC},
    now_ms,
    ring::{PairRing, Ring},
    segment::{
        SegmentHeader, SegmentMeta, SegmentView, VageAccumulator, SEGMENT_DATA_END,
        SEGMENT_DATA_START,
    },
    vtables, Config, Error, Result, SyncLevel, MAX_SEGMENT_COUNT, MAX_SESSIONS, SEGMENT_SIZE,
};

/// Per-session read-lock slot, one cacheline each.
///
/// `R*` semantics: `u64::MAX` while the session holds no read lock, the
/// end-pointer value observed at lock entry while it does. The compactor
/// may recycle a pending segment only once every slot has advanced past
/// the segment's enqueue key.
#[repr(C, align(64))]
pub struct SessionRlock {
    pub lock_ptr: AtomicU64,
    _pad: [u8; 56],
}

/// State record for one background thread, shared across processes.
#[repr(C, align(64))]
pub struct ThreadState {
    pub pid: AtomicU32,
    pub running: AtomicU32,
    pub stop: AtomicU32,
    _pad: u32,
    pub start_time_ms: AtomicU64,
    pub last_heartbeat_ms: AtomicU64,
    _pad2: [u8; 32],
}

pub const THREAD_PROVIDER: usize = 0;
pub const THREAD_COMPACTOR: usize = 1;
pub const THREAD_DECAY: usize = 2;
const THREAD_NAMES: [&str; 3] = ["provider", "compactor", "read-bit-decay"];

/// How long a heartbeat may stall before a successor process takes over.
const TAKEOVER_INTERVAL_MS: u64 = 5_000;

const READY_QUEUE_LEN: usize = 64;
const PENDING_QUEUE_LEN: usize = 4096;
const RELEASE_QUEUE_LEN: usize = 4096;

/// Steady-state ready-queue stock kept by the provider.
const PINNED_STOCK: usize = 2;
const UNPINNED_STOCK: usize = 4;

const STATE_MAGIC: u32 = 0x4152_5453; // "ARTS"

/// The mapped layout of `allocator_state`.
#[repr(C)]
pub struct AllocatorState {
    magic: u32,
    pub clean_exit: AtomicU32,
    /// Control-table allocation sequence, saved on clean close.
    pub saved_alloc_seq: AtomicU32,
    _pad: u32,
    /// End pointer E: count of segments enqueued for eventual recycling.
    pub end_ptr: AtomicU64,
    pub next_provider_seq: AtomicU64,
    /// Bitmap of claimed session slots.
    pub session_slots: AtomicU64,
    /// Threshold a session's PRNG sample must beat to promote on read.
    pub cache_difficulty: AtomicU32,
    /// Currently mlocked segments.
    pub pinned_segments: AtomicU32,
    pub session_rlocks: [SessionRlock; MAX_SESSIONS],
    pub threads: [ThreadState; 3],
    pub segment_meta: [SegmentMeta; MAX_SEGMENT_COUNT as usize],
    pub pinned_queue: Ring<READY_QUEUE_LEN>,
    pub unpinned_queue: Ring<READY_QUEUE_LEN>,
    /// (segment, enqueue-time E) pairs waiting out the read locks.
    pub pending_queue: PairRing<PENDING_QUEUE_LEN>,
    /// Deferred address releases from dropped handles.
    pub release_queue: Ring<RELEASE_QUEUE_LEN>,
}

/// A session's (or the compactor's) current writable segment.
pub struct SegWriter {
    pub seg: u64,
    pub view: SegmentView,
    pub vage: VageAccumulator,
    /// This owner's running count of segments it has filled.
    pub seg_sequence: u64,
    /// Segment offset of the last header written, for the commit chain.
    pub last_commit_end: u32,
}

/// A freshly allocated, not-yet-published object.
pub struct ObjectAlloc<'a> {
    pub seq: PtrAddressSeq,
    pub loc: Location,
    pub view: SegmentView,
    pub pos: u32,
    pub size: u32,
    pub alloc: &'a Allocator,
}

impl ObjectAlloc<'_> {
    /// The object bytes, header included.
    pub fn bytes(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.view.at(self.pos), self.size as usize) }
    }

    /// Make the address live: store the location with release ordering so
    /// readers that find it see the constructed bytes.
    pub fn publish(self) {
        self.alloc.ctrl.get(self.seq.address).publish(self.loc, 1);
    }
}

pub struct Allocator {
    pub block: BlockFile,
    pub ctrl: ControlTable,
    state_map: MmapRaw,
    #[allow(dead_code)]
    state_file: std::fs::File,
    pub config: Config,
    pub page_size: u32,
    pub pages_per_segment: u32,
    /// Free-segment tracking; provider-owned, rebuilt at open.
    free_segments: Mutex<HierarchicalBitmap>,
    stop_all: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Cursor for the decay thread's stride over the control table.
    decay_cursor: AtomicU64,
}

impl Allocator {
    pub fn open(dir: &Path, config: Config) -> Result<Arc<Self>> {
        let page_size = page_size::get() as u32;
        assert!(page_size.is_power_of_two());
        let pages_per_segment = SEGMENT_SIZE as u32 / page_size;

        let block_path = dir.join("block_file");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(block_path)
            .map_err(Error::Open)?;
        let block = BlockFile::open(file, SEGMENT_SIZE, config.max_database_size)?;
        let ctrl = ControlTable::open(dir)?;

        let state_len = std::mem::size_of::<AllocatorState>();
        let state_path = dir.join("allocator_state");
        let state_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(state_path)
            .map_err(Error::Open)?;
        let existing = state_file.metadata().map_err(Error::Open)?.len();
        if existing != state_len as u64 {
            state_file
                .set_len(state_len as u64)
                .map_err(|e| Error::ResizeFailed {
                    size: existing,
                    requested: state_len as u64,
                    source: e,
                })?;
        }
        let state_map = MmapOptions::new()
            .len(state_len)
            .map_raw(&state_file)
            .map_err(|e| Error::MapFailed {
                requested: state_len,
                source: e,
            })?;

        let alloc = Arc::new(Self {
            block,
            ctrl,
            state_map,
            state_file,
            config,
            page_size,
            pages_per_segment,
            free_segments: Mutex::new(HierarchicalBitmap::new_all_clear(MAX_SEGMENT_COUNT as u32)),
            stop_all: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            decay_cursor: AtomicU64::new(0),
        });
        Ok(alloc)
    }

    pub fn state(&self) -> &AllocatorState {
        unsafe { &*(self.state_map.as_ptr() as *const AllocatorState) }
    }

    /// True when the previous run closed cleanly and the state file is
    /// from a matching build.
    pub fn state_was_clean(&self) -> bool {
        let s = self.state();
        s.magic == STATE_MAGIC && s.clean_exit.load(Ordering::Relaxed) == 1
    }

    /// Initialize the volatile parts of the state file for this run.
    /// `preserve_meta` keeps segment metadata from a clean prior run.
    pub fn init_state(&self, preserve_meta: bool) {
        let s = self.state();
        #[allow(invalid_reference_casting)]
        unsafe {
            let magic_ptr = &s.magic as *const u32 as *mut u32;
            *magic_ptr = STATE_MAGIC;
        }
        s.clean_exit.store(0, Ordering::Relaxed);
        s.session_slots.store(0, Ordering::Relaxed);
        // 1-in-16 promotion probability to start.
        s.cache_difficulty
            .store(u32::MAX - u32::MAX / 16, Ordering::Relaxed);
        s.pinned_segments.store(0, Ordering::Relaxed);
        for slot in s.session_rlocks.iter() {
            slot.lock_ptr.store(u64::MAX, Ordering::Relaxed);
        }
        for t in s.threads.iter() {
            t.stop.store(0, Ordering::Relaxed);
        }
        s.pinned_queue.init();
        s.unpinned_queue.init();
        s.pending_queue.init();
        s.release_queue.init();
        if !preserve_meta {
            s.end_ptr.store(0, Ordering::Relaxed);
            s.next_provider_seq.store(1, Ordering::Relaxed);
            for meta in s.segment_meta.iter() {
                meta.flags.store(0, Ordering::Relaxed);
                meta.freed_space.store(0, Ordering::Relaxed);
                meta.vage.store(0, Ordering::Relaxed);
            }
        } else {
            // Queue contents did not survive the restart; segments stuck
            // in transit states go back where their data dictates.
            use crate::segment::{SEG_ACTIVE, SEG_PENDING, SEG_QUEUED};
            let blocks = self.block.num_blocks();
            for seg in 0..blocks {
                let meta = &s.segment_meta[seg as usize];
                let flags = meta.flags.load(Ordering::Relaxed);
                if flags & (SEG_QUEUED | SEG_PENDING) != 0 {
                    meta.added_to_free_list();
                } else if flags & SEG_ACTIVE != 0 {
                    // A session died without finalizing; its data may be
                    // live, so keep the segment until compaction decides.
                    meta.prepare_for_compaction(meta.get_vage());
                }
            }
        }
        // Rebuild the free-segment bitmap from the metadata table.
        let mut free = self.free_segments.lock().unwrap();
        let blocks = self.block.num_blocks();
        for seg in 0..blocks {
            if s.segment_meta[seg as usize].is_free() {
                free.set(seg as u32);
            }
        }
    }

    pub fn seg_meta(&self, seg: u64) -> &SegmentMeta {
        &self.state().segment_meta[seg as usize]
    }

    /// Re-derive the free-segment bitmap from the metadata table
    /// (recovery, after the metadata pass).
    pub fn rebuild_free_bitmap(&self) {
        let mut free = self.free_segments.lock().unwrap();
        *free = HierarchicalBitmap::new_all_clear(MAX_SEGMENT_COUNT as u32);
        for seg in 0..self.block.num_blocks() {
            if self.seg_meta(seg).is_free() {
                free.set(seg as u32);
            }
        }
    }

    /// # Safety is internal: the segment number must have been claimed
    /// from the block file.
    pub fn segment_view(&self, seg: u64) -> SegmentView {
        unsafe { SegmentView::new(self.block.block_slice(seg).as_mut_ptr()) }
    }

    /// Dereference a heap location to its object header.
    ///
    /// # Safety
    ///
    /// The caller must hold a read lock covering this location, or
    /// otherwise own the object.
    pub unsafe fn object_at(&self, loc: Location) -> &AllocHeader {
        &*(self.block.offset_ptr(loc.offset()) as *const AllocHeader)
    }

    // ------------------------------------------------------------------
    // Session slots and read locks

    pub fn claim_session_slot(&self) -> Result<u32> {
        let slots = &self.state().session_slots;
        let mut current = slots.load(Ordering::Relaxed);
        loop {
            if current == u64::MAX {
                return Err(Error::OutOfSessions);
            }
            let free = (!current).trailing_zeros();
            match slots.compare_exchange_weak(
                current,
                current | (1 << free),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(free),
                Err(c) => current = c,
            }
        }
    }

    pub fn release_session_slot(&self, slot: u32) {
        self.state().session_rlocks[slot as usize]
            .lock_ptr
            .store(u64::MAX, Ordering::Release);
        self.state()
            .session_slots
            .fetch_and(!(1u64 << slot), Ordering::AcqRel);
    }

    pub fn rlock_enter(&self, slot: u32) {
        let e = self.state().end_ptr.load(Ordering::Relaxed);
        self.state().session_rlocks[slot as usize]
            .lock_ptr
            .store(e, Ordering::SeqCst);
    }

    pub fn rlock_exit(&self, slot: u32) {
        self.state().session_rlocks[slot as usize]
            .lock_ptr
            .store(u64::MAX, Ordering::Release);
    }

    fn min_read_ptr(&self) -> u64 {
        let s = self.state();
        let mut min = u64::MAX;
        let taken = s.session_slots.load(Ordering::Acquire);
        for i in 0..MAX_SESSIONS {
            if taken & (1 << i) != 0 {
                min = min.min(s.session_rlocks[i].lock_ptr.load(Ordering::Acquire));
            }
        }
        min
    }

    // ------------------------------------------------------------------
    // Segment acquisition and object allocation

    /// Pop a ready segment, falling back to direct preparation when the
    /// provider queues are momentarily empty.
    pub fn get_new_segment(&self, prefer_pinned: bool) -> Result<u64> {
        let s = self.state();
        let (first, second) = if prefer_pinned {
            (&s.pinned_queue, &s.unpinned_queue)
        } else {
            (&s.unpinned_queue, &s.pinned_queue)
        };
        let seg = if let Some(seg) = first.pop().or_else(|| second.pop()) {
            seg
        } else {
            self.prepare_free_segment()?
        };
        self.seg_meta(seg).allocated_by_session();
        Ok(seg)
    }

    /// Take a free segment (or grow the heap) and make it writable.
    fn prepare_free_segment(&self) -> Result<u64> {
        let from_bitmap = {
            let mut free = self.free_segments.lock().unwrap();
            let idx = free.take_first_set();
            if idx == INVALID_INDEX {
                None
            } else {
                Some(idx as u64)
            }
        };
        let seg = match from_bitmap {
            Some(seg) => {
                self.block
                    .protect_rw(seg * SEGMENT_SIZE, SEGMENT_SIZE)?;
                seg
            }
            None => self.block.alloc()?,
        };
        let view = self.segment_view(seg);
        view.reset_for_reuse();
        unsafe {
            // Clear identity + first header so recovery never walks stale
            // objects out of a recycled segment.
            std::ptr::write_bytes(view.at(0), 0, SEGMENT_DATA_START as usize + 64);
        }
        self.seg_meta(seg).added_to_provider_queue();
        Ok(seg)
    }

    /// Activate a segment for a writer: stamp identity and bookkeeping.
    pub fn activate_segment(&self, seg: u64, session_id: u32, seg_sequence: u64) {
        let provider_seq = self
            .state()
            .next_provider_seq
            .fetch_add(1, Ordering::Relaxed);
        let view = self.segment_view(seg);
        unsafe {
            *view.header_mut() = SegmentHeader::new(session_id, seg_sequence, provider_seq, now_ms());
        }
    }

    /// Claim `size` rounded bytes of append space in the writer's
    /// segment, opening a new segment as needed.
    pub fn alloc_space(
        &self,
        writer: &mut Option<SegWriter>,
        session_id: u32,
        seg_seq: &mut u64,
        prefer_pinned: bool,
        size: usize,
        age_ms: u64,
    ) -> Result<(SegmentView, u64, u32, u32)> {
        let rounded = round_up_cacheline(size) as u32;
        debug_assert!(rounded as u64 <= crate::MAX_OBJECT_SIZE);
        loop {
            if writer.is_none() {
                let seg = self.get_new_segment(prefer_pinned)?;
                *seg_seq += 1;
                self.activate_segment(seg, session_id, *seg_seq);
                *writer = Some(SegWriter {
                    seg,
                    view: self.segment_view(seg),
                    vage: VageAccumulator::default(),
                    seg_sequence: *seg_seq,
                    last_commit_end: SEGMENT_DATA_START,
                });
            }
            let w = writer.as_mut().unwrap();
            if !w.view.can_alloc(rounded) {
                self.finalize_segment(writer.take().unwrap(), self.config.sync_mode)?;
                continue;
            }
            let pos = w.view.alloc(rounded);
            w.vage.add(rounded, age_ms);
            w.view
                .footer()
                .last_header_pos
                .store(pos, Ordering::Relaxed);
            return Ok((w.view, w.seg, pos, rounded));
        }
    }

    /// Append-allocate a fresh object: space plus a new logical address.
    /// The returned object is unpublished until [`ObjectAlloc::publish`].
    pub fn alloc_object(
        &self,
        writer: &mut Option<SegWriter>,
        session_id: u32,
        seg_seq: &mut u64,
        prefer_pinned: bool,
        size: usize,
        type_tag: u8,
        hint: &[PtrAddress],
    ) -> Result<ObjectAlloc<'_>> {
        let (view, seg, pos, rounded) =
            self.alloc_space(writer, session_id, seg_seq, prefer_pinned, size, now_ms())?;
        let seq = match self.ctrl.alloc_with_hint(hint) {
            Ok((seq, _cb)) => seq,
            Err(e) => {
                view.unalloc(rounded);
                return Err(e);
            }
        };
        let loc = Location::from_offset(seg * SEGMENT_SIZE + pos as u64);
        let header = AllocHeader::new(rounded, type_tag, seq);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytemuck::bytes_of(&header).as_ptr(),
                view.at(pos),
                std::mem::size_of::<AllocHeader>(),
            );
        }
        Ok(ObjectAlloc {
            seq,
            loc,
            view,
            pos,
            size: rounded,
            alloc: self,
        })
    }

    /// Close out a full (or abandoned) writable segment: terminator,
    /// final commit, read-only metadata.
    pub fn finalize_segment(&self, w: SegWriter, level: SyncLevel) -> Result<()> {
        let view = w.view;
        let pos = view.alloc_pos();
        if pos + 64 <= SEGMENT_DATA_END {
            unsafe { std::ptr::write_bytes(view.at(pos), 0, 64) };
        }
        self.seg_meta(w.seg).add_freed_space(SEGMENT_DATA_END - pos);
        view.footer()
            .close_time_ms
            .store(now_ms().max(1), Ordering::Release);
        let vage = w.vage.average_ms();
        view.footer().vage_ms.store(vage, Ordering::Release);
        self.commit_segment(&view, w.seg, w.last_commit_end, level, true)?;
        self.seg_meta(w.seg).prepare_for_compaction(vage);
        Ok(())
    }

    /// Commit `[last_commit_end, alloc_pos)`: sync header, fence advance,
    /// then the protection/sync ladder for `level`.
    ///
    /// Returns the new `last_commit_end`.
    pub fn commit_segment(
        &self,
        view: &SegmentView,
        seg: u64,
        last_commit_end: u32,
        level: SyncLevel,
        finalize: bool,
    ) -> Result<u32> {
        let mut alloc_pos = view.alloc_pos();
        if alloc_pos == last_commit_end && !finalize {
            return Ok(last_commit_end);
        }
        // The sync header is itself part of the committed range.
        if alloc_pos + 64 <= SEGMENT_DATA_END {
            let commit_checksum = if self.config.checksum_commits {
                let range = unsafe {
                    std::slice::from_raw_parts(
                        view.at(last_commit_end),
                        (alloc_pos - last_commit_end) as usize,
                    )
                };
                xxhash_rust::xxh3::xxh3_64(range)
            } else {
                0
            };
            let prev = view.footer().last_header_pos.load(Ordering::Relaxed);
            let sh = SyncHeader::new(now_ms(), last_commit_end, prev, commit_checksum);
            let pos = view.alloc(64);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytemuck::bytes_of(&sh).as_ptr(),
                    view.at(pos),
                    64,
                );
            }
            view.footer().last_header_pos.store(pos, Ordering::Relaxed);
            alloc_pos = view.alloc_pos();
        }
        if finalize && alloc_pos + 64 <= SEGMENT_DATA_END {
            // Terminate the object chain so no walker can wander into
            // stale bytes from the segment's previous life.
            unsafe { std::ptr::write_bytes(view.at(alloc_pos), 0, 64) };
        }
        if finalize {
            // Claim the rest of the segment so read-only segments always
            // show a full allocation frontier.
            view.footer()
                .alloc_pos
                .store(SEGMENT_DATA_END, Ordering::Release);
            alloc_pos = SEGMENT_DATA_END;
        }

        let old_page = view.first_writable_page() as u32;
        let next_page = if finalize {
            self.pages_per_segment
        } else {
            // Keep the footer page writable until finalization.
            (alloc_pos / self.page_size).min(self.pages_per_segment - 1)
        };
        if next_page > old_page {
            view.footer()
                .first_writable_page
                .store(next_page as u16, Ordering::Release);
        }

        let seg_base = seg * SEGMENT_SIZE;
        let range_start = seg_base + (old_page * self.page_size) as u64;
        let range_len = ((next_page - old_page.min(next_page)) * self.page_size) as u64;
        if range_len > 0 {
            if level >= SyncLevel::Mprotect || self.config.write_protect_on_commit {
                self.block.protect_read(range_start, range_len)?;
            }
            if level >= SyncLevel::MsyncAsync {
                self.block
                    .msync(range_start, range_len, level >= SyncLevel::MsyncSync)?;
            }
            if level >= SyncLevel::Fsync {
                self.block.fsync(level >= SyncLevel::Full)?;
            }
        }
        Ok(view.alloc_pos())
    }

    /// Record bytes freed within whichever segment holds `loc`.
    pub fn note_freed(&self, loc: Location, bytes: u32) {
        let seg = loc.segment(SEGMENT_SIZE);
        self.seg_meta(seg).add_freed_space(bytes);
    }

    // ------------------------------------------------------------------
    // Release cascade

    /// Push an address release to the background queue (used by handle
    /// drops that have no session of their own).
    pub fn deferred_release(&self, addr: PtrAddress) {
        let mut v = addr.raw() as u64;
        loop {
            match self.state().release_queue.push(v) {
                Ok(()) => return,
                Err(back) => {
                    // Queue full: the compactor is behind. Briefly yield.
                    v = back;
                    std::thread::yield_now();
                    if self.stop_all.load(Ordering::Relaxed) {
                        return;
                    }
                }
            }
        }
    }

    /// Drop one reference to `addr`, destroying and cascading when it was
    /// the last. Must be called under a read lock (slot owned by caller).
    pub fn release_address(&self, addr: PtrAddress) {
        let mut worklist = vec![addr];
        while let Some(a) = worklist.pop() {
            if a.is_null() {
                continue;
            }
            let cb = self.ctrl.get(a);
            let prior = cb.release();
            if prior.ref_count() != 1 {
                continue;
            }
            let loc = prior.loc();
            let header = unsafe { self.object_at(loc) };
            let size = header.size();
            let vt = &vtables()[header.type_tag() as usize];
            unsafe { (vt.destroy)(header, &mut |child| worklist.push(child)) };
            self.note_freed(loc, size);
            self.ctrl.free(a);
        }
    }

    // ------------------------------------------------------------------
    // Background threads

    pub fn start_threads(self: &Arc<Self>) {
        self.start_thread(THREAD_PROVIDER, |a| a.provider_iteration());
        self.start_thread(THREAD_COMPACTOR, |a| a.compactor_iteration());
        self.start_thread(THREAD_DECAY, |a| a.decay_iteration());
    }

    fn start_thread(self: &Arc<Self>, idx: usize, body: fn(&Allocator) -> Duration) {
        let ts = &self.state().threads[idx];
        let name = THREAD_NAMES[idx];
        if ts
            .running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone claims to be running this thread. Two liveness
            // tests: does the pid exist, and is the heartbeat advancing?
            let pid = ts.pid.load(Ordering::Acquire) as i32;
            let alive = pid > 0 && unsafe { libc::kill(pid, 0) } == 0;
            let beat = ts.last_heartbeat_ms.load(Ordering::Relaxed);
            let stalled = now_ms().saturating_sub(beat) > TAKEOVER_INTERVAL_MS;
            if alive && !stalled {
                debug!("{name} thread already running in pid {pid}");
                return;
            }
            warn!("{name} thread owner (pid {pid}) is {} - taking over",
                if alive { "stalled" } else { "gone" });
            ts.running.store(1, Ordering::Release);
        }
        ts.stop.store(0, Ordering::Relaxed);
        ts.pid.store(std::process::id(), Ordering::Release);
        ts.start_time_ms.store(now_ms(), Ordering::Release);
        ts.last_heartbeat_ms.store(now_ms(), Ordering::Release);

        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("artdb-{name}"))
            .spawn(move || {
                debug!("{name} thread started");
                loop {
                    let ts = &me.state().threads[idx];
                    if ts.stop.load(Ordering::Acquire) == 1
                        || me.stop_all.load(Ordering::Acquire)
                    {
                        break;
                    }
                    let sleep = body(&me);
                    ts.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
                    me.heartbeat_sleep(idx, sleep);
                }
                let ts = &me.state().threads[idx];
                ts.running.store(0, Ordering::Release);
                debug!("{name} thread stopped");
            })
            .expect("failed to spawn background thread");
        self.threads.lock().unwrap().push(handle);
    }

    /// Sleep in short slices, refreshing the heartbeat between them.
    fn heartbeat_sleep(&self, idx: usize, total: Duration) {
        let ts = &self.state().threads[idx];
        let mut remaining = total;
        let slice = Duration::from_millis(50);
        while remaining > Duration::ZERO {
            if ts.stop.load(Ordering::Acquire) == 1 || self.stop_all.load(Ordering::Acquire) {
                return;
            }
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
            ts.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    pub fn stop_threads(&self) {
        self.stop_all.store(true, Ordering::Release);
        for t in self.state().threads.iter() {
            t.stop.store(1, Ordering::Release);
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }

    // ------------------------------------------------------------------
    // Provider

    /// One provider pass. Priorities: shed excess pinned memory, recycle
    /// pending segments, keep both ready queues stocked, grow when dry.
    fn provider_iteration(&self) -> Duration {
        let s = self.state();

        // 1. munlock down to the configured pinned budget.
        let budget_segs =
            (self.config.max_pinned_cache_size_mb * 1024 * 1024 / SEGMENT_SIZE) as u32;
        while s.pinned_segments.load(Ordering::Relaxed) > budget_segs {
            let Some(seg) = s.pinned_queue.pop() else { break };
            if self.block.munlock(seg * SEGMENT_SIZE, SEGMENT_SIZE).is_ok() {
                s.pinned_segments.fetch_sub(1, Ordering::Relaxed);
            }
            self.seg_meta(seg).set_pinned(false);
            if s.unpinned_queue.push(seg).is_err() {
                self.seg_meta(seg).added_to_free_list();
                self.free_segments.lock().unwrap().set(seg as u32);
            }
        }

        // 2. recycle segments whose readers have all moved on.
        let min_r = self.min_read_ptr();
        while let Some((seg, key)) = s.pending_queue.front() {
            if min_r <= key {
                break;
            }
            s.pending_queue.pop();
            if self
                .block
                .protect_rw(seg * SEGMENT_SIZE, SEGMENT_SIZE)
                .is_err()
            {
                continue;
            }
            let view = self.segment_view(seg);
            view.reset_for_reuse();
            unsafe {
                std::ptr::write_bytes(view.at(0), 0, SEGMENT_DATA_START as usize + 64);
            }
            self.seg_meta(seg).added_to_free_list();
            self.free_segments.lock().unwrap().set(seg as u32);
        }

        // 3. + 4. top up ready queues. Stock stays small; a segment is
        // 32 MiB and sessions fall back to direct preparation anyway.
        let want_pinned = PINNED_STOCK
            .min(budget_segs.saturating_sub(s.pinned_segments.load(Ordering::Relaxed)) as usize);
        while s.pinned_queue.len() < want_pinned {
            match self.prepare_free_segment() {
                Ok(seg) => {
                    if self.block.mlock(seg * SEGMENT_SIZE, SEGMENT_SIZE).is_ok() {
                        s.pinned_segments.fetch_add(1, Ordering::Relaxed);
                        self.seg_meta(seg).set_pinned(true);
                    }
                    if s.pinned_queue.push(seg).is_err() {
                        self.seg_meta(seg).added_to_free_list();
                        self.free_segments.lock().unwrap().set(seg as u32);
                    }
                }
                Err(_) => break,
            }
        }
        while s.unpinned_queue.len() < UNPINNED_STOCK {
            match self.prepare_free_segment() {
                Ok(seg) => {
                    if s.unpinned_queue.push(seg).is_err() {
                        self.seg_meta(seg).added_to_free_list();
                        self.free_segments.lock().unwrap().set(seg as u32);
                    }
                }
                Err(Error::OutOfSegments { .. }) => break,
                Err(e) => {
                    warn!("provider could not prepare a segment: {e}");
                    break;
                }
            }
        }

        Duration::from_millis(self.config.provider_interval_ms)
    }

    // ------------------------------------------------------------------
    // Compactor

    fn compactor_iteration(&self) -> Duration {
        // Drain deferred releases first; they feed freed_space.
        let slot = match self.claim_session_slot() {
            Ok(s) => s,
            Err(_) => return Duration::from_millis(self.config.compactor_interval_ms),
        };
        self.rlock_enter(slot);
        while let Some(raw) = self.state().release_queue.pop() {
            self.release_address(PtrAddress::new(raw as u32));
        }
        self.rlock_exit(slot);

        let mut did_work = false;
        if let Some(seg) = self.pick_compaction_candidate() {
            if let Err(e) = self.compact_segment(seg, slot) {
                error!("compaction of segment {seg} failed: {e}");
            }
            did_work = true;
        }
        self.release_session_slot(slot);
        if did_work {
            Duration::from_millis(0)
        } else {
            Duration::from_millis(self.config.compactor_interval_ms)
        }
    }

    fn pick_compaction_candidate(&self) -> Option<u64> {
        let blocks = self.block.num_blocks();
        let mut best: Option<(u64, u32)> = None;
        for seg in 0..blocks {
            let meta = self.seg_meta(seg);
            if !meta.may_compact() {
                continue;
            }
            let freed = meta.get_freed_space();
            let threshold_mb = if meta.is_pinned() {
                self.config.compact_pinned_unused_threshold_mb
            } else {
                self.config.compact_unpinned_unused_threshold_mb
            };
            if (freed as u64) < threshold_mb * 1024 * 1024 {
                continue;
            }
            if best.map(|(_, b)| freed > b).unwrap_or(true) {
                best = Some((seg, freed));
            }
        }
        best.map(|(seg, _)| seg)
    }

    /// Move every live object out of `seg`, then park the segment on the
    /// pending queue until all readers have advanced past it.
    fn compact_segment(&self, seg: u64, slot: u32) -> Result<()> {
        let view = self.segment_view(seg);
        let src_pinned = self.seg_meta(seg).is_pinned();
        let src_vage = self.seg_meta(seg).get_vage();
        let mut pinned_dst: Option<SegWriter> = None;
        let mut unpinned_dst: Option<SegWriter> = None;
        let mut cseq = 0u64;
        let mut moved = 0u64;
        let mut corrupt: Option<(u32, PtrAddress)> = None;

        self.rlock_enter(slot);
        view.walk_objects(SEGMENT_DATA_END, |pos, header| {
            if header.type_tag() == TYPE_SYNC {
                return true;
            }
            let addr = header.address();
            if addr.is_null() {
                return true;
            }
            let cb = match self.ctrl.get_checked(addr) {
                Some(cb) => cb,
                None => return true,
            };
            let data = cb.load(Ordering::Acquire);
            let obj_loc = Location::from_offset(seg * SEGMENT_SIZE + pos as u64);
            if data.ref_count() == 0 || data.loc() != obj_loc {
                // Dead, or an older copy of a since-moved object.
                return true;
            }
            if self.config.validate_checksum_on_compact
                && header.has_checksum()
                && !unsafe { header.verify_checksum() }
            {
                corrupt = Some((pos, addr));
                return false;
            }
            let vt = &vtables()[header.type_tag() as usize];
            let size = unsafe { (vt.compact_size)(header) };
            let to_pinned = data.pending_cache() || (src_pinned && data.active());
            let writer = if to_pinned { &mut pinned_dst } else { &mut unpinned_dst };
            // Moved data keeps its own address and the age it had at the
            // source, so cold data stays detectably cold.
            let (dst_view, dst_seg, dst_pos, dst_size) = match self.alloc_space(
                writer,
                u32::MAX,
                &mut cseq,
                to_pinned,
                size as usize,
                src_vage.max(1),
            ) {
                Ok(d) => d,
                Err(e) => {
                    warn!("compactor could not allocate destination: {e}");
                    return false;
                }
            };
            let dst_bytes = unsafe {
                std::slice::from_raw_parts_mut(dst_view.at(dst_pos), dst_size as usize)
            };
            unsafe { (vt.compact_to)(header, dst_bytes) };
            if self.config.update_checksum_on_compact {
                let h = unsafe { &mut *(dst_bytes.as_mut_ptr() as *mut AllocHeader) };
                unsafe { (vt.update_checksum)(h) };
            }
            let new_loc = Location::from_offset(dst_seg * SEGMENT_SIZE + dst_pos as u64);
            if cb.cas_move(obj_loc, new_loc) {
                moved += size as u64;
                if data.pending_cache() {
                    cb.try_end_pending_cache();
                }
                self.seg_meta(seg).add_freed_space(size);
            } else {
                // Lost to a concurrent writer (or a late death).
                dst_view.unalloc(dst_size);
            }
            true
        });
        self.rlock_exit(slot);

        if let Some((pos, addr)) = corrupt {
            error!(
                "checksum mismatch while compacting segment {seg} at offset {pos} ({addr:?}); aborting"
            );
            std::process::abort();
        }

        for w in [pinned_dst, unpinned_dst].into_iter().flatten() {
            self.finalize_segment(w, self.config.sync_mode)?;
        }

        // Park the source until every reader has moved past this point.
        self.seg_meta(seg).added_to_read_lock_queue();
        let key = self.state().end_ptr.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state().pending_queue.push(seg, key).is_err() {
            warn!("pending queue full; segment {seg} recycles next pass");
            self.seg_meta(seg).prepare_for_compaction(src_vage);
        }
        debug!("compacted segment {seg}: moved {moved} bytes");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-bit decay

    /// Clear a stride of `active` bits so the activity signal ages out
    /// over one full `read_cache_window_sec` cycle.
    fn decay_iteration(&self) -> Duration {
        const STRIDES: u64 = 256;
        let cursor = self.decay_cursor.fetch_add(1, Ordering::Relaxed) % STRIDES;
        self.ctrl.decay_active_stride(cursor as u32, STRIDES as u32);
        let window = self.config.read_cache_window_sec.max(1);
        Duration::from_millis(window * 1000 / STRIDES)
    }

    /// Record a clean shutdown so the next open can skip recovery.
    pub fn mark_clean_exit(&self) {
        let s = self.state();
        s.saved_alloc_seq
            .store(self.ctrl.alloc_seq(), Ordering::Relaxed);
        s.clean_exit.store(1, Ordering::Release);
        let _ = self.state_map.flush();
    }
}
