//! Logical addresses and their 8-byte atomic control blocks.
//!
//! A [`PtrAddress`] is a 32-bit index into a table of control blocks, each
//! one atomic word carrying the reference count and current heap location
//! of its target. All relocation (compaction) synchronizes with readers
//! through [`ControlBlock::cas_move`] alone.
//!
//! Control blocks live in 32 MiB zones of 2^22 entries, one file per zone
//! under `control_block_zones/`, with a parallel free-bitmap file. The
//! zero word is the free state, so freshly created (zero-filled) zone
//! files need no initialization pass.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
};

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result, CACHELINE_SIZE};

/// Bits of a zone-local index; 2^22 control blocks per zone.
const ZONE_SHIFT: u32 = 22;
pub const PTRS_PER_ZONE: u32 = 1 << ZONE_SHIFT;
pub const MAX_ZONES: usize = (1usize << 32) >> ZONE_SHIFT;
const ZONE_BYTES: usize = PTRS_PER_ZONE as usize * 8;
const BITMAP_BYTES: usize = PTRS_PER_ZONE as usize / 8;
const WORDS_PER_ZONE: u32 = PTRS_PER_ZONE / 64;

/// Addresses sharing one 16-bit region can reference each other with
/// 16-bit indices; inner nodes use this for their branch tables.
pub const REGION_SHIFT: u32 = 16;
const REGIONS_PER_ZONE: u32 = 1 << (ZONE_SHIFT - REGION_SHIFT);
const WORDS_PER_REGION: u32 = (1 << REGION_SHIFT) / 64;

/// 32-bit handle to a control block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PtrAddress(u32);

impl PtrAddress {
    pub const NULL: PtrAddress = PtrAddress(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// High 16 bits: the allocation region.
    pub fn region(self) -> u16 {
        (self.0 >> REGION_SHIFT) as u16
    }

    /// Low 16 bits: the index within the region.
    pub fn index(self) -> u16 {
        self.0 as u16
    }

    pub fn from_region_index(region: u16, index: u16) -> Self {
        Self(((region as u32) << REGION_SHIFT) | index as u32)
    }

    fn zone(self) -> usize {
        (self.0 >> ZONE_SHIFT) as usize
    }

    fn zone_index(self) -> usize {
        (self.0 & (PTRS_PER_ZONE - 1)) as usize
    }
}

impl std::fmt::Debug for PtrAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "addr({}.{})", self.region(), self.index())
    }
}

/// An address plus the 16-bit allocation sequence that recovery uses to
/// pick the newest physical copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtrAddressSeq {
    pub address: PtrAddress,
    pub sequence: u16,
}

impl PtrAddressSeq {
    pub const NULL: PtrAddressSeq = PtrAddressSeq {
        address: PtrAddress::NULL,
        sequence: 0,
    };

    pub fn new(address: PtrAddress, sequence: u16) -> Self {
        Self { address, sequence }
    }
}

/// A 41-bit cacheline offset into the mapped heap: byte offset / 64.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Location(u64);

impl Location {
    pub const MAX_CACHELINE: u64 = (1 << 41) - 1;

    pub fn from_cacheline(cl: u64) -> Self {
        debug_assert!(cl <= Self::MAX_CACHELINE);
        Self(cl)
    }

    pub fn from_offset(offset: u64) -> Self {
        debug_assert_eq!(offset % CACHELINE_SIZE as u64, 0);
        Self(offset / CACHELINE_SIZE as u64)
    }

    pub fn cacheline(self) -> u64 {
        self.0
    }

    pub fn offset(self) -> u64 {
        self.0 * CACHELINE_SIZE as u64
    }

    pub fn segment(self, segment_size: u64) -> u64 {
        self.offset() / segment_size
    }

    pub fn segment_offset(self, segment_size: u64) -> u64 {
        self.offset() % segment_size
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loc({:#x})", self.offset())
    }
}

const REF_BITS: u32 = 21;
const REF_MASK: u64 = (1 << REF_BITS) - 1;
const LOC_SHIFT: u32 = REF_BITS;
const LOC_MASK: u64 = (1 << 41) - 1;
const ACTIVE_BIT: u64 = 1 << 62;
const PENDING_CACHE_BIT: u64 = 1 << 63;

/// Saturation limit with headroom for `max_threads` optimistic overshoots.
pub const MAX_REF_COUNT: u64 = (1 << REF_BITS) - crate::MAX_THREADS as u64;

/// The word a claimed-but-unpublished control block holds: location at the
/// all-ones sentinel, ref zero. Distinct from the all-zero free state.
const CLAIMED: u64 = LOC_MASK << LOC_SHIFT;

/// Decoded control-block word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlBlockData {
    raw: u64,
}

impl ControlBlockData {
    fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub fn ref_count(self) -> u64 {
        self.raw & REF_MASK
    }

    pub fn loc(self) -> Location {
        Location::from_cacheline((self.raw >> LOC_SHIFT) & LOC_MASK)
    }

    pub fn active(self) -> bool {
        self.raw & ACTIVE_BIT != 0
    }

    pub fn pending_cache(self) -> bool {
        self.raw & PENDING_CACHE_BIT != 0
    }

    pub fn is_free(self) -> bool {
        self.raw == 0
    }

    fn with_loc(self, loc: Location) -> Self {
        Self {
            raw: (self.raw & !(LOC_MASK << LOC_SHIFT)) | (loc.cacheline() << LOC_SHIFT),
        }
    }
}

/// One 8-byte atomic control block.
#[repr(transparent)]
pub struct ControlBlock {
    data: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() == 8);

impl ControlBlock {
    pub fn load(&self, order: Ordering) -> ControlBlockData {
        ControlBlockData::from_raw(self.data.load(order))
    }

    pub fn ref_count(&self) -> u64 {
        self.load(Ordering::Relaxed).ref_count()
    }

    /// Current location. Acquire pairs with the release in
    /// [`Self::publish`] and [`Self::cas_move`] so the pointed-at bytes
    /// are visible before dereference.
    pub fn loc(&self) -> Location {
        self.load(Ordering::Acquire).loc()
    }

    /// Optimistic reference acquire. Fails (after rolling back) if the
    /// count has saturated; callers treat that as transient contention.
    pub fn retain(&self) -> bool {
        let prior = ControlBlockData::from_raw(self.data.fetch_add(1, Ordering::Relaxed));
        debug_assert!(prior.ref_count() > 0, "retain on dead control block");
        if prior.ref_count() >= MAX_REF_COUNT {
            self.data.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Drop one reference. Returns the decoded state *before* the
    /// decrement, with the location re-read under acquire on the 1 -> 0
    /// edge so the releasing thread sees the final object placement.
    pub fn release(&self) -> ControlBlockData {
        let prior = ControlBlockData::from_raw(self.data.fetch_sub(1, Ordering::Relaxed));
        debug_assert!(prior.ref_count() > 0, "release on dead control block");
        if prior.ref_count() == 1 {
            if prior.pending_cache() || prior.active() {
                self.clear_activity();
            }
            let latest = self.load(Ordering::Acquire);
            return ControlBlockData::from_raw((latest.raw & !REF_MASK) | 1);
        }
        prior
    }

    /// Publish a freshly constructed object: location + initial refs.
    pub fn publish(&self, loc: Location, refs: u64) {
        debug_assert!(loc.cacheline() != LOC_MASK);
        self.data
            .store((loc.cacheline() << LOC_SHIFT) | refs, Ordering::Release);
    }

    /// Relocate the target iff it is still where the mover saw it and is
    /// still alive. This is the only writer/compactor synchronization.
    pub fn cas_move(&self, expected: Location, desired: Location) -> bool {
        debug_assert!(desired.cacheline() != LOC_MASK);
        let mut current = self.data.load(Ordering::Relaxed);
        loop {
            let data = ControlBlockData::from_raw(current);
            if data.loc() != expected || data.ref_count() == 0 {
                return false;
            }
            let next = data.with_loc(desired);
            match self
                .data
                .compare_exchange_weak(current, next.raw, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(c) => current = c,
            }
        }
    }

    /// One step up the activity ladder: inactive -> active ->
    /// pending-cache. A lost CAS is a sampling loss, not an error.
    pub fn try_inc_activity(&self) -> bool {
        let current = self.data.load(Ordering::Relaxed);
        let data = ControlBlockData::from_raw(current);
        if data.pending_cache() {
            return false;
        }
        let next = if data.active() {
            current | PENDING_CACHE_BIT
        } else {
            current | ACTIVE_BIT
        };
        self.data
            .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Clear pending-cache after a promotion. False if already clear.
    pub fn try_end_pending_cache(&self) -> bool {
        let mut current = self.data.load(Ordering::Relaxed);
        loop {
            if current & PENDING_CACHE_BIT == 0 {
                return false;
            }
            match self.data.compare_exchange_weak(
                current,
                current & !PENDING_CACHE_BIT,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(c) => current = c,
            }
        }
    }

    pub fn clear_active(&self) {
        self.data.fetch_and(!ACTIVE_BIT, Ordering::Relaxed);
    }

    fn clear_activity(&self) {
        self.data
            .fetch_and(!(ACTIVE_BIT | PENDING_CACHE_BIT), Ordering::Release);
    }

    fn try_claim(&self) -> bool {
        self.data
            .compare_exchange(0, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Recovery-only: force a specific state.
    pub fn force(&self, loc: Location, refs: u64) {
        self.data
            .store((loc.cacheline() << LOC_SHIFT) | refs, Ordering::Relaxed);
    }

    fn reset_free(&self) {
        self.data.store(0, Ordering::Release);
    }
}

struct Zone {
    blocks: MmapRaw,
    bits: MmapRaw,
    #[allow(dead_code)]
    block_file: File,
    #[allow(dead_code)]
    bits_file: File,
}

impl Zone {
    fn block(&self, index: usize) -> &ControlBlock {
        debug_assert!(index < PTRS_PER_ZONE as usize);
        unsafe { &*(self.blocks.as_ptr() as *const ControlBlock).add(index) }
    }

    fn bitmap_word(&self, word: u32) -> &AtomicU64 {
        debug_assert!(word < WORDS_PER_ZONE);
        unsafe { &*(self.bits.as_ptr() as *const AtomicU64).add(word as usize) }
    }

    fn count_free(&self) -> u32 {
        (0..WORDS_PER_ZONE)
            .map(|w| self.bitmap_word(w).load(Ordering::Relaxed).count_ones())
            .sum()
    }
}

/// The process-wide control-block table.
pub struct ControlTable {
    dir: PathBuf,
    zones: Box<[AtomicPtr<Zone>]>,
    zone_store: Mutex<Vec<Box<Zone>>>,
    allocated_zones: AtomicU32,
    min_alloc_zone: AtomicU16,
    total_allocations: AtomicU64,
    zone_alloc_count: Box<[AtomicU32]>,
    alloc_seq: AtomicU32,
    probe_seed: AtomicU64,
}

impl ControlTable {
    /// Open (or create) the zone directory. Existing zones are mapped and
    /// their allocation counts rebuilt from the free bitmaps.
    pub fn open(dir: &Path) -> Result<Self> {
        let dir = dir.join("control_block_zones");
        std::fs::create_dir_all(&dir).map_err(Error::Open)?;
        let table = Self {
            dir,
            zones: (0..MAX_ZONES).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            zone_store: Mutex::new(Vec::new()),
            allocated_zones: AtomicU32::new(0),
            min_alloc_zone: AtomicU16::new(0),
            total_allocations: AtomicU64::new(0),
            zone_alloc_count: (0..MAX_ZONES).map(|_| AtomicU32::new(0)).collect(),
            alloc_seq: AtomicU32::new(1),
            probe_seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        };
        loop {
            let n = table.allocated_zones.load(Ordering::Relaxed);
            if !table.zone_path(n).exists() {
                break;
            }
            table.map_zone(n, false)?;
        }
        if table.allocated_zones.load(Ordering::Relaxed) == 0 {
            table.map_zone(0, true)?;
        }
        // Address 0 is the null address; make sure it can never be handed out.
        let null_zone = table.zone(0).unwrap();
        null_zone.bitmap_word(0).fetch_and(!1u64, Ordering::Relaxed);
        table.recount();
        table.update_min_zone();
        Ok(table)
    }

    fn zone_path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("zone_{:04}", n))
    }

    fn bits_path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("zone_{:04}.bits", n))
    }

    fn map_zone(&self, n: u32, create: bool) -> Result<()> {
        let mut store = self.zone_store.lock().unwrap();
        if !self.zones[n as usize].load(Ordering::Acquire).is_null() {
            return Ok(());
        }
        let open = |path: &Path, len: usize| -> Result<(File, MmapRaw)> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(path)
                .map_err(Error::Open)?;
            let existing = file.metadata().map_err(Error::Open)?.len();
            if existing == 0 && create {
                file.set_len(len as u64).map_err(|e| Error::ResizeFailed {
                    size: 0,
                    requested: len as u64,
                    source: e,
                })?;
            } else if existing != len as u64 {
                return Err(Error::Corruption("control block zone file has the wrong size"));
            }
            let map = MmapOptions::new().len(len).map_raw(&file).map_err(|e| {
                Error::MapFailed {
                    requested: len,
                    source: e,
                }
            })?;
            Ok((file, map))
        };
        let (block_file, blocks) = open(&self.zone_path(n), ZONE_BYTES)?;
        let fresh = !self.bits_path(n).exists();
        let (bits_file, bits) = open(&self.bits_path(n), BITMAP_BYTES)?;
        let zone = Box::new(Zone {
            blocks,
            bits,
            block_file,
            bits_file,
        });
        if fresh {
            // New bitmap: every control block is free.
            for w in 0..WORDS_PER_ZONE {
                zone.bitmap_word(w).store(u64::MAX, Ordering::Relaxed);
            }
        }
        let ptr = &*zone as *const Zone as *mut Zone;
        store.push(zone);
        self.zones[n as usize].store(ptr, Ordering::Release);
        self.allocated_zones.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn zone(&self, n: usize) -> Option<&Zone> {
        let p = self.zones[n].load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    fn recount(&self) {
        let mut total = 0u64;
        for n in 0..self.allocated_zones.load(Ordering::Relaxed) {
            let zone = self.zone(n as usize).unwrap();
            let used = PTRS_PER_ZONE - zone.count_free();
            self.zone_alloc_count[n as usize].store(used, Ordering::Relaxed);
            total += used as u64;
        }
        self.total_allocations.store(total, Ordering::Relaxed);
    }

    fn update_min_zone(&self) {
        let zones = self.allocated_zones.load(Ordering::Relaxed);
        let mut min_zone = 0u32;
        let mut min_count = u32::MAX;
        for n in 0..zones {
            let c = self.zone_alloc_count[n as usize].load(Ordering::Relaxed);
            if c < min_count {
                min_count = c;
                min_zone = n;
            }
        }
        self.min_alloc_zone.store(min_zone as u16, Ordering::Relaxed);
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations.load(Ordering::Relaxed)
    }

    /// Restore the monotonic sequence counter (recovery / clean reopen).
    pub fn set_alloc_seq(&self, seq: u32) {
        self.alloc_seq.store(seq.max(1), Ordering::Relaxed);
    }

    pub fn alloc_seq(&self) -> u32 {
        self.alloc_seq.load(Ordering::Relaxed)
    }

    fn next_seq(&self) -> u16 {
        let s = self.alloc_seq.fetch_add(1, Ordering::Relaxed) as u16;
        if s == 0 {
            self.alloc_seq.fetch_add(1, Ordering::Relaxed) as u16
        } else {
            s
        }
    }

    fn probe(&self) -> u64 {
        // splitmix64 over a shared counter: cheap, lock-free, well spread.
        let mut z = self.probe_seed.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    pub fn get(&self, addr: PtrAddress) -> &ControlBlock {
        let zone = self
            .zone(addr.zone())
            .expect("control block address in unallocated zone");
        zone.block(addr.zone_index())
    }

    /// Like [`Self::get`], but `None` for addresses in unmapped zones
    /// (a segment walk can encounter garbage headers).
    pub fn get_checked(&self, addr: PtrAddress) -> Option<&ControlBlock> {
        Some(self.zone(addr.zone())?.block(addr.zone_index()))
    }

    /// Clear the `active` bit across one stride of the table; stride
    /// `cursor` of `strides` per full decay cycle.
    pub fn decay_active_stride(&self, cursor: u32, strides: u32) {
        for zone_n in 0..self.allocated_zones.load(Ordering::Relaxed) {
            let zone = self.zone(zone_n as usize).unwrap();
            let span = WORDS_PER_ZONE / strides;
            let start = cursor * span;
            for w in start..(start + span).min(WORDS_PER_ZONE) {
                let free = zone.bitmap_word(w).load(Ordering::Relaxed);
                let mut used = !free;
                while used != 0 {
                    let bit = used.trailing_zeros();
                    used &= used - 1;
                    zone.block((w * 64 + bit) as usize).clear_active();
                }
            }
        }
    }

    /// Allocate a control block, preferring first the exact 16-entry
    /// cachelines of the hinted sibling addresses, then their region.
    pub fn alloc_with_hint(&self, hint: &[PtrAddress]) -> Result<(PtrAddressSeq, &ControlBlock)> {
        for &h in hint.iter().take(4) {
            if h.is_null() {
                continue;
            }
            let base = h.raw() & !15;
            if let Some(out) = self.try_claim_range(base, 16) {
                return Ok(out);
            }
        }
        if let Some(&h) = hint.iter().find(|a| !a.is_null()) {
            if let Some(out) = self.alloc_in_region(h.region()) {
                return Ok(out);
            }
        }
        self.alloc()
    }

    /// Allocate anywhere: random-cacheline probing in the emptiest zone.
    pub fn alloc(&self) -> Result<(PtrAddressSeq, &ControlBlock)> {
        loop {
            self.maybe_grow()?;
            let zone_n = self.min_alloc_zone.load(Ordering::Relaxed) as u32;
            let Some(zone) = self.zone(zone_n as usize) else {
                continue;
            };
            // Pick one random cacheline (8 words of free bits) and claim
            // from the word with the most free bits.
            for _ in 0..64 {
                let cl = (self.probe() % (WORDS_PER_ZONE as u64 / 8)) as u32 * 8;
                let mut best_word = 0;
                let mut best_pop = 0;
                for i in 0..8 {
                    let pop = zone.bitmap_word(cl + i).load(Ordering::Relaxed).count_ones();
                    if pop > best_pop {
                        best_pop = pop;
                        best_word = cl + i;
                    }
                }
                if best_pop == 0 {
                    continue;
                }
                let base = zone_n * PTRS_PER_ZONE + best_word * 64;
                if let Some(out) = self.try_claim_range(base, 64) {
                    return Ok(out);
                }
            }
            // The sampled zone looked full; refresh the hint and retry.
            self.update_min_zone();
            if self.total_allocations() >= (u32::MAX as u64) - 1 {
                return Err(Error::OutOfAddresses);
            }
        }
    }

    /// Allocate within one 16-bit region, so the result can be referenced
    /// by a 16-bit index from its siblings' node.
    pub fn alloc_in_region(&self, region: u16) -> Option<(PtrAddressSeq, &ControlBlock)> {
        let zone_n = (region as u32) / REGIONS_PER_ZONE;
        self.zone(zone_n as usize)?;
        let first_word = ((region as u32) % REGIONS_PER_ZONE) * WORDS_PER_REGION;
        // A few random probes, then one linear sweep before giving up.
        for _ in 0..8 {
            let w = first_word + (self.probe() % WORDS_PER_REGION as u64) as u32;
            let base = zone_n * PTRS_PER_ZONE + w * 64;
            if let Some(out) = self.try_claim_range(base, 64) {
                return Some(out);
            }
        }
        for w in first_word..first_word + WORDS_PER_REGION {
            let base = zone_n * PTRS_PER_ZONE + w * 64;
            if let Some(out) = self.try_claim_range(base, 64) {
                return Some(out);
            }
        }
        None
    }

    /// Claim any free control block in `[base, base+len)` (len 16 or 64,
    /// within one bitmap word's span).
    fn try_claim_range(&self, base: u32, len: u32) -> Option<(PtrAddressSeq, &ControlBlock)> {
        let zone_n = (base >> ZONE_SHIFT) as usize;
        let zone = self.zone(zone_n)?;
        let word_idx = (base & (PTRS_PER_ZONE - 1)) / 64;
        let shift = base % 64;
        let span_mask = if len >= 64 {
            u64::MAX
        } else {
            ((1u64 << len) - 1) << shift
        };
        let word = zone.bitmap_word(word_idx);
        loop {
            let free = word.load(Ordering::Relaxed) & span_mask;
            if free == 0 {
                return None;
            }
            let bit = free.trailing_zeros();
            let addr = PtrAddress::new((zone_n as u32) << ZONE_SHIFT | (word_idx * 64 + bit));
            let cb = zone.block(addr.zone_index());
            if cb.try_claim() {
                word.fetch_and(!(1u64 << bit), Ordering::Relaxed);
                self.note_alloc(addr);
                let seq = self.next_seq();
                return Some((PtrAddressSeq::new(addr, seq), cb));
            }
            // Someone claimed it between our bitmap read and the CAS;
            // clear the stale bit and retry within the span.
            word.fetch_and(!(1u64 << bit), Ordering::Relaxed);
        }
    }

    fn note_alloc(&self, addr: PtrAddress) {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let zone = addr.zone();
        let prior = self.zone_alloc_count[zone].fetch_add(1, Ordering::Relaxed);
        // If the min zone fills past the average, rescan for a better hint.
        if zone == self.min_alloc_zone.load(Ordering::Relaxed) as usize {
            let zones = self.allocated_zones.load(Ordering::Relaxed).max(1);
            let avg = (self.total_allocations() / zones as u64) as u32;
            if prior + 1 > avg.saturating_add(PTRS_PER_ZONE / 64) {
                self.update_min_zone();
            }
        }
    }

    fn maybe_grow(&self) -> Result<()> {
        let zones = self.allocated_zones.load(Ordering::Acquire);
        if zones as usize >= MAX_ZONES {
            return Ok(());
        }
        let capacity = zones as u64 * PTRS_PER_ZONE as u64;
        if self.total_allocations() * 2 >= capacity {
            self.map_zone(zones, true)?;
            self.update_min_zone();
        }
        Ok(())
    }

    /// Return a control block to the free pool.
    pub fn free(&self, addr: PtrAddress) {
        debug_assert!(!addr.is_null());
        let zone = self.zone(addr.zone()).expect("freeing address in unallocated zone");
        let cb = zone.block(addr.zone_index());
        debug_assert_eq!(cb.ref_count(), 0);
        cb.reset_free();
        let word_idx = addr.zone_index() as u32 / 64;
        let bit = addr.zone_index() as u32 % 64;
        zone.bitmap_word(word_idx).fetch_or(1u64 << bit, Ordering::Relaxed);
        self.total_allocations.fetch_sub(1, Ordering::Relaxed);
        let prior = self.zone_alloc_count[addr.zone()].fetch_sub(1, Ordering::Relaxed);
        let min = self.min_alloc_zone.load(Ordering::Relaxed) as usize;
        if addr.zone() != min
            && prior - 1 < self.zone_alloc_count[min].load(Ordering::Relaxed)
        {
            self.min_alloc_zone.store(addr.zone() as u16, Ordering::Relaxed);
        }
    }

    /// Recovery: install a specific address, creating its zone if needed.
    /// Returns the control block whether it was free or already claimed.
    pub fn get_or_alloc(&self, addr: PtrAddress) -> Result<&ControlBlock> {
        let zone_n = addr.zone() as u32;
        while self.zone(zone_n as usize).is_none() {
            let next = self.allocated_zones.load(Ordering::Relaxed);
            self.map_zone(next, true)?;
        }
        let zone = self.zone(zone_n as usize).unwrap();
        let word_idx = addr.zone_index() as u32 / 64;
        let bit = addr.zone_index() as u32 % 64;
        let was_free =
            zone.bitmap_word(word_idx).fetch_and(!(1u64 << bit), Ordering::Relaxed) & (1 << bit) != 0;
        if was_free {
            self.note_alloc(addr);
        }
        Ok(zone.block(addr.zone_index()))
    }

    /// Recovery: wipe every zone back to the all-free state before the
    /// segment scan reinstalls the live addresses.
    pub fn reset_all(&self) {
        for zone_n in 0..self.allocated_zones.load(Ordering::Relaxed) {
            let zone = self.zone(zone_n as usize).unwrap();
            for i in 0..PTRS_PER_ZONE as usize {
                zone.block(i).force(Location::from_cacheline(0), 0);
                zone.block(i).reset_free();
            }
            for w in 0..WORDS_PER_ZONE {
                zone.bitmap_word(w).store(u64::MAX, Ordering::Relaxed);
            }
        }
        if let Some(zone) = self.zone(0) {
            zone.bitmap_word(0).fetch_and(!1u64, Ordering::Relaxed);
        }
        self.recount();
        self.update_min_zone();
    }

    /// Recovery: walk every allocated (non-free) control block.
    pub fn for_each_allocated(&self, mut f: impl FnMut(PtrAddress, &ControlBlock)) {
        for zone_n in 0..self.allocated_zones.load(Ordering::Relaxed) {
            let zone = self.zone(zone_n as usize).unwrap();
            for w in 0..WORDS_PER_ZONE {
                let free = zone.bitmap_word(w).load(Ordering::Relaxed);
                let mut used = !free;
                while used != 0 {
                    let bit = used.trailing_zeros();
                    used &= used - 1;
                    let addr = PtrAddress::new(zone_n << ZONE_SHIFT | (w * 64 + bit));
                    if addr.is_null() {
                        continue;
                    }
                    f(addr, zone.block(addr.zone_index()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_table(name: &str) -> ControlTable {
        let mut path = std::env::temp_dir();
        path.push(format!("artdb-ctrl-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        ControlTable::open(&path).unwrap()
    }

    #[test]
    fn control_block_word_layout() {
        let cb = ControlBlock { data: AtomicU64::new(0) };
        let loc = Location::from_offset(0x1234 * 64);
        cb.publish(loc, 1);
        let data = cb.load(Ordering::Relaxed);
        assert_eq!(data.ref_count(), 1);
        assert_eq!(data.loc(), loc);
        assert!(!data.active());
        assert!(!data.pending_cache());
    }

    #[test]
    fn retain_release_and_saturation() {
        let cb = ControlBlock { data: AtomicU64::new(0) };
        cb.publish(Location::from_offset(64), MAX_REF_COUNT - 1);
        assert!(cb.retain());
        assert!(!cb.retain(), "saturated retain must fail");
        assert_eq!(cb.ref_count(), MAX_REF_COUNT);
        let prior = cb.release();
        assert_eq!(prior.ref_count(), MAX_REF_COUNT);
    }

    #[test]
    fn cas_move_requires_expected_loc_and_liveness() {
        let cb = ControlBlock { data: AtomicU64::new(0) };
        let a = Location::from_offset(64);
        let b = Location::from_offset(128);
        let c = Location::from_offset(192);
        cb.publish(a, 1);
        assert!(cb.cas_move(a, b));
        assert_eq!(cb.loc(), b);
        assert!(!cb.cas_move(a, c), "stale expected location must fail");
        cb.release();
        cb.force(b, 0);
        assert!(!cb.cas_move(b, c), "dead block must not move");
    }

    #[test]
    fn activity_ladder() {
        let cb = ControlBlock { data: AtomicU64::new(0) };
        cb.publish(Location::from_offset(64), 1);
        assert!(cb.try_inc_activity());
        assert!(cb.load(Ordering::Relaxed).active());
        assert!(cb.try_inc_activity());
        assert!(cb.load(Ordering::Relaxed).pending_cache());
        assert!(!cb.try_inc_activity(), "pending_cache is the top rung");
        assert!(cb.try_end_pending_cache());
        assert!(!cb.try_end_pending_cache());
    }

    #[test]
    fn table_alloc_free_cycle() {
        let table = temp_table("cycle");
        let (seq, cb) = table.alloc().unwrap();
        assert!(!seq.address.is_null());
        assert!(seq.sequence != 0);
        cb.publish(Location::from_offset(64), 1);
        assert_eq!(table.get(seq.address).ref_count(), 1);
        let before = table.total_allocations();
        cb.release();
        cb.force(Location::from_offset(64), 0);
        table.free(seq.address);
        assert_eq!(table.total_allocations(), before - 1);
    }

    #[test]
    fn hinted_alloc_lands_in_region() {
        let table = temp_table("hint");
        let (first, cb) = table.alloc().unwrap();
        cb.publish(Location::from_offset(64), 1);
        for _ in 0..32 {
            let (next, cb) = table.alloc_with_hint(&[first.address]).unwrap();
            cb.publish(Location::from_offset(64), 1);
            assert_eq!(
                next.address.region(),
                first.address.region(),
                "hinted allocation must stay in the sibling region"
            );
        }
    }

    #[test]
    fn sequences_grow() {
        let table = temp_table("seq");
        let (a, _) = table.alloc().unwrap();
        let (b, _) = table.alloc().unwrap();
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn get_or_alloc_installs_exact_address() {
        let table = temp_table("recover");
        let addr = PtrAddress::new(12345);
        let cb = table.get_or_alloc(addr).unwrap();
        cb.force(Location::from_offset(640), 1);
        assert_eq!(table.get(addr).loc(), Location::from_offset(640));
        let mut seen = Vec::new();
        table.for_each_allocated(|a, _| seen.push(a));
        assert!(seen.contains(&addr));
    }
}
