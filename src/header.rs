//! Self-describing object headers.
//!
//! Every heap allocation starts with a 12-byte [`AllocHeader`], so a
//! segment is walkable as a chain of typed objects — that walk is what the
//! compactor and crash recovery are built on. Commit boundaries are marked
//! with 64-byte [`SyncHeader`] records.

use bytemuck::{Pod, Zeroable};

use crate::control::{Location, PtrAddress, PtrAddressSeq};
use crate::CACHELINE_SIZE;

/// Reserved type tags. User types (the node family) start at 3.
pub const TYPE_UNDEFINED: u8 = 0;
pub const TYPE_ALLOC: u8 = 1;
pub const TYPE_SYNC: u8 = 2;
pub const MAX_TYPE: u8 = (1 << 7) - 1;

const SIZE_BITS: u32 = 25;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;

/// 12-byte header at the start of every heap object.
///
/// `(address, sequence)` ties the object back to its control block; the
/// sequence grows monotonically across the allocator so recovery can pick
/// the newest of several copies of the same address.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct AllocHeader {
    checksum: u16,
    sequence: u16,
    address: u32,
    /// 25-bit size in bytes (multiple of 64) | 7-bit type tag << 25.
    size_type: u32,
}

const _: () = assert!(std::mem::size_of::<AllocHeader>() == 12);

impl AllocHeader {
    pub fn new(size: u32, type_tag: u8, addr: PtrAddressSeq) -> Self {
        debug_assert!(size as usize % CACHELINE_SIZE == 0);
        debug_assert!(size <= SIZE_MASK);
        debug_assert!(type_tag <= MAX_TYPE);
        Self {
            checksum: 0,
            sequence: addr.sequence,
            address: addr.address.raw(),
            size_type: size | ((type_tag as u32) << SIZE_BITS),
        }
    }

    pub fn size(&self) -> u32 {
        self.size_type & SIZE_MASK
    }

    pub fn type_tag(&self) -> u8 {
        (self.size_type >> SIZE_BITS) as u8
    }

    pub fn address(&self) -> PtrAddress {
        PtrAddress::new(self.address)
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn address_seq(&self) -> PtrAddressSeq {
        PtrAddressSeq::new(self.address(), self.sequence)
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum != 0
    }

    pub fn clear_checksum(&mut self) {
        self.checksum = 0;
    }

    /// The full object bytes, header included.
    ///
    /// # Safety
    ///
    /// The header must actually sit at the start of a live allocation of
    /// `self.size()` bytes.
    pub unsafe fn object_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self as *const Self as *const u8, self.size() as usize)
    }

    /// The header immediately after this object in its segment.
    ///
    /// # Safety
    ///
    /// Caller must know the adjacent bytes are still within the segment's
    /// allocated range.
    pub unsafe fn next(&self) -> *const AllocHeader {
        (self as *const Self as *const u8)
            .add(self.size() as usize)
            .cast()
    }

    /// Checksum over `[sequence .. end-of-object]`, truncated to 16 bits.
    /// Zero is reserved for "not computed" and remapped to 1.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::object_bytes`].
    pub unsafe fn calculate_checksum(&self) -> u16 {
        let bytes = self.object_bytes();
        let c = xxhash_rust::xxh3::xxh3_64(&bytes[2..]) as u16;
        if c == 0 {
            1
        } else {
            c
        }
    }

    /// # Safety
    ///
    /// Same contract as [`Self::object_bytes`].
    pub unsafe fn update_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// A zero checksum always verifies (never computed).
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::object_bytes`].
    pub unsafe fn verify_checksum(&self) -> bool {
        self.checksum == 0 || self.checksum == self.calculate_checksum()
    }
}

/// 64-byte record written at every commit boundary, letting recovery walk
/// a segment as a sequence of commits.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct SyncHeader {
    pub header: AllocHeader,
    _pad: u32,
    /// Wall-clock commit time.
    pub time_ms: u64,
    /// Segment offset where this commit's checksummed range begins.
    pub checksum_start_pos: u32,
    /// Segment offset of the previous alloc/sync header, for backward walks.
    pub prev_header_pos: u32,
    /// xxh3 over `[checksum_start_pos, this header)`; zero when commit
    /// checksums are disabled.
    pub commit_checksum: u64,
    _reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<SyncHeader>() == 64);

impl SyncHeader {
    pub fn new(time_ms: u64, checksum_start_pos: u32, prev_header_pos: u32, commit_checksum: u64) -> Self {
        Self {
            header: AllocHeader::new(64, TYPE_SYNC, PtrAddressSeq::NULL),
            _pad: 0,
            time_ms,
            checksum_start_pos,
            prev_header_pos,
            commit_checksum,
            _reserved: [0; 24],
        }
    }
}

/// Per-type dispatch table.
///
/// On-disk objects can't carry vtable pointers (addresses differ across
/// processes), so each concrete type registers one of these in a
/// process-local array indexed by the header's 7-bit type tag. The
/// allocator and compactor dispatch through it without knowing any node
/// layout.
#[derive(Clone, Copy)]
pub struct TypeVtable {
    /// Bytes to reserve when cloning for copy-on-write.
    pub cow_size: unsafe fn(&AllocHeader) -> u32,
    /// Bytes the object wants when moved by the compactor.
    pub compact_size: unsafe fn(&AllocHeader) -> u32,
    pub has_checksum: unsafe fn(&AllocHeader) -> bool,
    pub verify_checksum: unsafe fn(&AllocHeader) -> bool,
    pub update_checksum: unsafe fn(&mut AllocHeader),
    /// Move the object into `dst` (len == compact_size).
    pub compact_to: unsafe fn(&AllocHeader, dst: &mut [u8]),
    /// Clone the object into `dst` (len == cow_size).
    pub copy_to: unsafe fn(&AllocHeader, dst: &mut [u8]),
    /// Tear down on last release: hand every owned child address to the
    /// cascade. The object's bytes themselves are reclaimed by segment
    /// compaction, not here.
    pub destroy: unsafe fn(&AllocHeader, release: &mut dyn FnMut(PtrAddress)),
    /// Visit every child address for retain/release cascades.
    pub visit_children: unsafe fn(&AllocHeader, visit: &mut dyn FnMut(PtrAddress)),
}

unsafe fn default_size(h: &AllocHeader) -> u32 {
    h.size()
}

unsafe fn default_copy(h: &AllocHeader, dst: &mut [u8]) {
    let src = h.object_bytes();
    debug_assert_eq!(src.len(), dst.len());
    dst.copy_from_slice(src);
}

unsafe fn default_visit(_h: &AllocHeader, _visit: &mut dyn FnMut(PtrAddress)) {}

impl TypeVtable {
    /// Plain blob behavior: full-object memcpy, whole-object checksum, no
    /// children.
    pub const fn plain() -> Self {
        Self {
            cow_size: default_size,
            compact_size: default_size,
            has_checksum: |h| h.has_checksum(),
            verify_checksum: |h| unsafe { h.verify_checksum() },
            update_checksum: |h| unsafe { h.update_checksum() },
            compact_to: default_copy,
            copy_to: default_copy,
            destroy: default_visit,
            visit_children: default_visit,
        }
    }
}

/// Round an allocation request up to whole cachelines.
pub fn round_up_cacheline(size: usize) -> usize {
    (size + CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1)
}

/// Absolute heap offset of an object's header from its location.
pub fn location_of(header: &AllocHeader, base: *const u8) -> Location {
    let off = header as *const AllocHeader as usize - base as usize;
    Location::from_offset(off as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_size_and_type() {
        let addr = PtrAddressSeq::new(PtrAddress::new(0xDEAD_BEEF), 42);
        let h = AllocHeader::new(256, 5, addr);
        assert_eq!(h.size(), 256);
        assert_eq!(h.type_tag(), 5);
        assert_eq!(h.address().raw(), 0xDEAD_BEEF);
        assert_eq!(h.sequence(), 42);
    }

    #[test]
    fn checksum_roundtrip() {
        let mut buf = vec![0u8; 128];
        let h = AllocHeader::new(128, 3, PtrAddressSeq::new(PtrAddress::new(7), 1));
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h));
        buf[64] = 0x5A;
        let header = unsafe { &mut *(buf.as_mut_ptr() as *mut AllocHeader) };
        assert!(unsafe { header.verify_checksum() }, "zero checksum verifies");
        assert!(!header.has_checksum());
        unsafe { header.update_checksum() };
        assert!(header.has_checksum());
        assert!(unsafe { header.verify_checksum() });
        buf[64] = 0x5B;
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        assert!(!unsafe { header.verify_checksum() });
    }

    #[test]
    fn next_walks_by_size() {
        let mut buf = vec![0u8; 256];
        let h0 = AllocHeader::new(64, 3, PtrAddressSeq::new(PtrAddress::new(1), 1));
        let h1 = AllocHeader::new(192, 4, PtrAddressSeq::new(PtrAddress::new(2), 2));
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h0));
        buf[64..76].copy_from_slice(bytemuck::bytes_of(&h1));
        let first = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let second = unsafe { &*first.next() };
        assert_eq!(second.size(), 192);
        assert_eq!(second.address().raw(), 2);
    }
}
