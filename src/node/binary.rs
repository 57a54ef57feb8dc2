//! The binary (leaf) node: up to 254 key suffixes held inline, with an
//! embedded allocation area growing from the tail.
//!
//! Layout after the 28-byte node base:
//!
//! ```text
//! | heap_start u16 | dead_bytes u16 | prefix ... | offsets u16[n] -> | ... free ... | <- entry heap |
//! ```
//!
//! The offset array grows forward and stays sorted by key; entries are
//! appended backward from the node's tail. Removed or re-written entries
//! leave dead bytes in the heap that only a copy-on-write rebuild
//! reclaims.

use byteorder::{ByteOrder, LittleEndian};

use crate::control::PtrAddress;
use crate::header::AllocHeader;

use super::{LocalIndex, NodeBase, ValueRef, NODE_BASE_SIZE, VK_INLINE, VK_SUBTREE, VK_VALUE_NODE};

#[repr(C)]
pub(crate) struct BinaryHead {
    base: NodeBase,
    /// Lowest byte offset used by the entry heap.
    heap_start: u16,
    /// Heap bytes belonging to removed or superseded entries.
    dead_bytes: u16,
}

const HEAD_SIZE: usize = NODE_BASE_SIZE + 4;
const _: () = assert!(HEAD_SIZE == 32);

const KLEN_MASK: u16 = (1 << 12) - 1;
const KIND_SHIFT: u16 = 12;

/// One decoded leaf entry.
#[derive(Clone, Copy, Debug)]
pub struct BinaryEntry<'a> {
    /// The key suffix below this node's prefix; empty for the EOF entry.
    pub key: &'a [u8],
    pub value: ValueRef<'a>,
}

fn encoded_len(key: &[u8], value: ValueRef<'_>) -> usize {
    4 + key.len()
        + match value {
            ValueRef::Inline(v) => v.len(),
            _ => 4,
        }
}

#[derive(Clone, Copy)]
pub struct BinaryView<'a> {
    head: &'a BinaryHead,
}

impl<'a> BinaryView<'a> {
    /// # Safety
    ///
    /// `header` must start a live binary-node allocation.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            head: &*(header as *const AllocHeader as *const BinaryHead),
        }
    }

    pub fn base(&self) -> &'a NodeBase {
        &self.head.base
    }

    fn node_ptr(&self) -> *const u8 {
        self.head as *const BinaryHead as *const u8
    }

    fn node_size(&self) -> usize {
        self.head.base.header.size() as usize
    }

    pub fn num_entries(&self) -> usize {
        self.head.base.num_branches as usize
    }

    pub fn prefix(&self) -> &'a [u8] {
        self.head.base.prefix()
    }

    fn prefix_at(&self) -> usize {
        HEAD_SIZE
    }

    fn offsets_at(&self) -> usize {
        (self.prefix_at() + self.head.base.prefix_len as usize + 1) & !1
    }

    fn offsets(&self) -> &'a [u16] {
        unsafe {
            std::slice::from_raw_parts(
                self.node_ptr().add(self.offsets_at()) as *const u16,
                self.num_entries(),
            )
        }
    }

    fn decode_entry(&self, offset: usize) -> BinaryEntry<'a> {
        unsafe {
            let p = self.node_ptr().add(offset);
            let head = std::slice::from_raw_parts(p, 4);
            let klen_kind = LittleEndian::read_u16(&head[..2]);
            let vlen = LittleEndian::read_u16(&head[2..]) as usize;
            let klen = (klen_kind & KLEN_MASK) as usize;
            let kind = (klen_kind >> KIND_SHIFT) as u8;
            let key = std::slice::from_raw_parts(p.add(4), klen);
            let vbytes = std::slice::from_raw_parts(p.add(4 + klen), vlen);
            let value = match kind {
                VK_INLINE => ValueRef::Inline(vbytes),
                VK_VALUE_NODE => {
                    ValueRef::ValueNode(PtrAddress::new(LittleEndian::read_u32(vbytes)))
                }
                VK_SUBTREE => ValueRef::Subtree(PtrAddress::new(LittleEndian::read_u32(vbytes))),
                _ => unreachable!("bad value kind in leaf entry"),
            };
            BinaryEntry { key, value }
        }
    }

    pub fn entry(&self, i: LocalIndex) -> BinaryEntry<'a> {
        self.decode_entry(self.offsets()[i.to_usize()] as usize)
    }

    pub fn entries(&self) -> impl Iterator<Item = BinaryEntry<'a>> + '_ {
        let me = *self;
        (0..self.num_entries()).map(move |i| me.entry(LocalIndex(i as u16)))
    }

    /// First entry with key >= `key` (index may be `num_entries`).
    pub fn lower_bound(&self, key: &[u8]) -> LocalIndex {
        let offsets = self.offsets();
        let mut lo = 0usize;
        let mut hi = offsets.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.decode_entry(offsets[mid] as usize).key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        LocalIndex(lo as u16)
    }

    pub fn find(&self, key: &[u8]) -> Option<LocalIndex> {
        let i = self.lower_bound(key);
        if i.to_usize() < self.num_entries() && self.entry(i).key == key {
            Some(i)
        } else {
            None
        }
    }

    /// Bytes of live payload: what a rebuilt copy of this node needs.
    pub fn live_bytes(&self) -> usize {
        let heap_used = self.node_size() - self.head.heap_start as usize;
        self.offsets_at() + 2 * self.num_entries() + heap_used
            - self.head.dead_bytes as usize
    }

    /// Space left between the offset array and the entry heap.
    pub fn free_space(&self) -> usize {
        self.head.heap_start as usize - (self.offsets_at() + 2 * self.num_entries())
    }

    pub fn can_insert(&self, key: &[u8], value: ValueRef<'_>) -> bool {
        self.num_entries() < crate::BINARY_NODE_MAX_KEYS
            && self.free_space() >= 2 + encoded_len(key, value)
    }

    pub fn validate(&self) -> bool {
        let size = self.node_size();
        if (self.head.heap_start as usize) > size
            || self.offsets_at() + 2 * self.num_entries() > self.head.heap_start as usize
        {
            return false;
        }
        let offsets = self.offsets();
        let mut prev: Option<&[u8]> = None;
        for &off in offsets {
            let off = off as usize;
            if off < self.head.heap_start as usize || off + 4 > size {
                return false;
            }
            let e = self.decode_entry(off);
            if let Some(p) = prev {
                if p >= e.key {
                    return false;
                }
            }
            prev = Some(e.key);
        }
        true
    }
}

/// Mutable leaf operations; only legal on a node the session may still
/// write in place.
pub struct BinaryMut<'a> {
    view: BinaryView<'a>,
}

impl<'a> BinaryMut<'a> {
    /// # Safety
    ///
    /// Caller must have exclusive write access to the node (owner
    /// session, unfrozen page).
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            view: BinaryView::from_header(header),
        }
    }

    pub fn view(&self) -> BinaryView<'a> {
        self.view
    }

    #[allow(invalid_reference_casting)]
    fn head_mut(&mut self) -> &mut BinaryHead {
        unsafe { &mut *(self.view.head as *const BinaryHead as *mut BinaryHead) }
    }

    fn node_mut_ptr(&mut self) -> *mut u8 {
        self.view.node_ptr() as *mut u8
    }

    fn write_entry_at(&mut self, offset: usize, key: &[u8], value: ValueRef<'_>) {
        let (kind, vlen) = match value {
            ValueRef::Inline(v) => (VK_INLINE, v.len()),
            ValueRef::ValueNode(_) => (VK_VALUE_NODE, 4),
            ValueRef::Subtree(_) => (VK_SUBTREE, 4),
        };
        let klen_kind = key.len() as u16 | ((kind as u16) << KIND_SHIFT);
        unsafe {
            let out = std::slice::from_raw_parts_mut(
                self.node_mut_ptr().add(offset),
                4 + key.len() + vlen,
            );
            LittleEndian::write_u16(&mut out[..2], klen_kind);
            LittleEndian::write_u16(&mut out[2..4], vlen as u16);
            out[4..4 + key.len()].copy_from_slice(key);
            match value {
                ValueRef::Inline(v) => out[4 + key.len()..].copy_from_slice(v),
                ValueRef::ValueNode(a) | ValueRef::Subtree(a) => {
                    LittleEndian::write_u32(&mut out[4 + key.len()..], a.raw())
                }
            }
        }
    }

    /// Insert a new entry, keeping the offset array sorted. Returns
    /// false when the node lacks room (caller falls back to COW).
    pub fn try_insert(&mut self, key: &[u8], value: ValueRef<'_>) -> bool {
        if !self.view.can_insert(key, value) {
            return false;
        }
        let pos = self.view.lower_bound(key).to_usize();
        debug_assert!(self.view.find(key).is_none(), "insert over existing key");
        let entry_len = encoded_len(key, value);
        let new_heap_start = self.view.head.heap_start as usize - entry_len;
        self.write_entry_at(new_heap_start, key, value);

        let n = self.view.num_entries();
        let offsets_at = self.view.offsets_at();
        unsafe {
            let offsets = self.node_mut_ptr().add(offsets_at) as *mut u16;
            std::ptr::copy(offsets.add(pos), offsets.add(pos + 1), n - pos);
            *offsets.add(pos) = new_heap_start as u16;
        }
        let head = self.head_mut();
        head.heap_start = new_heap_start as u16;
        head.base.num_branches += 1;
        true
    }

    /// Drop the entry at `i`; its heap bytes become dead space.
    pub fn remove(&mut self, i: LocalIndex) {
        let n = self.view.num_entries();
        debug_assert!(i.to_usize() < n);
        let e = self.view.entry(i);
        let dead = encoded_len(e.key, e.value) as u16;
        let offsets_at = self.view.offsets_at();
        unsafe {
            let offsets = self.node_mut_ptr().add(offsets_at) as *mut u16;
            std::ptr::copy(
                offsets.add(i.to_usize() + 1),
                offsets.add(i.to_usize()),
                n - i.to_usize() - 1,
            );
        }
        let head = self.head_mut();
        head.dead_bytes += dead;
        head.base.num_branches -= 1;
    }

    /// Replace the value of entry `i`. In place when the new encoding is
    /// no larger; otherwise re-appended to the heap if room remains.
    pub fn try_update(&mut self, i: LocalIndex, value: ValueRef<'_>) -> bool {
        let e = self.view.entry(i);
        let old_len = encoded_len(e.key, e.value);
        let new_len = encoded_len(e.key, value);
        let offset = self.view.offsets()[i.to_usize()] as usize;
        if new_len <= old_len {
            // The key bytes stay put; rewrite the kind, the value length,
            // and the value payload only.
            let klen = e.key.len();
            let (kind, vlen) = match value {
                ValueRef::Inline(v) => (VK_INLINE, v.len()),
                ValueRef::ValueNode(_) => (VK_VALUE_NODE, 4),
                ValueRef::Subtree(_) => (VK_SUBTREE, 4),
            };
            let klen_kind = klen as u16 | ((kind as u16) << KIND_SHIFT);
            unsafe {
                let out = std::slice::from_raw_parts_mut(
                    self.node_mut_ptr().add(offset),
                    4 + klen + vlen,
                );
                LittleEndian::write_u16(&mut out[..2], klen_kind);
                LittleEndian::write_u16(&mut out[2..4], vlen as u16);
                match value {
                    ValueRef::Inline(v) => out[4 + klen..].copy_from_slice(v),
                    ValueRef::ValueNode(a) | ValueRef::Subtree(a) => {
                        LittleEndian::write_u32(&mut out[4 + klen..], a.raw())
                    }
                }
            }
            self.head_mut().dead_bytes += (old_len - new_len) as u16;
            return true;
        }
        if self.view.free_space() < new_len {
            return false;
        }
        let key = e.key.to_vec();
        let new_heap_start = self.view.head.heap_start as usize - new_len;
        self.write_entry_at(new_heap_start, &key, value);
        let offsets_at = self.view.offsets_at();
        unsafe {
            let offsets = self.node_mut_ptr().add(offsets_at) as *mut u16;
            *offsets.add(i.to_usize()) = new_heap_start as u16;
        }
        let head = self.head_mut();
        head.heap_start = new_heap_start as u16;
        head.dead_bytes += old_len as u16;
        true
    }
}

/// Builds a fresh binary node into an allocation.
pub struct BinaryBuilder;

impl BinaryBuilder {
    /// Allocation size (before cacheline rounding) for the given content.
    pub fn size_for<'e>(
        prefix_len: usize,
        entries: impl Iterator<Item = (&'e [u8], ValueRef<'e>)>,
        slack: usize,
    ) -> usize {
        let mut heap = 0usize;
        let mut count = 0usize;
        for (k, v) in entries {
            heap += encoded_len(k, v);
            count += 1;
        }
        let offsets_at = (HEAD_SIZE + prefix_len + 1) & !1;
        offsets_at + 2 * count + heap + slack
    }

    /// Write a node over `buf` (the allocation, header already present).
    /// `entries` must be sorted by key and contain no duplicates.
    ///
    /// # Safety
    ///
    /// `buf` must be a fresh allocation of at least `size_for` bytes with
    /// a valid `AllocHeader` at its start.
    pub unsafe fn build(
        buf: &mut [u8],
        prefix: &[u8],
        entries: &[(&[u8], ValueRef<'_>)],
        descendants: u32,
    ) {
        debug_assert!(entries.len() <= crate::BINARY_NODE_MAX_KEYS);
        let head = &mut *(buf.as_mut_ptr() as *mut BinaryHead);
        head.base
            .init(entries.len() as u16, 0, descendants, prefix.len() as u16);
        let node_size = head.base.header.size() as usize;
        head.heap_start = node_size as u16;
        head.dead_bytes = 0;
        buf[HEAD_SIZE..HEAD_SIZE + prefix.len()].copy_from_slice(prefix);

        let header = &*(buf.as_ptr() as *const AllocHeader);
        let mut m = BinaryMut::from_header(header);
        let mut heap = node_size;
        let offsets_at = m.view.offsets_at();
        for (i, (key, value)) in entries.iter().enumerate() {
            debug_assert!(i == 0 || entries[i - 1].0 < *key, "entries must be sorted");
            heap -= encoded_len(key, *value);
            m.write_entry_at(heap, key, *value);
            let offsets = m.node_mut_ptr().add(offsets_at) as *mut u16;
            *offsets.add(i) = heap as u16;
        }
        let head = &mut *(buf.as_mut_ptr() as *mut BinaryHead);
        head.heap_start = heap as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PtrAddressSeq;
    use crate::header::round_up_cacheline;
    use crate::node::TYPE_BINARY;

    fn make_node(prefix: &[u8], entries: &[(&[u8], ValueRef<'_>)], slack: usize) -> Vec<u8> {
        let size = round_up_cacheline(BinaryBuilder::size_for(
            prefix.len(),
            entries.iter().copied(),
            slack,
        ));
        let mut buf = vec![0u8; size];
        let h = AllocHeader::new(size as u32, TYPE_BINARY, PtrAddressSeq::NULL);
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h));
        unsafe { BinaryBuilder::build(&mut buf, prefix, entries, entries.len() as u32) };
        buf
    }

    #[test]
    fn build_and_lookup() {
        let entries: Vec<(&[u8], ValueRef)> = vec![
            (b"", ValueRef::Inline(b"eof")),
            (b"apple", ValueRef::Inline(b"1")),
            (b"banana", ValueRef::ValueNode(PtrAddress::new(42))),
            (b"cherry", ValueRef::Subtree(PtrAddress::new(77))),
        ];
        let buf = make_node(b"fruit/", &entries, 0);
        let view = unsafe { BinaryView::from_header(&*(buf.as_ptr() as *const AllocHeader)) };
        assert!(view.validate());
        assert_eq!(view.num_entries(), 4);
        assert_eq!(view.prefix(), b"fruit/");
        assert_eq!(view.find(b"apple").map(|i| view.entry(i).value),
            Some(ValueRef::Inline(b"1".as_slice())));
        assert_eq!(view.find(b"banana").map(|i| view.entry(i).value),
            Some(ValueRef::ValueNode(PtrAddress::new(42))));
        assert_eq!(view.find(b""), Some(LocalIndex(0)), "EOF entry sorts first");
        assert_eq!(view.find(b"durian"), None);
        assert_eq!(view.lower_bound(b"b"), LocalIndex(2));
    }

    #[test]
    fn in_place_insert_remove_update() {
        let entries: Vec<(&[u8], ValueRef)> = vec![(b"m", ValueRef::Inline(b"mid"))];
        let buf = make_node(b"", &entries, 256);
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let mut m = unsafe { BinaryMut::from_header(header) };
        assert!(m.try_insert(b"a", ValueRef::Inline(b"first")));
        assert!(m.try_insert(b"z", ValueRef::Inline(b"last")));
        let view = m.view();
        assert!(view.validate());
        let keys: Vec<&[u8]> = view.entries().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"m", b"z"]);

        assert!(m.try_update(LocalIndex(1), ValueRef::Inline(b"MID2")));
        assert_eq!(m.view().entry(LocalIndex(1)).value, ValueRef::Inline(b"MID2".as_slice()));

        m.remove(LocalIndex(0));
        let view = m.view();
        assert!(view.validate());
        assert_eq!(view.num_entries(), 2);
        assert_eq!(view.find(b"a"), None);
        assert!(view.live_bytes() < view.node_size());
    }

    #[test]
    fn insert_fails_when_full() {
        let entries: Vec<(&[u8], ValueRef)> = vec![(b"k", ValueRef::Inline(b"v"))];
        let buf = make_node(b"", &entries, 0);
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let mut m = unsafe { BinaryMut::from_header(header) };
        // Cacheline rounding may leave a few bytes; a large entry can't fit.
        assert!(!m.try_insert(b"longer-key", ValueRef::Inline(&[0u8; 64])));
    }
}
