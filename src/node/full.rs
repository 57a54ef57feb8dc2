//! The full node: a direct 256-entry table of 16-bit within-region child
//! indices, used once a node's branch count crosses
//! `full_node_threshold`. O(1) branch lookup, two bytes per possible
//! branch.

use byteorder::{ByteOrder, LittleEndian};

use crate::control::PtrAddress;
use crate::header::AllocHeader;

use super::{BranchTarget, LocalIndex, NodeBase, NODE_BASE_SIZE};

/// Table slot meaning "no branch".
pub const EMPTY_SLOT: u16 = u16::MAX;

#[derive(Clone, Copy)]
pub struct FullView<'a> {
    base: &'a NodeBase,
}

impl<'a> FullView<'a> {
    /// # Safety
    ///
    /// `header` must start a live full-node allocation.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            base: super::base_of(header),
        }
    }

    pub fn base(&self) -> &'a NodeBase {
        self.base
    }

    fn node_ptr(&self) -> *const u8 {
        self.base as *const NodeBase as *const u8
    }

    fn table_at(&self) -> usize {
        (NODE_BASE_SIZE + self.base.prefix_len as usize + 1) & !1
    }

    fn table(&self) -> &'a [u16; 256] {
        unsafe { &*(self.node_ptr().add(self.table_at()) as *const [u16; 256]) }
    }

    pub fn num_branches(&self) -> usize {
        self.base.num_branches as usize
    }

    fn has_eof(&self) -> usize {
        self.base.has_eof_value() as usize
    }

    /// Allocation size for a full node with this prefix.
    pub fn size_for(prefix_len: usize) -> usize {
        ((NODE_BASE_SIZE + prefix_len + 1) & !1) + 512
    }

    pub fn child_for_byte(&self, byte: u8) -> Option<PtrAddress> {
        let idx = self.table()[byte as usize];
        if idx == EMPTY_SLOT {
            None
        } else {
            Some(self.base.child_address(idx))
        }
    }

    /// The `n`th present branch byte (dense iteration order).
    fn nth_present_byte(&self, n: usize) -> u8 {
        let mut seen = 0;
        for (b, &idx) in self.table().iter().enumerate() {
            if idx != EMPTY_SLOT {
                if seen == n {
                    return b as u8;
                }
                seen += 1;
            }
        }
        unreachable!("local index beyond branch count")
    }

    /// Dense rank of `byte` among present branches.
    fn rank_of(&self, byte: u8) -> usize {
        self.table()[..byte as usize]
            .iter()
            .filter(|&&idx| idx != EMPTY_SLOT)
            .count()
    }

    pub fn branch_key_bytes(&self, i: LocalIndex) -> &'a [u8] {
        let eof = self.has_eof();
        if i.to_usize() < eof {
            return &[];
        }
        let byte = self.nth_present_byte(i.to_usize() - eof);
        // Unlike the setlist there is no character array to borrow from,
        // so branch bytes are served out of a static identity table.
        &BYTE_TABLE[byte as usize..byte as usize + 1]
    }

    pub fn branch_target(&self, i: LocalIndex) -> BranchTarget<'a> {
        let eof = self.has_eof();
        if i.to_usize() < eof {
            return BranchTarget::Leaf(self.base.eof_value().unwrap());
        }
        let byte = self.nth_present_byte(i.to_usize() - eof);
        BranchTarget::Child(self.child_for_byte(byte).unwrap())
    }

    pub fn find_branch(&self, byte: u8) -> Option<LocalIndex> {
        if self.table()[byte as usize] == EMPTY_SLOT {
            return None;
        }
        Some(LocalIndex((self.rank_of(byte) + self.has_eof()) as u16))
    }

    pub fn lower_bound(&self, key: &[u8]) -> LocalIndex {
        if key.is_empty() {
            return LocalIndex(0);
        }
        LocalIndex((self.rank_of(key[0]) + self.has_eof()) as u16)
    }

    pub fn validate(&self) -> bool {
        let live = self.table().iter().filter(|&&idx| idx != EMPTY_SLOT).count();
        live == self.num_branches()
    }
}

static BYTE_TABLE: [u8; 256] = {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = i as u8;
        i += 1;
    }
    t
};

/// In-place full-node mutations; caller must hold write permission.
pub struct FullMut<'a> {
    view: FullView<'a>,
}

impl<'a> FullMut<'a> {
    /// # Safety
    ///
    /// Caller must have exclusive write access to the node.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            view: FullView::from_header(header),
        }
    }

    pub fn view(&self) -> FullView<'a> {
        self.view
    }

    #[allow(invalid_reference_casting)]
    pub fn base_mut(&mut self) -> &mut NodeBase {
        unsafe { &mut *(self.view.base as *const NodeBase as *mut NodeBase) }
    }

    fn table_mut(&mut self) -> &mut [u16; 256] {
        unsafe {
            &mut *((self.view.node_ptr() as *mut u8).add(self.view.table_at()) as *mut [u16; 256])
        }
    }

    /// Install or replace the branch for `byte`.
    pub fn set_branch(&mut self, byte: u8, idx: u16) {
        debug_assert_ne!(idx, EMPTY_SLOT);
        let prior = std::mem::replace(&mut self.table_mut()[byte as usize], idx);
        if prior == EMPTY_SLOT {
            self.base_mut().num_branches += 1;
        }
    }

    pub fn clear_branch(&mut self, byte: u8) {
        let prior = std::mem::replace(&mut self.table_mut()[byte as usize], EMPTY_SLOT);
        if prior != EMPTY_SLOT {
            self.base_mut().num_branches -= 1;
        }
    }
}

/// Builds a fresh full node into an allocation.
pub struct FullBuilder;

impl FullBuilder {
    pub fn size_for(prefix_len: usize) -> usize {
        FullView::size_for(prefix_len)
    }

    /// `branches` must be sorted by byte with no duplicates.
    ///
    /// # Safety
    ///
    /// `buf` must be a fresh allocation with a valid header at its start.
    pub unsafe fn build(
        buf: &mut [u8],
        prefix: &[u8],
        region: u16,
        branches: &[(u8, u16)],
        eof: Option<(PtrAddress, bool)>,
        descendants: u32,
    ) {
        let base = &mut *(buf.as_mut_ptr() as *mut NodeBase);
        base.init(branches.len() as u16, region, descendants, prefix.len() as u16);
        if let Some((addr, subtree)) = eof {
            base.set_eof_value(addr, subtree);
        }
        buf[NODE_BASE_SIZE..NODE_BASE_SIZE + prefix.len()].copy_from_slice(prefix);

        let header = &*(buf.as_ptr() as *const AllocHeader);
        let view = FullView::from_header(header);
        let table_at = view.table_at();
        for b in 0..256usize {
            let at = table_at + 2 * b;
            LittleEndian::write_u16(&mut buf[at..at + 2], EMPTY_SLOT);
        }
        for (byte, idx) in branches {
            let at = table_at + 2 * (*byte as usize);
            LittleEndian::write_u16(&mut buf[at..at + 2], *idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PtrAddressSeq;
    use crate::header::round_up_cacheline;
    use crate::node::{ValueRef, TYPE_FULL};

    fn make_node(branches: &[(u8, u16)], eof: Option<(PtrAddress, bool)>) -> Vec<u8> {
        let size = round_up_cacheline(FullBuilder::size_for(2));
        let mut buf = vec![0u8; size];
        let h = AllocHeader::new(size as u32, TYPE_FULL, PtrAddressSeq::NULL);
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h));
        unsafe { FullBuilder::build(&mut buf, b"xy", 9, branches, eof, 100) };
        buf
    }

    #[test]
    fn direct_lookup_and_dense_iteration() {
        let buf = make_node(
            &[(0u8, 1), (b'q', 2), (0xff, 3)],
            Some((PtrAddress::new(0x0009_0005), true)),
        );
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let view = unsafe { FullView::from_header(header) };
        assert!(view.validate());
        assert_eq!(view.child_for_byte(b'q'), Some(PtrAddress::from_region_index(9, 2)));
        assert_eq!(view.child_for_byte(b'r'), None);
        // Dense order: EOF, byte 0, byte 'q', byte 0xff.
        assert_eq!(
            view.branch_target(LocalIndex(0)),
            BranchTarget::Leaf(ValueRef::Subtree(PtrAddress::new(0x0009_0005)))
        );
        assert_eq!(view.branch_key_bytes(LocalIndex(1)), &[0u8]);
        assert_eq!(view.branch_key_bytes(LocalIndex(2)), b"q");
        assert_eq!(view.branch_key_bytes(LocalIndex(3)), &[0xff]);
        assert_eq!(view.find_branch(0xff), Some(LocalIndex(3)));
        assert_eq!(view.lower_bound(b"r"), LocalIndex(3));
    }

    #[test]
    fn set_clear_branches() {
        let buf = make_node(&[(b'a', 4)], None);
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let mut m = unsafe { FullMut::from_header(header) };
        m.set_branch(b'b', 5);
        m.set_branch(b'a', 6);
        assert_eq!(m.view().num_branches(), 2);
        assert_eq!(m.view().child_for_byte(b'a'), Some(PtrAddress::from_region_index(9, 6)));
        m.clear_branch(b'a');
        assert_eq!(m.view().num_branches(), 1);
        assert_eq!(m.view().child_for_byte(b'a'), None);
        assert!(m.view().validate());
    }
}
