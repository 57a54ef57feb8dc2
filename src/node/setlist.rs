//! The setlist node: a byte-sorted list of branch characters with a
//! parallel array of 16-bit within-region child indices.
//!
//! Branch characters grow forward after the prefix; the index array
//! occupies a reserved block at the node's tail (capacity fixed by the
//! allocation size), so a branch can be added in place while slack
//! remains. Efficient from 1 up to `full_node_threshold` branches.

use byteorder::{ByteOrder, LittleEndian};

use crate::control::PtrAddress;
use crate::header::AllocHeader;

use super::{BranchTarget, LocalIndex, NodeBase, NODE_BASE_SIZE};

#[derive(Clone, Copy)]
pub struct SetlistView<'a> {
    base: &'a NodeBase,
}

impl<'a> SetlistView<'a> {
    /// # Safety
    ///
    /// `header` must start a live setlist-node allocation.
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

    fn node_size(&self) -> usize {
        self.base.header.size() as usize
    }

    pub fn num_branches(&self) -> usize {
        self.base.num_branches as usize
    }

    fn has_eof(&self) -> usize {
        self.base.has_eof_value() as usize
    }

    fn setlist_at(&self) -> usize {
        NODE_BASE_SIZE + self.base.prefix_len as usize
    }

    /// Branch characters in sorted order.
    pub fn setlist(&self) -> &'a [u8] {
        unsafe {
            std::slice::from_raw_parts(self.node_ptr().add(self.setlist_at()), self.num_branches())
        }
    }

    /// Max branches this allocation can hold: one list byte plus one
    /// 16-bit index each.
    pub fn capacity(&self) -> usize {
        ((self.node_size() - self.setlist_at()) / 3).min(crate::FULL_NODE_THRESHOLD + 1)
    }

    fn indices_at(&self) -> usize {
        self.node_size() - 2 * self.capacity()
    }

    fn indices(&self) -> &'a [u16] {
        unsafe {
            std::slice::from_raw_parts(
                self.node_ptr().add(self.indices_at()) as *const u16,
                self.num_branches(),
            )
        }
    }

    pub fn branch_key_bytes(&self, i: LocalIndex) -> &'a [u8] {
        let eof = self.has_eof();
        if i.to_usize() < eof {
            return &[];
        }
        &self.setlist()[i.to_usize() - eof..i.to_usize() - eof + 1]
    }

    pub fn branch_target(&self, i: LocalIndex) -> BranchTarget<'a> {
        let eof = self.has_eof();
        if i.to_usize() < eof {
            return BranchTarget::Leaf(self.base.eof_value().unwrap());
        }
        let idx = self.indices()[i.to_usize() - eof];
        BranchTarget::Child(self.base.child_address(idx))
    }

    /// Child for an exact branch byte.
    pub fn find_branch(&self, byte: u8) -> Option<LocalIndex> {
        let list = self.setlist();
        list.binary_search(&byte)
            .ok()
            .map(|p| LocalIndex((p + self.has_eof()) as u16))
    }

    pub fn lower_bound(&self, key: &[u8]) -> LocalIndex {
        if key.is_empty() {
            return LocalIndex(0);
        }
        let list = self.setlist();
        let pos = list.partition_point(|&b| b < key[0]);
        LocalIndex((pos + self.has_eof()) as u16)
    }

    pub fn validate(&self) -> bool {
        if self.num_branches() > self.capacity() {
            return false;
        }
        self.setlist().windows(2).all(|w| w[0] < w[1])
    }
}

/// In-place setlist mutations; caller must hold write permission.
pub struct SetlistMut<'a> {
    view: SetlistView<'a>,
}

impl<'a> SetlistMut<'a> {
    /// # Safety
    ///
    /// Caller must have exclusive write access to the node.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            view: SetlistView::from_header(header),
        }
    }

    pub fn view(&self) -> SetlistView<'a> {
        self.view
    }

    #[allow(invalid_reference_casting)]
    pub fn base_mut(&mut self) -> &mut NodeBase {
        unsafe { &mut *(self.view.base as *const NodeBase as *mut NodeBase) }
    }

    fn node_mut_ptr(&mut self) -> *mut u8 {
        self.view.node_ptr() as *mut u8
    }

    /// Point branch `i` at a different child in the same region.
    pub fn replace_child(&mut self, i: LocalIndex, idx: u16) {
        let eof = self.view.has_eof();
        debug_assert!(i.to_usize() >= eof);
        let at = self.view.indices_at() + 2 * (i.to_usize() - eof);
        unsafe {
            (self.node_mut_ptr().add(at) as *mut u16).write(idx);
        }
    }

    /// Add a branch in place; false when at capacity.
    pub fn try_insert_branch(&mut self, byte: u8, idx: u16) -> bool {
        let n = self.view.num_branches();
        if n + 1 > self.view.capacity() {
            return false;
        }
        let pos = self.view.setlist().partition_point(|&b| b < byte);
        debug_assert!(self.view.find_branch(byte).is_none());
        let setlist_at = self.view.setlist_at();
        let indices_at = self.view.indices_at();
        unsafe {
            let list = self.node_mut_ptr().add(setlist_at);
            std::ptr::copy(list.add(pos), list.add(pos + 1), n - pos);
            *list.add(pos) = byte;
            let ids = self.node_mut_ptr().add(indices_at) as *mut u16;
            std::ptr::copy(ids.add(pos), ids.add(pos + 1), n - pos);
            *ids.add(pos) = idx;
        }
        self.base_mut().num_branches += 1;
        true
    }

    /// Remove the branch at local index `i`.
    pub fn remove_branch(&mut self, i: LocalIndex) {
        let eof = self.view.has_eof();
        let pos = i.to_usize() - eof;
        let n = self.view.num_branches();
        debug_assert!(pos < n);
        let setlist_at = self.view.setlist_at();
        let indices_at = self.view.indices_at();
        unsafe {
            let list = self.node_mut_ptr().add(setlist_at);
            std::ptr::copy(list.add(pos + 1), list.add(pos), n - pos - 1);
            let ids = self.node_mut_ptr().add(indices_at) as *mut u16;
            std::ptr::copy(ids.add(pos + 1), ids.add(pos), n - pos - 1);
        }
        self.base_mut().num_branches -= 1;
    }
}

/// Builds a fresh setlist node into an allocation.
pub struct SetlistBuilder;

impl SetlistBuilder {
    /// Allocation size (before cacheline rounding).
    pub fn size_for(prefix_len: usize, branches: usize, slack_branches: usize) -> usize {
        NODE_BASE_SIZE + prefix_len + 3 * (branches + slack_branches)
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
        let view = SetlistView::from_header(header);
        let setlist_at = view.setlist_at();
        let indices_at = view.indices_at();
        for (i, (byte, idx)) in branches.iter().enumerate() {
            debug_assert!(i == 0 || branches[i - 1].0 < *byte, "branches must be sorted");
            buf[setlist_at + i] = *byte;
            let at = indices_at + 2 * i;
            LittleEndian::write_u16(&mut buf[at..at + 2], *idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PtrAddressSeq;
    use crate::header::round_up_cacheline;
    use crate::node::{AnyNode, ValueRef, TYPE_SETLIST};

    fn make_node(
        prefix: &[u8],
        branches: &[(u8, u16)],
        eof: Option<(PtrAddress, bool)>,
        slack: usize,
    ) -> Vec<u8> {
        let size =
            round_up_cacheline(SetlistBuilder::size_for(prefix.len(), branches.len(), slack));
        let mut buf = vec![0u8; size];
        let h = AllocHeader::new(size as u32, TYPE_SETLIST, PtrAddressSeq::NULL);
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h));
        unsafe { SetlistBuilder::build(&mut buf, prefix, 5, branches, eof, 10) };
        buf
    }

    #[test]
    fn lookup_and_iteration_order() {
        let buf = make_node(
            b"pre",
            &[(b'a', 3), (b'm', 7), (b'z', 9)],
            Some((PtrAddress::new(0x0005_0001), false)),
            0,
        );
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let view = unsafe { SetlistView::from_header(header) };
        assert!(view.validate());
        assert_eq!(view.setlist(), b"amz");
        // Local index 0 is the EOF slot; branches follow in byte order.
        assert_eq!(
            view.branch_target(LocalIndex(0)),
            BranchTarget::Leaf(ValueRef::ValueNode(PtrAddress::new(0x0005_0001)))
        );
        assert_eq!(
            view.branch_target(LocalIndex(2)),
            BranchTarget::Child(PtrAddress::from_region_index(5, 7))
        );
        assert_eq!(view.find_branch(b'm'), Some(LocalIndex(2)));
        assert_eq!(view.find_branch(b'q'), None);
        assert_eq!(view.lower_bound(b""), LocalIndex(0));
        assert_eq!(view.lower_bound(b"mzz"), LocalIndex(2));
        assert_eq!(view.lower_bound(b"n"), LocalIndex(3));

        let any = unsafe { AnyNode::from_header(header) };
        assert_eq!(any.end_index(), LocalIndex(4));
        assert_eq!(any.branch_key_bytes(LocalIndex(0)), b"");
        assert_eq!(any.branch_key_bytes(LocalIndex(1)), b"a");
    }

    #[test]
    fn in_place_branch_edits() {
        let buf = make_node(b"", &[(b'b', 1), (b'd', 2)], None, 4);
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let mut m = unsafe { SetlistMut::from_header(header) };
        assert!(m.try_insert_branch(b'c', 42));
        assert_eq!(m.view().setlist(), b"bcd");
        assert_eq!(
            m.view().branch_target(LocalIndex(1)),
            BranchTarget::Child(PtrAddress::from_region_index(5, 42))
        );
        m.replace_child(LocalIndex(1), 77);
        assert_eq!(
            m.view().branch_target(LocalIndex(1)),
            BranchTarget::Child(PtrAddress::from_region_index(5, 77))
        );
        m.remove_branch(LocalIndex(0));
        assert_eq!(m.view().setlist(), b"cd");
        assert!(m.view().validate());
    }

    #[test]
    fn capacity_limits_in_place_growth() {
        let buf = make_node(b"", &[(b'a', 1)], None, 0);
        let header = unsafe { &*(buf.as_ptr() as *const AllocHeader) };
        let view = unsafe { SetlistView::from_header(header) };
        let cap = view.capacity();
        let mut m = unsafe { SetlistMut::from_header(header) };
        let mut inserted = 1;
        for b in 0u8..=255 {
            if b == b'a' {
                continue;
            }
            if !m.try_insert_branch(b, b as u16) {
                break;
            }
            inserted += 1;
        }
        assert_eq!(inserted, cap);
    }
}
