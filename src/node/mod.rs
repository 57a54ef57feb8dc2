//! The on-disk node family.
//!
//! Four concrete layouts satisfy one node contract: `binary` (the leaf
//! form near the insertion frontier), `setlist` (sparse inner), `full`
//! (dense inner) and `value` (a lone EOF value). All of them start with
//! the same 28-byte [`NodeBase`] so the trie engine, compactor, and
//! release cascade can dispatch on the header's type tag alone.

mod binary;
mod full;
mod setlist;
mod value;

pub use binary::{BinaryBuilder, BinaryEntry, BinaryMut, BinaryView};
pub use full::{FullBuilder, FullMut, FullView};
pub use setlist::{SetlistBuilder, SetlistMut, SetlistView};
pub use value::{ValueBuilder, ValueView};

use std::sync::OnceLock;

use bytemuck::{Pod, Zeroable};

use crate::control::PtrAddress;
use crate::header::{AllocHeader, TypeVtable};

pub const TYPE_BINARY: u8 = 3;
pub const TYPE_SETLIST: u8 = 4;
pub const TYPE_FULL: u8 = 5;
pub const TYPE_VALUE: u8 = 6;

/// A branch position derived from a key byte: 0 is the EOF branch, byte
/// `b` maps to `b + 1`. Ordering over `KeyIndex` is exactly the key
/// ordering of the trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyIndex(u16);

impl KeyIndex {
    pub const EOF: KeyIndex = KeyIndex(0);

    pub fn from_byte(b: u8) -> Self {
        Self(b as u16 + 1)
    }

    pub fn to_byte(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 - 1) as u8)
        }
    }
}

/// A dense position local to one node's branch storage. Carries no
/// relation to byte values; only the node that produced it can interpret
/// it. Distinct from [`KeyIndex`] on purpose — a setlist stores its
/// branches densely in byte-sorted order, so the two disagree everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalIndex(pub u16);

impl LocalIndex {
    pub fn to_usize(self) -> usize {
        self.0 as usize
    }
}

/// How a value is represented at a branch or EOF slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueRef<'a> {
    /// Bytes stored directly in the leaf entry.
    Inline(&'a [u8]),
    /// Address of a `value` node holding the bytes.
    ValueNode(PtrAddress),
    /// Root address of an embedded subtree.
    Subtree(PtrAddress),
}

/// Value kind tags used inside leaf entries and EOF flags.
pub const VK_INLINE: u8 = 0;
pub const VK_VALUE_NODE: u8 = 1;
pub const VK_SUBTREE: u8 = 2;

const FLAG_EOF_PRESENT: u16 = 1 << 0;
const FLAG_EOF_SUBTREE: u16 = 1 << 1;

/// Fixed fields shared by every node layout, immediately after the
/// allocation header.
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct NodeBase {
    pub header: AllocHeader,
    /// Downward edges, excluding the EOF value.
    pub num_branches: u16,
    /// High 16 bits shared by every child address (inner nodes).
    pub branch_region: u16,
    /// Keys reachable through this node.
    pub descendants: u32,
    /// EOF value address (inner nodes); 0 when absent.
    pub eof_value: u32,
    pub prefix_len: u16,
    pub flags: u16,
}

pub const NODE_BASE_SIZE: usize = std::mem::size_of::<NodeBase>();
const _: () = assert!(NODE_BASE_SIZE == 28);

impl NodeBase {
    pub fn init(
        &mut self,
        num_branches: u16,
        branch_region: u16,
        descendants: u32,
        prefix_len: u16,
    ) {
        self.num_branches = num_branches;
        self.branch_region = branch_region;
        self.descendants = descendants;
        self.eof_value = 0;
        self.prefix_len = prefix_len;
        self.flags = 0;
    }

    pub fn has_eof_value(&self) -> bool {
        self.flags & FLAG_EOF_PRESENT != 0
    }

    pub fn eof_is_subtree(&self) -> bool {
        self.flags & FLAG_EOF_SUBTREE != 0
    }

    pub fn eof_value(&self) -> Option<ValueRef<'static>> {
        if !self.has_eof_value() {
            return None;
        }
        let addr = PtrAddress::new(self.eof_value);
        Some(if self.eof_is_subtree() {
            ValueRef::Subtree(addr)
        } else {
            ValueRef::ValueNode(addr)
        })
    }

    pub fn set_eof_value(&mut self, addr: PtrAddress, subtree: bool) {
        self.eof_value = addr.raw();
        self.flags |= FLAG_EOF_PRESENT;
        if subtree {
            self.flags |= FLAG_EOF_SUBTREE;
        } else {
            self.flags &= !FLAG_EOF_SUBTREE;
        }
    }

    pub fn clear_eof_value(&mut self) {
        self.eof_value = 0;
        self.flags &= !(FLAG_EOF_PRESENT | FLAG_EOF_SUBTREE);
    }

    /// Byte pointer to the whole node.
    fn node_ptr(&self) -> *const u8 {
        self as *const NodeBase as *const u8
    }

    pub fn prefix(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.node_ptr().add(NODE_BASE_SIZE), self.prefix_len as usize)
        }
    }

    /// Full child address from a 16-bit within-region index.
    pub fn child_address(&self, index: u16) -> PtrAddress {
        PtrAddress::from_region_index(self.branch_region, index)
    }
}

/// Dispatch wrapper over any node layout.
#[derive(Clone, Copy)]
pub enum AnyNode<'a> {
    Binary(BinaryView<'a>),
    Setlist(SetlistView<'a>),
    Full(FullView<'a>),
    Value(ValueView<'a>),
}

impl<'a> AnyNode<'a> {
    /// # Safety
    ///
    /// `header` must be a live node allocation of one of the four node
    /// types, at least `header.size()` bytes long.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        match header.type_tag() {
            TYPE_BINARY => AnyNode::Binary(BinaryView::from_header(header)),
            TYPE_SETLIST => AnyNode::Setlist(SetlistView::from_header(header)),
            TYPE_FULL => AnyNode::Full(FullView::from_header(header)),
            TYPE_VALUE => AnyNode::Value(ValueView::from_header(header)),
            t => unreachable!("not a node type tag: {t}"),
        }
    }

    pub fn base(&self) -> &'a NodeBase {
        match self {
            AnyNode::Binary(n) => n.base(),
            AnyNode::Setlist(n) => n.base(),
            AnyNode::Full(n) => n.base(),
            AnyNode::Value(n) => n.base(),
        }
    }

    pub fn prefix(&self) -> &'a [u8] {
        self.base().prefix()
    }

    pub fn descendants(&self) -> u32 {
        self.base().descendants
    }

    pub fn num_branches(&self) -> usize {
        self.base().num_branches as usize
    }

    /// Total iterable positions: EOF (when present) plus the branches.
    pub fn end_index(&self) -> LocalIndex {
        match self {
            AnyNode::Value(_) => LocalIndex(1),
            n => LocalIndex(n.base().has_eof_value() as u16 + n.base().num_branches),
        }
    }

    pub fn begin_index(&self) -> LocalIndex {
        LocalIndex(0)
    }

    pub fn next_index(&self, i: LocalIndex) -> Option<LocalIndex> {
        let next = LocalIndex(i.0 + 1);
        if next < self.end_index() {
            Some(next)
        } else {
            None
        }
    }

    pub fn prev_index(&self, i: LocalIndex) -> Option<LocalIndex> {
        if i.0 == 0 {
            None
        } else {
            Some(LocalIndex(i.0 - 1))
        }
    }

    /// The key bytes this branch contributes: the full remaining suffix
    /// for a leaf entry, one byte for an inner branch, nothing for EOF.
    pub fn branch_key_bytes(&self, i: LocalIndex) -> &'a [u8] {
        match self {
            AnyNode::Binary(n) => n.entry(i).key,
            AnyNode::Setlist(n) => n.branch_key_bytes(i),
            AnyNode::Full(n) => n.branch_key_bytes(i),
            AnyNode::Value(_) => &[],
        }
    }

    /// What hangs off local index `i`: a value (leaf/EOF) or a child.
    pub fn branch_target(&self, i: LocalIndex) -> BranchTarget<'a> {
        match self {
            AnyNode::Binary(n) => BranchTarget::Leaf(n.entry(i).value),
            AnyNode::Value(n) => BranchTarget::Leaf(ValueRef::Inline(n.value())),
            AnyNode::Setlist(n) => n.branch_target(i),
            AnyNode::Full(n) => n.branch_target(i),
        }
    }

    /// First local index whose key bytes sort at or after `key`.
    pub fn lower_bound_index(&self, key: &[u8]) -> LocalIndex {
        match self {
            AnyNode::Binary(n) => n.lower_bound(key),
            AnyNode::Setlist(n) => n.lower_bound(key),
            AnyNode::Full(n) => n.lower_bound(key),
            AnyNode::Value(_) => LocalIndex(0),
        }
    }

    /// Layout sanity check; used by tests and debug assertions.
    pub fn validate(&self) -> bool {
        match self {
            AnyNode::Binary(n) => n.validate(),
            AnyNode::Setlist(n) => n.validate(),
            AnyNode::Full(n) => n.validate(),
            AnyNode::Value(n) => n.validate(),
        }
    }
}

/// What a local index resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchTarget<'a> {
    /// A stored value (leaf entry, EOF slot, or value node payload).
    Leaf(ValueRef<'a>),
    /// A child node to descend into.
    Child(PtrAddress),
}

unsafe fn visit_leaf_value(value: ValueRef<'_>, visit: &mut dyn FnMut(PtrAddress)) {
    match value {
        ValueRef::Inline(_) => {}
        ValueRef::ValueNode(a) | ValueRef::Subtree(a) => visit(a),
    }
}

unsafe fn node_visit_children(header: &AllocHeader, visit: &mut dyn FnMut(PtrAddress)) {
    let node = AnyNode::from_header(header);
    match node {
        AnyNode::Value(_) => {}
        AnyNode::Binary(b) => {
            for i in 0..b.num_entries() {
                visit_leaf_value(b.entry(LocalIndex(i as u16)).value, visit);
            }
        }
        n => {
            let end = n.end_index();
            let mut i = n.begin_index();
            while i < end {
                match n.branch_target(i) {
                    BranchTarget::Leaf(v) => visit_leaf_value(v, visit),
                    BranchTarget::Child(c) => visit(c),
                }
                i = LocalIndex(i.0 + 1);
            }
        }
    }
}

/// The process-local type registry, populated once at first use and
/// read-only thereafter.
pub(crate) fn vtables() -> &'static [TypeVtable; 128] {
    static REGISTRY: OnceLock<[TypeVtable; 128]> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut t = [TypeVtable::plain(); 128];
        for tag in [TYPE_BINARY, TYPE_SETLIST, TYPE_FULL] {
            t[tag as usize].visit_children = node_visit_children;
            // Destroying a node means releasing everything it holds a
            // reference to; the bytes go back with the segment.
            t[tag as usize].destroy = node_visit_children;
        }
        t
    })
}

/// Fetch the base struct from a node header.
///
/// # Safety
///
/// `header` must start a node allocation.
pub unsafe fn base_of(header: &AllocHeader) -> &NodeBase {
    &*(header as *const AllocHeader as *const NodeBase)
}

/// Mutable access for in-place modification; caller must have verified
/// write permission via the session's `can_modify`.
///
/// # Safety
///
/// Same as [`base_of`], plus exclusive write access to the node.
#[allow(invalid_reference_casting)]
pub unsafe fn base_of_mut(header: &AllocHeader) -> &mut NodeBase {
    &mut *(header as *const AllocHeader as *const NodeBase as *mut NodeBase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_index_orders_eof_first() {
        assert!(KeyIndex::EOF < KeyIndex::from_byte(0));
        assert!(KeyIndex::from_byte(0) < KeyIndex::from_byte(0xff));
        assert_eq!(KeyIndex::from_byte(0xff).to_byte(), Some(0xff));
        assert_eq!(KeyIndex::EOF.to_byte(), None);
    }

    #[test]
    fn base_eof_flags() {
        let mut buf = [0u8; 64];
        let base = unsafe { &mut *(buf.as_mut_ptr() as *mut NodeBase) };
        base.init(0, 7, 0, 0);
        assert!(base.eof_value().is_none());
        base.set_eof_value(PtrAddress::new(99), false);
        assert_eq!(base.eof_value(), Some(ValueRef::ValueNode(PtrAddress::new(99))));
        base.set_eof_value(PtrAddress::new(99), true);
        assert_eq!(base.eof_value(), Some(ValueRef::Subtree(PtrAddress::new(99))));
        base.clear_eof_value();
        assert!(base.eof_value().is_none());
        assert_eq!(base.child_address(3), PtrAddress::from_region_index(7, 3));
    }
}
