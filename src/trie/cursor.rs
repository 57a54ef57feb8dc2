//! Ordered iteration: a stack-replay cursor over the node contract.
//!
//! The cursor pins its snapshot by retaining the root; every node on the
//! path stays reachable (and so alive) through that one reference. Nodes
//! are re-dereferenced under a read lock on every operation, so the
//! compactor is free to relocate them between calls.

use crate::control::PtrAddress;
use crate::node::{AnyNode, BranchTarget, LocalIndex};
use crate::session::Session;
use crate::{Result, Value};

struct Level {
    addr: PtrAddress,
    index: LocalIndex,
    /// Length of the key buffer up to and including this node's prefix;
    /// the branch contribution sits above this mark.
    prefix_end: usize,
}

pub struct Cursor<'s> {
    session: &'s Session,
    root: PtrAddress,
    stack: Vec<Level>,
    key_buf: Vec<u8>,
    positioned: bool,
}

impl<'s> Cursor<'s> {
    pub(crate) fn new(session: &'s Session, root: usize) -> Result<Self> {
        let root_addr = session.engine.roots.get(root, |a| session.retain(a));
        Ok(Self {
            session,
            root: root_addr,
            stack: Vec::new(),
            key_buf: Vec::new(),
            positioned: false,
        })
    }

    /// Whether the cursor currently points at a key.
    pub fn valid(&self) -> bool {
        self.positioned
    }

    /// The current key. Empty-key entries and an unpositioned cursor
    /// both yield an empty slice; check [`Self::valid`] to tell them apart.
    pub fn key(&self) -> &[u8] {
        if self.positioned {
            &self.key_buf
        } else {
            &[]
        }
    }

    /// The current value.
    pub fn value(&self) -> Option<Value> {
        if !self.positioned {
            return None;
        }
        let _lock = self.session.read_lock();
        let top = self.stack.last()?;
        let node = self.node_at(top.addr);
        match node.branch_target(top.index) {
            BranchTarget::Leaf(v) => Some(self.session.read_value(v)),
            BranchTarget::Child(_) => None,
        }
    }

    /// Nodes live in the mapped heap, pinned by the retained root; the
    /// borrow rides the session lifetime, not `&self`.
    fn node_at(&self, addr: PtrAddress) -> AnyNode<'s> {
        let session: &'s Session = self.session;
        unsafe { AnyNode::from_header(session.deref(addr)) }
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.key_buf.clear();
        self.positioned = false;
    }

    fn push(&mut self, addr: PtrAddress) {
        let node = self.node_at(addr);
        self.key_buf.extend_from_slice(node.prefix());
        self.stack.push(Level {
            addr,
            index: LocalIndex(0),
            prefix_end: self.key_buf.len(),
        });
    }

    /// Re-point the top level at local index `i`, fixing the key buffer.
    fn set_index(&mut self, i: LocalIndex) {
        let top = self.stack.last_mut().unwrap();
        top.index = i;
        let prefix_end = top.prefix_end;
        let addr = top.addr;
        self.key_buf.truncate(prefix_end);
        let node = self.node_at(addr);
        let bytes = node.branch_key_bytes(i);
        self.key_buf.extend_from_slice(bytes);
    }

    /// Descend from the top level's current index to the smallest (or
    /// largest) leaf below it.
    fn descend(&mut self, to_max: bool) {
        loop {
            let top = self.stack.last().unwrap();
            let node = self.node_at(top.addr);
            match node.branch_target(top.index) {
                BranchTarget::Leaf(_) => {
                    self.positioned = true;
                    return;
                }
                BranchTarget::Child(child) => {
                    self.push(child);
                    let node = self.node_at(child);
                    let i = if to_max {
                        LocalIndex(node.end_index().0 - 1)
                    } else {
                        LocalIndex(0)
                    };
                    self.set_index(i);
                }
            }
        }
    }

    /// Position at the first key.
    pub fn seek_first(&mut self) -> bool {
        let _lock = self.session.read_lock();
        self.clear();
        if self.root.is_null() {
            return false;
        }
        self.push(self.root);
        if self.node_at(self.root).end_index().0 == 0 {
            self.clear();
            return false;
        }
        self.set_index(LocalIndex(0));
        self.descend(false);
        true
    }

    /// Position at the last key.
    pub fn seek_last(&mut self) -> bool {
        let _lock = self.session.read_lock();
        self.clear();
        if self.root.is_null() {
            return false;
        }
        self.push(self.root);
        let end = self.node_at(self.root).end_index();
        if end.0 == 0 {
            self.clear();
            return false;
        }
        self.set_index(LocalIndex(end.0 - 1));
        self.descend(true);
        true
    }

    /// Position at the first key `>= key` (lower bound).
    pub fn seek(&mut self, key: &[u8]) -> bool {
        let _lock = self.session.read_lock();
        self.clear();
        if self.root.is_null() {
            return false;
        }
        self.push(self.root);
        let mut rest: Vec<u8> = key.to_vec();
        loop {
            let top_addr = self.stack.last().unwrap().addr;
            let node = self.node_at(top_addr);
            let prefix = node.prefix();
            let common = prefix
                .iter()
                .zip(rest.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if common < prefix.len() {
                if rest.len() <= common || rest[common] < prefix[common] {
                    // Everything below this node sorts after the target.
                    if node.end_index().0 == 0 {
                        return self.pop_and_advance();
                    }
                    self.set_index(LocalIndex(0));
                    self.descend(false);
                    return true;
                }
                // Everything below this node sorts before the target.
                return self.pop_and_advance();
            }
            let tail = rest.split_off(common);
            let i = node.lower_bound_index(&tail);
            if i >= node.end_index() {
                return self.pop_and_advance();
            }
            match node {
                AnyNode::Value(_) => {
                    if !tail.is_empty() {
                        return self.pop_and_advance();
                    }
                    self.set_index(i);
                    self.positioned = true;
                    return true;
                }
                AnyNode::Binary(_) => {
                    self.set_index(i);
                    self.positioned = true;
                    return true;
                }
                _ => {
                    self.set_index(i);
                    let branch = node.branch_key_bytes(i);
                    if !tail.is_empty() && branch == &tail[..1] {
                        // Exact branch byte: continue the bounded search
                        // inside this child.
                        match node.branch_target(i) {
                            BranchTarget::Child(c) => {
                                self.push(c);
                                rest = tail[1..].to_vec();
                                continue;
                            }
                            BranchTarget::Leaf(_) => unreachable!(),
                        }
                    }
                    // The branch (or EOF) already sorts at/after the
                    // target; take its smallest key.
                    self.descend(false);
                    return true;
                }
            }
        }
    }

    /// Pop the exhausted top level and advance within the parent; the
    /// shared tail of `next`/`seek`.
    fn pop_and_advance(&mut self) -> bool {
        loop {
            let top = self.stack.pop().unwrap();
            self.key_buf.truncate(top.prefix_end);
            let Some(parent) = self.stack.last() else {
                self.clear();
                return false;
            };
            // Remove the parent's prefix contribution marker overshoot:
            // key_buf still holds the parent's branch byte; set_index
            // below rewrites it.
            let node = self.node_at(parent.addr);
            if let Some(n) = node.next_index(parent.index) {
                self.set_index(n);
                self.descend(false);
                return true;
            }
        }
    }

    /// Advance to the next key in order.
    pub fn next(&mut self) -> bool {
        if !self.positioned {
            return false;
        }
        let _lock = self.session.read_lock();
        loop {
            let top = self.stack.last().unwrap();
            let node = self.node_at(top.addr);
            if let Some(n) = node.next_index(top.index) {
                self.set_index(n);
                self.descend(false);
                return true;
            }
            // This node is exhausted; climb.
            let top = self.stack.pop().unwrap();
            self.key_buf.truncate(top.prefix_end);
            if self.stack.is_empty() {
                self.clear();
                return false;
            }
            // Trim the parent's prefix contribution for this level.
            let parent_prefix_end = self.stack.last().unwrap().prefix_end;
            let parent_index = self.stack.last().unwrap().index;
            self.key_buf.truncate(parent_prefix_end);
            let parent_node = self.node_at(self.stack.last().unwrap().addr);
            self.key_buf
                .extend_from_slice(parent_node.branch_key_bytes(parent_index));
        }
    }

    /// Step back to the previous key in order.
    pub fn prev(&mut self) -> bool {
        if !self.positioned {
            return false;
        }
        let _lock = self.session.read_lock();
        loop {
            let top = self.stack.last().unwrap();
            let node = self.node_at(top.addr);
            if let Some(p) = node.prev_index(top.index) {
                self.set_index(p);
                self.descend(true);
                return true;
            }
            let top = self.stack.pop().unwrap();
            self.key_buf.truncate(top.prefix_end);
            if self.stack.is_empty() {
                self.clear();
                return false;
            }
            let parent_prefix_end = self.stack.last().unwrap().prefix_end;
            let parent_index = self.stack.last().unwrap().index;
            self.key_buf.truncate(parent_prefix_end);
            let parent_node = self.node_at(self.stack.last().unwrap().addr);
            self.key_buf
                .extend_from_slice(parent_node.branch_key_bytes(parent_index));
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if !self.root.is_null() {
            self.session.release(self.root);
        }
    }
}
