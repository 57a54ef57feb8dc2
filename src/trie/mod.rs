//! The trie engine: get / upsert / remove over the node contract, with
//! copy-on-write path rewrites.
//!
//! The single update rule: the path from the root to the mutation point
//! is rewritten, nothing else. A node is modified in place only when it
//! is uniquely referenced, lives in this session's current writable
//! segment, and its page has not been frozen by a commit; every other
//! change clones the node, retaining the children it shares with the old
//! copy. The root slot is advanced by CAS; a lost race unwinds the fresh
//! path and retries the descent.

pub mod cursor;

use log::debug;

use crate::control::PtrAddress;
use crate::header::AllocHeader;
use crate::node::{
    base_of_mut, AnyNode, BinaryBuilder, BinaryMut, BinaryView, BranchTarget, FullBuilder,
    FullMut, LocalIndex, SetlistBuilder, SetlistMut, SetlistView, ValueBuilder, ValueRef,
    ValueView, TYPE_BINARY, TYPE_FULL, TYPE_SETLIST, TYPE_VALUE,
};
use crate::session::Session;
use crate::{
    Error, NodeHandle, NodeKind, Result, Value, BINARY_NODE_MAX_KEYS, BINARY_REFACTOR_THRESHOLD,
    FULL_NODE_THRESHOLD, MAX_KEY_LENGTH, MAX_OBJECT_SIZE,
};

/// Values up to this many bytes are stored inline in leaf entries;
/// larger ones go through a value node.
pub const MAX_INLINE_VALUE: usize = 1024;

/// Extra bytes a leaf clone reserves so a few follow-up inserts can land
/// in place.
const BINARY_CLONE_SLACK: usize = 256;

/// A value on its way into the tree.
#[derive(Clone, Copy)]
enum PendingValue<'a> {
    Bytes(&'a [u8]),
    /// An existing subtree root; retained once per placement.
    Subtree(PtrAddress),
}

/// Result of a recursive update step.
enum Step {
    /// The subtree was modified in place; nothing for the parent to swap.
    InPlace { prior: Option<Value>, delta: i64 },
    /// The subtree was replaced; parent must point at `node` instead.
    Replaced {
        node: PtrAddress,
        prior: Option<Value>,
        delta: i64,
    },
}

enum RemoveStep {
    NotFound,
    InPlace { prior: Value },
    Replaced { node: PtrAddress, prior: Value },
    /// The subtree is now empty; the parent must drop this branch.
    BecameEmpty { prior: Value },
}

impl Session {
    // ==================================================================
    // Public point operations

    /// Point lookup. Walks the trie under a read lock, consuming each
    /// node's prefix and then the next key byte.
    pub fn get(&self, root: usize, key: &[u8]) -> Result<Option<Value>> {
        check_key(key)?;
        let _lock = self.read_lock();
        let root_addr = self.engine.roots.get(root, |a| self.retain(a));
        if root_addr.is_null() {
            return Ok(None);
        }
        let result = self.get_in_tree(root_addr, key);
        self.release(root_addr);
        result
    }

    /// Lookup below an arbitrary subtree handle.
    pub fn get_in(&self, subtree: &NodeHandle, key: &[u8]) -> Result<Option<Value>> {
        check_key(key)?;
        let _lock = self.read_lock();
        self.get_in_tree(subtree.address(), key)
    }

    fn get_in_tree(&self, mut addr: PtrAddress, mut key: &[u8]) -> Result<Option<Value>> {
        loop {
            let header = self.deref(addr);
            let node = unsafe { AnyNode::from_header(header) };
            // Optimized point lookup: consume the prefix, then resolve
            // the remaining key against this node.
            let prefix = node.prefix();
            if key.len() < prefix.len() || &key[..prefix.len()] != prefix {
                return Ok(None);
            }
            key = &key[prefix.len()..];
            match node {
                AnyNode::Binary(b) => {
                    return Ok(b.find(key).map(|i| self.read_value(b.entry(i).value)));
                }
                AnyNode::Value(v) => {
                    return Ok(if key.is_empty() {
                        Some(Value::Bytes(v.value().to_vec()))
                    } else {
                        None
                    });
                }
                AnyNode::Setlist(_) | AnyNode::Full(_) => {
                    if key.is_empty() {
                        return Ok(node.base().eof_value().map(|v| self.read_value(v)));
                    }
                    let child = match node {
                        AnyNode::Setlist(s) => s
                            .find_branch(key[0])
                            .map(|i| match s.branch_target(i) {
                                BranchTarget::Child(c) => c,
                                BranchTarget::Leaf(_) => unreachable!(),
                            }),
                        AnyNode::Full(f) => f.child_for_byte(key[0]),
                        _ => unreachable!(),
                    };
                    match child {
                        Some(c) => {
                            addr = c;
                            key = &key[1..];
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Insert or replace `key`. Returns the prior value, if any.
    pub fn upsert(&self, root: usize, key: &[u8], value: &[u8]) -> Result<Option<Value>> {
        check_value(value)?;
        self.mutate(root, key, PendingValue::Bytes(value))
    }

    /// Store a subtree handle at `key`. The tree takes its own reference;
    /// the handle remains valid.
    pub fn upsert_subtree(&self, root: usize, key: &[u8], subtree: &NodeHandle) -> Result<Option<Value>> {
        self.mutate(root, key, PendingValue::Subtree(subtree.address()))
    }

    /// Insert; fails without modifying the tree if the key exists.
    pub fn insert(&self, root: usize, key: &[u8], value: &[u8]) -> Result<()> {
        if self.get(root, key)?.is_some() {
            return Err(Error::KeyConstraint("insert over an existing key"));
        }
        self.upsert(root, key, value)?;
        Ok(())
    }

    /// Replace; fails (leaving the tree untouched) if the key is absent.
    pub fn update(&self, root: usize, key: &[u8], value: &[u8]) -> Result<Value> {
        if self.get(root, key)?.is_none() {
            return Err(Error::KeyConstraint("update of a missing key"));
        }
        self.upsert(root, key, value)?
            .ok_or(Error::KeyConstraint("update of a missing key"))
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&self, root: usize, key: &[u8]) -> Result<Option<Value>> {
        check_key(key)?;
        let level = self.engine.alloc.config.sync_mode;
        // One writer per root slot; in-place edits depend on it.
        let _writer = self.engine.roots.writer_lock(root);
        loop {
            let _lock = self.read_lock();
            let old_root = self.engine.roots.get(root, |a| self.retain(a));
            if old_root.is_null() {
                return Ok(None);
            }
            let step = match self.remove_node(old_root, key) {
                Ok(s) => s,
                Err(e) => {
                    self.release(old_root);
                    return Err(e);
                }
            };
            let (new_root, prior) = match step {
                RemoveStep::NotFound => {
                    self.release(old_root);
                    return Ok(None);
                }
                RemoveStep::InPlace { prior } => {
                    self.release(old_root);
                    self.commit(level)?;
                    return Ok(Some(prior));
                }
                RemoveStep::Replaced { node, prior } => (node, prior),
                RemoveStep::BecameEmpty { prior } => (PtrAddress::NULL, prior),
            };
            self.commit(level)?;
            match self.engine.roots.cas(root, old_root, new_root, level)? {
                Ok(()) => {
                    // The table's reference transferred to us; drop it
                    // and our own temporary retain.
                    self.release(old_root);
                    self.release(old_root);
                    return Ok(Some(prior));
                }
                Err(_) => {
                    debug!("root {root} advanced during remove; retrying");
                    if !new_root.is_null() {
                        self.release(new_root);
                    }
                    self.release(old_root);
                    drop(prior);
                }
            }
        }
    }

    /// Shared upsert driver: descend, rewrite the path, CAS the root.
    fn mutate(&self, root: usize, key: &[u8], pv: PendingValue<'_>) -> Result<Option<Value>> {
        check_key(key)?;
        let level = self.engine.alloc.config.sync_mode;
        // One writer per root slot; in-place edits depend on it. The CAS
        // loop still guards against concurrent `set_root`/`cas_root`.
        let _writer = self.engine.roots.writer_lock(root);
        loop {
            let _lock = self.read_lock();
            let old_root = self.engine.roots.get(root, |a| self.retain(a));
            let step = if old_root.is_null() {
                let value = self.place_leaf_value(pv)?;
                let node = self.alloc_binary(key, &[(b"", value)], 1, &[])?;
                Step::Replaced {
                    node,
                    prior: None,
                    delta: 1,
                }
            } else {
                match self.upsert_node(old_root, key, pv) {
                    Ok(s) => s,
                    Err(e) => {
                        self.release(old_root);
                        return Err(e);
                    }
                }
            };
            match step {
                Step::InPlace { prior, .. } => {
                    self.release(old_root);
                    self.commit(level)?;
                    return Ok(prior);
                }
                Step::Replaced { node, prior, .. } => {
                    // Data becomes durable before the root points at it.
                    self.commit(level)?;
                    match self.engine.roots.cas(root, old_root, node, level)? {
                        Ok(()) => {
                            if !old_root.is_null() {
                                self.release(old_root);
                                self.release(old_root);
                            }
                            return Ok(prior);
                        }
                        Err(_) => {
                            debug!("root {root} advanced during upsert; retrying");
                            self.release(node);
                            if !old_root.is_null() {
                                self.release(old_root);
                            }
                        }
                    }
                }
            }
        }
    }

    // ==================================================================
    // Root handle operations

    /// Retain and return the current root handle for slot `i`.
    pub fn get_root(&self, i: usize) -> Option<NodeHandle> {
        let addr = self.engine.roots.get(i, |a| self.retain(a));
        if addr.is_null() {
            None
        } else {
            Some(NodeHandle::new(self.engine.clone(), addr))
        }
    }

    /// Install `handle` (or clear with `None`), returning the prior root.
    pub fn set_root(
        &self,
        i: usize,
        handle: Option<&NodeHandle>,
        level: crate::SyncLevel,
    ) -> Result<Option<NodeHandle>> {
        let new = match handle {
            Some(h) => {
                while !self.retain(h.address()) {
                    std::hint::spin_loop();
                }
                h.address()
            }
            None => PtrAddress::NULL,
        };
        // Strictly stronger than a transaction: hold the writer mutex
        // and the slot lock.
        let _writer = self.engine.roots.writer_lock(i);
        let prior = self.engine.roots.set(i, new, level)?;
        Ok(if prior.is_null() {
            None
        } else {
            Some(NodeHandle::new(self.engine.clone(), prior))
        })
    }

    /// CAS a root slot from `expect` to `desire`; true on success.
    pub fn cas_root(
        &self,
        i: usize,
        expect: Option<&NodeHandle>,
        desire: Option<&NodeHandle>,
        level: crate::SyncLevel,
    ) -> Result<bool> {
        let expect_addr = expect.map(|h| h.address()).unwrap_or(PtrAddress::NULL);
        let desire_addr = match desire {
            Some(h) => {
                while !self.retain(h.address()) {
                    std::hint::spin_loop();
                }
                h.address()
            }
            None => PtrAddress::NULL,
        };
        let _writer = self.engine.roots.writer_lock(i);
        match self.engine.roots.cas(i, expect_addr, desire_addr, level)? {
            Ok(()) => {
                if !expect_addr.is_null() {
                    // The table's reference on the displaced root is ours
                    // to drop now.
                    self.release(expect_addr);
                }
                Ok(true)
            }
            Err(_) => {
                if !desire_addr.is_null() {
                    self.release(desire_addr);
                }
                Ok(false)
            }
        }
    }

    /// Begin a multi-op transaction on root slot `i`, excluding every
    /// other transaction on that slot until commit or abort (drop).
    pub fn start_transaction(&self, i: usize) -> RootTransactionGuard<'_> {
        let txn = self.engine.roots.start_transaction(i, |a| self.retain(a));
        let start = if txn.start.is_null() {
            None
        } else {
            // The retain taken at transaction start backs this handle.
            Some(NodeHandle::new(self.engine.clone(), txn.start))
        };
        RootTransactionGuard {
            session: self,
            txn: Some(txn),
            start,
        }
    }

    /// Introspection: the concrete node type reached after consuming
    /// exactly `path` bytes from the root. Used by refactoring tests.
    pub fn node_kind_at(&self, root: usize, path: &[u8]) -> Result<Option<NodeKind>> {
        let _lock = self.read_lock();
        let root_addr = self.engine.roots.get(root, |a| self.retain(a));
        if root_addr.is_null() {
            return Ok(None);
        }
        let mut addr = root_addr;
        let mut rest = path;
        let out = loop {
            let header = self.deref(addr);
            let node = unsafe { AnyNode::from_header(header) };
            let prefix = node.prefix();
            let kind = match node {
                AnyNode::Binary(_) => NodeKind::Binary,
                AnyNode::Setlist(_) => NodeKind::Setlist,
                AnyNode::Full(_) => NodeKind::Full,
                AnyNode::Value(_) => NodeKind::Value,
            };
            if rest.len() <= prefix.len() {
                break if prefix.starts_with(rest) { Some(kind) } else { None };
            }
            if !rest.starts_with(prefix) {
                break None;
            }
            rest = &rest[prefix.len()..];
            let child = match node {
                AnyNode::Setlist(s) => s.find_branch(rest[0]).map(|i| match s.branch_target(i) {
                    BranchTarget::Child(c) => c,
                    BranchTarget::Leaf(_) => unreachable!(),
                }),
                AnyNode::Full(f) => f.child_for_byte(rest[0]),
                _ => break Some(kind),
            };
            match child {
                Some(c) => {
                    addr = c;
                    rest = &rest[1..];
                }
                None => break None,
            }
        };
        self.release(root_addr);
        Ok(out)
    }

    // ==================================================================
    // Recursive upsert

    fn upsert_node(&self, addr: PtrAddress, key: &[u8], pv: PendingValue<'_>) -> Result<Step> {
        let header = self.deref(addr);
        let node = unsafe { AnyNode::from_header(header) };
        let prefix = node.prefix();
        let common = lcp(key, prefix);
        if common < prefix.len() {
            return self.split_prefix(header, key, common, pv);
        }
        let rest = &key[common..];
        match node {
            AnyNode::Binary(b) => self.upsert_binary(addr, header, b, rest, pv),
            AnyNode::Setlist(_) | AnyNode::Full(_) => {
                self.upsert_inner(addr, header, node, rest, pv)
            }
            AnyNode::Value(_) => {
                // A value node is never an interior node of a tree the
                // engine built; only subtree roots can be one.
                Err(Error::Corruption("descended into a value node"))
            }
        }
    }

    fn upsert_binary(
        &self,
        addr: PtrAddress,
        header: &AllocHeader,
        b: BinaryView<'_>,
        rest: &[u8],
        pv: PendingValue<'_>,
    ) -> Result<Step> {
        let in_place = self.may_modify_in_place(addr);
        if let Some(i) = b.find(rest) {
            // Replace an existing entry.
            let old = b.entry(i).value;
            let prior = Some(self.read_value(old));
            let value = self.place_leaf_value(pv)?;
            if in_place {
                let mut m = unsafe { BinaryMut::from_header(header) };
                if m.try_update(i, value) {
                    self.release_displaced(old);
                    return Ok(Step::InPlace { prior, delta: 0 });
                }
                // No room in place; `value` stays ours and flows into
                // the rebuild below.
            }
            let node = self.rebuild_binary(b, b.prefix(), Some((rest, value)), Some(i), 0)?;
            return Ok(Step::Replaced {
                node,
                prior,
                delta: 0,
            });
        }

        // Fresh key.
        let value = self.place_leaf_value(pv)?;
        if in_place {
            let mut m = unsafe { BinaryMut::from_header(header) };
            if m.try_insert(rest, value) {
                unsafe { base_of_mut(header) }.descendants += 1;
                return Ok(Step::InPlace {
                    prior: None,
                    delta: 1,
                });
            }
        }
        let grown = b.live_bytes() + 2 + 4 + rest.len() + value_encoded_len(value);
        if b.num_entries() + 1 <= BINARY_NODE_MAX_KEYS && grown <= BINARY_REFACTOR_THRESHOLD {
            let node = self.rebuild_binary(b, b.prefix(), Some((rest, value)), None, 1)?;
            return Ok(Step::Replaced {
                node,
                prior: None,
                delta: 1,
            });
        }
        // Refactor: the leaf crossed its threshold; split it into an
        // inner node over new, smaller leaves.
        let node = self.split_binary(b, rest, value)?;
        Ok(Step::Replaced {
            node,
            prior: None,
            delta: 1,
        })
    }

    fn upsert_inner(
        &self,
        addr: PtrAddress,
        header: &AllocHeader,
        node: AnyNode<'_>,
        rest: &[u8],
        pv: PendingValue<'_>,
    ) -> Result<Step> {
        let in_place = self.may_modify_in_place(addr);
        if rest.is_empty() {
            // The key terminates here: the EOF slot, always via address.
            let old = node.base().eof_value();
            let prior = old.map(|v| self.read_value(v));
            let (value_addr, subtree) = self.place_eof_value(pv)?;
            let delta = if old.is_some() { 0 } else { 1 };
            if in_place {
                let base = unsafe { base_of_mut(header) };
                base.set_eof_value(value_addr, subtree);
                base.descendants = (base.descendants as i64 + delta) as u32;
                if let Some(v) = old {
                    self.release_displaced(v);
                }
                return Ok(Step::InPlace { prior, delta });
            }
            let node = self.rebuild_inner(
                node,
                node.prefix(),
                BranchEdit::SetEof(value_addr, subtree),
                delta,
            )?;
            return Ok(Step::Replaced { node, prior, delta });
        }

        let byte = rest[0];
        let child = match node {
            AnyNode::Setlist(s) => s.find_branch(byte).map(|i| (i, child_of(&s, i))),
            AnyNode::Full(f) => f.find_branch(byte).map(|i| (i, f.child_for_byte(byte).unwrap())),
            _ => unreachable!(),
        };

        match child {
            Some((local, child_addr)) => {
                let step = self.upsert_node(child_addr, &rest[1..], pv)?;
                match step {
                    Step::InPlace { prior, delta } => {
                        if delta == 0 {
                            return Ok(Step::InPlace { prior, delta });
                        }
                        if in_place {
                            let base = unsafe { base_of_mut(header) };
                            base.descendants = (base.descendants as i64 + delta) as u32;
                            return Ok(Step::InPlace { prior, delta });
                        }
                        let node =
                            self.rebuild_inner(node, node.prefix(), BranchEdit::None, delta)?;
                        Ok(Step::Replaced { node, prior, delta })
                    }
                    Step::Replaced {
                        node: new_child,
                        prior,
                        delta,
                    } => {
                        // The replacement child must be addressable by a
                        // 16-bit index in this node's branch region.
                        if in_place && new_child.region() == node.base().branch_region {
                            match node {
                                AnyNode::Setlist(_) => {
                                    let mut m = unsafe { SetlistMut::from_header(header) };
                                    m.replace_child(local, new_child.index());
                                }
                                AnyNode::Full(_) => {
                                    let mut m = unsafe { FullMut::from_header(header) };
                                    m.set_branch(byte, new_child.index());
                                }
                                _ => unreachable!(),
                            }
                            let base = unsafe { base_of_mut(header) };
                            base.descendants = (base.descendants as i64 + delta) as u32;
                            self.release(child_addr);
                            return Ok(Step::InPlace { prior, delta });
                        }
                        let node = self.rebuild_inner(
                            node,
                            node.prefix(),
                            BranchEdit::Replace(byte, new_child),
                            delta,
                        )?;
                        Ok(Step::Replaced { node, prior, delta })
                    }
                }
            }
            None => {
                // New branch: a fresh one-entry leaf below `byte`.
                let value = self.place_leaf_value(pv)?;
                let leaf = self.alloc_binary(&rest[1..], &[(b"", value)], 1, &[addr])?;
                if in_place {
                    if let AnyNode::Setlist(_) = node {
                        if node.num_branches() + 1 < FULL_NODE_THRESHOLD
                            && leaf.region() == node.base().branch_region
                        {
                            let mut m = unsafe { SetlistMut::from_header(header) };
                            if m.try_insert_branch(byte, leaf.index()) {
                                let base = unsafe { base_of_mut(header) };
                                base.descendants += 1;
                                return Ok(Step::InPlace {
                                    prior: None,
                                    delta: 1,
                                });
                            }
                        }
                    }
                    if let AnyNode::Full(_) = node {
                        if leaf.region() == node.base().branch_region {
                            let mut m = unsafe { FullMut::from_header(header) };
                            m.set_branch(byte, leaf.index());
                            let base = unsafe { base_of_mut(header) };
                            base.descendants += 1;
                            return Ok(Step::InPlace {
                                prior: None,
                                delta: 1,
                            });
                        }
                    }
                }
                let node =
                    self.rebuild_inner(node, node.prefix(), BranchEdit::Insert(byte, leaf), 1)?;
                Ok(Step::Replaced {
                    node,
                    prior: None,
                    delta: 1,
                })
            }
        }
    }

    /// The key diverges inside this node's prefix: interpose a new inner
    /// node at the common point, with the old node (prefix shortened)
    /// and the new key below it.
    fn split_prefix(
        &self,
        header: &AllocHeader,
        key: &[u8],
        common: usize,
        pv: PendingValue<'_>,
    ) -> Result<Step> {
        let node = unsafe { AnyNode::from_header(header) };
        let prefix = node.prefix();
        let old_byte = prefix[common];
        let shortened = self.clone_with_prefix(node, &prefix[common + 1..])?;
        let old_descendants = node.descendants();

        let rest = &key[common..];
        let mut eof = None;
        let mut branches: Vec<(u8, PtrAddress)> = vec![(old_byte, shortened)];
        if rest.is_empty() {
            let (value_addr, subtree) = self.place_eof_value(pv)?;
            eof = Some((value_addr, subtree));
        } else {
            let value = self.place_leaf_value(pv)?;
            let leaf = self.alloc_binary(&rest[1..], &[(b"", value)], 1, &[shortened])?;
            branches.push((rest[0], leaf));
            branches.sort_by_key(|(b, _)| *b);
        }
        let upper = self.alloc_setlist(&key[..common], &branches, eof, old_descendants + 1)?;
        Ok(Step::Replaced {
            node: upper,
            prior: None,
            delta: 1,
        })
    }

    // ==================================================================
    // Recursive remove

    fn remove_node(&self, addr: PtrAddress, key: &[u8]) -> Result<RemoveStep> {
        let header = self.deref(addr);
        let node = unsafe { AnyNode::from_header(header) };
        let prefix = node.prefix();
        if !key.starts_with(prefix) {
            return Ok(RemoveStep::NotFound);
        }
        let rest = &key[prefix.len()..];
        let in_place = self.may_modify_in_place(addr);

        match node {
            AnyNode::Binary(b) => {
                let Some(i) = b.find(rest) else {
                    return Ok(RemoveStep::NotFound);
                };
                let old = b.entry(i).value;
                let prior = self.read_value(old);
                if b.num_entries() == 1 {
                    // Dropping the last entry empties the leaf entirely.
                    return Ok(RemoveStep::BecameEmpty { prior });
                }
                if in_place {
                    let mut m = unsafe { BinaryMut::from_header(header) };
                    m.remove(i);
                    unsafe { base_of_mut(header) }.descendants -= 1;
                    self.release_displaced(old);
                    return Ok(RemoveStep::InPlace { prior });
                }
                let node = self.rebuild_binary(b, b.prefix(), None, Some(i), -1)?;
                Ok(RemoveStep::Replaced { node, prior })
            }
            AnyNode::Value(_) => Ok(RemoveStep::NotFound),
            AnyNode::Setlist(_) | AnyNode::Full(_) => {
                if rest.is_empty() {
                    let Some(old) = node.base().eof_value() else {
                        return Ok(RemoveStep::NotFound);
                    };
                    let prior = self.read_value(old);
                    return self.drop_from_inner(addr, header, node, DropWhat::Eof, old, prior, in_place);
                }
                let byte = rest[0];
                let child = match node {
                    AnyNode::Setlist(s) => s.find_branch(byte).map(|i| (i, child_of(&s, i))),
                    AnyNode::Full(f) => {
                        f.find_branch(byte).map(|i| (i, f.child_for_byte(byte).unwrap()))
                    }
                    _ => unreachable!(),
                };
                let Some((local, child_addr)) = child else {
                    return Ok(RemoveStep::NotFound);
                };
                match self.remove_node(child_addr, &rest[1..])? {
                    RemoveStep::NotFound => Ok(RemoveStep::NotFound),
                    RemoveStep::InPlace { prior } => {
                        if in_place {
                            unsafe { base_of_mut(header) }.descendants -= 1;
                            return Ok(RemoveStep::InPlace { prior });
                        }
                        let node =
                            self.rebuild_inner(node, node.prefix(), BranchEdit::None, -1)?;
                        Ok(RemoveStep::Replaced { node, prior })
                    }
                    RemoveStep::Replaced {
                        node: new_child,
                        prior,
                    } => {
                        if in_place && new_child.region() == node.base().branch_region {
                            match node {
                                AnyNode::Setlist(_) => {
                                    let mut m = unsafe { SetlistMut::from_header(header) };
                                    m.replace_child(local, new_child.index());
                                }
                                AnyNode::Full(_) => {
                                    let mut m = unsafe { FullMut::from_header(header) };
                                    m.set_branch(byte, new_child.index());
                                }
                                _ => unreachable!(),
                            }
                            unsafe { base_of_mut(header) }.descendants -= 1;
                            self.release(child_addr);
                            return Ok(RemoveStep::InPlace { prior });
                        }
                        let node = self.rebuild_inner(
                            node,
                            node.prefix(),
                            BranchEdit::Replace(byte, new_child),
                            -1,
                        )?;
                        Ok(RemoveStep::Replaced { node, prior })
                    }
                    RemoveStep::BecameEmpty { prior } => self.drop_from_inner(
                        addr,
                        header,
                        node,
                        DropWhat::Branch(byte, local, child_addr),
                        ValueRef::Inline(b""),
                        prior,
                        in_place,
                    ),
                }
            }
        }
    }

    /// Remove the EOF value or a branch from an inner node, applying the
    /// structural refactor rules for what remains.
    #[allow(clippy::too_many_arguments)]
    fn drop_from_inner(
        &self,
        _addr: PtrAddress,
        header: &AllocHeader,
        node: AnyNode<'_>,
        what: DropWhat,
        old_eof: ValueRef<'_>,
        prior: Value,
        in_place: bool,
    ) -> Result<RemoveStep> {
        let branches_after = match what {
            DropWhat::Eof => node.num_branches(),
            DropWhat::Branch(..) => node.num_branches() - 1,
        };
        let eof_after = match what {
            DropWhat::Eof => false,
            DropWhat::Branch(..) => node.base().has_eof_value(),
        };

        if branches_after == 0 && !eof_after {
            // Nothing left below this node at all.
            return Ok(RemoveStep::BecameEmpty { prior });
        }

        if branches_after == 1 && !eof_after {
            // Collapse: absorb the single remaining child, folding its
            // branch byte into the prefix.
            let (byte, child) = self.sole_remaining_branch(&node, &what);
            let child_header = self.deref(child);
            let child_node = unsafe { AnyNode::from_header(child_header) };
            let mut new_prefix = Vec::with_capacity(node.prefix().len() + 1 + child_node.prefix().len());
            new_prefix.extend_from_slice(node.prefix());
            new_prefix.push(byte);
            new_prefix.extend_from_slice(child_node.prefix());
            let collapsed = self.clone_with_prefix(child_node, &new_prefix)?;
            return Ok(RemoveStep::Replaced {
                node: collapsed,
                prior,
            });
        }

        let demote_full = matches!(node, AnyNode::Full(_)) && branches_after < FULL_NODE_THRESHOLD;
        if in_place && !demote_full {
            match what {
                DropWhat::Eof => {
                    let base = unsafe { base_of_mut(header) };
                    base.clear_eof_value();
                    base.descendants -= 1;
                    self.release_displaced(old_eof);
                }
                DropWhat::Branch(byte, local, child_addr) => {
                    match node {
                        AnyNode::Setlist(_) => {
                            let mut m = unsafe { SetlistMut::from_header(header) };
                            m.remove_branch(local);
                        }
                        AnyNode::Full(_) => {
                            let mut m = unsafe { FullMut::from_header(header) };
                            m.clear_branch(byte);
                        }
                        _ => unreachable!(),
                    }
                    unsafe { base_of_mut(header) }.descendants -= 1;
                    self.release(child_addr);
                }
            }
            return Ok(RemoveStep::InPlace { prior });
        }

        let edit = match what {
            DropWhat::Eof => BranchEdit::ClearEof,
            DropWhat::Branch(byte, ..) => BranchEdit::Remove(byte),
        };
        let node = self.rebuild_inner(node, node.prefix(), edit, -1)?;
        Ok(RemoveStep::Replaced { node, prior })
    }

    fn sole_remaining_branch(&self, node: &AnyNode<'_>, what: &DropWhat) -> (u8, PtrAddress) {
        let skip = match what {
            DropWhat::Branch(byte, ..) => Some(*byte),
            DropWhat::Eof => None,
        };
        match node {
            AnyNode::Setlist(s) => {
                for (i, &b) in s.setlist().iter().enumerate() {
                    if Some(b) != skip {
                        let local = LocalIndex((i + s.base().has_eof_value() as usize) as u16);
                        return (b, child_of(s, local));
                    }
                }
                unreachable!("setlist lost its last branch")
            }
            AnyNode::Full(f) => {
                for b in 0..=255u8 {
                    if Some(b) == skip {
                        continue;
                    }
                    if let Some(c) = f.child_for_byte(b) {
                        return (b, c);
                    }
                }
                unreachable!("full node lost its last branch")
            }
            _ => unreachable!(),
        }
    }

    // ==================================================================
    // Node construction

    /// Whether `addr`'s object may be mutated in place: uniquely
    /// referenced, in this session's current segment, page unfrozen.
    fn may_modify_in_place(&self, addr: PtrAddress) -> bool {
        let cb = self.engine.alloc.ctrl.get(addr);
        let data = cb.load(std::sync::atomic::Ordering::Acquire);
        data.ref_count() == 1 && self.can_modify(data.loc())
    }

    /// Turn a pending value into a leaf-entry value, allocating a value
    /// node when it is too big to inline.
    fn place_leaf_value<'v>(&self, pv: PendingValue<'v>) -> Result<ValueRef<'v>> {
        match pv {
            PendingValue::Bytes(b) if b.len() <= MAX_INLINE_VALUE => Ok(ValueRef::Inline(b)),
            PendingValue::Bytes(b) => Ok(ValueRef::ValueNode(self.alloc_value(b)?)),
            PendingValue::Subtree(addr) => {
                while !self.retain(addr) {
                    std::hint::spin_loop();
                }
                Ok(ValueRef::Subtree(addr))
            }
        }
    }

    /// EOF slots on inner nodes always hold an address.
    fn place_eof_value(&self, pv: PendingValue<'_>) -> Result<(PtrAddress, bool)> {
        match pv {
            PendingValue::Bytes(b) => Ok((self.alloc_value(b)?, false)),
            PendingValue::Subtree(addr) => {
                while !self.retain(addr) {
                    std::hint::spin_loop();
                }
                Ok((addr, true))
            }
        }
    }

    /// Copy a value out for returning to the caller.
    pub(crate) fn read_value(&self, v: ValueRef<'_>) -> Value {
        match v {
            ValueRef::Inline(b) => Value::Bytes(b.to_vec()),
            ValueRef::ValueNode(a) => {
                let header = self.deref(a);
                let view = unsafe { ValueView::from_header(header) };
                Value::Bytes(view.value().to_vec())
            }
            ValueRef::Subtree(a) => {
                while !self.retain(a) {
                    std::hint::spin_loop();
                }
                Value::Subtree(NodeHandle::new(self.engine.clone(), a))
            }
        }
    }

    /// Drop the reference an in-place-modified node held on a displaced
    /// value.
    fn release_displaced(&self, v: ValueRef<'_>) {
        match v {
            ValueRef::Inline(_) => {}
            ValueRef::ValueNode(a) | ValueRef::Subtree(a) => self.release(a),
        }
    }

    fn alloc_value(&self, bytes: &[u8]) -> Result<PtrAddress> {
        let size = ValueBuilder::size_for(bytes.len());
        let mut obj = self.alloc_object(size, TYPE_VALUE, &[])?;
        unsafe { ValueBuilder::build(obj.bytes(), bytes) };
        self.finish_node(&mut obj);
        let addr = obj.seq.address;
        obj.publish();
        Ok(addr)
    }

    fn finish_node(&self, obj: &mut crate::allocator::ObjectAlloc<'_>) {
        if self.engine.alloc.config.update_checksum_on_modify {
            let h = unsafe { &mut *(obj.bytes().as_mut_ptr() as *mut AllocHeader) };
            unsafe { h.update_checksum() };
        }
    }

    /// Allocate a binary node. `entries` must be key-sorted; every
    /// address in `entries` must already be owned by the caller (the
    /// reference transfers into the node).
    fn alloc_binary(
        &self,
        prefix: &[u8],
        entries: &[(&[u8], ValueRef<'_>)],
        descendants: u32,
        hint: &[PtrAddress],
    ) -> Result<PtrAddress> {
        let size = BinaryBuilder::size_for(
            prefix.len(),
            entries.iter().copied(),
            BINARY_CLONE_SLACK,
        );
        let mut obj = self.alloc_object(size, TYPE_BINARY, hint)?;
        unsafe { BinaryBuilder::build(obj.bytes(), prefix, entries, descendants) };
        self.finish_node(&mut obj);
        let addr = obj.seq.address;
        obj.publish();
        Ok(addr)
    }

    /// Allocate an inner node over `branches`, resolving them into one
    /// shared 16-bit region (migrating stragglers when the hints could
    /// not keep them together). Branch addresses must be caller-owned.
    fn alloc_setlist(
        &self,
        prefix: &[u8],
        branches: &[(u8, PtrAddress)],
        eof: Option<(PtrAddress, bool)>,
        descendants: u32,
    ) -> Result<PtrAddress> {
        let (region, resolved) = self.resolve_region(branches)?;
        if resolved.len() >= FULL_NODE_THRESHOLD {
            let size = FullBuilder::size_for(prefix.len());
            let mut obj = self.alloc_object(size, TYPE_FULL, &[])?;
            unsafe { FullBuilder::build(obj.bytes(), prefix, region, &resolved, eof, descendants) };
            self.finish_node(&mut obj);
            let addr = obj.seq.address;
            obj.publish();
            return Ok(addr);
        }
        let size = SetlistBuilder::size_for(prefix.len(), resolved.len(), 2);
        let mut obj = self.alloc_object(size, TYPE_SETLIST, &[])?;
        unsafe { SetlistBuilder::build(obj.bytes(), prefix, region, &resolved, eof, descendants) };
        self.finish_node(&mut obj);
        let addr = obj.seq.address;
        obj.publish();
        Ok(addr)
    }

    /// Pick the majority region among `branches` and move the rest into
    /// it, returning `(region, (byte, index))` pairs.
    fn resolve_region(&self, branches: &[(u8, PtrAddress)]) -> Result<(u16, Vec<(u8, u16)>)> {
        let mut counts: Vec<(u16, usize)> = Vec::new();
        for (_, a) in branches {
            match counts.iter_mut().find(|(r, _)| *r == a.region()) {
                Some((_, c)) => *c += 1,
                None => counts.push((a.region(), 1)),
            }
        }
        let region = counts
            .iter()
            .max_by_key(|(_, c)| *c)
            .map(|(r, _)| *r)
            .unwrap_or(0);
        let mut resolved = Vec::with_capacity(branches.len());
        for &(byte, a) in branches {
            let a = if a.region() == region {
                a
            } else {
                self.copy_object_to_region(a, region)?
            };
            resolved.push((byte, a.index()));
        }
        Ok((region, resolved))
    }

    /// Copy one object into a fresh address in `region`, releasing the
    /// caller's reference on the old address. The copy shares (and so
    /// retains) the old object's children.
    fn copy_object_to_region(&self, addr: PtrAddress, region: u16) -> Result<PtrAddress> {
        let header = self.deref(addr);
        let size = header.size() as usize;
        let Some((seq, cb)) = self.engine.alloc.ctrl.alloc_in_region(region) else {
            return Err(Error::OutOfAddresses);
        };
        let (view, seg, pos, rounded) = match self.alloc_space_raw(size) {
            Ok(x) => x,
            Err(e) => {
                cb.force(crate::control::Location::from_offset(0), 0);
                self.engine.alloc.ctrl.free(seq.address);
                return Err(e);
            }
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                header as *const AllocHeader as *const u8,
                view.at(pos),
                size,
            );
            // Stamp the copy with its own identity.
            let new_header = &mut *(view.at(pos) as *mut AllocHeader);
            *new_header = AllocHeader::new(rounded as u32, header.type_tag(), seq);
            let copied_tail = &*(view.at(pos) as *const AllocHeader);
            // Children are now shared with the original; each gains a ref.
            let vt = &crate::vtables()[header.type_tag() as usize];
            (vt.visit_children)(copied_tail, &mut |child| {
                while !self.retain(child) {
                    std::hint::spin_loop();
                }
            });
        }
        let loc = crate::control::Location::from_offset(seg * crate::SEGMENT_SIZE + pos as u64);
        cb.publish(loc, 1);
        self.release(addr);
        Ok(seq.address)
    }

    /// Clone any node with a different prefix, retaining everything it
    /// references.
    fn clone_with_prefix(&self, node: AnyNode<'_>, new_prefix: &[u8]) -> Result<PtrAddress> {
        match node {
            AnyNode::Binary(b) => {
                let entries: Vec<(&[u8], ValueRef)> =
                    b.entries().map(|e| (e.key, e.value)).collect();
                for (_, v) in &entries {
                    self.retain_value(*v);
                }
                self.alloc_binary(new_prefix, &entries, node.descendants(), &[])
            }
            AnyNode::Setlist(_) | AnyNode::Full(_) => {
                self.rebuild_inner(node, new_prefix, BranchEdit::None, 0)
            }
            AnyNode::Value(v) => {
                // Value nodes carry no prefix; a collapse onto one can't
                // happen (they only appear behind EOF slots).
                let _ = v;
                Err(Error::Corruption("attempted to re-prefix a value node"))
            }
        }
    }

    fn retain_value(&self, v: ValueRef<'_>) {
        match v {
            ValueRef::Inline(_) => {}
            ValueRef::ValueNode(a) | ValueRef::Subtree(a) => {
                while !self.retain(a) {
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Rebuild a binary node with an optional entry upsert and an
    /// optional entry removal. Existing entry values are retained;
    /// `upsert`'s value address (if any) transfers in caller-owned.
    fn rebuild_binary(
        &self,
        b: BinaryView<'_>,
        prefix: &[u8],
        upsert: Option<(&[u8], ValueRef<'_>)>,
        remove: Option<LocalIndex>,
        delta: i64,
    ) -> Result<PtrAddress> {
        let mut entries: Vec<(&[u8], ValueRef)> = Vec::with_capacity(b.num_entries() + 1);
        for (i, e) in b.entries().enumerate() {
            if Some(LocalIndex(i as u16)) == remove {
                continue;
            }
            entries.push((e.key, e.value));
        }
        if let Some((k, v)) = upsert {
            let pos = entries.partition_point(|(ek, _)| *ek < k);
            entries.insert(pos, (k, v));
        }
        for (i, (_, v)) in entries.iter().enumerate() {
            // Skip the caller-owned upsert value; everything copied from
            // the source gains a reference.
            if let Some((k, _)) = upsert {
                if entries[i].0 == k {
                    continue;
                }
            }
            self.retain_value(*v);
        }
        let descendants = (b.base().descendants as i64 + delta) as u32;
        self.alloc_binary(prefix, &entries, descendants, &[])
    }

    /// Rebuild an inner node applying one branch edit. Children copied
    /// from the source are retained; addresses inside `edit` transfer
    /// in caller-owned.
    fn rebuild_inner(
        &self,
        node: AnyNode<'_>,
        prefix: &[u8],
        edit: BranchEdit,
        delta: i64,
    ) -> Result<PtrAddress> {
        let mut branches: Vec<(u8, PtrAddress)> = Vec::with_capacity(node.num_branches() + 1);
        let mut eof = node
            .base()
            .eof_value()
            .map(|v| match v {
                ValueRef::ValueNode(a) => (a, false),
                ValueRef::Subtree(a) => (a, true),
                ValueRef::Inline(_) => unreachable!("inner EOF is always an address"),
            });
        let mut eof_owned = false;

        collect_branches(&node, &mut branches);
        for (_, a) in branches.iter() {
            while !self.retain(*a) {
                std::hint::spin_loop();
            }
        }
        match edit {
            BranchEdit::None => {}
            BranchEdit::Replace(byte, new_child) => {
                let slot = branches.iter_mut().find(|(b, _)| *b == byte).unwrap();
                // Drop the retain we just took on the displaced child.
                self.release(slot.1);
                slot.1 = new_child;
            }
            BranchEdit::Insert(byte, new_child) => {
                let pos = branches.partition_point(|(b, _)| *b < byte);
                branches.insert(pos, (byte, new_child));
            }
            BranchEdit::Remove(byte) => {
                let pos = branches.iter().position(|(b, _)| *b == byte).unwrap();
                let (_, displaced) = branches.remove(pos);
                self.release(displaced);
            }
            BranchEdit::SetEof(addr, subtree) => {
                eof = Some((addr, subtree));
                eof_owned = true;
            }
            BranchEdit::ClearEof => {
                eof = None;
            }
        }
        if let Some((a, _)) = eof {
            if !eof_owned {
                while !self.retain(a) {
                    std::hint::spin_loop();
                }
            }
        }
        let descendants = (node.descendants() as i64 + delta) as u32;
        self.alloc_setlist(prefix, &branches, eof, descendants)
    }

    /// Split an over-threshold leaf into an inner node over new leaves,
    /// folding the triggering insert in along the way.
    fn split_binary(
        &self,
        b: BinaryView<'_>,
        new_key: &[u8],
        new_value: ValueRef<'_>,
    ) -> Result<PtrAddress> {
        struct OwnedEntry {
            key: Vec<u8>,
            value: OwnedValue,
        }
        enum OwnedValue {
            Inline(Vec<u8>),
            ValueNode(PtrAddress),
            Subtree(PtrAddress),
        }
        fn to_ref(v: &OwnedValue) -> ValueRef<'_> {
            match v {
                OwnedValue::Inline(b) => ValueRef::Inline(b.as_slice()),
                OwnedValue::ValueNode(a) => ValueRef::ValueNode(*a),
                OwnedValue::Subtree(a) => ValueRef::Subtree(*a),
            }
        }

        let mut all: Vec<OwnedEntry> = b
            .entries()
            .map(|e| OwnedEntry {
                key: e.key.to_vec(),
                value: match e.value {
                    ValueRef::Inline(v) => OwnedValue::Inline(v.to_vec()),
                    ValueRef::ValueNode(a) => OwnedValue::ValueNode(a),
                    ValueRef::Subtree(a) => OwnedValue::Subtree(a),
                },
            })
            .collect();
        let pos = all.partition_point(|e| e.key.as_slice() < new_key);
        all.insert(
            pos,
            OwnedEntry {
                key: new_key.to_vec(),
                value: match new_value {
                    ValueRef::Inline(v) => OwnedValue::Inline(v.to_vec()),
                    ValueRef::ValueNode(a) => OwnedValue::ValueNode(a),
                    ValueRef::Subtree(a) => OwnedValue::Subtree(a),
                },
            },
        );

        // Entries already share the node prefix; they may share more.
        let extra = all
            .iter()
            .skip(1)
            .fold(all[0].key.len(), |l, e| lcp_n(&all[0].key, &e.key, l));
        // Keys identical through `extra` except possibly the EOF key.
        let extra = all.iter().fold(extra, |l, e| l.min(e.key.len()));

        let mut prefix = b.prefix().to_vec();
        prefix.extend_from_slice(&all[0].key[..extra]);

        // EOF group: the key that ends exactly at the prefix.
        let mut eof = None;
        let mut groups: Vec<(u8, Vec<&OwnedEntry>)> = Vec::new();
        for e in &all {
            let suffix = &e.key[extra..];
            if suffix.is_empty() {
                let addr = match &e.value {
                    OwnedValue::Inline(bytes) => {
                        let a = self.alloc_value(bytes)?;
                        // Freshly allocated: owned, not retained again.
                        eof = Some((a, false));
                        continue;
                    }
                    OwnedValue::ValueNode(a) => (*a, false),
                    OwnedValue::Subtree(a) => (*a, true),
                };
                if !ptr_eq_new(&e.key, new_key) {
                    while !self.retain(addr.0) {
                        std::hint::spin_loop();
                    }
                }
                eof = Some(addr);
                continue;
            }
            let byte = suffix[0];
            match groups.last_mut() {
                Some((b, g)) if *b == byte => g.push(e),
                _ => groups.push((byte, vec![e])),
            }
        }

        let mut branches: Vec<(u8, PtrAddress)> = Vec::with_capacity(groups.len());
        for (byte, group) in &groups {
            // Each new leaf gets its own prefix compression pass.
            let sub = group
                .iter()
                .map(|e| &e.key[extra + 1..])
                .collect::<Vec<_>>();
            let sub_lcp = sub
                .iter()
                .skip(1)
                .fold(sub[0].len(), |l, s| lcp_n(sub[0], s, l));
            let sub_lcp = sub.iter().fold(sub_lcp, |l, s| l.min(s.len()));
            let mut entries: Vec<(&[u8], ValueRef)> = Vec::with_capacity(group.len());
            for e in group.iter() {
                let v = to_ref(&e.value);
                // Values moving from the old leaf into a new one gain a
                // reference; the triggering insert's value is already
                // caller-owned.
                if !ptr_eq_new(&e.key, new_key) {
                    self.retain_value(v);
                }
                entries.push((&e.key[extra + 1 + sub_lcp..], v));
            }
            let hint: Vec<PtrAddress> = branches.iter().map(|(_, a)| *a).collect();
            let leaf = self.alloc_binary(
                &sub[0][..sub_lcp],
                &entries,
                entries.len() as u32,
                &hint,
            )?;
            branches.push((*byte, leaf));
        }
        debug!(
            "leaf split: {} entries into {} branches under {}-byte prefix",
            all.len(),
            branches.len(),
            prefix.len()
        );
        self.alloc_setlist(&prefix, &branches, eof, all.len() as u32)
    }

    /// Build a cursor positioned before the first key of `root`'s tree.
    pub fn cursor(&self, root: usize) -> Result<cursor::Cursor<'_>> {
        cursor::Cursor::new(self, root)
    }
}

/// An in-flight root transaction; holds the slot's writer mutex.
/// Dropping without [`Self::commit`] aborts.
pub struct RootTransactionGuard<'s> {
    session: &'s Session,
    txn: Option<crate::roots::RootTransaction<'s>>,
    start: Option<NodeHandle>,
}

impl RootTransactionGuard<'_> {
    /// The root as it stood when the transaction began.
    pub fn start(&self) -> Option<&NodeHandle> {
        self.start.as_ref()
    }

    /// Install `new` as the slot's root and release the writer mutex.
    /// Returns the displaced root.
    pub fn commit(
        mut self,
        new: Option<&NodeHandle>,
        level: crate::SyncLevel,
    ) -> Result<Option<NodeHandle>> {
        let new_addr = match new {
            Some(h) => {
                while !self.session.retain(h.address()) {
                    std::hint::spin_loop();
                }
                h.address()
            }
            None => PtrAddress::NULL,
        };
        self.session.commit(level)?;
        let prior = self.txn.take().unwrap().commit(new_addr, level)?;
        Ok(if prior.is_null() {
            None
        } else {
            Some(NodeHandle::new(self.session.engine.clone(), prior))
        })
    }

    /// Release the writer mutex without touching the slot.
    pub fn abort(self) {}
}

enum DropWhat {
    Eof,
    /// (branch byte, local index, child address)
    Branch(u8, LocalIndex, PtrAddress),
}

enum BranchEdit {
    None,
    Replace(u8, PtrAddress),
    Insert(u8, PtrAddress),
    Remove(u8),
    SetEof(PtrAddress, bool),
    ClearEof,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    let max = MAX_OBJECT_SIZE as usize - 64;
    if value.len() > max {
        return Err(Error::ValueTooLarge {
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn lcp_n(a: &[u8], b: &[u8], limit: usize) -> usize {
    lcp(&a[..limit.min(a.len())], b)
}

fn child_of(s: &SetlistView<'_>, i: LocalIndex) -> PtrAddress {
    match s.branch_target(i) {
        BranchTarget::Child(c) => c,
        BranchTarget::Leaf(_) => unreachable!("branch index resolved to the EOF slot"),
    }
}

fn collect_branches(node: &AnyNode<'_>, out: &mut Vec<(u8, PtrAddress)>) {
    match node {
        AnyNode::Setlist(s) => {
            let eof = s.base().has_eof_value() as usize;
            for (i, &b) in s.setlist().iter().enumerate() {
                out.push((b, child_of(s, LocalIndex((i + eof) as u16))));
            }
        }
        AnyNode::Full(f) => {
            for b in 0..=255u8 {
                if let Some(c) = f.child_for_byte(b) {
                    out.push((b, c));
                }
            }
        }
        _ => unreachable!(),
    }
}

fn ptr_eq_new(key: &[u8], new_key: &[u8]) -> bool {
    key == new_key
}

fn value_encoded_len(v: ValueRef<'_>) -> usize {
    match v {
        ValueRef::Inline(b) => b.len(),
        _ => 4,
    }
}
