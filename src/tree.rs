//! The data-access tree: a single owned byte buffer plus an arena of
//! stable-index "slots" describing every outstanding view into it.
//!
//! The C original links slots directly via raw `parent`/`children`
//! pointers into the buffer itself, which is why it has to pick one of
//! two buggy orderings when the buffer reallocates (see spec.md §9).
//! Indexing into a `Vec<Option<NodeSlot>>` by a stable `usize` instead
//! means a realloc never invalidates a slot reference, and letting
//! `RefCell` enforce "no mutation while a view is borrowed" turns that
//! hazard into a panic instead of a dangling pointer.

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use crate::codec::{self, Tag};
use crate::error::Error;
use crate::term::Term;

/// `"0:}"`, the shortest possible well-formed dictionary tnetstring.
pub const MIN_ROOT_LEN: usize = 3;

const ROOT: usize = 0;

#[derive(Debug)]
struct NodeSlot {
    offset: usize,
    length: usize,
    parent: Option<usize>,
    children: SmallVec<[usize; 4]>,
    ref_count: u32,
}

/// The owned buffer and the arena of views into it. Never exposed
/// directly; reached only through [`DataAccess`] handles.
#[derive(Debug)]
pub(crate) struct Tree {
    pub(crate) buffer: Vec<u8>,
    slots: Vec<Option<NodeSlot>>,
    free: Vec<usize>,
}

impl Tree {
    fn slot(&self, idx: usize) -> &NodeSlot {
        self.slots[idx]
            .as_ref()
            .expect("operated on a freed arena slot")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut NodeSlot {
        self.slots[idx]
            .as_mut()
            .expect("operated on a freed arena slot")
    }

    fn node_range(&self, idx: usize) -> std::ops::Range<usize> {
        let s = self.slot(idx);
        s.offset..s.offset + s.length
    }

    fn alloc_slot(&mut self, slot: NodeSlot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    /// Walks from `idx` up to the root, checking that every step is
    /// still registered in its parent's children list. `ROOT` is always
    /// valid; anything whose chain hits a `None` parent before reaching
    /// `ROOT` has been orphaned.
    pub(crate) fn is_valid(&self, idx: usize) -> bool {
        if idx == ROOT {
            return true;
        }
        let mut child = idx;
        loop {
            let parent = match self.slots.get(child).and_then(|s| s.as_ref()).and_then(|s| s.parent) {
                Some(p) => p,
                None => return false,
            };
            let parent_slot = match self.slots.get(parent).and_then(|s| s.as_ref()) {
                Some(s) => s,
                None => return false,
            };
            if !parent_slot.children.contains(&child) {
                return false;
            }
            if parent == ROOT {
                return true;
            }
            child = parent;
        }
    }

    fn term_total_len(&self, start: usize, end_bound: usize) -> Result<usize, Error> {
        let (payload_len, colon_index) = codec::parse_prefix(&self.buffer[start..end_bound])?;
        Ok(colon_index + 1 + payload_len + 1)
    }

    /// Finds `key` among `idx`'s dictionary entries. Returns the absolute
    /// offsets of the key term's start, the value term's start, and the
    /// value term's total encoded length.
    fn find_key(&self, idx: usize, key: &[u8]) -> Result<(usize, usize, usize), Error> {
        let range = self.node_range(idx);
        let (payload_len, colon_index) = codec::parse_prefix(&self.buffer[range.clone()])?;
        let payload_start = range.start + colon_index + 1;
        let payload_end = payload_start + payload_len;

        let mut cursor = payload_start;
        while cursor < payload_end {
            let (klen, kcolon) = codec::parse_prefix(&self.buffer[cursor..payload_end])?;
            let kpayload_start = cursor + kcolon + 1;
            let key_total = kcolon + 1 + klen + 1;
            let value_start = cursor + key_total;
            let value_total = self.term_total_len(value_start, payload_end)?;

            if klen == key.len() && &self.buffer[kpayload_start..kpayload_start + klen] == key {
                return Ok((cursor, value_start, value_total));
            }
            cursor = value_start + value_total;
        }
        Err(Error::KeyNotFound)
    }

    /// Computes Σ: the total byte delta the whole buffer would see if
    /// `idx`'s own payload changed by `content_delta`, after every
    /// ancestor's length prefix is re-counted in turn.
    fn total_length_delta(&self, idx: usize, content_delta: i64) -> i64 {
        let range = self.node_range(idx);
        let (payload_len, _) = codec::parse_prefix(&self.buffer[range]).expect("node holds a well-formed term");
        let old_prefix = codec::digit_count(payload_len) as i64;
        let new_payload_len = (payload_len as i64 + content_delta).max(0) as usize;
        let new_prefix = codec::digit_count(new_payload_len) as i64;
        let combined = (new_prefix - old_prefix) + content_delta;
        match self.slot(idx).parent {
            Some(parent) => self.total_length_delta(parent, combined),
            None => combined,
        }
    }

    /// Rewrites `idx`'s own length prefix (and every ancestor's, in
    /// turn) to reflect `content_delta`, shifting bytes between a
    /// stale colon and the rest of the buffer wherever a prefix's digit
    /// width changes. The buffer must already be large enough to hold
    /// the final size before this is called (growth resizes first;
    /// shrinkage truncates only after this returns). Returns Σ.
    fn update_prefixes(&mut self, idx: usize, mut content_delta: i64) -> Result<i64, Error> {
        let mut cur = idx;
        let mut prior_shifts: i64 = 0;
        loop {
            let range = self.node_range(cur);
            let (payload_len, colon_index) = codec::parse_prefix(&self.buffer[range.clone()])?;
            let colon_abs = range.start + colon_index;
            let old_prefix = colon_index;
            let new_payload_len = (payload_len as i64 + content_delta) as usize;
            let new_prefix = codec::digit_count(new_payload_len);
            let prefix_delta = new_prefix as i64 - old_prefix as i64;

            if prefix_delta != 0 {
                let shift_end = (self.slot(ROOT).length as i64 + prior_shifts) as usize;
                self.buffer
                    .copy_within(colon_abs..shift_end, (colon_abs as i64 + prefix_delta) as usize);
            }

            let digits = new_payload_len.to_string();
            self.buffer[range.start..range.start + new_prefix].copy_from_slice(digits.as_bytes());
            self.buffer[range.start + new_prefix] = b':';

            self.slot_mut(cur).length = (self.slot(cur).length as i64 + content_delta + prefix_delta) as usize;

            if prefix_delta != 0 {
                self.update_offsets(prefix_delta, range.start);
            }

            match self.slot(cur).parent {
                Some(parent) => {
                    prior_shifts += prefix_delta;
                    content_delta += prefix_delta;
                    cur = parent;
                }
                None => return Ok(content_delta + prefix_delta),
            }
        }
    }

    /// Shifts every slot's recorded offset by `delta` if it lies after
    /// `point_of_change`. A prefix growing or shrinking anywhere in the
    /// tree moves every byte after it, regardless of which subtree that
    /// byte belongs to.
    fn update_offsets(&mut self, delta: i64, point_of_change: usize) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.offset > point_of_change {
                slot.offset = (slot.offset as i64 + delta) as usize;
            }
        }
    }

    /// Opens (`delta > 0`) or closes (`delta < 0`) a gap of `|delta|`
    /// bytes at `tail_start`, propagating the prefix growth/shrinkage up
    /// from `idx` to the root. For `delta > 0` the opened gap begins at
    /// the (possibly ancestor-shifted) returned offset; for `delta < 0`
    /// the removed bytes are the `|delta|` bytes immediately before
    /// `tail_start`. This is the one routine both `set` and `remove`
    /// funnel through.
    #[instrument(skip(self))]
    fn resize_at(&mut self, idx: usize, tail_start: usize, delta: i64) -> Result<usize, Error> {
        if delta == 0 {
            return Ok(tail_start);
        }
        if delta > 0 {
            let sigma = self.total_length_delta(idx, delta);
            let new_len = (self.slot(ROOT).length as i64 + sigma) as usize;
            let extra = new_len.saturating_sub(self.buffer.len());
            self.buffer
                .try_reserve_exact(extra)
                .map_err(|_| Error::OutOfMemory)?;
            self.buffer.resize(new_len, 0);
            trace!(new_len, "grew root buffer");
        }

        let total_delta = self.update_prefixes(idx, delta)?;
        let shifted_tail_start = (tail_start as i64 + (total_delta - delta)) as usize;
        let tail_length = (self.slot(ROOT).length as i64 - delta - shifted_tail_start as i64) as usize;
        let dest_start = (shifted_tail_start as i64 + delta) as usize;
        self.buffer
            .copy_within(shifted_tail_start..shifted_tail_start + tail_length, dest_start);

        if delta < 0 {
            let new_len = self.slot(ROOT).length;
            self.buffer.truncate(new_len);
            self.buffer.shrink_to_fit();
            debug!(new_len, "shrank root buffer");
        }

        self.update_offsets(delta, shifted_tail_start);
        Ok(shifted_tail_start)
    }

    /// Drops the cached child view at `abs_offset`, if `idx` has one, so
    /// a stale handle left over from an overwritten value doesn't keep
    /// pointing at bytes that no longer hold a dictionary.
    fn orphan_child_at(&mut self, idx: usize, abs_offset: usize) {
        let mut found = None;
        for (pos, &c) in self.slot(idx).children.iter().enumerate() {
            if self.slots[c].as_ref().map_or(false, |s| s.offset == abs_offset) {
                found = Some((pos, c));
                break;
            }
        }
        if let Some((pos, child)) = found {
            self.slot_mut(idx).children.remove(pos);
            if let Some(s) = self.slots[child].as_mut() {
                s.parent = None;
            }
            trace!(child, "orphaned cached child on overwrite");
        }
    }

    fn do_update(&mut self, idx: usize, key: &[u8], old_value_start: usize, old_total: usize, new_bytes: &[u8]) -> Result<(), Error> {
        self.orphan_child_at(idx, old_value_start);
        let new_total = new_bytes.len();
        let delta = new_total as i64 - old_total as i64;
        if delta == 0 {
            self.buffer[old_value_start..old_value_start + old_total].copy_from_slice(new_bytes);
            return Ok(());
        }
        let tail_start = old_value_start + old_total;
        self.resize_at(idx, tail_start, delta)?;
        let (_, new_value_start, _) = self.find_key(idx, key)?;
        self.buffer[new_value_start..new_value_start + new_total].copy_from_slice(new_bytes);
        Ok(())
    }

    fn do_add(&mut self, idx: usize, key: &[u8], value_bytes: &[u8]) -> Result<(), Error> {
        let key_term = Term::create(key, Tag::String)?;
        let key_bytes = key_term.as_bytes().to_vec();

        let close_brace = self.node_range(idx).end - 1;
        self.resize_at(idx, close_brace, key_bytes.len() as i64)?;
        let key_at = self.slot(idx).offset + self.slot(idx).length - 1 - key_bytes.len();
        self.buffer[key_at..key_at + key_bytes.len()].copy_from_slice(&key_bytes);

        let close_brace = self.slot(idx).offset + self.slot(idx).length - 1;
        self.resize_at(idx, close_brace, value_bytes.len() as i64)?;
        let val_at = self.slot(idx).offset + self.slot(idx).length - 1 - value_bytes.len();
        self.buffer[val_at..val_at + value_bytes.len()].copy_from_slice(value_bytes);
        Ok(())
    }

    fn do_remove(&mut self, idx: usize, key: &[u8]) -> Result<(), Error> {
        let (key_start, value_start, value_total) = self.find_key(idx, key)?;
        self.orphan_child_at(idx, value_start);
        let tail_start = value_start + value_total;
        let delta = key_start as i64 - tail_start as i64;
        self.resize_at(idx, tail_start, delta)?;
        Ok(())
    }
}

/// A handle onto one dictionary-typed node inside a shared [`Tree`].
/// Cloning bumps a reference count; dropping the last handle to a node
/// orphans that node's own direct children (they remain individually
/// valid until *their* last handle drops, just disconnected from the
/// root). All mutating methods (`set`, `remove`) take `&self`: the
/// actual exclusivity check happens at runtime via the `RefCell`, which
/// panics if a [`Term`] borrowed from this tree (via `get`/`as_term`) is
/// still alive — see spec.md §5's single-writer hazard.
pub struct DataAccess {
    tree: Rc<RefCell<Tree>>,
    index: usize,
}

impl DataAccess {
    /// Validates `bytes` as a single well-formed, top-level dictionary
    /// tnetstring spanning exactly `bytes` (no trailing garbage), copies
    /// it, and returns a handle to its root.
    #[instrument(skip(bytes), fields(len = bytes.len()))]
    pub fn create(bytes: &[u8]) -> Result<DataAccess, Error> {
        if bytes.len() < MIN_ROOT_LEN {
            return Err(Error::InvalidTNetstring {
                offset: 0,
                reason: "shorter than the minimum root document",
            });
        }
        let term = Term::create_nested(bytes)?;
        if term.total_len() != bytes.len() {
            return Err(Error::InvalidTNetstring {
                offset: term.total_len(),
                reason: "trailing bytes after the top-level term",
            });
        }
        if term.tag() != Tag::Dictionary {
            return Err(Error::UnsupportedTopLevelDataStructure {
                found: term.tag().as_byte(),
            });
        }
        drop(term);

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes.len())
            .map_err(|_| Error::OutOfMemory)?;
        buffer.extend_from_slice(bytes);

        let root_slot = NodeSlot {
            offset: 0,
            length: bytes.len(),
            parent: None,
            children: SmallVec::new(),
            ref_count: 1,
        };
        let tree = Tree {
            buffer,
            slots: vec![Some(root_slot)],
            free: Vec::new(),
        };
        Ok(DataAccess {
            tree: Rc::new(RefCell::new(tree)),
            index: ROOT,
        })
    }

    fn handle_for(tree_rc: &Rc<RefCell<Tree>>, idx: usize) -> DataAccess {
        tree_rc.borrow_mut().slot_mut(idx).ref_count += 1;
        DataAccess {
            tree: Rc::clone(tree_rc),
            index: idx,
        }
    }

    /// `true` unless this node has been orphaned (an ancestor was
    /// overwritten, or this node's parent's own path to the root broke).
    pub fn is_valid(&self) -> bool {
        self.tree.borrow().is_valid(self.index)
    }

    /// Byte offset of this node's own encoded term within the root
    /// buffer. Only meaningful while [`is_valid`](Self::is_valid) holds.
    pub fn offset(&self) -> usize {
        self.tree.borrow().slot(self.index).offset
    }

    pub fn get_root(&self) -> DataAccess {
        Self::handle_for(&self.tree, ROOT)
    }

    /// `None` for the root, and `None` for a node that has been
    /// orphaned (its link to its former parent was severed).
    pub fn parent(&self) -> Option<DataAccess> {
        let parent_idx = self.tree.borrow().slot(self.index).parent;
        parent_idx.map(|p| Self::handle_for(&self.tree, p))
    }

    /// Currently cached direct children (nodes reached through a prior
    /// `create_nested` call on this node that haven't been orphaned).
    pub fn children(&self) -> Vec<DataAccess> {
        let indices: SmallVec<[usize; 4]> = self.tree.borrow().slot(self.index).children.clone();
        indices.into_iter().map(|i| Self::handle_for(&self.tree, i)).collect()
    }

    /// This node's own encoded term, as a zero-copy view. Held alive,
    /// the returned [`Term`] blocks `set`/`remove`/`create_nested` on
    /// this same tree via `RefCell`'s runtime borrow check.
    pub fn as_term(&self) -> Result<Term<'_>, Error> {
        if !self.is_valid() {
            return Err(Error::InvalidChild);
        }
        let guard = self.tree.borrow();
        let range = guard.node_range(self.index);
        let (payload_len, colon_index) = codec::parse_prefix(&guard.buffer[range.clone()])?;
        Ok(Term::from_tracked(guard, range.start, range.end, Tag::Dictionary, colon_index + 1, payload_len))
    }

    /// Looks up `key` in this dictionary. The returned [`Term`] is a
    /// zero-copy view; see [`as_term`](Self::as_term) for the borrow
    /// implications.
    #[instrument(skip(self))]
    pub fn get(&self, key: &[u8]) -> Result<Term<'_>, Error> {
        if !self.is_valid() {
            return Err(Error::InvalidChild);
        }
        let guard = self.tree.borrow();
        let (_, value_start, value_total) = guard.find_key(self.index, key)?;
        let value_end = value_start + value_total;
        let (payload_len, colon_index) = codec::parse_prefix(&guard.buffer[value_start..value_end])?;
        let tag_byte = guard.buffer[value_end - 1];
        let tag = Tag::from_byte(tag_byte).ok_or(Error::InvalidTNetstring {
            offset: value_end - 1,
            reason: "invalid type tag byte",
        })?;
        Ok(Term::from_tracked(guard, value_start, value_end, tag, colon_index + 1, payload_len))
    }

    /// Sets `key` to `value`, inserting it if absent. `value` is always
    /// copied out to an owned buffer first (even when it doesn't alias
    /// this tree) so that a `Term` obtained from `self.get(..)` can be
    /// passed straight back in without tripping the `RefCell` borrow
    /// check — simpler, and strictly safer, than only copying when an
    /// alias is actually detected.
    #[instrument(skip(self, value))]
    pub fn set(&self, key: &[u8], value: Term) -> Result<(), Error> {
        if !self.is_valid() {
            return Err(Error::InvalidChild);
        }
        let bytes = value.as_bytes().to_vec();
        drop(value);

        let mut tree = self.tree.borrow_mut();
        match tree.find_key(self.index, key) {
            Ok((_, value_start, value_total)) => tree.do_update(self.index, key, value_start, value_total, &bytes),
            Err(Error::KeyNotFound) => tree.do_add(self.index, key, &bytes),
            Err(e) => Err(e),
        }
    }

    /// Removes `key`. Errs with [`Error::KeyNotFound`] if absent.
    #[instrument(skip(self))]
    pub fn remove(&self, key: &[u8]) -> Result<(), Error> {
        if !self.is_valid() {
            return Err(Error::InvalidChild);
        }
        self.tree.borrow_mut().do_remove(self.index, key)
    }

    /// Returns a handle to the dictionary nested at `term`, reusing a
    /// cached handle if one is already registered for that exact byte
    /// range. `term` must be a dictionary-typed view obtained from this
    /// same tree (typically the result of `self.get(..)`).
    #[instrument(skip(self, term))]
    pub fn create_nested(&self, term: &Term) -> Result<DataAccess, Error> {
        if term.tag() != Tag::Dictionary {
            return Err(Error::InvalidArgument("create_nested requires a dictionary term"));
        }
        if !self.is_valid() {
            return Err(Error::InvalidChild);
        }
        let same_tree = {
            let mine = self.tree.borrow();
            term.tree_ptr() == Some(&*mine as *const Tree)
        };
        if !same_tree {
            return Err(Error::InvalidArgument("term does not belong to this data-access tree"));
        }
        let (abs_start, abs_end) = term
            .tracked_range()
            .expect("same_tree check above implies a tracked term");

        let mut tree = self.tree.borrow_mut();
        let self_range = tree.node_range(self.index);
        if abs_start < self_range.start || abs_start >= self_range.end {
            return Err(Error::InvalidArgument("nested term lies outside this node's current slice"));
        }

        if let Some(&existing) = tree
            .slot(self.index)
            .children
            .iter()
            .find(|&&c| tree.slots[c].as_ref().map_or(false, |s| s.offset == abs_start))
        {
            tree.slot_mut(existing).ref_count += 1;
            return Ok(DataAccess {
                tree: Rc::clone(&self.tree),
                index: existing,
            });
        }

        let new_slot = NodeSlot {
            offset: abs_start,
            length: abs_end - abs_start,
            parent: Some(self.index),
            children: SmallVec::new(),
            ref_count: 1,
        };
        let index = tree.alloc_slot(new_slot);
        tree.slot_mut(self.index).children.push(index);
        Ok(DataAccess {
            tree: Rc::clone(&self.tree),
            index,
        })
    }
}

impl Clone for DataAccess {
    fn clone(&self) -> Self {
        self.tree.borrow_mut().slot_mut(self.index).ref_count += 1;
        DataAccess {
            tree: Rc::clone(&self.tree),
            index: self.index,
        }
    }
}

impl Drop for DataAccess {
    fn drop(&mut self) {
        let mut tree = self.tree.borrow_mut();
        let ref_count = {
            let slot = tree.slot_mut(self.index);
            slot.ref_count -= 1;
            slot.ref_count
        };
        if ref_count > 0 {
            return;
        }

        let children: SmallVec<[usize; 4]> = tree.slot(self.index).children.clone();
        for c in children {
            if let Some(s) = tree.slots[c].as_mut() {
                s.parent = None;
            }
        }

        if self.index == ROOT {
            tree.slot_mut(ROOT).children.clear();
            return;
        }

        if let Some(parent) = tree.slot(self.index).parent {
            if let Some(p) = tree.slots[parent].as_mut() {
                p.children.retain(|&c| c != self.index);
            }
        }
        tree.slots[self.index] = None;
        tree.free.push(self.index);
    }
}
