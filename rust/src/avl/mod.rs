//! Height-balanced search tree over `(device, block)` keys.
//!
//! Nodes are not allocated by the tree: node `n` is the linkage of buffer
//! descriptor slot `n` of the owning pool, so the tree only ever stores slot
//! numbers and keys. Insertion and deletion walk the tree with an explicit,
//! bounded path stack instead of recursion.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::disk::DeviceId;

/// Bound on the path stacks. A height of 32 covers trees of several million
/// nodes in the worst insertion order.
pub const MAX_HEIGHT: usize = 32;

/// Cache key. Orders by device first, then by block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferKey {
    pub device: DeviceId,
    pub block: u64,
}

impl BufferKey {
    pub const fn new(device: DeviceId, block: u64) -> Self {
        BufferKey { device, block }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("key {0} is already indexed")]
    Duplicate(BufferKey),
    #[error("key {0} is not indexed")]
    Missing(BufferKey),
    #[error("slot {0} is not linked into the index")]
    NotLinked(usize),
    #[error("slot {0} is already linked into the index")]
    AlreadyLinked(usize),
    #[error("slot {0} is outside the index arena")]
    OutOfRange(usize),
    #[error("tree deeper than {MAX_HEIGHT} levels")]
    TooDeep,
    #[error("node {0} carries a balance factor its children contradict")]
    Unbalanced(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    key: Option<BufferKey>,
    left: Option<usize>,
    right: Option<usize>,
    // height(right) - height(left)
    balance: i8,
}

struct PathStack {
    items: [(usize, Dir); MAX_HEIGHT],
    len: usize,
}

impl PathStack {
    fn new() -> Self {
        PathStack {
            items: [(0, Dir::Left); MAX_HEIGHT],
            len: 0,
        }
    }

    fn push(&mut self, slot: usize, dir: Dir) -> Result<(), IndexError> {
        if self.len == MAX_HEIGHT {
            return Err(IndexError::TooDeep);
        }
        self.items[self.len] = (slot, dir);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<(usize, Dir)> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.items[self.len])
    }

    fn peek(&self) -> Option<(usize, Dir)> {
        self.len.checked_sub(1).map(|top| self.items[top])
    }

    fn get(&self, pos: usize) -> Option<(usize, Dir)> {
        (pos < self.len).then(|| self.items[pos])
    }

    fn set(&mut self, pos: usize, entry: (usize, Dir)) {
        self.items[pos] = entry;
    }
}

pub struct AvlIndex {
    nodes: Vec<Node>,
    root: Option<usize>,
    len: usize,
}

impl AvlIndex {
    /// An empty index able to link slots `0..slots`.
    pub fn with_capacity(slots: usize) -> Self {
        AvlIndex {
            nodes: vec![Node::default(); slots],
            root: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Key linked at `slot`, if the slot is in the tree.
    pub fn key(&self, slot: usize) -> Option<BufferKey> {
        self.nodes.get(slot).and_then(|n| n.key)
    }

    pub fn search(&self, key: BufferKey) -> Option<usize> {
        let mut cur = self.root;
        while let Some(n) = cur {
            let node = &self.nodes[n];
            match node.key.map(|k| key.cmp(&k)) {
                Some(Ordering::Equal) => return Some(n),
                Some(Ordering::Less) => cur = node.left,
                Some(Ordering::Greater) => cur = node.right,
                None => return None,
            }
        }
        None
    }

    pub fn insert(&mut self, slot: usize, key: BufferKey) -> Result<(), IndexError> {
        match self.nodes.get(slot) {
            None => return Err(IndexError::OutOfRange(slot)),
            Some(node) if node.key.is_some() => return Err(IndexError::AlreadyLinked(slot)),
            Some(_) => {}
        }

        let mut path = PathStack::new();
        let mut cur = self.root;
        while let Some(n) = cur {
            let dir = match key.cmp(&self.node_key(n)?) {
                Ordering::Equal => return Err(IndexError::Duplicate(key)),
                Ordering::Less => Dir::Left,
                Ordering::Greater => Dir::Right,
            };
            path.push(n, dir)?;
            cur = self.child(n, dir);
        }

        self.nodes[slot] = Node {
            key: Some(key),
            ..Node::default()
        };
        self.relink(path.peek(), Some(slot));
        self.len += 1;

        while let Some((n, dir)) = path.pop() {
            self.nodes[n].balance += match dir {
                Dir::Left => -1,
                Dir::Right => 1,
            };
            match self.nodes[n].balance {
                0 => break,
                1 | -1 => continue,
                _ => {
                    // One rotation restores the height the subtree had
                    // before the insert.
                    let (sub, _) = self.rebalance(n)?;
                    self.relink(path.peek(), Some(sub));
                    break;
                }
            }
        }
        Ok(())
    }

    /// Unlinks `slot`, returning the key it was indexed under.
    pub fn remove(&mut self, slot: usize) -> Result<BufferKey, IndexError> {
        let key = match self.nodes.get(slot) {
            None => return Err(IndexError::OutOfRange(slot)),
            Some(node) => node.key.ok_or(IndexError::NotLinked(slot))?,
        };

        let mut path = PathStack::new();
        let mut cur = self.root;
        let target = loop {
            let n = cur.ok_or(IndexError::Missing(key))?;
            match key.cmp(&self.node_key(n)?) {
                Ordering::Equal => break n,
                Ordering::Less => {
                    path.push(n, Dir::Left)?;
                    cur = self.nodes[n].left;
                }
                Ordering::Greater => {
                    path.push(n, Dir::Right)?;
                    cur = self.nodes[n].right;
                }
            }
        };
        if target != slot {
            return Err(IndexError::Missing(key));
        }

        let Node {
            left,
            right,
            balance,
            ..
        } = self.nodes[target];
        match (left, right) {
            (Some(l), Some(r)) => {
                // The in-order successor takes the target's place; the
                // height loss starts below it, on its right side.
                let target_pos = path.len;
                path.push(target, Dir::Right)?;
                let mut succ = r;
                while let Some(next) = self.nodes[succ].left {
                    path.push(succ, Dir::Left)?;
                    succ = next;
                }
                if succ != r {
                    if let Some((succ_parent, _)) = path.peek() {
                        self.nodes[succ_parent].left = self.nodes[succ].right;
                    }
                    self.nodes[succ].right = Some(r);
                }
                self.nodes[succ].left = Some(l);
                self.nodes[succ].balance = balance;
                path.set(target_pos, (succ, Dir::Right));
                let parent = target_pos.checked_sub(1).and_then(|pos| path.get(pos));
                self.relink(parent, Some(succ));
            }
            (child, None) | (None, child) => self.relink(path.peek(), child),
        }
        self.nodes[target] = Node::default();
        self.len -= 1;

        while let Some((n, dir)) = path.pop() {
            self.nodes[n].balance += match dir {
                Dir::Left => 1,
                Dir::Right => -1,
            };
            match self.nodes[n].balance {
                1 | -1 => break,
                0 => continue,
                _ => {
                    let (sub, shrunk) = self.rebalance(n)?;
                    self.relink(path.peek(), Some(sub));
                    if !shrunk {
                        break;
                    }
                }
            }
        }
        Ok(key)
    }

    /// Pruned depth-first scan for any node keyed inside
    /// `device/[lo, hi]` that `accept` agrees to. The first acceptable node
    /// found is returned, which is not necessarily the lowest one.
    pub fn find_in_range<F>(
        &self,
        device: DeviceId,
        lo: u64,
        hi: u64,
        mut accept: F,
    ) -> Result<Option<usize>, IndexError>
    where
        F: FnMut(usize) -> bool,
    {
        let low = BufferKey::new(device, lo);
        let high = BufferKey::new(device, hi);
        let mut pending = [0usize; MAX_HEIGHT];
        let mut depth = 0;
        let mut cur = self.root;
        loop {
            let n = match cur {
                Some(n) => n,
                None if depth == 0 => return Ok(None),
                None => {
                    depth -= 1;
                    pending[depth]
                }
            };
            let key = self.node_key(n)?;
            let node = &self.nodes[n];
            if key < low {
                cur = node.right;
            } else if key > high {
                cur = node.left;
            } else if accept(n) {
                return Ok(Some(n));
            } else {
                if let Some(r) = node.right {
                    if depth == MAX_HEIGHT {
                        return Err(IndexError::TooDeep);
                    }
                    pending[depth] = r;
                    depth += 1;
                }
                cur = node.left;
            }
        }
    }

    /// All linked `(key, slot)` pairs in key order.
    pub fn entries(&self) -> Vec<(BufferKey, usize)> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(n) = cur {
                stack.push(n);
                cur = self.nodes[n].left;
            }
            if let Some(n) = stack.pop() {
                if let Some(key) = self.nodes[n].key {
                    out.push((key, n));
                }
                cur = self.nodes[n].right;
            }
        }
        out
    }

    pub fn height(&self) -> usize {
        self.subtree_height(self.root)
    }

    /// Checks ordering, balance factors and the node count. Returns the
    /// first violation found.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = 0;
        self.validate_subtree(self.root, None, None, &mut seen)?;
        if seen != self.len {
            return Err(format!("index holds {seen} nodes, expected {}", self.len));
        }
        let linked = self.nodes.iter().filter(|n| n.key.is_some()).count();
        if linked != self.len {
            return Err(format!("{linked} slots carry keys, {} are in the tree", self.len));
        }
        Ok(())
    }

    fn validate_subtree(
        &self,
        sub: Option<usize>,
        low: Option<BufferKey>,
        high: Option<BufferKey>,
        seen: &mut usize,
    ) -> Result<usize, String> {
        let Some(n) = sub else { return Ok(0) };
        *seen += 1;
        if *seen > self.len {
            return Err(format!("cycle through node {n}"));
        }
        let node = &self.nodes[n];
        let key = node.key.ok_or_else(|| format!("node {n} is linked without a key"))?;
        if low.is_some_and(|l| key <= l) || high.is_some_and(|h| key >= h) {
            return Err(format!("node {n} ({key}) is out of order"));
        }
        let lh = self.validate_subtree(node.left, low, Some(key), seen)?;
        let rh = self.validate_subtree(node.right, Some(key), high, seen)?;
        let balance = rh as i64 - lh as i64;
        if balance != i64::from(node.balance) || balance.abs() > 1 {
            return Err(format!(
                "node {n} ({key}) records balance {} but children differ by {balance}",
                node.balance
            ));
        }
        Ok(1 + lh.max(rh))
    }

    fn subtree_height(&self, sub: Option<usize>) -> usize {
        match sub {
            None => 0,
            Some(n) => {
                1 + self
                    .subtree_height(self.nodes[n].left)
                    .max(self.subtree_height(self.nodes[n].right))
            }
        }
    }

    fn node_key(&self, n: usize) -> Result<BufferKey, IndexError> {
        self.nodes[n].key.ok_or(IndexError::NotLinked(n))
    }

    fn child(&self, n: usize, dir: Dir) -> Option<usize> {
        match dir {
            Dir::Left => self.nodes[n].left,
            Dir::Right => self.nodes[n].right,
        }
    }

    fn relink(&mut self, parent: Option<(usize, Dir)>, sub: Option<usize>) {
        match parent {
            None => self.root = sub,
            Some((p, Dir::Left)) => self.nodes[p].left = sub,
            Some((p, Dir::Right)) => self.nodes[p].right = sub,
        }
    }

    fn rotate_left(&mut self, n: usize) -> Result<usize, IndexError> {
        let r = self.nodes[n].right.ok_or(IndexError::Unbalanced(n))?;
        self.nodes[n].right = self.nodes[r].left;
        self.nodes[r].left = Some(n);
        Ok(r)
    }

    fn rotate_right(&mut self, n: usize) -> Result<usize, IndexError> {
        let l = self.nodes[n].left.ok_or(IndexError::Unbalanced(n))?;
        self.nodes[n].left = self.nodes[l].right;
        self.nodes[l].right = Some(n);
        Ok(l)
    }

    /// Rotates the subtree at `n`, whose balance is +2 or -2. Returns the
    /// new subtree root and whether the subtree got shorter.
    fn rebalance(&mut self, n: usize) -> Result<(usize, bool), IndexError> {
        if self.nodes[n].balance > 0 {
            let r = self.nodes[n].right.ok_or(IndexError::Unbalanced(n))?;
            if self.nodes[r].balance >= 0 {
                // RR
                let shrunk = self.nodes[r].balance != 0;
                self.rotate_left(n)?;
                if shrunk {
                    self.nodes[n].balance = 0;
                    self.nodes[r].balance = 0;
                } else {
                    self.nodes[n].balance = 1;
                    self.nodes[r].balance = -1;
                }
                Ok((r, shrunk))
            } else {
                // RL
                let rl = self.rotate_right(r)?;
                self.nodes[n].right = Some(rl);
                self.rotate_left(n)?;
                let (bn, br) = match self.nodes[rl].balance {
                    1 => (-1, 0),
                    -1 => (0, 1),
                    _ => (0, 0),
                };
                self.nodes[n].balance = bn;
                self.nodes[r].balance = br;
                self.nodes[rl].balance = 0;
                Ok((rl, true))
            }
        } else {
            let l = self.nodes[n].left.ok_or(IndexError::Unbalanced(n))?;
            if self.nodes[l].balance <= 0 {
                // LL
                let shrunk = self.nodes[l].balance != 0;
                self.rotate_right(n)?;
                if shrunk {
                    self.nodes[n].balance = 0;
                    self.nodes[l].balance = 0;
                } else {
                    self.nodes[n].balance = -1;
                    self.nodes[l].balance = 1;
                }
                Ok((l, shrunk))
            } else {
                // LR
                let lr = self.rotate_left(l)?;
                self.nodes[n].left = Some(lr);
                self.rotate_right(n)?;
                let (bn, bl) = match self.nodes[lr].balance {
                    -1 => (1, 0),
                    1 => (0, -1),
                    _ => (0, 0),
                };
                self.nodes[n].balance = bn;
                self.nodes[l].balance = bl;
                self.nodes[lr].balance = 0;
                Ok((lr, true))
            }
        }
    }
}
