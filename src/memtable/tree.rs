//! Arena-backed red-black tree — the ordered in-memory write buffer.
//!
//! Nodes live in a `Vec` arena and refer to each other through integer
//! handles, so the structure is acyclic from the borrow checker's point
//! of view and a deep copy is a plain arena clone.
//!
//! Deletions are **soft**: a tombstone flag is set and the node stays in
//! the tree, so no red-black delete rebalancing is ever needed. Physical
//! removal happens when the owning memtable is flushed and discarded.
//!
//! # Invariants
//!
//! - The root is black.
//! - No red node has a red child.
//! - Every root-to-leaf path crosses the same number of black nodes.

use std::cmp::Ordering;

type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone)]
struct RbNode<K, V> {
    key: K,
    value: Option<V>,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    deleted: bool,
}

/// Result of a point lookup in the tree.
#[derive(Debug, PartialEq)]
pub enum TreeGet<'a, V> {
    /// A live value.
    Put(&'a V),

    /// The key was soft-deleted.
    Deleted,

    /// The key is not present.
    NotFound,
}

/// An ordered map with soft deletes, cheap deep copies, and in-order
/// traversal over both live and tombstoned entries.
#[derive(Debug, Clone)]
pub struct Tree<K, V> {
    nodes: Vec<RbNode<K, V>>,
    root: Option<NodeId>,
}

impl<K: Ord + Clone, V: Clone> Default for Tree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> Tree<K, V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Total entries, tombstones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn color(&self, id: Option<NodeId>) -> Color {
        match id {
            Some(id) => self.nodes[id].color,
            None => Color::Black,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Rotations
    // --------------------------------------------------------------------------------------------

    fn left_rotate(&mut self, x: NodeId) {
        let y = self.nodes[x].right.expect("left_rotate without right child");

        let y_left = self.nodes[y].left;
        self.nodes[x].right = y_left;
        if let Some(yl) = y_left {
            self.nodes[yl].parent = Some(x);
        }

        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.nodes[p].left == Some(x) {
                    self.nodes[p].left = Some(y);
                } else {
                    self.nodes[p].right = Some(y);
                }
            }
        }

        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn right_rotate(&mut self, x: NodeId) {
        let y = self.nodes[x].left.expect("right_rotate without left child");

        let y_right = self.nodes[y].right;
        self.nodes[x].left = y_right;
        if let Some(yr) = y_right {
            self.nodes[yr].parent = Some(x);
        }

        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.nodes[p].right == Some(x) {
                    self.nodes[p].right = Some(y);
                } else {
                    self.nodes[p].left = Some(y);
                }
            }
        }

        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);
    }

    // --------------------------------------------------------------------------------------------
    // Insert
    // --------------------------------------------------------------------------------------------

    /// Inserts or overwrites a live entry.
    ///
    /// Overwriting a tombstoned key revives it.
    pub fn insert(&mut self, key: K, value: V) {
        self.insert_entry(key, Some(value), false);
    }

    /// Inserts a tombstone, shadowing any prior value for the key.
    pub fn insert_tombstone(&mut self, key: K) {
        self.insert_entry(key, None, true);
    }

    fn insert_entry(&mut self, key: K, value: Option<V>, deleted: bool) {
        let mut parent: Option<NodeId> = None;
        let mut cur = self.root;
        let mut went_left = false;

        while let Some(id) = cur {
            parent = Some(id);
            match key.cmp(&self.nodes[id].key) {
                Ordering::Less => {
                    cur = self.nodes[id].left;
                    went_left = true;
                }
                Ordering::Greater => {
                    cur = self.nodes[id].right;
                    went_left = false;
                }
                Ordering::Equal => {
                    self.nodes[id].value = value;
                    self.nodes[id].deleted = deleted;
                    return;
                }
            }
        }

        let id = self.nodes.len();
        self.nodes.push(RbNode {
            key,
            value,
            color: if parent.is_none() {
                Color::Black
            } else {
                Color::Red
            },
            parent,
            left: None,
            right: None,
            deleted,
        });

        match parent {
            None => {
                self.root = Some(id);
                return;
            }
            Some(p) => {
                if went_left {
                    self.nodes[p].left = Some(id);
                } else {
                    self.nodes[p].right = Some(id);
                }
            }
        }

        self.fix_after_insert(id);
    }

    fn fix_after_insert(&mut self, mut node: NodeId) {
        while Some(node) != self.root
            && self.color(self.nodes[node].parent) == Color::Red
        {
            let parent = self.nodes[node].parent.expect("red node has a parent");
            let grandparent = self.nodes[parent]
                .parent
                .expect("red parent has a parent");

            if self.nodes[grandparent].left == Some(parent) {
                let uncle = self.nodes[grandparent].right;
                if self.color(uncle) == Color::Red {
                    let uncle = uncle.expect("red uncle exists");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[uncle].color = Color::Black;
                    self.nodes[grandparent].color = Color::Red;
                    node = grandparent;
                } else {
                    if self.nodes[parent].right == Some(node) {
                        node = parent;
                        self.left_rotate(node);
                    }
                    let parent = self.nodes[node].parent.expect("rotated node has parent");
                    let grandparent = self.nodes[parent]
                        .parent
                        .expect("rotated parent has parent");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[grandparent].color = Color::Red;
                    self.right_rotate(grandparent);
                }
            } else {
                let uncle = self.nodes[grandparent].left;
                if self.color(uncle) == Color::Red {
                    let uncle = uncle.expect("red uncle exists");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[uncle].color = Color::Black;
                    self.nodes[grandparent].color = Color::Red;
                    node = grandparent;
                } else {
                    if self.nodes[parent].left == Some(node) {
                        node = parent;
                        self.right_rotate(node);
                    }
                    let parent = self.nodes[node].parent.expect("rotated node has parent");
                    let grandparent = self.nodes[parent]
                        .parent
                        .expect("rotated parent has parent");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[grandparent].color = Color::Red;
                    self.left_rotate(grandparent);
                }
            }
        }

        if let Some(root) = self.root {
            self.nodes[root].color = Color::Black;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    fn find_node(&self, key: &K) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            match key.cmp(&self.nodes[id].key) {
                Ordering::Less => cur = self.nodes[id].left,
                Ordering::Greater => cur = self.nodes[id].right,
                Ordering::Equal => return Some(id),
            }
        }
        None
    }

    /// Point lookup distinguishing live, tombstoned, and absent keys.
    pub fn find(&self, key: &K) -> TreeGet<'_, V> {
        match self.find_node(key) {
            None => TreeGet::NotFound,
            Some(id) => {
                let node = &self.nodes[id];
                if node.deleted {
                    TreeGet::Deleted
                } else {
                    match &node.value {
                        Some(v) => TreeGet::Put(v),
                        None => TreeGet::Deleted,
                    }
                }
            }
        }
    }

    /// Soft-deletes an existing key. Returns false if the key is absent.
    pub fn delete(&mut self, key: &K) -> bool {
        match self.find_node(key) {
            Some(id) => {
                self.nodes[id].deleted = true;
                self.nodes[id].value = None;
                true
            }
            None => false,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Traversal
    // --------------------------------------------------------------------------------------------

    /// In-order visit: `live_fn` on live entries, `deleted_fn` on
    /// tombstones, interleaved in key order.
    pub fn traverse(
        &self,
        mut live_fn: impl FnMut(&K, &V),
        mut deleted_fn: impl FnMut(&K),
    ) {
        for (key, value) in self.iter() {
            match value {
                Some(v) => live_fn(key, v),
                None => deleted_fn(key),
            }
        }
    }

    /// Smallest entry with key strictly greater than `last`, or the
    /// overall smallest when `last` is `None`.
    ///
    /// Stateless successor scan: callers drive iteration by feeding back
    /// the previously returned key.
    pub fn next_after(&self, last: Option<&K>) -> Option<(&K, Option<&V>)> {
        let mut best: Option<NodeId> = None;
        let mut cur = self.root;

        while let Some(id) = cur {
            let above = match last {
                None => true,
                Some(last) => self.nodes[id].key > *last,
            };
            if above {
                best = Some(id);
                cur = self.nodes[id].left;
            } else {
                cur = self.nodes[id].right;
            }
        }

        best.map(|id| {
            let node = &self.nodes[id];
            let value = if node.deleted { None } else { node.value.as_ref() };
            (&node.key, value)
        })
    }

    /// In-order iterator over all entries; a `None` value marks a
    /// tombstone.
    pub fn iter(&self) -> TreeIter<'_, K, V> {
        let mut stack = Vec::new();
        let mut cur = self.root;
        while let Some(id) = cur {
            stack.push(id);
            cur = self.nodes[id].left;
        }
        TreeIter { tree: self, stack }
    }

    /// Returns an independent copy sharing no state with `self`.
    ///
    /// The arena representation makes this a single `Vec` clone.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

/// In-order iterator over a [`Tree`].
pub struct TreeIter<'a, K, V> {
    tree: &'a Tree<K, V>,
    stack: Vec<NodeId>,
}

impl<'a, K, V> Iterator for TreeIter<'a, K, V> {
    type Item = (&'a K, Option<&'a V>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = &self.tree.nodes[id];

        let mut cur = node.right;
        while let Some(next) = cur {
            self.stack.push(next);
            cur = self.tree.nodes[next].left;
        }

        let value = if node.deleted { None } else { node.value.as_ref() };
        Some((&node.key, value))
    }
}

// ------------------------------------------------------------------------------------------------
// Test-only invariant checks
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
impl<K: Ord + Clone, V: Clone> Tree<K, V> {
    /// Panics unless all three red-black invariants hold.
    pub fn check_invariants(&self) {
        if let Some(root) = self.root {
            assert_eq!(self.nodes[root].color, Color::Black, "root must be black");
            self.check_subtree(root);
        }
    }

    /// Returns the black height of the subtree while checking the
    /// red-red and equal-black-height rules.
    fn check_subtree(&self, id: NodeId) -> usize {
        let node = &self.nodes[id];

        if node.color == Color::Red {
            assert_eq!(self.color(node.left), Color::Black, "red-red violation");
            assert_eq!(self.color(node.right), Color::Black, "red-red violation");
        }

        let left_height = node.left.map_or(1, |l| self.check_subtree(l));
        let right_height = node.right.map_or(1, |r| self.check_subtree(r));
        assert_eq!(left_height, right_height, "black height mismatch");

        left_height + usize::from(node.color == Color::Black)
    }
}
