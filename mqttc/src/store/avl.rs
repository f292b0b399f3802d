//! Height-balanced binary search tree used for secondary indexes.
//!
//! Nodes live in an arena and refer to each other by slot number, so
//! rotations only reassign child links. Every key holds a set of values;
//! inserting an existing key adds to that set.

use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    values: Vec<V>,
    left: Option<usize>,
    right: Option<usize>,
    height: i32,
}

/// AVL tree mapping a key to a set of values.
#[derive(Debug, Clone)]
pub struct AvlTree<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    root: Option<usize>,
    elems: usize,
}

impl<K, V> Default for AvlTree<K, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            elems: 0,
        }
    }
}

impl<K: Ord, V: PartialEq> AvlTree<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of values across all keys.
    pub fn elem_count(&self) -> usize {
        self.elems
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.elems = 0;
    }

    /// Add `value` under `key`.
    ///
    /// With `clear_on_collide` an existing value set for `key` is emptied
    /// first. A value already present under the key is not added twice.
    pub fn insert(&mut self, key: K, value: V, clear_on_collide: bool) {
        let root = self.insert_at(self.root, key, value, clear_on_collide);
        self.root = Some(root);
    }

    /// Remove `key` and return its value set.
    pub fn remove(&mut self, key: &K) -> Option<Vec<V>> {
        let mut removed = None;
        self.root = self.remove_at(self.root, key, &mut removed);
        if let Some(values) = &removed {
            self.elems -= values.len();
        }
        removed
    }

    /// Remove one value from `key`'s set, dropping the key once it is empty.
    pub fn remove_value(&mut self, key: &K, value: &V) -> bool {
        let Some(idx) = self.find_node(key) else {
            return false;
        };

        let node = self.node_mut(idx);
        let Some(pos) = node.values.iter().position(|v| v == value) else {
            return false;
        };
        node.values.swap_remove(pos);
        let now_empty = node.values.is_empty();
        self.elems -= 1;

        if now_empty {
            self.remove(key);
        }
        true
    }

    pub fn find(&self, key: &K) -> Option<&[V]> {
        self.find_node(key).map(|idx| self.node(idx).values.as_slice())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_node(key).is_some()
    }

    /// Smallest key strictly greater than `key`.
    pub fn find_next(&self, key: &K) -> Option<(&K, &[V])> {
        let mut best = None;
        let mut cur = self.root;
        while let Some(idx) = cur {
            let node = self.node(idx);
            if node.key > *key {
                best = Some(idx);
                cur = node.left;
            } else {
                cur = node.right;
            }
        }
        best.map(|idx| {
            let node = self.node(idx);
            (&node.key, node.values.as_slice())
        })
    }

    /// Smallest key.
    pub fn first(&self) -> Option<(&K, &[V])> {
        let mut cur = self.root?;
        while let Some(left) = self.node(cur).left {
            cur = left;
        }
        let node = self.node(cur);
        Some((&node.key, node.values.as_slice()))
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> Vec<(&K, &[V])> {
        let mut out = Vec::with_capacity(self.node_count());
        let mut stack = Vec::new();
        let mut cur = self.root;
        loop {
            while let Some(idx) = cur {
                stack.push(idx);
                cur = self.node(idx).left;
            }
            let Some(idx) = stack.pop() else {
                break;
            };
            let node = self.node(idx);
            out.push((&node.key, node.values.as_slice()));
            cur = node.right;
        }
        out
    }

    fn find_node(&self, key: &K) -> Option<usize> {
        let mut cur = self.root;
        while let Some(idx) = cur {
            let node = self.node(idx);
            cur = match key.cmp(&node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Some(idx),
            };
        }
        None
    }

    fn insert_at(&mut self, at: Option<usize>, key: K, value: V, clear_on_collide: bool) -> usize {
        let Some(idx) = at else {
            self.elems += 1;
            return self.alloc(key, value);
        };

        match key.cmp(&self.node(idx).key) {
            Ordering::Less => {
                let left = self.insert_at(self.node(idx).left, key, value, clear_on_collide);
                self.node_mut(idx).left = Some(left);
            }
            Ordering::Greater => {
                let right = self.insert_at(self.node(idx).right, key, value, clear_on_collide);
                self.node_mut(idx).right = Some(right);
            }
            Ordering::Equal => {
                let node = self.node_mut(idx);
                let mut cleared = 0;
                if clear_on_collide {
                    cleared = node.values.len();
                    node.values.clear();
                }
                let added = if node.values.contains(&value) {
                    false
                } else {
                    node.values.push(value);
                    true
                };
                self.elems = self.elems - cleared + usize::from(added);
                return idx;
            }
        }

        self.rebalance(idx)
    }

    fn remove_at(&mut self, at: Option<usize>, key: &K, removed: &mut Option<Vec<V>>) -> Option<usize> {
        let idx = at?;

        match key.cmp(&self.node(idx).key) {
            Ordering::Less => {
                let left = self.remove_at(self.node(idx).left, key, removed);
                self.node_mut(idx).left = left;
            }
            Ordering::Greater => {
                let right = self.remove_at(self.node(idx).right, key, removed);
                self.node_mut(idx).right = right;
            }
            Ordering::Equal => {
                let (left, right) = {
                    let node = self.node(idx);
                    (node.left, node.right)
                };
                *removed = Some(self.release(idx));

                return match (left, right) {
                    (None, child) | (child, None) => child,
                    (Some(left), Some(right)) => {
                        let (min, rest) = self.detach_min(right);
                        let node = self.node_mut(min);
                        node.left = Some(left);
                        node.right = rest;
                        Some(self.rebalance(min))
                    }
                };
            }
        }

        Some(self.rebalance(idx))
    }

    /// Unlink the smallest node of a subtree; returns it and the new subtree root.
    fn detach_min(&mut self, idx: usize) -> (usize, Option<usize>) {
        match self.node(idx).left {
            None => (idx, self.node(idx).right),
            Some(left) => {
                let (min, rest) = self.detach_min(left);
                self.node_mut(idx).left = rest;
                (min, Some(self.rebalance(idx)))
            }
        }
    }

    fn rebalance(&mut self, idx: usize) -> usize {
        self.update_height(idx);
        let balance = self.balance(idx);

        if balance > 1 {
            // Left heavy: LL needs one rotation, LR needs two.
            if let Some(left) = self.node(idx).left {
                if self.balance(left) < 0 {
                    let rotated = self.rotate_left(left);
                    self.node_mut(idx).left = Some(rotated);
                }
            }
            return self.rotate_right(idx);
        }

        if balance < -1 {
            if let Some(right) = self.node(idx).right {
                if self.balance(right) > 0 {
                    let rotated = self.rotate_right(right);
                    self.node_mut(idx).right = Some(rotated);
                }
            }
            return self.rotate_left(idx);
        }

        idx
    }

    fn rotate_right(&mut self, y: usize) -> usize {
        let Some(x) = self.node(y).left else {
            return y;
        };
        let t2 = self.node(x).right;
        self.node_mut(x).right = Some(y);
        self.node_mut(y).left = t2;
        self.update_height(y);
        self.update_height(x);
        x
    }

    fn rotate_left(&mut self, x: usize) -> usize {
        let Some(y) = self.node(x).right else {
            return x;
        };
        let t2 = self.node(y).left;
        self.node_mut(y).left = Some(x);
        self.node_mut(x).right = t2;
        self.update_height(x);
        self.update_height(y);
        y
    }

    fn height(&self, at: Option<usize>) -> i32 {
        at.map_or(0, |idx| self.node(idx).height)
    }

    fn balance(&self, idx: usize) -> i32 {
        let node = self.node(idx);
        self.height(node.left) - self.height(node.right)
    }

    fn update_height(&mut self, idx: usize) {
        let (left, right) = {
            let node = self.node(idx);
            (node.left, node.right)
        };
        let height = 1 + self.height(left).max(self.height(right));
        self.node_mut(idx).height = height;
    }

    fn alloc(&mut self, key: K, value: V) -> usize {
        let node = Node {
            key,
            values: vec![value],
            left: None,
            right: None,
            height: 1,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Vec<V> {
        self.free.push(idx);
        self.nodes[idx].take().map(|n| n.values).unwrap_or_default()
    }

    // Slots reachable from the root are always occupied.
    fn node(&self, idx: usize) -> &Node<K, V> {
        match &self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("avl: dangling node {idx}"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        match &mut self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("avl: dangling node {idx}"),
        }
    }

    /// Check ordering and balance; returns the tree height.
    #[cfg(test)]
    fn check(&self) -> i32 {
        fn walk<K: Ord, V: PartialEq>(tree: &AvlTree<K, V>, at: Option<usize>, lo: Option<&K>, hi: Option<&K>) -> i32 {
            let Some(idx) = at else {
                return 0;
            };
            let node = tree.node(idx);
            if let Some(lo) = lo {
                assert!(node.key > *lo, "ordering violated");
            }
            if let Some(hi) = hi {
                assert!(node.key < *hi, "ordering violated");
            }
            assert!(!node.values.is_empty(), "empty value set");
            let lh = walk(tree, node.left, lo, Some(&node.key));
            let rh = walk(tree, node.right, Some(&node.key), hi);
            assert!((lh - rh).abs() <= 1, "balance violated");
            assert_eq!(node.height, 1 + lh.max(rh), "stale height");
            1 + lh.max(rh)
        }
        walk(self, self.root, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_ascending_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for i in 0..1024u32 {
            tree.insert(i, i, false);
        }
        // A perfectly balanced tree of 1024 nodes has height 11.
        assert!(tree.check() <= 11);
        assert_eq!(tree.node_count(), 1024);
        assert_eq!(tree.elem_count(), 1024);
    }

    #[test]
    fn test_rotation_cases() {
        // LL, RR, LR, RL.
        for keys in [[3, 2, 1], [1, 2, 3], [3, 1, 2], [1, 3, 2]] {
            let mut tree = AvlTree::new();
            for k in keys {
                tree.insert(k, k * 10, false);
                tree.check();
            }
            assert_eq!(tree.check(), 2);
            assert_eq!(tree.first().map(|(k, _)| *k), Some(1));
        }
    }

    #[test]
    fn test_duplicate_keys_coalesce() {
        let mut tree = AvlTree::new();
        tree.insert("a", 1, false);
        tree.insert("a", 2, false);
        tree.insert("a", 2, false);
        assert_eq!(tree.find(&"a"), Some(&[1, 2][..]));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.elem_count(), 2);

        tree.insert("a", 3, true);
        assert_eq!(tree.find(&"a"), Some(&[3][..]));
        assert_eq!(tree.elem_count(), 1);
    }

    #[test]
    fn test_remove_value_drops_empty_key() {
        let mut tree = AvlTree::new();
        tree.insert(5, 'x', false);
        tree.insert(5, 'y', false);
        tree.insert(7, 'z', false);

        assert!(tree.remove_value(&5, &'x'));
        assert_eq!(tree.find(&5), Some(&['y'][..]));
        assert!(!tree.remove_value(&5, &'x'));

        assert!(tree.remove_value(&5, &'y'));
        assert!(!tree.contains_key(&5));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.elem_count(), 1);
        tree.check();
    }

    #[test]
    fn test_remove_returns_value_set() {
        let mut tree = AvlTree::new();
        for k in [50, 30, 70, 20, 40, 60, 80] {
            tree.insert(k, k, false);
        }
        tree.insert(30, 31, false);

        // Node with two children.
        assert_eq!(tree.remove(&30), Some(vec![30, 31]));
        assert_eq!(tree.remove(&30), None);
        tree.check();
        let keys: Vec<i32> = tree.iter().into_iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![20, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn test_find_next() {
        let mut tree = AvlTree::new();
        for k in [10u16, 20, 30] {
            tree.insert(k, (), false);
        }
        assert_eq!(tree.find_next(&0).map(|(k, _)| *k), Some(10));
        assert_eq!(tree.find_next(&10).map(|(k, _)| *k), Some(20));
        assert_eq!(tree.find_next(&25).map(|(k, _)| *k), Some(30));
        assert_eq!(tree.find_next(&30), None);
    }

    #[test]
    fn test_random_sequence_matches_btreemap() {
        // xorshift keeps the sequence deterministic.
        let mut seed = 0x2545_f491_u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut tree = AvlTree::new();
        let mut model: BTreeMap<u32, Vec<u32>> = BTreeMap::new();

        for step in 0..4000u32 {
            let key = next() % 200;
            if next() % 3 == 0 {
                let expected = model.remove(&key);
                assert_eq!(tree.remove(&key), expected);
            } else {
                tree.insert(key, step, false);
                model.entry(key).or_default().push(step);
            }
            if step % 97 == 0 {
                tree.check();
            }
        }

        tree.check();
        assert_eq!(tree.node_count(), model.len());
        assert_eq!(tree.elem_count(), model.values().map(Vec::len).sum::<usize>());
        for (key, values) in &model {
            assert_eq!(tree.find(key), Some(values.as_slice()));
        }
    }
}
