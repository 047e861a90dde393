//! Sorted set: every member is one `ZNode` reachable through two indexes,
//! a by-name hash map and an AVL tree ordered by (score, name). The tree
//! nodes carry height and subtree count so rank offsets run in O(log N).
//!
//! Nodes are `Arc<Mutex<_>>` so a detached set is `Send` and a worker
//! thread can tear it down; within the event loop access is single-threaded
//! and locks never contend.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ordered_float::OrderedFloat;

pub type ZNodeRef = Arc<Mutex<ZNode>>;

#[derive(Debug)]
pub struct ZNode {
    parent: Option<ZNodeRef>,
    left: Option<ZNodeRef>,
    right: Option<ZNodeRef>,
    height: u32,
    count: u32,
    pub score: f64,
    pub name: Box<[u8]>,
}

impl ZNode {
    fn new(score: f64, name: &[u8]) -> ZNodeRef {
        Arc::new(Mutex::new(Self {
            parent: None,
            left: None,
            right: None,
            height: 1,
            count: 1,
            score,
            name: name.into(),
        }))
    }
}

fn zkey_cmp(a_score: f64, a_name: &[u8], b_score: f64, b_name: &[u8]) -> Ordering {
    (OrderedFloat(a_score), a_name).cmp(&(OrderedFloat(b_score), b_name))
}

fn znode_height(node: &Option<ZNodeRef>) -> u32 {
    node.as_ref().map_or(0, |n| n.lock().unwrap().height)
}

fn znode_count(node: &Option<ZNodeRef>) -> u32 {
    node.as_ref().map_or(0, |n| n.lock().unwrap().count)
}

fn znode_update(node: &ZNodeRef) {
    let (lh, rh, lc, rc) = {
        let n = node.lock().unwrap();
        (
            znode_height(&n.left),
            znode_height(&n.right),
            znode_count(&n.left),
            znode_count(&n.right),
        )
    };
    let mut n = node.lock().unwrap();
    n.height = 1 + lh.max(rh);
    n.count = 1 + lc + rc;
}

fn znode_rot_left(node: ZNodeRef) -> ZNodeRef {
    let pivot = {
        let n = node.lock().unwrap();
        n.right.clone().expect("left rotation needs a right child")
    };
    let inner = pivot.lock().unwrap().left.clone();

    {
        let mut n = node.lock().unwrap();
        n.right = inner.clone();
    }
    if let Some(inner_node) = &inner {
        inner_node.lock().unwrap().parent = Some(node.clone());
    }

    let parent = node.lock().unwrap().parent.clone();
    pivot.lock().unwrap().parent = parent.clone();
    if let Some(p) = parent {
        let mut pm = p.lock().unwrap();
        if pm.left.as_ref().is_some_and(|l| Arc::ptr_eq(l, &node)) {
            pm.left = Some(pivot.clone());
        } else {
            pm.right = Some(pivot.clone());
        }
    }

    pivot.lock().unwrap().left = Some(node.clone());
    node.lock().unwrap().parent = Some(pivot.clone());

    znode_update(&node);
    znode_update(&pivot);
    pivot
}

fn znode_rot_right(node: ZNodeRef) -> ZNodeRef {
    let pivot = {
        let n = node.lock().unwrap();
        n.left.clone().expect("right rotation needs a left child")
    };
    let inner = pivot.lock().unwrap().right.clone();

    {
        let mut n = node.lock().unwrap();
        n.left = inner.clone();
    }
    if let Some(inner_node) = &inner {
        inner_node.lock().unwrap().parent = Some(node.clone());
    }

    let parent = node.lock().unwrap().parent.clone();
    pivot.lock().unwrap().parent = parent.clone();
    if let Some(p) = parent {
        let mut pm = p.lock().unwrap();
        if pm.left.as_ref().is_some_and(|l| Arc::ptr_eq(l, &node)) {
            pm.left = Some(pivot.clone());
        } else {
            pm.right = Some(pivot.clone());
        }
    }

    pivot.lock().unwrap().right = Some(node.clone());
    node.lock().unwrap().parent = Some(pivot.clone());

    znode_update(&node);
    znode_update(&pivot);
    pivot
}

fn znode_fix_left(node: ZNodeRef) -> ZNodeRef {
    let needs_double = {
        let left = node.lock().unwrap().left.clone().expect("imbalance implies a left child");
        let l = left.lock().unwrap();
        znode_height(&l.left) < znode_height(&l.right)
    };
    if needs_double {
        let left = node.lock().unwrap().left.clone().unwrap();
        znode_rot_left(left);
    }
    znode_rot_right(node)
}

fn znode_fix_right(node: ZNodeRef) -> ZNodeRef {
    let needs_double = {
        let right = node.lock().unwrap().right.clone().expect("imbalance implies a right child");
        let r = right.lock().unwrap();
        znode_height(&r.right) < znode_height(&r.left)
    };
    if needs_double {
        let right = node.lock().unwrap().right.clone().unwrap();
        znode_rot_right(right);
    }
    znode_rot_left(node)
}

/// Restore heights, counts and balance from `node` to the root; returns the
/// (possibly new) root.
fn znode_fix(mut node: ZNodeRef) -> ZNodeRef {
    loop {
        znode_update(&node);
        let (lh, rh) = {
            let n = node.lock().unwrap();
            (znode_height(&n.left), znode_height(&n.right))
        };
        let fixed = if lh == rh + 2 {
            znode_fix_left(node)
        } else if lh + 2 == rh {
            znode_fix_right(node)
        } else {
            node
        };
        let parent = fixed.lock().unwrap().parent.clone();
        match parent {
            Some(p) => node = p,
            None => return fixed,
        }
    }
}

/// Splice out a node with at most one child; returns the new root.
fn znode_del_easy(node: &ZNodeRef) -> Option<ZNodeRef> {
    let (child, parent) = {
        let n = node.lock().unwrap();
        debug_assert!(n.left.is_none() || n.right.is_none());
        (n.left.clone().or_else(|| n.right.clone()), n.parent.clone())
    };
    if let Some(c) = &child {
        c.lock().unwrap().parent = parent.clone();
    }
    {
        let mut n = node.lock().unwrap();
        n.parent = None;
        n.left = None;
        n.right = None;
    }
    let Some(parent) = parent else {
        return child;
    };
    {
        let mut pm = parent.lock().unwrap();
        if pm.left.as_ref().is_some_and(|l| Arc::ptr_eq(l, node)) {
            pm.left = child;
        } else {
            pm.right = child;
        }
    }
    Some(znode_fix(parent))
}

/// Detach a node from the tree, returning the new root. A node with two
/// children is replaced by link surgery with its in-order successor; node
/// identities never change, so references held by the name index stay
/// valid.
fn znode_del(node: &ZNodeRef) -> Option<ZNodeRef> {
    let (has_left, right) = {
        let n = node.lock().unwrap();
        (n.left.is_some(), n.right.clone())
    };
    let Some(right) = right else {
        return znode_del_easy(node);
    };
    if !has_left {
        return znode_del_easy(node);
    }

    let mut victim = right;
    loop {
        let next = victim.lock().unwrap().left.clone();
        match next {
            Some(l) => victim = l,
            None => break,
        }
    }

    let mut root = znode_del_easy(&victim);

    // Graft the successor into the target's position.
    let (parent, left, right, height, count) = {
        let n = node.lock().unwrap();
        (n.parent.clone(), n.left.clone(), n.right.clone(), n.height, n.count)
    };
    {
        let mut v = victim.lock().unwrap();
        v.parent = parent.clone();
        v.left = left.clone();
        v.right = right.clone();
        v.height = height;
        v.count = count;
    }
    if let Some(l) = &left {
        l.lock().unwrap().parent = Some(victim.clone());
    }
    if let Some(r) = &right {
        r.lock().unwrap().parent = Some(victim.clone());
    }
    match parent {
        Some(p) => {
            let mut pm = p.lock().unwrap();
            if pm.left.as_ref().is_some_and(|l| Arc::ptr_eq(l, node)) {
                pm.left = Some(victim.clone());
            } else {
                pm.right = Some(victim.clone());
            }
        }
        None => root = Some(victim.clone()),
    }
    {
        let mut n = node.lock().unwrap();
        n.parent = None;
        n.left = None;
        n.right = None;
    }
    root
}

/// Walk to the k-th in-order neighbor using subtree counts; `None` when the
/// target rank falls outside the tree.
pub fn znode_offset(start: &ZNodeRef, offset: i64) -> Option<ZNodeRef> {
    let mut node = start.clone();
    let mut position = 0i64;
    while position != offset {
        let (left_count, right_count) = {
            let n = node.lock().unwrap();
            (znode_count(&n.left) as i64, znode_count(&n.right) as i64)
        };
        if position < offset && offset <= position + right_count {
            // Target is inside the right subtree.
            let right = node.lock().unwrap().right.clone()?;
            position += 1 + znode_count(&right.lock().unwrap().left) as i64;
            node = right;
        } else if position > offset && offset >= position - left_count {
            // Target is inside the left subtree.
            let left = node.lock().unwrap().left.clone()?;
            position -= 1 + znode_count(&left.lock().unwrap().right) as i64;
            node = left;
        } else {
            let parent = node.lock().unwrap().parent.clone()?;
            let from_right = {
                let pm = parent.lock().unwrap();
                pm.right.as_ref().is_some_and(|r| Arc::ptr_eq(r, &node))
            };
            if from_right {
                position -= 1 + left_count;
            } else {
                position += 1 + right_count;
            }
            node = parent;
        }
    }
    Some(node)
}

/// Dual-indexed weighted set.
#[derive(Debug, Default)]
pub struct ZSet {
    root: Option<ZNodeRef>,
    by_name: HashMap<Box<[u8]>, ZNodeRef>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Add a member or rewrite the score of an existing one; true when the
    /// member is new.
    pub fn insert(&mut self, name: &[u8], score: f64) -> bool {
        if let Some(node) = self.by_name.get(name).cloned() {
            self.update_score(&node, score);
            return false;
        }
        let node = ZNode::new(score, name);
        self.by_name.insert(name.into(), node.clone());
        self.tree_insert(node);
        true
    }

    pub fn lookup(&self, name: &[u8]) -> Option<ZNodeRef> {
        self.by_name.get(name).cloned()
    }

    pub fn delete(&mut self, name: &[u8]) -> bool {
        let Some(node) = self.by_name.remove(name) else {
            return false;
        };
        self.root = znode_del(&node);
        true
    }

    /// Smallest node whose (score, name) is >= the argument.
    pub fn seek_ge(&self, score: f64, name: &[u8]) -> Option<ZNodeRef> {
        let mut candidate = None;
        let mut current = self.root.clone();
        while let Some(node) = current {
            let go_left = {
                let n = node.lock().unwrap();
                zkey_cmp(n.score, &n.name, score, name) != Ordering::Less
            };
            if go_left {
                current = node.lock().unwrap().left.clone();
                candidate = Some(node);
            } else {
                current = node.lock().unwrap().right.clone();
            }
        }
        candidate
    }

    /// Score rewrite: detach from the tree, reinsert at the new position.
    /// The name index is untouched.
    fn update_score(&mut self, node: &ZNodeRef, score: f64) {
        self.root = znode_del(node);
        {
            let mut n = node.lock().unwrap();
            n.score = score;
            n.height = 1;
            n.count = 1;
        }
        self.tree_insert(node.clone());
    }

    /// Attach a detached node as a leaf at its (score, name) position, then
    /// rebalance upward.
    fn tree_insert(&mut self, node: ZNodeRef) {
        let (score, name) = {
            let n = node.lock().unwrap();
            (n.score, n.name.clone())
        };
        let mut current = self.root.clone();
        let mut parent: Option<ZNodeRef> = None;
        let mut is_left = false;
        while let Some(cur) = current {
            let go_left = {
                let c = cur.lock().unwrap();
                zkey_cmp(score, &name, c.score, &c.name) == Ordering::Less
            };
            is_left = go_left;
            parent = Some(cur.clone());
            current = if go_left {
                cur.lock().unwrap().left.clone()
            } else {
                cur.lock().unwrap().right.clone()
            };
        }
        node.lock().unwrap().parent = parent.clone();
        match parent {
            Some(p) => {
                if is_left {
                    p.lock().unwrap().left = Some(node.clone());
                } else {
                    p.lock().unwrap().right = Some(node.clone());
                }
                self.root = Some(znode_fix(node));
            }
            None => self.root = Some(node),
        }
    }
}

impl Drop for ZSet {
    fn drop(&mut self) {
        // Parent/child links form Arc cycles; break them so the nodes free.
        for (_, node) in self.by_name.drain() {
            let mut n = node.lock().unwrap();
            n.parent = None;
            n.left = None;
            n.right = None;
        }
        self.root = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recursively validate order, balance, augmentations and parent links.
    fn check_subtree(
        node: &Option<ZNodeRef>,
        parent: Option<&ZNodeRef>,
        lo: Option<(f64, Vec<u8>)>,
        hi: Option<(f64, Vec<u8>)>,
    ) -> (u32, u32) {
        let Some(node) = node else {
            return (0, 0);
        };
        let (left, right, height, count, score, name) = {
            let n = node.lock().unwrap();
            (
                n.left.clone(),
                n.right.clone(),
                n.height,
                n.count,
                n.score,
                n.name.to_vec(),
            )
        };
        match (parent, node.lock().unwrap().parent.as_ref()) {
            (Some(p), Some(actual)) => assert!(Arc::ptr_eq(p, actual), "parent link broken"),
            (None, None) => {}
            _ => panic!("parent link broken"),
        }
        if let Some((s, n)) = &lo {
            assert!(zkey_cmp(score, &name, *s, n) == Ordering::Greater, "order violated");
        }
        if let Some((s, n)) = &hi {
            assert!(zkey_cmp(score, &name, *s, n) == Ordering::Less, "order violated");
        }
        let (lh, lc) = check_subtree(&left, Some(node), lo, Some((score, name.clone())));
        let (rh, rc) = check_subtree(&right, Some(node), Some((score, name.clone())), hi);
        assert!(lh.abs_diff(rh) <= 1, "unbalanced at {:?}", name);
        assert_eq!(height, 1 + lh.max(rh), "stale height at {:?}", name);
        assert_eq!(count, 1 + lc + rc, "stale count at {:?}", name);
        (height, count)
    }

    fn check(zset: &ZSet) {
        let (_, count) = check_subtree(&zset.root, None, None, None);
        assert_eq!(count as usize, zset.len(), "indexes disagree on size");
    }

    fn members_in_order(zset: &ZSet) -> Vec<(Vec<u8>, f64)> {
        let mut out = Vec::new();
        let mut cur = zset.seek_ge(f64::NEG_INFINITY, b"");
        while let Some(node) = cur {
            {
                let n = node.lock().unwrap();
                out.push((n.name.to_vec(), n.score));
            }
            cur = znode_offset(&node, 1);
        }
        out
    }

    #[test]
    fn insert_update_delete_keeps_both_indexes() {
        let mut zset = ZSet::new();
        assert!(zset.insert(b"a", 1.0));
        assert!(zset.insert(b"b", 2.0));
        assert!(!zset.insert(b"a", 1.0));
        check(&zset);

        // Score rewrite moves the tree position, not the hash entry.
        assert!(!zset.insert(b"a", 3.0));
        check(&zset);
        let node = zset.lookup(b"a").unwrap();
        assert_eq!(node.lock().unwrap().score, 3.0);
        assert_eq!(
            members_in_order(&zset),
            vec![(b"b".to_vec(), 2.0), (b"a".to_vec(), 3.0)]
        );

        assert!(zset.delete(b"a"));
        assert!(!zset.delete(b"a"));
        check(&zset);
        assert!(zset.lookup(b"a").is_none());
        assert!(zset.lookup(b"b").is_some());
    }

    #[test]
    fn bulk_churn_stays_balanced() {
        let mut zset = ZSet::new();
        for i in 0..500u32 {
            // Scores collide constantly to exercise the name tie-break.
            let name = format!("m{:04}", (i * 7919) % 1000);
            zset.insert(name.as_bytes(), (i % 10) as f64);
        }
        check(&zset);

        let members = members_in_order(&zset);
        assert_eq!(members.len(), zset.len());
        for pair in members.windows(2) {
            let (an, asc) = (&pair[0].0, pair[0].1);
            let (bn, bsc) = (&pair[1].0, pair[1].1);
            assert!(
                zkey_cmp(asc, an, bsc, bn) == Ordering::Less,
                "walk out of order"
            );
        }

        // Delete every other member, validating structure as we go.
        let names: Vec<Vec<u8>> = members.iter().map(|(n, _)| n.clone()).collect();
        for (i, name) in names.iter().enumerate() {
            if i % 2 == 0 {
                assert!(zset.delete(name));
            }
        }
        check(&zset);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(zset.lookup(name).is_some(), i % 2 == 1);
        }
    }

    #[test]
    fn seek_and_offset() {
        let mut zset = ZSet::new();
        for (name, score) in [(b"a", 1.0), (b"b", 1.0), (b"c", 2.0), (b"d", 3.0)] {
            zset.insert(name, score);
        }
        check(&zset);

        // seek_ge lands on the exact key when present.
        let hit = zset.seek_ge(1.0, b"b").unwrap();
        assert_eq!(&*hit.lock().unwrap().name, b"b");
        // ... and on the next key when absent.
        let hit = zset.seek_ge(1.5, b"").unwrap();
        assert_eq!(&*hit.lock().unwrap().name, b"c");
        // Past the end.
        assert!(zset.seek_ge(9.0, b"").is_none());

        let a = zset.seek_ge(1.0, b"a").unwrap();
        let d = znode_offset(&a, 3).unwrap();
        assert_eq!(&*d.lock().unwrap().name, b"d");
        let back = znode_offset(&d, -3).unwrap();
        assert!(Arc::ptr_eq(&a, &back));
        assert!(znode_offset(&a, 4).is_none());
        assert!(znode_offset(&a, -1).is_none());
        let same = znode_offset(&a, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &same));
    }

    #[test]
    fn drop_releases_cyclic_links() {
        let mut zset = ZSet::new();
        for i in 0..100u32 {
            zset.insert(format!("m{i}").as_bytes(), i as f64);
        }
        let probe = zset.lookup(b"m42").unwrap();
        drop(zset);
        // The set held the only other strong reference; if drop had leaked
        // the link cycle this count would still exceed one.
        assert_eq!(Arc::strong_count(&probe), 1);
    }
}
