//! Circular sentinelled doubly-linked list for the idle-connection queue.
//! Nodes carry the owning connection's fd so the timer pass can reach the
//! connection without scanning the table.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub type DNodeRef = Rc<RefCell<DNode>>;

#[derive(Debug)]
pub struct DNode {
    prev: Option<DNodeRef>,
    next: Option<DNodeRef>,
    pub fd: RawFd,
}

/// A self-linked sentinel; the list is the ring of nodes around it.
pub fn dlist_sentinel() -> DNodeRef {
    let node = Rc::new(RefCell::new(DNode {
        prev: None,
        next: None,
        fd: -1,
    }));
    {
        let mut n = node.borrow_mut();
        n.prev = Some(node.clone());
        n.next = Some(node.clone());
    }
    node
}

/// A detached node, ready for `dlist_insert_before`.
pub fn dlist_node(fd: RawFd) -> DNodeRef {
    Rc::new(RefCell::new(DNode {
        prev: None,
        next: None,
        fd,
    }))
}

pub fn dlist_empty(sentinel: &DNodeRef) -> bool {
    let s = sentinel.borrow();
    match &s.next {
        Some(next) => Rc::ptr_eq(sentinel, next),
        None => true,
    }
}

/// First real node after the sentinel, oldest entry in the ring.
pub fn dlist_head(sentinel: &DNodeRef) -> Option<DNodeRef> {
    let next = sentinel.borrow().next.clone()?;
    if Rc::ptr_eq(sentinel, &next) {
        None
    } else {
        Some(next)
    }
}

/// Unlink a node; detaching an already-detached node is a no-op.
pub fn dlist_detach(node: &DNodeRef) {
    let (prev, next) = {
        let n = node.borrow();
        (n.prev.clone(), n.next.clone())
    };
    if let Some(prev_node) = &prev {
        prev_node.borrow_mut().next = next.clone();
    }
    if let Some(next_node) = &next {
        next_node.borrow_mut().prev = prev;
    }
    let mut n = node.borrow_mut();
    n.prev = None;
    n.next = None;
}

/// Link `rookie` immediately before `target`. Inserting before the sentinel
/// appends at the tail of the ring.
pub fn dlist_insert_before(target: &DNodeRef, rookie: &DNodeRef) {
    let prev = {
        let t = target.borrow();
        t.prev.clone().expect("target must be linked")
    };
    {
        let mut p = prev.borrow_mut();
        p.next = Some(rookie.clone());
    }
    {
        let mut r = rookie.borrow_mut();
        r.prev = Some(prev);
        r.next = Some(target.clone());
    }
    {
        let mut t = target.borrow_mut();
        t.prev = Some(rookie.clone());
    }
}
