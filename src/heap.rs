//! TTL priority queue: array-backed min-heap on expiry deadline. Every
//! item writes its current slot back into the owning entry's `heap_idx`
//! cell on every move, so a TTL rewrite or removal is O(log N) with no
//! search.

use std::rc::Rc;

use crate::map::Entry;

#[derive(Debug, Clone)]
pub struct HeapItem {
    pub expire_at: u64,
    pub entry: Rc<Entry>,
}

fn heap_left(i: usize) -> usize {
    i * 2 + 1
}

fn heap_right(i: usize) -> usize {
    i * 2 + 2
}

fn heap_parent(i: usize) -> usize {
    (i - 1) / 2
}

fn heap_up(heap: &mut [HeapItem], mut pos: usize) {
    let item = heap[pos].clone();
    while pos > 0 && heap[heap_parent(pos)].expire_at > item.expire_at {
        heap[pos] = heap[heap_parent(pos)].clone();
        heap[pos].entry.heap_idx.set(Some(pos));
        pos = heap_parent(pos);
    }
    heap[pos] = item;
    heap[pos].entry.heap_idx.set(Some(pos));
}

fn heap_down(heap: &mut [HeapItem], mut pos: usize) {
    let item = heap[pos].clone();
    let len = heap.len();
    loop {
        let left = heap_left(pos);
        let right = heap_right(pos);
        let mut min_pos = pos;
        let mut min_val = item.expire_at;
        if left < len && heap[left].expire_at < min_val {
            min_pos = left;
            min_val = heap[left].expire_at;
        }
        if right < len && heap[right].expire_at < min_val {
            min_pos = right;
        }
        if min_pos == pos {
            break;
        }
        heap[pos] = heap[min_pos].clone();
        heap[pos].entry.heap_idx.set(Some(pos));
        pos = min_pos;
    }
    heap[pos] = item;
    heap[pos].entry.heap_idx.set(Some(pos));
}

/// Restore heap order around `pos` after its deadline changed; sifts in
/// whichever direction is needed, no-op when already ordered.
pub fn heap_update(heap: &mut [HeapItem], pos: usize) {
    if pos > 0 && heap[heap_parent(pos)].expire_at > heap[pos].expire_at {
        heap_up(heap, pos);
    } else {
        heap_down(heap, pos);
    }
}

/// Remove the item at `pos`, clearing its entry's slot; the tail element
/// takes its place and re-sifts.
pub fn heap_delete(heap: &mut Vec<HeapItem>, pos: usize) {
    if pos >= heap.len() {
        return;
    }
    heap[pos].entry.heap_idx.set(None);
    if let Some(last) = heap.pop() {
        if pos < heap.len() {
            heap[pos] = last;
            heap[pos].entry.heap_idx.set(Some(pos));
            heap_update(heap, pos);
        }
    }
}

/// Set or rewrite an entry's deadline, in place when it already holds a
/// slot.
pub fn heap_upsert(heap: &mut Vec<HeapItem>, entry: &Rc<Entry>, expire_at: u64) {
    match entry.heap_idx.get() {
        Some(pos) if pos < heap.len() => {
            heap[pos].expire_at = expire_at;
            heap_update(heap, pos);
        }
        _ => {
            let pos = heap.len();
            heap.push(HeapItem {
                expire_at,
                entry: Rc::clone(entry),
            });
            entry.heap_idx.set(Some(pos));
            heap_up(heap, pos);
        }
    }
}
