//! Byte buffer with append-at-tail, consume-at-head semantics. Consuming
//! advances the head without shifting; the gap is reclaimed the next time
//! an append needs room.

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize, // beginning of valid data
    end: usize,   // end of valid data (exclusive)
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
            end: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn append(&mut self, data: &[u8]) {
        let needed = data.len();
        if self.end + needed > self.data.capacity() {
            self.make_room(needed);
        }
        if self.end + needed > self.data.len() {
            self.data.resize(self.end + needed, 0);
        }
        self.data[self.end..self.end + needed].copy_from_slice(data);
        self.end += needed;
    }

    pub fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    pub fn append_i32(&mut self, v: i32) {
        self.append(&v.to_le_bytes());
    }

    pub fn append_i64(&mut self, v: i64) {
        self.append(&v.to_le_bytes());
    }

    pub fn append_f64(&mut self, v: f64) {
        self.append(&v.to_le_bytes());
    }

    /// Remove n bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than available");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Overwrite 4 bytes at `pos` (relative to the current head).
    pub fn put_u32_at(&mut self, pos: usize, v: u32) {
        let at = self.start + pos;
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Discard everything past the first `len` bytes of valid data.
    pub fn truncate_to(&mut self, len: usize) {
        assert!(len <= self.len());
        self.end = self.start + len;
    }

    fn make_room(&mut self, needed: usize) {
        let current_len = self.len();
        let available_at_end = self.data.capacity() - self.end;
        let available_at_start = self.start;

        if available_at_start + available_at_end >= needed {
            // Compact: slide valid data to the front.
            if current_len > 0 {
                self.data.copy_within(self.start..self.end, 0);
            }
            self.start = 0;
            self.end = current_len;
        } else {
            let new_capacity = (self.data.capacity() * 2).max(current_len + needed);
            let mut new_data = Vec::with_capacity(new_capacity);
            if current_len > 0 {
                new_data.extend_from_slice(&self.data[self.start..self.end]);
            }
            self.data = new_data;
            self.start = 0;
            self.end = current_len;
        }
    }
}
