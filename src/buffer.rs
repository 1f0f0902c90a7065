//! Bounded FIFO byte buffer with flow-control watermarks
//!
//! One buffer sits between each read side and its opposite write side.
//! Occupancy at or above the high watermark tells the session to pause
//! reading; at or below the low watermark reading resumes. A full buffer
//! produces a short write (the caller retries after drain); it never
//! blocks and never grows past its initial capacity.

/// Bounded FIFO over a fixed allocation
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    read_pos: usize,
    write_pos: usize,
    size: usize,
}

impl Buffer {
    /// 64 KiB
    pub const DEFAULT_CAPACITY: usize = 64 * 1024;
    /// Pause reading at 48 KiB
    pub const HIGH_WATERMARK: usize = 48 * 1024;
    /// Resume reading at 16 KiB
    pub const LOW_WATERMARK: usize = 16 * 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            capacity,
            read_pos: 0,
            write_pos: 0,
            size: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.size
    }

    pub fn writable(&self) -> usize {
        self.capacity - self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    // ── Flow control ───────────────────────────────────────────────────────

    pub fn should_pause_reading(&self) -> bool {
        self.size >= Self::HIGH_WATERMARK
    }

    pub fn should_resume_reading(&self) -> bool {
        self.size <= Self::LOW_WATERMARK
    }

    // ── Data operations ────────────────────────────────────────────────────

    /// Append bytes, returning how many were accepted
    ///
    /// Slides pending bytes to the front first if the tail lacks room.
    /// Accepts fewer than `data.len()` bytes when the buffer is near full.
    pub fn append(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.write_pos + data.len() > self.capacity && self.read_pos > 0 {
            self.compact();
        }

        let to_write = data.len().min(self.capacity - self.write_pos);
        if to_write == 0 {
            return 0;
        }

        self.data[self.write_pos..self.write_pos + to_write].copy_from_slice(&data[..to_write]);
        self.write_pos += to_write;
        self.size += to_write;
        to_write
    }

    /// Drop bytes from the front, returning how many were consumed
    pub fn consume(&mut self, len: usize) -> usize {
        let to_consume = len.min(self.size);
        self.read_pos += to_consume;
        self.size -= to_consume;

        if self.size == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        to_consume
    }

    /// Contiguous readable span without consuming
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.read_pos + self.size]
    }

    /// Reserve a writable region of up to `max` bytes
    ///
    /// Pair with [`Buffer::commit`] after filling the slice.
    pub fn reserve(&mut self, max: usize) -> &mut [u8] {
        if self.write_pos + max > self.capacity && self.read_pos > 0 {
            self.compact();
        }
        let available = self.capacity - self.write_pos;
        let to_reserve = max.min(available);
        &mut self.data[self.write_pos..self.write_pos + to_reserve]
    }

    /// Commit bytes filled into the region returned by [`Buffer::reserve`]
    pub fn commit(&mut self, written: usize) {
        debug_assert!(self.write_pos + written <= self.capacity);
        self.write_pos += written;
        self.size += written;
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.size = 0;
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.size > 0 {
            self.data.copy_within(self.read_pos..self.read_pos + self.size, 0);
        }
        self.write_pos = self.size;
        self.read_pos = 0;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
