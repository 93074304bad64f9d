//! Bounded byte FIFO backing the TLS record staging area.
//!
//! The buffer hands out at most two borrowed spans per read (`peek`), lets a
//! caller reserve a contiguous writable region (`ensure_linear_write`), and
//! grows by doubling when a write does not fit. Capacity never shrinks.

// ── RingBuffer ───────────────────────────────────────────────────

/// A growable ring of bytes with explicit read/write commits.
///
/// Invariants:
/// - `0 <= used() <= capacity()` at all times.
/// - `capacity()` is non-decreasing over any operation sequence.
/// - Bytes come out of `peek` + `commit_read` in exactly the order they
///   were written.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    /// Index of the oldest unread byte.
    read: usize,
    /// Number of readable bytes.
    used: usize,
}

impl RingBuffer {
    /// Allocate a buffer with the given initial capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)],
            read: 0,
            used: 0,
        }
    }

    /// Number of readable bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Current allocation size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can be written without growing.
    pub fn free(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Whether no readable bytes remain.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Append `data`, growing the buffer if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.free() < data.len() {
            self.grow(data.len());
        }

        let cap = self.buf.len();
        let write = (self.read + self.used) % cap;
        let first = (cap - write).min(data.len());
        self.buf[write..write + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.used += data.len();
        true
    }

    /// Reserve `n` contiguous writable bytes and return the span.
    ///
    /// The reservation is not visible to readers until
    /// [`commit_written`](Self::commit_written) is called. May grow the
    /// buffer; may relocate existing content to restore linearity.
    pub fn ensure_linear_write(&mut self, n: usize) -> &mut [u8] {
        if self.free() < n {
            self.grow(n);
        }

        let cap = self.buf.len();
        let write = (self.read + self.used) % cap;
        // When unwrapped, the free region may be split across the physical
        // end of the buffer; relocate to the front to make it contiguous.
        let unwrapped = self.used == 0 || write >= self.read;
        if unwrapped && cap - write < n {
            self.make_linear();
        }

        let write = (self.read + self.used) % self.buf.len();
        &mut self.buf[write..write + n]
    }

    /// Publish `n` bytes previously filled through a reservation.
    ///
    /// Returns `false` (and publishes nothing) if `n` exceeds the free
    /// space, which indicates a caller bug.
    pub fn commit_written(&mut self, n: usize) -> bool {
        if n > self.free() {
            return false;
        }
        self.used += n;
        true
    }

    /// Borrow up to `max` readable bytes without consuming them.
    ///
    /// Returns one or two spans; the second is empty unless the data wraps,
    /// in which case the first span runs to the physical buffer end and the
    /// second starts at index 0. The span lengths sum to `min(max, used)`.
    pub fn peek(&self, max: usize) -> (&[u8], &[u8]) {
        let cap = self.buf.len();
        let want = max.min(self.used);
        let first = (cap - self.read).min(want);
        (
            &self.buf[self.read..self.read + first],
            &self.buf[..want - first],
        )
    }

    /// Consume `n` bytes. Saturates at `used()` so "skip what you have"
    /// is a valid call.
    pub fn commit_read(&mut self, n: usize) {
        let n = n.min(self.used);
        self.read = (self.read + n) % self.buf.len();
        self.used -= n;
        if self.used == 0 {
            self.read = 0;
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Double capacity until `n` more bytes fit, preserving content in
    /// linear order.
    fn grow(&mut self, n: usize) {
        let mut cap = self.buf.len();
        while cap - self.used < n {
            cap *= 2;
        }
        self.relocate(cap);
    }

    /// Move content to the front of the buffer without changing capacity.
    fn make_linear(&mut self) {
        if self.read != 0 {
            self.relocate(self.buf.len());
        }
    }

    fn relocate(&mut self, cap: usize) {
        let mut next = vec![0u8; cap];
        let (a, b) = self.peek(self.used);
        next[..a.len()].copy_from_slice(a);
        next[a.len()..a.len() + b.len()].copy_from_slice(b);
        self.buf = next;
        self.read = 0;
    }
}

impl std::io::Write for RingBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        RingBuffer::write(self, data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Read for RingBuffer {
    /// Drains readable bytes into `out`. Returns `Ok(0)` when empty, which
    /// lets the TLS engine distinguish "no buffered input" from an error.
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let (a, b) = self.peek(out.len());
        let first = a.len();
        out[..first].copy_from_slice(a);
        out[first..first + b.len()].copy_from_slice(b);
        let n = first + b.len();
        self.commit_read(n);
        Ok(n)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect the peeked spans into an owned Vec for comparisons.
    fn peeked(rb: &RingBuffer, max: usize) -> Vec<u8> {
        let (a, b) = rb.peek(max);
        let mut v = a.to_vec();
        v.extend_from_slice(b);
        v
    }

    #[test]
    fn basic_write_read() {
        let mut rb = RingBuffer::new(10);
        assert!(rb.write(&[0, 1, 2, 3, 4]));
        assert!(rb.write(&[0, 1, 2, 3, 4]));
        assert!(rb.write(&[0, 1, 2, 3, 4]));
        assert_eq!(rb.used(), 15);

        let (a, b) = rb.peek(10);
        assert_eq!(a.len() + b.len(), 10);
        assert_eq!(peeked(&rb, 10), [0, 1, 2, 3, 4, 0, 1, 2, 3, 4]);
        rb.commit_read(10);
        assert_eq!(rb.used(), 5);
    }

    #[test]
    fn wrap_scenario() {
        let mut rb = RingBuffer::new(5);
        assert!(rb.write(&[0, 1, 2, 3]));
        rb.commit_read(2);
        assert!(rb.write(&[5, 6]));
        assert_eq!(rb.used(), 4);

        // Data wraps: the first span runs to the buffer end, the second
        // restarts at index 0.
        let (a, b) = rb.peek(4);
        assert_eq!(a, &[2, 3, 5]);
        assert_eq!(b, &[6]);

        rb.commit_read(3);
        assert_eq!(rb.used(), 1);
        assert_eq!(peeked(&rb, 1), [6]);
        assert_eq!(rb.capacity(), 5);
    }

    #[test]
    fn peek_empty_yields_nothing() {
        let mut rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3]);
        rb.commit_read(3);
        let (a, b) = rb.peek(8);
        assert!(a.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn commit_read_saturates() {
        let mut rb = RingBuffer::new(4);
        rb.write(&[9, 9]);
        rb.commit_read(100);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn growth_preserves_order_and_never_shrinks() {
        let mut rb = RingBuffer::new(4);
        rb.write(&[1, 2, 3]);
        rb.commit_read(2);
        // Force a wrap, then a grow.
        rb.write(&[4, 5, 6]);
        rb.write(&[7, 8, 9, 10, 11]);
        assert!(rb.capacity() >= 9);
        let grown = rb.capacity();
        assert_eq!(peeked(&rb, 16), [3, 4, 5, 6, 7, 8, 9, 10, 11]);

        rb.commit_read(9);
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.capacity(), grown);
    }

    #[test]
    fn linear_write_reservation() {
        let mut rb = RingBuffer::new(10);
        let span = rb.ensure_linear_write(6);
        span.copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert!(rb.commit_written(6));
        assert_eq!(rb.used(), 6);
        assert_eq!(peeked(&rb, 6), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn commit_written_rejects_overrun() {
        let mut rb = RingBuffer::new(4);
        rb.ensure_linear_write(4);
        assert!(!rb.commit_written(5));
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn interleaved_reserve_and_drain() {
        let mut rb = RingBuffer::new(10);
        let mut caps = Vec::new();

        for i in 0..1000u32 {
            let span = rb.ensure_linear_write(50);
            for (k, byte) in span.iter_mut().enumerate() {
                *byte = (i as usize + k) as u8;
            }
            assert!(rb.commit_written(50));
            rb.commit_read(25);
            caps.push(rb.capacity());
        }

        // Capacity is non-decreasing throughout.
        assert!(caps.windows(2).all(|w| w[0] <= w[1]));

        // Drain completely; the grown capacity sticks.
        let high = rb.capacity();
        rb.commit_read(rb.used());
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.capacity(), high);
        // Doubling from 10 never exceeds twice the high-water mark (~25 KiB).
        assert!(high <= 64 * 1024);
    }

    #[test]
    fn read_equals_write_prefix() {
        // Model check: for a deterministic interleaving of writes and reads,
        // the concatenation of read bytes equals the prefix of written bytes.
        let mut rb = RingBuffer::new(7);
        let mut written = Vec::new();
        let mut consumed = Vec::new();
        let mut seed = 0x2545_f491u32;

        for round in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let n = (seed >> 16) as usize % 13;
            let chunk: Vec<u8> = (0..n).map(|k| (round + k) as u8).collect();
            rb.write(&chunk);
            written.extend_from_slice(&chunk);

            let take = (seed >> 8) as usize % 9;
            let got = peeked(&rb, take);
            rb.commit_read(got.len());
            consumed.extend_from_slice(&got);
        }

        let got = peeked(&rb, rb.used());
        rb.commit_read(got.len());
        consumed.extend_from_slice(&got);

        assert_eq!(consumed, written);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn io_read_drains() {
        use std::io::Read;

        let mut rb = RingBuffer::new(4);
        rb.write(&[1, 2, 3]);
        rb.commit_read(2);
        rb.write(&[4, 5]); // wraps

        let mut out = [0u8; 8];
        let n = rb.read(&mut out).unwrap();
        assert_eq!(&out[..n], &[3, 4, 5]);
        let n = rb.read(&mut out).unwrap();
        assert_eq!(n, 0);
    }
}
