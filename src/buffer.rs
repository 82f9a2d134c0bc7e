use bytes::{Bytes, BytesMut};

/// Allocates writable byte regions for channel reads.
///
/// The returned region is reused only by the processor; payloads handed to
/// user code are always copied out of it first.
#[derive(Debug, Default)]
pub struct BufAllocator;

impl BufAllocator {
    /// Create a new allocator
    pub fn new() -> BufAllocator {
        BufAllocator
    }

    /// Produce a zeroed writable region of the requested capacity.
    pub fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::zeroed(capacity)
    }
}

/// A queued outbound buffer with a read cursor.
///
/// Producers enqueue whole payloads; the processor drains them in chunks,
/// advancing the cursor as the kernel accepts bytes. The backing payload is
/// never mutated, so event payloads are cheap clones of the same `Bytes`.
#[derive(Debug)]
pub struct WriteBuf {
    data: Bytes,
    pos: usize,
}

impl WriteBuf {
    /// Wrap a payload with the cursor at the start.
    pub fn new(data: Bytes) -> WriteBuf {
        WriteBuf { data, pos: 0 }
    }

    /// Number of bytes not yet accepted by the kernel.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true while any bytes remain.
    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// The unsent tail of the payload.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Advance the cursor past `n` accepted bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining byte count.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advanced past the end of the buffer");
        self.pos += n;
    }

    /// The whole payload, independent of the cursor.
    pub fn payload(&self) -> Bytes {
        self.data.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_requested_capacity() {
        let allocator = BufAllocator::new();
        let buf = allocator.allocate(2048);
        assert_eq!(2048, buf.len());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_buf_cursor() {
        let mut buf = WriteBuf::new(Bytes::from_static(b"hello"));
        assert_eq!(5, buf.remaining());
        assert_eq!(b"hello", buf.chunk());

        buf.advance(2);
        assert_eq!(3, buf.remaining());
        assert_eq!(b"llo", buf.chunk());
        assert_eq!(Bytes::from_static(b"hello"), buf.payload());

        buf.advance(3);
        assert!(!buf.has_remaining());
        assert_eq!(b"", buf.chunk());
    }

    #[test]
    #[should_panic]
    fn write_buf_advance_past_end() {
        let mut buf = WriteBuf::new(Bytes::from_static(b"ab"));
        buf.advance(3);
    }
}
