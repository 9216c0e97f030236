//! TX buffer pool: the pool of packet buffers the engine fills with bytes
//! dequeued from a session's tx fifo before handing them to the next node.
//!
//! A buffer chain is a head buffer plus zero or more linked tail buffers,
//! used when a segment's payload doesn't fit in a single pool buffer.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        const LOCALLY_ORIGINATED = 1 << 0;
        const NEXT_PRESENT       = 1 << 1;
    }
}

/// Opaque handle into a `BufferPool`. Cheap to copy, meaningless outside the
/// pool that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct BufferHandle(u32);

/// A single packet buffer: a fixed-size allocation with a headroom region
/// reserved for the transport to prepend its header into, a payload region,
/// and an optional link to a continuation buffer.
pub struct TxBuffer {
    data: Box<[u8]>,
    pub current_data: usize,
    pub current_length: usize,
    pub next_buffer: Option<BufferHandle>,
    pub flags: BufferFlags,
    pub total_length_not_including_first_buffer: u32,
}

impl TxBuffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            current_data: 0,
            current_length: 0,
            next_buffer: None,
            flags: BufferFlags::empty(),
            total_length_not_including_first_buffer: 0,
        }
    }

    /// Resets a buffer for reuse, reserving `headroom` bytes at the front
    /// for the transport's header push.
    pub fn reset(&mut self, headroom: usize) {
        self.current_data = headroom;
        self.current_length = 0;
        self.next_buffer = None;
        self.flags = BufferFlags::empty();
        self.total_length_not_including_first_buffer = 0;
    }

    #[inline]
    pub fn headroom_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.current_data]
    }

    /// Mutable view over the first `len` payload bytes, starting at
    /// `current_data`. Panics if `len` doesn't fit in the buffer.
    #[inline]
    pub fn payload_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.data[self.current_data..self.current_data + len]
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.current_data..self.current_data + self.current_length]
    }

    /// Raw access into the backing allocation by absolute offset, ignoring
    /// `current_data`. Used by transports to write header bytes into
    /// reserved headroom, ahead of the payload.
    #[inline]
    pub fn raw_mut_range(&mut self, start: usize, len: usize) -> &mut [u8] {
        &mut self.data[start..start + len]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total bytes carried by this buffer and every buffer chained after it.
    #[inline]
    pub fn total_length(&self) -> u32 {
        self.current_length as u32 + self.total_length_not_including_first_buffer
    }
}

/// Allocator for `TxBuffer`s. `alloc_bulk` is best-effort: it may return
/// fewer buffers than requested when the pool is under pressure, and callers
/// must treat a short allocation as a defer/backoff signal rather than an
/// error.
pub trait BufferPool: Send {
    fn buffer_size(&self) -> usize;
    fn headroom(&self) -> usize;

    /// Appends up to `wanted` freshly reset buffer handles to `out`, returning
    /// how many were actually appended.
    fn alloc_bulk(&mut self, out: &mut Vec<BufferHandle>, wanted: usize) -> usize;

    fn get(&self, handle: BufferHandle) -> &TxBuffer;
    fn get_mut(&mut self, handle: BufferHandle) -> &mut TxBuffer;
}

/// Plain heap-backed buffer pool. Grows on demand up to an optional cap;
/// with no cap it never fails an allocation, which is useful for tests that
/// don't care about exhaustion, and `with_capacity` is used by tests that do.
pub struct HeapBufferPool {
    buffer_size: usize,
    headroom: usize,
    slab: Vec<TxBuffer>,
    free_list: Vec<BufferHandle>,
    max_buffers: Option<usize>,
}

impl HeapBufferPool {
    pub fn new(buffer_size: usize, headroom: usize) -> Self {
        Self { buffer_size, headroom, slab: Vec::new(), free_list: Vec::new(), max_buffers: None }
    }

    pub fn with_capacity(buffer_size: usize, headroom: usize, max_buffers: usize) -> Self {
        Self {
            buffer_size,
            headroom,
            slab: Vec::with_capacity(max_buffers),
            free_list: Vec::new(),
            max_buffers: Some(max_buffers),
        }
    }

    /// Returns a previously-handed-out buffer to the pool's free list. The
    /// engine itself never calls this: once a buffer chain is published to
    /// the next node, its lifecycle belongs to whatever node frees it after
    /// consuming it. Tests use this to simulate that hand-back.
    pub fn recycle(&mut self, handle: BufferHandle) {
        self.free_list.push(handle);
    }

    pub fn allocated(&self) -> usize {
        self.slab.len()
    }
}

impl BufferPool for HeapBufferPool {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn headroom(&self) -> usize {
        self.headroom
    }

    fn alloc_bulk(&mut self, out: &mut Vec<BufferHandle>, wanted: usize) -> usize {
        let mut n = 0;
        while n < wanted {
            if let Some(h) = self.free_list.pop() {
                self.slab[h.0 as usize].reset(self.headroom);
                out.push(h);
                n += 1;
                continue;
            }
            if let Some(max) = self.max_buffers
                && self.slab.len() >= max
            {
                break;
            }
            let h = BufferHandle(self.slab.len() as u32);
            let mut buf = TxBuffer::new(self.buffer_size);
            buf.reset(self.headroom);
            self.slab.push(buf);
            out.push(h);
            n += 1;
        }
        n
    }

    fn get(&self, handle: BufferHandle) -> &TxBuffer {
        &self.slab[handle.0 as usize]
    }

    fn get_mut(&mut self, handle: BufferHandle) -> &mut TxBuffer {
        &mut self.slab[handle.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_bulk_grows_slab() {
        let mut pool = HeapBufferPool::new(128, 16);
        let mut out = Vec::new();
        assert_eq!(pool.alloc_bulk(&mut out, 4), 4);
        assert_eq!(pool.allocated(), 4);
        for h in &out {
            assert_eq!(pool.get(*h).current_data, 16);
        }
    }

    #[test]
    fn alloc_bulk_is_best_effort_under_cap() {
        let mut pool = HeapBufferPool::with_capacity(128, 16, 3);
        let mut out = Vec::new();
        assert_eq!(pool.alloc_bulk(&mut out, 10), 3);
        assert_eq!(pool.alloc_bulk(&mut out, 10), 0);
    }

    #[test]
    fn recycled_buffers_are_reused_before_growing() {
        let mut pool = HeapBufferPool::with_capacity(128, 16, 2);
        let mut out = Vec::new();
        pool.alloc_bulk(&mut out, 2);
        assert_eq!(pool.allocated(), 2);
        pool.recycle(out.remove(0));
        let mut out2 = Vec::new();
        assert_eq!(pool.alloc_bulk(&mut out2, 1), 1);
        assert_eq!(pool.allocated(), 2);
    }
}
