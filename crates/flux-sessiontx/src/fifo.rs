//! Shared-memory-backed byte ring used for the per-session RX/TX fifos.
//!
//! Structurally this mirrors `flux_communication::queue::InnerQueue`: a fixed
//! header followed by an unsized tail buffer, allocated either on the heap or
//! in a `shared_memory` mapping opened via an flink path. Unlike `InnerQueue`
//! this is a plain byte ring (no per-slot seqlock) since the engine only ever
//! has one producer (the application) and one consumer (this engine) per
//! fifo.

use std::{
    alloc::Layout,
    cell::UnsafeCell,
    path::Path,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use flux_utils::{directories::shmem_dir_queues, safe_assert};
use shared_memory::ShmemConf;

use crate::error::SessionTxError;

#[repr(C, align(64))]
struct FifoHeader {
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    event_pending: AtomicU8,
}

#[repr(C, align(64))]
struct InnerFifo {
    header: FifoHeader,
    buffer: [UnsafeCell<u8>],
}

unsafe impl Send for InnerFifo {}
unsafe impl Sync for InnerFifo {}

impl InnerFifo {
    const fn size_of(capacity: usize) -> usize {
        size_of::<FifoHeader>() + capacity
    }

    fn new(capacity: usize) -> *const Self {
        let real_cap = capacity.next_power_of_two();
        let size = Self::size_of(real_cap);
        unsafe {
            let ptr = std::alloc::alloc_zeroed(
                Layout::array::<u8>(size).unwrap().align_to(64).unwrap().pad_to_align(),
            );
            Self::init_at(ptr, real_cap)
        }
    }

    unsafe fn init_at(ptr: *mut u8, capacity: usize) -> *const Self {
        unsafe {
            let f = std::ptr::slice_from_raw_parts_mut(ptr, capacity) as *mut Self;
            (*f).header.mask = capacity - 1;
            (*f).header.head = AtomicUsize::new(0);
            (*f).header.tail = AtomicUsize::new(0);
            (*f).header.event_pending = AtomicU8::new(0);
            f
        }
    }

    fn create_or_open_shared<P: AsRef<Path>>(path: P, capacity: usize) -> *const Self {
        let capacity = capacity.next_power_of_two();
        let _ = std::fs::create_dir_all(path.as_ref().parent().unwrap());
        match ShmemConf::new().size(Self::size_of(capacity)).flink(&path).create() {
            Ok(shmem) => {
                let ptr = shmem.as_ptr();
                std::mem::forget(shmem);
                unsafe { Self::init_at(ptr, capacity) }
            }
            Err(shared_memory::ShmemError::LinkExists) => {
                Self::open_shared(&path, capacity).unwrap_or_else(|e| {
                    panic!("couldn't open preexisting fifo at {:?}: {e}", path.as_ref())
                })
            }
            Err(e) => panic!("couldn't create shmem fifo at {:?}: {e}", path.as_ref()),
        }
    }

    fn open_shared<P: AsRef<Path>>(
        path: P,
        expected_capacity: usize,
    ) -> Result<*const Self, SessionTxError> {
        if !path.as_ref().exists() {
            return Err(SessionTxError::NonExistingFile);
        }
        let shmem = ShmemConf::new().flink(&path).open()?;
        let len = shmem.len();
        let needed = Self::size_of(expected_capacity);
        if len < needed {
            return Err(SessionTxError::TooSmall(len, needed));
        }
        let ptr = shmem.as_ptr();
        std::mem::forget(shmem);
        Ok(std::ptr::slice_from_raw_parts_mut(ptr, expected_capacity) as *const Self)
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.header.mask + 1
    }

    #[inline]
    fn idx(&self, pos: usize) -> usize {
        pos & self.header.mask
    }

    #[inline]
    fn readable(&self) -> usize {
        let tail = self.header.tail.load(Ordering::Acquire);
        let head = self.header.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[inline]
    unsafe fn read_at(&self, pos: usize) -> u8 {
        unsafe { *self.buffer.get_unchecked(self.idx(pos)).get() }
    }

    #[inline]
    unsafe fn write_at(&self, pos: usize, b: u8) {
        unsafe { *self.buffer.get_unchecked(self.idx(pos)).get() = b }
    }

    fn peek(&self, offset: usize, out: &mut [u8]) -> usize {
        let readable = self.readable();
        if offset >= readable {
            return 0;
        }
        let n = out.len().min(readable - offset);
        let head = self.header.head.load(Ordering::Relaxed);
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            *slot = unsafe { self.read_at(head + offset + i) };
        }
        n
    }

    fn dequeue(&self, out: &mut [u8]) -> usize {
        let n = self.peek(0, out);
        self.header.head.fetch_add(n, Ordering::Release);
        n
    }

    fn dequeue_drop(&self, len: usize) {
        let n = len.min(self.readable());
        self.header.head.fetch_add(n, Ordering::Release);
    }

    fn overwrite_head(&self, bytes: &[u8]) {
        safe_assert!(bytes.len() <= self.readable());
        let head = self.header.head.load(Ordering::Relaxed);
        for (i, &b) in bytes.iter().enumerate() {
            unsafe { self.write_at(head + i, b) };
        }
    }

    fn enqueue(&self, data: &[u8]) -> usize {
        let tail = self.header.tail.load(Ordering::Relaxed);
        let head = self.header.head.load(Ordering::Acquire);
        let free = self.capacity() - tail.wrapping_sub(head);
        let n = data.len().min(free);
        for (i, &b) in data.iter().take(n).enumerate() {
            unsafe { self.write_at(tail + i, b) };
        }
        self.header.tail.fetch_add(n, Ordering::Release);
        n
    }

    fn set_event(&self) -> bool {
        self.header.event_pending.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn unset_event(&self) {
        self.header.event_pending.store(0, Ordering::Release);
    }
}

/// Handle to a session's fifo. Cheap to copy, valid for as long as the
/// backing allocation (heap or shared memory) lives.
#[derive(Clone, Copy)]
pub struct SessionFifo {
    inner: *const InnerFifo,
}

impl SessionFifo {
    /// Allocates an unshared, process-local fifo. Used by tests and by
    /// single-process deployments that don't need cross-process fifos.
    pub fn new_heap(capacity: usize) -> Self {
        Self { inner: InnerFifo::new(capacity) }
    }

    pub fn create_or_open_shared(app_name: &str, name: &str, capacity: usize) -> Self {
        let path = shmem_dir_queues(app_name).join(name);
        Self { inner: InnerFifo::create_or_open_shared(path, capacity) }
    }

    pub fn open_shared(
        app_name: &str,
        name: &str,
        capacity: usize,
    ) -> Result<Self, SessionTxError> {
        let path = shmem_dir_queues(app_name).join(name);
        Ok(Self { inner: InnerFifo::open_shared(path, capacity)? })
    }

    #[inline]
    fn inner(&self) -> &InnerFifo {
        unsafe { &*self.inner }
    }

    /// Bytes currently available to read, without mutating read position.
    #[inline]
    pub fn readable_bytes(&self) -> u32 {
        self.inner().readable() as u32
    }

    /// Non-destructive read starting `offset` bytes past the current read
    /// cursor. Returns the number of bytes actually copied into `out`.
    pub fn peek(&self, offset: u32, out: &mut [u8]) -> u32 {
        self.inner().peek(offset as usize, out) as u32
    }

    /// Destructive read: copies into `out` and advances the read cursor by
    /// the number of bytes copied.
    pub fn dequeue(&self, out: &mut [u8]) -> u32 {
        self.inner().dequeue(out) as u32
    }

    /// Advances the read cursor by `len` bytes without copying anything out.
    pub fn dequeue_drop(&self, len: u32) {
        self.inner().dequeue_drop(len as usize);
    }

    /// Overwrites the first `bytes.len()` readable bytes in place, without
    /// moving the read cursor. Used to persist an advanced datagram
    /// pre-header back into the fifo.
    pub fn overwrite_head(&self, bytes: &[u8]) {
        self.inner().overwrite_head(bytes);
    }

    /// Producer-side append, used by application code and by tests that
    /// simulate one.
    pub fn enqueue(&self, data: &[u8]) -> u32 {
        self.inner().enqueue(data) as u32
    }

    /// Arms the "has data" event for this fifo if it wasn't already armed.
    /// Returns true iff this call transitioned it from unarmed to armed.
    pub fn set_event(&self) -> bool {
        self.inner().set_event()
    }

    pub fn unset_event(&self) {
        self.inner().unset_event();
    }
}

unsafe impl Send for SessionFifo {}
unsafe impl Sync for SessionFifo {}
