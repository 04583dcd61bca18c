//! Packet buffer pool shared by every bridge worker
//!
//! Pre-allocates one mmap'd region (hugepages if available) split into
//! fixed-size buffers. The free list is lock-free, and each worker keeps a
//! small [`PoolCache`] in front of it so the hot path rarely touches the
//! shared queue.

use std::io;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use nix::libc;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;

/// Maximum size of a single packet
pub const MAX_PACKET_SIZE: usize = 2048;

/// Headroom reserved in front of the packet data
pub const HEADROOM: usize = 128;

/// Size of the data room of each buffer
pub const MBUF_DATA_SIZE: usize = MAX_PACKET_SIZE + HEADROOM;

/// Maximum number of buffers moved in one burst
pub const MAX_PKT_BURST: usize = 32;

/// Default number of buffers in the pool
pub const NB_MBUF: usize = 8192 * 16;

/// Default number of buffers kept in each per-worker cache
pub const MEMPOOL_CACHE_SIZE: usize = MAX_PKT_BURST;

/// MPOL_PREFERRED from linux/mempolicy.h
const MPOL_PREFERRED: libc::c_int = 1;

/// Highest NUMA node we can express in the mbind node mask
const MAX_NUMA_NODES: usize = 1024;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("buffer pool capacity must be greater than zero")]
    EmptyPool,

    #[error("per-worker cache size {cache_size} exceeds pool capacity {capacity}")]
    CacheTooLarge { cache_size: usize, capacity: usize },

    #[error("buffer data room {data_room} is smaller than the required {required} bytes")]
    BufferTooSmall { data_room: usize, required: usize },

    #[error("buffer pool size overflows ({capacity} x {data_room})")]
    SizeOverflow { capacity: usize, data_room: usize },

    #[error("failed to map buffer pool memory: {0}")]
    Map(#[from] io::Error),
}

/// Parameters for [`BufferPool::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of buffers in the pool
    pub capacity: usize,
    /// Number of free buffers each worker may hold locally
    pub cache_size: usize,
    /// Bytes per buffer, headroom included
    pub data_room: usize,
    /// NUMA node the memory should live on
    pub numa_node: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: NB_MBUF,
            cache_size: MEMPOOL_CACHE_SIZE,
            data_room: MBUF_DATA_SIZE,
            numa_node: None,
        }
    }
}

/// Memory-mapped pool of fixed-size packet buffers
pub struct BufferPool {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Total size of mapped region
    size: usize,
    data_room: usize,
    capacity: usize,
    cache_size: usize,
    /// Free list (lock-free queue of buffer indices)
    free: ArrayQueue<u32>,
    /// Buffers currently handed out as [`PoolBuffer`]
    in_use: AtomicUsize,
    using_hugepages: bool,
    numa_node: Option<u32>,
}

// SAFETY: the mapped region is only reached through buffer indices, and an
// index is owned by exactly one PoolBuffer (or free list slot) at a time.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a new buffer pool
    ///
    /// Attempts to use 2MB hugepages for better TLB performance and falls
    /// back to regular pages. When a NUMA node is requested the region is
    /// bound to it before first touch.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.capacity == 0 {
            return Err(PoolError::EmptyPool);
        }
        if config.cache_size > config.capacity {
            return Err(PoolError::CacheTooLarge {
                cache_size: config.cache_size,
                capacity: config.capacity,
            });
        }
        if config.data_room < MBUF_DATA_SIZE {
            return Err(PoolError::BufferTooSmall {
                data_room: config.data_room,
                required: MBUF_DATA_SIZE,
            });
        }
        let too_big = PoolError::SizeOverflow {
            capacity: config.capacity,
            data_room: config.data_room,
        };
        if config.capacity > u32::MAX as usize {
            return Err(too_big);
        }
        let size = config.capacity.checked_mul(config.data_room).ok_or(too_big)?;

        let (ptr, using_hugepages) =
            Self::try_mmap_hugepages(size).or_else(|_| Self::mmap_regular(size))?;

        let base =
            NonNull::new(ptr).ok_or_else(|| io::Error::other("mmap returned null pointer"))?;

        if let Some(node) = config.numa_node
            && let Err(e) = bind_to_node(base.as_ptr(), size, node)
        {
            tracing::warn!(numa_node = node, error = %e, "Failed to bind buffer pool to NUMA node");
        }

        let free = ArrayQueue::new(config.capacity);
        for i in 0..config.capacity {
            // ArrayQueue::push only fails if full, which can't happen here
            let _ = free.push(i as u32);
        }

        tracing::info!(
            buffer_count = config.capacity,
            buffer_size = config.data_room,
            cache_size = config.cache_size,
            pool_size_mb = size / (1024 * 1024),
            hugepages = using_hugepages,
            numa_node = ?config.numa_node,
            "Buffer pool created"
        );

        Ok(Self {
            base,
            size,
            data_room: config.data_room,
            capacity: config.capacity,
            cache_size: config.cache_size,
            free,
            in_use: AtomicUsize::new(0),
            using_hugepages,
            numa_node: config.numa_node,
        })
    }

    fn try_mmap_hugepages(size: usize) -> io::Result<(*mut u8, bool)> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.as_ptr().cast(), true))
    }

    fn mmap_regular(size: usize) -> io::Result<(*mut u8, bool)> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;

        let ptr = unsafe {
            mmap_anonymous(
                None,
                size.try_into()
                    .map_err(|_| io::Error::other("size overflow"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok((ptr.as_ptr().cast(), false))
    }

    /// Allocate a buffer from the shared free list
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuffer> {
        self.free.pop().map(|index| self.wrap(index))
    }

    /// Number of buffers on the shared free list (excludes worker caches)
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers currently owned by someone outside the pool
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn data_room(&self) -> usize {
        self.data_room
    }

    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }

    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    #[inline]
    fn wrap(self: &Arc<Self>, index: u32) -> PoolBuffer {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PoolBuffer {
            pool: Arc::clone(self),
            index,
            start: HEADROOM,
            len: 0,
        }
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index is always < capacity (enforced by ArrayQueue capacity)
        unsafe { self.base.as_ptr().add(index as usize * self.data_room) }
    }

    #[inline]
    fn return_buffer(&self, index: u32) {
        // Only fails if full, which would mean a double free
        if self.free.push(index).is_err() {
            tracing::error!(index, "Buffer returned to a full pool");
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: self.base was allocated by mmap in new()
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().cast());
            let _ = munmap(ptr, self.size);
        }
    }
}

/// Bind `[ptr, ptr + size)` to a preferred NUMA node via mbind(2)
fn bind_to_node(ptr: *mut u8, size: usize, node: u32) -> io::Result<()> {
    const BITS: usize = libc::c_ulong::BITS as usize;
    let node = node as usize;
    if node >= MAX_NUMA_NODES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "NUMA node out of range",
        ));
    }

    let mut nodemask = [0 as libc::c_ulong; MAX_NUMA_NODES / BITS];
    nodemask[node / BITS] |= 1 << (node % BITS);

    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr,
            size,
            MPOL_PREFERRED,
            nodemask.as_ptr(),
            MAX_NUMA_NODES,
            0,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A buffer owned from the pool
///
/// Returns to the pool when dropped.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    start: usize,
    len: usize,
}

impl PoolBuffer {
    /// Immutable slice of the packet data
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: start and len are always within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts(ptr, self.len)
        }
    }

    /// Mutable slice of the packet data
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: start and len are always within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.len)
        }
    }

    /// Mutable slice from the data start to the end of the buffer
    ///
    /// Read a frame into this, then call [`PoolBuffer::set_len`].
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: start is always within buffer bounds
        unsafe {
            let ptr = self.pool.buffer_ptr(self.index).add(self.start);
            std::slice::from_raw_parts_mut(ptr, self.pool.data_room - self.start)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available for packet data after the headroom
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.data_room - self.start
    }

    /// Set the packet length
    ///
    /// # Panics
    /// Panics if `len` exceeds the buffer capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "packet length exceeds buffer");
        self.len = len;
    }

    /// Reset buffer to its freshly allocated state
    #[inline]
    pub fn reset(&mut self) {
        self.start = HEADROOM;
        self.len = 0;
    }

    /// Copy `frame` into the buffer, replacing its contents
    ///
    /// Returns false if the frame does not fit.
    pub fn fill(&mut self, frame: &[u8]) -> bool {
        self.reset();
        if frame.len() > self.capacity() {
            return false;
        }
        self.write_area()[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        true
    }

    /// Give up ownership without returning to the shared free list
    fn into_index(self) -> u32 {
        let this = ManuallyDrop::new(self);
        this.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: `this` is never dropped, so the Arc is released exactly once here
        drop(unsafe { std::ptr::read(&this.pool) });
        this.index
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);
        self.pool.return_buffer(self.index);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// Per-worker cache in front of the shared free list
///
/// Holds up to `cache_size` free buffer indices. Allocation refills it in
/// bulk, and frees go into it until it is full, at which point half of it is
/// flushed back to the pool.
pub struct PoolCache {
    pool: Arc<BufferPool>,
    cached: Vec<u32>,
}

impl PoolCache {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let cached = Vec::with_capacity(pool.cache_size);
        Self { pool, cached }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of free buffers held locally
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }

    #[inline]
    pub fn alloc(&mut self) -> Option<PoolBuffer> {
        if self.pool.cache_size == 0 {
            return self.pool.alloc();
        }
        if self.cached.is_empty() {
            self.refill();
        }
        self.cached.pop().map(|index| self.pool.wrap(index))
    }

    /// Allocate up to `n` buffers into `out`, returning how many were added
    pub fn alloc_bulk(&mut self, out: &mut Vec<PoolBuffer>, n: usize) -> usize {
        let mut added = 0;
        while added < n {
            match self.alloc() {
                Some(buf) => out.push(buf),
                None => break,
            }
            added += 1;
        }
        added
    }

    /// Return a buffer to this cache
    #[inline]
    pub fn free(&mut self, buf: PoolBuffer) {
        if self.pool.cache_size == 0 || !Arc::ptr_eq(&buf.pool, &self.pool) {
            drop(buf);
            return;
        }
        if self.cached.len() >= self.pool.cache_size {
            self.flush(self.pool.cache_size / 2);
        }
        self.cached.push(buf.into_index());
    }

    fn refill(&mut self) {
        while self.cached.len() < self.pool.cache_size {
            match self.pool.free.pop() {
                Some(index) => self.cached.push(index),
                None => break,
            }
        }
    }

    /// Flush until at most `keep` indices remain cached
    fn flush(&mut self, keep: usize) {
        while self.cached.len() > keep {
            if let Some(index) = self.cached.pop() {
                self.pool.return_buffer(index);
            }
        }
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(capacity: usize, cache_size: usize) -> Arc<BufferPool> {
        Arc::new(
            BufferPool::new(PoolConfig {
                capacity,
                cache_size,
                ..PoolConfig::default()
            })
            .expect("Failed to create pool"),
        )
    }

    #[test]
    fn test_pool_creation() {
        let pool = small_pool(64, 8);
        assert_eq!(pool.available(), 64);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.capacity(), 64);
    }

    #[test]
    fn test_rejects_undersized_buffers() {
        let err = BufferPool::new(PoolConfig {
            capacity: 8,
            cache_size: 0,
            data_room: 1518,
            numa_node: None,
        })
        .err()
        .expect("undersized pool must fail");
        assert!(matches!(err, PoolError::BufferTooSmall { data_room: 1518, .. }));
    }

    #[test]
    fn test_rejects_bad_sizing() {
        let empty = BufferPool::new(PoolConfig {
            capacity: 0,
            ..PoolConfig::default()
        });
        assert!(matches!(empty, Err(PoolError::EmptyPool)));

        let big_cache = BufferPool::new(PoolConfig {
            capacity: 4,
            cache_size: 8,
            ..PoolConfig::default()
        });
        assert!(matches!(big_cache, Err(PoolError::CacheTooLarge { .. })));
    }

    #[test]
    fn test_buffer_alloc_and_drop() {
        let pool = small_pool(16, 0);
        {
            let _buf = pool.alloc().expect("Failed to alloc");
            assert_eq!(pool.available(), 15);
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_buffer_fill_and_reset() {
        let pool = small_pool(4, 0);
        let mut buf = pool.alloc().expect("Failed to alloc");

        assert!(buf.fill(b"hello"));
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.capacity(), MAX_PACKET_SIZE);

        buf.reset();
        assert!(buf.is_empty());
        assert!(!buf.fill(&[0u8; MAX_PACKET_SIZE + 1]));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = small_pool(8, 0);
        let mut buffers: Vec<_> = (0..8).map(|_| pool.alloc().expect("alloc")).collect();

        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 8);

        buffers.pop();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_cache_conserves_buffers() {
        let pool = small_pool(32, 8);
        let mut cache = PoolCache::new(Arc::clone(&pool));

        let mut burst = Vec::new();
        assert_eq!(cache.alloc_bulk(&mut burst, 20), 20);
        assert_eq!(pool.in_use(), 20);
        assert_eq!(pool.available() + cache.len() + pool.in_use(), 32);

        for buf in burst.drain(..) {
            cache.free(buf);
        }
        assert_eq!(pool.in_use(), 0);
        assert!(cache.len() <= pool.cache_size());
        assert_eq!(pool.available() + cache.len(), 32);

        drop(cache);
        assert_eq!(pool.available(), 32);
    }

    #[test]
    fn test_cache_exhaustion_is_recoverable() {
        let pool = small_pool(4, 2);
        let mut cache = PoolCache::new(Arc::clone(&pool));
        let mut burst = Vec::new();

        assert_eq!(cache.alloc_bulk(&mut burst, 10), 4);
        assert!(cache.alloc().is_none());

        cache.free(burst.pop().expect("buffer"));
        assert!(cache.alloc().is_some());
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = small_pool(4, 0);
        let mut buf = pool.alloc().expect("Failed to alloc");
        assert!(buf.fill(b"hello"));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });

        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
    }
}
