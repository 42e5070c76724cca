//! Lock-free Single-Producer Single-Consumer 字节环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 缓存友好：读写游标各自独占 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 游标是单调递增的逻辑位置，`pos % capacity` 才是物理偏移。
//! 跨越末尾的读写拆成两段 memcpy。

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 无锁字节环形缓冲区
///
/// 不变量：`write_pos - read_pos` 始终在 `[0, capacity]` 内。
/// 只允许一个线程推进 `write_pos`（生产者），一个线程推进 `read_pos`（消费者）。
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定容量（字节）的 Ring Buffer
    ///
    /// 容量不要求是 2 的幂：样本跨度可能是 3/6 字节（24-bit packed）
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> 与 u8 布局相同
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.data_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        let ptr = self.data_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }
        log::debug!("Ring buffer memory unlocked");
    }

    /// 写入字节（生产者调用）
    ///
    /// 返回实际写入的字节数，缓冲区满时可能少于 `src.len()`。
    /// wait-free，绝不阻塞
    pub fn write(&self, src: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let len = src.len().min(self.capacity - used);
        if len == 0 {
            return 0;
        }

        let offset = write % self.capacity;
        let first = len.min(self.capacity - offset);
        unsafe {
            let base = self.data_ptr();
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), first);
            if first < len {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), base, len - first);
            }
        }

        self.write_pos.fetch_add(len, Ordering::AcqRel);
        len
    }

    /// 拷贝出至多 `dst.len()` 字节，不推进读游标
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);

        let len = dst.len().min(write.wrapping_sub(read));
        if len == 0 {
            return 0;
        }

        let offset = read % self.capacity;
        let first = len.min(self.capacity - offset);
        unsafe {
            let base = self.data_ptr();
            ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), first);
            if first < len {
                ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), len - first);
            }
        }
        len
    }

    /// 读取字节（消费者调用）
    ///
    /// 返回实际读取的字节数。wait-free，绝不阻塞
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let len = self.peek(dst);
        if len > 0 {
            self.read_pos.fetch_add(len, Ordering::AcqRel);
        }
        len
    }

    /// 丢弃至多 `len` 字节而不拷贝（消费者调用）
    pub fn skip(&self, len: usize) -> usize {
        let len = len.min(self.buffered());
        if len > 0 {
            self.read_pos.fetch_add(len, Ordering::AcqRel);
        }
        len
    }

    /// 当前已填充字节数
    #[inline]
    pub fn buffered(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写字节数
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.buffered()
    }

    /// 容量（字节）
    #[inline]
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// 游标清零
    ///
    /// 调用方保证此时没有并发的 read/write（消费者已静止）
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
