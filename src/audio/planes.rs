//! 按 plane 组织的环形缓冲区组
//!
//! 每个 plane 一个 RingBuffer，所有 plane 总是以相同字节数同步读写。
//! 写入从最后一个 plane 开始，读取从第一个 plane 开始：
//! - plane 0 的已填充量是所有 plane 中最小的（读者看到的保守值）
//! - 最后一个 plane 的空闲量是所有 plane 中最小的（写者看到的保守值）
//!
//! 因此生产者和消费者都不需要锁也不会看到"半写入"的数据。

use super::format::AudioFormat;
use super::ring_buffer::RingBuffer;

/// plane 缓冲区组
pub struct ChannelBuffers {
    planes: Box<[RingBuffer]>,
    sstride: usize,
}

impl ChannelBuffers {
    /// 为格式分配能容纳 `samples` 个样本的缓冲区组
    pub fn new(format: &AudioFormat, samples: usize) -> Self {
        let sstride = format.sstride();
        let bytes = samples.max(1) * sstride;
        let planes: Vec<RingBuffer> = (0..format.num_planes()).map(|_| RingBuffer::new(bytes)).collect();

        Self {
            planes: planes.into_boxed_slice(),
            sstride,
        }
    }

    #[inline]
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    #[inline]
    pub fn sstride(&self) -> usize {
        self.sstride
    }

    /// 容量（样本数）
    #[inline]
    pub fn size(&self) -> usize {
        self.planes[0].size() / self.sstride
    }

    /// 可读样本数（plane 0 为保守下界）
    #[inline]
    pub fn buffered(&self) -> usize {
        self.planes[0].buffered() / self.sstride
    }

    /// 可写样本数（最后一个 plane 为保守下界）
    #[inline]
    pub fn available(&self) -> usize {
        self.planes[self.planes.len() - 1].available() / self.sstride
    }

    /// 最短的那个 plane 能放下多少样本；plane 数不够时为 0
    fn fit<T: AsRef<[u8]>>(&self, planes: &[T]) -> usize {
        if planes.len() < self.planes.len() {
            return 0;
        }
        planes.iter().map(|p| p.as_ref().len()).min().unwrap_or(0) / self.sstride
    }

    /// 写入至多 `samples` 个样本，返回实际写入数
    ///
    /// 还受最短的 `data[n]` 限制
    pub fn write(&self, data: &[&[u8]], samples: usize) -> usize {
        debug_assert_eq!(data.len(), self.planes.len());

        let samples = samples.min(self.available()).min(self.fit(data));
        let bytes = samples * self.sstride;
        if bytes == 0 {
            return 0;
        }

        for (plane, src) in self.planes.iter().zip(data).rev() {
            let written = plane.write(&src[..bytes]);
            debug_assert_eq!(written, bytes);
        }
        samples
    }

    /// 读取至多 `samples` 个样本到 `dst` 的前部，返回实际读取数
    pub fn read(&self, dst: &mut [&mut [u8]], samples: usize) -> usize {
        debug_assert_eq!(dst.len(), self.planes.len());

        let samples = samples.min(self.buffered()).min(self.fit(dst));
        let bytes = samples * self.sstride;
        if bytes == 0 {
            return 0;
        }

        for (plane, out) in self.planes.iter().zip(dst.iter_mut()) {
            let read = plane.read(&mut out[..bytes]);
            debug_assert_eq!(read, bytes);
        }
        samples
    }

    /// 拷贝至多 `samples` 个样本到各 `dst` 而不消费
    pub fn peek(&self, dst: &mut [Vec<u8>], samples: usize) -> usize {
        let samples = samples.min(self.buffered());
        let bytes = samples * self.sstride;

        for (plane, out) in self.planes.iter().zip(dst.iter_mut()) {
            out.resize(bytes, 0);
            plane.peek(out);
        }
        samples
    }

    /// 丢弃至多 `samples` 个样本
    pub fn skip(&self, samples: usize) -> usize {
        let samples = samples.min(self.buffered());
        for plane in self.planes.iter() {
            plane.skip(samples * self.sstride);
        }
        samples
    }

    /// 清空所有 plane（调用方保证无并发读写）
    pub fn reset(&self) {
        for plane in self.planes.iter() {
            plane.reset();
        }
    }

    /// 锁定所有 plane 的内存
    pub fn lock_memory(&self) -> bool {
        self.planes.iter().all(|p| p.lock_memory())
    }
}
