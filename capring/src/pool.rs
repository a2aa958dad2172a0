use std::fmt;
use std::sync::Arc;

use capring_core::align::{align_up, alignment_slack};
use capring_core::error::{CaptureError, Result};
use capring_core::request::{MemoryMode, RequestNr};
use capring_core::traits::RequestDriver;

/// 用户内存的分配器
///
/// 缓冲池只通过这个接口申请和归还内存，测试可以换成计数分配器检查泄漏。
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, len: usize) -> Box<[u8]>;

    fn release(&self, block: Box<[u8]>);
}

/// 默认分配器：普通堆内存
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Box<[u8]> {
        vec![0u8; len].into_boxed_slice()
    }

    fn release(&self, block: Box<[u8]>) {
        drop(block);
    }
}

/// 一块带对齐偏移的用户捕获内存
///
/// 实际分配 `size + alignment` 字节，对外暴露向上对齐后的起始地址。
/// Drop 时把整块内存还给分配器。
pub struct CaptureBuffer {
    block: Option<Box<[u8]>>,
    offset: usize,
    size: usize,
    allocator: Arc<dyn BufferAllocator>,
}

impl CaptureBuffer {
    pub fn allocate(allocator: Arc<dyn BufferAllocator>, size: usize, alignment: usize) -> Self {
        let block = allocator.allocate(size + alignment_slack(alignment));
        let raw = block.as_ptr() as usize;
        let offset = align_up(raw, alignment) - raw;
        Self {
            block: Some(block),
            offset,
            size,
            allocator,
        }
    }

    /// 对齐后的起始地址，也就是 attach 给驱动的地址
    pub fn address(&self) -> usize {
        self.raw_address() + self.offset
    }

    /// 分配器返回的原始地址
    pub fn raw_address(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.as_ptr() as usize)
    }

    /// 可用字节数 (不含对齐余量)
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.block {
            Some(block) => &block[self.offset..self.offset + self.size],
            None => &[],
        }
    }
}

impl fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for CaptureBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    request: RequestNr,
    buffer: CaptureBuffer,
}

/// 用户捕获内存池
///
/// 在用户内存模式下维护 "槽位 <-> 缓冲" 的一一对应；驱动内存模式下保持为空。
/// 缓冲的尺寸和对齐在 [`create_all_buffers`](Self::create_all_buffers) 时确定，
/// 整个会话内保持不变。
pub struct CaptureBufferPool {
    driver: Arc<dyn RequestDriver>,
    allocator: Arc<dyn BufferAllocator>,
    entries: Vec<PoolEntry>,
    /// (buffer_size, alignment)
    geometry: Option<(usize, usize)>,
}

impl CaptureBufferPool {
    pub fn new(driver: Arc<dyn RequestDriver>) -> Self {
        Self::with_allocator(driver, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(
        driver: Arc<dyn RequestDriver>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            driver,
            allocator,
            entries: Vec::new(),
            geometry: None,
        }
    }

    /// 分配一块对齐内存并 attach 到 `request`
    ///
    /// 驱动拒绝时内存立刻释放，池中不会留下条目。成功时返回对齐后的地址。
    pub fn create_buffer(
        &mut self,
        size: usize,
        alignment: usize,
        request: RequestNr,
    ) -> Result<usize> {
        let buffer = CaptureBuffer::allocate(self.allocator.clone(), size, alignment);
        let address = buffer.address();

        if let Err(e) = self.driver.attach_user_buffer(request, address, size) {
            tracing::warn!(
                target: "capring::pool",
                "An error occurred while attaching a buffer to request number {}: {}",
                request,
                e
            );
            // buffer 在这里被 drop，内存归还分配器
            return Err(e);
        }

        tracing::trace!(
            target: "capring::pool",
            "Attached {} bytes at {:#x} to request {}",
            size,
            address,
            request
        );
        self.entries.push(PoolEntry { request, buffer });
        Ok(address)
    }

    /// 为每个槽位创建缓冲
    ///
    /// 先清理已有条目 (可重复调用)。任何一个槽位失败都会回滚本次创建的全部缓冲，
    /// 并把驱动的错误原样返回。
    pub fn create_all_buffers(&mut self, size: usize, alignment: usize) -> Result<()> {
        self.free_all_buffers();
        self.geometry = Some((size, alignment));

        let count = self.driver.request_count();
        for index in 0..count {
            let request = RequestNr::from(index);
            if let Err(e) = self.create_buffer(size, alignment, request) {
                let rolled_back = self.entries.len();
                self.free_all_buffers();
                tracing::error!(
                    target: "capring::pool",
                    "Creating capture buffers failed at request {} ({} buffers rolled back)",
                    request,
                    rolled_back
                );
                return Err(e);
            }
        }

        tracing::debug!(
            target: "capring::pool",
            "Created {} capture buffers ({} bytes, alignment {})",
            count,
            size,
            alignment
        );
        Ok(())
    }

    /// 按会话开始时记录的尺寸和对齐，为 `request` 重新创建缓冲
    pub fn recreate_buffer(&mut self, request: RequestNr) -> Result<usize> {
        let (size, alignment) = self.geometry.ok_or_else(|| {
            CaptureError::ContractViolation(
                "recreate_buffer called before create_all_buffers".into(),
            )
        })?;
        self.create_buffer(size, alignment, request)
    }

    /// 从槽位上取下用户内存并释放对应的池条目
    ///
    /// 先读取槽位当前的图像地址，再 detach；detach 失败只记日志，
    /// 仍然按地址查找并移除池条目。
    pub fn free_buffer(&mut self, request: RequestNr) {
        let info = match self.driver.request_info(request) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    target: "capring::pool",
                    "Can't query request {} while freeing its buffer: {}",
                    request,
                    e
                );
                return;
            }
        };

        if info.memory_mode == MemoryMode::User {
            if let Err(e) = self.driver.detach_user_buffer(request) {
                tracing::warn!(
                    target: "capring::pool",
                    "An error occurred while detaching a buffer from request number {}: {}",
                    request,
                    e
                );
            }
        }

        if let Some(pos) = self
            .entries
            .iter()
            .position(|entry| entry.buffer.address() == info.image_address)
        {
            let entry = self.entries.remove(pos);
            tracing::trace!(
                target: "capring::pool",
                "Released buffer {:#x} (attached to request {})",
                entry.buffer.address(),
                entry.request
            );
        }
    }

    /// 释放所有槽位上的缓冲
    ///
    /// 返回调用之后仍残留在池中的条目数。残留说明绑定层记账出了问题，
    /// 会以 error 级别打印出全部地址，然后照样释放，调用之后池一定为空。
    pub fn free_all_buffers(&mut self) -> usize {
        for index in 0..self.driver.request_count() {
            self.free_buffer(RequestNr::from(index));
        }

        let leftover = self.entries.len();
        if leftover > 0 {
            tracing::error!(
                target: "capring::pool",
                "{} capture buffer(s) left in the pool after freeing all requests: {}",
                leftover,
                format_addresses(&self.addresses())
            );
            self.entries.clear();
        }
        leftover
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 池中所有缓冲的对齐地址，按创建顺序
    pub fn addresses(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.buffer.address()).collect()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.find(address).is_some()
    }

    /// 按对齐地址查找缓冲 (线性扫描，槽位数量很小)
    pub fn find(&self, address: usize) -> Option<&CaptureBuffer> {
        self.entries
            .iter()
            .find(|e| e.buffer.address() == address)
            .map(|e| &e.buffer)
    }

    /// 最近一次 attach 到 `request` 的缓冲
    pub fn buffer_for(&self, request: RequestNr) -> Option<&CaptureBuffer> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.request == request)
            .map(|e| &e.buffer)
    }

    /// (buffer_size, alignment)
    pub fn geometry(&self) -> Option<(usize, usize)> {
        self.geometry
    }
}

impl fmt::Debug for CaptureBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBufferPool")
            .field("entries", &self.entries)
            .field("geometry", &self.geometry)
            .finish()
    }
}

/// `[0]: 0x1000, [1]: 0x2000` 形式的地址列表
pub(crate) fn format_addresses(addresses: &[usize]) -> String {
    addresses
        .iter()
        .enumerate()
        .map(|(i, a)| format!("[{}]: {:#x}", i, a))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_start_is_aligned_and_inside_block() {
        for alignment in [0, 1, 2, 64, 4096] {
            let buf = CaptureBuffer::allocate(Arc::new(HeapAllocator), 100, alignment);
            assert!(capring_core::align::is_aligned(buf.address(), alignment));
            assert!(buf.address() >= buf.raw_address());
            assert_eq!(buf.as_slice().len(), 100);
        }
    }

    #[test]
    fn address_list_format() {
        assert_eq!(format_addresses(&[0x10, 0x2000]), "[0]: 0x10, [1]: 0x2000");
        assert_eq!(format_addresses(&[]), "");
    }
}
