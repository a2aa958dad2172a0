use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::request::{Frame, RequestInfo, RequestNr, RequestOutcome, WaitTimeout};
use crate::telemetry::{DriverStatistics, StatisticsSnapshot};

/// 设备基本信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 唯一序列号，也用于 `DeviceManager::open`
    pub serial: String,

    /// 产品型号 (e.g. "mvBlueFOX3-2032C")，用于通配符过滤
    pub product: String,

    /// 产品家族 (e.g. "mvBlueFOX3")
    pub family: String,
}

/// 采集启动/停止的责任方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionStartStop {
    /// 驱动在第一次提交时自动开始
    #[default]
    Default,
    /// 应用需要显式调用 start/stop
    User,
}

/// 当前配置下一块捕获缓冲的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub image_size: usize,
    /// 图像之后附带的 chunk/footer 数据
    pub footer_size: usize,
    pub line_pitch: usize,
    /// DMA 起始地址对齐要求 (字节)
    pub alignment: usize,
}

impl BufferLayout {
    /// 用户内存需要的最小字节数
    pub fn buffer_size(&self) -> usize {
        self.image_size + self.footer_size
    }
}

bitflags! {
    /// `reset_queue` 选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResetFlags: u32 {
        /// 唤醒所有阻塞在 `wait_for_request` 上的线程
        const ABORT_WAITERS = 1 << 0;
        /// 连同应用仍锁定的 Request 一起归还
        const INCLUDE_LOCKED = 1 << 1;
    }
}

/// 1. 驱动入口：设备枚举与打开
pub trait DeviceManager: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// 打开设备，返回它的 Request 队列接口
    fn open(&self, serial: &str) -> Result<Arc<dyn RequestDriver>>;
}

/// 2. 驱动的 Request 队列接口
///
/// 所有方法都只借用 `&self`：驱动内部自行加锁，
/// 这样控制线程可以在工作线程阻塞等待时调用 `reset_queue` 把它唤醒。
/// 预期内的 "队列满"/"超时" 通过 [`RequestOutcome`] 返回；
/// 只有违反契约 (失效编号、状态不对) 才返回 `Err(ContractViolation)`。
pub trait RequestDriver: Send + Sync {
    /// 当前配置的槽位数量
    fn request_count(&self) -> usize;

    /// 把下一个空闲槽位放入采集队列
    fn submit_request(&self) -> RequestOutcome<RequestNr>;

    /// 把指定槽位放入采集队列 (用于采集到特定的用户缓冲)
    fn submit_request_to(&self, request: RequestNr) -> RequestOutcome<RequestNr>;

    /// 阻塞等待一个已完成的 Request。这是稳态循环里唯一的阻塞点。
    fn wait_for_request(&self, timeout: WaitTimeout) -> RequestOutcome<RequestNr>;

    /// 查询槽位元数据 (图像地址、尺寸、结果码 ...)
    fn request_info(&self, request: RequestNr) -> Result<RequestInfo>;

    /// 把一块用户内存挂到槽位上。驱动拒绝时返回 `AttachRejected`。
    fn attach_user_buffer(&self, request: RequestNr, address: usize, size: usize) -> Result<()>;

    /// 把槽位恢复为驱动内存。失败时返回 `DetachRejected`。
    fn detach_user_buffer(&self, request: RequestNr) -> Result<()>;

    /// 把之前取回的槽位交还给驱动
    fn unlock_request(&self, request: RequestNr) -> Result<()>;

    /// 把所有槽位冲回空闲状态
    fn reset_queue(&self, flags: ResetFlags) -> Result<()>;

    fn capture_buffer_layout(&self) -> Result<BufferLayout>;

    fn statistics(&self) -> DriverStatistics;

    fn acquisition_start_stop(&self) -> AcquisitionStartStop {
        AcquisitionStartStop::Default
    }

    fn start_acquisition(&self) -> Result<()> {
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<()> {
        Ok(())
    }
}

/// 3. 消费端：显示、统计、错误上报
pub trait FrameSink: Send {
    /// 收到一个 OK 帧。`frame` 在下一轮循环之前一直有效 (双缓冲保证)。
    fn on_frame_ready(&mut self, frame: &Frame<'_>);

    fn on_statistics(&mut self, _stats: &StatisticsSnapshot) {}

    fn on_error(&mut self, _message: &str) {}
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn on_frame_ready(&mut self, frame: &Frame<'_>) {
        (**self).on_frame_ready(frame)
    }

    fn on_statistics(&mut self, stats: &StatisticsSnapshot) {
        (**self).on_statistics(stats)
    }

    fn on_error(&mut self, message: &str) {
        (**self).on_error(message)
    }
}

/// 只用于测试或基准的空消费端
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_frame_ready(&mut self, _frame: &Frame<'_>) {}
}
