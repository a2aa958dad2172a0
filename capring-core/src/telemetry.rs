use std::fmt;

use crate::pixel_format::PixelFormat;

/// 驱动自身维护的统计量
///
/// 由 `RequestDriver::statistics` 定期查询，不随每一帧变化。
#[derive(Clone, Default, PartialEq)]
pub struct DriverStatistics {
    pub frames_per_second: f64,
    /// 驱动累计的错误帧数
    pub error_count: u64,
    /// 最近一帧的采集耗时 (秒)
    pub capture_time_s: f64,
    /// 链路带宽占用 (KB/s)
    pub bandwidth_consumed_kbps: Option<u64>,
}

impl fmt::Debug for DriverStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverStatistics")
            .field("fps", &self.frames_per_second)
            .field("errors", &self.error_count)
            .field("capture_s", &self.capture_time_s)
            .field("kbps", &self.bandwidth_consumed_kbps.unwrap_or(0))
            .finish()
    }
}

/// 采集循环自己维护的计数器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    /// 预热阶段成功提交的 Request 数
    pub primed: u64,
    /// 总共成功提交次数 (含预热)
    pub submits: u64,
    /// 提交时遇到队列饱和的次数
    pub saturations: u64,
    /// 提交返回意外错误码的次数
    pub submit_errors: u64,
    /// 等待超时次数
    pub timeouts: u64,
    /// 等待返回意外错误码的次数
    pub wait_errors: u64,
    /// 结果 OK 的帧
    pub frames_ok: u64,
    /// 结果非 OK 的帧
    pub frames_failed: u64,
    /// 因为积压被直接丢弃的帧
    pub frames_dropped: u64,
    /// 归还给驱动的 Request 数
    pub unlocks: u64,
    /// 用户内存被替换的次数
    pub buffer_swaps: u64,
    /// 替换用户内存失败的次数
    pub buffer_swap_failures: u64,
    /// 缓冲校验发现的不一致
    pub validation_mismatches: u64,
}

impl CaptureCounters {
    /// 从驱动拿到的帧总数 (不含丢弃)
    pub fn frames_received(&self) -> u64 {
        self.frames_ok + self.frames_failed
    }
}

/// 周期性统计输出
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSnapshot {
    pub label: String,
    pub counters: CaptureCounters,
    pub driver: DriverStatistics,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Info from {}: FramesPerSecond: {:.1}, ErrorCount: {}, CaptureTime_s: {:.6}, \
             CaptureDimension: {}x{}({})",
            self.label,
            self.driver.frames_per_second,
            self.driver.error_count,
            self.driver.capture_time_s,
            self.width,
            self.height,
            self.pixel_format
        )?;
        if let Some(kbps) = self.driver.bandwidth_consumed_kbps {
            write!(f, ", BandwidthConsumed: {} KB/s", kbps)?;
        }
        Ok(())
    }
}
