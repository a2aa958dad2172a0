use std::fmt::{self, Display};
use std::time::Duration;

use crate::error::DriverErrorCode;
use crate::pixel_format::PixelFormat;

/// 驱动侧 Request 槽位的不透明编号
///
/// 只是一个索引，驱动内部的真实对象永远不会暴露给应用层；
/// 需要元数据时通过 `RequestDriver::request_info` 重新查询。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RequestNr(pub u32);

impl RequestNr {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for RequestNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for RequestNr {
    fn from(index: usize) -> Self {
        Self(index as u32)
    }
}

/// 槽位生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// 空闲，可以提交
    Idle,
    /// 已进入采集队列
    Submitted,
    /// 已填充并交给应用 (处于锁定状态)
    Ready,
    /// 应用已归还，等待复用
    Unlocked,
}

impl RequestState {
    /// 是否允许再次提交
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Idle | Self::Unlocked)
    }
}

/// 图像内存由谁分配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// 驱动自己分配的内存 (默认)
    Driver,
    /// 应用通过 attach 提供的内存
    User,
}

/// 一次采集的结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    Ok,
    /// 传输超时，帧数据不可用
    Timeout,
    /// 帧不完整 (丢包)
    FrameIncomplete,
    /// 被 reset 打断
    Aborted,
    /// 其他驱动错误
    Error(DriverErrorCode),
}

impl RequestResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl Display for RequestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Timeout => write!(f, "Timeout"),
            Self::FrameIncomplete => write!(f, "FrameIncomplete"),
            Self::Aborted => write!(f, "RequestAborted"),
            Self::Error(code) => write!(f, "Error {}", code),
        }
    }
}

/// 槽位元数据快照
///
/// 每次调用 `request_info` 都会生成新的快照，不要跨驱动调用缓存它。
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub request: RequestNr,
    pub state: RequestState,
    pub memory_mode: MemoryMode,

    /// 图像数据起始地址 (整数形式，仅用于比对，不用于解引用)
    pub image_address: usize,

    /// 图像数据字节数
    pub image_size: usize,

    pub width: u32,
    pub height: u32,

    /// 行跨距 (Bytes per line)
    pub line_pitch: usize,

    pub pixel_format: PixelFormat,

    pub result: RequestResult,

    /// 驱动分配的帧序号
    pub frame_nr: u64,

    pub timestamp_us: u64,
}

/// 交给显示/消费端的帧视图
///
/// `data` 只在用户内存模式下、且缓冲确实属于本地缓冲池时才有值；
/// 驱动内存对应用层不可见。生命周期绑定到缓冲池，消费端不能持有它跨过下一轮循环。
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub info: &'a RequestInfo,
    pub data: Option<&'a [u8]>,
}

impl<'a> Frame<'a> {
    pub fn request(&self) -> RequestNr {
        self.info.request
    }
}

/// 热循环里使用的带标签结果
///
/// "队列满" 和 "等待超时" 是正常状态，不走 `Err` 通道。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome<T> {
    Ok(T),
    /// 所有槽位都已在途 (队列饱和)
    Saturated,
    /// 在等待窗口内没有完成的 Request
    TimedOut,
    /// 其他意料之外的驱动错误码
    DriverError(DriverErrorCode),
}

impl<T> RequestOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> RequestOutcome<U> {
        match self {
            Self::Ok(v) => RequestOutcome::Ok(f(v)),
            Self::Saturated => RequestOutcome::Saturated,
            Self::TimedOut => RequestOutcome::TimedOut,
            Self::DriverError(code) => RequestOutcome::DriverError(code),
        }
    }

    /// 对应的驱动错误码，用于日志
    pub fn code(&self) -> DriverErrorCode {
        match self {
            Self::Ok(_) => DriverErrorCode::NO_ERROR,
            Self::Saturated => DriverErrorCode::NO_FREE_REQUEST_AVAILABLE,
            Self::TimedOut => DriverErrorCode::WAIT_FOR_REQUEST_FAILED,
            Self::DriverError(code) => *code,
        }
    }
}

/// 等待已完成 Request 的超时
///
/// 【注意】`Infinite` 会让工作线程一直阻塞，期间轮询的终止标志无法被看到；
/// 只有另一个线程调用 `reset_queue` 才能把它唤醒。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(into = "i64", try_from = "i64")
)]
pub enum WaitTimeout {
    Bounded(Duration),
    Infinite,
}

impl WaitTimeout {
    /// 立即返回 (轮询)
    pub const POLL: Self = Self::Bounded(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        Self::Bounded(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(d) => Some(*d),
            Self::Infinite => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        Self::from_millis(500)
    }
}

// 驱动 API 习惯：-1 表示无限等待
impl From<WaitTimeout> for i64 {
    fn from(t: WaitTimeout) -> Self {
        match t {
            WaitTimeout::Bounded(d) => d.as_millis().min(i64::MAX as u128) as i64,
            WaitTimeout::Infinite => -1,
        }
    }
}

impl TryFrom<i64> for WaitTimeout {
    type Error = String;

    fn try_from(ms: i64) -> std::result::Result<Self, Self::Error> {
        match ms {
            -1 => Ok(Self::Infinite),
            ms if ms >= 0 => Ok(Self::from_millis(ms as u64)),
            other => Err(format!("invalid wait timeout {} ms (use -1 for infinite)", other)),
        }
    }
}
