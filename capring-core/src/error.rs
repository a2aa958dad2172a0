use std::fmt::{self, Display};

use thiserror::Error;

use crate::request::RequestNr;

/// 驱动返回的原始错误码
///
/// 驱动层使用负整数表示错误，0 表示成功。这里只为核心循环关心的几个码起名字，
/// 其余的码原样透传。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct DriverErrorCode(pub i32);

impl DriverErrorCode {
    pub const NO_ERROR: Self = Self(0);
    /// 未知的驱动内部错误
    pub const UNKNOWN_ERROR: Self = Self(-2100);
    /// 句柄已失效 (设备已关闭)
    pub const HANDLE_INVALID: Self = Self(-2101);
    /// 参数非法
    pub const INPUT_PARAM_INVALID: Self = Self(-2102);
    /// Request 当前不处于可解锁状态
    pub const REQUEST_CANT_BE_UNLOCKED: Self = Self(-2105);
    /// Request 编号越界
    pub const INVALID_REQUEST_NUMBER: Self = Self(-2106);
    /// 所有 Request 都已在队列中 (饱和信号，不是错误)
    pub const NO_FREE_REQUEST_AVAILABLE: Self = Self(-2108);
    /// 等待超时或等待被 reset 打断
    pub const WAIT_FOR_REQUEST_FAILED: Self = Self(-2119);
    /// Request 正在被驱动或应用使用，不能修改缓冲
    pub const REQUEST_ALREADY_IN_USE: Self = Self(-2120);
    /// 用户缓冲太小
    pub const INVALID_BUFFER_SIZE: Self = Self(-2121);
    /// 用户缓冲地址不满足 DMA 对齐要求
    pub const BUFFER_MISALIGNED: Self = Self(-2122);
    /// 当前配置下无法给出缓冲布局
    pub const LAYOUT_UNAVAILABLE: Self = Self(-2123);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// 人类可读的错误码名字
    pub fn name(&self) -> &'static str {
        match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::UNKNOWN_ERROR => "UNKNOWN_ERROR",
            Self::HANDLE_INVALID => "HANDLE_INVALID",
            Self::INPUT_PARAM_INVALID => "INPUT_PARAM_INVALID",
            Self::REQUEST_CANT_BE_UNLOCKED => "REQUEST_CANT_BE_UNLOCKED",
            Self::INVALID_REQUEST_NUMBER => "INVALID_REQUEST_NUMBER",
            Self::NO_FREE_REQUEST_AVAILABLE => "NO_FREE_REQUEST_AVAILABLE",
            Self::WAIT_FOR_REQUEST_FAILED => "WAIT_FOR_REQUEST_FAILED",
            Self::REQUEST_ALREADY_IN_USE => "REQUEST_ALREADY_IN_USE",
            Self::INVALID_BUFFER_SIZE => "INVALID_BUFFER_SIZE",
            Self::BUFFER_MISALIGNED => "BUFFER_MISALIGNED",
            Self::LAYOUT_UNAVAILABLE => "LAYOUT_UNAVAILABLE",
            _ => "UNRECOGNIZED",
        }
    }
}

impl Display for DriverErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0, self.name())
    }
}

impl fmt::Debug for DriverErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverErrorCode({})", self)
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Driver rejected user buffer for request {request}: {code}")]
    AttachRejected {
        request: RequestNr,
        code: DriverErrorCode,
    },

    #[error("Driver failed to detach user buffer from request {request}: {code}")]
    DetachRejected {
        request: RequestNr,
        code: DriverErrorCode,
    },

    /// 调用方违反了驱动契约 (失效句柄、调用顺序错误)。
    /// 这是唯一会终止采集会话的错误。
    #[error("Driver contract violation: {0}")]
    ContractViolation(String),

    #[error("Capture buffer layout unavailable: {0}")]
    LayoutUnavailable(DriverErrorCode),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Capture worker panicked: {0}")]
    WorkerPanicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// 驱动附带的错误码 (若有)
    pub fn driver_code(&self) -> Option<DriverErrorCode> {
        match self {
            Self::AttachRejected { code, .. }
            | Self::DetachRejected { code, .. }
            | Self::LayoutUnavailable(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
