// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

// 模块定义
pub mod align;
pub mod builder;
pub mod error;
pub mod pixel_format;
pub mod request;
pub mod telemetry;
pub mod traits;

// 方便用户使用的 Prelude
pub mod prelude {
    pub use crate::align::align_up;
    pub use crate::builder::{BufferMode, SessionConfig};
    pub use crate::error::{CaptureError, DriverErrorCode, Result};
    pub use crate::request::{
        Frame, MemoryMode, RequestInfo, RequestNr, RequestOutcome, RequestResult, RequestState,
        WaitTimeout,
    };
    pub use crate::telemetry::{CaptureCounters, DriverStatistics, StatisticsSnapshot};
    pub use crate::traits::{
        AcquisitionStartStop, BufferLayout, DeviceInfo, DeviceManager, FrameSink, RequestDriver,
        ResetFlags,
    };
}

// 版本与构建信息常量
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
