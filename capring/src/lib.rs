// 开启一些 Clippy 检查，保证代码质量
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod cycler;
pub mod multi;
pub mod pool;
pub mod session;
pub mod single;
pub mod sink;
pub mod validator;

pub use cycler::{CyclerState, RequestCycler, StepOutcome};
pub use pool::{BufferAllocator, CaptureBuffer, CaptureBufferPool, HeapAllocator};
pub use session::{AcquisitionSession, CancelToken, SessionReport};
pub use validator::{BufferMismatch, BufferValidator};

/// 预置模块，用户可以通过 `use capring::prelude::*;` 导入常用项
pub mod prelude {
    pub use capring_core::prelude::*;

    pub use crate::cycler::{CyclerState, RequestCycler, StepOutcome};
    pub use crate::multi::MultiDeviceCapture;
    pub use crate::pool::{BufferAllocator, CaptureBufferPool};
    pub use crate::session::{AcquisitionSession, CancelToken, SessionReport};
    pub use crate::single::{capture_into_request, SingleCapture};
    pub use crate::sink::{ChannelSink, ConsoleLock, ConsoleSink, FrameSummary, LogSink};
    pub use crate::validator::{BufferMismatch, BufferValidator};
}
