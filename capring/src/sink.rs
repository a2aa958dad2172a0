use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use capring_core::pixel_format::PixelFormat;
use capring_core::request::{Frame, MemoryMode, RequestNr};
use capring_core::telemetry::StatisticsSnapshot;
use capring_core::traits::FrameSink;

/// 多路流共享的输出锁
///
/// 只保护输出动作本身，不保护采集逻辑。
#[derive(Debug, Clone, Default)]
pub struct ConsoleLock(Arc<Mutex<()>>);

impl ConsoleLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 通过 tracing 输出的消费端
#[derive(Debug, Clone)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl FrameSink for LogSink {
    fn on_frame_ready(&mut self, frame: &Frame<'_>) {
        tracing::trace!(
            target: "capring::session",
            stream = %self.label,
            request = %frame.request(),
            frame_nr = frame.info.frame_nr,
            "Image captured: {}x{}({})",
            frame.info.width,
            frame.info.height,
            frame.info.pixel_format
        );
    }

    fn on_statistics(&mut self, stats: &StatisticsSnapshot) {
        tracing::info!(target: "capring::session", "{}", stats);
    }

    fn on_error(&mut self, message: &str) {
        tracing::warn!(target: "capring::session", stream = %self.label, "{}", message);
    }
}

/// 脱离缓冲生命周期的帧摘要
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    pub request: RequestNr,
    pub frame_nr: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub timestamp_us: u64,
    pub memory_mode: MemoryMode,
    pub image_address: usize,
    /// 开启 `with_data` 时携带的图像拷贝
    pub data: Option<Vec<u8>>,
}

impl FrameSummary {
    pub fn from_frame(frame: &Frame<'_>, copy_data: bool) -> Self {
        let info = frame.info;
        Self {
            request: info.request,
            frame_nr: info.frame_nr,
            width: info.width,
            height: info.height,
            pixel_format: info.pixel_format,
            timestamp_us: info.timestamp_us,
            memory_mode: info.memory_mode,
            image_address: info.image_address,
            data: if copy_data {
                frame.data.map(<[u8]>::to_vec)
            } else {
                None
            },
        }
    }
}

/// 把帧摘要转发到另一个线程
///
/// 通道满了就丢弃并计数，从不阻塞采集线程。
#[derive(Debug)]
pub struct ChannelSink {
    frames: Sender<FrameSummary>,
    errors: Option<Sender<String>>,
    copy_data: bool,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<FrameSummary>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                frames: tx,
                errors: None,
                copy_data: false,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// 同时把图像数据拷贝出来 (Buffer -> Heap)
    pub fn with_data(mut self, enabled: bool) -> Self {
        self.copy_data = enabled;
        self
    }

    /// 错误消息也转发出去
    pub fn with_errors(mut self) -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.errors = Some(tx);
        (self, rx)
    }

    /// 因消费端来不及而丢弃的帧数
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl FrameSink for ChannelSink {
    fn on_frame_ready(&mut self, frame: &Frame<'_>) {
        match self.frames.try_send(FrameSummary::from_frame(frame, self.copy_data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // 接收端已经不在了
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn on_error(&mut self, message: &str) {
        if let Some(tx) = &self.errors {
            let _ = tx.send(message.to_string());
        }
    }
}

/// 在共享锁保护下打印到标准输出
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    label: String,
    lock: ConsoleLock,
    print_frames: bool,
}

impl ConsoleSink {
    pub fn new<S: Into<String>>(label: S, lock: ConsoleLock) -> Self {
        Self {
            label: label.into(),
            lock,
            print_frames: false,
        }
    }

    /// 每一帧都打印一行 (默认只打印统计和错误)
    pub fn print_frames(mut self, enabled: bool) -> Self {
        self.print_frames = enabled;
        self
    }

    fn print(&self, line: std::fmt::Arguments<'_>) {
        let _guard = self.lock.lock();
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", line);
    }
}

impl FrameSink for ConsoleSink {
    fn on_frame_ready(&mut self, frame: &Frame<'_>) {
        if self.print_frames {
            self.print(format_args!(
                "Image captured from {}: {}x{}({}), request {}",
                self.label,
                frame.info.width,
                frame.info.height,
                frame.info.pixel_format,
                frame.request()
            ));
        }
    }

    fn on_statistics(&mut self, stats: &StatisticsSnapshot) {
        self.print(format_args!("{}", stats));
    }

    fn on_error(&mut self, message: &str) {
        self.print(format_args!("{}: {}", self.label, message));
    }
}
