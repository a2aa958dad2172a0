use std::time::Duration;

use capring_core::pixel_format::{FourCC, PixelFormat};
use capring_core::traits::{AcquisitionStartStop, BufferLayout};

/// 仿真设备参数
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Request 槽位数量，默认 4
    pub request_count: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// 每帧附带的 footer 字节数
    pub footer_size: usize,
    /// DMA 对齐要求，默认 64 字节
    pub alignment: usize,
    pub start_stop: AcquisitionStartStop,
    /// 最多产出多少帧，`None` 表示不限
    pub frame_budget: Option<u64>,
    /// 触发模式：只有调用 `trigger` 后才会出帧
    pub triggered: bool,
    /// 两帧之间的最小间隔，`None` 表示有请求就立即出帧
    pub frame_period: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SimConfig {
    pub fn new() -> Self {
        Self {
            request_count: 4,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Known(FourCC::MONO8),
            footer_size: 0,
            alignment: 64,
            start_stop: AcquisitionStartStop::Default,
            frame_budget: None,
            triggered: false,
            frame_period: None,
        }
    }

    pub fn request_count(mut self, count: usize) -> Self {
        self.request_count = count;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn pixel_format<T: Into<PixelFormat>>(mut self, fmt: T) -> Self {
        self.pixel_format = fmt.into();
        self
    }

    pub fn footer_size(mut self, bytes: usize) -> Self {
        self.footer_size = bytes;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn start_stop(mut self, behaviour: AcquisitionStartStop) -> Self {
        self.start_stop = behaviour;
        self
    }

    pub fn frame_budget(mut self, frames: u64) -> Self {
        self.frame_budget = Some(frames);
        self
    }

    pub fn triggered(mut self, enabled: bool) -> Self {
        self.triggered = enabled;
        self
    }

    pub fn frame_period(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    /// 当前参数对应的缓冲布局
    pub fn layout(&self) -> BufferLayout {
        // 未知格式按 1 字节/像素处理
        let bpp = self.pixel_format.bytes_per_pixel().max(1);
        let line_pitch = self.width as usize * bpp;
        BufferLayout {
            image_size: line_pitch * self.height as usize,
            footer_size: self.footer_size,
            line_pitch,
            alignment: self.alignment,
        }
    }
}
