#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use capring::pool::BufferAllocator;
use capring_core::request::Frame;
use capring_core::telemetry::StatisticsSnapshot;
use capring_core::traits::FrameSink;

#[derive(Debug, Default)]
struct Counts {
    allocations: usize,
    releases: usize,
    /// 释放的内存不还给系统，保证测试期间地址不会被复用
    retained: Vec<Box<[u8]>>,
}

/// 记录分配/释放次数的分配器
#[derive(Debug, Default)]
pub struct CountingAllocator {
    counts: Mutex<Counts>,
}

impl CountingAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocations(&self) -> usize {
        self.counts.lock().unwrap().allocations
    }

    pub fn releases(&self) -> usize {
        self.counts.lock().unwrap().releases
    }

    pub fn live(&self) -> usize {
        let c = self.counts.lock().unwrap();
        c.allocations - c.releases
    }
}

impl BufferAllocator for CountingAllocator {
    fn allocate(&self, len: usize) -> Box<[u8]> {
        self.counts.lock().unwrap().allocations += 1;
        vec![0u8; len].into_boxed_slice()
    }

    fn release(&self, block: Box<[u8]>) {
        let mut c = self.counts.lock().unwrap();
        c.releases += 1;
        c.retained.push(block);
    }
}

/// 消费端回调记录
#[derive(Debug, Default, Clone)]
pub struct Recorded {
    /// (request, frame_nr, 是否带图像数据)
    pub frames: Vec<(u32, u64, bool)>,
    pub statistics: Vec<StatisticsSnapshot>,
    pub errors: Vec<String>,
}

/// 把所有回调记录到共享状态里的消费端
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub recorded: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn on_frame_ready(&mut self, frame: &Frame<'_>) {
        self.recorded.lock().unwrap().frames.push((
            frame.request().0,
            frame.info.frame_nr,
            frame.data.is_some(),
        ));
    }

    fn on_statistics(&mut self, stats: &StatisticsSnapshot) {
        self.recorded.lock().unwrap().statistics.push(stats.clone());
    }

    fn on_error(&mut self, message: &str) {
        self.recorded.lock().unwrap().errors.push(message.to_string());
    }
}

/// 安装测试用日志输出 (重复调用无害)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
