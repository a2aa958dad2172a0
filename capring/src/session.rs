use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use capring_core::builder::SessionConfig;
use capring_core::error::{CaptureError, DriverErrorCode, Result};
use capring_core::request::WaitTimeout;
use capring_core::telemetry::CaptureCounters;
use capring_core::traits::{FrameSink, RequestDriver, ResetFlags};

use crate::cycler::{CyclerState, RequestCycler};
use crate::pool::{BufferAllocator, CaptureBufferPool, HeapAllocator};

const ABORT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// 协作式取消标志
///
/// 工作线程只在两次迭代之间检查它，不会打断正在进行的等待。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 会话结束时的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub label: String,
    pub counters: CaptureCounters,
    pub final_state: CyclerState,
    /// 释放全部缓冲之后仍残留在池中的条目数 (正常为 0)
    pub leaked_buffers: usize,
}

/// 一个设备 (或一路流) 上运行的采集会话
///
/// `start` 在调用线程上完成所有准备工作 (校验配置、查询缓冲布局、创建用户缓冲)，
/// 出错时同步返回；之后由一个专用工作线程跑采集循环。
/// `stop` 设置取消标志并等待工作线程退出，Drop 时同样会这么做。
pub struct AcquisitionSession {
    label: String,
    driver: Arc<dyn RequestDriver>,
    wait_timeout: WaitTimeout,
    cancel: CancelToken,
    worker: Option<JoinHandle<Result<SessionReport>>>,
}

impl AcquisitionSession {
    pub fn start<S>(
        driver: Arc<dyn RequestDriver>,
        config: SessionConfig,
        sink: S,
    ) -> Result<Self>
    where
        S: FrameSink + 'static,
    {
        Self::start_with_allocator(driver, config, sink, Arc::new(HeapAllocator))
    }

    pub fn start_with_allocator<S>(
        driver: Arc<dyn RequestDriver>,
        config: SessionConfig,
        sink: S,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self>
    where
        S: FrameSink + 'static,
    {
        Self::start_with(driver, config, sink, allocator, CancelToken::new())
    }

    /// 完整形式：由调用方提供分配器和取消标志
    pub fn start_with<S>(
        driver: Arc<dyn RequestDriver>,
        config: SessionConfig,
        sink: S,
        allocator: Arc<dyn BufferAllocator>,
        cancel: CancelToken,
    ) -> Result<Self>
    where
        S: FrameSink + 'static,
    {
        config.validate()?;

        let mut pool = CaptureBufferPool::with_allocator(driver.clone(), allocator);
        if config.buffer_mode.uses_user_memory() {
            let layout = driver.capture_buffer_layout().map_err(|e| match e {
                CaptureError::LayoutUnavailable(_) | CaptureError::ContractViolation(_) => e,
                other => CaptureError::LayoutUnavailable(
                    other
                        .driver_code()
                        .unwrap_or(DriverErrorCode::LAYOUT_UNAVAILABLE),
                ),
            })?;
            tracing::debug!(
                target: "capring::session",
                "{}: capture buffer layout {:?}",
                config.label,
                layout
            );
            pool.create_all_buffers(layout.buffer_size(), layout.alignment)?;
        }

        let label = config.label.clone();
        let wait_timeout = config.wait_timeout;
        let worker_cancel = cancel.clone();
        let cycler = RequestCycler::new(driver.clone(), config, pool, sink);

        let worker = thread::Builder::new()
            .name(format!("capring-{}", label))
            .spawn(move || run_worker(cycler, worker_cancel))?;

        tracing::info!(target: "capring::session", "{}: acquisition started", label);

        Ok(Self {
            label,
            driver,
            wait_timeout,
            cancel,
            worker: Some(worker),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 共享的取消标志 (例如交给消费端，让它在满足条件时结束会话)
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// 请求停止但不等待
    ///
    /// 【注意】无限超时下工作线程阻塞在等待中，看不到标志；
    /// 这种情况下这里会额外调用一次 `reset_queue(ABORT_WAITERS)` 把它唤醒。
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.wait_timeout.is_infinite() {
            self.abort_wait();
        }
    }

    fn abort_wait(&self) {
        if let Err(e) = self.driver.reset_queue(ResetFlags::ABORT_WAITERS) {
            tracing::warn!(
                target: "capring::session",
                "{}: failed to abort the infinite wait: {}",
                self.label,
                e
            );
        }
    }

    // 工作线程可能在第一次 reset 之后才进入无限等待，需要再次唤醒
    fn unblock_until_finished<T>(&self, worker: &JoinHandle<T>) {
        if !self.wait_timeout.is_infinite() || !self.cancel.is_cancelled() {
            return;
        }
        while !worker.is_finished() {
            thread::sleep(ABORT_RETRY_INTERVAL);
            if !worker.is_finished() {
                self.abort_wait();
            }
        }
    }

    /// 停止并等待工作线程退出
    pub fn stop(self) -> Result<SessionReport> {
        self.cancel();
        self.join()
    }

    /// 等待工作线程退出 (不设置取消标志)
    pub fn join(mut self) -> Result<SessionReport> {
        let Some(worker) = self.worker.take() else {
            return Err(CaptureError::ContractViolation(format!(
                "session {} has already been joined",
                self.label
            )));
        };

        self.unblock_until_finished(&worker);
        let outcome = match worker.join() {
            Ok(result) => result,
            Err(payload) => Err(CaptureError::WorkerPanicked(panic_message(payload))),
        };

        match &outcome {
            Ok(report) => tracing::info!(
                target: "capring::session",
                "{}: acquisition stopped after {} frames ({} failed)",
                self.label,
                report.counters.frames_received(),
                report.counters.frames_failed
            ),
            Err(e) => tracing::error!(
                target: "capring::session",
                "{}: acquisition ended with an error: {}",
                self.label,
                e
            ),
        }
        outcome
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel();
            self.unblock_until_finished(&worker);
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("label", &self.label)
            .field("wait_timeout", &self.wait_timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("running", &!self.is_finished())
            .finish()
    }
}

fn run_worker<S: FrameSink>(
    mut cycler: RequestCycler<S>,
    cancel: CancelToken,
) -> Result<SessionReport> {
    let outcome = cycler.run(&cancel);

    if let Err(e) = &outcome {
        tracing::error!(
            target: "capring::session",
            "{}: stopping after a fatal driver error: {}",
            cycler.config().label,
            e
        );
        cycler.sink_mut().on_error(&e.to_string());
        cycler.abort();
    }

    let leaked_buffers = cycler.pool_mut().free_all_buffers();
    let report = SessionReport {
        label: cycler.config().label.clone(),
        counters: cycler.counters(),
        final_state: cycler.state(),
        leaked_buffers,
    };
    outcome.map(|()| report)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
