use std::fmt;
use std::sync::Arc;

use capring_core::builder::{BufferMode, SessionConfig};
use capring_core::error::{CaptureError, DriverErrorCode, Result};
use capring_core::request::{Frame, RequestInfo, RequestNr, RequestOutcome, WaitTimeout};
use capring_core::telemetry::{CaptureCounters, StatisticsSnapshot};
use capring_core::traits::{AcquisitionStartStop, FrameSink, RequestDriver, ResetFlags};

use crate::pool::CaptureBufferPool;
use crate::session::CancelToken;
use crate::validator::BufferValidator;

/// 采集循环所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclerState {
    Idle,
    /// 把所有空闲槽位塞进队列
    Priming,
    /// 等待 -> 处理 -> 回收上一帧 -> 重新提交
    Steady,
    /// 停止提交，归还最后一帧，重置队列
    Draining,
    Stopped,
}

impl fmt::Display for CyclerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 稳态循环中一次迭代的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// 取回了一个已完成的 Request，`ok` 表示它的结果码是否为 OK
    Completed { request: RequestNr, ok: bool },
    /// 等待窗口内没有完成的 Request (慢速传输或等待触发)
    TimedOut,
    /// 等待返回了意外的错误码 (例如被 reset 打断)
    WaitFailed(DriverErrorCode),
}

/// 驱动 提交/等待/处理/回收 循环
///
/// 双缓冲：当前交给消费端的 Request 一直保持锁定，直到下一帧取代它之后才 unlock，
/// 所以消费端永远不会看到正在被驱动覆盖的缓冲。
pub struct RequestCycler<S> {
    driver: Arc<dyn RequestDriver>,
    config: SessionConfig,
    pool: CaptureBufferPool,
    validator: BufferValidator,
    sink: S,
    state: CyclerState,
    counters: CaptureCounters,
    /// 上一轮交给消费端、仍处于锁定状态的 Request
    previous: Option<RequestNr>,
}

impl<S: FrameSink> RequestCycler<S> {
    pub fn new(
        driver: Arc<dyn RequestDriver>,
        config: SessionConfig,
        pool: CaptureBufferPool,
        sink: S,
    ) -> Self {
        Self {
            driver,
            config,
            pool,
            validator: BufferValidator::new(),
            sink,
            state: CyclerState::Idle,
            counters: CaptureCounters::default(),
            previous: None,
        }
    }

    pub fn state(&self) -> CyclerState {
        self.state
    }

    pub fn counters(&self) -> CaptureCounters {
        self.counters
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pool(&self) -> &CaptureBufferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut CaptureBufferPool {
        &mut self.pool
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// 当前仍锁定着、等待被下一帧取代的 Request
    pub fn held_request(&self) -> Option<RequestNr> {
        self.previous
    }

    pub fn into_parts(self) -> (CaptureBufferPool, S) {
        (self.pool, self.sink)
    }

    /// 完整跑一遍：预热，稳态直到取消，收尾
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        self.prime()?;
        while !cancel.is_cancelled() {
            self.step()?;
        }
        self.drain()
    }

    /// 预热：不停提交直到驱动报告队列饱和
    ///
    /// 返回成功提交的数量。饱和之外的任何结果都按意外情况记录。
    pub fn prime(&mut self) -> Result<usize> {
        self.enter(CyclerState::Priming);

        let mut primed = 0;
        loop {
            match self.driver.submit_request() {
                RequestOutcome::Ok(request) => {
                    primed += 1;
                    self.counters.primed += 1;
                    self.counters.submits += 1;
                    tracing::trace!(target: "capring::cycler", "Primed request {}", request);
                }
                RequestOutcome::Saturated => {
                    self.counters.saturations += 1;
                    break;
                }
                other => {
                    check_handle(other.code(), "submit_request")?;
                    self.counters.submit_errors += 1;
                    tracing::warn!(
                        target: "capring::cycler",
                        "{}: 'submit_request' returned with an unexpected result: {}",
                        self.config.label,
                        other.code()
                    );
                    break;
                }
            }
        }

        if self.driver.acquisition_start_stop() == AcquisitionStartStop::User {
            non_fatal(self.driver.start_acquisition(), "start_acquisition", &self.config.label)?;
        }

        self.enter(CyclerState::Steady);
        Ok(primed)
    }

    /// 稳态循环的一次迭代
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state != CyclerState::Steady {
            return Err(CaptureError::ContractViolation(format!(
                "step() called while the cycler is {}",
                self.state
            )));
        }

        if self.config.drop_outdated {
            self.drop_outdated()?;
        }

        match self.driver.wait_for_request(self.config.wait_timeout) {
            RequestOutcome::Ok(request) => self.process(request),
            RequestOutcome::TimedOut => {
                self.counters.timeouts += 1;
                tracing::trace!(
                    target: "capring::cycler",
                    "{}: no request completed within {:?}",
                    self.config.label,
                    self.config.wait_timeout
                );
                Ok(StepOutcome::TimedOut)
            }
            other => {
                let code = other.code();
                check_handle(code, "wait_for_request")?;
                self.counters.wait_errors += 1;
                tracing::debug!(
                    target: "capring::cycler",
                    "{}: 'wait_for_request' failed ({}), timeout value too small?",
                    self.config.label,
                    code
                );
                Ok(StepOutcome::WaitFailed(code))
            }
        }
    }

    /// 收尾：停止采集 (如需)，归还最后一帧，重置队列
    pub fn drain(&mut self) -> Result<()> {
        self.enter(CyclerState::Draining);

        if self.driver.acquisition_start_stop() == AcquisitionStartStop::User {
            non_fatal(self.driver.stop_acquisition(), "stop_acquisition", &self.config.label)?;
        }

        if let Some(last) = self.previous.take() {
            non_fatal(self.driver.unlock_request(last), "unlock_request", &self.config.label)?;
            self.counters.unlocks += 1;
        }

        non_fatal(
            self.driver.reset_queue(ResetFlags::empty()),
            "reset_queue",
            &self.config.label,
        )?;

        self.enter(CyclerState::Stopped);
        Ok(())
    }

    /// 出现致命错误后的尽力清理：忽略所有错误，强制冲掉队列
    pub fn abort(&mut self) {
        self.enter(CyclerState::Draining);
        self.previous = None;
        if let Err(e) = self.driver.reset_queue(ResetFlags::INCLUDE_LOCKED) {
            tracing::warn!(
                target: "capring::cycler",
                "{}: queue reset during abort failed: {}",
                self.config.label,
                e
            );
        }
        self.enter(CyclerState::Stopped);
    }

    fn process(&mut self, request: RequestNr) -> Result<StepOutcome> {
        let info = self.driver.request_info(request)?;
        let ok = info.result.is_ok();

        if ok {
            self.counters.frames_ok += 1;
            let interval = u64::from(self.config.statistics_interval);
            if interval > 0 && self.counters.frames_ok % interval == 0 {
                self.emit_statistics(&info);
            }
            self.display_and_validate(&info);
        } else {
            self.counters.frames_failed += 1;
            let message = format!("Error: {}", info.result);
            tracing::warn!(target: "capring::cycler", "{}: {}", self.config.label, message);
            self.sink.on_error(&message);
        }

        // 这一帧已经取代了上一帧，上一帧的缓冲不再被消费端引用
        self.recycle_previous()?;
        self.previous = Some(request);
        self.resubmit()?;

        Ok(StepOutcome::Completed { request, ok })
    }

    fn display_and_validate(&mut self, info: &RequestInfo) {
        let expect_user = self.config.buffer_mode.uses_user_memory();

        let data = if expect_user {
            self.pool
                .find(info.image_address)
                .map(|b| &b.as_slice()[..info.image_size.min(b.size())])
        } else {
            None
        };
        self.sink.on_frame_ready(&Frame { info, data });

        if let Err(mismatch) = self.validator.validate(info, expect_user, &self.pool) {
            self.counters.validation_mismatches += 1;
            self.sink.on_error(&mismatch.to_string());
        }
    }

    fn recycle_previous(&mut self) -> Result<()> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };

        non_fatal(
            self.driver.unlock_request(previous),
            "unlock_request",
            &self.config.label,
        )?;
        self.counters.unlocks += 1;

        if self.config.buffer_mode == BufferMode::AlwaysFreshUserMemory {
            self.swap_buffer(previous)?;
        }
        Ok(())
    }

    /// 给刚归还的槽位换上一块新分配的用户内存
    fn swap_buffer(&mut self, request: RequestNr) -> Result<()> {
        self.pool.free_buffer(request);
        match self.pool.recreate_buffer(request) {
            Ok(address) => {
                self.counters.buffer_swaps += 1;
                tracing::trace!(
                    target: "capring::cycler",
                    "{}: request {} now uses buffer {:#x}",
                    self.config.label,
                    request,
                    address
                );
                Ok(())
            }
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                // 槽位会退回驱动内存，校验器会在下一次使用时报告
                self.counters.buffer_swap_failures += 1;
                self.sink.on_error(&e.to_string());
                Ok(())
            }
        }
    }

    fn resubmit(&mut self) -> Result<()> {
        match self.driver.submit_request() {
            RequestOutcome::Ok(request) => {
                self.counters.submits += 1;
                tracing::trace!(target: "capring::cycler", "Submitted request {}", request);
            }
            RequestOutcome::Saturated => {
                self.counters.saturations += 1;
            }
            other => {
                check_handle(other.code(), "submit_request")?;
                self.counters.submit_errors += 1;
                tracing::warn!(
                    target: "capring::cycler",
                    "{}: 'submit_request' returned with an unexpected result: {}",
                    self.config.label,
                    other.code()
                );
            }
        }
        Ok(())
    }

    /// 只处理最新的帧：把已经积压的完成 Request 直接归还并重新提交
    ///
    /// 每轮最多丢弃 `request_count` 个，防止驱动出帧比我们快时永远出不去。
    fn drop_outdated(&mut self) -> Result<()> {
        for _ in 0..self.driver.request_count() {
            let RequestOutcome::Ok(request) = self.driver.wait_for_request(WaitTimeout::POLL)
            else {
                break;
            };
            non_fatal(
                self.driver.unlock_request(request),
                "unlock_request",
                &self.config.label,
            )?;
            self.counters.frames_dropped += 1;
            self.counters.unlocks += 1;
            tracing::trace!(target: "capring::cycler", "Dropped outdated request {}", request);
            self.resubmit()?;
        }
        Ok(())
    }

    fn emit_statistics(&mut self, info: &RequestInfo) {
        let snapshot = StatisticsSnapshot {
            label: self.config.label.clone(),
            counters: self.counters,
            driver: self.driver.statistics(),
            width: info.width,
            height: info.height,
            pixel_format: info.pixel_format,
        };
        tracing::info!(target: "capring::cycler", "{}", snapshot);
        self.sink.on_statistics(&snapshot);
    }

    fn enter(&mut self, next: CyclerState) {
        if self.state != next {
            tracing::debug!(
                target: "capring::cycler",
                "{}: {} -> {}",
                self.config.label,
                self.state,
                next
            );
            self.state = next;
        }
    }
}

impl<S> fmt::Debug for RequestCycler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCycler")
            .field("label", &self.config.label)
            .field("state", &self.state)
            .field("previous", &self.previous)
            .field("counters", &self.counters)
            .field("pool", &self.pool)
            .finish()
    }
}

/// 句柄失效说明设备已经关闭，继续循环没有意义
fn check_handle(code: DriverErrorCode, call: &str) -> Result<()> {
    if code == DriverErrorCode::HANDLE_INVALID {
        return Err(CaptureError::ContractViolation(format!(
            "'{}' used a device handle that is no longer valid",
            call
        )));
    }
    Ok(())
}

/// 契约违规继续向上传播，其余错误只记日志
fn non_fatal(result: Result<()>, call: &str, label: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_contract_violation() => Err(e),
        Err(e) => {
            tracing::warn!(
                target: "capring::cycler",
                "{}: '{}' returned with an unexpected result: {}",
                label,
                call,
                e
            );
            Ok(())
        }
    }
}
