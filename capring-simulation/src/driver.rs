use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use capring_core::align::is_aligned;
use capring_core::error::{CaptureError, DriverErrorCode, Result};
use capring_core::request::{
    MemoryMode, RequestInfo, RequestNr, RequestOutcome, RequestResult, RequestState, WaitTimeout,
};
use capring_core::telemetry::DriverStatistics;
use capring_core::traits::{AcquisitionStartStop, BufferLayout, RequestDriver, ResetFlags};

use crate::config::SimConfig;

const EVENT_LOG_CAPACITY: usize = 65_536;

/// 驱动侧发生的事件，按发生顺序记录，供测试断言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Submitted(RequestNr),
    Completed(RequestNr),
    Unlocked(RequestNr),
    Attached { request: RequestNr, address: usize },
    Detached(RequestNr),
    Reset,
    AcquisitionStarted,
    AcquisitionStopped,
}

/// 唤醒信号
#[derive(Debug, Clone, Copy)]
enum Wake {
    /// 状态有变化，重新检查
    Kick,
    /// reset_queue 要求打断等待，携带 reset 之后的代数
    Abort(u64),
    Closed,
}

#[derive(Debug)]
struct SimSlot {
    state: RequestState,
    mode: MemoryMode,
    /// (地址, 字节数)
    user_buffer: Option<(usize, usize)>,
    /// 驱动内存模式下使用的缓冲
    driver_block: Box<[u8]>,
    result: RequestResult,
    frame_nr: u64,
    timestamp_us: u64,
}

#[derive(Debug)]
struct SimState {
    slots: Vec<SimSlot>,
    /// 已提交、等待出帧的槽位 (FIFO)
    queue: VecDeque<RequestNr>,
    /// 轮转提交游标
    cursor: usize,
    running: bool,
    closed: bool,
    frames_produced: u64,
    pending_triggers: u64,
    last_frame_at: Option<Instant>,
    result_script: Vec<RequestResult>,
    attach_faults: HashMap<RequestNr, DriverErrorCode>,
    detach_faults: HashMap<RequestNr, DriverErrorCode>,
    layout_fault: Option<DriverErrorCode>,
    events: VecDeque<DriverEvent>,
    /// 每次带 ABORT_WAITERS 的 reset 加一
    abort_generation: u64,
    waiters: usize,
    waits: u64,
    submits: u64,
    unlocks: u64,
    resets: u64,
    error_count: u64,
}

/// 采集尝试的结果
enum Completion {
    Ready(RequestNr),
    /// 还不能出帧；若有值，表示最早可出帧的时刻
    NotYet(Option<Instant>),
}

impl SimState {
    fn record(&mut self, event: DriverEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn slot(&self, request: RequestNr) -> Result<&SimSlot> {
        if self.closed {
            return Err(CaptureError::ContractViolation(format!(
                "request {} used after the device was closed",
                request
            )));
        }
        self.slots.get(request.index()).ok_or_else(|| {
            CaptureError::ContractViolation(format!(
                "request number {} is invalid (request count {})",
                request,
                self.slots.len()
            ))
        })
    }

    fn slot_mut(&mut self, request: RequestNr) -> Result<&mut SimSlot> {
        self.slot(request)?;
        Ok(&mut self.slots[request.index()])
    }

    fn try_complete(&mut self, config: &SimConfig, started: Instant) -> Completion {
        if self.queue.is_empty() || !self.running {
            return Completion::NotYet(None);
        }
        if let Some(budget) = config.frame_budget {
            if self.frames_produced >= budget {
                return Completion::NotYet(None);
            }
        }
        if config.triggered && self.pending_triggers == 0 {
            return Completion::NotYet(None);
        }

        let now = Instant::now();
        if let (Some(period), Some(last)) = (config.frame_period, self.last_frame_at) {
            let due = last + period;
            if now < due {
                return Completion::NotYet(Some(due));
            }
        }

        let Some(request) = self.queue.pop_front() else {
            return Completion::NotYet(None);
        };

        let result = if self.result_script.is_empty() {
            RequestResult::Ok
        } else {
            self.result_script[(self.frames_produced % self.result_script.len() as u64) as usize]
        };
        if !result.is_ok() {
            self.error_count += 1;
        }

        let frame_nr = self.frames_produced;
        let slot = &mut self.slots[request.index()];
        slot.state = RequestState::Ready;
        slot.result = result;
        slot.frame_nr = frame_nr;
        slot.timestamp_us = now.duration_since(started).as_micros() as u64;

        self.frames_produced += 1;
        self.last_frame_at = Some(now);
        if config.triggered {
            self.pending_triggers -= 1;
        }
        self.record(DriverEvent::Completed(request));
        Completion::Ready(request)
    }
}

/// 进程内仿真驱动
///
/// 行为模型：
/// - 固定数量的槽位，按 FIFO 出帧；
/// - 出帧发生在 `wait_for_request` 内部 (受帧预算、触发、帧间隔约束)；
/// - 阻塞等待时不持有内部锁，`reset_queue` 可以从其他线程打断等待。
#[derive(Debug)]
pub struct SimDriver {
    config: SimConfig,
    layout: BufferLayout,
    started: Instant,
    state: Mutex<SimState>,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let layout = config.layout();
        let slots = (0..config.request_count)
            .map(|_| SimSlot {
                state: RequestState::Idle,
                mode: MemoryMode::Driver,
                user_buffer: None,
                driver_block: vec![0u8; layout.buffer_size()].into_boxed_slice(),
                result: RequestResult::Ok,
                frame_nr: 0,
                timestamp_us: 0,
            })
            .collect();

        let (wake_tx, wake_rx) = unbounded();

        tracing::debug!(
            target: "capring::sim",
            requests = config.request_count,
            "Simulated device created: {}x{} {} (alignment {})",
            config.width,
            config.height,
            config.pixel_format,
            config.alignment
        );

        Self {
            state: Mutex::new(SimState {
                slots,
                queue: VecDeque::new(),
                cursor: 0,
                running: config.start_stop == AcquisitionStartStop::Default,
                closed: false,
                frames_produced: 0,
                pending_triggers: 0,
                last_frame_at: None,
                result_script: Vec::new(),
                attach_faults: HashMap::new(),
                detach_faults: HashMap::new(),
                layout_fault: None,
                events: VecDeque::new(),
                abort_generation: 0,
                waiters: 0,
                waits: 0,
                submits: 0,
                unlocks: 0,
                resets: 0,
                error_count: 0,
            }),
            config,
            layout,
            started: Instant::now(),
            wake_tx,
            wake_rx,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 只在确实有线程阻塞时发送，否则信号会在通道里越积越多
    fn kick(&self, st: &SimState) {
        if st.waiters > 0 {
            let _ = self.wake_tx.send(Wake::Kick);
        }
    }

    // --- 故障注入 ---

    /// 按帧序号循环使用的结果码脚本 (空脚本表示全部 OK)
    pub fn set_result_script(&self, script: Vec<RequestResult>) {
        self.lock().result_script = script;
    }

    /// 让指定槽位的 attach 失败
    pub fn reject_attach(&self, request: RequestNr, code: DriverErrorCode) {
        self.lock().attach_faults.insert(request, code);
    }

    /// 让指定槽位的 detach 失败
    pub fn reject_detach(&self, request: RequestNr, code: DriverErrorCode) {
        self.lock().detach_faults.insert(request, code);
    }

    pub fn fail_layout_query(&self, code: DriverErrorCode) {
        self.lock().layout_fault = Some(code);
    }

    /// 触发模式下放行 `count` 帧
    pub fn trigger(&self, count: u64) {
        let mut st = self.lock();
        st.pending_triggers += count;
        self.kick(&st);
    }

    /// 模拟设备关闭：之后任何对槽位的访问都是契约违规
    pub fn close(&self) {
        self.lock().closed = true;
        let _ = self.wake_tx.send(Wake::Closed);
    }

    // --- 观测接口 (测试使用) ---

    pub fn events(&self) -> Vec<DriverEvent> {
        self.lock().events.iter().copied().collect()
    }

    pub fn submit_count(&self) -> u64 {
        self.lock().submits
    }

    pub fn unlock_count(&self) -> u64 {
        self.lock().unlocks
    }

    pub fn reset_count(&self) -> u64 {
        self.lock().resets
    }

    pub fn wait_count(&self) -> u64 {
        self.lock().waits
    }

    pub fn frames_produced(&self) -> u64 {
        self.lock().frames_produced
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn request_state(&self, request: RequestNr) -> Option<RequestState> {
        self.lock().slots.get(request.index()).map(|s| s.state)
    }

    /// 槽位当前挂着的用户缓冲地址
    pub fn attached_address(&self, request: RequestNr) -> Option<usize> {
        self.lock()
            .slots
            .get(request.index())
            .and_then(|s| s.user_buffer.map(|(addr, _)| addr))
    }

    fn submit_locked(&self, st: &mut SimState, request: RequestNr) {
        st.slots[request.index()].state = RequestState::Submitted;
        st.queue.push_back(request);
        st.submits += 1;
        st.cursor = (request.index() + 1) % st.slots.len().max(1);
        st.record(DriverEvent::Submitted(request));
    }
}

impl RequestDriver for SimDriver {
    fn request_count(&self) -> usize {
        self.config.request_count
    }

    fn submit_request(&self) -> RequestOutcome<RequestNr> {
        let mut st = self.lock();
        if st.closed {
            return RequestOutcome::DriverError(DriverErrorCode::HANDLE_INVALID);
        }
        let count = st.slots.len();
        let free = (0..count)
            .map(|offset| (st.cursor + offset) % count)
            .find(|&idx| st.slots[idx].state.is_free());
        match free {
            Some(idx) => {
                let request = RequestNr::from(idx);
                self.submit_locked(&mut st, request);
                self.kick(&st);
                RequestOutcome::Ok(request)
            }
            None => RequestOutcome::Saturated,
        }
    }

    fn submit_request_to(&self, request: RequestNr) -> RequestOutcome<RequestNr> {
        let mut st = self.lock();
        if st.closed {
            return RequestOutcome::DriverError(DriverErrorCode::HANDLE_INVALID);
        }
        match st.slots.get(request.index()).map(|s| s.state) {
            None => RequestOutcome::DriverError(DriverErrorCode::INVALID_REQUEST_NUMBER),
            Some(state) if !state.is_free() => {
                RequestOutcome::DriverError(DriverErrorCode::REQUEST_ALREADY_IN_USE)
            }
            Some(_) => {
                self.submit_locked(&mut st, request);
                self.kick(&st);
                RequestOutcome::Ok(request)
            }
        }
    }

    fn wait_for_request(&self, timeout: WaitTimeout) -> RequestOutcome<RequestNr> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let generation = {
            let mut st = self.lock();
            st.waits += 1;
            st.abort_generation
        };

        loop {
            let next_due = {
                let mut st = self.lock();
                if st.closed {
                    return RequestOutcome::DriverError(DriverErrorCode::HANDLE_INVALID);
                }
                if st.abort_generation > generation {
                    return RequestOutcome::DriverError(DriverErrorCode::WAIT_FOR_REQUEST_FAILED);
                }
                match st.try_complete(&self.config, self.started) {
                    Completion::Ready(request) => return RequestOutcome::Ok(request),
                    Completion::NotYet(due) => {
                        st.waiters += 1;
                        due
                    }
                }
            };

            // 不持锁阻塞
            let wake_at = match (deadline, next_due) {
                (Some(d), Some(n)) => Some(d.min(n)),
                (d, n) => d.or(n),
            };
            let received = match wake_at {
                Some(at) => self
                    .wake_rx
                    .recv_timeout(at.saturating_duration_since(Instant::now())),
                None => self.wake_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            self.lock().waiters -= 1;

            match received {
                Ok(Wake::Kick) => continue,
                Ok(Wake::Abort(abort_gen)) if abort_gen > generation => {
                    tracing::debug!(target: "capring::sim", "Wait aborted by queue reset");
                    return RequestOutcome::DriverError(DriverErrorCode::WAIT_FOR_REQUEST_FAILED);
                }
                // 过期的 abort 信号
                Ok(Wake::Abort(_)) => continue,
                Ok(Wake::Closed) => {
                    return RequestOutcome::DriverError(DriverErrorCode::HANDLE_INVALID)
                }
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        // 超时前最后检查一次
                        let mut st = self.lock();
                        return match st.try_complete(&self.config, self.started) {
                            Completion::Ready(request) => RequestOutcome::Ok(request),
                            Completion::NotYet(_) => RequestOutcome::TimedOut,
                        };
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return RequestOutcome::DriverError(DriverErrorCode::HANDLE_INVALID)
                }
            }
        }
    }

    fn request_info(&self, request: RequestNr) -> Result<RequestInfo> {
        let st = self.lock();
        let slot = st.slot(request)?;
        let (image_address, _) = match (slot.mode, slot.user_buffer) {
            (MemoryMode::User, Some(user)) => user,
            _ => (slot.driver_block.as_ptr() as usize, slot.driver_block.len()),
        };
        Ok(RequestInfo {
            request,
            state: slot.state,
            memory_mode: slot.mode,
            image_address,
            image_size: self.layout.image_size,
            width: self.config.width,
            height: self.config.height,
            line_pitch: self.layout.line_pitch,
            pixel_format: self.config.pixel_format,
            result: slot.result,
            frame_nr: slot.frame_nr,
            timestamp_us: slot.timestamp_us,
        })
    }

    fn attach_user_buffer(&self, request: RequestNr, address: usize, size: usize) -> Result<()> {
        let mut st = self.lock();
        let fault = st.attach_faults.get(&request).copied();
        let slot = st.slot_mut(request)?;

        let rejected = if let Some(code) = fault {
            Some(code)
        } else if !slot.state.is_free() {
            Some(DriverErrorCode::REQUEST_ALREADY_IN_USE)
        } else if size < self.layout.buffer_size() {
            Some(DriverErrorCode::INVALID_BUFFER_SIZE)
        } else if !is_aligned(address, self.layout.alignment) {
            Some(DriverErrorCode::BUFFER_MISALIGNED)
        } else {
            None
        };
        if let Some(code) = rejected {
            return Err(CaptureError::AttachRejected { request, code });
        }

        slot.mode = MemoryMode::User;
        slot.user_buffer = Some((address, size));
        st.record(DriverEvent::Attached { request, address });
        Ok(())
    }

    fn detach_user_buffer(&self, request: RequestNr) -> Result<()> {
        let mut st = self.lock();
        let fault = st.detach_faults.get(&request).copied();
        let slot = st.slot_mut(request)?;

        if let Some(code) = fault {
            return Err(CaptureError::DetachRejected { request, code });
        }
        if !slot.state.is_free() {
            return Err(CaptureError::DetachRejected {
                request,
                code: DriverErrorCode::REQUEST_ALREADY_IN_USE,
            });
        }
        if slot.mode == MemoryMode::Driver {
            return Ok(());
        }

        slot.mode = MemoryMode::Driver;
        slot.user_buffer = None;
        st.record(DriverEvent::Detached(request));
        Ok(())
    }

    fn unlock_request(&self, request: RequestNr) -> Result<()> {
        let mut st = self.lock();
        let slot = st.slot_mut(request)?;
        if slot.state != RequestState::Ready {
            return Err(CaptureError::ContractViolation(format!(
                "request {} can't be unlocked in state {:?} ({})",
                request,
                slot.state,
                DriverErrorCode::REQUEST_CANT_BE_UNLOCKED
            )));
        }
        slot.state = RequestState::Unlocked;
        st.unlocks += 1;
        st.record(DriverEvent::Unlocked(request));
        Ok(())
    }

    fn reset_queue(&self, flags: ResetFlags) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(CaptureError::ContractViolation(
                "queue reset after the device was closed".into(),
            ));
        }

        let include_locked = flags.contains(ResetFlags::INCLUDE_LOCKED);
        st.queue.clear();
        for slot in st.slots.iter_mut() {
            match slot.state {
                RequestState::Submitted | RequestState::Unlocked => slot.state = RequestState::Idle,
                RequestState::Ready if include_locked => slot.state = RequestState::Idle,
                _ => {}
            }
        }
        st.resets += 1;
        st.record(DriverEvent::Reset);

        if flags.contains(ResetFlags::ABORT_WAITERS) {
            st.abort_generation += 1;
            if st.waiters > 0 {
                let _ = self.wake_tx.send(Wake::Abort(st.abort_generation));
            }
        }
        Ok(())
    }

    fn capture_buffer_layout(&self) -> Result<BufferLayout> {
        match self.lock().layout_fault {
            Some(code) => Err(CaptureError::LayoutUnavailable(code)),
            None => Ok(self.layout),
        }
    }

    fn statistics(&self) -> DriverStatistics {
        let st = self.lock();
        let elapsed = self.started.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            st.frames_produced as f64 / elapsed
        } else {
            0.0
        };
        DriverStatistics {
            frames_per_second: fps,
            error_count: st.error_count,
            capture_time_s: self
                .config
                .frame_period
                .unwrap_or(Duration::from_micros(1))
                .as_secs_f64(),
            bandwidth_consumed_kbps: Some((fps * self.layout.image_size as f64 / 1024.0) as u64),
        }
    }

    fn acquisition_start_stop(&self) -> AcquisitionStartStop {
        self.config.start_stop
    }

    fn start_acquisition(&self) -> Result<()> {
        let mut st = self.lock();
        st.running = true;
        st.record(DriverEvent::AcquisitionStarted);
        self.kick(&st);
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<()> {
        let mut st = self.lock();
        st.running = false;
        st.record(DriverEvent::AcquisitionStopped);
        Ok(())
    }
}
