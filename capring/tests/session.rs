mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capring::cycler::CyclerState;
use capring::pool::HeapAllocator;
use capring::session::{AcquisitionSession, CancelToken};
use capring_core::builder::{BufferMode, SessionConfig};
use capring_core::error::{CaptureError, DriverErrorCode};
use capring_core::request::{Frame, RequestNr, WaitTimeout};
use capring_core::traits::{AcquisitionStartStop, FrameSink, NullSink, RequestDriver};
use capring_simulation::{SimConfig, SimDriver};

use common::{CountingAllocator, RecordingSink};

fn driver_of(sim: &Arc<SimDriver>) -> Arc<dyn RequestDriver> {
    sim.clone()
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// 第 `after` 帧时设置取消标志，并记下当时驱动上的等待次数
struct CancelAfter {
    remaining: u64,
    token: CancelToken,
    sim: Arc<SimDriver>,
    waits_at_cancel: Arc<AtomicU64>,
}

impl FrameSink for CancelAfter {
    fn on_frame_ready(&mut self, _frame: &Frame<'_>) {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.waits_at_cancel
                .store(self.sim.wait_count(), Ordering::SeqCst);
            self.token.cancel();
        }
    }
}

#[test]
fn termination_mid_loop_drains_after_at_most_one_more_wait() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new().request_count(4).frame_period(Duration::from_millis(1)),
    ));
    let token = CancelToken::new();
    let waits_at_cancel = Arc::new(AtomicU64::new(0));
    let sink = CancelAfter {
        remaining: 7,
        token: token.clone(),
        sim: sim.clone(),
        waits_at_cancel: waits_at_cancel.clone(),
    };

    let session = AcquisitionSession::start_with(
        driver_of(&sim),
        SessionConfig::new().label("shutdown"),
        sink,
        Arc::new(HeapAllocator),
        token,
    )?;

    assert!(wait_until(Duration::from_secs(5), || session.is_finished()));
    let report = session.stop()?;

    let at_cancel = waits_at_cancel.load(Ordering::SeqCst);
    assert!(at_cancel > 0);
    assert!(sim.wait_count() <= at_cancel + 1);
    assert_eq!(sim.reset_count(), 1);
    assert_eq!(report.final_state, CyclerState::Stopped);
    assert_eq!(report.counters.frames_ok, 7);
    // 稳态 6 次，收尾 1 次
    assert_eq!(report.counters.unlocks, 7);
    assert_eq!(report.leaked_buffers, 0);
    Ok(())
}

#[test]
fn stop_is_bounded_by_the_wait_timeout() -> anyhow::Result<()> {
    common::init_tracing();
    // 触发模式，一直没有触发：每次等待都会超时
    let sim = Arc::new(SimDriver::new(SimConfig::new().triggered(true)));
    let config = SessionConfig::new().wait_timeout(WaitTimeout::from_millis(20));
    let session = AcquisitionSession::start(driver_of(&sim), config, NullSink)?;

    assert!(wait_until(Duration::from_secs(2), || sim.wait_count() >= 2));
    let started = Instant::now();
    let report = session.stop()?;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(report.counters.timeouts >= 1);
    assert_eq!(report.counters.frames_received(), 0);
    assert_eq!(report.counters.primed, 4);
    assert_eq!(sim.reset_count(), 1);
    Ok(())
}

#[test]
fn infinite_wait_is_aborted_through_queue_reset() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new().triggered(true)));
    let config = SessionConfig::new().wait_timeout(WaitTimeout::Infinite);
    let session = AcquisitionSession::start(driver_of(&sim), config, NullSink)?;

    assert!(wait_until(Duration::from_secs(2), || sim.wait_count() >= 1));
    let report = session.stop()?;

    assert_eq!(report.final_state, CyclerState::Stopped);
    // 至少一次用于唤醒，另有一次是收尾
    assert!(sim.reset_count() >= 2);
    Ok(())
}

#[test]
fn user_memory_session_releases_every_buffer() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new()
            .request_count(4)
            .resolution(32, 8)
            .frame_period(Duration::from_millis(1)),
    ));
    let alloc = CountingAllocator::new();
    let sink = RecordingSink::new();
    let config = SessionConfig::new()
        .label("fresh")
        .buffer_mode(BufferMode::AlwaysFreshUserMemory);
    let session =
        AcquisitionSession::start_with_allocator(driver_of(&sim), config, sink.clone(), alloc.clone())?;

    assert!(wait_until(Duration::from_secs(5), || sink.snapshot().frames.len() >= 10));
    let report = session.stop()?;

    assert_eq!(report.leaked_buffers, 0);
    assert_eq!(report.counters.validation_mismatches, 0);
    assert!(report.counters.buffer_swaps >= 9);
    assert_eq!(alloc.live(), 0);
    for i in 0..4 {
        assert_eq!(sim.attached_address(RequestNr(i)), None);
    }
    assert!(sink.snapshot().frames.iter().all(|&(_, _, has_data)| has_data));
    Ok(())
}

#[test]
fn setup_errors_are_returned_synchronously() {
    common::init_tracing();

    let sim = Arc::new(SimDriver::new(SimConfig::new()));
    sim.fail_layout_query(DriverErrorCode::LAYOUT_UNAVAILABLE);
    let config = SessionConfig::new().buffer_mode(BufferMode::UserMemory);
    let err = AcquisitionSession::start(driver_of(&sim), config, NullSink).unwrap_err();
    assert!(matches!(err, CaptureError::LayoutUnavailable(_)));
    assert_eq!(sim.submit_count(), 0);

    let sim = Arc::new(SimDriver::new(SimConfig::new()));
    sim.reject_attach(RequestNr(3), DriverErrorCode::BUFFER_MISALIGNED);
    let config = SessionConfig::new().buffer_mode(BufferMode::UserMemory);
    let err = AcquisitionSession::start(driver_of(&sim), config, NullSink).unwrap_err();
    assert_eq!(err.driver_code(), Some(DriverErrorCode::BUFFER_MISALIGNED));
    assert_eq!(sim.attached_address(RequestNr(0)), None);

    let config = SessionConfig::new().label("");
    let err = AcquisitionSession::start(driver_of(&sim), config, NullSink).unwrap_err();
    assert!(matches!(err, CaptureError::InvalidConfig(_)));
}

#[test]
fn closed_device_ends_the_session_with_contract_violation() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new().frame_period(Duration::from_millis(1)),
    ));
    let sink = RecordingSink::new();
    let session = AcquisitionSession::start(driver_of(&sim), SessionConfig::new(), sink.clone())?;

    assert!(wait_until(Duration::from_secs(5), || !sink.snapshot().frames.is_empty()));
    sim.close();
    assert!(wait_until(Duration::from_secs(5), || session.is_finished()));

    let err = session.stop().unwrap_err();
    assert!(err.is_contract_violation());
    assert!(sink
        .snapshot()
        .errors
        .iter()
        .any(|e| e.contains("contract violation")));
    Ok(())
}

struct Explodes;

impl FrameSink for Explodes {
    fn on_frame_ready(&mut self, _frame: &Frame<'_>) {
        panic!("display exploded");
    }
}

#[test]
fn worker_panic_is_reported() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new()));
    let session = AcquisitionSession::start(driver_of(&sim), SessionConfig::new(), Explodes)?;

    assert!(wait_until(Duration::from_secs(5), || session.is_finished()));
    match session.stop() {
        Err(CaptureError::WorkerPanicked(message)) => assert!(message.contains("display exploded")),
        other => panic!("unexpected result {:?}", other),
    }
    Ok(())
}

#[test]
fn manual_acquisition_is_started_and_stopped() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new()
            .start_stop(AcquisitionStartStop::User)
            .frame_period(Duration::from_millis(1)),
    ));
    let sink = RecordingSink::new();
    let session = AcquisitionSession::start(driver_of(&sim), SessionConfig::new(), sink.clone())?;

    assert!(wait_until(Duration::from_secs(5), || sink.snapshot().frames.len() >= 3));
    assert!(sim.is_running());
    session.stop()?;
    assert!(!sim.is_running());
    Ok(())
}

#[test]
fn dropping_a_session_stops_the_worker() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new().frame_period(Duration::from_millis(1)),
    ));
    let session = AcquisitionSession::start(driver_of(&sim), SessionConfig::new(), NullSink)?;
    assert!(wait_until(Duration::from_secs(5), || sim.frames_produced() > 0));

    drop(session);
    assert_eq!(sim.reset_count(), 1);
    Ok(())
}
