mod common;

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use capring::cycler::{CyclerState, RequestCycler, StepOutcome};
use capring::pool::CaptureBufferPool;
use capring_core::builder::{BufferMode, SessionConfig};
use capring_core::request::{RequestNr, RequestResult, WaitTimeout};
use capring_core::traits::{NullSink, RequestDriver};
use capring_simulation::{DriverEvent, SimConfig, SimDriver};

use common::{CountingAllocator, RecordingSink};

fn driver_of(sim: &Arc<SimDriver>) -> Arc<dyn RequestDriver> {
    sim.clone()
}

/// 稳态阶段每一次 unlock 都必须是 "上上一个" 完成的 Request；
/// 收尾阶段 (紧跟着 Reset 的那次) 归还的是最后一个
fn assert_double_buffered(events: &[DriverEvent]) {
    let mut completed = Vec::new();
    for (i, event) in events.iter().enumerate() {
        match *event {
            DriverEvent::Completed(request) => completed.push(request),
            DriverEvent::Unlocked(request) => {
                let draining = matches!(events.get(i + 1), Some(DriverEvent::Reset));
                if draining {
                    assert_eq!(Some(&request), completed.last());
                } else {
                    assert!(completed.len() >= 2, "unlock of {} before a newer frame", request);
                    assert_eq!(request, completed[completed.len() - 2]);
                }
            }
            DriverEvent::Reset => break,
            _ => {}
        }
    }
}

#[test]
fn end_to_end_always_fresh_user_memory() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(
        SimConfig::new()
            .request_count(4)
            .resolution(64, 16)
            .frame_budget(10),
    ));
    sim.set_result_script(vec![RequestResult::Ok, RequestResult::FrameIncomplete]);

    let alloc = CountingAllocator::new();
    let mut pool = CaptureBufferPool::with_allocator(driver_of(&sim), alloc.clone());
    let layout = sim.config().layout();
    pool.create_all_buffers(layout.buffer_size(), layout.alignment)?;
    let original: HashSet<usize> = pool.addresses().into_iter().collect();
    assert_eq!(original.len(), 4);

    let sink = RecordingSink::new();
    let config = SessionConfig::new()
        .label("e2e")
        .buffer_mode(BufferMode::AlwaysFreshUserMemory)
        .wait_timeout(WaitTimeout::from_millis(200));
    let mut cycler = RequestCycler::new(driver_of(&sim), config, pool, sink.clone());

    // 预热：4 次成功，第 5 次饱和
    assert_eq!(cycler.prime()?, 4);
    assert_eq!(sim.submit_count(), 4);
    assert_eq!(cycler.counters().saturations, 1);
    assert_eq!(cycler.state(), CyclerState::Steady);

    for i in 0..10 {
        match cycler.step()? {
            StepOutcome::Completed { ok, .. } => assert_eq!(ok, i % 2 == 0, "frame {}", i),
            other => panic!("frame {} not delivered: {:?}", i, other),
        }
    }
    cycler.drain()?;

    assert_eq!(sim.unlock_count(), 10);
    assert_eq!(cycler.counters().unlocks, 10);
    assert_eq!(cycler.counters().frames_ok, 5);
    assert_eq!(cycler.counters().frames_failed, 5);
    assert_eq!(cycler.counters().validation_mismatches, 0);
    assert_eq!(sim.reset_count(), 1);
    assert_eq!(cycler.state(), CyclerState::Stopped);

    let current: HashSet<usize> = cycler.pool().addresses().into_iter().collect();
    assert_eq!(cycler.pool().len(), 4);
    assert_eq!(current.len(), 4);
    assert!(current.is_disjoint(&original));

    let recorded = sink.snapshot();
    assert_eq!(recorded.frames.len(), 5);
    assert!(recorded.frames.iter().all(|&(_, _, has_data)| has_data));
    assert_eq!(recorded.errors.len(), 5);
    assert!(recorded.errors.iter().all(|e| e == "Error: FrameIncomplete"));

    assert_eq!(cycler.pool_mut().free_all_buffers(), 0);
    assert_eq!(alloc.live(), 0);
    Ok(())
}

#[test]
fn previous_request_is_unlocked_only_after_a_newer_one_arrives() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new().request_count(4).frame_budget(12)));
    let pool = CaptureBufferPool::new(driver_of(&sim));
    let mut cycler = RequestCycler::new(driver_of(&sim), SessionConfig::new(), pool, NullSink);

    cycler.prime()?;
    let first = cycler.step()?;
    assert_eq!(
        first,
        StepOutcome::Completed {
            request: RequestNr(0),
            ok: true
        }
    );
    // 第一帧之后没有任何 unlock，它仍然交给消费端
    assert_eq!(sim.unlock_count(), 0);
    assert_eq!(cycler.held_request(), Some(RequestNr(0)));

    cycler.step()?;
    assert_eq!(sim.unlock_count(), 1);
    assert_eq!(cycler.held_request(), Some(RequestNr(1)));

    cycler.drain()?;
    assert_eq!(sim.unlock_count(), 2);
    assert_eq!(cycler.held_request(), None);
    assert_double_buffered(&sim.events());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn unlock_always_lags_one_frame(requests in 2usize..7, frames in 1u64..40) {
        let sim = Arc::new(SimDriver::new(
            SimConfig::new().request_count(requests).resolution(8, 2).frame_budget(frames),
        ));
        let pool = CaptureBufferPool::new(driver_of(&sim));
        let config = SessionConfig::new().wait_timeout(WaitTimeout::from_millis(100));
        let mut cycler = RequestCycler::new(driver_of(&sim), config, pool, NullSink);

        cycler.prime().unwrap();
        for _ in 0..frames {
            let outcome = cycler.step().unwrap();
            let completed = matches!(outcome, StepOutcome::Completed { .. });
            prop_assert!(completed);
        }
        cycler.drain().unwrap();

        assert_double_buffered(&sim.events());
        prop_assert_eq!(sim.unlock_count(), frames);
        prop_assert_eq!(sim.reset_count(), 1);
    }
}

#[test]
fn statistics_are_emitted_every_nth_ok_frame() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new().request_count(3).frame_budget(9)));
    let sink = RecordingSink::new();
    let pool = CaptureBufferPool::new(driver_of(&sim));
    let config = SessionConfig::new().label("cam0").statistics_interval(3);
    let mut cycler = RequestCycler::new(driver_of(&sim), config, pool, sink.clone());

    cycler.prime()?;
    for _ in 0..9 {
        cycler.step()?;
    }
    cycler.drain()?;

    let stats = sink.snapshot().statistics;
    assert_eq!(stats.len(), 3);
    let ok_counts: Vec<u64> = stats.iter().map(|s| s.counters.frames_ok).collect();
    assert_eq!(ok_counts, vec![3, 6, 9]);
    let line = stats[0].to_string();
    assert!(line.starts_with("Info from cam0: FramesPerSecond: "));
    assert!(line.contains("CaptureDimension: 640x480(GREY)"));
    Ok(())
}

#[test]
fn mismatches_are_reported_and_never_corrected() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new().request_count(3).frame_budget(4)));
    let sink = RecordingSink::new();
    // 声称使用用户内存，但从未 attach 任何缓冲
    let pool = CaptureBufferPool::new(driver_of(&sim));
    let config = SessionConfig::new().buffer_mode(BufferMode::UserMemory);
    let mut cycler = RequestCycler::new(driver_of(&sim), config, pool, sink.clone());

    cycler.prime()?;
    for _ in 0..4 {
        cycler.step()?;
    }

    assert_eq!(cycler.counters().validation_mismatches, 4);
    assert_eq!(cycler.counters().frames_ok, 4);
    let recorded = sink.snapshot();
    assert_eq!(recorded.frames.len(), 4);
    assert!(recorded.frames.iter().all(|&(_, _, has_data)| !has_data));
    assert!(recorded.errors[0].contains("is supposed to contain user supplied memory"));
    // 循环照常进行，没有尝试补 attach
    assert!(!sim
        .events()
        .iter()
        .any(|e| matches!(e, DriverEvent::Attached { .. })));
    Ok(())
}

#[test]
fn closed_device_ends_the_loop_with_a_contract_violation() -> anyhow::Result<()> {
    common::init_tracing();
    let sim = Arc::new(SimDriver::new(SimConfig::new().request_count(2)));
    let pool = CaptureBufferPool::new(driver_of(&sim));
    let mut cycler = RequestCycler::new(driver_of(&sim), SessionConfig::new(), pool, NullSink);

    cycler.prime()?;
    cycler.step()?;
    sim.close();

    let err = cycler.step().unwrap_err();
    assert!(err.is_contract_violation());
    Ok(())
}
