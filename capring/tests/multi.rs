mod common;

use std::time::{Duration, Instant};

use capring::multi::MultiDeviceCapture;
use capring::sink::{ChannelSink, ConsoleLock, ConsoleSink};
use capring_core::builder::{BufferMode, SessionConfig};
use capring_core::error::{CaptureError, DriverErrorCode};
use capring_core::traits::NullSink;
use capring_simulation::{device_info, SimConfig, SimDeviceManager};

fn fast() -> SimConfig {
    SimConfig::new()
        .resolution(64, 16)
        .frame_period(Duration::from_millis(2))
}

fn manager() -> SimDeviceManager {
    SimDeviceManager::new()
        .with_device(device_info("GX000001", "mvBlueFOX3-2032C"), fast())
        .with_device(device_info("GX000002", "mvBlueCOUGAR-X102"), fast())
        .with_device(device_info("GX000003", "mvBlueFOX3-2064G"), fast())
}

#[test]
fn only_matching_devices_are_started() -> anyhow::Result<()> {
    common::init_tracing();
    let manager = manager();
    let mut receivers = Vec::new();

    let capture = MultiDeviceCapture::start(&manager, "mvBlueFOX3*", &SessionConfig::new(), |_| {
        let (sink, frames) = ChannelSink::bounded(64);
        receivers.push(frames);
        sink
    })?;
    assert_eq!(capture.len(), 2);
    assert_eq!(receivers.len(), 2);
    let serials: Vec<&str> = capture.devices().map(|d| d.serial.as_str()).collect();
    assert_eq!(serials, vec!["GX000001", "GX000003"]);

    // 两台设备都要出帧
    for frames in &receivers {
        let summary = frames.recv_timeout(Duration::from_secs(5))?;
        assert_eq!((summary.width, summary.height), (64, 16));
    }

    let results = capture.stop();
    assert_eq!(results.len(), 2);
    for (info, result) in &results {
        let report = result.as_ref().map_err(|e| anyhow::anyhow!("{}: {}", info.serial, e))?;
        assert_eq!(report.label, info.serial);
        assert_eq!(report.leaked_buffers, 0);
    }

    let cougar = manager.driver("GX000002").ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(cougar.submit_count(), 0);
    for serial in ["GX000001", "GX000003"] {
        let sim = manager.driver(serial).ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(sim.reset_count(), 1);
        assert!(sim.submit_count() > 0);
    }
    Ok(())
}

#[test]
fn all_devices_produce_frames_through_a_shared_console() -> anyhow::Result<()> {
    common::init_tracing();
    let manager = manager();
    let lock = ConsoleLock::new();

    let capture = MultiDeviceCapture::start(&manager, "*", &SessionConfig::new(), |info| {
        ConsoleSink::new(info.serial.clone(), lock.clone())
    })?;
    assert_eq!(capture.len(), 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    let serials = ["GX000001", "GX000002", "GX000003"];
    while Instant::now() < deadline {
        let all_running = serials.iter().all(|s| {
            manager
                .driver(s)
                .map_or(false, |sim| sim.frames_produced() >= 3)
        });
        if all_running {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    for (info, result) in capture.stop() {
        let report = result.map_err(|e| anyhow::anyhow!("{}: {}", info.serial, e))?;
        assert!(report.counters.frames_ok >= 3, "{} delivered too few frames", info.serial);
    }
    Ok(())
}

#[test]
fn no_matching_device_is_not_found() {
    common::init_tracing();
    let manager = manager();

    let err = MultiDeviceCapture::start(&manager, "mvBlueNAOS*", &SessionConfig::new(), |_| NullSink)
        .unwrap_err();

    match err {
        CaptureError::Io(e) => {
            assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
            assert!(e.to_string().contains("mvBlueNAOS*"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn device_failing_setup_is_skipped() -> anyhow::Result<()> {
    common::init_tracing();
    let manager = manager();
    let broken = manager.driver("GX000001").ok_or_else(|| anyhow::anyhow!("missing"))?;
    broken.fail_layout_query(DriverErrorCode::LAYOUT_UNAVAILABLE);

    let config = SessionConfig::new().buffer_mode(BufferMode::UserMemory);
    let capture = MultiDeviceCapture::start(&manager, "mvBlueFOX3*", &config, |_| NullSink)?;

    let serials: Vec<String> = capture.devices().map(|d| d.serial.clone()).collect();
    assert_eq!(serials, vec!["GX000003".to_string()]);
    assert_eq!(broken.submit_count(), 0);

    for (_, result) in capture.stop() {
        assert_eq!(result?.leaked_buffers, 0);
    }
    Ok(())
}
