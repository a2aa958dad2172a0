// capring/examples/capture_to_user_memory.rs
//
// 在一台 (仿真) 设备上用用户内存采集，运行若干秒后停止。
// 用法: cargo run --example capture_to_user_memory -- [秒数] [always-fresh]

use std::time::Duration;

use anyhow::Result;
use capring::prelude::*;
use capring_simulation::{device_info, SimConfig, SimDeviceManager};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let seconds: u64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(3);
    let always_fresh = args.next().as_deref() == Some("always-fresh");

    let manager = SimDeviceManager::new().with_device(
        device_info("GX000042", "mvBlueFOX3-2032C"),
        SimConfig::new()
            .resolution(1280, 960)
            .frame_period(Duration::from_millis(10)),
    );

    let devices = manager.list_devices()?;
    let Some(info) = devices.first() else {
        anyhow::bail!("Unable to continue! No device found");
    };
    println!("Using {}({})", info.family, info.serial);
    let driver = manager.open(&info.serial)?;

    let layout = driver.capture_buffer_layout()?;
    println!(
        "Capture buffer: {} bytes image + {} bytes footer, alignment {}",
        layout.image_size, layout.footer_size, layout.alignment
    );

    let mode = if always_fresh {
        BufferMode::AlwaysFreshUserMemory
    } else {
        BufferMode::UserMemory
    };
    let config = SessionConfig::new()
        .label(info.serial.clone())
        .buffer_mode(mode)
        .statistics_interval(100);

    let console = ConsoleLock::new();
    let session = AcquisitionSession::start(driver, config, ConsoleSink::new(&info.serial, console))?;

    println!("Capturing for {} s ({:?})...", seconds, mode);
    std::thread::sleep(Duration::from_secs(seconds));

    let report = session.stop()?;
    println!(
        "{}: {} frames ok, {} failed, {} buffer swaps, {} mismatches, {} leaked buffers",
        report.label,
        report.counters.frames_ok,
        report.counters.frames_failed,
        report.counters.buffer_swaps,
        report.counters.validation_mismatches,
        report.leaked_buffers
    );
    Ok(())
}
