// capring/examples/all_devices.rs
//
// 同时从所有型号匹配的 (仿真) 设备采集，统计信息通过同一把控制台锁输出。
// 用法: cargo run --example all_devices -- [产品过滤, 默认 "*"]

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

    let filter = std::env::args().nth(1).unwrap_or_else(|| "*".to_string());

    let fast = SimConfig::new().frame_period(Duration::from_millis(5));
    let manager = SimDeviceManager::new()
        .with_device(device_info("GX000001", "mvBlueFOX3-2032C"), fast.clone())
        .with_device(device_info("GX000002", "mvBlueFOX3-2064G"), fast.clone())
        .with_device(
            device_info("BC000003", "mvBlueCOUGAR-X102"),
            fast.resolution(1024, 768).start_stop(AcquisitionStartStop::User),
        );

    let console = ConsoleLock::new();
    let config = SessionConfig::new().statistics_interval(100);
    let capture = MultiDeviceCapture::start(&manager, &filter, &config, |info| {
        ConsoleSink::new(&info.serial, console.clone())
    })?;

    println!("Capturing from {} device(s), stopping in 2 s...", capture.len());
    std::thread::sleep(Duration::from_secs(2));

    for (info, result) in capture.stop() {
        match result {
            Ok(report) => println!(
                "{}({}): {} frames, {} timeouts",
                info.family,
                info.serial,
                report.counters.frames_received(),
                report.counters.timeouts
            ),
            Err(e) => println!("{}({}): {}", info.family, info.serial, e),
        }
    }
    Ok(())
}
