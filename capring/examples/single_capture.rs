// capring/examples/single_capture.rs
//
// 把单独一帧采集到指定 Request 所挂的用户内存中，然后打印前几个像素。

use std::time::Duration;

use anyhow::Result;
use capring::prelude::*;
use capring_simulation::{device_info, SimConfig, SimDeviceManager};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let manager = SimDeviceManager::new().with_device(
        device_info("GX000007", "mvBlueFOX3-1012b"),
        SimConfig::new().resolution(320, 240).request_count(8),
    );
    let driver = manager.open("GX000007")?;
    let layout = driver.capture_buffer_layout()?;

    // 故意不用 0 号 Request
    let request = RequestNr(5);
    let outcome = capture_into_request(
        &driver,
        request,
        layout.buffer_size(),
        layout.alignment,
        WaitTimeout::Bounded(Duration::from_millis(500)),
    )?;

    match outcome {
        RequestOutcome::Ok(capture) => {
            println!(
                "Captured frame {} into request {}: {}x{}({}) at {:#x}",
                capture.info.frame_nr,
                capture.info.request,
                capture.info.width,
                capture.info.height,
                capture.info.pixel_format,
                capture.info.image_address
            );
            println!("First pixels: {:?}", &capture.data[..capture.data.len().min(16)]);
            if let Some(mismatch) = &capture.mismatch {
                println!("Buffer mismatch: {}", mismatch);
            }
        }
        other => println!("No image captured: {}", other.code()),
    }
    Ok(())
}
