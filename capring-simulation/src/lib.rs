pub mod config;
pub mod driver;

use std::sync::{Arc, Mutex, PoisonError};

use capring_core::error::{CaptureError, Result};
use capring_core::traits::{DeviceInfo, DeviceManager, RequestDriver};

pub use config::SimConfig;
pub use driver::{DriverEvent, SimDriver};

/// 仿真设备枚举器
///
/// 每个设备在注册时就创建好对应的 [`SimDriver`]，`open` 返回同一个实例，
/// 测试可以通过 [`SimDeviceManager::driver`] 拿到它做断言。
#[derive(Debug, Default)]
pub struct SimDeviceManager {
    devices: Mutex<Vec<(DeviceInfo, Arc<SimDriver>)>>,
}

impl SimDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一台仿真设备
    pub fn with_device(self, info: DeviceInfo, config: SimConfig) -> Self {
        self.add_device(info, config);
        self
    }

    pub fn add_device(&self, info: DeviceInfo, config: SimConfig) -> Arc<SimDriver> {
        let driver = Arc::new(SimDriver::new(config));
        tracing::debug!(target: "capring::sim", "Registered simulated device {}", info.serial);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((info, driver.clone()));
        driver
    }

    /// 按序列号取出仿真驱动
    pub fn driver(&self, serial: &str) -> Option<Arc<SimDriver>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(info, _)| info.serial == serial)
            .map(|(_, driver)| driver.clone())
    }
}

impl DeviceManager for SimDeviceManager {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, serial: &str) -> Result<Arc<dyn RequestDriver>> {
        match self.driver(serial) {
            Some(driver) => Ok(driver as Arc<dyn RequestDriver>),
            None => Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No simulated device with serial {}", serial),
            ))),
        }
    }
}

/// 生成一台仿真设备的描述
pub fn device_info(serial: &str, product: &str) -> DeviceInfo {
    let family = product.split('-').next().unwrap_or(product).to_string();
    DeviceInfo {
        serial: serial.to_string(),
        product: product.to_string(),
        family,
    }
}
