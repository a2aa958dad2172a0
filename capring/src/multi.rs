use capring_core::builder::SessionConfig;
use capring_core::error::{CaptureError, Result};
use capring_core::traits::{DeviceInfo, DeviceManager, FrameSink};

use crate::session::{AcquisitionSession, SessionReport};

/// `*` 通配符匹配 (`*` 匹配任意长度的任意字符，其余字符逐个比较)
pub fn matches_wildcard(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // 最近一个 '*' 的位置，以及它当时对应的 text 位置
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // 让上一个 '*' 多吞一个字符
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// 同时在多台设备上采集
///
/// 每台设备一个独立的 [`AcquisitionSession`] (各自的工作线程、缓冲池)。
/// 需要共享输出时，由 `sink_factory` 给每个消费端同一把 [`ConsoleLock`](crate::sink::ConsoleLock)。
#[derive(Debug)]
pub struct MultiDeviceCapture {
    sessions: Vec<(DeviceInfo, AcquisitionSession)>,
}

impl MultiDeviceCapture {
    /// 打开所有产品型号匹配 `product_filter` 的设备并开始采集
    ///
    /// 单台设备打开或启动失败只记日志并跳过；一台都没有启动时返回错误。
    pub fn start<F, S>(
        manager: &dyn DeviceManager,
        product_filter: &str,
        config: &SessionConfig,
        mut sink_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(&DeviceInfo) -> S,
        S: FrameSink + 'static,
    {
        let mut sessions = Vec::new();

        for info in manager.list_devices()? {
            if !matches_wildcard(product_filter, &info.product) {
                continue;
            }

            let driver = match manager.open(&info.serial) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::warn!(
                        target: "capring::session",
                        "Failed to open {}({}): {}",
                        info.family,
                        info.serial,
                        e
                    );
                    continue;
                }
            };

            let session_config = config.clone().label(info.serial.clone());
            match AcquisitionSession::start(driver, session_config, sink_factory(&info)) {
                Ok(session) => {
                    tracing::info!(target: "capring::session", "{}({})", info.family, info.serial);
                    sessions.push((info, session));
                }
                Err(e) => tracing::warn!(
                    target: "capring::session",
                    "Failed to start acquisition on {}: {}",
                    info.serial,
                    e
                ),
            }
        }

        if sessions.is_empty() {
            return Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No device found that matches the product filter '{}'", product_filter),
            )));
        }

        Ok(Self { sessions })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.sessions.iter().map(|(info, _)| info)
    }

    /// 先通知所有会话停止，再逐个等待
    ///
    /// 这样总的停止时间约等于一个等待超时，而不是设备数乘以超时。
    pub fn stop(self) -> Vec<(DeviceInfo, Result<SessionReport>)> {
        tracing::info!(target: "capring::session", "Terminating live threads...");
        for (_, session) in &self.sessions {
            session.cancel();
        }
        self.sessions
            .into_iter()
            .map(|(info, session)| (info, session.join()))
            .collect()
    }
}
