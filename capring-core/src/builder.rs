use crate::error::{CaptureError, Result};
use crate::request::WaitTimeout;

/// 图像内存的供给方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum BufferMode {
    /// 驱动自己分配 (默认行为)，缓冲池为空
    #[default]
    DriverMemory,
    /// 应用为每个槽位分配一块对齐内存并 attach
    UserMemory,
    /// 每次回收槽位前都 detach 并换上一块新分配的用户内存
    AlwaysFreshUserMemory,
}

impl BufferMode {
    pub fn uses_user_memory(&self) -> bool {
        !matches!(self, Self::DriverMemory)
    }
}

/// 一次采集会话的配置
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SessionConfig {
    /// 流名称，出现在所有日志中 (通常是设备序列号)
    pub label: String,
    /// 等待完成 Request 的超时，默认 500ms
    pub wait_timeout: WaitTimeout,
    pub buffer_mode: BufferMode,
    /// 每隔多少个成功帧输出一次统计，0 表示关闭
    pub statistics_interval: u32,
    /// 每轮先丢弃已经积压的旧帧，只处理最新的
    pub drop_outdated: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            label: String::from("stream"),
            wait_timeout: WaitTimeout::default(),
            buffer_mode: BufferMode::DriverMemory,
            statistics_interval: 100,
            drop_outdated: false,
        }
    }

    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }

    /// 设置等待超时
    pub fn wait_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn buffer_mode(mut self, mode: BufferMode) -> Self {
        self.buffer_mode = mode;
        self
    }

    pub fn statistics_interval(mut self, every_n_frames: u32) -> Self {
        self.statistics_interval = every_n_frames;
        self
    }

    pub fn drop_outdated(mut self, enabled: bool) -> Self {
        self.drop_outdated = enabled;
        self
    }

    /// 检查配置一致性
    ///
    /// 无限超时是合法的，但会让终止标志在阻塞期间失效，这里只给出警告。
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(CaptureError::InvalidConfig("label must not be empty".into()));
        }

        if self.wait_timeout.is_infinite() {
            if self.drop_outdated {
                return Err(CaptureError::InvalidConfig(
                    "drop_outdated needs a bounded wait timeout".into(),
                ));
            }
            tracing::warn!(
                target: "capring::session",
                stream = %self.label,
                "Infinite wait timeout: the terminate flag is only observed after a frame arrives; \
                 another thread must call reset_queue to unblock the worker"
            );
        }

        Ok(())
    }

    #[cfg(feature = "serialize")]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CaptureError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serialize")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CaptureError::InvalidConfig(e.to_string()))
    }
}
