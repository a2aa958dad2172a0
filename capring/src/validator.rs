use thiserror::Error;

use capring_core::request::{MemoryMode, RequestInfo, RequestNr};

use crate::pool::{format_addresses, CaptureBufferPool};

/// 驱动返回的缓冲与本地缓冲池记账不一致
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferMismatch {
    /// 驱动悄悄退回到了自己的内存 (attach 失败没有被发现)
    #[error("Request number {request} is supposed to contain user supplied memory, but claims that it doesn't")]
    ExpectedUserMemory { request: RequestNr },

    /// 旧的 attach 没有被清掉
    #[error("Request number {request} is supposed NOT to contain user supplied memory, but claims that it does")]
    UnexpectedUserMemory { request: RequestNr },

    #[error(
        "Request number {request} returned buffer {address:#x}, which doesn't match any user buffer (allocated: {})",
        format_addresses(.pool)
    )]
    UnknownAddress {
        request: RequestNr,
        address: usize,
        pool: Vec<usize>,
    },
}

impl BufferMismatch {
    pub fn request(&self) -> RequestNr {
        match self {
            Self::ExpectedUserMemory { request }
            | Self::UnexpectedUserMemory { request }
            | Self::UnknownAddress { request, .. } => *request,
        }
    }
}

/// 对照地址列表检查一个已完成的 Request
pub fn check_request(
    info: &RequestInfo,
    expect_user_memory: bool,
    pool_addresses: &[usize],
) -> std::result::Result<(), BufferMismatch> {
    let is_user = info.memory_mode == MemoryMode::User;
    match (expect_user_memory, is_user) {
        (true, false) => Err(BufferMismatch::ExpectedUserMemory {
            request: info.request,
        }),
        (false, true) => Err(BufferMismatch::UnexpectedUserMemory {
            request: info.request,
        }),
        (false, false) => Ok(()),
        (true, true) => {
            if pool_addresses.contains(&info.image_address) {
                Ok(())
            } else {
                Err(BufferMismatch::UnknownAddress {
                    request: info.request,
                    address: info.image_address,
                    pool: pool_addresses.to_vec(),
                })
            }
        }
    }
}

/// 纯诊断组件：只记录不一致，从不自动修正
#[derive(Debug, Default)]
pub struct BufferValidator {
    mismatches: u64,
}

impl BufferValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        &mut self,
        info: &RequestInfo,
        expect_user_memory: bool,
        pool: &CaptureBufferPool,
    ) -> std::result::Result<(), BufferMismatch> {
        // 驱动内存模式下不需要地址表
        let addresses = if expect_user_memory {
            pool.addresses()
        } else {
            Vec::new()
        };

        let outcome = check_request(info, expect_user_memory, &addresses);
        if let Err(mismatch) = &outcome {
            self.mismatches += 1;
            tracing::error!(target: "capring::validator", "{}", mismatch);
        }
        outcome
    }

    /// 累计发现的不一致次数
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }
}
