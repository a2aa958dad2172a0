use std::sync::Arc;

use capring_core::error::Result;
use capring_core::request::{RequestInfo, RequestNr, RequestOutcome, WaitTimeout};
use capring_core::traits::{AcquisitionStartStop, RequestDriver, ResetFlags};

use crate::pool::CaptureBufferPool;
use crate::validator::{BufferMismatch, BufferValidator};

/// 单帧采集的结果：元数据和拷贝出来的图像
#[derive(Debug, Clone, PartialEq)]
pub struct SingleCapture {
    pub info: RequestInfo,
    pub data: Vec<u8>,
    /// 驱动报告的缓冲与 attach 的用户内存不一致时的诊断
    pub mismatch: Option<BufferMismatch>,
}

/// 把一帧采集到指定 Request 所挂的用户内存中
///
/// 依次执行：分配并 attach，`submit_request_to`，(需要时) 启动采集，等待，
/// (需要时) 停止采集，拷贝图像，unlock，重置队列，detach。
/// attach 被拒绝以及契约违规走 `Err`；提交失败、等待超时等预期情况通过
/// [`RequestOutcome`] 返回，此时队列同样会被重置、内存被释放。
pub fn capture_into_request(
    driver: &Arc<dyn RequestDriver>,
    request: RequestNr,
    buffer_size: usize,
    alignment: usize,
    timeout: WaitTimeout,
) -> Result<RequestOutcome<SingleCapture>> {
    let mut pool = CaptureBufferPool::new(driver.clone());
    pool.create_buffer(buffer_size, alignment, request)?;

    let outcome = capture_attached(driver, &pool, request, timeout);

    // 无论结果如何都要先清空队列，之后才能 detach
    if let Err(e) = driver.reset_queue(ResetFlags::INCLUDE_LOCKED) {
        tracing::warn!(target: "capring::session", "Queue reset after single capture failed: {}", e);
    }
    pool.free_buffer(request);
    if !pool.is_empty() {
        tracing::error!(
            target: "capring::pool",
            "User buffer for request {} was not released after single capture",
            request
        );
    }

    outcome
}

fn capture_attached(
    driver: &Arc<dyn RequestDriver>,
    pool: &CaptureBufferPool,
    request: RequestNr,
    timeout: WaitTimeout,
) -> Result<RequestOutcome<SingleCapture>> {
    match driver.submit_request_to(request) {
        RequestOutcome::Ok(_) => {}
        other => {
            tracing::warn!(
                target: "capring::session",
                "'submit_request_to({})' returned with an unexpected result: {}",
                request,
                other.code()
            );
            return Ok(not_captured(other));
        }
    }

    let manual = driver.acquisition_start_stop() == AcquisitionStartStop::User;
    if manual {
        driver.start_acquisition()?;
    }
    let waited = driver.wait_for_request(timeout);
    if manual {
        driver.stop_acquisition()?;
    }

    let used = match waited {
        RequestOutcome::Ok(used) => used,
        other => {
            tracing::warn!(
                target: "capring::session",
                "Waiting for request {} failed: {}",
                request,
                other.code()
            );
            return Ok(not_captured(other));
        }
    };

    if used != request {
        tracing::error!(
            target: "capring::session",
            "Captured into request {} although request {} was asked for",
            used,
            request
        );
    }

    let info = driver.request_info(used)?;
    // 只用于诊断：不一致以 error 级别记录，并随结果返回
    let mismatch = BufferValidator::new().validate(&info, true, pool).err();

    let data = pool
        .find(info.image_address)
        .map(|b| b.as_slice()[..info.image_size.min(b.size())].to_vec())
        .unwrap_or_default();

    driver.unlock_request(used)?;

    Ok(RequestOutcome::Ok(SingleCapture {
        info,
        data,
        mismatch,
    }))
}

/// 把非 Ok 的结果换成另一种载荷类型
fn not_captured<T>(outcome: RequestOutcome<RequestNr>) -> RequestOutcome<T> {
    match outcome {
        RequestOutcome::Saturated => RequestOutcome::Saturated,
        RequestOutcome::TimedOut => RequestOutcome::TimedOut,
        other => RequestOutcome::DriverError(other.code()),
    }
}
