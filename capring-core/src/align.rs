//! DMA 对齐算术
//!
//! 只处理整数地址，与分配完全解耦，方便单独做属性测试。
//! 地址宽度与平台指针一致 (`usize`)。

/// 把地址向上取整到 `alignment` 的整数倍
///
/// `aligned = p + ((a - (p mod a)) mod a)`。
/// `alignment <= 1` 时原样返回。对齐值不要求是 2 的幂，硬件给什么就用什么。
pub const fn align_up(address: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return address;
    }
    address + ((alignment - (address % alignment)) % alignment)
}

/// 为了在任意起始地址上都能取到对齐指针，需要额外分配的字节数
pub const fn alignment_slack(alignment: usize) -> usize {
    if alignment <= 1 {
        0
    } else {
        alignment
    }
}

pub const fn is_aligned(address: usize, alignment: usize) -> bool {
    alignment <= 1 || address % alignment == 0
}
