use std::fmt::{self, Display};

/// 四字符代码 (Four Character Code)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    /// 从 ASCII 字符创建 FourCC
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self((a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24))
    }
}

impl Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes).trim_end())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// 机器视觉相机常见的目标像素格式
impl FourCC {
    // --- Mono ---
    /// 8-bit 灰度
    pub const MONO8: Self = Self::new(b'G', b'R', b'E', b'Y');
    /// 16-bit 灰度 (10/12/14 bit 数据按 16 bit 存放)
    pub const MONO16: Self = Self::new(b'Y', b'1', b'6', b' ');

    // --- RGB ---
    /// BGR888 Packed
    pub const BGR3: Self = Self::new(b'B', b'G', b'R', b'3');
    /// RGB888 Packed
    pub const RGB3: Self = Self::new(b'R', b'G', b'B', b'3');
    /// RGBx888 Packed
    pub const RGBA: Self = Self::new(b'R', b'G', b'B', b'A');

    // --- YUV 4:2:2 ---
    pub const YUYV: Self = Self::new(b'Y', b'U', b'Y', b'V');
    pub const UYVY: Self = Self::new(b'U', b'Y', b'V', b'Y');

    // --- Bayer 8-bit ---
    pub const BA81: Self = Self::new(b'B', b'A', b'8', b'1');
    pub const RGGB: Self = Self::new(b'R', b'G', b'G', b'B');
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Known(FourCC),
    /// 驱动返回了库不认识的私有格式
    Unknown(u32),
}

impl PixelFormat {
    /// 每像素字节数，用于计算行跨距和缓冲大小。未知格式返回 0。
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Known(cc) => match *cc {
                FourCC::MONO8 | FourCC::BA81 | FourCC::RGGB => 1,
                FourCC::MONO16 | FourCC::YUYV | FourCC::UYVY => 2,
                FourCC::BGR3 | FourCC::RGB3 => 3,
                FourCC::RGBA => 4,
                _ => 0,
            },
            Self::Unknown(_) => 0,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Known(FourCC::MONO8)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(cc) => write!(f, "{}", cc),
            Self::Unknown(raw) => write!(f, "Unknown({:#010x})", raw),
        }
    }
}

impl From<FourCC> for PixelFormat {
    fn from(cc: FourCC) -> Self {
        Self::Known(cc)
    }
}
