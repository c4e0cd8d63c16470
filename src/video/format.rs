//! Pixel format and resolution definitions

use std::fmt;

use v4l2r::PixelFormat as V4l2rPixelFormat;

/// Capture pixel formats this pipeline can feed to the encoder.
///
/// Only uncompressed formats with a known YUV420P conversion are listed;
/// anything else the driver offers is a negotiation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (the common capture-card default)
    Yuyv,
    /// UYVY 4:2:2 packed
    Uyvy,
    /// NV12 semi-planar (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar (encoder-native, no conversion needed)
    Yuv420,
}

impl PixelFormat {
    /// Convert to a V4L2 FourCC.
    pub fn to_fourcc(&self) -> V4l2rPixelFormat {
        let code: &[u8; 4] = match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Yuv420 => b"YU12",
        };
        V4l2rPixelFormat::from(u32::from_le_bytes(*code))
    }

    /// Try to convert from a V4L2 FourCC.
    pub fn from_fourcc(fourcc: V4l2rPixelFormat) -> Option<Self> {
        let raw: u32 = fourcc.into();
        match &raw.to_le_bytes() {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Expected frame size in bytes for a given resolution.
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = (resolution.width * resolution.height) as usize;
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => pixels * 2,
            PixelFormat::Nv12 | PixelFormat::Yuv420 => pixels * 3 / 2,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "YUYV" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" | "YU12" => Ok(PixelFormat::Yuv420),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width >= 160 && self.width <= 7680 && self.height >= 120 && self.height <= 4320
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trip() {
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Nv12,
            PixelFormat::Yuv420,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(format));
        }
    }

    #[test]
    fn frame_sizes() {
        let res = Resolution::new(1920, 1080);
        assert_eq!(PixelFormat::Yuyv.frame_size(res), 1920 * 1080 * 2);
        assert_eq!(PixelFormat::Yuv420.frame_size(res), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn resolution_bounds() {
        assert!(Resolution::HD1080.is_valid());
        assert!(!Resolution::new(32, 32).is_valid());
    }
}
