//! Pixel formats and geometry.

use std::fmt;
use std::str::FromStr;

/// Pixel formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Rgb24,
    Bgr24,
    Jpeg,
    Mjpeg,
    H264,
    Grey,
}

impl PixelFormat {
    /// Maps a V4L2-style fourcc to a pixel format.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"YUYV" => Some(Self::Yuyv),
            b"UYVY" => Some(Self::Uyvy),
            b"RGB3" => Some(Self::Rgb24),
            b"BGR3" => Some(Self::Bgr24),
            b"JPEG" => Some(Self::Jpeg),
            b"MJPG" => Some(Self::Mjpeg),
            b"H264" => Some(Self::H264),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    /// The V4L2-style fourcc for this format.
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Self::Yuyv => *b"YUYV",
            Self::Uyvy => *b"UYVY",
            Self::Rgb24 => *b"RGB3",
            Self::Bgr24 => *b"BGR3",
            Self::Jpeg => *b"JPEG",
            Self::Mjpeg => *b"MJPG",
            Self::H264 => *b"H264",
            Self::Grey => *b"GREY",
        }
    }

    /// Parses a CLI format name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "yuyv" => Some(Self::Yuyv),
            "uyvy" => Some(Self::Uyvy),
            "rgb24" => Some(Self::Rgb24),
            "bgr24" => Some(Self::Bgr24),
            "jpeg" => Some(Self::Jpeg),
            "mjpeg" => Some(Self::Mjpeg),
            "h264" => Some(Self::H264),
            "grey" => Some(Self::Grey),
            _ => None,
        }
    }

    /// True for entropy-coded formats that carry no fixed per-pixel size.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Mjpeg | Self::H264)
    }

    /// Bytes per pixel for packed raw formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Yuyv | Self::Uyvy => Some(2),
            Self::Rgb24 | Self::Bgr24 => Some(3),
            Self::Grey => Some(1),
            Self::Jpeg | Self::Mjpeg | Self::H264 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Yuyv => "YUYV",
            Self::Uyvy => "UYVY",
            Self::Rgb24 => "RGB24",
            Self::Bgr24 => "BGR24",
            Self::Jpeg => "JPEG",
            Self::Mjpeg => "MJPEG",
            Self::H264 => "H264",
            Self::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

/// Frame geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parses `WxH`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got {:?}", s))?;
        let width: u32 = w.parse().map_err(|_| format!("bad width in {:?}", s))?;
        let height: u32 = h.parse().map_err(|_| format!("bad height in {:?}", s))?;
        if width == 0 || height == 0 {
            return Err(format!("resolution must be non-zero, got {:?}", s));
        }
        Ok(Self { width, height })
    }
}
