//! CPU JPEG encoder.
//!
//! Converts packed raw formats to RGB and compresses with the `image`
//! crate. The output is deterministic for identical input, which the
//! coordinator's deduplication relies on. Compressed JPEG input passes
//! through untouched after a marker check.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::EncodeError;
use crate::video::{is_valid_jpeg, Frame, PixelFormat};

use super::Encoder;

pub struct CpuEncoder {
    quality: u8,
    /// RGB conversion scratch, reused across frames.
    scratch: Vec<u8>,
}

impl CpuEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            scratch: Vec::new(),
        }
    }

    fn encode_rgb_scratch(
        &mut self,
        out: &mut Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<(), EncodeError> {
        let mut encoder = JpegEncoder::new_with_quality(&mut *out, self.quality);
        encoder
            .encode(&self.scratch, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| EncodeError::Codec(e.to_string()))
    }
}

impl Encoder for CpuEncoder {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn encode(&mut self, raw: &Frame, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.clear();
        let width = raw.width;
        let height = raw.height;
        if width == 0 || height == 0 {
            return Err(EncodeError::Geometry("zero-sized frame".into()));
        }

        match raw.format {
            PixelFormat::Jpeg | PixelFormat::Mjpeg => {
                if !is_valid_jpeg(raw.data()) {
                    return Err(EncodeError::Codec("broken JPEG payload".into()));
                }
                out.extend_from_slice(raw.data());
                Ok(())
            }

            PixelFormat::H264 => Err(EncodeError::UnsupportedFormat(raw.format)),

            PixelFormat::Grey => {
                let stride = effective_stride(raw, 1)?;
                pack_rows(&mut self.scratch, raw.data(), stride, width as usize, height as usize)?;
                let mut encoder = JpegEncoder::new_with_quality(&mut *out, self.quality);
                encoder
                    .encode(&self.scratch, width, height, ExtendedColorType::L8)
                    .map_err(|e| EncodeError::Codec(e.to_string()))
            }

            PixelFormat::Rgb24 => {
                let stride = effective_stride(raw, 3)?;
                pack_rows(&mut self.scratch, raw.data(), stride, width as usize * 3, height as usize)?;
                self.encode_rgb_scratch(out, width, height)
            }

            PixelFormat::Bgr24 => {
                let stride = effective_stride(raw, 3)?;
                pack_rows(&mut self.scratch, raw.data(), stride, width as usize * 3, height as usize)?;
                for px in self.scratch.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                self.encode_rgb_scratch(out, width, height)
            }

            PixelFormat::Yuyv => {
                let stride = effective_stride(raw, 2)?;
                yuv422_to_rgb(&mut self.scratch, raw.data(), stride, width, height, false)?;
                self.encode_rgb_scratch(out, width, height)
            }

            PixelFormat::Uyvy => {
                let stride = effective_stride(raw, 2)?;
                yuv422_to_rgb(&mut self.scratch, raw.data(), stride, width, height, true)?;
                self.encode_rgb_scratch(out, width, height)
            }
        }
    }
}

/// Bytes per row, defaulting to packed when the driver reported none.
fn effective_stride(raw: &Frame, bytes_per_pixel: usize) -> Result<usize, EncodeError> {
    let packed = raw.width as usize * bytes_per_pixel;
    let stride = if raw.stride == 0 {
        packed
    } else {
        raw.stride as usize
    };
    if stride < packed {
        return Err(EncodeError::Geometry(format!(
            "stride {} too small for width {}",
            stride, raw.width
        )));
    }
    if stride * raw.height as usize > raw.used() {
        return Err(EncodeError::Geometry(format!(
            "frame truncated: {} rows of {} bytes, {} available",
            raw.height,
            stride,
            raw.used()
        )));
    }
    Ok(stride)
}

/// Copies `height` rows of `row_bytes` out of a strided buffer.
fn pack_rows(
    dst: &mut Vec<u8>,
    src: &[u8],
    stride: usize,
    row_bytes: usize,
    height: usize,
) -> Result<(), EncodeError> {
    dst.clear();
    dst.reserve(row_bytes * height);
    for y in 0..height {
        dst.extend_from_slice(&src[y * stride..y * stride + row_bytes]);
    }
    Ok(())
}

/// Expands packed 4:2:2 YUV to RGB (BT.601).
fn yuv422_to_rgb(
    dst: &mut Vec<u8>,
    src: &[u8],
    stride: usize,
    width: u32,
    height: u32,
    uyvy: bool,
) -> Result<(), EncodeError> {
    dst.clear();
    dst.resize(width as usize * height as usize * 3, 0);

    for y in 0..height as usize {
        let row = &src[y * stride..y * stride + width as usize * 2];
        let out_row = &mut dst[y * width as usize * 3..(y + 1) * width as usize * 3];
        for pair in 0..(width as usize / 2) {
            let chunk = &row[pair * 4..pair * 4 + 4];
            let (y0, u, y1, v) = if uyvy {
                (chunk[1], chunk[0], chunk[3], chunk[2])
            } else {
                (chunk[0], chunk[1], chunk[2], chunk[3])
            };
            let left = yuv_to_rgb(y0, u, v);
            let right = yuv_to_rgb(y1, u, v);
            out_row[pair * 6..pair * 6 + 3].copy_from_slice(&left);
            out_row[pair * 6 + 3..pair * 6 + 6].copy_from_slice(&right);
        }
    }
    Ok(())
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |v: i32| v.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv_frame(width: u32, height: u32, seed: u8) -> Frame {
        let mut frame = Frame::new();
        frame.width = width;
        frame.height = height;
        frame.format = PixelFormat::Yuyv;
        frame.stride = width * 2;
        let data: Vec<u8> = (0..(width * height * 2) as usize)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        frame.write_from(&data);
        frame
    }

    #[test]
    fn test_yuyv_produces_jpeg() {
        let frame = yuyv_frame(64, 32, 0);
        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        encoder.encode(&frame, &mut out).unwrap();
        assert!(is_valid_jpeg(&out));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let frame = yuyv_frame(64, 32, 42);
        let mut encoder = CpuEncoder::new(80);
        let mut first = Vec::new();
        let mut second = Vec::new();
        encoder.encode(&frame, &mut first).unwrap();
        encoder.encode(&frame, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_quality_changes_output() {
        let frame = yuyv_frame(64, 32, 7);
        let mut low = CpuEncoder::new(20);
        let mut high = CpuEncoder::new(95);
        let mut a = Vec::new();
        let mut b = Vec::new();
        low.encode(&frame, &mut a).unwrap();
        high.encode(&frame, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_jpeg_passthrough() {
        let mut payload = vec![0xFF, 0xD8];
        payload.extend(vec![0u8; 200]);
        payload.extend([0xFF, 0xD9]);

        let mut frame = Frame::new();
        frame.width = 64;
        frame.height = 32;
        frame.format = PixelFormat::Mjpeg;
        frame.write_from(&payload);

        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        encoder.encode(&frame, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_broken_jpeg_rejected() {
        let mut frame = Frame::new();
        frame.width = 64;
        frame.height = 32;
        frame.format = PixelFormat::Mjpeg;
        frame.write_from(&vec![0u8; 300]);

        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        assert!(matches!(
            encoder.encode(&frame, &mut out),
            Err(EncodeError::Codec(_))
        ));
    }

    #[test]
    fn test_h264_unsupported() {
        let mut frame = Frame::new();
        frame.width = 64;
        frame.height = 32;
        frame.format = PixelFormat::H264;
        frame.write_from(&[0u8; 256]);

        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        assert!(matches!(
            encoder.encode(&frame, &mut out),
            Err(EncodeError::UnsupportedFormat(PixelFormat::H264))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut frame = yuyv_frame(64, 32, 0);
        frame.set_used(100);
        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        assert!(matches!(
            encoder.encode(&frame, &mut out),
            Err(EncodeError::Geometry(_))
        ));
    }

    #[test]
    fn test_grey_frame() {
        let mut frame = Frame::new();
        frame.width = 32;
        frame.height = 32;
        frame.format = PixelFormat::Grey;
        frame.stride = 32;
        frame.write_from(&vec![0x80u8; 32 * 32]);

        let mut encoder = CpuEncoder::new(80);
        let mut out = Vec::new();
        encoder.encode(&frame, &mut out).unwrap();
        assert!(is_valid_jpeg(&out));
    }
}
