//! Decode captured frames to packed RGB24 for presentation

use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use thiserror::Error;

use super::frame::{Frame, PixelFormat};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("jpeg has unsupported pixel layout {0:?}")]
    JpegLayout(JpegPixelFormat),
    #[error("{0} frames cannot be presented")]
    Unsupported(PixelFormat),
    #[error("frame holds {actual} bytes, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("decoded {actual} bytes, a {width}x{height} RGB24 image needs {expected}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Decode `frame` to RGB24, `width * height * 3` bytes
pub fn decode_frame(frame: &Frame) -> Result<Vec<u8>, DecodeError> {
    let format = frame.meta.format;
    let (width, height) = (format.width as usize, format.height as usize);
    let data = &frame.data[..];

    match format.pixel_format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder.decode()?;
            let layout = decoder
                .info()
                .map(|info| info.pixel_format)
                .unwrap_or(JpegPixelFormat::RGB24);
            match layout {
                JpegPixelFormat::RGB24 => Ok(pixels),
                JpegPixelFormat::L8 => Ok(pixels.iter().flat_map(|&l| [l, l, l]).collect()),
                other => Err(DecodeError::JpegLayout(other)),
            }
        }
        PixelFormat::Yuyv => {
            let stride = row_stride(frame, width * 2);
            check_len(data, stride, width * 2, height)?;
            let mut rgb = Vec::with_capacity(width * height * 3);
            for row in data.chunks(stride).take(height) {
                for quad in row[..width * 2].chunks_exact(4) {
                    let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                    rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                    rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
                }
            }
            Ok(rgb)
        }
        PixelFormat::Rgb24 => {
            let stride = row_stride(frame, width * 3);
            check_len(data, stride, width * 3, height)?;
            if stride == width * 3 {
                return Ok(data[..width * height * 3].to_vec());
            }
            Ok(data
                .chunks(stride)
                .take(height)
                .flat_map(|row| row[..width * 3].iter().copied())
                .collect())
        }
        PixelFormat::Bgr24 => {
            let stride = row_stride(frame, width * 3);
            check_len(data, stride, width * 3, height)?;
            Ok(data
                .chunks(stride)
                .take(height)
                .flat_map(|row| row[..width * 3].chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]))
                .collect())
        }
        PixelFormat::Nv12 => Err(DecodeError::Unsupported(PixelFormat::Nv12)),
    }
}

/// Fail unless `rgb` is exactly one packed `width` x `height` RGB24 image
pub fn check_rgb(rgb: &[u8], width: u32, height: u32) -> Result<(), DecodeError> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(DecodeError::SizeMismatch {
            width,
            height,
            expected,
            actual: rgb.len(),
        });
    }
    Ok(())
}

/// Mirror a packed RGB24 image top to bottom, in place
pub fn flip_vertical(rgb: &mut [u8], width: u32, height: u32) {
    let row = width as usize * 3;
    let height = height as usize;
    if row == 0 || rgb.len() < row * height {
        return;
    }
    for top in 0..height / 2 {
        let bottom = height - 1 - top;
        let (upper, lower) = rgb.split_at_mut(bottom * row);
        upper[top * row..(top + 1) * row].swap_with_slice(&mut lower[..row]);
    }
}

/// Nearest-neighbour resize of a packed RGB24 image
pub fn resize_nearest(rgb: &[u8], width: u32, height: u32, to_width: u32, to_height: u32) -> Vec<u8> {
    let (sw, sh) = (width as usize, height as usize);
    let (dw, dh) = (to_width as usize, to_height as usize);
    let mut out = Vec::with_capacity(dw * dh * 3);
    if sw == 0 || sh == 0 {
        return out;
    }
    for y in 0..dh {
        let sy = y * sh / dh.max(1);
        for x in 0..dw {
            let sx = x * sw / dw.max(1);
            let at = (sy * sw + sx) * 3;
            out.extend_from_slice(&rgb[at..at + 3]);
        }
    }
    out
}

fn row_stride(frame: &Frame, packed: usize) -> usize {
    (frame.meta.stride as usize).max(packed)
}

fn check_len(data: &[u8], stride: usize, row: usize, height: usize) -> Result<(), DecodeError> {
    if height == 0 {
        return Ok(());
    }
    let expected = stride * (height - 1) + row;
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// BT.601 limited range, integer arithmetic
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FormatSpec, FrameMetadata};
    use bytes::Bytes;

    fn frame(format: FormatSpec, stride: u32, data: Vec<u8>) -> Frame {
        Frame::new(
            Bytes::from(data),
            FrameMetadata {
                sequence: 1,
                format,
                stride,
                missed_before: 0,
                device_timestamp: None,
            },
        )
    }

    #[test]
    fn yuyv_white_and_black() {
        let format = FormatSpec::new(PixelFormat::Yuyv, 2, 2, 30);
        let data = vec![235, 128, 235, 128, 16, 128, 16, 128];
        let rgb = decode_frame(&frame(format, 4, data)).unwrap();
        assert_eq!(rgb, vec![255, 255, 255, 255, 255, 255, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn padded_rows_are_skipped() {
        let format = FormatSpec::new(PixelFormat::Rgb24, 1, 2, 30);
        let data = vec![1, 2, 3, 0xAA, 4, 5, 6, 0xAA];
        let rgb = decode_frame(&frame(format, 4, data)).unwrap();
        assert_eq!(rgb, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn bgr_is_swizzled() {
        let format = FormatSpec::new(PixelFormat::Bgr24, 2, 1, 30);
        let rgb = decode_frame(&frame(format, 6, vec![1, 2, 3, 4, 5, 6])).unwrap();
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn short_buffer_is_truncated() {
        let format = FormatSpec::new(PixelFormat::Yuyv, 4, 4, 30);
        let err = decode_frame(&frame(format, 8, vec![0; 10])).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { expected: 32, actual: 10 }));
    }

    #[test]
    fn rgb_size_is_checked_against_the_format() {
        assert!(check_rgb(&[0; 12], 2, 2).is_ok());
        assert!(matches!(
            check_rgb(&[0; 48], 2, 2),
            Err(DecodeError::SizeMismatch { expected: 12, actual: 48, .. })
        ));
    }

    #[test]
    fn flips_rows() {
        let mut rgb = vec![1, 1, 1, 2, 2, 2, 3, 3, 3];
        flip_vertical(&mut rgb, 1, 3);
        assert_eq!(rgb, vec![3, 3, 3, 2, 2, 2, 1, 1, 1]);

        let mut even = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        flip_vertical(&mut even, 2, 2);
        assert_eq!(even, vec![7, 8, 9, 10, 11, 12, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn halves_by_nearest_neighbour() {
        // 4x2, each pixel's red channel is its column
        let rgb: Vec<u8> = (0..2).flat_map(|_| (0..4u8).flat_map(|x| [x, 0, 0])).collect();
        let small = resize_nearest(&rgb, 4, 2, 2, 1);
        assert_eq!(small, vec![0, 0, 0, 2, 0, 0]);
    }

    #[test]
    fn garbage_jpeg_fails() {
        let format = FormatSpec::new(PixelFormat::Mjpeg, 4, 4, 30);
        assert!(matches!(
            decode_frame(&frame(format, 0, vec![0xFF, 0xD8, 0xFF, 0xD9])),
            Err(DecodeError::Jpeg(_))
        ));
    }
}
