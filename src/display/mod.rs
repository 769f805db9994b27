//! Preview presentation for the display sink

#[cfg(feature = "sdl-window")]
pub mod window;

#[cfg(feature = "sdl-window")]
pub use window::PreviewWindow;

use crate::capture::decoder::{self, DecodeError};
use crate::capture::Frame;
use crate::sink::detection::{self, Detection};

/// Presentation options applied on the preview side only
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewOptions {
    pub flip_vertical: bool,
}

/// Turn `frame` into the RGB24 image the preview uploads.
///
/// The result is exactly `width * height * 3` bytes for the frame's
/// negotiated size. Shared frames stay untouched: flipping and overlay
/// drawing work on the decoded copy.
pub fn prepare_frame(frame: &Frame, options: PreviewOptions, detections: &[Detection]) -> Result<Vec<u8>, DecodeError> {
    let (width, height) = (frame.meta.format.width, frame.meta.format.height);
    let mut rgb = decoder::decode_frame(frame)?;
    decoder::check_rgb(&rgb, width, height)?;

    if options.flip_vertical {
        decoder::flip_vertical(&mut rgb, width, height);
    }
    detection::draw_boxes(&mut rgb, width, height, detections);
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FormatSpec, FrameMetadata, PixelFormat};
    use bytes::Bytes;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame::new(
            Bytes::from(data),
            FrameMetadata {
                sequence: 1,
                format: FormatSpec::new(PixelFormat::Rgb24, width, height, 30),
                stride: width * 3,
                missed_before: 0,
                device_timestamp: None,
            },
        )
    }

    #[test]
    fn flip_applies_to_the_copy_only() {
        let source = frame(vec![1, 1, 1, 2, 2, 2], 1, 2);
        let options = PreviewOptions { flip_vertical: true };

        let rgb = prepare_frame(&source, options, &[]).unwrap();
        assert_eq!(rgb, vec![2, 2, 2, 1, 1, 1]);
        assert_eq!(&source.data[..], &[1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn overlay_is_drawn_after_the_flip() {
        let source = frame(vec![0; 8 * 8 * 3], 8, 8);
        let boxes = [Detection {
            x: 0,
            y: 0,
            w: 8,
            h: 8,
            confidence: 0.9,
            label: "Box1".into(),
        }];

        let rgb = prepare_frame(&source, PreviewOptions { flip_vertical: true }, &boxes).unwrap();
        assert_eq!(&rgb[..3], &[0, 255, 0]);
        // Centre stays untouched
        let centre = (4 * 8 + 4) * 3;
        assert_eq!(&rgb[centre..centre + 3], &[0, 0, 0]);
    }

    #[test]
    fn short_frame_is_refused() {
        let short = frame(vec![9; 3], 2, 2);
        assert!(prepare_frame(&short, PreviewOptions::default(), &[]).is_err());
    }
}
