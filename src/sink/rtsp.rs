//! GStreamer RTSP publisher: appsrc → H.264 → rtspclientsink

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::{FormatSpec, Frame, PixelFormat};
use crate::sink::network::{Transport, TransportError};
use crate::NetworkConfig;

/// Pushes captured frames to an RTSP server (for example mediamtx)
pub struct RtspTransport {
    location: String,
    bitrate_kbps: u32,
    pipeline: Option<(gst::Pipeline, gst_app::AppSrc)>,
}

impl RtspTransport {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            location: config.location.clone(),
            bitrate_kbps: config.bitrate_kbps,
            pipeline: None,
        }
    }

    /// Build the encode/publish pipeline string for `format`
    fn build_pipeline_string(&self, format: &FormatSpec) -> String {
        let decode = match format.pixel_format {
            PixelFormat::Mjpeg => "jpegdec ! ",
            _ => "",
        };
        format!(
            "appsrc name=src is-live=true format=time do-timestamp=true ! \
             {}videoconvert ! \
             video/x-raw,format=I420 ! \
             x264enc tune=zerolatency speed-preset=ultrafast bitrate={} key-int-max={} ! \
             h264parse ! \
             rtspclientsink location={}",
            decode,
            self.bitrate_kbps,
            format.fps.max(1),
            self.location
        )
    }

    fn caps(format: &FormatSpec) -> Result<gst::Caps, TransportError> {
        let fps = gst::Fraction::new(format.fps as i32, 1);
        let video_format = match format.pixel_format {
            PixelFormat::Mjpeg => {
                return Ok(gst::Caps::builder("image/jpeg")
                    .field("width", format.width as i32)
                    .field("height", format.height as i32)
                    .field("framerate", fps)
                    .build())
            }
            PixelFormat::Yuyv => gst_video::VideoFormat::Yuy2,
            PixelFormat::Rgb24 => gst_video::VideoFormat::Rgb,
            PixelFormat::Bgr24 => gst_video::VideoFormat::Bgr,
            PixelFormat::Nv12 => gst_video::VideoFormat::Nv12,
        };
        gst_video::VideoInfo::builder(video_format, format.width, format.height)
            .fps(fps)
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|e| TransportError(format!("caps for {format}: {e}")))
    }

    /// First error posted on the bus since the last check
    fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
        let bus = pipeline.bus()?;
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Some(format!(
                        "{} ({:?})",
                        err.error(),
                        err.src().map(|s| s.path_string())
                    ));
                }
                gst::MessageView::Warning(w) => {
                    warn!(
                        "Warning from {:?}: {} ({:?})",
                        w.src().map(|s| s.path_string()),
                        w.error(),
                        w.debug()
                    );
                }
                _ => {}
            }
        }
        None
    }
}

impl Transport for RtspTransport {
    fn start(&mut self, format: &FormatSpec) -> Result<(), TransportError> {
        gst::init().map_err(|e| TransportError(format!("Failed to initialize GStreamer: {e}")))?;

        let pipeline_str = self.build_pipeline_string(format);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| TransportError(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| TransportError("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| TransportError("Failed to find appsrc".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| TransportError("Failed to cast to AppSrc".into()))?;

        appsrc.set_caps(Some(&Self::caps(format)?));
        appsrc.set_property("block", false);
        // A few frames of slack; the fanout queue handles real backpressure
        appsrc.set_max_bytes(format.width as u64 * format.height as u64 * 3 * 4);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| TransportError(format!("Failed to start pipeline: {e:?}")))?;

        self.pipeline = Some((pipeline, appsrc));
        Ok(())
    }

    fn submit(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let (pipeline, appsrc) = self
            .pipeline
            .as_ref()
            .ok_or_else(|| TransportError("stream not started".into()))?;

        if let Some(err) = Self::bus_error(pipeline) {
            return Err(TransportError(err));
        }

        // Zero-copy: the buffer keeps the frame bytes alive
        let buffer = gst::Buffer::from_slice(frame.data.clone());
        appsrc
            .push_buffer(buffer)
            .map_err(|flow| TransportError(format!("appsrc refused buffer: {flow:?}")))?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((pipeline, appsrc)) = self.pipeline.take() {
            let _ = appsrc.end_of_stream();
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
            debug!("RTSP pipeline stopped");
        }
    }
}

impl Drop for RtspTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
