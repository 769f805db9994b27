//! SDL2 preview window.
//! Owns the toolkit event loop and repaints from a [`DisplaySurface`] at its
//! own cadence, independent of the capture rate.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, Texture, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::display::{prepare_frame, PreviewOptions};
use crate::sink::{DisplaySurface, Overlay};
use crate::DisplayConfig;

/// Sleep between polls when no new frame arrived
const IDLE_WAIT: Duration = Duration::from_millis(5);

pub struct PreviewWindow {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    options: PreviewOptions,
}

impl PreviewWindow {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(&config.title, config.width, config.height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            options: PreviewOptions {
                flip_vertical: config.flip_vertical,
            },
        })
    }

    fn render_frame<'t>(
        canvas: &mut Canvas<Window>,
        texture_creator: &'t TextureCreator<WindowContext>,
        texture: &mut Option<(Texture<'t>, u32, u32)>,
        frame: &Frame,
        options: PreviewOptions,
        overlay: Option<&Overlay>,
    ) -> Result<()> {
        let (width, height) = (frame.meta.format.width, frame.meta.format.height);
        let detections = overlay.map(|o| o.detections()).unwrap_or_default();
        // Sized exactly for the texture, or an error
        let rgb_data = prepare_frame(frame, options, &detections)?;

        // Texture follows the frame size; recreated only when it changes
        if !matches!(texture, Some((_, w, h)) if *w == width && *h == height) {
            let created = texture_creator
                .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
                .map_err(|e| eyre!(e))?;
            *texture = Some((created, width, height));
        }
        let Some((texture, _, _)) = texture.as_mut() else {
            return Ok(());
        };

        texture
            .update(None, &rgb_data, (width * 3) as usize)
            .map_err(|e| eyre!(e))?;

        canvas.clear();
        canvas.copy(texture, None, None).map_err(|e| eyre!(e))?;
        canvas.present();
        Ok(())
    }

    /// Run until the window is closed or `stop` is cancelled.
    ///
    /// Space calls `on_toggle` to start or stop capture. Must be called on
    /// the thread that initialised SDL.
    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        mut surface: DisplaySurface,
        overlay: Option<Overlay>,
        stop: CancellationToken,
        mut on_toggle: impl FnMut(),
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let mut texture = None;
        let mut decode_failures = 0u64;

        'running: while !stop.is_cancelled() {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        keycode: Some(Keycode::Space),
                        repeat: false,
                        ..
                    } => on_toggle(),
                    _ => {}
                }
            }

            let Some(frame) = surface.take_new() else {
                std::thread::sleep(IDLE_WAIT);
                continue;
            };

            if let Err(e) = Self::render_frame(
                &mut self.canvas,
                &self.texture_creator,
                &mut texture,
                &frame,
                self.options,
                overlay.as_ref(),
            ) {
                decode_failures += 1;
                // One warning, then only debug output for a broken stream
                if decode_failures == 1 {
                    warn!(sequence = frame.sequence(), "Failed to render frame: {}", e);
                } else {
                    debug!(sequence = frame.sequence(), "Failed to render frame: {}", e);
                }
            }
        }

        stop.cancel();
        Ok(())
    }
}
