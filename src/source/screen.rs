//! Live capture of the primary display.
//!
//! scrap's `Capturer` is not `Send` on X11, so it lives on a dedicated
//! thread that keeps the most recent frame; `grab` just takes a copy.

use anyhow::{anyhow, Result};
use image::RgbImage;
use scrap::{Capturer, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::LiveCapture;
use crate::error::SourceError;

/// How often the capture thread polls the display
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ScreenCapture {
    width: u32,
    height: u32,
    latest: Arc<Mutex<Option<RgbImage>>>,
    running: Arc<AtomicBool>,
}

impl ScreenCapture {
    pub fn start() -> Result<Self> {
        // Verify a display exists before spawning the thread
        let display = Display::primary().map_err(|e| anyhow!("No display found: {}", e))?;
        let width = display.width() as u32;
        let height = display.height() as u32;
        drop(display);

        let running = Arc::new(AtomicBool::new(true));
        let latest = Arc::new(Mutex::new(None));

        let running_thread = running.clone();
        let latest_thread = latest.clone();
        std::thread::spawn(move || {
            let display = match Display::primary() {
                Ok(d) => d,
                Err(e) => {
                    warn!("Screen capture: no display: {}", e);
                    return;
                }
            };
            let (w, h) = (display.width(), display.height());
            let capturer = match Capturer::new(display) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Screen capture: failed to start: {}", e);
                    return;
                }
            };
            capture_loop(capturer, w, h, latest_thread, running_thread);
        });

        debug!(width, height, "screen capture started");
        Ok(Self {
            width,
            height,
            latest,
            running,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LiveCapture for ScreenCapture {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> Result<RgbImage, SourceError> {
        let latest = self
            .latest
            .lock()
            .map_err(|_| SourceError::Capture("capture thread panicked".to_string()))?;
        latest
            .clone()
            .ok_or_else(|| SourceError::Capture("no frame captured yet".to_string()))
    }
}

fn capture_loop(
    mut capturer: Capturer,
    width: usize,
    height: usize,
    latest: Arc<Mutex<Option<RgbImage>>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match capturer.frame() {
            Ok(frame) => {
                // scrap hands out BGRA rows, possibly padded
                let stride = frame.len() / height;
                let image = bgra_to_rgb(&frame, width, height, stride);
                if let Ok(mut slot) = latest.lock() {
                    *slot = image;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("Screen capture error: {}", e);
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize, stride: usize) -> Option<RgbImage> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let offset = y * stride + x * 4;
            match bgra.get(offset..offset + 3) {
                Some(px) => rgb.extend_from_slice(&[px[2], px[1], px[0]]),
                None => rgb.extend_from_slice(&[0, 0, 0]),
            }
        }
    }
    RgbImage::from_raw(width as u32, height as u32, rgb)
}
