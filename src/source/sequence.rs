//! Playback source backed by a list of still images shown at a fixed rate.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Playback, PlaybackState};
use crate::error::SourceError;

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageSequence {
    paths: Vec<PathBuf>,
    dimensions: (u32, u32),
    frame_interval: Duration,
    looping: bool,
    /// Playback position accumulated up to the last pause
    position: Duration,
    playing_since: Option<Instant>,
    cached: Option<(usize, RgbImage)>,
}

impl ImageSequence {
    /// Open a clip from explicit frame paths, presented at `fps`.
    /// The clip starts paused at its first frame.
    pub fn open(paths: Vec<PathBuf>, fps: f64) -> Result<Self> {
        if paths.is_empty() {
            bail!("Image sequence has no frames");
        }
        if !fps.is_finite() || fps <= 0.0 {
            bail!("Invalid frame rate: {}", fps);
        }
        // The playback clock divides by the interval, so it must be non-zero
        let frame_interval = match Duration::try_from_secs_f64(1.0 / fps) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => bail!("Frame rate out of range: {}", fps),
        };
        let dimensions = image::image_dimensions(&paths[0])
            .with_context(|| format!("Failed to read {}", paths[0].display()))?;

        Ok(Self {
            paths,
            dimensions,
            frame_interval,
            looping: false,
            position: Duration::ZERO,
            playing_since: None,
            cached: None,
        })
    }

    /// Open every jpg/png in `dir`, in file name order
    pub fn from_dir(dir: &Path, fps: f64) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        debug!(dir = %dir.display(), frames = paths.len(), "loaded image sequence");
        Self::open(paths, fps)
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    fn position(&self) -> Duration {
        match self.playing_since {
            Some(since) => self.position + since.elapsed(),
            None => self.position,
        }
    }

    /// Index of the presented frame, before wrapping
    fn raw_index(&self) -> usize {
        (self.position().as_nanos() / self.frame_interval.as_nanos()) as usize
    }

    fn frame_index(&self) -> usize {
        let raw = self.raw_index();
        if self.looping {
            raw % self.paths.len()
        } else {
            raw.min(self.paths.len() - 1)
        }
    }
}

impl Playback for ImageSequence {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn state(&self) -> PlaybackState {
        if !self.looping && self.raw_index() >= self.paths.len() {
            PlaybackState::Ended
        } else if self.playing_since.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Paused
        }
    }

    fn play(&mut self) {
        if self.state() == PlaybackState::Ended {
            // Playing a finished clip starts it over
            self.position = Duration::ZERO;
            self.playing_since = None;
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.position = self.position();
        self.playing_since = None;
    }

    fn until_next_frame(&self) -> Option<Duration> {
        if self.state() != PlaybackState::Playing {
            return None;
        }
        let interval = self.frame_interval.as_nanos();
        let into_frame = self.position().as_nanos() % interval;
        Some(Duration::from_nanos((interval - into_frame) as u64))
    }

    fn current_frame(&mut self) -> Result<RgbImage, SourceError> {
        let index = self.frame_index();
        if let Some((cached_index, frame)) = &self.cached {
            if *cached_index == index {
                return Ok(frame.clone());
            }
        }
        let path = &self.paths[index];
        let frame = image::open(path)
            .map_err(|e| SourceError::Capture(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        self.cached = Some((index, frame.clone()));
        Ok(frame)
    }
}
