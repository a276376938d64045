//! Frame sources.
//!
//! A source is either a playback clip, which has its own clock and presents
//! decoded frames at a fixed cadence, or a live capture, which can be
//! sampled at any moment. The streamer arms a [`CaptureTrigger`] from the
//! source so both kinds are driven the same way.

pub mod pattern;
#[cfg(feature = "screen-capture")]
pub mod screen;
pub mod sequence;

use image::RgbImage;
use std::time::Duration;

use crate::error::SourceError;

pub use pattern::TestPattern;
#[cfg(feature = "screen-capture")]
pub use screen::ScreenCapture;
pub use sequence::ImageSequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Ended,
}

/// A clip with its own playback clock
pub trait Playback: Send {
    /// Natural size of the clip's frames
    fn dimensions(&self) -> (u32, u32);
    fn state(&self) -> PlaybackState;
    fn play(&mut self);
    fn pause(&mut self);
    /// Time until the next decoded frame is presented. `None` while the clip
    /// is paused or has ended.
    fn until_next_frame(&self) -> Option<Duration>;
    /// The frame currently presented
    fn current_frame(&mut self) -> Result<RgbImage, SourceError>;
}

/// A continuously running capture that can be sampled on demand
pub trait LiveCapture: Send {
    fn dimensions(&self) -> (u32, u32);
    fn grab(&mut self) -> Result<RgbImage, SourceError>;
}

/// When a capture should happen once the receiver has asked for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTrigger {
    /// Wait for the clip to present its next frame
    NextFrame(Duration),
    /// Free-running source: capture right away
    Immediate,
}

pub enum FrameSource {
    Playback(Box<dyn Playback>),
    LiveCapture(Box<dyn LiveCapture>),
}

impl FrameSource {
    pub fn playback(source: impl Playback + 'static) -> Self {
        FrameSource::Playback(Box::new(source))
    }

    pub fn live(source: impl LiveCapture + 'static) -> Self {
        FrameSource::LiveCapture(Box::new(source))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FrameSource::Playback(_) => "playback",
            FrameSource::LiveCapture(_) => "live",
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            FrameSource::Playback(p) => p.dimensions(),
            FrameSource::LiveCapture(c) => c.dimensions(),
        }
    }

    /// Whether a frame can be captured at all right now
    pub fn check_ready(&self) -> Result<(), SourceError> {
        if let FrameSource::Playback(p) = self {
            match p.state() {
                PlaybackState::Paused => return Err(SourceError::Paused),
                PlaybackState::Ended => return Err(SourceError::Ended),
                PlaybackState::Playing => {}
            }
        }
        let (w, h) = self.dimensions();
        if w == 0 || h == 0 {
            return Err(SourceError::NoDimensions);
        }
        Ok(())
    }

    pub fn trigger(&self) -> Result<CaptureTrigger, SourceError> {
        self.check_ready()?;
        match self {
            FrameSource::Playback(p) => p
                .until_next_frame()
                .map(CaptureTrigger::NextFrame)
                .ok_or(SourceError::Paused),
            FrameSource::LiveCapture(_) => Ok(CaptureTrigger::Immediate),
        }
    }

    pub fn capture(&mut self) -> Result<RgbImage, SourceError> {
        self.check_ready()?;
        match self {
            FrameSource::Playback(p) => p.current_frame(),
            FrameSource::LiveCapture(c) => c.grab(),
        }
    }

    /// Start or resume playback. Live sources are always running.
    pub fn resume(&mut self) {
        if let FrameSource::Playback(p) = self {
            if p.state() == PlaybackState::Paused {
                p.play();
            }
        }
    }

    pub fn pause(&mut self) {
        if let FrameSource::Playback(p) = self {
            p.pause();
        }
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "FrameSource::{}({}x{})", self.kind(), w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_clip(dir: &TempDir, frames: usize) -> Vec<std::path::PathBuf> {
        (0..frames)
            .map(|i| {
                let path = dir.path().join(format!("{:03}.png", i));
                RgbImage::from_pixel(64, 48, image::Rgb([i as u8, 0, 0]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_live_source_triggers_immediately() {
        let source = FrameSource::live(TestPattern::new(320, 240));
        assert_eq!(source.kind(), "live");
        assert_eq!(source.trigger().unwrap(), CaptureTrigger::Immediate);
    }

    #[test]
    fn test_zero_sized_source_not_ready() {
        let source = FrameSource::live(TestPattern::new(0, 240));
        assert_eq!(source.check_ready(), Err(SourceError::NoDimensions));
    }

    #[tokio::test]
    async fn test_paused_playback_not_ready() {
        let dir = TempDir::new().unwrap();
        let clip = ImageSequence::open(write_clip(&dir, 2), 10.0).unwrap();
        let mut source = FrameSource::playback(clip);

        // Clips start paused
        assert_eq!(source.trigger(), Err(SourceError::Paused));
        assert!(source.capture().is_err());

        source.resume();
        assert!(matches!(source.trigger(), Ok(CaptureTrigger::NextFrame(_))));
        assert_eq!(source.capture().unwrap().dimensions(), (64, 48));

        source.pause();
        assert_eq!(source.check_ready(), Err(SourceError::Paused));
    }
}
