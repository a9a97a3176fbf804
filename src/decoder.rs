//! Image decoding and frame pacing
//!
//! A [`Decoder`] opens an image path into a [`FrameSource`]: a cursor over the
//! frames of the image that knows how long each one stays on screen. Animated
//! GIF, APNG and WebP files are decoded lazily, one frame ahead of the one
//! being shown; everything else is decoded once as a still image.

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, ImageFormat, ImageReader, RgbaImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Delays at or below this are treated as unspecified
const MIN_FRAME_DELAY: Duration = Duration::from_millis(10);
/// Delay used in place of an unspecified one
const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(100);

/// Borrowed view of the current frame's pixels
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes
    pub stride: usize,
    /// 3 for RGB, 4 for straight-alpha RGBA
    pub channels: u8,
}

/// Cursor over the frames of an opened image
pub trait FrameSource {
    /// Intrinsic size of the image
    fn size(&self) -> (u32, u32);

    /// Move to the next frame if the current one has been shown long enough.
    ///
    /// Moves at most one frame per call. Returns whether the frame changed.
    fn advance(&mut self, now: Instant) -> bool;

    fn frame(&self) -> Frame<'_>;

    /// Position of the current frame within the stream
    fn frame_index(&self) -> usize;

    /// Time until the current frame is due to be replaced, `None` for stills
    fn delay(&self, now: Instant) -> Option<Duration>;

    /// Whether the current frame is the last one of the stream
    fn cycle_closed(&self) -> bool;
}

/// Opens image files
pub trait Decoder {
    fn open(&mut self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError>;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Could not open image {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image {0:?} contains no frames")]
    Empty(PathBuf),
}

/// Decoder backed by the `image` crate
#[derive(Debug, Default)]
pub struct FileDecoder;

impl Decoder for FileDecoder {
    fn open(&mut self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let image_err = |source| DecodeError::Image {
            path: path.to_path_buf(),
            source,
        };

        let reader = ImageReader::open(path)
            .map_err(|source| DecodeError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .with_guessed_format()
            .map_err(|source| DecodeError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let kind = match reader.format() {
            Some(ImageFormat::Gif) => Some(AnimationKind::Gif),
            Some(ImageFormat::Png) => {
                let mut png = PngDecoder::new(open_buffered(path)?).map_err(image_err)?;
                png.is_apng().map_err(image_err)?.then_some(AnimationKind::Apng)
            }
            Some(ImageFormat::WebP) => {
                let webp = WebPDecoder::new(open_buffered(path)?).map_err(image_err)?;
                webp.has_animation().then_some(AnimationKind::WebP)
            }
            _ => None,
        };

        match kind {
            Some(kind) => {
                debug!("Decoding {:?} as {:?} animation", path, kind);
                Ok(Box::new(AnimatedSource::open(path, kind)?))
            }
            None => {
                let image = reader.decode().map_err(image_err)?;
                debug!("Decoded {:?} as a still image", path);
                Ok(Box::new(StillSource::new(image)))
            }
        }
    }
}

fn open_buffered(path: &Path) -> Result<BufReader<File>, DecodeError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| DecodeError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Stored frame delay, with unspecified delays replaced
fn frame_delay(frame: &image::Frame) -> Duration {
    let delay = Duration::from(frame.delay());
    if delay <= MIN_FRAME_DELAY {
        DEFAULT_FRAME_DELAY
    } else {
        delay
    }
}

/// A single decoded image
pub struct StillSource {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
}

impl StillSource {
    pub fn new(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        if image.color().has_alpha() {
            Self {
                pixels: image.into_rgba8().into_raw(),
                width,
                height,
                channels: 4,
            }
        } else {
            Self {
                pixels: image.into_rgb8().into_raw(),
                width,
                height,
                channels: 3,
            }
        }
    }
}

impl FrameSource for StillSource {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn advance(&mut self, _now: Instant) -> bool {
        false
    }

    fn frame(&self) -> Frame<'_> {
        Frame {
            pixels: &self.pixels,
            width: self.width,
            height: self.height,
            stride: self.width as usize * self.channels as usize,
            channels: self.channels,
        }
    }

    fn frame_index(&self) -> usize {
        0
    }

    fn delay(&self, _now: Instant) -> Option<Duration> {
        None
    }

    fn cycle_closed(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum AnimationKind {
    Gif,
    Apng,
    WebP,
}

impl AnimationKind {
    fn frames(self, path: &Path) -> Result<Frames<'static>, DecodeError> {
        let image_err = |source| DecodeError::Image {
            path: path.to_path_buf(),
            source,
        };
        let reader = open_buffered(path)?;

        Ok(match self {
            AnimationKind::Gif => GifDecoder::new(reader).map_err(image_err)?.into_frames(),
            AnimationKind::Apng => PngDecoder::new(reader)
                .and_then(|png| png.apng())
                .map_err(image_err)?
                .into_frames(),
            AnimationKind::WebP => WebPDecoder::new(reader).map_err(image_err)?.into_frames(),
        })
    }
}

/// Lazily decoded animation with one frame of lookahead
struct AnimatedSource {
    path: PathBuf,
    kind: AnimationKind,
    frames: Frames<'static>,
    current: RgbaImage,
    current_delay: Duration,
    index: usize,
    /// `None` once the stream is exhausted
    lookahead: Option<image::Frame>,
    shown_at: Instant,
}

impl AnimatedSource {
    fn open(path: &Path, kind: AnimationKind) -> Result<Self, DecodeError> {
        let mut frames = kind.frames(path)?;
        let first = match frames.next() {
            Some(Ok(frame)) => frame,
            Some(Err(source)) => {
                return Err(DecodeError::Image {
                    path: path.to_path_buf(),
                    source,
                });
            }
            None => return Err(DecodeError::Empty(path.to_path_buf())),
        };

        let mut source = Self {
            path: path.to_path_buf(),
            kind,
            frames,
            current_delay: frame_delay(&first),
            current: first.into_buffer(),
            index: 0,
            lookahead: None,
            shown_at: Instant::now(),
        };
        source.fetch();
        Ok(source)
    }

    /// Decode the frame after the current one
    fn fetch(&mut self) {
        self.lookahead = match self.frames.next() {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                warn!("Stopping decode of {:?} at frame {}: {}", self.path, self.index + 1, e);
                None
            }
            None => None,
        };
    }

    /// Only one frame was ever decoded
    fn single_frame(&self) -> bool {
        self.index == 0 && self.lookahead.is_none()
    }

    /// Start the stream over after its last frame
    fn rewind(&mut self) -> Option<image::Frame> {
        match self.kind.frames(&self.path) {
            Ok(frames) => {
                self.frames = frames;
                self.frames.next().and_then(Result::ok)
            }
            Err(e) => {
                error!("Unable to restart animation: {}", e);
                None
            }
        }
    }
}

impl FrameSource for AnimatedSource {
    fn size(&self) -> (u32, u32) {
        self.current.dimensions()
    }

    fn advance(&mut self, now: Instant) -> bool {
        let due = self.shown_at + self.current_delay;
        if now < due || self.single_frame() {
            return false;
        }

        let (next, index) = match self.lookahead.take() {
            Some(frame) => (frame, self.index + 1),
            None => match self.rewind() {
                Some(frame) => (frame, 0),
                None => {
                    // Hold the current frame for another full delay
                    self.shown_at = now;
                    return false;
                }
            },
        };

        let delay = frame_delay(&next);
        let buffer = next.into_buffer();
        if buffer.dimensions() != self.current.dimensions() {
            warn!(
                "Frame {} of {:?} is {:?}, expected {:?}",
                index,
                self.path,
                buffer.dimensions(),
                self.current.dimensions()
            );
        }

        self.current = buffer;
        self.current_delay = delay;
        self.index = index;
        // Keep pace with the wall clock unless more than a frame behind
        self.shown_at = if now.duration_since(due) > delay { now } else { due };
        self.fetch();
        true
    }

    fn frame(&self) -> Frame<'_> {
        let (width, height) = self.current.dimensions();
        Frame {
            pixels: self.current.as_raw(),
            width,
            height,
            stride: width as usize * 4,
            channels: 4,
        }
    }

    fn frame_index(&self) -> usize {
        self.index
    }

    fn delay(&self, now: Instant) -> Option<Duration> {
        if self.single_frame() {
            return None;
        }
        Some((self.shown_at + self.current_delay).saturating_duration_since(now))
    }

    fn cycle_closed(&self) -> bool {
        self.lookahead.is_none()
    }
}
