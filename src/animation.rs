//! Per-image animation state
//!
//! An [`Animation`] exists for every distinct image path shown on at least one
//! output. It owns the frame source, a scratch surface holding the current
//! frame at native resolution, and the timer that paces frame advancement.
//!
//! Until the animation has been traversed once its length is unknown, so every
//! frame is drawn from scratch. Once the cycle closes, each output grows its
//! buffer pool to one buffer per frame and keeps the scaled frames around.

use crate::buffer::Allocator;
use crate::decoder::{DecodeError, Decoder, FrameSource};
use crate::output::{Output, OutputId};
use crate::pixels::{Placement, composite, convert};
use crate::timer::{Timer, TimerError};
use mio::{Interest, Registry, Token};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tiny_skia::Pixmap;
use tracing::{debug, info, trace, warn};

/// Poll token of the first animation timer; lower tokens are fixed sources
pub const FIRST_ANIMATION_TOKEN: usize = 4;

/// Stable animation identifier, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnimationId(pub usize);

impl AnimationId {
    pub fn token(self) -> Token {
        Token(FIRST_ANIMATION_TOKEN + self.0)
    }

    pub fn from_token(token: Token) -> Option<Self> {
        token.0.checked_sub(FIRST_ANIMATION_TOKEN).map(AnimationId)
    }
}

impl fmt::Display for AnimationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Knowledge of the animation's length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// First traversal; `frames` counts the frames seen so far
    Discovering { frames: usize },
    /// Length known
    Steady { frames: usize },
}

impl Default for Cycle {
    fn default() -> Self {
        // Frame 0 is on screen from the start
        Cycle::Discovering { frames: 1 }
    }
}

impl Cycle {
    /// Record one render. Returns the frame count when it becomes known.
    pub fn observe(&mut self, advanced: bool, closed: bool) -> Option<usize> {
        let Cycle::Discovering { frames } = self else {
            return None;
        };
        if advanced {
            *frames += 1;
        }
        if closed {
            let frames = *frames;
            *self = Cycle::Steady { frames };
            return Some(frames);
        }
        None
    }

    /// Frame count once known
    pub fn frames(self) -> Option<usize> {
        match self {
            Cycle::Discovering { .. } => None,
            Cycle::Steady { frames } => Some(frames),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnimationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("Unable to register timer: {0}")]
    Register(#[source] std::io::Error),

    #[error("Image {0:?} has no pixels")]
    Empty(PathBuf),
}

pub struct Animation {
    id: AnimationId,
    path: PathBuf,
    source: Box<dyn FrameSource>,
    cycle: Cycle,
    /// Current frame at native size
    scratch: Pixmap,
    timer: Timer,
    /// Assigned outputs in assignment order
    outputs: Vec<OutputId>,
}

impl Animation {
    /// Open `path` and register the animation's timer
    pub fn create(
        id: AnimationId,
        path: &Path,
        decoder: &mut dyn Decoder,
        registry: &Registry,
    ) -> Result<Self, AnimationError> {
        let source = decoder.open(path)?;
        let (width, height) = source.size();
        let scratch = Pixmap::new(width, height).ok_or_else(|| AnimationError::Empty(path.to_path_buf()))?;

        let mut timer = Timer::new()?;
        registry
            .register(&mut timer, id.token(), Interest::READABLE)
            .map_err(AnimationError::Register)?;

        info!("Animation {} created for {:?} ({}x{})", id, path, width, height);
        Ok(Self {
            id,
            path: path.to_path_buf(),
            source,
            cycle: Cycle::default(),
            scratch,
            timer,
            outputs: Vec::new(),
        })
    }

    pub fn id(&self) -> AnimationId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn outputs(&self) -> &[OutputId] {
        &self.outputs
    }

    pub fn attach(&mut self, output: OutputId) {
        debug_assert!(!self.outputs.contains(&output));
        self.outputs.push(output);
    }

    pub fn detach(&mut self, output: OutputId) {
        self.outputs.retain(|o| *o != output);
    }

    pub fn detach_all(&mut self) -> Vec<OutputId> {
        std::mem::take(&mut self.outputs)
    }

    /// Render the current frame to the given outputs; returns the time until
    /// the next frame, or `None` for a still image.
    pub fn render(
        &mut self,
        now: Instant,
        outputs: &mut BTreeMap<OutputId, Output>,
        allocator: &mut dyn Allocator,
    ) -> Option<Duration> {
        let Self {
            id,
            path,
            source,
            cycle,
            scratch,
            outputs: members,
            ..
        } = self;

        let advanced = source.advance(now);
        if let Some(frames) = cycle.observe(advanced, source.cycle_closed()) {
            info!("Animation {} ({:?}) has {} frames", id, path, frames);
        }

        let index = source.frame_index();
        let steady = cycle.frames();
        let mut converted = false;

        for output_id in members.iter() {
            let Some(output) = outputs.get_mut(output_id) else {
                debug_assert!(false, "animation {} holds unknown output {:?}", id, output_id);
                continue;
            };
            let Some(config) = output.config.as_ref() else {
                continue;
            };
            let Some(geometry) = output.geometry() else {
                trace!("Output {} not configured yet", output.label());
                continue;
            };
            if !advanced && output.shown_frame == Some(index) {
                // Already on screen
                continue;
            }

            if let Some(frames) = steady {
                if output.cached_frames < frames {
                    if let Err(e) = output.pool.ensure_count(frames, geometry, allocator) {
                        if !output.growth_failed {
                            warn!(
                                "Unable to allocate {} frame buffers for {}: {}",
                                frames,
                                output.label(),
                                e
                            );
                            output.growth_failed = true;
                        }
                        continue;
                    }
                    output.growth_failed = false;
                }
            }

            let Some(buffer) = output.pool.acquire(steady.map(|_| index)) else {
                continue;
            };

            if steady.is_none() || buffer.frame() != Some(index) {
                if !converted {
                    let frame = source.frame();
                    let (width, height) = (scratch.width(), scratch.height());
                    if !convert(
                        frame.pixels,
                        frame.width,
                        frame.height,
                        frame.stride,
                        frame.channels,
                        scratch.data_mut(),
                        width,
                        height,
                    ) {
                        warn!("Unsupported pixel layout with {} channels in {:?}", frame.channels, path);
                    }
                    converted = true;
                }

                let placement = Placement::new(
                    config.scaling_mode,
                    config.anchor,
                    (scratch.width(), scratch.height()),
                    (geometry.width, geometry.height),
                    output.scale,
                );
                if let Some(mut target) = buffer.pixmap_mut() {
                    composite(scratch.as_ref(), &mut target, &placement, config.filter);
                }
                buffer.set_frame(Some(index));
                output.last_placement = Some(placement);
                if steady.is_some() {
                    output.cached_frames += 1;
                }
            }

            output.surface.present(buffer, output.scale, output.width, output.height);
            buffer.mark_submitted();
            output.shown_frame = Some(index);
        }

        source.delay(now)
    }

    /// Arm the timer; zero renders as soon as possible
    pub fn schedule(&self, delay: Duration) {
        if let Err(e) = self.timer.arm(delay) {
            warn!("Animation {}: {}", self.id, e);
        }
    }

    /// Consume the timer expiration
    pub fn drain_timer(&self) {
        self.timer.drain();
    }

    /// Remove the timer from the poll registry
    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.timer) {
            debug!("Unable to deregister timer of animation {}: {}", self.id, e);
        }
    }
}
