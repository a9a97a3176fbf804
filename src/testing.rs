//! Headless collaborators for unit tests

use crate::buffer::{Allocator, Buffer, BufferError, BufferGeometry, BufferState, SharedState};
use crate::decoder::{DecodeError, Decoder, Frame, FrameSource};
use crate::output::Surface;
use memmap2::MmapMut;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Allocates buffers from anonymous memory, optionally failing on purpose
#[derive(Default)]
pub struct AnonAllocator {
    allocated: usize,
    fail_at: Option<usize>,
    /// Buffer size refused while set, shared with the test
    refused_size: Rc<Cell<Option<usize>>>,
    last_state: Option<SharedState>,
}

impl AnonAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the allocation made when `allocated()` equals `index`
    pub fn fail_at(&mut self, index: usize) {
        self.fail_at = Some(index);
    }

    /// Number of successful allocations
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Handle that makes every allocation of a given size fail while set
    pub fn refusals(&self) -> Rc<Cell<Option<usize>>> {
        self.refused_size.clone()
    }

    pub fn last_state(&self) -> Option<SharedState> {
        self.last_state.clone()
    }
}

impl Allocator for AnonAllocator {
    fn allocate(&mut self, geometry: BufferGeometry) -> Result<Buffer, BufferError> {
        if self.fail_at == Some(self.allocated) {
            self.fail_at = None;
            return Err(BufferError::Refused);
        }
        if self.refused_size.get() == Some(geometry.size) {
            return Err(BufferError::Refused);
        }

        let memory = MmapMut::map_anon(geometry.size).map_err(BufferError::Map)?;
        let state = SharedState::default();
        self.allocated += 1;
        self.last_state = Some(state.clone());
        Ok(Buffer::new(memory, geometry, None, state))
    }
}

/// What a [`RecordingSurface`] was asked to show
#[derive(Debug, Clone, PartialEq)]
pub struct Presented {
    pub frame: Option<usize>,
    pub scale: i32,
    pub width: u32,
    pub height: u32,
    /// First pixel of the buffer, as stored
    pub pixel: [u8; 4],
}

pub type PresentLog = Rc<RefCell<Vec<Presented>>>;

/// Surface that records every presented buffer.
///
/// Like a compositor, it releases the previous buffer when a new one is shown.
pub struct RecordingSurface {
    log: PresentLog,
    shown: Option<SharedState>,
}

impl RecordingSurface {
    pub fn new() -> (Self, PresentLog) {
        let log = PresentLog::default();
        let surface = Self {
            log: log.clone(),
            shown: None,
        };
        (surface, log)
    }
}

impl Surface for RecordingSurface {
    fn present(&mut self, buffer: &Buffer, scale: i32, width: u32, height: u32) {
        if let Some(previous) = self.shown.replace(buffer.shared_state()) {
            previous.set(BufferState::Free);
        }

        let data = buffer.data();
        self.log.borrow_mut().push(Presented {
            frame: buffer.frame(),
            scale,
            width,
            height,
            pixel: [data[0], data[1], data[2], data[3]],
        });
    }
}

/// Looping animation whose frame `i` is filled with red level `i`.
///
/// Advances on every call after the first, ignoring the clock, unless held.
pub struct ScriptedSource {
    frames: usize,
    index: usize,
    started: bool,
    hold: Rc<Cell<bool>>,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ScriptedSource {
    pub fn new(frames: usize, width: u32, height: u32, hold: Rc<Cell<bool>>) -> Self {
        let mut source = Self {
            frames,
            index: 0,
            started: false,
            hold,
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        };
        source.fill();
        source
    }

    fn fill(&mut self) {
        let red = self.index as u8;
        for pixel in self.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&[red, 0, 0, 255]);
        }
    }
}

impl FrameSource for ScriptedSource {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn advance(&mut self, _now: Instant) -> bool {
        if !self.started {
            self.started = true;
            return false;
        }
        if self.frames < 2 || self.hold.get() {
            return false;
        }
        self.index = (self.index + 1) % self.frames;
        self.fill();
        true
    }

    fn frame(&self) -> Frame<'_> {
        Frame {
            pixels: &self.pixels,
            width: self.width,
            height: self.height,
            stride: self.width as usize * 4,
            channels: 4,
        }
    }

    fn frame_index(&self) -> usize {
        self.index
    }

    fn delay(&self, _now: Instant) -> Option<Duration> {
        (self.frames > 1).then_some(Duration::from_millis(100))
    }

    fn cycle_closed(&self) -> bool {
        self.index + 1 >= self.frames
    }
}

/// Decoder handing out [`ScriptedSource`]s
pub struct ScriptedDecoder {
    frames: usize,
    size: (u32, u32),
    failing: Vec<PathBuf>,
    opened: Rc<RefCell<Vec<PathBuf>>>,
    hold: Rc<Cell<bool>>,
}

impl ScriptedDecoder {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            size: (16, 16),
            failing: Vec::new(),
            opened: Rc::default(),
            hold: Rc::default(),
        }
    }

    /// Make opening `path` fail
    pub fn failing(mut self, path: &str) -> Self {
        self.failing.push(PathBuf::from(path));
        self
    }

    /// While set, sources render without advancing, as on a forced render
    pub fn hold(&self) -> Rc<Cell<bool>> {
        self.hold.clone()
    }

    /// Paths opened so far, in order
    pub fn opened(&self) -> Rc<RefCell<Vec<PathBuf>>> {
        self.opened.clone()
    }
}

impl Decoder for ScriptedDecoder {
    fn open(&mut self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        if self.failing.iter().any(|p| p == path) {
            return Err(DecodeError::Empty(path.to_path_buf()));
        }
        self.opened.borrow_mut().push(path.to_path_buf());
        Ok(Box::new(ScriptedSource::new(
            self.frames,
            self.size.0,
            self.size.1,
            self.hold.clone(),
        )))
    }
}
