//! Outputs (monitors) and their wallpaper surfaces

use crate::animation::AnimationId;
use crate::buffer::{Buffer, BufferGeometry, BufferPool};
use crate::config::OutputConfig;
use crate::pixels::Placement;
use std::fmt;

/// Identifier of an output: its `wl_output` registry name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output {}", self.0)
    }
}

/// Which animation, if any, is drawing to an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    #[default]
    Idle,
    Assigned(AnimationId),
}

/// Where rendered buffers are shown
pub trait Surface {
    /// Attach `buffer`, damage the whole surface and commit
    fn present(&mut self, buffer: &Buffer, scale: i32, width: u32, height: u32);
}

pub struct Output {
    pub id: OutputId,
    /// Connector name, e.g. `DP-1`, once announced
    pub name: Option<String>,
    /// Logical size from the last layer surface configure
    pub width: u32,
    pub height: u32,
    pub scale: i32,
    pub configured: bool,
    pub assignment: Assignment,
    /// Configuration resolved at the last reconciliation
    pub config: Option<OutputConfig>,
    pub pool: BufferPool,
    /// Frames drawn into the pool since the assignment last changed
    pub cached_frames: usize,
    /// A pool growth failure has already been reported
    pub growth_failed: bool,
    /// Frame on screen, while the pool still holds it
    pub shown_frame: Option<usize>,
    pub surface: Box<dyn Surface>,
    pub last_placement: Option<Placement>,
}

impl Output {
    pub fn new(id: OutputId, surface: Box<dyn Surface>) -> Self {
        Self {
            id,
            name: None,
            width: 0,
            height: 0,
            scale: 1,
            configured: false,
            assignment: Assignment::Idle,
            config: None,
            pool: BufferPool::new(),
            cached_frames: 0,
            growth_failed: false,
            shown_frame: None,
            surface,
            last_placement: None,
        }
    }

    /// Name for log messages
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    /// Buffer geometry, once the surface has a usable size
    pub fn geometry(&self) -> Option<BufferGeometry> {
        if !self.configured {
            return None;
        }
        BufferGeometry::for_output(self.width, self.height, self.scale).ok()
    }

    /// Record a new size; returns whether it changed
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        let changed = !self.configured || self.width != width || self.height != height;
        self.width = width;
        self.height = height;
        self.configured = true;
        changed
    }

    /// Drop every buffer, they no longer match the output's geometry
    pub fn reset_buffers(&mut self) {
        self.pool.clear();
        self.cached_frames = 0;
        self.growth_failed = false;
        self.shown_frame = None;
    }

    /// Forget cached frames when the assignment changes
    pub fn invalidate(&mut self) {
        self.pool.invalidate();
        self.cached_frames = 0;
        self.growth_failed = false;
        self.shown_frame = None;
    }
}
