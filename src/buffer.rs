//! Per-output ring of shared-memory buffers
//!
//! Each output owns a [`BufferPool`]. Buffers are handed to the compositor on
//! submission and come back through `wl_buffer.release`, which flips their
//! shared [`BufferState`] back to `Free`. The pool grows on demand and never
//! shrinks until it is cleared.

use crate::pixels::format_stride;
use memmap2::MmapMut;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tiny_skia::PixmapMut;
use tracing::{debug, warn};
use wayland_client::protocol::wl_buffer::WlBuffer;

/// Pixel geometry of the buffers of one output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Width in buffer pixels (logical width times scale)
    pub width: u32,
    /// Height in buffer pixels (logical height times scale)
    pub height: u32,
    pub stride: usize,
    pub size: usize,
}

impl BufferGeometry {
    /// Geometry for an output of `width`x`height` logical pixels at `scale`
    pub fn for_output(width: u32, height: u32, scale: i32) -> Result<Self, BufferError> {
        let scale = u32::try_from(scale).unwrap_or(0);
        let pixel_width = width.saturating_mul(scale);
        let pixel_height = height.saturating_mul(scale);
        let stride = format_stride(pixel_width);
        let size = stride.saturating_mul(pixel_height as usize);

        if size < 1 {
            return Err(BufferError::Degenerate { width, height, scale });
        }

        Ok(Self {
            width: pixel_width,
            height: pixel_height,
            stride,
            size,
        })
    }
}

/// Ownership of a buffer between the daemon and the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    /// Attached and committed, waiting for `wl_buffer.release`
    Submitted,
}

/// Buffer state shared with the release handler
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<AtomicBool>);

impl SharedState {
    pub fn get(&self) -> BufferState {
        if self.0.load(Ordering::Acquire) {
            BufferState::Submitted
        } else {
            BufferState::Free
        }
    }

    pub fn set(&self, state: BufferState) {
        self.0.store(state == BufferState::Submitted, Ordering::Release);
    }
}

/// One drawable buffer: a memory mapping plus the compositor's handle to it
pub struct Buffer {
    memory: MmapMut,
    geometry: BufferGeometry,
    handle: Option<WlBuffer>,
    state: SharedState,
    /// Decoder frame index currently drawn into this buffer
    frame: Option<usize>,
}

impl Buffer {
    pub fn new(
        memory: MmapMut,
        geometry: BufferGeometry,
        handle: Option<WlBuffer>,
        state: SharedState,
    ) -> Self {
        Self {
            memory,
            geometry,
            handle,
            state,
            frame: None,
        }
    }

    /// Drawing surface over the buffer's memory
    pub fn pixmap_mut(&mut self) -> Option<PixmapMut<'_>> {
        let size = self.geometry.size;
        PixmapMut::from_bytes(
            &mut self.memory[..size],
            self.geometry.width,
            self.geometry.height,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.memory[..self.geometry.size]
    }

    pub fn handle(&self) -> Option<&WlBuffer> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> BufferState {
        self.state.get()
    }

    #[cfg(test)]
    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn mark_submitted(&self) {
        self.state.set(BufferState::Submitted);
    }

    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    pub fn set_frame(&mut self, frame: Option<usize>) {
        self.frame = frame;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.destroy();
        }
    }
}

/// Source of new buffers
pub trait Allocator {
    fn allocate(&mut self, geometry: BufferGeometry) -> Result<Buffer, BufferError>;
}

/// Ring of buffers for a single output
#[derive(Default)]
pub struct BufferPool {
    buffers: VecDeque<Buffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Grow the pool until it holds at least `count` buffers.
    ///
    /// On failure the pool keeps its previous size.
    pub fn ensure_count(
        &mut self,
        count: usize,
        geometry: BufferGeometry,
        allocator: &mut dyn Allocator,
    ) -> Result<(), BufferError> {
        if self.buffers.len() >= count {
            return Ok(());
        }

        let missing = count - self.buffers.len();
        let mut fresh = Vec::with_capacity(missing);
        for _ in 0..missing {
            fresh.push(allocator.allocate(geometry)?);
        }

        debug!(
            "Buffer pool grown from {} to {} ({}x{})",
            self.buffers.len(),
            count,
            geometry.width,
            geometry.height
        );
        self.buffers.extend(fresh);
        Ok(())
    }

    /// Rotate the ring and return the next free buffer.
    ///
    /// Falls back to reusing a submitted buffer when none is free.
    pub fn next(&mut self) -> Option<&mut Buffer> {
        let len = self.buffers.len();
        if len == 0 {
            return None;
        }

        for _ in 0..len {
            self.buffers.rotate_left(1);
            if self.buffers.front().is_some_and(|b| b.state() == BufferState::Free) {
                return self.buffers.front_mut();
            }
        }

        warn!("No free buffer among {}, reusing a submitted one", len);
        self.buffers.rotate_left(1);
        self.buffers.front_mut()
    }

    /// Get a buffer for `frame`, preferring a free one that already holds it.
    ///
    /// When only a submitted buffer holds `frame`, its tag is dropped so that
    /// the frame stays tagged in a single buffer once redrawn.
    pub fn acquire(&mut self, frame: Option<usize>) -> Option<&mut Buffer> {
        if frame.is_some() {
            let cached = self
                .buffers
                .iter()
                .position(|b| b.state() == BufferState::Free && b.frame() == frame);
            if let Some(index) = cached {
                return self.buffers.get_mut(index);
            }
            for buffer in self.buffers.iter_mut().filter(|b| b.frame() == frame) {
                buffer.set_frame(None);
            }
        }
        self.next()
    }

    /// Forget which frames the buffers hold
    pub fn invalidate(&mut self) {
        for buffer in &mut self.buffers {
            buffer.set_frame(None);
        }
    }

    /// Destroy every buffer
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Invalid buffer geometry {width}x{height} at scale {scale}")]
    Degenerate { width: u32, height: u32, scale: u32 },

    #[error("Unable to create shared memory: {0}")]
    SharedMemory(#[source] std::io::Error),

    #[error("Unable to map buffer memory: {0}")]
    Map(#[source] std::io::Error),

    #[error("Buffer of {0} bytes is too large to share")]
    TooLarge(usize),

    #[cfg(test)]
    #[error("Buffer allocation refused")]
    Refused,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::AnonAllocator;

    fn geometry() -> BufferGeometry {
        BufferGeometry::for_output(4, 2, 1).unwrap()
    }

    #[test]
    fn test_geometry_scales_and_rejects_empty() {
        let geometry = BufferGeometry::for_output(1920, 1080, 2).unwrap();
        assert_eq!((geometry.width, geometry.height), (3840, 2160));
        assert_eq!(geometry.stride, 3840 * 4);
        assert_eq!(geometry.size, 3840 * 4 * 2160);

        assert!(BufferGeometry::for_output(0, 1080, 1).is_err());
        assert!(BufferGeometry::for_output(1920, 1080, 0).is_err());
    }

    #[test]
    fn test_ensure_count_never_shrinks() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();

        pool.ensure_count(5, geometry(), &mut allocator).unwrap();
        assert_eq!(pool.len(), 5);

        pool.ensure_count(3, geometry(), &mut allocator).unwrap();
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_ensure_count_failure_keeps_prior_size() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(2, geometry(), &mut allocator).unwrap();

        // Third allocation of this call fails
        allocator.fail_at(allocator.allocated() + 2);
        assert!(pool.ensure_count(5, geometry(), &mut allocator).is_err());
        assert_eq!(pool.len(), 2);

        let mut empty = BufferPool::new();
        allocator.fail_at(allocator.allocated() + 2);
        assert!(empty.ensure_count(5, geometry(), &mut allocator).is_err());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_next_skips_submitted_buffers() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(3, geometry(), &mut allocator).unwrap();

        // Submit two of the three buffers
        for _ in 0..2 {
            pool.next().unwrap().mark_submitted();
        }

        for _ in 0..5 {
            let buffer = pool.next().unwrap();
            assert_eq!(buffer.state(), BufferState::Free);
        }
    }

    #[test]
    fn test_next_forces_reuse_when_all_submitted() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(2, geometry(), &mut allocator).unwrap();

        pool.next().unwrap().mark_submitted();
        pool.next().unwrap().mark_submitted();
        assert!(pool.next().is_some());
        assert!(BufferPool::new().next().is_none());
    }

    #[test]
    fn test_acquire_prefers_cached_frame() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(3, geometry(), &mut allocator).unwrap();

        for frame in 0..3 {
            pool.next().unwrap().set_frame(Some(frame));
        }

        assert_eq!(pool.acquire(Some(1)).unwrap().frame(), Some(1));
        assert_eq!(pool.acquire(Some(1)).unwrap().frame(), Some(1));

        pool.invalidate();
        assert_eq!(pool.acquire(Some(1)).unwrap().frame(), None);
    }

    #[test]
    fn test_acquire_keeps_frame_tags_unique() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(3, geometry(), &mut allocator).unwrap();

        for frame in 0..3 {
            pool.next().unwrap().set_frame(Some(frame));
        }
        // Frame 1 is on screen
        for buffer in pool.buffers.iter().filter(|b| b.frame() == Some(1)) {
            buffer.mark_submitted();
        }

        let buffer = pool.acquire(Some(1)).unwrap();
        assert_eq!(buffer.state(), BufferState::Free);
        buffer.set_frame(Some(1));

        let tagged = pool.buffers.iter().filter(|b| b.frame() == Some(1)).count();
        assert_eq!(tagged, 1);
    }

    #[test]
    fn test_release_frees_buffer() {
        let mut allocator = AnonAllocator::new();
        let mut pool = BufferPool::new();
        pool.ensure_count(1, geometry(), &mut allocator).unwrap();

        let state = allocator.last_state().unwrap();
        pool.next().unwrap().mark_submitted();
        assert_eq!(state.get(), BufferState::Submitted);

        state.set(BufferState::Free);
        assert_eq!(pool.next().unwrap().state(), BufferState::Free);
    }
}
