//! Shared-memory buffer allocation for the compositor

use crate::buffer::{Allocator, Buffer, BufferError, BufferGeometry, SharedState};
use crate::wayland::Wayland;
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::os::fd::AsFd;
use tracing::trace;
use wayland_client::QueueHandle;
use wayland_client::protocol::wl_shm::{self, WlShm};

/// Attempts at finding an unused shared memory name
const NAME_ATTEMPTS: usize = 100;

/// Allocates buffers in anonymous POSIX shared memory shared with the compositor
pub struct ShmAllocator {
    shm: WlShm,
    qh: QueueHandle<Wayland>,
    serial: u32,
}

impl ShmAllocator {
    pub fn new(shm: WlShm, qh: QueueHandle<Wayland>) -> Self {
        Self { shm, qh, serial: 0 }
    }

    /// Create an unlinked shared memory file of `size` bytes
    fn create_file(&mut self, size: usize) -> Result<File, BufferError> {
        for _ in 0..NAME_ATTEMPTS {
            let name = format!("/oguri-{}-{}", std::process::id(), self.serial);
            self.serial = self.serial.wrapping_add(1);

            let fd = match shm_open(
                name.as_str(),
                OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
                Mode::S_IRUSR | Mode::S_IWUSR,
            ) {
                Ok(fd) => fd,
                Err(Errno::EEXIST) => continue,
                Err(e) => return Err(BufferError::SharedMemory(e.into())),
            };

            // Only the file descriptor keeps the memory alive from here on
            shm_unlink(name.as_str()).map_err(|e| BufferError::SharedMemory(e.into()))?;

            let file = File::from(fd);
            file.set_len(size as u64).map_err(BufferError::SharedMemory)?;
            return Ok(file);
        }

        Err(BufferError::SharedMemory(Errno::EEXIST.into()))
    }
}

impl Allocator for ShmAllocator {
    fn allocate(&mut self, geometry: BufferGeometry) -> Result<Buffer, BufferError> {
        let too_large = || BufferError::TooLarge(geometry.size);
        let size = i32::try_from(geometry.size).map_err(|_| too_large())?;
        let width = i32::try_from(geometry.width).map_err(|_| too_large())?;
        let height = i32::try_from(geometry.height).map_err(|_| too_large())?;
        let stride = i32::try_from(geometry.stride).map_err(|_| too_large())?;

        let file = self.create_file(geometry.size)?;
        // SAFETY: the file is private to this process and the compositor, and
        // is never truncated after mapping.
        let memory = unsafe { MmapMut::map_mut(&file) }.map_err(BufferError::Map)?;

        let state = SharedState::default();
        let pool = self.shm.create_pool(file.as_fd(), size, &self.qh, ());
        let handle = pool.create_buffer(
            0,
            width,
            height,
            stride,
            wl_shm::Format::Argb8888,
            &self.qh,
            state.clone(),
        );
        // The buffer keeps the memory referenced on the compositor side
        pool.destroy();

        trace!("Allocated {}x{} shm buffer ({} bytes)", width, height, size);
        Ok(Buffer::new(memory, geometry, Some(handle), state))
    }
}
