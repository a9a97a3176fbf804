//! One-shot frame timers backed by timerfd

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("Unable to create timer: {0}")]
    Create(#[source] nix::Error),

    #[error("Unable to arm timer: {0}")]
    Arm(#[source] nix::Error),
}

/// Monotonic one-shot timer that can be polled for readiness
pub struct Timer {
    fd: TimerFd,
}

impl Timer {
    pub fn new() -> Result<Self, TimerError> {
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(TimerError::Create)?;
        Ok(Self { fd })
    }

    /// Fire once after `delay`. Zero fires as soon as possible.
    pub fn arm(&self, delay: Duration) -> Result<(), TimerError> {
        // A zero expiration would disarm the timer
        let delay = delay.max(Duration::from_nanos(1));
        self.fd
            .set(
                Expiration::OneShot(TimeSpec::from_duration(delay)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(TimerError::Arm)
    }

    /// Consume a pending expiration, if any
    pub fn drain(&self) {
        let mut count = [0u8; 8];
        match nix::unistd::read(self.fd.as_fd(), &mut count) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => debug!("Unable to read timer: {}", e),
        }
    }

    /// Whether an expiration is pending
    #[cfg(test)]
    pub fn expired(&self) -> bool {
        let mut count = [0u8; 8];
        matches!(nix::unistd::read(self.fd.as_fd(), &mut count), Ok(8))
    }
}

impl Source for Timer {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        SourceFd(&self.fd.as_fd().as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        SourceFd(&self.fd.as_fd().as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> std::io::Result<()> {
        SourceFd(&self.fd.as_fd().as_raw_fd()).deregister(registry)
    }
}
