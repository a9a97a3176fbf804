//! Termination signals as pollable data
//!
//! The handler only writes the signal number into a non-blocking pipe; the
//! event loop reads it back and shuts down in an orderly fashion.

use anyhow::{Context, Result};
use mio::event::Source;
use mio::unix::pipe::{self, Receiver, Sender};
use mio::{Interest, Registry, Token};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

/// Signals that stop the daemon
const STOP_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Write end of the pipe, for the signal handler
static PIPE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signal: libc::c_int) {
    let fd = PIPE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let bytes = signal.to_ne_bytes();
    // SAFETY: write(2) is async-signal-safe and `bytes` outlives the call
    unsafe {
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

pub struct SignalPipe {
    receiver: Receiver,
    /// Kept open for the handler
    _sender: Sender,
}

impl SignalPipe {
    /// Route the stop signals into a new pipe and ignore `SIGPIPE`
    pub fn install() -> Result<Self> {
        let (sender, receiver) = pipe::new().context("Unable to create signal pipe")?;
        PIPE_FD.store(sender.as_raw_fd(), Ordering::Relaxed);

        let forward = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in STOP_SIGNALS {
            // SAFETY: the handler only performs an async-signal-safe write
            unsafe { sigaction(signal, &forward) }
                .with_context(|| format!("Unable to install {} handler", signal))?;
        }

        // Control clients may hang up before reading the reply
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: ignoring a signal installs no code
        unsafe { sigaction(Signal::SIGPIPE, &ignore) }.context("Unable to ignore SIGPIPE")?;

        Ok(Self {
            receiver,
            _sender: sender,
        })
    }

    /// Read every pending signal; returns whether one asks to stop
    pub fn drain(&mut self) -> bool {
        let mut stop = false;
        let mut buffer = [0u8; 64];

        loop {
            match self.receiver.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    for chunk in buffer[..read].chunks_exact(4) {
                        let number = libc::c_int::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        match Signal::try_from(number) {
                            Ok(signal) if STOP_SIGNALS.contains(&signal) => {
                                debug!("Received {}", signal);
                                stop = true;
                            }
                            _ => debug!("Ignoring signal {}", number),
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Unable to read signal pipe: {}", e);
                    break;
                }
            }
        }

        stop
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        PIPE_FD.store(-1, Ordering::Relaxed);
    }
}

impl Source for SignalPipe {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        self.receiver.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        self.receiver.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> std::io::Result<()> {
        self.receiver.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_signal_requests_stop() {
        let mut pipe = SignalPipe::install().unwrap();
        assert!(!pipe.drain());

        forward_signal(libc::SIGTERM);
        assert!(pipe.drain());

        forward_signal(libc::SIGUSR1);
        assert!(!pipe.drain());
    }
}
