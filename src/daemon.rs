//! Event loop
//!
//! One blocking poll over the signal pipe, the Wayland connection, the control
//! socket and every animation timer. Protocol events are always dispatched
//! before any rendering of the same iteration.

use crate::animation::{AnimationId, FIRST_ANIMATION_TOKEN};
use crate::config::OutputConfigs;
use crate::ipc::ControlSocket;
use crate::signals::SignalPipe;
use crate::state::State;
use crate::wayland::{self, Wayland};
use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use oguri_ipc::{Request, socket_path};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use wayland_client::backend::WaylandError;
use wayland_client::{Connection, EventQueue};

const SIGNAL: Token = Token(0);
const WAYLAND: Token = Token(1);
const IPC_LISTENER: Token = Token(2);
const IPC_CLIENT: Token = Token(3);

const _: () = assert!(IPC_CLIENT.0 < FIRST_ANIMATION_TOKEN);

/// Sources reported ready by one poll
#[derive(Debug, Default, PartialEq)]
struct Readiness {
    signal: bool,
    wayland: bool,
    listener: bool,
    client: bool,
    timers: Vec<AnimationId>,
}

impl Readiness {
    fn from_tokens(tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut ready = Self::default();
        for token in tokens {
            match token {
                SIGNAL => ready.signal = true,
                WAYLAND => ready.wayland = true,
                IPC_LISTENER => ready.listener = true,
                IPC_CLIENT => ready.client = true,
                token => match AnimationId::from_token(token) {
                    Some(id) => ready.timers.push(id),
                    None => debug_assert!(false, "unexpected token {:?}", token),
                },
            }
        }
        ready
    }
}

/// Apply a control request; returns the reply for the client
fn handle_request(state: &mut State, request: Request) -> String {
    let result = match request {
        Request::Reload => state.reload(),
        Request::Configure(payload) => state.configure(&payload),
    };
    match result {
        Ok(()) => String::new(),
        Err(e) => {
            warn!("Control request failed: {}", e);
            format!("{e}\n")
        }
    }
}

/// Render every animation whose timer fired; nothing is drawn while stopping
fn render_timers(state: &mut State, timers: &[AnimationId], running: bool, now: Instant) {
    if !running {
        return;
    }
    for id in timers {
        state.tick(*id, now);
    }
}

pub struct Daemon {
    poll: Poll,
    signals: SignalPipe,
    conn: Connection,
    queue: EventQueue<Wayland>,
    wayland: Wayland,
    control: Option<ControlSocket>,
    running: bool,
}

impl Daemon {
    pub fn new(config_path: PathBuf, configs: OutputConfigs) -> Result<Self> {
        let poll = Poll::new().context("Failed to create mio Poll")?;

        let mut signals = SignalPipe::install()?;
        poll.registry()
            .register(&mut signals, SIGNAL, Interest::READABLE)
            .context("Failed to register signal pipe with mio")?;

        let registry = poll.registry().try_clone().context("Failed to clone mio registry")?;
        let (conn, queue, wayland) = wayland::connect(config_path, configs, registry)?;

        let fd = conn.backend().poll_fd().as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), WAYLAND, Interest::READABLE)
            .context("Failed to register Wayland FD with mio")?;

        // The daemon still works without a control socket
        let control = match ControlSocket::bind(socket_path(), poll.registry(), IPC_LISTENER, IPC_CLIENT) {
            Ok(control) => Some(control),
            Err(e) => {
                warn!("Continuing without control socket: {:#}", e);
                None
            }
        };

        Ok(Self {
            poll,
            signals,
            conn,
            queue,
            wayland,
            control,
            running: true,
        })
    }

    /// Run until a stop signal arrives or the compositor goes away
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(64);
        let mut result = Ok(());

        while self.running {
            if let Err(e) = self.flush() {
                result = Err(e);
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                result = Err(e).context("Failed to poll event sources");
                break;
            }

            let ready = Readiness::from_tokens(events.iter().map(|event| event.token()));

            if ready.signal && self.signals.drain() {
                info!("Stop signal received");
                self.running = false;
            }

            if ready.wayland {
                if let Err(e) = self.read_wayland() {
                    error!("{:#}", e);
                    self.running = false;
                }
            }

            if !self.running {
                break;
            }

            if ready.listener {
                self.accept_client();
            }
            if ready.client {
                self.serve_client();
            }

            render_timers(&mut self.wayland.state, &ready.timers, self.running, Instant::now());
        }

        self.teardown();
        result
    }

    /// Dispatch queued events, then send every pending request
    fn flush(&mut self) -> Result<()> {
        self.queue
            .dispatch_pending(&mut self.wayland)
            .context("Failed to dispatch Wayland events")?;
        self.wayland.reconcile_if_dirty();

        match self.queue.flush() {
            Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            other => other.context("Failed to flush Wayland connection"),
        }
    }

    /// Read everything available on the connection and dispatch it
    fn read_wayland(&mut self) -> Result<()> {
        loop {
            let Some(guard) = self.queue.prepare_read() else {
                self.queue
                    .dispatch_pending(&mut self.wayland)
                    .context("Failed to dispatch Wayland events")?;
                continue;
            };

            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("Wayland connection lost"),
            }
        }

        self.queue
            .dispatch_pending(&mut self.wayland)
            .context("Failed to dispatch Wayland events")?;
        if self.wayland.reconcile_if_dirty() {
            debug!("Outputs reconciled after name changes");
        }
        Ok(())
    }

    fn accept_client(&mut self) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        if control.accept(self.poll.registry()) {
            // Data may already be waiting
            self.serve_client();
        }
    }

    fn serve_client(&mut self) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        let Some(request) = control.read(self.poll.registry()) else {
            return;
        };

        let reply = handle_request(&mut self.wayland.state, request);
        control.reply(self.poll.registry(), &reply);

        // Connections that arrived meanwhile produce no new readiness
        self.accept_client();
    }

    fn teardown(&mut self) {
        info!("Shutting down");
        self.wayland.teardown();
        self.control = None;
        if let Err(e) = self.conn.flush() {
            debug!("Unable to flush Wayland connection: {}", e);
        }
    }
}
