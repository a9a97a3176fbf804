//! Control socket server
//!
//! Serves one client at a time: the client writes a request and half-closes,
//! the daemon applies it and answers with an empty body or an error message.
//! Further connections wait in the listen backlog until the current client is
//! done.

use anyhow::{Context, Result};
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use oguri_ipc::Request;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Largest request accepted
const MAX_REQUEST: usize = 64 * 1024;

struct Client {
    stream: UnixStream,
    received: Vec<u8>,
}

pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
    client: Option<Client>,
    client_token: Token,
}

impl ControlSocket {
    /// Bind the socket at `path`, replacing a stale one
    pub fn bind(
        path: PathBuf,
        registry: &Registry,
        listener_token: Token,
        client_token: Token,
    ) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Unable to remove stale socket {:?}", path))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut listener =
            UnixListener::bind(&path).with_context(|| format!("Unable to bind control socket {:?}", path))?;
        registry
            .register(&mut listener, listener_token, Interest::READABLE)
            .context("Unable to poll control socket")?;
        info!("Control socket listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            client: None,
            client_token,
        })
    }

    /// Accept a waiting connection unless a client is already being served.
    ///
    /// Returns whether a client was accepted.
    pub fn accept(&mut self, registry: &Registry) -> bool {
        if self.client.is_some() {
            return false;
        }

        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    if let Err(e) = registry.register(&mut stream, self.client_token, Interest::READABLE) {
                        warn!("Unable to poll control client: {}", e);
                        continue;
                    }
                    debug!("Control client connected");
                    self.client = Some(Client {
                        stream,
                        received: Vec::new(),
                    });
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Unable to accept control client: {}", e);
                    return false;
                }
            }
        }
    }

    /// Read from the current client; returns its request once complete
    pub fn read(&mut self, registry: &Registry) -> Option<Request> {
        let client = self.client.as_mut()?;
        let mut chunk = [0u8; 4096];

        loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    client.received.extend_from_slice(&chunk[..read]);
                    if client.received.len() > MAX_REQUEST {
                        warn!("Control request exceeds {} bytes", MAX_REQUEST);
                        self.reply(registry, "Request too large\n");
                        return None;
                    }
                }
                // Requests are small; without more data the client is done
                Err(e) if e.kind() == ErrorKind::WouldBlock && !client.received.is_empty() => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Unable to read control request: {}", e);
                    self.disconnect(registry);
                    return None;
                }
            }
        }

        Some(Request::decode(&client.received))
    }

    /// Send `reply` to the current client and close the connection
    pub fn reply(&mut self, registry: &Registry, reply: &str) {
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.stream.write_all(reply.as_bytes()) {
                warn!("Unable to answer control client: {}", e);
            }
        }
        self.disconnect(registry);
    }

    fn disconnect(&mut self, registry: &Registry) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = registry.deregister(&mut client.stream) {
                debug!("Unable to deregister control client: {}", e);
            }
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Unable to remove control socket {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::Shutdown;
    use std::time::Duration;

    const LISTENER: Token = Token(2);
    const CLIENT: Token = Token(3);

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("oguri-ipc-{}-{}", std::process::id(), name))
    }

    /// Poll until the client has sent a full request
    fn serve(poll: &mut Poll, socket: &mut ControlSocket) -> Request {
        let mut events = Events::with_capacity(8);
        for _ in 0..50 {
            socket.accept(poll.registry());
            if let Some(request) = socket.read(poll.registry()) {
                return request;
            }
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        }
        panic!("No request received");
    }

    #[test]
    fn test_request_and_reply() {
        let path = socket_path("reply");
        let mut poll = Poll::new().unwrap();
        let mut socket = ControlSocket::bind(path.clone(), poll.registry(), LISTENER, CLIENT).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client.write_all(b"[output DP-1]\nimage=b.gif\n").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let request = serve(&mut poll, &mut socket);
        assert_eq!(request, Request::Configure("[output DP-1]\nimage=b.gif\n".into()));

        socket.reply(poll.registry(), "[ipc:1] Expected key=value\n");
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "[ipc:1] Expected key=value\n");

        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_client_waits_for_first() {
        let path = socket_path("queue");
        let mut poll = Poll::new().unwrap();
        let mut socket = ControlSocket::bind(path.clone(), poll.registry(), LISTENER, CLIENT).unwrap();

        let mut first = std::os::unix::net::UnixStream::connect(&path).unwrap();
        let mut second = std::os::unix::net::UnixStream::connect(&path).unwrap();
        first.write_all(b"reload\n").unwrap();
        first.shutdown(Shutdown::Write).unwrap();
        second.write_all(b"[output *]\n").unwrap();
        second.shutdown(Shutdown::Write).unwrap();

        assert_eq!(serve(&mut poll, &mut socket), Request::Reload);
        assert!(!socket.accept(poll.registry()));
        socket.reply(poll.registry(), "");

        assert_eq!(serve(&mut poll, &mut socket), Request::Configure("[output *]\n".into()));
        socket.reply(poll.registry(), "");

        let mut reply = String::new();
        first.read_to_string(&mut reply).unwrap();
        assert!(reply.is_empty());
    }
}
