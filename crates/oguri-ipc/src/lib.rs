//! Oguri IPC Protocol
//!
//! Shared request types for communication between `oguri` (the wallpaper
//! daemon) and `ogurictl` (the control client).
//!
//! A request is plain text. Configure requests use the same grammar as the
//! configuration file; a payload consisting of the single word `reload` asks
//! the daemon to re-read its configuration file from disk.

use std::path::PathBuf;
use thiserror::Error;

/// File name of the control socket inside the runtime directory
pub const SOCKET_NAME: &str = "oguri";

/// Keyword that turns a payload into a reload request
pub const RELOAD_KEYWORD: &str = "reload";

/// Options accepted by the `output` command, in the order they are written
pub const OUTPUT_OPTIONS: [&str; 4] = ["anchor", "filter", "image", "scaling-mode"];

/// Socket path for IPC communication
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    runtime_dir.join(SOCKET_NAME)
}

// ============================================================================
// Client → Daemon Requests
// ============================================================================

/// Requests sent from the control client to the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Apply a configuration payload on top of the current configuration
    Configure(String),

    /// Re-read the configuration file and decode every image again
    Reload,
}

impl Request {
    /// Decode a request from the raw bytes read off the socket
    pub fn decode(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        if lines.next() == Some(RELOAD_KEYWORD) && lines.next().is_none() {
            return Request::Reload;
        }
        Request::Configure(text.into_owned())
    }

    /// Encode the request for writing to the socket
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Configure(payload) => payload.as_bytes().to_vec(),
            Request::Reload => format!("{RELOAD_KEYWORD}\n").into_bytes(),
        }
    }
}

/// Errors produced while building a request from command-line input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("no output name provided")]
    MissingOutputName,

    #[error("unrecognized output option '{0}'")]
    UnknownOption(String),

    #[error("output option '{0}' requires an argument")]
    MissingValue(String),

    #[error("output option '{0}' contains a line break")]
    InvalidValue(String),
}

/// Build a configure request for a single output section.
///
/// Options are `(name, value)` pairs using the names in [`OUTPUT_OPTIONS`].
pub fn output_request(name: &str, options: &[(String, String)]) -> Result<Request, RequestError> {
    if name.is_empty() {
        return Err(RequestError::MissingOutputName);
    }

    let mut payload = format!("[output {name}]\n");
    for (option, value) in options {
        if !OUTPUT_OPTIONS.contains(&option.as_str()) {
            return Err(RequestError::UnknownOption(option.clone()));
        }
        if value.is_empty() {
            return Err(RequestError::MissingValue(option.clone()));
        }
        if value.contains('\n') {
            return Err(RequestError::InvalidValue(option.clone()));
        }
        payload.push_str(option);
        payload.push('=');
        payload.push_str(value);
        payload.push('\n');
    }

    Ok(Request::Configure(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_request_payload() {
        let options = vec![
            ("image".to_string(), "/tmp/b.gif".to_string()),
            ("anchor".to_string(), "top-left".to_string()),
        ];
        let request = output_request("DP-1", &options).unwrap();

        assert_eq!(
            request,
            Request::Configure("[output DP-1]\nimage=/tmp/b.gif\nanchor=top-left\n".into())
        );
    }

    #[test]
    fn test_output_request_rejects_unknown_option() {
        let options = vec![("colour".to_string(), "red".to_string())];
        assert_eq!(
            output_request("DP-1", &options),
            Err(RequestError::UnknownOption("colour".into()))
        );
        assert_eq!(output_request("", &[]), Err(RequestError::MissingOutputName));
    }

    #[test]
    fn test_reload_decoding() {
        assert_eq!(Request::decode(b"reload\n"), Request::Reload);
        assert_eq!(Request::decode(b"\n  reload  \n\n"), Request::Reload);
        assert_eq!(Request::decode(&Request::Reload.encode()), Request::Reload);

        match Request::decode(b"reload\n[output *]\n") {
            Request::Configure(payload) => assert!(payload.starts_with("reload")),
            Request::Reload => panic!("Extra lines must not be treated as reload"),
        }
    }

    #[test]
    fn test_configure_passes_payload_through() {
        let payload = "[output DP-1]\nimage=b.gif\n";
        assert_eq!(
            Request::decode(payload.as_bytes()),
            Request::Configure(payload.to_string())
        );
    }
}
