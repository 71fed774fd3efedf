//! Minimal file-transfer application protocol, layered on top of a
//! [`Session`](crate::session::Session) as a thin external collaborator.
//!
//! Commands are ASCII, newline terminated:
//!
//! ```text
//! GET <filename>\n      server sends the file's contents back over the session
//! PUT <filename>\n      client uploads raw bytes immediately afterwards
//! (anything else)       echoed back as "OK: ECHO: <line>"
//! ```
//!
//! `PeerState` tracks one remote's command buffer and, while a `PUT` is in
//! flight, the growing file buffer plus the timestamp of the last byte
//! received so the caller can decide when the upload is done.

use std::time::Instant;

use bytes::Bytes;
use tracing::info;

/// Server-side idle window while receiving a `PUT` payload, after which the
/// upload is considered complete.
pub const PUT_IDLE_TIMEOUT_SECS: f64 = 6.0;

/// Client-side idle window while waiting for a response to `GET`/`PUT`,
/// after which the response is considered complete. Longer than the
/// server's, since the client also has to absorb the emulator's effective
/// round-trip delay on the way back.
pub const CLIENT_IDLE_TIMEOUT_SECS: f64 = 8.0;

enum Mode {
    Idle,
    Receiving { filename: String },
}

/// Per-peer application state: a command line buffer, and (while a `PUT` is
/// in progress) the accumulating file buffer.
pub struct PeerState {
    inbuf: Vec<u8>,
    mode: Mode,
    filebuf: Vec<u8>,
    last_data_at: Instant,
}

/// A fully parsed command line.
pub enum Command {
    Get(String),
    Put(String),
    Echo(String),
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            inbuf: Vec::new(),
            mode: Mode::Idle,
            filebuf: Vec::new(),
            last_data_at: Instant::now(),
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.mode, Mode::Receiving { .. })
    }

    /// Begin a `PUT` upload for `filename`, immediately draining `pending`
    /// application bytes that may have arrived behind the command header in
    /// the same burst, so idle-timeout accounting starts from real data
    /// rather than ticking once on an empty buffer.
    pub fn start_put(&mut self, filename: String, pending: Bytes) {
        self.mode = Mode::Receiving { filename };
        self.filebuf.clear();
        self.last_data_at = Instant::now();
        if !pending.is_empty() {
            self.on_file_bytes(&pending);
        }
    }

    pub fn on_file_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.filebuf.extend_from_slice(data);
        self.last_data_at = Instant::now();
    }

    pub fn idle_secs(&self) -> f64 {
        self.last_data_at.elapsed().as_secs_f64()
    }

    /// Finalize the in-flight `PUT`, returning the filename and collected
    /// bytes and resetting state for the next command.
    pub fn finish_put(&mut self) -> (String, Vec<u8>) {
        let filename = match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Receiving { filename } => filename,
            Mode::Idle => "upload.bin".to_string(),
        };
        let content = std::mem::take(&mut self.filebuf);
        (filename, content)
    }

    /// Feed newly delivered application bytes into the command buffer and
    /// drain every complete newline-terminated line found so far.
    pub fn push_command_bytes(&mut self, data: &[u8]) -> Vec<Command> {
        self.inbuf.extend_from_slice(data);
        let mut commands = Vec::new();
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1])
                .trim()
                .to_string();
            if line.is_empty() {
                continue;
            }
            commands.push(parse_command(&line));
        }
        commands
    }
}

fn parse_command(line: &str) -> Command {
    let upper = line.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix("GET ") {
        let name = line[line.len() - rest.len()..].trim().to_string();
        info!(file = %name, "GET requested");
        Command::Get(name)
    } else if let Some(rest) = upper.strip_prefix("PUT ") {
        let name = line[line.len() - rest.len()..].trim().to_string();
        info!(file = %name, "PUT requested");
        Command::Put(name)
    } else {
        Command::Echo(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_and_put_case_insensitively() {
        match parse_command("get foo.txt") {
            Command::Get(name) => assert_eq!(name, "foo.txt"),
            _ => panic!("expected GET"),
        }
        match parse_command("PUT bar.bin") {
            Command::Put(name) => assert_eq!(name, "bar.bin"),
            _ => panic!("expected PUT"),
        }
    }

    #[test]
    fn unrecognized_line_echoes() {
        match parse_command("hello there") {
            Command::Echo(line) => assert_eq!(line, "hello there"),
            _ => panic!("expected Echo"),
        }
    }

    #[test]
    fn push_command_bytes_splits_on_newlines() {
        let mut state = PeerState::new();
        let cmds = state.push_command_bytes(b"GET a.txt\nPUT b.tx");
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], Command::Get(name) if name == "a.txt"));

        let cmds = state.push_command_bytes(b"t\n");
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], Command::Put(name) if name == "b.txt"));
    }

    #[test]
    fn put_drains_pending_bytes_immediately() {
        let mut state = PeerState::new();
        state.start_put("f.bin".to_string(), Bytes::from_static(b"abc"));
        assert!(state.is_receiving());
        let (name, content) = state.finish_put();
        assert_eq!(name, "f.bin");
        assert_eq!(content, b"abc");
        assert!(!state.is_receiving());
    }
}
