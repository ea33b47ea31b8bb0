// src/control.rs

//! Single-instance rendezvous over a unix domain socket
//!
//! The first process to bind the socket under the data root owns it
//! for its lifetime; later invocations connect as peers and hand their
//! work off instead of starting a second instance. Messages are
//! NUL-free UTF-8 lines of the form `command||arg1||arg2`.

use crate::error::{Error, Result};
use crate::task::spawn_worker;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Field separator of the line protocol
const SEPARATOR: &str = "||";

/// Commands carried over the rendezvous socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Hand-off of a CLI file argument
    ProcessFile(PathBuf),
    /// Error surfacing in the owning instance
    ShowDialog { title: String, body: String },
}

impl Message {
    /// Wire form, without the trailing newline
    pub fn encode(&self) -> String {
        match self {
            Message::ProcessFile(path) => {
                format!("process_file{SEPARATOR}{}", path.display())
            }
            Message::ShowDialog { title, body } => {
                format!("show_dialog{SEPARATOR}{title}{SEPARATOR}{body}")
            }
        }
    }

    pub fn decode(line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches('\n').split(SEPARATOR);
        match fields.next() {
            Some("process_file") => {
                let path = fields
                    .next()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Error::invalid("control message", "process_file without path"))?;
                Ok(Message::ProcessFile(PathBuf::from(path)))
            }
            Some("show_dialog") => {
                let title = fields.next().unwrap_or_default().to_string();
                let body = fields.collect::<Vec<_>>().join(SEPARATOR);
                Ok(Message::ShowDialog { title, body })
            }
            other => Err(Error::invalid(
                "control message",
                format!("unknown command: {}", other.unwrap_or("")),
            )),
        }
    }
}

/// Outcome of the rendezvous attempt
pub enum Rendezvous {
    /// This process bound the socket and owns the instance
    Owner(ControlServer),
    /// Another instance answered; hand off and exit
    Peer(ControlClient),
}

/// Try to join an existing instance, else become it.
///
/// A leftover socket file from a crashed instance refuses the
/// connection; it is unlinked and the socket rebound.
pub fn rendezvous(socket: &Path) -> Result<Rendezvous> {
    match UnixStream::connect(socket) {
        Ok(stream) => {
            debug!("peer instance found on {}", socket.display());
            Ok(Rendezvous::Peer(ControlClient { stream }))
        }
        Err(_) => {
            if socket.exists() {
                debug!("removing stale socket {}", socket.display());
                std::fs::remove_file(socket)?;
            }
            let listener = UnixListener::bind(socket).map_err(|e| {
                Error::Fatal(format!("cannot bind {}: {}", socket.display(), e))
            })?;
            info!("owning instance socket {}", socket.display());
            Ok(Rendezvous::Owner(ControlServer {
                listener,
                path: socket.to_path_buf(),
            }))
        }
    }
}

/// Connected peer half
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.stream.write_all(message.encode().as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Owning half: accepts peers and dispatches their messages
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections on a worker thread, passing each decoded
    /// message to `handler`. The server stays owned by the caller so
    /// dropping it still unlinks the socket; the worker runs on a
    /// cloned listener until the process exits.
    pub fn spawn<F>(&self, handler: F) -> Result<std::thread::JoinHandle<()>>
    where
        F: Fn(Message) + Send + 'static,
    {
        let listener = self.listener.try_clone()?;
        Ok(spawn_worker("control-accept", move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("control accept failed: {}", e);
                        continue;
                    }
                };
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    if line.is_empty() {
                        continue;
                    }
                    match Message::decode(&line) {
                        Ok(message) => handler(message),
                        Err(e) => warn!("bad control message: {}", e),
                    }
                }
            }
        }))
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot unlink {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn message_wire_roundtrip() {
        let m = Message::ProcessFile(PathBuf::from("/tmp/setup.exe"));
        assert_eq!(m.encode(), "process_file||/tmp/setup.exe");
        assert_eq!(Message::decode(&m.encode()).unwrap(), m);

        let d = Message::ShowDialog {
            title: "Invalid file".into(),
            body: "not a PE file".into(),
        };
        assert_eq!(Message::decode(&d.encode()).unwrap(), d);

        assert!(Message::decode("bogus||x").is_err());
        assert!(Message::decode("process_file||").is_err());
    }

    #[test]
    fn first_binds_second_hands_off() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("winecharm_socket");

        let Rendezvous::Owner(server) = rendezvous(&socket).unwrap() else {
            panic!("first rendezvous must own the socket");
        };
        let (tx, rx) = channel();
        server
            .spawn(move |message| {
                let _ = tx.send(message);
            })
            .unwrap();

        let Rendezvous::Peer(mut client) = rendezvous(&socket).unwrap() else {
            panic!("second rendezvous must find the peer");
        };
        client
            .send(&Message::ProcessFile(PathBuf::from("/tmp/a.exe")))
            .unwrap();
        client
            .send(&Message::ShowDialog {
                title: "T".into(),
                body: "B".into(),
            })
            .unwrap();
        drop(client);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, Message::ProcessFile(PathBuf::from("/tmp/a.exe")));
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(second, Message::ShowDialog { .. }));
    }

    #[test]
    fn stale_socket_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("winecharm_socket");
        // A leftover path nobody is listening on
        std::fs::write(&socket, b"").unwrap();

        assert!(matches!(
            rendezvous(&socket).unwrap(),
            Rendezvous::Owner(_)
        ));
    }

    #[test]
    fn drop_unlinks_socket() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("winecharm_socket");
        {
            let Rendezvous::Owner(_server) = rendezvous(&socket).unwrap() else {
                panic!("expected owner");
            };
            assert!(socket.exists());
        }
        assert!(!socket.exists());
    }
}
