// The listener: a request demultiplexer on the well-known port.
//
// One datagram per iteration. Read and write requests get their filename
// resolved under the root directory and are handed to a session task
// that owns everything from there on; every other opcode as a first
// packet is answered with an error from a throwaway socket. The listener
// keeps no per-client state and is never taken down by a session.

use crate::srv_conn::{bind_session_socket, send_error_packet, ServerRequestHandler, TransferKind};
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval on the listener socket. Bounds how long a stop request
/// waits for the accept loop to notice.
const LISTENER_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Server {
    sock: TftpSocket,
    root_dir: PathBuf,
    running: Arc<AtomicBool>,
}

/// Cloneable stop signal for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Asks the accept loop to exit once its current receive returns or
    /// times out. Sessions already underway run to their own completion.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Server {
    pub fn bind(addr: SocketAddr, root_dir: PathBuf) -> io::Result<Server> {
        Ok(Server {
            sock: TftpSocket::bind(addr)?,
            root_dir,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// The accept loop. Runs until [`ServerHandle::stop`] is called.
    pub async fn run(self) {
        let mut buf = [0_u8; 1024];
        while self.running.load(Ordering::Acquire) {
            let (packet, src) = match self.sock.recv_with_timeout(&mut buf, LISTENER_TIMEOUT).await
            {
                Ok(received) => received,
                Err(SocketError::Timeout(_)) => continue,
                Err(SocketError::Parse(e)) => {
                    log::warn!("Dropping unparseable datagram: {e}");
                    continue;
                }
                Err(e) => {
                    log::error!("Listener receive failed: {e}");
                    continue;
                }
            };

            match packet {
                Packet::ReadReq { filename, mode } => {
                    self.spawn_session(TransferKind::Read, filename, mode, src);
                }
                Packet::WriteReq { filename, mode } => {
                    self.spawn_session(TransferKind::Write, filename, mode, src);
                }
                _ => {
                    log::warn!("Non-request first packet from {src}");
                    tokio::spawn(async move {
                        let sock = bind_session_socket(&src);
                        send_error_packet(&sock, src, ErrorCode::Illegal, b"Illegal TFTP operation")
                            .await;
                    });
                }
            }
        }
        log::info!("Listener stopped");
    }

    /// Resolves the request and hands it to its own task. The joined path
    /// is owned by the task from here on.
    fn spawn_session(&self, kind: TransferKind, filename: &[u8], mode: FileMode, src: SocketAddr) {
        let shown = String::from_utf8_lossy(filename).into_owned();
        // Mode is recorded but carries no special handling: netascii and
        // mail transfer byte for byte, exactly like octet.
        log::info!("{kind:?} request from {src} for \"{shown}\" ({})", mode.as_str());

        let Some(path) = resolve_under_root(&self.root_dir, filename) else {
            log::warn!("Rejected path \"{shown}\" from {src}");
            tokio::spawn(async move {
                let sock = bind_session_socket(&src);
                send_error_packet(&sock, src, ErrorCode::AccessViolation, b"Access violation")
                    .await;
            });
            return;
        };

        tokio::spawn(async move {
            match ServerRequestHandler::new(kind, path, src).await {
                Ok(handler) => handler.handle().await,
                Err(e) => log::error!("Could not start {kind:?} session for {src}: {e}"),
            }
        });
    }
}

/// Joins a requested filename under the root directory, refusing anything
/// that could escape it. A single leading slash is tolerated because many
/// clients send absolute-looking paths.
fn resolve_under_root(root: &Path, filename: &[u8]) -> Option<PathBuf> {
    let name = std::str::from_utf8(filename).ok()?;
    let name = name.strip_prefix('/').unwrap_or(name);
    if name.is_empty() {
        return None;
    }

    let relative = Path::new(name);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }

    Some(root.join(relative))
}
