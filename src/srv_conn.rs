// This module contains the server-side connection handler.
//
// A handler is created when the listener accepts a read or write request.
// It binds its own UDP socket on an ephemeral port (the server's transfer
// identifier for the session), opens or creates the requested file, and
// then drives a lock-step exchange with the peer: data out / ack in for a
// read, data in / ack out for a write. A receive timeout triggers
// retransmission of whatever was last sent; the exchange has no retry
// ceiling and ends when the state machine finishes, the peer sends an
// error packet, or local I/O fails.

use crate::processor::{ReadSession, WriteSession};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpResult, TftpSocket, MAX_PACKET_LEN};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io;

/// Receive deadline on a session socket. Expiry retransmits the packet in
/// flight rather than abandoning the session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Receive buffer size; larger than any legal packet so oversized
/// datagrams surface as oversized payloads instead of being truncated.
const RECV_BUF_LEN: usize = 1024;

/// Which transfer the peer requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Read,
    Write,
}

/// An object responsible for handling one accepted request.
pub struct ServerRequestHandler {
    /// The session socket, bound to an ephemeral port.
    sock: TftpSocket,

    /// The peer endpoint established by the initial request.
    dst: SocketAddr,

    session: Session,
}

enum Session {
    Read(ReadSession),
    Write(WriteSession),
}

/// Attempts to bind a fresh socket on the peer's address family until an
/// ephemeral port sticks.
pub(crate) fn bind_session_socket(peer: &SocketAddr) -> TftpSocket {
    let unspecified: IpAddr = match peer {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let mut rng = rand::thread_rng();
    loop {
        let port = rng.gen_range(1024..65535);
        match TftpSocket::bind((unspecified, port).into()) {
            Ok(sock) => return sock,
            Err(e) => log::warn!("Couldn't bind session socket on port {port}: {e}"),
        }
    }
}

/// Error packets are a courtesy; how the send goes is nobody's concern.
pub(crate) async fn send_error_packet(
    sock: &TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    message: &[u8],
) {
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

impl ServerRequestHandler {
    /// Binds the session socket and opens the transfer's file. On a file
    /// failure the peer is told why and the error is returned to the
    /// caller for logging.
    pub async fn new(
        kind: TransferKind,
        path: PathBuf,
        peer: SocketAddr,
    ) -> Result<ServerRequestHandler, io::Error> {
        let sock = bind_session_socket(&peer);

        let session = match kind {
            TransferKind::Read => match ReadSession::open(&path).await {
                Ok(s) => Session::Read(s),
                Err(e) => {
                    send_error_packet(&sock, peer, ErrorCode::FileNotFound, b"File not found")
                        .await;
                    return Err(e);
                }
            },
            TransferKind::Write => match WriteSession::create(&path).await {
                Ok(s) => Session::Write(s),
                Err(e) => {
                    let (code, message): (ErrorCode, &[u8]) =
                        if e.kind() == io::ErrorKind::AlreadyExists {
                            (ErrorCode::FileAlreadyExists, b"File already exists")
                        } else {
                            (ErrorCode::AccessViolation, b"Could not create file")
                        };
                    send_error_packet(&sock, peer, code, message).await;
                    return Err(e);
                }
            },
        };

        Ok(ServerRequestHandler { sock, dst: peer, session })
    }

    /// Does the work of sending and receiving data over the connection
    /// until the connection closes. Every session-local failure ends
    /// here; nothing propagates to the listener.
    pub async fn handle(self) {
        let ServerRequestHandler { sock, dst, session } = self;
        let outcome = match session {
            Session::Read(s) => run_read(&sock, dst, s).await,
            Session::Write(s) => run_write(&sock, dst, s).await,
        };

        match outcome {
            Ok(()) => log::info!("Closing connection with {dst}"),
            Err(e) => log::error!("Session with {dst} failed: {e}"),
        }
    }
}

/// Sends the file block by block, advancing only on the matching ack.
async fn run_read(sock: &TftpSocket, dst: SocketAddr, mut session: ReadSession) -> TftpResult<()> {
    let mut send_buf = [0_u8; MAX_PACKET_LEN];
    let mut recv_buf = [0_u8; RECV_BUF_LEN];

    loop {
        let len = match session.next_packet().await? {
            Some(packet) => packet.serialize(&mut send_buf)?,
            None => return Ok(()),
        };
        sock.send_raw(&send_buf[..len], dst).await?;

        // Wait for a datagram worth acting on. Leaving this loop resends
        // the block in flight (or the next one, if an ack advanced us).
        loop {
            match sock.recv_with_timeout(&mut recv_buf, SESSION_TIMEOUT).await {
                Ok((packet, src)) => {
                    if src != dst {
                        // Someone else's datagram on our transfer ID.
                        send_error_packet(sock, src, ErrorCode::UnknownTid, b"Unknown transfer ID")
                            .await;
                        continue;
                    }
                    match packet {
                        Packet::Ack { block } => {
                            session.handle_ack(block);
                            break;
                        }
                        Packet::Error { code, message } => {
                            log::error!(
                                "Peer {dst} sent error {code:?}: {}",
                                String::from_utf8_lossy(message)
                            );
                            return Ok(());
                        }
                        _ => break,
                    }
                }
                Err(SocketError::Timeout(_)) => {
                    log::warn!("Timed out waiting for ack from {dst}, retransmitting");
                    break;
                }
                Err(SocketError::Parse(e)) => {
                    log::warn!("Ignoring malformed datagram on session with {dst}: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Receives the file block by block, acking each accepted block and
/// re-sending the last ack on timeout.
async fn run_write(
    sock: &TftpSocket,
    dst: SocketAddr,
    mut session: WriteSession,
) -> TftpResult<()> {
    let mut recv_buf = [0_u8; RECV_BUF_LEN];

    // Ack the request itself before the first data block.
    sock.send_raw(session.last_ack_bytes(), dst).await?;

    while !session.finished() {
        match sock.recv_with_timeout(&mut recv_buf, SESSION_TIMEOUT).await {
            Ok((packet, src)) => {
                if src != dst {
                    send_error_packet(sock, src, ErrorCode::UnknownTid, b"Unknown transfer ID")
                        .await;
                    continue;
                }
                match packet {
                    Packet::Data { block, payload } => {
                        if session.handle_data(block, payload).await? {
                            sock.send_raw(session.last_ack_bytes(), dst).await?;
                        }
                    }
                    Packet::Error { code, message } => {
                        log::error!(
                            "Peer {dst} sent error {code:?}: {}",
                            String::from_utf8_lossy(message)
                        );
                        return Ok(());
                    }
                    _ => {}
                }
            }
            Err(SocketError::Timeout(_)) => {
                log::warn!("Timed out waiting for data from {dst}, retransmitting last ack");
                sock.send_raw(session.last_ack_bytes(), dst).await?;
            }
            Err(SocketError::Parse(e)) => {
                log::warn!("Ignoring malformed datagram on session with {dst}: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
