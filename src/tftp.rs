use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram a session ever produces: 2-byte opcode, 2-byte block
/// number, 512 payload bytes.
pub const MAX_PACKET_LEN: usize = 516;

/// Payload bytes carried per data block. A block shorter than this ends
/// the transfer.
pub const BLOCK_SIZE: usize = 512;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a failure to interpret a received datagram as a TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram is truncated or missing a required NUL terminator.
    InvalidPacket,
    /// The opcode field holds a value outside 1..=5.
    InvalidOpcode(u16),
    /// The mode identifier in a request is not netascii, octet or mail.
    InvalidMode,
}

impl error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::InvalidPacket => write!(f, "malformed packet"),
            ParseError::InvalidOpcode(op) => write!(f, "unknown opcode: {op}"),
            ParseError::InvalidMode => write!(f, "unknown transfer mode"),
        }
    }
}

/// The caller-provided output buffer cannot hold the serialized packet.
/// Session code always passes [`MAX_PACKET_LEN`] bytes, so hitting this
/// indicates a caller bug rather than a protocol condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTooSmall;

impl error::Error for BufferTooSmall {}

impl fmt::Display for BufferTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "output buffer too small for packet")
    }
}

/// Represents an error returned from the TFTP socket wrapper.
#[derive(Debug)]
pub enum SocketError {
    Io(io::Error),
    Parse(ParseError),
    Encode(BufferTooSmall),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "socket IO error: {e}"),
            SocketError::Parse(e) => write!(f, "packet parsing error: {e}"),
            SocketError::Encode(e) => write!(f, "packet encoding error: {e}"),
            SocketError::Timeout(e) => write!(f, "socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

impl From<ParseError> for SocketError {
    fn from(e: ParseError) -> Self {
        SocketError::Parse(e)
    }
}

impl From<BufferTooSmall> for SocketError {
    fn from(e: BufferTooSmall) -> Self {
        SocketError::Encode(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Wire-format tags

/// Represents the mode for a file the client wishes to read or write.
///
/// Matched case-insensitively on input; the canonical lowercase form is
/// written on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Netascii,
    Octet,
    Mail,
}

impl FileMode {
    fn from_wire(raw: &[u8]) -> Result<FileMode, ParseError> {
        if raw.eq_ignore_ascii_case(b"netascii") {
            Ok(FileMode::Netascii)
        } else if raw.eq_ignore_ascii_case(b"octet") {
            Ok(FileMode::Octet)
        } else if raw.eq_ignore_ascii_case(b"mail") {
            Ok(FileMode::Mail)
        } else {
            Err(ParseError::InvalidMode)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Netascii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    Illegal = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    /// Codes outside the RFC range degrade to `Undefined`; parsing an
    /// error packet never fails on its code field.
    fn from(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

///////////////////////////////////////////////////////////////
// Packets

/// An enum representing a TFTP packet and its associated data.
///
/// Parsed packets borrow the datagram buffer they were read from, so a
/// packet is only valid while that buffer lives. Filename, mode and error
/// message are NUL-delimited on the wire and therefore never contain an
/// embedded NUL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// A read request packet.
    ReadReq {
        /// The file the client wants to read, as raw wire bytes.
        filename: &'a [u8],

        /// The transfer mode.
        mode: FileMode,
    },

    /// A write request packet.
    WriteReq {
        filename: &'a [u8],
        mode: FileMode,
    },

    /// A data packet.
    Data {
        /// The block number for this data packet, 1-indexed.
        block: u16,

        /// The payload, at most [`BLOCK_SIZE`] bytes.
        payload: &'a [u8],
    },

    /// An acknowledgment packet.
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: &'a [u8],
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Splits a request body into its filename and mode, each bounded by its
/// NUL terminator. Either missing terminator makes the packet invalid.
fn parse_request_body(body: &[u8]) -> Result<(&[u8], FileMode), ParseError> {
    let name_end = body
        .iter()
        .position(|&b| b == 0x00)
        .ok_or(ParseError::InvalidPacket)?;
    let rest = &body[name_end + 1..];
    let mode_end = rest
        .iter()
        .position(|&b| b == 0x00)
        .ok_or(ParseError::InvalidPacket)?;

    let mode = FileMode::from_wire(&rest[..mode_end])?;
    Ok((&body[..name_end], mode))
}

impl<'a> Packet<'a> {
    /// Parses one datagram. The returned packet borrows `buf`.
    pub fn parse(buf: &'a [u8]) -> Result<Packet<'a>, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidPacket);
        }

        match u16_from_buffer(&buf[..2]) {
            1 => {
                let (filename, mode) = parse_request_body(&buf[2..])?;
                Ok(Packet::ReadReq { filename, mode })
            }
            2 => {
                let (filename, mode) = parse_request_body(&buf[2..])?;
                Ok(Packet::WriteReq { filename, mode })
            }
            3 => {
                if buf.len() < 4 {
                    return Err(ParseError::InvalidPacket);
                }
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    payload: &buf[4..],
                })
            }
            4 => {
                if buf.len() < 4 {
                    return Err(ParseError::InvalidPacket);
                }
                // Trailing bytes after the block number are ignored.
                Ok(Packet::Ack {
                    block: u16_from_buffer(&buf[2..4]),
                })
            }
            5 => {
                if buf.len() < 4 {
                    return Err(ParseError::InvalidPacket);
                }
                let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
                let body = &buf[4..];
                let msg_end = body
                    .iter()
                    .position(|&b| b == 0x00)
                    .ok_or(ParseError::InvalidPacket)?;
                Ok(Packet::Error {
                    code,
                    message: &body[..msg_end],
                })
            }
            op => Err(ParseError::InvalidOpcode(op)),
        }
    }

    /// Serializes this packet into `buf`, returning the number of bytes
    /// written. A [`MAX_PACKET_LEN`] buffer is always large enough for
    /// session traffic.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, BufferTooSmall> {
        let mut w = Writer { buf, pos: 0 };
        match *self {
            Packet::ReadReq { filename, mode } => {
                w.put_u16(1)?;
                w.put(filename)?;
                w.put(&[0x00])?;
                w.put(mode.as_str().as_bytes())?;
                w.put(&[0x00])?;
            }
            Packet::WriteReq { filename, mode } => {
                w.put_u16(2)?;
                w.put(filename)?;
                w.put(&[0x00])?;
                w.put(mode.as_str().as_bytes())?;
                w.put(&[0x00])?;
            }
            Packet::Data { block, payload } => {
                w.put_u16(3)?;
                w.put_u16(block)?;
                w.put(payload)?;
            }
            Packet::Ack { block } => {
                w.put_u16(4)?;
                w.put_u16(block)?;
            }
            Packet::Error { code, message } => {
                w.put_u16(5)?;
                w.put_u16(code as u16)?;
                w.put(message)?;
                w.put(&[0x00])?;
            }
        }
        Ok(w.pos)
    }
}

/// Bounds-checked sequential writer over a caller-provided buffer.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), BufferTooSmall> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u16(&mut self, val: u16) -> Result<(), BufferTooSmall> {
        self.put(&val.to_be_bytes())
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    /// Serializes `packet` into a scratch buffer and sends it to `dst`.
    pub async fn send(&self, packet: &Packet<'_>, dst: SocketAddr) -> TftpResult<()> {
        let mut buf = [0_u8; MAX_PACKET_LEN];
        let len = packet.serialize(&mut buf)?;
        self.sock.send_to(&buf[..len], dst).await?;
        Ok(())
    }

    /// Sends already-serialized packet bytes, used when retransmitting.
    pub async fn send_raw(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Receives one datagram into `buf` and parses it. The returned
    /// packet borrows `buf`.
    pub async fn recv_with_timeout<'b>(
        &self,
        buf: &'b mut [u8],
        ttl: Duration,
    ) -> TftpResult<(Packet<'b>, SocketAddr)> {
        let (total_written, src) = timeout(ttl, self.sock.recv_from(buf)).await??;

        let packet = Packet::parse(&buf[..total_written])?;
        Ok((packet, src))
    }
}
