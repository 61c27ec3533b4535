// Per-transfer state machines.
//
// A session owns its open file handle and the block counter for one
// transfer, and nothing else: no sockets, no addresses. The session
// runner feeds it received packets and asks it for packets to send. Both
// machines run in lock step with the peer, one block in flight at a
// time, which is what makes timeout-driven retransmission safe.

use crate::tftp::{Packet, BLOCK_SIZE};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Server-side state for one read transfer (the server sends a file).
#[derive(Debug)]
pub struct ReadSession {
    file: File,
    next_block: u16,
    block_buffer: [u8; BLOCK_SIZE],
    block_len: usize,
    block_loaded: bool,
    eof_seen: bool,
    finished: bool,
}

impl ReadSession {
    /// Opens `path` for reading. The handle is owned exclusively by the
    /// session and released when it is dropped.
    pub async fn open(path: &Path) -> Result<ReadSession, io::Error> {
        let file = File::open(path).await?;
        Ok(ReadSession {
            file,
            next_block: 1,
            block_buffer: [0; BLOCK_SIZE],
            block_len: 0,
            block_loaded: false,
            eof_seen: false,
            finished: false,
        })
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Returns the data packet for the block currently in flight, loading
    /// it from the file on first use, or `None` once the final block has
    /// been acknowledged. The packet borrows the session's block buffer
    /// and is valid until the next mutating call.
    pub async fn next_packet(&mut self) -> Result<Option<Packet<'_>>, io::Error> {
        if self.finished {
            return Ok(None);
        }

        if !self.block_loaded {
            self.block_len = read_block(&mut self.file, &mut self.block_buffer).await?;
            self.block_loaded = true;
            // read_block loops over short reads, so a partial count can
            // only mean end of file. An exact-multiple file still gets an
            // explicit zero-length final block.
            if self.block_len < BLOCK_SIZE {
                self.eof_seen = true;
            }
        }

        Ok(Some(Packet::Data {
            block: self.next_block,
            payload: &self.block_buffer[..self.block_len],
        }))
    }

    /// Advances past the block in flight when `block` acknowledges it.
    /// Duplicate, future and stray acks return false and leave the
    /// session untouched; the runner retransmits on timeout instead.
    pub fn handle_ack(&mut self, block: u16) -> bool {
        if self.finished || block != self.next_block {
            return false;
        }

        if self.eof_seen {
            self.finished = true;
        } else {
            self.next_block = self.next_block.wrapping_add(1);
            self.block_loaded = false;
        }
        true
    }
}

/// Fills `buf` from the file, looping over short reads so that a count
/// below the buffer length only ever means end of file.
async fn read_block(f: &mut File, buf: &mut [u8]) -> Result<usize, io::Error> {
    let mut cursor = 0;
    while cursor < buf.len() {
        match f.read(&mut buf[cursor..]).await? {
            0 => break,
            n => cursor += n,
        }
    }
    Ok(cursor)
}

/// Server-side state for one write transfer (the server receives a file).
#[derive(Debug)]
pub struct WriteSession {
    file: File,
    next_expected: u16,
    finished: bool,
    last_ack: [u8; 4],
}

impl WriteSession {
    /// Creates the target file, failing when it already exists. The ack
    /// for the request itself (block 0) is staged for sending.
    pub async fn create(path: &Path) -> Result<WriteSession, io::Error> {
        let file = File::create_new(path).await?;
        Ok(WriteSession {
            file,
            next_expected: 1,
            finished: false,
            last_ack: ack_bytes(0),
        })
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// The serialized most recent ack, kept for retransmission.
    pub fn last_ack_bytes(&self) -> &[u8] {
        &self.last_ack
    }

    /// Consumes one data packet. Returns true when an ack should be sent
    /// (available via [`last_ack_bytes`](Self::last_ack_bytes)): either
    /// the expected block was written, or an already-accepted block was
    /// re-acknowledged without touching the file. A block from the future
    /// returns false and is dropped; the peer retransmits the missing
    /// one.
    pub async fn handle_data(&mut self, block: u16, payload: &[u8]) -> Result<bool, io::Error> {
        if payload.len() > BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "data block exceeds 512 bytes",
            ));
        }

        if block == self.next_expected {
            write_block(&mut self.file, payload).await?;
            if payload.len() < BLOCK_SIZE {
                // Final block: everything must reach the file before the
                // ack that lets the peer walk away.
                self.file.flush().await?;
                self.finished = true;
            }
            self.next_expected = self.next_expected.wrapping_add(1);
            self.last_ack = ack_bytes(block);
            Ok(true)
        } else if block < self.next_expected {
            // The peer retransmitted a block we already have. Re-ack it
            // without rewriting, otherwise a lost ack turns into the
            // sorcerer's-apprentice duplication cascade.
            self.last_ack = ack_bytes(block);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

async fn write_block(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    let mut cursor = 0;
    while cursor < buf.len() {
        cursor += f.write(&buf[cursor..]).await?;
    }
    Ok(())
}

fn ack_bytes(block: u16) -> [u8; 4] {
    let mut buf = [0_u8; 4];
    // An ack is exactly four bytes; serialization cannot fail here.
    let len = Packet::Ack { block }
        .serialize(&mut buf)
        .expect("ack fits in a 4-byte buffer");
    debug_assert_eq!(len, buf.len());
    buf
}
