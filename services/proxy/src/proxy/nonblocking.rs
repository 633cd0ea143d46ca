//! Single-attempt read and write primitives for non-blocking sockets.
//!
//! Both retry on `Interrupted` and report `WouldBlock` as a normal outcome
//! instead of an error.

use std::io::{self, Read, Write};

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were read into the front of the buffer.
    Data(usize),
    /// The peer closed its write side.
    Eof,
    /// Nothing available right now.
    WouldBlock,
}

/// Read once into `buf`.
pub fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) => return Err(e),
        }
    }
}

/// Write once from `bytes`, returning how many were accepted.
///
/// 0 means the socket cannot take anything right now. An empty `bytes`
/// trivially returns 0 without touching the socket.
pub fn write_some<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<usize> {
    if bytes.is_empty() {
        return Ok(0);
    }
    loop {
        match writer.write(bytes) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}
