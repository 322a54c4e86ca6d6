//! Per-circuit receive buffer. Drivers append raw TCP bytes; the circuit
//! pops complete commands off the head.

use crate::codec::command::Command;
use crate::codec::header::CommandHeader;
use crate::support::{CaError, CaResult, DecodeError, Role};

// Consumed bytes are dropped from the front once they pass this mark.
const COMPACT_THRESHOLD: usize = 4096;

/// Append-only byte buffer with an incremental command decoder at the head.
pub struct RecvBuffer {
    data: Vec<u8>,
    head: usize,
}

impl RecvBuffer {
    #[inline]
    pub fn new() -> RecvBuffer {
        RecvBuffer { data: Vec::new(), head: 0 }
    }

    /// Appends bytes received from the transport.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Pops the next complete command, or `Ok(None)` when the buffer head
    /// holds only part of one.
    ///
    /// An unknown command code is a framing-level failure and leaves the
    /// buffer untouched so the caller can tear the circuit down. A payload
    /// that fails to parse under a valid header consumes the frame and
    /// returns the error, letting the circuit survive a single bad command.
    pub fn try_pop_command(&mut self, sender: Role) -> CaResult<Option<Command>> {
        let buf = &self.data[self.head..];

        let (header, consumed) = match CommandHeader::read(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let total = consumed + header.payload_size as usize;
        if buf.len() < total {
            return Ok(None);
        }

        match Command::decode(&header, &buf[consumed..total], sender) {
            Ok(command) => {
                self.head += total;
                self.compact();
                Ok(Some(command))
            }
            Err(error) => {
                if let CaError::Decode(DecodeError::UnknownCommand(_)) = error {
                    return Err(error);
                }

                self.head += total;
                self.compact();
                Err(error)
            }
        }
    }

    fn compact(&mut self) {
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > COMPACT_THRESHOLD {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
