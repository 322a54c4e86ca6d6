//! The fixed 16-byte command header and its 24-byte extended form.

use crate::support::CaResult;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

pub const HEADER_SIZE: usize = 16;
pub const EXTENDED_HEADER_SIZE: usize = 24;

// payload_size == MARKER with data_count == 0 announces the extended form.
const EXTENDED_MARKER: u16 = 0xffff;

/// The wire header: { command, payload_size, data_type, data_count,
/// parameter1, parameter2 }, all big-endian. `payload_size` is the padded
/// payload length (a multiple of 8).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CommandHeader {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub param1: u32,
    pub param2: u32,
}

impl CommandHeader {
    #[inline]
    pub fn new(command: u16, payload_size: u32, data_type: u16, data_count: u32, param1: u32, param2: u32) -> CommandHeader {
        CommandHeader { command, payload_size, data_type, data_count, param1, param2 }
    }

    /// True when either size field overflows the 16-bit header form.
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.payload_size >= u32::from(EXTENDED_MARKER) || self.data_count >= u32::from(EXTENDED_MARKER)
    }

    /// Serialized header length: 16, or 24 for the extended form.
    #[inline]
    pub fn encoded_size(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn write<W: io::Write>(&self, stream: &mut W) -> CaResult<()> {
        stream.write_u16::<BigEndian>(self.command)?;

        if self.is_extended() {
            stream.write_u16::<BigEndian>(EXTENDED_MARKER)?;
            stream.write_u16::<BigEndian>(self.data_type)?;
            stream.write_u16::<BigEndian>(0)?;
            stream.write_u32::<BigEndian>(self.param1)?;
            stream.write_u32::<BigEndian>(self.param2)?;
            stream.write_u32::<BigEndian>(self.payload_size)?;
            stream.write_u32::<BigEndian>(self.data_count)?;
        } else {
            stream.write_u16::<BigEndian>(self.payload_size as u16)?;
            stream.write_u16::<BigEndian>(self.data_type)?;
            stream.write_u16::<BigEndian>(self.data_count as u16)?;
            stream.write_u32::<BigEndian>(self.param1)?;
            stream.write_u32::<BigEndian>(self.param2)?;
        }

        Ok(())
    }

    /// Decodes a header from the front of `buf`. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete (possibly extended) header, and
    /// `(header, consumed)` otherwise.
    pub fn read(buf: &[u8]) -> CaResult<Option<(CommandHeader, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = Cursor::new(buf);
        let command = cursor.read_u16::<BigEndian>()?;
        let payload_size = cursor.read_u16::<BigEndian>()?;
        let data_type = cursor.read_u16::<BigEndian>()?;
        let data_count = cursor.read_u16::<BigEndian>()?;
        let param1 = cursor.read_u32::<BigEndian>()?;
        let param2 = cursor.read_u32::<BigEndian>()?;

        if payload_size == EXTENDED_MARKER && data_count == 0 {
            if buf.len() < EXTENDED_HEADER_SIZE {
                return Ok(None);
            }

            let payload_size = cursor.read_u32::<BigEndian>()?;
            let data_count = cursor.read_u32::<BigEndian>()?;

            return Ok(Some((
                CommandHeader { command, payload_size, data_type, data_count, param1, param2 },
                EXTENDED_HEADER_SIZE,
            )));
        }

        Ok(Some((
            CommandHeader {
                command,
                payload_size: u32::from(payload_size),
                data_type,
                data_count: u32::from(data_count),
                param1,
                param2,
            },
            HEADER_SIZE,
        )))
    }
}

/// Rounds a raw payload length up to the 8-byte command boundary.
#[inline]
pub fn padded_size(raw: usize) -> usize {
    (raw + 7) & !7
}
