//! Byte ↔ typed-command translation. Stateless apart from the receive
//! buffer, which only tracks how much of the head has been consumed.

pub mod buffer;
pub mod command;
pub mod header;

pub use self::buffer::RecvBuffer;
pub use self::command::{eca, Command, DataPayload};
pub use self::header::{CommandHeader, EXTENDED_HEADER_SIZE, HEADER_SIZE};

use crate::support::{CaResult, DecodeError, Role};

/// Decodes a whole UDP datagram: a sequence of complete commands. Truncation
/// anywhere invalidates the entire datagram.
pub fn decode_datagram(bytes: &[u8], sender: Role) -> CaResult<Vec<Command>> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let (header, consumed) = match CommandHeader::read(&bytes[offset..])? {
            Some(parsed) => parsed,
            None => return Err(DecodeError::Truncated.into()),
        };

        let total = consumed + header.payload_size as usize;
        if bytes.len() - offset < total {
            return Err(DecodeError::Truncated.into());
        }

        commands.push(Command::decode(&header, &bytes[offset + consumed..offset + total], sender)?);
        offset += total;
    }

    Ok(commands)
}
