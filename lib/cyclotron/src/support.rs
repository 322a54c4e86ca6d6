use std::io;

pub type CaResult<T> = Result<T, CaError>;

/// Which side of the protocol an endpoint plays. Command codes are shared
/// between requests and responses, so decoding is keyed on the sender's role.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    #[inline]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Error kinds shared by the codec, the state machines and the PV database.
///
/// `Encode`/`Decode` are wire-level and fatal to their circuit.
/// `LocalProtocol` means the local caller attempted an operation illegal in
/// the current state and never touches the wire; `RemoteProtocol` means the
/// peer sent a command illegal in the current state and is fatal.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CaError {
    Encode(EncodeError),
    Decode(DecodeError),
    LocalProtocol(ProtocolStep),
    RemoteProtocol(ProtocolStep),
    Convert(ConvertError),
    Forbidden,
    Timeout,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EncodeError {
    FieldTooLarge,
    PayloadTooLarge,
    StringTooLong,
    TooManyEnumStates,
    MetadataMismatch,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
    UnknownCommand(u16),
    UnknownChannelType(u16),
    Truncated,
    BadString,
    BadFilter,
    Io(io::ErrorKind),
}

/// The protocol step at which a local or remote violation was detected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolStep {
    HandshakeIncomplete,
    CircuitClosed,
    ChannelNotConnected,
    UnknownChannel,
    UnknownIoid,
    UnknownSubscription,
    UnexpectedCommand,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConvertError {
    BadString,
    NoSuchEnumString,
    TooLong,
    Unencodable,
    SpecialTypeMismatch,
}

impl From<io::Error> for CaError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        CaError::Decode(DecodeError::Io(io_error.kind()))
    }
}

impl From<EncodeError> for CaError {
    #[inline]
    fn from(err: EncodeError) -> Self {
        CaError::Encode(err)
    }
}

impl From<DecodeError> for CaError {
    #[inline]
    fn from(err: DecodeError) -> Self {
        CaError::Decode(err)
    }
}

impl From<ConvertError> for CaError {
    #[inline]
    fn from(err: ConvertError) -> Self {
        CaError::Convert(err)
    }
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source. Payload decoders check this upfront instead of relying on EOF
/// errors mid-struct.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len().saturating_sub(self.position() as usize)
    }
}
