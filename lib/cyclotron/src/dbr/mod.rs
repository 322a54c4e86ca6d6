//! The DBR type system: channel type tags, promotion tables, alarm state and
//! the fixed-size string cells used throughout the wire payloads.

use crate::support::{CaResult, ConvertError, DecodeError};
use std::fmt;
use std::ops::BitOr;

pub mod convert;
pub mod metadata;
pub mod value;

pub use self::metadata::{
    decode_payload, encode_payload, ControlMeta, DbrMetadata, EnumMeta, GraphicsMeta, StsAckMeta, StsMeta, TimeMeta,
    TimeStamp,
};
pub use self::value::DbrValue;

pub const MAX_STRING_SIZE: usize = 40;
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;

/// The seven scalar shapes a channel can natively hold.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NativeType {
    String,
    Int,
    Float,
    Enum,
    Char,
    Long,
    Double,
}

impl NativeType {
    /// Size in bytes of one element of this type on the wire.
    #[inline]
    pub fn element_size(self) -> usize {
        match self {
            NativeType::String => MAX_STRING_SIZE,
            NativeType::Int => 2,
            NativeType::Float => 4,
            NativeType::Enum => 2,
            NativeType::Char => 1,
            NativeType::Long => 4,
            NativeType::Double => 8,
        }
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        match self {
            NativeType::Int | NativeType::Float | NativeType::Char | NativeType::Long | NativeType::Double => true,
            NativeType::String | NativeType::Enum => false,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            NativeType::String => 0,
            NativeType::Int => 1,
            NativeType::Float => 2,
            NativeType::Enum => 3,
            NativeType::Char => 4,
            NativeType::Long => 5,
            NativeType::Double => 6,
        }
    }
}

/// Metadata variant of a promoted channel type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Variant {
    Native,
    Sts,
    Time,
    Gr,
    Ctrl,
}

// Promotion is table-driven: row = variant, column = native index.
const PROMOTION: [[ChannelType; 7]; 5] = [
    [
        ChannelType::String,
        ChannelType::Int,
        ChannelType::Float,
        ChannelType::Enum,
        ChannelType::Char,
        ChannelType::Long,
        ChannelType::Double,
    ],
    [
        ChannelType::StsString,
        ChannelType::StsInt,
        ChannelType::StsFloat,
        ChannelType::StsEnum,
        ChannelType::StsChar,
        ChannelType::StsLong,
        ChannelType::StsDouble,
    ],
    [
        ChannelType::TimeString,
        ChannelType::TimeInt,
        ChannelType::TimeFloat,
        ChannelType::TimeEnum,
        ChannelType::TimeChar,
        ChannelType::TimeLong,
        ChannelType::TimeDouble,
    ],
    [
        ChannelType::GrString,
        ChannelType::GrInt,
        ChannelType::GrFloat,
        ChannelType::GrEnum,
        ChannelType::GrChar,
        ChannelType::GrLong,
        ChannelType::GrDouble,
    ],
    [
        ChannelType::CtrlString,
        ChannelType::CtrlInt,
        ChannelType::CtrlFloat,
        ChannelType::CtrlEnum,
        ChannelType::CtrlChar,
        ChannelType::CtrlLong,
        ChannelType::CtrlDouble,
    ],
];

/// A DBR type tag as it appears in the `data_type` header field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ChannelType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,

    StsString = 7,
    StsInt = 8,
    StsFloat = 9,
    StsEnum = 10,
    StsChar = 11,
    StsLong = 12,
    StsDouble = 13,

    TimeString = 14,
    TimeInt = 15,
    TimeFloat = 16,
    TimeEnum = 17,
    TimeChar = 18,
    TimeLong = 19,
    TimeDouble = 20,

    GrString = 21,
    GrInt = 22,
    GrFloat = 23,
    GrEnum = 24,
    GrChar = 25,
    GrLong = 26,
    GrDouble = 27,

    CtrlString = 28,
    CtrlInt = 29,
    CtrlFloat = 30,
    CtrlEnum = 31,
    CtrlChar = 32,
    CtrlLong = 33,
    CtrlDouble = 34,

    PutAckt = 35,
    PutAcks = 36,
    StsackString = 37,
    ClassName = 38,
}

impl ChannelType {
    pub fn from_wire(raw: u16) -> CaResult<ChannelType> {
        use self::ChannelType::*;

        Ok(match raw {
            0 => String,
            1 => Int,
            2 => Float,
            3 => Enum,
            4 => Char,
            5 => Long,
            6 => Double,
            7 => StsString,
            8 => StsInt,
            9 => StsFloat,
            10 => StsEnum,
            11 => StsChar,
            12 => StsLong,
            13 => StsDouble,
            14 => TimeString,
            15 => TimeInt,
            16 => TimeFloat,
            17 => TimeEnum,
            18 => TimeChar,
            19 => TimeLong,
            20 => TimeDouble,
            21 => GrString,
            22 => GrInt,
            23 => GrFloat,
            24 => GrEnum,
            25 => GrChar,
            26 => GrLong,
            27 => GrDouble,
            28 => CtrlString,
            29 => CtrlInt,
            30 => CtrlFloat,
            31 => CtrlEnum,
            32 => CtrlChar,
            33 => CtrlLong,
            34 => CtrlDouble,
            35 => PutAckt,
            36 => PutAcks,
            37 => StsackString,
            38 => ClassName,
            other => return Err(DecodeError::UnknownChannelType(other).into()),
        })
    }

    #[inline]
    pub fn wire_value(self) -> u16 {
        self as u16
    }

    /// The base scalar type of this tag. Total over all tags: the ack
    /// specials carry u16 payloads, the string specials carry string cells.
    pub fn native(self) -> NativeType {
        use self::ChannelType::*;

        match self {
            String | StsString | TimeString | GrString | CtrlString | StsackString | ClassName => NativeType::String,
            Int | StsInt | TimeInt | GrInt | CtrlInt => NativeType::Int,
            Float | StsFloat | TimeFloat | GrFloat | CtrlFloat => NativeType::Float,
            Enum | StsEnum | TimeEnum | GrEnum | CtrlEnum | PutAckt | PutAcks => NativeType::Enum,
            Char | StsChar | TimeChar | GrChar | CtrlChar => NativeType::Char,
            Long | StsLong | TimeLong | GrLong | CtrlLong => NativeType::Long,
            Double | StsDouble | TimeDouble | GrDouble | CtrlDouble => NativeType::Double,
        }
    }

    pub fn variant(self) -> Variant {
        let raw = self.wire_value();

        match raw {
            0..=6 => Variant::Native,
            7..=13 => Variant::Sts,
            14..=20 => Variant::Time,
            21..=27 => Variant::Gr,
            28..=34 => Variant::Ctrl,
            // Specials carry their metadata (if any) as part of their own
            // fixed layout.
            _ => Variant::Native,
        }
    }

    /// Promotes a native type to the requested metadata variant.
    #[inline]
    pub fn promote(native: NativeType, variant: Variant) -> ChannelType {
        let row = match variant {
            Variant::Native => 0,
            Variant::Sts => 1,
            Variant::Time => 2,
            Variant::Gr => 3,
            Variant::Ctrl => 4,
        };

        PROMOTION[row][native.index()]
    }

    #[inline]
    pub fn is_special(self) -> bool {
        self.wire_value() >= ChannelType::PutAckt.wire_value()
    }

    #[inline]
    pub fn element_size(self) -> usize {
        self.native().element_size()
    }

    /// Number of metadata bytes preceding the first value element.
    pub fn metadata_size(self) -> usize {
        use self::ChannelType::*;

        match self {
            String | Int | Float | Enum | Char | Long | Double => 0,

            StsString | StsInt | StsFloat | StsEnum | StsLong => 4,
            StsChar => 5,
            StsDouble => 8,

            TimeString | TimeFloat | TimeLong => 12,
            TimeInt | TimeEnum => 14,
            TimeChar => 15,
            TimeDouble => 16,

            // There is no GR or CTRL layout for strings; both reuse STS.
            GrString | CtrlString => 4,
            GrInt => 24,
            GrFloat => 40,
            GrEnum | CtrlEnum => 422,
            GrChar => 19,
            GrLong => 36,
            GrDouble => 64,

            CtrlInt => 28,
            CtrlFloat => 48,
            CtrlChar => 21,
            CtrlLong => 44,
            CtrlDouble => 80,

            PutAckt | PutAcks | ClassName => 0,
            StsackString => 8,
        }
    }

    /// Total payload size for `count` elements, before 8-byte padding.
    #[inline]
    pub fn payload_size(self, count: usize) -> usize {
        self.metadata_size() + self.element_size() * count
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(i16)]
pub enum AlarmSeverity {
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

impl AlarmSeverity {
    pub fn from_raw(raw: i16) -> CaResult<AlarmSeverity> {
        Ok(match raw {
            0 => AlarmSeverity::NoAlarm,
            1 => AlarmSeverity::Minor,
            2 => AlarmSeverity::Major,
            3 => AlarmSeverity::Invalid,
            _ => return Err(DecodeError::Truncated.into()),
        })
    }
}

impl Default for AlarmSeverity {
    #[inline]
    fn default() -> AlarmSeverity {
        AlarmSeverity::NoAlarm
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(i16)]
pub enum AlarmStatus {
    NoAlarm = 0,
    Read = 1,
    Write = 2,
    HiHi = 3,
    High = 4,
    LoLo = 5,
    Low = 6,
    State = 7,
    Cos = 8,
    Comm = 9,
    Timeout = 10,
    HwLimit = 11,
    Calc = 12,
    Scan = 13,
    Link = 14,
    Soft = 15,
    BadSub = 16,
    Udf = 17,
    Disable = 18,
    Simm = 19,
    ReadAccess = 20,
    WriteAccess = 21,
}

impl AlarmStatus {
    pub fn from_raw(raw: i16) -> CaResult<AlarmStatus> {
        use self::AlarmStatus::*;

        Ok(match raw {
            0 => NoAlarm,
            1 => Read,
            2 => Write,
            3 => HiHi,
            4 => High,
            5 => LoLo,
            6 => Low,
            7 => State,
            8 => Cos,
            9 => Comm,
            10 => Timeout,
            11 => HwLimit,
            12 => Calc,
            13 => Scan,
            14 => Link,
            15 => Soft,
            16 => BadSub,
            17 => Udf,
            18 => Disable,
            19 => Simm,
            20 => ReadAccess,
            21 => WriteAccess,
            _ => return Err(DecodeError::Truncated.into()),
        })
    }
}

impl Default for AlarmStatus {
    #[inline]
    fn default() -> AlarmStatus {
        AlarmStatus::NoAlarm
    }
}

/// Channel access rights. On the wire only bits 0 (read) and 1 (write) are
/// defined; higher bits are ignored on decode and never set on encode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessRights {
    None,
    Read,
    Write,
    ReadWrite,
}

impl AccessRights {
    #[inline]
    pub fn from_bits(raw: u32) -> AccessRights {
        match raw & 0b11 {
            0 => AccessRights::None,
            1 => AccessRights::Read,
            2 => AccessRights::Write,
            _ => AccessRights::ReadWrite,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            AccessRights::None => 0,
            AccessRights::Read => 1,
            AccessRights::Write => 2,
            AccessRights::ReadWrite => 3,
        }
    }

    #[inline]
    pub fn can_read(self) -> bool {
        self.bits() & 1 != 0
    }

    #[inline]
    pub fn can_write(self) -> bool {
        self.bits() & 2 != 0
    }
}

/// Subscription event mask.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EventMask(pub u16);

impl EventMask {
    pub const VALUE: EventMask = EventMask(1);
    pub const LOG: EventMask = EventMask(2);
    pub const ALARM: EventMask = EventMask(4);
    pub const PROPERTY: EventMask = EventMask(8);

    #[inline]
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    #[inline]
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// A fixed 40-byte NUL-padded string cell.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EpicsString(pub [u8; MAX_STRING_SIZE]);

impl EpicsString {
    /// Builds a cell from raw bytes; input longer than 39 bytes (one byte is
    /// reserved for the terminator) is rejected.
    pub fn from_bytes(bytes: &[u8]) -> CaResult<EpicsString> {
        if bytes.len() >= MAX_STRING_SIZE {
            return Err(ConvertError::TooLong.into());
        }

        let mut cell = [0u8; MAX_STRING_SIZE];
        cell[..bytes.len()].copy_from_slice(bytes);

        Ok(EpicsString(cell))
    }

    /// The contents up to (excluding) the first NUL.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(MAX_STRING_SIZE);
        &self.0[..end]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl Default for EpicsString {
    #[inline]
    fn default() -> EpicsString {
        EpicsString([0u8; MAX_STRING_SIZE])
    }
}

impl fmt::Debug for EpicsString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EpicsString({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}
