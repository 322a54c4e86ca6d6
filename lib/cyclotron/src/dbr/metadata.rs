//! DBR metadata blocks and their byte-exact wire layouts, including the
//! RISC alignment pads inherited from db_access.h.

use crate::dbr::{
    AlarmSeverity, AlarmStatus, ChannelType, DbrValue, NativeType, MAX_ENUM_STATES, MAX_ENUM_STRING_SIZE,
    MAX_UNITS_SIZE,
};
use crate::support::{CaResult, DecodeError, EncodeError, SizedRead};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lattice::time;
use std::io;

/// EPICS epoch timestamp: seconds and nanoseconds since 1990-01-01 UTC.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct TimeStamp {
    pub secs: u32,
    pub nsec: u32,
}

impl TimeStamp {
    #[inline]
    pub fn now() -> TimeStamp {
        TimeStamp::from_posix(time::timestamp_posix())
    }

    #[inline]
    pub fn from_posix(posix: f64) -> TimeStamp {
        let (secs, nsec) = time::posix_to_epics(posix);
        TimeStamp { secs, nsec }
    }

    #[inline]
    pub fn to_posix(self) -> f64 {
        time::epics_to_posix(self.secs, self.nsec)
    }

    fn write<W: io::Write>(self, stream: &mut W) -> CaResult<()> {
        stream.write_u32::<BigEndian>(self.secs)?;
        stream.write_u32::<BigEndian>(self.nsec)?;
        Ok(())
    }

    fn read<R: SizedRead>(stream: &mut R) -> CaResult<TimeStamp> {
        Ok(TimeStamp {
            secs: stream.read_u32::<BigEndian>()?,
            nsec: stream.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct StsMeta {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct TimeMeta {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub stamp: TimeStamp,
}

/// Graphics block: units, precision (float/double layouts only) and the six
/// display/alarm/warning limits. Limits are held as host doubles and written
/// in the native type of the enclosing DBR tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphicsMeta {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub precision: i16,
    pub units: [u8; MAX_UNITS_SIZE],
    pub upper_disp_limit: f64,
    pub lower_disp_limit: f64,
    pub upper_alarm_limit: f64,
    pub upper_warning_limit: f64,
    pub lower_warning_limit: f64,
    pub lower_alarm_limit: f64,
}

impl GraphicsMeta {
    #[inline]
    fn display_limits(&self) -> [f64; 6] {
        [
            self.upper_disp_limit,
            self.lower_disp_limit,
            self.upper_alarm_limit,
            self.upper_warning_limit,
            self.lower_warning_limit,
            self.lower_alarm_limit,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlMeta {
    pub graphics: GraphicsMeta,
    pub upper_ctrl_limit: f64,
    pub lower_ctrl_limit: f64,
}

/// Metadata for GR_ENUM/CTRL_ENUM: the enum state strings replace the limit
/// blocks entirely.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnumMeta {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub strings: Vec<[u8; MAX_ENUM_STRING_SIZE]>,
}

/// STSACK_STRING block: alarm acknowledgment state.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct StsAckMeta {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub ack_transient: bool,
    pub severity_to_acknowledge: AlarmSeverity,
}

/// The metadata block preceding the value elements of a DBR payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DbrMetadata {
    Plain,
    Sts(StsMeta),
    Time(TimeMeta),
    Graphics(GraphicsMeta),
    Control(ControlMeta),
    Enum(EnumMeta),
    StsAck(StsAckMeta),
}

impl Default for DbrMetadata {
    #[inline]
    fn default() -> DbrMetadata {
        DbrMetadata::Plain
    }
}

// The single layout table: every (native, variant) pair resolves to one of
// these shapes. Pad counts are the db_access.h RISC pads.
enum MetaLayout {
    Plain,
    Sts { pad: usize },
    Time { pad: usize },
    Graphics { precision: bool, trailing_pad: bool },
    Control { precision: bool, trailing_pad: bool },
    EnumStrings,
    StsAck,
}

fn meta_layout(dtype: ChannelType) -> MetaLayout {
    use crate::dbr::ChannelType::*;

    match dtype {
        String | Int | Float | Enum | Char | Long | Double | PutAckt | PutAcks | ClassName => MetaLayout::Plain,

        StsString | StsInt | StsFloat | StsEnum | StsLong | GrString | CtrlString => MetaLayout::Sts { pad: 0 },
        StsChar => MetaLayout::Sts { pad: 1 },
        StsDouble => MetaLayout::Sts { pad: 4 },

        TimeString | TimeFloat | TimeLong => MetaLayout::Time { pad: 0 },
        TimeInt | TimeEnum => MetaLayout::Time { pad: 2 },
        TimeChar => MetaLayout::Time { pad: 3 },
        TimeDouble => MetaLayout::Time { pad: 4 },

        GrInt | GrLong => MetaLayout::Graphics { precision: false, trailing_pad: false },
        GrChar => MetaLayout::Graphics { precision: false, trailing_pad: true },
        GrFloat | GrDouble => MetaLayout::Graphics { precision: true, trailing_pad: false },

        CtrlInt | CtrlLong => MetaLayout::Control { precision: false, trailing_pad: false },
        CtrlChar => MetaLayout::Control { precision: false, trailing_pad: true },
        CtrlFloat | CtrlDouble => MetaLayout::Control { precision: true, trailing_pad: false },

        GrEnum | CtrlEnum => MetaLayout::EnumStrings,
        StsackString => MetaLayout::StsAck,
    }
}

const ZERO_PAD: [u8; 4] = [0u8; 4];

fn write_limit<W: io::Write>(native: NativeType, value: f64, stream: &mut W) -> CaResult<()> {
    match native {
        NativeType::Int => stream.write_i16::<BigEndian>(value as i16)?,
        NativeType::Char => stream.write_u8(value as u8)?,
        NativeType::Long => stream.write_i32::<BigEndian>(value as i32)?,
        NativeType::Float => stream.write_f32::<BigEndian>(value as f32)?,
        NativeType::Double => stream.write_f64::<BigEndian>(value)?,
        NativeType::String | NativeType::Enum => return Err(EncodeError::MetadataMismatch.into()),
    }

    Ok(())
}

fn read_limit<R: SizedRead>(native: NativeType, stream: &mut R) -> CaResult<f64> {
    Ok(match native {
        NativeType::Int => f64::from(stream.read_i16::<BigEndian>()?),
        NativeType::Char => f64::from(stream.read_u8()?),
        NativeType::Long => f64::from(stream.read_i32::<BigEndian>()?),
        NativeType::Float => f64::from(stream.read_f32::<BigEndian>()?),
        NativeType::Double => stream.read_f64::<BigEndian>()?,
        NativeType::String | NativeType::Enum => return Err(DecodeError::Truncated.into()),
    })
}

fn write_alarm_pair<W: io::Write>(status: AlarmStatus, severity: AlarmSeverity, stream: &mut W) -> CaResult<()> {
    stream.write_i16::<BigEndian>(status as i16)?;
    stream.write_i16::<BigEndian>(severity as i16)?;
    Ok(())
}

fn read_alarm_pair<R: SizedRead>(stream: &mut R) -> CaResult<(AlarmStatus, AlarmSeverity)> {
    let status = AlarmStatus::from_raw(stream.read_i16::<BigEndian>()?)?;
    let severity = AlarmSeverity::from_raw(stream.read_i16::<BigEndian>()?)?;
    Ok((status, severity))
}

fn write_graphics<W: io::Write>(
    meta: &GraphicsMeta,
    native: NativeType,
    precision: bool,
    stream: &mut W,
) -> CaResult<()> {
    write_alarm_pair(meta.status, meta.severity, stream)?;

    if precision {
        stream.write_i16::<BigEndian>(meta.precision)?;
        stream.write_all(&ZERO_PAD[..2])?;
    }

    stream.write_all(&meta.units)?;

    for limit in &meta.display_limits() {
        write_limit(native, *limit, stream)?;
    }

    Ok(())
}

fn read_graphics<R: SizedRead>(native: NativeType, precision: bool, stream: &mut R) -> CaResult<GraphicsMeta> {
    let (status, severity) = read_alarm_pair(stream)?;

    let precision = if precision {
        let value = stream.read_i16::<BigEndian>()?;
        stream.read_i16::<BigEndian>()?;
        value
    } else {
        0
    };

    let mut units = [0u8; MAX_UNITS_SIZE];
    stream.read_exact(&mut units)?;

    let mut limits = [0f64; 6];
    for limit in limits.iter_mut() {
        *limit = read_limit(native, stream)?;
    }

    Ok(GraphicsMeta {
        status,
        severity,
        precision,
        units,
        upper_disp_limit: limits[0],
        lower_disp_limit: limits[1],
        upper_alarm_limit: limits[2],
        upper_warning_limit: limits[3],
        lower_warning_limit: limits[4],
        lower_alarm_limit: limits[5],
    })
}

impl DbrMetadata {
    /// Timestamp carried by this block, if any.
    #[inline]
    pub fn stamp(&self) -> Option<TimeStamp> {
        match self {
            DbrMetadata::Time(meta) => Some(meta.stamp),
            _ => None,
        }
    }

    /// Writes exactly `dtype.metadata_size()` bytes. The block variant must
    /// match the layout the tag calls for.
    pub fn write<W: io::Write>(&self, dtype: ChannelType, stream: &mut W) -> CaResult<()> {
        let native = dtype.native();

        match (meta_layout(dtype), self) {
            (MetaLayout::Plain, DbrMetadata::Plain) => Ok(()),

            (MetaLayout::Sts { pad }, DbrMetadata::Sts(meta)) => {
                write_alarm_pair(meta.status, meta.severity, stream)?;
                stream.write_all(&ZERO_PAD[..pad])?;
                Ok(())
            }

            (MetaLayout::Time { pad }, DbrMetadata::Time(meta)) => {
                write_alarm_pair(meta.status, meta.severity, stream)?;
                meta.stamp.write(stream)?;
                stream.write_all(&ZERO_PAD[..pad])?;
                Ok(())
            }

            (MetaLayout::Graphics { precision, trailing_pad }, DbrMetadata::Graphics(meta)) => {
                write_graphics(meta, native, precision, stream)?;
                if trailing_pad {
                    stream.write_u8(0)?;
                }
                Ok(())
            }

            (MetaLayout::Control { precision, trailing_pad }, DbrMetadata::Control(meta)) => {
                write_graphics(&meta.graphics, native, precision, stream)?;
                write_limit(native, meta.upper_ctrl_limit, stream)?;
                write_limit(native, meta.lower_ctrl_limit, stream)?;
                if trailing_pad {
                    stream.write_u8(0)?;
                }
                Ok(())
            }

            (MetaLayout::EnumStrings, DbrMetadata::Enum(meta)) => {
                if meta.strings.len() > MAX_ENUM_STATES {
                    return Err(EncodeError::TooManyEnumStates.into());
                }

                write_alarm_pair(meta.status, meta.severity, stream)?;
                stream.write_i16::<BigEndian>(meta.strings.len() as i16)?;

                let empty = [0u8; MAX_ENUM_STRING_SIZE];
                for slot in 0..MAX_ENUM_STATES {
                    stream.write_all(meta.strings.get(slot).unwrap_or(&empty))?;
                }
                Ok(())
            }

            (MetaLayout::StsAck, DbrMetadata::StsAck(meta)) => {
                stream.write_u16::<BigEndian>(meta.status as u16)?;
                stream.write_u16::<BigEndian>(meta.severity as u16)?;
                stream.write_u16::<BigEndian>(meta.ack_transient as u16)?;
                stream.write_u16::<BigEndian>(meta.severity_to_acknowledge as u16)?;
                Ok(())
            }

            _ => Err(EncodeError::MetadataMismatch.into()),
        }
    }

    /// Reads the metadata block for `dtype`, consuming its pads.
    pub fn read<R: SizedRead>(dtype: ChannelType, stream: &mut R) -> CaResult<DbrMetadata> {
        if stream.remaining_data() < dtype.metadata_size() {
            return Err(DecodeError::Truncated.into());
        }

        let native = dtype.native();
        let mut pad_sink = [0u8; 4];

        Ok(match meta_layout(dtype) {
            MetaLayout::Plain => DbrMetadata::Plain,

            MetaLayout::Sts { pad } => {
                let (status, severity) = read_alarm_pair(stream)?;
                stream.read_exact(&mut pad_sink[..pad])?;
                DbrMetadata::Sts(StsMeta { status, severity })
            }

            MetaLayout::Time { pad } => {
                let (status, severity) = read_alarm_pair(stream)?;
                let stamp = TimeStamp::read(stream)?;
                stream.read_exact(&mut pad_sink[..pad])?;
                DbrMetadata::Time(TimeMeta { status, severity, stamp })
            }

            MetaLayout::Graphics { precision, trailing_pad } => {
                let meta = read_graphics(native, precision, stream)?;
                if trailing_pad {
                    stream.read_u8()?;
                }
                DbrMetadata::Graphics(meta)
            }

            MetaLayout::Control { precision, trailing_pad } => {
                let graphics = read_graphics(native, precision, stream)?;
                let upper_ctrl_limit = read_limit(native, stream)?;
                let lower_ctrl_limit = read_limit(native, stream)?;
                if trailing_pad {
                    stream.read_u8()?;
                }
                DbrMetadata::Control(ControlMeta { graphics, upper_ctrl_limit, lower_ctrl_limit })
            }

            MetaLayout::EnumStrings => {
                let (status, severity) = read_alarm_pair(stream)?;
                let count = stream.read_i16::<BigEndian>()?.max(0) as usize;

                let mut strings = Vec::with_capacity(count.min(MAX_ENUM_STATES));
                for slot in 0..MAX_ENUM_STATES {
                    let mut cell = [0u8; MAX_ENUM_STRING_SIZE];
                    stream.read_exact(&mut cell)?;
                    if slot < count {
                        strings.push(cell);
                    }
                }

                DbrMetadata::Enum(EnumMeta { status, severity, strings })
            }

            MetaLayout::StsAck => {
                let status = AlarmStatus::from_raw(stream.read_u16::<BigEndian>()? as i16)?;
                let severity = AlarmSeverity::from_raw(stream.read_u16::<BigEndian>()? as i16)?;
                let ack_transient = stream.read_u16::<BigEndian>()? != 0;
                let severity_to_acknowledge = AlarmSeverity::from_raw(stream.read_u16::<BigEndian>()? as i16)?;

                DbrMetadata::StsAck(StsAckMeta { status, severity, ack_transient, severity_to_acknowledge })
            }
        })
    }
}

/// Serializes one DBR payload: metadata block followed by the value elements.
/// Padding to the 8-byte command boundary is applied by the header layer.
pub fn encode_payload(dtype: ChannelType, metadata: &DbrMetadata, values: &DbrValue, out: &mut Vec<u8>) -> CaResult<()> {
    if values.native() != dtype.native() {
        return Err(EncodeError::MetadataMismatch.into());
    }

    let expected = dtype.payload_size(values.len());
    let start = out.len();

    metadata.write(dtype, out)?;
    values.write(out)?;

    debug_assert_eq!(out.len() - start, expected);
    Ok(())
}

/// Parses a DBR payload of `count` elements.
pub fn decode_payload(dtype: ChannelType, count: usize, payload: &[u8]) -> CaResult<(DbrMetadata, DbrValue)> {
    let mut cursor = io::Cursor::new(payload);

    let metadata = DbrMetadata::read(dtype, &mut cursor)?;
    let values = DbrValue::read(dtype.native(), count, &mut cursor)?;

    Ok((metadata, values))
}
