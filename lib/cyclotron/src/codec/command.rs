//! The command inventory as a tagged union. Encoding writes a header plus a
//! NUL-padded payload; decoding dispatches on (command code, sender role)
//! since most codes are shared between the request and response directions.

use crate::codec::header::CommandHeader;
use crate::dbr::convert::StringEncoding;
use crate::dbr::{decode_payload, encode_payload, AccessRights, ChannelType, DbrMetadata, DbrValue, EventMask};
use crate::support::{CaResult, DecodeError, EncodeError, Role};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::Ipv4Addr;

/// CA status codes carried in response headers. Only the subset the core
/// emits or interprets is listed.
pub mod eca {
    pub const NORMAL: u32 = 1;
    pub const TIMEOUT: u32 = 80;
    pub const BADTYPE: u32 = 114;
    pub const GETFAIL: u32 = 152;
    pub const PUTFAIL: u32 = 160;
    pub const ADDFAIL: u32 = 168;
    pub const DISCONN: u32 = 192;
    pub const IODONE: u32 = 339;
    pub const NORDACCESS: u32 = 368;
    pub const NOWTACCESS: u32 = 376;
    pub const BADCHID: u32 = 410;
    pub const ISATTACHED: u32 = 424;
}

// Search reply flags carried in the data_type field.
const DO_REPLY: u16 = 10;
const NO_REPLY: u16 = 5;

// Sentinel server id in a SearchResponse meaning "use the datagram sender".
const SID_FROM_SENDER: u32 = 0xffff_ffff;

/// A DBR payload attached to a data-carrying command.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPayload {
    pub data_type: ChannelType,
    pub metadata: DbrMetadata,
    pub values: DbrValue,
}

impl DataPayload {
    #[inline]
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    VersionRequest { priority: u16, version: u16 },
    VersionResponse { version: u16 },

    SearchRequest { name: String, cid: u32, version: u16, reply: bool },
    SearchResponse { port: u16, addr: Option<Ipv4Addr>, cid: u32, version: Option<u16> },
    NotFoundResponse { reply: bool, version: u16, cid: u32 },

    RsrvIsUpResponse { version: u16, server_port: u16, beacon_id: u32, addr: Option<Ipv4Addr> },
    RepeaterRegisterRequest { client_addr: Ipv4Addr },
    RepeaterConfirmResponse { repeater_addr: Ipv4Addr },

    CreateChanRequest { name: String, cid: u32, version: u16 },
    CreateChanResponse { data_type: ChannelType, data_count: u32, cid: u32, sid: u32 },
    CreateChFailResponse { cid: u32 },
    AccessRightsResponse { cid: u32, rights: AccessRights },
    ClearChannelRequest { sid: u32, cid: u32 },
    ClearChannelResponse { sid: u32, cid: u32 },
    ServerDisconnResponse { cid: u32 },

    ReadRequest { data_type: ChannelType, data_count: u32, sid: u32, ioid: u32 },
    ReadResponse { data: DataPayload, sid: u32, ioid: u32 },
    ReadNotifyRequest { data_type: ChannelType, data_count: u32, sid: u32, ioid: u32 },
    ReadNotifyResponse { data: DataPayload, status: u32, ioid: u32 },
    WriteRequest { data: DataPayload, sid: u32, ioid: u32 },
    WriteNotifyRequest { data: DataPayload, sid: u32, ioid: u32 },
    WriteNotifyResponse { data_type: ChannelType, data_count: u32, status: u32, ioid: u32 },

    EventAddRequest {
        data_type: ChannelType,
        data_count: u32,
        sid: u32,
        subscriptionid: u32,
        low: f32,
        high: f32,
        to: f32,
        mask: EventMask,
    },
    EventAddResponse { data: DataPayload, status: u32, subscriptionid: u32 },
    EventCancelRequest { data_type: ChannelType, data_count: u32, sid: u32, subscriptionid: u32 },
    EventCancelResponse { data_type: ChannelType, sid: u32, subscriptionid: u32 },
    EventsOffRequest,
    EventsOnRequest,

    ErrorResponse { cid: u32, status: u32, original: CommandHeader, message: String },

    ClientNameRequest { name: String },
    HostNameRequest { name: String },
    EchoRequest,
    EchoResponse,
}

impl Command {
    pub fn code(&self) -> u16 {
        use self::Command::*;

        match self {
            VersionRequest { .. } | VersionResponse { .. } => 0,
            EventAddRequest { .. } | EventAddResponse { .. } => 1,
            EventCancelRequest { .. } | EventCancelResponse { .. } => 2,
            ReadRequest { .. } | ReadResponse { .. } => 3,
            WriteRequest { .. } => 4,
            SearchRequest { .. } | SearchResponse { .. } => 6,
            EventsOffRequest => 8,
            EventsOnRequest => 9,
            ErrorResponse { .. } => 11,
            ClearChannelRequest { .. } | ClearChannelResponse { .. } => 12,
            RsrvIsUpResponse { .. } => 13,
            NotFoundResponse { .. } => 14,
            ReadNotifyRequest { .. } | ReadNotifyResponse { .. } => 15,
            RepeaterConfirmResponse { .. } => 17,
            CreateChanRequest { .. } | CreateChanResponse { .. } => 18,
            WriteNotifyRequest { .. } | WriteNotifyResponse { .. } => 19,
            ClientNameRequest { .. } => 20,
            HostNameRequest { .. } => 21,
            AccessRightsResponse { .. } => 22,
            EchoRequest | EchoResponse => 23,
            RepeaterRegisterRequest { .. } => 24,
            CreateChFailResponse { .. } => 26,
            ServerDisconnResponse { .. } => 27,
        }
    }

    /// Serializes the command, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> CaResult<()> {
        use self::Command::*;

        match self {
            VersionRequest { priority, version } => {
                bare(out, 0, *priority, u32::from(*version), 0, 0)
            }
            VersionResponse { version } => bare(out, 0, 0, u32::from(*version), 0, 0),

            SearchRequest { name, cid, version, reply } => {
                let flag = if *reply { DO_REPLY } else { NO_REPLY };
                with_payload(out, 6, flag, u32::from(*version), *cid, *cid, |payload| {
                    write_name(name, payload)
                })
            }
            SearchResponse { port, addr, cid, version } => {
                let p1 = match addr {
                    Some(addr) => u32::from(*addr),
                    None => SID_FROM_SENDER,
                };
                with_payload(out, 6, *port, 0, p1, *cid, |payload| {
                    if let Some(version) = version {
                        payload.write_u16::<BigEndian>(*version)?;
                    }
                    Ok(())
                })
            }
            NotFoundResponse { reply, version, cid } => {
                let flag = if *reply { DO_REPLY } else { NO_REPLY };
                bare(out, 14, flag, u32::from(*version), *cid, *cid)
            }

            RsrvIsUpResponse { version, server_port, beacon_id, addr } => {
                let p2 = addr.map(u32::from).unwrap_or(0);
                bare(out, 13, *version, u32::from(*server_port), *beacon_id, p2)
            }
            RepeaterRegisterRequest { client_addr } => bare(out, 24, 0, 0, 0, u32::from(*client_addr)),
            RepeaterConfirmResponse { repeater_addr } => bare(out, 17, 0, 0, 0, u32::from(*repeater_addr)),

            CreateChanRequest { name, cid, version } => {
                with_payload(out, 18, 0, 0, *cid, u32::from(*version), |payload| write_name(name, payload))
            }
            CreateChanResponse { data_type, data_count, cid, sid } => {
                bare(out, 18, data_type.wire_value(), *data_count, *cid, *sid)
            }
            CreateChFailResponse { cid } => bare(out, 26, 0, 0, *cid, 0),
            AccessRightsResponse { cid, rights } => bare(out, 22, 0, 0, *cid, rights.bits()),
            ClearChannelRequest { sid, cid } => bare(out, 12, 0, 0, *sid, *cid),
            ClearChannelResponse { sid, cid } => bare(out, 12, 0, 0, *sid, *cid),
            ServerDisconnResponse { cid } => bare(out, 27, 0, 0, *cid, 0),

            ReadRequest { data_type, data_count, sid, ioid } => {
                bare(out, 3, data_type.wire_value(), *data_count, *sid, *ioid)
            }
            ReadResponse { data, sid, ioid } => write_data(out, 3, data, *sid, *ioid),
            ReadNotifyRequest { data_type, data_count, sid, ioid } => {
                bare(out, 15, data_type.wire_value(), *data_count, *sid, *ioid)
            }
            ReadNotifyResponse { data, status, ioid } => write_data(out, 15, data, *status, *ioid),
            WriteRequest { data, sid, ioid } => write_data(out, 4, data, *sid, *ioid),
            WriteNotifyRequest { data, sid, ioid } => write_data(out, 19, data, *sid, *ioid),
            WriteNotifyResponse { data_type, data_count, status, ioid } => {
                bare(out, 19, data_type.wire_value(), *data_count, *status, *ioid)
            }

            EventAddRequest { data_type, data_count, sid, subscriptionid, low, high, to, mask } => {
                with_payload(out, 1, data_type.wire_value(), *data_count, *sid, *subscriptionid, |payload| {
                    payload.write_f32::<BigEndian>(*low)?;
                    payload.write_f32::<BigEndian>(*high)?;
                    payload.write_f32::<BigEndian>(*to)?;
                    payload.write_u16::<BigEndian>(mask.0)?;
                    payload.write_u16::<BigEndian>(0)?;
                    Ok(())
                })
            }
            EventAddResponse { data, status, subscriptionid } => write_data(out, 1, data, *status, *subscriptionid),
            EventCancelRequest { data_type, data_count, sid, subscriptionid } => {
                bare(out, 2, data_type.wire_value(), *data_count, *sid, *subscriptionid)
            }
            EventCancelResponse { data_type, sid, subscriptionid } => {
                bare(out, 2, data_type.wire_value(), 0, *sid, *subscriptionid)
            }
            EventsOffRequest => bare(out, 8, 0, 0, 0, 0),
            EventsOnRequest => bare(out, 9, 0, 0, 0, 0),

            ErrorResponse { cid, status, original, message } => {
                with_payload(out, 11, 0, 0, *cid, *status, |payload| {
                    original.write(payload)?;
                    write_name(message, payload)
                })
            }

            ClientNameRequest { name } => with_payload(out, 20, 0, 0, 0, 0, |payload| write_name(name, payload)),
            HostNameRequest { name } => with_payload(out, 21, 0, 0, 0, 0, |payload| write_name(name, payload)),
            EchoRequest | EchoResponse => bare(out, 23, 0, 0, 0, 0),
        }
    }

    /// Decodes one command given its header and (padded) payload bytes.
    pub fn decode(header: &CommandHeader, payload: &[u8], sender: Role) -> CaResult<Command> {
        use self::Command::*;

        let dt = header.data_type;
        let dc = header.data_count;
        let p1 = header.param1;
        let p2 = header.param2;

        Ok(match (header.command, sender) {
            (0, Role::Client) => VersionRequest { priority: dt, version: dc as u16 },
            (0, Role::Server) => VersionResponse { version: dc as u16 },

            (1, Role::Client) => {
                let mut cursor = Cursor::new(payload);
                let low = cursor.read_f32::<BigEndian>()?;
                let high = cursor.read_f32::<BigEndian>()?;
                let to = cursor.read_f32::<BigEndian>()?;
                let mask = EventMask(cursor.read_u16::<BigEndian>()?);

                EventAddRequest {
                    data_type: ChannelType::from_wire(dt)?,
                    data_count: dc,
                    sid: p1,
                    subscriptionid: p2,
                    low,
                    high,
                    to,
                    mask,
                }
            }
            (1, Role::Server) => {
                EventAddResponse { data: read_data(header, payload)?, status: p1, subscriptionid: p2 }
            }

            (2, Role::Client) => {
                EventCancelRequest { data_type: ChannelType::from_wire(dt)?, data_count: dc, sid: p1, subscriptionid: p2 }
            }
            (2, Role::Server) => {
                EventCancelResponse { data_type: ChannelType::from_wire(dt)?, sid: p1, subscriptionid: p2 }
            }

            (3, Role::Client) => {
                ReadRequest { data_type: ChannelType::from_wire(dt)?, data_count: dc, sid: p1, ioid: p2 }
            }
            (3, Role::Server) => ReadResponse { data: read_data(header, payload)?, sid: p1, ioid: p2 },

            (4, Role::Client) => WriteRequest { data: read_data(header, payload)?, sid: p1, ioid: p2 },

            (6, Role::Client) => {
                SearchRequest { name: read_name(payload)?, cid: p2, version: dc as u16, reply: dt == DO_REPLY }
            }
            (6, Role::Server) => {
                let addr = if p1 == SID_FROM_SENDER { None } else { Some(Ipv4Addr::from(p1)) };
                let version = if payload.len() >= 2 {
                    let mut cursor = Cursor::new(payload);
                    Some(cursor.read_u16::<BigEndian>()?)
                } else {
                    None
                };

                SearchResponse { port: dt, addr, cid: p2, version }
            }

            (8, Role::Client) => EventsOffRequest,
            (9, Role::Client) => EventsOnRequest,

            (11, Role::Server) => {
                let (original, consumed) = match CommandHeader::read(payload)? {
                    Some(parsed) => parsed,
                    None => return Err(DecodeError::Truncated.into()),
                };

                ErrorResponse { cid: p1, status: p2, original, message: read_name(&payload[consumed..])? }
            }

            (12, Role::Client) => ClearChannelRequest { sid: p1, cid: p2 },
            (12, Role::Server) => ClearChannelResponse { sid: p1, cid: p2 },

            (13, Role::Server) => {
                let addr = if p2 == 0 { None } else { Some(Ipv4Addr::from(p2)) };
                RsrvIsUpResponse { version: dt, server_port: dc as u16, beacon_id: p1, addr }
            }

            (14, Role::Server) => NotFoundResponse { reply: dt == DO_REPLY, version: dc as u16, cid: p2 },

            (15, Role::Client) => {
                ReadNotifyRequest { data_type: ChannelType::from_wire(dt)?, data_count: dc, sid: p1, ioid: p2 }
            }
            (15, Role::Server) => ReadNotifyResponse { data: read_data(header, payload)?, status: p1, ioid: p2 },

            (17, Role::Server) => RepeaterConfirmResponse { repeater_addr: Ipv4Addr::from(p2) },

            (18, Role::Client) => CreateChanRequest { name: read_name(payload)?, cid: p1, version: p2 as u16 },
            (18, Role::Server) => {
                CreateChanResponse { data_type: ChannelType::from_wire(dt)?, data_count: dc, cid: p1, sid: p2 }
            }

            (19, Role::Client) => WriteNotifyRequest { data: read_data(header, payload)?, sid: p1, ioid: p2 },
            (19, Role::Server) => {
                WriteNotifyResponse { data_type: ChannelType::from_wire(dt)?, data_count: dc, status: p1, ioid: p2 }
            }

            (20, Role::Client) => ClientNameRequest { name: read_name(payload)? },
            (21, Role::Client) => HostNameRequest { name: read_name(payload)? },

            (22, Role::Server) => AccessRightsResponse { cid: p1, rights: AccessRights::from_bits(p2) },

            (23, Role::Client) => EchoRequest,
            (23, Role::Server) => EchoResponse,

            (24, Role::Client) => RepeaterRegisterRequest { client_addr: Ipv4Addr::from(p2) },

            (26, Role::Server) => CreateChFailResponse { cid: p1 },
            (27, Role::Server) => ServerDisconnResponse { cid: p1 },

            (code, _) => return Err(DecodeError::UnknownCommand(code).into()),
        })
    }
}

fn checked_u32(len: usize) -> CaResult<u32> {
    if len as u64 > u64::from(u32::max_value()) {
        return Err(EncodeError::FieldTooLarge.into());
    }

    Ok(len as u32)
}

/// Writes a payload-free command.
fn bare(out: &mut Vec<u8>, code: u16, data_type: u16, data_count: u32, p1: u32, p2: u32) -> CaResult<()> {
    CommandHeader::new(code, 0, data_type, data_count, p1, p2).write(out)
}

/// Builds the payload, pads it to the 8-byte boundary and prepends the header.
fn with_payload<F>(out: &mut Vec<u8>, code: u16, data_type: u16, data_count: u32, p1: u32, p2: u32, build: F) -> CaResult<()>
where
    F: FnOnce(&mut Vec<u8>) -> CaResult<()>,
{
    let mut payload = Vec::new();
    build(&mut payload)?;

    while payload.len() % 8 != 0 {
        payload.push(0);
    }

    let size = checked_u32(payload.len())?;
    CommandHeader::new(code, size, data_type, data_count, p1, p2).write(out)?;
    out.extend_from_slice(&payload);

    Ok(())
}

fn write_data(out: &mut Vec<u8>, code: u16, data: &DataPayload, p1: u32, p2: u32) -> CaResult<()> {
    let count = checked_u32(data.count())?;

    with_payload(out, code, data.data_type.wire_value(), count, p1, p2, |payload| {
        encode_payload(data.data_type, &data.metadata, &data.values, payload)
    })
}

fn read_data(header: &CommandHeader, payload: &[u8]) -> CaResult<DataPayload> {
    let data_type = ChannelType::from_wire(header.data_type)?;

    // A zero payload stands in for "no reading", e.g. a subscription
    // cancellation acknowledged through the event channel.
    if payload.is_empty() && header.data_count == 0 {
        return Ok(DataPayload { data_type, metadata: DbrMetadata::Plain, values: DbrValue::empty(data_type.native()) });
    }

    let (metadata, values) = decode_payload(data_type, header.data_count as usize, payload)?;
    Ok(DataPayload { data_type, metadata, values })
}

/// NUL-terminated text payload (PV names, host/client names, error text).
fn write_name(name: &str, payload: &mut Vec<u8>) -> CaResult<()> {
    let bytes = StringEncoding::Latin1.encode(name).map_err(|_| EncodeError::StringTooLong)?;
    payload.extend_from_slice(&bytes);
    payload.push(0);
    Ok(())
}

fn read_name(payload: &[u8]) -> CaResult<String> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    StringEncoding::Latin1.decode(&payload[..end]).map_err(|_| DecodeError::BadString.into())
}
