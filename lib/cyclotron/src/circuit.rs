//! The TCP virtual circuit: one connection to one peer at one priority,
//! carrying any number of channels. Sans-I/O: the driver appends received
//! bytes, drains queued outgoing bytes and consumes events.

use crate::codec::{Command, CommandHeader, DataPayload, RecvBuffer};
use crate::dbr::{AccessRights, ChannelType, EventMask};
use crate::support::{CaError, CaResult, DecodeError, ProtocolStep, Role};
use crate::PROTOCOL_VERSION;
use hashbrown::HashMap;
use lattice::logging;
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CircuitState {
    SendVersion,
    AwaitVersion,
    Connected,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Never,
    SendCreate,
    AwaitCreateResponse,
    Connected,
    MustClose,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoKind {
    Read,
    Write,
}

/// One channel carried by the circuit. The cid is client-chosen, the sid is
/// assigned by the server on creation.
#[derive(Debug, Clone)]
pub struct Channel {
    pub cid: u32,
    pub name: String,
    pub state: ChannelState,
    pub sid: Option<u32>,
    pub native_type: Option<ChannelType>,
    pub native_count: Option<u32>,
    pub rights: Option<AccessRights>,
}

impl Channel {
    fn new(cid: u32, name: String) -> Channel {
        Channel { cid, name, state: ChannelState::Never, sid: None, native_type: None, native_count: None, rights: None }
    }
}

#[derive(Debug)]
struct PendingIo {
    cid: u32,
    kind: IoKind,
    discarded: bool,
}

#[derive(Debug)]
struct Subscription {
    cid: u32,
    data_type: ChannelType,
    data_count: u32,
    mask: EventMask,
    cancelling: bool,
}

/// State transitions surfaced to the driver, client-side and server-side.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    // Client-side.
    HandshakeComplete { version: u16 },
    ChannelConnected { cid: u32 },
    ChannelCreateFailed { cid: u32 },
    AccessRightsChanged { cid: u32, rights: AccessRights },
    ChannelClosed { cid: u32, by_server: bool },
    ReadComplete { ioid: u32, cid: u32, status: u32, data: DataPayload },
    WriteComplete { ioid: u32, cid: u32, status: u32 },
    IoFailed { ioid: u32, cid: u32, status: u32, message: String },
    ErrorReceived { cid: u32, status: u32, message: String },
    /// A single command's payload failed to parse; its frame was skipped and
    /// the circuit survives. Servers typically answer with an ErrorResponse.
    PayloadDiscarded { error: DecodeError },
    SubscriptionUpdate { subscriptionid: u32, cid: u32, status: u32, data: DataPayload },
    SubscriptionCancelled { subscriptionid: u32 },

    // Server-side.
    PeerVersion { priority: u16, version: u16 },
    HostIdentified { name: String },
    ClientIdentified { name: String },
    CreateRequested { cid: u32, name: String, version: u16 },
    ReadRequested { ioid: u32, sid: u32, data_type: ChannelType, data_count: u32, legacy: bool },
    WriteRequested { ioid: u32, sid: u32, data: DataPayload },
    WritePosted { sid: u32, data: DataPayload },
    SubscribeRequested { subscriptionid: u32, sid: u32, data_type: ChannelType, data_count: u32, mask: EventMask },
    UnsubscribeRequested { subscriptionid: u32, sid: u32 },
    EventsSwitched { enabled: bool },
    ChannelCleared { cid: u32, sid: u32 },
}

/// What a disconnect drained: the driver uses this to wake waiters with
/// `Disconnected`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisconnectSummary {
    pub failed_ios: Vec<(u32, u32, IoKind)>,
    pub dropped_subscriptions: Vec<u32>,
    pub closed_channels: Vec<u32>,
}

pub struct VirtualCircuit {
    role: Role,
    address: SocketAddr,
    priority: u16,
    state: CircuitState,
    version: u16,
    peer_version: Option<u16>,
    host_name: Option<String>,
    client_name: Option<String>,

    channels: HashMap<u32, Channel>,
    sid_to_cid: HashMap<u32, u32>,
    pending_ios: HashMap<u32, PendingIo>,
    subscriptions: HashMap<u32, Subscription>,
    draining_subscriptions: Vec<u32>,

    next_cid: u32,
    next_ioid: u32,
    next_subid: u32,
    next_sid: u32,

    events_enabled: bool,

    recv: RecvBuffer,
    outgoing: Vec<u8>,
    pending_events: VecDeque<CircuitEvent>,

    log: logging::Logger,
}

impl VirtualCircuit {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        role: Role,
        address: SocketAddr,
        priority: u16,
        log: L,
    ) -> VirtualCircuit {
        let state = match role {
            Role::Client => CircuitState::SendVersion,
            Role::Server => CircuitState::AwaitVersion,
        };

        VirtualCircuit {
            role,
            address,
            priority,
            state,
            version: PROTOCOL_VERSION,
            peer_version: None,
            host_name: None,
            client_name: None,
            channels: HashMap::new(),
            sid_to_cid: HashMap::new(),
            pending_ios: HashMap::new(),
            subscriptions: HashMap::new(),
            draining_subscriptions: Vec::new(),
            next_cid: 1,
            next_ioid: 1,
            next_subid: 0,
            next_sid: 1,
            events_enabled: true,
            recv: RecvBuffer::new(),
            outgoing: Vec::new(),
            pending_events: VecDeque::new(),
            log: logging::component(log),
        }
    }

    #[inline]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The negotiated protocol version: ours until the peer's arrives, then
    /// the minimum of the two.
    #[inline]
    pub fn version(&self) -> u16 {
        match self.peer_version {
            Some(peer) => self.version.min(peer),
            None => self.version,
        }
    }

    #[inline]
    pub fn channel(&self, cid: u32) -> Option<&Channel> {
        self.channels.get(&cid)
    }

    #[inline]
    pub fn pending_io_count(&self) -> usize {
        self.pending_ios.len()
    }

    #[inline]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn events_enabled(&self) -> bool {
        self.events_enabled
    }

    // ---- byte plumbing -------------------------------------------------

    /// Appends bytes received from the transport.
    pub fn recv_bytes(&mut self, bytes: &[u8]) {
        if self.state == CircuitState::Disconnected {
            logging::trace!(self.log, "dropping bytes on disconnected circuit"; "context" => "recv_bytes");
            return;
        }

        self.recv.push_bytes(bytes);
    }

    /// Drains the queued outgoing bytes for transmission.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        for channel in self.channels.values_mut() {
            if channel.state == ChannelState::SendCreate {
                channel.state = ChannelState::AwaitCreateResponse;
            }
        }

        std::mem::replace(&mut self.outgoing, Vec::new())
    }

    #[inline]
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Pops the next event, consuming buffered commands as needed. `Ok(None)`
    /// means the buffer head is incomplete. Framing and remote-protocol
    /// errors are fatal; a single command whose payload fails to parse is
    /// skipped and surfaced as `PayloadDiscarded`.
    pub fn next_event(&mut self) -> CaResult<Option<CircuitEvent>> {
        loop {
            if let Some(event) = self.pending_events.pop_front() {
                return Ok(Some(event));
            }

            match self.recv.try_pop_command(self.role.peer()) {
                Ok(Some(command)) => self.process_command(command)?,
                Ok(None) => return Ok(None),
                Err(CaError::Decode(DecodeError::UnknownCommand(code))) => {
                    return Err(CaError::Decode(DecodeError::UnknownCommand(code)));
                }
                Err(CaError::Decode(error)) => {
                    logging::warn!(self.log, "discarding command with bad payload";
                                   "context" => "next_event",
                                   "error" => ?error);
                    self.push_event(CircuitEvent::PayloadDiscarded { error });
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn send(&mut self, command: &Command) -> CaResult<()> {
        logging::trace!(self.log, "queueing command"; "context" => "send", "command" => ?command);
        command.encode(&mut self.outgoing)
    }

    fn check_open(&self) -> CaResult<()> {
        if self.state == CircuitState::Disconnected {
            return Err(CaError::LocalProtocol(ProtocolStep::CircuitClosed));
        }

        Ok(())
    }

    fn connected_channel(&self, cid: u32) -> CaResult<(u32, ChannelType)> {
        let channel = self.channels.get(&cid).ok_or(CaError::LocalProtocol(ProtocolStep::UnknownChannel))?;

        if channel.state != ChannelState::Connected {
            return Err(CaError::LocalProtocol(ProtocolStep::ChannelNotConnected));
        }

        let sid = channel.sid.ok_or(CaError::LocalProtocol(ProtocolStep::ChannelNotConnected))?;
        let native = channel.native_type.ok_or(CaError::LocalProtocol(ProtocolStep::ChannelNotConnected))?;

        Ok((sid, native))
    }

    // ---- client operations ---------------------------------------------

    /// Queues the initial client handshake: version, host name, client name.
    pub fn handshake(&mut self, host_name: &str, client_name: &str) -> CaResult<()> {
        self.check_open()?;

        if self.role != Role::Client || self.state != CircuitState::SendVersion {
            return Err(CaError::LocalProtocol(ProtocolStep::UnexpectedCommand));
        }

        self.send(&Command::VersionRequest { priority: self.priority, version: PROTOCOL_VERSION })?;
        self.send(&Command::HostNameRequest { name: host_name.to_string() })?;
        self.send(&Command::ClientNameRequest { name: client_name.to_string() })?;

        self.host_name = Some(host_name.to_string());
        self.client_name = Some(client_name.to_string());

        // The server's version may already have arrived on a fast pipe.
        if self.peer_version.is_some() {
            self.state = CircuitState::Connected;
            let negotiated = self.version();
            self.push_event(CircuitEvent::HandshakeComplete { version: negotiated });
        } else {
            self.state = CircuitState::AwaitVersion;
        }

        logging::debug!(self.log, "handshake queued";
                        "context" => "handshake",
                        "priority" => self.priority,
                        "state" => ?self.state);

        Ok(())
    }

    /// Allocates a cid and queues channel creation. Legal once the version
    /// exchange is at least underway.
    pub fn create_channel(&mut self, name: &str) -> CaResult<u32> {
        self.check_open()?;

        if self.role != Role::Client || self.state == CircuitState::SendVersion {
            return Err(CaError::LocalProtocol(ProtocolStep::HandshakeIncomplete));
        }

        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        let mut channel = Channel::new(cid, name.to_string());
        channel.state = ChannelState::SendCreate;
        self.channels.insert(cid, channel);

        self.send(&Command::CreateChanRequest { name: name.to_string(), cid, version: PROTOCOL_VERSION })?;

        logging::debug!(self.log, "channel creation queued";
                        "context" => "create_channel",
                        "name" => name,
                        "cid" => cid);

        Ok(cid)
    }

    /// Queues a read-with-notify and returns the allocated ioid.
    pub fn read_notify(&mut self, cid: u32, data_type: ChannelType, data_count: u32) -> CaResult<u32> {
        self.check_open()?;
        let (sid, _) = self.connected_channel(cid)?;

        let ioid = self.next_ioid;
        self.next_ioid = self.next_ioid.wrapping_add(1);

        self.pending_ios.insert(ioid, PendingIo { cid, kind: IoKind::Read, discarded: false });
        self.send(&Command::ReadNotifyRequest { data_type, data_count, sid, ioid })?;

        Ok(ioid)
    }

    /// Queues a write-with-notify and returns the allocated ioid.
    pub fn write_notify(&mut self, cid: u32, data: DataPayload) -> CaResult<u32> {
        self.check_open()?;
        let (sid, _) = self.connected_channel(cid)?;

        let ioid = self.next_ioid;
        self.next_ioid = self.next_ioid.wrapping_add(1);

        self.pending_ios.insert(ioid, PendingIo { cid, kind: IoKind::Write, discarded: false });
        self.send(&Command::WriteNotifyRequest { data, sid, ioid })?;

        Ok(ioid)
    }

    /// Queues a fire-and-forget write. No response is expected.
    pub fn write(&mut self, cid: u32, data: DataPayload) -> CaResult<()> {
        self.check_open()?;
        let (sid, _) = self.connected_channel(cid)?;

        let ioid = self.next_ioid;
        self.next_ioid = self.next_ioid.wrapping_add(1);

        self.send(&Command::WriteRequest { data, sid, ioid })
    }

    /// Queues a subscription and returns the allocated subscription id.
    pub fn subscribe(&mut self, cid: u32, data_type: ChannelType, data_count: u32, mask: EventMask) -> CaResult<u32> {
        self.check_open()?;
        let (sid, _) = self.connected_channel(cid)?;

        let subscriptionid = self.next_subid;
        self.next_subid = self.next_subid.wrapping_add(1);

        self.subscriptions
            .insert(subscriptionid, Subscription { cid, data_type, data_count, mask, cancelling: false });

        self.send(&Command::EventAddRequest {
            data_type,
            data_count,
            sid,
            subscriptionid,
            low: 0.0,
            high: 0.0,
            to: 0.0,
            mask,
        })?;

        Ok(subscriptionid)
    }

    /// Queues a cancellation. The subid stays reserved until the server
    /// acknowledges with an `EventCancelResponse`.
    pub fn unsubscribe(&mut self, subscriptionid: u32) -> CaResult<()> {
        self.check_open()?;

        let (sid, data_type, data_count) = {
            let subscription = self
                .subscriptions
                .get_mut(&subscriptionid)
                .ok_or(CaError::LocalProtocol(ProtocolStep::UnknownSubscription))?;

            subscription.cancelling = true;

            let channel = self.channels.get(&subscription.cid);
            let sid = channel.and_then(|c| c.sid).unwrap_or(0);
            (sid, subscription.data_type, subscription.data_count)
        };

        self.send(&Command::EventCancelRequest { data_type, data_count, sid, subscriptionid })
    }

    /// Requests channel teardown; the channel lingers in `MustClose` until
    /// the server confirms.
    pub fn clear_channel(&mut self, cid: u32) -> CaResult<()> {
        self.check_open()?;
        let (sid, _) = self.connected_channel(cid)?;

        if let Some(channel) = self.channels.get_mut(&cid) {
            channel.state = ChannelState::MustClose;
        }

        self.send(&Command::ClearChannelRequest { sid, cid })
    }

    /// Flow control: ask the server to stop delivering subscription events.
    pub fn events_off(&mut self) -> CaResult<()> {
        self.check_open()?;
        self.events_enabled = false;
        self.send(&Command::EventsOffRequest)
    }

    pub fn events_on(&mut self) -> CaResult<()> {
        self.check_open()?;
        self.events_enabled = true;
        self.send(&Command::EventsOnRequest)
    }

    pub fn echo(&mut self) -> CaResult<()> {
        self.check_open()?;
        self.send(&Command::EchoRequest)
    }

    /// Abandons a pending read/write. The eventual response is still drained
    /// from the wire but discarded without an event.
    pub fn cancel_io(&mut self, ioid: u32) -> CaResult<()> {
        let pending = self.pending_ios.get_mut(&ioid).ok_or(CaError::LocalProtocol(ProtocolStep::UnknownIoid))?;
        pending.discarded = true;
        Ok(())
    }

    // ---- server operations ---------------------------------------------

    /// Queues the server's greeting version. Sent once at connection accept.
    pub fn server_greeting(&mut self) -> CaResult<()> {
        self.check_open()?;

        if self.role != Role::Server {
            return Err(CaError::LocalProtocol(ProtocolStep::UnexpectedCommand));
        }

        self.send(&Command::VersionResponse { version: PROTOCOL_VERSION })
    }

    /// Accepts a channel creation: allocates a sid, queues the access rights
    /// and creation responses.
    pub fn accept_channel(
        &mut self,
        cid: u32,
        data_type: ChannelType,
        data_count: u32,
        rights: AccessRights,
    ) -> CaResult<u32> {
        self.check_open()?;

        let sid = self.next_sid;
        self.next_sid = self.next_sid.wrapping_add(1);

        {
            let channel = self.channels.get_mut(&cid).ok_or(CaError::LocalProtocol(ProtocolStep::UnknownChannel))?;
            channel.sid = Some(sid);
            channel.native_type = Some(data_type);
            channel.native_count = Some(data_count);
            channel.rights = Some(rights);
            channel.state = ChannelState::Connected;
        }

        self.sid_to_cid.insert(sid, cid);

        self.send(&Command::AccessRightsResponse { cid, rights })?;
        self.send(&Command::CreateChanResponse { data_type, data_count, cid, sid })?;

        logging::debug!(self.log, "channel accepted";
                        "context" => "accept_channel",
                        "cid" => cid,
                        "sid" => sid);

        Ok(sid)
    }

    /// Declines a channel creation.
    pub fn reject_channel(&mut self, cid: u32) -> CaResult<()> {
        self.check_open()?;

        self.channels.remove(&cid);
        self.send(&Command::CreateChFailResponse { cid })
    }

    pub fn read_response(&mut self, ioid: u32, data: DataPayload, status: u32) -> CaResult<()> {
        self.check_open()?;
        self.send(&Command::ReadNotifyResponse { data, status, ioid })
    }

    pub fn write_response(&mut self, ioid: u32, data_type: ChannelType, data_count: u32, status: u32) -> CaResult<()> {
        self.check_open()?;
        self.send(&Command::WriteNotifyResponse { data_type, data_count, status, ioid })
    }

    /// Queues one subscription update. Suppressed while the client has events
    /// switched off.
    pub fn event_update(&mut self, subscriptionid: u32, data: DataPayload, status: u32) -> CaResult<()> {
        self.check_open()?;

        if !self.subscriptions.contains_key(&subscriptionid) {
            return Err(CaError::LocalProtocol(ProtocolStep::UnknownSubscription));
        }

        if !self.events_enabled {
            logging::trace!(self.log, "suppressing event while events-off";
                            "context" => "event_update",
                            "subscriptionid" => subscriptionid);
            return Ok(());
        }

        self.send(&Command::EventAddResponse { data, status, subscriptionid })
    }

    /// Acknowledges a cancellation and releases the subid.
    pub fn event_cancel_ack(&mut self, subscriptionid: u32) -> CaResult<()> {
        self.check_open()?;

        let subscription = self
            .subscriptions
            .remove(&subscriptionid)
            .ok_or(CaError::LocalProtocol(ProtocolStep::UnknownSubscription))?;

        let sid = self.channels.get(&subscription.cid).and_then(|c| c.sid).unwrap_or(0);

        self.send(&Command::EventCancelResponse { data_type: subscription.data_type, sid, subscriptionid })
    }

    /// Forcibly closes a channel from the server side (e.g. the PV vanished).
    pub fn server_disconnect_channel(&mut self, cid: u32) -> CaResult<()> {
        self.check_open()?;

        if let Some(channel) = self.channels.get_mut(&cid) {
            channel.state = ChannelState::Closed;
            if let Some(sid) = channel.sid {
                self.sid_to_cid.remove(&sid);
            }
        }

        self.subscriptions.retain(|_, subscription| subscription.cid != cid);
        self.send(&Command::ServerDisconnResponse { cid })
    }

    pub fn error_response(&mut self, cid: u32, status: u32, original: CommandHeader, message: &str) -> CaResult<()> {
        self.check_open()?;
        self.send(&Command::ErrorResponse { cid, status, original, message: message.to_string() })
    }

    // ---- teardown ------------------------------------------------------

    /// Tears the circuit down: every pending io fails, every channel closes,
    /// every subscription is dropped. The circuit is terminal afterwards.
    pub fn disconnect(&mut self) -> DisconnectSummary {
        let mut summary = DisconnectSummary::default();

        for (ioid, pending) in self.pending_ios.drain() {
            if !pending.discarded {
                summary.failed_ios.push((ioid, pending.cid, pending.kind));
            }
        }
        summary.failed_ios.sort_by_key(|&(ioid, _, _)| ioid);

        for (subscriptionid, _) in self.subscriptions.drain() {
            summary.dropped_subscriptions.push(subscriptionid);
        }
        summary.dropped_subscriptions.sort_unstable();

        for (cid, channel) in self.channels.iter_mut() {
            if channel.state != ChannelState::Closed {
                channel.state = ChannelState::Closed;
                summary.closed_channels.push(*cid);
            }
        }
        summary.closed_channels.sort_unstable();

        self.sid_to_cid.clear();
        self.draining_subscriptions.clear();
        self.recv.clear();
        self.outgoing.clear();
        self.pending_events.clear();
        self.state = CircuitState::Disconnected;

        logging::debug!(self.log, "circuit disconnected";
                        "context" => "disconnect",
                        "failed_ios" => summary.failed_ios.len(),
                        "dropped_subscriptions" => summary.dropped_subscriptions.len());

        summary
    }

    // ---- command application -------------------------------------------

    fn push_event(&mut self, event: CircuitEvent) {
        self.pending_events.push_back(event);
    }

    fn process_command(&mut self, command: Command) -> CaResult<()> {
        logging::trace!(self.log, "processing command"; "context" => "process", "command" => ?command);

        match self.role {
            Role::Client => self.process_as_client(command),
            Role::Server => self.process_as_server(command),
        }
    }

    fn process_as_client(&mut self, command: Command) -> CaResult<()> {
        match command {
            Command::VersionResponse { version } => {
                self.peer_version = Some(version);

                if self.state == CircuitState::AwaitVersion {
                    self.state = CircuitState::Connected;
                    let negotiated = self.version();
                    self.push_event(CircuitEvent::HandshakeComplete { version: negotiated });
                }

                Ok(())
            }

            Command::CreateChanResponse { data_type, data_count, cid, sid } => {
                let ready = {
                    let channel =
                        self.channels.get_mut(&cid).ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))?;

                    match channel.state {
                        ChannelState::SendCreate | ChannelState::AwaitCreateResponse => (),
                        _ => return Err(CaError::RemoteProtocol(ProtocolStep::UnexpectedCommand)),
                    }

                    channel.sid = Some(sid);
                    channel.native_type = Some(data_type);
                    channel.native_count = Some(data_count);

                    // Connected only once the access rights are also known.
                    if channel.rights.is_some() {
                        channel.state = ChannelState::Connected;
                        true
                    } else {
                        false
                    }
                };

                self.sid_to_cid.insert(sid, cid);

                if ready {
                    self.push_event(CircuitEvent::ChannelConnected { cid });
                }

                Ok(())
            }

            Command::AccessRightsResponse { cid, rights } => {
                let ready = {
                    let channel =
                        self.channels.get_mut(&cid).ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))?;

                    channel.rights = Some(rights);

                    let creating = match channel.state {
                        ChannelState::SendCreate | ChannelState::AwaitCreateResponse => true,
                        _ => false,
                    };

                    if creating && channel.sid.is_some() {
                        channel.state = ChannelState::Connected;
                        true
                    } else {
                        false
                    }
                };

                self.push_event(CircuitEvent::AccessRightsChanged { cid, rights });
                if ready {
                    self.push_event(CircuitEvent::ChannelConnected { cid });
                }

                Ok(())
            }

            Command::CreateChFailResponse { cid } => {
                let channel =
                    self.channels.get_mut(&cid).ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))?;
                channel.state = ChannelState::Closed;

                self.push_event(CircuitEvent::ChannelCreateFailed { cid });
                Ok(())
            }

            Command::ClearChannelResponse { cid, .. } => {
                let channel =
                    self.channels.get_mut(&cid).ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))?;
                channel.state = ChannelState::Closed;
                if let Some(sid) = channel.sid {
                    self.sid_to_cid.remove(&sid);
                }

                self.push_event(CircuitEvent::ChannelClosed { cid, by_server: false });
                Ok(())
            }

            Command::ServerDisconnResponse { cid } => {
                self.close_channel_remotely(cid)?;
                Ok(())
            }

            Command::ReadNotifyResponse { data, status, ioid } => self.complete_read(ioid, status, data),

            // The deprecated read form has no status word; a response means
            // success.
            Command::ReadResponse { data, ioid, .. } => self.complete_read(ioid, crate::codec::eca::NORMAL, data),

            Command::WriteNotifyResponse { status, ioid, .. } => match self.pending_ios.remove(&ioid) {
                Some(pending) => {
                    if !pending.discarded {
                        self.push_event(CircuitEvent::WriteComplete { ioid, cid: pending.cid, status });
                    }
                    Ok(())
                }
                None => Err(CaError::RemoteProtocol(ProtocolStep::UnknownIoid)),
            },

            Command::EventAddResponse { data, status, subscriptionid } => {
                match self.subscriptions.get(&subscriptionid) {
                    Some(subscription) => {
                        if subscription.cancelling {
                            // Late update racing the cancel; drain silently.
                            return Ok(());
                        }

                        let cid = subscription.cid;
                        self.push_event(CircuitEvent::SubscriptionUpdate { subscriptionid, cid, status, data });
                        Ok(())
                    }
                    None => {
                        if self.draining_subscriptions.contains(&subscriptionid) {
                            return Ok(());
                        }
                        Err(CaError::RemoteProtocol(ProtocolStep::UnknownSubscription))
                    }
                }
            }

            Command::EventCancelResponse { subscriptionid, .. } => {
                match self.subscriptions.remove(&subscriptionid) {
                    Some(_) => {
                        self.draining_subscriptions.retain(|&subid| subid != subscriptionid);
                        self.push_event(CircuitEvent::SubscriptionCancelled { subscriptionid });
                        Ok(())
                    }
                    None => Err(CaError::RemoteProtocol(ProtocolStep::UnknownSubscription)),
                }
            }

            Command::ErrorResponse { cid, status, original, message } => {
                // Notify-style requests carry their ioid in parameter 2 of
                // the embedded header.
                let notify_codes = [1u16, 3, 4, 15, 19];
                let ioid = original.param2;

                if notify_codes.contains(&original.command) {
                    if let Some(pending) = self.pending_ios.remove(&ioid) {
                        if !pending.discarded {
                            self.push_event(CircuitEvent::IoFailed { ioid, cid: pending.cid, status, message });
                        }
                        return Ok(());
                    }
                }

                self.push_event(CircuitEvent::ErrorReceived { cid, status, message });
                Ok(())
            }

            Command::EchoResponse => Ok(()),

            other => {
                logging::warn!(self.log, "unexpected command on client circuit";
                               "context" => "process",
                               "command" => ?other);
                Err(CaError::RemoteProtocol(ProtocolStep::UnexpectedCommand))
            }
        }
    }

    fn complete_read(&mut self, ioid: u32, status: u32, data: DataPayload) -> CaResult<()> {
        match self.pending_ios.remove(&ioid) {
            Some(pending) => {
                if !pending.discarded {
                    self.push_event(CircuitEvent::ReadComplete { ioid, cid: pending.cid, status, data });
                }
                Ok(())
            }
            None => Err(CaError::RemoteProtocol(ProtocolStep::UnknownIoid)),
        }
    }

    fn close_channel_remotely(&mut self, cid: u32) -> CaResult<()> {
        {
            let channel = self.channels.get_mut(&cid).ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))?;
            channel.state = ChannelState::Closed;
            if let Some(sid) = channel.sid {
                self.sid_to_cid.remove(&sid);
            }
        }

        // Pending operations on the channel will never be answered.
        let mut failed: Vec<(u32, u32)> = Vec::new();
        self.pending_ios.retain(|&ioid, pending| {
            if pending.cid == cid {
                if !pending.discarded {
                    failed.push((ioid, pending.cid));
                }
                false
            } else {
                true
            }
        });
        failed.sort_by_key(|&(ioid, _)| ioid);

        for (ioid, cid) in failed {
            self.push_event(CircuitEvent::IoFailed {
                ioid,
                cid,
                status: crate::codec::eca::DISCONN,
                message: "channel disconnected by server".to_string(),
            });
        }

        let mut dropped: Vec<u32> = Vec::new();
        self.subscriptions.retain(|&subscriptionid, subscription| {
            if subscription.cid == cid {
                dropped.push(subscriptionid);
                false
            } else {
                true
            }
        });
        dropped.sort_unstable();

        for subscriptionid in dropped {
            // Late updates already in flight for these ids must drain.
            self.draining_subscriptions.push(subscriptionid);
            self.push_event(CircuitEvent::SubscriptionCancelled { subscriptionid });
        }

        self.push_event(CircuitEvent::ChannelClosed { cid, by_server: true });
        Ok(())
    }

    fn process_as_server(&mut self, command: Command) -> CaResult<()> {
        match command {
            Command::VersionRequest { priority, version } => {
                self.peer_version = Some(version);
                self.priority = priority;
                self.state = CircuitState::Connected;

                self.push_event(CircuitEvent::PeerVersion { priority, version });
                Ok(())
            }

            Command::HostNameRequest { name } => {
                self.host_name = Some(name.clone());
                self.push_event(CircuitEvent::HostIdentified { name });
                Ok(())
            }

            Command::ClientNameRequest { name } => {
                self.client_name = Some(name.clone());
                self.push_event(CircuitEvent::ClientIdentified { name });
                Ok(())
            }

            Command::CreateChanRequest { name, cid, version } => {
                if self.state != CircuitState::Connected {
                    return Err(CaError::RemoteProtocol(ProtocolStep::HandshakeIncomplete));
                }

                if self.channels.contains_key(&cid) {
                    return Err(CaError::RemoteProtocol(ProtocolStep::UnexpectedCommand));
                }

                let mut channel = Channel::new(cid, name.clone());
                channel.state = ChannelState::AwaitCreateResponse;
                self.channels.insert(cid, channel);

                self.push_event(CircuitEvent::CreateRequested { cid, name, version });
                Ok(())
            }

            Command::ReadNotifyRequest { data_type, data_count, sid, ioid } => {
                self.require_sid(sid)?;
                self.push_event(CircuitEvent::ReadRequested { ioid, sid, data_type, data_count, legacy: false });
                Ok(())
            }

            Command::ReadRequest { data_type, data_count, sid, ioid } => {
                self.require_sid(sid)?;
                self.push_event(CircuitEvent::ReadRequested { ioid, sid, data_type, data_count, legacy: true });
                Ok(())
            }

            Command::WriteNotifyRequest { data, sid, ioid } => {
                self.require_sid(sid)?;
                self.push_event(CircuitEvent::WriteRequested { ioid, sid, data });
                Ok(())
            }

            Command::WriteRequest { data, sid, .. } => {
                self.require_sid(sid)?;
                self.push_event(CircuitEvent::WritePosted { sid, data });
                Ok(())
            }

            Command::EventAddRequest { data_type, data_count, sid, subscriptionid, mask, .. } => {
                let cid = self.require_sid(sid)?;

                if self.subscriptions.contains_key(&subscriptionid) {
                    return Err(CaError::RemoteProtocol(ProtocolStep::UnexpectedCommand));
                }

                self.subscriptions
                    .insert(subscriptionid, Subscription { cid, data_type, data_count, mask, cancelling: false });

                self.push_event(CircuitEvent::SubscribeRequested { subscriptionid, sid, data_type, data_count, mask });
                Ok(())
            }

            Command::EventCancelRequest { sid, subscriptionid, .. } => {
                if !self.subscriptions.contains_key(&subscriptionid) {
                    return Err(CaError::RemoteProtocol(ProtocolStep::UnknownSubscription));
                }

                self.push_event(CircuitEvent::UnsubscribeRequested { subscriptionid, sid });
                Ok(())
            }

            Command::EventsOffRequest => {
                self.events_enabled = false;
                self.push_event(CircuitEvent::EventsSwitched { enabled: false });
                Ok(())
            }

            Command::EventsOnRequest => {
                self.events_enabled = true;
                self.push_event(CircuitEvent::EventsSwitched { enabled: true });
                Ok(())
            }

            Command::ClearChannelRequest { sid, cid } => {
                self.require_sid(sid)?;

                if let Some(channel) = self.channels.get_mut(&cid) {
                    channel.state = ChannelState::Closed;
                }
                self.sid_to_cid.remove(&sid);
                self.subscriptions.retain(|_, subscription| subscription.cid != cid);

                // The confirmation is queued immediately; nothing about the
                // teardown needs the application's involvement.
                self.send(&Command::ClearChannelResponse { sid, cid })?;
                self.push_event(CircuitEvent::ChannelCleared { cid, sid });
                Ok(())
            }

            Command::EchoRequest => self.send(&Command::EchoResponse),

            other => {
                logging::warn!(self.log, "unexpected command on server circuit";
                               "context" => "process",
                               "command" => ?other);
                Err(CaError::RemoteProtocol(ProtocolStep::UnexpectedCommand))
            }
        }
    }

    fn require_sid(&self, sid: u32) -> CaResult<u32> {
        self.sid_to_cid.get(&sid).copied().ok_or(CaError::RemoteProtocol(ProtocolStep::UnknownChannel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::eca;
    use crate::dbr::{DbrMetadata, DbrValue};

    fn address() -> SocketAddr {
        "127.0.0.1:5064".parse().unwrap()
    }

    fn client() -> VirtualCircuit {
        VirtualCircuit::new(Role::Client, address(), 0, None)
    }

    fn server() -> VirtualCircuit {
        VirtualCircuit::new(Role::Server, address(), 0, None)
    }

    fn wire(commands: &[Command]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for command in commands {
            command.encode(&mut bytes).unwrap();
        }
        bytes
    }

    fn doubles(values: &[f64]) -> DataPayload {
        DataPayload {
            data_type: ChannelType::Double,
            metadata: DbrMetadata::Plain,
            values: DbrValue::Double(values.to_vec()),
        }
    }

    /// Drives the client through handshake and one channel creation.
    fn connected_client() -> (VirtualCircuit, u32) {
        let mut circuit = client();
        circuit.handshake("workstation", "operator").unwrap();
        let cid = circuit.create_channel("pi").unwrap();
        circuit.take_outgoing();

        circuit.recv_bytes(&wire(&[
            Command::VersionResponse { version: PROTOCOL_VERSION },
            Command::AccessRightsResponse { cid, rights: AccessRights::ReadWrite },
            Command::CreateChanResponse { data_type: ChannelType::Double, data_count: 1, cid, sid: 88 },
        ]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::HandshakeComplete { version: PROTOCOL_VERSION })
        );
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::AccessRightsChanged { cid, rights: AccessRights::ReadWrite })
        );
        assert_eq!(circuit.next_event().unwrap(), Some(CircuitEvent::ChannelConnected { cid }));
        assert_eq!(circuit.next_event().unwrap(), None);

        (circuit, cid)
    }

    #[test]
    fn test_handshake_transitions() {
        let mut circuit = client();
        assert_eq!(circuit.state(), CircuitState::SendVersion);

        circuit.handshake("workstation", "operator").unwrap();
        assert_eq!(circuit.state(), CircuitState::AwaitVersion);

        circuit.recv_bytes(&wire(&[Command::VersionResponse { version: 12 }]));
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::HandshakeComplete { version: 12 })
        );
        assert_eq!(circuit.state(), CircuitState::Connected);
        // The negotiated version is the minimum of both sides.
        assert_eq!(circuit.version(), 12);
    }

    #[test]
    fn test_handshake_err_repeated() {
        let mut circuit = client();
        circuit.handshake("a", "b").unwrap();
        assert_eq!(
            circuit.handshake("a", "b"),
            Err(CaError::LocalProtocol(ProtocolStep::UnexpectedCommand))
        );
    }

    #[test]
    fn test_create_channel_err_before_handshake() {
        let mut circuit = client();
        assert_eq!(
            circuit.create_channel("pi"),
            Err(CaError::LocalProtocol(ProtocolStep::HandshakeIncomplete))
        );
    }

    #[test]
    fn test_channel_connects_after_both_responses() {
        let (circuit, cid) = connected_client();

        let channel = circuit.channel(cid).unwrap();
        assert_eq!(channel.state, ChannelState::Connected);
        assert_eq!(channel.sid, Some(88));
        assert_eq!(channel.native_type, Some(ChannelType::Double));
        assert_eq!(channel.rights, Some(AccessRights::ReadWrite));
    }

    #[test]
    fn test_create_responses_in_either_order() {
        let mut circuit = client();
        circuit.handshake("h", "c").unwrap();
        let cid = circuit.create_channel("pi").unwrap();
        circuit.take_outgoing();

        // Creation response first, rights second.
        circuit.recv_bytes(&wire(&[
            Command::VersionResponse { version: PROTOCOL_VERSION },
            Command::CreateChanResponse { data_type: ChannelType::Long, data_count: 4, cid, sid: 7 },
            Command::AccessRightsResponse { cid, rights: AccessRights::Read },
        ]));

        let mut events = Vec::new();
        while let Some(event) = circuit.next_event().unwrap() {
            events.push(event);
        }

        assert!(events.contains(&CircuitEvent::ChannelConnected { cid }));
        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::Connected);
    }

    #[test]
    fn test_channel_create_failure() {
        let mut circuit = client();
        circuit.handshake("h", "c").unwrap();
        let cid = circuit.create_channel("nope").unwrap();
        circuit.take_outgoing();

        circuit.recv_bytes(&wire(&[
            Command::VersionResponse { version: PROTOCOL_VERSION },
            Command::CreateChFailResponse { cid },
        ]));

        circuit.next_event().unwrap();
        assert_eq!(circuit.next_event().unwrap(), Some(CircuitEvent::ChannelCreateFailed { cid }));
        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::Closed);
    }

    #[test]
    fn test_read_notify_roundtrip() {
        let (mut circuit, cid) = connected_client();

        let ioid = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();
        assert_eq!(ioid, 1);
        assert_eq!(circuit.pending_io_count(), 1);

        circuit.recv_bytes(&wire(&[Command::ReadNotifyResponse {
            data: doubles(&[3.14]),
            status: eca::NORMAL,
            ioid,
        }]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::ReadComplete { ioid, cid, status: eca::NORMAL, data: doubles(&[3.14]) })
        );
        assert_eq!(circuit.pending_io_count(), 0);
    }

    #[test]
    fn test_ioids_are_monotonic() {
        let (mut circuit, cid) = connected_client();

        let first = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();
        let second = circuit.write_notify(cid, doubles(&[5.0])).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_write_notify_roundtrip() {
        let (mut circuit, cid) = connected_client();

        let ioid = circuit.write_notify(cid, doubles(&[5.0])).unwrap();
        circuit.recv_bytes(&wire(&[Command::WriteNotifyResponse {
            data_type: ChannelType::Double,
            data_count: 1,
            status: eca::NORMAL,
            ioid,
        }]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::WriteComplete { ioid, cid, status: eca::NORMAL })
        );
    }

    #[test]
    fn test_read_err_channel_not_connected() {
        let mut circuit = client();
        circuit.handshake("h", "c").unwrap();
        let cid = circuit.create_channel("pi").unwrap();

        assert_eq!(
            circuit.read_notify(cid, ChannelType::Double, 1),
            Err(CaError::LocalProtocol(ProtocolStep::ChannelNotConnected))
        );
    }

    #[test]
    fn test_cancelled_io_drains_without_event() {
        let (mut circuit, cid) = connected_client();

        let ioid = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();
        circuit.cancel_io(ioid).unwrap();

        circuit.recv_bytes(&wire(&[Command::ReadNotifyResponse {
            data: doubles(&[3.14]),
            status: eca::NORMAL,
            ioid,
        }]));

        // The response is consumed but no waiter is woken.
        assert_eq!(circuit.next_event().unwrap(), None);
        assert_eq!(circuit.pending_io_count(), 0);
    }

    #[test]
    fn test_error_response_fails_matching_io() {
        let (mut circuit, cid) = connected_client();
        let ioid = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();

        let original = CommandHeader::new(15, 0, ChannelType::Double.wire_value(), 1, 88, ioid);
        circuit.recv_bytes(&wire(&[Command::ErrorResponse {
            cid,
            status: eca::GETFAIL,
            original,
            message: "read failed".to_string(),
        }]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::IoFailed { ioid, cid, status: eca::GETFAIL, message: "read failed".to_string() })
        );
        assert_eq!(circuit.pending_io_count(), 0);
    }

    #[test]
    fn test_subscription_lifecycle() {
        let (mut circuit, cid) = connected_client();

        let subscriptionid = circuit.subscribe(cid, ChannelType::TimeDouble, 1, EventMask::VALUE).unwrap();
        assert_eq!(subscriptionid, 0);

        let data = DataPayload {
            data_type: ChannelType::TimeDouble,
            metadata: DbrMetadata::Time(Default::default()),
            values: DbrValue::Double(vec![3.14]),
        };

        circuit.recv_bytes(&wire(&[Command::EventAddResponse {
            data: data.clone(),
            status: eca::NORMAL,
            subscriptionid,
        }]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::SubscriptionUpdate { subscriptionid, cid, status: eca::NORMAL, data })
        );

        circuit.unsubscribe(subscriptionid).unwrap();

        // A late update racing the cancel is drained silently.
        let late = DataPayload {
            data_type: ChannelType::TimeDouble,
            metadata: DbrMetadata::Time(Default::default()),
            values: DbrValue::Double(vec![2.71]),
        };
        circuit.recv_bytes(&wire(&[
            Command::EventAddResponse { data: late, status: eca::NORMAL, subscriptionid },
            Command::EventCancelResponse { data_type: ChannelType::TimeDouble, sid: 88, subscriptionid },
        ]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::SubscriptionCancelled { subscriptionid })
        );
        assert_eq!(circuit.subscription_count(), 0);
    }

    #[test]
    fn test_server_forced_channel_close() {
        let (mut circuit, cid) = connected_client();
        let ioid = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();
        let subscriptionid = circuit.subscribe(cid, ChannelType::Double, 1, EventMask::VALUE).unwrap();

        circuit.recv_bytes(&wire(&[Command::ServerDisconnResponse { cid }]));

        let mut events = Vec::new();
        while let Some(event) = circuit.next_event().unwrap() {
            events.push(event);
        }

        assert!(events.contains(&CircuitEvent::ChannelClosed { cid, by_server: true }));
        assert!(events.iter().any(|event| matches!(
            event,
            CircuitEvent::IoFailed { ioid: failed, .. } if *failed == ioid
        )));
        assert!(events.contains(&CircuitEvent::SubscriptionCancelled { subscriptionid }));
        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::Closed);
    }

    #[test]
    fn test_disconnect_drains_pending() {
        let (mut circuit, cid) = connected_client();
        let first = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();
        let second = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();

        let summary = circuit.disconnect();

        assert_eq!(
            summary.failed_ios,
            vec![(first, cid, IoKind::Read), (second, cid, IoKind::Read)]
        );
        assert_eq!(summary.closed_channels, vec![cid]);
        assert_eq!(circuit.pending_io_count(), 0);
        assert_eq!(circuit.state(), CircuitState::Disconnected);
        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::Closed);

        // The circuit is terminal: further operations are local errors.
        assert_eq!(
            circuit.read_notify(cid, ChannelType::Double, 1),
            Err(CaError::LocalProtocol(ProtocolStep::CircuitClosed))
        );
    }

    #[test]
    fn test_remote_protocol_err_unknown_ioid() {
        let (mut circuit, _) = connected_client();

        circuit.recv_bytes(&wire(&[Command::ReadNotifyResponse {
            data: doubles(&[1.0]),
            status: eca::NORMAL,
            ioid: 99,
        }]));

        assert_eq!(circuit.next_event(), Err(CaError::RemoteProtocol(ProtocolStep::UnknownIoid)));
    }

    #[test]
    fn test_remote_protocol_err_unexpected_command() {
        let (mut circuit, _) = connected_client();

        // A client-to-server command arriving at a client is illegal.
        circuit.recv_bytes(&wire(&[Command::EventsOffRequest]));
        // EventsOff decodes only for the client role, so it surfaces as an
        // unknown command here: a decode failure, fatal either way.
        assert!(circuit.next_event().is_err());
    }

    #[test]
    fn test_bad_payload_is_survivable() {
        let (mut circuit, cid) = connected_client();
        let ioid = circuit.read_notify(cid, ChannelType::Double, 1).unwrap();

        // An event frame announcing an impossible data type, followed by the
        // pending read's real response.
        let mut bytes = Vec::new();
        CommandHeader::new(1, 0, 99, 0, eca::NORMAL, 5).write(&mut bytes).unwrap();
        Command::ReadNotifyResponse { data: doubles(&[3.14]), status: eca::NORMAL, ioid }
            .encode(&mut bytes)
            .unwrap();
        circuit.recv_bytes(&bytes);

        match circuit.next_event().unwrap() {
            Some(CircuitEvent::PayloadDiscarded { .. }) => (),
            other => panic!("Unexpected event {:?}", other),
        }

        // The bad frame is gone; the circuit keeps serving responses.
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::ReadComplete { ioid, cid, status: eca::NORMAL, data: doubles(&[3.14]) })
        );
    }

    #[test]
    fn test_server_handshake_and_create_flow() {
        let mut circuit = server();
        circuit.server_greeting().unwrap();

        circuit.recv_bytes(&wire(&[
            Command::VersionRequest { priority: 10, version: PROTOCOL_VERSION },
            Command::HostNameRequest { name: "workstation".to_string() },
            Command::ClientNameRequest { name: "operator".to_string() },
            Command::CreateChanRequest { name: "pi".to_string(), cid: 1, version: PROTOCOL_VERSION },
        ]));

        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::PeerVersion { priority: 10, version: PROTOCOL_VERSION })
        );
        assert_eq!(circuit.state(), CircuitState::Connected);
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::HostIdentified { name: "workstation".to_string() })
        );
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::ClientIdentified { name: "operator".to_string() })
        );
        assert_eq!(
            circuit.next_event().unwrap(),
            Some(CircuitEvent::CreateRequested { cid: 1, name: "pi".to_string(), version: PROTOCOL_VERSION })
        );

        let sid = circuit.accept_channel(1, ChannelType::Double, 1, AccessRights::ReadWrite).unwrap();
        assert_eq!(circuit.channel(1).unwrap().state, ChannelState::Connected);
        assert_eq!(circuit.channel(1).unwrap().sid, Some(sid));
    }

    #[test]
    fn test_server_create_err_before_version() {
        let mut circuit = server();

        circuit.recv_bytes(&wire(&[Command::CreateChanRequest {
            name: "pi".to_string(),
            cid: 1,
            version: PROTOCOL_VERSION,
        }]));

        assert_eq!(
            circuit.next_event(),
            Err(CaError::RemoteProtocol(ProtocolStep::HandshakeIncomplete))
        );
    }

    #[test]
    fn test_server_events_off_suppresses_updates() {
        let mut circuit = server();
        circuit.server_greeting().unwrap();
        circuit.recv_bytes(&wire(&[
            Command::VersionRequest { priority: 0, version: PROTOCOL_VERSION },
            Command::CreateChanRequest { name: "pi".to_string(), cid: 1, version: PROTOCOL_VERSION },
        ]));
        while circuit.next_event().unwrap().is_some() {}

        let sid = circuit.accept_channel(1, ChannelType::Double, 1, AccessRights::ReadWrite).unwrap();

        circuit.recv_bytes(&wire(&[
            Command::EventAddRequest {
                data_type: ChannelType::Double,
                data_count: 1,
                sid,
                subscriptionid: 0,
                low: 0.0,
                high: 0.0,
                to: 0.0,
                mask: EventMask::VALUE,
            },
            Command::EventsOffRequest,
        ]));
        while circuit.next_event().unwrap().is_some() {}
        assert!(!circuit.events_enabled());

        circuit.take_outgoing();
        circuit.event_update(0, doubles(&[1.0]), eca::NORMAL).unwrap();
        assert!(!circuit.has_outgoing());

        circuit.recv_bytes(&wire(&[Command::EventsOnRequest]));
        while circuit.next_event().unwrap().is_some() {}

        circuit.event_update(0, doubles(&[1.0]), eca::NORMAL).unwrap();
        assert!(circuit.has_outgoing());
    }

    #[test]
    fn test_server_clear_channel_is_acknowledged() {
        let mut circuit = server();
        circuit.server_greeting().unwrap();
        circuit.recv_bytes(&wire(&[
            Command::VersionRequest { priority: 0, version: PROTOCOL_VERSION },
            Command::CreateChanRequest { name: "pi".to_string(), cid: 1, version: PROTOCOL_VERSION },
        ]));
        while circuit.next_event().unwrap().is_some() {}
        let sid = circuit.accept_channel(1, ChannelType::Double, 1, AccessRights::ReadWrite).unwrap();
        circuit.take_outgoing();

        circuit.recv_bytes(&wire(&[Command::ClearChannelRequest { sid, cid: 1 }]));
        assert_eq!(circuit.next_event().unwrap(), Some(CircuitEvent::ChannelCleared { cid: 1, sid }));
        assert!(circuit.has_outgoing());
        assert_eq!(circuit.channel(1).unwrap().state, ChannelState::Closed);
    }

    #[test]
    fn test_send_create_marked_in_flight_on_take() {
        let mut circuit = client();
        circuit.handshake("h", "c").unwrap();
        let cid = circuit.create_channel("pi").unwrap();

        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::SendCreate);
        circuit.take_outgoing();
        assert_eq!(circuit.channel(cid).unwrap().state, ChannelState::AwaitCreateResponse);
    }
}
