//! The server-side PV database: typed values with alarm/display/control
//! metadata behind per-channel locks, plus subscription dispatch.
//!
//! The database owns no threads. Writers post events to subscriber queues
//! while holding the channel's write lock, so "value becomes X" and
//! "subscribers learn of X" cannot reorder.

use crate::dbr::convert::{convert_values, ConvertCtx, StringEncoding};
use crate::dbr::{
    AccessRights, AlarmSeverity, AlarmStatus, ChannelType, ControlMeta, DbrMetadata, DbrValue, EnumMeta, EpicsString,
    EventMask, GraphicsMeta, NativeType, StsAckMeta, StsMeta, TimeMeta, TimeStamp, Variant, MAX_ENUM_STATES,
    MAX_ENUM_STRING_SIZE, MAX_UNITS_SIZE,
};
use crate::filters::{parse_pv_name, FilterChain, SyncStates};
use crate::support::{CaError, CaResult, ConvertError};
use hashbrown::HashMap;
use lattice::logging;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};

/// Access-control hook. The default grants everything; servers override this
/// to consult host/user rules.
pub trait AccessPolicy: Send + Sync {
    fn check_access(&self, _host: &str, _user: &str) -> AccessRights {
        AccessRights::ReadWrite
    }
}

/// The default allow-all policy.
pub struct AllowAll;

impl AccessPolicy for AllowAll {}

/// Which change category an event belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventTrigger {
    Value,
    Log,
    Alarm,
    Property,
}

impl EventTrigger {
    #[inline]
    pub fn mask(self) -> EventMask {
        match self {
            EventTrigger::Value => EventMask::VALUE,
            EventTrigger::Log => EventMask::LOG,
            EventTrigger::Alarm => EventMask::ALARM,
            EventTrigger::Property => EventMask::PROPERTY,
        }
    }
}

/// One notification posted to a subscriber queue. The consumer turns these
/// into `EventAddResponse` commands.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub token: u64,
    pub trigger: EventTrigger,
    pub data_type: ChannelType,
    pub metadata: DbrMetadata,
    pub values: DbrValue,
}

struct Subscriber {
    token: u64,
    data_type: ChannelType,
    data_count: usize,
    mask: EventMask,
    filters: FilterChain,
    states: SyncStates,
    queue: Sender<SubscriptionEvent>,
}

/// Per-channel alarm record, including the sticky acknowledgment state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAlarm {
    pub status: AlarmStatus,
    pub severity: AlarmSeverity,
    pub acknowledge_transient: bool,
    pub severity_to_acknowledge: AlarmSeverity,
    pub alarm_string: String,
}

impl Default for ChannelAlarm {
    fn default() -> ChannelAlarm {
        ChannelAlarm {
            status: AlarmStatus::NoAlarm,
            severity: AlarmSeverity::NoAlarm,
            acknowledge_transient: true,
            severity_to_acknowledge: AlarmSeverity::NoAlarm,
            alarm_string: String::new(),
        }
    }
}

/// Display, warning, alarm and control limits. Held as host doubles and cast
/// to the requested native type on read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitSet {
    pub upper_disp_limit: f64,
    pub lower_disp_limit: f64,
    pub upper_alarm_limit: f64,
    pub upper_warning_limit: f64,
    pub lower_warning_limit: f64,
    pub lower_alarm_limit: f64,
    pub upper_ctrl_limit: f64,
    pub lower_ctrl_limit: f64,
}

/// Optional channel attributes supplied at construction.
pub struct ChannelOptions {
    pub units: String,
    pub precision: i16,
    pub limits: LimitSet,
    pub enum_strings: Vec<String>,
    pub max_length: usize,
    pub encoding: StringEncoding,
    pub record_type: String,
}

impl Default for ChannelOptions {
    fn default() -> ChannelOptions {
        ChannelOptions {
            units: String::new(),
            precision: 0,
            limits: LimitSet::default(),
            enum_strings: Vec::new(),
            max_length: 100,
            encoding: StringEncoding::default(),
            record_type: "cyclotron".to_string(),
        }
    }
}

// The mutable heart of a channel, guarded by the RwLock in ChannelData.
struct PvState {
    value: DbrValue,
    timestamp: TimeStamp,
    alarm: ChannelAlarm,
    units: String,
    precision: i16,
    limits: LimitSet,
    enum_strings: Vec<String>,
}

/// One typed process variable.
pub struct ChannelData {
    name: String,
    native: NativeType,
    max_length: usize,
    encoding: StringEncoding,
    record_type: String,
    state: RwLock<PvState>,
    subscribers: Mutex<Vec<Subscriber>>,
    log: logging::Logger,
}

impl ChannelData {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        value: DbrValue,
        options: ChannelOptions,
        log: L,
    ) -> CaResult<ChannelData> {
        if options.enum_strings.len() > MAX_ENUM_STATES {
            return Err(CaError::Convert(ConvertError::TooLong));
        }

        let native = value.native();

        Ok(ChannelData {
            name: name.to_string(),
            native,
            max_length: options.max_length,
            encoding: options.encoding,
            record_type: options.record_type,
            state: RwLock::new(PvState {
                value,
                timestamp: TimeStamp::now(),
                alarm: ChannelAlarm::default(),
                units: options.units,
                precision: options.precision,
                limits: options.limits,
                enum_strings: options.enum_strings,
            }),
            subscribers: Mutex::new(Vec::new()),
            log: logging::component(log),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn native_type(&self) -> NativeType {
        self.native
    }

    pub fn native_count(&self) -> usize {
        self.state.read().expect("Channel state lock poisoned").value.len()
    }

    /// Default access hook; `PvDatabase` consults its policy instead.
    pub fn check_access(&self, _host: &str, _user: &str) -> AccessRights {
        AccessRights::ReadWrite
    }

    // ---- read path -----------------------------------------------------

    /// Produces the promoted metadata block and the converted values for the
    /// requested dtype. Takes the shared lock only.
    pub fn read(&self, data_type: ChannelType) -> CaResult<(DbrMetadata, DbrValue)> {
        let state = self.state.read().expect("Channel state lock poisoned");
        self.build_reading(&state, data_type, 0)
    }

    /// Access-checked read.
    pub fn auth_read(
        &self,
        host: &str,
        user: &str,
        data_type: ChannelType,
        policy: &dyn AccessPolicy,
    ) -> CaResult<(DbrMetadata, DbrValue)> {
        if !policy.check_access(host, user).can_read() {
            logging::debug!(self.log, "read refused";
                            "context" => "auth_read",
                            "channel" => &self.name,
                            "host" => host,
                            "user" => user);
            return Err(CaError::Forbidden);
        }

        self.read(data_type)
    }

    fn build_reading(&self, state: &PvState, data_type: ChannelType, count: usize) -> CaResult<(DbrMetadata, DbrValue)> {
        // The specials are served from the alarm record and the reported
        // record type; cross-type requests are rejected outright.
        match data_type {
            ChannelType::StsackString => {
                let metadata = DbrMetadata::StsAck(StsAckMeta {
                    status: state.alarm.status,
                    severity: state.alarm.severity,
                    ack_transient: state.alarm.acknowledge_transient,
                    severity_to_acknowledge: state.alarm.severity_to_acknowledge,
                });
                let cell = EpicsString::from_bytes(&self.encoding.encode(&state.alarm.alarm_string)?)?;
                return Ok((metadata, DbrValue::String(vec![cell])));
            }
            ChannelType::ClassName => {
                let cell = EpicsString::from_bytes(&self.encoding.encode(&self.record_type)?)?;
                return Ok((DbrMetadata::Plain, DbrValue::String(vec![cell])));
            }
            ChannelType::PutAckt => {
                return Ok((DbrMetadata::Plain, DbrValue::Enum(vec![state.alarm.acknowledge_transient as u16])));
            }
            ChannelType::PutAcks => {
                return Ok((DbrMetadata::Plain, DbrValue::Enum(vec![state.alarm.severity_to_acknowledge as u16])));
            }
            _ => (),
        }

        let ctx = ConvertCtx {
            encoding: self.encoding,
            enum_strings: &state.enum_strings,
            max_length: Some(self.max_length),
        };

        let mut values = convert_values(&state.value, data_type.native(), &ctx)?;
        if count > 0 && values.len() > count {
            let indices: Vec<usize> = (0..count).collect();
            values = values.select(&indices);
        }

        Ok((self.build_metadata(state, data_type)?, values))
    }

    fn build_metadata(&self, state: &PvState, data_type: ChannelType) -> CaResult<DbrMetadata> {
        let alarm = &state.alarm;
        let native = data_type.native();

        Ok(match data_type.variant() {
            Variant::Native => DbrMetadata::Plain,

            Variant::Sts => DbrMetadata::Sts(StsMeta { status: alarm.status, severity: alarm.severity }),

            Variant::Time => DbrMetadata::Time(TimeMeta {
                status: alarm.status,
                severity: alarm.severity,
                stamp: state.timestamp,
            }),

            Variant::Gr | Variant::Ctrl => match native {
                // There is no graphics form for strings; serve the STS block.
                NativeType::String => DbrMetadata::Sts(StsMeta { status: alarm.status, severity: alarm.severity }),

                NativeType::Enum => DbrMetadata::Enum(EnumMeta {
                    status: alarm.status,
                    severity: alarm.severity,
                    strings: enum_cells(&state.enum_strings, self.encoding)?,
                }),

                _ => {
                    let graphics = GraphicsMeta {
                        status: alarm.status,
                        severity: alarm.severity,
                        precision: state.precision,
                        units: unit_cell(&state.units, self.encoding)?,
                        upper_disp_limit: state.limits.upper_disp_limit,
                        lower_disp_limit: state.limits.lower_disp_limit,
                        upper_alarm_limit: state.limits.upper_alarm_limit,
                        upper_warning_limit: state.limits.upper_warning_limit,
                        lower_warning_limit: state.limits.lower_warning_limit,
                        lower_alarm_limit: state.limits.lower_alarm_limit,
                    };

                    if data_type.variant() == Variant::Ctrl {
                        DbrMetadata::Control(ControlMeta {
                            graphics,
                            upper_ctrl_limit: state.limits.upper_ctrl_limit,
                            lower_ctrl_limit: state.limits.lower_ctrl_limit,
                        })
                    } else {
                        DbrMetadata::Graphics(graphics)
                    }
                }
            },
        })
    }

    // ---- write path ----------------------------------------------------

    /// Converts and stores incoming data, stamps the timestamp (the
    /// metadata's if supplied, otherwise now) and notifies subscribers.
    pub fn write(&self, values: &DbrValue, data_type: ChannelType, metadata: Option<&DbrMetadata>) -> CaResult<()> {
        match data_type {
            ChannelType::PutAckt => return self.write_ack_transient(values),
            ChannelType::PutAcks => return self.write_ack_severity(values),
            ChannelType::StsackString | ChannelType::ClassName => {
                return Err(CaError::Convert(ConvertError::SpecialTypeMismatch));
            }
            _ => (),
        }

        let converted = {
            let state = self.state.read().expect("Channel state lock poisoned");
            let ctx = ConvertCtx {
                encoding: self.encoding,
                enum_strings: &state.enum_strings,
                max_length: Some(self.max_length),
            };
            convert_values(values, self.native, &ctx)?
        };

        if self.native == NativeType::Char && converted.len() > self.max_length {
            return Err(CaError::Convert(ConvertError::TooLong));
        }

        let mut state = self.state.write().expect("Channel state lock poisoned");

        state.value = converted;
        state.timestamp = metadata.and_then(DbrMetadata::stamp).unwrap_or_else(TimeStamp::now);

        logging::trace!(self.log, "value written";
                        "context" => "write",
                        "channel" => &self.name,
                        "count" => state.value.len());

        // VALUE always fires; LOG is additionally gated per-subscriber by any
        // dead-band filter attached to it.
        self.notify(&state, EventTrigger::Value);
        self.notify(&state, EventTrigger::Log);

        Ok(())
    }

    /// Access-checked write.
    pub fn auth_write(
        &self,
        host: &str,
        user: &str,
        values: &DbrValue,
        data_type: ChannelType,
        metadata: Option<&DbrMetadata>,
        policy: &dyn AccessPolicy,
    ) -> CaResult<()> {
        if !policy.check_access(host, user).can_write() {
            logging::debug!(self.log, "write refused";
                            "context" => "auth_write",
                            "channel" => &self.name,
                            "host" => host,
                            "user" => user);
            return Err(CaError::Forbidden);
        }

        self.write(values, data_type, metadata)
    }

    fn ack_scalar(values: &DbrValue) -> CaResult<u16> {
        match values {
            DbrValue::Enum(v) if !v.is_empty() => Ok(v[0]),
            DbrValue::Int(v) if !v.is_empty() => Ok(v[0] as u16),
            _ => Err(CaError::Convert(ConvertError::BadString)),
        }
    }

    fn write_ack_transient(&self, values: &DbrValue) -> CaResult<()> {
        let ackt = Self::ack_scalar(values)? != 0;

        let mut state = self.state.write().expect("Channel state lock poisoned");
        state.alarm.acknowledge_transient = ackt;
        self.notify(&state, EventTrigger::Alarm);

        Ok(())
    }

    fn write_ack_severity(&self, values: &DbrValue) -> CaResult<()> {
        let acks = Self::ack_scalar(values)?;

        let mut state = self.state.write().expect("Channel state lock poisoned");

        // Acknowledging at or above the sticky severity clears it; a lower
        // acknowledgment leaves it untouched.
        if acks >= state.alarm.severity_to_acknowledge as u16 {
            state.alarm.severity_to_acknowledge = AlarmSeverity::NoAlarm;
        }

        self.notify(&state, EventTrigger::Alarm);
        Ok(())
    }

    /// Raises or clears the channel alarm. The sticky acknowledgment severity
    /// rises with any alarm at least as severe as itself.
    pub fn write_alarm(&self, status: AlarmStatus, severity: AlarmSeverity, alarm_string: Option<&str>) {
        let mut state = self.state.write().expect("Channel state lock poisoned");

        state.alarm.status = status;
        state.alarm.severity = severity;

        if severity as i16 >= state.alarm.severity_to_acknowledge as i16 {
            state.alarm.severity_to_acknowledge = severity;
        }

        if let Some(text) = alarm_string {
            state.alarm.alarm_string = text.to_string();
        }

        logging::debug!(self.log, "alarm updated";
                        "context" => "write_alarm",
                        "channel" => &self.name,
                        "status" => ?status,
                        "severity" => ?severity);

        self.notify(&state, EventTrigger::Alarm);
    }

    pub fn alarm(&self) -> ChannelAlarm {
        self.state.read().expect("Channel state lock poisoned").alarm.clone()
    }

    // ---- metadata updates ----------------------------------------------

    pub fn set_units(&self, units: &str) {
        let mut state = self.state.write().expect("Channel state lock poisoned");
        state.units = units.to_string();
        self.notify(&state, EventTrigger::Property);
    }

    pub fn set_precision(&self, precision: i16) {
        let mut state = self.state.write().expect("Channel state lock poisoned");
        state.precision = precision;
        self.notify(&state, EventTrigger::Property);
    }

    /// Replaces the limit set. Limits must be ordered lolo ≤ low ≤ high ≤ hihi.
    pub fn set_limits(&self, limits: LimitSet) -> CaResult<()> {
        if !(limits.lower_alarm_limit <= limits.lower_warning_limit
            && limits.lower_warning_limit <= limits.upper_warning_limit
            && limits.upper_warning_limit <= limits.upper_alarm_limit)
        {
            return Err(CaError::Convert(ConvertError::BadString));
        }

        let mut state = self.state.write().expect("Channel state lock poisoned");
        state.limits = limits;
        self.notify(&state, EventTrigger::Property);

        Ok(())
    }

    pub fn set_enum_strings(&self, enum_strings: Vec<String>) -> CaResult<()> {
        if enum_strings.len() > MAX_ENUM_STATES {
            return Err(CaError::Convert(ConvertError::TooLong));
        }

        let mut state = self.state.write().expect("Channel state lock poisoned");
        state.enum_strings = enum_strings;
        self.notify(&state, EventTrigger::Property);

        Ok(())
    }

    // ---- subscriptions -------------------------------------------------

    /// Registers a subscriber queue and immediately posts the first reading,
    /// regardless of mask.
    pub fn subscribe(
        &self,
        token: u64,
        data_type: ChannelType,
        data_count: usize,
        mask: EventMask,
        filters: FilterChain,
        states: SyncStates,
        queue: Sender<SubscriptionEvent>,
    ) -> CaResult<()> {
        let mut filters = filters;

        let first = {
            let state = self.state.read().expect("Channel state lock poisoned");
            let (metadata, values) = self.build_reading(&state, data_type, data_count)?;
            // The read-path rewriters apply to the first reading; the event
            // gates are seeded by it and engage from the next write on.
            let (metadata, values) = filters.apply_read(metadata, values, TimeStamp::now());
            filters.prime(&values, &states);
            SubscriptionEvent { token, trigger: EventTrigger::Value, data_type, metadata, values }
        };

        // A consumer that is already gone is not an error; the subscription
        // simply never materializes.
        let delivered = queue.send(first).is_ok();

        if delivered {
            let mut subscribers = self.subscribers.lock().expect("Subscriber list lock poisoned");
            subscribers.push(Subscriber { token, data_type, data_count, mask, filters, states, queue });

            logging::debug!(self.log, "subscriber attached";
                            "context" => "subscribe",
                            "channel" => &self.name,
                            "token" => token);
        }

        Ok(())
    }

    /// Detaches a subscriber. Idempotent.
    pub fn unsubscribe(&self, token: u64) {
        let mut subscribers = self.subscribers.lock().expect("Subscriber list lock poisoned");
        subscribers.retain(|subscriber| subscriber.token != token);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("Subscriber list lock poisoned").len()
    }

    // Posts one trigger to every matching subscriber. Called with the state
    // write lock held so notification order follows value order.
    fn notify(&self, state: &PvState, trigger: EventTrigger) {
        let mut subscribers = self.subscribers.lock().expect("Subscriber list lock poisoned");

        subscribers.retain_mut(|subscriber| {
            if !subscriber.mask.contains(trigger.mask()) {
                return true;
            }

            // LOG events only flow through subscriptions that carry a
            // dead-band filter; the gate itself decides whether this change
            // clears the band.
            if trigger == EventTrigger::Log && subscriber.filters.is_empty() {
                return true;
            }

            let (metadata, values) = match self.build_reading(state, subscriber.data_type, subscriber.data_count) {
                Ok(reading) => reading,
                Err(_) => return true,
            };

            let now = TimeStamp::now();
            for (metadata, values) in subscriber.filters.filter_event(metadata, values, &subscriber.states, now) {
                let event = SubscriptionEvent {
                    token: subscriber.token,
                    trigger,
                    data_type: subscriber.data_type,
                    metadata,
                    values,
                };

                if subscriber.queue.send(event).is_err() {
                    // Receiver gone; drop the subscription.
                    return false;
                }
            }

            true
        });
    }
}

fn unit_cell(units: &str, encoding: StringEncoding) -> CaResult<[u8; MAX_UNITS_SIZE]> {
    let bytes = encoding.encode(units)?;
    let mut cell = [0u8; MAX_UNITS_SIZE];
    let take = bytes.len().min(MAX_UNITS_SIZE);
    cell[..take].copy_from_slice(&bytes[..take]);
    Ok(cell)
}

fn enum_cells(strings: &[String], encoding: StringEncoding) -> CaResult<Vec<[u8; MAX_ENUM_STRING_SIZE]>> {
    let mut cells = Vec::with_capacity(strings.len());

    for text in strings {
        let bytes = encoding.encode(text)?;
        let mut cell = [0u8; MAX_ENUM_STRING_SIZE];
        let take = bytes.len().min(MAX_ENUM_STRING_SIZE - 1);
        cell[..take].copy_from_slice(&bytes[..take]);
        cells.push(cell);
    }

    Ok(cells)
}

/// The per-server channel table.
pub struct PvDatabase {
    channels: HashMap<String, Arc<ChannelData>>,
    policy: Arc<dyn AccessPolicy>,
    sync_states: SyncStates,
    log: logging::Logger,
}

impl PvDatabase {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> PvDatabase {
        PvDatabase {
            channels: HashMap::new(),
            policy: Arc::new(AllowAll),
            sync_states: SyncStates::new(),
            log: logging::component(log),
        }
    }

    pub fn with_policy<'a, L: Into<Option<&'a logging::Logger>>>(policy: Arc<dyn AccessPolicy>, log: L) -> PvDatabase {
        PvDatabase { channels: HashMap::new(), policy, sync_states: SyncStates::new(), log: logging::component(log) }
    }

    #[inline]
    pub fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    #[inline]
    pub fn sync_states(&self) -> &SyncStates {
        &self.sync_states
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn add_channel(&mut self, channel: ChannelData) -> Arc<ChannelData> {
        let name = channel.name().to_string();
        let channel = Arc::new(channel);

        logging::debug!(self.log, "channel registered"; "context" => "add_channel", "name" => &name);

        self.channels.insert(name, channel.clone());
        channel
    }

    /// Resolves a wire name (base name plus optional filter suffix) to the
    /// channel and its parsed filter chain. `Ok(None)` means no such PV;
    /// malformed filter text is an error and must fail channel creation.
    pub fn lookup(&self, wire_name: &str) -> CaResult<Option<(Arc<ChannelData>, FilterChain)>> {
        let (name, filters) = parse_pv_name(wire_name)?;

        Ok(self.channels.get(&name).map(|channel| (channel.clone(), filters)))
    }
}
