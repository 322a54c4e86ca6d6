//! Channel Access core: wire codec, DBR type system, sans-I/O protocol
//! state machines and the server-side PV database.
//!
//! The crate owns no sockets, threads or clocks beyond reading the system
//! time for timestamps. Drivers feed bytes in (`recv_bytes`, datagrams),
//! pull bytes out (`take_outgoing`) and consume typed events.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod broadcaster;
pub mod circuit;
pub mod codec;
pub mod config;
pub mod dbr;
pub mod filters;
pub mod pvdb;
pub mod support;

/// The protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u16 = 13;

#[cfg(test)]
mod tests {
    //! End-to-end scenarios: a client state machine wired to a server state
    //! machine through in-memory byte buffers, with a PV database behind the
    //! server. No sockets, no threads.

    use crate::broadcaster::{BroadcastEvent, Broadcaster, RegistrationState};
    use crate::circuit::{ChannelState, CircuitEvent, CircuitState, VirtualCircuit};
    use crate::codec::{eca, Command, CommandHeader, DataPayload};
    use crate::dbr::{
        AccessRights, ChannelType, DbrMetadata, DbrValue, EpicsString, EventMask, TimeStamp, Variant,
    };
    use crate::filters::FilterChain;
    use crate::pvdb::{ChannelData, ChannelOptions, PvDatabase, SubscriptionEvent};
    use crate::support::{CaError, ProtocolStep, Role};
    use crate::PROTOCOL_VERSION;
    use hashbrown::HashMap;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    const SERVER_ADDR: &str = "127.0.0.1:5064";

    /// A minimal server driver: one circuit, one database, the subscription
    /// queue drained inline.
    struct TestServer {
        circuit: VirtualCircuit,
        database: PvDatabase,
        sid_map: HashMap<u32, (Arc<ChannelData>, FilterChain)>,
        events_tx: mpsc::Sender<SubscriptionEvent>,
        events_rx: mpsc::Receiver<SubscriptionEvent>,
    }

    impl TestServer {
        fn new(database: PvDatabase) -> TestServer {
            let (events_tx, events_rx) = mpsc::channel();
            let mut circuit =
                VirtualCircuit::new(Role::Server, SERVER_ADDR.parse().unwrap(), 0, None);
            circuit.server_greeting().unwrap();

            TestServer { circuit, database, sid_map: HashMap::new(), events_tx, events_rx }
        }

        fn handle_events(&mut self) {
            while let Some(event) = self.circuit.next_event().unwrap() {
                match event {
                    CircuitEvent::CreateRequested { cid, name, .. } => match self.database.lookup(&name) {
                        Ok(Some((channel, filters))) => {
                            let data_type = ChannelType::promote(channel.native_type(), Variant::Native);
                            let data_count = channel.native_count() as u32;
                            let sid = self
                                .circuit
                                .accept_channel(cid, data_type, data_count, AccessRights::ReadWrite)
                                .unwrap();
                            self.sid_map.insert(sid, (channel, filters));
                        }
                        _ => self.circuit.reject_channel(cid).unwrap(),
                    },

                    CircuitEvent::ReadRequested { ioid, sid, data_type, data_count, .. } => {
                        let (channel, filters) = &self.sid_map[&sid];

                        match channel.read(data_type) {
                            Ok((metadata, values)) => {
                                let (metadata, mut values) =
                                    filters.apply_read(metadata, values, TimeStamp::now());

                                if data_count > 0 && values.len() > data_count as usize {
                                    let indices: Vec<usize> = (0..data_count as usize).collect();
                                    values = values.select(&indices);
                                }

                                let data = DataPayload { data_type, metadata, values };
                                self.circuit.read_response(ioid, data, eca::NORMAL).unwrap();
                            }
                            Err(_) => {
                                let original =
                                    CommandHeader::new(15, 0, data_type.wire_value(), data_count, sid, ioid);
                                self.circuit.error_response(0, eca::GETFAIL, original, "read failed").unwrap();
                            }
                        }
                    }

                    CircuitEvent::WriteRequested { ioid, sid, data } => {
                        let (channel, _) = &self.sid_map[&sid];

                        match channel.write(&data.values, data.data_type, Some(&data.metadata)) {
                            Ok(()) => self
                                .circuit
                                .write_response(ioid, data.data_type, data.count() as u32, eca::NORMAL)
                                .unwrap(),
                            Err(_) => {
                                let original = CommandHeader::new(
                                    19,
                                    0,
                                    data.data_type.wire_value(),
                                    data.count() as u32,
                                    sid,
                                    ioid,
                                );
                                self.circuit.error_response(0, eca::PUTFAIL, original, "write failed").unwrap();
                            }
                        }
                    }

                    CircuitEvent::WritePosted { sid, data } => {
                        let (channel, _) = &self.sid_map[&sid];
                        let _ = channel.write(&data.values, data.data_type, Some(&data.metadata));
                    }

                    CircuitEvent::SubscribeRequested { subscriptionid, sid, data_type, data_count, mask } => {
                        let (channel, filters) = &self.sid_map[&sid];

                        channel
                            .subscribe(
                                u64::from(subscriptionid),
                                data_type,
                                data_count as usize,
                                mask,
                                filters.fresh(),
                                self.database.sync_states().clone(),
                                self.events_tx.clone(),
                            )
                            .unwrap();
                    }

                    CircuitEvent::UnsubscribeRequested { subscriptionid, sid } => {
                        let (channel, _) = &self.sid_map[&sid];
                        channel.unsubscribe(u64::from(subscriptionid));
                        self.circuit.event_cancel_ack(subscriptionid).unwrap();
                    }

                    _ => (),
                }
            }

            while let Ok(event) = self.events_rx.try_recv() {
                let data =
                    DataPayload { data_type: event.data_type, metadata: event.metadata, values: event.values };
                // A racing cancel may have removed the subscription already.
                let _ = self.circuit.event_update(event.token as u32, data, eca::NORMAL);
            }
        }
    }

    /// Shuttles bytes both ways until the pipe drains.
    fn pump(client: &mut VirtualCircuit, server: &mut TestServer) {
        loop {
            let to_server = client.take_outgoing();
            server.circuit.recv_bytes(&to_server);
            server.handle_events();

            let to_client = server.circuit.take_outgoing();
            client.recv_bytes(&to_client);

            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
        }
    }

    fn drain_client(client: &mut VirtualCircuit) -> Vec<CircuitEvent> {
        let mut events = Vec::new();
        while let Some(event) = client.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    fn pi_database() -> PvDatabase {
        let mut database = PvDatabase::new(None);
        database
            .add_channel(ChannelData::new("pi", DbrValue::Double(vec![3.14]), ChannelOptions::default(), None).unwrap());
        database
    }

    /// Drives search, handshake and channel creation; returns the connected
    /// pair and the client-side cid.
    fn connect(database: PvDatabase, name: &str) -> (VirtualCircuit, TestServer, u32) {
        let mut server = TestServer::new(database);
        let mut client = VirtualCircuit::new(Role::Client, SERVER_ADDR.parse().unwrap(), 0, None);

        client.handshake("workstation", "operator").unwrap();
        let cid = client.create_channel(name).unwrap();

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        assert!(events.contains(&CircuitEvent::HandshakeComplete { version: PROTOCOL_VERSION }));
        assert!(events.contains(&CircuitEvent::ChannelConnected { cid }));

        (client, server, cid)
    }

    #[test]
    fn test_scenario_search_connect_read() {
        // Discovery over the broadcaster.
        let mut broadcaster = Broadcaster::new(None);
        let now = Instant::now();

        let register = broadcaster.register(Ipv4Addr::new(127, 0, 0, 1));
        let mut datagram = Vec::new();
        register.encode(&mut datagram).unwrap();

        let repeater: SocketAddr = "127.0.0.1:5065".parse().unwrap();
        let confirm = Command::RepeaterConfirmResponse { repeater_addr: Ipv4Addr::new(127, 0, 0, 1) };
        broadcaster.process_command(confirm, repeater, now);
        assert_eq!(broadcaster.registration(), RegistrationState::Registered);

        let (_, search) = broadcaster.search("pi");
        let cid = match &search {
            Command::SearchRequest { cid, .. } => *cid,
            other => panic!("Unexpected command {:?}", other),
        };

        let response = Command::SearchResponse { port: 5064, addr: None, cid, version: Some(PROTOCOL_VERSION) };
        let events = vec![broadcaster.process_command(response, SERVER_ADDR.parse().unwrap(), now).unwrap()];
        assert_eq!(
            events[0],
            BroadcastEvent::SearchResolved { name: "pi".to_string(), address: SERVER_ADDR.parse().unwrap() }
        );

        let address = broadcaster.lookup("pi", now).unwrap();
        assert_eq!(address, SERVER_ADDR.parse().unwrap());

        // Circuit to the resolved address, then a read.
        let (mut client, mut server, cid) = connect(pi_database(), "pi");

        let channel = client.channel(cid).unwrap();
        assert_eq!(channel.state, ChannelState::Connected);
        assert_eq!(channel.native_type, Some(ChannelType::Double));

        let ioid = client.read_notify(cid, ChannelType::Double, 1).unwrap();
        assert_eq!(ioid, 1);

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        assert_eq!(
            events,
            vec![CircuitEvent::ReadComplete {
                ioid,
                cid,
                status: eca::NORMAL,
                data: DataPayload {
                    data_type: ChannelType::Double,
                    metadata: DbrMetadata::Plain,
                    values: DbrValue::Double(vec![3.14]),
                },
            }]
        );
    }

    #[test]
    fn test_scenario_write_with_notify() {
        let (mut client, mut server, cid) = connect(pi_database(), "pi");

        let data = DataPayload {
            data_type: ChannelType::Double,
            metadata: DbrMetadata::Plain,
            values: DbrValue::Double(vec![5.0]),
        };
        let ioid = client.write_notify(cid, data).unwrap();

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);
        assert_eq!(events, vec![CircuitEvent::WriteComplete { ioid, cid, status: eca::NORMAL }]);

        // A subsequent read observes the written value.
        let ioid = client.read_notify(cid, ChannelType::Double, 1).unwrap();
        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        match &events[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                assert_eq!(data.values, DbrValue::Double(vec![5.0]));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scenario_subscribe_lifecycle() {
        let (mut client, mut server, cid) = connect(pi_database(), "pi");

        let subscriptionid = client.subscribe(cid, ChannelType::TimeDouble, 1, EventMask::VALUE).unwrap();
        assert_eq!(subscriptionid, 0);

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        // The first reading fires immediately after registration.
        assert_eq!(events.len(), 1);
        match &events[0] {
            CircuitEvent::SubscriptionUpdate { subscriptionid: subid, data, .. } => {
                assert_eq!(*subid, subscriptionid);
                assert_eq!(data.values, DbrValue::Double(vec![3.14]));
                assert!(data.metadata.stamp().is_some());
            }
            other => panic!("Unexpected event {:?}", other),
        }

        // Three server-side writes produce three more updates.
        for value in &[1.0, 2.0, 3.0] {
            let channel = server.sid_map.values().next().unwrap().0.clone();
            channel.write(&DbrValue::Double(vec![*value]), ChannelType::Double, None).unwrap();
            server.handle_events();
        }

        pump(&mut client, &mut server);
        let updates = drain_client(&mut client);
        let observed: Vec<f64> = updates
            .iter()
            .map(|event| match event {
                CircuitEvent::SubscriptionUpdate { data, .. } => data.values.scalar_f64(0).unwrap(),
                other => panic!("Unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(observed, vec![1.0, 2.0, 3.0]);

        // Cancellation: one acknowledgment, no further callbacks.
        client.unsubscribe(subscriptionid).unwrap();
        pump(&mut client, &mut server);
        let events = drain_client(&mut client);
        assert_eq!(events, vec![CircuitEvent::SubscriptionCancelled { subscriptionid }]);

        let channel = server.sid_map.values().next().unwrap().0.clone();
        channel.write(&DbrValue::Double(vec![9.0]), ChannelType::Double, None).unwrap();
        server.handle_events();
        pump(&mut client, &mut server);
        assert!(drain_client(&mut client).is_empty());
        assert_eq!(client.subscription_count(), 0);
    }

    #[test]
    fn test_scenario_waveform_roundtrip() {
        let initial: Vec<i32> = (0..4000).collect();
        let mut database = PvDatabase::new(None);
        database.add_channel(
            ChannelData::new("waveform", DbrValue::Long(initial.clone()), ChannelOptions::default(), None).unwrap(),
        );

        let (mut client, mut server, cid) = connect(database, "waveform");
        assert_eq!(client.channel(cid).unwrap().native_count, Some(4000));

        let ioid = client.read_notify(cid, ChannelType::Long, 4000).unwrap();
        pump(&mut client, &mut server);

        match &drain_client(&mut client)[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                assert_eq!(data.values, DbrValue::Long(initial.clone()));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        // The same elements read back as doubles.
        let ioid = client.read_notify(cid, ChannelType::Double, 4000).unwrap();
        pump(&mut client, &mut server);

        match &drain_client(&mut client)[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                match &data.values {
                    DbrValue::Double(v) => {
                        assert_eq!(v.len(), 4000);
                        assert!(v.iter().enumerate().all(|(i, &x)| x == i as f64));
                    }
                    other => panic!("Unexpected value {:?}", other),
                }
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scenario_enum_coercion_over_the_wire() {
        let mut database = PvDatabase::new(None);
        let options = ChannelOptions {
            enum_strings: vec!["Stop".into(), "Start".into(), "Pause".into(), "Resume".into()],
            ..ChannelOptions::default()
        };
        database.add_channel(ChannelData::new("motor:state", DbrValue::Enum(vec![0]), options, None).unwrap());

        let (mut client, mut server, cid) = connect(database, "motor:state");

        // Write the string "Start".
        let data = DataPayload {
            data_type: ChannelType::String,
            metadata: DbrMetadata::Plain,
            values: DbrValue::String(vec![EpicsString::from_bytes(b"Start").unwrap()]),
        };
        client.write_notify(cid, data).unwrap();
        pump(&mut client, &mut server);
        drain_client(&mut client);

        // Read back as ENUM and as STRING.
        let ioid = client.read_notify(cid, ChannelType::Enum, 1).unwrap();
        pump(&mut client, &mut server);
        match &drain_client(&mut client)[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                assert_eq!(data.values, DbrValue::Enum(vec![1]));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        let ioid = client.read_notify(cid, ChannelType::String, 1).unwrap();
        pump(&mut client, &mut server);
        match &drain_client(&mut client)[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                match &data.values {
                    DbrValue::String(cells) => assert_eq!(cells[0].as_bytes(), b"Start"),
                    other => panic!("Unexpected value {:?}", other),
                }
            }
            other => panic!("Unexpected event {:?}", other),
        }

        // Write of an unknown state string fails with an error response.
        let bogus = DataPayload {
            data_type: ChannelType::String,
            metadata: DbrMetadata::Plain,
            values: DbrValue::String(vec![EpicsString::from_bytes(b"bogus").unwrap()]),
        };
        let ioid = client.write_notify(cid, bogus).unwrap();
        pump(&mut client, &mut server);

        match &drain_client(&mut client)[0] {
            CircuitEvent::IoFailed { ioid: failed, status, .. } => {
                assert_eq!(*failed, ioid);
                assert_eq!(*status, eca::PUTFAIL);
            }
            other => panic!("Unexpected event {:?}", other),
        }
        assert_eq!(client.pending_io_count(), 0);
    }

    #[test]
    fn test_scenario_disconnect_drains_pending() {
        let (mut client, _server, cid) = connect(pi_database(), "pi");

        let first = client.read_notify(cid, ChannelType::Double, 1).unwrap();
        let second = client.read_notify(cid, ChannelType::Double, 1).unwrap();
        assert_eq!(client.pending_io_count(), 2);

        // The transport dies before any response arrives.
        let summary = client.disconnect();

        let failed: Vec<u32> = summary.failed_ios.iter().map(|&(ioid, _, _)| ioid).collect();
        assert_eq!(failed, vec![first, second]);
        assert_eq!(client.pending_io_count(), 0);
        assert_eq!(client.state(), CircuitState::Disconnected);
        assert_eq!(client.channel(cid).unwrap().state, ChannelState::Closed);

        assert_eq!(
            client.read_notify(cid, ChannelType::Double, 1),
            Err(CaError::LocalProtocol(ProtocolStep::CircuitClosed))
        );
    }

    #[test]
    fn test_scenario_filtered_channel_read() {
        let mut database = PvDatabase::new(None);
        database.add_channel(
            ChannelData::new("fib", DbrValue::Long(vec![1, 1, 2, 3, 5, 8, 13]), ChannelOptions::default(), None)
                .unwrap(),
        );

        let (mut client, mut server, cid) = connect(database, "fib.[2:5]");

        let ioid = client.read_notify(cid, ChannelType::Long, 0).unwrap();
        pump(&mut client, &mut server);

        match &drain_client(&mut client)[0] {
            CircuitEvent::ReadComplete { ioid: done, data, .. } => {
                assert_eq!(*done, ioid);
                assert_eq!(data.values, DbrValue::Long(vec![2, 3, 5]));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_scenario_unknown_pv_fails_creation() {
        let mut server = TestServer::new(pi_database());
        let mut client = VirtualCircuit::new(Role::Client, SERVER_ADDR.parse().unwrap(), 0, None);

        client.handshake("workstation", "operator").unwrap();
        let cid = client.create_channel("nonexistent").unwrap();

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        assert!(events.contains(&CircuitEvent::ChannelCreateFailed { cid }));
        assert_eq!(client.channel(cid).unwrap().state, ChannelState::Closed);
    }

    #[test]
    fn test_scenario_pending_io_accounting() {
        let (mut client, mut server, cid) = connect(pi_database(), "pi");

        // Issue five reads, answer them all; the table must drain to zero.
        let mut issued = Vec::new();
        for _ in 0..5 {
            issued.push(client.read_notify(cid, ChannelType::Double, 1).unwrap());
        }
        assert_eq!(client.pending_io_count(), 5);

        pump(&mut client, &mut server);
        let events = drain_client(&mut client);

        assert_eq!(events.len(), 5);
        assert_eq!(client.pending_io_count(), 0);
    }
}
