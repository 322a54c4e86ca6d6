//! The datagram-side state machine: repeater registration, name search and
//! beacon surfacing. Owns no socket; the driver shuttles datagrams.

use crate::codec::{decode_datagram, Command};
use crate::support::{CaResult, Role};
use crate::PROTOCOL_VERSION;
use hashbrown::HashMap;
use indexmap::IndexMap;
use lattice::logging;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Resolved search results older than this are discarded on lookup.
pub const SEARCH_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegistrationState {
    Unregistered,
    AwaitConfirm,
    Registered,
}

/// State changes surfaced to the driver, one per qualifying datagram command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BroadcastEvent {
    Registered { repeater_addr: Ipv4Addr },
    SearchResolved { name: String, address: SocketAddr },
    Beacon { version: u16, server_port: u16, beacon_id: u32, address: Option<Ipv4Addr> },
}

pub struct Broadcaster {
    registration: RegistrationState,
    next_cid: u32,
    unanswered_searches: HashMap<u32, String>,
    search_results: IndexMap<String, (SocketAddr, Instant)>,
    log: logging::Logger,
}

impl Broadcaster {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Broadcaster {
        Broadcaster {
            registration: RegistrationState::Unregistered,
            next_cid: 0,
            unanswered_searches: HashMap::new(),
            search_results: IndexMap::new(),
            log: logging::component(log),
        }
    }

    #[inline]
    pub fn registration(&self) -> RegistrationState {
        self.registration
    }

    /// Produces the repeater registration datagram and starts waiting for the
    /// confirmation.
    pub fn register(&mut self, local_addr: Ipv4Addr) -> Command {
        self.registration = RegistrationState::AwaitConfirm;

        logging::debug!(self.log, "registering with repeater";
                        "context" => "register",
                        "local_addr" => %local_addr);

        Command::RepeaterRegisterRequest { client_addr: local_addr }
    }

    /// Marks registration as implicit. Used when the address list names an
    /// explicit port, which the protocol treats as pre-registered.
    pub fn mark_registered(&mut self) {
        self.registration = RegistrationState::Registered;
    }

    /// Allocates a search cid and produces the standard two-command search
    /// bundle. The caller transmits it to every configured destination.
    pub fn search(&mut self, name: &str) -> (Command, Command) {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        self.unanswered_searches.insert(cid, name.to_string());

        logging::debug!(self.log, "searching for channel";
                        "context" => "search",
                        "name" => name,
                        "cid" => cid);

        (
            Command::VersionRequest { priority: 0, version: PROTOCOL_VERSION },
            Command::SearchRequest { name: name.to_string(), cid, version: PROTOCOL_VERSION, reply: false },
        )
    }

    #[inline]
    pub fn unanswered_searches(&self) -> usize {
        self.unanswered_searches.len()
    }

    /// Decodes one received datagram and applies every command in it. A
    /// malformed datagram is rejected wholesale without touching state.
    pub fn recv_datagram(&mut self, bytes: &[u8], sender: SocketAddr, now: Instant) -> CaResult<Vec<BroadcastEvent>> {
        let commands = decode_datagram(bytes, Role::Server)?;

        Ok(commands
            .into_iter()
            .filter_map(|command| self.process_command(command, sender, now))
            .collect())
    }

    /// Applies a single datagram command, returning the event it caused.
    pub fn process_command(&mut self, command: Command, sender: SocketAddr, now: Instant) -> Option<BroadcastEvent> {
        match command {
            Command::RepeaterConfirmResponse { repeater_addr } => {
                if self.registration == RegistrationState::Registered {
                    logging::trace!(self.log, "duplicate repeater confirmation"; "context" => "process");
                    return None;
                }

                self.registration = RegistrationState::Registered;

                logging::debug!(self.log, "repeater registration confirmed";
                                "context" => "process",
                                "repeater_addr" => %repeater_addr);

                Some(BroadcastEvent::Registered { repeater_addr })
            }

            Command::SearchResponse { port, addr, cid, .. } => {
                let name = match self.unanswered_searches.remove(&cid) {
                    Some(name) => name,
                    None => {
                        // Duplicate responses for an answered cid are dropped,
                        // first responder wins.
                        logging::trace!(self.log, "discarding duplicate search response";
                                        "context" => "process",
                                        "cid" => cid);
                        return None;
                    }
                };

                let ip = addr.map(std::net::IpAddr::V4).unwrap_or_else(|| sender.ip());
                let address = SocketAddr::new(ip, port);

                logging::debug!(self.log, "search resolved";
                                "context" => "process",
                                "name" => &name,
                                "address" => %address);

                self.search_results.insert(name.clone(), (address, now));

                Some(BroadcastEvent::SearchResolved { name, address })
            }

            Command::RsrvIsUpResponse { version, server_port, beacon_id, addr } => {
                // Beacons never mutate broadcaster state.
                Some(BroadcastEvent::Beacon { version, server_port, beacon_id, address: addr })
            }

            Command::NotFoundResponse { cid, .. } => {
                // The search stays outstanding; another responder may own it.
                logging::trace!(self.log, "search not found"; "context" => "process", "cid" => cid);
                None
            }

            Command::VersionResponse { .. } => None,

            other => {
                logging::warn!(self.log, "ignoring unexpected datagram command";
                               "context" => "process",
                               "command" => ?other);
                None
            }
        }
    }

    /// Returns the resolved address for `name`, discarding stale entries.
    pub fn lookup(&mut self, name: &str, now: Instant) -> Option<SocketAddr> {
        match self.search_results.get(name) {
            Some(&(address, resolved_at)) => {
                if now.duration_since(resolved_at) > SEARCH_STALE_AFTER {
                    logging::debug!(self.log, "discarding stale search result";
                                    "context" => "lookup",
                                    "name" => name);
                    self.search_results.swap_remove(name);
                    return None;
                }

                Some(address)
            }
            None => None,
        }
    }
}
