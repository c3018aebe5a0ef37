//! Sans-IO NAT discovery state machine
//!
//! [`Discovery`] never touches a socket or reads the clock. The driver feeds it
//! datagrams, resolution results and timer expiries, then drains the
//! [`Command`]s it produces.
//!
//! Probe sequence:
//!
//! | State | Destination | Purpose |
//! |---|---|---|
//! | ProbeA | primary address, primary port | mapped address, learn alternate endpoint |
//! | ProbeB | primary address, alternate port | binding vs. port |
//! | ProbeC | alternate address, primary port | binding vs. address |
//! | ProbeD | alternate address, alternate port | completes the mapping table |
//! | FilterDiscovery | primary endpoint with CHANGE-REQUEST | filtering behavior |

use super::{ClientConfig, ClientError, DiscoveryOptions};
use crate::dns;
use crate::event::EventSink;
use crate::message::{Attribute, ChangeRequest, EncodeError, Message, MessageType, Timestamp};
use crate::timer::{Backoff, RetransmitTimer, TickOutcome};
use crate::types::{DependencyType, FilterState, NatType, ResultCode};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Index of the address-dependence filter sub-probe
const FILTER_ADDRESS: usize = 0;
/// Index of the port-dependence filter sub-probe
const FILTER_PORT: usize = 1;

/// Local sockets used by a discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketId {
    /// Socket used for the binding probes
    Primary,
    /// Second socket opened for filter discovery
    Filter,
}

/// Discovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started
    Idle,
    /// Waiting for the server host name to resolve
    Resolving,
    /// Probing primary address and port
    ProbeA,
    /// Probing primary address, alternate port
    ProbeB,
    /// Probing alternate address, primary port
    ProbeC,
    /// Probing alternate address and port
    ProbeD,
    /// Running the two filtering sub-probes
    FilterDiscovery,
    /// Finished
    Complete,
}

impl DiscoveryState {
    /// Slot in the mapped-address table filled by this probe
    fn mapped_slot(self) -> Option<usize> {
        match self {
            Self::ProbeA => Some(0),
            Self::ProbeB => Some(1),
            Self::ProbeC => Some(2),
            Self::ProbeD => Some(3),
            _ => None,
        }
    }
}

/// Datagram to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Socket to send from
    pub socket: SocketId,
    /// Destination
    pub dst: SocketAddrV4,
    /// Encoded message
    pub payload: Vec<u8>,
}

/// Action requested from the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Resolve the server host name and call [`Discovery::handle_resolved`]
    Resolve(String),
    /// Open a local socket on the configured local address
    Bind(SocketId),
    /// Send a datagram
    Send(Transmit),
    /// The run is over; emitted exactly once
    Complete(ResultCode),
}

/// Decides whether an address belongs to this host
pub trait InterfaceCheck: Send {
    /// Returns `Ok(false)` when the address is not assigned locally
    ///
    /// # Errors
    ///
    /// Any error other than "address not available" leaves NAT presence
    /// undetermined.
    fn is_local_address(&self, ip: Ipv4Addr) -> io::Result<bool>;
}

/// [`InterfaceCheck`] backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceCheck for SystemInterfaces {
    fn is_local_address(&self, ip: Ipv4Addr) -> io::Result<bool> {
        dns::is_local_address(ip)
    }
}

/// Running mean of RTT samples
#[derive(Debug, Clone, Copy, Default)]
struct Rtt {
    sum_ms: u64,
    samples: u32,
}

impl Rtt {
    fn add_sample(&mut self, ms: u16) {
        self.sum_ms += u64::from(ms);
        self.samples += 1;
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum_ms as f64 / f64::from(self.samples)
        }
    }
}

/// A request waiting for its response
#[derive(Debug)]
struct Outstanding {
    request: Message,
    socket: SocketId,
    dst: SocketAddrV4,
    backoff: Backoff,
}

impl Outstanding {
    fn new(socket: SocketId, dst: SocketAddrV4, change: Option<ChangeRequest>) -> Self {
        let mut request = Message::binding_request();
        if let Some(change) = change {
            request.add_attribute(Attribute::ChangeRequest(change));
        }
        Self {
            request,
            socket,
            dst,
            backoff: Backoff::new(),
        }
    }

    fn matches(&self, response: &Message) -> bool {
        response.transaction_id() == self.request.transaction_id()
    }

    /// Encode the request, refreshing the timestamp first
    fn transmit(&mut self, timestamp: Option<u16>) -> Result<Transmit, EncodeError> {
        if let Some(timestamp) = timestamp {
            self.request.add_attribute(Attribute::Timestamp(Timestamp {
                resp_delay: 0,
                timestamp,
            }));
        }
        Ok(Transmit {
            socket: self.socket,
            dst: self.dst,
            payload: self.request.encode()?,
        })
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    /// Result code, if the run completed
    pub result: Option<ResultCode>,
    /// Whether a NAT was detected
    pub natted: bool,
    /// NAT binding behavior
    pub binding: DependencyType,
    /// NAT filtering behavior
    pub filter: DependencyType,
    /// Named NAT category
    pub nat_type: NatType,
    /// Address observed by the server for the first probe
    pub mapped: Option<SocketAddrV4>,
    /// Mean round-trip time in milliseconds
    pub rtt_ms: f64,
}

impl fmt::Display for DiscoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.result {
            Some(code) => write!(f, "Complete({code}): ")?,
            None => write!(f, "Incomplete: ")?,
        }
        write!(
            f,
            "{} NB={} EF={} ({}) mapped=",
            if self.natted { "Natted" } else { "Open" },
            self.binding,
            self.filter,
            self.nat_type,
        )?;
        match self.mapped {
            Some(addr) => write!(f, "{addr}")?,
            None => write!(f, "-")?,
        }
        write!(f, " rtt={}", self.rtt_ms)
    }
}

/// NAT discovery state machine for a single run
pub struct Discovery {
    server_host: String,
    server_port: u16,
    local_addr: Ipv4Addr,
    timestamps: bool,
    binding_only: bool,
    interfaces: Box<dyn InterfaceCheck>,
    events: EventSink,

    state: DiscoveryState,
    started_at: Option<Instant>,
    primary: Option<SocketAddrV4>,
    secondary: Option<SocketAddrV4>,
    mapped: [Option<SocketAddrV4>; 4],
    natted: Option<bool>,

    probe: Option<Outstanding>,
    filters: [Option<Outstanding>; 2],
    filter_states: [FilterState; 2],
    timer: RetransmitTimer,
    rtt: Rtt,

    result: Option<ResultCode>,
    commands: VecDeque<Command>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("state", &self.state)
            .field("mapped", &self.mapped)
            .field("natted", &self.natted)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl Discovery {
    /// Create a run against the configured server
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoServerAddress`] if no server is configured.
    pub fn new(config: &ClientConfig, options: DiscoveryOptions) -> Result<Self, ClientError> {
        let server_host = config
            .server
            .as_deref()
            .filter(|host| !host.is_empty())
            .ok_or(ClientError::NoServerAddress)?
            .to_string();

        Ok(Self {
            server_host,
            server_port: config.port,
            local_addr: config.local_addr,
            timestamps: config.timestamps,
            binding_only: options.binding_only,
            interfaces: Box::new(SystemInterfaces),
            events: EventSink::new(),
            state: DiscoveryState::Idle,
            started_at: None,
            primary: None,
            secondary: None,
            mapped: [None; 4],
            natted: None,
            probe: None,
            filters: [None, None],
            filter_states: [FilterState::Unknown; 2],
            timer: RetransmitTimer::new(),
            rtt: Rtt::default(),
            result: None,
            commands: VecDeque::new(),
        })
    }

    /// Replace the interface check used to decide NAT presence
    #[must_use]
    pub fn with_interface_check(mut self, check: impl InterfaceCheck + 'static) -> Self {
        self.set_interface_check(Box::new(check));
        self
    }

    pub(super) fn set_interface_check(&mut self, check: Box<dyn InterfaceCheck>) {
        self.interfaces = check;
    }

    /// Report protocol errors to `events` as well as `tracing`
    #[must_use]
    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Begin the run
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] unless the machine is idle, and
    /// propagates encode failures of the first probe.
    pub fn start(&mut self, now: Instant) -> Result<(), ClientError> {
        if self.state != DiscoveryState::Idle {
            return Err(ClientError::InvalidState);
        }
        self.started_at = Some(now);

        match self.server_host.parse::<Ipv4Addr>() {
            Ok(ip) => Ok(self.begin_probing(ip, now)?),
            Err(_) => {
                tracing::debug!("Resolving STUN server {}", self.server_host);
                self.state = DiscoveryState::Resolving;
                self.commands
                    .push_back(Command::Resolve(self.server_host.clone()));
                Ok(())
            }
        }
    }

    /// Feed the outcome of a [`Command::Resolve`]
    ///
    /// # Errors
    ///
    /// Propagates encode failures of the first probe.
    pub fn handle_resolved(
        &mut self,
        result: io::Result<Ipv4Addr>,
        now: Instant,
    ) -> Result<(), EncodeError> {
        if self.state != DiscoveryState::Resolving {
            return Ok(());
        }

        match result {
            Ok(ip) => self.begin_probing(ip, now),
            Err(e) => {
                self.events
                    .warn(format!("Failed to resolve {}: {}", self.server_host, e));
                self.complete(ResultCode::HostNotFound);
                Ok(())
            }
        }
    }

    /// Feed a datagram received on `socket`
    ///
    /// Undecodable datagrams and responses to anything but the outstanding
    /// request(s) are dropped.
    ///
    /// # Errors
    ///
    /// Propagates encode failures of the next probe.
    pub fn handle_input(
        &mut self,
        socket: SocketId,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), EncodeError> {
        let response = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Dropping datagram from {}: {}", from, e);
                return Ok(());
            }
        };

        if response.message_type() != MessageType::BindingResponse {
            tracing::debug!(
                "Ignoring message type 0x{:04X} from {}",
                response.message_type().code(),
                from
            );
            return Ok(());
        }

        match self.state {
            DiscoveryState::ProbeA
            | DiscoveryState::ProbeB
            | DiscoveryState::ProbeC
            | DiscoveryState::ProbeD => {
                if self.probe.as_ref().is_some_and(|p| p.matches(&response)) {
                    self.handle_probe_response(&response, now)?;
                } else {
                    tracing::debug!("Stale response from {} on {:?}", from, socket);
                }
            }
            DiscoveryState::FilterDiscovery => self.handle_filter_response(&response, from),
            _ => tracing::debug!("Unexpected response from {} in {:?}", from, self.state),
        }

        Ok(())
    }

    /// Process elapsed timer ticks
    ///
    /// # Errors
    ///
    /// Propagates encode failures of a retransmission.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), EncodeError> {
        let ticks = self.timer.expired_ticks(now);
        for _ in 0..ticks {
            match self.state {
                DiscoveryState::FilterDiscovery => self.tick_filters(now)?,
                DiscoveryState::ProbeA
                | DiscoveryState::ProbeB
                | DiscoveryState::ProbeC
                | DiscoveryState::ProbeD => self.tick_probe(now)?,
                _ => break,
            }
        }
        Ok(())
    }

    /// Deadline of the next timer tick
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Next command for the driver
    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Result code once complete
    #[must_use]
    pub fn result(&self) -> Option<ResultCode> {
        self.result
    }

    /// NAT presence, `None` while undetermined
    #[must_use]
    pub fn natted(&self) -> Option<bool> {
        self.natted
    }

    /// Whether a NAT was detected
    #[must_use]
    pub fn is_natted(&self) -> bool {
        self.natted == Some(true)
    }

    /// NAT binding behavior
    #[must_use]
    pub fn binding_type(&self) -> DependencyType {
        if self.natted == Some(false) {
            return DependencyType::Independent;
        }
        DependencyType::from_mappings(&self.mapped)
    }

    /// NAT filtering behavior
    #[must_use]
    pub fn filter_type(&self) -> DependencyType {
        if self.natted == Some(false) {
            return DependencyType::Independent;
        }
        DependencyType::from_filters(
            self.filter_states[FILTER_ADDRESS],
            self.filter_states[FILTER_PORT],
        )
    }

    /// Named NAT category
    #[must_use]
    pub fn nat_type(&self) -> NatType {
        NatType::classify(
            self.natted,
            self.mapped[0].is_some(),
            self.binding_type(),
            self.filter_type(),
        )
    }

    /// Human readable NAT category
    #[must_use]
    pub fn nat_type_name(&self) -> &'static str {
        self.nat_type().name()
    }

    /// Address observed by the server for the first probe
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddrV4> {
        self.mapped[0]
    }

    /// Alternate server endpoint learned from the first response
    #[must_use]
    pub fn changed_address(&self) -> Option<SocketAddrV4> {
        self.secondary
    }

    /// Mean round-trip time in milliseconds, 0 without samples
    #[must_use]
    pub fn round_trip_time_ms(&self) -> f64 {
        self.rtt.mean()
    }

    /// Snapshot of everything learned so far
    #[must_use]
    pub fn report(&self) -> DiscoveryReport {
        DiscoveryReport {
            result: self.result,
            natted: self.is_natted(),
            binding: self.binding_type(),
            filter: self.filter_type(),
            nat_type: self.nat_type(),
            mapped: self.mapped_address(),
            rtt_ms: self.round_trip_time_ms(),
        }
    }

    fn begin_probing(&mut self, ip: Ipv4Addr, now: Instant) -> Result<(), EncodeError> {
        let primary = SocketAddrV4::new(ip, self.server_port);
        tracing::debug!("Starting binding discovery against {}", primary);
        self.primary = Some(primary);
        self.commands.push_back(Command::Bind(SocketId::Primary));
        self.enter_probe(DiscoveryState::ProbeA, primary, now)
    }

    fn enter_probe(
        &mut self,
        state: DiscoveryState,
        dst: SocketAddrV4,
        now: Instant,
    ) -> Result<(), EncodeError> {
        self.timer.disarm();
        self.state = state;

        let mut probe = Outstanding::new(SocketId::Primary, dst, None);
        let transmit = probe.transmit(self.timestamp(now))?;
        self.commands.push_back(Command::Send(transmit));
        self.probe = Some(probe);

        self.timer.arm(now);
        Ok(())
    }

    fn enter_filter_discovery(&mut self, now: Instant) -> Result<(), EncodeError> {
        self.timer.disarm();
        self.probe = None;
        self.state = DiscoveryState::FilterDiscovery;

        let Some(primary) = self.primary else {
            self.complete(ResultCode::NbIncomplete);
            return Ok(());
        };

        tracing::debug!("Starting filter discovery against {}", primary);
        self.commands.push_back(Command::Bind(SocketId::Filter));

        let changes = [
            ChangeRequest {
                change_ip: true,
                change_port: true,
            },
            ChangeRequest {
                change_ip: false,
                change_port: true,
            },
        ];
        for (slot, change) in changes.into_iter().enumerate() {
            let mut sub_probe = Outstanding::new(SocketId::Filter, primary, Some(change));
            let transmit = sub_probe.transmit(self.timestamp(now))?;
            self.commands.push_back(Command::Send(transmit));
            self.filters[slot] = Some(sub_probe);
        }

        self.timer.arm(now);
        Ok(())
    }

    fn handle_probe_response(&mut self, response: &Message, now: Instant) -> Result<(), EncodeError> {
        let Some(slot) = self.state.mapped_slot() else {
            return Ok(());
        };

        let Some(mapped) = response.mapped_address() else {
            self.events
                .warn(format!("Response in {:?} lacks MAPPED-ADDRESS", self.state));
            return Ok(());
        };

        if self.state == DiscoveryState::ProbeA {
            let Some(changed) = response.changed_address() else {
                self.events
                    .warn(format!("Response in {:?} lacks CHANGED-ADDRESS", self.state));
                return Ok(());
            };
            tracing::debug!("Alternate server endpoint {}", changed);
            self.secondary = Some(changed);
        }

        if let Some(ts) = response.timestamp() {
            let sample = self
                .elapsed_ms16(now)
                .wrapping_sub(ts.timestamp)
                .wrapping_sub(ts.resp_delay);
            self.rtt.add_sample(sample);
        }

        tracing::debug!("Mapped address {} in {:?}", mapped, self.state);
        self.mapped[slot] = Some(mapped);
        self.probe = None;

        if self.state == DiscoveryState::ProbeA {
            self.natted = self.detect_nat(mapped);
        }

        let (Some(primary), Some(secondary)) = (self.primary, self.secondary) else {
            return Ok(());
        };

        match self.state {
            DiscoveryState::ProbeA => self.enter_probe(
                DiscoveryState::ProbeB,
                SocketAddrV4::new(*primary.ip(), secondary.port()),
                now,
            ),
            DiscoveryState::ProbeB => self.enter_probe(
                DiscoveryState::ProbeC,
                SocketAddrV4::new(*secondary.ip(), primary.port()),
                now,
            ),
            DiscoveryState::ProbeC => self.enter_probe(DiscoveryState::ProbeD, secondary, now),
            _ => {
                if self.natted == Some(false) || self.binding_only {
                    self.complete(ResultCode::Ok);
                    Ok(())
                } else {
                    self.enter_filter_discovery(now)
                }
            }
        }
    }

    fn handle_filter_response(&mut self, response: &Message, from: SocketAddr) {
        let Some(slot) = self
            .filters
            .iter()
            .position(|f| f.as_ref().is_some_and(|f| f.matches(response)))
        else {
            tracing::debug!("Stale filter response from {}", from);
            return;
        };

        tracing::debug!("Filter sub-probe {} answered from {}", slot, from);
        self.filters[slot] = None;
        self.filter_states[slot] = FilterState::Independent;
        self.finish_filters_if_resolved();
    }

    fn tick_probe(&mut self, now: Instant) -> Result<(), EncodeError> {
        let Some(mut probe) = self.probe.take() else {
            return Ok(());
        };

        match probe.backoff.tick() {
            TickOutcome::Wait => {}
            TickOutcome::Retransmit => {
                tracing::debug!(
                    "Retransmitting {:?} (retrans={})",
                    self.state,
                    probe.backoff.retrans_count()
                );
                let transmit = probe.transmit(self.timestamp(now))?;
                self.commands.push_back(Command::Send(transmit));
            }
            TickOutcome::Exhausted => {
                tracing::debug!("{:?} exhausted retransmissions", self.state);
                let code = if self.state == DiscoveryState::ProbeA {
                    ResultCode::UdpBlocked
                } else {
                    ResultCode::NbIncomplete
                };
                self.complete(code);
                return Ok(());
            }
        }

        self.probe = Some(probe);
        Ok(())
    }

    fn tick_filters(&mut self, now: Instant) -> Result<(), EncodeError> {
        for slot in 0..self.filters.len() {
            let Some(mut sub_probe) = self.filters[slot].take() else {
                continue;
            };

            match sub_probe.backoff.tick() {
                TickOutcome::Wait => self.filters[slot] = Some(sub_probe),
                TickOutcome::Retransmit => {
                    let transmit = sub_probe.transmit(self.timestamp(now))?;
                    self.commands.push_back(Command::Send(transmit));
                    self.filters[slot] = Some(sub_probe);
                }
                TickOutcome::Exhausted => {
                    tracing::debug!("Filter sub-probe {} unanswered", slot);
                    self.filter_states[slot] = FilterState::Dependent;
                }
            }
        }

        self.finish_filters_if_resolved();
        Ok(())
    }

    fn finish_filters_if_resolved(&mut self) {
        if self
            .filter_states
            .iter()
            .all(|state| *state != FilterState::Unknown)
        {
            self.complete(ResultCode::Ok);
        }
    }

    fn detect_nat(&self, mapped: SocketAddrV4) -> Option<bool> {
        if !self.local_addr.is_unspecified() {
            return Some(*mapped.ip() != self.local_addr);
        }

        match self.interfaces.is_local_address(*mapped.ip()) {
            Ok(local) => Some(!local),
            Err(e) => {
                self.events
                    .warn(format!("Interface check for {} failed: {}", mapped.ip(), e));
                None
            }
        }
    }

    fn complete(&mut self, code: ResultCode) {
        if self.state == DiscoveryState::Complete {
            return;
        }
        self.timer.disarm();
        self.probe = None;
        self.filters = [None, None];
        self.state = DiscoveryState::Complete;
        self.result = Some(code);
        tracing::info!("Discovery complete: {:?}", code);
        self.commands.push_back(Command::Complete(code));
    }

    fn elapsed_ms16(&self, now: Instant) -> u16 {
        let ms = self
            .started_at
            .map_or(0, |start| now.saturating_duration_since(start).as_millis());
        (ms & 0xFFFF) as u16
    }

    fn timestamp(&self, now: Instant) -> Option<u16> {
        self.timestamps.then(|| self.elapsed_ms16(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 3478);
    const ALTERNATE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 2), 3479);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    struct FixedInterfaces(io::Result<bool>);

    impl InterfaceCheck for FixedInterfaces {
        fn is_local_address(&self, _ip: Ipv4Addr) -> io::Result<bool> {
            match &self.0 {
                Ok(local) => Ok(*local),
                Err(e) => Err(io::Error::new(e.kind(), "interface check failed")),
            }
        }
    }

    fn config(server: &str, local_addr: Ipv4Addr) -> ClientConfig {
        ClientConfig {
            server: Some(server.to_string()),
            local_addr,
            ..ClientConfig::default()
        }
    }

    fn discovery(options: DiscoveryOptions) -> Discovery {
        Discovery::new(&config("192.0.2.1", LOCAL), options).unwrap()
    }

    fn drain(disco: &mut Discovery) -> Vec<Command> {
        std::iter::from_fn(|| disco.poll_command()).collect()
    }

    fn sends(commands: &[Command]) -> Vec<Transmit> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Send(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Build the server's answer to `transmit`
    fn answer(transmit: &Transmit, mapped: SocketAddrV4, changed: Option<SocketAddrV4>) -> Vec<u8> {
        let request = Message::decode(&transmit.payload).unwrap();
        let mut response = Message::response_to(&request);
        response.add_attribute(Attribute::MappedAddress(mapped));
        if let Some(changed) = changed {
            response.add_attribute(Attribute::ChangedAddress(changed));
        }
        if let Some(ts) = request.timestamp() {
            response.add_attribute(Attribute::Timestamp(ts));
        }
        response.encode().unwrap()
    }

    /// Answer each binding probe with the given mapped ports
    fn run_binding_probes(
        disco: &mut Discovery,
        start: Instant,
        mapped_ip: Ipv4Addr,
        ports: [u16; 4],
    ) -> Vec<Command> {
        disco.start(start).unwrap();
        let mut commands = drain(disco);

        for (i, port) in ports.into_iter().enumerate() {
            let transmit = sends(&commands).pop().unwrap();
            let changed = (i == 0).then_some(ALTERNATE);
            let bytes = answer(&transmit, SocketAddrV4::new(mapped_ip, port), changed);
            let now = start + Duration::from_millis(10 * (i as u64 + 1));
            disco
                .handle_input(SocketId::Primary, transmit.dst.into(), &bytes, now)
                .unwrap();
            commands = drain(disco);
        }
        commands
    }

    /// Fire timer deadlines until the run completes
    fn run_timeouts(disco: &mut Discovery) -> (Vec<Command>, Option<Instant>) {
        let mut commands = Vec::new();
        let mut last = None;
        while let Some(deadline) = disco.poll_timeout() {
            disco.handle_timeout(deadline).unwrap();
            commands.extend(drain(disco));
            last = Some(deadline);
        }
        (commands, last)
    }

    #[test]
    fn test_start_with_literal_address() {
        let mut disco = discovery(DiscoveryOptions::default());
        disco.start(Instant::now()).unwrap();

        let commands = drain(&mut disco);
        assert_eq!(commands[0], Command::Bind(SocketId::Primary));
        let transmit = sends(&commands).pop().unwrap();
        assert_eq!(transmit.socket, SocketId::Primary);
        assert_eq!(transmit.dst, SERVER);
        assert_eq!(disco.state(), DiscoveryState::ProbeA);

        let request = Message::decode(&transmit.payload).unwrap();
        assert_eq!(request.message_type(), MessageType::BindingRequest);
        assert_eq!(request.timestamp().unwrap().timestamp, 0);
    }

    #[test]
    fn test_missing_server_rejected() {
        let config = ClientConfig::default();
        assert!(matches!(
            Discovery::new(&config, DiscoveryOptions::default()),
            Err(ClientError::NoServerAddress)
        ));
    }

    #[test]
    fn test_resolution_failure_is_host_not_found() {
        let mut disco =
            Discovery::new(&config("stun.invalid", LOCAL), DiscoveryOptions::default()).unwrap();
        let now = Instant::now();
        disco.start(now).unwrap();
        assert_eq!(
            drain(&mut disco),
            vec![Command::Resolve("stun.invalid".to_string())]
        );
        assert_eq!(disco.state(), DiscoveryState::Resolving);

        disco
            .handle_resolved(Err(io::Error::from(io::ErrorKind::NotFound)), now)
            .unwrap();
        assert_eq!(
            drain(&mut disco),
            vec![Command::Complete(ResultCode::HostNotFound)]
        );
        assert_eq!(disco.poll_timeout(), None);
    }

    #[test]
    fn test_resolution_success_starts_probing() {
        let mut disco =
            Discovery::new(&config("stun.example", LOCAL), DiscoveryOptions::default()).unwrap();
        let now = Instant::now();
        disco.start(now).unwrap();
        drain(&mut disco);

        disco.handle_resolved(Ok(*SERVER.ip()), now).unwrap();
        let commands = drain(&mut disco);
        assert_eq!(commands[0], Command::Bind(SocketId::Primary));
        assert_eq!(sends(&commands)[0].dst, SERVER);
    }

    #[test]
    fn test_udp_blocked_after_nine_transmissions() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let first = drain(&mut disco);

        let (commands, last) = run_timeouts(&mut disco);
        assert_eq!(sends(&first).len() + sends(&commands).len(), 9);
        assert_eq!(
            commands.last(),
            Some(&Command::Complete(ResultCode::UdpBlocked))
        );
        assert_eq!(last, Some(start + Duration::from_millis(9500)));
        assert_eq!(disco.nat_type_name(), "UDP blocked");
        assert!(!disco.is_natted());
    }

    #[test]
    fn test_retransmission_refreshes_timestamp() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let first = sends(&drain(&mut disco)).pop().unwrap();

        disco.handle_timeout(start + Duration::from_millis(100)).unwrap();
        let second = sends(&drain(&mut disco)).pop().unwrap();

        let a = Message::decode(&first.payload).unwrap();
        let b = Message::decode(&second.payload).unwrap();
        assert_eq!(a.transaction_id(), b.transaction_id());
        assert_eq!(b.timestamp().unwrap().timestamp, 100);
    }

    #[test]
    fn test_open_internet_skips_filter_discovery() {
        let mut disco = discovery(DiscoveryOptions::default());
        let commands = run_binding_probes(&mut disco, Instant::now(), LOCAL, [5000; 4]);

        assert_eq!(commands, vec![Command::Complete(ResultCode::Ok)]);
        assert!(!disco.is_natted());
        assert_eq!(disco.binding_type(), DependencyType::Independent);
        assert_eq!(disco.filter_type(), DependencyType::Independent);
        assert_eq!(disco.nat_type_name(), "Open to internet");
        assert_eq!(disco.mapped_address(), Some(SocketAddrV4::new(LOCAL, 5000)));
        assert_eq!(disco.changed_address(), Some(ALTERNATE));
    }

    #[test]
    fn test_probe_destinations() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let mut commands = drain(&mut disco);
        let mut destinations = Vec::new();

        for i in 0..4 {
            let transmit = sends(&commands).pop().unwrap();
            destinations.push(transmit.dst);
            let bytes = answer(
                &transmit,
                SocketAddrV4::new(LOCAL, 5000),
                (i == 0).then_some(ALTERNATE),
            );
            disco
                .handle_input(SocketId::Primary, transmit.dst.into(), &bytes, start)
                .unwrap();
            commands = drain(&mut disco);
        }

        assert_eq!(
            destinations,
            vec![
                SERVER,
                SocketAddrV4::new(*SERVER.ip(), ALTERNATE.port()),
                SocketAddrV4::new(*ALTERNATE.ip(), SERVER.port()),
                ALTERNATE,
            ]
        );
    }

    #[test]
    fn test_full_cone() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        let public = Ipv4Addr::new(203, 0, 113, 9);
        let commands = run_binding_probes(&mut disco, start, public, [40000; 4]);

        assert_eq!(disco.state(), DiscoveryState::FilterDiscovery);
        assert_eq!(commands[0], Command::Bind(SocketId::Filter));
        let filters = sends(&commands);
        assert_eq!(filters.len(), 2);

        let changes: Vec<_> = filters
            .iter()
            .map(|t| {
                assert_eq!(t.socket, SocketId::Filter);
                assert_eq!(t.dst, SERVER);
                Message::decode(&t.payload).unwrap().change_request().unwrap()
            })
            .collect();
        assert!(changes[0].change_ip && changes[0].change_port);
        assert!(!changes[1].change_ip && changes[1].change_port);

        // Answer in reverse order, on different sockets
        let mapped = SocketAddrV4::new(public, 40000);
        let bytes = answer(&filters[1], mapped, None);
        disco
            .handle_input(SocketId::Filter, ALTERNATE.into(), &bytes, start)
            .unwrap();
        assert!(drain(&mut disco).is_empty());

        let bytes = answer(&filters[0], mapped, None);
        disco
            .handle_input(SocketId::Primary, ALTERNATE.into(), &bytes, start)
            .unwrap();
        assert_eq!(drain(&mut disco), vec![Command::Complete(ResultCode::Ok)]);

        assert!(disco.is_natted());
        assert_eq!(disco.nat_type_name(), "Full cone");
        assert_eq!(disco.poll_timeout(), None);
    }

    #[test]
    fn test_address_restricted_cone() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        let public = Ipv4Addr::new(203, 0, 113, 9);
        let commands = run_binding_probes(&mut disco, start, public, [40000; 4]);
        let filters = sends(&commands);

        let bytes = answer(&filters[1], SocketAddrV4::new(public, 40000), None);
        disco
            .handle_input(SocketId::Filter, SERVER.into(), &bytes, start)
            .unwrap();

        let (commands, _) = run_timeouts(&mut disco);
        assert_eq!(
            commands.last(),
            Some(&Command::Complete(ResultCode::Ok))
        );
        // Only the address sub-probe retransmits
        assert_eq!(sends(&commands).len(), 8);
        assert_eq!(disco.filter_type(), DependencyType::AddressDependent);
        assert_eq!(disco.nat_type_name(), "Address-restricted cone");
    }

    #[test]
    fn test_port_restricted_cone_when_filters_unanswered() {
        let mut disco = discovery(DiscoveryOptions::default());
        let public = Ipv4Addr::new(203, 0, 113, 9);
        run_binding_probes(&mut disco, Instant::now(), public, [40000; 4]);

        let (commands, _) = run_timeouts(&mut disco);
        assert_eq!(
            commands.last(),
            Some(&Command::Complete(ResultCode::Ok))
        );
        assert_eq!(disco.filter_type(), DependencyType::AddressAndPortDependent);
        assert_eq!(disco.nat_type_name(), "Port-restricted cone");
    }

    #[test]
    fn test_symmetric_binding() {
        let mut disco = discovery(DiscoveryOptions { binding_only: true });
        let public = Ipv4Addr::new(203, 0, 113, 9);
        let commands = run_binding_probes(&mut disco, Instant::now(), public, [1, 1, 2, 2]);

        assert_eq!(commands, vec![Command::Complete(ResultCode::Ok)]);
        assert_eq!(disco.binding_type(), DependencyType::AddressDependent);
        assert_eq!(disco.filter_type(), DependencyType::Undetermined);
        assert_eq!(disco.nat_type_name(), "Natted (details not available)");
    }

    #[test]
    fn test_probe_c_unanswered_is_nb_incomplete() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let mut commands = drain(&mut disco);

        for i in 0..2 {
            let transmit = sends(&commands).pop().unwrap();
            let bytes = answer(
                &transmit,
                SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000),
                (i == 0).then_some(ALTERNATE),
            );
            disco
                .handle_input(SocketId::Primary, transmit.dst.into(), &bytes, start)
                .unwrap();
            commands = drain(&mut disco);
        }
        assert_eq!(disco.state(), DiscoveryState::ProbeC);

        let (commands, _) = run_timeouts(&mut disco);
        assert_eq!(
            commands.last(),
            Some(&Command::Complete(ResultCode::NbIncomplete))
        );
        assert_eq!(disco.binding_type(), DependencyType::Undetermined);
        assert_eq!(disco.nat_type_name(), "Natted (details not available)");
    }

    #[test]
    fn test_missing_changed_address_is_ignored() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let transmit = sends(&drain(&mut disco)).pop().unwrap();

        let bytes = answer(&transmit, SocketAddrV4::new(LOCAL, 5000), None);
        disco
            .handle_input(SocketId::Primary, SERVER.into(), &bytes, start)
            .unwrap();

        assert_eq!(disco.state(), DiscoveryState::ProbeA);
        assert_eq!(disco.mapped_address(), None);
        disco.handle_timeout(start + Duration::from_millis(100)).unwrap();
        assert_eq!(sends(&drain(&mut disco)).len(), 1);
    }

    #[test]
    fn test_protocol_errors_reach_event_sink() {
        let events = EventSink::new();
        let mut records = events.subscribe();
        let mut disco = discovery(DiscoveryOptions::default()).with_event_sink(events);
        let start = Instant::now();
        disco.start(start).unwrap();
        let transmit = sends(&drain(&mut disco)).pop().unwrap();

        let bytes = answer(&transmit, SocketAddrV4::new(LOCAL, 5000), None);
        disco
            .handle_input(SocketId::Primary, SERVER.into(), &bytes, start)
            .unwrap();

        let record = records.try_recv().unwrap();
        assert_eq!(record.level, tracing::Level::WARN);
        assert!(record.message.contains("CHANGED-ADDRESS"));
        assert!(records.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_probe_a_response_in_probe_b() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let transmit = sends(&drain(&mut disco)).pop().unwrap();

        let bytes = answer(&transmit, SocketAddrV4::new(LOCAL, 5000), Some(ALTERNATE));
        disco
            .handle_input(SocketId::Primary, SERVER.into(), &bytes, start)
            .unwrap();
        assert_eq!(disco.state(), DiscoveryState::ProbeB);
        assert_eq!(sends(&drain(&mut disco)).len(), 1);

        // Same datagram arrives again, late
        disco
            .handle_input(
                SocketId::Primary,
                SERVER.into(),
                &bytes,
                start + Duration::from_millis(20),
            )
            .unwrap();
        assert_eq!(disco.state(), DiscoveryState::ProbeB);
        assert_eq!(disco.mapped[1], None);
        assert!(drain(&mut disco).is_empty());
    }

    #[test]
    fn test_duplicate_filter_response_does_not_resolve_other_sub_probe() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        let public = Ipv4Addr::new(203, 0, 113, 9);
        let commands = run_binding_probes(&mut disco, start, public, [40000; 4]);
        let filters = sends(&commands);

        let bytes = answer(&filters[FILTER_PORT], SocketAddrV4::new(public, 40000), None);
        for _ in 0..2 {
            disco
                .handle_input(SocketId::Filter, SERVER.into(), &bytes, start)
                .unwrap();
            assert!(drain(&mut disco).is_empty());
        }
        assert_eq!(disco.state(), DiscoveryState::FilterDiscovery);
        assert_eq!(disco.filter_states[FILTER_ADDRESS], FilterState::Unknown);
        assert!(disco.filters[FILTER_ADDRESS].is_some());

        let (commands, _) = run_timeouts(&mut disco);
        assert_eq!(
            commands.last(),
            Some(&Command::Complete(ResultCode::Ok))
        );
        assert_eq!(disco.filter_type(), DependencyType::AddressDependent);
    }

    #[test]
    fn test_mismatched_transaction_id_is_ignored() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        drain(&mut disco);

        let mut response = Message::new(MessageType::BindingResponse);
        response.set_transaction_id(crate::message::TransactionId::random());
        response.add_attribute(Attribute::MappedAddress(SocketAddrV4::new(LOCAL, 1)));
        response.add_attribute(Attribute::ChangedAddress(ALTERNATE));
        disco
            .handle_input(
                SocketId::Primary,
                SERVER.into(),
                &response.encode().unwrap(),
                start,
            )
            .unwrap();

        assert_eq!(disco.state(), DiscoveryState::ProbeA);
        assert!(drain(&mut disco).is_empty());
    }

    #[test]
    fn test_garbage_is_ignored() {
        let mut disco = discovery(DiscoveryOptions::default());
        disco.start(Instant::now()).unwrap();
        drain(&mut disco);

        disco
            .handle_input(SocketId::Primary, SERVER.into(), &[1, 2, 3], Instant::now())
            .unwrap();
        assert_eq!(disco.state(), DiscoveryState::ProbeA);
    }

    #[test]
    fn test_rtt_from_echoed_timestamp() {
        let mut disco = discovery(DiscoveryOptions::default());
        let start = Instant::now();
        disco.start(start).unwrap();
        let transmit = sends(&drain(&mut disco)).pop().unwrap();

        let request = Message::decode(&transmit.payload).unwrap();
        let mut response = Message::response_to(&request);
        response.add_attribute(Attribute::MappedAddress(SocketAddrV4::new(LOCAL, 5000)));
        response.add_attribute(Attribute::ChangedAddress(ALTERNATE));
        response.add_attribute(Attribute::Timestamp(Timestamp {
            resp_delay: 5,
            timestamp: 0,
        }));

        disco
            .handle_input(
                SocketId::Primary,
                SERVER.into(),
                &response.encode().unwrap(),
                start + Duration::from_millis(42),
            )
            .unwrap();
        assert!((disco.round_trip_time_ms() - 37.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timestamps_disabled() {
        let config = ClientConfig {
            timestamps: false,
            ..config("192.0.2.1", LOCAL)
        };
        let mut disco = Discovery::new(&config, DiscoveryOptions::default()).unwrap();
        disco.start(Instant::now()).unwrap();
        let transmit = sends(&drain(&mut disco)).pop().unwrap();
        assert!(Message::decode(&transmit.payload).unwrap().timestamp().is_none());
        assert_eq!(disco.round_trip_time_ms(), 0.0);
    }

    #[test]
    fn test_wildcard_local_uses_interface_check() {
        let mut disco = Discovery::new(
            &config("192.0.2.1", Ipv4Addr::UNSPECIFIED),
            DiscoveryOptions::default(),
        )
        .unwrap()
        .with_interface_check(FixedInterfaces(Ok(true)));

        let commands = run_binding_probes(&mut disco, Instant::now(), LOCAL, [5000; 4]);
        assert_eq!(commands, vec![Command::Complete(ResultCode::Ok)]);
        assert_eq!(disco.natted(), Some(false));
    }

    #[test]
    fn test_failed_interface_check_leaves_natted_unknown() {
        let mut disco = Discovery::new(
            &config("192.0.2.1", Ipv4Addr::UNSPECIFIED),
            DiscoveryOptions::default(),
        )
        .unwrap()
        .with_interface_check(FixedInterfaces(Err(io::Error::from(
            io::ErrorKind::PermissionDenied,
        ))));

        run_binding_probes(&mut disco, Instant::now(), LOCAL, [5000; 4]);
        assert_eq!(disco.natted(), None);
        assert_eq!(disco.state(), DiscoveryState::FilterDiscovery);
    }

    #[test]
    fn test_report_format() {
        let mut disco = discovery(DiscoveryOptions::default());
        run_binding_probes(&mut disco, Instant::now(), LOCAL, [5000; 4]);

        let report = disco.report().to_string();
        assert!(report.starts_with(
            "Complete(0): Open NB=I EF=I (Open to internet) mapped=10.0.0.5:5000 rtt="
        ));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut disco = discovery(DiscoveryOptions::default());
        let now = Instant::now();
        disco.start(now).unwrap();
        assert_eq!(drain(&mut disco).len(), 2);

        assert!(matches!(disco.start(now), Err(ClientError::InvalidState)));
        assert!(drain(&mut disco).is_empty());
        assert_eq!(disco.state(), DiscoveryState::ProbeA);
    }
}
