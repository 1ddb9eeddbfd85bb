use crate::allocation::{AllocationEvent, TurnAllocation};
use crate::candidate::{self, Candidate, CandidateKind};
use crate::socket::DatagramSocket;
use crate::stun::{MAGIC_COOKIE, StunMessage, TransactionId, class, method, short_term_key};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

/// How often connectivity checks are sent while un-nominated.
const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// How often server-reflexive discovery requests are re-sent.
const STUN_INTERVAL: Duration = Duration::from_millis(500);

/// How many discovery rounds to attempt before giving up.
const MAX_STUN_TRIES: u32 = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum ComponentEvent {
    Connected,
    LocalCandidatesChanged,
}

/// Which transport a candidate pair runs over: one of the component's bound
/// sockets, or the TURN allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairSocket {
    Direct(usize),
    Relay,
}

/// A local socket paired with one remote candidate.
struct Pair {
    remote: Candidate,
    /// The remote transport address, with the local socket's scope id applied
    /// for link-local IPv6 remotes.
    remote_addr: SocketAddr,
    socket: PairSocket,
    /// Our reflexive address as reported by the peer.
    reflexive: Option<SocketAddr>,
    priority: u32,
    /// Transaction id of the most recent outgoing check on this pair.
    transaction: TransactionId,
    read_ok: bool,
    write_ok: bool,
}

impl Pair {
    fn checked(&self) -> bool {
        self.read_ok && self.write_ok
    }
}

/// One ICE stream component (e.g. RTP or RTCP): owns its sockets, candidates,
/// candidate pairs and the connectivity-check schedule.
pub struct IceComponent {
    component: u16,
    controlling: bool,
    tie_breaker: [u8; 8],

    local_user: String,
    local_password: String,
    remote_user: String,
    remote_password: String,

    sockets: Vec<Box<dyn DatagramSocket>>,
    local_candidates: Vec<Candidate>,
    next_foundation: u32,

    pairs: Vec<Pair>,
    active_pair: Option<usize>,
    fallback_pair: Option<usize>,

    stun_server: Option<SocketAddr>,
    stun_id: Option<TransactionId>,
    stun_tries: u32,
    stun_done: Vec<bool>,
    stun_timer: Option<Instant>,

    check_timer: Option<Instant>,

    turn: Option<TurnAllocation>,

    events: VecDeque<ComponentEvent>,
}

impl IceComponent {
    pub fn new(component: u16, controlling: bool) -> Self {
        Self {
            component,
            controlling,
            tie_breaker: rand::random(),
            local_user: candidate::random_credential(4),
            local_password: candidate::random_credential(22),
            remote_user: String::new(),
            remote_password: String::new(),
            sockets: Vec::new(),
            local_candidates: Vec::new(),
            next_foundation: 0,
            pairs: Vec::new(),
            active_pair: None,
            fallback_pair: None,
            stun_server: None,
            stun_id: None,
            stun_tries: 0,
            stun_done: Vec::new(),
            stun_timer: None,
            check_timer: None,
            turn: None,
            events: VecDeque::new(),
        }
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn local_password(&self) -> &str {
        &self.local_password
    }

    pub fn set_local_user(&mut self, user: impl Into<String>) {
        self.local_user = user.into();
    }

    pub fn set_local_password(&mut self, password: impl Into<String>) {
        self.local_password = password.into();
    }

    pub fn set_remote_user(&mut self, user: impl Into<String>) {
        self.remote_user = user.into();
    }

    pub fn set_remote_password(&mut self, password: impl Into<String>) {
        self.remote_password = password.into();
    }

    /// Configures the server used to discover server-reflexive candidates.
    pub fn set_stun_server(&mut self, server: SocketAddr) {
        self.stun_server = Some(server);
        self.stun_id = Some(TransactionId::new());
    }

    /// Configures a TURN relay and starts allocating on it right away.
    ///
    /// The allocation runs over its own socket; the driver feeds that socket's
    /// datagrams into [`IceComponent::handle_turn_read`].
    pub fn set_turn_server(
        &mut self,
        server: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
        socket: Box<dyn DatagramSocket>,
    ) {
        let mut allocation = TurnAllocation::new(socket, server, username, password);
        allocation.connect_to_host();
        self.turn = Some(allocation);
    }

    /// Hands the component its sockets; each yields one host candidate.
    ///
    /// Starts server-reflexive discovery if a STUN server is configured.
    pub fn set_sockets(&mut self, sockets: Vec<Box<dyn DatagramSocket>>, now: Instant) {
        self.local_candidates.clear();
        self.pairs.clear();
        self.active_pair = None;
        self.fallback_pair = None;
        self.sockets = sockets;

        for socket in &self.sockets {
            let local = socket.local_addr();
            let candidate = Candidate::host(
                local.ip(),
                local.port(),
                self.component,
                self.next_foundation.to_string(),
            );
            self.next_foundation += 1;
            self.local_candidates.push(candidate);
        }

        if self.stun_server.is_some() {
            self.stun_tries = 0;
            self.stun_done = vec![false; self.sockets.len()];
            self.send_discovery_requests();
            self.stun_timer = Some(now + STUN_INTERVAL);
        }
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn is_connected(&self) -> bool {
        self.active_pair.is_some()
    }

    /// Adds a remote candidate, pairing it with every compatible local socket.
    pub fn add_remote_candidate(&mut self, candidate: &Candidate) -> bool {
        if candidate.component() != self.component
            || !matches!(
                candidate.kind(),
                CandidateKind::Host | CandidateKind::ServerReflexive
            )
            || candidate.protocol() != "udp"
        {
            return false;
        }

        if self.pairs.iter().any(|p| {
            p.remote.ip() == candidate.ip() && p.remote.port() == candidate.port()
        }) {
            return false;
        }

        for index in 0..self.sockets.len() {
            let local = self.sockets[index].local_addr();

            // Do not pair IPv4 with IPv6, or global with link-local addresses.
            if local.is_ipv4() != candidate.ip().is_ipv4() {
                continue;
            }
            if candidate::is_link_local_ipv6(local.ip()) != candidate.is_link_local_ipv6() {
                continue;
            }

            let remote_addr = remote_addr_for(candidate, local);
            self.push_pair(candidate.clone(), remote_addr, PairSocket::Direct(index));
        }

        if self.relay_available() && candidate.ip().is_ipv4() {
            let remote_addr = SocketAddr::new(candidate.ip(), candidate.port());
            self.push_pair(candidate.clone(), remote_addr, PairSocket::Relay);
        }

        true
    }

    /// Starts connectivity checks.
    pub fn connect_to_host(&mut self, now: Instant) {
        if self.active_pair.is_some() {
            return;
        }

        self.check_candidates();
        self.check_timer = Some(now + CHECK_INTERVAL);
    }

    /// Routes application data to the active pair, falling back to the
    /// fallback pair while no pair is nominated yet.
    pub fn send_datagram(&mut self, payload: &[u8]) -> io::Result<usize> {
        let Some(index) = self.active_pair.or(self.fallback_pair) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no candidate pair available",
            ));
        };

        let (socket, remote_addr) = (self.pairs[index].socket, self.pairs[index].remote_addr);

        match socket {
            PairSocket::Direct(socket) => {
                let socket = self
                    .sockets
                    .get(socket)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;

                socket.send_to(payload, remote_addr)
            }
            PairSocket::Relay => {
                let turn = self.turn.as_mut().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "no TURN allocation")
                })?;

                turn.send_datagram(payload, remote_addr)
            }
        }
    }

    /// Processes one datagram read from socket `socket`.
    ///
    /// Returns the payload if it is application data to be delivered upward;
    /// STUN messages are consumed.
    pub fn handle_read(&mut self, socket: usize, buf: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        match StunMessage::peek(buf) {
            Some((message_type, cookie, id)) if message_type != 0 && cookie == MAGIC_COOKIE => {
                self.handle_stun_packet(PairSocket::Direct(socket), buf, from, message_type, id);
                None
            }
            _ => {
                // Not a STUN message: flag a potential fallback pair and pass it up.
                self.update_fallback(from);
                Some(buf.to_vec())
            }
        }
    }

    /// Processes one datagram read from the TURN allocation's socket.
    ///
    /// Channel data is decapsulated and then classified exactly like a direct
    /// datagram, with the relayed peer as the source.
    pub fn handle_turn_read(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let turn = self.turn.as_mut()?;
        let decapsulated = turn.handle_read(buf, from, now);
        self.drain_turn_events();

        let (payload, peer) = decapsulated?;

        match StunMessage::peek(&payload) {
            Some((message_type, cookie, id)) if message_type != 0 && cookie == MAGIC_COOKIE => {
                self.handle_stun_packet(PairSocket::Relay, &payload, peer, message_type, id);
                None
            }
            _ => {
                self.update_fallback(peer);
                Some(payload)
            }
        }
    }

    pub fn poll_event(&mut self) -> Option<ComponentEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.check_timer,
            self.stun_timer,
            self.turn.as_ref().and_then(|t| t.poll_timeout()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.stun_timer.is_some_and(|at| now >= at) {
            self.discovery_tick(now);
        }

        if self.check_timer.is_some_and(|at| now >= at) {
            self.check_candidates();
            self.check_timer = Some(now + CHECK_INTERVAL);
        }

        if let Some(turn) = self.turn.as_mut() {
            turn.handle_timeout(now);
        }
        self.drain_turn_events();
    }

    /// Stops all activity and closes the sockets.
    pub fn close(&mut self) {
        self.check_timer = None;
        self.stun_timer = None;

        for socket in &self.sockets {
            socket.close();
        }
        self.sockets.clear();

        if let Some(mut turn) = self.turn.take() {
            turn.disconnect();
        }
    }

    /// Sends one connectivity check on every pair with known remote credentials.
    fn check_candidates(&mut self) {
        tracing::debug!(component = %self.component, "Checking remote candidates");

        for index in 0..self.pairs.len() {
            if self.remote_user.is_empty() {
                continue;
            }
            self.send_check(index);
        }
    }

    fn send_check(&mut self, index: usize) {
        let transaction = TransactionId::new();
        let pair = &mut self.pairs[index];
        pair.transaction = transaction;

        let mut message = StunMessage::new(method::BINDING | class::REQUEST, transaction);
        message.set_priority(pair.priority);
        message.set_username(format!("{}:{}", self.remote_user, self.local_user));
        if self.controlling {
            message.set_ice_controlling(self.tie_breaker);
            message.set_use_candidate(true);
        } else {
            message.set_ice_controlled(self.tie_breaker);
        }

        self.write_stun(index, message);
    }

    fn handle_stun_packet(
        &mut self,
        source: PairSocket,
        buf: &[u8],
        from: SocketAddr,
        message_type: u16,
        id: TransactionId,
    ) {
        // Discovery responses are unauthenticated; everything else is verified
        // against the appropriate short-term password for its class.
        let key: Vec<u8> = if Some(id) == self.stun_id {
            Vec::new()
        } else {
            let password = if message_type & 0xFF00 != 0 {
                &self.remote_password
            } else {
                &self.local_password
            };
            if password.is_empty() {
                return;
            }
            short_term_key(password)
        };

        let message = match StunMessage::decode(buf, &key) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%from, "Failed to decode STUN packet: {e}");
                return;
            }
        };

        tracing::debug!(target: "wire", %from, "Received STUN packet\n{message}");

        if Some(message.transaction_id()) == self.stun_id {
            if let PairSocket::Direct(socket) = source {
                self.handle_discovery_response(socket, &message);
            }
            return;
        }

        if message.message_type() == method::BINDING | class::REQUEST {
            self.handle_binding_request(source, from, &message);
        } else if message.message_type() == method::BINDING | class::RESPONSE {
            self.handle_binding_response(&message);
        } else if message.class() == class::ERROR {
            let (code, phrase) = message.error_code().unwrap_or((0, ""));
            tracing::warn!(%from, "STUN error response: {code} {phrase}");
        }
    }

    fn handle_binding_request(&mut self, source: PairSocket, from: SocketAddr, message: &StunMessage) {
        let index = self.find_or_create_pair(source, from);

        let mut response =
            StunMessage::new(method::BINDING | class::RESPONSE, message.transaction_id());
        if let Some(username) = message.username() {
            response.set_username(username.to_owned());
        }
        response.set_xor_mapped_address(from);
        self.write_stun(index, response);

        if self.controlling || message.use_candidate() {
            tracing::debug!(%from, "Reverse check succeeded");
            self.pairs[index].read_ok = true;
        }

        // A controlled agent answers with an immediate check of its own.
        if !self.controlling && self.active_pair.is_none() && !self.remote_user.is_empty() {
            self.send_check(index);
        }

        self.try_nominate(index);
    }

    fn handle_binding_response(&mut self, message: &StunMessage) {
        let Some(index) = self
            .pairs
            .iter()
            .position(|p| p.transaction == message.transaction_id())
        else {
            tracing::debug!(id = %message.transaction_id(), "Response for unknown transaction");
            return;
        };

        self.pairs[index].reflexive = message.xor_mapped_address();
        self.pairs[index].write_ok = true;
        tracing::debug!(
            remote = %self.pairs[index].remote_addr,
            reflexive = ?self.pairs[index].reflexive,
            "Forward check succeeded"
        );

        self.try_nominate(index);
    }

    fn handle_discovery_response(&mut self, socket: usize, message: &StunMessage) {
        if let Some(done) = self.stun_done.get_mut(socket) {
            *done = true;
        }
        if self.stun_done.iter().all(|done| *done) {
            self.stun_timer = None;
        }

        let reflexive = message.xor_mapped_address().or(message.mapped_address());
        let Some(reflexive) = reflexive else {
            tracing::warn!("STUN server did not provide a reflexive address");
            return;
        };

        let already_known = self.local_candidates.iter().any(|c| {
            c.kind() == CandidateKind::ServerReflexive
                && c.ip() == reflexive.ip()
                && c.port() == reflexive.port()
        });
        if already_known {
            return;
        }

        tracing::debug!(%reflexive, "Adding server-reflexive candidate");

        let candidate = Candidate::server_reflexive(
            reflexive.ip(),
            reflexive.port(),
            self.component,
            self.next_foundation.to_string(),
        );
        self.next_foundation += 1;
        self.local_candidates.push(candidate);
        self.events.push_back(ComponentEvent::LocalCandidatesChanged);
    }

    /// Looks up the pair for an incoming check, creating a peer-reflexive one
    /// for unknown sources.
    fn find_or_create_pair(&mut self, source: PairSocket, from: SocketAddr) -> usize {
        let existing = self.pairs.iter().position(|p| {
            p.socket == source
                && p.remote_addr.ip() == from.ip()
                && p.remote_addr.port() == from.port()
        });
        if let Some(index) = existing {
            return index;
        }

        let candidate = Candidate::peer_reflexive(from.ip(), from.port(), self.component, "");
        let index = self.push_pair(candidate, from, source);

        tracing::debug!(remote = %from, "Added peer-reflexive pair");

        index
    }

    fn push_pair(&mut self, remote: Candidate, remote_addr: SocketAddr, socket: PairSocket) -> usize {
        self.pairs.push(Pair {
            remote,
            remote_addr,
            socket,
            reflexive: None,
            priority: candidate::priority(CandidateKind::PeerReflexive, self.component),
            transaction: TransactionId::new(),
            read_ok: false,
            write_ok: false,
        });

        let index = self.pairs.len() - 1;
        if self.fallback_pair.is_none() {
            self.fallback_pair = Some(index);
        }

        index
    }

    /// Nominates the first pair that can both send and receive. The active
    /// pair never changes once set.
    fn try_nominate(&mut self, index: usize) {
        if self.active_pair.is_some() || !self.pairs[index].checked() {
            return;
        }

        tracing::debug!(remote = %self.pairs[index].remote_addr, "ICE completed");

        self.active_pair = Some(index);
        self.check_timer = None;
        self.events.push_back(ComponentEvent::Connected);
    }

    fn update_fallback(&mut self, from: SocketAddr) {
        let pair = self
            .pairs
            .iter()
            .position(|p| p.remote_addr.ip() == from.ip() && p.remote_addr.port() == from.port());

        if let Some(index) = pair {
            self.fallback_pair = Some(index);
        }
    }

    fn discovery_tick(&mut self, now: Instant) {
        let gave_up = self.stun_tries >= MAX_STUN_TRIES;
        if self.stun_server.is_none() || gave_up || self.stun_done.iter().all(|done| *done) {
            self.stun_timer = None;
            return;
        }

        self.send_discovery_requests();
        self.stun_timer = Some(now + STUN_INTERVAL);
    }

    fn send_discovery_requests(&mut self) {
        let Some(server) = self.stun_server else {
            return;
        };
        let Some(id) = self.stun_id else {
            return;
        };

        let message = StunMessage::new(method::BINDING | class::REQUEST, id);
        let encoded = message.encode(&[], true);

        for (index, socket) in self.sockets.iter().enumerate() {
            if self.stun_done.get(index).copied().unwrap_or(false) {
                continue;
            }

            tracing::debug!(target: "wire", to = %server, "Sending STUN packet\n{message}");

            if let Err(e) = socket.send_to(&encoded, server) {
                tracing::debug!(local = %socket.local_addr(), "Failed to send discovery request: {e}");
            }
        }

        self.stun_tries += 1;
    }

    fn write_stun(&mut self, index: usize, message: StunMessage) {
        // Requests are signed with the peer's password, responses with ours.
        let password = if message.message_type() & 0xFF00 != 0 {
            &self.local_password
        } else {
            &self.remote_password
        };
        let encoded = message.encode(&short_term_key(password), true);

        let (socket, remote_addr) = (self.pairs[index].socket, self.pairs[index].remote_addr);

        tracing::debug!(target: "wire", to = %remote_addr, "Sending STUN packet\n{message}");

        match socket {
            PairSocket::Direct(socket) => {
                let Some(socket) = self.sockets.get(socket) else {
                    return;
                };
                if let Err(e) = socket.send_to(&encoded, remote_addr) {
                    tracing::warn!(%remote_addr, "Failed to send STUN packet: {e}");
                }
            }
            PairSocket::Relay => {
                let Some(turn) = self.turn.as_mut() else {
                    return;
                };
                if let Err(e) = turn.send_datagram(&encoded, remote_addr) {
                    tracing::warn!(%remote_addr, "Failed to relay STUN packet: {e}");
                }
            }
        }
    }

    fn relay_available(&self) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| t.relayed_addr().is_some())
    }

    fn drain_turn_events(&mut self) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };

        let mut drained = Vec::new();
        while let Some(event) = turn.poll_event() {
            drained.push(event);
        }

        for event in drained {
            match event {
                AllocationEvent::Connected => self.add_relayed_candidate(),
                AllocationEvent::Disconnected => {
                    tracing::warn!("TURN allocation was lost");
                }
            }
        }
    }

    fn add_relayed_candidate(&mut self) {
        let Some(relayed) = self.turn.as_ref().and_then(|t| t.relayed_addr()) else {
            return;
        };

        let already_known = self
            .local_candidates
            .iter()
            .any(|c| c.kind() == CandidateKind::Relayed);
        if already_known {
            return;
        }

        tracing::debug!(%relayed, "Adding relayed candidate");

        let candidate = Candidate::relayed(
            (*relayed.ip()).into(),
            relayed.port(),
            self.component,
            self.next_foundation.to_string(),
        );
        self.next_foundation += 1;
        self.local_candidates.push(candidate);
        self.events.push_back(ComponentEvent::LocalCandidatesChanged);

        // Remote candidates that arrived before the allocation can now also be
        // reached through the relay.
        let unpaired: Vec<_> = self
            .pairs
            .iter()
            .filter(|p| matches!(p.socket, PairSocket::Direct(_)))
            .filter(|p| p.remote_addr.is_ipv4())
            .map(|p| (p.remote.clone(), p.remote_addr))
            .filter(|(_, addr)| {
                !self
                    .pairs
                    .iter()
                    .any(|p| p.socket == PairSocket::Relay && p.remote_addr == *addr)
            })
            .collect();

        for (remote, remote_addr) in unpaired {
            self.push_pair(remote, remote_addr, PairSocket::Relay);
        }
    }
}

fn remote_addr_for(candidate: &Candidate, local: SocketAddr) -> SocketAddr {
    match (candidate.ip(), local) {
        (std::net::IpAddr::V6(host), SocketAddr::V6(local)) if candidate.is_link_local_ipv6() => {
            SocketAddr::V6(SocketAddrV6::new(
                host,
                candidate.port(),
                0,
                local.scope_id(),
            ))
        }
        (host, _) => SocketAddr::new(host, candidate.port()),
    }
}
