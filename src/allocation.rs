use crate::channel_data;
use crate::socket::DatagramSocket;
use crate::stun::{StunMessage, TransactionId, class, long_term_key, method};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Requested lifetime for new allocations, in seconds.
const DEFAULT_LIFETIME: u32 = 600;

/// How long before the allocation expires we refresh it, in seconds.
const REFRESH_MARGIN: u32 = 60;

/// UDP, as carried in REQUESTED-TRANSPORT.
const TRANSPORT_UDP: u8 = 17;

/// Per TURN spec, the valid channel number range.
const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AllocationEvent {
    Connected,
    Disconnected,
}

/// A single long-lived session with a TURN server on one datagram socket.
///
/// Drives the Allocate / Refresh / ChannelBind exchanges, re-authenticating
/// with long-term credentials on demand, and frames application data as
/// channel-data messages once a channel is bound to a peer.
pub struct TurnAllocation {
    socket: Box<dyn DatagramSocket>,
    server: SocketAddr,

    username: String,
    password: String,
    realm: String,
    nonce: String,
    /// `MD5(username:realm:password)`; empty until the server has sent a realm.
    key: Vec<u8>,

    relayed: Option<SocketAddrV4>,
    lifetime: u32,
    state: AllocationState,

    /// The most recent outbound request, kept for credential-retry replay.
    request: Option<StunMessage>,

    channels: BTreeMap<u16, SocketAddr>,
    next_channel: u16,

    refresh_at: Option<Instant>,
    events: VecDeque<AllocationEvent>,
}

impl TurnAllocation {
    pub fn new(
        socket: Box<dyn DatagramSocket>,
        server: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            socket,
            server,
            username: username.into(),
            password: password.into(),
            realm: String::new(),
            nonce: String::new(),
            key: Vec::new(),
            relayed: None,
            lifetime: DEFAULT_LIFETIME,
            state: AllocationState::Unconnected,
            request: None,
            channels: BTreeMap::new(),
            next_channel: FIRST_CHANNEL,
            refresh_at: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// The address on the server used to communicate with peers, once allocated.
    pub fn relayed_addr(&self) -> Option<SocketAddrV4> {
        self.relayed
    }

    /// Requests an allocation from the server.
    ///
    /// The first attempt is unauthenticated; the server's 401 tells us the
    /// realm and nonce to authenticate with.
    pub fn connect_to_host(&mut self) {
        if self.state != AllocationState::Unconnected {
            return;
        }

        let mut request = StunMessage::new(
            method::ALLOCATE | class::REQUEST,
            TransactionId::new(),
        );
        request.set_lifetime(self.lifetime);
        request.set_requested_transport(TRANSPORT_UDP);
        self.write_stun(request);

        self.set_state(AllocationState::Connecting);
    }

    /// Releases the allocation with a zero-lifetime refresh, best effort, and
    /// closes the socket.
    pub fn disconnect(&mut self) {
        self.refresh_at = None;

        if self.state == AllocationState::Connected {
            let mut request = StunMessage::new(
                method::REFRESH | class::REQUEST,
                TransactionId::new(),
            );
            request.set_nonce(self.nonce.clone());
            request.set_realm(self.realm.clone());
            request.set_username(self.username.clone());
            request.set_lifetime(0);
            self.write_stun(request);

            self.set_state(AllocationState::Closing);
        }

        self.socket.close();
    }

    /// Sends application data to `peer` through the relay.
    ///
    /// The first send to a new peer triggers a ChannelBind; the data flows
    /// immediately on the assigned channel without waiting for the bind to be
    /// confirmed, so the relay may drop the first packets.
    pub fn send_datagram(&mut self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        let bound = self
            .channels
            .iter()
            .find(|(_, p)| **p == peer)
            .map(|(channel, _)| *channel);
        let channel = match bound {
            Some(channel) => channel,
            None => self.bind_channel(peer)?,
        };

        self.socket
            .send_to(&channel_data::encode(channel, payload), self.server)
    }

    /// Processes one datagram from the allocation's socket.
    ///
    /// Channel-data frames from a known channel are decapsulated and returned
    /// together with the peer they came from; STUN messages are consumed.
    pub fn handle_read(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        if from != self.server {
            tracing::trace!(%from, server = %self.server, "Datagram is not from our TURN server");
            return None;
        }

        if channel_data::is_channel_data(buf) {
            let packet = match channel_data::decode(buf) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!("Failed to decode channel data: {e}");
                    return None;
                }
            };

            let Some(peer) = self.channels.get(&packet.channel()) else {
                tracing::debug!(channel = %packet.channel(), "Data on unknown channel");
                return None;
            };

            return Some((packet.payload().to_vec(), *peer));
        }

        let message = match StunMessage::decode(buf, &[]) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Failed to decode STUN packet: {e}");
                return None;
            }
        };

        tracing::debug!(target: "wire", %from, "Received STUN packet\n{message}");

        self.handle_stun(message, now);

        None
    }

    pub fn poll_event(&mut self) -> Option<AllocationEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.refresh_at
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(refresh_at) = self.refresh_at else {
            return;
        };
        if now < refresh_at {
            return;
        }

        self.refresh_at = None;

        let mut request = StunMessage::new(
            method::REFRESH | class::REQUEST,
            TransactionId::new(),
        );
        request.set_nonce(self.nonce.clone());
        request.set_realm(self.realm.clone());
        request.set_username(self.username.clone());
        self.write_stun(request);
    }

    fn handle_stun(&mut self, message: StunMessage, now: Instant) {
        // A 401 on our outstanding request with a new realm or nonce means we
        // must re-derive the long-term key and replay the request. Replaying on
        // an unchanged nonce and realm would loop forever; those fall through
        // to the error handling below.
        if message.class() == class::ERROR
            && matches!(message.error_code(), Some((401, _)))
            && Some(message.transaction_id()) == self.request.as_ref().map(|r| r.transaction_id())
        {
            let nonce = message.nonce().unwrap_or_default();
            let realm = message.realm().unwrap_or_default();

            if nonce != self.nonce || realm != self.realm {
                self.nonce = nonce.to_owned();
                self.realm = realm.to_owned();
                self.key = long_term_key(&self.username, &self.realm, &self.password);

                let mut request = self.request.clone().expect("checked above");
                request.set_transaction_id(TransactionId::new());
                request.set_nonce(self.nonce.clone());
                request.set_realm(self.realm.clone());
                request.set_username(self.username.clone());
                self.write_stun(request);

                return;
            }
        }

        match message.method() {
            method::ALLOCATE => {
                if message.class() == class::ERROR {
                    let (code, phrase) = message.error_code().unwrap_or((0, ""));
                    tracing::warn!("Allocation failed: {code} {phrase}");
                    self.set_state(AllocationState::Unconnected);
                    return;
                }

                let relayed = match message.xor_relayed_address() {
                    Some(SocketAddr::V4(addr)) if addr.port() != 0 => addr,
                    _ => {
                        tracing::warn!("Allocation did not yield a valid relayed address");
                        self.set_state(AllocationState::Unconnected);
                        return;
                    }
                };

                let Some(lifetime) = message.lifetime() else {
                    tracing::warn!("Allocation response does not contain LIFETIME");
                    self.set_state(AllocationState::Unconnected);
                    return;
                };

                self.relayed = Some(relayed);
                self.lifetime = lifetime;
                self.schedule_refresh(now);

                self.set_state(AllocationState::Connected);
            }
            method::CHANNEL_BIND => {
                if message.class() == class::ERROR {
                    let (code, phrase) = message.error_code().unwrap_or((0, ""));
                    tracing::warn!("ChannelBind failed: {code} {phrase}");
                }
            }
            method::REFRESH => {
                if message.class() == class::ERROR {
                    let (code, phrase) = message.error_code().unwrap_or((0, ""));
                    tracing::warn!("Refresh failed: {code} {phrase}");
                    self.set_state(AllocationState::Unconnected);
                    return;
                }

                if self.state == AllocationState::Closing {
                    self.set_state(AllocationState::Unconnected);
                    return;
                }

                self.lifetime = message.lifetime().unwrap_or(self.lifetime);
                self.schedule_refresh(now);
            }
            other => {
                tracing::debug!(
                    method = format_args!("{other:#05x}"),
                    "Ignoring STUN message with unexpected method"
                );
            }
        }
    }

    /// Assigns the next channel number to `peer` and asks the server to bind it.
    fn bind_channel(&mut self, peer: SocketAddr) -> io::Result<u16> {
        if self.next_channel > LAST_CHANNEL {
            tracing::warn!(%peer, "Out of TURN channel numbers");
            return Err(io::Error::other("out of TURN channel numbers"));
        }

        let channel = self.next_channel;
        self.next_channel += 1;

        let mut request = StunMessage::new(
            method::CHANNEL_BIND | class::REQUEST,
            TransactionId::new(),
        );
        request.set_nonce(self.nonce.clone());
        request.set_realm(self.realm.clone());
        request.set_username(self.username.clone());
        request.set_channel_number(channel);
        request.set_xor_peer_address(peer);
        self.write_stun(request);

        self.channels.insert(channel, peer);

        tracing::debug!(%peer, channel = format_args!("{channel:#06x}"), "Binding new channel");

        Ok(channel)
    }

    fn schedule_refresh(&mut self, now: Instant) {
        let refresh_after = self.lifetime.saturating_sub(REFRESH_MARGIN);
        self.refresh_at = Some(now + Duration::from_secs(u64::from(refresh_after)));
    }

    fn set_state(&mut self, state: AllocationState) {
        if state == self.state {
            return;
        }
        self.state = state;

        match state {
            AllocationState::Connected => self.events.push_back(AllocationEvent::Connected),
            AllocationState::Unconnected => {
                self.refresh_at = None;
                self.events.push_back(AllocationEvent::Disconnected);
            }
            _ => {}
        }
    }

    fn write_stun(&mut self, message: StunMessage) {
        tracing::debug!(target: "wire", to = %self.server, "Sending STUN packet\n{message}");

        let encoded = message.encode(&self.key, false);
        if let Err(e) = self.socket.send_to(&encoded, self.server) {
            tracing::warn!(server = %self.server, "Failed to send STUN packet: {e}");
        }

        if message.class() == class::REQUEST {
            self.request = Some(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;
    use std::time::Duration;

    const SERVER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 3478);
    const PEER1: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 10000);
    const PEER2: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11)), 20000);
    const RELAYED: &str = "198.51.100.7:49200";

    type Sent = Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>;

    struct ScriptedSocket {
        local: SocketAddr,
        sent: Sent,
    }

    impl DatagramSocket for ScriptedSocket {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize> {
            self.sent.borrow_mut().push((payload.to_vec(), dst));
            Ok(payload.len())
        }
    }

    fn allocation() -> (TurnAllocation, Sent) {
        let sent = Sent::default();
        let socket = ScriptedSocket {
            local: "10.0.0.1:41000".parse().unwrap(),
            sent: Rc::clone(&sent),
        };

        let allocation = TurnAllocation::new(Box::new(socket), SERVER, "user", "pass");

        (allocation, sent)
    }

    fn key() -> Vec<u8> {
        long_term_key("user", "r", "pass")
    }

    fn sent_request(sent: &Sent, index: usize, key: &[u8]) -> StunMessage {
        let sent = sent.borrow();
        let (payload, dst) = &sent[index];
        assert_eq!(*dst, SERVER);

        StunMessage::decode(payload, key).unwrap()
    }

    fn respond(allocation: &mut TurnAllocation, message: &StunMessage, now: Instant) {
        allocation.handle_read(&message.encode(&[], false), SERVER, now);
    }

    /// Walks a fresh allocation through 401 and success to `Connected`.
    fn connected_allocation(now: Instant) -> (TurnAllocation, Sent) {
        let (mut allocation, sent) = allocation();
        allocation.connect_to_host();

        let first = sent_request(&sent, 0, &[]);
        let mut unauthorized =
            StunMessage::new(method::ALLOCATE | class::ERROR, first.transaction_id());
        unauthorized.set_error_code(401, "Unauthorized");
        unauthorized.set_realm("r");
        unauthorized.set_nonce("n1");
        respond(&mut allocation, &unauthorized, now);

        let second = sent_request(&sent, 1, &key());
        let mut success =
            StunMessage::new(method::ALLOCATE | class::RESPONSE, second.transaction_id());
        success.set_lifetime(600);
        success.set_xor_relayed_address(RELAYED.parse().unwrap());
        respond(&mut allocation, &success, now);

        assert_eq!(allocation.state(), AllocationState::Connected);
        assert_eq!(allocation.poll_event(), Some(AllocationEvent::Connected));

        (allocation, sent)
    }

    #[test]
    fn authenticates_after_401_and_connects() {
        let now = Instant::now();
        let (mut allocation, sent) = allocation();
        assert_eq!(allocation.state(), AllocationState::Unconnected);

        allocation.connect_to_host();
        assert_eq!(allocation.state(), AllocationState::Connecting);

        // The first Allocate is unauthenticated.
        let first = sent_request(&sent, 0, &[]);
        assert_eq!(first.method(), method::ALLOCATE);
        assert_eq!(first.class(), class::REQUEST);
        assert_eq!(first.lifetime(), Some(600));
        assert_eq!(first.requested_transport(), Some(17));
        assert_eq!(first.username(), None);

        let mut unauthorized =
            StunMessage::new(method::ALLOCATE | class::ERROR, first.transaction_id());
        unauthorized.set_error_code(401, "Unauthorized");
        unauthorized.set_realm("r");
        unauthorized.set_nonce("n1");
        respond(&mut allocation, &unauthorized, now);

        // The replay carries credentials and a fresh id; decoding it with the
        // MD5 long-term key proves the MESSAGE-INTEGRITY is correct.
        let second = sent_request(&sent, 1, &key());
        assert_eq!(second.method(), method::ALLOCATE);
        assert_eq!(second.username(), Some("user"));
        assert_eq!(second.realm(), Some("r"));
        assert_eq!(second.nonce(), Some("n1"));
        assert_eq!(second.lifetime(), Some(600));
        assert_ne!(second.transaction_id(), first.transaction_id());

        let mut success =
            StunMessage::new(method::ALLOCATE | class::RESPONSE, second.transaction_id());
        success.set_lifetime(600);
        success.set_xor_relayed_address(RELAYED.parse().unwrap());
        respond(&mut allocation, &success, now);

        assert_eq!(allocation.state(), AllocationState::Connected);
        assert_eq!(allocation.poll_event(), Some(AllocationEvent::Connected));
        assert_eq!(
            allocation.relayed_addr(),
            Some(RELAYED.parse().unwrap())
        );
        // Refresh is due 60 seconds before the lifetime expires.
        assert_eq!(
            allocation.poll_timeout(),
            Some(now + Duration::from_secs(540))
        );
        assert_eq!(sent.borrow().len(), 2, "exactly two Allocate requests");
    }

    #[test]
    fn repeated_401_with_unchanged_credentials_is_fatal() {
        let now = Instant::now();
        let (mut allocation, sent) = allocation();
        allocation.connect_to_host();

        let first = sent_request(&sent, 0, &[]);
        let mut unauthorized =
            StunMessage::new(method::ALLOCATE | class::ERROR, first.transaction_id());
        unauthorized.set_error_code(401, "Unauthorized");
        unauthorized.set_realm("r");
        unauthorized.set_nonce("n1");
        respond(&mut allocation, &unauthorized, now);

        let second = sent_request(&sent, 1, &key());
        let mut unauthorized =
            StunMessage::new(method::ALLOCATE | class::ERROR, second.transaction_id());
        unauthorized.set_error_code(401, "Unauthorized");
        unauthorized.set_realm("r");
        unauthorized.set_nonce("n1");
        respond(&mut allocation, &unauthorized, now);

        assert_eq!(allocation.state(), AllocationState::Unconnected);
        assert_eq!(allocation.poll_event(), Some(AllocationEvent::Disconnected));
        assert_eq!(sent.borrow().len(), 2, "no further replay");
    }

    #[test]
    fn rejects_allocations_without_an_ipv4_relay() {
        let now = Instant::now();
        let (mut allocation, sent) = allocation();
        allocation.connect_to_host();

        let first = sent_request(&sent, 0, &[]);
        let mut success =
            StunMessage::new(method::ALLOCATE | class::RESPONSE, first.transaction_id());
        success.set_lifetime(600);
        success.set_xor_relayed_address("[2001:db8::7]:49200".parse().unwrap());
        respond(&mut allocation, &success, now);

        assert_eq!(allocation.state(), AllocationState::Unconnected);
    }

    #[test]
    fn assigns_channels_monotonically_and_frames_data() {
        let now = Instant::now();
        let (mut allocation, sent) = connected_allocation(now);
        let before = sent.borrow().len();

        allocation.send_datagram(b"hello", PEER1).unwrap();

        // First send: a ChannelBind followed immediately by the framed data.
        let bind = sent_request(&sent, before, &key());
        assert_eq!(bind.method(), method::CHANNEL_BIND);
        assert_eq!(bind.channel_number(), Some(0x4000));
        assert_eq!(bind.xor_peer_address(), Some(PEER1));

        {
            let sent = sent.borrow();
            let (frame, dst) = &sent[before + 1];
            assert_eq!(*dst, SERVER);
            assert_eq!(frame.as_slice(), &[0x40, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
        }

        // Subsequent sends to the same peer reuse the channel without rebinding.
        allocation.send_datagram(b"again", PEER1).unwrap();
        assert_eq!(sent.borrow().len(), before + 3);

        // A new peer gets the next channel number.
        allocation.send_datagram(b"other", PEER2).unwrap();
        let bind = sent_request(&sent, before + 3, &key());
        assert_eq!(bind.channel_number(), Some(0x4001));
        assert_eq!(bind.xor_peer_address(), Some(PEER2));
    }

    #[test]
    fn channel_numbers_are_never_assigned_past_the_turn_range() {
        let now = Instant::now();
        let (mut allocation, _sent) = connected_allocation(now);
        allocation.next_channel = LAST_CHANNEL + 1;

        assert!(allocation.send_datagram(b"hello", PEER1).is_err());
    }

    #[test]
    fn demultiplexes_channel_data_from_known_channels() {
        let now = Instant::now();
        let (mut allocation, _sent) = connected_allocation(now);
        allocation.send_datagram(b"hello", PEER1).unwrap();

        let frame = channel_data::encode(0x4000, b"response");
        let (payload, peer) = allocation.handle_read(&frame, SERVER, now).unwrap();
        assert_eq!(payload, b"response");
        assert_eq!(peer, PEER1);

        // Unknown channels are dropped.
        let frame = channel_data::encode(0x4005, b"stray");
        assert!(allocation.handle_read(&frame, SERVER, now).is_none());

        // So is anything from the wrong source.
        let frame = channel_data::encode(0x4000, b"spoofed");
        assert!(allocation.handle_read(&frame, PEER2, now).is_none());
    }

    #[test]
    fn channel_bind_errors_do_not_tear_down_the_allocation() {
        let now = Instant::now();
        let (mut allocation, sent) = connected_allocation(now);
        let before = sent.borrow().len();

        allocation.send_datagram(b"hello", PEER1).unwrap();

        let bind = sent_request(&sent, before, &key());
        let mut failure =
            StunMessage::new(method::CHANNEL_BIND | class::ERROR, bind.transaction_id());
        failure.set_error_code(403, "Forbidden");
        respond(&mut allocation, &failure, now);

        assert_eq!(allocation.state(), AllocationState::Connected);
    }

    #[test]
    fn refreshes_on_timeout_and_rearms_on_success() {
        let start = Instant::now();
        let (mut allocation, sent) = connected_allocation(start);
        let before = sent.borrow().len();

        let refresh_at = allocation.poll_timeout().unwrap();
        assert_eq!(refresh_at, start + Duration::from_secs(540));

        allocation.handle_timeout(refresh_at);

        let refresh = sent_request(&sent, before, &key());
        assert_eq!(refresh.method(), method::REFRESH);
        assert_eq!(refresh.username(), Some("user"));
        assert_eq!(refresh.lifetime(), None);

        let mut success =
            StunMessage::new(method::REFRESH | class::RESPONSE, refresh.transaction_id());
        success.set_lifetime(600);
        respond(&mut allocation, &success, refresh_at);

        assert_eq!(
            allocation.poll_timeout(),
            Some(refresh_at + Duration::from_secs(540))
        );
        assert_eq!(allocation.state(), AllocationState::Connected);
    }

    #[test]
    fn refresh_failure_drops_the_allocation() {
        let start = Instant::now();
        let (mut allocation, sent) = connected_allocation(start);
        let before = sent.borrow().len();

        let refresh_at = allocation.poll_timeout().unwrap();
        allocation.handle_timeout(refresh_at);

        let refresh = sent_request(&sent, before, &key());
        let mut failure =
            StunMessage::new(method::REFRESH | class::ERROR, refresh.transaction_id());
        failure.set_error_code(437, "Allocation Mismatch");
        respond(&mut allocation, &failure, refresh_at);

        assert_eq!(allocation.state(), AllocationState::Unconnected);
        assert_eq!(allocation.poll_event(), Some(AllocationEvent::Disconnected));
        assert_eq!(allocation.poll_timeout(), None);
    }

    #[test]
    fn disconnect_sends_a_zero_lifetime_refresh() {
        let now = Instant::now();
        let (mut allocation, sent) = connected_allocation(now);
        let before = sent.borrow().len();

        allocation.disconnect();
        assert_eq!(allocation.state(), AllocationState::Closing);

        let refresh = sent_request(&sent, before, &key());
        assert_eq!(refresh.method(), method::REFRESH);
        assert_eq!(refresh.lifetime(), Some(0));

        let success =
            StunMessage::new(method::REFRESH | class::RESPONSE, refresh.transaction_id());
        respond(&mut allocation, &success, now);

        assert_eq!(allocation.state(), AllocationState::Unconnected);
        assert_eq!(allocation.poll_event(), Some(AllocationEvent::Disconnected));
    }
}
