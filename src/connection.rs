use crate::candidate::{self, Candidate};
use crate::component::{ComponentEvent, IceComponent};
use crate::socket::{DatagramSocket, reserve_ports};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// How long the overall negotiation may take before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    LocalCandidatesChanged,
}

/// Groups several [`IceComponent`]s under shared credentials and an overall
/// connect timeout.
pub struct IceConnection {
    controlling: bool,
    local_user: String,
    local_password: String,
    stun_server: Option<SocketAddr>,
    components: BTreeMap<u16, IceComponent>,
    connect_deadline: Option<Instant>,
    events: VecDeque<ConnectionEvent>,
}

impl IceConnection {
    pub fn new(controlling: bool) -> Self {
        Self {
            controlling,
            local_user: candidate::random_credential(4),
            local_password: candidate::random_credential(22),
            stun_server: None,
            components: BTreeMap::new(),
            connect_deadline: None,
            events: VecDeque::new(),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn local_password(&self) -> &str {
        &self.local_password
    }

    /// Adds a component, for instance 1 for RTP or 2 for RTCP.
    pub fn add_component(&mut self, component: u16) {
        if self.components.contains_key(&component) {
            tracing::warn!(%component, "Already have component");
            return;
        }

        let mut ice = IceComponent::new(component, self.controlling);
        ice.set_local_user(self.local_user.clone());
        ice.set_local_password(self.local_password.clone());
        if let Some(server) = self.stun_server {
            ice.set_stun_server(server);
        }

        self.components.insert(component, ice);
    }

    pub fn component(&mut self, component: u16) -> Option<&mut IceComponent> {
        self.components.get_mut(&component)
    }

    pub fn set_stun_server(&mut self, server: SocketAddr) {
        self.stun_server = Some(server);
        for component in self.components.values_mut() {
            component.set_stun_server(server);
        }
    }

    pub fn set_remote_user(&mut self, user: &str) {
        for component in self.components.values_mut() {
            component.set_remote_user(user);
        }
    }

    pub fn set_remote_password(&mut self, password: &str) {
        for component in self.components.values_mut() {
            component.set_remote_password(password);
        }
    }

    /// Routes a remote candidate to its component.
    pub fn add_remote_candidate(&mut self, candidate: &Candidate) {
        let Some(component) = self.components.get_mut(&candidate.component()) else {
            tracing::warn!(
                component = %candidate.component(),
                "Not adding candidate for unknown component"
            );
            return;
        };

        component.add_remote_candidate(candidate);
    }

    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.components
            .values()
            .flat_map(|c| c.local_candidates())
            .cloned()
            .collect()
    }

    /// Reserves one block of consecutive ports and hands every component one
    /// port on each address.
    pub fn bind<S, F>(&mut self, addresses: &[IpAddr], factory: F, now: Instant) -> bool
    where
        S: DatagramSocket + 'static,
        F: Fn(&SocketAddr) -> io::Result<S>,
    {
        let sockets = reserve_ports(factory, addresses, self.components.len());
        if sockets.is_empty() {
            return false;
        }

        let mut sockets = sockets.into_iter();
        for component in self.components.values_mut() {
            let chunk = sockets
                .by_ref()
                .take(addresses.len())
                .map(|s| Box::new(s) as Box<dyn DatagramSocket>)
                .collect();
            component.set_sockets(chunk, now);
        }

        true
    }

    /// Starts connectivity checks on every component and arms the overall
    /// connect timeout.
    pub fn connect_to_host(&mut self, now: Instant) {
        for component in self.components.values_mut() {
            component.connect_to_host(now);
        }

        self.connect_deadline = Some(now + CONNECT_TIMEOUT);
    }

    pub fn is_connected(&self) -> bool {
        self.components.values().all(|c| c.is_connected())
    }

    pub fn close(&mut self) {
        self.connect_deadline = None;
        for component in self.components.values_mut() {
            component.close();
        }
    }

    /// Feeds one datagram from a component's socket through the stack.
    pub fn handle_read(
        &mut self,
        component: u16,
        socket: usize,
        buf: &[u8],
        from: SocketAddr,
    ) -> Option<Vec<u8>> {
        let payload = self
            .components
            .get_mut(&component)?
            .handle_read(socket, buf, from);
        self.roll_up_component_events();

        payload
    }

    /// Feeds one datagram from a component's TURN socket through the stack.
    pub fn handle_turn_read(
        &mut self,
        component: u16,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let payload = self
            .components
            .get_mut(&component)?
            .handle_turn_read(buf, from, now);
        self.roll_up_component_events();

        payload
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.components
            .values()
            .filter_map(|c| c.poll_timeout())
            .chain(self.connect_deadline)
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for component in self.components.values_mut() {
            component.handle_timeout(now);
        }
        self.roll_up_component_events();

        if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
            tracing::warn!("ICE negotiation timed out");

            self.connect_deadline = None;
            for component in self.components.values_mut() {
                component.close();
            }
            self.events.push_back(ConnectionEvent::Disconnected);
        }
    }

    fn roll_up_component_events(&mut self) {
        let mut drained = Vec::new();
        for component in self.components.values_mut() {
            while let Some(event) = component.poll_event() {
                drained.push(event);
            }
        }

        for event in drained {
            match event {
                ComponentEvent::Connected => {
                    if self.components.values().all(|c| c.is_connected())
                        && self.connect_deadline.take().is_some()
                    {
                        self.events.push_back(ConnectionEvent::Connected);
                    }
                }
                ComponentEvent::LocalCandidatesChanged => {
                    self.events.push_back(ConnectionEvent::LocalCandidatesChanged);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct Network {
        queues: RefCell<HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>>,
    }

    impl Network {
        fn pop(&self, addr: SocketAddr) -> Option<(Vec<u8>, SocketAddr)> {
            self.queues.borrow_mut().get_mut(&addr)?.pop_front()
        }

        fn is_idle(&self) -> bool {
            self.queues.borrow().values().all(|q| q.is_empty())
        }
    }

    struct NetSocket {
        local: SocketAddr,
        network: Rc<Network>,
    }

    impl DatagramSocket for NetSocket {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize> {
            self.network
                .queues
                .borrow_mut()
                .entry(dst)
                .or_default()
                .push_back((payload.to_vec(), self.local));

            Ok(payload.len())
        }
    }

    fn network_factory(network: &Rc<Network>) -> impl Fn(&SocketAddr) -> io::Result<NetSocket> {
        let network = Rc::clone(network);

        move |addr| {
            Ok(NetSocket {
                local: *addr,
                network: Rc::clone(&network),
            })
        }
    }

    fn exchange(a: &mut IceConnection, b: &mut IceConnection) {
        let (a_user, a_password) = (a.local_user().to_owned(), a.local_password().to_owned());
        let (b_user, b_password) = (b.local_user().to_owned(), b.local_password().to_owned());
        a.set_remote_user(&b_user);
        a.set_remote_password(&b_password);
        b.set_remote_user(&a_user);
        b.set_remote_password(&a_password);

        for candidate in b.local_candidates() {
            a.add_remote_candidate(&candidate);
        }
        for candidate in a.local_candidates() {
            b.add_remote_candidate(&candidate);
        }
    }

    #[test]
    fn bind_hands_every_component_one_port_per_address() {
        let network = Rc::new(Network::default());
        let addresses: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "10.0.0.1".parse().unwrap()];

        let mut connection = IceConnection::new(true);
        connection.add_component(1);
        connection.add_component(2);

        assert!(connection.bind(&addresses, network_factory(&network), Instant::now()));

        let rtp: Vec<_> = connection.component(1).unwrap().local_candidates().to_vec();
        let rtcp: Vec<_> = connection.component(2).unwrap().local_candidates().to_vec();

        assert_eq!(rtp.len(), 2);
        assert_eq!(rtcp.len(), 2);
        assert!(rtp.iter().all(|c| c.port() == 40000));
        assert!(rtcp.iter().all(|c| c.port() == 40001));
        assert_eq!(rtp[0].port() % 2, 0);
    }

    #[test]
    fn components_inherit_the_shared_credentials() {
        let mut connection = IceConnection::new(true);
        connection.add_component(1);

        assert_eq!(connection.local_user().len(), 4);
        assert_eq!(connection.local_password().len(), 22);

        let user = connection.local_user().to_owned();
        assert_eq!(connection.component(1).unwrap().local_user(), user);
    }

    #[test]
    fn connects_once_every_component_is_nominated() {
        let start = Instant::now();
        let network = Rc::new(Network::default());

        let mut a = IceConnection::new(true);
        a.add_component(1);
        let mut b = IceConnection::new(false);
        b.add_component(1);

        let a_ip: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap()];
        assert!(a.bind(&a_ip, network_factory(&network), start));
        // A grabbed the 40000 block; B's search continues upward from there.
        let taken: std::collections::HashSet<u16> =
            a.local_candidates().iter().map(|c| c.port()).collect();
        let factory = network_factory(&network);
        let b_factory = move |addr: &SocketAddr| {
            if taken.contains(&addr.port()) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
            }
            factory(addr)
        };
        assert!(b.bind(&a_ip, b_factory, start));

        exchange(&mut a, &mut b);

        a.connect_to_host(start);
        b.connect_to_host(start);

        let a_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        let mut now = start;
        while (!a.is_connected() || !b.is_connected()) && now < start + Duration::from_secs(2) {
            while !network.is_idle() {
                while let Some((payload, from)) = network.pop(a_addr) {
                    a.handle_read(1, 0, &payload, from);
                }
                while let Some((payload, from)) = network.pop(b_addr) {
                    b.handle_read(1, 0, &payload, from);
                }
            }

            now += Duration::from_millis(100);
            a.handle_timeout(now);
            b.handle_timeout(now);
        }

        assert!(a.is_connected());
        assert!(b.is_connected());
        assert_eq!(a.poll_event(), Some(ConnectionEvent::Connected));
        assert_eq!(b.poll_event(), Some(ConnectionEvent::Connected));

        // The deadline is disarmed; only periodic work remains.
        assert!(a.poll_timeout().is_none() || a.poll_timeout() > Some(start + CONNECT_TIMEOUT));
    }

    #[test]
    fn negotiation_times_out_after_thirty_seconds() {
        let start = Instant::now();
        let network = Rc::new(Network::default());

        let mut connection = IceConnection::new(true);
        connection.add_component(1);
        let addresses: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap()];
        assert!(connection.bind(&addresses, network_factory(&network), start));

        connection.connect_to_host(start);
        assert_eq!(
            connection.poll_timeout(),
            Some(start + Duration::from_millis(500))
        );

        let mut now = start;
        while let Some(timeout) = connection.poll_timeout() {
            now = timeout;
            connection.handle_timeout(now);
            if now >= start + CONNECT_TIMEOUT {
                break;
            }
        }

        assert_eq!(now, start + CONNECT_TIMEOUT);
        assert_eq!(connection.poll_event(), Some(ConnectionEvent::Disconnected));
        assert!(!connection.is_connected());
    }

    #[test]
    fn candidates_for_unknown_components_are_dropped() {
        let mut connection = IceConnection::new(true);
        connection.add_component(1);

        let candidate = Candidate::host("127.0.0.1".parse().unwrap(), 1000, 7, "0");
        connection.add_remote_candidate(&candidate);

        // Nothing to assert beyond "no panic"; the candidate has nowhere to go.
        assert!(connection.local_candidates().is_empty());
    }
}
