use rand::Rng as _;
use rand::distributions::Alphanumeric;
use std::fmt;
use std::net::IpAddr;

/// How a candidate's transport address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transport address eligible for media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    component: u16,
    foundation: String,
    host: IpAddr,
    port: u16,
    protocol: String,
    kind: CandidateKind,
    priority: u32,
    id: String,
}

impl Candidate {
    pub fn host(host: IpAddr, port: u16, component: u16, foundation: impl Into<String>) -> Self {
        Self::new(host, port, component, foundation, CandidateKind::Host)
    }

    pub fn server_reflexive(
        host: IpAddr,
        port: u16,
        component: u16,
        foundation: impl Into<String>,
    ) -> Self {
        Self::new(
            host,
            port,
            component,
            foundation,
            CandidateKind::ServerReflexive,
        )
    }

    pub fn peer_reflexive(
        host: IpAddr,
        port: u16,
        component: u16,
        foundation: impl Into<String>,
    ) -> Self {
        Self::new(
            host,
            port,
            component,
            foundation,
            CandidateKind::PeerReflexive,
        )
    }

    pub fn relayed(host: IpAddr, port: u16, component: u16, foundation: impl Into<String>) -> Self {
        Self::new(host, port, component, foundation, CandidateKind::Relayed)
    }

    fn new(
        host: IpAddr,
        port: u16,
        component: u16,
        foundation: impl Into<String>,
        kind: CandidateKind,
    ) -> Self {
        Self {
            component,
            foundation: foundation.into(),
            host,
            port,
            protocol: "udp".to_owned(),
            kind,
            priority: priority(kind, component),
            id: random_id(),
        }
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn ip(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_link_local_ipv6(&self) -> bool {
        is_link_local_ipv6(self.ip())
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} ({})",
            self.kind, self.host, self.port, self.component
        )
    }
}

/// The single-value approximation of the RFC 5245 priority formula.
///
/// All candidates share a local preference of 65535, so priority depends only
/// on the candidate kind and the component id.
pub(crate) fn priority(kind: CandidateKind, component: u16) -> u32 {
    let type_preference: u32 = match kind {
        CandidateKind::Host => 126,
        CandidateKind::PeerReflexive => 110,
        CandidateKind::ServerReflexive => 100,
        CandidateKind::Relayed => 0,
    };

    (type_preference << 24) + (65535 << 8) + (256 - component as u32)
}

pub(crate) fn is_link_local_ipv6(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.segments()[0] & 0xFFC0 == 0xFE80,
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Random credential of the given length, e.g. a 4-char ufrag or 22-char password.
pub(crate) fn random_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
