//! STUN, TURN and ICE building blocks for establishing bidirectional UDP flow
//! between two peers behind arbitrary NATs.
//!
//! The state machines are sans-IO: they write through an abstract
//! [`DatagramSocket`], and the driver feeds received datagrams and time back
//! in through the `handle_read` / `handle_timeout` families, draining events
//! and deadlines via `poll_event` / `poll_timeout`. Candidate exchange between
//! peers is the caller's business.

mod allocation;
mod candidate;
mod channel_data;
mod component;
mod connection;
mod socket;
mod stun;

pub use allocation::{AllocationEvent, AllocationState, TurnAllocation};
pub use candidate::{Candidate, CandidateKind};
pub use component::{ComponentEvent, IceComponent};
pub use connection::{ConnectionEvent, IceConnection};
pub use socket::{DatagramSocket, UdpSocket, reserve_ports, udp};
pub use stun::{
    MAGIC_COOKIE, StunError, StunMessage, TransactionId, class, long_term_key, method,
    short_term_key,
};
