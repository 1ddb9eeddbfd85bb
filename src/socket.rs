use std::io;
use std::net::{IpAddr, SocketAddr};

/// A bound datagram socket, as seen by the ICE/TURN state machines.
///
/// The machines only ever write; the driver owns the receive side and feeds
/// incoming datagrams back in through the `handle_read` family.
pub trait DatagramSocket {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize>;

    /// Releases the transport eagerly. Implementations whose resources are
    /// freed on drop can rely on the default no-op.
    fn close(&self) {}
}

/// A non-blocking UDP socket backed by the standard library.
pub struct UdpSocket {
    inner: std::net::UdpSocket,
    local: SocketAddr,
}

impl UdpSocket {
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }
}

impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(payload, dst)
    }

    fn close(&self) {
        // UDP has no shutdown handshake; the descriptor is released on drop.
        tracing::trace!(local = %self.local, "Closing UDP socket");
    }
}

/// Binds a new non-blocking [`UdpSocket`]; the default socket factory.
pub fn udp(addr: &SocketAddr) -> io::Result<UdpSocket> {
    let inner = std::net::UdpSocket::bind(addr)?;
    inner.set_nonblocking(true)?;
    let local = inner.local_addr()?;

    tracing::trace!(%local, "Bound new UDP socket");

    Ok(UdpSocket { inner, local })
}

/// Reserves `count` consecutive ports, starting on an even port, on every
/// given address.
///
/// The search starts at port 40000. The first port of a block must bind on
/// every address at once; any failure while filling the rest of the block
/// releases everything bound so far and moves the search forward. Returns an
/// empty list when no block fits below port 65536.
///
/// The result is ordered one port at a time across all addresses, so that a
/// slice of `addresses.len()` sockets hands a consumer one port on every
/// address.
pub fn reserve_ports<S, F>(factory: F, addresses: &[IpAddr], count: usize) -> Vec<S>
where
    F: Fn(&SocketAddr) -> io::Result<S>,
{
    if addresses.is_empty() || count == 0 {
        return Vec::new();
    }

    let expected = addresses.len() * count;
    let mut sockets = Vec::with_capacity(expected);
    let mut port: u32 = 40000;

    while sockets.len() != expected {
        if port % 2 == 1 {
            port += 1;
        }

        // Find an even starting port that binds on every address.
        let mut chunk = loop {
            if port > 65536 - count as u32 {
                tracing::warn!(%count, "No block of consecutive ports left to reserve");
                return Vec::new();
            }

            match reserve_port(&factory, addresses, port as u16) {
                Some(chunk) => break chunk,
                None => port += 2,
            }
        };
        sockets.append(&mut chunk);

        // Fill the rest of the block.
        for _ in 1..count {
            port += 1;
            match reserve_port(&factory, addresses, port as u16) {
                Some(mut chunk) => sockets.append(&mut chunk),
                None => break,
            }
        }

        if sockets.len() != expected {
            sockets.clear();
        }
    }

    sockets
}

/// Binds one port on every address, all-or-nothing.
fn reserve_port<S, F>(factory: &F, addresses: &[IpAddr], port: u16) -> Option<Vec<S>>
where
    F: Fn(&SocketAddr) -> io::Result<S>,
{
    let mut sockets = Vec::with_capacity(addresses.len());

    for address in addresses {
        match factory(&SocketAddr::new(*address, port)) {
            Ok(socket) => sockets.push(socket),
            Err(e) => {
                tracing::debug!(%address, %port, "Failed to bind: {e}");
                return None;
            }
        }
    }

    Some(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeSocket {
        local: SocketAddr,
    }

    impl DatagramSocket for FakeSocket {
        fn local_addr(&self) -> SocketAddr {
            self.local
        }

        fn send_to(&self, payload: &[u8], _: SocketAddr) -> io::Result<usize> {
            Ok(payload.len())
        }
    }

    fn refusing(taken: &[u16]) -> impl Fn(&SocketAddr) -> io::Result<FakeSocket> + '_ {
        let taken: HashSet<u16> = taken.iter().copied().collect();

        move |addr| {
            if taken.contains(&addr.port()) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
            }

            Ok(FakeSocket { local: *addr })
        }
    }

    const ADDRESSES: [IpAddr; 2] = [
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)),
    ];

    #[test]
    fn reserves_a_consecutive_block_on_every_address() {
        let sockets = reserve_ports(refusing(&[]), &ADDRESSES, 2);

        let bound: Vec<_> = sockets.iter().map(|s| s.local_addr()).collect();
        assert_eq!(
            bound,
            vec![
                SocketAddr::new(ADDRESSES[0], 40000),
                SocketAddr::new(ADDRESSES[1], 40000),
                SocketAddr::new(ADDRESSES[0], 40001),
                SocketAddr::new(ADDRESSES[1], 40001),
            ]
        );
    }

    #[test]
    fn skips_blocks_whose_first_port_is_taken() {
        let sockets = reserve_ports(refusing(&[40000]), &ADDRESSES, 2);

        assert_eq!(sockets[0].local_addr().port(), 40002);
        assert_eq!(sockets.len(), 4);
    }

    #[test]
    fn releases_the_block_when_a_later_port_fails() {
        let sockets = reserve_ports(refusing(&[40001]), &ADDRESSES, 2);

        let ports: HashSet<u16> = sockets.iter().map(|s| s.local_addr().port()).collect();
        assert_eq!(ports, HashSet::from([40002, 40003]));
        assert_eq!(sockets.len(), 4);
    }

    #[test]
    fn blocks_always_start_on_an_even_port() {
        let sockets = reserve_ports(refusing(&[40000, 40002, 40004]), &ADDRESSES, 1);

        assert_eq!(sockets[0].local_addr().port() % 2, 0);
        assert_eq!(sockets[0].local_addr().port(), 40006);
    }

    #[test]
    fn gives_up_when_no_block_fits() {
        let always_fail =
            |_: &SocketAddr| -> io::Result<FakeSocket> { Err(io::ErrorKind::AddrInUse.into()) };

        let sockets = reserve_ports(always_fail, &ADDRESSES, 2);

        assert!(sockets.is_empty());
    }
}
