//! Out-of-band TCP handshake.
//!
//! The connector writes its record first and reads the listener's reply;
//! the listener reads first and answers. Each side stamps its record with
//! its own end of the socket before sending.

use super::record::{RendezvousRecord, read_frame, write_record};
use crate::error::{EndpointError, EndpointResult};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ACCEPT_POLL: Duration = Duration::from_millis(2);

/// Completed parameter exchange.
#[derive(Debug)]
pub struct Exchange {
    /// Rendezvous socket, still open.
    pub stream: TcpStream,
    /// Record this side sent.
    pub local: RendezvousRecord,
    /// Record the peer sent.
    pub remote: RendezvousRecord,
    /// Peer's socket address.
    pub peer: SocketAddr,
}

/// Listening half of the channel.
#[derive(Debug)]
pub struct RendezvousListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RendezvousListener {
    /// Bind `addr`. The socket is non-blocking so it can sit in an epoll set.
    ///
    /// # Errors
    ///
    /// `EndpointError::Bind` if the address is in use or not bindable.
    pub fn bind(addr: SocketAddr) -> EndpointResult<Self> {
        let bind_err = |source| EndpointError::Bind { addr, source };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(%local_addr, "Rendezvous listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Bound address with port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection within `timeout` and read the peer's record.
    ///
    /// # Errors
    ///
    /// `EndpointError::Accept` on timeout or socket failure,
    /// `EndpointError::Protocol` on a malformed record.
    pub fn accept(&self, timeout: Duration) -> EndpointResult<Incoming> {
        let deadline = Instant::now() + timeout;
        let (mut stream, peer) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EndpointError::accept(format!(
                            "no connection on {} within {timeout:?}",
                            self.local_addr
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL.min(deadline - now));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(EndpointError::accept(e)),
            }
        };
        debug!(%peer, "Rendezvous connection accepted");

        prepare(&stream, timeout).map_err(EndpointError::accept)?;
        let body = read_frame(&mut stream).map_err(EndpointError::accept)?;
        let remote = RendezvousRecord::decode(&body)?;

        Ok(Incoming {
            stream,
            peer,
            remote,
        })
    }
}

impl AsFd for RendezvousListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// Accepted connection whose record has been read but not yet answered.
#[derive(Debug)]
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    remote: RendezvousRecord,
}

impl Incoming {
    /// Connector's record.
    pub fn remote(&self) -> &RendezvousRecord {
        &self.remote
    }

    /// Connector's socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send this side's record and finish the exchange.
    pub fn reply(mut self, mut local: RendezvousRecord) -> EndpointResult<Exchange> {
        local.addr = local_v4(&self.stream)?;
        write_record(&mut self.stream, &local).map_err(EndpointError::accept)?;
        Ok(Exchange {
            stream: self.stream,
            local,
            remote: self.remote,
            peer: self.peer,
        })
    }
}

/// Dial `addr`, send `local`, and read the listener's record.
///
/// # Errors
///
/// `EndpointError::Connect` if the peer is unreachable or the socket fails,
/// `EndpointError::Protocol` on a malformed reply.
pub fn connect(addr: SocketAddr, mut local: RendezvousRecord, timeout: Duration) -> EndpointResult<Exchange> {
    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| EndpointError::connect(addr, e))?;
    prepare(&stream, timeout).map_err(|e| EndpointError::connect(addr, e))?;

    local.addr = local_v4(&stream)?;
    write_record(&mut stream, &local).map_err(|e| EndpointError::connect(addr, e))?;
    let body = read_frame(&mut stream).map_err(|e| EndpointError::connect(addr, e))?;
    let remote = RendezvousRecord::decode(&body)?;
    debug!(%addr, remote_qp = remote.queue_pair.qp_num, "Rendezvous exchange complete");

    Ok(Exchange {
        stream,
        local,
        remote,
        peer: addr,
    })
}

fn prepare(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

fn local_v4(stream: &TcpStream) -> EndpointResult<SocketAddrV4> {
    match stream.local_addr()? {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => Ok(SocketAddrV4::new(ip, v6.port())),
            None => Err(EndpointError::protocol(format!(
                "rendezvous records carry IPv4 only, socket is {v6}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Gid, QpEndpoint};
    use crate::region::RemoteRegion;
    use crate::rendezvous::record::TransportKind;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn record(qp_num: u32) -> RendezvousRecord {
        RendezvousRecord {
            transport: TransportKind::Rdma,
            queue_pair: QpEndpoint {
                qp_num,
                psn: 1,
                lid: 2,
                gid: Gid::default(),
            },
            region: RemoteRegion {
                addr: 0x1000,
                len: 4096,
                rkey: 3,
            },
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn exchange_swaps_records() {
        let listener = RendezvousListener::bind(loopback()).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let connector = thread::spawn(move || connect(addr, record(10), TIMEOUT));
        let incoming = listener.accept(TIMEOUT).unwrap();
        assert_eq!(incoming.remote().queue_pair.qp_num, 10);
        let served = incoming.reply(record(20)).unwrap();
        let dialed = connector.join().unwrap().unwrap();

        assert_eq!(dialed.remote.queue_pair.qp_num, 20);
        assert_eq!(served.remote.queue_pair.qp_num, 10);
        assert_eq!(dialed.remote.addr.port(), addr.port());
        assert_eq!(*dialed.remote.addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(served.remote, dialed.local);
        assert_eq!(dialed.remote, served.local);
    }

    #[test]
    fn bind_in_use_fails() {
        let first = RendezvousListener::bind(loopback()).unwrap();
        let err = RendezvousListener::bind(first.local_addr()).unwrap_err();
        assert!(matches!(err, EndpointError::Bind { .. }));
    }

    #[test]
    fn accept_times_out() {
        let listener = RendezvousListener::bind(loopback()).unwrap();
        let err = listener.accept(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, EndpointError::Accept { .. }));
    }

    #[test]
    fn connect_refused() {
        let addr = {
            let vacated = TcpListener::bind(loopback()).unwrap();
            vacated.local_addr().unwrap()
        };
        let err = connect(addr, record(1), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, EndpointError::Connect { .. }));
    }

    #[test]
    fn malformed_record_is_protocol_error() {
        let listener = RendezvousListener::bind(loopback()).unwrap();
        let addr = listener.local_addr();
        let sender = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[0, 3, b'b', b'a', b'd']).unwrap();
            stream
        });
        let err = listener.accept(TIMEOUT).unwrap_err();
        assert!(matches!(err, EndpointError::Protocol { .. }));
        drop(sender.join().unwrap());
    }
}
