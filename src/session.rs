// Transport session and retry coordinator.
//
// A Session is one transfer's private UDP socket plus the identity of the peer it talks to. The
// peer's address and port form its transfer ID: once known, a datagram from anywhere else is not
// an answer, it is an error.

use crate::tftp::{Packet, SocketError, TftpResult, TftpSocket};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// How many times an exchange is attempted before a run of timeouts fails it.
pub const MAX_ATTEMPTS: usize = 3;

/// The wildcard address of the same family as `peer`, on an OS-chosen port.
pub fn ephemeral_addr(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// Only the address the request went to is known; the first reply fixes the real one.
    Unconfirmed(SocketAddr),
    Fixed(SocketAddr),
}

impl Peer {
    pub fn addr(self) -> SocketAddr {
        match self {
            Peer::Unconfirmed(addr) | Peer::Fixed(addr) => addr,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    sock: TftpSocket,
    peer: Peer,
    timeout: Duration,
    local_port: u16,
}

impl Session {
    /// Session for the requesting side: requests go to `server`, and whoever answers first becomes
    /// the peer.
    pub fn connect(sock: TftpSocket, server: SocketAddr, timeout: Duration) -> TftpResult<Session> {
        Session::new(sock, Peer::Unconfirmed(server), timeout)
    }

    /// Session for the serving side, whose peer is known from the request.
    pub fn accept(sock: TftpSocket, client: SocketAddr, timeout: Duration) -> TftpResult<Session> {
        Session::new(sock, Peer::Fixed(client), timeout)
    }

    fn new(sock: TftpSocket, peer: Peer, timeout: Duration) -> TftpResult<Session> {
        let local_port = sock.local_addr()?.port();
        Ok(Session { sock, peer, timeout, local_port })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr()
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    pub async fn send(&self, packet: &Packet) -> TftpResult<()> {
        let dst = self.peer.addr();
        log::debug!("sent {}", packet.format_packet(dst, self.local_port));
        self.sock.send(packet, dst).await
    }

    /// Checks the source of a datagram against the transfer ID, fixing it if still unconfirmed.
    pub fn validate_peer(&mut self, src: SocketAddr) -> TftpResult<()> {
        match self.peer {
            Peer::Unconfirmed(_) => {
                self.peer = Peer::Fixed(src);
                Ok(())
            }
            Peer::Fixed(addr) if addr == src => Ok(()),
            Peer::Fixed(_) => Err(SocketError::InvalidPeer(src)),
        }
    }

    /// Waits up to the session timeout for the next datagram. The sender is checked before the
    /// contents are decoded, so a stray datagram fails with `InvalidPeer` however it is framed.
    pub async fn receive(&mut self) -> TftpResult<Packet> {
        let (buf, src) = self.sock.recv_raw_with_timeout(self.timeout).await?;
        self.validate_peer(src)?;
        let packet = Packet::decode(&buf)?;
        log::info!("{}", packet.format_packet(src, self.local_port));
        Ok(packet)
    }

    /// Sends `packet` and waits for the reply, trying up to [`MAX_ATTEMPTS`] times.
    ///
    /// With `should_send` false nothing is transmitted, the session only listens. Only timeouts are
    /// retried; any other failure ends the exchange at once. The caller turns the returned error
    /// into the ERROR packet the peer should get.
    pub async fn send_and_receive(&mut self, packet: &Packet, should_send: bool) -> TftpResult<Packet> {
        for attempt in 1..=MAX_ATTEMPTS {
            if should_send {
                self.send(packet).await?;
            }
            match self.receive().await {
                Ok(reply) => return Ok(reply),
                Err(SocketError::Timeout) => {
                    log::warn!(
                        "Timed out waiting for {} (attempt {attempt}/{MAX_ATTEMPTS})",
                        self.peer.addr()
                    );
                }
                Err(e) => {
                    log::warn!("Exchange with {} failed: {e}", self.peer.addr());
                    return Err(e);
                }
            }
        }
        Err(SocketError::Timeout)
    }
}
