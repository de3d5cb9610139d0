// The listener: a single socket on the well-known port that turns requests into connections.
//
// Nothing but RRQ and WRQ is expected here. Each accepted request gets its own ServerConnection
// running as a task in the listener's JoinSet, so the loop goes straight back to receiving. On
// shutdown the listener stops receiving and waits for every connection to wind down.

use crate::shutdown::Shutdown;
use crate::srv_conn::ServerConnection;
use crate::tftp::{ErrorCode, Packet, TftpResult, TftpSocket};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;

/// The registered TFTP port.
pub const DEFAULT_PORT: u16 = 69;

const RECV_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `consecutive` receive failures in a row, doubling up to a one second cap.
fn recv_backoff(consecutive: u32) -> Duration {
    let factor = 1u32 << consecutive.saturating_sub(1).min(10);
    RECV_BACKOFF_BASE.saturating_mul(factor).min(RECV_BACKOFF_MAX)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the listening socket. Transfer sockets bind the same IP.
    pub bind_address: SocketAddr,
    /// Directory every requested filename is resolved under.
    pub root_dir: PathBuf,
    /// Ports transfer sockets are drawn from. `None` lets the OS pick.
    pub port_range: Option<RangeInclusive<u16>>,
    pub allow_writes: bool,
}

impl ServerConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            bind_address: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            root_dir: root_dir.into(),
            port_range: None,
            allow_writes: true,
        }
    }
}

#[derive(Debug)]
pub struct Server {
    sock: TftpSocket,
    local_port: u16,
    config: ServerConfig,
    connections: JoinSet<()>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> TftpResult<Server> {
        let sock = TftpSocket::bind(config.bind_address)?;
        let local_port = sock.local_addr()?.port();
        Ok(Server { sock, local_port, config, connections: JoinSet::new() })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Accepts requests until `shutdown` fires, then waits for the running transfers.
    pub async fn run(mut self, shutdown: Shutdown) -> TftpResult<()> {
        log::info!("Serving {} on {}", self.config.root_dir.display(), self.local_addr()?);
        let mut signal = shutdown.clone();
        let mut recv_errors = 0u32;

        while !shutdown.is_triggered() {
            tokio::select! {
                _ = signal.wait() => break,
                received = self.sock.recv_raw() => match received {
                    Ok((buf, src)) => {
                        recv_errors = 0;
                        self.handle_datagram(&buf, src, &shutdown).await
                    }
                    Err(e) => {
                        recv_errors = recv_errors.saturating_add(1);
                        let pause = recv_backoff(recv_errors);
                        log::warn!("Error receiving on the listening socket: {e}, pausing {pause:?}");
                        tokio::select! {
                            _ = signal.wait() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
                Some(joined) = self.connections.join_next(), if !self.connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }

        log::info!("Shutting down, waiting for {} transfer(s)", self.connections.len());
        while let Some(joined) = self.connections.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection task failed: {e}");
            }
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, buf: &[u8], src: SocketAddr, shutdown: &Shutdown) {
        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Malformed packet from {src}: {e}");
                self.reply_error(src, ErrorCode::Illegal, ErrorCode::Illegal.default_message()).await;
                return;
            }
        };
        log::info!("{}", packet.format_packet(src, self.local_port));

        match ServerConnection::accept(&self.config, packet, src) {
            Ok(conn) => {
                self.connections.spawn(conn.run(shutdown.clone()));
            }
            Err(e) => {
                log::warn!("Rejected request from {src}: {e}");
                let (code, message) = e.wire_error();
                self.reply_error(src, code, message).await;
            }
        }
    }

    async fn reply_error(&self, dst: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::Error { code, message: message.to_string() };
        log::debug!("sent {}", packet.format_packet(dst, self.local_port));
        if let Err(e) = self.sock.send(&packet, dst).await {
            log::warn!("Unable to send error to {dst}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionSet;
    use crate::shutdown;
    use std::net::UdpSocket;
    use std::time::Duration;
    use tempdir::TempDir;

    fn client() -> UdpSocket {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock
    }

    fn recv(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = vec![0u8; 1024];
        let (n, src) = sock.recv_from(&mut buf).unwrap();
        (Packet::decode(&buf[..n]).unwrap(), src)
    }

    fn start(root: &std::path::Path) -> (SocketAddr, shutdown::ShutdownTrigger, tokio::task::JoinHandle<TftpResult<()>>) {
        let mut config = ServerConfig::new(root);
        config.bind_address = (Ipv4Addr::LOCALHOST, 0).into();
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let (trigger, shutdown) = shutdown::channel();
        (addr, trigger, tokio::spawn(server.run(shutdown)))
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::new("/srv/tftp");
        assert_eq!(config.bind_address.port(), DEFAULT_PORT);
        assert!(config.allow_writes);
        assert!(config.port_range.is_none());
    }

    #[test]
    fn test_recv_backoff_grows_and_caps() {
        assert_eq!(recv_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_backoff(5), Duration::from_millis(160));
        assert_eq!(recv_backoff(8), Duration::from_secs(1));
        assert_eq!(recv_backoff(u32::MAX), Duration::from_secs(1));
        assert!((1..20).all(|n| recv_backoff(n) <= recv_backoff(n + 1)));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_illegal_from_listener() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (addr, trigger, handle) = start(tmpdir.path());
        let client = client();

        let client = tokio::task::spawn_blocking(move || {
            client.send_to(&[0x00, 0x01, b'x'], addr).unwrap();
            let (reply, src) = recv(&client);
            assert_eq!(reply, Packet::error(ErrorCode::Illegal));
            assert_eq!(src, addr);
            client
        })
        .await
        .unwrap();

        tokio::task::spawn_blocking(move || {
            client.send_to(&Packet::Ack { block: 1 }.encode(), addr).unwrap();
            let (reply, src) = recv(&client);
            assert_eq!(reply, Packet::error(ErrorCode::Illegal));
            assert_eq!(src, addr);
        })
        .await
        .unwrap();

        trigger.trigger();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_path_escape_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let (addr, trigger, handle) = start(tmpdir.path());
        let client = client();

        tokio::task::spawn_blocking(move || {
            let request = Packet::ReadReq {
                path: "../secret".to_string(),
                mode: "octet".to_string(),
                options: OptionSet::new(),
            };
            client.send_to(&request.encode(), addr).unwrap();
            let (reply, src) = recv(&client);
            assert_eq!(reply, Packet::error(ErrorCode::AccessViolation));
            assert_eq!(src, addr);
        })
        .await
        .unwrap();

        trigger.trigger();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_request_is_served_from_another_port() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("hello.txt"), b"hello").unwrap();
        let (addr, trigger, handle) = start(tmpdir.path());
        let client = client();

        tokio::task::spawn_blocking(move || {
            let request = Packet::ReadReq {
                path: "hello.txt".to_string(),
                mode: "octet".to_string(),
                options: OptionSet::new(),
            };
            client.send_to(&request.encode(), addr).unwrap();
            let (data, src) = recv(&client);
            assert_eq!(data, Packet::Data { block: 1, data: b"hello".to_vec() });
            assert_ne!(src, addr);
            client.send_to(&Packet::Ack { block: 1 }.encode(), src).unwrap();
        })
        .await
        .unwrap();

        trigger.trigger();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_reaches_running_connections() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("big.bin"), vec![0u8; 4096]).unwrap();
        let (addr, trigger, handle) = start(tmpdir.path());
        let client = client();

        let client = tokio::task::spawn_blocking(move || {
            let request = Packet::ReadReq {
                path: "big.bin".to_string(),
                mode: "octet".to_string(),
                options: OptionSet::new(),
            };
            client.send_to(&request.encode(), addr).unwrap();
            assert!(matches!(recv(&client).0, Packet::Data { block: 1, .. }));
            client
        })
        .await
        .unwrap();

        trigger.trigger();
        tokio_test::assert_ok!(handle.await.unwrap());

        let (reply, _) = recv(&client);
        assert_eq!(reply, Packet::Error { code: ErrorCode::Undefined, message: "Server shutting down".to_string() });
    }
}
