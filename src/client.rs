// The requesting side of a transfer.
//
// A client transfer starts on a fresh ephemeral socket with an RRQ or WRQ aimed at the server's
// well-known port. The server answers from a port of its own; that first answer fixes the peer for
// the rest of the transfer. If the answer is an OACK the negotiated options are adopted before the
// first block moves, otherwise the answer is already part of the block exchange.

use crate::netascii::{ModeReader, ModeWriter};
use crate::options::{OptionSet, DEFAULT_BLOCK_SIZE, TSIZE};
use crate::processor::PacketProcessor;
use crate::session::{self, Session};
use crate::shutdown::Shutdown;
use crate::tftp::{FileMode, Packet, TftpSocket};
use crate::transfer::{State, TransferError, TransferSession};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub mode: FileMode,
    /// Options to request. Empty means the plain RFC 1350 exchange.
    pub options: OptionSet,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> ClientConfig {
        ClientConfig { server, mode: FileMode::Octet, options: OptionSet::new() }
    }
}

#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    shutdown: Shutdown,
}

impl Client {
    pub fn new(config: ClientConfig, shutdown: Shutdown) -> Client {
        Client { config, shutdown }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Downloads `remote` into a local file at `dest`.
    ///
    /// Blocks go to a `.part` file next to `dest`, which replaces `dest` only once the transfer
    /// completes. A failed download leaves an existing `dest` untouched.
    pub async fn download(&self, remote: &str, dest: &Path) -> Result<(), TransferError> {
        let partial = partial_path(dest)?;
        let file = File::create(&partial).await?;
        match self.download_to(remote, file).await {
            Ok(()) => Ok(tokio::fs::rename(&partial, dest).await?),
            Err(e) => {
                if let Err(e) = tokio::fs::remove_file(&partial).await {
                    log::warn!("Unable to remove incomplete download {}: {e}", partial.display());
                }
                Err(e)
            }
        }
    }

    pub async fn download_to<W>(&self, remote: &str, writer: W) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let processor = PacketProcessor::receiving(ModeWriter::new(writer, self.config.mode), DEFAULT_BLOCK_SIZE);
        let request = Packet::ReadReq {
            path: remote.to_string(),
            mode: self.config.mode.as_str().to_string(),
            options: self.config.options.clone(),
        };
        self.transmit(remote, request, State::SentRrq, processor).await
    }

    /// Uploads the contents of a local file, advertising its size when `tsize` is requested.
    pub async fn upload_file(&self, src: &Path, remote: &str) -> Result<(), TransferError> {
        let file = File::open(src).await?;
        let mut options = self.config.options.clone();
        if options.iter().any(|o| o.name.eq_ignore_ascii_case(TSIZE)) {
            let size = file.metadata().await?.len();
            options.insert(TSIZE, size.to_string());
        }
        self.upload_with(file, remote, options).await
    }

    pub async fn upload<R>(&self, reader: R, remote: &str) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.upload_with(reader, remote, self.config.options.clone()).await
    }

    async fn upload_with<R>(&self, reader: R, remote: &str, options: OptionSet) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let processor = PacketProcessor::sending(ModeReader::new(reader, self.config.mode), DEFAULT_BLOCK_SIZE);
        let request = Packet::WriteReq {
            path: remote.to_string(),
            mode: self.config.mode.as_str().to_string(),
            options,
        };
        self.transmit(remote, request, State::SentWrq, processor).await
    }

    async fn transmit(
        &self,
        path: &str,
        request: Packet,
        state: State,
        mut processor: PacketProcessor,
    ) -> Result<(), TransferError> {
        let sock = TftpSocket::bind(session::ephemeral_addr(self.config.server))?;
        // Until an OACK says otherwise, wait as long as we asked the server to.
        let timeout = self.config.options.validate().timeout();
        let session = Session::connect(sock, self.config.server, timeout)?;
        let mut transfer = TransferSession::new(session, path, OptionSet::defaults(), state);

        if self.shutdown.is_triggered() {
            return Err(TransferError::Cancelled);
        }
        let Some(reply) = transfer.exchange(Some(request)).await else {
            return transfer.finish().await;
        };

        let first = match reply {
            Packet::OptionAck { options } => {
                let negotiated = options.validate();
                log::info!("Negotiated options: {}", negotiated);
                if negotiated.is_accepted(TSIZE) {
                    log::info!("Transfer size is {} bytes", negotiated.transfer_size());
                }
                processor.set_block_size(negotiated.block_size());
                transfer.set_options(negotiated);
                processor.first_packet().await
            }
            other => processor.process_packet(&other).await,
        };

        transfer.set_state(State::DataTransfer);
        let result = transfer.run(&mut processor, first, &self.shutdown).await;
        match &result {
            Ok(()) => log::info!("Transfer of \"{}\" with {} complete", path, transfer.session().peer_addr()),
            Err(e) => log::warn!("Transfer of \"{}\" failed: {}", path, e),
        }
        result
    }
}

fn partial_path(dest: &Path) -> io::Result<PathBuf> {
    let Some(name) = dest.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not name a file", dest.display()),
        ));
    };
    let mut partial = name.to_os_string();
    partial.push(".part");
    Ok(dest.with_file_name(partial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::ErrorCode;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;
    use tempdir::TempDir;

    /// A scripted stand-in for a server: the listening socket plus a separate transfer socket.
    struct FakeServer {
        listener: UdpSocket,
        transfer: UdpSocket,
    }

    impl FakeServer {
        fn new() -> FakeServer {
            let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            let transfer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            transfer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            FakeServer { listener, transfer }
        }

        fn addr(&self) -> SocketAddr {
            self.listener.local_addr().unwrap()
        }

        fn accept(&self) -> (Packet, SocketAddr) {
            recv(&self.listener)
        }

        fn send(&self, packet: Packet, to: SocketAddr) {
            self.transfer.send_to(&packet.encode(), to).unwrap();
        }

        fn recv(&self) -> Packet {
            recv(&self.transfer).0
        }
    }

    fn recv(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        let (n, src) = sock.recv_from(&mut buf).unwrap();
        (Packet::decode(&buf[..n]).unwrap(), src)
    }

    fn client_for(server: SocketAddr, options: OptionSet) -> Client {
        let mut config = ClientConfig::new(server);
        config.options = options;
        Client::new(config, Shutdown::never())
    }

    #[tokio::test]
    async fn test_download_without_options() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let dest = tmpdir.path().join("report.txt");
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (request, peer) = server.accept();
            assert_eq!(
                request,
                Packet::ReadReq { path: "report.txt".to_string(), mode: "octet".to_string(), options: OptionSet::new() }
            );
            server.send(Packet::Data { block: 1, data: vec![b'a'; 512] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            server.send(Packet::Data { block: 2, data: vec![b'b'; 100] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 2 });
        });

        tokio_test::assert_ok!(client.download("report.txt", &dest).await);
        script.join().unwrap();

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len(), 612);
        assert_eq!(&written[512..], &[b'b'; 100][..]);
    }

    #[tokio::test]
    async fn test_download_with_oack() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let dest = tmpdir.path().join("big.bin");
        let server = FakeServer::new();
        let requested = OptionSet::new().with_option("blksize", "1024").with_option("tsize", "0");
        let client = client_for(server.addr(), requested.clone());

        let script = std::thread::spawn(move || {
            let (request, peer) = server.accept();
            assert_eq!(
                request,
                Packet::ReadReq { path: "big.bin".to_string(), mode: "octet".to_string(), options: requested }
            );
            server.send(
                Packet::OptionAck { options: OptionSet::new().with_option("blksize", "1024").with_option("tsize", "1030") },
                peer,
            );
            assert_eq!(server.recv(), Packet::Ack { block: 0 });
            server.send(Packet::Data { block: 1, data: vec![1; 1024] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            server.send(Packet::Data { block: 2, data: vec![2; 6] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 2 });
        });

        tokio_test::assert_ok!(client.download("big.bin", &dest).await);
        script.join().unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1030);
    }

    #[tokio::test]
    async fn test_download_duplicate_block_repeats_ack() {
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::Data { block: 1, data: vec![0; 512] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            server.send(Packet::Data { block: 1, data: vec![0; 512] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            server.send(Packet::Data { block: 2, data: vec![] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 2 });
        });

        tokio_test::assert_ok!(client.download_to("dup", tokio::io::sink()).await);
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_download_skipped_block_fails_and_removes_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let dest = tmpdir.path().join("skip.bin");
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::Data { block: 1, data: vec![0; 512] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            server.send(Packet::Data { block: 3, data: vec![0; 512] }, peer);
            assert_eq!(server.recv(), Packet::error(ErrorCode::Illegal));
        });

        let err = client.download("skip", &dest).await.unwrap_err();
        assert!(matches!(err, TransferError::Local { code: ErrorCode::Illegal, .. }));
        script.join().unwrap();
        assert!(!dest.exists());
        assert!(!tmpdir.path().join("skip.bin.part").exists());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let dest = tmpdir.path().join("keep.txt");
        std::fs::write(&dest, b"precious").unwrap();
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::error(ErrorCode::FileNotFound), peer);
        });

        let err = client.download("keep.txt", &dest).await.unwrap_err();
        assert!(matches!(err, TransferError::Remote(_)));
        script.join().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"precious");
        assert!(!tmpdir.path().join("keep.txt.part").exists());
    }

    #[tokio::test]
    async fn test_download_replaces_existing_file_on_success() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let dest = tmpdir.path().join("fresh.txt");
        std::fs::write(&dest, b"stale contents that are longer").unwrap();
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::Data { block: 1, data: b"new".to_vec() }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
        });

        tokio_test::assert_ok!(client.download("fresh.txt", &dest).await);
        script.join().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        assert!(!tmpdir.path().join("fresh.txt.part").exists());
    }

    #[test]
    fn test_partial_path_sits_next_to_destination() {
        assert_eq!(partial_path(Path::new("/tmp/a/b.bin")).unwrap(), PathBuf::from("/tmp/a/b.bin.part"));
        assert!(partial_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_download_error_reply() {
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::error(ErrorCode::FileNotFound), peer);
        });

        let err = client.download_to("missing", tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, TransferError::Remote(_)));
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_reply_from_other_port_is_unknown_tid() {
        let server = FakeServer::new();
        let intruder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::Data { block: 1, data: vec![0; 512] }, peer);
            assert_eq!(server.recv(), Packet::Ack { block: 1 });
            intruder.send_to(&Packet::Data { block: 2, data: vec![0; 10] }.encode(), peer).unwrap();
            assert_eq!(server.recv(), Packet::error(ErrorCode::UnknownTid));
        });

        let err = client.download_to("spoof", tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, TransferError::Local { code: ErrorCode::UnknownTid, .. }));
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_first_reply_is_illegal() {
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (_, peer) = server.accept();
            server.send(Packet::Ack { block: 0 }, peer);
            assert_eq!(server.recv(), Packet::error(ErrorCode::Illegal));
        });

        let err = client.download_to("x", tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, TransferError::Local { code: ErrorCode::Illegal, .. }));
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_upload_exact_multiple_sends_empty_block() {
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new());

        let script = std::thread::spawn(move || {
            let (request, peer) = server.accept();
            assert!(matches!(request, Packet::WriteReq { ref path, .. } if path == "up.bin"));
            server.send(Packet::Ack { block: 0 }, peer);
            assert_eq!(server.recv(), Packet::Data { block: 1, data: vec![9; 512] });
            server.send(Packet::Ack { block: 1 }, peer);
            assert_eq!(server.recv(), Packet::Data { block: 2, data: vec![] });
            server.send(Packet::Ack { block: 2 }, peer);
        });

        tokio_test::assert_ok!(client.upload(std::io::Cursor::new(vec![9u8; 512]), "up.bin").await);
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_upload_file_with_oack() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let src = tmpdir.path().join("src.bin");
        std::fs::write(&src, vec![5u8; 1500]).unwrap();
        let server = FakeServer::new();
        let client = client_for(server.addr(), OptionSet::new().with_option("blksize", "1024").with_option("tsize", "0"));

        let script = std::thread::spawn(move || {
            let (request, peer) = server.accept();
            let Packet::WriteReq { options, .. } = request else { panic!("expected WRQ") };
            assert_eq!(options.to_string(), "blksize=1024 tsize=1500");
            server.send(Packet::OptionAck { options }, peer);
            assert_eq!(server.recv(), Packet::Data { block: 1, data: vec![5; 1024] });
            server.send(Packet::Ack { block: 1 }, peer);
            assert_eq!(server.recv(), Packet::Data { block: 2, data: vec![5; 476] });
            server.send(Packet::Ack { block: 2 }, peer);
        });

        tokio_test::assert_ok!(client.upload_file(&src, "dst.bin").await);
        script.join().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = FakeServer::new();
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();
        let client = Client::new(ClientConfig::new(server.addr()), shutdown);

        let err = client.download_to("x", tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
