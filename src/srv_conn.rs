// This module contains the server-side connection handler.
//
// A ServerConnection is created when the listener receives a ReadReq or a WriteReq. It works in
// roughly the following stages:
//
// 1. On accept, the requested path is resolved under the server root, the requested options are
//    validated, and a socket is bound for this transfer alone. From here on every packet to the
//    client leaves from that socket, so the client learns the connection's transfer ID from the
//    first reply.
// 2. The request is checked against the filesystem. A download needs a readable file, an upload a
//    path that does not exist yet. Failures are reported to the client with an ERROR and end the
//    connection.
// 3. The first reply goes out: an OACK if any option was accepted, otherwise DATA 1 (download) or
//    ACK 0 (upload). After that the connection alternates between sending and waiting until the
//    processor reports the last block, or until an error, a timeout or shutdown ends it.
//
// An upload that does not complete leaves no file behind.

use crate::options::TSIZE;
use crate::processor::{PacketProcessor, ResultAction};
use crate::server::ServerConfig;
use crate::session::Session;
use crate::shutdown::Shutdown;
use crate::tftp::{self, ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use crate::transfer::{State, TransferError, TransferSession};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use tokio::io;

/// How many random ports are tried inside a configured port range.
const PORT_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The client reads a file (RRQ).
    Download,
    /// The client writes a file (WRQ).
    Upload,
}

/// Maps a requested filename onto the server root. Leading slashes are dropped; anything that
/// could climb out of the root is refused.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return Err(ServerConnectionError::BadRequest("Empty file name".to_string()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ServerConnectionError::Forbidden(format!(
                    "Refusing path outside of the server root: \"{requested}\""
                )))
            }
        }
    }
    Ok(root.join(relative))
}

/// Binds the socket a single transfer runs on: an OS-chosen port, or a random free one inside the
/// configured range.
fn bind_transfer_socket(config: &ServerConfig) -> tftp::TftpResult<TftpSocket> {
    let mut addr = config.bind_address;
    addr.set_port(0);
    let Some(range) = config.port_range.clone() else {
        return TftpSocket::bind(addr);
    };
    if range.is_empty() {
        return Err(SocketError::IO(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Empty port range {}-{}", range.start(), range.end()),
        )));
    }

    let mut rng = rand::thread_rng();
    let mut last_error = None;
    for _ in 0..PORT_ATTEMPTS {
        addr.set_port(rng.gen_range(range.clone()));
        match TftpSocket::bind(addr) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket to {addr}: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SocketError::IO(io::ErrorKind::AddrInUse.into())))
}

/// One accepted request and the transfer serving it.
#[derive(Debug)]
pub struct ServerConnection {
    transfer: TransferSession,
    direction: Direction,
    file: PathBuf,
    /// The mode string exactly as requested; it is checked when the transfer starts.
    mode: String,
    allow_writes: bool,
    /// Whether the request named `tsize`, whatever value it carried.
    tsize_requested: bool,
    created_file: bool,
}

impl ServerConnection {
    pub fn accept(
        config: &ServerConfig,
        request: Packet,
        client: SocketAddr,
    ) -> Result<ServerConnection, ServerConnectionError> {
        let (direction, path, mode, options) = match request {
            Packet::ReadReq { path, mode, options } => (Direction::Download, path, mode, options),
            Packet::WriteReq { path, mode, options } => (Direction::Upload, path, mode, options),
            other => {
                return Err(ServerConnectionError::BadRequest(format!(
                    "{} cannot start a transfer",
                    other.opcode().name()
                )))
            }
        };

        let file = resolve_path(&config.root_dir, &path)?;
        let tsize_requested = options.iter().any(|o| o.name.eq_ignore_ascii_case(TSIZE));
        let negotiated = options.validate();
        let sock = bind_transfer_socket(config)?;
        let session = Session::accept(sock, client, negotiated.timeout())?;
        log::info!(
            "Accepted {:?} of \"{}\" for {} on {}",
            direction,
            path,
            client,
            session.local_addr()?
        );

        let state = match direction {
            Direction::Download => State::ReceivedRrq,
            Direction::Upload => State::ReceivedWrq,
        };
        Ok(ServerConnection {
            transfer: TransferSession::new(session, &path, negotiated, state),
            direction,
            file,
            mode,
            allow_writes: config.allow_writes,
            tsize_requested,
            created_file: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.transfer.session().local_addr()
    }

    /// Serves the request to completion. If `shutdown` fires first the client is told the server
    /// is going away and a partial upload is removed.
    pub async fn run(mut self, shutdown: Shutdown) {
        let mut signal = shutdown.clone();
        let result = tokio::select! {
            result = self.serve(&shutdown) => result,
            _ = signal.wait() => Err(TransferError::Cancelled),
        };

        let peer = self.transfer.session().peer_addr();
        match result {
            Ok(()) => log::info!("Transfer of \"{}\" with {} complete", self.transfer.path(), peer),
            Err(TransferError::Cancelled) => self.cleanup().await,
            Err(e) => {
                log::warn!("Transfer of \"{}\" with {} failed: {}", self.transfer.path(), peer, e);
                self.remove_partial_upload().await;
            }
        }
    }

    async fn serve(&mut self, shutdown: &Shutdown) -> Result<(), TransferError> {
        let Some(mode) = FileMode::parse(&self.mode) else {
            log::warn!("Unsupported transfer mode \"{}\"", self.mode);
            self.transfer.fail(ErrorCode::Illegal, ErrorCode::Illegal.default_message());
            return self.transfer.finish().await;
        };
        match self.direction {
            Direction::Download => self.serve_download(mode, shutdown).await,
            Direction::Upload => self.serve_upload(mode, shutdown).await,
        }
    }

    async fn serve_download(&mut self, mode: FileMode, shutdown: &Shutdown) -> Result<(), TransferError> {
        let block_size = self.transfer.options().block_size();
        let mut processor = match PacketProcessor::new_for_reading(&self.file, mode, block_size).await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Unable to open {} for reading: {e}", self.file.display());
                let code = match ErrorCode::from(e.kind()) {
                    ErrorCode::Undefined => ErrorCode::FileNotFound,
                    code => code,
                };
                self.transfer.fail(code, code.default_message());
                return self.transfer.finish().await;
            }
        };

        let first = if self.transfer.options().is_any_accepted() {
            let mut negotiated = self.transfer.options().clone();
            // The client's tsize is only a placeholder on a read; the real size always replaces it.
            if self.tsize_requested {
                match tokio::fs::metadata(&self.file).await {
                    Ok(meta) => negotiated.set_accepted(TSIZE, meta.len()),
                    Err(e) => {
                        log::warn!("Unable to stat {}: {e}", self.file.display());
                        self.transfer.fail(ErrorCode::FileNotFound, ErrorCode::FileNotFound.default_message());
                        return self.transfer.finish().await;
                    }
                }
            }
            let oack = Packet::OptionAck { options: negotiated.accepted() };
            self.transfer.set_options(negotiated);
            ResultAction::SendPacketAndAwait(oack)
        } else {
            processor.first_packet().await
        };

        self.transfer.set_state(State::DataTransfer);
        self.transfer.run(&mut processor, first, shutdown).await
    }

    async fn serve_upload(&mut self, mode: FileMode, shutdown: &Shutdown) -> Result<(), TransferError> {
        if !self.allow_writes {
            log::warn!("Refusing upload of {}: server is read-only", self.file.display());
            self.transfer.fail(ErrorCode::AccessViolation, ErrorCode::AccessViolation.default_message());
            return self.transfer.finish().await;
        }
        if tokio::fs::try_exists(&self.file).await.unwrap_or(false) {
            self.transfer.fail(ErrorCode::FileAlreadyExists, ErrorCode::FileAlreadyExists.default_message());
            return self.transfer.finish().await;
        }

        let block_size = self.transfer.options().block_size();
        let mut processor = match PacketProcessor::new_for_writing(&self.file, mode, block_size).await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.transfer.fail(ErrorCode::FileAlreadyExists, ErrorCode::FileAlreadyExists.default_message());
                return self.transfer.finish().await;
            }
            Err(e) => {
                log::warn!("Unable to create {}: {e}", self.file.display());
                self.transfer.fail(ErrorCode::AccessViolation, ErrorCode::AccessViolation.default_message());
                return self.transfer.finish().await;
            }
        };
        self.created_file = true;

        let first = if self.transfer.options().is_any_accepted() {
            ResultAction::SendPacketAndAwait(Packet::OptionAck { options: self.transfer.options().accepted() })
        } else {
            processor.first_packet().await
        };

        self.transfer.set_state(State::DataTransfer);
        self.transfer.run(&mut processor, first, shutdown).await
    }

    async fn cleanup(&mut self) {
        log::info!(
            "Aborting transfer of \"{}\" with {}",
            self.transfer.path(),
            self.transfer.session().peer_addr()
        );
        self.transfer.abort(ErrorCode::Undefined, "Server shutting down").await;
        self.remove_partial_upload().await;
    }

    async fn remove_partial_upload(&mut self) {
        if !self.created_file {
            return;
        }
        self.created_file = false;
        if let Err(e) = tokio::fs::remove_file(&self.file).await {
            log::warn!("Unable to remove partial upload {}: {e}", self.file.display());
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    Forbidden(String),
    Socket(SocketError),
}

impl ServerConnectionError {
    /// The ERROR the listener answers a rejected request with.
    pub fn wire_error(&self) -> (ErrorCode, &'static str) {
        let code = match self {
            Self::BadRequest(_) => ErrorCode::Illegal,
            Self::Forbidden(_) => ErrorCode::AccessViolation,
            Self::Socket(_) => ErrorCode::Undefined,
        };
        (code, code.default_message())
    }
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Forbidden(msg) => write!(f, "Forbidden request: {}", msg),
            Self::Socket(e) => write!(f, "Unable to set up transfer socket: {}", e),
        }
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
