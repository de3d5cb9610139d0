use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::options::OptionSet;

/// Size of the buffer used to receive a single datagram. Large enough for a DATA packet carrying
/// the biggest block size that can be negotiated.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout,
    InvalidPeer(SocketAddr),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout => write!(f, "Socket IO timeout"),
            SocketError::InvalidPeer(src) => write!(f, "Packet received from unexpected peer {}", src),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SocketError::Timeout,
            _ => SocketError::IO(e),
        }
    }
}

impl From<Elapsed> for SocketError {
    fn from(_: Elapsed) -> Self {
        SocketError::Timeout
    }
}

impl SocketError {
    /// The error a peer should be told about when an exchange fails with this error.
    pub fn wire_error(&self) -> (ErrorCode, &'static str) {
        match self {
            SocketError::Timeout => (ErrorCode::Undefined, "Timeout"),
            SocketError::IO(_) => (ErrorCode::Undefined, "Undefined error"),
            SocketError::InvalidPeer(_) => (ErrorCode::UnknownTid, ErrorCode::UnknownTid.default_message()),
            SocketError::PacketParse(_) => (ErrorCode::Illegal, ErrorCode::Illegal.default_message()),
        }
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet }

impl FileMode {
    /// Mode strings are matched without regard to case.
    pub fn parse(raw: &str) -> Option<FileMode> {
        match raw.to_ascii_lowercase().as_str() {
            "netascii" => Some(FileMode::NetAscii),
            "octet" => Some(FileMode::Octet),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

impl FromStr for FileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileMode::parse(s).ok_or_else(|| format!("Unknown file mode: '{s}'"))
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// Option negotiation refused (RFC 2347).
    OptionNegotiation,
    /// Any code outside of the ones defined by the RFCs, kept as it appeared on the wire.
    Other(u16),
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> ErrorCode {
        match code {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            other => ErrorCode::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined | ErrorCode::Other(_) => "Undefined error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::Illegal => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiation => "Option negotiation failed",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::FileTooLarge => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The transfer mode exactly as the client spelled it.
        mode: String,

        /// Options the client would like to negotiate.
        options: OptionSet,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: String,
        options: OptionSet,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment, sent by a server in place of its first DATA or ACK.
    OptionAck {
        options: OptionSet,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error, Oack }

impl OpCode {
    fn from_u16(raw: u16) -> TftpResult<OpCode> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            6 => Ok(OpCode::Oack),
            _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {raw}"))),
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::Oack => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
            OpCode::Oack => "OACK",
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads a NUL-terminated string starting at `start`.
///
/// Returns the string and the index just past its terminating NUL byte. A string that runs off the
/// end of the buffer without a terminator is a parse error.
pub(crate) fn read_string(buf: &[u8], start: usize, what: &str) -> TftpResult<(String, usize)> {
    let rest = buf
        .get(start..)
        .ok_or_else(|| SocketError::PacketParse(format!("Packet ends before {what}")))?;
    let end = rest
        .iter()
        .position(|&b| b == 0x00)
        .ok_or_else(|| SocketError::PacketParse(format!("{what} must be terminated with a null byte!")))?;
    // Filenames are arbitrary bytes on the wire; anything that is not UTF-8 is kept lossily.
    let s = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok((s, start + end + 1))
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, String, OptionSet)> {
    let (path, path_end) = read_string(buf, 2, "File path")?;
    let (mode, mode_end) = read_string(buf, path_end, "Mode")?;
    let options = OptionSet::parse(buf, mode_end)?;
    Ok((path, mode, options))
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(SocketError::PacketParse("Data packet is missing its block number".to_string()));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return Err(SocketError::PacketParse(format!("Ack packet must be 4 bytes long, got {}", buf.len())));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(SocketError::PacketParse("Error packet is missing its error code".to_string()));
    }
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = read_string(buf, 4, "Error message")?;
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Builds an error packet carrying the standard message for `code`.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    pub fn decode(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match OpCode::from_u16(u16_from_buffer(&buf[..2]))? {
            OpCode::Rrq => {
                let (path, mode, options) = parse_request(buf)?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OpCode::Wrq => {
                let (path, mode, options) = parse_request(buf)?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Oack => Ok(Packet::OptionAck { options: OptionSet::parse(buf, 2)? }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&self.opcode().as_u16().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                push_string(&mut out, path);
                push_string(&mut out, mode);
                options.serialize(&mut out);
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => out.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                out.extend_from_slice(&code.as_u16().to_be_bytes());
                push_string(&mut out, message);
            }
            Packet::OptionAck { options } => options.serialize(&mut out),
        }
        out
    }

    /// Renders the packet as a single diagnostic line.
    ///
    /// `peer` is the remote end of the exchange and `local_port` the port of the socket the packet
    /// went through. Only DATA packets mention the local port.
    pub fn format_packet(&self, peer: SocketAddr, local_port: u16) -> String {
        let (ip, port) = (peer.ip(), peer.port());
        let name = self.opcode().name();
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                if options.is_empty() {
                    format!("{name} {ip}:{port} \"{path}\" {mode}")
                } else {
                    format!("{name} {ip}:{port} \"{path}\" {mode} {options}")
                }
            }
            Packet::Data { block, .. } => format!("{name} {ip}:{port}:{local_port} {block}"),
            Packet::Ack { block } => format!("{name} {ip}:{port} {block}"),
            Packet::Error { code, message } => format!("{name} {ip}:{port} {} \"{message}\"", code.as_u16()),
            Packet::OptionAck { options } => format!("{name} {ip}:{port} {options}"),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that speaks in terms of TFTP packets on the way out and hands back
/// raw datagrams on the way in, so callers can check the sender before trusting the contents.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }

    pub async fn recv_raw(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        buf.truncate(total_written);
        Ok((buf, src))
    }

    pub async fn recv_raw_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        timeout(ttl, self.recv_raw()).await?
    }
}
