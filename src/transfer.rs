// Per-transfer state shared by the client and the server connection.
//
// A TransferSession owns the Session of one transfer together with the protocol state, the last
// packet sent (so it can be retransmitted) and whatever has to go out as the very last packet: the
// final ACK of a completed download or the ERROR describing why the transfer stopped.

use crate::options::OptionSet;
use crate::processor::{PacketProcessor, ResultAction};
use crate::session::Session;
use crate::shutdown::Shutdown;
use crate::tftp::{ErrorCode, Packet, SocketError};
use std::error;
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    SentRrq,
    SentWrq,
    ReceivedRrq,
    ReceivedWrq,
    DataTransfer,
    FinalAck,
    Error,
    Finished,
}

/// Represents how a transfer failed, as seen by the side that ran it.
#[derive(Debug)]
pub enum TransferError {
    /// The peer ended the transfer with an ERROR packet.
    Remote(String),
    /// This side ended the transfer and told the peer with the given error.
    Local { code: ErrorCode, message: String },
    /// Shutdown was requested before the transfer finished.
    Cancelled,
    Io(io::Error),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Remote(msg) => write!(f, "Transfer aborted by peer: {}", msg),
            TransferError::Local { code, message } => {
                write!(f, "Transfer aborted with error {}: {}", code.as_u16(), message)
            }
            TransferError::Cancelled => write!(f, "Transfer cancelled"),
            TransferError::Io(e) => write!(f, "Transfer IO error: {}", e),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::IO(e) => TransferError::Io(e),
            other => {
                let (code, message) = other.wire_error();
                TransferError::Local { code, message: message.to_string() }
            }
        }
    }
}

#[derive(Debug)]
pub struct TransferSession {
    session: Session,
    state: State,
    path: String,
    options: OptionSet,
    last_packet: Option<Packet>,
    final_packet: Option<Packet>,
    pending_error: Option<(ErrorCode, String)>,
}

impl TransferSession {
    pub fn new(session: Session, path: &str, options: OptionSet, state: State) -> TransferSession {
        TransferSession {
            session,
            state,
            path: path.to_string(),
            options,
            last_packet: None,
            final_packet: None,
            pending_error: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Replaces the negotiated options and applies their timeout to the session.
    pub fn set_options(&mut self, options: OptionSet) {
        self.session.set_timeout(options.timeout());
        self.options = options;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Records the error that ends this transfer. It is sent by [`TransferSession::finish`].
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.pending_error = Some((code, message.into()));
        self.state = State::Error;
    }

    /// One round of the retry coordinator. `packet` becomes the new last packet and is sent; with
    /// `None` the last packet is kept and nothing is sent, the session only listens.
    ///
    /// On failure the matching ERROR is recorded and `None` is returned.
    pub async fn exchange(&mut self, packet: Option<Packet>) -> Option<Packet> {
        let should_send = packet.is_some();
        if packet.is_some() {
            self.last_packet = packet;
        }
        let result = match &self.last_packet {
            Some(last) => self.session.send_and_receive(last, should_send).await,
            None => self.session.receive().await,
        };
        match result {
            Ok(reply) => Some(reply),
            Err(e) => {
                let (code, message) = e.wire_error();
                self.fail(code, message);
                None
            }
        }
    }

    /// Drives the block exchange until the processor says the transfer is over, starting from
    /// `action`, then sends the closing packet.
    ///
    /// `shutdown` is checked once per exchange. A cancelled transfer sends nothing more.
    pub async fn run(
        &mut self,
        processor: &mut PacketProcessor,
        mut action: ResultAction,
        shutdown: &Shutdown,
    ) -> Result<(), TransferError> {
        loop {
            if shutdown.is_triggered() {
                log::info!("Transfer of \"{}\" with {} cancelled", self.path, self.session.peer_addr());
                self.state = State::Error;
                return Err(TransferError::Cancelled);
            }

            let next = match action {
                ResultAction::SendPacketAndAwait(packet) => Some(packet),
                ResultAction::RetryRecv => None,
                ResultAction::CloseConnection(None) => {
                    self.state = State::Finished;
                    return Ok(());
                }
                ResultAction::CloseConnection(Some(reason)) => {
                    log::warn!("{}", reason);
                    self.state = State::Error;
                    return Err(TransferError::Remote(reason));
                }
                ResultAction::TerminateWithPacket(packet) => {
                    match packet {
                        Packet::Error { code, message } => self.fail(code, message),
                        packet => {
                            self.final_packet = Some(packet);
                            self.state = State::FinalAck;
                        }
                    }
                    break;
                }
            };

            let Some(reply) = self.exchange(next).await else {
                break;
            };
            action = processor.process_packet(&reply).await;
        }
        self.finish().await
    }

    /// Sends the packet that closes the transfer, once, without waiting for an answer.
    pub async fn finish(&mut self) -> Result<(), TransferError> {
        if let Some((code, message)) = self.pending_error.take() {
            self.state = State::Error;
            self.send_best_effort(&Packet::Error { code, message: message.clone() }).await;
            return Err(TransferError::Local { code, message });
        }
        if let Some(packet) = self.final_packet.take() {
            self.send_best_effort(&packet).await;
        }
        self.state = State::Finished;
        Ok(())
    }

    /// Sends an ERROR outside of the normal flow, e.g. when the transfer is being torn down.
    pub async fn abort(&mut self, code: ErrorCode, message: &str) {
        self.state = State::Error;
        self.send_best_effort(&Packet::Error { code, message: message.to_string() }).await;
    }

    async fn send_best_effort(&self, packet: &Packet) {
        if let Err(e) = self.session.send(packet).await {
            log::warn!("Unable to send packet to {}: {e}", self.session.peer_addr());
        }
    }
}
