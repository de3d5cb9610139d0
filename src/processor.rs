// Block gating shared by both peers.
//
// Whichever side is reading the file runs a BlockSender: it emits DATA and waits for the matching
// ACK. Whichever side is writing the file runs a BlockReceiver: it waits for DATA and answers with
// ACK. The client and the server connection only differ in how they get the first packet going;
// once blocks flow they hand every incoming packet to the processor and act on its ResultAction.

use crate::netascii::{ModeReader, ModeWriter};
use crate::tftp::{self, ErrorCode, FileMode};
use std::path::Path;
use tokio::fs::File;
use tokio::io;

/// Where a received block number sits relative to the one we are waiting for. Block numbers live
/// on a 16-bit circle, so "behind" and "ahead" are decided by the signed distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrder {
    Expected,
    Duplicate,
    Ahead,
}

pub fn block_order(received: u16, expected: u16) -> BlockOrder {
    match received.wrapping_sub(expected) as i16 {
        0 => BlockOrder::Expected,
        d if d < 0 => BlockOrder::Duplicate,
        _ => BlockOrder::Ahead,
    }
}

#[derive(Debug)]
pub enum PacketProcessor {
    Sender(BlockSender),
    Receiver(BlockReceiver),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    /// Serves the file at `path` as DATA blocks.
    pub async fn new_for_reading(path: &Path, mode: FileMode, block_size: usize) -> Result<PacketProcessor, io::Error> {
        let f = File::open(path).await?;
        Ok(PacketProcessor::sending(ModeReader::new(f, mode), block_size))
    }

    /// Stores incoming DATA blocks in a new file at `path`. Fails if the file already exists.
    pub async fn new_for_writing(path: &Path, mode: FileMode, block_size: usize) -> Result<PacketProcessor, io::Error> {
        log::info!("Writing to {}", path.display());
        let f = File::create_new(path).await?;
        Ok(PacketProcessor::receiving(ModeWriter::new(f, mode), block_size))
    }

    pub fn sending(reader: ModeReader, block_size: usize) -> PacketProcessor {
        PacketProcessor::Sender(BlockSender::new(reader, block_size))
    }

    pub fn receiving(writer: ModeWriter, block_size: usize) -> PacketProcessor {
        PacketProcessor::Receiver(BlockReceiver::new(writer, block_size))
    }

    /// Adopts a block size negotiated after the processor was built. Only meaningful before the
    /// first block moves.
    pub fn set_block_size(&mut self, block_size: usize) {
        match self {
            PacketProcessor::Sender(p) => p.block_size = block_size,
            PacketProcessor::Receiver(p) => p.block_size = block_size,
        }
    }

    /// The action that opens the block exchange once any option negotiation is out of the way:
    /// DATA block 1 for a sender, ACK 0 for a receiver.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Sender(p) => p.process_ack(&tftp::Packet::Ack { block: 0 }).await,
            PacketProcessor::Receiver(_) => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Sender(p) => p.process_ack(packet).await,
            PacketProcessor::Receiver(p) => p.process_data(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should close the connection without sending a message. A reason is present when the
    /// peer ended the transfer with an error.
    CloseConnection(Option<String>),

    /// Caller should keep listening without sending anything.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

fn peer_error(code: ErrorCode, message: &str) -> ResultAction {
    ResultAction::CloseConnection(Some(format!(
        "Peer sent error packet: code: {}, message: '{}'",
        code.as_u16(),
        message
    )))
}

fn illegal(detail: String) -> ResultAction {
    log::warn!("{detail}");
    ResultAction::TerminateWithPacket(tftp::Packet::error(ErrorCode::Illegal))
}

#[derive(Debug)]
pub struct BlockSender {
    reader: ModeReader,
    /// Number of the last DATA block handed out, 0 before the first one.
    curr_block: u16,
    block_size: usize,
    awaiting_final_ack: bool,
}

impl BlockSender {
    fn new(reader: ModeReader, block_size: usize) -> BlockSender {
        BlockSender {
            reader,
            curr_block: 0,
            block_size,
            awaiting_final_ack: false,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } => match block_order(block, self.curr_block) {
                BlockOrder::Expected => {
                    if self.awaiting_final_ack {
                        return ResultAction::CloseConnection(None);
                    }
                    match self.reader.read_block(self.block_size).await {
                        Ok(data) => {
                            self.curr_block = self.curr_block.wrapping_add(1);
                            if data.len() < self.block_size {
                                self.awaiting_final_ack = true;
                            }
                            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data })
                        }
                        Err(e) => {
                            log::error!("Failed to read block {}: {e}", self.curr_block.wrapping_add(1));
                            ResultAction::TerminateWithPacket(tftp::Packet::error(e.kind().into()))
                        }
                    }
                }
                // Acks for blocks that were already acknowledged are ignored.
                BlockOrder::Duplicate => ResultAction::RetryRecv,
                BlockOrder::Ahead => illegal(format!(
                    "Cannot acknowledge a block which was not yet sent. Current block is {cb}, but received an ack for {block}",
                    cb = self.curr_block
                )),
            },
            tftp::Packet::Error { code, message } => peer_error(*code, message),
            _ => illegal(format!("Expected to receive an Ack packet, but got {} instead", packet.opcode().name())),
        }
    }
}

#[derive(Debug)]
pub struct BlockReceiver {
    writer: ModeWriter,
    /// Number of the last DATA block written, 0 before the first one.
    curr_block: u16,
    block_size: usize,
}

impl BlockReceiver {
    fn new(writer: ModeWriter, block_size: usize) -> BlockReceiver {
        BlockReceiver { writer, curr_block: 0, block_size }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                let expected = self.curr_block.wrapping_add(1);
                match block_order(*block, expected) {
                    BlockOrder::Expected => {
                        if data.len() > self.block_size {
                            return illegal(format!(
                                "Block {block} carries {} bytes, more than the block size of {}",
                                data.len(),
                                self.block_size
                            ));
                        }
                        if let Err(e) = self.writer.write_block(data).await {
                            log::error!("Error writing block {block}: {e}");
                            return ResultAction::TerminateWithPacket(tftp::Packet::error(e.kind().into()));
                        }
                        self.curr_block = expected;
                        let ack = tftp::Packet::Ack { block: self.curr_block };

                        if data.len() < self.block_size {
                            if let Err(e) = self.writer.finish().await {
                                log::error!("Error flushing received data: {e}");
                                return ResultAction::TerminateWithPacket(tftp::Packet::error(e.kind().into()));
                            }
                            ResultAction::TerminateWithPacket(ack)
                        } else {
                            ResultAction::SendPacketAndAwait(ack)
                        }
                    }
                    // A block we already stored: the peer missed our ack, so repeat it.
                    BlockOrder::Duplicate => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: self.curr_block }),
                    BlockOrder::Ahead => illegal(format!(
                        "Data blocks must be received in sequence. Received data for block {block}, \
                        but have only received up to block {cb}.",
                        cb = self.curr_block
                    )),
                }
            }
            tftp::Packet::Error { code, message } => peer_error(*code, message),
            _ => illegal(format!("Expected to receive a Data packet, but got {} instead", packet.opcode().name())),
        }
    }
}
