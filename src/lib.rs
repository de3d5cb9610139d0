// A TFTP implementation (RFC 1350) with option negotiation (RFC 2347, 2348, 2349).
//
// Transfer begins with a request to read (RRQ) or write (WRQ) a file. The server answers from a
// port of its own, and from then on the two ports form the transfer ID: a packet arriving from
// anywhere else is not part of the transfer.
//
// The file moves in blocks of 512 bytes unless a different block size was negotiated. Each DATA
// packet carries one block and must be acknowledged before the next one is sent; a block shorter
// than the block size ends the transfer. The sender keeps its last packet around, and on timeout it
// is sent again.
//
// Most errors end the transfer. An error is signalled with an ERROR packet, which is neither
// acknowledged nor retransmitted.
//
// A request may carry options. A server that accepts any of them answers with an OACK instead of
// the first DATA (read) or ACK 0 (write); the client acknowledges an OACK on a read with ACK 0.

pub mod client;
pub mod netascii;
pub mod options;
pub mod processor;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod srv_conn;
pub mod tftp;
pub mod transfer;
