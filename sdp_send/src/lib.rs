//! The send side of a Sockets Direct Protocol (SDP) style byte stream transport: an ordered
//!  byte stream plus a single out-of-band byte, carried over a reliable, RDMA capable
//!  connection with credit based flow control.
//!
//! ## Design
//!
//! * Each message occupies exactly one of the peer's pre-posted receive buffers. The peer
//!   reports how many it has available ('credits') in every header it sends.
//!   * Data needs at least `min_remote_credits`, control messages need a single one. Control
//!     messages can therefore always get through while data is held back.
//!   * Running out of credits is not an error: buffers are queued and retried whenever credits
//!     or send completions arrive ('flush').
//! * There are two data paths:
//!   * the *buffered* path posts a send into one of the peer's receive buffers
//!   * the *sink* path writes the payload directly into a buffer the peer advertised for that
//!     purpose (RDMA write), reporting the number of bytes written with an
//!     `RDMA_WR_COMPLETE` control message once the advertisement is used up
//! * Ordering is strict: control messages go before queued data, and nothing overtakes a
//!   queued buffer. A buffer that was refused goes back to the head of its queue.
//! * The connection negotiates transfer modes (buffered, combined, pipelined) with the peer.
//!   If data backs up in combined mode, it asks the peer to switch to pipelined mode so that
//!   more data can go through sink advertisements.
//! * An urgent ('out-of-band') byte is announced as soon as possible (`OOB_PEND`), and marked
//!   precisely in the message that carries it (`OOB_PRES`). A newer urgent byte supersedes an
//!   older one that was not sent yet.
//! * Disconnecting is graceful: the disconnect message follows all queued data. A watchdog
//!   aborts the connection if the disconnect makes no progress.
//!
//! The actual transport (posting work requests, registering memory, reporting completions) is
//!  abstracted away by [transport::Transport]; the owner of a connection feeds completions and
//!  peer information back through the `on_*` methods of [connection::Connection].
//!
//! ## Header
//!
//! All messages start with a 16 byte header, all numbers in network byte order (BE):
//! ```ascii
//!  0: message id (u8):
//!     * 0x02 DISCONNECT
//!     * 0x03 ABORT
//!     * 0x04 SEND_SM
//!     * 0x05 RDMA_WR_COMPLETE
//!     * 0x06 RDMA_RD_COMPLETE
//!     * 0x07 MODE_CHANGE
//!     * 0x08 SRC_CANCEL
//!     * 0x09 SNK_CANCEL
//!     * 0x0A SNK_CANCEL_ACK
//!     * 0x0C CHRCVBUF_ACK (buffer resize ack)
//!     * 0xFD SNK_AVAIL
//!     * 0xFF DATA - without payload, this is a gratuitous ack
//!  1: flags (u8):
//!     * bit 0: OOB_PRES - the last byte of this message's payload is the urgent byte
//!     * bit 1: OOB_PEND - an urgent byte is on its way
//!     * bit 2: REQ_PIPE - the sender asks for pipelined mode
//!  2: receive buffers posted by the sender, i.e. credits for the receiver (u16)
//!  4: total message length including the header (u32)
//!  8: sequence number (u32)
//! 12: last sequence number received from the peer (u32)
//! 16: payload or control message extension
//! ```
//!
//! ## Mode changes
//!
//! ```ascii
//! request      effect                          valid only if
//! 0x0 BUFF     send: combined  -> buffered     send mode is combined
//! 0x9 COMB     recv: buffered  -> combined     receive mode is buffered
//! 0x2 PIPE     send: combined  -> pipelined    send mode is combined
//! 0x1 COMB     send: pipelined -> combined     send mode is pipelined
//! ```
//!
//! Any other request moves both modes into the terminal error state.

pub mod advertisement;
pub mod buffers;
pub mod config;
pub mod connection;
mod control;
pub mod control_messages;
pub mod credit;
mod disconnect;
pub mod error;
mod flush;
pub mod header;
pub mod mode;
pub mod safe_converter;
mod send_path;
pub mod send_queue;
mod send_stream;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod test_util;
