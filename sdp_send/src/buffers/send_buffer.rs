//! Transmit buffers. A buffer is a fixed-length, pre-registered memory region that is handed
//!  out by the buffer pool and moves between the connection's queues until the transport
//!  reports its completion.
//!
//! Layout of a buffer, with `send_size` being the negotiated maximum message size:
//!
//! ```ascii
//! 0                    end - send_size            data                 tail            end
//! |  unused (peer has a |  base header (BSDH)     |  payload / control  |  free space    |
//! |  smaller buffer)    |  written at post time   |  extension          |                |
//! ```
//!
//! The payload window is positioned at the end of the buffer so that a peer with a smaller
//!  receive buffer never receives more than it can hold. The header prefix is reserved when
//!  the window is positioned and rewritten on every post attempt, so a buffer that is refused
//!  and retried later carries up to date credit and sequence information.

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;
use crate::control_messages::ControlKind;
use crate::header::{Bsdh, HeaderFlags, MessageId};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::transport::{Segment, WorkRequestId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferFlags {
    /// the buffer was refused at least once and sits in a retry queue
    pub queued: bool,
    /// the last byte of this buffer's payload is an out-of-band byte
    pub oob_present: bool,
    pub solicit: bool,
    pub unsignaled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Data,
    Control(ControlKind),
}

pub struct SendBuffer {
    buf: Vec<u8>,
    data: usize,
    tail: usize,
    base_addr: u64,
    lkey: u32,
    pub flags: BufferFlags,
    kind: BufferKind,
    header_flags: HeaderFlags,
    wr_id: Option<WorkRequestId>,
}

impl SendBuffer {
    pub const PAGE_SIZE: usize = 4096;
    pub const HEADER_LEN: usize = Bsdh::SERIALIZED_LEN;

    /// Create a buffer backed by a registered region starting at `base_addr`
    pub fn new(capacity: usize, base_addr: u64, lkey: u32) -> SendBuffer {
        assert!(capacity > Self::HEADER_LEN, "buffer capacity must exceed the header length");

        SendBuffer {
            buf: vec![0; capacity],
            data: Self::HEADER_LEN,
            tail: Self::HEADER_LEN,
            base_addr,
            lkey,
            flags: BufferFlags::default(),
            kind: BufferKind::Data,
            header_flags: HeaderFlags::empty(),
            wr_id: None,
        }
    }

    /// Positions the payload window so that header and payload together span at most
    ///  `send_size` bytes at the end of the buffer. Discards any payload.
    pub fn reserve_window(&mut self, send_size: usize) {
        let start = self.capacity().saturating_sub(send_size);
        self.data = (start + Self::HEADER_LEN).min(self.capacity());
        self.tail = self.data;
    }

    pub(crate) fn reset(&mut self) {
        self.data = Self::HEADER_LEN;
        self.tail = Self::HEADER_LEN;
        self.flags = BufferFlags::default();
        self.kind = BufferKind::Data;
        self.header_flags = HeaderFlags::empty();
        self.wr_id = None;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn data_size(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_full(&self) -> bool {
        self.tail == self.capacity()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    /// header and payload as they go on the wire
    pub fn wire_bytes(&self) -> &[u8] {
        &self.buf[self.wire_start()..self.tail]
    }

    pub fn wire_len(&self) -> usize {
        self.tail - self.wire_start()
    }

    fn wire_start(&self) -> usize {
        self.data - Self::HEADER_LEN
    }

    /// shrink the payload back to `data_size` bytes, undoing a partial write
    pub fn truncate(&mut self, data_size: usize) {
        assert!(data_size <= self.data_size());
        self.tail = self.data + data_size;
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn is_data(&self) -> bool {
        self.kind == BufferKind::Data
    }

    pub(crate) fn set_kind(&mut self, kind: BufferKind, header_flags: HeaderFlags) {
        self.kind = kind;
        self.header_flags = header_flags;
    }

    pub fn message_id(&self) -> MessageId {
        match self.kind {
            BufferKind::Data => MessageId::Data,
            BufferKind::Control(kind) => kind.message_id(),
        }
    }

    /// header flags that are intrinsic to the message, as opposed to the OOB flags that are
    ///  decided at post time
    pub fn header_flags(&self) -> HeaderFlags {
        self.header_flags
    }

    pub fn wr_id(&self) -> Option<WorkRequestId> {
        self.wr_id
    }

    pub(crate) fn set_wr_id(&mut self, wr_id: Option<WorkRequestId>) {
        self.wr_id = wr_id;
    }

    pub(crate) fn write_header(&mut self, header: &Bsdh) {
        let start = self.wire_start();
        let mut slot: &mut [u8] = &mut self.buf[start..self.data];
        header.ser(&mut slot);
    }

    /// single segment covering header and payload, for payloads copied into the work request
    pub fn inline_segment(&self) -> Segment {
        Segment {
            addr: self.base_addr + self.wire_start().safe_cast(),
            len: self.wire_len().prechecked_cast(),
            lkey: self.lkey,
        }
    }

    /// Header and payload split at page boundaries of the registered region. The part of the
    ///  buffer in front of the header is skipped.
    pub fn segments(&self) -> Vec<Segment> {
        let mut result = Vec::new();
        let mut offs = self.wire_start();
        while offs < self.tail {
            let page_end = (offs / Self::PAGE_SIZE + 1) * Self::PAGE_SIZE;
            let end = page_end.min(self.tail);
            result.push(Segment {
                addr: self.base_addr + offs.safe_cast(),
                len: (end - offs).prechecked_cast(),
                lkey: self.lkey,
            });
            offs = end;
        }
        result
    }

    /// payload only, as the source of an RDMA write
    pub fn payload_segment(&self) -> Segment {
        Segment {
            addr: self.base_addr + self.data.safe_cast(),
            len: self.data_size().prechecked_cast(),
            lkey: self.lkey,
        }
    }
}

impl Debug for SendBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBuffer")
            .field("kind", &self.kind)
            .field("data_size", &self.data_size())
            .field("flags", &self.flags)
            .field("wr_id", &self.wr_id)
            .finish()
    }
}

unsafe impl bytes::BufMut for SendBuffer {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.tail
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.tail + cnt <= self.capacity());
        self.tail += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.tail..])
    }
}
