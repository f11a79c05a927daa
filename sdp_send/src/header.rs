use std::fmt::Debug;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderFlags: u8 {
        /// the message carries the last out-of-band byte in the stream
        const OOB_PRES = 0b0000_0001;
        /// an out-of-band byte is on its way, the receiver should signal urgency
        const OOB_PEND = 0b0000_0010;
        /// the sender asks the peer to switch to pipelined mode
        const REQ_PIPE = 0b0000_0100;
    }
}

/// Message ids of the base header. Values are fixed by the wire protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Disconnect = 0x02,
    Abort = 0x03,
    SendSm = 0x04,
    RdmaWriteComplete = 0x05,
    RdmaReadComplete = 0x06,
    ModeChange = 0x07,
    SourceCancel = 0x08,
    SinkCancel = 0x09,
    SinkCancelAck = 0x0A,
    ResizeBufferAck = 0x0C,
    SinkAvailable = 0xFD,
    Data = 0xFF,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<MessageId> {
        let result = match value {
            0x02 => MessageId::Disconnect,
            0x03 => MessageId::Abort,
            0x04 => MessageId::SendSm,
            0x05 => MessageId::RdmaWriteComplete,
            0x06 => MessageId::RdmaReadComplete,
            0x07 => MessageId::ModeChange,
            0x08 => MessageId::SourceCancel,
            0x09 => MessageId::SinkCancel,
            0x0A => MessageId::SinkCancelAck,
            0x0C => MessageId::ResizeBufferAck,
            0xFD => MessageId::SinkAvailable,
            0xFF => MessageId::Data,
            _ => bail!("unknown message id {:#04x}", value),
        };
        Ok(result)
    }
}

/// The base header ('BSDH') that precedes every message on the wire:
///
/// ```ascii
///  0: message id (u8)
///  1: flags (u8)
///  2: receive buffers posted by the sender (u16)
///  4: total message length including this header (u32)
///  8: sequence number (u32)
/// 12: last sequence number received from the peer (u32)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bsdh {
    pub mid: MessageId,
    pub flags: HeaderFlags,
    pub recv_bufs: u16,
    pub size: u32,
    pub seq_num: u32,
    pub seq_ack: u32,
}

impl Bsdh {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.mid as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.recv_bufs);
        buf.put_u32(self.size);
        buf.put_u32(self.seq_num);
        buf.put_u32(self.seq_ack);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Bsdh> {
        let mid = MessageId::try_from(buf.try_get_u8()?)?;
        let raw_flags = buf.try_get_u8()?;
        let Some(flags) = HeaderFlags::from_bits(raw_flags) else {
            bail!("invalid header flags {:#04x}", raw_flags);
        };
        let recv_bufs = buf.try_get_u16()?;
        let size = buf.try_get_u32()?;
        let seq_num = buf.try_get_u32()?;
        let seq_ack = buf.try_get_u32()?;

        Ok(Bsdh {
            mid,
            flags,
            recv_bufs,
            size,
            seq_num,
            seq_ack,
        })
    }
}
