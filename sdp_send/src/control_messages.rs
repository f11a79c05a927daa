use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::header::{HeaderFlags, MessageId};
use crate::mode::ModeChange;

/// Discriminant of [ControlMessage], used for statistics and for tagging buffers
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Ack,
    SendSm,
    SourceCancel,
    SinkCancel,
    SinkCancelAck,
    Abort,
    Disconnect,
    ResizeBufferAck,
    RdmaReadComplete,
    RdmaWriteComplete,
    SinkAvailable,
    ModeChange,
}

impl ControlKind {
    pub fn message_id(&self) -> MessageId {
        match self {
            // a gratuitous ack is a data message without payload
            ControlKind::Ack => MessageId::Data,
            ControlKind::SendSm => MessageId::SendSm,
            ControlKind::SourceCancel => MessageId::SourceCancel,
            ControlKind::SinkCancel => MessageId::SinkCancel,
            ControlKind::SinkCancelAck => MessageId::SinkCancelAck,
            ControlKind::Abort => MessageId::Abort,
            ControlKind::Disconnect => MessageId::Disconnect,
            ControlKind::ResizeBufferAck => MessageId::ResizeBufferAck,
            ControlKind::RdmaReadComplete => MessageId::RdmaReadComplete,
            ControlKind::RdmaWriteComplete => MessageId::RdmaWriteComplete,
            ControlKind::SinkAvailable => MessageId::SinkAvailable,
            ControlKind::ModeChange => MessageId::ModeChange,
        }
    }
}

/// Control messages consist of the base header, optionally followed by a small extension:
///
/// *RDMA_RD_COMPLETE*, *RDMA_WR_COMPLETE*, *RESIZE_BUFFER_ACK*
/// ```ascii
/// 0: size (u32) - bytes read / written, or the new buffer size
/// ```
///
/// *MODE_CHANGE*
/// ```ascii
/// 0: mode (u8) - bit 3: send side change, bits 0-2: target mode
/// 1: reserved (3 bytes)
/// ```
///
/// *SINK_AVAILABLE*
/// ```ascii
///  0: size (u32) of the advertised buffer
///  4: remote key (u32)
///  8: virtual address (u64)
/// 16: number of non-discarded sends the advertisement follows (u32)
/// ```
///
/// All other control messages are header-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Ack,
    SendSm,
    SourceCancel,
    SinkCancel,
    SinkCancelAck,
    Abort,
    Disconnect,
    ResizeBufferAck(u32),
    RdmaReadComplete(u32),
    RdmaWriteComplete(u32),
    SinkAvailable { size: u32, rkey: u32, addr: u64, non_discard: u32 },
    ModeChange(ModeChange),
}

impl ControlMessage {
    /// the longest extension, so every buffer must have room for header plus this
    pub const MAX_EXTENSION_LEN: usize = 20;

    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Ack => ControlKind::Ack,
            ControlMessage::SendSm => ControlKind::SendSm,
            ControlMessage::SourceCancel => ControlKind::SourceCancel,
            ControlMessage::SinkCancel => ControlKind::SinkCancel,
            ControlMessage::SinkCancelAck => ControlKind::SinkCancelAck,
            ControlMessage::Abort => ControlKind::Abort,
            ControlMessage::Disconnect => ControlKind::Disconnect,
            ControlMessage::ResizeBufferAck(_) => ControlKind::ResizeBufferAck,
            ControlMessage::RdmaReadComplete(_) => ControlKind::RdmaReadComplete,
            ControlMessage::RdmaWriteComplete(_) => ControlKind::RdmaWriteComplete,
            ControlMessage::SinkAvailable { .. } => ControlKind::SinkAvailable,
            ControlMessage::ModeChange(_) => ControlKind::ModeChange,
        }
    }

    /// whether the peer should get a solicited event for this message
    pub fn solicit(&self) -> bool {
        match self {
            ControlMessage::Ack
            | ControlMessage::Disconnect
            | ControlMessage::ResizeBufferAck(_)
            | ControlMessage::SinkAvailable { .. } => false,
            _ => true,
        }
    }

    /// whether the message can go without a local completion notification
    pub fn unsignaled(&self) -> bool {
        matches!(self,
            ControlMessage::Ack
            | ControlMessage::RdmaReadComplete(_)
            | ControlMessage::RdmaWriteComplete(_)
            | ControlMessage::SinkAvailable { .. })
    }

    pub fn header_flags(&self) -> HeaderFlags {
        match self {
            ControlMessage::RdmaReadComplete(_) => HeaderFlags::REQ_PIPE,
            _ => HeaderFlags::empty(),
        }
    }

    pub fn extension_len(&self) -> usize {
        match self {
            ControlMessage::ResizeBufferAck(_)
            | ControlMessage::RdmaReadComplete(_)
            | ControlMessage::RdmaWriteComplete(_)
            | ControlMessage::ModeChange(_) => 4,
            ControlMessage::SinkAvailable { .. } => Self::MAX_EXTENSION_LEN,
            _ => 0,
        }
    }

    pub fn ser_extension(&self, buf: &mut impl BufMut) {
        match self {
            ControlMessage::ResizeBufferAck(size)
            | ControlMessage::RdmaReadComplete(size)
            | ControlMessage::RdmaWriteComplete(size) => {
                buf.put_u32(*size);
            }
            ControlMessage::SinkAvailable { size, rkey, addr, non_discard } => {
                buf.put_u32(*size);
                buf.put_u32(*rkey);
                buf.put_u64(*addr);
                buf.put_u32(*non_discard);
            }
            ControlMessage::ModeChange(change) => {
                buf.put_u8(*change as u8);
                buf.put_bytes(0, 3);
            }
            _ => {}
        }
    }

    /// Parses a control message from its message id and extension. A data message is read as
    ///  a gratuitous ack if it has no payload.
    pub fn deser(mid: MessageId, buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let result = match mid {
            MessageId::Data => {
                if buf.has_remaining() {
                    bail!("data message with payload is not a control message");
                }
                ControlMessage::Ack
            }
            MessageId::SendSm => ControlMessage::SendSm,
            MessageId::SourceCancel => ControlMessage::SourceCancel,
            MessageId::SinkCancel => ControlMessage::SinkCancel,
            MessageId::SinkCancelAck => ControlMessage::SinkCancelAck,
            MessageId::Abort => ControlMessage::Abort,
            MessageId::Disconnect => ControlMessage::Disconnect,
            MessageId::ResizeBufferAck => ControlMessage::ResizeBufferAck(buf.try_get_u32()?),
            MessageId::RdmaReadComplete => ControlMessage::RdmaReadComplete(buf.try_get_u32()?),
            MessageId::RdmaWriteComplete => ControlMessage::RdmaWriteComplete(buf.try_get_u32()?),
            MessageId::SinkAvailable => {
                let size = buf.try_get_u32()?;
                let rkey = buf.try_get_u32()?;
                let addr = buf.try_get_u64()?;
                let non_discard = buf.try_get_u32()?;
                ControlMessage::SinkAvailable { size, rkey, addr, non_discard }
            }
            MessageId::ModeChange => {
                let raw = buf.try_get_u8()?;
                let change = ModeChange::try_from(raw)?;
                let _reserved = buf.try_get_u16()?;
                let _reserved = buf.try_get_u8()?;
                ControlMessage::ModeChange(change)
            }
        };
        Ok(result)
    }
}
