//! Firmware → host shared-buffer messages.
//!
//! Every message starts with an 8-byte header `{type: u32, size: u32}` where
//! `size` covers the header and the payload. Payloads are little-endian and
//! fixed-size per type:
//!
//! | Type | Payload |
//! |------|---------|
//! | `FwEvent` | `timestamp: u64, event_id: u32, arg: u32` |
//! | `FwTracepoint` | `timestamp: u64, level: u32, tracepoint_id: u32` |
//! | `CmdBufTrace` | `timestamp: u64, queue_id: u32, fence: u32` |
//! | `VpuExecTrace` | `start: u64, end: u64, engine: u32, status: u32` |
//! | `FenceTrace` | `timestamp: u64, resource_id: u32, value: u32` |
//! | `EngineAcquireTrace` | `timestamp: u64, engine: u32, ccq: u32` |
//! | `ResourceUnregister` | `resource_id: u32, reserved: u32` |

/// Size of the message header in bytes.
pub const MSG_HEADER_BYTES: usize = 8;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Generic firmware event (profiling).
    FwEvent = 1,
    /// Firmware tracepoint.
    FwTracepoint = 2,
    /// Command buffer started/finished.
    CmdBufTrace = 3,
    /// VPU execution window.
    VpuExecTrace = 4,
    /// Fence signalled.
    FenceTrace = 5,
    /// Engine acquired by a CCQ.
    EngineAcquireTrace = 6,
    /// Firmware released its last reference to a resource.
    ResourceUnregister = 7,
}

impl MessageType {
    /// Decode a type tag.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::FwEvent,
            2 => Self::FwTracepoint,
            3 => Self::CmdBufTrace,
            4 => Self::VpuExecTrace,
            5 => Self::FenceTrace,
            6 => Self::EngineAcquireTrace,
            7 => Self::ResourceUnregister,
            _ => return None,
        })
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn payload_bytes(self) -> usize {
        match self {
            Self::ResourceUnregister => 8,
            Self::VpuExecTrace => 24,
            Self::FwEvent
            | Self::FwTracepoint
            | Self::CmdBufTrace
            | Self::FenceTrace
            | Self::EngineAcquireTrace => 16,
        }
    }
}

/// A decoded shared-buffer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Field names mirror the payload table above
pub enum FirmwareMessage {
    FwEvent { timestamp: u64, event_id: u32, arg: u32 },
    FwTracepoint { timestamp: u64, level: u32, tracepoint_id: u32 },
    CmdBufTrace { timestamp: u64, queue_id: u32, fence: u32 },
    VpuExecTrace { start: u64, end: u64, engine: u32, status: u32 },
    FenceTrace { timestamp: u64, resource_id: u32, value: u32 },
    EngineAcquireTrace { timestamp: u64, engine: u32, ccq: u32 },
    ResourceUnregister { resource_id: u32 },
}

/// Errors decoding a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Unknown type tag.
    UnknownType(u32),
    /// Payload length disagrees with the type.
    BadSize {
        /// Message type.
        ty: MessageType,
        /// Payload bytes available.
        got: usize,
    },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType(raw) => write!(f, "unknown message type {raw}"),
            Self::BadSize { ty, got } => write!(f, "{ty:?} payload is {got} bytes"),
        }
    }
}

impl std::error::Error for MessageError {}

impl FirmwareMessage {
    /// Type tag of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::FwEvent { .. } => MessageType::FwEvent,
            Self::FwTracepoint { .. } => MessageType::FwTracepoint,
            Self::CmdBufTrace { .. } => MessageType::CmdBufTrace,
            Self::VpuExecTrace { .. } => MessageType::VpuExecTrace,
            Self::FenceTrace { .. } => MessageType::FenceTrace,
            Self::EngineAcquireTrace { .. } => MessageType::EngineAcquireTrace,
            Self::ResourceUnregister { .. } => MessageType::ResourceUnregister,
        }
    }

    /// Total encoded size (header + payload).
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        MSG_HEADER_BYTES + self.message_type().payload_bytes()
    }

    /// Decode a payload of type `raw_type`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for unknown types or a payload of the wrong size.
    pub fn decode(raw_type: u32, payload: &[u8]) -> Result<Self, MessageError> {
        let ty = MessageType::from_raw(raw_type).ok_or(MessageError::UnknownType(raw_type))?;
        if payload.len() != ty.payload_bytes() {
            return Err(MessageError::BadSize { ty, got: payload.len() });
        }
        let p = payload;
        Ok(match ty {
            MessageType::FwEvent => Self::FwEvent {
                timestamp: le64(p, 0),
                event_id: le32(p, 8),
                arg: le32(p, 12),
            },
            MessageType::FwTracepoint => Self::FwTracepoint {
                timestamp: le64(p, 0),
                level: le32(p, 8),
                tracepoint_id: le32(p, 12),
            },
            MessageType::CmdBufTrace => Self::CmdBufTrace {
                timestamp: le64(p, 0),
                queue_id: le32(p, 8),
                fence: le32(p, 12),
            },
            MessageType::VpuExecTrace => Self::VpuExecTrace {
                start: le64(p, 0),
                end: le64(p, 8),
                engine: le32(p, 16),
                status: le32(p, 20),
            },
            MessageType::FenceTrace => Self::FenceTrace {
                timestamp: le64(p, 0),
                resource_id: le32(p, 8),
                value: le32(p, 12),
            },
            MessageType::EngineAcquireTrace => Self::EngineAcquireTrace {
                timestamp: le64(p, 0),
                engine: le32(p, 8),
                ccq: le32(p, 12),
            },
            MessageType::ResourceUnregister => Self::ResourceUnregister { resource_id: le32(p, 0) },
        })
    }

    /// Encode header + payload.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // messages are at most 32 bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.message_type() as u32).to_le_bytes());
        out.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        let (a, b, c) = match *self {
            Self::FwEvent { timestamp, event_id, arg } => (timestamp, event_id, arg),
            Self::FwTracepoint { timestamp, level, tracepoint_id } => {
                (timestamp, level, tracepoint_id)
            }
            Self::CmdBufTrace { timestamp, queue_id, fence } => (timestamp, queue_id, fence),
            Self::FenceTrace { timestamp, resource_id, value } => (timestamp, resource_id, value),
            Self::EngineAcquireTrace { timestamp, engine, ccq } => (timestamp, engine, ccq),
            Self::VpuExecTrace { start, end, engine, status } => {
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
                out.extend_from_slice(&engine.to_le_bytes());
                out.extend_from_slice(&status.to_le_bytes());
                return out;
            }
            Self::ResourceUnregister { resource_id } => {
                out.extend_from_slice(&resource_id.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                return out;
            }
        };
        out.extend_from_slice(&a.to_le_bytes());
        out.extend_from_slice(&b.to_le_bytes());
        out.extend_from_slice(&c.to_le_bytes());
        out
    }
}

fn le32(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

fn le64(p: &[u8], at: usize) -> u64 {
    u64::from(le32(p, at)) | (u64::from(le32(p, at + 4)) << 32)
}
