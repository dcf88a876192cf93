//! Firmware command wire format.
//!
//! Every command is a 4-byte header followed by a fixed-size, opcode-specific
//! payload of little-endian 32/64-bit fields:
//!
//! ```text
//!  byte 0            byte 1         bytes 2..3   bytes 4..
//! ┌───┬───────────┬──────────────┬────────────┬──────────────────┐
//! │ P │ opcode(7) │ length(words)│  reserved  │ payload          │
//! └───┴───────────┴──────────────┴────────────┴──────────────────┘
//! ```
//!
//! `P` is the privileged-command flag. Privileged commands configure the
//! firmware itself (resource tables, queues, profiling) and are only accepted
//! from the device-owned queue. `length` counts 32-bit words including the
//! header, so firmware can skip a command without decoding it.

/// Size of the command header in bytes.
pub const HEADER_BYTES: usize = 4;

/// Command length granularity.
pub const WORD_BYTES: usize = 4;

/// Opcode bits of header byte 0.
pub const OPCODE_MASK: u8 = 0x7F;

/// Privileged-command flag in header byte 0.
pub const PRIVILEGED_FLAG: u8 = 0x80;

/// Bytes every chunk must keep free for its trailing command
/// (`LinkChunk` on non-terminal chunks, `CapturePostFence` on the last one).
pub const CHUNK_TRAILER_BYTES: usize = HEADER_BYTES + 16;

/// Command opcodes understood by the PVA firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Does nothing. Used for padding and liveness probes.
    Noop = 0x00,
    /// Continue parsing in another chunk.
    LinkChunk = 0x01,
    /// Write a fence value once everything before it has completed.
    CapturePostFence = 0x02,
    /// Write the firmware timestamp counter to memory.
    CaptureTimestamp = 0x03,
    /// Acquire exclusive use of an engine (VPU / DMA).
    AcquireEngine = 0x04,
    /// Release a previously acquired engine.
    ReleaseEngine = 0x05,
    /// Select the VPU executable (metadata resource) for subsequent runs.
    SetVpuExecutable = 0x06,
    /// Launch the selected executable at an exported entry point.
    RunVpu = 0x07,
    /// Program a DMA channel from a descriptor resource.
    SetupDma = 0x08,
    /// Trigger a programmed DMA channel.
    RunDma = 0x09,
    /// Bind a resource to a VPU-visible slot.
    BindResource = 0x0A,
    /// Unbind a VPU-visible slot.
    UnbindResource = 0x0B,
    /// Register a resource table with the firmware.
    InitResourceTable = 0x40,
    /// Re-read a resource table after host-side changes.
    UpdateResourceTable = 0x41,
    /// Forget a resource table.
    DeinitResourceTable = 0x42,
    /// Register a submission queue.
    InitQueue = 0x43,
    /// Forget a submission queue.
    DeinitQueue = 0x44,
    /// Start emitting profiling events.
    EnableFwProfiling = 0x45,
    /// Stop emitting profiling events.
    DisableFwProfiling = 0x46,
    /// Set the firmware tracepoint verbosity.
    SetTraceLevel = 0x47,
}

impl Opcode {
    /// Decode a 7-bit opcode.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Noop,
            0x01 => Self::LinkChunk,
            0x02 => Self::CapturePostFence,
            0x03 => Self::CaptureTimestamp,
            0x04 => Self::AcquireEngine,
            0x05 => Self::ReleaseEngine,
            0x06 => Self::SetVpuExecutable,
            0x07 => Self::RunVpu,
            0x08 => Self::SetupDma,
            0x09 => Self::RunDma,
            0x0A => Self::BindResource,
            0x0B => Self::UnbindResource,
            0x40 => Self::InitResourceTable,
            0x41 => Self::UpdateResourceTable,
            0x42 => Self::DeinitResourceTable,
            0x43 => Self::InitQueue,
            0x44 => Self::DeinitQueue,
            0x45 => Self::EnableFwProfiling,
            0x46 => Self::DisableFwProfiling,
            0x47 => Self::SetTraceLevel,
            _ => return None,
        })
    }

    /// Whether the command must carry the privileged flag.
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        (self as u8) >= 0x40
    }

    /// Payload size in bytes (excluding the header).
    #[must_use]
    pub const fn payload_bytes(self) -> usize {
        match self {
            Self::Noop | Self::DisableFwProfiling => 0,
            Self::AcquireEngine
            | Self::ReleaseEngine
            | Self::SetVpuExecutable
            | Self::RunVpu
            | Self::RunDma
            | Self::UnbindResource
            | Self::UpdateResourceTable
            | Self::DeinitResourceTable
            | Self::DeinitQueue
            | Self::EnableFwProfiling
            | Self::SetTraceLevel => 4,
            Self::BindResource => 8,
            Self::LinkChunk
            | Self::CapturePostFence
            | Self::CaptureTimestamp
            | Self::SetupDma
            | Self::InitResourceTable
            | Self::InitQueue => 16,
        }
    }

    /// Total encoded size in bytes (header + payload).
    #[must_use]
    pub const fn encoded_len(self) -> usize {
        HEADER_BYTES + self.payload_bytes()
    }
}

/// Errors decoding a command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the header or declared length.
    Truncated,
    /// Opcode not in [`Opcode`].
    UnknownOpcode(u8),
    /// Header length disagrees with the opcode's fixed size.
    LengthMismatch {
        /// Offending opcode.
        opcode: Opcode,
        /// Declared length in words.
        words: u8,
    },
    /// Privileged flag set on a data-plane opcode or missing on a privileged one.
    PrivilegeMismatch(Opcode),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated command"),
            Self::UnknownOpcode(raw) => write!(f, "unknown opcode {raw:#04x}"),
            Self::LengthMismatch { opcode, words } => {
                write!(f, "{opcode:?} declares {words} words")
            }
            Self::PrivilegeMismatch(opcode) => write!(f, "{opcode:?} has wrong privilege flag"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decoded firmware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // Field names mirror the payload layout
pub enum Command {
    Noop,
    LinkChunk { resource_id: u32, offset: u64, size: u32 },
    CapturePostFence { resource_id: u32, offset: u64, value: u32 },
    CaptureTimestamp { resource_id: u32, offset: u64 },
    AcquireEngine { engine: u32 },
    ReleaseEngine { engine: u32 },
    SetVpuExecutable { resource_id: u32 },
    RunVpu { entry_point: u32 },
    SetupDma { channel: u32, resource_id: u32, offset: u64 },
    RunDma { channel: u32 },
    BindResource { slot: u32, resource_id: u32 },
    UnbindResource { slot: u32 },
    InitResourceTable { table_id: u32, capacity: u32, iova: u64 },
    UpdateResourceTable { table_id: u32 },
    DeinitResourceTable { table_id: u32 },
    InitQueue { queue_id: u32, capacity: u32, iova: u64 },
    DeinitQueue { queue_id: u32 },
    EnableFwProfiling { filter: u32 },
    DisableFwProfiling,
    SetTraceLevel { level: u32 },
}

impl Command {
    /// Opcode of this command.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Noop => Opcode::Noop,
            Self::LinkChunk { .. } => Opcode::LinkChunk,
            Self::CapturePostFence { .. } => Opcode::CapturePostFence,
            Self::CaptureTimestamp { .. } => Opcode::CaptureTimestamp,
            Self::AcquireEngine { .. } => Opcode::AcquireEngine,
            Self::ReleaseEngine { .. } => Opcode::ReleaseEngine,
            Self::SetVpuExecutable { .. } => Opcode::SetVpuExecutable,
            Self::RunVpu { .. } => Opcode::RunVpu,
            Self::SetupDma { .. } => Opcode::SetupDma,
            Self::RunDma { .. } => Opcode::RunDma,
            Self::BindResource { .. } => Opcode::BindResource,
            Self::UnbindResource { .. } => Opcode::UnbindResource,
            Self::InitResourceTable { .. } => Opcode::InitResourceTable,
            Self::UpdateResourceTable { .. } => Opcode::UpdateResourceTable,
            Self::DeinitResourceTable { .. } => Opcode::DeinitResourceTable,
            Self::InitQueue { .. } => Opcode::InitQueue,
            Self::DeinitQueue { .. } => Opcode::DeinitQueue,
            Self::EnableFwProfiling { .. } => Opcode::EnableFwProfiling,
            Self::DisableFwProfiling => Opcode::DisableFwProfiling,
            Self::SetTraceLevel { .. } => Opcode::SetTraceLevel,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        self.opcode().encoded_len()
    }

    /// Append the encoded command to `out`.
    #[allow(clippy::cast_possible_truncation)] // encoded_len is at most 20 bytes
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let opcode = self.opcode();
        let mut byte0 = opcode as u8;
        if opcode.is_privileged() {
            byte0 |= PRIVILEGED_FLAG;
        }
        out.extend_from_slice(&[byte0, (opcode.encoded_len() / WORD_BYTES) as u8, 0, 0]);

        match *self {
            Self::Noop | Self::DisableFwProfiling => {}
            Self::LinkChunk { resource_id, offset, size } => wide(out, resource_id, size, offset),
            Self::CapturePostFence { resource_id, offset, value } => {
                wide(out, resource_id, value, offset);
            }
            Self::CaptureTimestamp { resource_id, offset } => wide(out, resource_id, 0, offset),
            Self::SetupDma { channel, resource_id, offset } => {
                wide(out, channel, resource_id, offset);
            }
            Self::InitResourceTable { table_id, capacity, iova } => {
                wide(out, table_id, capacity, iova);
            }
            Self::InitQueue { queue_id, capacity, iova } => wide(out, queue_id, capacity, iova),
            Self::BindResource { slot, resource_id } => {
                out.extend_from_slice(&slot.to_le_bytes());
                out.extend_from_slice(&resource_id.to_le_bytes());
            }
            Self::AcquireEngine { engine: v }
            | Self::ReleaseEngine { engine: v }
            | Self::SetVpuExecutable { resource_id: v }
            | Self::RunVpu { entry_point: v }
            | Self::RunDma { channel: v }
            | Self::UnbindResource { slot: v }
            | Self::UpdateResourceTable { table_id: v }
            | Self::DeinitResourceTable { table_id: v }
            | Self::DeinitQueue { queue_id: v }
            | Self::EnableFwProfiling { filter: v }
            | Self::SetTraceLevel { level: v } => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode one command from the front of `bytes`, returning it and its length.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the header is malformed or the stream is short.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (opcode, len) = peek(bytes)?;
        let p = &bytes[HEADER_BYTES..len];
        let a = || le32(p, 0);
        let b = || le32(p, 4);
        let c = || le64(p, 8);

        let cmd = match opcode {
            Opcode::Noop => Self::Noop,
            Opcode::DisableFwProfiling => Self::DisableFwProfiling,
            Opcode::LinkChunk => Self::LinkChunk { resource_id: a(), size: b(), offset: c() },
            Opcode::CapturePostFence => Self::CapturePostFence {
                resource_id: a(),
                value: b(),
                offset: c(),
            },
            Opcode::CaptureTimestamp => Self::CaptureTimestamp { resource_id: a(), offset: c() },
            Opcode::SetupDma => Self::SetupDma { channel: a(), resource_id: b(), offset: c() },
            Opcode::InitResourceTable => Self::InitResourceTable {
                table_id: a(),
                capacity: b(),
                iova: c(),
            },
            Opcode::InitQueue => Self::InitQueue { queue_id: a(), capacity: b(), iova: c() },
            Opcode::BindResource => Self::BindResource { slot: a(), resource_id: b() },
            Opcode::AcquireEngine => Self::AcquireEngine { engine: a() },
            Opcode::ReleaseEngine => Self::ReleaseEngine { engine: a() },
            Opcode::SetVpuExecutable => Self::SetVpuExecutable { resource_id: a() },
            Opcode::RunVpu => Self::RunVpu { entry_point: a() },
            Opcode::RunDma => Self::RunDma { channel: a() },
            Opcode::UnbindResource => Self::UnbindResource { slot: a() },
            Opcode::UpdateResourceTable => Self::UpdateResourceTable { table_id: a() },
            Opcode::DeinitResourceTable => Self::DeinitResourceTable { table_id: a() },
            Opcode::DeinitQueue => Self::DeinitQueue { queue_id: a() },
            Opcode::EnableFwProfiling => Self::EnableFwProfiling { filter: a() },
            Opcode::SetTraceLevel => Self::SetTraceLevel { level: a() },
        };
        Ok((cmd, len))
    }
}

/// Validate the header at the front of `bytes` and return the opcode and
/// the command's total length, without decoding the payload.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the header is malformed or `bytes` is
/// shorter than the declared length.
pub fn peek(bytes: &[u8]) -> Result<(Opcode, usize), DecodeError> {
    let header = bytes.get(..HEADER_BYTES).ok_or(DecodeError::Truncated)?;
    let raw = header[0] & OPCODE_MASK;
    let opcode = Opcode::from_raw(raw).ok_or(DecodeError::UnknownOpcode(raw))?;
    if opcode.is_privileged() != (header[0] & PRIVILEGED_FLAG != 0) {
        return Err(DecodeError::PrivilegeMismatch(opcode));
    }
    let words = header[1];
    let len = usize::from(words) * WORD_BYTES;
    if len != opcode.encoded_len() {
        return Err(DecodeError::LengthMismatch { opcode, words });
    }
    if bytes.len() < len {
        return Err(DecodeError::Truncated);
    }
    Ok((opcode, len))
}

/// Iterate over the commands of an encoded stream.
///
/// Stops at the first malformed command, yielding its error.
pub fn iter(bytes: &[u8]) -> impl Iterator<Item = Result<Command, DecodeError>> + '_ {
    let mut rest = bytes;
    let mut failed = false;
    std::iter::from_fn(move || {
        if rest.is_empty() || failed {
            return None;
        }
        match Command::decode(rest) {
            Ok((cmd, len)) => {
                rest = &rest[len..];
                Some(Ok(cmd))
            }
            Err(e) => {
                failed = true;
                Some(Err(e))
            }
        }
    })
}

fn wide(out: &mut Vec<u8>, a: u32, b: u32, c: u64) {
    out.extend_from_slice(&a.to_le_bytes());
    out.extend_from_slice(&b.to_le_bytes());
    out.extend_from_slice(&c.to_le_bytes());
}

fn le32(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

fn le64(p: &[u8], at: usize) -> u64 {
    u64::from(le32(p, at)) | (u64::from(le32(p, at + 4)) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = Command::UpdateResourceTable { table_id: 3 }.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x41 | PRIVILEGED_FLAG);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[4..], &3u32.to_le_bytes());
    }

    #[test]
    fn test_link_chunk_decodes() {
        let cmd = Command::LinkChunk { resource_id: 2, offset: 0x1_0000_0040, size: 256 };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), CHUNK_TRAILER_BYTES);
        assert_eq!(Command::decode(&bytes), Ok((cmd, bytes.len())));
    }

    #[test]
    fn test_privilege_flag_enforced() {
        let mut bytes = Command::SetTraceLevel { level: 1 }.encode();
        bytes[0] &= OPCODE_MASK;
        assert_eq!(
            Command::decode(&bytes),
            Err(DecodeError::PrivilegeMismatch(Opcode::SetTraceLevel))
        );
    }

    #[test]
    fn test_bad_length_rejected() {
        let mut bytes = Command::RunVpu { entry_point: 0 }.encode();
        bytes[1] = 5;
        assert!(matches!(
            peek(&bytes),
            Err(DecodeError::LengthMismatch { opcode: Opcode::RunVpu, words: 5 })
        ));
    }

    #[test]
    fn test_stream_iteration_stops_on_garbage() {
        let mut stream = Command::Noop.encode();
        Command::AcquireEngine { engine: 1 }.encode_into(&mut stream);
        stream.extend_from_slice(&[0x3F, 1, 0, 0]);

        let decoded: Vec<_> = iter(&stream).collect();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[1], Ok(Command::AcquireEngine { engine: 1 }));
        assert_eq!(decoded[2], Err(DecodeError::UnknownOpcode(0x3F)));
    }

    #[test]
    fn test_trailer_fits_both_terminators() {
        assert!(Opcode::LinkChunk.encoded_len() <= CHUNK_TRAILER_BYTES);
        assert!(Opcode::CapturePostFence.encoded_len() <= CHUNK_TRAILER_BYTES);
    }
}
