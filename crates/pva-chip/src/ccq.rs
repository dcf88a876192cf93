//! CCQ (command/control queue) bootstrap words.
//!
//! Before the submission queue exists the host talks to firmware through a
//! small hardware FIFO that accepts 64-bit words. Messages are one or two
//! words long:
//!
//! ```text
//! word 0:  [63:56] opcode  [55:48] index  [47:32] reserved  [31:0] param
//! word 1:  IOVA (only for messages that carry an address)
//! ```

/// Shift of the opcode byte in word 0.
pub const OPCODE_SHIFT: u32 = 56;

/// Shift of the index byte (queue / interface id) in word 0.
pub const INDEX_SHIFT: u32 = 48;

/// Bootstrap message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CcqOpcode {
    /// Register the device resource table.
    InitResourceTable = 0x01,
    /// Register a submission queue.
    InitQueue = 0x02,
    /// Register a shared event buffer for an interface.
    InitSharedBuffer = 0x03,
    /// Forget a shared event buffer.
    DeinitSharedBuffer = 0x04,
    /// New entries are available in a submission queue.
    Doorbell = 0x05,
}

impl CcqOpcode {
    /// Decode an opcode byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::InitResourceTable,
            0x02 => Self::InitQueue,
            0x03 => Self::InitSharedBuffer,
            0x04 => Self::DeinitSharedBuffer,
            0x05 => Self::Doorbell,
            _ => return None,
        })
    }

    /// Number of 64-bit words in a message with this opcode.
    #[must_use]
    pub const fn words(self) -> usize {
        match self {
            Self::InitResourceTable | Self::InitQueue | Self::InitSharedBuffer => 2,
            Self::DeinitSharedBuffer | Self::Doorbell => 1,
        }
    }
}

/// A CCQ bootstrap message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcqMessage {
    /// Location and capacity of the device resource table.
    InitResourceTable {
        /// Table IOVA.
        iova: u64,
        /// Number of entries.
        capacity: u32,
    },
    /// Location and capacity of a submission queue.
    InitQueue {
        /// Queue id.
        queue_id: u8,
        /// Queue IOVA (header followed by entries).
        iova: u64,
        /// Number of entries.
        capacity: u32,
    },
    /// Location and size of a shared event buffer.
    InitSharedBuffer {
        /// Interface (CCQ) the buffer belongs to.
        interface: u8,
        /// Buffer IOVA (header followed by body).
        iova: u64,
        /// Total bytes including the header.
        size: u32,
    },
    /// Stop writing into a shared event buffer.
    DeinitSharedBuffer {
        /// Interface the buffer belongs to.
        interface: u8,
    },
    /// Queue tail moved.
    Doorbell {
        /// Queue id.
        queue_id: u8,
    },
}

/// Encoded words of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcqWords {
    words: [u64; 2],
    len: usize,
}

impl CcqWords {
    /// Words to push, in order.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.words[..self.len]
    }
}

const fn head(opcode: CcqOpcode, index: u8, param: u32) -> u64 {
    ((opcode as u64) << OPCODE_SHIFT) | ((index as u64) << INDEX_SHIFT) | param as u64
}

impl CcqMessage {
    /// Opcode of this message.
    #[must_use]
    pub const fn opcode(&self) -> CcqOpcode {
        match self {
            Self::InitResourceTable { .. } => CcqOpcode::InitResourceTable,
            Self::InitQueue { .. } => CcqOpcode::InitQueue,
            Self::InitSharedBuffer { .. } => CcqOpcode::InitSharedBuffer,
            Self::DeinitSharedBuffer { .. } => CcqOpcode::DeinitSharedBuffer,
            Self::Doorbell { .. } => CcqOpcode::Doorbell,
        }
    }

    /// Encode into FIFO words.
    #[must_use]
    pub const fn encode(&self) -> CcqWords {
        let opcode = self.opcode();
        let words = match *self {
            Self::InitResourceTable { iova, capacity } => [head(opcode, 0, capacity), iova],
            Self::InitQueue { queue_id, iova, capacity } => [head(opcode, queue_id, capacity), iova],
            Self::InitSharedBuffer { interface, iova, size } => [head(opcode, interface, size), iova],
            Self::DeinitSharedBuffer { interface } => [head(opcode, interface, 0), 0],
            Self::Doorbell { queue_id } => [head(opcode, queue_id, 0), 0],
        };
        CcqWords { words, len: opcode.words() }
    }
}

/// Reassembles messages from a stream of FIFO words (firmware side).
#[derive(Debug, Default, Clone)]
pub struct CcqDecoder {
    pending: Option<u64>,
}

/// Word-stream decode errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcqError {
    /// Unknown opcode byte in a leading word.
    UnknownOpcode(u8),
}

impl std::fmt::Display for CcqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpcode(raw) => write!(f, "unknown CCQ opcode {raw:#04x}"),
        }
    }
}

impl std::error::Error for CcqError {}

impl CcqDecoder {
    /// Feed one word; returns a message once it is complete.
    ///
    /// # Errors
    ///
    /// Returns [`CcqError::UnknownOpcode`] for an unrecognised leading word;
    /// the decoder resets so the next word is treated as a new message.
    #[allow(clippy::cast_possible_truncation)] // fields are masked before narrowing
    pub fn push(&mut self, word: u64) -> Result<Option<CcqMessage>, CcqError> {
        let (first, second) = match self.pending.take() {
            Some(first) => (first, Some(word)),
            None => (word, None),
        };

        let raw = (first >> OPCODE_SHIFT) as u8;
        let opcode = CcqOpcode::from_raw(raw).ok_or(CcqError::UnknownOpcode(raw))?;
        if opcode.words() == 2 && second.is_none() {
            self.pending = Some(first);
            return Ok(None);
        }

        let index = ((first >> INDEX_SHIFT) & 0xFF) as u8;
        let param = (first & 0xFFFF_FFFF) as u32;
        let iova = second.unwrap_or(0);
        Ok(Some(match opcode {
            CcqOpcode::InitResourceTable => CcqMessage::InitResourceTable { iova, capacity: param },
            CcqOpcode::InitQueue => CcqMessage::InitQueue { queue_id: index, iova, capacity: param },
            CcqOpcode::InitSharedBuffer => {
                CcqMessage::InitSharedBuffer { interface: index, iova, size: param }
            }
            CcqOpcode::DeinitSharedBuffer => CcqMessage::DeinitSharedBuffer { interface: index },
            CcqOpcode::Doorbell => CcqMessage::Doorbell { queue_id: index },
        }))
    }
}
