//! Byte layouts of the structures shared between host and firmware in DRAM.
//!
//! All fields are little-endian. Index words (`head`, `tail`, fences) are
//! naturally aligned `u32`s so both sides can access them atomically.
//!
//! ```text
//! Submission queue           Resource table            Shared buffer
//! 0x00 head     (fw)         entry[0]  iova  u64       0x00 flags    (bit 0 overflow)
//! 0x04 tail     (host)                 size  u32       0x04 element_size
//! 0x08 capacity                        flags u32       0x08 head     (host)
//! 0x0C reserved              entry[1]  ...             0x0C tail     (fw)
//! 0x10 entry[0]                                        0x10 body ...
//! ```

// ── Submission queue ─────────────────────────────────────────────────────────

/// Queue header size; entries start right after it.
pub const QUEUE_HEADER_BYTES: usize = 16;

/// Offset of the consumer index (written by firmware).
pub const QUEUE_HEAD: usize = 0x00;

/// Offset of the producer index (written by host).
pub const QUEUE_TAIL: usize = 0x04;

/// Offset of the entry count.
pub const QUEUE_CAPACITY: usize = 0x08;

/// Size of one queue entry.
pub const QUEUE_ENTRY_BYTES: usize = 16;

/// Queue id of the device-owned (privileged) queue.
pub const DEVICE_QUEUE_ID: u8 = 0;

/// One submission queue entry: where the first chunk of a command buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueEntry {
    /// Resource holding the chunk.
    pub resource_id: u32,
    /// Bytes of commands in the chunk.
    pub size: u32,
    /// Offset of the chunk inside the resource.
    pub offset: u64,
}

impl QueueEntry {
    /// Encode to the shared-memory layout.
    #[must_use]
    pub fn encode(&self) -> [u8; QUEUE_ENTRY_BYTES] {
        let mut out = [0u8; QUEUE_ENTRY_BYTES];
        out[0..4].copy_from_slice(&self.resource_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode from the shared-memory layout.
    #[must_use]
    pub fn decode(raw: &[u8; QUEUE_ENTRY_BYTES]) -> Self {
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[8..16]);
        Self {
            resource_id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            offset: u64::from_le_bytes(offset),
        }
    }
}

/// Total bytes of a queue with `capacity` entries.
#[must_use]
pub const fn queue_bytes(capacity: usize) -> usize {
    QUEUE_HEADER_BYTES + capacity * QUEUE_ENTRY_BYTES
}

// ── Resource table ───────────────────────────────────────────────────────────

/// Size of one resource table entry.
pub const RESOURCE_ENTRY_BYTES: usize = 16;

/// Entry flag: slot holds a live resource.
pub const RESOURCE_VALID: u32 = 1 << 0;

/// Entry flag: firmware must not write through this resource.
pub const RESOURCE_READ_ONLY: u32 = 1 << 1;

/// Resource ids `0..DEVICE_RESOURCE_IDS` belong to the device table.
pub const DEVICE_RESOURCE_IDS: u32 = 64;

/// First resource id of a per-context table.
pub const CONTEXT_RESOURCE_ID_BASE: u32 = DEVICE_RESOURCE_IDS;

/// Table id of the device-owned resource table.
pub const DEVICE_TABLE_ID: u32 = 0;

/// One resource table entry as firmware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceEntry {
    /// Device address of the region.
    pub iova: u64,
    /// Region size in bytes.
    pub size: u32,
    /// [`RESOURCE_VALID`] / [`RESOURCE_READ_ONLY`].
    pub flags: u32,
}

impl ResourceEntry {
    /// Whether the slot is populated.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.flags & RESOURCE_VALID != 0
    }

    /// Whether firmware may only read the region.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.flags & RESOURCE_READ_ONLY != 0
    }

    /// Encode to the shared-memory layout.
    #[must_use]
    pub fn encode(&self) -> [u8; RESOURCE_ENTRY_BYTES] {
        let mut out = [0u8; RESOURCE_ENTRY_BYTES];
        out[0..8].copy_from_slice(&self.iova.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Decode from the shared-memory layout.
    #[must_use]
    pub fn decode(raw: &[u8; RESOURCE_ENTRY_BYTES]) -> Self {
        let mut iova = [0u8; 8];
        iova.copy_from_slice(&raw[0..8]);
        Self {
            iova: u64::from_le_bytes(iova),
            size: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }
}

// ── Shared buffer ────────────────────────────────────────────────────────────

/// Shared-buffer header size; the byte ring starts right after it.
pub const SHARED_BUFFER_HEADER_BYTES: usize = 16;

/// Offset of the flags word.
pub const SHARED_BUFFER_FLAGS: usize = 0x00;

/// Offset of the element size.
pub const SHARED_BUFFER_ELEMENT_SIZE: usize = 0x04;

/// Offset of the consumer index (written by host).
pub const SHARED_BUFFER_HEAD: usize = 0x08;

/// Offset of the producer index (written by firmware).
pub const SHARED_BUFFER_TAIL: usize = 0x0C;

/// Flags bit: firmware dropped at least one message.
pub const SHARED_BUFFER_OVERFLOW: u32 = 1 << 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_entry_layout() {
        let entry = ResourceEntry {
            iova: 0x1_2345_6000,
            size: 4096,
            flags: RESOURCE_VALID | RESOURCE_READ_ONLY,
        };
        let raw = entry.encode();
        assert_eq!(&raw[8..12], &4096u32.to_le_bytes());
        let back = ResourceEntry::decode(&raw);
        assert!(back.is_valid() && back.is_read_only());
        assert_eq!(back.iova, 0x1_2345_6000);
    }

    #[test]
    fn test_queue_bytes() {
        assert_eq!(queue_bytes(0), QUEUE_HEADER_BYTES);
        assert_eq!(queue_bytes(8), 16 + 8 * 16);
    }

    #[test]
    fn test_queue_entry_layout() {
        let entry = QueueEntry { resource_id: 3, size: 120, offset: 0x400 };
        let raw = entry.encode();
        assert_eq!(&raw[0..4], &3u32.to_le_bytes());
        assert_eq!(QueueEntry::decode(&raw), entry);
    }
}
