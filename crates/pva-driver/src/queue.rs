//! Submission queue: single-producer ring of chunk descriptors.
//!
//! The host owns `tail`, firmware owns `head`. Both are free-running `u32`
//! counters used modulo the capacity, so `tail - head` (wrapping) is the
//! number of pending entries. `head` is written by firmware and therefore
//! validated on every read.

use crate::dma::{Access, DeviceMemory, DmaRegion};
use crate::error::{PvaError, Result};
use pva_chip::layout::{
    queue_bytes, QueueEntry, QUEUE_CAPACITY, QUEUE_ENTRY_BYTES, QUEUE_HEAD, QUEUE_HEADER_BYTES,
    QUEUE_TAIL,
};

/// Host side of one submission queue.
#[derive(Debug)]
pub struct SubmissionQueue {
    region: DmaRegion,
    queue_id: u8,
    capacity: u32,
    tail: u32,
}

impl SubmissionQueue {
    /// Allocate a queue with room for `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero capacity, or an allocation error.
    pub fn new(memory: &dyn DeviceMemory, queue_id: u8, capacity: u32, asid: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(PvaError::invalid_argument("queue capacity must be non-zero"));
        }
        let region = memory.alloc_map(queue_bytes(capacity as usize), Access::ReadWrite, asid)?;
        region.write_u32(QUEUE_CAPACITY, capacity);
        tracing::debug!(
            "Queue {queue_id}: {capacity} entries at {:#x}",
            region.iova()
        );
        Ok(Self {
            region,
            queue_id,
            capacity,
            tail: 0,
        })
    }

    fn head(&self) -> Result<u32> {
        let head = self.region.read_u32(QUEUE_HEAD);
        if self.tail.wrapping_sub(head) > self.capacity {
            return Err(PvaError::protocol_violation(format!(
                "queue {} head {head} inconsistent with tail {} (capacity {})",
                self.queue_id, self.tail, self.capacity
            )));
        }
        Ok(head)
    }

    /// Append an entry and publish it to firmware.
    ///
    /// The entry is fully written before `tail` is advanced with release
    /// ordering, so firmware never sees a half-written entry.
    ///
    /// # Errors
    ///
    /// Returns `ResourceBusy` when the ring is full and `ProtocolViolation`
    /// if firmware published an impossible `head`.
    pub fn push(&mut self, entry: &QueueEntry) -> Result<()> {
        let head = self.head()?;
        if self.tail.wrapping_sub(head) == self.capacity {
            return Err(PvaError::resource_busy(format!("queue {}", self.queue_id)));
        }

        let slot = (self.tail % self.capacity) as usize;
        self.region
            .write_bytes(QUEUE_HEADER_BYTES + slot * QUEUE_ENTRY_BYTES, &entry.encode());
        self.tail = self.tail.wrapping_add(1);
        self.region.write_u32(QUEUE_TAIL, self.tail);
        Ok(())
    }

    /// Zero both indices. Only legal while firmware is not consuming.
    pub fn reset(&mut self) {
        self.tail = 0;
        self.region.write_u32(QUEUE_HEAD, 0);
        self.region.write_u32(QUEUE_TAIL, 0);
        self.region.write_u32(QUEUE_CAPACITY, self.capacity);
    }

    /// Entries pushed but not yet consumed.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if firmware published an impossible `head`.
    pub fn pending(&self) -> Result<u32> {
        Ok(self.tail.wrapping_sub(self.head()?))
    }

    /// Queue id (equal to the CCQ interface that rings its doorbell).
    pub const fn queue_id(&self) -> u8 {
        self.queue_id
    }

    /// Entry capacity.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Device address of the queue header.
    pub fn iova(&self) -> u64 {
        self.region.iova()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDmaAllocator;

    fn entry(n: u32) -> QueueEntry {
        QueueEntry {
            resource_id: 1,
            size: 40,
            offset: u64::from(n) * 64,
        }
    }

    #[test]
    fn test_full_queue_is_busy() {
        let mem = HostDmaAllocator::new();
        let mut queue = SubmissionQueue::new(&mem, 0, 2, 0).unwrap();
        queue.push(&entry(0)).unwrap();
        queue.push(&entry(1)).unwrap();
        assert_eq!(queue.pending().unwrap(), 2);

        let err = queue.push(&entry(2)).unwrap_err();
        assert!(matches!(err, PvaError::ResourceBusy { .. }));

        // Firmware consumes one entry.
        let fw = mem.resolve(queue.iova(), queue_bytes(2)).unwrap();
        fw.write_u32(QUEUE_HEAD, 1);
        queue.push(&entry(2)).unwrap();

        let mut raw = [0u8; QUEUE_ENTRY_BYTES];
        fw.read_bytes(QUEUE_HEADER_BYTES, &mut raw);
        assert_eq!(QueueEntry::decode(&raw), entry(2));
        assert_eq!(fw.read_u32(QUEUE_TAIL), 3);
    }

    #[test]
    fn test_head_past_tail_is_protocol_violation() {
        let mem = HostDmaAllocator::new();
        let mut queue = SubmissionQueue::new(&mem, 0, 4, 0).unwrap();
        queue.push(&entry(0)).unwrap();

        let fw = mem.resolve(queue.iova(), queue_bytes(4)).unwrap();
        fw.write_u32(QUEUE_HEAD, 7);
        assert!(matches!(
            queue.push(&entry(1)),
            Err(PvaError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_reset_zeroes_indices() {
        let mem = HostDmaAllocator::new();
        let mut queue = SubmissionQueue::new(&mem, 3, 4, 0).unwrap();
        queue.push(&entry(0)).unwrap();
        queue.reset();
        assert_eq!(queue.pending().unwrap(), 0);

        let fw = mem.resolve(queue.iova(), QUEUE_HEADER_BYTES).unwrap();
        assert_eq!(fw.read_u32(QUEUE_TAIL), 0);
        assert_eq!(fw.read_u32(QUEUE_CAPACITY), 4);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mem = HostDmaAllocator::new();
        assert!(SubmissionQueue::new(&mem, 0, 0, 0).is_err());
    }
}
