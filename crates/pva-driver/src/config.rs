//! Device configuration.

use crate::error::{PvaError, Result};
use crate::shared_buffer::MIN_ELEMENT_SIZE;
use pva_chip::cmd::{CHUNK_TRAILER_BYTES, WORD_BYTES};
use pva_chip::layout::DEVICE_RESOURCE_IDS;
use pva_chip::soc::ChipFamily;
use std::time::Duration;

/// Resource ids the driver reserves in every table (chunk pool, fence).
pub const INTERNAL_RESOURCES: usize = 2;

/// Tunables of one device.
///
/// Chip constants come from [`ChipFamily`]; everything here is a sizing or
/// timing choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Chip family.
    pub chip: ChipFamily,

    /// Device resource table capacity (including internal resources).
    pub resource_capacity: usize,

    /// Per-context resource table capacity (including internal resources).
    pub context_resource_capacity: usize,

    /// Submission queue entries. Must be a power of two so the free-running
    /// indices stay consistent across `u32` wrap.
    pub queue_capacity: u32,

    /// Bytes per command chunk.
    pub chunk_size: usize,

    /// Chunks per pool.
    pub chunk_count: usize,

    /// Shared-buffer element size in bytes.
    pub shared_buffer_element_size: usize,

    /// Shared-buffer elements.
    pub shared_buffer_entries: usize,

    /// Contexts that may be open at once (each takes one CCQ interface).
    pub max_contexts: u8,

    /// Fence poll interval.
    pub poll_interval: Duration,

    /// Fence wait budget per submission.
    pub submit_timeout: Duration,

    /// Address space of device-owned memory.
    pub asid: u32,
}

impl DeviceConfig {
    /// Defaults for `chip`.
    pub const fn for_chip(chip: ChipFamily) -> Self {
        Self {
            chip,
            resource_capacity: 32,
            context_resource_capacity: 32,
            queue_capacity: 32,
            chunk_size: 256,
            chunk_count: 64,
            shared_buffer_element_size: 64,
            shared_buffer_entries: 64,
            max_contexts: chip.ccq_count() - 1,
            poll_interval: Duration::from_micros(100),
            submit_timeout: Duration::from_secs(1),
            asid: 0,
        }
    }

    /// Set both resource table capacities.
    #[must_use]
    pub fn with_resource_capacity(mut self, device: usize, context: usize) -> Self {
        self.resource_capacity = device;
        self.context_resource_capacity = context;
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: u32) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the chunk pool geometry.
    #[must_use]
    pub fn with_chunks(mut self, chunk_size: usize, chunk_count: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_count = chunk_count;
        self
    }

    /// Set the shared-buffer geometry.
    #[must_use]
    pub fn with_shared_buffer(mut self, element_size: usize, entries: usize) -> Self {
        self.shared_buffer_element_size = element_size;
        self.shared_buffer_entries = entries;
        self
    }

    /// Set the context limit.
    #[must_use]
    pub fn with_max_contexts(mut self, max_contexts: u8) -> Self {
        self.max_contexts = max_contexts;
        self
    }

    /// Set fence polling.
    #[must_use]
    pub fn with_wait(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.submit_timeout = timeout;
        self
    }

    /// Check the values against each other and the chip.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first inconsistent field.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(PvaError::invalid_argument(reason));

        if self.resource_capacity <= INTERNAL_RESOURCES
            || self.resource_capacity > DEVICE_RESOURCE_IDS as usize
        {
            return fail(format!(
                "resource_capacity {} must be in {}..={DEVICE_RESOURCE_IDS}",
                self.resource_capacity,
                INTERNAL_RESOURCES + 1
            ));
        }
        if self.context_resource_capacity <= INTERNAL_RESOURCES {
            return fail(format!(
                "context_resource_capacity {} leaves no room for user resources",
                self.context_resource_capacity
            ));
        }
        if !self.queue_capacity.is_power_of_two() {
            return fail(format!(
                "queue_capacity {} must be a power of two",
                self.queue_capacity
            ));
        }
        if self.chunk_size < 2 * CHUNK_TRAILER_BYTES
            || self.chunk_size % WORD_BYTES != 0
            || self.chunk_count == 0
        {
            return fail(format!(
                "chunk pool {} x {} bytes",
                self.chunk_count, self.chunk_size
            ));
        }
        if self.shared_buffer_element_size < MIN_ELEMENT_SIZE
            || self.shared_buffer_element_size % 8 != 0
            || self.shared_buffer_entries == 0
        {
            return fail(format!(
                "shared buffer {} x {} bytes",
                self.shared_buffer_entries, self.shared_buffer_element_size
            ));
        }
        if self.max_contexts >= self.chip.ccq_count() {
            return fail(format!(
                "max_contexts {} exceeds the {} CCQ interfaces of {}",
                self.max_contexts,
                self.chip.ccq_count() - 1,
                self.chip.name()
            ));
        }
        if self.poll_interval.is_zero() || self.submit_timeout < self.poll_interval {
            return fail(format!(
                "poll interval {:?} with timeout {:?}",
                self.poll_interval, self.submit_timeout
            ));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::for_chip(ChipFamily::T23x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_for_every_chip() {
        for &chip in ChipFamily::all() {
            let config = DeviceConfig::for_chip(chip);
            config.validate().unwrap();
            assert_eq!(config.max_contexts + 1, chip.ccq_count());
        }
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let base = DeviceConfig::default();
        let bad = [
            base.clone().with_resource_capacity(2, 32),
            base.clone().with_resource_capacity(65, 32),
            base.clone().with_resource_capacity(8, 1),
            base.clone().with_queue_capacity(24),
            base.clone().with_queue_capacity(0),
            base.clone().with_chunks(30, 8),
            base.clone().with_chunks(64, 0),
            base.clone().with_shared_buffer(24, 8),
            base.clone().with_max_contexts(8),
            base.clone().with_wait(Duration::ZERO, Duration::from_millis(1)),
            base.with_wait(Duration::from_millis(5), Duration::from_millis(1)),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(PvaError::InvalidArgument { .. })),
                "{config:?} accepted"
            );
        }
    }
}
