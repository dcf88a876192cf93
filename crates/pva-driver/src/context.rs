//! Per-context submission state.
//!
//! A context owns one CCQ interface and, behind it, its own resource table,
//! submission queue, chunk pool, fence and event channel. Firmware learns
//! about the table and queue through privileged commands on the device
//! queue; the event channel is announced over the context's own CCQ.

use crate::ccq::CommandFifo;
use crate::chunk::ChunkPool;
use crate::cmdbuf::CommandBuffer;
use crate::config::DeviceConfig;
use crate::dma::{Access, DeviceMemory};
use crate::error::Result;
use crate::health::DeviceHealth;
use crate::queue::SubmissionQueue;
use crate::resource::ResourceTable;
use crate::shared_buffer::{ChannelKind, SharedBuffer};
use crate::submit::{FenceSlot, Submitter};
use pva_chip::cmd::Command;
use pva_chip::layout::DEVICE_QUEUE_ID;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes allocated for a fence word (one page in practice).
pub(crate) const FENCE_REGION_BYTES: usize = 64;

/// Handle of an open context. The number is its CCQ interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u8);

impl ContextId {
    /// CCQ interface (and queue id, and resource table id) of the context.
    pub const fn interface(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Memory and channels of one submission endpoint.
///
/// Shared by the device endpoint and by every context; only the id range of
/// the table and the privilege of the submitter differ.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) table: Arc<Mutex<ResourceTable>>,
    pub(crate) submitter: Submitter,
    pub(crate) events: Arc<SharedBuffer<Mutex<ResourceTable>>>,
    pub(crate) internal: [u32; 2],
}

impl Endpoint {
    /// Allocate table, chunk pool, fence and queue for `interface`.
    pub(crate) fn create(
        interface: u8,
        mut table: ResourceTable,
        config: &DeviceConfig,
        memory: &dyn DeviceMemory,
        fifo: Arc<dyn CommandFifo>,
        health: &Arc<DeviceHealth>,
    ) -> Result<Self> {
        let pool_bytes = config.chunk_size * config.chunk_count;
        let pool_id = table.add(memory.alloc_map(pool_bytes, Access::ReadWrite, config.asid)?, false)?;
        let fence_id = table.add(
            memory.alloc_map(FENCE_REGION_BYTES, Access::ReadWrite, config.asid)?,
            false,
        )?;
        let pool_handle = table.get(pool_id)?.handle();
        let fence_handle = table.get(fence_id)?.handle();
        table.sync_mirror();

        let queue = SubmissionQueue::new(memory, interface, config.queue_capacity, config.asid)?;
        let pool = ChunkPool::new(
            pool_handle,
            pool_id,
            0,
            pool_bytes,
            config.chunk_size,
            config.chunk_count,
        )?;
        let fence = FenceSlot {
            handle: fence_handle,
            resource_id: fence_id,
            offset: 0,
        };
        let privileged = interface == DEVICE_QUEUE_ID;
        let submitter = Submitter::new(queue, pool, fence, fifo, health.clone(), privileged)
            .with_wait(config.poll_interval, config.submit_timeout);

        let kind = if privileged {
            ChannelKind::Device
        } else {
            ChannelKind::Context
        };
        let table = Arc::new(Mutex::new(table));
        let events = Arc::new(
            SharedBuffer::new(interface, kind, table.clone(), health.clone())
                .with_pinned(&[pool_id, fence_id]),
        );

        Ok(Self {
            table,
            submitter,
            events,
            internal: [pool_id, fence_id],
        })
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, ResourceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_internal(&self, id: u32) -> bool {
        self.internal.contains(&id)
    }
}

/// An open context.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) id: ContextId,
    pub(crate) endpoint: Endpoint,
}

impl Context {
    pub(crate) fn create(
        id: ContextId,
        config: &DeviceConfig,
        memory: &dyn DeviceMemory,
        fifo: Arc<dyn CommandFifo>,
        health: &Arc<DeviceHealth>,
    ) -> Result<Self> {
        let table = ResourceTable::for_context(
            memory,
            u32::from(id.0),
            config.context_resource_capacity,
            config.asid,
        )?;
        let endpoint = Endpoint::create(id.0, table, config, memory, fifo, health)?;
        Ok(Self { id, endpoint })
    }

    /// Privileged commands that make firmware aware of the table and queue.
    pub(crate) fn bootstrap_commands(&self) -> CommandBuffer {
        let (table_id, capacity, mirror) = {
            let mut table = self.endpoint.lock_table();
            table.sync_mirror();
            #[allow(clippy::cast_possible_truncation)] // bounded by the id space
            let capacity = table.capacity() as u32;
            (table.table_id(), capacity, table.mirror_iova())
        };
        let mut buf = CommandBuffer::new();
        buf.push(&Command::InitResourceTable {
            table_id,
            capacity,
            iova: mirror,
        })
        .push(&Command::InitQueue {
            queue_id: u32::from(self.id.0),
            capacity: self.endpoint.submitter.queue_capacity(),
            iova: self.endpoint.submitter.queue_iova(),
        });
        buf
    }

    /// Privileged commands that make firmware forget the table and queue.
    pub(crate) fn teardown_commands(&self) -> CommandBuffer {
        let mut buf = CommandBuffer::new();
        buf.push(&Command::DeinitQueue {
            queue_id: u32::from(self.id.0),
        })
        .push(&Command::DeinitResourceTable {
            table_id: u32::from(self.id.0),
        });
        buf
    }
}
