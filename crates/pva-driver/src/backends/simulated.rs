//! Simulated PVA firmware.
//!
//! Implements the firmware half of every host/firmware protocol the driver
//! uses, against memory from a [`HostDmaAllocator`]:
//!
//! ```text
//! CCQ words ──► decoder ──► InitResourceTable / InitQueue / InitSharedBuffer
//!                      └──► Doorbell ──► queue entries ──► command chains
//!                                                        ├─ post-fences
//!                                                        ├─ timestamps
//!                                                        └─ shared-buffer messages ──► interrupts
//! ```
//!
//! Work runs synchronously inside the doorbell's `push_word`, so by the time
//! a submitter starts polling its fence has usually been written. Faults can
//! be injected with [`SimulatedFirmware::hang`] (doorbells are ignored, fences
//! never arrive) and [`SimulatedFirmware::fail_ccq`] (the FIFO stops
//! draining).
//!
//! Firmware reads resource tables only at init and on `UpdateResourceTable`,
//! like the real thing: ids registered after the last update do not resolve.

use crate::backend::FirmwareBackend;
use crate::ccq::CommandFifo;
use crate::dma::{DmaHandle, HostDmaAllocator};
use crate::error::{PvaError, Result};
use crate::shared_buffer::produce;
use pva_chip::ccq::{CcqDecoder, CcqMessage};
use pva_chip::cmd::{self, Command};
use pva_chip::layout::{
    queue_bytes, QueueEntry, ResourceEntry, CONTEXT_RESOURCE_ID_BASE, DEVICE_QUEUE_ID,
    DEVICE_TABLE_ID, QUEUE_CAPACITY, QUEUE_ENTRY_BYTES, QUEUE_HEAD, QUEUE_HEADER_BYTES,
    QUEUE_TAIL, RESOURCE_ENTRY_BYTES,
};
use pva_chip::msg::FirmwareMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// `FwEvent` id posted when a command chain fails.
pub const EVENT_COMMAND_ERROR: u32 = 0x0E00;

/// Simulated cycles per executed command.
const CYCLES_PER_COMMAND: u64 = 1_000;

/// Simulated VPU run time.
const VPU_RUN_CYCLES: u64 = 25_000;

/// Link chains longer than this are treated as a loop.
const MAX_LINK_HOPS: usize = 4096;

/// How long a stuck CCQ FIFO makes the host wait.
const CCQ_DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
struct FwTable {
    iova: u64,
    capacity: u32,
    entries: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Copy)]
struct FwQueue {
    iova: u64,
    capacity: u32,
}

#[derive(Debug, Default)]
struct FwState {
    running: bool,
    boots: u32,
    decoders: HashMap<u8, CcqDecoder>,
    ccq_log: Vec<(u8, CcqMessage)>,
    tables: HashMap<u32, FwTable>,
    queues: HashMap<u8, FwQueue>,
    shared: HashMap<u8, (u64, usize)>,
    interrupts: Vec<u8>,
    engines: HashMap<u32, u8>,
    executables: HashMap<u8, u32>,
    dma: HashMap<(u8, u32), (u32, u64)>,
    bindings: HashMap<(u8, u32), u32>,
    trace_level: u32,
    profiling: Option<u32>,
    clock: u64,
    executed: u64,
    errors: u64,
}

/// In-process firmware model.
#[derive(Debug)]
pub struct SimulatedFirmware {
    memory: HostDmaAllocator,
    state: Mutex<FwState>,
    hung: AtomicBool,
    ccq_stuck: AtomicBool,
}

impl SimulatedFirmware {
    /// Firmware that resolves device addresses through `memory`.
    pub fn new(memory: HostDmaAllocator) -> Self {
        Self {
            memory,
            state: Mutex::new(FwState::default()),
            hung: AtomicBool::new(false),
            ccq_stuck: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FwState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop (or resume) consuming queue entries. Doorbells rung while hung
    /// are not replayed; [`SimulatedFirmware::run_pending`] catches up.
    pub fn hang(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    /// Make every CCQ push time out (or stop doing so).
    pub fn fail_ccq(&self, stuck: bool) {
        self.ccq_stuck.store(stuck, Ordering::SeqCst);
    }

    /// Consume everything pending on every known queue.
    pub fn run_pending(&self) {
        if self.hung.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        let mut ids: Vec<u8> = state.queues.keys().copied().collect();
        ids.sort_unstable();
        for queue_id in ids {
            self.run_queue(&mut state, queue_id);
        }
    }

    /// Post a message to the shared buffer of `interface`, as firmware
    /// would. Returns `false` if it did not fit (the overflow flag is set)
    /// or no buffer is registered there.
    pub fn post_message(&self, interface: u8, message: &FirmwareMessage) -> bool {
        let mut state = self.lock();
        self.post(&mut state, interface, message)
    }

    /// Every CCQ message received since boot, with its interface.
    pub fn ccq_log(&self) -> Vec<(u8, CcqMessage)> {
        self.lock().ccq_log.clone()
    }

    /// Firmware's copy of a resource table.
    pub fn table_snapshot(&self, table_id: u32) -> Option<Vec<ResourceEntry>> {
        self.lock().tables.get(&table_id).map(|t| t.entries.clone())
    }

    /// Whether a queue is registered.
    pub fn has_queue(&self, queue_id: u8) -> bool {
        self.lock().queues.contains_key(&queue_id)
    }

    /// Whether a shared buffer is registered on `interface`.
    pub fn has_shared_buffer(&self, interface: u8) -> bool {
        self.lock().shared.contains_key(&interface)
    }

    /// Current trace level.
    pub fn trace_level(&self) -> u32 {
        self.lock().trace_level
    }

    /// Profiling filter, if profiling is on.
    pub fn profiling(&self) -> Option<u32> {
        self.lock().profiling
    }

    /// Commands executed since boot.
    pub fn commands_executed(&self) -> u64 {
        self.lock().executed
    }

    /// Command chains abandoned because of an error since boot.
    pub fn command_errors(&self) -> u64 {
        self.lock().errors
    }

    /// Number of boots.
    pub fn boots(&self) -> u32 {
        self.lock().boots
    }

    fn on_message(&self, state: &mut FwState, interface: u8, message: CcqMessage) {
        state.ccq_log.push((interface, message));
        match message {
            CcqMessage::InitResourceTable { iova, capacity } => {
                if interface != DEVICE_QUEUE_ID {
                    tracing::warn!("[fw] InitResourceTable on CCQ{interface} ignored");
                    return;
                }
                match self.load_table(iova, capacity) {
                    Some(table) => {
                        state.tables.insert(DEVICE_TABLE_ID, table);
                    }
                    None => tracing::warn!("[fw] resource table at {iova:#x} unreadable"),
                }
            }
            CcqMessage::InitQueue { queue_id, iova, capacity } => {
                state.queues.insert(queue_id, FwQueue { iova, capacity });
            }
            CcqMessage::InitSharedBuffer { interface, iova, size } => {
                state.shared.insert(interface, (iova, size as usize));
            }
            CcqMessage::DeinitSharedBuffer { interface } => {
                state.shared.remove(&interface);
            }
            CcqMessage::Doorbell { queue_id } => {
                if !self.hung.load(Ordering::SeqCst) {
                    self.run_queue(state, queue_id);
                }
            }
        }
    }

    fn load_table(&self, iova: u64, capacity: u32) -> Option<FwTable> {
        let len = (capacity as usize).checked_mul(RESOURCE_ENTRY_BYTES)?;
        let mirror = self.memory.resolve(iova, len)?;
        let entries = (0..capacity as usize)
            .map(|i| {
                let mut raw = [0u8; RESOURCE_ENTRY_BYTES];
                mirror.read_bytes(i * RESOURCE_ENTRY_BYTES, &mut raw);
                ResourceEntry::decode(&raw)
            })
            .collect();
        Some(FwTable { iova, capacity, entries })
    }

    fn run_queue(&self, state: &mut FwState, queue_id: u8) {
        let Some(queue) = state.queues.get(&queue_id).copied() else {
            tracing::warn!("[fw] doorbell for unknown queue {queue_id}");
            return;
        };
        let Some(ring) = self.memory.resolve(queue.iova, queue_bytes(queue.capacity as usize))
        else {
            tracing::warn!("[fw] queue {queue_id} memory at {:#x} unreadable", queue.iova);
            return;
        };
        if ring.read_u32(QUEUE_CAPACITY) != queue.capacity || queue.capacity == 0 {
            tracing::warn!("[fw] queue {queue_id} header corrupt");
            return;
        }

        loop {
            let head = ring.read_u32(QUEUE_HEAD);
            let tail = ring.read_u32(QUEUE_TAIL);
            if head == tail {
                break;
            }
            if tail.wrapping_sub(head) > queue.capacity {
                tracing::warn!("[fw] queue {queue_id} tail {tail} ahead of head {head}");
                break;
            }
            let slot = (head % queue.capacity) as usize;
            let mut raw = [0u8; QUEUE_ENTRY_BYTES];
            ring.read_bytes(QUEUE_HEADER_BYTES + slot * QUEUE_ENTRY_BYTES, &mut raw);
            if let Err(reason) = self.run_chain(state, queue_id, QueueEntry::decode(&raw)) {
                self.fault(state, queue_id, &reason);
            }
            ring.write_u32(QUEUE_HEAD, head.wrapping_add(1));
        }
    }

    fn run_chain(
        &self,
        state: &mut FwState,
        queue_id: u8,
        entry: QueueEntry,
    ) -> std::result::Result<(), String> {
        let mut next = Some((entry.resource_id, entry.offset, entry.size));
        let mut hops = 0;

        while let Some((resource_id, offset, size)) = next.take() {
            hops += 1;
            if hops > MAX_LINK_HOPS {
                return Err(format!("link chain longer than {MAX_LINK_HOPS} chunks"));
            }
            let chunk = self.access(state, queue_id, resource_id, offset, size as usize, false)?;
            let bytes = chunk.to_vec();
            for command in cmd::iter(&bytes) {
                let command = command.map_err(|e| format!("chunk {resource_id}+{offset:#x}: {e}"))?;
                if let Command::LinkChunk { resource_id, offset, size } = command {
                    next = Some((resource_id, offset, size));
                    break;
                }
                self.execute(state, queue_id, command)?;
            }
        }
        Ok(())
    }

    fn lookup(state: &FwState, queue_id: u8, id: u32) -> std::result::Result<ResourceEntry, String> {
        let (table_id, base) = if id < CONTEXT_RESOURCE_ID_BASE {
            (DEVICE_TABLE_ID, 0)
        } else if queue_id != DEVICE_QUEUE_ID {
            (u32::from(queue_id), CONTEXT_RESOURCE_ID_BASE)
        } else {
            return Err(format!("context resource {id} used on the device queue"));
        };
        let table = state
            .tables
            .get(&table_id)
            .ok_or_else(|| format!("resource table {table_id} not initialised"))?;
        table
            .entries
            .get((id - base) as usize)
            .copied()
            .filter(ResourceEntry::is_valid)
            .ok_or_else(|| format!("resource {id} not in table {table_id}"))
    }

    fn access(
        &self,
        state: &FwState,
        queue_id: u8,
        id: u32,
        offset: u64,
        len: usize,
        write: bool,
    ) -> std::result::Result<DmaHandle, String> {
        let entry = Self::lookup(state, queue_id, id)?;
        if write && entry.is_read_only() {
            return Err(format!("write to read-only resource {id}"));
        }
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > u64::from(entry.size)) {
            return Err(format!("{len} bytes at {offset:#x} outside resource {id}"));
        }
        self.memory
            .resolve(entry.iova + offset, len)
            .ok_or_else(|| format!("resource {id} memory not mapped"))
    }

    fn writable_word(
        &self,
        state: &FwState,
        queue_id: u8,
        id: u32,
        offset: u64,
        len: usize,
    ) -> std::result::Result<DmaHandle, String> {
        if offset % 4 != 0 {
            return Err(format!("unaligned write at {offset:#x} in resource {id}"));
        }
        self.access(state, queue_id, id, offset, len, true)
    }

    #[allow(clippy::too_many_lines)]
    fn execute(
        &self,
        state: &mut FwState,
        queue_id: u8,
        command: Command,
    ) -> std::result::Result<(), String> {
        let opcode = command.opcode();
        if opcode.is_privileged() && queue_id != DEVICE_QUEUE_ID {
            return Err(format!("privileged {opcode:?} on queue {queue_id}"));
        }
        state.clock += CYCLES_PER_COMMAND;
        state.executed += 1;
        let now = state.clock;
        let q = u32::from(queue_id);
        if state.trace_level >= 2 {
            let tracepoint = FirmwareMessage::FwTracepoint {
                timestamp: now,
                level: state.trace_level,
                tracepoint_id: opcode as u32,
            };
            self.post(state, queue_id, &tracepoint);
        }

        match command {
            Command::Noop | Command::LinkChunk { .. } => {}
            Command::CapturePostFence { resource_id, offset, value } => {
                let word = self.writable_word(state, queue_id, resource_id, offset, 4)?;
                word.write_u32(0, value);
                if state.profiling.is_some() {
                    let trace = FirmwareMessage::FenceTrace { timestamp: now, resource_id, value };
                    self.post(state, queue_id, &trace);
                }
                if state.trace_level >= 1 {
                    let trace = FirmwareMessage::CmdBufTrace { timestamp: now, queue_id: q, fence: value };
                    self.post(state, queue_id, &trace);
                }
            }
            Command::CaptureTimestamp { resource_id, offset } => {
                let words = self.writable_word(state, queue_id, resource_id, offset, 8)?;
                #[allow(clippy::cast_possible_truncation)]
                let (lo, hi) = (now as u32, (now >> 32) as u32);
                words.write_u32(0, lo);
                words.write_u32(4, hi);
            }
            Command::AcquireEngine { engine } => {
                match state.engines.get(&engine) {
                    Some(&owner) if owner != queue_id => {
                        return Err(format!("engine {engine} held by queue {owner}"));
                    }
                    _ => {
                        state.engines.insert(engine, queue_id);
                    }
                }
                if state.profiling.is_some() {
                    let trace = FirmwareMessage::EngineAcquireTrace { timestamp: now, engine, ccq: q };
                    self.post(state, queue_id, &trace);
                }
            }
            Command::ReleaseEngine { engine } => {
                if state.engines.get(&engine) != Some(&queue_id) {
                    return Err(format!("engine {engine} not held by queue {queue_id}"));
                }
                state.engines.remove(&engine);
            }
            Command::SetVpuExecutable { resource_id } => {
                Self::lookup(state, queue_id, resource_id)?;
                state.executables.insert(queue_id, resource_id);
            }
            Command::RunVpu { entry_point } => {
                if !state.executables.contains_key(&queue_id) {
                    return Err("RunVpu without an executable".to_string());
                }
                state.clock += VPU_RUN_CYCLES;
                if state.profiling.is_some() {
                    let trace = FirmwareMessage::VpuExecTrace {
                        start: now,
                        end: state.clock,
                        engine: entry_point,
                        status: 0,
                    };
                    self.post(state, queue_id, &trace);
                }
            }
            Command::SetupDma { channel, resource_id, offset } => {
                Self::lookup(state, queue_id, resource_id)?;
                state.dma.insert((queue_id, channel), (resource_id, offset));
            }
            Command::RunDma { channel } => {
                if !state.dma.contains_key(&(queue_id, channel)) {
                    return Err(format!("RunDma on unconfigured channel {channel}"));
                }
            }
            Command::BindResource { slot, resource_id } => {
                Self::lookup(state, queue_id, resource_id)?;
                state.bindings.insert((queue_id, slot), resource_id);
            }
            Command::UnbindResource { slot } => {
                let resource_id = state
                    .bindings
                    .remove(&(queue_id, slot))
                    .ok_or_else(|| format!("slot {slot} not bound"))?;
                self.post(state, queue_id, &FirmwareMessage::ResourceUnregister { resource_id });
            }
            Command::InitResourceTable { table_id, capacity, iova } => {
                let table = self
                    .load_table(iova, capacity)
                    .ok_or_else(|| format!("resource table {table_id} at {iova:#x} unreadable"))?;
                state.tables.insert(table_id, table);
            }
            Command::UpdateResourceTable { table_id } => {
                let (iova, capacity) = state
                    .tables
                    .get(&table_id)
                    .map(|t| (t.iova, t.capacity))
                    .ok_or_else(|| format!("update of unknown table {table_id}"))?;
                let table = self
                    .load_table(iova, capacity)
                    .ok_or_else(|| format!("resource table {table_id} unreadable"))?;
                state.tables.insert(table_id, table);
            }
            Command::DeinitResourceTable { table_id } => {
                state.tables.remove(&table_id);
            }
            Command::InitQueue { queue_id: id, capacity, iova } => {
                let id = u8::try_from(id).map_err(|_| format!("queue id {id} out of range"))?;
                state.queues.insert(id, FwQueue { iova, capacity });
            }
            Command::DeinitQueue { queue_id: id } => {
                if let Ok(id) = u8::try_from(id) {
                    state.queues.remove(&id);
                    state.engines.retain(|_, owner| *owner != id);
                    state.executables.remove(&id);
                    state.dma.retain(|(q, _), _| *q != id);
                    state.bindings.retain(|(q, _), _| *q != id);
                }
            }
            Command::EnableFwProfiling { filter } => state.profiling = Some(filter),
            Command::DisableFwProfiling => state.profiling = None,
            Command::SetTraceLevel { level } => state.trace_level = level,
        }
        Ok(())
    }

    fn fault(&self, state: &mut FwState, queue_id: u8, reason: &str) {
        tracing::warn!("[fw] queue {queue_id}: {reason}");
        state.errors += 1;
        let event = FirmwareMessage::FwEvent {
            timestamp: state.clock,
            event_id: EVENT_COMMAND_ERROR,
            arg: u32::from(queue_id),
        };
        self.post(state, queue_id, &event);
    }

    fn post(&self, state: &mut FwState, interface: u8, message: &FirmwareMessage) -> bool {
        let Some(&(iova, size)) = state.shared.get(&interface) else {
            return false;
        };
        let Some(ring) = self.memory.resolve(iova, size) else {
            return false;
        };
        let fitted = produce(&ring, &message.encode());
        if !state.interrupts.contains(&interface) {
            state.interrupts.push(interface);
        }
        fitted
    }
}

impl CommandFifo for SimulatedFirmware {
    fn push_word(&self, interface: u8, word: u64) -> Result<()> {
        if self.ccq_stuck.load(Ordering::SeqCst) {
            return Err(PvaError::timeout(CCQ_DRAIN_TIMEOUT));
        }
        let mut state = self.lock();
        if !state.running {
            return Err(PvaError::invalid_state("firmware not running"));
        }
        let decoded = state
            .decoders
            .entry(interface)
            .or_default()
            .push(word)
            .map_err(|e| PvaError::invalid_argument(format!("CCQ{interface}: {e}")))?;
        if let Some(message) = decoded {
            self.on_message(&mut state, interface, message);
        }
        Ok(())
    }
}

impl FirmwareBackend for SimulatedFirmware {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn boot(&self) -> Result<()> {
        let mut state = self.lock();
        let boots = state.boots + 1;
        *state = FwState {
            running: true,
            boots,
            ..FwState::default()
        };
        tracing::info!("[fw] booted (boot #{boots})");
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if state.running {
            state.running = false;
            tracing::info!("[fw] stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    fn take_interrupts(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().interrupts)
    }
}
