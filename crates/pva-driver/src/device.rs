//! The device: composition root and lifecycle.
//!
//! ```text
//!            create            init_firmware
//!   ─────────► Created ─────────► FirmwareLoading ─────► Running ◄──┐
//!                 ▲                                        │  │     │ recover
//!                 └────────────── deinit_firmware ─────────┘  │     │
//!                                                             ▼     │
//!                                         abort / fault ──► Aborted ─► Recovering
//!
//!   destroy (waits for every context to close) ──► Destroyed
//! ```
//!
//! Every value in a `Device` belongs to that device alone, so several
//! devices can live side by side in one process.
//!
//! # Bootstrap
//!
//! Firmware knows nothing about host memory when it starts. The device
//! tells it where its resource table and queue are with CCQ words (the
//! submitter cannot be used before firmware knows about the queue), then
//! sets up the event channel and replays configuration that was requested
//! while firmware was not running.
//!
//! # Deferred context free
//!
//! A context whose teardown commands could not be delivered may still be
//! referenced by firmware. Its memory is kept on a deferred list and only
//! released once firmware is stopped or rebooted.

use crate::backend::FirmwareBackend;
use crate::ccq::{push_message, CommandFifo};
use crate::cmdbuf::CommandBuffer;
use crate::config::DeviceConfig;
use crate::context::{Context, ContextId, Endpoint};
use crate::dma::{Access, DeviceMemory, DmaHandle, DmaRegion};
use crate::error::{PvaError, Result};
use crate::health::DeviceHealth;
use crate::interrupt::InterruptTable;
use crate::resource::ResourceTable;
use crate::shared_buffer::ProcessStats;
use crate::submit::FenceTicket;
use pva_chip::ccq::CcqMessage;
use pva_chip::cmd::Command;
use pva_chip::layout::DEVICE_QUEUE_ID;
use pva_chip::msg::FirmwareMessage;
use pva_chip::soc::ChipFamily;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often [`Device::destroy`] re-checks for open contexts.
const RETIRE_POLL: Duration = Duration::from_millis(1);

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Host structures exist; firmware is not running.
    Created,
    /// Firmware is booting and being told about host memory.
    FirmwareLoading,
    /// Accepting work.
    Running,
    /// Firmware is being restarted.
    Recovering,
    /// Firmware faulted; nothing it writes is trusted until recovery.
    Aborted,
    /// Torn down.
    Destroyed,
}

/// Where a resource or submission goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The device queue and table (privileged).
    Device,
    /// A context's queue and table.
    Context(ContextId),
}

impl From<ContextId> for Target {
    fn from(id: ContextId) -> Self {
        Self::Context(id)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Settings {
    trace_level: Option<u32>,
    profiling: Option<u32>,
}

/// One PVA instance.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    memory: Arc<dyn DeviceMemory>,
    backend: Arc<dyn FirmwareBackend>,
    fifo: Arc<dyn CommandFifo>,
    health: Arc<DeviceHealth>,
    state: Mutex<DeviceState>,
    lifecycle: Mutex<()>,
    endpoint: Endpoint,
    irq: InterruptTable,
    contexts: Mutex<HashMap<u8, Arc<Context>>>,
    free_interfaces: Mutex<Vec<u8>>,
    deferred: Mutex<Vec<Arc<Context>>>,
    deferred_count: AtomicUsize,
    settings: Mutex<Settings>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    /// Build the host side of a device: the device resource table (holding
    /// the chunk pool and fence), the device queue and the context pool.
    /// Firmware is not touched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid configuration, or an
    /// allocation error.
    pub fn create<B>(config: DeviceConfig, memory: Arc<dyn DeviceMemory>, backend: Arc<B>) -> Result<Self>
    where
        B: FirmwareBackend + 'static,
    {
        config.validate()?;
        let health = Arc::new(DeviceHealth::new());
        let fifo: Arc<dyn CommandFifo> = backend.clone();
        let table = ResourceTable::new(memory.as_ref(), config.resource_capacity, config.asid)?;
        let endpoint = Endpoint::create(
            DEVICE_QUEUE_ID,
            table,
            &config,
            memory.as_ref(),
            fifo.clone(),
            &health,
        )?;

        tracing::info!(
            "PVA device created: {}, {} context(s), backend {}",
            config.chip.name(),
            config.max_contexts,
            backend.name()
        );
        Ok(Self {
            free_interfaces: Mutex::new((1..=config.max_contexts).rev().collect()),
            config,
            memory,
            backend,
            fifo,
            health,
            state: Mutex::new(DeviceState::Created),
            lifecycle: Mutex::new(()),
            endpoint,
            irq: InterruptTable::new(),
            contexts: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            deferred_count: AtomicUsize::new(0),
            settings: Mutex::new(Settings::default()),
        })
    }

    /// Current state. A running device whose health flag is set reports
    /// `Aborted`.
    pub fn state(&self) -> DeviceState {
        let state = *lock(&self.state);
        if state == DeviceState::Running && self.health.is_aborted() {
            DeviceState::Aborted
        } else {
            state
        }
    }

    fn set_state(&self, state: DeviceState) {
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!("Device state {:?} -> {state:?}", *current);
            *current = state;
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            DeviceState::Running => Ok(()),
            DeviceState::Aborted | DeviceState::Recovering => Err(PvaError::FirmwareAborted),
            other => Err(PvaError::invalid_state(format!("device is {other:?}"))),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            DeviceState::Aborted | DeviceState::Recovering => Err(PvaError::FirmwareAborted),
            DeviceState::Destroyed => Err(PvaError::invalid_state("device is Destroyed")),
            _ => Ok(()),
        }
    }

    /// Boot firmware and run the bootstrap handshake.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the device is `Created`, or the boot /
    /// bootstrap error. On error firmware is stopped again and the device
    /// stays `Created`.
    pub fn init_firmware(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let state = self.state();
        if state != DeviceState::Created {
            return Err(PvaError::invalid_state(format!(
                "init_firmware while {state:?}"
            )));
        }
        self.set_state(DeviceState::FirmwareLoading);
        match self.bring_up() {
            Ok(()) => {
                self.set_state(DeviceState::Running);
                tracing::info!("PVA firmware running ({})", self.backend.name());
                Ok(())
            }
            Err(e) => {
                tracing::error!("Firmware bring-up failed: {e}");
                self.quiesce();
                self.set_state(DeviceState::Created);
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        self.backend.boot()?;
        self.endpoint.submitter.reset();

        let (mirror, capacity) = {
            let mut table = self.endpoint.lock_table();
            table.sync_mirror();
            #[allow(clippy::cast_possible_truncation)] // at most DEVICE_RESOURCE_IDS
            let capacity = table.capacity() as u32;
            (table.mirror_iova(), capacity)
        };
        let fifo = self.fifo.as_ref();
        push_message(fifo, DEVICE_QUEUE_ID, &CcqMessage::InitResourceTable { iova: mirror, capacity })?;
        push_message(
            fifo,
            DEVICE_QUEUE_ID,
            &CcqMessage::InitQueue {
                queue_id: DEVICE_QUEUE_ID,
                iova: self.endpoint.submitter.queue_iova(),
                capacity: self.endpoint.submitter.queue_capacity(),
            },
        )?;

        self.health.reset();
        self.init_events(&self.endpoint)?;
        self.replay_settings()?;

        // Contexts that survived a recovery or firmware restart.
        let contexts: Vec<Arc<Context>> = lock(&self.contexts).values().cloned().collect();
        for context in contexts {
            self.bootstrap_context(&context)?;
        }
        Ok(())
    }

    fn init_events(&self, endpoint: &Endpoint) -> Result<()> {
        endpoint.events.init(
            self.config.shared_buffer_element_size,
            self.config.shared_buffer_entries,
            self.memory.as_ref(),
            self.config.asid,
            self.fifo.as_ref(),
            &self.irq,
        )
    }

    fn replay_settings(&self) -> Result<()> {
        let settings = *lock(&self.settings);
        let mut buf = CommandBuffer::new();
        if let Some(level) = settings.trace_level {
            buf.push(&Command::SetTraceLevel { level });
        }
        if let Some(filter) = settings.profiling {
            buf.push(&Command::EnableFwProfiling { filter });
        }
        if buf.is_empty() {
            return Ok(());
        }
        tracing::debug!("Replaying deferred configuration {settings:?}");
        self.endpoint.submitter.submit(buf.as_bytes())
    }

    fn bootstrap_context(&self, context: &Context) -> Result<()> {
        context.endpoint.submitter.reset();
        self.endpoint
            .submitter
            .submit(context.bootstrap_commands().as_bytes())?;
        self.init_events(&context.endpoint)
    }

    /// Tear down event channels and stop firmware.
    fn quiesce(&self) {
        let contexts: Vec<Arc<Context>> = lock(&self.contexts).values().cloned().collect();
        for context in &contexts {
            context.endpoint.events.deinit(self.fifo.as_ref(), &self.irq);
        }
        self.endpoint.events.deinit(self.fifo.as_ref(), &self.irq);
        self.health.disable_interrupts();
        self.backend.shutdown();
        self.flush_deferred();
    }

    fn flush_deferred(&self) {
        let retired: Vec<Arc<Context>> = std::mem::take(&mut *lock(&self.deferred));
        if retired.is_empty() {
            return;
        }
        let count = retired.len();
        let mut free = lock(&self.free_interfaces);
        for context in retired {
            free.push(context.id.0);
        }
        self.deferred_count.fetch_sub(count, Ordering::SeqCst);
        tracing::info!("Released {count} deferred context(s)");
    }

    /// Stop firmware. Open contexts stay open and are re-announced by the
    /// next [`Device::init_firmware`]; deferred contexts are released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless firmware is running (or aborted).
    pub fn deinit_firmware(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let state = self.state();
        if !matches!(state, DeviceState::Running | DeviceState::Aborted) {
            return Err(PvaError::invalid_state(format!(
                "deinit_firmware while {state:?}"
            )));
        }
        self.quiesce();
        self.set_state(DeviceState::Created);
        tracing::info!("PVA firmware stopped");
        Ok(())
    }

    /// Mark the device aborted. Interrupts are disabled first.
    pub fn abort(&self, reason: &str) {
        self.health.abort(reason);
    }

    /// Why the device was aborted, if it is.
    pub fn abort_reason(&self) -> Option<String> {
        self.health.abort_reason()
    }

    /// Restart firmware and re-announce the device and every open context.
    ///
    /// In-flight submissions are abandoned and deferred contexts released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the device is running or aborted. If
    /// bring-up fails the device is left aborted and the error returned.
    pub fn recover(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let state = self.state();
        if !matches!(state, DeviceState::Running | DeviceState::Aborted) {
            return Err(PvaError::invalid_state(format!("recover while {state:?}")));
        }
        tracing::warn!("Recovering PVA (was {state:?})");
        self.set_state(DeviceState::Recovering);
        self.quiesce();

        // In-flight work on every queue is abandoned by `bring_up`.
        match self.bring_up() {
            Ok(()) => {
                self.set_state(DeviceState::Running);
                tracing::info!("PVA recovered");
                Ok(())
            }
            Err(e) => {
                self.health.abort(&format!("recovery failed: {e}"));
                self.set_state(DeviceState::Aborted);
                Err(e)
            }
        }
    }

    /// Wait until every context is closed, stop firmware and release
    /// everything.
    ///
    /// Contexts are never force-closed: firmware may still be writing
    /// through them. This blocks until other threads have closed theirs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the device is already destroyed.
    pub fn destroy(&self) -> Result<()> {
        if self.state() == DeviceState::Destroyed {
            return Err(PvaError::invalid_state("device already destroyed"));
        }
        let mut waited = false;
        while self.open_contexts() > 0 {
            if !waited {
                tracing::info!("Destroy waiting for {} open context(s)", self.open_contexts());
                waited = true;
            }
            std::thread::sleep(RETIRE_POLL);
        }

        let _lifecycle = lock(&self.lifecycle);
        if self.state() != DeviceState::Created {
            self.quiesce();
        }
        self.flush_deferred();
        self.set_state(DeviceState::Destroyed);
        tracing::info!("PVA device destroyed");
        Ok(())
    }

    /// Open a context on the next free CCQ interface.
    ///
    /// # Errors
    ///
    /// - `OutOfResources` when every interface is taken
    /// - `FirmwareAborted` / `InvalidState` unless running
    /// - allocation and submission errors
    pub fn open_context(&self) -> Result<ContextId> {
        let _lifecycle = lock(&self.lifecycle);
        self.ensure_running()?;
        let interface = lock(&self.free_interfaces)
            .pop()
            .ok_or_else(|| PvaError::out_of_resources("context interfaces"))?;
        let id = ContextId(interface);

        let context = match Context::create(
            id,
            &self.config,
            self.memory.as_ref(),
            self.fifo.clone(),
            &self.health,
        ) {
            Ok(context) => Arc::new(context),
            Err(e) => {
                lock(&self.free_interfaces).push(interface);
                return Err(e);
            }
        };

        if let Err(e) = self.bootstrap_context(&context) {
            tracing::warn!("Context {id} bring-up failed: {e}");
            self.retire(context);
            return Err(e);
        }
        lock(&self.contexts).insert(interface, context);
        tracing::info!("Context {id} opened");
        Ok(id)
    }

    /// Close a context.
    ///
    /// If firmware cannot be told to forget the context, its memory is
    /// deferred (see the module docs) and the close still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn close_context(&self, id: ContextId) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        let context = lock(&self.contexts)
            .remove(&id.0)
            .ok_or_else(|| PvaError::not_found(format!("context {id}")))?;
        self.retire(context);
        tracing::info!("Context {id} closed");
        Ok(())
    }

    fn retire(&self, context: Arc<Context>) {
        context.endpoint.events.deinit(self.fifo.as_ref(), &self.irq);
        let referenced = match self.state() {
            DeviceState::Created | DeviceState::Destroyed => false,
            DeviceState::Running => {
                let teardown = context.teardown_commands();
                match self.endpoint.submitter.submit(teardown.as_bytes()) {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::warn!("Context {} teardown failed: {e}", context.id);
                        true
                    }
                }
            }
            DeviceState::FirmwareLoading | DeviceState::Recovering | DeviceState::Aborted => true,
        };

        if referenced {
            tracing::warn!("Context {} deferred until firmware restarts", context.id);
            lock(&self.deferred).push(context);
            self.deferred_count.fetch_add(1, Ordering::SeqCst);
        } else {
            lock(&self.free_interfaces).push(context.id.0);
        }
    }

    fn context(&self, id: ContextId) -> Result<Arc<Context>> {
        lock(&self.contexts)
            .get(&id.0)
            .cloned()
            .ok_or_else(|| PvaError::not_found(format!("context {id}")))
    }

    fn with_endpoint<R>(&self, target: Target, f: impl FnOnce(&Endpoint) -> Result<R>) -> Result<R> {
        match target {
            Target::Device => f(&self.endpoint),
            Target::Context(id) => f(&self.context(id)?.endpoint),
        }
    }

    /// Submit and wait for completion.
    ///
    /// # Errors
    ///
    /// `FirmwareAborted` while aborted or recovering, `NotFound` for an
    /// unknown context, and every submitter error.
    pub fn submit(&self, target: Target, commands: &CommandBuffer) -> Result<()> {
        self.ensure_running()?;
        self.with_endpoint(target, |ep| ep.submitter.submit(commands.as_bytes()))
    }

    /// Submit without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Device::submit`] minus `Timeout`.
    pub fn submit_async(&self, target: Target, commands: &CommandBuffer) -> Result<FenceTicket> {
        self.ensure_running()?;
        self.with_endpoint(target, |ep| ep.submitter.submit_async(commands.as_bytes()))
    }

    /// Wait for a ticket from [`Device::submit_async`].
    ///
    /// # Errors
    ///
    /// `FirmwareAborted`, `Timeout`, or `NotFound` for an unknown context.
    pub fn wait(&self, target: Target, ticket: FenceTicket) -> Result<()> {
        self.with_endpoint(target, |ep| {
            ep.submitter.wait_fence(
                ticket.value(),
                self.config.poll_interval,
                self.config.submit_timeout,
            )
        })
    }

    /// Allocate device memory in the device's address space.
    ///
    /// # Errors
    ///
    /// Allocation errors.
    pub fn alloc(&self, size: usize, access: Access) -> Result<DmaRegion> {
        self.memory.alloc_map(size, access, self.config.asid)
    }

    /// Hand `region` to a resource table, returning its id.
    ///
    /// Firmware can use the id after the next [`Device::update_resources`].
    ///
    /// # Errors
    ///
    /// `FirmwareAborted` while aborted or recovering, `NotFound` for an
    /// unknown context, and every [`ResourceTable::add`] error.
    pub fn register_resource(&self, target: Target, region: DmaRegion, read_only: bool) -> Result<u32> {
        self.ensure_usable()?;
        self.with_endpoint(target, |ep| ep.lock_table().add(region, read_only))
    }

    /// Register memory owned elsewhere.
    ///
    /// # Errors
    ///
    /// Same as [`Device::register_resource`].
    pub fn register_borrowed(&self, target: Target, handle: DmaHandle, read_only: bool) -> Result<u32> {
        self.ensure_usable()?;
        self.with_endpoint(target, |ep| ep.lock_table().add_borrowed(handle, read_only))
    }

    /// Drop a resource id, freeing its memory if the table owns it.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for driver-internal ids, `NotFound` for unknown
    /// ids or contexts, `FirmwareAborted` while aborted or recovering.
    pub fn unregister_resource(&self, target: Target, id: u32) -> Result<()> {
        self.ensure_usable()?;
        self.with_endpoint(target, |ep| {
            if ep.is_internal(id) {
                return Err(PvaError::invalid_argument(format!(
                    "resource {id} is reserved by the driver"
                )));
            }
            ep.lock_table().remove(id)
        })
    }

    /// Push a table's current state to firmware.
    ///
    /// Table updates are privileged, so context tables are updated through
    /// the device queue as well. The table lock is released before the
    /// submission waits, so shared-buffer processing (which takes the same
    /// lock) keeps draining unregister requests meanwhile.
    ///
    /// # Errors
    ///
    /// `FirmwareAborted`, `NotFound`, and submission errors. On a failed
    /// submission the table stays dirty.
    pub fn update_resources(&self, target: Target) -> Result<()> {
        self.ensure_running()?;
        self.with_endpoint(target, |ep| {
            let (table_id, command) = {
                let mut table = ep.lock_table();
                (table.table_id(), table.prepare_update())
            };
            if let Err(e) = self.endpoint.submitter.submit(&command) {
                ep.lock_table().mark_dirty();
                return Err(e);
            }
            tracing::debug!("Resource table {table_id} synchronised");
            Ok(())
        })
    }

    /// Run `f` on a locked resource table.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown context, or whatever `f` returns.
    pub fn with_resources<R>(
        &self,
        target: Target,
        f: impl FnOnce(&mut ResourceTable) -> Result<R>,
    ) -> Result<R> {
        self.with_endpoint(target, |ep| f(&mut ep.lock_table()))
    }

    /// Set the firmware trace level. Applied now if firmware is running,
    /// otherwise at the next bring-up.
    ///
    /// # Errors
    ///
    /// `FirmwareAborted` while aborted or recovering, submission errors.
    pub fn set_trace_level(&self, level: u32) -> Result<()> {
        self.ensure_usable()?;
        lock(&self.settings).trace_level = Some(level);
        self.apply_now(&Command::SetTraceLevel { level })
    }

    /// Enable (`Some(filter)`) or disable (`None`) firmware profiling.
    /// Deferred like [`Device::set_trace_level`].
    ///
    /// # Errors
    ///
    /// `FirmwareAborted` while aborted or recovering, submission errors.
    pub fn set_profiling(&self, filter: Option<u32>) -> Result<()> {
        self.ensure_usable()?;
        lock(&self.settings).profiling = filter;
        let command = match filter {
            Some(filter) => Command::EnableFwProfiling { filter },
            None => Command::DisableFwProfiling,
        };
        self.apply_now(&command)
    }

    fn apply_now(&self, command: &Command) -> Result<()> {
        if self.state() != DeviceState::Running {
            tracing::debug!("Deferring {command:?} until firmware runs");
            return Ok(());
        }
        self.endpoint.submitter.submit(&command.encode())
    }

    /// Service an interrupt raised on `interface`.
    ///
    /// Ignored while interrupts are disabled (firmware stopped or aborted).
    ///
    /// # Errors
    ///
    /// Errors of the bound handler.
    pub fn service_interrupt(&self, interface: u8) -> Result<ProcessStats> {
        if !self.health.interrupts_enabled() {
            tracing::debug!("Interrupt on interface {interface} while disabled");
            return Ok(ProcessStats::default());
        }
        self.irq.dispatch(interface)
    }

    /// Service every interrupt the backend has raised.
    ///
    /// # Errors
    ///
    /// The first handler error; remaining interrupts are still serviced.
    pub fn service_interrupts(&self) -> Result<ProcessStats> {
        let mut total = ProcessStats::default();
        let mut first_error = None;
        for interface in self.backend.take_interrupts() {
            match self.service_interrupt(interface) {
                Ok(stats) => {
                    total.dispatched += stats.dispatched;
                    total.unregistered += stats.unregistered;
                    total.overflowed |= stats.overflowed;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(total), Err)
    }

    /// Events logged by a channel since the last call.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown context.
    pub fn take_events(&self, target: Target) -> Result<Vec<FirmwareMessage>> {
        self.with_endpoint(target, |ep| Ok(ep.events.take_events()))
    }

    /// Chunks on loan in a target's pool.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown context.
    pub fn outstanding_chunks(&self, target: Target) -> Result<usize> {
        self.with_endpoint(target, |ep| Ok(ep.submitter.outstanding_chunks()))
    }

    /// Last fence value firmware wrote for a target.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown context.
    pub fn fence_value(&self, target: Target) -> Result<u32> {
        self.with_endpoint(target, |ep| Ok(ep.submitter.fence_value()))
    }

    /// Contexts currently open.
    pub fn open_contexts(&self) -> usize {
        lock(&self.contexts).len()
    }

    /// Contexts waiting for firmware to let go of them.
    pub fn deferred_contexts(&self) -> usize {
        self.deferred_count.load(Ordering::SeqCst)
    }

    /// Configuration the device was created with.
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Chip family.
    pub const fn chip(&self) -> ChipFamily {
        self.config.chip
    }

    /// Device-memory allocator.
    pub fn memory(&self) -> &dyn DeviceMemory {
        self.memory.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedFirmware;
    use crate::dma::HostDmaAllocator;

    fn setup(config: DeviceConfig) -> (Device, Arc<SimulatedFirmware>) {
        let memory = HostDmaAllocator::new();
        let fw = Arc::new(SimulatedFirmware::new(memory.clone()));
        let config = config.with_wait(Duration::from_micros(50), Duration::from_millis(20));
        let device = Device::create(config, Arc::new(memory), fw.clone()).unwrap();
        (device, fw)
    }

    fn running() -> (Device, Arc<SimulatedFirmware>) {
        let (device, fw) = setup(DeviceConfig::default().with_max_contexts(2));
        device.init_firmware().unwrap();
        (device, fw)
    }

    fn noop() -> CommandBuffer {
        let mut buf = CommandBuffer::new();
        buf.push(&Command::Noop);
        buf
    }

    #[test]
    fn test_bootstrap_announces_table_then_queue() {
        let (device, fw) = setup(DeviceConfig::default());
        assert_eq!(device.state(), DeviceState::Created);
        assert!(!fw.is_running());

        device.init_firmware().unwrap();
        assert_eq!(device.state(), DeviceState::Running);

        let log = fw.ccq_log();
        assert!(matches!(log[0], (0, CcqMessage::InitResourceTable { .. })));
        assert!(matches!(log[1], (0, CcqMessage::InitQueue { queue_id: 0, .. })));
        assert!(fw.has_queue(0));
        assert!(fw.has_shared_buffer(0));
        assert!(fw.table_snapshot(0).is_some());
    }

    #[test]
    fn test_lifecycle_misuse_rejected() {
        let (device, _fw) = setup(DeviceConfig::default());
        assert!(matches!(
            device.submit(Target::Device, &noop()),
            Err(PvaError::InvalidState { .. })
        ));
        assert!(matches!(device.open_context(), Err(PvaError::InvalidState { .. })));
        assert!(matches!(device.deinit_firmware(), Err(PvaError::InvalidState { .. })));

        device.init_firmware().unwrap();
        assert!(matches!(device.init_firmware(), Err(PvaError::InvalidState { .. })));
    }

    #[test]
    fn test_failed_boot_leaves_device_created() {
        let (device, fw) = setup(DeviceConfig::default());
        fw.fail_ccq(true);
        assert!(matches!(device.init_firmware(), Err(PvaError::Timeout { .. })));
        assert_eq!(device.state(), DeviceState::Created);
        assert!(!fw.is_running());

        fw.fail_ccq(false);
        device.init_firmware().unwrap();
        assert_eq!(device.state(), DeviceState::Running);
    }

    #[test]
    fn test_device_submit_completes() {
        let (device, fw) = running();
        let before = device.fence_value(Target::Device).unwrap();
        device.submit(Target::Device, &noop()).unwrap();
        assert_eq!(device.fence_value(Target::Device).unwrap(), before.wrapping_add(1));
        assert!(fw.commands_executed() >= 2);
    }

    #[test]
    fn test_context_open_close_recycles_interface() {
        let (device, fw) = running();
        let ctx = device.open_context().unwrap();
        assert_eq!(ctx.interface(), 1);
        assert!(fw.has_queue(1));
        assert!(fw.has_shared_buffer(1));
        assert!(fw.table_snapshot(1).is_some());

        device.submit(ctx.into(), &noop()).unwrap();

        device.close_context(ctx).unwrap();
        assert!(!fw.has_queue(1));
        assert!(!fw.has_shared_buffer(1));
        assert!(fw.table_snapshot(1).is_none());
        assert_eq!(device.open_contexts(), 0);
        assert_eq!(device.deferred_contexts(), 0);

        assert_eq!(device.open_context().unwrap(), ctx);
        assert!(matches!(device.close_context(ContextId(7)), Err(PvaError::NotFound { .. })));
    }

    #[test]
    fn test_context_limit() {
        let (device, _fw) = running();
        let a = device.open_context().unwrap();
        let b = device.open_context().unwrap();
        assert_ne!(a, b);
        assert!(matches!(device.open_context(), Err(PvaError::OutOfResources { .. })));
    }

    #[test]
    fn test_unreachable_firmware_defers_context() {
        let (device, fw) = running();
        let ctx = device.open_context().unwrap();

        fw.hang(true);
        device.close_context(ctx).unwrap();
        assert_eq!(device.open_contexts(), 0);
        assert_eq!(device.deferred_contexts(), 1);

        fw.hang(false);
        device.recover().unwrap();
        assert_eq!(device.deferred_contexts(), 0);
        assert_eq!(device.open_context().unwrap(), ctx);
    }

    #[test]
    fn test_aborted_device_fails_fast_until_recovered() {
        let (device, fw) = running();
        let ctx = device.open_context().unwrap();

        device.abort("test");
        assert_eq!(device.state(), DeviceState::Aborted);
        assert_eq!(device.abort_reason().as_deref(), Some("test"));
        assert!(matches!(
            device.submit(ctx.into(), &noop()),
            Err(PvaError::FirmwareAborted)
        ));
        assert!(matches!(device.set_trace_level(1), Err(PvaError::FirmwareAborted)));

        device.recover().unwrap();
        assert_eq!(device.state(), DeviceState::Running);
        assert_eq!(fw.boots(), 2);
        assert!(fw.has_queue(ctx.interface()));
        device.submit(ctx.into(), &noop()).unwrap();
    }

    #[test]
    fn test_internal_resources_cannot_be_unregistered() {
        let (device, _fw) = running();
        let internal = device
            .with_resources(Target::Device, |t| Ok(t.ids().collect::<Vec<_>>()))
            .unwrap();
        assert_eq!(internal.len(), crate::config::INTERNAL_RESOURCES);
        for id in internal {
            assert!(matches!(
                device.unregister_resource(Target::Device, id),
                Err(PvaError::InvalidArgument { .. })
            ));
        }

        let region = device.alloc(128, Access::ReadWrite).unwrap();
        let id = device.register_resource(Target::Device, region, false).unwrap();
        device.update_resources(Target::Device).unwrap();
        device.unregister_resource(Target::Device, id).unwrap();
        assert!(matches!(
            device.unregister_resource(Target::Device, id),
            Err(PvaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_settings_replayed_at_boot() {
        let (device, fw) = setup(DeviceConfig::default());
        device.set_trace_level(1).unwrap();
        device.set_profiling(Some(0x3)).unwrap();

        device.init_firmware().unwrap();
        assert_eq!(fw.trace_level(), 1);
        assert_eq!(fw.profiling(), Some(0x3));

        device.set_profiling(None).unwrap();
        assert_eq!(fw.profiling(), None);

        device.recover().unwrap();
        assert_eq!(fw.trace_level(), 1);
        assert_eq!(fw.profiling(), None);
    }

    #[test]
    fn test_interrupts_deliver_events() {
        let (device, fw) = running();
        let event = FirmwareMessage::FwEvent { timestamp: 1, event_id: 0x42, arg: 7 };
        assert!(fw.post_message(0, &event));

        let stats = device.service_interrupts().unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(device.take_events(Target::Device).unwrap(), vec![event]);
    }

    #[test]
    fn test_context_overflow_aborts_device() {
        let (device, fw) = setup(
            DeviceConfig::default()
                .with_max_contexts(1)
                .with_shared_buffer(32, 2),
        );
        device.init_firmware().unwrap();
        let ctx = device.open_context().unwrap();

        let event = FirmwareMessage::FwEvent { timestamp: 1, event_id: 1, arg: 0 };
        while fw.post_message(ctx.interface(), &event) {}

        assert!(matches!(device.service_interrupts(), Err(PvaError::FirmwareAborted)));
        assert_eq!(device.state(), DeviceState::Aborted);
        assert!(device.abort_reason().is_some());
    }

    #[test]
    fn test_destroy_waits_for_open_contexts() {
        let (device, fw) = running();
        let device = Arc::new(device);
        let ctx = device.open_context().unwrap();

        let closer = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                device.close_context(ctx).unwrap();
            })
        };
        device.destroy().unwrap();
        closer.join().unwrap();

        assert_eq!(device.state(), DeviceState::Destroyed);
        assert_eq!(device.open_contexts(), 0);
        assert!(!fw.is_running());
        assert!(matches!(device.destroy(), Err(PvaError::InvalidState { .. })));
    }

    #[test]
    fn test_unregister_frees_owned_region() {
        let memory = HostDmaAllocator::new();
        let fw = Arc::new(SimulatedFirmware::new(memory.clone()));
        let config = DeviceConfig::default().with_wait(Duration::from_micros(50), Duration::from_millis(20));
        let device = Device::create(config, Arc::new(memory.clone()), fw).unwrap();
        device.init_firmware().unwrap();

        let before = memory.live_regions();
        let region = device.alloc(256, Access::ReadWrite).unwrap();
        let id = device.register_resource(Target::Device, region, false).unwrap();
        assert_eq!(memory.live_regions(), before + 1);

        device.unregister_resource(Target::Device, id).unwrap();
        assert_eq!(memory.live_regions(), before);
        let live = device
            .with_resources(Target::Device, |t| Ok(t.contains(id)))
            .unwrap();
        assert!(!live);
    }

    #[test]
    fn test_table_unlocked_while_update_waits() {
        let memory = HostDmaAllocator::new();
        let fw = Arc::new(SimulatedFirmware::new(memory.clone()));
        let config = DeviceConfig::default().with_wait(Duration::from_micros(50), Duration::from_millis(300));
        let device = Arc::new(Device::create(config, Arc::new(memory), fw.clone()).unwrap());
        device.init_firmware().unwrap();
        let region = device.alloc(64, Access::ReadWrite).unwrap();
        device.register_resource(Target::Device, region, false).unwrap();

        fw.hang(true);
        let updater = {
            let device = device.clone();
            std::thread::spawn(move || device.update_resources(Target::Device))
        };
        std::thread::sleep(Duration::from_millis(20));

        // The table is reachable while the update is still polling its fence.
        let len = device.with_resources(Target::Device, |t| Ok(t.len())).unwrap();
        assert!(!updater.is_finished());
        assert!(len > 0);

        assert!(matches!(updater.join().unwrap(), Err(PvaError::Timeout { .. })));
        let dirty = device
            .with_resources(Target::Device, |t| Ok(t.is_dirty()))
            .unwrap();
        assert!(dirty);
    }
}
