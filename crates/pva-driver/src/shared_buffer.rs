//! Firmware → host event channel.
//!
//! ```text
//!   0x00  flags         bit 0: overflow (set by firmware, cleared by host)
//!   0x04  element_size
//!   0x08  head          host-owned byte offset into the body
//!   0x0C  tail          firmware-owned byte offset into the body
//!   0x10  body          element_size * entry_count bytes, used as a byte ring
//! ```
//!
//! Messages carry their own `{type, size}` header and may wrap across the
//! end of the body. One byte of the body is always left free so that
//! `head == tail` means empty.
//!
//! Every field firmware writes is re-validated on each read. A
//! message that does not fit the published bytes is a protocol violation:
//! the rest of the ring is discarded and the device is aborted.

use crate::ccq::{push_message, CommandFifo};
use crate::dma::{Access, DeviceMemory, DmaHandle, DmaRegion};
use crate::error::{PvaError, Result};
use crate::health::DeviceHealth;
use crate::interrupt::{InterruptHandler, InterruptTable};
use crate::resource::ResourceTable;
use pva_chip::ccq::CcqMessage;
use pva_chip::layout::{
    SHARED_BUFFER_ELEMENT_SIZE, SHARED_BUFFER_FLAGS, SHARED_BUFFER_HEAD,
    SHARED_BUFFER_HEADER_BYTES, SHARED_BUFFER_OVERFLOW, SHARED_BUFFER_TAIL,
};
use pva_chip::msg::{FirmwareMessage, MessageError, MSG_HEADER_BYTES};
use std::collections::VecDeque;
use std::ops::DerefMut;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Smallest accepted element size (one VPU execution trace).
pub const MIN_ELEMENT_SIZE: usize = 32;

/// Decoded events kept for [`SharedBuffer::take_events`]; older ones are dropped.
pub const EVENT_LOG_CAPACITY: usize = 256;

/// The lock that serialises draining against resource-table mutation.
///
/// The caller decides what the lock is; the buffer only needs the guard to
/// reach the resource table so unregister requests can be applied without
/// locking a second time.
pub trait LockDomain: Send + Sync {
    /// Guard type, giving mutable access to the table while held.
    type Guard<'a>: DerefMut<Target = ResourceTable>
    where
        Self: 'a;

    /// Enter the lock domain.
    fn lock(&self) -> Self::Guard<'_>;
}

impl LockDomain for Mutex<ResourceTable> {
    type Guard<'a> = MutexGuard<'a, ResourceTable>;

    fn lock(&self) -> Self::Guard<'_> {
        Mutex::lock(self).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whose events travel over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The device channel. Overflow is logged and draining continues.
    Device,
    /// A per-context channel. A lost unregister request would leak a
    /// resource forever, so overflow aborts the device.
    Context,
}

/// Lifecycle of a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Not yet set up.
    Uninitialized,
    /// Firmware may write messages.
    Initialized,
    /// Being torn down; remaining messages are drained.
    Draining,
    /// Torn down. May be initialised again.
    Deinitialized,
}

/// What one [`SharedBuffer::process`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Messages decoded and dispatched.
    pub dispatched: usize,
    /// Resources dropped on firmware request.
    pub unregistered: usize,
    /// The overflow flag was set (and has been cleared).
    pub overflowed: bool,
}

#[derive(Debug)]
struct Ring {
    region: DmaRegion,
    capacity: usize,
}

#[derive(Debug)]
struct Inner {
    state: BufferState,
    ring: Option<Ring>,
    events: VecDeque<FirmwareMessage>,
    dropped_events: u64,
}

/// One firmware → host event ring.
pub struct SharedBuffer<L: LockDomain> {
    interface: u8,
    kind: ChannelKind,
    domain: Arc<L>,
    health: Arc<DeviceHealth>,
    pinned: Vec<u32>,
    inner: Mutex<Inner>,
}

impl<L: LockDomain> std::fmt::Debug for SharedBuffer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("interface", &self.interface)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<L: LockDomain> SharedBuffer<L> {
    /// Uninitialised buffer for `interface`, draining under `domain`.
    pub fn new(interface: u8, kind: ChannelKind, domain: Arc<L>, health: Arc<DeviceHealth>) -> Self {
        Self {
            interface,
            kind,
            domain,
            health,
            pinned: Vec::new(),
            inner: Mutex::new(Inner {
                state: BufferState::Uninitialized,
                ring: None,
                events: VecDeque::new(),
                dropped_events: 0,
            }),
        }
    }

    /// Resource ids firmware may not unregister (driver-internal memory).
    #[must_use]
    pub fn with_pinned(mut self, ids: &[u32]) -> Self {
        self.pinned = ids.to_vec();
        self
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the ring, bind the interrupt handler and tell firmware
    /// where the ring is.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the buffer is uninitialised or torn
    /// down, `InvalidArgument` for a bad geometry (element size not a
    /// multiple of 8 or below [`MIN_ELEMENT_SIZE`], zero entries), or the
    /// allocation / CCQ error. Nothing stays bound or allocated on error.
    pub fn init(
        self: &Arc<Self>,
        element_size: usize,
        entry_count: usize,
        memory: &dyn DeviceMemory,
        asid: u32,
        fifo: &dyn CommandFifo,
        irq: &InterruptTable,
    ) -> Result<()>
    where
        L: 'static,
    {
        let previous = self.state();
        if !matches!(previous, BufferState::Uninitialized | BufferState::Deinitialized) {
            return Err(PvaError::invalid_state(format!(
                "shared buffer {} is {previous:?}",
                self.interface
            )));
        }
        if element_size < MIN_ELEMENT_SIZE || element_size % 8 != 0 || entry_count == 0 {
            return Err(PvaError::invalid_argument(format!(
                "shared buffer geometry {entry_count} x {element_size}"
            )));
        }
        let capacity = element_size
            .checked_mul(entry_count)
            .filter(|&c| u32::try_from(c + SHARED_BUFFER_HEADER_BYTES).is_ok())
            .ok_or_else(|| PvaError::invalid_argument("shared buffer too large"))?;
        let total = capacity + SHARED_BUFFER_HEADER_BYTES;

        let region = memory.alloc_map(total, Access::ReadWrite, asid)?;
        let iova = region.iova();
        region.write_u32(SHARED_BUFFER_FLAGS, 0);
        #[allow(clippy::cast_possible_truncation)] // checked against u32 above
        let element_word = element_size as u32;
        region.write_u32(SHARED_BUFFER_ELEMENT_SIZE, element_word);
        region.write_u32(SHARED_BUFFER_HEAD, 0);
        region.write_u32(SHARED_BUFFER_TAIL, 0);

        {
            let mut inner = self.lock_inner();
            inner.ring = Some(Ring { region, capacity });
            inner.state = BufferState::Initialized;
        }
        irq.bind(self.interface, self.clone());

        #[allow(clippy::cast_possible_truncation)]
        let message = CcqMessage::InitSharedBuffer {
            interface: self.interface,
            iova,
            size: total as u32,
        };
        if let Err(e) = push_message(fifo, self.interface, &message) {
            irq.unbind(self.interface);
            let mut inner = self.lock_inner();
            inner.ring = None;
            inner.state = previous;
            return Err(e);
        }

        tracing::info!(
            "Shared buffer {}: {entry_count} x {element_size} bytes at {iova:#x}",
            self.interface
        );
        Ok(())
    }

    /// Drain every message firmware has published.
    ///
    /// Safe to call at any time; returns immediately with empty stats when
    /// there is nothing to do or the buffer is not initialised.
    ///
    /// # Errors
    ///
    /// - `FirmwareAborted` if the device is aborted, or if a per-context
    ///   channel overflowed (the device is aborted first)
    /// - `ProtocolViolation` if firmware published an inconsistent ring;
    ///   the device is aborted
    pub fn process(&self) -> Result<ProcessStats> {
        let mut table = self.domain.lock();
        let mut inner = self.lock_inner();
        if !matches!(inner.state, BufferState::Initialized | BufferState::Draining) {
            return Ok(ProcessStats::default());
        }
        if self.health.is_aborted() {
            return Err(PvaError::FirmwareAborted);
        }

        let Inner {
            ring: Some(ring),
            events,
            dropped_events,
            ..
        } = &mut *inner
        else {
            return Ok(ProcessStats::default());
        };

        let mut stats = ProcessStats::default();
        if ring.region.read_u32(SHARED_BUFFER_FLAGS) & SHARED_BUFFER_OVERFLOW != 0 {
            ring.region.clear_bits_u32(SHARED_BUFFER_FLAGS, SHARED_BUFFER_OVERFLOW);
            stats.overflowed = true;
            tracing::warn!("Shared buffer {}: firmware messages lost to overflow", self.interface);
            if self.kind == ChannelKind::Context {
                self.health.abort(&format!(
                    "shared buffer overflow on context interface {}",
                    self.interface
                ));
                return Err(PvaError::FirmwareAborted);
            }
        }

        let mut sink = Sink {
            table: &mut *table,
            pinned: &self.pinned,
            events,
            dropped_events,
            stats: &mut stats,
        };
        if let Err(e) = drain(ring, &mut sink) {
            self.health.abort(&format!("shared buffer {}: {e}", self.interface));
            return Err(e);
        }
        Ok(stats)
    }

    /// Tear the buffer down.
    ///
    /// Firmware is told to stop writing (best effort, it may be gone), the
    /// interrupt handler is unbound, whatever is left is drained and the
    /// ring is freed. A no-op unless initialised.
    pub fn deinit(&self, fifo: &dyn CommandFifo, irq: &InterruptTable) {
        {
            let mut inner = self.lock_inner();
            if inner.state != BufferState::Initialized {
                return;
            }
            inner.state = BufferState::Draining;
        }

        let message = CcqMessage::DeinitSharedBuffer {
            interface: self.interface,
        };
        if let Err(e) = push_message(fifo, self.interface, &message) {
            tracing::warn!("Shared buffer {}: deinit not acknowledged: {e}", self.interface);
        }
        irq.unbind(self.interface);

        match self.process() {
            Ok(stats) if stats.dispatched > 0 => tracing::debug!(
                "Shared buffer {}: drained {} message(s) on teardown",
                self.interface,
                stats.dispatched
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Shared buffer {}: final drain failed: {e}", self.interface),
        }

        let mut inner = self.lock_inner();
        inner.ring = None;
        inner.state = BufferState::Deinitialized;
        tracing::info!("Shared buffer {} deinitialised", self.interface);
    }

    /// Remove and return the logged events, oldest first.
    pub fn take_events(&self) -> Vec<FirmwareMessage> {
        self.lock_inner().events.drain(..).collect()
    }

    /// Events discarded because the log was full.
    pub fn dropped_events(&self) -> u64 {
        self.lock_inner().dropped_events
    }

    /// Current state.
    pub fn state(&self) -> BufferState {
        self.lock_inner().state
    }

    /// Interface (CCQ) this buffer belongs to.
    pub const fn interface(&self) -> u8 {
        self.interface
    }

    /// Channel kind.
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Device address of the ring header, while allocated.
    pub fn iova(&self) -> Option<u64> {
        self.lock_inner().ring.as_ref().map(|r| r.region.iova())
    }

    /// Body capacity in bytes, while allocated.
    pub fn capacity(&self) -> Option<usize> {
        self.lock_inner().ring.as_ref().map(|r| r.capacity)
    }
}

impl<L: LockDomain> InterruptHandler for SharedBuffer<L> {
    fn handle(&self) -> Result<ProcessStats> {
        self.process()
    }
}

struct Sink<'a> {
    table: &'a mut ResourceTable,
    pinned: &'a [u32],
    events: &'a mut VecDeque<FirmwareMessage>,
    dropped_events: &'a mut u64,
    stats: &'a mut ProcessStats,
}

impl Sink<'_> {
    fn dispatch(&mut self, message: FirmwareMessage) {
        self.stats.dispatched += 1;
        match message {
            FirmwareMessage::ResourceUnregister { resource_id } => {
                if self.pinned.contains(&resource_id) {
                    tracing::warn!("Firmware asked to unregister internal resource {resource_id}");
                } else if let Err(e) = self.table.remove(resource_id) {
                    tracing::warn!("Unregister request ignored: {e}");
                } else {
                    self.stats.unregistered += 1;
                }
            }
            other => tracing::trace!("Firmware event: {other:?}"),
        }
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
            *self.dropped_events += 1;
        }
        self.events.push_back(message);
    }
}

fn drain(ring: &Ring, sink: &mut Sink<'_>) -> Result<()> {
    let cap = ring.capacity;
    let region = &ring.region;
    let mut head = region.read_u32(SHARED_BUFFER_HEAD) as usize;
    let tail = region.read_u32(SHARED_BUFFER_TAIL) as usize;

    let discard = |reason: String| {
        region.write_u32(SHARED_BUFFER_HEAD, region.read_u32(SHARED_BUFFER_TAIL));
        Err(PvaError::protocol_violation(reason))
    };

    if head >= cap || tail >= cap {
        return discard(format!("head {head} / tail {tail} outside ring of {cap} bytes"));
    }

    while head != tail {
        let used = (tail + cap - head) % cap;
        if used < MSG_HEADER_BYTES {
            return discard(format!("{used} trailing bytes at offset {head}"));
        }
        let header = read_wrapped(region, cap, head, MSG_HEADER_BYTES);
        let raw_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size < MSG_HEADER_BYTES || size > used {
            return discard(format!(
                "message at offset {head} claims {size} bytes, {used} published"
            ));
        }

        let payload = read_wrapped(
            region,
            cap,
            (head + MSG_HEADER_BYTES) % cap,
            size - MSG_HEADER_BYTES,
        );
        match FirmwareMessage::decode(raw_type, &payload) {
            Ok(message) => sink.dispatch(message),
            Err(MessageError::UnknownType(ty)) => {
                tracing::warn!("Skipping unknown firmware message type {ty} ({size} bytes)");
            }
            Err(e) => return discard(format!("message at offset {head}: {e}")),
        }

        head = (head + size) % cap;
        #[allow(clippy::cast_possible_truncation)] // head < cap <= u32::MAX
        let head_word = head as u32;
        region.write_u32(SHARED_BUFFER_HEAD, head_word);
    }
    Ok(())
}

fn read_wrapped(region: &DmaHandle, cap: usize, pos: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let first = len.min(cap - pos);
    region.read_bytes(SHARED_BUFFER_HEADER_BYTES + pos, &mut out[..first]);
    if first < len {
        region.read_bytes(SHARED_BUFFER_HEADER_BYTES, &mut out[first..]);
    }
    out
}

/// Producer side of the ring, as firmware writes it.
///
/// Appends `message` at `tail` (wrapping) and publishes the new tail. When
/// the message does not fit, or the ring indices are corrupt, the overflow
/// flag is set instead and `false` is returned.
pub fn produce(ring: &DmaHandle, message: &[u8]) -> bool {
    let Some(cap) = ring.len().checked_sub(SHARED_BUFFER_HEADER_BYTES) else {
        return false;
    };
    let head = ring.read_u32(SHARED_BUFFER_HEAD) as usize;
    let tail = ring.read_u32(SHARED_BUFFER_TAIL) as usize;
    if cap == 0 || head >= cap || tail >= cap {
        ring.fetch_or_u32(SHARED_BUFFER_FLAGS, SHARED_BUFFER_OVERFLOW);
        return false;
    }

    let used = (tail + cap - head) % cap;
    if message.len() > cap - used - 1 {
        ring.fetch_or_u32(SHARED_BUFFER_FLAGS, SHARED_BUFFER_OVERFLOW);
        return false;
    }

    let first = message.len().min(cap - tail);
    ring.write_bytes(SHARED_BUFFER_HEADER_BYTES + tail, &message[..first]);
    if first < message.len() {
        ring.write_bytes(SHARED_BUFFER_HEADER_BYTES, &message[first..]);
    }
    #[allow(clippy::cast_possible_truncation)]
    let tail_word = ((tail + message.len()) % cap) as u32;
    ring.write_u32(SHARED_BUFFER_TAIL, tail_word);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDmaAllocator;
    use pva_chip::ccq::{CcqDecoder, CcqOpcode};

    #[derive(Debug, Default)]
    struct Ccq {
        messages: Mutex<Vec<CcqMessage>>,
        decoder: Mutex<CcqDecoder>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CommandFifo for Ccq {
        fn push_word(&self, _interface: u8, word: u64) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PvaError::timeout(std::time::Duration::from_millis(1)));
            }
            if let Some(msg) = self.decoder.lock().unwrap().push(word).unwrap() {
                self.messages.lock().unwrap().push(msg);
            }
            Ok(())
        }
    }

    struct Rig {
        mem: HostDmaAllocator,
        table: Arc<Mutex<ResourceTable>>,
        health: Arc<DeviceHealth>,
        ccq: Ccq,
        irq: InterruptTable,
    }

    impl Rig {
        fn new() -> Self {
            let mem = HostDmaAllocator::new();
            let table = ResourceTable::for_context(&mem, 1, 8, 0).unwrap();
            Self {
                table: Arc::new(Mutex::new(table)),
                mem,
                health: Arc::new(DeviceHealth::new()),
                ccq: Ccq::default(),
                irq: InterruptTable::new(),
            }
        }

        fn buffer(
            &self,
            kind: ChannelKind,
            element: usize,
            entries: usize,
        ) -> Arc<SharedBuffer<Mutex<ResourceTable>>> {
            let buf = Arc::new(SharedBuffer::new(1, kind, self.table.clone(), self.health.clone()));
            buf.init(element, entries, &self.mem, 0, &self.ccq, &self.irq).unwrap();
            buf
        }

        fn firmware_view(&self, buf: &SharedBuffer<Mutex<ResourceTable>>) -> DmaHandle {
            let len = buf.capacity().unwrap() + SHARED_BUFFER_HEADER_BYTES;
            self.mem.resolve(buf.iova().unwrap(), len).unwrap()
        }
    }

    fn event(n: u32) -> Vec<u8> {
        FirmwareMessage::FwEvent { timestamp: u64::from(n), event_id: n, arg: 0 }.encode()
    }

    #[test]
    fn test_init_announces_ring() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        assert_eq!(buf.state(), BufferState::Initialized);
        assert!(rig.irq.is_bound(1));

        let messages = rig.ccq.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].opcode(), CcqOpcode::InitSharedBuffer);
        assert_eq!(
            messages[0],
            CcqMessage::InitSharedBuffer { interface: 1, iova: buf.iova().unwrap(), size: 144 }
        );
        let fw = rig.firmware_view(&buf);
        assert_eq!(fw.read_u32(SHARED_BUFFER_ELEMENT_SIZE), 32);
    }

    #[test]
    fn test_second_process_dispatches_nothing() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 64, 4);
        let fw = rig.firmware_view(&buf);
        for n in 0..3 {
            assert!(produce(&fw, &event(n)));
        }

        let first = buf.process().unwrap();
        assert_eq!(first.dispatched, 3);
        let second = buf.process().unwrap();
        assert_eq!(second, ProcessStats::default());
        assert_eq!(fw.read_u32(SHARED_BUFFER_HEAD), fw.read_u32(SHARED_BUFFER_TAIL));
        assert_eq!(buf.take_events().len(), 3);
    }

    #[test]
    fn test_messages_wrap_around_the_body() {
        let rig = Rig::new();
        // 64-byte body, 24-byte messages: every few rounds a message wraps.
        let buf = rig.buffer(ChannelKind::Device, 32, 2);
        let fw = rig.firmware_view(&buf);
        for n in 0..20 {
            assert!(produce(&fw, &event(n)));
            assert!(produce(&fw, &event(n + 100)));
            assert_eq!(buf.process().unwrap().dispatched, 2);
        }
        let events = buf.take_events();
        assert_eq!(events.len(), 40);
        assert_eq!(
            events[39],
            FirmwareMessage::FwEvent { timestamp: 119, event_id: 119, arg: 0 }
        );
    }

    #[test]
    fn test_device_overflow_is_logged_and_drained() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 2);
        let fw = rig.firmware_view(&buf);
        let mut written = 0;
        while produce(&fw, &event(written)) {
            written += 1;
        }
        assert_eq!(written, 2);
        assert_ne!(fw.read_u32(SHARED_BUFFER_FLAGS) & SHARED_BUFFER_OVERFLOW, 0);

        let stats = buf.process().unwrap();
        assert!(stats.overflowed);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(fw.read_u32(SHARED_BUFFER_FLAGS) & SHARED_BUFFER_OVERFLOW, 0);
        assert!(!rig.health.is_aborted());
    }

    #[test]
    fn test_context_overflow_aborts_device() {
        let rig = Rig::new();
        rig.health.reset();
        let buf = rig.buffer(ChannelKind::Context, 32, 2);
        let fw = rig.firmware_view(&buf);
        for n in 0..5 {
            produce(&fw, &event(n));
        }

        assert!(matches!(buf.process(), Err(PvaError::FirmwareAborted)));
        assert!(rig.health.is_aborted());
        assert!(!rig.health.interrupts_enabled());
        assert!(matches!(buf.process(), Err(PvaError::FirmwareAborted)));
    }

    #[test]
    fn test_unregister_drops_from_locked_table() {
        let rig = Rig::new();
        let pinned = {
            let mut table = rig.table.lock().unwrap();
            table.add(rig.mem.alloc_map(64, Access::ReadWrite, 0).unwrap(), false).unwrap()
        };
        let user = {
            let mut table = rig.table.lock().unwrap();
            table.add(rig.mem.alloc_map(64, Access::ReadWrite, 0).unwrap(), false).unwrap()
        };
        let buf = Arc::new(
            SharedBuffer::new(1, ChannelKind::Context, rig.table.clone(), rig.health.clone())
                .with_pinned(&[pinned]),
        );
        buf.init(32, 4, &rig.mem, 0, &rig.ccq, &rig.irq).unwrap();
        let fw = rig.firmware_view(&buf);

        for id in [user, pinned, 99] {
            assert!(produce(&fw, &FirmwareMessage::ResourceUnregister { resource_id: id }.encode()));
        }
        let stats = rig.irq.dispatch(1).unwrap();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.unregistered, 1);

        let table = rig.table.lock().unwrap();
        assert!(!table.contains(user));
        assert!(table.contains(pinned));
    }

    #[test]
    fn test_oversized_message_is_protocol_violation() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        let fw = rig.firmware_view(&buf);
        let mut bogus = event(1);
        bogus[4..8].copy_from_slice(&200u32.to_le_bytes());
        assert!(produce(&fw, &bogus));

        assert!(matches!(buf.process(), Err(PvaError::ProtocolViolation { .. })));
        assert_eq!(fw.read_u32(SHARED_BUFFER_HEAD), fw.read_u32(SHARED_BUFFER_TAIL));
        assert!(rig.health.is_aborted());
    }

    #[test]
    fn test_corrupt_tail_is_protocol_violation() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        let fw = rig.firmware_view(&buf);
        fw.write_u32(SHARED_BUFFER_TAIL, 4096);
        assert!(matches!(buf.process(), Err(PvaError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        let fw = rig.firmware_view(&buf);
        let mut unknown = event(1);
        unknown[0..4].copy_from_slice(&0x55u32.to_le_bytes());
        assert!(produce(&fw, &unknown));
        assert!(produce(&fw, &event(2)));

        let stats = buf.process().unwrap();
        assert_eq!(stats.dispatched, 1);
        assert!(!rig.health.is_aborted());
    }

    #[test]
    fn test_deinit_drains_unbinds_and_frees() {
        let rig = Rig::new();
        let baseline = rig.mem.live_regions();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        let fw = rig.firmware_view(&buf);
        assert!(produce(&fw, &event(7)));
        assert_eq!(rig.mem.live_regions(), baseline + 1);

        buf.deinit(&rig.ccq, &rig.irq);
        assert_eq!(buf.state(), BufferState::Deinitialized);
        assert!(!rig.irq.is_bound(1));
        assert_eq!(rig.mem.live_regions(), baseline);
        assert_eq!(buf.take_events().len(), 1);
        assert_eq!(
            rig.ccq.messages.lock().unwrap().last(),
            Some(&CcqMessage::DeinitSharedBuffer { interface: 1 })
        );

        // Processing after teardown is a no-op.
        assert_eq!(buf.process().unwrap(), ProcessStats::default());
        buf.init(32, 4, &rig.mem, 0, &rig.ccq, &rig.irq).unwrap();
        assert_eq!(buf.state(), BufferState::Initialized);
    }

    #[test]
    fn test_deinit_survives_unreachable_firmware() {
        let rig = Rig::new();
        let buf = rig.buffer(ChannelKind::Device, 32, 4);
        rig.ccq.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        buf.deinit(&rig.ccq, &rig.irq);
        assert_eq!(buf.state(), BufferState::Deinitialized);
    }

    #[test]
    fn test_init_validation_and_rollback() {
        let rig = Rig::new();
        let buf = Arc::new(SharedBuffer::new(
            1,
            ChannelKind::Device,
            rig.table.clone(),
            rig.health.clone(),
        ));
        for (element, entries) in [(16, 4), (36, 4), (32, 0)] {
            assert!(matches!(
                buf.init(element, entries, &rig.mem, 0, &rig.ccq, &rig.irq),
                Err(PvaError::InvalidArgument { .. })
            ));
        }

        let baseline = rig.mem.live_regions();
        rig.ccq.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(buf.init(32, 4, &rig.mem, 0, &rig.ccq, &rig.irq).is_err());
        assert_eq!(buf.state(), BufferState::Uninitialized);
        assert!(!rig.irq.is_bound(1));
        assert_eq!(rig.mem.live_regions(), baseline);

        rig.ccq.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        buf.init(32, 4, &rig.mem, 0, &rig.ccq, &rig.irq).unwrap();
        assert!(matches!(
            buf.init(32, 4, &rig.mem, 0, &rig.ccq, &rig.irq),
            Err(PvaError::InvalidState { .. })
        ));
    }
}
