//! End-to-end tests against the simulated firmware.
//!
//! Every test boots a full device (resource tables, queues, chunk pools,
//! shared buffers) and drives it the way a client would.

use pva_chip::cmd::Command;
use pva_chip::msg::FirmwareMessage;
use pva_driver::backends::simulated::EVENT_COMMAND_ERROR;
use pva_driver::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(50);

fn boot(config: DeviceConfig) -> (Device, Arc<SimulatedFirmware>) {
    let memory = HostDmaAllocator::new();
    let firmware = Arc::new(SimulatedFirmware::new(memory.clone()));
    let config = config.with_wait(Duration::from_micros(50), TIMEOUT);
    let device = Device::create(config, Arc::new(memory), firmware.clone())
        .expect("device creation failed");
    device.init_firmware().expect("firmware bring-up failed");
    (device, firmware)
}

fn noops(count: usize) -> CommandBuffer {
    let mut buf = CommandBuffer::new();
    for _ in 0..count {
        buf.push(&Command::Noop);
    }
    buf
}

/// A command buffer larger than one chunk is chained and fully executed.
#[test]
fn test_multi_chunk_submission() {
    let (device, fw) = boot(DeviceConfig::default().with_chunks(64, 16));
    let ctx = device.open_context().unwrap();
    let before = fw.commands_executed();

    device.submit(ctx.into(), &noops(40)).unwrap();

    // 40 noops plus the fence; link commands are not counted.
    assert_eq!(fw.commands_executed() - before, 41);
    assert_eq!(fw.command_errors(), 0);

    // Chunks come back once the next submission sees the fence.
    device.submit(ctx.into(), &noops(1)).unwrap();
    assert!(device.outstanding_chunks(ctx.into()).unwrap() <= 1);
}

/// Several asynchronous submissions complete in order.
#[test]
fn test_async_submissions() {
    let (device, _fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();

    let tickets: Vec<FenceTicket> = (0..8)
        .map(|_| device.submit_async(ctx.into(), &noops(2)).unwrap())
        .collect();
    let last = *tickets.last().unwrap();
    device.wait(ctx.into(), last).unwrap();

    let fence = device.fence_value(ctx.into()).unwrap();
    assert_eq!(fence, last.value());
}

/// Unbinding a resource makes firmware ask the host to drop it.
#[test]
fn test_firmware_unregister_drops_context_resource() {
    let (device, _fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();

    let region = device.alloc(256, Access::ReadWrite).unwrap();
    let id = device.register_resource(ctx.into(), region, false).unwrap();
    assert!(id >= 64, "context ids start above the device range");
    device.update_resources(ctx.into()).unwrap();

    let mut buf = CommandBuffer::new();
    buf.bind(3, id).unbind(3);
    device.submit(ctx.into(), &buf).unwrap();

    let stats = device.service_interrupts().unwrap();
    assert_eq!(stats.unregistered, 1);
    let still_there = device
        .with_resources(ctx.into(), |t| Ok(t.contains(id)))
        .unwrap();
    assert!(!still_there);
    assert!(device
        .take_events(ctx.into())
        .unwrap()
        .contains(&FirmwareMessage::ResourceUnregister { resource_id: id }));
}

/// A resource must be announced before firmware can use it.
#[test]
fn test_unannounced_resource_faults() {
    let (device, fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();
    let region = device.alloc(64, Access::ReadWrite).unwrap();
    let id = device.register_resource(ctx.into(), region, false).unwrap();

    let mut buf = CommandBuffer::new();
    buf.bind(0, id);
    assert!(matches!(
        device.submit(ctx.into(), &buf),
        Err(PvaError::Timeout { .. })
    ));
    assert_eq!(fw.command_errors(), 1);

    device.service_interrupts().unwrap();
    let events = device.take_events(ctx.into()).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        FirmwareMessage::FwEvent { event_id, .. } if *event_id == EVENT_COMMAND_ERROR
    )));

    // The queue keeps going after a faulting chain.
    device.update_resources(ctx.into()).unwrap();
    device.submit(ctx.into(), &buf).unwrap();
}

/// Contexts may not issue privileged commands.
#[test]
fn test_context_rejects_privileged_commands() {
    let (device, _fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();
    let mut buf = CommandBuffer::new();
    buf.push(&Command::SetTraceLevel { level: 3 });
    assert!(matches!(
        device.submit(ctx.into(), &buf),
        Err(PvaError::InvalidArgument { .. })
    ));
    device.submit(pva_driver::Target::Device, &buf).unwrap();
}

/// A hung firmware times out; work resumes once it catches up.
#[test]
fn test_hung_firmware_times_out_then_recovers() {
    let (device, fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();

    fw.hang(true);
    assert!(matches!(
        device.submit(ctx.into(), &noops(1)),
        Err(PvaError::Timeout { .. })
    ));
    assert_eq!(device.state(), DeviceState::Running);

    fw.hang(false);
    fw.run_pending();
    device.submit(ctx.into(), &noops(1)).unwrap();
}

/// Stopping and restarting firmware re-announces open contexts.
#[test]
fn test_firmware_restart_keeps_contexts() {
    let (device, fw) = boot(DeviceConfig::default());
    let ctx = device.open_context().unwrap();
    device.set_trace_level(1).unwrap();

    device.deinit_firmware().unwrap();
    assert_eq!(device.state(), DeviceState::Created);
    assert!(!fw.is_running());
    assert!(matches!(
        device.submit(ctx.into(), &noops(1)),
        Err(PvaError::InvalidState { .. })
    ));

    device.init_firmware().unwrap();
    assert_eq!(fw.boots(), 2);
    assert_eq!(fw.trace_level(), 1);
    assert!(fw.has_queue(ctx.interface()));
    assert!(fw.has_shared_buffer(ctx.interface()));
    device.submit(ctx.into(), &noops(1)).unwrap();
}

/// Closing while the device is aborted defers the context until recovery.
#[test]
fn test_close_while_aborted_defers() {
    let (device, _fw) = boot(DeviceConfig::default().with_max_contexts(1));
    let ctx = device.open_context().unwrap();

    device.abort("watchdog");
    device.close_context(ctx).unwrap();
    assert_eq!(device.deferred_contexts(), 1);

    device.recover().unwrap();
    assert_eq!(device.deferred_contexts(), 0);
    let again = device.open_context().unwrap();
    assert_eq!(again, ctx);
}

/// Two devices share nothing.
#[test]
fn test_devices_are_independent() {
    let (a, fw_a) = boot(DeviceConfig::default());
    let (b, fw_b) = boot(DeviceConfig::default());

    a.abort("only a");
    assert_eq!(a.state(), DeviceState::Aborted);
    assert_eq!(b.state(), DeviceState::Running);

    let ctx = b.open_context().unwrap();
    b.submit(ctx.into(), &noops(3)).unwrap();
    assert!(!fw_a.has_queue(ctx.interface()));
    assert!(fw_b.has_queue(ctx.interface()));
}

/// Borrowed memory stays with its owner when the resource is dropped.
#[test]
fn test_borrowed_resource() {
    let (device, _fw) = boot(DeviceConfig::default());
    let region = device.alloc(128, Access::ReadOnly).unwrap();
    let id = device
        .register_borrowed(pva_driver::Target::Device, region.handle(), true)
        .unwrap();
    device.update_resources(pva_driver::Target::Device).unwrap();
    device
        .unregister_resource(pva_driver::Target::Device, id)
        .unwrap();
    region.handle().write_u32(0, 0xC0FF_EE00);
    assert_eq!(region.handle().read_u32(0), 0xC0FF_EE00);
}
