//! Loader integration tests: layout round-trip, rejects, and running a
//! loaded executable on the simulated firmware.

use pva_chip::align_up;
use pva_chip::exec::{SymbolType, DATA_ALIGNMENT, ICACHE_SIZE, TEXT_ALIGNMENT};
use pva_chip::soc::ChipFamily;
use pva_chip::vmem;
use pva_driver::{CommandBuffer, Device, DeviceConfig, HostDmaAllocator, SimulatedFirmware, Target};
use pva_vpu::{load, load_for_device, Executable, ImageBuilder, VpuError};
use std::sync::Arc;
use std::time::Duration;

fn two_code_one_data() -> bytes::Bytes {
    ImageBuilder::new()
        .code(".text.main", 0, &[1, 2, 3, 4, 5, 6, 7, 8])
        .code(".text.isr", 0x100, &[0xA, 0xB, 0xC, 0xD])
        .data(".data", 0x4_0000, &[0x5A; 40])
        .export("input", SymbolType::VmemBuffer, 0x4_0100, 0x400)
        .export("output", SymbolType::VmemBuffer, 0x8_0000, 0x400)
        .export("gain", SymbolType::Data, 0x0_0800, 4)
        .build()
}

/// Sections buffer length, code placement and byte order, symbol addresses.
#[test]
fn test_loader_round_trip() {
    let memory = HostDmaAllocator::new();
    let exe = load(two_code_one_data(), &memory, ChipFamily::T23x, 0).unwrap();

    let text_size = 0x104;
    let data_size = 40;
    let expected = align_up(text_size, TEXT_ALIGNMENT) + ICACHE_SIZE + align_up(data_size, DATA_ALIGNMENT);
    let region = exe.sections_region();
    assert_eq!(region.len(), expected);

    let mut word = [0u8; 8];
    region.read_bytes(0, &mut word);
    assert_eq!(word, [4, 3, 2, 1, 8, 7, 6, 5]);
    let mut isr = [0u8; 4];
    region.read_bytes(0x100, &mut isr);
    assert_eq!(isr, [0xD, 0xC, 0xB, 0xA]);

    let mut data = [0u8; 40];
    region.read_bytes(align_up(text_size, TEXT_ALIGNMENT) + ICACHE_SIZE, &mut data);
    assert_eq!(data, [0x5A; 40]);

    let windows = ChipFamily::T23x.vmem_windows();
    assert_eq!(exe.symbols().len(), 3);
    for symbol in exe.symbols() {
        assert!(vmem::in_any(windows, symbol.addr, symbol.size), "{symbol:?}");
    }
}

/// Zero data sections load to an empty data segment.
#[test]
fn test_no_data_sections() {
    let memory = HostDmaAllocator::new();
    let image = ImageBuilder::new().code(".text", 0, &[0; 4]).build();
    let exe = load(image, &memory, ChipFamily::T26x, 0).unwrap();
    assert_eq!(exe.layout().data_size, 0);
    assert!(exe.data_sections().is_empty());
    assert_eq!(exe.sections_region().len(), TEXT_ALIGNMENT + ICACHE_SIZE);
}

#[test]
fn test_rejects_export_past_exports_section() {
    let image = ImageBuilder::new()
        .code(".text", 0, &[0; 4])
        .export("ok", SymbolType::Data, 0x100, 4)
        .dangling_export("broken")
        .build();
    assert!(matches!(
        Executable::parse(image, ChipFamily::T23x),
        Err(VpuError::InvalidFormat { .. })
    ));
}

#[test]
fn test_rejects_image_without_code() {
    let image = ImageBuilder::new().data(".data", 0x4_0000, &[0; 16]).build();
    let memory = HostDmaAllocator::new();
    assert!(matches!(
        load(image, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidFormat { .. })
    ));
    assert_eq!(memory.live_regions(), 0);
}

#[test]
fn test_rejects_export_outside_vmem() {
    let image = ImageBuilder::new()
        .code(".text", 0, &[0; 4])
        .export("huge", SymbolType::VmemBuffer, 0x4_0000, 0x2_0000)
        .build();
    assert!(matches!(
        Executable::parse(image, ChipFamily::T23x),
        Err(VpuError::InvalidArgument { .. })
    ));
}

/// Code must end inside the instruction address space; otherwise the text
/// image would be sized by an arbitrary far address.
#[test]
fn test_rejects_code_past_instruction_space() {
    let memory = HostDmaAllocator::new();
    let far = ImageBuilder::new().code(".text", 0x0400_0000, &[0; 4]).build();
    assert!(matches!(
        load(far, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidFormat { .. })
    ));

    let limit = ChipFamily::T23x.code_address_limit();
    let straddling = ImageBuilder::new().code(".text", limit - 4, &[0; 8]).build();
    assert!(matches!(
        Executable::parse(straddling, ChipFamily::T23x),
        Err(VpuError::InvalidFormat { .. })
    ));
    assert_eq!(memory.live_regions(), 0);

    // The same placement fits the larger T26x instruction space.
    let fits = ImageBuilder::new().code(".text", limit - 4, &[0; 8]).build();
    assert!(Executable::parse(fits, ChipFamily::T26x).is_ok());
}

#[test]
fn test_rejects_data_outside_vmem() {
    let memory = HostDmaAllocator::new();
    let stray = ImageBuilder::new()
        .code(".text", 0, &[0; 4])
        .data(".data", 0xF000_0000, &[1; 16])
        .build();
    assert!(matches!(
        load(stray, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidArgument { .. })
    ));

    // Zero-initialised sections are checked by their declared size.
    let oversized_bss = ImageBuilder::new()
        .code(".text", 0, &[0; 4])
        .bss(".bss", 0x4_0000, 0x10_0000)
        .build();
    assert!(matches!(
        load(oversized_bss, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidArgument { .. })
    ));
    assert_eq!(memory.live_regions(), 0);
}

#[test]
fn test_rejects_out_of_range_section_offset() {
    let memory = HostDmaAllocator::new();
    let image = ImageBuilder::new().code(".text", 0, &[0; 4]).build();

    // e_shoff lives at byte 32 of an ELF32 header; section 1 is .text and
    // sh_offset is at byte 16 of its 40-byte header.
    let mut raw = image.to_vec();
    let shoff = u32::from_le_bytes(raw[32..36].try_into().unwrap()) as usize;
    let offset_at = shoff + 40 + 16;
    raw[offset_at..offset_at + 4].copy_from_slice(&0xFFFF_FF00u32.to_le_bytes());
    assert!(matches!(
        load(raw, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidFormat { .. })
    ));

    let truncated = image.slice(..image.len() - 20);
    assert!(matches!(
        load(truncated, &memory, ChipFamily::T23x, 0),
        Err(VpuError::InvalidFormat { .. })
    ));
    assert_eq!(memory.live_regions(), 0);
}

/// A loaded executable can be named in a context's command stream.
#[test]
fn test_run_on_simulated_device() {
    let memory = HostDmaAllocator::new();
    let firmware = Arc::new(SimulatedFirmware::new(memory.clone()));
    let config = DeviceConfig::default().with_wait(Duration::from_micros(50), Duration::from_millis(100));
    let device = Device::create(config, Arc::new(memory.clone()), firmware.clone()).unwrap();
    device.init_firmware().unwrap();
    let ctx = device.open_context().unwrap();
    let target = Target::from(ctx);

    let exe = load_for_device(two_code_one_data(), &device, 0).unwrap();
    assert_eq!(exe.symbols().len(), 3);
    let id = device.with_resources(target, |t| exe.register(t, true)).unwrap();
    device.update_resources(target).unwrap();

    let mut commands = CommandBuffer::new();
    commands
        .acquire_engine(0)
        .set_vpu_executable(id)
        .run_vpu(0)
        .release_engine(0);
    device.submit(target, &commands).unwrap();
    assert_eq!(firmware.command_errors(), 0);

    device.unregister_resource(target, id).unwrap();
    device.close_context(ctx).unwrap();
    exe.unload(&memory);
}
