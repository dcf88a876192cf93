//! pva: command-line tool for the PVA driver core.
//!
//! Usage:
//!   pva chips                       List supported chip families
//!   pva inspect <image> [--chip]    Parse a VPU executable and print its layout
//!   pva simulate [--chip] [-n N]    Run submissions on the simulated firmware

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use pva_chip::exec::SymbolType;
use pva_chip::soc::ChipFamily;
use pva_driver::{
    CommandBuffer, Device, DeviceConfig, HostDmaAllocator, SimulatedFirmware, Target,
};
use pva_vpu::{Executable, ImageBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pva", about = "PVA command submission and executable tool", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List supported chip families and their constants
    Chips,
    /// Parse a VPU executable and print sections, layout and exports
    Inspect {
        /// Path to the ELF image
        image: PathBuf,
        /// Chip family (t23x, t26x)
        #[arg(long, default_value = "t23x")]
        chip: String,
    },
    /// Drive the simulated firmware through a full device lifecycle
    Simulate {
        /// Chip family (t23x, t26x)
        #[arg(long, default_value = "t23x")]
        chip: String,
        /// Command buffers to submit
        #[arg(short = 'n', long, default_value_t = 8)]
        submissions: usize,
        /// VPU executable to load (a synthetic one is built otherwise)
        #[arg(long)]
        image: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Cmd::Chips => cmd_chips(),
        Cmd::Inspect { image, chip } => cmd_inspect(&image, &chip),
        Cmd::Simulate {
            chip,
            submissions,
            image,
        } => cmd_simulate(&chip, submissions, image.as_deref()),
    }
}

fn parse_chip(name: &str) -> Result<ChipFamily> {
    ChipFamily::from_name(name).ok_or_else(|| anyhow!("unknown chip family '{name}'"))
}

fn cmd_chips() -> Result<()> {
    for chip in ChipFamily::all() {
        println!("{}", chip.name());
        println!("  DMA channels : {}", chip.dma_channels());
        println!(
            "  CCQs         : {} (FIFO depth {})",
            chip.ccq_count(),
            chip.ccq_fifo_depth()
        );
        for window in chip.vmem_windows() {
            println!(
                "  VMEM window  : {:#07x}..{:#07x} ({} KiB)",
                window.start,
                window.end,
                (window.end - window.start) / 1024
            );
        }
    }
    Ok(())
}

fn cmd_inspect(path: &Path, chip: &str) -> Result<()> {
    let chip = parse_chip(chip)?;
    let exe = Executable::from_file(path, chip)
        .with_context(|| format!("loading {}", path.display()))?;

    println!("Executable   : {}", path.display());
    println!("Chip         : {}", exe.chip().name());

    println!("Code sections:");
    for section in exe.code() {
        println!("  {:<16} {:#010x} {:>8} B", section.name, section.addr, section.size);
    }
    println!("Data sections:");
    if exe.data().is_empty() {
        println!("  (none)");
    }
    for section in exe.data() {
        let kind = if section.bytes.is_empty() { "zeroed" } else { "" };
        println!(
            "  {:<16} {:#010x} {:>8} B {kind}",
            section.name, section.addr, section.size
        );
    }

    let layout = exe.layout();
    println!(
        "Layout       : text {} B (padded {}), data at +{:#x}, {} B, total {} B",
        layout.text_size,
        layout.text_padded,
        layout.data_offset,
        layout.data_size,
        layout.total()
    );

    println!("Exports:");
    if exe.symbols().is_empty() {
        println!("  (none)");
    }
    for symbol in exe.symbols() {
        println!(
            "  [{:>2}] {:<20} {:?} @ {:#07x} ({} B)",
            symbol.id, symbol.name, symbol.ty, symbol.addr, symbol.size
        );
    }
    Ok(())
}

fn synthetic_image() -> Bytes {
    ImageBuilder::new()
        .code(".text", 0, &[0x13, 0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00])
        .data(".data", 0x4_0000, &[0; 64])
        .export("input", SymbolType::VmemBuffer, 0x4_0100, 0x400)
        .export("output", SymbolType::VmemBuffer, 0x8_0000, 0x400)
        .function("main", 0)
        .build()
}

fn cmd_simulate(chip: &str, submissions: usize, image: Option<&Path>) -> Result<()> {
    let chip = parse_chip(chip)?;
    let memory = HostDmaAllocator::new();
    let firmware = Arc::new(SimulatedFirmware::new(memory.clone()));
    let device = Device::create(
        DeviceConfig::for_chip(chip),
        Arc::new(memory.clone()),
        firmware.clone(),
    )?;

    device.init_firmware()?;
    println!("Device       : {} ({:?})", chip.name(), device.state());

    let ctx = device.open_context()?;
    let target = Target::from(ctx);

    let exe = match image {
        Some(path) => Executable::from_file(path, chip)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Executable::parse(synthetic_image(), chip)?,
    };
    let loaded = exe.load(device.memory(), 0)?;
    let exe_id = device.with_resources(target, |table| loaded.register(table, true))?;
    device.update_resources(target)?;
    println!(
        "Executable   : {} export(s), resource {exe_id}, {} B resident",
        loaded.symbols().len(),
        loaded.sections_region().len()
    );

    let mut commands = CommandBuffer::new();
    commands
        .acquire_engine(0)
        .set_vpu_executable(exe_id)
        .run_vpu(0)
        .release_engine(0);

    tracing::info!("Submitting {submissions} command buffer(s) on {}", chip.name());
    let tickets = (0..submissions)
        .map(|_| device.submit_async(target, &commands))
        .collect::<pva_driver::Result<Vec<_>>>()?;
    for ticket in tickets {
        device.wait(target, ticket)?;
    }

    let stats = device.service_interrupts()?;
    let events = device.take_events(target)?;
    println!("Submissions  : {submissions}");
    println!("Fence        : {}", device.fence_value(target)?);
    println!(
        "Firmware     : {} command(s), {} error(s), {} boot(s)",
        firmware.commands_executed(),
        firmware.command_errors(),
        firmware.boots()
    );
    println!(
        "Interrupts   : {} message(s), {} unregister(s), {} event(s)",
        stats.dispatched,
        stats.unregistered,
        events.len()
    );

    device.unregister_resource(target, exe_id)?;
    device.close_context(ctx)?;
    loaded.unload(device.memory());
    device.destroy()?;
    println!("Device       : {:?}", device.state());
    Ok(())
}
