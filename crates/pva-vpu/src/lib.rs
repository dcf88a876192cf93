//! VPU executable loader for the PVA.
//!
//! A VPU executable is a little-endian ELF32 image. Its code sections run
//! from the VPU instruction memory, its data sections are copied into VMEM
//! before each run, and an `EXPORTS` section describes the symbols the host
//! may bind buffers to.
//!
//! # Format
//!
//! - **Code**: `SHT_PROGBITS`, `SHF_ALLOC | SHF_EXECINSTR`, placed at `sh_addr`
//! - **Data**: allocated, non-executable `SHT_PROGBITS` / `SHT_NOBITS`
//! - **EXPORTS**: one 12-byte `{type, addr, size}` descriptor per global,
//!   non-function symbol defined in the section
//!
//! # Example
//!
//! ```
//! use pva_chip::exec::SymbolType;
//! use pva_chip::soc::ChipFamily;
//! use pva_driver::HostDmaAllocator;
//! use pva_vpu::ImageBuilder;
//!
//! # fn main() -> pva_vpu::Result<()> {
//! let image = ImageBuilder::new()
//!     .code(".text", 0, &[0x13, 0x00, 0x00, 0x00])
//!     .export("frame", SymbolType::VmemBuffer, 0x4_0000, 1024)
//!     .build();
//!
//! let memory = HostDmaAllocator::new();
//! let exe = pva_vpu::load(image, &memory, ChipFamily::T23x, 0)?;
//! assert_eq!(exe.symbol("frame").map(|s| s.size), Some(1024));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod builder;
mod error;
mod executable;
pub mod image;
mod loader;

pub use builder::{ImageBuilder, EXPORTS_ADDR};
pub use error::{Result, VpuError};
pub use executable::{Executable, Layout, Section, Symbol};
pub use loader::{load, load_for_device, LoadedExecutable};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{load, load_for_device, Executable, ImageBuilder, LoadedExecutable, Result, Symbol, VpuError};
}
