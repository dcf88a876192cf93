//! Firmware backend implementations.
//!
//! - **Simulated**: an in-process firmware model over [`HostDmaAllocator`]
//!   memory, for CI and development without hardware.
//!
//! [`HostDmaAllocator`]: crate::dma::HostDmaAllocator

pub mod simulated;

pub use simulated::SimulatedFirmware;
