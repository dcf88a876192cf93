//! Host-side driver core for the NVIDIA PVA (Programmable Vision Accelerator).
//!
//! This crate owns everything the host must keep consistent with the PVA
//! firmware: device memory and its IOVAs, resource tables, submission
//! queues, command chunks and fences, the firmware → host event channels,
//! and the lifecycle of the device and its contexts.
//!
//! # Submission path
//!
//! ```text
//! CommandBuffer ──► Submitter ──► ChunkPool (chunks linked with LinkChunk,
//!                      │                       last one ends with a fence)
//!                      ├──► SubmissionQueue entry
//!                      └──► CCQ doorbell ──► firmware ──► fence write
//!
//! firmware ──► SharedBuffer ring ──► interrupt ──► process() ──► events,
//!                                                      resource unregister
//! ```
//!
//! # Backends
//!
//! Firmware is reached through a [`FirmwareBackend`]. The
//! [`SimulatedFirmware`] backend executes commands in-process over
//! [`HostDmaAllocator`] memory, so the whole driver runs in CI.
//!
//! # Quick start
//!
//! ```
//! use pva_driver::{CommandBuffer, Device, DeviceConfig, HostDmaAllocator, SimulatedFirmware};
//! use std::sync::Arc;
//!
//! # fn main() -> pva_driver::Result<()> {
//! let memory = HostDmaAllocator::new();
//! let firmware = Arc::new(SimulatedFirmware::new(memory.clone()));
//! let device = Device::create(DeviceConfig::default(), Arc::new(memory), firmware)?;
//! device.init_firmware()?;
//!
//! let ctx = device.open_context()?;
//! let mut commands = CommandBuffer::new();
//! commands.acquire_engine(0).release_engine(0);
//! device.submit(ctx.into(), &commands)?;
//!
//! device.close_context(ctx)?;
//! device.destroy()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod ccq;
mod chunk;
mod cmdbuf;
mod config;
mod context;
mod device;
pub mod dma;
mod error;
mod health;
mod interrupt;
mod queue;
mod resource;
pub mod shared_buffer;
pub mod submit;

pub use backend::FirmwareBackend;
pub use backends::SimulatedFirmware;
pub use ccq::CommandFifo;
pub use chunk::{Chunk, ChunkPool};
pub use cmdbuf::CommandBuffer;
pub use config::{DeviceConfig, INTERNAL_RESOURCES};
pub use context::ContextId;
pub use device::{Device, DeviceState, Target};
pub use dma::{Access, DeviceMemory, DmaHandle, DmaRegion, HostDmaAllocator};
pub use error::{PvaError, Result};
pub use health::DeviceHealth;
pub use interrupt::{InterruptHandler, InterruptTable};
pub use queue::SubmissionQueue;
pub use resource::{Ownership, Resource, ResourceTable};
pub use shared_buffer::{BufferState, ChannelKind, LockDomain, ProcessStats, SharedBuffer};
pub use submit::{FenceSlot, FenceTicket, Submitter};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Access, CommandBuffer, ContextId, Device, DeviceConfig, DeviceState, FenceTicket,
        FirmwareBackend, HostDmaAllocator, PvaError, Result, SimulatedFirmware, Target,
    };
}
