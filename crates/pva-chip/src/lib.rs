//! Silicon and firmware ABI model for the NVIDIA PVA (Programmable Vision Accelerator).
//!
//! This crate has **no dependencies** and **no hardware access**; it is a
//! pure model of the contract between the host driver and the PVA firmware:
//! command opcodes and their fixed payloads, the CCQ bootstrap words, the
//! shared-buffer message format, the shared-memory layouts of the queue and
//! resource table, the VPU executable metadata block, and the per-chip VMEM
//! window tables.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cmd`] | Command header, opcodes, encode/decode of command streams |
//! | [`ccq`] | 64-bit CCQ words used before the submission queue exists |
//! | [`msg`] | Firmware → host shared-buffer messages |
//! | [`layout`] | Byte layouts of queue, resource table and shared-buffer headers |
//! | [`exec`] | Executable image constants and the metadata block layout |
//! | [`vmem`] | VMEM address windows |
//! | [`soc`] | Chip families and their constants |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ccq;
pub mod cmd;
pub mod exec;
pub mod layout;
pub mod msg;
pub mod soc;
pub mod vmem;

/// Round `value` up to the next multiple of `align` (`align` must be a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
