//! Firmware backend abstraction.
//!
//! The device talks to firmware through three things only: CCQ words, DRAM
//! it shares with firmware, and interrupts. A backend provides the first and
//! the last, plus booting and stopping the embedded processor.

use crate::ccq::CommandFifo;
use crate::error::Result;

/// The firmware side of a device.
pub trait FirmwareBackend: CommandFifo {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Load and start firmware.
    ///
    /// Firmware starts with no knowledge of host memory; the caller runs the
    /// CCQ bootstrap afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if firmware cannot be started.
    fn boot(&self) -> Result<()>;

    /// Stop firmware. Further CCQ words fail with `InvalidState`.
    fn shutdown(&self);

    /// Whether firmware is running.
    fn is_running(&self) -> bool;

    /// Interfaces that raised an interrupt since the last call, in order.
    fn take_interrupts(&self) -> Vec<u8>;
}
