//! Low-level command FIFO (CCQ) access.
//!
//! Only the bootstrap messages and doorbells travel over the CCQ; everything
//! else goes through a submission queue.

use crate::error::Result;
use pva_chip::ccq::CcqMessage;
use std::sync::Arc;

/// Word-at-a-time access to the CCQ hardware FIFOs.
pub trait CommandFifo: Send + Sync + std::fmt::Debug {
    /// Push one 64-bit word into the FIFO of `interface`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the FIFO does not drain, or `InvalidState` if the
    /// firmware is not running.
    fn push_word(&self, interface: u8, word: u64) -> Result<()>;
}

impl<T: CommandFifo + ?Sized> CommandFifo for Arc<T> {
    fn push_word(&self, interface: u8, word: u64) -> Result<()> {
        (**self).push_word(interface, word)
    }
}

/// Push every word of `message` to `interface`.
///
/// # Errors
///
/// Propagates the first failing [`CommandFifo::push_word`].
pub fn push_message(fifo: &dyn CommandFifo, interface: u8, message: &CcqMessage) -> Result<()> {
    tracing::debug!("CCQ{interface} <- {message:?}");
    for &word in message.encode().as_slice() {
        fifo.push_word(interface, word)?;
    }
    Ok(())
}
