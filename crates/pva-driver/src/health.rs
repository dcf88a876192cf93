//! Device abort flag and interrupt gate.
//!
//! Shared by every component that talks to firmware. Once aborted, nothing
//! firmware writes is trusted: submitters stop polling fences and interrupt
//! servicing is skipped until the device is reinitialised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Abort/interrupt state of one device.
#[derive(Debug)]
pub struct DeviceHealth {
    aborted: AtomicBool,
    interrupts: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Default for DeviceHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHealth {
    /// Healthy device with interrupts disabled.
    pub fn new() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            interrupts: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Mark the device aborted.
    ///
    /// Interrupts are disabled before the abort flag is published, so a
    /// handler that observes the flag cannot race a fresh interrupt.
    pub fn abort(&self, reason: &str) {
        self.interrupts.store(false, Ordering::SeqCst);
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::error!("PVA aborted: {reason}");
            *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        }
    }

    /// Whether the device has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether interrupt servicing is enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Why the device was aborted, if it was.
    pub fn abort_reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Clear the abort and enable interrupts (firmware freshly booted).
    pub fn reset(&self) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.aborted.store(false, Ordering::SeqCst);
        self.interrupts.store(true, Ordering::SeqCst);
    }

    /// Disable interrupt servicing without aborting.
    pub fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_disables_interrupts() {
        let health = DeviceHealth::new();
        health.reset();
        assert!(health.interrupts_enabled());

        health.abort("watchdog");
        assert!(health.is_aborted());
        assert!(!health.interrupts_enabled());
        assert_eq!(health.abort_reason().as_deref(), Some("watchdog"));
    }

    #[test]
    fn test_first_reason_wins() {
        let health = DeviceHealth::new();
        health.abort("first");
        health.abort("second");
        assert_eq!(health.abort_reason().as_deref(), Some("first"));

        health.reset();
        assert!(!health.is_aborted());
        assert_eq!(health.abort_reason(), None);
    }
}
