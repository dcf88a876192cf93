//! Interface → handler routing for firmware interrupts.
//!
//! Host interrupt registration is the platform's business. The platform
//! calls [`InterruptTable::dispatch`] with the CCQ interface that raised the
//! interrupt; whatever is bound there runs.

use crate::error::Result;
use crate::shared_buffer::ProcessStats;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Something that services an interface's interrupt.
pub trait InterruptHandler: Send + Sync {
    /// Service one interrupt.
    ///
    /// # Errors
    ///
    /// Handler specific; shared buffers return `FirmwareAborted` or
    /// `ProtocolViolation` when firmware misbehaves.
    fn handle(&self) -> Result<ProcessStats>;
}

/// Handler bindings, one per interface.
#[derive(Default)]
pub struct InterruptTable {
    handlers: Mutex<HashMap<u8, Arc<dyn InterruptHandler>>>,
}

impl std::fmt::Debug for InterruptTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bound: Vec<u8> = self.lock().keys().copied().collect();
        bound.sort_unstable();
        f.debug_struct("InterruptTable").field("bound", &bound).finish()
    }
}

impl InterruptTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Arc<dyn InterruptHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `handler` to `interface`, replacing any previous binding.
    pub fn bind(&self, interface: u8, handler: Arc<dyn InterruptHandler>) {
        if self.lock().insert(interface, handler).is_some() {
            tracing::debug!("Interface {interface}: interrupt handler replaced");
        }
    }

    /// Remove the binding of `interface`. Returns whether one existed.
    pub fn unbind(&self, interface: u8) -> bool {
        self.lock().remove(&interface).is_some()
    }

    /// Whether `interface` has a handler.
    pub fn is_bound(&self, interface: u8) -> bool {
        self.lock().contains_key(&interface)
    }

    /// Run the handler bound to `interface`.
    ///
    /// The table lock is released before the handler runs, so a handler may
    /// unbind itself. Unbound interfaces are ignored.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error.
    pub fn dispatch(&self, interface: u8) -> Result<ProcessStats> {
        let handler = self.lock().get(&interface).cloned();
        match handler {
            Some(handler) => handler.handle(),
            None => {
                tracing::debug!("Spurious interrupt on interface {interface}");
                Ok(ProcessStats::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl InterruptHandler for Counter {
        fn handle(&self) -> Result<ProcessStats> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ProcessStats { dispatched: n, ..ProcessStats::default() })
        }
    }

    #[test]
    fn test_dispatch_routes_by_interface() {
        let table = InterruptTable::new();
        let counter = Arc::new(Counter::default());
        table.bind(2, counter.clone());

        assert_eq!(table.dispatch(2).unwrap().dispatched, 1);
        assert_eq!(table.dispatch(3).unwrap(), ProcessStats::default());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(table.unbind(2));
        assert!(!table.is_bound(2));
        table.dispatch(2).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
