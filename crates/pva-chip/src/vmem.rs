//! VMEM (VPU local memory) address windows.
//!
//! Exported symbols of a VPU executable must live entirely inside one of the
//! chip's VMEM windows. The first 64 bytes of bank 0 are reserved by the
//! firmware, so no window starts at zero.

/// A half-open VMEM address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmemWindow {
    /// First valid address.
    pub start: u32,
    /// One past the last valid address.
    pub end: u32,
}

impl VmemWindow {
    /// Create a window.
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Window size in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the window is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `[addr, addr + size)` lies entirely inside the window.
    ///
    /// Overflowing ranges are never contained.
    #[must_use]
    pub const fn contains(&self, addr: u32, size: u32) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }
}

/// Whether `[addr, addr + size)` lies inside any of `windows`.
#[must_use]
pub fn in_any(windows: &[VmemWindow], addr: u32, size: u32) -> bool {
    windows.iter().any(|w| w.contains(addr, size))
}

/// T23x: three 64 KiB banks (bank 0 minus the reserved header).
pub const T23X_WINDOWS: [VmemWindow; 3] = [
    VmemWindow::new(0x0000_0040, 0x0001_0000),
    VmemWindow::new(0x0004_0000, 0x0005_0000),
    VmemWindow::new(0x0008_0000, 0x0009_0000),
];

/// T26x: three 128 KiB banks.
pub const T26X_WINDOWS: [VmemWindow; 3] = [
    VmemWindow::new(0x0000_0040, 0x0002_0000),
    VmemWindow::new(0x0004_0000, 0x0006_0000),
    VmemWindow::new(0x0008_0000, 0x000A_0000),
];
