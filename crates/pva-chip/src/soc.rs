//! Chip families and their constants.
//!
//! These are configuration data, not control flow: the driver derives its
//! defaults from them and the loader validates symbols against the VMEM
//! window table.

use crate::vmem::{VmemWindow, T23X_WINDOWS, T26X_WINDOWS};

/// PVA generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// Orin (T234 and derivatives).
    T23x,
    /// Thor (T264 and derivatives).
    T26x,
}

impl ChipFamily {
    /// All known families.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::T23x, Self::T26x]
    }

    /// Parse a family name (`"t23x"`, `"T234"`, `"t26x"`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "t23x" | "t234" | "orin" => Some(Self::T23x),
            "t26x" | "t264" | "thor" => Some(Self::T26x),
            _ => None,
        }
    }

    /// Canonical short name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::T23x => "t23x",
            Self::T26x => "t26x",
        }
    }

    /// VMEM windows exported symbols may occupy.
    #[must_use]
    pub const fn vmem_windows(&self) -> &'static [VmemWindow] {
        match self {
            Self::T23x => &T23X_WINDOWS,
            Self::T26x => &T26X_WINDOWS,
        }
    }

    /// Number of DMA channels per engine.
    #[must_use]
    pub const fn dma_channels(&self) -> u32 {
        match self {
            Self::T23x => 16,
            Self::T26x => 24,
        }
    }

    /// Number of CCQ interfaces. Interface 0 belongs to the device, the rest
    /// are handed out one per context.
    #[must_use]
    pub const fn ccq_count(&self) -> u8 {
        match self {
            Self::T23x => 8,
            Self::T26x => 16,
        }
    }

    /// Hardware CCQ FIFO depth in 64-bit words.
    #[must_use]
    pub const fn ccq_fifo_depth(&self) -> usize {
        match self {
            Self::T23x => 14,
            Self::T26x => 32,
        }
    }

    /// Size of the VPU instruction address space. Code sections must end at
    /// or below it.
    #[must_use]
    pub const fn code_address_limit(&self) -> u32 {
        match self {
            Self::T23x => 0x8_0000,
            Self::T26x => 0x10_0000,
        }
    }
}

impl std::fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(ChipFamily::from_name("T234"), Some(ChipFamily::T23x));
        assert_eq!(ChipFamily::from_name("thor"), Some(ChipFamily::T26x));
        assert_eq!(ChipFamily::from_name("t19x"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for chip in ChipFamily::all() {
            assert_eq!(ChipFamily::from_name(chip.name()), Some(*chip));
        }
    }

    #[test]
    fn test_code_limit_is_text_aligned() {
        for chip in ChipFamily::all() {
            assert_eq!(chip.code_address_limit() as usize % crate::exec::TEXT_ALIGNMENT, 0);
        }
    }

    #[test]
    fn test_windows_sorted_and_disjoint() {
        for chip in ChipFamily::all() {
            let windows = chip.vmem_windows();
            for pair in windows.windows(2) {
                assert!(pair[0].end <= pair[1].start);
            }
        }
    }
}
