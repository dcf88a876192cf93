//! VPU executable constants and the metadata block firmware reads on
//! `SetVpuExecutable`.
//!
//! A loaded executable occupies two DMA regions:
//!
//! ```text
//! sections region                      metadata region
//! ┌──────────────────────┐ 0           ┌──────────────────────┐ 0
//! │ text (byte-swapped)  │             │ MetadataHeader (40)  │
//! │ pad to TEXT_ALIGNMENT│             ├──────────────────────┤ sections_offset
//! ├──────────────────────┤             │ DataSectionDesc × n  │
//! │ ICACHE_SIZE pad      │             ├──────────────────────┤ symbols_offset
//! ├──────────────────────┤ data_offset │ SymbolDesc × m       │
//! │ data section 0 (pad) │             └──────────────────────┘
//! │ data section 1 (pad) │
//! └──────────────────────┘
//! ```

/// Code blob alignment.
pub const TEXT_ALIGNMENT: usize = 128;

/// Per-section data alignment.
pub const DATA_ALIGNMENT: usize = 64;

/// Instruction-cache size; appended after the text so prefetch never reads
/// into the data segment.
pub const ICACHE_SIZE: usize = 16 * 1024;

/// Name of the data section holding export descriptors.
pub const EXPORTS_SECTION: &str = "EXPORTS";

/// Size of one `{type, addr, size}` export descriptor.
pub const EXPORT_DESCRIPTOR_BYTES: usize = 12;

/// Size of [`MetadataHeader`] when encoded.
pub const METADATA_HEADER_BYTES: usize = 40;

/// Size of one encoded [`DataSectionDesc`].
pub const DATA_SECTION_DESC_BYTES: usize = 16;

/// Size of one encoded [`SymbolDesc`].
pub const SYMBOL_DESC_BYTES: usize = 16;

/// What an exported symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SymbolType {
    /// Unrecognised descriptor type.
    Unknown = 0,
    /// Plain data in VMEM.
    Data = 1,
    /// A VMEM buffer the host may bind resources to.
    VmemBuffer = 2,
    /// A pointer slot patched with a resource address.
    Pointer = 3,
    /// Firmware-reserved system symbol.
    System = 4,
}

impl SymbolType {
    /// Decode a descriptor type; unknown values map to [`SymbolType::Unknown`].
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Data,
            2 => Self::VmemBuffer,
            3 => Self::Pointer,
            4 => Self::System,
            _ => Self::Unknown,
        }
    }
}

/// An export descriptor as stored in the `EXPORTS` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportDescriptor {
    /// Raw symbol type.
    pub ty: u32,
    /// VMEM address.
    pub addr: u32,
    /// Size in bytes.
    pub size: u32,
}

impl ExportDescriptor {
    /// Decode a 12-byte descriptor.
    #[must_use]
    pub fn decode(raw: &[u8; EXPORT_DESCRIPTOR_BYTES]) -> Self {
        Self {
            ty: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            addr: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            size: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    /// Encode to 12 bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; EXPORT_DESCRIPTOR_BYTES] {
        let mut out = [0u8; EXPORT_DESCRIPTOR_BYTES];
        out[0..4].copy_from_slice(&self.ty.to_le_bytes());
        out[4..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Placement of one data section: copied from `dram_offset` in the sections
/// region to `vmem_addr` before the VPU runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSectionDesc {
    /// Offset inside the sections region.
    pub dram_offset: u32,
    /// Destination VMEM address.
    pub vmem_addr: u32,
    /// Unpadded size in bytes.
    pub size: u32,
}

impl DataSectionDesc {
    /// Encode to the metadata layout.
    #[must_use]
    pub fn encode(&self) -> [u8; DATA_SECTION_DESC_BYTES] {
        let mut out = [0u8; DATA_SECTION_DESC_BYTES];
        out[0..4].copy_from_slice(&self.dram_offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.vmem_addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Symbol entry in the metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDesc {
    /// VMEM address.
    pub vmem_addr: u32,
    /// Size in bytes.
    pub size: u32,
    /// Symbol type.
    pub ty: SymbolType,
    /// Id the host uses to refer to the symbol in commands.
    pub id: u32,
}

impl SymbolDesc {
    /// Encode to the metadata layout.
    #[must_use]
    pub fn encode(&self) -> [u8; SYMBOL_DESC_BYTES] {
        let mut out = [0u8; SYMBOL_DESC_BYTES];
        out[0..4].copy_from_slice(&self.vmem_addr.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&(self.ty as u32).to_le_bytes());
        out[12..16].copy_from_slice(&self.id.to_le_bytes());
        out
    }
}

/// Fixed header of the metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataHeader {
    /// IOVA of the text blob.
    pub code_iova: u64,
    /// Text size including alignment padding (excluding the icache pad).
    pub code_size: u32,
    /// Number of [`DataSectionDesc`] entries.
    pub data_section_count: u32,
    /// IOVA of the data segment.
    pub data_iova: u64,
    /// Data segment size.
    pub data_size: u32,
    /// Number of [`SymbolDesc`] entries.
    pub symbol_count: u32,
    /// Byte offset of the section descriptors.
    pub sections_offset: u32,
    /// Byte offset of the symbol descriptors.
    pub symbols_offset: u32,
}

impl MetadataHeader {
    /// Encode to the metadata layout.
    #[must_use]
    pub fn encode(&self) -> [u8; METADATA_HEADER_BYTES] {
        let mut out = [0u8; METADATA_HEADER_BYTES];
        out[0..8].copy_from_slice(&self.code_iova.to_le_bytes());
        out[8..12].copy_from_slice(&self.code_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.data_section_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_iova.to_le_bytes());
        out[24..28].copy_from_slice(&self.data_size.to_le_bytes());
        out[28..32].copy_from_slice(&self.symbol_count.to_le_bytes());
        out[32..36].copy_from_slice(&self.sections_offset.to_le_bytes());
        out[36..40].copy_from_slice(&self.symbols_offset.to_le_bytes());
        out
    }
}

/// Metadata block size for `sections` data sections and `symbols` symbols.
#[must_use]
pub const fn metadata_bytes(sections: usize, symbols: usize) -> usize {
    METADATA_HEADER_BYTES + sections * DATA_SECTION_DESC_BYTES + symbols * SYMBOL_DESC_BYTES
}
