//! Executable loader: host image → device memory.
//!
//! Loading produces two regions, both owned by the returned
//! [`LoadedExecutable`]:
//!
//! - the **sections region**: byte-swapped text, padded to
//!   `TEXT_ALIGNMENT`, then an `ICACHE_SIZE` gap, then the data segment;
//! - the **metadata region**: a `MetadataHeader` followed by the data
//!   section descriptors and the symbol descriptors, which firmware reads
//!   when a command buffer issues `SetVpuExecutable`.
//!
//! Every intermediate buffer and region is owned by a local binding, so an
//! error at any step releases everything allocated so far.

use crate::error::{Result, VpuError};
use crate::executable::{Executable, Layout, Symbol};
use bytes::Bytes;
use pva_chip::exec::{
    metadata_bytes, DataSectionDesc, MetadataHeader, SymbolDesc, DATA_SECTION_DESC_BYTES,
    METADATA_HEADER_BYTES, SYMBOL_DESC_BYTES,
};
use pva_chip::soc::ChipFamily;
use pva_driver::{Access, Device, DeviceMemory, DmaRegion, ResourceTable};

/// Parse `image` and load it into device memory in address space `asid`.
///
/// # Errors
///
/// Every [`Executable::parse`] error, plus `Driver` errors from the
/// allocator.
pub fn load(
    image: impl Into<Bytes>,
    memory: &dyn DeviceMemory,
    chip: ChipFamily,
    asid: u32,
) -> Result<LoadedExecutable> {
    Executable::parse(image, chip)?.load(memory, asid)
}

/// Parse `image` for the chip `device` was created for and load it into the
/// device's memory.
///
/// [`load`] stays available for callers that hold only an allocator.
///
/// # Errors
///
/// Same as [`load`].
pub fn load_for_device(image: impl Into<Bytes>, device: &Device, asid: u32) -> Result<LoadedExecutable> {
    Executable::parse(image, device.chip())?.load(device.memory(), asid)
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| VpuError::invalid_argument(format!("{what} of {value} bytes exceeds 4 GiB")))
}

impl Executable {
    /// Copy the executable into two fresh device-memory regions.
    ///
    /// # Errors
    ///
    /// Returns `Driver` errors from the allocator, or `InvalidArgument` if
    /// the layout does not fit the 32-bit metadata fields.
    pub fn load(&self, memory: &dyn DeviceMemory, asid: u32) -> Result<LoadedExecutable> {
        let layout = self.layout();
        let text = self.text_image();
        let (data, data_sections) = self.data_image();

        let sections = memory.alloc_map(layout.total(), Access::ReadOnly, asid)?;
        sections.write_bytes(0, &text);
        sections.write_bytes(layout.data_offset, &data);

        let symbols = self.symbols().to_vec();
        let metadata = memory.alloc_map(
            metadata_bytes(data_sections.len(), symbols.len()),
            Access::ReadOnly,
            asid,
        )?;
        write_metadata(&metadata, &sections, &layout, &data_sections, &symbols)?;

        tracing::info!(
            "Loaded executable: {} bytes at {:#x}, metadata at {:#x}, {} export(s)",
            sections.len(),
            sections.iova(),
            metadata.iova(),
            symbols.len()
        );
        Ok(LoadedExecutable {
            sections,
            metadata,
            layout,
            data_sections,
            symbols,
        })
    }
}

fn write_metadata(
    metadata: &DmaRegion,
    sections: &DmaRegion,
    layout: &Layout,
    data_sections: &[DataSectionDesc],
    symbols: &[Symbol],
) -> Result<()> {
    let sections_offset = METADATA_HEADER_BYTES;
    let symbols_offset = sections_offset + data_sections.len() * DATA_SECTION_DESC_BYTES;
    let header = MetadataHeader {
        code_iova: sections.iova(),
        code_size: to_u32(layout.text_padded, "text")?,
        data_section_count: to_u32(data_sections.len(), "section table")?,
        data_iova: sections.iova() + layout.data_offset as u64,
        data_size: to_u32(layout.data_size, "data segment")?,
        symbol_count: to_u32(symbols.len(), "symbol table")?,
        sections_offset: to_u32(sections_offset, "metadata")?,
        symbols_offset: to_u32(symbols_offset, "metadata")?,
    };
    metadata.write_bytes(0, &header.encode());

    for (i, desc) in data_sections.iter().enumerate() {
        metadata.write_bytes(sections_offset + i * DATA_SECTION_DESC_BYTES, &desc.encode());
    }
    for (i, symbol) in symbols.iter().enumerate() {
        let desc = SymbolDesc {
            vmem_addr: symbol.addr,
            size: symbol.size,
            ty: symbol.ty,
            id: symbol.id,
        };
        metadata.write_bytes(symbols_offset + i * SYMBOL_DESC_BYTES, &desc.encode());
    }
    Ok(())
}

/// An executable resident in device memory.
///
/// Dropping it frees both regions and the symbol table together.
#[derive(Debug)]
pub struct LoadedExecutable {
    sections: DmaRegion,
    metadata: DmaRegion,
    layout: Layout,
    data_sections: Vec<DataSectionDesc>,
    symbols: Vec<Symbol>,
}

impl LoadedExecutable {
    /// Look up an export by name.
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// All exports, in id order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Data sections as recorded in the metadata block.
    pub fn data_sections(&self) -> &[DataSectionDesc] {
        &self.data_sections
    }

    /// Placement inside the sections region.
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Text and data.
    pub const fn sections_region(&self) -> &DmaRegion {
        &self.sections
    }

    /// Metadata block read by firmware.
    pub const fn metadata_region(&self) -> &DmaRegion {
        &self.metadata
    }

    /// Register the metadata block in `table` so a command buffer can name
    /// it in `SetVpuExecutable`. The table borrows the memory; this value
    /// stays the owner.
    ///
    /// # Errors
    ///
    /// Every [`ResourceTable::add_borrowed`] error.
    pub fn register(&self, table: &mut ResourceTable, read_only: bool) -> pva_driver::Result<u32> {
        table.add_borrowed(self.metadata.handle(), read_only)
    }

    /// Hand both regions back to `memory`.
    pub fn unload(self, memory: &dyn DeviceMemory) {
        tracing::debug!("Unloading executable at {:#x}", self.sections.iova());
        memory.free(self.sections);
        memory.free(self.metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;
    use pva_chip::exec::SymbolType;
    use pva_driver::HostDmaAllocator;

    #[test]
    fn test_metadata_block() {
        let memory = HostDmaAllocator::new();
        let image = ImageBuilder::new()
            .code(".text", 0, &[0xAA; 16])
            .data(".data", 0x4_0000, &[0x55; 8])
            .export("in", SymbolType::VmemBuffer, 0x4_0000, 0x80)
            .export("out", SymbolType::VmemBuffer, 0x8_0000, 0x80)
            .build();
        let exe = load(image, &memory, ChipFamily::T23x, 0).unwrap();

        let meta = exe.metadata_region();
        assert_eq!(meta.len(), metadata_bytes(1, 2));
        assert_eq!(
            u64::from(meta.read_u32(0)) | (u64::from(meta.read_u32(4)) << 32),
            exe.sections_region().iova()
        );
        assert_eq!(meta.read_u32(12), 1, "data section count");
        assert_eq!(meta.read_u32(28), 2, "symbol count");

        let symbols_offset = meta.read_u32(36) as usize;
        // Second symbol: vmem_addr, size, type, id.
        let second = symbols_offset + SYMBOL_DESC_BYTES;
        assert_eq!(meta.read_u32(second), 0x8_0000);
        assert_eq!(meta.read_u32(second + 8), SymbolType::VmemBuffer as u32);
        assert_eq!(meta.read_u32(second + 12), 1);

        let data_at = exe.data_sections()[0].dram_offset as usize;
        let mut data = [0u8; 8];
        exe.sections_region().read_bytes(data_at, &mut data);
        assert_eq!(data, [0x55; 8]);
    }

    #[test]
    fn test_failure_leaks_nothing() {
        let memory = HostDmaAllocator::new();
        let image = ImageBuilder::new()
            .code(".text", 0, &[0; 4])
            .export("bad", SymbolType::Data, 0xFFFF_0000, 4)
            .build();
        assert!(matches!(
            load(image, &memory, ChipFamily::T23x, 0),
            Err(VpuError::InvalidArgument { .. })
        ));
        assert_eq!(memory.live_regions(), 0);
    }

    #[test]
    fn test_unload_frees_both_regions() {
        let memory = HostDmaAllocator::new();
        let image = ImageBuilder::new().code(".text", 0, &[0; 4]).build();
        let exe = load(image, &memory, ChipFamily::T23x, 0).unwrap();
        assert_eq!(memory.live_regions(), 2);
        exe.unload(&memory);
        assert_eq!(memory.live_regions(), 0);
    }

    #[test]
    fn test_register_borrows_metadata() {
        let memory = HostDmaAllocator::new();
        let image = ImageBuilder::new().code(".text", 0, &[0; 4]).build();
        let exe = load(image, &memory, ChipFamily::T23x, 0).unwrap();

        let mut table = ResourceTable::new(&memory, 4, 0).unwrap();
        let id = exe.register(&mut table, true).unwrap();
        let resource = table.get(id).unwrap();
        assert!(!resource.is_owned());
        assert_eq!(resource.iova(), exe.metadata_region().iova());

        table.remove(id).unwrap();
        assert_eq!(exe.metadata_region().len(), metadata_bytes(0, 0));
    }
}
