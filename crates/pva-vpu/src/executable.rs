//! Host-side view of a VPU executable.
//!
//! [`Executable::parse`] turns an ELF32 image into code sections, data
//! sections and exported symbols, validating everything the loader relies
//! on. Nothing here touches device memory; see [`crate::loader`].

use crate::error::{Result, VpuError};
use crate::image::{ElfImage, Elf32Symbol, SectionInfo, STB_GLOBAL, STT_FUNC};
use bytes::{Bytes, BytesMut};
use pva_chip::align_up;
use pva_chip::exec::{
    DataSectionDesc, ExportDescriptor, SymbolType, DATA_ALIGNMENT, EXPORTS_SECTION,
    EXPORT_DESCRIPTOR_BYTES, ICACHE_SIZE, TEXT_ALIGNMENT,
};
use pva_chip::soc::ChipFamily;
use pva_chip::vmem;
use std::fs;
use std::path::Path;

/// A loadable section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name.
    pub name: String,
    /// Load address (instruction address for code, VMEM address for data).
    pub addr: u32,
    /// Size in bytes.
    pub size: u32,
    /// File contents; empty for zero-initialised sections.
    pub bytes: Bytes,
}

impl Section {
    fn from_elf(elf: &ElfImage, index: usize, info: &SectionInfo) -> Self {
        Self {
            name: info.name.clone(),
            addr: info.header.sh_addr,
            size: info.header.sh_size,
            bytes: elf.contents(index),
        }
    }

    fn end(&self) -> u64 {
        u64::from(self.addr) + u64::from(self.size)
    }
}

/// An exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// What the symbol names.
    pub ty: SymbolType,
    /// VMEM address.
    pub addr: u32,
    /// Size in bytes.
    pub size: u32,
    /// Id used to refer to the symbol in commands (export order).
    pub id: u32,
}

/// Placement of an executable in its sections region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Text bytes spanned by the code sections (word multiple).
    pub text_size: usize,
    /// Text size padded to [`TEXT_ALIGNMENT`].
    pub text_padded: usize,
    /// Offset of the data segment: padded text plus [`ICACHE_SIZE`].
    pub data_offset: usize,
    /// Data segment size, every section padded to [`DATA_ALIGNMENT`].
    pub data_size: usize,
}

impl Layout {
    /// Total size of the sections region.
    pub const fn total(&self) -> usize {
        self.data_offset + self.data_size
    }
}

/// A parsed, validated executable.
#[derive(Debug, Clone)]
pub struct Executable {
    chip: ChipFamily,
    code: Vec<Section>,
    data: Vec<Section>,
    symbols: Vec<Symbol>,
}

impl Executable {
    /// Parse `image` for `chip`.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat`: structural damage, no code section, misaligned or
    ///   overlapping code, code past the instruction address space of
    ///   `chip`, an export descriptor outside the `EXPORTS` section
    /// - `InvalidArgument`: a data section or an export outside every VMEM
    ///   window of `chip`
    pub fn parse(image: impl Into<Bytes>, chip: ChipFamily) -> Result<Self> {
        let elf = ElfImage::parse(image)?;
        let exports = elf.find(EXPORTS_SECTION);

        let mut code = Vec::new();
        let mut data = Vec::new();
        for (index, info) in elf.sections().iter().enumerate() {
            if Some(index) == exports {
                continue;
            }
            if info.is_code() {
                code.push(Section::from_elf(&elf, index, info));
            } else if info.is_data() {
                data.push(Section::from_elf(&elf, index, info));
            }
        }
        if code.is_empty() {
            return Err(VpuError::invalid_format("executable has no code section"));
        }
        check_code_placement(&mut code, chip)?;
        check_data_placement(&data, chip)?;

        let symbols = match exports {
            Some(index) => read_exports(&elf, index, chip)?,
            None => Vec::new(),
        };

        tracing::debug!(
            "Executable: {} code / {} data section(s), {} export(s)",
            code.len(),
            data.len(),
            symbols.len()
        );
        Ok(Self {
            chip,
            code,
            data,
            symbols,
        })
    }

    /// Read and parse an image file.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if `path` does not exist, `Io` if it cannot be
    /// read, and every [`Executable::parse`] error.
    pub fn from_file<P: AsRef<Path>>(path: P, chip: ChipFamily) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading executable from: {}", path.display());
        if !path.exists() {
            return Err(VpuError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::parse(fs::read(path)?, chip)
    }

    /// Chip the executable was validated for.
    pub const fn chip(&self) -> ChipFamily {
        self.chip
    }

    /// Code sections, ordered by address.
    pub fn code(&self) -> &[Section] {
        &self.code
    }

    /// Data sections, in image order.
    pub fn data(&self) -> &[Section] {
        &self.data
    }

    /// Exported symbols, in id order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Look up an export by name.
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Where everything goes in the sections region.
    pub fn layout(&self) -> Layout {
        let text_size = self
            .code
            .iter()
            .map(Section::end)
            .max()
            .map_or(0, |end| align_up(end as usize, 4));
        let text_padded = align_up(text_size, TEXT_ALIGNMENT);
        let data_size = self
            .data
            .iter()
            .map(|s| align_up(s.size as usize, DATA_ALIGNMENT))
            .sum();
        Layout {
            text_size,
            text_padded,
            data_offset: text_padded + ICACHE_SIZE,
            data_size,
        }
    }

    /// Code as the VPU fetches it: every section at its load address,
    /// every 32-bit word byte-swapped, padded to [`TEXT_ALIGNMENT`].
    pub fn text_image(&self) -> BytesMut {
        let mut text = BytesMut::zeroed(self.layout().text_padded);
        for section in &self.code {
            let start = section.addr as usize;
            text[start..start + section.bytes.len()].copy_from_slice(&section.bytes);
        }
        for word in text.chunks_exact_mut(4) {
            word.reverse();
        }
        text
    }

    /// Data segment and the descriptor of each section in it. Descriptor
    /// offsets are relative to the sections region.
    pub fn data_image(&self) -> (BytesMut, Vec<DataSectionDesc>) {
        let layout = self.layout();
        let mut data = BytesMut::zeroed(layout.data_size);
        let mut descs = Vec::with_capacity(self.data.len());
        let mut at = 0;
        for section in &self.data {
            data[at..at + section.bytes.len()].copy_from_slice(&section.bytes);
            #[allow(clippy::cast_possible_truncation)] // code and data are bounded by the chip's address spaces
            let dram_offset = (layout.data_offset + at) as u32;
            descs.push(DataSectionDesc {
                dram_offset,
                vmem_addr: section.addr,
                size: section.size,
            });
            at += align_up(section.size as usize, DATA_ALIGNMENT);
        }
        (data, descs)
    }
}

fn check_code_placement(code: &mut [Section], chip: ChipFamily) -> Result<()> {
    code.sort_by_key(|s| s.addr);
    let limit = chip.code_address_limit();
    for section in code.iter() {
        if section.addr % 4 != 0 {
            return Err(VpuError::invalid_format(format!(
                "code section {} at unaligned address {:#x}",
                section.name, section.addr
            )));
        }
        if section.end() > u64::from(limit) {
            return Err(VpuError::invalid_format(format!(
                "code section {} ({:#x}+{:#x}) ends past the {limit:#x}-byte instruction space of {}",
                section.name,
                section.addr,
                section.size,
                chip.name()
            )));
        }
    }
    for pair in code.windows(2) {
        if pair[0].end() > u64::from(pair[1].addr) {
            return Err(VpuError::invalid_format(format!(
                "code sections {} and {} overlap",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

fn check_data_placement(data: &[Section], chip: ChipFamily) -> Result<()> {
    let windows = chip.vmem_windows();
    for section in data {
        if !vmem::in_any(windows, section.addr, section.size) {
            return Err(VpuError::invalid_argument(format!(
                "data section {}: {:#x}+{:#x} outside the VMEM of {}",
                section.name,
                section.addr,
                section.size,
                chip.name()
            )));
        }
    }
    Ok(())
}

fn is_export(symbol: &Elf32Symbol, exports: usize) -> bool {
    symbol.binding() == STB_GLOBAL
        && symbol.kind() != STT_FUNC
        && usize::from(symbol.st_shndx) == exports
}

fn read_exports(elf: &ElfImage, index: usize, chip: ChipFamily) -> Result<Vec<Symbol>> {
    let table = elf.symbols()?;
    let base = elf.sections()[index].header.sh_addr;
    let contents = elf.contents(index);
    let windows = chip.vmem_windows();

    let count = table.iter().filter(|(_, s)| is_export(s, index)).count();
    let mut symbols = Vec::with_capacity(count);

    for (name, symbol) in table.iter().filter(|(_, s)| is_export(s, index)) {
        let raw = symbol
            .st_value
            .checked_sub(base)
            .map(|offset| offset as usize)
            .and_then(|offset| contents.get(offset..offset.checked_add(EXPORT_DESCRIPTOR_BYTES)?))
            .and_then(|raw| <&[u8; EXPORT_DESCRIPTOR_BYTES]>::try_from(raw).ok())
            .ok_or_else(|| {
                VpuError::invalid_format(format!(
                    "export {name}: descriptor at {:#x} outside {EXPORTS_SECTION} ({} bytes)",
                    symbol.st_value,
                    contents.len()
                ))
            })?;
        let descriptor = ExportDescriptor::decode(raw);
        if !vmem::in_any(windows, descriptor.addr, descriptor.size) {
            return Err(VpuError::invalid_argument(format!(
                "export {name}: {:#x}+{:#x} outside the VMEM of {}",
                descriptor.addr,
                descriptor.size,
                chip.name()
            )));
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by the symbol table size
        let id = symbols.len() as u32;
        symbols.push(Symbol {
            name: name.clone(),
            ty: SymbolType::from_raw(descriptor.ty),
            addr: descriptor.addr,
            size: descriptor.size,
            id,
        });
    }
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;

    #[test]
    fn test_sections_and_exports() {
        let image = ImageBuilder::new()
            .code(".text.b", 0x40, &[0; 8])
            .code(".text.a", 0, &[0; 16])
            .data(".data", 0x4_0000, &[7; 3])
            .bss(".bss", 0x4_1000, 32)
            .export("input", SymbolType::VmemBuffer, 0x4_0000, 0x100)
            .export("params", SymbolType::Data, 0x100, 16)
            .function("main", 0)
            .build();
        let exe = Executable::parse(image, ChipFamily::T23x).unwrap();

        let names: Vec<&str> = exe.code().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [".text.a", ".text.b"]);
        assert_eq!(exe.data().len(), 2);
        assert!(exe.data()[1].bytes.is_empty());

        assert_eq!(exe.symbols().len(), 2);
        let input = exe.symbol("input").unwrap();
        assert_eq!((input.ty, input.addr, input.size, input.id), (SymbolType::VmemBuffer, 0x4_0000, 0x100, 0));
        assert_eq!(exe.symbol("params").unwrap().id, 1);
        assert!(exe.symbol("main").is_none());
    }

    #[test]
    fn test_layout() {
        let image = ImageBuilder::new()
            .code(".text", 0, &[0; 200])
            .data(".d0", 0x100, &[1; 10])
            .data(".d1", 0x200, &[2; 70])
            .build();
        let exe = Executable::parse(image, ChipFamily::T23x).unwrap();
        let layout = exe.layout();
        assert_eq!(layout.text_size, 200);
        assert_eq!(layout.text_padded, 256);
        assert_eq!(layout.data_offset, 256 + ICACHE_SIZE);
        assert_eq!(layout.data_size, 64 + 128);

        let (data, descs) = exe.data_image();
        assert_eq!(data.len(), 192);
        assert_eq!(&data[..10], &[1; 10]);
        assert_eq!(&data[64..134], &[2; 70][..]);
        assert_eq!(descs[1].dram_offset as usize, layout.data_offset + 64);
        assert_eq!(descs[1].vmem_addr, 0x200);
        assert_eq!(descs[1].size, 70);
    }

    #[test]
    fn test_text_words_are_swapped() {
        let image = ImageBuilder::new()
            .code(".text", 4, &[0x11, 0x22, 0x33, 0x44])
            .build();
        let exe = Executable::parse(image, ChipFamily::T23x).unwrap();
        let text = exe.text_image();
        assert_eq!(text.len(), TEXT_ALIGNMENT);
        assert_eq!(&text[..8], &[0, 0, 0, 0, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_rejects_bad_code_placement() {
        let unaligned = ImageBuilder::new().code(".text", 2, &[0; 4]).build();
        assert!(matches!(
            Executable::parse(unaligned, ChipFamily::T23x),
            Err(VpuError::InvalidFormat { .. })
        ));

        let overlapping = ImageBuilder::new()
            .code(".a", 0, &[0; 16])
            .code(".b", 8, &[0; 16])
            .build();
        assert!(matches!(
            Executable::parse(overlapping, ChipFamily::T23x),
            Err(VpuError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_export_window_depends_on_chip() {
        // 0x1_8000 is VMEM on T26x only.
        let image = ImageBuilder::new()
            .code(".text", 0, &[0; 4])
            .export("wide", SymbolType::VmemBuffer, 0x1_8000, 0x100)
            .build();
        assert!(Executable::parse(image.clone(), ChipFamily::T26x).is_ok());
        assert!(matches!(
            Executable::parse(image, ChipFamily::T23x),
            Err(VpuError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.elf");
        fs::write(&path, ImageBuilder::new().code(".text", 0, &[0; 4]).build()).unwrap();
        assert_eq!(Executable::from_file(&path, ChipFamily::T23x).unwrap().code().len(), 1);

        assert!(matches!(
            Executable::from_file(dir.path().join("missing.elf"), ChipFamily::T23x),
            Err(VpuError::FileNotFound { .. })
        ));
    }
}
