//! ELF32 container of a VPU executable.
//!
//! Only the parts the loader needs are modelled: the file header, the
//! section header table, and symbol table entries. All on-disk records are
//! little-endian, which is also the byte order of every supported host.
//!
//! [`ElfImage::parse`] checks structural integrity once, up front: every
//! section's contents, every name and the symbol table must lie inside the
//! image. Later stages index the image without further bounds worries.

use crate::error::{Result, VpuError};
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;

/// `\x7fELF`
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// `EI_CLASS` value for 32-bit objects.
pub const ELFCLASS32: u8 = 1;

/// `EI_DATA` value for little-endian objects.
pub const ELFDATA2LSB: u8 = 1;

/// Section holds program-defined contents.
pub const SHT_PROGBITS: u32 = 1;
/// Section is a symbol table.
pub const SHT_SYMTAB: u32 = 2;
/// Section is a string table.
pub const SHT_STRTAB: u32 = 3;
/// Section occupies no file space (zero-initialised).
pub const SHT_NOBITS: u32 = 8;

/// Section is writable at run time.
pub const SHF_WRITE: u32 = 0x1;
/// Section is loaded.
pub const SHF_ALLOC: u32 = 0x2;
/// Section holds instructions.
pub const SHF_EXECINSTR: u32 = 0x4;

/// Symbol binding: global.
pub const STB_GLOBAL: u8 = 1;
/// Symbol type: data object.
pub const STT_OBJECT: u8 = 1;
/// Symbol type: function.
pub const STT_FUNC: u8 = 2;

/// ELF32 file header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)] // Field names follow the ELF specification
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 section header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)] // Field names follow the ELF specification
pub struct Elf32SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

/// ELF32 symbol table entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[allow(missing_docs)] // Field names follow the ELF specification
pub struct Elf32Symbol {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Elf32Symbol {
    /// Binding (`STB_*`).
    pub const fn binding(&self) -> u8 {
        self.st_info >> 4
    }

    /// Type (`STT_*`).
    pub const fn kind(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// Size of [`Elf32Header`].
pub const HEADER_BYTES: usize = std::mem::size_of::<Elf32Header>();
/// Size of [`Elf32SectionHeader`].
pub const SECTION_HEADER_BYTES: usize = std::mem::size_of::<Elf32SectionHeader>();
/// Size of [`Elf32Symbol`].
pub const SYMBOL_BYTES: usize = std::mem::size_of::<Elf32Symbol>();

/// A section header with its resolved name.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// Section name from the section-name string table.
    pub name: String,
    /// Raw header.
    pub header: Elf32SectionHeader,
}

impl SectionInfo {
    /// Whether the section is loaded and holds instructions.
    pub const fn is_code(&self) -> bool {
        self.header.sh_type == SHT_PROGBITS
            && self.header.sh_flags & (SHF_ALLOC | SHF_EXECINSTR) == SHF_ALLOC | SHF_EXECINSTR
    }

    /// Whether the section is loaded data.
    pub const fn is_data(&self) -> bool {
        (self.header.sh_type == SHT_PROGBITS || self.header.sh_type == SHT_NOBITS)
            && self.header.sh_flags & SHF_ALLOC != 0
            && self.header.sh_flags & SHF_EXECINSTR == 0
    }
}

/// A structurally validated ELF32 image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    data: Bytes,
    header: Elf32Header,
    sections: Vec<SectionInfo>,
}

fn read_pod<T: Pod>(data: &[u8], offset: usize, what: &str) -> Result<T> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .filter(|&end| end <= data.len())
        .ok_or_else(|| VpuError::invalid_format(format!("{what} at {offset:#x} past end of image")))?;
    bytemuck::try_pod_read_unaligned(&data[offset..end])
        .map_err(|e| VpuError::invalid_format(format!("{what}: {e}")))
}

fn c_str(table: &[u8], offset: u32, what: &str) -> Result<String> {
    let start = offset as usize;
    let tail = table
        .get(start..)
        .ok_or_else(|| VpuError::invalid_format(format!("{what} name offset {offset} out of range")))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| VpuError::invalid_format(format!("{what} name is not terminated")))?;
    std::str::from_utf8(&tail[..len])
        .map(str::to_string)
        .map_err(|_| VpuError::invalid_format(format!("{what} name is not UTF-8")))
}

impl ElfImage {
    /// Validate `data` as a little-endian ELF32 image.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad header, a section table or section
    /// contents outside the image, or unreadable section names.
    pub fn parse(data: impl Into<Bytes>) -> Result<Self> {
        let data: Bytes = data.into();
        let header: Elf32Header = read_pod(&data, 0, "ELF header")?;

        if header.e_ident[..4] != ELF_MAGIC {
            return Err(VpuError::invalid_format("missing ELF magic"));
        }
        if header.e_ident[4] != ELFCLASS32 || header.e_ident[5] != ELFDATA2LSB {
            return Err(VpuError::invalid_format(format!(
                "expected a little-endian ELF32 image (class {}, data {})",
                header.e_ident[4], header.e_ident[5]
            )));
        }
        if header.e_shnum == 0 || usize::from(header.e_shentsize) != SECTION_HEADER_BYTES {
            return Err(VpuError::invalid_format(format!(
                "section table of {} entries of {} bytes",
                header.e_shnum, header.e_shentsize
            )));
        }
        if header.e_shstrndx >= header.e_shnum {
            return Err(VpuError::invalid_format(format!(
                "section name table index {} out of range",
                header.e_shstrndx
            )));
        }

        let shoff = header.e_shoff as usize;
        let mut raw = Vec::with_capacity(usize::from(header.e_shnum));
        for i in 0..usize::from(header.e_shnum) {
            let sh: Elf32SectionHeader =
                read_pod(&data, shoff.saturating_add(i * SECTION_HEADER_BYTES), "section header")?;
            if sh.sh_type != SHT_NOBITS {
                let end = u64::from(sh.sh_offset) + u64::from(sh.sh_size);
                if end > data.len() as u64 {
                    return Err(VpuError::invalid_format(format!(
                        "section {i} contents {:#x}+{:#x} past end of image",
                        sh.sh_offset, sh.sh_size
                    )));
                }
            }
            raw.push(sh);
        }

        let names = &raw[usize::from(header.e_shstrndx)];
        if names.sh_type != SHT_STRTAB {
            return Err(VpuError::invalid_format("section name table is not a string table"));
        }
        let start = names.sh_offset as usize;
        let names = &data[start..start + names.sh_size as usize];
        let sections = raw
            .into_iter()
            .map(|header| {
                Ok(SectionInfo {
                    name: c_str(names, header.sh_name, "section")?,
                    header,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("ELF32 image: {} bytes, {} sections", data.len(), sections.len());
        Ok(Self {
            data,
            header,
            sections,
        })
    }

    /// File header.
    pub const fn header(&self) -> &Elf32Header {
        &self.header
    }

    /// Every section, index 0 included.
    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    /// Index of the first section called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// File contents of section `index` (empty for `SHT_NOBITS`).
    ///
    /// Zero-copy: the returned buffer shares the image.
    pub fn contents(&self, index: usize) -> Bytes {
        match self.sections.get(index) {
            Some(s) if s.header.sh_type != SHT_NOBITS => {
                let start = s.header.sh_offset as usize;
                self.data.slice(start..start + s.header.sh_size as usize)
            }
            _ => Bytes::new(),
        }
    }

    /// The symbol table and its string table, if the image has one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the table's entry size or string table
    /// link is wrong, or a symbol name cannot be read.
    pub fn symbols(&self) -> Result<Vec<(String, Elf32Symbol)>> {
        let Some(index) = self
            .sections
            .iter()
            .position(|s| s.header.sh_type == SHT_SYMTAB)
        else {
            return Ok(Vec::new());
        };
        let symtab = &self.sections[index].header;
        if symtab.sh_entsize as usize != SYMBOL_BYTES || symtab.sh_size as usize % SYMBOL_BYTES != 0 {
            return Err(VpuError::invalid_format(format!(
                "symbol table entry size {} / size {}",
                symtab.sh_entsize, symtab.sh_size
            )));
        }
        let link = symtab.sh_link as usize;
        if !self
            .sections
            .get(link)
            .is_some_and(|s| s.header.sh_type == SHT_STRTAB)
        {
            return Err(VpuError::invalid_format("symbol table has no string table"));
        }
        let strings = self.contents(link);

        let entries = self.contents(index);
        entries
            .chunks_exact(SYMBOL_BYTES)
            .map(|raw| {
                let symbol: Elf32Symbol = read_pod(raw, 0, "symbol")?;
                Ok((c_str(&strings, symbol.st_name, "symbol")?, symbol))
            })
            .collect()
    }
}
