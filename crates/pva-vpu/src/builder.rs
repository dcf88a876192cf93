//! Synthetic executable images.
//!
//! Produces minimal little-endian ELF32 images with the section and symbol
//! conventions the loader expects. Used by tests and by `pva simulate` when
//! no real image is at hand.

use crate::image::{
    Elf32Header, Elf32SectionHeader, Elf32Symbol, ELFCLASS32, ELFDATA2LSB, ELF_MAGIC, HEADER_BYTES,
    SECTION_HEADER_BYTES, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS, SHT_STRTAB,
    SHT_SYMTAB, STB_GLOBAL, STT_FUNC, STT_OBJECT, SYMBOL_BYTES,
};
use bytes::{BufMut, Bytes, BytesMut};
use pva_chip::exec::{ExportDescriptor, SymbolType, EXPORTS_SECTION, EXPORT_DESCRIPTOR_BYTES};

/// Link-time address of the `EXPORTS` section. It never reaches VMEM.
pub const EXPORTS_ADDR: u32 = 0xE000_0000;

const ET_EXEC: u16 = 2;

#[derive(Debug, Clone)]
enum Contents {
    Bytes(Vec<u8>),
    Zeroed(u32),
}

#[derive(Debug, Clone)]
struct PlannedSection {
    name: String,
    sh_type: u32,
    flags: u32,
    addr: u32,
    contents: Contents,
    link: u32,
    info: u32,
    entsize: u32,
}

impl PlannedSection {
    fn new(name: &str, sh_type: u32, flags: u32, addr: u32, contents: Contents) -> Self {
        Self {
            name: name.to_string(),
            sh_type,
            flags,
            addr,
            contents,
            link: 0,
            info: 0,
            entsize: 0,
        }
    }
}

/// Builder for synthetic VPU executables.
///
/// ```
/// use pva_chip::exec::SymbolType;
/// use pva_vpu::ImageBuilder;
///
/// let image = ImageBuilder::new()
///     .code(".text", 0, &[0x13, 0, 0, 0])
///     .data(".data", 0x4_0000, &[1, 2, 3])
///     .export("frame", SymbolType::VmemBuffer, 0x4_1000, 256)
///     .build();
/// assert_eq!(&image[..4], b"\x7fELF");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    code: Vec<(String, u32, Vec<u8>)>,
    data: Vec<(String, u32, Contents)>,
    exports: Vec<(String, ExportDescriptor)>,
    dangling: Vec<String>,
    functions: Vec<(String, u32)>,
}

impl ImageBuilder {
    /// Empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code section loaded at instruction address `addr`.
    #[must_use]
    pub fn code(mut self, name: &str, addr: u32, bytes: &[u8]) -> Self {
        self.code.push((name.to_string(), addr, bytes.to_vec()));
        self
    }

    /// Add an initialised data section at VMEM address `addr`.
    #[must_use]
    pub fn data(mut self, name: &str, addr: u32, bytes: &[u8]) -> Self {
        self.data
            .push((name.to_string(), addr, Contents::Bytes(bytes.to_vec())));
        self
    }

    /// Add a zero-initialised data section.
    #[must_use]
    pub fn bss(mut self, name: &str, addr: u32, size: u32) -> Self {
        self.data.push((name.to_string(), addr, Contents::Zeroed(size)));
        self
    }

    /// Export a symbol with a descriptor in the `EXPORTS` section.
    #[must_use]
    pub fn export(mut self, name: &str, ty: SymbolType, addr: u32, size: u32) -> Self {
        let descriptor = ExportDescriptor {
            ty: ty as u32,
            addr,
            size,
        };
        self.exports.push((name.to_string(), descriptor));
        self
    }

    /// Export a symbol whose descriptor lies past the end of `EXPORTS`.
    #[must_use]
    pub fn dangling_export(mut self, name: &str) -> Self {
        self.dangling.push(name.to_string());
        self
    }

    /// Add a global function symbol in the first code section.
    #[must_use]
    pub fn function(mut self, name: &str, addr: u32) -> Self {
        self.functions.push((name.to_string(), addr));
        self
    }

    /// Serialise the image.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Bytes {
        let mut sections = vec![PlannedSection::new("", 0, 0, 0, Contents::Zeroed(0))];
        for (name, addr, bytes) in self.code {
            sections.push(PlannedSection::new(
                &name,
                SHT_PROGBITS,
                SHF_ALLOC | SHF_EXECINSTR,
                addr,
                Contents::Bytes(bytes),
            ));
        }
        let first_code = u16::from(sections.len() > 1);
        for (name, addr, contents) in self.data {
            let sh_type = match contents {
                Contents::Bytes(_) => SHT_PROGBITS,
                Contents::Zeroed(_) => SHT_NOBITS,
            };
            sections.push(PlannedSection::new(&name, sh_type, SHF_ALLOC | SHF_WRITE, addr, contents));
        }

        let mut symbols = vec![Elf32Symbol::default()];
        let mut strtab = vec![0u8];
        let mut intern = |name: &str| {
            let at = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            at
        };
        for (name, addr) in &self.functions {
            symbols.push(Elf32Symbol {
                st_name: intern(name),
                st_value: *addr,
                st_info: (STB_GLOBAL << 4) | STT_FUNC,
                st_shndx: first_code,
                ..Elf32Symbol::default()
            });
        }

        if !self.exports.is_empty() || !self.dangling.is_empty() {
            let index = sections.len() as u16;
            let mut descriptors = Vec::with_capacity(self.exports.len() * EXPORT_DESCRIPTOR_BYTES);
            for (name, descriptor) in &self.exports {
                symbols.push(Elf32Symbol {
                    st_name: intern(name),
                    st_value: EXPORTS_ADDR + descriptors.len() as u32,
                    st_size: EXPORT_DESCRIPTOR_BYTES as u32,
                    st_info: (STB_GLOBAL << 4) | STT_OBJECT,
                    st_shndx: index,
                    ..Elf32Symbol::default()
                });
                descriptors.extend_from_slice(&descriptor.encode());
            }
            for name in &self.dangling {
                symbols.push(Elf32Symbol {
                    st_name: intern(name),
                    st_value: EXPORTS_ADDR + descriptors.len() as u32 + 64,
                    st_size: EXPORT_DESCRIPTOR_BYTES as u32,
                    st_info: (STB_GLOBAL << 4) | STT_OBJECT,
                    st_shndx: index,
                    ..Elf32Symbol::default()
                });
            }
            sections.push(PlannedSection::new(
                EXPORTS_SECTION,
                SHT_PROGBITS,
                SHF_ALLOC,
                EXPORTS_ADDR,
                Contents::Bytes(descriptors),
            ));
        }

        let symtab_index = sections.len();
        let mut symtab = PlannedSection::new(
            ".symtab",
            SHT_SYMTAB,
            0,
            0,
            Contents::Bytes(symbols.iter().flat_map(|s| bytemuck::bytes_of(s).to_vec()).collect()),
        );
        symtab.link = symtab_index as u32 + 1;
        symtab.info = 1;
        symtab.entsize = SYMBOL_BYTES as u32;
        sections.push(symtab);
        sections.push(PlannedSection::new(".strtab", SHT_STRTAB, 0, 0, Contents::Bytes(strtab)));
        let shstrndx = sections.len();
        sections.push(PlannedSection::new(".shstrtab", SHT_STRTAB, 0, 0, Contents::Zeroed(0)));

        let mut shstrtab = vec![0u8];
        let names: Vec<u32> = sections
            .iter()
            .map(|s| {
                if s.name.is_empty() {
                    return 0;
                }
                let at = shstrtab.len() as u32;
                shstrtab.extend_from_slice(s.name.as_bytes());
                shstrtab.push(0);
                at
            })
            .collect();
        sections[shstrndx].contents = Contents::Bytes(shstrtab);

        let mut out = BytesMut::new();
        out.put_bytes(0, HEADER_BYTES);
        let mut headers = Vec::with_capacity(sections.len());
        for (section, name) in sections.iter().zip(&names) {
            pad_to_word(&mut out);
            let offset = out.len() as u32;
            let size = match &section.contents {
                Contents::Bytes(bytes) => {
                    out.put_slice(bytes);
                    bytes.len() as u32
                }
                Contents::Zeroed(size) => *size,
            };
            headers.push(Elf32SectionHeader {
                sh_name: *name,
                sh_type: section.sh_type,
                sh_flags: section.flags,
                sh_addr: section.addr,
                sh_offset: if section.sh_type == 0 { 0 } else { offset },
                sh_size: size,
                sh_link: section.link,
                sh_info: section.info,
                sh_addralign: 4,
                sh_entsize: section.entsize,
            });
        }

        pad_to_word(&mut out);
        let shoff = out.len() as u32;
        for header in &headers {
            out.put_slice(bytemuck::bytes_of(header));
        }

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELF_MAGIC);
        e_ident[4] = ELFCLASS32;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = 1;
        let header = Elf32Header {
            e_ident,
            e_type: ET_EXEC,
            e_version: 1,
            e_shoff: shoff,
            e_ehsize: HEADER_BYTES as u16,
            e_shentsize: SECTION_HEADER_BYTES as u16,
            e_shnum: headers.len() as u16,
            e_shstrndx: shstrndx as u16,
            ..Elf32Header::default()
        };
        out[..HEADER_BYTES].copy_from_slice(bytemuck::bytes_of(&header));
        out.freeze()
    }
}

fn pad_to_word(out: &mut BytesMut) {
    let pad = out.len().next_multiple_of(4) - out.len();
    out.put_bytes(0, pad);
}
