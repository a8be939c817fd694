//! Type aliases and helpers for reading 64 bit little-endian ELF via the
//! `object` crate, plus the constants we need when producing output.

use crate::error::Result;
use anyhow::Context;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;

/// Our starting address in memory when linking non-relocatable executables.
/// The same as what GNU ld picks; a distinctive non-zero value also makes it
/// obvious when file and memory offsets get mixed up.
pub(crate) const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type DynamicEntry = object::elf::Dyn64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type Verneed = object::elf::Verneed<LittleEndian>;
pub(crate) type Vernaux = object::elf::Vernaux<LittleEndian>;
pub(crate) type Verdef = object::elf::Verdef<LittleEndian>;
pub(crate) type Verdaux = object::elf::Verdaux<LittleEndian>;
pub(crate) type Versym = object::elf::Versym<LittleEndian>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

/// A parsed input file. Depending on the file kind, `symbols` is either the
/// symtab or the dynsym.
pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) sections: SectionTable<'data>,
    pub(crate) symbols: SymbolTable<'data>,
    pub(crate) relocations: object::read::elf::RelocationSections,

    /// Index of the first non-local symbol table entry (`sh_info` of the
    /// symbol table section).
    pub(crate) first_global: usize,

    pub(crate) versym: &'data [Versym],

    /// An iterator over the version definitions and the corresponding linked
    /// string table index.
    pub(crate) verdef: Option<(
        object::read::elf::VerdefIterator<'data, FileHeader>,
        object::SectionIndex,
    )>,

    pub(crate) dynamic: &'data [DynamicEntry],
    dynamic_strings_index: object::SectionIndex,
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8], is_dynamic: bool) -> Result<Self> {
        let header = FileHeader::parse(data)?;
        let e = header.endian()?;
        let sections = header.sections(e, data)?;

        let mut symbols = SymbolTable::default();
        let mut first_global = 0;
        let mut versym: &[Versym] = &[];
        let mut verdef = None;
        let mut dynamic: &[DynamicEntry] = &[];
        let mut dynamic_strings_index = object::SectionIndex(0);

        // Find all the sections we're interested in in a single scan of the
        // section table so as to avoid multiple scans.
        for (section_index, section) in sections.enumerate() {
            match section.sh_type.get(e) {
                object::elf::SHT_DYNSYM if is_dynamic => {
                    symbols = SymbolTable::parse(e, data, &sections, section_index, section)?;
                    first_global = section.sh_info.get(e) as usize;
                }
                object::elf::SHT_SYMTAB if !is_dynamic => {
                    symbols = SymbolTable::parse(e, data, &sections, section_index, section)?;
                    first_global = section.sh_info.get(e) as usize;
                }
                object::elf::SHT_GNU_VERSYM => {
                    versym = section.data_as_array(e, data)?;
                }
                object::elf::SHT_GNU_VERDEF => {
                    verdef = section.gnu_verdef(e, data)?;
                }
                object::elf::SHT_DYNAMIC => {
                    dynamic = section.data_as_array(e, data)?;
                    dynamic_strings_index = object::SectionIndex(section.sh_link.get(e) as usize);
                }
                _ => {}
            }
        }

        let relocations = if is_dynamic {
            object::read::elf::RelocationSections::default()
        } else {
            sections.relocation_sections(e, symbols.section())?
        };

        Ok(Self {
            data,
            sections,
            symbols,
            relocations,
            first_global,
            versym,
            verdef,
            dynamic,
            dynamic_strings_index,
        })
    }

    pub(crate) fn section(&self, index: object::SectionIndex) -> Result<&'data SectionHeader> {
        Ok(self.sections.section(index)?)
    }

    pub(crate) fn section_name(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LittleEndian, section)?)
    }

    pub(crate) fn section_data(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(section.data(LittleEndian, self.data)?)
    }

    pub(crate) fn relocations(&self, index: object::SectionIndex) -> Result<&'data [Rela]> {
        let Some(rela_index) = self.relocations.get(index) else {
            return Ok(&[]);
        };
        let rela_section = self.sections.section(rela_index)?;
        let Some((rela, _)) = rela_section.rela(LittleEndian, self.data)? else {
            return Ok(&[]);
        };
        Ok(rela)
    }

    pub(crate) fn symbol(&self, index: object::SymbolIndex) -> Result<&'data SymtabEntry> {
        Ok(self.symbols.symbol(index)?)
    }

    pub(crate) fn symbol_name(&self, symbol: &SymtabEntry) -> Result<&'data [u8]> {
        Ok(self.symbols.symbol_name(LittleEndian, symbol)?)
    }

    /// Looks up a string in the string table linked from the dynamic section.
    pub(crate) fn dynamic_string(&self, offset: u64) -> Result<&'data [u8]> {
        let strings = self
            .sections
            .strings(LittleEndian, self.data, self.dynamic_strings_index)?;
        strings
            .get(u32::try_from(offset).context("Dynamic string offset out of range")?)
            .map_err(|()| anyhow!("Invalid dynamic string offset 0x{offset:x}"))
    }

    /// Looks up a string in the string table of the named section index.
    pub(crate) fn strings_in(&self, index: object::SectionIndex, offset: u64) -> Result<&'data [u8]> {
        let strings = self.sections.strings(LittleEndian, self.data, index)?;
        strings
            .get(u32::try_from(offset).context("String offset out of range")?)
            .map_err(|()| anyhow!("Invalid string offset 0x{offset:x}"))
    }
}

pub(crate) fn slice_from_all_bytes_mut<T: object::Pod>(data: &mut [u8]) -> &mut [T] {
    object::slice_from_bytes_mut(data, data.len() / size_of::<T>())
        .unwrap()
        .0
}

/// These sizes are from the spec (for 64 bit ELF).
pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = size_of::<SymtabEntry>() as u64;
pub(crate) const VERSYM_ENTRY_SIZE: u64 = size_of::<Versym>() as u64;

/// Number of reserved entries at the start of .got.plt: the address of
/// .dynamic plus two slots owned by the runtime loader.
pub(crate) const GOT_PLT_RESERVED_ENTRIES: u64 = 3;

const _ASSERTS: () = {
    assert!(FILE_HEADER_SIZE as usize == size_of::<FileHeader>());
    assert!(PROGRAM_HEADER_SIZE as usize == size_of::<ProgramHeader>());
    assert!(SECTION_HEADER_SIZE as usize == size_of::<SectionHeader>());
    assert!(RELA_ENTRY_SIZE as usize == size_of::<Rela>());
};
