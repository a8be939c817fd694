//! Parses one relocatable object: sections, symbols, relocations, COMDAT
//! groups and mergeable string pieces, then participates in symbol
//! resolution.

use crate::alignment::Alignment;
use crate::elf;
use crate::error::Result;
use crate::hash::PreHashed;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::output_section::OutputSectionId;
use crate::string_merging::MergeableSection;
use crate::string_merging::split_into_pieces;
use crate::symbol::SymbolName;
use crate::symbol_db::Claim;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::PendingSymbols;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::Context as _;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::Sym as _;
use smallvec::SmallVec;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) object: Box<elf::File<'data>>,

    /// Unique tie-break order. Lower priorities win. Assigned after parsing:
    /// non-archive objects first, archive members next, DSOs last.
    pub(crate) priority: u32,

    pub(crate) is_in_archive: bool,
    pub(crate) is_alive: AtomicBool,

    /// One slot per input section.
    pub(crate) sections: Vec<SectionSlot<'data>>,

    pub(crate) comdat_groups: Vec<ComdatGroup<'data>>,

    pub(crate) mergeable_sections: Vec<MergeableSection<'data>>,

    /// Interned IDs for our global symbols. Index `i` corresponds to symbol
    /// table index `first_global + i`.
    pub(crate) global_symbol_ids: Vec<SymbolId>,
}

pub(crate) enum SectionSlot<'data> {
    Discard,
    Loaded(Section<'data>),

    /// Index into `mergeable_sections`.
    MergeStrings(usize),
}

pub(crate) struct Section<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,

    /// Which output section this input section lands in. Assigned in a
    /// single-threaded pass once all objects are parsed.
    pub(crate) output_section: OutputSectionId,

    /// Offset within the output section. Written exactly once during offset
    /// assignment; each input section belongs to exactly one output section
    /// member list, so writes are disjoint.
    pub(crate) offset: AtomicU64,
}

pub(crate) const UNASSIGNED_SECTION: OutputSectionId = OutputSectionId::placeholder();

pub(crate) struct ComdatGroup<'data> {
    pub(crate) signature: PreHashed<SymbolName<'data>>,

    /// Input section indices of the group members.
    pub(crate) members: SmallVec<[u32; 4]>,
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(input: &InputBytes<'data>) -> Result<Self> {
        let object = Box::new(
            elf::File::parse(input.data, false)
                .with_context(|| format!("Failed to parse object file `{}`", input.input))?,
        );
        let e = LittleEndian;

        let mut sections = Vec::with_capacity(object.sections.len());
        let mut comdat_groups = Vec::new();
        let mut mergeable_sections = Vec::new();

        for (index, section) in object.sections.enumerate() {
            let name = object.section_name(section)?;
            let sh_type = section.sh_type.get(e);
            let sh_flags = section.sh_flags.get(e);

            let slot = match sh_type {
                object::elf::SHT_NULL
                | object::elf::SHT_SYMTAB
                | object::elf::SHT_STRTAB
                | object::elf::SHT_RELA
                | object::elf::SHT_REL
                | object::elf::SHT_SYMTAB_SHNDX => SectionSlot::Discard,
                object::elf::SHT_GROUP => {
                    if let Some(group) = parse_comdat_group(&object, section, index)? {
                        comdat_groups.push(group);
                    }
                    SectionSlot::Discard
                }
                _ if sh_flags & u64::from(object::elf::SHF_EXCLUDE) != 0 => SectionSlot::Discard,
                _ if name == b".note.GNU-stack" => SectionSlot::Discard,
                _ if is_string_merge(sh_flags, sh_type) => {
                    let data = object.section_data(section)?;
                    let pieces = split_into_pieces(data).with_context(|| {
                        format!(
                            "String in merge section `{}` of `{}` is not null-terminated",
                            String::from_utf8_lossy(name),
                            input.input
                        )
                    })?;
                    mergeable_sections.push(MergeableSection::new(
                        index,
                        name,
                        sh_flags,
                        section.sh_entsize.get(e),
                        Alignment::new(section.sh_addralign.get(e))?,
                        data,
                        pieces,
                    ));
                    SectionSlot::MergeStrings(mergeable_sections.len() - 1)
                }
                _ => SectionSlot::Loaded(Section {
                    index,
                    name,
                    sh_type,
                    sh_flags,
                    sh_entsize: section.sh_entsize.get(e),
                    size: section.sh_size.get(e),
                    alignment: Alignment::new(section.sh_addralign.get(e))?,
                    output_section: UNASSIGNED_SECTION,
                    offset: AtomicU64::new(0),
                }),
            };
            sections.push(slot);
        }

        Ok(Self {
            input: input.input,
            object,
            priority: 0,
            is_in_archive: input.has_archive_semantics,
            is_alive: AtomicBool::new(!input.has_archive_semantics),
            sections,
            comdat_groups,
            mergeable_sections,
            global_symbol_ids: Vec::new(),
        })
    }

    pub(crate) fn num_globals(&self) -> usize {
        self.object.symbols.len().saturating_sub(self.object.first_global)
    }

    /// Collects this file's global symbol names (defined and undefined),
    /// pre-bucketed for the symbol store build.
    pub(crate) fn pending_symbols(&self, num_buckets: usize) -> Result<PendingSymbols<'data>> {
        let mut pending = PendingSymbols::new(num_buckets);
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            pending.add(SymbolName::prehashed(self.object.symbol_name(symbol)?));
        }
        Ok(pending)
    }

    pub(crate) fn populate_symbol_ids(&mut self, symbol_db: &SymbolDb<'data>) -> Result {
        let mut ids = Vec::with_capacity(self.num_globals());
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            let name = SymbolName::prehashed(self.object.symbol_name(symbol)?);
            ids.push(
                symbol_db
                    .lookup(name)
                    .expect("All global names were interned during the build"),
            );
        }
        self.global_symbol_ids = ids;
        Ok(())
    }

    pub(crate) fn global_symbol_indices(
        &self,
    ) -> std::iter::Map<std::ops::Range<usize>, fn(usize) -> object::SymbolIndex> {
        (self.object.first_global..self.object.symbols.len()).map(object::SymbolIndex)
    }

    pub(crate) fn symbol_id(&self, index: object::SymbolIndex) -> SymbolId {
        self.global_symbol_ids[index.0 - self.object.first_global]
    }

    /// Offers all of this file's defined global symbols to the store. Files
    /// that aren't part of the link yet (archive members) offer lazy claims;
    /// activation re-offers live ones.
    pub(crate) fn resolve_symbols(&self, symbol_db: &SymbolDb<'data>) -> Result {
        let e = LittleEndian;
        let alive = self.is_alive.load(Ordering::Relaxed);
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            if symbol.is_undefined(e) {
                continue;
            }
            let rank = if !alive {
                ClaimRank::Lazy
            } else if symbol.is_weak() {
                ClaimRank::Weak
            } else if symbol.is_common(e) {
                ClaimRank::Common
            } else {
                ClaimRank::Strong
            };
            symbol_db.offer_claim(
                self.symbol_id(i),
                Claim::new(rank, self.priority, i.0 as u32),
            );
        }
        Ok(())
    }

    /// Activates this file if it wasn't already active. Returns whether we
    /// transitioned it.
    pub(crate) fn activate(&self) -> bool {
        !self.is_alive.swap(true, Ordering::AcqRel)
    }
}

fn is_string_merge(sh_flags: u64, sh_type: u32) -> bool {
    sh_type == object::elf::SHT_PROGBITS
        && sh_flags & u64::from(object::elf::SHF_MERGE) != 0
        && sh_flags & u64::from(object::elf::SHF_STRINGS) != 0
        && sh_flags & u64::from(object::elf::SHF_WRITE) == 0
}

fn parse_comdat_group<'data>(
    object: &elf::File<'data>,
    section: &'data elf::SectionHeader,
    index: object::SectionIndex,
) -> Result<Option<ComdatGroup<'data>>> {
    let e = LittleEndian;
    let data = object.section_data(section)?;
    let words: &[object::U32<LittleEndian>] =
        object::slice_from_bytes(data, data.len() / 4).map_err(|()| {
            anyhow::anyhow!("Invalid SHT_GROUP section at index {}", index.0)
        })?.0;
    let Some((flags, members)) = words.split_first() else {
        bail!("Empty SHT_GROUP section");
    };
    if flags.get(e) & object::elf::GRP_COMDAT == 0 {
        return Ok(None);
    }
    // The group's signature symbol is named by sh_info, resolved through the
    // symbol table in sh_link.
    let signature_index = object::SymbolIndex(section.sh_info.get(e) as usize);
    let signature_symbol = object.symbol(signature_index)?;
    let signature = SymbolName::prehashed(object.symbol_name(signature_symbol)?);
    Ok(Some(ComdatGroup {
        signature,
        members: members.iter().map(|m| m.get(e)).collect(),
    }))
}

impl std::fmt::Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}
