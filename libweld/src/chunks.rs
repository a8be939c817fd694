//! The output chunk model and the passes that fill regular output sections:
//! assigning input sections to output sections, binning them into per-section
//! member lists and computing offsets within each output section.

use crate::alignment;
use crate::alignment::Alignment;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::output_section::OutputSectionId;
use crate::output_section::OutputSections;
use crate::output_section::section_rank;
use crate::parsing::ParsedInput;
use crate::string_merging::MergedSectionId;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::SymbolDb;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Objects are partitioned into slices of this many files for binning.
const BIN_OBJECTS_PER_SLICE: usize = 128;

/// Members are partitioned into slices of this many input sections for
/// offset assignment.
const OFFSET_SLICE_SIZE: usize = 10_000;

/// Something that occupies bytes in the output file.
pub(crate) struct Chunk<'data> {
    pub(crate) kind: ChunkKind,
    pub(crate) name: &'data [u8],
    pub(crate) shdr: OutShdr,

    /// Output section index. 0 for the headers, which aren't sections.
    pub(crate) shndx: u16,

    /// Set during layout for the chunk that begins each PT_LOAD segment.
    pub(crate) starts_new_segment: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkKind {
    Header(HeaderKind),
    Section(OutputSectionId),
    Merged(MergedSectionId),
    Synthetic(SyntheticKind),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum HeaderKind {
    Ehdr,
    Phdr,
    Shdr,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SyntheticKind {
    Interp,
    Got,
    GotPlt,
    Plt,
    RelaPlt,
    RelaDyn,
    Dynsym,
    Dynstr,
    Hash,
    GnuVersion,
    GnuVersionR,
    GnuVersionD,
    Dynamic,
    Copyrel,
    Symtab,
    Strtab,
    Shstrtab,
}

/// The parts of an ELF section header we fill in as layout progresses.
#[derive(Default, Clone, Copy)]
pub(crate) struct OutShdr {
    pub(crate) sh_name: u32,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
}

impl Chunk<'_> {
    pub(crate) fn rank(&self) -> u32 {
        section_rank(self.shdr.sh_flags, self.shdr.sh_type)
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.shdr.sh_flags & u64::from(object::elf::SHF_ALLOC) != 0
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.shdr.sh_type == object::elf::SHT_NOBITS
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.shdr.sh_flags & u64::from(object::elf::SHF_TLS) != 0
    }

    /// How many bytes of the file this chunk occupies.
    pub(crate) fn file_size(&self) -> u64 {
        if self.is_nobits() { 0 } else { self.shdr.sh_size }
    }
}

/// Identifies one input section globally.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SectionMemberId {
    pub(crate) file: u32,
    pub(crate) section: u32,
}

/// The members of one output section, in deterministic order, together with
/// the totals computed by offset assignment.
#[derive(Default)]
pub(crate) struct SectionBin {
    pub(crate) members: Vec<SectionMemberId>,
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,
}

/// Single-threaded pass that maps every loaded input section onto an output
/// section, creating custom output sections as needed. Runs in file priority
/// order so custom section numbering is deterministic.
#[tracing::instrument(skip_all, name = "Assign output sections")]
pub(crate) fn assign_output_sections<'data>(
    files: &mut [ParsedInput<'data>],
    output_sections: &mut OutputSections<'data>,
) {
    for file in files {
        let ParsedInput::Object(obj) = file else {
            continue;
        };
        for slot in &mut obj.sections {
            if let SectionSlot::Loaded(section) = slot {
                section.output_section = output_sections.id_for_input(
                    section.name,
                    section.sh_type,
                    section.sh_flags,
                    section.sh_entsize,
                );
            }
        }
    }
}

/// Groups input sections into their output sections. For determinism without
/// a single-threaded walk, objects are partitioned into slices, each slice
/// builds per-output-section vectors, and the vectors are concatenated in
/// slice order. Each member list is reserved to its exact aggregate size
/// before concatenation.
#[tracing::instrument(skip_all, name = "Bin sections")]
pub(crate) fn bin_sections(files: &[ParsedInput], output_sections: &OutputSections) -> Vec<SectionBin> {
    let num_sections = output_sections.len();

    let objects: Vec<(u32, &ObjectFile)> = files
        .iter()
        .enumerate()
        .filter_map(|(i, f)| match f {
            ParsedInput::Object(obj) => Some((i as u32, obj.as_ref())),
            _ => None,
        })
        .collect();

    let slices: Vec<&[(u32, &ObjectFile)]> = objects.chunks(BIN_OBJECTS_PER_SLICE).collect();

    let groups: Vec<Vec<Vec<SectionMemberId>>> = slices
        .par_iter()
        .map(|slice| {
            let mut group: Vec<Vec<SectionMemberId>> = vec![Vec::new(); num_sections];
            for (file_index, obj) in *slice {
                for (section_index, slot) in obj.sections.iter().enumerate() {
                    if let SectionSlot::Loaded(section) = slot {
                        group[section.output_section.as_usize()].push(SectionMemberId {
                            file: *file_index,
                            section: section_index as u32,
                        });
                    }
                }
            }
            group
        })
        .collect();

    let mut sizes = vec![0usize; num_sections];
    for group in &groups {
        for (i, members) in group.iter().enumerate() {
            sizes[i] += members.len();
        }
    }

    let mut bins: Vec<SectionBin> = Vec::new();
    bins.resize_with(num_sections, SectionBin::default);
    bins.par_iter_mut().enumerate().for_each(|(i, bin)| {
        bin.members.reserve_exact(sizes[i]);
        for group in &groups {
            bin.members.extend_from_slice(&group[i]);
        }
    });
    bins
}

/// Assigns each input section its offset within its output section. Member
/// lists can contain millions of sections, so each list is processed in
/// parallel slices with a prefix scan over the slice sizes.
#[tracing::instrument(skip_all, name = "Assign section offsets")]
pub(crate) fn assign_section_offsets(files: &[ParsedInput], bins: &mut [SectionBin]) {
    bins.par_iter_mut().for_each(|bin| {
        if bin.members.is_empty() {
            return;
        }

        let slices: Vec<&[SectionMemberId]> = bin.members.chunks(OFFSET_SLICE_SIZE).collect();

        // Per slice, compute a local running offset respecting per-section
        // alignment.
        let locals: Vec<(u64, Alignment)> = slices
            .par_iter()
            .map(|slice| {
                let mut offset = 0u64;
                let mut max_alignment = alignment::MIN;
                for member in *slice {
                    let section = loaded_section(files, member);
                    offset = section.alignment.align_up(offset);
                    section.offset.store(offset, Ordering::Relaxed);
                    offset += section.size;
                    max_alignment = max_alignment.max(section.alignment);
                }
                (offset, max_alignment)
            })
            .collect();

        // Prefix-scan the slice sizes with the global max alignment to get
        // each slice's start offset.
        let alignment = locals
            .iter()
            .map(|(_, a)| *a)
            .max()
            .unwrap_or(alignment::MIN);
        let mut starts = Vec::with_capacity(locals.len());
        let mut start = 0u64;
        for (size, _) in &locals {
            starts.push(start);
            start = alignment.align_up(start + size);
        }

        // Add each slice's start to its members' local offsets.
        slices
            .par_iter()
            .zip(starts.par_iter())
            .skip(1)
            .for_each(|(slice, start)| {
                for member in *slice {
                    let section = loaded_section(files, member);
                    section.offset.fetch_add(*start, Ordering::Relaxed);
                }
            });

        bin.size = starts.last().unwrap() + locals.last().unwrap().0;
        bin.alignment = alignment;
    });
}

fn loaded_section<'files, 'data>(
    files: &'files [ParsedInput<'data>],
    member: &SectionMemberId,
) -> &'files crate::object_file::Section<'data> {
    let ParsedInput::Object(obj) = &files[member.file as usize] else {
        panic!("Section member doesn't belong to an object");
    };
    let SectionSlot::Loaded(section) = &obj.sections[member.section as usize] else {
        panic!("Section member isn't loaded");
    };
    section
}

/// Gives every common symbol we own a spot at the end of .bss. Runs after
/// offset assignment, extending the section's size.
#[tracing::instrument(skip_all, name = "Allocate common symbols")]
pub(crate) fn allocate_common_symbols(
    files: &[ParsedInput],
    symbol_db: &mut SymbolDb,
    bins: &mut [SectionBin],
) -> Result {
    use object::read::elf::Sym as _;
    let e = object::LittleEndian;
    let bss = &mut bins[crate::output_section::BSS.as_usize()];

    for file in files {
        let ParsedInput::Object(obj) = file else {
            continue;
        };
        for i in obj.global_symbol_indices() {
            let symbol = obj.object.symbol(i)?;
            if !symbol.is_common(e) {
                continue;
            }
            let id = obj.symbol_id(i);
            let claim = symbol_db.symbol(id).claim();
            if claim.is_none()
                || claim.rank() != ClaimRank::Common
                || claim.priority() != obj.priority
            {
                continue;
            }
            // For commons, st_value holds the required alignment.
            let alignment = Alignment::new(symbol.st_value(e).max(1))?;
            bss.size = alignment.align_up(bss.size);
            bss.alignment = bss.alignment.max(alignment);
            let sym = symbol_db.symbol_mut(id);
            sym.value = bss.size;
            bss.size += symbol.st_size(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_file_size_ignores_nobits() {
        let mut chunk = Chunk {
            kind: ChunkKind::Section(crate::output_section::BSS),
            name: b".bss",
            shdr: OutShdr {
                sh_type: object::elf::SHT_NOBITS,
                sh_size: 0x1000,
                ..Default::default()
            },
            shndx: 1,
            starts_new_segment: false,
        };
        assert_eq!(chunk.file_size(), 0);
        chunk.shdr.sh_type = object::elf::SHT_PROGBITS;
        assert_eq!(chunk.file_size(), 0x1000);
    }
}
