//! The output layout engine. Builds the chunk list, orders it by section
//! rank, assigns file offsets and virtual addresses under the page-alignment
//! congruence rule, derives program headers from runs of equal-class chunks
//! and binds the linker-synthesized symbols to their computed addresses.

use crate::alignment;
use crate::arch::Arch;
use crate::chunks::Chunk;
use crate::chunks::ChunkKind;
use crate::chunks::HeaderKind;
use crate::chunks::OutShdr;
use crate::chunks::SyntheticKind;
use crate::context::Context;
use crate::dynamic::StringTable;
use crate::elf;
use crate::error::Result;
use crate::object_file::SectionSlot;
use crate::output_section;
use crate::output_section::OutputSectionId;
use crate::parsing::ParsedInput;
use crate::parsing::SyntheticPlacement;
use crate::resolution::FilesByPriority;
use crate::string_merging::{MergeSectionRef, MergedSectionId};
use crate::string_merging::piece_output_offset;
use crate::symbol::SymbolName;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::anyhow;
use itertools::Itertools as _;
use object::LittleEndian;
use object::read::elf::Sym as _;
use std::sync::atomic::Ordering;

pub(crate) struct Layout {
    pub(crate) file_size: u64,
    pub(crate) segments: Vec<Segment>,
    pub(crate) tls_start: u64,
    pub(crate) tls_end: u64,
    pub(crate) entry_address: u64,
    pub(crate) num_dyn_relocations: u64,

    /// Chunk index for each output section / merged section id.
    section_chunk: Vec<Option<u32>>,
    merged_chunk: Vec<Option<u32>>,

    pub(crate) symtab: SymtabData,
    pub(crate) shstrtab: StringTable,
}

pub(crate) struct SymtabData {
    pub(crate) entries: Vec<SymtabEntryOut>,
    pub(crate) strtab: StringTable,
}

#[derive(Clone, Copy)]
pub(crate) struct SymtabEntryOut {
    pub(crate) symbol: SymbolId,
    pub(crate) name_offset: u32,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) offset: u64,
    pub(crate) vaddr: u64,
    pub(crate) filesz: u64,
    pub(crate) memsz: u64,
    pub(crate) align: u64,
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<'data, A: Arch>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &mut SymbolDb<'data>,
    ctx: &mut Context<'data>,
) -> Result<Layout> {
    let symtab = build_symtab(files, symbol_db);
    let num_dyn_relocations = ctx.dynamic.num_dyn_relocations(symbol_db);

    ctx.chunks = create_chunks::<A>(ctx, &symtab, num_dyn_relocations)?;
    sort_chunks(&mut ctx.chunks);
    mark_segment_starts(&mut ctx.chunks);

    let (section_chunk, merged_chunk) = index_chunks(ctx);
    let shstrtab = assign_shndx_and_names(&mut ctx.chunks);
    fix_header_sizes(ctx, num_dyn_relocations);
    fix_link_fields(ctx);

    let file_size = assign_offsets_and_addresses(&mut ctx.chunks, ctx.args.base_address());
    let segments = build_segments(&ctx.chunks);
    let (tls_start, tls_end) = tls_range(&segments);

    let mut layout = Layout {
        file_size,
        segments,
        tls_start,
        tls_end,
        entry_address: 0,
        num_dyn_relocations,
        section_chunk,
        merged_chunk,
        symtab,
        shstrtab,
    };

    bind_synthetic_symbols(files, symbol_db, ctx, &layout);
    layout.entry_address = entry_address(files, by_priority, symbol_db, ctx, &layout)?;
    Ok(layout)
}

impl Layout {
    pub(crate) fn section_chunk_index(&self, id: OutputSectionId) -> Option<usize> {
        self.section_chunk
            .get(id.as_usize())
            .copied()
            .flatten()
            .map(|i| i as usize)
    }

    pub(crate) fn merged_chunk_index(&self, id: MergedSectionId) -> Option<usize> {
        self.merged_chunk
            .get(id.as_usize())
            .copied()
            .flatten()
            .map(|i| i as usize)
    }

    pub(crate) fn section_address(&self, ctx: &Context, id: OutputSectionId) -> u64 {
        self.section_chunk_index(id)
            .map_or(0, |i| ctx.chunks[i].shdr.sh_addr)
    }
}

pub(crate) fn chunk_by_kind<'chunks, 'data>(
    ctx: &'chunks Context<'data>,
    kind: ChunkKind,
) -> Option<&'chunks Chunk<'data>> {
    ctx.chunks.iter().find(|c| c.kind == kind)
}

pub(crate) fn synthetic_chunk_address(ctx: &Context, kind: SyntheticKind) -> u64 {
    chunk_by_kind(ctx, ChunkKind::Synthetic(kind)).map_or(0, |c| c.shdr.sh_addr)
}

/// The output symbol table: one entry per defined global we own, plus the
/// linker-synthesized symbols. Entry values are resolved at write time.
#[tracing::instrument(skip_all, name = "Build symbol table")]
fn build_symtab<'data>(files: &[ParsedInput<'data>], symbol_db: &SymbolDb<'data>) -> SymtabData {
    let mut entries = Vec::new();
    let mut strtab = StringTable::new();

    let file_order = files
        .iter()
        .enumerate()
        .sorted_by_key(|(_, f)| f.priority())
        .map(|(i, _)| i)
        .collect_vec();

    for file_index in file_order {
        match &files[file_index] {
            ParsedInput::Prelude(prelude) => {
                for def in &prelude.symbol_definitions {
                    let Some(id) = symbol_db.lookup(SymbolName::prehashed(def.name)) else {
                        continue;
                    };
                    let claim = symbol_db.symbol(id).claim();
                    if claim.is_none() || claim.priority() != crate::parsing::PRELUDE_PRIORITY {
                        continue;
                    }
                    let name_offset = strtab.get_or_add(def.name);
                    entries.push(SymtabEntryOut {
                        symbol: id,
                        name_offset,
                    });
                }
            }
            ParsedInput::Object(obj) => {
                for i in obj.global_symbol_indices() {
                    let Ok(symbol) = obj.object.symbol(i) else {
                        continue;
                    };
                    if symbol.is_undefined(LittleEndian) {
                        continue;
                    }
                    let id = obj.symbol_id(i);
                    let claim = symbol_db.symbol(id).claim();
                    if claim.is_none() || claim.priority() != obj.priority {
                        continue;
                    }
                    let name_offset = strtab.get_or_add(symbol_db.name(id).bytes());
                    entries.push(SymtabEntryOut {
                        symbol: id,
                        name_offset,
                    });
                }
            }
            ParsedInput::Shared(_) => {}
        }
    }

    SymtabData { entries, strtab }
}

const SHF_A: u64 = object::elf::SHF_ALLOC as u64;
const SHF_AW: u64 = (object::elf::SHF_ALLOC | object::elf::SHF_WRITE) as u64;
const SHF_AX: u64 = (object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR) as u64;

#[tracing::instrument(skip_all, name = "Create chunks")]
fn create_chunks<'data, A: Arch>(
    ctx: &Context<'data>,
    symtab: &SymtabData,
    num_dyn_relocations: u64,
) -> Result<Vec<Chunk<'data>>> {
    use SyntheticKind as K;
    use object::elf as e;

    let mut chunks = Vec::new();

    for header in [HeaderKind::Ehdr, HeaderKind::Phdr, HeaderKind::Shdr] {
        chunks.push(Chunk {
            kind: ChunkKind::Header(header),
            name: b"",
            shdr: OutShdr {
                sh_flags: if header == HeaderKind::Shdr { 0 } else { SHF_A },
                sh_addralign: 8,
                ..Default::default()
            },
            shndx: 0,
            starts_new_segment: false,
        });
    }

    let synth = |kind, name: &'data [u8], sh_type, sh_flags, size, alignment, entsize| Chunk {
        kind: ChunkKind::Synthetic(kind),
        name,
        shdr: OutShdr {
            sh_type,
            sh_flags,
            sh_size: size,
            sh_addralign: alignment,
            sh_entsize: entsize,
            ..Default::default()
        },
        shndx: 0,
        starts_new_segment: false,
    };

    if ctx.args.needs_interp() {
        let path = ctx.args.dynamic_linker.as_deref().unwrap();
        let size = std::os::unix::ffi::OsStrExt::as_bytes(path.as_os_str()).len() as u64 + 1;
        chunks.push(synth(K::Interp, b".interp", e::SHT_PROGBITS, SHF_A, size, 1, 0));
    }

    let dynamic = &ctx.dynamic;
    if ctx.args.needs_dynamic() {
        let num_dynsym = dynamic.num_dynsym();
        chunks.push(synth(
            K::Dynsym,
            b".dynsym",
            e::SHT_DYNSYM,
            SHF_A,
            num_dynsym * elf::SYMTAB_ENTRY_SIZE,
            8,
            elf::SYMTAB_ENTRY_SIZE,
        ));
        chunks.push(synth(
            K::GnuVersion,
            b".gnu.version",
            e::SHT_GNU_VERSYM,
            SHF_A,
            num_dynsym * elf::VERSYM_ENTRY_SIZE,
            alignment::VERSYM.value(),
            elf::VERSYM_ENTRY_SIZE,
        ));
        if !dynamic.verneed.is_empty() {
            chunks.push(synth(
                K::GnuVersionR,
                b".gnu.version_r",
                e::SHT_GNU_VERNEED,
                SHF_A,
                dynamic.verneed.len() as u64,
                4,
                0,
            ));
        }
        if !dynamic.verdef.is_empty() {
            chunks.push(synth(
                K::GnuVersionD,
                b".gnu.version_d",
                e::SHT_GNU_VERDEF,
                SHF_A,
                dynamic.verdef.len() as u64,
                4,
                0,
            ));
        }
        chunks.push(synth(
            K::Hash,
            b".hash",
            e::SHT_HASH,
            SHF_A,
            (2 + num_dynsym * 2) * 4,
            4,
            4,
        ));
        chunks.push(synth(
            K::Dynstr,
            b".dynstr",
            e::SHT_STRTAB,
            SHF_A,
            dynamic.dynstr.len(),
            1,
            0,
        ));
        if num_dyn_relocations > 0 {
            chunks.push(synth(
                K::RelaDyn,
                b".rela.dyn",
                e::SHT_RELA,
                SHF_A,
                num_dyn_relocations * elf::RELA_ENTRY_SIZE,
                8,
                elf::RELA_ENTRY_SIZE,
            ));
        }
        if !dynamic.plt.is_empty() {
            chunks.push(synth(
                K::RelaPlt,
                b".rela.plt",
                e::SHT_RELA,
                SHF_A,
                dynamic.num_plt_relocations() * elf::RELA_ENTRY_SIZE,
                8,
                elf::RELA_ENTRY_SIZE,
            ));
        }
        chunks.push(synth(
            K::Dynamic,
            b".dynamic",
            e::SHT_DYNAMIC,
            SHF_AW,
            dynamic_entries(ctx, num_dyn_relocations).len() as u64 * 16,
            8,
            16,
        ));
    }

    if !dynamic.plt.is_empty() {
        chunks.push(synth(
            K::Plt,
            b".plt",
            e::SHT_PROGBITS,
            SHF_AX,
            dynamic.plt.len() as u64 * A::PLT_ENTRY_SIZE,
            alignment::PLT.value(),
            A::PLT_ENTRY_SIZE,
        ));
    }
    if !dynamic.got.is_empty() {
        chunks.push(synth(
            K::Got,
            b".got",
            e::SHT_PROGBITS,
            SHF_AW,
            dynamic.got.len() as u64 * elf::GOT_ENTRY_SIZE,
            8,
            elf::GOT_ENTRY_SIZE,
        ));
    }
    if ctx.args.needs_dynamic() || !dynamic.plt.is_empty() {
        chunks.push(synth(
            K::GotPlt,
            b".got.plt",
            e::SHT_PROGBITS,
            SHF_AW,
            (elf::GOT_PLT_RESERVED_ENTRIES + dynamic.plt.len() as u64) * elf::GOT_ENTRY_SIZE,
            8,
            elf::GOT_ENTRY_SIZE,
        ));
    }
    if dynamic.copyrel_size > 0 {
        chunks.push(synth(
            K::Copyrel,
            b".copyrel",
            e::SHT_NOBITS,
            SHF_AW,
            dynamic.copyrel_size,
            32,
            0,
        ));
    }

    for id in ctx.output_sections.ids() {
        let details = ctx.output_sections.details(id);
        let bin = &ctx.bins[id.as_usize()];
        chunks.push(Chunk {
            kind: ChunkKind::Section(id),
            name: details.name,
            shdr: OutShdr {
                sh_type: details.sh_type,
                sh_flags: details.sh_flags,
                sh_size: bin.size,
                sh_addralign: bin.alignment.max(details.min_alignment).value(),
                sh_entsize: details.sh_entsize,
                ..Default::default()
            },
            shndx: 0,
            starts_new_segment: false,
        });
    }

    for (index, merged) in ctx.merged.iter().enumerate() {
        chunks.push(Chunk {
            kind: ChunkKind::Merged(MergedSectionId::from_usize(index)),
            name: merged.name,
            shdr: OutShdr {
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: merged.sh_flags,
                sh_size: merged.size,
                sh_addralign: merged.alignment.value(),
                sh_entsize: merged.sh_entsize,
                ..Default::default()
            },
            shndx: 0,
            starts_new_segment: false,
        });
    }

    chunks.push(synth(
        K::Symtab,
        b".symtab",
        e::SHT_SYMTAB,
        0,
        (symtab.entries.len() as u64 + 1) * elf::SYMTAB_ENTRY_SIZE,
        8,
        elf::SYMTAB_ENTRY_SIZE,
    ));
    chunks.push(synth(
        K::Strtab,
        b".strtab",
        e::SHT_STRTAB,
        0,
        symtab.strtab.len(),
        1,
        0,
    ));
    // Size is fixed up once section names are interned.
    chunks.push(synth(K::Shstrtab, b".shstrtab", e::SHT_STRTAB, 0, 1, 1, 0));

    Ok(chunks)
}

/// Sorts chunks into the canonical layout. Headers are pinned: Ehdr then
/// Phdr at the very start and Shdr at the end; everything else is ordered by
/// section rank, ties broken by creation order.
pub(crate) fn sort_chunks(chunks: &mut Vec<Chunk>) {
    chunks.sort_by_key(|chunk| match chunk.kind {
        ChunkKind::Header(HeaderKind::Ehdr) => 0u32,
        ChunkKind::Header(HeaderKind::Phdr) => 1,
        ChunkKind::Header(HeaderKind::Shdr) => u32::MAX,
        _ => 2 + chunk.rank(),
    });
    chunks.retain(|chunk| {
        chunk.shdr.sh_size > 0 || matches!(chunk.kind, ChunkKind::Header(_))
    });
}

/// Marks the chunk that begins each PT_LOAD: the first alloc chunk and every
/// alloc chunk whose segment access flags differ from its predecessor's.
pub(crate) fn mark_segment_starts(chunks: &mut [Chunk]) {
    let mut previous_flags: Option<u32> = None;
    for chunk in chunks {
        if !chunk.is_alloc() {
            previous_flags = None;
            continue;
        }
        let flags = segment_flags(chunk);
        if previous_flags != Some(flags) {
            chunk.starts_new_segment = true;
        }
        previous_flags = Some(flags);
    }
}

fn segment_flags(chunk: &Chunk) -> u32 {
    let mut flags = object::elf::PF_R;
    if chunk.shdr.sh_flags & u64::from(object::elf::SHF_WRITE) != 0 {
        flags |= object::elf::PF_W;
    }
    if chunk.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
        flags |= object::elf::PF_X;
    }
    flags
}

fn index_chunks(ctx: &Context) -> (Vec<Option<u32>>, Vec<Option<u32>>) {
    let mut section_chunk = vec![None; ctx.output_sections.len()];
    let mut merged_chunk = vec![None; ctx.merged.len()];
    for (index, chunk) in ctx.chunks.iter().enumerate() {
        match chunk.kind {
            ChunkKind::Section(id) => section_chunk[id.as_usize()] = Some(index as u32),
            ChunkKind::Merged(id) => merged_chunk[id.as_usize()] = Some(index as u32),
            _ => {}
        }
    }
    (section_chunk, merged_chunk)
}

/// Assigns output section indices and interns every section name into
/// .shstrtab, fixing up that section's size.
fn assign_shndx_and_names(chunks: &mut [Chunk]) -> StringTable {
    let mut shstrtab = StringTable::new();
    let mut shndx = 1u16;
    for chunk in chunks.iter_mut() {
        if matches!(chunk.kind, ChunkKind::Header(_)) {
            continue;
        }
        chunk.shndx = shndx;
        shndx += 1;
        chunk.shdr.sh_name = shstrtab.get_or_add(chunk.name);
    }
    let size = shstrtab.len();
    for chunk in chunks.iter_mut() {
        if chunk.kind == ChunkKind::Synthetic(SyntheticKind::Shstrtab) {
            chunk.shdr.sh_size = size;
        }
    }
    shstrtab
}

fn num_sections(chunks: &[Chunk]) -> u64 {
    chunks
        .iter()
        .filter(|c| !matches!(c.kind, ChunkKind::Header(_)))
        .count() as u64
}

fn fix_header_sizes(ctx: &mut Context, _num_dyn_relocations: u64) {
    let num_segments = count_segments(&ctx.chunks, ctx.args);
    let num_sections = num_sections(&ctx.chunks);
    for chunk in &mut ctx.chunks {
        match chunk.kind {
            ChunkKind::Header(HeaderKind::Ehdr) => {
                chunk.shdr.sh_size = u64::from(elf::FILE_HEADER_SIZE);
            }
            ChunkKind::Header(HeaderKind::Phdr) => {
                chunk.shdr.sh_size = num_segments * u64::from(elf::PROGRAM_HEADER_SIZE);
            }
            ChunkKind::Header(HeaderKind::Shdr) => {
                chunk.shdr.sh_size = (1 + num_sections) * u64::from(elf::SECTION_HEADER_SIZE);
            }
            _ => {}
        }
    }
}

fn count_segments(chunks: &[Chunk], args: &crate::args::Args) -> u64 {
    let num_loads = chunks.iter().filter(|c| c.starts_new_segment).count() as u64;
    let has_tls = chunks.iter().any(|c| c.is_tls());
    let has_dynamic = chunks
        .iter()
        .any(|c| c.kind == ChunkKind::Synthetic(SyntheticKind::Dynamic));
    let has_interp = args.needs_interp();
    // PT_PHDR and PT_INTERP travel together, plus PT_GNU_STACK.
    num_loads
        + u64::from(has_tls)
        + u64::from(has_dynamic)
        + if has_interp { 2 } else { 0 }
        + 1
}

/// Links section headers to their string/symbol tables now that section
/// indices are known.
fn fix_link_fields(ctx: &mut Context) {
    let shndx_of = |chunks: &[Chunk], kind| {
        chunks
            .iter()
            .find(|c: &&Chunk| c.kind == ChunkKind::Synthetic(kind))
            .map_or(0, |c| u32::from(c.shndx))
    };
    let dynstr = shndx_of(&ctx.chunks, SyntheticKind::Dynstr);
    let dynsym = shndx_of(&ctx.chunks, SyntheticKind::Dynsym);
    let strtab = shndx_of(&ctx.chunks, SyntheticKind::Strtab);
    let gotplt = shndx_of(&ctx.chunks, SyntheticKind::GotPlt);

    for chunk in &mut ctx.chunks {
        let ChunkKind::Synthetic(kind) = chunk.kind else {
            continue;
        };
        match kind {
            SyntheticKind::Dynsym => {
                chunk.shdr.sh_link = dynstr;
                // Index of the first non-local symbol; only the null entry is
                // local.
                chunk.shdr.sh_info = 1;
            }
            SyntheticKind::Dynamic | SyntheticKind::GnuVersionR | SyntheticKind::GnuVersionD => {
                chunk.shdr.sh_link = dynstr;
            }
            SyntheticKind::Hash | SyntheticKind::GnuVersion => {
                chunk.shdr.sh_link = dynsym;
            }
            SyntheticKind::RelaDyn => {
                chunk.shdr.sh_link = dynsym;
            }
            SyntheticKind::RelaPlt => {
                chunk.shdr.sh_link = dynsym;
                chunk.shdr.sh_info = gotplt;
            }
            SyntheticKind::Symtab => {
                chunk.shdr.sh_link = strtab;
                chunk.shdr.sh_info = 1;
            }
            _ => {}
        }
    }
    for chunk in &mut ctx.chunks {
        let ChunkKind::Synthetic(kind) = chunk.kind else {
            continue;
        };
        match kind {
            SyntheticKind::GnuVersionR => chunk.shdr.sh_info = ctx.dynamic.verneed_count,
            SyntheticKind::GnuVersionD => chunk.shdr.sh_info = ctx.dynamic.verdef_count,
            _ => {}
        }
    }
}

/// Assigns file offsets and virtual addresses in one pass. At a chunk that
/// starts a new PT_LOAD the address is aligned up to a page. The congruence
/// rule `vaddr % PAGE == fileoff % PAGE` is restored by advancing the file
/// offset whenever the two drift. NOBITS chunks consume address space but no
/// file bytes; TBSS consumes neither.
pub(crate) fn assign_offsets_and_addresses(chunks: &mut [Chunk], base_address: u64) -> u64 {
    let page = elf::PAGE_SIZE;
    let mut fileoff = 0u64;
    let mut vaddr = base_address;

    for chunk in chunks {
        if chunk.starts_new_segment {
            vaddr = alignment::align_up(vaddr, page);
        }

        if vaddr % page > fileoff % page {
            fileoff += vaddr % page - fileoff % page;
        } else if vaddr % page < fileoff % page {
            fileoff = alignment::align_up(fileoff, page) + vaddr % page;
        }

        let align = chunk.shdr.sh_addralign.max(1);
        fileoff = alignment::align_up(fileoff, align);
        vaddr = alignment::align_up(vaddr, align);

        chunk.shdr.sh_offset = fileoff;
        if chunk.is_alloc() {
            chunk.shdr.sh_addr = vaddr;
        }

        let is_bss = chunk.is_nobits();
        if !is_bss {
            fileoff += chunk.shdr.sh_size;
        }
        let is_tbss = is_bss && chunk.is_tls();
        if !is_tbss {
            vaddr += chunk.shdr.sh_size;
        }
    }
    fileoff
}

/// Derives program headers from the laid-out chunks.
fn build_segments(chunks: &[Chunk]) -> Vec<Segment> {
    let mut segments = Vec::new();

    let find = |kind: ChunkKind| chunks.iter().find(|c| c.kind == kind);

    if let Some(phdr) = find(ChunkKind::Header(HeaderKind::Phdr)) {
        if find(ChunkKind::Synthetic(SyntheticKind::Interp)).is_some() {
            segments.push(Segment {
                p_type: object::elf::PT_PHDR,
                p_flags: object::elf::PF_R,
                offset: phdr.shdr.sh_offset,
                vaddr: phdr.shdr.sh_addr,
                filesz: phdr.shdr.sh_size,
                memsz: phdr.shdr.sh_size,
                align: 8,
            });
        }
    }

    if let Some(interp) = find(ChunkKind::Synthetic(SyntheticKind::Interp)) {
        segments.push(Segment {
            p_type: object::elf::PT_INTERP,
            p_flags: object::elf::PF_R,
            offset: interp.shdr.sh_offset,
            vaddr: interp.shdr.sh_addr,
            filesz: interp.shdr.sh_size,
            memsz: interp.shdr.sh_size,
            align: 1,
        });
    }

    // PT_LOAD runs.
    let mut current: Option<Segment> = None;
    for chunk in chunks {
        if !chunk.is_alloc() {
            continue;
        }
        if chunk.starts_new_segment {
            if let Some(segment) = current.take() {
                segments.push(segment);
            }
            current = Some(Segment {
                p_type: object::elf::PT_LOAD,
                p_flags: segment_flags(chunk),
                offset: chunk.shdr.sh_offset,
                vaddr: chunk.shdr.sh_addr,
                filesz: 0,
                memsz: 0,
                align: elf::PAGE_SIZE,
            });
        }
        if let Some(segment) = &mut current {
            let file_end = chunk.shdr.sh_offset + chunk.file_size();
            segment.filesz = segment.filesz.max(file_end - segment.offset);
            let mem_size = if chunk.is_nobits() && chunk.is_tls() {
                0
            } else {
                chunk.shdr.sh_size
            };
            let mem_end = chunk.shdr.sh_addr + mem_size;
            segment.memsz = segment.memsz.max(mem_end - segment.vaddr);
        }
    }
    if let Some(segment) = current.take() {
        segments.push(segment);
    }

    if let Some(dynamic) = find(ChunkKind::Synthetic(SyntheticKind::Dynamic)) {
        segments.push(Segment {
            p_type: object::elf::PT_DYNAMIC,
            p_flags: object::elf::PF_R | object::elf::PF_W,
            offset: dynamic.shdr.sh_offset,
            vaddr: dynamic.shdr.sh_addr,
            filesz: dynamic.shdr.sh_size,
            memsz: dynamic.shdr.sh_size,
            align: 8,
        });
    }

    let tls_chunks: Vec<&Chunk> = chunks.iter().filter(|c| c.is_tls() && c.is_alloc()).collect();
    if !tls_chunks.is_empty() {
        let start = tls_chunks.iter().map(|c| c.shdr.sh_addr).min().unwrap();
        let end = tls_chunks
            .iter()
            .map(|c| c.shdr.sh_addr + c.shdr.sh_size)
            .max()
            .unwrap();
        let file_start = tls_chunks
            .iter()
            .filter(|c| !c.is_nobits())
            .map(|c| c.shdr.sh_offset)
            .min();
        let file_end = tls_chunks
            .iter()
            .filter(|c| !c.is_nobits())
            .map(|c| c.shdr.sh_offset + c.shdr.sh_size)
            .max();
        let align = tls_chunks
            .iter()
            .map(|c| c.shdr.sh_addralign)
            .max()
            .unwrap()
            .max(1);
        segments.push(Segment {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            offset: file_start.unwrap_or(0),
            vaddr: start,
            filesz: file_end.unwrap_or(0).saturating_sub(file_start.unwrap_or(0)),
            memsz: end - start,
            align,
        });
    }

    segments.push(Segment {
        p_type: object::elf::PT_GNU_STACK,
        p_flags: object::elf::PF_R | object::elf::PF_W,
        align: 0x10,
        ..Default::default()
    });

    segments
}

fn tls_range(segments: &[Segment]) -> (u64, u64) {
    for segment in segments {
        if segment.p_type == object::elf::PT_TLS {
            let end = alignment::align_up(segment.vaddr + segment.memsz, segment.align.max(1));
            return (segment.vaddr, end);
        }
    }
    (0, 0)
}

/// Binds the well-known linker-emitted symbols to their computed addresses.
fn bind_synthetic_symbols<'data>(
    files: &[ParsedInput<'data>],
    symbol_db: &mut SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) {
    let ParsedInput::Prelude(prelude) = &files[0] else {
        return;
    };

    let mut max_alloc_end = 0u64;
    let mut max_exec_end = 0u64;
    let mut max_data_end = 0u64;
    for chunk in &ctx.chunks {
        if matches!(chunk.kind, ChunkKind::Header(_)) || !chunk.is_alloc() {
            continue;
        }
        let end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
        max_alloc_end = max_alloc_end.max(end);
        if chunk.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0 {
            max_exec_end = max_exec_end.max(end);
        }
        if !chunk.is_nobits() {
            max_data_end = max_data_end.max(end);
        }
    }

    let section_extent = |id: OutputSectionId| {
        layout
            .section_chunk_index(id)
            .map(|i| {
                let shdr = &ctx.chunks[i].shdr;
                (shdr.sh_addr, shdr.sh_addr + shdr.sh_size)
            })
            .unwrap_or((0, 0))
    };
    let rela_plt = chunk_by_kind(ctx, ChunkKind::Synthetic(SyntheticKind::RelaPlt))
        .map(|c| (c.shdr.sh_addr, c.shdr.sh_addr + c.shdr.sh_size))
        .unwrap_or((0, 0));
    let ehdr_address = ctx
        .chunks
        .first()
        .map_or(0, |c| c.shdr.sh_addr);

    for def in &prelude.symbol_definitions {
        let Some(id) = symbol_db.lookup(SymbolName::prehashed(def.name)) else {
            continue;
        };
        let claim = symbol_db.symbol(id).claim();
        if claim.is_none() || claim.priority() != crate::parsing::PRELUDE_PRIORITY {
            continue;
        }
        let value = match def.placement {
            SyntheticPlacement::BssStart => section_extent(output_section::BSS).0,
            SyntheticPlacement::EhdrStart => ehdr_address,
            SyntheticPlacement::RelaIpltStart => rela_plt.0,
            SyntheticPlacement::RelaIpltEnd => rela_plt.1,
            SyntheticPlacement::InitArrayStart => section_extent(output_section::INIT_ARRAY).0,
            SyntheticPlacement::InitArrayEnd => section_extent(output_section::INIT_ARRAY).1,
            SyntheticPlacement::FiniArrayStart => section_extent(output_section::FINI_ARRAY).0,
            SyntheticPlacement::FiniArrayEnd => section_extent(output_section::FINI_ARRAY).1,
            SyntheticPlacement::End => max_alloc_end,
            SyntheticPlacement::Etext => max_exec_end,
            SyntheticPlacement::Edata => max_data_end,
            SyntheticPlacement::Dynamic => {
                synthetic_chunk_address(ctx, SyntheticKind::Dynamic)
            }
            SyntheticPlacement::GlobalOffsetTable => {
                let gotplt = synthetic_chunk_address(ctx, SyntheticKind::GotPlt);
                if gotplt != 0 {
                    gotplt
                } else {
                    synthetic_chunk_address(ctx, SyntheticKind::Got)
                }
            }
            SyntheticPlacement::SectionStart(id) => section_extent(id).0,
            SyntheticPlacement::SectionStop(id) => section_extent(id).1,
        };
        symbol_db.symbol_mut(id).value = value;
    }
}

fn entry_address<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result<u64> {
    let name = ctx.args.entry_symbol_name();
    if let Some(id) = symbol_db.lookup(SymbolName::prehashed(name.as_bytes())) {
        let claim = symbol_db.symbol(id).claim();
        if !claim.is_none() {
            return symbol_address(files, by_priority, symbol_db, ctx, layout, id);
        }
    }
    if ctx.args.shared {
        return Ok(0);
    }
    crate::error::warning(&format!(
        "cannot find entry symbol `{name}`, defaulting to start of executable segment"
    ));
    Ok(ctx
        .chunks
        .iter()
        .find(|c| c.shdr.sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0)
        .map_or(0, |c| c.shdr.sh_addr))
}

/// Resolves a symbol to its output virtual address. Imported symbols without
/// a copy relocation and undefined weak references resolve to zero.
pub(crate) fn symbol_address<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
    id: SymbolId,
) -> Result<u64> {
    let symbol = symbol_db.symbol(id);
    let claim = symbol.claim();
    if claim.is_none() {
        return Ok(0);
    }
    if claim.priority() == crate::parsing::PRELUDE_PRIORITY {
        return Ok(symbol.value);
    }

    match by_priority.get(files, claim.priority())? {
        ParsedInput::Prelude(_) => Ok(symbol.value),
        ParsedInput::Shared(_) => {
            if symbol.has_copyrel {
                let base = synthetic_chunk_address(ctx, SyntheticKind::Copyrel);
                Ok(base + symbol.copyrel_offset)
            } else {
                Ok(0)
            }
        }
        ParsedInput::Object(obj) => {
            let e = LittleEndian;
            let local = obj
                .object
                .symbol(object::SymbolIndex(claim.sym_index() as usize))?;
            let st_value = local.st_value(e);
            if local.is_absolute(e) {
                return Ok(st_value);
            }
            if claim.rank() == ClaimRank::Common {
                let base = layout.section_address(ctx, output_section::BSS);
                return Ok(base + symbol.value);
            }
            let Some(section_index) = obj
                .object
                .symbols
                .symbol_section(e, local, object::SymbolIndex(claim.sym_index() as usize))?
            else {
                return Ok(st_value);
            };
            match &obj.sections[section_index.0] {
                SectionSlot::Loaded(section) => {
                    let chunk_address = layout.section_address(ctx, section.output_section);
                    Ok(chunk_address + section.offset.load(Ordering::Relaxed) + st_value)
                }
                SectionSlot::MergeStrings(merge_index) => {
                    let merge = &obj.mergeable_sections[*merge_index];
                    let map = ctx
                        .piece_map
                        .as_ref()
                        .ok_or_else(|| anyhow!("Piece map not built"))?;
                    let offset_in_merged =
                        piece_output_offset(merge, st_value, map, |winner| {
                            winner_extent(files, by_priority, winner)
                        })?;
                    let chunk_index = layout
                        .merged_chunk_index(merge.merged_id)
                        .ok_or_else(|| anyhow!("Merged section has no chunk"))?;
                    Ok(ctx.chunks[chunk_index].shdr.sh_addr + offset_in_merged)
                }
                SectionSlot::Discard => Ok(0),
            }
        }
    }
}

pub(crate) fn winner_extent(
    files: &[ParsedInput],
    by_priority: &FilesByPriority,
    winner: MergeSectionRef,
) -> Result<(u64, u64)> {
    let ParsedInput::Object(obj) = by_priority.get(files, winner.priority())? else {
        return Err(anyhow!("Merge winner isn't an object"));
    };
    let section = &obj.mergeable_sections[winner.ordinal()];
    Ok((section.offset_in_merged, section.size))
}

/// The entries of the .dynamic section, in emission order. Address values
/// are read from the chunk list, so before layout they come out as zero;
/// the list's length is what sizing uses.
pub(crate) fn dynamic_entries(ctx: &Context, num_dyn_relocations: u64) -> Vec<(u64, u64)> {
    use object::elf as e;
    let dynamic = &ctx.dynamic;
    let mut entries = Vec::new();

    for soname_offset in &dynamic.needed {
        entries.push((u64::from(e::DT_NEEDED), u64::from(*soname_offset)));
    }
    if let Some(offset) = dynamic.runpath_offset {
        entries.push((u64::from(e::DT_RUNPATH), u64::from(offset)));
    }
    if let Some(offset) = dynamic.soname_offset {
        entries.push((u64::from(e::DT_SONAME), u64::from(offset)));
    }

    let addr = |kind| synthetic_chunk_address(ctx, kind);

    entries.push((u64::from(e::DT_HASH), addr(SyntheticKind::Hash)));
    entries.push((u64::from(e::DT_STRTAB), addr(SyntheticKind::Dynstr)));
    entries.push((u64::from(e::DT_SYMTAB), addr(SyntheticKind::Dynsym)));
    entries.push((u64::from(e::DT_STRSZ), dynamic.dynstr.len()));
    entries.push((u64::from(e::DT_SYMENT), elf::SYMTAB_ENTRY_SIZE));

    if num_dyn_relocations > 0 {
        entries.push((u64::from(e::DT_RELA), addr(SyntheticKind::RelaDyn)));
        entries.push((
            u64::from(e::DT_RELASZ),
            num_dyn_relocations * elf::RELA_ENTRY_SIZE,
        ));
        entries.push((u64::from(e::DT_RELAENT), elf::RELA_ENTRY_SIZE));
    }
    if !dynamic.plt.is_empty() {
        entries.push((u64::from(e::DT_JMPREL), addr(SyntheticKind::RelaPlt)));
        entries.push((
            u64::from(e::DT_PLTRELSZ),
            dynamic.num_plt_relocations() * elf::RELA_ENTRY_SIZE,
        ));
        entries.push((u64::from(e::DT_PLTGOT), addr(SyntheticKind::GotPlt)));
        entries.push((u64::from(e::DT_PLTREL), u64::from(e::DT_RELA)));
    }

    entries.push((u64::from(e::DT_VERSYM), addr(SyntheticKind::GnuVersion)));
    if !dynamic.verneed.is_empty() {
        entries.push((u64::from(e::DT_VERNEED), addr(SyntheticKind::GnuVersionR)));
        entries.push((
            u64::from(e::DT_VERNEEDNUM),
            u64::from(dynamic.verneed_count),
        ));
    }
    if !dynamic.verdef.is_empty() {
        entries.push((u64::from(e::DT_VERDEF), addr(SyntheticKind::GnuVersionD)));
        entries.push((u64::from(e::DT_VERDEFNUM), u64::from(dynamic.verdef_count)));
    }

    if ctx.bins[output_section::INIT_ARRAY.as_usize()].size > 0 {
        entries.push((
            u64::from(e::DT_INIT_ARRAY),
            size_addr(ctx, output_section::INIT_ARRAY).0,
        ));
        entries.push((
            u64::from(e::DT_INIT_ARRAYSZ),
            ctx.bins[output_section::INIT_ARRAY.as_usize()].size,
        ));
    }
    if ctx.bins[output_section::FINI_ARRAY.as_usize()].size > 0 {
        entries.push((
            u64::from(e::DT_FINI_ARRAY),
            size_addr(ctx, output_section::FINI_ARRAY).0,
        ));
        entries.push((
            u64::from(e::DT_FINI_ARRAYSZ),
            ctx.bins[output_section::FINI_ARRAY.as_usize()].size,
        ));
    }

    if ctx.args.bind_now {
        entries.push((u64::from(e::DT_FLAGS), u64::from(e::DF_BIND_NOW)));
    }
    if !ctx.args.shared {
        entries.push((u64::from(e::DT_DEBUG), 0));
    }
    entries.push((u64::from(e::DT_NULL), 0));
    entries
}

fn size_addr(ctx: &Context, id: OutputSectionId) -> (u64, u64) {
    ctx.chunks
        .iter()
        .find(|c| c.kind == ChunkKind::Section(id))
        .map_or((0, 0), |c| (c.shdr.sh_addr, c.shdr.sh_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(name: &'static [u8], sh_type: u32, sh_flags: u64, size: u64, align: u64) -> Chunk<'static> {
        Chunk {
            kind: ChunkKind::Section(output_section::TEXT),
            name,
            shdr: OutShdr {
                sh_type,
                sh_flags,
                sh_size: size,
                sh_addralign: align,
                ..Default::default()
            },
            shndx: 0,
            starts_new_segment: false,
        }
    }

    #[test]
    fn offsets_respect_congruence() {
        use object::elf as e;
        let mut chunks = vec![
            chunk(b".rodata", e::SHT_PROGBITS, SHF_A, 0x1234, 8),
            chunk(b".text", e::SHT_PROGBITS, SHF_AX, 0x500, 16),
            chunk(b".data", e::SHT_PROGBITS, SHF_AW, 0x42, 8),
            chunk(b".bss", e::SHT_NOBITS, SHF_AW, 0x2000, 32),
            chunk(b".comment", e::SHT_PROGBITS, 0, 0x20, 1),
        ];
        mark_segment_starts(&mut chunks);
        assert!(chunks[0].starts_new_segment);
        assert!(chunks[1].starts_new_segment);
        assert!(chunks[2].starts_new_segment);
        assert!(!chunks[3].starts_new_segment);

        let file_size = assign_offsets_and_addresses(&mut chunks, 0x400000);

        for c in &chunks {
            if c.is_alloc() {
                assert_eq!(
                    c.shdr.sh_addr % elf::PAGE_SIZE,
                    c.shdr.sh_offset % elf::PAGE_SIZE,
                    "congruence violated for {}",
                    String::from_utf8_lossy(c.name)
                );
            }
        }

        // Consecutive alloc chunks don't overlap in memory.
        let allocs: Vec<_> = chunks.iter().filter(|c| c.is_alloc()).collect();
        for pair in allocs.windows(2) {
            assert!(pair[0].shdr.sh_addr + pair[0].shdr.sh_size <= pair[1].shdr.sh_addr);
        }

        // .bss consumed address space but no file bytes.
        let bss = &chunks[3];
        let comment = &chunks[4];
        assert!(comment.shdr.sh_offset <= bss.shdr.sh_offset + 0x100);
        assert!(file_size >= comment.shdr.sh_offset + comment.shdr.sh_size);
    }

    #[test]
    fn tbss_consumes_no_address_space() {
        use object::elf as e;
        let tls = u64::from(e::SHF_TLS);
        let mut chunks = vec![
            chunk(b".tdata", e::SHT_PROGBITS, SHF_AW | tls, 0x100, 8),
            chunk(b".tbss", e::SHT_NOBITS, SHF_AW | tls, 0x80, 8),
            chunk(b".data", e::SHT_PROGBITS, SHF_AW, 0x10, 8),
        ];
        mark_segment_starts(&mut chunks);
        assign_offsets_and_addresses(&mut chunks, 0);
        // .data overlays the address range that .tbss describes.
        assert_eq!(chunks[2].shdr.sh_addr, chunks[1].shdr.sh_addr);
    }
}
