//! Writes the output file. The file is created as a temp file beside the
//! destination, mmapped at its final size, filled by each chunk in parallel
//! (no chunk writes outside its declared extent), then renamed into place.
//! SIGINT/SIGTERM unlink the temp file so a partial output is never promoted
//! to the final name.

use crate::arch::Arch;
use crate::chunks::Chunk;
use crate::chunks::ChunkKind;
use crate::chunks::HeaderKind;
use crate::chunks::SyntheticKind;
use crate::context::Context;
use crate::dynamic::DynsymEntry;
use crate::dynamic::GotEntry;
use crate::elf;
use crate::error::Result;
use crate::hash::elf_hash;
use crate::layout;
use crate::layout::Layout;
use crate::object_file::SectionSlot;
use crate::parsing::ParsedInput;
use crate::resolution::FilesByPriority;
use crate::string_merging::is_piece_winner;
use crate::string_merging::winner_piece_offset;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

/// Path of the temp file we're writing, for the signal handler. Leaked
/// intentionally; signal handlers can only touch what's already allocated.
static TEMP_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn cleanup_on_signal(_signal: libc::c_int) {
    let path = TEMP_PATH.load(Ordering::Acquire);
    if !path.is_null() {
        unsafe { libc::unlink(path) };
    }
    unsafe { libc::_exit(1) };
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, cleanup_on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, cleanup_on_signal as libc::sighandler_t);
    }
}

pub(crate) struct Output {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: std::fs::File,
}

impl Output {
    /// Creates `<dir>/.weld-XXXXXX` next to the destination.
    pub(crate) fn create(path: &Path) -> Result<Output> {
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
        let template = directory
            .unwrap_or(Path::new("."))
            .join(".weld-XXXXXX");
        let template = CString::new(template.as_os_str().as_bytes())?;
        let raw = template.into_raw();
        let fd = unsafe { libc::mkstemp(raw) };
        let template = unsafe { CString::from_raw(raw) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to create temp file near `{}`", path.display()));
        }

        let temp_path = PathBuf::from(std::ffi::OsStr::from_bytes(template.as_bytes()));
        TEMP_PATH.store(template.into_raw(), Ordering::Release);
        install_signal_handlers();

        let file = unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fd) };
        Ok(Output {
            final_path: path.to_owned(),
            temp_path,
            file,
        })
    }

    fn unlink_temp(&self) {
        let _ = std::fs::remove_file(&self.temp_path);
        TEMP_PATH.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Sizes the file, lets `write_fn` fill the mapped buffer, then commits
    /// by renaming over the destination.
    pub(crate) fn write_and_commit(
        self,
        file_size: u64,
        write_fn: impl FnOnce(&mut [u8]) -> Result,
    ) -> Result {
        let result = self.try_write(file_size, write_fn);
        if result.is_err() {
            self.unlink_temp();
            return result;
        }

        make_executable(&self.file);
        std::fs::rename(&self.temp_path, &self.final_path).with_context(|| {
            format!(
                "Failed to rename `{}` to `{}`",
                self.temp_path.display(),
                self.final_path.display()
            )
        })?;
        TEMP_PATH.store(std::ptr::null_mut(), Ordering::Release);
        Ok(())
    }

    fn try_write(&self, file_size: u64, write_fn: impl FnOnce(&mut [u8]) -> Result) -> Result {
        self.file
            .set_len(file_size)
            .context("Failed to size output file")?;
        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&self.file) }
            .context("Failed to mmap output file")?;
        write_fn(&mut mmap)?;
        Ok(())
    }
}

fn make_executable(file: &std::fs::File) {
    use std::os::unix::io::AsRawFd as _;
    unsafe {
        let mask = libc::umask(0);
        libc::umask(mask);
        libc::fchmod(file.as_raw_fd(), 0o777 & !mask);
    }
}

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write_output<'data, A: Arch>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    let output = Output::create(&ctx.args.output)?;
    output.write_and_commit(layout.file_size, |buffer| {
        write_chunks::<A>(files, by_priority, symbol_db, ctx, layout, buffer)?;
        ctx.errors.checkpoint()
    })
}

/// Splits the buffer into one writable slice per chunk plus the padding
/// runs between consecutive extents, fills the padding with the configured
/// filler byte, then writes all chunks in parallel.
fn write_chunks<'data, A: Arch>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
    mut buffer: &mut [u8],
) -> Result {
    let mut position = 0u64;
    let mut slices: Vec<&mut [u8]> = Vec::with_capacity(ctx.chunks.len());
    for chunk in &ctx.chunks {
        let padding = chunk
            .shdr
            .sh_offset
            .checked_sub(position)
            .ok_or_else(|| anyhow!("Chunk offsets went backwards"))?;
        let padding_bytes = buffer
            .split_off_mut(..padding as usize)
            .ok_or_else(|| anyhow!("Chunk extends beyond the file"))?;
        padding_bytes.fill(ctx.args.filler);
        let chunk_bytes = buffer
            .split_off_mut(..chunk.file_size() as usize)
            .ok_or_else(|| anyhow!("Chunk extends beyond the file"))?;
        slices.push(chunk_bytes);
        position = chunk.shdr.sh_offset + chunk.file_size();
    }
    buffer.fill(ctx.args.filler);

    ctx.chunks
        .par_iter()
        .zip(slices.into_par_iter())
        .for_each(|(chunk, out)| {
            if let Err(error) =
                write_chunk::<A>(chunk, out, files, by_priority, symbol_db, ctx, layout)
            {
                ctx.errors.report(error.context(format!(
                    "Failed to write section `{}`",
                    String::from_utf8_lossy(chunk.name)
                )));
            }
        });
    Ok(())
}

fn write_chunk<'data, A: Arch>(
    chunk: &Chunk<'data>,
    out: &mut [u8],
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    match chunk.kind {
        ChunkKind::Header(HeaderKind::Ehdr) => write_ehdr::<A>(out, ctx, layout),
        ChunkKind::Header(HeaderKind::Phdr) => write_phdr(out, layout),
        ChunkKind::Header(HeaderKind::Shdr) => write_shdr(out, ctx),
        ChunkKind::Section(id) => write_regular_section(out, files, ctx, id),
        ChunkKind::Merged(id) => write_merged_section(out, files, ctx, id),
        ChunkKind::Synthetic(kind) => match kind {
            SyntheticKind::Interp => {
                let path = ctx.args.dynamic_linker.as_deref().unwrap();
                let bytes = path.as_os_str().as_bytes();
                out[..bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            SyntheticKind::Got => {
                write_got::<A>(out, files, by_priority, symbol_db, ctx, layout)
            }
            SyntheticKind::GotPlt => write_got_plt(out, ctx),
            SyntheticKind::Plt => write_plt::<A>(out, ctx),
            SyntheticKind::RelaPlt => write_rela_plt::<A>(out, symbol_db, ctx),
            SyntheticKind::RelaDyn => {
                write_rela_dyn::<A>(out, files, by_priority, symbol_db, ctx, layout)
            }
            SyntheticKind::Dynsym => {
                write_dynsym(out, files, by_priority, symbol_db, ctx, layout)
            }
            SyntheticKind::Dynstr => {
                out.copy_from_slice(ctx.dynamic.dynstr.bytes());
                Ok(())
            }
            SyntheticKind::Hash => write_hash(out, symbol_db, ctx),
            SyntheticKind::GnuVersion => {
                let versym: &mut [elf::Versym] = elf::slice_from_all_bytes_mut(out);
                for (out, value) in versym.iter_mut().zip(&ctx.dynamic.versym) {
                    out.0.set(LittleEndian, *value);
                }
                Ok(())
            }
            SyntheticKind::GnuVersionR => {
                out.copy_from_slice(&ctx.dynamic.verneed);
                Ok(())
            }
            SyntheticKind::GnuVersionD => {
                out.copy_from_slice(&ctx.dynamic.verdef);
                Ok(())
            }
            SyntheticKind::Dynamic => write_dynamic(out, ctx, layout),
            SyntheticKind::Copyrel => Ok(()),
            SyntheticKind::Symtab => {
                write_symtab(out, files, by_priority, symbol_db, ctx, layout)
            }
            SyntheticKind::Strtab => {
                out.copy_from_slice(layout.symtab.strtab.bytes());
                Ok(())
            }
            SyntheticKind::Shstrtab => {
                out.copy_from_slice(layout.shstrtab.bytes());
                Ok(())
            }
        },
    }
}

fn write_ehdr<A: Arch>(out: &mut [u8], ctx: &Context, layout: &Layout) -> Result {
    let e = LittleEndian;
    let header: &mut elf::FileHeader = object::from_bytes_mut(out)
        .map_err(|_| anyhow!("Invalid ELF header allocation"))?
        .0;
    header.e_ident.magic = object::elf::ELFMAG;
    header.e_ident.class = object::elf::ELFCLASS64;
    header.e_ident.data = object::elf::ELFDATA2LSB;
    header.e_ident.version = object::elf::EV_CURRENT;
    let e_type = if ctx.args.shared || ctx.args.pie {
        object::elf::ET_DYN
    } else {
        object::elf::ET_EXEC
    };
    header.e_type.set(e, e_type);
    header.e_machine.set(e, A::MACHINE);
    header.e_version.set(e, u32::from(object::elf::EV_CURRENT));
    header.e_entry.set(e, layout.entry_address);

    let phdr = layout::chunk_by_kind(ctx, ChunkKind::Header(HeaderKind::Phdr))
        .context("Missing program header chunk")?;
    let shdr = layout::chunk_by_kind(ctx, ChunkKind::Header(HeaderKind::Shdr))
        .context("Missing section header chunk")?;
    header.e_phoff.set(e, phdr.shdr.sh_offset);
    header.e_shoff.set(e, shdr.shdr.sh_offset);
    header.e_flags.set(e, 0);
    header.e_ehsize.set(e, elf::FILE_HEADER_SIZE);
    header.e_phentsize.set(e, elf::PROGRAM_HEADER_SIZE);
    header.e_phnum.set(e, layout.segments.len() as u16);
    header.e_shentsize.set(e, elf::SECTION_HEADER_SIZE);
    let num_sections = ctx
        .chunks
        .iter()
        .filter(|c| !matches!(c.kind, ChunkKind::Header(_)))
        .count() as u16;
    header.e_shnum.set(e, num_sections + 1);
    let shstrndx = layout::chunk_by_kind(ctx, ChunkKind::Synthetic(SyntheticKind::Shstrtab))
        .map_or(0, |c| c.shndx);
    header.e_shstrndx.set(e, shstrndx);
    Ok(())
}

fn write_phdr(out: &mut [u8], layout: &Layout) -> Result {
    let e = LittleEndian;
    let headers: &mut [elf::ProgramHeader] = elf::slice_from_all_bytes_mut(out);
    if headers.len() != layout.segments.len() {
        bail!("Wrong number of program headers allocated");
    }
    for (header, segment) in headers.iter_mut().zip(&layout.segments) {
        header.p_type.set(e, segment.p_type);
        header.p_flags.set(e, segment.p_flags);
        header.p_offset.set(e, segment.offset);
        header.p_vaddr.set(e, segment.vaddr);
        header.p_paddr.set(e, segment.vaddr);
        header.p_filesz.set(e, segment.filesz);
        header.p_memsz.set(e, segment.memsz);
        header.p_align.set(e, segment.align);
    }
    Ok(())
}

fn write_shdr(out: &mut [u8], ctx: &Context) -> Result {
    let e = LittleEndian;
    let headers: &mut [elf::SectionHeader] = elf::slice_from_all_bytes_mut(out);
    let mut index = 1;
    for chunk in &ctx.chunks {
        if matches!(chunk.kind, ChunkKind::Header(_)) {
            continue;
        }
        let header = headers
            .get_mut(index)
            .ok_or_else(|| anyhow!("Too few section headers allocated"))?;
        header.sh_name.set(e, chunk.shdr.sh_name);
        header.sh_type.set(e, chunk.shdr.sh_type);
        header.sh_flags.set(e, chunk.shdr.sh_flags);
        header.sh_addr.set(e, chunk.shdr.sh_addr);
        header.sh_offset.set(e, chunk.shdr.sh_offset);
        header.sh_size.set(e, chunk.shdr.sh_size);
        header.sh_link.set(e, chunk.shdr.sh_link);
        header.sh_info.set(e, chunk.shdr.sh_info);
        header.sh_addralign.set(e, chunk.shdr.sh_addralign);
        header.sh_entsize.set(e, chunk.shdr.sh_entsize);
        index += 1;
    }
    Ok(())
}

/// Copies every member input section into its slot. Gaps from alignment stay
/// zero, which a fresh file mapping already guarantees.
fn write_regular_section(
    out: &mut [u8],
    files: &[ParsedInput],
    ctx: &Context,
    id: crate::output_section::OutputSectionId,
) -> Result {
    let bin = &ctx.bins[id.as_usize()];
    for member in &bin.members {
        let ParsedInput::Object(obj) = &files[member.file as usize] else {
            continue;
        };
        let SectionSlot::Loaded(section) = &obj.sections[member.section as usize] else {
            continue;
        };
        if section.sh_type == object::elf::SHT_NOBITS {
            continue;
        }
        let data = obj.object.section_data(obj.object.section(section.index)?)?;
        let offset = section.offset.load(Ordering::Relaxed) as usize;
        out.get_mut(offset..offset + data.len())
            .ok_or_else(|| anyhow!("Input section extends beyond output section"))?
            .copy_from_slice(data);
    }
    Ok(())
}

/// Writes the winning copy of every merged piece at its assigned offset.
fn write_merged_section(
    out: &mut [u8],
    files: &[ParsedInput],
    ctx: &Context,
    id: crate::string_merging::MergedSectionId,
) -> Result {
    let map = ctx
        .piece_map
        .as_ref()
        .ok_or_else(|| anyhow!("Piece map not built"))?;
    for file in files {
        let ParsedInput::Object(obj) = file else {
            continue;
        };
        for (ordinal, section) in obj.mergeable_sections.iter().enumerate() {
            if section.merged_id != id {
                continue;
            }
            for piece in &section.pieces {
                if !is_piece_winner(obj.priority, ordinal as u32, section, piece, map) {
                    continue;
                }
                let offset =
                    (section.offset_in_merged + winner_piece_offset(section, piece, map)) as usize;
                out.get_mut(offset..offset + piece.len as usize)
                    .ok_or_else(|| anyhow!("Merged piece extends beyond section"))?
                    .copy_from_slice(section.piece_bytes(piece));
            }
        }
    }
    Ok(())
}

fn symbol_address<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
    id: SymbolId,
) -> Result<u64> {
    layout::symbol_address(files, by_priority, symbol_db, ctx, layout, id)
}

fn write_got<'data, A: Arch>(
    out: &mut [u8],
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    let slots: &mut [object::U64<LittleEndian>] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    for (slot, entry) in slots.iter_mut().zip(&ctx.dynamic.got) {
        let value = match entry {
            GotEntry::Address(id) => {
                if symbol_db.symbol(*id).is_imported {
                    0
                } else {
                    symbol_address(files, by_priority, symbol_db, ctx, layout, *id)?
                }
            }
            GotEntry::TpOff(id) => {
                if symbol_db.symbol(*id).is_imported {
                    0
                } else {
                    let address =
                        symbol_address(files, by_priority, symbol_db, ctx, layout, *id)?;
                    A::tp_offset(address, layout.tls_start, layout.tls_end)
                }
            }
            GotEntry::DtpMod(Some(id)) => {
                if symbol_db.symbol(*id).is_imported || ctx.args.shared {
                    0
                } else {
                    1
                }
            }
            GotEntry::DtpMod(None) => {
                if ctx.args.shared {
                    0
                } else {
                    1
                }
            }
            GotEntry::DtpOff(id) => {
                if symbol_db.symbol(*id).is_imported {
                    0
                } else {
                    let address =
                        symbol_address(files, by_priority, symbol_db, ctx, layout, *id)?;
                    address.wrapping_sub(layout.tls_start)
                }
            }
            GotEntry::Zero => 0,
        };
        slot.set(e, value);
    }
    Ok(())
}

fn write_got_plt(out: &mut [u8], ctx: &Context) -> Result {
    let slots: &mut [object::U64<LittleEndian>] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    // Slot 0 holds the address of .dynamic; the next two belong to the
    // runtime loader. With eager binding the per-symbol slots start as zero
    // and are filled by JUMP_SLOT relocations at load time.
    slots[0].set(
        e,
        layout::synthetic_chunk_address(ctx, SyntheticKind::Dynamic),
    );
    Ok(())
}

fn write_plt<A: Arch>(out: &mut [u8], ctx: &Context) -> Result {
    let plt_base = layout::synthetic_chunk_address(ctx, SyntheticKind::Plt);
    let gotplt_base = layout::synthetic_chunk_address(ctx, SyntheticKind::GotPlt);
    for (index, _symbol) in ctx.dynamic.plt.iter().enumerate() {
        let entry_size = A::PLT_ENTRY_SIZE as usize;
        let entry = &mut out[index * entry_size..(index + 1) * entry_size];
        let slot_address =
            gotplt_base + (elf::GOT_PLT_RESERVED_ENTRIES + index as u64) * elf::GOT_ENTRY_SIZE;
        let entry_address = plt_base + index as u64 * A::PLT_ENTRY_SIZE;
        A::write_plt_entry(entry, slot_address, entry_address);
    }
    Ok(())
}

fn write_rela_plt<A: Arch>(out: &mut [u8], symbol_db: &SymbolDb, ctx: &Context) -> Result {
    let relas: &mut [elf::Rela] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    let gotplt_base = layout::synthetic_chunk_address(ctx, SyntheticKind::GotPlt);
    for (index, (rela, id)) in relas.iter_mut().zip(&ctx.dynamic.plt).enumerate() {
        let slot_address =
            gotplt_base + (elf::GOT_PLT_RESERVED_ENTRIES + index as u64) * elf::GOT_ENTRY_SIZE;
        rela.r_offset.set(e, slot_address);
        let dynsym_idx = symbol_db.symbol(*id).dynsym_idx;
        rela.r_info.set(
            e,
            (u64::from(dynsym_idx) << 32) | u64::from(A::REL_JUMP_SLOT),
        );
        rela.r_addend.set(e, 0);
    }
    Ok(())
}

/// Emits .rela.dyn: GLOB_DAT / TPOFF / DTPMOD / DTPOFF relocations for GOT
/// slots whose targets are imported, then COPY relocations. The order
/// mirrors `DynamicData::num_dyn_relocations`.
fn write_rela_dyn<'data, A: Arch>(
    out: &mut [u8],
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    let relas: &mut [elf::Rela] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    let got_base = layout::synthetic_chunk_address(ctx, SyntheticKind::Got);
    let mut next = 0usize;
    let mut push = |offset: u64, dynsym_idx: u32, r_type: u32| -> Result {
        let rela = relas
            .get_mut(next)
            .ok_or_else(|| anyhow!("Too few .rela.dyn entries allocated"))?;
        rela.r_offset.set(e, offset);
        rela.r_info
            .set(e, (u64::from(dynsym_idx) << 32) | u64::from(r_type));
        rela.r_addend.set(e, 0);
        next += 1;
        Ok(())
    };

    for (index, entry) in ctx.dynamic.got.iter().enumerate() {
        let slot_address = got_base + index as u64 * elf::GOT_ENTRY_SIZE;
        match entry {
            GotEntry::Address(id) => {
                let symbol = symbol_db.symbol(*id);
                if symbol.is_imported {
                    push(slot_address, symbol.dynsym_idx, A::REL_GLOB_DAT)?;
                }
            }
            GotEntry::TpOff(id) => {
                let symbol = symbol_db.symbol(*id);
                if symbol.is_imported {
                    push(slot_address, symbol.dynsym_idx, A::REL_TPOFF)?;
                }
            }
            GotEntry::DtpMod(Some(id)) => {
                let symbol = symbol_db.symbol(*id);
                if symbol.is_imported {
                    push(slot_address, symbol.dynsym_idx, A::REL_DTPMOD)?;
                }
            }
            GotEntry::DtpOff(id) => {
                let symbol = symbol_db.symbol(*id);
                if symbol.is_imported {
                    push(slot_address, symbol.dynsym_idx, A::REL_DTPOFF)?;
                }
            }
            GotEntry::DtpMod(None) | GotEntry::Zero => {}
        }
    }

    for id in &ctx.dynamic.copyrel {
        let address = symbol_address(files, by_priority, symbol_db, ctx, layout, *id)?;
        push(address, symbol_db.symbol(*id).dynsym_idx, A::REL_COPY)?;
    }
    Ok(())
}

/// Where a symbol lands in the output for symbol-table purposes.
fn symbol_shndx<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
    id: SymbolId,
) -> Result<u16> {
    let symbol = symbol_db.symbol(id);
    let claim = symbol.claim();
    if claim.is_none() {
        return Ok(object::elf::SHN_UNDEF);
    }
    if claim.priority() == crate::parsing::PRELUDE_PRIORITY {
        return Ok(object::elf::SHN_ABS);
    }
    match by_priority.get(files, claim.priority())? {
        ParsedInput::Prelude(_) => Ok(object::elf::SHN_ABS),
        ParsedInput::Shared(_) => {
            if symbol.has_copyrel {
                let shndx = layout::chunk_by_kind(
                    ctx,
                    ChunkKind::Synthetic(SyntheticKind::Copyrel),
                )
                .map_or(0, |c| c.shndx);
                Ok(shndx)
            } else {
                Ok(object::elf::SHN_UNDEF)
            }
        }
        ParsedInput::Object(obj) => {
            let e = LittleEndian;
            let index = object::SymbolIndex(claim.sym_index() as usize);
            let local = obj.object.symbol(index)?;
            if local.is_absolute(e) {
                return Ok(object::elf::SHN_ABS);
            }
            if claim.rank() == crate::symbol_db::ClaimRank::Common {
                let shndx = layout
                    .section_chunk_index(crate::output_section::BSS)
                    .map_or(0, |i| ctx.chunks[i].shndx);
                return Ok(shndx);
            }
            let Some(section_index) = obj.object.symbols.symbol_section(e, local, index)? else {
                return Ok(object::elf::SHN_ABS);
            };
            match &obj.sections[section_index.0] {
                SectionSlot::Loaded(section) => {
                    let shndx = layout
                        .section_chunk_index(section.output_section)
                        .map_or(0, |i| ctx.chunks[i].shndx);
                    Ok(shndx)
                }
                SectionSlot::MergeStrings(merge_index) => {
                    let merge = &obj.mergeable_sections[*merge_index];
                    let shndx = layout
                        .merged_chunk_index(merge.merged_id)
                        .map_or(0, |i| ctx.chunks[i].shndx);
                    Ok(shndx)
                }
                SectionSlot::Discard => Ok(object::elf::SHN_UNDEF),
            }
        }
    }
}

fn source_symbol_info<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    id_claim: crate::symbol_db::Claim,
) -> (u8, u64) {
    if id_claim.is_none() || id_claim.priority() == crate::parsing::PRELUDE_PRIORITY {
        return (object::elf::STT_NOTYPE, 0);
    }
    let e = LittleEndian;
    let index = object::SymbolIndex(id_claim.sym_index() as usize);
    match by_priority.get(files, id_claim.priority()) {
        Ok(ParsedInput::Object(obj)) => obj
            .object
            .symbol(index)
            .map(|s| (s.st_type(), s.st_size(e)))
            .unwrap_or((object::elf::STT_NOTYPE, 0)),
        Ok(ParsedInput::Shared(dso)) => dso
            .object
            .symbol(index)
            .map(|s| (s.st_type(), s.st_size(e)))
            .unwrap_or((object::elf::STT_NOTYPE, 0)),
        _ => (object::elf::STT_NOTYPE, 0),
    }
}

fn write_dynsym<'data>(
    out: &mut [u8],
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    let entries: &mut [elf::SymtabEntry] = elf::slice_from_all_bytes_mut(out);
    // entries[0] is the null symbol and stays zeroed.
    for (out, entry) in entries[1..].iter_mut().zip(&ctx.dynamic.dynsym) {
        write_symbol_entry(out, files, by_priority, symbol_db, ctx, layout, *entry)?;
    }
    Ok(())
}

fn write_symbol_entry<'data>(
    out: &mut elf::SymtabEntry,
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
    entry: DynsymEntry,
) -> Result {
    let e = LittleEndian;
    let symbol = symbol_db.symbol(entry.symbol);
    let claim = symbol.claim();
    let (st_type, st_size) = source_symbol_info(files, by_priority, claim);
    let address = symbol_address(files, by_priority, symbol_db, ctx, layout, entry.symbol)?;
    let shndx = symbol_shndx(files, by_priority, symbol_db, ctx, layout, entry.symbol)?;

    out.st_name.set(e, entry.name_offset);
    out.st_info = (object::elf::STB_GLOBAL << 4) | (st_type & 0xf);
    out.st_other = object::elf::STV_DEFAULT;
    let value = if symbol.is_imported && !symbol.has_copyrel {
        0
    } else {
        address
    };
    out.st_shndx.set(e, shndx);
    out.st_value.set(e, value);
    out.st_size.set(e, st_size);
    Ok(())
}

fn write_symtab<'data>(
    out: &mut [u8],
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    ctx: &Context<'data>,
    layout: &Layout,
) -> Result {
    let entries: &mut [elf::SymtabEntry] = elf::slice_from_all_bytes_mut(out);
    for (out, entry) in entries[1..].iter_mut().zip(&layout.symtab.entries) {
        write_symbol_entry(
            out,
            files,
            by_priority,
            symbol_db,
            ctx,
            layout,
            DynsymEntry {
                symbol: entry.symbol,
                name_offset: entry.name_offset,
            },
        )?;
    }
    Ok(())
}

/// SysV hash table over the dynamic symbols, with as many buckets as there
/// are symbols.
fn write_hash(out: &mut [u8], symbol_db: &SymbolDb, ctx: &Context) -> Result {
    let words: &mut [object::U32<LittleEndian>] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    let num_symbols = ctx.dynamic.dynsym.len() + 1;
    let nbucket = num_symbols as u32;
    let nchain = num_symbols as u32;
    words[0].set(e, nbucket);
    words[1].set(e, nchain);
    let (buckets, chains) = words[2..].split_at_mut(nbucket as usize);

    for (index, entry) in ctx.dynamic.dynsym.iter().enumerate() {
        let name = symbol_db.name(entry.symbol);
        let hash = elf_hash(name.bytes());
        let bucket = &mut buckets[(hash % nbucket) as usize];
        let symbol_index = index as u32 + 1;
        chains[symbol_index as usize].set(e, bucket.get(e));
        bucket.set(e, symbol_index);
    }
    Ok(())
}

fn write_dynamic(out: &mut [u8], ctx: &Context, layout: &Layout) -> Result {
    let entries: &mut [elf::DynamicEntry] = elf::slice_from_all_bytes_mut(out);
    let e = LittleEndian;
    let values = layout::dynamic_entries(ctx, layout.num_dyn_relocations);
    if values.len() != entries.len() {
        bail!("Mis-sized .dynamic section");
    }
    for (out, (tag, value)) in entries.iter_mut().zip(values) {
        out.d_tag.set(e, tag);
        out.d_val.set(e, value);
    }
    Ok(())
}
