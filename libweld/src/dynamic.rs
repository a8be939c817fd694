//! Builds the dynamic-linking metadata: .dynsym, .dynstr, .hash, .got,
//! .plt, the relocation tables and the version tables. Allocation happens in
//! a deterministic serial pass (file priority order, then symbol index)
//! driven by the needs-flags the relocation scanner accumulated.

use crate::elf;
use crate::error::Result;
use crate::hash::elf_hash;
use crate::parsing::ParsedInput;
use crate::resolution::FilesByPriority;
use crate::shared_file::SharedFile;
use crate::symbol_db::NeedsFlags;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::version_script::SymbolVisibility;
use crate::version_script::VersionScript;
use anyhow::Context as _;
use itertools::Itertools as _;
use object::LittleEndian;
use object::read::elf::Sym as _;

/// A deduplicating string table under construction (.dynstr or .strtab).
/// Offset 0 is the empty string.
pub(crate) struct StringTable {
    bytes: Vec<u8>,
    map: hashbrown::HashMap<Vec<u8>, u32, foldhash::fast::RandomState>,
}

impl StringTable {
    pub(crate) fn new() -> Self {
        Self {
            bytes: vec![0],
            map: Default::default(),
        }
    }

    pub(crate) fn get_or_add(&mut self, string: &[u8]) -> u32 {
        if string.is_empty() {
            return 0;
        }
        if let Some(offset) = self.map.get(string) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(string);
        self.bytes.push(0);
        self.map.insert(string.to_vec(), offset);
        offset
    }

    pub(crate) fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Clone, Copy)]
pub(crate) struct DynsymEntry {
    pub(crate) symbol: SymbolId,
    pub(crate) name_offset: u32,
}

/// One 8-byte slot of .got.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GotEntry {
    /// The address of a symbol; GLOB_DAT for imported targets.
    Address(SymbolId),

    /// The TP-relative offset of a thread-local; TPOFF for imported targets.
    TpOff(SymbolId),

    /// The TLS module ID of a symbol's module, or of our own module when
    /// None (the local-dynamic entry).
    DtpMod(Option<SymbolId>),

    /// The offset of a thread-local within its module's TLS block.
    DtpOff(SymbolId),

    /// A zero slot (the offset half of the local-dynamic pair).
    Zero,
}

pub(crate) struct DynamicData<'data> {
    pub(crate) dynsym: Vec<DynsymEntry>,
    pub(crate) dynstr: StringTable,
    pub(crate) got: Vec<GotEntry>,
    pub(crate) plt: Vec<SymbolId>,
    pub(crate) copyrel: Vec<SymbolId>,
    pub(crate) copyrel_size: u64,

    /// Index of the shared local-dynamic (module, 0) pair in .got, if any
    /// TLSLD relocation was seen.
    pub(crate) tlsld_got_idx: Option<u32>,

    /// .dynstr offsets of the DT_NEEDED sonames, in input order.
    pub(crate) needed: Vec<u32>,
    pub(crate) runpath_offset: Option<u32>,
    pub(crate) soname_offset: Option<u32>,

    /// One entry per dynsym slot including the null entry. Filled by version
    /// table construction.
    pub(crate) versym: Vec<u16>,
    pub(crate) verneed: Vec<u8>,
    pub(crate) verneed_count: u32,
    pub(crate) verdef: Vec<u8>,
    pub(crate) verdef_count: u32,

    marker: std::marker::PhantomData<&'data ()>,
}

/// Alignment for copy-relocated data. We don't know the symbol's original
/// alignment, so use something conservative.
const COPYREL_ALIGNMENT: u64 = 32;

impl<'data> DynamicData<'data> {
    pub(crate) fn new() -> Self {
        Self {
            dynsym: Vec::new(),
            dynstr: StringTable::new(),
            got: Vec::new(),
            plt: Vec::new(),
            copyrel: Vec::new(),
            copyrel_size: 0,
            tlsld_got_idx: None,
            needed: Vec::new(),
            runpath_offset: None,
            soname_offset: None,
            versym: Vec::new(),
            verneed: Vec::new(),
            verneed_count: 0,
            verdef: Vec::new(),
            verdef_count: 0,
            marker: std::marker::PhantomData,
        }
    }

    /// Number of dynsym entries including the null entry.
    pub(crate) fn num_dynsym(&self) -> u64 {
        self.dynsym.len() as u64 + 1
    }

    fn add_dynsym(&mut self, symbol_db: &mut SymbolDb<'data>, id: SymbolId) {
        if symbol_db.symbol(id).dynsym_idx != 0 {
            return;
        }
        let name_offset = self.dynstr.get_or_add(symbol_db.name(id).bytes());
        self.dynsym.push(DynsymEntry {
            symbol: id,
            name_offset,
        });
        symbol_db.symbol_mut(id).dynsym_idx = self.dynsym.len() as u32;
    }

    pub(crate) fn num_plt_relocations(&self) -> u64 {
        self.plt.len() as u64
    }

    /// Number of .rela.dyn entries, known once allocation is complete.
    pub(crate) fn num_dyn_relocations(&self, symbol_db: &SymbolDb) -> u64 {
        let mut count = self.copyrel.len() as u64;
        for entry in &self.got {
            match entry {
                GotEntry::Address(id) | GotEntry::TpOff(id) => {
                    if symbol_db.symbol(*id).is_imported {
                        count += 1;
                    }
                }
                GotEntry::DtpMod(Some(id)) | GotEntry::DtpOff(id) => {
                    if symbol_db.symbol(*id).is_imported {
                        count += 1;
                    }
                }
                GotEntry::DtpMod(None) | GotEntry::Zero => {}
            }
        }
        count
    }
}

/// Serial pass over all alive files: for every symbol a file owns whose
/// needs-flags are non-zero, append entries to the corresponding tables. The
/// iteration order (file priority, then symbol index within the file) is what
/// makes table contents deterministic.
#[tracing::instrument(skip_all, name = "Allocate dynamic entries")]
pub(crate) fn allocate_dynamic_entries<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &mut SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
) -> Result {
    let file_order = files
        .iter()
        .enumerate()
        .sorted_by_key(|(_, f)| f.priority())
        .map(|(i, _)| i)
        .collect_vec();

    for file_index in file_order {
        match &files[file_index] {
            ParsedInput::Prelude(_) => {}
            ParsedInput::Object(obj) => {
                for i in obj.global_symbol_indices() {
                    let id = obj.symbol_id(i);
                    let claim = symbol_db.symbol(id).claim();
                    if claim.is_none() || claim.priority() != obj.priority {
                        continue;
                    }
                    allocate_for_symbol(files, by_priority, symbol_db, dynamic, id)?;
                }
            }
            ParsedInput::Shared(shared) => {
                for i in shared.global_symbol_indices() {
                    let symbol = shared.object.symbol(i)?;
                    if symbol.is_undefined(LittleEndian) {
                        continue;
                    }
                    let id = shared.symbol_id(i);
                    let claim = symbol_db.symbol(id).claim();
                    if claim.is_none() || claim.priority() != shared.priority {
                        continue;
                    }
                    allocate_for_symbol(files, by_priority, symbol_db, dynamic, id)?;
                }
            }
        }
    }
    Ok(())
}

fn allocate_for_symbol<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &mut SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    id: SymbolId,
) -> Result {
    let flags = symbol_db.symbol(id).flags();
    if flags.is_empty() {
        return Ok(());
    }
    if symbol_db.symbol(id).traced {
        tracing::info!(
            symbol = %symbol_db.name(id),
            flags = ?flags,
            "allocating dynamic entries"
        );
    }

    if flags.contains(NeedsFlags::DYNSYM) || symbol_db.symbol(id).is_imported {
        dynamic.add_dynsym(symbol_db, id);
    }

    if flags.contains(NeedsFlags::GOT) && symbol_db.symbol(id).got_idx == 0 {
        dynamic.got.push(GotEntry::Address(id));
        symbol_db.symbol_mut(id).got_idx = dynamic.got.len() as u32;
    }

    if flags.contains(NeedsFlags::PLT) && symbol_db.symbol(id).plt_idx == 0 {
        dynamic.plt.push(id);
        symbol_db.symbol_mut(id).plt_idx = dynamic.plt.len() as u32;
    }

    if flags.contains(NeedsFlags::GOTTPOFF) && symbol_db.symbol(id).gottpoff_idx == 0 {
        dynamic.got.push(GotEntry::TpOff(id));
        symbol_db.symbol_mut(id).gottpoff_idx = dynamic.got.len() as u32;
    }

    if flags.contains(NeedsFlags::TLSGD) && symbol_db.symbol(id).tlsgd_idx == 0 {
        dynamic.got.push(GotEntry::DtpMod(Some(id)));
        dynamic.got.push(GotEntry::DtpOff(id));
        symbol_db.symbol_mut(id).tlsgd_idx = (dynamic.got.len() - 1) as u32;
    }

    if flags.contains(NeedsFlags::TLSLD) && dynamic.tlsld_got_idx.is_none() {
        dynamic.got.push(GotEntry::DtpMod(None));
        dynamic.got.push(GotEntry::Zero);
        dynamic.tlsld_got_idx = Some((dynamic.got.len() - 2) as u32);
    }

    if flags.contains(NeedsFlags::COPYREL) && !symbol_db.symbol(id).has_copyrel {
        allocate_copy_relocation(files, by_priority, symbol_db, dynamic, id)?;
    }

    Ok(())
}

/// Space in .copyrel (a NOBITS chunk) for an imported data symbol, plus
/// dynsym entries for every alias at the same address in the owning DSO.
/// Each alias is stamped with the same location so the runtime binds them
/// all to the copied data.
fn allocate_copy_relocation<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &mut SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    id: SymbolId,
) -> Result {
    let claim = symbol_db.symbol(id).claim();
    let ParsedInput::Shared(dso) = by_priority.get(files, claim.priority())? else {
        anyhow::bail!(
            "Copy relocation against `{}`, which isn't defined by a shared object",
            symbol_db.name(id)
        );
    };

    let target_index = object::SymbolIndex(claim.sym_index() as usize);
    let size = dso
        .object
        .symbol(target_index)?
        .st_size(LittleEndian)
        .max(1);

    dynamic.copyrel_size = dynamic.copyrel_size.next_multiple_of(COPYREL_ALIGNMENT);
    let offset = dynamic.copyrel_size;
    dynamic.copyrel_size += size;

    for alias_index in dso.find_aliases(target_index)? {
        let alias_id = dso.symbol_id(alias_index);
        let alias = symbol_db.symbol_mut(alias_id);
        alias.has_copyrel = true;
        alias.copyrel_offset = offset;
        dynamic.add_dynsym(symbol_db, alias_id);
    }
    dynamic.copyrel.push(id);
    Ok(())
}

/// Exports symbols to .dynsym: with `--export-dynamic`, or when building a
/// shared object, every defined global of every regular object goes in,
/// subject to version-script visibility.
#[tracing::instrument(skip_all, name = "Export dynamic symbols")]
pub(crate) fn export_dynamic<'data>(
    files: &[ParsedInput<'data>],
    symbol_db: &mut SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    version_script: &VersionScript,
) -> Result {
    let file_order = files
        .iter()
        .enumerate()
        .sorted_by_key(|(_, f)| f.priority())
        .map(|(i, _)| i)
        .collect_vec();

    for file_index in file_order {
        let ParsedInput::Object(obj) = &files[file_index] else {
            continue;
        };
        for i in obj.global_symbol_indices() {
            let symbol = obj.object.symbol(i)?;
            if symbol.is_undefined(LittleEndian) {
                continue;
            }
            let id = obj.symbol_id(i);
            let claim = symbol_db.symbol(id).claim();
            if claim.is_none() || claim.priority() != obj.priority {
                continue;
            }
            // Hidden visibility never makes it into the dynamic table.
            if symbol.st_visibility() == object::elf::STV_HIDDEN {
                continue;
            }
            let name = symbol_db.name(id);
            match version_script.visibility(
                std::str::from_utf8(name.bytes()).context("Symbol name is not valid UTF-8")?,
            ) {
                SymbolVisibility::Local => {
                    symbol_db.symbol_mut(id).ver_idx = object::elf::VER_NDX_LOCAL;
                }
                SymbolVisibility::Global(ordinal) => {
                    if let Some(ordinal) = ordinal {
                        symbol_db.symbol_mut(id).ver_idx = ordinal;
                    }
                    symbol_db.symbol(id).add_flags(NeedsFlags::DYNSYM);
                    dynamic.add_dynsym(symbol_db, id);
                }
                SymbolVisibility::Unlisted => {
                    symbol_db.symbol(id).add_flags(NeedsFlags::DYNSYM);
                    dynamic.add_dynsym(symbol_db, id);
                }
            }
        }
    }
    Ok(())
}

/// Builds .gnu.version and .gnu.version_r. Versioned imports are sorted by
/// (soname, version ordinal); one Verneed record is emitted per DSO,
/// chaining one Vernaux per distinct version, with `vna_other` counting up
/// from 2. The counter value lands in `.gnu.version` at each symbol's
/// dynsym index.
#[tracing::instrument(skip_all, name = "Build version tables")]
pub(crate) fn build_version_tables<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    version_script: &VersionScript,
    output_soname: &[u8],
) -> Result {
    // Every dynsym entry gets a versym; the null entry is VER_NDX_LOCAL and
    // unversioned symbols default to VER_NDX_GLOBAL.
    let mut versym = vec![object::elf::VER_NDX_GLOBAL; dynamic.dynsym.len() + 1];
    versym[0] = object::elf::VER_NDX_LOCAL;

    build_verneed(files, by_priority, symbol_db, dynamic, &mut versym)?;
    build_verdef(symbol_db, dynamic, &mut versym, version_script, output_soname)?;

    dynamic.versym = versym;
    Ok(())
}

fn build_verneed<'data>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    versym: &mut [u16],
) -> Result {
    struct VersionedImport<'a, 'data> {
        dso: &'a SharedFile<'data>,
        ver_idx: u16,
        dynsym_idx: u32,
    }

    let mut imports = Vec::new();
    for entry in &dynamic.dynsym {
        let symbol = symbol_db.symbol(entry.symbol);
        if !symbol.is_imported || symbol.ver_idx < 2 {
            continue;
        }
        let claim = symbol.claim();
        let ParsedInput::Shared(dso) = by_priority.get(files, claim.priority())? else {
            continue;
        };
        imports.push(VersionedImport {
            dso: dso.as_ref(),
            ver_idx: symbol.ver_idx,
            dynsym_idx: symbol.dynsym_idx,
        });
    }
    if imports.is_empty() {
        return Ok(());
    }

    imports.sort_by(|a, b| {
        a.dso
            .soname
            .cmp(b.dso.soname)
            .then(a.ver_idx.cmp(&b.ver_idx))
    });

    let mut records: Vec<u8> = Vec::new();
    let mut num_verneed = 0u32;
    // vna_other values: 0 is local, 1 is global, named versions count from 2.
    let mut next_version: u16 = 1;

    let mut index = 0;
    while index < imports.len() {
        let dso = imports[index].dso;
        let verneed_offset = records.len();
        records.extend_from_slice(&[0u8; size_of::<elf::Verneed>()]);
        num_verneed += 1;
        let file_offset = dynamic.dynstr.get_or_add(dso.soname);

        let mut num_aux = 0u16;
        let mut last_aux_offset = 0usize;
        while index < imports.len() && std::ptr::eq(imports[index].dso, dso) {
            let ver_idx = imports[index].ver_idx;
            next_version += 1;
            num_aux += 1;

            let aux_offset = records.len();
            if num_aux > 1 {
                write_u32(&mut records, last_aux_offset + 12, size_of::<elf::Vernaux>() as u32);
            }
            last_aux_offset = aux_offset;

            let name = dso.version_name(ver_idx);
            let name_offset = dynamic.dynstr.get_or_add(name);
            records.extend_from_slice(&[0u8; size_of::<elf::Vernaux>()]);
            write_u32(&mut records, aux_offset, elf_hash(name));
            // vna_flags and padding stay zero.
            write_u16(&mut records, aux_offset + 6, next_version);
            write_u32(&mut records, aux_offset + 8, name_offset);

            while index < imports.len()
                && std::ptr::eq(imports[index].dso, dso)
                && imports[index].ver_idx == ver_idx
            {
                versym[imports[index].dynsym_idx as usize] = next_version;
                index += 1;
            }
        }

        write_u16(&mut records, verneed_offset, 1); // vn_version
        write_u16(&mut records, verneed_offset + 2, num_aux);
        write_u32(&mut records, verneed_offset + 4, file_offset);
        write_u32(
            &mut records,
            verneed_offset + 8,
            size_of::<elf::Verneed>() as u32,
        );
        if index < imports.len() {
            let next_offset = (records.len() - verneed_offset) as u32;
            write_u32(&mut records, verneed_offset + 12, next_offset);
        }
    }

    dynamic.verneed = records;
    dynamic.verneed_count = num_verneed;
    Ok(())
}

/// When we produce a shared object under a version script that names
/// versions, emit .gnu.version_d: a base definition carrying our soname plus
/// one definition per named version.
fn build_verdef<'data>(
    symbol_db: &SymbolDb<'data>,
    dynamic: &mut DynamicData<'data>,
    versym: &mut [u16],
    version_script: &VersionScript,
    base_name: &[u8],
) -> Result {
    let named = version_script
        .versions
        .iter()
        .filter(|v| v.ordinal.is_some())
        .collect_vec();
    if named.is_empty() {
        return Ok(());
    }

    let base_name_offset = dynamic.dynstr.get_or_add(base_name);

    let mut records: Vec<u8> = Vec::new();
    let mut emit = |ordinal: u16, name_offset: u32, name: &[u8], flags: u16, is_last: bool| {
        let offset = records.len();
        records.extend_from_slice(&[0u8; size_of::<elf::Verdef>()]);
        write_u16(&mut records, offset, 1); // vd_version
        write_u16(&mut records, offset + 2, flags);
        write_u16(&mut records, offset + 4, ordinal);
        write_u16(&mut records, offset + 6, 1); // vd_cnt
        write_u32(&mut records, offset + 8, elf_hash(name));
        write_u32(&mut records, offset + 12, size_of::<elf::Verdef>() as u32); // vd_aux
        if !is_last {
            let next = size_of::<elf::Verdef>() + size_of::<elf::Verdaux>();
            write_u32(&mut records, offset + 16, next as u32);
        }
        let aux_offset = records.len();
        records.extend_from_slice(&[0u8; size_of::<elf::Verdaux>()]);
        write_u32(&mut records, aux_offset, name_offset);
    };

    emit(1, base_name_offset, base_name, object::elf::VER_FLG_BASE, false);
    for (position, version) in named.iter().enumerate() {
        let name = version.name.as_bytes();
        let name_offset = dynamic.dynstr.get_or_add(name);
        emit(
            version.ordinal.unwrap(),
            name_offset,
            name,
            0,
            position + 1 == named.len(),
        );
    }

    // Exported symbols stamped with an ordinal carry it directly in versym.
    for entry in &dynamic.dynsym {
        let symbol = symbol_db.symbol(entry.symbol);
        if !symbol.is_imported && symbol.ver_idx >= 2 {
            versym[symbol.dynsym_idx as usize] = symbol.ver_idx;
        }
    }

    dynamic.verdef = records;
    dynamic.verdef_count = named.len() as u32 + 1;
    Ok(())
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolName;
    use crate::symbol_db::PendingSymbols;

    #[test]
    fn string_table_dedupes() {
        let mut table = StringTable::new();
        let a = table.get_or_add(b"libc.so.6");
        let b = table.get_or_add(b"GLIBC_2.2.5");
        let c = table.get_or_add(b"libc.so.6");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.get_or_add(b""), 0);
        assert_eq!(&table.bytes()[a as usize..a as usize + 9], b"libc.so.6");
    }

    #[test]
    fn verdef_lists_named_versions() {
        let crate::args::Action::Link(args) =
            crate::args::parse(["-o", "/dev/null"].iter()).unwrap()
        else {
            panic!("expected link action");
        };
        let script = VersionScript::parse(b"V1 { global: foo; local: *; };").unwrap();

        let mut pending = PendingSymbols::new(crate::symbol_db::num_symbol_buckets(&args));
        pending.add(SymbolName::prehashed(b"foo"));
        let mut symbol_db =
            SymbolDb::build(std::slice::from_ref(&pending), &args).unwrap();
        let foo = symbol_db.lookup(SymbolName::prehashed(b"foo")).unwrap();

        let mut dynamic = DynamicData::new();
        let name_offset = dynamic.dynstr.get_or_add(b"foo");
        dynamic.dynsym.push(DynsymEntry {
            symbol: foo,
            name_offset,
        });
        {
            let symbol = symbol_db.symbol_mut(foo);
            symbol.dynsym_idx = 1;
            symbol.ver_idx = 2;
        }

        let mut versym = vec![object::elf::VER_NDX_GLOBAL; 2];
        versym[0] = object::elf::VER_NDX_LOCAL;
        build_verdef(&symbol_db, &mut dynamic, &mut versym, &script, b"libfoo.so.1").unwrap();

        // Base definition plus V1.
        assert_eq!(dynamic.verdef_count, 2);
        let record_size = size_of::<elf::Verdef>() + size_of::<elf::Verdaux>();
        assert_eq!(dynamic.verdef.len(), 2 * record_size);
        // The named definition carries ordinal 2, which `foo` also gets in
        // .gnu.version.
        let second = &dynamic.verdef[record_size..];
        assert_eq!(u16::from_le_bytes([second[4], second[5]]), 2);
        assert_eq!(versym[1], 2);
    }
}
