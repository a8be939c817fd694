//! Parses one shared object: the symbols it exports, its soname and its
//! version definitions. DSOs contribute definitions to resolution but no
//! sections; what the link needs from them is dynamic-linking metadata.

use crate::elf;
use crate::error::Result;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::symbol::SymbolName;
use crate::symbol_db::Claim;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::PendingSymbols;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::Context as _;
use object::LittleEndian;
use object::read::elf::Sym as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub(crate) struct SharedFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) object: Box<elf::File<'data>>,
    pub(crate) priority: u32,
    pub(crate) soname: &'data [u8],
    pub(crate) as_needed: bool,
    pub(crate) is_alive: AtomicBool,

    /// Version names indexed by version ordinal. Ordinals 0 and 1 are the
    /// reserved local/global indices and have empty names.
    pub(crate) version_names: Vec<&'data [u8]>,

    /// Interned IDs for our global dynamic symbols, aligned with
    /// `global_symbol_indices`.
    pub(crate) global_symbol_ids: Vec<SymbolId>,
}

impl<'data> SharedFile<'data> {
    pub(crate) fn parse(input: &InputBytes<'data>) -> Result<Self> {
        let object = Box::new(
            elf::File::parse(input.data, true)
                .with_context(|| format!("Failed to parse shared object `{}`", input.input))?,
        );
        let e = LittleEndian;

        let mut soname = None;
        for entry in object.dynamic {
            if entry.d_tag.get(e) == u64::from(object::elf::DT_SONAME) {
                soname = Some(object.dynamic_string(entry.d_val.get(e))?);
            }
        }
        let soname = match soname {
            Some(soname) => soname,
            None => file_name_bytes(input),
        };

        let version_names = parse_version_names(&object)?;

        Ok(Self {
            input: input.input,
            object,
            priority: 0,
            soname,
            as_needed: input.modifiers.as_needed,
            is_alive: AtomicBool::new(!input.modifiers.as_needed),
            version_names,
            global_symbol_ids: Vec::new(),
        })
    }

    pub(crate) fn num_globals(&self) -> usize {
        self.object.symbols.len().saturating_sub(self.object.first_global)
    }

    pub(crate) fn pending_symbols(&self, num_buckets: usize) -> Result<PendingSymbols<'data>> {
        let e = LittleEndian;
        let mut pending = PendingSymbols::new(num_buckets);
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            if symbol.is_undefined(e) {
                continue;
            }
            pending.add(SymbolName::prehashed(self.object.symbol_name(symbol)?));
        }
        Ok(pending)
    }

    pub(crate) fn populate_symbol_ids(&mut self, symbol_db: &SymbolDb<'data>) -> Result {
        let e = LittleEndian;
        let mut ids = Vec::with_capacity(self.num_globals());
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            if symbol.is_undefined(e) {
                ids.push(SymbolId::placeholder());
                continue;
            }
            let name = SymbolName::prehashed(self.object.symbol_name(symbol)?);
            ids.push(
                symbol_db
                    .lookup(name)
                    .expect("All defined DSO names were interned during the build"),
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

    /// The version ordinal the DSO assigns to one of its dynamic symbols.
    pub(crate) fn symbol_version(&self, index: object::SymbolIndex) -> u16 {
        self.object
            .versym
            .get(index.0)
            .map_or(object::elf::VER_NDX_GLOBAL, |versym| {
                versym.0.get(LittleEndian) & object::elf::VERSYM_VERSION
            })
    }

    pub(crate) fn version_name(&self, ordinal: u16) -> &'data [u8] {
        self.version_names
            .get(usize::from(ordinal))
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn resolve_symbols(&self, symbol_db: &SymbolDb<'data>) -> Result {
        let e = LittleEndian;
        let alive = self.is_alive.load(Ordering::Relaxed);
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            if symbol.is_undefined(e) {
                continue;
            }
            // Hidden versions are implementation details of the DSO.
            if let Some(versym) = self.object.versym.get(i.0) {
                if versym.0.get(e) & object::elf::VERSYM_HIDDEN != 0 {
                    continue;
                }
            }
            let rank = if !alive {
                ClaimRank::Lazy
            } else if symbol.is_weak() {
                ClaimRank::Weak
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

    pub(crate) fn activate(&self) -> bool {
        !self.is_alive.swap(true, Ordering::AcqRel)
    }

    /// Returns the dynamic symbol indices of every symbol defined at the same
    /// address as `index`, including `index` itself. Copy relocations need
    /// every alias to move with the copied data.
    pub(crate) fn find_aliases(&self, index: object::SymbolIndex) -> Result<Vec<object::SymbolIndex>> {
        let e = LittleEndian;
        let target = self.object.symbol(index)?;
        let value = target.st_value.get(e);
        let mut aliases = Vec::new();
        for i in self.global_symbol_indices() {
            let symbol = self.object.symbol(i)?;
            if !symbol.is_undefined(e)
                && symbol.st_value.get(e) == value
                && symbol.st_shndx.get(e) == target.st_shndx.get(e)
            {
                aliases.push(i);
            }
        }
        Ok(aliases)
    }
}

fn parse_version_names<'data>(object: &elf::File<'data>) -> Result<Vec<&'data [u8]>> {
    let Some((mut iterator, strings_index)) = object.verdef.clone() else {
        return Ok(Vec::new());
    };
    let mut names: Vec<&[u8]> = vec![b""; 2];
    while let Some((verdef, mut aux_iterator)) = iterator.next()? {
        let e = LittleEndian;
        let ordinal = usize::from(verdef.vd_ndx.get(e) & object::elf::VERSYM_VERSION);
        let Some(aux) = aux_iterator.next()? else {
            continue;
        };
        let name = object.strings_in(strings_index, u64::from(aux.vda_name.get(e)))?;
        if names.len() <= ordinal {
            names.resize(ordinal + 1, b"");
        }
        names[ordinal] = name;
    }
    Ok(names)
}

fn file_name_bytes<'data>(input: &InputBytes<'data>) -> &'data [u8] {
    std::os::unix::ffi::OsStrExt::as_bytes(
        input
            .input
            .file
            .filename
            .file_name()
            .unwrap_or(input.input.file.filename.as_os_str()),
    )
}

impl std::fmt::Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}
