//! Turns raw input bytes into parsed files, assigns file priorities and
//! populates the symbol store.

use crate::args::Args;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputBytes;
use crate::object_file::ObjectFile;
use crate::output_section::OutputSectionId;
use crate::shared_file::SharedFile;
use crate::symbol::SymbolName;
use crate::symbol_db::Claim;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::PendingSymbols;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::num_symbol_buckets;
use hashbrown::HashSet;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

pub(crate) enum ParsedInput<'data> {
    Prelude(Prelude<'data>),
    Object(Box<ObjectFile<'data>>),
    Shared(Box<SharedFile<'data>>),
}

/// The priority reserved for the prelude, the pseudo-file that owns
/// linker-synthesized symbols. Real files start at `FIRST_FILE_PRIORITY`.
pub(crate) const PRELUDE_PRIORITY: u32 = 1;
pub(crate) const FIRST_FILE_PRIORITY: u32 = 2;

/// A pseudo input file defining the symbols the linker itself synthesizes.
/// Their values are bound after layout.
pub(crate) struct Prelude<'data> {
    pub(crate) symbol_definitions: Vec<PreludeSymbol<'data>>,
}

pub(crate) struct PreludeSymbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) placement: SyntheticPlacement,
}

/// Where a linker-synthesized symbol gets its address from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyntheticPlacement {
    BssStart,
    EhdrStart,
    RelaIpltStart,
    RelaIpltEnd,
    InitArrayStart,
    InitArrayEnd,
    FiniArrayStart,
    FiniArrayEnd,
    End,
    Etext,
    Edata,
    Dynamic,
    GlobalOffsetTable,
    SectionStart(OutputSectionId),
    SectionStop(OutputSectionId),
}

impl<'data> Prelude<'data> {
    fn new() -> Self {
        use SyntheticPlacement as P;
        let base: &[(&'static [u8], SyntheticPlacement)] = &[
            (b"__bss_start", P::BssStart),
            (b"__ehdr_start", P::EhdrStart),
            (b"__rela_iplt_start", P::RelaIpltStart),
            (b"__rela_iplt_end", P::RelaIpltEnd),
            (b"__init_array_start", P::InitArrayStart),
            (b"__init_array_end", P::InitArrayEnd),
            (b"__fini_array_start", P::FiniArrayStart),
            (b"__fini_array_end", P::FiniArrayEnd),
            (b"_end", P::End),
            (b"_etext", P::Etext),
            (b"_edata", P::Edata),
            (b"_DYNAMIC", P::Dynamic),
            (b"_GLOBAL_OFFSET_TABLE_", P::GlobalOffsetTable),
        ];
        Prelude {
            symbol_definitions: base
                .iter()
                .map(|(name, placement)| PreludeSymbol {
                    name,
                    placement: *placement,
                })
                .collect(),
        }
    }

    fn pending_symbols(&self, num_buckets: usize) -> PendingSymbols<'data> {
        let mut pending = PendingSymbols::new(num_buckets);
        for def in &self.symbol_definitions {
            pending.add(SymbolName::prehashed(def.name));
        }
        pending
    }

    /// Offers strong claims for the synthesized symbols. The prelude has the
    /// lowest real priority, so these win ties the way a linker script's own
    /// definitions would.
    pub(crate) fn resolve_symbols(&self, symbol_db: &SymbolDb) {
        for (index, def) in self.symbol_definitions.iter().enumerate() {
            if let Some(id) = symbol_db.lookup(SymbolName::prehashed(def.name)) {
                symbol_db.offer_claim(
                    id,
                    Claim::new(ClaimRank::Strong, PRELUDE_PRIORITY, index as u32),
                );
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_input_files<'data>(
    inputs: &'data [InputBytes<'data>],
    _args: &Args,
) -> Result<Vec<ParsedInput<'data>>> {
    let mut files = inputs
        .par_iter()
        .map(|input| match input.kind {
            FileKind::ElfObject => Ok(ParsedInput::Object(Box::new(ObjectFile::parse(input)?))),
            FileKind::ElfDynamic => Ok(ParsedInput::Shared(Box::new(SharedFile::parse(input)?))),
            _ => unreachable!("Archives and scripts are expanded before parsing"),
        })
        .collect::<Result<Vec<ParsedInput>>>()?;

    dedupe_shared_objects(&mut files);
    files.insert(0, ParsedInput::Prelude(Prelude::new()));
    assign_priorities(&mut files);
    Ok(files)
}

/// Drops shared objects whose soname was already seen; the first occurrence
/// wins.
fn dedupe_shared_objects(files: &mut Vec<ParsedInput>) {
    let mut seen = HashSet::new();
    files.retain(|file| match file {
        ParsedInput::Shared(shared) => seen.insert(shared.soname.to_vec()),
        _ => true,
    });
}

/// Assigns the unique tie-break order: non-archive objects get the lowest
/// priorities, archive members come next and DSOs last. Command-line order is
/// preserved within each class.
fn assign_priorities(files: &mut [ParsedInput]) {
    let mut next = FIRST_FILE_PRIORITY;
    for file in files.iter_mut() {
        if let ParsedInput::Object(obj) = file {
            if !obj.is_in_archive {
                obj.priority = next;
                next += 1;
            }
        }
    }
    for file in files.iter_mut() {
        if let ParsedInput::Object(obj) = file {
            if obj.is_in_archive {
                obj.priority = next;
                next += 1;
            }
        }
    }
    for file in files.iter_mut() {
        if let ParsedInput::Shared(shared) = file {
            shared.priority = next;
            next += 1;
        }
    }
}

/// Claims `__start_<name>` / `__stop_<name>` for every custom output section
/// whose name is a valid C identifier, provided something referenced them.
/// The definitions join the prelude and are bound to addresses after layout.
#[tracing::instrument(skip_all, name = "Define start/stop symbols")]
pub(crate) fn define_start_stop_symbols<'data>(
    files: &mut [ParsedInput<'data>],
    symbol_db: &SymbolDb<'data>,
    output_sections: &crate::output_section::OutputSections<'data>,
) {
    let mut new_definitions = Vec::new();
    for id in symbol_db.symbol_ids() {
        if !symbol_db.symbol(id).claim().is_none() {
            continue;
        }
        let name = symbol_db.name(id);
        let (section_name, is_start) = if let Some(s) = name.bytes().strip_prefix(b"__start_") {
            (s, true)
        } else if let Some(s) = name.bytes().strip_prefix(b"__stop_") {
            (s, false)
        } else {
            continue;
        };
        if !crate::output_section::is_c_identifier(section_name) {
            continue;
        }
        let Some(section_id) = output_sections.custom_name_to_id(section_name) else {
            continue;
        };
        let placement = if is_start {
            SyntheticPlacement::SectionStart(section_id)
        } else {
            SyntheticPlacement::SectionStop(section_id)
        };
        new_definitions.push((id, name.bytes(), placement));
    }

    let ParsedInput::Prelude(prelude) = &mut files[0] else {
        return;
    };
    for (id, name, placement) in new_definitions {
        let index = prelude.symbol_definitions.len() as u32;
        prelude.symbol_definitions.push(PreludeSymbol { name, placement });
        symbol_db.offer_claim(id, Claim::new(ClaimRank::Strong, PRELUDE_PRIORITY, index));
    }
}

/// Builds the symbol store from every file's global names and fills in each
/// file's interned symbol IDs.
#[tracing::instrument(skip_all, name = "Populate symbol store")]
pub(crate) fn build_symbol_db<'data>(
    files: &mut [ParsedInput<'data>],
    args: &Args,
) -> Result<SymbolDb<'data>> {
    let num_buckets = num_symbol_buckets(args);
    let pending = files
        .par_iter()
        .map(|file| match file {
            ParsedInput::Prelude(prelude) => Ok(prelude.pending_symbols(num_buckets)),
            ParsedInput::Object(obj) => obj.pending_symbols(num_buckets),
            ParsedInput::Shared(shared) => shared.pending_symbols(num_buckets),
        })
        .collect::<Result<Vec<PendingSymbols>>>()?;

    let symbol_db = SymbolDb::build(&pending, args)?;

    files.par_iter_mut().try_for_each(|file| match file {
        ParsedInput::Prelude(_) => Ok(()),
        ParsedInput::Object(obj) => obj.populate_symbol_ids(&symbol_db),
        ParsedInput::Shared(shared) => shared.populate_symbol_ids(&symbol_db),
    })?;

    Ok(symbol_db)
}

impl<'data> ParsedInput<'data> {
    pub(crate) fn priority(&self) -> u32 {
        match self {
            ParsedInput::Prelude(_) => PRELUDE_PRIORITY,
            ParsedInput::Object(obj) => obj.priority,
            ParsedInput::Shared(shared) => shared.priority,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            ParsedInput::Prelude(_) => true,
            ParsedInput::Object(obj) => obj.is_alive.load(std::sync::atomic::Ordering::Relaxed),
            ParsedInput::Shared(shared) => {
                shared.is_alive.load(std::sync::atomic::Ordering::Relaxed)
            }
        }
    }
}

impl std::fmt::Display for ParsedInput<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParsedInput::Prelude(_) => std::fmt::Display::fmt("<prelude>", f),
            ParsedInput::Object(obj) => std::fmt::Display::fmt(obj, f),
            ParsedInput::Shared(shared) => std::fmt::Display::fmt(shared, f),
        }
    }
}
