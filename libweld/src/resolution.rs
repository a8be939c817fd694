//! Symbol resolution: registers every file's definitions with the store,
//! marks the reachable part of the file graph (pulling in archive members and
//! as-needed DSOs on first reference), prunes dead files and reports
//! duplicate definitions.

use crate::error::ErrorSink;
use crate::error::Result;
use crate::parsing::ParsedInput;
use crate::symbol_db::ClaimRank;
use crate::symbol_db::SymbolDb;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Maps file priorities back to positions in the files vector. Priorities
/// are the currency of claims, so every phase that follows a claim to its
/// owner goes through this.
pub(crate) struct FilesByPriority {
    map: Vec<u32>,
}

const NO_FILE: u32 = u32::MAX;

impl FilesByPriority {
    pub(crate) fn build(files: &[ParsedInput]) -> Self {
        let max_priority = files.iter().map(|f| f.priority()).max().unwrap_or(0);
        let mut map = vec![NO_FILE; max_priority as usize + 1];
        for (index, file) in files.iter().enumerate() {
            map[file.priority() as usize] = index as u32;
        }
        Self { map }
    }

    pub(crate) fn get<'files, 'data>(
        &self,
        files: &'files [ParsedInput<'data>],
        priority: u32,
    ) -> Result<&'files ParsedInput<'data>> {
        let index = *self
            .map
            .get(priority as usize)
            .filter(|&&i| i != NO_FILE)
            .ok_or_else(|| anyhow!("No file with priority {priority}"))?;
        Ok(&files[index as usize])
    }
}

/// Registration, liveness and pruning. On return, `files` contains only the
/// files that are part of the link and every claim's owner is one of them.
#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols<'data>(
    files: &mut Vec<ParsedInput<'data>>,
    symbol_db: &mut SymbolDb<'data>,
    errors: &ErrorSink,
) -> Result {
    register_definitions(files, symbol_db, errors)?;
    errors.checkpoint()?;

    mark_live_files(files, symbol_db, errors);
    errors.checkpoint()?;

    prune_dead_files(files, symbol_db);
    stamp_imported_symbols(files, symbol_db)?;
    Ok(())
}

#[tracing::instrument(skip_all, name = "Register definitions")]
fn register_definitions(
    files: &[ParsedInput],
    symbol_db: &SymbolDb,
    errors: &ErrorSink,
) -> Result {
    files.par_iter().for_each(|file| {
        let result = match file {
            ParsedInput::Prelude(prelude) => {
                prelude.resolve_symbols(symbol_db);
                Ok(())
            }
            ParsedInput::Object(obj) => obj.resolve_symbols(symbol_db),
            ParsedInput::Shared(shared) => shared.resolve_symbols(symbol_db),
        };
        if let Err(error) = result {
            errors.report(error.context(format!("Failed to resolve symbols in {file}")));
        }
    });
    Ok(())
}

/// Mark-reachable over the bipartite graph of files connected by "file F
/// references a symbol owned by file G". The root set is every file that's
/// alive up-front: the prelude, objects that didn't come from archives and
/// DSOs not flagged as-needed. Visiting a reference whose winning claim is
/// lazy activates the owning file, re-registers its definitions with live
/// strength and feeds it into the work queue.
#[tracing::instrument(skip_all, name = "Mark live files")]
fn mark_live_files<'data>(
    files: &[ParsedInput<'data>],
    symbol_db: &SymbolDb<'data>,
    errors: &ErrorSink,
) {
    let by_priority = &FilesByPriority::build(files);

    rayon::scope(|scope| {
        for file in files {
            if let ParsedInput::Object(obj) = file {
                if obj.is_alive.load(Ordering::Relaxed) {
                    scope.spawn(move |scope| {
                        visit_object(obj, files, by_priority, symbol_db, errors, scope);
                    });
                }
            }
        }
    });
}

fn visit_object<'scope, 'data: 'scope, 'files: 'scope>(
    obj: &'scope crate::object_file::ObjectFile<'data>,
    files: &'files [ParsedInput<'data>],
    by_priority: &'scope FilesByPriority,
    symbol_db: &'scope SymbolDb<'data>,
    errors: &'scope ErrorSink,
    scope: &rayon::Scope<'scope>,
) {
    let e = LittleEndian;
    for i in obj.global_symbol_indices() {
        let Ok(symbol) = obj.object.symbol(i) else {
            continue;
        };
        if !symbol.is_undefined(e) {
            continue;
        }
        let id = obj.symbol_id(i);
        let claim = symbol_db.symbol(id).claim();
        if claim.is_none() || claim.rank() != ClaimRank::Lazy {
            continue;
        }
        let Ok(target) = by_priority.get(files, claim.priority()) else {
            continue;
        };
        match target {
            ParsedInput::Object(member) => {
                if member.activate() {
                    if let Err(error) = member.resolve_symbols(symbol_db) {
                        errors.report(error);
                        continue;
                    }
                    scope.spawn(move |scope| {
                        visit_object(member, files, by_priority, symbol_db, errors, scope);
                    });
                }
            }
            ParsedInput::Shared(dso) => {
                if dso.activate() {
                    if let Err(error) = dso.resolve_symbols(symbol_db) {
                        errors.report(error);
                    }
                }
            }
            ParsedInput::Prelude(_) => {}
        }
    }
}

/// Deletes files that didn't get marked and reverts any claims they held.
#[tracing::instrument(skip_all, name = "Prune dead files")]
fn prune_dead_files<'data>(files: &mut Vec<ParsedInput<'data>>, symbol_db: &mut SymbolDb<'data>) {
    let mut alive_by_priority = vec![false; files.iter().map(|f| f.priority() as usize).max().unwrap_or(0) + 1];
    for file in files.iter() {
        if file.is_alive() {
            alive_by_priority[file.priority() as usize] = true;
        }
    }
    symbol_db.retain_claims(|priority| {
        alive_by_priority
            .get(priority as usize)
            .copied()
            .unwrap_or(false)
    });
    files.retain(|file| file.is_alive());
}

/// Records, for every symbol a DSO ended up owning, the version ordinal the
/// DSO assigns to it. Such symbols are imported: their address isn't known
/// until runtime.
#[tracing::instrument(skip_all, name = "Stamp imported symbols")]
fn stamp_imported_symbols<'data>(
    files: &[ParsedInput<'data>],
    symbol_db: &mut SymbolDb<'data>,
) -> Result {
    for file in files {
        let ParsedInput::Shared(shared) = file else {
            continue;
        };
        for i in shared.global_symbol_indices() {
            let symbol = shared.object.symbol(i)?;
            if symbol.is_undefined(LittleEndian) {
                continue;
            }
            let id = shared.symbol_id(i);
            let claim = symbol_db.symbol(id).claim();
            if !claim.is_none() && claim.priority() == shared.priority {
                let sym = symbol_db.symbol_mut(id);
                sym.is_imported = true;
                sym.ver_idx = shared.symbol_version(i);
            }
        }
    }
    Ok(())
}

/// Reports every pair of live strong definitions for the same symbol. Runs
/// after COMDAT deduplication so that eliminated sections are excused, and
/// reports all duplicates before aborting.
#[tracing::instrument(skip_all, name = "Check duplicate symbols")]
pub(crate) fn check_duplicate_symbols<'data>(
    files: &[ParsedInput<'data>],
    symbol_db: &SymbolDb<'data>,
    errors: &ErrorSink,
) -> Result {
    let by_priority = FilesByPriority::build(files);
    let e = LittleEndian;

    files.par_iter().for_each(|file| {
        let ParsedInput::Object(obj) = file else {
            return;
        };
        for i in obj.global_symbol_indices() {
            let Ok(symbol) = obj.object.symbol(i) else {
                continue;
            };
            if symbol.is_undefined(e)
                || symbol.is_weak()
                || symbol.is_common(e)
                || symbol.is_absolute(e)
            {
                continue;
            }
            // A definition in a section that lost COMDAT deduplication isn't
            // a duplicate.
            if let Some(section_index) = section_index_of(symbol) {
                if matches!(
                    obj.sections.get(section_index),
                    None | Some(crate::object_file::SectionSlot::Discard)
                ) {
                    continue;
                }
            }
            let id = obj.symbol_id(i);
            let claim = symbol_db.symbol(id).claim();
            if claim.is_none() || claim.priority() == obj.priority {
                continue;
            }
            if claim.rank() != ClaimRank::Strong {
                continue;
            }
            let owner = by_priority
                .get(files, claim.priority())
                .map(|f| f.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            errors.report(anyhow!(
                "duplicate symbol: {}: defined in both {obj} and {owner}",
                symbol_db.name(id)
            ));
        }
    });

    errors.checkpoint()
}

fn section_index_of(symbol: &crate::elf::SymtabEntry) -> Option<usize> {
    let shndx = symbol.st_shndx(LittleEndian);
    if shndx == object::elf::SHN_UNDEF
        || shndx >= object::elf::SHN_LORESERVE
    {
        None
    } else {
        Some(usize::from(shndx))
    }
}
