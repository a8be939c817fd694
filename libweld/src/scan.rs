//! Relocation scanning. Each object scans its relocations in parallel,
//! atomically ORing into each target symbol's needs-flags the bits describing
//! what dynamic-linking tables the target requires. Undefined references are
//! diagnosed here too; weak ones resolve to zero and are fine.

use crate::arch::Arch;
use crate::arch::RelocClass;
use crate::error::ErrorSink;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::parsing::ParsedInput;
use crate::resolution::FilesByPriority;
use crate::symbol_db::NeedsFlags;
use crate::symbol_db::SymbolDb;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::Rela as _;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations<'data, A: Arch>(
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    errors: &ErrorSink,
) -> Result {
    files.par_iter().for_each(|file| {
        let ParsedInput::Object(obj) = file else {
            return;
        };
        if let Err(error) = scan_object::<A>(obj, files, by_priority, symbol_db, errors) {
            errors.report(error.context(format!("Failed to scan relocations in {obj}")));
        }
    });
    errors.checkpoint()
}

fn scan_object<'data, A: Arch>(
    obj: &ObjectFile<'data>,
    files: &[ParsedInput<'data>],
    by_priority: &FilesByPriority,
    symbol_db: &SymbolDb<'data>,
    errors: &ErrorSink,
) -> Result {
    let e = LittleEndian;
    for slot in &obj.sections {
        let SectionSlot::Loaded(section) = slot else {
            continue;
        };
        for rela in obj.object.relocations(section.index)? {
            let r_type = rela.r_type(e, false);
            let class = A::classify_relocation(r_type)?;
            if class == RelocClass::None {
                continue;
            }

            let symbol_index = object::SymbolIndex(rela.r_sym(e, false) as usize);
            if symbol_index.0 < obj.object.first_global {
                // Local targets resolve within this object; any GOT-forming
                // references to them are relaxed by the relocation kernels.
                continue;
            }
            let local_symbol = obj.object.symbol(symbol_index)?;
            let id = obj.symbol_id(symbol_index);
            let symbol = symbol_db.symbol(id);
            let claim = symbol.claim();

            if claim.is_none() {
                if !local_symbol.is_weak() {
                    errors.report(anyhow!(
                        "undefined symbol: {}: referenced by {}",
                        symbol_db.name(id),
                        obj
                    ));
                }
                continue;
            }

            let flags = needed_tables(class, symbol.is_imported, || {
                imported_symbol_is_function(files, by_priority, claim)
            })?;
            if !flags.is_empty() {
                symbol.add_flags(flags);
            }
        }
    }
    Ok(())
}

/// Decides what tables a reference requires given the relocation class and
/// whether the target lives in a shared object.
fn needed_tables(
    class: RelocClass,
    is_imported: bool,
    target_is_function: impl FnOnce() -> Result<bool>,
) -> Result<NeedsFlags> {
    let flags = match class {
        RelocClass::Absolute | RelocClass::Relative => {
            if is_imported {
                if target_is_function()? {
                    // Direct references to an imported function get a
                    // canonical PLT entry whose address stands in for the
                    // function.
                    NeedsFlags::PLT | NeedsFlags::DYNSYM
                } else {
                    NeedsFlags::COPYREL | NeedsFlags::DYNSYM
                }
            } else {
                NeedsFlags::empty()
            }
        }
        RelocClass::Got => {
            if is_imported {
                NeedsFlags::GOT | NeedsFlags::DYNSYM
            } else {
                NeedsFlags::GOT
            }
        }
        RelocClass::Plt => {
            if is_imported {
                NeedsFlags::PLT | NeedsFlags::DYNSYM
            } else {
                NeedsFlags::empty()
            }
        }
        RelocClass::GotTpOff => {
            if is_imported {
                NeedsFlags::GOTTPOFF | NeedsFlags::DYNSYM
            } else {
                NeedsFlags::GOTTPOFF
            }
        }
        RelocClass::TlsGd => {
            if is_imported {
                NeedsFlags::TLSGD | NeedsFlags::DYNSYM
            } else {
                NeedsFlags::TLSGD
            }
        }
        RelocClass::TlsLd => NeedsFlags::TLSLD,
        RelocClass::TpOff | RelocClass::DtpOff | RelocClass::None => NeedsFlags::empty(),
    };
    Ok(flags)
}

fn imported_symbol_is_function(
    files: &[ParsedInput],
    by_priority: &FilesByPriority,
    claim: crate::symbol_db::Claim,
) -> Result<bool> {
    let ParsedInput::Shared(dso) = by_priority.get(files, claim.priority())? else {
        return Ok(false);
    };
    let symbol = dso
        .object
        .symbol(object::SymbolIndex(claim.sym_index() as usize))?;
    Ok(matches!(
        symbol.st_type(),
        object::elf::STT_FUNC | object::elf::STT_GNU_IFUNC
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_then_allocate_flags() {
        // A GOT-forming reference to a local definition needs a GOT slot but
        // no dynamic symbol.
        let flags = needed_tables(RelocClass::Got, false, || Ok(false)).unwrap();
        assert_eq!(flags, NeedsFlags::GOT);

        // A call to an imported function needs a PLT stub and dynsym
        // visibility.
        let flags = needed_tables(RelocClass::Plt, true, || Ok(true)).unwrap();
        assert_eq!(flags, NeedsFlags::PLT | NeedsFlags::DYNSYM);

        // A data reference to an imported object gets copy-relocated.
        let flags = needed_tables(RelocClass::Absolute, true, || Ok(false)).unwrap();
        assert_eq!(flags, NeedsFlags::COPYREL | NeedsFlags::DYNSYM);

        // A direct call to a local definition needs nothing.
        let flags = needed_tables(RelocClass::Plt, false, || Ok(false)).unwrap();
        assert!(flags.is_empty());
    }
}
