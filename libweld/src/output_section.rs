//! Identity and properties of output sections. Built-in sections cover the
//! common input section names; anything else gets a custom output section
//! with the input section's own name.

use crate::alignment;
use crate::alignment::Alignment;
use crate::hash::PassThroughHashMap;
use crate::symbol::SymbolName;
use object::elf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OutputSectionId(u32);

impl OutputSectionId {
    pub(crate) fn from_usize(v: usize) -> Self {
        Self(v as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// A sentinel for sections that haven't been assigned yet.
    pub(crate) const fn placeholder() -> Self {
        Self(u32::MAX)
    }
}

pub(crate) struct SectionDetails<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) min_alignment: Alignment,
}

const SHF_AW: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE) as u64;
const SHF_AX: u64 = (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u64;
const SHF_A: u64 = elf::SHF_ALLOC as u64;
const SHF_AWT: u64 = SHF_AW | elf::SHF_TLS as u64;

macro_rules! built_in {
    ($name:literal, $type:expr, $flags:expr, $entsize:expr, $align:expr) => {
        SectionDetails {
            name: $name,
            sh_type: $type,
            sh_flags: $flags,
            sh_entsize: $entsize,
            min_alignment: Alignment { exponent: $align },
        }
    };
}

/// Built-in output sections. The constants below index this table, so the
/// order here must match them.
const BUILT_IN: &[SectionDetails<'static>] = &[
    built_in!(b".text", elf::SHT_PROGBITS, SHF_AX, 0, 4),
    built_in!(b".rodata", elf::SHT_PROGBITS, SHF_A, 0, 0),
    built_in!(b".init_array", elf::SHT_INIT_ARRAY, SHF_AW, 8, 3),
    built_in!(b".fini_array", elf::SHT_FINI_ARRAY, SHF_AW, 8, 3),
    built_in!(b".data.rel.ro", elf::SHT_PROGBITS, SHF_AW, 0, 3),
    built_in!(b".data", elf::SHT_PROGBITS, SHF_AW, 0, 0),
    built_in!(b".bss", elf::SHT_NOBITS, SHF_AW, 0, 0),
    built_in!(b".tdata", elf::SHT_PROGBITS, SHF_AWT, 0, 3),
    built_in!(b".tbss", elf::SHT_NOBITS, SHF_AWT, 0, 3),
    built_in!(b".eh_frame", elf::SHT_PROGBITS, SHF_A, 0, 3),
    built_in!(b".gcc_except_table", elf::SHT_PROGBITS, SHF_A, 0, 0),
    built_in!(b".comment", elf::SHT_PROGBITS, (elf::SHF_MERGE | elf::SHF_STRINGS) as u64, 1, 0),
];

pub(crate) const TEXT: OutputSectionId = OutputSectionId(0);
pub(crate) const RODATA: OutputSectionId = OutputSectionId(1);
pub(crate) const INIT_ARRAY: OutputSectionId = OutputSectionId(2);
pub(crate) const FINI_ARRAY: OutputSectionId = OutputSectionId(3);
pub(crate) const DATA_REL_RO: OutputSectionId = OutputSectionId(4);
pub(crate) const DATA: OutputSectionId = OutputSectionId(5);
pub(crate) const BSS: OutputSectionId = OutputSectionId(6);
pub(crate) const TDATA: OutputSectionId = OutputSectionId(7);
pub(crate) const TBSS: OutputSectionId = OutputSectionId(8);
pub(crate) const EH_FRAME: OutputSectionId = OutputSectionId(9);
pub(crate) const GCC_EXCEPT_TABLE: OutputSectionId = OutputSectionId(10);
pub(crate) const COMMENT: OutputSectionId = OutputSectionId(11);

pub(crate) const NUM_BUILT_IN_SECTIONS: usize = BUILT_IN.len();

/// Input section names that collapse onto a built-in output section when the
/// name is either exactly the prefix or continues with a `.`.
const NAME_MAPPINGS: &[(&[u8], OutputSectionId)] = &[
    (b".text", TEXT),
    (b".rodata", RODATA),
    (b".init_array", INIT_ARRAY),
    (b".fini_array", FINI_ARRAY),
    (b".ctors", INIT_ARRAY),
    (b".dtors", FINI_ARRAY),
    (b".data.rel.ro", DATA_REL_RO),
    (b".data", DATA),
    (b".bss", BSS),
    (b".tdata", TDATA),
    (b".tbss", TBSS),
    (b".eh_frame", EH_FRAME),
    (b".gcc_except_table", GCC_EXCEPT_TABLE),
    (b".comment", COMMENT),
];

pub(crate) struct OutputSections<'data> {
    details: Vec<SectionDetails<'data>>,
    custom_by_name: PassThroughHashMap<SymbolName<'data>, OutputSectionId>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn new() -> Self {
        Self {
            details: BUILT_IN
                .iter()
                .map(|d| SectionDetails {
                    name: d.name,
                    sh_type: d.sh_type,
                    sh_flags: d.sh_flags,
                    sh_entsize: d.sh_entsize,
                    min_alignment: d.min_alignment,
                })
                .collect(),
            custom_by_name: Default::default(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.details.len()
    }

    pub(crate) fn details(&self, id: OutputSectionId) -> &SectionDetails<'data> {
        &self.details[id.as_usize()]
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OutputSectionId> {
        (0..self.details.len()).map(OutputSectionId::from_usize)
    }

    /// Returns the output section for an input section with the supplied name
    /// and properties, creating a custom output section if the name doesn't
    /// map to a built-in one.
    pub(crate) fn id_for_input(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
        sh_entsize: u64,
    ) -> OutputSectionId {
        for (prefix, id) in NAME_MAPPINGS {
            if let Some(rest) = name.strip_prefix(*prefix) {
                if rest.is_empty() || rest.first() == Some(&b'.') {
                    return *id;
                }
            }
        }
        let key = SymbolName::prehashed(name);
        if let Some(id) = self.custom_by_name.get(&key) {
            return *id;
        }
        let id = OutputSectionId::from_usize(self.details.len());
        self.details.push(SectionDetails {
            name,
            // Retain the input's type and flags, minus the flags that don't
            // make sense on an aggregated section.
            sh_type,
            sh_flags: sh_flags & !((elf::SHF_GROUP | elf::SHF_COMPRESSED) as u64),
            sh_entsize,
            min_alignment: alignment::MIN,
        });
        self.custom_by_name.insert(key, id);
        id
    }

    pub(crate) fn custom_name_to_id(&self, name: &[u8]) -> Option<OutputSectionId> {
        let key = SymbolName::prehashed(name);
        self.custom_by_name.get(&key).copied()
    }
}

/// Returns whether a section name is usable as a C identifier, which is what
/// decides whether `__start_<name>` / `__stop_<name>` symbols are defined for
/// it.
pub(crate) fn is_c_identifier(name: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }
    let start_ok = |b: u8| b.is_ascii_alphabetic() || b == b'_';
    start_ok(name[0]) && name[1..].iter().all(|&b| start_ok(b) || b.is_ascii_digit())
}

/// The 6-bit sort key that produces the canonical executable layout:
/// alloc read-only data, alloc code, alloc TLS data, alloc TLS bss, alloc
/// read-write data, alloc bss, then non-alloc.
pub(crate) fn section_rank(sh_flags: u64, sh_type: u32) -> u32 {
    let alloc = sh_flags & SHF_A != 0;
    let writable = sh_flags & elf::SHF_WRITE as u64 != 0;
    let exec = sh_flags & elf::SHF_EXECINSTR as u64 != 0;
    let tls = sh_flags & elf::SHF_TLS as u64 != 0;
    let nobits = sh_type == elf::SHT_NOBITS;
    (u32::from(!alloc) << 5)
        | (u32::from(writable) << 4)
        | (u32::from(exec) << 3)
        | (u32::from(!tls) << 2)
        | u32::from(nobits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_input_names_to_built_ins() {
        let mut sections = OutputSections::new();
        assert_eq!(sections.id_for_input(b".text", 0, 0, 0), TEXT);
        assert_eq!(sections.id_for_input(b".text.foo", 0, 0, 0), TEXT);
        assert_eq!(sections.id_for_input(b".data.rel.ro.bar", 0, 0, 0), DATA_REL_RO);
        assert_eq!(sections.id_for_input(b".data.x", 0, 0, 0), DATA);
        // `.textfoo` is not `.text` followed by a dot, so it gets its own
        // output section.
        let custom = sections.id_for_input(b".textfoo", 0, 0, 0);
        assert!(custom.as_usize() >= NUM_BUILT_IN_SECTIONS);
        assert_eq!(sections.id_for_input(b".textfoo", 0, 0, 0), custom);
        assert_eq!(sections.custom_name_to_id(b".textfoo"), Some(custom));
    }

    #[test]
    fn rank_produces_canonical_order() {
        let rodata = section_rank(SHF_A, elf::SHT_PROGBITS);
        let text = section_rank(SHF_AX, elf::SHT_PROGBITS);
        let tdata = section_rank(SHF_AWT, elf::SHT_PROGBITS);
        let tbss = section_rank(SHF_AWT, elf::SHT_NOBITS);
        let data = section_rank(SHF_AW, elf::SHT_PROGBITS);
        let bss = section_rank(SHF_AW, elf::SHT_NOBITS);
        let comment = section_rank(0, elf::SHT_PROGBITS);
        let mut ranks = [comment, bss, data, tbss, tdata, text, rodata];
        ranks.sort();
        assert_eq!(ranks, [rodata, text, tdata, tbss, data, bss, comment]);
    }

    #[test]
    fn test_is_c_identifier() {
        assert!(is_c_identifier(b"my_section"));
        assert!(is_c_identifier(b"_section9"));
        assert!(!is_c_identifier(b".text"));
        assert!(!is_c_identifier(b"9section"));
        assert!(!is_c_identifier(b""));
    }
}
