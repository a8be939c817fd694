//! The state that accumulates across phases: output sections and their
//! binned members, merged string sections, synthetic table contents and the
//! final chunk list. One value of this is threaded through the whole link;
//! parallel phases borrow it immutably and go through the documented atomic
//! fields, everything else is mutated between phases.

use crate::args::Args;
use crate::chunks::Chunk;
use crate::chunks::SectionBin;
use crate::dynamic::DynamicData;
use crate::error::ErrorSink;
use crate::output_section::OutputSections;
use crate::string_merging::MergedSection;
use crate::string_merging::PieceMap;

pub(crate) struct Context<'data> {
    pub(crate) args: &'data Args,
    pub(crate) output_sections: OutputSections<'data>,

    /// Members and sizes of each output section, indexed by
    /// `OutputSectionId`. Populated by binning and offset assignment.
    pub(crate) bins: Vec<SectionBin>,

    pub(crate) merged: Vec<MergedSection<'data>>,
    pub(crate) piece_map: Option<PieceMap<'data>>,

    pub(crate) dynamic: DynamicData<'data>,

    /// All chunks of the output file in final order. Built during layout.
    pub(crate) chunks: Vec<Chunk<'data>>,

    pub(crate) errors: ErrorSink,
}

impl<'data> Context<'data> {
    pub(crate) fn new(args: &'data Args) -> Self {
        Self {
            args,
            output_sections: OutputSections::new(),
            bins: Vec::new(),
            merged: Vec::new(),
            piece_map: None,
            dynamic: DynamicData::new(),
            chunks: Vec::new(),
            errors: ErrorSink::new(),
        }
    }
}
