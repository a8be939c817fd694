//! Deduplication of mergeable string sections. Each mergeable input section
//! is split into null-terminated pieces. All pieces across all objects are
//! interned into a shared map whose values record which section currently
//! wins each distinct piece; objects install themselves lock-free while their
//! file has a lower priority than the current winner. After the fixed point,
//! winning sections assign their pieces monotonically increasing output
//! offsets and a final single-threaded pass gives each input section a start
//! offset within its parent merged section, which keeps the result
//! deterministic.

use crate::alignment::Alignment;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use anyhow::Context as _;
use anyhow::bail;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A string from a string-merge section, including the null terminator.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) struct MergeString<'data> {
    pub(crate) bytes: &'data [u8],
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Piece {
    pub(crate) input_offset: u32,
    pub(crate) len: u32,
    pub(crate) hash: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MergedSectionId(u32);

impl MergedSectionId {
    pub(crate) fn from_usize(v: usize) -> Self {
        Self(v as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn placeholder() -> Self {
        Self(u32::MAX)
    }
}

/// An output section holding deduplicated pieces. One exists per distinct
/// input section name among the mergeable inputs.
pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) alignment: Alignment,
    pub(crate) size: u64,
}

pub(crate) struct MergeableSection<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) alignment: Alignment,
    pub(crate) data: &'data [u8],
    pub(crate) pieces: Vec<Piece>,

    /// Total bytes of the pieces this section won. Computed during merging.
    pub(crate) size: u64,

    /// Start offset within the parent merged section.
    pub(crate) offset_in_merged: u64,

    pub(crate) merged_id: MergedSectionId,
}

impl<'data> MergeableSection<'data> {
    pub(crate) fn new(
        index: object::SectionIndex,
        name: &'data [u8],
        sh_flags: u64,
        sh_entsize: u64,
        alignment: Alignment,
        data: &'data [u8],
        pieces: Vec<Piece>,
    ) -> Self {
        Self {
            index,
            name,
            sh_flags,
            sh_entsize,
            alignment,
            data,
            pieces,
            size: 0,
            offset_in_merged: 0,
            merged_id: MergedSectionId::placeholder(),
        }
    }

    pub(crate) fn piece_bytes(&self, piece: &Piece) -> &'data [u8] {
        &self.data[piece.input_offset as usize..(piece.input_offset + piece.len) as usize]
    }
}

/// Splits section contents at null terminators. Each piece includes its
/// terminator.
pub(crate) fn split_into_pieces(data: &[u8]) -> Result<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let len = memchr::memchr(0, &data[offset..])
            .map(|i| i + 1)
            .context("not null-terminated")?;
        pieces.push(Piece {
            input_offset: offset as u32,
            len: len as u32,
            hash: hash_bytes(&data[offset..offset + len]),
        });
        offset += len;
    }
    Ok(pieces)
}

/// The winner record for one distinct piece value: the packed identity of the
/// lowest-priority section containing it, plus the output offset that winner
/// assigned.
pub(crate) struct PieceSlot {
    winner: AtomicU64,
    offset: AtomicU64,
}

const NO_WINNER: u64 = u64::MAX;
const NO_OFFSET: u64 = u64::MAX;

/// Identifies a mergeable section globally: the owning file's priority in the
/// high half (which is what the CAS loop compares) and the section's ordinal
/// within that file in the low half.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeSectionRef(u64);

impl MergeSectionRef {
    pub(crate) fn new(priority: u32, ordinal: u32) -> Self {
        Self((u64::from(priority) << 32) | u64::from(ordinal))
    }

    pub(crate) fn priority(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn ordinal(self) -> usize {
        self.0 as u32 as usize
    }
}

/// The shared piece-interning map, keyed by piece contents.
pub(crate) struct PieceMap<'data> {
    buckets: Vec<PassThroughHashMap<MergeString<'data>, u32>>,
    bucket_bases: Vec<u32>,
    slots: Vec<PieceSlot>,
}

impl<'data> PieceMap<'data> {
    /// Builds the map of distinct piece values. `sections_by_file` must be in
    /// file priority order.
    #[tracing::instrument(skip_all, name = "Build piece map")]
    pub(crate) fn build(
        sections_by_file: &[&[MergeableSection<'data>]],
        num_buckets: usize,
    ) -> PieceMap<'data> {
        let mut buckets: Vec<PassThroughHashMap<MergeString, u32>> = Vec::new();
        buckets.resize_with(num_buckets, Default::default);
        let mut bucket_sizes = vec![0u32; num_buckets];

        buckets
            .par_iter_mut()
            .zip(bucket_sizes.par_iter_mut())
            .enumerate()
            .for_each(|(b, (bucket, size_out))| {
                for sections in sections_by_file {
                    for section in *sections {
                        for piece in &section.pieces {
                            if piece.hash as usize % num_buckets != b {
                                continue;
                            }
                            let key =
                                PreHashed::new(MergeString { bytes: section.piece_bytes(piece) }, piece.hash);
                            let next = bucket.len() as u32;
                            bucket.entry(key).or_insert(next);
                        }
                    }
                }
                *size_out = bucket.len() as u32;
            });

        let mut bucket_bases = Vec::with_capacity(num_buckets);
        let mut total = 0u32;
        for size in &bucket_sizes {
            bucket_bases.push(total);
            total += size;
        }

        let mut slots = Vec::new();
        slots.resize_with(total as usize, || PieceSlot {
            winner: AtomicU64::new(NO_WINNER),
            offset: AtomicU64::new(NO_OFFSET),
        });

        PieceMap {
            buckets,
            bucket_bases,
            slots,
        }
    }

    fn slot(&self, section: &MergeableSection<'data>, piece: &Piece) -> &PieceSlot {
        let bucket = piece.hash as usize % self.buckets.len();
        let key = PreHashed::new(MergeString { bytes: section.piece_bytes(piece) }, piece.hash);
        let local = self.buckets[bucket]
            .get(&key)
            .expect("All pieces were interned during the build");
        &self.slots[(self.bucket_bases[bucket] + local) as usize]
    }

    /// How many distinct piece values the map holds.
    #[cfg(test)]
    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

/// Phase a: every section tries to install itself as the winner of each of
/// its pieces while its file has a lower priority than the current winner.
/// The monotone priority total-order guarantees the loop terminates.
pub(crate) fn install_piece_winners<'data>(
    priority: u32,
    sections: &[MergeableSection<'data>],
    map: &PieceMap<'data>,
) {
    for (ordinal, section) in sections.iter().enumerate() {
        let me = MergeSectionRef::new(priority, ordinal as u32);
        for piece in &section.pieces {
            let slot = map.slot(section, piece);
            let mut current = slot.winner.load(Ordering::Relaxed);
            while me.0 < current {
                match slot.winner.compare_exchange_weak(
                    current,
                    me.0,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(new_current) => current = new_current,
                }
            }
        }
    }
}

/// Phase b: each winning section walks its pieces assigning monotonically
/// increasing output offsets to those it won; its size becomes the total.
/// Each slot has exactly one winner, so the stores are disjoint.
pub(crate) fn assign_piece_offsets<'data>(
    priority: u32,
    sections: &mut [MergeableSection<'data>],
    map: &PieceMap<'data>,
) {
    for (ordinal, section) in sections.iter_mut().enumerate() {
        let me = MergeSectionRef::new(priority, ordinal as u32);
        let mut offset = 0u64;
        for piece in &section.pieces {
            let slot = map.slot(section, piece);
            if slot.winner.load(Ordering::Acquire) == me.0
                && slot.offset.load(Ordering::Relaxed) == NO_OFFSET
            {
                slot.offset.store(offset, Ordering::Release);
                offset += u64::from(piece.len);
            }
        }
        section.size = offset;
    }
}

/// Creates one `MergedSection` per distinct mergeable input section name and
/// points every mergeable section at its parent. Single-threaded; visits
/// files in their command-line order so numbering is deterministic.
#[tracing::instrument(skip_all, name = "Collect merged sections")]
pub(crate) fn collect_merged_sections<'data>(
    files: &mut [crate::parsing::ParsedInput<'data>],
) -> Vec<MergedSection<'data>> {
    let mut merged: Vec<MergedSection<'data>> = Vec::new();
    let mut by_name: PassThroughHashMap<crate::symbol::SymbolName<'data>, MergedSectionId> =
        Default::default();

    for file in files {
        let crate::parsing::ParsedInput::Object(obj) = file else {
            continue;
        };
        for section in &mut obj.mergeable_sections {
            let key = crate::symbol::SymbolName::prehashed(section.name);
            let id = *by_name.entry(key).or_insert_with(|| {
                let id = MergedSectionId::from_usize(merged.len());
                merged.push(MergedSection {
                    name: section.name,
                    sh_flags: section.sh_flags,
                    sh_entsize: section.sh_entsize,
                    alignment: section.alignment,
                    size: 0,
                });
                id
            });
            let parent = &mut merged[id.as_usize()];
            parent.alignment = parent.alignment.max(section.alignment);
            section.merged_id = id;
        }
    }
    merged
}

/// Runs the whole interning fixed point: builds the shared piece map, lets
/// every section install itself for the pieces it holds, has winners assign
/// output offsets and finally places each input section within its parent.
#[tracing::instrument(skip_all, name = "Merge strings")]
pub(crate) fn merge_strings<'data>(
    files: &mut [crate::parsing::ParsedInput<'data>],
    merged: &mut [MergedSection<'data>],
    num_buckets: usize,
) -> PieceMap<'data> {
    use rayon::iter::IntoParallelRefIterator as _;

    let map = {
        let sections_by_file: Vec<&[MergeableSection]> = files
            .iter()
            .filter_map(|file| match file {
                crate::parsing::ParsedInput::Object(obj) => {
                    Some(obj.mergeable_sections.as_slice())
                }
                _ => None,
            })
            .collect();
        PieceMap::build(&sections_by_file, num_buckets)
    };

    files.par_iter().for_each(|file| {
        if let crate::parsing::ParsedInput::Object(obj) = file {
            install_piece_winners(obj.priority, &obj.mergeable_sections, &map);
        }
    });

    files.par_iter_mut().for_each(|file| {
        if let crate::parsing::ParsedInput::Object(obj) = file {
            assign_piece_offsets(obj.priority, &mut obj.mergeable_sections, &map);
        }
    });

    assign_merged_offsets(
        files
            .iter_mut()
            .filter_map(|file| match file {
                crate::parsing::ParsedInput::Object(obj) => {
                    Some(obj.mergeable_sections.iter_mut())
                }
                _ => None,
            })
            .flatten(),
        merged,
    );

    map
}

/// Phase c: single-threaded so the result is deterministic. Visits sections
/// in file order, giving each a start offset within its parent merged
/// section and accumulating the merged section sizes.
pub(crate) fn assign_merged_offsets<'data, 'file>(
    sections_in_priority_order: impl Iterator<Item = &'file mut MergeableSection<'data>>,
    merged: &mut [MergedSection<'data>],
) where
    'data: 'file,
{
    for section in sections_in_priority_order {
        let parent = &mut merged[section.merged_id.as_usize()];
        parent.size = parent.alignment.align_up(parent.size);
        section.offset_in_merged = parent.size;
        parent.size += section.size;
    }
}

/// Looks up the output offset (within the parent merged section) of the piece
/// containing `input_offset`, resolving through the winning section.
pub(crate) fn piece_output_offset<'data>(
    section: &MergeableSection<'data>,
    input_offset: u64,
    map: &PieceMap<'data>,
    section_by_ref: impl Fn(MergeSectionRef) -> Result<(u64, u64)>,
) -> Result<u64> {
    let piece_index = match section
        .pieces
        .binary_search_by_key(&input_offset, |p| u64::from(p.input_offset))
    {
        Ok(i) => i,
        Err(0) => bail!("Offset 0x{input_offset:x} is before the first piece"),
        Err(i) => i - 1,
    };
    let piece = &section.pieces[piece_index];
    let offset_in_piece = input_offset - u64::from(piece.input_offset);
    if offset_in_piece >= u64::from(piece.len) {
        bail!("Offset 0x{input_offset:x} doesn't fall within any piece");
    }
    let slot = map.slot(section, piece);
    let winner = MergeSectionRef(slot.winner.load(Ordering::Acquire));
    let (winner_start, _winner_size) = section_by_ref(winner)?;
    let piece_offset = slot.offset.load(Ordering::Acquire);
    debug_assert_ne!(piece_offset, NO_OFFSET);
    Ok(winner_start + piece_offset + offset_in_piece)
}

/// Returns whether `section` is the winner of `piece`. Used by the invariant
/// checks and by the writer when copying piece bytes.
pub(crate) fn is_piece_winner<'data>(
    priority: u32,
    ordinal: u32,
    section: &MergeableSection<'data>,
    piece: &Piece,
    map: &PieceMap<'data>,
) -> bool {
    map.slot(section, piece).winner.load(Ordering::Acquire)
        == MergeSectionRef::new(priority, ordinal).0
}

/// The offset a winning section assigned to `piece`. Only meaningful for
/// pieces this section won.
pub(crate) fn winner_piece_offset<'data>(
    section: &MergeableSection<'data>,
    piece: &Piece,
    map: &PieceMap<'data>,
) -> u64 {
    map.slot(section, piece).offset.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;

    fn mergeable(data: &'static [u8]) -> MergeableSection<'static> {
        MergeableSection::new(
            object::SectionIndex(1),
            b".rodata.str1.1",
            0,
            1,
            alignment::MIN,
            data,
            split_into_pieces(data).unwrap(),
        )
    }

    #[test]
    fn test_split_into_pieces() {
        let pieces = split_into_pieces(b"hello\0world\0").unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].input_offset, 0);
        assert_eq!(pieces[0].len, 6);
        assert_eq!(pieces[1].input_offset, 6);
        assert_eq!(pieces[1].len, 6);
        assert!(split_into_pieces(b"unterminated").is_err());
    }

    #[test]
    fn merge_deduplicates_across_sections() {
        let mut a = [mergeable(b"hello\0world\0")];
        let mut b = [mergeable(b"world\0hello\0extra\0")];
        a[0].merged_id = MergedSectionId::from_usize(0);
        b[0].merged_id = MergedSectionId::from_usize(0);

        let map = PieceMap::build(&[&a, &b], 4);
        assert_eq!(map.num_slots(), 3);

        install_piece_winners(2, &a, &map);
        install_piece_winners(3, &b, &map);
        assign_piece_offsets(2, &mut a, &map);
        assign_piece_offsets(3, &mut b, &map);

        // The lower-priority file wins both shared strings; the other section
        // only keeps what's unique to it.
        assert_eq!(a[0].size, 12);
        assert_eq!(b[0].size, 6);

        // Exactly one section owns each distinct piece.
        for piece in &a[0].pieces {
            assert!(is_piece_winner(2, 0, &a[0], piece, &map));
        }
        let winners = b[0]
            .pieces
            .iter()
            .filter(|p| is_piece_winner(3, 0, &b[0], p, &map))
            .count();
        assert_eq!(winners, 1);

        let mut merged = vec![MergedSection {
            name: b".rodata.str1.1",
            sh_flags: 0,
            sh_entsize: 1,
            alignment: alignment::MIN,
            size: 0,
        }];
        assign_merged_offsets(a.iter_mut().chain(b.iter_mut()), &mut merged);
        assert_eq!(a[0].offset_in_merged, 0);
        assert_eq!(b[0].offset_in_merged, 12);
        assert_eq!(merged[0].size, 18);

        // A reference into the middle of a loser's string resolves to the
        // winner's copy. Input offset 7 in `b` is one byte into "hello\0",
        // which the winner placed at offset 0.
        let offset = piece_output_offset(&b[0], 7, &map, |r| {
            assert_eq!(r.priority(), 2);
            Ok((a[0].offset_in_merged, a[0].size))
        })
        .unwrap();
        assert_eq!(offset, 1);
    }
}
