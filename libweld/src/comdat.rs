//! COMDAT group deduplication. Every object registers its group signatures
//! into a shared map recording the lowest-priority file offering each
//! signature; losers then mark their member sections as discarded so that
//! downstream passes simply skip them.

use crate::hash::PassThroughHashMap;
use crate::object_file::ObjectFile;
use crate::object_file::SectionSlot;
use crate::parsing::ParsedInput;
use crate::symbol::SymbolName;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

struct ComdatMap<'data> {
    buckets: Vec<PassThroughHashMap<SymbolName<'data>, u32>>,
    bucket_bases: Vec<u32>,
    winners: Vec<AtomicU32>,
}

impl<'data> ComdatMap<'data> {
    fn build(files: &[ParsedInput<'data>], num_buckets: usize) -> Self {
        let mut buckets: Vec<PassThroughHashMap<SymbolName, u32>> = Vec::new();
        buckets.resize_with(num_buckets, Default::default);
        let mut bucket_sizes = vec![0u32; num_buckets];

        buckets
            .par_iter_mut()
            .zip(bucket_sizes.par_iter_mut())
            .enumerate()
            .for_each(|(b, (bucket, size_out))| {
                for file in files {
                    let ParsedInput::Object(obj) = file else {
                        continue;
                    };
                    for group in &obj.comdat_groups {
                        if group.signature.hash() as usize % num_buckets != b {
                            continue;
                        }
                        let next = bucket.len() as u32;
                        bucket.entry(group.signature).or_insert(next);
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
        let mut winners = Vec::new();
        winners.resize_with(total as usize, || AtomicU32::new(u32::MAX));

        Self {
            buckets,
            bucket_bases,
            winners,
        }
    }

    fn winner_slot(&self, signature: &crate::hash::PreHashed<SymbolName<'data>>) -> &AtomicU32 {
        let bucket = signature.hash() as usize % self.buckets.len();
        let local = self.buckets[bucket]
            .get(signature)
            .expect("All signatures were interned during the build");
        &self.winners[(self.bucket_bases[bucket] + local) as usize]
    }
}

/// Deduplicates COMDAT groups across all loaded objects. After this, for
/// every signature exactly one member-section set survives, owned by the
/// minimum-priority offerer.
#[tracing::instrument(skip_all, name = "Eliminate duplicate COMDATs")]
pub(crate) fn eliminate_duplicate_comdats(files: &mut [ParsedInput], num_buckets: usize) {
    let map = ComdatMap::build(files, num_buckets);

    // Register: every group lowers its signature's winning priority.
    files.par_iter_mut().for_each(|file| {
        let ParsedInput::Object(obj) = file else {
            return;
        };
        for group in &obj.comdat_groups {
            map.winner_slot(&group.signature)
                .fetch_min(obj.priority, Ordering::AcqRel);
        }
    });

    // Eliminate: losers discard their member sections.
    files.par_iter_mut().for_each(|file| {
        let ParsedInput::Object(obj) = file else {
            return;
        };
        eliminate_for_object(obj, &map);
    });
}

fn eliminate_for_object<'data>(obj: &mut ObjectFile<'data>, map: &ComdatMap<'data>) {
    for group_index in 0..obj.comdat_groups.len() {
        let signature = obj.comdat_groups[group_index].signature;
        if map.winner_slot(&signature).load(Ordering::Acquire) == obj.priority {
            continue;
        }
        let members = obj.comdat_groups[group_index].members.clone();
        for member in members {
            if let Some(slot) = obj.sections.get_mut(member as usize) {
                *slot = SectionSlot::Discard;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_min_keeps_lowest_priority() {
        let winner = AtomicU32::new(u32::MAX);
        winner.fetch_min(7, Ordering::AcqRel);
        winner.fetch_min(3, Ordering::AcqRel);
        winner.fetch_min(9, Ordering::AcqRel);
        assert_eq!(winner.load(Ordering::Acquire), 3);
    }
}
