//! The global symbol store. Every distinct global name across the whole link
//! gets exactly one `Symbol`. Files refer to symbols by interned ID only,
//! which is what breaks ownership cycles between input files.
//!
//! During parallel phases the only mutations are the resolver's
//! compare-and-swap on each symbol's claim and the relocation scanner's
//! atomic OR on its needs-flags. Everything else on `Symbol` is written from
//! single-threaded phases via `&mut`.

use crate::args::Args;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::symbol::SymbolName;
use bitflags::bitflags;
use itertools::Itertools as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// An index into the symbol store. IDs are deterministic for a given set of
/// inputs: they're assigned bucket-by-bucket with files visited in priority
/// order within each bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn from_usize(v: usize) -> Self {
        Self(v as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// A sentinel for slots that don't correspond to an interned symbol
    /// (e.g. undefined entries in a DSO's symbol table).
    pub(crate) const fn placeholder() -> Self {
        Self(u32::MAX)
    }
}

bitflags! {
    /// What dynamic-linking tables a symbol's referents need it to have.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub(crate) struct NeedsFlags: u8 {
        const GOT = 1 << 0;
        const PLT = 1 << 1;
        const GOTTPOFF = 1 << 2;
        const TLSGD = 1 << 3;
        const TLSLD = 1 << 4;
        const COPYREL = 1 << 5;
        const DYNSYM = 1 << 6;
    }
}

/// How strongly a file defines a symbol. The discriminant is the high part of
/// the packed claim, so a lower rank always beats a higher one and a lazy
/// definition (an archive member or as-needed DSO that isn't yet part of the
/// link) loses to any live definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ClaimRank {
    Strong = 0,
    Weak = 1,
    Common = 2,
    Lazy = 3,
}

/// A packed (rank, file priority, symbol index) triple. Numerically smaller
/// claims win; priorities are unique so ties are impossible.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim(u64);

const CLAIM_PRIORITY_BITS: u32 = 30;
const CLAIM_NONE: u64 = u64::MAX;

impl Claim {
    pub(crate) fn new(rank: ClaimRank, priority: u32, sym_index: u32) -> Claim {
        debug_assert!(priority < (1 << CLAIM_PRIORITY_BITS));
        Claim(
            ((rank as u64) << (CLAIM_PRIORITY_BITS + 32))
                | (u64::from(priority) << 32)
                | u64::from(sym_index),
        )
    }

    pub(crate) fn is_none(self) -> bool {
        self.0 == CLAIM_NONE
    }

    pub(crate) fn rank(self) -> ClaimRank {
        match self.0 >> (CLAIM_PRIORITY_BITS + 32) {
            0 => ClaimRank::Strong,
            1 => ClaimRank::Weak,
            2 => ClaimRank::Common,
            _ => ClaimRank::Lazy,
        }
    }

    pub(crate) fn priority(self) -> u32 {
        ((self.0 >> 32) & ((1 << CLAIM_PRIORITY_BITS) - 1)) as u32
    }

    /// The index of the defining symbol within the owning file's symbol
    /// table.
    pub(crate) fn sym_index(self) -> u32 {
        self.0 as u32
    }

    fn beats(self, other: Claim) -> bool {
        self.0 < other.0
    }
}

/// Per-symbol state. See the module comment for which fields may be touched
/// from parallel phases.
pub(crate) struct Symbol {
    claim: AtomicU64,
    flags: AtomicU8,

    /// Version ordinal: 0 = local, 1 = global, >= 2 indexes a named version
    /// of the owning DSO (or of our own version script when producing a DSO).
    pub(crate) ver_idx: u16,

    pub(crate) is_imported: bool,
    pub(crate) has_copyrel: bool,
    pub(crate) traced: bool,

    /// An absolute value for symbols that don't live in any section: linker
    /// synthesized symbols and copy-relocated data.
    pub(crate) value: u64,

    /// Indices assigned during dynamic-table allocation. Zero means
    /// unassigned. `dynsym_idx` is a real table index (entry 0 is the null
    /// symbol); the GOT and PLT indices are stored plus one so that zero can
    /// mean unassigned.
    pub(crate) dynsym_idx: u32,
    pub(crate) got_idx: u32,
    pub(crate) plt_idx: u32,
    pub(crate) gottpoff_idx: u32,
    pub(crate) tlsgd_idx: u32,
    pub(crate) copyrel_offset: u64,
}

impl Symbol {
    fn new() -> Self {
        Self {
            claim: AtomicU64::new(CLAIM_NONE),
            flags: AtomicU8::new(0),
            ver_idx: object::elf::VER_NDX_GLOBAL,
            is_imported: false,
            has_copyrel: false,
            traced: false,
            value: 0,
            dynsym_idx: 0,
            got_idx: 0,
            plt_idx: 0,
            gottpoff_idx: 0,
            tlsgd_idx: 0,
            copyrel_offset: 0,
        }
    }

    pub(crate) fn claim(&self) -> Claim {
        Claim(self.claim.load(Ordering::Acquire))
    }

    pub(crate) fn flags(&self) -> NeedsFlags {
        NeedsFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn add_flags(&self, flags: NeedsFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }
}

pub(crate) struct SymbolDb<'data> {
    buckets: Vec<PassThroughHashMap<SymbolName<'data>, u32>>,
    bucket_bases: Vec<u32>,
    names: Vec<PreHashed<SymbolName<'data>>>,
    symbols: Vec<Symbol>,
}

/// The global names of one input file, pre-bucketed by name hash so that the
/// store can be populated bucket-parallel.
pub(crate) struct PendingSymbols<'data> {
    pub(crate) by_bucket: Vec<Vec<PreHashed<SymbolName<'data>>>>,
}

impl<'data> PendingSymbols<'data> {
    pub(crate) fn new(num_buckets: usize) -> Self {
        Self {
            by_bucket: vec![Vec::new(); num_buckets],
        }
    }

    pub(crate) fn add(&mut self, name: PreHashed<SymbolName<'data>>) {
        let bucket = name.hash() as usize % self.by_bucket.len();
        self.by_bucket[bucket].push(name);
    }
}

pub(crate) fn num_symbol_buckets(args: &Args) -> usize {
    (args.num_threads.get() * 4).next_power_of_two()
}

impl<'data> SymbolDb<'data> {
    /// Builds the store from the pre-bucketed global names of every input
    /// file. `per_file_pending` must be in file priority order; that is what
    /// makes ID assignment deterministic.
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub(crate) fn build(per_file_pending: &[PendingSymbols<'data>], args: &Args) -> Result<Self> {
        let num_buckets = num_symbol_buckets(args);
        let mut buckets: Vec<PassThroughHashMap<SymbolName, u32>> = Vec::new();
        buckets.resize_with(num_buckets, Default::default);
        let mut bucket_names: Vec<Vec<PreHashed<SymbolName>>> = vec![Vec::new(); num_buckets];

        buckets
            .par_iter_mut()
            .zip(bucket_names.par_iter_mut())
            .enumerate()
            .for_each(|(b, (bucket, names_out))| {
                let approx_num_symbols = per_file_pending
                    .iter()
                    .map(|p| p.by_bucket[b].len())
                    .sum();
                bucket.reserve(approx_num_symbols);
                for pending in per_file_pending {
                    for &name in &pending.by_bucket[b] {
                        bucket.entry(name).or_insert_with(|| {
                            let local = names_out.len() as u32;
                            names_out.push(name);
                            local
                        });
                    }
                }
            });

        let mut bucket_bases = Vec::with_capacity(num_buckets + 1);
        let mut total: u32 = 0;
        for names in &bucket_names {
            bucket_bases.push(total);
            total = total
                .checked_add(names.len() as u32)
                .ok_or_else(|| anyhow::anyhow!("Too many symbols"))?;
        }

        let names = bucket_names.into_iter().flatten().collect_vec();
        let mut symbols = Vec::new();
        symbols.resize_with(names.len(), Symbol::new);

        let mut db = Self {
            buckets,
            bucket_bases,
            names,
            symbols,
        };

        for name in &args.trace_symbols {
            if let Some(id) = db.lookup(SymbolName::prehashed(name.as_bytes())) {
                db.symbol_mut(id).traced = true;
            }
        }

        Ok(db)
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn lookup(&self, name: PreHashed<SymbolName<'data>>) -> Option<SymbolId> {
        let bucket = name.hash() as usize % self.buckets.len();
        self.buckets[bucket]
            .get(&name)
            .map(|&local| SymbolId(self.bucket_bases[bucket] + local))
    }

    pub(crate) fn name(&self, id: SymbolId) -> SymbolName<'data> {
        *self.names[id.as_usize()]
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_ids(&self) -> std::iter::Map<std::ops::Range<u32>, fn(u32) -> SymbolId> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    /// Offers a definition for `id`. Installs the claim if it beats the
    /// current winner. The loop terminates because claims only ever decrease
    /// and the priority total order is strict.
    pub(crate) fn offer_claim(&self, id: SymbolId, claim: Claim) {
        let symbol = self.symbol(id);
        let mut current = symbol.claim.load(Ordering::Relaxed);
        while claim.beats(Claim(current)) {
            match symbol.claim.compare_exchange_weak(
                current,
                claim.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if symbol.traced {
                        tracing::info!(
                            symbol = %self.name(id),
                            rank = ?claim.rank(),
                            priority = claim.priority(),
                            "claim installed"
                        );
                    }
                    return;
                }
                Err(new_current) => current = new_current,
            }
        }
        if symbol.traced {
            tracing::info!(
                symbol = %self.name(id),
                rank = ?claim.rank(),
                priority = claim.priority(),
                "claim lost"
            );
        }
    }

    /// Clears the claim on `id` if `predicate` rejects the owning priority.
    /// Used when pruning dead files.
    pub(crate) fn retain_claims(&mut self, predicate: impl Fn(u32) -> bool) {
        for symbol in &mut self.symbols {
            let claim = Claim(*symbol.claim.get_mut());
            if !claim.is_none() && !predicate(claim.priority()) {
                *symbol.claim.get_mut() = CLAIM_NONE;
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    fn test_args() -> Args {
        let crate::args::Action::Link(mut args) =
            crate::args::parse(["-o", "/dev/null"].iter()).unwrap()
        else {
            panic!("expected link action");
        };
        args.num_threads = NonZeroUsize::new(2).unwrap();
        args
    }

    fn build_db<'data>(names: &[&'data [u8]], args: &Args) -> SymbolDb<'data> {
        let mut pending = PendingSymbols::new(num_symbol_buckets(args));
        for name in names {
            pending.add(SymbolName::prehashed(name));
        }
        SymbolDb::build(std::slice::from_ref(&pending), args).unwrap()
    }

    #[test]
    fn interns_each_name_once() {
        let args = test_args();
        let db = build_db(&[b"foo", b"bar", b"foo"], &args);
        assert_eq!(db.num_symbols(), 2);
        let foo = db.lookup(SymbolName::prehashed(b"foo")).unwrap();
        let bar = db.lookup(SymbolName::prehashed(b"bar")).unwrap();
        assert_ne!(foo, bar);
        assert!(db.lookup(SymbolName::prehashed(b"baz")).is_none());
    }

    #[test]
    fn claim_precedence() {
        let args = test_args();
        let db = build_db(&[b"foo"], &args);
        let id = db.lookup(SymbolName::prehashed(b"foo")).unwrap();

        // A lazy definition claims an unclaimed symbol.
        db.offer_claim(id, Claim::new(ClaimRank::Lazy, 9, 1));
        assert_eq!(db.symbol(id).claim().priority(), 9);

        // Any live definition beats it, even a weak one from a later file.
        db.offer_claim(id, Claim::new(ClaimRank::Weak, 12, 2));
        assert_eq!(db.symbol(id).claim().rank(), ClaimRank::Weak);

        // A strong definition beats weak regardless of priority.
        db.offer_claim(id, Claim::new(ClaimRank::Strong, 30, 3));
        assert_eq!(db.symbol(id).claim().priority(), 30);

        // Among equal strength, the smaller priority wins.
        db.offer_claim(id, Claim::new(ClaimRank::Strong, 7, 4));
        assert_eq!(db.symbol(id).claim().priority(), 7);
        db.offer_claim(id, Claim::new(ClaimRank::Strong, 8, 5));
        assert_eq!(db.symbol(id).claim().priority(), 7);
    }

    #[test]
    fn atomic_flag_accumulation() {
        let args = test_args();
        let db = build_db(&[b"foo"], &args);
        let id = db.lookup(SymbolName::prehashed(b"foo")).unwrap();
        db.symbol(id).add_flags(NeedsFlags::GOT);
        db.symbol(id).add_flags(NeedsFlags::PLT | NeedsFlags::DYNSYM);
        assert_eq!(
            db.symbol(id).flags(),
            NeedsFlags::GOT | NeedsFlags::PLT | NeedsFlags::DYNSYM
        );
    }

    #[test]
    fn pruning_reverts_owners() {
        let args = test_args();
        let mut db = build_db(&[b"foo"], &args);
        let id = db.lookup(SymbolName::prehashed(b"foo")).unwrap();
        db.offer_claim(id, Claim::new(ClaimRank::Strong, 5, 0));
        db.retain_claims(|priority| priority != 5);
        assert!(db.symbol(id).claim().is_none());
    }
}
