//! Open-addressing table: one slot per unique key, linear probing.
//!
//! The slot array is sized once from the build-side cardinality and never
//! resized; an overfull table degrades to long scans rather than
//! reallocating mid-build. Duplicate keys share a slot and hang off its
//! duplicate chain.
//!
//! Probing supports split hash computation plus an explicit prefetch hint,
//! so a driver can software-pipeline lookups: hash the key several rows
//! ahead, prefetch its home slot, and probe with the hash computed earlier,
//! hiding the cache miss behind the rows in between.

use std::marker::PhantomData;

use crate::alloc::Buffer;
use crate::table::{
    ChainIter, FibHash, JoinIndex, KeyHash, Link, RowSet, bucket_count_for, prefetch_read,
};

/// A slot is vacant while `head` is unlinked; `key` is only meaningful once
/// a row has been claimed into the slot.
#[derive(Copy, Clone)]
struct Slot {
    key: u64,
    head: Link,
}

pub struct LinearProbeTable<'r, const P: usize, H: KeyHash = FibHash> {
    rows: &'r RowSet<P>,
    slots: Buffer<Slot>,
    next: Buffer<Link>,
    mask: u64,
    occupied: usize,
    collisions: usize,
    _hash: PhantomData<H>,
}

impl<'r, const P: usize> LinearProbeTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> LinearProbeTable<'r, P, H> {
    /// Builds with an explicit slot count. The count must be a power of two
    /// and leave at least one slot vacant, or probes for absent keys could
    /// not terminate.
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two());
        let mask = (bucket_count - 1) as u64;
        // All-zero slots and links are the fully vacant state.
        let mut slots = unsafe { Buffer::<Slot>::zeroed(bucket_count) };
        let mut next = unsafe { Buffer::<Link>::zeroed(rows.len()) };

        let mut occupied = 0;
        let mut collisions = 0;
        for (i, row) in rows.iter().enumerate() {
            let mut pos = (H::hash(row.key) & mask) as usize;
            loop {
                let slot = &mut slots[pos];
                match slot.head.get() {
                    None => {
                        assert!(
                            occupied + 1 < bucket_count,
                            "linear-probe table built past capacity"
                        );
                        slot.key = row.key;
                        slot.head = Link::to(i as u32);
                        occupied += 1;
                        break;
                    }
                    Some(head) if slot.key == row.key => {
                        // Splice after the chain head; the head row stays
                        // the slot's representative.
                        next[i] = next[head as usize];
                        next[head as usize] = Link::to(i as u32);
                        break;
                    }
                    Some(_) => {
                        collisions += 1;
                        pos = (pos + 1) & mask as usize;
                    }
                }
            }
        }

        Self {
            rows,
            slots,
            next,
            mask,
            occupied,
            collisions,
            _hash: PhantomData,
        }
    }

    /// Hash of a key under this table's hash function, for drivers that
    /// precompute hashes ahead of the probe loop.
    #[inline(always)]
    pub fn hash_key(&self, key: u64) -> u64 {
        H::hash(key)
    }

    /// Hints the cache to load the home slot of a precomputed hash. Purely
    /// a performance hint; has no observable effect on results.
    #[inline(always)]
    pub fn prefetch(&self, hash: u64) {
        let pos = (hash & self.mask) as usize;
        prefetch_read(&raw const self.slots[pos]);
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> ChainIter<'t, 'r, P> {
        self.probe_hashed(key, H::hash(key))
    }

    /// Probe with a hash computed earlier (it must be `hash_key(key)`).
    #[inline]
    pub fn probe_hashed<'t>(&'t self, key: u64, hash: u64) -> ChainIter<'t, 'r, P> {
        let mut pos = (hash & self.mask) as usize;
        loop {
            let slot = self.slots[pos];
            match slot.head.get() {
                None => return ChainIter::empty(self.rows, &self.next),
                Some(_) if slot.key == key => {
                    return ChainIter::new(self.rows, &self.next, slot.head);
                }
                Some(_) => pos = (pos + 1) & self.mask as usize,
            }
        }
    }

    /// Slots claimed by unique keys.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Occupied slots stepped over during build.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes of allocator-backed storage.
    pub fn buf_size(&self) -> usize {
        self.slots.byte_len() + self.next.byte_len()
    }
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for LinearProbeTable<'r, P, H> {
    type Matches<'t>
        = ChainIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        LinearProbeTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}
