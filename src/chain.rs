//! Separate chaining: a flat array of bucket heads, each the start of a
//! singly linked list of build rows.
//!
//! Build is O(1) per row (prepend to the bucket list), so rows sit in
//! reverse insertion order within a bucket. Rows with different keys share
//! a list, which means a probe walks to the end of the list even after a
//! hit: duplicates of the probed key may appear anywhere.
//!
//! [`FingerprintTable`] bolts a per-bucket filter onto the same layout:
//! each bucket accumulates the bitwise OR of every full hash inserted into
//! it, and a probe whose hash carries a bit the bucket has never seen skips
//! the list walk entirely. The filter can say "possibly present" for absent
//! keys, never "absent" for present ones.

use std::marker::PhantomData;

use crate::alloc::Buffer;
use crate::table::{
    BucketIter, FibHash, JoinIndex, KeyHash, Link, RowSet, bucket_count_for,
};

pub struct ChainedTable<'r, const P: usize, H: KeyHash = FibHash> {
    rows: &'r RowSet<P>,
    heads: Buffer<Link>,
    next: Buffer<Link>,
    mask: u64,
    _hash: PhantomData<H>,
}

impl<'r, const P: usize> ChainedTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> ChainedTable<'r, P, H> {
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two());
        let mask = (bucket_count - 1) as u64;
        let mut heads = unsafe { Buffer::<Link>::zeroed(bucket_count) };
        let mut next = unsafe { Buffer::<Link>::zeroed(rows.len()) };

        for (i, row) in rows.iter().enumerate() {
            let bucket = (H::hash(row.key) & mask) as usize;
            next[i] = heads[bucket];
            heads[bucket] = Link::to(i as u32);
        }

        Self {
            rows,
            heads,
            next,
            mask,
            _hash: PhantomData,
        }
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> BucketIter<'t, 'r, P> {
        let bucket = (H::hash(key) & self.mask) as usize;
        BucketIter::new(self.rows, &self.next, self.heads[bucket], key)
    }

    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Bytes of allocator-backed storage.
    pub fn buf_size(&self) -> usize {
        self.heads.byte_len() + self.next.byte_len()
    }

    /// Longest bucket list.
    pub fn max_chain_len(&self) -> usize {
        (0..self.heads.len())
            .map(|b| self.chain_len(b))
            .max()
            .unwrap_or(0)
    }

    /// Buckets with no rows at all.
    pub fn empty_buckets(&self) -> usize {
        self.heads.iter().filter(|h| h.is_none()).count()
    }

    fn chain_len(&self, bucket: usize) -> usize {
        let mut len = 0;
        let mut cur = self.heads[bucket];
        while let Some(row) = cur.get() {
            cur = self.next[row as usize];
            len += 1;
        }
        len
    }
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for ChainedTable<'r, P, H> {
    type Matches<'t>
        = BucketIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        ChainedTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Chained table with a per-bucket OR-of-hashes pre-filter.
pub struct FingerprintTable<'r, const P: usize, H: KeyHash = FibHash> {
    table: ChainedTable<'r, P, H>,
    fingerprints: Buffer<u64>,
}

impl<'r, const P: usize> FingerprintTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> FingerprintTable<'r, P, H> {
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        let table = ChainedTable::build_with_buckets(rows, bucket_count);
        let mut fingerprints = unsafe { Buffer::<u64>::zeroed(bucket_count) };
        for row in rows.iter() {
            let hash = H::hash(row.key);
            fingerprints[(hash & table.mask) as usize] |= hash;
        }
        Self {
            table,
            fingerprints,
        }
    }

    /// Filter check only: false means the key is definitely absent, true
    /// means the bucket list has to be walked. Useful on its own as a cheap
    /// semi-join reducer in front of the full probe.
    #[inline(always)]
    pub fn may_contain(&self, key: u64) -> bool {
        let hash = H::hash(key);
        let fp = self.fingerprints[(hash & self.table.mask) as usize];
        (hash | fp) == fp
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> BucketIter<'t, 'r, P> {
        let hash = H::hash(key);
        let bucket = (hash & self.table.mask) as usize;
        let fp = self.fingerprints[bucket];
        let head = if (hash | fp) == fp {
            self.table.heads[bucket]
        } else {
            // Some hash bit was never inserted here: the walk cannot match.
            Link::NONE
        };
        BucketIter::new(self.table.rows, &self.table.next, head, key)
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn buf_size(&self) -> usize {
        self.table.buf_size() + self.fingerprints.byte_len()
    }

    pub fn max_chain_len(&self) -> usize {
        self.table.max_chain_len()
    }
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for FingerprintTable<'r, P, H> {
    type Matches<'t>
        = BucketIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        FingerprintTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.table.rows.len()
    }
}
