//! Chained table that reorganizes hot buckets on the fly.
//!
//! Every bucket starts out as a linked list, exactly like the plain chained
//! layout. Short lists stay lists: converting a two-row bucket buys
//! nothing. A bucket with [`FLAT_MIN_ROWS`] or more rows counts the probes
//! that land in it, and on the [`FLAT_AFTER_HITS`]th probe it converts
//! once: the list is walked a final time, its `(key, row)` pairs are copied
//! into a span claimed from a bump arena, and the bucket flips to flat
//! form. Later probes scan the span without touching a single list link.
//!
//! The flip is one-way and preserves every row that was reachable before
//! it; probe results are identical in either form. This is the only table
//! here that mutates behind a shared reference, and all of that mutation is
//! confined to `Cell`s: the hit counters, the per-bucket form tag, and the
//! arena cursor. The arena is sized at build time to hold every row, so a
//! conversion never reallocates and never moves pairs already handed out.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::alloc::Buffer;
use crate::table::{
    BucketIter, BuildRow, FibHash, JoinIndex, KeyHash, Link, RowSet, bucket_count_for,
};

/// Buckets with fewer rows than this always stay in list form.
const FLAT_MIN_ROWS: u32 = 3;
/// Probes into a long bucket before it converts to flat form.
const FLAT_AFTER_HITS: u8 = 3;

#[derive(Copy, Clone)]
struct Pair {
    key: u64,
    row: u32,
}

pub struct AdaptiveChainTable<'r, const P: usize, H: KeyHash = FibHash> {
    rows: &'r RowSet<P>,
    heads: Buffer<Link>,
    lens: Buffer<u32>,
    next: Buffer<Link>,
    /// Probes seen by a still-listed long bucket.
    hits: Buffer<Cell<u8>>,
    /// 0 while the bucket is a list; arena start + 1 once flat.
    flat: Buffer<Cell<u32>>,
    /// Bump arena of converted `(key, row)` pairs.
    pairs: Buffer<Cell<Pair>>,
    cursor: Cell<u32>,
    mask: u64,
    _hash: PhantomData<H>,
}

impl<'r, const P: usize> AdaptiveChainTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> AdaptiveChainTable<'r, P, H> {
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two());
        let mask = (bucket_count - 1) as u64;
        let mut heads = unsafe { Buffer::<Link>::zeroed(bucket_count) };
        let mut lens = unsafe { Buffer::<u32>::zeroed(bucket_count) };
        let mut next = unsafe { Buffer::<Link>::zeroed(rows.len()) };

        for (i, row) in rows.iter().enumerate() {
            let bucket = (H::hash(row.key) & mask) as usize;
            next[i] = heads[bucket];
            heads[bucket] = Link::to(i as u32);
            lens[bucket] += 1;
        }

        Self {
            rows,
            heads,
            lens,
            next,
            hits: unsafe { Buffer::zeroed(bucket_count) },
            flat: unsafe { Buffer::zeroed(bucket_count) },
            // Worst case every bucket converts, so every row gets a pair.
            pairs: unsafe { Buffer::zeroed(rows.len()) },
            cursor: Cell::new(0),
            mask,
            _hash: PhantomData,
        }
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> AdaptiveIter<'t, 'r, P> {
        let bucket = (H::hash(key) & self.mask) as usize;
        let len = self.lens[bucket];
        if len >= FLAT_MIN_ROWS {
            let flat = self.flat[bucket].get();
            if flat != 0 {
                return self.flat_iter(flat as usize - 1, len as usize, key);
            }
            let hits = self.hits[bucket].get() + 1;
            if hits >= FLAT_AFTER_HITS {
                let start = self.convert(bucket, len as usize);
                return self.flat_iter(start, len as usize, key);
            }
            self.hits[bucket].set(hits);
        }
        AdaptiveIter::List(BucketIter::new(
            self.rows,
            &self.next,
            self.heads[bucket],
            key,
        ))
    }

    /// One-way list-to-flat conversion; returns the bucket's arena start.
    fn convert(&self, bucket: usize, len: usize) -> usize {
        let start = self.cursor.get() as usize;
        debug_assert!(start + len <= self.pairs.len());
        let mut cur = self.heads[bucket];
        let mut at = start;
        while let Some(row) = cur.get() {
            self.pairs[at].set(Pair {
                key: self.rows.get(row).key,
                row,
            });
            cur = self.next[row as usize];
            at += 1;
        }
        debug_assert_eq!(at, start + len);
        self.cursor.set(at as u32);
        self.flat[bucket].set(start as u32 + 1);
        start
    }

    fn flat_iter<'t>(&'t self, start: usize, len: usize, key: u64) -> AdaptiveIter<'t, 'r, P> {
        AdaptiveIter::Flat(FlatIter {
            rows: self.rows,
            pairs: &self.pairs[start..start + len],
            at: 0,
            key,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Rows in bucket `b`.
    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.lens[bucket] as usize
    }

    /// Whether bucket `b` has converted to flat form.
    pub fn bucket_is_flat(&self, bucket: usize) -> bool {
        self.flat[bucket].get() != 0
    }

    /// Buckets converted so far.
    pub fn converted_buckets(&self) -> usize {
        self.flat.iter().filter(|f| f.get() != 0).count()
    }

    /// Longest bucket list.
    pub fn max_chain_len(&self) -> usize {
        self.lens.iter().map(|&l| l as usize).max().unwrap_or(0)
    }

    /// Bytes of allocator-backed storage.
    pub fn buf_size(&self) -> usize {
        self.heads.byte_len()
            + self.lens.byte_len()
            + self.next.byte_len()
            + self.hits.byte_len()
            + self.flat.byte_len()
            + self.pairs.byte_len()
    }
}

/// Scans a converted bucket's pair span, yielding rows with matching keys.
pub struct FlatIter<'t, 'r, const P: usize> {
    rows: &'r RowSet<P>,
    pairs: &'t [Cell<Pair>],
    at: usize,
    key: u64,
}

impl<'t, 'r, const P: usize> Iterator for FlatIter<'t, 'r, P> {
    type Item = &'r BuildRow<P>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.pairs.len() {
            let pair = self.pairs[self.at].get();
            self.at += 1;
            if pair.key == self.key {
                return Some(self.rows.get(pair.row));
            }
        }
        None
    }
}

pub enum AdaptiveIter<'t, 'r, const P: usize> {
    List(BucketIter<'t, 'r, P>),
    Flat(FlatIter<'t, 'r, P>),
}

impl<'t, 'r, const P: usize> Iterator for AdaptiveIter<'t, 'r, P> {
    type Item = &'r BuildRow<P>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            AdaptiveIter::List(it) => it.next(),
            AdaptiveIter::Flat(it) => it.next(),
        }
    }
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for AdaptiveChainTable<'r, P, H> {
    type Matches<'t>
        = AdaptiveIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        AdaptiveChainTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}
