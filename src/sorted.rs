//! Counting-sort bucket layouts: all rows of a bucket sit contiguously in
//! one flat allocation, so a probe is a short linear scan instead of a
//! pointer chase.
//!
//! [`SortedBucketTable`] is the classic two-pass build: count rows per
//! bucket, prefix-sum into an offsets array, then place rows into their
//! bucket's slot range. Each range holds one slot per unique key (duplicate
//! rows chain off their key's slot), filled from the front, so occupied
//! slots form a prefix of the range.
//!
//! [`CompactBucketTable`] fuses the directory and the slot storage into a
//! single array so the common probe touches one cache line instead of two:
//! the entry at index `b` carries bucket `b`'s range descriptor *and* a
//! slot, and ranges are anchored at their own bucket index whenever the
//! preceding ranges leave it free. A probe first compares the key stored
//! right at index `b`; only on a miss does it decode the range and scan.
//! Ranges that spill past the end of the array wrap around to the front,
//! which is why every scan masks its index.

use std::marker::PhantomData;

use crate::alloc::Buffer;
use crate::table::{ChainIter, FibHash, JoinIndex, KeyHash, Link, RowSet, bucket_count_for};

#[derive(Copy, Clone)]
struct Slot {
    key: u64,
    head: Link,
}

pub struct SortedBucketTable<'r, const P: usize, H: KeyHash = FibHash> {
    rows: &'r RowSet<P>,
    /// `bucket_count + 1` prefix sums; bucket `b` owns `offsets[b]..offsets[b+1]`.
    offsets: Buffer<u32>,
    slots: Buffer<Slot>,
    next: Buffer<Link>,
    mask: u64,
    max_bucket_len: usize,
    _hash: PhantomData<H>,
}

impl<'r, const P: usize> SortedBucketTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> SortedBucketTable<'r, P, H> {
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two());
        let mask = (bucket_count - 1) as u64;

        let mut offsets = unsafe { Buffer::<u32>::zeroed(bucket_count + 1) };
        for row in rows.iter() {
            offsets[(H::hash(row.key) & mask) as usize + 1] += 1;
        }
        let mut max_bucket_len = 0;
        let mut cumulative = 0u32;
        for b in 1..=bucket_count {
            max_bucket_len = max_bucket_len.max(offsets[b] as usize);
            cumulative += offsets[b];
            offsets[b] = cumulative;
        }
        debug_assert_eq!(cumulative as usize, rows.len());

        let mut slots = unsafe { Buffer::<Slot>::zeroed(rows.len()) };
        let mut next = unsafe { Buffer::<Link>::zeroed(rows.len()) };
        for (i, row) in rows.iter().enumerate() {
            let bucket = (H::hash(row.key) & mask) as usize;
            let mut pos = offsets[bucket] as usize;
            loop {
                let slot = &mut slots[pos];
                match slot.head.get() {
                    None => {
                        slot.key = row.key;
                        slot.head = Link::to(i as u32);
                        break;
                    }
                    Some(head) if slot.key == row.key => {
                        next[i] = next[head as usize];
                        next[head as usize] = Link::to(i as u32);
                        break;
                    }
                    Some(_) => {
                        pos += 1;
                        // The range was counted with duplicates included, so
                        // unique keys always fit inside it.
                        debug_assert!(pos < offsets[bucket + 1] as usize);
                    }
                }
            }
        }

        Self {
            rows,
            offsets,
            slots,
            next,
            mask,
            max_bucket_len,
            _hash: PhantomData,
        }
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> ChainIter<'t, 'r, P> {
        let bucket = (H::hash(key) & self.mask) as usize;
        let start = self.offsets[bucket] as usize;
        let end = self.offsets[bucket + 1] as usize;
        for pos in start..end {
            let slot = self.slots[pos];
            if slot.head.is_none() {
                // Occupied slots are a prefix of the range.
                break;
            }
            if slot.key == key {
                return ChainIter::new(self.rows, &self.next, slot.head);
            }
        }
        ChainIter::empty(self.rows, &self.next)
    }

    pub fn bucket_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Rows in the fullest bucket; bounds the probe scan length.
    pub fn max_bucket_len(&self) -> usize {
        self.max_bucket_len
    }

    /// Bytes of allocator-backed storage.
    pub fn buf_size(&self) -> usize {
        self.offsets.byte_len() + self.slots.byte_len() + self.next.byte_len()
    }

    /// Row handles reachable from bucket `b`'s slot range, duplicates
    /// included. Diagnostic accessor.
    pub fn bucket_rows(&self, bucket: usize) -> Vec<u32> {
        let mut out = Vec::new();
        for pos in self.offsets[bucket] as usize..self.offsets[bucket + 1] as usize {
            let slot = self.slots[pos];
            if slot.head.is_none() {
                break;
            }
            let mut cur = slot.head;
            while let Some(row) = cur.get() {
                out.push(row);
                cur = self.next[row as usize];
            }
        }
        out
    }
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for SortedBucketTable<'r, P, H> {
    type Matches<'t>
        = ChainIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        SortedBucketTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Range descriptor stored in a fused directory entry.
///
/// A non-empty bucket stores the (unwrapped) start position of its slot
/// range. An empty bucket stores the end of the nearest preceding non-empty
/// bucket's range, so a scan of bucket `b` can always bound itself by
/// looking at entry `b + 1` alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
struct RangeEntry(i64);

impl RangeEntry {
    #[inline(always)]
    fn start_of(pos: u64) -> Self {
        Self(pos as i64)
    }

    #[inline(always)]
    fn end_mark(end: u64) -> Self {
        Self(-(end as i64) - 1)
    }

    #[inline(always)]
    fn is_start(self) -> bool {
        self.0 >= 0
    }

    #[inline(always)]
    fn start(self) -> u64 {
        debug_assert!(self.is_start());
        self.0 as u64
    }

    #[inline(always)]
    fn end(self) -> u64 {
        debug_assert!(!self.is_start());
        (-(self.0 + 1)) as u64
    }

    /// Range bound when this entry follows a non-empty bucket.
    #[inline(always)]
    fn bound(self) -> u64 {
        if self.is_start() { self.start() } else { self.end() }
    }
}

#[derive(Copy, Clone)]
struct FusedSlot {
    range: RangeEntry,
    key: u64,
    head: Link,
}

pub struct CompactBucketTable<'r, const P: usize, H: KeyHash = FibHash> {
    rows: &'r RowSet<P>,
    /// `bucket_count + 1` fused entries; the final entry only carries the
    /// terminating range bound. Scan positions are masked, so a range may
    /// wrap past the end of the array.
    slots: Buffer<FusedSlot>,
    next: Buffer<Link>,
    mask: u64,
    max_bucket_len: usize,
    wrapped: usize,
    _hash: PhantomData<H>,
}

impl<'r, const P: usize> CompactBucketTable<'r, P> {
    pub fn build(rows: &'r RowSet<P>) -> Self {
        Self::build_with_buckets(rows, bucket_count_for(rows.len()))
    }
}

impl<'r, const P: usize, H: KeyHash> CompactBucketTable<'r, P, H> {
    pub fn build_with_buckets(rows: &'r RowSet<P>, bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two());
        assert!(
            rows.len() <= bucket_count,
            "compact table needs at least one slot per row"
        );
        let mask = (bucket_count - 1) as u64;

        let mut counts = vec![0u32; bucket_count];
        let mut max_bucket_len = 0;
        for row in rows.iter() {
            let bucket = (H::hash(row.key) & mask) as usize;
            counts[bucket] += 1;
            max_bucket_len = max_bucket_len.max(counts[bucket] as usize);
        }

        let (starts, wrapped) = assign_ranges(&counts);

        let mut slots = unsafe { Buffer::<FusedSlot>::zeroed(bucket_count + 1) };
        let mut prev_end = wrapped;
        for b in 0..bucket_count {
            if counts[b] > 0 {
                slots[b].range = RangeEntry::start_of(starts[b]);
                prev_end = starts[b] + counts[b] as u64;
            } else {
                slots[b].range = RangeEntry::end_mark(prev_end);
            }
        }
        slots[bucket_count].range = RangeEntry::end_mark(prev_end);

        let mut next = unsafe { Buffer::<Link>::zeroed(rows.len()) };
        for (i, row) in rows.iter().enumerate() {
            let bucket = (H::hash(row.key) & mask) as usize;
            let start = slots[bucket].range.start();
            let mut pos = start;
            loop {
                let idx = (pos & mask) as usize;
                let slot = &mut slots[idx];
                match slot.head.get() {
                    None => {
                        slot.key = row.key;
                        slot.head = Link::to(i as u32);
                        break;
                    }
                    Some(head) if slot.key == row.key => {
                        next[i] = next[head as usize];
                        next[head as usize] = Link::to(i as u32);
                        break;
                    }
                    Some(_) => {
                        pos += 1;
                        debug_assert!(pos < start + counts[bucket] as u64);
                    }
                }
            }
        }

        Self {
            rows,
            slots,
            next,
            mask,
            max_bucket_len,
            wrapped: wrapped as usize,
            _hash: PhantomData,
        }
    }

    #[inline]
    pub fn probe<'t>(&'t self, key: u64) -> ChainIter<'t, 'r, P> {
        let bucket = (H::hash(key) & self.mask) as usize;
        let anchor = self.slots[bucket];
        // Fast path: the bucket's first row usually sits right at the
        // bucket's own index. Equal keys imply equal buckets, so a hit here
        // can never belong to a range that merely covers this index.
        if anchor.head.is_some() && anchor.key == key {
            return ChainIter::new(self.rows, &self.next, anchor.head);
        }
        if !anchor.range.is_start() {
            return ChainIter::empty(self.rows, &self.next);
        }
        let start = anchor.range.start();
        let end = self.slots[bucket + 1].range.bound();
        for pos in start..end {
            let slot = self.slots[(pos & self.mask) as usize];
            if slot.head.is_none() {
                break;
            }
            if slot.key == key {
                return ChainIter::new(self.rows, &self.next, slot.head);
            }
        }
        ChainIter::empty(self.rows, &self.next)
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn max_bucket_len(&self) -> usize {
        self.max_bucket_len
    }

    /// Slots occupied by ranges that wrapped past the end of the array.
    pub fn wrapped_slots(&self) -> usize {
        self.wrapped
    }

    /// Bytes of allocator-backed storage.
    pub fn buf_size(&self) -> usize {
        self.slots.byte_len() + self.next.byte_len()
    }

    /// Row handles reachable from bucket `b`'s (possibly wrapped) range.
    /// Diagnostic accessor.
    pub fn bucket_rows(&self, bucket: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let entry = self.slots[bucket].range;
        if !entry.is_start() {
            return out;
        }
        let start = entry.start();
        let end = self.slots[bucket + 1].range.bound();
        for pos in start..end {
            let slot = self.slots[(pos & self.mask) as usize];
            if slot.head.is_none() {
                break;
            }
            let mut cur = slot.head;
            while let Some(row) = cur.get() {
                out.push(row);
                cur = self.next[row as usize];
            }
        }
        out
    }
}

/// Assigns each non-empty bucket a contiguous slot range, anchored at the
/// bucket's own index when the preceding ranges leave it free.
///
/// A range can spill past the end of the array; spilled slots wrap to the
/// front, so the sweep reserves that many slots before the first range and
/// repeats until the spill stops growing. The spill is monotone across
/// sweeps (a larger reservation can only push ranges further right) and
/// bounded by the row count, so the loop always reaches a fixpoint; at the
/// fixpoint the linear ranges tile `[spill, n + spill)`, which maps
/// one-to-one onto the array under the mask.
fn assign_ranges(counts: &[u32]) -> (Vec<u64>, u64) {
    let n = counts.len();
    let mut starts = vec![0u64; n];
    let mut spill = 0u64;
    loop {
        let mut next_free = spill;
        for b in 0..n {
            if counts[b] > 0 {
                let start = next_free.max(b as u64);
                starts[b] = start;
                next_free = start + counts[b] as u64;
            }
        }
        let overflow = next_free.saturating_sub(n as u64);
        if overflow == spill {
            break;
        }
        debug_assert!(overflow > spill);
        spill = overflow;
    }
    (starts, spill)
}

impl<'r, const P: usize, H: KeyHash> JoinIndex<'r, P> for CompactBucketTable<'r, P, H> {
    type Matches<'t>
        = ChainIter<'t, 'r, P>
    where
        Self: 't;

    #[inline]
    fn probe<'t>(&'t self, key: u64) -> Self::Matches<'t> {
        CompactBucketTable::probe(self, key)
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}
