//! Equi-join build/probe tables.
//!
//! Competing in-memory layouts for the same job: index a build-side row set
//! by a 64-bit key once, then answer a stream of probe keys with the
//! matching rows (or just their count). The strategies differ in where they
//! spend cache misses, which is the whole game:
//!
//! ```text
//!                         RowSet (caller-owned rows)
//!                        ┌──────────────────────────┐
//!                        │ key │ payload │ key │ ...│
//!                        └──────▲───────────▲───────┘
//!          row handles          │           │
//! ┌─────────────────────────────┴───────────┴─────────────────────────┐
//! │ LinearProbeTable   open addressing, one slot per unique key       │
//! │ ChainedTable       bucket head + linked list per bucket           │
//! │ FingerprintTable   chained + per-bucket OR-of-hashes pre-filter   │
//! │ SortedBucketTable  counting sort: each bucket one contiguous run  │
//! │ CompactBucketTable fused directory/storage, ranges wrap via mask  │
//! │ AdaptiveChainTable chained, hot buckets flip to flat key arrays   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tables are built once and never updated; probing is read-only (the
//! adaptive table's bucket reorganization is interior mutation behind
//! `Cell`, invisible in results). Duplicate build keys fan out one match
//! per row; duplicate probe keys re-scan. Build rows stay in the caller's
//! [`RowSet`] — tables only allocate structural metadata (buckets, links,
//! fingerprints), all of it through the [`alloc`] module, which routes huge
//! requests to anonymous memory mappings.
//!
//! Every table instance is single-threaded; instances share no state beyond
//! the allocator's mapped-bytes counter, so partition-parallel drivers can
//! build and probe one instance per shard without synchronization.

pub mod adaptive;
pub mod alloc;
pub mod chain;
pub mod linear;
pub mod sorted;
pub mod table;

pub use adaptive::AdaptiveChainTable;
pub use alloc::{Allocator, Buffer, MMAP_THRESHOLD, RawAllocator, ZeroingAllocator, mapped_bytes};
pub use chain::{ChainedTable, FingerprintTable};
pub use linear::LinearProbeTable;
pub use sorted::{CompactBucketTable, SortedBucketTable};
pub use table::{
    BuildRow, FibHash, IdentityHash, JoinIndex, KeyHash, Link, RowSet, bucket_count_for,
};
