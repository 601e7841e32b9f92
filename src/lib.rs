//! A segmented, on-disk index for an append-only key/value store.
//!
//! The store this index backs is a log of immutable records: every write
//! lands at a new file offset, and an update or delete is recorded as a
//! fresh entry rather than a mutation in place. This crate is the part
//! that lets a reader find the *current* offset for a key in O(log n)
//! without scanning the log — a B+tree-like structure per segment, with
//! mutations serialized through a single applier thread per segment so
//! the on-disk tree never sees concurrent writers.
//!
//! An index is split into a fixed number of segments ([`Config::new`]'s
//! `cache_segments`), each backed by its own file and its own tree. A
//! segment is selected by the caller (typically a hash of the key, or a
//! vnode/shard id handed down by the store), which is why every public
//! operation on [`Index`] takes an explicit segment id rather than
//! computing one.
//!
//! # Collaborators
//!
//! This crate does not own a clock, a disk-space reclaimer, or a thread
//! pool for completions — it borrows them from the embedding
//! application through the traits in [`collab`]: [`collab::TimeService`],
//! [`collab::Compactor`], [`collab::TemporaryTable`], and
//! [`collab::NonBlockingManager`]. Supply real or fake implementations
//! depending on whether you're running the store or testing it.
//!
//! # Shutdown
//!
//! [`Index::stop`] drains every segment's queue, writes each segment's
//! tree root and free list back to its file, and persists the two
//! sidecar files ([`Index`]'s module docs on `index-count`/`index.stats`)
//! that make the *next* [`Index::open`] trust what's on disk instead of
//! rebuilding from scratch. [`Index::shutdown`] additionally joins the
//! worker pool's threads; call it instead of `stop()` when the process
//! itself is exiting.

mod collab;
mod config;
mod entry;
mod error;
mod files;
mod index;
mod node;
mod pool;
mod request;
mod shard;
mod space;

pub use crate::collab::{
    Compactor, FakeTimeService, FileStats, NonBlockingManager, SystemTimeService, TemporaryTable,
    ThreadedCompletionSink, TimeService,
};
pub use crate::config::Config;
pub use crate::entry::{EntryLocation, NO_EXPIRY};
pub use crate::error::{Error, Result};
pub use crate::index::Index;
pub use crate::node::LookupOp;
pub use crate::request::{IndexReply, IndexRequest, SyncAction};
