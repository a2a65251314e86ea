//! `ext-dedup` removes duplicate lines from files that do not fit into memory, producing a sorted result.
//!
//! Deduplication is built on top of external sorting. During the first pass records are collected into an
//! in-memory set until the set reaches its limit, then the set is sorted and spilled to a temporary chunk file.
//! During the second pass all chunks are merged together. Since every chunk is sorted, all occurrences of
//! a record surface one after another in merged order, so duplicates spanning chunks are dropped by comparing each
//! record with the last one written. If nothing was spilled the in-memory set is written straight to the
//! destination and the merge pass is skipped.
//!
//! # Overview
//!
//! `ext-dedup` supports the following features:
//!
//! * **Byte-exact records:**
//!   records are newline-delimited byte strings, no encoding is assumed. Output is sorted by bytes.
//! * **Memory limit support:**
//!   the in-memory set is limited by the serialized size of its distinct records. Re-seen duplicates are free.
//!   The limit is a target rather than a hard cap.
//! * **Skip patterns:**
//!   records matching any of the supplied regular expressions are dropped before deduplication.
//! * **Multithreading support:**
//!   spilled sets are sorted in multiple threads.
//! * **Progress estimation:**
//!   a background tracker pre-counts a second stream over the same input and periodically logs the estimated
//!   completion.
//! * **Cleanup:**
//!   temporary chunks are removed as soon as they are merged, and on every failure path.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io;
//! use std::path;
//!
//! use log;
//!
//! use ext_dedup::{ExternalDeduper, ExternalDeduperBuilder, LineFilter, LineSource, MemoryLimitedSetBuilder};
//!
//! fn main() {
//!     let input = LineSource::new(io::BufReader::new(fs::File::open("input.txt").unwrap()));
//!     let mut output = fs::File::create("output.txt").unwrap();
//!
//!     let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_buffer(MemoryLimitedSetBuilder::new(50 * 1024 * 1024))
//!         .with_filter(LineFilter::compile(["^#"]).unwrap())
//!         .build()
//!         .unwrap();
//!
//!     let stats = deduper.dedup(input, &mut output).unwrap();
//!     log::info!("{} distinct lines written", stats.records_written);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod dedup;
pub mod filter;
pub mod merger;
pub mod progress;
pub mod source;

pub use buffer::{
    CountLimitedSet, CountLimitedSetBuilder, DedupBuffer, DedupBufferBuilder, MemoryLimitedSet,
    MemoryLimitedSetBuilder,
};
pub use chunk::{ExternalChunk, LineChunk};
pub use dedup::{DedupError, DedupStats, ExternalDeduper, ExternalDeduperBuilder};
pub use filter::LineFilter;
pub use merger::DedupMerger;
pub use progress::{ProgressCounter, ProgressTracker};
pub use source::LineSource;

/// A single deduplication unit: one input line without its delimiter.
pub type Record = Vec<u8>;
