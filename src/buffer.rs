//! Limited working set implementations.

use std::collections::HashSet;

use crate::Record;

/// Initial capacity of a working set that is not preallocated.
const DEFAULT_SET_CAPACITY: usize = 1024;

/// Working set builder.
pub trait DedupBufferBuilder: Default {
    type Buffer: DedupBuffer;

    /// Creates a new empty working set.
    fn build(&self) -> Self::Buffer;
}

/// Base limited working set interface.
///
/// A working set holds distinct records of the current spill cycle. Only records that are
/// actually new count against its limit; re-seen duplicates are free.
pub trait DedupBuffer: IntoIterator<Item = Record> + Send {
    /// Checks if the record is already present.
    fn contains(&self, record: &[u8]) -> bool;

    /// Adds a record to the set. Returns `true` if it was not present before.
    fn insert(&mut self, record: Record) -> bool;

    /// Returns the number of distinct records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the serialized size of the stored records (record bytes plus one delimiter each).
    fn mem_size(&self) -> u64;

    /// Checks if admitting a new distinct record would reach the limit, meaning the set
    /// has to be spilled first. An empty set never needs spilling, so a single record
    /// larger than the limit is admitted and the limit is exceeded by its size.
    fn would_overflow(&self, record: &[u8]) -> bool;
}

/// Serialized size of a record: its bytes plus the delimiter.
pub fn record_size(record: &[u8]) -> u64 {
    record.len() as u64 + 1
}

pub struct CountLimitedSetBuilder {
    set_limit: usize,
    preallocate: bool,
}

impl CountLimitedSetBuilder {
    pub fn new(set_limit: usize, preallocate: bool) -> Self {
        CountLimitedSetBuilder { set_limit, preallocate }
    }
}

impl DedupBufferBuilder for CountLimitedSetBuilder {
    type Buffer = CountLimitedSet;

    fn build(&self) -> Self::Buffer {
        if self.preallocate {
            CountLimitedSet::with_capacity(self.set_limit)
        } else {
            CountLimitedSet::new(self.set_limit)
        }
    }
}

impl Default for CountLimitedSetBuilder {
    fn default() -> Self {
        CountLimitedSetBuilder {
            set_limit: usize::MAX,
            preallocate: false,
        }
    }
}

/// Working set limited by distinct records count.
pub struct CountLimitedSet {
    limit: usize,
    current_size: u64,
    inner: HashSet<Record>,
}

impl CountLimitedSet {
    pub fn new(limit: usize) -> Self {
        CountLimitedSet {
            limit,
            current_size: 0,
            inner: HashSet::with_capacity(DEFAULT_SET_CAPACITY.min(limit)),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        CountLimitedSet {
            limit,
            current_size: 0,
            inner: HashSet::with_capacity(limit),
        }
    }
}

impl DedupBuffer for CountLimitedSet {
    fn contains(&self, record: &[u8]) -> bool {
        self.inner.contains(record)
    }

    fn insert(&mut self, record: Record) -> bool {
        let size = record_size(&record);
        let inserted = self.inner.insert(record);
        if inserted {
            self.current_size += size;
        }

        return inserted;
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn mem_size(&self) -> u64 {
        self.current_size
    }

    fn would_overflow(&self, _record: &[u8]) -> bool {
        !self.inner.is_empty() && self.inner.len() >= self.limit
    }
}

impl IntoIterator for CountLimitedSet {
    type Item = Record;
    type IntoIter = <HashSet<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

pub struct MemoryLimitedSetBuilder {
    set_limit: u64,
}

impl MemoryLimitedSetBuilder {
    pub fn new(set_limit: u64) -> Self {
        MemoryLimitedSetBuilder { set_limit }
    }
}

impl DedupBufferBuilder for MemoryLimitedSetBuilder {
    type Buffer = MemoryLimitedSet;

    fn build(&self) -> Self::Buffer {
        MemoryLimitedSet::new(self.set_limit)
    }
}

impl Default for MemoryLimitedSetBuilder {
    fn default() -> Self {
        MemoryLimitedSetBuilder { set_limit: u64::MAX }
    }
}

/// Working set limited by the serialized size of its distinct records.
///
/// The limit is a target, not a hard cap: the hash set overhead is not accounted for.
pub struct MemoryLimitedSet {
    limit: u64,
    current_size: u64,
    inner: HashSet<Record>,
}

impl MemoryLimitedSet {
    pub fn new(limit: u64) -> Self {
        MemoryLimitedSet {
            limit,
            current_size: 0,
            inner: HashSet::with_capacity(DEFAULT_SET_CAPACITY),
        }
    }
}

impl DedupBuffer for MemoryLimitedSet {
    fn contains(&self, record: &[u8]) -> bool {
        self.inner.contains(record)
    }

    fn insert(&mut self, record: Record) -> bool {
        let size = record_size(&record);
        let inserted = self.inner.insert(record);
        if inserted {
            self.current_size += size;
        }

        return inserted;
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn mem_size(&self) -> u64 {
        self.current_size
    }

    fn would_overflow(&self, record: &[u8]) -> bool {
        !self.inner.is_empty() && self.current_size.saturating_add(record_size(record)) >= self.limit
    }
}

impl IntoIterator for MemoryLimitedSet {
    type Item = Record;
    type IntoIter = <HashSet<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}
