//! Binary heap deduplicating merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output, emitting every distinct item once.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// Equal items coming from different chunks surface consecutively in merged order, so it is enough to
/// compare each popped item with the last emitted one. Which chunk wins a tie does not matter.
/// A chunk is dropped as soon as it is exhausted.
pub struct DedupMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<(Reverse<T>, usize)>,
    chunks: Vec<Option<C>>,
    last_emitted: Option<T>,
    skipped: u64,
    // chunks below this index already have their first item in the heap
    seeded: usize,
}

impl<T, E, C> DedupMerger<T, E, C>
where
    T: Ord,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    /// Creates an instance of a merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(Some));
        let items = BinaryHeap::with_capacity(chunks.len());

        return DedupMerger {
            chunks,
            items,
            last_emitted: None,
            skipped: 0,
            seeded: 0,
        };
    }

    /// Returns the number of duplicates skipped since the previous call and resets the counter.
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }

    /// Returns the number of chunks not exhausted yet.
    pub fn live_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_some()).count()
    }

    fn advance(&mut self, idx: usize) -> Result<(), E> {
        let next = match self.chunks[idx].as_mut() {
            Some(chunk) => chunk.next(),
            None => return Ok(()),
        };

        match next {
            Some(Ok(item)) => self.items.push((Reverse(item), idx)),
            Some(Err(err)) => return Err(err),
            None => self.chunks[idx] = None,
        }

        return Ok(());
    }
}

impl<T, E, C> Iterator for DedupMerger<T, E, C>
where
    T: Ord + Clone,
    E: Error,
    C: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next distinct item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        while self.seeded < self.chunks.len() {
            let idx = self.seeded;
            self.seeded += 1;
            if let Err(err) = self.advance(idx) {
                return Some(Err(err));
            }
        }

        loop {
            let (Reverse(item), idx) = self.items.pop()?;
            if let Err(err) = self.advance(idx) {
                return Some(Err(err));
            }

            if self.last_emitted.as_ref() == Some(&item) {
                self.skipped += 1;
                continue;
            }

            self.last_emitted = Some(item.clone());
            return Some(Ok(item));
        }
    }
}
