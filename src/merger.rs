//! Binary heap merger.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::error::Error;

use log;

use crate::record::Record;
use crate::run::{Run, RunStore};
use crate::sort::SortError;

/// Heap item ordered by a custom compare function. Ties are resolved in favor of the lower input index.
struct OrderedWrapper<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    value: T,
    idx: usize,
    compare: F,
}

impl<T, F> PartialEq for OrderedWrapper<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F> Eq for OrderedWrapper<T, F> where F: Fn(&T, &T) -> Ordering {}

impl<T, F> PartialOrd for OrderedWrapper<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F> Ord for OrderedWrapper<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&self.value, &other.value).then_with(|| self.idx.cmp(&other.idx))
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// At most one item per input is held in memory. Equal items are returned in input order.
pub struct BinaryHeapMerger<T, E, F, C>
where
    E: Error,
    F: Fn(&T, &T) -> Ordering + Copy,
    C: IntoIterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<OrderedWrapper<T, F>>>,
    chunks: Vec<C::IntoIter>,
    compare: F,
    initiated: bool,
}

impl<T, E, F, C> BinaryHeapMerger<T, E, F, C>
where
    E: Error,
    F: Fn(&T, &T) -> Ordering + Copy,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `compare` - Function to be used to compare items
    pub fn new<I>(chunks: I, compare: F) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            compare,
            initiated: false,
        };
    }

    /// Returns the number of items currently held by the merger.
    pub fn buffered(&self) -> usize {
        self.items.len()
    }

    fn pull(&mut self, idx: usize) -> Result<(), E> {
        if let Some(item) = self.chunks[idx].next() {
            self.items.push(Reverse(OrderedWrapper {
                value: item?,
                idx,
                compare: self.compare,
            }));
        }

        return Ok(());
    }
}

impl<T, E, F, C> Iterator for BinaryHeapMerger<T, E, F, C>
where
    E: Error,
    F: Fn(&T, &T) -> Ordering + Copy,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.chunks.len() {
                if let Err(err) = self.pull(idx) {
                    return Some(Err(err));
                }
            }
        }

        let Reverse(result) = self.items.pop()?;
        if let Err(err) = self.pull(result.idx) {
            return Some(Err(err));
        }

        return Some(Ok(result.value));
    }
}

/// Merges sorted runs into a single run.
pub struct RunMerger<'a, F>
where
    F: Fn(&Record, &Record) -> Ordering + Copy,
{
    store: &'a RunStore,
    compare: F,
}

impl<'a, F> RunMerger<'a, F>
where
    F: Fn(&Record, &Record) -> Ordering + Copy,
{
    /// Creates a run merger writing merged runs to `store`.
    pub fn new(store: &'a RunStore, compare: F) -> Self {
        RunMerger { store, compare }
    }

    /// Merges `runs` into a new run and retires them.
    /// On a key tie the record of the run listed first wins. A single run is returned as is.
    ///
    /// # Panics
    /// Panics if `runs` is empty.
    pub fn merge(&self, mut runs: Vec<Run>) -> Result<Run, SortError> {
        assert!(!runs.is_empty(), "at least one run expected");

        if runs.len() == 1 {
            return Ok(runs.remove(0));
        }

        let cursors = runs
            .iter()
            .map(|run| self.store.open(run))
            .collect::<Result<Vec<_>, _>>()?;

        let mut output = self.store.create()?;
        for record in BinaryHeapMerger::new(cursors, self.compare) {
            output.push(&record?)?;
        }
        let merged = output.finish()?;

        log::trace!(
            "runs {:?} merged into run {}",
            Vec::from_iter(runs.iter().map(Run::id)),
            merged.id()
        );

        for run in runs {
            run.retire()?;
        }

        return Ok(merged);
    }
}
