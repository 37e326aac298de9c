//! In-memory record batches.
//!
//! A batch collects input records until its limit is reached, gets sorted by key and is spilled as one run.

use rayon::slice::ParallelSliceMut;

use crate::record::{KeyOrder, Record};

/// Builder of empty run buffers. Every buffer it builds has the same limit.
pub trait RunBufferBuilder: Default {
    type Buffer: RunBuffer;

    /// Creates a new empty buffer.
    fn build(&self) -> Self::Buffer;
}

/// Batch of records that becomes one run.
pub trait RunBuffer: Send {
    /// Appends a record to the batch.
    fn push(&mut self, record: Record);

    /// Returns the number of records in the batch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if the batch reached its limit. An empty batch is never full.
    fn is_full(&self) -> bool;

    /// Sorts the batch in parallel. Records with equal keys keep their insertion order.
    fn sort(&mut self, order: KeyOrder);

    /// Consumes the batch returning its records.
    fn into_records(self) -> Vec<Record>;
}

fn sort_records(records: &mut [Record], order: KeyOrder) {
    // rayon's par_sort_by is a stable merge sort
    records.par_sort_by(|a, b| order.compare_records(a, b));
}

/// Builder of batches limited by record count.
pub struct LimitedBufferBuilder {
    batch_size: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    /// Creates a builder of batches holding up to `batch_size` records.
    ///
    /// # Arguments
    /// * `batch_size` - Maximum number of records in a batch. Zero is treated as one.
    /// * `preallocate` - Whether batch memory is allocated upfront
    pub fn new(batch_size: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            batch_size: batch_size.max(1),
            preallocate,
        }
    }

    /// Returns the maximum number of records in a batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for LimitedBufferBuilder {
    /// Unbounded batches: the whole input is sorted in memory.
    fn default() -> Self {
        LimitedBufferBuilder {
            batch_size: usize::MAX,
            preallocate: false,
        }
    }
}

impl RunBufferBuilder for LimitedBufferBuilder {
    type Buffer = LimitedBuffer;

    fn build(&self) -> LimitedBuffer {
        let records = match self.preallocate {
            true => Vec::with_capacity(self.batch_size),
            false => Vec::new(),
        };

        LimitedBuffer {
            batch_size: self.batch_size,
            records,
        }
    }
}

/// Batch limited by record count.
pub struct LimitedBuffer {
    batch_size: usize,
    records: Vec<Record>,
}

impl RunBuffer for LimitedBuffer {
    fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.batch_size
    }

    fn sort(&mut self, order: KeyOrder) {
        sort_records(&mut self.records, order);
    }

    fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{LimitedBufferBuilder, RunBuffer, RunBufferBuilder};
    use crate::record::{KeyOrder, Record};

    fn push_keys<B: RunBuffer>(buffer: &mut B, keys: &[&str]) {
        for (idx, key) in keys.iter().enumerate() {
            buffer.push(Record::new([key.to_string(), idx.to_string()]));
        }
    }

    #[rstest]
    #[case(2, true, 1, false)]
    #[case(2, false, 2, true)]
    #[case(0, false, 0, false)]
    #[case(0, true, 1, true)]
    fn test_limited_buffer(
        #[case] batch_size: usize,
        #[case] preallocate: bool,
        #[case] records: usize,
        #[case] full: bool,
    ) {
        let mut buffer = LimitedBufferBuilder::new(batch_size, preallocate).build();
        push_keys(&mut buffer, &vec!["a"; records]);

        assert_eq!(buffer.len(), records);
        assert_eq!(buffer.is_full(), full);
    }

    #[test]
    fn test_batch_size_clamped() {
        assert_eq!(LimitedBufferBuilder::new(0, false).batch_size(), 1);
        assert_eq!(LimitedBufferBuilder::default().batch_size(), usize::MAX);
    }

    #[test]
    fn test_sort_keeps_insertion_order_of_equal_keys() {
        let mut buffer = LimitedBufferBuilder::new(8, false).build();
        push_keys(&mut buffer, &["b", "a", "b", "a", "c"]);

        buffer.sort(KeyOrder::Lexicographic);

        let actual: Vec<(String, String)> = buffer
            .into_records()
            .iter()
            .map(|record| (record.key().to_string(), record.get(1).unwrap().to_string()))
            .collect();
        let expected: Vec<(String, String)> = [("a", "1"), ("a", "3"), ("b", "0"), ("b", "2"), ("c", "4")]
            .iter()
            .map(|(key, idx)| (key.to_string(), idx.to_string()))
            .collect();
        assert_eq!(actual, expected);
    }
}

#[cfg(feature = "memory-limit")]
pub mod mem {
    use deepsize::DeepSizeOf;

    use super::{sort_records, RunBuffer, RunBufferBuilder};
    use crate::record::{KeyOrder, Record};

    /// Builder of batches limited by the memory their records occupy.
    pub struct MemoryLimitedBufferBuilder {
        memory_limit: u64,
    }

    impl MemoryLimitedBufferBuilder {
        /// Creates a builder of batches holding about `memory_limit` bytes of records.
        /// A batch always accepts at least one record.
        pub fn new(memory_limit: u64) -> Self {
            MemoryLimitedBufferBuilder { memory_limit }
        }
    }

    impl Default for MemoryLimitedBufferBuilder {
        fn default() -> Self {
            MemoryLimitedBufferBuilder::new(u64::MAX)
        }
    }

    impl RunBufferBuilder for MemoryLimitedBufferBuilder {
        type Buffer = MemoryLimitedBuffer;

        fn build(&self) -> MemoryLimitedBuffer {
            MemoryLimitedBuffer {
                memory_limit: self.memory_limit,
                mem_size: 0,
                records: Vec::new(),
            }
        }
    }

    /// Batch limited by the deep size of its records.
    pub struct MemoryLimitedBuffer {
        memory_limit: u64,
        mem_size: u64,
        records: Vec<Record>,
    }

    impl MemoryLimitedBuffer {
        /// Returns the memory occupied by the batch records.
        pub fn mem_size(&self) -> u64 {
            self.mem_size
        }
    }

    impl RunBuffer for MemoryLimitedBuffer {
        fn push(&mut self, record: Record) {
            self.mem_size += record.deep_size_of() as u64;
            self.records.push(record);
        }

        fn len(&self) -> usize {
            self.records.len()
        }

        fn is_full(&self) -> bool {
            !self.records.is_empty() && self.mem_size >= self.memory_limit
        }

        fn sort(&mut self, order: KeyOrder) {
            sort_records(&mut self.records, order);
        }

        fn into_records(self) -> Vec<Record> {
            self.records
        }
    }

    #[cfg(test)]
    mod test {
        use deepsize::DeepSizeOf;

        use super::MemoryLimitedBufferBuilder;
        use crate::buffer::{RunBuffer, RunBufferBuilder};
        use crate::record::Record;

        #[test]
        fn test_memory_limited_buffer() {
            let record = Record::new(["key", "value"]);
            let record_size = record.deep_size_of() as u64;

            let mut buffer = MemoryLimitedBufferBuilder::new(record_size * 2).build();

            buffer.push(record.clone());
            assert_eq!(buffer.mem_size(), record_size);
            assert_eq!(buffer.is_full(), false);

            buffer.push(record.clone());
            assert_eq!(buffer.mem_size(), record_size * 2);
            assert_eq!(buffer.is_full(), true);

            assert_eq!(buffer.into_records(), vec![record.clone(), record]);
        }

        #[test]
        fn test_larger_records_fill_batch_sooner() {
            let small = Record::new(["k", "v"]);
            let large = Record::new(["k", "a much longer value than the small record carries"]);
            let limit = small.deep_size_of() as u64 * 3;

            let mut buffer = MemoryLimitedBufferBuilder::new(limit).build();
            buffer.push(small.clone());
            buffer.push(small);
            assert_eq!(buffer.is_full(), false);

            let mut buffer = MemoryLimitedBufferBuilder::new(limit).build();
            buffer.push(large.clone());
            buffer.push(large);
            assert_eq!(buffer.is_full(), true);
            assert_eq!(buffer.len(), 2);
        }

        #[test]
        fn test_zero_limit_buffer_accepts_one_record() {
            let mut buffer = MemoryLimitedBufferBuilder::new(0).build();

            assert_eq!(buffer.is_full(), false);
            buffer.push(Record::new(["a"]));
            assert_eq!(buffer.is_full(), true);
        }
    }
}
