//! `csv-ext-sort` sorts delimited record files that don't fit into memory.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. During the first phase the input is split into
//! batches that fit in RAM, each batch is sorted and saved to disk as a *run*. During the second phase runs are
//! merged pass by pass until a single sorted run remains, which then becomes the output file.
//! For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `csv-ext-sort` supports the following features:
//!
//! * **Delimited records:**
//!   records are lines of a delimited file (CSV by default) with standard quoting. Records are sorted in
//!   ascending order of their first field.
//! * **Stable ordering:**
//!   records with equal keys keep their input order, whatever the number of runs and merge passes.
//! * **Merge policies:**
//!   runs can be merged pairwise (binary tree) or many at once (k-way) with the number of simultaneously open
//!   runs bounded by the process open files limit.
//! * **Multithreading support:**
//!   batches are sorted in multiple threads and independent merges of a pass are executed in parallel.
//! * **Memory limit support:**
//!   batches can be limited by their memory consumption instead of record count
//!   (`memory-limit` feature required).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use csv_ext_sort::{ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder, MergePolicy};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_buffer(LimitedBufferBuilder::new(1_000_000, true))
//!         .with_merge_policy(MergePolicy::KWay)
//!         .build()
//!         .unwrap();
//!
//!     sorter.sort(Path::new("input.csv"), Path::new("output.csv")).unwrap();
//! }
//! ```

pub mod buffer;
pub mod merger;
pub mod record;
pub mod run;
pub mod scheduler;
pub mod sort;

pub use buffer::{LimitedBuffer, LimitedBufferBuilder, RunBuffer, RunBufferBuilder};
pub use merger::{BinaryHeapMerger, RunMerger};
pub use record::{Dialect, KeyOrder, Record, RecordError, RecordReader, RecordWriter};
pub use run::{Run, RunStore, TEMP_PREFIX};
pub use scheduler::{MergePolicy, MergeScheduler, Scheduled};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortSummary};
