//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::merger::RunMerger;
use crate::record::{Dialect, KeyOrder, Record, RecordError};
use crate::run::{self, Run, RunStore};
use crate::scheduler::{MergePolicy, MergeScheduler, Scheduled};
use crate::{LimitedBufferBuilder, RunBuffer, RunBufferBuilder};

/// Descriptors kept aside for the input, the output, logging and the standard streams.
const RESERVED_DESCRIPTORS: u64 = 32;
/// Fan-in used when the open files limit can't be determined.
const DEFAULT_FAN_IN: usize = 256;
const MAX_FAN_IN: usize = 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Input data stream error.
    Input(io::Error),
    /// Input record can't be decoded.
    MalformedRecord(RecordError),
    /// Run creation error.
    RunWrite(io::Error),
    /// Run reading error.
    RunRead {
        /// Run file path.
        path: PathBuf,
        /// One-based position of the record that failed to be read, zero if the run couldn't be opened.
        record: u64,
        source: RecordError,
    },
    /// Result publishing error.
    Output(io::Error),
}

impl SortError {
    fn from_input(err: RecordError) -> Self {
        match err {
            RecordError::IO(err) => SortError::Input(err),
            err => SortError::MalformedRecord(err),
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SortError::TempDir(err) => err,
            SortError::ThreadPoolBuildError(err) => err,
            SortError::IO(err) => err,
            SortError::Input(err) => err,
            SortError::MalformedRecord(err) => err,
            SortError::RunWrite(err) => err,
            SortError::RunRead { source, .. } => source,
            SortError::Output(err) => err,
        })
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Input(err) => write!(f, "input data stream error: {}", err),
            SortError::MalformedRecord(err) => write!(f, "input data error: {}", err),
            SortError::RunWrite(err) => write!(f, "run not written: {}", err),
            SortError::RunRead { path, record, source } => {
                write!(f, "run {} not read (record {}): {}", path.display(), record, source)
            }
            SortError::Output(err) => write!(f, "result not published: {}", err),
        }
    }
}

/// Sorting summary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SortSummary {
    /// Number of sorted records.
    pub records: u64,
    /// Number of initial runs.
    pub runs: usize,
    /// Number of merge passes.
    pub passes: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<B = LimitedBufferBuilder>
where
    B: RunBufferBuilder,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Run buffer builder.
    buffer_builder: B,
    /// Records encoding.
    dialect: Dialect,
    /// Keys order.
    key_order: KeyOrder,
    /// Runs merge policy.
    merge_policy: MergePolicy,
    /// Maximum number of runs merged at once.
    fan_in: Option<usize>,
}

impl<B> ExternalSorterBuilder<B>
where
    B: RunBufferBuilder,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B>, SortError> {
        ExternalSorter::new(self)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<B> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<B> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder. The buffer limit defines the batch size of the initial runs.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalSorterBuilder<B> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets run read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<B> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets records encoding.
    pub fn with_dialect(mut self, dialect: Dialect) -> ExternalSorterBuilder<B> {
        self.dialect = dialect;
        return self;
    }

    /// Sets keys order.
    pub fn with_key_order(mut self, key_order: KeyOrder) -> ExternalSorterBuilder<B> {
        self.key_order = key_order;
        return self;
    }

    /// Sets runs merge policy.
    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> ExternalSorterBuilder<B> {
        self.merge_policy = merge_policy;
        return self;
    }

    /// Sets maximum number of runs merged at once. By default it is derived from the open files limit.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder<B> {
        self.fan_in = Some(fan_in);
        return self;
    }
}

impl<B> Default for ExternalSorterBuilder<B>
where
    B: RunBufferBuilder,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: B::default(),
            dialect: Dialect::default(),
            key_order: KeyOrder::default(),
            merge_policy: MergePolicy::default(),
            fan_in: None,
        }
    }
}

/// External sorter.
pub struct ExternalSorter<B = LimitedBufferBuilder>
where
    B: RunBufferBuilder,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Temporary runs storage.
    store: RunStore,
    /// Run buffer builder.
    buffer_builder: B,
    /// Input read buffer size.
    rw_buf_size: Option<usize>,
    /// Keys order.
    key_order: KeyOrder,
    /// Merge passes scheduler.
    scheduler: MergeScheduler,
}

impl<B> ExternalSorter<B>
where
    B: RunBufferBuilder,
{
    /// Creates a new external sorter instance.
    ///
    /// If the builder has no threads number set, it will be selected based on available CPU core number.
    /// If it has no temporary directory set, default OS temporary directory will be used.
    pub fn new(builder: ExternalSorterBuilder<B>) -> Result<Self, SortError> {
        let thread_pool = Self::init_thread_pool(builder.threads_number)?;
        let fan_in = Self::init_fan_in(builder.fan_in, thread_pool.current_num_threads());

        return Ok(ExternalSorter {
            store: RunStore::new(builder.tmp_dir.as_deref(), builder.dialect, builder.rw_buf_size)?,
            scheduler: MergeScheduler::new(builder.merge_policy, fan_in),
            thread_pool,
            buffer_builder: builder.buffer_builder,
            rw_buf_size: builder.rw_buf_size,
            key_order: builder.key_order,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_fan_in(fan_in: Option<usize>, threads_number: usize) -> usize {
        if let Some(fan_in) = fan_in {
            log::info!("merge fan-in: {}", fan_in);
            return fan_in;
        }

        // every concurrent merge holds one descriptor per input run and one for its output
        let fan_in = match open_files_limit() {
            Some(limit) => {
                let per_merge = limit.saturating_sub(RESERVED_DESCRIPTORS) / threads_number.max(1) as u64;
                per_merge.saturating_sub(1).min(MAX_FAN_IN as u64) as usize
            }
            None => DEFAULT_FAN_IN,
        };
        log::info!("merge fan-in: {} (derived from open files limit)", fan_in);

        return fan_in;
    }

    /// Returns the temporary directory runs are stored in.
    pub fn tmp_dir(&self) -> &Path {
        self.store.path()
    }

    /// Returns the maximum number of runs merged at once.
    pub fn fan_in(&self) -> usize {
        self.scheduler.fan_in()
    }

    /// Sorts records of the `input` file and stores the result to `output` replacing any existing file.
    ///
    /// # Arguments
    /// * `input` - Input file path
    /// * `output` - Output file path
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        log::info!("sorting {} into {}", input.display(), output.display());

        let input = fs::File::open(input).map_err(SortError::Input)?;
        return self.sort_reader(input, output);
    }

    /// Sorts records fetched from `input` and stores the result to `output` replacing any existing file.
    pub fn sort_reader<R: Read>(&self, input: R, output: &Path) -> Result<SortSummary, SortError> {
        let runs = self.build_runs(input)?;
        let records: u64 = runs.iter().map(Run::len).sum();
        let runs_number = runs.len();

        let scheduled = self.merge_runs(runs)?;
        match scheduled.result {
            Some(run) => run.publish(output)?,
            None => run::publish_empty(output)?,
        }

        let summary = SortSummary {
            records,
            runs: runs_number,
            passes: scheduled.passes,
        };
        log::info!(
            "sorting done (records: {}, runs: {}, merge passes: {})",
            summary.records,
            summary.runs,
            summary.passes
        );

        return Ok(summary);
    }

    /// Splits the input into sorted runs. Every run but the last holds a full buffer of records.
    pub fn build_runs<R: Read>(&self, input: R) -> Result<Vec<Run>, SortError> {
        let mut reader = self.store.dialect().reader(input, self.rw_buf_size);
        let mut runs = Vec::new();

        loop {
            let mut buffer = self.buffer_builder.build();
            let read = reader.read_batch(&mut buffer).map_err(SortError::from_input)?;
            if read == 0 {
                break;
            }

            runs.push(self.create_run(buffer)?);
        }

        log::debug!("external sort preparation done ({} runs)", runs.len());

        return Ok(runs);
    }

    /// Merges runs until a single one remains.
    pub fn merge_runs(&self, runs: Vec<Run>) -> Result<Scheduled<Run>, SortError> {
        let key_order = self.key_order;
        let merger = RunMerger::new(&self.store, move |a: &Record, b: &Record| key_order.compare_records(a, b));
        let scheduler = &self.scheduler;

        self.thread_pool
            .install(|| scheduler.schedule(runs, |group| merger.merge(group)))
    }

    fn create_run(&self, mut buffer: B::Buffer) -> Result<Run, SortError> {
        let key_order = self.key_order;

        log::debug!("sorting run data ({} records) ...", buffer.len());
        self.thread_pool.install(|| buffer.sort(key_order));

        log::debug!("saving run data");
        return self.store.spill(buffer.into_records());
    }
}

#[cfg(unix)]
fn open_files_limit() -> Option<u64> {
    match rlimit::getrlimit(rlimit::Resource::NOFILE) {
        Ok((soft, _hard)) => Some(soft),
        Err(err) => {
            log::warn!("open files limit not available: {}", err);
            None
        }
    }
}

#[cfg(not(unix))]
fn open_files_limit() -> Option<u64> {
    None
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError, SortSummary};
    use crate::record::{Dialect, KeyOrder, Record};
    use crate::scheduler::MergePolicy;
    use crate::LimitedBufferBuilder;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn build_sorter(tmp_dir: &Path, batch_size: usize, policy: MergePolicy, fan_in: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(batch_size, true))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir)
            .with_merge_policy(policy)
            .with_fan_in(fan_in)
            .build()
            .unwrap()
    }

    fn write_records(path: &Path, records: &[Record]) {
        let mut writer = Dialect::default().writer(fs::File::create(path).unwrap(), None);
        for record in records {
            writer.write(record).unwrap();
        }
        writer.flush().unwrap();
    }

    fn read_records(path: &Path) -> Vec<Record> {
        let reader = Dialect::default().reader(fs::File::open(path).unwrap(), None);
        let records: Result<Vec<Record>, _> = reader.collect();
        records.unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<Record> {
        items.iter().map(|(key, value)| Record::new([*key, *value])).collect()
    }

    #[rstest]
    #[case(MergePolicy::BinaryTree, 2)]
    #[case(MergePolicy::KWay, 3)]
    #[case(MergePolicy::KWay, 64)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] policy: MergePolicy, #[case] fan_in: usize) {
        let input_sorted = Vec::from_iter((0..100).map(|item| Record::new([format!("{:03}", item), item.to_string()])));

        let mut input_shuffled = input_sorted.clone();
        input_shuffled.shuffle(&mut rand::thread_rng());

        let input_path = tmp_dir.path().join("input.csv");
        let output_path = tmp_dir.path().join("output.csv");
        write_records(&input_path, &input_shuffled);

        let sorter = build_sorter(tmp_dir.path(), 8, policy, fan_in);
        let summary = sorter.sort(&input_path, &output_path).unwrap();

        assert_eq!(read_records(&output_path), input_sorted);
        assert_eq!(summary.records, 100);
        assert_eq!(summary.runs, 13);
        assert_eq!(summary.passes, sorter.scheduler.passes(13));
        assert_eq!(fs::read_dir(sorter.tmp_dir()).unwrap().count(), 0);
    }

    #[rstest]
    #[case(MergePolicy::BinaryTree, 2)]
    #[case(MergePolicy::KWay, 4)]
    #[case(MergePolicy::KWay, 64)]
    fn test_external_sorter_stability(
        tmp_dir: tempfile::TempDir,
        #[case] policy: MergePolicy,
        #[case] fan_in: usize,
    ) {
        let input_sorted = Vec::from_iter((0..20).flat_map(|x| (0..5).map(move |y| (x, y))));

        let mut input_shuffled = input_sorted.clone();
        input_shuffled.shuffle(&mut rand::thread_rng());
        // sort input by the second field to check sorting stability
        input_shuffled.sort_by_key(|item| item.1);

        let to_records = |items: &[(i32, i32)]| {
            Vec::from_iter(items.iter().map(|(x, y)| Record::new([x.to_string(), y.to_string()])))
        };

        let input_path = tmp_dir.path().join("input.csv");
        let output_path = tmp_dir.path().join("output.csv");
        write_records(&input_path, &to_records(&input_shuffled));

        let sorter: ExternalSorter = ExternalSorterBuilder::new()
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .with_key_order(KeyOrder::Numeric)
            .with_merge_policy(policy)
            .with_fan_in(fan_in)
            .build()
            .unwrap();
        sorter.sort(&input_path, &output_path).unwrap();

        assert_eq!(read_records(&output_path), to_records(&input_sorted));
    }

    #[rstest]
    fn test_end_to_end_scenario(tmp_dir: tempfile::TempDir) {
        let input = "3,x\n1,y\n2,z\n1,w\n";
        let sorter = build_sorter(tmp_dir.path(), 2, MergePolicy::BinaryTree, 2);

        let runs = sorter.build_runs(input.as_bytes()).unwrap();
        let runs_content = Vec::from_iter(runs.iter().map(|run| read_records(run.path())));
        assert_eq!(
            runs_content,
            vec![pairs(&[("1", "y"), ("3", "x")]), pairs(&[("1", "w"), ("2", "z")])]
        );

        let output_path = tmp_dir.path().join("output.csv");
        let summary = sorter.sort_reader(input.as_bytes(), &output_path).unwrap();

        assert_eq!(
            read_records(&output_path),
            pairs(&[("1", "y"), ("1", "w"), ("2", "z"), ("3", "x")])
        );
        assert_eq!(
            summary,
            SortSummary {
                records: 4,
                runs: 2,
                passes: 1
            }
        );
    }

    #[rstest]
    #[case(0, 3)]
    #[case(1, 3)]
    #[case(7, 1)]
    #[case(8, 8)]
    #[case(9, 8)]
    #[case(100, 7)]
    fn test_runs_number(tmp_dir: tempfile::TempDir, #[case] records: usize, #[case] batch_size: usize) {
        let input: String = (0..records).rev().map(|i| format!("{},{}\n", i, i)).collect();
        let sorter = build_sorter(tmp_dir.path(), batch_size, MergePolicy::KWay, 16);

        let runs = sorter.build_runs(input.as_bytes()).unwrap();

        assert_eq!(runs.len(), (records + batch_size - 1) / batch_size);
        assert!(runs.iter().all(|run| run.len() > 0 && run.len() <= batch_size as u64));
        assert_eq!(runs.iter().map(|run| run.len()).sum::<u64>(), records as u64);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let input_path = tmp_dir.path().join("input.csv");
        let output_path = tmp_dir.path().join("output.csv");
        fs::write(&input_path, "").unwrap();
        fs::write(&output_path, "stale\n").unwrap();

        let sorter = build_sorter(tmp_dir.path(), 4, MergePolicy::KWay, 16);
        let summary = sorter.sort(&input_path, &output_path).unwrap();

        assert_eq!(fs::read_to_string(&output_path).unwrap(), "");
        assert_eq!(
            summary,
            SortSummary {
                records: 0,
                runs: 0,
                passes: 0
            }
        );
    }

    #[rstest]
    fn test_single_run_published_without_merge(tmp_dir: tempfile::TempDir) {
        let input_path = tmp_dir.path().join("input.csv");
        let output_path = tmp_dir.path().join("output.csv");
        fs::write(&input_path, "b,2\na,1\nc,3\n").unwrap();

        let sorter = build_sorter(tmp_dir.path(), 10, MergePolicy::KWay, 16);
        let summary = sorter.sort(&input_path, &output_path).unwrap();

        assert_eq!(fs::read_to_string(&output_path).unwrap(), "a,1\nb,2\nc,3\n");
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.passes, 0);
    }

    #[rstest]
    fn test_sorted_input_is_unchanged(tmp_dir: tempfile::TempDir) {
        let input_path = tmp_dir.path().join("input.csv");
        let first_path = tmp_dir.path().join("first.csv");
        let second_path = tmp_dir.path().join("second.csv");
        fs::write(&input_path, "k,\"a, b\"\nb,1\na,\"x\"\"y\"\nb,0\nc\n").unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2, MergePolicy::BinaryTree, 2);
        sorter.sort(&input_path, &first_path).unwrap();
        sorter.sort(&first_path, &second_path).unwrap();

        let first = fs::read(&first_path).unwrap();
        assert_eq!(first, fs::read(&second_path).unwrap());
        assert_eq!(
            read_records(&first_path),
            vec![
                Record::new(["a", "x\"y"]),
                Record::new(["b", "1"]),
                Record::new(["b", "0"]),
                Record::new(["c"]),
                Record::new(["k", "a, b"]),
            ]
        );
    }

    #[rstest]
    fn test_malformed_input(tmp_dir: tempfile::TempDir) {
        let input_path = tmp_dir.path().join("input.csv");
        let output_path = tmp_dir.path().join("output.csv");
        fs::write(&input_path, b"b,1\na,1\nc,\xff\n".as_slice()).unwrap();

        let sorter = build_sorter(tmp_dir.path(), 2, MergePolicy::KWay, 16);
        match sorter.sort(&input_path, &output_path) {
            Err(SortError::MalformedRecord(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(!output_path.exists());
        assert_eq!(fs::read_dir(sorter.tmp_dir()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_missing_input(tmp_dir: tempfile::TempDir) {
        let sorter = build_sorter(tmp_dir.path(), 2, MergePolicy::KWay, 16);
        let output_path = tmp_dir.path().join("output.csv");

        match sorter.sort(&tmp_dir.path().join("missing.csv"), &output_path) {
            Err(SortError::Input(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!output_path.exists());
    }

    #[rstest]
    fn test_default_fan_in(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter = ExternalSorterBuilder::new()
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        assert!(sorter.fan_in() >= 2);
        assert!(sorter.fan_in() <= super::MAX_FAN_IN);
    }
}
