//! External deduplicator.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log;
use rayon::prelude::*;

use crate::buffer::{DedupBuffer, DedupBufferBuilder, MemoryLimitedSetBuilder};
use crate::chunk::{ExternalChunk, LineChunk};
use crate::filter::LineFilter;
use crate::merger::DedupMerger;
use crate::progress::{CounterBatch, ProgressCounter, ProgressTracker};
use crate::source::DELIMITER;
use crate::Record;

/// Default chunk and destination read/write buffer size.
pub const DEFAULT_RW_BUF_SIZE: usize = 256 * 1024;
/// Default maximum number of chunks merged at once.
pub const DEFAULT_MERGE_FAN_IN: usize = 512;
/// Default progress report period.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Deduplication error.
#[derive(Debug)]
pub enum DedupError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input data stream error.
    Input(io::Error),
    /// Destination or chunk write error.
    Output(io::Error),
    /// Chunk read error.
    Chunk(io::Error),
    /// Progress input data stream error.
    Progress(io::Error),
}

impl Error for DedupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            DedupError::TempDir(err) => err,
            DedupError::ThreadPoolBuildError(err) => err,
            DedupError::Input(err) => err,
            DedupError::Output(err) => err,
            DedupError::Chunk(err) => err,
            DedupError::Progress(err) => err,
        })
    }
}

impl Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            DedupError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            DedupError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            DedupError::Input(err) => write!(f, "input data stream error: {}", err),
            DedupError::Output(err) => write!(f, "data writing error: {}", err),
            DedupError::Chunk(err) => write!(f, "chunk reading error: {}", err),
            DedupError::Progress(err) => write!(f, "progress input data stream error: {}", err),
        }
    }
}

/// Deduplication run statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Records read from the input.
    pub records_read: u64,
    /// Records dropped by the line filter.
    pub records_filtered: u64,
    /// Distinct records written to the destination.
    pub records_written: u64,
    /// Records pulled from chunks by the final merge, written or skipped as duplicates.
    pub records_merged: u64,
    /// Temporary chunks created, intermediate merge results included.
    pub chunks_created: u64,
    /// Intermediate merge passes performed because of the merge fan-in limit.
    pub merge_passes: u64,
}

impl DedupStats {
    /// Number of duplicate records removed.
    pub fn duplicates(&self) -> u64 {
        self.records_read - self.records_filtered - self.records_written
    }
}

/// External deduplicator builder. Provides methods for [`ExternalDeduper`] initialization.
pub struct ExternalDeduperBuilder<B = MemoryLimitedSetBuilder, C = LineChunk>
where
    B: DedupBufferBuilder,
    C: ExternalChunk,
{
    /// Number of threads to be used to sort spilled records in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk and destination read/write buffer size.
    rw_buf_size: usize,
    /// Maximum number of chunks merged at once.
    merge_fan_in: usize,
    /// Progress report period.
    progress_interval: Duration,
    /// Skip patterns.
    filter: LineFilter,
    /// Working set builder.
    buffer_builder: B,

    /// External chunk type.
    external_chunk_type: PhantomData<C>,
}

impl<B, C> ExternalDeduperBuilder<B, C>
where
    B: DedupBufferBuilder,
    C: ExternalChunk,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalDeduperBuilder::default()
    }

    /// Builds an [`ExternalDeduper`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalDeduper<B, C>, DedupError> {
        return Ok(ExternalDeduper {
            thread_pool: init_thread_pool(self.threads_number)?,
            tmp_dir: init_tmp_directory(self.tmp_dir.as_deref())?,
            buffer_builder: self.buffer_builder,
            filter: self.filter,
            rw_buf_size: self.rw_buf_size,
            merge_fan_in: self.merge_fan_in,
            progress_interval: self.progress_interval,
            external_chunk_type: PhantomData,
        });
    }

    /// Sets number of threads to be used to sort spilled records in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalDeduperBuilder<B, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalDeduperBuilder<B, C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets working set builder. The builder defines when the working set is spilled to a chunk.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalDeduperBuilder<B, C> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets skip patterns.
    pub fn with_filter(mut self, filter: LineFilter) -> ExternalDeduperBuilder<B, C> {
        self.filter = filter;
        return self;
    }

    /// Sets chunk and destination read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalDeduperBuilder<B, C> {
        self.rw_buf_size = buf_size.max(1);
        return self;
    }

    /// Sets maximum number of chunks merged at once (at least 2).
    pub fn with_merge_fan_in(mut self, merge_fan_in: usize) -> ExternalDeduperBuilder<B, C> {
        self.merge_fan_in = merge_fan_in.max(2);
        return self;
    }

    /// Sets progress report period.
    pub fn with_progress_interval(mut self, interval: Duration) -> ExternalDeduperBuilder<B, C> {
        self.progress_interval = interval;
        return self;
    }
}

impl<B, C> Default for ExternalDeduperBuilder<B, C>
where
    B: DedupBufferBuilder,
    C: ExternalChunk,
{
    fn default() -> Self {
        ExternalDeduperBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: DEFAULT_RW_BUF_SIZE,
            merge_fan_in: DEFAULT_MERGE_FAN_IN,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            filter: LineFilter::default(),
            buffer_builder: B::default(),
            external_chunk_type: PhantomData,
        }
    }
}

fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, DedupError> {
    let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

    if let Some(threads_number) = threads_number {
        log::info!("initializing thread-pool (threads: {})", threads_number);
        thread_pool_builder = thread_pool_builder.num_threads(threads_number);
    } else {
        log::info!("initializing thread-pool (threads: default)");
    }
    let thread_pool = thread_pool_builder
        .build()
        .map_err(|err| DedupError::ThreadPoolBuildError(err))?;

    return Ok(thread_pool);
}

fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, DedupError> {
    let tmp_dir = if let Some(tmp_path) = tmp_path {
        tempfile::tempdir_in(tmp_path)
    } else {
        tempfile::tempdir()
    }
    .map_err(|err| DedupError::TempDir(err))?;

    log::info!("using {} as a temporary directory", tmp_dir.path().display());

    return Ok(tmp_dir);
}

/// External deduplicator.
///
/// Reads records into an in-memory working set, spilling it as a sorted chunk whenever the set reaches its
/// limit, then merges all chunks into the destination emitting every distinct record once, in ascending
/// byte order. If nothing was spilled the working set is written straight to the destination.
///
/// Chunks live in a temporary directory owned by the deduplicator and are removed as soon as they are
/// merged, or when a run fails. The destination is never removed.
pub struct ExternalDeduper<B = MemoryLimitedSetBuilder, C = LineChunk>
where
    B: DedupBufferBuilder,
    C: ExternalChunk,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Working set builder.
    buffer_builder: B,
    /// Skip patterns.
    filter: LineFilter,
    /// Chunk and destination read/write buffer size.
    rw_buf_size: usize,
    /// Maximum number of chunks merged at once.
    merge_fan_in: usize,
    /// Progress report period.
    progress_interval: Duration,

    /// External chunk type.
    external_chunk_type: PhantomData<C>,
}

impl<B, C> ExternalDeduper<B, C>
where
    B: DedupBufferBuilder,
    C: ExternalChunk,
{
    /// Returns the temporary directory chunks are stored in.
    pub fn tmp_path(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Deduplicates records from the input, writing the sorted distinct records to the output.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `output` - Destination the result is written to, newline-delimited
    pub fn dedup<I, W>(&self, input: I, output: &mut W) -> Result<DedupStats, DedupError>
    where
        I: IntoIterator<Item = io::Result<Record>>,
        W: Write,
    {
        let counter = ProgressCounter::new();
        return self.run(input, output, &counter);
    }

    /// Deduplicates records from the input reporting progress in the background.
    ///
    /// The tracker pre-counts records of `progress_input`, an independent stream over the same content as
    /// `input`, and logs the estimated completion periodically. It is stopped as soon as the deduplication
    /// finishes. A `progress_input` read error is returned only if the deduplication itself succeeded:
    /// the tracker is observational, so its failure neither interrupts the run nor hides a run error.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `output` - Destination the result is written to, newline-delimited
    /// * `progress_input` - Second stream over the input content used to estimate the total amount of work
    pub fn dedup_with_progress<I, W, P>(
        &self,
        input: I,
        output: &mut W,
        progress_input: P,
    ) -> Result<DedupStats, DedupError>
    where
        I: IntoIterator<Item = io::Result<Record>>,
        W: Write,
        P: BufRead + Send,
    {
        let counter = ProgressCounter::new();
        let tracker = ProgressTracker::new(self.progress_interval);

        let (result, progress_result) = thread::scope(|s| {
            let (cancel_tx, cancel_rx) = mpsc::channel();
            let worker = s.spawn(|| tracker.run(&counter, progress_input, cancel_rx));

            let result = self.run(input, output, &counter);

            drop(cancel_tx);
            let progress_result = match worker.join() {
                Ok(progress_result) => progress_result,
                Err(_) => {
                    log::warn!("progress tracker panicked");
                    Ok(())
                }
            };

            (result, progress_result)
        });

        let stats = result?;
        progress_result.map_err(|err| DedupError::Progress(err))?;

        return Ok(stats);
    }

    fn run<I, W>(&self, input: I, output: &mut W, counter: &ProgressCounter) -> Result<DedupStats, DedupError>
    where
        I: IntoIterator<Item = io::Result<Record>>,
        W: Write,
    {
        log::info!("starting deduplication ...");

        let mut stats = DedupStats::default();
        let mut output = io::BufWriter::with_capacity(self.rw_buf_size, output);

        let chunks = self.split_sort_dedup(input, &mut output, counter, &mut stats)?;
        if !chunks.is_empty() {
            self.merge_chunks(chunks, &mut output, counter, &mut stats)?;
        }

        output.flush().map_err(|err| DedupError::Output(err))?;

        log::info!(
            "deduplication done (read: {}, filtered: {}, duplicates: {}, written: {}, chunks: {})",
            stats.records_read,
            stats.records_filtered,
            stats.duplicates(),
            stats.records_written,
            stats.chunks_created,
        );

        return Ok(stats);
    }

    /// Reads the input into working sets, spilling each full one as a sorted chunk.
    /// Returns the chunks to be merged. If nothing was spilled, the records are written directly to the
    /// output and no chunks are returned.
    fn split_sort_dedup<I, W>(
        &self,
        input: I,
        output: &mut W,
        counter: &ProgressCounter,
        stats: &mut DedupStats,
    ) -> Result<Vec<C>, DedupError>
    where
        I: IntoIterator<Item = io::Result<Record>>,
        W: Write,
    {
        let mut progress = CounterBatch::new(counter);
        let mut working_set = self.buffer_builder.build();
        let mut external_chunks = Vec::new();

        for record in input.into_iter() {
            let record = record.map_err(|err| DedupError::Input(err))?;
            stats.records_read += 1;
            progress.add(1);

            if self.filter.is_match(&record) {
                stats.records_filtered += 1;
                continue;
            }

            if working_set.contains(&record) {
                continue;
            }

            if working_set.would_overflow(&record) {
                external_chunks.push(self.create_chunk(working_set, stats)?);
                working_set = self.buffer_builder.build();
            }

            working_set.insert(record);
        }

        if working_set.is_empty() {
            log::debug!("no records to deduplicate");
            return Ok(external_chunks);
        }

        if external_chunks.is_empty() {
            log::debug!("distinct records fit in memory, writing them to the destination directly");
            for record in self.sort_records(working_set) {
                write_record(output, &record).map_err(|err| DedupError::Output(err))?;
                stats.records_written += 1;
                progress.add(1);
            }
        } else {
            external_chunks.push(self.create_chunk(working_set, stats)?);
        }

        log::debug!("external deduplication preparation done");

        return Ok(external_chunks);
    }

    fn merge_chunks<W: Write>(
        &self,
        mut chunks: Vec<C>,
        output: &mut W,
        counter: &ProgressCounter,
        stats: &mut DedupStats,
    ) -> Result<(), DedupError> {
        while chunks.len() > self.merge_fan_in {
            chunks = self.merge_pass(chunks, stats)?;
        }

        log::debug!("merging {} chunks into the destination ...", chunks.len());

        let mut progress = CounterBatch::new(counter);
        let mut merger = DedupMerger::new(chunks);

        while let Some(record) = merger.next() {
            let record = record.map_err(|err| DedupError::Chunk(err))?;
            write_record(output, &record).map_err(|err| DedupError::Output(err))?;
            stats.records_written += 1;

            let merged = 1 + merger.take_skipped();
            stats.records_merged += merged;
            progress.add(merged);
        }

        let skipped = merger.take_skipped();
        stats.records_merged += skipped;
        progress.add(skipped);

        return Ok(());
    }

    /// Merges chunks in groups of at most `merge_fan_in` into intermediate chunks.
    fn merge_pass(&self, chunks: Vec<C>, stats: &mut DedupStats) -> Result<Vec<C>, DedupError> {
        log::debug!(
            "intermediate merge pass (chunks: {}, fan-in: {})",
            chunks.len(),
            self.merge_fan_in
        );
        stats.merge_passes += 1;

        let mut merged = Vec::new();
        let mut chunks = chunks.into_iter();

        loop {
            let mut group = Vec::from_iter(chunks.by_ref().take(self.merge_fan_in));
            if group.len() <= 1 {
                merged.append(&mut group);
                break;
            }

            let mut read_error = None;
            let records = DedupMerger::new(group).map_while(|record| match record {
                Ok(record) => Some(record),
                Err(err) => {
                    read_error = Some(err);
                    None
                }
            });

            let chunk = C::build(self.tmp_dir.path(), records, Some(self.rw_buf_size))
                .map_err(|err| DedupError::Output(err))?;
            if let Some(err) = read_error {
                return Err(DedupError::Chunk(err));
            }

            stats.chunks_created += 1;
            merged.push(chunk);
        }

        return Ok(merged);
    }

    fn create_chunk(&self, working_set: B::Buffer, stats: &mut DedupStats) -> Result<C, DedupError> {
        log::debug!(
            "sorting chunk data (records: {}, bytes: {}) ...",
            working_set.len(),
            working_set.mem_size()
        );
        let records = self.sort_records(working_set);

        log::debug!("saving chunk data");
        let external_chunk = C::build(self.tmp_dir.path(), records, Some(self.rw_buf_size))
            .map_err(|err| DedupError::Output(err))?;
        stats.chunks_created += 1;

        return Ok(external_chunk);
    }

    fn sort_records(&self, working_set: B::Buffer) -> Vec<Record> {
        let mut records = Vec::from_iter(working_set);
        self.thread_pool.install(|| {
            records.par_sort_unstable();
        });

        return records;
    }
}

fn write_record<W: Write>(output: &mut W, record: &[u8]) -> io::Result<()> {
    output.write_all(record)?;
    output.write_all(&[DELIMITER])
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{DedupError, ExternalDeduper, ExternalDeduperBuilder};
    use crate::buffer::{CountLimitedSetBuilder, MemoryLimitedSetBuilder};
    use crate::filter::LineFilter;
    use crate::progress::ProgressCounter;
    use crate::source::LineSource;

    const STRLEN: usize = 50;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    /// Generates `total` newline-terminated lines holding exactly `distinct` distinct hex strings, shuffled.
    fn generate_input(distinct: usize, total: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();

        let mut values = BTreeSet::new();
        while values.len() < distinct {
            let value: String = (0..STRLEN)
                .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
                .collect();
            values.insert(value);
        }
        let values = Vec::from_iter(values);

        let mut lines = values.clone();
        while lines.len() < total {
            lines.push(values.choose(&mut rng).unwrap().clone());
        }
        lines.shuffle(&mut rng);

        return lines.into_iter().flat_map(|line| format!("{}\n", line).into_bytes()).collect();
    }

    /// Reference result: sorted distinct lines.
    fn expected_output(input: &[u8], skip: &LineFilter) -> Vec<u8> {
        let lines: BTreeSet<Vec<u8>> = LineSource::new(input)
            .map(Result::unwrap)
            .filter(|line| !skip.is_match(line))
            .collect();

        let mut output = Vec::new();
        for line in lines {
            output.extend_from_slice(&line);
            output.push(b'\n');
        }
        return output;
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    file_count(&entry.path())
                } else {
                    1
                }
            })
            .sum()
    }

    fn deduper(tmp_dir: &tempfile::TempDir, threshold: u64) -> ExternalDeduper {
        ExternalDeduperBuilder::new()
            .with_buffer(MemoryLimitedSetBuilder::new(threshold))
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap()
    }

    fn line_count(output: &[u8]) -> usize {
        output.iter().filter(|&&byte| byte == b'\n').count()
    }

    fn is_sorted_and_distinct(output: &[u8]) -> bool {
        let lines = Vec::from_iter(output.split(|&byte| byte == b'\n'));
        lines[..lines.len().saturating_sub(1)].windows(2).all(|pair| pair[0] < pair[1])
    }

    #[rstest]
    fn test_spilling_dedup(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 204);
        // roughly 20 distinct lines per chunk
        let deduper = deduper(&tmp_dir, 20 * (STRLEN as u64 + 1));

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(input.as_slice()), &mut output).unwrap();

        assert_eq!(line_count(&output), 100);
        assert!(is_sorted_and_distinct(&output));
        assert_eq!(output, expected_output(&input, &LineFilter::default()));

        assert_eq!(stats.records_read, 204);
        assert_eq!(stats.records_written, 100);
        assert_eq!(stats.duplicates(), 104);
        assert!(stats.chunks_created >= 5);
        assert_eq!(file_count(tmp_dir.path()), 0);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let deduper = deduper(&tmp_dir, 10);

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(b"".as_slice()), &mut output).unwrap();

        assert!(output.is_empty());
        assert_eq!(stats.chunks_created, 0);
        assert_eq!(stats.records_written, 0);
        assert_eq!(file_count(tmp_dir.path()), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(u64::MAX)]
    fn test_identical_lines(tmp_dir: tempfile::TempDir, #[case] threshold: u64) {
        let input = "same line\n".repeat(50);
        let deduper = deduper(&tmp_dir, threshold);

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(input.as_bytes()), &mut output).unwrap();

        assert_eq!(output, b"same line\n".to_vec());
        assert_eq!(stats.duplicates(), 49);
    }

    #[rstest]
    fn test_skip_pattern(tmp_dir: tempfile::TempDir) {
        let mut input = generate_input(100, 201);
        input.extend_from_slice(b"skip-one\nskip-two\nskip-three\n");
        let filter = LineFilter::compile(["^skip-"]).unwrap();

        let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
            .with_buffer(MemoryLimitedSetBuilder::new(20 * (STRLEN as u64 + 1)))
            .with_filter(filter.clone())
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(input.as_slice()), &mut output).unwrap();

        assert_eq!(line_count(&output), 100);
        assert!(!output.windows(5).any(|window| window == b"skip-"));
        assert_eq!(output, expected_output(&input, &filter));
        assert_eq!(stats.records_read, 204);
        assert_eq!(stats.records_filtered, 3);
    }

    #[rstest]
    fn test_threshold_invariance(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 300);

        let outputs = Vec::from_iter([1, 64, 1000, 10_000, u64::MAX].into_iter().map(|threshold| {
            let mut output = Vec::new();
            deduper(&tmp_dir, threshold)
                .dedup(LineSource::new(input.as_slice()), &mut output)
                .unwrap();
            output
        }));

        for output in &outputs {
            assert_eq!(output, &outputs[0]);
        }
        assert_eq!(outputs[0], expected_output(&input, &LineFilter::default()));
    }

    #[rstest]
    fn test_direct_path_and_one_chunk_per_line(tmp_dir: tempfile::TempDir) {
        let input = generate_input(40, 40);

        let mut direct = Vec::new();
        let direct_stats = deduper(&tmp_dir, u64::MAX)
            .dedup(LineSource::new(input.as_slice()), &mut direct)
            .unwrap();

        let mut spilled = Vec::new();
        let spilled_stats = deduper(&tmp_dir, 1)
            .dedup(LineSource::new(input.as_slice()), &mut spilled)
            .unwrap();

        assert_eq!(direct_stats.chunks_created, 0);
        assert_eq!(spilled_stats.chunks_created, 40);
        assert_eq!(direct, spilled);
    }

    #[rstest]
    fn test_idempotence(tmp_dir: tempfile::TempDir) {
        let input = generate_input(150, 400);
        let deduper = deduper(&tmp_dir, 1024);

        let mut once = Vec::new();
        deduper.dedup(LineSource::new(input.as_slice()), &mut once).unwrap();

        let mut twice = Vec::new();
        deduper.dedup(LineSource::new(once.as_slice()), &mut twice).unwrap();

        assert_eq!(once, twice);
    }

    #[rstest]
    fn test_multiple_inputs_are_joined(tmp_dir: tempfile::TempDir) {
        // "c" has no newline, so it runs into the first line of the next input
        let streams: Vec<&[u8]> = vec![b"b\na\nc", b"c\nd\n", b"a"];
        let deduper = deduper(&tmp_dir, 4);

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::concat(streams), &mut output).unwrap();

        assert_eq!(output, b"a\nb\ncc\nd\n".to_vec());
        assert_eq!(stats.records_read, 5);
    }

    #[rstest]
    fn test_count_limited_buffer(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 204);

        let deduper: ExternalDeduper<CountLimitedSetBuilder> = ExternalDeduperBuilder::new()
            .with_buffer(CountLimitedSetBuilder::new(20, true))
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(input.as_slice()), &mut output).unwrap();

        // values already spilled are admitted again when they reappear in a later cycle
        assert!(stats.chunks_created >= 5);
        assert_eq!(output, expected_output(&input, &LineFilter::default()));
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    fn test_multi_pass_merge(tmp_dir: tempfile::TempDir, #[case] fan_in: usize) {
        let input = generate_input(60, 200);

        let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
            .with_buffer(MemoryLimitedSetBuilder::new(3 * (STRLEN as u64 + 1)))
            .with_merge_fan_in(fan_in)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = deduper.dedup(LineSource::new(input.as_slice()), &mut output).unwrap();

        assert!(stats.merge_passes > 0);
        assert_eq!(stats.records_written, 60);
        assert_eq!(output, expected_output(&input, &LineFilter::default()));
        assert_eq!(file_count(tmp_dir.path()), 0);
    }

    #[rstest]
    fn test_progress_counter_direct_path(tmp_dir: tempfile::TempDir) {
        // enough records to publish several full batches plus a leftover
        let input: Vec<u8> = (0..3000).flat_map(|i| format!("line-{}\n", i % 700).into_bytes()).collect();
        let deduper = deduper(&tmp_dir, u64::MAX);

        let counter = ProgressCounter::new();
        let mut output = Vec::new();
        let stats = deduper
            .run(LineSource::new(input.as_slice()), &mut output, &counter)
            .unwrap();

        assert_eq!(stats.chunks_created, 0);
        assert_eq!(stats.records_read, 3000);
        assert_eq!(stats.records_written, 700);
        assert_eq!(stats.records_merged, 0);
        assert_eq!(counter.get(), 3700);
    }

    #[rstest]
    fn test_progress_counter_spilling_path(tmp_dir: tempfile::TempDir) {
        // a set of two: {a, b} and {a, c} are spilled, {b, c} is the final chunk
        let input = b"a\nb\nc\na\nb\nc\n";
        let deduper: ExternalDeduper<CountLimitedSetBuilder> = ExternalDeduperBuilder::new()
            .with_buffer(CountLimitedSetBuilder::new(2, false))
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let counter = ProgressCounter::new();
        let mut output = Vec::new();
        let stats = deduper
            .run(LineSource::new(input.as_slice()), &mut output, &counter)
            .unwrap();

        assert_eq!(output, b"a\nb\nc\n".to_vec());
        assert_eq!(stats.chunks_created, 3);
        assert_eq!(stats.records_merged, 6);
        // 6 reads, 3 writes, 3 duplicates skipped during the merge
        assert_eq!(counter.get(), 12);
    }

    #[rstest]
    fn test_progress_counter_with_generated_input(tmp_dir: tempfile::TempDir) {
        let input = generate_input(500, 3000);
        let deduper = deduper(&tmp_dir, 40 * (STRLEN as u64 + 1));

        let counter = ProgressCounter::new();
        let mut output = Vec::new();
        let stats = deduper
            .run(LineSource::new(input.as_slice()), &mut output, &counter)
            .unwrap();

        assert!(stats.chunks_created > 1);
        assert_eq!(stats.records_written, 500);
        assert!(stats.records_merged >= stats.records_written);
        assert_eq!(counter.get(), stats.records_read + stats.records_merged);
    }

    struct FailingWriter {
        written: usize,
        limit: usize,
    }

    impl io::Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[rstest]
    fn test_cleanup_after_merge_failure(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 204);

        let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
            .with_buffer(MemoryLimitedSetBuilder::new(10 * (STRLEN as u64 + 1)))
            .with_rw_buf_size(64)
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = FailingWriter { written: 0, limit: 1000 };
        let result = deduper.dedup(LineSource::new(input.as_slice()), &mut output);

        assert!(matches!(result, Err(DedupError::Output(_))));
        assert_eq!(file_count(tmp_dir.path()), 0);
    }

    #[rstest]
    fn test_cleanup_after_input_failure(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 100);
        let records = LineSource::new(input.as_slice())
            .take(60)
            .chain([Err(io::Error::new(io::ErrorKind::Other, "test error"))]);

        let deduper = deduper(&tmp_dir, 10 * (STRLEN as u64 + 1));

        let mut output = Vec::new();
        let result = deduper.dedup(records, &mut output);

        match result {
            Err(DedupError::Input(err)) => assert_eq!(err.to_string(), "test error"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(output.is_empty());
        assert_eq!(file_count(tmp_dir.path()), 0);
    }

    #[rstest]
    fn test_dedup_with_progress(tmp_dir: tempfile::TempDir) {
        let input = generate_input(100, 204);

        let deduper: ExternalDeduper = ExternalDeduperBuilder::new()
            .with_buffer(MemoryLimitedSetBuilder::new(20 * (STRLEN as u64 + 1)))
            .with_progress_interval(Duration::from_millis(1))
            .with_tmp_dir(tmp_dir.path())
            .build()
            .unwrap();

        let mut output = Vec::new();
        let stats = deduper
            .dedup_with_progress(LineSource::new(input.as_slice()), &mut output, input.as_slice())
            .unwrap();

        assert_eq!(stats.records_written, 100);
        assert_eq!(output, expected_output(&input, &LineFilter::default()));
    }

    #[rstest]
    fn test_progress_input_failure(tmp_dir: tempfile::TempDir) {
        struct Broken;

        impl io::Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "test error"))
            }
        }

        let input = generate_input(10, 20);
        let deduper = deduper(&tmp_dir, u64::MAX);

        let mut output = Vec::new();
        let result = deduper.dedup_with_progress(
            LineSource::new(input.as_slice()),
            &mut output,
            io::BufReader::new(Broken),
        );

        assert!(matches!(result, Err(DedupError::Progress(_))));
        assert_eq!(output, expected_output(&input, &LineFilter::default()));
    }
}
