//! Progress estimation.
//!
//! The pipeline itself is single-threaded. The only state it shares with the background
//! tracker is a [`ProgressCounter`], which the pipeline bumps in batches and the tracker
//! reads periodically. Reports are best-effort estimates.

use std::io;
use std::io::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use log;

use crate::source::DELIMITER;

/// Number of increments accumulated locally before they are published to the shared counter.
pub const COUNTER_BATCH_SIZE: u64 = 1024;

/// Process-wide progress counter, safe to increment and read concurrently.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    value: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        ProgressCounter::default()
    }

    pub fn add(&self, steps: u64) {
        self.value.fetch_add(steps, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Local accumulator publishing increments to a [`ProgressCounter`] every [`COUNTER_BATCH_SIZE`]
/// steps and when dropped.
pub struct CounterBatch<'a> {
    counter: &'a ProgressCounter,
    pending: u64,
}

impl<'a> CounterBatch<'a> {
    pub fn new(counter: &'a ProgressCounter) -> Self {
        CounterBatch { counter, pending: 0 }
    }

    pub fn add(&mut self, steps: u64) {
        self.pending += steps;
        if self.pending >= COUNTER_BATCH_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.pending > 0 {
            self.counter.add(std::mem::take(&mut self.pending));
        }
    }
}

impl Drop for CounterBatch<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Background progress tracker.
///
/// Pre-counts the records of an independent stream over the same content, then reports the shared
/// counter as a fraction of the expected number of steps on every tick. Every record is counted twice by
/// the pipeline (once when read, once when written or skipped), so the expected total is twice the line count.
pub struct ProgressTracker {
    interval: Duration,
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        ProgressTracker { interval }
    }

    /// Runs the tracker until `cancel` receives a message or its sender is dropped.
    /// Returns an error only if the pre-count pass failed.
    pub fn run<R: BufRead>(&self, counter: &ProgressCounter, input: R, cancel: mpsc::Receiver<()>) -> io::Result<()> {
        let lines = match count_lines(input, &cancel) {
            Ok(Some(lines)) => lines,
            Ok(None) => return Ok(()),
            Err(err) => {
                log::warn!("progress pre-count failed, progress will not be reported: {}", err);
                return Err(err);
            }
        };

        let expected = lines.saturating_mul(2);
        log::info!("progress: input holds {} lines", lines);

        loop {
            match cancel.recv_timeout(self.interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let done = counter.get();
                    log::info!(
                        "progress: {:.2}% ({} of ~{} steps)",
                        fraction_done(done, expected) * 100.0,
                        done,
                        expected
                    );
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

/// Fraction of the expected steps done, clamped to `[0, 1]`.
pub fn fraction_done(done: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 1.0;
    }
    (done as f64 / expected as f64).min(1.0)
}

/// Counts records in the stream. Returns `None` if cancelled before the end of the stream.
fn count_lines<R: BufRead>(mut input: R, cancel: &mpsc::Receiver<()>) -> io::Result<Option<u64>> {
    let mut lines = 0;
    let mut pending_record = false;

    loop {
        match cancel.try_recv() {
            Err(mpsc::TryRecvError::Empty) => {}
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => return Ok(None),
        }

        let buf = match input.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if buf.is_empty() {
            break;
        }

        lines += buf.iter().filter(|&&byte| byte == DELIMITER).count() as u64;
        pending_record = buf.last() != Some(&DELIMITER);

        let consumed = buf.len();
        input.consume(consumed);
    }

    if pending_record {
        lines += 1;
    }

    return Ok(Some(lines));
}
