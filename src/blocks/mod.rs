//! Read the same block out of many files at once and time every read.

use indicatif::ProgressBar;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::parallel::JobReport;
use crate::reader::{ParallelReader, SessionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    /// From just before open until the callback saw the opened file.
    pub t_open: Duration,
    /// From just before open until the block was copied out.
    pub t_total: Duration,
    /// Start of this read, relative to the start of the batch.
    pub t0: Duration,
    pub chunk_size: usize,
}

impl ReadStats {
    /// Time spent copying the block once the file was open.
    pub fn t_read(&self) -> Duration {
        self.t_total.saturating_sub(self.t_open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadParams {
    pub num_workers: usize,
    pub block: usize,
    pub block_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spread {
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Spread {
    fn of(values: impl IntoIterator<Item = Duration>) -> Option<Self> {
        let mut count = 0u32;
        let mut sum = Duration::ZERO;
        let mut min = Duration::MAX;
        let mut max = Duration::ZERO;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| Spread {
            mean: sum / count,
            min,
            max,
        })
    }
}

#[derive(Debug)]
pub struct BlockReport {
    /// Block bytes per input file, in input order. Empty when the file is
    /// shorter than the requested block or was never read.
    pub blocks: Vec<Vec<u8>>,
    pub stats: Vec<Option<ReadStats>>,
    pub params: ReadParams,
    pub t_total: Duration,
    pub job: JobReport,
}

impl BlockReport {
    pub fn files_read(&self) -> usize {
        self.stats.iter().flatten().count()
    }

    pub fn bytes_read(&self) -> usize {
        self.stats.iter().flatten().map(|s| s.chunk_size).sum()
    }

    pub fn open_times(&self) -> Option<Spread> {
        Spread::of(self.stats.iter().flatten().map(|s| s.t_open))
    }

    pub fn total_times(&self) -> Option<Spread> {
        Spread::of(self.stats.iter().flatten().map(|s| s.t_total))
    }

    pub fn read_times(&self) -> Option<Spread> {
        Spread::of(self.stats.iter().flatten().map(ReadStats::t_read))
    }

    /// Fraction of the busy time spent opening files.
    pub fn open_share(&self) -> f64 {
        let busy = self.busy_time().as_secs_f64();
        if busy > 0.0 {
            let open: Duration = self.stats.iter().flatten().map(|s| s.t_open).sum();
            open.as_secs_f64() / busy
        } else {
            0.0
        }
    }

    /// Hex sha256 of all blocks concatenated in input order. Two runs over
    /// the same files agree exactly when they fetched the same bytes.
    pub fn result_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for block in &self.blocks {
            hasher.update(block);
        }
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Sum of per-file read times, i.e. the work the threads did together.
    pub fn busy_time(&self) -> Duration {
        self.stats.iter().flatten().map(|s| s.t_total).sum()
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.t_total.as_secs_f64();
        if secs > 0.0 {
            self.bytes_read() as f64 / secs
        } else {
            0.0
        }
    }
}

type Output = Mutex<Option<(Vec<u8>, ReadStats)>>;

pub struct BlockReader {
    reader: ParallelReader,
}

impl BlockReader {
    pub fn new(num_workers: usize) -> Result<Self> {
        Ok(Self {
            reader: ParallelReader::new(num_workers)?,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.reader.num_workers()
    }

    pub fn reader(&self) -> &ParallelReader {
        &self.reader
    }

    pub fn warmup(&self) -> Result<Vec<SessionInfo>> {
        self.reader.warmup()
    }

    pub fn read_blocks(&self, paths: &[PathBuf], block: usize, block_size: usize) -> Result<BlockReport> {
        self.read_blocks_with_progress(paths, block, block_size, None)
    }

    /// Read block `block` of every file in `paths`. Each file writes only
    /// its own output slot, so slots never contend.
    pub fn read_blocks_with_progress(
        &self,
        paths: &[PathBuf],
        block: usize,
        block_size: usize,
        progress: Option<ProgressBar>,
    ) -> Result<BlockReport> {
        let t0 = Instant::now();
        let out: Arc<Vec<Output>> = Arc::new(paths.iter().map(|_| Mutex::new(None)).collect());

        let sink = Arc::clone(&out);
        let job = self.reader.process(
            paths.iter().cloned().enumerate(),
            move |file, idx: usize, timing| {
                let t1 = Instant::now();
                let data = file.block(block, block_size).unwrap_or(&[]).to_vec();
                let t2 = Instant::now();

                let stats = ReadStats {
                    t_open: t1 - timing.t0,
                    t_total: t2 - timing.t0,
                    t0: timing.t0.saturating_duration_since(t0),
                    chunk_size: data.len(),
                };
                *sink[idx].lock() = Some((data, stats));

                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                Ok(())
            },
        )?;
        let t_total = t0.elapsed();

        let (blocks, stats) = out
            .iter()
            .map(|slot| match slot.lock().take() {
                Some((data, stats)) => (data, Some(stats)),
                None => (Vec::new(), None),
            })
            .unzip();

        Ok(BlockReport {
            blocks,
            stats,
            params: ReadParams {
                num_workers: self.num_workers(),
                block,
                block_size,
            },
            t_total,
            job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread() {
        let spread = Spread::of([1, 2, 6].map(Duration::from_millis)).unwrap();
        assert_eq!(spread.mean, Duration::from_millis(3));
        assert_eq!(spread.min, Duration::from_millis(1));
        assert_eq!(spread.max, Duration::from_millis(6));
        assert_eq!(Spread::of(std::iter::empty()), None);
    }

    #[test]
    fn test_result_hash_of_empty_report() {
        let report = BlockReport {
            blocks: Vec::new(),
            stats: Vec::new(),
            params: ReadParams {
                num_workers: 1,
                block: 0,
                block_size: 1,
            },
            t_total: Duration::ZERO,
            job: JobReport {
                workers: 1,
                enqueued: 0,
                delivered: 0,
                dropped: 0,
                aborted: false,
            },
        };
        assert_eq!(
            report.result_hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(report.read_times(), None);
        assert_eq!(report.open_share(), 0.0);
    }
}
