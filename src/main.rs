use std::path::PathBuf;
use std::time::Instant;
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pstream::blocks::{BlockReader, BlockReport};
use pstream::io::{create_progress_bar, load_file_list};
use pstream::parallel::default_num_workers;

#[derive(Parser, Debug)]
#[command(name = "pstream")]
#[command(about = "Read one block from many files in parallel on a persistent thread pool", long_about = None)]
struct Args {
    /// File containing paths to read, one per line
    #[arg(value_name = "FILE_LIST")]
    file_list: PathBuf,

    /// Number of worker threads (defaults to number of CPU cores, at most 8)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Which block of every file to read
    #[arg(short, long, default_value_t = 0)]
    block: usize,

    /// Block size in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    block_size: usize,

    /// Skip reading one file per thread before the measured pass
    #[arg(long)]
    no_warmup_more: bool,

    /// Disable progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "pstream=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(report: &BlockReport) {
    let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;

    println!("\nFiles read       : {}", report.files_read());
    println!("Total data bytes : {}", report.bytes_read());
    println!("Threads          : {}", report.params.num_workers);
    if let (Some(open), Some(read), Some(total)) =
        (report.open_times(), report.read_times(), report.total_times())
    {
        println!(
            "Per file total   : {:7.3} [{:.1}..{:.1}] ms",
            ms(total.mean),
            ms(total.min),
            ms(total.max)
        );
        println!(
            "Per file open    : {:7.3} [{:.1}..{:.1}] ms",
            ms(open.mean),
            ms(open.min),
            ms(open.max)
        );
        println!(
            "Per file read    : {:7.3} [{:.1}..{:.1}] ms",
            ms(read.mean),
            ms(read.min),
            ms(read.max)
        );
        let share = report.open_share() * 100.0;
        println!("Open/read share  : {:.0}% / {:.0}%", share, 100.0 - share);
    }
    println!("Busy time        : {:.2?}", report.busy_time());
    println!("Wall time        : {:.2?}", report.t_total);
    println!(
        "Throughput       : {:.2} MB/s",
        report.throughput() / (1024.0 * 1024.0)
    );
    println!("Result hash      : {}", report.result_hash());
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.block_size == 0 {
        anyhow::bail!("Block size must be greater than zero");
    }

    let files = load_file_list(&args.file_list)
        .with_context(|| format!("Failed to load file list: {}", args.file_list.display()))?;
    if files.is_empty() {
        anyhow::bail!("File list is empty: {}", args.file_list.display());
    }

    let threads = args.threads.unwrap_or_else(default_num_workers);
    println!("Reading block {} ({} bytes) from {} files", args.block, args.block_size, files.len());
    println!("Using {} worker threads", threads);

    let start_time = Instant::now();
    let reader = BlockReader::new(threads).context("Failed to start worker pool")?;
    reader.warmup().context("Warmup failed")?;
    println!("Worker threads ready in {:.2?}", start_time.elapsed());

    if !args.no_warmup_more {
        let nwarm = files.len().min(threads);
        println!("Will read {} files for warmup first", nwarm);
        let warm = reader.read_blocks(&files[files.len() - nwarm..], args.block, args.block_size)?;
        println!("Done in {:.2?}", warm.t_total);
    }

    let progress = if !args.quiet {
        Some(create_progress_bar(files.len()))
    } else {
        None
    };

    let report = reader.read_blocks_with_progress(&files, args.block, args.block_size, progress.clone())?;

    if let Some(ref pb) = progress {
        pb.finish_with_message("Read complete");
    }

    print_summary(&report);

    Ok(())
}
