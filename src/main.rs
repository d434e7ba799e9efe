use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytesize::ByteSize;
use clap::Parser;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;

use btsample::classify::SelectionPolicy;
use btsample::eventloop::{self, RunEnd, StopConditions};
use btsample::export;
use btsample::report;
use btsample::sampler::{self, WorkerOptions};
use btsample::state::GlobalState;
use btsample::btrfs;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sampling disk usage profiler for btrfs", long_about = None)]
struct Args {
    /// Mounted btrfs path (must be the top-level subvolume)
    path: PathBuf,

    /// Sample physical space (device extents, holes, slack) instead of
    /// the logical address space
    #[clap(short, long)]
    physical: bool,

    /// Track distributed, exclusive and shared sizes as well
    #[clap(long)]
    expert: bool,

    /// Number of sampling subprocesses
    #[clap(short = 'j', long, default_value_t = default_procs())]
    procs: usize,

    /// RNG seed
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Run without the interactive display
    #[clap(long)]
    headless: bool,

    /// Prefer older subvolumes when selecting representative locations
    #[clap(long)]
    chronological: bool,

    /// Stop after collecting this many samples
    #[clap(long)]
    max_samples: Option<u64>,

    /// Stop after this much wall time (e.g. "30s", "5m", "1h30m")
    #[clap(long, parse(try_from_str = parse_duration))]
    max_time: Option<Duration>,

    /// Stop once each sample stands for at most this size (e.g. "1MiB")
    #[clap(long, parse(try_from_str = parse_size))]
    min_resolution: Option<u64>,

    /// Write the collected state to this file on exit
    #[clap(long)]
    export: Option<PathBuf>,

    /// Load previously collected state (.json accepted for migration)
    /// instead of sampling
    #[clap(long)]
    import: Option<PathBuf>,

    /// Report per-path differences against a previously exported state
    #[clap(long)]
    compare: Option<PathBuf>,

    /// Print a du-compatible dump on exit
    #[clap(long)]
    du: bool,

    /// Hide tree entries below this share of the total, in percent
    #[clap(long, default_value_t = 0.1)]
    min_pct: f64,

    /// Re-exec as a sampling subprocess (internal)
    #[clap(long, hide = true)]
    subprocess: bool,
}

fn default_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_size(s: &str) -> Result<u64, String> {
    s.parse::<ByteSize>().map(|b| b.as_u64())
}

/// "90" (seconds), or any sequence of `<n>h`, `<n>m`, `<n>s` parts.
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("bad duration: {}", s))?;
        digits.clear();
        total += match ch {
            'h' => n * 3600,
            'm' => n * 60,
            's' => n,
            _ => return Err(format!("bad duration unit '{}'", ch)),
        };
    }
    if !digits.is_empty() {
        return Err(format!("trailing digits in duration: {}", s));
    }
    Ok(Duration::from_secs(total))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    if args.subprocess {
        let opts = WorkerOptions {
            physical: args.physical,
            seed: args.seed,
        };
        if let Err(err) = sampler::run_worker(&args.path, &opts) {
            log::error!("worker failed: {:#}", err);
            sampler::report_fatal(&err);
            std::process::exit(1);
        }
        return Ok(());
    }

    run_main(args)
}

fn run_main(args: Args) -> Result<()> {
    let mut state = match &args.import {
        Some(path) => load_state(path)?,
        None => GlobalState::new(args.expert, args.physical),
    };
    state.fs_path = args.path.as_os_str().as_bytes().to_vec();

    let policy = SelectionPolicy {
        chronological: args.chronological,
    };

    if args.import.is_none() {
        check_filesystem(&args.path)?;

        let mut workers =
            eventloop::spawn_workers(&args.path, args.procs.max(1), args.seed, args.physical)?;
        let stop = StopConditions {
            max_samples: args.max_samples,
            max_time: args.max_time,
            min_resolution: args.min_resolution,
        };

        let interactive = !args.headless;
        let mut on_tick = |state: &GlobalState| {
            if state.total_samples > 0 {
                log::debug!(
                    "{} samples, resolution {}",
                    state.total_samples,
                    ByteSize(state.resolution() as u64)
                );
            }
        };

        let end = eventloop::run(
            &mut state,
            &policy,
            &mut workers,
            interactive,
            &stop,
            &mut on_tick,
        )?;
        match end {
            RunEnd::UserQuit | RunEnd::StopCondition => {}
            RunEnd::WorkerFatal(msg) => {
                finish(&args, &state)?;
                bail!("sampling aborted: {}", msg);
            }
        }
    }

    finish(&args, &state)
}

/// Final outputs: the tree (or compare) report, the du dump, the export.
fn finish(args: &Args, state: &GlobalState) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = String::new();
    match &args.compare {
        Some(path) => {
            let baseline = load_state(path)?;
            report::print_compare(state, &baseline, &mut out)?;
        }
        None => {
            report::print_tree(state, &mut out, Some(args.min_pct / 100.0))?;
        }
    }
    stdout.lock().write_all(out.as_bytes())?;

    if args.du {
        let mut w = BufWriter::new(stdout.lock());
        report::write_du(state, &mut w, report::block_size_from_env())?;
        w.flush()?;
    }

    if let Some(path) = &args.export {
        let file = File::create(path)
            .with_context(|| format!("cannot create export file {}", path.display()))?;
        let mut w = BufWriter::new(file);
        export::export_binary(state, &mut w)
            .with_context(|| format!("export to {} failed", path.display()))?;
        w.flush()?;
        log::info!("state exported to {}", path.display());
    }
    Ok(())
}

fn load_state(path: &Path) -> Result<GlobalState> {
    let file =
        File::open(path).with_context(|| format!("cannot open import file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let state = if path.extension().map_or(false, |e| e == "json") {
        export::import_json(&mut reader)
            .with_context(|| format!("bad JSON import {}", path.display()))?
    } else {
        export::import_binary(&mut reader)
            .with_context(|| format!("bad import {}", path.display()))?
    };
    log::info!(
        "imported {} samples over {}",
        state.total_samples,
        ByteSize(state.total_size)
    );
    Ok(state)
}

/// The run only makes sense on a btrfs top-level subvolume; anything else
/// is refused before spawning workers.
fn check_filesystem(path: &Path) -> Result<()> {
    let fd = fcntl::open(path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("cannot open {}", path.display()))?;
    let result = (|| {
        let st = nix::sys::stat::fstat(fd).context("fstat failed")?;
        btrfs::fs_info(fd).map_err(|_| {
            anyhow::anyhow!("{} is not on a btrfs filesystem", path.display())
        })?;
        if st.st_ino != btrfs::BTRFS_FIRST_FREE_OBJECTID as u64 {
            bail!(
                "{} is not the top-level subvolume; pass the filesystem root",
                path.display()
            );
        }
        Ok(())
    })();
    let _ = nix::unistd::close(fd);
    result
}
