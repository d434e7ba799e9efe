//! The main process: spawns the worker fleet, multiplexes their pipes and
//! terminal input with `poll`, drives the classifiers, and enforces stop
//! conditions. Single-threaded and cooperative; the only suspension point
//! is the poll call.

use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::classify::{Classifier, Outcome, SelectionPolicy};
use crate::proto::StreamParser;
use crate::state::GlobalState;

/// Refresh cadence of the front-end (≈2 Hz).
pub const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct StopConditions {
    pub max_samples: Option<u64>,
    pub max_time: Option<Duration>,
    /// Stop once each sample stands for at most this many bytes.
    pub min_resolution: Option<u64>,
}

impl StopConditions {
    fn reached(&self, state: &GlobalState, started: Instant) -> bool {
        if let Some(n) = self.max_samples {
            if state.total_samples >= n {
                return true;
            }
        }
        if let Some(t) = self.max_time {
            if started.elapsed() >= t {
                return true;
            }
        }
        if let Some(r) = self.min_resolution {
            if state.total_samples > 0 && state.resolution() <= r as f64 {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunEnd {
    UserQuit,
    StopCondition,
    WorkerFatal(String),
}

pub struct Worker {
    child: Child,
    stdout: ChildStdout,
    parser: StreamParser,
    classifier: Classifier,
    eof: bool,
}

impl Worker {
    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }
}

/// Spawn `procs` sampling subprocesses by re-executing ourselves with the
/// hidden `--subprocess` flag, each with its own derived seed.
pub fn spawn_workers(
    fs_path: &Path,
    procs: usize,
    seed: u64,
    physical: bool,
) -> Result<Vec<Worker>> {
    let exe = std::env::current_exe().context("cannot find own executable")?;
    let mut workers = Vec::with_capacity(procs);
    for i in 0..procs {
        let mut cmd = Command::new(&exe);
        cmd.arg(fs_path)
            .arg("--subprocess")
            .arg("--seed")
            .arg((seed.wrapping_add(i as u64)).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if physical {
            cmd.arg("--physical");
        }
        let mut child = cmd.spawn().context("cannot spawn sampling subprocess")?;
        let stdout = child.stdout.take().expect("stdout was piped");
        set_nonblocking(stdout.as_raw_fd())?;
        log::debug!("spawned worker {} (pid {})", i, child.id());
        workers.push(Worker {
            child,
            stdout,
            parser: StreamParser::new(),
            classifier: Classifier::new(),
            eof: false,
        });
    }
    Ok(workers)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).context("cannot set O_NONBLOCK")?;
    Ok(())
}

/// Freeze or thaw the whole fleet. The loop additionally stops draining
/// worker pipes while paused, so the effect on the display is immediate.
pub fn set_paused(state: &mut GlobalState, workers: &[Worker], paused: bool) {
    if state.paused == paused {
        return;
    }
    let sig = if paused { Signal::SIGSTOP } else { Signal::SIGCONT };
    for w in workers {
        let _ = kill(w.pid(), sig);
    }
    state.paused = paused;
    log::info!("{}", if paused { "paused" } else { "resumed" });
}

/// Drive the run to completion. `on_tick` fires roughly twice a second
/// and after every state-changing burst; the front-end redraws from it.
pub fn run(
    state: &mut GlobalState,
    policy: &SelectionPolicy,
    workers: &mut [Worker],
    interactive: bool,
    stop: &StopConditions,
    on_tick: &mut dyn FnMut(&GlobalState),
) -> Result<RunEnd> {
    let started = Instant::now();
    let mut next_tick = Instant::now() + TICK;
    let mut buf = [0u8; 64 * 1024];

    let end = loop {
        if stop.reached(state, started) {
            break RunEnd::StopCondition;
        }

        // Assemble the poll set: workers (unless paused) and the terminal.
        let mut fds = Vec::with_capacity(workers.len() + 1);
        let mut fd_owners = Vec::with_capacity(workers.len() + 1);
        if !state.paused {
            for (i, w) in workers.iter().enumerate() {
                if !w.eof {
                    fds.push(PollFd::new(w.fd(), PollFlags::POLLIN));
                    fd_owners.push(Some(i));
                }
            }
        }
        if interactive {
            fds.push(PollFd::new(0, PollFlags::POLLIN));
            fd_owners.push(None);
        }

        let timeout = next_tick
            .saturating_duration_since(Instant::now())
            .as_millis() as i32;
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("poll failed"),
        }

        let mut pending_end: Option<RunEnd> = None;
        let mut drained_any = false;
        for (slot, owner) in fds.iter().zip(fd_owners.iter()) {
            let revents = slot.revents().unwrap_or(PollFlags::empty());
            if revents.is_empty() {
                continue;
            }
            match owner {
                Some(i) => {
                    let now = now_hnsecs();
                    match drain_worker(state, policy, &mut workers[*i], &mut buf, now) {
                        Ok(changed) => drained_any |= changed,
                        Err(msg) => {
                            pending_end = Some(RunEnd::WorkerFatal(msg));
                        }
                    }
                }
                None => {
                    if let Some(end) = drain_terminal(state, workers) {
                        pending_end = Some(end);
                    }
                }
            }
            if pending_end.is_some() {
                break;
            }
        }
        if let Some(end) = pending_end {
            break end;
        }

        let now = Instant::now();
        if now >= next_tick || drained_any {
            if now >= next_tick {
                next_tick = now + TICK;
            }
            on_tick(state);
        }
    };

    reap(workers);
    Ok(end)
}

/// Drain one ready worker pipe through its parser and classifier.
/// Returns whether any message was processed; errors are fatal for the
/// whole run.
fn drain_worker(
    state: &mut GlobalState,
    policy: &SelectionPolicy,
    worker: &mut Worker,
    buf: &mut [u8],
    now_hnsecs: u64,
) -> Result<bool, String> {
    let mut changed = false;
    loop {
        // Size the read from the parser's hint: enough for the next
        // header or the rest of the current frame.
        let want = worker.parser.needed().clamp(1, buf.len());
        match nix::unistd::read(worker.fd(), &mut buf[..want]) {
            Ok(0) => {
                worker.eof = true;
                if worker.parser.has_partial() {
                    return Err("worker closed its pipe mid-message".into());
                }
                return Err("worker exited unexpectedly".into());
            }
            Ok(n) => {
                worker.parser.feed(&buf[..n]);
                loop {
                    match worker.parser.next() {
                        Ok(Some(msg)) => {
                            changed = true;
                            match worker.classifier.handle(state, policy, msg, now_hnsecs) {
                                Outcome::Continue | Outcome::SampleDone => {}
                                Outcome::Fatal(msg) => return Err(msg),
                            }
                        }
                        Ok(None) => break,
                        Err(err) => return Err(format!("worker protocol error: {}", err)),
                    }
                }
            }
            Err(Errno::EAGAIN) => return Ok(changed),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(format!("worker pipe read failed: {}", err)),
        }
    }
}

/// Terminal keys: `q` quits, `p` or space toggles pause. Returns the run
/// end when the user quit.
fn drain_terminal(state: &mut GlobalState, workers: &[Worker]) -> Option<RunEnd> {
    let mut buf = [0u8; 256];
    let n = match std::io::stdin().read(&mut buf) {
        Ok(n) => n,
        Err(_) => return None,
    };
    for &key in &buf[..n] {
        match key {
            b'q' | 0x03 => return Some(RunEnd::UserQuit),
            b'p' | b' ' => {
                let paused = !state.paused;
                set_paused(state, workers, paused);
            }
            _ => {}
        }
    }
    None
}

/// Close pipes and reap the fleet. Workers blocked in an ioctl are
/// killable from outside; anything still alive gets SIGKILL.
pub fn reap(workers: &mut [Worker]) {
    for w in workers.iter_mut() {
        let _ = kill(w.pid(), Signal::SIGCONT);
        let _ = kill(w.pid(), Signal::SIGKILL);
    }
    for w in workers.iter_mut() {
        let _ = w.child.wait();
    }
}

/// Wall clock in 100 ns units since the epoch.
pub fn now_hnsecs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}
