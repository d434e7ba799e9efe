//! The sampling worker: a child process that draws uniform offsets,
//! resolves them through the btrfs ioctls, and streams framed results on
//! stdout. It reads nothing from the parent; pausing is SIGSTOP/SIGCONT.

use std::collections::HashMap;
use std::io::{BufWriter, Stdout, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::btrfs;
use crate::chunks::{self, LogicalSpace, PhysicalSpace, SamplingSpace};
use crate::proto::{
    DeviceMsg, FatalErrorMsg, Message, MessageWriter, NewRootMsg, ResultEndMsg, ResultErrorMsg,
    ResultInodeErrorMsg, ResultInodeStartMsg, ResultMsg, ResultStartMsg, StartMsg,
};

pub struct WorkerOptions {
    pub physical: bool,
    pub seed: u64,
}

/// Worker entry point. Never returns on success; errors bubble up so the
/// caller can emit a `FatalError` frame before exiting.
pub fn run_worker(fs_path: &Path, opts: &WorkerOptions) -> Result<()> {
    let fd = fcntl::open(fs_path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("cannot open {}", fs_path.display()))?;

    let info = btrfs::fs_info(fd).context("FS_INFO ioctl failed; is this btrfs?")?;
    let devices = chunks::list_devices(fd).context("device enumeration failed")?;

    // Each worker rebuilds the chunk index locally: cheap, and makes the
    // seed fully determine the output stream.
    let space: Box<dyn SamplingSpace> = if opts.physical {
        Box::new(PhysicalSpace::enumerate(fd).context("device extent enumeration failed")?)
    } else {
        Box::new(LogicalSpace::enumerate(fd).context("chunk enumeration failed")?)
    };
    if space.total() == 0 {
        anyhow::bail!("filesystem reports no sampling space");
    }

    log::debug!(
        "worker seed {} sampling {} bytes over {} device(s)",
        opts.seed,
        space.total(),
        devices.len()
    );

    let mut out = MessageWriter::new(BufWriter::new(std::io::stdout()));
    out.send(&Message::Start(StartMsg {
        total_size: space.total(),
        fsid: info.fsid,
        devices: devices
            .iter()
            .map(|d| DeviceMsg {
                devid: d.devid,
                total_bytes: d.total_bytes,
                path: d.path.as_os_str().as_bytes().to_vec(),
            })
            .collect(),
    }))?;
    out.flush()?;

    let mut roots = Roots::new(fd, fs_path.to_path_buf());
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let uniform = Uniform::new(0, space.total());

    let mut sample_index = 0u64;
    loop {
        let u = uniform.sample(&mut rng);
        let resolved = space.resolve(u);

        out.send(&Message::ResultStart(ResultStartMsg {
            chunk_flags: resolved.flags,
            offset: resolved.offset,
            sample_index,
        }))?;

        let started = Instant::now();
        let is_data = resolved.flags & btrfs::BTRFS_BLOCK_GROUP_DATA as u64 != 0
            && resolved.offset.logical < chunks::LOGICAL_SLACK;
        if is_data {
            sample_data(fd, &mut roots, &mut out, resolved.offset.logical)?;
        }
        let duration_hnsecs = (started.elapsed().as_nanos() / 100) as u64;

        out.send(&Message::ResultEnd(ResultEndMsg { duration_hnsecs }))?;
        out.flush()?;
        sample_index += 1;
    }
}

/// Emit a `FatalError` frame for `err`, best-effort.
pub fn report_fatal(err: &anyhow::Error) {
    let mut out = MessageWriter::new(std::io::stdout());
    let _ = out.send(&Message::FatalError(FatalErrorMsg {
        msg: format!("{:#}", err).into_bytes(),
    }));
    let _ = std::io::stdout().flush();
}

fn sample_data(
    fd: RawFd,
    roots: &mut Roots,
    out: &mut MessageWriter<BufWriter<Stdout>>,
    logical: u64,
) -> Result<()> {
    let mut inodes: Vec<btrfs::LogicalInoItem> = Vec::new();
    let mut ioctl_err: Option<Errno> = None;

    btrfs::logical_ino(fd, logical, false, |res| match res {
        Ok(items) => inodes.extend_from_slice(items),
        Err(err) => ioctl_err = Some(err),
    });

    if let Some(errno) = ioctl_err {
        // ENOENT means no extent lives at this offset (unused chunk
        // space); the classifier maps it to its own bucket.
        out.send(&Message::ResultError(ResultErrorMsg {
            errno: errno as i32,
            msg: b"logical_ino".to_vec(),
        }))?;
        return Ok(());
    }

    if inodes.is_empty() {
        // Retry extent-wide: the offset may sit in an unreachable part of
        // an extent that is still referenced elsewhere.
        out.send(&Message::ResultIgnoringOffset)?;
        let mut retry_err: Option<Errno> = None;
        btrfs::logical_ino(fd, logical, true, |res| match res {
            Ok(items) => inodes.extend_from_slice(items),
            Err(err) => retry_err = Some(err),
        });
        if let Some(errno) = retry_err {
            if errno != Errno::ENOENT {
                out.send(&Message::ResultError(ResultErrorMsg {
                    errno: errno as i32,
                    msg: b"logical_ino_ignore_offset".to_vec(),
                }))?;
            }
            return Ok(());
        }
    }

    for inode in &inodes {
        roots.announce(out, inode.root)?;
        out.send(&Message::ResultInodeStart(ResultInodeStartMsg {
            root_id: inode.root,
        }))?;
        match roots.open_fd(inode.root) {
            Ok(root_fd) => {
                let mut send_err = None;
                btrfs::ino_paths(root_fd, inode.inum, |res| {
                    let result = match res {
                        Ok(paths) => paths.iter().try_for_each(|p| {
                            out.send(&Message::Result(ResultMsg {
                                path: p.to_bytes().to_vec(),
                            }))
                        }),
                        Err(errno) => out.send(&Message::ResultInodeError(ResultInodeErrorMsg {
                            errno: errno as i32,
                            msg: b"ino_paths".to_vec(),
                            path: Vec::new(),
                        })),
                    };
                    if let Err(err) = result {
                        send_err = Some(err);
                    }
                });
                if let Some(err) = send_err {
                    return Err(err.into());
                }
            }
            Err(errno) => {
                out.send(&Message::ResultInodeError(ResultInodeErrorMsg {
                    errno: errno as i32,
                    msg: b"open_root".to_vec(),
                    path: roots.relative_path(inode.root),
                }))?;
            }
        }
        out.send(&Message::ResultInodeEnd)?;
    }
    Ok(())
}

struct RootMeta {
    /// Path below the filesystem root; empty for the top-level subvolume.
    rel_path: Vec<u8>,
    fd: Option<RawFd>,
    /// Whether resolution succeeded; unresolvable roots are remembered so
    /// they are not re-walked every sample.
    resolvable: bool,
}

/// Memoized subvolume resolver. Resolves each newly seen tree root to its
/// mount subpath (walking backrefs and inode lookups), announces it on
/// the wire before first use (parents first), and caches one read-only fd
/// per root for `ino_paths`.
struct Roots {
    fd: RawFd,
    fs_path: PathBuf,
    entries: HashMap<u64, RootMeta>,
}

impl Roots {
    fn new(fd: RawFd, fs_path: PathBuf) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            crate::state::FS_TREE_ROOT_ID,
            RootMeta {
                rel_path: Vec::new(),
                fd: Some(fd),
                resolvable: true,
            },
        );
        Roots { fd, fs_path, entries }
    }

    /// Make sure `root_id` has been announced with a `NewRoot` frame
    /// (ancestors first).
    fn announce(
        &mut self,
        out: &mut MessageWriter<BufWriter<Stdout>>,
        root_id: u64,
    ) -> Result<()> {
        if self.entries.contains_key(&root_id) {
            return Ok(());
        }

        let backref = match btrfs::find_root_backref(self.fd, root_id) {
            Ok(Some(backref)) => backref,
            // No backref (orphaned or internal tree): the classifier
            // falls back to a TREE_<id> bucket.
            Ok(None) | Err(_) => {
                self.entries.insert(
                    root_id,
                    RootMeta {
                        rel_path: Vec::new(),
                        fd: None,
                        resolvable: false,
                    },
                );
                return Ok(());
            }
        };

        self.announce(out, backref.parent_id)?;

        // Name of the subvolume relative to its parent root: the path of
        // the directory holding it, then its directory entry name.
        let mut name = Vec::new();
        if backref.dirid != btrfs::BTRFS_FIRST_FREE_OBJECTID as u64 {
            btrfs::ino_lookup(self.fd, backref.parent_id, backref.dirid, |res| {
                if let Ok(path) = res {
                    name.extend_from_slice(path.to_bytes());
                }
            });
            if !name.is_empty() && !name.ends_with(b"/") {
                name.push(b'/');
            }
        }
        name.extend_from_slice(&backref.name);

        let root_info = btrfs::read_root_item(self.fd, root_id)
            .ok()
            .flatten()
            .unwrap_or(btrfs::RootInfo {
                generation: 0,
                otime_sec: 0,
                readonly: false,
            });

        out.send(&Message::NewRoot(NewRootMsg {
            root_id,
            parent_root_id: backref.parent_id,
            name: name.clone(),
            generation: root_info.generation,
            otime_sec: root_info.otime_sec,
            readonly: root_info.readonly,
        }))?;

        let parent = &self.entries[&backref.parent_id];
        let parent_resolvable = parent.resolvable;
        let mut rel_path = parent.rel_path.clone();
        if !rel_path.is_empty() {
            rel_path.push(b'/');
        }
        rel_path.extend_from_slice(&name);
        self.entries.insert(
            root_id,
            RootMeta {
                rel_path,
                fd: None,
                resolvable: parent_resolvable,
            },
        );
        Ok(())
    }

    fn relative_path(&self, root_id: u64) -> Vec<u8> {
        self.entries
            .get(&root_id)
            .map(|m| m.rel_path.clone())
            .unwrap_or_default()
    }

    /// Cached read-only fd for the subvolume root, for `ino_paths`.
    fn open_fd(&mut self, root_id: u64) -> Result<RawFd, Errno> {
        let meta = self.entries.get_mut(&root_id).ok_or(Errno::ENOENT)?;
        if !meta.resolvable {
            return Err(Errno::ENOENT);
        }
        if let Some(fd) = meta.fd {
            return Ok(fd);
        }
        let mut path = self.fs_path.clone();
        path.push(std::ffi::OsStr::from_bytes(&meta.rel_path));
        let fd = fcntl::open(&path, OFlag::O_RDONLY, Mode::empty())?;
        meta.fd = Some(fd);
        Ok(fd)
    }
}
