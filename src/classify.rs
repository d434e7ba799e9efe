//! Classifier: turns each worker's message stream into browser-trie
//! counter updates. One state machine per worker; all of them mutate the
//! shared [`GlobalState`].

use std::cmp::Ordering;

use crate::chunks::{Offset, LOGICAL_HOLE, LOGICAL_SLACK};
use crate::paths::{BrowserPathId, BrowserTree, GlobalPathId, SampleKind, SubPathTree};
use crate::proto::Message;
use crate::state::{GlobalState, RootEntry};
use crate::btrfs;

/// Synthetic classification bucket names. The leading NUL marks them as
/// virtual; display strips it.
pub mod special {
    pub const DATA: &[u8] = b"\0DATA";
    pub const METADATA: &[u8] = b"\0METADATA";
    pub const SYSTEM: &[u8] = b"\0SYSTEM";
    pub const UNKNOWN: &[u8] = b"\0UNKNOWN";

    pub const SINGLE: &[u8] = b"\0SINGLE";
    pub const DUP: &[u8] = b"\0DUP";
    pub const RAID0: &[u8] = b"\0RAID0";
    pub const RAID1: &[u8] = b"\0RAID1";
    pub const RAID10: &[u8] = b"\0RAID10";
    pub const RAID5: &[u8] = b"\0RAID5";
    pub const RAID6: &[u8] = b"\0RAID6";
    pub const RAID1C3: &[u8] = b"\0RAID1C3";
    pub const RAID1C4: &[u8] = b"\0RAID1C4";

    pub const UNALLOCATED: &[u8] = b"\0UNALLOCATED";
    pub const UNUSED: &[u8] = b"\0UNUSED";
    pub const SLACK: &[u8] = b"\0SLACK";
    pub const UNREACHABLE: &[u8] = b"\0UNREACHABLE";
    pub const NO_INODE: &[u8] = b"\0NO_INODE";
    pub const NO_PATH: &[u8] = b"\0NO_PATH";
    pub const ERROR: &[u8] = b"\0ERROR";

    /// Fallback name for a tree root with no resolvable backref.
    pub fn tree_name(root_id: u64) -> Vec<u8> {
        let mut name = b"\0TREE_".to_vec();
        name.extend_from_slice(root_id.to_string().as_bytes());
        name
    }
}

pub fn block_group_name(flags: u64) -> &'static [u8] {
    if flags & btrfs::BTRFS_BLOCK_GROUP_DATA as u64 != 0 {
        special::DATA
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_METADATA as u64 != 0 {
        special::METADATA
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_SYSTEM as u64 != 0 {
        special::SYSTEM
    } else {
        special::UNKNOWN
    }
}

pub fn profile_name(flags: u64) -> &'static [u8] {
    if flags & btrfs::BTRFS_BLOCK_GROUP_RAID0 as u64 != 0 {
        special::RAID0
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID1 as u64 != 0 {
        special::RAID1
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_DUP as u64 != 0 {
        special::DUP
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID10 as u64 != 0 {
        special::RAID10
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID5 as u64 != 0 {
        special::RAID5
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID6 as u64 != 0 {
        special::RAID6
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID1C3 as u64 != 0 {
        special::RAID1C3
    } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID1C4 as u64 != 0 {
        special::RAID1C4
    } else {
        special::SINGLE
    }
}

/// Flags steering representative selection. Default: prefer read-write
/// subvolumes, then newer creation times. `chronological` drops the
/// read-write preference and prefers older creation times instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionPolicy {
    pub chronological: bool,
}

/// One candidate location of the current sample.
#[derive(Debug, Clone, Copy)]
pub struct PathCandidate {
    pub gp: GlobalPathId,
    pub readonly: bool,
    pub otime_sec: u64,
}

/// Total order over candidates; `Less` means preferred. Per-path user
/// hints outrank everything, then subvolume attributes, then path length,
/// then byte order.
pub fn compare_candidates(
    state: &GlobalState,
    policy: &SelectionPolicy,
    a: &PathCandidate,
    b: &PathCandidate,
) -> Ordering {
    let hint_rank = |c: &PathCandidate| match state.selection_hints.get(&c.gp) {
        Some(true) => 0u8,
        None => 1,
        Some(false) => 2,
    };
    hint_rank(a)
        .cmp(&hint_rank(b))
        .then_with(|| {
            if policy.chronological {
                Ordering::Equal
            } else {
                // Read-write (false) sorts before read-only (true).
                a.readonly.cmp(&b.readonly)
            }
        })
        .then_with(|| {
            if policy.chronological {
                a.otime_sec.cmp(&b.otime_sec)
            } else {
                b.otime_sec.cmp(&a.otime_sec)
            }
        })
        .then_with(|| {
            state
                .globals
                .get(a.gp)
                .total_len
                .cmp(&state.globals.get(b.gp).total_len)
        })
        .then_with(|| state.globals.compare(&state.names, &state.subpaths, a.gp, b.gp))
}

pub fn select_representative(
    state: &GlobalState,
    policy: &SelectionPolicy,
    candidates: &[PathCandidate],
) -> usize {
    let mut best = 0;
    for i in 1..candidates.len() {
        if compare_candidates(state, policy, &candidates[i], &candidates[best]) == Ordering::Less {
            best = i;
        }
    }
    best
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// A `ResultEnd` completed a sample.
    SampleDone,
    /// The worker reported a fatal error or violated the protocol; the
    /// run must stop.
    Fatal(String),
}

struct CurrentSample {
    offset: Offset,
    prefix: BrowserPathId,
    /// Non-DATA zones produce no inode stream by design.
    not_data: bool,
    /// No extent lives at the sampled offset.
    unused: bool,
    ignoring_offset: bool,
    candidates: Vec<PathCandidate>,
    inode_root: Option<RootEntry>,
    inode_had_path: bool,
}

impl Default for CurrentSample {
    fn default() -> Self {
        CurrentSample {
            offset: Offset::NONE,
            prefix: BrowserTree::ROOT,
            not_data: false,
            unused: false,
            ignoring_offset: false,
            candidates: Vec::new(),
            inode_root: None,
            inode_had_path: false,
        }
    }
}

/// Per-worker message state machine.
pub struct Classifier {
    current: CurrentSample,
}

impl Classifier {
    pub fn new() -> Self {
        Classifier {
            current: CurrentSample::default(),
        }
    }

    pub fn handle(
        &mut self,
        state: &mut GlobalState,
        policy: &SelectionPolicy,
        msg: Message,
        now_hnsecs: u64,
    ) -> Outcome {
        match msg {
            Message::Start(m) => {
                // First worker to report wins; the rest must agree.
                if state.total_size == 0 {
                    state.total_size = m.total_size;
                    state.fsid = m.fsid;
                    state.devices = m.devices;
                } else if state.fsid != m.fsid {
                    return Outcome::Fatal("workers disagree on filesystem identity".into());
                }
                Outcome::Continue
            }
            Message::NewRoot(m) => {
                let parent = self.root_entry(state, m.parent_root_id);
                let sub = state
                    .subpaths
                    .append_path(&mut state.names, SubPathTree::ROOT, &m.name);
                let gp = state.globals.intern(&state.subpaths, Some(parent.path), sub);
                state.roots.insert(
                    m.root_id,
                    RootEntry {
                        path: gp,
                        readonly: m.readonly,
                        otime_sec: m.otime_sec,
                        generation: m.generation,
                    },
                );
                Outcome::Continue
            }
            Message::ResultStart(m) => {
                self.current = CurrentSample::default();
                self.current.offset = m.offset;
                let mut prefix = BrowserTree::ROOT;
                match m.offset.logical {
                    LOGICAL_HOLE => {
                        prefix = self.append_special(state, prefix, special::UNALLOCATED);
                        self.current.not_data = true;
                    }
                    LOGICAL_SLACK => {
                        prefix = self.append_special(state, prefix, special::SLACK);
                        self.current.not_data = true;
                    }
                    _ => {
                        prefix =
                            self.append_special(state, prefix, block_group_name(m.chunk_flags));
                        prefix = self.append_special(state, prefix, profile_name(m.chunk_flags));
                        self.current.not_data =
                            m.chunk_flags & btrfs::BTRFS_BLOCK_GROUP_DATA as u64 == 0;
                    }
                }
                self.current.prefix = prefix;
                Outcome::Continue
            }
            Message::ResultIgnoringOffset => {
                self.current.ignoring_offset = true;
                Outcome::Continue
            }
            Message::ResultInodeStart(m) => {
                self.current.inode_root = Some(self.root_entry(state, m.root_id));
                self.current.inode_had_path = false;
                Outcome::Continue
            }
            Message::Result(m) => {
                let root = match self.current.inode_root {
                    Some(root) => root,
                    None => return Outcome::Fatal("path message outside an inode stream".into()),
                };
                let sub = state
                    .subpaths
                    .append_path(&mut state.names, SubPathTree::ROOT, &m.path);
                let gp = state.globals.intern(&state.subpaths, Some(root.path), sub);
                self.current.candidates.push(PathCandidate {
                    gp,
                    readonly: root.readonly,
                    otime_sec: root.otime_sec,
                });
                self.current.inode_had_path = true;
                Outcome::Continue
            }
            Message::ResultInodeError(m) => {
                let root = match self.current.inode_root {
                    Some(root) => root,
                    None => return Outcome::Fatal("error message outside an inode stream".into()),
                };
                let sub = self.error_subpath(state, m.errno, &m.msg, &m.path);
                let gp = state.globals.intern(&state.subpaths, Some(root.path), sub);
                self.current.candidates.push(PathCandidate {
                    gp,
                    readonly: root.readonly,
                    otime_sec: root.otime_sec,
                });
                self.current.inode_had_path = true;
                Outcome::Continue
            }
            Message::ResultInodeEnd => {
                if let Some(root) = self.current.inode_root.take() {
                    if !self.current.inode_had_path {
                        let nid = state.names.intern(special::NO_PATH);
                        let sub = state.subpaths.append_name_id(&state.names, SubPathTree::ROOT, nid);
                        let gp = state.globals.intern(&state.subpaths, Some(root.path), sub);
                        self.current.candidates.push(PathCandidate {
                            gp,
                            readonly: root.readonly,
                            otime_sec: root.otime_sec,
                        });
                    }
                }
                Outcome::Continue
            }
            Message::ResultError(m) => {
                // ENOENT from the offset lookup means unused chunk space,
                // not a failure.
                if m.errno == nix::errno::Errno::ENOENT as i32 && self.current.candidates.is_empty()
                {
                    self.current.unused = true;
                    return Outcome::Continue;
                }
                let sub = self.error_subpath(state, m.errno, &m.msg, &[]);
                let gp = state.globals.intern(&state.subpaths, None, sub);
                self.current.candidates.push(PathCandidate {
                    gp,
                    readonly: false,
                    otime_sec: 0,
                });
                Outcome::Continue
            }
            Message::ResultEnd(m) => {
                self.classify(state, policy, m.duration_hnsecs, now_hnsecs);
                Outcome::SampleDone
            }
            Message::FatalError(m) => {
                Outcome::Fatal(String::from_utf8_lossy(&m.msg).into_owned())
            }
        }
    }

    fn append_special(
        &mut self,
        state: &mut GlobalState,
        parent: BrowserPathId,
        name: &[u8],
    ) -> BrowserPathId {
        let nid = state.names.intern(name);
        state.browser.append_name_id(parent, nid)
    }

    /// Root map lookup with a `TREE_<id>` fallback for roots the worker
    /// never announced (protocol tolerance, and the catch-all for tree
    /// roots without backrefs).
    fn root_entry(&mut self, state: &mut GlobalState, root_id: u64) -> RootEntry {
        if let Some(entry) = state.roots.get(&root_id) {
            return *entry;
        }
        let name = special::tree_name(root_id);
        let nid = state.names.intern(&name);
        let sub = state.subpaths.append_name_id(&state.names, SubPathTree::ROOT, nid);
        let gp = state.globals.intern(&state.subpaths, None, sub);
        let entry = RootEntry {
            path: gp,
            readonly: false,
            otime_sec: 0,
            generation: 0,
        };
        state.roots.insert(root_id, entry);
        entry
    }

    /// `\0ERROR/<msg>/<errno-name>[/path…]`
    fn error_subpath(
        &mut self,
        state: &mut GlobalState,
        errno: i32,
        msg: &[u8],
        path: &[u8],
    ) -> crate::paths::SubPathId {
        let nid = state.names.intern(special::ERROR);
        let mut sub = state.subpaths.append_name_id(&state.names, SubPathTree::ROOT, nid);
        if !msg.is_empty() {
            sub = state.subpaths.append_path(&mut state.names, sub, msg);
        }
        let errno_name = format!("{:?}", nix::errno::Errno::from_i32(errno));
        sub = state
            .subpaths
            .append_path(&mut state.names, sub, errno_name.as_bytes());
        if !path.is_empty() {
            sub = state.subpaths.append_path(&mut state.names, sub, path);
        }
        sub
    }

    fn classify(
        &mut self,
        state: &mut GlobalState,
        policy: &SelectionPolicy,
        duration: u64,
        now_hnsecs: u64,
    ) {
        let current = std::mem::take(&mut self.current);
        let display_offset = if current.offset.logical >= LOGICAL_SLACK {
            current.offset.physical
        } else {
            current.offset.logical
        };

        state.total_samples += 1;

        let mut candidates = current.candidates;
        if candidates.is_empty() {
            let node = if current.not_data {
                current.prefix
            } else if current.unused {
                self.append_special(state, current.prefix, special::UNUSED)
            } else if current.ignoring_offset {
                self.append_special(state, current.prefix, special::UNREACHABLE)
            } else {
                self.append_special(state, current.prefix, special::NO_INODE)
            };
            state.award(node, SampleKind::Represented, duration, display_offset);
            state.award(node, SampleKind::Shared, duration, display_offset);
            state.award_exclusive(node, duration, display_offset);
            state.award_distributed(node, 1.0, duration as f64);
            let gid = state.groups.intern(node, Vec::new());
            let group = state.groups.get_mut(gid);
            group.samples += 1;
            group.duration += duration;
            group.offsets.push(display_offset);
            group.last_seen = now_hnsecs;
            return;
        }

        let prefix = if current.ignoring_offset {
            self.append_special(state, current.prefix, special::UNREACHABLE)
        } else {
            current.prefix
        };

        candidates.sort_by_key(|c| c.gp);
        candidates.dedup_by_key(|c| c.gp);

        let rep = select_representative(state, policy, &candidates);
        let repr_node =
            state
                .browser
                .append_global(&state.subpaths, &state.globals, prefix, candidates[rep].gp);
        state.award(repr_node, SampleKind::Represented, duration, display_offset);

        let nodes: Vec<BrowserPathId> = candidates
            .iter()
            .map(|c| {
                state
                    .browser
                    .append_global(&state.subpaths, &state.globals, prefix, c.gp)
            })
            .collect();

        if state.expert {
            let share = 1.0 / candidates.len() as f64;
            for &bp in &nodes {
                state.award(bp, SampleKind::Shared, duration, display_offset);
                state.award_distributed(bp, share, duration as f64 * share);
            }
            let lca = state.browser.common_prefix(&nodes);
            state.award_exclusive(lca, duration, display_offset);
        }

        for (bp, cand) in nodes.iter().zip(candidates.iter()) {
            *state
                .browser
                .get_mut(*bp)
                .data
                .seen_as
                .entry(cand.gp)
                .or_insert(0) += 1;
        }

        let paths: Vec<GlobalPathId> = candidates.iter().map(|c| c.gp).collect();
        let gid = state.groups.intern(prefix, paths);
        let group = state.groups.get_mut(gid);
        group.samples += 1;
        group.duration += duration;
        group.offsets.push(display_offset);
        group.last_seen = now_hnsecs;
        group.representative = rep as u32;
        // Shares stay parallel to `paths`; only the winner advances.
        group.shares[rep] += 1;
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}
