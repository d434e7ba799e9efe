//! Process-wide aggregate state. One instance per run, owned by the main
//! process and passed explicitly; the classifier is its only mutator
//! during sampling.

use std::collections::HashMap;

use crate::arena::Slab;
use crate::paths::{
    BrowserPathId, BrowserTree, GlobalPathId, GlobalPaths, NameTable, OffsetRing, SampleCounts,
    SampleKind, SubPathTree,
};
use crate::proto::DeviceMsg;

/// One sharing group: every sample whose offset resolved to the same set
/// of paths under the same chunk-derived prefix. Basic unit of the binary
/// export and of the Shares panel.
#[derive(Debug, Clone)]
pub struct SharingGroup {
    /// Browser node the group's paths are grafted under; for groups with
    /// no paths this is the terminal node itself.
    pub prefix: BrowserPathId,
    /// Sorted, deduplicated.
    pub paths: Vec<GlobalPathId>,
    /// Index into `paths` of the current representative; 0 when empty.
    pub representative: u32,
    pub samples: u64,
    /// Sum of resolution durations, 100 ns units.
    pub duration: u64,
    pub offsets: OffsetRing,
    /// Per-path share counters, parallel to `paths`: how often each path
    /// won representative selection. Sums to `samples`.
    pub shares: Vec<u64>,
    /// Wall-clock time of the group's most recent sample, 100 ns units
    /// since the epoch.
    pub last_seen: u64,
}

/// Interning table of sharing groups, slab-backed. Groups are append-only;
/// the classifier and the export codec walk them by ordinal index, so
/// groups created mid-walk become visible (open-ended iteration).
pub struct SharingGroups {
    groups: Slab<SharingGroup>,
    index: HashMap<(BrowserPathId, Vec<GlobalPathId>), u32>,
}

impl SharingGroups {
    pub fn new() -> Self {
        SharingGroups {
            groups: Slab::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: u32) -> &SharingGroup {
        self.groups.get(id)
    }

    pub fn get_mut(&mut self, id: u32) -> &mut SharingGroup {
        self.groups.get_mut(id)
    }

    /// Find or create the group for `(prefix, paths)`. `paths` must be
    /// sorted and deduplicated.
    pub fn intern(&mut self, prefix: BrowserPathId, paths: Vec<GlobalPathId>) -> u32 {
        debug_assert!(paths.windows(2).all(|w| w[0] < w[1]));
        if let Some(&id) = self.index.get(&(prefix, paths.clone())) {
            return id;
        }
        let shares = vec![0; paths.len()];
        let id = self.groups.alloc(SharingGroup {
            prefix,
            paths: paths.clone(),
            representative: 0,
            samples: 0,
            duration: 0,
            offsets: OffsetRing::default(),
            shares,
            last_seen: 0,
        });
        self.index.insert((prefix, paths), id);
        id
    }

    /// Rebuild the dedup index after a bulk import.
    pub fn reindex(&mut self) {
        self.index.clear();
        let mut entries = Vec::new();
        for (id, g) in self.groups.iter() {
            entries.push(((g.prefix, g.paths.clone()), id));
        }
        self.index.extend(entries);
    }
}

impl Default for SharingGroups {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a btrfs tree root is mounted, plus the attributes representative
/// selection needs.
#[derive(Debug, Clone, Copy)]
pub struct RootEntry {
    pub path: GlobalPathId,
    pub readonly: bool,
    pub otime_sec: u64,
    pub generation: u64,
}

pub const FS_TREE_ROOT_ID: u64 = 5;

pub struct GlobalState {
    pub names: NameTable,
    pub subpaths: SubPathTree,
    pub globals: GlobalPaths,
    pub browser: BrowserTree,
    pub groups: SharingGroups,
    /// tree_id → mount location; lazily populated from NewRoot messages.
    pub roots: HashMap<u64, RootEntry>,
    /// Per-path prefer (true) / ignore (false) overrides for
    /// representative selection.
    pub selection_hints: HashMap<GlobalPathId, bool>,
    pub total_size: u64,
    pub total_samples: u64,
    pub fsid: [u8; 16],
    pub fs_path: Vec<u8>,
    pub devices: Vec<DeviceMsg>,
    pub expert: bool,
    pub physical: bool,
    pub paused: bool,
}

impl GlobalState {
    pub fn new(expert: bool, physical: bool) -> Self {
        let names = NameTable::new();
        let subpaths = SubPathTree::new();
        let mut globals = GlobalPaths::new();
        let browser = BrowserTree::new();

        let mut roots = HashMap::new();
        // The top-level subvolume mounts at the hierarchy root.
        let top = globals.intern(&subpaths, None, SubPathTree::ROOT);
        roots.insert(
            FS_TREE_ROOT_ID,
            RootEntry {
                path: top,
                readonly: false,
                otime_sec: 0,
                generation: 0,
            },
        );

        GlobalState {
            names,
            subpaths,
            globals,
            browser,
            groups: SharingGroups::new(),
            roots,
            selection_hints: HashMap::new(),
            total_size: 0,
            total_samples: 0,
            fsid: [0; 16],
            fs_path: Vec::new(),
            devices: Vec::new(),
            expert,
            physical,
            paused: false,
        }
    }

    /// Bytes each sample currently stands for.
    pub fn resolution(&self) -> f64 {
        if self.total_samples == 0 {
            return f64::INFINITY;
        }
        self.total_size as f64 / self.total_samples as f64
    }

    /// Add one sample to `node` and every ancestor, maintaining the
    /// parent-sum invariant incrementally.
    pub fn award(&mut self, node: BrowserPathId, kind: SampleKind, duration: u64, offset: u64) {
        let mut cur = Some(node);
        while let Some(id) = cur {
            self.browser.get_mut(id).data.counts_mut(kind).add(duration, offset);
            cur = self.browser.get(id).parent;
        }
    }

    /// Add an `exclusive` sample at `node` only; exclusive does not sum
    /// to the parent.
    pub fn award_exclusive(&mut self, node: BrowserPathId, duration: u64, offset: u64) {
        self.browser
            .get_mut(node)
            .data
            .counts_mut(SampleKind::Exclusive)
            .add(duration, offset);
    }

    /// Add a fractional distributed sample to `node` and every ancestor.
    pub fn award_distributed(&mut self, node: BrowserPathId, share: f64, duration: f64) {
        let mut cur = Some(node);
        while let Some(id) = cur {
            let data = &mut self.browser.get_mut(id).data;
            data.distributed_samples += share;
            data.distributed_duration += duration;
            cur = self.browser.get(id).parent;
        }
    }

    /// Sum of `kind` samples over the leaves under `node` (diagnostics
    /// and tests; equals the node's own counter by the parent-sum
    /// invariant).
    pub fn leaf_sum(&self, node: BrowserPathId, kind: SampleKind) -> u64 {
        let mut stack = vec![node];
        let mut sum = 0;
        while let Some(id) = stack.pop() {
            let children: Vec<_> = self.browser.children_of(id).collect();
            if children.is_empty() {
                sum += self.browser.get(id).data.counts(kind).samples;
            } else {
                stack.extend(children);
            }
        }
        sum
    }

    pub fn counts_at(&self, node: BrowserPathId, kind: SampleKind) -> &SampleCounts {
        self.browser.get(node).data.counts(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::BrowserTree;

    #[test]
    fn award_propagates_to_ancestors() {
        let mut state = GlobalState::new(true, false);
        let node = state
            .browser
            .append_path(&mut state.names, BrowserTree::ROOT, b"a/b/c");
        state.award(node, SampleKind::Represented, 10, 42);
        state.award(node, SampleKind::Represented, 5, 43);

        let a = state.browser.child_by_name(BrowserTree::ROOT, state.names.intern(b"a")).unwrap();
        assert_eq!(state.counts_at(node, SampleKind::Represented).samples, 2);
        assert_eq!(state.counts_at(a, SampleKind::Represented).samples, 2);
        assert_eq!(
            state.counts_at(BrowserTree::ROOT, SampleKind::Represented).duration,
            15
        );
        assert_eq!(state.leaf_sum(BrowserTree::ROOT, SampleKind::Represented), 2);
    }

    #[test]
    fn exclusive_stays_put() {
        let mut state = GlobalState::new(true, false);
        let node = state
            .browser
            .append_path(&mut state.names, BrowserTree::ROOT, b"x/y");
        state.award_exclusive(node, 3, 7);
        assert_eq!(state.counts_at(node, SampleKind::Exclusive).samples, 1);
        assert_eq!(
            state.counts_at(BrowserTree::ROOT, SampleKind::Exclusive).samples,
            0
        );
    }

    #[test]
    fn sharing_groups_intern_by_key() {
        let mut state = GlobalState::new(true, false);
        let sub = state
            .subpaths
            .append_path(&mut state.names, SubPathTree::ROOT, b"f");
        let gp = state.globals.intern(&state.subpaths, None, sub);
        let a = state.groups.intern(BrowserTree::ROOT, vec![gp]);
        let b = state.groups.intern(BrowserTree::ROOT, vec![gp]);
        assert_eq!(a, b);
        let c = state.groups.intern(BrowserTree::ROOT, vec![]);
        assert_ne!(a, c);
        assert_eq!(state.groups.len(), 2);
    }
}
