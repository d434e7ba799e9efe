//! Shared helpers for driving a classifier with synthetic worker streams.

// Each integration test target compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use btsample::btrfs;
use btsample::chunks::Offset;
use btsample::classify::{Classifier, Outcome, SelectionPolicy};
use btsample::paths::{BrowserPathId, BrowserTree, SampleKind};
use btsample::proto::*;
use btsample::state::GlobalState;

pub const DATA_SINGLE: u64 = btrfs::BTRFS_BLOCK_GROUP_DATA as u64;

pub struct Harness {
    pub state: GlobalState,
    pub policy: SelectionPolicy,
    pub classifier: Classifier,
    pub sample_index: u64,
    pub now: u64,
}

impl Harness {
    pub fn new(expert: bool, physical: bool) -> Self {
        let mut h = Harness {
            state: GlobalState::new(expert, physical),
            policy: SelectionPolicy::default(),
            classifier: Classifier::new(),
            sample_index: 0,
            now: 16_000_000_000_000_000, // some fixed wall clock, in hnsecs
        };
        h.feed(Message::Start(StartMsg {
            total_size: 1 << 20,
            fsid: [9; 16],
            devices: vec![],
        }));
        h
    }

    pub fn feed(&mut self, msg: Message) {
        match self
            .classifier
            .handle(&mut self.state, &self.policy, msg, self.now)
        {
            Outcome::Continue | Outcome::SampleDone => {}
            Outcome::Fatal(msg) => panic!("unexpected fatal: {}", msg),
        }
    }

    pub fn new_root(&mut self, root_id: u64, name: &[u8], readonly: bool, otime_sec: u64) {
        self.feed(Message::NewRoot(NewRootMsg {
            root_id,
            parent_root_id: 5,
            name: name.to_vec(),
            generation: 1,
            otime_sec,
            readonly,
        }));
    }

    /// One complete DATA sample resolving to `paths`, each given as
    /// (root_id, path-within-root).
    pub fn data_sample(&mut self, logical: u64, paths: &[(u64, &[u8])]) {
        self.data_sample_opts(logical, paths, false, 100)
    }

    pub fn data_sample_opts(
        &mut self,
        logical: u64,
        paths: &[(u64, &[u8])],
        ignoring_offset: bool,
        duration: u64,
    ) {
        self.feed(Message::ResultStart(ResultStartMsg {
            chunk_flags: DATA_SINGLE,
            offset: Offset {
                logical,
                dev_id: u64::MAX,
                physical: u64::MAX,
            },
            sample_index: self.sample_index,
        }));
        if ignoring_offset {
            self.feed(Message::ResultIgnoringOffset);
        }
        for &(root_id, path) in paths {
            self.feed(Message::ResultInodeStart(ResultInodeStartMsg { root_id }));
            self.feed(Message::Result(ResultMsg {
                path: path.to_vec(),
            }));
            self.feed(Message::ResultInodeEnd);
        }
        self.feed(Message::ResultEnd(ResultEndMsg {
            duration_hnsecs: duration,
        }));
        self.sample_index += 1;
        self.now += 5_000_000; // half a second between samples
    }

    /// Walk the browser trie by raw segment names.
    pub fn node_at(&mut self, segments: &[&[u8]]) -> Option<BrowserPathId> {
        let mut id = BrowserTree::ROOT;
        for seg in segments {
            let nid = self.state.names.intern(seg);
            id = self.state.browser.child_by_name(id, nid)?;
        }
        Some(id)
    }

    pub fn samples_at(&mut self, segments: &[&[u8]], kind: SampleKind) -> u64 {
        let id = self.node_at(segments).expect("node exists");
        self.state.counts_at(id, kind).samples
    }

    pub fn distributed_at(&mut self, segments: &[&[u8]]) -> f64 {
        let id = self.node_at(segments).expect("node exists");
        self.state.browser.get(id).data.distributed_samples
    }
}

/// Check the parent-sum invariant for represented/shared/distributed over
/// the whole tree.
pub fn assert_parent_sums(state: &GlobalState) {
    let mut stack = vec![BrowserTree::ROOT];
    while let Some(id) = stack.pop() {
        let children: Vec<BrowserPathId> = state.browser.children_of(id).collect();
        if children.is_empty() {
            continue;
        }
        for kind in [SampleKind::Represented, SampleKind::Shared] {
            let own = state.counts_at(id, kind).samples;
            let sum: u64 = children.iter().map(|&c| state.counts_at(c, kind).samples).sum();
            assert_eq!(own, sum, "parent-sum violated for {:?}", kind);
        }
        let own: f64 = state.browser.get(id).data.distributed_samples;
        let sum: f64 = children
            .iter()
            .map(|&c| state.browser.get(c).data.distributed_samples)
            .sum();
        assert!(
            (own - sum).abs() <= 1e-9 * state.total_samples.max(1) as f64,
            "distributed parent-sum violated: {} vs {}",
            own,
            sum
        );
        stack.extend(children);
    }
}

/// Shared ≥ represented ≥ exclusive, node by node.
pub fn assert_kind_ordering(state: &GlobalState) {
    let mut stack = vec![BrowserTree::ROOT];
    while let Some(id) = stack.pop() {
        let rep = state.counts_at(id, SampleKind::Represented).samples;
        let shared = state.counts_at(id, SampleKind::Shared).samples;
        let excl = state.counts_at(id, SampleKind::Exclusive).samples;
        assert!(shared >= rep, "shared < represented at node {:?}", id);
        assert!(rep >= excl, "represented < exclusive at node {:?}", id);
        stack.extend(state.browser.children_of(id));
    }
}
