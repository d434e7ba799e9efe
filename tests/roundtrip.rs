//! Export/import fidelity: a populated state must survive the binary
//! codec exactly, counter for counter, ring for ring, group for group.

mod common;

use std::collections::BTreeMap;

use btsample::export::{export_binary, import_binary};
use btsample::paths::{BrowserPathId, BrowserTree, SampleKind, SAMPLE_KINDS};
use btsample::state::GlobalState;
use common::Harness;

/// Canonical rendering of one browser node: byte path of every segment,
/// all counters, rings, distributed values and the seen_as multiset with
/// its global paths rendered to byte strings.
type NodeKey = Vec<Vec<u8>>;

#[derive(Debug, PartialEq)]
struct NodeSnapshot {
    counters: Vec<(u64, u64, Vec<u64>)>,
    distributed: (u64, u64),
    seen_as: BTreeMap<Vec<u8>, u64>,
    mark: Option<bool>,
}

fn render_global(state: &GlobalState, gp: btsample::paths::GlobalPathId) -> Vec<u8> {
    let mut out = Vec::new();
    for name in state.globals.segments(&state.subpaths, gp) {
        out.push(b'/');
        out.extend_from_slice(state.names.get(name));
    }
    out
}

fn snapshot(state: &GlobalState) -> BTreeMap<NodeKey, NodeSnapshot> {
    let mut out = BTreeMap::new();
    let mut stack: Vec<(BrowserPathId, NodeKey)> = vec![(BrowserTree::ROOT, Vec::new())];
    while let Some((id, key)) = stack.pop() {
        let node = state.browser.get(id);
        let counters = SAMPLE_KINDS
            .iter()
            .map(|&k| {
                let c = node.data.counts(k);
                (c.samples, c.duration, c.offsets.iter().collect::<Vec<u64>>())
            })
            .collect();
        let seen_as = node
            .data
            .seen_as
            .iter()
            .map(|(&gp, &count)| (render_global(state, gp), count))
            .collect();
        out.insert(
            key.clone(),
            NodeSnapshot {
                counters,
                distributed: (
                    node.data.distributed_samples.to_bits(),
                    node.data.distributed_duration.to_bits(),
                ),
                seen_as,
                mark: node.data.mark,
            },
        );
        for child in state.browser.children_of(id) {
            let mut child_key = key.clone();
            child_key.push(state.names.get(state.browser.get(child).name).to_vec());
            stack.push((child, child_key));
        }
    }
    out
}

fn group_snapshots(state: &GlobalState) -> Vec<(Vec<u8>, Vec<Vec<u8>>, u32, u64, u64, Vec<u64>, Vec<u64>, u64)> {
    let mut out = Vec::new();
    for id in 0..state.groups.len() {
        let g = state.groups.get(id);
        let prefix = state
            .browser
            .segments(g.prefix)
            .iter()
            .flat_map(|&n| {
                let mut seg = vec![b'/'];
                seg.extend_from_slice(state.names.get(n));
                seg
            })
            .collect();
        out.push((
            prefix,
            g.paths.iter().map(|&p| render_global(state, p)).collect(),
            g.representative,
            g.samples,
            g.duration,
            g.offsets.iter().collect(),
            g.shares.clone(),
            g.last_seen,
        ));
    }
    out
}

fn populated_state() -> GlobalState {
    let mut h = Harness::new(true, false);
    h.new_root(256, b"@root", false, 1000);
    h.new_root(257, b"@snap", true, 2000);

    // 1000 samples across 5 sharing groups.
    for i in 0..1000u64 {
        match i % 5 {
            0 => h.data_sample(i * 512, &[(256, b"a")]),
            1 => h.data_sample(i * 512, &[(256, b"b")]),
            2 => h.data_sample(i * 512, &[(256, b"a"), (256, b"b")]),
            3 => h.data_sample(i * 512, &[(256, b"dir/c"), (257, b"dir/c")]),
            _ => h.data_sample(i * 512, &[(257, b"d")]),
        }
    }
    assert_eq!(h.state.groups.len(), 5);

    // A couple of deletion marks.
    let a = h
        .node_at(&[
            btsample::classify::special::DATA,
            btsample::classify::special::SINGLE,
            b"@root",
            b"a",
        ])
        .unwrap();
    h.state.browser.get_mut(a).data.mark = Some(true);
    let b = h
        .node_at(&[
            btsample::classify::special::DATA,
            btsample::classify::special::SINGLE,
            b"@root",
            b"b",
        ])
        .unwrap();
    h.state.browser.get_mut(b).data.mark = Some(false);

    h.state
}

#[test]
fn s6_binary_round_trip_preserves_everything() {
    let state = populated_state();

    let mut buf = Vec::new();
    export_binary(&state, &mut buf).unwrap();
    let restored = import_binary(&mut &buf[..]).unwrap();

    assert_eq!(restored.total_samples, state.total_samples);
    assert_eq!(restored.total_size, state.total_size);
    assert_eq!(restored.fsid, state.fsid);
    assert_eq!(restored.expert, state.expert);
    assert_eq!(restored.physical, state.physical);
    assert_eq!(restored.browser.node_count(), state.browser.node_count());
    assert_eq!(restored.groups.len(), state.groups.len());

    assert_eq!(snapshot(&restored), snapshot(&state));
    assert_eq!(group_snapshots(&restored), group_snapshots(&state));
}

#[test]
fn re_export_is_byte_identical() {
    let state = populated_state();

    let mut first = Vec::new();
    export_binary(&state, &mut first).unwrap();
    let restored = import_binary(&mut &first[..]).unwrap();
    let mut second = Vec::new();
    export_binary(&restored, &mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn round_trip_through_a_file() {
    let state = populated_state();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.btsample");

    {
        let mut file = std::fs::File::create(&path).unwrap();
        export_binary(&state, &mut file).unwrap();
    }
    let mut file = std::fs::File::open(&path).unwrap();
    let restored = import_binary(&mut file).unwrap();
    assert_eq!(snapshot(&restored), snapshot(&state));
}

#[test]
fn truncated_file_fails_cleanly() {
    let state = populated_state();
    let mut buf = Vec::new();
    export_binary(&state, &mut buf).unwrap();
    buf.truncate(buf.len() / 2);
    assert!(import_binary(&mut &buf[..]).is_err());
}

#[test]
fn header_is_bit_exact() {
    let state = populated_state();
    let mut buf = Vec::new();
    export_binary(&state, &mut buf).unwrap();

    assert_eq!(&buf[..8], b"BTDU\0BIN");
    assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 2);
    let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    assert_eq!(flags & 1, 1, "expert bit");
    assert_eq!(flags & 2, 0, "physical bit");
    assert_eq!(&buf[16..32], &[9u8; 16], "filesystem UUID");
}
