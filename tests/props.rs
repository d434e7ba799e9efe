//! Property-shaped invariants: trie interning, varint encodings, wire
//! framing under adversarial chunking, and the representative order.

use quickcheck::quickcheck;

use btsample::classify::{compare_candidates, PathCandidate, SelectionPolicy};
use btsample::export::{decode_var_u64, encode_var_u64, unzigzag, zigzag};
use btsample::paths::{NameTable, PathError, SubPathTree};
use btsample::proto::{encode, Message, ResultMsg, StreamParser};
use btsample::state::GlobalState;

fn valid_segment(seg: &[u8]) -> bool {
    !seg.is_empty() && !seg.contains(&b'/') && seg != b"\0"
}

quickcheck! {
    /// Two appends of the same (parent, name) return the same node, and
    /// the number of distinct nodes equals the number of distinct names.
    fn trie_interning_is_idempotent(names_in: Vec<Vec<u8>>) -> bool {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        let segs: Vec<&[u8]> = names_in
            .iter()
            .map(|s| s.as_slice())
            .filter(|s| valid_segment(s))
            .collect();

        let mut first_ids = Vec::new();
        for seg in &segs {
            first_ids.push(tree.append_name(&mut names, SubPathTree::ROOT, seg).unwrap());
        }
        for (seg, &id) in segs.iter().zip(first_ids.iter()) {
            if tree.append_name(&mut names, SubPathTree::ROOT, seg).unwrap() != id {
                return false;
            }
        }
        let mut distinct: Vec<&[u8]> = segs.clone();
        distinct.sort();
        distinct.dedup();
        tree.node_count() as usize == distinct.len() + 1
    }

    /// Invalid names never intern.
    fn invalid_names_always_rejected(name: Vec<u8>) -> bool {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        let res = tree.append_name(&mut names, SubPathTree::ROOT, &name);
        if valid_segment(&name) {
            res.is_ok()
        } else {
            matches!(res, Err(PathError::EmptyName) | Err(PathError::SlashInName))
        }
    }

    /// LEB128 round-trips and stays within 10 bytes.
    fn varint_round_trips(v: u64) -> bool {
        let mut buf = Vec::new();
        encode_var_u64(v, &mut buf);
        if buf.len() > 10 {
            return false;
        }
        let mut cursor = std::io::Cursor::new(&buf);
        decode_var_u64(&mut cursor).map(|d| d == v).unwrap_or(false)
    }

    /// Zigzag round-trips for all signed values.
    fn zigzag_round_trips(v: i64) -> bool {
        unzigzag(zigzag(v)) == v
    }

    /// Feeding a frame to the parser one byte at a time yields exactly
    /// one message, identical to the input, with nothing left over.
    fn framing_survives_byte_drip(path: Vec<u8>, duration: u64) -> bool {
        let msgs = vec![
            Message::Result(ResultMsg { path }),
            Message::ResultEnd(btsample::proto::ResultEndMsg {
                duration_hnsecs: duration,
            }),
        ];
        let mut parser = StreamParser::new();
        let mut decoded = Vec::new();
        for msg in &msgs {
            let frame = encode(msg);
            for &byte in &frame {
                parser.feed(&[byte]);
                loop {
                    match parser.next() {
                        Ok(Some(m)) => decoded.push(m),
                        Ok(None) => break,
                        Err(_) => return false,
                    }
                }
            }
        }
        decoded == msgs && !parser.has_partial()
    }
}

/// The representative order is total, reflexive and transitive over a
/// pool of candidates with assorted attributes.
#[test]
fn representative_order_is_total() {
    use std::cmp::Ordering;

    let mut state = GlobalState::new(true, false);
    let mut pool = Vec::new();
    let specs: &[(&[u8], bool, u64)] = &[
        (b"@root/a", false, 100),
        (b"@root/b", false, 100),
        (b"@snap/a", true, 200),
        (b"@snap/old/a", true, 50),
        (b"@root/deep/path/file", false, 100),
        (b"@z", false, 300),
    ];
    for &(path, readonly, otime_sec) in specs {
        let sub = state
            .subpaths
            .append_path(&mut state.names, SubPathTree::ROOT, path);
        let gp = state.globals.intern(&state.subpaths, None, sub);
        pool.push(PathCandidate {
            gp,
            readonly,
            otime_sec,
        });
    }

    for policy in [
        SelectionPolicy { chronological: false },
        SelectionPolicy { chronological: true },
    ] {
        // Reflexive.
        for a in &pool {
            assert_eq!(compare_candidates(&state, &policy, a, a), Ordering::Equal);
        }
        // Antisymmetric and total.
        for a in &pool {
            for b in &pool {
                let ab = compare_candidates(&state, &policy, a, b);
                let ba = compare_candidates(&state, &policy, b, a);
                assert_eq!(ab, ba.reverse());
                if a.gp != b.gp {
                    assert_ne!(ab, Ordering::Equal, "distinct candidates must be ordered");
                }
            }
        }
        // Transitive.
        for a in &pool {
            for b in &pool {
                for c in &pool {
                    let ab = compare_candidates(&state, &policy, a, b);
                    let bc = compare_candidates(&state, &policy, b, c);
                    if ab == bc && ab != Ordering::Equal {
                        assert_eq!(compare_candidates(&state, &policy, a, c), ab);
                    }
                }
            }
        }
    }
}

/// Rule order: user hints outrank subvolume attributes.
#[test]
fn prefer_hint_overrides_readonly_rule() {
    use std::cmp::Ordering;

    let mut state = GlobalState::new(true, false);
    let sub_rw = state
        .subpaths
        .append_path(&mut state.names, SubPathTree::ROOT, b"@root/f");
    let sub_ro = state
        .subpaths
        .append_path(&mut state.names, SubPathTree::ROOT, b"@snap/f");
    let rw = state.globals.intern(&state.subpaths, None, sub_rw);
    let ro = state.globals.intern(&state.subpaths, None, sub_ro);
    state.selection_hints.insert(ro, true);

    let policy = SelectionPolicy::default();
    let cand_rw = PathCandidate {
        gp: rw,
        readonly: false,
        otime_sec: 10,
    };
    let cand_ro = PathCandidate {
        gp: ro,
        readonly: true,
        otime_sec: 10,
    };
    assert_eq!(
        compare_candidates(&state, &policy, &cand_ro, &cand_rw),
        Ordering::Less
    );
}
