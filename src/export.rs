//! Versioned binary import/export, plus the legacy JSON reader.
//!
//! The format is driven by a single visitor sequence parameterized by
//! direction: [`Writer`] and [`Reader`] implement the same [`Codec`]
//! trait, and `visit_state` makes the exact same calls for both, so the
//! two directions cannot drift apart.
//!
//! Representation: unsigned LEB128 varints for 64-bit integers, zigzag
//! varints for signed (and for all delta-encoded fields), little-endian
//! fixed width for 32-bit scalars and f64 bit patterns, length-prefixed
//! arrays, interning tables up front, `-1` as the null back-reference.

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::Deserialize;

use crate::paths::{
    BrowserPathId, BrowserTree, GlobalPathId, NameId, OffsetRing, SampleKind, SubPathId,
    SubPathTree,
};
use crate::state::GlobalState;

pub const MAGIC: &[u8; 8] = b"BTDU\0BIN";
pub const FORMAT_VERSION: u32 = 2;

pub const FLAG_EXPERT: u32 = 1 << 0;
pub const FLAG_PHYSICAL: u32 = 1 << 1;

/// Sanity bound on any length prefix in an import.
const MAX_LEN: u64 = 1 << 32;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a btsample binary export (bad magic)")]
    BadMagic,
    #[error("unsupported format version {0}")]
    BadVersion(u32),
    #[error("corrupt import: {0}")]
    Corrupt(&'static str),
    #[error("bad JSON import: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Codec primitives

pub trait Codec {
    const WRITING: bool;

    fn var_u64(&mut self, v: &mut u64) -> Result<(), CodecError>;
    fn var_i64(&mut self, v: &mut i64) -> Result<(), CodecError>;
    fn fixed_u32(&mut self, v: &mut u32) -> Result<(), CodecError>;
    fn fixed_u64(&mut self, v: &mut u64) -> Result<(), CodecError>;
    fn byte(&mut self, v: &mut u8) -> Result<(), CodecError>;
    fn raw16(&mut self, v: &mut [u8; 16]) -> Result<(), CodecError>;
    fn bytes(&mut self, v: &mut Vec<u8>) -> Result<(), CodecError>;
}

pub struct Writer<W: Write> {
    out: W,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Self {
        Writer { out }
    }
}

pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn unzigzag(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

pub fn encode_var_u64(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

pub fn decode_var_u64(r: &mut impl Read) -> Result<u64, CodecError> {
    let mut v = 0u64;
    for shift in (0..64).step_by(7) {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let b = byte[0];
        v |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            // The 10th byte may only carry the last bit of a u64.
            if shift == 63 && b > 1 {
                return Err(CodecError::Corrupt("overlong varint"));
            }
            return Ok(v);
        }
    }
    Err(CodecError::Corrupt("varint exceeds 10 bytes"))
}

impl<W: Write> Codec for Writer<W> {
    const WRITING: bool = true;

    fn var_u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        let mut buf = Vec::with_capacity(10);
        encode_var_u64(*v, &mut buf);
        self.out.write_all(&buf)?;
        Ok(())
    }

    fn var_i64(&mut self, v: &mut i64) -> Result<(), CodecError> {
        let mut u = zigzag(*v);
        self.var_u64(&mut u)
    }

    fn fixed_u32(&mut self, v: &mut u32) -> Result<(), CodecError> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn fixed_u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn byte(&mut self, v: &mut u8) -> Result<(), CodecError> {
        self.out.write_all(std::slice::from_ref(v))?;
        Ok(())
    }

    fn raw16(&mut self, v: &mut [u8; 16]) -> Result<(), CodecError> {
        self.out.write_all(v)?;
        Ok(())
    }

    fn bytes(&mut self, v: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut len = v.len() as u64;
        self.var_u64(&mut len)?;
        self.out.write_all(v)?;
        Ok(())
    }
}

pub struct Reader<R: Read> {
    input: R,
}

impl<R: Read> Reader<R> {
    pub fn new(input: R) -> Self {
        Reader { input }
    }
}

impl<R: Read> Codec for Reader<R> {
    const WRITING: bool = false;

    fn var_u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        *v = decode_var_u64(&mut self.input)?;
        Ok(())
    }

    fn var_i64(&mut self, v: &mut i64) -> Result<(), CodecError> {
        let mut u = 0u64;
        self.var_u64(&mut u)?;
        *v = unzigzag(u);
        Ok(())
    }

    fn fixed_u32(&mut self, v: &mut u32) -> Result<(), CodecError> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf)?;
        *v = u32::from_le_bytes(buf);
        Ok(())
    }

    fn fixed_u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        *v = u64::from_le_bytes(buf);
        Ok(())
    }

    fn byte(&mut self, v: &mut u8) -> Result<(), CodecError> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        *v = buf[0];
        Ok(())
    }

    fn raw16(&mut self, v: &mut [u8; 16]) -> Result<(), CodecError> {
        self.input.read_exact(v)?;
        Ok(())
    }

    fn bytes(&mut self, v: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut len = 0u64;
        self.var_u64(&mut len)?;
        if len > MAX_LEN {
            return Err(CodecError::Corrupt("oversized byte string"));
        }
        let mut buf = vec![0u8; len as usize];
        self.input.read_exact(&mut buf)?;
        *v = buf;
        Ok(())
    }
}

/// Length-prefixed sequence; on read, the vec is resized with defaults
/// before element visits.
fn visit_vec<C: Codec, T: Default>(
    c: &mut C,
    v: &mut Vec<T>,
    mut f: impl FnMut(&mut C, &mut T) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    let mut len = v.len() as u64;
    c.var_u64(&mut len)?;
    if !C::WRITING {
        if len > MAX_LEN {
            return Err(CodecError::Corrupt("oversized array"));
        }
        v.clear();
        v.resize_with(len as usize, Default::default);
    }
    for item in v.iter_mut() {
        f(c, item)?;
    }
    Ok(())
}

/// Field of a delta-encoded struct array: stored as the zigzagged
/// difference from the previous element's value. Wrapping arithmetic, so
/// sentinel offsets near `u64::MAX` reinterpreted as i64 stay sound.
fn visit_delta<C: Codec>(c: &mut C, prev: &mut i64, v: &mut i64) -> Result<(), CodecError> {
    if C::WRITING {
        let mut d = v.wrapping_sub(*prev);
        c.var_i64(&mut d)?;
    } else {
        let mut d = 0i64;
        c.var_i64(&mut d)?;
        *v = prev.wrapping_add(d);
    }
    *prev = *v;
    Ok(())
}

// ---------------------------------------------------------------------------
// On-disk model

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RingRec {
    slots: [u64; 3],
    len: u8,
    next: u8,
}

impl RingRec {
    fn from_ring(r: &OffsetRing) -> Self {
        RingRec {
            slots: r.slots,
            len: r.len,
            next: r.next,
        }
    }

    fn to_ring(self) -> OffsetRing {
        OffsetRing {
            slots: self.slots,
            len: self.len,
            next: self.next,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CountsRec {
    samples: u64,
    duration: u64,
    ring: RingRec,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BrowserRec {
    parent: i64,
    name: i64,
    counts: [CountsRec; 3],
    distributed_samples_bits: u64,
    distributed_duration_bits: u64,
    /// (global index, count), ascending.
    seen_as: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GroupRec {
    prefix: u64,
    /// Ascending global indices.
    paths: Vec<u64>,
    representative: u64,
    samples: u64,
    duration: u64,
    ring: RingRec,
    shares: Vec<u64>,
    last_seen: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct SaveModel {
    flags: u32,
    fsid: [u8; 16],
    total_size: u64,
    fs_path: Vec<u8>,
    /// Sorted unique byte strings.
    strings: Vec<Vec<u8>>,
    /// (name index, parent index or -1), allocation order.
    subpaths: Vec<(i64, i64)>,
    /// (parent index or -1, subpath index), allocation order.
    globals: Vec<(i64, i64)>,
    browser: Vec<BrowserRec>,
    groups: Vec<GroupRec>,
    /// (browser index, mark byte).
    marks: Vec<(u64, u8)>,
}

fn visit_ring<C: Codec>(c: &mut C, r: &mut RingRec) -> Result<(), CodecError> {
    // Ring slots are near-monotone offsets; delta-encode within the ring.
    let mut prev = 0i64;
    for slot in r.slots.iter_mut() {
        let mut v = *slot as i64;
        visit_delta(c, &mut prev, &mut v)?;
        *slot = v as u64;
    }
    c.byte(&mut r.len)?;
    c.byte(&mut r.next)?;
    if !C::WRITING && (r.len > 3 || r.next >= 3) {
        return Err(CodecError::Corrupt("bad offset ring"));
    }
    Ok(())
}

fn visit_counts<C: Codec>(c: &mut C, rec: &mut CountsRec) -> Result<(), CodecError> {
    c.var_u64(&mut rec.samples)?;
    c.var_u64(&mut rec.duration)?;
    visit_ring(c, &mut rec.ring)
}

fn visit_state<C: Codec>(c: &mut C, m: &mut SaveModel) -> Result<(), CodecError> {
    c.fixed_u32(&mut m.flags)?;
    c.raw16(&mut m.fsid)?;
    c.var_u64(&mut m.total_size)?;
    c.bytes(&mut m.fs_path)?;

    // String table.
    visit_vec(c, &mut m.strings, |c, s| c.bytes(s))?;

    // SubPath table, both fields delta-encoded.
    {
        let (mut prev_name, mut prev_parent) = (0i64, 0i64);
        visit_vec(c, &mut m.subpaths, |c, entry| {
            visit_delta(c, &mut prev_name, &mut entry.0)?;
            visit_delta(c, &mut prev_parent, &mut entry.1)
        })?;
    }

    // GlobalPath table.
    {
        let (mut prev_parent, mut prev_sub) = (0i64, 0i64);
        visit_vec(c, &mut m.globals, |c, entry| {
            visit_delta(c, &mut prev_parent, &mut entry.0)?;
            visit_delta(c, &mut prev_sub, &mut entry.1)
        })?;
    }

    // BrowserPath table with per-node payloads.
    {
        let (mut prev_parent, mut prev_name) = (0i64, 0i64);
        visit_vec(c, &mut m.browser, |c, rec| {
            visit_delta(c, &mut prev_parent, &mut rec.parent)?;
            visit_delta(c, &mut prev_name, &mut rec.name)?;
            for counts in rec.counts.iter_mut() {
                visit_counts(c, counts)?;
            }
            c.fixed_u64(&mut rec.distributed_samples_bits)?;
            c.fixed_u64(&mut rec.distributed_duration_bits)?;
            let mut prev_gp = 0i64;
            visit_vec(c, &mut rec.seen_as, |c, entry| {
                let mut gp = entry.0 as i64;
                visit_delta(c, &mut prev_gp, &mut gp)?;
                entry.0 = gp as u64;
                c.var_u64(&mut entry.1)
            })
        })?;
    }

    // Sharing group stream. `last_seen` is delta-encoded across groups.
    {
        let mut prev_seen = 0i64;
        visit_vec(c, &mut m.groups, |c, g| {
            c.var_u64(&mut g.prefix)?;
            let mut prev_path = 0i64;
            visit_vec(c, &mut g.paths, |c, p| {
                let mut v = *p as i64;
                visit_delta(c, &mut prev_path, &mut v)?;
                *p = v as u64;
                Ok(())
            })?;
            c.var_u64(&mut g.representative)?;
            c.var_u64(&mut g.samples)?;
            c.var_u64(&mut g.duration)?;
            visit_ring(c, &mut g.ring)?;
            visit_vec(c, &mut g.shares, |c, s| c.var_u64(s))?;
            let mut seen = g.last_seen as i64;
            visit_delta(c, &mut prev_seen, &mut seen)?;
            g.last_seen = seen as u64;
            Ok(())
        })?;
    }

    // Marks.
    visit_vec(c, &mut m.marks, |c, entry| {
        c.var_u64(&mut entry.0)?;
        c.byte(&mut entry.1)
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// State <-> model

fn build_model(state: &GlobalState) -> SaveModel {
    let mut flags = 0;
    if state.expert {
        flags |= FLAG_EXPERT;
    }
    if state.physical {
        flags |= FLAG_PHYSICAL;
    }

    // Sorted-unique string table over every referenced name.
    let mut strings: Vec<Vec<u8>> = state
        .subpaths
        .iter()
        .map(|(_, n)| state.names.get(n.name).to_vec())
        .chain(state.browser.iter().map(|(_, n)| state.names.get(n.name).to_vec()))
        .collect();
    strings.sort();
    strings.dedup();
    let string_index: HashMap<Vec<u8>, u64> = strings
        .iter()
        .enumerate()
        .map(|(i, s)| (s.clone(), i as u64))
        .collect();
    let name_index = |nid: NameId| string_index[state.names.get(nid)] as i64;

    let subpaths: Vec<(i64, i64)> = state
        .subpaths
        .iter()
        .map(|(_, n)| {
            (
                name_index(n.name),
                n.parent.map_or(-1, |p| p.0 as i64),
            )
        })
        .collect();

    let globals: Vec<(i64, i64)> = state
        .globals
        .iter()
        .map(|(_, n)| (n.parent.map_or(-1, |p| p.0 as i64), n.sub.0 as i64))
        .collect();

    let browser: Vec<BrowserRec> = state
        .browser
        .iter()
        .map(|(_, n)| {
            let mut seen_as: Vec<(u64, u64)> = n
                .data
                .seen_as
                .iter()
                .map(|(gp, count)| (gp.0 as u64, *count))
                .collect();
            seen_as.sort_unstable();
            BrowserRec {
                parent: n.parent.map_or(-1, |p| p.0 as i64),
                name: name_index(n.name),
                counts: [
                    counts_rec(n.data.counts(SampleKind::Represented)),
                    counts_rec(n.data.counts(SampleKind::Exclusive)),
                    counts_rec(n.data.counts(SampleKind::Shared)),
                ],
                distributed_samples_bits: n.data.distributed_samples.to_bits(),
                distributed_duration_bits: n.data.distributed_duration.to_bits(),
                seen_as,
            }
        })
        .collect();

    let mut groups = Vec::with_capacity(state.groups.len() as usize);
    for id in 0..state.groups.len() {
        let g = state.groups.get(id);
        groups.push(GroupRec {
            prefix: g.prefix.0 as u64,
            paths: g.paths.iter().map(|p| p.0 as u64).collect(),
            representative: g.representative as u64,
            samples: g.samples,
            duration: g.duration,
            ring: RingRec::from_ring(&g.offsets),
            shares: g.shares.clone(),
            last_seen: g.last_seen,
        });
    }

    let marks: Vec<(u64, u8)> = state
        .browser
        .iter()
        .filter_map(|(id, n)| n.data.mark.map(|m| (id.0 as u64, m as u8)))
        .collect();

    SaveModel {
        flags,
        fsid: state.fsid,
        total_size: state.total_size,
        fs_path: state.fs_path.clone(),
        strings,
        subpaths,
        globals,
        browser,
        groups,
        marks,
    }
}

fn counts_rec(c: &crate::paths::SampleCounts) -> CountsRec {
    CountsRec {
        samples: c.samples,
        duration: c.duration,
        ring: RingRec::from_ring(&c.offsets),
    }
}

fn apply_model(m: &SaveModel) -> Result<GlobalState, CodecError> {
    let mut state = GlobalState::new(m.flags & FLAG_EXPERT != 0, m.flags & FLAG_PHYSICAL != 0);
    state.fsid = m.fsid;
    state.total_size = m.total_size;
    state.fs_path = m.fs_path.clone();

    let name_ids: Vec<NameId> = m.strings.iter().map(|s| state.names.intern(s)).collect();
    let name_at = |idx: i64| -> Result<NameId, CodecError> {
        name_ids
            .get(usize::try_from(idx).map_err(|_| CodecError::Corrupt("bad string index"))?)
            .copied()
            .ok_or(CodecError::Corrupt("string index out of range"))
    };

    // SubPath table: entry 0 is the root.
    let mut sub_ids: Vec<SubPathId> = Vec::with_capacity(m.subpaths.len());
    for (i, &(name, parent)) in m.subpaths.iter().enumerate() {
        if i == 0 {
            if parent != -1 {
                return Err(CodecError::Corrupt("subpath table has no root"));
            }
            sub_ids.push(SubPathTree::ROOT);
            continue;
        }
        if parent < 0 || parent as usize >= i {
            return Err(CodecError::Corrupt("subpath parent out of order"));
        }
        let parent_id = sub_ids[parent as usize];
        let nid = name_at(name)?;
        sub_ids.push(state.subpaths.append_name_id(&state.names, parent_id, nid));
    }

    let mut global_ids: Vec<GlobalPathId> = Vec::with_capacity(m.globals.len());
    for (i, &(parent, sub)) in m.globals.iter().enumerate() {
        let parent_id = match parent {
            -1 => None,
            p if p >= 0 && (p as usize) < i => Some(global_ids[p as usize]),
            _ => return Err(CodecError::Corrupt("global parent out of order")),
        };
        let sub_id = *sub_ids
            .get(usize::try_from(sub).map_err(|_| CodecError::Corrupt("bad subpath index"))?)
            .ok_or(CodecError::Corrupt("subpath index out of range"))?;
        global_ids.push(state.globals.intern(&state.subpaths, parent_id, sub_id));
    }

    let mut browser_ids: Vec<BrowserPathId> = Vec::with_capacity(m.browser.len());
    for (i, rec) in m.browser.iter().enumerate() {
        let id = if i == 0 {
            if rec.parent != -1 {
                return Err(CodecError::Corrupt("browser table has no root"));
            }
            BrowserTree::ROOT
        } else {
            if rec.parent < 0 || rec.parent as usize >= i {
                return Err(CodecError::Corrupt("browser parent out of order"));
            }
            let parent_id = browser_ids[rec.parent as usize];
            state.browser.append_name_id(parent_id, name_at(rec.name)?)
        };
        browser_ids.push(id);

        let node = state.browser.get_mut(id);
        for (kind, counts) in [SampleKind::Represented, SampleKind::Exclusive, SampleKind::Shared]
            .iter()
            .zip(rec.counts.iter())
        {
            let c = node.data.counts_mut(*kind);
            c.samples = counts.samples;
            c.duration = counts.duration;
            c.offsets = counts.ring.to_ring();
        }
        node.data.distributed_samples = f64::from_bits(rec.distributed_samples_bits);
        node.data.distributed_duration = f64::from_bits(rec.distributed_duration_bits);
        node.data.seen_as = rec
            .seen_as
            .iter()
            .map(|&(gp, count)| {
                global_ids
                    .get(gp as usize)
                    .map(|&id| (id, count))
                    .ok_or(CodecError::Corrupt("seen_as index out of range"))
            })
            .collect::<Result<_, _>>()?;
    }

    for rec in &m.groups {
        let prefix = *browser_ids
            .get(rec.prefix as usize)
            .ok_or(CodecError::Corrupt("group prefix out of range"))?;
        let paths = rec
            .paths
            .iter()
            .map(|&p| {
                global_ids
                    .get(p as usize)
                    .copied()
                    .ok_or(CodecError::Corrupt("group path out of range"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if rec.shares.len() != paths.len() {
            return Err(CodecError::Corrupt("group shares length mismatch"));
        }
        if !paths.windows(2).all(|w| w[0] < w[1]) {
            return Err(CodecError::Corrupt("group paths not sorted"));
        }
        if !paths.is_empty() && rec.representative as usize >= paths.len() {
            return Err(CodecError::Corrupt("group representative out of range"));
        }
        let gid = state.groups.intern(prefix, paths);
        let g = state.groups.get_mut(gid);
        g.representative = rec.representative as u32;
        g.samples = rec.samples;
        g.duration = rec.duration;
        g.offsets = rec.ring.to_ring();
        g.shares = rec.shares.clone();
        g.last_seen = rec.last_seen;
    }

    for &(idx, mark) in &m.marks {
        let id = *browser_ids
            .get(idx as usize)
            .ok_or(CodecError::Corrupt("mark index out of range"))?;
        state.browser.get_mut(id).data.mark = Some(mark != 0);
    }

    // Every sample awards `represented` up to the root.
    state.total_samples = state
        .counts_at(BrowserTree::ROOT, SampleKind::Represented)
        .samples;

    Ok(state)
}

// ---------------------------------------------------------------------------
// Entry points

pub fn export_binary(state: &GlobalState, out: &mut impl Write) -> Result<(), CodecError> {
    out.write_all(MAGIC)?;
    out.write_all(&FORMAT_VERSION.to_le_bytes())?;
    let mut model = build_model(state);
    let mut writer = Writer::new(out);
    visit_state(&mut writer, &mut model)
}

pub fn import_binary(input: &mut impl Read) -> Result<GlobalState, CodecError> {
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let mut version = [0u8; 4];
    input.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    // Each version gets its own visitor; there is only one so far.
    match version {
        FORMAT_VERSION => {
            let mut model = SaveModel::default();
            let mut reader = Reader::new(input);
            visit_state(&mut reader, &mut model)?;
            apply_model(&model)
        }
        other => Err(CodecError::BadVersion(other)),
    }
}

// ---------------------------------------------------------------------------
// Legacy JSON import (read-only; migration aid)

#[derive(Debug, Deserialize)]
struct JsonState {
    total_size: u64,
    #[serde(default)]
    expert: bool,
    #[serde(default)]
    physical: bool,
    root: JsonNode,
}

#[derive(Debug, Default, Deserialize)]
struct JsonNode {
    #[serde(default)]
    samples: u64,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    distributed_samples: Option<f64>,
    #[serde(default)]
    children: std::collections::BTreeMap<String, JsonNode>,
}

/// Read the legacy JSON format. It carries per-node counters but no
/// sharing groups, so it populates the model without round-trip fidelity.
pub fn import_json(input: &mut impl Read) -> Result<GlobalState, CodecError> {
    let parsed: JsonState = serde_json::from_reader(input)?;
    let mut state = GlobalState::new(parsed.expert, parsed.physical);
    state.total_size = parsed.total_size;
    apply_json_node(&mut state, BrowserTree::ROOT, &parsed.root);
    state.total_samples = state
        .counts_at(BrowserTree::ROOT, SampleKind::Represented)
        .samples;
    Ok(state)
}

fn apply_json_node(state: &mut GlobalState, id: BrowserPathId, node: &JsonNode) {
    {
        let data = &mut state.browser.get_mut(id).data;
        let counts = data.counts_mut(SampleKind::Represented);
        counts.samples = node.samples;
        counts.duration = node.duration;
        data.distributed_samples = node.distributed_samples.unwrap_or(node.samples as f64);
    }
    for (name, child) in &node.children {
        // The legacy writer rendered special nodes as "<NAME>".
        let bytes = if name.starts_with('<') && name.ends_with('>') && name.len() > 2 {
            let mut b = vec![0u8];
            b.extend_from_slice(name[1..name.len() - 1].as_bytes());
            b
        } else {
            name.as_bytes().to_vec()
        };
        let nid = state.names.intern(&bytes);
        let child_id = state.browser.append_name_id(id, nid);
        apply_json_node(state, child_id, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip_edges() {
        for v in [
            0u64,
            1,
            127,
            128,
            300,
            16383,
            16384,
            u32::MAX as u64,
            u64::MAX - 1,
            u64::MAX,
        ] {
            let mut buf = Vec::new();
            encode_var_u64(v, &mut buf);
            assert!(buf.len() <= 10);
            let mut cursor = std::io::Cursor::new(&buf);
            assert_eq!(decode_var_u64(&mut cursor).unwrap(), v);
            assert_eq!(cursor.position() as usize, buf.len());
        }
    }

    #[test]
    fn zigzag_round_trip_edges() {
        for v in [0i64, -1, 1, -2, i64::MIN, i64::MAX, 123456, -123456] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
        // Small magnitudes stay small on the wire.
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
    }

    #[test]
    fn truncated_varint_is_corrupt() {
        let mut buf = Vec::new();
        encode_var_u64(u64::MAX, &mut buf);
        buf.pop();
        let mut cursor = std::io::Cursor::new(&buf);
        assert!(decode_var_u64(&mut cursor).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let data = b"NOTBTDU!\x02\x00\x00\x00";
        assert!(matches!(
            import_binary(&mut &data[..]),
            Err(CodecError::BadMagic)
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            import_binary(&mut &data[..]),
            Err(CodecError::BadVersion(999))
        ));
    }

    #[test]
    fn empty_state_round_trips() {
        let state = GlobalState::new(true, false);
        let mut buf = Vec::new();
        export_binary(&state, &mut buf).unwrap();
        let restored = import_binary(&mut &buf[..]).unwrap();
        assert_eq!(restored.total_samples, 0);
        assert_eq!(restored.browser.node_count(), state.browser.node_count());
        assert!(restored.expert);
        assert!(!restored.physical);
    }

    #[test]
    fn json_import_populates_counters() {
        let json = br#"{
            "total_size": 1048576,
            "root": {
                "samples": 10,
                "children": {
                    "<DATA>": {
                        "samples": 10,
                        "children": {
                            "@root": { "samples": 10, "duration": 500 }
                        }
                    }
                }
            }
        }"#;
        let mut state = import_json(&mut &json[..]).unwrap();
        assert_eq!(state.total_samples, 10);
        let nid = state.names.intern(b"\0DATA");
        let data = state
            .browser
            .child_by_name(BrowserTree::ROOT, nid)
            .expect("DATA node exists");
        assert_eq!(
            state.counts_at(data, SampleKind::Represented).samples,
            10
        );
    }
}
