//! Interned path tries. Three deduplicated trees share one name table:
//! `SubPathTree` (paths within one subvolume tree), `GlobalPaths` (chains
//! concatenating subvolume mount subpaths), and `BrowserTree` (the
//! hierarchy presented to the user, carrying the sample counters).
//!
//! Names beginning with a NUL byte are "special": synthetic classification
//! buckets (`\0DATA`, `\0UNREACHABLE`, ...) rather than real path segments.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::arena::{Arena, Slab, Span};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path segment")]
    EmptyName,
    #[error("path segment contains '/'")]
    SlashInName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

/// Byte-string interner backed by the grow-only arena. Two interns of the
/// same bytes return the same id.
pub struct NameTable {
    arena: Arena,
    spans: Vec<Span>,
    buckets: HashMap<u64, Vec<NameId>>,
}

impl NameTable {
    pub fn new() -> Self {
        let mut t = NameTable {
            arena: Arena::new(),
            spans: Vec::new(),
            buckets: HashMap::new(),
        };
        // Id 0 is the empty name, used by trie roots.
        t.intern(b"");
        t
    }

    pub fn intern(&mut self, bytes: &[u8]) -> NameId {
        let h = {
            let mut hasher = DefaultHasher::new();
            bytes.hash(&mut hasher);
            hasher.finish()
        };
        if let Some(ids) = self.buckets.get(&h) {
            for &id in ids {
                if self.arena.get(self.spans[id.0 as usize]) == bytes {
                    return id;
                }
            }
        }
        let span = self.arena.alloc_bytes(bytes);
        let id = NameId(self.spans.len() as u32);
        self.spans.push(span);
        self.buckets.entry(h).or_default().push(id);
        id
    }

    pub fn get(&self, id: NameId) -> &[u8] {
        self.arena.get(self.spans[id.0 as usize])
    }

    pub fn len(&self) -> u32 {
        self.spans.len() as u32
    }

    /// Display form: special names lose their NUL marker.
    pub fn display(&self, id: NameId) -> &[u8] {
        let bytes = self.get(id);
        bytes.strip_prefix(b"\0".as_ref()).unwrap_or(bytes)
    }

    pub fn is_special(&self, id: NameId) -> bool {
        self.get(id).first() == Some(&0)
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &[u8]) -> Result<(), PathError> {
    let body = name.strip_prefix(b"\0".as_ref()).unwrap_or(name);
    if body.is_empty() {
        return Err(PathError::EmptyName);
    }
    if body.contains(&b'/') {
        return Err(PathError::SlashInName);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SubPath

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubPathId(pub u32);

pub struct SubPathNode {
    pub parent: Option<SubPathId>,
    pub name: NameId,
    pub depth: u32,
    /// Sum of fragment byte lengths from the root.
    pub total_len: u32,
    children: HashMap<NameId, SubPathId>,
}

pub struct SubPathTree {
    nodes: Slab<SubPathNode>,
}

impl SubPathTree {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        nodes.alloc(SubPathNode {
            parent: None,
            name: NameId(0),
            depth: 0,
            total_len: 0,
            children: HashMap::new(),
        });
        SubPathTree { nodes }
    }

    pub const ROOT: SubPathId = SubPathId(0);

    pub fn get(&self, id: SubPathId) -> &SubPathNode {
        self.nodes.get(id.0)
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len()
    }

    /// Intern one path segment under `parent`: returns the existing child
    /// of that name or allocates a new one.
    pub fn append_name(
        &mut self,
        names: &mut NameTable,
        parent: SubPathId,
        name: &[u8],
    ) -> Result<SubPathId, PathError> {
        validate_name(name)?;
        let name = names.intern(name);
        Ok(self.append_name_id(names, parent, name))
    }

    /// Append an already-interned segment, bypassing validation.
    pub fn append_name_id(
        &mut self,
        names: &NameTable,
        parent: SubPathId,
        name: NameId,
    ) -> SubPathId {
        if let Some(&child) = self.nodes.get(parent.0).children.get(&name) {
            return child;
        }
        let (depth, total_len) = {
            let p = self.nodes.get(parent.0);
            (p.depth + 1, p.total_len + names.get(name).len() as u32)
        };
        let child = SubPathId(self.nodes.alloc(SubPathNode {
            parent: Some(parent),
            name,
            depth,
            total_len,
            children: HashMap::new(),
        }));
        self.nodes.get_mut(parent.0).children.insert(name, child);
        child
    }

    /// Split `path` on `/` and intern each segment. Empty segments
    /// (leading, trailing, doubled slashes) are skipped, so this cannot
    /// fail.
    pub fn append_path(&mut self, names: &mut NameTable, parent: SubPathId, path: &[u8]) -> SubPathId {
        let mut node = parent;
        for seg in path.split(|&b| b == b'/').filter(|s| !s.is_empty()) {
            let name = names.intern(seg);
            node = self.append_name_id(names, node, name);
        }
        node
    }

    /// Segment chain from the root (root's empty name excluded).
    pub fn segments(&self, id: SubPathId) -> Vec<NameId> {
        let mut segs = Vec::with_capacity(self.get(id).depth as usize);
        let mut cur = id;
        while let Some(parent) = self.get(cur).parent {
            segs.push(self.get(cur).name);
            cur = parent;
        }
        segs.reverse();
        segs
    }

    /// Walk every node in allocation order (parents precede children).
    pub fn iter(&self) -> impl Iterator<Item = (SubPathId, &SubPathNode)> + '_ {
        self.nodes.iter().map(|(i, n)| (SubPathId(i), n))
    }

    /// Deepest ancestor shared by all `nodes`. Empty input yields the root.
    pub fn common_prefix(&self, nodes: &[SubPathId]) -> SubPathId {
        common_prefix_impl(nodes, |id| {
            let n = self.get(id);
            (n.depth, n.parent)
        })
    }
}

impl Default for SubPathTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Equalize chain lengths by climbing the deeper nodes, then climb all in
/// lockstep until the pointers coincide.
fn common_prefix_impl<I: Copy + PartialEq>(
    nodes: &[I],
    info: impl Fn(I) -> (u32, Option<I>),
) -> I {
    assert!(!nodes.is_empty());
    let mut cur: Vec<I> = nodes.to_vec();
    let min_depth = cur.iter().map(|&n| info(n).0).min().unwrap();
    for n in cur.iter_mut() {
        while info(*n).0 > min_depth {
            *n = info(*n).1.unwrap();
        }
    }
    loop {
        let first = cur[0];
        if cur.iter().all(|&n| n == first) {
            return first;
        }
        for n in cur.iter_mut() {
            *n = info(*n).1.expect("chains diverge at the root");
        }
    }
}

/// Lexicographic order of two segment chains' concatenated byte paths.
fn compare_segments(names: &NameTable, a: &[NameId], b: &[NameId]) -> std::cmp::Ordering {
    let la = a.iter().map(|&n| names.get(n));
    let lb = b.iter().map(|&n| names.get(n));
    la.cmp(lb)
}

// ---------------------------------------------------------------------------
// GlobalPath

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalPathId(pub u32);

#[derive(Debug, Clone, Copy)]
pub struct GlobalPathNode {
    pub parent: Option<GlobalPathId>,
    pub sub: SubPathId,
    /// Chain depth (number of links).
    pub depth: u32,
    /// Sum of fragment byte lengths over the whole chain.
    pub total_len: u32,
}

/// Interned chains `(parent, subpath)`: a subvolume mount subpath joined
/// with an in-subvolume path, without copying shared suffixes.
pub struct GlobalPaths {
    nodes: Slab<GlobalPathNode>,
    index: HashMap<(Option<GlobalPathId>, SubPathId), GlobalPathId>,
}

impl GlobalPaths {
    pub fn new() -> Self {
        GlobalPaths {
            nodes: Slab::new(),
            index: HashMap::new(),
        }
    }

    pub fn get(&self, id: GlobalPathId) -> &GlobalPathNode {
        self.nodes.get(id.0)
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len()
    }

    /// Walk every chain link in allocation order (parents precede
    /// children).
    pub fn iter(&self) -> impl Iterator<Item = (GlobalPathId, &GlobalPathNode)> + '_ {
        self.nodes.iter().map(|(i, n)| (GlobalPathId(i), n))
    }

    pub fn intern(
        &mut self,
        subpaths: &SubPathTree,
        parent: Option<GlobalPathId>,
        sub: SubPathId,
    ) -> GlobalPathId {
        if let Some(&id) = self.index.get(&(parent, sub)) {
            return id;
        }
        let (depth, parent_len) = match parent {
            Some(p) => {
                let n = self.get(p);
                (n.depth + 1, n.total_len)
            }
            None => (1, 0),
        };
        let total_len = parent_len + subpaths.get(sub).total_len;
        let id = GlobalPathId(self.nodes.alloc(GlobalPathNode {
            parent,
            sub,
            depth,
            total_len,
        }));
        self.index.insert((parent, sub), id);
        id
    }

    /// All segments of the chain, outermost mount first.
    pub fn segments(&self, subpaths: &SubPathTree, id: GlobalPathId) -> Vec<NameId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(self.get(c).sub);
            cur = self.get(c).parent;
        }
        chain.reverse();
        let mut segs = Vec::new();
        for sub in chain {
            segs.extend(subpaths.segments(sub));
        }
        segs
    }

    pub fn compare(
        &self,
        names: &NameTable,
        subpaths: &SubPathTree,
        a: GlobalPathId,
        b: GlobalPathId,
    ) -> std::cmp::Ordering {
        compare_segments(
            names,
            &self.segments(subpaths, a),
            &self.segments(subpaths, b),
        )
    }
}

impl Default for GlobalPaths {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// BrowserPath

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrowserPathId(pub u32);

/// Which of the three per-node tallies a counter update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Represented = 0,
    Exclusive = 1,
    Shared = 2,
}

pub const SAMPLE_KINDS: [SampleKind; 3] =
    [SampleKind::Represented, SampleKind::Exclusive, SampleKind::Shared];

/// Ring of the last ≤3 offsets observed for a tally, newest overwriting
/// oldest. Part of the export format; round-trips in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetRing {
    pub slots: [u64; 3],
    pub len: u8,
    pub next: u8,
}

impl OffsetRing {
    pub fn push(&mut self, offset: u64) {
        self.slots[self.next as usize] = offset;
        self.next = (self.next + 1) % 3;
        if self.len < 3 {
            self.len += 1;
        }
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(move |i| {
            let slot = (self.next + 3 - 1 - i) % 3;
            self.slots[slot as usize]
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub samples: u64,
    /// Sum of sample resolution durations, in 100 ns units.
    pub duration: u64,
    pub offsets: OffsetRing,
}

impl SampleCounts {
    pub fn add(&mut self, duration: u64, offset: u64) {
        self.samples += 1;
        self.duration += duration;
        self.offsets.push(offset);
    }
}

/// Aggregate payload of one browser node.
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub data: [SampleCounts; 3],
    pub distributed_samples: f64,
    pub distributed_duration: f64,
    /// "Also reachable as": multiset of global paths whose samples touched
    /// this node.
    pub seen_as: HashMap<GlobalPathId, u64>,
    /// Deletion-feature mark; round-trips through exports.
    pub mark: Option<bool>,
}

impl NodeData {
    pub fn counts(&self, kind: SampleKind) -> &SampleCounts {
        &self.data[kind as usize]
    }

    pub fn counts_mut(&mut self, kind: SampleKind) -> &mut SampleCounts {
        &mut self.data[kind as usize]
    }
}

pub struct BrowserNode {
    pub parent: Option<BrowserPathId>,
    pub name: NameId,
    pub depth: u32,
    pub data: NodeData,
    children: HashMap<NameId, BrowserPathId>,
}

/// The trie rooted at the hierarchy the UI displays.
pub struct BrowserTree {
    nodes: Slab<BrowserNode>,
}

impl BrowserTree {
    pub fn new() -> Self {
        let mut nodes = Slab::new();
        nodes.alloc(BrowserNode {
            parent: None,
            name: NameId(0),
            depth: 0,
            data: NodeData::default(),
            children: HashMap::new(),
        });
        BrowserTree { nodes }
    }

    pub const ROOT: BrowserPathId = BrowserPathId(0);

    pub fn get(&self, id: BrowserPathId) -> &BrowserNode {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: BrowserPathId) -> &mut BrowserNode {
        self.nodes.get_mut(id.0)
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len()
    }

    /// Walk every node in allocation order (parents precede children).
    pub fn iter(&self) -> impl Iterator<Item = (BrowserPathId, &BrowserNode)> + '_ {
        self.nodes.iter().map(|(i, n)| (BrowserPathId(i), n))
    }

    pub fn children_of(&self, id: BrowserPathId) -> impl Iterator<Item = BrowserPathId> + '_ {
        self.get(id).children.values().copied()
    }

    pub fn child_by_name(&self, id: BrowserPathId, name: NameId) -> Option<BrowserPathId> {
        self.get(id).children.get(&name).copied()
    }

    pub fn append_name(
        &mut self,
        names: &mut NameTable,
        parent: BrowserPathId,
        name: &[u8],
    ) -> Result<BrowserPathId, PathError> {
        validate_name(name)?;
        let name = names.intern(name);
        Ok(self.append_name_id(parent, name))
    }

    pub fn append_name_id(&mut self, parent: BrowserPathId, name: NameId) -> BrowserPathId {
        if let Some(&child) = self.nodes.get(parent.0).children.get(&name) {
            return child;
        }
        let depth = self.nodes.get(parent.0).depth + 1;
        let child = BrowserPathId(self.nodes.alloc(BrowserNode {
            parent: Some(parent),
            name,
            depth,
            data: NodeData::default(),
            children: HashMap::new(),
        }));
        self.nodes.get_mut(parent.0).children.insert(name, child);
        child
    }

    pub fn append_path(&mut self, names: &mut NameTable, parent: BrowserPathId, path: &[u8]) -> BrowserPathId {
        let mut node = parent;
        for seg in path.split(|&b| b == b'/').filter(|s| !s.is_empty()) {
            let name = names.intern(seg);
            node = self.append_name_id(node, name);
        }
        node
    }

    /// Graft the chain of a SubPath onto this trie.
    pub fn append_subpath(
        &mut self,
        subpaths: &SubPathTree,
        parent: BrowserPathId,
        sub: SubPathId,
    ) -> BrowserPathId {
        let mut node = parent;
        for name in subpaths.segments(sub) {
            node = self.append_name_id(node, name);
        }
        node
    }

    /// Graft the full chain of a GlobalPath onto this trie.
    pub fn append_global(
        &mut self,
        subpaths: &SubPathTree,
        globals: &GlobalPaths,
        parent: BrowserPathId,
        gp: GlobalPathId,
    ) -> BrowserPathId {
        let mut node = parent;
        for name in globals.segments(subpaths, gp) {
            node = self.append_name_id(node, name);
        }
        node
    }

    pub fn segments(&self, id: BrowserPathId) -> Vec<NameId> {
        let mut segs = Vec::with_capacity(self.get(id).depth as usize);
        let mut cur = id;
        while let Some(parent) = self.get(cur).parent {
            segs.push(self.get(cur).name);
            cur = parent;
        }
        segs.reverse();
        segs
    }

    pub fn common_prefix(&self, nodes: &[BrowserPathId]) -> BrowserPathId {
        common_prefix_impl(nodes, |id| {
            let n = self.get(id);
            (n.depth, n.parent)
        })
    }

    pub fn compare(&self, names: &NameTable, a: BrowserPathId, b: BrowserPathId) -> std::cmp::Ordering {
        compare_segments(names, &self.segments(a), &self.segments(b))
    }

    /// Human-readable path: `/`-joined display names.
    pub fn format_path(&self, names: &NameTable, id: BrowserPathId) -> String {
        if id == Self::ROOT {
            return "/".to_owned();
        }
        let mut out = String::new();
        for name in self.segments(id) {
            out.push('/');
            let bytes = names.display(name);
            if names.is_special(name) {
                out.push('<');
                out.push_str(&String::from_utf8_lossy(bytes));
                out.push('>');
            } else {
                out.push_str(&String::from_utf8_lossy(bytes));
            }
        }
        out
    }

    /// Absolute filesystem path, if this node corresponds to one. Special
    /// segments make the path virtual, except the transparency whitelist
    /// which is skipped.
    pub fn real_path(&self, names: &NameTable, id: BrowserPathId) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for name in self.segments(id) {
            let bytes = names.get(name);
            if names.is_special(name) {
                if TRANSPARENT_SPECIALS.contains(&&bytes[1..]) {
                    continue;
                }
                return None;
            }
            out.push(b'/');
            out.extend_from_slice(bytes);
        }
        if out.is_empty() {
            out.push(b'/');
        }
        Some(out)
    }
}

impl Default for BrowserTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Special names skipped when reconstructing absolute filesystem paths.
pub const TRANSPARENT_SPECIALS: [&[u8]; 2] = [b"DATA", b"UNREACHABLE"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_name_interns() {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        let a = tree.append_name(&mut names, SubPathTree::ROOT, b"etc").unwrap();
        let b = tree.append_name(&mut names, SubPathTree::ROOT, b"etc").unwrap();
        assert_eq!(a, b);
        let c = tree.append_name(&mut names, a, b"passwd").unwrap();
        assert_ne!(a, c);
        assert_eq!(tree.get(c).parent, Some(a));
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn invalid_names_rejected() {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        assert_eq!(
            tree.append_name(&mut names, SubPathTree::ROOT, b""),
            Err(PathError::EmptyName)
        );
        assert_eq!(
            tree.append_name(&mut names, SubPathTree::ROOT, b"a/b"),
            Err(PathError::SlashInName)
        );
        // A bare NUL marker has no name body.
        assert_eq!(
            tree.append_name(&mut names, SubPathTree::ROOT, b"\0"),
            Err(PathError::EmptyName)
        );
    }

    #[test]
    fn append_path_skips_empty_segments() {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        let a = tree.append_path(&mut names, SubPathTree::ROOT, b"/usr//share/");
        let b = tree.append_path(&mut names, SubPathTree::ROOT, b"usr/share");
        assert_eq!(a, b);
        assert_eq!(tree.get(a).depth, 2);
    }

    #[test]
    fn common_prefix_walks_to_lca() {
        let mut names = NameTable::new();
        let mut tree = SubPathTree::new();
        let ab = tree.append_path(&mut names, SubPathTree::ROOT, b"a/b");
        let abc = tree.append_path(&mut names, ab, b"c");
        let abd = tree.append_path(&mut names, ab, b"d/e");
        assert_eq!(tree.common_prefix(&[abc, abd]), ab);
        assert_eq!(tree.common_prefix(&[abc]), abc);
        let other = tree.append_path(&mut names, SubPathTree::ROOT, b"z");
        assert_eq!(tree.common_prefix(&[abc, abd, other]), SubPathTree::ROOT);
    }

    #[test]
    fn global_path_concatenates() {
        let mut names = NameTable::new();
        let mut subs = SubPathTree::new();
        let mut globals = GlobalPaths::new();
        let mount = subs.append_path(&mut names, SubPathTree::ROOT, b"@root");
        let file = subs.append_path(&mut names, SubPathTree::ROOT, b"var/log");
        let g1 = globals.intern(&subs, None, mount);
        let g2 = globals.intern(&subs, Some(g1), file);
        let segs = globals.segments(&subs, g2);
        let rendered: Vec<&[u8]> = segs.iter().map(|&n| names.get(n)).collect();
        assert_eq!(rendered, vec![b"@root".as_ref(), b"var".as_ref(), b"log".as_ref()]);
        assert_eq!(globals.get(g2).total_len, 5 + 3 + 3);
        // Interning is idempotent.
        assert_eq!(globals.intern(&subs, Some(g1), file), g2);
    }

    #[test]
    fn offset_ring_keeps_newest_three() {
        let mut ring = OffsetRing::default();
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![2, 1]);
        ring.push(3);
        ring.push(4);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![4, 3, 2]);
    }

    #[test]
    fn browser_display_strips_special_marker() {
        let mut names = NameTable::new();
        let mut tree = BrowserTree::new();
        let data = tree.append_name(&mut names, BrowserTree::ROOT, b"\0DATA").unwrap();
        let single = tree.append_name(&mut names, data, b"\0SINGLE").unwrap();
        let file = tree.append_path(&mut names, single, b"@root/a");
        assert_eq!(tree.format_path(&names, file), "/<DATA>/<SINGLE>/@root/a");
        // DATA is transparent for real paths; SINGLE is not.
        assert_eq!(tree.real_path(&names, data), Some(b"/".to_vec()));
        assert_eq!(tree.real_path(&names, file), None);
    }
}
