//! Thin wrappers over the btrfs ioctl surface. Callback-style where the
//! result borrows a kernel-filled buffer on our stack.

use std::ffi::CStr;
use std::ops::RangeInclusive;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::errno::Errno;

mod btrfs_sys;
mod util;

pub use btrfs_sys::*;
use util::WithMemAfter;

mod ioctl {
    use super::*;
    nix::ioctl_readwrite!(search_v2, BTRFS_IOCTL_MAGIC, 17, btrfs_ioctl_search_args_v2);
    nix::ioctl_readwrite!(ino_lookup, BTRFS_IOCTL_MAGIC, 18, btrfs_ioctl_ino_lookup_args);
    nix::ioctl_readwrite!(dev_info, BTRFS_IOCTL_MAGIC, 30, btrfs_ioctl_dev_info_args);
    nix::ioctl_read!(fs_info, BTRFS_IOCTL_MAGIC, 31, btrfs_ioctl_fs_info_args);
    nix::ioctl_readwrite!(ino_paths, BTRFS_IOCTL_MAGIC, 35, btrfs_ioctl_ino_path_args);
    nix::ioctl_readwrite!(logical_ino, BTRFS_IOCTL_MAGIC, 36, btrfs_ioctl_logical_ino_args);
    nix::ioctl_readwrite!(logical_ino_v2, BTRFS_IOCTL_MAGIC, 59, btrfs_ioctl_logical_ino_args);
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LogicalInoItem {
    pub inum: u64,
    pub offset: u64,
    pub root: u64,
}

/// Resolve a logical offset to the set of (inode, offset, root) triples
/// referencing it. `ignoring_offset` searches extent-wide, finding
/// references through reflinks at other file offsets.
pub fn logical_ino(
    fd: RawFd,
    logical: u64,
    ignoring_offset: bool,
    mut cb: impl FnMut(Result<&[LogicalInoItem], Errno>),
) {
    let mut data = WithMemAfter::<btrfs_data_container, 65536>::new();

    let mut args = btrfs_ioctl_logical_ino_args {
        logical,
        size: data.total_size() as u64,
        reserved: Default::default(),
        flags: if ignoring_offset {
            BTRFS_LOGICAL_INO_ARGS_IGNORE_OFFSET as u64
        } else {
            0
        },
        inodes: data.as_mut_ptr() as u64,
    };
    unsafe {
        match ioctl::logical_ino_v2(fd, &mut args) {
            Ok(_) => {
                let inodes = std::slice::from_raw_parts(
                    data.extra_ptr() as *const LogicalInoItem,
                    (data.elem_cnt / 3) as usize,
                );
                cb(Ok(inodes));
            }
            Err(err) => cb(Err(err)),
        }
    }
}

/// All paths of an inode within the subvolume `fd` belongs to.
pub fn ino_paths(fd: RawFd, inum: u64, mut cb: impl FnMut(Result<&[&CStr], Errno>)) {
    let mut data = WithMemAfter::<btrfs_data_container, 65536>::new();

    let mut args = btrfs_ioctl_ino_path_args {
        inum,
        size: data.total_size() as u64,
        reserved: Default::default(),
        fspath: data.as_mut_ptr() as u64,
    };
    unsafe {
        match ioctl::ino_paths(fd, &mut args) {
            Ok(_) => {
                // val[i] is a byte offset of a NUL-terminated string,
                // relative to the start of the val area.
                let offsets = std::slice::from_raw_parts(
                    data.extra_ptr() as *const u64,
                    data.elem_cnt as usize,
                );
                let paths: Vec<&CStr> = offsets
                    .iter()
                    .map(|&off| CStr::from_ptr(data.extra_ptr().add(off as usize) as *const _))
                    .collect();
                cb(Ok(&paths));
            }
            Err(err) => cb(Err(err)),
        }
    }
}

/// One path of an inode, relative to the root of tree `treeid`.
pub fn ino_lookup(fd: RawFd, treeid: u64, objectid: u64, mut cb: impl FnMut(Result<&CStr, Errno>)) {
    let mut args = btrfs_ioctl_ino_lookup_args {
        treeid,
        objectid,
        name: [0; BTRFS_INO_LOOKUP_PATH_MAX],
    };

    unsafe {
        match ioctl::ino_lookup(fd, &mut args) {
            Ok(_) => cb(Ok(CStr::from_ptr(args.name.as_ptr() as *const _))),
            Err(err) => cb(Err(err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SearchKey {
    pub objectid: u64,
    pub typ: u8,
    pub offset: u64,
}

impl SearchKey {
    pub const MIN: Self = SearchKey::new(u64::MIN, u8::MIN, u64::MIN);
    pub const MAX: Self = SearchKey::new(u64::MAX, u8::MAX, u64::MAX);

    pub const ALL: RangeInclusive<Self> = Self::MIN..=Self::MAX;

    pub const fn range_fixed_id(objectid: u64) -> RangeInclusive<Self> {
        Self::new(objectid, u8::MIN, u64::MIN)..=Self::new(objectid, u8::MAX, u64::MAX)
    }

    pub const fn range_fixed_id_type(objectid: u64, typ: u8) -> RangeInclusive<Self> {
        Self::new(objectid, typ, u64::MIN)..=Self::new(objectid, typ, u64::MAX)
    }

    pub const fn new(objectid: u64, typ: u8, offset: u64) -> Self {
        Self { objectid, typ, offset }
    }

    /// Successor key in (objectid, type, offset) order.
    pub fn next(&self) -> Self {
        let (offset, carry) = self.offset.overflowing_add(1);
        let (typ, carry) = if carry {
            self.typ.overflowing_add(1)
        } else {
            (self.typ, false)
        };
        let objectid = if carry { self.objectid.wrapping_add(1) } else { self.objectid };
        SearchKey { objectid, typ, offset }
    }

    fn from(h: &btrfs_ioctl_search_header) -> Self {
        SearchKey {
            objectid: h.objectid,
            typ: h.type_ as u8,
            offset: h.offset,
        }
    }
}

/// Paginated TREE_SEARCH_V2 over `tree_id`, invoking `cb` for every item
/// header + payload in the key range.
pub fn tree_search_cb(
    fd: RawFd,
    tree_id: u64,
    range: RangeInclusive<SearchKey>,
    mut cb: impl FnMut(&btrfs_ioctl_search_header, &[u8]),
) -> Result<(), Errno> {
    let mut args = WithMemAfter::<btrfs_ioctl_search_args_v2, { 16 * 1024 }>::new();
    args.key = btrfs_ioctl_search_key {
        tree_id,
        min_objectid: range.start().objectid,
        max_objectid: range.end().objectid,
        min_offset: range.start().offset,
        max_offset: range.end().offset,
        min_transid: u64::MIN,
        max_transid: u64::MAX,
        min_type: range.start().typ as u32,
        max_type: range.end().typ as u32,
        nr_items: u32::MAX,

        unused: 0,
        unused1: 0,
        unused2: 0,
        unused3: 0,
        unused4: 0,
    };
    args.buf_size = args.extra_size() as u64;

    loop {
        args.key.nr_items = u32::MAX;
        unsafe {
            ioctl::search_v2(fd, args.as_mut_ptr())?;
        }
        if args.key.nr_items == 0 {
            break;
        }

        let mut ptr = args.buf.as_ptr() as *const u8;
        let mut last_key = SearchKey::MIN;
        for _ in 0..args.key.nr_items {
            // Item payloads have arbitrary lengths, so subsequent headers
            // are not necessarily aligned. Copy the header out.
            let header = unsafe { (ptr as *const btrfs_ioctl_search_header).read_unaligned() };
            let data = unsafe {
                std::slice::from_raw_parts(
                    ptr.add(std::mem::size_of::<btrfs_ioctl_search_header>()),
                    header.len as usize,
                )
            };
            ptr = unsafe {
                ptr.add(std::mem::size_of::<btrfs_ioctl_search_header>() + header.len as usize)
            };
            last_key = SearchKey::from(&header);
            cb(&header, data);
        }

        let min_key = last_key.next();
        args.key.min_objectid = min_key.objectid;
        args.key.min_type = min_key.typ as u32;
        args.key.min_offset = min_key.offset;
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct RootBackref {
    pub parent_id: u64,
    pub dirid: u64,
    pub name: Vec<u8>,
}

/// The backref of `root_id` in the root tree: which parent subvolume it
/// hangs off, under which directory inode, and its name there.
pub fn find_root_backref(fd: RawFd, root_id: u64) -> Result<Option<RootBackref>, Errno> {
    let mut res = None;
    tree_search_cb(
        fd,
        BTRFS_ROOT_TREE_OBJECTID as u64,
        SearchKey::range_fixed_id_type(root_id, BTRFS_ROOT_BACKREF_KEY as u8),
        |sh, data| {
            if sh.type_ == BTRFS_ROOT_BACKREF_KEY {
                let root_ref = unsafe { &*(data.as_ptr() as *const btrfs_root_ref) };
                let name_off = std::mem::size_of::<btrfs_root_ref>();
                let name = data[name_off..name_off + root_ref.name_len as usize].to_vec();
                res = Some(RootBackref {
                    parent_id: sh.offset,
                    dirid: root_ref.dirid,
                    name,
                });
            }
        },
    )?;
    Ok(res)
}

#[derive(Debug, Clone, Copy)]
pub struct RootInfo {
    pub generation: u64,
    pub otime_sec: u64,
    pub readonly: bool,
}

/// Generation, creation time and read-only flag of a subvolume root.
pub fn read_root_item(fd: RawFd, root_id: u64) -> Result<Option<RootInfo>, Errno> {
    let mut res = None;
    tree_search_cb(
        fd,
        BTRFS_ROOT_TREE_OBJECTID as u64,
        SearchKey::range_fixed_id_type(root_id, BTRFS_ROOT_ITEM_KEY as u8),
        |sh, data| {
            if sh.type_ == BTRFS_ROOT_ITEM_KEY && data.len() >= BTRFS_ROOT_ITEM_V1_LEN {
                let item = unsafe { &*(data.as_ptr() as *const btrfs_root_item) };
                // Pre-v2 root items stop after `level`; no otime there.
                let has_v2_tail = data.len() >= std::mem::size_of::<btrfs_root_item>();
                res = Some(RootInfo {
                    generation: item.generation,
                    otime_sec: if has_v2_tail { item.otime.sec } else { 0 },
                    readonly: item.flags & BTRFS_ROOT_SUBVOL_RDONLY != 0,
                });
            }
        },
    )?;
    Ok(res)
}

#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub fsid: [u8; 16],
    pub num_devices: u64,
    pub max_id: u64,
    pub nodesize: u32,
    pub sectorsize: u32,
}

pub fn fs_info(fd: RawFd) -> Result<FsInfo, Errno> {
    let mut args: btrfs_ioctl_fs_info_args = unsafe { std::mem::zeroed() };
    unsafe {
        ioctl::fs_info(fd, &mut args)?;
    }
    Ok(FsInfo {
        fsid: args.fsid,
        num_devices: args.num_devices,
        max_id: args.max_id,
        nodesize: args.nodesize,
        sectorsize: args.sectorsize,
    })
}

#[derive(Debug, Clone)]
pub struct DevInfo {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub path: PathBuf,
}

/// Per-device info; `None` when the devid slot is vacant (device ids are
/// sparse up to `max_id` after removals).
pub fn dev_info(fd: RawFd, devid: u64) -> Result<Option<DevInfo>, Errno> {
    let mut args: btrfs_ioctl_dev_info_args = unsafe { std::mem::zeroed() };
    args.devid = devid;
    unsafe {
        match ioctl::dev_info(fd, &mut args) {
            Ok(_) => {}
            Err(Errno::ENODEV) => return Ok(None),
            Err(err) => return Err(err),
        }
    }
    let len = args.path.iter().position(|&b| b == 0).unwrap_or(args.path.len());
    let path = PathBuf::from(String::from_utf8_lossy(&args.path[..len]).into_owned());
    Ok(Some(DevInfo {
        devid: args.devid,
        total_bytes: args.total_bytes,
        bytes_used: args.bytes_used,
        path,
    }))
}

#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub logical_offset: u64,
    pub length: u64,
    pub type_: u64,
    pub stripe_len: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    /// (devid, physical offset) per stripe.
    pub stripes: Vec<(u64, u64)>,
}

/// Enumerate the chunk tree. Chunks arrive in logical-offset order.
pub fn enumerate_chunks(fd: RawFd, mut cb: impl FnMut(ChunkItem)) -> Result<(), Errno> {
    tree_search_cb(fd, BTRFS_CHUNK_TREE_OBJECTID as u64, SearchKey::ALL, |sh, data| {
        if sh.type_ != BTRFS_CHUNK_ITEM_KEY {
            return;
        }
        let chunk = unsafe { &*(data.as_ptr() as *const btrfs_chunk) };
        let num_stripes = chunk.num_stripes;
        let first_stripe = std::mem::size_of::<btrfs_chunk>() - std::mem::size_of::<btrfs_stripe>();
        let mut stripes = Vec::with_capacity(num_stripes as usize);
        for i in 0..num_stripes as usize {
            let off = first_stripe + i * std::mem::size_of::<btrfs_stripe>();
            if off + std::mem::size_of::<btrfs_stripe>() > data.len() {
                break;
            }
            let stripe = unsafe { &*(data.as_ptr().add(off) as *const btrfs_stripe) };
            stripes.push((stripe.devid, stripe.offset));
        }
        cb(ChunkItem {
            logical_offset: sh.offset,
            length: chunk.length,
            type_: chunk.type_,
            stripe_len: chunk.stripe_len,
            num_stripes,
            sub_stripes: chunk.sub_stripes,
            stripes,
        });
    })
}

#[derive(Debug, Clone, Copy)]
pub struct DevExtentItem {
    pub devid: u64,
    pub physical_offset: u64,
    pub length: u64,
    pub chunk_logical: u64,
}

/// Enumerate device extents (device tree), ordered by (devid, physical).
pub fn enumerate_dev_extents(fd: RawFd, mut cb: impl FnMut(DevExtentItem)) -> Result<(), Errno> {
    tree_search_cb(fd, BTRFS_DEV_TREE_OBJECTID as u64, SearchKey::ALL, |sh, data| {
        if sh.type_ != BTRFS_DEV_EXTENT_KEY {
            return;
        }
        let ext = unsafe { &*(data.as_ptr() as *const btrfs_dev_extent) };
        cb(DevExtentItem {
            devid: sh.objectid,
            physical_offset: sh.offset,
            length: ext.length,
            chunk_logical: ext.chunk_offset,
        });
    })
}

/// Size in bytes of the block device (or image file) at `path`.
pub fn device_size(path: &std::path::Path) -> Result<u64, Errno> {
    use nix::fcntl::{self, OFlag};
    use nix::sys::stat::{self, Mode, SFlag};

    let fd = fcntl::open(path, OFlag::O_RDONLY, Mode::empty())?;
    let res = (|| {
        let st = stat::fstat(fd)?;
        if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFBLK) {
            let mut size = 0u64;
            unsafe {
                ioctl::blkgetsize64(fd, &mut size)?;
            }
            Ok(size)
        } else {
            Ok(st.st_size as u64)
        }
    })();
    let _ = nix::unistd::close(fd);
    res
}
