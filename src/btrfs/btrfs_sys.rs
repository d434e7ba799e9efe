//! Kernel ABI for the btrfs ioctl surface. Layouts follow
//! include/uapi/linux/btrfs.h and btrfs_tree.h; on-disk items are packed
//! little-endian, ioctl argument structs are native layout.

#![allow(non_camel_case_types)]

pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;

pub const BTRFS_ROOT_TREE_OBJECTID: u32 = 1;
pub const BTRFS_CHUNK_TREE_OBJECTID: u32 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u32 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u32 = 5;
pub const BTRFS_FIRST_FREE_OBJECTID: u32 = 256;

pub const BTRFS_ROOT_ITEM_KEY: u32 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u32 = 144;
pub const BTRFS_DEV_EXTENT_KEY: u32 = 204;
pub const BTRFS_DEV_ITEM_KEY: u32 = 216;
pub const BTRFS_CHUNK_ITEM_KEY: u32 = 228;

pub const BTRFS_BLOCK_GROUP_DATA: u32 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u32 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u32 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u32 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u32 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u32 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u32 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u32 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u32 = 1 << 8;
pub const BTRFS_BLOCK_GROUP_RAID1C3: u32 = 1 << 9;
pub const BTRFS_BLOCK_GROUP_RAID1C4: u32 = 1 << 10;

pub const BTRFS_BLOCK_GROUP_TYPE_MASK: u32 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_METADATA;
pub const BTRFS_BLOCK_GROUP_PROFILE_MASK: u32 = BTRFS_BLOCK_GROUP_RAID0
    | BTRFS_BLOCK_GROUP_RAID1
    | BTRFS_BLOCK_GROUP_DUP
    | BTRFS_BLOCK_GROUP_RAID10
    | BTRFS_BLOCK_GROUP_RAID5
    | BTRFS_BLOCK_GROUP_RAID6
    | BTRFS_BLOCK_GROUP_RAID1C3
    | BTRFS_BLOCK_GROUP_RAID1C4;

pub const BTRFS_ROOT_SUBVOL_RDONLY: u64 = 1 << 0;

pub const BTRFS_LOGICAL_INO_ARGS_IGNORE_OFFSET: u32 = 1 << 0;

pub const BTRFS_INO_LOOKUP_PATH_MAX: usize = 4080;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_ioctl_search_key {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_ioctl_search_header {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub type_: u32,
    pub len: u32,
}

#[repr(C)]
pub struct btrfs_ioctl_search_args_v2 {
    pub key: btrfs_ioctl_search_key,
    pub buf_size: u64,
    pub buf: [u64; 0],
}

#[repr(C)]
pub struct btrfs_ioctl_ino_lookup_args {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; BTRFS_INO_LOOKUP_PATH_MAX],
}

#[repr(C)]
pub struct btrfs_ioctl_ino_path_args {
    pub inum: u64,
    pub size: u64,
    pub reserved: [u64; 4],
    pub fspath: u64,
}

#[repr(C)]
pub struct btrfs_ioctl_logical_ino_args {
    pub logical: u64,
    pub size: u64,
    pub reserved: [u64; 3],
    pub flags: u64,
    pub inodes: u64,
}

#[repr(C)]
pub struct btrfs_data_container {
    pub bytes_left: u32,
    pub bytes_missing: u32,
    pub elem_cnt: u32,
    pub elem_missed: u32,
    pub val: [u64; 0],
}

#[repr(C)]
pub struct btrfs_ioctl_fs_info_args {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; 16],
    pub nodesize: u32,
    pub sectorsize: u32,
    pub clone_alignment: u32,
    pub reserved32: u32,
    pub reserved: [u64; 122],
}

#[repr(C)]
pub struct btrfs_ioctl_dev_info_args {
    pub devid: u64,
    pub uuid: [u8; 16],
    pub bytes_used: u64,
    pub total_bytes: u64,
    pub unused: [u64; 379],
    pub path: [u8; 1024],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_chunk {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub type_: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripe: btrfs_stripe,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_root_ref {
    pub dirid: u64,
    pub sequence: u64,
    pub name_len: u16,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_dev_extent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: [u8; 16],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_timespec {
    pub sec: u64,
    pub nsec: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_disk_key {
    pub objectid: u64,
    pub type_: u8,
    pub offset: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_inode_item {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub reserved: [u64; 4],
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: btrfs_disk_key,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: u64,
    pub uuid: [u8; 16],
    pub parent_uuid: [u8; 16],
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: btrfs_timespec,
    pub atime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
    pub reserved: [u64; 8],
}

/// Size of the v1 root item (everything up to and including `level`).
/// Older filesystems may return items this short; the v2 tail (otime etc.)
/// is absent there.
pub const BTRFS_ROOT_ITEM_V1_LEN: usize = 160 + 7 * 8 + 4 + 17 + 2;
