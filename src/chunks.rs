//! Inventory of sampling zones and the mapping from a uniform draw in
//! `[0, total)` to a concrete filesystem offset.
//!
//! Logical mode: one zone per chunk-tree entry. Physical mode: one zone
//! per device extent, plus `HOLE` zones for unallocated gaps and a `SLACK`
//! zone for the device tail past the filesystem.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::btrfs;

/// Field value for "unknown / not applicable".
pub const OFFSET_NONE: u64 = u64::MAX;
/// Logical sentinel: unallocated physical space (physical mode only).
pub const LOGICAL_HOLE: u64 = u64::MAX - 1;
/// Logical sentinel: physical space past the end of the filesystem but
/// within the device.
pub const LOGICAL_SLACK: u64 = u64::MAX - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub logical: u64,
    pub dev_id: u64,
    pub physical: u64,
}

impl Offset {
    pub const NONE: Offset = Offset {
        logical: OFFSET_NONE,
        dev_id: OFFSET_NONE,
        physical: OFFSET_NONE,
    };
}

/// Stripe placement of one device extent within its chunk, for the
/// physical→logical approximation.
#[derive(Debug, Clone, Copy)]
pub struct StripeGeometry {
    pub stripe_len: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    /// Index of this extent among the chunk's stripes.
    pub stripe_index: u16,
}

/// One contiguous sampling zone. Append-only after startup.
#[derive(Debug, Clone)]
pub struct Zone {
    /// Cumulative start position in the sampling space.
    pub pos: u64,
    pub length: u64,
    /// Block-group type and profile bits; 0 for HOLE and SLACK zones.
    pub flags: u64,
    /// Chunk logical start, or `LOGICAL_HOLE` / `LOGICAL_SLACK`.
    pub logical_offset: u64,
    pub dev_id: u64,
    pub physical_offset: u64,
    pub geometry: Option<StripeGeometry>,
}

impl Zone {
    /// Offset triple for a draw `delta` bytes into this zone.
    pub fn offset_at(&self, delta: u64) -> Offset {
        let physical = if self.physical_offset == OFFSET_NONE {
            OFFSET_NONE
        } else {
            self.physical_offset + delta
        };
        let logical = match self.logical_offset {
            LOGICAL_HOLE => LOGICAL_HOLE,
            LOGICAL_SLACK => LOGICAL_SLACK,
            base => base + self.logical_delta(delta),
        };
        Offset {
            logical,
            dev_id: self.dev_id,
            physical,
        }
    }

    /// Translate a byte delta within this (physical) extent into a delta
    /// within the chunk's logical space. Exact for contiguous profiles;
    /// an approximation for striped ones, and deliberately so for
    /// RAID5/6, where parity blocks have no logical address at all.
    fn logical_delta(&self, delta: u64) -> u64 {
        let geo = match self.geometry {
            Some(geo) if geo.stripe_len > 0 => geo,
            _ => return delta,
        };
        let data_stripes = {
            let n = geo.num_stripes as u64;
            let flags = self.flags;
            if flags & btrfs::BTRFS_BLOCK_GROUP_RAID0 as u64 != 0 {
                n
            } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID10 as u64 != 0 {
                n / geo.sub_stripes.max(1) as u64
            } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID5 as u64 != 0 {
                n.saturating_sub(1).max(1)
            } else if flags & btrfs::BTRFS_BLOCK_GROUP_RAID6 as u64 != 0 {
                n.saturating_sub(2).max(1)
            } else {
                // SINGLE, DUP, RAID1*: one data stripe, contiguous.
                return delta;
            }
        };
        let stripe_nr = delta / geo.stripe_len;
        let within = delta % geo.stripe_len;
        (stripe_nr * data_stripes + geo.stripe_index as u64) * geo.stripe_len + within
    }
}

/// A resolved draw: the zone's flags plus the offset triple.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedOffset {
    pub flags: u64,
    pub offset: Offset,
}

/// Polymorphism point over the sampling mode; the classifier never looks
/// past this trait.
pub trait SamplingSpace {
    fn total(&self) -> u64;
    fn resolve(&self, u: u64) -> ResolvedOffset;
}

/// Shared zone inventory: zones sorted by cumulative position.
pub struct ZoneIndex {
    zones: Vec<Zone>,
    total: u64,
}

impl ZoneIndex {
    pub fn from_zones(mut zones: Vec<Zone>) -> Self {
        let mut pos = 0;
        for z in zones.iter_mut() {
            z.pos = pos;
            pos += z.length;
        }
        ZoneIndex { zones, total: pos }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// The zone containing sampling-space position `u`.
    pub fn offset_to_zone(&self, u: u64) -> &Zone {
        debug_assert!(u < self.total);
        let i = self
            .zones
            .partition_point(|z| z.pos + z.length <= u);
        &self.zones[i]
    }

    pub fn resolve(&self, u: u64) -> ResolvedOffset {
        let zone = self.offset_to_zone(u);
        ResolvedOffset {
            flags: zone.flags,
            offset: zone.offset_at(u - zone.pos),
        }
    }
}

/// Logical addressing space: one zone per chunk.
pub struct LogicalSpace {
    index: ZoneIndex,
}

impl LogicalSpace {
    pub fn enumerate(fd: RawFd) -> Result<Self, Errno> {
        let mut zones = Vec::new();
        btrfs::enumerate_chunks(fd, |chunk| {
            zones.push(Zone {
                pos: 0,
                length: chunk.length,
                flags: chunk.type_,
                logical_offset: chunk.logical_offset,
                dev_id: OFFSET_NONE,
                physical_offset: OFFSET_NONE,
                geometry: None,
            });
        })?;
        Ok(LogicalSpace {
            index: ZoneIndex::from_zones(zones),
        })
    }

    pub fn from_zones(zones: Vec<Zone>) -> Self {
        LogicalSpace {
            index: ZoneIndex::from_zones(zones),
        }
    }

    pub fn index(&self) -> &ZoneIndex {
        &self.index
    }
}

impl SamplingSpace for LogicalSpace {
    fn total(&self) -> u64 {
        self.index.total()
    }

    fn resolve(&self, u: u64) -> ResolvedOffset {
        self.index.resolve(u)
    }
}

/// Physical addressing space: device extents, holes and slack, per device.
pub struct PhysicalSpace {
    index: ZoneIndex,
}

impl PhysicalSpace {
    pub fn enumerate(fd: RawFd) -> Result<Self, Errno> {
        struct ChunkGeom {
            flags: u64,
            stripe_len: u64,
            num_stripes: u16,
            sub_stripes: u16,
            stripes: Vec<(u64, u64)>,
        }

        let mut chunks: std::collections::HashMap<u64, ChunkGeom> = Default::default();
        btrfs::enumerate_chunks(fd, |chunk| {
            chunks.insert(
                chunk.logical_offset,
                ChunkGeom {
                    flags: chunk.type_,
                    stripe_len: chunk.stripe_len,
                    num_stripes: chunk.num_stripes,
                    sub_stripes: chunk.sub_stripes,
                    stripes: chunk.stripes,
                },
            );
        })?;

        let devices = list_devices(fd)?;

        let mut extents: Vec<btrfs::DevExtentItem> = Vec::new();
        btrfs::enumerate_dev_extents(fd, |ext| extents.push(ext))?;

        let mut zones = Vec::new();
        for dev in &devices {
            let mut cursor = 0u64;
            for ext in extents.iter().filter(|e| e.devid == dev.devid) {
                if ext.physical_offset > cursor {
                    zones.push(hole_zone(dev.devid, cursor, ext.physical_offset - cursor));
                }
                let geometry = chunks.get(&ext.chunk_logical).map(|c| StripeGeometry {
                    stripe_len: c.stripe_len,
                    num_stripes: c.num_stripes,
                    sub_stripes: c.sub_stripes,
                    stripe_index: c
                        .stripes
                        .iter()
                        .position(|&(d, p)| d == dev.devid && p == ext.physical_offset)
                        .unwrap_or(0) as u16,
                });
                zones.push(Zone {
                    pos: 0,
                    length: ext.length,
                    flags: chunks.get(&ext.chunk_logical).map_or(0, |c| c.flags),
                    logical_offset: ext.chunk_logical,
                    dev_id: dev.devid,
                    physical_offset: ext.physical_offset,
                    geometry,
                });
                cursor = ext.physical_offset + ext.length;
            }
            if dev.total_bytes > cursor {
                zones.push(hole_zone(dev.devid, cursor, dev.total_bytes - cursor));
            }
            // Anything on the block device past the filesystem is slack.
            if let Ok(size) = btrfs::device_size(&dev.path) {
                if size > dev.total_bytes {
                    zones.push(Zone {
                        pos: 0,
                        length: size - dev.total_bytes,
                        flags: 0,
                        logical_offset: LOGICAL_SLACK,
                        dev_id: dev.devid,
                        physical_offset: dev.total_bytes,
                        geometry: None,
                    });
                }
            }
        }

        Ok(PhysicalSpace {
            index: ZoneIndex::from_zones(zones),
        })
    }

    pub fn from_zones(zones: Vec<Zone>) -> Self {
        PhysicalSpace {
            index: ZoneIndex::from_zones(zones),
        }
    }

    pub fn index(&self) -> &ZoneIndex {
        &self.index
    }
}

impl SamplingSpace for PhysicalSpace {
    fn total(&self) -> u64 {
        self.index.total()
    }

    fn resolve(&self, u: u64) -> ResolvedOffset {
        self.index.resolve(u)
    }
}

fn hole_zone(devid: u64, physical: u64, length: u64) -> Zone {
    Zone {
        pos: 0,
        length,
        flags: 0,
        logical_offset: LOGICAL_HOLE,
        dev_id: devid,
        physical_offset: physical,
        geometry: None,
    }
}

/// All present devices of the filesystem, in devid order.
pub fn list_devices(fd: RawFd) -> Result<Vec<btrfs::DevInfo>, Errno> {
    let info = btrfs::fs_info(fd)?;
    let mut devices = Vec::with_capacity(info.num_devices as usize);
    for devid in 0..=info.max_id {
        if let Some(dev) = btrfs::dev_info(fd, devid)? {
            devices.push(dev);
        }
        if devices.len() as u64 == info.num_devices {
            break;
        }
    }
    Ok(devices)
}
