//! FAT16/FAT32 metadata parser.
//!
//! Deletion on FAT marks the directory entry's first name byte 0xE5 and
//! frees the cluster chain in the FAT. The entry keeps the start cluster
//! and file size, so recovery checks the start cluster is still free and
//! reconstructs the extent by the contiguity assumption.

use std::collections::{HashSet, VecDeque};

use super::{
    DeletedEntry, FilesystemError, FilesystemParser, FilesystemVariant, ResolvedExtent,
    read_u16_le, read_u32_le,
};
use crate::io::BlockDeviceReader;
use crate::types::Confidence;

const DIR_ENTRY_SIZE: usize = 32;
const DELETED_MARKER: u8 = 0xE5;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;

/// Caps against corrupt structures sending the walk into the weeds.
const MAX_DIRECTORIES: usize = 256;
const MAX_DIR_CLUSTERS: usize = 1024;
const MAX_CHAIN_PROBE: u64 = 1 << 20;

pub fn probe(boot: &[u8]) -> bool {
    if boot.len() < 512 || boot[510] != 0x55 || boot[511] != 0xAA {
        return false;
    }
    let fat16_label = boot.get(54..57) == Some(b"FAT");
    let fat32_label = boot.get(82..85) == Some(b"FAT");
    (fat16_label || fat32_label) && read_u16_le(boot, 11).is_some_and(plausible_sector_size)
}

fn plausible_sector_size(bps: u16) -> bool {
    matches!(bps, 512 | 1024 | 2048 | 4096)
}

struct FatGeometry {
    variant: FilesystemVariant,
    cluster_size: u64,
    fat_start: u64,
    root_dir_start: u64,
    root_entry_count: u64,
    root_cluster: u64,
    data_start: u64,
    cluster_count: u64,
}

impl FatGeometry {
    fn parse(boot: &[u8]) -> Result<Self, FilesystemError> {
        let invalid = |msg: &str| FilesystemError::InvalidBootSector(msg.to_string());

        let bps = read_u16_le(boot, 11).ok_or_else(|| invalid("short boot sector"))? as u64;
        if !plausible_sector_size(bps as u16) {
            return Err(invalid("implausible sector size"));
        }
        let spc = boot[13] as u64;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(invalid("implausible sectors per cluster"));
        }
        let reserved = read_u16_le(boot, 14).unwrap_or(0) as u64;
        let num_fats = boot[16] as u64;
        if reserved == 0 || num_fats == 0 || num_fats > 4 {
            return Err(invalid("implausible reserved/FAT counts"));
        }

        let root_entry_count = read_u16_le(boot, 17).unwrap_or(0) as u64;
        let total_sectors_16 = read_u16_le(boot, 19).unwrap_or(0) as u64;
        let fat_size_16 = read_u16_le(boot, 22).unwrap_or(0) as u64;
        let total_sectors_32 = read_u32_le(boot, 32).unwrap_or(0) as u64;
        let fat_size_32 = read_u32_le(boot, 36).unwrap_or(0) as u64;

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };
        let fat_size = if fat_size_16 != 0 { fat_size_16 } else { fat_size_32 };
        if total_sectors == 0 || fat_size == 0 {
            return Err(invalid("zero volume or FAT size"));
        }

        let root_dir_sectors = (root_entry_count * DIR_ENTRY_SIZE as u64).div_ceil(bps);
        let first_data_sector = reserved + num_fats * fat_size + root_dir_sectors;
        if first_data_sector >= total_sectors {
            return Err(invalid("data region lies past the volume end"));
        }
        let cluster_count = (total_sectors - first_data_sector) / spc;

        let variant = if cluster_count < 4085 {
            return Err(invalid("FAT12 volumes are not supported"));
        } else if cluster_count < 65525 {
            FilesystemVariant::Fat16
        } else {
            FilesystemVariant::Fat32
        };

        Ok(Self {
            variant,
            cluster_size: bps * spc,
            fat_start: reserved * bps,
            root_dir_start: (reserved + num_fats * fat_size) * bps,
            root_entry_count,
            root_cluster: read_u32_le(boot, 44).unwrap_or(0) as u64,
            data_start: first_data_sector * bps,
            cluster_count,
        })
    }

    fn cluster_offset(&self, cluster: u64) -> Option<u64> {
        if self.is_valid_cluster(cluster) {
            Some(self.data_start + (cluster - 2) * self.cluster_size)
        } else {
            None
        }
    }

    fn is_valid_cluster(&self, cluster: u64) -> bool {
        cluster >= 2 && cluster < 2 + self.cluster_count
    }

    fn is_end_of_chain(&self, value: u64) -> bool {
        match self.variant {
            FilesystemVariant::Fat16 => value >= 0xFFF8,
            _ => value >= 0x0FFF_FFF8,
        }
    }
}

pub struct FatParser<'a> {
    device: &'a dyn BlockDeviceReader,
    geom: FatGeometry,
}

impl<'a> FatParser<'a> {
    pub fn new(device: &'a dyn BlockDeviceReader, boot: &[u8]) -> Result<Self, FilesystemError> {
        let geom = FatGeometry::parse(boot)?;
        Ok(Self { device, geom })
    }

    fn fat_entry(&self, cluster: u64) -> Result<u64, FilesystemError> {
        let (offset, width) = match self.geom.variant {
            FilesystemVariant::Fat16 => (self.geom.fat_start + cluster * 2, 2usize),
            _ => (self.geom.fat_start + cluster * 4, 4usize),
        };
        let bytes = self.device.read_at(offset, width)?;
        if bytes.len() < width {
            return Err(FilesystemError::CorruptedMetadata(
                "allocation table truncated".into(),
            ));
        }
        Ok(match self.geom.variant {
            FilesystemVariant::Fat16 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
            _ => (u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x0FFF_FFFF) as u64,
        })
    }

    /// Bytes of a live directory: fixed root region on FAT16, a FAT chain
    /// otherwise. Corrupt chains are truncated, not fatal.
    fn directory_bytes(&self, location: &DirLocation) -> Result<Vec<u8>, FilesystemError> {
        match *location {
            DirLocation::Region { start, entries } => {
                let len = (entries as usize) * DIR_ENTRY_SIZE;
                Ok(self.read_exactish(start, len)?)
            }
            DirLocation::Chain { first } => {
                let mut out = Vec::new();
                let mut cluster = first;
                let mut seen = HashSet::new();
                while self.geom.is_valid_cluster(cluster)
                    && seen.insert(cluster)
                    && seen.len() <= MAX_DIR_CLUSTERS
                {
                    if let Some(off) = self.geom.cluster_offset(cluster) {
                        out.extend(self.read_exactish(off, self.geom.cluster_size as usize)?);
                    }
                    let next = self.fat_entry(cluster)?;
                    if next == 0 || self.geom.is_end_of_chain(next) {
                        break;
                    }
                    cluster = next;
                }
                Ok(out)
            }
        }
    }

    fn read_exactish(&self, offset: u64, len: usize) -> Result<Vec<u8>, FilesystemError> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let chunk = self.device.read_at(pos, len - out.len())?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend(chunk);
        }
        Ok(out)
    }
}

enum DirLocation {
    Region { start: u64, entries: u64 },
    Chain { first: u64 },
}

impl FilesystemParser for FatParser<'_> {
    fn variant(&self) -> FilesystemVariant {
        self.geom.variant
    }

    fn deleted_entries(&self) -> Result<Vec<DeletedEntry>, FilesystemError> {
        let mut out = Vec::new();
        let mut queue: VecDeque<DirLocation> = VecDeque::new();
        match self.geom.variant {
            FilesystemVariant::Fat16 => queue.push_back(DirLocation::Region {
                start: self.geom.root_dir_start,
                entries: self.geom.root_entry_count,
            }),
            _ => queue.push_back(DirLocation::Chain {
                first: self.geom.root_cluster,
            }),
        }

        let mut dirs_walked = 0;
        while let Some(location) = queue.pop_front() {
            if dirs_walked >= MAX_DIRECTORIES {
                break;
            }
            dirs_walked += 1;

            let bytes = match self.directory_bytes(&location) {
                Ok(b) => b,
                Err(FilesystemError::Device(e)) if e.is_range_local() => continue,
                Err(e) => return Err(e),
            };

            for raw in bytes.chunks_exact(DIR_ENTRY_SIZE) {
                if raw[0] == 0x00 {
                    break;
                }
                let attr = raw[11];
                if attr & ATTR_LONG_NAME == ATTR_LONG_NAME || attr & ATTR_VOLUME_ID != 0 {
                    continue;
                }

                let first_cluster = {
                    let lo = read_u16_le(raw, 26).unwrap_or(0) as u64;
                    let hi = match self.geom.variant {
                        FilesystemVariant::Fat32 => read_u16_le(raw, 20).unwrap_or(0) as u64,
                        _ => 0,
                    };
                    (hi << 16) | lo
                };

                if raw[0] == DELETED_MARKER {
                    if attr & ATTR_DIRECTORY != 0 {
                        // A deleted directory's chain is gone; its children
                        // are only reachable through carving.
                        continue;
                    }
                    let size = read_u32_le(raw, 28).unwrap_or(0) as u64;
                    if size == 0 || !self.geom.is_valid_cluster(first_cluster) {
                        continue;
                    }
                    out.push(DeletedEntry {
                        name: Some(short_name(raw)),
                        size,
                        first_cluster,
                        runs: Vec::new(),
                        contiguous: false,
                        resident_at: None,
                    });
                } else if attr & ATTR_DIRECTORY != 0
                    && raw[0] != b'.'
                    && self.geom.is_valid_cluster(first_cluster)
                {
                    // Live subdirectory: walk it for deleted children.
                    queue.push_back(DirLocation::Chain {
                        first: first_cluster,
                    });
                }
            }
        }
        Ok(out)
    }

    fn resolve(&self, entry: &DeletedEntry) -> Result<Option<ResolvedExtent>, FilesystemError> {
        let geom = &self.geom;
        if !geom.is_valid_cluster(entry.first_cluster) {
            return Err(FilesystemError::CorruptedMetadata(format!(
                "start cluster {} out of range",
                entry.first_cluster
            )));
        }

        // Reallocated start cluster means the content is overwritten.
        if self.fat_entry(entry.first_cluster)? != 0 {
            return Ok(None);
        }

        // Deletion zeroes the chain, so reconstruct by contiguity: take
        // free clusters from the start until the size is covered or an
        // allocated cluster cuts the run short.
        let needed = entry.size.div_ceil(geom.cluster_size).min(MAX_CHAIN_PROBE);
        let mut free = 1u64;
        while free < needed {
            let next = entry.first_cluster + free;
            if !geom.is_valid_cluster(next) || self.fat_entry(next)? != 0 {
                break;
            }
            free += 1;
        }

        let start = geom
            .cluster_offset(entry.first_cluster)
            .expect("validated above");
        let covered = entry.size.min(free * geom.cluster_size);
        let end = (start + covered).min(self.device.size());
        if end <= start {
            return Ok(None);
        }

        Ok(Some(ResolvedExtent {
            start,
            end,
            confidence: Confidence::Medium,
            partial: end - start < entry.size,
        }))
    }
}

/// Reconstructs an 8.3 name; the overwritten first byte becomes '_'.
fn short_name(raw: &[u8]) -> String {
    let mut base: Vec<u8> = raw[..8].to_vec();
    if base[0] == DELETED_MARKER {
        base[0] = b'_';
    }
    let clean = |bytes: &[u8]| -> String {
        bytes
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '_'
                }
            })
            .collect::<String>()
            .trim_end()
            .to_string()
    };
    let name = clean(&base);
    let ext = clean(&raw[8..11]);
    if ext.is_empty() {
        name
    } else {
        format!("{}.{}", name, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_restores_deleted_marker() {
        let mut raw = [b' '; 32];
        raw[..8].copy_from_slice(b"\xE5HOTO   ");
        raw[8..11].copy_from_slice(b"JPG");
        assert_eq!(short_name(&raw), "_HOTO.JPG");
    }

    #[test]
    fn short_name_without_extension() {
        let mut raw = [b' '; 32];
        raw[..8].copy_from_slice(b"README  ");
        assert_eq!(short_name(&raw), "README");
    }
}
