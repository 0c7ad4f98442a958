//! exFAT metadata parser.
//!
//! exFAT directory entries come in sets: a file entry, a stream-extension
//! entry, and one or more name entries. Deletion clears the in-use bit in
//! the entry type byte (0x85 -> 0x05, 0xC0 -> 0x40, 0xC1 -> 0x41) and
//! flips the matching bits in the allocation bitmap, leaving the set
//! itself intact. NoFatChain files are contiguous by format guarantee.

use std::collections::HashSet;

use super::{
    DeletedEntry, FilesystemError, FilesystemParser, FilesystemVariant, ResolvedExtent,
    read_u16_le, read_u32_le, read_u64_le,
};
use crate::io::BlockDeviceReader;
use crate::types::Confidence;

const ENTRY_SIZE: usize = 32;

const ENTRY_FILE: u8 = 0x85;
const ENTRY_STREAM: u8 = 0xC0;
const ENTRY_FILENAME: u8 = 0xC1;
const ENTRY_DELETED_FILE: u8 = 0x05;
const ENTRY_DELETED_STREAM: u8 = 0x40;
const ENTRY_DELETED_FILENAME: u8 = 0x41;
const ENTRY_ALLOCATION_BITMAP: u8 = 0x81;

const FILE_ATTR_DIRECTORY: u16 = 0x0010;
const STREAM_NO_FAT_CHAIN: u8 = 0x02;

const BS_FILE_SYSTEM_NAME: usize = 3;
const BS_FAT_OFFSET: usize = 80;
const BS_CLUSTER_HEAP_OFFSET: usize = 88;
const BS_CLUSTER_COUNT: usize = 92;
const BS_FIRST_CLUSTER_OF_ROOT: usize = 96;
const BS_BYTES_PER_SECTOR_SHIFT: usize = 108;
const BS_SECTORS_PER_CLUSTER_SHIFT: usize = 109;

const SE_GENERAL_FLAGS: usize = 1;
const SE_NAME_LENGTH: usize = 3;
const SE_FIRST_CLUSTER: usize = 20;
const SE_DATA_LENGTH: usize = 24;

const MAX_DIRECTORIES: usize = 256;
const MAX_DIR_CLUSTERS: usize = 1024;
const MAX_BITMAP_BYTES: usize = 4 * 1024 * 1024;

pub fn probe(boot: &[u8]) -> bool {
    boot.get(BS_FILE_SYSTEM_NAME..BS_FILE_SYSTEM_NAME + 8) == Some(b"EXFAT   ")
}

struct ExFatGeometry {
    cluster_size: u64,
    fat_offset: u64,
    cluster_heap_offset: u64,
    cluster_count: u64,
    root_cluster: u64,
}

impl ExFatGeometry {
    fn parse(boot: &[u8]) -> Result<Self, FilesystemError> {
        let invalid = |msg: &str| FilesystemError::InvalidBootSector(msg.to_string());

        let bps_shift = *boot
            .get(BS_BYTES_PER_SECTOR_SHIFT)
            .ok_or_else(|| invalid("short boot sector"))?;
        let spc_shift = *boot
            .get(BS_SECTORS_PER_CLUSTER_SHIFT)
            .ok_or_else(|| invalid("short boot sector"))?;
        if !(9..=12).contains(&bps_shift) || spc_shift > 25 {
            return Err(invalid("implausible sector/cluster shifts"));
        }
        let sector_size = 1u64 << bps_shift;
        let cluster_size = sector_size << spc_shift;

        let fat_offset_sectors = read_u32_le(boot, BS_FAT_OFFSET).unwrap_or(0) as u64;
        let heap_offset_sectors = read_u32_le(boot, BS_CLUSTER_HEAP_OFFSET).unwrap_or(0) as u64;
        let cluster_count = read_u32_le(boot, BS_CLUSTER_COUNT).unwrap_or(0) as u64;
        let root_cluster = read_u32_le(boot, BS_FIRST_CLUSTER_OF_ROOT).unwrap_or(0) as u64;

        if fat_offset_sectors == 0 || heap_offset_sectors == 0 || cluster_count == 0 {
            return Err(invalid("zero FAT/heap geometry"));
        }

        Ok(Self {
            cluster_size,
            fat_offset: fat_offset_sectors * sector_size,
            cluster_heap_offset: heap_offset_sectors * sector_size,
            cluster_count,
            root_cluster,
        })
    }

    fn cluster_offset(&self, cluster: u64) -> Option<u64> {
        if self.is_valid_cluster(cluster) {
            Some(self.cluster_heap_offset + (cluster - 2) * self.cluster_size)
        } else {
            None
        }
    }

    fn is_valid_cluster(&self, cluster: u64) -> bool {
        cluster >= 2 && cluster < 2 + self.cluster_count
    }
}

pub struct ExFatParser<'a> {
    device: &'a dyn BlockDeviceReader,
    geom: ExFatGeometry,
    /// Leading slice of the allocation bitmap; `None` when the bitmap
    /// entry was missing or unreadable.
    bitmap: Option<Vec<u8>>,
}

impl<'a> ExFatParser<'a> {
    pub fn new(device: &'a dyn BlockDeviceReader, boot: &[u8]) -> Result<Self, FilesystemError> {
        let geom = ExFatGeometry::parse(boot)?;
        let mut parser = Self {
            device,
            geom,
            bitmap: None,
        };
        parser.bitmap = parser.load_bitmap().unwrap_or(None);
        Ok(parser)
    }

    fn fat_entry(&self, cluster: u64) -> Result<u64, FilesystemError> {
        let bytes = self.device.read_at(self.geom.fat_offset + cluster * 4, 4)?;
        if bytes.len() < 4 {
            return Err(FilesystemError::CorruptedMetadata(
                "allocation table truncated".into(),
            ));
        }
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
    }

    /// `Some(true)` when the bitmap marks the cluster free; `None` when the
    /// bitmap does not cover it.
    fn cluster_free(&self, cluster: u64) -> Option<bool> {
        let bitmap = self.bitmap.as_ref()?;
        let idx = (cluster.checked_sub(2)?) as usize;
        let byte = *bitmap.get(idx / 8)?;
        Some(byte >> (idx % 8) & 1 == 0)
    }

    fn load_bitmap(&self) -> Result<Option<Vec<u8>>, FilesystemError> {
        for raw in self.directory_bytes(self.geom.root_cluster)?.chunks_exact(ENTRY_SIZE) {
            if raw[0] == 0x00 {
                break;
            }
            if raw[0] != ENTRY_ALLOCATION_BITMAP {
                continue;
            }
            let first = read_u32_le(raw, SE_FIRST_CLUSTER).unwrap_or(0) as u64;
            let length = read_u64_le(raw, SE_DATA_LENGTH).unwrap_or(0);
            let Some(offset) = self.geom.cluster_offset(first) else {
                return Ok(None);
            };
            let want = (length.min(MAX_BITMAP_BYTES as u64)) as usize;
            let data = self.device.read_at(offset, want)?;
            return Ok(Some(data));
        }
        Ok(None)
    }

    /// Concatenated bytes of a directory's cluster chain. Chain ends and
    /// loops are truncated silently.
    fn directory_bytes(&self, first: u64) -> Result<Vec<u8>, FilesystemError> {
        let mut out = Vec::new();
        let mut cluster = first;
        let mut seen = HashSet::new();
        while self.geom.is_valid_cluster(cluster)
            && seen.insert(cluster)
            && seen.len() <= MAX_DIR_CLUSTERS
        {
            if let Some(off) = self.geom.cluster_offset(cluster) {
                let mut data = self.device.read_at(off, self.geom.cluster_size as usize)?;
                out.append(&mut data);
            }
            match self.fat_entry(cluster) {
                Ok(next) if self.geom.is_valid_cluster(next) => cluster = next,
                _ => break,
            }
        }
        Ok(out)
    }
}

/// In-progress directory-entry set while walking.
#[derive(Default)]
struct EntrySet {
    deleted: bool,
    is_directory: bool,
    no_fat_chain: bool,
    first_cluster: u64,
    size: u64,
    name_length: usize,
    name_units: Vec<u16>,
}

impl EntrySet {
    fn name(&self) -> Option<String> {
        if self.name_units.is_empty() {
            return None;
        }
        let take = self.name_length.min(self.name_units.len());
        Some(String::from_utf16_lossy(&self.name_units[..take]))
    }
}

impl FilesystemParser for ExFatParser<'_> {
    fn variant(&self) -> FilesystemVariant {
        FilesystemVariant::ExFat
    }

    fn deleted_entries(&self) -> Result<Vec<DeletedEntry>, FilesystemError> {
        let mut out = Vec::new();
        let mut queue = vec![self.geom.root_cluster];
        let mut dirs_walked = 0;

        while let Some(dir_cluster) = queue.pop() {
            if dirs_walked >= MAX_DIRECTORIES {
                break;
            }
            dirs_walked += 1;

            let bytes = match self.directory_bytes(dir_cluster) {
                Ok(b) => b,
                Err(FilesystemError::Device(e)) if e.is_range_local() => continue,
                Err(e) => return Err(e),
            };

            let mut current: Option<EntrySet> = None;
            for raw in bytes.chunks_exact(ENTRY_SIZE) {
                match raw[0] {
                    0x00 => break,
                    ENTRY_FILE | ENTRY_DELETED_FILE => {
                        if let Some(set) = current.take() {
                            finish_set(set, &mut out, &mut queue, &self.geom);
                        }
                        let attrs = read_u16_le(raw, 4).unwrap_or(0);
                        current = Some(EntrySet {
                            deleted: raw[0] == ENTRY_DELETED_FILE,
                            is_directory: attrs & FILE_ATTR_DIRECTORY != 0,
                            ..EntrySet::default()
                        });
                    }
                    ENTRY_STREAM | ENTRY_DELETED_STREAM => {
                        if let Some(set) = current.as_mut() {
                            set.no_fat_chain = raw[SE_GENERAL_FLAGS] & STREAM_NO_FAT_CHAIN != 0;
                            set.name_length = raw[SE_NAME_LENGTH] as usize;
                            set.first_cluster =
                                read_u32_le(raw, SE_FIRST_CLUSTER).unwrap_or(0) as u64;
                            set.size = read_u64_le(raw, SE_DATA_LENGTH).unwrap_or(0);
                        }
                    }
                    ENTRY_FILENAME | ENTRY_DELETED_FILENAME => {
                        if let Some(set) = current.as_mut() {
                            for pair in raw[2..ENTRY_SIZE].chunks_exact(2) {
                                let unit = u16::from_le_bytes([pair[0], pair[1]]);
                                if unit != 0 {
                                    set.name_units.push(unit);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Some(set) = current.take() {
                finish_set(set, &mut out, &mut queue, &self.geom);
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
        if self.cluster_free(entry.first_cluster) == Some(false) {
            return Ok(None);
        }

        let needed = entry.size.div_ceil(geom.cluster_size);
        let (free_run, bitmap_known) = if entry.contiguous {
            // Contiguity is a format guarantee; the bitmap only tells us
            // how much of it survived reallocation.
            let mut run = 1u64;
            let mut known = self.bitmap.is_some();
            while run < needed {
                match self.cluster_free(entry.first_cluster + run) {
                    Some(true) => run += 1,
                    Some(false) => break,
                    None => {
                        known = false;
                        run = needed;
                    }
                }
            }
            (run, known)
        } else {
            // The chain was freed with the file; fall back to contiguity.
            let mut run = 1u64;
            while run < needed {
                let next = entry.first_cluster + run;
                if !geom.is_valid_cluster(next)
                    || self.fat_entry(next)? != 0
                    || self.cluster_free(next) == Some(false)
                {
                    break;
                }
                run += 1;
            }
            (run, false)
        };

        let start = geom
            .cluster_offset(entry.first_cluster)
            .expect("validated above");
        let covered = entry.size.min(free_run * geom.cluster_size);
        let end = (start + covered).min(self.device.size());
        if end <= start {
            return Ok(None);
        }

        let confidence = if entry.contiguous && bitmap_known && free_run >= needed {
            Confidence::High
        } else {
            Confidence::Medium
        };

        Ok(Some(ResolvedExtent {
            start,
            end,
            confidence,
            partial: end - start < entry.size,
        }))
    }
}

fn finish_set(
    set: EntrySet,
    out: &mut Vec<DeletedEntry>,
    queue: &mut Vec<u64>,
    geom: &ExFatGeometry,
) {
    if !geom.is_valid_cluster(set.first_cluster) {
        return;
    }
    if set.deleted {
        if !set.is_directory && set.size > 0 {
            out.push(DeletedEntry {
                name: set.name(),
                size: set.size,
                first_cluster: set.first_cluster,
                runs: Vec::new(),
                contiguous: set.no_fat_chain,
                resident_at: None,
            });
        }
    } else if set.is_directory {
        queue.push(set.first_cluster);
    }
}
