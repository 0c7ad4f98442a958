//! NTFS metadata parser.
//!
//! NTFS keeps per-file metadata in MFT FILE records. Deleting a file
//! clears the record's in-use flag but leaves the attributes intact,
//! $DATA runlist included, so recovery can rebuild exact extents and
//! check them against the $Bitmap allocation file (MFT record 6).

use super::{
    ClusterRun, DeletedEntry, FilesystemError, FilesystemParser, FilesystemVariant, ResolvedExtent,
    read_u16_le, read_u32_le, read_u64_le,
};
use crate::io::BlockDeviceReader;
use crate::types::{Confidence, Offset};

const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const MFT_MAGIC: &[u8; 4] = b"FILE";

const FLAG_IN_USE: u16 = 0x0001;
const FLAG_DIRECTORY: u16 = 0x0002;

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

const MFT_BITMAP_RECORD: u64 = 6;

const MAX_RECORDS: u64 = 16384;
const STOP_AFTER_INVALID: u32 = 64;
const MAX_RUNS: usize = 128;
const MAX_BITMAP_BYTES: u64 = 8 * 1024 * 1024;

pub fn probe(boot: &[u8]) -> bool {
    boot.get(3..11) == Some(NTFS_OEM_ID.as_slice())
}

struct NtfsGeometry {
    bytes_per_sector: u64,
    cluster_size: u64,
    mft_offset: u64,
    record_size: u64,
}

impl NtfsGeometry {
    fn parse(boot: &[u8]) -> Result<Self, FilesystemError> {
        let invalid = |msg: &str| FilesystemError::InvalidBootSector(msg.to_string());

        let bps = read_u16_le(boot, 11).ok_or_else(|| invalid("short boot sector"))? as u64;
        let spc = *boot.get(13).ok_or_else(|| invalid("short boot sector"))? as u64;
        let total_sectors = read_u64_le(boot, 40).unwrap_or(0);
        let mft_lcn = read_u64_le(boot, 48).unwrap_or(0);
        let clusters_per_record = *boot.get(64).ok_or_else(|| invalid("short boot sector"))? as i8;

        if bps < 512 || spc == 0 || total_sectors == 0 {
            return Err(invalid("implausible NTFS geometry"));
        }

        let cluster_size = bps * spc;
        // Negative means 2^|n| bytes rather than a cluster count.
        let record_size = if clusters_per_record > 0 {
            cluster_size * clusters_per_record as u64
        } else {
            1u64 << (-clusters_per_record as u32)
        };
        if record_size == 0 || record_size > 64 * 1024 {
            return Err(invalid("implausible MFT record size"));
        }

        Ok(Self {
            bytes_per_sector: bps,
            cluster_size,
            mft_offset: mft_lcn * cluster_size,
            record_size,
        })
    }
}

/// Data parsed out of one MFT FILE record.
#[derive(Default)]
struct MftRecord {
    in_use: bool,
    directory: bool,
    name: Option<String>,
    size: u64,
    runs: Vec<ClusterRun>,
    /// Offset of resident $DATA content relative to the record start.
    resident_rel: Option<u64>,
}

pub struct NtfsParser<'a> {
    device: &'a dyn BlockDeviceReader,
    geom: NtfsGeometry,
    /// Leading slice of $Bitmap; `None` when it could not be read.
    bitmap: Option<Vec<u8>>,
}

impl<'a> NtfsParser<'a> {
    pub fn new(device: &'a dyn BlockDeviceReader, boot: &[u8]) -> Result<Self, FilesystemError> {
        let geom = NtfsGeometry::parse(boot)?;
        let mut parser = Self {
            device,
            geom,
            bitmap: None,
        };
        parser.bitmap = parser.load_bitmap().unwrap_or(None);
        Ok(parser)
    }

    fn record_bytes(&self, index: u64) -> Result<Vec<u8>, FilesystemError> {
        let offset = self.geom.mft_offset + index * self.geom.record_size;
        let mut data = self.device.read_at(offset, self.geom.record_size as usize)?;
        apply_fixups(&mut data, self.geom.bytes_per_sector as usize);
        Ok(data)
    }

    fn parse_record(&self, data: &[u8]) -> Option<MftRecord> {
        if data.get(..4) != Some(MFT_MAGIC.as_slice()) {
            return None;
        }
        let flags = read_u16_le(data, 22)?;
        let mut record = MftRecord {
            in_use: flags & FLAG_IN_USE != 0,
            directory: flags & FLAG_DIRECTORY != 0,
            ..MftRecord::default()
        };

        let mut off = read_u16_le(data, 20)? as usize;
        while off + 8 <= data.len() {
            let attr_type = read_u32_le(data, off)?;
            if attr_type == ATTR_END {
                break;
            }
            let attr_len = read_u32_le(data, off + 4)? as usize;
            if attr_len < 16 || off + attr_len > data.len() {
                break;
            }
            let non_resident = data[off + 8] != 0;
            let attr_name_len = data[off + 9];

            match attr_type {
                ATTR_FILE_NAME if !non_resident => {
                    let content_off = read_u16_le(data, off + 20)? as usize;
                    if content_off > attr_len {
                        off += attr_len;
                        continue;
                    }
                    let content = &data[off + content_off..off + attr_len];
                    if content.len() > 66 {
                        if record.size == 0 {
                            record.size = read_u64_le(content, 48).unwrap_or(0);
                        }
                        let name_len = content[64] as usize;
                        let name_bytes = content.get(66..66 + name_len * 2).unwrap_or(&[]);
                        let units: Vec<u16> = name_bytes
                            .chunks_exact(2)
                            .map(|p| u16::from_le_bytes([p[0], p[1]]))
                            .collect();
                        if !units.is_empty() {
                            record.name = Some(String::from_utf16_lossy(&units));
                        }
                    }
                }
                ATTR_DATA if attr_name_len == 0 => {
                    if non_resident {
                        record.size = read_u64_le(data, off + 48).unwrap_or(record.size);
                        let run_off = read_u16_le(data, off + 32)? as usize;
                        if run_off < attr_len {
                            record.runs = decode_runlist(&data[off + run_off..off + attr_len]);
                        }
                    } else {
                        let content_size = read_u32_le(data, off + 16)? as u64;
                        let content_off = read_u16_le(data, off + 20)? as u64;
                        record.size = content_size;
                        record.resident_rel = Some(off as u64 + content_off);
                    }
                }
                _ => {}
            }
            off += attr_len;
        }
        Some(record)
    }

    /// `Some(true)` when $Bitmap marks the cluster free.
    fn cluster_free(&self, lcn: u64) -> Option<bool> {
        let bitmap = self.bitmap.as_ref()?;
        let byte = *bitmap.get((lcn / 8) as usize)?;
        Some(byte >> (lcn % 8) & 1 == 0)
    }

    fn load_bitmap(&self) -> Result<Option<Vec<u8>>, FilesystemError> {
        let data = self.record_bytes(MFT_BITMAP_RECORD)?;
        let Some(record) = self.parse_record(&data) else {
            return Ok(None);
        };

        if let Some(rel) = record.resident_rel {
            let start = rel as usize;
            let end = (start + record.size as usize).min(data.len());
            return Ok(data.get(start..end).map(|s| s.to_vec()));
        }

        let mut out = Vec::new();
        for run in &record.runs {
            let offset = run.first * self.geom.cluster_size;
            let mut want = run.count * self.geom.cluster_size;
            want = want.min(MAX_BITMAP_BYTES - out.len() as u64);
            let mut pos = offset;
            while want > 0 {
                let chunk = self.device.read_at(pos, want as usize)?;
                if chunk.is_empty() {
                    break;
                }
                pos += chunk.len() as u64;
                want -= chunk.len() as u64;
                out.extend(chunk);
            }
            if out.len() as u64 >= MAX_BITMAP_BYTES {
                break;
            }
        }
        Ok((!out.is_empty()).then_some(out))
    }
}

impl FilesystemParser for NtfsParser<'_> {
    fn variant(&self) -> FilesystemVariant {
        FilesystemVariant::Ntfs
    }

    fn deleted_entries(&self) -> Result<Vec<DeletedEntry>, FilesystemError> {
        let mut out = Vec::new();
        let mut consecutive_invalid = 0u32;

        for index in 0..MAX_RECORDS {
            let data = match self.record_bytes(index) {
                Ok(d) => d,
                Err(FilesystemError::Device(e)) if e.is_range_local() => continue,
                Err(e) => return Err(e),
            };
            let Some(record) = self.parse_record(&data) else {
                consecutive_invalid += 1;
                if consecutive_invalid >= STOP_AFTER_INVALID {
                    break;
                }
                continue;
            };
            consecutive_invalid = 0;

            if record.in_use || record.directory || record.size == 0 {
                continue;
            }
            if record.runs.is_empty() && record.resident_rel.is_none() {
                continue;
            }

            let resident_at = record
                .resident_rel
                .map(|rel| self.geom.mft_offset + index * self.geom.record_size + rel);
            out.push(DeletedEntry {
                name: record.name,
                size: record.size,
                first_cluster: record.runs.first().map_or(0, |r| r.first),
                runs: record.runs,
                contiguous: false,
                resident_at,
            });
        }
        Ok(out)
    }

    fn resolve(&self, entry: &DeletedEntry) -> Result<Option<ResolvedExtent>, FilesystemError> {
        // Resident payloads live inside the MFT record itself.
        if let Some(start) = entry.resident_at {
            let end = (start + entry.size).min(self.device.size());
            if end <= start {
                return Ok(None);
            }
            return Ok(Some(ResolvedExtent {
                start,
                end,
                confidence: Confidence::High,
                partial: end - start < entry.size,
            }));
        }

        let Some(run) = entry.runs.first().copied() else {
            return Err(FilesystemError::CorruptedMetadata("record carries no data runs".into()));
        };

        if self.cluster_free(run.first) == Some(false) {
            return Ok(None);
        }

        // The runlist survives deletion, so extents are exact; the single-
        // range candidate takes the leading run and flags the rest partial.
        let needed = entry.size.div_ceil(self.geom.cluster_size);
        let mut usable = 0u64;
        while usable < run.count.min(needed) {
            match self.cluster_free(run.first + usable) {
                Some(false) => break,
                _ => usable += 1,
            }
        }
        if usable == 0 {
            return Ok(None);
        }

        let start: Offset = run.first * self.geom.cluster_size;
        let covered = entry.size.min(usable * self.geom.cluster_size);
        let end = (start + covered).min(self.device.size());
        if end <= start {
            return Ok(None);
        }

        let confidence = if self.bitmap.is_some() {
            Confidence::High
        } else {
            Confidence::Medium
        };

        Ok(Some(ResolvedExtent {
            start,
            end,
            confidence,
            partial: entry.runs.len() > 1 || end - start < entry.size,
        }))
    }
}

/// Replaces each sector's trailing update-sequence bytes with the stored
/// originals. Records written with no update sequence pass through as-is.
fn apply_fixups(record: &mut [u8], bytes_per_sector: usize) {
    let Some(usa_offset) = read_u16_le(record, 4).map(usize::from) else {
        return;
    };
    let Some(usa_count) = read_u16_le(record, 6).map(usize::from) else {
        return;
    };
    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return;
    }
    for i in 1..usa_count {
        let sector_end = i * bytes_per_sector;
        if sector_end > record.len() {
            break;
        }
        let fixup_pos = usa_offset + i * 2;
        let (a, b) = (record[fixup_pos], record[fixup_pos + 1]);
        record[sector_end - 2] = a;
        record[sector_end - 1] = b;
    }
}

/// NTFS runlist: each element is a header byte (low nibble = length field
/// size, high nibble = offset field size), a little-endian run length, and
/// a signed offset relative to the previous run's LCN. Zero terminates.
fn decode_runlist(data: &[u8]) -> Vec<ClusterRun> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn: i64 = 0;

    while pos < data.len() && runs.len() < MAX_RUNS {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        pos += 1;
        if len_size == 0 || len_size > 8 || off_size > 8 || pos + len_size + off_size > data.len() {
            break;
        }

        let mut count: u64 = 0;
        for (i, &b) in data[pos..pos + len_size].iter().enumerate() {
            count |= (b as u64) << (8 * i);
        }
        pos += len_size;

        if off_size == 0 {
            // Sparse run: no physical clusters back this range, and a
            // single-range candidate cannot bridge the hole.
            break;
        }
        let mut delta: i64 = 0;
        for (i, &b) in data[pos..pos + off_size].iter().enumerate() {
            delta |= (b as i64) << (8 * i);
        }
        // Sign-extend the offset field.
        let shift = 64 - 8 * off_size as u32;
        delta = (delta << shift) >> shift;
        pos += off_size;

        lcn += delta;
        if lcn < 0 || count == 0 {
            break;
        }
        runs.push(ClusterRun {
            first: lcn as u64,
            count,
        });
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runlist_decodes_relative_offsets() {
        // Run 1: 4 clusters at LCN 100; run 2: 2 clusters at LCN 90.
        let data = [0x11, 0x04, 100, 0x11, 0x02, 0xF6, 0x00];
        let runs = decode_runlist(&data);
        assert_eq!(
            runs,
            vec![
                ClusterRun { first: 100, count: 4 },
                ClusterRun { first: 90, count: 2 }
            ]
        );
    }

    #[test]
    fn runlist_stops_at_sparse_run() {
        let data = [0x11, 0x04, 100, 0x01, 0x08, 0x11, 0x02, 0x05, 0x00];
        let runs = decode_runlist(&data);
        assert_eq!(runs, vec![ClusterRun { first: 100, count: 4 }]);
    }

    #[test]
    fn record_size_handles_negative_encoding() {
        let mut boot = vec![0u8; 512];
        boot[3..11].copy_from_slice(NTFS_OEM_ID);
        boot[11..13].copy_from_slice(&512u16.to_le_bytes());
        boot[13] = 8;
        boot[40..48].copy_from_slice(&2048u64.to_le_bytes());
        boot[48..56].copy_from_slice(&4u64.to_le_bytes());
        boot[64] = 0xF6; // -10 => 2^10 bytes
        let geom = NtfsGeometry::parse(&boot).unwrap();
        assert_eq!(geom.record_size, 1024);
        assert_eq!(geom.mft_offset, 4 * 4096);
    }
}
