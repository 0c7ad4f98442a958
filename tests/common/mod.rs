//! Test doubles and synthetic device images shared across the suite.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use salvor::{BlockDeviceReader, DeviceError};

/// In-memory device image.
pub struct MemDevice {
    pub bytes: Vec<u8>,
    sector_size: u64,
}

impl MemDevice {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            sector_size: 512,
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl BlockDeviceReader for MemDevice {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        let start = offset as usize;
        if start >= self.bytes.len() {
            return Err(DeviceError::InvalidOffset {
                offset,
                device_size: self.bytes.len() as u64,
            });
        }
        let end = (start + length).min(self.bytes.len());
        Ok(self.bytes[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn path(&self) -> &str {
        "mem"
    }
}

/// Device with an unreadable byte range. A read starting inside the range
/// fails; a read running into it returns the readable prefix, like a real
/// device hitting a bad sector mid-transfer.
pub struct FlakyDevice {
    pub inner: MemDevice,
    pub bad_start: u64,
    pub bad_len: u64,
}

impl FlakyDevice {
    pub fn new(inner: MemDevice, bad_start: u64, bad_len: u64) -> Self {
        Self {
            inner,
            bad_start,
            bad_len,
        }
    }

    fn bad_end(&self) -> u64 {
        self.bad_start + self.bad_len
    }
}

impl BlockDeviceReader for FlakyDevice {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        if offset >= self.bad_start && offset < self.bad_end() {
            return Err(DeviceError::Read {
                offset,
                source: std::io::Error::new(std::io::ErrorKind::Other, "I/O error"),
            });
        }
        if offset < self.bad_start {
            let readable = ((self.bad_start - offset) as usize).min(length);
            return self.inner.read_at(offset, readable);
        }
        self.inner.read_at(offset, length)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u64 {
        self.inner.sector_size()
    }

    fn path(&self) -> &str {
        "flaky"
    }
}

/// Device whose reads stall, for pacing the session writer in
/// cancellation tests.
pub struct SlowDevice {
    pub inner: MemDevice,
    pub delay: Duration,
    pub reads: AtomicU64,
}

impl SlowDevice {
    pub fn new(inner: MemDevice, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            reads: AtomicU64::new(0),
        }
    }
}

impl BlockDeviceReader for SlowDevice {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(self.delay);
        self.inner.read_at(offset, length)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u64 {
        self.inner.sector_size()
    }

    fn path(&self) -> &str {
        "slow"
    }
}

// ============================================================================
// File payload builders
// ============================================================================

pub fn jpeg_bytes(payload_len: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE0];
    out.extend((0..payload_len).map(|i| (i % 251) as u8 | 1));
    out.extend([0xFF, 0xD9]);
    out
}

pub fn pdf_bytes(body_len: usize) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n".to_vec();
    out.extend((0..body_len).map(|i| (i % 89) as u8 + 32));
    out.extend(b"%%EOF");
    out
}

fn png_chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);
    let mut body = chunk_type.to_vec();
    body.extend_from_slice(data);
    out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    out
}

pub fn png_bytes(idat_len: usize) -> Vec<u8> {
    let mut out = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend(png_chunk(b"IHDR", &[0u8; 13]));
    let idat: Vec<u8> = (0..idat_len).map(|i| (i % 253) as u8).collect();
    out.extend(png_chunk(b"IDAT", &idat));
    out.extend(png_chunk(b"IEND", &[]));
    out
}

pub fn bmp_bytes(total_len: u32) -> Vec<u8> {
    let mut out = vec![0u8; total_len as usize];
    out[..2].copy_from_slice(b"BM");
    out[2..6].copy_from_slice(&total_len.to_le_bytes());
    for (i, b) in out.iter_mut().enumerate().skip(14) {
        *b = (i % 199) as u8;
    }
    out
}

/// A minimal but structurally valid ZIP: one stored entry, central
/// directory, end-of-central-directory record.
pub fn zip_bytes() -> Vec<u8> {
    let name = b"a.txt";
    let data = b"hello zip";
    let crc = crc32fast::hash(data);

    let mut out = Vec::new();
    // Local file header
    out.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00]);
    out.extend_from_slice(&[0, 0, 0, 0]); // mod time/date
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(data);

    let cd_offset = out.len() as u32;
    // Central directory header
    out.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02, 0x14, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00]);
    out.extend_from_slice(&[0, 0, 0, 0]); // mod time/date
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]); // extra/comment/disk/internal attrs
    out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
    out.extend_from_slice(&0u32.to_le_bytes()); // local header offset
    out.extend_from_slice(name);
    let cd_size = out.len() as u32 - cd_offset;

    // End of central directory
    out.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06, 0, 0, 0, 0]);
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&cd_size.to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // comment length
    out
}

// ============================================================================
// Filesystem image builders
// ============================================================================

/// FAT16 volume: 512-byte sectors, 1 sector per cluster, one FAT.
/// Layout: sector 0 boot, 1..18 FAT, 18 root directory, data from 19.
pub struct FatImageBuilder {
    bytes: Vec<u8>,
    root_entries_used: usize,
}

pub const FAT_TOTAL_SECTORS: u64 = 4200;
pub const FAT_FAT_START: u64 = 512;
pub const FAT_ROOT_DIR_START: u64 = 18 * 512;
pub const FAT_DATA_START: u64 = 19 * 512;
pub const FAT_CLUSTER_SIZE: u64 = 512;

impl FatImageBuilder {
    pub fn new() -> Self {
        let mut bytes = vec![0u8; (FAT_TOTAL_SECTORS * 512) as usize];
        bytes[11..13].copy_from_slice(&512u16.to_le_bytes());
        bytes[13] = 1; // sectors per cluster
        bytes[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        bytes[16] = 1; // FATs
        bytes[17..19].copy_from_slice(&16u16.to_le_bytes()); // root entries
        bytes[19..21].copy_from_slice(&(FAT_TOTAL_SECTORS as u16).to_le_bytes());
        bytes[22..24].copy_from_slice(&17u16.to_le_bytes()); // FAT sectors
        bytes[54..62].copy_from_slice(b"FAT16   ");
        bytes[510] = 0x55;
        bytes[511] = 0xAA;
        Self {
            bytes,
            root_entries_used: 0,
        }
    }

    pub fn cluster_offset(cluster: u64) -> u64 {
        FAT_DATA_START + (cluster - 2) * FAT_CLUSTER_SIZE
    }

    pub fn set_fat_entry(&mut self, cluster: u64, value: u16) {
        let off = (FAT_FAT_START + cluster * 2) as usize;
        self.bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn add_root_entry(&mut self, name83: &[u8; 11], attr: u8, first_cluster: u16, size: u32) {
        let off = (FAT_ROOT_DIR_START as usize) + self.root_entries_used * 32;
        self.bytes[off..off + 11].copy_from_slice(name83);
        self.bytes[off + 11] = attr;
        self.bytes[off + 26..off + 28].copy_from_slice(&first_cluster.to_le_bytes());
        self.bytes[off + 28..off + 32].copy_from_slice(&size.to_le_bytes());
        self.root_entries_used += 1;
    }

    pub fn write_cluster_data(&mut self, cluster: u64, data: &[u8]) {
        let off = Self::cluster_offset(cluster) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn build(self) -> MemDevice {
        MemDevice::new(self.bytes)
    }
}

/// exFAT volume: 512-byte sectors and clusters, FAT at sector 2, cluster
/// heap at sector 8, 64 clusters, root directory in cluster 4.
pub struct ExFatImageBuilder {
    bytes: Vec<u8>,
    root_entries_used: usize,
}

pub const EXFAT_FAT_OFFSET: u64 = 2 * 512;
pub const EXFAT_HEAP_OFFSET: u64 = 8 * 512;
pub const EXFAT_CLUSTER_SIZE: u64 = 512;
pub const EXFAT_ROOT_CLUSTER: u64 = 4;

impl ExFatImageBuilder {
    pub fn new() -> Self {
        let mut bytes = vec![0u8; (EXFAT_HEAP_OFFSET + 64 * EXFAT_CLUSTER_SIZE) as usize];
        bytes[3..11].copy_from_slice(b"EXFAT   ");
        bytes[80..84].copy_from_slice(&2u32.to_le_bytes()); // FAT offset, sectors
        bytes[84..88].copy_from_slice(&4u32.to_le_bytes()); // FAT length
        bytes[88..92].copy_from_slice(&8u32.to_le_bytes()); // cluster heap offset
        bytes[92..96].copy_from_slice(&64u32.to_le_bytes()); // cluster count
        bytes[96..100].copy_from_slice(&(EXFAT_ROOT_CLUSTER as u32).to_le_bytes());
        bytes[108] = 9; // 512-byte sectors
        bytes[109] = 0; // 1 sector per cluster
        Self {
            bytes,
            root_entries_used: 0,
        }
    }

    pub fn cluster_offset(cluster: u64) -> u64 {
        EXFAT_HEAP_OFFSET + (cluster - 2) * EXFAT_CLUSTER_SIZE
    }

    fn next_root_entry(&mut self) -> usize {
        let off = Self::cluster_offset(EXFAT_ROOT_CLUSTER) as usize + self.root_entries_used * 32;
        self.root_entries_used += 1;
        off
    }

    /// Allocation bitmap stored in `bitmap_cluster`; bit N covers cluster
    /// N+2, set = allocated.
    pub fn add_bitmap(&mut self, bitmap_cluster: u32, allocated: &[u64]) {
        let off = self.next_root_entry();
        self.bytes[off] = 0x81;
        self.bytes[off + 20..off + 24].copy_from_slice(&bitmap_cluster.to_le_bytes());
        self.bytes[off + 24..off + 32].copy_from_slice(&8u64.to_le_bytes());

        let base = Self::cluster_offset(bitmap_cluster as u64) as usize;
        for &cluster in allocated {
            let idx = (cluster - 2) as usize;
            self.bytes[base + idx / 8] |= 1 << (idx % 8);
        }
    }

    pub fn add_deleted_file(&mut self, name: &str, first_cluster: u32, size: u64) {
        let file_off = self.next_root_entry();
        self.bytes[file_off] = 0x05; // deleted file entry
        self.bytes[file_off + 1] = 2; // secondary count: stream + one name
        self.bytes[file_off + 4..file_off + 6].copy_from_slice(&0x20u16.to_le_bytes());

        let stream_off = self.next_root_entry();
        self.bytes[stream_off] = 0x40; // deleted stream extension
        self.bytes[stream_off + 1] = 0x03; // allocation possible + NoFatChain
        self.bytes[stream_off + 3] = name.len() as u8;
        self.bytes[stream_off + 20..stream_off + 24].copy_from_slice(&first_cluster.to_le_bytes());
        self.bytes[stream_off + 24..stream_off + 32].copy_from_slice(&size.to_le_bytes());

        let name_off = self.next_root_entry();
        self.bytes[name_off] = 0x41; // deleted file name
        for (i, unit) in name.encode_utf16().take(15).enumerate() {
            let p = name_off + 2 + i * 2;
            self.bytes[p..p + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    pub fn write_cluster_data(&mut self, cluster: u64, data: &[u8]) {
        let off = Self::cluster_offset(cluster) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn build(self) -> MemDevice {
        MemDevice::new(self.bytes)
    }
}

/// NTFS volume: 512-byte sectors and clusters, MFT at cluster 4 with
/// 1 KiB records (encoded as -10 in the boot sector).
pub struct NtfsImageBuilder {
    bytes: Vec<u8>,
}

pub const NTFS_CLUSTER_SIZE: u64 = 512;
pub const NTFS_MFT_OFFSET: u64 = 4 * 512;
pub const NTFS_RECORD_SIZE: u64 = 1024;

impl NtfsImageBuilder {
    pub fn new() -> Self {
        let total_sectors = 1024u64;
        let mut bytes = vec![0u8; (total_sectors * 512) as usize];
        bytes[3..11].copy_from_slice(b"NTFS    ");
        bytes[11..13].copy_from_slice(&512u16.to_le_bytes());
        bytes[13] = 1; // sectors per cluster
        bytes[40..48].copy_from_slice(&total_sectors.to_le_bytes());
        bytes[48..56].copy_from_slice(&4u64.to_le_bytes()); // MFT LCN
        bytes[64] = 0xF6; // -10: 1 KiB records
        Self { bytes }
    }

    fn record_offset(index: u64) -> usize {
        (NTFS_MFT_OFFSET + index * NTFS_RECORD_SIZE) as usize
    }

    /// $Bitmap record with a resident payload; bit N covers LCN N,
    /// set = allocated.
    pub fn add_bitmap_record(&mut self, allocated: &[u64]) {
        let mut bitmap = vec![0u8; 32];
        for &lcn in allocated {
            bitmap[(lcn / 8) as usize] |= 1 << (lcn % 8);
        }

        let mut record = vec![0u8; 56];
        record[..4].copy_from_slice(b"FILE");
        record[20..22].copy_from_slice(&56u16.to_le_bytes()); // attrs at 56
        record[22..24].copy_from_slice(&0x0001u16.to_le_bytes()); // in use

        let mut attr = vec![0u8; 24];
        attr[..4].copy_from_slice(&0x80u32.to_le_bytes());
        attr[4..8].copy_from_slice(&((24 + bitmap.len()) as u32).to_le_bytes());
        attr[16..20].copy_from_slice(&(bitmap.len() as u32).to_le_bytes());
        attr[20..22].copy_from_slice(&24u16.to_le_bytes());
        attr.extend_from_slice(&bitmap);
        record.extend_from_slice(&attr);
        record.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        let off = Self::record_offset(6);
        self.bytes[off..off + record.len()].copy_from_slice(&record);
    }

    /// A deleted-file FILE record: $FILE_NAME plus a non-resident $DATA
    /// with a single run of `count` clusters at `lcn`.
    pub fn add_deleted_record(&mut self, index: u64, name: &str, size: u64, lcn: u8, count: u8) {
        let mut record = vec![0u8; 56];
        record[..4].copy_from_slice(b"FILE");
        record[20..22].copy_from_slice(&56u16.to_le_bytes());
        record[22..24].copy_from_slice(&0u16.to_le_bytes()); // not in use

        // $FILE_NAME, resident
        let name_units: Vec<u16> = name.encode_utf16().collect();
        let content_len = 66 + name_units.len() * 2;
        let attr_len = (24 + content_len + 7) & !7;
        let mut attr = vec![0u8; attr_len];
        attr[..4].copy_from_slice(&0x30u32.to_le_bytes());
        attr[4..8].copy_from_slice(&(attr_len as u32).to_le_bytes());
        attr[16..20].copy_from_slice(&(content_len as u32).to_le_bytes());
        attr[20..22].copy_from_slice(&24u16.to_le_bytes());
        let content = 24;
        attr[content + 48..content + 56].copy_from_slice(&size.to_le_bytes());
        attr[content + 64] = name_units.len() as u8;
        for (i, unit) in name_units.iter().enumerate() {
            let p = content + 66 + i * 2;
            attr[p..p + 2].copy_from_slice(&unit.to_le_bytes());
        }
        record.extend_from_slice(&attr);

        // $DATA, non-resident, runlist at offset 64
        let mut data_attr = vec![0u8; 72];
        data_attr[..4].copy_from_slice(&0x80u32.to_le_bytes());
        data_attr[4..8].copy_from_slice(&72u32.to_le_bytes());
        data_attr[8] = 1; // non-resident
        data_attr[32..34].copy_from_slice(&64u16.to_le_bytes());
        data_attr[48..56].copy_from_slice(&size.to_le_bytes());
        data_attr[64] = 0x11;
        data_attr[65] = count;
        data_attr[66] = lcn;
        record.extend_from_slice(&data_attr);
        record.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        let off = Self::record_offset(index);
        self.bytes[off..off + record.len()].copy_from_slice(&record);
    }

    pub fn write_cluster_data(&mut self, lcn: u64, data: &[u8]) {
        let off = (lcn * NTFS_CLUSTER_SIZE) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn build(self) -> MemDevice {
        MemDevice::new(self.bytes)
    }
}
