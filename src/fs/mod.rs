//! Filesystem metadata parsing for the quick scan path.
//!
//! Each supported filesystem variant implements [`FilesystemParser`]:
//! enumerate directory entries still present but flagged deleted, consult
//! the allocation structure to see whether the referenced clusters were
//! reallocated, and reconstruct a byte extent. The variant is selected by a
//! boot-sector probe at session start.

pub mod exfat;
pub mod fat;
pub mod ntfs;

use thiserror::Error;

use crate::error::DeviceError;
use crate::io::BlockDeviceReader;
use crate::types::{Confidence, Offset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemVariant {
    Fat16,
    Fat32,
    ExFat,
    Ntfs,
}

impl FilesystemVariant {
    pub fn name(&self) -> &'static str {
        match self {
            FilesystemVariant::Fat16 => "FAT16",
            FilesystemVariant::Fat32 => "FAT32",
            FilesystemVariant::ExFat => "exFAT",
            FilesystemVariant::Ntfs => "NTFS",
        }
    }
}

#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("No recognizable filesystem")]
    NoFilesystem,

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Corrupted metadata: {0}")]
    CorruptedMetadata(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// A contiguous cluster run, in filesystem cluster units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRun {
    pub first: u64,
    pub count: u64,
}

/// A directory entry flagged deleted whose metadata still exists.
#[derive(Debug, Clone)]
pub struct DeletedEntry {
    /// Reconstructed filename, when the entry still carries one.
    pub name: Option<String>,
    /// Size the metadata reports, in bytes.
    pub size: u64,
    pub first_cluster: u64,
    /// Data runs carried directly by the metadata (NTFS runlists); empty
    /// when only the start cluster survives.
    pub runs: Vec<ClusterRun>,
    /// The format guarantees the data is contiguous (exFAT NoFatChain).
    pub contiguous: bool,
    /// Resident data: the payload lives inside the metadata record itself,
    /// at this absolute byte offset.
    pub resident_at: Option<Offset>,
}

/// A deleted entry's reconstructed byte extent on the device.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedExtent {
    pub start: Offset,
    pub end: Offset,
    pub confidence: Confidence,
    /// Reconstructed length fell short of the metadata-reported size.
    pub partial: bool,
}

pub trait FilesystemParser {
    fn variant(&self) -> FilesystemVariant;

    /// Directory entries flagged deleted. A corrupt individual entry is
    /// skipped, never an error; errors mean the structures themselves are
    /// unusable.
    fn deleted_entries(&self) -> Result<Vec<DeletedEntry>, FilesystemError>;

    /// Verifies the entry's clusters against the allocation structure and
    /// reconstructs the extent. `Ok(None)` means the region was reallocated
    /// and the content is gone.
    fn resolve(&self, entry: &DeletedEntry) -> Result<Option<ResolvedExtent>, FilesystemError>;
}

/// Boot-sector probe. Tries the most structured signatures first.
pub fn detect_filesystem<'a>(
    device: &'a dyn BlockDeviceReader,
) -> Result<Box<dyn FilesystemParser + 'a>, FilesystemError> {
    let boot = device.read_at(0, 512)?;
    if boot.len() < 512 {
        return Err(FilesystemError::NoFilesystem);
    }

    if ntfs::probe(&boot) {
        return Ok(Box::new(ntfs::NtfsParser::new(device, &boot)?));
    }
    if exfat::probe(&boot) {
        return Ok(Box::new(exfat::ExFatParser::new(device, &boot)?));
    }
    if fat::probe(&boot) {
        return Ok(Box::new(fat::FatParser::new(device, &boot)?));
    }
    Err(FilesystemError::NoFilesystem)
}

pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}
