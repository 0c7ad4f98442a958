use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::types::{CHUNK_SIZE, DEFAULT_SECTOR_SIZE, Offset};

/// Read access to a byte-addressable source: a block device or an image
/// file. Implementations are stateless per call so one handle can serve a
/// sequential scanner and random extraction reads from another thread.
pub trait BlockDeviceReader: Send + Sync {
    /// Reads up to `length` bytes at `offset`. A short return near the end
    /// of the device is not an error; `length` is bounded by [`CHUNK_SIZE`].
    fn read_at(&self, offset: Offset, length: usize) -> Result<Vec<u8>, DeviceError>;

    fn size(&self) -> u64;

    fn sector_size(&self) -> u64;

    fn path(&self) -> &str;
}

fn sector_size_for(path: &Path) -> u64 {
    // Image files use the logical sector size; modern devices report 4K.
    if path.starts_with("/dev/") {
        4096
    } else {
        DEFAULT_SECTOR_SIZE
    }
}

fn map_open_error(path: &Path, e: io::Error) -> DeviceError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => {
            DeviceError::PermissionDenied(path.display().to_string())
        }
        _ => DeviceError::Unavailable(format!("{}: {}", path.display(), e)),
    }
}

/// File-backed reader for block devices and disk images.
pub struct DiskReader {
    file: Mutex<File>,
    path: String,
    size: u64,
    sector_size: u64,
}

impl DiskReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| map_open_error(path, e))?;

        let size = Self::probe_size(&file, path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.display().to_string(),
            size,
            sector_size: sector_size_for(path),
        })
    }

    /// Regular files report their size through metadata; block device nodes
    /// report zero there, so fall back to seeking to the end.
    fn probe_size(file: &File, path: &Path) -> Result<u64, DeviceError> {
        let metadata = file.metadata()?;
        if metadata.is_file() && metadata.len() > 0 {
            return Ok(metadata.len());
        }

        let mut f = file.try_clone()?;
        let size = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;

        if size == 0 {
            return Err(DeviceError::Unavailable(format!(
                "could not determine size of {}",
                path.display()
            )));
        }
        Ok(size)
    }
}

impl BlockDeviceReader for DiskReader {
    fn read_at(&self, offset: Offset, length: usize) -> Result<Vec<u8>, DeviceError> {
        if offset >= self.size {
            return Err(DeviceError::InvalidOffset {
                offset,
                device_size: self.size,
            });
        }

        let length = length.min((self.size - offset) as usize).min(CHUNK_SIZE);
        let mut buf = vec![0u8; length];

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| DeviceError::Read { offset, source })?;

        let mut filled = 0;
        while filled < length {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DeviceError::Read {
                        offset: offset + filled as u64,
                        source,
                    });
                }
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Memory-mapped reader for image files. Reads stay chunk-bounded; the
/// mapping is page-cache-backed, nothing is materialized up front.
pub struct MappedImage {
    mmap: Mmap,
    path: String,
    sector_size: u64,
}

impl MappedImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| map_open_error(path, e))?;

        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| DeviceError::Unavailable(format!("{}: mmap: {}", path.display(), e)))?;

        Ok(Self {
            mmap,
            path: path.display().to_string(),
            sector_size: sector_size_for(path),
        })
    }

    /// Zero-copy view of a range, when it lies within the mapping.
    pub fn slice_at(&self, offset: Offset, length: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(length)?;
        self.mmap.get(start..end)
    }
}

impl BlockDeviceReader for MappedImage {
    fn read_at(&self, offset: Offset, length: usize) -> Result<Vec<u8>, DeviceError> {
        let size = self.mmap.len() as u64;
        if offset >= size {
            return Err(DeviceError::InvalidOffset {
                offset,
                device_size: size,
            });
        }
        let start = offset as usize;
        let end = (start + length.min(CHUNK_SIZE)).min(self.mmap.len());
        Ok(self.mmap[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// A byte range consumed or skipped during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRegion {
    pub offset: Offset,
    pub length: u64,
}

impl ScanRegion {
    pub fn end(&self) -> Offset {
        self.offset + self.length
    }
}

/// Sequential chunked traversal with bad-sector skip. A read failure marks
/// one skip stride (one sector by default) as bad and moves on; a marked
/// region is never retried within the scanner's lifetime because the read
/// position only moves forward.
pub struct ChunkedScanner<'a, R: BlockDeviceReader + ?Sized> {
    device: &'a R,
    chunk_size: usize,
    skip_stride: u64,
    bad_regions: Vec<ScanRegion>,
    consecutive_failures: u32,
}

/// Consecutive failed skip strides after which the device is considered
/// lost rather than locally damaged.
const DEVICE_LOST_THRESHOLD: u32 = 256;

impl<'a, R: BlockDeviceReader + ?Sized> ChunkedScanner<'a, R> {
    pub fn new(device: &'a R) -> Self {
        let skip_stride = device.sector_size().max(1);
        Self {
            device,
            chunk_size: CHUNK_SIZE,
            skip_stride,
            bad_regions: Vec::new(),
            consecutive_failures: 0,
        }
    }

    #[cfg(test)]
    pub fn with_chunk_size(device: &'a R, chunk_size: usize) -> Self {
        let mut s = Self::new(device);
        s.chunk_size = chunk_size;
        s
    }

    pub fn device(&self) -> &R {
        self.device
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Reads the chunk starting at `offset`, skipping forward over
    /// unreadable sectors. Returns the offset actually read (>= `offset`)
    /// with the data, or `Ok(None)` once the end of the device is reached.
    /// Errors only when the device itself is gone.
    pub fn chunk_at(&mut self, offset: Offset) -> Result<Option<(Offset, Vec<u8>)>, DeviceError> {
        let size = self.device.size();
        let mut pos = offset;

        while pos < size {
            match self.device.read_at(pos, self.chunk_size) {
                Ok(data) if !data.is_empty() => {
                    self.consecutive_failures = 0;
                    return Ok(Some((pos, data)));
                }
                Ok(_) => return Ok(None),
                Err(e) if e.is_range_local() => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= DEVICE_LOST_THRESHOLD {
                        tracing::warn!(offset = pos, "read failures exhausted retry budget");
                        return Err(DeviceError::Unavailable(format!(
                            "{}: {} consecutive unreadable strides at offset {}",
                            self.device.path(),
                            self.consecutive_failures,
                            pos
                        )));
                    }
                    let stride = self.skip_stride.min(size - pos);
                    self.record_bad(pos, stride);
                    pos += stride;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn record_bad(&mut self, offset: Offset, length: u64) {
        tracing::debug!(offset, length, "marking unreadable region");
        if let Some(last) = self.bad_regions.last_mut() {
            if last.end() == offset {
                last.length += length;
                return;
            }
        }
        self.bad_regions.push(ScanRegion { offset, length });
    }

    pub fn bad_regions(&self) -> &[ScanRegion] {
        &self.bad_regions
    }

    pub fn into_bad_regions(self) -> Vec<ScanRegion> {
        self.bad_regions
    }
}
