use crate::error::DeviceError;
use crate::io::BlockDeviceReader;
use crate::signatures::FileKind;
use crate::types::Offset;

/// Outcome of validating a carved candidate's internal structure.
/// Failure downgrades confidence; it never discards the candidate, since a
/// corrupted container is still partially useful to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Passed,
    Failed(String),
    /// No validator exists for this kind.
    NotAttempted,
}

impl Validation {
    pub fn failed(&self) -> bool {
        matches!(self, Validation::Failed(_))
    }
}

const EOCD_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const CENTRAL_DIR_MAGIC: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const EOCD_MIN_LEN: usize = 22;
const EOCD_SEARCH_WINDOW: usize = 64 * 1024;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_CRC_BUDGET: u64 = 512 * 1024;

/// Validates the internal structure of a candidate's byte range. Read
/// errors inside the range count as failures (the structure cannot be
/// confirmed) but never abort anything beyond this candidate.
pub fn validate<R: BlockDeviceReader + ?Sized>(
    device: &R,
    kind: FileKind,
    start: Offset,
    end: Offset,
) -> Validation {
    let result = match kind {
        FileKind::Zip | FileKind::Docx => validate_zip(device, start, end),
        FileKind::Png => validate_png(device, start, end),
        _ => return Validation::NotAttempted,
    };
    match result {
        Ok(v) => v,
        Err(e) => Validation::Failed(format!("unreadable during validation: {}", e)),
    }
}

/// ZIP-family check: locate the end-of-central-directory record near the
/// tail, then confirm the central directory it points at actually starts
/// with a central-directory header.
fn validate_zip<R: BlockDeviceReader + ?Sized>(
    device: &R,
    start: Offset,
    end: Offset,
) -> Result<Validation, DeviceError> {
    let len = end - start;
    if len < EOCD_MIN_LEN as u64 {
        return Ok(Validation::Failed("too short for an archive".into()));
    }

    let window = (len.min(EOCD_SEARCH_WINDOW as u64)) as usize;
    let tail_start = end - window as u64;
    let tail = device.read_at(tail_start, window)?;

    let eocd_pos = match rfind(&tail, &EOCD_MAGIC) {
        Some(pos) => pos,
        None => return Ok(Validation::Failed("no end-of-central-directory record".into())),
    };
    let eocd = &tail[eocd_pos..];
    if eocd.len() < EOCD_MIN_LEN {
        return Ok(Validation::Failed("truncated end-of-central-directory record".into()));
    }

    let entries = u16::from_le_bytes([eocd[10], eocd[11]]) as u64;
    let cd_size = u32::from_le_bytes([eocd[12], eocd[13], eocd[14], eocd[15]]) as u64;
    let cd_offset = u32::from_le_bytes([eocd[16], eocd[17], eocd[18], eocd[19]]) as u64;

    if entries == 0 {
        return Ok(Validation::Failed("archive directory lists no entries".into()));
    }
    if cd_offset.saturating_add(cd_size) > len {
        return Ok(Validation::Failed("central directory lies outside the archive".into()));
    }

    let head = device.read_at(start + cd_offset, CENTRAL_DIR_MAGIC.len())?;
    if head != CENTRAL_DIR_MAGIC {
        return Ok(Validation::Failed("central directory header mismatch".into()));
    }

    Ok(Validation::Passed)
}

/// PNG structure walk: IHDR first, IEND last, chunk lengths consistent,
/// chunk CRCs correct for chunks small enough to check in one read.
fn validate_png<R: BlockDeviceReader + ?Sized>(
    device: &R,
    start: Offset,
    end: Offset,
) -> Result<Validation, DeviceError> {
    let len = end - start;
    if len < (PNG_SIGNATURE.len() + 12) as u64 {
        return Ok(Validation::Failed("too short for a PNG".into()));
    }
    let sig = device.read_at(start, PNG_SIGNATURE.len())?;
    if sig != PNG_SIGNATURE {
        return Ok(Validation::Failed("signature mismatch".into()));
    }

    let mut pos = start + PNG_SIGNATURE.len() as u64;
    let mut first = true;
    let mut saw_iend = false;

    while pos + 12 <= end {
        let head = device.read_at(pos, 8)?;
        if head.len() < 8 {
            return Ok(Validation::Failed("truncated chunk header".into()));
        }
        let chunk_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
        let chunk_type: [u8; 4] = [head[4], head[5], head[6], head[7]];

        if first && &chunk_type != b"IHDR" {
            return Ok(Validation::Failed("first chunk is not IHDR".into()));
        }
        first = false;

        let data_end = pos + 8 + chunk_len;
        if data_end + 4 > end {
            return Ok(Validation::Failed(format!(
                "chunk length overruns candidate at offset {}",
                pos
            )));
        }

        if chunk_len <= PNG_CRC_BUDGET {
            let body = device.read_at(pos + 4, 4 + chunk_len as usize)?;
            let stored = device.read_at(data_end, 4)?;
            if body.len() == 4 + chunk_len as usize && stored.len() == 4 {
                let crc = crc32fast::hash(&body);
                let expected = u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
                if crc != expected {
                    return Ok(Validation::Failed(format!(
                        "chunk CRC mismatch at offset {}",
                        pos
                    )));
                }
            }
        }

        pos = data_end + 4;
        if &chunk_type == b"IEND" {
            saw_iend = true;
            break;
        }
    }

    if !saw_iend {
        return Ok(Validation::Failed("no IEND chunk".into()));
    }
    Ok(Validation::Passed)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}
