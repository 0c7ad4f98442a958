use serde::Serialize;

use crate::signatures::FileKind;

pub type Offset = u64;

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;

/// Sector size assumed for image files. Real block devices may report 4K.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Upper bound on a single read. The engine never holds more than one chunk
/// of device data per thread, regardless of device size.
pub const CHUNK_SIZE: usize = MB as usize;

/// Qualitative certainty attached to a candidate's boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// One-step downgrade, applied when container validation fails.
    pub fn downgraded(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            Confidence::Medium | Confidence::Low => Confidence::Low,
        }
    }
}

/// How a candidate's extent was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Filesystem metadata (directory entry + allocation structure).
    Metadata,
    /// Length field embedded in the header.
    EmbeddedLength,
    /// Footer signature located within the max-size window.
    Footer,
    /// No footer and no length field; capped at the catalog max size.
    MaxSize,
}

/// A recoverable file located by a scanner. Immutable once produced; the
/// session decides whether to accept, skip, or write it.
#[derive(Debug, Clone, Serialize)]
pub struct FileCandidate {
    pub kind: FileKind,
    pub start: Offset,
    /// Exclusive end offset. Always `start < end <= device_size`.
    pub end: Offset,
    pub confidence: Confidence,
    pub method: ExtractionMethod,
    /// Reconstructed length fell short of what metadata reported, or the
    /// extent was truncated at end of device.
    pub partial: bool,
    /// Overlapped another candidate and was resolved by confidence ranking.
    pub ambiguous: bool,
    /// Original filename, when the quick scanner could read one.
    pub name_hint: Option<String>,
}

impl FileCandidate {
    pub fn new(
        kind: FileKind,
        start: Offset,
        end: Offset,
        confidence: Confidence,
        method: ExtractionMethod,
    ) -> Self {
        debug_assert!(start < end);
        Self {
            kind,
            start,
            end,
            confidence,
            method,
            partial: false,
            ambiguous: false,
            name_hint: None,
        }
    }

    pub fn with_name_hint(mut self, name: impl Into<String>) -> Self {
        self.name_hint = Some(name.into());
        self
    }

    pub fn mark_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &FileCandidate) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Scan variants exposed to callers. Quick attempts filesystem metadata
/// first and carves at sector stride; Deep carves every byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Quick,
    Deep,
}

pub fn size_human(size: u64) -> String {
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;
    if size >= TB {
        format!("{:.2} TB", size as f64 / TB as f64)
    } else if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
