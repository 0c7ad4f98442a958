use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DeviceError;
use crate::fs::{self, FilesystemError, FilesystemVariant};
use crate::io::BlockDeviceReader;
use crate::journal::{Journal, Severity};
use crate::signatures::{FileKind, SignatureCatalog};
use crate::types::{ExtractionMethod, FileCandidate};

/// Bytes sniffed from a recovered extent to identify its type when the
/// directory entry's name does not.
const SNIFF_LEN: usize = 16;

/// Result of a metadata pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickOutcome {
    Scanned {
        variant: FilesystemVariant,
        entries: usize,
        emitted: usize,
    },
    /// No parsable filesystem metadata; only carving can help.
    NoFilesystem,
}

/// Quick scan: recover files whose directory metadata still exists but is
/// flagged deleted. Fails softly per entry: one corrupt record never
/// stops the pass.
pub struct Undelete<'a> {
    device: &'a dyn BlockDeviceReader,
    catalog: &'a SignatureCatalog,
}

impl<'a> Undelete<'a> {
    pub fn new(device: &'a dyn BlockDeviceReader, catalog: &'a SignatureCatalog) -> Self {
        Self { device, catalog }
    }

    pub fn run(
        &self,
        cancel: &AtomicBool,
        journal: Option<&Journal>,
        mut emit: impl FnMut(FileCandidate) -> bool,
    ) -> Result<QuickOutcome, DeviceError> {
        let parser = match fs::detect_filesystem(self.device) {
            Ok(p) => p,
            Err(FilesystemError::Device(e)) if !e.is_range_local() => return Err(e),
            Err(e) => {
                record(journal, Severity::Info, &format!("metadata pass skipped: {}", e), None);
                return Ok(QuickOutcome::NoFilesystem);
            }
        };
        let variant = parser.variant();
        record(
            journal,
            Severity::Info,
            &format!("detected {} metadata structures", variant.name()),
            None,
        );

        let entries = match parser.deleted_entries() {
            Ok(entries) => entries,
            Err(FilesystemError::Device(e)) if !e.is_range_local() => return Err(e),
            Err(e) => {
                record(
                    journal,
                    Severity::Warning,
                    &format!("{} directory structures unusable: {}", variant.name(), e),
                    None,
                );
                return Ok(QuickOutcome::NoFilesystem);
            }
        };

        let total = entries.len();
        let mut emitted = 0usize;
        for entry in entries {
            if cancel.load(Ordering::Relaxed) {
                break;
            }

            let extent = match parser.resolve(&entry) {
                Ok(Some(extent)) => extent,
                Ok(None) => {
                    record(
                        journal,
                        Severity::Info,
                        &format!(
                            "skipping {}: clusters reallocated",
                            entry.name.as_deref().unwrap_or("unnamed entry")
                        ),
                        None,
                    );
                    continue;
                }
                // A corrupt single entry is skipped; the scan continues.
                Err(e) => {
                    record(
                        journal,
                        Severity::Warning,
                        &format!(
                            "skipping {}: {}",
                            entry.name.as_deref().unwrap_or("unnamed entry"),
                            e
                        ),
                        None,
                    );
                    continue;
                }
            };

            let kind = self.identify(entry.name.as_deref(), extent.start);
            let mut candidate = FileCandidate::new(
                kind,
                extent.start,
                extent.end,
                extent.confidence,
                ExtractionMethod::Metadata,
            );
            candidate.partial = extent.partial;
            if let Some(name) = entry.name {
                candidate = candidate.with_name_hint(name);
            }

            if !emit(candidate) {
                break;
            }
            emitted += 1;
        }

        Ok(QuickOutcome::Scanned {
            variant,
            entries: total,
            emitted,
        })
    }

    /// Type identification: the recovered name's extension first, then a
    /// signature sniff of the extent's first bytes.
    fn identify(&self, name: Option<&str>, start: u64) -> FileKind {
        if let Some(kind) = name
            .and_then(|n| n.rsplit_once('.'))
            .and_then(|(_, ext)| FileKind::from_extension(ext))
        {
            return kind;
        }
        if let Ok(head) = self.device.read_at(start, SNIFF_LEN) {
            let matches = self.catalog.matches_at(&head);
            if let Some(desc) = self.catalog.resolve(&matches) {
                return desc.kind();
            }
        }
        FileKind::Unknown
    }
}

fn record(journal: Option<&Journal>, severity: Severity, message: &str, offset: Option<u64>) {
    if let Some(j) = journal {
        j.record(severity, message, offset);
    }
}
