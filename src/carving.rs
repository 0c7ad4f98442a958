use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::DeviceError;
use crate::io::{BlockDeviceReader, ChunkedScanner};
use crate::journal::{Journal, Severity};
use crate::signatures::{SignatureCatalog, SignatureDescriptor};
use crate::types::{CHUNK_SIZE, Confidence, ExtractionMethod, FileCandidate, Offset};
use crate::validation::{self, Validation};

/// Cursor advance when no signature matched. Byte stride examines every
/// window position; sector stride only sector-aligned ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStride {
    Byte,
    Sector,
}

/// Bytes of header context fetched when a match sits too close to a chunk
/// boundary for in-place length-field inspection.
const HEADER_CONTEXT: usize = 64;

/// Signature-carving scan over the full device address space. Streams
/// fixed-size windows that overlap by the longest header length minus
/// one, so a signature
/// split across a chunk boundary is still seen. Produces candidates into
/// the supplied sink; per-candidate problems never abort the scan.
pub struct Carver<'a> {
    catalog: &'a SignatureCatalog,
    stride: ScanStride,
}

impl<'a> Carver<'a> {
    pub fn new(catalog: &'a SignatureCatalog, stride: ScanStride) -> Self {
        Self { catalog, stride }
    }

    /// Runs the carve. `emit` blocks under backpressure and returns `false`
    /// to stop the scan (consumer gone or cancelled). `bytes_scanned` is
    /// updated as the cursor moves. Errors only on device loss.
    pub fn run<R: BlockDeviceReader + ?Sized>(
        &self,
        scanner: &mut ChunkedScanner<'_, R>,
        cancel: &AtomicBool,
        bytes_scanned: &AtomicU64,
        journal: Option<&Journal>,
        mut emit: impl FnMut(FileCandidate) -> bool,
    ) -> Result<(), DeviceError> {
        let device_size = scanner.device().size();
        let sector = scanner.device().sector_size().max(1);
        let overlap = self.catalog.max_header_len().saturating_sub(1) as u64;
        let mut cursor: Offset = 0;

        'chunks: while cursor < device_size {
            if cancel.load(Ordering::Relaxed) {
                return Ok(());
            }

            let (chunk_off, data) = match scanner.chunk_at(cursor)? {
                Some(chunk) => chunk,
                None => break,
            };
            cursor = cursor.max(chunk_off);
            bytes_scanned.store(cursor, Ordering::Relaxed);

            let mut last_rel = usize::MAX;
            for (rel, _) in self.catalog.find_in(&data) {
                if rel == last_rel {
                    continue;
                }
                last_rel = rel;

                let abs = chunk_off + rel as u64;
                if abs < cursor {
                    // Inside an already-claimed region.
                    continue;
                }
                if self.stride == ScanStride::Sector && abs % sector != 0 {
                    continue;
                }
                // A match this close to the chunk boundary could resolve
                // to the wrong descriptor on a truncated window; the next
                // chunk's overlap re-presents it whole.
                if rel + self.catalog.max_header_len() > data.len()
                    && chunk_off + (data.len() as u64) < device_size
                {
                    continue;
                }

                let matches = self.catalog.matches_at(&data[rel..]);
                let desc = match self.catalog.resolve(&matches) {
                    Some(d) => d,
                    None => continue,
                };
                if matches.len() > 1 {
                    record(
                        journal,
                        Severity::Info,
                        format!(
                            "{} signatures matched at offset {}, kept {}",
                            matches.len(),
                            abs,
                            desc.kind()
                        ),
                        Some(abs),
                    );
                }

                let candidate = match self.carve_one(scanner, desc, abs, &data, rel, cancel, journal)? {
                    Some(c) => c,
                    None => continue,
                };

                let end = candidate.end;
                if !emit(candidate) {
                    return Ok(());
                }

                // Claimed regions are never re-matched: jump the cursor to
                // the candidate's end rather than start+1.
                cursor = end;
                bytes_scanned.store(cursor.min(device_size), Ordering::Relaxed);
                if cursor >= chunk_off + data.len() as u64 {
                    continue 'chunks;
                }
            }

            let chunk_end = chunk_off + data.len() as u64;
            if chunk_end >= device_size {
                break;
            }
            // Step back by the overlap, but always make forward progress
            // even when a short read leaves less than one overlap of data.
            let next = chunk_end.saturating_sub(overlap);
            cursor = if next > cursor { next } else { chunk_end };
        }

        bytes_scanned.store(device_size, Ordering::Relaxed);
        Ok(())
    }

    /// Determines one candidate's extent. End offset, in priority order:
    /// embedded length field, earliest footer within the max-size window,
    /// max-size cap. Returns `None` for a rejected false positive.
    fn carve_one<R: BlockDeviceReader + ?Sized>(
        &self,
        scanner: &mut ChunkedScanner<'_, R>,
        desc: &SignatureDescriptor,
        abs: Offset,
        chunk: &[u8],
        rel: usize,
        cancel: &AtomicBool,
        journal: Option<&Journal>,
    ) -> Result<Option<FileCandidate>, DeviceError> {
        let device = scanner.device();
        let device_size = device.size();

        let (end, confidence, method, truncated) = if desc.has_embedded_length() {
            let window = &chunk[rel..];
            let head;
            let head_bytes: &[u8] = if window.len() >= HEADER_CONTEXT {
                window
            } else {
                head = device.read_at(abs, HEADER_CONTEXT).unwrap_or_default();
                &head[..]
            };
            match desc.embedded_length(head_bytes) {
                Some(len) => {
                    let end = abs + len;
                    if end > device_size {
                        (device_size, Confidence::High, ExtractionMethod::EmbeddedLength, true)
                    } else {
                        (end, Confidence::High, ExtractionMethod::EmbeddedLength, false)
                    }
                }
                // Implausible length field: the header match was noise.
                None => return Ok(None),
            }
        } else if let Some(footer) = desc.footer() {
            let search_from = abs + desc.header().len() as u64;
            let limit = (abs + desc.max_size()).min(device_size);
            match self.find_footer(device, search_from, limit, footer, cancel)? {
                Some(pos) => {
                    let end = (pos + footer.len() as u64 + desc.footer_trailer()).min(device_size);
                    (end, Confidence::High, ExtractionMethod::Footer, false)
                }
                None => self.capped(desc, abs, device_size),
            }
        } else {
            self.capped(desc, abs, device_size)
        };

        if end <= abs {
            return Ok(None);
        }

        let mut candidate = FileCandidate::new(desc.kind(), abs, end, confidence, method);
        if truncated {
            candidate = candidate.mark_partial();
        }

        match validation::validate(device, desc.kind(), abs, end) {
            Validation::Failed(reason) => {
                candidate.confidence = candidate.confidence.downgraded();
                record(
                    journal,
                    Severity::Warning,
                    format!("{} at offset {} failed validation: {}", desc.kind(), abs, reason),
                    Some(abs),
                );
            }
            Validation::Passed | Validation::NotAttempted => {}
        }

        Ok(Some(candidate))
    }

    fn capped(
        &self,
        desc: &SignatureDescriptor,
        abs: Offset,
        device_size: u64,
    ) -> (Offset, Confidence, ExtractionMethod, bool) {
        let wanted = abs + desc.max_size();
        let end = wanted.min(device_size);
        (end, Confidence::Low, ExtractionMethod::MaxSize, wanted > device_size)
    }

    /// Earliest footer occurrence in `[from, limit)`, streamed in bounded
    /// chunks. A locally unreadable stretch abandons the search (the caller
    /// falls back to the max-size cap); only device loss propagates.
    fn find_footer<R: BlockDeviceReader + ?Sized>(
        &self,
        device: &R,
        from: Offset,
        limit: Offset,
        footer: &[u8],
        cancel: &AtomicBool,
    ) -> Result<Option<Offset>, DeviceError> {
        let overlap = footer.len().saturating_sub(1);
        let mut pos = from;

        while pos < limit {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let want = ((limit - pos) as usize).min(CHUNK_SIZE);
            let data = match device.read_at(pos, want) {
                Ok(d) => d,
                Err(e) if e.is_range_local() => return Ok(None),
                Err(e) => return Err(e),
            };
            if data.len() < footer.len() {
                return Ok(None);
            }

            if let Some(idx) = data
                .windows(footer.len())
                .position(|window| window == footer)
            {
                return Ok(Some(pos + idx as u64));
            }

            if data.len() <= overlap {
                return Ok(None);
            }
            pos += (data.len() - overlap) as u64;
        }
        Ok(None)
    }
}

fn record(journal: Option<&Journal>, severity: Severity, message: String, offset: Option<Offset>) {
    if let Some(j) = journal {
        j.record(severity, &message, offset);
    }
}
