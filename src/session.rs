use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::carving::{Carver, ScanStride};
use crate::error::{DeviceError, SessionError};
use crate::io::{BlockDeviceReader, ChunkedScanner, DiskReader, ScanRegion};
use crate::journal::{Journal, Severity, unix_now};
use crate::manifest::{ManifestEntry, OverlapDecision, RecoveryManifest, RecoveryStatus};
use crate::signatures::{FileKind, SignatureCatalog};
use crate::types::{CHUNK_SIZE, FileCandidate, ScanType};
use crate::undelete::{QuickOutcome, Undelete};

/// Candidates buffered between scanner and writer. A full queue blocks the
/// scanner rather than buffering unboundedly.
const CANDIDATE_QUEUE_DEPTH: usize = 64;

const JOURNAL_FILE: &str = "recovery.log";
const MANIFEST_FILE: &str = "manifest.jsonl";
const NAME_HINT_MAX: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scan_type: ScanType,
    /// Types to recover; empty means all.
    pub type_filter: HashSet<FileKind>,
    pub destination: PathBuf,
}

impl SessionConfig {
    pub fn new(scan_type: ScanType, destination: impl Into<PathBuf>) -> Self {
        Self {
            scan_type,
            type_filter: HashSet::new(),
            destination: destination.into(),
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = FileKind>) -> Self {
        self.type_filter = types.into_iter().collect();
        self
    }

    fn wants(&self, kind: FileKind) -> bool {
        self.type_filter.is_empty() || self.type_filter.contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Scanning,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Snapshot of a running session's progress. Counter reads are atomic;
/// no lock is shared with the scan worker.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub bytes_scanned: u64,
    pub device_size: u64,
    pub candidates_found: u64,
    pub files_written: u64,
    pub elapsed: Duration,
}

struct Shared {
    state: Mutex<SessionState>,
    cancel: AtomicBool,
    bytes_scanned: AtomicU64,
    candidates_found: AtomicU64,
    files_written: AtomicU64,
    started: Instant,
}

/// Everything a terminal session leaves behind.
#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    pub manifest: RecoveryManifest,
    pub bad_regions: Vec<ScanRegion>,
    pub failure: Option<String>,
}

pub struct RecoverySession;

impl RecoverySession {
    /// Opens the source twice, one handle exclusive to the scanner and
    /// the other serving the writer's extraction reads, and starts the
    /// session worker.
    pub fn start(
        source: impl AsRef<Path>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        let source = source.as_ref();
        let scan = Arc::new(DiskReader::open(source)?);
        let write = Arc::new(DiskReader::open(source)?);
        Self::start_with_devices(scan, write, config)
    }

    pub fn start_with_devices(
        scan_device: Arc<dyn BlockDeviceReader>,
        write_device: Arc<dyn BlockDeviceReader>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        fs::create_dir_all(&config.destination).map_err(|e| SessionError::DestinationUnwritable {
            path: config.destination.clone(),
            source: e,
        })?;
        let journal = Arc::new(
            Journal::open(config.destination.join(JOURNAL_FILE)).map_err(SessionError::Journal)?,
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Idle),
            cancel: AtomicBool::new(false),
            bytes_scanned: AtomicU64::new(0),
            candidates_found: AtomicU64::new(0),
            files_written: AtomicU64::new(0),
            started: Instant::now(),
        });

        journal.record(
            Severity::Info,
            &format!(
                "session started: {:?} scan of {} ({} bytes)",
                config.scan_type,
                scan_device.path(),
                scan_device.size()
            ),
            None,
        );

        let device_size = scan_device.size();
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("salvor-session".into())
                .spawn(move || run_session(scan_device, write_device, config, shared, journal))
                .map_err(SessionError::Spawn)?
        };

        Ok(SessionHandle {
            shared,
            device_size,
            worker: Some(worker),
            report: None,
        })
    }
}

pub struct SessionHandle {
    shared: Arc<Shared>,
    device_size: u64,
    worker: Option<JoinHandle<SessionReport>>,
    report: Option<SessionReport>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: *self.shared.state.lock(),
            bytes_scanned: self.shared.bytes_scanned.load(Ordering::Relaxed),
            device_size: self.device_size,
            candidates_found: self.shared.candidates_found.load(Ordering::Relaxed),
            files_written: self.shared.files_written.load(Ordering::Relaxed),
            elapsed: self.shared.started.elapsed(),
        }
    }

    /// Requests cooperative cancellation: observed between candidate
    /// writes and at chunk granularity inside the scanners, never
    /// mid-write. Already-written files are kept.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Blocks until the session reaches a terminal state.
    pub fn wait(&mut self) -> &SessionReport {
        if let Some(worker) = self.worker.take() {
            let report = worker.join().unwrap_or_else(|_| {
                *self.shared.state.lock() = SessionState::Failed;
                SessionReport {
                    state: SessionState::Failed,
                    manifest: RecoveryManifest::new(),
                    bad_regions: Vec::new(),
                    failure: Some("session worker panicked".into()),
                }
            });
            self.report = Some(report);
        }
        self.report.as_ref().expect("report cached after join")
    }

    /// The manifest, valid only once the session is terminal.
    pub fn result(&mut self) -> Option<&RecoveryManifest> {
        if !self.is_finished() {
            return None;
        }
        Some(&self.wait().manifest)
    }
}

fn run_session(
    scan_device: Arc<dyn BlockDeviceReader>,
    write_device: Arc<dyn BlockDeviceReader>,
    config: SessionConfig,
    shared: Arc<Shared>,
    journal: Arc<Journal>,
) -> SessionReport {
    *shared.state.lock() = SessionState::Scanning;

    let (tx, rx) = bounded::<FileCandidate>(CANDIDATE_QUEUE_DEPTH);

    let producer: JoinHandle<Result<Vec<ScanRegion>, DeviceError>> = {
        let shared = Arc::clone(&shared);
        let journal = Arc::clone(&journal);
        let scan_type = config.scan_type;
        thread::Builder::new()
            .name("salvor-scan".into())
            .spawn(move || {
                let device = &*scan_device;
                let catalog = SignatureCatalog::builtin();

                if scan_type == ScanType::Quick {
                    let undelete = Undelete::new(device, catalog);
                    let outcome = undelete.run(&shared.cancel, Some(&journal), |c| {
                        shared.candidates_found.fetch_add(1, Ordering::Relaxed);
                        tx.send(c).is_ok()
                    })?;
                    if let QuickOutcome::Scanned {
                        variant,
                        entries,
                        emitted,
                    } = outcome
                    {
                        journal.record(
                            Severity::Info,
                            &format!(
                                "metadata pass: {} of {} deleted {} entries recoverable",
                                emitted,
                                entries,
                                variant.name()
                            ),
                            None,
                        );
                    }
                }

                let stride = match scan_type {
                    ScanType::Quick => ScanStride::Sector,
                    ScanType::Deep => ScanStride::Byte,
                };
                let carver = Carver::new(catalog, stride);
                let mut scanner = ChunkedScanner::new(device);
                carver.run(
                    &mut scanner,
                    &shared.cancel,
                    &shared.bytes_scanned,
                    Some(&journal),
                    |c| {
                        shared.candidates_found.fetch_add(1, Ordering::Relaxed);
                        tx.send(c).is_ok()
                    },
                )?;
                Ok(scanner.into_bad_regions())
            })
            .expect("spawn scan thread")
    };

    let mut manifest = RecoveryManifest::new();
    let mut fatal: Option<String> = None;
    let mut seq: u32 = 0;

    for candidate in rx.iter() {
        // Cancellation is observed between candidate writes only.
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        if !config.wants(candidate.kind) {
            manifest.record(ManifestEntry {
                candidate,
                destination: None,
                status: RecoveryStatus::Skipped,
                sha256: None,
                reason: Some("excluded by type filter".into()),
            });
            continue;
        }

        let mut candidate = candidate;
        match manifest.overlap_decision(&candidate) {
            OverlapDecision::Accept => {}
            OverlapDecision::AcceptAmbiguous => candidate.ambiguous = true,
            OverlapDecision::RejectAmbiguous => {
                candidate.ambiguous = true;
                journal.record(
                    Severity::Info,
                    &format!(
                        "skipping {} at offset {}: overlaps a higher-confidence recovery",
                        candidate.kind, candidate.start
                    ),
                    Some(candidate.start),
                );
                manifest.record(ManifestEntry {
                    candidate,
                    destination: None,
                    status: RecoveryStatus::Skipped,
                    sha256: None,
                    reason: Some("overlaps a higher-confidence recovery".into()),
                });
                continue;
            }
        }

        seq += 1;
        match write_candidate(&*write_device, &candidate, &config.destination, seq) {
            Ok(written) => {
                let status = if candidate.partial {
                    RecoveryStatus::Partial
                } else {
                    RecoveryStatus::Recovered
                };
                shared.files_written.fetch_add(1, Ordering::Relaxed);
                journal.record(
                    Severity::Info,
                    &format!(
                        "recovered {} ({} bytes) -> {}",
                        candidate.kind,
                        written.bytes,
                        written.path.display()
                    ),
                    Some(candidate.start),
                );
                manifest.record(ManifestEntry {
                    candidate,
                    destination: Some(written.path),
                    status,
                    sha256: Some(written.sha256),
                    reason: None,
                });
            }
            Err(WriteFailure::Fatal(e)) => {
                journal.record(
                    Severity::Error,
                    &format!("destination became unwritable: {}", e),
                    None,
                );
                manifest.record(ManifestEntry {
                    candidate,
                    destination: None,
                    status: RecoveryStatus::Failed,
                    sha256: None,
                    reason: Some(format!("destination unwritable: {}", e)),
                });
                fatal = Some(format!("destination unwritable: {}", e));
                break;
            }
            Err(WriteFailure::PerFile(reason)) => {
                journal.record(
                    Severity::Warning,
                    &format!(
                        "failed to recover {} at offset {}: {}",
                        candidate.kind, candidate.start, reason
                    ),
                    Some(candidate.start),
                );
                manifest.record(ManifestEntry {
                    candidate,
                    destination: None,
                    status: RecoveryStatus::Failed,
                    sha256: None,
                    reason: Some(reason),
                });
            }
        }
    }
    drop(rx);

    let producer_result = producer.join();
    *shared.state.lock() = SessionState::Finalizing;

    let mut bad_regions = Vec::new();
    match producer_result {
        Ok(Ok(regions)) => {
            for region in &regions {
                journal.record(
                    Severity::Warning,
                    &format!("unreadable region of {} bytes skipped", region.length),
                    Some(region.offset),
                );
            }
            bad_regions = regions;
        }
        Ok(Err(e)) => {
            journal.record(Severity::Error, &format!("scan aborted: {}", e), None);
            fatal.get_or_insert(format!("device lost: {}", e));
        }
        Err(_) => {
            fatal.get_or_insert("scan worker panicked".into());
        }
    }

    let state = if fatal.is_some() {
        SessionState::Failed
    } else if shared.cancel.load(Ordering::Relaxed) {
        SessionState::Cancelled
    } else {
        SessionState::Completed
    };

    if let Err(e) = manifest.write_jsonl(&config.destination.join(MANIFEST_FILE)) {
        journal.record(
            Severity::Warning,
            &format!("could not export manifest: {}", e),
            None,
        );
    }
    journal.record(
        Severity::Info,
        &format!(
            "session {:?}: {} recovered, {} partial, {} skipped, {} failed",
            state,
            manifest.count(RecoveryStatus::Recovered),
            manifest.count(RecoveryStatus::Partial),
            manifest.count(RecoveryStatus::Skipped),
            manifest.count(RecoveryStatus::Failed),
        ),
        None,
    );

    *shared.state.lock() = state;
    SessionReport {
        state,
        manifest,
        bad_regions,
        failure: fatal,
    }
}

enum WriteFailure {
    /// The destination itself is gone; the session cannot continue.
    Fatal(io::Error),
    /// Only this candidate failed; scanning continues.
    PerFile(String),
}

struct Written {
    path: PathBuf,
    sha256: String,
    bytes: u64,
}

/// Streams a candidate's byte range to a uniquely named destination file,
/// hashing as it goes. A failed write removes the torn file so no
/// partially-written output ever survives.
fn write_candidate(
    device: &dyn BlockDeviceReader,
    candidate: &FileCandidate,
    destination: &Path,
    seq: u32,
) -> Result<Written, WriteFailure> {
    let path = destination.join(output_filename(candidate, seq));
    let mut file = File::create(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => WriteFailure::Fatal(e),
        _ => WriteFailure::PerFile(e.to_string()),
    })?;

    let mut hasher = Sha256::new();
    let mut pos = candidate.start;
    let mut bytes = 0u64;

    let outcome: Result<(), String> = loop {
        if pos >= candidate.end {
            break Ok(());
        }
        let want = ((candidate.end - pos) as usize).min(CHUNK_SIZE);
        let data = match device.read_at(pos, want) {
            Ok(d) if !d.is_empty() => d,
            Ok(_) => break Err("source ended short of the candidate extent".into()),
            Err(e) => break Err(e.to_string()),
        };
        if let Err(e) = file.write_all(&data) {
            break Err(e.to_string());
        }
        hasher.update(&data);
        pos += data.len() as u64;
        bytes += data.len() as u64;
    };

    match outcome.and_then(|_| file.sync_all().map_err(|e| e.to_string())) {
        Ok(()) => Ok(Written {
            path,
            sha256: hex::encode(hasher.finalize()),
            bytes,
        }),
        Err(reason) => {
            drop(file);
            let _ = fs::remove_file(&path);
            Err(WriteFailure::PerFile(reason))
        }
    }
}

/// `<discovery_timestamp>_<disambiguator>[_<name_hint>].<extension>`; the
/// timestamp alone collides within a second, the sequence number does not.
fn output_filename(candidate: &FileCandidate, seq: u32) -> String {
    let ts = unix_now();
    let ext = candidate.kind.extension();
    match candidate.name_hint.as_deref().map(sanitize_hint) {
        Some(hint) if !hint.is_empty() => format!("{}_{:04}_{}.{}", ts, seq, hint, ext),
        _ => format!("{}_{:04}.{}", ts, seq, ext),
    }
}

fn sanitize_hint(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(NAME_HINT_MAX)
        .collect()
}
