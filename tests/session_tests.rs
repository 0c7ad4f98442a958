//! Recovery session integration tests: the full scan→write→manifest path,
//! type filtering, cancellation, and fatal-failure behavior.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use salvor::types::MB;
use salvor::{
    BlockDeviceReader, DeviceError, ExtractionMethod, FileKind, RecoveryStatus, RecoverySession,
    ScanType, SessionConfig, SessionError, SessionState,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn data_files_in(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_str().unwrap();
            name != "recovery.log" && name != "manifest.jsonl"
        })
        .collect();
    files.sort();
    files
}

// ============================================================================
// Deep scan end to end
// ============================================================================

#[test]
fn deep_session_recovers_writes_and_reports() {
    let jpeg = jpeg_bytes(2200);
    let png = png_bytes(1500);
    let pdf = pdf_bytes(900);

    let mut image = MemDevice::zeroed(MB as usize);
    image.write_at(4096, &jpeg);
    image.write_at(65_536, &png);
    image.write_at(131_072, &pdf);
    let source = image.bytes.clone();
    let device = Arc::new(image);

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");
    let config = SessionConfig::new(ScanType::Deep, &dest);

    let mut handle =
        RecoverySession::start_with_devices(device.clone(), device, config).unwrap();
    let report = handle.wait();

    assert_eq!(report.state, SessionState::Completed);
    assert!(report.bad_regions.is_empty());

    let written: Vec<_> = report.manifest.written().collect();
    assert_eq!(written.len(), 3);
    assert_eq!(report.manifest.count(RecoveryStatus::Recovered), 3);

    for entry in &written {
        let path = entry.destination.as_ref().expect("written entries have a path");
        let bytes = fs::read(path).unwrap();
        let range = &source[entry.candidate.start as usize..entry.candidate.end as usize];
        assert_eq!(bytes, range, "output file must match the source extent");

        let digest = hex::encode(Sha256::digest(&bytes));
        assert_eq!(entry.sha256.as_deref(), Some(digest.as_str()));

        // <timestamp>_<seq>.<ext>
        let name = path.file_name().unwrap().to_str().unwrap();
        let (ts, _) = name.split_once('_').unwrap();
        assert!(ts.parse::<u64>().is_ok(), "bad output name {}", name);
    }

    assert!(dest.join("recovery.log").exists());
    let manifest_lines = fs::read_to_string(dest.join("manifest.jsonl")).unwrap();
    assert_eq!(manifest_lines.lines().count(), report.manifest.entries().len());

    // Terminal status is visible through the handle too.
    assert_eq!(handle.status().state, SessionState::Completed);
    assert!(handle.result().is_some());
}

#[test]
fn type_filter_excludes_other_kinds() {
    let mut image = MemDevice::zeroed(MB as usize);
    image.write_at(4096, &jpeg_bytes(800));
    image.write_at(65_536, &pdf_bytes(600));
    let device = Arc::new(image);

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");
    let config = SessionConfig::new(ScanType::Deep, &dest).with_types([FileKind::Jpeg]);

    let mut handle =
        RecoverySession::start_with_devices(device.clone(), device, config).unwrap();
    let report = handle.wait();

    assert_eq!(report.state, SessionState::Completed);
    let written: Vec<_> = report.manifest.written().collect();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].candidate.kind, FileKind::Jpeg);

    let skipped: Vec<_> = report
        .manifest
        .entries()
        .iter()
        .filter(|e| e.status == RecoveryStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].candidate.kind, FileKind::Pdf);
    assert_eq!(skipped[0].reason.as_deref(), Some("excluded by type filter"));

    // Only the JPEG landed on disk.
    let files = data_files_in(&dest);
    assert_eq!(files.len(), 1);
    assert!(files[0].to_str().unwrap().ends_with(".jpg"));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn cancellation_keeps_completed_writes_only() {
    let jpeg = jpeg_bytes(500);
    let mut image = MemDevice::zeroed(300 * 1024);
    for i in 1..=30 {
        image.write_at(i * 8192, &jpeg);
    }
    let source = image.bytes.clone();

    let scan_device = Arc::new(MemDevice::new(source.clone()));
    // Slow extraction reads pace the writer so cancellation lands mid-run.
    let write_device = Arc::new(SlowDevice::new(image, Duration::from_millis(20)));

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");
    let config = SessionConfig::new(ScanType::Deep, &dest);

    let mut handle =
        RecoverySession::start_with_devices(scan_device, write_device, config).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    handle.cancel();
    let report = handle.wait();

    assert_eq!(report.state, SessionState::Cancelled);
    let written: Vec<_> = report.manifest.written().collect();
    assert!(!written.is_empty(), "some candidates were written before cancel");
    assert!(written.len() < 30, "cancellation stopped the session early");

    // Exactly the manifested files exist, each fully written.
    let files = data_files_in(&dest);
    assert_eq!(files.len(), written.len());
    for entry in &written {
        let bytes = fs::read(entry.destination.as_ref().unwrap()).unwrap();
        let range = &source[entry.candidate.start as usize..entry.candidate.end as usize];
        assert_eq!(bytes, range, "no partially-written output may survive");
    }
}

// ============================================================================
// Fatal failures
// ============================================================================

#[test]
fn unwritable_destination_fails_at_start() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();

    let device = Arc::new(MemDevice::zeroed(64 * 1024));
    let config = SessionConfig::new(ScanType::Deep, blocker.join("out"));
    let result = RecoverySession::start_with_devices(device.clone(), device, config);
    assert!(matches!(
        result.err(),
        Some(SessionError::DestinationUnwritable { .. })
    ));
}

struct DeadDevice;

impl BlockDeviceReader for DeadDevice {
    fn read_at(&self, _offset: u64, _length: usize) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::Unavailable("handle lost".into()))
    }

    fn size(&self) -> u64 {
        MB
    }

    fn sector_size(&self) -> u64 {
        512
    }

    fn path(&self) -> &str {
        "dead"
    }
}

#[test]
fn lost_device_fails_the_session() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");
    let config = SessionConfig::new(ScanType::Deep, &dest);

    let mut handle = RecoverySession::start_with_devices(
        Arc::new(DeadDevice),
        Arc::new(DeadDevice),
        config,
    )
    .unwrap();
    let report = handle.wait();

    assert_eq!(report.state, SessionState::Failed);
    assert!(report.failure.as_deref().unwrap_or("").contains("device lost"));
    assert!(report.manifest.written().next().is_none());
}

// ============================================================================
// Quick scan sessions
// ============================================================================

#[test]
fn quick_session_recovers_metadata_entry_and_dedups_the_carve() {
    let content = jpeg_bytes(994); // 1000 bytes at cluster 2
    let mut image = FatImageBuilder::new();
    image.add_root_entry(b"\xE5HOTO   JPG", 0x20, 2, 1000);
    image.write_cluster_data(2, &content);
    let device = Arc::new(image.build());

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out");
    let config = SessionConfig::new(ScanType::Quick, &dest);

    let mut handle =
        RecoverySession::start_with_devices(device.clone(), device, config).unwrap();
    let report = handle.wait();

    assert_eq!(report.state, SessionState::Completed);
    let written: Vec<_> = report.manifest.written().collect();

    // The metadata pass recovered the file; the sector-stride carve found
    // the same extent again and the overlap policy flagged the pair.
    let metadata_entry = written
        .iter()
        .find(|e| e.candidate.method == ExtractionMethod::Metadata)
        .expect("metadata recovery present");
    assert_eq!(metadata_entry.candidate.name_hint.as_deref(), Some("_HOTO.JPG"));
    assert_eq!(
        metadata_entry.candidate.start,
        FatImageBuilder::cluster_offset(2)
    );
    assert!(metadata_entry.candidate.ambiguous);
    assert!(
        metadata_entry
            .destination
            .as_ref()
            .unwrap()
            .to_str()
            .unwrap()
            .contains("_HOTO.JPG")
    );

    let carved_entry = written
        .iter()
        .find(|e| e.candidate.method == ExtractionMethod::Footer)
        .expect("carve pass re-found the extent");
    assert!(carved_entry.candidate.ambiguous);
    assert_eq!(carved_entry.candidate.start, metadata_entry.candidate.start);

    for entry in &written {
        let bytes = fs::read(entry.destination.as_ref().unwrap()).unwrap();
        assert_eq!(bytes, content);
    }
}
