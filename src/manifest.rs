use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::signatures::FileKind;
use crate::types::FileCandidate;

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    Recovered,
    Partial,
    Skipped,
    Failed,
}

/// One manifest row: a candidate, where it went, and how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub candidate: FileCandidate,
    pub destination: Option<PathBuf>,
    pub status: RecoveryStatus,
    /// SHA-256 of the written bytes, for recovered/partial entries.
    pub sha256: Option<String>,
    /// Why a skipped/failed entry ended that way.
    pub reason: Option<String>,
}

/// What to do with a candidate that overlaps already-accepted entries.
#[derive(Debug, PartialEq, Eq)]
pub enum OverlapDecision {
    Accept,
    /// Overlaps a higher-ranked entry; record as skipped, don't write.
    AcceptAmbiguous,
    RejectAmbiguous,
}

/// Ordered, append-only record of a session's recovery attempts. The
/// authoritative account of what happened; finalized at session end.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryManifest {
    entries: Vec<ManifestEntry>,
}

impl RecoveryManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the overlap invariant for an incoming candidate: accepted
    /// entries never overlap unless flagged ambiguous, and overlaps are
    /// ranked by confidence. A winning newcomer flags the already-written
    /// loser ambiguous (its file is kept, never rolled back).
    pub fn overlap_decision(&mut self, candidate: &FileCandidate) -> OverlapDecision {
        let mut wins_over_all = true;
        let mut any_overlap = false;

        for entry in self
            .entries
            .iter_mut()
            .filter(|e| matches!(e.status, RecoveryStatus::Recovered | RecoveryStatus::Partial))
        {
            if entry.candidate.overlaps(candidate) {
                any_overlap = true;
                entry.candidate.ambiguous = true;
                if candidate.confidence <= entry.candidate.confidence {
                    wins_over_all = false;
                }
            }
        }

        if !any_overlap {
            OverlapDecision::Accept
        } else if wins_over_all {
            OverlapDecision::AcceptAmbiguous
        } else {
            OverlapDecision::RejectAmbiguous
        }
    }

    pub fn record(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn written(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, RecoveryStatus::Recovered | RecoveryStatus::Partial))
    }

    pub fn count(&self, status: RecoveryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn count_kind(&self, kind: FileKind) -> usize {
        self.written().filter(|e| e.candidate.kind == kind).count()
    }

    /// One JSON object per line, consumable by any presentation layer.
    pub fn write_jsonl(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}
