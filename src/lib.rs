pub mod carving;
pub mod error;
pub mod fs;
pub mod io;
pub mod journal;
pub mod manifest;
pub mod session;
pub mod signatures;
pub mod types;
pub mod undelete;
pub mod validation;

pub use error::{DeviceError, SessionError};
pub use io::{BlockDeviceReader, ChunkedScanner, DiskReader, MappedImage, ScanRegion};
pub use manifest::{ManifestEntry, RecoveryManifest, RecoveryStatus};
pub use session::{
    RecoverySession, SessionConfig, SessionHandle, SessionReport, SessionState, SessionStatus,
};
pub use signatures::{FileKind, SignatureCatalog, SignatureDescriptor};
pub use types::{Confidence, ExtractionMethod, FileCandidate, Offset, ScanType};
