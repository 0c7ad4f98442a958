use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading from a block device or image file.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid offset: {offset} exceeds device size {device_size}")]
    InvalidOffset { offset: u64, device_size: u64 },

    #[error("Read error at offset {offset}: {source}")]
    Read { offset: u64, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Whether this error is scoped to a byte range (skippable) rather than
    /// the device as a whole (fatal to the session).
    pub fn is_range_local(&self) -> bool {
        matches!(
            self,
            DeviceError::Read { .. } | DeviceError::InvalidOffset { .. }
        )
    }
}

/// Conditions that make further scanning meaningless and fail a whole
/// session. Everything else is absorbed into the manifest and journal.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Destination not writable: {path}: {source}")]
    DestinationUnwritable { path: PathBuf, source: io::Error },

    #[error("Device lost: {0}")]
    DeviceLost(#[from] DeviceError),

    #[error("Recovery log error: {0}")]
    Journal(#[source] io::Error),

    #[error("Could not spawn session worker: {0}")]
    Spawn(#[source] io::Error),
}
