//! Crate-wide error taxonomy.

use thiserror::Error;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by construction and by the internal error-accounting
/// path (`Cores::error_code`/`Cores::error_message`).
#[derive(Debug, Error)]
pub enum Error {
    /// The device-type filter (or device list) selected zero devices.
    #[error("no device matched the requested filter")]
    NoDevice,

    /// Kernel source failed to compile/link on a specific device.
    #[error("kernel compile/link error on device {device}: {source_log}")]
    CompileError { device: String, source_log: String },

    /// A host<->device transfer or kernel dispatch failed.
    #[error("transfer/dispatch error: {0}")]
    TransferError(#[from] ocl::Error),

    /// A contract the caller is responsible for was violated (alignment,
    /// pipeline-stage count, write-all across multiple devices, ...).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A device index passed to a query method does not exist.
    #[error("device index {0} out of range ({1} devices known)")]
    DeviceIndexOutOfRange(usize, usize),

    /// An internal lock was poisoned by a panicking holder.
    #[error("internal lock poisoned: {0}")]
    PoisonedLock(String),
}
