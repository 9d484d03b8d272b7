// src/error.rs

use crate::lock::LockError;
use thiserror::Error;

/// Core error types for Stowage
#[derive(Error, Debug)]
pub enum Error {
    /// Lock acquisition or release failed
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store index could not be encoded or decoded
    #[error("Index serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store index written by a newer release
    #[error("Unsupported index version {found} (this build supports up to {supported})")]
    IndexVersion { found: u32, supported: u32 },

    /// Package has no install record
    #[error("Package '{0}' is not installed")]
    NotInstalled(String),

    /// Package already has an install record
    #[error("Package '{0}' is already installed")]
    AlreadyInstalled(String),
}

/// Result type alias using Stowage's Error type
pub type Result<T> = std::result::Result<T, Error>;
