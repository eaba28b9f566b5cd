//! The error type shared by every layer of the crate.
//!
//! Variants map onto four classes: parameter errors (`BadParameter`, `OutOfRange`,
//! `NotPermitted`), format errors (`Format`, `Fault`, `Unsupported`), I/O errors (`Io`) and
//! resource errors (`NoMemory`). The remaining variants (`Busy`, `Duplicate`, `NotFound`) report
//! conflicts with what is already on the medium.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An argument was invalid before any I/O took place
    #[error("invalid parameter: {0}")]
    BadParameter(String),

    /// The device or the structure on it is of a kind this crate does not handle
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation is not allowed in the current open mode or scan state
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// An index or offset lies beyond the end of the addressed object
    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        limit: u64,
    },

    /// The structure has not been written yet, or is missing entirely
    #[error("not formatted: {0}")]
    Format(String),

    /// The structure is present but corrupt (bad magic or CRC)
    #[error("corrupt structure: {0}")]
    Fault(String),

    /// A UBI container already exists and overwriting it was not requested
    #[error("partition already holds a UBI container")]
    Busy,

    /// A volume with this name or id already exists
    #[error("volume already exists: {0}")]
    Duplicate(String),

    /// Not enough free blocks (or scratch memory) remain for the request
    #[error("insufficient space: need {needed}, {available} available")]
    NoMemory { needed: u64, available: u64 },

    /// The volume was never created
    #[error("volume {0} not found")]
    NotFound(u32),

    /// A physical read, program or erase failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Does this error mean "not formatted or corrupt", so that the caller may choose to
    /// (re)create the structure?
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_) | Self::Fault(_) | Self::Unsupported(_))
    }

    /// Does this error come from the device itself?
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub(crate) fn out_of_range(
        what: &'static str,
        index: impl Into<u64>,
        limit: impl Into<u64>,
    ) -> Self {
        Self::OutOfRange {
            what,
            index: index.into(),
            limit: limit.into(),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(value: nix::errno::Errno) -> Self {
        Self::Io(value.into())
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
