use std::{io, path::PathBuf};

use thiserror::Error;

use crate::image::format::NameError;

/// Every way a compile run can fail.  Any of these aborts the run; nothing is retried.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("cannot read {path:?}: {source}")]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path:?}: name is {len} bytes, the limit is {max}")]
    NameTooLong { path: PathBuf, len: usize, max: usize },
    #[error("{path:?}: name must be non-empty UTF-8 without '/' or NUL")]
    InvalidName { path: PathBuf },
    #[error("{path:?}: file is {size} bytes, the limit is {max}")]
    SourceTooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("{path:?}: image would need more than {max} blocks")]
    ImageTooLarge { path: PathBuf, max: u64 },
    #[error("writing {path:?} into the image: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image assembly incomplete: {0}")]
    AssemblyIncomplete(String),
    #[error("{path:?} is locked by another compiler")]
    OutputLocked { path: PathBuf },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl CompileError {
    pub(crate) fn unreadable(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::UnreadableSource {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn write_failure(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::WriteFailure {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn bad_name(path: impl Into<PathBuf>, err: NameError) -> Self {
        match err {
            NameError::TooLong { len, max } => Self::NameTooLong {
                path: path.into(),
                len,
                max,
            },
            NameError::Invalid => Self::InvalidName { path: path.into() },
        }
    }

    /// The process exit code reported by `fs-compiler` for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::UnreadableSource { .. } => 10,
            Self::NameTooLong { .. } => 11,
            Self::InvalidName { .. } => 12,
            Self::SourceTooLarge { .. } => 13,
            Self::ImageTooLarge { .. } => 14,
            Self::WriteFailure { .. } => 15,
            Self::AssemblyIncomplete(..) => 16,
            Self::OutputLocked { .. } => 17,
            Self::InvalidOptions(..) => 18,
        }
    }
}
