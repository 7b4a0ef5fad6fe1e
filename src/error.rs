//! Error taxonomy for the tenview crate.
//!
//! Every error is raised synchronously at the call that triggers it. The
//! one exception is shader hot-reload: a reload failure after a successful
//! initial compile keeps the previous program alive and logs instead of
//! raising, so a running render loop is never killed by an edit.

use std::path::PathBuf;

use crate::tensor::DType;

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A GPU operation was attempted without the owning context being
    /// current on the calling thread.
    #[error("context is not current on this thread; wrap the call in `Context::current()`")]
    NotCurrent,

    /// `Context::current()` was entered while a different context is
    /// already current on the same thread.
    #[error("another context is already current on this thread")]
    ContextBusy,

    /// The element type of a tensor is not accepted by the target
    /// operation.
    #[error("unsupported dtype {dtype:?}: {reason}")]
    UnsupportedType { dtype: DType, reason: String },

    /// Invalid array rank or dimension for the requested operation.
    #[error("shape error: {0}")]
    Shape(String),

    /// A shader failed to compile or validate at initial load.
    #[error("shader compile error in {}: {log}", path.display())]
    ShaderCompile { path: PathBuf, log: String },

    /// A name-keyed assignment referenced a shader input that the
    /// compiled program does not declare.
    #[error("program input `{0}` not found")]
    UnknownProgramInput(String),

    /// Malformed or unrecognized 3D object file.
    #[error("{}: {message}", path.display())]
    FileFormat { path: PathBuf, message: String },

    /// Adapter/device acquisition or another GPU-side failure.
    #[error("gpu error: {0}")]
    Gpu(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn file_format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::FileFormat {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(dtype: DType, reason: impl Into<String>) -> Self {
        Error::UnsupportedType {
            dtype,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
