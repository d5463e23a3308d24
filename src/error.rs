//! Engine error type.
use std::path::PathBuf;

use crate::file::Mode;

/// Main error type.
///
/// Short reads and short appends carry the path and the numeric shortfall;
/// open failures carry the path and the requested [`Mode`]. OS errors from
/// `truncate`/`rename`/`remove` propagate through [`Error::Io`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to open {path:?} with mode {mode:?}: {source}")]
    Open {
        path: PathBuf,
        mode: Mode,
        source: std::io::Error,
    },
    #[error("Short read on {path:?} at offset {offset}: requested {requested} bytes, got {got}")]
    Read {
        path: PathBuf,
        offset: u64,
        requested: u64,
        got: u64,
    },
    #[error("Short append on {path:?}: requested {requested} bytes, wrote {written}")]
    Append {
        path: PathBuf,
        requested: u64,
        written: u64,
    },
    #[error("Length of {path:?} ({len} bytes) is not a multiple of the element size")]
    InvalidLength { path: PathBuf, len: u64 },
    #[error("Too many simultaneously open unpooled files (limit {limit})")]
    DirectLimit { limit: usize },
    #[error("I/O pool shut down before the operation completed")]
    Shutdown,
    #[error("Index sidecar {path:?} could not be decoded")]
    InvalidIndex { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
