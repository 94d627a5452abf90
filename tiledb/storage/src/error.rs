use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
///
/// Filesystem and codec errors surface to the caller; invariant violations
/// in the write path abort the current fragment only. Any failure leaves
/// committed on-disk state unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid array schema: {0}")]
    SchemaInvalid(String),

    #[error("Coordinate outside dimension domain: dimension {dimension}, value {value}")]
    DomainOutOfRange { dimension: usize, value: f64 },

    #[error("Tile or cell id arithmetic overflow")]
    DomainOverflow,

    #[error("Tile append violates tile ordering: {0}")]
    TileOrderViolation(String),

    #[error("Buffer of {required} bytes required, {provided} provided")]
    BufferTooSmall { required: u64, provided: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Descriptor refers to a closed {0}")]
    InvalidDescriptor(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let e = Error::DomainOutOfRange {
            dimension: 1,
            value: 42.0,
        };
        assert!(e.to_string().contains("dimension 1"));

        let e = Error::io("/tmp/a.tdb", std::io::Error::other("boom"));
        assert!(e.to_string().contains("a.tdb"));
    }
}
