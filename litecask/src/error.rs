//! Error types for datastore operations

use thiserror::Error;

/// Errors returned by the datastore API.
///
/// Argument and shape errors (`BadKeySize`, `BadValueSize`, the key-index
/// variants, the parameter variants) fail synchronously without side effects.
/// `Corrupted` is per-record and does not affect other keys. `Io` after
/// repeated write failures leaves the store in a read-only degraded state.
#[derive(Debug, Error)]
pub enum Error {
    /// The datastore is not open
    #[error("datastore is not open")]
    StoreNotOpen,

    /// `open` was called twice on the same instance
    #[error("datastore is already open")]
    StoreAlreadyOpen,

    /// Another process holds the lock file of this datastore
    #[error("datastore is already open and locked by another process")]
    StoreAlreadyInUse,

    /// No entry for this key (also returned for tombstoned or expired entries)
    #[error("entry has not been found")]
    EntryNotFound,

    /// Checksum mismatch on a stored record
    #[error("entry is corrupted")]
    Corrupted,

    /// Key size is outside [1, 65534]
    #[error("key size is out of bounds")]
    BadKeySize,

    /// Value size exceeds the storable maximum
    #[error("value size is out of bounds")]
    BadValueSize,

    /// A key index is empty, out of key range, or there are too many of them
    #[error("key indexes are inconsistent")]
    InconsistentKeyIndex,

    /// Key indexes are not strictly ordered by (offset, length)
    #[error("key indexes are not ordered")]
    UnorderedKeyIndex,

    /// A configuration parameter is outside its accepted range
    #[error("bad parameter value")]
    BadParameterValue,

    /// Configuration parameters are individually valid but mutually inconsistent
    #[error("inconsistent parameter values")]
    InconsistentParameterValues,

    /// An I/O error from the underlying filesystem
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An in-memory arena (KeyDir key storage) is exhausted.
    ///
    /// The data files remain correct and consistent; only the in-memory
    /// directory is incomplete. Reopening the store recovers it.
    #[error("operation failed due to out of memory")]
    OutOfMemory,
}

/// Result type for datastore operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::EntryNotFound.to_string(), "entry has not been found");
        assert_eq!(
            Error::StoreAlreadyInUse.to_string(),
            "datastore is already open and locked by another process"
        );
        let io: Error = std::io::Error::other("disk gone").into();
        assert!(io.to_string().contains("disk gone"));
    }
}
