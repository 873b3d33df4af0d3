//! Embedded, persistent, log-structured key-value storage engine in the
//! Bitcask family.
//!
//! Every key lives in an in-memory directory pointing at its latest record
//! inside append-only data files; values are served from a bounded
//! scan-resistant cache, a write buffer, or a single positioned read.
//! Background threads compact fragmented files (merge) and maintain the
//! in-memory structures (upkeep).
//!
//! # Overview
//!
//! - Opaque byte keys (up to 64 KiB) and values, point lookups.
//! - Secondary "tag" queries: sub-slices of the key declared at put time
//!   can be intersected with a logical AND.
//! - Optional per-entry TTL; expired entries read as absent and are reaped
//!   in the background.
//! - Crash recovery by replaying data files, accelerated by hint files.
//! - Background space reclamation driven by per-file dead-byte accounting.
//!
//! # Example
//!
//! ```rust,no_run
//! use litecask::Datastore;
//!
//! # fn main() -> litecask::Result<()> {
//! let store = Datastore::new();
//! store.open("/tmp/my_db", true)?;
//!
//! store.put("my key identifier", [1u8, 2, 3, 4, 5, 6, 7, 8])?;
//! let value = store.get("my key identifier")?;
//! assert_eq!(value, [1, 2, 3, 4, 5, 6, 7, 8]);
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Tag queries
//!
//! ```rust,no_run
//! use litecask::{Datastore, KeyIndex};
//!
//! # fn main() -> litecask::Result<()> {
//! let store = Datastore::new();
//! store.open("/tmp/my_db", true)?;
//!
//! // Declare three searchable slices of the key: user, country, doc type
//! let key = "UJohn Doe/CUS/TTax document/0001";
//! let indexes = [KeyIndex::new(0, 9), KeyIndex::new(10, 3), KeyIndex::new(14, 13)];
//! store.put_entry(key, b"document body", &indexes, 0, false)?;
//!
//! let matches = store.query(&["UJohn Doe", "CUS"])?;
//! assert_eq!(matches.len(), 1);
//! # Ok(())
//! # }
//! ```

mod cache;
mod clock;
mod config;
mod datafile;
mod error;
mod flock;
mod hash;
mod index;
mod keydir;
mod logger;
mod store;
mod tlsf;
mod types;

pub use clock::Clock;
pub use config::Config;
pub use error::{Error, Result};
pub use logger::LogLevel;
pub use store::Datastore;
pub use types::{DataFileStats, DatastoreCounters, KeyIndex, ValueCacheCounters};

/// Version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
