//! View counters for discussion board posts that stay correct under concurrent increments.
//!
//! A post's view count lives in a row of durable storage. Bumping it is the classic lost update
//! trap: read the value, add one, write it back, and two concurrent requests both write the
//! same number. The [`CounterStore`] trait therefore exposes two distinctly named operations:
//!
//! - [`CounterStore::increment_atomic`] evaluates `view_count + 1` inside a single storage
//!   operation, so K successful concurrent calls always add exactly K.
//! - [`CounterStore::increment_unsafe`] does the read, add, write dance in process. It is only
//!   compiled for tests or with the `race-demo` feature, to demonstrate the failure mode.
//!
//! The [`RecordStore`] trait owns the posts whose existence gates the counters, and a
//! [`Connector`] hands out independent sessions, one per storage connection. The default backend
//! is SQLite ([`SqliteConnector`]); the `rocksdb` feature adds a RocksDB backend built on
//! optimistic transactions.
//!
//! [`ConcurrencyHarness`] verifies the guarantees empirically: it fires a number of increments at
//! one counter from a fixed-size worker pool, each call on its own connection, and compares the
//! final value against the number of calls.
//!
//! # Example
//!
//! ```no_run
//! use board_counter::{ConcurrencyHarness, MutationPath, NewPost, SqliteConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = SqliteConnector::new("board.db");
//!     connector.init_schema()?;
//!
//!     let harness = ConcurrencyHarness::new(connector);
//!     let report = harness
//!         .run_on_new_post(NewPost::new("hot post", "content"), 10, 500, MutationPath::Atomic)
//!         .await?;
//!
//!     assert_eq!(report.actual, 500);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod harness;
pub mod storage;
pub mod types;

#[cfg(test)]
mod mock;

pub use config::{Backend, Config};
pub use harness::{CallFailure, ConcurrencyHarness, HarnessReport, MutationPath};
#[cfg(feature = "rocksdb")]
pub use storage::rocksdb::RocksDbConnector;
pub use storage::{
	sqlite::{SqliteConnector, SqliteSession},
	Connector, CounterStore, RecordStore, RetryPolicy,
};
pub use types::{ConfigError, HarnessError, NewPost, Post, PostId, StorageError};
