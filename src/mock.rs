use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
	storage::{sqlite::SqliteConnector, Connector},
	types::StorageError,
};

/// Opens a fresh SQLite database in a temporary directory.
///
/// The directory is removed when the returned guard is dropped.
pub fn sqlite_connector() -> (tempfile::TempDir, SqliteConnector) {
	let dir = tempfile::tempdir().expect("Failed to create temp dir");
	let connector = SqliteConnector::new(dir.path().join("board.db"));
	connector.init_schema().expect("Failed to create schema");
	(dir, connector)
}

/// Wraps a connector and refuses every `fail_every`-th connection, the way a saturated database
/// turns clients away.
pub struct FlakyConnector<C> {
	inner: C,
	fail_every: usize,
	attempts: AtomicUsize,
}

impl<C: Connector> FlakyConnector<C> {
	pub fn new(inner: C, fail_every: usize) -> Self {
		assert!(fail_every > 1, "fail_every must leave some connections through");
		Self { inner, fail_every, attempts: AtomicUsize::new(0) }
	}
}

impl<C: Connector> Connector for FlakyConnector<C> {
	type Session = C::Session;

	fn connect(&self) -> Result<Self::Session, StorageError> {
		let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
		if attempt % self.fail_every == 0 {
			return Err(StorageError::Connection(format!("connection {} refused", attempt)))
		}

		self.inner.connect()
	}
}

/// A connector whose sessions can never be opened.
pub struct DownConnector;

impl Connector for DownConnector {
	type Session = <SqliteConnector as Connector>::Session;

	fn connect(&self) -> Result<Self::Session, StorageError> {
		Err(StorageError::Connection("storage is down".to_string()))
	}
}

/// Panics on the `panic_on`-th connection attempt, counting from one.
pub struct PanickingConnector<C> {
	inner: C,
	panic_on: usize,
	attempts: AtomicUsize,
}

impl<C: Connector> PanickingConnector<C> {
	pub fn new(inner: C, panic_on: usize) -> Self {
		Self { inner, panic_on, attempts: AtomicUsize::new(0) }
	}
}

impl<C: Connector> Connector for PanickingConnector<C> {
	type Session = C::Session;

	fn connect(&self) -> Result<Self::Session, StorageError> {
		let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
		if attempt == self.panic_on {
			panic!("connection {} blew up", attempt);
		}

		self.inner.connect()
	}
}
