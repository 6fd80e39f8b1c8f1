//! Shared helpers for the integration tests.

use board_counter::SqliteConnector;

/// A schema-initialised SQLite database in a temporary directory, removed when the guard drops.
pub fn sqlite_connector() -> (tempfile::TempDir, SqliteConnector) {
	let dir = tempfile::tempdir().unwrap();
	let connector = SqliteConnector::new(dir.path().join("board.db"));
	connector.init_schema().unwrap();
	(dir, connector)
}
