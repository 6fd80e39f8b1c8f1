use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, error, instrument};

use crate::types::{NewPost, Post, PostId, StorageError};

use super::{Connector, CounterStore, RecordStore, RetryPolicy};

/// How long a connection waits on another connection's write lock before reporting a conflict.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_POSTS_TABLE: &str = "
	CREATE TABLE IF NOT EXISTS posts (
		id          INTEGER PRIMARY KEY AUTOINCREMENT,
		title       TEXT    NOT NULL CHECK (length(title) BETWEEN 1 AND 200),
		content     TEXT    NOT NULL CHECK (length(content) >= 1),
		created_at  TEXT    NOT NULL,
		updated_at  TEXT    NOT NULL,
		view_count  INTEGER NOT NULL DEFAULT 0 CHECK (view_count >= 0)
	);
";

const SELECT_POST: &str =
	"SELECT id, title, content, created_at, updated_at, view_count FROM posts WHERE id = ?1";
const SELECT_VIEW_COUNT: &str = "SELECT view_count FROM posts WHERE id = ?1";
const WRITE_VIEW_COUNT: &str = "UPDATE posts SET view_count = ?2 WHERE id = ?1";
// SQLite would silently turn `i64::MAX + 1` into a REAL, so the largest value is never bumped.
const INCREMENT_VIEW_COUNT: &str = "UPDATE posts SET view_count = view_count + 1 \
	WHERE id = ?1 AND view_count < 9223372036854775807 RETURNING view_count";
const INSERT_POST: &str = "INSERT INTO posts (title, content, created_at, updated_at, view_count) \
	VALUES (?1, ?2, ?3, ?3, 0) RETURNING id";
const UPDATE_POST: &str = "UPDATE posts SET title = ?2, content = ?3, updated_at = ?4 \
	WHERE id = ?1 RETURNING id, title, content, created_at, updated_at, view_count";
const DELETE_POST: &str = "DELETE FROM posts WHERE id = ?1";

/// Opens a new SQLite connection to the same database file for every session.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
	path: PathBuf,
	busy_timeout: Duration,
	retry: RetryPolicy,
}

impl SqliteConnector {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			busy_timeout: DEFAULT_BUSY_TIMEOUT,
			retry: RetryPolicy::default(),
		}
	}

	pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
		self.busy_timeout = busy_timeout;
		self
	}

	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Creates the `posts` table if needed and switches the file to WAL journaling, so readers
	/// never block the writer.
	#[instrument(skip(self), fields(path = %self.path.display()))]
	pub fn init_schema(&self) -> Result<(), StorageError> {
		let conn = self.open()?;

		let journal_mode: String =
			conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
		debug!(journal_mode = %journal_mode, "Journal mode set");

		conn.execute_batch(CREATE_POSTS_TABLE).map_err(|e| {
			error!("Failed to create posts table: {}", e);
			StorageError::from(e)
		})?;

		debug!("Schema ready");

		Ok(())
	}

	fn open(&self) -> Result<Connection, StorageError> {
		let conn = Connection::open_with_flags(
			&self.path,
			OpenFlags::SQLITE_OPEN_READ_WRITE |
				OpenFlags::SQLITE_OPEN_CREATE |
				OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)
		.map_err(|e| {
			error!("Failed to open {}: {}", self.path.display(), e);
			StorageError::Connection(e.to_string())
		})?;

		conn.busy_timeout(self.busy_timeout)?;

		Ok(conn)
	}
}

impl Connector for SqliteConnector {
	type Session = SqliteSession;

	fn connect(&self) -> Result<SqliteSession, StorageError> {
		Ok(SqliteSession { conn: self.open()?, retry: self.retry })
	}
}

/// A single SQLite connection. Closed when dropped.
#[derive(Debug)]
pub struct SqliteSession {
	conn: Connection,
	retry: RetryPolicy,
}

impl CounterStore for SqliteSession {
	fn read(&self, id: PostId) -> Result<u64, StorageError> {
		let view_count: Option<i64> = self
			.conn
			.prepare_cached(SELECT_VIEW_COUNT)?
			.query_row(params![id], |row| row.get(0))
			.optional()?;

		to_view_count(id, view_count)
	}

	#[cfg(any(test, feature = "race-demo"))]
	fn increment_unsafe(&self, id: PostId) -> Result<u64, StorageError> {
		let next = self.read(id)? + 1;
		let next_raw = i64::try_from(next).map_err(|_| overflow(id))?;

		// Separate statement: anything committed since the read above is overwritten.
		let updated = self.conn.prepare_cached(WRITE_VIEW_COUNT)?.execute(params![id, next_raw])?;
		if updated == 0 {
			return Err(StorageError::NotFound(id))
		}

		Ok(next)
	}

	fn increment_atomic(&self, id: PostId) -> Result<u64, StorageError> {
		self.retry.run(|| {
			let view_count: Option<i64> = self
				.conn
				.prepare_cached(INCREMENT_VIEW_COUNT)?
				.query_row(params![id], |row| row.get(0))
				.optional()?;

			match view_count {
				Some(raw) => to_view_count(id, Some(raw)),
				// Either the post is gone or its counter is saturated.
				None => {
					self.read(id)?;
					Err(overflow(id))
				},
			}
		})
	}
}

impl RecordStore for SqliteSession {
	fn create_post(&self, post: NewPost) -> Result<Post, StorageError> {
		post.validate()?;

		let now = Utc::now();
		let id: PostId = self.retry.run(|| {
			Ok(self
				.conn
				.prepare_cached(INSERT_POST)?
				.query_row(params![post.title, post.content, now], |row| row.get(0))?)
		})?;

		debug!(id, "Created post");

		Ok(Post {
			id,
			title: post.title,
			content: post.content,
			created_at: now,
			updated_at: now,
			view_count: 0,
		})
	}

	fn get_post(&self, id: PostId) -> Result<Post, StorageError> {
		self.conn
			.prepare_cached(SELECT_POST)?
			.query_row(params![id], post_from_row)
			.optional()?
			.ok_or(StorageError::NotFound(id))
	}

	fn update_post(&self, id: PostId, post: NewPost) -> Result<Post, StorageError> {
		post.validate()?;

		let now = Utc::now();
		let updated = self.retry.run(|| {
			Ok(self
				.conn
				.prepare_cached(UPDATE_POST)?
				.query_row(params![id, post.title, post.content, now], post_from_row)
				.optional()?)
		})?;

		match updated {
			Some(updated) => {
				debug!(id, "Updated post");
				Ok(updated)
			},
			None => Err(StorageError::NotFound(id)),
		}
	}

	fn delete_post(&self, id: PostId) -> Result<(), StorageError> {
		let deleted =
			self.retry.run(|| Ok(self.conn.prepare_cached(DELETE_POST)?.execute(params![id])?))?;
		if deleted == 0 {
			return Err(StorageError::NotFound(id))
		}

		debug!(id, "Deleted post");

		Ok(())
	}

	fn reset_view_count(&self, id: PostId) -> Result<(), StorageError> {
		let updated = self.retry.run(|| {
			Ok(self.conn.prepare_cached(WRITE_VIEW_COUNT)?.execute(params![id, 0i64])?)
		})?;
		if updated == 0 {
			return Err(StorageError::NotFound(id))
		}

		Ok(())
	}
}

fn to_view_count(id: PostId, raw: Option<i64>) -> Result<u64, StorageError> {
	match raw {
		Some(raw) => u64::try_from(raw).map_err(|_| {
			error!("Negative view count {} stored for post {}", raw, id);
			StorageError::Parsing
		}),
		None => Err(StorageError::NotFound(id)),
	}
}

fn overflow(id: PostId) -> StorageError {
	error!("View count of post {} is saturated", id);
	StorageError::Overflow(format!("view count of post {}", id))
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
	let view_count: i64 = row.get(5)?;

	Ok(Post {
		id: row.get(0)?,
		title: row.get(1)?,
		content: row.get(2)?,
		created_at: row.get(3)?,
		updated_at: row.get(4)?,
		view_count: u64::try_from(view_count)
			.map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, view_count))?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn connector() -> (tempfile::TempDir, SqliteConnector) {
		let dir = tempfile::tempdir().unwrap();
		let connector = SqliteConnector::new(dir.path().join("board.db"));
		connector.init_schema().unwrap();
		(dir, connector)
	}

	#[test]
	fn init_schema_is_idempotent() {
		let (_dir, connector) = connector();
		connector.init_schema().unwrap();
	}

	#[test]
	fn create_then_get() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("hello", "world")).unwrap();
		assert_eq!(post.view_count, 0);

		let fetched = session.get_post(post.id).unwrap();
		assert_eq!(fetched.title, "hello");
		assert_eq!(fetched.content, "world");
		assert_eq!(fetched.view_count, 0);
		assert_eq!(fetched.created_at.timestamp(), post.created_at.timestamp());
	}

	#[test]
	fn create_rejects_blank_title() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let res = session.create_post(NewPost::new("", "content"));
		assert!(matches!(res, Err(StorageError::Validation(_))));
	}

	#[test]
	fn increments_are_visible_to_other_connections() {
		let (_dir, connector) = connector();
		let writer = connector.connect().unwrap();
		let reader = connector.connect().unwrap();

		let post = writer.create_post(NewPost::new("title", "content")).unwrap();
		assert_eq!(writer.increment_atomic(post.id).unwrap(), 1);
		assert_eq!(writer.increment_atomic(post.id).unwrap(), 2);
		assert_eq!(writer.increment_unsafe(post.id).unwrap(), 3);

		assert_eq!(reader.read(post.id).unwrap(), 3);
		assert_eq!(reader.get_post(post.id).unwrap().view_count, 3);
	}

	#[test]
	fn missing_post_is_not_found() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		assert!(matches!(session.read(404), Err(StorageError::NotFound(404))));
		assert!(matches!(session.increment_atomic(404), Err(StorageError::NotFound(404))));
		assert!(matches!(session.increment_unsafe(404), Err(StorageError::NotFound(404))));
		assert!(matches!(session.get_post(404), Err(StorageError::NotFound(404))));
		assert!(matches!(session.delete_post(404), Err(StorageError::NotFound(404))));
		assert!(matches!(session.reset_view_count(404), Err(StorageError::NotFound(404))));
	}

	#[test]
	fn deleted_ids_are_not_reused() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let first = session.create_post(NewPost::new("first", "content")).unwrap();
		session.delete_post(first.id).unwrap();
		let second = session.create_post(NewPost::new("second", "content")).unwrap();

		assert_ne!(first.id, second.id);
		assert!(matches!(session.increment_atomic(first.id), Err(StorageError::NotFound(_))));
		assert_eq!(session.read(second.id).unwrap(), 0);
	}

	#[test]
	fn reset_puts_counter_back_to_zero() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("title", "content")).unwrap();
		session.increment_atomic(post.id).unwrap();
		session.reset_view_count(post.id).unwrap();

		assert_eq!(session.read(post.id).unwrap(), 0);
	}

	#[test]
	fn update_replaces_content_and_keeps_counter() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("title", "content")).unwrap();
		session.increment_atomic(post.id).unwrap();

		let updated =
			session.update_post(post.id, NewPost::new("new title", "new content")).unwrap();
		assert_eq!(updated.title, "new title");
		assert_eq!(updated.content, "new content");
		assert_eq!(updated.view_count, 1);
		assert!(updated.updated_at >= post.updated_at);
		assert_eq!(updated.created_at.timestamp(), post.created_at.timestamp());

		assert!(matches!(
			session.update_post(post.id, NewPost::new(" ", "content")),
			Err(StorageError::Validation(_))
		));
		assert!(matches!(
			session.update_post(404, NewPost::new("title", "content")),
			Err(StorageError::NotFound(404))
		));
	}

	#[test]
	fn update_keeps_concurrent_increments() {
		let (_dir, connector) = connector();
		let post = connector.connect().unwrap().create_post(NewPost::new("before", "x")).unwrap();

		std::thread::scope(|s| {
			for _ in 0..4 {
				let connector = &connector;
				s.spawn(move || {
					for _ in 0..25 {
						connector.connect().unwrap().increment_atomic(post.id).unwrap();
					}
				});
			}
			let connector = &connector;
			s.spawn(move || {
				let session = connector.connect().unwrap();
				for edit in 0..20 {
					let title = format!("edit {}", edit);
					session.update_post(post.id, NewPost::new(title, "edited")).unwrap();
				}
			});
		});

		let stored = connector.connect().unwrap().get_post(post.id).unwrap();
		assert_eq!(stored.view_count, 100);
		assert_eq!(stored.title, "edit 19");
	}

	#[test]
	fn saturated_counter_is_left_untouched() {
		let (_dir, connector) = connector();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("title", "content")).unwrap();
		session.conn.execute(WRITE_VIEW_COUNT, params![post.id, i64::MAX]).unwrap();

		assert!(matches!(session.increment_atomic(post.id), Err(StorageError::Overflow(_))));
		assert!(matches!(session.increment_unsafe(post.id), Err(StorageError::Overflow(_))));
		assert_eq!(session.read(post.id).unwrap(), i64::MAX as u64);

		let stored_type: String = session
			.conn
			.query_row(
				"SELECT typeof(view_count) FROM posts WHERE id = ?1",
				params![post.id],
				|row| row.get(0),
			)
			.unwrap();
		assert_eq!(stored_type, "integer");
	}

	#[test]
	fn unopenable_path_is_a_connection_error() {
		let dir = tempfile::tempdir().unwrap();
		let connector = SqliteConnector::new(dir.path().join("missing").join("board.db"));

		assert!(matches!(connector.connect(), Err(StorageError::Connection(_))));
	}
}
