use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a post, and therefore of its view counter.
pub type PostId = i64;

/// Maximum number of characters allowed in a post title.
pub const MAX_TITLE_CHARS: usize = 200;

/// A discussion board post together with its view counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
	pub id: PostId,
	pub title: String,
	pub content: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	/// Number of times the post has been viewed. Starts at `0`.
	pub view_count: u64,
}

/// The fields required to create a new [`Post`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
	pub title: String,
	pub content: String,
}

impl NewPost {
	pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
		Self { title: title.into(), content: content.into() }
	}

	/// Checks the column constraints of the `posts` table.
	pub fn validate(&self) -> Result<(), StorageError> {
		let title_chars = self.title.chars().count();
		if self.title.trim().is_empty() {
			return Err(StorageError::Validation("title must not be blank".to_string()))
		}
		if title_chars > MAX_TITLE_CHARS {
			return Err(StorageError::Validation(format!(
				"title is {} characters long, at most {} allowed",
				title_chars, MAX_TITLE_CHARS
			)))
		}
		if self.content.trim().is_empty() {
			return Err(StorageError::Validation("content must not be blank".to_string()))
		}

		Ok(())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
	/// No post exists for the key.
	NotFound(PostId),
	/// The storage engine rejected the operation because of a concurrent writer.
	Conflict(String),
	/// Storage could not be opened or reached.
	Connection(String),
	/// The record violates a column constraint.
	Validation(String),
	Sqlite(#[source] rusqlite::Error),
	#[cfg(feature = "rocksdb")]
	RocksDb(#[source] rocksdb::Error),
	/// Stored bytes could not be decoded.
	Parsing,
	/// A counter or id reached the largest value storage can hold. Nothing was written.
	Overflow(String),
}

impl StorageError {
	/// Only conflicts are worth retrying; the increment is a pure `+1`.
	pub fn is_retryable(&self) -> bool {
		matches!(self, StorageError::Conflict(_))
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, StorageError::NotFound(_))
	}

	/// HTTP status an API layer would answer with for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			StorageError::NotFound(_) => 404,
			StorageError::Conflict(_) => 409,
			StorageError::Validation(_) => 422,
			StorageError::Connection(_) => 503,
			_ => 500,
		}
	}
}

impl Display for StorageError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			StorageError::NotFound(id) => write!(f, "Post {} not found", id),
			StorageError::Conflict(msg) => write!(f, "Storage conflict: {}", msg),
			StorageError::Connection(msg) => write!(f, "Connection error: {}", msg),
			StorageError::Validation(msg) => write!(f, "Validation error: {}", msg),
			StorageError::Sqlite(e) => write!(f, "SQLite error: {}", e),
			#[cfg(feature = "rocksdb")]
			StorageError::RocksDb(e) => write!(f, "RocksDB error: {}", e),
			StorageError::Parsing => write!(f, "Parsing error"),
			StorageError::Overflow(what) => write!(f, "Overflow: {}", what),
		}
	}
}

impl From<rusqlite::Error> for StorageError {
	fn from(e: rusqlite::Error) -> Self {
		use rusqlite::ErrorCode;

		match e.sqlite_error_code() {
			Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
				StorageError::Conflict(e.to_string()),
			Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied) =>
				StorageError::Connection(e.to_string()),
			_ => StorageError::Sqlite(e),
		}
	}
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for StorageError {
	fn from(e: rocksdb::Error) -> Self {
		use rocksdb::ErrorKind;

		match e.kind() {
			ErrorKind::Busy | ErrorKind::TryAgain => StorageError::Conflict(e.to_string()),
			ErrorKind::IOError => StorageError::Connection(e.to_string()),
			_ => StorageError::RocksDb(e),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
	/// The run was asked for with parameters it cannot honour.
	InvalidParameters(String),
	Storage(#[from] StorageError),
	/// A worker thread panicked before reporting its calls.
	WorkerPanicked(String),
	/// The OS refused to start a worker thread.
	WorkerSpawn(#[source] std::io::Error),
}

impl Display for HarnessError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::InvalidParameters(msg) => write!(f, "Invalid harness parameters: {}", msg),
			Self::Storage(e) => write!(f, "{}", e),
			Self::WorkerPanicked(msg) => write!(f, "Harness worker panicked: {}", msg),
			Self::WorkerSpawn(e) => write!(f, "Failed to start harness worker: {}", e),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	Io(#[from] std::io::Error),
	Parse(String),
	/// One message per rejected setting.
	Invalid(Vec<String>),
}

impl Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Io(e) => write!(f, "Failed to read configuration: {}", e),
			Self::Parse(msg) => write!(f, "Failed to parse configuration: {}", msg),
			Self::Invalid(issues) => write!(f, "Invalid configuration: {}", issues.join("; ")),
		}
	}
}
