use std::{path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rocksdb::{MultiThreaded, OptimisticTransactionDB};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::types::{NewPost, Post, PostId, StorageError};

use super::{Connector, CounterStore, RecordStore, RetryPolicy};

/// Prefix shared by every key this backend writes.
const POST_KEY_PREFIX: &str = "post";
/// The key suffix holding the last id handed out.
const NEXT_ID_KEY: &str = "NEXT_ID";
/// The key suffix holding the view count of a post.
const VIEW_COUNT_KEY: &str = "VIEW_COUNT";

type Db = OptimisticTransactionDB<MultiThreaded>;

/// What is stored under `post:{id}`. The view count lives under its own key so increments never
/// rewrite the record.
#[derive(Debug, Serialize, Deserialize)]
struct PostRecord {
	title: String,
	content: String,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

fn record_key(id: PostId) -> String {
	format!("{}:{}", POST_KEY_PREFIX, id)
}

fn view_count_key(id: PostId) -> String {
	format!("{}:{}:{}", POST_KEY_PREFIX, id, VIEW_COUNT_KEY)
}

fn next_id_key() -> String {
	format!("{}:{}", POST_KEY_PREFIX, NEXT_ID_KEY)
}

fn bump(id: PostId, count: u64) -> Result<u64, StorageError> {
	count.checked_add(1).ok_or_else(|| {
		error!("View count of post {} is saturated", id);
		StorageError::Overflow(format!("view count of post {}", id))
	})
}

fn parse_count(raw: &[u8]) -> Result<u64, StorageError> {
	std::str::from_utf8(raw)
		.map_err(|_| StorageError::Parsing)?
		.parse::<u64>()
		.map_err(|_| StorageError::Parsing)
}

/// RocksDB cannot be opened twice by one process, so sessions share the handle and get their
/// isolation from running every operation in its own optimistic transaction.
#[derive(Clone)]
pub struct RocksDbConnector {
	db: Arc<Db>,
	retry: RetryPolicy,
}

impl RocksDbConnector {
	/// Optimistic transactions abort rather than wait, so contention needs far more retries
	/// than a lock-waiting engine.
	pub const DEFAULT_RETRY: RetryPolicy =
		RetryPolicy { max_retries: 1_000, backoff: Duration::from_micros(100) };

	pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
		let db = Db::open_default(path.as_ref()).map_err(|e| {
			error!("Failed to open RocksDB at {}: {}", path.as_ref().display(), e);
			StorageError::Connection(e.to_string())
		})?;

		Ok(Self { db: Arc::new(db), retry: Self::DEFAULT_RETRY })
	}

	pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}
}

impl Connector for RocksDbConnector {
	type Session = RocksDbSession;

	fn connect(&self) -> Result<RocksDbSession, StorageError> {
		Ok(RocksDbSession { db: self.db.clone(), retry: self.retry })
	}
}

pub struct RocksDbSession {
	db: Arc<Db>,
	retry: RetryPolicy,
}

impl CounterStore for RocksDbSession {
	fn read(&self, id: PostId) -> Result<u64, StorageError> {
		match self.db.get(view_count_key(id).as_bytes())? {
			Some(value) => parse_count(&value),
			None => Err(StorageError::NotFound(id)),
		}
	}

	#[cfg(any(test, feature = "race-demo"))]
	fn increment_unsafe(&self, id: PostId) -> Result<u64, StorageError> {
		let key = view_count_key(id);
		let txn = self.db.transaction();

		// Only the record is tracked: a concurrent delete aborts this write, a concurrent
		// increment does not.
		if txn.get_for_update(record_key(id).as_bytes(), true)?.is_none() {
			return Err(StorageError::NotFound(id))
		}
		let next = match txn.get(key.as_bytes())? {
			Some(value) => bump(id, parse_count(&value)?)?,
			None => return Err(StorageError::NotFound(id)),
		};

		txn.put(key.as_bytes(), next.to_string())?;
		txn.commit()?;

		Ok(next)
	}

	fn increment_atomic(&self, id: PostId) -> Result<u64, StorageError> {
		let key = view_count_key(id);

		self.retry.run(|| {
			let txn = self.db.transaction();

			// Tracked read: the commit fails if anyone wrote the key after this point.
			let current = match txn.get_for_update(key.as_bytes(), true)? {
				Some(value) => parse_count(&value)?,
				None => return Err(StorageError::NotFound(id)),
			};
			let next = bump(id, current)?;

			txn.put(key.as_bytes(), next.to_string())?;
			txn.commit()?;

			Ok(next)
		})
	}
}

impl RecordStore for RocksDbSession {
	fn create_post(&self, post: NewPost) -> Result<Post, StorageError> {
		post.validate()?;

		let now = Utc::now();
		let record = PostRecord {
			title: post.title,
			content: post.content,
			created_at: now,
			updated_at: now,
		};
		let record_bytes = serde_json::to_vec(&record).map_err(|e| {
			error!("Failed to serialize post record: {}", e);
			StorageError::Parsing
		})?;

		let id = self.retry.run(|| {
			let txn = self.db.transaction();

			let next_id_key = next_id_key();
			let last_id = match txn.get_for_update(next_id_key.as_bytes(), true)? {
				Some(value) => parse_count(&value)?,
				None => 0,
			};
			let id = last_id
				.checked_add(1)
				.and_then(|next| PostId::try_from(next).ok())
				.ok_or_else(|| StorageError::Overflow("post ids are exhausted".to_string()))?;

			txn.put(next_id_key.as_bytes(), id.to_string())?;
			txn.put(record_key(id).as_bytes(), &record_bytes)?;
			txn.put(view_count_key(id).as_bytes(), 0u64.to_string())?;
			txn.commit()?;

			Ok(id)
		})?;

		debug!(id, "Created post");

		Ok(Post {
			id,
			title: record.title,
			content: record.content,
			created_at: record.created_at,
			updated_at: record.updated_at,
			view_count: 0,
		})
	}

	fn get_post(&self, id: PostId) -> Result<Post, StorageError> {
		let record: PostRecord = match self.db.get(record_key(id).as_bytes())? {
			Some(value) => serde_json::from_slice(&value).map_err(|e| {
				error!("Failed to deserialize post {}: {}", id, e);
				StorageError::Parsing
			})?,
			None => return Err(StorageError::NotFound(id)),
		};

		Ok(Post {
			id,
			title: record.title,
			content: record.content,
			created_at: record.created_at,
			updated_at: record.updated_at,
			view_count: self.read(id)?,
		})
	}

	fn update_post(&self, id: PostId, post: NewPost) -> Result<Post, StorageError> {
		post.validate()?;

		let record_key = record_key(id);
		let now = Utc::now();

		// The counter key is neither read for update nor written, so atomic increments running
		// alongside never conflict with an edit.
		let record = self.retry.run(|| {
			let txn = self.db.transaction();

			let mut record: PostRecord = match txn.get_for_update(record_key.as_bytes(), true)? {
				Some(value) => serde_json::from_slice(&value).map_err(|e| {
					error!("Failed to deserialize post {}: {}", id, e);
					StorageError::Parsing
				})?,
				None => return Err(StorageError::NotFound(id)),
			};
			record.title = post.title.clone();
			record.content = post.content.clone();
			record.updated_at = now;

			let record_bytes = serde_json::to_vec(&record).map_err(|e| {
				error!("Failed to serialize post record: {}", e);
				StorageError::Parsing
			})?;
			txn.put(record_key.as_bytes(), record_bytes)?;
			txn.commit()?;

			Ok(record)
		})?;

		debug!(id, "Updated post");

		Ok(Post {
			id,
			title: record.title,
			content: record.content,
			created_at: record.created_at,
			updated_at: record.updated_at,
			view_count: self.read(id)?,
		})
	}

	fn delete_post(&self, id: PostId) -> Result<(), StorageError> {
		let record_key = record_key(id);
		let view_count_key = view_count_key(id);

		self.retry.run(|| {
			let txn = self.db.transaction();

			if txn.get_for_update(record_key.as_bytes(), true)?.is_none() {
				return Err(StorageError::NotFound(id))
			}
			// Tracking the counter makes in-flight atomic increments conflict instead of
			// resurrecting it.
			txn.get_for_update(view_count_key.as_bytes(), true)?;

			txn.delete(record_key.as_bytes())?;
			txn.delete(view_count_key.as_bytes())?;
			txn.commit()?;

			Ok(())
		})?;

		debug!(id, "Deleted post");

		Ok(())
	}

	fn reset_view_count(&self, id: PostId) -> Result<(), StorageError> {
		let key = view_count_key(id);

		self.retry.run(|| {
			let txn = self.db.transaction();

			if txn.get_for_update(key.as_bytes(), true)?.is_none() {
				return Err(StorageError::NotFound(id))
			}

			txn.put(key.as_bytes(), 0u64.to_string())?;
			txn.commit()?;

			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_get_delete() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let session = connector.connect().unwrap();

		let first = session.create_post(NewPost::new("first", "content")).unwrap();
		let second = session.create_post(NewPost::new("second", "content")).unwrap();
		assert_eq!(second.id, first.id + 1);

		assert_eq!(session.get_post(first.id).unwrap().title, "first");

		session.delete_post(first.id).unwrap();
		assert!(matches!(session.get_post(first.id), Err(StorageError::NotFound(_))));
		assert!(matches!(session.increment_atomic(first.id), Err(StorageError::NotFound(_))));
		assert!(matches!(session.increment_unsafe(first.id), Err(StorageError::NotFound(_))));
		assert!(matches!(session.read(first.id), Err(StorageError::NotFound(_))));
	}

	#[test]
	fn concurrent_atomic_increments_are_not_lost() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let id = connector.connect().unwrap().create_post(NewPost::new("hot", "post")).unwrap().id;

		std::thread::scope(|s| {
			for _ in 0..10 {
				let connector = &connector;
				s.spawn(move || {
					let session = connector.connect().unwrap();
					for _ in 0..50 {
						session.increment_atomic(id).unwrap();
					}
				});
			}
		});

		assert_eq!(connector.connect().unwrap().read(id).unwrap(), 500);
	}

	#[test]
	fn update_keeps_concurrent_increments() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let post = connector.connect().unwrap().create_post(NewPost::new("before", "x")).unwrap();

		std::thread::scope(|s| {
			for _ in 0..4 {
				let connector = &connector;
				s.spawn(move || {
					let session = connector.connect().unwrap();
					for _ in 0..25 {
						session.increment_atomic(post.id).unwrap();
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
		assert_eq!(stored.content, "edited");
		assert_eq!(stored.created_at, post.created_at);
		assert!(stored.updated_at >= post.updated_at);
	}

	#[test]
	fn update_missing_post_is_not_found() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let session = connector.connect().unwrap();

		let res = session.update_post(77, NewPost::new("title", "content"));
		assert!(matches!(res, Err(StorageError::NotFound(77))));
	}

	#[test]
	fn saturated_counter_is_left_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("title", "content")).unwrap();
		session.db.put(view_count_key(post.id).as_bytes(), u64::MAX.to_string()).unwrap();

		assert!(matches!(session.increment_atomic(post.id), Err(StorageError::Overflow(_))));
		assert!(matches!(session.increment_unsafe(post.id), Err(StorageError::Overflow(_))));
		assert_eq!(session.read(post.id).unwrap(), u64::MAX);
	}

	#[test]
	fn exhausted_ids_fail_creation() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let session = connector.connect().unwrap();

		session.db.put(next_id_key().as_bytes(), i64::MAX.to_string()).unwrap();

		let res = session.create_post(NewPost::new("title", "content"));
		assert!(matches!(res, Err(StorageError::Overflow(_))));
	}

	#[test]
	fn reset_view_count() {
		let dir = tempfile::tempdir().unwrap();
		let connector = RocksDbConnector::open(dir.path()).unwrap();
		let session = connector.connect().unwrap();

		let post = session.create_post(NewPost::new("title", "content")).unwrap();
		assert_eq!(session.increment_atomic(post.id).unwrap(), 1);
		session.reset_view_count(post.id).unwrap();
		assert_eq!(session.read(post.id).unwrap(), 0);
	}
}
